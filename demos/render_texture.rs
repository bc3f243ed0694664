use briny_field::prelude::*;
use rand::rngs::StdRng;
use rand::{Rng, SeedableRng};

fn main() -> Result<()> {
    let mut field = NerfField::from_json(&serde_json::json!({
        "n_pos_dims": 3,
        "n_dir_dims": 3,
        "dir_offset": 3,
        "pos_encoding": { "otype": "Frequency", "n_frequencies": 4 },
        "dir_encoding": { "otype": "Identity" },
        "density_network": { "otype": "CutlassMLP", "n_neurons": 16 },
        "uv_network": { "otype": "CutlassMLP", "n_neurons": 16 },
        "rgb_network": { "otype": "CutlassMLP", "n_neurons": 16, "output_activation": "Sigmoid" },
        "uv_network_scale": 0.5
    }))?;
    let mut rng = StdRng::seed_from_u64(0);
    field.initialize(&mut rng, 1.0);

    let stream = Stream::new().labeled("demo");
    let batch = 128;
    let lr = 0.05;

    // fit a color that depends on height only
    for step in 0..200 {
        let input = Matrix::from_fn(field.input_width(), batch, MatrixLayout::ColumnMajor, |_, _| {
            rng.random_range(-1.0..1.0)
        });
        let mut output = stream.matrix(field.padded_output_width(), batch, MatrixLayout::ColumnMajor);
        let ctx = field.forward(&stream, input.view(), Some(&mut output.view_mut()), false, false)?;

        let mut loss = 0.0;
        let dl_doutput = Matrix::from_fn(output.rows(), batch, MatrixLayout::ColumnMajor, |r, c| {
            if r >= 3 {
                return 0.0;
            }
            let target = 0.5 + 0.5 * input.get(1, c);
            let diff = output.get(r, c) - target;
            loss += diff * diff;
            2.0 * diff / batch as f32
        });
        field.backward(
            &stream,
            &ctx,
            input.view(),
            output.view(),
            dl_doutput.view(),
            None,
            false,
            GradientMode::Overwrite,
        )?;
        stream.synchronize();

        let block = field.parameters_mut();
        for (p, g) in block.params.iter_mut().zip(&block.gradients) {
            *p -= lr * g;
        }
        field.sync_inference_params();
        if step % 50 == 0 {
            println!("step {step:>3}: loss {:.5}", loss / batch as f32);
        }
    }

    let size = 16;
    let mut texture = stream.matrix(field.padded_output_width(), size * size, MatrixLayout::ColumnMajor);
    field.uv_to_texture(&stream, size, &[0.0, 0.0, 1.0], &mut texture.view_mut())?;
    stream.synchronize();

    let shades = [' ', '.', ':', '-', '=', '+', '*', '#', '%', '@'];
    for y in 0..size {
        let row: String = (0..size)
            .map(|x| {
                let luminance = (0..3).map(|r| texture.get(r, y * size + x)).sum::<f32>() / 3.0;
                shades[((luminance * 9.0).round() as usize).min(9)]
            })
            .collect();
        println!("{row}");
    }
    println!("{} submissions on stream `{}`", stream.submitted(), stream.label());
    Ok(())
}
