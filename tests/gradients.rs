mod common;

use briny_field::layout::DENSITY_CHANNEL;
use briny_field::prelude::*;
use common::*;

/// Runs forward and backward with `dl_doutput` built by `grad(row, col)`,
/// returning the input gradient.
fn input_gradient(
    field: &mut NerfField,
    input: &Matrix<f32>,
    mode: GradientMode,
    grad: impl FnMut(usize, usize) -> f32,
) -> Matrix<f32> {
    let stream = Stream::new();
    let batch = input.cols();
    let mut out = stream.matrix(field.padded_output_width(), batch, MatrixLayout::ColumnMajor);
    let ctx = field
        .forward(&stream, input.view(), Some(&mut out.view_mut()), false, true)
        .unwrap();
    let dl_doutput = Matrix::from_fn(out.rows(), batch, MatrixLayout::ColumnMajor, grad);
    let mut dl_dinput = stream.matrix(field.input_width(), batch, MatrixLayout::ColumnMajor);
    field
        .backward(
            &stream,
            &ctx,
            input.view(),
            out.view(),
            dl_doutput.view(),
            Some(&mut dl_dinput.view_mut()),
            false,
            mode,
        )
        .unwrap();
    stream.synchronize();
    dl_dinput
}

#[test]
fn density_gradient_alone_reaches_position_through_density_head() {
    let mut field = field(linear_config(1.0), 42);
    let input = random_input(field.input_width(), 7, MatrixLayout::ColumnMajor, 1);
    let dl_dinput = input_gradient(&mut field, &input, GradientMode::Overwrite, |r, _| {
        if r == DENSITY_CHANNEL { 1.0 } else { 0.0 }
    });

    // single linear density layer: d(sigma)/d(x_i) is weight i of its only row
    let weights = field.module_params(ModuleId::DensityNetwork).to_vec();
    for c in 0..7 {
        for i in 0..3 {
            assert_close(dl_dinput.get(i, c), weights[i], 1e-6, "position gradient");
        }
        // nothing flows to the direction
        assert_eq!(dl_dinput.get(3, c), 0.0);
        assert_eq!(dl_dinput.get(4, c), 0.0);
    }
    assert!(field.module_gradients(ModuleId::UvNetwork).iter().all(|&g| g == 0.0));
    assert!(field.module_gradients(ModuleId::RgbNetwork).iter().all(|&g| g == 0.0));
}

#[test]
fn color_gradient_through_uv_scales_exactly() {
    let input = random_input(5, 7, MatrixLayout::ColumnMajor, 2);
    let color_only = |r: usize, c: usize| if r < 3 { 0.25 + (r + c) as f32 * 0.125 } else { 0.0 };

    let mut unscaled = field(linear_config(1.0), 9);
    let mut scaled = field(linear_config(0.25), 9);
    assert_eq!(unscaled.parameters(), scaled.parameters());

    let base = input_gradient(&mut unscaled, &input, GradientMode::Overwrite, color_only);
    let quarter = input_gradient(&mut scaled, &input, GradientMode::Overwrite, color_only);
    for c in 0..7 {
        for i in 0..3 {
            let expected = 0.25 * base.get(i, c);
            assert_close(quarter.get(i, c), expected, 1e-6 * expected.abs().max(1.0), "uv scale");
        }
        // the direction band is never scaled
        for i in 3..5 {
            assert_eq!(quarter.get(i, c), base.get(i, c));
        }
    }
    assert!((0..7).any(|c| base.get(0, c) != 0.0));

    let uv_base = unscaled.module_gradients(ModuleId::UvNetwork).to_vec();
    let uv_quarter = scaled.module_gradients(ModuleId::UvNetwork).to_vec();
    for (b, q) in uv_base.iter().zip(&uv_quarter) {
        assert_close(*q, 0.25 * b, 1e-6, "uv parameter gradient");
    }
    assert_eq!(
        unscaled.module_gradients(ModuleId::RgbNetwork),
        scaled.module_gradients(ModuleId::RgbNetwork)
    );
    assert!(scaled.module_gradients(ModuleId::DensityNetwork).iter().all(|&g| g == 0.0));
}

#[test]
fn zero_uv_scale_cuts_the_uv_path() {
    let mut field = field(linear_config(0.0), 3);
    let input = random_input(5, 4, MatrixLayout::ColumnMajor, 3);
    let dl_dinput = input_gradient(&mut field, &input, GradientMode::Overwrite, |r, _| {
        if r < 3 { 1.0 } else { 0.0 }
    });
    for c in 0..4 {
        for i in 0..3 {
            assert_eq!(dl_dinput.get(i, c), 0.0);
        }
    }
    assert!(field.module_gradients(ModuleId::UvNetwork).iter().all(|&g| g == 0.0));
}

#[test]
fn joint_routing_sums_both_heads() {
    let input = random_input(5, 6, MatrixLayout::ColumnMajor, 4);
    let density = |r: usize, _: usize| if r == DENSITY_CHANNEL { 0.5_f32 } else { 0.0 };
    let color = |r: usize, _: usize| if r < 3 { -0.75_f32 } else { 0.0 };
    let both = |r: usize, c: usize| density(r, c) + color(r, c);

    let a = input_gradient(&mut field(linear_config(0.5), 6), &input, GradientMode::Overwrite, density);
    let b = input_gradient(&mut field(linear_config(0.5), 6), &input, GradientMode::Overwrite, color);
    let ab = input_gradient(&mut field(linear_config(0.5), 6), &input, GradientMode::Overwrite, both);
    for c in 0..6 {
        for i in 0..5 {
            assert_close(ab.get(i, c), a.get(i, c) + b.get(i, c), 1e-5, "joint routing");
        }
    }
}

#[test]
fn parameter_gradients_match_finite_differences() {
    let mut field = field(cutlass_config(), 13);
    let stream = Stream::new();
    let input = random_input(field.input_width(), 5, MatrixLayout::ColumnMajor, 5);
    let rows = field.padded_output_width();
    let loss = |field: &NerfField| {
        let mut out = Matrix::zeros(rows, 5, MatrixLayout::ColumnMajor);
        field.inference(&stream, input.view(), &mut out.view_mut(), false).unwrap();
        (0..5)
            .map(|c| out.get(0, c) + 2.0 * out.get(2, c) - out.get(DENSITY_CHANNEL, c))
            .sum::<f32>()
    };

    let mut out = stream.matrix(rows, 5, MatrixLayout::ColumnMajor);
    let ctx = field
        .forward(&stream, input.view(), Some(&mut out.view_mut()), false, false)
        .unwrap();
    let dl_doutput = Matrix::from_fn(rows, 5, MatrixLayout::ColumnMajor, |r, _| match r {
        0 => 1.0,
        2 => 2.0,
        DENSITY_CHANNEL => -1.0,
        _ => 0.0,
    });
    field
        .backward(&stream, &ctx, input.view(), out.view(), dl_doutput.view(), None, false, GradientMode::Overwrite)
        .unwrap();
    stream.synchronize();
    let analytic = field.parameters().gradients.clone();

    let h = 1e-2;
    for id in [ModuleId::DensityNetwork, ModuleId::UvNetwork, ModuleId::RgbNetwork] {
        let range = field.parameter_layout().range(id);
        for i in range.clone().step_by(7) {
            let original = field.parameters().params[i];
            field.parameters_mut().params[i] = original + h;
            let plus = loss(&field);
            field.parameters_mut().params[i] = original - h;
            let minus = loss(&field);
            field.parameters_mut().params[i] = original;
            let numeric = (plus - minus) / (2.0 * h);
            assert_close(numeric, analytic[i], 2e-2, id.name());
        }
    }
}

#[test]
fn gradient_modes_apply_to_every_module() {
    let mut field = trainable_field(8);
    let input = random_input(5, 3, MatrixLayout::ColumnMajor, 8);
    let grad = |r: usize, _: usize| if r < 4 { 1.0_f32 } else { 0.0 };

    input_gradient(&mut field, &input, GradientMode::Overwrite, grad);
    let once = field.parameters().gradients.clone();
    assert!(field.module_gradients(ModuleId::PosEncoding).iter().any(|&g| g != 0.0));

    input_gradient(&mut field, &input, GradientMode::Overwrite, grad);
    assert_eq!(field.parameters().gradients, once);

    input_gradient(&mut field, &input, GradientMode::Accumulate, grad);
    for (g, o) in field.parameters().gradients.iter().zip(&once) {
        assert_close(*g, 2.0 * o, 1e-5, "accumulate");
    }

    let before = field.parameters().gradients.clone();
    let dl_dinput = input_gradient(&mut field, &input, GradientMode::Ignore, grad);
    assert_eq!(field.parameters().gradients, before);
    assert!((0..3).any(|c| dl_dinput.get(0, c) != 0.0));
}

#[test]
fn trainable_position_encoding_trains_without_input_gradient() {
    let mut field = trainable_field(1);
    let stream = Stream::new();
    let input = random_input(5, 4, MatrixLayout::ColumnMajor, 1);
    let mut out = stream.matrix(field.padded_output_width(), 4, MatrixLayout::ColumnMajor);
    let ctx = field
        .forward(&stream, input.view(), Some(&mut out.view_mut()), false, false)
        .unwrap();
    let dl_doutput = Matrix::from_fn(out.rows(), 4, MatrixLayout::ColumnMajor, |r, _| {
        if r == DENSITY_CHANNEL { 1.0 } else { 0.0 }
    });
    field
        .backward(&stream, &ctx, input.view(), out.view(), dl_doutput.view(), None, false, GradientMode::Overwrite)
        .unwrap();
    stream.synchronize();

    // dL/dw_i = sum_c W_density[i] * x_i
    let density = field.module_params(ModuleId::DensityNetwork).to_vec();
    let grads = field.module_gradients(ModuleId::PosEncoding);
    assert_eq!(grads.len(), 3);
    for i in 0..3 {
        let expected: f32 = (0..4).map(|c| density[i] * input.get(i, c)).sum();
        assert_close(grads[i], expected, 1e-5, "position encoding gradient");
    }
}

#[test]
fn untouched_input_rows_keep_their_gradient() {
    let mut config = linear_config(1.0);
    config.dir_offset = 4;
    let mut field = field(config, 2);
    assert_eq!(field.input_width(), 6);
    let stream = Stream::new();
    let input = random_input(6, 2, MatrixLayout::ColumnMajor, 2);
    let mut out = stream.matrix(field.padded_output_width(), 2, MatrixLayout::ColumnMajor);
    let ctx = field
        .forward(&stream, input.view(), Some(&mut out.view_mut()), false, true)
        .unwrap();
    let ones = Matrix::from_fn(out.rows(), 2, MatrixLayout::ColumnMajor, |_, _| 1.0);
    let mut dl_dinput = Matrix::from_fn(6, 2, MatrixLayout::ColumnMajor, |_, _| 7.0);
    field
        .backward(
            &stream,
            &ctx,
            input.view(),
            out.view(),
            ones.view(),
            Some(&mut dl_dinput.view_mut()),
            false,
            GradientMode::Overwrite,
        )
        .unwrap();
    stream.synchronize();
    for c in 0..2 {
        assert_eq!(dl_dinput.get(3, c), 7.0);
        assert_ne!(dl_dinput.get(0, c), 7.0);
    }
}

#[test]
fn density_backward_matches_full_backward_on_density() {
    let mut full = trainable_field(5);
    let mut reduced = trainable_field(5);
    let stream = Stream::new();
    let input = random_input(5, 6, MatrixLayout::ColumnMajor, 5);
    let only_density = |r: usize, _: usize| if r == DENSITY_CHANNEL { 1.0_f32 } else { 0.0 };

    let full_dx = input_gradient(&mut full, &input, GradientMode::Overwrite, only_density);

    let width = reduced.padded_density_output_width();
    let mut out = stream.matrix(width, 6, MatrixLayout::ColumnMajor);
    let ctx = reduced
        .density_forward(&stream, input.view(), Some(&mut out.view_mut()), false, true)
        .unwrap();
    let dl = Matrix::from_fn(width, 6, MatrixLayout::ColumnMajor, |r, _| if r == 0 { 1.0 } else { 0.0 });
    let mut dx = stream.matrix(5, 6, MatrixLayout::ColumnMajor);
    reduced
        .density_backward(
            &stream,
            &ctx,
            input.view(),
            out.view(),
            dl.view(),
            Some(&mut dx.view_mut()),
            false,
            GradientMode::Overwrite,
        )
        .unwrap();
    stream.synchronize();

    for c in 0..6 {
        for i in 0..3 {
            assert_close(dx.get(i, c), full_dx.get(i, c), 1e-6, "density input gradient");
        }
    }
    for id in [ModuleId::DensityNetwork, ModuleId::PosEncoding] {
        assert_eq!(full.module_gradients(id), reduced.module_gradients(id));
    }
}

#[test]
fn backward_rejects_a_foreign_batch() {
    let mut field = field(linear_config(1.0), 1);
    let stream = Stream::new();
    let input = random_input(5, 4, MatrixLayout::ColumnMajor, 1);
    let ctx = field.forward(&stream, input.view(), None, false, false).unwrap();
    let other = random_input(5, 3, MatrixLayout::ColumnMajor, 1);
    let out = Matrix::zeros(4, 3, MatrixLayout::ColumnMajor);
    let submitted = stream.submitted();
    let err = field
        .backward(&stream, &ctx, other.view(), out.view(), out.view(), None, false, GradientMode::Overwrite)
        .unwrap_err();
    assert!(matches!(err, FieldError::Shape(_)));
    assert_eq!(stream.submitted(), submitted);
}

#[test]
fn trainable_direction_encoding_trains_without_input_gradient() {
    let mut field = trainable_dir_field(3);
    let stream = Stream::new();
    let input = random_input(5, 4, MatrixLayout::ColumnMajor, 3);
    let mut out = stream.matrix(field.padded_output_width(), 4, MatrixLayout::ColumnMajor);
    let ctx = field
        .forward(&stream, input.view(), Some(&mut out.view_mut()), false, false)
        .unwrap();
    let dl_doutput = Matrix::from_fn(out.rows(), 4, MatrixLayout::ColumnMajor, |r, _| {
        if r == 0 { 1.0 } else { 0.0 }
    });
    field
        .backward(&stream, &ctx, input.view(), out.view(), dl_doutput.view(), None, false, GradientMode::Overwrite)
        .unwrap();
    stream.synchronize();

    // red is W_rgb[0] . [dir | uv | 0], so dL/dw_j = sum_c W_rgb[0][j] * dir_j
    let rgb = field.module_params(ModuleId::RgbNetwork).to_vec();
    let grads = field.module_gradients(ModuleId::DirEncoding);
    assert_eq!(grads.len(), 2);
    assert!(grads.iter().any(|&g| g != 0.0));
    for j in 0..2 {
        let expected: f32 = (0..4).map(|c| rgb[j] * input.get(3 + j, c)).sum();
        assert_close(grads[j], expected, 1e-5, "direction encoding gradient");
    }
}

#[test]
fn backward_rejects_a_context_from_another_field() {
    let source = field(cutlass_config(), 1);
    let mut config = cutlass_config();
    config.density_network.n_neurons = 16;
    config.uv_network.n_neurons = 16;
    config.rgb_network.n_neurons = 16;
    let mut target = field(config, 1);
    assert_eq!(target.padded_output_width(), source.padded_output_width());
    assert_eq!(target.buffer_layout(), source.buffer_layout());

    let stream = Stream::new();
    let input = random_input(source.input_width(), 6, MatrixLayout::ColumnMajor, 4);
    let mut out = stream.matrix(source.padded_output_width(), 6, MatrixLayout::ColumnMajor);
    let ctx = source
        .forward(&stream, input.view(), Some(&mut out.view_mut()), false, false)
        .unwrap();
    let ones = Matrix::from_fn(out.rows(), 6, MatrixLayout::ColumnMajor, |_, _| 1.0);
    let err = target
        .backward(&stream, &ctx, input.view(), out.view(), ones.view(), None, false, GradientMode::Overwrite)
        .unwrap_err();
    assert!(matches!(err, FieldError::Context(_)));
}
