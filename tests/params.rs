mod common;

use briny_field::checkpoint::{read_parameters, write_parameters};
use briny_field::prelude::*;
use common::*;
use rand::SeedableRng;
use rand::rngs::StdRng;

#[test]
fn partition_follows_fixed_order() {
    let field = trainable_field(0);
    let counts = [
        field.density_network().n_params(),
        field.uv_network().n_params(),
        field.rgb_network().n_params(),
        field.pos_encoding().n_params(),
        field.dir_encoding().n_params(),
    ];
    assert_eq!(field.n_params(), counts.iter().sum::<usize>());
    assert_eq!(counts[3], 3);

    let mut offset = 0;
    for (id, n) in ModuleId::ORDER.into_iter().zip(counts) {
        assert_eq!(field.parameter_layout().range(id), offset..offset + n, "{}", id.name());
        offset += n;
    }
    assert_eq!(field.parameter_layout().total(), field.n_params());
}

#[test]
fn loaded_parameters_start_at_cumulative_offsets() {
    let mut field = field(cutlass_config(), 0);
    let n = field.n_params();
    let params: Vec<f32> = (0..n).map(|i| i as f32).collect();
    field
        .set_params(ParameterBlock::from_params(params, InferencePrecision::Full))
        .unwrap();

    let mut offset = 0;
    for id in ModuleId::ORDER {
        let values = field.module_params(id);
        if let Some(&first) = values.first() {
            assert_eq!(first, offset as f32, "{}", id.name());
        }
        offset += values.len();
    }
    assert_eq!(offset, n);

    field.module_params_mut(ModuleId::RgbNetwork)[0] = -1.0;
    let start = field.parameter_layout().range(ModuleId::RgbNetwork).start;
    assert_eq!(field.parameters().params[start], -1.0);
}

#[test]
fn set_params_rejects_wrong_length() {
    let mut field = field(cutlass_config(), 0);
    let n = field.n_params();
    let err = field.set_params(ParameterBlock::zeros(n + 1)).unwrap_err();
    assert!(matches!(err, FieldError::Parameters { .. }));

    let mut block = ParameterBlock::zeros(n);
    block.gradients.pop();
    assert!(field.set_params(block).is_err());
}

#[test]
fn initialization_is_reproducible_and_matches_the_arena() {
    let field = field(cutlass_config(), 77);
    let mut buffer = vec![0.0; field.n_params()];
    field
        .initialize_params(&mut StdRng::seed_from_u64(77), &mut buffer, 1.0)
        .unwrap();
    assert_eq!(buffer, field.parameters().params);
    assert_eq!(field.parameters().inference_params, field.parameters().params);
    assert!(field.parameters().gradients.iter().all(|&g| g == 0.0));

    let mut short = vec![0.0; 3];
    assert!(matches!(
        field.initialize_params(&mut StdRng::seed_from_u64(1), &mut short, 1.0),
        Err(FieldError::Parameters { .. })
    ));
}

#[test]
fn sync_refreshes_the_inference_shadow() {
    let mut config = cutlass_config();
    config.inference_precision = InferencePrecision::Half;
    let mut field = field(config, 1);
    field.parameters_mut().params[0] = 0.1;
    assert_ne!(field.parameters().inference_params[0], field.parameters().params[0]);
    field.sync_inference_params();
    let shadow = field.parameters().inference_params[0];
    assert!((shadow - 0.1).abs() < 1e-4);
    assert_ne!(shadow, 0.1);
}

#[test]
fn checkpoint_round_trip_restores_outputs() {
    let source = field(cutlass_config(), 21);
    let mut bytes = Vec::new();
    source.save_parameters(&mut bytes).unwrap();

    let mut restored = field(cutlass_config(), 22);
    assert_ne!(restored.parameters().params, source.parameters().params);
    restored.load_parameters(bytes.as_slice()).unwrap();
    assert_eq!(restored.parameters().params, source.parameters().params);
    assert_eq!(restored.parameters().inference_params, source.parameters().inference_params);

    let stream = Stream::new();
    let input = random_input(source.input_width(), 8, MatrixLayout::ColumnMajor, 0);
    let mut a = stream.matrix(source.padded_output_width(), 8, MatrixLayout::ColumnMajor);
    let mut b = stream.matrix(source.padded_output_width(), 8, MatrixLayout::ColumnMajor);
    source.inference(&stream, input.view(), &mut a.view_mut(), true).unwrap();
    restored.inference(&stream, input.view(), &mut b.view_mut(), true).unwrap();
    stream.synchronize();
    assert_eq!(a, b);
}

#[test]
fn checkpoint_from_another_architecture_is_rejected() {
    let source = field(fused_config(), 1);
    let mut bytes = Vec::new();
    source.save_parameters(&mut bytes).unwrap();

    let mut target = field(cutlass_config(), 2);
    let before = target.parameters().clone();
    let err = target.load_parameters(bytes.as_slice()).unwrap_err();
    assert!(matches!(err, FieldError::Checkpoint(_)));
    assert_eq!(target.parameters(), &before);
}

#[test]
fn corrupted_checkpoints_fail_cleanly() {
    let field = field(linear_config(1.0), 3);
    let layout = field.parameter_layout().clone();
    let mut bytes = Vec::new();
    write_parameters(&mut bytes, &layout, &field.parameters().params).unwrap();

    let mut wrong_version = bytes.clone();
    wrong_version[4] = 9;
    assert!(matches!(
        read_parameters(wrong_version.as_slice(), &layout),
        Err(FieldError::Checkpoint(_))
    ));

    // swap the module ids of the first two sections
    let mut swapped = bytes.clone();
    swapped[6] = 1;
    assert!(matches!(
        read_parameters(swapped.as_slice(), &layout),
        Err(FieldError::Checkpoint(_))
    ));

    let truncated = &bytes[..bytes.len() - 3];
    assert!(matches!(read_parameters(truncated, &layout), Err(FieldError::Io(_))));

    assert_eq!(read_parameters(bytes.as_slice(), &layout).unwrap(), field.parameters().params);
}
