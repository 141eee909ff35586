mod common;

use burn_ndarray::{NdArray, NdArrayDevice};
use std::io::Write;
use tritok::config::load_config;
use tritok::{ModelConfig, TriTokModel, TritokError};

fn build(config: &ModelConfig) -> anyhow::Result<TriTokModel<NdArray<f32>>> {
    TriTokModel::from_config(config, &NdArrayDevice::default())
}

fn config_error(config: &ModelConfig) -> TritokError {
    let err = build(config).unwrap_err();
    err.downcast_ref::<TritokError>()
        .cloned()
        .unwrap_or_else(|| panic!("unexpected error: {err}"))
}

#[test]
fn missing_config_file_errors() {
    let err = load_config("tests/fixtures/missing_config.yaml").unwrap_err();
    assert!(err.to_string().contains("Config file not found"));
}

#[test]
fn malformed_yaml_errors() {
    let mut file = tempfile::NamedTempFile::new().expect("tempfile");
    writeln!(file, "codebook_size: [not, a, number]").expect("write");
    assert!(load_config(file.path()).is_err());
}

#[test]
fn yaml_overrides_reach_the_model() {
    let config = common::tiny_config();
    assert_eq!(config.codebook_size, 16);
    assert_eq!(config.grid_size(), Ok(2));
    let model = build(&config).expect("model");
    for stream in model.streams.each_ref().into_array() {
        assert_eq!(stream.quantizer.codebook.size(), 16);
        assert_eq!(stream.quantizer.codebook.dim(), 4);
    }
}

#[test]
fn three_stage_backbone_is_rejected() {
    let config = ModelConfig {
        encoder_ch_mult: vec![1, 1, 1],
        decoder_ch_mult: vec![1, 1, 1],
        ..common::tiny_config()
    };
    assert_eq!(config_error(&config), TritokError::UnsupportedStageCount(3));
}

#[test]
fn batch_norm_backbone_is_rejected() {
    let mut config = common::tiny_config();
    config.backbone.norm_type = "batch".to_string();
    assert_eq!(
        config_error(&config),
        TritokError::UnsupportedNorm("batch".to_string())
    );
}

#[test]
fn unknown_entropy_kind_is_rejected_at_construction() {
    let config = ModelConfig {
        entropy_loss_type: "argmax".to_string(),
        ..common::tiny_config()
    };
    assert_eq!(
        config_error(&config),
        TritokError::UnsupportedEntropyLoss("argmax".to_string())
    );
}

#[test]
fn image_size_must_match_the_latent_grid() {
    let mut config = common::tiny_config();
    config.backbone.image_size = 20;
    assert!(matches!(
        config_error(&config),
        TritokError::InvalidConfig(_)
    ));
}

#[test]
fn mismatched_adapter_width_is_rejected() {
    let mut config = common::tiny_config();
    config.backbone.adapter.width = Some(64);
    assert!(matches!(
        config_error(&config),
        TritokError::InvalidConfig(_)
    ));
}
