mod common;

use burn::tensor::backend::Backend;
use burn::tensor::{ElementConversion, Int, Tensor};
use burn_ndarray::NdArrayDevice;
use common::{
    assert_close, int_values, position_vectors, randn, rows, tiny_config, TestBackend,
};
use tritok::{
    FeatureEncoder, Layout, Mode, ModelConfig, PixelDecoder, TriTokModel, TritokError, Triple,
};

fn tiny_model(config: &ModelConfig) -> TriTokModel<TestBackend> {
    TriTokModel::from_config(config, &NdArrayDevice::default()).expect("model")
}

fn scalar(tensor: Tensor<TestBackend, 1>) -> f32 {
    tensor.into_scalar().elem::<f32>()
}

#[test]
fn forward_reconstructs_image_shape() {
    let device = NdArrayDevice::default();
    let mut model = tiny_model(&tiny_config());
    assert_eq!(model.mode(), Mode::Train);

    let output = model.forward(randn([2, 3, 16, 16], &device)).expect("forward");
    assert_eq!(output.reconstruction.dims(), [2, 3, 16, 16]);
    for losses in output.losses.into_array() {
        assert!(losses.embedding_loss.is_some());
        assert!(losses.commitment_loss.is_some());
        assert!(losses.entropy_loss.is_some());
        assert!((0.0..=1.0).contains(&losses.codebook_usage));
    }
    assert_eq!(scalar(output.disentangle_loss), 0.0);
    assert!(output.mid_semantic_prediction.is_none());
    assert!(output.high_semantic_prediction.is_none());
}

#[test]
fn encode_yields_three_index_maps() {
    let device = NdArrayDevice::default();
    let mut model = tiny_model(&tiny_config());
    let encoded = model.encode(randn([3, 3, 16, 16], &device)).expect("encode");
    for (quant, info) in encoded.quant.zip(encoded.info).into_array() {
        assert_eq!(quant.dims(), [3, 4, 2, 2]);
        assert_eq!(info.indices.dims(), [3, 2, 2]);
        assert!(info.perplexity.is_none());
        assert!(info.min_encodings.is_none());
    }
}

#[test]
fn eval_mode_suppresses_losses_and_usage_updates() {
    let device = NdArrayDevice::default();
    let mut model = tiny_model(&tiny_config());
    model.set_mode(Mode::Eval);
    for stream in model.streams.each_ref().into_array() {
        assert_eq!(stream.quantizer.mode(), Mode::Eval);
    }
    let before = model.codebook_usage();

    let output = model.forward(randn([2, 3, 16, 16], &device)).expect("forward");
    for losses in output.losses.into_array() {
        assert!(losses.total().is_none());
        assert_eq!(losses.codebook_usage, 0.0);
    }
    assert_eq!(model.codebook_usage(), before);
    // zero-initialized history holds only code 0
    assert_eq!(before, Triple::splat(1.0 / 16.0));
}

#[test]
fn training_records_each_stream_in_its_own_history() {
    let device = NdArrayDevice::default();
    let mut model = tiny_model(&tiny_config());
    let encoded = model.encode(randn([4, 3, 16, 16], &device)).expect("encode");

    for (stream, info) in model.streams.each_ref().zip(encoded.info).into_array() {
        let tracker = stream.quantizer.usage().expect("tracker");
        assert_eq!(tracker.len(), 64);
        let recent: Vec<i64> = tracker.snapshot()[64 - 16..]
            .iter()
            .map(|&code| code as i64)
            .collect();
        assert_eq!(recent, int_values(info.indices));
    }
}

#[test]
fn constant_codes_decode_to_constant_rows() {
    let device = NdArrayDevice::default();
    let model = tiny_model(&tiny_config());
    let k = 5i64;
    let indices = Triple::splat(Tensor::<TestBackend, 1, Int>::full([8], k, &device));
    let shapes = Triple::splat([2, 4, 2, 2]);

    for stream in model.streams.each_ref().into_array() {
        let row = rows(stream.quantizer.embedding())[k as usize].clone();
        let entry = stream
            .quantizer
            .get_codebook_entry(indices.vis.clone(), shapes.vis, Layout::ChannelFirst)
            .expect("lookup");
        for vector in position_vectors(entry) {
            for (a, b) in vector.iter().zip(&row) {
                assert!((a - b).abs() < 1e-6);
            }
        }
    }

    let expected = model
        .decode_streams(model.streams.each_ref().map(|stream| {
            let row = stream.quantizer.embedding().slice([5..6, 0..4]);
            row.reshape([1, 4, 1, 1]).repeat_dim(0, 2).repeat_dim(2, 2).repeat_dim(3, 2)
        }))
        .expect("decode");
    let decoded = model
        .decode_code(indices.clone(), shapes, Layout::ChannelFirst)
        .expect("decode_code");
    assert_eq!(decoded.dims(), [2, 3, 16, 16]);
    assert_close(&decoded.to_data(), &expected.to_data(), 1e-4);

    let maps = Triple::splat(Tensor::<TestBackend, 3, Int>::full([2, 2, 2], k, &device));
    let from_maps = model.decode_index_maps(maps).expect("decode maps");
    assert_close(&from_maps.to_data(), &decoded.to_data(), 1e-5);

    let channel_last = model
        .decode_code(indices, Triple::splat([2, 2, 2, 4]), Layout::ChannelLast)
        .expect("channel-last decode");
    assert_close(&channel_last.to_data(), &decoded.to_data(), 1e-5);
}

#[test]
fn index_maps_reproduce_encoded_decode() {
    let device = NdArrayDevice::default();
    let mut model = tiny_model(&tiny_config());
    model.set_mode(Mode::Eval);
    let encoded = model.encode(randn([1, 3, 16, 16], &device)).expect("encode");
    let direct = model.decode_streams(encoded.quant).expect("decode");
    let from_codes = model
        .decode_index_maps(encoded.info.map(|info| info.indices))
        .expect("decode codes");
    assert_close(&from_codes.to_data(), &direct.to_data(), 1e-4);
}

#[test]
fn decode_code_does_not_touch_usage() {
    let device = NdArrayDevice::default();
    let model = tiny_model(&tiny_config());
    let before = model.codebook_usage();
    let indices = Triple::splat(Tensor::<TestBackend, 1, Int>::full([4], 7, &device));
    model
        .decode_code(indices, Triple::splat([1, 4, 2, 2]), Layout::ChannelFirst)
        .expect("decode_code");
    assert_eq!(model.codebook_usage(), before);
}

#[test]
fn disentanglement_penalty_is_bounded() {
    let device = NdArrayDevice::default();
    let config = ModelConfig {
        with_disentanglement: true,
        disentanglement_ratio: 0.5,
        ..tiny_config()
    };
    let mut model = tiny_model(&config);
    let output = model.forward(randn([2, 3, 16, 16], &device)).expect("forward");
    let loss = scalar(output.disentangle_loss);
    assert!((0.0..=0.5 + 1e-6).contains(&loss), "loss {loss}");
}

#[test]
fn semantic_heads_predict_token_features() {
    let device = NdArrayDevice::default();
    let config = ModelConfig {
        with_clip_supervision: true,
        ..tiny_config()
    };
    let mut model = tiny_model(&config);
    let output = model.forward(randn([2, 3, 16, 16], &device)).expect("forward");
    let mid = output.mid_semantic_prediction.expect("mid prediction");
    let high = output.high_semantic_prediction.expect("high prediction");
    assert_eq!(mid.dims(), [2, 5, 16]);
    assert_eq!(high.dims(), [2, 5, 24]);
}

#[test]
fn mismatched_stream_maps_are_rejected() {
    let device = NdArrayDevice::default();
    let model = tiny_model(&tiny_config());
    let quant = Triple::new(
        randn([1, 4, 2, 2], &device),
        randn([1, 4, 2, 2], &device),
        randn([1, 4, 1, 2], &device),
    );
    let err = model.decode_streams(quant).unwrap_err();
    assert!(matches!(
        err.downcast_ref::<TritokError>(),
        Some(TritokError::ShapeMismatch(_))
    ));
}

/// Encoder stand-in emitting constant maps of a fixed width.
#[derive(Debug)]
struct ConstantEncoder {
    z_channels: usize,
}

impl<B: Backend> FeatureEncoder<B> for ConstantEncoder {
    fn encode(&self, image: Tensor<B, 4>) -> anyhow::Result<Triple<Tensor<B, 4>>> {
        let [batch, _, height, width] = image.dims();
        let device = image.device();
        let shape = [batch, self.z_channels, height / 8, width / 8];
        Ok(Triple::new(
            Tensor::ones(shape, &device),
            Tensor::ones(shape, &device).neg(),
            Tensor::zeros(shape, &device),
        ))
    }

    fn downsample_factor(&self) -> usize {
        8
    }

    fn z_channels(&self) -> usize {
        self.z_channels
    }
}

/// Decoder stand-in producing black images.
#[derive(Debug)]
struct BlankDecoder;

impl<B: Backend> PixelDecoder<B> for BlankDecoder {
    fn decode(&self, z: Tensor<B, 4>) -> anyhow::Result<Tensor<B, 4>> {
        let [batch, _, height, width] = z.dims();
        Ok(Tensor::zeros([batch, 3, height * 8, width * 8], &z.device()))
    }
}

#[test]
fn custom_backbone_plugs_into_the_streams() {
    let device = NdArrayDevice::default();
    let config = ModelConfig {
        z_channels: 8,
        ..tiny_config()
    };
    let mut model = TriTokModel::<TestBackend, _, _>::with_backbone(
        &config,
        ConstantEncoder { z_channels: 8 },
        BlankDecoder,
        &device,
    )
    .expect("model");
    let output = model.forward(randn([1, 3, 16, 16], &device)).expect("forward");
    assert_eq!(output.reconstruction.dims(), [1, 3, 16, 16]);

    let err = TriTokModel::<TestBackend, _, _>::with_backbone(
        &tiny_config(),
        ConstantEncoder { z_channels: 8 },
        BlankDecoder,
        &device,
    )
    .unwrap_err();
    assert_eq!(
        err.downcast_ref::<TritokError>(),
        Some(&TritokError::ChannelMismatch {
            expected: 32,
            actual: 8
        })
    );
}
