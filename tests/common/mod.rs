//! Shared test utilities for tensor construction and small model configs.
#![allow(dead_code)]

use burn::tensor::{Distribution, Int, Tensor, TensorData};
use burn_ndarray::{NdArray, NdArrayDevice};
use tritok::config::{load_config, ModelConfig};

pub type TestBackend = NdArray<f32>;

pub const FIXTURE_DIR: &str = "tests/fixtures";

/// Load a YAML model config from the fixture directory.
pub fn read_config_fixture(name: &str) -> ModelConfig {
    let path = format!("{FIXTURE_DIR}/{name}");
    load_config(&path).unwrap_or_else(|e| panic!("failed to load fixture {path}: {e}"))
}

/// Smallest configuration the default backbone accepts: four 32-wide stages,
/// 16x16 images and a 2x2 latent grid.
pub fn tiny_config() -> ModelConfig {
    read_config_fixture("tiny_config.yaml")
}

/// Assert two tensor data slices are element-wise close within tolerance.
pub fn assert_close(a: &TensorData, b: &TensorData, tol: f32) {
    let a_slice = a.as_slice::<f32>().expect("a slice");
    let b_slice = b.as_slice::<f32>().expect("b slice");
    assert_eq!(
        a_slice.len(),
        b_slice.len(),
        "tensor length mismatch: {} vs {}",
        a_slice.len(),
        b_slice.len()
    );
    for (idx, (x, y)) in a_slice.iter().zip(b_slice.iter()).enumerate() {
        if (x - y).abs() > tol {
            panic!(
                "mismatch at {idx}: {x} vs {y} (diff: {}, tol: {tol})",
                (x - y).abs()
            );
        }
    }
}

/// Create a 2D tensor from nested Vecs.
pub fn tensor2(data: Vec<Vec<f32>>, device: &NdArrayDevice) -> Tensor<TestBackend, 2> {
    let rows = data.len();
    let cols = data.first().map(|r| r.len()).unwrap_or(0);
    let flat: Vec<f32> = data.into_iter().flatten().collect();
    Tensor::from_data(TensorData::new(flat, [rows, cols]), device)
}

/// Create a 1D int tensor from a Vec.
pub fn int1(data: Vec<i64>, device: &NdArrayDevice) -> Tensor<TestBackend, 1, Int> {
    let len = data.len();
    Tensor::from_data(TensorData::new(data, [len]), device)
}

/// Random normal tensor.
pub fn randn<const D: usize>(shape: [usize; D], device: &NdArrayDevice) -> Tensor<TestBackend, D> {
    Tensor::random(shape, Distribution::Normal(0.0, 1.0), device)
}

/// Tensor values as a flat Vec.
pub fn values<const D: usize>(tensor: Tensor<TestBackend, D>) -> Vec<f32> {
    tensor.into_data().iter::<f32>().collect()
}

/// Int tensor values as a flat Vec.
pub fn int_values<const D: usize>(tensor: Tensor<TestBackend, D, Int>) -> Vec<i64> {
    tensor.into_data().iter::<i64>().collect()
}

/// Rows of a `[n, d]` table as Vecs.
pub fn rows(table: Tensor<TestBackend, 2>) -> Vec<Vec<f32>> {
    let [_, dim] = table.dims();
    values(table).chunks(dim).map(|row| row.to_vec()).collect()
}

/// Channel vectors of a `(B, C, H, W)` map in `(b, h, w)` order.
pub fn position_vectors(map: Tensor<TestBackend, 4>) -> Vec<Vec<f32>> {
    let [batch, channels, height, width] = map.dims();
    let flat = values(map.permute([0, 2, 3, 1]));
    let vectors: Vec<Vec<f32>> = flat.chunks(channels).map(|v| v.to_vec()).collect();
    assert_eq!(vectors.len(), batch * height * width);
    vectors
}

pub fn sq_distance(a: &[f32], b: &[f32]) -> f32 {
    a.iter().zip(b).map(|(x, y)| (x - y) * (x - y)).sum()
}

pub fn norm(a: &[f32]) -> f32 {
    a.iter().map(|x| x * x).sum::<f32>().sqrt()
}

pub fn normalized(a: &[f32]) -> Vec<f32> {
    let n = norm(a).max(1e-12);
    a.iter().map(|x| x / n).collect()
}
