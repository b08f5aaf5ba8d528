//! Tensor bridge: conversions between plain `Vec<f32>` rows (the snapshot
//! table's representation) and burn tensors.

use burn::prelude::*;
use burn::tensor::TensorData;
use rand::Rng;
use rand_distr::StandardNormal;

/// Convert a batch of f32 rows to a burn 2D tensor of shape `(rows, dim)`.
///
/// # Panics
/// Panics if `rows` is empty or if rows have inconsistent lengths.
pub fn rows_to_tensor<B: Backend>(rows: &[Vec<f32>], device: &B::Device) -> Tensor<B, 2> {
    assert!(!rows.is_empty(), "rows must not be empty");
    let dim = rows[0].len();
    assert!(dim > 0, "row dimension must be > 0");
    for (i, row) in rows.iter().enumerate() {
        assert_eq!(row.len(), dim, "row {i} has length {}, expected {dim}", row.len());
    }

    let n = rows.len();
    let flat: Vec<f32> = rows.iter().flat_map(|v| v.iter().copied()).collect();
    Tensor::from_data(TensorData::new(flat, [n, dim]), device)
}

/// Wrap a row-major buffer as a `(n, dim)` tensor.
pub fn flat_to_tensor<B: Backend>(
    flat: Vec<f32>,
    n: usize,
    dim: usize,
    device: &B::Device,
) -> Tensor<B, 2> {
    assert_eq!(flat.len(), n * dim, "buffer length does not match ({n}, {dim})");
    Tensor::from_data(TensorData::new(flat, [n, dim]), device)
}

/// Extract the rows of a 2D tensor.
pub fn tensor_to_rows<B: Backend>(tensor: Tensor<B, 2>) -> Vec<Vec<f32>> {
    let [_, dim] = tensor.dims();
    let values: Vec<f32> = tensor.into_data().iter::<f32>().collect();
    if dim == 0 {
        return Vec::new();
    }
    values.chunks(dim).map(|c| c.to_vec()).collect()
}

/// Extract f64 values from a burn 1D tensor.
pub fn tensor_to_vec<B: Backend>(tensor: Tensor<B, 1>) -> Vec<f64> {
    tensor.into_data().iter::<f32>().map(f64::from).collect()
}

/// Extract a single f64 scalar from a one-element burn 1D tensor.
pub fn tensor_to_f64<B: Backend>(tensor: Tensor<B, 1>) -> f64 {
    tensor.into_scalar().elem::<f64>()
}

/// A `(n, dim)` noise tensor drawn from `rng`: standard normal, or uniform
/// on `[0, 1)` when `gaussian` is off.
pub fn noise_tensor<B: Backend>(
    n: usize,
    dim: usize,
    gaussian: bool,
    rng: &mut impl Rng,
    device: &B::Device,
) -> Tensor<B, 2> {
    let flat: Vec<f32> = (0..n * dim)
        .map(|_| {
            if gaussian {
                rng.sample::<f32, _>(StandardNormal)
            } else {
                rng.gen::<f32>()
            }
        })
        .collect();
    flat_to_tensor(flat, n, dim, device)
}

/// Build an index tensor for `select`.
pub fn index_tensor<B: Backend>(indices: &[usize], device: &B::Device) -> Tensor<B, 1, Int> {
    let ints: Vec<i64> = indices.iter().map(|&i| i as i64).collect();
    Tensor::from_data(TensorData::new(ints, [indices.len()]), device)
}
