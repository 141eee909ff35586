//! Learnable codebook table shared by one quantizer.
//!
//! Rows are stored raw; unit normalization is applied when the table is read,
//! except for the one-time normalization performed at initialization.

use crate::error::TritokError;
use crate::modules::ops::l2_normalize;
use crate::perf::{self, Metric};
use burn::module::Param;
use burn::tensor::{backend::Backend, Distribution, ElementConversion, Int, Tensor};

/// Fixed-size table of `size` embedding vectors of width `dim`.
#[derive(Debug, Clone)]
pub struct Codebook<B: Backend> {
    /// Embedding table with shape `[size, dim]`.
    pub weight: Param<Tensor<B, 2>>,
    size: usize,
    dim: usize,
}

impl<B: Backend> Codebook<B> {
    /// Initialize a codebook uniformly in `[-1/size, 1/size]`.
    ///
    /// When `l2_norm` is set the stored rows are normalized once here.
    pub fn new(size: usize, dim: usize, l2_norm: bool, device: &B::Device) -> Self {
        let bound = 1.0 / size as f64;
        let weight = Tensor::<B, 2>::random(
            [size, dim],
            Distribution::Uniform(-bound, bound),
            device,
        );
        let weight = if l2_norm {
            l2_normalize(weight, 1)
        } else {
            weight
        };
        Self {
            weight: Param::from_tensor(weight),
            size,
            dim,
        }
    }

    /// Wrap an existing `[size, dim]` table without modifying it.
    pub fn from_tensor(weight: Tensor<B, 2>) -> Self {
        let [size, dim] = weight.dims();
        Self {
            weight: Param::from_tensor(weight),
            size,
            dim,
        }
    }

    pub fn size(&self) -> usize {
        self.size
    }

    pub fn dim(&self) -> usize {
        self.dim
    }

    /// Raw or row-normalized view of the table.
    pub fn read(&self, l2_norm: bool) -> Tensor<B, 2> {
        let weight = self.weight.val();
        if l2_norm {
            l2_normalize(weight, 1)
        } else {
            weight
        }
    }

    /// Gather rows of `table` (a [`Codebook::read`] result) for flat indices.
    ///
    /// # Errors
    ///
    /// Returns [`TritokError::IndexOutOfRange`] if any index is outside
    /// `[0, size)`.
    pub fn gather(
        &self,
        table: Tensor<B, 2>,
        indices: Tensor<B, 1, Int>,
    ) -> anyhow::Result<Tensor<B, 2>> {
        let _span = perf::span(Metric::CodebookLookup);
        self.check_range(&indices)?;
        perf::add_count(Metric::LookedUpCodes, indices.dims()[0] as u64);
        Ok(table.select(0, indices))
    }

    /// Look up raw rows for an index tensor of any rank.
    ///
    /// The result has the index shape with `dim` appended as the last axis.
    pub fn lookup<const D: usize, const D2: usize>(
        &self,
        indices: Tensor<B, D, Int>,
        l2_norm: bool,
    ) -> anyhow::Result<Tensor<B, D2>> {
        if D2 != D + 1 {
            return Err(TritokError::ShapeMismatch(format!(
                "lookup of rank-{D} indices yields rank {}, not {D2}",
                D + 1
            ))
            .into());
        }
        let index_shape = indices.dims();
        let count = index_shape.iter().product::<usize>();
        let flat = indices.reshape([count]);
        let rows = self.gather(self.read(l2_norm), flat)?;
        let mut out_shape = [0usize; D2];
        out_shape[..D].copy_from_slice(&index_shape);
        out_shape[D] = self.dim;
        Ok(rows.reshape(out_shape))
    }

    fn check_range(&self, indices: &Tensor<B, 1, Int>) -> Result<(), TritokError> {
        if indices.dims()[0] == 0 {
            return Ok(());
        }
        let min = indices.clone().min().into_scalar().elem::<i64>();
        if min < 0 {
            return Err(TritokError::IndexOutOfRange {
                index: min,
                size: self.size,
            });
        }
        let max = indices.clone().max().into_scalar().elem::<i64>();
        if max >= self.size as i64 {
            return Err(TritokError::IndexOutOfRange {
                index: max,
                size: self.size,
            });
        }
        Ok(())
    }
}
