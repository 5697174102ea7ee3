use candle_core::{DType, Result, Tensor};

// -----------------------------------------------------------------------------

/// Max along `dim` and the lowest index reaching it.
///
/// Ties go to the lowest index on every device, unlike a plain `argmax`
/// whose tie order is backend specific. A slice holding NaN has no max
/// position and yields the out-of-range index `x.dim(dim)`.
pub(crate) fn first_max_indices(x: &Tensor, dim: usize) -> Result<(Tensor, Tensor)> {
    let n = x.dim(dim)?;
    let max = x.max_keepdim(dim)?;
    let is_max = x.broadcast_eq(&max)?;

    let mut shape = vec![1; x.rank()];
    shape[dim] = n;
    let positions = Tensor::arange(0u32, n as u32, x.device())?
        .reshape(shape)?
        .broadcast_as(x.shape())?;
    let missing = Tensor::full(n as u32, x.shape(), x.device())?;
    let idx = is_max.where_cond(&positions, &missing)?.min(dim)?;

    Ok((max.squeeze(dim)?, idx))
}

// -----------------------------------------------------------------------------

/// One-hot encoding of integer `tags` along a new trailing dimension.
pub(crate) fn one_hot(tags: &Tensor, num_tags: usize, dtype: DType) -> Result<Tensor> {
    let tags = tags.to_dtype(DType::I64)?;
    let classes = Tensor::arange(0i64, num_tags as i64, tags.device())?;
    tags.unsqueeze(candle_core::D::Minus1)?
        .broadcast_eq(&classes)?
        .to_dtype(dtype)
}

// -----------------------------------------------------------------------------

/// Index of the first non-finite value.
pub(crate) fn first_non_finite(xs: &[f64]) -> Option<usize> {
    xs.iter().position(|x| !x.is_finite())
}

pub(crate) fn to_vec1_f64(x: &Tensor) -> Result<Vec<f64>> {
    x.to_dtype(DType::F64)?.to_vec1::<f64>()
}

// -----------------------------------------------------------------------------
