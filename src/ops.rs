use candle_core::{shape::Dim, DType, Device, Result, Tensor, D};

/// Picks `src[b][idx[b]]` for every row `b`; `src` is (batch, n), `idx` is (batch,).
pub(crate) fn gather(src: &Tensor, idx: &Tensor) -> Result<Tensor> {
    let index = idx.reshape((idx.dim(0)?, 1))?;
    src.gather(&index, D::Minus1)?.squeeze(D::Minus1)
}

pub(crate) fn max_indices<D: Dim + Copy>(x: &Tensor, dim: D) -> Result<(Tensor, Tensor)> {
    let max = x.max(dim)?;
    let idx = x.argmax(dim)?;
    Ok((max, idx))
}

/// `log(sum(exp(x)))` along `dim`, shifted by the maximum so large scores do
/// not overflow. The gradient of the shift cancels out, so it is left in the graph.
pub(crate) fn log_sum_exp<D: Dim + Copy>(x: &Tensor, dim: D) -> Result<Tensor> {
    let max = x.max_keepdim(dim)?;
    let sum = x.broadcast_sub(&max)?.exp()?.sum_keepdim(dim)?;
    sum.log()?.broadcast_add(&max)?.squeeze(dim)
}

/// Left-aligned `u8` mask of shape (lengths.len(), max_len).
pub(crate) fn sequence_mask(lengths: &[usize], max_len: usize, device: &Device) -> Result<Tensor> {
    let data: Vec<u8> = lengths
        .iter()
        .flat_map(|&len| (0..max_len).map(move |t| u8::from(t < len)))
        .collect();
    Tensor::from_vec(data, (lengths.len(), max_len), device)
}

/// Element count of the valid positions as a scalar tensor of `dtype`, never below one.
pub(crate) fn token_count(lengths: &[usize], dtype: DType, device: &Device) -> Result<Tensor> {
    let total = lengths.iter().sum::<usize>().max(1);
    Tensor::new(total as f64, device)?.to_dtype(dtype)
}
