use candle_core::{DType, Device, IndexOp, Tensor};
use candle_nn::{Init, VarBuilder};
use std::fmt::Display;

use crate::config::CrfConfig;
use crate::error::{CrfError, Result};
use crate::ops::{gather, log_sum_exp, max_indices, token_count};
use crate::Reduction;

/// Offset applied to every transition into or out of the pad tag when the pad
/// tag is one of the scored tags.
pub const PAD_PENALTY: f64 = -1e4;

/// Linear-chain CRF over `tag_dim` tags.
///
/// The transition matrix is `(tag_dim + 2, tag_dim + 2)`: row `tag_dim` holds
/// the START scores and column `tag_dim + 1` the END scores. Only START→tag,
/// tag→tag and tag→END entries are ever read.
pub struct CRF {
    pub(crate) config: CrfConfig,
    pub(crate) transitions: Tensor,
}

impl Display for CRF {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(
            f,
            "CRF(tag_dim: {}, pad_idx: {:?}, batch_first: {})",
            self.config.tag_dim, self.config.pad_idx, self.config.batch_first
        )
    }
}

/// Inputs in time-major order, with each sample's valid length read off the mask.
struct Lattice {
    /// (seq_length, batch_size, tag_dim)
    emissions: Tensor,
    /// (seq_length, batch_size), u8
    mask: Tensor,
    lengths: Vec<usize>,
    seq_length: usize,
}

impl Lattice {
    fn batch_size(&self) -> usize {
        self.lengths.len()
    }

    fn is_empty(&self) -> bool {
        self.seq_length == 0 || self.lengths.is_empty()
    }
}

fn check_dtype(dtype: DType) -> Result<()> {
    use DType::*;
    match dtype {
        #[cfg(any(feature = "cuda", feature = "metal"))]
        F32 | F64 => Ok(()),
        #[cfg(not(any(feature = "cuda", feature = "metal")))]
        BF16 | F16 | F32 | F64 => Ok(()),
        _ => Err(CrfError::DTypeMismatch(format!(
            "unsupported dtype for CRF transitions: {:?}",
            dtype
        ))),
    }
}

/// Valid length of every mask row; fails on a row that turns back on after padding.
fn sequence_lengths(rows: &[Vec<u8>]) -> Result<Vec<usize>> {
    rows.iter()
        .enumerate()
        .map(|(sample, row)| {
            let len = row.iter().take_while(|&&m| m != 0).count();
            match row[len..].iter().position(|&m| m != 0) {
                Some(offset) => Err(CrfError::InvalidMask {
                    sample,
                    position: len + offset,
                }),
                None => Ok(len),
            }
        })
        .collect()
}

impl CRF {
    pub fn new(config: &CrfConfig, device: &Device) -> Result<Self> {
        Self::new_with_dtype(config, DType::F32, device)
    }

    pub fn new_with_dtype(config: &CrfConfig, dtype: DType, device: &Device) -> Result<Self> {
        check_dtype(dtype)?;
        config.validate()?;

        let n = config.tag_dim + 2;
        let r = config.init_range;
        let transitions = Tensor::zeros((n, n), dtype, device)?.rand_like(-r, r)?;

        tracing::debug!(
            tag_dim = config.tag_dim,
            pad_idx = ?config.pad_idx,
            batch_first = config.batch_first,
            ?dtype,
            "initialized CRF"
        );
        Ok(Self {
            config: config.clone(),
            transitions,
        })
    }

    /// Fetches the transition matrix from `vb` under the name `transitions`,
    /// creating it with a uniform init when backed by a `VarMap`.
    pub fn load(config: &CrfConfig, vb: VarBuilder) -> Result<Self> {
        check_dtype(vb.dtype())?;
        config.validate()?;

        let n = config.tag_dim + 2;
        let transitions = vb.get_with_hints(
            (n, n),
            "transitions",
            Init::Uniform {
                lo: -config.init_range,
                up: config.init_range,
            },
        )?;

        tracing::debug!(
            tag_dim = config.tag_dim,
            pad_idx = ?config.pad_idx,
            batch_first = config.batch_first,
            "loaded CRF"
        );
        Ok(Self {
            config: config.clone(),
            transitions,
        })
    }

    pub fn config(&self) -> &CrfConfig {
        &self.config
    }

    pub fn tag_dim(&self) -> usize {
        self.config.tag_dim
    }

    /// Rows of the transition matrix: the scored tags plus START and END.
    pub fn num_tags(&self) -> usize {
        self.config.tag_dim + 2
    }

    pub fn start_idx(&self) -> usize {
        self.config.tag_dim
    }

    pub fn end_idx(&self) -> usize {
        self.config.tag_dim + 1
    }

    pub fn pad_idx(&self) -> Option<usize> {
        self.config.pad_idx
    }

    pub fn batch_first(&self) -> bool {
        self.config.batch_first
    }

    pub fn transitions(&self) -> &Tensor {
        &self.transitions
    }

    /// Transition matrix as scored, i.e. with the pad penalty applied.
    pub(crate) fn constrained_transitions(&self) -> Result<Tensor> {
        let Some(pad) = self.config.scored_pad() else {
            return Ok(self.transitions.clone());
        };
        let n = self.num_tags();
        let penalty: Vec<f64> = (0..n * n)
            .map(|k| {
                if k / n == pad || k % n == pad {
                    PAD_PENALTY
                } else {
                    0.0
                }
            })
            .collect();
        let penalty = Tensor::from_vec(penalty, (n, n), self.transitions.device())?
            .to_dtype(self.transitions.dtype())?;
        Ok(self.transitions.broadcast_add(&penalty)?)
    }

    /// (start (tag_dim,), end (tag_dim,), tag-to-tag (tag_dim, tag_dim))
    fn parts(&self) -> Result<(Tensor, Tensor, Tensor)> {
        let w = self.constrained_transitions()?;
        let s = self.config.tag_dim;
        let start = w.i((self.start_idx(), ..s))?.contiguous()?;
        let end = w.i((..s, self.end_idx()))?.contiguous()?;
        let trans = w.i((..s, ..s))?.contiguous()?;
        Ok((start, end, trans))
    }

    fn validate(
        &self,
        emissions: &Tensor,
        tags: Option<&Tensor>,
        mask: Option<&Tensor>,
    ) -> Result<()> {
        {
            let dtype_transitions = self.transitions.dtype();
            let dtype_emissions = emissions.dtype();
            if dtype_transitions != dtype_emissions {
                return Err(CrfError::DTypeMismatch(format!(
                    "emissions and CRF must have the same dtype, expected {:?}, got {:?}",
                    dtype_transitions, dtype_emissions
                )));
            }
        }

        let dims = emissions.dims().len();
        if dims != 3 {
            return Err(CrfError::shape(format!(
                "emissions must have 3 dimensions, got {}",
                dims
            )));
        }

        let (d1, d2, d3) = emissions.dims3()?;
        if d3 != self.config.tag_dim {
            return Err(CrfError::shape(format!(
                "expected last dimension of emissions is {}, got {}",
                self.config.tag_dim, d3
            )));
        }

        if let Some(tags) = tags {
            if tags.dtype() != DType::I64 {
                return Err(CrfError::DTypeMismatch("tags must be of type i64".to_string()));
            }
            if tags.dims().len() != 2 {
                return Err(CrfError::shape(format!(
                    "tags must have 2 dimensions, got {}",
                    tags.dims().len()
                )));
            }
            let (tag_d1, tag_d2) = tags.dims2()?;
            if (d1, d2) != (tag_d1, tag_d2) {
                return Err(CrfError::shape(format!(
                    "the first two dimensions of emissions and tags must match, got ({}, {}) and ({}, {})",
                    d1, d2, tag_d1, tag_d2
                )));
            }
        }

        if let Some(mask) = mask {
            if mask.dtype() != DType::U8 {
                return Err(CrfError::DTypeMismatch("mask must be of type u8".to_string()));
            }
            if mask.dims().len() != 2 {
                return Err(CrfError::shape(format!(
                    "mask must have 2 dimensions, got {}",
                    mask.dims().len()
                )));
            }
            let (mask_d1, mask_d2) = mask.dims2()?;
            if (d1, d2) != (mask_d1, mask_d2) {
                return Err(CrfError::shape(format!(
                    "the first two dimensions of emissions and mask must match, got ({}, {}) and ({}, {})",
                    d1, d2, mask_d1, mask_d2
                )));
            }
        }

        Ok(())
    }

    /// Gold ids at valid positions must be scored tags other than the pad id;
    /// at padded positions they may also be the pad id.
    fn check_tags(&self, tags: &[Vec<i64>], lengths: &[usize]) -> Result<()> {
        let tag_dim = self.config.tag_dim;
        let pad = self.config.pad_idx.map(|p| p as i64);
        for (sample, (row, &len)) in tags.iter().zip(lengths).enumerate() {
            for (position, &tag) in row.iter().enumerate() {
                let in_range = (0..tag_dim as i64).contains(&tag);
                let is_pad = Some(tag) == pad;
                let ok = if position < len {
                    in_range && !is_pad
                } else {
                    in_range || is_pad
                };
                if !ok {
                    return Err(CrfError::InvalidTagId {
                        sample,
                        position,
                        tag,
                        tag_dim,
                    });
                }
            }
        }
        Ok(())
    }

    /// Validates the inputs and rearranges them to time-major order.
    fn prepare(
        &self,
        emissions: &Tensor,
        tags: Option<&Tensor>,
        mask: Option<&Tensor>,
    ) -> Result<(Lattice, Option<Tensor>)> {
        self.validate(emissions, tags, mask)?;

        let (d1, d2, _) = emissions.dims3()?;
        let (batch_size, seq_length) = if self.batch_first() {
            (d1, d2)
        } else {
            (d2, d1)
        };

        if batch_size == 0 || seq_length == 0 {
            let lattice = Lattice {
                emissions: emissions.clone(),
                mask: Tensor::zeros((seq_length, batch_size), DType::U8, emissions.device())?,
                lengths: vec![0; batch_size],
                seq_length,
            };
            return Ok((lattice, None));
        }

        let mask = match mask {
            Some(mask) => mask.clone(),
            None => Tensor::ones((d1, d2), DType::U8, emissions.device())?,
        };

        let (emissions, tags, mask) = if self.batch_first() {
            (
                emissions.transpose(0, 1)?,
                tags.map(|t| t.transpose(0, 1)).transpose()?,
                mask.transpose(0, 1)?,
            )
        } else {
            (emissions.clone(), tags.cloned(), mask)
        };
        let emissions = emissions.contiguous()?;
        let mask = mask.contiguous()?;

        // padded slots may hold anything, non-finite values included
        let emissions = mask
            .unsqueeze(2)?
            .broadcast_as(emissions.shape())?
            .where_cond(&emissions, &emissions.zeros_like()?)?;

        let lengths = sequence_lengths(&mask.t()?.contiguous()?.to_vec2::<u8>()?)?;
        if let Some(tags) = &tags {
            self.check_tags(&tags.t()?.contiguous()?.to_vec2::<i64>()?, &lengths)?;
        }

        let lattice = Lattice {
            emissions,
            mask,
            lengths,
            seq_length,
        };
        Ok((lattice, tags))
    }

    /// Keeps the per-sample `values` of samples with at least one valid
    /// position and selects 0 for the others.
    fn zero_empty(&self, lattice: &Lattice, values: &Tensor) -> Result<Tensor> {
        Ok(lattice
            .mask
            .i(0)?
            .where_cond(values, &values.zeros_like()?)?)
    }

    fn zeros_per_sample(&self, lattice: &Lattice) -> Result<Tensor> {
        Ok(Tensor::zeros(
            lattice.batch_size(),
            self.transitions.dtype(),
            self.transitions.device(),
        )?)
    }

    /// Score of the given (time-major) paths; samples with no valid position
    /// come out as garbage and are zeroed by the callers.
    fn compute_score(&self, lattice: &Lattice, tags: &Tensor) -> Result<Tensor> {
        let Lattice {
            emissions,
            mask,
            lengths,
            seq_length,
        } = lattice;
        let (start, end, trans) = self.parts()?;

        // padded positions may hold a pad id that is not a valid index
        let tags = mask.where_cond(tags, &tags.zeros_like()?)?;

        let first = tags.i(0)?;
        let mut score = start
            .index_select(&first, 0)?
            .broadcast_add(&gather(&emissions.i(0)?, &first)?)?;

        for i in 1..*seq_length {
            let prev = tags.i(i - 1)?;
            let cur = tags.i(i)?;
            let z = gather(&trans.index_select(&prev, 0)?, &cur)?;
            let e = gather(&emissions.i(i)?, &cur)?;
            let next_score = score.broadcast_add(&z.broadcast_add(&e)?)?;
            score = mask.i(i)?.where_cond(&next_score, &score)?;
        }

        let last_pos: Vec<i64> = lengths
            .iter()
            .map(|&len| len.saturating_sub(1) as i64)
            .collect();
        let last_pos = Tensor::from_vec(last_pos, (lengths.len(), 1), emissions.device())?;
        let last_tags = tags.t()?.contiguous()?.gather(&last_pos, 1)?.squeeze(1)?;

        Ok(score.broadcast_add(&end.index_select(&last_tags, 0)?)?)
    }

    /// Forward variables: `alphas[t]` is (batch, tag_dim); past a sample's end
    /// it keeps the value of the last valid position.
    fn forward_alphas(&self, lattice: &Lattice, start: &Tensor, trans: &Tensor) -> Result<Vec<Tensor>> {
        let Lattice {
            emissions, mask, ..
        } = lattice;

        let mut score = start.broadcast_add(&emissions.i(0)?)?;
        let mut alphas = Vec::with_capacity(lattice.seq_length);
        alphas.push(score.clone());

        for i in 1..lattice.seq_length {
            let broadcast_score = score.unsqueeze(2)?;
            let broadcast_emissions = emissions.i(i)?.unsqueeze(1)?;
            let next_score = broadcast_score
                .broadcast_add(trans)?
                .broadcast_add(&broadcast_emissions)?;

            let next_score = log_sum_exp(&next_score, 1)?;
            let z = mask.i(i)?.unsqueeze(1)?.broadcast_as(next_score.shape())?;
            score = z.where_cond(&next_score, &score)?;
            alphas.push(score.clone());
        }

        Ok(alphas)
    }

    /// Backward variables: `betas[t]` is (batch, tag_dim) and equals the END
    /// scores at and past a sample's last valid position.
    fn backward_betas(&self, lattice: &Lattice, end: &Tensor, trans: &Tensor) -> Result<Vec<Tensor>> {
        let Lattice {
            emissions, mask, ..
        } = lattice;
        let end = end
            .unsqueeze(0)?
            .broadcast_as((lattice.batch_size(), self.config.tag_dim))?
            .contiguous()?;

        let mut beta = end.clone();
        let mut betas = Vec::with_capacity(lattice.seq_length);
        betas.push(beta.clone());

        for i in (0..lattice.seq_length - 1).rev() {
            let ahead = emissions.i(i + 1)?.broadcast_add(&beta)?.unsqueeze(1)?;
            let next_score = trans.unsqueeze(0)?.broadcast_add(&ahead)?;
            let next_score = log_sum_exp(&next_score, 2)?;
            let z = mask.i(i + 1)?.unsqueeze(1)?.broadcast_as(next_score.shape())?;
            beta = z.where_cond(&next_score, &end)?;
            betas.push(beta.clone());
        }

        betas.reverse();
        Ok(betas)
    }

    fn compute_normalizer(&self, lattice: &Lattice) -> Result<Tensor> {
        let (start, end, trans) = self.parts()?;
        let alphas = self.forward_alphas(lattice, &start, &trans)?;
        let last = alphas
            .last()
            .ok_or_else(|| CrfError::shape("emissions have no timestep"))?;
        Ok(log_sum_exp(&last.broadcast_add(&end)?, 1)?)
    }

    /// Replaces the scored pad tag's column of a (batch, tag_dim) Viterbi
    /// score with -inf so no path can pass through it.
    fn exclude_pad(&self, score: &Tensor) -> Result<Tensor> {
        let Some(pad) = self.config.scored_pad() else {
            return Ok(score.clone());
        };
        let keep: Vec<u8> = (0..self.config.tag_dim).map(|j| u8::from(j != pad)).collect();
        let keep = Tensor::from_vec(keep, (1, self.config.tag_dim), score.device())?
            .broadcast_as(score.shape())?;
        let blocked = Tensor::full(f64::NEG_INFINITY, score.shape(), score.device())?
            .to_dtype(score.dtype())?;
        Ok(keep.where_cond(score, &blocked)?)
    }

    fn viterbi_decode(&self, lattice: &Lattice) -> Result<Vec<Vec<u32>>> {
        let Lattice {
            emissions,
            mask,
            lengths,
            seq_length,
        } = lattice;
        let (start, end, trans) = self.parts()?;

        let mut score = self.exclude_pad(&start.broadcast_add(&emissions.i(0)?)?)?;

        let mut history: Vec<Vec<Vec<u32>>> = Vec::with_capacity(*seq_length);
        for i in 1..*seq_length {
            let broadcast_score = score.unsqueeze(2)?;
            let broadcast_emission = emissions.i(i)?.unsqueeze(1)?;
            let next_score = broadcast_score
                .broadcast_add(&trans)?
                .broadcast_add(&broadcast_emission)?;

            let (next_score, indices) = max_indices(&next_score, 1)?;
            let next_score = self.exclude_pad(&next_score)?;

            let z = mask.i(i)?.unsqueeze(1)?.broadcast_as(next_score.shape())?;
            score = z.where_cond(&next_score, &score)?;
            history.push(indices.to_vec2::<u32>()?);
        }

        let best_last = score.broadcast_add(&end)?.argmax(1)?.to_vec1::<u32>()?;

        let best_tags_list = lengths
            .iter()
            .enumerate()
            .map(|(idx, &len)| {
                if len == 0 {
                    return Vec::new();
                }
                let mut best_tags = Vec::with_capacity(len);
                let mut last = best_last[idx];
                best_tags.push(last);
                for hist in history[..len - 1].iter().rev() {
                    last = hist[idx][last as usize];
                    best_tags.push(last);
                }
                best_tags.reverse();
                best_tags
            })
            .collect();

        Ok(best_tags_list)
    }

    /// Most probable tag sequence of every sample, each of its own valid length.
    pub fn decode(&self, emissions: &Tensor, mask: Option<&Tensor>) -> Result<Vec<Vec<u32>>> {
        let (lattice, _) = self.prepare(emissions, None, mask)?;
        tracing::trace!(
            batch_size = lattice.batch_size(),
            seq_length = lattice.seq_length,
            "crf decode"
        );
        if lattice.is_empty() {
            return Ok(vec![Vec::new(); lattice.batch_size()]);
        }
        self.viterbi_decode(&lattice)
    }

    /// Per-sample negative log-likelihood `log_partition - score(tags)`, shape (batch,).
    pub fn compute_loss(
        &self,
        emissions: &Tensor,
        tags: &Tensor,
        mask: Option<&Tensor>,
    ) -> Result<Tensor> {
        let (lattice, tags) = self.prepare(emissions, Some(tags), mask)?;
        self.losses(&lattice, tags.as_ref())
    }

    fn losses(&self, lattice: &Lattice, tags: Option<&Tensor>) -> Result<Tensor> {
        tracing::trace!(
            batch_size = lattice.batch_size(),
            seq_length = lattice.seq_length,
            "crf loss"
        );
        let Some(tags) = tags else {
            return self.zeros_per_sample(lattice);
        };

        let numerator = self.compute_score(lattice, tags)?;
        let denominator = self.compute_normalizer(lattice)?;
        self.zero_empty(lattice, &denominator.broadcast_sub(&numerator)?)
    }

    /// [`compute_loss`](Self::compute_loss) followed by `reduction`.
    pub fn forward(
        &self,
        emissions: &Tensor,
        tags: &Tensor,
        mask: Option<&Tensor>,
        reduction: Reduction,
    ) -> Result<Tensor> {
        let (lattice, tags) = self.prepare(emissions, Some(tags), mask)?;
        let losses = self.losses(&lattice, tags.as_ref())?;

        let reduced = match reduction {
            Reduction::None => losses,
            Reduction::Sum => losses.sum_all()?,
            Reduction::Mean => losses.mean_all()?,
            Reduction::TokenMean => {
                let tokens = token_count(&lattice.lengths, losses.dtype(), losses.device())?;
                losses.sum_all()?.broadcast_div(&tokens)?
            }
        };
        Ok(reduced)
    }

    /// Score of the given paths over each sample's valid positions, shape (batch,).
    pub fn path_score(
        &self,
        emissions: &Tensor,
        tags: &Tensor,
        mask: Option<&Tensor>,
    ) -> Result<Tensor> {
        let (lattice, tags) = self.prepare(emissions, Some(tags), mask)?;
        let Some(tags) = tags else {
            return self.zeros_per_sample(&lattice);
        };
        self.zero_empty(&lattice, &self.compute_score(&lattice, &tags)?)
    }

    /// Log-partition of every sample from the forward recursion, shape (batch,).
    pub fn log_partition(&self, emissions: &Tensor, mask: Option<&Tensor>) -> Result<Tensor> {
        let (lattice, _) = self.prepare(emissions, None, mask)?;
        if lattice.is_empty() {
            return self.zeros_per_sample(&lattice);
        }
        self.zero_empty(&lattice, &self.compute_normalizer(&lattice)?)
    }

    /// Log-partition of every sample from the backward recursion, shape (batch,).
    pub fn backward_log_partition(
        &self,
        emissions: &Tensor,
        mask: Option<&Tensor>,
    ) -> Result<Tensor> {
        let (lattice, _) = self.prepare(emissions, None, mask)?;
        if lattice.is_empty() {
            return self.zeros_per_sample(&lattice);
        }
        let (start, end, trans) = self.parts()?;
        let betas = self.backward_betas(&lattice, &end, &trans)?;
        let first = start
            .broadcast_add(&lattice.emissions.i(0)?)?
            .broadcast_add(&betas[0])?;
        self.zero_empty(&lattice, &log_sum_exp(&first, 1)?)
    }

    /// Posterior probability of each tag at each position, in the caller's
    /// layout with tag_dim as the last dimension. Padded positions are zero.
    pub fn marginals(&self, emissions: &Tensor, mask: Option<&Tensor>) -> Result<Tensor> {
        let (lattice, _) = self.prepare(emissions, None, mask)?;
        if lattice.is_empty() {
            return Ok(emissions.zeros_like()?);
        }
        let (start, end, trans) = self.parts()?;
        let alphas = self.forward_alphas(&lattice, &start, &trans)?;
        let betas = self.backward_betas(&lattice, &end, &trans)?;
        let log_z = log_sum_exp(&alphas[lattice.seq_length - 1].broadcast_add(&end)?, 1)?
            .unsqueeze(1)?;

        let per_step = alphas
            .iter()
            .zip(betas.iter())
            .enumerate()
            .map(|(t, (alpha, beta))| {
                let p = alpha.broadcast_add(beta)?.broadcast_sub(&log_z)?.exp()?;
                lattice
                    .mask
                    .i(t)?
                    .unsqueeze(1)?
                    .broadcast_as(p.shape())?
                    .where_cond(&p, &p.zeros_like()?)
            })
            .collect::<candle_core::Result<Vec<_>>>()?;

        let marginals = Tensor::stack(&per_step, 0)?;
        if self.batch_first() {
            Ok(marginals.transpose(0, 1)?.contiguous()?)
        } else {
            Ok(marginals)
        }
    }
}

// -----------------------------------------------------------------------------
