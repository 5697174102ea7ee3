//! Forward-backward algorithm in log space.
//!
//! `alpha[t][b][j]` is the log-sum of the scores of every prefix of example
//! `b` that ends in tag `j` at step `t`, emission at `t` included.
//! `beta[t][b][i]` is the log-sum of every suffix leaving tag `i` at step `t`,
//! emission at `t` excluded, stop transition included. The log-partition is
//! `logsumexp_j(alpha[t][b][j] + beta[t][b][j])` for any real step `t`.

use crate::config::Reduction;
use crate::error::{CrfError, Result};
use crate::gradient::{self, CrfGradients};
use crate::scores::ScoreBatch;
use crate::transitions::Transitions;
use crate::util::{first_non_finite, to_vec1_f64};
use candle_core::{IndexOp, Tensor};

/// Alpha, beta and log-partition of one batch.
#[derive(Debug, Clone)]
pub struct Lattice {
    /// `[time, batch, tags]`
    alpha: Tensor,
    /// `[time, batch, tags]`
    beta: Tensor,
    /// `[batch]`, zero for empty examples.
    log_z: Tensor,
}

impl Lattice {
    pub(crate) fn compute(
        transitions: &Transitions,
        batch: &ScoreBatch,
        check_finite: bool,
    ) -> Result<Self> {
        let (alpha, log_z) = forward_pass(transitions, batch)?;
        if check_finite {
            check_log_partition(&log_z, &alpha, batch)?;
        }
        let beta = backward_pass(transitions, batch)?;
        Ok(Self { alpha, beta, log_z })
    }

    pub fn alpha(&self) -> &Tensor {
        &self.alpha
    }

    pub fn beta(&self) -> &Tensor {
        &self.beta
    }

    pub fn log_partition(&self) -> &Tensor {
        &self.log_z
    }

    /// `P(tag_t = j)`, `[time, batch, tags]`, zero at padded steps.
    pub fn marginals(&self, batch: &ScoreBatch) -> Result<Tensor> {
        let log_z = self.log_z.unsqueeze(0)?.unsqueeze(2)?;
        let log_marginals = self.alpha.add(&self.beta)?.broadcast_sub(&log_z)?;
        // padded steps are masked in log space so exp never sees inf there
        let mask = batch.mask().unsqueeze(2)?.broadcast_as(log_marginals.shape())?;
        Ok(mask
            .where_cond(&log_marginals, &impossible(&log_marginals)?)?
            .exp()?)
    }
}

/// `-inf` shaped like `x`, the log of a zero probability.
pub(crate) fn impossible(x: &Tensor) -> Result<Tensor> {
    Ok(Tensor::full(f64::NEG_INFINITY, x.shape(), x.device())?.to_dtype(x.dtype())?)
}

/// Alpha for every step, `[time, batch, tags]`, and the log-partition.
///
/// Past the end of an example alpha keeps its last real value, so the final
/// row holds the last real alpha of every example.
pub(crate) fn forward_pass(transitions: &Transitions, batch: &ScoreBatch) -> Result<(Tensor, Tensor)> {
    let matrix = transitions.matrix();
    let seq_length = batch.seq_len();

    let mut score = transitions
        .start_scores()?
        .broadcast_add(&batch.emissions_at(0)?)?;
    let mut alphas = Vec::with_capacity(seq_length);
    alphas.push(score.clone());

    for i in 1..seq_length {
        let broadcast_score = score.unsqueeze(2)?;

        let broadcast_emissions = batch.emissions_at(i)?.unsqueeze(1)?;
        let next_score = broadcast_score
            .broadcast_add(matrix)?
            .broadcast_add(&broadcast_emissions)?;

        let next_score = next_score.log_sum_exp(1)?;
        let z = batch
            .mask_at(i)?
            .unsqueeze(1)?
            .broadcast_as(next_score.shape())?;
        score = z.where_cond(&next_score, &score)?;
        alphas.push(score.clone());
    }

    let log_z = score
        .broadcast_add(&transitions.stop_scores()?)?
        .log_sum_exp(1)?;
    let non_empty = batch.mask_at(0)?;
    let log_z = non_empty.where_cond(&log_z, &log_z.zeros_like()?)?;

    Ok((Tensor::stack(&alphas, 0)?, log_z))
}

/// Beta for every step, `[time, batch, tags]`.
///
/// The last real step of an example, and every padded step, holds the stop
/// transitions.
pub(crate) fn backward_pass(transitions: &Transitions, batch: &ScoreBatch) -> Result<Tensor> {
    let matrix = transitions.matrix();
    let seq_length = batch.seq_len();
    let end = transitions
        .stop_scores()?
        .unsqueeze(0)?
        .broadcast_as((batch.batch_size(), batch.num_tags()))?
        .contiguous()?;

    let mut betas = vec![end.clone(); seq_length];
    let mut score = end.clone();
    for i in (0..seq_length.saturating_sub(1)).rev() {
        let broadcast_next = batch
            .emissions_at(i + 1)?
            .add(&score)?
            .unsqueeze(1)?;
        let prev_score = broadcast_next.broadcast_add(matrix)?.log_sum_exp(2)?;

        let z = batch
            .mask_at(i + 1)?
            .unsqueeze(1)?
            .broadcast_as(prev_score.shape())?;
        score = z.where_cond(&prev_score, &end)?;
        betas[i] = score.clone();
    }

    Ok(Tensor::stack(&betas, 0)?)
}

/// Score of the gold path of every example, `[batch]`; zero for empty ones.
///
/// `gold` is time-major `[time, batch]` i64 as returned by
/// [`ScoreBatch::gold_tags`].
pub(crate) fn gold_score(transitions: &Transitions, batch: &ScoreBatch, gold: &Tensor) -> Result<Tensor> {
    let (seq_length, batch_size, _) = batch.emissions().dims3()?;
    let mask = batch.float_mask(batch.dtype())?;

    let emitted = batch
        .emissions()
        .gather(&gold.unsqueeze(2)?.contiguous()?, 2)?
        .squeeze(2)?;
    let mut score = emitted.mul(&mask)?.sum(0)?;

    let start = transitions.start_scores()?.index_select(&gold.i(0)?, 0)?;
    score = score.add(&start.mul(&mask.i(0)?)?)?;

    if seq_length > 1 {
        // row of the previous tag, column of the next one
        let prev = gold.i(..seq_length - 1)?.contiguous()?.flatten_all()?;
        let next = gold.i(1..)?.contiguous()?.flatten_all()?.unsqueeze(1)?;
        let pairs = transitions
            .matrix()
            .index_select(&prev, 0)?
            .gather(&next, 1)?
            .reshape((seq_length - 1, batch_size))?;
        score = score.add(&pairs.mul(&mask.i(1..)?)?.sum(0)?)?;
    }

    let end = transitions
        .stop_scores()?
        .index_select(&gold.contiguous()?.flatten_all()?, 0)?
        .reshape((seq_length, batch_size))?;
    Ok(score.add(&end.mul(&batch.last_step_mask(batch.dtype())?)?.sum(0)?)?)
}

/// Reduce per-example log-likelihoods `[batch]`.
pub(crate) fn reduce(llh: Tensor, reduction: Reduction, batch: &ScoreBatch) -> Result<Tensor> {
    match reduction {
        Reduction::None => Ok(llh),
        reduction => {
            let scale = reduction.scale(batch.num_included(), batch.num_tokens());
            Ok(llh.sum_all()?.affine(scale, 0.)?)
        }
    }
}

/// Report the first example whose log-partition is NaN or infinite, with the
/// first step where its alpha went bad.
pub(crate) fn check_log_partition(log_z: &Tensor, alpha: &Tensor, batch: &ScoreBatch) -> Result<()> {
    let values = to_vec1_f64(log_z)?;
    let Some(example) = first_non_finite(&values) else {
        return Ok(());
    };
    let length = batch.lengths()[example].max(1);
    for step in 0..length {
        let row = to_vec1_f64(&alpha.i((step, example))?)?;
        if first_non_finite(&row).is_some() {
            return Err(CrfError::NonFinite {
                example,
                step,
                stage: "forward",
            });
        }
    }
    Err(CrfError::NonFinite {
        example,
        step: length - 1,
        stage: "forward",
    })
}

/// Batch-scoped training pass: the log-likelihood of the gold paths and the
/// lattice needed to differentiate it.
///
/// Dropped, or consumed by [`ForwardBackward::gradients`], once the batch is
/// done; nothing outlives it.
#[derive(Debug)]
pub struct ForwardBackward {
    batch: ScoreBatch,
    transitions: Transitions,
    gold: Tensor,
    gold_score: Tensor,
    lattice: Lattice,
    reduction: Reduction,
    check_finite: bool,
}

impl ForwardBackward {
    pub(crate) fn run(
        transitions: &Transitions,
        batch: ScoreBatch,
        gold: Tensor,
        reduction: Reduction,
        check_finite: bool,
    ) -> Result<Self> {
        let lattice = Lattice::compute(transitions, &batch, check_finite)?;
        let gold_score = gold_score(transitions, &batch, &gold)?;
        Ok(Self {
            batch,
            transitions: transitions.clone(),
            gold,
            gold_score,
            lattice,
            reduction,
            check_finite,
        })
    }

    /// `gold_score - log_z` per example, `[batch]`; zero for empty and
    /// excluded examples.
    pub fn per_example(&self) -> Result<Tensor> {
        Ok(self.gold_score.sub(self.lattice.log_partition())?)
    }

    /// Log-likelihood reduced as requested; `[batch]` for [`Reduction::None`],
    /// a scalar otherwise.
    pub fn reduced(&self) -> Result<Tensor> {
        reduce(self.per_example()?, self.reduction, &self.batch)
    }

    /// Reduced log-likelihood as a number. [`Reduction::None`] sums.
    pub fn value(&self) -> Result<f64> {
        let reduced = self.reduced()?.sum_all()?;
        Ok(reduced.to_dtype(candle_core::DType::F64)?.to_scalar::<f64>()?)
    }

    /// Tag marginals in the caller's layout.
    pub fn marginals(&self) -> Result<Tensor> {
        self.batch
            .to_caller_layout(self.lattice.marginals(&self.batch)?)
    }

    /// Examples excluded by the malformed-example policy.
    pub fn skipped(&self) -> &[usize] {
        self.batch.skipped()
    }

    pub fn gold_score(&self) -> &Tensor {
        &self.gold_score
    }

    pub fn lattice(&self) -> &Lattice {
        &self.lattice
    }

    pub fn reduction(&self) -> Reduction {
        self.reduction
    }

    /// Gradients of the reduced log-likelihood, consuming the pass.
    pub fn gradients(self) -> Result<CrfGradients> {
        gradient::compute(&self)
    }

    pub(crate) fn batch(&self) -> &ScoreBatch {
        &self.batch
    }

    pub(crate) fn transitions(&self) -> &Transitions {
        &self.transitions
    }

    pub(crate) fn gold(&self) -> &Tensor {
        &self.gold
    }

    pub(crate) fn check_finite(&self) -> bool {
        self.check_finite
    }

    pub(crate) fn scale(&self, reduction: Reduction) -> f64 {
        reduction.scale(self.batch.num_included(), self.batch.num_tokens())
    }
}
