//! Analytic gradient of the CRF log-likelihood.
//!
//! Gradients are *observed minus expected*: they point uphill on the
//! log-likelihood. A minimizing optimizer wants [`CrfGradients::negated`].

use crate::error::{CrfError, Result};
use crate::forward_backward::{impossible, ForwardBackward};
use crate::util::{first_non_finite, one_hot, to_vec1_f64};
use candle_core::{DType, Device, IndexOp, Tensor};

/// Gradients of the reduced log-likelihood.
#[derive(Debug, Clone)]
pub struct CrfGradients {
    /// Same shape and layout as the emissions handed to the CRF.
    pub emissions: Tensor,
    /// `[num_tags, num_tags]`
    pub transitions: Tensor,
}

impl CrfGradients {
    /// Add `other` in place, e.g. to reduce per-worker partial gradients of
    /// one batch before the transitions are updated.
    pub fn accumulate(&mut self, other: &CrfGradients) -> Result<()> {
        if self.transitions.shape() != other.transitions.shape() {
            return Err(CrfError::shape(format!(
                "cannot accumulate transition gradients of shape {:?} into {:?}",
                other.transitions.dims(),
                self.transitions.dims()
            )));
        }
        if self.emissions.shape() != other.emissions.shape() {
            return Err(CrfError::shape(format!(
                "cannot accumulate emission gradients of shape {:?} into {:?}",
                other.emissions.dims(),
                self.emissions.dims()
            )));
        }
        self.transitions = self.transitions.add(&other.transitions)?;
        self.emissions = self.emissions.add(&other.emissions)?;
        Ok(())
    }

    /// Gradients of the negative log-likelihood.
    pub fn negated(&self) -> Result<Self> {
        Ok(Self {
            emissions: self.emissions.neg()?,
            transitions: self.transitions.neg()?,
        })
    }
}

/// `n`-vector with a one at `index`.
fn indicator(n: usize, index: usize, dtype: DType, device: &Device) -> Result<Tensor> {
    let mut data = vec![0f32; n];
    data[index] = 1.0;
    Ok(Tensor::from_vec(data, n, device)?.to_dtype(dtype)?)
}

/// Fail on the first example of `x`, `[batch, ...]`, holding NaN or infinity.
fn check_step(x: &Tensor, step: usize) -> Result<()> {
    let totals = x.flatten_from(1)?.sum(1)?;
    match first_non_finite(&to_vec1_f64(&totals)?) {
        Some(example) => Err(CrfError::NonFinite {
            example,
            step,
            stage: "gradient",
        }),
        None => Ok(()),
    }
}

pub(crate) fn compute(pass: &ForwardBackward) -> Result<CrfGradients> {
    let batch = pass.batch();
    let transitions = pass.transitions();
    let lattice = pass.lattice();
    let (seq_length, _, num_tags) = batch.emissions().dims3()?;
    let dtype = batch.dtype();
    let device = batch.device();
    let scale = pass.scale(pass.reduction());
    let check_finite = pass.check_finite();

    let mask = batch.float_mask(dtype)?;
    let observed = one_hot(pass.gold(), num_tags, dtype)?.broadcast_mul(&mask.unsqueeze(2)?)?;
    let expected = lattice.marginals(batch)?;
    // [time, batch, tags]
    let unary = observed.sub(&expected)?;
    if check_finite {
        for t in 0..seq_length {
            check_step(&unary.i(t)?, t)?;
        }
    }

    let emissions = batch.to_caller_layout(unary.affine(scale, 0.)?)?;

    // leaving start at step 0, entering stop after the last real step
    let start_row = unary.i(0)?.sum(0)?;
    let stop_column = unary
        .broadcast_mul(&batch.last_step_mask(dtype)?.unsqueeze(2)?)?
        .sum((0, 1))?;
    let start = indicator(num_tags, transitions.start_tag(), dtype, device)?;
    let stop = indicator(num_tags, transitions.stop_tag(), dtype, device)?;
    let mut pairwise = start
        .unsqueeze(1)?
        .broadcast_mul(&start_row.unsqueeze(0)?)?
        .add(&stop_column.unsqueeze(1)?.broadcast_mul(&stop.unsqueeze(0)?)?)?;

    let matrix = transitions.matrix();
    let log_z = lattice.log_partition().unsqueeze(1)?.unsqueeze(2)?;
    for t in 1..seq_length {
        // gold transition counts, outer product of consecutive one-hot rows
        let prev = observed.i(t - 1)?.unsqueeze(2)?;
        let next = observed.i(t)?.unsqueeze(1)?;
        let counts = prev.broadcast_mul(&next)?.sum(0)?;

        // expected transition counts:
        // exp(alpha[t-1][i] + matrix[i][j] + emission[t][j] + beta[t][j] - log_z)
        let arriving = batch
            .emissions_at(t)?
            .add(&lattice.beta().i(t)?)?
            .unsqueeze(1)?;
        let exponent = lattice
            .alpha()
            .i(t - 1)?
            .unsqueeze(2)?
            .broadcast_add(matrix)?
            .broadcast_add(&arriving)?
            .broadcast_sub(&log_z)?;
        // padded steps are masked before exp so they can never overflow
        let real = batch
            .mask_at(t)?
            .unsqueeze(1)?
            .unsqueeze(2)?
            .broadcast_as(exponent.shape())?;
        // [batch, tags, tags]
        let usage = real.where_cond(&exponent, &impossible(&exponent)?)?.exp()?;
        if check_finite {
            check_step(&usage, t)?;
        }

        pairwise = pairwise.add(&counts.sub(&usage.sum(0)?)?)?;
    }

    Ok(CrfGradients {
        emissions,
        transitions: pairwise.affine(scale, 0.)?,
    })
}
