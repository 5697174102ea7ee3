//! Linear-chain CRF output layer for BiLSTM-CRF sequence labelers, on candle.
//!
//! The emission scores come from an upstream encoder, `[batch, time, tags]`
//! (or time-major). The tag set includes a start and a stop pseudo-tag whose
//! scores live in the transition matrix.

mod config;
mod error;
mod forward_backward;
mod gradient;
mod scores;
mod transitions;
mod util;
mod viterbi;

#[cfg(test)]
mod testing;

pub use config::{CrfConfig, MalformedPolicy, Reduction, FORBIDDEN_SCORE};
pub use error::{CrfError, Result};
pub use forward_backward::{ForwardBackward, Lattice};
pub use gradient::CrfGradients;
pub use scores::ScoreBatch;
pub use transitions::{Transitions, TRANSITIONS};
pub use viterbi::DecodedPath;

use candle_core::{DType, Device, Tensor};
use candle_nn::VarBuilder;
use forward_backward::{check_log_partition, forward_pass, gold_score, reduce};
use std::fmt::Display;

// -----------------------------------------------------------------------------

/// CRF
/// https://github.com/kmkurn/pytorch-crf/blob/623e3402d00a2728e99d6e8486010d67c754267b/torchcrf/__init__.py#L9
#[derive(Debug, Clone)]
pub struct CRF {
    config: CrfConfig,
    transitions: Transitions,
}

impl Display for CRF {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(
            f,
            "CRF(num_tags: {}, start_tag: {}, stop_tag: {}, batch_first: {})",
            self.config.num_tags,
            self.config.start_tag(),
            self.config.stop_tag(),
            self.config.batch_first
        )
    }
}

fn check_dtype(dtype: DType) -> Result<()> {
    use DType::*;
    match dtype {
        #[cfg(any(feature = "cuda", feature = "metal"))]
        F32 | F64 => Ok(()),
        #[cfg(not(any(feature = "cuda", feature = "metal")))]
        BF16 | F16 | F32 | F64 => Ok(()),
        _ => Err(candle_core::Error::UnsupportedDTypeForOp(dtype, "unsupported dtype").into()),
    }
}

impl CRF {
    /// Create a new CRF with F32 transitions.
    pub fn new(config: CrfConfig, device: &Device) -> Result<Self> {
        Self::new_with_dtype(config, DType::F32, device)
    }

    pub fn new_with_dtype(config: CrfConfig, dtype: DType, device: &Device) -> Result<Self> {
        check_dtype(dtype)?;
        config.validate()?;
        let transitions = Transitions::new(&config, dtype, device)?;
        Ok(Self {
            config,
            transitions,
        })
    }

    /// Load the transition matrix from `vb`, under [`TRANSITIONS`].
    pub fn load(config: CrfConfig, vb: VarBuilder) -> Result<Self> {
        check_dtype(vb.dtype())?;
        config.validate()?;
        let transitions = Transitions::load(&config, vb)?;
        Ok(Self {
            config,
            transitions,
        })
    }

    /// Wrap an existing matrix, e.g. a `candle_core::Var` being trained, as is.
    pub fn from_transitions(config: CrfConfig, matrix: Tensor) -> Result<Self> {
        check_dtype(matrix.dtype())?;
        config.validate()?;
        let transitions = Transitions::from_tensor(matrix, &config)?;
        Ok(Self {
            config,
            transitions,
        })
    }

    fn batch(&self, emissions: &Tensor, mask: Option<&Tensor>) -> Result<ScoreBatch> {
        if emissions.dtype() != self.transitions.dtype() {
            return Err(CrfError::DType(format!(
                "emissions must be of type {:?}, got {:?}",
                self.transitions.dtype(),
                emissions.dtype()
            )));
        }
        ScoreBatch::new(emissions, mask, &self.config)
    }

    /// Reduced log-likelihood of the gold `tags`, differentiable through
    /// candle autograd.
    /// https://github.com/kmkurn/pytorch-crf/blob/623e3402d00a2728e99d6e8486010d67c754267b/torchcrf/__init__.py#L63
    pub fn forward(
        &self,
        emissions: &Tensor,
        tags: &Tensor,
        mask: Option<&Tensor>,
        reduction: Reduction,
    ) -> Result<Tensor> {
        let batch = self.batch(emissions, mask)?;
        let gold = batch.gold_tags(tags)?;

        let (alpha, log_z) = forward_pass(&self.transitions, &batch)?;
        if self.config.check_finite {
            check_log_partition(&log_z, &alpha, &batch)?;
        }
        let numerator = gold_score(&self.transitions, &batch, &gold)?;
        reduce(numerator.sub(&log_z)?, reduction, &batch)
    }

    /// Training pass over gold `tags` that keeps the forward-backward lattice
    /// for [`ForwardBackward::gradients`] and [`ForwardBackward::marginals`].
    pub fn log_likelihood(
        &self,
        emissions: &Tensor,
        tags: &Tensor,
        mask: Option<&Tensor>,
        reduction: Reduction,
    ) -> Result<ForwardBackward> {
        let batch = self.batch(emissions, mask)?;
        let gold = batch.gold_tags(tags)?;
        ForwardBackward::run(
            &self.transitions,
            batch,
            gold,
            reduction,
            self.config.check_finite,
        )
    }

    /// Like [`CRF::log_likelihood`] with one gold path per example.
    ///
    /// Under [`MalformedPolicy::Skip`] an example whose path length disagrees
    /// with its mask is left out and listed by [`ForwardBackward::skipped`].
    pub fn log_likelihood_paths(
        &self,
        emissions: &Tensor,
        paths: &[Vec<u32>],
        mask: Option<&Tensor>,
        reduction: Reduction,
    ) -> Result<ForwardBackward> {
        let mut batch = self.batch(emissions, mask)?;
        let gold = batch.gold_from_paths(paths)?;
        ForwardBackward::run(
            &self.transitions,
            batch,
            gold,
            reduction,
            self.config.check_finite,
        )
    }

    /// Log-partition of every example, `[batch]`.
    pub fn log_partition(&self, emissions: &Tensor, mask: Option<&Tensor>) -> Result<Tensor> {
        let batch = self.batch(emissions, mask)?;
        let (alpha, log_z) = forward_pass(&self.transitions, &batch)?;
        if self.config.check_finite {
            check_log_partition(&log_z, &alpha, &batch)?;
        }
        Ok(log_z)
    }

    /// Tag marginals in the layout of `emissions`, zero at padded steps.
    pub fn marginals(&self, emissions: &Tensor, mask: Option<&Tensor>) -> Result<Tensor> {
        let batch = self.batch(emissions, mask)?;
        let lattice = Lattice::compute(&self.transitions, &batch, self.config.check_finite)?;
        batch.to_caller_layout(lattice.marginals(&batch)?)
    }

    /// decode
    /// https://github.com/kmkurn/pytorch-crf/blob/623e3402d00a2728e99d6e8486010d67c754267b/torchcrf/__init__.py#L118
    pub fn decode(&self, emissions: &Tensor, mask: Option<&Tensor>) -> Result<Vec<Vec<u32>>> {
        Ok(self
            .decode_scored(emissions, mask)?
            .into_iter()
            .map(|path| path.tags)
            .collect())
    }

    /// Best paths with their unnormalized scores.
    pub fn decode_scored(
        &self,
        emissions: &Tensor,
        mask: Option<&Tensor>,
    ) -> Result<Vec<DecodedPath>> {
        let batch = self.batch(emissions, mask)?;
        viterbi::viterbi_decode(
            &self.transitions,
            &batch,
            self.config.forbidden_score,
            self.config.check_finite,
        )
    }

    pub fn transitions(&self) -> &Transitions {
        &self.transitions
    }

    pub fn transitions_mut(&mut self) -> &mut Transitions {
        &mut self.transitions
    }

    pub fn config(&self) -> &CrfConfig {
        &self.config
    }

    pub fn num_tags(&self) -> usize {
        self.config.num_tags
    }
}

// -----------------------------------------------------------------------------
