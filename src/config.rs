use crate::error::{CrfError, Result};
use serde::{Deserialize, Serialize};

/// Score given to transitions that may never happen: into the start tag and
/// out of the stop tag.
pub const FORBIDDEN_SCORE: f64 = -10000.0;

/// Reduction Type
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
pub enum Reduction {
    /// Per-example log-likelihoods, shape `[batch]`.
    None,
    Sum,
    /// Mean over the examples that were not excluded.
    #[default]
    Mean,
    /// Sum divided by the number of real tokens.
    TokenMean,
}

impl Reduction {
    /// Factor applied to the summed log-likelihood, and to its gradient.
    /// `None` and `Sum` both differentiate the plain sum.
    pub(crate) fn scale(&self, examples: usize, tokens: usize) -> f64 {
        let denom = match self {
            Reduction::None | Reduction::Sum => 1,
            Reduction::Mean => examples,
            Reduction::TokenMean => tokens,
        };
        if denom == 0 {
            0.0
        } else {
            1.0 / denom as f64
        }
    }
}

/// What to do with an example whose mask or gold path is inconsistent.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum MalformedPolicy {
    /// Fail the whole batch.
    #[default]
    Abort,
    /// Warn, exclude the example and carry on with the rest.
    Skip,
}

/// CRF layer configuration.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CrfConfig {
    /// Total number of tags, the start and stop pseudo-tags included.
    pub num_tags: usize,
    /// Defaults to `num_tags - 2`.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub start_tag: Option<usize>,
    /// Defaults to `num_tags - 1`.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub stop_tag: Option<usize>,
    /// Inputs are `[batch, time, ..]` when set, `[time, batch, ..]` otherwise.
    #[serde(default = "default_batch_first")]
    pub batch_first: bool,
    /// Transition noise is drawn from `[-init_range, init_range]`.
    #[serde(default = "default_init_range")]
    pub init_range: f64,
    #[serde(default = "default_forbidden_score")]
    pub forbidden_score: f64,
    #[serde(default)]
    pub malformed: MalformedPolicy,
    /// Report NaN/Inf in the log-partition and Viterbi scores.
    #[serde(default = "default_check_finite")]
    pub check_finite: bool,
}

fn default_batch_first() -> bool {
    true
}

fn default_init_range() -> f64 {
    0.1
}

fn default_forbidden_score() -> f64 {
    FORBIDDEN_SCORE
}

fn default_check_finite() -> bool {
    true
}

impl CrfConfig {
    /// Config with the pseudo-tags in the two last slots.
    pub fn new(num_tags: usize) -> Self {
        Self {
            num_tags,
            start_tag: None,
            stop_tag: None,
            batch_first: default_batch_first(),
            init_range: default_init_range(),
            forbidden_score: default_forbidden_score(),
            malformed: MalformedPolicy::Abort,
            check_finite: default_check_finite(),
        }
    }

    pub fn start_tag(&self) -> usize {
        self.start_tag.unwrap_or(self.num_tags.saturating_sub(2))
    }

    pub fn stop_tag(&self) -> usize {
        self.stop_tag.unwrap_or(self.num_tags.saturating_sub(1))
    }

    pub fn with_batch_first(mut self, batch_first: bool) -> Self {
        self.batch_first = batch_first;
        self
    }

    pub fn with_malformed(mut self, malformed: MalformedPolicy) -> Self {
        self.malformed = malformed;
        self
    }

    pub fn with_pseudo_tags(mut self, start_tag: usize, stop_tag: usize) -> Self {
        self.start_tag = Some(start_tag);
        self.stop_tag = Some(stop_tag);
        self
    }

    /// Number of tags that can appear in a decoded path.
    pub fn num_real_tags(&self) -> usize {
        self.num_tags.saturating_sub(2)
    }

    pub fn validate(&self) -> Result<()> {
        if self.num_tags < 3 {
            return Err(CrfError::invalid_config(format!(
                "num_tags must be at least 3 (start and stop included), got {}",
                self.num_tags
            )));
        }
        let (start, stop) = (self.start_tag(), self.stop_tag());
        if start >= self.num_tags || stop >= self.num_tags {
            return Err(CrfError::invalid_config(format!(
                "start_tag {} and stop_tag {} must be below num_tags {}",
                start, stop, self.num_tags
            )));
        }
        if start == stop {
            return Err(CrfError::invalid_config(
                "start_tag and stop_tag must differ",
            ));
        }
        if !(self.init_range.is_finite() && self.init_range >= 0.0) {
            return Err(CrfError::invalid_config(format!(
                "init_range must be finite and non-negative, got {}",
                self.init_range
            )));
        }
        if !(self.forbidden_score.is_finite() && self.forbidden_score < 0.0) {
            return Err(CrfError::invalid_config(format!(
                "forbidden_score must be finite and negative, got {}",
                self.forbidden_score
            )));
        }
        Ok(())
    }
}
