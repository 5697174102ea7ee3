//! Emission scores, masks and gold tags as the dynamic programs see them.
//!
//! [`ScoreBatch`] owns a time-major `[time, batch, tags]` view of the
//! emissions and a `[time, batch]` mask, whatever layout the caller uses, and
//! keeps the real length of every example on the host.

use crate::config::{CrfConfig, MalformedPolicy};
use crate::error::{CrfError, Result};
use candle_core::{DType, Device, IndexOp, Tensor};

#[derive(Debug, Clone)]
pub struct ScoreBatch {
    emissions: Tensor,
    mask: Tensor,
    lengths: Vec<usize>,
    skipped: Vec<usize>,
    num_tags: usize,
    batch_first: bool,
    malformed: MalformedPolicy,
}

impl ScoreBatch {
    /// Wrap `emissions` (and `mask`, all-on when absent) in the layout given
    /// by `config.batch_first`.
    ///
    /// Rank, size and dtype mismatches are errors. A mask row that is not a
    /// contiguous prefix fails the batch under [`MalformedPolicy::Abort`]; under
    /// [`MalformedPolicy::Skip`] the example is excluded and reported by
    /// [`ScoreBatch::skipped`].
    pub fn new(emissions: &Tensor, mask: Option<&Tensor>, config: &CrfConfig) -> Result<Self> {
        {
            // check if the tensor has 3 dimensions
            let dims = emissions.dims().len();
            if dims != 3 {
                return Err(CrfError::shape(format!(
                    "emissions must have 3 dimensions, got {}",
                    dims
                )));
            }
        }

        let (d1, d2, d3) = emissions.dims3()?;
        if d3 != config.num_tags {
            return Err(CrfError::shape(format!(
                "expected last dimension of emissions is {}, got {}",
                config.num_tags, d3
            )));
        }

        let (batch_size, seq_len) = if config.batch_first {
            (d1, d2)
        } else {
            (d2, d1)
        };
        if batch_size == 0 {
            return Err(CrfError::EmptyBatch);
        }
        if seq_len == 0 {
            return Err(CrfError::shape("emissions must have at least one timestep"));
        }

        let mask = match mask {
            Some(mask) => {
                if mask.dtype() != DType::U8 {
                    return Err(CrfError::DType("mask must be of type u8".to_string()));
                }
                if mask.dims().len() != 2 {
                    // check if the tensor has 2 dimensions
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
                mask.clone()
            }
            None => Tensor::ones((d1, d2), DType::U8, emissions.device())?,
        };

        let (emissions, mask) = if config.batch_first {
            (emissions.transpose(0, 1)?, mask.transpose(0, 1)?)
        } else {
            (emissions.clone(), mask)
        };

        log::debug!(
            "crf batch: {} examples, {} steps, {} tags",
            batch_size,
            seq_len,
            config.num_tags
        );

        let mut batch = Self {
            emissions: emissions.contiguous()?,
            mask: mask.contiguous()?,
            lengths: Vec::with_capacity(batch_size),
            skipped: vec![],
            num_tags: config.num_tags,
            batch_first: config.batch_first,
            malformed: config.malformed,
        };
        batch.scan_mask()?;
        batch.zero_padding()?;
        Ok(batch)
    }

    /// Padded emissions never reach a score, but NaN there would survive a
    /// multiplication by a zero mask.
    fn zero_padding(&mut self) -> Result<()> {
        let mask = self
            .mask
            .unsqueeze(2)?
            .broadcast_as(self.emissions.shape())?;
        self.emissions = mask.where_cond(&self.emissions, &self.emissions.zeros_like()?)?;
        Ok(())
    }

    /// Derive real lengths and check every mask row is `1..1 0..0` made of
    /// zeros and ones only.
    fn scan_mask(&mut self) -> Result<()> {
        // [batch, time]
        let mut rows = self.mask.t()?.to_vec2::<u8>()?;
        let mut malformed = vec![];
        for (example, row) in rows.iter().enumerate() {
            if let Some((step, &value)) = row.iter().enumerate().find(|(_, &m)| m > 1) {
                malformed.push(CrfError::InvalidMask {
                    example,
                    step,
                    value,
                });
            }
            let length = row.iter().take_while(|&&m| m != 0).count();
            if row[length..].iter().any(|&m| m != 0) {
                malformed.push(CrfError::NonContiguousMask { example });
            }
            self.lengths.push(length);
        }

        for err in malformed {
            if let Some(example) = err.example() {
                self.exclude(err, example, &mut rows)?;
            }
        }
        if !self.skipped.is_empty() {
            self.rebuild_mask(&rows)?;
        }
        Ok(())
    }

    /// Apply the malformed-example policy to `example`.
    fn exclude(&mut self, err: CrfError, example: usize, rows: &mut [Vec<u8>]) -> Result<()> {
        if !err.is_data_inconsistency() {
            return Err(err);
        }
        match self.malformed {
            MalformedPolicy::Abort => Err(err),
            MalformedPolicy::Skip => {
                log::warn!("excluding example {} from crf batch: {}", example, err);
                rows[example].iter_mut().for_each(|m| *m = 0);
                self.lengths[example] = 0;
                if !self.skipped.contains(&example) {
                    self.skipped.push(example);
                    self.skipped.sort_unstable();
                }
                Ok(())
            }
        }
    }

    fn rebuild_mask(&mut self, rows: &[Vec<u8>]) -> Result<()> {
        let seq_len = self.seq_len();
        let data: Vec<u8> = rows.iter().flatten().copied().collect();
        self.mask = Tensor::from_vec(data, (self.batch_size(), seq_len), self.device())?
            .t()?
            .contiguous()?;
        self.zero_padding()
    }

    /// Check gold `tags` in the caller's layout and return them time-major,
    /// `[time, batch]` i64, with padded positions zeroed.
    pub fn gold_tags(&self, tags: &Tensor) -> Result<Tensor> {
        if tags.dtype() != DType::I64 {
            return Err(CrfError::DType("tags must be of type i64".to_string()));
        }
        if tags.dims().len() != 2 {
            // check if the tensor has 2 dimensions
            return Err(CrfError::shape(format!(
                "tags must have 2 dimensions, got {}",
                tags.dims().len()
            )));
        }

        let (tag_d1, tag_d2) = tags.dims2()?;
        let (d1, d2) = self.caller_dims();
        if (d1, d2) != (tag_d1, tag_d2) {
            return Err(CrfError::shape(format!(
                "the first two dimensions of emissions and tags must match, got ({}, {}) and ({}, {})",
                d1, d2, tag_d1, tag_d2
            )));
        }

        // [batch, time]
        let rows = if self.batch_first {
            tags.to_vec2::<i64>()?
        } else {
            tags.t()?.to_vec2::<i64>()?
        };
        let mut data = vec![0i64; self.seq_len() * self.batch_size()];
        for (example, row) in rows.iter().enumerate() {
            for (step, &tag) in row.iter().take(self.lengths[example]).enumerate() {
                self.check_tag(example, step, tag)?;
                data[step * self.batch_size() + example] = tag;
            }
        }
        Ok(Tensor::from_vec(
            data,
            (self.seq_len(), self.batch_size()),
            self.device(),
        )?)
    }

    /// Gold tags from one path per example. A path whose length disagrees
    /// with the mask goes through the malformed-example policy.
    pub fn gold_from_paths(&mut self, paths: &[Vec<u32>]) -> Result<Tensor> {
        if paths.len() != self.batch_size() {
            return Err(CrfError::shape(format!(
                "expected {} gold paths, got {}",
                self.batch_size(),
                paths.len()
            )));
        }

        let mut rows = self.mask.t()?.to_vec2::<u8>()?;
        let mut excluded = false;
        let mut data = vec![0i64; self.seq_len() * self.batch_size()];
        for (example, path) in paths.iter().enumerate() {
            if self.skipped.contains(&example) {
                continue;
            }
            let expected = self.lengths[example];
            if path.len() != expected {
                let err = CrfError::GoldLengthMismatch {
                    example,
                    expected,
                    got: path.len(),
                };
                self.exclude(err, example, &mut rows)?;
                excluded = true;
                continue;
            }
            for (step, &tag) in path.iter().enumerate() {
                self.check_tag(example, step, tag as i64)?;
                data[step * self.batch_size() + example] = tag as i64;
            }
        }
        if excluded {
            self.rebuild_mask(&rows)?;
        }
        Ok(Tensor::from_vec(
            data,
            (self.seq_len(), self.batch_size()),
            self.device(),
        )?)
    }

    fn check_tag(&self, example: usize, step: usize, tag: i64) -> Result<()> {
        if tag < 0 || tag as usize >= self.num_tags {
            return Err(CrfError::TagOutOfRange {
                example,
                step,
                tag,
                num_tags: self.num_tags,
            });
        }
        Ok(())
    }

    /// Emission scores, `[time, batch, tags]`, zero at padded positions.
    pub fn emissions(&self) -> &Tensor {
        &self.emissions
    }

    /// Emission scores of every example at step `t`, `[batch, tags]`.
    pub fn emissions_at(&self, t: usize) -> Result<Tensor> {
        Ok(self.emissions.i(t)?)
    }

    /// Emission scores of one example at one step, `[tags]`.
    pub fn emission(&self, example: usize, t: usize) -> Result<Tensor> {
        Ok(self.emissions.i((t, example))?)
    }

    /// Mask, `[time, batch]` u8.
    pub fn mask(&self) -> &Tensor {
        &self.mask
    }

    /// Mask at step `t`, `[batch]` u8.
    pub fn mask_at(&self, t: usize) -> Result<Tensor> {
        Ok(self.mask.i(t)?)
    }

    /// Mask as `dtype`, `[time, batch]`.
    pub fn float_mask(&self, dtype: DType) -> Result<Tensor> {
        Ok(self.mask.to_dtype(dtype)?)
    }

    /// One at the last real step of every non-empty example, `[time, batch]`.
    pub fn last_step_mask(&self, dtype: DType) -> Result<Tensor> {
        let mut data = vec![0u8; self.seq_len() * self.batch_size()];
        for (example, &length) in self.lengths.iter().enumerate() {
            if length > 0 {
                data[(length - 1) * self.batch_size() + example] = 1;
            }
        }
        Ok(Tensor::from_vec(data, (self.seq_len(), self.batch_size()), self.device())?
            .to_dtype(dtype)?)
    }

    /// Real length of every example; zero for excluded ones.
    pub fn lengths(&self) -> &[usize] {
        &self.lengths
    }

    /// Indices of examples excluded by [`MalformedPolicy::Skip`], ascending.
    pub fn skipped(&self) -> &[usize] {
        &self.skipped
    }

    /// Examples that take part in the reduction.
    pub fn num_included(&self) -> usize {
        self.batch_size() - self.skipped.len()
    }

    pub fn num_tokens(&self) -> usize {
        self.lengths.iter().sum()
    }

    pub fn seq_len(&self) -> usize {
        self.mask.dims()[0]
    }

    pub fn batch_size(&self) -> usize {
        self.mask.dims()[1]
    }

    pub fn num_tags(&self) -> usize {
        self.num_tags
    }

    pub fn dtype(&self) -> DType {
        self.emissions.dtype()
    }

    pub fn device(&self) -> &Device {
        self.emissions.device()
    }

    /// Put a time-major `[time, batch, ..]` tensor back in the caller's layout.
    pub fn to_caller_layout(&self, x: Tensor) -> Result<Tensor> {
        if self.batch_first {
            Ok(x.transpose(0, 1)?.contiguous()?)
        } else {
            Ok(x)
        }
    }

    fn caller_dims(&self) -> (usize, usize) {
        if self.batch_first {
            (self.batch_size(), self.seq_len())
        } else {
            (self.seq_len(), self.batch_size())
        }
    }
}
