use crate::config::CrfConfig;
use crate::error::{CrfError, Result};
use candle_core::{DType, Device, IndexOp, Tensor};
use candle_nn::{Init, VarBuilder};
use std::collections::HashMap;

/// Name of the transition matrix in a [`VarBuilder`] or a saved tensor map.
pub const TRANSITIONS: &str = "transitions";

/// Tag-transition scores, `matrix[i][j]` being the score of moving from tag
/// `i` to tag `j`.
///
/// Row `start_tag` doubles as the start transitions and column `stop_tag` as
/// the stop transitions.
#[derive(Debug, Clone)]
pub struct Transitions {
    matrix: Tensor,
    start_tag: usize,
    stop_tag: usize,
}

impl Transitions {
    /// Uniform noise in `[-init_range, init_range]`, with transitions into
    /// the start tag and out of the stop tag forbidden.
    pub fn new(config: &CrfConfig, dtype: DType, device: &Device) -> Result<Self> {
        let n = config.num_tags;
        let noise = Tensor::zeros((n, n), dtype, device)?
            .rand_like(-config.init_range, config.init_range)?;
        Self::from_tensor(noise, config)?.forbid(config.forbidden_score)
    }

    pub fn load(config: &CrfConfig, vb: VarBuilder) -> Result<Self> {
        let n = config.num_tags;
        let matrix = vb.get_with_hints(
            (n, n),
            TRANSITIONS,
            Init::Uniform {
                lo: -config.init_range,
                up: config.init_range,
            },
        )?;
        Self::from_tensor(matrix, config)?.forbid(config.forbidden_score)
    }

    /// Use `matrix` as is, without forbidding anything.
    pub fn from_tensor(matrix: Tensor, config: &CrfConfig) -> Result<Self> {
        let n = config.num_tags;
        if matrix.dims() != [n, n] {
            return Err(CrfError::shape(format!(
                "transitions must have shape ({}, {}), got {:?}",
                n,
                n,
                matrix.dims()
            )));
        }
        Ok(Self {
            matrix,
            start_tag: config.start_tag(),
            stop_tag: config.stop_tag(),
        })
    }

    /// One where a transition is illegal: into start, out of stop.
    pub fn forbidden_mask(&self) -> Result<Tensor> {
        let n = self.num_tags();
        let mut data = vec![0u8; n * n];
        for i in 0..n {
            data[i * n + self.start_tag] = 1;
            data[self.stop_tag * n + i] = 1;
        }
        Ok(Tensor::from_vec(data, (n, n), self.matrix.device())?)
    }

    fn forbid(mut self, score: f64) -> Result<Self> {
        let forbidden = Tensor::full(score, self.matrix.shape(), self.matrix.device())?
            .to_dtype(self.matrix.dtype())?;
        self.matrix = self.forbidden_mask()?.where_cond(&forbidden, &self.matrix)?;
        Ok(self)
    }

    /// Score of the transition `from -> to`.
    pub fn score(&self, from: usize, to: usize) -> Result<f64> {
        let n = self.num_tags();
        for tag in [from, to] {
            if tag >= n {
                return Err(CrfError::shape(format!(
                    "tag {} is out of range for {} tags",
                    tag, n
                )));
            }
        }
        Ok(self
            .matrix
            .i((from, to))?
            .to_dtype(DType::F64)?
            .to_scalar::<f64>()?)
    }

    pub fn matrix(&self) -> &Tensor {
        &self.matrix
    }

    /// Replace the matrix, e.g. after an optimizer step.
    pub fn set(&mut self, matrix: Tensor) -> Result<()> {
        if matrix.shape() != self.matrix.shape() {
            return Err(CrfError::shape(format!(
                "transitions must have shape {:?}, got {:?}",
                self.matrix.dims(),
                matrix.dims()
            )));
        }
        self.matrix = matrix;
        Ok(())
    }

    /// Scores of leaving the start tag, `[num_tags]`.
    pub fn start_scores(&self) -> Result<Tensor> {
        Ok(self.matrix.i(self.start_tag)?)
    }

    /// Scores of entering the stop tag, `[num_tags]`.
    pub fn stop_scores(&self) -> Result<Tensor> {
        Ok(self.matrix.i((.., self.stop_tag))?.contiguous()?)
    }

    /// Flat name to tensor map for serialization.
    pub fn named_tensors(&self) -> HashMap<String, Tensor> {
        HashMap::from([(TRANSITIONS.to_string(), self.matrix.clone())])
    }

    pub fn num_tags(&self) -> usize {
        self.matrix.dims()[0]
    }

    pub fn start_tag(&self) -> usize {
        self.start_tag
    }

    pub fn stop_tag(&self) -> usize {
        self.stop_tag
    }

    pub fn dtype(&self) -> DType {
        self.matrix.dtype()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use anyhow::Result;
    use crate::config::FORBIDDEN_SCORE;

    #[test]
    fn test_init_forbids_start_and_stop() -> Result<()> {
        let device = Device::Cpu;
        let config = CrfConfig::new(6);
        let transitions = Transitions::new(&config, DType::F32, &device)?;
        assert_eq!(transitions.matrix().dims2()?, (6, 6));
        assert_eq!((transitions.start_tag(), transitions.stop_tag()), (4, 5));

        let matrix = transitions.matrix().to_vec2::<f32>()?;
        for (i, row) in matrix.iter().enumerate() {
            for (j, &score) in row.iter().enumerate() {
                if j == 4 || i == 5 {
                    assert_eq!(score as f64, FORBIDDEN_SCORE, "({}, {})", i, j);
                } else {
                    assert!((-0.1..=0.1).contains(&score), "({}, {}) = {}", i, j, score);
                }
            }
        }
        Ok(())
    }

    #[test]
    fn test_score_lookup() -> Result<()> {
        let device = Device::Cpu;
        let config = CrfConfig::new(3).with_pseudo_tags(0, 1);
        let matrix = Tensor::new(&[[0.0f32, 0.1, 0.2], [1.0, 1.1, 1.2], [2.0, 2.1, 2.2]], &device)?;
        let transitions = Transitions::from_tensor(matrix, &config)?;

        assert!((transitions.score(2, 1)? - 2.1).abs() < 1e-6);
        assert_eq!(transitions.start_scores()?.to_vec1::<f32>()?, vec![0.0, 0.1, 0.2]);
        assert_eq!(transitions.stop_scores()?.to_vec1::<f32>()?, vec![0.1, 1.1, 2.1]);
        assert_eq!(
            transitions.score(0, 3).unwrap_err().to_string(),
            "tag 3 is out of range for 3 tags"
        );
        Ok(())
    }

    #[test]
    fn test_shape_checks() -> Result<()> {
        let device = Device::Cpu;
        let config = CrfConfig::new(4);
        assert!(Transitions::from_tensor(Tensor::zeros((4, 3), DType::F32, &device)?, &config).is_err());

        let mut transitions = Transitions::new(&config, DType::F32, &device)?;
        assert!(transitions.set(Tensor::zeros((3, 3), DType::F32, &device)?).is_err());
        transitions.set(Tensor::ones((4, 4), DType::F32, &device)?)?;
        assert_eq!(transitions.score(0, 0)?, 1.0);
        Ok(())
    }

    #[test]
    fn test_load_round_trip() -> Result<()> {
        let device = Device::Cpu;
        let config = CrfConfig::new(5);
        let saved = Transitions::new(&config, DType::F64, &device)?;

        let vb = VarBuilder::from_tensors(saved.named_tensors(), DType::F64, &device);
        let loaded = Transitions::load(&config, vb)?;
        assert_eq!(
            loaded.matrix().to_vec2::<f64>()?,
            saved.matrix().to_vec2::<f64>()?
        );

        // a fresh parameter still gets the forbidden entries
        let loaded = Transitions::load(&config, VarBuilder::zeros(DType::F64, &device))?;
        assert_eq!(loaded.score(0, 3)?, FORBIDDEN_SCORE);
        assert_eq!(loaded.score(4, 0)?, FORBIDDEN_SCORE);
        assert_eq!(loaded.score(0, 1)?, 0.0);
        Ok(())
    }
}
