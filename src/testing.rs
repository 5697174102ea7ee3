//! Brute-force reference and fixtures shared by the module tests.

use crate::config::{CrfConfig, FORBIDDEN_SCORE};
use crate::CRF;
use anyhow::Result;
use candle_core::{utils, DType, Device, Tensor};
use itertools::Itertools;
use rand::rngs::StdRng;
use rand::{Rng, SeedableRng};

pub(crate) fn use_gpu(gpu: bool) -> candle_core::Result<Device> {
    if gpu {
        if utils::cuda_is_available() {
            println!("CUDA is available");
            Device::new_cuda(0)
        } else if utils::metal_is_available() {
            println!("Metal is available");
            Device::new_metal(0)
        } else {
            println!("CUDA and Metal are not available, using CPU");
            Ok(Device::Cpu)
        }
    } else {
        println!("Using CPU");
        Ok(Device::Cpu)
    }
}

pub(crate) fn device() -> candle_core::Result<Device> {
    #[cfg(any(feature = "cuda", feature = "metal"))]
    let device = use_gpu(true);
    #[cfg(not(any(feature = "cuda", feature = "metal")))]
    let device = use_gpu(false);
    device
}

pub(crate) fn epsilon(dtype: DType) -> f64 {
    match dtype {
        DType::F64 => 1e-6,
        DType::F32 => 1e-3,
        DType::F16 => 1e-1,
        DType::BF16 => 5e-1,
        _ => panic!("dtype not supported"),
    }
}

pub(crate) fn assert_close(a: f64, b: f64, epsilon: f64) {
    assert!(
        (a - b).abs() <= epsilon,
        "{} and {} differ by more than {}",
        a,
        b,
        epsilon
    );
}

pub(crate) fn log_sum_exp(xs: &[f64]) -> f64 {
    let max = xs.iter().copied().fold(f64::NEG_INFINITY, f64::max);
    max + xs.iter().map(|x| (x - max).exp()).sum::<f64>().ln()
}

/// A CRF problem small enough to enumerate every path.
#[derive(Debug, Clone)]
pub(crate) struct Fixture {
    pub config: CrfConfig,
    /// `[num_tags][num_tags]`
    pub matrix: Vec<Vec<f64>>,
    /// `[batch][time][num_tags]`
    pub emissions: Vec<Vec<Vec<f64>>>,
    pub lengths: Vec<usize>,
}

impl Fixture {
    /// Pseudo-tags in the two last slots, forbidden entries applied.
    pub fn new(
        num_tags: usize,
        mut matrix: Vec<Vec<f64>>,
        emissions: Vec<Vec<Vec<f64>>>,
        lengths: Vec<usize>,
    ) -> Self {
        let config = CrfConfig::new(num_tags);
        for (i, row) in matrix.iter_mut().enumerate() {
            for (j, score) in row.iter_mut().enumerate() {
                if j == config.start_tag() || i == config.stop_tag() {
                    *score = FORBIDDEN_SCORE;
                }
            }
        }
        Self {
            config,
            matrix,
            emissions,
            lengths,
        }
    }

    /// A pytorch-crf problem (start and end vectors over five real tags,
    /// time-major emissions) embedded into a seven-tag matrix whose pseudo
    /// tags can never be emitted.
    pub fn from_pytorch_crf(
        start: [f64; 5],
        end: [f64; 5],
        transitions: [[f64; 5]; 5],
        emissions: &[[[f64; 5]; 2]; 3],
        lengths: Vec<usize>,
    ) -> Self {
        let mut matrix = vec![vec![0.0; 7]; 7];
        for i in 0..5 {
            matrix[i][..5].copy_from_slice(&transitions[i]);
            matrix[5][i] = start[i];
            matrix[i][6] = end[i];
        }
        let batch = (0..2)
            .map(|b| {
                emissions
                    .iter()
                    .map(|step| {
                        let mut row = step[b].to_vec();
                        row.extend([FORBIDDEN_SCORE, FORBIDDEN_SCORE]);
                        row
                    })
                    .collect_vec()
            })
            .collect_vec();
        Self::new(7, matrix, batch, lengths)
    }

    pub fn num_tags(&self) -> usize {
        self.config.num_tags
    }

    pub fn seq_len(&self) -> usize {
        self.emissions[0].len()
    }

    pub fn crf(&self, dtype: DType, device: &Device) -> Result<CRF> {
        let n = self.num_tags();
        let matrix = Tensor::from_vec(self.matrix.concat(), (n, n), device)?.to_dtype(dtype)?;
        Ok(CRF::from_transitions(self.config.clone(), matrix)?)
    }

    /// `[batch, time, num_tags]`
    pub fn emissions(&self, dtype: DType, device: &Device) -> Result<Tensor> {
        let shape = (self.lengths.len(), self.seq_len(), self.num_tags());
        let data = self.emissions.iter().flatten().flatten().copied().collect_vec();
        Ok(Tensor::from_vec(data, shape, device)?.to_dtype(dtype)?)
    }

    /// `[batch, time]`
    pub fn mask(&self, device: &Device) -> Result<Tensor> {
        let seq_len = self.seq_len();
        let data = self
            .lengths
            .iter()
            .flat_map(|&len| (0..seq_len).map(move |t| (t < len) as u8))
            .collect_vec();
        Ok(Tensor::from_vec(data, (self.lengths.len(), seq_len), device)?)
    }

    pub fn score(&self, example: usize, path: &[usize]) -> f64 {
        let (start, stop) = (self.config.start_tag(), self.config.stop_tag());
        let emissions = &self.emissions[example];
        let mut score = self.matrix[start][path[0]] + self.matrix[path[path.len() - 1]][stop];
        for (t, &tag) in path.iter().enumerate() {
            score += emissions[t][tag];
        }
        for (&prev, &next) in path.iter().tuple_windows() {
            score += self.matrix[prev][next];
        }
        score
    }

    fn paths(&self, example: usize) -> impl Iterator<Item = Vec<usize>> {
        let num_tags = self.num_tags();
        (0..self.lengths[example])
            .map(move |_| 0..num_tags)
            .multi_cartesian_product()
    }

    pub fn log_partition(&self, example: usize) -> f64 {
        let scores = self.paths(example).map(|p| self.score(example, &p)).collect_vec();
        log_sum_exp(&scores)
    }

    pub fn log_likelihood(&self, example: usize, path: &[usize]) -> f64 {
        if self.lengths[example] == 0 {
            return 0.0;
        }
        self.score(example, path) - self.log_partition(example)
    }

    /// Best path whose last tag is a real tag, and its score.
    pub fn best(&self, example: usize) -> (Vec<usize>, f64) {
        let (start, stop) = (self.config.start_tag(), self.config.stop_tag());
        self.paths(example)
            .filter(|p| {
                let last = p[p.len() - 1];
                last != start && last != stop
            })
            .map(|p| {
                let score = self.score(example, &p);
                (p, score)
            })
            .fold((vec![], f64::NEG_INFINITY), |best, (p, s)| {
                if s > best.1 {
                    (p, s)
                } else {
                    best
                }
            })
    }

    /// Probability of `tag` at step `t`, by enumeration.
    pub fn marginal(&self, example: usize, t: usize, tag: usize) -> f64 {
        let log_z = self.log_partition(example);
        self.paths(example)
            .filter(|p| p[t] == tag)
            .map(|p| (self.score(example, &p) - log_z).exp())
            .sum()
    }
}

/// Seeded uniform values in `[-scale, scale)`.
pub(crate) fn random_values(seed: u64, count: usize, scale: f64) -> Vec<f64> {
    let mut rng = StdRng::seed_from_u64(seed);
    (0..count).map(|_| rng.gen_range(-scale..scale)).collect()
}

/// Random fixture with `num_tags` tags, `seq_len` steps and the given lengths.
pub(crate) fn random_fixture(seed: u64, num_tags: usize, seq_len: usize, lengths: Vec<usize>) -> Fixture {
    let batch = lengths.len();
    let values = random_values(seed, num_tags * num_tags, 1.0);
    let matrix = values.chunks(num_tags).map(|c| c.to_vec()).collect_vec();
    let values = random_values(seed ^ 0x5eed, batch * seq_len * num_tags, 2.0);
    let emissions = values
        .chunks(seq_len * num_tags)
        .map(|b| b.chunks(num_tags).map(|c| c.to_vec()).collect_vec())
        .collect_vec();
    Fixture::new(num_tags, matrix, emissions, lengths)
}
