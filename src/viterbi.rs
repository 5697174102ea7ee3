use crate::error::{CrfError, Result};
use crate::scores::ScoreBatch;
use crate::transitions::Transitions;
use crate::util::{first_max_indices, to_vec1_f64};
use candle_core::{DType, Tensor};

/// Best tag sequence of one example and its unnormalized score.
#[derive(Debug, Clone, PartialEq)]
pub struct DecodedPath {
    pub tags: Vec<u32>,
    pub score: f64,
}

impl DecodedPath {
    pub fn len(&self) -> usize {
        self.tags.len()
    }

    pub fn is_empty(&self) -> bool {
        self.tags.is_empty()
    }
}

/// Max-product pass over the batch followed by a per-example traceback.
///
/// Among equally good predecessors the lowest tag index wins. The path may
/// not end in the start or stop pseudo-tag.
pub(crate) fn viterbi_decode(
    transitions: &Transitions,
    batch: &ScoreBatch,
    forbidden_score: f64,
    check_finite: bool,
) -> Result<Vec<DecodedPath>> {
    let matrix = transitions.matrix();
    let seq_length = batch.seq_len();
    let num_tags = batch.num_tags();

    let mut score = transitions
        .start_scores()?
        .broadcast_add(&batch.emissions_at(0)?)?;

    let mut history = Vec::with_capacity(seq_length.saturating_sub(1));
    for i in 1..seq_length {
        let broadcast_score = score.unsqueeze(2)?;

        let next_score = broadcast_score.broadcast_add(matrix)?;
        let (next_score, indices) = first_max_indices(&next_score, 1)?;
        let next_score = next_score.add(&batch.emissions_at(i)?)?;

        let z = batch
            .mask_at(i)?
            .unsqueeze(1)?
            .broadcast_as(next_score.shape())?;
        score = z.where_cond(&next_score, &score)?;
        history.push(indices);
    }

    // a path ends on a real tag
    let score = score.broadcast_add(&transitions.stop_scores()?)?;
    let mut pseudo = vec![0u8; num_tags];
    pseudo[transitions.start_tag()] = 1;
    pseudo[transitions.stop_tag()] = 1;
    let pseudo = Tensor::from_vec(pseudo, num_tags, score.device())?
        .unsqueeze(0)?
        .broadcast_as(score.shape())?;
    let forbidden = Tensor::full(forbidden_score, score.shape(), score.device())?.to_dtype(score.dtype())?;
    let score = pseudo.where_cond(&forbidden, &score)?;

    let (best_score, best_last_tag) = first_max_indices(&score, 1)?;
    let best_score = to_vec1_f64(&best_score)?;
    let best_last_tag = best_last_tag.to_vec1::<u32>()?;
    // [time - 1][batch][tags]
    let history = if history.is_empty() {
        vec![]
    } else {
        Tensor::stack(&history, 0)?.to_dtype(DType::U32)?.to_vec3::<u32>()?
    };

    let mut paths = Vec::with_capacity(batch.batch_size());
    for (example, &length) in batch.lengths().iter().enumerate() {
        if length == 0 {
            paths.push(DecodedPath {
                tags: vec![],
                score: 0.0,
            });
            continue;
        }
        let non_finite = CrfError::NonFinite {
            example,
            step: length - 1,
            stage: "viterbi",
        };
        if check_finite && !best_score[example].is_finite() {
            return Err(non_finite);
        }
        let mut tag = best_last_tag[example];
        if tag as usize >= num_tags {
            return Err(non_finite);
        }

        let mut tags = Vec::with_capacity(length);
        tags.push(tag);
        for step in (1..length).rev() {
            tag = history[step - 1][example][tag as usize];
            if tag as usize >= num_tags {
                return Err(CrfError::NonFinite {
                    example,
                    step,
                    stage: "viterbi",
                });
            }
            tags.push(tag);
        }
        tags.reverse();

        log::trace!("example {} decoded to {:?}", example, tags);
        paths.push(DecodedPath {
            tags,
            score: best_score[example],
        });
    }

    Ok(paths)
}
