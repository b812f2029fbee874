use crate::candidate::{Candidate, PackedCandidate};
use serde::Serialize;
use thiserror::Error;

#[derive(Debug, Error, Clone, PartialEq)]
pub enum ApplyError {
    #[error("got {weights} weights for {candidates} candidates")]
    LengthMismatch { candidates: usize, weights: usize },
    #[error("candidate {index} is not a packed candidate")]
    NotPacked { index: usize },
}

/// Reweighted copy of a collection together with the weights used
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct WeightedCandidates {
    pub candidates: Vec<PackedCandidate>,
    pub weights: Vec<f32>,
}

/// Rescale the four-momentum of every candidate by its weight
///
/// Fails without partial output when any candidate is not packed.
pub fn apply_weights<C: Candidate>(
    candidates: &[C],
    weights: Vec<f32>,
) -> Result<WeightedCandidates, ApplyError> {
    if weights.len() != candidates.len() {
        return Err(ApplyError::LengthMismatch {
            candidates: candidates.len(),
            weights: weights.len(),
        });
    }

    let candidates = candidates
        .iter()
        .zip(&weights)
        .enumerate()
        .map(|(index, (candidate, weight))| {
            candidate
                .packed()
                .map(|packed| packed.scaled(*weight))
                .ok_or(ApplyError::NotPacked { index })
        })
        .collect::<Result<Vec<_>, _>>()?;

    Ok(WeightedCandidates {
        candidates,
        weights,
    })
}
