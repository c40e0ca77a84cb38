//! Roster matching by Euclidean distance.

use crate::types::{Embedding, MatchCandidate, RosterEntry, EMBEDDING_DIM};
use thiserror::Error;

#[derive(Error, Debug, Clone, PartialEq)]
pub enum MatchError {
    #[error("embedding dimension mismatch: expected {expected}, got {actual}")]
    DimensionMismatch { expected: usize, actual: usize },
    #[error("embedding contains non-finite values")]
    NonFinite,
}

/// Distance and confidence of one known/unknown pair.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct Comparison {
    pub distance: f64,
    pub confidence: f64,
}

/// Map a distance to a confidence in (0, 1]. Distance 0 gives exactly 1.0.
pub fn confidence(distance: f64) -> f64 {
    1.0 / (1.0 + distance)
}

/// Strategy for comparing an unknown face against a roster snapshot.
pub trait Matcher {
    fn compare(&self, known: &Embedding, unknown: &Embedding) -> Result<Comparison, MatchError>;

    /// Check a single embedding before any comparison is made.
    fn validate(&self, _embedding: &Embedding) -> Result<(), MatchError> {
        Ok(())
    }

    /// Best roster entry with `distance <= tolerance`, if any.
    ///
    /// The lowest distance wins; ties keep the earliest roster entry.
    /// A malformed `unknown` is an error even against an empty roster.
    /// Roster entries that fail [`compare`](Self::compare) are skipped; if
    /// every entry failed, the last error is returned.
    fn find_best_match(
        &self,
        unknown: &Embedding,
        roster: &[RosterEntry],
        tolerance: f64,
    ) -> Result<Option<MatchCandidate>, MatchError> {
        self.validate(unknown)?;

        let mut best: Option<(usize, Comparison)> = None;
        let mut last_error = None;
        let mut compared = 0usize;

        for (i, entry) in roster.iter().enumerate() {
            let cmp = match self.compare(&entry.embedding, unknown) {
                Ok(cmp) => cmp,
                Err(err) => {
                    tracing::warn!(
                        identity = %entry.identity,
                        error = %err,
                        "skipping roster entry"
                    );
                    last_error = Some(err);
                    continue;
                }
            };
            compared += 1;

            if cmp.distance > tolerance {
                continue;
            }
            let is_better = match &best {
                None => true,
                Some((_, prev)) => cmp.confidence > prev.confidence,
            };
            if is_better {
                best = Some((i, cmp));
            }
        }

        if compared == 0 {
            if let Some(err) = last_error {
                return Err(err);
            }
        }

        Ok(best.map(|(i, cmp)| MatchCandidate {
            identity: roster[i].identity.clone(),
            distance: cmp.distance,
            confidence: cmp.confidence,
        }))
    }
}

/// L2 distance matcher over fixed-length embeddings.
#[derive(Debug, Clone, Copy)]
pub struct EuclideanMatcher {
    dim: usize,
}

impl EuclideanMatcher {
    pub fn new(dim: usize) -> Self {
        Self { dim }
    }

    pub fn dim(&self) -> usize {
        self.dim
    }
}

impl Default for EuclideanMatcher {
    fn default() -> Self {
        Self::new(EMBEDDING_DIM)
    }
}

impl Matcher for EuclideanMatcher {
    fn validate(&self, embedding: &Embedding) -> Result<(), MatchError> {
        if embedding.dim() != self.dim {
            return Err(MatchError::DimensionMismatch {
                expected: self.dim,
                actual: embedding.dim(),
            });
        }
        if !embedding.is_finite() {
            return Err(MatchError::NonFinite);
        }
        Ok(())
    }

    fn compare(&self, known: &Embedding, unknown: &Embedding) -> Result<Comparison, MatchError> {
        self.validate(known)?;
        self.validate(unknown)?;

        let distance = known
            .values()
            .iter()
            .zip(unknown.values())
            .map(|(a, b)| (a - b).powi(2))
            .sum::<f64>()
            .sqrt();

        Ok(Comparison {
            distance,
            confidence: confidence(distance),
        })
    }
}
