//! Emotion labels, classifier score handling, and label aggregation.

use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::fmt;
use std::str::FromStr;
use thiserror::Error;

/// Recognized emotion labels.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum EmotionLabel {
    Angry,
    Disgust,
    Fear,
    Happy,
    Sad,
    Surprise,
    Neutral,
}

impl EmotionLabel {
    pub const ALL: [EmotionLabel; 7] = [
        EmotionLabel::Angry,
        EmotionLabel::Disgust,
        EmotionLabel::Fear,
        EmotionLabel::Happy,
        EmotionLabel::Sad,
        EmotionLabel::Surprise,
        EmotionLabel::Neutral,
    ];

    pub fn as_str(self) -> &'static str {
        match self {
            EmotionLabel::Angry => "angry",
            EmotionLabel::Disgust => "disgust",
            EmotionLabel::Fear => "fear",
            EmotionLabel::Happy => "happy",
            EmotionLabel::Sad => "sad",
            EmotionLabel::Surprise => "surprise",
            EmotionLabel::Neutral => "neutral",
        }
    }
}

impl fmt::Display for EmotionLabel {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

#[derive(Error, Debug, Clone, PartialEq, Eq)]
#[error("unrecognized emotion label: {0:?}")]
pub struct UnknownLabel(pub String);

impl FromStr for EmotionLabel {
    type Err = UnknownLabel;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let needle = s.trim();
        EmotionLabel::ALL
            .into_iter()
            .find(|label| label.as_str().eq_ignore_ascii_case(needle))
            .ok_or_else(|| UnknownLabel(s.to_string()))
    }
}

/// Dominant emotion of one face: label plus its share of the classifier output.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct EmotionReading {
    pub label: EmotionLabel,
    /// In [0, 1].
    pub score: f64,
}

/// Per-label score distribution returned by an emotion classifier.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(transparent)]
pub struct EmotionScores {
    scores: BTreeMap<EmotionLabel, f64>,
}

impl EmotionScores {
    pub fn new(scores: BTreeMap<EmotionLabel, f64>) -> Self {
        Self { scores }
    }

    pub fn get(&self, label: EmotionLabel) -> Option<f64> {
        self.scores.get(&label).copied()
    }

    pub fn is_empty(&self) -> bool {
        self.scores.is_empty()
    }

    /// Highest-scoring label, with its score normalized to a share of the total.
    ///
    /// Classifiers report either probabilities or percentages; dividing by the
    /// sum puts both on [0, 1]. Ties go to the label that sorts first.
    /// Returns `None` when no score is finite and positive.
    pub fn dominant(&self) -> Option<EmotionReading> {
        let usable = || {
            self.scores
                .iter()
                .filter(|(_, s)| s.is_finite() && **s >= 0.0)
                .map(|(l, s)| (*l, *s))
        };

        let total: f64 = usable().map(|(_, s)| s).sum();
        if total <= 0.0 {
            return None;
        }

        let mut best: Option<(EmotionLabel, f64)> = None;
        for (label, score) in usable() {
            if best.map_or(true, |(_, prev)| score > prev) {
                best = Some((label, score));
            }
        }

        best.map(|(label, score)| EmotionReading {
            label,
            score: score / total,
        })
    }
}

impl FromIterator<(EmotionLabel, f64)> for EmotionScores {
    fn from_iter<I: IntoIterator<Item = (EmotionLabel, f64)>>(iter: I) -> Self {
        Self::new(iter.into_iter().collect())
    }
}

/// Counts and percentages of dominant emotions over a set of records.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct EmotionDistribution {
    pub total_analyzed: usize,
    pub counts: BTreeMap<EmotionLabel, usize>,
    pub percentages: BTreeMap<EmotionLabel, f64>,
}

/// Reduce a sequence of dominant-emotion labels to counts and percentages.
///
/// Order-independent and stateless. Empty input yields an empty distribution.
pub fn aggregate<I>(labels: I) -> EmotionDistribution
where
    I: IntoIterator<Item = EmotionLabel>,
{
    let mut counts: BTreeMap<EmotionLabel, usize> = BTreeMap::new();
    let mut total = 0usize;
    for label in labels {
        *counts.entry(label).or_insert(0) += 1;
        total += 1;
    }

    if total == 0 {
        return EmotionDistribution::default();
    }

    let percentages = counts
        .iter()
        .map(|(label, count)| (*label, 100.0 * *count as f64 / total as f64))
        .collect();

    EmotionDistribution {
        total_analyzed: total,
        counts,
        percentages,
    }
}
