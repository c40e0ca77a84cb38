use serde::{Deserialize, Serialize};
use std::fmt;
use thiserror::Error;

use crate::emotion::{EmotionLabel, EmotionReading};

/// Length of every face embedding accepted by the matcher.
pub const EMBEDDING_DIM: usize = 128;

/// Default maximum Euclidean distance for a roster entry to qualify.
const DEFAULT_TOLERANCE: f64 = 0.6;

/// Bounding box of a detected face in source image pixels.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct BoundingBox {
    pub x: f32,
    pub y: f32,
    pub width: f32,
    pub height: f32,
}

/// Face embedding vector.
///
/// Never mutated in place: a new capture produces a new `Embedding`.
/// Length and finiteness are checked by the matcher on every comparison,
/// so a malformed vector only poisons the pairs it takes part in.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(transparent)]
pub struct Embedding {
    values: Vec<f64>,
}

impl Embedding {
    pub fn new(values: Vec<f64>) -> Self {
        Self { values }
    }

    pub fn values(&self) -> &[f64] {
        &self.values
    }

    pub fn dim(&self) -> usize {
        self.values.len()
    }

    /// True if every component is a finite number.
    pub fn is_finite(&self) -> bool {
        self.values.iter().all(|v| v.is_finite())
    }
}

impl From<Vec<f64>> for Embedding {
    fn from(values: Vec<f64>) -> Self {
        Self::new(values)
    }
}

/// Roster member identity: a numeric student id or an opaque string key.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(untagged)]
pub enum Identity {
    Id(i64),
    Key(String),
}

impl fmt::Display for Identity {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Identity::Id(id) => write!(f, "{id}"),
            Identity::Key(key) => f.write_str(key),
        }
    }
}

impl From<i64> for Identity {
    fn from(id: i64) -> Self {
        Identity::Id(id)
    }
}

impl From<i32> for Identity {
    fn from(id: i32) -> Self {
        Identity::Id(i64::from(id))
    }
}

impl From<&str> for Identity {
    fn from(key: &str) -> Self {
        Identity::Key(key.to_string())
    }
}

/// Contact and display metadata. Passed through to notifications, never matched on.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct Contact {
    #[serde(default)]
    pub display_name: Option<String>,
    #[serde(default)]
    pub email: Option<String>,
}

/// One known member of the roster snapshot supplied with a capture request.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct RosterEntry {
    pub identity: Identity,
    pub embedding: Embedding,
    #[serde(default)]
    pub contact: Contact,
}

impl RosterEntry {
    pub fn new(identity: impl Into<Identity>, embedding: impl Into<Embedding>) -> Self {
        Self {
            identity: identity.into(),
            embedding: embedding.into(),
            contact: Contact::default(),
        }
    }

    pub fn with_contact(mut self, contact: Contact) -> Self {
        self.contact = contact;
        self
    }
}

/// A face found by the extractor, in extraction order.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct FaceDetection {
    #[serde(default, rename = "box")]
    pub bounding_box: Option<BoundingBox>,
    pub embedding: Embedding,
}

/// A roster entry that cleared the tolerance for one face.
#[derive(Debug, Clone, PartialEq)]
pub struct MatchCandidate {
    pub identity: Identity,
    pub distance: f64,
    /// `1 / (1 + distance)`.
    pub confidence: f64,
}

/// Attendance result for one matched face.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct MatchResult {
    /// Position of the face in extraction order.
    pub face_index: usize,
    pub identity: Identity,
    pub confidence: f64,
    pub emotion_label: Option<EmotionLabel>,
    pub emotion_score: Option<f64>,
}

impl MatchResult {
    pub(crate) fn new(
        face_index: usize,
        candidate: MatchCandidate,
        emotion: Option<EmotionReading>,
    ) -> Self {
        Self {
            face_index,
            identity: candidate.identity,
            confidence: candidate.confidence,
            emotion_label: emotion.map(|e| e.label),
            emotion_score: emotion.map(|e| e.score),
        }
    }

    pub fn emotion(&self) -> Option<EmotionReading> {
        match (self.emotion_label, self.emotion_score) {
            (Some(label), Some(score)) => Some(EmotionReading { label, score }),
            _ => None,
        }
    }
}

#[derive(Error, Debug, PartialEq)]
#[error("tolerance must lie in (0, 1], got {0}")]
pub struct ToleranceError(pub f64);

/// Maximum distance for a candidate to qualify, validated to lie in (0, 1].
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
#[serde(try_from = "f64", into = "f64")]
pub struct Tolerance(f64);

impl Tolerance {
    pub fn new(value: f64) -> Result<Self, ToleranceError> {
        if value > 0.0 && value <= 1.0 {
            Ok(Self(value))
        } else {
            Err(ToleranceError(value))
        }
    }

    pub fn get(self) -> f64 {
        self.0
    }
}

impl Default for Tolerance {
    fn default() -> Self {
        Self(DEFAULT_TOLERANCE)
    }
}

impl TryFrom<f64> for Tolerance {
    type Error = ToleranceError;

    fn try_from(value: f64) -> Result<Self, Self::Error> {
        Self::new(value)
    }
}

impl From<Tolerance> for f64 {
    fn from(t: Tolerance) -> f64 {
        t.0
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_tolerance_bounds() {
        assert!(Tolerance::new(0.6).is_ok());
        assert!(Tolerance::new(1.0).is_ok());
        assert_eq!(Tolerance::new(0.0), Err(ToleranceError(0.0)));
        assert!(Tolerance::new(1.5).is_err());
        assert!(Tolerance::new(f64::NAN).is_err());
        assert_eq!(Tolerance::default().get(), 0.6);
    }

    #[test]
    fn test_identity_accepts_number_or_string() {
        let ids: Vec<Identity> = serde_json::from_str(r#"[42, "s-0017"]"#).unwrap();
        assert_eq!(ids[0], Identity::Id(42));
        assert_eq!(ids[1], Identity::Key("s-0017".into()));
        assert_eq!(ids[0].to_string(), "42");
    }

    #[test]
    fn test_roster_entry_rejects_unknown_fields() {
        let json = r#"{"identity": 1, "embedding": [0.0], "face_encodings": [0.0]}"#;
        assert!(serde_json::from_str::<RosterEntry>(json).is_err());
    }

    #[test]
    fn test_roster_entry_contact_defaults() {
        let json = r#"{"identity": 7, "embedding": [0.5, 0.25]}"#;
        let entry: RosterEntry = serde_json::from_str(json).unwrap();
        assert_eq!(entry.embedding.values(), &[0.5, 0.25]);
        assert_eq!(entry.contact, Contact::default());
    }

    #[test]
    fn test_embedding_finiteness() {
        assert!(Embedding::new(vec![0.0, 1.0]).is_finite());
        assert!(!Embedding::new(vec![0.0, f64::NAN]).is_finite());
        assert!(!Embedding::new(vec![f64::INFINITY]).is_finite());
    }

    #[test]
    fn test_match_result_serializes_null_emotion() {
        let result = MatchResult::new(
            0,
            MatchCandidate { identity: Identity::Id(1), distance: 0.0, confidence: 1.0 },
            None,
        );
        let json = serde_json::to_value(&result).unwrap();
        assert_eq!(json["identity"], 1);
        assert_eq!(json["confidence"], 1.0);
        assert!(json["emotionLabel"].is_null());
        assert!(json["emotionScore"].is_null());
    }
}
