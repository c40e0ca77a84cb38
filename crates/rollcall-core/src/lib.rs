//! rollcall-core — Face matching and emotion aggregation for attendance capture.
//!
//! Embedding extraction and emotion classification are external
//! collaborators behind [`EmbeddingExtractor`] and [`EmotionClassifier`];
//! this crate decides who is present and summarizes how the room felt.

pub mod capture;
pub mod emotion;
pub mod matcher;
pub mod session;
pub mod types;

pub use capture::{
    commit_session, record_capture, AttendanceNotice, CaptureContext, CaptureError, Notifier,
    PersistenceError, Recorded, SessionStore,
};
pub use emotion::{
    aggregate, EmotionDistribution, EmotionLabel, EmotionReading, EmotionScores, UnknownLabel,
};
pub use matcher::{confidence, Comparison, EuclideanMatcher, MatchError, Matcher};
pub use session::{
    ClassifierError, EmbeddingExtractor, EmotionClassifier, ExtractorError, SessionBuilder,
    SessionFailure, SessionId, SessionOutcome, SessionState,
};
pub use types::{
    BoundingBox, Contact, Embedding, FaceDetection, Identity, MatchCandidate, MatchResult,
    RosterEntry, Tolerance, ToleranceError, EMBEDDING_DIM,
};
