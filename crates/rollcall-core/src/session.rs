//! Attendance session assembly.
//!
//! One session is one photograph: extract every face, match each one
//! against the roster snapshot, enrich matches with the dominant emotion,
//! and report the counts. The builder holds no state between calls.

use crate::emotion::{EmotionReading, EmotionScores};
use crate::matcher::{EuclideanMatcher, Matcher};
use crate::types::{BoundingBox, FaceDetection, MatchResult, RosterEntry, Tolerance};
use serde::{Deserialize, Serialize};
use std::fmt;
use thiserror::Error;

#[derive(Error, Debug)]
pub enum ExtractorError {
    #[error("embedding extractor unavailable: {0}")]
    Unavailable(String),
    #[error("embedding extractor returned invalid output: {0}")]
    InvalidOutput(String),
}

#[derive(Error, Debug)]
pub enum ClassifierError {
    #[error("emotion classifier unavailable: {0}")]
    Unavailable(String),
    #[error("emotion classifier returned invalid output: {0}")]
    InvalidOutput(String),
}

/// Finds faces in an image and returns one embedding per face.
pub trait EmbeddingExtractor {
    fn extract(&self, image: &[u8]) -> Result<Vec<FaceDetection>, ExtractorError>;
}

/// Scores the emotions of a face, or of the whole image when no region is given.
///
/// `Ok(None)` means the classifier ran but found nothing to score.
pub trait EmotionClassifier {
    fn classify(
        &self,
        image: &[u8],
        region: Option<&BoundingBox>,
    ) -> Result<Option<EmotionScores>, ClassifierError>;
}

/// Caller-assigned marker for one capture request.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct SessionId(String);

impl SessionId {
    pub fn new(id: impl Into<String>) -> Self {
        Self(id.into())
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for SessionId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

/// Capture request lifecycle.
///
/// ```text
/// Initiated -> Extracting -> FailedExtraction
///                         -> FailedNoFace
///                         -> Matching -> FailedDimensionError
///                                     -> Complete
/// ```
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum SessionState {
    Initiated,
    Extracting,
    Matching,
    Complete,
    FailedNoFace,
    FailedExtraction,
    FailedDimensionError,
}

impl SessionState {
    pub fn is_terminal(self) -> bool {
        matches!(
            self,
            SessionState::Complete
                | SessionState::FailedNoFace
                | SessionState::FailedExtraction
                | SessionState::FailedDimensionError
        )
    }

    pub fn can_transition_to(self, next: SessionState) -> bool {
        use SessionState::*;
        matches!(
            (self, next),
            (Initiated, Extracting)
                | (Extracting, FailedExtraction)
                | (Extracting, FailedNoFace)
                | (Extracting, Matching)
                | (Matching, FailedDimensionError)
                | (Matching, Complete)
        )
    }
}

/// Whole-session failure recorded in [`SessionOutcome::error`].
#[derive(Error, Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum SessionFailure {
    #[error("no face detected in image")]
    NoFaceDetected,
    #[error("no detected face could be compared against the roster")]
    DimensionMismatch,
    #[error("embedding extraction failed")]
    ExtractionFailed,
}

/// Result of one capture request. Never mutated after it is returned.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct SessionOutcome {
    pub session_id: SessionId,
    pub state: SessionState,
    pub total_faces: usize,
    pub total_matched: usize,
    /// Faces compared successfully that had no qualifying roster entry.
    pub unmatched: usize,
    /// Faces whose embedding could not be compared against any roster entry.
    pub invalid_faces: usize,
    /// One entry per matched face, in extraction order.
    pub results: Vec<MatchResult>,
    pub error: Option<SessionFailure>,
}

impl SessionOutcome {
    fn failed(
        session_id: SessionId,
        state: SessionState,
        total_faces: usize,
        error: SessionFailure,
    ) -> Self {
        Self {
            session_id,
            state,
            total_faces,
            total_matched: 0,
            unmatched: 0,
            invalid_faces: total_faces,
            results: Vec::new(),
            error: Some(error),
        }
    }

    pub fn is_complete(&self) -> bool {
        self.state == SessionState::Complete
    }
}

/// Tracks the state machine of one request and logs each step.
struct Progress {
    state: SessionState,
}

impl Progress {
    fn new() -> Self {
        Self { state: SessionState::Initiated }
    }

    fn advance(&mut self, next: SessionState) {
        debug_assert!(
            self.state.can_transition_to(next),
            "illegal session transition {:?} -> {:?}",
            self.state,
            next
        );
        tracing::debug!(from = ?self.state, to = ?next, "session state");
        self.state = next;
    }
}

/// Runs capture requests against an extractor, an optional classifier and a matcher.
pub struct SessionBuilder {
    extractor: Box<dyn EmbeddingExtractor + Send>,
    classifier: Option<Box<dyn EmotionClassifier + Send>>,
    matcher: EuclideanMatcher,
    span: tracing::Span,
}

impl SessionBuilder {
    pub fn new(extractor: impl EmbeddingExtractor + Send + 'static) -> Self {
        Self {
            extractor: Box::new(extractor),
            classifier: None,
            matcher: EuclideanMatcher::default(),
            span: tracing::Span::current(),
        }
    }

    /// Enrich matches with the dominant emotion from `classifier`.
    pub fn with_classifier(mut self, classifier: impl EmotionClassifier + Send + 'static) -> Self {
        self.classifier = Some(Box::new(classifier));
        self
    }

    pub fn with_matcher(mut self, matcher: EuclideanMatcher) -> Self {
        self.matcher = matcher;
        self
    }

    /// Parent span for every session this builder runs.
    pub fn with_span(mut self, span: tracing::Span) -> Self {
        self.span = span;
        self
    }

    pub fn has_classifier(&self) -> bool {
        self.classifier.is_some()
    }

    /// Process one image against a roster snapshot.
    ///
    /// Every failure is reported inside the returned outcome. Given the same
    /// inputs and deterministic collaborators the outcome is identical.
    pub fn build_session(
        &self,
        session_id: SessionId,
        image: &[u8],
        roster: &[RosterEntry],
        tolerance: Tolerance,
    ) -> SessionOutcome {
        let span = tracing::info_span!(
            parent: &self.span,
            "build_session",
            session_id = %session_id,
            roster = roster.len()
        );
        let _enter = span.enter();

        let mut progress = Progress::new();
        progress.advance(SessionState::Extracting);

        let faces = match self.extractor.extract(image) {
            Ok(faces) => faces,
            Err(err) => {
                tracing::error!(error = %err, "extraction failed");
                progress.advance(SessionState::FailedExtraction);
                return SessionOutcome::failed(
                    session_id,
                    progress.state,
                    0,
                    SessionFailure::ExtractionFailed,
                );
            }
        };

        if faces.is_empty() {
            tracing::info!("no face detected");
            progress.advance(SessionState::FailedNoFace);
            return SessionOutcome::failed(
                session_id,
                progress.state,
                0,
                SessionFailure::NoFaceDetected,
            );
        }

        progress.advance(SessionState::Matching);

        let mut results = Vec::new();
        let mut unmatched = 0usize;
        let mut invalid_faces = 0usize;

        for (i, face) in faces.iter().enumerate() {
            match self.matcher.find_best_match(&face.embedding, roster, tolerance.get()) {
                Ok(Some(candidate)) => {
                    tracing::debug!(
                        face = i,
                        identity = %candidate.identity,
                        distance = candidate.distance,
                        confidence = candidate.confidence,
                        "face matched"
                    );
                    let emotion = self.classify(image, face);
                    results.push(MatchResult::new(i, candidate, emotion));
                }
                Ok(None) => {
                    tracing::debug!(face = i, "no roster entry within tolerance");
                    unmatched += 1;
                }
                Err(err) => {
                    tracing::warn!(face = i, error = %err, "face could not be compared");
                    invalid_faces += 1;
                }
            }
        }

        if invalid_faces == faces.len() {
            progress.advance(SessionState::FailedDimensionError);
            return SessionOutcome::failed(
                session_id,
                progress.state,
                faces.len(),
                SessionFailure::DimensionMismatch,
            );
        }

        progress.advance(SessionState::Complete);
        tracing::info!(
            total_faces = faces.len(),
            matched = results.len(),
            unmatched,
            invalid_faces,
            "session complete"
        );

        SessionOutcome {
            session_id,
            state: progress.state,
            total_faces: faces.len(),
            total_matched: results.len(),
            unmatched,
            invalid_faces,
            results,
            error: None,
        }
    }

    /// Dominant emotion for one matched face. Failures degrade to `None`.
    fn classify(&self, image: &[u8], face: &FaceDetection) -> Option<EmotionReading> {
        let classifier = self.classifier.as_ref()?;
        match classifier.classify(image, face.bounding_box.as_ref()) {
            Ok(Some(scores)) => scores.dominant(),
            Ok(None) => None,
            Err(err) => {
                tracing::warn!(error = %err, "keeping match without emotion");
                None
            }
        }
    }
}
