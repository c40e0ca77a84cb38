//! Capture orchestration: build a session, persist it, inform the roster.

use crate::session::{SessionBuilder, SessionFailure, SessionId, SessionOutcome};
use crate::types::{Contact, Identity, RosterEntry, Tolerance};
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::HashSet;
use thiserror::Error;

#[derive(Error, Debug)]
pub enum PersistenceError {
    #[error("store unavailable: {0}")]
    Unavailable(String),
    #[error("write rejected: {0}")]
    Rejected(String),
}

#[derive(Error, Debug)]
pub enum CaptureError {
    /// The session reached a failed terminal state; nothing was stored.
    #[error("capture failed: {0}")]
    Session(SessionFailure, Box<SessionOutcome>),
    /// The session was built but could not be committed.
    #[error("session not committed: {0}")]
    Persistence(#[from] PersistenceError),
}

/// Where and when a photograph was taken.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CaptureContext {
    pub course_id: i64,
    pub captured_at: DateTime<Utc>,
}

/// Durable store for session outcomes.
pub trait SessionStore {
    /// Persist the outcome and all its match rows atomically, returning the record id.
    fn save_session(
        &self,
        context: &CaptureContext,
        outcome: &SessionOutcome,
    ) -> Result<i64, PersistenceError>;
}

/// Per-student attendance result handed to the notification gateway.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct AttendanceNotice {
    pub session_id: SessionId,
    pub course_id: i64,
    pub identity: Identity,
    pub contact: Contact,
    pub present: bool,
}

/// Fire-and-forget delivery of attendance notices. Must not block on delivery.
pub trait Notifier {
    fn notify(&self, notice: AttendanceNotice);
}

/// A committed session.
#[derive(Debug, Clone, PartialEq)]
pub struct Recorded {
    pub record_id: i64,
    pub outcome: SessionOutcome,
}

/// Build a session, commit it, then notify every roster member.
///
/// Failed sessions are returned without touching the store. Nothing is
/// sent if the store rejects the write; the caller may retry the whole
/// capture with the same inputs.
#[allow(clippy::too_many_arguments)]
pub fn record_capture(
    builder: &SessionBuilder,
    store: &dyn SessionStore,
    notifier: &dyn Notifier,
    context: &CaptureContext,
    session_id: SessionId,
    image: &[u8],
    roster: &[RosterEntry],
    tolerance: Tolerance,
) -> Result<Recorded, CaptureError> {
    let outcome = builder.build_session(session_id, image, roster, tolerance);
    commit_session(store, notifier, context, outcome, roster)
}

/// Persist an already built outcome and notify the roster it was built from.
pub fn commit_session(
    store: &dyn SessionStore,
    notifier: &dyn Notifier,
    context: &CaptureContext,
    outcome: SessionOutcome,
    roster: &[RosterEntry],
) -> Result<Recorded, CaptureError> {
    if let Some(failure) = outcome.error {
        return Err(CaptureError::Session(failure, Box::new(outcome)));
    }

    let record_id = store.save_session(context, &outcome)?;
    tracing::info!(
        record_id,
        course_id = context.course_id,
        session_id = %outcome.session_id,
        matched = outcome.total_matched,
        "session committed"
    );

    notify_roster(notifier, context, &outcome, roster);

    Ok(Recorded { record_id, outcome })
}

fn notify_roster(
    notifier: &dyn Notifier,
    context: &CaptureContext,
    outcome: &SessionOutcome,
    roster: &[RosterEntry],
) {
    let present: HashSet<&Identity> = outcome.results.iter().map(|r| &r.identity).collect();
    for entry in roster {
        notifier.notify(AttendanceNotice {
            session_id: outcome.session_id.clone(),
            course_id: context.course_id,
            identity: entry.identity.clone(),
            contact: entry.contact.clone(),
            present: present.contains(&entry.identity),
        });
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::session::{EmbeddingExtractor, ExtractorError};
    use crate::types::{Embedding, FaceDetection, EMBEDDING_DIM};
    use std::cell::RefCell;

    fn offset(value: f64) -> Embedding {
        let mut values = vec![0.0; EMBEDDING_DIM];
        values[0] = value;
        Embedding::new(values)
    }

    struct FixedExtractor(Vec<f64>);

    impl EmbeddingExtractor for FixedExtractor {
        fn extract(&self, _image: &[u8]) -> Result<Vec<FaceDetection>, ExtractorError> {
            Ok(self
                .0
                .iter()
                .map(|v| FaceDetection { bounding_box: None, embedding: offset(*v) })
                .collect())
        }
    }

    #[derive(Default)]
    struct MemoryStore {
        saved: RefCell<Vec<(i64, SessionOutcome)>>,
        reject: bool,
    }

    impl SessionStore for MemoryStore {
        fn save_session(
            &self,
            context: &CaptureContext,
            outcome: &SessionOutcome,
        ) -> Result<i64, PersistenceError> {
            if self.reject {
                return Err(PersistenceError::Unavailable("disk full".into()));
            }
            let mut saved = self.saved.borrow_mut();
            saved.push((context.course_id, outcome.clone()));
            Ok(saved.len() as i64)
        }
    }

    #[derive(Default)]
    struct MemoryNotifier {
        sent: RefCell<Vec<AttendanceNotice>>,
    }

    impl Notifier for MemoryNotifier {
        fn notify(&self, notice: AttendanceNotice) {
            self.sent.borrow_mut().push(notice);
        }
    }

    fn context() -> CaptureContext {
        CaptureContext { course_id: 12, captured_at: Utc::now() }
    }

    fn roster() -> Vec<RosterEntry> {
        vec![
            RosterEntry::new(1, offset(0.0)).with_contact(Contact {
                display_name: Some("Ada".into()),
                email: Some("ada@example.com".into()),
            }),
            RosterEntry::new(2, offset(3.0)),
        ]
    }

    #[test]
    fn test_commit_then_notify_each_roster_member() {
        let builder = SessionBuilder::new(FixedExtractor(vec![0.05]));
        let store = MemoryStore::default();
        let notifier = MemoryNotifier::default();

        let recorded = record_capture(
            &builder,
            &store,
            &notifier,
            &context(),
            SessionId::new("a"),
            b"img",
            &roster(),
            Tolerance::default(),
        )
        .unwrap();

        assert_eq!(recorded.record_id, 1);
        assert_eq!(recorded.outcome.total_matched, 1);
        assert_eq!(store.saved.borrow()[0].0, 12);

        let sent = notifier.sent.borrow();
        assert_eq!(sent.len(), 2);
        assert_eq!(sent[0].identity, Identity::Id(1));
        assert!(sent[0].present);
        assert_eq!(sent[0].contact.email.as_deref(), Some("ada@example.com"));
        assert_eq!(sent[1].identity, Identity::Id(2));
        assert!(!sent[1].present);
    }

    #[test]
    fn test_failed_session_not_persisted() {
        let builder = SessionBuilder::new(FixedExtractor(vec![]));
        let store = MemoryStore::default();
        let notifier = MemoryNotifier::default();

        let err = record_capture(
            &builder,
            &store,
            &notifier,
            &context(),
            SessionId::new("b"),
            b"img",
            &roster(),
            Tolerance::default(),
        )
        .unwrap_err();

        match err {
            CaptureError::Session(failure, outcome) => {
                assert_eq!(failure, SessionFailure::NoFaceDetected);
                assert_eq!(outcome.total_faces, 0);
            }
            other => panic!("unexpected error: {other}"),
        }
        assert!(store.saved.borrow().is_empty());
        assert!(notifier.sent.borrow().is_empty());
    }

    #[test]
    fn test_persistence_failure_sends_nothing() {
        let builder = SessionBuilder::new(FixedExtractor(vec![0.0]));
        let store = MemoryStore { reject: true, ..Default::default() };
        let notifier = MemoryNotifier::default();

        let err = record_capture(
            &builder,
            &store,
            &notifier,
            &context(),
            SessionId::new("c"),
            b"img",
            &roster(),
            Tolerance::default(),
        )
        .unwrap_err();

        assert!(matches!(err, CaptureError::Persistence(_)));
        assert!(notifier.sent.borrow().is_empty());
    }
}
