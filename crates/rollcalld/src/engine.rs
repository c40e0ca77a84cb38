use crate::backend::{CommandClassifier, CommandExtractor, CommandLine};
use crate::config::Config;
use crate::notify::{LogSink, NoticeSink, NotificationGateway, OutboxSink};
use crate::report::{self, CourseEmotionReport, DailyReport, ReportError, StudentReport, Window};
use crate::store::{Store, StoreError};
use chrono::{NaiveDate, Utc};
use rollcall_core::{
    commit_session, CaptureContext, CaptureError, Identity, Recorded, RosterEntry, SessionBuilder,
    SessionId, SessionOutcome, Tolerance,
};
use serde::Serialize;
use std::time::Duration;
use thiserror::Error;
use tokio::sync::{mpsc, oneshot};

#[derive(Error, Debug)]
pub enum EngineError {
    #[error("store error: {0}")]
    Store(#[from] StoreError),
    #[error("report error: {0}")]
    Report(#[from] ReportError),
    #[error("capture error: {0}")]
    Capture(#[from] CaptureError),
    #[error("configuration error: {0}")]
    Config(String),
    #[error("failed to start worker: {0}")]
    Spawn(#[from] std::io::Error),
    #[error("engine thread exited")]
    ChannelClosed,
}

/// Result of a capture request.
#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct CaptureReply {
    /// Store id, present only when the session was committed.
    pub record_id: Option<i64>,
    pub outcome: SessionOutcome,
}

/// Daemon state snapshot.
#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct EngineStatus {
    pub sessions_recorded: usize,
    pub emotion_enabled: bool,
}

/// Messages sent from D-Bus handlers to the engine thread.
enum EngineRequest {
    Capture {
        context: CaptureContext,
        image: Vec<u8>,
        roster: Vec<RosterEntry>,
        tolerance: Tolerance,
        reply: oneshot::Sender<Result<CaptureReply, EngineError>>,
    },
    CourseEmotions {
        course_id: i64,
        window: Window,
        reply: oneshot::Sender<Result<CourseEmotionReport, EngineError>>,
    },
    Daily {
        course_id: i64,
        date: NaiveDate,
        reply: oneshot::Sender<Result<DailyReport, EngineError>>,
    },
    Student {
        identity: Identity,
        course_id: i64,
        window: Window,
        reply: oneshot::Sender<Result<StudentReport, EngineError>>,
    },
    Status {
        reply: oneshot::Sender<Result<EngineStatus, EngineError>>,
    },
}

/// Clone-safe handle to the engine thread.
#[derive(Clone)]
pub struct EngineHandle {
    tx: mpsc::Sender<EngineRequest>,
}

impl EngineHandle {
    async fn request<T>(
        &self,
        build: impl FnOnce(oneshot::Sender<Result<T, EngineError>>) -> EngineRequest,
    ) -> Result<T, EngineError> {
        let (reply_tx, reply_rx) = oneshot::channel();
        self.tx
            .send(build(reply_tx))
            .await
            .map_err(|_| EngineError::ChannelClosed)?;
        reply_rx.await.map_err(|_| EngineError::ChannelClosed)?
    }

    /// Match one photograph against a roster snapshot and commit the session.
    ///
    /// Dropping the returned future before it resolves abandons the capture:
    /// the engine discards the outcome instead of committing it.
    pub async fn capture(
        &self,
        context: CaptureContext,
        image: Vec<u8>,
        roster: Vec<RosterEntry>,
        tolerance: Tolerance,
    ) -> Result<CaptureReply, EngineError> {
        self.request(|reply| EngineRequest::Capture {
            context,
            image,
            roster,
            tolerance,
            reply,
        })
        .await
    }

    pub async fn course_emotions(
        &self,
        course_id: i64,
        window: Window,
    ) -> Result<CourseEmotionReport, EngineError> {
        self.request(|reply| EngineRequest::CourseEmotions {
            course_id,
            window,
            reply,
        })
        .await
    }

    pub async fn daily(&self, course_id: i64, date: NaiveDate) -> Result<DailyReport, EngineError> {
        self.request(|reply| EngineRequest::Daily {
            course_id,
            date,
            reply,
        })
        .await
    }

    pub async fn student(
        &self,
        identity: Identity,
        course_id: i64,
        window: Window,
    ) -> Result<StudentReport, EngineError> {
        self.request(|reply| EngineRequest::Student {
            identity,
            course_id,
            window,
            reply,
        })
        .await
    }

    pub async fn status(&self) -> Result<EngineStatus, EngineError> {
        self.request(|reply| EngineRequest::Status { reply }).await
    }
}

/// Everything the engine thread owns.
struct Engine {
    builder: SessionBuilder,
    store: Store,
    notifier: NotificationGateway,
}

/// Spawn the engine on a dedicated OS thread.
///
/// Opens the store and wires the collaborators synchronously so the
/// daemon fails fast on a bad configuration.
pub fn spawn_engine(config: &Config) -> Result<EngineHandle, EngineError> {
    let extractor_line = config
        .extractor_cmd
        .as_deref()
        .and_then(CommandLine::parse)
        .ok_or_else(|| EngineError::Config("ROLLCALL_EXTRACTOR_CMD is not set".into()))?;

    // A hung backend is killed rather than left holding the engine thread.
    let backend_timeout = Duration::from_secs(config.capture_timeout_secs);
    let span = tracing::info_span!("engine");
    let mut builder = SessionBuilder::new(CommandExtractor::new(extractor_line, backend_timeout))
        .with_span(span);
    match config.classifier_cmd.as_deref().and_then(CommandLine::parse) {
        Some(line) => {
            builder = builder.with_classifier(CommandClassifier::new(line, backend_timeout))
        }
        None => tracing::info!("emotion classifier disabled"),
    }

    let store = Store::open(&config.db_path)?;

    let sink: Box<dyn NoticeSink> = match &config.outbox_path {
        Some(path) => {
            tracing::info!(path = %path.display(), "writing notices to outbox");
            Box::new(OutboxSink::open(path)?)
        }
        None => Box::new(LogSink),
    };
    let notifier = NotificationGateway::spawn(sink)?;

    Ok(start(Engine {
        builder,
        store,
        notifier,
    })?)
}

fn start(engine: Engine) -> std::io::Result<EngineHandle> {
    let (tx, mut rx) = mpsc::channel::<EngineRequest>(8);

    std::thread::Builder::new()
        .name("rollcall-engine".into())
        .spawn(move || {
            tracing::info!("engine thread started");
            while let Some(req) = rx.blocking_recv() {
                engine.handle(req);
            }
            engine.notifier.shutdown();
            tracing::info!("engine thread exiting");
        })?;

    Ok(EngineHandle { tx })
}

impl Engine {
    fn handle(&self, req: EngineRequest) {
        match req {
            EngineRequest::Capture {
                context,
                image,
                roster,
                tolerance,
                reply,
            } => {
                let session_id = SessionId::new(uuid::Uuid::new_v4().to_string());
                let outcome = self.builder.build_session(session_id, &image, &roster, tolerance);

                if reply.is_closed() {
                    tracing::warn!(
                        session_id = %outcome.session_id,
                        "requester gone before commit; discarding session"
                    );
                    return;
                }

                let result = self.commit(&context, outcome, &roster);
                let _ = reply.send(result);
            }
            EngineRequest::CourseEmotions {
                course_id,
                window,
                reply,
            } => {
                let result = report::course_emotions(&self.store, course_id, window);
                let _ = reply.send(result.map_err(EngineError::from));
            }
            EngineRequest::Daily {
                course_id,
                date,
                reply,
            } => {
                let result = report::daily(&self.store, course_id, date);
                let _ = reply.send(result.map_err(EngineError::from));
            }
            EngineRequest::Student {
                identity,
                course_id,
                window,
                reply,
            } => {
                let result = report::student(&self.store, identity, course_id, window);
                let _ = reply.send(result.map_err(EngineError::from));
            }
            EngineRequest::Status { reply } => {
                let result = self.store.session_count().map(|sessions_recorded| EngineStatus {
                    sessions_recorded,
                    emotion_enabled: self.builder.has_classifier(),
                });
                let _ = reply.send(result.map_err(EngineError::from));
            }
        }
    }

    /// Commit a built session. Failed sessions are answered, not stored.
    fn commit(
        &self,
        context: &CaptureContext,
        outcome: SessionOutcome,
        roster: &[RosterEntry],
    ) -> Result<CaptureReply, EngineError> {
        match commit_session(&self.store, &self.notifier, context, outcome, roster) {
            Ok(Recorded { record_id, outcome }) => Ok(CaptureReply {
                record_id: Some(record_id),
                outcome,
            }),
            Err(CaptureError::Session(failure, outcome)) => {
                tracing::info!(error = %failure, "capture produced no attendance");
                Ok(CaptureReply {
                    record_id: None,
                    outcome: *outcome,
                })
            }
            Err(err) => Err(err.into()),
        }
    }
}

/// Capture timestamp for a request arriving now.
pub fn capture_context(course_id: i64) -> CaptureContext {
    CaptureContext {
        course_id,
        captured_at: Utc::now(),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use rollcall_core::{
        EmbeddingExtractor, ExtractorError, FaceDetection, SessionFailure, EMBEDDING_DIM,
    };
    use std::sync::{mpsc as std_mpsc, Mutex};

    struct OneFace;

    impl EmbeddingExtractor for OneFace {
        fn extract(&self, image: &[u8]) -> Result<Vec<FaceDetection>, ExtractorError> {
            if image.is_empty() {
                return Ok(Vec::new());
            }
            Ok(vec![FaceDetection {
                bounding_box: None,
                embedding: vec![0.0; EMBEDDING_DIM].into(),
            }])
        }
    }

    /// Holds each extraction until the test releases it.
    struct Gated {
        gate: Mutex<std_mpsc::Receiver<()>>,
    }

    impl EmbeddingExtractor for Gated {
        fn extract(&self, image: &[u8]) -> Result<Vec<FaceDetection>, ExtractorError> {
            let _ = self.gate.lock().unwrap().recv();
            OneFace.extract(image)
        }
    }

    fn engine() -> EngineHandle {
        engine_with(OneFace)
    }

    fn engine_with(extractor: impl EmbeddingExtractor + Send + 'static) -> EngineHandle {
        let engine = Engine {
            builder: SessionBuilder::new(extractor),
            store: Store::open_in_memory().unwrap(),
            notifier: NotificationGateway::spawn(Box::new(LogSink)).unwrap(),
        };
        start(engine).unwrap()
    }

    fn roster() -> Vec<RosterEntry> {
        vec![RosterEntry::new(5, vec![0.0; EMBEDDING_DIM])]
    }

    #[tokio::test]
    async fn test_capture_commits_and_reports() {
        let handle = engine();
        let reply = handle
            .capture(capture_context(1), b"img".to_vec(), roster(), Tolerance::default())
            .await
            .unwrap();
        assert!(reply.record_id.is_some());
        assert_eq!(reply.outcome.total_matched, 1);

        let status = handle.status().await.unwrap();
        assert_eq!(status.sessions_recorded, 1);
        assert!(!status.emotion_enabled);

        let today = Utc::now().date_naive();
        let daily = handle.daily(1, today).await.unwrap();
        assert_eq!(daily.sessions.len(), 1);
        assert_eq!(daily.sessions[0].present, 1);
    }

    #[tokio::test]
    async fn test_no_face_is_answered_not_stored() {
        let handle = engine();
        let reply = handle
            .capture(capture_context(1), Vec::new(), roster(), Tolerance::default())
            .await
            .unwrap();
        assert_eq!(reply.record_id, None);
        assert_eq!(reply.outcome.error, Some(SessionFailure::NoFaceDetected));
        assert_eq!(handle.status().await.unwrap().sessions_recorded, 0);
    }

    #[tokio::test]
    async fn test_abandoned_capture_is_not_committed() {
        let (release, gate) = std_mpsc::channel();
        let handle = engine_with(Gated { gate: Mutex::new(gate) });

        let abandoned = tokio::time::timeout(
            Duration::from_millis(50),
            handle.capture(capture_context(1), b"img".to_vec(), roster(), Tolerance::default()),
        )
        .await;
        assert!(abandoned.is_err());

        release.send(()).unwrap();
        assert_eq!(handle.status().await.unwrap().sessions_recorded, 0);

        release.send(()).unwrap();
        let reply = handle
            .capture(capture_context(1), b"img".to_vec(), roster(), Tolerance::default())
            .await
            .unwrap();
        assert!(reply.record_id.is_some());
        assert_eq!(handle.status().await.unwrap().sessions_recorded, 1);
    }
}
