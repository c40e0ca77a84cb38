//! Notification gateway.
//!
//! Notices are queued on an unbounded channel and delivered by a
//! dedicated worker thread, so a slow or broken sink never holds up a
//! capture. Delivery failures are logged and dropped.

use rollcall_core::{AttendanceNotice, Notifier};
use std::fs::{File, OpenOptions};
use std::io::{self, Write};
use std::path::Path;
use std::thread::JoinHandle;
use tokio::sync::mpsc;

/// Destination for attendance notices.
pub trait NoticeSink: Send {
    fn deliver(&mut self, notice: &AttendanceNotice) -> io::Result<()>;
}

/// Logs each notice.
pub struct LogSink;

impl NoticeSink for LogSink {
    fn deliver(&mut self, notice: &AttendanceNotice) -> io::Result<()> {
        tracing::info!(
            course_id = notice.course_id,
            identity = %notice.identity,
            email = notice.contact.email.as_deref().unwrap_or("-"),
            present = notice.present,
            "attendance notice"
        );
        Ok(())
    }
}

/// Appends each notice as one JSON line, for a mailer to pick up.
pub struct OutboxSink {
    file: File,
}

impl OutboxSink {
    pub fn open(path: &Path) -> io::Result<Self> {
        if let Some(parent) = path.parent() {
            std::fs::create_dir_all(parent)?;
        }
        let file = OpenOptions::new().create(true).append(true).open(path)?;
        Ok(Self { file })
    }
}

impl NoticeSink for OutboxSink {
    fn deliver(&mut self, notice: &AttendanceNotice) -> io::Result<()> {
        let mut line = serde_json::to_vec(notice)?;
        line.push(b'\n');
        self.file.write_all(&line)?;
        self.file.flush()
    }
}

/// Handle to the notification worker thread.
pub struct NotificationGateway {
    tx: mpsc::UnboundedSender<AttendanceNotice>,
    worker: JoinHandle<()>,
}

impl NotificationGateway {
    pub fn spawn(mut sink: Box<dyn NoticeSink>) -> io::Result<Self> {
        let (tx, mut rx) = mpsc::unbounded_channel::<AttendanceNotice>();

        let worker = std::thread::Builder::new()
            .name("rollcall-notify".into())
            .spawn(move || {
                while let Some(notice) = rx.blocking_recv() {
                    if let Err(err) = sink.deliver(&notice) {
                        tracing::warn!(
                            error = %err,
                            identity = %notice.identity,
                            "notice delivery failed"
                        );
                    }
                }
                tracing::debug!("notification worker exiting");
            })?;

        Ok(Self { tx, worker })
    }

    /// Stop accepting notices and wait for the queue to drain.
    pub fn shutdown(self) {
        let Self { tx, worker } = self;
        drop(tx);
        if worker.join().is_err() {
            tracing::error!("notification worker panicked");
        }
    }
}

impl Notifier for NotificationGateway {
    fn notify(&self, notice: AttendanceNotice) {
        if self.tx.send(notice).is_err() {
            tracing::warn!("notification worker gone; notice dropped");
        }
    }
}
