use crate::engine::{capture_context, EngineError, EngineHandle};
use crate::report::Window;
use chrono::{DateTime, NaiveDate, Utc};
use rollcall_core::{Identity, RosterEntry, Tolerance};
use serde::Serialize;
use std::time::Duration;
use zbus::interface;

/// D-Bus interface for the Rollcall attendance daemon.
///
/// Bus name: org.rollcall.Attendance1
/// Object path: /org/rollcall/Attendance1
pub struct AttendanceService {
    engine: EngineHandle,
    tolerance: Tolerance,
    capture_timeout: Duration,
    report_window_days: u32,
}

impl AttendanceService {
    pub fn new(
        engine: EngineHandle,
        tolerance: Tolerance,
        capture_timeout: Duration,
        report_window_days: u32,
    ) -> Self {
        Self {
            engine,
            tolerance,
            capture_timeout,
            report_window_days,
        }
    }

    fn window(&self, days: u32) -> zbus::fdo::Result<Window> {
        report_window(Utc::now(), days, self.report_window_days)
    }
}

#[interface(name = "org.rollcall.Attendance1")]
impl AttendanceService {
    /// Take attendance for a course from one photograph.
    ///
    /// `roster` is a JSON array of `{"identity", "embedding", "contact"?}`.
    /// Returns the session outcome as JSON; failed sessions are returned,
    /// not raised.
    async fn capture(
        &self,
        course_id: i64,
        image: Vec<u8>,
        roster: &str,
    ) -> zbus::fdo::Result<String> {
        let roster: Vec<RosterEntry> = serde_json::from_str(roster)
            .map_err(|e| zbus::fdo::Error::InvalidArgs(format!("roster: {e}")))?;
        tracing::info!(course_id, roster = roster.len(), bytes = image.len(), "capture requested");

        let request = self
            .engine
            .capture(capture_context(course_id), image, roster, self.tolerance);
        let reply = tokio::time::timeout(self.capture_timeout, request)
            .await
            .map_err(|_| {
                tracing::warn!(course_id, "capture timed out");
                zbus::fdo::Error::Failed("capture timed out".into())
            })?
            .map_err(to_fdo)?;

        to_json(&reply)
    }

    /// Emotion distribution for a course over the last `days` days (0 = default).
    async fn emotion_report(&self, course_id: i64, days: u32) -> zbus::fdo::Result<String> {
        let report = self
            .engine
            .course_emotions(course_id, self.window(days)?)
            .await
            .map_err(to_fdo)?;
        to_json(&report)
    }

    /// Sessions held for a course on a UTC date (`YYYY-MM-DD`, empty = today).
    async fn daily_report(&self, course_id: i64, date: &str) -> zbus::fdo::Result<String> {
        let date = if date.is_empty() {
            Utc::now().date_naive()
        } else {
            NaiveDate::parse_from_str(date, "%Y-%m-%d")
                .map_err(|e| zbus::fdo::Error::InvalidArgs(format!("date: {e}")))?
        };
        if Window::day(date).is_none() {
            return Err(zbus::fdo::Error::InvalidArgs(format!("date {date} is out of range")));
        }
        let report = self.engine.daily(course_id, date).await.map_err(to_fdo)?;
        to_json(&report)
    }

    /// Attendance and emotions for one student in a course.
    async fn student_report(
        &self,
        identity: &str,
        course_id: i64,
        days: u32,
    ) -> zbus::fdo::Result<String> {
        let identity = parse_identity(identity)?;
        let report = self
            .engine
            .student(identity, course_id, self.window(days)?)
            .await
            .map_err(to_fdo)?;
        to_json(&report)
    }

    /// Return daemon status information.
    async fn status(&self) -> zbus::fdo::Result<String> {
        let status = self.engine.status().await.map_err(to_fdo)?;
        Ok(serde_json::json!({
            "version": env!("CARGO_PKG_VERSION"),
            "tolerance": self.tolerance.get(),
            "sessions_recorded": status.sessions_recorded,
            "emotion_enabled": status.emotion_enabled,
        })
        .to_string())
    }
}

/// Look-back window ending at `now`; `days == 0` selects `default_days`.
fn report_window(now: DateTime<Utc>, days: u32, default_days: u32) -> zbus::fdo::Result<Window> {
    let days = if days == 0 { default_days } else { days };
    Window::last_days(now, days)
        .ok_or_else(|| zbus::fdo::Error::InvalidArgs(format!("days {days} is out of range")))
}

/// Numeric identities are store ids; anything else is an opaque key.
fn parse_identity(raw: &str) -> zbus::fdo::Result<Identity> {
    let raw = raw.trim();
    if raw.is_empty() {
        return Err(zbus::fdo::Error::InvalidArgs("identity is empty".into()));
    }
    Ok(raw
        .parse::<i64>()
        .map(Identity::Id)
        .unwrap_or_else(|_| Identity::Key(raw.to_string())))
}

fn to_json(value: &impl Serialize) -> zbus::fdo::Result<String> {
    serde_json::to_string(value).map_err(|e| zbus::fdo::Error::Failed(e.to_string()))
}

fn to_fdo(err: EngineError) -> zbus::fdo::Error {
    tracing::error!(error = %err, "request failed");
    zbus::fdo::Error::Failed(err.to_string())
}
