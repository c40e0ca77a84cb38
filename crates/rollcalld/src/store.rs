//! SQLite attendance store.
//!
//! One `attendance` row per committed session, one `attendance_detail` row
//! per matched face, and one `emotion_history` row per matched face that
//! carried an emotion. A session is written in a single transaction.

use chrono::{DateTime, SecondsFormat, Utc};
use rollcall_core::{
    CaptureContext, EmotionLabel, Identity, PersistenceError, SessionOutcome, SessionStore,
};
use rusqlite::{params, Connection};
use std::path::Path;
use thiserror::Error;

const SCHEMA: &str = "
CREATE TABLE IF NOT EXISTS attendance (
    id            INTEGER PRIMARY KEY AUTOINCREMENT,
    session_id    TEXT    NOT NULL UNIQUE,
    course_id     INTEGER NOT NULL,
    taken_at      TEXT    NOT NULL,
    kind          TEXT    NOT NULL,
    total_faces   INTEGER NOT NULL,
    total_matched INTEGER NOT NULL
);
CREATE TABLE IF NOT EXISTS attendance_detail (
    id            INTEGER PRIMARY KEY AUTOINCREMENT,
    attendance_id INTEGER NOT NULL REFERENCES attendance(id) ON DELETE CASCADE,
    identity      TEXT    NOT NULL,
    face_index    INTEGER NOT NULL,
    confidence    REAL    NOT NULL,
    emotion_label TEXT,
    emotion_score REAL
);
CREATE TABLE IF NOT EXISTS emotion_history (
    id          INTEGER PRIMARY KEY AUTOINCREMENT,
    identity    TEXT    NOT NULL,
    course_id   INTEGER NOT NULL,
    label       TEXT    NOT NULL,
    score       REAL    NOT NULL,
    recorded_at TEXT    NOT NULL
);
CREATE INDEX IF NOT EXISTS idx_attendance_course ON attendance(course_id, taken_at);
CREATE INDEX IF NOT EXISTS idx_detail_identity ON attendance_detail(identity);
CREATE INDEX IF NOT EXISTS idx_emotion_course ON emotion_history(course_id, recorded_at);
";

const KIND_FACE: &str = "FACE";

#[derive(Error, Debug)]
pub enum StoreError {
    #[error("sqlite: {0}")]
    Sqlite(#[from] rusqlite::Error),
    #[error("io: {0}")]
    Io(#[from] std::io::Error),
    #[error("corrupt row: {0}")]
    Corrupt(String),
}

/// Session summary row used by the daily report.
#[derive(Debug, Clone, PartialEq)]
pub struct SessionRow {
    pub session_id: String,
    pub taken_at: DateTime<Utc>,
    pub total_faces: usize,
    /// Distinct identities matched in the session.
    pub present: usize,
}

/// Attendance store backed by a single SQLite connection.
pub struct Store {
    conn: Connection,
}

impl Store {
    /// Open (or create) the database at `path`.
    pub fn open(path: &Path) -> Result<Self, StoreError> {
        if let Some(parent) = path.parent() {
            std::fs::create_dir_all(parent)?;
        }
        let conn = Connection::open(path)?;
        tracing::info!(path = %path.display(), "attendance store opened");
        Self::init(conn)
    }

    pub fn open_in_memory() -> Result<Self, StoreError> {
        Self::init(Connection::open_in_memory()?)
    }

    fn init(conn: Connection) -> Result<Self, StoreError> {
        conn.execute_batch("PRAGMA foreign_keys = ON;")?;
        conn.execute_batch(SCHEMA)?;
        Ok(Self { conn })
    }

    fn insert_session(
        &self,
        context: &CaptureContext,
        outcome: &SessionOutcome,
    ) -> Result<i64, StoreError> {
        let tx = self.conn.unchecked_transaction()?;
        let taken_at = timestamp(&context.captured_at);

        tx.execute(
            "INSERT INTO attendance
                 (session_id, course_id, taken_at, kind, total_faces, total_matched)
             VALUES (?1, ?2, ?3, ?4, ?5, ?6)",
            params![
                outcome.session_id.as_str(),
                context.course_id,
                taken_at,
                KIND_FACE,
                outcome.total_faces as i64,
                outcome.total_matched as i64,
            ],
        )?;
        let attendance_id = tx.last_insert_rowid();

        for result in &outcome.results {
            let identity = identity_key(&result.identity);
            tx.execute(
                "INSERT INTO attendance_detail
                     (attendance_id, identity, face_index, confidence, emotion_label, emotion_score)
                 VALUES (?1, ?2, ?3, ?4, ?5, ?6)",
                params![
                    attendance_id,
                    identity,
                    result.face_index as i64,
                    result.confidence,
                    result.emotion_label.map(|l| l.as_str()),
                    result.emotion_score,
                ],
            )?;

            if let Some(emotion) = result.emotion() {
                tx.execute(
                    "INSERT INTO emotion_history (identity, course_id, label, score, recorded_at)
                     VALUES (?1, ?2, ?3, ?4, ?5)",
                    params![
                        identity,
                        context.course_id,
                        emotion.label.as_str(),
                        emotion.score,
                        taken_at
                    ],
                )?;
            }
        }

        tx.commit()?;
        Ok(attendance_id)
    }

    /// Dominant emotions recorded for a course in `[from, to]`.
    ///
    /// With `identity` set, only that student's records are returned.
    pub fn emotion_labels(
        &self,
        course_id: i64,
        identity: Option<&Identity>,
        from: &DateTime<Utc>,
        to: &DateTime<Utc>,
    ) -> Result<Vec<EmotionLabel>, StoreError> {
        let mut stmt = self.conn.prepare(
            "SELECT label FROM emotion_history
             WHERE course_id = ?1 AND recorded_at BETWEEN ?2 AND ?3
               AND (?4 IS NULL OR identity = ?4)
             ORDER BY recorded_at, id",
        )?;
        let rows = stmt.query_map(
            params![
                course_id,
                timestamp(from),
                timestamp(to),
                identity.map(identity_key),
            ],
            |row| row.get::<_, String>(0),
        )?;

        let mut labels = Vec::new();
        for raw in rows {
            let raw = raw?;
            let label = raw
                .parse::<EmotionLabel>()
                .map_err(|e| StoreError::Corrupt(e.to_string()))?;
            labels.push(label);
        }
        Ok(labels)
    }

    /// Sessions of a course in `[from, to)`, oldest first.
    pub fn sessions_between(
        &self,
        course_id: i64,
        from: &DateTime<Utc>,
        to: &DateTime<Utc>,
    ) -> Result<Vec<SessionRow>, StoreError> {
        let mut stmt = self.conn.prepare(
            "SELECT a.session_id, a.taken_at, a.total_faces,
                    (SELECT COUNT(DISTINCT d.identity)
                       FROM attendance_detail d
                      WHERE d.attendance_id = a.id)
             FROM attendance a
             WHERE a.course_id = ?1 AND a.taken_at >= ?2 AND a.taken_at < ?3
             ORDER BY a.taken_at, a.id",
        )?;
        let rows = stmt.query_map(params![course_id, timestamp(from), timestamp(to)], |row| {
            Ok((
                row.get::<_, String>(0)?,
                row.get::<_, String>(1)?,
                row.get::<_, i64>(2)?,
                row.get::<_, i64>(3)?,
            ))
        })?;

        let mut sessions = Vec::new();
        for row in rows {
            let (session_id, taken_at, total_faces, present) = row?;
            sessions.push(SessionRow {
                session_id,
                taken_at: parse_timestamp(&taken_at)?,
                total_faces: total_faces as usize,
                present: present as usize,
            });
        }
        Ok(sessions)
    }

    /// Number of sessions of a course in `[from, to]` in which `identity` was matched.
    pub fn sessions_attended(
        &self,
        course_id: i64,
        identity: &Identity,
        from: &DateTime<Utc>,
        to: &DateTime<Utc>,
    ) -> Result<usize, StoreError> {
        let count: i64 = self.conn.query_row(
            "SELECT COUNT(DISTINCT a.id)
             FROM attendance a JOIN attendance_detail d ON d.attendance_id = a.id
             WHERE a.course_id = ?1 AND d.identity = ?2 AND a.taken_at BETWEEN ?3 AND ?4",
            params![course_id, identity_key(identity), timestamp(from), timestamp(to)],
            |row| row.get(0),
        )?;
        Ok(count as usize)
    }

    /// Number of sessions of a course in `[from, to]`.
    pub fn sessions_held(
        &self,
        course_id: i64,
        from: &DateTime<Utc>,
        to: &DateTime<Utc>,
    ) -> Result<usize, StoreError> {
        let count: i64 = self.conn.query_row(
            "SELECT COUNT(*) FROM attendance WHERE course_id = ?1 AND taken_at BETWEEN ?2 AND ?3",
            params![course_id, timestamp(from), timestamp(to)],
            |row| row.get(0),
        )?;
        Ok(count as usize)
    }

    pub fn session_count(&self) -> Result<usize, StoreError> {
        let count: i64 = self
            .conn
            .query_row("SELECT COUNT(*) FROM attendance", [], |row| row.get(0))?;
        Ok(count as usize)
    }
}

impl SessionStore for Store {
    fn save_session(
        &self,
        context: &CaptureContext,
        outcome: &SessionOutcome,
    ) -> Result<i64, PersistenceError> {
        self.insert_session(context, outcome).map_err(|err| {
            tracing::error!(
                error = %err,
                session_id = %outcome.session_id,
                "session write rolled back"
            );
            match err {
                StoreError::Io(e) => PersistenceError::Unavailable(e.to_string()),
                other => PersistenceError::Rejected(other.to_string()),
            }
        })
    }
}

/// Fixed-width RFC 3339 so stored timestamps compare lexically.
fn timestamp(at: &DateTime<Utc>) -> String {
    at.to_rfc3339_opts(SecondsFormat::Micros, true)
}

fn parse_timestamp(raw: &str) -> Result<DateTime<Utc>, StoreError> {
    DateTime::parse_from_rfc3339(raw)
        .map(|dt| dt.with_timezone(&Utc))
        .map_err(|e| StoreError::Corrupt(format!("timestamp {raw:?}: {e}")))
}

/// JSON encoding keeps `42` and `"42"` distinct.
fn identity_key(identity: &Identity) -> String {
    match identity {
        Identity::Id(id) => id.to_string(),
        Identity::Key(key) => serde_json::Value::String(key.clone()).to_string(),
    }
}
