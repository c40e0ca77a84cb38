//! Attendance and emotion reports over stored sessions.

use crate::store::{Store, StoreError};
use chrono::{DateTime, Duration, NaiveDate, NaiveTime, Utc};
use rollcall_core::{aggregate, EmotionDistribution, Identity};
use serde::Serialize;
use thiserror::Error;

#[derive(Error, Debug)]
pub enum ReportError {
    #[error(transparent)]
    Store(#[from] StoreError),
    #[error("date {0} is outside the supported range")]
    DateOutOfRange(NaiveDate),
}

/// Half-open reporting interval `[start, end)`.
#[derive(Debug, Clone, Copy, PartialEq, Serialize)]
pub struct Window {
    pub start: DateTime<Utc>,
    pub end: DateTime<Utc>,
}

impl Window {
    /// The `days` days before `end`, or `None` if that reaches past the calendar.
    pub fn last_days(end: DateTime<Utc>, days: u32) -> Option<Self> {
        let span = Duration::try_days(i64::from(days))?;
        Some(Self {
            start: end.checked_sub_signed(span)?,
            end,
        })
    }

    /// The UTC day `date`, or `None` for the last representable day.
    pub fn day(date: NaiveDate) -> Option<Self> {
        let start = date.and_time(NaiveTime::MIN).and_utc();
        Some(Self {
            start,
            end: start.checked_add_signed(Duration::days(1))?,
        })
    }
}

#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct CourseEmotionReport {
    pub course_id: i64,
    pub window: Window,
    pub emotions: EmotionDistribution,
}

#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct SessionSummary {
    pub session_id: String,
    pub taken_at: DateTime<Utc>,
    pub total_faces: usize,
    pub present: usize,
}

#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct DailyReport {
    pub course_id: i64,
    pub date: NaiveDate,
    pub sessions: Vec<SessionSummary>,
}

#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct StudentReport {
    pub identity: Identity,
    pub course_id: i64,
    pub window: Window,
    pub sessions_held: usize,
    pub sessions_attended: usize,
    /// `sessions_attended / sessions_held`, 0 when nothing was held.
    pub attendance_rate: f64,
    pub emotions: EmotionDistribution,
}

pub fn course_emotions(
    store: &Store,
    course_id: i64,
    window: Window,
) -> Result<CourseEmotionReport, ReportError> {
    let labels = store.emotion_labels(course_id, None, &window.start, &window.end)?;
    Ok(CourseEmotionReport {
        course_id,
        window,
        emotions: aggregate(labels),
    })
}

pub fn daily(store: &Store, course_id: i64, date: NaiveDate) -> Result<DailyReport, ReportError> {
    let day = Window::day(date).ok_or(ReportError::DateOutOfRange(date))?;
    let sessions = store
        .sessions_between(course_id, &day.start, &day.end)?
        .into_iter()
        .map(|row| SessionSummary {
            session_id: row.session_id,
            taken_at: row.taken_at,
            total_faces: row.total_faces,
            present: row.present,
        })
        .collect();

    Ok(DailyReport {
        course_id,
        date,
        sessions,
    })
}

pub fn student(
    store: &Store,
    identity: Identity,
    course_id: i64,
    window: Window,
) -> Result<StudentReport, ReportError> {
    let held = store.sessions_held(course_id, &window.start, &window.end)?;
    let attended = store.sessions_attended(course_id, &identity, &window.start, &window.end)?;
    let labels = store.emotion_labels(course_id, Some(&identity), &window.start, &window.end)?;

    Ok(StudentReport {
        identity,
        course_id,
        window,
        sessions_held: held,
        sessions_attended: attended,
        attendance_rate: if held > 0 { attended as f64 / held as f64 } else { 0.0 },
        emotions: aggregate(labels),
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::TimeZone;
    use rollcall_core::{
        CaptureContext, EmotionLabel, MatchResult, SessionId, SessionOutcome, SessionState,
        SessionStore,
    };

    fn save(store: &Store, id: &str, day: u32, hour: u32, matches: &[(i64, Option<EmotionLabel>)]) {
        let results: Vec<MatchResult> = matches
            .iter()
            .enumerate()
            .map(|(i, (who, emotion))| MatchResult {
                face_index: i,
                identity: Identity::Id(*who),
                confidence: 0.75,
                emotion_label: *emotion,
                emotion_score: emotion.map(|_| 0.6),
            })
            .collect();
        let outcome = SessionOutcome {
            session_id: SessionId::new(id),
            state: SessionState::Complete,
            total_faces: results.len(),
            total_matched: results.len(),
            unmatched: 0,
            invalid_faces: 0,
            results,
            error: None,
        };
        let context = CaptureContext {
            course_id: 3,
            captured_at: Utc.with_ymd_and_hms(2026, 5, day, hour, 0, 0).unwrap(),
        };
        store.save_session(&context, &outcome).unwrap();
    }

    fn seeded() -> Store {
        let store = Store::open_in_memory().unwrap();
        let happy = Some(EmotionLabel::Happy);
        save(&store, "mon", 4, 9, &[(1, happy), (2, happy)]);
        save(&store, "tue", 5, 9, &[(1, Some(EmotionLabel::Neutral))]);
        save(&store, "wed", 6, 9, &[(2, Some(EmotionLabel::Sad)), (3, None)]);
        store
    }

    fn end() -> DateTime<Utc> {
        Utc.with_ymd_and_hms(2026, 5, 7, 0, 0, 0).unwrap()
    }

    fn window(days: u32) -> Window {
        Window::last_days(end(), days).unwrap()
    }

    #[test]
    fn test_course_emotions_over_window() {
        let store = seeded();
        let report = course_emotions(&store, 3, window(30)).unwrap();
        assert_eq!(report.emotions.total_analyzed, 4);
        assert_eq!(report.emotions.counts[&EmotionLabel::Happy], 2);
        assert_eq!(report.emotions.percentages[&EmotionLabel::Happy], 50.0);
        assert_eq!(report.emotions.percentages[&EmotionLabel::Sad], 25.0);

        let recent = course_emotions(&store, 3, window(1)).unwrap();
        assert_eq!(recent.emotions.total_analyzed, 1);
        assert_eq!(recent.emotions.counts[&EmotionLabel::Sad], 1);
    }

    #[test]
    fn test_empty_window_has_empty_distribution() {
        let store = seeded();
        let report = course_emotions(&store, 99, window(30)).unwrap();
        assert_eq!(report.emotions, EmotionDistribution::default());
    }

    #[test]
    fn test_daily_report() {
        let store = seeded();
        let date = NaiveDate::from_ymd_opt(2026, 5, 6).unwrap();
        let report = daily(&store, 3, date).unwrap();
        assert_eq!(report.sessions.len(), 1);
        assert_eq!(report.sessions[0].session_id, "wed");
        assert_eq!(report.sessions[0].present, 2);
    }

    #[test]
    fn test_student_report() {
        let store = seeded();
        let report = student(&store, Identity::Id(1), 3, window(30)).unwrap();
        assert_eq!(report.sessions_held, 3);
        assert_eq!(report.sessions_attended, 2);
        assert!((report.attendance_rate - 2.0 / 3.0).abs() < 1e-12);
        assert_eq!(report.emotions.total_analyzed, 2);
        assert_eq!(report.emotions.counts[&EmotionLabel::Neutral], 1);

        let json = serde_json::to_value(&report).unwrap();
        assert_eq!(json["sessionsAttended"], 2);
        assert_eq!(json["emotions"]["totalAnalyzed"], 2);
    }

    #[test]
    fn test_window_beyond_calendar_is_rejected() {
        assert!(Window::last_days(Utc::now(), u32::MAX).is_none());
        assert_eq!(window(0).start, end());

        assert!(Window::day(NaiveDate::MAX).is_none());
        let day = Window::day(NaiveDate::from_ymd_opt(2026, 5, 6).unwrap()).unwrap();
        assert_eq!(day.end - day.start, Duration::days(1));
    }

    #[test]
    fn test_daily_report_on_last_calendar_day() {
        let store = seeded();
        let err = daily(&store, 3, NaiveDate::MAX).unwrap_err();
        assert!(matches!(err, ReportError::DateOutOfRange(d) if d == NaiveDate::MAX));

        let parsed = NaiveDate::parse_from_str("+262142-12-31", "%Y-%m-%d").unwrap();
        assert!(daily(&store, 3, parsed).is_err());
    }
}
