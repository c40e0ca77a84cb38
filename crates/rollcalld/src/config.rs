use rollcall_core::Tolerance;
use std::path::PathBuf;

/// Message bus the daemon registers on.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Bus {
    System,
    Session,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LogFormat {
    Text,
    Json,
}

impl LogFormat {
    /// Read `ROLLCALL_LOG_FORMAT` on its own, before a subscriber exists.
    pub fn from_env() -> Self {
        Self::parse(std::env::var("ROLLCALL_LOG_FORMAT").ok().as_deref())
    }

    fn parse(value: Option<&str>) -> Self {
        match value {
            Some("json") => LogFormat::Json,
            _ => LogFormat::Text,
        }
    }
}

/// Daemon configuration, loaded from environment variables.
#[derive(Debug, Clone)]
pub struct Config {
    /// Path to the SQLite database file.
    pub db_path: PathBuf,
    /// Maximum embedding distance for a positive match.
    pub tolerance: Tolerance,
    /// Command line of the embedding extractor.
    pub extractor_cmd: Option<String>,
    /// Command line of the emotion classifier. Unset disables emotion enrichment.
    pub classifier_cmd: Option<String>,
    /// Timeout in seconds for one capture request.
    pub capture_timeout_secs: u64,
    /// Default look-back window for reports.
    pub report_window_days: u32,
    /// JSON-lines notification outbox. Unset logs notices instead.
    pub outbox_path: Option<PathBuf>,
    pub bus: Bus,
}

impl Config {
    /// Load configuration from `ROLLCALL_*` environment variables with defaults.
    pub fn from_env() -> Self {
        Self::from_lookup(|key| std::env::var(key).ok())
    }

    fn from_lookup(var: impl Fn(&str) -> Option<String>) -> Self {
        let data_dir = var("XDG_DATA_HOME")
            .map(PathBuf::from)
            .unwrap_or_else(|| {
                let home = var("HOME").unwrap_or_else(|| "/tmp".to_string());
                PathBuf::from(home).join(".local/share")
            })
            .join("rollcall");

        let db_path = var("ROLLCALL_DB_PATH")
            .map(PathBuf::from)
            .unwrap_or_else(|| data_dir.join("attendance.db"));

        let tolerance = match var("ROLLCALL_TOLERANCE").and_then(|v| v.parse::<f64>().ok()) {
            Some(raw) => Tolerance::new(raw).unwrap_or_else(|err| {
                tracing::warn!(error = %err, "ignoring ROLLCALL_TOLERANCE");
                Tolerance::default()
            }),
            None => Tolerance::default(),
        };

        Self {
            db_path,
            tolerance,
            extractor_cmd: non_empty(var("ROLLCALL_EXTRACTOR_CMD")),
            classifier_cmd: non_empty(var("ROLLCALL_CLASSIFIER_CMD")),
            capture_timeout_secs: parse_or(var("ROLLCALL_CAPTURE_TIMEOUT_SECS"), 30),
            report_window_days: parse_or(var("ROLLCALL_REPORT_WINDOW_DAYS"), 30),
            outbox_path: non_empty(var("ROLLCALL_OUTBOX_PATH")).map(PathBuf::from),
            bus: match var("ROLLCALL_BUS").as_deref() {
                Some("session") => Bus::Session,
                _ => Bus::System,
            },
        }
    }
}

fn non_empty(value: Option<String>) -> Option<String> {
    value.filter(|v| !v.trim().is_empty())
}

fn parse_or<T: std::str::FromStr>(value: Option<String>, default: T) -> T {
    value.and_then(|v| v.parse().ok()).unwrap_or(default)
}
