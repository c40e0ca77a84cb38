use anyhow::{Context, Result};
use clap::{Parser, Subcommand};
use rollcall_core::{aggregate, EmotionLabel};
use std::path::PathBuf;

#[zbus::proxy(
    interface = "org.rollcall.Attendance1",
    default_service = "org.rollcall.Attendance1",
    default_path = "/org/rollcall/Attendance1"
)]
trait Attendance {
    async fn capture(&self, course_id: i64, image: &[u8], roster: &str) -> zbus::Result<String>;
    async fn emotion_report(&self, course_id: i64, days: u32) -> zbus::Result<String>;
    async fn daily_report(&self, course_id: i64, date: &str) -> zbus::Result<String>;
    async fn student_report(&self, identity: &str, course_id: i64, days: u32)
        -> zbus::Result<String>;
    async fn status(&self) -> zbus::Result<String>;
}

#[derive(Parser)]
#[command(name = "rollcall", about = "Rollcall classroom attendance CLI")]
struct Cli {
    /// Talk to the daemon on the session bus instead of the system bus
    #[arg(long, global = true)]
    session: bool,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Take attendance from a class photograph
    Capture {
        /// Course the photograph belongs to
        #[arg(short, long)]
        course: i64,
        /// Image file (JPEG or PNG)
        #[arg(short, long)]
        image: PathBuf,
        /// Roster JSON: [{"identity": 7, "embedding": [...], "contact": {...}}]
        #[arg(short, long)]
        roster: PathBuf,
    },
    /// Emotion distribution for a course
    Emotions {
        #[arg(short, long)]
        course: i64,
        /// Look-back window in days (0 = daemon default)
        #[arg(short, long, default_value_t = 0)]
        days: u32,
    },
    /// Sessions held for a course on one day
    Daily {
        #[arg(short, long)]
        course: i64,
        /// UTC date, YYYY-MM-DD (default: today)
        #[arg(long, default_value = "")]
        date: String,
    },
    /// Attendance and emotions for one student
    Student {
        /// Student id or key
        identity: String,
        #[arg(short, long)]
        course: i64,
        #[arg(short, long, default_value_t = 0)]
        days: u32,
    },
    /// Show daemon status
    Status,
    /// Aggregate emotion labels locally, without the daemon
    Aggregate {
        /// Labels such as happy, sad, neutral
        labels: Vec<String>,
    },
}

#[tokio::main]
async fn main() -> Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(tracing_subscriber::EnvFilter::from_default_env())
        .with_writer(std::io::stderr)
        .init();

    let cli = Cli::parse();

    let reply = match cli.command {
        Commands::Capture {
            course,
            image,
            roster,
        } => {
            let image = std::fs::read(&image)
                .with_context(|| format!("reading {}", image.display()))?;
            let roster = std::fs::read_to_string(&roster)
                .with_context(|| format!("reading {}", roster.display()))?;
            tracing::debug!(course, bytes = image.len(), "sending capture");
            connect(cli.session).await?.capture(course, &image, &roster).await?
        }
        Commands::Emotions { course, days } => {
            connect(cli.session).await?.emotion_report(course, days).await?
        }
        Commands::Daily { course, date } => {
            connect(cli.session).await?.daily_report(course, &date).await?
        }
        Commands::Student {
            identity,
            course,
            days,
        } => {
            connect(cli.session)
                .await?
                .student_report(&identity, course, days)
                .await?
        }
        Commands::Status => connect(cli.session).await?.status().await?,
        Commands::Aggregate { labels } => {
            let labels = labels
                .iter()
                .map(|l| l.parse::<EmotionLabel>())
                .collect::<Result<Vec<_>, _>>()?;
            serde_json::to_string(&aggregate(labels))?
        }
    };

    print_json(&reply)
}

async fn connect(session: bool) -> Result<AttendanceProxy<'static>> {
    let conn = if session {
        zbus::Connection::session().await
    } else {
        zbus::Connection::system().await
    }
    .context("failed to connect to D-Bus")?;
    AttendanceProxy::new(&conn)
        .await
        .context("rollcalld is not reachable")
}

fn print_json(raw: &str) -> Result<()> {
    let value: serde_json::Value = serde_json::from_str(raw).context("daemon sent invalid JSON")?;
    println!("{}", serde_json::to_string_pretty(&value)?);
    Ok(())
}
