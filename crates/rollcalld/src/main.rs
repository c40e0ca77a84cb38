use anyhow::{Context, Result};
use std::time::Duration;
use tracing_subscriber::EnvFilter;

mod backend;
mod config;
mod dbus_interface;
mod engine;
mod notify;
mod report;
mod store;

use config::{Bus, Config, LogFormat};

const BUS_NAME: &str = "org.rollcall.Attendance1";
const OBJECT_PATH: &str = "/org/rollcall/Attendance1";

#[tokio::main]
async fn main() -> Result<()> {
    let subscriber = tracing_subscriber::fmt().with_env_filter(EnvFilter::from_default_env());
    match LogFormat::from_env() {
        LogFormat::Json => subscriber.json().init(),
        LogFormat::Text => subscriber.init(),
    }

    let config = Config::from_env();

    tracing::info!(
        db = %config.db_path.display(),
        tolerance = config.tolerance.get(),
        "rollcalld starting"
    );

    let engine = engine::spawn_engine(&config).context("failed to start engine")?;

    let service = dbus_interface::AttendanceService::new(
        engine,
        config.tolerance,
        Duration::from_secs(config.capture_timeout_secs),
        config.report_window_days,
    );

    let builder = match config.bus {
        Bus::System => zbus::connection::Builder::system()?,
        Bus::Session => zbus::connection::Builder::session()?,
    };
    let _conn = builder
        .name(BUS_NAME)?
        .serve_at(OBJECT_PATH, service)?
        .build()
        .await
        .context("failed to register on D-Bus")?;

    tracing::info!(bus = ?config.bus, name = BUS_NAME, "rollcalld ready");

    tokio::signal::ctrl_c().await?;
    tracing::info!("rollcalld shutting down");

    Ok(())
}
