//! flotillad — the Flotilla scheduler daemon.
//!
//! Wires the scheduling core together and runs its workers: the offer
//! manager, the pending-task queue feeding the scheduling pass, the
//! preemptor, and task reconciliation. The agent transport (driver) is an
//! external collaborator; without one attached the daemon runs with a
//! logging driver, which is useful for smoke-testing storage and wiring.
//!
//! # Usage
//!
//! ```text
//! flotillad --data-dir /var/lib/flotilla --offer-order CPU,MEMORY
//! ```

mod wiring;

use std::path::PathBuf;
use std::sync::Arc;

use clap::Parser;
use tracing::info;

use flotilla_core::{LoggingDriver, SystemClock};

#[derive(Parser)]
#[command(name = "flotillad", about = "Flotilla cluster scheduler daemon")]
pub struct Options {
    /// Data directory for persistent state.
    #[arg(long, default_value = "/var/lib/flotilla")]
    pub data_dir: PathBuf,

    // ── Offers ─────────────────────────────────────────────────────
    /// Minimum hold time for unused offers, in seconds.
    #[arg(long, default_value = "300")]
    pub offer_min_hold_secs: u64,

    /// Jitter window added to the offer hold time, in seconds.
    #[arg(long, default_value = "60")]
    pub offer_jitter_window_secs: u64,

    /// Offer probe order: comma-separated list of
    /// RANDOM, FIFO, CPU, MEMORY, DISK, REVOCABLE.
    #[arg(long, default_value = "RANDOM")]
    pub offer_order: String,

    /// Do not launch on offers whose maintenance window starts within
    /// this many seconds.
    #[arg(long, default_value = "360")]
    pub offer_unavailability_threshold_secs: u64,

    /// Re-offer hint attached to declined offers, in seconds.
    #[arg(long, default_value = "5")]
    pub offer_filter_duration_secs: u64,

    // ── Static bans ────────────────────────────────────────────────
    /// Maximum static-ban cache entries; 0 disables banning.
    #[arg(long, default_value = "10000")]
    pub ban_max_cache_size: usize,

    /// Age at which static bans expire, in seconds.
    #[arg(long, default_value = "360")]
    pub ban_expire_after_secs: u64,

    // ── Scheduling ─────────────────────────────────────────────────
    /// Pending tasks matched per scheduling transaction.
    #[arg(long, default_value = "5")]
    pub schedule_batch_size: usize,

    // ── Preemption ─────────────────────────────────────────────────
    #[arg(long, default_value_t = true, action = clap::ArgAction::Set)]
    pub preemptor_enabled: bool,

    /// Interval between preemption slot searches, in seconds.
    #[arg(long, default_value = "60")]
    pub preemptor_search_interval_secs: u64,

    /// How long a task must stay pending before preemption, in seconds.
    #[arg(long, default_value = "180")]
    pub preemptor_delay_secs: u64,

    /// Preemption decisions per search pass.
    #[arg(long, default_value = "5")]
    pub preemptor_reservation_max_batch_size: usize,

    /// Lifetime of a preemption reservation, in seconds.
    #[arg(long, default_value = "180")]
    pub reservation_lifetime_secs: u64,

    // ── Reconciliation ─────────────────────────────────────────────
    /// Interval between explicit reconciliation runs, in minutes.
    #[arg(long, default_value = "60")]
    pub reconciliation_explicit_interval_mins: u64,

    /// Interval between implicit reconciliation runs, in minutes.
    #[arg(long, default_value = "180")]
    pub reconciliation_implicit_interval_mins: u64,

    /// Delay before the first reconciliation run, in minutes.
    #[arg(long, default_value = "10")]
    pub reconciliation_initial_delay_mins: u64,

    /// Offset between the explicit and implicit loops, in minutes.
    #[arg(long, default_value = "30")]
    pub reconciliation_spread_mins: u64,

    /// Task statuses per reconciliation message.
    #[arg(long, default_value = "1000")]
    pub reconciliation_batch_size: usize,

    /// Pause between reconciliation batches, in seconds.
    #[arg(long, default_value = "5")]
    pub reconciliation_batch_delay_secs: u64,
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| "info,flotillad=debug,flotilla=debug".parse().unwrap()),
        )
        .init();

    let options = Options::parse();
    std::fs::create_dir_all(&options.data_dir)?;

    let driver = Arc::new(LoggingDriver);
    let clock = Arc::new(SystemClock::new());
    let core = wiring::wire(&options, driver, clock)?;
    core.start();

    info!(framework_id = %core.framework_id, "scheduler active");
    tokio::signal::ctrl_c().await?;
    info!("shutting down");
    core.stop();
    Ok(())
}
