use clap::{Parser, Subcommand};
use std::path::PathBuf;

#[derive(Parser)]
#[command(
    name = "flowgate",
    version,
    about = "Flow-rate admission control and safety interlocks for irrigation runs"
)]
pub struct Cli {
    #[command(subcommand)]
    pub command: Commands,

    /// Path to config.yaml
    #[arg(short, long, global = true)]
    pub config: Option<PathBuf>,

    /// Override SQLite data directory
    #[arg(short, long, global = true)]
    pub data_dir: Option<PathBuf>,

    /// Increase log verbosity (-v for debug, -vv for trace)
    #[arg(short, long, action = clap::ArgAction::Count, global = true)]
    pub verbose: u8,
}

#[derive(Subcommand)]
pub enum Commands {
    /// Run queue reconciliation for every configured site until Ctrl-C
    Serve,
    /// Test connections, then show a site's interlock verdict and flow usage
    Check {
        #[arg(long)]
        site: String,
    },
    /// Show the admission decision for a run without starting it or recording trips
    Evaluate {
        #[arg(long)]
        site: String,
        #[arg(long)]
        program: String,
        /// Comma-separated zone ids
        #[arg(long, value_delimiter = ',', required = true)]
        zones: Vec<String>,
    },
    /// Report a run the orchestrator started outside the queue
    RunStarted {
        #[arg(long)]
        site: String,
        #[arg(long)]
        run_id: String,
        #[arg(long)]
        program: String,
        /// Comma-separated zone ids
        #[arg(long, value_delimiter = ',', required = true)]
        zones: Vec<String>,
        /// Expected run length
        #[arg(long)]
        minutes: Option<i64>,
    },
    /// Report that a run finished or was cancelled, releasing its flow
    RunEnded {
        #[arg(long)]
        site: String,
        #[arg(long)]
        run_id: String,
    },
    /// List pending queued runs
    Queue {
        #[arg(long)]
        site: String,
    },
    /// Queue statistics over a trailing window
    Stats {
        #[arg(long)]
        site: String,
        #[arg(long, default_value_t = 7)]
        days: i64,
    },
    /// Schedule change suggestions from recent queue history
    Suggest {
        #[arg(long)]
        site: String,
    },
    /// List active interlocks
    Interlocks {
        #[arg(long)]
        site: String,
    },
    /// Clear an active interlock
    Clear {
        /// Interlock event id
        event_id: String,
        /// Acknowledging operator, required for emergency stop, EC, pH and flow anomaly
        #[arg(long)]
        user: Option<String>,
        #[arg(long)]
        notes: Option<String>,
    },
}
