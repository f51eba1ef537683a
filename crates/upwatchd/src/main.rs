//! upwatchd: the upwatch daemon.
//!
//! Single binary that assembles all upwatch subsystems:
//! - Roster and status event log (redb)
//! - Roster replica fed from the MQTT registry topic
//! - Probe scheduler (prober + status recorder)
//! - Daily fleet report
//!
//! Plus the on-demand commands that read the same store.
//!
//! # Usage
//!
//! ```text
//! upwatchd --config /etc/upwatch/upwatch.toml run
//! upwatchd uptime --server web-1 --date 2024-03-01
//! upwatchd report --from 2024-03-01 --to 2024-03-07 --mode credit
//! upwatchd roster add --id web-1 --address 10.0.0.1 --name "web 1"
//! ```

mod commands;
mod config;
mod daemon;

use std::path::PathBuf;

use clap::{Parser, Subcommand, ValueEnum};
use tracing_subscriber::EnvFilter;

use crate::config::UpwatchConfig;

const DEFAULT_FILTER: &str = "info,upwatchd=debug,upwatch=debug";

#[derive(Parser)]
#[command(name = "upwatchd", about = "Fleet reachability and uptime daemon")]
struct Cli {
    /// Path to upwatch.toml; built-in defaults when omitted.
    #[arg(long, global = true)]
    config: Option<PathBuf>,

    /// Override `[store] path`.
    #[arg(long, global = true)]
    store: Option<PathBuf>,

    #[arg(long, global = true, value_enum, default_value_t = LogFormat::Text)]
    log_format: LogFormat,

    #[command(subcommand)]
    command: Command,
}

#[derive(Clone, Copy, ValueEnum)]
enum LogFormat {
    Text,
    Json,
}

#[derive(Subcommand)]
enum Command {
    /// Run the replica, the probe scheduler and the daily report until Ctrl-C.
    Run {
        /// Override `[probe] interval`, e.g. "30s".
        #[arg(long)]
        interval: Option<String>,
    },

    /// Uptime of one server over one calendar day in the reporting zone.
    Uptime {
        #[arg(long)]
        server: String,

        /// YYYY-MM-DD
        #[arg(long)]
        date: String,
    },

    /// Fleet report over a date range (both ends inclusive), delivered to the sink.
    Report {
        /// YYYY-MM-DD
        #[arg(long)]
        from: String,

        /// YYYY-MM-DD
        #[arg(long)]
        to: String,

        #[arg(long, value_enum)]
        mode: Option<ReportMode>,

        /// Replaces `[report] recipients`; repeatable.
        #[arg(long = "recipient")]
        recipients: Vec<String>,
    },

    /// Edit the roster and publish the change on the registry topic.
    Roster {
        #[command(subcommand)]
        action: RosterAction,
    },
}

#[derive(Clone, Copy, ValueEnum)]
enum ReportMode {
    Exact,
    Credit,
}

#[derive(Subcommand)]
enum RosterAction {
    /// Insert or replace an endpoint.
    Add {
        #[arg(long)]
        id: String,

        #[arg(long)]
        address: String,

        #[arg(long)]
        name: String,
    },

    /// Remove an endpoint.
    Remove {
        #[arg(long)]
        id: String,

        /// Also delete the server's status history.
        #[arg(long)]
        purge: bool,
    },

    /// Print the roster.
    List,
}

fn init_tracing(format: LogFormat) {
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(DEFAULT_FILTER));
    match format {
        LogFormat::Text => tracing_subscriber::fmt().with_env_filter(filter).init(),
        LogFormat::Json => tracing_subscriber::fmt().json().with_env_filter(filter).init(),
    }
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let cli = Cli::parse();
    init_tracing(cli.log_format);

    let mut config = UpwatchConfig::load(cli.config.as_deref())?;
    if let Some(store) = cli.store {
        config.store.path = store;
    }

    match cli.command {
        Command::Run { interval } => {
            if let Some(interval) = interval {
                config.probe.interval = interval;
                config.validate()?;
            }
            daemon::run(config).await
        }
        Command::Uptime { server, date } => commands::uptime(&config, &server, &date),
        Command::Report {
            from,
            to,
            mode,
            recipients,
        } => {
            if let Some(mode) = mode {
                config.report.mode = match mode {
                    ReportMode::Exact => upwatch_report::FleetMode::Exact,
                    ReportMode::Credit => upwatch_report::FleetMode::Credit,
                };
            }
            if !recipients.is_empty() {
                config.report.recipients = recipients;
            }
            commands::report(&config, &from, &to)
        }
        Command::Roster { action } => match action {
            RosterAction::Add { id, address, name } => {
                commands::roster_add(&config, &id, &address, &name).await
            }
            RosterAction::Remove { id, purge } => commands::roster_remove(&config, &id, purge).await,
            RosterAction::List => commands::roster_list(&config),
        },
    }
}
