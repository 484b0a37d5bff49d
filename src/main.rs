mod cli;

use anyhow::{bail, Context};
use chrono::{Duration, Utc};
use clap::Parser;
use cli::{Cli, Commands};
use flowgate::config::Config;
use flowgate::datasources::{HttpOrchestratorClient, HttpTelemetryClient};
use flowgate::db::{Database, ScriptedOrchestrator, ScriptedTelemetry, SiteCatalog};
use flowgate::logic::IrrigationEngine;
use flowgate::models::{ActiveRun, AdmissionDecision, InterlockVerdict};
use flowgate::repository::{Collaborators, IrrigationOrchestrator, TelemetryQueryService};
use std::sync::Arc;
use tracing_subscriber::EnvFilter;
use uuid::Uuid;

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    // Load .env file if present
    let _ = dotenvy::dotenv();

    let cli = Cli::parse();
    init_logging(cli.verbose);

    let config = Config::load(cli.config.clone()).context(
        "Failed to load configuration. Copy config/config.yaml.example to config/config.yaml",
    )?;
    let db_path = Config::db_path(cli.data_dir.as_ref())?;
    let db = Database::open(&db_path)
        .with_context(|| format!("Failed to open database at {}", db_path.display()))?;
    let catalog = SiteCatalog::from_config(&config);

    let telemetry_client = match &config.telemetry {
        Some(t) => Some(HttpTelemetryClient::new(t.clone())?),
        None => None,
    };

    if let Commands::Serve = cli.command {
        if telemetry_client.is_none() || config.orchestrator.is_none() {
            bail!("`serve` needs both `telemetry` and `orchestrator` sections in the config");
        }
    }

    let telemetry: Arc<dyn TelemetryQueryService> = match &telemetry_client {
        Some(client) => Arc::new(client.clone()),
        None => {
            tracing::warn!("No telemetry configured, every interlock sees an empty feed");
            Arc::new(ScriptedTelemetry::new())
        }
    };
    let orchestrator: Arc<dyn IrrigationOrchestrator> = match &config.orchestrator {
        Some(o) => Arc::new(HttpOrchestratorClient::new(o.clone())?),
        None => Arc::new(ScriptedOrchestrator::new()),
    };

    let catalog = Arc::new(catalog);
    let store = Arc::new(db);
    let collaborators = Collaborators {
        zones: catalog.clone(),
        settings: catalog.clone(),
        active_runs: store.clone(),
        queued_events: store.clone(),
        interlock_events: store.clone(),
        telemetry,
        orchestrator,
    };
    let engine = IrrigationEngine::new(&collaborators, &config);

    match cli.command {
        Commands::Serve => {
            let sites = catalog.site_ids();
            if sites.is_empty() {
                bail!("No sites with a `flow` section configured");
            }
            let handle = engine.reconciler().spawn(sites);
            tokio::signal::ctrl_c()
                .await
                .context("Failed to listen for Ctrl-C")?;
            tracing::info!("Shutdown requested");
            handle.shutdown().await;
        }
        Commands::Check { site } => {
            println!("Config: OK ({} sites)", config.sites.len());
            println!("Database: {}", store.path().display());
            match &telemetry_client {
                Some(client) => match client.test_connection().await {
                    Ok(true) => println!("Telemetry: OK"),
                    Ok(false) => println!("Telemetry: UNHEALTHY"),
                    Err(e) => println!("Telemetry: OFFLINE ({})", e),
                },
                None => println!("Telemetry: not configured"),
            }

            print_verdict(&engine.preview_pre_run_interlocks(&site).await);

            let snapshot = engine.flow_snapshot(&site).await?;
            if snapshot.is_unlimited() {
                println!("Flow: no limit configured");
            } else {
                println!(
                    "Flow: {:.1} of {:.1} L/min committed ({} zones running)",
                    snapshot.current_flow,
                    snapshot.effective_max_flow,
                    snapshot.active_zone_flows.len()
                );
            }
        }
        Commands::Evaluate {
            site,
            program,
            zones,
        } => {
            let decision = engine.evaluate_run(&site, &program, &zones, Utc::now()).await;
            match decision {
                AdmissionDecision::ExecuteImmediately { warnings } => {
                    println!("Start now");
                    for w in warnings {
                        println!("  ⚠ {}", w);
                    }
                }
                AdmissionDecision::Queue {
                    expected_execution_time,
                    delay_minutes,
                    queue_position,
                    reason,
                    ..
                } => {
                    println!(
                        "Queue at position {} until {} ({} min delay)",
                        queue_position,
                        expected_execution_time.format("%Y-%m-%d %H:%M UTC"),
                        delay_minutes
                    );
                    println!("  {}", reason);
                }
                AdmissionDecision::Blocked {
                    interlock_type,
                    reason,
                } => println!("Blocked by {}: {}", interlock_type, reason),
                AdmissionDecision::Rejected { reason } => println!("Rejected: {}", reason),
            }
        }
        Commands::RunStarted {
            site,
            run_id,
            program,
            zones,
            minutes,
        } => {
            let started_at = Utc::now();
            engine
                .record_run_started(&ActiveRun {
                    run_id: run_id.clone(),
                    program_id: program,
                    site_id: site.clone(),
                    active_zone_ids: zones,
                    started_at,
                    expected_end_at: minutes.map(|m| started_at + Duration::minutes(m)),
                })
                .await?;
            println!("Run {} recorded as active on {}", run_id, site);
        }
        Commands::RunEnded { site, run_id } => {
            if engine.record_run_ended(&site, &run_id).await? {
                println!("Run {} released on {}", run_id, site);
            } else {
                println!("Run {} was not active on {}", run_id, site);
            }
        }
        Commands::Queue { site } => {
            let events = engine.get_queued_events(&site).await?;
            if events.is_empty() {
                println!("No queued runs for {}", site);
            }
            for e in events {
                println!(
                    "{}  {}  zones={}  expected={}  delay={}m",
                    e.event_id,
                    e.program_id,
                    e.target_zone_ids.join(","),
                    e.expected_execution_time.format("%Y-%m-%d %H:%M"),
                    e.delay().num_minutes()
                );
            }
        }
        Commands::Stats { site, days } => {
            let to = Utc::now();
            let stats = engine
                .get_queue_statistics(&site, to - Duration::days(days.max(1)), to)
                .await?;
            println!("Queued runs (last {} days): {}", days, stats.total_queued);
            println!(
                "  executed={}  failed={}  pending={}",
                stats.executed, stats.failed, stats.pending
            );
            println!(
                "  average delay {:.1} min, max {:.1} min",
                stats.average_delay_minutes, stats.max_delay_minutes
            );
            for peak in &stats.peak_queue_hours {
                println!("  {:02}:00  {}", peak.hour, peak.count);
            }
        }
        Commands::Suggest { site } => {
            if !engine.should_show_suggestions(&site).await? {
                println!("Not enough recent queue history for suggestions");
                return Ok(());
            }
            for s in engine.generate_suggestions(&site).await? {
                println!("{} [{}] {}", s.priority.symbol(), s.priority, s.title);
                println!("    {}", s.description);
                if let Some(action) = &s.suggested_action {
                    println!("    → {}", action);
                }
            }
        }
        Commands::Interlocks { site } => {
            let active = engine.list_active_interlocks(&site).await?;
            if active.is_empty() {
                println!("No active interlocks for {}", site);
            }
            for e in active {
                let ack = if e.requires_acknowledgment { " (needs ack)" } else { "" };
                println!(
                    "{}  {}{}  since {}  {}",
                    e.event_id,
                    e.interlock_type,
                    ack,
                    e.trip_timestamp.format("%Y-%m-%d %H:%M"),
                    e.details
                );
            }
        }
        Commands::Clear {
            event_id,
            user,
            notes,
        } => {
            let event_id = Uuid::parse_str(&event_id).context("Invalid event id")?;
            if engine
                .clear_interlock(event_id, user.as_deref(), notes.as_deref())
                .await?
            {
                println!("Interlock {} cleared", event_id);
            } else {
                bail!("Interlock {} was not cleared (unknown, inactive, or needs --user)", event_id);
            }
        }
    }

    Ok(())
}

fn init_logging(verbose: u8) {
    let default_level = match verbose {
        0 => "info",
        1 => "debug",
        _ => "trace",
    };
    let filter = if verbose > 0 {
        EnvFilter::new(default_level)
    } else {
        EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(default_level))
    };
    tracing_subscriber::fmt().with_env_filter(filter).init();
}

fn print_verdict(verdict: &InterlockVerdict) {
    match verdict {
        InterlockVerdict::Allowed => println!("Interlocks: clear"),
        InterlockVerdict::AllowedWithWarnings(warnings) => {
            println!("Interlocks: clear with warnings");
            for w in warnings {
                println!("  ⚠ {}", w);
            }
        }
        InterlockVerdict::Blocked {
            interlock_type,
            reason,
        } => println!("Interlocks: BLOCKED by {} ({})", interlock_type, reason),
    }
}
