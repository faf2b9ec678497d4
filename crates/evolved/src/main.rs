//! Evolution daemon: runs every eligible subject on a fixed interval.

use std::sync::Arc;
use std::time::Duration;

use anyhow::{Context, Result};
use clap::Parser;
use evolve_core::metrics::METRICS;
use evolve_core::telemetry::{init_tracing, LogFormat};
use evolve_core::{BatchSummary, EvolutionOrchestrator, HttpTextGeneration, Stores};
use evolve_state::{SurrealEvolutionStore, SurrealHandle};
use tokio::time::MissedTickBehavior;
use tracing::{error, info, Level};

#[derive(Parser)]
#[command(name = "evolved")]
#[command(version = env!("CARGO_PKG_VERSION"))]
#[command(about = "Scheduled agent instruction evolution", long_about = None)]
struct Args {
    /// Seconds between passes
    #[arg(long, env = "EVOLVED_INTERVAL_SECS", default_value = "3600")]
    interval_secs: u64,

    /// Run a single pass and exit
    #[arg(long)]
    once: bool,

    #[arg(short, long)]
    verbose: bool,

    /// Emit JSON-formatted log lines
    #[arg(long, env = "EVOLVED_JSON_LOGS")]
    json: bool,
}

/// One pass over every enabled subject. Errors are logged, never fatal.
async fn run_pass(orchestrator: &EvolutionOrchestrator) -> Option<BatchSummary> {
    let summary = match orchestrator.run_all_eligible_agents().await {
        Ok(summary) => Some(summary),
        Err(e) => {
            error!(error = %e, "evolution pass failed");
            None
        }
    };
    METRICS.flush();
    summary
}

#[tokio::main]
async fn main() -> Result<()> {
    let args = Args::parse();
    let level = if args.verbose {
        Level::DEBUG
    } else {
        Level::INFO
    };
    init_tracing(LogFormat::from_json_flag(args.json), level);

    let generation =
        HttpTextGeneration::from_env().context("generation backend is not configured")?;
    let handle = SurrealHandle::setup_from_env()
        .await
        .context("Failed to connect to evolution database")?;
    let store = Arc::new(SurrealEvolutionStore::new(Arc::new(handle)));
    let orchestrator = EvolutionOrchestrator::new(Stores::shared(store), Arc::new(generation));

    if args.once {
        run_pass(&orchestrator).await;
        return Ok(());
    }

    let period = Duration::from_secs(args.interval_secs.max(1));
    info!(interval_secs = period.as_secs(), "evolved started");
    let mut ticker = tokio::time::interval(period);
    ticker.set_missed_tick_behavior(MissedTickBehavior::Skip);

    loop {
        tokio::select! {
            _ = ticker.tick() => {
                run_pass(&orchestrator).await;
            }
            _ = tokio::signal::ctrl_c() => {
                info!("shutdown requested");
                break;
            }
        }
    }
    METRICS.flush();
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use evolve_core::{ConfigUpdate, ScriptedGeneration};

    #[test]
    fn interval_defaults_to_an_hour() {
        let args = Args::try_parse_from(["evolved"]).unwrap();
        assert_eq!(args.interval_secs, 3600);
        assert!(!args.once);
    }

    #[tokio::test]
    async fn pass_skips_subjects_without_feedback() {
        let orchestrator = EvolutionOrchestrator::new(
            Stores::in_memory(),
            Arc::new(ScriptedGeneration::failing()),
        );
        orchestrator
            .update_config(
                "writer",
                ConfigUpdate {
                    enabled: Some(true),
                    ..Default::default()
                },
            )
            .await
            .unwrap();

        let summary = run_pass(&orchestrator).await.unwrap();
        assert_eq!(summary.processed, 0);
        assert_eq!(summary.skipped, 1);
    }
}
