//! Agent Instruction Evolution - operator CLI
//!
//! The `evolvectl` command drives and inspects evolution cycles.
//!
//! ## Commands
//!
//! - `cycle`: Run cycles, list them, abandon orphaned ones, delete finished ones
//! - `status`: Show a subject's evolution state
//! - `pending` / `approve` / `reject`: Human review of candidates
//! - `config`: Show or change a subject's evolution policy
//! - `instructions`: Show, set, or roll back production instructions
//! - `seed`: Load feedback records or test cases from JSON files

use std::path::{Path, PathBuf};
use std::sync::Arc;

use anyhow::{Context, Result};
use async_trait::async_trait;
use clap::{Parser, Subcommand, ValueEnum};
use evolve_core::telemetry::{init_tracing, LogFormat};
use evolve_core::{
    ConfigUpdate, EvolutionOrchestrator, GenerationError, GenerationRequest, GenerationResponse,
    HttpTextGeneration, InstructionSet, Stores, TextGeneration,
};
use evolve_state::{FeedbackRecord, SurrealEvolutionStore, SurrealHandle, TestCase};
use serde::Serialize;
use tracing::{info, Level};

#[derive(Parser)]
#[command(name = "evolvectl")]
#[command(author = "Stevedores Org")]
#[command(version = env!("CARGO_PKG_VERSION"))]
#[command(about = "Feedback-driven evolution of agent instructions", long_about = None)]
struct Cli {
    /// Enable verbose output
    #[arg(short, long, global = true)]
    verbose: bool,

    /// Emit JSON-formatted log lines
    #[arg(long, global = true)]
    json: bool,

    /// Result format on stdout
    #[arg(long, global = true, value_enum, default_value_t = Output::Text)]
    output: Output,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Clone, Copy, Debug, PartialEq, Eq, ValueEnum)]
enum Output {
    Text,
    Json,
}

#[derive(Subcommand)]
enum Commands {
    /// Evolution cycles
    Cycle {
        #[command(subcommand)]
        action: CycleAction,
    },

    /// Show config, production version, recent cycles and pending candidates
    Status {
        /// Subject (agent) id
        subject: String,
    },

    /// List candidates waiting for review
    Pending {
        /// Only this subject
        #[arg(short, long)]
        subject: Option<String>,
    },

    /// Promote a candidate that is pending review
    Approve {
        candidate_id: String,

        /// Who approved it
        #[arg(long, default_value = "evolvectl")]
        reviewer: String,

        #[arg(long)]
        notes: Option<String>,
    },

    /// Reject a candidate
    Reject {
        candidate_id: String,

        /// Who rejected it
        #[arg(long, default_value = "evolvectl")]
        reviewer: String,

        #[arg(long)]
        reason: Option<String>,
    },

    /// Evolution policy per subject
    Config {
        #[command(subcommand)]
        action: ConfigAction,
    },

    /// Production instruction sets
    Instructions {
        #[command(subcommand)]
        action: InstructionsAction,
    },

    /// Load data from JSON files
    Seed {
        #[command(subcommand)]
        action: SeedAction,
    },
}

#[derive(Subcommand)]
enum CycleAction {
    /// Run one cycle for a subject
    Run {
        subject: String,

        /// Skip the enabled and feedback-count checks
        #[arg(short, long)]
        force: bool,
    },

    /// Run a cycle for every enabled subject with enough feedback
    RunAll,

    /// List cycles, newest first
    List {
        #[arg(short, long)]
        subject: Option<String>,

        #[arg(short, long, default_value = "20")]
        limit: usize,
    },

    /// Mark a cycle left running by a crashed process as failed
    Abandon {
        cycle_id: String,

        #[arg(long, default_value = "abandoned by operator")]
        reason: String,
    },

    /// Delete a finished cycle and its candidates
    Delete { cycle_id: String },
}

#[derive(Subcommand)]
enum ConfigAction {
    /// Show the stored config
    Show { subject: String },

    /// Change individual settings (creates a default config first if needed)
    Set {
        subject: String,

        #[arg(long)]
        enabled: Option<bool>,

        #[arg(long)]
        min_feedback_count: Option<u32>,

        #[arg(long)]
        min_improvement_threshold: Option<f64>,

        #[arg(long)]
        auto_promote_threshold: Option<f64>,

        #[arg(long)]
        require_human_approval: Option<bool>,

        #[arg(long)]
        max_candidates_per_cycle: Option<u32>,

        #[arg(long)]
        max_regression_allowed: Option<f64>,

        #[arg(long)]
        min_test_pass_rate: Option<f64>,
    },
}

#[derive(Subcommand)]
enum InstructionsAction {
    /// Show the current production version
    Show { subject: String },

    /// Show every production version, newest first
    History { subject: String },

    /// Write a new production version from a JSON instruction set
    Set {
        subject: String,

        /// Path to an instruction set (JSON)
        file: PathBuf,

        #[arg(long, default_value = "evolvectl")]
        changed_by: String,

        #[arg(long)]
        notes: Option<String>,
    },

    /// Re-append the previous version
    Rollback {
        subject: String,

        #[arg(long, default_value = "evolvectl")]
        changed_by: String,
    },
}

#[derive(Subcommand)]
enum SeedAction {
    /// Record feedback from a JSON array of feedback records
    Feedback { file: PathBuf },

    /// Upsert test cases from a JSON array
    TestCases { file: PathBuf },
}

/// Used when no generation endpoint is configured: every call fails, so
/// commands that need a model report why instead of hanging on a network.
struct Unconfigured;

#[async_trait]
impl TextGeneration for Unconfigured {
    async fn generate(
        &self,
        _request: GenerationRequest,
    ) -> std::result::Result<GenerationResponse, GenerationError> {
        Err(GenerationError::Transport(
            "no generation endpoint configured (set EVOLVE_GENERATION_URL)".to_string(),
        ))
    }
}

fn generation_backend(required: bool) -> Result<Arc<dyn TextGeneration>> {
    match HttpTextGeneration::from_env() {
        Ok(generation) => Ok(Arc::new(generation)),
        Err(e) if required => Err(e).context("generation backend is required for this command"),
        Err(_) => Ok(Arc::new(Unconfigured)),
    }
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();

    let level = if cli.verbose {
        Level::DEBUG
    } else {
        Level::INFO
    };
    init_tracing(LogFormat::from_json_flag(cli.json), level);

    let needs_model = matches!(
        cli.command,
        Commands::Cycle {
            action: CycleAction::Run { .. } | CycleAction::RunAll
        }
    );
    let generation = generation_backend(needs_model)?;

    let handle = SurrealHandle::setup_from_env()
        .await
        .context("Failed to connect to evolution database")?;
    let store = Arc::new(SurrealEvolutionStore::new(Arc::new(handle)));
    let orchestrator = EvolutionOrchestrator::new(Stores::shared(store), generation);

    run(&orchestrator, cli.command, cli.output).await
}

async fn run(orchestrator: &EvolutionOrchestrator, command: Commands, output: Output) -> Result<()> {
    match command {
        Commands::Cycle { action } => match action {
            CycleAction::Run { subject, force } => {
                cmd_cycle_run(orchestrator, &subject, force, output).await
            }
            CycleAction::RunAll => cmd_cycle_run_all(orchestrator, output).await,
            CycleAction::List { subject, limit } => {
                cmd_cycle_list(orchestrator, subject.as_deref(), limit, output).await
            }
            CycleAction::Abandon { cycle_id, reason } => {
                cmd_cycle_abandon(orchestrator, &cycle_id, &reason).await
            }
            CycleAction::Delete { cycle_id } => cmd_cycle_delete(orchestrator, &cycle_id).await,
        },
        Commands::Status { subject } => cmd_status(orchestrator, &subject, output).await,
        Commands::Pending { subject } => {
            cmd_pending(orchestrator, subject.as_deref(), output).await
        }
        Commands::Approve {
            candidate_id,
            reviewer,
            notes,
        } => cmd_approve(orchestrator, &candidate_id, &reviewer, notes, output).await,
        Commands::Reject {
            candidate_id,
            reviewer,
            reason,
        } => cmd_reject(orchestrator, &candidate_id, &reviewer, reason, output).await,
        Commands::Config { action } => match action {
            ConfigAction::Show { subject } => cmd_config_show(orchestrator, &subject, output).await,
            ConfigAction::Set {
                subject,
                enabled,
                min_feedback_count,
                min_improvement_threshold,
                auto_promote_threshold,
                require_human_approval,
                max_candidates_per_cycle,
                max_regression_allowed,
                min_test_pass_rate,
            } => {
                let update = ConfigUpdate {
                    enabled,
                    min_feedback_count,
                    min_improvement_threshold,
                    auto_promote_threshold,
                    require_human_approval,
                    max_candidates_per_cycle,
                    max_regression_allowed,
                    min_test_pass_rate,
                };
                cmd_config_set(orchestrator, &subject, update, output).await
            }
        },
        Commands::Instructions { action } => match action {
            InstructionsAction::Show { subject } => {
                cmd_instructions_show(orchestrator, &subject, output).await
            }
            InstructionsAction::History { subject } => {
                cmd_instructions_history(orchestrator, &subject, output).await
            }
            InstructionsAction::Set {
                subject,
                file,
                changed_by,
                notes,
            } => cmd_instructions_set(orchestrator, &subject, &file, &changed_by, notes).await,
            InstructionsAction::Rollback {
                subject,
                changed_by,
            } => cmd_instructions_rollback(orchestrator, &subject, &changed_by).await,
        },
        Commands::Seed { action } => match action {
            SeedAction::Feedback { file } => cmd_seed_feedback(orchestrator, &file).await,
            SeedAction::TestCases { file } => cmd_seed_test_cases(orchestrator, &file).await,
        },
    }
}

fn print_json<T: Serialize>(value: &T) -> Result<()> {
    println!("{}", serde_json::to_string_pretty(value)?);
    Ok(())
}

fn read_json_file<T: serde::de::DeserializeOwned>(path: &Path) -> Result<T> {
    let content = std::fs::read_to_string(path)
        .with_context(|| format!("Failed to read {}", path.display()))?;
    serde_json::from_str(&content).with_context(|| format!("Failed to parse {}", path.display()))
}

fn short(id: &str) -> &str {
    id.get(..8).unwrap_or(id)
}

// ========== Cycles ==========

async fn cmd_cycle_run(
    orchestrator: &EvolutionOrchestrator,
    subject: &str,
    force: bool,
    output: Output,
) -> Result<()> {
    let outcome = orchestrator.run_evolution_cycle(subject, force).await?;
    if output == Output::Json {
        return print_json(&outcome);
    }

    match &outcome.cycle_id {
        Some(id) => println!("Cycle {} for {}: {}", short(id), subject, outcome.status),
        None => println!("No cycle for {}", subject),
    }
    if let Some(reason) = &outcome.reason {
        println!("  reason: {}", reason);
    }
    println!(
        "  candidates: {} generated, {} passed gates",
        outcome.candidates_generated, outcome.candidates_passed
    );
    if let (Some(best), Some(improvement)) = (&outcome.best_candidate_id, outcome.best_improvement)
    {
        println!("  best: {} ({:+.2})", best, improvement);
    }
    if let Some(promoted) = &outcome.promoted_candidate_id {
        println!("  promoted: {}", promoted);
    }
    if outcome.pending_review > 0 {
        println!("  pending review: {}", outcome.pending_review);
    }
    Ok(())
}

async fn cmd_cycle_run_all(orchestrator: &EvolutionOrchestrator, output: Output) -> Result<()> {
    let summary = orchestrator.run_all_eligible_agents().await?;
    if output == Output::Json {
        return print_json(&summary);
    }
    println!(
        "Processed {} subject(s): {} succeeded, {} failed, {} skipped",
        summary.processed, summary.succeeded, summary.failed, summary.skipped
    );
    println!(
        "Candidates generated: {}, promoted: {}, pending review: {}",
        summary.candidates_generated, summary.promoted, summary.pending_review
    );
    for outcome in &summary.outcomes {
        println!(
            "  {:<24} {:<10} {}",
            outcome.subject_id,
            outcome.status,
            outcome.reason.as_deref().unwrap_or("")
        );
    }
    Ok(())
}

async fn cmd_cycle_list(
    orchestrator: &EvolutionOrchestrator,
    subject: Option<&str>,
    limit: usize,
    output: Output,
) -> Result<()> {
    let cycles = orchestrator.list_cycles(subject, limit).await?;
    if output == Output::Json {
        return print_json(&cycles);
    }
    if cycles.is_empty() {
        println!("No cycles");
        return Ok(());
    }
    for cycle in cycles {
        println!(
            "{} {} {:<24} {:<10} candidates {}/{}",
            cycle.started_at.to_rfc3339(),
            cycle.cycle_id,
            cycle.subject_id,
            cycle.status,
            cycle.candidates_passed,
            cycle.candidates_generated,
        );
    }
    Ok(())
}

async fn cmd_cycle_abandon(
    orchestrator: &EvolutionOrchestrator,
    cycle_id: &str,
    reason: &str,
) -> Result<()> {
    let cycle = orchestrator.abandon_cycle(cycle_id, reason).await?;
    println!("Cycle {} is now {}", cycle.cycle_id, cycle.status);
    Ok(())
}

async fn cmd_cycle_delete(orchestrator: &EvolutionOrchestrator, cycle_id: &str) -> Result<()> {
    let removed = orchestrator.delete_cycle(cycle_id).await?;
    println!("Deleted cycle {} ({} record(s))", cycle_id, removed);
    Ok(())
}

// ========== Status & review ==========

async fn cmd_status(
    orchestrator: &EvolutionOrchestrator,
    subject: &str,
    output: Output,
) -> Result<()> {
    let status = orchestrator.get_evolution_status(subject).await?;
    if output == Output::Json {
        return print_json(&status);
    }

    println!("Subject: {}", status.subject_id);
    match &status.config {
        Some(c) => println!(
            "Evolution: {} (min feedback {}, human approval {})",
            if c.enabled { "enabled" } else { "disabled" },
            c.min_feedback_count,
            c.require_human_approval
        ),
        None => println!("Evolution: not configured"),
    }
    match &status.current_version {
        Some(v) => println!("Production: v{} {}", v.sequence, v.version_id),
        None => println!("Production: none"),
    }
    println!("Feedback (30 days): {}", status.feedback_last_window);
    if status.cycle_in_progress {
        println!("A cycle is in progress");
    }
    if !status.recent_cycles.is_empty() {
        println!("Recent cycles:");
        for cycle in &status.recent_cycles {
            println!(
                "  {} {:<10} {}",
                short(&cycle.cycle_id),
                cycle.status,
                cycle.error_message.as_deref().unwrap_or("")
            );
        }
    }
    println!("Pending candidates: {}", status.pending_candidates.len());
    Ok(())
}

async fn cmd_pending(
    orchestrator: &EvolutionOrchestrator,
    subject: Option<&str>,
    output: Output,
) -> Result<()> {
    let pending = orchestrator.get_pending_candidates(subject).await?;
    if output == Output::Json {
        return print_json(&pending);
    }
    if pending.is_empty() {
        println!("No candidates pending review");
        return Ok(());
    }
    for candidate in pending {
        println!(
            "{} {:<24} {:+.2}  {}",
            candidate.candidate_id,
            candidate.subject_id,
            candidate.improvement.unwrap_or(0.0),
            candidate.generation_rationale
        );
    }
    Ok(())
}

async fn cmd_approve(
    orchestrator: &EvolutionOrchestrator,
    candidate_id: &str,
    reviewer: &str,
    notes: Option<String>,
    output: Output,
) -> Result<()> {
    let version = orchestrator
        .approve_candidate(candidate_id, reviewer, notes)
        .await
        .context("approve failed")?;
    info!(candidate_id, version_id = %version.version_id, "candidate approved");
    if output == Output::Json {
        return print_json(&version);
    }
    println!(
        "Promoted {} -> {} v{}",
        candidate_id, version.subject_id, version.sequence
    );
    Ok(())
}

async fn cmd_reject(
    orchestrator: &EvolutionOrchestrator,
    candidate_id: &str,
    reviewer: &str,
    reason: Option<String>,
    output: Output,
) -> Result<()> {
    let candidate = orchestrator
        .reject_candidate(candidate_id, reviewer, reason)
        .await
        .context("reject failed")?;
    if output == Output::Json {
        return print_json(&candidate);
    }
    println!("Rejected {}", candidate.candidate_id);
    Ok(())
}

// ========== Config ==========

async fn cmd_config_show(
    orchestrator: &EvolutionOrchestrator,
    subject: &str,
    output: Output,
) -> Result<()> {
    let status = orchestrator.get_evolution_status(subject).await?;
    let Some(config) = status.config else {
        println!("No evolution config for {} (defaults apply)", subject);
        return Ok(());
    };
    if output == Output::Json {
        return print_json(&config);
    }
    println!("enabled                   {}", config.enabled);
    println!("min_feedback_count        {}", config.min_feedback_count);
    println!("min_improvement_threshold {}", config.min_improvement_threshold);
    println!("auto_promote_threshold    {}", config.auto_promote_threshold);
    println!("require_human_approval    {}", config.require_human_approval);
    println!("max_candidates_per_cycle  {}", config.max_candidates_per_cycle);
    println!("max_regression_allowed    {}", config.max_regression_allowed);
    println!("min_test_pass_rate        {}", config.min_test_pass_rate);
    Ok(())
}

async fn cmd_config_set(
    orchestrator: &EvolutionOrchestrator,
    subject: &str,
    update: ConfigUpdate,
    output: Output,
) -> Result<()> {
    let config = orchestrator.update_config(subject, update).await?;
    if output == Output::Json {
        return print_json(&config);
    }
    println!("Updated evolution config for {}", config.subject_id);
    Ok(())
}

// ========== Instructions ==========

async fn cmd_instructions_show(
    orchestrator: &EvolutionOrchestrator,
    subject: &str,
    output: Output,
) -> Result<()> {
    let status = orchestrator.get_evolution_status(subject).await?;
    let Some(version) = status.current_version else {
        println!("No instructions for {}", subject);
        return Ok(());
    };
    if output == Output::Json {
        return print_json(&version);
    }
    println!(
        "v{} {} ({} by {})",
        version.sequence,
        version.version_id,
        version.created_at.to_rfc3339(),
        version.change.changed_by
    );
    println!("--- system ---\n{}", version.instruction_set.system_text);
    for template in &version.instruction_set.templates {
        println!("--- {} ---\n{}", template.name, template.body);
    }
    Ok(())
}

async fn cmd_instructions_history(
    orchestrator: &EvolutionOrchestrator,
    subject: &str,
    output: Output,
) -> Result<()> {
    let history = orchestrator.instruction_history(subject).await?;
    if output == Output::Json {
        return print_json(&history);
    }
    if history.is_empty() {
        println!("No instruction history for {}", subject);
        return Ok(());
    }
    for version in history {
        println!(
            "v{:<4} {} {} {:<20} {}",
            version.sequence,
            version.created_at.to_rfc3339(),
            short(&version.version_id),
            version.change.changed_by,
            version.change.notes.as_deref().unwrap_or("")
        );
    }
    Ok(())
}

async fn cmd_instructions_set(
    orchestrator: &EvolutionOrchestrator,
    subject: &str,
    file: &Path,
    changed_by: &str,
    notes: Option<String>,
) -> Result<()> {
    let set: InstructionSet = read_json_file(file)?;
    let version = orchestrator
        .set_instructions(subject, set, changed_by, notes)
        .await?;
    println!(
        "Wrote {} v{} ({})",
        subject,
        version.sequence,
        version.version_id
    );
    Ok(())
}

async fn cmd_instructions_rollback(
    orchestrator: &EvolutionOrchestrator,
    subject: &str,
    changed_by: &str,
) -> Result<()> {
    let version = orchestrator
        .rollback_instructions(subject, changed_by)
        .await?;
    println!(
        "Rolled back {} -> v{} ({})",
        subject,
        version.sequence,
        version.change.notes.as_deref().unwrap_or("")
    );
    Ok(())
}

// ========== Seeding ==========

async fn cmd_seed_feedback(orchestrator: &EvolutionOrchestrator, file: &Path) -> Result<()> {
    let records: Vec<FeedbackRecord> = read_json_file(file)?;
    let count = records.len();
    for record in records {
        orchestrator.stores().feedback.record(record).await?;
    }
    println!("Recorded {} feedback record(s)", count);
    Ok(())
}

async fn cmd_seed_test_cases(orchestrator: &EvolutionOrchestrator, file: &Path) -> Result<()> {
    let cases: Vec<TestCase> = read_json_file(file)?;
    let count = cases.len();
    for case in cases {
        orchestrator.stores().test_cases.upsert(case).await?;
    }
    println!("Upserted {} test case(s)", count);
    Ok(())
}
