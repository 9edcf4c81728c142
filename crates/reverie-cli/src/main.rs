//! Reverie CLI
//!
//! Command-line interface for loading concepts, running dream cycles, and
//! reviewing the insights they produce.

use std::io;
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

use clap::{Parser, Subcommand};
use colored::Colorize;
use serde::Serialize;
use tracing::Level;
use tracing_subscriber::EnvFilter;

use reverie_core::dream::DREAM_STATS_KEY;
use reverie_core::scheduler::SCHEDULER_STATS_KEY;
use reverie_core::{
    ConceptLoader, ConceptStore, CycleOutcome, CycleStatus, DreamEngine, DreamInsight,
    InsightType, ReverieConfig, TriggerPriority,
};

/// Reverie - dream-cycle consolidation for agent knowledge
#[derive(Parser)]
#[command(name = "reverie")]
#[command(version = env!("CARGO_PKG_VERSION"))]
#[command(about = "CLI for the Reverie dream-cycle engine")]
#[command(long_about = "Reverie dreams over a graph of learned concepts.\n\nSpreading activation surfaces co-activated concepts; scored insights are kept only when pattern quality holds.")]
struct Cli {
    /// Database file (defaults to REVERIE_DB_PATH, then the platform data directory)
    #[arg(long, global = true)]
    db: Option<PathBuf>,

    /// Print JSON instead of text
    #[arg(long, global = true)]
    json: bool,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Show concept graph and cycle statistics
    Stats,

    /// Load upstream patterns and experiences into the concept graph
    Load {
        /// Also load processed experiences newer than this many days
        #[arg(long, default_value = "7")]
        recent_days: i64,
    },

    /// Run one branch-isolated dream cycle
    Dream {
        /// Dream duration in milliseconds
        #[arg(long)]
        duration_ms: Option<u64>,
        /// Bypass the cooldown
        #[arg(long)]
        force: bool,
    },

    /// List pending insights
    Insights {
        /// Only this type (pattern_merge, novel_association, optimization, gap_detection)
        #[arg(long = "type")]
        insight_type: Option<String>,
        #[arg(long, default_value = "20")]
        limit: usize,
    },

    /// Mark an insight applied, materializing its pattern when actionable
    Apply {
        /// Insight id
        id: String,
        #[arg(long)]
        feedback: Option<String>,
    },

    /// Show recent dream cycles
    History {
        #[arg(long, default_value = "10")]
        limit: usize,
    },

    /// Run the scheduler until Ctrl-C
    Daemon,
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let cli = Cli::parse();

    // Logs go to stderr; stdout carries command output
    let level = if matches!(cli.command, Commands::Daemon) {
        Level::INFO
    } else {
        Level::WARN
    };
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::from_default_env().add_directive(level.into()))
        .with_writer(io::stderr)
        .with_target(false)
        .init();

    let mut config = ReverieConfig::from_env();
    if cli.db.is_some() {
        config.db_path = cli.db.clone();
    }
    let store = Arc::new(config.open_store()?);

    match cli.command {
        Commands::Stats => run_stats(&store, cli.json),
        Commands::Load { recent_days } => run_load(store, recent_days, cli.json),
        Commands::Dream { duration_ms, force } => {
            if let Some(ms) = duration_ms {
                config.dream.cycle_duration_ms = ms;
            }
            run_dream(&config, store, force, cli.json).await
        }
        Commands::Insights { insight_type, limit } => {
            run_insights(store, insight_type.as_deref(), limit, cli.json)
        }
        Commands::Apply { id, feedback } => run_apply(store, &id, feedback.as_deref(), cli.json),
        Commands::History { limit } => run_history(&store, limit, cli.json),
        Commands::Daemon => run_daemon(&config, store).await,
    }
}

fn print_json<T: Serialize>(value: &T) -> anyhow::Result<()> {
    println!("{}", serde_json::to_string_pretty(value)?);
    Ok(())
}

/// Run stats command
fn run_stats(store: &ConceptStore, json: bool) -> anyhow::Result<()> {
    let stats = store.get_stats()?;
    let quality = store.quality_metrics()?;
    let dream_stats = store.load_engine_state(DREAM_STATS_KEY)?;
    let scheduler_stats = store.load_engine_state(SCHEDULER_STATS_KEY)?;

    if json {
        return print_json(&serde_json::json!({
            "graph": stats,
            "quality": quality,
            "dreams": dream_stats,
            "scheduler": scheduler_stats,
        }));
    }

    println!("{}", "=== Reverie Concept Graph ===".cyan().bold());
    println!();
    println!("{}: {}", "Concepts".white().bold(), stats.total_nodes);
    println!("{}: {}", "Edges".white().bold(), stats.total_edges);
    println!("{}: {:.2}", "Edges per Concept".white().bold(), stats.avg_edges_per_node);
    println!("{}: {:.3}", "Average Activation".white().bold(), stats.avg_activation);

    if !stats.nodes_by_type.is_empty() {
        println!();
        println!("{}", "=== Concepts by Type ===".yellow().bold());
        let mut types: Vec<_> = stats.nodes_by_type.iter().collect();
        types.sort();
        for (name, count) in types {
            println!("  {:<12} {}", name, count);
        }
    }

    println!();
    println!("{}", "=== Pattern Quality ===".yellow().bold());
    println!("{}: {}", "Patterns".white().bold(), quality.pattern_count);
    println!("{}: {:.3}", "Average Confidence".white().bold(), quality.avg_confidence);
    println!("{}: {}", "High Confidence".white().bold(), quality.high_confidence_count);

    if let Some(dreams) = dream_stats {
        println!();
        println!("{}", "=== Dreams ===".yellow().bold());
        println!("{}: {}", "Completed".white().bold(), dreams["cyclesCompleted"]);
        println!("{}: {}", "Failed".white().bold(), dreams["cyclesFailed"]);
        println!("{}: {}", "Insights".white().bold(), dreams["totalInsights"]);
    }
    Ok(())
}

/// Run load command
fn run_load(store: Arc<ConceptStore>, recent_days: i64, json: bool) -> anyhow::Result<()> {
    let window = chrono::Duration::try_days(recent_days.max(0))
        .ok_or_else(|| anyhow::anyhow!("--recent-days out of range: {}", recent_days))?;
    let report = ConceptLoader::new(store)
        .with_recent_window(window)
        .load_all()?;

    if json {
        return print_json(&report);
    }
    println!("{}", "Load complete".green().bold());
    println!("  {:<14} {}", "patterns", report.patterns);
    println!("  {:<14} {}", "synthesized", report.synthesized);
    println!("  {:<14} {}", "experiences", report.experiences);
    println!("  {:<14} {}", "decisions", report.decisions);
    println!("  {:<14} {}", "errors", report.errors);
    println!("  {:<14} {}", "edges", report.edges);
    if report.skipped_contexts > 0 {
        println!(
            "{}",
            format!("  {} experience contexts could not be parsed", report.skipped_contexts).yellow()
        );
    }
    Ok(())
}

/// Run dream command
async fn run_dream(
    config: &ReverieConfig,
    store: Arc<ConceptStore>,
    force: bool,
    json: bool,
) -> anyhow::Result<()> {
    let mut config = config.clone();
    config.scheduler.schedule_interval_ms = 0;
    let scheduler = config.build_scheduler(Arc::clone(&store));

    let result = scheduler.request_dream("cli request", TriggerPriority::Normal, force);
    if !result.scheduled {
        anyhow::bail!("Dream not scheduled: {}", result.reason);
    }
    if !json {
        println!(
            "{} ({} ms)",
            "Dreaming...".cyan().bold(),
            config.dream.cycle_duration_ms
        );
    }

    let budget = Duration::from_millis(config.dream.cycle_duration_ms) + Duration::from_secs(60);
    if !scheduler.wait_for_idle(budget).await {
        tracing::warn!("Dream cycle did not finish in time");
    }
    scheduler.shutdown().await?;

    let summary = scheduler
        .history(1)
        .into_iter()
        .next()
        .ok_or_else(|| anyhow::anyhow!("Dream cycle did not record a summary"))?;
    let insights = match (&summary.cycle_id, summary.outcome) {
        (Some(cycle_id), CycleOutcome::Merged) => store.get_insights_for_cycle(cycle_id)?,
        _ => Vec::new(),
    };

    if json {
        return print_json(&serde_json::json!({
            "summary": summary,
            "insights": insights,
        }));
    }

    let outcome = match summary.outcome {
        CycleOutcome::Merged => "merged".green().bold(),
        CycleOutcome::Discarded => "discarded".yellow().bold(),
        CycleOutcome::Failed => "failed".red().bold(),
    };
    println!("{}: {}", "Outcome".white().bold(), outcome);
    println!("{}: {} ms", "Duration".white().bold(), summary.duration_ms);
    println!("{}: {}", "Associations".white().bold(), summary.associations);
    println!("{}: {}", "Insights".white().bold(), summary.insights);
    if summary.aborted {
        println!("{}", "Cycle was aborted before its deadline".yellow());
    }
    if let Some(reason) = summary.validation.as_ref().and_then(|v| v.reason.as_ref()) {
        println!("{}: {}", "Validation".white().bold(), reason.yellow());
    }
    if let Some(error) = &summary.error {
        println!("{}: {}", "Error".white().bold(), error.red());
    }
    if !insights.is_empty() {
        println!();
        print_insights(&insights);
    }
    Ok(())
}

/// Run insights command
fn run_insights(
    store: Arc<ConceptStore>,
    insight_type: Option<&str>,
    limit: usize,
    json: bool,
) -> anyhow::Result<()> {
    let engine = DreamEngine::new(store);
    let insights = match insight_type {
        Some(name) => {
            let parsed: InsightType = name.parse().map_err(anyhow::Error::msg)?;
            engine.get_insights_by_type(parsed, limit)?
        }
        None => engine.get_pending_insights(limit)?,
    };

    if json {
        return print_json(&insights);
    }
    if insights.is_empty() {
        println!("{}", "No insights found.".dimmed());
        return Ok(());
    }
    print_insights(&insights);
    Ok(())
}

fn print_insights(insights: &[DreamInsight]) {
    println!("{}", "=== Insights ===".cyan().bold());
    for insight in insights {
        let marker = if insight.applied {
            "applied".dimmed()
        } else if insight.actionable {
            "actionable".green()
        } else {
            "info".normal()
        };
        println!(
            "{} [{}] {} (novelty {:.2}, confidence {:.2})",
            insight.id.dimmed(),
            insight.insight_type.to_string().cyan(),
            marker,
            insight.novelty_score,
            insight.confidence_score
        );
        println!("    {}", insight.description);
        if let Some(action) = &insight.suggested_action {
            println!("    {} {}", "->".yellow(), action);
        }
    }
}

/// Run apply command
fn run_apply(
    store: Arc<ConceptStore>,
    id: &str,
    feedback: Option<&str>,
    json: bool,
) -> anyhow::Result<()> {
    let engine = DreamEngine::new(store);
    let insight = engine.apply_insight(id, feedback)?;

    if json {
        return print_json(&insight);
    }
    println!("{} {}", "Applied".green().bold(), insight.id);
    if let Some(pattern_id) = &insight.pattern_id {
        println!("{}: {}", "Pattern".white().bold(), pattern_id);
    }
    Ok(())
}

/// Run history command
fn run_history(store: &ConceptStore, limit: usize, json: bool) -> anyhow::Result<()> {
    let cycles = store.get_cycles(limit)?;
    if json {
        return print_json(&cycles);
    }
    if cycles.is_empty() {
        println!("{}", "No dream cycles recorded.".dimmed());
        return Ok(());
    }

    println!("{}", "=== Dream Cycles ===".cyan().bold());
    for cycle in cycles {
        let status = match cycle.status {
            CycleStatus::Completed => cycle.status.as_str().green(),
            CycleStatus::Running => cycle.status.as_str().cyan(),
            CycleStatus::Discarded => cycle.status.as_str().yellow(),
            CycleStatus::Failed => cycle.status.as_str().red(),
        };
        println!(
            "{}  {:<9}  {:>7} ms  {:>3} concepts  {:>2} associations  {:>2} insights",
            cycle.start_time.format("%Y-%m-%d %H:%M:%S"),
            status,
            cycle.duration_ms.unwrap_or(0),
            cycle.concepts_processed,
            cycle.associations_found,
            cycle.insights_generated
        );
        if let Some(error) = &cycle.error {
            println!("    {}", error.dimmed());
        }
    }
    Ok(())
}

/// Run daemon command
async fn run_daemon(config: &ReverieConfig, store: Arc<ConceptStore>) -> anyhow::Result<()> {
    let report = ConceptLoader::new(Arc::clone(&store)).load_all()?;
    tracing::info!(concepts = report.total_nodes(), "Initial concept load complete");

    let scheduler = config.build_scheduler(store);
    scheduler.start();
    tracing::info!("Reverie daemon running; Ctrl-C to stop");

    tokio::signal::ctrl_c().await?;
    tracing::info!("Shutdown requested");

    let stats = scheduler.shutdown().await?;
    tracing::info!(
        merged = stats.cycles_merged,
        discarded = stats.cycles_discarded,
        failed = stats.cycles_failed,
        "Reverie daemon stopped"
    );
    Ok(())
}
