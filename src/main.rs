//! Ripple-Research main entry point
//!
//! This is the command-line interface for the research crawl and document
//! workflow engine.

use anyhow::{bail, Context};
use clap::{Parser, Subcommand};
use ripple_research::config::{load_config_with_hash, Config};
use ripple_research::crawler::HttpFetcher;
use ripple_research::document::ExportFormat;
use ripple_research::storage::open_storage;
use ripple_research::telemetry::print_statistics;
use ripple_research::workflow::{
    ExtractiveDrafter, OutlineOptions, RunOutcome, StopOutcome, WorkflowOrchestrator,
};
use ripple_research::SourceType;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use tracing_subscriber::EnvFilter;

/// Ripple-Research: a polite research crawler and document builder
///
/// Ripple-Research fetches the sources of a research topic while respecting
/// robots.txt and per-domain crawl delays, then drafts an outline and its
/// sections from the fetched material and exports the finished document.
#[derive(Parser, Debug)]
#[command(name = "ripple-research")]
#[command(version)]
#[command(about = "A polite research crawler and document builder", long_about = None)]
struct Cli {
    /// Path to TOML configuration file (defaults apply when omitted)
    #[arg(short, long, value_name = "FILE", global = true)]
    config: Option<PathBuf>,

    /// Increase logging verbosity (-v, -vv, -vvv)
    #[arg(short, long, action = clap::ArgAction::Count, global = true)]
    verbose: u8,

    /// Suppress non-error output
    #[arg(short, long, conflicts_with = "verbose", global = true)]
    quiet: bool,

    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand, Debug)]
enum Command {
    /// Create a research record
    New {
        topic: String,
        #[arg(short, long)]
        description: Option<String>,
        #[arg(short, long, default_value = "breadth")]
        strategy: String,
    },

    /// Add a source URL to a research record
    AddSource {
        research_id: String,
        url: String,
        /// web, pdf, academic or api
        #[arg(short = 't', long = "type", default_value = "web")]
        source_type: SourceType,
    },

    /// Execute the workflow of a new research record (Ctrl-C pauses it)
    Run { research_id: String },

    /// Resume a paused or failed workflow (Ctrl-C pauses it)
    Resume { research_id: String },

    /// Pause a running workflow
    Stop { research_id: String },

    /// Show workflow status, phase and failure context
    Status { research_id: String },

    /// Show crawl statistics for a research record
    Stats { research_id: String },

    /// Move a failed source back to pending
    Retry { source_id: String },

    /// Generate the section outline once all sources are complete
    Outline {
        research_id: String,
        #[arg(long)]
        sections: Option<u32>,
        #[arg(long)]
        depth: Option<u32>,
    },

    /// Draft one pending section
    BuildSection { section_id: String },

    /// List the section tree of a research record
    Sections { research_id: String },

    /// Render the completed sections into a document
    Export {
        research_id: String,
        /// markdown, html, json or text (defaults to the configured format)
        #[arg(short, long)]
        format: Option<String>,
        /// Write the document to a file instead of stdout
        #[arg(short, long)]
        output: Option<PathBuf>,
    },

    /// Delete expired exports
    Gc,
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let cli = Cli::parse();

    // Setup logging based on verbosity
    setup_logging(cli.verbose, cli.quiet);

    let config = match &cli.config {
        Some(path) => {
            tracing::info!("Loading configuration from: {}", path.display());
            let (config, hash) = load_config_with_hash(path)
                .with_context(|| format!("failed to load {}", path.display()))?;
            tracing::info!("Configuration loaded successfully (hash: {})", hash);
            config
        }
        None => Config::default(),
    };

    let orchestrator = build_orchestrator(config.clone())?;

    match cli.command {
        Command::New {
            topic,
            description,
            strategy,
        } => {
            let record = orchestrator.create_research(&topic, description.as_deref(), &strategy)?;
            println!("{}", record.id);
        }
        Command::AddSource {
            research_id,
            url,
            source_type,
        } => {
            let source = orchestrator.add_source(&research_id, &url, source_type)?;
            println!("{} {} ({})", source.id, source.url, source.status);
        }
        Command::Run { research_id } => {
            let outcome = run_until_interrupted(&orchestrator, &research_id, false).await?;
            report_outcome(&research_id, &outcome)?;
        }
        Command::Resume { research_id } => {
            let outcome = run_until_interrupted(&orchestrator, &research_id, true).await?;
            report_outcome(&research_id, &outcome)?;
        }
        Command::Stop { research_id } => match orchestrator.stop_workflow(&research_id)? {
            StopOutcome::Signalled | StopOutcome::Paused => println!("Paused {}", research_id),
            StopOutcome::NotRunning(status) => println!("Research {} is {}", research_id, status),
        },
        Command::Status { research_id } => handle_status(&orchestrator, &research_id)?,
        Command::Stats { research_id } => {
            orchestrator.get_research(&research_id)?;
            let stats = orchestrator
                .sources()
                .telemetry()
                .research_crawl_statistics(&research_id)?;
            print_statistics(&stats);
        }
        Command::Retry { source_id } => {
            if orchestrator.retry_source(&source_id)? {
                println!("Source {} is pending again", source_id);
            } else {
                println!("Source {} is not failed; nothing to retry", source_id);
            }
        }
        Command::Outline {
            research_id,
            sections,
            depth,
        } => {
            let defaults = OutlineOptions::from_config(&config);
            let options = OutlineOptions {
                sections_count: sections.unwrap_or(defaults.sections_count),
                depth: depth.unwrap_or(defaults.depth),
            };
            let created = orchestrator.generate_outline(&research_id, options).await?;
            println!("Outline has {} sections", created.len());
            print_sections(&orchestrator, &research_id)?;
        }
        Command::BuildSection { section_id } => {
            let section = orchestrator.build_section(&section_id).await?;
            println!(
                "Built '{}' ({} words)",
                section.title,
                section.word_count.unwrap_or(0)
            );
        }
        Command::Sections { research_id } => print_sections(&orchestrator, &research_id)?,
        Command::Export {
            research_id,
            format,
            output,
        } => {
            let format: ExportFormat = format
                .as_deref()
                .unwrap_or(&config.workflow.export_format)
                .parse()?;
            handle_export(&orchestrator, &research_id, format, output.as_deref())?;
        }
        Command::Gc => {
            let removed = orchestrator.exports().delete_expired(chrono::Utc::now())?;
            println!("Deleted {} expired exports", removed);
        }
    }

    Ok(())
}

/// Sets up the logging/tracing subscriber based on verbosity level
fn setup_logging(verbose: u8, quiet: bool) {
    let filter = if quiet {
        // Only show errors
        EnvFilter::new("error")
    } else {
        match verbose {
            0 => EnvFilter::new("ripple_research=info,warn"),
            1 => EnvFilter::new("ripple_research=debug,info"),
            2 => EnvFilter::new("ripple_research=trace,debug"),
            _ => EnvFilter::new("trace"),
        }
    };

    tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_target(false)
        .with_thread_ids(false)
        .with_file(false)
        .init();
}

fn build_orchestrator(config: Config) -> anyhow::Result<WorkflowOrchestrator> {
    let storage = open_storage(Path::new(&config.output.database_path))
        .with_context(|| format!("failed to open {}", config.output.database_path))?;
    let fetcher = HttpFetcher::new(&config.user_agent, config.crawler.fetch_timeout())
        .context("failed to build HTTP client")?;

    Ok(WorkflowOrchestrator::new(
        storage,
        config,
        Arc::new(fetcher),
        Arc::new(ExtractiveDrafter::new()),
    ))
}

/// Runs or resumes a workflow; the first Ctrl-C requests a cooperative stop
async fn run_until_interrupted(
    orchestrator: &WorkflowOrchestrator,
    research_id: &str,
    resume: bool,
) -> anyhow::Result<RunOutcome> {
    let runner = orchestrator.clone();
    let id = research_id.to_string();
    let mut run = tokio::spawn(async move {
        if resume {
            runner.resume_workflow(&id).await
        } else {
            runner.execute_workflow(&id).await
        }
    });

    tokio::select! {
        joined = &mut run => return Ok(joined??),
        signal = tokio::signal::ctrl_c() => {
            signal.context("failed to listen for Ctrl-C")?;
            tracing::info!("Interrupt received, finishing the current unit of work");
            orchestrator.stop_workflow(research_id)?;
        }
    }

    Ok(run.await??)
}

fn report_outcome(research_id: &str, outcome: &RunOutcome) -> anyhow::Result<()> {
    match outcome {
        RunOutcome::NotStarted(status) => {
            println!("Research {} is {}; nothing to do", research_id, status)
        }
        RunOutcome::Completed => println!("Research {} complete", research_id),
        RunOutcome::Paused => println!("Research {} paused", research_id),
        RunOutcome::Interrupted(status) => {
            println!("Research {} was moved to {} elsewhere", research_id, status)
        }
        RunOutcome::Failed {
            phase,
            entity_id,
            message,
        } => bail!(
            "research {} failed in {} ({}): {}",
            research_id,
            phase,
            entity_id.as_deref().unwrap_or("-"),
            message
        ),
    }
    Ok(())
}

fn handle_status(orchestrator: &WorkflowOrchestrator, research_id: &str) -> anyhow::Result<()> {
    let research = orchestrator.get_research(research_id)?;
    let status = orchestrator.get_workflow_status(research_id)?;

    println!("=== Research: {} ===\n", research.topic);
    println!("Status: {}", status.status);
    println!("Phase: {}", status.phase);
    println!(
        "Can execute: {}  Can resume: {}  Can stop: {}",
        status.capabilities.can_execute, status.capabilities.can_resume, status.capabilities.can_stop
    );

    if let Some(failure) = &status.failure {
        println!("\nLast failure:");
        if let Some(phase) = failure.phase {
            println!("  Phase: {}", phase);
        }
        if let Some(entity) = &failure.entity_id {
            println!("  Entity: {}", entity);
        }
        if let Some(message) = &failure.message {
            println!("  Error: {}", message);
        }
    }

    println!("\nSources:");
    for source in orchestrator.list_sources(research_id)? {
        println!("  {} [{}] {}", source.id, source.status, source.url);
    }
    Ok(())
}

fn print_sections(orchestrator: &WorkflowOrchestrator, research_id: &str) -> anyhow::Result<()> {
    let tree = orchestrator.sections().tree(research_id)?;
    if tree.is_empty() {
        println!("No sections yet");
    }
    for (depth, section) in tree.pre_order() {
        println!(
            "{}{} [{}] {}",
            "  ".repeat(depth),
            section.id,
            section.status,
            section.title
        );
    }
    Ok(())
}

fn handle_export(
    orchestrator: &WorkflowOrchestrator,
    research_id: &str,
    format: ExportFormat,
    output: Option<&Path>,
) -> anyhow::Result<()> {
    let exports = orchestrator.exports();
    let export = exports.create_export(research_id, format)?;

    match output {
        Some(path) => {
            std::fs::write(path, &export.content)
                .with_context(|| format!("failed to write {}", path.display()))?;
            println!("✓ Export {} written to: {}", export.id, path.display());
        }
        None => print!("{}", export.content),
    }
    exports.increment_download_count(&export.id)?;
    Ok(())
}
