use anyhow::{bail, Context, Result};
use chrono::Utc;
use clap::{Parser, Subcommand};
use std::path::{Path, PathBuf};
use std::sync::Arc;

use yard_migrator::{
    verify_artifacts, BlockingExecutor, CalendarScheduleExecutor, CommandStageExecutor,
    ConfirmPublishExecutor, Coordinator, FileStateStore, ItemId, ItemRecord, JsonCatalogFile,
    MemoryStateStore, MigrationConfig, MigrationReport, PublicationCalendar, ResourceBudget,
    RetryPolicy, RunSummary, ShutdownCoordinator, Stage, StageExecutor, StageExecutors,
    StageFailure, StageOutput, StateStore, Step, StopReason,
};

#[derive(Parser)]
#[command(name = "yard-migrator")]
#[command(about = "Resumable migration of a media catalog to a video host")]
#[command(long_about = "Moves every catalog item through download, convert, upload, schedule and \
                       publish. Progress is stored per item, so any command can be interrupted and \
                       re-run without repeating finished work.")]
struct Cli {
    /// Configuration file (defaults to ./yard-migrator.toml when present)
    #[arg(long, global = true)]
    config: Option<PathBuf>,

    /// Debug logging
    #[arg(long, short = 'v', global = true)]
    verbose: bool,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Register catalog entries as discovered items
    Discover {
        /// JSON array of {id, title, date, source_url}
        #[arg(long)]
        catalog: PathBuf,
    },
    /// Advance a single step once
    Stage {
        /// download, convert, upload, schedule or publish
        step: Step,
        /// Items to dispatch (defaults to the step's configured concurrency)
        #[arg(long)]
        limit: Option<usize>,
    },
    /// Run every step until nothing is left to do
    Run {
        /// Simulate against an in-memory copy of the state; nothing is executed or written
        #[arg(long)]
        dry_run: bool,
    },
    /// Continue an interrupted migration
    Resume,
    /// Show progress per stage and step
    Report {
        #[arg(long)]
        json: bool,
    },
    /// Check that downloaded and converted files still exist
    Verify {
        /// Directory relative artifact locators are resolved against
        #[arg(long, default_value = ".")]
        base: PathBuf,
    },
    /// Move an item to skipped by hand
    Skip {
        id: String,
        #[arg(long)]
        reason: String,
    },
    /// Show one item's record
    Status { id: String },
}

fn main() -> Result<()> {
    let cli = Cli::parse();

    MigrationConfig::load_env_file()?;
    let config = MigrationConfig::load(cli.config.as_deref())?;
    let level = if cli.verbose {
        "debug"
    } else {
        config.observability.log_level.as_str()
    };
    yard_migrator::init_telemetry(level, config.observability.json)?;

    tokio::runtime::Runtime::new()?.block_on(async {
        match cli.command {
            Commands::Discover { catalog } => discover_command(&config, &catalog).await,
            Commands::Stage { step, limit } => stage_command(&config, step, limit).await,
            Commands::Run { dry_run } => run_command(&config, dry_run).await,
            Commands::Resume => resume_command(&config).await,
            Commands::Report { json } => report_command(&config, json).await,
            Commands::Verify { base } => verify_command(&config, &base).await,
            Commands::Skip { id, reason } => skip_command(&config, &id, &reason).await,
            Commands::Status { id } => status_command(&config, &id).await,
        }
    })
}

async fn open_store(config: &MigrationConfig) -> Result<Arc<FileStateStore>> {
    let store = FileStateStore::open(&config.store.path)
        .await
        .with_context(|| format!("Failed to open state store at {}", config.store.path.display()))?;
    Ok(Arc::new(store))
}

/// Executor table from configuration; `required` steps must have one
fn build_executors(config: &MigrationConfig, required: &[Step]) -> Result<StageExecutors> {
    let calendar = PublicationCalendar::from_config(&config.calendar);
    let missing: Vec<&str> = required
        .iter()
        .filter(|step| matches!(step, Step::Download | Step::Convert | Step::Upload))
        .filter(|step| config.executors.get(**step).is_none())
        .map(|step| step.as_str())
        .collect();
    if !missing.is_empty() {
        bail!(
            "No command configured for {}. Add [executors.<step>] program = \"...\" to the configuration.",
            missing.join(", ")
        );
    }

    let command_or = |step: Step, fallback: Arc<dyn StageExecutor>| -> Arc<dyn StageExecutor> {
        match config.executors.get(step) {
            Some(spec) => Arc::new(CommandStageExecutor::new(spec.clone())),
            None => fallback,
        }
    };
    let unconfigured = |step: Step| -> Arc<dyn StageExecutor> {
        Arc::new(BlockingExecutor::new(move |_, _: &ItemRecord| {
            Err(StageFailure::transient(format!("{} has no configured command", step)))
        }))
    };

    Ok(StageExecutors::new(
        command_or(Step::Download, unconfigured(Step::Download)),
        command_or(Step::Convert, unconfigured(Step::Convert)),
        command_or(Step::Upload, unconfigured(Step::Upload)),
        command_or(Step::Schedule, Arc::new(CalendarScheduleExecutor::new(calendar))),
        command_or(Step::Publish, Arc::new(ConfirmPublishExecutor)),
    ))
}

/// Executors that pretend every step worked
fn simulated_executors(config: &MigrationConfig) -> StageExecutors {
    let simulated: Arc<dyn StageExecutor> = Arc::new(BlockingExecutor::new(|step, record: &ItemRecord| {
        Ok(StageOutput::new(format!("dry-run/{}/{}", step, record.id)))
    }));
    StageExecutors::uniform(simulated)
        .with(
            Step::Schedule,
            Arc::new(CalendarScheduleExecutor::new(PublicationCalendar::from_config(&config.calendar))),
        )
        .with(Step::Publish, Arc::new(ConfirmPublishExecutor))
}

fn coordinator(config: &MigrationConfig, store: Arc<dyn StateStore>, executors: StageExecutors) -> Coordinator {
    Coordinator::new(
        store,
        executors,
        RetryPolicy::new(config.retry.clone()),
        config.coordinator.clone(),
    )
    .with_budget(ResourceBudget::new(&config.budget))
}

async fn discover_command(config: &MigrationConfig, catalog: &Path) -> Result<()> {
    let store = open_store(config).await?;
    let coordinator = coordinator(config, store, simulated_executors(config));
    let summary = coordinator.discover(&JsonCatalogFile::new(catalog)).await?;

    println!("🔎 Catalog lists {} items", summary.listed);
    println!("   {} newly registered, {} already known", summary.registered, summary.already_known);
    Ok(())
}

async fn stage_command(config: &MigrationConfig, step: Step, limit: Option<usize>) -> Result<()> {
    let store = open_store(config).await?;
    let executors = build_executors(config, &[step])?;
    let coordinator = coordinator(config, store, executors);
    let shutdown = ShutdownCoordinator::new();
    shutdown.install_signal_handlers()?;
    let coordinator = coordinator.with_cancellation(shutdown.token());

    let limit = limit.unwrap_or(*config.coordinator.concurrency.get(step));
    let report = coordinator.advance(step, limit).await?;

    println!("▶️  {}: dispatched {}", step, report.dispatched);
    println!(
        "   succeeded {}, retrying {}, skipped {}, conflicts {}",
        report.succeeded, report.retrying, report.skipped, report.conflicts
    );
    if report.lease_skipped > 0 {
        println!("   {} items are being worked on by another run", report.lease_skipped);
    }
    if report.budget_deferred > 0 {
        println!("   {} uploads deferred: daily budget spent", report.budget_deferred);
    }
    if report.abandoned > 0 {
        println!("   {} items abandoned by shutdown; they will be retried", report.abandoned);
    }
    Ok(())
}

async fn run_command(config: &MigrationConfig, dry_run: bool) -> Result<()> {
    let file_store = open_store(config).await?;

    let (store, executors): (Arc<dyn StateStore>, StageExecutors) = if dry_run {
        println!("🧪 Dry run: working on an in-memory copy of the state");
        let copy = MemoryStateStore::with_records(file_store.list_all().await?).await;
        (Arc::new(copy), simulated_executors(config))
    } else {
        (file_store, build_executors(config, &Step::ALL)?)
    };

    let shutdown = ShutdownCoordinator::new();
    shutdown.install_signal_handlers()?;
    let coordinator = coordinator(config, store, executors).with_cancellation(shutdown.token());

    let summary = coordinator
        .run_to_completion(config.coordinator.poll_interval())
        .await?;
    print_run_summary(&summary);
    Ok(())
}

async fn resume_command(config: &MigrationConfig) -> Result<()> {
    let store = open_store(config).await?;
    let records = store.list_all().await?;
    let now = Utc::now();

    let open = records.iter().filter(|r| !r.stage.is_terminal()).count();
    let waiting = records.iter().filter(|r| r.pending_retry(now).is_some()).count();
    println!("🔄 Resuming: {} of {} items unfinished, {} waiting on a retry deadline", open, records.len(), waiting);

    if open == 0 {
        println!("✅ Nothing to resume");
        return Ok(());
    }
    run_command(config, false).await
}

fn print_run_summary(summary: &RunSummary) {
    println!();
    println!("📊 Run {} finished after {} passes", summary.run_id, summary.passes);
    for step in Step::ALL {
        let report = summary.steps.get(step);
        if report.dispatched == 0 && report.skipped == 0 {
            continue;
        }
        println!(
            "   {:<9} dispatched {:>4}  succeeded {:>4}  retrying {:>4}  skipped {:>4}",
            step.as_str(),
            report.dispatched,
            report.succeeded,
            report.retrying,
            report.skipped
        );
    }
    println!(
        "   published {}, skipped {}, total {}",
        summary.count(Stage::Published),
        summary.count(Stage::Skipped),
        summary.total()
    );
    let parked: usize = Step::ALL.iter().map(|step| summary.steps.get(*step).parked).sum();
    if parked > 0 {
        println!("⚠️  {} items parked after a failure that is never retried; see 'yard-migrator report'", parked);
    }

    match &summary.stop_reason {
        StopReason::Drained => println!("✅ Nothing left to do"),
        StopReason::Stopped => println!("⏸️  Stopped; run 'yard-migrator resume' to continue"),
        StopReason::Deferred { next_deadline } => println!(
            "⏳ Remaining work becomes eligible at {}; run 'yard-migrator resume' then",
            next_deadline.to_rfc3339()
        ),
    }
}

async fn report_command(config: &MigrationConfig, json: bool) -> Result<()> {
    let store = open_store(config).await?;
    let report = MigrationReport::from_records(&store.list_all().await?, Utc::now());

    if json {
        println!("{}", serde_json::to_string_pretty(&report)?);
    } else {
        print!("{}", report);
    }
    Ok(())
}

async fn verify_command(config: &MigrationConfig, base: &Path) -> Result<()> {
    let store = open_store(config).await?;
    let missing = verify_artifacts(&store.list_all().await?, base);

    if missing.is_empty() {
        println!("✅ All files verified successfully");
        return Ok(());
    }
    println!("❌ Found {} missing files:", missing.len());
    for item in &missing {
        println!("  - {} ({}): {}", item.id, item.step, item.path.display());
    }
    bail!("{} artifacts are missing", missing.len())
}

async fn skip_command(config: &MigrationConfig, id: &str, reason: &str) -> Result<()> {
    let id = ItemId::new(id)?;
    let store = open_store(config).await?;
    let coordinator = coordinator(config, store, simulated_executors(config));

    let record = coordinator.skip(&id, reason).await?;
    println!("⏭️  {} skipped ({})", record.id, record.status_message);
    Ok(())
}

async fn status_command(config: &MigrationConfig, id: &str) -> Result<()> {
    let id = ItemId::new(id)?;
    let store = open_store(config).await?;
    let coordinator = coordinator(config, store, simulated_executors(config));
    let Some(record) = coordinator.status(&id).await? else {
        bail!("No item with id {}", id);
    };
    println!("{}", serde_json::to_string_pretty(&record)?);
    Ok(())
}
