use anyhow::{Context, Result};
use docs_pipeline::cli::commands::{
    HistoryCommand, ImageCommand, PlanCommand, RunCommand, ValidateCommand,
};
use docs_pipeline::cli::output::*;
use docs_pipeline::cli::{Cli, Command};
use docs_pipeline::core::config::PipelineConfig;
use docs_pipeline::core::{Pipeline, StepAction};
use docs_pipeline::execution::{
    ConcurrencyBackend, Dispatcher, EventBus, ExecutionEngine, FileTicketQueue, RunReport,
    StepExecutor,
};
use docs_pipeline::persistence::{InMemoryPersistence, PersistenceBackend};
use docs_pipeline::runner::{CommandRunner, Runtime, ShellRunner};
use docs_pipeline::stages::docs::{doc_groups, docs_flag_enabled, parse_flag, plan_docs, RunInfo};
use docs_pipeline::stages::image::plan_image;
use docs_pipeline::stages::resolver::LockState;
use docs_pipeline::stages::target::target_from_config;
use docs_pipeline::stages::{ArtifactStore, HttpFetcher, Publisher};
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;
use tracing_subscriber::EnvFilter;
use uuid::Uuid;

/// Timeout for a single archive download
const FETCH_TIMEOUT: Duration = Duration::from_secs(600);

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::from_args();

    // Initialize logging
    let default_level = if cli.verbose { "debug" } else { "info" };
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(default_level));
    tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_writer(std::io::stderr)
        .try_init()
        .map_err(|e| anyhow::anyhow!("Failed to set logging subscriber: {}", e))?;

    // Execute command
    let succeeded = match &cli.command {
        Command::Run(cmd) => run_docs(&cli, cmd).await?,
        Command::Image(cmd) => build_image(&cli, cmd).await?,
        Command::Validate(cmd) => validate_pipeline(&cli, cmd)?,
        Command::Plan(cmd) => plan_pipeline(&cli, cmd)?,
        Command::History(cmd) => show_history(cmd).await?,
    };

    if !succeeded {
        std::process::exit(1);
    }
    Ok(())
}

fn data_dir() -> PathBuf {
    dirs::data_local_dir()
        .unwrap_or_else(|| PathBuf::from("."))
        .join("docs-pipeline")
}

fn load_config(path: &Path, overrides: &[(String, String)]) -> Result<PipelineConfig> {
    let mut config = PipelineConfig::from_file(path)
        .with_context(|| format!("Failed to load pipeline config {}", path.display()))?;

    if !overrides.is_empty() {
        for (key, value) in overrides {
            config.variables.insert(key.clone(), value.clone());
            println!(
                "{} Variable override: {} = {}",
                INFO,
                style(key).cyan(),
                style(value).dim()
            );
        }
        config.validate()?;
    }
    Ok(config)
}

#[cfg(feature = "sqlite")]
async fn open_history(no_history: bool) -> Result<Arc<dyn PersistenceBackend>> {
    if no_history {
        return Ok(Arc::new(InMemoryPersistence::new()));
    }
    let store = docs_pipeline::persistence::SqliteExecutionStore::with_default_path().await?;
    Ok(Arc::new(store))
}

#[cfg(not(feature = "sqlite"))]
async fn open_history(_no_history: bool) -> Result<Arc<dyn PersistenceBackend>> {
    Ok(Arc::new(InMemoryPersistence::new()))
}

fn build_dispatcher(config: Arc<PipelineConfig>, history: Arc<dyn PersistenceBackend>) -> Result<Dispatcher> {
    let data_dir = data_dir();
    let runner: Arc<dyn CommandRunner> = Arc::new(ShellRunner::new());
    let runtime = Runtime::new(config.runtime, runner.clone(), data_dir.join("host"));

    let fetcher = Arc::new(HttpFetcher::new(FETCH_TIMEOUT)?);
    let events = EventBus::new();
    let engine = Arc::new(ExecutionEngine::new(
        StepExecutor::new(fetcher, data_dir.join("downloads")),
        events.clone(),
    ));

    let concurrency: Arc<dyn ConcurrencyBackend> = Arc::new(FileTicketQueue::new(data_dir.join("queues")));
    let artifacts = config
        .publish
        .artifact_dir
        .clone()
        .unwrap_or_else(|| data_dir.join("artifacts"));
    let publisher = Publisher::new(
        config.permissions.clone(),
        ArtifactStore::new(artifacts),
        target_from_config(&config.publish.target, runner),
        events,
    );

    Ok(Dispatcher::new(
        config,
        runtime,
        engine,
        concurrency,
        publisher,
        data_dir.join("workspaces"),
    )
    .with_history(history))
}

async fn run_docs(cli: &Cli, cmd: &RunCommand) -> Result<bool> {
    let config = Arc::new(load_config(&cli.config, &cmd.var)?);
    println!("{} Loaded pipeline: {}", INFO, style(&config.name).bold());

    let history = open_history(cmd.no_history).await?;
    let dispatcher = build_dispatcher(config.clone(), history)?;

    let spinner = attach_reporter(dispatcher.engine().events());
    let event = cmd.event();
    let description = event.describe();
    let outcome = dispatcher.dispatch(event).await;
    spinner.finish_and_clear();

    match outcome? {
        Some(report) => {
            print_report(&config.name, &report);
            Ok(report.is_success())
        }
        None => {
            println!(
                "{} {} is not accepted by the triggers of {}; nothing to do",
                WARN,
                style(description).bold(),
                config.name
            );
            Ok(true)
        }
    }
}

fn print_report(name: &str, report: &RunReport) {
    let phases: Vec<String> = report.phases.iter().map(ToString::to_string).collect();
    println!("\n  Phases: {}", style(phases.join(" → ")).dim());
    if let Some(image) = &report.image {
        println!("  Image: {}", style(image).cyan());
    }
    if let Some(groups) = &report.groups {
        println!("  Groups: {}", style(groups).cyan());
    }
    if let Some(publish) = &report.publish {
        println!("  Deployed: {}", style(&publish.receipt.location).bold());
        println!("  Artifact: {}", style(&publish.artifact.digest).dim());
    }

    match (&report.error, report.failure()) {
        (Some(error), Some(kind)) => {
            println!(
                "\n{} {} {} ({} failure): {}",
                CROSS,
                style(name).bold(),
                style("failed").red(),
                kind,
                error
            );
        }
        _ => {
            println!("\n{} {} completed {}", CHECK, style(name).bold(), style("successfully").green());
        }
    }
}

async fn build_image(cli: &Cli, cmd: &ImageCommand) -> Result<bool> {
    let config = Arc::new(load_config(&cli.config, &cmd.var)?);
    println!("{} Building image for {}", PACKAGE, style(&config.name).bold());

    let history = open_history(cmd.no_history).await?;
    let dispatcher = build_dispatcher(config.clone(), history)?;

    let spinner = attach_reporter(dispatcher.engine().events());
    let outcome = dispatcher.build_image(Uuid::new_v4()).await;
    spinner.finish_and_clear();

    match outcome {
        Ok(report) => {
            println!(
                "\n{} Built {} (lock digest {})",
                CHECK,
                style(&report.image).bold(),
                style(report.lock.digest.short(12)).dim()
            );
            Ok(true)
        }
        Err(e) => {
            println!("\n{} Image build {} ({} failure): {}", CROSS, style("failed").red(), e.kind(), e);
            Ok(false)
        }
    }
}

fn validate_pipeline(cli: &Cli, cmd: &ValidateCommand) -> Result<bool> {
    println!("{} Validating {}...", INFO, cli.config.display());

    match PipelineConfig::from_file(&cli.config) {
        Ok(config) => {
            println!("{} Pipeline configuration is valid!", CHECK);
            println!("  Name: {}", style(&config.name).bold());
            println!("  Runtime: {}", style(config.runtime).cyan());
            println!("  Base image: {}", style(&config.image.base).cyan());
            println!(
                "  Native: {} {}",
                style(&config.image.native.name).cyan(),
                style(&config.image.native.version).dim()
            );
            println!("  Publish group: {}", style(&config.publish.concurrency.group).cyan());

            if cmd.json {
                let json = serde_json::to_string_pretty(&config)?;
                println!("\n{}", json);
            }
            Ok(true)
        }
        Err(e) => {
            println!("{} Validation failed:", CROSS);
            println!("  {}", style(format!("{:#}", e)).red());
            Ok(false)
        }
    }
}

fn print_plan(pipeline: &Pipeline) {
    for (index, id) in pipeline.execution_order().into_iter().enumerate() {
        let Some(step) = pipeline.step(id) else {
            continue;
        };
        let context = pipeline.create_context_for_step(id);
        let render = |template: &str| context.render(template).unwrap_or_else(|_| template.to_string());
        let detail = match &step.action {
            StepAction::Exec { script } => render(script),
            StepAction::CopyIn { from, to } => format!("copy {} -> {}", render(from), render(to)),
            action => action.describe(),
        };
        println!(
            "  {:>2}. {} {}",
            index + 1,
            style(&step.id).cyan(),
            style(format!("[{}]", step.failure_kind)).dim()
        );
        println!("      {}", detail);
    }
}

fn plan_pipeline(cli: &Cli, cmd: &PlanCommand) -> Result<bool> {
    let config = load_config(&cli.config, &cmd.var)?;

    println!("{} Image workflow ({})", PACKAGE, style(&config.image.base).dim());
    match LockState::read(&config.lock_file_path()) {
        Ok(lock) => {
            let pipeline = plan_image(&config, &lock, &|path| path.to_string())?;
            print_plan(&pipeline);
        }
        Err(e) => println!("  {} {}", WARN, e),
    }

    let enabled = match &cmd.docs_flag {
        Some(value) => parse_flag(value),
        None => docs_flag_enabled(&config, &|name| std::env::var(name).ok()),
    };
    let groups = doc_groups(&config, enabled);
    println!(
        "\n{} Docs workflow ({} = {}, groups {})",
        INFO,
        config.docs.flag.name,
        enabled,
        style(&groups).cyan()
    );
    let run = RunInfo {
        run_id: Uuid::nil(),
        revision: None,
        branch: None,
    };
    print_plan(&plan_docs(&config, &groups, &run, &config.image.workdir));

    println!(
        "\n{} Publish to {} under group `{}`",
        ROCKET,
        target_from_config(&config.publish.target, Arc::new(ShellRunner::new())).describe(),
        config.publish.concurrency.group
    );
    Ok(true)
}

async fn show_history(cmd: &HistoryCommand) -> Result<bool> {
    let store = open_history(false).await?;
    let runs = store
        .list_runs(None, cmd.workflow.map(Into::into), cmd.limit)
        .await?;

    if cmd.json {
        let data = serde_json::json!({ "runs": runs });
        println!("{}", serde_json::to_string_pretty(&data)?);
        return Ok(true);
    }

    if runs.is_empty() {
        println!("{} No runs found", INFO);
        return Ok(true);
    }

    println!("{} Run history (showing latest {}):", INFO, cmd.limit);
    for summary in &runs {
        println!("  {}", format_run_summary(summary));
        if let Some(error) = &summary.error {
            println!("      {}", style(error).dim());
        }
    }
    Ok(true)
}
