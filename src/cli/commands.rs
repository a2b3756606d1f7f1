//! CLI command definitions for fusionn-subs.
//!
//! `run` is the long-lived worker. `models` and `enqueue` are operator
//! helpers for inspecting the model catalog and feeding the queue by hand.

use std::path::{Path, PathBuf};
use std::sync::Arc;

use anyhow::{bail, Context};
use clap::Parser;
use tokio::sync::broadcast;
use tracing::{error, info, warn};

use crate::callback::CallbackClient;
use crate::config::{Config, DEFAULT_CONFIG_PATH};
use crate::error::WorkerError;
use crate::job::JobMessage;
use crate::llm::{CandidateModel, GeminiClient, ModelCatalog, OpenRouterCatalog};
use crate::selection::{GeminiEvaluator, ModelSelector, SelectorConfig};
use crate::translator::{OpenRouterTranslator, TranslationProvider};
use crate::worker::{RedisQueue, Worker};

/// Subtitle translation queue worker.
#[derive(Parser)]
#[command(name = "fusionn-subs")]
#[command(about = "Translate subtitle files pulled from a Redis queue")]
#[command(version)]
pub struct Cli {
    /// The subcommand to execute.
    #[command(subcommand)]
    pub command: Commands,

    /// Log level (trace, debug, info, warn, error).
    #[arg(short, long, default_value = "info", env = "LOG_LEVEL", global = true)]
    pub log_level: String,

    /// Path to the YAML config file.
    #[arg(short, long, default_value = DEFAULT_CONFIG_PATH, env = "CONFIG_PATH", global = true)]
    pub config: PathBuf,
}

/// Available CLI subcommands.
#[derive(clap::Subcommand)]
pub enum Commands {
    /// Consume translation jobs until interrupted.
    Run,

    /// List models from the OpenRouter catalog.
    Models(ModelsArgs),

    /// Push a translation job onto the queue.
    Enqueue(EnqueueArgs),
}

/// Arguments for `fusionn-subs models`.
#[derive(Parser, Debug)]
pub struct ModelsArgs {
    /// Include paid models.
    #[arg(long)]
    pub all: bool,

    /// Ask the evaluator to pick the best free model.
    #[arg(long)]
    pub evaluate: bool,
}

/// Arguments for `fusionn-subs enqueue`.
#[derive(Parser, Debug)]
pub struct EnqueueArgs {
    /// Subtitle file to translate.
    #[arg(short, long)]
    pub path: String,

    /// Video the subtitle belongs to.
    #[arg(long, default_value = "")]
    pub video_path: String,

    /// Plot overview given to the translator as context.
    #[arg(long, default_value = "")]
    pub overview: String,
}

/// Parse CLI arguments.
pub fn parse_cli() -> Cli {
    Cli::parse()
}

/// Run the CLI by parsing arguments and executing the command.
pub async fn run() -> anyhow::Result<()> {
    run_with_cli(parse_cli()).await
}

/// Run the CLI with the parsed arguments.
pub async fn run_with_cli(cli: Cli) -> anyhow::Result<()> {
    match cli.command {
        Commands::Run => run_worker_command(&cli.config).await,
        Commands::Models(args) => run_models_command(&cli.config, args).await,
        Commands::Enqueue(args) => run_enqueue_command(&cli.config, args).await,
    }
}

/// Loads the file and environment overrides without validating.
fn load_unvalidated(path: &Path) -> anyhow::Result<Config> {
    let mut config = Config::from_file(path)?;
    config.apply_overrides(|key| std::env::var(key).ok())?;
    Ok(config)
}

// ============================================================================
// run
// ============================================================================

async fn run_worker_command(config_path: &Path) -> anyhow::Result<()> {
    let config = Config::load(config_path)
        .with_context(|| format!("Failed to load config from {}", config_path.display()))?;

    for (key, value) in config.safe_log_values() {
        info!(key, value = %value, "Config");
    }

    let provider = Arc::new(TranslationProvider::from_config(&config)?);
    info!(
        provider = provider.name(),
        model = %provider.current_model(),
        "Translation provider ready"
    );

    let queue = RedisQueue::connect(&config.redis.url, &config.redis.queue)
        .await
        .context("Failed to connect to Redis")?;
    queue.ping().await.context("Redis did not answer PING")?;
    info!(queue = %config.redis.queue, "Connected to Redis");

    let notifier = CallbackClient::from_config(&config.callback)?;

    let selector = match provider.retargetable() {
        Some(translator) if config.auto_select_enabled() => {
            Some(start_model_selection(&config, translator).await?)
        }
        Some(_) => {
            info!(model = %provider.current_model(), "Automatic model selection disabled");
            None
        }
        None => None,
    };

    let (shutdown_tx, shutdown_rx) = broadcast::channel(1);
    tokio::spawn(async move {
        wait_for_signal().await;
        info!("Shutdown signal received");
        let _ = shutdown_tx.send(());
    });

    let worker = Worker::new(Arc::new(queue), provider, Arc::new(notifier))
        .with_settings(&config.worker);

    let result = worker.run(shutdown_rx).await;

    if let Some(selector) = selector {
        selector.stop().await;
    }

    match result {
        Ok(()) | Err(WorkerError::Cancelled) => {
            info!("Worker shut down cleanly");
            Ok(())
        }
        Err(e) => Err(e.into()),
    }
}

/// Builds the selector, wires it to the translator and runs the first evaluation.
async fn start_model_selection(
    config: &Config,
    translator: Arc<OpenRouterTranslator>,
) -> anyhow::Result<ModelSelector> {
    let selector = build_selector(config)?;

    let target = Arc::clone(&translator);
    selector.on_model_update(move |model| target.update_model(model));

    selector.start().await?;
    translator.update_model(&selector.current_model());
    info!(model = %translator.model(), "Automatic model selection enabled");

    Ok(selector)
}

fn build_selector(config: &Config) -> anyhow::Result<ModelSelector> {
    let catalog = OpenRouterCatalog::new(config.openrouter.api_key.clone())?
        .with_base_url(config.openrouter.base_url.clone());

    let evaluator_config = &config.openrouter.evaluator;
    let client = GeminiClient::new(config.evaluator_api_key(), evaluator_config.model.clone())?
        .with_base_url(evaluator_config.base_url.clone());
    let evaluator = GeminiEvaluator::new(client)
        .with_target_language(config.translator.target_language.clone());

    Ok(ModelSelector::new(
        SelectorConfig::from_config(config),
        Arc::new(catalog),
        Arc::new(evaluator),
    )?)
}

#[cfg(unix)]
async fn wait_for_signal() {
    use tokio::signal::unix::{signal, SignalKind};

    let mut terminate = match signal(SignalKind::terminate()) {
        Ok(stream) => stream,
        Err(e) => {
            warn!(error = %e, "Failed to install SIGTERM handler, listening for Ctrl+C only");
            let _ = tokio::signal::ctrl_c().await;
            return;
        }
    };

    tokio::select! {
        _ = tokio::signal::ctrl_c() => {}
        _ = terminate.recv() => {}
    }
}

#[cfg(not(unix))]
async fn wait_for_signal() {
    if let Err(e) = tokio::signal::ctrl_c().await {
        error!(error = %e, "Failed to listen for Ctrl+C");
    }
}

// ============================================================================
// models
// ============================================================================

async fn run_models_command(config_path: &Path, args: ModelsArgs) -> anyhow::Result<()> {
    let config = load_unvalidated(config_path)?;
    if config.openrouter.api_key.is_empty() {
        bail!("openrouter.api_key (or OPENROUTER_API_KEY) is required to list models");
    }

    let catalog = OpenRouterCatalog::new(config.openrouter.api_key.clone())?
        .with_base_url(config.openrouter.base_url.clone());

    let models = if args.all {
        catalog.list_models().await?
    } else {
        catalog.free_models().await?
    };

    println!("{}", format_model_table(&models));
    println!("{} model(s)", models.len());

    if args.evaluate {
        if config.evaluator_api_key().is_empty() {
            bail!("an evaluator key (openrouter.evaluator.gemini_api_key or GEMINI_API_KEY) is required");
        }
        if config.openrouter.fallback_model.is_empty() {
            bail!("openrouter.fallback_model is required to run an evaluation");
        }
        let selector = build_selector(&config)?;

        match selector.evaluate_now().await {
            Ok(model) => println!("\nSelected model: {model}"),
            Err(e) => {
                error!(error = %e, "Evaluation failed");
                return Err(e.into());
            }
        }
    }

    Ok(())
}

/// Renders models as a fixed-width table.
fn format_model_table(models: &[CandidateModel]) -> String {
    let id_width = models
        .iter()
        .map(|m| m.id.len())
        .max()
        .unwrap_or(0)
        .max("ID".len());

    let mut lines = vec![format!("{:<id_width$}  {:>10}  {:<4}  NAME", "ID", "CONTEXT", "FREE")];
    for model in models {
        let context = model
            .context_length
            .map_or_else(|| "-".to_string(), |c| c.to_string());
        let free = if model.is_free() { "yes" } else { "no" };
        lines.push(format!(
            "{:<id_width$}  {:>10}  {:<4}  {}",
            model.id, context, free, model.name
        ));
    }
    lines.join("\n")
}

// ============================================================================
// enqueue
// ============================================================================

async fn run_enqueue_command(config_path: &Path, args: EnqueueArgs) -> anyhow::Result<()> {
    let config = load_unvalidated(config_path)?;

    let mut job = JobMessage::new(args.path)
        .with_video_path(args.video_path)
        .with_overview(args.overview);
    job.validate()?;
    job.file_name = Path::new(&job.path)
        .file_name()
        .map(|name| name.to_string_lossy().into_owned())
        .unwrap_or_default();

    let queue = RedisQueue::connect(&config.redis.url, &config.redis.queue)
        .await
        .context("Failed to connect to Redis")?;
    queue.push(&job).await?;
    let pending = queue.pending().await?;

    info!(queue = %queue.queue_name(), path = %job.path, pending, "Job enqueued");
    println!("Enqueued {} ({} pending)", job.path, pending);
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_cli_parses_run_with_globals() {
        let cli = Cli::try_parse_from(["fusionn-subs", "run", "--config", "/etc/subs.yaml", "-l", "debug"])
            .expect("parses");
        assert!(matches!(cli.command, Commands::Run));
        assert_eq!(cli.config, PathBuf::from("/etc/subs.yaml"));
        assert_eq!(cli.log_level, "debug");
    }

    #[test]
    fn test_cli_parses_models_flags() {
        let cli = Cli::try_parse_from(["fusionn-subs", "models", "--all", "--evaluate"]).expect("parses");
        match cli.command {
            Commands::Models(args) => {
                assert!(args.all);
                assert!(args.evaluate);
            }
            _ => panic!("expected models command"),
        }
    }

    #[test]
    fn test_cli_enqueue_requires_path() {
        assert!(Cli::try_parse_from(["fusionn-subs", "enqueue"]).is_err());

        let cli = Cli::try_parse_from(["fusionn-subs", "enqueue", "--path", "/m/a.eng.srt", "--video-path", "/m/a.mkv"])
            .expect("parses");
        match cli.command {
            Commands::Enqueue(args) => {
                assert_eq!(args.path, "/m/a.eng.srt");
                assert_eq!(args.video_path, "/m/a.mkv");
                assert!(args.overview.is_empty());
            }
            _ => panic!("expected enqueue command"),
        }
    }

    #[test]
    fn test_format_model_table() {
        let models = vec![
            CandidateModel::new("google/gemma-3-27b-it:free")
                .with_name("Gemma 3 27B")
                .with_context_length(96000),
            CandidateModel::new("openai/gpt-4o").with_pricing("0.0000025", "0.00001"),
        ];

        let table = format_model_table(&models);
        let lines: Vec<_> = table.lines().collect();

        assert_eq!(lines.len(), 3);
        assert!(lines[0].starts_with("ID"));
        assert!(lines[1].contains("96000") && lines[1].contains("yes"));
        assert!(lines[2].contains("no"));
    }
}
