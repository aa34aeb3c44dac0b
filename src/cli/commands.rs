//! CLI command definitions for aria-forge.
//!
//! `run` starts a report run, `resume` answers a suspended run's question,
//! `capabilities` lists what the registry can invoke.

use std::path::{Path, PathBuf};
use std::sync::Arc;

use anyhow::Context;
use clap::Parser;
use futures::StreamExt;
use serde::Serialize;
use tracing::{info, warn};

use crate::llm::{LiteLlmClient, LlmProvider, DEFAULT_MODEL};
use crate::metrics::{export_metrics, init_metrics};
use crate::pipeline::{
    CheckpointStore, FileCheckpointStore, HumanCorrection, PipelineConfig, PipelineOrchestrator, PipelineState,
    RunEvent, RunOutcome, RunRequest, RunStatus, SourceDescriptor, SourceKind, SqliteCheckpointStore,
};
use crate::registry::CapabilityRegistry;
use crate::report::RenderedArtifact;
use crate::synthesis::{ProcessSandbox, SandboxConfig, ScriptLoader};
use crate::tools::{register_builtins, KeywordKnowledgeBase, KnowledgeBase};

/// Agent pipeline turning raw activity data into analysed reports.
#[derive(Parser)]
#[command(name = "aria-forge")]
#[command(about = "Turn raw activity data into analysed, rendered reports")]
#[command(version)]
#[command(
    long_about = "aria-forge reads activity data from files, databases, APIs and web pages, identifies the domain, \
                  runs a TRIZ analysis and renders the report as json, markdown, html, pdf and pptx.\n\n\
                  Example usage:\n  aria-forge run --source file:data/q3.csv --format markdown --format html"
)]
pub struct Cli {
    /// The subcommand to execute.
    #[command(subcommand)]
    pub command: Commands,

    /// Log level (trace, debug, info, warn, error).
    #[arg(short, long, default_value = "info", global = true)]
    pub log_level: String,

    /// YAML configuration file; ARIA_* environment variables override it.
    #[arg(short, long, global = true, env = "ARIA_CONFIG")]
    pub config: Option<PathBuf>,
}

/// Available CLI subcommands.
#[derive(clap::Subcommand)]
pub enum Commands {
    /// Start a new report run.
    Run(RunArgs),

    /// Answer the question of a run suspended for human confirmation.
    Resume(ResumeArgs),

    /// List registered capabilities, including synthesized ones.
    #[command(alias = "caps")]
    Capabilities(CapabilitiesArgs),
}

/// LLM connection options shared by commands that call the oracle.
#[derive(clap::Args, Debug, Clone)]
pub struct LlmArgs {
    /// Model to use; defaults to ARIA_MODEL or the client default.
    #[arg(short = 'm', long)]
    pub model: Option<String>,

    /// OpenRouter API key. Without it, LITELLM_API_BASE must point at a proxy.
    #[arg(long, env = "OPENROUTER_API_KEY", hide_env_values = true)]
    pub api_key: Option<String>,
}

/// Arguments for `aria-forge run`.
#[derive(Parser, Debug)]
pub struct RunArgs {
    /// Source as KIND:LOCATION[#FORMAT], e.g. file:data/q3.csv or web:https://example.com.
    /// Repeat for several sources.
    #[arg(short = 's', long = "source", value_name = "SPEC")]
    pub sources: Vec<String>,

    /// JSON file holding a full run request (sources with metadata, formats, instruction).
    #[arg(long, conflicts_with = "sources")]
    pub request: Option<PathBuf>,

    /// Output format (json, markdown, html, pdf, pptx). Repeatable; defaults to all.
    #[arg(short = 'f', long = "format", value_name = "FORMAT")]
    pub formats: Vec<String>,

    /// Thread id for the run; generated when absent.
    #[arg(short = 't', long)]
    pub thread_id: Option<String>,

    /// Free-text instruction passed to the analyst.
    #[arg(short = 'i', long)]
    pub instruction: Option<String>,

    /// Print a line per completed stage.
    #[arg(long)]
    pub stream: bool,

    /// Print Prometheus metrics after the run.
    #[arg(long)]
    pub print_metrics: bool,

    /// Output JSON summary.
    #[arg(short = 'j', long)]
    pub json: bool,

    #[command(flatten)]
    pub llm: LlmArgs,
}

/// Arguments for `aria-forge resume`.
#[derive(Parser, Debug)]
pub struct ResumeArgs {
    /// Thread id printed when the run was suspended.
    #[arg(short = 't', long)]
    pub thread_id: String,

    /// Corrected domain; keeps the guess when absent.
    #[arg(long)]
    pub domain: Option<String>,

    /// Corrected reporting period.
    #[arg(long)]
    pub period: Option<String>,

    /// Corrected KPI list. Repeatable.
    #[arg(long = "kpi", value_name = "KPI")]
    pub kpis: Vec<String>,

    /// Output JSON summary.
    #[arg(short = 'j', long)]
    pub json: bool,

    #[command(flatten)]
    pub llm: LlmArgs,
}

/// Arguments for `aria-forge capabilities`.
#[derive(Parser, Debug)]
pub struct CapabilitiesArgs {
    /// Output JSON.
    #[arg(short = 'j', long)]
    pub json: bool,
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
    let config = load_config(cli.config.as_deref())?;
    match cli.command {
        Commands::Run(args) => run_run_command(config, args).await,
        Commands::Resume(args) => run_resume_command(config, args).await,
        Commands::Capabilities(args) => run_capabilities_command(config, args).await,
    }
}

fn load_config(path: Option<&Path>) -> anyhow::Result<PipelineConfig> {
    let config = match path {
        Some(path) => PipelineConfig::from_yaml_file(path)
            .with_context(|| format!("failed to load config from {}", path.display()))?,
        None => PipelineConfig::from_env()?,
    };
    Ok(config)
}

/// Parse `KIND:LOCATION[#FORMAT]`.
pub fn parse_source_spec(spec: &str, index: usize) -> anyhow::Result<SourceDescriptor> {
    let (kind, rest) = spec
        .split_once(':')
        .ok_or_else(|| anyhow::anyhow!("source '{}' must look like KIND:LOCATION[#FORMAT]", spec))?;
    let kind: SourceKind = kind.parse().map_err(|e: String| anyhow::anyhow!(e))?;

    let (location, format) = match rest.rsplit_once('#') {
        Some((location, format))
            if !format.is_empty() && format.chars().all(|c| c.is_ascii_alphanumeric() || c == '_') =>
        {
            (location, Some(format))
        }
        _ => (rest, None),
    };
    if location.trim().is_empty() {
        anyhow::bail!("source '{}' has an empty location", spec);
    }

    let mut source = SourceDescriptor::new(format!("source_{}", index + 1), kind, location.trim());
    if let Some(format) = format {
        source = source.with_format(format);
    }
    Ok(source)
}

fn build_request(args: &RunArgs) -> anyhow::Result<RunRequest> {
    let mut request = match &args.request {
        Some(path) => {
            let text = std::fs::read_to_string(path)
                .with_context(|| format!("failed to read request {}", path.display()))?;
            serde_json::from_str::<RunRequest>(&text)
                .with_context(|| format!("invalid run request in {}", path.display()))?
        }
        None => {
            let sources = args
                .sources
                .iter()
                .enumerate()
                .map(|(i, spec)| parse_source_spec(spec, i))
                .collect::<anyhow::Result<Vec<_>>>()?;
            RunRequest::new(sources)
        }
    };
    if request.sources.is_empty() {
        anyhow::bail!("at least one --source (or a --request file) is required");
    }
    if !args.formats.is_empty() {
        request = request.with_formats(args.formats.iter().map(|f| f.trim().to_lowercase()));
    }
    if let Some(thread_id) = &args.thread_id {
        request = request.with_thread_id(thread_id.clone());
    }
    if let Some(instruction) = &args.instruction {
        request = request.with_instruction(instruction.clone());
    }
    Ok(request)
}

fn llm_provider(config: &PipelineConfig, args: &LlmArgs) -> anyhow::Result<Arc<dyn LlmProvider>> {
    let model = args
        .model
        .clone()
        .or_else(|| (!config.model.is_empty()).then(|| config.model.clone()));

    let client = match &args.api_key {
        Some(key) => {
            let model = model.unwrap_or_else(|| DEFAULT_MODEL.to_string());
            info!(model = %model, "Using OpenRouter");
            LiteLlmClient::openrouter(key.clone(), model)
        }
        None => {
            let client = LiteLlmClient::from_env().map_err(|e| {
                anyhow::anyhow!(
                    "{}.\nProvide --api-key <KEY>, set OPENROUTER_API_KEY, or set LITELLM_API_BASE.",
                    e
                )
            })?;
            info!(api_base = %client.api_base(), model = %client.default_model(), "Using LiteLLM proxy");
            client
        }
    };
    Ok(Arc::new(client.with_request_timeout(config.oracle_timeout)))
}

async fn checkpoint_store(config: &PipelineConfig) -> anyhow::Result<Arc<dyn CheckpointStore>> {
    match &config.checkpoint_database_url {
        Some(url) => {
            let store = SqliteCheckpointStore::connect(url)
                .await
                .with_context(|| format!("failed to open checkpoint database {}", url))?;
            Ok(Arc::new(store))
        }
        None => Ok(Arc::new(FileCheckpointStore::new(config.checkpoint_dir.clone()))),
    }
}

async fn build_orchestrator(config: PipelineConfig, llm: &LlmArgs) -> anyhow::Result<PipelineOrchestrator> {
    let mut builder = PipelineOrchestrator::builder(config.clone())
        .checkpoints(checkpoint_store(&config).await?)
        .provider(llm_provider(&config, llm)?);

    if let Some(dir) = &config.knowledge_dir {
        let knowledge = KeywordKnowledgeBase::load_dir(dir)
            .with_context(|| format!("failed to load knowledge base from {}", dir.display()))?;
        info!(documents = knowledge.len(), dir = %dir.display(), "Loaded knowledge base");
        builder = builder.knowledge(Arc::new(knowledge) as Arc<dyn KnowledgeBase>);
    }

    let orchestrator = builder.build()?;
    if config.capability_dir.exists() {
        let report = orchestrator.reload_capabilities()?;
        for (name, reason) in &report.skipped {
            warn!(capability = %name, reason = %reason, "Skipped synthesized capability");
        }
    }
    Ok(orchestrator)
}

// ============================================================================
// run
// ============================================================================

async fn run_run_command(config: PipelineConfig, args: RunArgs) -> anyhow::Result<()> {
    if args.print_metrics {
        init_metrics()?;
    }
    let request = build_request(&args)?;
    let orchestrator = build_orchestrator(config, &args.llm).await?;

    let outcome = if args.stream {
        let mut events = Box::pin(orchestrator.start_run_streaming(request));
        let mut finished = None;
        while let Some(event) = events.next().await {
            match event? {
                RunEvent::Stage(update) => {
                    if !args.json {
                        println!(
                            "  [{}] {} ({:?}) changed: {}",
                            update.iteration,
                            update.stage,
                            update.status,
                            update.changes.join(", ")
                        );
                    }
                }
                RunEvent::Finished(outcome) => finished = Some(outcome),
            }
        }
        finished.ok_or_else(|| anyhow::anyhow!("run stream ended without an outcome"))?
    } else {
        orchestrator.start_run(request).await?
    };

    print_outcome(&outcome, args.json)?;
    if args.print_metrics {
        println!("{}", export_metrics());
    }
    Ok(())
}

// ============================================================================
// resume
// ============================================================================

async fn run_resume_command(config: PipelineConfig, args: ResumeArgs) -> anyhow::Result<()> {
    let orchestrator = build_orchestrator(config, &args.llm).await?;
    let correction = HumanCorrection {
        domain: args.domain.clone(),
        reporting_period: args.period.clone(),
        kpis: (!args.kpis.is_empty()).then(|| args.kpis.clone()),
    };
    let outcome = orchestrator.resume_run(&args.thread_id, correction).await?;
    print_outcome(&outcome, args.json)
}

// ============================================================================
// capabilities
// ============================================================================

async fn run_capabilities_command(config: PipelineConfig, args: CapabilitiesArgs) -> anyhow::Result<()> {
    let registry = CapabilityRegistry::new();
    register_builtins(&registry)?;
    if config.capability_dir.exists() {
        let sandbox = Arc::new(ProcessSandbox::new(
            SandboxConfig::default()
                .with_interpreter(config.sandbox_interpreter.clone())
                .with_timeout(config.sandbox_timeout),
        ));
        let report = registry.reload(&config.capability_dir, &ScriptLoader::new(sandbox))?;
        for (name, reason) in &report.skipped {
            warn!(capability = %name, reason = %reason, "Skipped synthesized capability");
        }
    }
    let capabilities = registry.describe();

    if args.json {
        println!("{}", serde_json::to_string_pretty(&capabilities)?);
        return Ok(());
    }
    println!("{} capabilities registered", capabilities.len());
    for capability in capabilities {
        println!(
            "  {:<28} {:<10} {}",
            capability.name,
            capability.kind.to_string(),
            capability.description
        );
    }
    Ok(())
}

// ============================================================================
// Output
// ============================================================================

#[derive(Serialize)]
struct RunSummary<'a> {
    thread_id: &'a str,
    status: String,
    domain: &'a str,
    reporting_period: &'a str,
    iterations: u32,
    confidence_score: f64,
    degraded: bool,
    path: Vec<String>,
    errors: &'a [String],
    artifacts: Vec<(String, String)>,
    #[serde(skip_serializing_if = "Option::is_none")]
    question: Option<&'a str>,
}

fn summarize<'a>(state: &'a PipelineState, question: Option<&'a str>) -> RunSummary<'a> {
    RunSummary {
        thread_id: &state.thread_id,
        status: state.status.to_string(),
        domain: &state.domain,
        reporting_period: &state.reporting_period,
        iterations: state.iteration,
        confidence_score: state.confidence_score,
        degraded: state.degraded_report,
        path: state.path().iter().map(|s| s.to_string()).collect(),
        errors: &state.errors,
        artifacts: state
            .artifacts
            .iter()
            .map(|(format, artifact)| (format.clone(), describe_artifact(artifact)))
            .collect(),
        question,
    }
}

fn describe_artifact(artifact: &RenderedArtifact) -> String {
    match artifact {
        RenderedArtifact::File(path) => path.display().to_string(),
        RenderedArtifact::Inline(text) => format!("inline, {} chars", text.chars().count()),
    }
}

fn print_outcome(outcome: &RunOutcome, json: bool) -> anyhow::Result<()> {
    let question = outcome.prompt().map(|p| p.question.as_str());
    let summary = summarize(outcome.state(), question);

    if json {
        let json_output = serde_json::to_string_pretty(&summary)
            .map_err(|e| anyhow::anyhow!("Failed to serialize JSON output: {}", e))?;
        println!("{}", json_output);
        return Ok(());
    }

    match outcome {
        RunOutcome::Suspended { prompt, .. } => {
            println!("? Run {} needs confirmation", prompt.thread_id);
            println!("  {}", prompt.question);
            println!(
                "  Resume with: aria-forge resume --thread-id {} [--domain ..] [--period ..] [--kpi ..]",
                prompt.thread_id
            );
        }
        RunOutcome::Completed(state) => {
            let mark = if state.status == RunStatus::Done { "✓" } else { "✗" };
            println!("{} Run {} finished: {}", mark, state.thread_id, state.status);
            println!("  Domain: {} ({})", state.domain, state.reporting_period);
            println!(
                "  Iterations: {}, confidence: {:.0}%{}",
                state.iteration,
                state.confidence_score * 100.0,
                if state.degraded_report { " (degraded)" } else { "" }
            );
            println!("  Path: {}", summary.path.join(" -> "));
            for (format, location) in &summary.artifacts {
                println!("  {:<9} {}", format, location);
            }
            if !state.errors.is_empty() {
                println!("  {} errors:", state.errors.len());
                for error in &state.errors {
                    println!("    - {}", error);
                }
            }
        }
    }
    Ok(())
}
