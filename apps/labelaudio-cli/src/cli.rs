use std::path::{Path, PathBuf};

use anyhow::Context;
use clap::{Args, Parser, Subcommand};
use tokio_util::sync::CancellationToken;

use labelaudio_config::{load_config, LabelAudioConfig};
use labelaudio_core::mapper::{map_analysis, normalize_analysis, AnalysisArtifacts, AnalysisResult, TaskType};
use labelaudio_core::types::Instruction;
use labelaudio_runtime::{init_tracing, LabelAudioApp};

const DEFAULT_CONFIG: &str = "configs/labelaudio.yaml";

#[derive(Debug, Parser)]
#[command(name = "labelaudio", about = "Turn audio analysis into labeling-platform annotations")]
pub struct Cli {
    #[command(subcommand)]
    command: Command,
}

#[derive(Debug, Subcommand)]
enum Command {
    /// Plan, execute, map and (when enabled) export one instruction
    Run(RunArgs),
    /// Print the plan an instruction would produce without running it
    Plan(PlanArgs),
    /// List discovered capabilities
    Capabilities(CommonArgs),
    /// Map an analysis file into an annotation record
    Map(MapArgs),
}

#[derive(Debug, Args, Clone)]
struct CommonArgs {
    #[arg(long, default_value = DEFAULT_CONFIG)]
    config: PathBuf,
    #[arg(long)]
    verbose: bool,
}

#[derive(Debug, Args, Clone)]
struct RunArgs {
    #[command(flatten)]
    common: CommonArgs,
    /// Audio URL, overriding one found in the instruction
    #[arg(long)]
    audio: Option<String>,
    #[arg(long)]
    task_type: Option<String>,
    /// Keep stored results after the run
    #[arg(long)]
    keep_results: bool,
    #[arg(value_name = "INSTRUCTION", required = true)]
    instruction: Vec<String>,
}

#[derive(Debug, Args, Clone)]
struct PlanArgs {
    #[command(flatten)]
    common: CommonArgs,
    #[arg(long)]
    audio: Option<String>,
    #[arg(value_name = "INSTRUCTION", required = true)]
    instruction: Vec<String>,
}

#[derive(Debug, Args, Clone)]
struct MapArgs {
    #[command(flatten)]
    common: CommonArgs,
    #[arg(long)]
    task_type: String,
    /// Treat the file as raw provider outputs (transcript, diarization, ...)
    #[arg(long)]
    raw: bool,
    /// Audio URL for raw input
    #[arg(long)]
    audio: Option<String>,
    #[arg(value_name = "ANALYSIS_JSON")]
    analysis: PathBuf,
}

impl Cli {
    pub async fn run(self) -> anyhow::Result<()> {
        match self.command {
            Command::Run(args) => run(args).await,
            Command::Plan(args) => plan(args).await,
            Command::Capabilities(args) => capabilities(args).await,
            Command::Map(args) => map(args).await,
        }
    }
}

fn load(common: &CommonArgs) -> anyhow::Result<LabelAudioConfig> {
    let mut config = if common.config.exists() || common.config != Path::new(DEFAULT_CONFIG) {
        load_config(&common.config)
            .with_context(|| format!("loading {}", common.config.display()))?
    } else {
        LabelAudioConfig::default()
    };
    if common.verbose {
        config.observability.log_level = "debug".to_string();
    }
    init_tracing(&config.observability);
    Ok(config)
}

fn instruction(words: &[String], audio: Option<&String>) -> Instruction {
    let mut instruction = Instruction::new(words.join(" "));
    if let Some(audio) = audio {
        instruction = instruction.with_hint("audio_url", audio.clone());
    }
    instruction
}

async fn run(args: RunArgs) -> anyhow::Result<()> {
    let mut config = load(&args.common)?;
    if args.keep_results {
        config.runtime.discard_after_run = false;
    }
    let app = LabelAudioApp::from_config(config).await?;
    let mut instruction = instruction(&args.instruction, args.audio.as_ref());
    if let Some(task_type) = &args.task_type {
        let task_type: TaskType = task_type.parse()?;
        instruction = instruction.with_hint("task_type", task_type.as_str());
    }

    let cancel = CancellationToken::new();
    let on_interrupt = cancel.clone();
    tokio::spawn(async move {
        if tokio::signal::ctrl_c().await.is_ok() {
            tracing::warn!("interrupt received, cancelling run");
            on_interrupt.cancel();
        }
    });

    let report = app.pipeline.run(&instruction, cancel).await?;
    println!("{}", serde_json::to_string_pretty(&report)?);
    if !report.result.is_success() {
        anyhow::bail!(
            "run {} finished {:?} with {} failed task(s)",
            report.run_id(),
            report.result.outcome,
            report.result.failures().len()
        );
    }
    if !report.is_complete() {
        let reason = report
            .record_error
            .as_deref()
            .or(report.export_error.as_deref())
            .unwrap_or("unknown");
        anyhow::bail!("run {} succeeded but did not complete: {}", report.run_id(), reason);
    }
    Ok(())
}

async fn plan(args: PlanArgs) -> anyhow::Result<()> {
    let config = load(&args.common)?;
    let app = LabelAudioApp::from_config(config).await?;
    let plan = app
        .pipeline
        .plan(&instruction(&args.instruction, args.audio.as_ref()))
        .await?;
    println!("{}", serde_json::to_string_pretty(&plan)?);
    Ok(())
}

async fn capabilities(args: CommonArgs) -> anyhow::Result<()> {
    let config = load(&args)?;
    let app = LabelAudioApp::from_config(config).await?;
    for descriptor in app.registry.list() {
        println!(
            "{:<24} {:<12} {:<18} {}",
            descriptor.name,
            descriptor.transport.provider,
            descriptor.produces.as_deref().unwrap_or("-"),
            descriptor.description
        );
    }
    Ok(())
}

async fn map(args: MapArgs) -> anyhow::Result<()> {
    load(&args.common)?;
    let task_type: TaskType = args.task_type.parse()?;
    let raw = tokio::fs::read_to_string(&args.analysis)
        .await
        .with_context(|| format!("reading {}", args.analysis.display()))?;
    let analysis = if args.raw {
        let artifacts: AnalysisArtifacts = serde_json::from_str(&raw)?;
        let audio = args
            .audio
            .as_deref()
            .context("--audio is required with --raw")?;
        normalize_analysis(audio, &artifacts)?
    } else {
        serde_json::from_str::<AnalysisResult>(&raw)?
    };
    let record = map_analysis(task_type, &analysis)?;
    let output = serde_json::json!({
        "label_config": record.label_config(),
        "task": record.to_import_task(),
        "record": record,
    });
    println!("{}", serde_json::to_string_pretty(&output)?);
    Ok(())
}
