use std::io::{self, Read};
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;

use anyhow::{Context, Result};
use clap::{Parser, Subcommand};
use tokio_util::sync::CancellationToken;
use tracing::warn;
use tracing_subscriber::EnvFilter;

use weft_backend::{Backends, ContainerBackend, LocalProcessBackend, LocalStager, StageMode};
use weft_config::{Settings, StageModeSetting};
use weft_engine::{Engine, RunResult, SubmitOptions};
use weft_graph::JsonLoader;

/// Weft - run workflows of command-line steps
#[derive(Parser)]
#[command(name = "weft")]
#[command(version, about, long_about = None)]
struct Cli {
  /// Path to the data directory (default: ~/.weft)
  #[arg(long, global = true)]
  data_dir: Option<PathBuf>,

  #[command(subcommand)]
  command: Option<Commands>,
}

#[derive(Subcommand)]
enum Commands {
  /// Run a workflow graph to completion
  Run(RunArgs),
}

#[derive(clap::Args)]
struct RunArgs {
  /// Path to the workflow graph (JSON)
  graph_file: PathBuf,

  /// Workflow inputs as a JSON object; read from stdin when omitted
  #[arg(long)]
  inputs: Option<String>,

  /// Maximum number of jobs running at once
  #[arg(long)]
  max_concurrency: Option<usize>,

  /// Cancel everything on the first failed job
  #[arg(long)]
  fail_fast: bool,

  #[arg(long)]
  cache_dir: Option<PathBuf>,

  /// Per-job timeout in milliseconds
  #[arg(long)]
  timeout_ms: Option<u64>,

  /// Keep working directories of successful jobs
  #[arg(long)]
  retain_workdirs: bool,
}

fn main() -> Result<()> {
  let cli = Cli::parse();

  tracing_subscriber::fmt()
    .with_env_filter(EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")))
    .with_writer(io::stderr)
    .init();

  let data_dir = match cli.data_dir {
    Some(dir) => dir,
    None => dirs::home_dir()
      .context("could not determine home directory")?
      .join(".weft"),
  };

  match cli.command {
    Some(Commands::Run(args)) => {
      let rt = tokio::runtime::Runtime::new()?;
      let code = rt.block_on(run(args, &data_dir))?;
      std::process::exit(code);
    }
    None => {
      println!("weft - use --help to see available commands");
    }
  }

  Ok(())
}

async fn run(args: RunArgs, data_dir: &Path) -> Result<i32> {
  let settings = Settings::load(data_dir).await;

  let graph = match JsonLoader.load_file(&args.graph_file) {
    Ok(graph) => graph,
    Err(e) => {
      eprintln!("Rejected workflow {}: {}", args.graph_file.display(), e);
      println!(
        "{}",
        serde_json::to_string_pretty(&serde_json::json!({ "graph_error": e }))?
      );
      return Ok(2);
    }
  };
  eprintln!("Loaded workflow: {} ({} steps)", graph.name, graph.steps.len());

  let inputs = match &args.inputs {
    Some(text) => serde_json::from_str(text).context("failed to parse --inputs JSON")?,
    None => read_inputs_from_stdin()?,
  };
  let inputs = match inputs {
    serde_json::Value::Object(map) => map,
    other => anyhow::bail!("workflow inputs must be a JSON object, got {}", other),
  };

  let options = SubmitOptions {
    max_concurrency: args
      .max_concurrency
      .unwrap_or(settings.run.max_concurrency),
    fail_fast: args.fail_fast || settings.run.fail_fast,
    cache_dir: args
      .cache_dir
      .clone()
      .unwrap_or_else(|| settings.cache_dir(data_dir)),
    work_dir: settings.work_dir(data_dir),
    timeout_per_job: args
      .timeout_ms
      .or(settings.run.timeout_ms)
      .map(Duration::from_millis),
    debug_retain_workdirs: args.retain_workdirs || settings.run.retain_workdirs,
    cancel_grace_period: Duration::from_millis(settings.run.cancel_grace_ms),
  };

  let grace = options.cancel_grace_period;
  let stage_mode = match settings.backend.stage_mode {
    StageModeSetting::Symlink => StageMode::Symlink,
    StageModeSetting::Copy => StageMode::Copy,
  };
  let engine = Engine::new(Backends::new(
    Arc::new(LocalProcessBackend::new(grace)),
    Arc::new(ContainerBackend::new(
      settings.backend.container_runtime.clone(),
      grace,
    )),
  ))
  .with_stager(Arc::new(LocalStager::new(
    options.work_dir.join("staging"),
    stage_mode,
  )));

  let cancel = CancellationToken::new();
  let on_interrupt = cancel.clone();
  tokio::spawn(async move {
    if tokio::signal::ctrl_c().await.is_ok() {
      warn!("interrupt received, cancelling run");
      on_interrupt.cancel();
    }
  });

  let result = engine
    .submit_with_cancel(Arc::new(graph), inputs, options, cancel)
    .await;
  report(&result);
  println!("{}", serde_json::to_string_pretty(&result)?);

  Ok(result.exit_code())
}

fn report(result: &RunResult) {
  eprintln!(
    "Run {} finished: {} jobs, {} failed, exit {}",
    result.run_id,
    result.jobs.len(),
    result.failures.len(),
    result.exit_code()
  );
  for failure in &result.failures {
    eprintln!("  {} failed: {}", failure.job_id, failure.error);
    if let Some(stderr) = &failure.stderr_ref {
      eprintln!("    stderr: {}", stderr.display());
    }
  }
  for output in &result.unresolved_outputs {
    eprintln!("  required output '{}' is unresolved", output);
  }
}

fn read_inputs_from_stdin() -> Result<serde_json::Value> {
  use std::io::IsTerminal;

  if io::stdin().is_terminal() {
    return Ok(serde_json::json!({}));
  }

  let mut input = String::new();
  io::stdin()
    .read_to_string(&mut input)
    .context("failed to read inputs from stdin")?;

  if input.trim().is_empty() {
    Ok(serde_json::json!({}))
  } else {
    serde_json::from_str(&input).context("failed to parse inputs JSON from stdin")
  }
}
