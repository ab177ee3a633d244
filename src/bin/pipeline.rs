// Pipeline step runner
// Runs one pipeline step against OpenAI (or fallbacks only) and prints the result as JSON.

use std::path::PathBuf;
use std::time::Duration;

use clap::Parser;
use serde_json::{json, Value};
use tower_llm_pipeline::{
    config, Client, EngineConfig, PipelineEngine, StepType,
};

#[derive(Parser)]
#[command(name = "pipeline")]
#[command(about = "Run one LLM pipeline step through the reliability shell")]
#[command(version)]
struct Args {
    /// Step type, e.g. goal_decomposition or task_generation
    step: String,

    /// Step input as a JSON document
    #[arg(short, long, default_value = "{}")]
    input: String,

    /// Read step input from a JSON file instead of --input
    #[arg(long, value_name = "FILE", conflicts_with = "input")]
    input_file: Option<PathBuf>,

    /// TOML engine configuration (defaults come from PIPELINE_* variables)
    #[arg(short, long, value_name = "FILE")]
    config: Option<PathBuf>,

    #[arg(long)]
    workspace: Option<String>,

    #[arg(long)]
    goal: Option<String>,

    /// Model override
    #[arg(short, long)]
    model: Option<String>,

    /// Custom user prompt replacing the step's template
    #[arg(long)]
    prompt: Option<String>,

    /// Per-call timeout in seconds (defaults to the configured value)
    #[arg(long)]
    timeout: Option<u64>,

    /// Retry budget (defaults to the configured value)
    #[arg(long)]
    max_retries: Option<u32>,

    /// Fail instead of returning a fallback payload
    #[arg(long)]
    no_fallback: bool,

    /// Do not call the model; return fallback payloads only
    #[arg(long)]
    offline: bool,

    /// Also print engine statistics
    #[arg(long)]
    show_stats: bool,
}

fn load_input(args: &Args) -> Result<Value, Box<dyn std::error::Error>> {
    let raw = match &args.input_file {
        Some(path) => std::fs::read_to_string(path)?,
        None => args.input.clone(),
    };
    Ok(serde_json::from_str(&raw)?)
}

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    tracing_subscriber::fmt()
        .with_env_filter(tracing_subscriber::EnvFilter::from_default_env())
        .with_target(true)
        .with_writer(std::io::stderr)
        .compact()
        .init();

    let args = Args::parse();

    let engine_config: EngineConfig = match &args.config {
        Some(path) => config::from_file(path)?,
        None => config::from_env(),
    };
    let input = load_input(&args)?;

    let mut builder = PipelineEngine::builder(engine_config);
    if !args.offline {
        builder = builder.openai(Client::new());
    }
    let engine = builder.build()?;

    let mut ctx = engine.context().fallback(!args.no_fallback);
    if let Some(secs) = args.timeout {
        ctx = ctx.timeout(Duration::from_secs(secs));
    }
    if let Some(retries) = args.max_retries {
        ctx = ctx.max_retries(retries);
    }
    ctx.workspace_id = args.workspace.clone();
    ctx.goal_id = args.goal.clone();

    let step: StepType = args.step.parse()?;
    let result = engine
        .execute_step(
            &step,
            &input,
            &mut ctx,
            args.prompt.as_deref(),
            args.model.as_deref(),
        )
        .await;

    let success = result.success;
    let mut output = json!({ "result": result });
    if args.show_stats {
        output["stats"] = serde_json::to_value(engine.stats())?;
    }
    println!("{}", serde_json::to_string_pretty(&output)?);

    if !success {
        std::process::exit(1);
    }
    Ok(())
}
