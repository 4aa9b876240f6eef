mod report_files;

use anyhow::{Context, Result};
use clap::Parser;
use dispatch_core::{
    read_lines, CallExecutor, ClosurePolicy, Config, Dispatcher, ErrorKind, HttpJsonExecutor,
    JsonDirSink, MockExecutor, RunSummary, TaskSource,
};
use report_files::FileReportHook;
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;
use tracing::{info, warn};

#[derive(Parser, Debug)]
#[command(name = "batch-runner")]
#[command(about = "Sends a batch of prompts to a chat or image API under concurrency, rate and time limits")]
struct Args {
    /// Path to configuration file
    #[arg(long, default_value = "config/example.toml")]
    config: PathBuf,

    /// Call mode: mock or http
    #[arg(long, default_value = "http")]
    mode: String,

    /// API key (overrides config)
    #[arg(long, env = "DISPATCH_API_KEY", hide_env_values = true)]
    api_key: Option<String>,

    /// Total calls to make, cycling through the inputs (overrides config)
    #[arg(long)]
    target_total: Option<u64>,

    /// What to do with in-flight calls at the time limit: drain or hard_cutoff
    #[arg(long)]
    closure: Option<ClosurePolicy>,
}

#[tokio::main]
async fn main() -> Result<()> {
    // Initialize tracing
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new("info")),
        )
        .init();

    let args = Args::parse();

    let mut config = Config::from_file(&args.config)
        .with_context(|| format!("Failed to load config from {:?}", args.config))?;
    apply_overrides(&mut config, &args);
    config.validate().context("Invalid configuration after CLI overrides")?;

    info!("Starting batch in {} mode against {}", args.mode, config.target.url);
    info!("Model: {} ({:?})", config.target.model, config.target.kind);

    let source = build_source(&config)?;

    let executor: Arc<dyn CallExecutor<String>> = match args.mode.as_str() {
        "mock" => Arc::new(MockExecutor::new(Duration::from_millis(5))),
        "http" => {
            let mut executor = HttpJsonExecutor::from_config(&config.target, config.run.call_timeout())
                .context("Failed to create HTTP executor")?;
            if config.output.save_responses {
                let sink = JsonDirSink::new(&config.output.dir).with_context(|| {
                    format!("Failed to create output directory {:?}", config.output.dir)
                })?;
                info!("Saving responses to {:?}", sink.dir());
                executor = executor.with_sink(Arc::new(sink));
            }
            Arc::new(executor)
        }
        _ => anyhow::bail!("Invalid mode: {}, must be 'mock' or 'http'", args.mode),
    };

    info!("Using executor: {}", executor.name());

    let hook = FileReportHook::new(&config.output.dir);
    let dispatcher = Dispatcher::new(config.run.clone(), config.shaping, executor)
        .with_hook(Arc::new(hook));

    let report = dispatcher.run(source).await.context("Batch run failed")?;

    info!("Results written to {:?}", config.output.dir);
    print_summary(&report.summary);
    if let Some(failures) = &report.failure_report {
        println!("{failures}");
    }

    Ok(())
}

fn apply_overrides(config: &mut Config, args: &Args) {
    if let Some(api_key) = &args.api_key {
        config.target.api_key = api_key.clone();
    }
    if let Some(total) = args.target_total {
        config.run.target_total = Some(total);
    }
    if let Some(closure) = args.closure {
        config.run.closure = closure;
    }
}

/// Questions file if configured, else the fixed prompt repeated.
fn build_source(config: &Config) -> Result<TaskSource<String>> {
    let target_total = config.run.target_total;

    if let Some(path) = &config.input.questions_path {
        let (questions, dedup) =
            read_lines(path).with_context(|| format!("Failed to read questions from {:?}", path))?;
        info!(
            "Loaded {} questions from {:?} ({} lines, {} blank, {} duplicates dropped)",
            dedup.unique, path, dedup.total_lines, dedup.blank_lines, dedup.duplicates
        );
        for repeated in &dedup.repeated {
            warn!("Duplicate question dropped: {}", repeated);
        }
        if questions.is_empty() {
            anyhow::bail!("Questions file has no usable lines: {:?}", path);
        }

        return Ok(match target_total {
            Some(total) => TaskSource::cycling(questions, total),
            None => TaskSource::single_pass(questions),
        });
    }

    if let Some(prompt) = &config.input.fixed_prompt {
        let total = target_total.context("run.target_total is required with input.fixed_prompt")?;
        return Ok(TaskSource::repeated(prompt.clone(), total));
    }

    anyhow::bail!("No input configured, set input.questions_path or input.fixed_prompt")
}

fn print_summary(summary: &RunSummary) {
    println!("\n=== Results Summary ===");
    println!("Planned: {}", summary.planned);
    println!("Submitted: {}", summary.submitted);
    println!("Processed: {}", summary.processed);
    println!("Successful: {}", summary.successful);
    println!("Failed: {}", summary.failed);
    for kind in ErrorKind::FAILURES {
        println!("  {}: {}", kind, summary.errors.get(kind));
    }
    println!("Mean call time: {:.2}ms", summary.mean_elapsed_ms);
    println!("Max call time: {}ms", summary.max_elapsed_ms);
    println!("Latency p50: {}ms", summary.latency_p50_ms);
    println!("Latency p95: {}ms", summary.latency_p95_ms);
    println!("Latency p99: {}ms", summary.latency_p99_ms);
    println!("Wall clock: {}ms", summary.wall_clock_ms);
    println!("Throughput: {:.2}/s", summary.throughput_per_sec);
    println!("Time limit reached: {}", summary.time_limit_reached);
    println!();
}
