use flowload::sink::{JsonLinesLogStore, LogStore, NoopLogStore, RealtimeSink};
use flowload::*;

use anyhow::Context;
use clap::{Parser, ValueEnum};
use console::style;
use indicatif::{ProgressBar, ProgressStyle};
use serde_json::{Map, Value};
use std::fs::File;
use std::io::BufRead;
use std::io::BufReader;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};
use tracing_subscriber::EnvFilter;

#[derive(Debug, Clone, Copy, ValueEnum)]
enum ThinkProfile {
    Fast,
    Human,
}

#[derive(Parser, Debug)]
#[command(author, version, about, long_about = None)]
struct Args {
    /// Path to the flow definition (JSON)
    flow_file: String,

    /// Path to the credentials file, one JSON object per line
    #[arg(short, long)]
    credentials: Option<String>,

    /// Path to a JSON object merged into every user's context
    #[arg(short, long)]
    input: Option<String>,

    /// Number of concurrent users
    #[arg(short = 'u', long, default_value_t = 1)]
    ccu: usize,

    /// Number of worker threads
    #[arg(short, long, default_value_t = 1)]
    threads: usize,

    /// Duration of the test in seconds
    #[arg(short, long, default_value_t = 30)]
    duration: u64,

    /// Seconds over which users are started
    #[arg(short, long, default_value_t = 0)]
    ramp_up: u64,

    /// Think time between two passes of the flow
    #[arg(long, value_enum, default_value_t = ThinkProfile::Fast)]
    think: ThinkProfile,

    /// Grace period after the deadline, in milliseconds
    #[arg(long)]
    grace: Option<u64>,

    /// Per-request timeout, in milliseconds
    #[arg(long)]
    timeout: Option<u64>,

    /// Path to engine settings (JSON)
    #[arg(long)]
    settings: Option<String>,

    /// Write every log record to this file, one JSON object per line
    #[arg(short, long)]
    output: Option<String>,
}

fn seconds_to_hms(seconds: u64) -> String {
    let hours = seconds / 3600;
    let minutes = (seconds % 3600) / 60;
    let seconds = seconds % 60;

    format!("{:02}:{:02}:{:02}", hours, minutes, seconds)
}

/// Live request counters on a spinner.
struct ProgressSink {
    pb: ProgressBar,
    total: String,
    started: Instant,
    requests: AtomicU64,
    errors: AtomicU64,
}

impl RealtimeSink for ProgressSink {
    fn emit_log(&self, _run_id: &str, logs: &[LogRecord]) {
        let errors = logs.iter().filter(|l| l.error.is_some()).count() as u64;
        let requests = self.requests.fetch_add(logs.len() as u64, Ordering::Relaxed) + logs.len() as u64;
        let errors = self.errors.fetch_add(errors, Ordering::Relaxed) + errors;
        let rps = requests as f64 / self.started.elapsed().as_secs_f64().max(1.0);
        self.pb.set_message(format!(
            "{} {requests} requests, {errors} errors, {rps:.1} req/s",
            self.total
        ));
    }

    fn emit_done(&self, _run_id: &str, message: &str) {
        self.pb.finish_with_message(message.to_string());
    }
}

fn read_json<T: serde::de::DeserializeOwned>(path: &str) -> anyhow::Result<T> {
    let reader = BufReader::new(File::open(path).with_context(|| format!("failed to open {path}"))?);
    serde_json::from_reader(reader).with_context(|| format!("failed to parse {path}"))
}

fn read_credentials(path: &str) -> anyhow::Result<Vec<Map<String, Value>>> {
    let reader = BufReader::new(File::open(path).with_context(|| format!("failed to open {path}"))?);

    let mut credentials = vec![];
    for (n, line) in reader.lines().enumerate() {
        let line = line?;
        if line.trim().is_empty() {
            continue;
        }
        credentials.push(
            serde_json::from_str(&line).with_context(|| format!("{path}:{}: invalid credential", n + 1))?,
        );
    }
    Ok(credentials)
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("warn")))
        .with_writer(std::io::stderr)
        .init();

    let args = Args::parse();

    let mut settings: EngineSettings = match &args.settings {
        Some(path) => read_json(path)?,
        None => EngineSettings::default(),
    };
    settings.think_time = match args.think {
        ThinkProfile::Fast => ThinkTime::FAST,
        ThinkProfile::Human => ThinkTime::HUMAN,
    };
    if let Some(grace) = args.grace {
        settings.grace_period_ms = grace;
    }
    if let Some(timeout) = args.timeout {
        settings.request_timeout_ms = timeout;
    }

    let flow: Flow = read_json(&args.flow_file)?;
    let config = RunConfig {
        ccu: args.ccu,
        threads: args.threads,
        duration: args.duration,
        ramp_up_time: args.ramp_up,
        input: match &args.input {
            Some(path) => read_json(path)?,
            None => Map::new(),
        },
        credentials: match &args.credentials {
            Some(path) => read_credentials(path)?,
            None => vec![],
        },
    };

    let store: Arc<dyn LogStore> = match &args.output {
        Some(path) => Arc::new(JsonLinesLogStore::create(path).await?),
        None => Arc::new(NoopLogStore),
    };

    let sty = ProgressStyle::with_template("{spinner} {elapsed_precise}/{msg}")?;
    let pb = ProgressBar::new_spinner();
    pb.set_style(sty);
    pb.enable_steady_tick(Duration::from_millis(100));
    let total = seconds_to_hms(config.duration.saturating_add(config.ramp_up_time));
    pb.set_message(total.clone());
    let sink = Arc::new(ProgressSink {
        pb,
        total,
        started: Instant::now(),
        requests: AtomicU64::new(0),
        errors: AtomicU64::new(0),
    });

    let coordinator = Coordinator::new(settings, store, sink);
    let handle = coordinator.run(flow, config)?;
    let report = handle.wait().await;

    let status = match report.status {
        RunStatus::Completed => style("COMPLETED").green().bold(),
        _ => style("FAILED").red().bold(),
    };
    let requests = report.total_requests();
    let errors = report.total_errors();
    let error_rate = if requests > 0 {
        errors as f64 / requests as f64 * 100.0
    } else {
        0.0
    };
    println!("run {}: {status}", report.run_id);
    println!("total requests: {requests}");
    println!("total errors: {errors} ({error_rate:.2}%)");
    for worker in &report.workers {
        println!(
            "  {} worker {}: {} requests, {} errors",
            style("-").dim(),
            worker.worker_id,
            worker.total_requests,
            worker.total_errors
        );
    }
    for error in &report.errors {
        println!("  {} {error}", style("!").red());
    }

    if report.status != RunStatus::Completed {
        anyhow::bail!("run {} failed", report.run_id);
    }
    Ok(())
}
