//! readout-rs - command-line driver
//!
//! Runs one acquisition against the simulated controller and writes the
//! records to a JSON-lines or legacy buffer file.

use anyhow::{bail, Context};
use clap::{Parser, ValueEnum};
use readout_rs::{
    config::{default_config_path, ReadoutConfig, SinkFormat},
    device::SimulatedDevice,
    output::{JsonLinesSink, LegacyBufferSink, LogMonitor},
    Readout, ReadoutEvent, RecordSink, TextKind,
};
use std::path::PathBuf;
use std::time::{Duration, Instant};
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt, EnvFilter};

#[derive(Debug, Clone, Copy, ValueEnum)]
enum FormatArg {
    JsonLines,
    Legacy,
}

impl From<FormatArg> for SinkFormat {
    fn from(arg: FormatArg) -> Self {
        match arg {
            FormatArg::JsonLines => SinkFormat::JsonLines,
            FormatArg::Legacy => SinkFormat::Legacy,
        }
    }
}

#[derive(Debug, Parser)]
#[command(name = "readout-rs", version, about = "Threaded readout for list-mode controllers")]
struct Args {
    /// Config file (defaults to the platform config directory)
    #[arg(short, long)]
    config: Option<PathBuf>,

    /// Write the effective config to the config path and exit
    #[arg(long)]
    write_default_config: bool,

    /// Run length in seconds
    #[arg(short, long, default_value_t = 5.0)]
    duration: f64,

    /// Pause the run after this many seconds
    #[arg(long)]
    pause_after: Option<f64>,

    /// Length of the pause in seconds
    #[arg(long, default_value_t = 1.0)]
    pause_for: f64,

    /// Record file (overrides output.path)
    #[arg(short, long)]
    output: Option<PathBuf>,

    /// Record format (overrides output.format)
    #[arg(short, long, value_enum)]
    format: Option<FormatArg>,

    /// Run number (overrides run.run_number)
    #[arg(long)]
    run_number: Option<u32>,

    /// Run title (overrides run.title)
    #[arg(long)]
    title: Option<String>,
}

fn main() -> anyhow::Result<()> {
    let args = Args::parse();

    let config_path = match args.config.clone().or_else(default_config_path) {
        Some(path) => path,
        None => bail!("No config path given and no platform config directory"),
    };
    let mut config = ReadoutConfig::load_or_default(&config_path)
        .with_context(|| format!("Loading config {:?}", config_path))?;

    if args.write_default_config {
        config
            .save(&config_path)
            .with_context(|| format!("Writing config {:?}", config_path))?;
        println!("Wrote {}", config_path.display());
        return Ok(());
    }

    // Keep the guard alive so buffered log lines are written on exit
    let _log_guard = init_logging(&config);

    if let Some(format) = args.format {
        config.output.format = format.into();
    }
    if let Some(path) = args.output.clone() {
        config.output.path = Some(path);
    }
    if let Some(run_number) = args.run_number {
        config.run.run_number = run_number;
    }
    if let Some(title) = &args.title {
        config.run.title = title.clone();
    }

    tracing::info!("Starting readout-rs with config {:?}", config_path);
    run(&args, config)
}

fn init_logging(config: &ReadoutConfig) -> Option<tracing_appender::non_blocking::WorkerGuard> {
    let filter = EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| EnvFilter::new(&config.logging.filter));

    let (file_layer, guard) = match &config.logging.log_dir {
        Some(dir) => {
            let appender = tracing_appender::rolling::daily(dir, "readout.log");
            let (writer, guard) = tracing_appender::non_blocking(appender);
            let layer = tracing_subscriber::fmt::layer()
                .with_writer(writer)
                .with_ansi(false);
            (Some(layer), Some(guard))
        }
        None => (None, None),
    };

    tracing_subscriber::registry()
        .with(filter)
        .with(tracing_subscriber::fmt::layer())
        .with(file_layer)
        .init();
    guard
}

fn open_sink(config: &ReadoutConfig) -> anyhow::Result<Box<dyn RecordSink>> {
    let run_number = config.run.run_number;
    let sink: Box<dyn RecordSink> = match config.output.format {
        SinkFormat::JsonLines => {
            let path = config
                .output
                .path
                .clone()
                .unwrap_or_else(|| PathBuf::from(format!("run-{:04}.jsonl", run_number)));
            Box::new(JsonLinesSink::create(&path)?)
        }
        SinkFormat::Legacy => {
            let path = config
                .output
                .path
                .clone()
                .unwrap_or_else(|| PathBuf::from(format!("run-{:04}.evt", run_number)));
            Box::new(LegacyBufferSink::create(
                &path,
                config.output.legacy_buffer_words,
            )?)
        }
    };
    Ok(sink)
}

fn run(args: &Args, config: ReadoutConfig) -> anyhow::Result<()> {
    config
        .validate_simulation()
        .context("Checking simulated controller settings")?;
    let sink = open_sink(&config).context("Opening record sink")?;
    let device = SimulatedDevice::new(config.simulation.clone());
    let title = config.run.title.clone();

    let mut readout = Readout::new(config, Box::new(device), sink, Box::new(LogMonitor::new()))
        .context("Creating readout pipeline")?;

    readout
        .submit_text(TextKind::RunVariables, &[format!("title={}", title)])
        .context("Queueing run variables")?;
    readout.begin().context("Beginning run")?;

    let started = Instant::now();
    let duration = Duration::from_secs_f64(args.duration.max(0.0));
    let mut pause_at = args
        .pause_after
        .map(|s| started + Duration::from_secs_f64(s.max(0.0)));

    while started.elapsed() < duration {
        if pause_at.is_some_and(|at| Instant::now() >= at) {
            pause_at = None;
            readout.pause().context("Pausing run")?;
            tracing::info!("Paused for {:.1}s", args.pause_for);
            std::thread::sleep(Duration::from_secs_f64(args.pause_for.max(0.0)));
            readout.resume().context("Resuming run")?;
        }

        if let Ok(event) = readout.events().recv_timeout(Duration::from_millis(100)) {
            match event {
                ReadoutEvent::RunFailed { message, .. } => {
                    readout.shutdown().ok();
                    bail!("Run failed: {}", message);
                }
                other => tracing::warn!(?other, "Pipeline event"),
            }
        }
    }

    readout.end().context("Ending run")?;
    let stats = readout.stats();
    readout.shutdown().context("Shutting down")?;

    println!("{}", serde_json::to_string_pretty(&stats)?);
    Ok(())
}
