//! Shared runtime plumbing for swiftcas tools
//!
//! [`run`] is the single entry point every binary goes through: it installs the tracing
//! subscriber, configures throttling, builds the tokio runtime, drives the tool's async main
//! function while optionally printing progress, and reports the final summary or error.

use std::io::IsTerminal;

use tracing_subscriber::layer::SubscriberExt;
use tracing_subscriber::util::SubscriberInitExt;

pub mod config;
pub mod progress;

pub use config::{OutputConfig, RuntimeConfig, ThrottleConfig, TracingConfig};

/// Process-wide progress counters, updated by the migration engine and read by the printer.
pub static PROGRESS: std::sync::LazyLock<progress::Progress> =
    std::sync::LazyLock::new(progress::Progress::new);

#[derive(Copy, Clone, Debug, Default, PartialEq, Eq, clap::ValueEnum)]
pub enum ProgressType {
    /// Animated progress bar when stderr is a terminal, text updates otherwise
    #[default]
    #[value(name = "Auto", alias = "auto")]
    Auto,
    /// Animated progress bar
    #[value(name = "ProgressBar", alias = "progress-bar")]
    ProgressBar,
    /// Periodic multi-line text updates, suitable for log files
    #[value(name = "TextUpdates", alias = "text-updates")]
    TextUpdates,
}

#[derive(Debug, Clone)]
pub struct ProgressSettings {
    pub progress_type: ProgressType,
    /// Human readable delay between updates, e.g. "200ms" or "10s"
    pub progress_delay: Option<String>,
}

impl ProgressSettings {
    fn resolve(&self) -> anyhow::Result<(ProgressType, std::time::Duration)> {
        let progress_type = match self.progress_type {
            ProgressType::Auto => {
                if std::io::stderr().is_terminal() {
                    ProgressType::ProgressBar
                } else {
                    ProgressType::TextUpdates
                }
            }
            other => other,
        };
        let delay = match &self.progress_delay {
            Some(delay) => humantime::parse_duration(delay)
                .map_err(|err| anyhow::anyhow!("invalid progress delay {:?}: {}", delay, err))?,
            None if progress_type == ProgressType::ProgressBar => {
                std::time::Duration::from_millis(200)
            }
            None => std::time::Duration::from_secs(10),
        };
        Ok((progress_type, delay))
    }
}

/// Converts a per-second rate into (tokens per interval, interval) for the token buckets.
///
/// Refills about every 100ms; the interval is derived from the rounded token count so the
/// effective rate stays `per_sec`.
fn replenish_schedule(per_sec: usize) -> (usize, std::time::Duration) {
    let per_sec = per_sec.max(1);
    let tokens = (per_sec / 10).max(1);
    (
        tokens,
        std::time::Duration::from_secs_f64(tokens as f64 / per_sec as f64),
    )
}

fn level_for(output: &OutputConfig) -> &'static str {
    if output.quiet {
        return "off";
    }
    match output.verbose {
        0 => "error",
        1 => "info",
        2 => "debug",
        _ => "trace",
    }
}

fn init_tracing(
    output: &OutputConfig,
    config: &TracingConfig,
) -> anyhow::Result<Option<tracing_chrome::FlushGuard>> {
    let filter = tracing_subscriber::EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new(level_for(output)));
    let (chrome_layer, chrome_guard) = match &config.chrome_trace_prefix {
        Some(prefix) => {
            let (layer, guard) = tracing_chrome::ChromeLayerBuilder::new()
                .file(format!("{}-{}.json", prefix, config.trace_identifier))
                .include_args(true)
                .build();
            (Some(layer), Some(guard))
        }
        None => (None, None),
    };
    let (stderr_layer, file_layer) = match &config.debug_log_file {
        Some(path) => {
            let file = std::fs::OpenOptions::new()
                .create(true)
                .append(true)
                .open(path)
                .map_err(|err| anyhow::anyhow!("cannot open log file {:?}: {}", path, err))?;
            let layer = tracing_subscriber::fmt::layer()
                .with_ansi(false)
                .with_writer(std::sync::Mutex::new(file));
            (None, Some(layer))
        }
        None => (
            Some(tracing_subscriber::fmt::layer().with_writer(std::io::stderr)),
            None,
        ),
    };
    tracing_subscriber::registry()
        .with(chrome_layer)
        .with(filter)
        .with(stderr_layer)
        .with(file_layer)
        .try_init()?;
    Ok(chrome_guard)
}

fn setup_throttle(throttle: &ThrottleConfig) {
    throttle::set_max_connections(throttle.max_connections);
    if throttle.request_throttle > 0 {
        let (tokens, interval) = replenish_schedule(throttle.request_throttle);
        throttle::init_request_tokens(tokens);
        tokio::spawn(throttle::run_request_replenish_thread(tokens, interval));
    }
    let transfer_tokens = throttle.transfer_tokens_per_sec();
    if transfer_tokens > 0 {
        let (tokens, interval) = replenish_schedule(transfer_tokens);
        throttle::init_transfer_tokens(tokens);
        tokio::spawn(throttle::run_transfer_replenish_thread(tokens, interval));
    }
}

async fn print_progress(
    progress_type: ProgressType,
    delay: std::time::Duration,
    mut stop: tokio::sync::watch::Receiver<bool>,
) {
    let mut printer = progress::ProgressPrinter::new(&PROGRESS);
    let bar = if progress_type == ProgressType::ProgressBar {
        let bar = indicatif::ProgressBar::new_spinner();
        if let Ok(style) =
            indicatif::ProgressStyle::with_template("{spinner:.green} [{elapsed_precise}] {msg}")
        {
            bar.set_style(style);
        }
        Some(bar)
    } else {
        None
    };
    loop {
        tokio::select! {
            _ = stop.changed() => break,
            _ = tokio::time::sleep(delay) => {}
        }
        match &bar {
            Some(bar) => {
                bar.set_message(printer.print_line());
                bar.tick();
            }
            None => eprintln!("{}", printer.print()),
        }
    }
    if let Some(bar) = bar {
        bar.finish_and_clear();
    }
}

/// Runs `func` on a freshly built runtime and reports its outcome.
///
/// Returns `None` when setup failed or `func` returned an error; errors are printed to stderr
/// unless `output.quiet` is set. The summary is printed to stdout when requested.
pub fn run<Fut, Summary, Error>(
    progress: Option<ProgressSettings>,
    output: OutputConfig,
    runtime: RuntimeConfig,
    throttle: ThrottleConfig,
    tracing: TracingConfig,
    func: impl FnOnce() -> Fut,
) -> Option<Summary>
where
    Summary: std::fmt::Display,
    Error: std::fmt::Display,
    Fut: std::future::Future<Output = Result<Summary, Error>>,
{
    let _chrome_guard = match init_tracing(&output, &tracing) {
        Ok(guard) => guard,
        Err(error) => {
            eprintln!("failed to initialize logging: {:#}", error);
            return None;
        }
    };
    if let Err(error) = throttle.validate() {
        tracing::error!("{}", error);
        if !output.quiet {
            eprintln!("{}", error);
        }
        return None;
    }
    let progress = match progress.map(|settings| settings.resolve()).transpose() {
        Ok(progress) => progress,
        Err(error) => {
            eprintln!("{:#}", error);
            return None;
        }
    };
    let mut builder = tokio::runtime::Builder::new_multi_thread();
    builder.enable_all();
    if runtime.max_workers > 0 {
        builder.worker_threads(runtime.max_workers);
    }
    if runtime.max_blocking_threads > 0 {
        builder.max_blocking_threads(runtime.max_blocking_threads);
    }
    let tokio_runtime = match builder.build() {
        Ok(tokio_runtime) => tokio_runtime,
        Err(error) => {
            eprintln!("failed to build tokio runtime: {}", error);
            return None;
        }
    };
    let res = tokio_runtime.block_on(async move {
        setup_throttle(&throttle);
        let (stop_tx, stop_rx) = tokio::sync::watch::channel(false);
        let printer = progress.map(|(progress_type, delay)| {
            tokio::spawn(print_progress(progress_type, delay, stop_rx))
        });
        let res = func().await;
        // the receiver may already be gone if the printer task exited
        let _ = stop_tx.send(true);
        if let Some(printer) = printer {
            if let Err(error) = printer.await {
                tracing::warn!("progress printer failed: {}", error);
            }
        }
        res
    });
    match res {
        Ok(summary) => {
            if output.print_summary || output.verbose > 0 {
                println!("{}", &summary);
            }
            Some(summary)
        }
        Err(error) => {
            if !output.quiet {
                eprintln!("{:#}", error);
            }
            None
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn replenish_schedule_keeps_rate() {
        let (tokens, interval) = replenish_schedule(500);
        assert_eq!(tokens, 50);
        assert_eq!(interval, std::time::Duration::from_millis(100));
        let (tokens, interval) = replenish_schedule(4);
        assert_eq!(tokens, 1);
        assert_eq!(interval, std::time::Duration::from_millis(250));
        for per_sec in [16, 25, 99, 1234] {
            let (tokens, interval) = replenish_schedule(per_sec);
            let rate = tokens as f64 / interval.as_secs_f64();
            assert!((rate - per_sec as f64).abs() < 1e-3, "{per_sec}/s became {rate}/s");
        }
    }

    #[test]
    fn verbosity_maps_to_levels() {
        let mut output = OutputConfig::default();
        assert_eq!(level_for(&output), "error");
        output.verbose = 2;
        assert_eq!(level_for(&output), "debug");
        output.verbose = 7;
        assert_eq!(level_for(&output), "trace");
        output.quiet = true;
        assert_eq!(level_for(&output), "off");
    }

    #[test]
    fn progress_delay_defaults() -> anyhow::Result<()> {
        let settings = ProgressSettings {
            progress_type: ProgressType::TextUpdates,
            progress_delay: None,
        };
        assert_eq!(
            settings.resolve()?,
            (ProgressType::TextUpdates, std::time::Duration::from_secs(10))
        );
        let settings = ProgressSettings {
            progress_type: ProgressType::ProgressBar,
            progress_delay: Some("1s".to_string()),
        };
        assert_eq!(
            settings.resolve()?,
            (ProgressType::ProgressBar, std::time::Duration::from_secs(1))
        );
        let settings = ProgressSettings {
            progress_type: ProgressType::ProgressBar,
            progress_delay: Some("soon".to_string()),
        };
        assert!(settings.resolve().is_err());
        Ok(())
    }
}
