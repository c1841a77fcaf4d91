use std::sync::Arc;

use anyhow::{Context, Result, anyhow};
use clap::Parser;
use tracing::instrument;

#[derive(Parser, Debug, Clone)]
#[command(
    name = "cas-import",
    version,
    about = "Import Swift containers into a content-addressed container",
    long_about = "`cas-import` copies every object of the source containers into DST_CONTAINER under \
a name derived from its content hash (<h[0..2]>/<h[2]>/<h>). Identical content is stored once \
and dynamic large objects are re-published as static manifests.

Remotes are looked up in the remotes file (see --remotes); the special remote name `@env` reads \
OS_USERNAME, OS_PASSWORD, OS_TENANT_ID, OS_REGION_NAME and OS_AUTH_URL from the environment.

EXAMPLE:
    # Import two containers with 8 workers, printing progress and a summary
    cas-import backup archive cas photos videos --concurrency 8 --progress --summary

Runs are idempotent: objects already present in the destination are skipped, so an interrupted \
or partially failed import can be started again."
)]
struct Args {
    // Import options
    /// Number of objects processed concurrently
    #[arg(
        long,
        default_value = "5",
        value_name = "N",
        help_heading = "Import options"
    )]
    concurrency: usize,

    /// Number of times to check for a copy that timed out on the server before giving up
    #[arg(
        long,
        default_value = "60",
        value_name = "N",
        help_heading = "Import options"
    )]
    copy_retries: u32,

    /// Delay between two checks for a copy that timed out, e.g. "10s", "500ms"
    #[arg(
        long,
        default_value = "10s",
        value_name = "DELAY",
        value_parser = humantime::parse_duration,
        help_heading = "Import options"
    )]
    copy_retry_interval: std::time::Duration,

    /// Number of entries requested per listing page
    #[arg(
        long,
        default_value = "10000",
        value_name = "N",
        help_heading = "Import options"
    )]
    page_size: usize,

    /// Classify and deduplicate without writing anything
    #[arg(long, help_heading = "Import options")]
    dry_run: bool,

    /// Exit on first error
    #[arg(short = 'e', long = "fail-early", help_heading = "Import options")]
    fail_early: bool,

    /// Remotes file, defaults to <config dir>/swiftcas/remotes.toml
    #[arg(long, value_name = "PATH", help_heading = "Import options")]
    remotes: Option<std::path::PathBuf>,

    // Progress & output
    /// Show progress
    #[arg(long, help_heading = "Progress & output")]
    progress: bool,

    /// Toggles the type of progress to show
    ///
    /// If specified, --progress flag is implied.
    ///
    /// Options are: `ProgressBar` (animated progress bar), `TextUpdates` (appropriate for logging), Auto (default, will
    /// choose between `ProgressBar` or `TextUpdates` depending on the type of terminal attached to stderr)
    #[arg(long, value_name = "TYPE", help_heading = "Progress & output")]
    progress_type: Option<common::ProgressType>,

    /// Sets the delay between progress updates
    ///
    /// - For the interactive (--progress-type=ProgressBar), the default is 200ms.
    /// - For the non-interactive (--progress-type=TextUpdates), the default is 10s.
    ///
    /// If specified, --progress flag is implied.
    #[arg(long, value_name = "DELAY", help_heading = "Progress & output")]
    progress_delay: Option<String>,

    /// Verbose level (implies "summary"): -v INFO / -vv DEBUG / -vvv TRACE (default: ERROR)
    #[arg(short = 'v', long = "verbose", action = clap::ArgAction::Count, help_heading = "Progress & output")]
    verbose: u8,

    /// Print summary at the end
    #[arg(long, help_heading = "Progress & output")]
    summary: bool,

    /// Quiet mode, don't report errors
    #[arg(short = 'q', long = "quiet", help_heading = "Progress & output")]
    quiet: bool,

    // Performance & throttling
    /// Maximum number of requests in flight, 0 means no limit
    #[arg(
        long,
        default_value = "0",
        value_name = "N",
        help_heading = "Performance & throttling"
    )]
    max_connections: usize,

    /// Throttle the number of requests per second, 0 means no throttle
    #[arg(
        long,
        default_value = "0",
        value_name = "N",
        help_heading = "Performance & throttling"
    )]
    request_throttle: usize,

    /// Throttle the bytes per second read while hashing large objects, 0 means no throttle
    ///
    /// Accepts sizes like "50MiB". Requires --chunk-size.
    #[arg(
        long,
        default_value = "0",
        value_name = "SIZE",
        help_heading = "Performance & throttling"
    )]
    transfer_throttle: bytesize::ByteSize,

    /// Chunk size used to account bytes against --transfer-throttle
    #[arg(
        long,
        default_value = "0",
        value_name = "SIZE",
        help_heading = "Performance & throttling"
    )]
    chunk_size: bytesize::ByteSize,

    // Advanced settings
    /// Number of worker threads, 0 means number of cores
    #[arg(
        long,
        default_value = "0",
        value_name = "N",
        help_heading = "Advanced settings"
    )]
    max_workers: usize,

    /// Number of blocking worker threads, 0 means Tokio runtime default (512)
    #[arg(
        long,
        default_value = "0",
        value_name = "N",
        help_heading = "Advanced settings"
    )]
    max_blocking_threads: usize,

    /// Write logs to this file instead of stderr
    #[arg(long, value_name = "PATH", help_heading = "Advanced settings")]
    log_file: Option<String>,

    /// Write a Chrome trace (chrome://tracing, Perfetto) to <PREFIX>-cas-import.json
    #[arg(long, value_name = "PREFIX", help_heading = "Advanced settings")]
    chrome_trace: Option<String>,

    // ARGUMENTS
    /// Remote holding the source containers
    #[arg()]
    src_remote: String,

    /// Remote holding the destination container
    #[arg()]
    dst_remote: String,

    /// Content-addressed destination container, created if missing
    #[arg()]
    dst_container: String,

    /// Source container(s)
    #[arg(required = true)]
    src_containers: Vec<String>,
}

async fn open(remotes: &swift::Remotes, name: &str) -> Result<Arc<swift::Context>> {
    let credentials = remotes
        .credentials(name)
        .with_context(|| format!("cannot configure remote '{}'", name))?;
    let transport = Arc::new(swift::HttpTransport::new(Default::default())?);
    let ctx = swift::Context::build(credentials, transport)
        .await
        .with_context(|| format!("cannot open a session on remote '{}'", name))?;
    Ok(Arc::new(ctx))
}

#[instrument]
async fn async_main(args: Args) -> Result<casimport::Summary> {
    let remotes = match &args.remotes {
        Some(path) => swift::Remotes::load(path)?,
        None => swift::Remotes::load_default()?,
    };
    tracing::info!("building contexts");
    let src = open(&remotes, &args.src_remote).await?;
    let dst = open(&remotes, &args.dst_remote).await?;
    let settings = casimport::Settings {
        concurrency: args.concurrency,
        copy_retries: args.copy_retries,
        copy_retry_interval: args.copy_retry_interval,
        page_size: args.page_size,
        dry_run: args.dry_run,
        fail_early: args.fail_early,
        chunk_size: args.chunk_size.as_u64(),
    };
    match casimport::migrate(
        &common::PROGRESS,
        src,
        dst,
        &args.src_containers,
        &args.dst_container,
        &settings,
    )
    .await
    {
        Ok(summary) => Ok(summary),
        Err(error) => {
            tracing::error!("{:#}", &error);
            if args.fail_early {
                return Err(anyhow!("{}\n\n{}", error, &error.summary));
            }
            Err(anyhow!("cas-import encountered errors\n\n{}", &error.summary))
        }
    }
}

fn main() -> Result<()> {
    let args = Args::parse();
    let func = {
        let args = args.clone();
        || async_main(args)
    };
    let output = common::OutputConfig {
        quiet: args.quiet,
        verbose: args.verbose,
        print_summary: args.summary,
    };
    let runtime = common::RuntimeConfig {
        max_workers: args.max_workers,
        max_blocking_threads: args.max_blocking_threads,
    };
    let throttle = common::ThrottleConfig {
        max_connections: args.max_connections,
        request_throttle: args.request_throttle,
        transfer_throttle: args.transfer_throttle.as_u64(),
        chunk_size: args.chunk_size.as_u64(),
    };
    let tracing = common::TracingConfig {
        debug_log_file: args.log_file.clone(),
        chrome_trace_prefix: args.chrome_trace.clone(),
        trace_identifier: "cas-import".to_string(),
    };
    let show_progress =
        args.progress || args.progress_type.is_some() || args.progress_delay.is_some();
    let res = common::run(
        if show_progress {
            Some(common::ProgressSettings {
                progress_type: args.progress_type.unwrap_or_default(),
                progress_delay: args.progress_delay.clone(),
            })
        } else {
            None
        },
        output,
        runtime,
        throttle,
        tracing,
        func,
    );
    if res.is_none() {
        std::process::exit(1);
    }
    Ok(())
}
