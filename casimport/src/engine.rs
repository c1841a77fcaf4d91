//! CAS migration engine
//!
//! Every source object goes through the same steps:
//!
//! 1. skip it when its listed hash is already stored in the destination
//! 2. HEAD it to tell plain objects from dynamic large objects
//! 3. plain objects are copied server-side to `cas_path(etag)`, waiting for the copy to
//!    become visible when the store answers 504
//! 4. large objects are hashed (once, the result is cached on the source manifest) and
//!    re-published as a static manifest at `cas_path(content hash)`
//! 5. the content type of the new destination object is fixed
//!
//! A failed object never aborts the run unless `fail_early` is set; failures are collected in
//! the [`Summary`] and re-running the migration retries them while skipping everything
//! already copied.

use std::collections::HashSet;
use std::sync::{Arc, Mutex, PoisonError};

use anyhow::{Context, anyhow};
use futures::TryStreamExt;
use rand::seq::SliceRandom;
use tracing::instrument;

use common::progress;
use swift::storage;

use crate::cas::{self, DLO_HEADER, EMPTY_HASH, LO_ETAG, MIME_FILE, MIME_LARGE};
use crate::manifest::{Manifest, parse_dlo_pointer};

/// Error and the summary of everything done before it happened.
///
/// Log it with `{:#}` or `{:?}` to see the whole chain of causes.
#[derive(Debug, thiserror::Error)]
#[error("{source:#}")]
pub struct Error {
    #[source]
    pub source: anyhow::Error,
    pub summary: Summary,
}

impl Error {
    #[must_use]
    pub fn new(source: anyhow::Error, summary: Summary) -> Self {
        Error { source, summary }
    }
}

#[derive(Debug, Clone, Copy)]
pub struct Settings {
    /// Number of objects processed concurrently
    pub concurrency: usize,
    /// HEAD probes after a server-side copy timed out
    pub copy_retries: u32,
    pub copy_retry_interval: std::time::Duration,
    pub page_size: usize,
    pub dry_run: bool,
    pub fail_early: bool,
    /// Chunk size used to account hashed bytes against the transfer throttle
    pub chunk_size: u64,
}

impl Default for Settings {
    fn default() -> Self {
        Self {
            concurrency: 5,
            copy_retries: 60,
            copy_retry_interval: std::time::Duration::from_secs(10),
            page_size: swift::listing::DEFAULT_PAGE_SIZE,
            dry_run: false,
            fail_early: false,
            chunk_size: 0,
        }
    }
}

/// What happened to one source object.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Outcome {
    Copied,
    /// Server-side copy answered 504 and the object showed up after `probes` pending checks
    RetriedThenCopied { probes: u32 },
    ManifestUploaded,
    SkippedDedup,
    /// Would have been uploaded
    DryRun,
    Failed { reason: String },
}

#[derive(Debug, Clone, PartialEq, Eq, serde::Serialize)]
pub struct Failure {
    pub container: String,
    pub name: String,
    pub reason: String,
}

#[derive(Debug, Clone, Default, PartialEq, Eq, serde::Serialize)]
pub struct Summary {
    pub objects_listed: usize,
    pub objects_copied: usize,
    pub copies_retried: usize,
    pub manifests_uploaded: usize,
    pub objects_skipped: usize,
    pub dry_run: usize,
    pub objects_failed: usize,
    pub bytes_copied: u64,
    pub failures: Vec<Failure>,
}

impl Summary {
    /// Counts `outcome` of an object of `bytes` bytes.
    pub fn record(&mut self, outcome: &Outcome, bytes: u64) {
        match outcome {
            Outcome::Copied => {
                self.objects_copied += 1;
                self.bytes_copied += bytes;
            }
            Outcome::RetriedThenCopied { .. } => {
                self.objects_copied += 1;
                self.copies_retried += 1;
                self.bytes_copied += bytes;
            }
            Outcome::ManifestUploaded => {
                self.manifests_uploaded += 1;
                self.bytes_copied += bytes;
            }
            Outcome::SkippedDedup => self.objects_skipped += 1,
            Outcome::DryRun => self.dry_run += 1,
            Outcome::Failed { .. } => self.objects_failed += 1,
        }
    }

    fn of(outcome: &Outcome, bytes: u64) -> Self {
        let mut summary = Self::default();
        summary.record(outcome, bytes);
        summary
    }

    pub fn has_failures(&self) -> bool {
        self.objects_failed > 0
    }
}

impl std::ops::Add for Summary {
    type Output = Self;
    fn add(mut self, other: Self) -> Self {
        self.failures.extend(other.failures);
        Self {
            objects_listed: self.objects_listed + other.objects_listed,
            objects_copied: self.objects_copied + other.objects_copied,
            copies_retried: self.copies_retried + other.copies_retried,
            manifests_uploaded: self.manifests_uploaded + other.manifests_uploaded,
            objects_skipped: self.objects_skipped + other.objects_skipped,
            dry_run: self.dry_run + other.dry_run,
            objects_failed: self.objects_failed + other.objects_failed,
            bytes_copied: self.bytes_copied + other.bytes_copied,
            failures: self.failures,
        }
    }
}

impl std::fmt::Display for Summary {
    fn fmt(&self, f: &mut std::fmt::Formatter) -> std::fmt::Result {
        write!(
            f,
            "objects listed: {}\n\
            objects copied: {}\n\
            copies retried: {}\n\
            manifests uploaded: {}\n\
            objects skipped: {}\n\
            objects failed: {}\n\
            bytes copied: {}",
            self.objects_listed,
            self.objects_copied,
            self.copies_retried,
            self.manifests_uploaded,
            self.objects_skipped,
            self.objects_failed,
            bytesize::ByteSize(self.bytes_copied),
        )?;
        if self.dry_run > 0 {
            write!(f, "\nwould upload (dry run): {}", self.dry_run)?;
        }
        for failure in &self.failures {
            write!(
                f,
                "\nfailed: {}/{}: {}",
                failure.container, failure.name, failure.reason
            )?;
        }
        Ok(())
    }
}

/// One source object, tagged with the container it was listed from.
#[derive(Debug, Clone)]
struct Task {
    container: String,
    entry: swift::ObjectEntry,
}

struct Shared {
    src: Arc<swift::Context>,
    dst: Arc<swift::Context>,
    dst_container: String,
    src_account: String,
    /// Basenames already present in the destination when the run started
    known: HashSet<String>,
    /// Hashes taken by a worker of this run
    claimed: Mutex<HashSet<String>>,
    settings: Settings,
}

impl Shared {
    fn is_known(&self, hash: &str) -> bool {
        self.known.contains(hash)
    }

    /// First caller for `hash` wins; later callers skip it as a duplicate.
    fn claim(&self, hash: &str) -> bool {
        self.claimed
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .insert(hash.to_string())
    }
}

fn header<'a>(headers: &'a swift::HeaderMap, name: &str) -> Option<&'a str> {
    headers
        .get(name)
        .and_then(|value| value.to_str().ok())
        .filter(|value| !value.is_empty())
}

fn content_type(value: &'static str) -> swift::HeaderMap {
    let mut headers = swift::HeaderMap::new();
    headers.insert(
        swift::header::CONTENT_TYPE,
        swift::HeaderValue::from_static(value),
    );
    headers
}

/// Polls the destination until a timed-out server-side copy shows up.
///
/// Returns the number of pending (404) answers seen before the object appeared.
#[instrument(skip(prog_track, shared))]
async fn wait_visible(
    prog_track: &'static progress::Progress,
    shared: &Shared,
    dst_name: &str,
    hash: &str,
) -> anyhow::Result<u32> {
    prog_track.copies_retried.inc();
    let mut pending = 0;
    while pending < shared.settings.copy_retries {
        match storage::head(&shared.dst, &shared.dst_container, dst_name).await {
            Ok(_) => return Ok(pending),
            Err(error) if error.is_not_found() => {
                pending += 1;
                tracing::warn!(
                    "waiting for {} to appear ({}/{})",
                    hash,
                    pending,
                    shared.settings.copy_retries
                );
                tokio::time::sleep(shared.settings.copy_retry_interval).await;
            }
            Err(error) => {
                return Err(error)
                    .with_context(|| format!("failed checking whether {} was copied", hash));
            }
        }
    }
    Err(anyhow!(
        "Cannot fetch {}: still missing after {} probes",
        hash,
        shared.settings.copy_retries
    ))
}

#[instrument(
    skip(prog_track, shared, task, headers),
    fields(container = %task.container, name = %task.entry.name)
)]
async fn push_file(
    prog_track: &'static progress::Progress,
    shared: &Shared,
    task: &Task,
    headers: &swift::HeaderMap,
) -> anyhow::Result<(Outcome, u64)> {
    let hash = header(headers, "etag")
        .map(cas::unquote)
        .unwrap_or(cas::unquote(&task.entry.hash))
        .to_string();
    let bytes = header(headers, "content-length")
        .and_then(|length| length.parse().ok())
        .unwrap_or(task.entry.bytes);
    if shared.is_known(&hash) || !shared.claim(&hash) {
        tracing::debug!("{} already stored", hash);
        return Ok((Outcome::SkippedDedup, 0));
    }
    let dst_name = cas::cas_path(&hash)?;
    if shared.settings.dry_run {
        tracing::info!("would copy {}/{} to {}", task.container, task.entry.name, dst_name);
        return Ok((Outcome::DryRun, bytes));
    }
    tracing::info!("copying {}/{} to {}", task.container, task.entry.name, dst_name);
    let copy_from = swift::object_path(&task.container, &task.entry.name);
    let copy_headers = swift::headers(&[
        ("x-copy-from", copy_from.as_str()),
        ("x-copy-from-account", shared.src_account.as_str()),
    ])?;
    let options = swift::RequestOptions::default().with_headers(copy_headers);
    let copied = storage::put(&shared.dst, &shared.dst_container, &dst_name, options).await;
    let outcome = match copied {
        Ok(_) => Outcome::Copied,
        Err(error) if error.is_gateway_timeout() => {
            tracing::warn!("copy of {} timed out, waiting for it to appear", hash);
            let probes = wait_visible(prog_track, shared, &dst_name, &hash).await?;
            Outcome::RetriedThenCopied { probes }
        }
        Err(error) => {
            return Err(error).with_context(|| {
                format!("failed copying {}/{}", task.container, task.entry.name)
            });
        }
    };
    storage::update(
        &shared.dst,
        &shared.dst_container,
        &dst_name,
        content_type(MIME_FILE),
    )
    .await
    .with_context(|| format!("failed setting content type of {}", dst_name))?;
    prog_track.objects_copied.inc();
    prog_track.bytes_copied.add(bytes);
    Ok((outcome, bytes))
}

/// Streams a large object once and caches its md5 on the source manifest.
#[instrument(
    skip(prog_track, shared, task, pointer),
    fields(container = %task.container, name = %task.entry.name)
)]
async fn compute_lo_etag(
    prog_track: &'static progress::Progress,
    shared: &Shared,
    task: &Task,
    pointer: &str,
) -> anyhow::Result<String> {
    tracing::info!("computing hash of {}/{}", task.container, task.entry.name);
    let response = storage::download(&shared.src, &task.container, &task.entry.name)
        .await
        .with_context(|| format!("failed downloading {}/{}", task.container, task.entry.name))?;
    let lo_etag = {
        // the download holds a connection slot until its stream is gone
        let mut stream = response.into_stream();
        let mut context = md5::Context::new();
        while let Some(chunk) = stream
            .try_next()
            .await
            .with_context(|| format!("failed reading {}/{}", task.container, task.entry.name))?
        {
            throttle::get_transfer_tokens(shared.settings.chunk_size, chunk.len() as u64).await;
            context.consume(&chunk);
            prog_track.bytes_hashed.add(chunk.len() as u64);
        }
        format!("{:x}", context.compute())
    };
    if shared.settings.dry_run {
        return Ok(lo_etag);
    }
    // POST replaces all metadata, the manifest pointer must be sent again
    let cache = swift::headers(&[(LO_ETAG, lo_etag.as_str()), (DLO_HEADER, pointer)])?;
    storage::update(&shared.src, &task.container, &task.entry.name, cache)
        .await
        .with_context(|| {
            format!(
                "failed caching content hash on {}/{}",
                task.container, task.entry.name
            )
        })?;
    Ok(lo_etag)
}

#[instrument(
    skip(prog_track, shared, task, headers),
    fields(container = %task.container, name = %task.entry.name)
)]
async fn push_large_object(
    prog_track: &'static progress::Progress,
    shared: &Shared,
    task: &Task,
    headers: &swift::HeaderMap,
    pointer: &str,
) -> anyhow::Result<(Outcome, u64)> {
    let lo_etag = match header(headers, LO_ETAG) {
        Some(lo_etag) => lo_etag.to_string(),
        None => compute_lo_etag(prog_track, shared, task, pointer).await?,
    };
    if shared.is_known(&lo_etag) || !shared.claim(&lo_etag) {
        tracing::debug!("large object {} already stored", lo_etag);
        return Ok((Outcome::SkippedDedup, 0));
    }
    let (segment_container, prefix) = parse_dlo_pointer(pointer)?;
    let segments = storage::list_container(&shared.src, &segment_container, Some(&prefix))
        .with_page_size(shared.settings.page_size)
        .collect_all()
        .await
        .with_context(|| format!("failed listing segments {}", pointer))?;
    let manifest = Manifest::from_segments(&shared.dst_container, &segments)?;
    let dst_name = cas::cas_path(&lo_etag)?;
    if shared.settings.dry_run {
        tracing::info!(
            "would publish {}/{} as {} ({} segments)",
            task.container,
            task.entry.name,
            dst_name,
            manifest.segments.len()
        );
        return Ok((Outcome::DryRun, manifest.size_bytes()));
    }
    tracing::info!(
        "publishing {}/{} as {} ({} segments)",
        task.container,
        task.entry.name,
        dst_name,
        manifest.segments.len()
    );
    let etag = manifest.etag();
    let options = swift::RequestOptions::default()
        .with_headers(swift::headers(&[("etag", etag.as_str())])?)
        .query("multipart-manifest", "put")
        .body(manifest.to_json()?);
    storage::put(&shared.dst, &shared.dst_container, &dst_name, options)
        .await
        .with_context(|| format!("failed uploading manifest {}", dst_name))?;
    storage::update(
        &shared.dst,
        &shared.dst_container,
        &dst_name,
        content_type(MIME_LARGE),
    )
    .await
    .with_context(|| format!("failed setting content type of {}", dst_name))?;
    prog_track.manifests_uploaded.inc();
    Ok((Outcome::ManifestUploaded, manifest.size_bytes()))
}

async fn process_entry(
    prog_track: &'static progress::Progress,
    shared: &Shared,
    task: &Task,
) -> anyhow::Result<(Outcome, u64)> {
    let hash = cas::unquote(&task.entry.hash);
    // manifests of large objects all list with the empty hash
    if hash != EMPTY_HASH && shared.is_known(hash) {
        return Ok((Outcome::SkippedDedup, 0));
    }
    let headers = storage::head(&shared.src, &task.container, &task.entry.name)
        .await
        .with_context(|| format!("failed reading {}/{}", task.container, task.entry.name))?;
    match header(&headers, DLO_HEADER) {
        Some(pointer) => push_large_object(prog_track, shared, task, &headers, pointer).await,
        None => push_file(prog_track, shared, task, &headers).await,
    }
}

async fn process(
    prog_track: &'static progress::Progress,
    shared: Arc<Shared>,
    task: Task,
) -> Result<Summary, Error> {
    let _ops_guard = prog_track.ops.guard();
    match process_entry(prog_track, &shared, &task).await {
        Ok((outcome, bytes)) => {
            if outcome == Outcome::SkippedDedup {
                prog_track.objects_skipped.inc();
            }
            tracing::debug!("{}/{}: {:?}", task.container, task.entry.name, outcome);
            Ok(Summary::of(&outcome, bytes))
        }
        Err(source) => {
            prog_track.objects_failed.inc();
            let reason = format!("{:#}", source);
            let mut summary = Summary::of(
                &Outcome::Failed {
                    reason: reason.clone(),
                },
                0,
            );
            summary.failures.push(Failure {
                container: task.container,
                name: task.entry.name,
                reason,
            });
            Err(Error::new(source, summary))
        }
    }
}

async fn list_all(
    ctx: &swift::Context,
    container: &str,
    page_size: usize,
) -> swift::Result<Vec<swift::ObjectEntry>> {
    // a stale object count must not hide the tail of a container
    storage::list_container(ctx, container, None)
        .with_page_size(page_size)
        .exhaustive()
        .into_stream()
        .try_collect()
        .await
}

/// Basenames of everything stored in the destination container, creating it if needed.
#[instrument(skip(dst, settings))]
async fn destination_index(
    dst: &swift::Context,
    dst_container: &str,
    settings: &Settings,
) -> anyhow::Result<HashSet<String>> {
    match list_all(dst, dst_container, settings.page_size).await {
        Ok(entries) => Ok(entries
            .iter()
            .map(|entry| cas::basename(&entry.name).to_string())
            .collect()),
        Err(error) if error.is_not_found() => {
            if settings.dry_run {
                tracing::info!("destination container {} does not exist", dst_container);
            } else {
                tracing::info!("creating destination container {}", dst_container);
                storage::create_container(dst, dst_container, swift::HeaderMap::new())
                    .await
                    .with_context(|| format!("failed creating container {}", dst_container))?;
            }
            Ok(HashSet::new())
        }
        Err(error) => {
            Err(error).with_context(|| format!("failed listing container {}", dst_container))
        }
    }
}

/// Copies every object of `src_containers` into `dst_container` under its content hash.
///
/// Returns an error carrying the full summary when at least one object failed; with
/// `fail_early` the first failure stops the run.
#[instrument(skip(prog_track, src, dst, settings))]
pub async fn migrate(
    prog_track: &'static progress::Progress,
    src: Arc<swift::Context>,
    dst: Arc<swift::Context>,
    src_containers: &[String],
    dst_container: &str,
    settings: &Settings,
) -> Result<Summary, Error> {
    let known = destination_index(&dst, dst_container, settings)
        .await
        .map_err(|err| Error::new(err, Default::default()))?;
    tracing::info!("{} has {} blocks", dst_container, known.len());
    let mut tasks = Vec::new();
    for container in src_containers {
        let entries = list_all(&src, container, settings.page_size)
            .await
            .with_context(|| format!("failed listing container {}", container))
            .map_err(|err| Error::new(err, Default::default()))?;
        prog_track.objects_listed.add(entries.len() as u64);
        tasks.extend(entries.into_iter().map(|entry| Task {
            container: container.clone(),
            entry,
        }));
    }
    // spreads load across source containers and name prefixes
    tasks.shuffle(&mut rand::thread_rng());
    let src_account = src
        .account()
        .context("cannot determine the source account")
        .map_err(|err| Error::new(err, Default::default()))?;
    let mut summary = Summary {
        objects_listed: tasks.len(),
        ..Default::default()
    };
    tracing::info!(
        "got {} objects to check ({} workers)",
        tasks.len(),
        settings.concurrency
    );
    let shared = Arc::new(Shared {
        src,
        dst,
        dst_container: dst_container.to_string(),
        src_account,
        known,
        claimed: Mutex::new(HashSet::new()),
        settings: *settings,
    });
    let max_width = settings.concurrency.max(1);
    let mut join_set = tokio::task::JoinSet::new();
    let mut tasks = tasks.into_iter();
    loop {
        if join_set.len() < max_width {
            if let Some(task) = tasks.next() {
                join_set.spawn(process(prog_track, shared.clone(), task));
                continue;
            }
        }
        let Some(res) = join_set.join_next().await else {
            break;
        };
        match res {
            Ok(Ok(item)) => summary = summary + item,
            Ok(Err(error)) => {
                tracing::error!("{:#}", &error);
                summary = summary + error.summary;
                if settings.fail_early {
                    return Err(Error::new(error.source, summary));
                }
            }
            Err(error) => {
                tracing::error!("worker failed: {}", &error);
                summary.objects_failed += 1;
                if settings.fail_early {
                    return Err(Error::new(error.into(), summary));
                }
            }
        }
    }
    if summary.has_failures() {
        return Err(Error::new(
            anyhow!("{} object(s) failed to migrate", summary.objects_failed),
            summary,
        ));
    }
    Ok(summary)
}
