//! Lazily paginated container listings

use futures::stream::BoxStream;
use futures::StreamExt;
use reqwest::Method;
use serde::Deserialize;
use tracing::{debug, instrument};

use crate::context::{Context, RequestOptions, container_path};
use crate::error::Result;

pub const DEFAULT_PAGE_SIZE: usize = 10_000;

const OBJECT_COUNT: &str = "x-container-object-count";

/// One object of a container listing.
#[derive(Debug, Clone, PartialEq, Eq, Deserialize)]
pub struct ObjectEntry {
    pub name: String,
    #[serde(default)]
    pub hash: String,
    #[serde(default)]
    pub bytes: u64,
    #[serde(default)]
    pub content_type: String,
    #[serde(default)]
    pub last_modified: Option<chrono::NaiveDateTime>,
}

/// Marker-based walk over a container, one page per request.
///
/// The walk ends on a short page or, for unprefixed listings, as soon as the number of
/// entries seen reaches the object count the store reported with the first page. That saves
/// the trailing empty request on containers holding a multiple of the page size, but Swift
/// updates the count asynchronously: a stale count, or objects written during the walk, cut
/// the listing short. [`Listing::exhaustive`] ignores the count and only stops on a short page.
pub struct Listing<'a> {
    ctx: &'a Context,
    container: String,
    prefix: Option<String>,
    marker: Option<String>,
    page_size: usize,
    expected: Option<u64>,
    trust_count: bool,
    yielded: u64,
    done: bool,
}

impl<'a> Listing<'a> {
    pub fn new(ctx: &'a Context, container: &str, prefix: Option<&str>) -> Self {
        Self {
            ctx,
            container: container.to_string(),
            prefix: prefix.filter(|prefix| !prefix.is_empty()).map(str::to_string),
            marker: None,
            page_size: DEFAULT_PAGE_SIZE,
            expected: None,
            trust_count: true,
            yielded: 0,
            done: false,
        }
    }

    pub fn with_page_size(mut self, page_size: usize) -> Self {
        self.page_size = page_size.max(1);
        self
    }

    /// Walks until a short page, whatever object count the store reports.
    pub fn exhaustive(mut self) -> Self {
        self.trust_count = false;
        self
    }

    /// Continues an interrupted walk after `marker`.
    pub fn resume(mut self, marker: impl Into<String>) -> Self {
        self.marker = Some(marker.into());
        self
    }

    /// Name of the last entry returned so far.
    pub fn marker(&self) -> Option<&str> {
        self.marker.as_deref()
    }

    /// Fetches the next page, `None` once the listing is exhausted.
    #[instrument(skip(self), fields(container = %self.container, marker = ?self.marker))]
    pub async fn next_page(&mut self) -> Result<Option<Vec<ObjectEntry>>> {
        if self.done {
            return Ok(None);
        }
        let mut options = RequestOptions::new(Method::GET)
            .query("format", "json")
            .query("limit", self.page_size.to_string());
        if let Some(prefix) = &self.prefix {
            options = options.query("prefix", prefix.as_str());
        }
        if let Some(marker) = &self.marker {
            options = options.query("marker", marker.as_str());
        }
        let response = self
            .ctx
            .call(&container_path(&self.container), options)
            .await?;
        if self.trust_count
            && self.expected.is_none()
            && self.prefix.is_none()
            && self.marker.is_none()
        {
            self.expected = response
                .header_str(OBJECT_COUNT)
                .and_then(|count| count.parse().ok());
        }
        let body = response.bytes().await?;
        let entries: Vec<ObjectEntry> = if body.iter().all(u8::is_ascii_whitespace) {
            Vec::new()
        } else {
            serde_json::from_slice(&body).map_err(|err| {
                crate::Error::Decode(format!("listing of {}: {err}", self.container))
            })?
        };
        self.yielded += entries.len() as u64;
        if entries.len() < self.page_size
            || self.expected.is_some_and(|expected| self.yielded >= expected)
        {
            self.done = true;
        }
        debug!("listed {} entries of {}", entries.len(), self.container);
        match entries.last() {
            Some(last) => self.marker = Some(last.name.clone()),
            None => {
                self.done = true;
                return Ok(None);
            }
        }
        Ok(Some(entries))
    }

    /// Entries one by one, fetching pages as the consumer advances.
    pub fn into_stream(self) -> BoxStream<'a, Result<ObjectEntry>> {
        futures::stream::try_unfold(self, |mut listing| async move {
            let page = listing.next_page().await?;
            Ok::<_, crate::Error>(page.map(|entries| (entries, listing)))
        })
        .map(|page| match page {
            Ok(entries) => futures::stream::iter(entries.into_iter().map(Ok)).left_stream(),
            Err(err) => futures::stream::once(async move { Err(err) }).right_stream(),
        })
        .flatten()
        .boxed()
    }

    pub async fn collect_all(mut self) -> Result<Vec<ObjectEntry>> {
        let mut all = Vec::new();
        while let Some(page) = self.next_page().await? {
            all.extend(page);
        }
        Ok(all)
    }
}
