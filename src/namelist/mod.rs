//! Reloadable domain-name sources.
//!
//! A group's `from` entries become [`NameItem`]s: local files re-read on the
//! `path_reload` interval and HTTP(S) lists refetched on the `url_reload`
//! interval. Each item owns the domain set produced by its last successful
//! load; failed loads keep the previous snapshot, so a broken file or an
//! unreachable mirror never blanks the match set. Readers see swaps
//! atomically through `arc-swap`.

use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

use arc_swap::ArcSwap;
use futures::{stream, FutureExt, StreamExt};
use reqwest::Client;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{debug, warn};
use url::Url;

use crate::domain::DomainSet;

pub(crate) const DEFAULT_PATH_RELOAD: Duration = Duration::from_secs(2);
pub(crate) const MIN_PATH_RELOAD: Duration = Duration::from_secs(1);
pub(crate) const DEFAULT_URL_RELOAD: Duration = Duration::from_secs(300);
pub(crate) const MIN_URL_RELOAD: Duration = Duration::from_secs(10);
pub(crate) const DEFAULT_URL_READ_TIMEOUT: Duration = Duration::from_secs(30);
pub(crate) const MIN_URL_READ_TIMEOUT: Duration = Duration::from_secs(3);

// A slow URL fetch must not delay the others more than necessary.
const URL_FETCH_CONCURRENCY: usize = 4;

/// Where one reloadable set of names comes from.
#[derive(Debug, Clone)]
pub enum NameSource {
    Path(PathBuf),
    Url(Url),
}

/// One source plus the domain set from its last successful load.
pub struct NameItem {
    source: NameSource,
    set: ArcSwap<DomainSet>,
}

impl NameItem {
    pub fn new(source: NameSource) -> Self {
        Self {
            source,
            set: ArcSwap::from_pointee(DomainSet::new()),
        }
    }

    pub fn source(&self) -> &NameSource {
        &self.source
    }

    pub fn matches(&self, name: &str) -> bool {
        self.set.load().matches(name)
    }

    fn store(&self, set: DomainSet) {
        self.set.store(Arc::new(set));
    }
}

/// Ordered collection of name items with their reload schedules.
pub struct NameList {
    items: Vec<Arc<NameItem>>,
    path_reload: Duration,
    url_reload: Duration,
    url_read_timeout: Duration,
    client: Client,
}

impl NameList {
    pub fn new(
        sources: Vec<NameSource>,
        path_reload: Duration,
        url_reload: Duration,
        url_read_timeout: Duration,
    ) -> Self {
        Self {
            items: sources
                .into_iter()
                .map(|s| Arc::new(NameItem::new(s)))
                .collect(),
            path_reload,
            url_reload,
            url_read_timeout,
            client: Client::builder()
                .user_agent("DnsRelay/1.0")
                .build()
                .unwrap(),
        }
    }

    pub fn items(&self) -> &[Arc<NameItem>] {
        &self.items
    }

    pub fn has_path_items(&self) -> bool {
        self.items
            .iter()
            .any(|i| matches!(i.source, NameSource::Path(_)))
    }

    pub fn has_url_items(&self) -> bool {
        self.items
            .iter()
            .any(|i| matches!(i.source, NameSource::Url(_)))
    }

    /// True iff any item's current set matches `name`.
    pub fn matches(&self, name: &str) -> bool {
        self.items.iter().any(|item| item.matches(name))
    }

    /// Loads every item once, right now. Called at group start so Match
    /// works before the first ticker fires.
    pub async fn refresh(&self) {
        self.reload_paths().await;
        self.reload_urls().await;
    }

    /// Re-reads every path item.
    pub async fn reload_paths(&self) {
        for item in &self.items {
            let NameSource::Path(path) = &item.source else {
                continue;
            };
            match tokio::fs::read_to_string(path).await {
                Ok(text) => {
                    let set = parse_list(&text);
                    debug!("loaded {} name(s) from {}", set.len(), path.display());
                    item.store(set);
                }
                Err(err) => {
                    warn!(
                        "failed to read {}: {}, keeping previous names",
                        path.display(),
                        err
                    );
                }
            }
        }
    }

    /// Refetches every URL item, a few at a time.
    pub async fn reload_urls(&self) {
        let url_items: Vec<&Arc<NameItem>> = self
            .items
            .iter()
            .filter(|i| matches!(i.source, NameSource::Url(_)))
            .collect();
        let fetches: Vec<_> = url_items
            .into_iter()
            .map(|item| self.refresh_url(item).boxed())
            .collect();
        stream::iter(fetches)
            .buffer_unordered(URL_FETCH_CONCURRENCY)
            .collect::<Vec<()>>()
            .await;
    }

    async fn refresh_url(&self, item: &NameItem) {
        let NameSource::Url(url) = &item.source else {
            return;
        };

        let resp = match self
            .client
            .get(url.clone())
            .timeout(self.url_read_timeout)
            .send()
            .await
        {
            Ok(resp) => resp,
            Err(err) => {
                warn!("failed to fetch {url}: {err}, keeping previous names");
                return;
            }
        };
        if !resp.status().is_success() {
            warn!(
                "fetching {url} returned {}, keeping previous names",
                resp.status()
            );
            return;
        }

        match resp.text().await {
            Ok(text) => {
                let set = parse_list(&text);
                debug!("loaded {} name(s) from {url}", set.len());
                item.store(set);
            }
            Err(err) => {
                warn!("failed to read body from {url}: {err}, keeping previous names");
            }
        }
    }

    /// Spawns the path and URL reload tickers. The two run independently so
    /// a slow fetch cannot delay a cheap file read. Tickers whose interval
    /// is zero, or that have no items of their kind, are never started.
    pub(crate) fn start(self: &Arc<Self>, cancel: &CancellationToken) -> Vec<JoinHandle<()>> {
        let mut tasks = Vec::new();

        if !self.path_reload.is_zero() && self.has_path_items() {
            let list = Arc::clone(self);
            let cancel = cancel.clone();
            tasks.push(tokio::spawn(async move {
                let mut ticker = tokio::time::interval(list.path_reload);
                ticker.tick().await;
                loop {
                    tokio::select! {
                        _ = ticker.tick() => list.reload_paths().await,
                        _ = cancel.cancelled() => return,
                    }
                }
            }));
        }

        if !self.url_reload.is_zero() && self.has_url_items() {
            let list = Arc::clone(self);
            let cancel = cancel.clone();
            tasks.push(tokio::spawn(async move {
                let mut ticker = tokio::time::interval(list.url_reload);
                ticker.tick().await;
                loop {
                    tokio::select! {
                        _ = ticker.tick() => list.reload_urls().await,
                        _ = cancel.cancelled() => return,
                    }
                }
            }));
        }

        tasks
    }
}

/// Parses a name-list body: one domain per line, `#` comments and blank
/// lines ignored. Trailing tokens after whitespace are comments too.
pub(crate) fn parse_list(text: &str) -> DomainSet {
    let mut set = DomainSet::new();
    let mut skipped = 0usize;
    for line in text.lines() {
        let line = line.trim();
        if line.is_empty() || line.starts_with('#') {
            continue;
        }
        let Some(domain) = line.split_whitespace().next() else {
            continue;
        };
        if !set.add(domain) {
            skipped += 1;
        }
    }
    if skipped > 0 {
        debug!("skipped {skipped} line(s) that aren't domain names");
    }
    set
}
