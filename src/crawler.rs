//! Registry crawl that discovers `repository:tag` names for top layers
//!
//! Two fan-out phases share one permit pool: tag listing per repository,
//! then a manifest fetch per (repository, tag). Each phase has a producer
//! task that dispatches workers and a single aggregator (the caller of
//! [`Crawler::crawl`]) reading results from a bounded channel. The first
//! error ends the crawl. Workers already dispatched are not cancelled; the
//! producer stops dispatching new ones once the aggregator is gone.

use anyhow::{Context, Result};
use std::collections::HashSet;
use std::future::Future;
use std::path::Path;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::{mpsc, Semaphore};
use tokio::task::JoinSet;
use tracing::{debug, info};

use crate::knowledge::{self, LayerNameEntry};
use crate::registry::{RegistryApi, RegistryError};

pub const DEFAULT_CONCURRENCY: usize = 16;

const TAG_CHANNEL_CAPACITY: usize = 16;
const MANIFEST_CHANNEL_CAPACITY: usize = 64;

#[derive(Debug, Clone)]
pub struct CrawlOptions {
    /// Keep repositories starting with any of these; empty keeps all
    pub prefixes: Vec<String>,
    pub concurrency: usize,
    /// `repository:tag` names whose manifests are not fetched
    pub skip_names: HashSet<String>,
    pub skip_tag_prefixes: Vec<String>,
}

impl Default for CrawlOptions {
    fn default() -> Self {
        CrawlOptions {
            prefixes: Vec::new(),
            concurrency: DEFAULT_CONCURRENCY,
            skip_names: HashSet::new(),
            skip_tag_prefixes: Vec::new(),
        }
    }
}

impl CrawlOptions {
    fn skips(&self, repository: &str, tag: &str) -> bool {
        self.skip_tag_prefixes.iter().any(|prefix| tag.starts_with(prefix.as_str()))
            || self.skip_names.contains(&format!("{}:{}", repository, tag))
    }
}

/// Split a comma-separated prefix list, dropping empty items
pub fn parse_prefixes(arg: &str) -> Vec<String> {
    arg.split(',')
        .map(str::trim)
        .filter(|p| !p.is_empty())
        .map(String::from)
        .collect()
}

pub struct Crawler<A> {
    api: Arc<A>,
    options: CrawlOptions,
    permits: Arc<Semaphore>,
}

impl<A: RegistryApi + 'static> Crawler<A> {
    pub fn new(api: A, options: CrawlOptions) -> Self {
        let permits = Arc::new(Semaphore::new(options.concurrency.max(1)));
        Crawler {
            api: Arc::new(api),
            options,
            permits,
        }
    }

    /// Catalog listing with the prefix filter applied
    pub async fn repositories(&self) -> Result<Vec<String>, RegistryError> {
        let mut repositories = self.api.catalog().await?;
        if !self.options.prefixes.is_empty() {
            repositories.retain(|repo| self.options.prefixes.iter().any(|p| repo.starts_with(p.as_str())));
        }
        Ok(repositories)
    }

    /// Run both phases, returning one entry per fetched tag
    pub async fn crawl(&self) -> Result<Vec<LayerNameEntry>, RegistryError> {
        let repositories = self.repositories().await?;
        info!(count = repositories.len(), "listing tags");

        let api = Arc::clone(&self.api);
        let mut tag_results = fan_out(
            Arc::clone(&self.permits),
            TAG_CHANNEL_CAPACITY,
            repositories,
            move |repository: String| {
                let api = Arc::clone(&api);
                async move { api.tags(&repository).await }
            },
        );

        let mut targets = Vec::new();
        while let Some(result) = tag_results.recv().await {
            let repo = result?;
            debug!(repository = %repo.name, tags = repo.tags().len(), "tags listed");
            for tag in repo.tags() {
                if self.options.skips(&repo.name, tag) {
                    debug!(repository = %repo.name, tag = %tag, "skipping");
                    continue;
                }
                targets.push((repo.name.clone(), tag.clone()));
            }
        }

        info!(count = targets.len(), "fetching manifests");

        let api = Arc::clone(&self.api);
        let mut layer_results = fan_out(
            Arc::clone(&self.permits),
            MANIFEST_CHANNEL_CAPACITY,
            targets,
            move |(repository, tag): (String, String)| {
                let api = Arc::clone(&api);
                async move {
                    let hash = api.top_layer(&repository, &tag).await?;
                    Ok(LayerNameEntry {
                        hash,
                        name: format!("{}:{}", repository, tag),
                    })
                }
            },
        );

        let mut entries = Vec::new();
        while let Some(result) = layer_results.recv().await {
            entries.push(result?);
        }

        info!(count = entries.len(), "crawl finished");
        Ok(entries)
    }
}

/// Spawn a producer that runs `work` on every item under the shared permit
/// pool and streams results back. The channel closes once every dispatched
/// worker has finished.
fn fan_out<I, T, F, Fut>(
    permits: Arc<Semaphore>,
    capacity: usize,
    items: Vec<I>,
    work: F,
) -> mpsc::Receiver<Result<T, RegistryError>>
where
    I: Send + 'static,
    T: Send + 'static,
    F: Fn(I) -> Fut + Send + Sync + 'static,
    Fut: Future<Output = Result<T, RegistryError>> + Send + 'static,
{
    let (tx, rx) = mpsc::channel(capacity);

    tokio::spawn(async move {
        let mut workers = JoinSet::new();

        for item in items {
            if tx.is_closed() {
                debug!("aggregator gone, no further dispatch");
                break;
            }
            let permit = match Arc::clone(&permits).acquire_owned().await {
                Ok(permit) => permit,
                Err(_) => break,
            };
            let tx = tx.clone();
            let job = work(item);
            workers.spawn(async move {
                let result = job.await;
                drop(permit);
                // receiver may already be dropped after an earlier error
                let _ = tx.send(result).await;
            });
        }

        while let Some(joined) = workers.join_next().await {
            if let Err(err) = joined {
                let _ = tx.send(Err(RegistryError::Worker(err.to_string()))).await;
            }
        }
    });

    rx
}

/// Crawl, then write `existing` plus the new entries to `path`. Nothing is
/// written unless the whole crawl succeeds. Returns the number of entries
/// saved.
pub async fn fetch_and_save<A: RegistryApi + 'static>(
    crawler: &Crawler<A>,
    path: &Path,
    existing: Vec<LayerNameEntry>,
    timeout: Option<Duration>,
) -> Result<usize> {
    let crawled = match timeout {
        Some(limit) => tokio::time::timeout(limit, crawler.crawl())
            .await
            .with_context(|| format!("crawl did not finish within {}s", limit.as_secs_f64()))?,
        None => crawler.crawl().await,
    }
    .context("registry crawl failed")?;

    let crawled_count = crawled.len();
    let entries = knowledge::merge_entries(existing, crawled);
    knowledge::save_entries(path, &entries)?;
    info!(path = %path.display(), crawled = crawled_count, total = entries.len(), "known layers saved");

    Ok(entries.len())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::registry::Repo;
    use async_trait::async_trait;
    use std::collections::HashMap;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::sync::Mutex;
    use tempfile::TempDir;

    #[derive(Default)]
    struct FakeRegistry {
        repositories: Vec<String>,
        tags: HashMap<String, Vec<String>>,
        failing_repository: Option<String>,
        failing_manifest: Option<(String, String)>,
        delay: Option<Duration>,
        in_flight: AtomicUsize,
        peak: AtomicUsize,
        tag_calls: Mutex<Vec<String>>,
        manifest_calls: Mutex<Vec<String>>,
    }

    impl FakeRegistry {
        /// `(repository, space-separated tags)` pairs
        fn with(repos: &[(&str, &str)]) -> Self {
            FakeRegistry {
                repositories: repos.iter().map(|(name, _)| name.to_string()).collect(),
                tags: repos
                    .iter()
                    .map(|(name, tags)| (name.to_string(), tags.split_whitespace().map(String::from).collect()))
                    .collect(),
                ..Default::default()
            }
        }

        async fn enter(&self) {
            let now = self.in_flight.fetch_add(1, Ordering::SeqCst) + 1;
            self.peak.fetch_max(now, Ordering::SeqCst);
            if let Some(delay) = self.delay {
                tokio::time::sleep(delay).await;
            } else {
                tokio::task::yield_now().await;
            }
            self.in_flight.fetch_sub(1, Ordering::SeqCst);
        }
    }

    #[async_trait]
    impl RegistryApi for FakeRegistry {
        async fn catalog(&self) -> Result<Vec<String>, RegistryError> {
            Ok(self.repositories.clone())
        }

        async fn tags(&self, repository: &str) -> Result<Repo, RegistryError> {
            self.tag_calls.lock().unwrap().push(repository.to_string());
            self.enter().await;
            if self.failing_repository.as_deref() == Some(repository) {
                return Err(RegistryError::Status {
                    url: format!("fake/v2/{}/tags/list", repository),
                    status: 500,
                });
            }
            Ok(Repo {
                name: repository.to_string(),
                tags: self.tags.get(repository).cloned(),
            })
        }

        async fn top_layer(&self, repository: &str, tag: &str) -> Result<String, RegistryError> {
            self.manifest_calls.lock().unwrap().push(format!("{}:{}", repository, tag));
            self.enter().await;
            if let Some((failing_repository, failing_tag)) = &self.failing_manifest {
                if failing_repository == repository && failing_tag == tag {
                    return Err(RegistryError::NoLayers {
                        repository: repository.to_string(),
                        tag: tag.to_string(),
                    });
                }
            }
            Ok(format!("top-{}-{}", repository, tag))
        }
    }

    fn sorted_names(entries: &[LayerNameEntry]) -> Vec<String> {
        let mut names: Vec<String> = entries.iter().map(|e| e.name.clone()).collect();
        names.sort();
        names
    }

    #[test]
    fn test_parse_prefixes() {
        assert_eq!(parse_prefixes("a, b,,c "), vec!["a", "b", "c"]);
        assert!(parse_prefixes("").is_empty());
    }

    #[tokio::test]
    async fn test_prefix_filter_limits_tag_fetches() {
        let fake = FakeRegistry::with(&[("a", "1"), ("b", "2")]);
        let crawler = Crawler::new(
            fake,
            CrawlOptions {
                prefixes: vec!["a".into()],
                ..Default::default()
            },
        );

        let entries = crawler.crawl().await.unwrap();
        assert_eq!(*crawler.api.tag_calls.lock().unwrap(), vec!["a"]);
        assert_eq!(sorted_names(&entries), vec!["a:1"]);
    }

    #[tokio::test]
    async fn test_empty_prefix_list_keeps_all() {
        let fake = FakeRegistry::with(&[("a", ""), ("b", "")]);
        let crawler = Crawler::new(fake, CrawlOptions::default());
        assert_eq!(crawler.repositories().await.unwrap(), vec!["a", "b"]);
    }

    #[tokio::test]
    async fn test_entries_name_top_layers() {
        let fake = FakeRegistry::with(&[("lib/base", "1 2"), ("app", "latest")]);
        let crawler = Crawler::new(fake, CrawlOptions::default());

        let entries = crawler.crawl().await.unwrap();
        assert_eq!(sorted_names(&entries), vec!["app:latest", "lib/base:1", "lib/base:2"]);
        let app = entries.iter().find(|e| e.name == "app:latest").unwrap();
        assert_eq!(app.hash, "top-app-latest");
    }

    #[tokio::test]
    async fn test_repository_without_tags() {
        let mut fake = FakeRegistry::with(&[("empty", "")]);
        fake.tags.clear();
        let crawler = Crawler::new(fake, CrawlOptions::default());
        assert!(crawler.crawl().await.unwrap().is_empty());
    }

    #[tokio::test]
    async fn test_skip_known_and_tag_prefixes() {
        let fake = FakeRegistry::with(&[("a", "1 2 sha256-abc.sig")]);
        let crawler = Crawler::new(
            fake,
            CrawlOptions {
                skip_names: HashSet::from(["a:1".to_string()]),
                skip_tag_prefixes: vec!["sha256-".into()],
                ..Default::default()
            },
        );

        let entries = crawler.crawl().await.unwrap();
        assert_eq!(sorted_names(&entries), vec!["a:2"]);
        assert_eq!(*crawler.api.manifest_calls.lock().unwrap(), vec!["a:2"]);
    }

    #[tokio::test]
    async fn test_concurrency_cap_is_respected() {
        let names: Vec<String> = (0..12).map(|i| format!("repo{}", i)).collect();
        let repos: Vec<(&str, &str)> = names.iter().map(|name| (name.as_str(), "1 2")).collect();
        let mut fake = FakeRegistry::with(&repos);
        fake.delay = Some(Duration::from_millis(5));

        let crawler = Crawler::new(
            fake,
            CrawlOptions {
                concurrency: 3,
                ..Default::default()
            },
        );
        let entries = crawler.crawl().await.unwrap();

        assert_eq!(entries.len(), 24);
        let peak = crawler.api.peak.load(Ordering::SeqCst);
        assert!(peak <= 3, "peak in-flight was {}", peak);
        assert!(peak >= 1);
    }

    #[tokio::test]
    async fn test_tag_failure_aborts_without_saving() {
        let temp_dir = TempDir::new().unwrap();
        let path = temp_dir.path().join("known-layers.json");

        let mut fake = FakeRegistry::with(&[("a", "1"), ("b", "2")]);
        fake.failing_repository = Some("b".into());
        let crawler = Crawler::new(fake, CrawlOptions::default());

        let err = fetch_and_save(&crawler, &path, Vec::new(), None).await.unwrap_err();
        assert!(format!("{:#}", err).contains("bad status code 500"));
        assert!(!path.exists());
    }

    #[tokio::test]
    async fn test_manifest_failure_aborts_without_saving() {
        let temp_dir = TempDir::new().unwrap();
        let path = temp_dir.path().join("known-layers.json");
        let existing = vec![LayerNameEntry {
            hash: "old".into(),
            name: "old:1".into(),
        }];
        knowledge::save_entries(&path, &existing).unwrap();
        let before = std::fs::read_to_string(&path).unwrap();

        let mut fake = FakeRegistry::with(&[("a", "1 2"), ("b", "3")]);
        fake.failing_manifest = Some(("a".into(), "2".into()));
        let crawler = Crawler::new(fake, CrawlOptions::default());

        let err = fetch_and_save(&crawler, &path, existing, None).await.unwrap_err();
        assert!(format!("{:#}", err).contains("manifest a:2 has no layers"));
        assert_eq!(std::fs::read_to_string(&path).unwrap(), before);
    }

    #[tokio::test]
    async fn test_fetch_and_save_merges_existing() {
        let temp_dir = TempDir::new().unwrap();
        let path = temp_dir.path().join("cache").join("known-layers.json");

        let existing = vec![
            LayerNameEntry {
                hash: "old".into(),
                name: "old:1".into(),
            },
            LayerNameEntry {
                hash: "top-a-1".into(),
                name: "a:1".into(),
            },
        ];
        let crawler = Crawler::new(FakeRegistry::with(&[("a", "1 2")]), CrawlOptions::default());

        let saved = fetch_and_save(&crawler, &path, existing, None).await.unwrap();
        assert_eq!(saved, 3);

        let loaded = knowledge::load_entries(&path).unwrap();
        assert_eq!(loaded[0].name, "old:1");
        assert_eq!(sorted_names(&loaded), vec!["a:1", "a:2", "old:1"]);
    }

    #[tokio::test]
    async fn test_timeout_bounds_the_wait() {
        let temp_dir = TempDir::new().unwrap();
        let path = temp_dir.path().join("known-layers.json");

        let mut fake = FakeRegistry::with(&[("a", "1")]);
        fake.delay = Some(Duration::from_millis(500));
        let crawler = Crawler::new(fake, CrawlOptions::default());

        let result = fetch_and_save(&crawler, &path, Vec::new(), Some(Duration::from_millis(10))).await;
        assert!(result.is_err());
        assert!(!path.exists());
    }
}
