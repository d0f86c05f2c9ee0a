//! Read-through cache of cloned repositories.

use std::collections::HashMap;
use std::path::PathBuf;
use std::sync::Arc;
use std::time::{Duration, Instant};

use tokio::sync::Mutex;
use tracing::debug;

use crate::config::CacheConfig;
use crate::error::ProviderError;
use crate::provider::RepositoryProvider;

/// Canonical identity of a repository URL: host and path, lowercased host,
/// no scheme, credentials or `.git` suffix. The `https` and `ssh` forms of
/// one repository map to the same identity.
pub fn repository_identity(url: &str) -> String {
    let mut rest = url.trim();
    for scheme in ["https://", "http://", "ssh://", "git://", "git+ssh://"] {
        if let Some(stripped) = rest.strip_prefix(scheme) {
            rest = stripped;
            break;
        }
    }
    if let Some((_, after)) = rest.split_once('@') {
        rest = after;
    }

    let (host, path) = match rest.find([':', '/']) {
        Some(i) => (&rest[..i], &rest[i + 1..]),
        None => (rest, ""),
    };
    // `host:22/org/repo` from ssh URLs with a port.
    let path = match path.split_once('/') {
        Some((port, tail)) if !port.is_empty() && port.chars().all(|c| c.is_ascii_digit()) => tail,
        _ => path,
    };
    let path = path.trim_end_matches('/');
    let path = path.strip_suffix(".git").unwrap_or(path);

    format!("{}/{}", host.to_lowercase(), path)
}

#[derive(Debug)]
struct Entry {
    path: PathBuf,
    created: Instant,
    uses: u32,
}

/// Clones once per repository and hands out the same checkout until it is
/// older than `max_age_secs` or has been reused `max_uses` times.
///
/// One async mutex per repository serializes clone and re-clone; different
/// repositories never wait on each other. Expired and invalidated
/// repositories are forgotten.
pub struct CloneCache {
    provider: Arc<dyn RepositoryProvider>,
    max_age: Duration,
    max_uses: u32,
    slots: Mutex<HashMap<String, Arc<Mutex<Option<Entry>>>>>,
}

impl CloneCache {
    pub fn new(provider: Arc<dyn RepositoryProvider>, config: &CacheConfig) -> Self {
        Self {
            provider,
            max_age: Duration::from_secs(config.max_age_secs),
            max_uses: config.max_uses,
            slots: Mutex::new(HashMap::new()),
        }
    }

    fn is_fresh(&self, entry: &Entry) -> bool {
        entry.created.elapsed() < self.max_age && entry.uses < self.max_uses && entry.path.exists()
    }

    /// Local checkout of `url`, cloning when there is no fresh one.
    pub async fn checkout(&self, url: &str) -> Result<PathBuf, ProviderError> {
        let key = repository_identity(url);
        let slot = {
            let mut slots = self.slots.lock().await;
            // Expired entries of other repositories; busy slots are left alone.
            slots.retain(|k, slot| {
                k == &key
                    || slot
                        .try_lock()
                        .map(|entry| match &*entry {
                            Some(e) => self.is_fresh(e),
                            None => true,
                        })
                        .unwrap_or(true)
            });
            slots.entry(key.clone()).or_default().clone()
        };

        let mut entry = slot.lock().await;
        if let Some(cached) = entry.as_mut() {
            if self.is_fresh(cached) {
                cached.uses += 1;
                debug!("Reusing checkout of {} ({} reuses)", key, cached.uses);
                return Ok(cached.path.clone());
            }
            debug!("Checkout of {} expired", key);
        }

        match self.provider.clone_repository(url).await {
            Ok(path) => {
                *entry = Some(Entry {
                    path: path.clone(),
                    created: Instant::now(),
                    uses: 0,
                });
                Ok(path)
            }
            Err(e) => {
                *entry = None;
                drop(entry);
                let mut slots = self.slots.lock().await;
                if slots.get(&key).is_some_and(|s| Arc::ptr_eq(s, &slot)) {
                    slots.remove(&key);
                }
                Err(e)
            }
        }
    }

    /// Forget `url`, e.g. after its checkout was modified.
    pub async fn invalidate(&self, url: &str) {
        let key = repository_identity(url);
        let slot = self.slots.lock().await.remove(&key);
        if let Some(slot) = slot {
            *slot.lock().await = None;
        }
    }

    #[cfg(test)]
    async fn cached_repositories(&self) -> usize {
        self.slots.lock().await.len()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::provider::ChangeRequest;
    use async_trait::async_trait;
    use std::path::Path;
    use std::sync::atomic::{AtomicUsize, Ordering};

    struct CountingProvider {
        root: PathBuf,
        clones: AtomicUsize,
    }

    #[async_trait]
    impl RepositoryProvider for CountingProvider {
        async fn clone_repository(&self, _url: &str) -> Result<PathBuf, ProviderError> {
            let n = self.clones.fetch_add(1, Ordering::SeqCst);
            tokio::time::sleep(Duration::from_millis(20)).await;
            let path = self.root.join(format!("clone-{}", n));
            std::fs::create_dir_all(&path)?;
            Ok(path)
        }

        async fn commit_and_push(&self, _: &Path, _: &str, _: &str, _: &[PathBuf]) -> Result<(), ProviderError> {
            Ok(())
        }

        async fn open_change_request(&self, _: &str, _: &str, _: &str, _: &str) -> Result<ChangeRequest, ProviderError> {
            Err(ProviderError::Unsupported { operation: "test" })
        }
    }

    fn cache(root: &Path, max_uses: u32) -> (Arc<CountingProvider>, CloneCache) {
        let provider = Arc::new(CountingProvider {
            root: root.to_path_buf(),
            clones: AtomicUsize::new(0),
        });
        let config = CacheConfig {
            max_age_secs: 3600,
            max_uses,
        };
        (provider.clone(), CloneCache::new(provider, &config))
    }

    #[test]
    fn test_identity_unifies_url_forms() {
        let expected = "github.com/acme/shop";
        assert_eq!(repository_identity("https://github.com/acme/shop.git"), expected);
        assert_eq!(repository_identity("https://GitHub.com/acme/shop/"), expected);
        assert_eq!(repository_identity("git@github.com:acme/shop.git"), expected);
        assert_eq!(repository_identity("ssh://git@github.com:22/acme/shop.git"), expected);
        assert_eq!(repository_identity("https://token@github.com/acme/shop"), expected);
    }

    #[tokio::test]
    async fn test_concurrent_checkouts_clone_once() {
        let dir = tempfile::tempdir().unwrap();
        let (provider, cache) = cache(dir.path(), 10);
        let (a, b) = tokio::join!(
            cache.checkout("https://github.com/acme/shop.git"),
            cache.checkout("git@github.com:acme/shop.git"),
        );
        assert_eq!(a.unwrap(), b.unwrap());
        assert_eq!(provider.clones.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn test_reclone_after_max_uses() {
        let dir = tempfile::tempdir().unwrap();
        let (provider, cache) = cache(dir.path(), 2);
        let url = "https://github.com/acme/shop";
        let first = cache.checkout(url).await.unwrap();
        assert_eq!(cache.checkout(url).await.unwrap(), first);
        assert_eq!(cache.checkout(url).await.unwrap(), first);
        let fourth = cache.checkout(url).await.unwrap();
        assert_ne!(fourth, first);
        assert_eq!(provider.clones.load(Ordering::SeqCst), 2);
    }

    #[tokio::test]
    async fn test_expired_by_age() {
        let dir = tempfile::tempdir().unwrap();
        let provider = Arc::new(CountingProvider {
            root: dir.path().to_path_buf(),
            clones: AtomicUsize::new(0),
        });
        let config = CacheConfig {
            max_age_secs: 0,
            max_uses: 10,
        };
        let cache = CloneCache::new(provider.clone(), &config);
        cache.checkout("https://github.com/acme/shop").await.unwrap();
        cache.checkout("https://github.com/acme/shop").await.unwrap();
        assert_eq!(provider.clones.load(Ordering::SeqCst), 2);
    }

    #[tokio::test]
    async fn test_invalidate_forces_clone() {
        let dir = tempfile::tempdir().unwrap();
        let (provider, cache) = cache(dir.path(), 10);
        cache.checkout("https://github.com/acme/shop").await.unwrap();
        cache.invalidate("git@github.com:acme/shop.git").await;
        assert_eq!(cache.cached_repositories().await, 0);
        cache.checkout("https://github.com/acme/shop").await.unwrap();
        assert_eq!(provider.clones.load(Ordering::SeqCst), 2);
    }

    #[tokio::test]
    async fn test_expired_repositories_are_forgotten() {
        let dir = tempfile::tempdir().unwrap();
        let provider = Arc::new(CountingProvider {
            root: dir.path().to_path_buf(),
            clones: AtomicUsize::new(0),
        });
        let config = CacheConfig {
            max_age_secs: 0,
            max_uses: 10,
        };
        let cache = CloneCache::new(provider, &config);
        for repo in ["shop", "billing", "search"] {
            cache.checkout(&format!("https://github.com/acme/{}", repo)).await.unwrap();
        }
        assert_eq!(cache.cached_repositories().await, 1);
    }

    #[tokio::test]
    async fn test_failed_clone_is_not_cached() {
        struct Unreachable;
        #[async_trait]
        impl RepositoryProvider for Unreachable {
            async fn clone_repository(&self, url: &str) -> Result<PathBuf, ProviderError> {
                Err(ProviderError::NotFound(url.to_string()))
            }
            async fn commit_and_push(&self, _: &Path, _: &str, _: &str, _: &[PathBuf]) -> Result<(), ProviderError> {
                Ok(())
            }
            async fn open_change_request(&self, _: &str, _: &str, _: &str, _: &str) -> Result<ChangeRequest, ProviderError> {
                Err(ProviderError::Unsupported { operation: "test" })
            }
        }

        let cache = CloneCache::new(Arc::new(Unreachable), &CacheConfig::default());
        assert!(cache.checkout("https://github.com/acme/gone").await.is_err());
        assert_eq!(cache.cached_repositories().await, 0);
    }
}
