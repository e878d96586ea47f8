use crate::error::StoreResult;
use serde::{Deserialize, Serialize};
use std::collections::HashSet;
use std::fs;
use std::path::PathBuf;
use std::sync::{Arc, Mutex, PoisonError, RwLock};
use tracing::{debug, error, info, warn};
use url::Url;

/// Provider error text meaning "we will never scrape this site".
pub const NOT_SUPPORTED_PATTERNS: &[&str] = &[
    "not currently supported",
    "this website is not currently supported",
    "please reach out to help@firecrawl.com",
    "website not supported",
];

pub const DEFAULT_BLOCK_REASON: &str = "Not supported by extraction provider";

pub trait BlockedDomainStore: Send + Sync {
    fn load_blocked_domains(&self) -> StoreResult<HashSet<String>>;
    fn insert_blocked_domain(&self, domain: &str, reason: &str) -> StoreResult<()>;
}

#[derive(Debug, Serialize, Deserialize)]
struct BlockedDomainsCache {
    blocked_domains: Vec<String>,
    #[serde(default)]
    count: usize,
    #[serde(default)]
    description: String,
}

/// Domains the provider refuses to scrape, shared by all workers.
pub struct DomainBlocker {
    domains: RwLock<HashSet<String>>,
    write_lock: Mutex<()>,
    store: Option<Arc<dyn BlockedDomainStore>>,
    cache_path: Option<PathBuf>,
    dry_run: bool,
}

impl DomainBlocker {
    pub fn new(store: Option<Arc<dyn BlockedDomainStore>>, dry_run: bool) -> Self {
        Self {
            domains: RwLock::new(HashSet::new()),
            write_lock: Mutex::new(()),
            store,
            cache_path: None,
            dry_run,
        }
    }

    /// Also read and write a local JSON list of blocked domains.
    pub fn with_cache_path(mut self, path: PathBuf) -> Self {
        self.cache_path = Some(path);
        self
    }

    /// Union of the store and the local cache. Entries only present
    /// locally are pushed to the store unless this is a dry run.
    pub fn load(&self) -> usize {
        let stored = match &self.store {
            Some(store) => match store.load_blocked_domains() {
                Ok(domains) => domains
                    .into_iter()
                    .map(|d| d.trim().to_lowercase())
                    .filter(|d| !d.is_empty())
                    .collect(),
                Err(e) => {
                    warn!("Could not load blocked domains: {}", e);
                    HashSet::new()
                }
            },
            None => HashSet::new(),
        };
        let local = self.read_cache();

        if let Some(store) = self.store.as_ref().filter(|_| !self.dry_run) {
            let missing: Vec<&String> = local.difference(&stored).collect();
            for domain in &missing {
                if let Err(e) = store.insert_blocked_domain(domain, DEFAULT_BLOCK_REASON) {
                    warn!("Failed to sync blocked domain {}: {}", domain, e);
                }
            }
            if !missing.is_empty() {
                info!("Synced {} locally blocked domains to the store", missing.len());
            }
        }

        let mut domains = self.domains.write().unwrap_or_else(PoisonError::into_inner);
        domains.extend(stored);
        domains.extend(local);
        debug!("{} blocked domains loaded", domains.len());
        domains.len()
    }

    fn read_cache(&self) -> HashSet<String> {
        let Some(path) = self.cache_path.as_ref().filter(|p| p.exists()) else {
            return HashSet::new();
        };
        match fs::read_to_string(path)
            .map_err(|e| e.to_string())
            .and_then(|raw| {
                serde_json::from_str::<BlockedDomainsCache>(&raw).map_err(|e| e.to_string())
            })
        {
            Ok(cache) => cache.blocked_domains.into_iter().collect(),
            Err(e) => {
                warn!("Could not read blocked domains cache {}: {}", path.display(), e);
                HashSet::new()
            }
        }
    }

    fn write_cache(&self, domains: &HashSet<String>) {
        let Some(path) = &self.cache_path else {
            return;
        };
        if self.dry_run {
            return;
        }
        let mut sorted: Vec<String> = domains.iter().cloned().collect();
        sorted.sort();
        let cache = BlockedDomainsCache {
            count: sorted.len(),
            blocked_domains: sorted,
            description: "Domains detected as not supported by the extraction provider".to_string(),
        };
        let written = serde_json::to_string_pretty(&cache)
            .map_err(|e| e.to_string())
            .and_then(|json| fs::write(path, json).map_err(|e| e.to_string()));
        if let Err(e) = written {
            error!("Failed to save blocked domains cache: {}", e);
        }
    }

    /// Lowercased host without `www.`.
    pub fn extract_domain(url: &str) -> Option<String> {
        let parsed = Url::parse(url.trim()).ok()?;
        let host = parsed.host_str()?.to_lowercase();
        let domain = host.strip_prefix("www.").unwrap_or(&host).to_string();
        (!domain.is_empty()).then_some(domain)
    }

    pub fn is_not_supported_error(message: &str) -> bool {
        let lower = message.to_lowercase();
        NOT_SUPPORTED_PATTERNS.iter().any(|pattern| lower.contains(pattern))
    }

    pub fn is_blocked(&self, url: &str) -> bool {
        match Self::extract_domain(url) {
            Some(domain) => self
                .domains
                .read()
                .unwrap_or_else(PoisonError::into_inner)
                .contains(&domain),
            None => false,
        }
    }

    /// Returns true if the domain was not blocked before.
    pub fn block_domain(&self, url: &str, reason: &str) -> bool {
        let Some(domain) = Self::extract_domain(url) else {
            return false;
        };

        let _guard = self.write_lock.lock().unwrap_or_else(PoisonError::into_inner);
        let snapshot = {
            let mut domains = self.domains.write().unwrap_or_else(PoisonError::into_inner);
            if !domains.insert(domain.clone()) {
                return false;
            }
            domains.clone()
        };

        match &self.store {
            Some(store) if !self.dry_run => {
                if let Err(e) = store.insert_blocked_domain(&domain, reason) {
                    error!("Failed to persist blocked domain {}: {}", domain, e);
                }
            }
            _ => debug!("Blocked domain {} kept in memory only", domain),
        }
        self.write_cache(&snapshot);
        info!("Blocked domain: {} ({})", domain, reason);
        true
    }

    pub fn blocked_count(&self) -> usize {
        self.domains.read().unwrap_or_else(PoisonError::into_inner).len()
    }

    pub fn blocked_list(&self) -> Vec<String> {
        let mut list: Vec<String> = self
            .domains
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .iter()
            .cloned()
            .collect();
        list.sort();
        list
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    #[derive(Default)]
    struct MemoryStore {
        domains: Mutex<HashSet<String>>,
    }

    impl BlockedDomainStore for MemoryStore {
        fn load_blocked_domains(&self) -> StoreResult<HashSet<String>> {
            Ok(self.domains.lock().unwrap().clone())
        }

        fn insert_blocked_domain(&self, domain: &str, _reason: &str) -> StoreResult<()> {
            self.domains.lock().unwrap().insert(domain.to_string());
            Ok(())
        }
    }

    #[test]
    fn test_extract_domain() {
        assert_eq!(
            DomainBlocker::extract_domain("https://WWW.Reddit.com/r/x"),
            Some("reddit.com".to_string())
        );
        assert_eq!(DomainBlocker::extract_domain("reddit.com"), None);
        assert_eq!(DomainBlocker::extract_domain(""), None);
    }

    #[test]
    fn test_not_supported_patterns() {
        assert!(DomainBlocker::is_not_supported_error(
            "This website is not currently supported, please reach out"
        ));
        assert!(!DomainBlocker::is_not_supported_error("timeout"));
    }

    #[test]
    fn test_block_domain_persists_once() {
        let store = Arc::new(MemoryStore::default());
        let blocker = DomainBlocker::new(Some(store.clone()), false);

        assert!(blocker.block_domain("https://www.reddit.com/a", DEFAULT_BLOCK_REASON));
        assert!(!blocker.block_domain("https://reddit.com/b", DEFAULT_BLOCK_REASON));
        assert!(blocker.is_blocked("http://reddit.com"));
        assert!(!blocker.is_blocked("http://example.com"));
        assert_eq!(store.domains.lock().unwrap().len(), 1);
    }

    #[test]
    fn test_dry_run_keeps_blocks_in_memory() {
        let store = Arc::new(MemoryStore::default());
        let blocker = DomainBlocker::new(Some(store.clone()), true);

        assert!(blocker.block_domain("https://reddit.com", DEFAULT_BLOCK_REASON));
        assert!(blocker.is_blocked("https://reddit.com"));
        assert!(store.domains.lock().unwrap().is_empty());
    }

    #[test]
    fn test_load_unions_and_pushes_local_entries() {
        let temp_dir = TempDir::new().unwrap();
        let cache_path = temp_dir.path().join("blocked_domains.json");
        fs::write(&cache_path, r#"{"blocked_domains": ["local.com"], "count": 1}"#).unwrap();

        let store = Arc::new(MemoryStore::default());
        store.domains.lock().unwrap().insert("remote.com".to_string());

        let blocker =
            DomainBlocker::new(Some(store.clone()), false).with_cache_path(cache_path.clone());
        assert_eq!(blocker.load(), 2);
        assert_eq!(blocker.blocked_list(), vec!["local.com", "remote.com"]);
        assert!(store.domains.lock().unwrap().contains("local.com"));

        blocker.block_domain("https://new.com", DEFAULT_BLOCK_REASON);
        let saved: BlockedDomainsCache =
            serde_json::from_str(&fs::read_to_string(&cache_path).unwrap()).unwrap();
        assert_eq!(saved.count, 3);
        assert_eq!(saved.blocked_domains, vec!["local.com", "new.com", "remote.com"]);
    }
}
