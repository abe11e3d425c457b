//! Query result cache keyed by normalized expression
//!
//! Entries expire after a TTL and are dropped early when a file changes
//! inside one of the packages the entry depends on. Failures are never
//! stored, so a failed query is retried by the next caller.
//!
//! A fetch records the cache generation before it starts. Its result is
//! only stored if no overlapping invalidation happened while it ran.

use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, LazyLock, Mutex, MutexGuard};
use std::time::{Duration, Instant};

use dashmap::DashMap;
use regex::Regex;
use serde::Serialize;

static LABEL_PATTERN: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(r"(@{1,2}[\w.~+-]*)?//([\w./+-]*)").expect("Invalid label pattern regex")
});

/// A cached value with the packages it was derived from.
#[derive(Debug, Clone)]
pub struct CacheEntry<V> {
    pub value: V,
    pub fetched_at: Instant,
    /// Package prefixes; `""` means the whole workspace.
    pub packages: Vec<String>,
}

impl<V> CacheEntry<V> {
    pub fn is_expired(&self, ttl: Duration) -> bool {
        self.fetched_at.elapsed() >= ttl
    }

    fn depends_on(&self, package: &str) -> bool {
        self.packages.iter().any(|p| package_contains(p, package))
    }
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
pub struct CacheStats {
    pub entries: usize,
    pub hits: u64,
    pub misses: u64,
    pub invalidations: u64,
}

/// Concurrent TTL cache with package-scoped invalidation and a per-key
/// in-flight lock so identical concurrent fetches can share one result.
pub struct QueryCache<V> {
    entries: DashMap<String, CacheEntry<V>>,
    in_flight: DashMap<String, Arc<tokio::sync::Mutex<()>>>,
    /// Newest invalidation generation per package; `""` is a full clear.
    invalidated: Mutex<HashMap<String, u64>>,
    generation: AtomicU64,
    ttl: Duration,
    hits: AtomicU64,
    misses: AtomicU64,
    invalidations: AtomicU64,
}

impl<V> std::fmt::Debug for QueryCache<V> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("QueryCache")
            .field("entries", &self.entries.len())
            .field("ttl", &self.ttl)
            .finish()
    }
}

impl<V: Clone> QueryCache<V> {
    pub fn new(ttl: Duration) -> Self {
        QueryCache {
            entries: DashMap::new(),
            in_flight: DashMap::new(),
            invalidated: Mutex::new(HashMap::new()),
            generation: AtomicU64::new(0),
            ttl,
            hits: AtomicU64::new(0),
            misses: AtomicU64::new(0),
            invalidations: AtomicU64::new(0),
        }
    }

    pub fn ttl(&self) -> Duration {
        self.ttl
    }

    /// Fresh value for `key`, evicting it if it has expired.
    pub fn get(&self, key: &str) -> Option<V> {
        let fresh = self
            .entries
            .get(key)
            .map(|entry| (!entry.is_expired(self.ttl)).then(|| entry.value.clone()));
        match fresh {
            Some(Some(value)) => {
                self.hits.fetch_add(1, Ordering::Relaxed);
                Some(value)
            }
            Some(None) => {
                self.entries.remove_if(key, |_, e| e.is_expired(self.ttl));
                self.misses.fetch_add(1, Ordering::Relaxed);
                None
            }
            None => {
                self.misses.fetch_add(1, Ordering::Relaxed);
                None
            }
        }
    }

    pub fn insert(&self, key: impl Into<String>, value: V, packages: Vec<String>) {
        let packages = if packages.is_empty() { vec![String::new()] } else { packages };
        self.entries.insert(
            key.into(),
            CacheEntry { value, fetched_at: Instant::now(), packages },
        );
    }

    /// Generation to hand to [`QueryCache::insert_since`] once a fetch
    /// started now completes.
    pub fn generation(&self) -> u64 {
        self.generation.load(Ordering::SeqCst)
    }

    /// Store a value fetched since `generation`, unless one of its packages
    /// was invalidated in the meantime. Returns whether it was stored.
    pub fn insert_since(&self, key: impl Into<String>, value: V, packages: Vec<String>, generation: u64) -> bool {
        let invalidated = self.invalidation_log();
        let stale = invalidated.iter().any(|(package, &at)| {
            at > generation && (packages.is_empty() || packages.iter().any(|p| overlaps(p, package)))
        });
        if stale {
            let key = key.into();
            tracing::debug!("Not caching '{}': invalidated while in flight", key);
            return false;
        }
        self.insert(key, value, packages);
        true
    }

    /// Lock serializing fetches of one key. Callers re-check `get` after
    /// acquiring it.
    pub fn in_flight_lock(&self, key: &str) -> Arc<tokio::sync::Mutex<()>> {
        self.in_flight
            .entry(key.to_string())
            .or_insert_with(|| Arc::new(tokio::sync::Mutex::new(())))
            .clone()
    }

    /// Drop the in-flight lock for `key` once nobody else holds a handle.
    pub fn release_in_flight(&self, key: &str) {
        self.in_flight.remove_if(key, |_, lock| Arc::strong_count(lock) <= 1);
    }

    /// Drop every entry depending on `package` (a package or a directory
    /// path relative to the workspace root). Returns how many were dropped.
    pub fn invalidate_package(&self, package: &str) -> usize {
        let mut invalidated = self.invalidation_log();
        let at = self.generation.fetch_add(1, Ordering::SeqCst) + 1;
        invalidated.insert(package.to_string(), at);
        let before = self.entries.len();
        self.entries.retain(|_, entry| !entry.depends_on(package));
        let dropped = before.saturating_sub(self.entries.len());
        if dropped > 0 {
            self.invalidations.fetch_add(dropped as u64, Ordering::Relaxed);
            tracing::debug!("Invalidated {} cached queries for package '{}'", dropped, package);
        }
        dropped
    }

    pub fn clear(&self) {
        let mut invalidated = self.invalidation_log();
        let at = self.generation.fetch_add(1, Ordering::SeqCst) + 1;
        invalidated.clear();
        invalidated.insert(String::new(), at);
        self.entries.clear();
    }

    fn invalidation_log(&self) -> MutexGuard<'_, HashMap<String, u64>> {
        self.invalidated.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    pub fn stats(&self) -> CacheStats {
        CacheStats {
            entries: self.entries.len(),
            hits: self.hits.load(Ordering::Relaxed),
            misses: self.misses.load(Ordering::Relaxed),
            invalidations: self.invalidations.load(Ordering::Relaxed),
        }
    }
}

/// Canonical cache key: runs of whitespace collapse to one space and
/// spaces next to parentheses and commas are removed.
pub fn normalize_query(expression: &str) -> String {
    let collapsed = expression.split_whitespace().collect::<Vec<_>>().join(" ");
    let mut out = String::with_capacity(collapsed.len());
    let chars: Vec<char> = collapsed.chars().collect();
    for (i, &c) in chars.iter().enumerate() {
        if c == ' ' {
            let prev = i.checked_sub(1).map(|j| chars[j]);
            let next = chars.get(i + 1).copied();
            let tight = |ch: Option<char>| matches!(ch, Some('(' | ')' | ','));
            if tight(prev) || tight(next) {
                continue;
            }
        }
        out.push(c);
    }
    out
}

/// Packages named by label patterns in a query expression. `//a/...` yields
/// `a`; `//...` yields the whole workspace. External-repository patterns
/// are ignored. An expression without patterns depends on everything.
pub fn expression_packages(expression: &str) -> Vec<String> {
    let mut packages: Vec<String> = LABEL_PATTERN
        .captures_iter(expression)
        .filter(|caps| caps.get(1).is_none())
        .filter_map(|caps| caps.get(2))
        .map(|m| {
            let raw = m.as_str();
            let trimmed = raw.strip_suffix("...").unwrap_or(raw);
            trimmed.trim_end_matches('/').to_string()
        })
        .collect();
    if packages.is_empty() && !LABEL_PATTERN.is_match(expression) {
        packages.push(String::new());
    }
    packages.sort();
    packages.dedup();
    packages
}

/// True if either package contains the other.
fn overlaps(a: &str, b: &str) -> bool {
    package_contains(a, b) || package_contains(b, a)
}

/// True if `candidate` is `package` itself or lies beneath it.
pub fn package_contains(package: &str, candidate: &str) -> bool {
    package.is_empty()
        || candidate == package
        || candidate
            .strip_prefix(package)
            .is_some_and(|rest| rest.starts_with('/'))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_normalize_query() {
        assert_eq!(normalize_query("deps( //a:b )"), "deps(//a:b)");
        assert_eq!(normalize_query("  deps(//a:b,\n 2)  "), "deps(//a:b,2)");
        assert_eq!(
            normalize_query("kind(go_test,   //...)  except //x/..."),
            "kind(go_test,//...) except //x/..."
        );
    }

    #[test]
    fn test_expression_packages() {
        assert_eq!(expression_packages("deps(//app/server:main)"), vec!["app/server"]);
        assert_eq!(expression_packages("//lib/..."), vec!["lib"]);
        assert_eq!(expression_packages("//..."), vec![""]);
        assert_eq!(expression_packages("kind(rule, set())"), vec![""]);
        assert!(expression_packages("@ext//foo:bar").is_empty());
        assert_eq!(
            expression_packages("rdeps(//a/..., //b:c)"),
            vec!["a".to_string(), "b".to_string()]
        );
    }

    #[test]
    fn test_package_contains() {
        assert!(package_contains("", "anything"));
        assert!(package_contains("a", "a"));
        assert!(package_contains("a", "a/b"));
        assert!(!package_contains("a", "ab"));
        assert!(!package_contains("a/b", "a"));
    }

    #[test]
    fn test_hit_and_expiry() {
        let cache: QueryCache<u32> = QueryCache::new(Duration::from_millis(30));
        cache.insert("q", 7, vec!["a".to_string()]);
        assert_eq!(cache.get("q"), Some(7));

        std::thread::sleep(Duration::from_millis(40));
        assert_eq!(cache.get("q"), None);
        assert!(cache.is_empty());

        let stats = cache.stats();
        assert_eq!(stats.hits, 1);
        assert_eq!(stats.misses, 1);
    }

    #[test]
    fn test_invalidate_by_subtree() {
        let cache: QueryCache<u32> = QueryCache::new(Duration::from_secs(60));
        cache.insert("a", 1, vec!["app".to_string()]);
        cache.insert("b", 2, vec!["lib".to_string()]);
        cache.insert("all", 3, vec![]);

        assert_eq!(cache.invalidate_package("app/server"), 2);
        assert_eq!(cache.get("a"), None);
        assert_eq!(cache.get("all"), None);
        assert_eq!(cache.get("b"), Some(2));
    }

    #[test]
    fn test_invalidation_during_fetch_blocks_insert() {
        let cache: QueryCache<u32> = QueryCache::new(Duration::from_secs(60));

        let started = cache.generation();
        cache.invalidate_package("app");
        assert!(!cache.insert_since("deps(//app:x)", 1, vec!["app".to_string()], started));
        assert_eq!(cache.get("deps(//app:x)"), None);

        // Unrelated packages and later fetches are unaffected.
        assert!(cache.insert_since("deps(//lib:y)", 2, vec!["lib".to_string()], started));
        assert!(cache.insert_since("deps(//app:x)", 3, vec!["app".to_string()], cache.generation()));
        assert_eq!(cache.get("deps(//app:x)"), Some(3));

        // A nested change counts for the enclosing pattern.
        let started = cache.generation();
        cache.invalidate_package("lib/strings");
        assert!(!cache.insert_since("//lib/...", 4, vec!["lib".to_string()], started));

        let started = cache.generation();
        cache.clear();
        assert!(!cache.insert_since("deps(//lib:y)", 5, vec!["lib".to_string()], started));
    }

    #[tokio::test]
    async fn test_in_flight_lock_is_shared() {
        let cache: QueryCache<u32> = QueryCache::new(Duration::from_secs(60));
        let first = cache.in_flight_lock("q");
        let second = cache.in_flight_lock("q");
        assert!(Arc::ptr_eq(&first, &second));

        let guard = first.lock().await;
        assert!(second.try_lock().is_err());
        drop(guard);
        drop(first);
        drop(second);
        cache.release_in_flight("q");
        assert!(cache.in_flight.is_empty());
    }
}
