//! Per-symbol analysis cache with single-flight recomputation

use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

use tokio::sync::{Mutex, RwLock};
use tokio::time::Instant;

use super::SmcAnalysis;

#[derive(Debug, Clone)]
struct CachedAnalysis {
    analysis: Arc<SmcAnalysis>,
    computed_at: Instant,
}

/// Analyses younger than `ttl` are served without recomputing. Callers that
/// miss take the symbol's flight lock so one pass runs per symbol at a time.
#[derive(Debug)]
pub struct AnalysisCache {
    ttl: Duration,
    entries: RwLock<HashMap<String, CachedAnalysis>>,
    flights: Mutex<HashMap<String, Arc<Mutex<()>>>>,
}

impl AnalysisCache {
    pub fn new(ttl: Duration) -> Self {
        Self {
            ttl,
            entries: RwLock::new(HashMap::new()),
            flights: Mutex::new(HashMap::new()),
        }
    }

    pub fn ttl(&self) -> Duration {
        self.ttl
    }

    /// Fresh entry for `symbol`, if any
    pub async fn get(&self, symbol: &str) -> Option<Arc<SmcAnalysis>> {
        let entries = self.entries.read().await;
        let entry = entries.get(symbol)?;
        (entry.computed_at.elapsed() < self.ttl).then(|| Arc::clone(&entry.analysis))
    }

    pub async fn insert(&self, symbol: &str, analysis: Arc<SmcAnalysis>) {
        self.entries.write().await.insert(
            symbol.to_string(),
            CachedAnalysis {
                analysis,
                computed_at: Instant::now(),
            },
        );
    }

    pub async fn invalidate(&self, symbol: &str) -> bool {
        self.entries.write().await.remove(symbol).is_some()
    }

    /// Lock guarding recomputation of `symbol`
    pub async fn flight(&self, symbol: &str) -> Arc<Mutex<()>> {
        let mut flights = self.flights.lock().await;
        Arc::clone(flights.entry(symbol.to_string()).or_default())
    }

    /// Drop entries past their TTL, returning how many were removed
    pub async fn purge_stale(&self) -> usize {
        let mut entries = self.entries.write().await;
        let before = entries.len();
        entries.retain(|_, e| e.computed_at.elapsed() < self.ttl);
        before - entries.len()
    }

    pub async fn len(&self) -> usize {
        self.entries.read().await.len()
    }

    pub async fn is_empty(&self) -> bool {
        self.entries.read().await.is_empty()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test(start_paused = true)]
    async fn test_entries_expire_after_ttl() {
        let cache = AnalysisCache::new(Duration::from_secs(30));
        let analysis = Arc::new(SmcAnalysis::empty("BTC-USD", chrono::Utc::now()));
        cache.insert("BTC-USD", Arc::clone(&analysis)).await;

        let hit = cache.get("BTC-USD").await.unwrap();
        assert!(Arc::ptr_eq(&hit, &analysis));
        assert!(cache.get("ETH-USD").await.is_none());

        tokio::time::advance(Duration::from_secs(31)).await;
        assert!(cache.get("BTC-USD").await.is_none());
        assert_eq!(cache.purge_stale().await, 1);
        assert!(cache.is_empty().await);
    }

    #[tokio::test]
    async fn test_flight_lock_is_shared_per_symbol() {
        let cache = AnalysisCache::new(Duration::from_secs(30));
        let a = cache.flight("BTC-USD").await;
        let b = cache.flight("BTC-USD").await;
        let c = cache.flight("ETH-USD").await;
        assert!(Arc::ptr_eq(&a, &b));
        assert!(!Arc::ptr_eq(&a, &c));
    }

    #[tokio::test]
    async fn test_invalidate() {
        let cache = AnalysisCache::new(Duration::from_secs(30));
        cache
            .insert("BTC-USD", Arc::new(SmcAnalysis::empty("BTC-USD", chrono::Utc::now())))
            .await;
        assert!(cache.invalidate("BTC-USD").await);
        assert!(!cache.invalidate("BTC-USD").await);
        assert_eq!(cache.len().await, 0);
    }
}
