//! Per-symbol state that outlives a single analysis pass

use std::collections::HashMap;

use chrono::{DateTime, Utc};
use tokio::sync::RwLock;
use tracing::debug;

use super::signals::SmcSignal;
use crate::analytics::{DeltaLedger, LiquidityZone, ZoneBook};
use crate::types::Candle;

/// Active signals, zone books and running cumulative delta keyed by symbol
#[derive(Debug)]
pub struct SignalRegistry {
    zone_capacity: usize,
    zone_max_age: chrono::Duration,
    signals: RwLock<HashMap<String, Vec<SmcSignal>>>,
    zones: RwLock<HashMap<String, ZoneBook>>,
    deltas: RwLock<HashMap<String, DeltaLedger>>,
}

impl SignalRegistry {
    pub fn new(zone_capacity: usize, zone_max_age: chrono::Duration) -> Self {
        Self {
            zone_capacity,
            zone_max_age,
            signals: RwLock::new(HashMap::new()),
            zones: RwLock::new(HashMap::new()),
            deltas: RwLock::new(HashMap::new()),
        }
    }

    /// Add new signals. Expired signals and older signals in the same
    /// direction over an overlapping zone are dropped.
    pub async fn record_signals(&self, symbol: &str, fresh: &[SmcSignal], now: DateTime<Utc>) {
        let mut signals = self.signals.write().await;
        let active = signals.entry(symbol.to_string()).or_default();
        let before = active.len();
        active.retain(|s| {
            !s.is_expired(now)
                && !fresh
                    .iter()
                    .any(|f| f.direction == s.direction && f.zone.overlaps(&s.zone))
        });
        let dropped = before - active.len();
        active.extend(fresh.iter().cloned());
        if dropped > 0 || !fresh.is_empty() {
            debug!("{}: {} new signals, {} replaced or expired", symbol, fresh.len(), dropped);
        }
    }

    pub async fn active_signals(&self, symbol: &str, now: DateTime<Utc>) -> Vec<SmcSignal> {
        self.signals
            .read()
            .await
            .get(symbol)
            .map(|v| v.iter().filter(|s| !s.is_expired(now)).cloned().collect())
            .unwrap_or_default()
    }

    /// Replay candles against the symbol's book, then merge freshly mapped zones
    pub async fn update_zones(
        &self,
        symbol: &str,
        candles: &[Candle],
        fresh: Vec<LiquidityZone>,
        now: DateTime<Utc>,
    ) -> Vec<LiquidityZone> {
        let mut books = self.zones.write().await;
        let book = books
            .entry(symbol.to_string())
            .or_insert_with(|| ZoneBook::new(self.zone_capacity, self.zone_max_age));
        for candle in candles {
            book.update(candle);
        }
        let evicted = book.merge(fresh, now);
        if evicted > 0 {
            debug!("{}: evicted {} liquidity zones", symbol, evicted);
        }
        book.zones().to_vec()
    }

    pub async fn active_zones(&self, symbol: &str) -> Vec<LiquidityZone> {
        self.zones
            .read()
            .await
            .get(symbol)
            .map(|b| b.zones().to_vec())
            .unwrap_or_default()
    }

    /// Running delta for `symbol` and the last trade it includes
    pub async fn delta_ledger(&self, symbol: &str) -> DeltaLedger {
        self.deltas.read().await.get(symbol).copied().unwrap_or_default()
    }

    pub async fn set_delta_ledger(&self, symbol: &str, ledger: DeltaLedger) {
        self.deltas.write().await.insert(symbol.to_string(), ledger);
    }

    pub async fn cumulative_delta(&self, symbol: &str) -> f64 {
        self.delta_ledger(symbol).await.cumulative_delta
    }

    /// Drop expired signals and aged zones across all symbols
    pub async fn purge_expired(&self, now: DateTime<Utc>) -> (usize, usize) {
        let mut signals_removed = 0;
        {
            let mut signals = self.signals.write().await;
            for active in signals.values_mut() {
                let before = active.len();
                active.retain(|s| !s.is_expired(now));
                signals_removed += before - active.len();
            }
            signals.retain(|_, v| !v.is_empty());
        }

        let mut zones_removed = 0;
        for book in self.zones.write().await.values_mut() {
            zones_removed += book.purge(now);
        }

        (signals_removed, zones_removed)
    }

    pub async fn clear(&self, symbol: &str) {
        self.signals.write().await.remove(symbol);
        self.zones.write().await.remove(symbol);
        self.deltas.write().await.remove(symbol);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::dashboard::signals::{SetupQuality, SignalDirection, SignalSource};
    use crate::types::PriceRange;
    use chrono::TimeZone;
    use uuid::Uuid;

    fn ts() -> DateTime<Utc> {
        Utc.timestamp_opt(1_700_000_000, 0).unwrap()
    }

    fn signal(direction: SignalDirection, lower: f64, upper: f64, created_at: DateTime<Utc>) -> SmcSignal {
        SmcSignal {
            id: Uuid::new_v4(),
            symbol: "BTC-USD".to_string(),
            direction,
            entry: upper,
            stop_loss: lower - 0.1,
            targets: vec![upper + 1.0],
            risk: upper - lower + 0.1,
            confluence: 75.0,
            quality: SetupQuality::High,
            source: SignalSource::OrderBlock,
            zone: PriceRange::new(lower, upper),
            created_at,
            expires_at: created_at + chrono::Duration::hours(4),
        }
    }

    #[tokio::test]
    async fn test_overlapping_signal_supersedes_older_one() {
        let registry = SignalRegistry::new(20, chrono::Duration::hours(72));
        let old = signal(SignalDirection::Long, 100.0, 102.0, ts());
        let other = signal(SignalDirection::Long, 90.0, 91.0, ts());
        registry.record_signals("BTC-USD", &[old, other.clone()], ts()).await;

        let newer = signal(SignalDirection::Long, 101.0, 103.0, ts() + chrono::Duration::minutes(5));
        registry.record_signals("BTC-USD", &[newer.clone()], ts()).await;

        let active = registry.active_signals("BTC-USD", ts()).await;
        assert_eq!(active.len(), 2);
        assert!(active.iter().any(|s| s.id == other.id));
        assert!(active.iter().any(|s| s.id == newer.id));
    }

    #[tokio::test]
    async fn test_opposite_direction_does_not_supersede() {
        let registry = SignalRegistry::new(20, chrono::Duration::hours(72));
        registry
            .record_signals("BTC-USD", &[signal(SignalDirection::Long, 100.0, 102.0, ts())], ts())
            .await;
        registry
            .record_signals("BTC-USD", &[signal(SignalDirection::Short, 100.0, 102.0, ts())], ts())
            .await;
        assert_eq!(registry.active_signals("BTC-USD", ts()).await.len(), 2);
    }

    #[tokio::test]
    async fn test_purge_expired_signals() {
        let registry = SignalRegistry::new(20, chrono::Duration::hours(72));
        registry
            .record_signals("BTC-USD", &[signal(SignalDirection::Long, 100.0, 102.0, ts())], ts())
            .await;
        let later = ts() + chrono::Duration::hours(5);
        assert!(registry.active_signals("BTC-USD", later).await.is_empty());
        assert_eq!(registry.purge_expired(later).await, (1, 0));
        assert!(registry.active_signals("BTC-USD", ts()).await.is_empty());
    }

    #[tokio::test]
    async fn test_cumulative_delta_per_symbol() {
        let registry = SignalRegistry::new(20, chrono::Duration::hours(72));
        assert_eq!(registry.cumulative_delta("BTC-USD").await, 0.0);
        let ledger = DeltaLedger {
            cumulative_delta: 42.0,
            counted_through: Some(ts()),
        };
        registry.set_delta_ledger("BTC-USD", ledger).await;
        assert_eq!(registry.cumulative_delta("BTC-USD").await, 42.0);
        assert_eq!(registry.delta_ledger("BTC-USD").await, ledger);
        assert_eq!(registry.cumulative_delta("ETH-USD").await, 0.0);
        registry.clear("BTC-USD").await;
        assert_eq!(registry.delta_ledger("BTC-USD").await, DeltaLedger::default());
    }
}
