//! Boundary traits for market data collaborators
//!
//! The engine never performs I/O itself. Callers hand it trades directly, or
//! implement these traits and let `Dashboard::analyze_from_source` fetch
//! every configured exchange concurrently.

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::types::{OrderBookSnapshot, Trade};

/// Half-open time window `[start, end)`
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct TimeRange {
    pub start: DateTime<Utc>,
    pub end: DateTime<Utc>,
}

impl TimeRange {
    pub fn new(start: DateTime<Utc>, end: DateTime<Utc>) -> Self {
        if start <= end {
            Self { start, end }
        } else {
            Self { start: end, end: start }
        }
    }

    /// Window of `lookback` ending at `end`
    pub fn ending_at(end: DateTime<Utc>, lookback: chrono::Duration) -> Self {
        Self::new(end - lookback, end)
    }

    pub fn contains(&self, ts: DateTime<Utc>) -> bool {
        ts >= self.start && ts < self.end
    }
}

/// Raw trade query for one symbol on one exchange
#[async_trait]
pub trait TradeSource: Send + Sync {
    async fn trades(&self, symbol: &str, exchange: &str, range: TimeRange) -> anyhow::Result<Vec<Trade>>;
}

/// Optional top-of-book history used to classify trades
#[async_trait]
pub trait OrderBookSource: Send + Sync {
    async fn snapshots(
        &self,
        symbol: &str,
        exchange: &str,
        range: TimeRange,
    ) -> anyhow::Result<Vec<OrderBookSnapshot>>;
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::TimeZone;

    #[test]
    fn test_time_range_is_half_open() {
        let start = Utc.timestamp_opt(1_700_000_000, 0).unwrap();
        let end = start + chrono::Duration::minutes(5);
        let range = TimeRange::new(end, start);
        assert_eq!(range.start, start);
        assert!(range.contains(start));
        assert!(!range.contains(end));
        assert_eq!(TimeRange::ending_at(end, chrono::Duration::minutes(5)), range);
    }
}
