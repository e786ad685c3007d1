//! Candle aggregation across exchanges
//!
//! Trades are bucketed per exchange into fixed intervals
//! (`floor(ts / interval) * interval`), then same-bucket bars from every
//! exchange are merged into one composite candle. Empty buckets are never
//! emitted.

use chrono::{DateTime, Duration, Utc};
use rayon::prelude::*;
use serde::{Deserialize, Serialize};
use std::collections::{BTreeMap, BTreeSet};
use tracing::{debug, info, warn};

use crate::types::{Candle, Side, Trade};

/// Institutional/retail partition of exchanges
///
/// Names compare case-insensitively. Exchanges in neither set still count
/// toward total candle volume.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct ExchangeTiers {
    pub institutional: BTreeSet<String>,
    pub retail: BTreeSet<String>,
}

impl Default for ExchangeTiers {
    fn default() -> Self {
        let set = |names: &[&str]| names.iter().map(|n| n.to_string()).collect();
        Self {
            institutional: set(&["coinbase", "kraken", "bitstamp", "gemini", "cme"]),
            retail: set(&["binance", "bybit", "okx", "kucoin", "bitget", "mexc"]),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum ExchangeTier {
    Institutional,
    Retail,
    Unclassified,
}

impl ExchangeTiers {
    pub fn tier(&self, exchange: &str) -> ExchangeTier {
        if self.institutional.iter().any(|e| e.eq_ignore_ascii_case(exchange)) {
            ExchangeTier::Institutional
        } else if self.retail.iter().any(|e| e.eq_ignore_ascii_case(exchange)) {
            ExchangeTier::Retail
        } else {
            ExchangeTier::Unclassified
        }
    }

    pub fn is_institutional(&self, exchange: &str) -> bool {
        self.tier(exchange) == ExchangeTier::Institutional
    }
}

/// One exchange's bar for one bucket
#[derive(Debug, Clone)]
struct ExchangeBar {
    exchange: String,
    bucket_ms: i64,
    open: f64,
    high: f64,
    low: f64,
    close: f64,
    volume: f64,
    buy_volume: f64,
    sell_volume: f64,
    trade_count: u64,
    first_ts: DateTime<Utc>,
    last_ts: DateTime<Utc>,
}

impl ExchangeBar {
    fn new(exchange: &str, bucket_ms: i64, trade: &Trade) -> Self {
        let mut bar = Self {
            exchange: exchange.to_string(),
            bucket_ms,
            open: trade.price,
            high: trade.price,
            low: trade.price,
            close: trade.price,
            volume: 0.0,
            buy_volume: 0.0,
            sell_volume: 0.0,
            trade_count: 0,
            first_ts: trade.timestamp,
            last_ts: trade.timestamp,
        };
        bar.add_trade(trade);
        bar
    }

    fn add_trade(&mut self, trade: &Trade) {
        self.high = self.high.max(trade.price);
        self.low = self.low.min(trade.price);
        self.close = trade.price;
        self.last_ts = trade.timestamp;
        self.volume += trade.quantity;
        match trade.side {
            Side::Buy => self.buy_volume += trade.quantity,
            Side::Sell => self.sell_volume += trade.quantity,
            Side::Unknown => {}
        }
        self.trade_count += 1;
    }
}

/// Merges raw trades into fixed-interval composite candles
#[derive(Debug, Clone)]
pub struct CandleAggregator {
    interval: Duration,
    tiers: ExchangeTiers,
}

impl CandleAggregator {
    pub fn new(interval: Duration, tiers: ExchangeTiers) -> Self {
        Self { interval, tiers }
    }

    pub fn interval(&self) -> Duration {
        self.interval
    }

    pub fn tiers(&self) -> &ExchangeTiers {
        &self.tiers
    }

    /// Bucket key for a timestamp, in epoch milliseconds
    pub fn bucket_start(&self, ts: DateTime<Utc>) -> i64 {
        let interval_ms = self.interval.num_milliseconds().max(1);
        ts.timestamp_millis().div_euclid(interval_ms) * interval_ms
    }

    /// Build composite candles, ordered by interval start
    pub fn aggregate(&self, trades: &[Trade]) -> Vec<Candle> {
        if trades.is_empty() {
            return Vec::new();
        }
        if self.interval.num_milliseconds() <= 0 {
            warn!("Candle interval must be positive, got {:?}", self.interval);
            return Vec::new();
        }

        // Group by exchange (lowercased so tiers and candle sets agree)
        let mut by_exchange: BTreeMap<String, Vec<&Trade>> = BTreeMap::new();
        let mut dropped = 0usize;
        for trade in trades {
            if !trade.is_valid() {
                dropped += 1;
                continue;
            }
            by_exchange
                .entry(trade.exchange.to_ascii_lowercase())
                .or_default()
                .push(trade);
        }
        if dropped > 0 {
            debug!("Dropped {} invalid trades before aggregation", dropped);
        }

        let groups: Vec<(String, Vec<&Trade>)> = by_exchange.into_iter().collect();
        let exchange_bars: Vec<ExchangeBar> = groups
            .into_par_iter()
            .flat_map_iter(|(exchange, trades)| self.build_exchange_bars(&exchange, trades))
            .collect();

        let mut buckets: BTreeMap<i64, Vec<ExchangeBar>> = BTreeMap::new();
        for bar in exchange_bars {
            buckets.entry(bar.bucket_ms).or_default().push(bar);
        }

        let candles: Vec<Candle> = buckets
            .into_iter()
            .filter_map(|(bucket_ms, bars)| self.merge_bucket(bucket_ms, &bars))
            .collect();

        info!(
            "Aggregated {} trades into {} candles ({}s interval)",
            trades.len() - dropped,
            candles.len(),
            self.interval.num_seconds()
        );
        candles
    }

    fn build_exchange_bars(&self, exchange: &str, mut trades: Vec<&Trade>) -> Vec<ExchangeBar> {
        trades.sort_by_key(|t| t.timestamp);

        let mut bars: BTreeMap<i64, ExchangeBar> = BTreeMap::new();
        for trade in trades {
            let bucket_ms = self.bucket_start(trade.timestamp);
            bars.entry(bucket_ms)
                .and_modify(|bar| bar.add_trade(trade))
                .or_insert_with(|| ExchangeBar::new(exchange, bucket_ms, trade));
        }
        bars.into_values().collect()
    }

    fn merge_bucket(&self, bucket_ms: i64, bars: &[ExchangeBar]) -> Option<Candle> {
        // Earliest reporter opens, latest reporter closes; exchange name breaks ties
        let opener = bars
            .iter()
            .min_by(|a, b| a.first_ts.cmp(&b.first_ts).then_with(|| a.exchange.cmp(&b.exchange)))?;
        let closer = bars
            .iter()
            .max_by(|a, b| a.last_ts.cmp(&b.last_ts).then_with(|| b.exchange.cmp(&a.exchange)))?;
        let timestamp = DateTime::from_timestamp_millis(bucket_ms)?;

        let mut candle = Candle {
            timestamp,
            open: opener.open,
            high: f64::MIN,
            low: f64::MAX,
            close: closer.close,
            volume: 0.0,
            buy_volume: 0.0,
            sell_volume: 0.0,
            institutional_volume: 0.0,
            retail_volume: 0.0,
            trade_count: 0,
            exchanges: BTreeSet::new(),
        };

        for bar in bars {
            candle.high = candle.high.max(bar.high);
            candle.low = candle.low.min(bar.low);
            candle.volume += bar.volume;
            candle.buy_volume += bar.buy_volume;
            candle.sell_volume += bar.sell_volume;
            candle.trade_count += bar.trade_count;
            match self.tiers.tier(&bar.exchange) {
                ExchangeTier::Institutional => candle.institutional_volume += bar.volume,
                ExchangeTier::Retail => candle.retail_volume += bar.volume,
                ExchangeTier::Unclassified => {}
            }
            candle.exchanges.insert(bar.exchange.clone());
        }

        Some(candle)
    }
}

/// Convenience wrapper for one-off aggregation
pub fn aggregate_candles(trades: &[Trade], interval: Duration, tiers: &ExchangeTiers) -> Vec<Candle> {
    CandleAggregator::new(interval, tiers.clone()).aggregate(trades)
}
