//! Shared market data types
//!
//! Trades come in from the calling layer, candles are produced by the
//! aggregator, and everything downstream reads these immutably.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::BTreeSet;

/// Aggressor side as reported by an exchange (or inferred by the classifier)
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Side {
    Buy,
    Sell,
    Unknown,
}

impl Side {
    /// Signed multiplier for delta: +1 buy, -1 sell, 0 unknown
    pub fn sign(self) -> f64 {
        match self {
            Side::Buy => 1.0,
            Side::Sell => -1.0,
            Side::Unknown => 0.0,
        }
    }
}

impl std::fmt::Display for Side {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Side::Buy => write!(f, "buy"),
            Side::Sell => write!(f, "sell"),
            Side::Unknown => write!(f, "unknown"),
        }
    }
}

/// Raw trade from one exchange
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Trade {
    pub exchange: String,
    pub symbol: String,
    pub price: f64,
    pub quantity: f64,
    pub side: Side,
    pub timestamp: DateTime<Utc>,
}

impl Trade {
    /// Price and quantity are usable for aggregation
    pub fn is_valid(&self) -> bool {
        self.price.is_finite() && self.price > 0.0 && self.quantity.is_finite() && self.quantity >= 0.0
    }

    pub fn notional(&self) -> f64 {
        self.price * self.quantity
    }
}

/// Top of book for one exchange at a point in time
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct OrderBookSnapshot {
    pub exchange: String,
    pub best_bid: f64,
    pub best_ask: f64,
    pub timestamp: DateTime<Utc>,
}

impl OrderBookSnapshot {
    pub fn midpoint(&self) -> f64 {
        (self.best_bid + self.best_ask) / 2.0
    }

    /// Crossed or non-finite books are ignored by the classifier
    pub fn is_usable(&self) -> bool {
        self.best_bid.is_finite()
            && self.best_ask.is_finite()
            && self.best_bid > 0.0
            && self.best_ask >= self.best_bid
    }
}

/// Composite candle merged across exchanges
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Candle {
    /// Interval start
    pub timestamp: DateTime<Utc>,
    pub open: f64,
    pub high: f64,
    pub low: f64,
    pub close: f64,
    pub volume: f64,
    pub buy_volume: f64,
    pub sell_volume: f64,
    pub institutional_volume: f64,
    pub retail_volume: f64,
    pub trade_count: u64,
    pub exchanges: BTreeSet<String>,
}

impl Candle {
    pub fn is_bullish(&self) -> bool {
        self.close > self.open
    }

    pub fn is_bearish(&self) -> bool {
        self.close < self.open
    }

    pub fn body(&self) -> f64 {
        (self.close - self.open).abs()
    }

    pub fn range(&self) -> f64 {
        self.high - self.low
    }

    /// Body as a fraction of the full range (0 for a flat candle)
    pub fn body_ratio(&self) -> f64 {
        let range = self.range();
        if range > 0.0 {
            (self.body() / range).min(1.0)
        } else {
            0.0
        }
    }

    /// Share of volume traded on institutional venues
    pub fn institutional_ratio(&self) -> f64 {
        if self.volume > 0.0 {
            (self.institutional_volume / self.volume).clamp(0.0, 1.0)
        } else {
            0.0
        }
    }

    pub fn typical_price(&self) -> f64 {
        (self.high + self.low + self.close) / 3.0
    }

    pub fn delta(&self) -> f64 {
        self.buy_volume - self.sell_volume
    }

    pub fn exchange_count(&self) -> usize {
        self.exchanges.len()
    }

    /// OHLC values are finite and ordered
    pub fn is_well_formed(&self) -> bool {
        [self.open, self.high, self.low, self.close, self.volume]
            .iter()
            .all(|v| v.is_finite())
            && self.high >= self.low
            && self.volume >= 0.0
    }
}

/// Directional lean of a pattern or zone
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Direction {
    Bullish,
    Bearish,
}

impl Direction {
    pub fn opposite(self) -> Self {
        match self {
            Direction::Bullish => Direction::Bearish,
            Direction::Bearish => Direction::Bullish,
        }
    }

    pub fn sign(self) -> f64 {
        match self {
            Direction::Bullish => 1.0,
            Direction::Bearish => -1.0,
        }
    }
}

impl std::fmt::Display for Direction {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Direction::Bullish => write!(f, "bullish"),
            Direction::Bearish => write!(f, "bearish"),
        }
    }
}

/// Aggregate market lean; neutral when nothing dominates
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Bias {
    Bullish,
    Bearish,
    #[default]
    Neutral,
}

impl From<Direction> for Bias {
    fn from(direction: Direction) -> Self {
        match direction {
            Direction::Bullish => Bias::Bullish,
            Direction::Bearish => Bias::Bearish,
        }
    }
}

impl Bias {
    pub fn direction(self) -> Option<Direction> {
        match self {
            Bias::Bullish => Some(Direction::Bullish),
            Bias::Bearish => Some(Direction::Bearish),
            Bias::Neutral => None,
        }
    }
}

/// Closed price interval; `lower <= upper` always holds
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
#[serde(from = "RawPriceRange")]
pub struct PriceRange {
    lower: f64,
    upper: f64,
}

#[derive(Deserialize)]
struct RawPriceRange {
    lower: f64,
    upper: f64,
}

impl From<RawPriceRange> for PriceRange {
    fn from(raw: RawPriceRange) -> Self {
        PriceRange::new(raw.lower, raw.upper)
    }
}

impl PriceRange {
    /// Build a range from two bounds in either order
    pub fn new(a: f64, b: f64) -> Self {
        if a <= b {
            Self { lower: a, upper: b }
        } else {
            Self { lower: b, upper: a }
        }
    }

    pub fn lower(&self) -> f64 {
        self.lower
    }

    pub fn upper(&self) -> f64 {
        self.upper
    }

    pub fn width(&self) -> f64 {
        self.upper - self.lower
    }

    pub fn midpoint(&self) -> f64 {
        (self.lower + self.upper) / 2.0
    }

    pub fn contains(&self, price: f64) -> bool {
        price >= self.lower && price <= self.upper
    }

    /// Closed-interval overlap with [low, high]
    pub fn intersects(&self, low: f64, high: f64) -> bool {
        low <= self.upper && high >= self.lower
    }

    pub fn overlaps(&self, other: &PriceRange) -> bool {
        self.intersects(other.lower, other.upper)
    }

    /// Distance from price to the nearest edge (0 when inside)
    pub fn distance_to(&self, price: f64) -> f64 {
        if price < self.lower {
            self.lower - price
        } else if price > self.upper {
            price - self.upper
        } else {
            0.0
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_price_range_orders_bounds() {
        let range = PriceRange::new(110.0, 100.0);
        assert_eq!(range.lower(), 100.0);
        assert_eq!(range.upper(), 110.0);
        assert_eq!(range.width(), 10.0);
        assert!(range.contains(105.0));
        assert!(!range.contains(99.99));
        assert_eq!(range.distance_to(95.0), 5.0);
        assert_eq!(range.distance_to(104.0), 0.0);
    }

    #[test]
    fn test_candle_ratios_guard_zero_range() {
        let candle = Candle {
            timestamp: Utc::now(),
            open: 100.0,
            high: 100.0,
            low: 100.0,
            close: 100.0,
            volume: 0.0,
            buy_volume: 0.0,
            sell_volume: 0.0,
            institutional_volume: 0.0,
            retail_volume: 0.0,
            trade_count: 0,
            exchanges: BTreeSet::new(),
        };
        assert_eq!(candle.body_ratio(), 0.0);
        assert_eq!(candle.institutional_ratio(), 0.0);
        assert!(candle.is_well_formed());
    }

    #[test]
    fn test_side_sign() {
        assert_eq!(Side::Buy.sign(), 1.0);
        assert_eq!(Side::Sell.sign(), -1.0);
        assert_eq!(Side::Unknown.sign(), 0.0);
    }
}
