//! Order block detection
//!
//! A block is the range of a high-volume, full-bodied candle that reversed a
//! prior move and was followed through by the next candle. Once a close
//! prints through the far side of the block it is mitigated for good.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use tracing::{debug, info};
use uuid::Uuid;

use super::scoring::{capped_ratio, clamp_score, safe_div, trailing_volume, validate_candles};
use crate::error::{Component, Result};
use crate::types::{Candle, Direction, PriceRange};

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct OrderBlockConfig {
    /// Spike candle volume vs trailing average (default: 2.0)
    pub volume_multiplier: f64,
    pub volume_lookback: usize,
    /// Minimum body / range of the spike candle (default: 0.6)
    pub min_body_ratio: f64,
    /// Candles before the spike that must move against it
    pub prior_move_candles: usize,
    /// Blocks scoring below this are discarded (default: 60)
    pub min_confidence: f64,
    pub institutional_weight: f64,
    pub spike_weight: f64,
    pub body_weight: f64,
    pub exchange_weight: f64,
    /// Spike ratio that earns the full spike score
    pub spike_cap: f64,
    /// Exchange count that earns the full exchange score
    pub exchange_cap: usize,
}

impl Default for OrderBlockConfig {
    fn default() -> Self {
        Self {
            volume_multiplier: 2.0,
            volume_lookback: 20,
            min_body_ratio: 0.6,
            prior_move_candles: 3,
            min_confidence: 60.0,
            institutional_weight: 30.0,
            spike_weight: 30.0,
            body_weight: 20.0,
            exchange_weight: 20.0,
            spike_cap: 4.0,
            exchange_cap: 3,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum OrderBlockType {
    Bullish,
    Bearish,
}

impl OrderBlockType {
    pub fn direction(self) -> Direction {
        match self {
            OrderBlockType::Bullish => Direction::Bullish,
            OrderBlockType::Bearish => Direction::Bearish,
        }
    }
}

impl From<Direction> for OrderBlockType {
    fn from(direction: Direction) -> Self {
        match direction {
            Direction::Bullish => OrderBlockType::Bullish,
            Direction::Bearish => OrderBlockType::Bearish,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum BlockState {
    Active,
    Mitigated,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct OrderBlock {
    pub id: Uuid,
    pub block_type: OrderBlockType,
    pub range: PriceRange,
    /// Timestamp of the spike candle
    pub formed_at: DateTime<Utc>,
    pub confidence: f64,
    pub volume: f64,
    pub volume_spike: f64,
    pub body_ratio: f64,
    pub institutional_ratio: f64,
    pub exchanges: Vec<String>,
    pub state: BlockState,
    pub touch_count: u32,
    pub last_touched_at: Option<DateTime<Utc>>,
    pub mitigated_at: Option<DateTime<Utc>>,
}

impl OrderBlock {
    pub fn is_active(&self) -> bool {
        self.state == BlockState::Active
    }

    pub fn direction(&self) -> Direction {
        self.block_type.direction()
    }

    /// Price whose close-through mitigates the block
    pub fn invalidation_price(&self) -> f64 {
        match self.block_type {
            OrderBlockType::Bullish => self.range.lower(),
            OrderBlockType::Bearish => self.range.upper(),
        }
    }

    /// Advance the lifecycle with a later candle
    ///
    /// Candles at or before formation are ignored, as is anything after
    /// mitigation. Returns true when the block changed.
    pub fn update(&mut self, candle: &Candle) -> bool {
        if !self.is_active() || candle.timestamp <= self.formed_at {
            return false;
        }

        let closed_through = match self.block_type {
            OrderBlockType::Bullish => candle.close < self.range.lower(),
            OrderBlockType::Bearish => candle.close > self.range.upper(),
        };
        if closed_through {
            self.state = BlockState::Mitigated;
            self.mitigated_at = Some(candle.timestamp);
            debug!(
                "Order block {} mitigated at {:.2}",
                self.id, candle.close
            );
            return true;
        }

        if self.range.intersects(candle.low, candle.high) {
            self.touch_count += 1;
            self.last_touched_at = Some(candle.timestamp);
            return true;
        }

        false
    }
}

#[derive(Debug, Clone, Default)]
pub struct OrderBlockDetector {
    config: OrderBlockConfig,
}

impl OrderBlockDetector {
    pub fn new(config: OrderBlockConfig) -> Self {
        Self { config }
    }

    pub fn config(&self) -> &OrderBlockConfig {
        &self.config
    }

    /// Detect blocks and replay later candles through each one, so the
    /// returned state reflects the whole series
    pub fn detect(&self, candles: &[Candle]) -> Result<Vec<OrderBlock>> {
        validate_candles(candles, Component::OrderBlocks)?;

        let first = self.config.prior_move_candles.max(1);
        if candles.len() < first + 2 {
            debug!("Order blocks skipped: {} candles", candles.len());
            return Ok(Vec::new());
        }

        let mut blocks = Vec::new();
        for i in first..candles.len() - 1 {
            if let Some(mut block) = self.block_at(candles, i) {
                for later in &candles[i + 2..] {
                    block.update(later);
                }
                blocks.push(block);
            }
        }

        info!(
            "Order blocks: {} found, {} active",
            blocks.len(),
            blocks.iter().filter(|b| b.is_active()).count()
        );
        Ok(blocks)
    }

    fn block_at(&self, candles: &[Candle], i: usize) -> Option<OrderBlock> {
        let spike_candle = &candles[i];
        let avg = trailing_volume(candles, i, self.config.volume_lookback)?;
        if avg <= 0.0 {
            return None;
        }
        let spike = spike_candle.volume / avg;
        if spike < self.config.volume_multiplier {
            return None;
        }

        let body_ratio = spike_candle.body_ratio();
        if body_ratio < self.config.min_body_ratio {
            return None;
        }

        let direction = if spike_candle.is_bullish() {
            Direction::Bullish
        } else if spike_candle.is_bearish() {
            Direction::Bearish
        } else {
            return None;
        };

        // Move into the spike must run the other way
        let prior_open = candles[i - self.config.prior_move_candles.max(1)].open;
        let prior_close = candles[i - 1].close;
        let prior_against = match direction {
            Direction::Bullish => prior_close < prior_open,
            Direction::Bearish => prior_close > prior_open,
        };
        if !prior_against {
            return None;
        }

        let next = &candles[i + 1];
        let continued = match direction {
            Direction::Bullish => next.close > spike_candle.close,
            Direction::Bearish => next.close < spike_candle.close,
        };
        if !continued {
            return None;
        }

        let confidence = self.confidence(spike_candle, spike, body_ratio);
        if confidence < self.config.min_confidence {
            debug!(
                "Order block at {} discarded: confidence {:.1}",
                spike_candle.timestamp, confidence
            );
            return None;
        }

        Some(OrderBlock {
            id: Uuid::new_v4(),
            block_type: direction.into(),
            range: PriceRange::new(spike_candle.low, spike_candle.high),
            formed_at: spike_candle.timestamp,
            confidence,
            volume: spike_candle.volume,
            volume_spike: spike,
            body_ratio,
            institutional_ratio: spike_candle.institutional_ratio(),
            exchanges: spike_candle.exchanges.iter().cloned().collect(),
            state: BlockState::Active,
            touch_count: 0,
            last_touched_at: None,
            mitigated_at: None,
        })
    }

    /// Four capped sub-scores: institutional share, spike size, body, exchanges
    pub fn confidence(&self, candle: &Candle, spike: f64, body_ratio: f64) -> f64 {
        let c = &self.config;
        clamp_score(
            candle.institutional_ratio() * c.institutional_weight
                + capped_ratio(spike, c.spike_cap) * c.spike_weight
                + body_ratio.clamp(0.0, 1.0) * c.body_weight
                + safe_div(candle.exchange_count() as f64, c.exchange_cap as f64, 0.0).min(1.0)
                    * c.exchange_weight,
        )
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::TimeZone;
    use rand::rngs::StdRng;
    use rand::{Rng, SeedableRng};
    use std::collections::BTreeSet;

    fn exchanges(names: &[&str]) -> BTreeSet<String> {
        names.iter().map(|n| n.to_string()).collect()
    }

    fn candle(i: usize, open: f64, close: f64, volume: f64) -> Candle {
        Candle {
            timestamp: Utc.timestamp_opt(1_700_000_000 + 60 * i as i64, 0).unwrap(),
            open,
            high: open.max(close) + 0.5,
            low: open.min(close) - 0.5,
            close,
            volume,
            buy_volume: volume / 2.0,
            sell_volume: volume / 2.0,
            institutional_volume: volume / 2.0,
            retail_volume: volume / 2.0,
            trade_count: 10,
            exchanges: exchanges(&["binance", "coinbase"]),
        }
    }

    /// Flat tape, a three-candle drop, then a bullish spike and follow-through
    fn bullish_setup() -> Vec<Candle> {
        let mut candles: Vec<Candle> = (0..17).map(|i| candle(i, 100.0, 100.0, 10.0)).collect();
        candles.push(candle(17, 101.0, 100.5, 10.0));
        candles.push(candle(18, 100.5, 99.8, 10.0));
        candles.push(candle(19, 99.8, 99.0, 10.0));
        candles.push(Candle {
            high: 103.5,
            low: 98.8,
            institutional_volume: 30.0,
            retail_volume: 10.0,
            exchanges: exchanges(&["binance", "coinbase", "kraken"]),
            ..candle(20, 99.0, 103.0, 40.0)
        });
        candles.push(candle(21, 103.0, 105.0, 15.0));
        candles
    }

    #[test]
    fn test_bullish_block_detected() {
        let blocks = OrderBlockDetector::default().detect(&bullish_setup()).unwrap();
        assert_eq!(blocks.len(), 1);

        let block = &blocks[0];
        assert_eq!(block.block_type, OrderBlockType::Bullish);
        assert_eq!(block.range.lower(), 98.8);
        assert_eq!(block.range.upper(), 103.5);
        assert!(block.is_active());
        assert!(block.confidence >= 60.0 && block.confidence <= 100.0);
        assert_eq!(block.exchanges.len(), 3);
    }

    #[test]
    fn test_block_touched_then_mitigated_for_good() {
        let mut candles = bullish_setup();
        // Wick back into the zone
        candles.push(candle(22, 105.0, 104.0, 10.0));
        candles.push(Candle {
            low: 103.0,
            ..candle(23, 104.0, 104.2, 10.0)
        });
        // Close through the bottom, then rally back above
        candles.push(candle(24, 103.0, 98.0, 10.0));
        candles.push(candle(25, 98.0, 104.0, 10.0));

        let blocks = OrderBlockDetector::default().detect(&candles).unwrap();
        let block = blocks
            .iter()
            .find(|b| b.block_type == OrderBlockType::Bullish)
            .unwrap();
        assert_eq!(block.state, BlockState::Mitigated);
        assert_eq!(block.mitigated_at, Some(candles[24].timestamp));
        assert_eq!(block.touch_count, 2);
        assert_eq!(block.last_touched_at, Some(candles[23].timestamp));
    }

    #[test]
    fn test_no_block_without_prior_move() {
        let mut candles = bullish_setup();
        // Prior candles rise into the spike
        candles[17] = candle(17, 97.0, 97.5, 10.0);
        candles[18] = candle(18, 97.5, 98.2, 10.0);
        candles[19] = candle(19, 98.2, 99.0, 10.0);
        let blocks = OrderBlockDetector::default().detect(&candles).unwrap();
        assert!(blocks.is_empty());
    }

    #[test]
    fn test_low_confidence_discarded() {
        let mut candles = bullish_setup();
        candles[20].institutional_volume = 0.0;
        candles[20].exchanges = exchanges(&["binance"]);
        candles[20].volume = 21.0;
        let blocks = OrderBlockDetector::default().detect(&candles).unwrap();
        assert!(blocks.is_empty());
    }

    #[test]
    fn test_empty_and_short_input() {
        let detector = OrderBlockDetector::default();
        assert!(detector.detect(&[]).unwrap().is_empty());
        assert!(detector.detect(&bullish_setup()[..3]).unwrap().is_empty());
    }

    #[test]
    fn test_update_ignores_candles_after_mitigation() {
        let mut blocks = OrderBlockDetector::default().detect(&bullish_setup()).unwrap();
        let block = &mut blocks[0];
        assert!(block.update(&candle(30, 99.0, 97.0, 10.0)));
        assert!(!block.update(&candle(31, 97.0, 102.0, 10.0)));
        assert_eq!(block.state, BlockState::Mitigated);
        assert_eq!(block.touch_count, 0);
    }

    #[test]
    fn test_random_walk_blocks_respect_invalidation() {
        let mut rng = StdRng::seed_from_u64(23);
        let mut price: f64 = 100.0;
        let candles: Vec<Candle> = (0..2000)
            .map(|i| {
                let open = price;
                price += rng.gen_range(-1.0..1.0);
                let volume = if rng.gen_bool(0.08) {
                    rng.gen_range(30.0..60.0)
                } else {
                    rng.gen_range(5.0..15.0)
                };
                let mut c = candle(i, open, price, volume);
                c.high = open.max(price) + 0.05;
                c.low = open.min(price) - 0.05;
                c.institutional_volume = volume * rng.gen_range(0.3..1.0);
                c.retail_volume = volume - c.institutional_volume;
                c.exchanges = exchanges(&["binance", "coinbase", "kraken"][..rng.gen_range(1..=3)]);
                c
            })
            .collect();

        let blocks = OrderBlockDetector::default().detect(&candles).unwrap();
        assert!(!blocks.is_empty());
        for block in &blocks {
            assert!(block.confidence >= 60.0 && block.confidence <= 100.0);
            let crossed = candles
                .iter()
                .filter(|c| c.timestamp > block.formed_at)
                .any(|c| match block.block_type {
                    OrderBlockType::Bullish => c.close < block.range.lower(),
                    OrderBlockType::Bearish => c.close > block.range.upper(),
                });
            assert_eq!(crossed, !block.is_active());
        }
    }
}
