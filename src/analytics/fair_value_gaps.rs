//! Fair value gaps: three-candle imbalances and their fill tracking

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use tracing::{debug, info};
use uuid::Uuid;

use super::scoring::{capped_ratio, clamp_score, safe_div, trailing_volume, validate_candles};
use crate::error::{Component, Result};
use crate::types::{Candle, Direction, PriceRange};

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct FvgConfig {
    /// Gap width as a percent of its upper bound
    pub min_gap_pct: f64,
    pub volume_lookback: usize,
    /// Middle candle volume vs trailing average (default: 1.5)
    pub min_volume_surge: f64,
    /// Quality needed to mark a gap actionable (default: 60)
    pub actionable_quality: f64,
    pub quality_volume_weight: f64,
    pub quality_size_weight: f64,
    pub quality_exchange_weight: f64,
    pub quality_institutional_weight: f64,
    /// Surge ratio that earns the full volume score
    pub surge_cap: f64,
    /// Gap percent that earns the full size score
    pub size_cap_pct: f64,
    pub exchange_cap: usize,
    pub fill_size_weight: f64,
    pub fill_surge_weight: f64,
    pub fill_institutional_weight: f64,
    pub fill_quality_weight: f64,
    /// Gap percent at which size stops making a fill more likely
    pub fill_size_cap_pct: f64,
}

impl Default for FvgConfig {
    fn default() -> Self {
        Self {
            min_gap_pct: 0.1,
            volume_lookback: 20,
            min_volume_surge: 1.5,
            actionable_quality: 60.0,
            quality_volume_weight: 35.0,
            quality_size_weight: 25.0,
            quality_exchange_weight: 20.0,
            quality_institutional_weight: 20.0,
            surge_cap: 3.0,
            size_cap_pct: 1.0,
            exchange_cap: 3,
            fill_size_weight: 40.0,
            fill_surge_weight: 20.0,
            fill_institutional_weight: 20.0,
            fill_quality_weight: 20.0,
            fill_size_cap_pct: 2.0,
        }
    }
}

/// Ordered so that a later status never compares lower
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum FillStatus {
    Unfilled,
    PartiallyFilled,
    Filled,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct FairValueGap {
    pub id: Uuid,
    pub direction: Direction,
    pub range: PriceRange,
    /// Timestamp of the middle candle
    pub formed_at: DateTime<Utc>,
    pub gap_pct: f64,
    pub volume_surge: f64,
    pub institutional_ratio: f64,
    pub exchanges: Vec<String>,
    pub quality: f64,
    pub actionable: bool,
    pub fill_probability: f64,
    pub fill_status: FillStatus,
    pub fill_percentage: f64,
    pub filled_at: Option<DateTime<Utc>>,
}

impl FairValueGap {
    pub fn is_open(&self) -> bool {
        self.fill_status != FillStatus::Filled
    }

    /// Advance fill state with a later candle; returns true if it changed
    ///
    /// A bullish gap fills from the top as price returns down into it, a
    /// bearish gap from the bottom.
    pub fn update(&mut self, candle: &Candle) -> bool {
        if self.fill_status == FillStatus::Filled || candle.timestamp <= self.formed_at {
            return false;
        }

        let depth = match self.direction {
            Direction::Bullish => self.range.upper() - candle.low,
            Direction::Bearish => candle.high - self.range.lower(),
        };
        let pct = (safe_div(depth, self.range.width(), 0.0) * 100.0).clamp(0.0, 100.0);
        if pct <= self.fill_percentage {
            return false;
        }

        self.fill_percentage = pct;
        let status = if pct >= 100.0 {
            FillStatus::Filled
        } else {
            FillStatus::PartiallyFilled
        };
        self.fill_status = self.fill_status.max(status);
        if self.fill_status == FillStatus::Filled {
            self.filled_at = Some(candle.timestamp);
        }
        true
    }
}

#[derive(Debug, Clone, Default)]
pub struct FvgDetector {
    config: FvgConfig,
}

impl FvgDetector {
    pub fn new(config: FvgConfig) -> Self {
        Self { config }
    }

    pub fn config(&self) -> &FvgConfig {
        &self.config
    }

    /// Find gaps and replay the remaining candles through their fill state
    pub fn detect(&self, candles: &[Candle]) -> Result<Vec<FairValueGap>> {
        validate_candles(candles, Component::FairValueGaps)?;
        if candles.len() < 3 {
            debug!("FVG skipped: {} candles", candles.len());
            return Ok(Vec::new());
        }

        let mut gaps = Vec::new();
        for i in 2..candles.len() {
            if let Some(mut gap) = self.gap_at(candles, i) {
                for later in &candles[i + 1..] {
                    gap.update(later);
                }
                gaps.push(gap);
            }
        }

        info!(
            "FVG: {} gaps, {} actionable, {} open",
            gaps.len(),
            gaps.iter().filter(|g| g.actionable).count(),
            gaps.iter().filter(|g| g.is_open()).count()
        );
        Ok(gaps)
    }

    fn gap_at(&self, candles: &[Candle], i: usize) -> Option<FairValueGap> {
        let (first, middle, third) = (&candles[i - 2], &candles[i - 1], &candles[i]);

        let (direction, range) = if first.high < third.low && middle.is_bullish() {
            (Direction::Bullish, PriceRange::new(first.high, third.low))
        } else if first.low > third.high && middle.is_bearish() {
            (Direction::Bearish, PriceRange::new(third.high, first.low))
        } else {
            return None;
        };

        let gap_pct = safe_div(range.width(), range.upper(), 0.0) * 100.0;
        if gap_pct < self.config.min_gap_pct {
            return None;
        }

        let avg = trailing_volume(candles, i - 1, self.config.volume_lookback).unwrap_or(first.volume);
        let surge = safe_div(middle.volume, avg, self.config.surge_cap);
        if surge < self.config.min_volume_surge {
            return None;
        }

        let c = &self.config;
        let institutional_ratio = middle.institutional_ratio();
        let quality = clamp_score(
            capped_ratio(surge, c.surge_cap) * c.quality_volume_weight
                + capped_ratio(gap_pct, c.size_cap_pct) * c.quality_size_weight
                + capped_ratio(middle.exchange_count() as f64, c.exchange_cap as f64)
                    * c.quality_exchange_weight
                + institutional_ratio * c.quality_institutional_weight,
        );
        let fill_probability = clamp_score(
            (1.0 - capped_ratio(gap_pct, c.fill_size_cap_pct)) * c.fill_size_weight
                + capped_ratio(surge, c.surge_cap) * c.fill_surge_weight
                + institutional_ratio * c.fill_institutional_weight
                + quality / 100.0 * c.fill_quality_weight,
        );

        Some(FairValueGap {
            id: Uuid::new_v4(),
            direction,
            range,
            formed_at: middle.timestamp,
            gap_pct,
            volume_surge: surge,
            institutional_ratio,
            exchanges: middle.exchanges.iter().cloned().collect(),
            quality,
            actionable: quality >= c.actionable_quality,
            fill_probability,
            fill_status: FillStatus::Unfilled,
            fill_percentage: 0.0,
            filled_at: None,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::TimeZone;
    use rand::rngs::StdRng;
    use rand::{Rng, SeedableRng};
    use std::collections::BTreeSet;

    #[allow(clippy::too_many_arguments)]
    fn candle(i: usize, open: f64, high: f64, low: f64, close: f64, volume: f64, inst: f64, exchanges: &[&str]) -> Candle {
        Candle {
            timestamp: Utc.timestamp_opt(1_700_000_000 + 60 * i as i64, 0).unwrap(),
            open,
            high,
            low,
            close,
            volume,
            buy_volume: volume / 2.0,
            sell_volume: volume / 2.0,
            institutional_volume: volume * inst,
            retail_volume: volume * (1.0 - inst),
            trade_count: 5,
            exchanges: exchanges.iter().map(|e| e.to_string()).collect::<BTreeSet<_>>(),
        }
    }

    fn bullish_gap() -> Vec<Candle> {
        vec![
            candle(0, 97.0, 100.0, 96.0, 99.0, 10.0, 0.5, &["binance"]),
            candle(1, 101.0, 109.0, 100.5, 108.0, 50.0, 0.8, &["binance", "coinbase", "kraken"]),
            candle(2, 110.5, 113.0, 110.0, 112.0, 20.0, 0.5, &["binance"]),
        ]
    }

    #[test]
    fn test_bullish_gap_between_first_high_and_third_low() {
        let gaps = FvgDetector::default().detect(&bullish_gap()).unwrap();
        assert_eq!(gaps.len(), 1);

        let gap = &gaps[0];
        assert_eq!(gap.direction, Direction::Bullish);
        assert_eq!(gap.range.lower(), 100.0);
        assert_eq!(gap.range.upper(), 110.0);
        assert!((gap.gap_pct - 9.0909).abs() < 1e-3);
        assert!(gap.actionable);
        assert_eq!(gap.fill_status, FillStatus::Unfilled);
        assert_eq!(gap.formed_at, bullish_gap()[1].timestamp);
        assert!(gap.fill_probability >= 0.0 && gap.fill_probability <= 100.0);
    }

    #[test]
    fn test_middle_candle_needs_conviction_and_surge() {
        let mut candles = bullish_gap();
        candles[1].close = 100.8;
        candles[1].open = 108.0;
        assert!(FvgDetector::default().detect(&candles).unwrap().is_empty());

        let mut candles = bullish_gap();
        candles[1].volume = 12.0;
        assert!(FvgDetector::default().detect(&candles).unwrap().is_empty());
    }

    #[test]
    fn test_bearish_gap() {
        let candles = vec![
            candle(0, 112.0, 113.0, 110.0, 111.0, 10.0, 0.5, &["binance"]),
            candle(1, 109.0, 109.5, 101.0, 102.0, 40.0, 0.5, &["binance", "okx"]),
            candle(2, 101.0, 104.0, 99.0, 100.0, 10.0, 0.5, &["binance"]),
        ];
        let gaps = FvgDetector::default().detect(&candles).unwrap();
        assert_eq!(gaps.len(), 1);
        assert_eq!(gaps[0].direction, Direction::Bearish);
        assert_eq!(gaps[0].range.lower(), 104.0);
        assert_eq!(gaps[0].range.upper(), 110.0);
    }

    #[test]
    fn test_fill_progresses_and_never_reverses() {
        let mut candles = bullish_gap();
        candles.push(candle(3, 112.0, 112.5, 105.0, 107.0, 10.0, 0.5, &["binance"]));
        candles.push(candle(4, 107.0, 111.0, 106.0, 110.5, 10.0, 0.5, &["binance"]));

        let gaps = FvgDetector::default().detect(&candles).unwrap();
        let mut gap = gaps[0].clone();
        assert_eq!(gap.fill_status, FillStatus::PartiallyFilled);
        assert_eq!(gap.fill_percentage, 50.0);

        assert!(gap.update(&candle(5, 110.0, 110.5, 99.5, 100.0, 10.0, 0.5, &["binance"])));
        assert_eq!(gap.fill_status, FillStatus::Filled);
        assert_eq!(gap.fill_percentage, 100.0);
        assert_eq!(gap.filled_at, Some(candle(5, 0.0, 0.0, 0.0, 0.0, 0.0, 0.0, &[]).timestamp));

        assert!(!gap.update(&candle(6, 114.2, 115.0, 114.0, 114.5, 10.0, 0.5, &["binance"])));
        assert_eq!(gap.fill_status, FillStatus::Filled);
    }

    #[test]
    fn test_short_input_is_empty() {
        let detector = FvgDetector::default();
        assert!(detector.detect(&[]).unwrap().is_empty());
        assert!(detector.detect(&bullish_gap()[..2]).unwrap().is_empty());
    }

    #[test]
    fn test_fill_percentage_monotonic_on_random_walk() {
        let mut rng = StdRng::seed_from_u64(5);
        let mut price: f64 = 1000.0;
        let candles: Vec<Candle> = (0..3000)
            .map(|i| {
                let open = price;
                price += rng.gen_range(-2.0..2.0);
                let high = open.max(price) + rng.gen_range(0.0..0.3);
                let low = open.min(price) - rng.gen_range(0.0..0.3);
                let volume = rng.gen_range(5.0..40.0);
                candle(i, open, high, low, price, volume, rng.gen_range(0.0..1.0), &["binance", "coinbase"])
            })
            .collect();

        let detector = FvgDetector::default();
        let gaps = detector.detect(&candles).unwrap();
        assert!(!gaps.is_empty());

        for gap in &gaps {
            assert!(gap.quality >= 0.0 && gap.quality <= 100.0);
            assert!(gap.fill_probability >= 0.0 && gap.fill_probability <= 100.0);

            let mut replay = FairValueGap {
                fill_status: FillStatus::Unfilled,
                fill_percentage: 0.0,
                filled_at: None,
                ..gap.clone()
            };
            let mut last_pct = 0.0;
            let mut last_status = FillStatus::Unfilled;
            for c in candles.iter().filter(|c| c.timestamp > gap.formed_at) {
                replay.update(c);
                assert!(replay.fill_percentage >= last_pct);
                assert!(replay.fill_status >= last_status);
                last_pct = replay.fill_percentage;
                last_status = replay.fill_status;
            }
            assert_eq!(replay.fill_status, gap.fill_status);
        }
    }
}
