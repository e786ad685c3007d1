//! Market structure: swing points, BOS and CHoCH
//!
//! Swings are fractal pivots over `swing_lookback` candles on each side.
//! Breaks come from walking consecutive confirmed swings against the
//! tracked trend:
//!
//! | trend    | HH           | HL           | LH           | LL           |
//! |----------|--------------|--------------|--------------|--------------|
//! | none     | BOS bullish  | -            | -            | BOS bearish  |
//! | bullish  | BOS bullish  | -            | CHoCH bearish| CHoCH bearish|
//! | bearish  | CHoCH bullish| CHoCH bullish| -            | BOS bearish  |

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use tracing::{debug, info};
use uuid::Uuid;

use super::scoring::{capped_ratio, clamp_score, mean, safe_div, trailing_volume, validate_candles};
use crate::error::{Component, Result};
use crate::types::{Bias, Candle, Direction};

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct StructureConfig {
    /// Candles required on each side of a swing (default: 5)
    pub swing_lookback: usize,
    /// Minimum distance of the swing extreme from the local mean price, in percent
    pub min_swing_size_pct: f64,
    /// Candles used for the trailing volume average
    pub volume_lookback: usize,
    /// Spike ratio that earns the full volume score
    pub volume_spike_cap: f64,
    pub volume_weight: f64,
    pub institutional_weight: f64,
    pub exchange_weight: f64,
    /// Exchange count that earns the full exchange score
    pub exchange_cap: usize,
    /// Breaks considered for the overall trend
    pub trend_breaks: usize,
}

impl Default for StructureConfig {
    fn default() -> Self {
        Self {
            swing_lookback: 5,
            min_swing_size_pct: 0.1,
            volume_lookback: 20,
            volume_spike_cap: 3.0,
            volume_weight: 40.0,
            institutional_weight: 35.0,
            exchange_weight: 25.0,
            exchange_cap: 3,
            trend_breaks: 5,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum SwingKind {
    High,
    Low,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SwingPoint {
    /// Index into the analyzed candle slice
    pub index: usize,
    pub kind: SwingKind,
    pub price: f64,
    pub timestamp: DateTime<Utc>,
    pub volume: f64,
    pub institutional_ratio: f64,
    /// False until `swing_lookback` candles have printed after it
    pub confirmed: bool,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum BreakType {
    #[serde(rename = "BOS")]
    Bos,
    #[serde(rename = "CHoCH")]
    Choch,
}

impl std::fmt::Display for BreakType {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            BreakType::Bos => write!(f, "BOS"),
            BreakType::Choch => write!(f, "CHoCH"),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct StructureBreak {
    pub id: Uuid,
    pub break_type: BreakType,
    pub direction: Direction,
    pub price: f64,
    pub timestamp: DateTime<Utc>,
    pub broken_swing: SwingPoint,
    pub strength: f64,
    /// Institutional share of volume on the break candle
    pub institutional_ratio: f64,
    pub confirming_exchanges: Vec<String>,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct StructureAnalysis {
    pub swings: Vec<SwingPoint>,
    pub breaks: Vec<StructureBreak>,
    /// Strength-weighted direction of the most recent breaks
    pub trend: Bias,
    /// Trend state left after walking every swing
    pub tracked_trend: Bias,
}

impl StructureAnalysis {
    pub fn empty() -> Self {
        Self::default()
    }

    pub fn latest_break(&self) -> Option<&StructureBreak> {
        self.breaks.last()
    }
}

/// How a swing compares with the previous swing of the same kind
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum SwingClass {
    HigherHigh,
    LowerHigh,
    HigherLow,
    LowerLow,
}

#[derive(Debug, Clone, Default)]
pub struct StructureAnalyzer {
    config: StructureConfig,
}

impl StructureAnalyzer {
    pub fn new(config: StructureConfig) -> Self {
        Self { config }
    }

    pub fn config(&self) -> &StructureConfig {
        &self.config
    }

    pub fn analyze(&self, candles: &[Candle]) -> Result<StructureAnalysis> {
        validate_candles(candles, Component::Structure)?;

        let k = self.config.swing_lookback.max(1);
        if candles.len() < 2 * k + 1 {
            debug!(
                "Structure skipped: {} candles, need {}",
                candles.len(),
                2 * k + 1
            );
            return Ok(StructureAnalysis::empty());
        }

        let swings = self.find_swings(candles);
        let (breaks, tracked) = self.walk_breaks(candles, &swings);
        let trend = self.weighted_trend(&breaks);

        info!(
            "Structure: {} swings, {} breaks, trend={:?} tracked={:?}",
            swings.len(),
            breaks.len(),
            trend,
            tracked
        );

        Ok(StructureAnalysis {
            swings,
            breaks,
            trend,
            tracked_trend: tracked,
        })
    }

    /// Swing highs and lows in index order; tentative pivots near the end
    /// are included with `confirmed = false`
    pub fn find_swings(&self, candles: &[Candle]) -> Vec<SwingPoint> {
        let k = self.config.swing_lookback.max(1);
        let n = candles.len();
        let mut swings = Vec::new();

        for i in k..n {
            let right_end = (i + k).min(n - 1);
            let confirmed = i + k < n;
            let window = &candles[i - k..=right_end];
            let local_mean = mean(window.iter().map(|c| c.typical_price())).unwrap_or(0.0);
            let c = &candles[i];

            let is_high = window
                .iter()
                .enumerate()
                .all(|(j, other)| j == k || other.high < c.high);
            let is_low = window
                .iter()
                .enumerate()
                .all(|(j, other)| j == k || other.low > c.low);

            for (kind, price, qualifies) in [
                (SwingKind::High, c.high, is_high),
                (SwingKind::Low, c.low, is_low),
            ] {
                if !qualifies {
                    continue;
                }
                let deviation_pct = safe_div((price - local_mean).abs(), local_mean, 0.0) * 100.0;
                if deviation_pct < self.config.min_swing_size_pct {
                    continue;
                }
                swings.push(SwingPoint {
                    index: i,
                    kind,
                    price,
                    timestamp: c.timestamp,
                    volume: c.volume,
                    institutional_ratio: c.institutional_ratio(),
                    confirmed,
                });
            }
        }

        swings
    }

    fn walk_breaks(&self, candles: &[Candle], swings: &[SwingPoint]) -> (Vec<StructureBreak>, Bias) {
        let mut breaks = Vec::new();
        let mut trend = Bias::Neutral;
        let mut last_high: Option<&SwingPoint> = None;
        let mut last_low: Option<&SwingPoint> = None;

        for swing in swings.iter().filter(|s| s.confirmed) {
            let previous = match swing.kind {
                SwingKind::High => last_high.replace(swing),
                SwingKind::Low => last_low.replace(swing),
            };
            let Some(prev) = previous else { continue };

            let class = match swing.kind {
                SwingKind::High if swing.price > prev.price => SwingClass::HigherHigh,
                SwingKind::High if swing.price < prev.price => SwingClass::LowerHigh,
                SwingKind::Low if swing.price > prev.price => SwingClass::HigherLow,
                SwingKind::Low if swing.price < prev.price => SwingClass::LowerLow,
                // Equal swings neither extend nor break structure
                _ => continue,
            };

            let outcome = match (trend, class) {
                (Bias::Neutral, SwingClass::HigherHigh) => Some((BreakType::Bos, Direction::Bullish)),
                (Bias::Neutral, SwingClass::LowerLow) => Some((BreakType::Bos, Direction::Bearish)),
                (Bias::Bullish, SwingClass::HigherHigh) => Some((BreakType::Bos, Direction::Bullish)),
                (Bias::Bullish, SwingClass::LowerHigh | SwingClass::LowerLow) => {
                    Some((BreakType::Choch, Direction::Bearish))
                }
                (Bias::Bearish, SwingClass::LowerLow) => Some((BreakType::Bos, Direction::Bearish)),
                (Bias::Bearish, SwingClass::HigherLow | SwingClass::HigherHigh) => {
                    Some((BreakType::Choch, Direction::Bullish))
                }
                _ => None,
            };

            if let Some((break_type, direction)) = outcome {
                let idx = self.break_candle(candles, prev, swing, class);
                breaks.push(self.build_break(candles, idx, break_type, direction, prev, swing, class));
                trend = direction.into();
            }
        }

        (breaks, trend)
    }

    /// First close beyond the broken level between the two swings; falls
    /// back to the swing candle itself
    fn break_candle(&self, candles: &[Candle], prev: &SwingPoint, swing: &SwingPoint, class: SwingClass) -> usize {
        let range = prev.index + 1..=swing.index;
        let found = match class {
            SwingClass::HigherHigh => candles[range.clone()]
                .iter()
                .position(|c| c.close > prev.price),
            SwingClass::LowerLow => candles[range.clone()]
                .iter()
                .position(|c| c.close < prev.price),
            SwingClass::HigherLow | SwingClass::LowerHigh => None,
        };
        found.map(|offset| prev.index + 1 + offset).unwrap_or(swing.index)
    }

    #[allow(clippy::too_many_arguments)]
    fn build_break(
        &self,
        candles: &[Candle],
        idx: usize,
        break_type: BreakType,
        direction: Direction,
        prev: &SwingPoint,
        swing: &SwingPoint,
        class: SwingClass,
    ) -> StructureBreak {
        let candle = &candles[idx];
        // HH/LL break through the prior level; HL/LH mark where the new swing held
        let price = match class {
            SwingClass::HigherHigh | SwingClass::LowerLow => prev.price,
            SwingClass::HigherLow | SwingClass::LowerHigh => swing.price,
        };

        StructureBreak {
            id: Uuid::new_v4(),
            break_type,
            direction,
            price,
            timestamp: candle.timestamp,
            broken_swing: prev.clone(),
            strength: self.break_strength(candles, idx),
            institutional_ratio: candle.institutional_ratio(),
            confirming_exchanges: candle.exchanges.iter().cloned().collect(),
        }
    }

    /// Volume spike, institutional share and exchange count at the break candle
    pub fn break_strength(&self, candles: &[Candle], idx: usize) -> f64 {
        let candle = &candles[idx];
        let spike = trailing_volume(candles, idx, self.config.volume_lookback)
            .map(|avg| safe_div(candle.volume, avg, 1.0))
            .unwrap_or(1.0);

        clamp_score(
            capped_ratio(spike, self.config.volume_spike_cap) * self.config.volume_weight
                + candle.institutional_ratio() * self.config.institutional_weight
                + capped_ratio(candle.exchange_count() as f64, self.config.exchange_cap as f64)
                    * self.config.exchange_weight,
        )
    }

    fn weighted_trend(&self, breaks: &[StructureBreak]) -> Bias {
        let start = breaks.len().saturating_sub(self.config.trend_breaks.max(1));
        let score: f64 = breaks[start..]
            .iter()
            .map(|b| b.direction.sign() * b.strength)
            .sum();
        if score > 0.0 {
            Bias::Bullish
        } else if score < 0.0 {
            Bias::Bearish
        } else {
            Bias::Neutral
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::TimeZone;
    use std::collections::BTreeSet;

    fn candle(i: usize, mid: f64) -> Candle {
        Candle {
            timestamp: Utc.timestamp_opt(1_700_000_000 + 60 * i as i64, 0).unwrap(),
            open: mid,
            high: mid + 0.5,
            low: mid - 0.5,
            close: mid,
            volume: 10.0,
            buy_volume: 5.0,
            sell_volume: 5.0,
            institutional_volume: 6.0,
            retail_volume: 4.0,
            trade_count: 10,
            exchanges: BTreeSet::from(["binance".to_string(), "coinbase".to_string()]),
        }
    }

    /// Piecewise-linear mid prices through the pivots, `seg` candles per leg
    fn zigzag(pivots: &[f64], seg: usize) -> Vec<Candle> {
        let mut mids = vec![pivots[0]];
        for pair in pivots.windows(2) {
            for step in 1..=seg {
                mids.push(pair[0] + (pair[1] - pair[0]) * step as f64 / seg as f64);
            }
        }
        mids.iter().enumerate().map(|(i, m)| candle(i, *m)).collect()
    }

    #[test]
    fn test_lower_high_after_uptrend_is_bearish_choch() {
        let candles = zigzag(&[105.0, 100.0, 110.0, 105.0, 115.0, 108.0, 112.0, 100.0], 6);
        let analysis = StructureAnalyzer::default().analyze(&candles).unwrap();

        let kinds: Vec<(BreakType, Direction)> =
            analysis.breaks.iter().map(|b| (b.break_type, b.direction)).collect();
        assert_eq!(
            kinds,
            vec![
                (BreakType::Bos, Direction::Bullish),
                (BreakType::Choch, Direction::Bearish)
            ]
        );
        assert_eq!(analysis.tracked_trend, Bias::Bearish);

        let bos = &analysis.breaks[0];
        assert_eq!(bos.price, 110.5);
        assert_eq!(bos.broken_swing.kind, SwingKind::High);
        assert_eq!(bos.confirming_exchanges.len(), 2);
    }

    #[test]
    fn test_swings_require_strict_extremes() {
        // Flat top: two candles share the high
        let mut candles = zigzag(&[100.0, 110.0, 100.0], 6);
        candles[7].high = candles[6].high;
        let swings = StructureAnalyzer::default().find_swings(&candles);
        assert!(swings.iter().all(|s| s.kind != SwingKind::High));

        let candles = zigzag(&[100.0, 110.0, 100.0], 6);
        let swings = StructureAnalyzer::default().find_swings(&candles);
        let highs: Vec<&SwingPoint> = swings.iter().filter(|s| s.kind == SwingKind::High).collect();
        assert_eq!(highs.len(), 1);
        assert_eq!(highs[0].index, 6);
        assert!(highs[0].confirmed);
    }

    #[test]
    fn test_tentative_swing_is_not_used_for_breaks() {
        // The final high at 120 has only three candles after it
        let mut candles = zigzag(&[105.0, 100.0, 110.0, 104.0, 120.0], 6);
        let n = candles.len();
        candles.extend((0..3).map(|i| candle(n + i, 118.0 - i as f64)));
        let analysis = StructureAnalyzer::default().analyze(&candles).unwrap();

        let last_high = analysis
            .swings
            .iter()
            .filter(|s| s.kind == SwingKind::High)
            .last()
            .unwrap();
        assert_eq!(last_high.price, 120.5);
        assert!(!last_high.confirmed);
        assert!(analysis.breaks.is_empty());
    }

    #[test]
    fn test_min_swing_size_filters_noise() {
        let candles = zigzag(&[100.0, 100.2, 100.0], 6);
        let analyzer = StructureAnalyzer::new(StructureConfig {
            min_swing_size_pct: 1.0,
            ..Default::default()
        });
        assert!(analyzer.find_swings(&candles).is_empty());
    }

    #[test]
    fn test_too_few_candles_is_empty() {
        let candles = zigzag(&[100.0, 101.0], 4);
        let analysis = StructureAnalyzer::default().analyze(&candles).unwrap();
        assert_eq!(analysis, StructureAnalysis::empty());
        assert_eq!(analysis.trend, Bias::Neutral);
    }

    #[test]
    fn test_malformed_candle_is_rejected() {
        let mut candles = zigzag(&[100.0, 110.0, 100.0], 6);
        candles[3].close = f64::NAN;
        assert!(StructureAnalyzer::default().analyze(&candles).is_err());
    }

    #[test]
    fn test_break_strength_in_range() {
        let mut candles = zigzag(&[100.0, 110.0, 100.0, 120.0, 90.0], 6);
        candles[10].volume = 500.0;
        let analyzer = StructureAnalyzer::default();
        for idx in 0..candles.len() {
            let s = analyzer.break_strength(&candles, idx);
            assert!((0.0..=100.0).contains(&s));
        }
        assert!(analyzer.break_strength(&candles, 10) > analyzer.break_strength(&candles, 9));
    }
}
