//! Confluence scoring and signal construction

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::analytics::scoring::clamp_score;
use crate::analytics::{FairValueGap, LiquidityZone, OrderBlock, StructureAnalysis, ZoneType};
use crate::config::ConfluenceConfig;
use crate::types::{Bias, Direction, PriceRange};

/// Trade direction
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum SignalDirection {
    Long,
    Short,
}

impl std::fmt::Display for SignalDirection {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            SignalDirection::Long => write!(f, "Long"),
            SignalDirection::Short => write!(f, "Short"),
        }
    }
}

/// Banded view of the confluence score
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum SetupQuality {
    VeryHigh,
    High,
    Medium,
    Low,
    #[default]
    VeryLow,
}

impl SetupQuality {
    pub fn from_score(score: f64, config: &ConfluenceConfig) -> Self {
        if score >= config.very_high_quality {
            Self::VeryHigh
        } else if score >= config.high_quality {
            Self::High
        } else if score >= config.medium_quality {
            Self::Medium
        } else if score >= config.low_quality {
            Self::Low
        } else {
            Self::VeryLow
        }
    }
}

/// Detector that produced a signal's entry zone
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum SignalSource {
    OrderBlock,
    FairValueGap,
    Liquidity(ZoneType),
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SmcSignal {
    pub id: Uuid,
    pub symbol: String,
    pub direction: SignalDirection,
    pub entry: f64,
    pub stop_loss: f64,
    pub targets: Vec<f64>,
    /// |entry - stop_loss|
    pub risk: f64,
    pub confluence: f64,
    pub quality: SetupQuality,
    pub source: SignalSource,
    pub zone: PriceRange,
    pub created_at: DateTime<Utc>,
    pub expires_at: DateTime<Utc>,
}

impl SmcSignal {
    pub fn is_expired(&self, now: DateTime<Utc>) -> bool {
        now >= self.expires_at
    }

    /// Reward-to-risk for the nth target
    pub fn risk_reward(&self, target: usize) -> Option<f64> {
        let t = self.targets.get(target)?;
        if self.risk > 0.0 {
            Some((t - self.entry).abs() / self.risk)
        } else {
            None
        }
    }
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct ConfluenceScore {
    pub bullish_points: f64,
    pub bearish_points: f64,
    /// bullish minus bearish
    pub net_points: f64,
    pub bias: Bias,
    pub confluence: f64,
    pub quality: SetupQuality,
}

fn boosted(config: &ConfluenceConfig, points: f64, institutional_ratio: f64, exchanges: usize) -> f64 {
    let mut points = points;
    if institutional_ratio >= config.institutional_boost_ratio {
        points *= config.institutional_boost;
    }
    if exchanges >= config.multi_exchange_min {
        points *= config.multi_exchange_boost;
    }
    points
}

/// Signed point accumulation across every detector
pub fn score_confluence(
    config: &ConfluenceConfig,
    order_blocks: &[OrderBlock],
    gaps: &[FairValueGap],
    structure: &StructureAnalysis,
    zones: &[LiquidityZone],
) -> ConfluenceScore {
    let mut bullish = 0.0;
    let mut bearish = 0.0;
    let mut add = |direction: Direction, points: f64| match direction {
        Direction::Bullish => bullish += points,
        Direction::Bearish => bearish += points,
    };

    for block in order_blocks.iter().filter(|b| b.is_active()) {
        let base = block.confidence / 100.0 * config.order_block_points;
        add(
            block.direction(),
            boosted(config, base, block.institutional_ratio, block.exchanges.len()),
        );
    }

    for gap in gaps.iter().filter(|g| g.actionable && g.is_open()) {
        let base = gap.quality / 100.0 * config.fvg_points;
        add(gap.direction, boosted(config, base, gap.institutional_ratio, gap.exchanges.len()));
    }

    let start = structure.breaks.len().saturating_sub(config.recent_breaks);
    for brk in &structure.breaks[start..] {
        let base = brk.strength / 100.0 * config.structure_points;
        add(
            brk.direction,
            boosted(config, base, brk.institutional_ratio, brk.confirming_exchanges.len()),
        );
    }

    for zone in zones.iter().filter(|z| !z.mitigated) {
        let base = zone.confluence / 100.0 * config.liquidity_points;
        add(
            zone.direction,
            boosted(config, base, zone.institutional_ratio, zone.exchange_count),
        );
    }

    if let Some(direction) = structure.trend.direction() {
        add(direction, config.trend_points);
    }

    let net = bullish - bearish;
    let bias = if net > config.neutral_band {
        Bias::Bullish
    } else if net < -config.neutral_band {
        Bias::Bearish
    } else {
        Bias::Neutral
    };
    let confluence = if config.points_scale > 0.0 {
        clamp_score(net.abs() / config.points_scale * 100.0)
    } else {
        0.0
    };

    ConfluenceScore {
        bullish_points: bullish,
        bearish_points: bearish,
        net_points: net,
        bias,
        confluence,
        quality: SetupQuality::from_score(confluence, config),
    }
}

/// A directional price zone a signal can be anchored to
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct SignalZone {
    pub source: SignalSource,
    pub direction: Direction,
    pub range: PriceRange,
    pub score: f64,
}

/// Active blocks, open actionable gaps and unmitigated liquidity zones
pub fn collect_zones(order_blocks: &[OrderBlock], gaps: &[FairValueGap], zones: &[LiquidityZone]) -> Vec<SignalZone> {
    let blocks = order_blocks.iter().filter(|b| b.is_active()).map(|b| SignalZone {
        source: SignalSource::OrderBlock,
        direction: b.direction(),
        range: b.range,
        score: b.confidence,
    });
    let fvgs = gaps.iter().filter(|g| g.actionable && g.is_open()).map(|g| SignalZone {
        source: SignalSource::FairValueGap,
        direction: g.direction,
        range: g.range,
        score: g.quality,
    });
    let liquidity = zones.iter().filter(|z| !z.mitigated).map(|z| SignalZone {
        source: SignalSource::Liquidity(z.zone_type),
        direction: z.direction,
        range: z.range,
        score: z.confluence,
    });
    blocks.chain(fvgs).chain(liquidity).collect()
}

/// Build signals from the nearest distinct zones on the side of the bias
///
/// Long: a bullish zone with its floor below price; entry at the zone top
/// (or price, if already inside), stop under the floor. Short mirrors it.
pub fn build_signals(
    symbol: &str,
    score: &ConfluenceScore,
    price: f64,
    zones: &[SignalZone],
    config: &ConfluenceConfig,
    as_of: DateTime<Utc>,
) -> Vec<SmcSignal> {
    if score.confluence < config.min_signal_confluence || !price.is_finite() {
        return Vec::new();
    }
    let Some(bias_direction) = score.bias.direction() else {
        return Vec::new();
    };

    let buffer = config.stop_buffer_pct / 100.0;
    let mut candidates: Vec<(f64, &SignalZone, f64, f64)> = zones
        .iter()
        .filter(|z| z.direction == bias_direction)
        .filter_map(|z| {
            let (entry, stop) = match bias_direction {
                Direction::Bullish if z.range.lower() < price => {
                    (z.range.upper().min(price), z.range.lower() * (1.0 - buffer))
                }
                Direction::Bearish if z.range.upper() > price => {
                    (z.range.lower().max(price), z.range.upper() * (1.0 + buffer))
                }
                _ => return None,
            };
            Some(((price - entry).abs(), z, entry, stop))
        })
        .collect();
    candidates.sort_by(|a, b| a.0.total_cmp(&b.0).then(b.1.score.total_cmp(&a.1.score)));

    let mut used: Vec<PriceRange> = Vec::new();
    let mut signals = Vec::new();
    for (_, zone, entry, stop) in candidates {
        if signals.len() >= config.max_signals {
            break;
        }
        if used.iter().any(|r| r.overlaps(&zone.range)) {
            continue;
        }
        let risk = (entry - stop).abs();
        if risk <= 0.0 || !risk.is_finite() {
            continue;
        }
        let (direction, sign) = match bias_direction {
            Direction::Bullish => (SignalDirection::Long, 1.0),
            Direction::Bearish => (SignalDirection::Short, -1.0),
        };
        used.push(zone.range);
        signals.push(SmcSignal {
            id: Uuid::new_v4(),
            symbol: symbol.to_string(),
            direction,
            entry,
            stop_loss: stop,
            targets: config
                .target_multiples
                .iter()
                .map(|m| entry + sign * m * risk)
                .collect(),
            risk,
            confluence: score.confluence,
            quality: score.quality,
            source: zone.source,
            zone: zone.range,
            created_at: as_of,
            expires_at: as_of + config.signal_ttl(),
        });
    }

    signals
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::analytics::{BlockState, BreakType, FillStatus, StructureBreak, SwingKind, SwingPoint};
    use chrono::TimeZone;

    fn ts() -> DateTime<Utc> {
        Utc.timestamp_opt(1_700_000_000, 0).unwrap()
    }

    fn exchanges(n: usize) -> Vec<String> {
        ["coinbase", "kraken", "binance"][..n].iter().map(|s| s.to_string()).collect()
    }

    fn block(direction: Direction, lower: f64, upper: f64, confidence: f64) -> OrderBlock {
        OrderBlock {
            id: Uuid::new_v4(),
            block_type: direction.into(),
            range: PriceRange::new(lower, upper),
            formed_at: ts(),
            confidence,
            volume: 100.0,
            volume_spike: 3.0,
            body_ratio: 0.8,
            institutional_ratio: 0.6,
            exchanges: exchanges(3),
            state: BlockState::Active,
            touch_count: 0,
            last_touched_at: None,
            mitigated_at: None,
        }
    }

    fn gap(direction: Direction, lower: f64, upper: f64, quality: f64) -> FairValueGap {
        FairValueGap {
            id: Uuid::new_v4(),
            direction,
            range: PriceRange::new(lower, upper),
            formed_at: ts(),
            gap_pct: 1.0,
            volume_surge: 2.0,
            institutional_ratio: 0.6,
            exchanges: exchanges(3),
            quality,
            actionable: quality >= 60.0,
            fill_probability: 50.0,
            fill_status: FillStatus::Unfilled,
            fill_percentage: 0.0,
            filled_at: None,
        }
    }

    fn structure(direction: Direction, strength: f64) -> StructureAnalysis {
        let swing = SwingPoint {
            index: 10,
            kind: SwingKind::High,
            price: 101.0,
            timestamp: ts(),
            volume: 10.0,
            institutional_ratio: 0.5,
            confirmed: true,
        };
        StructureAnalysis {
            swings: vec![swing.clone()],
            breaks: vec![StructureBreak {
                id: Uuid::new_v4(),
                break_type: BreakType::Bos,
                direction,
                price: 101.0,
                timestamp: ts(),
                broken_swing: swing,
                strength,
                institutional_ratio: 0.6,
                confirming_exchanges: exchanges(3),
            }],
            trend: direction.into(),
            tracked_trend: direction.into(),
        }
    }

    #[test]
    fn test_quality_bands() {
        let config = ConfluenceConfig::default();
        assert_eq!(SetupQuality::from_score(80.0, &config), SetupQuality::VeryHigh);
        assert_eq!(SetupQuality::from_score(79.9, &config), SetupQuality::High);
        assert_eq!(SetupQuality::from_score(65.0, &config), SetupQuality::High);
        assert_eq!(SetupQuality::from_score(50.0, &config), SetupQuality::Medium);
        assert_eq!(SetupQuality::from_score(30.0, &config), SetupQuality::Low);
        assert_eq!(SetupQuality::from_score(29.9, &config), SetupQuality::VeryLow);
    }

    #[test]
    fn test_nothing_scores_neutral_zero() {
        let score = score_confluence(&ConfluenceConfig::default(), &[], &[], &StructureAnalysis::empty(), &[]);
        assert_eq!(score.bias, Bias::Neutral);
        assert_eq!(score.confluence, 0.0);
        assert_eq!(score.quality, SetupQuality::VeryLow);
    }

    #[test]
    fn test_aligned_detectors_score_bullish() {
        let config = ConfluenceConfig::default();
        let blocks = vec![
            block(Direction::Bullish, 100.0, 102.0, 90.0),
            block(Direction::Bullish, 95.0, 96.0, 90.0),
        ];
        let gaps = vec![gap(Direction::Bullish, 103.0, 104.0, 90.0)];
        let score = score_confluence(&config, &blocks, &gaps, &structure(Direction::Bullish, 80.0), &[]);

        // Each element carries both boosts (x1.5)
        let expected = 2.0 * 0.9 * 25.0 * 1.5 + 0.9 * 20.0 * 1.5 + 0.8 * 30.0 * 1.5 + 20.0;
        assert!((score.bullish_points - expected).abs() < 1e-9);
        assert_eq!(score.bearish_points, 0.0);
        assert_eq!(score.bias, Bias::Bullish);
        assert!((score.confluence - expected / 2.0).abs() < 1e-9);
        assert_eq!(score.quality, SetupQuality::High);
    }

    #[test]
    fn test_mitigated_and_filled_elements_do_not_count() {
        let mut b = block(Direction::Bearish, 110.0, 112.0, 90.0);
        b.state = BlockState::Mitigated;
        let mut g = gap(Direction::Bearish, 108.0, 109.0, 90.0);
        g.fill_status = FillStatus::Filled;
        let score = score_confluence(&ConfluenceConfig::default(), &[b], &[g], &StructureAnalysis::empty(), &[]);
        assert_eq!(score.bearish_points, 0.0);
    }

    #[test]
    fn test_long_signals_from_nearest_zones() {
        let config = ConfluenceConfig::default();
        let score = ConfluenceScore {
            bias: Bias::Bullish,
            confluence: 75.0,
            quality: SetupQuality::High,
            ..Default::default()
        };
        let zones = collect_zones(
            &[block(Direction::Bullish, 100.0, 102.0, 90.0)],
            &[gap(Direction::Bullish, 103.0, 104.0, 90.0)],
            &[],
        );
        let signals = build_signals("BTC-USD", &score, 105.0, &zones, &config, ts());
        assert_eq!(signals.len(), 2);

        let first = &signals[0];
        assert_eq!(first.direction, SignalDirection::Long);
        assert_eq!(first.source, SignalSource::FairValueGap);
        assert_eq!(first.entry, 104.0);
        assert!((first.stop_loss - 103.0 * 0.999).abs() < 1e-9);
        assert!((first.risk - (104.0 - 103.0 * 0.999)).abs() < 1e-9);
        assert_eq!(first.targets.len(), 3);
        assert!((first.risk_reward(2).unwrap() - 4.0).abs() < 1e-9);
        assert_eq!(first.expires_at, ts() + chrono::Duration::hours(4));

        assert_eq!(signals[1].source, SignalSource::OrderBlock);
        assert_eq!(signals[1].entry, 102.0);
    }

    #[test]
    fn test_short_signal_mirrors_long() {
        let score = ConfluenceScore {
            bias: Bias::Bearish,
            confluence: 90.0,
            quality: SetupQuality::VeryHigh,
            ..Default::default()
        };
        let zones = collect_zones(&[block(Direction::Bearish, 110.0, 112.0, 80.0)], &[], &[]);
        let signals = build_signals("BTC-USD", &score, 105.0, &zones, &ConfluenceConfig::default(), ts());
        assert_eq!(signals.len(), 1);
        let s = &signals[0];
        assert_eq!(s.direction, SignalDirection::Short);
        assert_eq!(s.entry, 110.0);
        assert!(s.stop_loss > 112.0);
        assert!(s.targets.iter().all(|t| *t < s.entry));
    }

    #[test]
    fn test_no_signal_below_threshold_or_when_neutral() {
        let config = ConfluenceConfig::default();
        let zones = collect_zones(&[block(Direction::Bullish, 100.0, 102.0, 90.0)], &[], &[]);

        let weak = ConfluenceScore {
            bias: Bias::Bullish,
            confluence: 69.9,
            ..Default::default()
        };
        assert!(build_signals("BTC-USD", &weak, 105.0, &zones, &config, ts()).is_empty());

        let neutral = ConfluenceScore {
            bias: Bias::Neutral,
            confluence: 95.0,
            ..Default::default()
        };
        assert!(build_signals("BTC-USD", &neutral, 105.0, &zones, &config, ts()).is_empty());
    }

    #[test]
    fn test_overlapping_zones_yield_one_signal() {
        let score = ConfluenceScore {
            bias: Bias::Bullish,
            confluence: 85.0,
            ..Default::default()
        };
        let zones = collect_zones(
            &[block(Direction::Bullish, 100.0, 102.0, 90.0)],
            &[gap(Direction::Bullish, 101.0, 102.0, 70.0)],
            &[],
        );
        let signals = build_signals("BTC-USD", &score, 105.0, &zones, &ConfluenceConfig::default(), ts());
        assert_eq!(signals.len(), 1);
        assert_eq!(signals[0].source, SignalSource::OrderBlock);
    }
}
