//! Liquidity mapping: volume nodes, institutional clusters, sweeps and
//! injections, scored for confluence
//!
//! `ZoneBook` keeps the active zones for one symbol between passes.

use chrono::{DateTime, Duration, Utc};
use serde::{Deserialize, Serialize};
use std::collections::{BTreeSet, HashMap};
use tracing::{debug, info};
use uuid::Uuid;

use super::candles::ExchangeTiers;
use super::order_flow::OrderFlowProfile;
use super::scoring::{capped_ratio, clamp_score, percentile, safe_div, validate_candles};
use super::volume_profile::{VolumeProfileCalculator, VolumeProfileConfig};
use crate::error::{Component, Result};
use crate::types::{Candle, Direction, PriceRange, Trade};

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct LiquidityConfig {
    /// Bins in the cross-exchange volume histogram
    pub histogram_bins: usize,
    /// Bins above this volume percentile are high-volume nodes (default: 70)
    pub hvn_percentile: f64,
    /// Bins below this volume percentile are low-volume nodes (default: 30)
    pub lvn_percentile: f64,
    /// Institutional trades at or above this size percentile form clusters
    pub large_trade_percentile: f64,
    /// Max spread of a cluster, percent of its first price
    pub cluster_tolerance_pct: f64,
    pub min_cluster_trades: usize,
    /// Candles defining the extreme a sweep must exceed
    pub sweep_lookback: usize,
    pub sweep_volume_multiplier: f64,
    pub sweep_min_excursion_pct: f64,
    /// Candles allowed for price to close back inside
    pub sweep_reversal_candles: usize,
    /// Institutional volume vs trailing institutional average (default: 3.0)
    pub injection_multiplier: f64,
    pub injection_lookback: usize,
    pub hvn_base_score: f64,
    pub lvn_base_score: f64,
    pub order_block_base_score: f64,
    pub sweep_base_score: f64,
    pub injection_base_score: f64,
    pub strength_multiplier_min: f64,
    pub strength_multiplier_max: f64,
    pub institutional_bonus: f64,
    pub cross_exchange_bonus: f64,
    /// Distinct exchanges needed for the cross-exchange bonus
    pub min_cross_exchanges: usize,
    pub absorption_bonus: f64,
    pub iceberg_bonus: f64,
    /// Same-size prints at one price that suggest a refilling order
    pub iceberg_min_prints: usize,
    /// Zones scoring below this are discarded (default: 60)
    pub min_confluence: f64,
}

impl Default for LiquidityConfig {
    fn default() -> Self {
        Self {
            histogram_bins: 40,
            hvn_percentile: 70.0,
            lvn_percentile: 30.0,
            large_trade_percentile: 95.0,
            cluster_tolerance_pct: 0.1,
            min_cluster_trades: 3,
            sweep_lookback: 20,
            sweep_volume_multiplier: 2.0,
            sweep_min_excursion_pct: 0.5,
            sweep_reversal_candles: 3,
            injection_multiplier: 3.0,
            injection_lookback: 20,
            hvn_base_score: 50.0,
            lvn_base_score: 40.0,
            order_block_base_score: 55.0,
            sweep_base_score: 50.0,
            injection_base_score: 55.0,
            strength_multiplier_min: 0.5,
            strength_multiplier_max: 1.5,
            institutional_bonus: 15.0,
            cross_exchange_bonus: 10.0,
            min_cross_exchanges: 2,
            absorption_bonus: 10.0,
            iceberg_bonus: 5.0,
            iceberg_min_prints: 3,
            min_confluence: 60.0,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ZoneType {
    HighVolumeNode,
    LowVolumeNode,
    OrderBlockLiquidity,
    Sweep,
    Injection,
}

impl std::fmt::Display for ZoneType {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            ZoneType::HighVolumeNode => write!(f, "HVN"),
            ZoneType::LowVolumeNode => write!(f, "LVN"),
            ZoneType::OrderBlockLiquidity => write!(f, "OB-LIQ"),
            ZoneType::Sweep => write!(f, "SWEEP"),
            ZoneType::Injection => write!(f, "INJECTION"),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct LiquidityZone {
    pub id: Uuid,
    pub zone_type: ZoneType,
    pub range: PriceRange,
    /// Bullish zones sit below price as support, bearish above as resistance
    pub direction: Direction,
    pub volume: f64,
    /// Type-specific strength, 0-100
    pub strength: f64,
    pub institutional_ratio: f64,
    pub exchange_count: usize,
    pub has_absorption: bool,
    pub has_iceberg: bool,
    pub confluence: f64,
    pub created_at: DateTime<Utc>,
    pub touch_count: u32,
    pub mitigated: bool,
}

impl LiquidityZone {
    pub fn is_expired(&self, now: DateTime<Utc>, max_age: Duration) -> bool {
        now - self.created_at >= max_age
    }

    /// Advance with a later candle: a close through the far side mitigates
    pub fn update(&mut self, candle: &Candle) -> bool {
        if self.mitigated || candle.timestamp <= self.created_at {
            return false;
        }
        let closed_through = match self.direction {
            Direction::Bullish => candle.close < self.range.lower(),
            Direction::Bearish => candle.close > self.range.upper(),
        };
        if closed_through {
            self.mitigated = true;
            return true;
        }
        if self.range.intersects(candle.low, candle.high) {
            self.touch_count += 1;
            return true;
        }
        false
    }
}

/// Zone before confluence scoring
struct ZoneCandidate {
    zone_type: ZoneType,
    range: PriceRange,
    direction: Direction,
    volume: f64,
    /// 0..=1
    strength: f64,
    institutional_ratio: f64,
    exchange_count: usize,
    created_at: DateTime<Utc>,
}

#[derive(Debug, Clone, Default)]
pub struct LiquidityMapper {
    config: LiquidityConfig,
    tiers: ExchangeTiers,
}

impl LiquidityMapper {
    pub fn new(config: LiquidityConfig, tiers: ExchangeTiers) -> Self {
        Self { config, tiers }
    }

    pub fn config(&self) -> &LiquidityConfig {
        &self.config
    }

    /// Map every zone type and keep those meeting `min_confluence`,
    /// strongest first
    pub fn map(
        &self,
        trades: &[Trade],
        candles: &[Candle],
        order_flow: Option<&OrderFlowProfile>,
    ) -> Result<Vec<LiquidityZone>> {
        validate_candles(candles, Component::Liquidity)?;

        let mut valid: Vec<&Trade> = trades.iter().filter(|t| t.is_valid()).collect();
        valid.sort_by_key(|t| t.timestamp);

        let mut candidates = Vec::new();
        candidates.extend(self.volume_nodes(&valid));
        candidates.extend(self.order_block_liquidity(&valid));
        candidates.extend(self.sweeps(candles));
        candidates.extend(self.injections(candles));

        if candidates.is_empty() {
            debug!("Liquidity: no candidate zones");
            return Ok(Vec::new());
        }

        let total = candidates.len();
        let mut zones: Vec<LiquidityZone> = candidates
            .into_iter()
            .map(|c| self.score(c, &valid, order_flow))
            .filter(|z| z.confluence >= self.config.min_confluence)
            .collect();

        // Zones form mid-window; the candles after them decide whether they still stand
        for zone in &mut zones {
            for candle in candles {
                zone.update(candle);
            }
        }
        let scored = zones.len();
        zones.retain(|z| !z.mitigated);
        zones.sort_by(|a, b| b.confluence.total_cmp(&a.confluence));

        info!(
            "Liquidity: {} of {} candidate zones kept, {} already mitigated",
            zones.len(),
            total,
            scored - zones.len()
        );
        Ok(zones)
    }

    fn volume_nodes(&self, trades: &[&Trade]) -> Vec<ZoneCandidate> {
        let Some(last) = trades.last() else {
            return Vec::new();
        };
        let calculator = VolumeProfileCalculator::new(VolumeProfileConfig {
            bins: self.config.histogram_bins,
            ..Default::default()
        });
        let Some(bins) = calculator.build_bins(trades.iter().map(|t| (t.price, t.quantity, t.side))) else {
            return Vec::new();
        };

        let volumes: Vec<f64> = bins.iter().map(|b| b.volume).collect();
        let (Some(hvn_cut), Some(lvn_cut)) = (
            percentile(&volumes, self.config.hvn_percentile),
            percentile(&volumes, self.config.lvn_percentile),
        ) else {
            return Vec::new();
        };
        let max_volume = volumes.iter().copied().fold(0.0, f64::max);
        let mean_volume = safe_div(volumes.iter().sum(), volumes.len() as f64, 0.0);

        let node_type = |v: f64| {
            if v > hvn_cut {
                Some(ZoneType::HighVolumeNode)
            } else if v < lvn_cut {
                Some(ZoneType::LowVolumeNode)
            } else {
                None
            }
        };

        // Merge adjacent bins of the same node type
        let mut runs: Vec<(ZoneType, usize, usize)> = Vec::new();
        for (i, v) in volumes.iter().enumerate() {
            let Some(kind) = node_type(*v) else { continue };
            match runs.last_mut() {
                Some((k, _, end)) if *k == kind && *end + 1 == i => *end = i,
                _ => runs.push((kind, i, i)),
            }
        }

        runs.into_iter()
            .map(|(zone_type, start, end)| {
                let range = PriceRange::new(bins[start].lower, bins[end].upper);
                let volume: f64 = volumes[start..=end].iter().sum();
                let avg = volume / (end - start + 1) as f64;
                let strength = match zone_type {
                    ZoneType::HighVolumeNode => capped_ratio(avg, max_volume),
                    _ => 1.0 - capped_ratio(avg, mean_volume),
                };
                let (institutional_ratio, exchange_count) = self.trade_stats(trades, &range);
                ZoneCandidate {
                    zone_type,
                    range,
                    direction: if range.midpoint() <= last.price {
                        Direction::Bullish
                    } else {
                        Direction::Bearish
                    },
                    volume,
                    strength,
                    institutional_ratio,
                    exchange_count,
                    created_at: last.timestamp,
                }
            })
            .collect()
    }

    /// Clusters of unusually large institutional prints
    fn order_block_liquidity(&self, trades: &[&Trade]) -> Vec<ZoneCandidate> {
        let sizes: Vec<f64> = trades.iter().map(|t| t.quantity).collect();
        let Some(threshold) = percentile(&sizes, self.config.large_trade_percentile) else {
            return Vec::new();
        };

        let mut large: Vec<&Trade> = trades
            .iter()
            .copied()
            .filter(|t| t.quantity > 0.0 && t.quantity >= threshold && self.tiers.is_institutional(&t.exchange))
            .collect();
        large.sort_by(|a, b| a.price.total_cmp(&b.price));

        let mut clusters: Vec<Vec<&Trade>> = Vec::new();
        for trade in large {
            match clusters.last_mut() {
                Some(cluster)
                    if trade.price - cluster[0].price
                        <= cluster[0].price * self.config.cluster_tolerance_pct / 100.0 =>
                {
                    cluster.push(trade)
                }
                _ => clusters.push(vec![trade]),
            }
        }

        clusters
            .into_iter()
            .filter(|c| c.len() >= self.config.min_cluster_trades.max(1))
            .filter_map(|cluster| {
                let first = cluster.first()?;
                let last = cluster.last()?;
                let range = PriceRange::new(first.price, last.price);
                let volume: f64 = cluster.iter().map(|t| t.quantity).sum();
                let net: f64 = cluster.iter().map(|t| t.side.sign() * t.quantity).sum();
                let (institutional_ratio, exchange_count) = self.trade_stats(trades, &range);
                Some(ZoneCandidate {
                    zone_type: ZoneType::OrderBlockLiquidity,
                    range,
                    direction: if net >= 0.0 { Direction::Bullish } else { Direction::Bearish },
                    volume,
                    strength: capped_ratio(
                        cluster.len() as f64,
                        (self.config.min_cluster_trades.max(1) * 3) as f64,
                    ),
                    institutional_ratio,
                    exchange_count,
                    created_at: cluster.iter().map(|t| t.timestamp).max()?,
                })
            })
            .collect()
    }

    /// Spike candles that poke past the recent extreme and close back inside
    fn sweeps(&self, candles: &[Candle]) -> Vec<ZoneCandidate> {
        let lookback = self.config.sweep_lookback.max(1);
        let mut zones = Vec::new();

        for i in lookback..candles.len() {
            let c = &candles[i];
            let prior = &candles[i - lookback..i];
            let avg = safe_div(prior.iter().map(|p| p.volume).sum(), prior.len() as f64, 0.0);
            if avg <= 0.0 {
                continue;
            }
            let spike = c.volume / avg;
            if spike < self.config.sweep_volume_multiplier {
                continue;
            }

            let prior_high = prior.iter().map(|p| p.high).fold(f64::NEG_INFINITY, f64::max);
            let prior_low = prior.iter().map(|p| p.low).fold(f64::INFINITY, f64::min);
            let reversal = &candles[i..(i + 1 + self.config.sweep_reversal_candles).min(candles.len())];

            let swept_high = safe_div(c.high - prior_high, prior_high, 0.0) * 100.0
                >= self.config.sweep_min_excursion_pct
                && reversal.iter().any(|r| r.close < prior_high);
            let swept_low = safe_div(prior_low - c.low, prior_low, 0.0) * 100.0
                >= self.config.sweep_min_excursion_pct
                && reversal.iter().any(|r| r.close > prior_low);

            let strength = capped_ratio(spike, self.config.sweep_volume_multiplier * 2.0);
            let sweep = |range: PriceRange, direction: Direction| ZoneCandidate {
                zone_type: ZoneType::Sweep,
                range,
                direction,
                volume: c.volume,
                strength,
                institutional_ratio: c.institutional_ratio(),
                exchange_count: c.exchange_count(),
                created_at: c.timestamp,
            };
            if swept_high {
                zones.push(sweep(PriceRange::new(prior_high, c.high), Direction::Bearish));
            }
            if swept_low {
                zones.push(sweep(PriceRange::new(c.low, prior_low), Direction::Bullish));
            }
        }

        zones
    }

    /// Runs of candles whose institutional volume jumps over its trailing average
    fn injections(&self, candles: &[Candle]) -> Vec<ZoneCandidate> {
        let lookback = self.config.injection_lookback.max(1);
        let ratio_at = |i: usize| -> Option<f64> {
            if i < lookback {
                return None;
            }
            let prior = &candles[i - lookback..i];
            let avg = safe_div(
                prior.iter().map(|p| p.institutional_volume).sum(),
                prior.len() as f64,
                0.0,
            );
            let ratio = safe_div(candles[i].institutional_volume, avg, 0.0);
            (avg > 0.0 && ratio >= self.config.injection_multiplier).then_some(ratio)
        };

        let mut runs: Vec<(usize, usize, f64)> = Vec::new();
        for i in 0..candles.len() {
            let Some(ratio) = ratio_at(i) else { continue };
            match runs.last_mut() {
                Some((_, end, peak)) if *end + 1 == i => {
                    *end = i;
                    *peak = peak.max(ratio);
                }
                _ => runs.push((i, i, ratio)),
            }
        }

        runs.into_iter()
            .map(|(start, end, peak)| {
                let run = &candles[start..=end];
                let low = run.iter().map(|c| c.low).fold(f64::INFINITY, f64::min);
                let high = run.iter().map(|c| c.high).fold(f64::NEG_INFINITY, f64::max);
                let volume: f64 = run.iter().map(|c| c.volume).sum();
                let institutional: f64 = run.iter().map(|c| c.institutional_volume).sum();
                let exchanges: BTreeSet<&String> = run.iter().flat_map(|c| c.exchanges.iter()).collect();
                let direction = if run[run.len() - 1].close >= run[0].open {
                    Direction::Bullish
                } else {
                    Direction::Bearish
                };
                ZoneCandidate {
                    zone_type: ZoneType::Injection,
                    range: PriceRange::new(low, high),
                    direction,
                    volume,
                    strength: capped_ratio(peak, self.config.injection_multiplier * 2.0),
                    institutional_ratio: safe_div(institutional, volume, 0.0).clamp(0.0, 1.0),
                    exchange_count: exchanges.len(),
                    created_at: run[0].timestamp,
                }
            })
            .collect()
    }

    /// Institutional share of volume and distinct exchanges among trades in range
    fn trade_stats(&self, trades: &[&Trade], range: &PriceRange) -> (f64, usize) {
        let mut volume = 0.0;
        let mut institutional = 0.0;
        let mut exchanges = BTreeSet::new();
        for t in trades.iter().filter(|t| range.contains(t.price)) {
            volume += t.quantity;
            if self.tiers.is_institutional(&t.exchange) {
                institutional += t.quantity;
            }
            exchanges.insert(t.exchange.to_ascii_lowercase());
        }
        (safe_div(institutional, volume, 0.0).clamp(0.0, 1.0), exchanges.len())
    }

    /// Repeated same-size prints at one price inside the range
    fn has_iceberg(&self, trades: &[&Trade], range: &PriceRange) -> bool {
        let mut prints: HashMap<(u64, u64), usize> = HashMap::new();
        for t in trades.iter().filter(|t| range.contains(t.price) && t.quantity > 0.0) {
            *prints.entry((t.price.to_bits(), t.quantity.to_bits())).or_insert(0) += 1;
        }
        prints.values().any(|n| *n >= self.config.iceberg_min_prints.max(2))
    }

    fn base_score(&self, zone_type: ZoneType) -> f64 {
        match zone_type {
            ZoneType::HighVolumeNode => self.config.hvn_base_score,
            ZoneType::LowVolumeNode => self.config.lvn_base_score,
            ZoneType::OrderBlockLiquidity => self.config.order_block_base_score,
            ZoneType::Sweep => self.config.sweep_base_score,
            ZoneType::Injection => self.config.injection_base_score,
        }
    }

    fn score(
        &self,
        candidate: ZoneCandidate,
        trades: &[&Trade],
        order_flow: Option<&OrderFlowProfile>,
    ) -> LiquidityZone {
        let c = &self.config;
        let strength = candidate.strength.clamp(0.0, 1.0);
        let multiplier = c.strength_multiplier_min + (c.strength_multiplier_max - c.strength_multiplier_min) * strength;

        let has_absorption = order_flow
            .map(|of| of.absorption_events.iter().any(|e| candidate.range.contains(e.price)))
            .unwrap_or(false);
        let has_iceberg = self.has_iceberg(trades, &candidate.range);

        let mut confluence = self.base_score(candidate.zone_type) * multiplier
            + candidate.institutional_ratio * c.institutional_bonus;
        if candidate.exchange_count >= c.min_cross_exchanges {
            confluence += c.cross_exchange_bonus;
        }
        if has_absorption {
            confluence += c.absorption_bonus;
        }
        if has_iceberg {
            confluence += c.iceberg_bonus;
        }

        LiquidityZone {
            id: Uuid::new_v4(),
            zone_type: candidate.zone_type,
            range: candidate.range,
            direction: candidate.direction,
            volume: candidate.volume,
            strength: clamp_score(strength * 100.0),
            institutional_ratio: candidate.institutional_ratio,
            exchange_count: candidate.exchange_count,
            has_absorption,
            has_iceberg,
            confluence: clamp_score(confluence),
            created_at: candidate.created_at,
            touch_count: 0,
            mitigated: false,
        }
    }
}

/// Active zones for one symbol, bounded by count and age
#[derive(Debug, Clone)]
pub struct ZoneBook {
    capacity: usize,
    max_age: Duration,
    zones: Vec<LiquidityZone>,
    last_candle_at: Option<DateTime<Utc>>,
}

impl ZoneBook {
    pub fn new(capacity: usize, max_age: Duration) -> Self {
        Self {
            capacity,
            max_age,
            zones: Vec::new(),
            last_candle_at: None,
        }
    }

    pub fn len(&self) -> usize {
        self.zones.len()
    }

    pub fn is_empty(&self) -> bool {
        self.zones.is_empty()
    }

    pub fn zones(&self) -> &[LiquidityZone] {
        &self.zones
    }

    /// Merge a fresh pass into the book
    ///
    /// A new zone replaces stored zones of the same type and direction that
    /// overlap it. Returns how many zones were evicted for capacity.
    pub fn merge(&mut self, fresh: Vec<LiquidityZone>, now: DateTime<Utc>) -> usize {
        for zone in fresh {
            self.zones.retain(|z| {
                !(z.zone_type == zone.zone_type && z.direction == zone.direction && z.range.overlaps(&zone.range))
            });
            self.zones.push(zone);
        }
        self.purge(now);

        let mut evicted = 0;
        if self.zones.len() > self.capacity {
            self.zones.sort_by(|a, b| b.confluence.total_cmp(&a.confluence));
            evicted = self.zones.len() - self.capacity;
            self.zones.truncate(self.capacity);
            debug!("Zone book evicted {} lowest-confluence zones", evicted);
        }
        evicted
    }

    /// Feed a candle to every zone, dropping the ones it mitigates
    ///
    /// Candles at or before the last one seen are ignored, so overlapping
    /// windows can be replayed safely.
    pub fn update(&mut self, candle: &Candle) {
        if self.last_candle_at.is_some_and(|last| candle.timestamp <= last) {
            return;
        }
        self.last_candle_at = Some(candle.timestamp);
        for zone in &mut self.zones {
            zone.update(candle);
        }
        self.zones.retain(|z| !z.mitigated);
    }

    /// Drop mitigated and expired zones; returns how many were removed
    pub fn purge(&mut self, now: DateTime<Utc>) -> usize {
        let before = self.zones.len();
        let max_age = self.max_age;
        self.zones.retain(|z| !z.mitigated && !z.is_expired(now, max_age));
        before - self.zones.len()
    }
}
