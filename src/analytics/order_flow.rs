//! Order flow: trade classification, delta, absorption and imbalance
//!
//! Works on raw trades, not candles. Each trade is classified by, in order:
//! 1. the exchange's top of book at the time of the trade
//! 2. the tick rule against the previous trade on the same exchange
//! 3. the exchange-supplied side label
//! 4. otherwise unknown (zero delta)

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::{BTreeMap, HashMap, VecDeque};
use tracing::{debug, info};

use super::scoring::{capped_ratio, clamp_score, mean, safe_div};
use crate::types::{Direction, OrderBookSnapshot, PriceRange, Side, Trade};

/// Configuration for order flow analysis
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct OrderFlowConfig {
    /// Price level granularity; trades group by round(price / level_size)
    pub level_size: f64,
    /// max(buy, sell) / min(buy, sell) needed for absorption (default: 3.0)
    pub absorption_threshold: f64,
    /// A trade is large at this multiple of the trailing average trade size
    pub large_trade_multiplier: f64,
    /// Trades (across all exchanges, in time order) in the trailing average
    pub large_trade_lookback: usize,
    /// Per-level ratio for an imbalance (default: 2.0)
    pub imbalance_threshold: f64,
    /// Consecutive levels required to report an imbalance (default: 2)
    pub min_imbalance_levels: usize,
    /// Ceiling for reported ratios when one side is empty
    pub max_reported_ratio: f64,
}

impl Default for OrderFlowConfig {
    fn default() -> Self {
        Self {
            level_size: 0.01,
            absorption_threshold: 3.0,
            large_trade_multiplier: 2.0,
            large_trade_lookback: 20,
            imbalance_threshold: 2.0,
            min_imbalance_levels: 2,
            max_reported_ratio: 100.0,
        }
    }
}

/// Which rule decided a trade's side
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ClassificationSource {
    OrderBook,
    TickRule,
    ExchangeLabel,
    Unclassified,
}

#[derive(Debug, Clone, Copy)]
pub struct ClassifiedTrade<'a> {
    pub trade: &'a Trade,
    pub side: Side,
    pub source: ClassificationSource,
}

impl ClassifiedTrade<'_> {
    pub fn delta(&self) -> f64 {
        self.side.sign() * self.trade.quantity
    }
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct ClassificationStats {
    pub order_book: usize,
    pub tick_rule: usize,
    pub exchange_label: usize,
    pub unclassified: usize,
}

/// Flow at one price level
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PriceLevelFlow {
    pub price: f64,
    pub buy_volume: f64,
    pub sell_volume: f64,
    pub unknown_volume: f64,
    /// buy_volume - sell_volume
    pub delta: f64,
    pub trade_count: u64,
    pub largest_trade: f64,
    /// Trades at or above the large-trade threshold
    pub large_trades: u64,
    /// Highest trade size relative to its trailing average
    pub peak_size_ratio: f64,
}

impl PriceLevelFlow {
    fn new(price: f64) -> Self {
        Self {
            price,
            buy_volume: 0.0,
            sell_volume: 0.0,
            unknown_volume: 0.0,
            delta: 0.0,
            trade_count: 0,
            largest_trade: 0.0,
            large_trades: 0,
            peak_size_ratio: 0.0,
        }
    }

    pub fn total_volume(&self) -> f64 {
        self.buy_volume + self.sell_volume + self.unknown_volume
    }
}

/// Heavy one-sided aggression met by passive liquidity at one level
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct AbsorptionEvent {
    pub price: f64,
    pub buy_volume: f64,
    pub sell_volume: f64,
    pub ratio: f64,
    /// The smaller side, i.e. the side whose passive orders soaked up the flow
    pub absorption_type: Side,
    pub largest_trade: f64,
    pub strength: f64,
}

/// Run of adjacent levels leaning the same way
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ImbalanceEvent {
    pub range: PriceRange,
    pub direction: Direction,
    pub level_count: usize,
    pub buy_volume: f64,
    pub sell_volume: f64,
    pub average_ratio: f64,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct OrderFlowProfile {
    pub symbol: String,
    pub window_start: Option<DateTime<Utc>>,
    pub window_end: Option<DateTime<Utc>>,
    pub trade_count: usize,
    pub buy_volume: f64,
    pub sell_volume: f64,
    pub unknown_volume: f64,
    pub total_volume: f64,
    pub net_delta: f64,
    /// Running delta plus the delta of trades not counted by an earlier pass
    pub cumulative_delta: f64,
    pub vwap: Option<f64>,
    /// Ordered by price ascending
    pub levels: Vec<PriceLevelFlow>,
    pub absorption_events: Vec<AbsorptionEvent>,
    pub imbalance_events: Vec<ImbalanceEvent>,
    /// Second-half vs first-half delta, in [-100, 100]
    pub delta_momentum: f64,
    /// 100 = perfectly two-sided, 0 = one-sided
    pub market_efficiency: f64,
    pub exchange_deltas: BTreeMap<String, f64>,
    pub large_trade_count: usize,
    pub classification: ClassificationStats,
}

impl OrderFlowProfile {
    pub fn empty(symbol: &str, previous_cumulative_delta: f64) -> Self {
        Self {
            symbol: symbol.to_string(),
            window_start: None,
            window_end: None,
            trade_count: 0,
            buy_volume: 0.0,
            sell_volume: 0.0,
            unknown_volume: 0.0,
            total_volume: 0.0,
            net_delta: 0.0,
            cumulative_delta: previous_cumulative_delta,
            vwap: None,
            levels: Vec::new(),
            absorption_events: Vec::new(),
            imbalance_events: Vec::new(),
            delta_momentum: 0.0,
            market_efficiency: 0.0,
            exchange_deltas: BTreeMap::new(),
            large_trade_count: 0,
            classification: ClassificationStats::default(),
        }
    }

    /// Net lean of the window, if any
    pub fn delta_direction(&self) -> Option<Direction> {
        if self.net_delta > 0.0 {
            Some(Direction::Bullish)
        } else if self.net_delta < 0.0 {
            Some(Direction::Bearish)
        } else {
            None
        }
    }
}

/// Running cumulative delta and the newest trade already folded into it
///
/// Windows handed to `OrderFlowCalculator::calculate_since` may overlap the
/// previous one; trades at or before `counted_through` are not counted again.
#[derive(Debug, Clone, Copy, Default, PartialEq, Serialize, Deserialize)]
pub struct DeltaLedger {
    pub cumulative_delta: f64,
    pub counted_through: Option<DateTime<Utc>>,
}

impl DeltaLedger {
    pub fn new(cumulative_delta: f64) -> Self {
        Self {
            cumulative_delta,
            counted_through: None,
        }
    }
}

/// Classify trades in time order
///
/// Snapshots are matched by exchange: the latest snapshot at or before the
/// trade. The tick rule compares against the previous valid trade on the
/// same exchange, so cross-venue basis never reads as an uptick.
pub fn classify_trades<'a>(
    trades: &'a [Trade],
    snapshots: &[OrderBookSnapshot],
) -> Vec<ClassifiedTrade<'a>> {
    let mut books: HashMap<String, Vec<&OrderBookSnapshot>> = HashMap::new();
    for snap in snapshots.iter().filter(|s| s.is_usable()) {
        books.entry(snap.exchange.to_ascii_lowercase()).or_default().push(snap);
    }
    for list in books.values_mut() {
        list.sort_by_key(|s| s.timestamp);
    }

    let mut ordered: Vec<&Trade> = trades.iter().filter(|t| t.is_valid()).collect();
    ordered.sort_by_key(|t| t.timestamp);

    let mut last_price: HashMap<String, f64> = HashMap::new();
    let mut classified = Vec::with_capacity(ordered.len());

    for trade in ordered {
        let exchange = trade.exchange.to_ascii_lowercase();

        let from_book = books.get(&exchange).and_then(|list| {
            let idx = list.partition_point(|s| s.timestamp <= trade.timestamp);
            idx.checked_sub(1).and_then(|i| side_from_book(trade.price, list[i]))
        });

        let from_tick = last_price.get(&exchange).and_then(|&prev| {
            if trade.price > prev {
                Some(Side::Buy)
            } else if trade.price < prev {
                Some(Side::Sell)
            } else {
                None
            }
        });

        let (side, source) = if let Some(side) = from_book {
            (side, ClassificationSource::OrderBook)
        } else if let Some(side) = from_tick {
            (side, ClassificationSource::TickRule)
        } else if trade.side != Side::Unknown {
            (trade.side, ClassificationSource::ExchangeLabel)
        } else {
            (Side::Unknown, ClassificationSource::Unclassified)
        };

        last_price.insert(exchange, trade.price);
        classified.push(ClassifiedTrade { trade, side, source });
    }

    classified
}

fn side_from_book(price: f64, book: &OrderBookSnapshot) -> Option<Side> {
    if price >= book.best_ask {
        Some(Side::Buy)
    } else if price <= book.best_bid {
        Some(Side::Sell)
    } else {
        let mid = book.midpoint();
        if price > mid {
            Some(Side::Buy)
        } else if price < mid {
            Some(Side::Sell)
        } else {
            None
        }
    }
}

/// Computes order flow profiles from trades
#[derive(Debug, Clone, Default)]
pub struct OrderFlowCalculator {
    config: OrderFlowConfig,
}

impl OrderFlowCalculator {
    pub fn new(config: OrderFlowConfig) -> Self {
        Self { config }
    }

    pub fn config(&self) -> &OrderFlowConfig {
        &self.config
    }

    fn level_size(&self) -> f64 {
        if self.config.level_size > 0.0 && self.config.level_size.is_finite() {
            self.config.level_size
        } else {
            OrderFlowConfig::default().level_size
        }
    }

    fn level_key(&self, price: f64) -> i64 {
        (price / self.level_size()).round() as i64
    }

    /// Build the profile for one window, adding its whole delta to
    /// `previous_cumulative_delta`
    pub fn calculate(
        &self,
        symbol: &str,
        trades: &[Trade],
        snapshots: &[OrderBookSnapshot],
        previous_cumulative_delta: f64,
    ) -> OrderFlowProfile {
        let classified = classify_trades(trades, snapshots);
        self.profile(symbol, &classified, DeltaLedger::new(previous_cumulative_delta))
    }

    /// Build the profile for one window, adding to the running delta only
    /// trades newer than the ledger's last counted trade. Returns the
    /// advanced ledger alongside the profile.
    pub fn calculate_since(
        &self,
        symbol: &str,
        trades: &[Trade],
        snapshots: &[OrderBookSnapshot],
        ledger: DeltaLedger,
    ) -> (OrderFlowProfile, DeltaLedger) {
        let classified = classify_trades(trades, snapshots);
        let profile = self.profile(symbol, &classified, ledger);
        let advanced = DeltaLedger {
            cumulative_delta: profile.cumulative_delta,
            counted_through: classified
                .last()
                .map(|c| c.trade.timestamp)
                .max(ledger.counted_through),
        };
        (profile, advanced)
    }

    fn profile(&self, symbol: &str, classified: &[ClassifiedTrade<'_>], ledger: DeltaLedger) -> OrderFlowProfile {
        let mut profile = OrderFlowProfile::empty(symbol, ledger.cumulative_delta);
        if classified.is_empty() {
            debug!("No valid trades for {} order flow", symbol);
            return profile;
        }

        profile.trade_count = classified.len();
        profile.window_start = classified.first().map(|c| c.trade.timestamp);
        profile.window_end = classified.last().map(|c| c.trade.timestamp);

        let mut levels: BTreeMap<i64, PriceLevelFlow> = BTreeMap::new();
        let mut notional = 0.0;
        let mut uncounted_delta = 0.0;

        let lookback = self.config.large_trade_lookback.max(1);
        let mut recent: VecDeque<f64> = VecDeque::with_capacity(lookback + 1);
        let mut recent_sum = 0.0;

        for c in classified {
            let qty = c.trade.quantity;
            notional += c.trade.price * qty;
            if ledger.counted_through.map_or(true, |t| c.trade.timestamp > t) {
                uncounted_delta += c.delta();
            }

            // Sized against the trades before it, never itself
            let trailing = safe_div(recent_sum, recent.len() as f64, 0.0);
            let size_ratio = safe_div(qty, trailing, 0.0);
            let is_large = trailing > 0.0 && qty >= trailing * self.config.large_trade_multiplier;
            recent.push_back(qty);
            recent_sum += qty;
            if recent.len() > lookback {
                if let Some(oldest) = recent.pop_front() {
                    recent_sum -= oldest;
                }
            }

            match c.source {
                ClassificationSource::OrderBook => profile.classification.order_book += 1,
                ClassificationSource::TickRule => profile.classification.tick_rule += 1,
                ClassificationSource::ExchangeLabel => profile.classification.exchange_label += 1,
                ClassificationSource::Unclassified => profile.classification.unclassified += 1,
            }

            let key = self.level_key(c.trade.price);
            let level = levels
                .entry(key)
                .or_insert_with(|| PriceLevelFlow::new(key as f64 * self.level_size()));
            match c.side {
                Side::Buy => level.buy_volume += qty,
                Side::Sell => level.sell_volume += qty,
                Side::Unknown => level.unknown_volume += qty,
            }
            level.trade_count += 1;
            level.largest_trade = level.largest_trade.max(qty);
            level.peak_size_ratio = level.peak_size_ratio.max(size_ratio);
            if is_large {
                level.large_trades += 1;
                profile.large_trade_count += 1;
            }

            *profile
                .exchange_deltas
                .entry(c.trade.exchange.to_ascii_lowercase())
                .or_insert(0.0) += c.delta();
        }

        for level in levels.values_mut() {
            level.delta = level.buy_volume - level.sell_volume;
            profile.buy_volume += level.buy_volume;
            profile.sell_volume += level.sell_volume;
            profile.unknown_volume += level.unknown_volume;
            profile.net_delta += level.delta;
        }
        profile.total_volume = profile.buy_volume + profile.sell_volume + profile.unknown_volume;
        profile.cumulative_delta = ledger.cumulative_delta + uncounted_delta;
        profile.vwap = if profile.total_volume > 0.0 {
            Some(notional / profile.total_volume)
        } else {
            None
        };

        profile.levels = levels.into_values().collect();
        profile.absorption_events = self.find_absorption(&profile.levels);
        profile.imbalance_events = self.find_imbalances(&profile.levels);
        profile.delta_momentum = delta_momentum(classified);
        profile.market_efficiency = market_efficiency(profile.buy_volume, profile.sell_volume);

        info!(
            "Order flow {}: {} trades, delta={:.2} cvd={:.2} absorption={} imbalance={}",
            symbol,
            profile.trade_count,
            profile.net_delta,
            profile.cumulative_delta,
            profile.absorption_events.len(),
            profile.imbalance_events.len()
        );

        profile
    }

    fn find_absorption(&self, levels: &[PriceLevelFlow]) -> Vec<AbsorptionEvent> {
        let threshold = self.config.absorption_threshold;
        let cap = self.config.max_reported_ratio;
        levels
            .iter()
            .filter_map(|level| {
                let smaller = level.buy_volume.min(level.sell_volume);
                let larger = level.buy_volume.max(level.sell_volume);
                if larger <= 0.0 || level.large_trades == 0 {
                    return None;
                }
                // One-sided levels read as the ceiling ratio
                let ratio = safe_div(larger, smaller, cap).min(cap);
                if ratio < threshold {
                    return None;
                }

                let absorption_type = if level.sell_volume < level.buy_volume {
                    Side::Sell
                } else {
                    Side::Buy
                };
                let strength = clamp_score(
                    capped_ratio(ratio, threshold * 2.0) * 60.0
                        + capped_ratio(level.peak_size_ratio, self.config.large_trade_multiplier * 2.0) * 40.0,
                );

                Some(AbsorptionEvent {
                    price: level.price,
                    buy_volume: level.buy_volume,
                    sell_volume: level.sell_volume,
                    ratio,
                    absorption_type,
                    largest_trade: level.largest_trade,
                    strength,
                })
            })
            .collect()
    }

    fn level_bias(&self, level: &PriceLevelFlow) -> Option<(Direction, f64)> {
        let threshold = self.config.imbalance_threshold;
        let cap = self.config.max_reported_ratio;
        let (buy, sell) = (level.buy_volume, level.sell_volume);

        if buy > 0.0 && (sell <= 0.0 || buy / sell >= threshold) {
            Some((Direction::Bullish, safe_div(buy, sell, cap).min(cap)))
        } else if sell > 0.0 && (buy <= 0.0 || sell / buy >= threshold) {
            Some((Direction::Bearish, safe_div(sell, buy, cap).min(cap)))
        } else {
            None
        }
    }

    fn find_imbalances(&self, levels: &[PriceLevelFlow]) -> Vec<ImbalanceEvent> {
        let min_levels = self.config.min_imbalance_levels.max(2);
        let mut events = Vec::new();
        let mut run: Vec<(&PriceLevelFlow, f64)> = Vec::new();
        let mut run_dir: Option<Direction> = None;

        let mut flush = |run: &mut Vec<(&PriceLevelFlow, f64)>, dir: Option<Direction>| {
            if let (Some(direction), true) = (dir, run.len() >= min_levels) {
                let first = run[0].0.price;
                let last = run[run.len() - 1].0.price;
                events.push(ImbalanceEvent {
                    range: PriceRange::new(first, last),
                    direction,
                    level_count: run.len(),
                    buy_volume: run.iter().map(|(l, _)| l.buy_volume).sum(),
                    sell_volume: run.iter().map(|(l, _)| l.sell_volume).sum(),
                    average_ratio: mean(run.iter().map(|(_, r)| *r)).unwrap_or(0.0),
                });
            }
            run.clear();
        };

        let mut prev_key: Option<i64> = None;
        for level in levels {
            // Runs never bridge a price level with no trades
            let key = self.level_key(level.price);
            if prev_key.is_some_and(|p| key != p + 1) {
                flush(&mut run, run_dir);
                run_dir = None;
            }
            prev_key = Some(key);

            match self.level_bias(level) {
                Some((dir, ratio)) if Some(dir) == run_dir => run.push((level, ratio)),
                Some((dir, ratio)) => {
                    flush(&mut run, run_dir);
                    run_dir = Some(dir);
                    run.push((level, ratio));
                }
                None => {
                    flush(&mut run, run_dir);
                    run_dir = None;
                }
            }
        }
        flush(&mut run, run_dir);

        events
    }
}

/// Normalized second-half minus first-half delta, clamped to [-100, 100]
fn delta_momentum(classified: &[ClassifiedTrade<'_>]) -> f64 {
    let half = classified.len() / 2;
    let first: f64 = classified[..half].iter().map(|c| c.delta()).sum();
    let second: f64 = classified[half..].iter().map(|c| c.delta()).sum();
    let scale = first.abs() + second.abs();
    (safe_div(second - first, scale, 0.0) * 100.0).clamp(-100.0, 100.0)
}

fn market_efficiency(buy: f64, sell: f64) -> f64 {
    clamp_score(safe_div(2.0 * buy.min(sell), buy + sell, 0.0) * 100.0)
}
