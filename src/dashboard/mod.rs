//! Dashboard - the confluence orchestrator
//!
//! One pass per symbol:
//! 1. Build candles, order flow and the volume profile from the trade snapshot
//! 2. Fan out to the structure, order block, FVG and liquidity detectors
//! 3. Score confluence, build signals, update per-symbol zones and signals
//!
//! Results are cached per symbol for `cache_ttl_secs`. A failing detector is
//! replaced by its empty result and recorded in `SmcAnalysis::failures`.

pub mod cache;
pub mod registry;
pub mod signals;

use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

use chrono::{DateTime, Utc};
use futures::future::join_all;
use serde::{Deserialize, Serialize};
use tokio::task::{spawn_blocking, JoinError};
use tracing::{debug, info, warn};

use crate::analytics::{
    CandleAggregator, FairValueGap, FvgDetector, LiquidityMapper, LiquidityZone, OrderBlock,
    OrderBlockDetector, OrderFlowCalculator, OrderFlowProfile, StructureAnalysis, StructureAnalyzer,
    VolumeProfile, VolumeProfileCalculator,
};
use crate::config::EngineConfig;
use crate::error::{Component, EngineError, Result};
use crate::source::{OrderBookSource, TimeRange, TradeSource};
use crate::types::{Bias, Candle, OrderBookSnapshot, Trade};

// Re-export commonly used types
pub use cache::AnalysisCache;
pub use registry::SignalRegistry;
pub use signals::{
    build_signals, collect_zones, score_confluence, ConfluenceScore, SetupQuality, SignalDirection,
    SignalSource, SignalZone, SmcSignal,
};

/// A component whose output is missing from an analysis
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct FailedComponent {
    pub component: Component,
    pub reason: String,
}

/// Everything one pass produced for a symbol
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SmcAnalysis {
    pub symbol: String,
    /// Timestamp of the latest trade analyzed
    pub as_of: DateTime<Utc>,
    pub trade_count: usize,
    pub candle_count: usize,
    pub current_price: Option<f64>,
    pub score: ConfluenceScore,
    pub order_flow: OrderFlowProfile,
    pub volume_profile: VolumeProfile,
    pub structure: StructureAnalysis,
    pub order_blocks: Vec<OrderBlock>,
    pub fair_value_gaps: Vec<FairValueGap>,
    /// Active zones in the symbol's zone book after this pass
    pub liquidity_zones: Vec<LiquidityZone>,
    pub signals: Vec<SmcSignal>,
    pub failures: Vec<FailedComponent>,
}

impl SmcAnalysis {
    pub fn empty(symbol: &str, as_of: DateTime<Utc>) -> Self {
        Self {
            symbol: symbol.to_string(),
            as_of,
            trade_count: 0,
            candle_count: 0,
            current_price: None,
            score: ConfluenceScore::default(),
            order_flow: OrderFlowProfile::empty(symbol, 0.0),
            volume_profile: VolumeProfile::empty(),
            structure: StructureAnalysis::empty(),
            order_blocks: Vec::new(),
            fair_value_gaps: Vec::new(),
            liquidity_zones: Vec::new(),
            signals: Vec::new(),
            failures: Vec::new(),
        }
    }

    pub fn bias(&self) -> Bias {
        self.score.bias
    }

    pub fn confluence(&self) -> f64 {
        self.score.confluence
    }

    pub fn quality(&self) -> SetupQuality {
        self.score.quality
    }

    pub fn is_complete(&self) -> bool {
        self.failures.is_empty()
    }
}

/// Trades for one symbol, analyzed as part of a batch
#[derive(Debug, Clone)]
pub struct AnalysisRequest {
    pub symbol: String,
    pub trades: Vec<Trade>,
    pub snapshots: Vec<OrderBookSnapshot>,
}

/// Output of the four independent detectors
#[derive(Debug, Clone, Default)]
pub struct DetectorResults {
    pub structure: StructureAnalysis,
    pub order_blocks: Vec<OrderBlock>,
    pub fair_value_gaps: Vec<FairValueGap>,
    pub liquidity_zones: Vec<LiquidityZone>,
    pub failures: Vec<FailedComponent>,
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct DashboardStats {
    /// Full passes computed
    pub computed: u64,
    pub cache_hits: u64,
}

pub struct Dashboard {
    config: Arc<EngineConfig>,
    cache: AnalysisCache,
    registry: SignalRegistry,
    computed: AtomicU64,
    cache_hits: AtomicU64,
}

impl Dashboard {
    pub fn new(config: EngineConfig) -> Self {
        let cache = AnalysisCache::new(config.cache_ttl());
        let registry = SignalRegistry::new(config.zone_capacity, config.zone_max_age());
        Self {
            config: Arc::new(config),
            cache,
            registry,
            computed: AtomicU64::new(0),
            cache_hits: AtomicU64::new(0),
        }
    }

    pub fn config(&self) -> &EngineConfig {
        &self.config
    }

    pub fn stats(&self) -> DashboardStats {
        DashboardStats {
            computed: self.computed.load(Ordering::Relaxed),
            cache_hits: self.cache_hits.load(Ordering::Relaxed),
        }
    }

    /// Analyze a trade snapshot for `symbol`, serving a cached result when fresh
    pub async fn analyze(
        &self,
        symbol: &str,
        trades: Vec<Trade>,
        snapshots: Vec<OrderBookSnapshot>,
    ) -> Arc<SmcAnalysis> {
        if let Some(hit) = self.cached(symbol).await {
            return hit;
        }

        let flight = self.cache.flight(symbol).await;
        let _guard = flight.lock().await;

        // Another caller may have finished the pass while we waited
        if let Some(hit) = self.cached(symbol).await {
            return hit;
        }

        let analysis = Arc::new(self.compute(symbol, trades, snapshots).await);
        self.cache.insert(symbol, Arc::clone(&analysis)).await;
        analysis
    }

    async fn cached(&self, symbol: &str) -> Option<Arc<SmcAnalysis>> {
        let hit = self.cache.get(symbol).await?;
        self.cache_hits.fetch_add(1, Ordering::Relaxed);
        debug!("{}: serving cached analysis as of {}", symbol, hit.as_of);
        Some(hit)
    }

    /// Analyze several symbols concurrently
    pub async fn analyze_many(&self, requests: Vec<AnalysisRequest>) -> Vec<Arc<SmcAnalysis>> {
        join_all(requests.into_iter().map(|request| async move {
            let AnalysisRequest {
                symbol,
                trades,
                snapshots,
            } = request;
            self.analyze(&symbol, trades, snapshots).await
        }))
        .await
    }

    /// Fetch every configured exchange, then analyze the merged trades
    ///
    /// Failed exchanges are logged and skipped. Only when every trade fetch
    /// fails is the source error returned.
    pub async fn analyze_from_source(
        &self,
        symbol: &str,
        range: TimeRange,
        trade_source: &dyn TradeSource,
        book_source: Option<&dyn OrderBookSource>,
    ) -> Result<Arc<SmcAnalysis>> {
        if let Some(hit) = self.cached(symbol).await {
            return Ok(hit);
        }

        let exchanges = &self.config.exchanges;
        let fetched = join_all(exchanges.iter().map(|exchange| async move {
            (exchange, trade_source.trades(symbol, exchange, range).await)
        }))
        .await;

        let mut trades = Vec::new();
        let mut succeeded = 0;
        let mut last_error = None;
        for (exchange, result) in fetched {
            match result {
                Ok(batch) => {
                    debug!("{}: {} trades from {}", symbol, batch.len(), exchange);
                    succeeded += 1;
                    trades.extend(batch);
                }
                Err(e) => {
                    warn!("{}: trade fetch from {} failed: {:#}", symbol, exchange, e);
                    last_error = Some(e);
                }
            }
        }
        if succeeded == 0 {
            if let Some(e) = last_error {
                return Err(EngineError::Source(e));
            }
        }
        trades.retain(|t| range.contains(t.timestamp));

        let mut snapshots = Vec::new();
        if let Some(books) = book_source {
            let fetched = join_all(exchanges.iter().map(|exchange| async move {
                (exchange, books.snapshots(symbol, exchange, range).await)
            }))
            .await;
            for (exchange, result) in fetched {
                match result {
                    Ok(batch) => snapshots.extend(batch),
                    Err(e) => warn!("{}: order book fetch from {} failed: {:#}", symbol, exchange, e),
                }
            }
        }

        Ok(self.analyze(symbol, trades, snapshots).await)
    }

    async fn compute(
        &self,
        symbol: &str,
        mut trades: Vec<Trade>,
        snapshots: Vec<OrderBookSnapshot>,
    ) -> SmcAnalysis {
        self.computed.fetch_add(1, Ordering::Relaxed);
        trades.sort_by_key(|t| t.timestamp);

        let as_of = trades.last().map(|t| t.timestamp).unwrap_or_else(Utc::now);
        let current_price = trades.iter().rev().find(|t| t.is_valid()).map(|t| t.price);
        if trades.is_empty() {
            debug!("{}: no trades, returning empty analysis", symbol);
        }

        let trades = Arc::new(trades);
        let snapshots = Arc::new(snapshots);
        let ledger = self.registry.delta_ledger(symbol).await;
        let mut failures = Vec::new();

        let candle_task = {
            let aggregator = CandleAggregator::new(self.config.candle_interval(), self.config.tiers.clone());
            let trades = Arc::clone(&trades);
            spawn_blocking(move || Ok::<_, EngineError>(aggregator.aggregate(&trades)))
        };
        let flow_task = {
            let calculator = OrderFlowCalculator::new(self.config.order_flow.clone());
            let (trades, snapshots) = (Arc::clone(&trades), Arc::clone(&snapshots));
            let symbol = symbol.to_string();
            spawn_blocking(move || {
                Ok::<_, EngineError>(calculator.calculate_since(&symbol, &trades, &snapshots, ledger))
            })
        };
        let profile_task = {
            let calculator = VolumeProfileCalculator::new(self.config.volume_profile.clone());
            let trades = Arc::clone(&trades);
            spawn_blocking(move || Ok::<_, EngineError>(calculator.calculate(&trades)))
        };
        let (candles, order_flow, volume_profile) = tokio::join!(candle_task, flow_task, profile_task);

        let candles = settle(symbol, Component::Candles, candles, &mut failures).unwrap_or_default();
        let (order_flow, ledger) = settle(symbol, Component::OrderFlow, order_flow, &mut failures)
            .unwrap_or_else(|| (OrderFlowProfile::empty(symbol, ledger.cumulative_delta), ledger));
        let volume_profile =
            settle(symbol, Component::VolumeProfile, volume_profile, &mut failures).unwrap_or_default();
        self.registry.set_delta_ledger(symbol, ledger).await;

        let candles = Arc::new(candles);
        let order_flow = Arc::new(order_flow);
        let detected = self
            .run_detectors(symbol, Arc::clone(&trades), Arc::clone(&candles), Arc::clone(&order_flow))
            .await;
        failures.extend(detected.failures);

        let zones = self
            .registry
            .update_zones(symbol, &candles, detected.liquidity_zones, as_of)
            .await;

        let confluence = &self.config.confluence;
        let score = score_confluence(
            confluence,
            &detected.order_blocks,
            &detected.fair_value_gaps,
            &detected.structure,
            &zones,
        );
        let signals = match current_price {
            Some(price) => build_signals(
                symbol,
                &score,
                price,
                &collect_zones(&detected.order_blocks, &detected.fair_value_gaps, &zones),
                confluence,
                as_of,
            ),
            None => Vec::new(),
        };
        self.registry.record_signals(symbol, &signals, as_of).await;

        info!(
            "{}: {} trades -> {} candles | {} OBs, {} FVGs, {} breaks, {} zones | bias {:?}, confluence {:.1}, {} signals",
            symbol,
            trades.len(),
            candles.len(),
            detected.order_blocks.len(),
            detected.fair_value_gaps.len(),
            detected.structure.breaks.len(),
            zones.len(),
            score.bias,
            score.confluence,
            signals.len()
        );

        SmcAnalysis {
            symbol: symbol.to_string(),
            as_of,
            trade_count: trades.len(),
            candle_count: candles.len(),
            current_price,
            score,
            order_flow: Arc::unwrap_or_clone(order_flow),
            volume_profile,
            structure: detected.structure,
            order_blocks: detected.order_blocks,
            fair_value_gaps: detected.fair_value_gaps,
            liquidity_zones: zones,
            signals,
            failures,
        }
    }

    /// Run the four detectors in parallel over the same immutable inputs
    ///
    /// A detector that errors or panics contributes its empty result and a
    /// `FailedComponent`; the others are unaffected.
    pub async fn run_detectors(
        &self,
        symbol: &str,
        trades: Arc<Vec<Trade>>,
        candles: Arc<Vec<Candle>>,
        order_flow: Arc<OrderFlowProfile>,
    ) -> DetectorResults {
        let structure_task = {
            let analyzer = StructureAnalyzer::new(self.config.structure.clone());
            let candles = Arc::clone(&candles);
            spawn_blocking(move || analyzer.analyze(&candles))
        };
        let blocks_task = {
            let detector = OrderBlockDetector::new(self.config.order_blocks.clone());
            let candles = Arc::clone(&candles);
            spawn_blocking(move || detector.detect(&candles))
        };
        let gaps_task = {
            let detector = FvgDetector::new(self.config.fvg.clone());
            let candles = Arc::clone(&candles);
            spawn_blocking(move || detector.detect(&candles))
        };
        let zones_task = {
            let mapper = LiquidityMapper::new(self.config.liquidity.clone(), self.config.tiers.clone());
            spawn_blocking(move || mapper.map(&trades, &candles, Some(order_flow.as_ref())))
        };

        let (structure, blocks, gaps, zones) = tokio::join!(structure_task, blocks_task, gaps_task, zones_task);

        let mut failures = Vec::new();
        DetectorResults {
            structure: settle(symbol, Component::Structure, structure, &mut failures).unwrap_or_default(),
            order_blocks: settle(symbol, Component::OrderBlocks, blocks, &mut failures).unwrap_or_default(),
            fair_value_gaps: settle(symbol, Component::FairValueGaps, gaps, &mut failures).unwrap_or_default(),
            liquidity_zones: settle(symbol, Component::Liquidity, zones, &mut failures).unwrap_or_default(),
            failures,
        }
    }

    pub async fn active_signals(&self, symbol: &str, now: DateTime<Utc>) -> Vec<SmcSignal> {
        self.registry.active_signals(symbol, now).await
    }

    pub async fn active_zones(&self, symbol: &str) -> Vec<LiquidityZone> {
        self.registry.active_zones(symbol).await
    }

    /// Drop expired signals, aged zones and stale cache entries
    pub async fn purge_expired(&self, now: DateTime<Utc>) {
        let (signals, zones) = self.registry.purge_expired(now).await;
        let cached = self.cache.purge_stale().await;
        if signals + zones + cached > 0 {
            info!(
                "Purged {} expired signals, {} aged zones, {} stale analyses",
                signals, zones, cached
            );
        }
    }

    /// Force the next `analyze` for `symbol` to recompute
    pub async fn invalidate(&self, symbol: &str) -> bool {
        self.cache.invalidate(symbol).await
    }

    /// Forget everything held for `symbol`
    pub async fn reset(&self, symbol: &str) {
        self.cache.invalidate(symbol).await;
        self.registry.clear(symbol).await;
    }
}

/// Unwrap a detector task, recording why it produced nothing
fn settle<T>(
    symbol: &str,
    component: Component,
    joined: std::result::Result<Result<T>, JoinError>,
    failures: &mut Vec<FailedComponent>,
) -> Option<T> {
    let reason = match joined {
        Ok(Ok(value)) => return Some(value),
        Ok(Err(e)) => e.to_string(),
        Err(e) if e.is_panic() => "task panicked".to_string(),
        Err(e) => e.to_string(),
    };
    warn!("{}: {} failed, continuing without it: {}", symbol, component, reason);
    let failure = EngineError::ComponentFailure { component, reason };
    failures.push(FailedComponent {
        component,
        reason: failure.to_string(),
    });
    None
}
