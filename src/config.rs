//! Engine configuration
//!
//! Every heuristic coefficient is a named field with a default. The calling
//! layer owns the file format; `EngineConfig` only derives serde.

use serde::{Deserialize, Serialize};

use crate::analytics::{
    ExchangeTiers, FvgConfig, LiquidityConfig, OrderBlockConfig, OrderFlowConfig, StructureConfig,
    VolumeProfileConfig,
};

/// Weights and thresholds for combining detector output into a bias and signals
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct ConfluenceConfig {
    /// Points for an active order block at 100 confidence
    pub order_block_points: f64,
    /// Points for an open actionable gap at 100 quality
    pub fvg_points: f64,
    /// Points for a structure break at 100 strength
    pub structure_points: f64,
    /// Points for a liquidity zone at 100 confluence
    pub liquidity_points: f64,
    /// Flat points for the strength-weighted structure trend
    pub trend_points: f64,
    /// Most recent breaks that contribute points
    pub recent_breaks: usize,

    /// Multiplier for elements with institutional share >= `institutional_boost_ratio`
    pub institutional_boost: f64,
    pub institutional_boost_ratio: f64,
    /// Multiplier for elements seen on >= `multi_exchange_min` exchanges
    pub multi_exchange_boost: f64,
    pub multi_exchange_min: usize,

    /// Net points inside +/- this band read as neutral
    pub neutral_band: f64,
    /// Net points that map to a confluence of 100
    pub points_scale: f64,

    /// Confluence required before any signal is built (default: 70)
    pub min_signal_confluence: f64,
    /// Stop placed this percent beyond the entry zone's far boundary
    pub stop_buffer_pct: f64,
    /// Targets as multiples of risk from entry
    pub target_multiples: Vec<f64>,
    /// Signal lifetime in minutes (default: 240)
    pub signal_ttl_minutes: i64,
    /// Signals per pass, taken from the nearest distinct zones
    pub max_signals: usize,

    /// Setup quality band floors
    pub very_high_quality: f64,
    pub high_quality: f64,
    pub medium_quality: f64,
    pub low_quality: f64,
}

impl Default for ConfluenceConfig {
    fn default() -> Self {
        Self {
            order_block_points: 25.0,
            fvg_points: 20.0,
            structure_points: 30.0,
            liquidity_points: 15.0,
            trend_points: 20.0,
            recent_breaks: 3,
            institutional_boost: 1.25,
            institutional_boost_ratio: 0.5,
            multi_exchange_boost: 1.2,
            multi_exchange_min: 2,
            neutral_band: 10.0,
            points_scale: 200.0,
            min_signal_confluence: 70.0,
            stop_buffer_pct: 0.1,
            target_multiples: vec![1.5, 2.5, 4.0],
            signal_ttl_minutes: 240,
            max_signals: 2,
            very_high_quality: 80.0,
            high_quality: 65.0,
            medium_quality: 50.0,
            low_quality: 30.0,
        }
    }
}

impl ConfluenceConfig {
    pub fn signal_ttl(&self) -> chrono::Duration {
        chrono::Duration::minutes(self.signal_ttl_minutes.max(0))
    }
}

/// Configuration for the whole engine
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct EngineConfig {
    /// Candle interval in seconds
    pub candle_interval_secs: i64,

    /// Institutional/retail exchange partition
    pub tiers: ExchangeTiers,

    /// Exchanges queried by `Dashboard::analyze_from_source`
    pub exchanges: Vec<String>,

    pub order_flow: OrderFlowConfig,
    pub volume_profile: VolumeProfileConfig,
    pub structure: StructureConfig,
    pub order_blocks: OrderBlockConfig,
    pub fvg: FvgConfig,
    pub liquidity: LiquidityConfig,
    pub confluence: ConfluenceConfig,

    /// How long a cached analysis is served before recomputing
    pub cache_ttl_secs: u64,

    /// Active liquidity zones kept per symbol
    pub zone_capacity: usize,

    /// Zones older than this are dropped
    pub zone_max_age_hours: i64,
}

impl Default for EngineConfig {
    fn default() -> Self {
        Self {
            candle_interval_secs: 60,
            tiers: ExchangeTiers::default(),
            exchanges: ["coinbase", "kraken", "binance", "bybit", "okx"]
                .iter()
                .map(|e| e.to_string())
                .collect(),
            order_flow: OrderFlowConfig::default(),
            volume_profile: VolumeProfileConfig::default(),
            structure: StructureConfig::default(),
            order_blocks: OrderBlockConfig::default(),
            fvg: FvgConfig::default(),
            liquidity: LiquidityConfig::default(),
            confluence: ConfluenceConfig::default(),
            cache_ttl_secs: 30,
            zone_capacity: 20,
            zone_max_age_hours: 72,
        }
    }
}

impl EngineConfig {
    /// One-minute candles, short cache, signals live for an hour
    pub fn scalping() -> Self {
        Self {
            candle_interval_secs: 60,
            cache_ttl_secs: 10,
            confluence: ConfluenceConfig {
                signal_ttl_minutes: 60,
                ..Default::default()
            },
            ..Default::default()
        }
    }

    /// Fifteen-minute candles for multi-day structure
    pub fn swing() -> Self {
        Self {
            candle_interval_secs: 900,
            cache_ttl_secs: 120,
            confluence: ConfluenceConfig {
                signal_ttl_minutes: 24 * 60,
                ..Default::default()
            },
            ..Default::default()
        }
    }

    pub fn candle_interval(&self) -> chrono::Duration {
        chrono::Duration::seconds(self.candle_interval_secs.max(1))
    }

    pub fn cache_ttl(&self) -> std::time::Duration {
        std::time::Duration::from_secs(self.cache_ttl_secs)
    }

    pub fn zone_max_age(&self) -> chrono::Duration {
        chrono::Duration::hours(self.zone_max_age_hours.max(0))
    }
}
