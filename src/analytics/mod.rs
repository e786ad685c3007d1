//! Analytics - pure computations over immutable trade/candle snapshots
//!
//! This module contains the detector components:
//! - Candle aggregation across exchanges
//! - Order flow (classification, delta, absorption, imbalance)
//! - Volume profile (POC, value area)
//! - Market structure (swings, BOS, CHoCH)
//! - Order blocks
//! - Fair value gaps
//! - Liquidity zones and the per-symbol zone book

pub mod scoring;
pub mod candles;
pub mod order_flow;
pub mod volume_profile;
pub mod structure;
pub mod order_blocks;
pub mod fair_value_gaps;
pub mod liquidity;

// Re-export commonly used types
pub use candles::{aggregate_candles, CandleAggregator, ExchangeTier, ExchangeTiers};
pub use order_flow::{
    classify_trades, AbsorptionEvent, ClassificationSource, DeltaLedger, ImbalanceEvent,
    OrderFlowCalculator, OrderFlowConfig, OrderFlowProfile, PriceLevelFlow,
};
pub use volume_profile::{VolumeBin, VolumeProfile, VolumeProfileCalculator, VolumeProfileConfig};
pub use structure::{
    BreakType, StructureAnalysis, StructureAnalyzer, StructureBreak, StructureConfig, SwingKind, SwingPoint,
};
pub use order_blocks::{BlockState, OrderBlock, OrderBlockConfig, OrderBlockDetector, OrderBlockType};
pub use fair_value_gaps::{FairValueGap, FillStatus, FvgConfig, FvgDetector};
pub use liquidity::{LiquidityConfig, LiquidityMapper, LiquidityZone, ZoneBook, ZoneType};
