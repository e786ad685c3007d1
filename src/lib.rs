// Library crate - multi-exchange order flow and Smart Money structure analytics

pub mod types;
pub mod error;
pub mod config;
pub mod source;
pub mod analytics;
pub mod dashboard;

// Re-export commonly used types
pub use types::*;
pub use error::{Component, EngineError, Result};
pub use config::{ConfluenceConfig, EngineConfig};
pub use source::{OrderBookSource, TimeRange, TradeSource};
pub use dashboard::{AnalysisRequest, Dashboard, FailedComponent, SetupQuality, SignalDirection, SmcAnalysis, SmcSignal};
