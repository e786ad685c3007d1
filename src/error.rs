//! Engine error types

use serde::{Deserialize, Serialize};
use thiserror::Error;

/// Engine component, used to label failures and log lines
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Component {
    Candles,
    OrderFlow,
    VolumeProfile,
    Structure,
    OrderBlocks,
    FairValueGaps,
    Liquidity,
}

impl std::fmt::Display for Component {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Component::Candles => write!(f, "candles"),
            Component::OrderFlow => write!(f, "order_flow"),
            Component::VolumeProfile => write!(f, "volume_profile"),
            Component::Structure => write!(f, "structure"),
            Component::OrderBlocks => write!(f, "order_blocks"),
            Component::FairValueGaps => write!(f, "fair_value_gaps"),
            Component::Liquidity => write!(f, "liquidity"),
        }
    }
}

#[derive(Debug, Error)]
pub enum EngineError {
    /// Input that would poison the arithmetic (NaN, inverted candle)
    #[error("{component}: computation guard tripped: {reason}")]
    Computation { component: Component, reason: String },

    /// A detector failed inside the orchestrator; its output is absent
    #[error("{component} failed: {reason}")]
    ComponentFailure { component: Component, reason: String },

    #[error("trade source error: {0}")]
    Source(#[from] anyhow::Error),
}

impl EngineError {
    pub fn computation(component: Component, reason: impl Into<String>) -> Self {
        Self::Computation {
            component,
            reason: reason.into(),
        }
    }

    pub fn component(&self) -> Option<Component> {
        match self {
            Self::Computation { component, .. } | Self::ComponentFailure { component, .. } => {
                Some(*component)
            }
            Self::Source(_) => None,
        }
    }
}

pub type Result<T> = std::result::Result<T, EngineError>;
