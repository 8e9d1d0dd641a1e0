/// Fan-out channels and the messages carried on them
use serde::{Deserialize, Serialize};

use crate::types::{Alert, AnalyticsSnapshot, Bar, Tick};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Channel {
    MarketData,
    Ohlc,
    Alerts,
    Analytics,
}

impl Channel {
    pub const ALL: [Channel; 4] = [
        Channel::MarketData,
        Channel::Ohlc,
        Channel::Alerts,
        Channel::Analytics,
    ];

    pub fn as_str(&self) -> &str {
        match self {
            Channel::MarketData => "market_data",
            Channel::Ohlc => "ohlc",
            Channel::Alerts => "alerts",
            Channel::Analytics => "analytics",
        }
    }
}

/// Outbound stream payload, tagged by kind on the wire
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", content = "data", rename_all = "snake_case")]
pub enum StreamMessage {
    Tick(Tick),
    /// Finalized bar or in-progress snapshot, told apart by `final`
    Ohlc(Bar),
    Alert(Alert),
    Analytics(AnalyticsSnapshot),
}

impl StreamMessage {
    pub fn kind(&self) -> &str {
        match self {
            StreamMessage::Tick(_) => "tick",
            StreamMessage::Ohlc(_) => "ohlc",
            StreamMessage::Alert(_) => "alert",
            StreamMessage::Analytics(_) => "analytics",
        }
    }

    pub fn to_json(&self) -> crate::error::Result<String> {
        Ok(serde_json::to_string(self)?)
    }
}
