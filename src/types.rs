/// Core type definitions for the market data pipeline
use std::fmt;
use std::path::PathBuf;
use std::str::FromStr;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};

use crate::error::FlowError;

/// Trade fields as they come off the feed, before validation
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct RawTick {
    pub symbol: Option<String>,
    pub price: Option<f64>,
    pub quantity: Option<f64>,
    pub timestamp: Option<i64>,
    pub trade_id: Option<u64>,
    pub is_buyer_maker: Option<bool>,
}

/// Normalized trade event. Immutable once created.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Tick {
    pub symbol: String,
    pub price: f64,
    pub quantity: f64,
    /// Exchange trade time, ms since epoch
    pub timestamp: i64,
    pub trade_id: u64,
    pub is_buyer_maker: bool,
    pub processed_at: DateTime<Utc>,
}

/// Timeframe for bar aggregation
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(try_from = "String", into = "String")]
pub enum Timeframe {
    OneSecond,
    OneMinute,
    FiveMinute,
    FifteenMinute,
    OneHour,
    OneDay,
}

impl Timeframe {
    pub fn as_str(&self) -> &'static str {
        match self {
            Timeframe::OneSecond => "1s",
            Timeframe::OneMinute => "1m",
            Timeframe::FiveMinute => "5m",
            Timeframe::FifteenMinute => "15m",
            Timeframe::OneHour => "1h",
            Timeframe::OneDay => "1d",
        }
    }

    pub fn duration_ms(&self) -> i64 {
        match self {
            Timeframe::OneSecond => 1_000,
            Timeframe::OneMinute => 60_000,
            Timeframe::FiveMinute => 300_000,
            Timeframe::FifteenMinute => 900_000,
            Timeframe::OneHour => 3_600_000,
            Timeframe::OneDay => 86_400_000,
        }
    }

    /// Start of the bucket `[n * interval, (n + 1) * interval)` holding `timestamp_ms`
    pub fn bucket_start(&self, timestamp_ms: i64) -> i64 {
        let interval = self.duration_ms();
        timestamp_ms.div_euclid(interval) * interval
    }
}

impl fmt::Display for Timeframe {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for Timeframe {
    type Err = FlowError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim() {
            "1s" => Ok(Timeframe::OneSecond),
            "1m" => Ok(Timeframe::OneMinute),
            "5m" => Ok(Timeframe::FiveMinute),
            "15m" => Ok(Timeframe::FifteenMinute),
            "1h" => Ok(Timeframe::OneHour),
            "1d" => Ok(Timeframe::OneDay),
            other => Err(FlowError::InvalidParameter(format!("Unknown interval: {}", other))),
        }
    }
}

impl TryFrom<String> for Timeframe {
    type Error = FlowError;

    fn try_from(value: String) -> Result<Self, Self::Error> {
        value.parse()
    }
}

impl From<Timeframe> for String {
    fn from(value: Timeframe) -> Self {
        value.as_str().to_string()
    }
}

/// OHLCV bar over one bucket
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Bar {
    pub symbol: String,
    pub interval: Timeframe,
    pub open: f64,
    pub high: f64,
    pub low: f64,
    pub close: f64,
    pub volume: f64,
    pub tick_count: u64,
    /// Bucket start, ms since epoch
    pub timestamp: i64,
    #[serde(rename = "final")]
    pub is_final: bool,
}

/// Alert severity levels
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum AlertSeverity {
    Medium,
    High,
    Critical,
}

impl AlertSeverity {
    pub fn as_str(&self) -> &str {
        match self {
            AlertSeverity::Medium => "medium",
            AlertSeverity::High => "high",
            AlertSeverity::Critical => "critical",
        }
    }
}

/// Alert raised by a rule. Only `acknowledged` changes after creation.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Alert {
    pub id: String,
    pub rule_id: String,
    pub rule_name: String,
    pub severity: AlertSeverity,
    pub message: String,
    pub threshold: f64,
    pub triggered_value: Option<f64>,
    pub data: AnalyticsSnapshot,
    /// ms since epoch
    pub timestamp: i64,
    pub acknowledged: bool,
}

/// Latest derived metrics, keyed by field name
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(transparent)]
pub struct AnalyticsSnapshot(pub Map<String, Value>);

impl AnalyticsSnapshot {
    pub fn new() -> Self {
        AnalyticsSnapshot(Map::new())
    }

    pub fn with(mut self, key: &str, value: impl Into<Value>) -> Self {
        self.insert(key, value);
        self
    }

    pub fn insert(&mut self, key: &str, value: impl Into<Value>) {
        self.0.insert(key.to_string(), value.into());
    }

    pub fn get(&self, key: &str) -> Option<&Value> {
        self.0.get(key)
    }

    /// Numeric field lookup. Absent or null is `None`; any other non-number is an error.
    pub fn get_f64(&self, key: &str) -> std::result::Result<Option<f64>, String> {
        match self.0.get(key) {
            None | Some(Value::Null) => Ok(None),
            Some(Value::Number(n)) => n
                .as_f64()
                .map(Some)
                .ok_or_else(|| format!("field '{}' is not representable as f64", key)),
            Some(other) => Err(format!("field '{}' is not numeric: {}", key, other)),
        }
    }

    pub fn is_empty(&self) -> bool {
        self.0.is_empty()
    }
}

/// Feed connection layout
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum FeedMode {
    /// One multiplexed connection for every symbol
    #[default]
    Combined,
    /// One independent connection and reconnect loop per symbol
    PerSymbol,
}

impl FeedMode {
    pub fn as_str(&self) -> &str {
        match self {
            FeedMode::Combined => "combined",
            FeedMode::PerSymbol => "per_symbol",
        }
    }
}

/// Configuration for the pipeline
#[derive(Debug, Clone, Default, Deserialize)]
#[serde(default)]
pub struct Config {
    pub feed: FeedConfig,
    pub storage: StorageConfig,
    pub aggregation: AggregationConfig,
    pub broadcast: BroadcastConfig,
    pub alerts: AlertConfig,
    pub analytics: AnalyticsConfig,
    pub logging: LoggingConfig,
}

#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct FeedConfig {
    pub base_url: String,
    pub mode: FeedMode,
    pub symbols: Vec<String>,
    pub backoff_initial_ms: u64,
    pub backoff_max_ms: u64,
    pub liveness_window_ms: i64,
    pub tick_channel_capacity: usize,
}

impl Default for FeedConfig {
    fn default() -> Self {
        FeedConfig {
            base_url: "wss://stream.binance.com:9443".to_string(),
            mode: FeedMode::Combined,
            symbols: vec![
                "BTCUSDT".to_string(),
                "ETHUSDT".to_string(),
                "BNBUSDT".to_string(),
            ],
            backoff_initial_ms: 1_000,
            backoff_max_ms: 60_000,
            liveness_window_ms: 10_000,
            tick_channel_capacity: 10_000,
        }
    }
}

#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct StorageConfig {
    pub max_ticks: usize,
    pub max_bars: usize,
    pub tick_buffer_capacity: usize,
}

impl Default for StorageConfig {
    fn default() -> Self {
        StorageConfig {
            max_ticks: 1_000,
            max_bars: 500,
            tick_buffer_capacity: 1_000,
        }
    }
}

#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct AggregationConfig {
    pub intervals: Vec<Timeframe>,
    pub snapshot_interval_ms: u64,
}

impl Default for AggregationConfig {
    fn default() -> Self {
        AggregationConfig {
            intervals: vec![Timeframe::OneSecond, Timeframe::OneMinute, Timeframe::FiveMinute],
            snapshot_interval_ms: 5_000,
        }
    }
}

#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct BroadcastConfig {
    pub subscriber_capacity: usize,
    pub max_send_failures: u32,
}

impl Default for BroadcastConfig {
    fn default() -> Self {
        BroadcastConfig {
            subscriber_capacity: 1_024,
            max_send_failures: 3,
        }
    }
}

#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct AlertConfig {
    pub check_interval_ms: u64,
    pub history_cap: usize,
    pub log_path: Option<PathBuf>,
    pub rules: Vec<RuleConfig>,
}

impl Default for AlertConfig {
    fn default() -> Self {
        AlertConfig {
            check_interval_ms: 500,
            history_cap: 100,
            log_path: None,
            rules: Vec::new(),
        }
    }
}

/// Rule definition as written in the config file
#[derive(Debug, Clone, Deserialize)]
pub struct RuleConfig {
    pub id: Option<String>,
    pub name: String,
    pub kind: String,
    pub threshold: f64,
    pub message: String,
    #[serde(default = "default_true")]
    pub enabled: bool,
}

fn default_true() -> bool {
    true
}

#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct AnalyticsConfig {
    pub metrics_interval: Timeframe,
    pub volume_window: usize,
}

impl Default for AnalyticsConfig {
    fn default() -> Self {
        AnalyticsConfig {
            metrics_interval: Timeframe::OneMinute,
            volume_window: 20,
        }
    }
}

#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct LoggingConfig {
    pub level: String,
    pub json: bool,
}

impl Default for LoggingConfig {
    fn default() -> Self {
        LoggingConfig {
            level: "info".to_string(),
            json: false,
        }
    }
}
