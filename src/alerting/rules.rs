/// Alert rules - predicates over the latest analytics snapshot
use std::fmt;
use std::sync::Arc;

use serde_json::Value;

use crate::error::{FlowError, Result};
use crate::types::{AlertSeverity, AnalyticsSnapshot, RuleConfig};

/// Measures one metric from a snapshot. `Ok(None)` means undefined for this
/// snapshot (the rule does not fire).
pub type MetricFn = Arc<dyn Fn(&AnalyticsSnapshot) -> std::result::Result<Option<f64>, String> + Send + Sync>;

/// What a rule measures. A rule fires when the measured value exceeds its threshold.
#[derive(Clone)]
pub enum Predicate {
    /// `abs(zscore)`
    ZScoreAbove,
    /// `abs((spread - spread_mean) / spread_mean)`, undefined when the mean is 0
    SpreadDeviation,
    /// `abs(price_change_pct)`
    PriceChange,
    /// `volume / avg_volume`, undefined when the average is 0
    VolumeSpike,
    Custom(MetricFn),
}

impl Predicate {
    pub fn from_kind(kind: &str) -> Result<Self> {
        match kind.trim() {
            "zscore_above" => Ok(Predicate::ZScoreAbove),
            "spread_deviation" => Ok(Predicate::SpreadDeviation),
            "price_change" => Ok(Predicate::PriceChange),
            "volume_spike" => Ok(Predicate::VolumeSpike),
            other => Err(FlowError::Config(format!("Unknown rule kind: {}", other))),
        }
    }

    pub fn kind(&self) -> &str {
        match self {
            Predicate::ZScoreAbove => "zscore_above",
            Predicate::SpreadDeviation => "spread_deviation",
            Predicate::PriceChange => "price_change",
            Predicate::VolumeSpike => "volume_spike",
            Predicate::Custom(_) => "custom",
        }
    }

    pub fn measure(&self, snapshot: &AnalyticsSnapshot) -> std::result::Result<Option<f64>, String> {
        match self {
            Predicate::ZScoreAbove => Ok(Some(field(snapshot, "zscore")?.abs())),
            Predicate::SpreadDeviation => {
                let spread = field(snapshot, "spread")?;
                let mean = field(snapshot, "spread_mean")?;
                if mean == 0.0 {
                    return Ok(None);
                }
                Ok(Some(((spread - mean) / mean).abs()))
            }
            Predicate::PriceChange => Ok(Some(field(snapshot, "price_change_pct")?.abs())),
            Predicate::VolumeSpike => {
                let volume = field(snapshot, "volume")?;
                let average = field(snapshot, "avg_volume")?;
                if average == 0.0 {
                    return Ok(None);
                }
                Ok(Some(volume / average))
            }
            Predicate::Custom(metric) => metric(snapshot),
        }
    }
}

impl fmt::Debug for Predicate {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.kind())
    }
}

/// Absent fields read as 0
fn field(snapshot: &AnalyticsSnapshot, key: &str) -> std::result::Result<f64, String> {
    Ok(snapshot.get_f64(key)?.unwrap_or(0.0))
}

#[derive(Debug, Clone)]
pub struct AlertRule {
    pub id: String,
    pub name: String,
    pub predicate: Predicate,
    pub threshold: f64,
    pub message_template: String,
    pub enabled: bool,
}

impl AlertRule {
    pub fn new(name: &str, predicate: Predicate, threshold: f64, message_template: &str) -> Self {
        AlertRule {
            id: slug(name),
            name: name.to_string(),
            predicate,
            threshold,
            message_template: message_template.to_string(),
            enabled: true,
        }
    }

    pub fn with_id(mut self, id: &str) -> Self {
        self.id = id.to_string();
        self
    }

    pub fn from_config(config: &RuleConfig) -> Result<Self> {
        if !config.threshold.is_finite() {
            return Err(FlowError::Config(format!(
                "Rule '{}' has a non-finite threshold",
                config.name
            )));
        }

        let mut rule = AlertRule::new(
            &config.name,
            Predicate::from_kind(&config.kind)?,
            config.threshold,
            &config.message,
        );
        if let Some(id) = config.id.as_deref().filter(|id| !id.trim().is_empty()) {
            rule.id = id.trim().to_string();
        }
        rule.enabled = config.enabled;

        Ok(rule)
    }

    /// Measured value when the rule fires, `None` otherwise
    pub fn evaluate(&self, snapshot: &AnalyticsSnapshot) -> Result<Option<f64>> {
        let measured = self
            .predicate
            .measure(snapshot)
            .map_err(|reason| FlowError::RuleEvaluation {
                rule: self.name.clone(),
                reason,
            })?;

        Ok(measured.filter(|value| *value > self.threshold))
    }

    pub fn format_message(&self, snapshot: &AnalyticsSnapshot) -> String {
        render_template(&self.message_template, snapshot, self.threshold)
    }
}

/// The stock rule set
pub fn default_rules() -> Vec<AlertRule> {
    vec![
        AlertRule::new(
            "High Z-Score",
            Predicate::ZScoreAbove,
            2.0,
            "Z-score alert: {symbol} z-score = {zscore:.2} (threshold: {threshold})",
        )
        .with_id("high_zscore"),
        AlertRule::new(
            "Large Spread Deviation",
            Predicate::SpreadDeviation,
            0.005,
            "Spread alert: {symbol} spread {spread:.4} vs mean {spread_mean:.4} (threshold: {threshold:.1%})",
        )
        .with_id("spread_deviation"),
        AlertRule::new(
            "Price Spike",
            Predicate::PriceChange,
            0.02,
            "Price spike alert: {symbol} changed {price_change_pct:.2%} (threshold: {threshold:.1%})",
        )
        .with_id("price_spike"),
        AlertRule::new(
            "Volume Spike",
            Predicate::VolumeSpike,
            3.0,
            "Volume spike: {symbol} volume {volume:.2} is {volume_ratio:.1}x average",
        )
        .with_id("volume_spike"),
    ]
}

/// Severity from how far `value` exceeds `threshold`
pub fn severity_for(value: f64, threshold: f64) -> AlertSeverity {
    if threshold <= 0.0 {
        return AlertSeverity::Medium;
    }

    let ratio = value.abs() / threshold;
    if ratio < 1.5 {
        AlertSeverity::Medium
    } else if ratio < 2.0 {
        AlertSeverity::High
    } else {
        AlertSeverity::Critical
    }
}

fn slug(name: &str) -> String {
    let mut slug = String::with_capacity(name.len());
    for c in name.chars() {
        if c.is_ascii_alphanumeric() {
            slug.push(c.to_ascii_lowercase());
        } else if !slug.ends_with('_') {
            slug.push('_');
        }
    }
    slug.trim_matches('_').to_string()
}

/// Substitute `{field}`, `{field:.N}` and `{field:.N%}` placeholders.
/// Anything that cannot be resolved is kept as written.
pub fn render_template(template: &str, snapshot: &AnalyticsSnapshot, threshold: f64) -> String {
    let mut out = String::with_capacity(template.len() + 16);
    let mut rest = template;

    while let Some(open) = rest.find('{') {
        out.push_str(&rest[..open]);
        let after = &rest[open + 1..];

        let Some(close) = after.find('}') else {
            out.push_str(&rest[open..]);
            return out;
        };

        let placeholder = &after[..close];
        match render_placeholder(placeholder, snapshot, threshold) {
            Some(text) => out.push_str(&text),
            None => {
                out.push('{');
                out.push_str(placeholder);
                out.push('}');
            }
        }
        rest = &after[close + 1..];
    }

    out.push_str(rest);
    out
}

fn render_placeholder(placeholder: &str, snapshot: &AnalyticsSnapshot, threshold: f64) -> Option<String> {
    let (name, format_spec) = match placeholder.split_once(':') {
        Some((name, format_spec)) => (name, Some(format_spec)),
        None => (placeholder, None),
    };

    let value = if name == "threshold" {
        Value::from(threshold)
    } else {
        snapshot.get(name)?.clone()
    };

    match value {
        Value::Number(n) => match format_spec {
            None => Some(n.to_string()),
            Some(format_spec) => format_number(n.as_f64()?, format_spec),
        },
        Value::String(s) => Some(s),
        other => Some(other.to_string()),
    }
}

fn format_number(value: f64, format_spec: &str) -> Option<String> {
    let digits = format_spec.strip_prefix('.')?;

    if let Some(digits) = digits.strip_suffix('%') {
        let precision: usize = digits.parse().ok()?;
        return Some(format!("{:.*}%", precision, value * 100.0));
    }

    let precision: usize = digits.strip_suffix('f').unwrap_or(digits).parse().ok()?;
    Some(format!("{:.*}", precision, value))
}
