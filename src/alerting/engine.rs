/// Alert engine - periodic rule evaluation against the latest snapshot
use std::collections::VecDeque;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;

use serde::Serialize;
use tokio::sync::{watch, RwLock};
use tracing::{debug, info, warn};
use uuid::Uuid;

use super::rules::{severity_for, AlertRule};
use super::snapshot::SnapshotCache;
use super::store::AlertStore;
use crate::error::{FlowError, Result};
use crate::events::{Broadcaster, Channel, StreamMessage};
use crate::types::{Alert, AlertSeverity, AnalyticsSnapshot};
use crate::utils::time::now_ms;

const TEST_RULE_ID: &str = "test";

#[derive(Debug, Clone, Serialize)]
pub struct AlertEngineStats {
    pub active_rules: usize,
    pub total_rules: usize,
    pub rule_names: Vec<String>,
    pub checks_performed: u64,
    pub alerts_triggered: u64,
    pub rule_errors: u64,
    pub persist_failures: u64,
    pub history_len: usize,
    pub unacknowledged: usize,
}

pub struct AlertEngine {
    rules: RwLock<Vec<AlertRule>>,
    history: RwLock<VecDeque<Alert>>,
    history_cap: usize,
    snapshots: Arc<SnapshotCache>,
    store: Arc<dyn AlertStore>,
    bus: Arc<Broadcaster>,
    checks: AtomicU64,
    triggered: AtomicU64,
    rule_errors: AtomicU64,
    persist_failures: AtomicU64,
}

impl AlertEngine {
    pub fn new(
        rules: Vec<AlertRule>,
        history_cap: usize,
        snapshots: Arc<SnapshotCache>,
        store: Arc<dyn AlertStore>,
        bus: Arc<Broadcaster>,
    ) -> Self {
        AlertEngine {
            rules: RwLock::new(rules),
            history: RwLock::new(VecDeque::new()),
            history_cap: history_cap.max(1),
            snapshots,
            store,
            bus,
            checks: AtomicU64::new(0),
            triggered: AtomicU64::new(0),
            rule_errors: AtomicU64::new(0),
            persist_failures: AtomicU64::new(0),
        }
    }

    /// One evaluation cycle. Every enabled rule whose predicate holds fires;
    /// a failing rule is skipped for this cycle only.
    pub async fn check_all_rules(&self) -> Vec<Alert> {
        self.checks.fetch_add(1, Ordering::Relaxed);

        let Some(snapshot) = self.snapshots.latest().await else {
            return Vec::new();
        };
        if snapshot.is_empty() {
            return Vec::new();
        }

        let rules: Vec<AlertRule> = self.rules.read().await.iter().filter(|r| r.enabled).cloned().collect();

        let mut fired = Vec::new();
        for rule in &rules {
            match rule.evaluate(&snapshot) {
                Ok(Some(value)) => {
                    let alert = Alert {
                        id: Uuid::new_v4().to_string(),
                        rule_id: rule.id.clone(),
                        rule_name: rule.name.clone(),
                        severity: severity_for(value, rule.threshold),
                        message: rule.format_message(&snapshot),
                        threshold: rule.threshold,
                        triggered_value: Some(value),
                        data: snapshot.clone(),
                        timestamp: now_ms(),
                        acknowledged: false,
                    };
                    fired.push(self.raise(alert).await);
                }
                Ok(None) => {}
                Err(e) => {
                    self.rule_errors.fetch_add(1, Ordering::Relaxed);
                    warn!(rule = %rule.name, "Skipping rule this cycle: {} ({})", e, e.error_code());
                }
            }
        }

        fired
    }

    /// Persist, record and publish an alert
    async fn raise(&self, alert: Alert) -> Alert {
        if let Err(e) = self.store.insert_alert(alert.clone()).await {
            self.persist_failures.fetch_add(1, Ordering::Relaxed);
            warn!(rule = %alert.rule_name, "Failed to persist alert: {} ({})", e, e.error_code());
        }

        {
            let mut history = self.history.write().await;
            history.push_back(alert.clone());
            while history.len() > self.history_cap {
                history.pop_front();
            }
        }

        self.bus
            .publish(Channel::Alerts, StreamMessage::Alert(alert.clone()))
            .await;
        self.triggered.fetch_add(1, Ordering::Relaxed);

        warn!(
            rule = %alert.rule_name,
            severity = alert.severity.as_str(),
            "🚨 ALERT: {}",
            alert.message
        );

        alert
    }

    /// Evaluate on a fixed period until shutdown
    pub async fn run(self: Arc<Self>, period: Duration, mut shutdown: watch::Receiver<bool>) {
        let mut ticker = tokio::time::interval(period);
        ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Skip);

        info!("✅ Alert engine started (checking every {:?})", period);

        loop {
            tokio::select! {
                _ = ticker.tick() => {
                    let fired = self.check_all_rules().await;
                    if !fired.is_empty() {
                        debug!("Alert cycle raised {} alerts", fired.len());
                    }
                }
                changed = shutdown.changed() => {
                    if changed.is_err() || *shutdown.borrow() {
                        break;
                    }
                }
            }
        }

        info!("Alert engine stopped");
    }

    pub async fn add_rule(&self, rule: AlertRule) -> Result<()> {
        let mut rules = self.rules.write().await;
        if rules.iter().any(|r| r.id == rule.id) {
            return Err(FlowError::InvalidParameter(format!("Rule id already in use: {}", rule.id)));
        }

        info!(rule = %rule.name, "Added alert rule ({} > {})", rule.predicate.kind(), rule.threshold);
        rules.push(rule);
        Ok(())
    }

    /// Remove by id or name
    pub async fn remove_rule(&self, key: &str) -> Result<AlertRule> {
        let mut rules = self.rules.write().await;
        let position = rules
            .iter()
            .position(|r| r.id == key || r.name == key)
            .ok_or_else(|| FlowError::RuleNotFound(key.to_string()))?;

        let removed = rules.remove(position);
        info!(rule = %removed.name, "Removed alert rule");
        Ok(removed)
    }

    pub async fn set_rule_enabled(&self, key: &str, enabled: bool) -> Result<()> {
        let mut rules = self.rules.write().await;
        let rule = rules
            .iter_mut()
            .find(|r| r.id == key || r.name == key)
            .ok_or_else(|| FlowError::RuleNotFound(key.to_string()))?;

        rule.enabled = enabled;
        info!(rule = %rule.name, enabled, "Alert rule toggled");
        Ok(())
    }

    pub async fn rules(&self) -> Vec<AlertRule> {
        self.rules.read().await.clone()
    }

    pub async fn acknowledge(&self, alert_id: &str) -> Result<Alert> {
        let mut history = self.history.write().await;
        let alert = history
            .iter_mut()
            .find(|a| a.id == alert_id)
            .ok_or_else(|| FlowError::AlertNotFound(alert_id.to_string()))?;

        alert.acknowledged = true;
        debug!(alert = %alert_id, "Alert acknowledged");
        Ok(alert.clone())
    }

    /// Drop acknowledged alerts from the history; returns how many went
    pub async fn clear_acknowledged(&self) -> usize {
        let mut history = self.history.write().await;
        let before = history.len();
        history.retain(|a| !a.acknowledged);
        before - history.len()
    }

    /// Unacknowledged alerts, most recent first
    pub async fn active_alerts(&self, limit: usize) -> Vec<Alert> {
        let history = self.history.read().await;
        history
            .iter()
            .rev()
            .filter(|a| !a.acknowledged)
            .take(limit)
            .cloned()
            .collect()
    }

    /// In-memory history, most recent first
    pub async fn history(&self, limit: usize) -> Vec<Alert> {
        let history = self.history.read().await;
        history.iter().rev().take(limit).cloned().collect()
    }

    /// Alerts from the persistence collaborator, most recent first
    pub async fn recent_alerts(&self, limit: usize) -> Result<Vec<Alert>> {
        self.store.get_recent_alerts(limit).await
    }

    /// Raise an alert by hand, e.g. to check the delivery path end to end
    pub async fn create_test_alert(&self, severity: AlertSeverity, message: &str) -> Alert {
        let alert = Alert {
            id: Uuid::new_v4().to_string(),
            rule_id: TEST_RULE_ID.to_string(),
            rule_name: "Test Alert".to_string(),
            severity,
            message: message.to_string(),
            threshold: 0.0,
            triggered_value: None,
            data: AnalyticsSnapshot::new().with("test", true),
            timestamp: now_ms(),
            acknowledged: false,
        };
        self.raise(alert).await
    }

    pub async fn stats(&self) -> AlertEngineStats {
        let rules = self.rules.read().await;
        let history = self.history.read().await;

        AlertEngineStats {
            active_rules: rules.iter().filter(|r| r.enabled).count(),
            total_rules: rules.len(),
            rule_names: rules.iter().map(|r| r.name.clone()).collect(),
            checks_performed: self.checks.load(Ordering::Relaxed),
            alerts_triggered: self.triggered.load(Ordering::Relaxed),
            rule_errors: self.rule_errors.load(Ordering::Relaxed),
            persist_failures: self.persist_failures.load(Ordering::Relaxed),
            history_len: history.len(),
            unacknowledged: history.iter().filter(|a| !a.acknowledged).count(),
        }
    }
}
