pub mod engine;
pub mod rules;
pub mod snapshot;
pub mod store;

pub use engine::{AlertEngine, AlertEngineStats};
pub use rules::{default_rules, render_template, severity_for, AlertRule, MetricFn, Predicate};
pub use snapshot::SnapshotCache;
pub use store::{AlertStore, InMemoryAlertStore, JsonlAlertStore};
