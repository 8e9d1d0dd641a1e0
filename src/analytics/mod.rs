pub mod bar_metrics;

pub use bar_metrics::BarMetrics;
