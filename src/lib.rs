pub mod types;
pub mod error;
pub mod config;
pub mod utils;
pub mod events;
pub mod data;
pub mod feed;
pub mod alerting;
pub mod analytics;
pub mod app;

pub use types::*;
pub use error::{FlowError, Result};
pub use app::{AppStats, MarketApp};
