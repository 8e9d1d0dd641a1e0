pub mod backoff;
pub mod client;
pub mod connector;
pub mod parser;

pub use backoff::Backoff;
pub use client::{combined_url, symbol_url, FeedClient, FeedStats};
pub use connector::{FeedConnector, FrameStream, TungsteniteConnector};
pub use parser::{parse_combined, parse_symbol_frame};
