//! Market-data ingestion and exchange connectivity.
//!
//! All venues implement [`ExchangeProvider`] and register in a
//! [`ProviderRegistry`]; [`DataFeed`] races the configured sources per tick
//! with caching, staleness rejection and per-source circuit breaking.

pub mod binance;
pub mod feed;
pub mod paper;
pub mod provider;

pub use binance::BinanceProvider;
pub use feed::{DataFeed, FeedConfig};
pub use paper::{PaperConfig, PaperExchange};
pub use provider::{timeframe_duration, ExchangeProvider, ProviderRegistry};
