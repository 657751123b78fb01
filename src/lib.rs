//! Exchange-rate cache and currency converter.
//!
//! Rates are fetched lazily from public endpoints, kept in a JSON file with a
//! 24 hour TTL and served from there, from a stale copy, or from a small
//! built-in table when the network is unavailable.
//!
//! ```rust,ignore
//! use fxconv::{Converter, FxConfig};
//! use rust_decimal_macros::dec;
//!
//! let converter = Converter::from_config(FxConfig::from_env())?;
//! let conversion = converter.convert(dec!(25), "USD", "UZS").await?;
//! println!("{}", conversion.result);
//! ```

pub mod api;
pub mod cache;
pub mod cli;
pub mod config;
pub mod converter;
pub mod error;
pub mod logger;
pub mod models;
pub mod money;

pub use api::{HttpRateProvider, ProviderChain, RateProvider};
pub use cache::RateStore;
pub use config::FxConfig;
pub use converter::Converter;
pub use error::{FxError, FxResult};
pub use models::{CacheEntry, Conversion, ConversionRequest, RateSource, RateTable, RatesSnapshot};
