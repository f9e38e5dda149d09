//! Derived weather metrics: formulas over raw sensor series, served as series.
//!
//! Crate gateway (EMBP). Components, leaves first:
//! - `units`: metric-to-user unit conversions
//! - `formula`: sandboxed formula language and dependency resolution
//! - `cache`: deduplicating request cache over the backend transport
//! - `catalog`: derived sensor definitions and their persistence
//! - `builder`: assembles a derived series from raw series
//! - `routes`: HTTP gateway consumed by chart clients
//!
//! The binary (`main.rs`) only wires these together.

pub mod backend;
pub mod builder;
pub mod cache;
pub mod catalog;
pub mod config;
pub mod formula;
pub mod models;
pub mod routes;
pub mod units;

mod error;

#[cfg(test)]
mod testing;

pub use builder::DerivedSeriesBuilder;
pub use config::Config;
pub use error::{BuildError, CatalogError, FetchError, FormulaError};
