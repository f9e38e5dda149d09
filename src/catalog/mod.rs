//! Derived sensor catalog gateway (EMBP).
//!
//! - `definition`: the definition record and catalog kinds
//! - `store`: in-memory catalog editing and persistence via the request cache

mod definition;
mod store;

pub use definition::{CatalogKind, DerivationMode, DerivedSensorDefinition, DEFAULT_REFRESH_SECS};
pub use store::{CatalogStore, DerivedSensorCatalog};
