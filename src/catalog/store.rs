//! In-memory catalog plus its persistence through the request cache.

use std::collections::BTreeMap;
use std::sync::Arc;

use serde::Deserialize;
use serde_json::{json, Value};
use tokio::sync::Mutex;
use tracing::{info, warn};

use super::{CatalogKind, DerivedSensorDefinition};
use crate::backend::Endpoints;
use crate::cache::RequestCache;
use crate::{CatalogError, FetchError};

// ---

/// `GET /api/{kind}-probes` response body.
#[derive(Debug, Deserialize)]
struct CatalogResponse {
    #[serde(default)]
    settings: BTreeMap<String, DerivedSensorDefinition>,
}

/// One catalog's definitions, keyed by derived-sensor key.
#[derive(Debug, Clone, PartialEq)]
pub struct DerivedSensorCatalog {
    // ---
    kind: CatalogKind,
    definitions: BTreeMap<String, DerivedSensorDefinition>,
}

impl DerivedSensorCatalog {
    // ---
    pub fn new(kind: CatalogKind) -> Self {
        Self {
            kind,
            definitions: BTreeMap::new(),
        }
    }

    /// Build from stored settings, reconciling every record's dependency
    /// list with its formula. A record whose formula no longer compiles is
    /// kept as stored so it can still be edited.
    pub fn from_settings(kind: CatalogKind, settings: BTreeMap<String, DerivedSensorDefinition>) -> Self {
        // ---
        let mut definitions = BTreeMap::new();
        for (key, mut def) in settings {
            if def.key != key {
                if !def.key.is_empty() {
                    warn!(%kind, key = %key, stored = %def.key, "record key differs from its catalog key");
                }
                def.key = key.clone();
            }
            match def.reconcile() {
                Ok(true) => warn!(%kind, key = %key, "stored dependencies diverged from formula, recomputed"),
                Ok(false) => {}
                Err(e) => warn!(%kind, key = %key, error = %e, "stored formula does not compile"),
            }
            definitions.insert(key, def);
        }
        Self { kind, definitions }
    }

    pub fn kind(&self) -> CatalogKind {
        self.kind
    }

    /// Insert or replace `def`, recomputing its dependencies. Returns the
    /// replaced definition, if any.
    pub fn upsert(
        &mut self,
        mut def: DerivedSensorDefinition,
    ) -> Result<Option<DerivedSensorDefinition>, CatalogError> {
        // ---
        def.reconcile()?;
        Ok(self.definitions.insert(def.key.clone(), def))
    }

    pub fn set_formula(&mut self, key: &str, source: &str) -> Result<(), CatalogError> {
        // ---
        let def = self
            .definitions
            .get_mut(key)
            .ok_or_else(|| CatalogError::NotFound(key.to_string()))?;
        def.set_formula(source)?;
        Ok(())
    }

    pub fn remove(&mut self, key: &str) -> Option<DerivedSensorDefinition> {
        self.definitions.remove(key)
    }

    pub fn get(&self, key: &str) -> Option<&DerivedSensorDefinition> {
        self.definitions.get(key)
    }

    pub fn definitions(&self) -> impl Iterator<Item = &DerivedSensorDefinition> {
        self.definitions.values()
    }

    pub fn len(&self) -> usize {
        self.definitions.len()
    }

    pub fn is_empty(&self) -> bool {
        self.definitions.is_empty()
    }

    /// `PUT` body: `{settings: {key: definition}}`.
    pub fn to_body(&self) -> Value {
        json!({ "settings": &self.definitions })
    }
}

/// Loads and saves catalogs through the shared [`RequestCache`].
#[derive(Clone)]
pub struct CatalogStore {
    // ---
    cache: RequestCache,
    endpoints: Endpoints,
    /// Serializes read-modify-write edits made through this store.
    edit_lock: Arc<Mutex<()>>,
}

impl CatalogStore {
    // ---
    pub fn new(cache: RequestCache, endpoints: Endpoints) -> Self {
        Self {
            cache,
            endpoints,
            edit_lock: Arc::new(Mutex::new(())),
        }
    }

    pub async fn load(&self, kind: CatalogKind) -> Result<DerivedSensorCatalog, CatalogError> {
        // ---
        let url = self.endpoints.catalog_url(kind);
        let payload = self.cache.query(&url).await?;
        let response = CatalogResponse::deserialize(payload.as_ref())
            .map_err(|e| FetchError::Decode(format!("{kind} catalog: {e}")))?;
        Ok(DerivedSensorCatalog::from_settings(kind, response.settings))
    }

    /// Persist `catalog` and drop every cached read of it.
    pub async fn save(&self, catalog: &DerivedSensorCatalog) -> Result<(), CatalogError> {
        // ---
        let kind = catalog.kind();
        let url = self.endpoints.catalog_url(kind);
        self.cache
            .mutate(&url, &catalog.to_body(), &[kind.path()])
            .await?;
        info!(%kind, definitions = catalog.len(), "catalog saved");
        Ok(())
    }

    /// Load, apply `edit`, save. Nothing is saved if `edit` fails.
    pub async fn update<T, F>(&self, kind: CatalogKind, edit: F) -> Result<T, CatalogError>
    where
        F: FnOnce(&mut DerivedSensorCatalog) -> Result<T, CatalogError>,
    {
        // ---
        let _guard = self.edit_lock.lock().await;
        let mut catalog = self.load(kind).await?;
        let out = edit(&mut catalog)?;
        self.save(&catalog).await?;
        Ok(out)
    }

    /// Find `key` in the composite catalog, then the integrator one.
    pub async fn find(&self, key: &str) -> Result<Option<DerivedSensorDefinition>, CatalogError> {
        // ---
        for kind in CatalogKind::ALL {
            let catalog = self.load(kind).await?;
            if let Some(def) = catalog.get(key) {
                return Ok(Some(def.clone()));
            }
        }
        Ok(None)
    }
}
