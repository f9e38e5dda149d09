//! Derived series assembly.
//!
//! `build` walks one derived key through the whole pipeline:
//! definition lookup, concurrent raw reads through the request cache,
//! alignment on the primary dependency, formula evaluation, unit conversion.
//! A failed read aborts the build; a failed evaluation only drops its point.
//! Model-style definitions skip alignment and see every raw sample; their
//! forecast read runs alongside the raw reads.

use std::collections::BTreeMap;
use std::sync::Arc;
use std::time::Duration;

use chrono::{DateTime, Utc};
use futures::future::try_join_all;
use futures::try_join;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use crate::backend::Endpoints;
use crate::cache::{QueryOptions, RequestCache};
use crate::catalog::{CatalogStore, DerivationMode, DerivedSensorDefinition};
use crate::formula::{Formula, StationConstants};
use crate::models::{
    records_from_payload, DerivedPoint, DerivedSeries, RawSensorSeries, Record, TimeWindow,
};
use crate::units::{UnitCategory, UnitRegistry};
use crate::BuildError;

// ---

/// Default gap allowed between a primary timestamp and a secondary sample.
pub const DEFAULT_ALIGN_TOLERANCE: Duration = Duration::from_secs(300);

fn to_chrono(d: Duration) -> chrono::Duration {
    chrono::Duration::from_std(d).unwrap_or(chrono::Duration::MAX)
}

#[derive(Clone)]
pub struct DerivedSeriesBuilder {
    // ---
    cache: RequestCache,
    catalogs: CatalogStore,
    endpoints: Endpoints,
    units: Arc<UnitRegistry>,
    constants: StationConstants,
    tolerance: chrono::Duration,
}

impl DerivedSeriesBuilder {
    // ---
    pub fn new(
        cache: RequestCache,
        endpoints: Endpoints,
        units: UnitRegistry,
        constants: StationConstants,
    ) -> Self {
        // ---
        Self {
            catalogs: CatalogStore::new(cache.clone(), endpoints.clone()),
            cache,
            endpoints,
            units: Arc::new(units),
            constants,
            tolerance: to_chrono(DEFAULT_ALIGN_TOLERANCE),
        }
    }

    pub fn with_tolerance(mut self, tolerance: Duration) -> Self {
        self.tolerance = to_chrono(tolerance);
        self
    }

    /// Catalog store sharing this builder's cache, for editors.
    pub fn catalogs(&self) -> &CatalogStore {
        &self.catalogs
    }

    pub fn cache(&self) -> &RequestCache {
        &self.cache
    }

    pub fn units(&self) -> &UnitRegistry {
        &self.units
    }

    /// Build derived sensor `key` over `window`.
    pub async fn build(&self, key: &str, window: &TimeWindow) -> Result<DerivedSeries, BuildError> {
        // ---
        let definition = self
            .catalogs
            .find(key)
            .await?
            .ok_or_else(|| BuildError::NotFound(key.to_string()))?;
        self.build_definition(&definition, window).await
    }

    /// Like [`DerivedSeriesBuilder::build`], but gives up with
    /// [`BuildError::Cancelled`] once `cancel` fires. Reads already in
    /// flight keep running and land in the cache.
    pub async fn build_cancellable(
        &self,
        key: &str,
        window: &TimeWindow,
        cancel: &CancellationToken,
    ) -> Result<DerivedSeries, BuildError> {
        // ---
        tokio::select! {
            biased;
            _ = cancel.cancelled() => {
                debug!(key, "build cancelled");
                Err(BuildError::Cancelled)
            }
            result = self.build(key, window) => result,
        }
    }

    /// Build from a definition that is not (or not yet) in a catalog.
    pub async fn build_definition(
        &self,
        definition: &DerivedSensorDefinition,
        window: &TimeWindow,
    ) -> Result<DerivedSeries, BuildError> {
        // ---
        let key = definition.key.as_str();
        let formula = definition.compile()?;
        let opts = QueryOptions {
            ttl: definition.refresh_period(),
            retries: None,
        };

        let deps = definition.dependency_keys();

        let raw = try_join_all(deps.iter().map(|dep| self.fetch_raw(dep, window, opts)));
        let (series, forecast) = match definition.mode {
            DerivationMode::Pointwise => (raw.await?, Vec::new()),
            DerivationMode::Model => try_join!(raw, self.fetch_forecast(deps, window, opts))?,
        };

        if let Some(empty) = series.iter().find(|s| s.is_empty()) {
            return Err(BuildError::MissingDependencyData(empty.key.clone()));
        }

        let values = match definition.mode {
            DerivationMode::Pointwise => {
                self.evaluate_pointwise(key, &formula, &self.align(&series))
            }
            DerivationMode::Model => {
                self.evaluate_model(definition, &formula, &merge(&series), &forecast, window)
            }
        };

        let units = self
            .units
            .units_for(key)
            .or_else(|| self.units.for_measurement(&definition.measurement_category))
            .unwrap_or(&UnitCategory::IDENTITY);

        let points: Vec<DerivedPoint> = values
            .into_iter()
            .map(|(d, v)| DerivedPoint {
                d,
                v: units.convert(v),
            })
            .filter(|p| p.v.is_finite())
            .collect();

        info!(key, points = points.len(), "derived series built");
        Ok(DerivedSeries {
            key: key.to_string(),
            label: definition.label.clone(),
            measurement: definition.measurement_category.clone(),
            unit: units.metric_unit.to_string(),
            user_unit: units.user_unit.to_string(),
            points,
        })
    }

    async fn fetch_raw(
        &self,
        sensor_key: &str,
        window: &TimeWindow,
        opts: QueryOptions,
    ) -> Result<RawSensorSeries, BuildError> {
        // ---
        let fetch_failed = |source| BuildError::Fetch {
            key: sensor_key.to_string(),
            source,
        };
        let url = self.endpoints.raw_url(sensor_key, window);
        let payload = self.cache.query_with(&url, opts).await.map_err(fetch_failed)?;
        RawSensorSeries::from_payload(sensor_key, &payload).map_err(fetch_failed)
    }

    async fn fetch_forecast(
        &self,
        deps: &[String],
        window: &TimeWindow,
        opts: QueryOptions,
    ) -> Result<Vec<Record>, BuildError> {
        // ---
        let fetch_failed = |source| BuildError::Fetch {
            key: "forecast".to_string(),
            source,
        };
        let url = self.endpoints.forecast_url(deps, window);
        let payload = self.cache.query_with(&url, opts).await.map_err(fetch_failed)?;
        records_from_payload(&payload).map_err(fetch_failed)
    }

    /// One record per primary timestamp. Secondary fields come from the
    /// nearest sample within tolerance, or are left out.
    fn align(&self, series: &[RawSensorSeries]) -> Vec<Record> {
        // ---
        let Some((primary, secondary)) = series.split_first() else {
            return Vec::new();
        };

        primary
            .points
            .iter()
            .map(|sample| {
                let mut record = Record::new(sample.d).with(primary.key.clone(), sample.v);
                for other in secondary {
                    if let Some(v) = other.nearest(sample.d, self.tolerance) {
                        record.fields.insert(other.key.clone(), v);
                    }
                }
                record
            })
            .collect()
    }

    fn evaluate_pointwise(
        &self,
        key: &str,
        formula: &Formula,
        records: &[Record],
    ) -> Vec<(DateTime<Utc>, f64)> {
        // ---
        let mut dropped = 0usize;
        let values: Vec<_> = records
            .iter()
            .filter_map(|record| match formula.evaluate(record, &self.constants) {
                Ok(value) => {
                    let scalar = value.to_scalar();
                    if scalar.is_none() {
                        dropped += 1;
                    }
                    scalar.map(|v| (record.timestamp, v))
                }
                Err(e) => {
                    debug!(key, at = %record.timestamp, error = %e, "point dropped");
                    dropped += 1;
                    None
                }
            })
            .collect();

        if dropped > 0 {
            warn!(key, dropped, "formula produced no value for some points");
        }
        values
    }

    /// Run the formula once over the raw history plus the forecast. The
    /// result is stamped at the last history record, or the window end.
    fn evaluate_model(
        &self,
        definition: &DerivedSensorDefinition,
        formula: &Formula,
        history: &[Record],
        forecast: &[Record],
        window: &TimeWindow,
    ) -> Vec<(DateTime<Utc>, f64)> {
        // ---
        let at = history.last().map_or(window.end, |r| r.timestamp);
        match formula.evaluate_model(history, forecast, &self.constants) {
            Ok(value) => value.to_scalar().map(|v| vec![(at, v)]).unwrap_or_default(),
            Err(e) => {
                warn!(key = %definition.key, error = %e, "model evaluation failed");
                Vec::new()
            }
        }
    }
}

/// Every sample of every series, one record per distinct timestamp in time
/// order. Nothing is matched against a primary or dropped.
fn merge(series: &[RawSensorSeries]) -> Vec<Record> {
    // ---
    let mut rows: BTreeMap<DateTime<Utc>, Record> = BTreeMap::new();
    for s in series {
        for sample in &s.points {
            rows.entry(sample.d)
                .or_insert_with(|| Record::new(sample.d))
                .fields
                .insert(s.key.clone(), sample.v);
        }
    }
    rows.into_values().collect()
}
