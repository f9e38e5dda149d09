//! Derived-sensor definition records.

use std::collections::BTreeMap;
use std::fmt;
use std::str::FromStr;
use std::time::Duration;

use anyhow::anyhow;
use serde::{Deserialize, Serialize};

use crate::formula::{self, Formula};
use crate::FormulaError;

// ---

/// Raw-read freshness used when a definition does not set its own.
pub const DEFAULT_REFRESH_SECS: u64 = 300;

/// The backend keeps derived sensors in two catalogs of identical shape.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum CatalogKind {
    Composite,
    Integrator,
}

impl CatalogKind {
    // ---
    /// Lookup order used when a derived key is requested without its kind.
    pub const ALL: [CatalogKind; 2] = [CatalogKind::Composite, CatalogKind::Integrator];

    pub fn path(self) -> &'static str {
        match self {
            CatalogKind::Composite => "/api/composite-probes",
            CatalogKind::Integrator => "/api/integrator-probes",
        }
    }

    pub fn as_str(self) -> &'static str {
        match self {
            CatalogKind::Composite => "composite",
            CatalogKind::Integrator => "integrator",
        }
    }
}

impl fmt::Display for CatalogKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for CatalogKind {
    type Err = anyhow::Error;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "composite" => Ok(CatalogKind::Composite),
            "integrator" => Ok(CatalogKind::Integrator),
            other => Err(anyhow!("unknown catalog kind '{}'", other)),
        }
    }
}

/// How the formula consumes its inputs.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum DerivationMode {
    /// One evaluation per aligned record.
    #[default]
    Pointwise,
    /// One evaluation over the whole history plus a forecast.
    Model,
}

/// A named derived metric.
///
/// `dependency_keys` and `field_mapping` are always the ones resolved from
/// `formula_source`. They have no setters; changing the formula recomputes
/// them, and records loaded from storage are reconciled on load.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct DerivedSensorDefinition {
    // ---
    #[serde(default)]
    pub key: String,
    #[serde(default)]
    pub label: String,
    #[serde(default)]
    pub comment: String,
    formula_source: String,
    #[serde(default)]
    dependency_keys: Vec<String>,
    #[serde(default)]
    field_mapping: BTreeMap<String, String>,
    #[serde(default = "default_refresh")]
    pub refresh_period_seconds: u64,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub output_storage_key: Option<String>,
    #[serde(default)]
    pub measurement_category: String,
    #[serde(default)]
    pub mode: DerivationMode,
}

fn default_refresh() -> u64 {
    DEFAULT_REFRESH_SECS
}

impl DerivedSensorDefinition {
    // ---
    /// New point-wise definition. Fails if `formula_source` does not compile.
    pub fn new(
        key: impl Into<String>,
        label: impl Into<String>,
        formula_source: impl Into<String>,
        measurement_category: impl Into<String>,
    ) -> Result<Self, FormulaError> {
        // ---
        let formula_source = formula_source.into();
        let deps = formula::resolve(&formula_source)?;

        Ok(Self {
            key: key.into(),
            label: label.into(),
            comment: String::new(),
            formula_source,
            dependency_keys: deps.dependency_keys,
            field_mapping: deps.field_mapping,
            refresh_period_seconds: DEFAULT_REFRESH_SECS,
            output_storage_key: None,
            measurement_category: measurement_category.into(),
            mode: DerivationMode::Pointwise,
        })
    }

    pub fn with_comment(mut self, comment: impl Into<String>) -> Self {
        self.comment = comment.into();
        self
    }

    pub fn with_mode(mut self, mode: DerivationMode) -> Self {
        self.mode = mode;
        self
    }

    pub fn with_refresh_period(mut self, seconds: u64) -> Self {
        self.refresh_period_seconds = seconds;
        self
    }

    pub fn with_output_storage_key(mut self, key: impl Into<String>) -> Self {
        self.output_storage_key = Some(key.into());
        self
    }

    pub fn formula_source(&self) -> &str {
        &self.formula_source
    }

    /// Raw sensor keys the formula reads, primary (alignment anchor) first.
    pub fn dependency_keys(&self) -> &[String] {
        &self.dependency_keys
    }

    pub fn field_mapping(&self) -> &BTreeMap<String, String> {
        &self.field_mapping
    }

    /// TTL for this sensor's raw reads, or `None` for the cache default.
    pub fn refresh_period(&self) -> Option<Duration> {
        (self.refresh_period_seconds > 0).then(|| Duration::from_secs(self.refresh_period_seconds))
    }

    pub fn compile(&self) -> Result<Formula, FormulaError> {
        Formula::compile(&self.formula_source)
    }

    /// Replace the formula. On a parse error the definition is unchanged.
    pub fn set_formula(&mut self, source: impl Into<String>) -> Result<(), FormulaError> {
        // ---
        let source = source.into();
        let deps = formula::resolve(&source)?;
        self.formula_source = source;
        self.dependency_keys = deps.dependency_keys;
        self.field_mapping = deps.field_mapping;
        Ok(())
    }

    /// Recompute the dependency fields from the formula. Returns `true` when
    /// the stored ones differed.
    pub(crate) fn reconcile(&mut self) -> Result<bool, FormulaError> {
        // ---
        let deps = formula::resolve(&self.formula_source)?;
        let changed =
            deps.dependency_keys != self.dependency_keys || deps.field_mapping != self.field_mapping;
        self.dependency_keys = deps.dependency_keys;
        self.field_mapping = deps.field_mapping;
        Ok(changed)
    }
}

#[cfg(test)]
mod tests {
    // ---
    use super::*;
    use serde_json::json;

    const DEW_POINT: &str = "dewPoint = d => { \
        const t = d['temperature:outTemp']; \
        const rh = d['humidity:outHumidity']; \
        return t - (100 - rh) / 5; }";

    #[test]
    fn test_new_resolves_dependencies() {
        // ---
        let def = DerivedSensorDefinition::new("composite:dewPoint", "Dew point", DEW_POINT, "temperature")
            .unwrap();
        assert_eq!(def.dependency_keys(), ["temperature:outTemp", "humidity:outHumidity"]);
        assert_eq!(def.field_mapping()["humidity:outHumidity"], "outHumidity");
        assert_eq!(def.refresh_period(), Some(Duration::from_secs(DEFAULT_REFRESH_SECS)));
    }

    #[test]
    fn test_set_formula_is_atomic() {
        // ---
        let mut def = DerivedSensorDefinition::new("composite:dewPoint", "Dew point", DEW_POINT, "temperature")
            .unwrap();
        let before = def.clone();

        let err = def.set_formula("d => d['temperature:outTemp'] +").unwrap_err();
        assert!(matches!(err, FormulaError::Parse { .. }));
        assert_eq!(def, before);

        def.set_formula("d => d['pressure:barometer'] * 0.1").unwrap();
        assert_eq!(def.dependency_keys(), ["pressure:barometer"]);
    }

    #[test]
    fn test_stored_record_is_reconciled() {
        // ---
        let mut def: DerivedSensorDefinition = serde_json::from_value(json!({
            "key": "composite:feels",
            "label": "Feels like",
            "formulaSource": "d => d['temperature:outTemp'] - 2",
            "dependencyKeys": ["wind:windSpeed"],
            "measurementCategory": "temperature"
        }))
        .unwrap();

        assert_eq!(def.mode, DerivationMode::Pointwise);
        assert!(def.reconcile().unwrap());
        assert_eq!(def.dependency_keys(), ["temperature:outTemp"]);
        assert!(!def.reconcile().unwrap());
    }

    #[test]
    fn test_wire_shape_is_camel_case() {
        // ---
        let def = DerivedSensorDefinition::new("integrator:setpoint", "Setpoint", "(h, f) => mean(h, 'temperature:outTemp')", "temperature")
            .unwrap()
            .with_mode(DerivationMode::Model)
            .with_refresh_period(0);
        let v = serde_json::to_value(&def).unwrap();

        assert_eq!(v["formulaSource"], "(h, f) => mean(h, 'temperature:outTemp')");
        assert_eq!(v["dependencyKeys"], json!(["temperature:outTemp"]));
        assert_eq!(v["mode"], "model");
        assert!(v.get("outputStorageKey").is_none());
        assert_eq!(def.refresh_period(), None);

        let stored = def
            .with_comment("ASHRAE adaptive")
            .with_output_storage_key("integrator:setpointStored");
        let v = serde_json::to_value(&stored).unwrap();
        assert_eq!(v["comment"], "ASHRAE adaptive");
        assert_eq!(v["outputStorageKey"], "integrator:setpointStored");
    }

    #[test]
    fn test_catalog_kind_parsing() {
        // ---
        assert_eq!("integrator".parse::<CatalogKind>().unwrap(), CatalogKind::Integrator);
        assert!("probes".parse::<CatalogKind>().is_err());
        assert_eq!(CatalogKind::Composite.to_string(), "composite");
    }
}
