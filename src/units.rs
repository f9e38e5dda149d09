//! Unit conversion registry.
//!
//! Every measurement class has a canonical metric unit. Users pick a display
//! unit per class; the registry pairs the two with a pure conversion. Entries
//! are built once at startup and shared read-only.

use std::collections::HashMap;
use std::str::FromStr;

use anyhow::{anyhow, Result};
use serde::Serialize;

// ---

const ABSOLUTE_ZERO_C: f64 = -273.15;
const HPA_PER_INHG: f64 = 33.863_886_666_7;
const HPA_PER_MMHG: f64 = 1.333_223_684;
const MM_PER_IN: f64 = 25.4;
const M_PER_FT: f64 = 0.3048;

/// Pure metric → user conversion.
#[derive(Debug, Clone, Copy, PartialEq, Serialize)]
pub enum Conversion {
    // ---
    Identity,
    CelsiusToFahrenheit,
    HectopascalToInHg,
    HectopascalToMmHg,
    MetersPerSecondToKmh,
    MetersPerSecondToMph,
    MetersPerSecondToKnots,
    MillimetersToInches,
    MetersToFeet,
}

impl Conversion {
    // ---
    /// Convert a metric value. Returns `NaN` for values outside the physical
    /// domain, which callers must treat as "do not plot".
    pub fn apply(self, metric: f64) -> f64 {
        // ---
        if !metric.is_finite() {
            return f64::NAN;
        }
        match self {
            Conversion::Identity => metric,
            Conversion::CelsiusToFahrenheit => {
                if metric < ABSOLUTE_ZERO_C {
                    f64::NAN
                } else {
                    metric * 9.0 / 5.0 + 32.0
                }
            }
            Conversion::HectopascalToInHg => metric / HPA_PER_INHG,
            Conversion::HectopascalToMmHg => metric / HPA_PER_MMHG,
            Conversion::MetersPerSecondToKmh => metric * 3.6,
            Conversion::MetersPerSecondToMph => metric * 3600.0 / 1609.344,
            Conversion::MetersPerSecondToKnots => metric * 3600.0 / 1852.0,
            Conversion::MillimetersToInches => metric / MM_PER_IN,
            Conversion::MetersToFeet => metric / M_PER_FT,
        }
    }

    /// Inverse of [`Conversion::apply`].
    pub fn invert(self, user: f64) -> f64 {
        // ---
        match self {
            Conversion::Identity => user,
            Conversion::CelsiusToFahrenheit => (user - 32.0) * 5.0 / 9.0,
            Conversion::HectopascalToInHg => user * HPA_PER_INHG,
            Conversion::HectopascalToMmHg => user * HPA_PER_MMHG,
            Conversion::MetersPerSecondToKmh => user / 3.6,
            Conversion::MetersPerSecondToMph => user * 1609.344 / 3600.0,
            Conversion::MetersPerSecondToKnots => user * 1852.0 / 3600.0,
            Conversion::MillimetersToInches => user * MM_PER_IN,
            Conversion::MetersToFeet => user * M_PER_FT,
        }
    }
}

/// Metric unit, display unit and the conversion between them.
#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct UnitCategory {
    // ---
    pub metric_unit: &'static str,
    pub user_unit: &'static str,
    #[serde(skip)]
    pub convert: Conversion,
}

impl UnitCategory {
    // ---
    pub const IDENTITY: UnitCategory = UnitCategory {
        metric_unit: "",
        user_unit: "",
        convert: Conversion::Identity,
    };

    const fn same(unit: &'static str) -> Self {
        UnitCategory {
            metric_unit: unit,
            user_unit: unit,
            convert: Conversion::Identity,
        }
    }

    pub fn convert(&self, metric: f64) -> f64 {
        self.convert.apply(metric)
    }
}

/// Display unit a user may choose for a measurement class.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum UserUnit {
    // ---
    Celsius,
    Fahrenheit,
    Hectopascal,
    InHg,
    MmHg,
    MetersPerSecond,
    Kmh,
    Mph,
    Knots,
    Millimeters,
    Inches,
    Meters,
    Feet,
}

impl FromStr for UserUnit {
    type Err = anyhow::Error;

    fn from_str(s: &str) -> Result<Self> {
        // ---
        Ok(match s.trim() {
            "C" | "°C" => UserUnit::Celsius,
            "F" | "°F" => UserUnit::Fahrenheit,
            "hPa" | "mbar" => UserUnit::Hectopascal,
            "inHg" => UserUnit::InHg,
            "mmHg" => UserUnit::MmHg,
            "m/s" => UserUnit::MetersPerSecond,
            "km/h" | "kmh" => UserUnit::Kmh,
            "mph" => UserUnit::Mph,
            "kn" | "kt" => UserUnit::Knots,
            "mm" => UserUnit::Millimeters,
            "in" => UserUnit::Inches,
            "m" => UserUnit::Meters,
            "ft" => UserUnit::Feet,
            other => return Err(anyhow!("unknown unit '{}'", other)),
        })
    }
}

/// Parse `measurement=unit` pairs, e.g. `temperature=F,pressure=inHg`.
pub fn parse_preferences(spec: &str) -> Result<Vec<(String, UserUnit)>> {
    // ---
    spec.split(',')
        .map(str::trim)
        .filter(|pair| !pair.is_empty())
        .map(|pair| {
            let (measurement, unit) = pair
                .split_once('=')
                .ok_or_else(|| anyhow!("expected measurement=unit, got '{}'", pair))?;
            Ok((measurement.trim().to_string(), unit.parse()?))
        })
        .collect()
}

/// Lookup table from sensor key or measurement class to [`UnitCategory`].
#[derive(Debug, Clone)]
pub struct UnitRegistry {
    // ---
    by_measurement: HashMap<String, UnitCategory>,
    /// Sensor keys whose measurement class is not their key prefix.
    sensor_measurements: HashMap<String, String>,
}

impl Default for UnitRegistry {
    fn default() -> Self {
        Self::metric()
    }
}

impl UnitRegistry {
    // ---
    /// Registry that displays everything in metric units.
    pub fn metric() -> Self {
        // ---
        let by_measurement = [
            ("temperature", UnitCategory::same("°C")),
            ("pressure", UnitCategory::same("hPa")),
            ("speed", UnitCategory::same("m/s")),
            ("rain", UnitCategory::same("mm")),
            ("altitude", UnitCategory::same("m")),
            ("humidity", UnitCategory::same("%")),
            ("irradiance", UnitCategory::same("W/m²")),
            ("uv", UnitCategory::same("index")),
            ("angle", UnitCategory::same("°")),
        ]
        .into_iter()
        .map(|(m, c)| (m.to_string(), c))
        .collect();

        let sensor_measurements = [
            ("wind:windSpeed", "speed"),
            ("wind:windGust", "speed"),
            ("wind:windDir", "angle"),
            ("wind:windGustDir", "angle"),
            ("solar:radiation", "irradiance"),
            ("solar:UV", "uv"),
        ]
        .into_iter()
        .map(|(k, m)| (k.to_string(), m.to_string()))
        .collect();

        Self {
            by_measurement,
            sensor_measurements,
        }
    }

    /// Metric registry with the user's display preferences applied.
    pub fn with_preferences(prefs: &[(String, UserUnit)]) -> Result<Self> {
        // ---
        let mut registry = Self::metric();
        for (measurement, unit) in prefs {
            let category = category_for(measurement, *unit)?;
            registry.by_measurement.insert(measurement.clone(), category);
        }
        Ok(registry)
    }

    /// Map a sensor key to a measurement class other than its key prefix.
    pub fn assign(&mut self, sensor_key: impl Into<String>, measurement: impl Into<String>) {
        self.sensor_measurements
            .insert(sensor_key.into(), measurement.into());
    }

    /// Units for a sensor key: explicit assignment first, then the
    /// `category:` prefix of the key.
    pub fn units_for(&self, sensor_key: &str) -> Option<&UnitCategory> {
        // ---
        let measurement = self
            .sensor_measurements
            .get(sensor_key)
            .map(String::as_str)
            .unwrap_or_else(|| sensor_key.split(':').next().unwrap_or(sensor_key));
        self.for_measurement(measurement)
    }

    pub fn for_measurement(&self, measurement: &str) -> Option<&UnitCategory> {
        self.by_measurement.get(measurement)
    }
}

fn category_for(measurement: &str, unit: UserUnit) -> Result<UnitCategory> {
    // ---
    let (metric_unit, user_unit, convert) = match (measurement, unit) {
        ("temperature", UserUnit::Celsius) => ("°C", "°C", Conversion::Identity),
        ("temperature", UserUnit::Fahrenheit) => ("°C", "°F", Conversion::CelsiusToFahrenheit),
        ("pressure", UserUnit::Hectopascal) => ("hPa", "hPa", Conversion::Identity),
        ("pressure", UserUnit::InHg) => ("hPa", "inHg", Conversion::HectopascalToInHg),
        ("pressure", UserUnit::MmHg) => ("hPa", "mmHg", Conversion::HectopascalToMmHg),
        ("speed", UserUnit::MetersPerSecond) => ("m/s", "m/s", Conversion::Identity),
        ("speed", UserUnit::Kmh) => ("m/s", "km/h", Conversion::MetersPerSecondToKmh),
        ("speed", UserUnit::Mph) => ("m/s", "mph", Conversion::MetersPerSecondToMph),
        ("speed", UserUnit::Knots) => ("m/s", "kn", Conversion::MetersPerSecondToKnots),
        ("rain", UserUnit::Millimeters) => ("mm", "mm", Conversion::Identity),
        ("rain", UserUnit::Inches) => ("mm", "in", Conversion::MillimetersToInches),
        ("altitude", UserUnit::Meters) => ("m", "m", Conversion::Identity),
        ("altitude", UserUnit::Feet) => ("m", "ft", Conversion::MetersToFeet),
        (m, u) => return Err(anyhow!("unit {:?} does not apply to measurement '{}'", u, m)),
    };
    Ok(UnitCategory {
        metric_unit,
        user_unit,
        convert,
    })
}
