//! URL layout of the storage/query backend.
//!
//! Every URL built here doubles as a request-cache key, so two callers asking
//! for the same series over the same window share one cache entry.

use crate::catalog::CatalogKind;
use crate::models::TimeWindow;

// ---

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Endpoints {
    // ---
    base_url: String,
    station_id: String,
}

impl Endpoints {
    // ---
    pub fn new(base_url: impl Into<String>, station_id: impl Into<String>) -> Self {
        // ---
        let base_url = base_url.into().trim_end_matches('/').to_string();
        Self {
            base_url,
            station_id: station_id.into(),
        }
    }

    pub fn base_url(&self) -> &str {
        &self.base_url
    }

    pub fn station_id(&self) -> &str {
        &self.station_id
    }

    /// `GET /query/{station}/Raw/{key}?startDate&endDate[&stepCount]`
    pub fn raw_url(&self, sensor_key: &str, window: &TimeWindow) -> String {
        self.query_url("Raw", sensor_key, window)
    }

    /// Forecast records for the same keys, read by model-style derivations.
    /// The step count is left to the backend.
    pub fn forecast_url(&self, sensor_keys: &[String], window: &TimeWindow) -> String {
        let window = TimeWindow::new(window.start, window.end);
        self.query_url("Forecast", &sensor_keys.join(","), &window)
    }

    pub fn catalog_url(&self, kind: CatalogKind) -> String {
        format!("{}{}", self.base_url, kind.path())
    }

    fn query_url(&self, view: &str, keys: &str, window: &TimeWindow) -> String {
        format!(
            "{}/query/{}/{}/{}?{}",
            self.base_url,
            self.station_id,
            view,
            keys,
            window.query_string()
        )
    }
}

#[cfg(test)]
mod tests {
    // ---
    use super::*;
    use chrono::{TimeZone, Utc};

    fn window() -> TimeWindow {
        TimeWindow {
            start: Utc.with_ymd_and_hms(2024, 1, 1, 0, 0, 0).unwrap(),
            end: Utc.with_ymd_and_hms(2024, 1, 2, 0, 0, 0).unwrap(),
            step_count: Some(200),
        }
    }

    #[test]
    fn test_raw_url_shape() {
        // ---
        let endpoints = Endpoints::new("http://backend:3000/", "st1");
        assert_eq!(
            endpoints.raw_url("temperature:outTemp", &window()),
            "http://backend:3000/query/st1/Raw/temperature:outTemp\
             ?startDate=2024-01-01T00:00:00.000Z&endDate=2024-01-02T00:00:00.000Z&stepCount=200"
        );
    }

    #[test]
    fn test_forecast_url_joins_keys_without_step_count() {
        // ---
        let endpoints = Endpoints::new("http://backend:3000", "st1");
        let keys = vec!["temperature:outTemp".to_string(), "humidity:outHumidity".to_string()];

        let forecast = endpoints.forecast_url(&keys, &window());
        assert!(forecast.starts_with(
            "http://backend:3000/query/st1/Forecast/temperature:outTemp,humidity:outHumidity?"
        ));
        assert!(!forecast.contains("stepCount"));
    }

    #[test]
    fn test_catalog_urls() {
        // ---
        let endpoints = Endpoints::new("http://backend:3000", "st1");
        assert_eq!(
            endpoints.catalog_url(CatalogKind::Composite),
            "http://backend:3000/api/composite-probes"
        );
        assert_eq!(
            endpoints.catalog_url(CatalogKind::Integrator),
            "http://backend:3000/api/integrator-probes"
        );
    }
}
