//! Data models shared by the cache, the builder and the HTTP layer.
//!
//! Wire shapes mirror the storage backend's query responses so a derived
//! series can be served to clients in exactly the shape they already parse
//! for raw series.

use std::collections::HashMap;

use chrono::{DateTime, SecondsFormat, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value;

use crate::FetchError;

// ---

/// One `{d, v}` sample as returned by `GET /query/{station}/Raw/{key}`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RawPoint {
    // ---
    pub d: DateTime<Utc>,
    pub v: Option<f64>,
}

/// Series metadata attached to every query response.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct SeriesMetadata {
    // ---
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub unit: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub user_unit: Option<String>,
    /// Conversion source shipped by the backend. Kept for pass-through only,
    /// conversions come from the unit registry.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub to_user_unit: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub measurement: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub sensor: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub first: Option<DateTime<Utc>>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub last: Option<DateTime<Utc>>,
}

/// Envelope of a single-sensor query response.
#[derive(Debug, Deserialize)]
struct RawQueryResponse {
    // ---
    #[serde(default)]
    data: Vec<RawPoint>,
    #[serde(default)]
    metadata: Option<SeriesMetadata>,
}

/// Envelope of a forecast response: one field per
/// sensor key per record, plus `d`.
#[derive(Debug, Deserialize)]
struct RecordsResponse {
    // ---
    #[serde(default)]
    data: Vec<HashMap<String, Value>>,
}

/// Ordered `{timestamp, value}` samples for one raw sensor key.
#[derive(Debug, Clone, PartialEq)]
pub struct RawSensorSeries {
    // ---
    pub key: String,
    pub points: Vec<Sample>,
    pub metadata: SeriesMetadata,
}

/// A non-null sample.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct Sample {
    // ---
    pub d: DateTime<Utc>,
    pub v: f64,
}

impl RawSensorSeries {
    // ---
    /// Decode a `Raw` query payload. Null samples are skipped and the result
    /// is sorted by timestamp.
    pub fn from_payload(key: &str, payload: &Value) -> Result<Self, FetchError> {
        // ---
        let response = RawQueryResponse::deserialize(payload)
            .map_err(|e| FetchError::Decode(format!("raw series '{key}': {e}")))?;

        let mut points: Vec<Sample> = response
            .data
            .into_iter()
            .filter_map(|p| p.v.map(|v| Sample { d: p.d, v }))
            .collect();
        points.sort_by_key(|s| s.d);

        Ok(Self {
            key: key.to_string(),
            points,
            metadata: response.metadata.unwrap_or_default(),
        })
    }

    pub fn is_empty(&self) -> bool {
        self.points.is_empty()
    }

    /// Value of the sample closest to `at`, if one lies within `tolerance`.
    pub fn nearest(&self, at: DateTime<Utc>, tolerance: chrono::Duration) -> Option<f64> {
        // ---
        let idx = self.points.partition_point(|s| s.d < at);
        let candidates = [idx.checked_sub(1), Some(idx)];

        candidates
            .into_iter()
            .flatten()
            .filter_map(|i| self.points.get(i))
            .map(|s| (s, (s.d - at).abs()))
            .filter(|(_, gap)| *gap <= tolerance)
            .min_by_key(|(_, gap)| *gap)
            .map(|(s, _)| s.v)
    }
}

/// A timestamped bag of sensor values, the input of a point-wise formula.
#[derive(Debug, Clone, PartialEq)]
pub struct Record {
    // ---
    pub timestamp: DateTime<Utc>,
    pub fields: HashMap<String, f64>,
}

impl Record {
    // ---
    pub fn new(timestamp: DateTime<Utc>) -> Self {
        Self {
            timestamp,
            fields: HashMap::new(),
        }
    }

    pub fn with(mut self, key: impl Into<String>, value: f64) -> Self {
        self.fields.insert(key.into(), value);
        self
    }

    pub fn get(&self, key: &str) -> Option<f64> {
        self.fields.get(key).copied()
    }
}

/// Decode a forecast payload into records, sorted by timestamp.
/// Non-numeric and null fields are left out of each record.
pub fn records_from_payload(payload: &Value) -> Result<Vec<Record>, FetchError> {
    // ---
    let response = RecordsResponse::deserialize(payload)
        .map_err(|e| FetchError::Decode(format!("records: {e}")))?;

    let mut records = Vec::with_capacity(response.data.len());
    for row in response.data {
        let d = row
            .get("d")
            .and_then(Value::as_str)
            .ok_or_else(|| FetchError::Decode("record without 'd' timestamp".into()))?;
        let timestamp = DateTime::parse_from_rfc3339(d)
            .map_err(|e| FetchError::Decode(format!("bad timestamp '{d}': {e}")))?
            .with_timezone(&Utc);

        let fields = row
            .iter()
            .filter(|(k, _)| k.as_str() != "d")
            .filter_map(|(k, v)| v.as_f64().map(|v| (k.clone(), v)))
            .collect();
        records.push(Record { timestamp, fields });
    }
    records.sort_by_key(|r| r.timestamp);
    Ok(records)
}

/// Half-open request window `[start, end]` with an optional point budget.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct TimeWindow {
    // ---
    #[serde(rename = "startDate")]
    pub start: DateTime<Utc>,
    #[serde(rename = "endDate")]
    pub end: DateTime<Utc>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub step_count: Option<u32>,
}

impl TimeWindow {
    // ---
    pub fn new(start: DateTime<Utc>, end: DateTime<Utc>) -> Self {
        Self {
            start,
            end,
            step_count: None,
        }
    }

    /// Query string understood by the backend. Dates are ISO-8601 UTC with
    /// millisecond precision.
    pub fn query_string(&self) -> String {
        // ---
        let mut qs = format!(
            "startDate={}&endDate={}",
            iso(self.start),
            iso(self.end)
        );
        if let Some(steps) = self.step_count {
            qs.push_str(&format!("&stepCount={steps}"));
        }
        qs
    }
}

fn iso(t: DateTime<Utc>) -> String {
    t.to_rfc3339_opts(SecondsFormat::Millis, true)
}

/// One derived output sample, already in user units.
#[derive(Debug, Clone, Copy, PartialEq, Serialize)]
pub struct DerivedPoint {
    // ---
    pub d: DateTime<Utc>,
    pub v: f64,
}

/// A derived series plus the labelling a chart needs for its axes.
#[derive(Debug, Clone, PartialEq)]
pub struct DerivedSeries {
    // ---
    pub key: String,
    pub label: String,
    pub measurement: String,
    pub unit: String,
    pub user_unit: String,
    pub points: Vec<DerivedPoint>,
}

/// Response body mirroring the backend's raw query shape.
#[derive(Debug, Serialize)]
pub struct SeriesResponse {
    // ---
    pub success: bool,
    pub data: Vec<DerivedPoint>,
    pub metadata: SeriesMetadata,
}

impl DerivedSeries {
    // ---
    pub fn to_response(&self) -> SeriesResponse {
        // ---
        SeriesResponse {
            success: true,
            data: self.points.clone(),
            metadata: SeriesMetadata {
                unit: Some(self.unit.clone()),
                user_unit: Some(self.user_unit.clone()),
                to_user_unit: None,
                measurement: Some(self.measurement.clone()),
                sensor: Some(self.key.clone()),
                first: self.points.first().map(|p| p.d),
                last: self.points.last().map(|p| p.d),
            },
        }
    }
}
