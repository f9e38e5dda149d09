//! End-to-end: the gateway in-process against a fake storage backend, both on
//! ephemeral ports, driven over HTTP the way chart clients drive it.

use std::collections::HashMap;
use std::sync::{Arc, Mutex};
use std::time::Duration;

use anyhow::Result;
use axum::{
    extract::{Path, State},
    http::StatusCode,
    routing::get,
    Json, Router,
};
use reqwest::Client;
use serde_json::{json, Value};
use tokio::net::TcpListener;
use tokio_util::sync::CancellationToken;

use derived_metrics::backend::Endpoints;
use derived_metrics::cache::{CacheConfig, HttpTransport, RequestCache};
use derived_metrics::formula::StationConstants;
use derived_metrics::routes::{self, AppState};
use derived_metrics::units::UnitRegistry;
use derived_metrics::DerivedSeriesBuilder;

const WINDOW: &str = "startDate=2024-01-01T00:00:00.000Z&endDate=2024-01-02T00:00:00.000Z";

// ---

/// Catalog storage of the fake backend, keyed by `composite-probes` etc.
type Catalogs = Arc<Mutex<HashMap<String, Value>>>;

async fn raw_series(Path((_station, key)): Path<(String, String)>) -> (StatusCode, Json<Value>) {
    // ---
    let data = match key.as_str() {
        "temperature:outTemp" => json!([
            {"d": "2024-01-01T00:00:00Z", "v": 283.0},
            {"d": "2024-01-01T01:00:00Z", "v": 293.15}
        ]),
        "humidity:outHumidity" => json!([{"d": "2024-01-01T00:00:00Z", "v": null}]),
        _ => {
            return (
                StatusCode::NOT_FOUND,
                Json(json!({"success": false, "error": "unknown sensor"})),
            )
        }
    };
    (
        StatusCode::OK,
        Json(json!({"success": true, "data": data, "metadata": {"sensor": key}})),
    )
}

async fn get_catalog(Path(name): Path<String>, State(catalogs): State<Catalogs>) -> Json<Value> {
    let settings = catalogs.lock().unwrap().get(&name).cloned();
    Json(json!({"success": true, "settings": settings.unwrap_or_else(|| json!({}))}))
}

async fn put_catalog(
    Path(name): Path<String>,
    State(catalogs): State<Catalogs>,
    Json(body): Json<Value>,
) -> Json<Value> {
    catalogs
        .lock()
        .unwrap()
        .insert(name, body["settings"].clone());
    Json(json!({"success": true}))
}

async fn serve(app: Router) -> Result<String> {
    // ---
    let listener = TcpListener::bind("127.0.0.1:0").await?;
    let addr = listener.local_addr()?;
    tokio::spawn(async move {
        axum::serve(listener, app).await.ok();
    });
    Ok(format!("http://{}", addr))
}

/// Start the fake backend and a gateway pointed at it. Returns the gateway
/// base URL.
async fn start() -> Result<String> {
    // ---
    let catalogs: Catalogs = Arc::default();
    let backend = Router::new()
        .route("/query/{station}/Raw/{key}", get(raw_series))
        .route("/api/{name}", get(get_catalog).put(put_catalog))
        .with_state(catalogs);
    let backend_url = serve(backend).await?;

    let transport = HttpTransport::new(Duration::from_secs(5))?;
    let cache = RequestCache::new(Arc::new(transport), CacheConfig::default());
    let builder = DerivedSeriesBuilder::new(
        cache,
        Endpoints::new(backend_url, "st1"),
        UnitRegistry::metric(),
        StationConstants::default(),
    );

    serve(routes::router(AppState {
        builder,
        shutdown: CancellationToken::new(),
    }))
    .await
}

async fn put_definition(client: &Client, base: &str, key: &str, formula: &str) -> Result<StatusCode> {
    // ---
    let body = json!({
        "label": key,
        "formulaSource": formula,
        "measurementCategory": "temperature"
    });
    let response = client
        .put(format!("{}/probes/composite/{}", base, key))
        .json(&body)
        .send()
        .await?;
    Ok(response.status())
}

#[tokio::test]
async fn health_reports_ok() -> Result<()> {
    // ---
    let base = start().await?;
    let body: Value = Client::new()
        .get(format!("{}/health", base))
        .send()
        .await?
        .json()
        .await?;
    assert_eq!(body["status"], "ok");
    Ok(())
}

#[tokio::test]
async fn formula_check_reports_dependencies_or_parse_error() -> Result<()> {
    // ---
    let base = start().await?;
    let client = Client::new();
    let url = format!("{}/formula/check", base);

    let ok: Value = client
        .post(&url)
        .json(&json!({"formulaSource": "d => d['temperature:outTemp'] + d['humidity:outHumidity']"}))
        .send()
        .await?
        .json()
        .await?;
    assert_eq!(ok["dependencyKeys"], json!(["temperature:outTemp", "humidity:outHumidity"]));
    assert_eq!(ok["fieldMapping"]["d"], "timestamp");

    let bad = client
        .post(&url)
        .json(&json!({"formulaSource": "d => require('fs')"}))
        .send()
        .await?;
    assert_eq!(bad.status(), StatusCode::UNPROCESSABLE_ENTITY);
    let body: Value = bad.json().await?;
    assert_eq!(body["success"], false);
    assert_eq!(body["kind"], "formula_error");
    Ok(())
}

#[tokio::test]
async fn define_build_and_remove_a_derived_sensor() -> Result<()> {
    // ---
    let base = start().await?;
    let client = Client::new();
    let key = "composite:kelvin";

    let status = put_definition(&client, &base, key, "val = d => d['temperature:outTemp'] - 273.15").await?;
    assert_eq!(status, StatusCode::CREATED);

    let catalog: Value = client
        .get(format!("{}/probes/composite", base))
        .send()
        .await?
        .json()
        .await?;
    assert_eq!(
        catalog["settings"][key]["dependencyKeys"],
        json!(["temperature:outTemp"])
    );

    let series: Value = client
        .get(format!("{}/derived/{}?{}", base, key, WINDOW))
        .send()
        .await?
        .json()
        .await?;
    assert_eq!(series["success"], true);
    assert_eq!(series["metadata"]["sensor"], key);
    assert_eq!(series["metadata"]["unit"], "°C");
    let values: Vec<f64> = series["data"]
        .as_array()
        .unwrap()
        .iter()
        .map(|p| p["v"].as_f64().unwrap())
        .collect();
    assert_eq!(values.len(), 2);
    assert!((values[0] - 9.85).abs() < 1e-9);
    assert!((values[1] - 20.0).abs() < 1e-9);

    let removed = client
        .delete(format!("{}/probes/composite/{}", base, key))
        .send()
        .await?;
    assert_eq!(removed.status(), StatusCode::OK);

    let gone = client
        .get(format!("{}/derived/{}?{}", base, key, WINDOW))
        .send()
        .await?;
    assert_eq!(gone.status(), StatusCode::NOT_FOUND);
    let body: Value = gone.json().await?;
    assert_eq!(body["kind"], "not_found");
    Ok(())
}

#[tokio::test]
async fn failures_are_distinguishable() -> Result<()> {
    // ---
    let base = start().await?;
    let client = Client::new();

    put_definition(&client, &base, "composite:broken", "d => d['wind:nothing'] * 2").await?;
    let failed = client
        .get(format!("{}/derived/composite:broken?{}", base, WINDOW))
        .send()
        .await?;
    assert_eq!(failed.status(), StatusCode::BAD_GATEWAY);
    let body: Value = failed.json().await?;
    assert_eq!(body["kind"], "fetch_failed");

    put_definition(&client, &base, "composite:dry", "d => d['humidity:outHumidity'] / 100").await?;
    let empty = client
        .get(format!("{}/derived/composite:dry?{}", base, WINDOW))
        .send()
        .await?;
    assert_eq!(empty.status(), StatusCode::NOT_FOUND);
    let body: Value = empty.json().await?;
    assert_eq!(body["kind"], "no_data");

    let status = put_definition(&client, &base, "composite:bad", "d => d[").await?;
    assert_eq!(status, StatusCode::UNPROCESSABLE_ENTITY);

    let unknown_kind = client.get(format!("{}/probes/other", base)).send().await?;
    assert_eq!(unknown_kind.status(), StatusCode::BAD_REQUEST);
    Ok(())
}
