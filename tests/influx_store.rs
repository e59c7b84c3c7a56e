use std::collections::HashMap;
use std::net::SocketAddr;
use std::sync::Arc;

use axum::extract::{Query, State};
use axum::http::{HeaderMap, StatusCode};
use axum::response::IntoResponse;
use axum::routing::{get, post};
use axum::{Json, Router};
use chrono::DateTime;
use parking_lot::Mutex;
use serde_json::json;
use tokio::net::TcpListener;

use pingwatch::config::InfluxConfig;
use pingwatch::probe::Measurement;
use pingwatch::store::{InfluxStore, Point, Store};

#[derive(Debug, Clone)]
struct Write {
    params: HashMap<String, String>,
    body: String,
}

/// In-memory stand-in for the InfluxDB 1.x HTTP API.
#[derive(Default)]
struct FakeInflux {
    databases: Vec<String>,
    statements: Vec<(String, String)>,
    writes: Vec<Write>,
    auth_headers: Vec<Option<String>>,
    reject_writes: bool,
    reject_create: bool,
}

type Shared = Arc<Mutex<FakeInflux>>;

async fn query_handler(
    State(state): State<Shared>,
    method: axum::http::Method,
    headers: HeaderMap,
    Query(params): Query<HashMap<String, String>>,
) -> impl IntoResponse {
    let mut fake = state.lock();
    fake.auth_headers.push(
        headers
            .get("authorization")
            .and_then(|v| v.to_str().ok())
            .map(str::to_string),
    );

    let q = params.get("q").cloned().unwrap_or_default();
    fake.statements.push((method.to_string(), q.clone()));

    if q == "SHOW DATABASES" {
        let values: Vec<_> = fake.databases.iter().map(|db| json!([db])).collect();
        return Json(json!({
            "results": [{
                "statement_id": 0,
                "series": [{"name": "databases", "columns": ["name"], "values": values}]
            }]
        }));
    }

    if let Some(name) = q.strip_prefix("CREATE DATABASE ") {
        if fake.reject_create {
            return Json(json!({
                "results": [{"statement_id": 0, "error": "unable to create database"}]
            }));
        }
        let name = name.trim_matches('"').to_string();
        fake.databases.push(name);
    }

    Json(json!({"results": [{"statement_id": 0}]}))
}

async fn write_handler(
    State(state): State<Shared>,
    Query(params): Query<HashMap<String, String>>,
    body: String,
) -> impl IntoResponse {
    let mut fake = state.lock();
    if fake.reject_writes {
        return (StatusCode::BAD_REQUEST, "{\"error\":\"unable to parse\"}");
    }
    fake.writes.push(Write { params, body });
    (StatusCode::NO_CONTENT, "")
}

async fn serve(fake: FakeInflux) -> (SocketAddr, Shared) {
    let state = Arc::new(Mutex::new(fake));
    let app = Router::new()
        .route("/query", get(query_handler).post(query_handler))
        .route("/write", post(write_handler))
        .with_state(Arc::clone(&state));

    let listener = TcpListener::bind("127.0.0.1:0").await.expect("bind");
    let addr = listener.local_addr().expect("local addr");
    tokio::spawn(async move {
        axum::serve(listener, app).await.expect("serve");
    });

    (addr, state)
}

fn config(addr: SocketAddr, dbname: &str) -> InfluxConfig {
    InfluxConfig {
        host: addr.ip().to_string(),
        port: addr.port(),
        dbname: dbname.to_string(),
        ..Default::default()
    }
}

fn point(host: &str, latency_ms: Option<f64>) -> Point {
    Point::from_measurement(&Measurement {
        host: host.to_string(),
        latency_ms,
        timestamp: DateTime::from_timestamp(1_700_000_000, 0),
    })
}

#[tokio::test]
async fn test_ensure_ready_creates_missing_database_once() {
    let (addr, state) = serve(FakeInflux {
        databases: vec!["_internal".to_string()],
        ..Default::default()
    })
    .await;

    let mut store = InfluxStore::new(config(addr, "pings")).expect("store");
    store.ensure_ready().await.expect("first ensure_ready");
    store.ensure_ready().await.expect("second ensure_ready");

    assert_eq!(store.active_database(), Some("pings"));

    let fake = state.lock();
    let creates: Vec<_> = fake
        .statements
        .iter()
        .filter(|(_, q)| q.starts_with("CREATE DATABASE"))
        .collect();
    assert_eq!(creates.len(), 1);
    assert_eq!(creates[0].0, "POST");
    assert_eq!(creates[0].1, "CREATE DATABASE \"pings\"");
    assert_eq!(fake.databases, vec!["_internal", "pings"]);
}

#[tokio::test]
async fn test_ensure_ready_keeps_existing_database() {
    let (addr, state) = serve(FakeInflux {
        databases: vec!["pings".to_string()],
        ..Default::default()
    })
    .await;

    let mut store = InfluxStore::new(config(addr, "pings")).expect("store");
    store.ensure_ready().await.expect("ensure_ready");

    let fake = state.lock();
    assert_eq!(
        fake.statements,
        vec![("GET".to_string(), "SHOW DATABASES".to_string())]
    );
}

#[tokio::test]
async fn test_ensure_ready_reports_statement_error() {
    let (addr, _) = serve(FakeInflux {
        reject_create: true,
        ..Default::default()
    })
    .await;

    let mut store = InfluxStore::new(config(addr, "pings")).expect("store");
    let err = store.ensure_ready().await.unwrap_err();

    assert!(format!("{err:#}").contains("unable to create database"));
    assert!(store.active_database().is_none());
}

#[tokio::test]
async fn test_write_posts_line_protocol() {
    let (addr, state) = serve(FakeInflux::default()).await;

    let mut store = InfluxStore::new(config(addr, "pings")).expect("store");
    store.ensure_ready().await.expect("ensure_ready");
    store.write(&point("host1", Some(0.45))).await.expect("write reply");
    store.write(&point("host2", None)).await.expect("write timeout");

    let fake = state.lock();
    assert_eq!(fake.writes.len(), 2);

    let first = &fake.writes[0];
    assert_eq!(first.params.get("db").map(String::as_str), Some("pings"));
    assert_eq!(first.params.get("precision").map(String::as_str), Some("ns"));
    assert_eq!(first.body, "latency,url=host1 ping=0.45 1700000000000000000");

    assert_eq!(
        fake.writes[1].body,
        "latency,url=host2 ping_absent=true 1700000000000000000"
    );
}

#[tokio::test]
async fn test_rejected_write_is_error() {
    let (addr, _) = serve(FakeInflux {
        reject_writes: true,
        ..Default::default()
    })
    .await;

    let mut store = InfluxStore::new(config(addr, "pings")).expect("store");
    store.ensure_ready().await.expect("ensure_ready");

    let err = store.write(&point("host1", Some(1.0))).await.unwrap_err();
    assert!(err.to_string().contains("400"));
    assert!(err.to_string().contains("unable to parse"));
}

#[tokio::test]
async fn test_credentials_sent_as_basic_auth() {
    let (addr, state) = serve(FakeInflux::default()).await;

    let mut store = InfluxStore::new(InfluxConfig {
        dbuser: "admin".to_string(),
        dbpass: "secret".to_string(),
        ..config(addr, "pings")
    })
    .expect("store");
    store.ensure_ready().await.expect("ensure_ready");

    let fake = state.lock();
    assert!(!fake.auth_headers.is_empty());
    // base64("admin:secret")
    assert!(fake
        .auth_headers
        .iter()
        .all(|h| h.as_deref() == Some("Basic YWRtaW46c2VjcmV0")));
}

#[tokio::test]
async fn test_anonymous_requests_carry_no_auth() {
    let (addr, state) = serve(FakeInflux::default()).await;

    let mut store = InfluxStore::new(config(addr, "pings")).expect("store");
    store.ensure_ready().await.expect("ensure_ready");

    assert!(state.lock().auth_headers.iter().all(Option::is_none));
}

#[tokio::test]
async fn test_write_after_close_fails() {
    let (addr, _) = serve(FakeInflux::default()).await;

    let mut store = InfluxStore::new(config(addr, "pings")).expect("store");
    store.ensure_ready().await.expect("ensure_ready");
    store.close().await.expect("close");

    assert!(store.write(&point("host1", Some(1.0))).await.is_err());
}

#[tokio::test]
async fn test_unreachable_server_fails_setup() {
    let listener = TcpListener::bind("127.0.0.1:0").await.expect("bind");
    let addr = listener.local_addr().expect("local addr");
    drop(listener);

    let mut store = InfluxStore::new(config(addr, "pings")).expect("store");
    let err = store.ensure_ready().await.unwrap_err();
    assert!(format!("{err:#}").contains("listing databases"));
}
