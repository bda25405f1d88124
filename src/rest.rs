//! Administrative REST stubs
//!
//! Read-only cluster metadata in the shape management clients expect:
//! pool topology, node list, bucket list. Nothing here mutates the core.

use crate::bucket::{Bucket, Buckets};
use crate::Result;
use axum::extract::{Path as UrlPath, State};
use axum::http::StatusCode;
use axum::routing::get;
use axum::{Json, Router};
use once_cell::sync::Lazy;
use serde_json::{json, Value};
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Instant;
use tokio::net::TcpListener;
use tower_http::cors::CorsLayer;
use tower_http::services::ServeDir;
use tracing::info;

static START_TIME: Lazy<Instant> = Lazy::new(Instant::now);

const IMPLEMENTATION_VERSION: &str = concat!("1.0-bodega-", env!("CARGO_PKG_VERSION"));

#[derive(Clone)]
pub struct AppState {
    buckets: Arc<Buckets>,
    data_addr: String,
}

pub async fn serve(
    addr: String,
    static_dir: Option<PathBuf>,
    buckets: Arc<Buckets>,
    data_addr: String,
) -> Result<()> {
    Lazy::force(&START_TIME);
    let state = AppState { buckets, data_addr };

    let mut app = Router::new()
        .route("/pools", get(pools))
        .route("/pools/default", get(pools_default))
        .route("/pools/default/buckets", get(buckets_list))
        .route("/pools/default/buckets/:bucket", get(bucket_detail))
        .layer(CorsLayer::permissive())
        .with_state(state);
    if let Some(dir) = static_dir {
        app = app.nest_service("/static", ServeDir::new(dir));
    }

    let listener = TcpListener::bind(&addr).await?;
    info!(addr = %addr, "rest protocol listening");
    axum::serve(listener, app).await?;
    Ok(())
}

fn node_name() -> String {
    hostname::get()
        .ok()
        .and_then(|h| h.into_string().ok())
        .unwrap_or_else(|| "localhost".to_string())
}

fn node_json(state: &AppState) -> Value {
    json!({
        "hostname": node_name(),
        "clusterMembership": "active",
        "status": "healthy",
        "version": IMPLEMENTATION_VERSION,
        "ports": { "direct": state.data_addr },
        "uptime": START_TIME.elapsed().as_secs(),
    })
}

fn bucket_json(state: &AppState, name: &str, bucket: &Bucket) -> Value {
    let settings = bucket.settings();
    json!({
        "name": name,
        "bucketType": "membase",
        "uri": format!("/pools/default/buckets/{}", name),
        "numPartitions": settings.num_partitions,
        "quotaBytes": settings.quota_bytes,
        "memoryOnlyLevel": settings.memory_only.level(),
        "vBucketStates": bucket
            .vbuckets()
            .iter()
            .map(|vb| json!({ "id": vb.id(), "state": vb.state().to_string() }))
            .collect::<Vec<_>>(),
        "storeStats": bucket.stats(),
        "nodes": [node_json(state)],
    })
}

async fn pools(State(_state): State<AppState>) -> Json<Value> {
    Json(json!({
        "implementationVersion": IMPLEMENTATION_VERSION,
        "isAdmin": false,
        "pools": [{
            "name": "default",
            "uri": "/pools/default",
        }],
    }))
}

async fn pools_default(State(state): State<AppState>) -> Json<Value> {
    Json(json!({
        "name": "default",
        "nodes": [node_json(&state)],
        "buckets": { "uri": "/pools/default/buckets" },
    }))
}

async fn buckets_list(State(state): State<AppState>) -> Json<Value> {
    let list: Vec<Value> = state
        .buckets
        .names()
        .into_iter()
        .filter_map(|name| {
            state
                .buckets
                .get(&name)
                .map(|b| bucket_json(&state, &name, &b))
        })
        .collect();
    Json(Value::Array(list))
}

async fn bucket_detail(
    State(state): State<AppState>,
    UrlPath(name): UrlPath<String>,
) -> std::result::Result<Json<Value>, StatusCode> {
    match state.buckets.get(&name) {
        Some(bucket) => Ok(Json(bucket_json(&state, &name, &bucket))),
        None => Err(StatusCode::NOT_FOUND),
    }
}
