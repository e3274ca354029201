//! 健康检查

use crate::server::AppState;
use axum::{extract::State, Json};

pub async fn health(State(state): State<AppState>) -> Json<serde_json::Value> {
    Json(serde_json::json!({
        "status": "ok",
        "version": env!("CARGO_PKG_VERSION"),
        "upstreams": state.config.upstreams.iter().map(|u| &u.name).collect::<Vec<_>>(),
        "breakers": state.registry.snapshots(),
    }))
}
