use std::collections::BTreeMap;
use axum::{
    extract::{Query, State},
    http::StatusCode,
    routing::{get, post},
    Json, Router,
};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use crate::rpc::{RpcRequest, RpcSurface};

#[derive(Clone)]
pub struct AppState {
    pub rpc: RpcSurface,
}

#[derive(Debug, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum RpcResponse {
    Result(Value),
    Error(String),
}

#[derive(Deserialize)]
pub struct NodeQuery {
    #[serde(default)]
    pub simple: bool,
}

pub fn router(state: AppState) -> Router {
    Router::new()
        .route("/v1/rpc", post(rpc_call))
        .route("/v1/nodes", get(get_nodes))
        .route("/v1/drivers", get(get_drivers))
        .with_state(state)
}

/// Driver calls may block on device I/O, so they run off the async workers
async fn rpc_call(
    State(state): State<AppState>,
    Json(request): Json<RpcRequest>,
) -> Result<Json<RpcResponse>, StatusCode> {
    let method = request.method.clone();
    let result = tokio::task::spawn_blocking(move || state.rpc.dispatch(&request))
        .await
        .map_err(|e| {
            tracing::error!("RPC {} did not complete: {}", method, e);
            StatusCode::INTERNAL_SERVER_ERROR
        })?;

    Ok(Json(match result {
        Ok(value) => RpcResponse::Result(value),
        Err(e) => {
            tracing::debug!("RPC {} failed: {}", method, e);
            RpcResponse::Error(e.to_string())
        }
    }))
}

async fn get_nodes(
    State(state): State<AppState>,
    Query(params): Query<NodeQuery>,
) -> Json<BTreeMap<String, Value>> {
    Json(state.rpc.list_nodes(params.simple))
}

async fn get_drivers(State(state): State<AppState>) -> Json<Value> {
    Json(state.rpc.list_drivers())
}
