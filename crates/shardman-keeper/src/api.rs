//! Worker admin surface consumed by the coordinator's move executor.

use std::sync::Arc;

use axum::extract::State;
use axum::http::StatusCode;
use axum::routing::post;
use axum::{Json, Router};
use serde_json::{json, Value};
use tracing::{info, warn};

use shardman_core::shard::ShardMessage;

use crate::keeper::ShardKeeper;

/// Router serving `POST /sm/admin/add-shard` and
/// `POST /sm/admin/drop-shard`. Both are idempotent; any non-200 makes
/// the executor retry.
pub fn admin_router(keeper: Arc<ShardKeeper>) -> Router {
    Router::new()
        .route("/sm/admin/add-shard", post(add_shard))
        .route("/sm/admin/drop-shard", post(drop_shard))
        .with_state(keeper)
}

async fn add_shard(
    State(keeper): State<Arc<ShardKeeper>>,
    Json(message): Json<ShardMessage>,
) -> (StatusCode, Json<Value>) {
    info!(shard = %message.id, "add-shard request");
    match keeper.add(&message.id, message.spec).await {
        Ok(()) => (StatusCode::OK, Json(json!({}))),
        Err(e) => {
            warn!(shard = %message.id, error = %e, "add-shard rejected");
            (
                StatusCode::INTERNAL_SERVER_ERROR,
                Json(json!({ "error": e.to_string() })),
            )
        }
    }
}

async fn drop_shard(
    State(keeper): State<Arc<ShardKeeper>>,
    Json(message): Json<ShardMessage>,
) -> (StatusCode, Json<Value>) {
    info!(shard = %message.id, "drop-shard request");
    match keeper.drop_shard(&message.id).await {
        Ok(()) => (StatusCode::OK, Json(json!({}))),
        Err(e) => {
            warn!(shard = %message.id, error = %e, "drop-shard rejected");
            (
                StatusCode::INTERNAL_SERVER_ERROR,
                Json(json!({ "error": e.to_string() })),
            )
        }
    }
}
