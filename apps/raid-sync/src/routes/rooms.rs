use axum::extract::{Path, State};
use axum::routing::get;
use axum::{Json, Router};
use serde::Serialize;
use serde_json::Value;

use crate::error::ApiError;
use crate::sync::coordinator::PresenceSnapshot;
use crate::sync::StampedView;
use crate::AppState;

pub fn router() -> Router<AppState> {
    Router::new()
        .route("/rooms", get(list_rooms))
        .route("/rooms/{room_id}", get(get_room))
        .route("/rooms/{room_id}/presence", get(get_presence))
}

/// A cached view as served over HTTP. `sequence` matches the broadcast
/// sequence the same view carried, so clients can reconcile the two.
#[derive(Debug, Serialize)]
pub struct ViewResponse {
    pub sequence: i64,
    pub data: Value,
}

impl From<StampedView> for ViewResponse {
    fn from(view: StampedView) -> Self {
        Self {
            sequence: view.sequence,
            data: Value::clone(&view.payload),
        }
    }
}

async fn list_rooms(State(state): State<AppState>) -> Result<Json<ViewResponse>, ApiError> {
    let view = state.sync.listing_view().await?;
    Ok(Json(view.into()))
}

async fn get_room(
    State(state): State<AppState>,
    Path(room_id): Path<String>,
) -> Result<Json<ViewResponse>, ApiError> {
    let view = state.sync.room_view(&room_id).await?;
    Ok(Json(view.into()))
}

async fn get_presence(
    State(state): State<AppState>,
    Path(room_id): Path<String>,
) -> Json<PresenceSnapshot> {
    Json(state.sync.presence(&room_id).await)
}
