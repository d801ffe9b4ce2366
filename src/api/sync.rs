// SPDX-License-Identifier: AGPL-3.0-or-later
//
// Copyright (C) 2026 Relational Network

use axum::{extract::State, Json};
use tracing::info;

use crate::error::ApiError;
use crate::models::{SyncRequest, SyncResponse};
use crate::state::AppState;
use crate::sync::SyncTrigger;

/// Run a reconciliation sweep, or refresh one user's profile, now.
///
/// Blocks until the synchronizer has processed the trigger.
#[utoipa::path(
    post,
    path = "/v1/sync",
    tag = "Sync",
    request_body(content = SyncRequest, description = "Omit for a full sweep"),
    responses(
        (status = 200, description = "Trigger processed", body = SyncResponse),
        (status = 404, description = "Unknown user"),
        (status = 502, description = "Banking API failure"),
        (status = 503, description = "Synchronizer not running")
    )
)]
pub async fn trigger_sync(
    State(state): State<AppState>,
    body: Option<Json<SyncRequest>>,
) -> Result<Json<SyncResponse>, ApiError> {
    let request = body.map(|Json(r)| r).unwrap_or_default();
    let (trigger, name) = match request.chat_id {
        Some(chat_id) => (SyncTrigger::RefreshProfile { chat_id }, "refresh_profile"),
        None => (SyncTrigger::SyncAll, "sync_all"),
    };

    info!(trigger = name, "Sync requested over API");
    let report = state.sync.trigger(trigger).await?;

    Ok(Json(SyncResponse {
        trigger: name.to_string(),
        report,
    }))
}
