//! Seat routes
//!
//! All routes act on one workspace and require the caller to own it.

use axum::{
    extract::{Extension, Path, State},
    http::StatusCode,
    Json,
};
use plancap_billing::{NewUser, SeatDecision, SeatSummary, SyncResult, User};
use uuid::Uuid;

use crate::{auth::AuthUser, error::ApiResult, routes::require_owner, state::AppState};

/// GET /api/v1/workspaces/{workspace_id}/seats
pub async fn get_seat_summary(
    State(state): State<AppState>,
    Extension(auth_user): Extension<AuthUser>,
    Path(workspace_id): Path<Uuid>,
) -> ApiResult<Json<SeatSummary>> {
    let billing = require_owner(&state, &auth_user, workspace_id).await?;
    Ok(Json(billing.admission.seat_summary(workspace_id).await?))
}

/// GET /api/v1/workspaces/{workspace_id}/seats/check
pub async fn check_seat(
    State(state): State<AppState>,
    Extension(auth_user): Extension<AuthUser>,
    Path(workspace_id): Path<Uuid>,
) -> ApiResult<Json<SeatDecision>> {
    let billing = require_owner(&state, &auth_user, workspace_id).await?;
    Ok(Json(billing.admission.can_add_seat(workspace_id).await?))
}

/// POST /api/v1/workspaces/{workspace_id}/seats/sync
pub async fn sync_seats(
    State(state): State<AppState>,
    Extension(auth_user): Extension<AuthUser>,
    Path(workspace_id): Path<Uuid>,
) -> ApiResult<Json<SyncResult>> {
    let billing = require_owner(&state, &auth_user, workspace_id).await?;
    let result = billing.reconciler.sync_workspace_seats(workspace_id).await?;

    tracing::info!(
        workspace_id = %workspace_id,
        requested_by = %auth_user.user_id,
        current_seats = result.current_seats,
        stripe_updated = result.stripe_updated,
        "Manual seat sync"
    );
    Ok(Json(result))
}

/// POST /api/v1/workspaces/{workspace_id}/users
pub async fn add_user(
    State(state): State<AppState>,
    Extension(auth_user): Extension<AuthUser>,
    Path(workspace_id): Path<Uuid>,
    Json(new_user): Json<NewUser>,
) -> ApiResult<(StatusCode, Json<User>)> {
    let billing = require_owner(&state, &auth_user, workspace_id).await?;
    let user = billing
        .guard
        .add_user_with_seat_check(workspace_id, new_user)
        .await?;
    Ok((StatusCode::CREATED, Json(user)))
}

/// POST /api/v1/workspaces/{workspace_id}/users/{user_id}/activate
pub async fn activate_user(
    State(state): State<AppState>,
    Extension(auth_user): Extension<AuthUser>,
    Path((workspace_id, user_id)): Path<(Uuid, Uuid)>,
) -> ApiResult<Json<User>> {
    let billing = require_owner(&state, &auth_user, workspace_id).await?;
    let user = billing
        .guard
        .activate_user_with_seat_check(workspace_id, user_id)
        .await?;
    Ok(Json(user))
}

/// POST /api/v1/workspaces/{workspace_id}/users/{user_id}/deactivate
pub async fn deactivate_user(
    State(state): State<AppState>,
    Extension(auth_user): Extension<AuthUser>,
    Path((workspace_id, user_id)): Path<(Uuid, Uuid)>,
) -> ApiResult<Json<User>> {
    let billing = require_owner(&state, &auth_user, workspace_id).await?;
    let user = billing.guard.deactivate_user(workspace_id, user_id).await?;
    Ok(Json(user))
}
