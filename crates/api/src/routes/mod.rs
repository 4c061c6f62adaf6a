//! API routes

pub mod plan;
pub mod seats;

use std::sync::Arc;

use axum::{
    middleware,
    routing::{get, post},
    Json, Router,
};
use plancap_billing::BillingService;
use serde_json::{json, Value};
use uuid::Uuid;

use crate::{
    auth::{require_auth, AuthUser},
    error::ApiResult,
    state::AppState,
};

/// Resolve the billing service and check that the caller owns the workspace
pub(crate) async fn require_owner<'a>(
    state: &'a AppState,
    auth_user: &AuthUser,
    workspace_id: Uuid,
) -> ApiResult<&'a Arc<BillingService>> {
    let billing = state.billing_service()?;
    billing
        .subscriptions
        .ensure_owner(workspace_id, auth_user.user_id)
        .await?;
    Ok(billing)
}

async fn health() -> Json<Value> {
    Json(json!({
        "status": "ok",
        "version": env!("CARGO_PKG_VERSION"),
    }))
}

pub fn create_router(state: AppState) -> Router {
    let workspace_routes = Router::new()
        .route("/seats", get(seats::get_seat_summary))
        .route("/seats/check", get(seats::check_seat))
        .route("/seats/sync", post(seats::sync_seats))
        .route("/users", post(seats::add_user))
        .route("/users/{user_id}/activate", post(seats::activate_user))
        .route("/users/{user_id}/deactivate", post(seats::deactivate_user))
        .route("/plan", post(plan::change_plan))
        .route("/plan/preview", post(plan::preview_plan_change));

    let protected = Router::new()
        .nest("/api/v1/workspaces/{workspace_id}", workspace_routes)
        .route_layer(middleware::from_fn_with_state(
            state.auth_state(),
            require_auth,
        ));

    Router::new()
        .route("/health", get(health))
        .merge(protected)
        .with_state(state)
}
