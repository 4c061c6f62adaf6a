//! Plan change routes

use axum::{
    extract::{Extension, Path, State},
    Json,
};
use plancap_billing::{PlanChangePreview, TransitionResult};
use plancap_shared::{BillingPeriod, PlanTier};
use serde::Deserialize;
use uuid::Uuid;

use crate::{auth::AuthUser, error::ApiResult, state::AppState};

#[derive(Debug, Deserialize)]
pub struct ChangePlanRequest {
    pub plan: PlanTier,
    pub billing_period: BillingPeriod,
}

/// POST /api/v1/workspaces/{workspace_id}/plan
///
/// The owner check happens inside the transition engine, before anything else.
pub async fn change_plan(
    State(state): State<AppState>,
    Extension(auth_user): Extension<AuthUser>,
    Path(workspace_id): Path<Uuid>,
    Json(request): Json<ChangePlanRequest>,
) -> ApiResult<Json<TransitionResult>> {
    let billing = state.billing_service()?;
    let result = billing
        .subscriptions
        .change_plan(
            workspace_id,
            auth_user.user_id,
            request.plan,
            request.billing_period,
        )
        .await?;

    if let Some(error) = result
        .invoice
        .as_ref()
        .and_then(|invoice| invoice.payment_error.as_deref())
    {
        tracing::warn!(
            workspace_id = %workspace_id,
            plan = %result.plan,
            error = %error,
            "Plan changed but the proration invoice is unpaid"
        );
    }
    Ok(Json(result))
}

/// POST /api/v1/workspaces/{workspace_id}/plan/preview
pub async fn preview_plan_change(
    State(state): State<AppState>,
    Extension(auth_user): Extension<AuthUser>,
    Path(workspace_id): Path<Uuid>,
    Json(request): Json<ChangePlanRequest>,
) -> ApiResult<Json<PlanChangePreview>> {
    let billing = state.billing_service()?;
    let preview = billing
        .subscriptions
        .preview_plan_change(
            workspace_id,
            auth_user.user_id,
            request.plan,
            request.billing_period,
        )
        .await?;
    Ok(Json(preview))
}
