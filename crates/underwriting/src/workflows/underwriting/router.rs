use std::sync::Arc;

use axum::{
    extract::{Path, State},
    http::StatusCode,
    response::{IntoResponse, Response},
    routing::{get, post},
    Router,
};
use serde_json::json;

use super::domain::{LoanApplication, ProspectId};
use super::pipeline::{PipelineError, PipelineOutcome};
use super::providers::CancelSignal;
use super::repository::AuditStore;
use super::service::{CancellationRequest, UnderwritingService, UnderwritingServiceError};

/// Router builder exposing evaluation, trail lookup and cancellation.
pub fn underwriting_router<A>(service: Arc<UnderwritingService<A>>) -> Router
where
    A: AuditStore + 'static,
{
    Router::new()
        .route(
            "/api/v1/underwriting/applications",
            post(evaluate_handler::<A>),
        )
        .route(
            "/api/v1/underwriting/applications/:prospect_id/trail",
            get(trail_handler::<A>),
        )
        .route(
            "/api/v1/underwriting/applications/:prospect_id/cancel",
            post(cancel_handler::<A>),
        )
        .with_state(service)
}

pub(crate) async fn evaluate_handler<A>(
    State(service): State<Arc<UnderwritingService<A>>>,
    axum::Json(application): axum::Json<LoanApplication>,
) -> Response
where
    A: AuditStore + 'static,
{
    match service.evaluate(&application, CancelSignal::new()).await {
        Ok(outcome) => (StatusCode::OK, axum::Json(outcome_view(&outcome))).into_response(),
        Err(UnderwritingServiceError::Pipeline(abort)) => {
            let status = match &abort.error {
                PipelineError::UpstreamTimeout { .. } => StatusCode::GATEWAY_TIMEOUT,
                PipelineError::UpstreamError { .. } => StatusCode::BAD_GATEWAY,
                PipelineError::Persistence { .. } => StatusCode::INTERNAL_SERVER_ERROR,
                PipelineError::Cancelled { .. } => StatusCode::SERVICE_UNAVAILABLE,
            };
            let payload = json!({
                "error": abort.error.to_string(),
                "kind": abort.error.kind(),
                "stage": abort.error.stage(),
                "retryable": abort.error.is_retryable(),
                "trail": abort.trail,
            });
            (status, axum::Json(payload)).into_response()
        }
        Err(UnderwritingServiceError::InFlight(prospect_id)) => {
            let payload = json!({
                "error": "prospect is already being evaluated",
                "prospect_id": prospect_id,
            });
            (StatusCode::CONFLICT, axum::Json(payload)).into_response()
        }
        Err(other) => {
            let payload = json!({
                "error": other.to_string(),
            });
            (StatusCode::INTERNAL_SERVER_ERROR, axum::Json(payload)).into_response()
        }
    }
}

pub(crate) async fn trail_handler<A>(
    State(service): State<Arc<UnderwritingService<A>>>,
    Path(prospect_id): Path<String>,
) -> Response
where
    A: AuditStore + 'static,
{
    let id = ProspectId(prospect_id);
    match service.trail(&id).await {
        Ok(trail) => {
            let payload = json!({
                "prospect_id": id,
                "trail": trail,
            });
            (StatusCode::OK, axum::Json(payload)).into_response()
        }
        Err(UnderwritingServiceError::UnknownProspect(_)) => {
            let payload = json!({
                "error": "no decision trail recorded",
                "prospect_id": id,
            });
            (StatusCode::NOT_FOUND, axum::Json(payload)).into_response()
        }
        Err(other) => {
            let payload = json!({
                "error": other.to_string(),
            });
            (StatusCode::INTERNAL_SERVER_ERROR, axum::Json(payload)).into_response()
        }
    }
}

pub(crate) async fn cancel_handler<A>(
    State(service): State<Arc<UnderwritingService<A>>>,
    Path(prospect_id): Path<String>,
    axum::Json(request): axum::Json<CancellationRequest>,
) -> Response
where
    A: AuditStore + 'static,
{
    let id = ProspectId(prospect_id);
    match service.record_cancellation(&id, &request).await {
        Ok(receipt) => (StatusCode::ACCEPTED, axum::Json(receipt)).into_response(),
        Err(other) => {
            let payload = json!({
                "error": other.to_string(),
            });
            (StatusCode::INTERNAL_SERVER_ERROR, axum::Json(payload)).into_response()
        }
    }
}

fn outcome_view(outcome: &PipelineOutcome) -> serde_json::Value {
    json!({
        "prospect_id": outcome.prospect_id,
        "disposition": outcome.disposition,
        "customer_status": outcome.customer_status,
        "customer_type": outcome.customer_type,
        "dsr_percent": outcome.dsr_percent,
        "trail": outcome.trail,
    })
}
