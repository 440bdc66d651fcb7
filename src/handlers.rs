use axum::{
    async_trait,
    extract::{FromRequestParts, State},
    http::{request::Parts, HeaderMap, StatusCode},
    response::Json,
};
use serde::{Deserialize, Serialize};
use std::sync::Arc;
use tracing::{debug, error};

use crate::coordinator::Coordinator;
use crate::error::SignalError;
use crate::payload::IceCandidate;
use crate::session::{CallType, EndReason};
use crate::storage::{Store, Subscription};

#[derive(Clone)]
pub struct AppState {
    pub coordinator: Coordinator,
    pub store: Arc<dyn Store>,
    pub vapid_public_key: Option<String>,
}

/// Acting-user identity, supplied by the fronting auth layer as an
/// `X-User-Id` header. This core trusts it and does no authentication of
/// its own.
pub struct AuthedUser(pub i64);

#[async_trait]
impl<S> FromRequestParts<S> for AuthedUser
where
    S: Send + Sync,
{
    type Rejection = StatusCode;

    async fn from_request_parts(parts: &mut Parts, _state: &S) -> Result<Self, Self::Rejection> {
        parts
            .headers
            .get("x-user-id")
            .and_then(|value| value.to_str().ok())
            .and_then(|value| value.parse().ok())
            .map(AuthedUser)
            .ok_or(StatusCode::UNAUTHORIZED)
    }
}

fn status_for(err: &SignalError) -> StatusCode {
    match err {
        SignalError::Validation(_) | SignalError::InvalidSelfCall => StatusCode::BAD_REQUEST,
        SignalError::NotFound(_) => StatusCode::NOT_FOUND,
        SignalError::InvalidTransition { .. } => StatusCode::CONFLICT,
        SignalError::Expired(_) => StatusCode::GONE,
        SignalError::TooLarge { .. } => StatusCode::PAYLOAD_TOO_LARGE,
        SignalError::Storage(_) => StatusCode::INTERNAL_SERVER_ERROR,
    }
}

#[derive(Debug, Serialize)]
pub struct SimpleResponse {
    pub success: bool,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub message: Option<String>,
}

fn failure(err: SignalError) -> (StatusCode, Json<SimpleResponse>) {
    let status = status_for(&err);
    if status == StatusCode::INTERNAL_SERVER_ERROR {
        error!("request failed: {err}");
    }
    (
        status,
        Json(SimpleResponse {
            success: false,
            message: Some(err.to_string()),
        }),
    )
}

#[derive(Debug, Deserialize)]
pub struct SendOfferRequest {
    pub target_user_id: i64,
    pub sdp: serde_json::Value,
    #[serde(default)]
    pub call_type: Option<CallType>,
}

#[derive(Debug, Serialize)]
pub struct SendOfferResponse {
    pub success: bool,
    pub call_id: String,
}

/// POST /webrtc/send-offer
pub async fn send_offer(
    AuthedUser(caller_id): AuthedUser,
    State(state): State<AppState>,
    Json(payload): Json<SendOfferRequest>,
) -> Result<Json<SendOfferResponse>, (StatusCode, Json<SimpleResponse>)> {
    validate_sdp(&payload.sdp)?;

    let outcome = state
        .coordinator
        .send_offer(
            caller_id,
            payload.target_user_id,
            payload.call_type.unwrap_or_default(),
            payload.sdp,
        )
        .await
        .map_err(failure)?;

    Ok(Json(SendOfferResponse {
        success: outcome.delivered,
        call_id: outcome.call_id,
    }))
}

#[derive(Debug, Deserialize)]
pub struct SendAnswerRequest {
    pub caller_user_id: i64,
    pub call_id: String,
    pub sdp: serde_json::Value,
}

/// POST /webrtc/send-answer
pub async fn send_answer(
    AuthedUser(responder_id): AuthedUser,
    State(state): State<AppState>,
    Json(payload): Json<SendAnswerRequest>,
) -> Result<Json<SimpleResponse>, (StatusCode, Json<SimpleResponse>)> {
    validate_sdp(&payload.sdp)?;

    let delivered = state
        .coordinator
        .send_answer(
            responder_id,
            payload.caller_user_id,
            &payload.call_id,
            payload.sdp,
        )
        .await
        .map_err(failure)?;

    Ok(Json(SimpleResponse {
        success: delivered,
        message: None,
    }))
}

#[derive(Debug, Deserialize)]
pub struct SendIceCandidateRequest {
    pub target_user_id: i64,
    pub call_id: String,
    pub ice_candidate: IceCandidate,
}

/// POST /webrtc/send-ice-candidate
pub async fn send_ice_candidate(
    AuthedUser(sender_id): AuthedUser,
    State(state): State<AppState>,
    Json(payload): Json<SendIceCandidateRequest>,
) -> Result<Json<SimpleResponse>, (StatusCode, Json<SimpleResponse>)> {
    if payload.ice_candidate.candidate.trim().is_empty() {
        return Err(failure(SignalError::Validation("ice_candidate.candidate")));
    }

    let delivered = state
        .coordinator
        .send_ice_candidate(
            sender_id,
            payload.target_user_id,
            &payload.call_id,
            payload.ice_candidate,
        )
        .await
        .map_err(failure)?;

    Ok(Json(SimpleResponse {
        success: delivered,
        message: None,
    }))
}

#[derive(Debug, Deserialize)]
pub struct EndCallRequest {
    pub target_user_id: i64,
    pub call_id: String,
    #[serde(default)]
    pub reason: Option<EndReason>,
}

#[derive(Debug, Serialize)]
pub struct EndCallResponse {
    pub success: bool,
    pub reason: EndReason,
}

/// POST /webrtc/end-call
pub async fn end_call(
    AuthedUser(acting_user_id): AuthedUser,
    State(state): State<AppState>,
    Json(payload): Json<EndCallRequest>,
) -> Result<Json<EndCallResponse>, (StatusCode, Json<SimpleResponse>)> {
    let reason = payload.reason.unwrap_or_default();

    state
        .coordinator
        .end_call(
            acting_user_id,
            payload.target_user_id,
            &payload.call_id,
            reason,
        )
        .await
        .map_err(failure)?;

    Ok(Json(EndCallResponse {
        success: true,
        reason,
    }))
}

#[derive(Debug, Deserialize)]
pub struct SubscriptionKeys {
    pub p256dh: String,
    pub auth: String,
}

#[derive(Debug, Deserialize)]
pub struct SubscribeRequest {
    pub endpoint: String,
    pub keys: SubscriptionKeys,
}

/// POST /notifications/subscribe — register (or refresh) a push endpoint.
pub async fn subscribe(
    AuthedUser(user_id): AuthedUser,
    State(state): State<AppState>,
    headers: HeaderMap,
    Json(payload): Json<SubscribeRequest>,
) -> Result<Json<SimpleResponse>, (StatusCode, Json<SimpleResponse>)> {
    if !payload.endpoint.starts_with("https://") && !payload.endpoint.starts_with("http://") {
        return Err(failure(SignalError::Validation("endpoint")));
    }
    if payload.keys.p256dh.trim().is_empty() || payload.keys.auth.trim().is_empty() {
        return Err(failure(SignalError::Validation("keys")));
    }

    let user_agent = headers
        .get("user-agent")
        .and_then(|value| value.to_str().ok())
        .map(str::to_string);

    state
        .store
        .upsert_subscription(Subscription::new(
            user_id,
            payload.endpoint,
            payload.keys.p256dh,
            payload.keys.auth,
            user_agent,
        ))
        .await
        .map_err(|e| failure(SignalError::Storage(e)))?;

    debug!(user = %user_id, "push subscription saved");
    Ok(Json(SimpleResponse {
        success: true,
        message: None,
    }))
}

#[derive(Debug, Deserialize)]
pub struct UnsubscribeRequest {
    pub endpoint: String,
}

/// POST /notifications/unsubscribe
pub async fn unsubscribe(
    AuthedUser(user_id): AuthedUser,
    State(state): State<AppState>,
    Json(payload): Json<UnsubscribeRequest>,
) -> Result<Json<SimpleResponse>, (StatusCode, Json<SimpleResponse>)> {
    let removed = state
        .store
        .remove_subscription(user_id, &payload.endpoint)
        .await
        .map_err(|e| failure(SignalError::Storage(e)))?;

    Ok(Json(SimpleResponse {
        success: true,
        message: Some(if removed {
            "subscription removed".to_string()
        } else {
            "subscription not found".to_string()
        }),
    }))
}

#[derive(Debug, Serialize)]
pub struct BadgeResponse {
    pub success: bool,
    pub badge_count: u64,
}

/// POST /notifications/clear-badge — explicit acknowledgment of unread
/// signals.
pub async fn clear_badge(
    AuthedUser(user_id): AuthedUser,
    State(state): State<AppState>,
) -> Result<Json<BadgeResponse>, (StatusCode, Json<SimpleResponse>)> {
    state
        .store
        .clear_badge(user_id)
        .await
        .map_err(|e| failure(SignalError::Storage(e)))?;

    Ok(Json(BadgeResponse {
        success: true,
        badge_count: 0,
    }))
}

/// GET /user/badge-count
pub async fn badge_count(
    AuthedUser(user_id): AuthedUser,
    State(state): State<AppState>,
) -> Result<Json<BadgeResponse>, (StatusCode, Json<SimpleResponse>)> {
    let count = state
        .store
        .badge_count(user_id)
        .await
        .map_err(|e| failure(SignalError::Storage(e)))?;

    Ok(Json(BadgeResponse {
        success: true,
        badge_count: count,
    }))
}

#[derive(Debug, Serialize)]
pub struct VapidKeyResponse {
    pub public_key: String,
}

/// GET /notifications/vapid-key — static config passthrough for clients
/// registering their service-worker subscription.
pub async fn vapid_public_key(
    State(state): State<AppState>,
) -> Result<Json<VapidKeyResponse>, StatusCode> {
    match &state.vapid_public_key {
        Some(key) => Ok(Json(VapidKeyResponse {
            public_key: key.clone(),
        })),
        None => Err(StatusCode::NOT_FOUND),
    }
}

#[derive(Debug, Serialize)]
pub struct HealthStatus {
    status: &'static str,
}

/// GET /health
pub async fn health_check() -> Json<HealthStatus> {
    Json(HealthStatus { status: "ok" })
}

/// Request-level SDP validation: an opaque blob, but it must at least be an
/// object carrying a non-empty `sdp` string.
fn validate_sdp(sdp: &serde_json::Value) -> Result<(), (StatusCode, Json<SimpleResponse>)> {
    let ok = sdp
        .get("sdp")
        .and_then(serde_json::Value::as_str)
        .map(|s| !s.trim().is_empty())
        .unwrap_or(false);
    if ok {
        Ok(())
    } else {
        Err(failure(SignalError::Validation("sdp")))
    }
}
