//! WebRTC signalling: token issuance, SDP/ICE brokering, hangup.
//!
//! Only token issuance sits behind the HMAC gate. The SDP exchange is
//! authorized by the single-use token, ICE and hangup by the session id.

use axum::Json;
use axum::extract::{Path, State};
use bytes::Bytes;

use crate::BridgeState;
use crate::acl;
use crate::audit;
use crate::extract::ClientIdentity;
use crate::go2rtc::{Go2RtcClient, Go2RtcError};
use crate::http::HttpError;
use crate::utils;
use crate::webrtc::TOKEN_TTL;

const STUN_SERVERS: &[&str] = &["stun:stun.l.google.com:19302", "stun:stun1.l.google.com:19302"];

fn ice_servers(conf: &crate::config::Conf) -> Vec<serde_json::Value> {
    let mut servers = vec![json!({ "urls": STUN_SERVERS })];

    if let Some(turn) = &conf.turn {
        servers.push(json!({
            "urls": [turn.url],
            "username": turn.username,
            "credential": turn.credential,
        }));
    }

    servers
}

fn map_go2rtc_error(error: Go2RtcError) -> HttpError {
    match error {
        Go2RtcError::Unreachable(_) => HttpError::bad_gateway().with_kind("go2rtc_not_available").err()(error),
        _ => HttpError::internal().with_kind("webrtc_failed").err()(error),
    }
}

/// POST `/api/smartly/camera/{entity_id}/webrtc` — allocate a single-use
/// signalling token (HMAC-protected).
pub(super) async fn post_token(
    State(state): State<BridgeState>,
    identity: ClientIdentity,
    Path(entity_id): Path<String>,
) -> Result<Json<serde_json::Value>, HttpError> {
    if state.hub.entity(&entity_id).is_none() && state.hub.state(&entity_id).is_none() {
        return Err(HttpError::not_found().kind("camera_not_found"));
    }

    if !acl::is_entity_allowed(&state.hub, &entity_id) {
        audit::log_deny(Some(&identity.client_id), identity.source_ip, &entity_id, "entity_not_allowed");
        return Err(HttpError::forbidden().kind("entity_not_allowed"));
    }

    let conf = state.conf_handle.get_conf();
    let token = state.webrtc.issue_token(&entity_id, &identity.client_id);

    debug!(entity_id, "WebRTC token issued");

    Ok(Json(json!({
        "token": token.token,
        "expires_at": utils::format_rfc3339(token.expires_at),
        "expires_in": TOKEN_TTL.as_secs(),
        "offer_endpoint": format!("/api/smartly/camera/{entity_id}/webrtc/offer"),
        "ice_endpoint": format!("/api/smartly/camera/{entity_id}/webrtc/ice"),
        "hangup_endpoint": format!("/api/smartly/camera/{entity_id}/webrtc/hangup"),
        "ice_servers": ice_servers(&conf),
    })))
}

#[derive(Debug, Deserialize)]
struct OfferRequest {
    token: String,
    sdp: String,
    #[serde(rename = "type")]
    kind: String,
}

/// POST `/api/smartly/camera/{entity_id}/webrtc/offer` — consume the token,
/// broker the SDP exchange with go2rtc, hand back a session id.
pub(super) async fn post_offer(
    State(state): State<BridgeState>,
    Path(entity_id): Path<String>,
    body: Bytes,
) -> Result<Json<serde_json::Value>, HttpError> {
    let parsed: serde_json::Value =
        serde_json::from_slice(&body).map_err(|_| HttpError::bad_request().kind("invalid_json"))?;
    let request: OfferRequest =
        serde_json::from_value(parsed).map_err(|_| HttpError::bad_request().kind("missing_required_fields"))?;

    if request.kind != "offer" {
        return Err(HttpError::bad_request().kind("invalid_action"));
    }

    let conf = state.conf_handle.get_conf();

    // The token must still match the credential record; a regenerated secret
    // also invalidates any token issued under the previous client id.
    if let Err(rejection) = state.webrtc.consume_token(&request.token, &entity_id, &conf.client_id) {
        debug!(entity_id, reason = rejection.as_str(), "WebRTC token rejected");
        return Err(HttpError::unauthorized().kind("invalid_or_expired_token"));
    }

    let stream_source = state
        .hub
        .camera_stream_source(&entity_id)
        .await
        .map_err(HttpError::internal().with_kind("webrtc_failed").err())?
        .filter(|source| !source.is_empty())
        .ok_or_else(|| HttpError::internal().kind("stream_source_not_found"))?;

    let client = Go2RtcClient::new(conf.go2rtc_url.clone());

    let answer = client
        .webrtc_offer(&entity_id, &stream_source, &request.sdp)
        .await
        .map_err(map_go2rtc_error)?;

    let session = state.webrtc.create_session(&entity_id);

    debug!(entity_id, session_id = %session.session_id, "WebRTC session established");

    Ok(Json(json!({
        "type": "answer",
        "sdp": answer,
        "session_id": session.session_id,
    })))
}

#[derive(Debug, Deserialize)]
struct IceRequest {
    session_id: String,
    candidate: serde_json::Value,
}

/// POST `/api/smartly/camera/{entity_id}/webrtc/ice` — session-protected
/// trickle ICE forwarding.
pub(super) async fn post_ice(
    State(state): State<BridgeState>,
    Path(entity_id): Path<String>,
    body: Bytes,
) -> Result<Json<serde_json::Value>, HttpError> {
    let parsed: serde_json::Value =
        serde_json::from_slice(&body).map_err(|_| HttpError::bad_request().kind("invalid_json"))?;
    let request: IceRequest =
        serde_json::from_value(parsed).map_err(|_| HttpError::bad_request().kind("missing_required_fields"))?;

    if !state.webrtc.touch_session(&request.session_id, &entity_id) {
        return Err(HttpError::not_found().kind("session_not_found"));
    }

    let conf = state.conf_handle.get_conf();
    let client = Go2RtcClient::new(conf.go2rtc_url.clone());

    // Candidate forwarding is best-effort; the peer connection survives a
    // dropped candidate.
    if let Err(error) = client.add_ice_candidate(&entity_id, &request.candidate).await {
        debug!(entity_id, %error, "ICE candidate forwarding failed");
    }

    Ok(Json(json!({ "status": "accepted", "candidates": [] })))
}

#[derive(Debug, Deserialize)]
struct HangupRequest {
    session_id: String,
}

/// POST `/api/smartly/camera/{entity_id}/webrtc/hangup` — session-protected
/// teardown.
pub(super) async fn post_hangup(
    State(state): State<BridgeState>,
    Path(entity_id): Path<String>,
    body: Bytes,
) -> Result<Json<serde_json::Value>, HttpError> {
    let parsed: serde_json::Value =
        serde_json::from_slice(&body).map_err(|_| HttpError::bad_request().kind("invalid_json"))?;
    let request: HangupRequest =
        serde_json::from_value(parsed).map_err(|_| HttpError::bad_request().kind("missing_required_fields"))?;

    if !state.webrtc.remove_session(&request.session_id, &entity_id) {
        return Err(HttpError::not_found().kind("session_not_found"));
    }

    let conf = state.conf_handle.get_conf();
    let client = Go2RtcClient::new(conf.go2rtc_url.clone());

    if let Err(error) = client.close(&entity_id).await {
        debug!(entity_id, %error, "go2rtc close notification failed");
    }

    Ok(Json(json!({ "status": "closed" })))
}
