use axum::Json;
use axum::body::Body;
use axum::extract::{Path, Query, State};
use axum::http::{HeaderMap, HeaderName, HeaderValue, StatusCode, header};
use axum::response::{IntoResponse, Response};
use bytes::Bytes;

use crate::BridgeState;
use crate::acl;
use crate::audit;
use crate::camera::CameraConfig;
use crate::extract::ClientIdentity;
use crate::http::HttpError;
use crate::utils;

fn check_camera(state: &BridgeState, identity: &ClientIdentity, entity_id: &str) -> Result<(), HttpError> {
    let is_camera = entity_id.starts_with("camera.");
    let known = state.hub.entity(entity_id).is_some() || state.hub.state(entity_id).is_some();

    if !is_camera || !known {
        return Err(HttpError::not_found().kind("camera_not_found"));
    }

    if !acl::is_entity_allowed(&state.hub, entity_id) {
        audit::log_deny(Some(&identity.client_id), identity.source_ip, entity_id, "entity_not_allowed");
        return Err(HttpError::forbidden().kind("entity_not_allowed"));
    }

    Ok(())
}

#[derive(Debug, Deserialize)]
pub(crate) struct ListParams {
    capabilities: Option<bool>,
}

/// GET `/api/smartly/camera/list[?capabilities=true]`
pub(super) async fn get_list(
    State(state): State<BridgeState>,
    _identity: ClientIdentity,
    Query(params): Query<ListParams>,
) -> Result<Json<serde_json::Value>, HttpError> {
    let cameras: Vec<serde_json::Value> = acl::allowed_entities(&state.hub)
        .into_iter()
        .filter(|entry| entry.domain() == "camera")
        .map(|entry| {
            let current = state.hub.state(&entry.entity_id);
            let registered = state.cameras.config(&entry.entity_id);

            let mut item = json!({
                "entity_id": entry.entity_id,
                "name": registered
                    .as_ref()
                    .and_then(|config| config.name.clone())
                    .unwrap_or_else(|| entry.display_name()),
                "state": current.as_ref().map(|s| s.state.clone()),
                "icon": crate::topology::resolve_icon(&entry),
            });

            if params.capabilities.unwrap_or(false) {
                item["capabilities"] = json!({
                    "snapshot": true,
                    "mjpeg": true,
                    "hls": true,
                    "webrtc": true,
                    "registered": registered.is_some(),
                });
            }

            item
        })
        .collect();

    Ok(Json(json!({
        "count": cameras.len(),
        "cameras": cameras,
    })))
}

#[derive(Debug, Deserialize)]
pub(crate) struct SnapshotParams {
    refresh: Option<bool>,
}

/// GET `/api/smartly/camera/{entity_id}/snapshot[?refresh=true]`
pub(super) async fn get_snapshot(
    State(state): State<BridgeState>,
    identity: ClientIdentity,
    Path(entity_id): Path<String>,
    Query(params): Query<SnapshotParams>,
    headers: HeaderMap,
) -> Result<Response, HttpError> {
    check_camera(&state, &identity, &entity_id)?;

    let snapshot = state
        .cameras
        .snapshot(&state.hub, &entity_id, params.refresh.unwrap_or(false))
        .await
        .map_err(HttpError::not_found().with_kind("snapshot_unavailable").err())?;

    let etag_value = HeaderValue::from_str(&format!("\"{}\"", snapshot.etag))
        .expect("hex digest is a valid header value");

    let revalidated = headers
        .get(header::IF_NONE_MATCH)
        .and_then(|value| value.to_str().ok())
        .is_some_and(|value| value.trim_matches('"') == snapshot.etag || value == "*");

    if revalidated {
        let mut response = StatusCode::NOT_MODIFIED.into_response();
        response.headers_mut().insert(header::ETAG, etag_value);
        return Ok(response);
    }

    let max_age = state.cameras.snapshot_ttl().as_secs();

    let mut response_headers = HeaderMap::new();
    response_headers.insert(
        header::CONTENT_TYPE,
        HeaderValue::from_str(&snapshot.content_type).unwrap_or(HeaderValue::from_static("image/jpeg")),
    );
    response_headers.insert(header::ETAG, etag_value);
    response_headers.insert(
        header::CACHE_CONTROL,
        HeaderValue::from_str(&format!("private, max-age={max_age}")).expect("valid cache-control value"),
    );
    response_headers.insert(
        HeaderName::from_static("x-snapshot-timestamp"),
        HeaderValue::from_str(&utils::format_rfc3339(snapshot.captured_at)).expect("RFC 3339 is a valid header value"),
    );

    Ok((StatusCode::OK, response_headers, snapshot.image).into_response())
}

/// GET `/api/smartly/camera/{entity_id}/stream` — MJPEG proxy.
///
/// The upstream already emits a valid `multipart/x-mixed-replace` body, so
/// its bytes are forwarded verbatim: no chunked re-framing, no compression.
/// Dropping the response (client gone) tears down the upstream read.
pub(super) async fn get_stream(
    State(state): State<BridgeState>,
    identity: ClientIdentity,
    Path(entity_id): Path<String>,
) -> Result<Response, HttpError> {
    check_camera(&state, &identity, &entity_id)?;

    let stream = state
        .cameras
        .stream(&state.hub, &entity_id)
        .await
        .map_err(HttpError::not_found().with_kind("camera_not_found").err())?;

    let mut response = Response::new(Body::from_stream(stream));
    response.headers_mut().insert(
        header::CONTENT_TYPE,
        HeaderValue::from_static("multipart/x-mixed-replace;boundary=frame"),
    );
    response
        .headers_mut()
        .insert(header::CONNECTION, HeaderValue::from_static("close"));
    response
        .headers_mut()
        .insert(header::CACHE_CONTROL, HeaderValue::from_static("no-store"));

    Ok(response)
}

#[derive(Debug, Deserialize)]
pub(crate) struct HlsParams {
    action: Option<String>,
}

/// GET `/api/smartly/camera/{entity_id}/stream/hls?action={start|stop|info|stats}`
pub(super) async fn get_hls(
    State(state): State<BridgeState>,
    identity: ClientIdentity,
    Path(entity_id): Path<String>,
    Query(params): Query<HlsParams>,
) -> Result<Json<serde_json::Value>, HttpError> {
    check_camera(&state, &identity, &entity_id)?;

    let conf = state.conf_handle.get_conf();

    match params.action.as_deref() {
        Some("start") => {
            let session = state.cameras.hls_start(&entity_id);

            let mut playlist_url = conf
                .go2rtc_url
                .join("/api/stream.m3u8")
                .map_err(HttpError::internal().with_kind("internal_server_error").err())?;
            playlist_url.query_pairs_mut().append_pair("src", &entity_id);

            Ok(Json(json!({
                "status": "started",
                "stream_id": session.stream_id,
                "entity_id": session.entity_id,
                "started_at": utils::format_rfc3339(session.started_at),
                "clients_connected": session.clients_connected,
                "playlist_url": playlist_url.as_str(),
            })))
        }
        Some("stop") => {
            if state.cameras.hls_stop(&entity_id) {
                Ok(Json(json!({ "status": "stopped" })))
            } else {
                Err(HttpError::not_found().kind("session_not_found"))
            }
        }
        Some("info") => {
            let session = state.cameras.hls_session(&entity_id);

            Ok(Json(json!({
                "entity_id": entity_id,
                "active": session.is_some(),
                "session": session,
                "capabilities": { "hls": true, "mjpeg": true, "webrtc": true },
            })))
        }
        Some("stats") => {
            let sessions = state.cameras.hls_sessions();
            let now = time::OffsetDateTime::now_utc();

            let clients_connected: u32 = sessions.iter().map(|s| s.clients_connected).sum();
            let details: Vec<serde_json::Value> = sessions
                .iter()
                .map(|session| {
                    json!({
                        "stream_id": session.stream_id,
                        "entity_id": session.entity_id,
                        "started_at": utils::format_rfc3339(session.started_at),
                        "clients_connected": session.clients_connected,
                        "uptime_seconds": (now - session.started_at).whole_seconds().max(0),
                    })
                })
                .collect();

            Ok(Json(json!({
                "session_count": sessions.len(),
                "clients_connected": clients_connected,
                "sessions": details,
            })))
        }
        _ => Err(HttpError::bad_request().kind("invalid_action")),
    }
}

#[derive(Debug, Deserialize)]
struct RegisterPayload {
    entity_id: String,
    name: Option<String>,
    snapshot_url: Option<String>,
    stream_url: Option<String>,
    username: Option<String>,
    password: Option<String>,
    verify_ssl: Option<bool>,
    extra_headers: Option<std::collections::HashMap<String, String>>,
}

/// POST `/api/smartly/camera/config` — register/unregister/clear_cache/list.
pub(super) async fn post_config(
    State(state): State<BridgeState>,
    _identity: ClientIdentity,
    body: Bytes,
) -> Result<Json<serde_json::Value>, HttpError> {
    let parsed: serde_json::Value =
        serde_json::from_slice(&body).map_err(|_| HttpError::bad_request().kind("invalid_json"))?;

    let action = parsed
        .get("action")
        .and_then(|value| value.as_str())
        .ok_or_else(|| HttpError::bad_request().kind("missing_required_fields"))?;

    match action {
        "register" => {
            let payload: RegisterPayload = serde_json::from_value(parsed.clone())
                .map_err(|_| HttpError::bad_request().kind("missing_required_fields"))?;

            if !acl::is_valid_entity_id(&payload.entity_id) {
                return Err(HttpError::bad_request().kind("invalid_entity_id"));
            }

            let entity_id = payload.entity_id.clone();

            state.cameras.register(CameraConfig {
                entity_id: payload.entity_id,
                name: payload.name,
                snapshot_url: payload.snapshot_url,
                stream_url: payload.stream_url,
                username: payload.username,
                password: payload.password,
                verify_ssl: payload.verify_ssl.unwrap_or(true),
                extra_headers: payload.extra_headers.unwrap_or_default(),
            });

            Ok(Json(json!({ "status": "registered", "entity_id": entity_id })))
        }
        "unregister" => {
            let entity_id = parsed
                .get("entity_id")
                .and_then(|value| value.as_str())
                .ok_or_else(|| HttpError::bad_request().kind("missing_required_fields"))?;

            if state.cameras.unregister(entity_id) {
                Ok(Json(json!({ "status": "unregistered", "entity_id": entity_id })))
            } else {
                Err(HttpError::not_found().kind("camera_not_found"))
            }
        }
        "clear_cache" => {
            state.cameras.clear_cache();
            Ok(Json(json!({ "status": "cache_cleared" })))
        }
        "list" => {
            // Credentials never leave the process; only their presence does.
            let cameras: Vec<serde_json::Value> = state
                .cameras
                .configs()
                .into_iter()
                .map(|config| {
                    json!({
                        "entity_id": config.entity_id,
                        "name": config.name,
                        "snapshot_url": config.snapshot_url,
                        "stream_url": config.stream_url,
                        "has_credentials": config.username.is_some(),
                        "verify_ssl": config.verify_ssl,
                    })
                })
                .collect();

            Ok(Json(json!({ "count": cameras.len(), "cameras": cameras })))
        }
        _ => Err(HttpError::bad_request().kind("invalid_action")),
    }
}
