//! WebRTC signalling flow against a local stand-in for go2rtc.

mod common;

use std::collections::HashMap;
use std::net::SocketAddr;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};

use axum::Json;
use axum::extract::{Query, State};
use axum::http::StatusCode;
use axum::routing::{post, put};
use parking_lot::Mutex;

use common::{TestBridge, call_json, signed_request, unsigned_request};

#[derive(Clone, Default)]
struct FakeGo2Rtc {
    offers: Arc<Mutex<Vec<String>>>,
    registered: Arc<Mutex<Vec<(String, String)>>>,
    reject_first_offer: Arc<AtomicBool>,
}

async fn fake_offer(
    State(fake): State<FakeGo2Rtc>,
    Query(params): Query<HashMap<String, String>>,
    Json(body): Json<serde_json::Value>,
) -> (StatusCode, Json<serde_json::Value>) {
    if fake.reject_first_offer.swap(false, Ordering::SeqCst) {
        return (StatusCode::NOT_FOUND, Json(serde_json::json!({})));
    }

    fake.offers.lock().push(params.get("src").cloned().unwrap_or_default());

    assert_eq!(body["type"], "offer");

    (
        StatusCode::OK,
        Json(serde_json::json!({ "type": "answer", "sdp": "v=0\r\nanswer-sdp" })),
    )
}

async fn fake_register(
    State(fake): State<FakeGo2Rtc>,
    Query(params): Query<HashMap<String, String>>,
) -> StatusCode {
    fake.registered.lock().push((
        params.get("name").cloned().unwrap_or_default(),
        params.get("src").cloned().unwrap_or_default(),
    ));
    StatusCode::OK
}

async fn spawn_fake_go2rtc(reject_first_offer: bool) -> (SocketAddr, FakeGo2Rtc) {
    let fake = FakeGo2Rtc::default();
    fake.reject_first_offer.store(reject_first_offer, Ordering::SeqCst);

    let router = axum::Router::new()
        .route("/api/webrtc", post(fake_offer))
        .route("/api/streams", put(fake_register))
        .with_state(fake.clone());

    let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await.expect("bindable");
    let addr = listener.local_addr().expect("local address");

    tokio::spawn(async move {
        let _ = axum::serve(listener, router).await;
    });

    (addr, fake)
}

async fn webrtc_bridge(reject_first_offer: bool) -> (TestBridge, FakeGo2Rtc) {
    let (addr, fake) = spawn_fake_go2rtc(reject_first_offer).await;

    let bridge = TestBridge::with_conf_extra(&format!(r#", "Go2RtcUrl": "http://{addr}""#));
    bridge.hub.add_entity("camera.porch", true);
    bridge.hub.set_state("camera.porch", "idle", serde_json::json!({}));
    bridge
        .hub
        .stream_sources
        .lock()
        .insert("camera.porch".to_owned(), "rtsp://cam.local/stream1".to_owned());

    (bridge, fake)
}

async fn issue_token(bridge: &TestBridge) -> serde_json::Value {
    let (status, body) = call_json(
        &bridge,
        signed_request("POST", "/api/smartly/camera/camera.porch/webrtc", b""),
    )
    .await;
    assert_eq!(status, StatusCode::OK);
    body
}

#[tokio::test]
async fn token_issuance_shape() {
    let (bridge, _) = webrtc_bridge(false).await;

    let body = issue_token(&bridge).await;

    assert!(body["token"].as_str().expect("token").len() >= 43);
    assert_eq!(body["expires_in"], 300);
    assert_eq!(body["offer_endpoint"], "/api/smartly/camera/camera.porch/webrtc/offer");
    assert_eq!(body["ice_endpoint"], "/api/smartly/camera/camera.porch/webrtc/ice");
    assert_eq!(body["hangup_endpoint"], "/api/smartly/camera/camera.porch/webrtc/hangup");

    let ice_servers = body["ice_servers"].as_array().expect("ice servers");
    assert!(!ice_servers.is_empty());
    assert!(ice_servers[0]["urls"][0].as_str().expect("stun url").starts_with("stun:"));
}

#[tokio::test]
async fn turn_server_is_advertised_when_configured() {
    let (addr, _) = spawn_fake_go2rtc(false).await;

    let bridge = TestBridge::with_conf_extra(&format!(
        r#", "Go2RtcUrl": "http://{addr}",
            "Turn": {{ "Url": "turn:turn.example:3478", "Username": "u", "Credential": "c" }}"#
    ));
    bridge.hub.add_entity("camera.porch", true);
    bridge.hub.set_state("camera.porch", "idle", serde_json::json!({}));

    let body = issue_token(&bridge).await;
    let ice_servers = body["ice_servers"].as_array().expect("ice servers");

    assert_eq!(ice_servers.len(), 2);
    assert_eq!(ice_servers[1]["urls"][0], "turn:turn.example:3478");
    assert_eq!(ice_servers[1]["username"], "u");
}

/// S6 / Property 9: one successful SDP exchange consumes the token; any
/// further use is rejected.
#[tokio::test]
async fn sdp_exchange_consumes_the_token() {
    let (bridge, fake) = webrtc_bridge(false).await;

    let token = issue_token(&bridge).await["token"].as_str().expect("token").to_owned();

    let offer = serde_json::to_vec(&serde_json::json!({
        "token": token,
        "sdp": "v=0\r\noffer-sdp",
        "type": "offer",
    }))
    .expect("serializable");

    let (status, body) = call_json(
        &bridge,
        unsigned_request("POST", "/api/smartly/camera/camera.porch/webrtc/offer", &offer),
    )
    .await;

    assert_eq!(status, StatusCode::OK);
    assert_eq!(body["type"], "answer");
    assert_eq!(body["sdp"], "v=0\r\nanswer-sdp");
    let session_id = body["session_id"].as_str().expect("session id").to_owned();
    assert!(!session_id.is_empty());

    {
        let offers = fake.offers.lock();
        assert_eq!(offers.len(), 1);
        assert_eq!(offers[0], "camera.porch");
    }

    // Replaying the same token must fail.
    let (status, body) = call_json(
        &bridge,
        unsigned_request("POST", "/api/smartly/camera/camera.porch/webrtc/offer", &offer),
    )
    .await;
    assert_eq!(status, StatusCode::UNAUTHORIZED);
    assert_eq!(body["error"], "invalid_or_expired_token");
}

#[tokio::test]
async fn token_does_not_transfer_between_cameras() {
    let (bridge, _) = webrtc_bridge(false).await;
    bridge.hub.add_entity("camera.garage", true);
    bridge.hub.set_state("camera.garage", "idle", serde_json::json!({}));
    bridge
        .hub
        .stream_sources
        .lock()
        .insert("camera.garage".to_owned(), "rtsp://cam.local/stream2".to_owned());

    let token = issue_token(&bridge).await["token"].as_str().expect("token").to_owned();

    let offer = serde_json::to_vec(&serde_json::json!({
        "token": token,
        "sdp": "v=0\r\noffer-sdp",
        "type": "offer",
    }))
    .expect("serializable");

    let (status, body) = call_json(
        &bridge,
        unsigned_request("POST", "/api/smartly/camera/camera.garage/webrtc/offer", &offer),
    )
    .await;

    assert_eq!(status, StatusCode::UNAUTHORIZED);
    assert_eq!(body["error"], "invalid_or_expired_token");
}

#[tokio::test]
async fn unknown_stream_is_registered_and_retried() {
    let (bridge, fake) = webrtc_bridge(true).await;

    let token = issue_token(&bridge).await["token"].as_str().expect("token").to_owned();

    let offer = serde_json::to_vec(&serde_json::json!({
        "token": token,
        "sdp": "v=0\r\noffer-sdp",
        "type": "offer",
    }))
    .expect("serializable");

    let (status, _) = call_json(
        &bridge,
        unsigned_request("POST", "/api/smartly/camera/camera.porch/webrtc/offer", &offer),
    )
    .await;

    assert_eq!(status, StatusCode::OK);

    let registered = fake.registered.lock();
    assert_eq!(registered.len(), 1);
    assert_eq!(registered[0].0, "camera.porch");
    assert_eq!(registered[0].1, "rtsp://cam.local/stream1");
}

#[tokio::test]
async fn missing_stream_source_is_a_server_error() {
    let (bridge, _) = webrtc_bridge(false).await;
    bridge.hub.stream_sources.lock().clear();

    let token = issue_token(&bridge).await["token"].as_str().expect("token").to_owned();

    let offer = serde_json::to_vec(&serde_json::json!({
        "token": token,
        "sdp": "v=0\r\noffer-sdp",
        "type": "offer",
    }))
    .expect("serializable");

    let (status, body) = call_json(
        &bridge,
        unsigned_request("POST", "/api/smartly/camera/camera.porch/webrtc/offer", &offer),
    )
    .await;

    assert_eq!(status, StatusCode::INTERNAL_SERVER_ERROR);
    assert_eq!(body["error"], "stream_source_not_found");
}

#[tokio::test]
async fn ice_and_hangup_use_the_session_capability() {
    let (bridge, _) = webrtc_bridge(false).await;

    let token = issue_token(&bridge).await["token"].as_str().expect("token").to_owned();

    let offer = serde_json::to_vec(&serde_json::json!({
        "token": token,
        "sdp": "v=0\r\noffer-sdp",
        "type": "offer",
    }))
    .expect("serializable");

    let (_, body) = call_json(
        &bridge,
        unsigned_request("POST", "/api/smartly/camera/camera.porch/webrtc/offer", &offer),
    )
    .await;
    let session_id = body["session_id"].as_str().expect("session id").to_owned();

    let ice = serde_json::to_vec(&serde_json::json!({
        "session_id": session_id,
        "candidate": { "candidate": "candidate:1 1 UDP 2122252543 192.0.2.1 54321 typ host", "sdpMid": "0", "sdpMLineIndex": 0 },
    }))
    .expect("serializable");

    let (status, body) = call_json(
        &bridge,
        unsigned_request("POST", "/api/smartly/camera/camera.porch/webrtc/ice", &ice),
    )
    .await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(body["status"], "accepted");

    // The session id is bound to its camera.
    let (status, body) = call_json(
        &bridge,
        unsigned_request("POST", "/api/smartly/camera/camera.garage/webrtc/ice", &ice),
    )
    .await;
    assert_eq!(status, StatusCode::NOT_FOUND);
    assert_eq!(body["error"], "session_not_found");

    let hangup = serde_json::to_vec(&serde_json::json!({ "session_id": session_id })).expect("serializable");

    let (status, body) = call_json(
        &bridge,
        unsigned_request("POST", "/api/smartly/camera/camera.porch/webrtc/hangup", &hangup),
    )
    .await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(body["status"], "closed");

    let (status, body) = call_json(
        &bridge,
        unsigned_request("POST", "/api/smartly/camera/camera.porch/webrtc/hangup", &hangup),
    )
    .await;
    assert_eq!(status, StatusCode::NOT_FOUND);
    assert_eq!(body["error"], "session_not_found");
}
