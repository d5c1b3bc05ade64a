//! Snapshot caching, MJPEG byte-identity and HLS bookkeeping.

mod common;

use axum::http::StatusCode;
use bytes::Bytes;

use common::{TestBridge, call_full, call_json, signed_request};

const JPEG: &[u8] = b"\xff\xd8\xff\xe0fake-jpeg-payload\xff\xd9";

fn camera_bridge() -> TestBridge {
    let bridge = TestBridge::new();
    bridge.hub.add_entity("camera.porch", true);
    bridge.hub.set_state("camera.porch", "idle", serde_json::json!({}));
    bridge.hub.snapshots.lock().insert("camera.porch".to_owned(), Bytes::from_static(JPEG));
    bridge
}

#[tokio::test]
async fn snapshot_carries_etag_and_cache_headers() {
    let bridge = camera_bridge();

    let (status, headers, body) = call_full(
        &bridge,
        signed_request("GET", "/api/smartly/camera/camera.porch/snapshot", b""),
    )
    .await;

    assert_eq!(status, StatusCode::OK);
    assert_eq!(body.as_ref(), JPEG);
    assert_eq!(headers.get("content-type").and_then(|v| v.to_str().ok()), Some("image/jpeg"));
    assert_eq!(
        headers.get("cache-control").and_then(|v| v.to_str().ok()),
        Some("private, max-age=30")
    );
    assert!(headers.get("x-snapshot-timestamp").is_some());

    let etag = headers.get("etag").and_then(|v| v.to_str().ok()).expect("ETag header");
    let expected = smartly_bridge::camera::compute_etag(JPEG);
    assert_eq!(etag.trim_matches('"'), expected);
}

#[tokio::test]
async fn snapshot_revalidation_returns_304() {
    let bridge = camera_bridge();

    let (_, headers, _) = call_full(
        &bridge,
        signed_request("GET", "/api/smartly/camera/camera.porch/snapshot", b""),
    )
    .await;
    let etag = headers.get("etag").and_then(|v| v.to_str().ok()).expect("ETag").to_owned();

    let mut request = signed_request("GET", "/api/smartly/camera/camera.porch/snapshot", b"");
    request.headers_mut().insert(
        "if-none-match",
        axum::http::HeaderValue::from_str(&etag).expect("valid header"),
    );

    let (status, _, body) = call_full(&bridge, request).await;
    assert_eq!(status, StatusCode::NOT_MODIFIED);
    assert!(body.is_empty());
}

#[tokio::test]
async fn snapshot_cache_is_served_until_refresh() {
    let bridge = camera_bridge();

    let (_, headers_first, _) = call_full(
        &bridge,
        signed_request("GET", "/api/smartly/camera/camera.porch/snapshot", b""),
    )
    .await;

    // Change the upstream image: the cached copy must still be served…
    bridge
        .hub
        .snapshots
        .lock()
        .insert("camera.porch".to_owned(), Bytes::from_static(b"fresh-jpeg"));

    let (_, headers_cached, _) = call_full(
        &bridge,
        signed_request("GET", "/api/smartly/camera/camera.porch/snapshot", b""),
    )
    .await;
    assert_eq!(headers_first.get("etag"), headers_cached.get("etag"));

    // …until the caller asks for a refresh.
    let (_, headers_fresh, body) = call_full(
        &bridge,
        signed_request("GET", "/api/smartly/camera/camera.porch/snapshot?refresh=true", b""),
    )
    .await;
    assert_ne!(headers_first.get("etag"), headers_fresh.get("etag"));
    assert_eq!(body.as_ref(), b"fresh-jpeg");
}

#[tokio::test]
async fn snapshot_failures_and_acl() {
    let bridge = camera_bridge();
    bridge.hub.add_entity("camera.private", false);
    bridge.hub.set_state("camera.private", "idle", serde_json::json!({}));
    bridge.hub.add_entity("camera.broken", true);
    bridge.hub.set_state("camera.broken", "idle", serde_json::json!({}));

    let (status, body) = call_json(
        &bridge,
        signed_request("GET", "/api/smartly/camera/camera.ghost/snapshot", b""),
    )
    .await;
    assert_eq!(status, StatusCode::NOT_FOUND);
    assert_eq!(body["error"], "camera_not_found");

    let (status, body) = call_json(
        &bridge,
        signed_request("GET", "/api/smartly/camera/camera.private/snapshot", b""),
    )
    .await;
    assert_eq!(status, StatusCode::FORBIDDEN);
    assert_eq!(body["error"], "entity_not_allowed");

    // Known, allowed, but the hub has no image for it.
    let (status, body) = call_json(
        &bridge,
        signed_request("GET", "/api/smartly/camera/camera.broken/snapshot", b""),
    )
    .await;
    assert_eq!(status, StatusCode::NOT_FOUND);
    assert_eq!(body["error"], "snapshot_unavailable");
}

/// Property 10: the client sees exactly the upstream body bytes, in order,
/// with no framing added by the proxy.
#[tokio::test]
async fn mjpeg_stream_is_byte_identical() {
    let bridge = camera_bridge();

    let chunks = vec![
        Bytes::from_static(b"--frame\r\nContent-Type: image/jpeg\r\n\r\n"),
        Bytes::from_static(b"\xff\xd8frame-one\xff\xd9\r\n"),
        Bytes::from_static(b"--frame\r\nContent-Type: image/jpeg\r\n\r\n"),
        Bytes::from_static(b"\xff\xd8frame-two\xff\xd9\r\n"),
    ];
    let expected: Vec<u8> = chunks.iter().flat_map(|c| c.iter().copied()).collect();

    bridge.hub.stream_chunks.lock().insert("camera.porch".to_owned(), chunks);

    let (status, headers, body) = call_full(
        &bridge,
        signed_request("GET", "/api/smartly/camera/camera.porch/stream", b""),
    )
    .await;

    assert_eq!(status, StatusCode::OK);
    assert_eq!(
        headers.get("content-type").and_then(|v| v.to_str().ok()),
        Some("multipart/x-mixed-replace;boundary=frame")
    );
    assert_eq!(headers.get("connection").and_then(|v| v.to_str().ok()), Some("close"));
    assert_eq!(body.as_ref(), expected.as_slice());
}

#[tokio::test]
async fn hls_session_lifecycle_over_http() {
    let bridge = camera_bridge();

    let (status, body) = call_json(
        &bridge,
        signed_request("GET", "/api/smartly/camera/camera.porch/stream/hls?action=start", b""),
    )
    .await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(body["status"], "started");
    assert_eq!(body["clients_connected"], 1);
    let playlist = body["playlist_url"].as_str().expect("playlist URL");
    assert!(playlist.contains("/api/stream.m3u8"));
    assert!(playlist.contains("src=camera.porch"));

    let (_, body) = call_json(
        &bridge,
        signed_request("GET", "/api/smartly/camera/camera.porch/stream/hls?action=info", b""),
    )
    .await;
    assert_eq!(body["active"], true);

    let (_, body) = call_json(
        &bridge,
        signed_request("GET", "/api/smartly/camera/camera.porch/stream/hls?action=stats", b""),
    )
    .await;
    assert_eq!(body["session_count"], 1);
    assert_eq!(body["clients_connected"], 1);

    let (status, body) = call_json(
        &bridge,
        signed_request("GET", "/api/smartly/camera/camera.porch/stream/hls?action=stop", b""),
    )
    .await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(body["status"], "stopped");

    let (status, body) = call_json(
        &bridge,
        signed_request("GET", "/api/smartly/camera/camera.porch/stream/hls?action=stop", b""),
    )
    .await;
    assert_eq!(status, StatusCode::NOT_FOUND);
    assert_eq!(body["error"], "session_not_found");

    let (status, body) = call_json(
        &bridge,
        signed_request("GET", "/api/smartly/camera/camera.porch/stream/hls?action=transmogrify", b""),
    )
    .await;
    assert_eq!(status, StatusCode::BAD_REQUEST);
    assert_eq!(body["error"], "invalid_action");
}

#[tokio::test]
async fn camera_config_actions() {
    let bridge = camera_bridge();

    let register = serde_json::to_vec(&serde_json::json!({
        "action": "register",
        "entity_id": "camera.porch",
        "name": "Porch",
        "snapshot_url": "http://cam.local/snap.jpg",
        "username": "viewer",
        "password": "hunter2",
        "verify_ssl": false,
    }))
    .expect("serializable");

    let (status, body) = call_json(&bridge, signed_request("POST", "/api/smartly/camera/config", &register)).await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(body["status"], "registered");

    let list = serde_json::to_vec(&serde_json::json!({ "action": "list" })).expect("serializable");
    let (_, body) = call_json(&bridge, signed_request("POST", "/api/smartly/camera/config", &list)).await;

    assert_eq!(body["count"], 1);
    let camera = &body["cameras"][0];
    assert_eq!(camera["entity_id"], "camera.porch");
    assert_eq!(camera["has_credentials"], true);
    assert_eq!(camera["verify_ssl"], false);
    // The password itself must never be echoed.
    assert!(!body.to_string().contains("hunter2"));

    let unregister =
        serde_json::to_vec(&serde_json::json!({ "action": "unregister", "entity_id": "camera.porch" }))
            .expect("serializable");
    let (status, body) = call_json(&bridge, signed_request("POST", "/api/smartly/camera/config", &unregister)).await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(body["status"], "unregistered");

    let (status, body) = call_json(&bridge, signed_request("POST", "/api/smartly/camera/config", &unregister)).await;
    assert_eq!(status, StatusCode::NOT_FOUND);
    assert_eq!(body["error"], "camera_not_found");

    let bogus = serde_json::to_vec(&serde_json::json!({ "action": "defrobnicate" })).expect("serializable");
    let (status, body) = call_json(&bridge, signed_request("POST", "/api/smartly/camera/config", &bogus)).await;
    assert_eq!(status, StatusCode::BAD_REQUEST);
    assert_eq!(body["error"], "invalid_action");
}

#[tokio::test]
async fn camera_list_reports_capabilities() {
    let bridge = camera_bridge();
    bridge.hub.add_entity("sensor.not_a_camera", true);

    let (status, body) = call_json(
        &bridge,
        signed_request("GET", "/api/smartly/camera/list?capabilities=true", b""),
    )
    .await;

    assert_eq!(status, StatusCode::OK);
    assert_eq!(body["count"], 1);

    let camera = &body["cameras"][0];
    assert_eq!(camera["entity_id"], "camera.porch");
    assert_eq!(camera["capabilities"]["snapshot"], true);
    assert_eq!(camera["capabilities"]["registered"], false);
}
