//! Shared fixtures: an in-memory hub double and signed-request helpers.

use std::collections::HashMap;
use std::net::SocketAddr;
use std::sync::Arc;

use axum::body::Body;
use axum::extract::connect_info::ConnectInfo;
use axum::http::Request;
use bytes::Bytes;
use http_body_util::BodyExt as _;
use parking_lot::Mutex;
use time::OffsetDateTime;
use tokio::sync::broadcast;
use tower::ServiceExt as _;

use smartly_bridge::BridgeState;
use smartly_bridge::auth::{self, NonceCache, RateLimiter};
use smartly_bridge::camera::CameraManager;
use smartly_bridge::config::ConfHandle;
use smartly_bridge::hub::{
    AreaEntry, CameraByteStream, DeviceEntry, EntityEntry, EntityState, FloorEntry, HistoryQuery, HistoryRow, Hub,
    HubError, StateChangedEvent, StatisticsPoint, StatisticsQuery,
};
use smartly_bridge::webrtc::WebRtcManager;

pub const TEST_CLIENT_ID: &str = "smartly-00aa11bb22cc33dd";
pub const TEST_SECRET: &str = "test-secret-test-secret-test-secret-0123456789";
pub const TEST_PEER: &str = "127.0.0.1:52100";

#[derive(Default)]
pub struct MockHub {
    pub entities: Mutex<HashMap<String, EntityEntry>>,
    pub devices: Mutex<HashMap<String, DeviceEntry>>,
    pub areas: Mutex<HashMap<String, AreaEntry>>,
    pub floors: Mutex<HashMap<String, FloorEntry>>,
    pub states: Mutex<HashMap<String, EntityState>>,
    pub history_rows: Mutex<HashMap<String, Vec<HistoryRow>>>,
    pub statistics_rows: Mutex<HashMap<String, Vec<StatisticsPoint>>>,
    pub snapshots: Mutex<HashMap<String, Bytes>>,
    pub stream_chunks: Mutex<HashMap<String, Vec<Bytes>>>,
    pub stream_sources: Mutex<HashMap<String, String>>,
    pub service_calls: Mutex<Vec<(String, String, serde_json::Map<String, serde_json::Value>)>>,
    pub fail_service_calls: Mutex<Option<HubError>>,
    pub events: Option<broadcast::Sender<StateChangedEvent>>,
}

impl MockHub {
    pub fn new() -> Self {
        let (events, _) = broadcast::channel(256);
        Self {
            events: Some(events),
            ..Self::default()
        }
    }

    pub fn add_entity(&self, entity_id: &str, labeled: bool) {
        self.add_entity_full(entity_id, labeled, None, None);
    }

    pub fn add_entity_full(&self, entity_id: &str, labeled: bool, device_id: Option<&str>, area_id: Option<&str>) {
        let entry = EntityEntry {
            entity_id: entity_id.to_owned(),
            name: None,
            original_name: None,
            icon: None,
            original_icon: None,
            device_id: device_id.map(str::to_owned),
            area_id: area_id.map(str::to_owned),
            labels: if labeled { vec!["smartly".to_owned()] } else { Vec::new() },
        };
        self.entities.lock().insert(entity_id.to_owned(), entry);
    }

    pub fn set_state(&self, entity_id: &str, state: &str, attributes: serde_json::Value) {
        let attributes = attributes.as_object().cloned().unwrap_or_default();
        let now = OffsetDateTime::now_utc();

        self.states.lock().insert(
            entity_id.to_owned(),
            EntityState {
                entity_id: entity_id.to_owned(),
                state: state.to_owned(),
                attributes,
                last_changed: now,
                last_updated: now,
            },
        );
    }

    pub fn emit(&self, event: StateChangedEvent) {
        if let Some(events) = &self.events {
            let _ = events.send(event);
        }
    }
}

#[async_trait::async_trait]
impl Hub for MockHub {
    fn entity(&self, entity_id: &str) -> Option<EntityEntry> {
        self.entities.lock().get(entity_id).cloned()
    }

    fn entities(&self) -> Vec<EntityEntry> {
        self.entities.lock().values().cloned().collect()
    }

    fn device(&self, device_id: &str) -> Option<DeviceEntry> {
        self.devices.lock().get(device_id).cloned()
    }

    fn area(&self, area_id: &str) -> Option<AreaEntry> {
        self.areas.lock().get(area_id).cloned()
    }

    fn floor(&self, floor_id: &str) -> Option<FloorEntry> {
        self.floors.lock().get(floor_id).cloned()
    }

    fn state(&self, entity_id: &str) -> Option<EntityState> {
        self.states.lock().get(entity_id).cloned()
    }

    async fn call_service(
        &self,
        domain: &str,
        service: &str,
        data: serde_json::Map<String, serde_json::Value>,
    ) -> Result<(), HubError> {
        if let Some(error) = self.fail_service_calls.lock().take() {
            return Err(error);
        }

        self.service_calls
            .lock()
            .push((domain.to_owned(), service.to_owned(), data));

        Ok(())
    }

    fn history(&self, query: &HistoryQuery) -> Result<Vec<HistoryRow>, HubError> {
        let rows = self.history_rows.lock().get(&query.entity_id).cloned().unwrap_or_default();

        Ok(rows
            .into_iter()
            .filter(|row| row.last_updated >= query.start && row.last_updated <= query.end)
            .collect())
    }

    fn statistics(&self, query: &StatisticsQuery) -> Result<HashMap<String, Vec<StatisticsPoint>>, HubError> {
        let all = self.statistics_rows.lock();

        Ok(query
            .entity_ids
            .iter()
            .filter_map(|entity_id| all.get(entity_id).map(|points| (entity_id.clone(), points.clone())))
            .collect())
    }

    async fn camera_snapshot(&self, entity_id: &str) -> Result<Bytes, HubError> {
        self.snapshots
            .lock()
            .get(entity_id)
            .cloned()
            .ok_or_else(|| HubError::Camera("no snapshot".to_owned()))
    }

    async fn camera_stream(&self, entity_id: &str) -> Result<CameraByteStream, HubError> {
        let chunks = self
            .stream_chunks
            .lock()
            .get(entity_id)
            .cloned()
            .ok_or_else(|| HubError::Camera("no stream".to_owned()))?;

        Ok(Box::pin(futures::stream::iter(chunks.into_iter().map(Ok))))
    }

    async fn camera_stream_source(&self, entity_id: &str) -> Result<Option<String>, HubError> {
        Ok(self.stream_sources.lock().get(entity_id).cloned())
    }

    fn subscribe_state_changes(&self) -> broadcast::Receiver<StateChangedEvent> {
        self.events.as_ref().expect("mock hub always has an event bus").subscribe()
    }
}

pub struct TestBridge {
    pub state: BridgeState,
    pub hub: Arc<MockHub>,
    pub router: axum::Router,
    _shutdown_handle: bridge_task::ShutdownHandle,
}

impl TestBridge {
    pub fn new() -> Self {
        Self::with_conf_extra("")
    }

    /// `extra` is appended raw to the mock configuration JSON (leading comma
    /// included by the caller).
    pub fn with_conf_extra(extra: &str) -> Self {
        let conf_json = format!(
            r#"{{
                "InstanceId": "123e4567-e89b-12d3-a456-426614174000",
                "ClientId": "{TEST_CLIENT_ID}",
                "ClientSecret": "{TEST_SECRET}"
                {extra}
            }}"#
        );

        let conf_handle = ConfHandle::mock(&conf_json).expect("valid test configuration");
        let hub = Arc::new(MockHub::new());

        let (shutdown_handle, shutdown_signal) = bridge_task::ShutdownHandle::new();

        let state = BridgeState {
            conf_handle: conf_handle.clone(),
            hub: hub.clone(),
            nonce_cache: Arc::new(NonceCache::new()),
            rate_limiter: Arc::new(RateLimiter::new()),
            cameras: Arc::new(CameraManager::new(conf_handle.get_conf().snapshot_cache_ttl)),
            webrtc: Arc::new(WebRtcManager::new()),
            shutdown_signal,
        };

        let peer: SocketAddr = TEST_PEER.parse().expect("valid peer address");
        let router = smartly_bridge::make_http_service(state.clone()).layer(axum::Extension(ConnectInfo(peer)));

        Self {
            state,
            hub,
            router,
            _shutdown_handle: shutdown_handle,
        }
    }
}

pub fn signed_request(method: &str, path_and_query: &str, body: &[u8]) -> Request<Body> {
    signed_request_with(method, path_and_query, body, TEST_CLIENT_ID, TEST_SECRET)
}

pub fn signed_request_with(
    method: &str,
    path_and_query: &str,
    body: &[u8],
    client_id: &str,
    secret: &str,
) -> Request<Body> {
    let timestamp = OffsetDateTime::now_utc().unix_timestamp().to_string();
    let nonce = uuid::Uuid::new_v4().to_string();

    let canonical = auth::canonical_string(method, path_and_query, &timestamp, &nonce, body);
    let signature = auth::sign(secret.as_bytes(), &canonical);

    Request::builder()
        .method(method)
        .uri(path_and_query)
        .header("x-client-id", client_id)
        .header("x-timestamp", timestamp)
        .header("x-nonce", nonce)
        .header("x-signature", signature)
        .header("content-type", "application/json")
        .body(Body::from(body.to_vec()))
        .expect("valid request")
}

pub fn unsigned_request(method: &str, path_and_query: &str, body: &[u8]) -> Request<Body> {
    Request::builder()
        .method(method)
        .uri(path_and_query)
        .header("content-type", "application/json")
        .body(Body::from(body.to_vec()))
        .expect("valid request")
}

pub async fn call(bridge: &TestBridge, request: Request<Body>) -> (axum::http::StatusCode, Bytes) {
    let response = bridge.router.clone().oneshot(request).await.expect("infallible service");
    let status = response.status();
    let body = response.into_body().collect().await.expect("collectable body").to_bytes();
    (status, body)
}

pub async fn call_json(bridge: &TestBridge, request: Request<Body>) -> (axum::http::StatusCode, serde_json::Value) {
    let (status, body) = call(bridge, request).await;
    let value = if body.is_empty() {
        serde_json::Value::Null
    } else {
        serde_json::from_slice(&body).expect("JSON body")
    };
    (status, value)
}

/// Like `call` but also hands back the response headers.
pub async fn call_full(
    bridge: &TestBridge,
    request: Request<Body>,
) -> (axum::http::StatusCode, axum::http::HeaderMap, Bytes) {
    let response = bridge.router.clone().oneshot(request).await.expect("infallible service");
    let status = response.status();
    let headers = response.headers().clone();
    let body = response.into_body().collect().await.expect("collectable body").to_bytes();
    (status, headers, body)
}
