#[macro_use]
extern crate tracing;
#[macro_use]
extern crate serde;
#[macro_use]
extern crate serde_json;

pub mod acl;
pub mod api;
pub mod audit;
pub mod auth;
pub mod camera;
pub mod config;
pub mod extract;
pub mod go2rtc;
pub mod http;
pub mod hub;
pub mod listener;
pub mod log;
pub mod push;
pub mod topology;
pub mod utils;
pub mod webrtc;

use std::sync::Arc;

/// Everything a request handler can reach. Lives exactly as long as the
/// bridge lifecycle; nothing in here is process-static.
#[derive(Clone)]
pub struct BridgeState {
    pub conf_handle: config::ConfHandle,
    pub hub: hub::DynHub,
    pub nonce_cache: Arc<auth::NonceCache>,
    pub rate_limiter: Arc<auth::RateLimiter>,
    pub cameras: Arc<camera::CameraManager>,
    pub webrtc: Arc<webrtc::WebRtcManager>,
    pub shutdown_signal: bridge_task::ShutdownSignal,
}

pub fn make_http_service(state: BridgeState) -> axum::Router<()> {
    trace!("make HTTP service");

    api::make_router(state.clone()).layer(axum::middleware::from_fn_with_state(state, auth::auth_middleware))
}
