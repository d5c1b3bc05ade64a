pub mod camera;
pub mod control;
pub mod history;
pub mod sync;
pub mod webrtc;

use axum::routing::{get, post};

pub fn make_router<S>(state: crate::BridgeState) -> axum::Router<S> {
    axum::Router::new()
        .route("/api/smartly/control", post(control::post_control))
        .route("/api/smartly/sync/structure", get(sync::get_structure))
        .route("/api/smartly/sync/states", get(sync::get_states))
        .route("/api/smartly/history/{entity_id}", get(history::get_history))
        .route("/api/smartly/history/batch", post(history::post_batch))
        .route("/api/smartly/history/statistics", post(history::post_statistics))
        .route("/api/smartly/camera/list", get(camera::get_list))
        .route("/api/smartly/camera/config", post(camera::post_config))
        .route("/api/smartly/camera/{entity_id}/snapshot", get(camera::get_snapshot))
        .route("/api/smartly/camera/{entity_id}/stream", get(camera::get_stream))
        .route("/api/smartly/camera/{entity_id}/stream/hls", get(camera::get_hls))
        .route("/api/smartly/camera/{entity_id}/webrtc", post(webrtc::post_token))
        .route("/api/smartly/camera/{entity_id}/webrtc/offer", post(webrtc::post_offer))
        .route("/api/smartly/camera/{entity_id}/webrtc/ice", post(webrtc::post_ice))
        .route("/api/smartly/camera/{entity_id}/webrtc/hangup", post(webrtc::post_hangup))
        .with_state(state)
}
