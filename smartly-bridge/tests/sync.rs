//! Topology and current-state read paths.

mod common;

use axum::http::StatusCode;

use common::{TestBridge, call_json, signed_request};
use smartly_bridge::hub::{AreaEntry, DeviceEntry, FloorEntry};

/// S3: one fully-linked entity and one orphan; the orphan lands under the
/// synthetic placeholders.
#[tokio::test]
async fn structure_tree_with_placeholders() {
    let bridge = TestBridge::new();

    bridge.hub.floors.lock().insert(
        "f1".to_owned(),
        FloorEntry {
            id: "f1".to_owned(),
            name: "First floor".to_owned(),
            level: Some(1),
            icon: None,
        },
    );
    bridge.hub.areas.lock().insert(
        "a1".to_owned(),
        AreaEntry {
            id: "a1".to_owned(),
            name: "Room 101".to_owned(),
            floor_id: Some("f1".to_owned()),
            icon: None,
        },
    );
    bridge.hub.devices.lock().insert(
        "d1".to_owned(),
        DeviceEntry {
            id: "d1".to_owned(),
            name: Some("Wall switch".to_owned()),
            area_id: Some("a1".to_owned()),
        },
    );

    bridge.hub.add_entity_full("switch.room_101_light", true, Some("d1"), None);
    bridge.hub.add_entity("sensor.unassigned_temp", true);
    // Not labeled: must not appear anywhere.
    bridge.hub.add_entity("switch.hidden", false);

    let (status, body) = call_json(&bridge, signed_request("GET", "/api/smartly/sync/structure", b"")).await;
    assert_eq!(status, StatusCode::OK);

    let floors = body["floors"].as_array().expect("floors array");
    assert_eq!(floors.len(), 2);

    assert_eq!(floors[0]["id"], "f1");
    assert_eq!(floors[0]["areas"][0]["id"], "a1");
    assert_eq!(floors[0]["areas"][0]["devices"][0]["id"], "d1");
    assert_eq!(
        floors[0]["areas"][0]["devices"][0]["entities"][0]["entity_id"],
        "switch.room_101_light"
    );

    assert_eq!(floors[1]["id"], "_unassigned");
    assert_eq!(floors[1]["areas"][0]["id"], "_unassigned");
    assert_eq!(floors[1]["areas"][0]["devices"][0]["id"], "_virtual");
    assert_eq!(
        floors[1]["areas"][0]["devices"][0]["entities"][0]["entity_id"],
        "sensor.unassigned_temp"
    );

    // Every allowed entity appears exactly once in the flat projection.
    let entities = body["entities"].as_array().expect("entities array");
    assert_eq!(entities.len(), 2);
    assert!(entities.iter().all(|e| e["entity_id"] != "switch.hidden"));
}

#[tokio::test]
async fn states_are_formatted_and_counted() {
    let bridge = TestBridge::new();

    bridge.hub.add_entity("sensor.bedroom_temp", true);
    bridge.hub.set_state(
        "sensor.bedroom_temp",
        "21.3333",
        serde_json::json!({ "device_class": "temperature", "unit_of_measurement": "°C" }),
    );

    bridge.hub.add_entity("light.bedroom", true);
    bridge.hub.set_state("light.bedroom", "on", serde_json::json!({}));

    // Known to the hub but not allowed.
    bridge.hub.add_entity("sensor.secret", false);
    bridge.hub.set_state("sensor.secret", "42", serde_json::json!({}));

    let (status, body) = call_json(&bridge, signed_request("GET", "/api/smartly/sync/states", b"")).await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(body["count"], 2);

    let states = body["states"].as_array().expect("states array");

    let temperature = states
        .iter()
        .find(|s| s["entity_id"] == "sensor.bedroom_temp")
        .expect("temperature state");
    assert_eq!(temperature["state"], "21.3");

    let light = states.iter().find(|s| s["entity_id"] == "light.bedroom").expect("light state");
    assert_eq!(light["state"], "on");
    assert_eq!(light["icon"], "mdi:lightbulb");
}
