//! Entity and service authorization plus the numeric display formatter.

use crate::hub::{DynHub, EntityEntry};

/// Registry label marking an entity as reachable by the platform.
pub const SMARTLY_LABEL: &str = "smartly";

/// Static per-domain action allow-list. An action missing from its domain's
/// list is rejected before the hub is ever reached.
const SERVICE_ALLOWLIST: &[(&str, &[&str])] = &[
    ("switch", &["turn_on", "turn_off", "toggle"]),
    ("light", &["turn_on", "turn_off", "toggle"]),
    ("cover", &["open_cover", "close_cover", "stop_cover", "set_cover_position"]),
    ("climate", &["set_temperature", "set_hvac_mode", "set_fan_mode"]),
    ("fan", &["turn_on", "turn_off", "set_percentage", "set_preset_mode"]),
    ("lock", &["lock", "unlock"]),
    ("scene", &["turn_on"]),
    ("script", &["turn_on", "turn_off"]),
    ("automation", &["trigger", "turn_on", "turn_off"]),
    (
        "camera",
        &[
            "enable_motion_detection",
            "disable_motion_detection",
            "record",
            "snapshot",
        ],
    ),
];

/// Decimal places for numeric sensor display, keyed by `(device_class, unit)`.
const DECIMAL_PLACES: &[((&str, &str), usize)] = &[
    (("current", "mA"), 1),
    (("current", "A"), 2),
    (("voltage", "V"), 2),
    (("voltage", "mV"), 0),
    (("power", "W"), 2),
    (("power", "kW"), 3),
    (("energy", "kWh"), 2),
    (("energy", "Wh"), 0),
    (("temperature", "°C"), 1),
    (("temperature", "°F"), 1),
    (("humidity", "%"), 1),
    (("battery", "%"), 0),
    (("pressure", "hPa"), 1),
    (("illuminance", "lx"), 0),
    (("power_factor", "%"), 0),
];

const DEFAULT_DECIMALS: usize = 2;

pub fn is_entity_allowed(hub: &DynHub, entity_id: &str) -> bool {
    hub.entity(entity_id)
        .is_some_and(|entry| entry.labels.iter().any(|label| label == SMARTLY_LABEL))
}

/// All registry entries carrying the allow-list label.
pub fn allowed_entities(hub: &DynHub) -> Vec<EntityEntry> {
    let mut entities: Vec<_> = hub
        .entities()
        .into_iter()
        .filter(|entry| entry.labels.iter().any(|label| label == SMARTLY_LABEL))
        .collect();
    entities.sort_by(|a, b| a.entity_id.cmp(&b.entity_id));
    entities
}

pub fn is_service_allowed(domain: &str, action: &str) -> bool {
    SERVICE_ALLOWLIST
        .iter()
        .find(|(d, _)| *d == domain)
        .is_some_and(|(_, actions)| actions.contains(&action))
}

/// Validates the `domain.object` shape: `^[a-z0-9_]+\.[a-z0-9_]+$`.
pub fn is_valid_entity_id(entity_id: &str) -> bool {
    let Some((domain, object)) = entity_id.split_once('.') else {
        return false;
    };

    let is_segment = |s: &str| !s.is_empty() && s.bytes().all(|b| b.is_ascii_lowercase() || b.is_ascii_digit() || b == b'_');

    is_segment(domain) && is_segment(object)
}

pub fn decimal_places(device_class: Option<&str>, unit: Option<&str>) -> usize {
    match (device_class, unit) {
        (Some(class), Some(unit)) => DECIMAL_PLACES
            .iter()
            .find(|((c, u), _)| *c == class && *u == unit)
            .map_or(DEFAULT_DECIMALS, |(_, places)| *places),
        _ => DEFAULT_DECIMALS,
    }
}

pub fn is_numeric_state(state: &str) -> bool {
    state.parse::<f64>().is_ok()
}

/// Formats a raw state string for display. Non-numeric states pass through.
pub fn format_state(state: &str, device_class: Option<&str>, unit: Option<&str>) -> String {
    match state.parse::<f64>() {
        Ok(value) => {
            let places = decimal_places(device_class, unit);
            format!("{value:.places$}")
        }
        Err(_) => state.to_owned(),
    }
}

/// Rounds fractional numeric attribute values to the entity's decimal places.
/// Integer-valued attributes are left untouched so counters and enumerations
/// keep their shape.
pub fn format_attributes(
    attributes: &serde_json::Map<String, serde_json::Value>,
    device_class: Option<&str>,
    unit: Option<&str>,
) -> serde_json::Map<String, serde_json::Value> {
    let places = decimal_places(device_class, unit);

    attributes
        .iter()
        .map(|(key, value)| {
            let value = match value.as_f64() {
                Some(number) if value.is_f64() && number.fract() != 0.0 => {
                    let factor = 10f64.powi(places.min(9) as i32);
                    serde_json::Value::from((number * factor).round() / factor)
                }
                _ => value.clone(),
            };
            (key.clone(), value)
        })
        .collect()
}

/// `(device_class, unit)` as read from a state's attributes.
pub fn class_and_unit(attributes: &serde_json::Map<String, serde_json::Value>) -> (Option<String>, Option<String>) {
    let class = attributes.get("device_class").and_then(|v| v.as_str()).map(str::to_owned);
    let unit = attributes
        .get("unit_of_measurement")
        .and_then(|v| v.as_str())
        .map(str::to_owned);
    (class, unit)
}
