//! Assembly of the floors → areas → devices → entities tree.

use std::collections::BTreeMap;

use crate::hub::{DynHub, EntityEntry};

/// Identifier used for the synthetic floor, area and device an entity is
/// attached to when a registry link is missing.
pub const UNASSIGNED_ID: &str = "_unassigned";
pub const VIRTUAL_DEVICE_ID: &str = "_virtual";

const UNASSIGNED_AREA_NAME: &str = "Unassigned";
const UNASSIGNED_FLOOR_NAME: &str = "No Floor";

/// Fallback icons per domain, applied when the registry has none.
const DOMAIN_ICONS: &[(&str, &str)] = &[
    ("light", "mdi:lightbulb"),
    ("switch", "mdi:toggle-switch"),
    ("cover", "mdi:window-shutter"),
    ("climate", "mdi:thermostat"),
    ("fan", "mdi:fan"),
    ("lock", "mdi:lock"),
    ("scene", "mdi:palette"),
    ("script", "mdi:script-text"),
    ("automation", "mdi:robot"),
    ("camera", "mdi:video"),
    ("sensor", "mdi:eye"),
    ("binary_sensor", "mdi:checkbox-marked-circle"),
];

#[derive(Debug, Clone, Serialize)]
pub struct EntityNode {
    pub entity_id: String,
    pub domain: String,
    pub name: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub icon: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub device_id: Option<String>,
    pub area_id: String,
    pub floor_id: String,
}

#[derive(Debug, Clone, Serialize)]
pub struct DeviceNode {
    pub id: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub name: Option<String>,
    pub entities: Vec<EntityNode>,
}

#[derive(Debug, Clone, Serialize)]
pub struct AreaNode {
    pub id: String,
    pub name: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub icon: Option<String>,
    pub devices: Vec<DeviceNode>,
}

#[derive(Debug, Clone, Serialize)]
pub struct FloorNode {
    pub id: String,
    pub name: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub level: Option<i32>,
    pub areas: Vec<AreaNode>,
}

#[derive(Debug, Clone, Serialize)]
pub struct DeviceRef {
    pub id: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub name: Option<String>,
    pub area_id: String,
}

#[derive(Debug, Clone, Serialize)]
pub struct AreaRef {
    pub id: String,
    pub name: String,
    pub floor_id: String,
}

#[derive(Debug, Clone, Serialize)]
pub struct FloorRef {
    pub id: String,
    pub name: String,
}

/// The nested tree is the primary payload; the flat arrays are convenience
/// projections carrying foreign keys.
#[derive(Debug, Clone, Serialize)]
pub struct Structure {
    pub floors: Vec<FloorNode>,
    pub areas: Vec<AreaRef>,
    pub devices: Vec<DeviceRef>,
    pub entities: Vec<EntityNode>,
}

pub fn resolve_icon(entry: &EntityEntry) -> Option<String> {
    if entry.icon.is_some() {
        return entry.icon.clone();
    }
    if entry.original_icon.is_some() {
        return entry.original_icon.clone();
    }
    DOMAIN_ICONS
        .iter()
        .find(|(domain, _)| *domain == entry.domain())
        .map(|(_, icon)| (*icon).to_owned())
}

struct Placement {
    floor_id: String,
    area_id: String,
    device_id: String,
}

fn place(hub: &DynHub, entry: &EntityEntry) -> Placement {
    let device = entry.device_id.as_deref().and_then(|id| hub.device(id));

    // An entity-level area assignment overrides the device's.
    let area_id = entry
        .area_id
        .clone()
        .or_else(|| device.as_ref().and_then(|d| d.area_id.clone()));

    let area = area_id.as_deref().and_then(|id| hub.area(id));

    let floor_id = area
        .as_ref()
        .and_then(|a| a.floor_id.clone())
        .filter(|id| hub.floor(id).is_some())
        .unwrap_or_else(|| UNASSIGNED_ID.to_owned());

    Placement {
        floor_id,
        area_id: area.map_or_else(|| UNASSIGNED_ID.to_owned(), |a| a.id),
        device_id: device.map_or_else(|| VIRTUAL_DEVICE_ID.to_owned(), |d| d.id),
    }
}

/// Builds the topology for the given allowed entities. Every entity appears
/// exactly once; broken registry links land under the synthetic placeholders.
pub fn build_structure(hub: &DynHub, allowed: &[EntityEntry]) -> Structure {
    // floor -> area -> device -> entities, keyed by id for determinism.
    let mut tree: BTreeMap<String, BTreeMap<String, BTreeMap<String, Vec<EntityNode>>>> = BTreeMap::new();

    for entry in allowed {
        let placement = place(hub, entry);

        let node = EntityNode {
            entity_id: entry.entity_id.clone(),
            domain: entry.domain().to_owned(),
            name: entry.display_name(),
            icon: resolve_icon(entry),
            device_id: entry.device_id.clone(),
            area_id: placement.area_id.clone(),
            floor_id: placement.floor_id.clone(),
        };

        tree.entry(placement.floor_id)
            .or_default()
            .entry(placement.area_id)
            .or_default()
            .entry(placement.device_id)
            .or_default()
            .push(node);
    }

    let mut floors = Vec::new();
    let mut flat_areas = Vec::new();
    let mut flat_devices = Vec::new();
    let mut flat_entities = Vec::new();

    // Synthetic placeholders are emitted after the real topology.
    let mut floor_ids: Vec<String> = tree.keys().filter(|id| *id != UNASSIGNED_ID).cloned().collect();
    if tree.contains_key(UNASSIGNED_ID) {
        floor_ids.push(UNASSIGNED_ID.to_owned());
    }

    for floor_id in floor_ids {
        let areas_map = tree.remove(&floor_id).unwrap_or_default();
        let floor_entry = hub.floor(&floor_id);

        let mut area_ids: Vec<String> = areas_map.keys().filter(|id| *id != UNASSIGNED_ID).cloned().collect();
        if areas_map.contains_key(UNASSIGNED_ID) {
            area_ids.push(UNASSIGNED_ID.to_owned());
        }

        let mut areas = Vec::new();

        for area_id in area_ids {
            let devices_map = areas_map.get(&area_id).cloned().unwrap_or_default();
            let area_entry = hub.area(&area_id);

            let mut devices = Vec::new();

            for (device_id, entities) in devices_map {
                let device_entry = hub.device(&device_id);
                let device_name = device_entry.as_ref().and_then(|d| d.name.clone());

                flat_devices.push(DeviceRef {
                    id: device_id.clone(),
                    name: device_name.clone(),
                    area_id: area_id.clone(),
                });
                flat_entities.extend(entities.iter().cloned());

                devices.push(DeviceNode {
                    id: device_id,
                    name: device_name,
                    entities,
                });
            }

            let area_name = area_entry
                .as_ref()
                .map(|a| a.name.clone())
                .unwrap_or_else(|| UNASSIGNED_AREA_NAME.to_owned());

            flat_areas.push(AreaRef {
                id: area_id.clone(),
                name: area_name.clone(),
                floor_id: floor_id.clone(),
            });

            areas.push(AreaNode {
                id: area_id,
                name: area_name,
                icon: area_entry.and_then(|a| a.icon),
                devices,
            });
        }

        floors.push(FloorNode {
            id: floor_id.clone(),
            name: floor_entry
                .as_ref()
                .map(|f| f.name.clone())
                .unwrap_or_else(|| UNASSIGNED_FLOOR_NAME.to_owned()),
            level: floor_entry.and_then(|f| f.level),
            areas,
        });
    }

    Structure {
        floors,
        areas: flat_areas,
        devices: flat_devices,
        entities: flat_entities,
    }
}
