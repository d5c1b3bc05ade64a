use axum::Json;
use axum::extract::State;

use crate::BridgeState;
use crate::acl;
use crate::extract::ClientIdentity;
use crate::http::HttpError;
use crate::topology;
use crate::utils;

/// GET `/api/smartly/sync/structure` — the topology tree for every allowed
/// entity. Read-only.
pub(super) async fn get_structure(
    State(state): State<BridgeState>,
    _identity: ClientIdentity,
) -> Result<Json<topology::Structure>, HttpError> {
    let allowed = acl::allowed_entities(&state.hub);
    let structure = topology::build_structure(&state.hub, &allowed);

    Ok(Json(structure))
}

/// GET `/api/smartly/sync/states` — flat current state for every allowed
/// entity, numeric sensors formatted for display.
pub(super) async fn get_states(
    State(state): State<BridgeState>,
    _identity: ClientIdentity,
) -> Result<Json<serde_json::Value>, HttpError> {
    let allowed = acl::allowed_entities(&state.hub);

    let mut states = Vec::with_capacity(allowed.len());

    for entry in &allowed {
        let Some(current) = state.hub.state(&entry.entity_id) else {
            continue;
        };

        let (class, unit) = acl::class_and_unit(&current.attributes);

        states.push(json!({
            "entity_id": entry.entity_id,
            "state": acl::format_state(&current.state, class.as_deref(), unit.as_deref()),
            "attributes": current.attributes,
            "last_changed": utils::format_rfc3339(current.last_changed),
            "last_updated": utils::format_rfc3339(current.last_updated),
            "icon": topology::resolve_icon(entry),
        }));
    }

    Ok(Json(json!({
        "count": states.len(),
        "states": states,
    })))
}
