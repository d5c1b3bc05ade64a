use axum::Json;
use axum::extract::State;
use bytes::Bytes;

use crate::BridgeState;
use crate::acl;
use crate::audit::{self, ControlAudit};
use crate::extract::ClientIdentity;
use crate::http::HttpError;
use crate::hub::HubError;
use crate::utils;

#[derive(Debug, Deserialize)]
pub(crate) struct Actor {
    pub(crate) user_id: Option<String>,
    pub(crate) role: Option<String>,
}

#[derive(Debug, Deserialize)]
pub(crate) struct ControlRequest {
    pub(crate) entity_id: String,
    pub(crate) action: String,
    #[serde(default)]
    pub(crate) service_data: serde_json::Map<String, serde_json::Value>,
    pub(crate) actor: Option<Actor>,
}

/// POST `/api/smartly/control` — invoke a permitted service on one entity and
/// return its post-call state.
pub(super) async fn post_control(
    State(state): State<BridgeState>,
    identity: ClientIdentity,
    body: Bytes,
) -> Result<Json<serde_json::Value>, HttpError> {
    // Malformed JSON and missing fields are distinct client errors.
    let parsed: serde_json::Value =
        serde_json::from_slice(&body).map_err(|_| HttpError::bad_request().kind("invalid_json"))?;

    let request: ControlRequest =
        serde_json::from_value(parsed).map_err(|_| HttpError::bad_request().kind("missing_required_fields"))?;

    let actor_user_id = request.actor.as_ref().and_then(|a| a.user_id.as_deref());
    let actor_role = request.actor.as_ref().and_then(|a| a.role.as_deref());

    let deny = |result: &'static str, error: HttpError| {
        audit::log_control(ControlAudit {
            client_id: &identity.client_id,
            entity_id: &request.entity_id,
            service: &request.action,
            result: "denied",
            actor_user_id,
            actor_role,
            source_ip: identity.source_ip,
            reason: Some(result),
        });
        error
    };

    if !acl::is_valid_entity_id(&request.entity_id) {
        return Err(deny("invalid_entity_id", HttpError::bad_request().kind("invalid_entity_id")));
    }

    if state.hub.entity(&request.entity_id).is_none() && state.hub.state(&request.entity_id).is_none() {
        return Err(deny("entity_not_found", HttpError::not_found().kind("entity_not_found")));
    }

    if !acl::is_entity_allowed(&state.hub, &request.entity_id) {
        return Err(deny("entity_not_allowed", HttpError::forbidden().kind("entity_not_allowed")));
    }

    let domain = request.entity_id.split('.').next().unwrap_or_default().to_owned();

    if !acl::is_service_allowed(&domain, &request.action) {
        return Err(deny("service_not_allowed", HttpError::forbidden().kind("service_not_allowed")));
    }

    // `service_data` passes through untouched except for the reserved key;
    // the hub's own schema is the arbiter of what is acceptable.
    let mut service_data = request.service_data.clone();
    service_data.remove("entity_id");
    service_data.insert("entity_id".to_owned(), serde_json::Value::from(request.entity_id.clone()));

    if let Err(error) = state.hub.call_service(&domain, &request.action, service_data).await {
        audit::log_control(ControlAudit {
            client_id: &identity.client_id,
            entity_id: &request.entity_id,
            service: &request.action,
            result: "error",
            actor_user_id,
            actor_role,
            source_ip: identity.source_ip,
            reason: Some("service_call_failed"),
        });

        return Err(match error {
            HubError::EntityNotFound(_) => HttpError::not_found().with_kind("entity_not_found").err()(error),
            HubError::Unavailable(_) => HttpError::service_unavailable().with_kind("service_unavailable").err()(error),
            // The raw hub detail lands in the log only; clients get the
            // stable kind.
            _ => HttpError::internal().with_kind("service_call_failed").err()(error),
        });
    }

    let new_state = state.hub.state(&request.entity_id);

    let (formatted_state, formatted_attributes) = match &new_state {
        Some(current) => {
            let (class, unit) = acl::class_and_unit(&current.attributes);
            (
                serde_json::Value::from(acl::format_state(&current.state, class.as_deref(), unit.as_deref())),
                serde_json::Value::Object(acl::format_attributes(&current.attributes, class.as_deref(), unit.as_deref())),
            )
        }
        None => (serde_json::Value::Null, serde_json::Value::Null),
    };

    audit::log_control(ControlAudit {
        client_id: &identity.client_id,
        entity_id: &request.entity_id,
        service: &request.action,
        result: "success",
        actor_user_id,
        actor_role,
        source_ip: identity.source_ip,
        reason: None,
    });

    Ok(Json(json!({
        "success": true,
        "entity_id": request.entity_id,
        "action": request.action,
        "new_state": formatted_state,
        "new_attributes": formatted_attributes,
        "timestamp": utils::format_rfc3339(time::OffsetDateTime::now_utc()),
    })))
}
