//! History read paths: single entity, batch and period statistics.
//!
//! Attribute economy: within one entity's history array only the first entry
//! carries `attributes`; later entries repeat it only when the state value
//! changed type (numeric vs not). A missing `attributes` key means "unchanged
//! since the last emission that carried it". This is a transport optimization
//! and is intentionally invisible to the response schema.

use std::time::Duration;

use axum::Json;
use axum::extract::{Path, Query, State};
use base64::Engine as _;
use base64::engine::general_purpose::URL_SAFE_NO_PAD as BASE64_URL_SAFE;
use bytes::Bytes;
use time::OffsetDateTime;

use crate::BridgeState;
use crate::acl;
use crate::audit;
use crate::extract::ClientIdentity;
use crate::http::HttpError;
use crate::hub::{DynHub, HistoryQuery, HistoryRow, StatisticsPeriod, StatisticsQuery};
use crate::utils;

const MAX_WINDOW: Duration = Duration::from_secs(30 * 24 * 3600);
const DEFAULT_WINDOW: Duration = Duration::from_secs(24 * 3600);
const LONG_WINDOW_DEFAULT_LIMIT: usize = 1000;
const DEFAULT_PAGE_SIZE: usize = 100;
const MAX_PAGE_SIZE: usize = 1000;
const MAX_BATCH_ENTITIES: usize = 50;

#[derive(Debug, Deserialize)]
pub(crate) struct HistoryParams {
    start_time: Option<String>,
    end_time: Option<String>,
    limit: Option<usize>,
    significant_changes_only: Option<bool>,
    cursor: Option<String>,
    page_size: Option<usize>,
}

#[derive(Debug, Serialize, Deserialize)]
struct Cursor {
    last_timestamp: String,
    last_last_changed: String,
}

fn encode_cursor(row: &HistoryRow) -> String {
    let cursor = Cursor {
        last_timestamp: utils::format_rfc3339(row.last_updated),
        last_last_changed: utils::format_rfc3339(row.last_changed),
    };

    let json = serde_json::to_vec(&cursor).expect("cursor serialization is infallible");
    BASE64_URL_SAFE.encode(json)
}

fn decode_cursor(encoded: &str) -> Option<(OffsetDateTime, OffsetDateTime)> {
    let bytes = BASE64_URL_SAFE.decode(encoded).ok()?;
    let cursor: Cursor = serde_json::from_slice(&bytes).ok()?;

    Some((
        utils::parse_rfc3339(&cursor.last_timestamp)?,
        utils::parse_rfc3339(&cursor.last_last_changed)?,
    ))
}

struct TimeWindow {
    start: OffsetDateTime,
    end: OffsetDateTime,
}

impl TimeWindow {
    fn resolve(start_time: Option<&str>, end_time: Option<&str>) -> Result<Self, HttpError> {
        let now = OffsetDateTime::now_utc();

        let end = match end_time {
            Some(raw) => utils::parse_rfc3339(raw).ok_or_else(|| HttpError::bad_request().kind("invalid_time_range"))?,
            None => now,
        };

        let start = match start_time {
            Some(raw) => utils::parse_rfc3339(raw).ok_or_else(|| HttpError::bad_request().kind("invalid_time_range"))?,
            None => end - DEFAULT_WINDOW,
        };

        if end <= start {
            return Err(HttpError::bad_request().kind("invalid_time_range"));
        }
        if end - start > MAX_WINDOW {
            return Err(HttpError::bad_request().kind("invalid_time_range"));
        }

        Ok(Self { start, end })
    }

    fn is_short(&self) -> bool {
        self.end - self.start <= DEFAULT_WINDOW
    }
}

fn check_entity(state: &BridgeState, identity: &ClientIdentity, entity_id: &str) -> Result<(), HttpError> {
    if state.hub.entity(entity_id).is_none() && state.hub.state(entity_id).is_none() {
        return Err(HttpError::not_found().kind("entity_not_found"));
    }

    if !acl::is_entity_allowed(&state.hub, entity_id) {
        audit::log_deny(Some(&identity.client_id), identity.source_ip, entity_id, "entity_not_allowed");
        return Err(HttpError::forbidden().kind("entity_not_allowed"));
    }

    Ok(())
}

/// Runs the recorder query off the request path and returns rows newest-first
/// by `(last_updated, last_changed)`.
async fn query_recorder(hub: &DynHub, query: HistoryQuery) -> Result<Vec<HistoryRow>, HttpError> {
    let hub = hub.clone();

    let mut rows = tokio::task::spawn_blocking(move || hub.history(&query))
        .await
        .map_err(HttpError::internal().with_kind("internal_server_error").err())?
        .map_err(HttpError::internal().with_kind("history_query_failed").err())?;

    rows.sort_by(|a, b| (b.last_updated, b.last_changed).cmp(&(a.last_updated, a.last_changed)));

    Ok(rows)
}

fn history_entries(rows: &[HistoryRow]) -> Vec<serde_json::Value> {
    rows.iter()
        .enumerate()
        .map(|(index, row)| {
            let mut entry = json!({
                "state": row.state,
                "last_changed": utils::format_rfc3339(row.last_changed),
                "last_updated": utils::format_rfc3339(row.last_updated),
            });

            let type_changed = index > 0
                && acl::is_numeric_state(&rows[index - 1].state) != acl::is_numeric_state(&row.state);

            if index == 0 || type_changed {
                entry["attributes"] = serde_json::Value::Object(row.attributes.clone());
            }

            entry
        })
        .collect()
}

fn attr_from_rows(rows: &[HistoryRow], current: Option<&crate::hub::EntityState>, key: &str) -> Option<String> {
    rows.first()
        .and_then(|row| row.attributes.get(key).and_then(|v| v.as_str()).map(str::to_owned))
        .or_else(|| {
            rows.iter()
                .find_map(|row| row.attributes.get(key).and_then(|v| v.as_str()).map(str::to_owned))
        })
        .or_else(|| current.and_then(|state| state.attr_str(key).map(str::to_owned)))
}

fn build_metadata(hub: &DynHub, entity_id: &str, rows: &[HistoryRow]) -> serde_json::Value {
    let current = hub.state(entity_id);
    let domain = entity_id.split('.').next().unwrap_or_default();

    let device_class = attr_from_rows(rows, current.as_ref(), "device_class");
    let unit = attr_from_rows(rows, current.as_ref(), "unit_of_measurement");

    let friendly_name = current
        .as_ref()
        .and_then(|state| state.attr_str("friendly_name").map(str::to_owned))
        .or_else(|| hub.entity(entity_id).map(|entry| entry.display_name()));

    let is_numeric = rows
        .first()
        .map(|row| acl::is_numeric_state(&row.state))
        .or_else(|| current.as_ref().map(|state| acl::is_numeric_state(&state.state)))
        .unwrap_or(false);

    json!({
        "domain": domain,
        "device_class": device_class,
        "unit_of_measurement": unit,
        "friendly_name": friendly_name,
        "is_numeric": is_numeric,
        "decimal_places": acl::decimal_places(device_class.as_deref(), unit.as_deref()),
        "visualization": visualization_for(device_class.as_deref(), domain),
    })
}

fn visualization_rule(key: &str) -> Option<serde_json::Value> {
    let rule = match key {
        "current" => json!({"type": "chart", "chart_type": "line", "color": "#FFA726", "show_points": true, "interpolation": "linear"}),
        "voltage" => json!({"type": "chart", "chart_type": "line", "color": "#42A5F5", "show_points": true, "interpolation": "linear"}),
        "power" => json!({"type": "chart", "chart_type": "line", "color": "#EF5350", "show_points": false, "interpolation": "linear"}),
        "energy" => json!({"type": "chart", "chart_type": "bar", "color": "#26A69A"}),
        "temperature" => json!({"type": "chart", "chart_type": "line", "color": "#FF7043", "show_points": false, "interpolation": "linear"}),
        "humidity" => json!({"type": "chart", "chart_type": "line", "color": "#29B6F6", "show_points": false, "interpolation": "linear"}),
        "illuminance" => json!({"type": "chart", "chart_type": "line", "color": "#FFEE58", "show_points": false, "interpolation": "linear"}),
        "pressure" => json!({"type": "chart", "chart_type": "line", "color": "#8D6E63", "show_points": false, "interpolation": "linear"}),
        "battery" => json!({"type": "gauge", "min": 0, "max": 100, "color": "#9CCC65"}),
        "power_factor" => json!({"type": "gauge", "min": 0, "max": 1, "color": "#7E57C2"}),
        "switch" | "light" | "lock" | "binary_sensor" | "automation" | "script" => {
            json!({"type": "timeline", "on_color": "#66BB6A", "off_color": "#BDBDBD"})
        }
        _ => return None,
    };

    Some(rule)
}

/// Rule-table lookup: device class first, then domain, then a neutral line
/// chart.
fn visualization_for(device_class: Option<&str>, domain: &str) -> serde_json::Value {
    device_class
        .and_then(visualization_rule)
        .or_else(|| visualization_rule(domain))
        .unwrap_or_else(
            || json!({"type": "chart", "chart_type": "line", "color": "#90A4AE", "show_points": false, "interpolation": "linear"}),
        )
}

/// GET `/api/smartly/history/{entity_id}`
pub(super) async fn get_history(
    State(state): State<BridgeState>,
    identity: ClientIdentity,
    Path(entity_id): Path<String>,
    Query(params): Query<HistoryParams>,
) -> Result<Json<serde_json::Value>, HttpError> {
    check_entity(&state, &identity, &entity_id)?;

    let window = TimeWindow::resolve(params.start_time.as_deref(), params.end_time.as_deref())?;

    let cursor = match params.cursor.as_deref() {
        Some(encoded) => {
            Some(decode_cursor(encoded).ok_or_else(|| HttpError::bad_request().kind("invalid_cursor"))?)
        }
        None => None,
    };

    // In cursor mode the page size drives everything; `limit` and the long
    // window default are disabled.
    let limit = if cursor.is_some() {
        None
    } else {
        params
            .limit
            .or_else(|| (!window.is_short()).then_some(LONG_WINDOW_DEFAULT_LIMIT))
    };

    let query = HistoryQuery {
        entity_id: entity_id.clone(),
        start: window.start,
        end: window.end,
        limit: None,
        significant_changes_only: params.significant_changes_only.unwrap_or(true),
    };

    let rows = query_recorder(&state.hub, query).await?;

    let mut response = json!({
        "entity_id": entity_id,
        "start_time": utils::format_rfc3339(window.start),
        "end_time": utils::format_rfc3339(window.end),
        "metadata": build_metadata(&state.hub, &entity_id, &rows),
    });

    // A cursor continues a walk; a bare page_size starts one. Otherwise the
    // plain limit semantics apply.
    if cursor.is_some() || params.page_size.is_some() {
        let page_size = params.page_size.unwrap_or(DEFAULT_PAGE_SIZE).clamp(1, MAX_PAGE_SIZE);

        // Continuation starts strictly after the cursor key in newest-first
        // order, i.e. at the next older row.
        let remaining: Vec<&HistoryRow> = match cursor {
            Some((last_updated, last_changed)) => rows
                .iter()
                .filter(|row| (row.last_updated, row.last_changed) < (last_updated, last_changed))
                .collect(),
            None => rows.iter().collect(),
        };

        let page: Vec<HistoryRow> = remaining.iter().take(page_size).map(|row| (*row).clone()).collect();
        let has_more = remaining.len() > page.len();

        response["history"] = serde_json::Value::Array(history_entries(&page));
        response["count"] = serde_json::Value::from(page.len());
        response["page_size"] = serde_json::Value::from(page_size);
        response["has_more"] = serde_json::Value::from(has_more);

        if has_more {
            if let Some(last) = page.last() {
                response["next_cursor"] = serde_json::Value::from(encode_cursor(last));
            }
        }
    } else {
        let truncated: Vec<HistoryRow> = match limit {
            Some(limit) => rows.iter().take(limit).cloned().collect(),
            None => rows,
        };

        response["history"] = serde_json::Value::Array(history_entries(&truncated));
        response["count"] = serde_json::Value::from(truncated.len());
    }

    Ok(Json(response))
}

#[derive(Debug, Deserialize)]
pub(crate) struct BatchRequest {
    entity_ids: Vec<String>,
    start_time: Option<String>,
    end_time: Option<String>,
    limit: Option<usize>,
    significant_changes_only: Option<bool>,
}

/// POST `/api/smartly/history/batch`
pub(super) async fn post_batch(
    State(state): State<BridgeState>,
    identity: ClientIdentity,
    body: Bytes,
) -> Result<Json<serde_json::Value>, HttpError> {
    let parsed: serde_json::Value =
        serde_json::from_slice(&body).map_err(|_| HttpError::bad_request().kind("invalid_json"))?;
    let request: BatchRequest =
        serde_json::from_value(parsed).map_err(|_| HttpError::bad_request().kind("missing_required_fields"))?;

    if request.entity_ids.is_empty() {
        return Err(HttpError::bad_request().kind("missing_required_fields"));
    }
    if request.entity_ids.len() > MAX_BATCH_ENTITIES {
        return Err(HttpError::bad_request().kind("too_many_entities"));
    }

    let window = TimeWindow::resolve(request.start_time.as_deref(), request.end_time.as_deref())?;

    let limit = request
        .limit
        .or_else(|| (!window.is_short()).then_some(LONG_WINDOW_DEFAULT_LIMIT));

    let mut results = serde_json::Map::new();

    for entity_id in &request.entity_ids {
        if let Err(error) = check_entity(&state, &identity, entity_id) {
            results.insert(entity_id.clone(), json!({ "error": error.kind_str() }));
            continue;
        }

        let query = HistoryQuery {
            entity_id: entity_id.clone(),
            start: window.start,
            end: window.end,
            limit: None,
            significant_changes_only: request.significant_changes_only.unwrap_or(true),
        };

        let rows = query_recorder(&state.hub, query).await?;
        let truncated: Vec<HistoryRow> = match limit {
            Some(limit) => rows.iter().take(limit).cloned().collect(),
            None => rows,
        };

        results.insert(
            entity_id.clone(),
            json!({
                "history": history_entries(&truncated),
                "count": truncated.len(),
                "metadata": build_metadata(&state.hub, entity_id, &truncated),
            }),
        );
    }

    Ok(Json(json!({
        "results": results,
        "start_time": utils::format_rfc3339(window.start),
        "end_time": utils::format_rfc3339(window.end),
    })))
}

#[derive(Debug, Deserialize)]
pub(crate) struct StatisticsRequest {
    entity_ids: Vec<String>,
    start_time: Option<String>,
    end_time: Option<String>,
    period: String,
}

/// POST `/api/smartly/history/statistics` — aggregation is the recorder's
/// job; the bridge only authorizes and shapes.
pub(super) async fn post_statistics(
    State(state): State<BridgeState>,
    identity: ClientIdentity,
    body: Bytes,
) -> Result<Json<serde_json::Value>, HttpError> {
    let parsed: serde_json::Value =
        serde_json::from_slice(&body).map_err(|_| HttpError::bad_request().kind("invalid_json"))?;
    let request: StatisticsRequest =
        serde_json::from_value(parsed).map_err(|_| HttpError::bad_request().kind("missing_required_fields"))?;

    let period = StatisticsPeriod::parse(&request.period)
        .ok_or_else(|| HttpError::bad_request().kind("invalid_period"))?;

    if request.entity_ids.is_empty() {
        return Err(HttpError::bad_request().kind("missing_required_fields"));
    }
    if request.entity_ids.len() > MAX_BATCH_ENTITIES {
        return Err(HttpError::bad_request().kind("too_many_entities"));
    }

    let window = TimeWindow::resolve(request.start_time.as_deref(), request.end_time.as_deref())?;

    let mut errors = serde_json::Map::new();
    let mut queryable = Vec::new();

    for entity_id in &request.entity_ids {
        match check_entity(&state, &identity, entity_id) {
            Ok(()) => queryable.push(entity_id.clone()),
            Err(error) => {
                errors.insert(entity_id.clone(), json!({ "error": error.kind_str() }));
            }
        }
    }

    let query = StatisticsQuery {
        entity_ids: queryable,
        start: window.start,
        end: window.end,
        period,
    };

    let hub = state.hub.clone();
    let statistics = tokio::task::spawn_blocking(move || hub.statistics(&query))
        .await
        .map_err(HttpError::internal().with_kind("internal_server_error").err())?
        .map_err(HttpError::internal().with_kind("statistics_query_failed").err())?;

    Ok(Json(json!({
        "statistics": statistics,
        "errors": errors,
        "period": request.period,
        "start_time": utils::format_rfc3339(window.start),
        "end_time": utils::format_rfc3339(window.end),
    })))
}
