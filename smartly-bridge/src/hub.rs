//! Adapter boundary with the home-automation hub.
//!
//! The hub owns the registries, the state machine, the service bus, the
//! recorder and the camera subsystem. The bridge only ever talks to it
//! through the [`Hub`] trait so the whole HTTP surface can be exercised
//! against an in-memory double.

use std::collections::HashMap;
use std::sync::Arc;

use async_trait::async_trait;
use bytes::Bytes;
use futures::stream::BoxStream;
use time::OffsetDateTime;
use tokio::sync::broadcast;

pub type DynHub = Arc<dyn Hub>;

/// Byte stream of an upstream camera body, forwarded verbatim.
pub type CameraByteStream = BoxStream<'static, Result<Bytes, HubError>>;

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct EntityEntry {
    pub entity_id: String,
    pub name: Option<String>,
    pub original_name: Option<String>,
    pub icon: Option<String>,
    pub original_icon: Option<String>,
    pub device_id: Option<String>,
    pub area_id: Option<String>,
    pub labels: Vec<String>,
}

impl EntityEntry {
    /// First segment of the entity id.
    pub fn domain(&self) -> &str {
        self.entity_id.split('.').next().unwrap_or_default()
    }

    /// Display name, falling back on the registry original name and finally
    /// on the object part of the entity id.
    pub fn display_name(&self) -> String {
        self.name
            .clone()
            .or_else(|| self.original_name.clone())
            .unwrap_or_else(|| {
                self.entity_id
                    .split_once('.')
                    .map(|(_, object)| object.replace('_', " "))
                    .unwrap_or_else(|| self.entity_id.clone())
            })
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DeviceEntry {
    pub id: String,
    pub name: Option<String>,
    pub area_id: Option<String>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AreaEntry {
    pub id: String,
    pub name: String,
    pub floor_id: Option<String>,
    pub icon: Option<String>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct FloorEntry {
    pub id: String,
    pub name: String,
    pub level: Option<i32>,
    pub icon: Option<String>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct EntityState {
    pub entity_id: String,
    pub state: String,
    pub attributes: serde_json::Map<String, serde_json::Value>,
    #[serde(with = "time::serde::rfc3339")]
    pub last_changed: OffsetDateTime,
    #[serde(with = "time::serde::rfc3339")]
    pub last_updated: OffsetDateTime,
}

impl EntityState {
    pub fn attr_str(&self, key: &str) -> Option<&str> {
        self.attributes.get(key).and_then(|v| v.as_str())
    }
}

/// One transition observed on the hub event bus.
#[derive(Debug, Clone)]
pub struct StateChangedEvent {
    pub entity_id: String,
    pub old_state: Option<EntityState>,
    pub new_state: Option<EntityState>,
    pub timestamp: OffsetDateTime,
}

/// Recorder query for one entity over a bounded window.
#[derive(Debug, Clone)]
pub struct HistoryQuery {
    pub entity_id: String,
    pub start: OffsetDateTime,
    pub end: OffsetDateTime,
    pub limit: Option<usize>,
    pub significant_changes_only: bool,
}

/// One recorded state, as stored by the recorder.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct HistoryRow {
    pub state: String,
    pub attributes: serde_json::Map<String, serde_json::Value>,
    #[serde(with = "time::serde::rfc3339")]
    pub last_changed: OffsetDateTime,
    #[serde(with = "time::serde::rfc3339")]
    pub last_updated: OffsetDateTime,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum StatisticsPeriod {
    #[serde(rename = "5minute")]
    FiveMinute,
    Hour,
    Day,
    Week,
    Month,
}

impl StatisticsPeriod {
    pub fn parse(s: &str) -> Option<Self> {
        match s {
            "5minute" => Some(Self::FiveMinute),
            "hour" => Some(Self::Hour),
            "day" => Some(Self::Day),
            "week" => Some(Self::Week),
            "month" => Some(Self::Month),
            _ => None,
        }
    }
}

#[derive(Debug, Clone)]
pub struct StatisticsQuery {
    pub entity_ids: Vec<String>,
    pub start: OffsetDateTime,
    pub end: OffsetDateTime,
    pub period: StatisticsPeriod,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct StatisticsPoint {
    #[serde(with = "time::serde::rfc3339")]
    pub start: OffsetDateTime,
    #[serde(with = "time::serde::rfc3339")]
    pub end: OffsetDateTime,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub mean: Option<f64>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub min: Option<f64>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub max: Option<f64>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub sum: Option<f64>,
}

#[derive(Debug, thiserror::Error)]
pub enum HubError {
    #[error("entity not found: {0}")]
    EntityNotFound(String),
    #[error("service rejected the provided data: {0}")]
    InvalidServiceData(String),
    #[error("service call failed: {0}")]
    ServiceCall(String),
    #[error("recorder query failed: {0}")]
    Recorder(String),
    #[error("camera failure: {0}")]
    Camera(String),
    #[error("hub is not available: {0}")]
    Unavailable(String),
}

/// Stand-in adapter for running the bridge with no hub attached (bring-up
/// and diagnostics). Registries are empty and every operation fails with
/// `Unavailable`.
pub struct DetachedHub {
    events: broadcast::Sender<StateChangedEvent>,
}

impl DetachedHub {
    pub fn new() -> Self {
        let (events, _) = broadcast::channel(16);
        Self { events }
    }
}

impl Default for DetachedHub {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl Hub for DetachedHub {
    fn entity(&self, _entity_id: &str) -> Option<EntityEntry> {
        None
    }

    fn entities(&self) -> Vec<EntityEntry> {
        Vec::new()
    }

    fn device(&self, _device_id: &str) -> Option<DeviceEntry> {
        None
    }

    fn area(&self, _area_id: &str) -> Option<AreaEntry> {
        None
    }

    fn floor(&self, _floor_id: &str) -> Option<FloorEntry> {
        None
    }

    fn state(&self, _entity_id: &str) -> Option<EntityState> {
        None
    }

    async fn call_service(
        &self,
        _domain: &str,
        _service: &str,
        _data: serde_json::Map<String, serde_json::Value>,
    ) -> Result<(), HubError> {
        Err(HubError::Unavailable("no hub attached".to_owned()))
    }

    fn history(&self, _query: &HistoryQuery) -> Result<Vec<HistoryRow>, HubError> {
        Err(HubError::Unavailable("no hub attached".to_owned()))
    }

    fn statistics(&self, _query: &StatisticsQuery) -> Result<HashMap<String, Vec<StatisticsPoint>>, HubError> {
        Err(HubError::Unavailable("no hub attached".to_owned()))
    }

    async fn camera_snapshot(&self, _entity_id: &str) -> Result<Bytes, HubError> {
        Err(HubError::Camera("no hub attached".to_owned()))
    }

    async fn camera_stream(&self, _entity_id: &str) -> Result<CameraByteStream, HubError> {
        Err(HubError::Camera("no hub attached".to_owned()))
    }

    async fn camera_stream_source(&self, _entity_id: &str) -> Result<Option<String>, HubError> {
        Err(HubError::Unavailable("no hub attached".to_owned()))
    }

    fn subscribe_state_changes(&self) -> broadcast::Receiver<StateChangedEvent> {
        self.events.subscribe()
    }
}

/// Everything the bridge needs from the hub runtime.
///
/// Registry and state lookups are cheap in-memory reads on the hub side and
/// stay synchronous. Recorder queries hit the hub database and MUST be run
/// through `tokio::task::spawn_blocking`, never on the request path.
#[async_trait]
pub trait Hub: Send + Sync {
    // -- registries -- //

    fn entity(&self, entity_id: &str) -> Option<EntityEntry>;
    fn entities(&self) -> Vec<EntityEntry>;
    fn device(&self, device_id: &str) -> Option<DeviceEntry>;
    fn area(&self, area_id: &str) -> Option<AreaEntry>;
    fn floor(&self, floor_id: &str) -> Option<FloorEntry>;

    // -- state machine -- //

    fn state(&self, entity_id: &str) -> Option<EntityState>;

    // -- service bus -- //

    /// Invokes `domain.service` and waits for the call to complete.
    async fn call_service(
        &self,
        domain: &str,
        service: &str,
        data: serde_json::Map<String, serde_json::Value>,
    ) -> Result<(), HubError>;

    // -- recorder (blocking) -- //

    fn history(&self, query: &HistoryQuery) -> Result<Vec<HistoryRow>, HubError>;
    fn statistics(&self, query: &StatisticsQuery) -> Result<HashMap<String, Vec<StatisticsPoint>>, HubError>;

    // -- camera subsystem -- //

    async fn camera_snapshot(&self, entity_id: &str) -> Result<Bytes, HubError>;
    async fn camera_stream(&self, entity_id: &str) -> Result<CameraByteStream, HubError>;
    async fn camera_stream_source(&self, entity_id: &str) -> Result<Option<String>, HubError>;

    // -- event bus -- //

    /// Subscribes to state-change events. Dropping the receiver is the
    /// unsubscription.
    fn subscribe_state_changes(&self) -> broadcast::Receiver<StateChangedEvent>;
}
