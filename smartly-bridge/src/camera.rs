//! Camera registry, snapshot cache and HLS session bookkeeping.

use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use bridge_task::{ShutdownSignal, Task};
use bytes::Bytes;
use futures::TryStreamExt as _;
use parking_lot::Mutex;
use sha2::{Digest, Sha256};
use time::OffsetDateTime;
use uuid::Uuid;

use crate::config::dto::CameraConf;
use crate::hub::{CameraByteStream, DynHub, HubError};

/// Snapshots and streams fetched from a registered source use a short read
/// timeout so a dead camera can’t pin a request.
const UPSTREAM_FETCH_TIMEOUT: Duration = Duration::from_secs(10);
const SWEEP_INTERVAL: Duration = Duration::from_secs(60);
const MAX_CACHED_SNAPSHOTS: usize = 64;

/// A camera source registered by the platform. Credentials never leave
/// process memory.
#[derive(Debug, Clone)]
pub struct CameraConfig {
    pub entity_id: String,
    pub name: Option<String>,
    pub snapshot_url: Option<String>,
    pub stream_url: Option<String>,
    pub username: Option<String>,
    pub password: Option<String>,
    pub verify_ssl: bool,
    pub extra_headers: HashMap<String, String>,
}

impl From<CameraConf> for CameraConfig {
    fn from(conf: CameraConf) -> Self {
        Self {
            entity_id: conf.entity_id,
            name: conf.name,
            snapshot_url: conf.snapshot_url,
            stream_url: conf.stream_url,
            username: conf.username,
            password: conf.password,
            verify_ssl: conf.verify_ssl.unwrap_or(true),
            extra_headers: conf.extra_headers.unwrap_or_default(),
        }
    }
}

#[derive(Clone)]
pub struct CameraSnapshot {
    pub image: Bytes,
    pub content_type: String,
    pub captured_at: OffsetDateTime,
    pub etag: String,
}

#[derive(Debug, Clone, Serialize)]
pub struct HlsSession {
    pub stream_id: String,
    pub entity_id: String,
    #[serde(with = "time::serde::rfc3339")]
    pub started_at: OffsetDateTime,
    pub clients_connected: u32,
}

pub fn compute_etag(image: &[u8]) -> String {
    hex::encode(Sha256::digest(image))
}

pub struct CameraManager {
    configs: Mutex<HashMap<String, CameraConfig>>,
    snapshots: Mutex<HashMap<String, CameraSnapshot>>,
    hls_sessions: Mutex<HashMap<String, HlsSession>>,
    http: reqwest::Client,
    snapshot_ttl: Duration,
}

impl CameraManager {
    pub fn new(snapshot_ttl: Duration) -> Self {
        let http = reqwest::Client::builder()
            .timeout(UPSTREAM_FETCH_TIMEOUT)
            .build()
            .expect("failed to build the camera HTTP client");

        Self {
            configs: Mutex::new(HashMap::new()),
            snapshots: Mutex::new(HashMap::new()),
            hls_sessions: Mutex::new(HashMap::new()),
            http,
            snapshot_ttl,
        }
    }

    pub fn snapshot_ttl(&self) -> Duration {
        self.snapshot_ttl
    }

    // -- registry -- //

    pub fn register(&self, config: CameraConfig) {
        debug!(entity_id = %config.entity_id, "Camera registered");
        self.configs.lock().insert(config.entity_id.clone(), config);
    }

    pub fn unregister(&self, entity_id: &str) -> bool {
        self.snapshots.lock().remove(entity_id);
        self.configs.lock().remove(entity_id).is_some()
    }

    pub fn config(&self, entity_id: &str) -> Option<CameraConfig> {
        self.configs.lock().get(entity_id).cloned()
    }

    pub fn configs(&self) -> Vec<CameraConfig> {
        let mut configs: Vec<_> = self.configs.lock().values().cloned().collect();
        configs.sort_by(|a, b| a.entity_id.cmp(&b.entity_id));
        configs
    }

    pub fn seed(&self, seeds: impl IntoIterator<Item = CameraConf>) {
        for seed in seeds {
            self.register(CameraConfig::from(seed));
        }
    }

    // -- snapshot cache -- //

    pub fn clear_cache(&self) {
        self.snapshots.lock().clear();
    }

    pub fn cached_snapshot(&self, entity_id: &str, now: OffsetDateTime) -> Option<CameraSnapshot> {
        let snapshots = self.snapshots.lock();
        let snapshot = snapshots.get(entity_id)?;

        (now - snapshot.captured_at <= self.snapshot_ttl).then(|| snapshot.clone())
    }

    /// Returns the cached snapshot when fresh, otherwise fetches from the
    /// registered source (falling back on the hub camera API) and caches it.
    pub async fn snapshot(&self, hub: &DynHub, entity_id: &str, refresh: bool) -> Result<CameraSnapshot, HubError> {
        let now = OffsetDateTime::now_utc();

        if !refresh {
            if let Some(snapshot) = self.cached_snapshot(entity_id, now) {
                trace!(entity_id, "Snapshot served from cache");
                return Ok(snapshot);
            }
        }

        let (image, content_type) = match self.config(entity_id).filter(|c| c.snapshot_url.is_some()) {
            Some(config) => self.fetch_registered_snapshot(&config).await?,
            None => (hub.camera_snapshot(entity_id).await?, "image/jpeg".to_owned()),
        };

        let snapshot = CameraSnapshot {
            etag: compute_etag(&image),
            image,
            content_type,
            captured_at: now,
        };

        let mut snapshots = self.snapshots.lock();

        // Bounded cache: drop the stalest entry before inserting a new one.
        if snapshots.len() >= MAX_CACHED_SNAPSHOTS && !snapshots.contains_key(entity_id) {
            if let Some(stalest) = snapshots
                .iter()
                .min_by_key(|(_, s)| s.captured_at)
                .map(|(id, _)| id.clone())
            {
                snapshots.remove(&stalest);
            }
        }

        snapshots.insert(entity_id.to_owned(), snapshot.clone());

        Ok(snapshot)
    }

    fn client_for(&self, config: &CameraConfig) -> Result<reqwest::Client, HubError> {
        if config.verify_ssl {
            Ok(self.http.clone())
        } else {
            reqwest::Client::builder()
                .timeout(UPSTREAM_FETCH_TIMEOUT)
                .danger_accept_invalid_certs(true)
                .build()
                .map_err(|e| HubError::Camera(format!("failed to build camera HTTP client: {e}")))
        }
    }

    fn request_for(&self, config: &CameraConfig, url: &str) -> Result<reqwest::RequestBuilder, HubError> {
        let client = self.client_for(config)?;
        let mut request = client.get(url);

        if let Some(username) = &config.username {
            request = request.basic_auth(username, config.password.as_deref());
        }

        for (name, value) in &config.extra_headers {
            request = request.header(name, value);
        }

        Ok(request)
    }

    async fn fetch_registered_snapshot(&self, config: &CameraConfig) -> Result<(Bytes, String), HubError> {
        let url = config
            .snapshot_url
            .as_deref()
            .ok_or_else(|| HubError::Camera("no snapshot source".to_owned()))?;

        let response = self
            .request_for(config, url)?
            .send()
            .await
            .map_err(|e| HubError::Camera(format!("snapshot fetch failed: {e}")))?;

        if !response.status().is_success() {
            return Err(HubError::Camera(format!(
                "snapshot source answered {}",
                response.status()
            )));
        }

        let content_type = response
            .headers()
            .get(reqwest::header::CONTENT_TYPE)
            .and_then(|value| value.to_str().ok())
            .unwrap_or("image/jpeg")
            .to_owned();

        let image = response
            .bytes()
            .await
            .map_err(|e| HubError::Camera(format!("snapshot body read failed: {e}")))?;

        Ok((image, content_type))
    }

    /// Opens the upstream MJPEG body. Only body bytes flow back; the
    /// upstream status line and headers are consumed here.
    pub async fn stream(&self, hub: &DynHub, entity_id: &str) -> Result<CameraByteStream, HubError> {
        match self.config(entity_id).filter(|c| c.stream_url.is_some()) {
            Some(config) => {
                let url = config
                    .stream_url
                    .clone()
                    .ok_or_else(|| HubError::Camera("no stream source".to_owned()))?;

                // Reading an endless body must not trip the request timeout.
                let response = self
                    .request_for(&config, &url)?
                    .timeout(Duration::from_secs(3600 * 24))
                    .send()
                    .await
                    .map_err(|e| HubError::Camera(format!("stream open failed: {e}")))?;

                if !response.status().is_success() {
                    return Err(HubError::Camera(format!("stream source answered {}", response.status())));
                }

                let stream = response
                    .bytes_stream()
                    .map_err(|e| HubError::Camera(format!("stream read failed: {e}")));

                Ok(Box::pin(stream))
            }
            None => hub.camera_stream(entity_id).await,
        }
    }

    pub fn sweep(&self, now: OffsetDateTime) {
        self.snapshots
            .lock()
            .retain(|_, snapshot| now - snapshot.captured_at <= self.snapshot_ttl);
    }

    // -- HLS bookkeeping -- //

    pub fn hls_start(&self, entity_id: &str) -> HlsSession {
        let mut sessions = self.hls_sessions.lock();

        match sessions.get_mut(entity_id) {
            Some(session) => {
                session.clients_connected += 1;
                session.clone()
            }
            None => {
                let session = HlsSession {
                    stream_id: Uuid::new_v4().simple().to_string(),
                    entity_id: entity_id.to_owned(),
                    started_at: OffsetDateTime::now_utc(),
                    clients_connected: 1,
                };
                sessions.insert(entity_id.to_owned(), session.clone());
                session
            }
        }
    }

    pub fn hls_stop(&self, entity_id: &str) -> bool {
        self.hls_sessions.lock().remove(entity_id).is_some()
    }

    pub fn hls_session(&self, entity_id: &str) -> Option<HlsSession> {
        self.hls_sessions.lock().get(entity_id).cloned()
    }

    pub fn hls_sessions(&self) -> Vec<HlsSession> {
        let mut sessions: Vec<_> = self.hls_sessions.lock().values().cloned().collect();
        sessions.sort_by(|a, b| a.entity_id.cmp(&b.entity_id));
        sessions
    }
}

/// Periodically drops expired snapshots.
pub struct SnapshotSweeperTask {
    pub cameras: Arc<CameraManager>,
}

#[async_trait]
impl Task for SnapshotSweeperTask {
    type Output = anyhow::Result<()>;

    const NAME: &'static str = "snapshot sweeper";

    async fn run(self, mut shutdown_signal: ShutdownSignal) -> Self::Output {
        debug!("Task started");

        loop {
            tokio::select! {
                _ = tokio::time::sleep(SWEEP_INTERVAL) => {}
                _ = shutdown_signal.wait() => {
                    break;
                }
            }

            self.cameras.sweep(OffsetDateTime::now_utc());
        }

        debug!("Task terminated");

        Ok(())
    }
}
