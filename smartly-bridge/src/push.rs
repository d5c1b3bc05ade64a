//! Outbound push pipeline.
//!
//! One long-lived task owns the only subscription to the hub event bus, a
//! single buffer of queued events, the debounce timer and the heartbeat. It
//! signs every batch with the bridge credentials and delivers it to the
//! platform webhook with bounded retries.

use std::mem;
use std::time::Duration;

use anyhow::Context as _;
use async_trait::async_trait;
use bridge_task::{ShutdownSignal, Task};
use tokio::sync::broadcast;
use tokio::time::MissedTickBehavior;
use url::Url;

use crate::acl;
use crate::audit;
use crate::auth;
use crate::config::{Conf, ConfHandle};
use crate::hub::{DynHub, EntityState, StateChangedEvent};
use crate::utils;

const HEARTBEAT_INTERVAL: Duration = Duration::from_secs(60);
const DELIVERY_TIMEOUT: Duration = Duration::from_secs(10);
const MAX_DELIVERY_ATTEMPTS: u32 = 3;
const BACKOFF_SCHEDULE: [Duration; 3] = [Duration::from_secs(1), Duration::from_secs(2), Duration::from_secs(4)];
const RETRY_AFTER_CAP: Duration = Duration::from_secs(4);

/// Buffer bound: a platform outage must not grow memory without limit.
const MAX_BUFFERED_EVENTS: usize = 4096;

#[derive(Debug, Clone, Serialize)]
pub struct QueuedEvent {
    pub event_type: &'static str,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub entity_id: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub old_state: Option<serde_json::Value>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub new_state: Option<serde_json::Value>,
    pub timestamp: String,
}

impl QueuedEvent {
    pub fn state_changed(event: &StateChangedEvent) -> Self {
        Self {
            event_type: "state_changed",
            entity_id: Some(event.entity_id.clone()),
            old_state: event.old_state.as_ref().map(display_ready_state),
            new_state: event.new_state.as_ref().map(display_ready_state),
            timestamp: utils::format_rfc3339(event.timestamp),
        }
    }

    pub fn heartbeat() -> Self {
        Self {
            event_type: "heartbeat",
            entity_id: None,
            old_state: None,
            new_state: None,
            timestamp: utils::format_rfc3339(time::OffsetDateTime::now_utc()),
        }
    }
}

/// Renders a hub state with display-ready numeric values.
fn display_ready_state(state: &EntityState) -> serde_json::Value {
    let (class, unit) = acl::class_and_unit(&state.attributes);

    json!({
        "entity_id": state.entity_id,
        "state": acl::format_state(&state.state, class.as_deref(), unit.as_deref()),
        "attributes": acl::format_attributes(&state.attributes, class.as_deref(), unit.as_deref()),
        "last_changed": utils::format_rfc3339(state.last_changed),
        "last_updated": utils::format_rfc3339(state.last_updated),
    })
}

fn events_endpoint(webhook_url: &Url) -> Option<Url> {
    let base = webhook_url.as_str().trim_end_matches('/');
    format!("{base}/events").parse().ok()
}

enum AttemptOutcome {
    Delivered,
    RetryAfter(Duration),
    Failed,
}

async fn post_events(http: &reqwest::Client, conf: &Conf, endpoint: &Url, path_and_query: &str, body: &[u8]) -> AttemptOutcome {
    // The signature is recomputed per attempt so every POST carries a fresh
    // nonce and timestamp.
    let signed = auth::sign_outbound(&conf.client_secret, "POST", path_and_query, body);

    let result = http
        .post(endpoint.clone())
        .header(reqwest::header::CONTENT_TYPE, "application/json")
        .header("X-HA-Instance-Id", conf.instance_id.to_string())
        .header("X-Timestamp", &signed.timestamp)
        .header("X-Nonce", &signed.nonce)
        .header("X-Signature", &signed.signature)
        .body(body.to_vec())
        .send()
        .await;

    match result {
        Ok(response) if response.status().is_success() => AttemptOutcome::Delivered,
        Ok(response) => {
            let status = response.status();

            let retry_after = (status == reqwest::StatusCode::TOO_MANY_REQUESTS)
                .then(|| response.headers().get(reqwest::header::RETRY_AFTER))
                .flatten()
                .and_then(|value| value.to_str().ok())
                .and_then(|value| value.parse::<u64>().ok())
                .map(Duration::from_secs);

            debug!(%status, "Webhook refused the batch");

            match retry_after {
                Some(delay) => AttemptOutcome::RetryAfter(delay.min(RETRY_AFTER_CAP)),
                None => AttemptOutcome::Failed,
            }
        }
        Err(error) => {
            debug!(%error, "Webhook request failed");
            AttemptOutcome::Failed
        }
    }
}

/// Delivers one batch with up to `max_attempts` POSTs. Events are never
/// re-queued after the final failure; re-queueing would amplify into the next
/// batch during an outage.
async fn deliver_batch(http: &reqwest::Client, conf: &Conf, events: Vec<QueuedEvent>, max_attempts: u32) {
    if events.is_empty() {
        return;
    }

    let Some(webhook_url) = conf.webhook_url.as_ref() else {
        trace!("Webhook is not configured, ignore batch");
        return;
    };

    let Some(endpoint) = events_endpoint(webhook_url) else {
        warn!(%webhook_url, "Couldn't derive the events endpoint");
        return;
    };

    let path_and_query = endpoint.path().to_owned();

    let body = match serde_json::to_vec(&json!({ "events": events })) {
        Ok(body) => body,
        Err(error) => {
            error!(%error, "Failed to serialize the batch");
            return;
        }
    };

    let batch_len = events.len();
    let started = tokio::time::Instant::now();

    for attempt in 1..=max_attempts {
        let backoff = BACKOFF_SCHEDULE
            .get(attempt as usize - 1)
            .copied()
            .unwrap_or(RETRY_AFTER_CAP);

        match post_events(http, conf, &endpoint, &path_and_query, &body).await {
            AttemptOutcome::Delivered => {
                debug!(
                    batch_len,
                    attempt,
                    elapsed = ?started.elapsed(),
                    "Batch delivered",
                );
                audit::log_push("success", batch_len, attempt, None);
                return;
            }
            AttemptOutcome::RetryAfter(delay) => {
                tokio::time::sleep(delay.min(RETRY_AFTER_CAP)).await;
            }
            AttemptOutcome::Failed => {
                tokio::time::sleep(backoff).await;
            }
        }
    }

    error!(batch_len, attempts = max_attempts, "Batch dropped after delivery failures");
    audit::log_push("dropped", batch_len, max_attempts, Some("delivery failed"));
}

pub struct PushTask {
    pub conf_handle: ConfHandle,
    pub hub: DynHub,
}

#[async_trait]
impl Task for PushTask {
    type Output = anyhow::Result<()>;

    const NAME: &'static str = "push pipeline";

    async fn run(self, shutdown_signal: ShutdownSignal) -> Self::Output {
        push_task(self, shutdown_signal).await
    }
}

#[instrument(skip_all)]
async fn push_task(task: PushTask, mut shutdown_signal: ShutdownSignal) -> anyhow::Result<()> {
    let PushTask { conf_handle, hub } = task;

    debug!("Task started");

    let mut conf = conf_handle.get_conf();
    let mut rx = hub.subscribe_state_changes();

    let http = reqwest::Client::builder()
        .timeout(DELIVERY_TIMEOUT)
        .build()
        .context("failed to build the webhook HTTP client")?;

    let mut buffer: Vec<QueuedEvent> = Vec::new();

    let flush_timer = tokio::time::sleep(Duration::ZERO);
    tokio::pin!(flush_timer);
    let mut flush_armed = false;

    let mut heartbeat = tokio::time::interval_at(
        tokio::time::Instant::now() + HEARTBEAT_INTERVAL,
        HEARTBEAT_INTERVAL,
    );
    heartbeat.set_missed_tick_behavior(MissedTickBehavior::Delay);

    loop {
        tokio::select! {
            () = conf_handle.change_notified() => {
                conf = conf_handle.get_conf();
            }
            event = rx.recv() => {
                match event {
                    Ok(event) => {
                        if !acl::is_entity_allowed(&hub, &event.entity_id) {
                            continue;
                        }

                        if buffer.len() >= MAX_BUFFERED_EVENTS {
                            warn!("Push buffer is full, dropping the oldest event");
                            buffer.remove(0);
                        }

                        buffer.push(QueuedEvent::state_changed(&event));

                        if !flush_armed {
                            flush_timer.as_mut().reset(tokio::time::Instant::now() + conf.push_batch_interval);
                            flush_armed = true;
                        }
                    }
                    Err(broadcast::error::RecvError::Lagged(missed)) => {
                        warn!(missed, "Push subscription lagged, transitions were lost");
                    }
                    Err(broadcast::error::RecvError::Closed) => {
                        warn!("Hub event bus closed");
                        break;
                    }
                }
            }
            () = &mut flush_timer, if flush_armed => {
                flush_armed = false;
                let batch = mem::take(&mut buffer);
                deliver_batch(&http, &conf, batch, MAX_DELIVERY_ATTEMPTS).await;
            }
            // The heartbeat is its own solo batch and never touches the
            // state-change debounce.
            _ = heartbeat.tick() => {
                deliver_batch(&http, &conf, vec![QueuedEvent::heartbeat()], MAX_DELIVERY_ATTEMPTS).await;
            }
            () = shutdown_signal.wait() => {
                break;
            }
        }
    }

    // Best-effort flush of whatever is pending: a single attempt.
    if !buffer.is_empty() {
        debug!(pending = buffer.len(), "Flushing pending events before shutdown");
        let batch = mem::take(&mut buffer);
        deliver_batch(&http, &conf, batch, 1).await;
    }

    debug!("Task terminated");

    Ok(())
}
