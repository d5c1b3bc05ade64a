//! WebRTC token and session tables.
//!
//! A token is a single-use capability issued to an authenticated client and
//! consumed by the SDP exchange; a session id is the post-SDP capability used
//! for ICE and hangup. Both are bound to one camera.

use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use base64::Engine as _;
use base64::engine::general_purpose::URL_SAFE_NO_PAD;
use bridge_task::{ShutdownSignal, Task};
use parking_lot::Mutex;
use rand::RngCore as _;
use time::OffsetDateTime;
use uuid::Uuid;

pub const TOKEN_TTL: Duration = Duration::from_secs(300);
pub const SESSION_IDLE_TIMEOUT: Duration = Duration::from_secs(600);
const SWEEP_INTERVAL: Duration = Duration::from_secs(60);
const TOKEN_BYTES: usize = 32;

#[derive(Debug, Clone)]
pub struct WebRtcToken {
    pub token: String,
    pub entity_id: String,
    pub client_id: String,
    pub created_at: OffsetDateTime,
    pub expires_at: OffsetDateTime,
    pub consumed: bool,
}

#[derive(Debug, Clone)]
pub struct WebRtcSession {
    pub session_id: String,
    pub entity_id: String,
    pub last_activity: OffsetDateTime,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TokenRejection {
    Unknown,
    Consumed,
    Expired,
    WrongEntity,
    WrongClient,
}

impl TokenRejection {
    pub fn as_str(self) -> &'static str {
        match self {
            TokenRejection::Unknown => "unknown token",
            TokenRejection::Consumed => "token already consumed",
            TokenRejection::Expired => "token expired",
            TokenRejection::WrongEntity => "token bound to another camera",
            TokenRejection::WrongClient => "token issued to another client",
        }
    }
}

pub struct WebRtcManager {
    tokens: Mutex<HashMap<String, WebRtcToken>>,
    sessions: Mutex<HashMap<String, WebRtcSession>>,
}

impl WebRtcManager {
    pub fn new() -> Self {
        Self {
            tokens: Mutex::new(HashMap::new()),
            sessions: Mutex::new(HashMap::new()),
        }
    }

    /// Allocates a fresh single-use token bound to `entity_id` and the
    /// issuing client.
    pub fn issue_token(&self, entity_id: &str, client_id: &str) -> WebRtcToken {
        let mut bytes = [0u8; TOKEN_BYTES];
        rand::rngs::OsRng.fill_bytes(&mut bytes);

        let created_at = OffsetDateTime::now_utc();
        let token = WebRtcToken {
            token: URL_SAFE_NO_PAD.encode(bytes),
            entity_id: entity_id.to_owned(),
            client_id: client_id.to_owned(),
            created_at,
            expires_at: created_at + TOKEN_TTL,
            consumed: false,
        };

        self.tokens.lock().insert(token.token.clone(), token.clone());

        token
    }

    /// Atomically validates and consumes a token. After a success any further
    /// use of the same token fails.
    pub fn consume_token(&self, token: &str, entity_id: &str, client_id: &str) -> Result<(), TokenRejection> {
        let mut tokens = self.tokens.lock();

        let entry = tokens.get_mut(token).ok_or(TokenRejection::Unknown)?;

        if entry.consumed {
            return Err(TokenRejection::Consumed);
        }
        if OffsetDateTime::now_utc() >= entry.expires_at {
            return Err(TokenRejection::Expired);
        }
        if entry.entity_id != entity_id {
            return Err(TokenRejection::WrongEntity);
        }
        if entry.client_id != client_id {
            return Err(TokenRejection::WrongClient);
        }

        entry.consumed = true;

        Ok(())
    }

    pub fn create_session(&self, entity_id: &str) -> WebRtcSession {
        let session = WebRtcSession {
            session_id: Uuid::new_v4().simple().to_string(),
            entity_id: entity_id.to_owned(),
            last_activity: OffsetDateTime::now_utc(),
        };

        self.sessions.lock().insert(session.session_id.clone(), session.clone());

        session
    }

    /// Refreshes `last_activity`. Fails when the session is unknown or bound
    /// to another camera.
    pub fn touch_session(&self, session_id: &str, entity_id: &str) -> bool {
        let mut sessions = self.sessions.lock();

        match sessions.get_mut(session_id) {
            Some(session) if session.entity_id == entity_id => {
                session.last_activity = OffsetDateTime::now_utc();
                true
            }
            _ => false,
        }
    }

    pub fn remove_session(&self, session_id: &str, entity_id: &str) -> bool {
        let mut sessions = self.sessions.lock();

        match sessions.get(session_id) {
            Some(session) if session.entity_id == entity_id => {
                sessions.remove(session_id);
                true
            }
            _ => false,
        }
    }

    pub fn sweep(&self, now: OffsetDateTime) {
        self.tokens.lock().retain(|_, token| now < token.expires_at);
        self.sessions
            .lock()
            .retain(|_, session| now - session.last_activity < SESSION_IDLE_TIMEOUT);
    }

    pub fn token_count(&self) -> usize {
        self.tokens.lock().len()
    }

    pub fn session_count(&self) -> usize {
        self.sessions.lock().len()
    }
}

impl Default for WebRtcManager {
    fn default() -> Self {
        Self::new()
    }
}

/// Drops expired tokens and idle sessions.
pub struct WebRtcSweeperTask {
    pub webrtc: Arc<WebRtcManager>,
}

#[async_trait]
impl Task for WebRtcSweeperTask {
    type Output = anyhow::Result<()>;

    const NAME: &'static str = "webrtc sweeper";

    async fn run(self, mut shutdown_signal: ShutdownSignal) -> Self::Output {
        debug!("Task started");

        loop {
            tokio::select! {
                _ = tokio::time::sleep(SWEEP_INTERVAL) => {}
                _ = shutdown_signal.wait() => {
                    break;
                }
            }

            self.webrtc.sweep(OffsetDateTime::now_utc());
            trace!(
                tokens = self.webrtc.token_count(),
                sessions = self.webrtc.session_count(),
                "Sweep complete",
            );
        }

        debug!("Task terminated");

        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn token_is_single_use() {
        let manager = WebRtcManager::new();
        let token = manager.issue_token("camera.porch", "smartly-abc");

        // 32 bytes of entropy, URL-safe encoding.
        assert!(token.token.len() >= 43);
        assert!(!token.consumed);

        assert_eq!(manager.consume_token(&token.token, "camera.porch", "smartly-abc"), Ok(()));
        assert_eq!(
            manager.consume_token(&token.token, "camera.porch", "smartly-abc"),
            Err(TokenRejection::Consumed)
        );
    }

    #[test]
    fn token_is_camera_and_client_bound() {
        let manager = WebRtcManager::new();
        let token = manager.issue_token("camera.porch", "smartly-abc");

        assert_eq!(
            manager.consume_token(&token.token, "camera.garage", "smartly-abc"),
            Err(TokenRejection::WrongEntity)
        );
        assert_eq!(
            manager.consume_token(&token.token, "camera.porch", "smartly-other"),
            Err(TokenRejection::WrongClient)
        );
        // The failed attempts must not have consumed it.
        assert_eq!(manager.consume_token(&token.token, "camera.porch", "smartly-abc"), Ok(()));
    }

    #[test]
    fn unknown_token_is_rejected() {
        let manager = WebRtcManager::new();
        assert_eq!(
            manager.consume_token("nope", "camera.porch", "smartly-abc"),
            Err(TokenRejection::Unknown)
        );
    }

    #[test]
    fn session_is_camera_bound() {
        let manager = WebRtcManager::new();
        let session = manager.create_session("camera.porch");

        assert!(manager.touch_session(&session.session_id, "camera.porch"));
        assert!(!manager.touch_session(&session.session_id, "camera.garage"));
        assert!(!manager.remove_session(&session.session_id, "camera.garage"));
        assert!(manager.remove_session(&session.session_id, "camera.porch"));
        assert!(!manager.touch_session(&session.session_id, "camera.porch"));
    }

    #[test]
    fn sweep_drops_expired_state() {
        let manager = WebRtcManager::new();
        let token = manager.issue_token("camera.porch", "smartly-abc");
        let session = manager.create_session("camera.porch");

        let now = OffsetDateTime::now_utc();

        manager.sweep(now);
        assert_eq!(manager.token_count(), 1);
        assert_eq!(manager.session_count(), 1);

        manager.sweep(now + TOKEN_TTL);
        assert_eq!(manager.token_count(), 0);
        assert_eq!(manager.session_count(), 1);

        manager.sweep(now + SESSION_IDLE_TIMEOUT);
        assert_eq!(manager.session_count(), 0);

        assert_eq!(
            manager.consume_token(&token.token, "camera.porch", "smartly-abc"),
            Err(TokenRejection::Unknown)
        );
        assert!(!manager.touch_session(&session.session_id, "camera.porch"));
    }
}
