//! Client for the local go2rtc media server.
//!
//! go2rtc is an opaque collaborator: the bridge brokers SDP/ICE between the
//! platform and this process and never inspects the media itself.

use std::time::Duration;

use reqwest::StatusCode;
use url::Url;

const OPERATION_TIMEOUT: Duration = Duration::from_secs(10);

#[derive(Debug, thiserror::Error)]
pub enum Go2RtcError {
    #[error("go2rtc is not reachable: {0}")]
    Unreachable(reqwest::Error),
    #[error("go2rtc operation timed out")]
    Timeout,
    #[error("go2rtc answered {0}")]
    Status(StatusCode),
    #[error("go2rtc answer is malformed")]
    Malformed,
}

impl Go2RtcError {
    fn from_send_error(error: reqwest::Error) -> Self {
        if error.is_timeout() {
            Go2RtcError::Timeout
        } else {
            Go2RtcError::Unreachable(error)
        }
    }
}

#[derive(Debug, Deserialize)]
struct WebRtcAnswer {
    #[serde(rename = "type")]
    kind: String,
    sdp: String,
}

pub struct Go2RtcClient {
    base_url: Url,
    http: reqwest::Client,
}

impl Go2RtcClient {
    pub fn new(base_url: Url) -> Self {
        let http = reqwest::Client::builder()
            .timeout(OPERATION_TIMEOUT)
            .build()
            .expect("failed to build the go2rtc HTTP client");

        Self { base_url, http }
    }

    fn endpoint(&self, path: &str) -> Result<Url, Go2RtcError> {
        self.base_url.join(path).map_err(|_| Go2RtcError::Malformed)
    }

    /// Exchanges an SDP offer for the camera stream named `entity_id`.
    ///
    /// When go2rtc doesn't know the stream yet (404), it is registered from
    /// `stream_source` and the exchange is retried once.
    pub async fn webrtc_offer(&self, entity_id: &str, stream_source: &str, sdp: &str) -> Result<String, Go2RtcError> {
        let response = self.post_offer(entity_id, sdp).await?;

        let response = if response.status() == StatusCode::NOT_FOUND {
            debug!(entity_id, "Stream unknown to go2rtc, registering it");
            self.register_stream(entity_id, stream_source).await?;
            self.post_offer(entity_id, sdp).await?
        } else {
            response
        };

        if !response.status().is_success() {
            return Err(Go2RtcError::Status(response.status()));
        }

        let answer: WebRtcAnswer = response.json().await.map_err(|_| Go2RtcError::Malformed)?;

        if answer.kind != "answer" || answer.sdp.is_empty() {
            return Err(Go2RtcError::Malformed);
        }

        Ok(answer.sdp)
    }

    async fn post_offer(&self, entity_id: &str, sdp: &str) -> Result<reqwest::Response, Go2RtcError> {
        let mut url = self.endpoint("/api/webrtc")?;
        url.query_pairs_mut().append_pair("src", entity_id);

        self.http
            .post(url)
            .json(&json!({ "type": "offer", "sdp": sdp }))
            .send()
            .await
            .map_err(Go2RtcError::from_send_error)
    }

    pub async fn register_stream(&self, name: &str, source: &str) -> Result<(), Go2RtcError> {
        let mut url = self.endpoint("/api/streams")?;
        url.query_pairs_mut().append_pair("name", name).append_pair("src", source);

        let response = self
            .http
            .put(url)
            .send()
            .await
            .map_err(Go2RtcError::from_send_error)?;

        if response.status().is_success() {
            Ok(())
        } else {
            Err(Go2RtcError::Status(response.status()))
        }
    }

    /// Forwards a trickle ICE candidate for the given stream.
    pub async fn add_ice_candidate(
        &self,
        entity_id: &str,
        candidate: &serde_json::Value,
    ) -> Result<(), Go2RtcError> {
        let mut url = self.endpoint("/api/webrtc/candidate")?;
        url.query_pairs_mut().append_pair("src", entity_id);

        let response = self
            .http
            .post(url)
            .json(candidate)
            .send()
            .await
            .map_err(Go2RtcError::from_send_error)?;

        if response.status().is_success() {
            Ok(())
        } else {
            Err(Go2RtcError::Status(response.status()))
        }
    }

    /// Best-effort close notification; failures are the caller's to log.
    pub async fn close(&self, entity_id: &str) -> Result<(), Go2RtcError> {
        let mut url = self.endpoint("/api/webrtc")?;
        url.query_pairs_mut().append_pair("src", entity_id);

        let response = self
            .http
            .delete(url)
            .send()
            .await
            .map_err(Go2RtcError::from_send_error)?;

        if response.status().is_success() {
            Ok(())
        } else {
            Err(Go2RtcError::Status(response.status()))
        }
    }
}
