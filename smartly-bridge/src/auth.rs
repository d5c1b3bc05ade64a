//! Request authentication: source-IP policy, HMAC signature verification,
//! replay protection and rate limiting.

use std::collections::{HashMap, VecDeque};
use std::net::{IpAddr, SocketAddr};
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use axum::body::Body;
use axum::extract::{ConnectInfo, State};
use axum::http::{HeaderMap, HeaderName, HeaderValue, Method, Request};
use axum::middleware::Next;
use axum::response::Response;
use bridge_task::{ShutdownSignal, Task};
use hmac::{Hmac, Mac};
use ipnetwork::IpNetwork;
use parking_lot::Mutex;
use secrecy::ExposeSecret as _;
use sha2::{Digest, Sha256};
use time::OffsetDateTime;
use uuid::Uuid;

use crate::BridgeState;
use crate::audit;
use crate::config::{Conf, TrustProxyMode};
use crate::extract::ClientIdentity;
use crate::http::HttpError;

type HmacSha256 = Hmac<Sha256>;

pub const HEADER_CLIENT_ID: &str = "x-client-id";
pub const HEADER_TIMESTAMP: &str = "x-timestamp";
pub const HEADER_NONCE: &str = "x-nonce";
pub const HEADER_SIGNATURE: &str = "x-signature";

pub const TIMESTAMP_TOLERANCE_SECS: i64 = 30;
pub const NONCE_TTL: Duration = Duration::from_secs(300);
pub const RATE_LIMIT_WINDOW_SECS: i64 = 60;
pub const RATE_LIMIT_MAX_REQUESTS: usize = 60;

const SWEEP_INTERVAL: Duration = Duration::from_secs(60);

/// Upper bound on a signed request body. Signing requires buffering, so this
/// also bounds per-request memory.
const MAX_SIGNED_BODY_BYTES: usize = 1024 * 1024;

// -- canonical string & signature -- //

/// Builds the canonical byte string covered by the request signature:
///
/// ```text
/// METHOD \n PATH_WITH_QUERY \n TIMESTAMP \n NONCE \n SHA256_HEX(body)
/// ```
///
/// `path_and_query` must be the request target exactly as received; the
/// query string is never re-encoded.
pub fn canonical_string(method: &str, path_and_query: &str, timestamp: &str, nonce: &str, body: &[u8]) -> Vec<u8> {
    let body_digest = hex::encode(Sha256::digest(body));

    let mut canonical =
        Vec::with_capacity(method.len() + path_and_query.len() + timestamp.len() + nonce.len() + body_digest.len() + 4);
    canonical.extend_from_slice(method.as_bytes());
    canonical.push(b'\n');
    canonical.extend_from_slice(path_and_query.as_bytes());
    canonical.push(b'\n');
    canonical.extend_from_slice(timestamp.as_bytes());
    canonical.push(b'\n');
    canonical.extend_from_slice(nonce.as_bytes());
    canonical.push(b'\n');
    canonical.extend_from_slice(body_digest.as_bytes());
    canonical
}

pub fn sign(secret: &[u8], canonical: &[u8]) -> String {
    let mut mac = HmacSha256::new_from_slice(secret).expect("HMAC-SHA256 accepts keys of any length");
    mac.update(canonical);
    hex::encode(mac.finalize().into_bytes())
}

/// Timing-safe verification of a lowercase-hex signature.
pub fn verify_signature(secret: &[u8], canonical: &[u8], signature_hex: &str) -> bool {
    let Ok(presented) = hex::decode(signature_hex) else {
        return false;
    };

    let mut mac = HmacSha256::new_from_slice(secret).expect("HMAC-SHA256 accepts keys of any length");
    mac.update(canonical);
    mac.verify_slice(&presented).is_ok()
}

/// Header values attached to an outbound signed request (push pipeline).
pub struct OutboundAuth {
    pub timestamp: String,
    pub nonce: String,
    pub signature: String,
}

pub fn sign_outbound(secret: &secrecy::SecretString, method: &str, path_and_query: &str, body: &[u8]) -> OutboundAuth {
    let timestamp = OffsetDateTime::now_utc().unix_timestamp().to_string();
    let nonce = Uuid::new_v4().to_string();
    let canonical = canonical_string(method, path_and_query, &timestamp, &nonce, body);
    let signature = sign(secret.expose_secret().as_bytes(), &canonical);

    OutboundAuth {
        timestamp,
        nonce,
        signature,
    }
}

// -- source-IP resolution -- //

fn is_private_ip(ip: IpAddr) -> bool {
    match ip {
        IpAddr::V4(v4) => v4.is_private() || v4.is_loopback() || v4.is_link_local(),
        IpAddr::V6(v6) => v6.is_loopback() || (v6.segments()[0] & 0xfe00) == 0xfc00 || (v6.segments()[0] & 0xffc0) == 0xfe80,
    }
}

fn first_forwarded_for(headers: &HeaderMap) -> Option<IpAddr> {
    headers
        .get("x-forwarded-for")
        .and_then(|value| value.to_str().ok())
        .and_then(|value| value.split(',').next())
        .and_then(|first| first.trim().parse().ok())
}

/// Resolves the effective source IP under the configured trust-proxy policy.
///
/// `X-Forwarded-For` is trivially forgeable when the bridge is directly
/// reachable, so `auto` only honors it when the direct peer is itself
/// private-range and a public network is present in the allow-list (meaning a
/// reverse proxy is expected in front).
pub fn resolve_source_ip(peer: IpAddr, headers: &HeaderMap, mode: TrustProxyMode, allowed_cidrs: &[IpNetwork]) -> IpAddr {
    match mode {
        TrustProxyMode::Never => peer,
        TrustProxyMode::Always => first_forwarded_for(headers).unwrap_or(peer),
        TrustProxyMode::Auto => {
            let expects_proxy = is_private_ip(peer) && allowed_cidrs.iter().any(|net| !is_private_ip(net.network()));

            if expects_proxy {
                first_forwarded_for(headers).unwrap_or(peer)
            } else {
                peer
            }
        }
    }
}

// -- nonce cache -- //

/// Replay guard: `nonce → first_seen` with a TTL, swept periodically.
///
/// Intentionally not persisted; the timestamp tolerance is the backstop when
/// the process restarts.
pub struct NonceCache {
    entries: Mutex<HashMap<String, i64>>,
    ttl_secs: i64,
}

impl NonceCache {
    pub fn new() -> Self {
        Self {
            entries: Mutex::new(HashMap::new()),
            ttl_secs: NONCE_TTL.as_secs() as i64,
        }
    }

    /// Atomic test-and-insert. Returns `true` when the nonce is fresh.
    pub fn check_and_add(&self, nonce: &str, now: i64) -> bool {
        let mut entries = self.entries.lock();

        match entries.get(nonce) {
            Some(first_seen) if now - first_seen < self.ttl_secs => false,
            _ => {
                entries.insert(nonce.to_owned(), now);
                true
            }
        }
    }

    pub fn sweep(&self, now: i64) {
        self.entries.lock().retain(|_, first_seen| now - *first_seen < self.ttl_secs);
    }

    pub fn len(&self) -> usize {
        self.entries.lock().len()
    }
}

impl Default for NonceCache {
    fn default() -> Self {
        Self::new()
    }
}

// -- rate limiter -- //

#[derive(Debug, Clone, Copy)]
pub struct RateLimitStatus {
    pub limit: usize,
    pub remaining: usize,
}

#[derive(Debug, Clone, Copy)]
pub enum RateDecision {
    Admitted(RateLimitStatus),
    Limited { retry_after_secs: i64 },
}

/// Sliding-window request counter, one window per client id.
pub struct RateLimiter {
    windows: Mutex<HashMap<String, VecDeque<i64>>>,
}

impl RateLimiter {
    pub fn new() -> Self {
        Self {
            windows: Mutex::new(HashMap::new()),
        }
    }

    pub fn check(&self, client_id: &str, now: i64) -> RateDecision {
        let mut windows = self.windows.lock();
        let window = windows.entry(client_id.to_owned()).or_default();

        while window.front().is_some_and(|t| now - t >= RATE_LIMIT_WINDOW_SECS) {
            window.pop_front();
        }

        if window.len() >= RATE_LIMIT_MAX_REQUESTS {
            let oldest = window.front().copied().unwrap_or(now);
            let retry_after_secs = (oldest + RATE_LIMIT_WINDOW_SECS - now).max(1);
            return RateDecision::Limited { retry_after_secs };
        }

        window.push_back(now);

        RateDecision::Admitted(RateLimitStatus {
            limit: RATE_LIMIT_MAX_REQUESTS,
            remaining: RATE_LIMIT_MAX_REQUESTS - window.len(),
        })
    }

    pub fn sweep(&self, now: i64) {
        self.windows
            .lock()
            .retain(|_, window| window.back().is_some_and(|t| now - t < RATE_LIMIT_WINDOW_SECS));
    }
}

impl Default for RateLimiter {
    fn default() -> Self {
        Self::new()
    }
}

// -- verification -- //

pub struct SignedRequest<'a> {
    pub method: &'a str,
    pub path_and_query: &'a str,
    pub headers: &'a HeaderMap,
    pub body: &'a [u8],
    pub source_ip: IpAddr,
    pub now: i64,
}

#[derive(Debug)]
pub struct AuthDenied {
    pub kind: &'static str,
    pub retry_after_secs: Option<i64>,
}

impl AuthDenied {
    fn new(kind: &'static str) -> Self {
        Self {
            kind,
            retry_after_secs: None,
        }
    }

    #[track_caller]
    pub fn into_http_error(self) -> HttpError {
        if let Some(retry_after) = self.retry_after_secs {
            let header_num = |n: i64| HeaderValue::from_str(&n.to_string()).expect("integer header value");

            HttpError::too_many_requests()
                .kind(self.kind)
                .with_header(HeaderName::from_static("retry-after"), header_num(retry_after))
                .with_header(
                    HeaderName::from_static("x-ratelimit-limit"),
                    header_num(RATE_LIMIT_MAX_REQUESTS as i64),
                )
                .with_header(HeaderName::from_static("x-ratelimit-remaining"), header_num(0))
                .with_header(HeaderName::from_static("x-ratelimit-reset"), header_num(retry_after))
        } else {
            HttpError::unauthorized().kind(self.kind)
        }
    }
}

fn header_str<'a>(headers: &'a HeaderMap, name: &str) -> Option<&'a str> {
    headers.get(name).and_then(|value| value.to_str().ok())
}

/// Runs the fail-fast verification chain over an already-buffered request.
///
/// Order matters and is part of the contract: CIDR filter, header presence,
/// client id, timestamp skew, nonce freshness (test-and-insert), signature,
/// rate limit.
pub fn verify_request(
    conf: &Conf,
    nonces: &NonceCache,
    limiter: &RateLimiter,
    request: &SignedRequest<'_>,
) -> Result<RateLimitStatus, AuthDenied> {
    if !conf.allowed_cidrs.is_empty() && !conf.allowed_cidrs.iter().any(|net| net.contains(request.source_ip)) {
        return Err(AuthDenied::new("ip_not_allowed"));
    }

    let (Some(client_id), Some(timestamp_raw), Some(nonce), Some(signature)) = (
        header_str(request.headers, HEADER_CLIENT_ID),
        header_str(request.headers, HEADER_TIMESTAMP),
        header_str(request.headers, HEADER_NONCE),
        header_str(request.headers, HEADER_SIGNATURE),
    ) else {
        return Err(AuthDenied::new("missing_headers"));
    };

    if client_id != conf.client_id {
        return Err(AuthDenied::new("invalid_client_id"));
    }

    let timestamp: i64 = timestamp_raw.parse().map_err(|_| AuthDenied::new("invalid_timestamp"))?;
    if (request.now - timestamp).abs() > TIMESTAMP_TOLERANCE_SECS {
        return Err(AuthDenied::new("invalid_timestamp"));
    }

    if !nonces.check_and_add(nonce, request.now) {
        return Err(AuthDenied::new("nonce_reused"));
    }

    let canonical = canonical_string(request.method, request.path_and_query, timestamp_raw, nonce, request.body);
    if !verify_signature(conf.client_secret.expose_secret().as_bytes(), &canonical, signature) {
        return Err(AuthDenied::new("invalid_signature"));
    }

    match limiter.check(client_id, request.now) {
        RateDecision::Admitted(status) => Ok(status),
        RateDecision::Limited { retry_after_secs } => Err(AuthDenied {
            kind: "rate_limited",
            retry_after_secs: Some(retry_after_secs),
        }),
    }
}

// -- middleware -- //

struct AuthException {
    method: Method,
    prefix: &'static str,
    suffix: &'static str,
}

/// Routes whose capability is the WebRTC token or session id instead of the
/// HMAC header set.
const AUTH_EXCEPTIONS: &[AuthException] = &[
    AuthException {
        method: Method::POST,
        prefix: "/api/smartly/camera/",
        suffix: "/webrtc/offer",
    },
    AuthException {
        method: Method::POST,
        prefix: "/api/smartly/camera/",
        suffix: "/webrtc/ice",
    },
    AuthException {
        method: Method::POST,
        prefix: "/api/smartly/camera/",
        suffix: "/webrtc/hangup",
    },
];

pub async fn auth_middleware(
    State(state): State<BridgeState>,
    ConnectInfo(peer_addr): ConnectInfo<SocketAddr>,
    request: Request<Body>,
    next: Next,
) -> Result<Response, HttpError> {
    let method = request.method().clone();
    let uri_path = request.uri().path().to_owned();

    let skip_authentication = AUTH_EXCEPTIONS
        .iter()
        .any(|exception| method == exception.method && uri_path.starts_with(exception.prefix) && uri_path.ends_with(exception.suffix));

    if skip_authentication {
        trace!("session-capability route");
        return Ok(next.run(request).await);
    }

    let conf = state.conf_handle.get_conf();

    // The signature covers the request target exactly as received.
    let path_and_query = request
        .uri()
        .path_and_query()
        .map(|pq| pq.as_str().to_owned())
        .unwrap_or_else(|| uri_path.clone());

    let (parts, body) = request.into_parts();

    let body_bytes = axum::body::to_bytes(body, MAX_SIGNED_BODY_BYTES)
        .await
        .map_err(HttpError::bad_request().with_kind("invalid_json").err())?;

    let source_ip = resolve_source_ip(peer_addr.ip(), &parts.headers, conf.trust_proxy_mode, &conf.allowed_cidrs);
    let now = OffsetDateTime::now_utc().unix_timestamp();

    let signed_request = SignedRequest {
        method: parts.method.as_str(),
        path_and_query: &path_and_query,
        headers: &parts.headers,
        body: &body_bytes,
        source_ip,
        now,
    };

    if let Err(denied) = verify_request(&conf, &state.nonce_cache, &state.rate_limiter, &signed_request) {
        audit::log_deny(header_str(&parts.headers, HEADER_CLIENT_ID), source_ip, &uri_path, denied.kind);
        return Err(denied.into_http_error());
    }

    let mut request = Request::from_parts(parts, Body::from(body_bytes));

    request.extensions_mut().insert(ClientIdentity {
        client_id: conf.client_id.clone(),
        source_ip,
    });

    Ok(next.run(request).await)
}

// -- sweeper -- //

/// Periodically evicts expired nonces and idle rate windows.
pub struct AuthSweeperTask {
    pub nonce_cache: Arc<NonceCache>,
    pub rate_limiter: Arc<RateLimiter>,
}

#[async_trait]
impl Task for AuthSweeperTask {
    type Output = anyhow::Result<()>;

    const NAME: &'static str = "auth sweeper";

    async fn run(self, mut shutdown_signal: ShutdownSignal) -> Self::Output {
        debug!("Task started");

        loop {
            tokio::select! {
                _ = tokio::time::sleep(SWEEP_INTERVAL) => {}
                _ = shutdown_signal.wait() => {
                    break;
                }
            }

            let now = OffsetDateTime::now_utc().unix_timestamp();
            self.nonce_cache.sweep(now);
            self.rate_limiter.sweep(now);
            trace!(nonce_count = self.nonce_cache.len(), "Sweep complete");
        }

        debug!("Task terminated");

        Ok(())
    }
}
