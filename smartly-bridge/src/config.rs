use std::env;
use std::fs::File;
use std::io::BufReader;
use std::sync::Arc;
use std::time::Duration;

use anyhow::Context;
use base64::Engine as _;
use base64::engine::general_purpose::URL_SAFE_NO_PAD;
use camino::{Utf8Path, Utf8PathBuf};
use cfg_if::cfg_if;
use ipnetwork::IpNetwork;
use rand::RngCore as _;
use secrecy::{ExposeSecret as _, SecretString};
use tap::prelude::*;
use tokio::sync::Notify;
use url::Url;
use uuid::Uuid;

pub const CLIENT_ID_PREFIX: &str = "smartly-";
const CLIENT_SECRET_BYTES: usize = 48;
const DEFAULT_PUSH_BATCH_INTERVAL: Duration = Duration::from_millis(500);
const DEFAULT_SNAPSHOT_CACHE_TTL: Duration = Duration::from_secs(30);
const DEFAULT_LISTENER_URL: &str = "http://0.0.0.0:8099";
const DEFAULT_GO2RTC_URL: &str = "http://localhost:1984";

cfg_if! {
    if #[cfg(target_os = "windows")] {
        const APPLICATION_DIR: &str = "Smartly\\Bridge";
    } else if #[cfg(target_os = "macos")] {
        const APPLICATION_DIR: &str = "Smartly Bridge";
    } else {
        const APPLICATION_DIR: &str = "smartly-bridge";
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Default)]
#[serde(rename_all = "lowercase")]
pub enum TrustProxyMode {
    /// Honor `X-Forwarded-For` only when the direct peer is private-range and
    /// a public network is configured in the allow-list.
    #[default]
    Auto,
    Always,
    Never,
}

/// Runtime configuration, validated from the on-disk [`dto::ConfFile`].
/// Shared behind an `Arc`; handlers must not hold it across await points
/// when freshness matters.
#[derive(Debug)]
pub struct Conf {
    pub instance_id: Uuid,
    pub client_id: String,
    pub client_secret: SecretString,
    pub allowed_cidrs: Vec<IpNetwork>,
    pub webhook_url: Option<Url>,
    pub push_batch_interval: Duration,
    pub trust_proxy_mode: TrustProxyMode,
    pub turn: Option<dto::TurnServerConf>,
    pub go2rtc_url: Url,
    pub listener_url: Url,
    pub snapshot_cache_ttl: Duration,
    pub cameras: Vec<dto::CameraConf>,
    pub log_file: Utf8PathBuf,
    pub verbosity_profile: dto::VerbosityProfile,
}

impl Conf {
    pub fn from_conf_file(conf_file: &dto::ConfFile) -> anyhow::Result<Self> {
        let instance_id = conf_file.instance_id.context("InstanceId is missing")?;

        let client_id = conf_file.client_id.clone().context("ClientId is missing")?;
        anyhow::ensure!(
            client_id.starts_with(CLIENT_ID_PREFIX),
            "ClientId must carry the `{CLIENT_ID_PREFIX}` prefix"
        );

        let client_secret = conf_file
            .client_secret
            .clone()
            .context("ClientSecret is missing")?
            .pipe(SecretString::from);
        anyhow::ensure!(
            client_secret.expose_secret().len() >= 32,
            "ClientSecret is too short to be a generated credential"
        );

        let allowed_cidrs = conf_file
            .allowed_cidrs
            .as_deref()
            .unwrap_or_default()
            .split(',')
            .map(str::trim)
            .filter(|part| !part.is_empty())
            .map(|part| part.parse::<IpNetwork>().with_context(|| format!("invalid CIDR: {part}")))
            .collect::<anyhow::Result<Vec<_>>>()?;

        let push_batch_interval = match conf_file.push_batch_interval_seconds {
            Some(seconds) => {
                anyhow::ensure!(
                    seconds.is_finite() && seconds > 0.0,
                    "PushBatchIntervalSeconds must be a positive number"
                );
                Duration::from_secs_f64(seconds)
            }
            None => DEFAULT_PUSH_BATCH_INTERVAL,
        };

        let snapshot_cache_ttl = conf_file
            .snapshot_cache_ttl_seconds
            .map_or(DEFAULT_SNAPSHOT_CACHE_TTL, Duration::from_secs);

        let listener_url = conf_file
            .listener_url
            .clone()
            .unwrap_or_else(|| DEFAULT_LISTENER_URL.parse().expect("valid default listener URL"));
        anyhow::ensure!(
            listener_url.scheme() == "http",
            "unsupported listener scheme: {}",
            listener_url.scheme()
        );

        let go2rtc_url = conf_file
            .go2rtc_url
            .clone()
            .unwrap_or_else(|| DEFAULT_GO2RTC_URL.parse().expect("valid default go2rtc URL"));

        let data_dir = get_data_dir();

        let log_file = conf_file
            .log_file
            .clone()
            .unwrap_or_else(|| Utf8PathBuf::from("bridge"))
            .pipe_ref(|path| normalize_data_path(path, &data_dir));

        Ok(Conf {
            instance_id,
            client_id,
            client_secret,
            allowed_cidrs,
            webhook_url: conf_file.webhook_url.clone(),
            push_batch_interval,
            trust_proxy_mode: conf_file.trust_proxy_mode.unwrap_or_default(),
            turn: conf_file.turn.clone(),
            go2rtc_url,
            listener_url,
            snapshot_cache_ttl,
            cameras: conf_file.cameras.clone().unwrap_or_default(),
            log_file,
            verbosity_profile: conf_file.verbosity_profile.unwrap_or_default(),
        })
    }
}

#[derive(Clone)]
pub struct ConfHandle {
    inner: Arc<ConfHandleInner>,
}

struct ConfHandleInner {
    conf: parking_lot::RwLock<Arc<Conf>>,
    conf_file: parking_lot::RwLock<Arc<dto::ConfFile>>,
    changed: Notify,
}

impl ConfHandle {
    /// Initializes configuration for this instance.
    ///
    /// It's best to call this only once to avoid inconsistencies.
    pub fn init() -> anyhow::Result<Self> {
        let conf_file = load_conf_file_or_generate_new()?;
        let conf = Conf::from_conf_file(&conf_file).context("invalid configuration file")?;

        Ok(Self {
            inner: Arc::new(ConfHandleInner {
                conf: parking_lot::RwLock::new(Arc::new(conf)),
                conf_file: parking_lot::RwLock::new(Arc::new(conf_file)),
                changed: Notify::new(),
            }),
        })
    }

    #[doc(hidden)]
    pub fn mock(json_config: &str) -> anyhow::Result<Self> {
        let conf_file = serde_json::from_str::<dto::ConfFile>(json_config).context("invalid JSON config")?;
        let conf = Conf::from_conf_file(&conf_file).context("invalid configuration file")?;

        Ok(Self {
            inner: Arc::new(ConfHandleInner {
                conf: parking_lot::RwLock::new(Arc::new(conf)),
                conf_file: parking_lot::RwLock::new(Arc::new(conf_file)),
                changed: Notify::new(),
            }),
        })
    }

    /// Returns current configuration state (do not hold it forever as it may become outdated)
    pub fn get_conf(&self) -> Arc<Conf> {
        self.inner.conf.read().clone()
    }

    /// Returns current configuration file state (do not hold it forever as it may become outdated)
    pub fn get_conf_file(&self) -> Arc<dto::ConfFile> {
        self.inner.conf_file.read().clone()
    }

    /// Waits for configuration to be changed
    pub async fn change_notified(&self) {
        self.inner.changed.notified().await;
    }

    /// Atomically saves and replaces current configuration with a new one
    #[instrument(skip(self))]
    pub fn save_new_conf_file(&self, conf_file: dto::ConfFile) -> anyhow::Result<()> {
        let conf = Conf::from_conf_file(&conf_file).context("invalid configuration file")?;
        save_config(&conf_file).context("failed to save configuration")?;
        *self.inner.conf.write() = Arc::new(conf);
        *self.inner.conf_file.write() = Arc::new(conf_file);
        self.inner.changed.notify_waiters();
        trace!("success");
        Ok(())
    }

    /// Replaces the credential pair. The previous secret stops verifying as
    /// soon as this returns.
    pub fn regenerate_credentials(&self) -> anyhow::Result<()> {
        let mut conf_file = (*self.get_conf_file()).clone();
        conf_file.client_id = Some(generate_client_id());
        conf_file.client_secret = Some(generate_client_secret());
        self.save_new_conf_file(conf_file)
    }
}

pub fn generate_client_id() -> String {
    let mut bytes = [0u8; 8];
    rand::rngs::OsRng.fill_bytes(&mut bytes);
    format!("{CLIENT_ID_PREFIX}{}", hex::encode(bytes))
}

pub fn generate_client_secret() -> String {
    let mut bytes = [0u8; CLIENT_SECRET_BYTES];
    rand::rngs::OsRng.fill_bytes(&mut bytes);
    URL_SAFE_NO_PAD.encode(bytes)
}

fn save_config(conf: &dto::ConfFile) -> anyhow::Result<()> {
    let conf_file_path = get_conf_file_path();
    let json = serde_json::to_string_pretty(conf).context("failed JSON serialization of configuration")?;

    if let Some(parent) = conf_file_path.parent() {
        std::fs::create_dir_all(parent).with_context(|| format!("failed to create directory at {parent}"))?;
    }

    std::fs::write(&conf_file_path, json).with_context(|| format!("failed to write file at {conf_file_path}"))?;

    Ok(())
}

pub fn get_data_dir() -> Utf8PathBuf {
    if let Ok(config_path_env) = env::var("SMARTLY_BRIDGE_CONFIG_PATH") {
        Utf8PathBuf::from(config_path_env)
    } else {
        let mut config_path = Utf8PathBuf::new();

        if cfg!(target_os = "windows") {
            let program_data_env = env::var("ProgramData").expect("ProgramData env variable");
            config_path.push(program_data_env);
            config_path.push(APPLICATION_DIR);
        } else if cfg!(target_os = "macos") {
            config_path.push("/Library/Application Support");
            config_path.push(APPLICATION_DIR);
        } else {
            config_path.push("/etc");
            config_path.push(APPLICATION_DIR);
        }

        config_path
    }
}

fn get_conf_file_path() -> Utf8PathBuf {
    get_data_dir().join("bridge.json")
}

fn normalize_data_path(path: &Utf8Path, data_dir: &Utf8Path) -> Utf8PathBuf {
    if path.is_absolute() {
        path.to_owned()
    } else {
        data_dir.join(path)
    }
}

fn load_conf_file(conf_path: &Utf8Path) -> anyhow::Result<Option<dto::ConfFile>> {
    match File::open(conf_path) {
        Ok(file) => BufReader::new(file)
            .pipe(serde_json::from_reader)
            .map(Some)
            .with_context(|| format!("invalid config file at {conf_path}")),
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(None),
        Err(e) => Err(anyhow::anyhow!(e).context(format!("couldn't open config file at {conf_path}"))),
    }
}

pub fn load_conf_file_or_generate_new() -> anyhow::Result<dto::ConfFile> {
    let conf_file_path = get_conf_file_path();

    let conf_file = match load_conf_file(&conf_file_path).context("failed to load configuration")? {
        Some(conf_file) => conf_file,
        None => {
            let defaults = dto::ConfFile::generate_new();
            println!("Write default configuration to disk…");
            save_config(&defaults).context("failed to save configuration")?;
            defaults
        }
    };

    Ok(conf_file)
}

pub mod dto {
    use std::collections::HashMap;

    use super::*;

    /// Source of truth for bridge configuration
    ///
    /// This struct represents the JSON file used for configuration as close as possible
    /// and is not trying to be too smart.
    #[derive(PartialEq, Debug, Clone, Serialize, Deserialize)]
    #[serde(rename_all = "PascalCase")]
    pub struct ConfFile {
        /// Unique ID for this bridge instance
        pub instance_id: Option<Uuid>,

        /// Client identifier presented by the platform (generated, `smartly-` prefixed)
        pub client_id: Option<String>,
        /// Shared secret used for request signatures (generated, URL-safe)
        pub client_secret: Option<String>,

        /// Comma-separated CIDR allow-list for inbound requests
        #[serde(skip_serializing_if = "Option::is_none")]
        pub allowed_cidrs: Option<String>,

        /// Platform webhook base URL for outbound state pushes
        #[serde(skip_serializing_if = "Option::is_none")]
        pub webhook_url: Option<Url>,

        /// Debounce interval for outbound batches, in seconds
        #[serde(skip_serializing_if = "Option::is_none")]
        pub push_batch_interval_seconds: Option<f64>,

        /// Source-IP resolution policy when behind a reverse proxy
        #[serde(skip_serializing_if = "Option::is_none")]
        pub trust_proxy_mode: Option<TrustProxyMode>,

        /// Optional TURN server advertised to WebRTC peers
        #[serde(skip_serializing_if = "Option::is_none")]
        pub turn: Option<TurnServerConf>,

        /// Base URL of the local go2rtc media server
        #[serde(rename = "Go2RtcUrl", skip_serializing_if = "Option::is_none")]
        pub go2rtc_url: Option<Url>,

        /// Listener to launch at startup
        #[serde(skip_serializing_if = "Option::is_none")]
        pub listener_url: Option<Url>,

        /// Snapshot cache TTL, in seconds
        #[serde(skip_serializing_if = "Option::is_none")]
        pub snapshot_cache_ttl_seconds: Option<u64>,

        /// Cameras registered at startup
        #[serde(skip_serializing_if = "Option::is_none")]
        pub cameras: Option<Vec<CameraConf>>,

        /// Verbosity profile
        #[serde(skip_serializing_if = "Option::is_none")]
        pub verbosity_profile: Option<VerbosityProfile>,

        /// (Unstable) Folder and prefix for log files
        #[serde(skip_serializing_if = "Option::is_none")]
        pub log_file: Option<Utf8PathBuf>,

        // Other unofficial options.
        // This field is useful so that we can deserialize
        // and then losslessly serialize back all root keys of the config file.
        #[serde(flatten)]
        pub rest: serde_json::Map<String, serde_json::Value>,
    }

    impl ConfFile {
        pub fn generate_new() -> Self {
            Self {
                instance_id: Some(Uuid::new_v4()),
                client_id: Some(generate_client_id()),
                client_secret: Some(generate_client_secret()),
                allowed_cidrs: None,
                webhook_url: None,
                push_batch_interval_seconds: None,
                trust_proxy_mode: None,
                turn: None,
                go2rtc_url: None,
                listener_url: None,
                snapshot_cache_ttl_seconds: None,
                cameras: None,
                verbosity_profile: None,
                log_file: None,
                rest: serde_json::Map::new(),
            }
        }
    }

    /// TURN server appended to the fixed STUN set when configured
    #[derive(PartialEq, Eq, Debug, Clone, Serialize, Deserialize)]
    #[serde(rename_all = "PascalCase")]
    pub struct TurnServerConf {
        pub url: String,
        pub username: String,
        pub credential: String,
    }

    /// Camera source registered ahead of time through the configuration file
    #[derive(PartialEq, Debug, Clone, Serialize, Deserialize)]
    #[serde(rename_all = "PascalCase")]
    pub struct CameraConf {
        pub entity_id: String,
        #[serde(skip_serializing_if = "Option::is_none")]
        pub name: Option<String>,
        #[serde(skip_serializing_if = "Option::is_none")]
        pub snapshot_url: Option<String>,
        #[serde(skip_serializing_if = "Option::is_none")]
        pub stream_url: Option<String>,
        #[serde(skip_serializing_if = "Option::is_none")]
        pub username: Option<String>,
        #[serde(skip_serializing_if = "Option::is_none")]
        pub password: Option<String>,
        #[serde(skip_serializing_if = "Option::is_none")]
        pub verify_ssl: Option<bool>,
        #[serde(skip_serializing_if = "Option::is_none")]
        pub extra_headers: Option<HashMap<String, String>>,
    }

    /// Verbosity profile (pre-defined tracing directives)
    #[derive(PartialEq, Eq, Debug, Clone, Copy, Serialize, Deserialize, Default)]
    pub enum VerbosityProfile {
        /// The default profile, mostly info records
        #[default]
        Default,
        /// Recommended profile for developers
        Debug,
        /// Show all traces
        All,
        /// Only show warnings and errors
        Quiet,
    }

    impl VerbosityProfile {
        pub fn to_log_filter(self) -> &'static str {
            match self {
                VerbosityProfile::Default => "info",
                VerbosityProfile::Debug => "info,smartly_bridge=debug",
                VerbosityProfile::All => "trace",
                VerbosityProfile::Quiet => "warn",
            }
        }
    }
}
