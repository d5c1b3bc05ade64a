use std::sync::Arc;
use std::time::Duration;

use anyhow::Context as _;
use bridge_task::{ChildTask, ShutdownHandle, ShutdownSignal};
use smartly_bridge::BridgeState;
use smartly_bridge::auth::{AuthSweeperTask, NonceCache, RateLimiter};
use smartly_bridge::camera::{CameraManager, SnapshotSweeperTask};
use smartly_bridge::config::ConfHandle;
use smartly_bridge::hub::DynHub;
use smartly_bridge::listener::BridgeListener;
use smartly_bridge::log::{self, LoggerGuard};
use smartly_bridge::push::PushTask;
use smartly_bridge::webrtc::{WebRtcManager, WebRtcSweeperTask};
use tokio::runtime::{self, Runtime};

/// How long stopped tasks get to drain before the runtime is torn down.
const STOP_DRAIN_WINDOW: Duration = Duration::from_secs(10);
const RUNTIME_TEARDOWN_TIMEOUT: Duration = Duration::from_secs(3);

struct RunningBridge {
    shutdown_handle: ShutdownHandle,
    runtime: Runtime,
}

pub struct BridgeService {
    conf_handle: ConfHandle,
    hub: DynHub,
    running: Option<RunningBridge>,
    _logger_guard: LoggerGuard,
}

impl BridgeService {
    pub fn load(conf_handle: ConfHandle, hub: DynHub) -> anyhow::Result<Self> {
        let conf = conf_handle.get_conf();

        let logger_guard =
            log::init(&conf.log_file, conf.verbosity_profile.to_log_filter()).context("failed to setup logger")?;

        info!(version = env!("CARGO_PKG_VERSION"));
        info!(instance_id = %conf.instance_id, client_id = %conf.client_id);

        if conf.webhook_url.is_none() {
            warn!("No webhook URL configured; state changes will not be pushed");
        }

        Ok(BridgeService {
            conf_handle,
            hub,
            running: None,
            _logger_guard: logger_guard,
        })
    }

    pub fn start(&mut self) -> anyhow::Result<()> {
        if self.running.is_some() {
            warn!("Start requested, but the bridge is already running");
            return Ok(());
        }

        let runtime = runtime::Builder::new_multi_thread()
            .enable_all()
            .build()
            .context("failed to create runtime")?;

        // The listener binds its socket inside spawn_tasks, so this has to
        // happen on the runtime.
        let task_set = runtime.block_on(spawn_tasks(self.conf_handle.clone(), self.hub.clone()))?;

        let TaskSet {
            children,
            shutdown_handle,
            shutdown_signal,
        } = task_set;

        debug!(task_count = children.len(), "Owned tasks spawned");

        // One watcher per child: an early exit is logged the moment it
        // happens and never takes the siblings down with it.
        for (name, child) in children {
            runtime.spawn(watch_task(name, child));
        }

        // Our own copy of the signal must go away, or all_closed() would
        // wait on it forever.
        drop(shutdown_signal);

        self.running = Some(RunningBridge {
            shutdown_handle,
            runtime,
        });

        Ok(())
    }

    pub fn stop(&mut self) {
        let Some(RunningBridge {
            shutdown_handle,
            runtime,
        }) = self.running.take()
        else {
            debug!("Stop requested, but the bridge is not running");
            return;
        };

        info!("Bridge is shutting down");

        shutdown_handle.signal();

        let drained = runtime
            .block_on(tokio::time::timeout(STOP_DRAIN_WINDOW, shutdown_handle.all_closed()))
            .is_ok();

        if drained {
            debug!("Every owned task drained in time");
        } else {
            warn!("Drain window elapsed with tasks still running; tearing the runtime down anyway");
        }

        runtime.shutdown_timeout(RUNTIME_TEARDOWN_TIMEOUT);
    }
}

async fn watch_task(name: &'static str, child: ChildTask<anyhow::Result<()>>) {
    match child.join().await {
        Ok(Ok(())) => debug!(task = name, "Task finished"),
        Ok(Err(error)) => error!(task = name, error = format!("{error:#}"), "Task aborted with an error"),
        Err(join_error) => error!(task = name, %join_error, "Task panicked or was cancelled"),
    }
}

struct TaskSet {
    children: Vec<(&'static str, ChildTask<anyhow::Result<()>>)>,
    shutdown_handle: ShutdownHandle,
    shutdown_signal: ShutdownSignal,
}

impl TaskSet {
    fn new() -> Self {
        let (shutdown_handle, shutdown_signal) = ShutdownHandle::new();

        Self {
            children: Vec::new(),
            shutdown_handle,
            shutdown_signal,
        }
    }

    fn register<T>(&mut self, task: T)
    where
        T: bridge_task::Task<Output = anyhow::Result<()>> + 'static,
    {
        let child = bridge_task::spawn_task(task, self.shutdown_signal.clone());
        self.children.push((T::NAME, child));
    }
}

async fn spawn_tasks(conf_handle: ConfHandle, hub: DynHub) -> anyhow::Result<TaskSet> {
    let conf = conf_handle.get_conf();

    let nonce_cache = Arc::new(NonceCache::new());
    let rate_limiter = Arc::new(RateLimiter::new());
    let cameras = Arc::new(CameraManager::new(conf.snapshot_cache_ttl));
    let webrtc = Arc::new(WebRtcManager::new());

    cameras.seed(conf.cameras.iter().cloned());

    let mut tasks = TaskSet::new();

    let state = BridgeState {
        conf_handle: conf_handle.clone(),
        hub: hub.clone(),
        nonce_cache: nonce_cache.clone(),
        rate_limiter: rate_limiter.clone(),
        cameras: cameras.clone(),
        webrtc: webrtc.clone(),
        shutdown_signal: tasks.shutdown_signal.clone(),
    };

    let listener = BridgeListener::init_and_bind(&conf.listener_url, state)
        .with_context(|| format!("failed to initialize {}", conf.listener_url))?;
    tasks.register(listener);

    tasks.register(AuthSweeperTask {
        nonce_cache,
        rate_limiter,
    });

    tasks.register(SnapshotSweeperTask { cameras });

    tasks.register(WebRtcSweeperTask { webrtc });

    tasks.register(PushTask { conf_handle, hub });

    Ok(tasks)
}
