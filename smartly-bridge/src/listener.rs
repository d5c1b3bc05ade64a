use std::net::SocketAddr;

use anyhow::Context;
use async_trait::async_trait;
use bridge_task::{ChildTask, ShutdownSignal, Task};
use hyper_util::rt::{TokioExecutor, TokioIo};
use tokio::net::{TcpListener, TcpSocket, TcpStream};
use tracing::Instrument as _;
use url::Url;

use crate::BridgeState;
use crate::utils::url_to_socket_addr;

pub struct BridgeListener {
    addr: SocketAddr,
    listener: TcpListener,
    state: BridgeState,
}

impl BridgeListener {
    pub fn init_and_bind(url: &Url, state: BridgeState) -> anyhow::Result<Self> {
        info!(%url, "Initiating listener…");

        let socket_addr = url_to_socket_addr(url).context("invalid url")?;

        let socket = if socket_addr.is_ipv4() {
            TcpSocket::new_v4().context("failed to create IPv4 TCP socket")?
        } else {
            TcpSocket::new_v6().context("failed to create IPv6 TCP socket")?
        };
        socket.bind(socket_addr).context("failed to bind TCP socket")?;

        let listener = socket
            .listen(64)
            .context("failed to listen with the bound TCP socket")?;

        info!(addr = %socket_addr, "Listener started successfully");

        Ok(Self {
            addr: socket_addr,
            listener,
            state,
        })
    }

    pub fn addr(&self) -> SocketAddr {
        self.addr
    }
}

#[async_trait]
impl Task for BridgeListener {
    type Output = anyhow::Result<()>;

    const NAME: &'static str = "http listener";

    async fn run(self, mut shutdown_signal: ShutdownSignal) -> Self::Output {
        let Self { listener, state, .. } = self;

        loop {
            tokio::select! {
                result = listener.accept() => {
                    match result {
                        Ok((stream, peer_addr)) => {
                            let state = state.clone();

                            // Connections are not bounded by a timeout on
                            // purpose: MJPEG and HLS responses are long-lived.
                            let fut = async move {
                                if let Err(e) = handle_http_peer(stream, state, peer_addr).await {
                                    debug!(error = format!("{e:#}"), "handle_http_peer failed");
                                }
                            }
                            .instrument(info_span!("http", client = %peer_addr));

                            ChildTask::spawn(fut).detach();
                        }
                        Err(error) => {
                            error!(%error, "failed to accept connection");
                        }
                    }
                }
                () = shutdown_signal.wait() => {
                    break;
                }
            }
        }

        debug!("Task terminated");

        Ok(())
    }
}

async fn handle_http_peer(stream: TcpStream, state: BridgeState, peer_addr: SocketAddr) -> anyhow::Result<()> {
    use axum::extract::connect_info::ConnectInfo;

    let app = crate::make_http_service(state).layer(axum::Extension(ConnectInfo(peer_addr)));
    let service = hyper_util::service::TowerToHyperService::new(app);

    hyper_util::server::conn::auto::Builder::new(TokioExecutor::new())
        .serve_connection_with_upgrades(TokioIo::new(stream), service)
        .await
        .map_err(|e| anyhow::anyhow!("HTTP connection error: {e}"))
}
