//! RTSP listener and unit fan-out
//!
//! The accept loop spawns one task per connection. Playing clients register
//! their queue with the [`StreamDistributor`]; the muxer publishes each unit
//! once and every queue gets a shared reference.

use dashmap::DashMap;
use futures_util::stream::{FuturesUnordered, StreamExt};
use socket2::{Domain, Protocol, Socket, Type};
use std::net::{IpAddr, SocketAddr};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::net::TcpListener;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use crate::clock::SessionClock;
use crate::config::{ServerConfig, StreamConfig};
use crate::constants::STREAM_PATH;
use crate::error::NetworkError;
use crate::mux::{describe_session, SessionDescription, SessionOrigin, StreamUnit};
use crate::rtsp::client;
use crate::rtsp::queue::ClientQueue;
use crate::rtsp::status::StatusPublisher;

const LISTEN_BACKLOG: i32 = 128;
const CLIENT_DRAIN_TIMEOUT: Duration = Duration::from_secs(2);

/// Hands every published unit to the queues of all playing clients
#[derive(Default)]
pub struct StreamDistributor {
    clients: DashMap<String, Arc<ClientQueue>>,
    published: AtomicU64,
}

impl StreamDistributor {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn attach(&self, session_id: &str, queue: Arc<ClientQueue>) {
        self.clients.insert(session_id.to_string(), queue);
        debug!(session = session_id, "Client attached to stream");
    }

    pub fn detach(&self, session_id: &str) {
        if self.clients.remove(session_id).is_some() {
            debug!(session = session_id, "Client detached from stream");
        }
    }

    /// Fan a unit out. Returns how many clients received it.
    pub fn publish(&self, unit: StreamUnit) -> usize {
        self.published.fetch_add(1, Ordering::Relaxed);
        if self.clients.is_empty() {
            return 0;
        }
        let unit = Arc::new(unit);
        let mut delivered = 0;
        for entry in self.clients.iter() {
            if !entry.value().push(unit.clone()) {
                debug!(session = entry.key().as_str(), "Client queue full, oldest unit dropped");
            }
            delivered += 1;
        }
        delivered
    }

    pub fn playing_clients(&self) -> usize {
        self.clients.len()
    }

    pub fn published(&self) -> u64 {
        self.published.load(Ordering::Relaxed)
    }
}

/// State shared by every client task
pub(crate) struct ServerContext {
    pub stream: StreamConfig,
    pub settings: ServerConfig,
    pub service_name: String,
    /// SDP `o=` session id, fixed for the server's lifetime
    pub sdp_session_id: u64,
    pub clock: SessionClock,
    pub distributor: Arc<StreamDistributor>,
    pub status: Arc<StatusPublisher>,
}

impl ServerContext {
    /// Session description as seen by a client reaching the server at `address`
    pub fn describe(&self, address: IpAddr) -> SessionDescription {
        describe_session(
            &self.stream,
            SessionOrigin {
                session_id: self.sdp_session_id,
                version: 1,
                address,
                name: self.service_name.clone(),
            },
        )
    }
}

pub struct StreamServer {
    local_addr: SocketAddr,
    ctx: Arc<ServerContext>,
    distributor: Arc<StreamDistributor>,
    status: Arc<StatusPublisher>,
    cancel: CancellationToken,
    accept_task: Option<JoinHandle<()>>,
}

impl StreamServer {
    /// Bind the listener and start accepting. Must run inside a tokio runtime.
    ///
    /// Cancelling `parent` closes the listener and every connection.
    pub fn start(
        settings: ServerConfig,
        stream: StreamConfig,
        service_name: String,
        clock: SessionClock,
        status: Arc<StatusPublisher>,
        parent: &CancellationToken,
    ) -> Result<Self, NetworkError> {
        let ip: IpAddr = settings.bind_address.parse().map_err(|_| {
            NetworkError::BindFailed(format!("invalid bind address {:?}", settings.bind_address))
        })?;
        let listener = bind_listener(SocketAddr::new(ip, settings.port))?;
        let local_addr = listener
            .local_addr()
            .map_err(|e| NetworkError::BindFailed(e.to_string()))?;

        let distributor = Arc::new(StreamDistributor::new());
        let ctx = Arc::new(ServerContext {
            stream,
            settings,
            service_name,
            sdp_session_id: chrono::Utc::now().timestamp() as u64,
            clock,
            distributor: distributor.clone(),
            status: status.clone(),
        });

        let cancel = parent.child_token();
        let accept_task = tokio::spawn(accept_loop(listener, ctx.clone(), cancel.clone()));

        info!("RTSP server listening on {}", local_addr);

        Ok(Self {
            local_addr,
            ctx,
            distributor,
            status,
            cancel,
            accept_task: Some(accept_task),
        })
    }

    pub fn local_addr(&self) -> SocketAddr {
        self.local_addr
    }

    pub fn distributor(&self) -> Arc<StreamDistributor> {
        self.distributor.clone()
    }

    /// Stream URL as reachable at `host`
    pub fn url_for(&self, host: IpAddr) -> String {
        format!("rtsp://{}/{}", SocketAddr::new(host, self.local_addr.port()), STREAM_PATH)
    }

    pub fn session_description(&self, host: IpAddr) -> SessionDescription {
        self.ctx.describe(host)
    }

    pub fn is_running(&self) -> bool {
        self.accept_task.as_ref().is_some_and(|t| !t.is_finished())
    }

    /// Close the listener and every client connection. Idempotent.
    pub async fn shutdown(&mut self) {
        self.cancel.cancel();
        if let Some(task) = self.accept_task.take() {
            if let Err(e) = task.await {
                warn!("Accept loop ended abnormally: {}", e);
            }
            self.status.set_stopped();
            info!("RTSP server stopped");
        }
    }
}

impl Drop for StreamServer {
    fn drop(&mut self) {
        self.cancel.cancel();
    }
}

fn bind_listener(addr: SocketAddr) -> Result<TcpListener, NetworkError> {
    let bind_err = |e: std::io::Error| NetworkError::BindFailed(format!("{}: {}", addr, e));
    let socket = Socket::new(Domain::for_address(addr), Type::STREAM, Some(Protocol::TCP))
        .map_err(bind_err)?;
    socket.set_reuse_address(true).map_err(bind_err)?;
    socket.set_nonblocking(true).map_err(bind_err)?;
    socket.bind(&addr.into()).map_err(bind_err)?;
    socket.listen(LISTEN_BACKLOG).map_err(bind_err)?;
    TcpListener::from_std(socket.into()).map_err(bind_err)
}

async fn accept_loop(listener: TcpListener, ctx: Arc<ServerContext>, cancel: CancellationToken) {
    let mut clients = FuturesUnordered::new();

    loop {
        tokio::select! {
            _ = cancel.cancelled() => break,
            Some(joined) = clients.next(), if !clients.is_empty() => {
                let joined: Result<(), tokio::task::JoinError> = joined;
                if let Err(e) = joined {
                    warn!("Client task failed: {}", e);
                }
            }
            accepted = listener.accept() => match accepted {
                Ok((stream, peer)) => {
                    if let Err(e) = stream.set_nodelay(true) {
                        debug!(%peer, "Failed to disable Nagle: {}", e);
                    }
                    info!(%peer, "Client connected");
                    clients.push(tokio::spawn(client::run(
                        stream,
                        peer,
                        ctx.clone(),
                        cancel.child_token(),
                    )));
                }
                Err(e) => {
                    warn!("Accept failed: {}", e);
                    ctx.status.record_error(format!("accept failed: {}", e));
                    tokio::time::sleep(Duration::from_millis(100)).await;
                }
            }
        }
    }

    drop(listener);
    let drain = async { while clients.next().await.is_some() {} };
    if tokio::time::timeout(CLIENT_DRAIN_TIMEOUT, drain).await.is_err() {
        warn!("Client connections did not close in time");
    }
}
