//! RTMP ingest/egress server.
//!
//! The listener caps concurrent connections and spawns one session
//! task per accepted socket. Shutdown cancels the session token, which
//! terminates every open session before the listening port is
//! released.

pub mod amf;
pub mod auth;
pub mod chunk;
pub mod handshake;
pub mod registry;
pub mod session;

use std::net::SocketAddr;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;

use tokio::net::TcpListener;
use tokio_util::sync::CancellationToken;
use tracing::{info, warn};

use framecast_core::metrics;

use crate::error::{StreamError, StreamResult};

pub use auth::{PublishAuth, PublishGrant, StreamKeyAuth};
pub use registry::{ActiveStream, MediaFrame, MediaKind, RtmpEvent, SessionType, StreamRegistry};
pub use session::SessionContext;

/// Default max concurrent RTMP connections.
const DEFAULT_MAX_CONNECTIONS: usize = 1000;

#[derive(Debug, Clone)]
pub struct RtmpServerConfig {
    pub address: String,
    pub app: String,
    pub max_connections: usize,
}

impl Default for RtmpServerConfig {
    fn default() -> Self {
        Self {
            address: "0.0.0.0:1935".to_string(),
            app: "live".to_string(),
            max_connections: DEFAULT_MAX_CONNECTIONS,
        }
    }
}

pub struct RtmpServer {
    config: RtmpServerConfig,
    ctx: Arc<SessionContext>,
}

impl RtmpServer {
    #[must_use]
    pub fn new(
        config: RtmpServerConfig,
        auth: Arc<dyn PublishAuth>,
        registry: Arc<StreamRegistry>,
    ) -> Self {
        let ctx = Arc::new(SessionContext {
            app: config.app.clone(),
            auth,
            registry,
        });
        Self { config, ctx }
    }

    /// Bind the listening socket. Failure here is component-fatal and
    /// propagates to the orchestrator before anything else starts.
    pub async fn bind(self) -> StreamResult<BoundRtmpServer> {
        let socket_addr: SocketAddr = self.config.address.parse().map_err(|e| {
            StreamError::Protocol(format!("invalid address '{}': {e}", self.config.address))
        })?;
        let listener = TcpListener::bind(&socket_addr).await?;
        info!(
            "rtmp server listening on rtmp://{} (max_connections: {})",
            listener.local_addr().map_or(socket_addr, |a| a),
            self.config.max_connections
        );
        Ok(BoundRtmpServer {
            config: self.config,
            ctx: self.ctx,
            listener,
        })
    }
}

pub struct BoundRtmpServer {
    config: RtmpServerConfig,
    ctx: Arc<SessionContext>,
    listener: TcpListener,
}

impl BoundRtmpServer {
    #[must_use]
    pub fn local_addr(&self) -> Option<SocketAddr> {
        self.listener.local_addr().ok()
    }

    /// Accept until the token is cancelled; cancelling also terminates
    /// every open session through child tokens.
    pub async fn run(self, shutdown: CancellationToken) -> StreamResult<()> {
        let listener = self.listener;
        let active = Arc::new(AtomicUsize::new(0));

        loop {
            tokio::select! {
                () = shutdown.cancelled() => {
                    info!("rtmp server shutting down, terminating open sessions");
                    return Ok(());
                }
                accepted = listener.accept() => {
                    let (stream, peer) = accepted?;
                    let current = active.load(Ordering::Relaxed);
                    if current >= self.config.max_connections {
                        warn!(
                            %peer,
                            current,
                            max = self.config.max_connections,
                            "rtmp connection rejected: at capacity"
                        );
                        drop(stream);
                        continue;
                    }

                    active.fetch_add(1, Ordering::Relaxed);
                    metrics::RTMP_CONNECTIONS_ACTIVE.inc();
                    let counter = active.clone();
                    let ctx = self.ctx.clone();
                    let session_token = shutdown.child_token();
                    tokio::spawn(async move {
                        session::Session::run(stream, peer, ctx, session_token).await;
                        counter.fetch_sub(1, Ordering::Relaxed);
                        metrics::RTMP_CONNECTIONS_ACTIVE.dec();
                    });
                }
            }
        }
    }
}
