//! Listener, dialer and routing over the peer registry

use crate::config::NodeConfig;
use crate::network::address::Address;
use crate::network::error::{MeshError, MeshResult};
use crate::network::peer::{
    ConnectionContext, MessageSink, PeerConnection, PeerId, RemovalCallback, SendOutcome,
};
use crate::network::registry::PeerRegistry;
use parking_lot::Mutex;
use std::collections::HashMap;
use std::net::SocketAddr;
use std::sync::Arc;
use tokio::net::TcpListener;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;

/// Totals of a broadcast
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct BroadcastReport {
    pub sent: usize,
    pub failed: usize,
}

/// Owns the listener and wires every socket into the registry
pub struct ConnectionManager {
    listen: Address,
    peers: Vec<Address>,
    config: Arc<NodeConfig>,
    registry: Arc<PeerRegistry>,
    on_message: MessageSink,
    local_addr: Mutex<Option<SocketAddr>>,
    accept_task: Mutex<Option<JoinHandle<()>>>,
    dial_tasks: Mutex<Vec<JoinHandle<()>>>,
}

impl ConnectionManager {
    pub fn new(
        listen: Address,
        peers: Vec<Address>,
        config: Arc<NodeConfig>,
        on_message: MessageSink,
    ) -> Self {
        Self {
            listen,
            peers,
            config,
            registry: Arc::new(PeerRegistry::new()),
            on_message,
            local_addr: Mutex::new(None),
            accept_task: Mutex::new(None),
            dial_tasks: Mutex::new(Vec::new()),
        }
    }

    pub fn registry(&self) -> &Arc<PeerRegistry> {
        &self.registry
    }

    /// Bound listener address while accepting
    pub fn local_addr(&self) -> Option<SocketAddr> {
        *self.local_addr.lock()
    }

    /// Bind the listener, then accept and dial until `cancel` fires
    ///
    /// A bind failure is returned as [`MeshError::Configuration`] and
    /// nothing is started.
    pub async fn start(&self, cancel: CancellationToken) -> MeshResult<SocketAddr> {
        let logger = &self.config.logger;

        let listener = match TcpListener::bind((self.listen.host(), self.listen.port())).await {
            Ok(listener) => listener,
            Err(e) => {
                logger.error("Failed to start listener", &e);
                return Err(MeshError::Configuration(format!(
                    "failed to bind {}: {}",
                    self.listen, e
                )));
            }
        };
        let local = listener.local_addr()?;
        *self.local_addr.lock() = Some(local);
        logger.message(&format!("Listener at {} has started...", self.listen));

        let ctx = self.context(cancel.clone());

        let mut dials = Vec::with_capacity(self.peers.len());
        for address in &self.peers {
            let address = address.clone();
            let ctx = ctx.clone();
            let registry = self.registry.clone();
            dials.push(tokio::spawn(async move {
                // Failures are logged by the dialer.
                if let Ok(conn) = PeerConnection::connect(address, ctx.clone()).await {
                    register(&registry, conn, &ctx.cancel).await;
                }
            }));
        }
        *self.dial_tasks.lock() = dials;

        let handle = tokio::spawn(accept_loop(
            listener,
            ctx,
            self.registry.clone(),
            cancel,
        ));
        *self.accept_task.lock() = Some(handle);

        Ok(local)
    }

    /// Wait for the dialers and the accept loop to finish their teardown
    pub async fn join(&self) {
        let dials = std::mem::take(&mut *self.dial_tasks.lock());
        for handle in dials {
            if let Err(e) = handle.await {
                log::warn!("Dial task ended abnormally: {}", e);
            }
        }

        let handle = self.accept_task.lock().take();
        if let Some(handle) = handle {
            if let Err(e) = handle.await {
                log::warn!("Accept loop ended abnormally: {}", e);
            }
        }
        *self.local_addr.lock() = None;
    }

    /// Send to one peer, failing with `PeerNotFound` for an unknown id
    pub async fn send_to_one(&self, id: PeerId, payload: &[u8]) -> MeshResult<SendOutcome> {
        let conn = self
            .registry
            .get(&id)
            .ok_or(MeshError::PeerNotFound(id))?;
        conn.send(payload).await
    }

    /// Best-effort send to every registered peer
    ///
    /// Only an oversized payload fails the call, and it does so before any
    /// peer is written to.
    pub async fn send_to_all(&self, payload: &[u8]) -> MeshResult<BroadcastReport> {
        let mut report = BroadcastReport::default();

        for conn in self.registry.snapshot() {
            match conn.send(payload).await {
                Ok(SendOutcome::Sent) => report.sent += 1,
                Ok(_) => report.failed += 1,
                Err(e) if e.is_protocol() => return Err(e),
                Err(e) => {
                    self.config
                        .logger
                        .error(&format!("Broadcast to peer {} failed", conn.id()), &e);
                    report.failed += 1;
                }
            }
        }

        Ok(report)
    }

    /// Remove and tear down one connection; unknown ids are ignored
    pub async fn remove_client(&self, id: PeerId) {
        match self.registry.remove(&id) {
            Some(conn) => conn.close().await,
            None => log::debug!("remove_client: no peer {}", id),
        }
    }

    /// Ids and addresses of the peers this node dialed
    pub fn peers(&self) -> HashMap<PeerId, Address> {
        self.registry
            .outbound()
            .into_iter()
            .filter_map(|conn| conn.address().cloned().map(|addr| (conn.id(), addr)))
            .collect()
    }

    fn context(&self, cancel: CancellationToken) -> ConnectionContext {
        let registry = Arc::downgrade(&self.registry);
        let on_removed: RemovalCallback = Arc::new(move |id| {
            if let Some(registry) = registry.upgrade() {
                registry.remove(&id);
            }
        });

        ConnectionContext {
            config: self.config.clone(),
            cancel,
            on_message: self.on_message.clone(),
            on_removed,
        }
    }
}

/// Add a fresh connection unless it died or the node stopped meanwhile
async fn register(registry: &PeerRegistry, conn: Arc<PeerConnection>, cancel: &CancellationToken) {
    registry.add(conn.clone());
    if cancel.is_cancelled() || conn.is_closed() {
        registry.remove(&conn.id());
        conn.close().await;
    }
}

async fn accept_loop(
    listener: TcpListener,
    ctx: ConnectionContext,
    registry: Arc<PeerRegistry>,
    cancel: CancellationToken,
) {
    let logger = ctx.config.logger.clone();

    loop {
        let accepted = tokio::select! {
            biased;
            _ = cancel.cancelled() => break,
            accepted = listener.accept() => accepted,
        };

        match accepted {
            Ok((stream, from)) => {
                log::debug!("Incoming connection from {}", from);
                let conn = PeerConnection::accept(stream, ctx.clone());
                register(&registry, conn, &cancel).await;
            }
            Err(e) => {
                logger.error("Accept error", &e);
                tokio::select! {
                    _ = cancel.cancelled() => break,
                    _ = tokio::time::sleep(ctx.config.poll_interval) => {}
                }
            }
        }
    }

    drop(listener);
    for conn in registry.drain() {
        conn.close().await;
    }
    logger.message("Server has stopped.");
}
