//! Mesh node
//!
//! The public face of the crate: lifecycle gating through the state machine,
//! routing through the connection manager and message notification.

use crate::config::NodeConfig;
use crate::network::address::Address;
use crate::network::error::{MeshError, MeshResult};
use crate::network::manager::{BroadcastReport, ConnectionManager};
use crate::network::peer::{MessageSink, PeerId, SendOutcome};
use crate::network::state::{Command, NodeState, NodeStateMachine};
use bytes::Bytes;
use parking_lot::{Mutex, RwLock};
use std::borrow::Cow;
use std::collections::HashMap;
use std::net::SocketAddr;
use std::sync::Arc;
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;

/// One decoded frame and the connection it arrived on
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct MessageReceived {
    pub peer_id: PeerId,
    pub payload: Bytes,
}

impl MessageReceived {
    /// Payload decoded as UTF-8, replacing invalid sequences
    pub fn text(&self) -> Cow<'_, str> {
        String::from_utf8_lossy(&self.payload)
    }
}

/// Result of a broadcast
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum BroadcastOutcome {
    Delivered(BroadcastReport),
    /// Rejected by the state machine
    Skipped,
}

type Subscriber = Arc<dyn Fn(&MessageReceived) + Send + Sync>;

#[derive(Default)]
struct Subscribers {
    list: RwLock<Vec<Subscriber>>,
}

impl Subscribers {
    fn push(&self, subscriber: Subscriber) {
        self.list.write().push(subscriber);
    }

    /// Runs on the delivering connection's receive task
    fn publish(&self, event: MessageReceived) {
        let subscribers = self.list.read().clone();
        for subscriber in subscribers {
            subscriber(&event);
        }
    }
}

/// A peer-to-peer TCP mesh node
///
/// Dropping a node cancels its loops but does not wait for them to tear
/// down; call [`Node::stop`] and await it for an orderly shutdown.
///
/// ```no_run
/// use peer_mesh::{Address, Node, NodeConfig};
///
/// # async fn run() -> Result<(), peer_mesh::MeshError> {
/// let node = Node::new(
///     Address::localhost(9201),
///     vec![Address::localhost(9200)],
///     NodeConfig::default(),
/// )?;
/// node.on_message(|msg| println!("{}: {}", msg.peer_id, msg.text()));
/// node.start().await;
/// node.broadcast_text("hi").await?;
/// node.stop().await;
/// # Ok(())
/// # }
/// ```
pub struct Node {
    config: Arc<NodeConfig>,
    state: Mutex<NodeStateMachine>,
    manager: ConnectionManager,
    subscribers: Arc<Subscribers>,
    cancel: Mutex<Option<CancellationToken>>,
}

impl Node {
    /// Create a node listening on `listen` that dials every address in `peers`
    pub fn new(listen: Address, peers: Vec<Address>, config: NodeConfig) -> MeshResult<Self> {
        config.validate()?;
        let config = Arc::new(config);

        let subscribers = Arc::new(Subscribers::default());
        let sink: MessageSink = {
            let subscribers = subscribers.clone();
            Arc::new(move |peer_id, payload| {
                subscribers.publish(MessageReceived { peer_id, payload });
            })
        };

        Ok(Self {
            state: Mutex::new(NodeStateMachine::new(config.logger.clone())),
            manager: ConnectionManager::new(listen, peers, config.clone(), sink),
            config,
            subscribers,
            cancel: Mutex::new(None),
        })
    }

    pub fn state(&self) -> NodeState {
        self.state.lock().state()
    }

    pub fn config(&self) -> &NodeConfig {
        &self.config
    }

    /// Bound listener address while running
    pub fn local_addr(&self) -> Option<SocketAddr> {
        self.manager.local_addr()
    }

    /// Call `f` for every message received from any peer
    ///
    /// `f` runs on the receiving connection's task, so a slow callback only
    /// holds back frames from that one peer.
    pub fn on_message<F>(&self, f: F)
    where
        F: Fn(&MessageReceived) + Send + Sync + 'static,
    {
        self.subscribers.push(Arc::new(f));
    }

    /// Channel fed with every message received from any peer
    pub fn subscribe(&self) -> mpsc::UnboundedReceiver<MessageReceived> {
        let (tx, rx) = mpsc::unbounded_channel();
        self.on_message(move |msg| {
            let _ = tx.send(msg.clone());
        });
        rx
    }

    /// Start listening and dialing
    ///
    /// Ignored with a warning unless the node is stopped. If the listener
    /// cannot bind, the failure is logged and the node stays stopped.
    pub async fn start(&self) {
        if !self.permit(Command::Start) {
            return;
        }

        let cancel = CancellationToken::new();
        *self.cancel.lock() = Some(cancel.clone());

        if let Err(e) = self.manager.start(cancel.clone()).await {
            cancel.cancel();
            self.cancel.lock().take();
            self.state.lock().reset();
            self.config
                .logger
                .warning(&format!("Node did not start: {}", e));
        }
    }

    /// Stop every loop and tear down all connections
    pub async fn stop(&self) {
        if !self.permit(Command::Stop) {
            return;
        }

        let cancel = self.cancel.lock().take();
        if let Some(cancel) = cancel {
            cancel.cancel();
        }
        self.manager.join().await;
    }

    /// Send `payload` to one peer
    ///
    /// Fails with [`MeshError::PeerNotFound`] for an unknown id and with
    /// [`MeshError::Protocol`] when the payload exceeds the frame limit.
    pub async fn send_to(&self, id: PeerId, payload: impl AsRef<[u8]>) -> MeshResult<SendOutcome> {
        check_id(&id)?;
        if !self.permit(Command::SendToOne) {
            return Ok(SendOutcome::Skipped);
        }
        self.manager.send_to_one(id, payload.as_ref()).await
    }

    /// Send `payload` to every peer, best-effort
    pub async fn broadcast(&self, payload: impl AsRef<[u8]>) -> MeshResult<BroadcastOutcome> {
        if !self.permit(Command::SendToAll) {
            return Ok(BroadcastOutcome::Skipped);
        }
        let report = self.manager.send_to_all(payload.as_ref()).await?;
        Ok(BroadcastOutcome::Delivered(report))
    }

    pub async fn send_text_to(&self, id: PeerId, text: &str) -> MeshResult<SendOutcome> {
        self.send_to(id, text.as_bytes()).await
    }

    pub async fn broadcast_text(&self, text: &str) -> MeshResult<BroadcastOutcome> {
        self.broadcast(text.as_bytes()).await
    }

    /// Disconnect and forget one peer
    pub async fn remove_client(&self, id: PeerId) -> MeshResult<()> {
        check_id(&id)?;
        if !self.permit(Command::RemoveClient) {
            return Ok(());
        }
        self.manager.remove_client(id).await;
        Ok(())
    }

    /// Ids and addresses of the peers this node dialed
    ///
    /// Empty while stopped. Inbound connections are not listed.
    pub fn peers(&self) -> HashMap<PeerId, Address> {
        if !self.permit(Command::GetPeers) {
            return HashMap::new();
        }
        self.manager.peers()
    }

    fn permit(&self, command: Command) -> bool {
        let transition = self.state.lock().move_next(command);
        transition.is_valid()
    }
}

impl Drop for Node {
    fn drop(&mut self) {
        if let Some(cancel) = self.cancel.get_mut().take() {
            cancel.cancel();
        }
    }
}

fn check_id(id: &PeerId) -> MeshResult<()> {
    if id.is_nil() {
        return Err(MeshError::Configuration("peer id must not be nil".into()));
    }
    Ok(())
}
