//! Peer-Mesh: a symmetric peer-to-peer TCP mesh node in Rust
//!
//! A node listens on one address and dials a configured set of peers at the
//! same time. Every resulting socket, inbound or outbound, joins one peer
//! registry:
//! - Length-prefixed frames carrying opaque byte payloads
//! - Unicast by connection id and best-effort broadcast
//! - One notification stream for frames from any peer
//! - Outbound dialing with bounded retries and redial on disconnect
//!
//! # Example
//!
//! ```no_run
//! use peer_mesh::{Address, Node, NodeConfig};
//!
//! #[tokio::main]
//! async fn main() -> Result<(), peer_mesh::MeshError> {
//!     let node = Node::new(Address::localhost(9200), vec![], NodeConfig::default())?;
//!     let mut messages = node.subscribe();
//!
//!     node.start().await;
//!     while let Some(msg) = messages.recv().await {
//!         println!("{} says {}", msg.peer_id, msg.text());
//!         node.send_text_to(msg.peer_id, "ack").await?;
//!     }
//!     Ok(())
//! }
//! ```

pub mod config;
pub mod logging;
pub mod network;

// Re-export commonly used types
pub use config::{NodeConfig, NodeSettings};
pub use logging::{LogLogger, Logger, SilentLogger};
pub use network::{
    Address, BroadcastOutcome, BroadcastReport, Direction, FrameCodec, MeshError, MeshResult,
    MessageReceived, Node, NodeState, PeerId, SendOutcome,
};
