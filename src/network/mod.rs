//! P2P mesh networking
//!
//! Provides a symmetric TCP mesh: every socket, accepted or dialed, is a peer.
//!
//! # Features
//! - Length-prefixed framing with a bounded frame size
//! - Outbound dialing with bounded retries and automatic redial
//! - Thread-safe peer registry with snapshot iteration
//! - Lifecycle gating through a small state machine

pub mod address;
pub mod codec;
pub mod error;
pub mod manager;
pub mod node;
pub mod peer;
pub mod registry;
pub mod state;

pub use address::Address;
pub use codec::{FrameCodec, DEFAULT_MAX_FRAME_BYTES, LENGTH_PREFIX};
pub use error::{FrameError, MeshError, MeshResult};
pub use manager::{BroadcastReport, ConnectionManager};
pub use node::{BroadcastOutcome, MessageReceived, Node};
pub use peer::{ConnectionContext, Direction, PeerConnection, PeerId, SendOutcome};
pub use registry::PeerRegistry;
pub use state::{Command, NodeState, NodeStateMachine, Transition};
