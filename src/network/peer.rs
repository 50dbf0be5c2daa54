//! Peer connections
//!
//! A [`PeerConnection`] owns one TCP socket, inbound or outbound. Outbound
//! connections dial with a bounded retry policy and redial when the remote
//! side goes away; inbound connections end when their socket does.

use crate::config::NodeConfig;
use crate::network::address::Address;
use crate::network::codec::{FrameCodec, LENGTH_PREFIX};
use crate::network::error::{MeshError, MeshResult};
use bytes::{Bytes, BytesMut};
use futures::StreamExt;
use std::fmt;
use std::str::FromStr;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use tokio::io::AsyncWriteExt;
use tokio::net::tcp::{OwnedReadHalf, OwnedWriteHalf};
use tokio::net::{TcpSocket, TcpStream};
use tokio::sync::{Mutex, MutexGuard};
use tokio_util::codec::{Encoder, FramedRead};
use tokio_util::sync::CancellationToken;

/// Opaque connection identifier (16 random bytes)
#[derive(Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct PeerId([u8; 16]);

impl PeerId {
    /// Generate a fresh random identifier
    pub fn random() -> Self {
        Self(rand::random())
    }

    /// The all-zero identifier, never assigned to a connection
    pub fn nil() -> Self {
        Self([0u8; 16])
    }

    pub fn is_nil(&self) -> bool {
        self.0 == [0u8; 16]
    }
}

impl fmt::Debug for PeerId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "PeerId({})", hex::encode(&self.0[..4]))
    }
}

impl fmt::Display for PeerId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", hex::encode(self.0))
    }
}

impl FromStr for PeerId {
    type Err = MeshError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let bytes = hex::decode(s.trim())
            .map_err(|e| MeshError::Configuration(format!("invalid peer id '{}': {}", s, e)))?;
        let bytes: [u8; 16] = bytes.try_into().map_err(|_| {
            MeshError::Configuration(format!("peer id '{}' must be 16 bytes", s))
        })?;
        Ok(Self(bytes))
    }
}

/// Which side opened the socket
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Direction {
    /// Accepted by our listener
    Inbound,
    /// Dialed by us
    Outbound,
}

/// Result of a send that passed frame validation
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SendOutcome {
    /// Frame written to the socket
    Sent,
    /// Socket write failed; the failure was logged
    Failed,
    /// Rejected by the node state machine
    Skipped,
}

/// Receives `(peer id, payload)` for every decoded frame
pub type MessageSink = Arc<dyn Fn(PeerId, Bytes) + Send + Sync>;

/// Told the id of a connection as it is torn down
pub type RemovalCallback = Arc<dyn Fn(PeerId) + Send + Sync>;

/// Everything a connection needs from its owner
#[derive(Clone)]
pub struct ConnectionContext {
    pub config: Arc<NodeConfig>,
    /// Cancellation scope of the current Start/Stop cycle
    pub cancel: CancellationToken,
    pub on_message: MessageSink,
    pub on_removed: RemovalCallback,
}

/// One logical connection to a peer
pub struct PeerConnection {
    id: PeerId,
    address: Option<Address>,
    direction: Direction,
    writer: Mutex<Option<OwnedWriteHalf>>,
    live: AtomicBool,
    closed: AtomicBool,
    cancel: CancellationToken,
    ctx: ConnectionContext,
}

impl PeerConnection {
    /// Wrap a socket accepted by the listener and start receiving
    pub fn accept(stream: TcpStream, ctx: ConnectionContext) -> Arc<Self> {
        if let Err(e) = stream.set_nodelay(true) {
            log::debug!("set_nodelay failed on inbound socket: {}", e);
        }
        let (reader, writer) = stream.into_split();

        let conn = Arc::new(Self::build(None, Direction::Inbound, writer, ctx));
        conn.ctx.config.logger.message("Connection accepted");
        conn.spawn_receive(reader);
        conn
    }

    /// Dial `address` with the configured retry policy
    ///
    /// Fails with [`MeshError::Connection`] once every attempt is used up.
    pub async fn connect(address: Address, ctx: ConnectionContext) -> MeshResult<Arc<Self>> {
        let stream = dial(&address, &ctx.config, &ctx.cancel).await?;
        let (reader, writer) = stream.into_split();

        let conn = Arc::new(Self::build(
            Some(address.clone()),
            Direction::Outbound,
            writer,
            ctx,
        ));
        conn.ctx
            .config
            .logger
            .message(&format!("Connection accepted from {}", address));
        conn.spawn_receive(reader);
        Ok(conn)
    }

    fn build(
        address: Option<Address>,
        direction: Direction,
        writer: OwnedWriteHalf,
        ctx: ConnectionContext,
    ) -> Self {
        Self {
            id: PeerId::random(),
            address,
            direction,
            writer: Mutex::new(Some(writer)),
            live: AtomicBool::new(true),
            closed: AtomicBool::new(false),
            cancel: ctx.cancel.child_token(),
            ctx,
        }
    }

    pub fn id(&self) -> PeerId {
        self.id
    }

    /// Dialed address; `None` for inbound connections
    pub fn address(&self) -> Option<&Address> {
        self.address.as_ref()
    }

    pub fn direction(&self) -> Direction {
        self.direction
    }

    pub fn is_outbound(&self) -> bool {
        self.direction == Direction::Outbound
    }

    /// Socket currently connected
    pub fn is_live(&self) -> bool {
        self.live.load(Ordering::SeqCst)
    }

    pub fn is_closed(&self) -> bool {
        self.closed.load(Ordering::SeqCst)
    }

    /// Write one frame carrying `payload`
    ///
    /// An oversized payload is an error and nothing is written. Socket
    /// failures are logged and reported as [`SendOutcome::Failed`]. Closing
    /// the connection aborts a send that is waiting on the socket.
    pub async fn send(&self, payload: &[u8]) -> MeshResult<SendOutcome> {
        let mut frame = BytesMut::with_capacity(LENGTH_PREFIX + payload.len());
        FrameCodec::new(self.ctx.config.max_frame_bytes).encode(payload, &mut frame)?;

        let logger = &self.ctx.config.logger;
        let mut writer = self.lock_writer().await;
        let Some(stream) = writer.as_deref_mut().and_then(Option::as_mut) else {
            logger.warning(&format!(
                "Peer {} is not connected, dropping {} bytes",
                self.id,
                payload.len()
            ));
            return Ok(SendOutcome::Failed);
        };

        let written = tokio::select! {
            biased;
            _ = self.cancel.cancelled() => Err(std::io::Error::new(
                std::io::ErrorKind::ConnectionAborted,
                "connection closed during send",
            )),
            written = write_frame(stream, &frame) => written,
        };

        match written {
            Ok(()) => Ok(SendOutcome::Sent),
            Err(e) => {
                logger.error(&format!("Failed to send to peer {}", self.id), &e);
                Ok(SendOutcome::Failed)
            }
        }
    }

    /// Tear the connection down
    ///
    /// Stops the receive loop, reports the id through the removal callback
    /// and shuts the socket. Later calls do nothing.
    pub async fn close(&self) {
        if self.closed.swap(true, Ordering::SeqCst) {
            return;
        }
        self.live.store(false, Ordering::SeqCst);
        self.cancel.cancel();
        (self.ctx.on_removed)(self.id);

        if let Some(mut stream) = self.writer.lock().await.take() {
            let _ = stream.shutdown().await;
        }
        log::debug!("Closed {:?} connection {}", self.direction, self.id);
    }

    fn spawn_receive(self: &Arc<Self>, reader: OwnedReadHalf) {
        let conn = Arc::clone(self);
        tokio::spawn(async move {
            conn.receive_loop(reader).await;
        });
    }

    async fn receive_loop(self: Arc<Self>, reader: OwnedReadHalf) {
        let max = self.ctx.config.max_frame_bytes;
        let logger = Arc::clone(&self.ctx.config.logger);
        let mut frames = FramedRead::new(reader, FrameCodec::new(max));

        loop {
            let next = tokio::select! {
                biased;
                _ = self.cancel.cancelled() => break,
                next = frames.next() => next,
            };

            match next {
                Some(Ok(payload)) => self.dispatch(payload),
                Some(Err(MeshError::Protocol(e))) => {
                    logger.error(
                        &format!("Peer {} broke the frame protocol, closing", self.id),
                        &e,
                    );
                    break;
                }
                Some(Err(e)) => {
                    logger.error(&format!("Connection to peer {} failed", self.id), &e);
                    match self.reconnect().await {
                        Some(reader) => frames = FramedRead::new(reader, FrameCodec::new(max)),
                        None => break,
                    }
                }
                None => {
                    logger.warning(&format!("Peer {} disconnected", self.id));
                    match self.reconnect().await {
                        Some(reader) => frames = FramedRead::new(reader, FrameCodec::new(max)),
                        None => break,
                    }
                }
            }
        }

        self.close().await;
    }

    /// Writer lock, or `None` once the connection is cancelled
    async fn lock_writer(&self) -> Option<MutexGuard<'_, Option<OwnedWriteHalf>>> {
        tokio::select! {
            biased;
            _ = self.cancel.cancelled() => None,
            writer = self.writer.lock() => Some(writer),
        }
    }

    fn dispatch(&self, payload: Bytes) {
        log::trace!("Frame of {} bytes from {}", payload.len(), self.id);
        (self.ctx.on_message)(self.id, payload);
    }

    /// Redial an outbound peer; inbound sockets cannot be redialed from here
    async fn reconnect(&self) -> Option<OwnedReadHalf> {
        let address = self.address.as_ref()?;
        self.live.store(false, Ordering::SeqCst);
        self.lock_writer().await?.take();

        tokio::select! {
            _ = self.cancel.cancelled() => return None,
            _ = tokio::time::sleep(self.ctx.config.poll_interval) => {}
        }

        let stream = dial(address, &self.ctx.config, &self.cancel).await.ok()?;
        let (reader, writer) = stream.into_split();
        *self.lock_writer().await? = Some(writer);
        self.live.store(true, Ordering::SeqCst);
        self.ctx
            .config
            .logger
            .message(&format!("Connection accepted from {}", address));
        Some(reader)
    }
}

impl fmt::Debug for PeerConnection {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("PeerConnection")
            .field("id", &self.id)
            .field("address", &self.address)
            .field("direction", &self.direction)
            .field("live", &self.is_live())
            .finish()
    }
}

/// Dial with up to `dial_retries` attempts, `retry_delay` apart
pub(crate) async fn dial(
    address: &Address,
    config: &NodeConfig,
    cancel: &CancellationToken,
) -> MeshResult<TcpStream> {
    let logger = &config.logger;
    let mut attempts = 0;
    let mut last_error = None;

    while attempts < config.dial_retries {
        if cancel.is_cancelled() {
            break;
        }
        attempts += 1;

        let attempt = tokio::select! {
            biased;
            _ = cancel.cancelled() => break,
            attempt = connect_once(address, config.max_frame_bytes) => attempt,
        };
        match attempt {
            Ok(stream) => return Ok(stream),
            Err(e) => last_error = Some(e),
        }

        if attempts >= config.dial_retries {
            break;
        }

        logger.warning(&format!(
            "Can't connect to {}. Will retry in {:?}. Retry: {}",
            address, config.retry_delay, attempts
        ));

        tokio::select! {
            _ = cancel.cancelled() => break,
            _ = tokio::time::sleep(config.retry_delay) => {}
        }
    }

    let cancelled = cancel.is_cancelled();
    let source = last_error.unwrap_or_else(|| {
        std::io::Error::new(std::io::ErrorKind::Interrupted, "dial cancelled")
    });
    let err = MeshError::Connection {
        address: address.clone(),
        attempts,
        source,
    };
    if cancelled {
        log::debug!("Dial to {} cancelled after {} attempts", address, attempts);
    } else {
        logger.error("Error while connecting to the peer", &err);
    }
    Err(err)
}

async fn write_frame(stream: &mut OwnedWriteHalf, frame: &[u8]) -> std::io::Result<()> {
    stream.write_all(frame).await?;
    stream.flush().await
}

async fn connect_once(address: &Address, max_frame_bytes: usize) -> std::io::Result<TcpStream> {
    let target = address.resolve().await?;
    let socket = if target.is_ipv4() {
        TcpSocket::new_v4()?
    } else {
        TcpSocket::new_v6()?
    };

    let buffer = (LENGTH_PREFIX + max_frame_bytes).min(u32::MAX as usize) as u32;
    socket.set_recv_buffer_size(buffer)?;
    socket.set_send_buffer_size(buffer)?;

    let stream = socket.connect(target).await?;
    stream.set_nodelay(true)?;
    Ok(stream)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::logging::testing::RecordingLogger;
    use bytes::BufMut;
    use std::sync::atomic::AtomicUsize;
    use std::time::Duration;
    use tokio::io::AsyncReadExt;
    use tokio::net::TcpListener;
    use tokio::sync::mpsc;
    use tokio::time::timeout;

    const WAIT: Duration = Duration::from_secs(5);

    struct Harness {
        ctx: ConnectionContext,
        logger: Arc<RecordingLogger>,
        messages: mpsc::UnboundedReceiver<(PeerId, Bytes)>,
        removed: mpsc::UnboundedReceiver<PeerId>,
    }

    fn harness(max_frame_bytes: usize, dial_retries: u32) -> Harness {
        let logger = Arc::new(RecordingLogger::default());
        let config = NodeConfig::default()
            .with_max_frame_bytes(max_frame_bytes)
            .with_dial_retries(dial_retries)
            .with_retry_delay(Duration::from_millis(20))
            .with_poll_interval(Duration::from_millis(20))
            .with_logger(logger.clone());

        let (msg_tx, messages) = mpsc::unbounded_channel();
        let (rm_tx, removed) = mpsc::unbounded_channel();
        let ctx = ConnectionContext {
            config: Arc::new(config),
            cancel: CancellationToken::new(),
            on_message: Arc::new(move |id, payload| {
                let _ = msg_tx.send((id, payload));
            }),
            on_removed: Arc::new(move |id| {
                let _ = rm_tx.send(id);
            }),
        };
        Harness {
            ctx,
            logger,
            messages,
            removed,
        }
    }

    /// Wait until `sent` stops growing, i.e. a send is parked on full buffers
    async fn wait_until_stalled(sent: &AtomicUsize) {
        timeout(WAIT, async {
            loop {
                let before = sent.load(Ordering::SeqCst);
                tokio::time::sleep(Duration::from_millis(100)).await;
                if before > 0 && sent.load(Ordering::SeqCst) == before {
                    break;
                }
            }
        })
        .await
        .expect("socket buffers never filled");
    }

    async fn unreachable_address() -> Address {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        drop(listener);
        Address::from(addr)
    }

    fn raw_frame(payload: &[u8]) -> Vec<u8> {
        let mut buf = BytesMut::new();
        buf.put_i32_le(payload.len() as i32);
        buf.put_slice(payload);
        buf.to_vec()
    }

    #[test]
    fn test_peer_id_display_and_parse() {
        let id = PeerId::random();
        assert!(!id.is_nil());
        let text = id.to_string();
        assert_eq!(text.len(), 32);
        assert_eq!(text.parse::<PeerId>().unwrap(), id);
        assert!("zz".parse::<PeerId>().is_err());
        assert!("abcd".parse::<PeerId>().is_err());
        assert!(PeerId::nil().is_nil());
    }

    #[tokio::test]
    async fn test_inbound_dispatches_frames_in_order() {
        let mut h = harness(1000, 1);
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let mut client = TcpStream::connect(listener.local_addr().unwrap())
            .await
            .unwrap();
        let (server, _) = listener.accept().await.unwrap();

        let conn = PeerConnection::accept(server, h.ctx.clone());
        assert_eq!(conn.direction(), Direction::Inbound);
        assert!(conn.address().is_none());
        assert!(conn.is_live());

        let mut wire = raw_frame(b"first");
        wire.extend(raw_frame(b""));
        wire.extend(raw_frame(b"third"));
        client.write_all(&wire).await.unwrap();

        for expected in [&b"first"[..], &b""[..], &b"third"[..]] {
            let (id, payload) = timeout(WAIT, h.messages.recv()).await.unwrap().unwrap();
            assert_eq!(id, conn.id());
            assert_eq!(payload.as_ref(), expected);
        }
        assert_eq!(h.logger.messages(), vec!["Connection accepted"]);
    }

    #[tokio::test]
    async fn test_inbound_disconnect_tears_down() {
        let mut h = harness(1000, 1);
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let client = TcpStream::connect(listener.local_addr().unwrap())
            .await
            .unwrap();
        let (server, _) = listener.accept().await.unwrap();
        let conn = PeerConnection::accept(server, h.ctx.clone());

        drop(client);

        let removed = timeout(WAIT, h.removed.recv()).await.unwrap().unwrap();
        assert_eq!(removed, conn.id());
        assert!(conn.is_closed());
        assert!(!conn.is_live());
    }

    #[tokio::test]
    async fn test_oversized_receive_closes_without_dispatch() {
        let mut h = harness(16, 1);
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let mut client = TcpStream::connect(listener.local_addr().unwrap())
            .await
            .unwrap();
        let (server, _) = listener.accept().await.unwrap();
        let conn = PeerConnection::accept(server, h.ctx.clone());

        client.write_all(&raw_frame(&[1u8; 17])).await.unwrap();

        let removed = timeout(WAIT, h.removed.recv()).await.unwrap().unwrap();
        assert_eq!(removed, conn.id());
        assert!(h.messages.try_recv().is_err());

        let mut buf = [0u8; 1];
        let read = timeout(WAIT, client.read(&mut buf)).await.unwrap();
        assert!(matches!(read, Ok(0) | Err(_)));
    }

    #[tokio::test]
    async fn test_oversized_send_fails_then_valid_send_works() {
        let h = harness(8, 1);
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let address = Address::from(listener.local_addr().unwrap());

        let conn = PeerConnection::connect(address, h.ctx.clone()).await.unwrap();
        let (mut remote, _) = listener.accept().await.unwrap();

        let err = conn.send(&[0u8; 9]).await.unwrap_err();
        assert!(err.is_protocol());

        assert_eq!(conn.send(b"ok").await.unwrap(), SendOutcome::Sent);

        let mut buf = [0u8; 6];
        timeout(WAIT, remote.read_exact(&mut buf))
            .await
            .unwrap()
            .unwrap();
        assert_eq!(&buf, &[2, 0, 0, 0, b'o', b'k']);
    }

    #[tokio::test]
    async fn test_dial_retry_policy() {
        let h = harness(1000, 3);
        let address = unreachable_address().await;

        let started = std::time::Instant::now();
        let err = PeerConnection::connect(address.clone(), h.ctx.clone())
            .await
            .unwrap_err();

        match err {
            MeshError::Connection {
                address: failed,
                attempts,
                ..
            } => {
                assert_eq!(failed, address);
                assert_eq!(attempts, 3);
            }
            other => panic!("unexpected error: {other}"),
        }

        let warnings = h.logger.warnings();
        assert_eq!(warnings.len(), 2);
        assert!(warnings[0].contains(&address.to_string()));
        assert!(warnings[0].ends_with("Retry: 1"));
        assert!(warnings[1].ends_with("Retry: 2"));
        assert_eq!(h.logger.errors(), vec!["Error while connecting to the peer"]);
        assert!(started.elapsed() >= Duration::from_millis(40));
    }

    #[tokio::test]
    async fn test_dial_stops_when_cancelled() {
        let h = harness(1000, 50);
        let address = unreachable_address().await;
        h.ctx.cancel.cancel();

        let err = PeerConnection::connect(address, h.ctx.clone())
            .await
            .unwrap_err();
        assert!(matches!(err, MeshError::Connection { attempts: 0, .. }));
        assert!(h.logger.errors().is_empty());
    }

    #[tokio::test]
    async fn test_outbound_redials_after_remote_disconnect() {
        let mut h = harness(1000, 20);
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let address = Address::from(listener.local_addr().unwrap());

        let conn = PeerConnection::connect(address, h.ctx.clone()).await.unwrap();
        let (first, _) = listener.accept().await.unwrap();
        drop(first);

        let (mut second, _) = timeout(WAIT, listener.accept()).await.unwrap().unwrap();

        second.write_all(&raw_frame(b"again")).await.unwrap();
        let (id, payload) = timeout(WAIT, h.messages.recv()).await.unwrap().unwrap();
        assert_eq!(id, conn.id());
        assert_eq!(payload.as_ref(), b"again");
        assert!(conn.is_live());
        assert!(!conn.is_closed());
        assert!(h.removed.try_recv().is_err());
    }

    #[tokio::test]
    async fn test_close_is_idempotent() {
        let mut h = harness(1000, 1);
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let address = Address::from(listener.local_addr().unwrap());
        let conn = PeerConnection::connect(address, h.ctx.clone()).await.unwrap();

        conn.close().await;
        conn.close().await;

        assert_eq!(h.removed.recv().await.unwrap(), conn.id());
        tokio::time::sleep(Duration::from_millis(50)).await;
        assert!(h.removed.try_recv().is_err());
        assert_eq!(conn.send(b"late").await.unwrap(), SendOutcome::Failed);
    }

    #[tokio::test(flavor = "multi_thread")]
    async fn test_close_aborts_send_parked_on_full_socket() {
        let mut h = harness(1000, 1);
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        // Never reads, so the server side's writes eventually block.
        let _client = TcpStream::connect(listener.local_addr().unwrap())
            .await
            .unwrap();
        let (server, _) = listener.accept().await.unwrap();
        let conn = PeerConnection::accept(server, h.ctx.clone());

        let sent = Arc::new(AtomicUsize::new(0));
        let sender = {
            let conn = conn.clone();
            let sent = sent.clone();
            tokio::spawn(async move {
                loop {
                    match conn.send(&[0u8; 1000]).await.unwrap() {
                        SendOutcome::Sent => {
                            sent.fetch_add(1, Ordering::SeqCst);
                        }
                        outcome => return outcome,
                    }
                }
            })
        };
        wait_until_stalled(&sent).await;

        timeout(WAIT, conn.close())
            .await
            .expect("close waited behind a parked send");
        assert!(conn.is_closed());
        assert_eq!(
            timeout(WAIT, h.removed.recv()).await.unwrap().unwrap(),
            conn.id()
        );
        assert_eq!(
            timeout(WAIT, sender).await.unwrap().unwrap(),
            SendOutcome::Failed
        );
    }
}
