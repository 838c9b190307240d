//! TCP transport and connection handling
//!
//! A logical connection is one TCP socket used as a keep-alive control
//! channel. Every stream is its own TCP socket, opened to the remote's listen
//! address and tagged with a protocol id during the handshake. All sockets
//! start with a signed [`Hello`] frame.

use crate::crypto::{PeerId, PeerIdentity};
use crate::network::message::{Hello, Message, Purpose, MAGIC, MAX_FRAME_SIZE, PROTOCOL_VERSION};
use crate::network::multiaddr::{Multiaddr, PeerAddrInfo};
use bytes::{Buf, BufMut, Bytes, BytesMut};
use futures::sink::SinkExt;
use futures::stream::{SplitSink, SplitStream, StreamExt};
use std::net::SocketAddr;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;
use thiserror::Error;
use tokio::net::{TcpListener, TcpStream};
use tokio::sync::{mpsc, Mutex};
use tokio::time::MissedTickBehavior;
use tokio_util::codec::{Decoder, Encoder, Framed};
use tokio_util::sync::CancellationToken;

/// Time allowed for an inbound socket to present its hello
const HANDSHAKE_TIMEOUT: Duration = Duration::from_secs(5);

/// Ping interval on connection control channels
const KEEPALIVE_INTERVAL: Duration = Duration::from_secs(15);

/// Unanswered pings before a connection is considered dead
const MAX_MISSED_PONGS: u32 = 3;

/// Capacity of the inbound event queue
const INBOUND_QUEUE: usize = 256;

pub type FramedSocket = Framed<TcpStream, FrameCodec>;

/// Dial errors (per attempt, recoverable)
#[derive(Error, Debug)]
pub enum DialError {
    #[error("Dial to {addr} timed out")]
    Timeout { addr: Multiaddr },
    #[error("Connection to {addr} failed: {source}")]
    Io {
        addr: Multiaddr,
        #[source]
        source: std::io::Error,
    },
    #[error("Handshake with {addr} failed: {reason}")]
    Handshake { addr: Multiaddr, reason: String },
    #[error("Peer at {addr} is {actual}, expected {expected}")]
    PeerIdMismatch {
        addr: Multiaddr,
        expected: PeerId,
        actual: PeerId,
    },
    #[error("Refusing to dial our own peer id")]
    SelfDial,
    #[error("No addresses known for peer {0}")]
    NoAddresses(PeerId),
}

/// Stream errors (per stream, recoverable)
#[derive(Error, Debug)]
pub enum StreamError {
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),
    #[error("Serialization error: {0}")]
    Serialization(#[from] serde_json::Error),
    #[error("Timed out")]
    Timeout,
    #[error("Handshake failed: {0}")]
    Handshake(String),
    #[error("Protocol {protocol} rejected by remote: {reason}")]
    Rejected { protocol: String, reason: String },
    #[error("Unexpected {0} message")]
    Unexpected(&'static str),
    #[error("Stream closed")]
    Closed,
    #[error("Connection closed")]
    ConnectionClosed,
}

/// Length-prefixed framing: magic (4) + length (4, big endian) + payload
pub struct FrameCodec;

impl Encoder<Bytes> for FrameCodec {
    type Error = std::io::Error;

    fn encode(&mut self, item: Bytes, dst: &mut BytesMut) -> Result<(), Self::Error> {
        if item.len() > MAX_FRAME_SIZE {
            return Err(std::io::Error::new(
                std::io::ErrorKind::InvalidInput,
                format!("frame of {} bytes exceeds limit", item.len()),
            ));
        }

        dst.reserve(8 + item.len());
        dst.put_slice(&MAGIC);
        dst.put_u32(item.len() as u32);
        dst.put_slice(&item);

        Ok(())
    }
}

impl Decoder for FrameCodec {
    type Item = BytesMut;
    type Error = std::io::Error;

    fn decode(&mut self, src: &mut BytesMut) -> Result<Option<Self::Item>, Self::Error> {
        // Need at least header
        if src.len() < 8 {
            return Ok(None);
        }

        if src[..4] != MAGIC {
            return Err(std::io::Error::new(
                std::io::ErrorKind::InvalidData,
                "Invalid magic bytes",
            ));
        }

        let len = u32::from_be_bytes([src[4], src[5], src[6], src[7]]) as usize;
        if len > MAX_FRAME_SIZE {
            return Err(std::io::Error::new(
                std::io::ErrorKind::InvalidData,
                format!("frame of {} bytes exceeds limit", len),
            ));
        }

        if src.len() < 8 + len {
            src.reserve(8 + len - src.len());
            return Ok(None);
        }

        src.advance(8);
        Ok(Some(src.split_to(len)))
    }
}

async fn send_message<S>(sink: &mut S, msg: &Message) -> Result<(), StreamError>
where
    S: futures::Sink<Bytes, Error = std::io::Error> + Unpin,
{
    sink.send(Bytes::from(msg.to_bytes()?)).await?;
    Ok(())
}

async fn recv_message<S>(frames: &mut S) -> Result<Message, StreamError>
where
    S: futures::Stream<Item = Result<BytesMut, std::io::Error>> + Unpin,
{
    match frames.next().await {
        Some(Ok(frame)) => Ok(Message::from_bytes(&frame)?),
        Some(Err(e)) => Err(e.into()),
        None => Err(StreamError::Closed),
    }
}

/// Which side dialed a connection or opened a stream
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Direction {
    Inbound,
    Outbound,
}

/// What the local host presents to remotes
pub struct LocalPeer {
    identity: Arc<PeerIdentity>,
    listen_addr: Multiaddr,
    stream_timeout: Duration,
    next_id: AtomicU64,
}

impl LocalPeer {
    pub fn new(identity: Arc<PeerIdentity>, listen_addr: Multiaddr, stream_timeout: Duration) -> Self {
        Self {
            identity,
            listen_addr,
            stream_timeout,
            next_id: AtomicU64::new(1),
        }
    }

    pub fn peer_id(&self) -> PeerId {
        self.identity.peer_id()
    }

    fn hello(&self, purpose: Purpose) -> Hello {
        Hello::new(&self.identity, self.listen_addr.clone(), purpose)
    }

    fn next_id(&self) -> u64 {
        self.next_id.fetch_add(1, Ordering::Relaxed)
    }
}

fn check_hello(hello: &Hello, local: &LocalPeer) -> Result<(), String> {
    if hello.version != PROTOCOL_VERSION {
        return Err(format!("unsupported protocol version {}", hello.version));
    }
    hello.verify().map_err(|e| e.to_string())?;
    if hello.peer_id == local.peer_id() {
        return Err("remote presented our own peer id".to_string());
    }
    Ok(())
}

/// Something the listener accepted
pub enum InboundEvent {
    Connection(Connection),
    Stream(InboundStream),
}

/// A logical connection to a remote peer.
///
/// Liveness is tracked on the control socket; once it fails or [`close`]
/// is called the connection stays closed for good.
///
/// [`close`]: Connection::close
pub struct Connection {
    id: u64,
    remote_peer: PeerId,
    remote_addr: Multiaddr,
    direction: Direction,
    local: Arc<LocalPeer>,
    closed: CancellationToken,
}

impl Connection {
    fn spawn(
        remote_peer: PeerId,
        remote_addr: Multiaddr,
        direction: Direction,
        socket: FramedSocket,
        local: Arc<LocalPeer>,
    ) -> Self {
        let closed = CancellationToken::new();
        tokio::spawn(run_control(socket, remote_peer, closed.clone()));

        Self {
            id: local.next_id(),
            remote_peer,
            remote_addr,
            direction,
            local,
            closed,
        }
    }

    pub fn id(&self) -> u64 {
        self.id
    }

    pub fn remote_peer(&self) -> PeerId {
        self.remote_peer
    }

    /// Listen address of the remote (no `/p2p/` suffix)
    pub fn remote_addr(&self) -> &Multiaddr {
        &self.remote_addr
    }

    pub fn remote_info(&self) -> PeerAddrInfo {
        PeerAddrInfo::new(self.remote_peer, vec![self.remote_addr.clone()])
    }

    pub fn direction(&self) -> Direction {
        self.direction
    }

    /// The peer that dialed this connection
    pub fn dialer(&self) -> PeerId {
        match self.direction {
            Direction::Outbound => self.local.peer_id(),
            Direction::Inbound => self.remote_peer,
        }
    }

    pub fn is_closed(&self) -> bool {
        self.closed.is_cancelled()
    }

    pub fn close(&self) {
        self.closed.cancel();
    }

    /// Resolves once the connection is closed, locally or by the transport
    pub async fn closed(&self) {
        self.closed.cancelled().await
    }

    /// Open a stream tagged with `protocol` to the remote peer
    pub async fn open_stream(&self, protocol: &str) -> Result<Stream, StreamError> {
        if self.is_closed() {
            return Err(StreamError::ConnectionClosed);
        }

        let negotiate = async {
            let socket = TcpStream::connect(self.remote_addr.socket_addr()).await?;
            let mut framed = Framed::new(socket, FrameCodec);
            let hello = self.local.hello(Purpose::Stream {
                protocol: protocol.to_string(),
            });
            send_message(&mut framed, &Message::Hello(hello)).await?;

            match recv_message(&mut framed).await? {
                Message::StreamAccepted => Ok(framed),
                Message::StreamRejected(reason) => Err(StreamError::Rejected {
                    protocol: protocol.to_string(),
                    reason,
                }),
                other => Err(StreamError::Unexpected(other.type_name())),
            }
        };

        let framed = tokio::select! {
            _ = self.closed.cancelled() => return Err(StreamError::ConnectionClosed),
            result = tokio::time::timeout(self.local.stream_timeout, negotiate) => {
                result.map_err(|_| StreamError::Timeout)??
            }
        };

        log::debug!("Opened {} stream to {}", protocol, self.remote_peer);
        Ok(Stream::new(
            self.local.next_id(),
            protocol.to_string(),
            self.remote_peer,
            Direction::Outbound,
            framed,
        ))
    }
}

impl Drop for Connection {
    fn drop(&mut self) {
        self.closed.cancel();
    }
}

/// Drive the control socket: answer pings, send keep-alives, notice EOF
async fn run_control(socket: FramedSocket, remote: PeerId, closed: CancellationToken) {
    let (mut sink, mut frames) = socket.split();
    let mut keepalive = tokio::time::interval(KEEPALIVE_INTERVAL);
    keepalive.set_missed_tick_behavior(MissedTickBehavior::Delay);
    keepalive.tick().await;

    let mut nonce: u64 = 0;
    let mut missed: u32 = 0;

    loop {
        tokio::select! {
            _ = closed.cancelled() => break,
            _ = keepalive.tick() => {
                if missed >= MAX_MISSED_PONGS {
                    log::warn!("Peer {} stopped answering keep-alives", remote);
                    break;
                }
                missed += 1;
                nonce = nonce.wrapping_add(1);
                if send_message(&mut sink, &Message::Ping(nonce)).await.is_err() {
                    break;
                }
            }
            frame = frames.next() => match frame {
                Some(Ok(bytes)) => match Message::from_bytes(&bytes) {
                    Ok(Message::Ping(n)) => {
                        if send_message(&mut sink, &Message::Pong(n)).await.is_err() {
                            break;
                        }
                    }
                    Ok(Message::Pong(_)) => missed = 0,
                    Ok(other) => {
                        log::debug!("Ignoring {} on control channel from {}", other.type_name(), remote);
                    }
                    Err(e) => {
                        log::warn!("Malformed control frame from {}: {}", remote, e);
                        break;
                    }
                },
                Some(Err(e)) => {
                    log::warn!("Error reading from {}: {}", remote, e);
                    break;
                }
                None => {
                    log::info!("Peer {} disconnected", remote);
                    break;
                }
            }
        }
    }

    closed.cancel();
}

/// A protocol-tagged stream to one peer.
///
/// Reads and writes are independently locked, so one task can block in
/// [`read_frame`](Stream::read_frame) while others write.
pub struct Stream {
    id: u64,
    protocol: String,
    remote_peer: PeerId,
    direction: Direction,
    writer: Mutex<SplitSink<FramedSocket, Bytes>>,
    reader: Mutex<SplitStream<FramedSocket>>,
    closed: CancellationToken,
}

impl Stream {
    pub(crate) fn new(
        id: u64,
        protocol: String,
        remote_peer: PeerId,
        direction: Direction,
        socket: FramedSocket,
    ) -> Self {
        let (writer, reader) = socket.split();
        Self {
            id,
            protocol,
            remote_peer,
            direction,
            writer: Mutex::new(writer),
            reader: Mutex::new(reader),
            closed: CancellationToken::new(),
        }
    }

    pub fn id(&self) -> u64 {
        self.id
    }

    pub fn protocol(&self) -> &str {
        &self.protocol
    }

    pub fn remote_peer(&self) -> PeerId {
        self.remote_peer
    }

    pub fn direction(&self) -> Direction {
        self.direction
    }

    pub fn is_closed(&self) -> bool {
        self.closed.is_cancelled()
    }

    /// Flag the stream closed without waiting on the socket
    pub fn mark_closed(&self) {
        self.closed.cancel();
    }

    /// Write one frame
    pub async fn write_frame(&self, payload: Bytes) -> Result<(), StreamError> {
        if self.is_closed() {
            return Err(StreamError::Closed);
        }
        let mut writer = self.writer.lock().await;
        writer.send(payload).await?;
        Ok(())
    }

    /// Read one frame; `None` on EOF or after the stream was closed locally
    pub async fn read_frame(&self) -> Result<Option<BytesMut>, StreamError> {
        let mut reader = self.reader.lock().await;
        tokio::select! {
            _ = self.closed.cancelled() => Ok(None),
            frame = reader.next() => match frame {
                Some(Ok(frame)) => Ok(Some(frame)),
                Some(Err(e)) => Err(e.into()),
                None => Ok(None),
            },
        }
    }

    pub async fn write_message(&self, msg: &Message) -> Result<(), StreamError> {
        self.write_frame(Bytes::from(msg.to_bytes()?)).await
    }

    pub async fn read_message(&self) -> Result<Option<Message>, StreamError> {
        match self.read_frame().await? {
            Some(frame) => Ok(Some(Message::from_bytes(&frame)?)),
            None => Ok(None),
        }
    }

    /// Mark closed and shut down the write half
    pub async fn close(&self) {
        self.closed.cancel();
        let mut writer = self.writer.lock().await;
        if let Err(e) = writer.close().await {
            log::debug!("Closing {} stream to {}: {}", self.protocol, self.remote_peer, e);
        }
    }
}

/// An inbound stream waiting for the local side to accept or reject it
pub struct InboundStream {
    id: u64,
    protocol: String,
    remote_peer: PeerId,
    remote_addr: Multiaddr,
    socket: FramedSocket,
}

impl InboundStream {
    pub fn protocol(&self) -> &str {
        &self.protocol
    }

    pub fn remote_peer(&self) -> PeerId {
        self.remote_peer
    }

    pub fn remote_info(&self) -> PeerAddrInfo {
        PeerAddrInfo::new(self.remote_peer, vec![self.remote_addr.clone()])
    }

    /// Confirm the protocol to the opener and hand out the stream
    pub async fn accept(mut self) -> Result<Stream, StreamError> {
        send_message(&mut self.socket, &Message::StreamAccepted).await?;
        Ok(Stream::new(
            self.id,
            self.protocol,
            self.remote_peer,
            Direction::Inbound,
            self.socket,
        ))
    }

    /// Refuse the stream and close the socket
    pub async fn reject(mut self, reason: &str) {
        let msg = Message::StreamRejected(reason.to_string());
        if let Err(e) = send_message(&mut self.socket, &msg).await {
            log::debug!("Could not deliver rejection to {}: {}", self.remote_peer, e);
        }
        let _ = SinkExt::<Bytes>::close(&mut self.socket).await;
    }
}

/// The listening side of the transport, and the dialer
pub struct Host {
    local: Arc<LocalPeer>,
    bound_addr: SocketAddr,
    listen_addrs: Vec<Multiaddr>,
    shutdown: CancellationToken,
}

impl Host {
    /// Bind `bind` and start accepting. Inbound connections and streams are
    /// delivered on the returned channel once their handshake completed.
    pub async fn listen(
        identity: Arc<PeerIdentity>,
        bind: SocketAddr,
        stream_timeout: Duration,
    ) -> Result<(Self, mpsc::Receiver<InboundEvent>), std::io::Error> {
        let listener = TcpListener::bind(bind).await?;
        let bound_addr = listener.local_addr()?;
        let local = Arc::new(LocalPeer::new(
            identity,
            Multiaddr::dialable(bound_addr),
            stream_timeout,
        ));
        let listen_addrs = Multiaddr::reachable(bound_addr);
        log::info!("Host {} listening on {}", local.peer_id(), bound_addr);

        let (events_tx, events_rx) = mpsc::channel(INBOUND_QUEUE);
        let shutdown = CancellationToken::new();
        tokio::spawn(accept_loop(
            listener,
            local.clone(),
            events_tx,
            shutdown.clone(),
        ));

        Ok((
            Self {
                local,
                bound_addr,
                listen_addrs,
                shutdown,
            },
            events_rx,
        ))
    }

    pub fn peer_id(&self) -> PeerId {
        self.local.peer_id()
    }

    /// The socket address actually bound
    pub fn bound_addr(&self) -> SocketAddr {
        self.bound_addr
    }

    /// Addresses remotes can dial, without `/p2p/`
    pub fn listen_addrs(&self) -> Vec<Multiaddr> {
        self.listen_addrs.clone()
    }

    pub fn local_info(&self) -> PeerAddrInfo {
        PeerAddrInfo::new(self.peer_id(), self.listen_addrs())
    }

    /// Stop accepting new sockets
    pub fn close(&self) {
        self.shutdown.cancel();
    }

    /// Dial `addr`, run the handshake and check that the remote is `peer`
    pub async fn dial(
        &self,
        peer: &PeerId,
        addr: &Multiaddr,
        timeout: Duration,
    ) -> Result<Connection, DialError> {
        if *peer == self.peer_id() {
            return Err(DialError::SelfDial);
        }
        let target = addr.without_peer();

        let handshake = async {
            let socket = TcpStream::connect(target.socket_addr())
                .await
                .map_err(|source| DialError::Io {
                    addr: target.clone(),
                    source,
                })?;
            let mut framed = Framed::new(socket, FrameCodec);
            let fail = |reason: String| DialError::Handshake {
                addr: target.clone(),
                reason,
            };

            send_message(&mut framed, &Message::Hello(self.local.hello(Purpose::Connection)))
                .await
                .map_err(|e| fail(e.to_string()))?;
            let hello = match recv_message(&mut framed).await.map_err(|e| fail(e.to_string()))? {
                Message::Hello(hello) => hello,
                other => return Err(fail(format!("unexpected {}", other.type_name()))),
            };
            check_hello(&hello, &self.local).map_err(fail)?;
            if hello.peer_id != *peer {
                return Err(DialError::PeerIdMismatch {
                    addr: target.clone(),
                    expected: *peer,
                    actual: hello.peer_id,
                });
            }

            Ok(Connection::spawn(
                hello.peer_id,
                target.clone(),
                Direction::Outbound,
                framed,
                self.local.clone(),
            ))
        };

        match tokio::time::timeout(timeout, handshake).await {
            Ok(result) => result,
            Err(_) => Err(DialError::Timeout {
                addr: addr.without_peer(),
            }),
        }
    }
}

impl Drop for Host {
    fn drop(&mut self) {
        self.shutdown.cancel();
    }
}

async fn accept_loop(
    listener: TcpListener,
    local: Arc<LocalPeer>,
    events: mpsc::Sender<InboundEvent>,
    shutdown: CancellationToken,
) {
    loop {
        let (socket, addr) = tokio::select! {
            _ = shutdown.cancelled() => break,
            accepted = listener.accept() => match accepted {
                Ok(pair) => pair,
                Err(e) => {
                    log::error!("Accept error: {}", e);
                    tokio::time::sleep(Duration::from_millis(100)).await;
                    continue;
                }
            },
        };

        let local = local.clone();
        let events = events.clone();
        tokio::spawn(async move {
            match tokio::time::timeout(HANDSHAKE_TIMEOUT, handshake_inbound(socket, addr, local)).await {
                Ok(Ok(event)) => {
                    if events.send(event).await.is_err() {
                        log::debug!("Dropping inbound socket from {}: host stopped", addr);
                    }
                }
                Ok(Err(e)) => log::warn!("Inbound handshake from {} failed: {}", addr, e),
                Err(_) => log::warn!("Inbound handshake from {} timed out", addr),
            }
        });
    }

    log::info!("Listener for {} stopped", local.peer_id());
}

async fn handshake_inbound(
    socket: TcpStream,
    observed: SocketAddr,
    local: Arc<LocalPeer>,
) -> Result<InboundEvent, StreamError> {
    let mut framed = Framed::new(socket, FrameCodec);
    let hello = match recv_message(&mut framed).await? {
        Message::Hello(hello) => hello,
        other => return Err(StreamError::Unexpected(other.type_name())),
    };
    check_hello(&hello, &local).map_err(StreamError::Handshake)?;

    // Trust the advertised port but not the advertised ip, which may be a
    // wildcard or loopback address from the remote's point of view
    let remote_addr = Multiaddr::new(SocketAddr::new(
        observed.ip(),
        hello.listen_addr.socket_addr().port(),
    ));

    match hello.purpose {
        Purpose::Connection => {
            send_message(&mut framed, &Message::Hello(local.hello(Purpose::Connection))).await?;
            log::info!("Incoming connection from {} ({})", hello.peer_id, observed);
            Ok(InboundEvent::Connection(Connection::spawn(
                hello.peer_id,
                remote_addr,
                Direction::Inbound,
                framed,
                local,
            )))
        }
        Purpose::Stream { protocol } => Ok(InboundEvent::Stream(InboundStream {
            id: local.next_id(),
            protocol,
            remote_peer: hello.peer_id,
            remote_addr,
            socket: framed,
        })),
    }
}

#[cfg(test)]
pub(crate) mod testing {
    use super::*;

    /// Two framed ends of a loopback TCP socket
    pub async fn socket_pair() -> (FramedSocket, FramedSocket) {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        let (client, accepted) = tokio::join!(TcpStream::connect(addr), listener.accept());
        (
            Framed::new(client.unwrap(), FrameCodec),
            Framed::new(accepted.unwrap().0, FrameCodec),
        )
    }

    pub fn local_peer(identity: &PeerIdentity) -> Arc<LocalPeer> {
        Arc::new(LocalPeer::new(
            Arc::new(identity.clone()),
            "/ip4/127.0.0.1/tcp/1".parse().unwrap(),
            Duration::from_secs(2),
        ))
    }

    /// A connection backed by a real socket; the far end is returned so the
    /// control task does not see EOF
    pub async fn connection(
        local: &Arc<LocalPeer>,
        remote: PeerId,
        direction: Direction,
    ) -> (Connection, FramedSocket) {
        let (near, far) = socket_pair().await;
        let conn = Connection::spawn(
            remote,
            "/ip4/127.0.0.1/tcp/2".parse().unwrap(),
            direction,
            near,
            local.clone(),
        );
        (conn, far)
    }

    /// Outbound stream plus the remote's inbound end
    pub async fn stream_pair(id: u64, protocol: &str, remote: PeerId, local: PeerId) -> (Stream, Stream) {
        let (near, far) = socket_pair().await;
        (
            Stream::new(id, protocol.to_string(), remote, Direction::Outbound, near),
            Stream::new(id, protocol.to_string(), local, Direction::Inbound, far),
        )
    }
}
