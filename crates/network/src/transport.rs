//! Framed TCP transport.
//!
//! The transport owns the listener and a read loop per connection. Each
//! read loop parses one-byte-tagged frames: message frames are pushed
//! onto a shared bounded inbound queue, while a stream frame opens the
//! peer's stream gate and parks the loop until the stream consumer
//! signals completion. Failing to close the gate wedges the connection.

use crate::message::{InboundEvent, ProtocolError, MAX_MESSAGE_BYTES, MESSAGE_FRAME, STREAM_FRAME};
use crate::sync_wait::wait_until;
use parking_lot::Mutex as SyncMutex;
use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWriteExt};
use tokio::net::tcp::{OwnedReadHalf, OwnedWriteHalf};
use tokio::net::{TcpListener, TcpStream};
use tokio::sync::{mpsc, watch, Mutex, MutexGuard};
use tokio::time::timeout;
use tracing::{debug, info, warn};

/// Transport errors
#[derive(Debug, thiserror::Error)]
pub enum TransportError {
    #[error("failed to bind listener on {addr}: {source}")]
    Bind {
        addr: String,
        #[source]
        source: std::io::Error,
    },
    #[error("failed to connect to {addr} after {attempts} attempts: {source}")]
    DialFailed {
        addr: String,
        attempts: usize,
        #[source]
        source: std::io::Error,
    },
    #[error(transparent)]
    Protocol(#[from] ProtocolError),
    #[error(transparent)]
    Io(#[from] std::io::Error),
}

/// Transport configuration.
#[derive(Debug, Clone)]
pub struct TransportConfig {
    pub listen_addr: String,
    pub dial_timeout: Duration,
    pub max_retries: usize,
    pub retry_delay: Duration,
    pub inbound_capacity: usize,
}

impl TransportConfig {
    pub fn new(listen_addr: impl Into<String>) -> Self {
        Self {
            listen_addr: listen_addr.into(),
            dial_timeout: Duration::from_secs(10),
            max_retries: 3,
            retry_delay: Duration::from_secs(2),
            inbound_capacity: 1024,
        }
    }
}

/// Handshake run before any frame is exchanged. The baseline accepts
/// everything; a future implementation may gate acceptance here.
pub type HandshakeFn = Arc<dyn Fn(&TcpPeer) -> anyhow::Result<()> + Send + Sync>;

/// Invoked once a connection has passed the handshake.
pub type OnPeerFn = Arc<dyn Fn(Arc<TcpPeer>) -> anyhow::Result<()> + Send + Sync>;

/// Invoked when a connection's read loop exits.
pub type OnPeerClosedFn = Arc<dyn Fn(&str) + Send + Sync>;

/// The no-op baseline handshake.
pub fn noop_handshake(_peer: &TcpPeer) -> anyhow::Result<()> {
    Ok(())
}

/// Latch handed between a read loop and a stream consumer.
///
/// The read loop opens the gate when it sees a stream frame and then
/// waits for it to close; the consumer waits for it to open, reads the
/// stream, and closes it.
struct StreamGate {
    state: watch::Sender<bool>,
}

impl StreamGate {
    fn new() -> Self {
        Self {
            state: watch::channel(false).0,
        }
    }

    fn open(&self) {
        let _ = self.state.send(true);
    }

    fn close(&self) {
        let _ = self.state.send(false);
    }

    fn is_open(&self) -> bool {
        *self.state.borrow()
    }

    async fn wait_closed(&self) {
        let mut rx = self.state.subscribe();
        let _ = rx.wait_for(|open| !*open).await;
    }

    async fn wait_open(&self, wait: Duration) -> bool {
        let mut rx = self.state.subscribe();
        let result = timeout(wait, rx.wait_for(|open| *open)).await;
        matches!(result, Ok(Ok(_)))
    }
}

/// One live connection to a remote node.
///
/// The read half belongs to the connection's read loop except while the
/// stream gate is open, when the stream consumer takes it over. The
/// write half is shared; multi-part writes must hold the writer guard
/// for the whole sequence to keep frames from interleaving.
pub struct TcpPeer {
    remote_addr: SocketAddr,
    outbound: bool,
    reader: Mutex<OwnedReadHalf>,
    writer: Mutex<OwnedWriteHalf>,
    gate: StreamGate,
}

impl TcpPeer {
    pub(crate) fn new(remote_addr: SocketAddr, outbound: bool, stream: TcpStream) -> Self {
        let (reader, writer) = stream.into_split();
        Self {
            remote_addr,
            outbound,
            reader: Mutex::new(reader),
            writer: Mutex::new(writer),
            gate: StreamGate::new(),
        }
    }

    pub fn remote_addr(&self) -> SocketAddr {
        self.remote_addr
    }

    pub fn is_outbound(&self) -> bool {
        self.outbound
    }

    /// Write one buffer to the connection.
    pub async fn send(&self, bytes: &[u8]) -> std::io::Result<()> {
        let mut writer = self.writer.lock().await;
        writer.write_all(bytes).await
    }

    /// Take the write half for a multi-part sequence.
    pub async fn writer(&self) -> MutexGuard<'_, OwnedWriteHalf> {
        self.writer.lock().await
    }

    /// Take the read half. Only meaningful while the stream gate is
    /// open; otherwise this competes with the read loop.
    pub async fn reader(&self) -> MutexGuard<'_, OwnedReadHalf> {
        self.reader.lock().await
    }

    /// True while the read loop is parked on an incoming stream.
    pub fn is_streaming(&self) -> bool {
        self.gate.is_open()
    }

    /// Wait until the read loop hands the connection over, bounded by
    /// `wait`. Returns false when no stream started in time.
    pub async fn await_stream(&self, wait: Duration) -> bool {
        self.gate.wait_open(wait).await
    }

    /// Signal that the current stream has been fully consumed, resuming
    /// the read loop.
    pub fn close_stream(&self) {
        self.gate.close();
    }
}

#[derive(Debug)]
enum Frame {
    Message(Vec<u8>),
    StreamStart,
}

async fn read_frame<R>(reader: &mut R) -> Result<Frame, TransportError>
where
    R: AsyncRead + Unpin + ?Sized,
{
    let tag = reader.read_u8().await?;
    match tag {
        MESSAGE_FRAME => {
            let len = reader.read_u32_le().await? as usize;
            if len > MAX_MESSAGE_BYTES {
                return Err(ProtocolError::MessageTooLarge(len).into());
            }
            let mut body = vec![0u8; len];
            reader.read_exact(&mut body).await?;
            Ok(Frame::Message(body))
        }
        STREAM_FRAME => Ok(Frame::StreamStart),
        other => Err(ProtocolError::UnknownFrame(other).into()),
    }
}

/// TCP transport: listener, dialer, and the per-connection read loops.
pub struct TcpTransport {
    config: TransportConfig,
    handshake: HandshakeFn,
    on_peer: SyncMutex<Option<OnPeerFn>>,
    on_peer_closed: SyncMutex<Option<OnPeerClosedFn>>,
    inbound_tx: mpsc::Sender<InboundEvent>,
    inbound_rx: SyncMutex<Option<mpsc::Receiver<InboundEvent>>>,
    local_addr: SyncMutex<Option<SocketAddr>>,
    shutdown: watch::Sender<bool>,
}

impl TcpTransport {
    pub fn new(config: TransportConfig) -> Arc<Self> {
        Self::with_handshake(config, Arc::new(noop_handshake))
    }

    pub fn with_handshake(config: TransportConfig, handshake: HandshakeFn) -> Arc<Self> {
        let (inbound_tx, inbound_rx) = mpsc::channel(config.inbound_capacity);
        Arc::new(Self {
            config,
            handshake,
            on_peer: SyncMutex::new(None),
            on_peer_closed: SyncMutex::new(None),
            inbound_tx,
            inbound_rx: SyncMutex::new(Some(inbound_rx)),
            local_addr: SyncMutex::new(None),
            shutdown: watch::channel(false).0,
        })
    }

    /// Install the new-peer callback. Must happen before any connection
    /// is accepted or dialed.
    pub fn set_on_peer(&self, callback: OnPeerFn) {
        *self.on_peer.lock() = Some(callback);
    }

    /// Install the peer-closed callback.
    pub fn set_on_peer_closed(&self, callback: OnPeerClosedFn) {
        *self.on_peer_closed.lock() = Some(callback);
    }

    /// Take the inbound queue. Yields `None` after the first call.
    pub fn take_inbound(&self) -> Option<mpsc::Receiver<InboundEvent>> {
        self.inbound_rx.lock().take()
    }

    /// Address the listener is bound to, once listening.
    pub fn local_addr(&self) -> Option<SocketAddr> {
        *self.local_addr.lock()
    }

    /// Address string this transport was configured to listen on.
    pub fn listen_addr(&self) -> &str {
        &self.config.listen_addr
    }

    /// Bind the listener and spawn the accept loop. Bind failure is
    /// fatal for the node.
    pub async fn listen_and_accept(self: &Arc<Self>) -> Result<(), TransportError> {
        let listener = TcpListener::bind(&self.config.listen_addr)
            .await
            .map_err(|source| TransportError::Bind {
                addr: self.config.listen_addr.clone(),
                source,
            })?;
        let local = listener.local_addr()?;
        *self.local_addr.lock() = Some(local);
        info!(addr = %local, "transport listening");

        let transport = Arc::clone(self);
        let mut shutdown = self.shutdown.subscribe();
        tokio::spawn(async move {
            loop {
                tokio::select! {
                    _ = wait_until(&mut shutdown, |stop| stop) => {
                        debug!("accept loop stopped");
                        return;
                    }
                    accepted = listener.accept() => match accepted {
                        Ok((stream, _)) => {
                            let transport = Arc::clone(&transport);
                            tokio::spawn(async move {
                                transport.handle_conn(stream, false).await;
                            });
                        }
                        Err(e) => warn!(error = %e, "error accepting connection"),
                    }
                }
            }
        });
        Ok(())
    }

    /// Dial `addr` with a per-attempt deadline and a bounded number of
    /// retries separated by a fixed delay.
    pub async fn dial(self: &Arc<Self>, addr: &str) -> Result<(), TransportError> {
        let attempts = self.config.max_retries.max(1);
        let mut last_err = None;
        for attempt in 1..=attempts {
            match timeout(self.config.dial_timeout, TcpStream::connect(addr)).await {
                Ok(Ok(stream)) => {
                    debug!(addr, attempt, "connected to peer");
                    let transport = Arc::clone(self);
                    tokio::spawn(async move {
                        transport.handle_conn(stream, true).await;
                    });
                    return Ok(());
                }
                Ok(Err(e)) => last_err = Some(e),
                Err(_) => {
                    last_err = Some(std::io::Error::new(
                        std::io::ErrorKind::TimedOut,
                        "connect attempt timed out",
                    ))
                }
            }
            if attempt < attempts {
                debug!(addr, attempt, attempts, "dial failed, retrying");
                tokio::time::sleep(self.config.retry_delay).await;
            }
        }
        Err(TransportError::DialFailed {
            addr: addr.to_string(),
            attempts,
            source: last_err
                .unwrap_or_else(|| std::io::Error::new(std::io::ErrorKind::Other, "no attempt ran")),
        })
    }

    /// Stop accepting connections. Live read loops exit on their next
    /// I/O error.
    pub fn close(&self) {
        let _ = self.shutdown.send(true);
    }

    async fn handle_conn(self: Arc<Self>, stream: TcpStream, outbound: bool) {
        let remote = match stream.peer_addr() {
            Ok(addr) => addr,
            Err(e) => {
                warn!(error = %e, "dropping connection without a peer address");
                return;
            }
        };
        let peer = Arc::new(TcpPeer::new(remote, outbound, stream));

        if let Err(e) = (self.handshake)(&peer) {
            debug!(peer = %remote, error = %e, "handshake rejected connection");
            return;
        }
        if let Some(on_peer) = self.on_peer.lock().clone() {
            if let Err(e) = on_peer(Arc::clone(&peer)) {
                warn!(peer = %remote, error = %e, "new-peer callback rejected connection");
                return;
            }
        }

        let from = remote.to_string();
        loop {
            let frame = {
                let mut reader = peer.reader.lock().await;
                read_frame(&mut *reader).await
            };
            match frame {
                Ok(Frame::Message(payload)) => {
                    let event = InboundEvent {
                        from: from.clone(),
                        payload,
                        is_stream: false,
                    };
                    if self.inbound_tx.send(event).await.is_err() {
                        break;
                    }
                }
                Ok(Frame::StreamStart) => {
                    peer.gate.open();
                    let event = InboundEvent {
                        from: from.clone(),
                        payload: Vec::new(),
                        is_stream: true,
                    };
                    if self.inbound_tx.send(event).await.is_err() {
                        peer.gate.close();
                        break;
                    }
                    debug!(peer = %remote, "incoming stream, read loop parked");
                    peer.gate.wait_closed().await;
                    debug!(peer = %remote, "stream closed, read loop resumed");
                }
                Err(e) => {
                    debug!(peer = %remote, error = %e, "closing connection");
                    break;
                }
            }
        }

        if let Some(on_closed) = self.on_peer_closed.lock().clone() {
            on_closed(&from);
        }
        debug!(peer = %remote, "connection closed");
    }
}
