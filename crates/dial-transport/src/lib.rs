// sipdial-rs - The Sipdial SIP Client Stack
// Copyright (C) 2025 James Ferris <ferrous.communications@gmail.com>
// SPDX-License-Identifier: Apache-2.0 OR MIT

//! Client-side SIP transports.
//!
//! UDP and TCP share one contract: [`Transport::send`] delivers one message
//! to a peer, [`Transport::recv`] yields one complete inbound message with
//! its source address. UDP messages are framed by the datagram; TCP streams
//! are reassembled with CRLFCRLF + Content-Length framing. TLS and
//! WebSocket exist as named [`TransportKind`] placeholders only.
//!
//! # Example
//! ```no_run
//! use dial_transport::{Transport, TransportKind};
//! # async fn example() -> Result<(), dial_transport::TransportError> {
//! let transport = Transport::bind(TransportKind::Udp, "0.0.0.0:5060".parse().unwrap()).await?;
//! let (frame, peer) = transport.recv(None).await?;
//! transport.send(frame, peer).await?;
//! # Ok(())
//! # }
//! ```

pub mod framing;

pub use framing::{drain_frames, FramingError};

use bytes::{Bytes, BytesMut};
use std::collections::HashMap;
use std::net::SocketAddr;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::{TcpStream, UdpSocket};
use tokio::sync::{mpsc, Mutex, Notify};
use tracing::{debug, warn};

/// Timeout for outbound TCP connection establishment.
const CONNECT_TIMEOUT: Duration = Duration::from_secs(5);

/// Inbound channel depth shared by all TCP connections.
const INBOUND_QUEUE: usize = 128;

/// Which transport carries the traffic.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum TransportKind {
    Udp,
    Tcp,
    /// Placeholder; not implemented.
    Tls,
    /// Placeholder; not implemented.
    Ws,
}

impl TransportKind {
    /// Via header transport token.
    pub fn via_token(self) -> &'static str {
        match self {
            TransportKind::Udp => "UDP",
            TransportKind::Tcp => "TCP",
            TransportKind::Tls => "TLS",
            TransportKind::Ws => "WS",
        }
    }

    /// True for byte-ordered connection transports whose delivery is
    /// reliable, which zeroes the retransmission timers upstream.
    pub fn is_reliable(self) -> bool {
        !matches!(self, TransportKind::Udp)
    }

    pub fn parse(token: &str) -> Option<Self> {
        match token.trim().to_ascii_lowercase().as_str() {
            "udp" => Some(TransportKind::Udp),
            "tcp" => Some(TransportKind::Tcp),
            "tls" => Some(TransportKind::Tls),
            "ws" => Some(TransportKind::Ws),
            _ => None,
        }
    }
}

/// Transport layer failures.
#[derive(Debug)]
pub enum TransportError {
    /// Binding the local socket failed.
    Bind(std::io::Error),
    /// The transport has been closed.
    Unavailable,
    /// The peer could not be reached (connect refused or timed out).
    PeerUnreachable { peer: SocketAddr },
    /// A send on an established socket failed.
    Send(std::io::Error),
    /// A receive failed.
    Recv(std::io::Error),
    /// The caller's receive deadline elapsed.
    Timeout,
    /// The requested kind is a placeholder without an implementation.
    Unimplemented { kind: TransportKind },
}

impl std::fmt::Display for TransportError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            TransportError::Bind(e) => write!(f, "bind failed: {}", e),
            TransportError::Unavailable => write!(f, "transport closed"),
            TransportError::PeerUnreachable { peer } => write!(f, "peer unreachable: {}", peer),
            TransportError::Send(e) => write!(f, "send failed: {}", e),
            TransportError::Recv(e) => write!(f, "recv failed: {}", e),
            TransportError::Timeout => write!(f, "receive timed out"),
            TransportError::Unimplemented { kind } => {
                write!(f, "transport {:?} is not implemented", kind)
            }
        }
    }
}

impl std::error::Error for TransportError {
    fn source(&self) -> Option<&(dyn std::error::Error + 'static)> {
        match self {
            TransportError::Bind(e) | TransportError::Send(e) | TransportError::Recv(e) => Some(e),
            _ => None,
        }
    }
}

/// A bound client transport.
pub enum Transport {
    Udp(UdpTransport),
    Tcp(TcpTransport),
}

impl Transport {
    /// Binds a transport of the requested kind on `local`.
    pub async fn bind(kind: TransportKind, local: SocketAddr) -> Result<Self, TransportError> {
        match kind {
            TransportKind::Udp => Ok(Transport::Udp(UdpTransport::bind(local).await?)),
            TransportKind::Tcp => Ok(Transport::Tcp(TcpTransport::new(local))),
            other => Err(TransportError::Unimplemented { kind: other }),
        }
    }

    pub fn kind(&self) -> TransportKind {
        match self {
            Transport::Udp(_) => TransportKind::Udp,
            Transport::Tcp(_) => TransportKind::Tcp,
        }
    }

    /// Local address after bind. For TCP this is the configured address
    /// until the first connection pins an ephemeral port.
    pub fn local_addr(&self) -> SocketAddr {
        match self {
            Transport::Udp(t) => t.local_addr(),
            Transport::Tcp(t) => t.local_addr(),
        }
    }

    /// Delivers one message to `peer`, blocking until the bytes reach the
    /// operating system.
    pub async fn send(&self, payload: Bytes, peer: SocketAddr) -> Result<(), TransportError> {
        match self {
            Transport::Udp(t) => t.send(payload, peer).await,
            Transport::Tcp(t) => t.send(payload, peer).await,
        }
    }

    /// Yields one complete inbound message and its source address, waiting
    /// at most `timeout` when given.
    pub async fn recv(
        &self,
        timeout: Option<Duration>,
    ) -> Result<(Bytes, SocketAddr), TransportError> {
        match timeout {
            Some(limit) => match tokio::time::timeout(limit, self.recv_inner()).await {
                Ok(result) => result,
                Err(_) => Err(TransportError::Timeout),
            },
            None => self.recv_inner().await,
        }
    }

    async fn recv_inner(&self) -> Result<(Bytes, SocketAddr), TransportError> {
        match self {
            Transport::Udp(t) => t.recv().await,
            Transport::Tcp(t) => t.recv().await,
        }
    }

    /// Releases the bound port and any open streams. Idempotent; any
    /// blocked `recv` returns [`TransportError::Unavailable`].
    pub fn close(&self) {
        match self {
            Transport::Udp(t) => t.close(),
            Transport::Tcp(t) => t.close(),
        }
    }
}

/// Datagram transport; each datagram is one SIP message.
pub struct UdpTransport {
    socket: Arc<UdpSocket>,
    local: SocketAddr,
    closed: AtomicBool,
    shutdown: Notify,
}

impl UdpTransport {
    pub async fn bind(local: SocketAddr) -> Result<Self, TransportError> {
        let socket = UdpSocket::bind(local).await.map_err(TransportError::Bind)?;
        let local = socket.local_addr().map_err(TransportError::Bind)?;
        debug!(%local, "udp transport bound");
        Ok(Self {
            socket: Arc::new(socket),
            local,
            closed: AtomicBool::new(false),
            shutdown: Notify::new(),
        })
    }

    pub fn local_addr(&self) -> SocketAddr {
        self.local
    }

    pub async fn send(&self, payload: Bytes, peer: SocketAddr) -> Result<(), TransportError> {
        if self.closed.load(Ordering::Acquire) {
            return Err(TransportError::Unavailable);
        }
        self.socket
            .send_to(payload.as_ref(), peer)
            .await
            .map_err(TransportError::Send)?;
        Ok(())
    }

    pub async fn recv(&self) -> Result<(Bytes, SocketAddr), TransportError> {
        if self.closed.load(Ordering::Acquire) {
            return Err(TransportError::Unavailable);
        }
        let mut buf = vec![0u8; 65_535];
        tokio::select! {
            _ = self.shutdown.notified() => Err(TransportError::Unavailable),
            result = self.socket.recv_from(&mut buf) => {
                let (n, peer) = result.map_err(TransportError::Recv)?;
                Ok((Bytes::copy_from_slice(&buf[..n]), peer))
            }
        }
    }

    pub fn close(&self) {
        self.closed.store(true, Ordering::Release);
        self.shutdown.notify_waiters();
    }
}

/// Stream transport; lazily connects one TCP stream per peer and frames
/// inbound bytes into SIP messages.
pub struct TcpTransport {
    local: std::sync::Mutex<SocketAddr>,
    inbound_tx: mpsc::Sender<(Bytes, SocketAddr)>,
    inbound_rx: Mutex<mpsc::Receiver<(Bytes, SocketAddr)>>,
    conns: Arc<Mutex<HashMap<SocketAddr, mpsc::Sender<Bytes>>>>,
    tasks: std::sync::Mutex<Vec<tokio::task::JoinHandle<()>>>,
    closed: AtomicBool,
}

impl TcpTransport {
    pub fn new(local: SocketAddr) -> Self {
        let (inbound_tx, inbound_rx) = mpsc::channel(INBOUND_QUEUE);
        Self {
            local: std::sync::Mutex::new(local),
            inbound_tx,
            inbound_rx: Mutex::new(inbound_rx),
            conns: Arc::new(Mutex::new(HashMap::new())),
            tasks: std::sync::Mutex::new(Vec::new()),
            closed: AtomicBool::new(false),
        }
    }

    pub fn local_addr(&self) -> SocketAddr {
        *self.local.lock().expect("local addr lock")
    }

    pub async fn send(&self, payload: Bytes, peer: SocketAddr) -> Result<(), TransportError> {
        if self.closed.load(Ordering::Acquire) {
            return Err(TransportError::Unavailable);
        }
        let writer = self.writer_for(peer).await?;
        writer
            .send(payload)
            .await
            .map_err(|_| TransportError::PeerUnreachable { peer })
    }

    pub async fn recv(&self) -> Result<(Bytes, SocketAddr), TransportError> {
        if self.closed.load(Ordering::Acquire) {
            return Err(TransportError::Unavailable);
        }
        let mut rx = self.inbound_rx.lock().await;
        rx.recv().await.ok_or(TransportError::Unavailable)
    }

    pub fn close(&self) {
        self.closed.store(true, Ordering::Release);
        for task in self.tasks.lock().expect("task lock").drain(..) {
            task.abort();
        }
        if let Ok(mut conns) = self.conns.try_lock() {
            conns.clear();
        }
    }

    async fn writer_for(
        &self,
        peer: SocketAddr,
    ) -> Result<mpsc::Sender<Bytes>, TransportError> {
        let mut conns = self.conns.lock().await;
        if let Some(writer) = conns.get(&peer) {
            if !writer.is_closed() {
                return Ok(writer.clone());
            }
            conns.remove(&peer);
        }

        let stream = tokio::time::timeout(CONNECT_TIMEOUT, TcpStream::connect(peer))
            .await
            .map_err(|_| TransportError::PeerUnreachable { peer })?
            .map_err(|_| TransportError::PeerUnreachable { peer })?;
        if let Ok(addr) = stream.local_addr() {
            *self.local.lock().expect("local addr lock") = addr;
        }
        debug!(%peer, "tcp connection established");

        let (mut read_half, mut write_half) = stream.into_split();
        let (writer_tx, mut writer_rx) = mpsc::channel::<Bytes>(32);

        let write_task = tokio::spawn(async move {
            while let Some(data) = writer_rx.recv().await {
                if let Err(e) = write_half.write_all(&data).await {
                    warn!(%peer, %e, "tcp write error");
                    break;
                }
            }
        });

        let inbound_tx = self.inbound_tx.clone();
        let conns_handle = Arc::clone(&self.conns);
        let read_task = tokio::spawn(async move {
            let mut buf = BytesMut::with_capacity(4096);
            loop {
                match read_half.read_buf(&mut buf).await {
                    Ok(0) => break,
                    Ok(_) => match framing::drain_frames(&mut buf) {
                        Ok(frames) => {
                            for frame in frames {
                                if inbound_tx.send((frame, peer)).await.is_err() {
                                    return;
                                }
                            }
                        }
                        Err(e) => {
                            warn!(%peer, %e, "tcp framing error; dropping connection");
                            break;
                        }
                    },
                    Err(e) => {
                        warn!(%peer, %e, "tcp read error");
                        break;
                    }
                }
            }
            conns_handle.lock().await.remove(&peer);
        });

        {
            let mut tasks = self.tasks.lock().expect("task lock");
            tasks.push(write_task);
            tasks.push(read_task);
        }

        conns.insert(peer, writer_tx.clone());
        Ok(writer_tx)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn udp_round_trip_on_loopback() {
        let a = Transport::bind(TransportKind::Udp, "127.0.0.1:0".parse().unwrap())
            .await
            .unwrap();
        let b = Transport::bind(TransportKind::Udp, "127.0.0.1:0".parse().unwrap())
            .await
            .unwrap();

        a.send(Bytes::from_static(b"ping"), b.local_addr())
            .await
            .unwrap();
        let (frame, peer) = b.recv(Some(Duration::from_secs(1))).await.unwrap();
        assert_eq!(frame.as_ref(), b"ping");
        assert_eq!(peer, a.local_addr());
    }

    #[tokio::test]
    async fn udp_recv_times_out() {
        let t = Transport::bind(TransportKind::Udp, "127.0.0.1:0".parse().unwrap())
            .await
            .unwrap();
        let result = t.recv(Some(Duration::from_millis(20))).await;
        assert!(matches!(result, Err(TransportError::Timeout)));
    }

    #[tokio::test]
    async fn udp_close_wakes_blocked_recv() {
        let t = Arc::new(
            Transport::bind(TransportKind::Udp, "127.0.0.1:0".parse().unwrap())
                .await
                .unwrap(),
        );
        let t2 = Arc::clone(&t);
        let waiter = tokio::spawn(async move { t2.recv(None).await });
        tokio::time::sleep(Duration::from_millis(20)).await;
        t.close();
        let result = waiter.await.unwrap();
        assert!(matches!(result, Err(TransportError::Unavailable)));
    }

    #[tokio::test]
    async fn tcp_send_and_framed_recv() {
        let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
        let server_addr = listener.local_addr().unwrap();

        let server = tokio::spawn(async move {
            let (mut stream, _) = listener.accept().await.unwrap();
            let mut buf = vec![0u8; 1024];
            let n = stream.read(&mut buf).await.unwrap();
            assert!(n > 0);
            stream
                .write_all(b"SIP/2.0 200 OK\r\nContent-Length: 2\r\n\r\nok")
                .await
                .unwrap();
        });

        let t = Transport::bind(TransportKind::Tcp, "127.0.0.1:0".parse().unwrap())
            .await
            .unwrap();
        t.send(
            Bytes::from_static(b"OPTIONS sip:x SIP/2.0\r\nContent-Length: 0\r\n\r\n"),
            server_addr,
        )
        .await
        .unwrap();

        let (frame, peer) = t.recv(Some(Duration::from_secs(2))).await.unwrap();
        assert_eq!(peer, server_addr);
        assert!(frame.ends_with(b"ok"));
        server.await.unwrap();
    }

    #[tokio::test]
    async fn tcp_connect_to_dead_peer_is_unreachable() {
        let t = Transport::bind(TransportKind::Tcp, "127.0.0.1:0".parse().unwrap())
            .await
            .unwrap();
        // A port that nothing listens on.
        let dead: SocketAddr = "127.0.0.1:1".parse().unwrap();
        let result = t.send(Bytes::from_static(b"x"), dead).await;
        assert!(matches!(result, Err(TransportError::PeerUnreachable { .. })));
    }

    #[tokio::test]
    async fn tls_is_a_named_placeholder() {
        let result = Transport::bind(TransportKind::Tls, "127.0.0.1:0".parse().unwrap()).await;
        assert!(matches!(
            result,
            Err(TransportError::Unimplemented {
                kind: TransportKind::Tls
            })
        ));
    }
}
