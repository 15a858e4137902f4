// Copyright Amazon.com, Inc. or its affiliates. All Rights Reserved.
// SPDX-License-Identifier: Apache-2.0

//! Stream and datagram transports.
//!
//! [`StreamServer`] accepts connections and runs one handler task per
//! connection until a shutdown future resolves; in-flight handlers then get
//! a grace period to drain. [`dial_stream`] is the deadline-carrying client
//! side. Both hand out [`Connection`] values that speak the length-prefixed
//! frame protocol.

use crate::{
    endpoint::Endpoint,
    shutdown::{Controller, Shutdown, DEFAULT_GRACE_PERIOD},
    Error, Result,
};
use bytes::{Bytes, BytesMut};
use core::{
    future::Future,
    pin::Pin,
    sync::atomic::{AtomicU64, Ordering},
    task::{Context, Poll},
    time::Duration,
};
use netkit_codec::frame::{self, Limits};
use serde::{de::DeserializeOwned, Serialize};
use std::{io, net::SocketAddr, sync::Arc};
use tokio::{
    io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt, ReadBuf, ReadHalf, WriteHalf},
    net::{TcpListener, TcpStream},
    time,
};
use tracing::{debug, error, info};

mod datagram;

pub use datagram::{send_datagram, send_multicast, DatagramServer, MulticastConfig};

static CONNECTION_IDS: AtomicU64 = AtomicU64::new(0);

/// A TCP stream, optionally wrapped in TLS
pub enum MaybeTlsStream {
    Plain(TcpStream),
    ServerTls(Box<tokio_rustls::server::TlsStream<TcpStream>>),
    ClientTls(Box<tokio_rustls::client::TlsStream<TcpStream>>),
}

impl core::fmt::Debug for MaybeTlsStream {
    fn fmt(&self, f: &mut core::fmt::Formatter<'_>) -> core::fmt::Result {
        let kind = match self {
            Self::Plain(_) => "plain",
            Self::ServerTls(_) => "server-tls",
            Self::ClientTls(_) => "client-tls",
        };
        f.debug_tuple("MaybeTlsStream").field(&kind).finish()
    }
}

impl AsyncRead for MaybeTlsStream {
    fn poll_read(
        self: Pin<&mut Self>,
        cx: &mut Context<'_>,
        buf: &mut ReadBuf<'_>,
    ) -> Poll<io::Result<()>> {
        match self.get_mut() {
            Self::Plain(stream) => Pin::new(stream).poll_read(cx, buf),
            Self::ServerTls(stream) => Pin::new(stream.as_mut()).poll_read(cx, buf),
            Self::ClientTls(stream) => Pin::new(stream.as_mut()).poll_read(cx, buf),
        }
    }
}

impl AsyncWrite for MaybeTlsStream {
    fn poll_write(
        self: Pin<&mut Self>,
        cx: &mut Context<'_>,
        buf: &[u8],
    ) -> Poll<io::Result<usize>> {
        match self.get_mut() {
            Self::Plain(stream) => Pin::new(stream).poll_write(cx, buf),
            Self::ServerTls(stream) => Pin::new(stream.as_mut()).poll_write(cx, buf),
            Self::ClientTls(stream) => Pin::new(stream.as_mut()).poll_write(cx, buf),
        }
    }

    fn poll_flush(self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<io::Result<()>> {
        match self.get_mut() {
            Self::Plain(stream) => Pin::new(stream).poll_flush(cx),
            Self::ServerTls(stream) => Pin::new(stream.as_mut()).poll_flush(cx),
            Self::ClientTls(stream) => Pin::new(stream.as_mut()).poll_flush(cx),
        }
    }

    fn poll_shutdown(self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<io::Result<()>> {
        match self.get_mut() {
            Self::Plain(stream) => Pin::new(stream).poll_shutdown(cx),
            Self::ServerTls(stream) => Pin::new(stream.as_mut()).poll_shutdown(cx),
            Self::ClientTls(stream) => Pin::new(stream.as_mut()).poll_shutdown(cx),
        }
    }
}

/// Read side of a connection; frames and raw chunks come out of here
#[derive(Debug)]
pub struct FramedReader {
    inner: ReadHalf<MaybeTlsStream>,
    limits: Limits,
    id: u64,
    peer: SocketAddr,
}

/// Write side of a connection; a connection has exactly one writer
#[derive(Debug)]
pub struct FramedWriter {
    inner: WriteHalf<MaybeTlsStream>,
    limits: Limits,
    id: u64,
    peer: SocketAddr,
}

/// A framed stream connection.
///
/// All reads and writes take `&mut self`, which is what keeps writes on a
/// connection totally ordered. Services that need a concurrent reader and
/// writer call [`Connection::split`] and give the writer to a single drain
/// task.
#[derive(Debug)]
pub struct Connection {
    reader: FramedReader,
    writer: FramedWriter,
}

impl Connection {
    pub fn new(stream: MaybeTlsStream, peer: SocketAddr, limits: Limits) -> Self {
        let id = CONNECTION_IDS.fetch_add(1, Ordering::Relaxed);
        let (read, write) = tokio::io::split(stream);
        Self {
            reader: FramedReader {
                inner: read,
                limits,
                id,
                peer,
            },
            writer: FramedWriter {
                inner: write,
                limits,
                id,
                peer,
            },
        }
    }

    pub fn id(&self) -> u64 {
        self.reader.id
    }

    pub fn peer(&self) -> SocketAddr {
        self.reader.peer
    }

    pub fn limits(&self) -> Limits {
        self.reader.limits
    }

    pub fn split(self) -> (FramedReader, FramedWriter) {
        (self.reader, self.writer)
    }

    /// Reassembles a connection from halves produced by [`Connection::split`]
    pub fn rejoin(reader: FramedReader, writer: FramedWriter) -> Self {
        Self { reader, writer }
    }

    pub async fn read_frame(&mut self) -> Result<Bytes> {
        self.reader.read_frame().await
    }

    pub async fn read_frame_timeout(&mut self, deadline: Duration) -> Result<Bytes> {
        self.reader.read_frame_timeout(deadline).await
    }

    pub async fn read_json<T: DeserializeOwned>(&mut self) -> Result<T> {
        self.reader.read_json().await
    }

    pub async fn recv_exact(&mut self, len: usize) -> Result<Bytes> {
        self.reader.recv_exact(len).await
    }

    pub async fn read_chunk(&mut self, buf: &mut BytesMut) -> Result<usize> {
        self.reader.read_chunk(buf).await
    }

    pub async fn write_frame(&mut self, payload: &[u8]) -> Result<()> {
        self.writer.write_frame(payload).await
    }

    pub async fn write_json<T: Serialize>(&mut self, value: &T) -> Result<()> {
        self.writer.write_json(value).await
    }

    pub async fn write_raw(&mut self, bytes: &[u8]) -> Result<()> {
        self.writer.write_raw(bytes).await
    }

    pub async fn shutdown(&mut self) -> Result<()> {
        self.writer.shutdown().await
    }
}

impl FramedReader {
    pub fn id(&self) -> u64 {
        self.id
    }

    pub fn peer(&self) -> SocketAddr {
        self.peer
    }

    /// Reads one length-prefixed frame.
    ///
    /// The length header is validated against the limits before the payload
    /// is allocated. EOF on a frame boundary is [`Error::ClosedByPeer`]; EOF
    /// inside a frame is [`Error::TruncatedFrame`].
    pub async fn read_frame(&mut self) -> Result<Bytes> {
        let mut header = [0u8; frame::HEADER_LEN];
        self.fill_exact(&mut header, true).await?;

        let len = u32::from_be_bytes(header) as usize;
        self.limits.check(len)?;

        let mut payload = vec![0u8; len];
        self.fill_exact(&mut payload, false).await?;
        Ok(payload.into())
    }

    pub async fn read_frame_timeout(&mut self, deadline: Duration) -> Result<Bytes> {
        match time::timeout(deadline, self.read_frame()).await {
            Ok(result) => result,
            Err(_) => Err(Error::Timeout(deadline)),
        }
    }

    pub async fn read_json<T: DeserializeOwned>(&mut self) -> Result<T> {
        let frame = self.read_frame().await?;
        Ok(serde_json::from_slice(&frame)?)
    }

    /// Reads exactly `len` raw bytes (no frame header)
    pub async fn recv_exact(&mut self, len: usize) -> Result<Bytes> {
        self.limits.check(len)?;
        let mut buf = vec![0u8; len];
        self.fill_exact(&mut buf, false).await?;
        Ok(buf.into())
    }

    /// Appends whatever is available to `buf`; returns the number of bytes
    /// read, with `Ok(0)` meaning EOF
    pub async fn read_chunk(&mut self, buf: &mut BytesMut) -> Result<usize> {
        Ok(self.inner.read_buf(buf).await?)
    }

    async fn fill_exact(&mut self, buf: &mut [u8], at_boundary: bool) -> Result<()> {
        let mut filled = 0;
        while filled < buf.len() {
            let n = self.inner.read(&mut buf[filled..]).await?;
            if n == 0 {
                return Err(if at_boundary && filled == 0 {
                    Error::ClosedByPeer
                } else {
                    Error::TruncatedFrame {
                        expected: buf.len(),
                        received: filled,
                    }
                });
            }
            filled += n;
        }
        Ok(())
    }
}

impl FramedWriter {
    pub fn id(&self) -> u64 {
        self.id
    }

    pub fn peer(&self) -> SocketAddr {
        self.peer
    }

    /// Writes one length-prefixed frame as a single buffered write
    pub async fn write_frame(&mut self, payload: &[u8]) -> Result<()> {
        let mut buf = BytesMut::with_capacity(frame::HEADER_LEN + payload.len());
        frame::encode(payload, &self.limits, &mut buf)?;
        self.inner.write_all(&buf).await?;
        self.inner.flush().await?;
        Ok(())
    }

    pub async fn write_json<T: Serialize>(&mut self, value: &T) -> Result<()> {
        let payload = serde_json::to_vec(value)?;
        self.write_frame(&payload).await
    }

    /// Writes raw bytes with no frame header (media packets, file payloads)
    pub async fn write_raw(&mut self, bytes: &[u8]) -> Result<()> {
        self.inner.write_all(bytes).await?;
        self.inner.flush().await?;
        Ok(())
    }

    pub async fn shutdown(&mut self) -> Result<()> {
        self.inner.shutdown().await?;
        Ok(())
    }
}

#[derive(Clone, Copy, Debug)]
pub struct ServerConfig {
    pub limits: Limits,
    pub grace_period: Duration,
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            limits: Limits::default(),
            grace_period: DEFAULT_GRACE_PERIOD,
        }
    }
}

/// A bound stream listener.
///
/// Binding and serving are separate so callers can learn the bound address
/// (port 0 binds) before the accept loop starts.
pub struct StreamServer {
    listener: TcpListener,
    acceptor: Option<tokio_rustls::TlsAcceptor>,
    config: ServerConfig,
    local_addr: SocketAddr,
}

impl std::fmt::Debug for StreamServer {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("StreamServer")
            .field("listener", &self.listener)
            .field("acceptor", &self.acceptor.is_some())
            .field("config", &self.config)
            .field("local_addr", &self.local_addr)
            .finish()
    }
}

impl StreamServer {
    pub async fn bind(endpoint: &Endpoint) -> Result<Self> {
        Self::bind_with(endpoint, ServerConfig::default()).await
    }

    /// Binds the listener, failing fast when the port is taken
    pub async fn bind_with(endpoint: &Endpoint, config: ServerConfig) -> Result<Self> {
        let acceptor = endpoint.tls_acceptor()?;
        let listener = TcpListener::bind((endpoint.host(), endpoint.port())).await?;
        let local_addr = listener.local_addr()?;

        info!(addr = %local_addr, tls = acceptor.is_some(), "listening");

        Ok(Self {
            listener,
            acceptor,
            config,
            local_addr,
        })
    }

    pub fn local_addr(&self) -> SocketAddr {
        self.local_addr
    }

    /// Accepts connections until `signal` resolves, spawning one handler
    /// task per connection. After the signal the listener closes, in-flight
    /// handlers are told to shut down and get the configured grace period.
    pub async fn serve<H, F>(self, handler: H, signal: impl Future<Output = ()>) -> Result<()>
    where
        H: Fn(Connection, SocketAddr, Shutdown) -> F + Send + Sync + 'static,
        F: Future<Output = Result<()>> + Send + 'static,
    {
        let Self {
            listener,
            acceptor,
            config,
            local_addr,
        } = self;

        let controller = Controller::new();
        let handler = Arc::new(handler);

        tokio::pin!(signal);

        loop {
            tokio::select! {
                accepted = listener.accept() => {
                    let (stream, remote) = match accepted {
                        Ok(accepted) => accepted,
                        Err(err) => {
                            // transient accept failures (EMFILE and friends)
                            // must not take the listener down
                            error!(addr = %local_addr, error = %err, "accept failed");
                            continue;
                        }
                    };

                    let _ = stream.set_nodelay(true);

                    let acceptor = acceptor.clone();
                    let handler = handler.clone();
                    let shutdown = controller.subscribe();
                    let limits = config.limits;

                    tokio::spawn(async move {
                        let stream = match acceptor {
                            Some(acceptor) => match acceptor.accept(stream).await {
                                Ok(stream) => MaybeTlsStream::ServerTls(Box::new(stream)),
                                Err(err) => {
                                    debug!(remote = %remote, error = %err, "tls handshake failed");
                                    return;
                                }
                            },
                            None => MaybeTlsStream::Plain(stream),
                        };

                        let conn = Connection::new(stream, remote, limits);
                        let id = conn.id();
                        debug!(conn = id, remote = %remote, "connection accepted");

                        if let Err(err) = handler.as_ref()(conn, remote, shutdown).await {
                            match err {
                                Error::ClosedByPeer | Error::Shutdown => {
                                    debug!(conn = id, remote = %remote, "connection closed");
                                }
                                err => {
                                    error!(conn = id, remote = %remote, error = %err, "handler failed");
                                }
                            }
                        }
                    });
                }
                _ = &mut signal => break,
            }
        }

        info!(addr = %local_addr, "listener stopped, draining handlers");
        drop(listener);

        let drained = controller.shutdown(config.grace_period).await;
        if !drained {
            info!(addr = %local_addr, "grace period expired, abandoning remaining handlers");
        }

        Ok(())
    }
}

/// Dials a stream endpoint, covering TCP connect and the TLS handshake with
/// one deadline
pub async fn dial_stream(endpoint: &Endpoint, deadline: Duration) -> Result<Connection> {
    dial_stream_with(endpoint, deadline, Limits::default()).await
}

pub async fn dial_stream_with(
    endpoint: &Endpoint,
    deadline: Duration,
    limits: Limits,
) -> Result<Connection> {
    let connector = endpoint.tls_connector()?;
    let addr = format!("{}:{}", endpoint.host(), endpoint.port());

    let dial = async {
        let stream = TcpStream::connect((endpoint.host(), endpoint.port())).await?;
        let _ = stream.set_nodelay(true);
        let peer = stream.peer_addr()?;

        let stream = match connector {
            Some((connector, name)) => {
                let stream = connector
                    .connect(name, stream)
                    .await
                    .map_err(|error| Error::Tls(error.to_string()))?;
                MaybeTlsStream::ClientTls(Box::new(stream))
            }
            None => MaybeTlsStream::Plain(stream),
        };

        Ok(Connection::new(stream, peer, limits))
    };

    match time::timeout(deadline, dial).await {
        Ok(result) => result,
        Err(_) => Err(Error::DialTimeout {
            addr,
            timeout: deadline,
        }),
    }
}

#[cfg(test)]
pub(crate) mod testing {
    use super::*;

    /// A connected pair of framed connections over loopback
    pub(crate) async fn connection_pair() -> (Connection, Connection) {
        connection_pair_with(Limits::default()).await
    }

    pub(crate) async fn connection_pair_with(limits: Limits) -> (Connection, Connection) {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();

        let (client, accepted) =
            tokio::join!(TcpStream::connect(addr), async { listener.accept().await });
        let client = client.unwrap();
        let (server, remote) = accepted.unwrap();

        let client_peer = client.peer_addr().unwrap();
        (
            Connection::new(MaybeTlsStream::Plain(client), client_peer, limits),
            Connection::new(MaybeTlsStream::Plain(server), remote, limits),
        )
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::shutdown;

    async fn echo_pair() -> (StreamServer, Endpoint) {
        let endpoint = Endpoint::stream("127.0.0.1", 0);
        let server = StreamServer::bind(&endpoint).await.unwrap();
        let bound = Endpoint::stream("127.0.0.1", server.local_addr().port());
        (server, bound)
    }

    async fn echo(mut conn: Connection, _remote: SocketAddr, mut shutdown: Shutdown) -> Result<()> {
        loop {
            tokio::select! {
                frame = conn.read_frame() => {
                    let frame = match frame {
                        Ok(frame) => frame,
                        Err(Error::ClosedByPeer) => return Ok(()),
                        Err(err) => return Err(err),
                    };
                    conn.write_frame(&frame).await?;
                }
                _ = shutdown.recv() => return Ok(()),
            }
        }
    }

    #[tokio::test]
    async fn frame_echo_round_trip() {
        let (server, bound) = echo_pair().await;
        let controller = shutdown::Controller::new();
        let mut signal = controller.subscribe();
        let server = tokio::spawn(server.serve(echo, async move { signal.recv().await }));

        let mut conn = dial_stream(&bound, Duration::from_secs(1)).await.unwrap();
        conn.write_frame(b"ping").await.unwrap();
        assert_eq!(&conn.read_frame().await.unwrap()[..], b"ping");

        controller.shutdown(Duration::from_secs(1)).await;
        server.await.unwrap().unwrap();
    }

    #[tokio::test]
    async fn dial_refused() {
        // bind and immediately drop to get a port that refuses
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let port = listener.local_addr().unwrap().port();
        drop(listener);

        let endpoint = Endpoint::stream("127.0.0.1", port);
        let err = dial_stream(&endpoint, Duration::from_secs(1))
            .await
            .unwrap_err();
        assert!(matches!(err, Error::Io(_)), "got {err:?}");
    }

    #[tokio::test]
    async fn port_in_use_fails_fast() {
        let (server, bound) = echo_pair().await;
        let err = StreamServer::bind(&bound).await.unwrap_err();
        assert!(matches!(err, Error::Io(ref io) if io.kind() == io::ErrorKind::AddrInUse));
        drop(server);
    }

    #[tokio::test]
    async fn shutdown_stops_accepting() {
        let (server, bound) = echo_pair().await;
        let controller = shutdown::Controller::new();
        let mut signal = controller.subscribe();
        let server = tokio::spawn(server.serve(echo, async move { signal.recv().await }));

        controller.shutdown(Duration::from_secs(1)).await;
        server.await.unwrap().unwrap();

        let err = dial_stream(&bound, Duration::from_millis(250)).await;
        assert!(err.is_err());
    }

    #[tokio::test]
    async fn oversize_frame_is_rejected_without_transmission() {
        let (server, bound) = echo_pair().await;
        let controller = shutdown::Controller::new();
        let mut signal = controller.subscribe();
        tokio::spawn(server.serve(echo, async move { signal.recv().await }));

        let mut conn = dial_stream_with(&bound, Duration::from_secs(1), Limits::new(8))
            .await
            .unwrap();
        let err = conn.write_frame(&[0u8; 9]).await.unwrap_err();
        assert!(matches!(err, Error::FrameTooLarge { len: 9, max: 8 }));

        // the connection is still usable; nothing was transmitted
        conn.write_frame(b"ok").await.unwrap();
        assert_eq!(&conn.read_frame().await.unwrap()[..], b"ok");

        controller.shutdown(Duration::from_secs(1)).await;
    }
}
