// Copyright Amazon.com, Inc. or its affiliates. All Rights Reserved.
// SPDX-License-Identifier: Apache-2.0

//! Websocket server and client atop the stream transport.
//!
//! After the RFC 6455 upgrade the two sides exchange framed messages; pings
//! are answered automatically and fragmented messages are reassembled up to
//! the configured size cap. Clients mask every frame, servers never do.

use crate::{
    endpoint::Endpoint,
    transport::{dial_stream, Connection, FramedReader, FramedWriter},
    Error, Result,
};
use bytes::{Bytes, BytesMut};
use core::time::Duration;
use netkit_codec::websocket::{Frame, Opcode};
use sha1::{Digest, Sha1};
use tokio::time::{sleep_until, Instant};
use tracing::{debug, trace};

mod handshake;

pub use handshake::{accept, connect, ClientOptions};

/// Default cap on a reassembled message
pub const DEFAULT_MAX_MESSAGE: usize = 1024 * 1024;

const ACCEPT_GUID: &str = "258EAFA5-E914-47DA-95CA-C5AB0D85AB11";

fn accept_key(key: &str) -> String {
    let mut hasher = Sha1::new();
    hasher.update(key.as_bytes());
    hasher.update(ACCEPT_GUID.as_bytes());
    base64::encode(hasher.finalize())
}

#[derive(Clone, Copy, Debug)]
pub struct WebSocketConfig {
    pub max_message_len: usize,
    /// When set, an unsolicited ping goes out whenever the connection has
    /// been quiet this long
    pub ping_interval: Option<Duration>,
}

impl Default for WebSocketConfig {
    fn default() -> Self {
        Self {
            max_message_len: DEFAULT_MAX_MESSAGE,
            ping_interval: None,
        }
    }
}

#[derive(Clone, Debug, PartialEq, Eq)]
pub enum Message {
    Text(String),
    Binary(Bytes),
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
enum Role {
    Server,
    Client,
}

/// An upgraded websocket connection
pub struct WebSocket {
    reader: FramedReader,
    writer: FramedWriter,
    buf: BytesMut,
    config: WebSocketConfig,
    role: Role,
    fragment: Option<(Opcode, BytesMut)>,
    closed: bool,
}

impl WebSocket {
    fn new(conn: Connection, leftover: BytesMut, config: WebSocketConfig, role: Role) -> Self {
        let (reader, writer) = conn.split();
        Self {
            reader,
            writer,
            buf: leftover,
            config,
            role,
            fragment: None,
            closed: false,
        }
    }

    fn mask(&self) -> Option<[u8; 4]> {
        match self.role {
            Role::Server => None,
            Role::Client => Some(rand::random()),
        }
    }

    pub async fn send_text(&mut self, text: &str) -> Result<()> {
        self.send_frame(Frame::text(text.as_bytes().to_vec())).await
    }

    pub async fn send_binary(&mut self, bytes: impl Into<Bytes>) -> Result<()> {
        self.send_frame(Frame::binary(bytes.into())).await
    }

    pub async fn send(&mut self, message: Message) -> Result<()> {
        match message {
            Message::Text(text) => self.send_text(&text).await,
            Message::Binary(bytes) => self.send_binary(bytes).await,
        }
    }

    /// Starts the closing handshake
    pub async fn close(&mut self, code: u16, reason: &str) -> Result<()> {
        if !self.closed {
            self.closed = true;
            self.send_frame(Frame::close(code, reason)).await?;
        }
        Ok(())
    }

    async fn send_frame(&mut self, frame: Frame) -> Result<()> {
        let mut out = BytesMut::with_capacity(frame.payload.len() + 14);
        frame.encode(self.mask(), &mut out);
        self.writer.write_raw(&out).await
    }

    /// Next data message; `None` once the peer closed (the close frame is
    /// echoed back automatically, as are pongs for pings)
    pub async fn recv(&mut self) -> Result<Option<Message>> {
        enum Event {
            Read(usize),
            PingDue,
        }

        let mut quiet_since = Instant::now();

        loop {
            while let Some(frame) = Frame::decode(&mut self.buf, self.config.max_message_len)? {
                quiet_since = Instant::now();
                if let Some(message) = self.handle_frame(frame).await? {
                    return Ok(Some(message));
                }
                if self.closed {
                    return Ok(None);
                }
            }

            let event = {
                let ping_at = self.config.ping_interval.map(|interval| quiet_since + interval);
                let read = self.reader.read_chunk(&mut self.buf);
                tokio::pin!(read);

                match ping_at {
                    Some(at) => {
                        tokio::select! {
                            n = &mut read => Event::Read(n?),
                            _ = sleep_until(at) => Event::PingDue,
                        }
                    }
                    None => Event::Read(read.await?),
                }
            };

            match event {
                Event::Read(0) => {
                    debug!(conn = self.reader.id(), "websocket peer went away");
                    self.closed = true;
                    return Ok(None);
                }
                Event::Read(_) => {}
                Event::PingDue => {
                    trace!(conn = self.reader.id(), "sending keepalive ping");
                    self.send_frame(Frame::ping(Bytes::new())).await?;
                    quiet_since = Instant::now();
                }
            }
        }
    }

    async fn handle_frame(&mut self, frame: Frame) -> Result<Option<Message>> {
        match frame.opcode {
            Opcode::Ping => {
                self.send_frame(Frame::pong(frame.payload)).await?;
                Ok(None)
            }
            Opcode::Pong => Ok(None),
            Opcode::Close => {
                if !self.closed {
                    // echo the close and consider the conversation over
                    let reply = match frame.close_body() {
                        Some((code, _)) => Frame::close(code, ""),
                        None => Frame::new(true, Opcode::Close, Bytes::new()),
                    };
                    self.closed = true;
                    let _ = self.send_frame(reply).await;
                }
                Ok(None)
            }
            Opcode::Text | Opcode::Binary => {
                if self.fragment.is_some() {
                    return Err(Error::Protocol(
                        "data frame interleaved with an unfinished message".into(),
                    ));
                }
                if frame.fin {
                    return Ok(Some(self.assemble(frame.opcode, frame.payload)?));
                }
                self.fragment = Some((frame.opcode, BytesMut::from(&frame.payload[..])));
                Ok(None)
            }
            Opcode::Continuation => {
                let Some((opcode, mut assembled)) = self.fragment.take() else {
                    return Err(Error::Protocol("continuation without a first frame".into()));
                };

                if assembled.len() + frame.payload.len() > self.config.max_message_len {
                    return Err(Error::Protocol("fragmented message too large".into()));
                }
                assembled.extend_from_slice(&frame.payload);

                if frame.fin {
                    return Ok(Some(self.assemble(opcode, assembled.freeze())?));
                }
                self.fragment = Some((opcode, assembled));
                Ok(None)
            }
        }
    }

    fn assemble(&self, opcode: Opcode, payload: Bytes) -> Result<Message> {
        match opcode {
            Opcode::Text => {
                let text = String::from_utf8(payload.to_vec())
                    .map_err(|_| Error::Protocol("text message is not valid UTF-8".into()))?;
                Ok(Message::Text(text))
            }
            Opcode::Binary => Ok(Message::Binary(payload)),
            _ => unreachable!("only data opcodes carry messages"),
        }
    }
}

/// Dials and upgrades in one step
pub async fn connect_websocket(
    endpoint: &Endpoint,
    path: &str,
    options: ClientOptions,
    deadline: Duration,
) -> Result<WebSocket> {
    let conn = dial_stream(endpoint, deadline).await?;
    connect(conn, endpoint, path, options).await
}
