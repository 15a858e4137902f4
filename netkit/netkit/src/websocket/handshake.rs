// Copyright Amazon.com, Inc. or its affiliates. All Rights Reserved.
// SPDX-License-Identifier: Apache-2.0

//! RFC 6455 opening handshake, both directions.

use super::{accept_key, Role, WebSocket, WebSocketConfig};
use crate::{
    endpoint::Endpoint,
    http::{header, parse_head, read_head},
    transport::Connection,
    Error, Result,
};
use bytes::BytesMut;
use tracing::debug;

/// Extra client handshake settings
#[derive(Clone, Debug, Default)]
pub struct ClientOptions {
    pub extra_headers: Vec<(String, String)>,
    pub config: WebSocketConfig,
}

impl ClientOptions {
    pub fn new() -> Self {
        Self {
            extra_headers: Vec::new(),
            config: WebSocketConfig::default(),
        }
    }

    pub fn header(mut self, name: impl Into<String>, value: impl Into<String>) -> Self {
        self.extra_headers.push((name.into(), value.into()));
        self
    }

    pub fn config(mut self, config: WebSocketConfig) -> Self {
        self.config = config;
        self
    }
}

/// Performs the server side of the upgrade on a freshly accepted connection
pub async fn accept(conn: Connection, config: WebSocketConfig) -> Result<WebSocket> {
    let id = conn.id();
    let (mut reader, mut writer) = conn.split();
    let mut buf = BytesMut::new();

    let head = read_head(&mut reader, &mut buf).await?;
    let (request_line, headers) = parse_head(&head)?;

    if !request_line.starts_with("GET ") {
        return Err(Error::Protocol(format!(
            "websocket upgrade must be a GET, got: {request_line}"
        )));
    }

    let upgrade_ok = header(&headers, "upgrade")
        .map(|value| value.eq_ignore_ascii_case("websocket"))
        .unwrap_or(false);
    if !upgrade_ok {
        return Err(Error::Protocol("missing `Upgrade: websocket` header".into()));
    }

    let key = header(&headers, "sec-websocket-key")
        .ok_or_else(|| Error::Protocol("missing Sec-WebSocket-Key header".into()))?;

    let response = format!(
        "HTTP/1.1 101 Switching Protocols\r\n\
         Upgrade: websocket\r\n\
         Connection: Upgrade\r\n\
         Sec-WebSocket-Accept: {}\r\n\r\n",
        accept_key(key)
    );
    writer.write_raw(response.as_bytes()).await?;

    debug!(conn = id, "websocket upgrade accepted");

    let conn = Connection::rejoin(reader, writer);
    Ok(WebSocket::new(conn, buf, config, Role::Server))
}

/// Performs the client side of the upgrade over a dialed connection
pub async fn connect(
    conn: Connection,
    endpoint: &Endpoint,
    path: &str,
    options: ClientOptions,
) -> Result<WebSocket> {
    let id = conn.id();
    let (mut reader, mut writer) = conn.split();
    let mut buf = BytesMut::new();

    let nonce: [u8; 16] = rand::random();
    let key = base64::encode(nonce);

    let mut request = format!(
        "GET {path} HTTP/1.1\r\n\
         Host: {}:{}\r\n\
         Upgrade: websocket\r\n\
         Connection: Upgrade\r\n\
         Sec-WebSocket-Key: {key}\r\n\
         Sec-WebSocket-Version: 13\r\n",
        endpoint.host(),
        endpoint.port()
    );
    for (name, value) in &options.extra_headers {
        request.push_str(&format!("{name}: {value}\r\n"));
    }
    request.push_str("\r\n");

    writer.write_raw(request.as_bytes()).await?;

    let head = read_head(&mut reader, &mut buf).await?;
    let (status_line, headers) = parse_head(&head)?;

    if !status_line.contains(" 101 ") {
        return Err(Error::Protocol(format!(
            "upgrade refused: {status_line}"
        )));
    }

    let expected = accept_key(&key);
    match header(&headers, "sec-websocket-accept") {
        Some(accept) if accept == expected => {}
        _ => return Err(Error::Protocol("bad Sec-WebSocket-Accept".into())),
    }

    debug!(conn = id, "websocket upgrade completed");

    let conn = Connection::rejoin(reader, writer);
    Ok(WebSocket::new(conn, buf, options.config, Role::Client))
}
