// Copyright Amazon.com, Inc. or its affiliates. All Rights Reserved.
// SPDX-License-Identifier: Apache-2.0

//! Minimal HTTP/1.1 helpers: `get`/`post` clients and a static-route server.
//!
//! Scope is deliberately small: no HTTP/2, no redirects, no cookies. The
//! websocket handshake reuses the head parsing here.

use crate::{
    endpoint::Endpoint,
    shutdown::Shutdown,
    transport::{dial_stream, Connection, FramedReader, FramedWriter, StreamServer},
    Error, Result,
};
use bytes::{Buf, Bytes, BytesMut};
use core::time::Duration;
use std::{collections::HashMap, net::SocketAddr, sync::Arc};
use tracing::debug;

/// Upper bound on a request or response head
pub(crate) const MAX_HEAD: usize = 8 * 1024;

/// Upper bound on a body we are willing to buffer
const MAX_BODY: usize = 16 * 1024 * 1024;

/// Reads from `reader` into `buf` until the blank line ending the head;
/// returns the head bytes and leaves any extra bytes in `buf`
pub(crate) async fn read_head(reader: &mut FramedReader, buf: &mut BytesMut) -> Result<Bytes> {
    loop {
        if let Some(end) = find_head_end(buf) {
            let head = buf.split_to(end);
            buf.advance(4);
            return Ok(head.freeze());
        }

        if buf.len() > MAX_HEAD {
            return Err(Error::Protocol("http head exceeds 8 KiB".into()));
        }

        if reader.read_chunk(buf).await? == 0 {
            return Err(Error::ClosedByPeer);
        }
    }
}

fn find_head_end(buf: &BytesMut) -> Option<usize> {
    buf.windows(4).position(|window| window == b"\r\n\r\n")
}

/// Splits a head into its first line and lowercase-keyed headers
pub(crate) fn parse_head(head: &[u8]) -> Result<(String, Vec<(String, String)>)> {
    let text = core::str::from_utf8(head)
        .map_err(|_| Error::Protocol("http head is not valid UTF-8".into()))?;

    let mut lines = text.split("\r\n");
    let first = lines
        .next()
        .ok_or_else(|| Error::Protocol("empty http head".into()))?
        .to_owned();

    let mut headers = Vec::new();
    for line in lines {
        if line.is_empty() {
            continue;
        }
        let (name, value) = line
            .split_once(':')
            .ok_or_else(|| Error::Protocol(format!("malformed header line: {line}")))?;
        headers.push((name.trim().to_ascii_lowercase(), value.trim().to_owned()));
    }

    Ok((first, headers))
}

pub(crate) fn header<'a>(headers: &'a [(String, String)], name: &str) -> Option<&'a str> {
    headers
        .iter()
        .find(|(key, _)| key == name)
        .map(|(_, value)| value.as_str())
}

/// A buffered HTTP response
#[derive(Debug)]
pub struct Response {
    pub status: u16,
    pub headers: Vec<(String, String)>,
    pub body: Bytes,
}

impl Response {
    pub fn header(&self, name: &str) -> Option<&str> {
        header(&self.headers, &name.to_ascii_lowercase())
    }

    pub fn is_success(&self) -> bool {
        (200..300).contains(&self.status)
    }
}

/// Issues a GET and buffers the response
pub async fn http_get(
    endpoint: &Endpoint,
    path: &str,
    headers: &[(String, String)],
    deadline: Duration,
) -> Result<Response> {
    request(endpoint, "GET", path, headers, None, deadline).await
}

/// Issues a POST with a body and buffers the response
pub async fn http_post(
    endpoint: &Endpoint,
    path: &str,
    content_type: &str,
    body: &[u8],
    headers: &[(String, String)],
    deadline: Duration,
) -> Result<Response> {
    let mut headers = headers.to_vec();
    headers.push(("Content-Type".into(), content_type.into()));
    request(endpoint, "POST", path, &headers, Some(body), deadline).await
}

async fn request(
    endpoint: &Endpoint,
    method: &str,
    path: &str,
    headers: &[(String, String)],
    body: Option<&[u8]>,
    deadline: Duration,
) -> Result<Response> {
    let conn = dial_stream(endpoint, deadline).await?;
    let (mut reader, mut writer) = conn.split();

    let mut head = format!(
        "{method} {path} HTTP/1.1\r\nHost: {}:{}\r\nConnection: close\r\n",
        endpoint.host(),
        endpoint.port()
    );
    for (name, value) in headers {
        head.push_str(&format!("{name}: {value}\r\n"));
    }
    if let Some(body) = body {
        head.push_str(&format!("Content-Length: {}\r\n", body.len()));
    }
    head.push_str("\r\n");

    writer.write_raw(head.as_bytes()).await?;
    if let Some(body) = body {
        writer.write_raw(body).await?;
    }

    let result = tokio::time::timeout(deadline, read_response(&mut reader)).await;
    match result {
        Ok(response) => response,
        Err(_) => Err(Error::Timeout(deadline)),
    }
}

async fn read_response(reader: &mut FramedReader) -> Result<Response> {
    let mut buf = BytesMut::new();
    let head = read_head(reader, &mut buf).await?;
    let (status_line, headers) = parse_head(&head)?;

    // e.g. `HTTP/1.1 200 OK`
    let status = status_line
        .split_whitespace()
        .nth(1)
        .and_then(|code| code.parse::<u16>().ok())
        .ok_or_else(|| Error::Protocol(format!("malformed status line: {status_line}")))?;

    let body = if let Some(length) = header(&headers, "content-length") {
        let length: usize = length
            .parse()
            .map_err(|_| Error::Protocol("malformed content-length".into()))?;
        if length > MAX_BODY {
            return Err(Error::Protocol("response body too large".into()));
        }
        read_body_exact(reader, &mut buf, length).await?
    } else if header(&headers, "transfer-encoding")
        .map(|value| value.eq_ignore_ascii_case("chunked"))
        .unwrap_or(false)
    {
        read_chunked_body(reader, &mut buf).await?
    } else {
        // no framing information: body runs to EOF
        read_body_to_eof(reader, &mut buf).await?
    };

    Ok(Response {
        status,
        headers,
        body,
    })
}

async fn read_body_exact(
    reader: &mut FramedReader,
    buf: &mut BytesMut,
    length: usize,
) -> Result<Bytes> {
    while buf.len() < length {
        if reader.read_chunk(buf).await? == 0 {
            return Err(Error::TruncatedFrame {
                expected: length,
                received: buf.len(),
            });
        }
    }
    Ok(buf.split_to(length).freeze())
}

async fn read_body_to_eof(reader: &mut FramedReader, buf: &mut BytesMut) -> Result<Bytes> {
    loop {
        if buf.len() > MAX_BODY {
            return Err(Error::Protocol("response body too large".into()));
        }
        if reader.read_chunk(buf).await? == 0 {
            return Ok(buf.split().freeze());
        }
    }
}

async fn read_chunked_body(reader: &mut FramedReader, buf: &mut BytesMut) -> Result<Bytes> {
    let mut body = BytesMut::new();

    loop {
        // chunk size line
        let line = read_line(reader, buf).await?;
        let size = usize::from_str_radix(line.trim(), 16)
            .map_err(|_| Error::Protocol(format!("malformed chunk size: {line}")))?;

        if body.len() + size > MAX_BODY {
            return Err(Error::Protocol("response body too large".into()));
        }

        if size == 0 {
            // trailing CRLF after the last chunk
            let _ = read_line(reader, buf).await?;
            return Ok(body.freeze());
        }

        while buf.len() < size + 2 {
            if reader.read_chunk(buf).await? == 0 {
                return Err(Error::TruncatedFrame {
                    expected: size,
                    received: buf.len(),
                });
            }
        }
        body.extend_from_slice(&buf.split_to(size));
        buf.advance(2);
    }
}

async fn read_line(reader: &mut FramedReader, buf: &mut BytesMut) -> Result<String> {
    loop {
        if let Some(end) = buf.windows(2).position(|window| window == b"\r\n") {
            let line = buf.split_to(end);
            buf.advance(2);
            return Ok(String::from_utf8_lossy(&line).into_owned());
        }
        if buf.len() > MAX_HEAD {
            return Err(Error::Protocol("http line too long".into()));
        }
        if reader.read_chunk(buf).await? == 0 {
            return Err(Error::ClosedByPeer);
        }
    }
}

/// A parsed request as seen by a route handler
#[derive(Debug)]
pub struct Request {
    pub method: String,
    pub path: String,
    pub headers: Vec<(String, String)>,
    pub body: Bytes,
}

impl Request {
    pub fn header(&self, name: &str) -> Option<&str> {
        header(&self.headers, &name.to_ascii_lowercase())
    }
}

#[derive(Debug)]
pub struct RouteResponse {
    pub status: u16,
    pub content_type: String,
    pub body: Bytes,
}

impl RouteResponse {
    pub fn ok(content_type: &str, body: impl Into<Bytes>) -> Self {
        Self {
            status: 200,
            content_type: content_type.into(),
            body: body.into(),
        }
    }

    pub fn not_found() -> Self {
        Self {
            status: 404,
            content_type: "text/plain".into(),
            body: Bytes::from_static(b"not found"),
        }
    }
}

pub type RouteHandler = Arc<dyn Fn(&Request) -> RouteResponse + Send + Sync>;

/// A static-route HTTP/1.1 server, good enough for health endpoints and the
/// CLI front-end
pub struct HttpServer {
    server: StreamServer,
    routes: Arc<HashMap<(String, String), RouteHandler>>,
}

#[derive(Default)]
pub struct Router {
    routes: HashMap<(String, String), RouteHandler>,
}

impl Router {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn route<F>(mut self, method: &str, path: &str, handler: F) -> Self
    where
        F: Fn(&Request) -> RouteResponse + Send + Sync + 'static,
    {
        self.routes
            .insert((method.to_uppercase(), path.into()), Arc::new(handler));
        self
    }
}

impl HttpServer {
    pub async fn bind(endpoint: &Endpoint, router: Router) -> Result<Self> {
        Ok(Self {
            server: StreamServer::bind(endpoint).await?,
            routes: Arc::new(router.routes),
        })
    }

    pub fn local_addr(&self) -> SocketAddr {
        self.server.local_addr()
    }

    pub async fn serve(self, signal: impl core::future::Future<Output = ()>) -> Result<()> {
        let routes = self.routes;
        self.server
            .serve(
                move |conn, remote, shutdown| {
                    handle_http(routes.clone(), conn, remote, shutdown)
                },
                signal,
            )
            .await
    }
}

async fn handle_http(
    routes: Arc<HashMap<(String, String), RouteHandler>>,
    conn: Connection,
    remote: SocketAddr,
    mut shutdown: Shutdown,
) -> Result<()> {
    let (mut reader, mut writer) = conn.split();
    let mut buf = BytesMut::new();

    loop {
        let head = tokio::select! {
            head = read_head(&mut reader, &mut buf) => match head {
                Ok(head) => head,
                Err(Error::ClosedByPeer) => return Ok(()),
                Err(err) => return Err(err),
            },
            _ = shutdown.recv() => return Ok(()),
        };

        let (request_line, headers) = parse_head(&head)?;
        let mut parts = request_line.split_whitespace();
        let (Some(method), Some(path)) = (parts.next(), parts.next()) else {
            return Err(Error::Protocol(format!(
                "malformed request line: {request_line}"
            )));
        };

        let body = match header(&headers, "content-length") {
            Some(length) => {
                let length: usize = length
                    .parse()
                    .map_err(|_| Error::Protocol("malformed content-length".into()))?;
                if length > MAX_BODY {
                    return Err(Error::Protocol("request body too large".into()));
                }
                read_body_exact(&mut reader, &mut buf, length).await?
            }
            None => Bytes::new(),
        };

        let close = header(&headers, "connection")
            .map(|value| value.eq_ignore_ascii_case("close"))
            .unwrap_or(false);

        let request = Request {
            method: method.to_uppercase(),
            path: path.to_owned(),
            headers,
            body,
        };

        debug!(remote = %remote, method = %request.method, path = %request.path, "http request");

        let response = match routes.get(&(request.method.clone(), request.path.clone())) {
            Some(handler) => handler.as_ref()(&request),
            None => RouteResponse::not_found(),
        };

        write_route_response(&mut writer, &response).await?;

        if close {
            return Ok(());
        }
    }
}

async fn write_route_response(writer: &mut FramedWriter, response: &RouteResponse) -> Result<()> {
    let reason = match response.status {
        200 => "OK",
        404 => "Not Found",
        400 => "Bad Request",
        _ => "Internal Server Error",
    };
    let head = format!(
        "HTTP/1.1 {} {reason}\r\nContent-Type: {}\r\nContent-Length: {}\r\n\r\n",
        response.status,
        response.content_type,
        response.body.len(),
    );
    writer.write_raw(head.as_bytes()).await?;
    writer.write_raw(&response.body).await
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::shutdown::Controller;

    async fn hello_server() -> (Endpoint, Controller) {
        let router = Router::new()
            .route("GET", "/hello", |_request| {
                RouteResponse::ok("text/plain", &b"hi there"[..])
            })
            .route("POST", "/echo", |request| {
                RouteResponse::ok("application/octet-stream", request.body.clone())
            });

        let server = HttpServer::bind(&Endpoint::stream("127.0.0.1", 0), router)
            .await
            .unwrap();
        let endpoint = Endpoint::stream("127.0.0.1", server.local_addr().port());

        let controller = Controller::new();
        let mut signal = controller.subscribe();
        tokio::spawn(server.serve(async move { signal.recv().await }));

        (endpoint, controller)
    }

    #[tokio::test]
    async fn get_and_post_round_trip() {
        let (endpoint, _controller) = hello_server().await;

        let response = http_get(&endpoint, "/hello", &[], Duration::from_secs(2))
            .await
            .unwrap();
        assert_eq!(response.status, 200);
        assert_eq!(&response.body[..], b"hi there");

        let response = http_post(
            &endpoint,
            "/echo",
            "application/octet-stream",
            b"payload",
            &[],
            Duration::from_secs(2),
        )
        .await
        .unwrap();
        assert_eq!(response.status, 200);
        assert_eq!(&response.body[..], b"payload");
    }

    #[tokio::test]
    async fn unknown_route_is_404() {
        let (endpoint, _controller) = hello_server().await;
        let response = http_get(&endpoint, "/missing", &[], Duration::from_secs(2))
            .await
            .unwrap();
        assert_eq!(response.status, 404);
    }

    #[test]
    fn head_parsing() {
        let (line, headers) =
            parse_head(b"GET /x HTTP/1.1\r\nHost: example\r\nX-Two:  spaced  ").unwrap();
        assert_eq!(line, "GET /x HTTP/1.1");
        assert_eq!(header(&headers, "host"), Some("example"));
        assert_eq!(header(&headers, "x-two"), Some("spaced"));
    }
}
