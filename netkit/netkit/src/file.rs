// Copyright Amazon.com, Inc. or its affiliates. All Rights Reserved.
// SPDX-License-Identifier: Apache-2.0

//! File transfer over a framed connection: one JSON header frame
//! (`{filename, size, checksum?}`) followed by exactly `size` raw payload
//! bytes in fixed-size chunks.
//!
//! The receiver only ever uses the basename of the offered filename, so a
//! malicious `../../etc/passwd` lands inside the sandbox directory.

use crate::{
    endpoint::Endpoint,
    shutdown::Shutdown,
    transport::{dial_stream, Connection, StreamServer},
    Error, Result,
};
use core::time::Duration;
use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};
use std::{
    net::SocketAddr,
    path::{Path, PathBuf},
};
use tokio::{
    fs::File,
    io::{AsyncReadExt, AsyncWriteExt},
};
use tracing::{debug, info};

/// Payload chunk size for both sides
pub const DEFAULT_CHUNK_SIZE: usize = 64 * 1024;

#[derive(Debug, Deserialize, Serialize)]
struct FileHeader {
    filename: String,
    size: u64,
    #[serde(skip_serializing_if = "Option::is_none")]
    checksum: Option<String>,
}

fn hex(bytes: &[u8]) -> String {
    bytes.iter().fold(String::new(), |mut out, byte| {
        out.push_str(&format!("{byte:02x}"));
        out
    })
}

async fn sha256_file(path: &Path) -> Result<String> {
    let mut file = File::open(path).await?;
    let mut hasher = Sha256::new();
    let mut buf = vec![0u8; DEFAULT_CHUNK_SIZE];

    loop {
        let n = file.read(&mut buf).await?;
        if n == 0 {
            break;
        }
        hasher.update(&buf[..n]);
    }

    Ok(hex(&hasher.finalize()))
}

/// Streams `path` over the connection. `progress` is called with
/// (bytes sent, total) after every chunk.
pub async fn send_file(
    conn: &mut Connection,
    path: &Path,
    mut progress: impl FnMut(u64, u64),
) -> Result<()> {
    let metadata = tokio::fs::metadata(path).await?;
    if !metadata.is_file() {
        return Err(Error::FileTransfer(format!(
            "{} is not a regular file",
            path.display()
        )));
    }

    let size = metadata.len();
    let filename = path
        .file_name()
        .ok_or_else(|| Error::FileTransfer("path has no filename".into()))?
        .to_string_lossy()
        .into_owned();
    let checksum = sha256_file(path).await?;

    conn.write_json(&FileHeader {
        filename: filename.clone(),
        size,
        checksum: Some(checksum),
    })
    .await?;

    let mut file = File::open(path).await?;
    let mut buf = vec![0u8; DEFAULT_CHUNK_SIZE];
    let mut sent = 0u64;

    while sent < size {
        let n = file.read(&mut buf).await?;
        if n == 0 {
            return Err(Error::FileTransfer(format!(
                "{filename} shrank while sending ({sent} of {size} bytes)"
            )));
        }
        conn.write_raw(&buf[..n]).await?;
        sent += n as u64;
        progress(sent, size);
    }

    debug!(file = %filename, bytes = size, "file sent");
    Ok(())
}

/// Receives one file into `dir`, returning the written path
pub async fn receive_file(
    conn: &mut Connection,
    dir: &Path,
    mut progress: impl FnMut(u64, u64),
) -> Result<PathBuf> {
    let header: FileHeader = conn.read_json().await?;

    // path traversal defense: only the basename is honored
    let name = Path::new(&header.filename)
        .file_name()
        .ok_or_else(|| Error::FileTransfer("header carries no usable filename".into()))?
        .to_owned();

    tokio::fs::create_dir_all(dir).await?;
    let dest = dir.join(&name);
    let mut file = File::create(&dest).await?;
    let mut hasher = Sha256::new();

    let mut received = 0u64;
    while received < header.size {
        let want = (header.size - received).min(DEFAULT_CHUNK_SIZE as u64) as usize;
        let chunk = conn.recv_exact(want).await.map_err(|err| match err {
            Error::ClosedByPeer | Error::TruncatedFrame { .. } => Error::FileTransfer(format!(
                "transfer truncated at {received} of {} bytes",
                header.size
            )),
            err => err,
        })?;

        hasher.update(&chunk);
        file.write_all(&chunk).await?;
        received += want as u64;
        progress(received, header.size);
    }

    file.flush().await?;

    if let Some(expected) = &header.checksum {
        let actual = hex(&hasher.finalize());
        if &actual != expected {
            let _ = tokio::fs::remove_file(&dest).await;
            return Err(Error::FileTransfer(format!(
                "checksum mismatch for {}: expected {expected}, got {actual}",
                name.to_string_lossy()
            )));
        }
    }

    debug!(file = %dest.display(), bytes = header.size, "file received");
    Ok(dest)
}

/// Dials the endpoint and sends one file
pub async fn send_file_to(
    endpoint: &Endpoint,
    path: &Path,
    deadline: Duration,
    progress: impl FnMut(u64, u64),
) -> Result<()> {
    let mut conn = dial_stream(endpoint, deadline).await?;
    send_file(&mut conn, path, progress).await?;
    conn.shutdown().await
}

/// A listener that stores every received file in a sandbox directory
pub struct FileServer {
    server: StreamServer,
    dir: PathBuf,
}

impl FileServer {
    pub async fn bind(endpoint: &Endpoint, dir: impl Into<PathBuf>) -> Result<Self> {
        Ok(Self {
            server: StreamServer::bind(endpoint).await?,
            dir: dir.into(),
        })
    }

    pub fn local_addr(&self) -> SocketAddr {
        self.server.local_addr()
    }

    pub async fn serve(self, signal: impl core::future::Future<Output = ()>) -> Result<()> {
        let dir = self.dir;
        self.server
            .serve(
                move |mut conn: Connection, remote: SocketAddr, _shutdown: Shutdown| {
                    let dir = dir.clone();
                    async move {
                        let path = receive_file(&mut conn, &dir, |_done, _total| {}).await?;
                        info!(remote = %remote, file = %path.display(), "stored file");
                        Ok(())
                    }
                },
                signal,
            )
            .await
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::transport::testing::connection_pair;

    #[tokio::test]
    async fn header_then_payload_round_trip() {
        let dir = tempfile::tempdir().unwrap();
        let src = dir.path().join("src.bin");
        tokio::fs::write(&src, vec![7u8; 150_000]).await.unwrap();

        let (mut sender, mut receiver) = connection_pair().await;
        let recv_dir = dir.path().join("recv");

        let recv_dir2 = recv_dir.clone();
        let receive =
            tokio::spawn(
                async move { receive_file(&mut receiver, &recv_dir2, |_, _| {}).await },
            );

        let mut calls = 0;
        send_file(&mut sender, &src, |done, total| {
            calls += 1;
            assert!(done <= total);
        })
        .await
        .unwrap();
        assert!(calls >= 1);

        let dest = receive.await.unwrap().unwrap();
        assert_eq!(dest, recv_dir.join("src.bin"));
        let written = tokio::fs::read(&dest).await.unwrap();
        assert_eq!(written, vec![7u8; 150_000]);
    }

    #[tokio::test]
    async fn traversal_is_confined_to_the_sandbox() {
        let dir = tempfile::tempdir().unwrap();
        let (client, mut receiver) = connection_pair().await;

        let (_r, mut writer) = client.split();
        let header = serde_json::json!({
            "filename": "../../escape.bin",
            "size": 4,
        });
        writer
            .write_json(&header)
            .await
            .unwrap();
        writer.write_raw(b"data").await.unwrap();

        let dest = receive_file(&mut receiver, dir.path(), |_, _| {})
            .await
            .unwrap();
        assert_eq!(dest, dir.path().join("escape.bin"));
        assert!(!dir.path().parent().unwrap().join("escape.bin").exists());
    }

    #[tokio::test]
    async fn truncation_is_reported() {
        let dir = tempfile::tempdir().unwrap();
        let (client, mut receiver) = connection_pair().await;

        let (_r, mut writer) = client.split();
        writer
            .write_json(&serde_json::json!({"filename": "t.bin", "size": 10}))
            .await
            .unwrap();
        writer.write_raw(b"short").await.unwrap();
        writer.shutdown().await.unwrap();
        drop(writer);
        drop(_r);

        let err = receive_file(&mut receiver, dir.path(), |_, _| {})
            .await
            .unwrap_err();
        assert!(matches!(err, Error::FileTransfer(message) if message.contains("truncated")));
    }

    #[tokio::test]
    async fn checksum_mismatch_removes_the_file() {
        let dir = tempfile::tempdir().unwrap();
        let (client, mut receiver) = connection_pair().await;

        let (_r, mut writer) = client.split();
        writer
            .write_json(&serde_json::json!({
                "filename": "c.bin",
                "size": 4,
                "checksum": "00",
            }))
            .await
            .unwrap();
        writer.write_raw(b"data").await.unwrap();

        let err = receive_file(&mut receiver, dir.path(), |_, _| {})
            .await
            .unwrap_err();
        assert!(matches!(err, Error::FileTransfer(message) if message.contains("checksum")));
        assert!(!dir.path().join("c.bin").exists());
    }
}
