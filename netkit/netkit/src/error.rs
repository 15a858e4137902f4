// Copyright Amazon.com, Inc. or its affiliates. All Rights Reserved.
// SPDX-License-Identifier: Apache-2.0

use core::time::Duration;
use std::io;

/// Errors surfaced by the netkit services.
///
/// Transport errors are retryable at the client; protocol errors are fatal to
/// the offending connection and never to the server; shutdown is not an
/// error.
#[derive(Debug, thiserror::Error)]
pub enum Error {
    // transport
    #[error("dial to {addr} timed out after {timeout:?}")]
    DialTimeout { addr: String, timeout: Duration },
    #[error("connection closed by peer")]
    ClosedByPeer,
    #[error("operation timed out after {0:?}")]
    Timeout(Duration),
    #[error(transparent)]
    Io(#[from] io::Error),

    // protocol
    #[error("frame of {len} bytes exceeds the {max} byte limit")]
    FrameTooLarge { len: usize, max: usize },
    #[error("connection closed mid-frame ({received} of {expected} bytes)")]
    TruncatedFrame { expected: usize, received: usize },
    #[error("invalid JSON frame: {0}")]
    InvalidJson(#[from] serde_json::Error),
    #[error("websocket protocol error: {0}")]
    WebSocket(#[from] netkit_codec::websocket::Error),
    #[error("protocol violation: {0}")]
    Protocol(String),
    #[error("tls configuration: {0}")]
    Tls(String),

    // application
    #[error("remote call failed: {0}")]
    Rpc(String),
    #[error("file transfer failed: {0}")]
    FileTransfer(String),
    #[error("unknown source id: {0}")]
    InvalidSelection(String),

    // resource
    #[error("no pooled connection became available within {0:?}")]
    PoolExhausted(Duration),
    #[error("the connection pool is closed")]
    PoolClosed,

    // lifecycle
    #[error("shutdown in progress")]
    Shutdown,
}

impl Error {
    /// True for conditions a client can retry against the same endpoint
    pub fn is_transient(&self) -> bool {
        matches!(
            self,
            Self::DialTimeout { .. } | Self::Timeout(_) | Self::PoolExhausted(_)
        )
    }

    /// True when the error only poisons the current connection
    pub fn is_connection_fatal(&self) -> bool {
        matches!(
            self,
            Self::ClosedByPeer
                | Self::FrameTooLarge { .. }
                | Self::TruncatedFrame { .. }
                | Self::InvalidJson(_)
                | Self::WebSocket(_)
                | Self::Protocol(_)
                | Self::Io(_)
        )
    }
}

impl From<netkit_codec::frame::Error> for Error {
    fn from(error: netkit_codec::frame::Error) -> Self {
        match error {
            netkit_codec::frame::Error::FrameTooLarge { len, max } => {
                Self::FrameTooLarge { len, max }
            }
        }
    }
}

impl From<netkit_codec::live::Error> for Error {
    fn from(error: netkit_codec::live::Error) -> Self {
        match error {
            netkit_codec::live::Error::PayloadTooLarge { len, max } => {
                Self::FrameTooLarge { len, max }
            }
        }
    }
}
