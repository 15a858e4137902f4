// Copyright Amazon.com, Inc. or its affiliates. All Rights Reserved.
// SPDX-License-Identifier: Apache-2.0

//! netkit is a toolkit of cooperating network services built on one framed
//! transport substrate: stream/datagram listeners and dialers with optional
//! TLS, a reusable connection pool, file transfer, a pub/sub broker, a
//! JSON-RPC engine, an adaptive live-media streaming server, a conferencing
//! fan-out and a websocket layer.
//!
//! Each service owns its listeners and spawns one task per accepted
//! connection. Every long-lived task observes a [`shutdown::Shutdown`]
//! signal; writes on a connection go through a single writer.

pub type Result<T, E = Error> = core::result::Result<T, E>;

mod error;
pub(crate) mod queue;

pub mod conference;
pub mod endpoint;
pub mod file;
pub mod http;
pub mod json;
pub mod live;
pub mod pool;
pub mod pubsub;
pub mod rpc;
pub mod shutdown;
pub mod transport;
pub mod websocket;

pub use endpoint::{Endpoint, TlsConfig};
pub use error::Error;
pub use netkit_codec as codec;
pub use transport::Connection;
