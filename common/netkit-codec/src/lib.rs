// Copyright Amazon.com, Inc. or its affiliates. All Rights Reserved.
// SPDX-License-Identifier: Apache-2.0

//! Wire codecs shared by the netkit services.
//!
//! Everything in this crate is pure encode/decode over [`bytes`] buffers;
//! sockets, tasks and timeouts live in the `netkit` crate.

pub mod frame;
pub mod live;
pub mod websocket;

pub use frame::Limits;
