// Copyright Amazon.com, Inc. or its affiliates. All Rights Reserved.
// SPDX-License-Identifier: Apache-2.0

//! Datagram transport: a plain UDP listener loop, one-shot senders and
//! multicast group membership. The receive loop is a single activation; the
//! handler is expected to be non-blocking and to offload real work.

use crate::{endpoint::Endpoint, Error, Result};
use bytes::Bytes;
use core::future::Future;
use std::net::{Ipv4Addr, SocketAddr, SocketAddrV4};
use std::sync::Arc;
use tokio::net::{lookup_host, UdpSocket};
use tracing::{error, info};

/// Largest datagram the receive loop hands to a handler
const MAX_DATAGRAM: usize = 64 * 1024;

#[derive(Clone, Copy, Debug)]
pub struct MulticastConfig {
    pub group: Ipv4Addr,
    pub port: u16,
    /// Interface the receiver joins on; unspecified lets the OS pick
    pub interface: Ipv4Addr,
    /// Sender time-to-live; 1 keeps traffic on the local segment
    pub ttl: u32,
}

impl MulticastConfig {
    pub fn new(group: Ipv4Addr, port: u16) -> Self {
        Self {
            group,
            port,
            interface: Ipv4Addr::UNSPECIFIED,
            ttl: 1,
        }
    }

    pub fn with_interface(mut self, interface: Ipv4Addr) -> Self {
        self.interface = interface;
        self
    }

    pub fn with_ttl(mut self, ttl: u32) -> Self {
        self.ttl = ttl;
        self
    }
}

pub struct DatagramServer {
    socket: Arc<UdpSocket>,
    local_addr: SocketAddr,
}

impl DatagramServer {
    pub async fn bind(endpoint: &Endpoint) -> Result<Self> {
        let socket = UdpSocket::bind((endpoint.host(), endpoint.port())).await?;
        let local_addr = socket.local_addr()?;
        info!(addr = %local_addr, "datagram listener bound");

        Ok(Self {
            socket: Arc::new(socket),
            local_addr,
        })
    }

    /// Joins a multicast group with a reusable port so several receivers on
    /// one host can share it
    pub async fn bind_multicast(config: &MulticastConfig) -> Result<Self> {
        let socket = socket2::Socket::new(
            socket2::Domain::IPV4,
            socket2::Type::DGRAM,
            Some(socket2::Protocol::UDP),
        )?;
        socket.set_reuse_address(true)?;
        socket.set_nonblocking(true)?;
        let bind_addr: SocketAddr = SocketAddrV4::new(Ipv4Addr::UNSPECIFIED, config.port).into();
        socket.bind(&bind_addr.into())?;

        let socket = UdpSocket::from_std(socket.into())?;
        socket.join_multicast_v4(config.group, config.interface)?;

        let local_addr = socket.local_addr()?;
        info!(addr = %local_addr, group = %config.group, "multicast listener joined");

        Ok(Self {
            socket: Arc::new(socket),
            local_addr,
        })
    }

    pub fn local_addr(&self) -> SocketAddr {
        self.local_addr
    }

    pub fn socket(&self) -> Arc<UdpSocket> {
        self.socket.clone()
    }

    /// Receives datagrams until `signal` resolves. The handler gets the
    /// payload, the source address and a handle to the socket for replies.
    pub async fn serve<H>(self, handler: H, signal: impl Future<Output = ()>) -> Result<()>
    where
        H: Fn(Bytes, SocketAddr, Arc<UdpSocket>) + Send + 'static,
    {
        let mut buf = vec![0u8; MAX_DATAGRAM];

        tokio::pin!(signal);

        loop {
            tokio::select! {
                received = self.socket.recv_from(&mut buf) => {
                    match received {
                        Ok((len, source)) => {
                            let data = Bytes::copy_from_slice(&buf[..len]);
                            handler(data, source, self.socket.clone());
                        }
                        Err(err) => {
                            error!(addr = %self.local_addr, error = %err, "datagram receive failed");
                        }
                    }
                }
                _ = &mut signal => break,
            }
        }

        info!(addr = %self.local_addr, "datagram listener stopped");
        Ok(())
    }
}

/// Sends one datagram to an endpoint
pub async fn send_datagram(endpoint: &Endpoint, data: &[u8]) -> Result<()> {
    let target = lookup_host((endpoint.host(), endpoint.port()))
        .await?
        .next()
        .ok_or_else(|| {
            Error::Io(std::io::Error::new(
                std::io::ErrorKind::NotFound,
                format!("no address for {}", endpoint.host()),
            ))
        })?;

    let bind_addr: SocketAddr = if target.is_ipv4() {
        (Ipv4Addr::UNSPECIFIED, 0).into()
    } else {
        (std::net::Ipv6Addr::UNSPECIFIED, 0).into()
    };

    let socket = UdpSocket::bind(bind_addr).await?;
    socket.send_to(data, target).await?;
    Ok(())
}

/// Sends one datagram to a multicast group with the configured TTL
pub async fn send_multicast(config: &MulticastConfig, data: &[u8]) -> Result<()> {
    let socket = UdpSocket::bind((Ipv4Addr::UNSPECIFIED, 0)).await?;
    socket.set_multicast_ttl_v4(config.ttl)?;
    socket
        .send_to(data, SocketAddrV4::new(config.group, config.port))
        .await?;
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::shutdown::Controller;
    use core::time::Duration;
    use tokio::sync::mpsc;

    #[tokio::test]
    async fn datagram_round_trip() {
        let endpoint = Endpoint::datagram("127.0.0.1", 0);
        let server = DatagramServer::bind(&endpoint).await.unwrap();
        let port = server.local_addr().port();

        let (tx, mut rx) = mpsc::unbounded_channel();
        let controller = Controller::new();
        let mut signal = controller.subscribe();

        let serve = tokio::spawn(server.serve(
            move |data, source, _socket| {
                let _ = tx.send((data, source));
            },
            async move { signal.recv().await },
        ));

        let target = Endpoint::datagram("127.0.0.1", port);
        send_datagram(&target, b"hello udp").await.unwrap();

        let (data, _source) = rx.recv().await.unwrap();
        assert_eq!(&data[..], b"hello udp");

        controller.shutdown(Duration::from_secs(1)).await;
        serve.await.unwrap().unwrap();
    }

    #[tokio::test]
    async fn handler_can_reply_through_the_socket_handle() {
        let endpoint = Endpoint::datagram("127.0.0.1", 0);
        let server = DatagramServer::bind(&endpoint).await.unwrap();
        let port = server.local_addr().port();

        let controller = Controller::new();
        let mut signal = controller.subscribe();

        tokio::spawn(server.serve(
            move |data, source, socket| {
                tokio::spawn(async move {
                    let _ = socket.send_to(&data, source).await;
                });
            },
            async move { signal.recv().await },
        ));

        let client = UdpSocket::bind("127.0.0.1:0").await.unwrap();
        client.send_to(b"echo me", ("127.0.0.1", port)).await.unwrap();

        let mut buf = [0u8; 32];
        let (len, _) = client.recv_from(&mut buf).await.unwrap();
        assert_eq!(&buf[..len], b"echo me");

        controller.shutdown(Duration::from_secs(1)).await;
    }
}
