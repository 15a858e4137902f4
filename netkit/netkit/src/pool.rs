// Copyright Amazon.com, Inc. or its affiliates. All Rights Reserved.
// SPDX-License-Identifier: Apache-2.0

//! A bounded pool of dialed connections with idle eviction.
//!
//! `acquire` reuses an idle connection, dials while under the size bound, or
//! waits until the deadline. A background sweeper closes connections that sat
//! idle past the configured timeout. A connection that saw a framing or
//! protocol error must be released with `ok = false` so it is destroyed
//! instead of being put back.

use crate::{
    endpoint::Endpoint,
    transport::{dial_stream_with, Connection},
    Error, Result,
};
use core::{
    ops::{Deref, DerefMut},
    sync::atomic::{AtomicU64, Ordering},
    time::Duration,
};
use netkit_codec::frame::Limits;
use std::{
    collections::VecDeque,
    sync::{Arc, Mutex, Weak},
};
use tokio::{
    sync::Notify,
    time::{self, Instant},
};
use tracing::{debug, trace};

#[derive(Clone, Copy, Debug)]
pub struct PoolConfig {
    pub max_size: usize,
    pub idle_timeout: Duration,
    pub dial_timeout: Duration,
    pub limits: Limits,
}

impl Default for PoolConfig {
    fn default() -> Self {
        Self {
            max_size: 8,
            idle_timeout: Duration::from_secs(60),
            dial_timeout: Duration::from_secs(10),
            limits: Limits::default(),
        }
    }
}

#[derive(Debug)]
struct Idle {
    conn: Connection,
    since: Instant,
}

#[derive(Debug)]
struct State {
    idle: VecDeque<Idle>,
    /// Live connections: idle plus borrowed
    total: usize,
    closed: bool,
}

#[derive(Debug)]
struct Inner {
    endpoint: Endpoint,
    config: PoolConfig,
    state: Mutex<State>,
    notify: Notify,
    dials: AtomicU64,
}

#[derive(Clone)]
pub struct ConnectionPool {
    inner: Arc<Inner>,
}

impl ConnectionPool {
    pub fn new(endpoint: Endpoint, config: PoolConfig) -> Self {
        let inner = Arc::new(Inner {
            endpoint,
            config,
            state: Mutex::new(State {
                idle: VecDeque::new(),
                total: 0,
                closed: false,
            }),
            notify: Notify::new(),
            dials: AtomicU64::new(0),
        });

        tokio::spawn(sweeper(Arc::downgrade(&inner)));

        Self { inner }
    }

    /// Number of dials performed over the pool's lifetime
    pub fn dial_count(&self) -> u64 {
        self.inner.dials.load(Ordering::Relaxed)
    }

    /// Connections currently idle in the pool
    pub fn idle_count(&self) -> usize {
        self.inner.state.lock().expect("pool lock").idle.len()
    }

    /// Borrows a connection, waiting up to `deadline` for one to free up
    pub async fn acquire(&self, deadline: Duration) -> Result<PooledConnection> {
        let deadline_at = Instant::now() + deadline;

        loop {
            enum Action {
                Dial,
                Wait,
            }

            let action = {
                let mut state = self.inner.state.lock().expect("pool lock");
                if state.closed {
                    return Err(Error::PoolClosed);
                }

                if let Some(idle) = state.idle.pop_front() {
                    trace!(endpoint = %self.inner.endpoint.host(), "reusing idle connection");
                    return Ok(PooledConnection {
                        conn: Some(idle.conn),
                        inner: self.inner.clone(),
                    });
                }

                if state.total < self.inner.config.max_size {
                    // reserve the slot before dialing so the bound holds
                    state.total += 1;
                    Action::Dial
                } else {
                    Action::Wait
                }
            };

            match action {
                Action::Dial => {
                    return match dial_stream_with(
                        &self.inner.endpoint,
                        self.inner.config.dial_timeout,
                        self.inner.config.limits,
                    )
                    .await
                    {
                        Ok(conn) => {
                            self.inner.dials.fetch_add(1, Ordering::Relaxed);
                            debug!(endpoint = %self.inner.endpoint.host(), "pool dialed connection");
                            Ok(PooledConnection {
                                conn: Some(conn),
                                inner: self.inner.clone(),
                            })
                        }
                        Err(err) => {
                            let mut state = self.inner.state.lock().expect("pool lock");
                            state.total -= 1;
                            drop(state);
                            self.inner.notify.notify_one();
                            Err(err)
                        }
                    };
                }
                Action::Wait => {
                    if time::timeout_at(deadline_at, self.inner.notify.notified())
                        .await
                        .is_err()
                    {
                        return Err(Error::PoolExhausted(deadline));
                    }
                }
            }
        }
    }

    /// Destroys every pooled connection. Waiters fail immediately; borrowed
    /// connections are destroyed when released.
    pub fn close_all(&self) {
        let mut state = self.inner.state.lock().expect("pool lock");
        state.closed = true;
        state.total -= state.idle.len();
        state.idle.clear();
        drop(state);

        self.inner.notify.notify_waiters();
        debug!(endpoint = %self.inner.endpoint.host(), "pool closed");
    }
}

/// A borrowed pooled connection.
///
/// Dropping the handle returns the connection to the pool as healthy; call
/// [`PooledConnection::release`] with `ok = false` after any protocol error.
#[derive(Debug)]
pub struct PooledConnection {
    conn: Option<Connection>,
    inner: Arc<Inner>,
}

impl PooledConnection {
    pub fn release(mut self, ok: bool) {
        self.put_back(ok);
    }

    fn put_back(&mut self, ok: bool) {
        let Some(conn) = self.conn.take() else { return };

        let mut state = self.inner.state.lock().expect("pool lock");
        if state.closed || !ok {
            state.total -= 1;
            drop(state);
            drop(conn);
        } else {
            state.idle.push_back(Idle {
                conn,
                since: Instant::now(),
            });
            drop(state);
        }

        self.inner.notify.notify_one();
    }
}

impl Deref for PooledConnection {
    type Target = Connection;

    fn deref(&self) -> &Self::Target {
        self.conn.as_ref().expect("connection already released")
    }
}

impl DerefMut for PooledConnection {
    fn deref_mut(&mut self) -> &mut Self::Target {
        self.conn.as_mut().expect("connection already released")
    }
}

impl Drop for PooledConnection {
    fn drop(&mut self) {
        self.put_back(true);
    }
}

/// Evicts connections that have been idle longer than the timeout. Holds
/// only a weak reference so dropping the last pool handle stops the task.
async fn sweeper(inner: Weak<Inner>) {
    let period = {
        let Some(inner) = inner.upgrade() else { return };
        (inner.config.idle_timeout / 2).max(Duration::from_millis(50))
    };

    loop {
        time::sleep(period).await;

        let Some(inner) = inner.upgrade() else { return };

        let evicted = {
            let mut state = inner.state.lock().expect("pool lock");
            if state.closed {
                return;
            }

            let before = state.idle.len();
            let idle_timeout = inner.config.idle_timeout;
            state.idle.retain(|idle| idle.since.elapsed() < idle_timeout);
            let evicted = before - state.idle.len();
            state.total -= evicted;
            evicted
        };

        if evicted > 0 {
            debug!(evicted, "closed idle pooled connections");
            inner.notify.notify_waiters();
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::shutdown::Controller;
    use crate::transport::StreamServer;
    use std::net::SocketAddr;

    async fn echo_server() -> (Endpoint, Controller) {
        let server = StreamServer::bind(&Endpoint::stream("127.0.0.1", 0))
            .await
            .unwrap();
        let endpoint = Endpoint::stream("127.0.0.1", server.local_addr().port());

        let controller = Controller::new();
        let mut signal = controller.subscribe();
        tokio::spawn(server.serve(
            |mut conn: Connection, _remote: SocketAddr, _shutdown| async move {
                while let Ok(frame) = conn.read_frame().await {
                    conn.write_frame(&frame).await?;
                }
                Ok(())
            },
            async move { signal.recv().await },
        ));

        (endpoint, controller)
    }

    fn small_pool(endpoint: Endpoint) -> ConnectionPool {
        ConnectionPool::new(
            endpoint,
            PoolConfig {
                max_size: 2,
                idle_timeout: Duration::from_secs(1),
                ..Default::default()
            },
        )
    }

    #[tokio::test]
    async fn bound_reuse_and_eviction() {
        let (endpoint, _controller) = echo_server().await;
        let pool = small_pool(endpoint);

        let a = pool.acquire(Duration::from_secs(1)).await.unwrap();
        let b = pool.acquire(Duration::from_secs(1)).await.unwrap();
        assert_eq!(pool.dial_count(), 2);

        // at the bound: a third acquire times out
        let err = pool.acquire(Duration::from_millis(100)).await.unwrap_err();
        assert!(matches!(err, Error::PoolExhausted(_)));

        // releasing one lets the third succeed without a new dial
        a.release(true);
        let c = pool.acquire(Duration::from_millis(500)).await.unwrap();
        assert_eq!(pool.dial_count(), 2);

        c.release(true);
        b.release(true);

        // idle longer than idle_timeout: the sweeper closes both
        time::sleep(Duration::from_secs(2)).await;
        assert_eq!(pool.idle_count(), 0);

        // next acquire re-dials
        let _d = pool.acquire(Duration::from_secs(1)).await.unwrap();
        assert_eq!(pool.dial_count(), 3);
    }

    #[tokio::test]
    async fn released_connection_still_works() {
        let (endpoint, _controller) = echo_server().await;
        let pool = small_pool(endpoint);

        {
            let mut conn = pool.acquire(Duration::from_secs(1)).await.unwrap();
            conn.write_frame(b"first").await.unwrap();
            assert_eq!(&conn.read_frame().await.unwrap()[..], b"first");
        }

        let mut conn = pool.acquire(Duration::from_secs(1)).await.unwrap();
        conn.write_frame(b"second").await.unwrap();
        assert_eq!(&conn.read_frame().await.unwrap()[..], b"second");
        assert_eq!(pool.dial_count(), 1);
    }

    #[tokio::test]
    async fn release_not_ok_destroys() {
        let (endpoint, _controller) = echo_server().await;
        let pool = small_pool(endpoint);

        let conn = pool.acquire(Duration::from_secs(1)).await.unwrap();
        conn.release(false);
        assert_eq!(pool.idle_count(), 0);

        let _conn = pool.acquire(Duration::from_secs(1)).await.unwrap();
        assert_eq!(pool.dial_count(), 2);
    }

    #[tokio::test]
    async fn close_all_rejects_acquire_and_cancels_waiters() {
        let (endpoint, _controller) = echo_server().await;
        let pool = small_pool(endpoint);

        let borrowed = pool.acquire(Duration::from_secs(1)).await.unwrap();
        let _borrowed2 = pool.acquire(Duration::from_secs(1)).await.unwrap();

        let waiter = {
            let pool = pool.clone();
            tokio::spawn(async move { pool.acquire(Duration::from_secs(30)).await })
        };

        time::sleep(Duration::from_millis(50)).await;
        pool.close_all();

        assert!(matches!(waiter.await.unwrap(), Err(Error::PoolClosed)));
        assert!(matches!(
            pool.acquire(Duration::from_secs(1)).await,
            Err(Error::PoolClosed)
        ));

        // a borrowed connection released after close is destroyed
        borrowed.release(true);
        assert_eq!(pool.idle_count(), 0);
    }
}
