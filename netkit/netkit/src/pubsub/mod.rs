// Copyright Amazon.com, Inc. or its affiliates. All Rights Reserved.
// SPDX-License-Identifier: Apache-2.0

//! Publish/subscribe broker.
//!
//! Topics are `/`-separated paths; subscriptions are patterns with `*`
//! (one segment) and terminal `**` (the rest). Routing is a trie behind a
//! readers/writers lock: publishes read, subscription changes write. Each
//! subscriber owns a bounded queue drained by a single writer task, so a
//! slow subscriber only ever hurts itself.

use crate::{
    endpoint::Endpoint,
    queue::{PushOutcome, SendQueue},
    shutdown::Shutdown,
    transport::{dial_stream, Connection, FramedReader, ServerConfig, StreamServer},
    Error, Result,
};
use bytes::Bytes;
use core::{
    sync::atomic::{AtomicU64, Ordering},
    time::Duration,
};
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};
use std::{
    collections::{HashMap, HashSet},
    net::SocketAddr,
    sync::{Arc, Mutex, RwLock},
};
use tracing::{debug, warn};

pub mod persistence;
pub mod trie;

pub use crate::queue::OverflowPolicy;
pub use persistence::{NoopPersistence, PersistenceAdapter};
pub use trie::{pattern_matches, PatternError, SubscriberId, TopicTrie};

/// Default bound on a subscriber's outbound queue
pub const DEFAULT_QUEUE_CAPACITY: usize = 1024;

#[derive(Debug, Deserialize, Serialize)]
#[serde(tag = "action", rename_all = "snake_case")]
enum Request {
    Subscribe {
        topic: String,
    },
    Unsubscribe {
        topic: String,
    },
    Publish {
        topic: String,
        message: Value,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        metadata: Option<Map<String, Value>>,
    },
}

/// A message as delivered to a subscriber
#[derive(Clone, Debug, Deserialize, Serialize, PartialEq)]
pub struct Delivery {
    pub topic: String,
    pub message: Value,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub metadata: Option<Map<String, Value>>,
}

/// A published message as seen by the broker and its persistence adapter
#[derive(Clone, Debug, Deserialize, Serialize)]
pub struct BrokerMessage {
    pub topic: String,
    pub message: Value,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub metadata: Option<Map<String, Value>>,
    pub publisher: SubscriberId,
    pub sequence: u64,
}

#[derive(Clone, Copy, Debug)]
pub struct BrokerConfig {
    pub queue_capacity: usize,
    pub overflow: OverflowPolicy,
    pub server: ServerConfig,
}

impl Default for BrokerConfig {
    fn default() -> Self {
        Self {
            queue_capacity: DEFAULT_QUEUE_CAPACITY,
            overflow: OverflowPolicy::DropOldest,
            server: ServerConfig::default(),
        }
    }
}

#[derive(Debug, Default)]
struct Metrics {
    published: AtomicU64,
    delivered: AtomicU64,
    dropped: AtomicU64,
    overflow_disconnects: AtomicU64,
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct MetricsSnapshot {
    pub published: u64,
    pub delivered: u64,
    pub dropped: u64,
    pub overflow_disconnects: u64,
}

struct Subscriber {
    id: SubscriberId,
    queue: SendQueue<Bytes>,
    patterns: Mutex<HashSet<String>>,
}

struct State {
    trie: RwLock<TopicTrie>,
    subscribers: RwLock<HashMap<SubscriberId, Arc<Subscriber>>>,
    sequence: AtomicU64,
    metrics: Metrics,
    persistence: Box<dyn PersistenceAdapter>,
    config: BrokerConfig,
}

pub struct Broker {
    server: StreamServer,
    state: Arc<State>,
}

impl Broker {
    pub async fn bind(endpoint: &Endpoint) -> Result<Self> {
        Self::bind_with(endpoint, BrokerConfig::default(), Box::new(NoopPersistence)).await
    }

    pub async fn bind_with(
        endpoint: &Endpoint,
        config: BrokerConfig,
        persistence: Box<dyn PersistenceAdapter>,
    ) -> Result<Self> {
        let server = StreamServer::bind_with(endpoint, config.server).await?;
        Ok(Self {
            server,
            state: Arc::new(State {
                trie: RwLock::new(TopicTrie::default()),
                subscribers: RwLock::new(HashMap::new()),
                sequence: AtomicU64::new(0),
                metrics: Metrics::default(),
                persistence,
                config,
            }),
        })
    }

    pub fn local_addr(&self) -> SocketAddr {
        self.server.local_addr()
    }

    pub fn metrics(&self) -> MetricsSnapshot {
        self.state.metrics()
    }

    /// Metrics handle that stays usable while the broker is serving
    pub fn metrics_handle(&self) -> MetricsHandle {
        MetricsHandle {
            state: self.state.clone(),
        }
    }

    pub async fn serve(self, signal: impl core::future::Future<Output = ()>) -> Result<()> {
        let state = self.state;
        self.server
            .serve(
                move |conn, remote, shutdown| {
                    handle_subscriber(state.clone(), conn, remote, shutdown)
                },
                signal,
            )
            .await
    }
}

/// Cloneable view of the broker's counters
#[derive(Clone)]
pub struct MetricsHandle {
    state: Arc<State>,
}

impl MetricsHandle {
    pub fn snapshot(&self) -> MetricsSnapshot {
        self.state.metrics()
    }
}

impl State {
    fn metrics(&self) -> MetricsSnapshot {
        MetricsSnapshot {
            published: self.metrics.published.load(Ordering::Relaxed),
            delivered: self.metrics.delivered.load(Ordering::Relaxed),
            dropped: self.metrics.dropped.load(Ordering::Relaxed),
            overflow_disconnects: self.metrics.overflow_disconnects.load(Ordering::Relaxed),
        }
    }

    fn publish(
        &self,
        publisher: SubscriberId,
        topic: String,
        message: Value,
        metadata: Option<Map<String, Value>>,
    ) {
        let sequence = self.sequence.fetch_add(1, Ordering::Relaxed);
        let record = BrokerMessage {
            topic,
            message,
            metadata,
            publisher,
            sequence,
        };
        self.persistence.record(&record);
        self.metrics.published.fetch_add(1, Ordering::Relaxed);

        let delivery = Delivery {
            topic: record.topic,
            message: record.message,
            metadata: record.metadata,
        };
        let frame: Bytes = match serde_json::to_vec(&delivery) {
            Ok(frame) => frame.into(),
            Err(error) => {
                warn!(%error, topic = %delivery.topic, "undeliverable message");
                return;
            }
        };

        let matched = {
            let trie = self.trie.read().expect("trie lock");
            trie.matches(&delivery.topic)
        };

        // clone the handles out so no registry lock is held while enqueuing
        let targets: Vec<Arc<Subscriber>> = {
            let subscribers = self.subscribers.read().expect("subscriber registry lock");
            matched
                .iter()
                .filter_map(|id| subscribers.get(id).cloned())
                .collect()
        };

        for target in targets {
            match target.queue.push(frame.clone()) {
                PushOutcome::Pushed => {
                    self.metrics.delivered.fetch_add(1, Ordering::Relaxed);
                }
                PushOutcome::DroppedOldest => {
                    self.metrics.delivered.fetch_add(1, Ordering::Relaxed);
                    self.metrics.dropped.fetch_add(1, Ordering::Relaxed);
                    debug!(subscriber = target.id, topic = %delivery.topic, "queue full, dropped oldest");
                }
                PushOutcome::Overflowed => {
                    self.metrics
                        .overflow_disconnects
                        .fetch_add(1, Ordering::Relaxed);
                    debug!(subscriber = target.id, "queue overflow, disconnecting subscriber");
                }
                PushOutcome::Closed => {}
            }
        }
    }
}

async fn handle_subscriber(
    state: Arc<State>,
    conn: Connection,
    remote: SocketAddr,
    mut shutdown: Shutdown,
) -> Result<()> {
    let id = conn.id();
    let (mut reader, mut writer) = conn.split();

    let subscriber = Arc::new(Subscriber {
        id,
        queue: SendQueue::new(state.config.queue_capacity, state.config.overflow),
        patterns: Mutex::new(HashSet::new()),
    });

    state
        .subscribers
        .write()
        .expect("subscriber registry lock")
        .insert(id, subscriber.clone());

    let writer_task = {
        let subscriber = subscriber.clone();
        tokio::spawn(async move {
            while let Some(frame) = subscriber.queue.next().await {
                if writer.write_frame(&frame).await.is_err() {
                    break;
                }
            }
            subscriber.queue.close();
            let _ = writer.shutdown().await;
        })
    };

    let result = run_subscriber(&state, &mut reader, &subscriber, &mut shutdown).await;

    // tear down: registry entry, trie entries, queue, writer
    state
        .subscribers
        .write()
        .expect("subscriber registry lock")
        .remove(&id);

    let patterns: Vec<String> = subscriber
        .patterns
        .lock()
        .expect("pattern set lock")
        .drain()
        .collect();
    {
        let mut trie = state.trie.write().expect("trie lock");
        for pattern in &patterns {
            trie.unsubscribe(id, pattern);
        }
    }

    subscriber.queue.close();
    let _ = writer_task.await;

    debug!(subscriber = id, remote = %remote, "subscriber removed");
    result
}

async fn run_subscriber(
    state: &State,
    reader: &mut FramedReader,
    subscriber: &Subscriber,
    shutdown: &mut Shutdown,
) -> Result<()> {
    let id = subscriber.id;

    loop {
        tokio::select! {
            request = reader.read_json::<Request>() => {
                match request {
                    Ok(Request::Subscribe { topic }) => {
                        let outcome = state.trie.write().expect("trie lock").subscribe(id, &topic);
                        match outcome {
                            Ok(()) => {
                                subscriber
                                    .patterns
                                    .lock()
                                    .expect("pattern set lock")
                                    .insert(topic);
                            }
                            Err(error) => {
                                let frame = serde_json::to_vec(
                                    &serde_json::json!({ "error": error.to_string() }),
                                )?;
                                subscriber.queue.push(frame.into());
                                return Err(Error::Protocol(error.to_string()));
                            }
                        }
                    }
                    Ok(Request::Unsubscribe { topic }) => {
                        if state.trie.write().expect("trie lock").unsubscribe(id, &topic) {
                            subscriber
                                .patterns
                                .lock()
                                .expect("pattern set lock")
                                .remove(&topic);
                        }
                    }
                    Ok(Request::Publish { topic, message, metadata }) => {
                        state.publish(id, topic, message, metadata);
                    }
                    Err(Error::ClosedByPeer) => return Ok(()),
                    Err(err) => return Err(err),
                }
            }
            // overflow disconnect or a failed writer closes the queue
            _ = subscriber.queue.wait_closed() => return Ok(()),
            _ = shutdown.recv() => return Ok(()),
        }
    }
}

/// Client side of the broker protocol
pub struct Client {
    conn: Connection,
}

impl Client {
    pub async fn connect(endpoint: &Endpoint, deadline: Duration) -> Result<Self> {
        Ok(Self {
            conn: dial_stream(endpoint, deadline).await?,
        })
    }

    pub async fn subscribe(&mut self, pattern: &str) -> Result<()> {
        self.conn
            .write_json(&Request::Subscribe {
                topic: pattern.into(),
            })
            .await
    }

    pub async fn unsubscribe(&mut self, pattern: &str) -> Result<()> {
        self.conn
            .write_json(&Request::Unsubscribe {
                topic: pattern.into(),
            })
            .await
    }

    pub async fn publish(&mut self, topic: &str, message: Value) -> Result<()> {
        self.publish_with(topic, message, None).await
    }

    pub async fn publish_with(
        &mut self,
        topic: &str,
        message: Value,
        metadata: Option<Map<String, Value>>,
    ) -> Result<()> {
        self.conn
            .write_json(&Request::Publish {
                topic: topic.into(),
                message,
                metadata,
            })
            .await
    }

    pub async fn receive(&mut self) -> Result<Delivery> {
        self.conn.read_json().await
    }

    pub async fn receive_timeout(&mut self, deadline: Duration) -> Result<Delivery> {
        let frame = self.conn.read_frame_timeout(deadline).await?;
        Ok(serde_json::from_slice(&frame)?)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn unknown_action_is_rejected() {
        let request = serde_json::from_str::<Request>(r#"{"action":"drop_tables"}"#);
        assert!(request.is_err());
    }

    #[test]
    fn wire_shapes() {
        let publish: Request = serde_json::from_str(
            r#"{"action":"publish","topic":"news/sports","message":"goal"}"#,
        )
        .unwrap();
        assert!(matches!(
            publish,
            Request::Publish { ref topic, .. } if topic == "news/sports"
        ));

        let delivery = Delivery {
            topic: "news/sports".into(),
            message: Value::String("goal".into()),
            metadata: None,
        };
        let json = serde_json::to_value(&delivery).unwrap();
        assert_eq!(json, serde_json::json!({"topic":"news/sports","message":"goal"}));
    }
}
