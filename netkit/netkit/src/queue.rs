// Copyright Amazon.com, Inc. or its affiliates. All Rights Reserved.
// SPDX-License-Identifier: Apache-2.0

//! Bounded per-peer send queues.
//!
//! Every fan-out service gives each peer one of these; a single writer task
//! drains it to the connection. A slow reader therefore costs itself dropped
//! items (or its connection, under [`OverflowPolicy::Disconnect`]) and never
//! stalls the producer.

use std::{
    collections::VecDeque,
    sync::Mutex,
};
use tokio::sync::Notify;

#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub enum OverflowPolicy {
    /// Drop the oldest queued item to make room
    #[default]
    DropOldest,
    /// Close the queue; the owning connection is torn down
    Disconnect,
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum PushOutcome {
    Pushed,
    DroppedOldest,
    Overflowed,
    Closed,
}

#[derive(Debug)]
struct State<T> {
    items: VecDeque<T>,
    dropped: u64,
    closed: bool,
}

#[derive(Debug)]
pub struct SendQueue<T> {
    state: Mutex<State<T>>,
    capacity: usize,
    policy: OverflowPolicy,
    ready: Notify,
    closed: Notify,
}

impl<T> SendQueue<T> {
    pub fn new(capacity: usize, policy: OverflowPolicy) -> Self {
        Self {
            state: Mutex::new(State {
                items: VecDeque::with_capacity(capacity.min(64)),
                dropped: 0,
                closed: false,
            }),
            capacity,
            policy,
            ready: Notify::new(),
            closed: Notify::new(),
        }
    }

    pub fn push(&self, item: T) -> PushOutcome {
        let outcome = {
            let mut state = self.state.lock().expect("queue lock");
            if state.closed {
                return PushOutcome::Closed;
            }

            if state.items.len() >= self.capacity {
                match self.policy {
                    OverflowPolicy::DropOldest => {
                        state.items.pop_front();
                        state.dropped += 1;
                        state.items.push_back(item);
                        PushOutcome::DroppedOldest
                    }
                    OverflowPolicy::Disconnect => {
                        state.closed = true;
                        PushOutcome::Overflowed
                    }
                }
            } else {
                state.items.push_back(item);
                PushOutcome::Pushed
            }
        };

        match outcome {
            PushOutcome::Overflowed => self.closed.notify_waiters(),
            _ => self.ready.notify_one(),
        }
        outcome
    }

    /// Next item in FIFO order; `None` once the queue is closed and drained
    pub async fn next(&self) -> Option<T> {
        loop {
            {
                let mut state = self.state.lock().expect("queue lock");
                if let Some(item) = state.items.pop_front() {
                    return Some(item);
                }
                if state.closed {
                    return None;
                }
            }
            self.ready.notified().await;
        }
    }

    /// Resolves once the queue has been closed
    pub async fn wait_closed(&self) {
        loop {
            {
                let state = self.state.lock().expect("queue lock");
                if state.closed {
                    return;
                }
            }
            self.closed.notified().await;
        }
    }

    pub fn close(&self) {
        {
            let mut state = self.state.lock().expect("queue lock");
            state.closed = true;
        }
        self.ready.notify_one();
        self.closed.notify_waiters();
    }

    pub fn is_closed(&self) -> bool {
        self.state.lock().expect("queue lock").closed
    }

    /// Items discarded under the drop-oldest policy
    pub fn dropped(&self) -> u64 {
        self.state.lock().expect("queue lock").dropped
    }

    pub fn len(&self) -> usize {
        self.state.lock().expect("queue lock").items.len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}
