// Copyright Amazon.com, Inc. or its affiliates. All Rights Reserved.
// SPDX-License-Identifier: Apache-2.0

//! Media feed seams.
//!
//! Capture and codec integration stay outside the toolkit: a feed hands the
//! server opaque, already-encoded packets. Each client session subscribes
//! for its own stream so per-client quality and pacing stay independent.

use futures::future::BoxFuture;
use netkit_codec::live::{AudioPacket, VideoPacket};
use std::sync::Arc;
use tokio::sync::broadcast;

pub trait VideoFeed: Send + Sync + 'static {
    fn subscribe(&self) -> Box<dyn VideoStream>;
}

/// Per-client video stream. `quality` is the session's current encoding
/// parameter; adapters that re-encode per client honor it, pass-through
/// adapters ignore it. `None` ends the stream.
pub trait VideoStream: Send + 'static {
    fn next_frame(&mut self, quality: u8) -> BoxFuture<'_, Option<VideoPacket>>;
}

pub trait AudioFeed: Send + Sync + 'static {
    fn subscribe(&self) -> Box<dyn AudioStream>;
}

pub trait AudioStream: Send + 'static {
    fn next_chunk(&mut self) -> BoxFuture<'_, Option<AudioPacket>>;
}

/// Fans one capture loop out to any number of client sessions. Pre-encoded
/// packets pass through unchanged; a lagging subscriber skips ahead rather
/// than stalling the capture side.
pub struct BroadcastVideoFeed {
    sender: broadcast::Sender<VideoPacket>,
}

impl BroadcastVideoFeed {
    /// Returns the feed and the capture-side sender
    pub fn new(depth: usize) -> (Self, broadcast::Sender<VideoPacket>) {
        let (sender, _) = broadcast::channel(depth.max(1));
        (
            Self {
                sender: sender.clone(),
            },
            sender,
        )
    }
}

impl VideoFeed for BroadcastVideoFeed {
    fn subscribe(&self) -> Box<dyn VideoStream> {
        Box::new(BroadcastVideoStream {
            receiver: self.sender.subscribe(),
        })
    }
}

struct BroadcastVideoStream {
    receiver: broadcast::Receiver<VideoPacket>,
}

impl VideoStream for BroadcastVideoStream {
    fn next_frame(&mut self, _quality: u8) -> BoxFuture<'_, Option<VideoPacket>> {
        Box::pin(async move {
            loop {
                match self.receiver.recv().await {
                    Ok(packet) => return Some(packet),
                    Err(broadcast::error::RecvError::Closed) => return None,
                    // lagged behind the capture loop: skip to live
                    Err(broadcast::error::RecvError::Lagged(_)) => continue,
                }
            }
        })
    }
}

/// Broadcast counterpart for audio
pub struct BroadcastAudioFeed {
    sender: broadcast::Sender<AudioPacket>,
}

impl BroadcastAudioFeed {
    pub fn new(depth: usize) -> (Self, broadcast::Sender<AudioPacket>) {
        let (sender, _) = broadcast::channel(depth.max(1));
        (
            Self {
                sender: sender.clone(),
            },
            sender,
        )
    }
}

impl AudioFeed for BroadcastAudioFeed {
    fn subscribe(&self) -> Box<dyn AudioStream> {
        Box::new(BroadcastAudioStream {
            receiver: self.sender.subscribe(),
        })
    }
}

struct BroadcastAudioStream {
    receiver: broadcast::Receiver<AudioPacket>,
}

impl AudioStream for BroadcastAudioStream {
    fn next_chunk(&mut self) -> BoxFuture<'_, Option<AudioPacket>> {
        Box::pin(async move {
            loop {
                match self.receiver.recv().await {
                    Ok(packet) => return Some(packet),
                    Err(broadcast::error::RecvError::Closed) => return None,
                    Err(broadcast::error::RecvError::Lagged(_)) => continue,
                }
            }
        })
    }
}

/// A source as published in the catalog: an id, a display name and its
/// media feeds
pub struct MediaSource {
    id: String,
    name: String,
    video: Arc<dyn VideoFeed>,
    audio: Option<Arc<dyn AudioFeed>>,
}

impl MediaSource {
    pub fn new(id: impl Into<String>, name: impl Into<String>, video: Arc<dyn VideoFeed>) -> Self {
        Self {
            id: id.into(),
            name: name.into(),
            video,
            audio: None,
        }
    }

    pub fn with_audio(mut self, audio: Arc<dyn AudioFeed>) -> Self {
        self.audio = Some(audio);
        self
    }

    pub fn id(&self) -> &str {
        &self.id
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub(crate) fn video(&self) -> &Arc<dyn VideoFeed> {
        &self.video
    }

    pub(crate) fn audio(&self) -> Option<&Arc<dyn AudioFeed>> {
        self.audio.as_ref()
    }
}
