// Copyright Amazon.com, Inc. or its affiliates. All Rights Reserved.
// SPDX-License-Identifier: Apache-2.0

//! Multi-room conferencing.
//!
//! Three listeners (video, audio, text); a member joins each with a
//! `{room, nickname, channel}` frame. Media frames are rebroadcast to every
//! other member of the room through per-member bounded queues; text echoes
//! to everyone including the sender. In-band `/` commands gate a member's
//! own rebroadcast. Any one connection closing removes the member entirely.

use crate::{
    endpoint::Endpoint,
    queue::{OverflowPolicy, PushOutcome, SendQueue},
    shutdown::Shutdown,
    transport::{dial_stream, Connection, FramedReader, ServerConfig, StreamServer},
    Error, Result,
};
use bytes::Bytes;
use core::{
    future::Future,
    sync::atomic::{AtomicBool, Ordering},
    time::Duration,
};
use serde::{Deserialize, Serialize};
use std::{
    collections::HashMap,
    net::SocketAddr,
    sync::{Arc, Mutex},
};
use tokio::sync::watch;
use tracing::{debug, info, warn};

/// Default per-member video queue bound, in frames
pub const DEFAULT_VIDEO_QUEUE: usize = 30;
/// Default per-member audio queue bound, in chunks
pub const DEFAULT_AUDIO_QUEUE: usize = 25;
/// Default per-member text queue bound
pub const DEFAULT_TEXT_QUEUE: usize = 64;

#[derive(Clone, Copy, Debug)]
pub struct ConferenceConfig {
    pub video_queue_len: usize,
    pub audio_queue_len: usize,
    pub text_queue_len: usize,
    pub server: ServerConfig,
}

impl Default for ConferenceConfig {
    fn default() -> Self {
        Self {
            video_queue_len: DEFAULT_VIDEO_QUEUE,
            audio_queue_len: DEFAULT_AUDIO_QUEUE,
            text_queue_len: DEFAULT_TEXT_QUEUE,
            server: ServerConfig::default(),
        }
    }
}

#[derive(Clone, Copy, Debug, Deserialize, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum Channel {
    Video,
    Audio,
    Text,
}

#[derive(Debug, Deserialize, Serialize)]
struct Join {
    room: String,
    nickname: String,
    channel: Channel,
}

/// A text frame as it crosses the wire
#[derive(Clone, Debug, Deserialize, Serialize, PartialEq)]
pub struct TextMessage {
    pub from: String,
    pub text: String,
    pub ts: f64,
}

impl TextMessage {
    pub fn new(from: impl Into<String>, text: impl Into<String>) -> Self {
        Self {
            from: from.into(),
            text: text.into(),
            ts: unix_now(),
        }
    }

    fn system(text: impl Into<String>) -> Self {
        Self::new("system", text)
    }
}

fn unix_now() -> f64 {
    std::time::SystemTime::now()
        .duration_since(std::time::UNIX_EPOCH)
        .map(|elapsed| elapsed.as_secs_f64())
        .unwrap_or_default()
}

struct Member {
    nickname: String,
    video: SendQueue<Bytes>,
    audio: SendQueue<Bytes>,
    text: SendQueue<Bytes>,
    muted: AtomicBool,
    video_off: AtomicBool,
    /// Channels that have joined so far; duplicates are refused
    attached: Mutex<Vec<Channel>>,
    removed: AtomicBool,
    closed: watch::Sender<bool>,
}

impl Member {
    fn new(nickname: String, config: &ConferenceConfig) -> Self {
        let (closed, _) = watch::channel(false);
        Self {
            nickname,
            video: SendQueue::new(config.video_queue_len, OverflowPolicy::DropOldest),
            audio: SendQueue::new(config.audio_queue_len, OverflowPolicy::DropOldest),
            text: SendQueue::new(config.text_queue_len, OverflowPolicy::DropOldest),
            muted: AtomicBool::new(false),
            video_off: AtomicBool::new(false),
            attached: Mutex::new(Vec::new()),
            removed: AtomicBool::new(false),
            closed,
        }
    }

    fn queue(&self, channel: Channel) -> &SendQueue<Bytes> {
        match channel {
            Channel::Video => &self.video,
            Channel::Audio => &self.audio,
            Channel::Text => &self.text,
        }
    }

    fn close(&self) {
        self.video.close();
        self.audio.close();
        self.text.close();
        let _ = self.closed.send(true);
    }
}

struct Room {
    name: String,
    members: Mutex<HashMap<String, Arc<Member>>>,
}

impl Room {
    /// All members except (optionally) one nickname
    fn peers(&self, except: Option<&str>) -> Vec<Arc<Member>> {
        self.members
            .lock()
            .expect("room lock")
            .iter()
            .filter(|(nickname, _)| Some(nickname.as_str()) != except)
            .map(|(_, member)| member.clone())
            .collect()
    }

    fn broadcast_text(&self, message: &TextMessage, except: Option<&str>) {
        let Ok(frame) = serde_json::to_vec(message) else {
            return;
        };
        let frame = Bytes::from(frame);
        for member in self.peers(except) {
            member.text.push(frame.clone());
        }
    }
}

struct ConfState {
    rooms: Mutex<HashMap<String, Arc<Room>>>,
    config: ConferenceConfig,
}

impl ConfState {
    fn room(&self, name: &str) -> Arc<Room> {
        let mut rooms = self.rooms.lock().expect("rooms lock");
        rooms
            .entry(name.to_owned())
            .or_insert_with(|| {
                info!(room = %name, "room created");
                Arc::new(Room {
                    name: name.to_owned(),
                    members: Mutex::new(HashMap::new()),
                })
            })
            .clone()
    }

    /// Removes the member once; empty rooms are destroyed
    fn remove_member(&self, room: &Arc<Room>, member: &Arc<Member>) {
        if member.removed.swap(true, Ordering::SeqCst) {
            return;
        }

        let emptied = {
            let mut members = room.members.lock().expect("room lock");
            members.remove(&member.nickname);
            members.is_empty()
        };

        member.close();
        room.broadcast_text(
            &TextMessage::system(format!("{} left the room", member.nickname)),
            None,
        );
        info!(room = %room.name, member = %member.nickname, "member removed");

        if emptied {
            self.rooms.lock().expect("rooms lock").remove(&room.name);
            info!(room = %room.name, "room destroyed");
        }
    }
}

pub struct ConferenceServer {
    video: StreamServer,
    audio: StreamServer,
    text: StreamServer,
    state: Arc<ConfState>,
}

impl ConferenceServer {
    pub async fn bind(
        video: &Endpoint,
        audio: &Endpoint,
        text: &Endpoint,
        config: ConferenceConfig,
    ) -> Result<Self> {
        Ok(Self {
            video: StreamServer::bind_with(video, config.server).await?,
            audio: StreamServer::bind_with(audio, config.server).await?,
            text: StreamServer::bind_with(text, config.server).await?,
            state: Arc::new(ConfState {
                rooms: Mutex::new(HashMap::new()),
                config,
            }),
        })
    }

    pub fn video_addr(&self) -> SocketAddr {
        self.video.local_addr()
    }

    pub fn audio_addr(&self) -> SocketAddr {
        self.audio.local_addr()
    }

    pub fn text_addr(&self) -> SocketAddr {
        self.text.local_addr()
    }

    pub async fn serve(self, signal: impl Future<Output = ()> + Send + 'static) -> Result<()> {
        let (stop_tx, stop_rx) = watch::channel(false);

        let stopper = async move {
            signal.await;
            let _ = stop_tx.send(true);
            Ok::<(), Error>(())
        };

        let video = {
            let state = self.state.clone();
            self.video.serve(
                move |conn, remote, shutdown| {
                    handle_channel(state.clone(), Channel::Video, conn, remote, shutdown)
                },
                stopped(stop_rx.clone()),
            )
        };
        let audio = {
            let state = self.state.clone();
            self.audio.serve(
                move |conn, remote, shutdown| {
                    handle_channel(state.clone(), Channel::Audio, conn, remote, shutdown)
                },
                stopped(stop_rx.clone()),
            )
        };
        let text = {
            let state = self.state.clone();
            self.text.serve(
                move |conn, remote, shutdown| {
                    handle_channel(state.clone(), Channel::Text, conn, remote, shutdown)
                },
                stopped(stop_rx),
            )
        };

        tokio::try_join!(video, audio, text, stopper)?;
        info!("conference server stopped");
        Ok(())
    }
}

async fn stopped(mut rx: watch::Receiver<bool>) {
    loop {
        if *rx.borrow() {
            return;
        }
        if rx.changed().await.is_err() {
            return;
        }
    }
}

async fn handle_channel(
    state: Arc<ConfState>,
    channel: Channel,
    conn: Connection,
    remote: SocketAddr,
    mut shutdown: Shutdown,
) -> Result<()> {
    let (mut reader, mut writer) = conn.split();

    let join: Join = reader.read_json().await?;
    if join.channel != channel {
        return Err(Error::Protocol(format!(
            "{:?} join frame arrived on the {channel:?} listener",
            join.channel
        )));
    }

    let room = state.room(&join.room);
    let member = {
        let mut members = room.members.lock().expect("room lock");
        members
            .entry(join.nickname.clone())
            .or_insert_with(|| Arc::new(Member::new(join.nickname.clone(), &state.config)))
            .clone()
    };

    {
        let mut attached = member.attached.lock().expect("member lock");
        if attached.contains(&channel) {
            return Err(Error::Protocol(format!(
                "{} already has a {channel:?} connection",
                join.nickname
            )));
        }
        attached.push(channel);
    }

    debug!(room = %join.room, member = %join.nickname, channel = ?channel, remote = %remote, "channel joined");

    if channel == Channel::Text {
        room.broadcast_text(
            &TextMessage::system(format!("{} joined the room", join.nickname)),
            Some(&join.nickname),
        );
    }

    // single writer per connection: this task drains the member's queue
    let writer_task = {
        let member = member.clone();
        tokio::spawn(async move {
            while let Some(frame) = member.queue(channel).next().await {
                if writer.write_frame(&frame).await.is_err() {
                    break;
                }
            }
            let _ = writer.shutdown().await;
        })
    };

    let result = run_channel(&room, &member, channel, &mut reader, &mut shutdown).await;

    // one connection going away removes the whole member
    state.remove_member(&room, &member);
    let _ = writer_task.await;

    result
}

async fn run_channel(
    room: &Arc<Room>,
    member: &Arc<Member>,
    channel: Channel,
    reader: &mut FramedReader,
    shutdown: &mut Shutdown,
) -> Result<()> {
    let mut closed_rx = member.closed.subscribe();

    loop {
        enum Event {
            Frame(Result<Bytes>),
            Done,
        }

        let event = tokio::select! {
            frame = reader.read_frame() => Event::Frame(frame),
            _ = shutdown.recv() => Event::Done,
            _ = closed(&mut closed_rx) => Event::Done,
        };

        let frame = match event {
            Event::Frame(Ok(frame)) => frame,
            Event::Frame(Err(Error::ClosedByPeer)) => return Ok(()),
            Event::Frame(Err(err)) => return Err(err),
            Event::Done => return Ok(()),
        };

        match channel {
            Channel::Video => {
                if !member.video_off.load(Ordering::Relaxed) {
                    rebroadcast(room, member, Channel::Video, frame);
                }
            }
            Channel::Audio => {
                if !member.muted.load(Ordering::Relaxed) {
                    rebroadcast(room, member, Channel::Audio, frame);
                }
            }
            Channel::Text => {
                let message: TextMessage = serde_json::from_slice(&frame)?;
                if let Some(command) = message.text.strip_prefix('/') {
                    apply_command(room, member, command);
                } else {
                    // text echoes to the whole room, sender included
                    room.broadcast_text(&message, None);
                }
            }
        }
    }
}

async fn closed(rx: &mut watch::Receiver<bool>) {
    loop {
        if *rx.borrow() {
            return;
        }
        if rx.changed().await.is_err() {
            return;
        }
    }
}

fn rebroadcast(room: &Arc<Room>, sender: &Arc<Member>, channel: Channel, frame: Bytes) {
    for peer in room.peers(Some(&sender.nickname)) {
        if peer.queue(channel).push(frame.clone()) == PushOutcome::DroppedOldest {
            debug!(member = %peer.nickname, channel = ?channel, "queue full, dropped oldest");
        }
    }
}

fn apply_command(room: &Arc<Room>, member: &Arc<Member>, command: &str) {
    let announcement = match command {
        "mute" => {
            member.muted.store(true, Ordering::Relaxed);
            format!("{} muted their microphone", member.nickname)
        }
        "unmute" => {
            member.muted.store(false, Ordering::Relaxed);
            format!("{} unmuted their microphone", member.nickname)
        }
        "video_off" => {
            member.video_off.store(true, Ordering::Relaxed);
            format!("{} turned their camera off", member.nickname)
        }
        "video_on" => {
            member.video_off.store(false, Ordering::Relaxed);
            format!("{} turned their camera on", member.nickname)
        }
        other => {
            warn!(member = %member.nickname, command = %other, "unknown command ignored");
            return;
        }
    };

    room.broadcast_text(&TextMessage::system(announcement), None);
}

/// Client side: three correlated connections into one room
pub struct ConferenceClient {
    nickname: String,
    video: Connection,
    audio: Connection,
    text: Connection,
}

impl ConferenceClient {
    pub async fn join(
        room: &str,
        nickname: &str,
        video: &Endpoint,
        audio: &Endpoint,
        text: &Endpoint,
        deadline: Duration,
    ) -> Result<Self> {
        let mut video = dial_stream(video, deadline).await?;
        video
            .write_json(&Join {
                room: room.into(),
                nickname: nickname.into(),
                channel: Channel::Video,
            })
            .await?;

        let mut audio = dial_stream(audio, deadline).await?;
        audio
            .write_json(&Join {
                room: room.into(),
                nickname: nickname.into(),
                channel: Channel::Audio,
            })
            .await?;

        let mut text = dial_stream(text, deadline).await?;
        text.write_json(&Join {
            room: room.into(),
            nickname: nickname.into(),
            channel: Channel::Text,
        })
        .await?;

        Ok(Self {
            nickname: nickname.into(),
            video,
            audio,
            text,
        })
    }

    pub fn nickname(&self) -> &str {
        &self.nickname
    }

    /// Surrenders the raw (video, audio, text) connections, for callers that
    /// need to split read and write sides across tasks
    pub fn into_connections(self) -> (Connection, Connection, Connection) {
        (self.video, self.audio, self.text)
    }

    pub async fn send_text(&mut self, text: &str) -> Result<()> {
        let message = TextMessage::new(self.nickname.clone(), text);
        self.text.write_json(&message).await
    }

    /// Sends an in-band control command such as `/mute`
    pub async fn command(&mut self, command: &str) -> Result<()> {
        self.send_text(command).await
    }

    pub async fn recv_text(&mut self, deadline: Duration) -> Result<TextMessage> {
        let frame = self.text.read_frame_timeout(deadline).await?;
        Ok(serde_json::from_slice(&frame)?)
    }

    pub async fn send_video_frame(&mut self, frame: &[u8]) -> Result<()> {
        self.video.write_frame(frame).await
    }

    pub async fn recv_video_frame(&mut self, deadline: Duration) -> Result<Bytes> {
        self.video.read_frame_timeout(deadline).await
    }

    pub async fn send_audio_chunk(&mut self, chunk: &[u8]) -> Result<()> {
        self.audio.write_frame(chunk).await
    }

    pub async fn recv_audio_chunk(&mut self, deadline: Duration) -> Result<Bytes> {
        self.audio.read_frame_timeout(deadline).await
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn join_wire_shape() {
        let join: Join =
            serde_json::from_str(r#"{"room":"m","nickname":"alice","channel":"text"}"#).unwrap();
        assert_eq!(join.channel, Channel::Text);
        assert_eq!(join.room, "m");
    }

    #[test]
    fn text_message_round_trip() {
        let message = TextMessage::new("alice", "hi");
        let json = serde_json::to_string(&message).unwrap();
        let parsed: TextMessage = serde_json::from_str(&json).unwrap();
        assert_eq!(parsed.from, "alice");
        assert_eq!(parsed.text, "hi");
    }
}
