// Copyright Amazon.com, Inc. or its affiliates. All Rights Reserved.
// SPDX-License-Identifier: Apache-2.0

//! Adaptive live-media streaming.
//!
//! A server exposes three stream listeners (video, audio, control). A client
//! connects to all three with the same client id, picks a source from the
//! catalog on the control channel, then receives paced media on the other
//! two while reporting its buffer fill back; each (source, client) pair has
//! its own quality loop.
//!
//! Video packets are `u64_be ts | u32_be len | payload`; audio packets carry
//! a magic word so receivers can resynchronize after loss.

use crate::{
    endpoint::Endpoint,
    queue::{OverflowPolicy, PushOutcome, SendQueue},
    shutdown::Shutdown,
    transport::{dial_stream, Connection, ServerConfig, StreamServer},
    Error, Result,
};
use bytes::BytesMut;
use core::{future::Future, time::Duration};
use netkit_codec::live::{AudioDecoder, AudioPacket, VideoPacket};
use serde::{Deserialize, Serialize};
use std::{
    collections::HashMap,
    net::SocketAddr,
    sync::{Arc, Mutex},
};
use tokio::{
    sync::watch,
    time::{self, Instant},
};
use tracing::{debug, info};

mod controller;
mod feed;

pub use controller::{AbrConfig, QualityController};
pub use feed::{
    AudioFeed, AudioStream, BroadcastAudioFeed, BroadcastVideoFeed, MediaSource, VideoFeed,
    VideoStream,
};

/// Default per-client video queue bound, in frames
pub const DEFAULT_VIDEO_QUEUE: usize = 30;
/// Default per-client audio queue bound, in chunks (≈500 ms at 20 ms chunks)
pub const DEFAULT_AUDIO_QUEUE: usize = 25;

#[derive(Clone, Copy, Debug)]
pub struct LiveConfig {
    pub abr: AbrConfig,
    pub video_queue_len: usize,
    pub audio_queue_len: usize,
    /// Best-effort flush budget at shutdown
    pub flush_timeout: Duration,
    pub server: ServerConfig,
}

impl Default for LiveConfig {
    fn default() -> Self {
        Self {
            abr: AbrConfig::default(),
            video_queue_len: DEFAULT_VIDEO_QUEUE,
            audio_queue_len: DEFAULT_AUDIO_QUEUE,
            flush_timeout: Duration::from_millis(500),
            server: ServerConfig::default(),
        }
    }
}

#[derive(Clone, Copy, Debug, Deserialize, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
enum ChannelKind {
    Control,
    Video,
    Audio,
}

#[derive(Debug, Deserialize, Serialize)]
struct Hello {
    client_id: String,
    channel: ChannelKind,
}

#[derive(Clone, Debug, Deserialize, Serialize)]
pub struct SourceInfo {
    pub id: String,
    pub name: String,
}

/// The source list sent on the control channel right after connect
#[derive(Clone, Debug, Deserialize, Serialize)]
pub struct Catalog {
    pub sources: Vec<SourceInfo>,
}

#[derive(Debug, Deserialize, Serialize)]
#[serde(untagged)]
enum ControlMessage {
    Select {
        select: String,
    },
    Feedback {
        buffer_level: f64,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        net_quality: Option<String>,
        ts: f64,
    },
}

struct Session {
    id: String,
    controller: Mutex<QualityController>,
    selected: watch::Sender<Option<Arc<MediaSource>>>,
    closed: watch::Sender<bool>,
}

impl Session {
    fn new(id: String, abr: AbrConfig) -> Self {
        let (selected, _) = watch::channel(None);
        let (closed, _) = watch::channel(false);
        Self {
            id,
            controller: Mutex::new(QualityController::new(abr)),
            selected,
            closed,
        }
    }

    fn quality(&self) -> u8 {
        self.controller.lock().expect("controller lock").quality()
    }

    fn close(&self) {
        let _ = self.closed.send(true);
    }
}

struct LiveState {
    sources: Vec<Arc<MediaSource>>,
    catalog: Catalog,
    sessions: Mutex<HashMap<String, Arc<Session>>>,
    config: LiveConfig,
}

impl LiveState {
    fn session(&self, client_id: &str) -> Arc<Session> {
        let mut sessions = self.sessions.lock().expect("session registry lock");
        sessions
            .entry(client_id.to_owned())
            .or_insert_with(|| Arc::new(Session::new(client_id.to_owned(), self.config.abr)))
            .clone()
    }

    fn remove_session(&self, client_id: &str) {
        let removed = self
            .sessions
            .lock()
            .expect("session registry lock")
            .remove(client_id);
        if let Some(session) = removed {
            session.close();
            debug!(client = %client_id, "live session removed");
        }
    }

    fn source(&self, id: &str) -> Option<Arc<MediaSource>> {
        self.sources.iter().find(|source| source.id() == id).cloned()
    }
}

pub struct LiveServer {
    video: StreamServer,
    audio: StreamServer,
    control: StreamServer,
    state: Arc<LiveState>,
}

impl LiveServer {
    pub async fn bind(
        video: &Endpoint,
        audio: &Endpoint,
        control: &Endpoint,
        sources: Vec<MediaSource>,
        config: LiveConfig,
    ) -> Result<Self> {
        let sources: Vec<Arc<MediaSource>> = sources.into_iter().map(Arc::new).collect();
        let catalog = Catalog {
            sources: sources
                .iter()
                .map(|source| SourceInfo {
                    id: source.id().to_owned(),
                    name: source.name().to_owned(),
                })
                .collect(),
        };

        Ok(Self {
            video: StreamServer::bind_with(video, config.server).await?,
            audio: StreamServer::bind_with(audio, config.server).await?,
            control: StreamServer::bind_with(control, config.server).await?,
            state: Arc::new(LiveState {
                sources,
                catalog,
                sessions: Mutex::new(HashMap::new()),
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

    pub fn control_addr(&self) -> SocketAddr {
        self.control.local_addr()
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
                    handle_video(state.clone(), conn, remote, shutdown)
                },
                stopped(stop_rx.clone()),
            )
        };
        let audio = {
            let state = self.state.clone();
            self.audio.serve(
                move |conn, remote, shutdown| {
                    handle_audio(state.clone(), conn, remote, shutdown)
                },
                stopped(stop_rx.clone()),
            )
        };
        let control = {
            let state = self.state.clone();
            self.control.serve(
                move |conn, remote, shutdown| {
                    handle_control(state.clone(), conn, remote, shutdown)
                },
                stopped(stop_rx),
            )
        };

        tokio::try_join!(video, audio, control, stopper)?;
        info!("live server stopped");
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

async fn wait_closed(rx: &mut watch::Receiver<bool>) {
    loop {
        if *rx.borrow() {
            return;
        }
        if rx.changed().await.is_err() {
            return;
        }
    }
}

/// Resolves with the chosen source, or `None` when the session went away
async fn wait_selected(rx: &mut watch::Receiver<Option<Arc<MediaSource>>>) -> Option<Arc<MediaSource>> {
    loop {
        if let Some(source) = rx.borrow().clone() {
            return Some(source);
        }
        rx.changed().await.ok()?;
    }
}

async fn read_hello(conn: &mut Connection, expected: ChannelKind) -> Result<Hello> {
    let hello: Hello = conn.read_json().await?;
    if hello.channel != expected {
        return Err(Error::Protocol(format!(
            "{:?} frame arrived on the {expected:?} channel",
            hello.channel
        )));
    }
    Ok(hello)
}

async fn handle_control(
    state: Arc<LiveState>,
    mut conn: Connection,
    remote: SocketAddr,
    mut shutdown: Shutdown,
) -> Result<()> {
    let hello = read_hello(&mut conn, ChannelKind::Control).await?;
    let session = state.session(&hello.client_id);
    debug!(client = %session.id, remote = %remote, "control channel up");

    // no media flows until the client has the catalog and selects from it
    conn.write_json(&state.catalog).await?;

    let mut closed_rx = session.closed.subscribe();

    let result = loop {
        enum Event {
            Message(Result<ControlMessage>),
            Done,
        }

        let event = tokio::select! {
            message = conn.read_json::<ControlMessage>() => Event::Message(message),
            _ = shutdown.recv() => Event::Done,
            _ = wait_closed(&mut closed_rx) => Event::Done,
        };

        match event {
            Event::Message(Ok(ControlMessage::Select { select })) => {
                match state.source(&select) {
                    Some(source) => {
                        info!(client = %session.id, source = %select, "source selected");
                        let _ = session.selected.send(Some(source));
                    }
                    None => {
                        let _ = conn
                            .write_json(&serde_json::json!({ "error": "unknown source id" }))
                            .await;
                        break Err(Error::InvalidSelection(select));
                    }
                }
            }
            Event::Message(Ok(ControlMessage::Feedback { buffer_level, .. })) => {
                let adjusted = session
                    .controller
                    .lock()
                    .expect("controller lock")
                    .on_feedback(buffer_level, Instant::now());
                if let Some(quality) = adjusted {
                    debug!(client = %session.id, quality, buffer_level, "quality adjusted");
                }
            }
            Event::Message(Err(Error::ClosedByPeer)) => break Ok(()),
            Event::Message(Err(err)) => break Err(err),
            Event::Done => break Ok(()),
        }
    };

    state.remove_session(&hello.client_id);
    result
}

async fn handle_video(
    state: Arc<LiveState>,
    mut conn: Connection,
    remote: SocketAddr,
    shutdown: Shutdown,
) -> Result<()> {
    let hello = read_hello(&mut conn, ChannelKind::Video).await?;
    let session = state.session(&hello.client_id);
    debug!(client = %session.id, remote = %remote, "video channel up");

    let queue = Arc::new(SendQueue::new(
        state.config.video_queue_len,
        OverflowPolicy::DropOldest,
    ));

    let producer = {
        let queue = queue.clone();
        let session = session.clone();
        let mut selected_rx = session.selected.subscribe();
        tokio::spawn(async move {
            let Some(source) = wait_selected(&mut selected_rx).await else {
                queue.close();
                return;
            };
            let mut stream = source.video().subscribe();
            loop {
                let quality = session.quality();
                match stream.next_frame(quality).await {
                    Some(packet) => {
                        if queue.push(packet) == PushOutcome::Closed {
                            break;
                        }
                    }
                    None => break,
                }
            }
            queue.close();
        })
    };

    let result = pump_media(&state, &session, &queue, &mut conn, shutdown, encode_video).await;

    producer.abort();
    queue.close();

    if result.is_err() {
        state.remove_session(&hello.client_id);
    }
    result
}

async fn handle_audio(
    state: Arc<LiveState>,
    mut conn: Connection,
    remote: SocketAddr,
    shutdown: Shutdown,
) -> Result<()> {
    let hello = read_hello(&mut conn, ChannelKind::Audio).await?;
    let session = state.session(&hello.client_id);
    debug!(client = %session.id, remote = %remote, "audio channel up");

    let queue = Arc::new(SendQueue::new(
        state.config.audio_queue_len,
        OverflowPolicy::DropOldest,
    ));

    let producer = {
        let queue = queue.clone();
        let session = session.clone();
        let mut selected_rx = session.selected.subscribe();
        tokio::spawn(async move {
            let Some(source) = wait_selected(&mut selected_rx).await else {
                queue.close();
                return;
            };
            let Some(feed) = source.audio() else {
                // video-only source: keep the channel open but silent
                return;
            };
            let mut stream = feed.subscribe();
            while let Some(packet) = stream.next_chunk().await {
                if queue.push(packet) == PushOutcome::Closed {
                    break;
                }
            }
            queue.close();
        })
    };

    let result = pump_media(&state, &session, &queue, &mut conn, shutdown, encode_audio).await;

    producer.abort();
    queue.close();

    if result.is_err() {
        state.remove_session(&hello.client_id);
    }
    result
}

fn encode_video(packet: &VideoPacket) -> BytesMut {
    let mut buf = BytesMut::with_capacity(packet.encoded_len());
    packet.encode(&mut buf);
    buf
}

fn encode_audio(packet: &AudioPacket) -> BytesMut {
    let mut buf = BytesMut::with_capacity(packet.encoded_len());
    packet.encode(&mut buf);
    buf
}

/// Drains a media queue to the connection until shutdown or session close;
/// on shutdown whatever is queued gets a best-effort flush
async fn pump_media<T>(
    state: &LiveState,
    session: &Session,
    queue: &Arc<SendQueue<T>>,
    conn: &mut Connection,
    mut shutdown: Shutdown,
    encode: fn(&T) -> BytesMut,
) -> Result<()> {
    let mut closed_rx = session.closed.subscribe();

    loop {
        enum Event<T> {
            Item(Option<T>),
            Flush,
            Done,
        }

        let event = tokio::select! {
            item = queue.next() => Event::Item(item),
            _ = shutdown.recv() => Event::Flush,
            _ = wait_closed(&mut closed_rx) => Event::Done,
        };

        match event {
            Event::Item(Some(packet)) => {
                conn.write_raw(&encode(&packet)).await?;
            }
            Event::Item(None) => return Ok(()),
            Event::Flush => {
                queue.close();
                let flush = async {
                    while let Some(packet) = queue.next().await {
                        if conn.write_raw(&encode(&packet)).await.is_err() {
                            break;
                        }
                    }
                };
                let _ = time::timeout(state.config.flush_timeout, flush).await;
                return Ok(());
            }
            Event::Done => return Ok(()),
        }
    }
}

/// Client side: three correlated connections plus incremental media decoding
pub struct LiveClient {
    client_id: String,
    control: Connection,
    video: Connection,
    audio: Connection,
    video_buf: BytesMut,
    audio_buf: BytesMut,
    audio_decoder: AudioDecoder,
}

impl LiveClient {
    pub async fn connect(
        control: &Endpoint,
        video: &Endpoint,
        audio: &Endpoint,
        deadline: Duration,
    ) -> Result<(Self, Catalog)> {
        let client_id = hex_id();

        let mut control_conn = dial_stream(control, deadline).await?;
        control_conn
            .write_json(&Hello {
                client_id: client_id.clone(),
                channel: ChannelKind::Control,
            })
            .await?;
        let catalog: Catalog = control_conn.read_json().await?;

        let mut video_conn = dial_stream(video, deadline).await?;
        video_conn
            .write_json(&Hello {
                client_id: client_id.clone(),
                channel: ChannelKind::Video,
            })
            .await?;

        let mut audio_conn = dial_stream(audio, deadline).await?;
        audio_conn
            .write_json(&Hello {
                client_id: client_id.clone(),
                channel: ChannelKind::Audio,
            })
            .await?;

        Ok((
            Self {
                client_id,
                control: control_conn,
                video: video_conn,
                audio: audio_conn,
                video_buf: BytesMut::new(),
                audio_buf: BytesMut::new(),
                audio_decoder: AudioDecoder::default(),
            },
            catalog,
        ))
    }

    pub fn client_id(&self) -> &str {
        &self.client_id
    }

    pub async fn select(&mut self, source_id: &str) -> Result<()> {
        self.control
            .write_json(&ControlMessage::Select {
                select: source_id.to_owned(),
            })
            .await
    }

    pub async fn send_feedback(&mut self, buffer_level: f64) -> Result<()> {
        let ts = std::time::SystemTime::now()
            .duration_since(std::time::UNIX_EPOCH)
            .map(|elapsed| elapsed.as_secs_f64())
            .unwrap_or_default();
        self.control
            .write_json(&ControlMessage::Feedback {
                buffer_level,
                net_quality: None,
                ts,
            })
            .await
    }

    /// Next JSON frame on the control channel (server errors arrive here)
    pub async fn next_control(&mut self, deadline: Duration) -> Result<serde_json::Value> {
        let frame = self.control.read_frame_timeout(deadline).await?;
        Ok(serde_json::from_slice(&frame)?)
    }

    pub async fn next_video(&mut self, deadline: Duration) -> Result<VideoPacket> {
        let limits = self.video.limits();
        let read = async {
            loop {
                if let Some(packet) = VideoPacket::decode(&mut self.video_buf, &limits)? {
                    return Ok(packet);
                }
                if self.video.read_chunk(&mut self.video_buf).await? == 0 {
                    return Err(Error::ClosedByPeer);
                }
            }
        };
        match time::timeout(deadline, read).await {
            Ok(result) => result,
            Err(_) => Err(Error::Timeout(deadline)),
        }
    }

    pub async fn next_audio(&mut self, deadline: Duration) -> Result<AudioPacket> {
        let limits = self.audio.limits();
        let read = async {
            loop {
                if let Some(packet) = self.audio_decoder.decode(&mut self.audio_buf, &limits)? {
                    return Ok(packet);
                }
                if self.audio.read_chunk(&mut self.audio_buf).await? == 0 {
                    return Err(Error::ClosedByPeer);
                }
            }
        };
        match time::timeout(deadline, read).await {
            Ok(result) => result,
            Err(_) => Err(Error::Timeout(deadline)),
        }
    }
}

fn hex_id() -> String {
    let bytes: [u8; 8] = rand::random();
    bytes.iter().fold(String::new(), |mut out, byte| {
        out.push_str(&format!("{byte:02x}"));
        out
    })
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn control_messages_parse_both_shapes() {
        let select: ControlMessage = serde_json::from_str(r#"{"select":"cam-1"}"#).unwrap();
        assert!(matches!(select, ControlMessage::Select { select } if select == "cam-1"));

        let feedback: ControlMessage =
            serde_json::from_str(r#"{"buffer_level":0.05,"ts":12.5}"#).unwrap();
        assert!(matches!(
            feedback,
            ControlMessage::Feedback { buffer_level, .. } if buffer_level < 0.1
        ));
    }

    #[test]
    fn hello_wire_shape() {
        let hello: Hello =
            serde_json::from_str(r#"{"client_id":"abc","channel":"video"}"#).unwrap();
        assert_eq!(hello.channel, ChannelKind::Video);
    }
}
