// Copyright Amazon.com, Inc. or its affiliates. All Rights Reserved.
// SPDX-License-Identifier: Apache-2.0

use core::time::Duration;
use futures::future::BoxFuture;
use netkit::{
    codec::live::{AudioPacket, VideoPacket},
    live::{
        AudioFeed, AudioStream, LiveClient, LiveConfig, LiveServer, MediaSource, VideoFeed,
        VideoStream,
    },
    shutdown::Controller,
    Endpoint, Error,
};
use std::sync::{Arc, Mutex};
use tokio::time::sleep;

const DIAL: Duration = Duration::from_secs(2);
const RECV: Duration = Duration::from_secs(2);

/// Paced synthetic feed that stamps the requested quality into the payload
struct StampFeed {
    interval: Duration,
}

struct StampStream {
    interval: Duration,
    ts: u64,
}

impl VideoFeed for StampFeed {
    fn subscribe(&self) -> Box<dyn VideoStream> {
        Box::new(StampStream {
            interval: self.interval,
            ts: 0,
        })
    }
}

impl VideoStream for StampStream {
    fn next_frame(&mut self, quality: u8) -> BoxFuture<'_, Option<VideoPacket>> {
        Box::pin(async move {
            sleep(self.interval).await;
            self.ts += self.interval.as_micros() as u64;
            Some(VideoPacket::new(self.ts, vec![quality; 16]))
        })
    }
}

struct ToneFeed;

struct ToneStream {
    ts: u64,
}

impl AudioFeed for ToneFeed {
    fn subscribe(&self) -> Box<dyn AudioStream> {
        Box::new(ToneStream { ts: 0 })
    }
}

impl AudioStream for ToneStream {
    fn next_chunk(&mut self) -> BoxFuture<'_, Option<AudioPacket>> {
        Box::pin(async move {
            sleep(Duration::from_millis(20)).await;
            self.ts += 20_000;
            Some(AudioPacket::new(self.ts, vec![0x5Au8; 32]))
        })
    }
}

#[allow(dead_code)]
struct Live {
    control: Endpoint,
    video: Endpoint,
    audio: Endpoint,
    controller: Controller,
}

async fn start_server(sources: Vec<MediaSource>) -> Live {
    let any = Endpoint::stream("127.0.0.1", 0);
    let server = LiveServer::bind(&any, &any, &any, sources, LiveConfig::default())
        .await
        .unwrap();

    let control = Endpoint::stream("127.0.0.1", server.control_addr().port());
    let video = Endpoint::stream("127.0.0.1", server.video_addr().port());
    let audio = Endpoint::stream("127.0.0.1", server.audio_addr().port());

    let controller = Controller::new();
    let mut signal = controller.subscribe();
    tokio::spawn(server.serve(async move { signal.recv().await }));

    Live {
        control,
        video,
        audio,
        controller,
    }
}

fn stamp_sources() -> Vec<MediaSource> {
    vec![
        MediaSource::new(
            "s1",
            "Camera 1",
            Arc::new(StampFeed {
                interval: Duration::from_millis(20),
            }),
        )
        .with_audio(Arc::new(ToneFeed)),
        MediaSource::new(
            "s2",
            "Camera 2",
            Arc::new(StampFeed {
                interval: Duration::from_millis(20),
            }),
        ),
    ]
}

#[tokio::test]
async fn catalog_selection_and_monotonic_timestamps() {
    let live = start_server(stamp_sources()).await;
    let (mut client, catalog) = LiveClient::connect(&live.control, &live.video, &live.audio, DIAL)
        .await
        .unwrap();

    let ids: Vec<_> = catalog.sources.iter().map(|s| s.id.as_str()).collect();
    assert_eq!(ids, ["s1", "s2"]);

    // no media may flow before selection
    assert!(matches!(
        client.next_video(Duration::from_millis(300)).await,
        Err(Error::Timeout(_))
    ));

    client.select("s1").await.unwrap();

    let mut last_ts = 0;
    for _ in 0..5 {
        let packet = client.next_video(RECV).await.unwrap();
        assert!(packet.timestamp_micros >= last_ts, "timestamps went backwards");
        last_ts = packet.timestamp_micros;
        // before any feedback the stream runs at the starting quality
        assert_eq!(packet.payload[0], 70);
    }

    let chunk = client.next_audio(RECV).await.unwrap();
    assert_eq!(&chunk.payload[..4], &[0x5A; 4]);
}

#[tokio::test]
async fn low_buffer_feedback_walks_quality_down() {
    let live = start_server(stamp_sources()).await;
    let (mut client, _catalog) = LiveClient::connect(&live.control, &live.video, &live.audio, DIAL)
        .await
        .unwrap();

    client.select("s1").await.unwrap();
    client.next_video(RECV).await.unwrap();

    // four starvation reports spaced past the adjustment interval: 70 -> 50
    for _ in 0..4 {
        client.send_feedback(0.02).await.unwrap();
        sleep(Duration::from_millis(1100)).await;
    }

    let mut reached = None;
    for _ in 0..60 {
        let packet = client.next_video(RECV).await.unwrap();
        if packet.payload[0] == 50 {
            reached = Some(packet.payload[0]);
            break;
        }
    }
    assert_eq!(reached, Some(50), "quality never reached 70 - 4 * 5");
}

#[tokio::test]
async fn unknown_selection_gets_an_error_frame() {
    let live = start_server(stamp_sources()).await;
    let (mut client, _catalog) = LiveClient::connect(&live.control, &live.video, &live.audio, DIAL)
        .await
        .unwrap();

    client.select("bogus").await.unwrap();
    let reply = client.next_control(RECV).await.unwrap();
    assert_eq!(reply["error"], "unknown source id");
}

#[tokio::test]
async fn shutdown_stops_the_stream() {
    let live = start_server(stamp_sources()).await;
    let (mut client, _catalog) = LiveClient::connect(&live.control, &live.video, &live.audio, DIAL)
        .await
        .unwrap();

    client.select("s1").await.unwrap();
    client.next_video(RECV).await.unwrap();

    let live_controller = live.controller;
    live_controller.shutdown(Duration::from_secs(3)).await;

    // the stream ends rather than hanging
    let mut ended = false;
    for _ in 0..200 {
        match client.next_video(Duration::from_millis(250)).await {
            Ok(_) => continue,
            Err(_) => {
                ended = true;
                break;
            }
        }
    }
    assert!(ended);
}
