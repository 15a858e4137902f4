// Copyright Amazon.com, Inc. or its affiliates. All Rights Reserved.
// SPDX-License-Identifier: Apache-2.0

//! The netkit command line front-end.
//!
//! Every subcommand is a thin shim over the library; exit code 0 means
//! success, 1 a user-facing error (bad target, refused dial, missing file)
//! and 2 an internal failure.

use netkit::{
    conference::{ConferenceClient, ConferenceConfig, ConferenceServer, TextMessage},
    file,
    http::{self, RouteResponse, Router},
    live::{
        BroadcastAudioFeed, BroadcastVideoFeed, LiveClient, LiveConfig, LiveServer, MediaSource,
    },
    pubsub,
    rpc::{Registry, RpcClient, RpcServer},
    transport::{
        dial_stream, send_datagram, send_multicast, Connection, DatagramServer, MulticastConfig,
        StreamServer,
    },
    websocket::{self, ClientOptions, WebSocketConfig},
    Endpoint, Error, TlsConfig,
};
use netkit::codec::live::{AudioPacket, VideoPacket};
use serde_json::json;
use std::{
    net::Ipv4Addr,
    path::PathBuf,
    sync::Arc,
    time::{Duration, Instant},
};
use structopt::StructOpt;
use tokio::io::{AsyncBufReadExt, BufReader};
use tracing::info;
use tracing_subscriber::EnvFilter;

type Result<T, E = Error> = std::result::Result<T, E>;

#[derive(Debug, StructOpt)]
#[structopt(name = "netkit", about = "A toolkit of framed network services")]
struct Opts {
    /// Log filter (tracing EnvFilter syntax)
    #[structopt(long, default_value = "info", env = "NETKIT_LOG")]
    log: String,

    #[structopt(subcommand)]
    command: Command,
}

#[derive(Debug, StructOpt)]
struct Bind {
    #[structopt(long, default_value = "0.0.0.0")]
    host: String,

    #[structopt(long)]
    port: u16,
}

impl Bind {
    fn endpoint(&self) -> Endpoint {
        Endpoint::stream(&self.host, self.port)
    }

    fn datagram(&self) -> Endpoint {
        Endpoint::datagram(&self.host, self.port)
    }
}

#[derive(Debug, StructOpt)]
struct Target {
    #[structopt(long, default_value = "127.0.0.1")]
    host: String,

    #[structopt(long)]
    port: u16,

    /// Dial / read deadline
    #[structopt(long, default_value = "10s", parse(try_from_str = humantime::parse_duration))]
    timeout: Duration,
}

impl Target {
    fn endpoint(&self) -> Endpoint {
        Endpoint::stream(&self.host, self.port)
    }

    fn datagram(&self) -> Endpoint {
        Endpoint::datagram(&self.host, self.port)
    }
}

#[derive(Debug, StructOpt)]
struct TlsServerOpts {
    #[structopt(long)]
    certfile: PathBuf,

    #[structopt(long)]
    keyfile: PathBuf,

    #[structopt(long)]
    cafile: Option<PathBuf>,

    /// Demand and verify a client certificate
    #[structopt(long)]
    require_client_cert: bool,
}

impl TlsServerOpts {
    fn config(&self) -> TlsConfig {
        TlsConfig::Server {
            cert: self.certfile.clone(),
            key: self.keyfile.clone(),
            ca: self.cafile.clone(),
            require_client_cert: self.require_client_cert,
        }
    }
}

#[derive(Debug, StructOpt)]
struct TlsClientOpts {
    #[structopt(long)]
    cafile: Option<PathBuf>,

    #[structopt(long)]
    certfile: Option<PathBuf>,

    #[structopt(long)]
    keyfile: Option<PathBuf>,

    /// Skip server certificate verification
    #[structopt(long)]
    no_verify: bool,
}

impl TlsClientOpts {
    fn config(&self) -> TlsConfig {
        TlsConfig::Client {
            ca: self.cafile.clone(),
            cert: self.certfile.clone(),
            key: self.keyfile.clone(),
            verify: !self.no_verify,
        }
    }
}

#[derive(Debug, StructOpt)]
#[structopt(rename_all = "kebab-case")]
enum Command {
    /// Frame-echo TCP server
    RunTcpServer {
        #[structopt(flatten)]
        bind: Bind,
    },
    /// Send one framed message and print the echo
    SendTcp {
        #[structopt(flatten)]
        target: Target,
        message: String,
    },
    /// Datagram echo server
    RunUdpServer {
        #[structopt(flatten)]
        bind: Bind,
    },
    /// Send one datagram
    SendUdp {
        #[structopt(flatten)]
        target: Target,
        message: String,
    },
    /// Send one datagram to a multicast group
    SendUdpMulticast {
        #[structopt(long, default_value = "224.0.0.251")]
        group: Ipv4Addr,

        #[structopt(long)]
        port: u16,

        #[structopt(long, default_value = "1")]
        ttl: u32,

        message: String,
    },
    /// Frame-echo TCP server behind TLS
    RunSslTcpServer {
        #[structopt(flatten)]
        bind: Bind,

        #[structopt(flatten)]
        tls: TlsServerOpts,
    },
    /// Send one framed message over TLS
    SendSslTcp {
        #[structopt(flatten)]
        target: Target,

        #[structopt(flatten)]
        tls: TlsClientOpts,

        message: String,
    },
    /// Receive files into a sandbox directory
    RunFileServer {
        #[structopt(flatten)]
        bind: Bind,

        #[structopt(long, default_value = "./received")]
        dir: PathBuf,
    },
    /// Send a file
    SendFile {
        #[structopt(flatten)]
        target: Target,

        file: PathBuf,

        #[structopt(long)]
        show_progress: bool,
    },
    /// Send one JSON object as a frame
    SendJson {
        #[structopt(flatten)]
        target: Target,

        json: String,
    },
    /// Minimal HTTP server with a health route
    RunHttpServer {
        #[structopt(flatten)]
        bind: Bind,
    },
    /// HTTP GET
    HttpGet {
        #[structopt(flatten)]
        target: Target,

        #[structopt(default_value = "/")]
        path: String,
    },
    /// HTTP POST
    HttpPost {
        #[structopt(flatten)]
        target: Target,

        path: String,

        body: String,

        #[structopt(long, default_value = "application/json")]
        content_type: String,
    },
    /// Websocket echo server
    RunWebsocketServer {
        #[structopt(flatten)]
        bind: Bind,
    },
    /// Send stdin lines over a websocket and print the replies
    ConnectWebsocket {
        #[structopt(flatten)]
        target: Target,

        #[structopt(default_value = "/")]
        path: String,
    },
    /// Topic broker
    RunPubsubServer {
        #[structopt(flatten)]
        bind: Bind,
    },
    /// Subscribe to a pattern and print deliveries
    PubsubSubscribe {
        #[structopt(flatten)]
        target: Target,

        topic: String,
    },
    /// Publish one message
    PubsubPublish {
        #[structopt(flatten)]
        target: Target,

        topic: String,

        message: String,
    },
    /// Subscribe and print the first delivery
    PubsubReceive {
        #[structopt(flatten)]
        target: Target,

        topic: String,
    },
    /// RPC server with demo arithmetic methods
    RunRpcServer {
        #[structopt(flatten)]
        bind: Bind,
    },
    /// Call one method: params is a JSON array, kwargs a JSON object
    RpcCall {
        #[structopt(flatten)]
        target: Target,

        method: String,

        #[structopt(long, default_value = "[]")]
        params: String,

        #[structopt(long, default_value = "{}")]
        kwargs: String,
    },
    /// Live streaming server with a synthetic test source
    RunLiveServer {
        #[structopt(long, default_value = "0.0.0.0")]
        host: String,

        /// Control channel port
        #[structopt(long)]
        port: u16,

        #[structopt(long)]
        video_port: u16,

        #[structopt(long)]
        audio_port: u16,
    },
    /// Watch a live stream and print packet statistics
    ConnectLiveServer {
        #[structopt(long, default_value = "127.0.0.1")]
        host: String,

        /// Control channel port
        #[structopt(long)]
        port: u16,

        #[structopt(long)]
        video_port: u16,

        #[structopt(long)]
        audio_port: u16,

        #[structopt(long, default_value = "10s", parse(try_from_str = humantime::parse_duration))]
        timeout: Duration,
    },
    /// Conference server
    RunVideoChatServer {
        #[structopt(long, default_value = "0.0.0.0")]
        host: String,

        #[structopt(long)]
        video_port: u16,

        #[structopt(long)]
        audio_port: u16,

        #[structopt(long)]
        text_port: u16,
    },
    /// Join a conference room for text chat
    ConnectVideoChat {
        #[structopt(long, default_value = "127.0.0.1")]
        host: String,

        #[structopt(long)]
        video_port: u16,

        #[structopt(long)]
        audio_port: u16,

        #[structopt(long)]
        text_port: u16,

        #[structopt(long)]
        room: String,

        #[structopt(long)]
        nickname: String,

        #[structopt(long, default_value = "10s", parse(try_from_str = humantime::parse_duration))]
        timeout: Duration,
    },
    /// Line-oriented shell over the same subcommands
    Interactive,
}

#[tokio::main]
async fn main() {
    let opts = Opts::from_args();

    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_new(&opts.log).unwrap_or_else(|_| EnvFilter::new("info")),
        )
        .init();

    match run(opts.command).await {
        Ok(()) => {}
        Err(err) => {
            eprintln!("error: {err}");
            std::process::exit(exit_code(&err));
        }
    }
}

fn exit_code(err: &Error) -> i32 {
    match err {
        // user-facing problems: wrong target, missing file, refused calls
        Error::DialTimeout { .. }
        | Error::Timeout(_)
        | Error::ClosedByPeer
        | Error::Io(_)
        | Error::Rpc(_)
        | Error::FileTransfer(_)
        | Error::InvalidSelection(_)
        | Error::PoolExhausted(_)
        | Error::Tls(_) => 1,
        _ => 2,
    }
}

async fn ctrl_c() {
    let _ = tokio::signal::ctrl_c().await;
}

async fn run(command: Command) -> Result<()> {
    match command {
        Command::RunTcpServer { bind } => {
            let server = StreamServer::bind(&bind.endpoint()).await?;
            info!(addr = %server.local_addr(), "tcp echo server running, ctrl-c to stop");
            server.serve(echo_handler, ctrl_c()).await
        }
        Command::SendTcp { target, message } => {
            let mut conn = dial_stream(&target.endpoint(), target.timeout).await?;
            conn.write_frame(message.as_bytes()).await?;
            let reply = conn.read_frame_timeout(target.timeout).await?;
            println!("{}", String::from_utf8_lossy(&reply));
            Ok(())
        }
        Command::RunUdpServer { bind } => {
            let server = DatagramServer::bind(&bind.datagram()).await?;
            info!(addr = %server.local_addr(), "udp echo server running, ctrl-c to stop");
            server
                .serve(
                    |data, source, socket| {
                        tokio::spawn(async move {
                            let _ = socket.send_to(&data, source).await;
                        });
                    },
                    ctrl_c(),
                )
                .await
        }
        Command::SendUdp { target, message } => {
            send_datagram(&target.datagram(), message.as_bytes()).await
        }
        Command::SendUdpMulticast {
            group,
            port,
            ttl,
            message,
        } => {
            let config = MulticastConfig::new(group, port).with_ttl(ttl);
            send_multicast(&config, message.as_bytes()).await
        }
        Command::RunSslTcpServer { bind, tls } => {
            let endpoint = bind.endpoint().with_tls(tls.config());
            let server = StreamServer::bind(&endpoint).await?;
            info!(addr = %server.local_addr(), "tls echo server running, ctrl-c to stop");
            server.serve(echo_handler, ctrl_c()).await
        }
        Command::SendSslTcp {
            target,
            tls,
            message,
        } => {
            let endpoint = target.endpoint().with_tls(tls.config());
            let mut conn = dial_stream(&endpoint, target.timeout).await?;
            conn.write_frame(message.as_bytes()).await?;
            let reply = conn.read_frame_timeout(target.timeout).await?;
            println!("{}", String::from_utf8_lossy(&reply));
            Ok(())
        }
        Command::RunFileServer { bind, dir } => {
            let server = file::FileServer::bind(&bind.endpoint(), dir).await?;
            info!(addr = %server.local_addr(), "file server running, ctrl-c to stop");
            server.serve(ctrl_c()).await
        }
        Command::SendFile {
            target,
            file: path,
            show_progress,
        } => {
            file::send_file_to(&target.endpoint(), &path, target.timeout, |done, total| {
                if show_progress {
                    eprintln!("{done}/{total} bytes");
                }
            })
            .await
        }
        Command::SendJson { target, json } => {
            let value: serde_json::Value = serde_json::from_str(&json)?;
            let mut conn = dial_stream(&target.endpoint(), target.timeout).await?;
            conn.write_json(&value).await?;
            Ok(())
        }
        Command::RunHttpServer { bind } => {
            let router = Router::new()
                .route("GET", "/", |_request| {
                    RouteResponse::ok("text/plain", &b"netkit\n"[..])
                })
                .route("GET", "/healthz", |_request| {
                    RouteResponse::ok("application/json", &br#"{"status":"ok"}"#[..])
                });
            let server = http::HttpServer::bind(&bind.endpoint(), router).await?;
            info!(addr = %server.local_addr(), "http server running, ctrl-c to stop");
            server.serve(ctrl_c()).await
        }
        Command::HttpGet { target, path } => {
            let response = http::http_get(&target.endpoint(), &path, &[], target.timeout).await?;
            println!("{}", String::from_utf8_lossy(&response.body));
            if response.is_success() {
                Ok(())
            } else {
                Err(Error::Protocol(format!("status {}", response.status)))
            }
        }
        Command::HttpPost {
            target,
            path,
            body,
            content_type,
        } => {
            let response = http::http_post(
                &target.endpoint(),
                &path,
                &content_type,
                body.as_bytes(),
                &[],
                target.timeout,
            )
            .await?;
            println!("{}", String::from_utf8_lossy(&response.body));
            Ok(())
        }
        Command::RunWebsocketServer { bind } => {
            let server = StreamServer::bind(&bind.endpoint()).await?;
            info!(addr = %server.local_addr(), "websocket echo server running, ctrl-c to stop");
            server
                .serve(
                    |conn, _remote, _shutdown| async move {
                        let mut ws = websocket::accept(conn, WebSocketConfig::default()).await?;
                        while let Some(message) = ws.recv().await? {
                            ws.send(message).await?;
                        }
                        Ok(())
                    },
                    ctrl_c(),
                )
                .await
        }
        Command::ConnectWebsocket { target, path } => {
            let mut ws = websocket::connect_websocket(
                &target.endpoint(),
                &path,
                ClientOptions::new(),
                target.timeout,
            )
            .await?;

            let mut lines = BufReader::new(tokio::io::stdin()).lines();
            while let Some(line) = lines.next_line().await? {
                ws.send_text(&line).await?;
                match ws.recv().await? {
                    Some(websocket::Message::Text(text)) => println!("{text}"),
                    Some(websocket::Message::Binary(bytes)) => {
                        println!("<{} binary bytes>", bytes.len())
                    }
                    None => break,
                }
            }
            ws.close(1000, "bye").await
        }
        Command::RunPubsubServer { bind } => {
            let broker = pubsub::Broker::bind(&bind.endpoint()).await?;
            info!(addr = %broker.local_addr(), "pub/sub broker running, ctrl-c to stop");
            broker.serve(ctrl_c()).await
        }
        Command::PubsubSubscribe { target, topic } => {
            let mut client = pubsub::Client::connect(&target.endpoint(), target.timeout).await?;
            client.subscribe(&topic).await?;
            info!(pattern = %topic, "subscribed, ctrl-c to stop");
            loop {
                let delivery = client.receive().await?;
                println!("{}", serde_json::to_string(&delivery)?);
            }
        }
        Command::PubsubPublish {
            target,
            topic,
            message,
        } => {
            let mut client = pubsub::Client::connect(&target.endpoint(), target.timeout).await?;
            let message = serde_json::from_str(&message)
                .unwrap_or_else(|_| serde_json::Value::String(message));
            client.publish(&topic, message).await
        }
        Command::PubsubReceive { target, topic } => {
            let mut client = pubsub::Client::connect(&target.endpoint(), target.timeout).await?;
            client.subscribe(&topic).await?;
            let delivery = client.receive_timeout(target.timeout).await?;
            println!("{}", serde_json::to_string(&delivery)?);
            Ok(())
        }
        Command::RunRpcServer { bind } => {
            let registry = Registry::new()
                .register("echo", |mut params, kwargs| {
                    if !kwargs.is_empty() {
                        return Ok(serde_json::Value::Object(kwargs));
                    }
                    Ok(params.pop().unwrap_or(serde_json::Value::Null))
                })
                .register("add", |params, _kwargs| {
                    params
                        .iter()
                        .map(|value| value.as_f64().ok_or("add takes numbers"))
                        .sum::<Result<f64, _>>()
                        .map(|sum| json!(sum))
                        .map_err(Into::into)
                });
            let server = RpcServer::bind(&bind.endpoint(), registry).await?;
            info!(addr = %server.local_addr(), "rpc server running, ctrl-c to stop");
            server.serve(ctrl_c()).await
        }
        Command::RpcCall {
            target,
            method,
            params,
            kwargs,
        } => {
            let params: Vec<serde_json::Value> = serde_json::from_str(&params)?;
            let kwargs: serde_json::Map<String, serde_json::Value> =
                serde_json::from_str(&kwargs)?;
            let mut client = RpcClient::connect(&target.endpoint(), target.timeout).await?;
            let result = client.call_with(&method, params, kwargs).await?;
            println!("{}", serde_json::to_string(&result)?);
            Ok(())
        }
        Command::RunLiveServer {
            host,
            port,
            video_port,
            audio_port,
        } => {
            let (source, handles) = synthetic_source();
            let server = LiveServer::bind(
                &Endpoint::stream(&host, video_port),
                &Endpoint::stream(&host, audio_port),
                &Endpoint::stream(&host, port),
                vec![source],
                LiveConfig::default(),
            )
            .await?;
            info!(
                control = %server.control_addr(),
                video = %server.video_addr(),
                audio = %server.audio_addr(),
                "live server running, ctrl-c to stop"
            );
            let result = server.serve(ctrl_c()).await;
            drop(handles);
            result
        }
        Command::ConnectLiveServer {
            host,
            port,
            video_port,
            audio_port,
            timeout,
        } => {
            let (mut client, catalog) = LiveClient::connect(
                &Endpoint::stream(&host, port),
                &Endpoint::stream(&host, video_port),
                &Endpoint::stream(&host, audio_port),
                timeout,
            )
            .await?;

            for source in &catalog.sources {
                println!("source: {} ({})", source.id, source.name);
            }
            let first = catalog
                .sources
                .first()
                .ok_or_else(|| Error::InvalidSelection("catalog is empty".into()))?;
            client.select(&first.id).await?;
            info!(source = %first.id, "selected, ctrl-c to stop");

            let mut frames = 0u64;
            let mut last_report = Instant::now();
            loop {
                let packet = client.next_video(timeout).await?;
                frames += 1;
                if last_report.elapsed() >= Duration::from_secs(1) {
                    println!(
                        "{frames} frames, latest ts {} µs, {} bytes",
                        packet.timestamp_micros,
                        packet.payload.len()
                    );
                    client.send_feedback(0.5).await?;
                    last_report = Instant::now();
                }
            }
        }
        Command::RunVideoChatServer {
            host,
            video_port,
            audio_port,
            text_port,
        } => {
            let server = ConferenceServer::bind(
                &Endpoint::stream(&host, video_port),
                &Endpoint::stream(&host, audio_port),
                &Endpoint::stream(&host, text_port),
                ConferenceConfig::default(),
            )
            .await?;
            info!(
                video = %server.video_addr(),
                audio = %server.audio_addr(),
                text = %server.text_addr(),
                "conference server running, ctrl-c to stop"
            );
            server.serve(ctrl_c()).await
        }
        Command::ConnectVideoChat {
            host,
            video_port,
            audio_port,
            text_port,
            room,
            nickname,
            timeout,
        } => {
            let client = ConferenceClient::join(
                &room,
                &nickname,
                &Endpoint::stream(&host, video_port),
                &Endpoint::stream(&host, audio_port),
                &Endpoint::stream(&host, text_port),
                timeout,
            )
            .await?;
            println!("joined {room} as {nickname}; type to chat, /mute etc. for commands");

            let (_video, _audio, text) = client.into_connections();
            let (mut text_reader, mut text_writer) = text.split();

            tokio::spawn(async move {
                while let Ok(message) = text_reader.read_json::<TextMessage>().await {
                    println!("[{}] {}", message.from, message.text);
                }
            });

            let mut lines = BufReader::new(tokio::io::stdin()).lines();
            while let Some(line) = lines.next_line().await? {
                if line.is_empty() {
                    continue;
                }
                text_writer
                    .write_json(&TextMessage::new(nickname.clone(), line))
                    .await?;
            }
            Ok(())
        }
        Command::Interactive => interactive().await,
    }
}

async fn echo_handler(
    mut conn: Connection,
    _remote: std::net::SocketAddr,
    mut shutdown: netkit::shutdown::Shutdown,
) -> Result<()> {
    loop {
        tokio::select! {
            frame = conn.read_frame() => {
                let frame = match frame {
                    Ok(frame) => frame,
                    Err(Error::ClosedByPeer) => return Ok(()),
                    Err(err) => return Err(err),
                };
                info!(bytes = frame.len(), "echoing frame");
                conn.write_frame(&frame).await?;
            }
            _ = shutdown.recv() => return Ok(()),
        }
    }
}

/// A 10 fps / 50 chunk-per-second synthetic source for demos
fn synthetic_source() -> (MediaSource, (tokio::task::JoinHandle<()>, tokio::task::JoinHandle<()>)) {
    let (video_feed, video_tx) = BroadcastVideoFeed::new(64);
    let (audio_feed, audio_tx) = BroadcastAudioFeed::new(256);

    let started = Instant::now();
    let video_task = tokio::spawn(async move {
        let mut ticker = tokio::time::interval(Duration::from_millis(100));
        loop {
            ticker.tick().await;
            let ts = started.elapsed().as_micros() as u64;
            let payload = vec![0x42u8; 2048];
            if video_tx.send(VideoPacket::new(ts, payload)).is_err() {
                return;
            }
        }
    });

    let started = Instant::now();
    let audio_task = tokio::spawn(async move {
        let mut ticker = tokio::time::interval(Duration::from_millis(20));
        loop {
            ticker.tick().await;
            let ts = started.elapsed().as_micros() as u64;
            let payload = vec![0x00u8; 320];
            if audio_tx.send(AudioPacket::new(ts, payload)).is_err() {
                return;
            }
        }
    });

    let source = MediaSource::new("test-pattern", "Synthetic test pattern", Arc::new(video_feed))
        .with_audio(Arc::new(audio_feed));

    (source, (video_task, audio_task))
}

/// Re-parses each stdin line through the subcommand grammar
async fn interactive() -> Result<()> {
    println!("netkit interactive shell; `help` lists commands, `exit` leaves");

    let mut lines = BufReader::new(tokio::io::stdin()).lines();
    while let Some(line) = lines.next_line().await? {
        let words: Vec<&str> = line.split_whitespace().collect();
        match words.as_slice() {
            [] => continue,
            ["exit" | "quit"] => break,
            ["help"] => {
                let _ = Command::from_iter_safe(["netkit", "--help"])
                    .map_err(|err| println!("{err}"));
            }
            words => {
                let args = std::iter::once("netkit").chain(words.iter().copied());
                match Command::from_iter_safe(args) {
                    Ok(command) => {
                        if let Err(err) = Box::pin(run(command)).await {
                            eprintln!("error: {err}");
                        }
                    }
                    Err(err) => println!("{err}"),
                }
            }
        }
    }
    Ok(())
}
