use std::sync::Arc;
use std::time::Duration;

use clap::Parser;
use edge_video::transport::DirectConnector;
use edge_video::{
    ConnectionCache, Device, Notice, Result, ServiceDescriptor, SessionConfig, SessionHandle,
    SessionManager, SessionPhase, VideoBackend,
};
use tokio::io::{AsyncBufReadExt, BufReader};

#[derive(Parser)]
#[command(
    name = "edge-video",
    about = "Open a video session to a camera reachable over TCP"
)]
struct Args {
    /// Camera RTSP address (host:port)
    #[arg(long, short, default_value = "127.0.0.1:8554")]
    target: String,

    #[arg(long, default_value = "de-local")]
    device_id: String,

    #[arg(long, default_value = "pr-local")]
    product_id: String,

    #[arg(long, default_value = "Camera")]
    name: String,

    /// Stream path advertised by the device
    #[arg(long)]
    device_path: Option<String>,

    /// Stream path override, takes precedence over the device path
    #[arg(long, short)]
    path: Option<String>,

    #[arg(long)]
    rtsp_username: Option<String>,

    #[arg(long)]
    rtsp_password: Option<String>,

    /// Local tunnel port (0 picks a free one)
    #[arg(long, default_value_t = 0)]
    local_port: u16,

    /// Path used when neither the device nor the user gives one
    #[arg(long, default_value = edge_video::path::DEFAULT_STREAM_PATH)]
    default_path: String,

    #[arg(long, default_value_t = 800)]
    busy_delay_ms: u64,
}

/// Backend that only logs what a player would be asked to do.
struct LogBackend;

impl VideoBackend for LogBackend {
    fn set_uri(&mut self, uri: &str) -> Result<()> {
        println!("stream: {uri}");
        Ok(())
    }

    fn play(&mut self) -> Result<()> {
        tracing::info!("play");
        Ok(())
    }

    fn pause(&mut self) -> Result<()> {
        tracing::info!("pause");
        Ok(())
    }

    fn stop(&mut self) {
        tracing::info!("stop");
    }
}

fn descriptor(args: &Args) -> Option<ServiceDescriptor> {
    let (host, port) = args.target.rsplit_once(':')?;
    let host = host.trim_start_matches('[').trim_end_matches(']');
    let mut descriptor = ServiceDescriptor::new("rtsp", "rtsp", host, port.parse().ok()?);
    if let Some(path) = &args.device_path {
        descriptor = descriptor.with_metadata("rtsp-path", path);
    }
    if let Some(username) = &args.rtsp_username {
        descriptor = descriptor.with_metadata("rtsp-username", username);
    }
    if let Some(password) = &args.rtsp_password {
        descriptor = descriptor.with_metadata("rtsp-password", password);
    }
    Some(descriptor)
}

fn print_state(session: &SessionHandle) {
    let s = session.snapshot();
    match s.phase {
        SessionPhase::Streaming => println!(
            "streaming {} (path {}{})",
            s.uri.unwrap_or_default(),
            s.effective_path.unwrap_or_default(),
            if s.paused { ", paused" } else { "" }
        ),
        SessionPhase::Error => match s.last_error {
            Some(e) => println!("error: {}", e.message),
            None => println!("error"),
        },
        phase => println!("{phase:?}"),
    }
}

#[tokio::main]
async fn main() {
    tracing_subscriber::fmt::init();

    let args = Args::parse();

    let Some(service) = descriptor(&args) else {
        eprintln!("Invalid target address: {}", args.target);
        return;
    };

    let mut device = Device::new(&args.product_id, &args.device_id, &args.name);
    if let Some(path) = &args.path {
        device = device.with_rtsp_path(path);
    }
    let device = Arc::new(device);

    let connector = Arc::new(DirectConnector::new());
    connector.add_device(&device.device_id, vec![service]);
    let cache = ConnectionCache::new(connector);

    let config = SessionConfig {
        default_path: args.default_path.clone(),
        local_port: args.local_port,
        busy_delay: Duration::from_millis(args.busy_delay_ms),
        ..SessionConfig::default()
    };

    let (session, mut notices) = SessionManager::spawn(
        device.clone(),
        Arc::new(cache.clone()),
        Box::new(LogBackend),
        config,
    );

    tokio::spawn(async move {
        while let Some(notice) = notices.recv().await {
            match notice {
                Notice::ShowSpinner | Notice::HideSpinner => tracing::info!(%notice),
                notice => println!("{notice}"),
            }
        }
    });

    session.start();
    println!("commands: refresh [path] | bg | fg | lost | up | closed | state | quit");

    let mut lines = BufReader::new(tokio::io::stdin()).lines();
    loop {
        let line = match lines.next_line().await {
            Ok(Some(line)) => line,
            Ok(None) => break,
            Err(e) => {
                eprintln!("Failed to read stdin: {}", e);
                break;
            }
        };

        let mut words = line.split_whitespace();
        match words.next() {
            Some("refresh") => {
                session.refresh(words.next());
            }
            Some("bg") => {
                session.background();
            }
            Some("fg") => {
                session.foreground();
            }
            Some("lost") => cache.network_lost(),
            Some("up") => cache.network_available(),
            Some("closed") => cache.connection_closed(&device),
            Some("state") => print_state(&session),
            Some("quit") => break,
            Some(other) => println!("unknown command: {other}"),
            None => {}
        }
    }

    session.teardown().await;
}
