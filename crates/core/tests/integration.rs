//! Integration test: a session streaming from a directly reachable camera.
//!
//! A local TCP echo server stands in for the camera's RTSP port. The session
//! connects through `DirectConnector` + `ConnectionCache`, opens a real
//! `TcpTunnel`, and the test talks to the camera through the tunnel's port.

use std::io::{Read, Write};
use std::net::{TcpListener, TcpStream};
use std::sync::Arc;
use std::time::Duration;

use parking_lot::Mutex;

use edge_video::transport::DirectConnector;
use edge_video::{
    ConnectionCache, Device, ErrorKind, Notice, Result, ServiceDescriptor, SessionConfig,
    SessionManager, SessionPhase, VideoBackend,
};

#[derive(Clone, Default)]
struct UriSink {
    uris: Arc<Mutex<Vec<String>>>,
}

impl VideoBackend for UriSink {
    fn set_uri(&mut self, uri: &str) -> Result<()> {
        self.uris.lock().push(uri.to_string());
        Ok(())
    }

    fn play(&mut self) -> Result<()> {
        Ok(())
    }

    fn pause(&mut self) -> Result<()> {
        Ok(())
    }

    fn stop(&mut self) {}
}

/// Accepts connections forever and echoes whatever arrives.
fn spawn_camera() -> u16 {
    let listener = TcpListener::bind("127.0.0.1:0").unwrap();
    let port = listener.local_addr().unwrap().port();
    std::thread::spawn(move || {
        for stream in listener.incoming() {
            let Ok(mut stream) = stream else { break };
            std::thread::spawn(move || {
                let mut buf = [0u8; 1024];
                loop {
                    match stream.read(&mut buf) {
                        Ok(0) | Err(_) => break,
                        Ok(n) => {
                            if stream.write_all(&buf[..n]).is_err() {
                                break;
                            }
                        }
                    }
                }
            });
        }
    });
    port
}

fn exchange(port: u16, message: &[u8]) -> Vec<u8> {
    let mut stream = TcpStream::connect(("127.0.0.1", port)).unwrap();
    stream
        .set_read_timeout(Some(Duration::from_secs(5)))
        .unwrap();
    stream.write_all(message).unwrap();
    let mut reply = vec![0u8; message.len()];
    stream.read_exact(&mut reply).unwrap();
    reply
}

fn local_port(uri: &str) -> u16 {
    // rtsp://127.0.0.1:PORT/path
    let rest = uri.strip_prefix("rtsp://127.0.0.1:").unwrap();
    rest.split('/').next().unwrap().parse().unwrap()
}

#[tokio::test(flavor = "multi_thread")]
async fn streams_from_direct_camera() {
    let camera_port = spawn_camera();
    let connector = Arc::new(DirectConnector::new());
    connector.add_device(
        "de-garage",
        vec![
            ServiceDescriptor::new("rtsp", "rtsp", "127.0.0.1", camera_port)
                .with_metadata("rtsp-path", "/stream1"),
        ],
    );
    let cache = ConnectionCache::new(connector);
    let backend = UriSink::default();

    let (session, mut notices) = SessionManager::spawn(
        Arc::new(Device::new("pr-cam", "de-garage", "Garage")),
        Arc::new(cache.clone()),
        Box::new(backend.clone()),
        SessionConfig::default(),
    );

    session.start();
    let first = tokio::time::timeout(
        Duration::from_secs(5),
        session.wait_for(|s| s.phase == SessionPhase::Streaming),
    )
    .await
    .unwrap()
    .unwrap();

    let uri = first.uri.clone().unwrap();
    assert!(uri.ends_with("/stream1"));
    let port = local_port(&uri);
    assert_eq!(first.tunnel.as_ref().unwrap().local_port().unwrap(), port);
    assert_eq!(cache.len(), 1);

    let reply = tokio::task::spawn_blocking(move || exchange(port, b"OPTIONS * RTSP/1.0\r\n\r\n"))
        .await
        .unwrap();
    assert_eq!(reply, b"OPTIONS * RTSP/1.0\r\n\r\n");

    // The registry drops the connection; the session comes back on its own.
    cache.connection_closed(&Device::new("pr-cam", "de-garage", "Garage"));
    let second = tokio::time::timeout(
        Duration::from_secs(5),
        session.wait_for(|s| s.phase == SessionPhase::Streaming && s.attempt > first.attempt),
    )
    .await
    .unwrap()
    .unwrap();
    assert!(!first.tunnel.unwrap().is_open());

    let port = local_port(second.uri.as_deref().unwrap());
    let reply = tokio::task::spawn_blocking(move || exchange(port, b"ping"))
        .await
        .unwrap();
    assert_eq!(reply, b"ping");

    tokio::time::timeout(Duration::from_secs(5), session.teardown())
        .await
        .unwrap();
    assert!(!second.tunnel.unwrap().is_open());
    assert_eq!(backend.uris.lock().len(), 2);

    let mut seen = Vec::new();
    while let Ok(notice) = notices.try_recv() {
        seen.push(notice);
    }
    assert!(seen.contains(&Notice::ConnectionClosed));
    assert!(seen.contains(&Notice::Reconnected));
}

#[tokio::test(flavor = "multi_thread")]
async fn unreachable_camera_reports_offline() {
    // Bind then drop to get a port nobody listens on.
    let dead_port = TcpListener::bind("127.0.0.1:0")
        .unwrap()
        .local_addr()
        .unwrap()
        .port();

    let connector = Arc::new(DirectConnector::with_probe_timeout(Duration::from_millis(500)));
    connector.add_device(
        "de-garage",
        vec![ServiceDescriptor::new("rtsp", "rtsp", "127.0.0.1", dead_port)],
    );
    let cache = ConnectionCache::new(connector);

    let (session, mut notices) = SessionManager::spawn(
        Arc::new(Device::new("pr-cam", "de-garage", "Garage")),
        Arc::new(cache.clone()),
        Box::new(UriSink::default()),
        SessionConfig::default(),
    );

    session.start();
    let snapshot = tokio::time::timeout(
        Duration::from_secs(5),
        session.wait_for(|s| s.phase == SessionPhase::Error),
    )
    .await
    .unwrap()
    .unwrap();

    assert_eq!(snapshot.last_error.unwrap().kind, ErrorKind::NoChannels);
    assert!(cache.is_empty());
    let mut errors = Vec::new();
    while let Ok(notice) = notices.try_recv() {
        if let Notice::Error(e) = notice {
            errors.push(e.kind);
        }
    }
    assert_eq!(errors, vec![ErrorKind::NoChannels]);
}

#[tokio::test(flavor = "multi_thread")]
async fn refresh_rebinds_fixed_local_port() {
    let camera_port = spawn_camera();
    let local = TcpListener::bind("127.0.0.1:0")
        .unwrap()
        .local_addr()
        .unwrap()
        .port();

    let connector = Arc::new(DirectConnector::new());
    connector.add_device(
        "de-garage",
        vec![ServiceDescriptor::new("rtsp", "rtsp", "127.0.0.1", camera_port)],
    );
    let config = SessionConfig {
        local_port: local,
        ..SessionConfig::default()
    };
    let (session, _notices) = SessionManager::spawn(
        Arc::new(Device::new("pr-cam", "de-garage", "Garage")),
        Arc::new(ConnectionCache::new(connector)),
        Box::new(UriSink::default()),
        config,
    );

    let expected = format!("rtsp://127.0.0.1:{local}/video");
    session.start();
    let first = tokio::time::timeout(
        Duration::from_secs(5),
        session.wait_for(|s| s.phase != SessionPhase::Idle && s.attempt > 0),
    )
    .await
    .unwrap()
    .unwrap();
    assert_eq!(first.phase, SessionPhase::Streaming);
    assert_eq!(first.uri.as_deref(), Some(expected.as_str()));

    session.refresh(None);
    let second = tokio::time::timeout(
        Duration::from_secs(5),
        session.wait_for(|s| s.attempt > first.attempt && s.phase != SessionPhase::Connecting),
    )
    .await
    .unwrap()
    .unwrap();
    assert_eq!(second.phase, SessionPhase::Streaming, "{:?}", second.last_error);
    assert_eq!(second.uri.as_deref(), Some(expected.as_str()));

    let reply = tokio::task::spawn_blocking(move || exchange(local, b"DESCRIBE"))
        .await
        .unwrap();
    assert_eq!(reply, b"DESCRIBE");

    tokio::time::timeout(Duration::from_secs(5), session.teardown())
        .await
        .unwrap();
}
