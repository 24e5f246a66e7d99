use std::collections::HashMap;
use std::io;
use std::net::{Shutdown, SocketAddr, TcpListener, TcpStream};
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};
use std::thread::{self, JoinHandle};
use std::time::Duration;

use parking_lot::Mutex;

use crate::error::{EdgeError, Result, TunnelErrorKind};
use crate::path::LOOPBACK_HOST;
use crate::transport::Tunnel;

/// A tunnel that forwards a local TCP port to a service address.
///
/// `open` binds `127.0.0.1:<port>` and runs a non-blocking accept loop on
/// its own thread. Every accepted client gets an upstream connection to the
/// service and a pair of copy threads. `close` stops the accept loop and
/// shuts down every flow still open. The listening port is released by the
/// time `close` returns, so the same port can be bound again right away.
pub struct TcpTunnel {
    /// Service id → `host:port` of the service on the device.
    services: HashMap<String, String>,
    state: Mutex<Option<Forwarder>>,
}

impl TcpTunnel {
    pub fn new(services: HashMap<String, String>) -> Self {
        Self {
            services,
            state: Mutex::new(None),
        }
    }

    /// Tunnel that knows a single service.
    pub fn single(service: &str, target: &str) -> Self {
        Self::new(HashMap::from([(service.to_string(), target.to_string())]))
    }

    pub fn is_open(&self) -> bool {
        self.state.lock().is_some()
    }
}

impl Tunnel for TcpTunnel {
    fn open(&self, service: &str, local_port: u16) -> Result<()> {
        let mut state = self.state.lock();
        if state.is_some() {
            return Err(EdgeError::tunnel(TunnelErrorKind::AlreadyOpen));
        }

        let target = self.services.get(service).cloned().ok_or_else(|| {
            EdgeError::tunnel(TunnelErrorKind::UnknownService(service.to_string()))
        })?;

        let listener = TcpListener::bind((LOOPBACK_HOST, local_port))
            .map_err(|e| EdgeError::tunnel(TunnelErrorKind::OpenFailed(e.to_string())))?;
        listener.set_nonblocking(true)?;
        let port = listener.local_addr()?.port();

        let running = Arc::new(AtomicBool::new(true));
        let flows = Arc::new(Mutex::new(Flows::default()));

        let r = running.clone();
        let f = flows.clone();
        let t = target.clone();
        let accept = thread::spawn(move || accept_loop(listener, t, r, f));

        tracing::info!(service, local_port = port, %target, "tunnel listening");

        *state = Some(Forwarder {
            local_port: port,
            running,
            flows,
            accept: Some(accept),
        });
        Ok(())
    }

    fn local_port(&self) -> Result<u16> {
        self.state
            .lock()
            .as_ref()
            .map(|f| f.local_port)
            .ok_or(EdgeError::tunnel(TunnelErrorKind::NotOpen))
    }

    fn close(&self) -> Result<()> {
        if let Some(mut forwarder) = self.state.lock().take() {
            forwarder.stop();
            tracing::info!(local_port = forwarder.local_port, "tunnel closed");
        }
        Ok(())
    }
}

impl Drop for TcpTunnel {
    fn drop(&mut self) {
        if let Some(mut forwarder) = self.state.get_mut().take() {
            forwarder.stop();
        }
    }
}

struct Forwarder {
    local_port: u16,
    running: Arc<AtomicBool>,
    flows: Arc<Mutex<Flows>>,
    /// Owns the listener; joined on stop so the port is free afterwards.
    accept: Option<JoinHandle<()>>,
}

impl Forwarder {
    fn stop(&mut self) {
        self.running.store(false, Ordering::SeqCst);
        if let Some(accept) = self.accept.take() {
            let _ = accept.join();
        }
        let open: Vec<_> = self.flows.lock().open.drain().collect();
        for (_, streams) in open {
            for stream in streams {
                let _ = stream.shutdown(Shutdown::Both);
            }
        }
    }
}

/// Streams of in-progress forwarded connections, kept so `close` can cut them.
#[derive(Default)]
struct Flows {
    next_id: u64,
    open: HashMap<u64, Vec<TcpStream>>,
}

const ACCEPT_POLL: Duration = Duration::from_millis(50);

/// Non-blocking accept loop, polling `running` every 50ms.
fn accept_loop(
    listener: TcpListener,
    target: String,
    running: Arc<AtomicBool>,
    flows: Arc<Mutex<Flows>>,
) {
    while running.load(Ordering::SeqCst) {
        match listener.accept() {
            Ok((client, peer)) => {
                if client.set_nonblocking(false).is_err() {
                    continue;
                }
                let t = target.clone();
                let r = running.clone();
                let f = flows.clone();
                thread::spawn(move || forward(client, peer, &t, &r, &f));
            }
            Err(ref e) if e.kind() == io::ErrorKind::WouldBlock => {
                thread::sleep(ACCEPT_POLL);
            }
            Err(e) => {
                if running.load(Ordering::SeqCst) {
                    tracing::warn!(error = %e, "tunnel accept error");
                }
                // Persistent errors (EMFILE) would otherwise spin.
                thread::sleep(ACCEPT_POLL);
            }
        }
    }
    tracing::debug!(%target, "tunnel accept loop exited");
}

fn forward(
    client: TcpStream,
    peer: SocketAddr,
    target: &str,
    running: &AtomicBool,
    flows: &Mutex<Flows>,
) {
    let upstream = match TcpStream::connect(target) {
        Ok(s) => s,
        Err(e) => {
            tracing::warn!(%peer, target, error = %e, "could not reach tunnel target");
            return;
        }
    };

    let (Ok(client_read), Ok(upstream_read), Ok(client_ctl), Ok(upstream_ctl)) = (
        client.try_clone(),
        upstream.try_clone(),
        client.try_clone(),
        upstream.try_clone(),
    ) else {
        return;
    };

    let id = {
        let mut flows = flows.lock();
        let id = flows.next_id;
        flows.next_id += 1;
        flows.open.insert(id, vec![client_ctl, upstream_ctl]);
        id
    };

    // close() may have drained the flow table before we registered.
    if !running.load(Ordering::SeqCst) {
        if let Some(streams) = flows.lock().open.remove(&id) {
            for stream in streams {
                let _ = stream.shutdown(Shutdown::Both);
            }
        }
        return;
    }

    tracing::debug!(%peer, target, "forwarding connection");

    let inbound = thread::spawn(move || pipe(client_read, upstream));
    let outbound = pipe(upstream_read, client);
    let inbound = inbound.join().unwrap_or(0);

    flows.lock().open.remove(&id);
    tracing::debug!(%peer, inbound, outbound, "forwarded connection finished");
}

fn pipe(mut from: TcpStream, mut to: TcpStream) -> u64 {
    let copied = io::copy(&mut from, &mut to).unwrap_or(0);
    let _ = to.shutdown(Shutdown::Write);
    copied
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::{Read, Write};

    fn echo_server() -> String {
        let listener = TcpListener::bind("127.0.0.1:0").unwrap();
        let addr = listener.local_addr().unwrap().to_string();
        thread::spawn(move || {
            for stream in listener.incoming() {
                let Ok(mut stream) = stream else { break };
                thread::spawn(move || {
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
        addr
    }

    #[test]
    fn forwards_bytes_both_ways() {
        let target = echo_server();
        let tunnel = TcpTunnel::single("rtsp", &target);
        tunnel.open("rtsp", 0).unwrap();
        let port = tunnel.local_port().unwrap();
        assert_ne!(port, 0);

        let mut stream = TcpStream::connect((LOOPBACK_HOST, port)).unwrap();
        stream
            .set_read_timeout(Some(Duration::from_secs(2)))
            .unwrap();
        stream.write_all(b"OPTIONS * RTSP/1.0\r\n\r\n").unwrap();

        let mut buf = [0u8; 22];
        stream.read_exact(&mut buf).unwrap();
        assert_eq!(&buf, b"OPTIONS * RTSP/1.0\r\n\r\n");

        tunnel.close().unwrap();
    }

    #[test]
    fn unknown_service_is_rejected() {
        let tunnel = TcpTunnel::single("rtsp", "127.0.0.1:1");
        let err = tunnel.open("http", 0).unwrap_err();
        assert!(matches!(
            err,
            EdgeError::Tunnel {
                kind: TunnelErrorKind::UnknownService(_)
            }
        ));
        assert!(!tunnel.is_open());
    }

    #[test]
    fn port_unavailable_after_close() {
        let tunnel = TcpTunnel::single("rtsp", &echo_server());
        tunnel.open("rtsp", 0).unwrap();
        tunnel.close().unwrap();
        tunnel.close().unwrap();
        assert!(tunnel.local_port().is_err());
    }

    fn free_port() -> u16 {
        TcpListener::bind((LOOPBACK_HOST, 0))
            .unwrap()
            .local_addr()
            .unwrap()
            .port()
    }

    #[test]
    fn fixed_port_can_be_reopened_after_close() {
        let target = echo_server();
        let port = free_port();

        let first = TcpTunnel::single("rtsp", &target);
        first.open("rtsp", port).unwrap();
        assert_eq!(first.local_port().unwrap(), port);
        first.close().unwrap();

        let second = TcpTunnel::single("rtsp", &target);
        second.open("rtsp", port).unwrap();
        assert_eq!(second.local_port().unwrap(), port);

        let mut stream = TcpStream::connect((LOOPBACK_HOST, port)).unwrap();
        stream
            .set_read_timeout(Some(Duration::from_secs(2)))
            .unwrap();
        stream.write_all(b"ping").unwrap();
        let mut buf = [0u8; 4];
        stream.read_exact(&mut buf).unwrap();
        assert_eq!(&buf, b"ping");
    }

    #[test]
    fn second_open_is_rejected() {
        let tunnel = TcpTunnel::single("rtsp", &echo_server());
        tunnel.open("rtsp", 0).unwrap();
        let err = tunnel.open("rtsp", 0).unwrap_err();
        assert!(matches!(
            err,
            EdgeError::Tunnel {
                kind: TunnelErrorKind::AlreadyOpen
            }
        ));
    }
}
