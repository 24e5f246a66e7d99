//! Device video sessions.
//!
//! A session owns the lifecycle of one view onto a device's video:
//!
//! ```text
//! get connection -> fetch descriptor -> close old tunnel -> open tunnel
//!   -> read local port -> resolve path -> build URI -> backend set_uri + play
//! ```
//!
//! The [`SessionManager`] runs as a task consuming a single mailbox of
//! [`SessionEvent`]s (UI lifecycle, registry notifications, backend events)
//! and attempt completions. The blocking connect sequence runs on the
//! blocking pool; its report comes back through the same mailbox and is
//! only applied if it belongs to the live attempt. Only one sequence runs
//! at a time; triggers arriving meanwhile are queued and started once the
//! running one reports.
//!
//! State is published as a [`SessionSnapshot`] through a `watch` channel,
//! one-shot banners as [`Notice`]s.

mod busy;
mod connect;
pub mod state;

use std::ops::ControlFlow;
use std::sync::Arc;
use std::time::Duration;

use tokio::sync::{broadcast, mpsc, watch};
use tokio::task::JoinHandle;

use crate::backend::{BackendEvent, BackendEvents, VideoBackend};
use crate::descriptor::ServiceDescriptor;
use crate::device::Device;
use crate::error::{EdgeError, ErrorKind, Result};
use crate::path::{DEFAULT_STREAM_PATH, LOOPBACK_HOST, placeholder_path};
use crate::registry::{ConnectionRegistry, RegistryEvent};
use crate::tunnel::TunnelHandle;

use busy::BusyIndicator;
use connect::{AttemptReport, ConnectSequence, Established};
pub use state::{Notice, SessionError, SessionPhase, SessionSnapshot};

pub const DEFAULT_SERVICE_NAME: &str = "rtsp";

/// Delay before the busy spinner is shown.
pub const DEFAULT_BUSY_DELAY: Duration = Duration::from_millis(800);

/// Session-level configuration.
#[derive(Debug, Clone)]
pub struct SessionConfig {
    /// Path used when neither the user nor the device provides one.
    pub default_path: String,
    /// Remote service the tunnel binds to.
    pub service_name: String,
    /// Requested local tunnel port, 0 for an ephemeral one.
    pub local_port: u16,
    pub busy_delay: Duration,
    /// Host written into the stream URI.
    pub loopback_host: String,
}

impl Default for SessionConfig {
    fn default() -> Self {
        Self {
            default_path: DEFAULT_STREAM_PATH.to_string(),
            service_name: DEFAULT_SERVICE_NAME.to_string(),
            local_port: 0,
            busy_delay: DEFAULT_BUSY_DELAY,
            loopback_host: LOOPBACK_HOST.to_string(),
        }
    }
}

/// Everything that can drive a session.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum SessionEvent {
    /// The view became visible.
    Start,
    /// User asked for a reload, optionally with a new stream path.
    Refresh { path: Option<String> },
    /// App returned to the foreground.
    Foreground,
    /// App moved to the background: pause only.
    Background,
    /// The view was dismissed: stop playback, close the tunnel, exit.
    Teardown,
    Registry(RegistryEvent),
    Backend(BackendEvent),
}

pub(crate) enum Message {
    Event(SessionEvent),
    AttemptDone(AttemptReport),
}

pub(crate) type Mailbox = mpsc::UnboundedSender<Message>;

/// Why a connect attempt was started.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Trigger {
    Start,
    Refresh,
    Foreground,
    ConnectionClosed,
    NetworkAvailable,
}

/// Sends teardown when the last [`SessionHandle`] is dropped.
struct Owner {
    mailbox: Mailbox,
}

impl Drop for Owner {
    fn drop(&mut self) {
        let _ = self.mailbox.send(Message::Event(SessionEvent::Teardown));
    }
}

/// Cheap, clonable handle to a running session.
///
/// Dropping the last handle tears the session down.
#[derive(Clone)]
pub struct SessionHandle {
    mailbox: Mailbox,
    state: watch::Receiver<SessionSnapshot>,
    _owner: Arc<Owner>,
}

impl SessionHandle {
    /// Deliver an event. Returns `false` once the session has ended.
    pub fn send(&self, event: SessionEvent) -> bool {
        self.mailbox.send(Message::Event(event)).is_ok()
    }

    pub fn start(&self) -> bool {
        self.send(SessionEvent::Start)
    }

    pub fn refresh(&self, path: Option<&str>) -> bool {
        self.send(SessionEvent::Refresh {
            path: path.map(str::to_string),
        })
    }

    pub fn foreground(&self) -> bool {
        self.send(SessionEvent::Foreground)
    }

    pub fn background(&self) -> bool {
        self.send(SessionEvent::Background)
    }

    /// Tear the session down and wait until it has stopped.
    pub async fn teardown(&self) {
        self.send(SessionEvent::Teardown);
        let mut state = self.state.clone();
        while state.changed().await.is_ok() {}
    }

    pub fn snapshot(&self) -> SessionSnapshot {
        self.state.borrow().clone()
    }

    pub fn watch(&self) -> watch::Receiver<SessionSnapshot> {
        self.state.clone()
    }

    /// Wait until the published state satisfies `predicate`.
    ///
    /// Returns `None` if the session ends first.
    pub async fn wait_for(
        &self,
        predicate: impl FnMut(&SessionSnapshot) -> bool,
    ) -> Option<SessionSnapshot> {
        let mut state = self.state.clone();
        state.wait_for(predicate).await.ok().map(|s| s.clone())
    }

    pub fn is_closed(&self) -> bool {
        self.mailbox.is_closed()
    }
}

/// Orchestrates connection, tunnel and playback for one device view.
pub struct SessionManager {
    device: Arc<Device>,
    registry: Arc<dyn ConnectionRegistry>,
    backend: Box<dyn VideoBackend>,
    config: Arc<SessionConfig>,
    mailbox: Mailbox,
    notices: mpsc::UnboundedSender<Notice>,
    state_tx: watch::Sender<SessionSnapshot>,
    registry_forwarder: JoinHandle<()>,
    busy: BusyIndicator,

    phase: SessionPhase,
    user_path: Option<String>,
    descriptor: Option<Arc<ServiceDescriptor>>,
    tunnel: Option<TunnelHandle>,
    uri: Option<String>,
    effective_path: Option<String>,
    placeholder_path: String,
    last_error: Option<SessionError>,
    paused: bool,
    buffering: bool,
    reconnect_pending: bool,
    network_lost: bool,
    /// App is in the background; playback stays paused until foreground.
    backgrounded: bool,

    /// Last attempt id handed out.
    attempt: u64,
    /// Attempt whose worker is still running, stale or not.
    running: Option<u64>,
    /// Attempt whose report will be applied.
    live: Option<u64>,
    queued: Option<Trigger>,
    applied: u64,
}

impl SessionManager {
    /// Spawn a session task for `device`. Must be called within a tokio runtime.
    ///
    /// The session starts `Idle`; send [`SessionEvent::Start`] to connect.
    pub fn spawn(
        device: Arc<Device>,
        registry: Arc<dyn ConnectionRegistry>,
        mut backend: Box<dyn VideoBackend>,
        config: SessionConfig,
    ) -> (SessionHandle, mpsc::UnboundedReceiver<Notice>) {
        let (mailbox, inbox) = mpsc::unbounded_channel();
        let (notices, notice_rx) = mpsc::unbounded_channel();

        let config = Arc::new(config);
        let placeholder = placeholder_path(None, &config.default_path);
        let (state_tx, state_rx) = watch::channel(SessionSnapshot::idle(placeholder.clone()));

        backend.attach(BackendEvents::new(mailbox.clone()));
        let registry_forwarder = tokio::spawn(forward_registry(registry.subscribe(), mailbox.clone()));

        let manager = SessionManager {
            user_path: device.rtsp_path.clone(),
            device,
            registry,
            backend,
            busy: BusyIndicator::new(config.busy_delay, notices.clone()),
            config,
            mailbox: mailbox.clone(),
            notices,
            state_tx,
            registry_forwarder,
            phase: SessionPhase::Idle,
            descriptor: None,
            tunnel: None,
            uri: None,
            effective_path: None,
            placeholder_path: placeholder,
            last_error: None,
            paused: false,
            buffering: false,
            reconnect_pending: false,
            network_lost: false,
            backgrounded: false,
            attempt: 0,
            running: None,
            live: None,
            queued: None,
            applied: 0,
        };
        tokio::spawn(manager.run(inbox));

        let handle = SessionHandle {
            mailbox: mailbox.clone(),
            state: state_rx,
            _owner: Arc::new(Owner { mailbox }),
        };
        (handle, notice_rx)
    }

    async fn run(mut self, mut inbox: mpsc::UnboundedReceiver<Message>) {
        tracing::info!(device_id = %self.device.device_id, "session started");

        while let Some(message) = inbox.recv().await {
            let flow = self.handle(message);
            self.publish();
            if flow.is_break() {
                break;
            }
        }

        // Reports that raced with teardown still hold tunnels.
        inbox.close();
        while let Ok(message) = inbox.try_recv() {
            if let Message::AttemptDone(report) = message {
                if let Some(tunnel) = report.tunnel {
                    tunnel.close_detached();
                }
            }
        }

        tracing::info!(device_id = %self.device.device_id, "session torn down");
    }

    fn handle(&mut self, message: Message) -> ControlFlow<()> {
        match message {
            Message::AttemptDone(report) => self.finish_attempt(report),
            Message::Event(event) => {
                tracing::debug!(device_id = %self.device.device_id, ?event, phase = ?self.phase, "event");
                match event {
                    SessionEvent::Teardown => {
                        self.teardown();
                        return ControlFlow::Break(());
                    }
                    SessionEvent::Start => self.begin_connect(Trigger::Start),
                    SessionEvent::Refresh { path } => {
                        if let Some(path) = path.filter(|p| !p.is_empty()) {
                            self.user_path = Some(path);
                        }
                        self.begin_connect(Trigger::Refresh);
                    }
                    SessionEvent::Foreground => {
                        self.backgrounded = false;
                        self.begin_connect(Trigger::Foreground);
                    }
                    SessionEvent::Background => {
                        self.backgrounded = true;
                        self.pause_playback();
                    }
                    SessionEvent::Registry(RegistryEvent::ConnectionClosed { device_id }) => {
                        if device_id == self.device.device_id {
                            self.on_connection_closed();
                        }
                    }
                    SessionEvent::Registry(RegistryEvent::NetworkLost) => self.on_network_lost(),
                    SessionEvent::Registry(RegistryEvent::NetworkAvailable) => {
                        self.on_network_available()
                    }
                    SessionEvent::Backend(event) => self.on_backend_event(event),
                }
            }
        }
        ControlFlow::Continue(())
    }

    fn begin_connect(&mut self, trigger: Trigger) {
        if let Some(running) = self.running {
            tracing::debug!(attempt = running, ?trigger, "attempt in flight, queued");
            self.queued = Some(trigger);
            return;
        }

        self.attempt += 1;
        let attempt = self.attempt;
        self.running = Some(attempt);
        self.live = Some(attempt);

        self.phase = SessionPhase::Connecting;
        self.descriptor = None;
        self.uri = None;
        self.effective_path = None;
        self.busy.set(true);

        tracing::debug!(device_id = %self.device.device_id, attempt, ?trigger, "connecting");

        let sequence = ConnectSequence {
            attempt,
            device: self.device.clone(),
            registry: self.registry.clone(),
            config: self.config.clone(),
            user_path: self.user_path.clone(),
            previous: self.tunnel.take(),
        };

        let mailbox = self.mailbox.clone();
        tokio::spawn(async move {
            let report = match tokio::task::spawn_blocking(move || sequence.run()).await {
                Ok(report) => report,
                Err(e) => AttemptReport {
                    attempt,
                    tunnel: None,
                    result: Err(EdgeError::Other(format!("connect worker failed: {e}"))),
                },
            };
            if let Err(mpsc::error::SendError(Message::AttemptDone(report))) =
                mailbox.send(Message::AttemptDone(report))
            {
                if let Some(tunnel) = report.tunnel {
                    tunnel.close_detached();
                }
            }
        });
    }

    fn finish_attempt(&mut self, report: AttemptReport) {
        if self.running == Some(report.attempt) {
            self.running = None;
        }

        if self.live == Some(report.attempt) {
            self.live = None;
            match report.result {
                Ok(established) => self.on_established(report.attempt, report.tunnel, established),
                Err(e) => self.on_attempt_failed(report.attempt, report.tunnel, e),
            }
        } else {
            tracing::debug!(attempt = report.attempt, "discarding superseded attempt");
            if let Some(tunnel) = report.tunnel {
                tunnel.close_detached();
            }
        }

        if self.running.is_none() {
            if let Some(trigger) = self.queued.take() {
                self.begin_connect(trigger);
            }
        }
    }

    fn on_established(&mut self, attempt: u64, tunnel: Option<TunnelHandle>, established: Established) {
        let Established {
            descriptor,
            path,
            uri,
        } = established;

        if let Err(e) = self.hand_off(&uri) {
            return self.on_attempt_failed(attempt, tunnel, e);
        }

        tracing::info!(device_id = %self.device.device_id, attempt, %path, "streaming");

        self.placeholder_path = placeholder_path(descriptor.rtsp_path(), &self.config.default_path);
        self.descriptor = Some(Arc::new(descriptor));
        self.tunnel = tunnel;
        self.uri = Some(uri);
        self.effective_path = Some(path);
        self.phase = SessionPhase::Streaming;
        self.paused = self.backgrounded;
        self.last_error = None;
        self.applied = attempt;
        // A successful attempt proves the network is back.
        self.network_lost = false;
        self.busy.set(false);

        if self.reconnect_pending {
            self.reconnect_pending = false;
            self.notify(Notice::Reconnected);
        }
    }

    /// Load `uri` and play it, unless the app went to the background meanwhile.
    fn hand_off(&mut self, uri: &str) -> Result<()> {
        self.backend.set_uri(uri)?;
        if self.backgrounded {
            tracing::debug!(device_id = %self.device.device_id, "backgrounded, stream loaded paused");
            return Ok(());
        }
        self.backend.play()
    }

    fn on_attempt_failed(&mut self, attempt: u64, tunnel: Option<TunnelHandle>, err: EdgeError) {
        self.registry.remove_connection(&self.device);

        // Left for the next attempt to close.
        self.tunnel = tunnel;
        self.descriptor = None;
        self.uri = None;
        self.effective_path = None;
        self.phase = SessionPhase::Error;
        self.applied = attempt;
        self.busy.set(false);

        match SessionError::from_error(&err) {
            Some(session_error) => {
                tracing::warn!(
                    device_id = %self.device.device_id,
                    attempt,
                    kind = ?session_error.kind,
                    error = %err,
                    "connect attempt failed"
                );
                self.last_error = Some(session_error.clone());
                self.notify(Notice::Error(session_error));
            }
            None => {
                tracing::debug!(device_id = %self.device.device_id, attempt, "transport stopped, restart pending");
                self.last_error = None;
            }
        }
    }

    fn pause_playback(&mut self) {
        if let Err(e) = self.backend.pause() {
            tracing::warn!(device_id = %self.device.device_id, error = %e, "could not pause playback");
        }
        self.paused = true;
    }

    fn on_connection_closed(&mut self) {
        self.notify(Notice::ConnectionClosed);
        self.reconnect_pending = true;

        if self.network_lost {
            // The tunnel's port died with the connection; retry once the network is back.
            if let Some(tunnel) = self.tunnel.take() {
                tunnel.close_detached();
            }
            return;
        }
        self.begin_connect(Trigger::ConnectionClosed);
    }

    fn on_network_lost(&mut self) {
        self.notify(Notice::NetworkLost);
        self.network_lost = true;

        // Whatever is in flight now works against a dead network.
        self.live = None;
        self.queued = None;

        self.pause_playback();
        if let Some(tunnel) = self.tunnel.take() {
            tunnel.close_detached();
        }
        self.descriptor = None;
        self.uri = None;
        self.effective_path = None;
        self.phase = SessionPhase::Error;
        self.last_error = Some(SessionError {
            kind: ErrorKind::NoChannels,
            message: Notice::NetworkLost.to_string(),
        });
        self.busy.set(false);
    }

    fn on_network_available(&mut self) {
        self.notify(Notice::NetworkAvailable);
        if !self.network_lost {
            return;
        }
        self.network_lost = false;
        self.reconnect_pending = true;
        self.begin_connect(Trigger::NetworkAvailable);
    }

    fn on_backend_event(&mut self, event: BackendEvent) {
        match event {
            BackendEvent::Initialized => {
                tracing::debug!(device_id = %self.device.device_id, "video backend initialized");
            }
            BackendEvent::Buffering => self.buffering = true,
            BackendEvent::BufferingDone => self.buffering = false,
            BackendEvent::Error { code, message } => {
                if self.phase != SessionPhase::Streaming {
                    tracing::debug!(?code, %message, phase = ?self.phase, "ignoring backend error");
                    return;
                }
                let err = EdgeError::Playback { code, message };
                tracing::warn!(device_id = %self.device.device_id, error = %err, "playback failed");
                self.phase = SessionPhase::Error;
                self.buffering = false;
                if let Some(session_error) = SessionError::from_error(&err) {
                    self.last_error = Some(session_error.clone());
                    self.notify(Notice::Error(session_error));
                }
            }
        }
    }

    fn teardown(&mut self) {
        self.live = None;
        self.queued = None;

        self.backend.stop();
        if let Some(tunnel) = self.tunnel.take() {
            if let Err(e) = tunnel.close() {
                tracing::warn!(device_id = %self.device.device_id, error = %e, "could not close tunnel on teardown");
            }
        }

        self.descriptor = None;
        self.uri = None;
        self.effective_path = None;
        self.phase = SessionPhase::Idle;
        self.paused = false;
        self.buffering = false;
        self.busy.set(false);
        self.registry_forwarder.abort();
    }

    fn notify(&self, notice: Notice) {
        let _ = self.notices.send(notice);
    }

    fn publish(&self) {
        let streaming = self.phase == SessionPhase::Streaming;
        self.state_tx.send_replace(SessionSnapshot {
            phase: self.phase,
            busy: self.busy.is_busy(),
            paused: self.paused,
            buffering: self.buffering,
            last_error: self.last_error.clone(),
            reconnect_pending: self.reconnect_pending,
            descriptor: if streaming { self.descriptor.clone() } else { None },
            tunnel: if streaming { self.tunnel.clone() } else { None },
            uri: self.uri.clone(),
            effective_path: self.effective_path.clone(),
            placeholder_path: self.placeholder_path.clone(),
            attempt: self.applied,
        });
    }
}

async fn forward_registry(mut events: broadcast::Receiver<RegistryEvent>, mailbox: Mailbox) {
    loop {
        match events.recv().await {
            Ok(event) => {
                if mailbox
                    .send(Message::Event(SessionEvent::Registry(event)))
                    .is_err()
                {
                    break;
                }
            }
            Err(broadcast::error::RecvError::Lagged(skipped)) => {
                tracing::warn!(skipped, "registry notifications lagged");
            }
            Err(broadcast::error::RecvError::Closed) => break,
        }
    }
}
