//! GStreamer video backend for edge video sessions.
//!
//! [`GstBackend`] wraps a `playbin` element. The session hands it the local
//! tunnel URI and drives it through Playing / Paused / Null; a bus thread
//! turns error and buffering messages into session backend events.
//!
//! ```no_run
//! use std::sync::Arc;
//! # fn run(registry: Arc<dyn edge_video::ConnectionRegistry>, device: Arc<edge_video::Device>) -> edge_video::Result<()> {
//! let backend = edge_video_gst::GstBackend::new()?;
//! let (session, _notices) = edge_video::SessionManager::spawn(
//!     device,
//!     registry,
//!     Box::new(backend),
//!     edge_video::SessionConfig::default(),
//! );
//! session.start();
//! # Ok(())
//! # }
//! ```
//!
//! Requires the GStreamer runtime with the `playbin` and RTSP source plugins.

mod bus;

use std::sync::Arc;

use gst::prelude::*;
use parking_lot::Mutex;

use edge_video::{BackendEvent, BackendEvents, EdgeError, Result, VideoBackend};

use bus::BusWatcher;

/// Name given to the playbin element.
const ELEMENT_NAME: &str = "edge-video-player";

/// Jitter buffer size of the RTSP source, in milliseconds.
pub const RTSP_LATENCY_MS: u32 = 200;

/// The tunnel only forwards TCP, so RTP must be interleaved on the RTSP connection.
const RTSP_PROTOCOLS: &str = "tcp";

pub struct GstBackend {
    playbin: gst::Element,
    watcher: Option<BusWatcher>,
    buffering: Arc<Mutex<bool>>,
}

impl GstBackend {
    /// Initialize GStreamer and create the playbin.
    pub fn new() -> Result<Self> {
        gst::init().map_err(|e| EdgeError::Other(format!("GStreamer init failed: {e}")))?;

        let playbin = gst::ElementFactory::make("playbin")
            .name(ELEMENT_NAME)
            .build()
            .map_err(|e| EdgeError::Other(format!("could not create playbin: {e}")))?;

        playbin.connect("source-setup", false, |values| {
            if let Some(Ok(source)) = values.get(1).map(|v| v.get::<gst::Element>()) {
                configure_source(&source);
            }
            None
        });

        Ok(Self {
            playbin,
            watcher: None,
            buffering: Arc::new(Mutex::new(false)),
        })
    }

    /// The underlying element, e.g. to set a video sink.
    pub fn playbin(&self) -> &gst::Element {
        &self.playbin
    }

    /// Whether the stream is currently stalled for buffering.
    pub fn is_buffering(&self) -> bool {
        *self.buffering.lock()
    }

    fn set_state(&self, state: gst::State) -> Result<()> {
        self.playbin
            .set_state(state)
            .map(|_| ())
            .map_err(|e| EdgeError::Other(format!("could not set playbin to {state:?}: {e}")))
    }
}

/// Force interleaved TCP and a short latency on `rtspsrc`; other sources are left alone.
pub fn configure_source(source: &gst::Element) {
    let is_rtspsrc = source
        .factory()
        .is_some_and(|factory| factory.name().as_str() == "rtspsrc");
    if !is_rtspsrc {
        return;
    }
    source.set_property_from_str("protocols", RTSP_PROTOCOLS);
    source.set_property("latency", RTSP_LATENCY_MS);
    tracing::debug!(latency_ms = RTSP_LATENCY_MS, "rtspsrc set to interleaved tcp");
}

impl VideoBackend for GstBackend {
    fn attach(&mut self, events: BackendEvents) {
        match self.playbin.bus() {
            Some(bus) => {
                let watcher = BusWatcher::spawn(bus, events.clone(), self.buffering.clone());
                self.watcher = Some(watcher);
            }
            None => tracing::warn!("playbin has no bus, backend events disabled"),
        }
        events.emit(BackendEvent::Initialized);
    }

    fn set_uri(&mut self, uri: &str) -> Result<()> {
        // playbin only picks up a new uri from Null/Ready.
        self.set_state(gst::State::Null)?;
        self.playbin.set_property("uri", uri);
        *self.buffering.lock() = false;
        tracing::debug!(%uri, "playbin uri set");
        Ok(())
    }

    fn play(&mut self) -> Result<()> {
        self.set_state(gst::State::Playing)
    }

    fn pause(&mut self) -> Result<()> {
        self.set_state(gst::State::Paused)
    }

    fn stop(&mut self) {
        if let Err(e) = self.set_state(gst::State::Null) {
            tracing::warn!(error = %e, "could not stop playbin");
        }
    }
}

impl Drop for GstBackend {
    fn drop(&mut self) {
        if let Some(mut watcher) = self.watcher.take() {
            watcher.stop();
        }
        let _ = self.playbin.set_state(gst::State::Null);
    }
}
