use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};
use std::thread::JoinHandle;

use gst::glib;
use parking_lot::Mutex;

use edge_video::{BackendErrorCode, BackendEvent, BackendEvents};

/// How long one bus poll blocks before re-checking the running flag.
const POLL_INTERVAL_MS: u64 = 100;

/// Thread translating playbin bus messages into backend events.
pub(crate) struct BusWatcher {
    running: Arc<AtomicBool>,
    thread: Option<JoinHandle<()>>,
}

impl BusWatcher {
    /// `buffering` is shared with the backend, which clears it on a new uri.
    pub(crate) fn spawn(bus: gst::Bus, events: BackendEvents, buffering: Arc<Mutex<bool>>) -> Self {
        let running = Arc::new(AtomicBool::new(true));
        let flag = running.clone();
        let thread = std::thread::spawn(move || watch(bus, events, buffering, flag));
        Self {
            running,
            thread: Some(thread),
        }
    }

    pub(crate) fn stop(&mut self) {
        self.running.store(false, Ordering::SeqCst);
        if let Some(thread) = self.thread.take() {
            let _ = thread.join();
        }
    }
}

fn watch(bus: gst::Bus, events: BackendEvents, buffering: Arc<Mutex<bool>>, running: Arc<AtomicBool>) {
    while running.load(Ordering::SeqCst) {
        let Some(message) = bus.timed_pop(gst::ClockTime::from_mseconds(POLL_INTERVAL_MS)) else {
            continue;
        };
        let event = translate(&message, &mut buffering.lock());
        if let Some(event) = event {
            if !events.emit(event) {
                tracing::debug!("session gone, bus watcher exiting");
                break;
            }
        }
    }
}

/// Map a bus message to a backend event. `buffering` tracks whether a
/// `Buffering` event is outstanding so each is paired with one `BufferingDone`.
pub(crate) fn translate(message: &gst::Message, buffering: &mut bool) -> Option<BackendEvent> {
    use gst::MessageView;

    match message.view() {
        MessageView::Error(err) => {
            let error = err.error();
            let mut text = error.message().to_string();
            if let Some(debug) = err.debug() {
                text = format!("{text} ({debug})");
            }
            tracing::warn!(error = %text, "playbin error");
            *buffering = false;
            Some(BackendEvent::Error {
                code: error_code(&error),
                message: text,
            })
        }
        MessageView::Buffering(b) => {
            let percent = b.percent();
            if percent < 100 && !*buffering {
                *buffering = true;
                Some(BackendEvent::Buffering)
            } else if percent >= 100 && *buffering {
                *buffering = false;
                Some(BackendEvent::BufferingDone)
            } else {
                None
            }
        }
        MessageView::Eos(_) => {
            tracing::info!("end of stream");
            None
        }
        _ => None,
    }
}

pub(crate) fn error_code(error: &glib::Error) -> BackendErrorCode {
    match error.kind::<gst::ResourceError>() {
        Some(gst::ResourceError::NotFound) => BackendErrorCode::NotFound,
        Some(gst::ResourceError::NotAuthorized) => BackendErrorCode::NotAuthorized,
        Some(_) => BackendErrorCode::Other,
        None => BackendErrorCode::WrongDomain,
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn resource_errors_map_to_codes() {
        let not_found = glib::Error::new(gst::ResourceError::NotFound, "no such stream");
        assert_eq!(error_code(&not_found), BackendErrorCode::NotFound);

        let denied = glib::Error::new(gst::ResourceError::NotAuthorized, "401");
        assert_eq!(error_code(&denied), BackendErrorCode::NotAuthorized);

        let busy = glib::Error::new(gst::ResourceError::Busy, "busy");
        assert_eq!(error_code(&busy), BackendErrorCode::Other);

        let decode = glib::Error::new(gst::StreamError::Decode, "bad frame");
        assert_eq!(error_code(&decode), BackendErrorCode::WrongDomain);
    }

    #[test]
    fn buffering_is_reported_once_per_stall() {
        gst::init().unwrap();
        let mut buffering = false;

        let low = gst::message::Buffering::new(10);
        let lower = gst::message::Buffering::new(40);
        let full = gst::message::Buffering::new(100);

        assert_eq!(translate(&low, &mut buffering), Some(BackendEvent::Buffering));
        assert_eq!(translate(&lower, &mut buffering), None);
        assert_eq!(translate(&full, &mut buffering), Some(BackendEvent::BufferingDone));
        assert_eq!(translate(&full, &mut buffering), None);
    }
}
