use std::sync::Arc;
use std::time::Duration;

use parking_lot::Mutex;
use tokio::sync::mpsc::UnboundedSender;
use tokio::task::JoinHandle;

use crate::session::state::Notice;

/// Busy flag with a delayed spinner.
///
/// Going busy schedules [`Notice::ShowSpinner`] after `delay`; going idle
/// first cancels it, so attempts that finish quickly never show a spinner.
/// [`Notice::HideSpinner`] is only sent if the spinner was shown.
pub(crate) struct BusyIndicator {
    delay: Duration,
    notices: UnboundedSender<Notice>,
    spinner: Arc<Mutex<Spinner>>,
    pending: Option<JoinHandle<()>>,
    busy: bool,
}

#[derive(Default)]
struct Spinner {
    shown: bool,
    /// Bumped on every `set`; a deferred show only fires for its own generation.
    generation: u64,
}

impl BusyIndicator {
    pub(crate) fn new(delay: Duration, notices: UnboundedSender<Notice>) -> Self {
        Self {
            delay,
            notices,
            spinner: Arc::new(Mutex::new(Spinner::default())),
            pending: None,
            busy: false,
        }
    }

    pub(crate) fn is_busy(&self) -> bool {
        self.busy
    }

    pub(crate) fn set(&mut self, busy: bool) {
        if let Some(task) = self.pending.take() {
            task.abort();
        }
        self.busy = busy;

        let generation = {
            let mut spinner = self.spinner.lock();
            spinner.generation += 1;
            if !busy && spinner.shown {
                spinner.shown = false;
                let _ = self.notices.send(Notice::HideSpinner);
            }
            spinner.generation
        };

        if busy {
            let delay = self.delay;
            let spinner = self.spinner.clone();
            let notices = self.notices.clone();
            self.pending = Some(tokio::spawn(async move {
                tokio::time::sleep(delay).await;
                let mut spinner = spinner.lock();
                if spinner.generation == generation && !spinner.shown {
                    spinner.shown = true;
                    let _ = notices.send(Notice::ShowSpinner);
                }
            }));
        }
    }
}

impl Drop for BusyIndicator {
    fn drop(&mut self) {
        if let Some(task) = self.pending.take() {
            task.abort();
        }
    }
}
