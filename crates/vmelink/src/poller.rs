//! Background poller draining stack error notifications.
//!
//! One poller thread runs per live connection. Whenever no foreground
//! transaction holds the command-pipe lock it attempts a single best-effort
//! framed read and folds whatever arrives into the shared error counters.
//! It must never terminate the process or the connection: every error is
//! logged and swallowed, and the thread exits only when told to quit.

use std::sync::{Arc, Condvar, Mutex};
use std::thread::JoinHandle;
use std::time::Duration;

use tracing::{debug, trace, warn};

use vmelink_transport::BusTransport;

use crate::counters::{update_stack_error_counters, StackErrorCounters};
use crate::dialog::Dialog;

/// Backoff interval after an empty read or a connection-level error.
pub const POLL_INTERVAL: Duration = Duration::from_secs(1);

/// Cooperative quit flag with a condvar so backoff sleeps end promptly on
/// shutdown.
pub(crate) struct PollerSignal {
    quit: Mutex<bool>,
    cv: Condvar,
}

impl PollerSignal {
    pub(crate) fn new() -> Self {
        PollerSignal {
            quit: Mutex::new(false),
            cv: Condvar::new(),
        }
    }

    fn quit_requested(&self) -> bool {
        *self.quit.lock().unwrap_or_else(|p| p.into_inner())
    }

    /// Sleeps up to `timeout` or until quit is signalled. Returns true if
    /// quit was requested.
    fn wait(&self, timeout: Duration) -> bool {
        let guard = self.quit.lock().unwrap_or_else(|p| p.into_inner());
        let (guard, _) = self
            .cv
            .wait_timeout_while(guard, timeout, |quit| !*quit)
            .unwrap_or_else(|p| p.into_inner());
        *guard
    }

    pub(crate) fn signal_quit(&self) {
        *self.quit.lock().unwrap_or_else(|p| p.into_inner()) = true;
        self.cv.notify_all();
    }
}

pub(crate) struct PollerHandle {
    signal: Arc<PollerSignal>,
    thread: JoinHandle<()>,
}

impl PollerHandle {
    /// Signals quit and joins the thread. Must run before the shared state
    /// the poller touches is dropped.
    pub(crate) fn stop(self) {
        self.signal.signal_quit();
        let _ = self.thread.join();
    }
}

pub(crate) fn spawn(
    transport: Arc<dyn BusTransport>,
    cmd: Arc<Mutex<Dialog>>,
    suspend: Arc<Mutex<()>>,
    counters: Arc<Mutex<StackErrorCounters>>,
) -> PollerHandle {
    let signal = Arc::new(PollerSignal::new());
    let thread_signal = Arc::clone(&signal);

    let thread = std::thread::Builder::new()
        .name("vmelink-error-poller".into())
        .spawn(move || {
            poll_loop(&*transport, &cmd, &suspend, &counters, &thread_signal);
        })
        .expect("failed to spawn error poller thread");

    PollerHandle { signal, thread }
}

fn poll_loop(
    transport: &dyn BusTransport,
    cmd: &Mutex<Dialog>,
    suspend: &Mutex<()>,
    counters: &Mutex<StackErrorCounters>,
    signal: &PollerSignal,
) {
    debug!("error notification poller entering loop");

    while !signal.quit_requested() {
        let backoff = {
            // The suspend gate is held for the read attempt only, so a
            // suspended caller never waits out a backoff sleep.
            let _gate = suspend.lock().unwrap_or_else(|p| p.into_inner());
            let mut dialog = cmd.lock().unwrap_or_else(|p| p.into_inner());

            match dialog.read_known_buffer(transport) {
                Ok(buffer) => {
                    trace!(words = buffer.len(), "poller consumed notification buffer");
                    let mut counters = counters.lock().unwrap_or_else(|p| p.into_inner());
                    update_stack_error_counters(&mut counters, &buffer);
                    false
                }
                Err(err) if err.is_timeout() => true,
                Err(err) if err.is_connection_error() => {
                    debug!(error = %err, "poller read failed, link down");
                    true
                }
                Err(err) => {
                    // Typically a stray word that is no frame header; it
                    // was consumed, so keep draining without backoff.
                    warn!(error = %err, "poller read failed");
                    let stray = dialog.last_response().to_vec();
                    if !stray.is_empty() {
                        let mut counters = counters.lock().unwrap_or_else(|p| p.into_inner());
                        update_stack_error_counters(&mut counters, &stray);
                    }
                    false
                }
            }
        };

        if backoff && signal.wait(POLL_INTERVAL) {
            break;
        }
    }

    debug!("error notification poller exiting");
}
