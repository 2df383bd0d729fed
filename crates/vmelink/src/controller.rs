//! The connection object tying transport, dialog engine, locks and the
//! background poller together.

use std::sync::{Arc, Mutex, MutexGuard};
use std::time::Duration;

use tracing::{debug, info, warn};

use vmelink_proto::{Pipe, StackCommand, StackCommandBuilder, StackCommandType, SuperCommandBuilder, VmeDataWidth};
use vmelink_transport::{BusTransport, ConnectionType, PipeCounters};

use crate::counters::StackErrorCounters;
use crate::dialog::Dialog;
use crate::error::Result;
use crate::poller::{self, PollerHandle};
use crate::setup;

/// Attempts at the disable-all sequence during connection bring-up.
const DISABLE_TRIGGER_RETRY_COUNT: usize = 5;

/// Blocks the error poller's next read attempt for its lifetime.
///
/// In-flight poller reads are never interrupted; the gate only prevents the
/// next one from starting, so suspension is cooperative and bounded.
pub struct PollerSuspendGuard<'a> {
    _guard: MutexGuard<'a, ()>,
}

struct Inner {
    transport: Arc<dyn BusTransport>,
    cmd: Arc<Mutex<Dialog>>,
    data: Arc<Mutex<PipeCounters>>,
    counters: Arc<Mutex<StackErrorCounters>>,
    suspend: Arc<Mutex<()>>,
    poller: Option<PollerHandle>,
}

impl Drop for Inner {
    fn drop(&mut self) {
        // Join the poller before the shared state it references goes away.
        if let Some(poller) = self.poller.take() {
            poller.stop();
        }
    }
}

/// Handle to one controller connection.
///
/// Cheaply cloneable; all clones share the transport, the pipe locks, the
/// error counters and one background notification poller. The poller is
/// stopped and joined when the last clone is dropped.
///
/// Locking discipline: the command pipe lock owns the [`Dialog`] state, the
/// data pipe lock owns the raw data-pipe counters. Operations needing both
/// pipes go through a single acquire-both helper that always takes the
/// command lock first, making lock-order inversion impossible by
/// construction. No fairness beyond mutual exclusion is guaranteed, and
/// blocking I/O is never cancelled mid-flight; callers rely on the
/// transport's pipe timeouts.
#[derive(Clone)]
pub struct Controller {
    inner: Arc<Inner>,
}

impl Controller {
    /// Wraps a transport and starts the background notification poller.
    pub fn new(transport: Arc<dyn BusTransport>) -> Controller {
        let counters = Arc::new(Mutex::new(StackErrorCounters::default()));
        let cmd = Arc::new(Mutex::new(Dialog::new(Arc::clone(&counters))));
        let data = Arc::new(Mutex::new(PipeCounters::default()));
        let suspend = Arc::new(Mutex::new(()));

        let poller = poller::spawn(
            Arc::clone(&transport),
            Arc::clone(&cmd),
            Arc::clone(&suspend),
            Arc::clone(&counters),
        );

        Controller {
            inner: Arc::new(Inner {
                transport,
                cmd,
                data,
                counters,
                suspend,
                poller: Some(poller),
            }),
        }
    }

    fn lock_cmd(&self) -> MutexGuard<'_, Dialog> {
        self.inner.cmd.lock().unwrap_or_else(|p| p.into_inner())
    }

    fn lock_data(&self) -> MutexGuard<'_, PipeCounters> {
        self.inner.data.lock().unwrap_or_else(|p| p.into_inner())
    }

    /// The one way to hold both pipe locks: command first, then data.
    fn lock_both(&self) -> (MutexGuard<'_, Dialog>, MutexGuard<'_, PipeCounters>) {
        let cmd = self.lock_cmd();
        let data = self.lock_data();
        (cmd, data)
    }

    fn transport(&self) -> &dyn BusTransport {
        &*self.inner.transport
    }

    // --- lifecycle -------------------------------------------------------

    /// Establishes the link. When the transport requests it, the device is
    /// forced quiescent afterwards: triggers disarmed, DAQ mode off, stale
    /// command-pipe data drained. The whole sequence runs under both pipe
    /// locks with the poller suspended.
    pub fn connect(&self) -> Result<()> {
        let _suspended = self.suspend_error_polling();
        let (mut dialog, _data) = self.lock_both();

        self.transport().connect()?;
        info!(info = %self.transport().connection_info(), "link established");

        if self.transport().disable_triggers_on_connect() {
            self.post_connect_cleanup(&mut dialog)?;
        }

        Ok(())
    }

    /// Disarms all triggers, turns off DAQ mode and drains buffered
    /// command-pipe data left over from a previous session.
    fn post_connect_cleanup(&self, dialog: &mut Dialog) -> Result<()> {
        debug!("post connect cleanup started");

        let builder = setup::disable_all_builder();
        let mut attempts = 0;
        loop {
            match dialog.super_transaction(self.transport(), &builder) {
                Ok(_) => break,
                Err(err) if err.is_connection_error() => return Err(err),
                Err(err) => {
                    attempts += 1;
                    if attempts >= DISABLE_TRIGGER_RETRY_COUNT {
                        return Err(err);
                    }
                    warn!(error = %err, attempts, "disable-all failed, retrying");
                }
            }
        }

        // Drain stale buffers until the pipe runs dry.
        let mut drained = 0usize;
        loop {
            match dialog.read_known_buffer(self.transport()) {
                Ok(buffer) => drained += buffer.len(),
                Err(err) if err.is_timeout() => break,
                Err(err) if err.is_connection_error() => return Err(err),
                Err(_) => drained += 1,
            }
        }

        debug!(drained, "post connect cleanup done");
        Ok(())
    }

    pub fn disconnect(&self) -> Result<()> {
        let _suspended = self.suspend_error_polling();
        let _guards = self.lock_both();
        self.transport().disconnect()?;
        info!("link closed");
        Ok(())
    }

    pub fn is_connected(&self) -> bool {
        let _guards = self.lock_both();
        self.transport().is_connected()
    }

    // Thread-safe by transport contract, no locks needed.
    pub fn connection_type(&self) -> ConnectionType {
        self.transport().connection_type()
    }

    pub fn connection_info(&self) -> String {
        self.transport().connection_info()
    }

    pub fn set_disable_triggers_on_connect(&self, disable: bool) {
        let _guards = self.lock_both();
        self.transport().set_disable_triggers_on_connect(disable);
    }

    pub fn disable_triggers_on_connect(&self) -> bool {
        let _guards = self.lock_both();
        self.transport().disable_triggers_on_connect()
    }

    // --- raw pipe access -------------------------------------------------

    pub fn write(&self, pipe: Pipe, buf: &[u8]) -> Result<usize> {
        match pipe {
            Pipe::Command => {
                let _dialog = self.lock_cmd();
                Ok(self.transport().write(pipe, buf)?)
            }
            Pipe::Data => {
                let mut counters = self.lock_data();
                let written = self.transport().write(pipe, buf)?;
                counters.record_write(written);
                Ok(written)
            }
        }
    }

    pub fn read(&self, pipe: Pipe, buf: &mut [u8]) -> Result<usize> {
        match pipe {
            Pipe::Command => {
                let _dialog = self.lock_cmd();
                Ok(self.transport().read(pipe, buf)?)
            }
            Pipe::Data => {
                let mut counters = self.lock_data();
                match self.transport().read(pipe, buf) {
                    Ok(read) => {
                        counters.record_read(read);
                        Ok(read)
                    }
                    Err(err) => {
                        if err.is_timeout() {
                            counters.record_timeout();
                        }
                        Err(err.into())
                    }
                }
            }
        }
    }

    pub fn set_read_timeout(&self, pipe: Pipe, timeout: Duration) -> Result<()> {
        let _guard = self.lock_pipe(pipe);
        Ok(self.transport().set_read_timeout(pipe, timeout)?)
    }

    pub fn set_write_timeout(&self, pipe: Pipe, timeout: Duration) -> Result<()> {
        let _guard = self.lock_pipe(pipe);
        Ok(self.transport().set_write_timeout(pipe, timeout)?)
    }

    pub fn read_timeout(&self, pipe: Pipe) -> Duration {
        let _guard = self.lock_pipe(pipe);
        self.transport().read_timeout(pipe)
    }

    pub fn write_timeout(&self, pipe: Pipe) -> Duration {
        let _guard = self.lock_pipe(pipe);
        self.transport().write_timeout(pipe)
    }

    fn lock_pipe(&self, pipe: Pipe) -> PipeGuard<'_> {
        match pipe {
            Pipe::Command => PipeGuard {
                _cmd: Some(self.lock_cmd()),
                _data: None,
            },
            Pipe::Data => PipeGuard {
                _cmd: None,
                _data: Some(self.lock_data()),
            },
        }
    }

    /// Raw transfer statistics of the data pipe.
    pub fn data_pipe_counters(&self) -> PipeCounters {
        *self.lock_data()
    }

    // --- command dialog --------------------------------------------------

    pub fn read_register(&self, address: u16) -> Result<u32> {
        self.lock_cmd().read_register(self.transport(), address)
    }

    pub fn write_register(&self, address: u16, value: u32) -> Result<()> {
        self.lock_cmd().write_register(self.transport(), address, value)
    }

    pub fn vme_read(&self, address: u32, amod: u8, data_width: VmeDataWidth) -> Result<u32> {
        self.lock_cmd()
            .vme_read(self.transport(), address, amod, data_width)
    }

    pub fn vme_write(
        &self,
        address: u32,
        value: u32,
        amod: u8,
        data_width: VmeDataWidth,
    ) -> Result<()> {
        self.lock_cmd()
            .vme_write(self.transport(), address, value, amod, data_width)
    }

    pub fn vme_block_read(&self, address: u32, amod: u8, max_transfers: u16) -> Result<Vec<u32>> {
        self.lock_cmd()
            .vme_block_read(self.transport(), address, amod, max_transfers)
    }

    pub fn super_transaction(&self, builder: &SuperCommandBuilder) -> Result<Vec<u32>> {
        self.lock_cmd().super_transaction(self.transport(), builder)
    }

    pub fn mirror_transaction(&self, request: &[u32]) -> Result<Vec<u32>> {
        self.lock_cmd().mirror_transaction(self.transport(), request)
    }

    pub fn upload_stack(
        &self,
        output_pipe: u8,
        offset_bytes: u16,
        stack: &StackCommandBuilder,
    ) -> Result<Vec<u32>> {
        self.lock_cmd()
            .upload_stack(self.transport(), output_pipe, offset_bytes, &stack.commands())
    }

    pub fn exec_immediate_stack(&self, offset_bytes: u16) -> Result<()> {
        self.lock_cmd()
            .exec_immediate_stack(self.transport(), offset_bytes)
    }

    pub fn stack_transaction(&self, stack: &StackCommandBuilder) -> Result<Vec<u32>> {
        self.lock_cmd()
            .stack_transaction(self.transport(), &stack.commands())
    }

    /// One best-effort framed read on the command pipe, the format used
    /// for unsolicited notification frames.
    pub fn read_known_buffer(&self) -> Result<Vec<u32>> {
        self.lock_cmd().read_known_buffer(self.transport())
    }

    /// Copy of the last response buffer of the command dialog.
    pub fn response_buffer(&self) -> Vec<u32> {
        self.lock_cmd().last_response().to_vec()
    }

    /// Executes a command list directly, honoring software delays.
    ///
    /// The list is split at every `SoftwareDelay`; each run executes as its
    /// own immediate stack transaction and the calling thread sleeps for
    /// the delay in between, without holding any pipe lock. Returns the
    /// concatenated output words of all runs.
    pub fn run_commands(&self, builder: &StackCommandBuilder) -> Result<Vec<u32>> {
        let mut results = Vec::new();
        let mut run: Vec<StackCommand> = Vec::new();

        for cmd in builder.commands() {
            if cmd.cmd_type == StackCommandType::SoftwareDelay {
                if !run.is_empty() {
                    let response = self
                        .lock_cmd()
                        .stack_transaction(self.transport(), &run)?;
                    results.extend_from_slice(&response[1..]);
                    run.clear();
                }
                std::thread::sleep(Duration::from_millis(cmd.value as u64));
            } else {
                run.push(cmd);
            }
        }

        if !run.is_empty() {
            let response = self.lock_cmd().stack_transaction(self.transport(), &run)?;
            results.extend_from_slice(&response[1..]);
        }

        Ok(results)
    }

    // --- stack error counters -------------------------------------------

    /// Snapshot of the shared error counters.
    pub fn stack_error_counters(&self) -> StackErrorCounters {
        self.inner
            .counters
            .lock()
            .unwrap_or_else(|p| p.into_inner())
            .clone()
    }

    pub fn clear_stack_error_counters(&self) {
        self.inner
            .counters
            .lock()
            .unwrap_or_else(|p| p.into_inner())
            .clear();
    }

    /// Blocks the poller from starting new reads while the guard lives.
    pub fn suspend_error_polling(&self) -> PollerSuspendGuard<'_> {
        PollerSuspendGuard {
            _guard: self.inner.suspend.lock().unwrap_or_else(|p| p.into_inner()),
        }
    }
}

struct PipeGuard<'a> {
    _cmd: Option<MutexGuard<'a, Dialog>>,
    _data: Option<MutexGuard<'a, PipeCounters>>,
}
