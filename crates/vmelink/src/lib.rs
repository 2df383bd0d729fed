//! Driver-level protocol engine for a VME bus controller reachable over
//! USB or Ethernet.
//!
//! The [`Controller`] wraps a [`BusTransport`](vmelink_transport::BusTransport)
//! and provides mirror-verified command dialogs, stack upload and immediate
//! execution, readout stack setup, and a background poller aggregating the
//! unsolicited stack error notifications the device emits out-of-band.
//!
//! Concurrency model: plain blocking threads. Each connection owns two pipe
//! locks (command and data, always acquired in that order when both are
//! needed) plus one poller thread that reads the command pipe whenever no
//! foreground transaction holds its lock.

pub mod controller;
pub mod counters;
pub mod dialog;
pub mod error;
pub mod poller;
pub mod setup;

pub use controller::{Controller, PollerSuspendGuard};
pub use counters::{update_stack_error_counters, ErrorInfo, StackErrorCounters};
pub use dialog::{check_mirror, Dialog};
pub use error::{ControllerError, Result};
pub use poller::POLL_INTERVAL;
pub use setup::{
    disable_all_triggers_and_daq_mode, disable_daq_mode, enable_daq_mode,
    plan_readout_allocations, read_daq_mode, read_stack_contents, read_stack_info,
    reset_stack_offsets, setup_readout_stack_triggers, setup_readout_stacks,
    setup_readout_triggers, setup_stack_trigger, write_stack_trigger_value, StackAllocation,
    StackInfo,
};

pub use vmelink_proto as proto;
pub use vmelink_transport as transport;
