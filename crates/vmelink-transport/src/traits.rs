use std::time::Duration;

use vmelink_proto::Pipe;

use crate::error::Result;

/// Default per-pipe write timeout.
pub const DEFAULT_WRITE_TIMEOUT: Duration = Duration::from_millis(500);

/// Default per-pipe read timeout.
pub const DEFAULT_READ_TIMEOUT: Duration = Duration::from_millis(500);

/// Physical link kind of a transport implementation.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ConnectionType {
    Usb,
    Eth,
}

/// Blocking byte transport to the controller over one physical link.
///
/// Implementations expose the two logical pipes of the device and must be
/// callable from multiple threads: the controller serializes pipe access
/// with its own locks, but `connection_type`, `connection_info` and the
/// timeout accessors may race with in-flight I/O, so implementations carry
/// whatever interior locking they need.
///
/// `read` and `write` block up to the configured pipe timeout. Partial
/// transfers return the byte count actually moved; a timeout with zero
/// progress returns [`TransportError::Timeout`](crate::TransportError::Timeout).
pub trait BusTransport: Send + Sync {
    fn connect(&self) -> Result<()>;
    fn disconnect(&self) -> Result<()>;
    fn is_connected(&self) -> bool;

    fn connection_type(&self) -> ConnectionType;
    fn connection_info(&self) -> String;

    fn write(&self, pipe: Pipe, buf: &[u8]) -> Result<usize>;
    fn read(&self, pipe: Pipe, buf: &mut [u8]) -> Result<usize>;

    fn set_write_timeout(&self, pipe: Pipe, timeout: Duration) -> Result<()>;
    fn set_read_timeout(&self, pipe: Pipe, timeout: Duration) -> Result<()>;
    fn write_timeout(&self, pipe: Pipe) -> Duration;
    fn read_timeout(&self, pipe: Pipe) -> Duration;

    /// When set, the controller forces the device into a quiescent state
    /// (triggers disarmed, DAQ mode off, pipes drained) right after the
    /// link comes up.
    fn set_disable_triggers_on_connect(&self, disable: bool);
    fn disable_triggers_on_connect(&self) -> bool;
}
