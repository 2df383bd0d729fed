//! Transport contract for the vmelink controller core.
//!
//! The physical links (USB FIFO chip, UDP sockets) live outside this
//! workspace; the controller only needs the blocking byte capability
//! defined here, plus the packet accounting helpers that packetized links
//! share.

pub mod error;
pub mod loss;
pub mod traits;

pub use error::{Result, TransportError};
pub use loss::{
    calc_packet_loss, PacketChannelCounters, PipeCounters, PACKET_CHANNEL_COUNT,
};
pub use traits::{BusTransport, ConnectionType, DEFAULT_READ_TIMEOUT, DEFAULT_WRITE_TIMEOUT};
