//! Sequence-number accounting for packetized links.
//!
//! Ethernet transports stamp every packet with a 16-bit sequence number per
//! logical packet channel. Loss shows up as gaps between consecutive
//! numbers; the numbers live in Z/2^16, so the gap computation has to
//! survive wraparound.

use tracing::warn;

/// Logical packet channels of a packetized link.
pub const PACKET_CHANNEL_COUNT: usize = 3;

/// Packets lost between the previously seen and the current sequence
/// number: the forward distance from `last + 1` to `current` modulo 2^16,
/// mapped into the signed range.
///
/// A result of 0 means no loss. Negative results indicate a duplicate or
/// out-of-order packet (`calc_packet_loss(5, 5) == -1`); they are returned
/// as-is so callers can account for the anomaly instead of silently
/// swallowing it.
pub fn calc_packet_loss(last_number: u16, current_number: u16) -> i32 {
    let expected = last_number.wrapping_add(1);
    current_number.wrapping_sub(expected) as i16 as i32
}

/// Per-channel packet statistics for a packetized link.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct PacketChannelCounters {
    pub received_packets: u64,
    pub received_bytes: u64,
    pub lost_packets: u64,
    pub out_of_order_packets: u64,
    pub last_packet_number: Option<u16>,
}

impl PacketChannelCounters {
    /// Folds one received packet into the counters and returns the loss
    /// value computed against the previous sequence number.
    pub fn record_packet(&mut self, packet_number: u16, payload_bytes: usize) -> i32 {
        self.received_packets += 1;
        self.received_bytes += payload_bytes as u64;

        let loss = match self.last_packet_number {
            Some(last) => calc_packet_loss(last, packet_number),
            None => 0,
        };

        if loss > 0 {
            self.lost_packets += loss as u64;
            warn!(loss, packet_number, "packet loss detected");
        } else if loss < 0 {
            self.out_of_order_packets += 1;
            warn!(loss, packet_number, "out-of-order or duplicate packet");
        }

        self.last_packet_number = Some(packet_number);
        loss
    }
}

/// Raw transfer statistics for one pipe.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct PipeCounters {
    pub reads: u64,
    pub writes: u64,
    pub bytes_read: u64,
    pub bytes_written: u64,
    pub timeouts: u64,
}

impl PipeCounters {
    pub fn record_read(&mut self, bytes: usize) {
        self.reads += 1;
        self.bytes_read += bytes as u64;
    }

    pub fn record_write(&mut self, bytes: usize) {
        self.writes += 1;
        self.bytes_written += bytes as u64;
    }

    pub fn record_timeout(&mut self) {
        self.timeouts += 1;
    }
}
