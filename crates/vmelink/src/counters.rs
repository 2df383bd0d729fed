//! Shared counters fed by stack error notification frames.
//!
//! The controller emits unsolicited StackError frames on the command pipe
//! whenever an autonomously executing stack hits a fault. The background
//! poller and the foreground dialog demultiplexer both fold such frames
//! into one [`StackErrorCounters`] instance shared per connection.

use std::collections::{HashMap, VecDeque};

use vmelink_proto::stacks::STACK_COUNT;
use vmelink_proto::{extract_frame_info, FrameType};

/// Number of raw notification frames kept for diagnostics.
pub const RECENT_FRAME_CAPACITY: usize = 16;

/// Identity of one stack error: the program line that faulted and the
/// frame flags describing the fault.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct ErrorInfo {
    pub line: u16,
    pub flags: u8,
}

/// Cumulative stack error occurrence counts plus a rolling record of the
/// most recent raw notification frames.
///
/// Mutated exclusively by [`update_stack_error_counters`]; the only reset
/// is an explicit [`clear`](StackErrorCounters::clear).
#[derive(Debug, Clone)]
pub struct StackErrorCounters {
    /// Occurrence counts per stack id, keyed by error identity.
    pub stack_errors: [HashMap<ErrorInfo, u64>; STACK_COUNT as usize],
    /// Frames that were not well-formed stack error notifications.
    pub non_error_frames: u64,
    /// Header words of those frames, for diagnosing what arrived instead.
    pub non_error_headers: HashMap<u32, u64>,
    /// The most recent raw frames, newest last.
    pub recent_frames: VecDeque<Vec<u32>>,
}

impl Default for StackErrorCounters {
    fn default() -> Self {
        StackErrorCounters {
            stack_errors: std::array::from_fn(|_| HashMap::new()),
            non_error_frames: 0,
            non_error_headers: HashMap::new(),
            recent_frames: VecDeque::with_capacity(RECENT_FRAME_CAPACITY),
        }
    }
}

impl StackErrorCounters {
    pub fn clear(&mut self) {
        *self = StackErrorCounters::default();
    }

    /// Sum of all recorded stack error occurrences.
    pub fn total_error_count(&self) -> u64 {
        self.stack_errors
            .iter()
            .flat_map(|m| m.values())
            .sum()
    }
}

/// Folds one notification buffer into the counters.
///
/// A well-formed notification is a StackError frame with exactly one
/// payload word whose lower half carries the faulting line number. Anything
/// else is tallied as a non-error frame. Every frame lands in the rolling
/// record either way.
pub fn update_stack_error_counters(counters: &mut StackErrorCounters, frame: &[u32]) {
    let Some(&header) = frame.first() else {
        return;
    };

    let info = extract_frame_info(header);

    if info.frame_type == FrameType::StackError as u8
        && frame.len() == 2
        && (info.stack_id as usize) < STACK_COUNT as usize
    {
        let error = ErrorInfo {
            line: (frame[1] & 0xFFFF) as u16,
            flags: info.flags,
        };
        *counters.stack_errors[info.stack_id as usize]
            .entry(error)
            .or_insert(0) += 1;
    } else {
        counters.non_error_frames += 1;
        *counters.non_error_headers.entry(header).or_insert(0) += 1;
    }

    if counters.recent_frames.len() == RECENT_FRAME_CAPACITY {
        counters.recent_frames.pop_front();
    }
    counters.recent_frames.push_back(frame.to_vec());
}

#[cfg(test)]
mod tests {
    use vmelink_proto::{frame_flags, make_frame_header};

    use super::*;

    fn notification(stack_id: u8, flags: u8, line: u16) -> Vec<u32> {
        vec![
            make_frame_header(FrameType::StackError, stack_id, flags, 1),
            line as u32,
        ]
    }

    #[test]
    fn counts_by_stack_and_error_identity() {
        let mut c = StackErrorCounters::default();

        update_stack_error_counters(&mut c, &notification(1, frame_flags::TIMEOUT, 3));
        update_stack_error_counters(&mut c, &notification(1, frame_flags::TIMEOUT, 3));
        update_stack_error_counters(&mut c, &notification(2, frame_flags::BUS_ERROR, 0));

        let key = ErrorInfo {
            line: 3,
            flags: frame_flags::TIMEOUT,
        };
        assert_eq!(c.stack_errors[1][&key], 2);
        assert_eq!(c.stack_errors[2].len(), 1);
        assert_eq!(c.total_error_count(), 3);
        assert_eq!(c.non_error_frames, 0);
    }

    #[test]
    fn malformed_frames_count_as_non_error() {
        let mut c = StackErrorCounters::default();

        // wrong frame type
        update_stack_error_counters(
            &mut c,
            &[make_frame_header(FrameType::SystemEvent, 0, 0, 0)],
        );
        // error frame without its payload word
        update_stack_error_counters(
            &mut c,
            &[make_frame_header(FrameType::StackError, 0, 0, 1)],
        );

        assert_eq!(c.non_error_frames, 2);
        assert_eq!(c.total_error_count(), 0);
        assert_eq!(c.non_error_headers.len(), 2);
    }

    #[test]
    fn empty_frames_are_ignored() {
        let mut c = StackErrorCounters::default();
        update_stack_error_counters(&mut c, &[]);
        assert_eq!(c.non_error_frames, 0);
        assert!(c.recent_frames.is_empty());
    }

    #[test]
    fn recent_frames_are_bounded() {
        let mut c = StackErrorCounters::default();
        for i in 0..(RECENT_FRAME_CAPACITY + 5) {
            update_stack_error_counters(&mut c, &notification(0, 0, i as u16));
        }

        assert_eq!(c.recent_frames.len(), RECENT_FRAME_CAPACITY);
        // oldest entries were dropped
        assert_eq!(c.recent_frames.front().unwrap()[1], 5);
    }

    #[test]
    fn clear_resets_everything() {
        let mut c = StackErrorCounters::default();
        update_stack_error_counters(&mut c, &notification(0, 0, 1));
        c.clear();

        assert_eq!(c.total_error_count(), 0);
        assert_eq!(c.non_error_frames, 0);
        assert!(c.recent_frames.is_empty());
    }
}
