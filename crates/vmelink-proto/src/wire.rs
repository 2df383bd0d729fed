//! Wire-level constants shared by the command codec and the response parser.
//!
//! Every quantity on the wire is a 32-bit little-endian word. Two command
//! layers exist with different bit layouts:
//!
//! - Super commands (executed by the controller's command interpreter):
//!   a 16-bit tag in the upper half, a 16-bit argument in the lower half.
//! - Stack commands (VME operations inside an uploaded program): an 8-bit
//!   tag in bits `[31:24]`, an 8-bit argument in `[23:16]` and a 16-bit
//!   argument in `[15:0]`.
//!
//! Responses from the controller are framed buffers whose first word is a
//! header carrying frame type, originating stack, status flags and payload
//! length.

use serde::{Deserialize, Serialize};

/// Bytes per wire word.
pub const WORD_SIZE: usize = 4;

/// Number of logical pipes multiplexed over one physical link.
pub const PIPE_COUNT: usize = 2;

/// Output-pipe id that makes the controller discard stack readout data
/// instead of emitting it on a pipe.
pub const SUPPRESS_PIPE_OUTPUT: u8 = 2;

/// One of the two independent logical channels of the controller.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[repr(u8)]
pub enum Pipe {
    /// Command dialog and notification traffic.
    Command = 0,
    /// Bulk readout data produced by autonomously executing stacks.
    Data = 1,
}

impl Pipe {
    pub fn from_raw(raw: u8) -> Option<Pipe> {
        match raw {
            0 => Some(Pipe::Command),
            1 => Some(Pipe::Data),
            _ => None,
        }
    }

    pub fn as_u8(self) -> u8 {
        self as u8
    }
}

pub const SUPER_CMD_SHIFT: u32 = 16;
pub const SUPER_CMD_MASK: u32 = 0xFFFF;
pub const SUPER_ARG_MASK: u32 = 0xFFFF;

/// Framing tag opening every encoded super command buffer.
pub const CMD_BUFFER_START: u16 = 0xF100;
/// Framing tag closing every encoded super command buffer.
pub const CMD_BUFFER_END: u16 = 0xF200;

/// Tags of the commands understood by the controller's command interpreter.
///
/// The buffer start/end framing tags are deliberately not part of this
/// enum; they are emitted and consumed by the codec only.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[repr(u16)]
pub enum SuperCommandType {
    /// Opaque word echoed back by the controller, used to match dialogs.
    ReferenceWord = 0x0101,
    /// Read a controller-local register.
    ReadLocal = 0x0102,
    /// Read a block of consecutive controller-local registers.
    ReadLocalBlock = 0x0103,
    /// Write a controller-local register.
    WriteLocal = 0x0204,
    /// Soft-reset the controller.
    WriteReset = 0x0206,
}

impl SuperCommandType {
    pub fn from_tag(tag: u16) -> Option<SuperCommandType> {
        match tag {
            0x0101 => Some(SuperCommandType::ReferenceWord),
            0x0102 => Some(SuperCommandType::ReadLocal),
            0x0103 => Some(SuperCommandType::ReadLocalBlock),
            0x0204 => Some(SuperCommandType::WriteLocal),
            0x0206 => Some(SuperCommandType::WriteReset),
            _ => None,
        }
    }
}

pub const STACK_CMD_SHIFT: u32 = 24;
pub const STACK_CMD_MASK: u32 = 0xFF;
pub const STACK_ARG0_SHIFT: u32 = 16;
pub const STACK_ARG0_MASK: u32 = 0xFF;
pub const STACK_ARG1_MASK: u32 = 0xFFFF;

/// Tags of the commands a device-resident stack program is built from.
///
/// `Invalid` and `SoftwareDelay` are host-side extensions of the wire
/// command set: `Invalid` marks a default-constructed command and
/// `SoftwareDelay` suspends direct immediate execution on the host. Neither
/// has a wire encoding; the tag value 0xED is unused by the device protocol.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[repr(u8)]
pub enum StackCommandType {
    Invalid = 0x00,
    StackStart = 0xF3,
    StackEnd = 0xF4,
    VmeRead = 0x12,
    VmeMbltSwapped = 0x13,
    SignallingVmeRead = 0x32,
    VmeWrite = 0x23,
    WriteMarker = 0xC2,
    WriteSpecial = 0xC1,
    WriteSignalWord = 0xC3,
    SoftwareDelay = 0xED,
}

impl StackCommandType {
    pub fn from_tag(tag: u8) -> Option<StackCommandType> {
        match tag {
            0xF3 => Some(StackCommandType::StackStart),
            0xF4 => Some(StackCommandType::StackEnd),
            0x12 => Some(StackCommandType::VmeRead),
            0x13 => Some(StackCommandType::VmeMbltSwapped),
            0x32 => Some(StackCommandType::SignallingVmeRead),
            0x23 => Some(StackCommandType::VmeWrite),
            0xC2 => Some(StackCommandType::WriteMarker),
            0xC1 => Some(StackCommandType::WriteSpecial),
            0xC3 => Some(StackCommandType::WriteSignalWord),
            _ => None,
        }
    }

    /// True for tags the device protocol defines, false for the host-side
    /// extension values.
    pub fn is_wire_type(self) -> bool {
        !matches!(
            self,
            StackCommandType::Invalid | StackCommandType::SoftwareDelay
        )
    }
}

/// VME data access width.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[repr(u16)]
pub enum VmeDataWidth {
    D16 = 0x1,
    D32 = 0x2,
}

impl VmeDataWidth {
    pub fn from_wire(value: u16) -> Option<VmeDataWidth> {
        match value {
            0x1 => Some(VmeDataWidth::D16),
            0x2 => Some(VmeDataWidth::D32),
            _ => None,
        }
    }

    /// Mask applied to single-read results of this width.
    pub fn value_mask(self) -> u32 {
        match self {
            VmeDataWidth::D16 => 0xFFFF,
            VmeDataWidth::D32 => 0xFFFF_FFFF,
        }
    }
}

impl Default for VmeDataWidth {
    fn default() -> Self {
        VmeDataWidth::D16
    }
}

/// Transfer rate for 2eSST block cycles. Carried per stack command for
/// forward compatibility; the current command set does not encode it.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum Blk2eSstRate {
    Rate160MB,
    Rate276MB,
    Rate320MB,
}

impl Default for Blk2eSstRate {
    fn default() -> Self {
        Blk2eSstRate::Rate160MB
    }
}

/// VME address modifier constants.
pub mod amods {
    pub const A16: u8 = 0x2D;
    pub const A24: u8 = 0x39;
    pub const A32: u8 = 0x09;
    pub const BLT32: u8 = 0x0B;
    pub const MBLT64: u8 = 0x08;

    /// True if the modifier selects a block transfer cycle.
    pub fn is_block_mode(amod: u8) -> bool {
        matches!(amod, BLT32 | MBLT64)
    }
}

/// Frame types of the buffers the controller sends to the host.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
#[repr(u8)]
pub enum FrameType {
    /// Mirror response to a super command buffer.
    SuperFrame = 0xF1,
    /// Output of an executed stack.
    StackFrame = 0xF3,
    /// Block read data frame.
    BlockRead = 0xF5,
    /// Unsolicited stack error notification.
    StackError = 0xF7,
    /// Continuation of a fragmented stack frame.
    StackContinuation = 0xF9,
    /// Controller-generated system event.
    SystemEvent = 0xFA,
}

pub const FRAME_TYPE_SHIFT: u32 = 24;
pub const FRAME_TYPE_MASK: u32 = 0xFF;
pub const FRAME_STACK_SHIFT: u32 = 16;
pub const FRAME_STACK_MASK: u32 = 0xF;
pub const FRAME_FLAGS_SHIFT: u32 = 12;
pub const FRAME_FLAGS_MASK: u32 = 0xF;
pub const FRAME_LEN_MASK: u32 = 0xFFF;

/// Status flags carried in a frame header.
pub mod frame_flags {
    /// The VME bus did not answer within the device timeout.
    pub const TIMEOUT: u8 = 1 << 0;
    /// A bus error terminated the cycle.
    pub const BUS_ERROR: u8 = 1 << 1;
    /// The uploaded stack program was malformed.
    pub const SYNTAX_ERROR: u8 = 1 << 2;
    /// The frame is continued in a following StackContinuation frame.
    pub const CONTINUE: u8 = 1 << 3;
}

/// Decoded view of a response frame header word.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct FrameInfo {
    pub frame_type: u8,
    pub stack_id: u8,
    pub flags: u8,
    pub len: u16,
}

pub fn extract_frame_info(header: u32) -> FrameInfo {
    FrameInfo {
        frame_type: ((header >> FRAME_TYPE_SHIFT) & FRAME_TYPE_MASK) as u8,
        stack_id: ((header >> FRAME_STACK_SHIFT) & FRAME_STACK_MASK) as u8,
        flags: ((header >> FRAME_FLAGS_SHIFT) & FRAME_FLAGS_MASK) as u8,
        len: (header & FRAME_LEN_MASK) as u16,
    }
}

/// Composes a frame header word. The inverse of [`extract_frame_info`];
/// mainly useful for test devices and diagnostics tooling.
pub fn make_frame_header(frame_type: FrameType, stack_id: u8, flags: u8, len: u16) -> u32 {
    ((frame_type as u32) << FRAME_TYPE_SHIFT)
        | ((stack_id as u32 & FRAME_STACK_MASK) << FRAME_STACK_SHIFT)
        | ((flags as u32 & FRAME_FLAGS_MASK) << FRAME_FLAGS_SHIFT)
        | (len as u32 & FRAME_LEN_MASK)
}

pub fn frame_type_of(header: u32) -> u8 {
    ((header >> FRAME_TYPE_SHIFT) & FRAME_TYPE_MASK) as u8
}

pub fn is_super_frame(header: u32) -> bool {
    frame_type_of(header) == FrameType::SuperFrame as u8
}

pub fn is_stack_frame(header: u32) -> bool {
    frame_type_of(header) == FrameType::StackFrame as u8
}

pub fn is_block_read_frame(header: u32) -> bool {
    frame_type_of(header) == FrameType::BlockRead as u8
}

pub fn is_stack_continuation(header: u32) -> bool {
    frame_type_of(header) == FrameType::StackContinuation as u8
}

pub fn is_stack_error_notification(header: u32) -> bool {
    frame_type_of(header) == FrameType::StackError as u8
}

pub fn is_known_frame_header(header: u32) -> bool {
    matches!(
        frame_type_of(header),
        t if t == FrameType::SuperFrame as u8
            || t == FrameType::StackFrame as u8
            || t == FrameType::BlockRead as u8
            || t == FrameType::StackError as u8
            || t == FrameType::StackContinuation as u8
            || t == FrameType::SystemEvent as u8
    )
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn frame_header_roundtrip() {
        let header = make_frame_header(FrameType::StackFrame, 3, frame_flags::CONTINUE, 0x123);
        let info = extract_frame_info(header);

        assert_eq!(info.frame_type, FrameType::StackFrame as u8);
        assert_eq!(info.stack_id, 3);
        assert_eq!(info.flags, frame_flags::CONTINUE);
        assert_eq!(info.len, 0x123);
    }

    #[test]
    fn frame_header_field_limits() {
        let header = make_frame_header(FrameType::SuperFrame, 0xFF, 0xFF, 0xFFFF);
        let info = extract_frame_info(header);

        // Out-of-range values are masked, not smeared into other fields.
        assert_eq!(info.frame_type, FrameType::SuperFrame as u8);
        assert_eq!(info.stack_id, 0xF);
        assert_eq!(info.flags, 0xF);
        assert_eq!(info.len, 0xFFF);
    }

    #[test]
    fn header_validators() {
        let super_hdr = make_frame_header(FrameType::SuperFrame, 0, 0, 2);
        let stack_hdr = make_frame_header(FrameType::StackFrame, 1, 0, 0);
        let error_hdr = make_frame_header(FrameType::StackError, 2, frame_flags::TIMEOUT, 1);

        assert!(is_super_frame(super_hdr));
        assert!(!is_super_frame(stack_hdr));
        assert!(is_stack_frame(stack_hdr));
        assert!(is_stack_error_notification(error_hdr));
        assert!(is_known_frame_header(super_hdr));
        assert!(is_known_frame_header(error_hdr));
        assert!(!is_known_frame_header(0x1234_5678));
    }

    #[test]
    fn stack_tags_roundtrip() {
        for ty in [
            StackCommandType::StackStart,
            StackCommandType::StackEnd,
            StackCommandType::VmeRead,
            StackCommandType::VmeMbltSwapped,
            StackCommandType::SignallingVmeRead,
            StackCommandType::VmeWrite,
            StackCommandType::WriteMarker,
            StackCommandType::WriteSpecial,
            StackCommandType::WriteSignalWord,
        ] {
            assert_eq!(StackCommandType::from_tag(ty as u8), Some(ty));
            assert!(ty.is_wire_type());
        }

        assert_eq!(StackCommandType::from_tag(0x00), None);
        assert_eq!(StackCommandType::from_tag(0xED), None);
        assert!(!StackCommandType::Invalid.is_wire_type());
        assert!(!StackCommandType::SoftwareDelay.is_wire_type());
    }

    #[test]
    fn super_tags_roundtrip() {
        for ty in [
            SuperCommandType::ReferenceWord,
            SuperCommandType::ReadLocal,
            SuperCommandType::ReadLocalBlock,
            SuperCommandType::WriteLocal,
            SuperCommandType::WriteReset,
        ] {
            assert_eq!(SuperCommandType::from_tag(ty as u16), Some(ty));
        }

        // Framing tags are not command types.
        assert_eq!(SuperCommandType::from_tag(CMD_BUFFER_START), None);
        assert_eq!(SuperCommandType::from_tag(CMD_BUFFER_END), None);
    }

    #[test]
    fn pipe_raw_conversion() {
        assert_eq!(Pipe::from_raw(0), Some(Pipe::Command));
        assert_eq!(Pipe::from_raw(1), Some(Pipe::Data));
        assert_eq!(Pipe::from_raw(SUPPRESS_PIPE_OUTPUT), None);
    }
}
