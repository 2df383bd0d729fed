//! Command model and binary wire codec for a VME bus controller.
//!
//! Two command families exist: super commands handled directly by the
//! controller's command interpreter, and stack commands forming programs
//! that are uploaded into device stack memory for immediate or autonomous
//! execution. This crate defines the value types and builders for both,
//! the bit-exact buffer encoding, and the response frame model the dialog
//! layer validates against.

pub mod codec;
pub mod error;
pub mod stack_command;
pub mod stacks;
pub mod super_command;
pub mod wire;

pub use codec::{
    encoded_stack_command_size, encoded_stack_size, encoded_super_command_size,
    get_encoded_stack_size, make_command_buffer, make_command_buffer_from, make_stack_buffer,
    make_stack_buffer_from, make_stack_upload_commands, make_stack_upload_commands_from,
    stack_builder_from_buffer, stack_commands_from_buffer, stack_upload_commands_for_buffer,
    super_builder_from_buffer,
};
pub use error::{CodecError, Result};
pub use stack_command::{produces_output, Group, StackCommand, StackCommandBuilder};
pub use stacks::{StackTrigger, TriggerType};
pub use super_command::{SuperCommand, SuperCommandBuilder};
pub use wire::{
    amods, extract_frame_info, frame_flags, is_block_read_frame, is_known_frame_header,
    is_stack_continuation, is_stack_error_notification, is_stack_frame, is_super_frame,
    make_frame_header, Blk2eSstRate, FrameInfo, FrameType, Pipe, StackCommandType,
    SuperCommandType, VmeDataWidth, PIPE_COUNT, SUPPRESS_PIPE_OUTPUT, WORD_SIZE,
};
