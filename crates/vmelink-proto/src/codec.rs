//! Encoding and decoding of command buffers in the controller's wire format.
//!
//! Encoding of type-checked inputs cannot fail except for the host-only
//! stack commands (`Invalid`, `SoftwareDelay`), which have no wire form.
//! Decoding fails with a specific [`CodecError`] when an unexpected tag
//! appears, a multi-word command is truncated, or a stack buffer ends
//! without its terminating marker.

use crate::error::{CodecError, Result};
use crate::stack_command::{StackCommand, StackCommandBuilder};
use crate::stacks::{ADDRESS_INCREMENT, STACK_MEMORY_BEGIN};
use crate::super_command::{SuperCommand, SuperCommandBuilder};
use crate::wire::{
    amods, StackCommandType, SuperCommandType, VmeDataWidth, CMD_BUFFER_END, CMD_BUFFER_START,
    STACK_ARG0_MASK, STACK_ARG0_SHIFT, STACK_ARG1_MASK, STACK_CMD_MASK, STACK_CMD_SHIFT,
    SUPER_ARG_MASK, SUPER_CMD_SHIFT,
};

const WRITE_SPECIAL_VALUE_MASK: u32 = 0x00FF_FFFF;

/// Encoded word count of a super command. Must match [`make_command_buffer`]
/// exactly; the size tests pin this against the encoder output.
pub fn encoded_super_command_size(cmd: &SuperCommand) -> usize {
    match cmd.cmd_type {
        SuperCommandType::ReferenceWord
        | SuperCommandType::ReadLocal
        | SuperCommandType::WriteReset => 1,
        SuperCommandType::ReadLocalBlock | SuperCommandType::WriteLocal => 2,
    }
}

/// Encoded word count of a stack command. The block read variants keep
/// their transfer count in the control word's argument field, so a block
/// read request occupies the same two words as a single read.
pub fn encoded_stack_command_size(cmd: &StackCommand) -> Result<usize> {
    match cmd.cmd_type {
        StackCommandType::StackStart | StackCommandType::StackEnd => Ok(1),
        StackCommandType::VmeRead
        | StackCommandType::SignallingVmeRead
        | StackCommandType::VmeMbltSwapped => Ok(2),
        StackCommandType::VmeWrite => Ok(3),
        StackCommandType::WriteMarker | StackCommandType::WriteSignalWord => Ok(2),
        StackCommandType::WriteSpecial => Ok(1),
        StackCommandType::Invalid | StackCommandType::SoftwareDelay => {
            Err(CodecError::NotUploadable(cmd.cmd_type))
        }
    }
}

/// Encoded size of a stack program: the command sizes plus the StackStart
/// and StackEnd markers.
pub fn encoded_stack_size(commands: &[StackCommand]) -> Result<usize> {
    let mut size = 2;
    for cmd in commands {
        size += encoded_stack_command_size(cmd)?;
    }
    Ok(size)
}

pub fn get_encoded_stack_size(builder: &StackCommandBuilder) -> Result<usize> {
    encoded_stack_size(&builder.commands())
}

fn super_word(tag: u16, arg: u32) -> u32 {
    ((tag as u32) << SUPER_CMD_SHIFT) | (arg & SUPER_ARG_MASK)
}

/// Serializes a super command sequence into a request buffer, bracketed by
/// the buffer start/end framing words.
pub fn make_command_buffer(builder: &SuperCommandBuilder) -> Vec<u32> {
    make_command_buffer_from(builder.commands())
}

pub fn make_command_buffer_from(commands: &[SuperCommand]) -> Vec<u32> {
    let payload: usize = commands.iter().map(encoded_super_command_size).sum();
    let mut out = Vec::with_capacity(payload + 2);

    out.push(super_word(CMD_BUFFER_START, 0));

    for cmd in commands {
        match cmd.cmd_type {
            SuperCommandType::ReferenceWord => {
                out.push(super_word(cmd.cmd_type as u16, cmd.value));
            }
            SuperCommandType::ReadLocal => {
                out.push(super_word(cmd.cmd_type as u16, cmd.address as u32));
            }
            SuperCommandType::ReadLocalBlock | SuperCommandType::WriteLocal => {
                out.push(super_word(cmd.cmd_type as u16, cmd.address as u32));
                out.push(cmd.value);
            }
            SuperCommandType::WriteReset => {
                out.push(super_word(cmd.cmd_type as u16, 0));
            }
        }
    }

    out.push(super_word(CMD_BUFFER_END, 0));
    out
}

/// Exact inverse of [`make_command_buffer`]. Framing words are skipped;
/// unknown tags and truncated two-word commands are decode errors.
pub fn super_builder_from_buffer(buffer: &[u32]) -> Result<SuperCommandBuilder> {
    let mut builder = SuperCommandBuilder::new();
    let mut index = 0;

    while index < buffer.len() {
        let word = buffer[index];
        let tag = (word >> SUPER_CMD_SHIFT) as u16;

        if tag == CMD_BUFFER_START || tag == CMD_BUFFER_END {
            index += 1;
            continue;
        }

        let cmd_type =
            SuperCommandType::from_tag(tag).ok_or(CodecError::UnknownSuperTag { tag, index })?;
        let arg = (word & SUPER_ARG_MASK) as u16;

        match cmd_type {
            SuperCommandType::ReferenceWord => {
                builder.add_reference_word(arg);
            }
            SuperCommandType::ReadLocal => {
                builder.add_read_local(arg);
            }
            SuperCommandType::ReadLocalBlock | SuperCommandType::WriteLocal => {
                let value = *buffer
                    .get(index + 1)
                    .ok_or(CodecError::Truncated { index })?;
                builder.add_command(SuperCommand {
                    cmd_type,
                    address: arg,
                    value,
                });
                index += 1;
            }
            SuperCommandType::WriteReset => {
                builder.add_write_reset();
            }
        }

        index += 1;
    }

    Ok(builder)
}

fn stack_word(tag: StackCommandType, arg0: u32, arg1: u32) -> u32 {
    ((tag as u32 & STACK_CMD_MASK) << STACK_CMD_SHIFT)
        | ((arg0 & STACK_ARG0_MASK) << STACK_ARG0_SHIFT)
        | (arg1 & STACK_ARG1_MASK)
}

fn encode_stack_command(cmd: &StackCommand, out: &mut Vec<u32>) -> Result<()> {
    match cmd.cmd_type {
        StackCommandType::VmeRead | StackCommandType::SignallingVmeRead => {
            let arg1 = if amods::is_block_mode(cmd.amod) {
                cmd.transfers as u32
            } else {
                cmd.data_width as u32
            };
            out.push(stack_word(cmd.cmd_type, cmd.amod as u32, arg1));
            out.push(cmd.address);
        }
        StackCommandType::VmeMbltSwapped => {
            out.push(stack_word(cmd.cmd_type, cmd.amod as u32, cmd.transfers as u32));
            out.push(cmd.address);
        }
        StackCommandType::VmeWrite => {
            out.push(stack_word(cmd.cmd_type, cmd.amod as u32, cmd.data_width as u32));
            out.push(cmd.address);
            out.push(cmd.value);
        }
        StackCommandType::WriteMarker | StackCommandType::WriteSignalWord => {
            out.push(stack_word(cmd.cmd_type, 0, 0));
            out.push(cmd.value);
        }
        StackCommandType::WriteSpecial => {
            out.push(
                ((cmd.cmd_type as u32) << STACK_CMD_SHIFT) | (cmd.value & WRITE_SPECIAL_VALUE_MASK),
            );
        }
        StackCommandType::Invalid
        | StackCommandType::SoftwareDelay
        | StackCommandType::StackStart
        | StackCommandType::StackEnd => return Err(CodecError::NotUploadable(cmd.cmd_type)),
    }
    Ok(())
}

/// Encodes a stack program: StackStart marker, commands, StackEnd marker.
///
/// The start marker's output-pipe field is left clear here; it is patched
/// in when the upload write sequence is generated.
pub fn make_stack_buffer(builder: &StackCommandBuilder) -> Result<Vec<u32>> {
    make_stack_buffer_from(&builder.commands())
}

pub fn make_stack_buffer_from(commands: &[StackCommand]) -> Result<Vec<u32>> {
    let mut out = Vec::with_capacity(encoded_stack_size(commands)?);
    out.push(stack_word(StackCommandType::StackStart, 0, 0));
    for cmd in commands {
        encode_stack_command(cmd, &mut out)?;
    }
    out.push(stack_word(StackCommandType::StackEnd, 0, 0));
    Ok(out)
}

/// Decodes stack commands from an encoded buffer.
///
/// A leading StackStart marker is skipped, decoding stops at the first
/// StackEnd marker. Running out of buffer before the terminator appears is
/// an error, as is any tag the protocol does not define.
pub fn stack_commands_from_buffer(buffer: &[u32]) -> Result<Vec<StackCommand>> {
    let mut commands = Vec::new();
    let mut index = 0;

    while index < buffer.len() {
        let word = buffer[index];
        let tag = ((word >> STACK_CMD_SHIFT) & STACK_CMD_MASK) as u8;
        let cmd_type =
            StackCommandType::from_tag(tag).ok_or(CodecError::UnknownStackTag { tag, index })?;

        let arg0 = ((word >> STACK_ARG0_SHIFT) & STACK_ARG0_MASK) as u8;
        let arg1 = (word & STACK_ARG1_MASK) as u16;

        match cmd_type {
            StackCommandType::StackStart => {}
            StackCommandType::StackEnd => return Ok(commands),
            StackCommandType::VmeRead | StackCommandType::SignallingVmeRead => {
                let address = *buffer
                    .get(index + 1)
                    .ok_or(CodecError::Truncated { index })?;
                let mut cmd = StackCommand {
                    cmd_type,
                    address,
                    amod: arg0,
                    ..StackCommand::default()
                };
                if amods::is_block_mode(arg0) {
                    cmd.transfers = arg1;
                } else {
                    cmd.data_width = VmeDataWidth::from_wire(arg1)
                        .ok_or(CodecError::InvalidDataWidth { value: arg1, index })?;
                }
                commands.push(cmd);
                index += 1;
            }
            StackCommandType::VmeMbltSwapped => {
                let address = *buffer
                    .get(index + 1)
                    .ok_or(CodecError::Truncated { index })?;
                commands.push(StackCommand {
                    cmd_type,
                    address,
                    amod: arg0,
                    transfers: arg1,
                    ..StackCommand::default()
                });
                index += 1;
            }
            StackCommandType::VmeWrite => {
                let address = *buffer
                    .get(index + 1)
                    .ok_or(CodecError::Truncated { index })?;
                let value = *buffer
                    .get(index + 2)
                    .ok_or(CodecError::Truncated { index })?;
                commands.push(StackCommand {
                    cmd_type,
                    address,
                    value,
                    amod: arg0,
                    data_width: VmeDataWidth::from_wire(arg1)
                        .ok_or(CodecError::InvalidDataWidth { value: arg1, index })?,
                    ..StackCommand::default()
                });
                index += 2;
            }
            StackCommandType::WriteMarker | StackCommandType::WriteSignalWord => {
                let value = *buffer
                    .get(index + 1)
                    .ok_or(CodecError::Truncated { index })?;
                commands.push(StackCommand {
                    cmd_type,
                    value,
                    ..StackCommand::default()
                });
                index += 1;
            }
            StackCommandType::WriteSpecial => {
                commands.push(StackCommand {
                    cmd_type,
                    value: word & WRITE_SPECIAL_VALUE_MASK,
                    ..StackCommand::default()
                });
            }
            StackCommandType::Invalid | StackCommandType::SoftwareDelay => {
                return Err(CodecError::UnknownStackTag { tag, index });
            }
        }

        index += 1;
    }

    Err(CodecError::MissingTerminator)
}

/// Decodes an encoded stack buffer into a builder holding a single unnamed
/// group. Group structure does not survive the wire format.
pub fn stack_builder_from_buffer(buffer: &[u32]) -> Result<StackCommandBuilder> {
    Ok(StackCommandBuilder::from_commands(&stack_commands_from_buffer(buffer)?))
}

/// Produces the super command sequence that uploads `stack` into stack
/// memory at `offset_bytes`, one register write per encoded word, with the
/// output pipe patched into the StackStart marker.
pub fn make_stack_upload_commands(
    output_pipe: u8,
    offset_bytes: u16,
    stack: &StackCommandBuilder,
) -> Result<Vec<SuperCommand>> {
    make_stack_upload_commands_from(output_pipe, offset_bytes, &stack.commands())
}

pub fn make_stack_upload_commands_from(
    output_pipe: u8,
    offset_bytes: u16,
    commands: &[StackCommand],
) -> Result<Vec<SuperCommand>> {
    let buffer = make_stack_buffer_from(commands)?;
    Ok(stack_upload_commands_for_buffer(output_pipe, offset_bytes, &buffer))
}

pub fn stack_upload_commands_for_buffer(
    output_pipe: u8,
    offset_bytes: u16,
    stack_buffer: &[u32],
) -> Vec<SuperCommand> {
    let base = STACK_MEMORY_BEGIN as u32 + offset_bytes as u32;

    stack_buffer
        .iter()
        .enumerate()
        .map(|(i, &word)| {
            let mut value = word;
            let tag = ((word >> STACK_CMD_SHIFT) & STACK_CMD_MASK) as u8;
            if tag == StackCommandType::StackStart as u8 {
                value |= (output_pipe as u32) << STACK_ARG0_SHIFT;
            }
            SuperCommand {
                cmd_type: SuperCommandType::WriteLocal,
                // callers validate the window; the cast cannot wrap then
                address: (base + i as u32 * ADDRESS_INCREMENT as u32) as u16,
                value,
            }
        })
        .collect()
}
