//! Readout and DAQ setup helpers built on the dialog engine.
//!
//! These mirror the device's stack slot model: slot 0 is reserved for
//! immediate execution, the remaining slots hold readout stacks placed
//! back to back in stack memory with a one-word gap in between.

use tracing::debug;

use vmelink_proto::stacks::{
    offset_register, trigger_register, trigger_value, StackTrigger, ADDRESS_INCREMENT,
    DAQ_MODE_REGISTER, IMMEDIATE_STACK_ID, IMMEDIATE_STACK_RESERVED_WORDS,
    IMMEDIATE_STACK_START_OFFSET_WORDS, NO_TRIGGER, READOUT_STACK_COUNT, STACK_COUNT,
    STACK_MEMORY_BEGIN, STACK_MEMORY_BYTES, STACK_MEMORY_END, STACK_OFFSET_BIT_MASK,
};
use vmelink_proto::wire::{STACK_CMD_MASK, STACK_CMD_SHIFT};
use vmelink_proto::{
    make_stack_buffer, StackCommandBuilder, StackCommandType, SuperCommandBuilder,
};

use crate::controller::Controller;
use crate::error::{ControllerError, Result};

/// Reference word marking trigger setup transactions in wire captures.
pub const TRIGGER_SETUP_REFERENCE: u16 = 0x1337;

/// Reference word marking disable-all transactions in wire captures.
pub const DISABLE_ALL_REFERENCE: u16 = 0x1338;

/// Snapshot of one device-resident stack, for diagnostics and verification.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct StackInfo {
    /// Raw trigger register value.
    pub triggers: u32,
    /// Raw offset register value (byte offset into stack memory).
    pub offset: u32,
    /// Computed absolute start address of the stack program.
    pub start_address: u16,
    /// Raw words read back from stack memory, including the markers.
    pub contents: Vec<u32>,
}

fn stack_word_tag(word: u32) -> u8 {
    ((word >> STACK_CMD_SHIFT) & STACK_CMD_MASK) as u8
}

/// Walks a stack program in device memory word by word.
///
/// The first word must be a StackStart marker; reading past the end of the
/// stack memory window before a StackEnd marker appears fails with
/// `StackMemoryExceeded`.
pub fn read_stack_contents(controller: &Controller, start_address: u16) -> Result<Vec<u32>> {
    let header = controller.read_register(start_address)?;

    if stack_word_tag(header) != StackCommandType::StackStart as u8 {
        return Err(ControllerError::InvalidStackHeader { header });
    }

    let mut contents = vec![header];
    let mut address = start_address as u32 + ADDRESS_INCREMENT as u32;

    loop {
        if address >= STACK_MEMORY_END {
            return Err(ControllerError::StackMemoryExceeded);
        }

        let word = controller.read_register(address as u16)?;
        contents.push(word);

        if stack_word_tag(word) == StackCommandType::StackEnd as u8 {
            return Ok(contents);
        }

        address += ADDRESS_INCREMENT as u32;
    }
}

/// Reads trigger, offset and program contents of one stack slot.
pub fn read_stack_info(controller: &Controller, stack_id: u8) -> Result<StackInfo> {
    if stack_id >= STACK_COUNT {
        return Err(ControllerError::StackCountExceeded);
    }

    let triggers = controller.read_register(trigger_register(stack_id))?;
    let offset = controller.read_register(offset_register(stack_id))?;
    let start_address = (STACK_MEMORY_BEGIN as u32 + offset) as u16;
    let contents = read_stack_contents(controller, start_address)?;

    Ok(StackInfo {
        triggers,
        offset,
        start_address,
        contents,
    })
}

pub fn enable_daq_mode(controller: &Controller) -> Result<()> {
    controller.write_register(DAQ_MODE_REGISTER, 1)
}

pub fn disable_daq_mode(controller: &Controller) -> Result<()> {
    controller.write_register(DAQ_MODE_REGISTER, 0)
}

pub fn read_daq_mode(controller: &Controller) -> Result<u32> {
    controller.read_register(DAQ_MODE_REGISTER)
}

/// The batched command sequence zeroing the DAQ mode register and every
/// stack trigger register.
pub fn disable_all_builder() -> SuperCommandBuilder {
    let mut builder = SuperCommandBuilder::new();
    builder.add_reference_word(DISABLE_ALL_REFERENCE);
    builder.add_write_local(DAQ_MODE_REGISTER, 0);

    for stack_id in 0..STACK_COUNT {
        builder.add_write_local(trigger_register(stack_id), NO_TRIGGER);
    }

    builder
}

/// Forces the device quiescent in one super transaction: DAQ mode off and
/// every trigger disarmed, without per-stack round trips.
pub fn disable_all_triggers_and_daq_mode(controller: &Controller) -> Result<()> {
    controller.super_transaction(&disable_all_builder()).map(drop)
}

pub fn reset_stack_offsets(controller: &Controller) -> Result<()> {
    for stack_id in 0..STACK_COUNT {
        controller.write_register(offset_register(stack_id), 0)?;
    }
    Ok(())
}

/// Planned placement of one readout stack in device memory.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct StackAllocation {
    pub stack_id: u8,
    /// Byte offset of the program inside the stack memory window.
    pub offset_bytes: u16,
    /// The encoded program, including the Start/End markers.
    pub buffer: Vec<u32>,
}

/// Assigns non-overlapping upload addresses for a sequence of readout
/// stacks, leaving a one-word gap after the immediate region and between
/// consecutive stacks.
///
/// This is a pure planning pass: exceeding the stack count or the memory
/// window fails here, before any upload or register write is attempted.
pub fn plan_readout_allocations(
    stacks: &[StackCommandBuilder],
) -> Result<Vec<StackAllocation>> {
    let mut allocations = Vec::with_capacity(stacks.len());
    let mut stack_id = IMMEDIATE_STACK_ID + 1;
    let mut word_offset =
        (IMMEDIATE_STACK_START_OFFSET_WORDS + IMMEDIATE_STACK_RESERVED_WORDS + 1) as u32;

    for builder in stacks {
        if stack_id >= STACK_COUNT {
            return Err(ControllerError::StackCountExceeded);
        }

        let buffer = make_stack_buffer(builder)?;
        let offset_bytes = word_offset * ADDRESS_INCREMENT as u32;
        let end_bytes = offset_bytes + buffer.len() as u32 * ADDRESS_INCREMENT as u32;

        if end_bytes > STACK_MEMORY_BYTES {
            return Err(ControllerError::StackMemoryExceeded);
        }

        word_offset += buffer.len() as u32 + 1;
        allocations.push(StackAllocation {
            stack_id,
            offset_bytes: offset_bytes as u16,
            buffer,
        });
        stack_id += 1;
    }

    Ok(allocations)
}

/// Uploads the readout stacks and programs their offset registers.
///
/// All allocations are computed up front; a stack list that does not fit
/// fails before the device sees a single write.
pub fn setup_readout_stacks(
    controller: &Controller,
    stacks: &[StackCommandBuilder],
) -> Result<Vec<StackAllocation>> {
    let allocations = plan_readout_allocations(stacks)?;

    for (builder, allocation) in stacks.iter().zip(&allocations) {
        debug!(
            stack_id = allocation.stack_id,
            offset = allocation.offset_bytes,
            words = allocation.buffer.len(),
            "uploading readout stack"
        );

        controller.upload_stack(builder.output_pipe(), allocation.offset_bytes, builder)?;
        controller.write_register(
            offset_register(allocation.stack_id),
            (allocation.offset_bytes & STACK_OFFSET_BIT_MASK) as u32,
        )?;
    }

    Ok(allocations)
}

pub fn write_stack_trigger_value(
    controller: &Controller,
    stack_id: u8,
    value: u32,
) -> Result<()> {
    if stack_id >= STACK_COUNT {
        return Err(ControllerError::StackCountExceeded);
    }
    controller.write_register(trigger_register(stack_id), value)
}

pub fn setup_stack_trigger(
    controller: &Controller,
    stack_id: u8,
    trigger: StackTrigger,
) -> Result<()> {
    write_stack_trigger_value(controller, stack_id, trigger_value(trigger))
}

/// Arms all readout stacks in one batched super transaction so DAQ
/// arm/disarm is atomic with respect to other command dialogs.
pub fn setup_readout_triggers(
    controller: &Controller,
    trigger_values: &[u32; READOUT_STACK_COUNT],
) -> Result<()> {
    let mut builder = SuperCommandBuilder::new();
    builder.add_reference_word(TRIGGER_SETUP_REFERENCE);

    let mut stack_id = IMMEDIATE_STACK_ID + 1;
    for &value in trigger_values {
        builder.add_write_local(trigger_register(stack_id), value);
        stack_id += 1;
    }

    controller.super_transaction(&builder).map(drop)
}

pub fn setup_readout_stack_triggers(
    controller: &Controller,
    triggers: &[StackTrigger; READOUT_STACK_COUNT],
) -> Result<()> {
    let values = triggers.map(trigger_value);
    setup_readout_triggers(controller, &values)
}
