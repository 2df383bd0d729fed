//! Stack memory map, per-stack registers and trigger word composition.
//!
//! The controller holds a bounded linear stack memory addressed in 32-bit
//! word increments. Stack 0 is reserved for immediate execution of one-shot
//! programs; the remaining slots hold readout stacks triggered autonomously.

use serde::{Deserialize, Serialize};

/// Number of device stack slots.
pub const STACK_COUNT: u8 = 8;

/// Stack slot reserved for immediate execution.
pub const IMMEDIATE_STACK_ID: u8 = 0;

/// Stack slots available for autonomous readout.
pub const READOUT_STACK_COUNT: usize = (STACK_COUNT - 1) as usize;

/// First register address of the stack memory window.
pub const STACK_MEMORY_BEGIN: u16 = 0xF000;

/// Size of the stack memory window in words.
pub const STACK_MEMORY_WORDS: u16 = 1024;

/// Bytes per stack memory word.
pub const ADDRESS_INCREMENT: u16 = 4;

/// Size of the stack memory window in bytes.
pub const STACK_MEMORY_BYTES: u32 = STACK_MEMORY_WORDS as u32 * ADDRESS_INCREMENT as u32;

/// One past the last valid stack memory address. Kept as u32: the window
/// ends exactly at the top of the 16-bit register address space.
pub const STACK_MEMORY_END: u32 = STACK_MEMORY_BEGIN as u32 + STACK_MEMORY_BYTES;

/// Word offset of the immediate stack inside the window.
pub const IMMEDIATE_STACK_START_OFFSET_WORDS: u16 = 0;

/// Words reserved for the immediate stack at the bottom of the window.
pub const IMMEDIATE_STACK_RESERVED_WORDS: u16 = 64;

/// Trigger register of stack 0; consecutive stacks follow in steps of 4.
pub const STACK0_TRIGGER_REGISTER: u16 = 0x1100;

/// Offset register of stack 0; consecutive stacks follow in steps of 4.
pub const STACK0_OFFSET_REGISTER: u16 = 0x1200;

/// DAQ mode enable register (1 = autonomous trigger processing active).
pub const DAQ_MODE_REGISTER: u16 = 0x1300;

/// Valid bits of a stack offset register: word-aligned byte offset inside
/// the 4 KiB window.
pub const STACK_OFFSET_BIT_MASK: u16 = 0x0FFC;

/// Trigger register value disarming a stack.
pub const NO_TRIGGER: u32 = 0;

pub const TRIGGER_BITS_MASK: u32 = 0b1_1111;
pub const TRIGGER_TYPE_SHIFT: u32 = 5;
pub const IMMEDIATE_SHIFT: u32 = 8;

/// Trigger register value requesting one immediate execution of stack 0.
pub const IMMEDIATE_EXEC: u32 = 1 << IMMEDIATE_SHIFT;

pub fn trigger_register(stack_id: u8) -> u16 {
    debug_assert!(stack_id < STACK_COUNT);
    STACK0_TRIGGER_REGISTER + stack_id as u16 * ADDRESS_INCREMENT
}

pub fn offset_register(stack_id: u8) -> u16 {
    debug_assert!(stack_id < STACK_COUNT);
    STACK0_OFFSET_REGISTER + stack_id as u16 * ADDRESS_INCREMENT
}

/// How a readout stack is triggered by the controller.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[repr(u8)]
pub enum TriggerType {
    NoTrigger = 0,
    IrqWithIack = 1,
    IrqNoIack = 2,
    External = 3,
}

impl Default for TriggerType {
    fn default() -> Self {
        TriggerType::NoTrigger
    }
}

/// Trigger configuration of one readout stack.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct StackTrigger {
    pub trigger_type: TriggerType,
    /// VME interrupt level 1..=7; only meaningful for the IRQ trigger types.
    pub irq_level: u8,
}

/// Composes the trigger register word for a trigger configuration.
///
/// IRQ trigger types store `irq_level - 1` in the trigger bits; level 0 is
/// treated as "no IRQ selected" and leaves the bits clear.
pub fn trigger_value(trigger: StackTrigger) -> u32 {
    let mut value = (trigger.trigger_type as u32) << TRIGGER_TYPE_SHIFT;

    if matches!(
        trigger.trigger_type,
        TriggerType::IrqWithIack | TriggerType::IrqNoIack
    ) && trigger.irq_level > 0
    {
        value |= (trigger.irq_level as u32 - 1) & TRIGGER_BITS_MASK;
    }

    value
}
