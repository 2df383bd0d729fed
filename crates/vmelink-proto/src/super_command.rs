//! Super commands: the controller's direct command interpreter layer.

use serde::{Deserialize, Serialize};

use crate::codec;
use crate::error::Result;
use crate::stack_command::StackCommandBuilder;
use crate::wire::{Pipe, SuperCommandType, VmeDataWidth};

/// One command executed directly by the controller's command interpreter.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct SuperCommand {
    pub cmd_type: SuperCommandType,
    pub address: u16,
    pub value: u32,
}

/// Ordered sequence of super commands forming one request buffer.
///
/// The plain adders append a single command each. The VME convenience
/// adders synthesize a one-off stack program and embed its upload write
/// sequence, addressed at the command pipe and memory offset 0; they are
/// fallible because stack encoding rejects host-only commands.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct SuperCommandBuilder {
    commands: Vec<SuperCommand>,
}

impl SuperCommandBuilder {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn add_reference_word(&mut self, ref_value: u16) -> &mut Self {
        self.commands.push(SuperCommand {
            cmd_type: SuperCommandType::ReferenceWord,
            address: 0,
            value: ref_value as u32,
        });
        self
    }

    pub fn add_read_local(&mut self, address: u16) -> &mut Self {
        self.commands.push(SuperCommand {
            cmd_type: SuperCommandType::ReadLocal,
            address,
            value: 0,
        });
        self
    }

    pub fn add_read_local_block(&mut self, address: u16, words: u16) -> &mut Self {
        self.commands.push(SuperCommand {
            cmd_type: SuperCommandType::ReadLocalBlock,
            address,
            value: words as u32,
        });
        self
    }

    pub fn add_write_local(&mut self, address: u16, value: u32) -> &mut Self {
        self.commands.push(SuperCommand {
            cmd_type: SuperCommandType::WriteLocal,
            address,
            value,
        });
        self
    }

    pub fn add_write_reset(&mut self) -> &mut Self {
        self.commands.push(SuperCommand {
            cmd_type: SuperCommandType::WriteReset,
            address: 0,
            value: 0,
        });
        self
    }

    pub fn add_command(&mut self, cmd: SuperCommand) -> &mut Self {
        self.commands.push(cmd);
        self
    }

    pub fn add_commands(&mut self, commands: &[SuperCommand]) -> &mut Self {
        self.commands.extend_from_slice(commands);
        self
    }

    pub fn add_vme_read(
        &mut self,
        address: u32,
        amod: u8,
        data_width: VmeDataWidth,
    ) -> Result<&mut Self> {
        let mut stack = StackCommandBuilder::new();
        stack.add_vme_read(address, amod, data_width);
        self.add_stack_upload(&stack, Pipe::Command.as_u8(), 0)
    }

    pub fn add_vme_block_read(
        &mut self,
        address: u32,
        amod: u8,
        max_transfers: u16,
    ) -> Result<&mut Self> {
        let mut stack = StackCommandBuilder::new();
        stack.add_vme_block_read(address, amod, max_transfers);
        self.add_stack_upload(&stack, Pipe::Command.as_u8(), 0)
    }

    pub fn add_vme_mblt_swapped(&mut self, address: u32, max_transfers: u16) -> Result<&mut Self> {
        let mut stack = StackCommandBuilder::new();
        stack.add_vme_mblt_swapped(address, max_transfers);
        self.add_stack_upload(&stack, Pipe::Command.as_u8(), 0)
    }

    pub fn add_vme_write(
        &mut self,
        address: u32,
        value: u32,
        amod: u8,
        data_width: VmeDataWidth,
    ) -> Result<&mut Self> {
        let mut stack = StackCommandBuilder::new();
        stack.add_vme_write(address, value, amod, data_width);
        self.add_stack_upload(&stack, Pipe::Command.as_u8(), 0)
    }

    /// Embeds the write sequence uploading `stack` into stack memory at
    /// `offset_bytes`, routing its output to `output_pipe`.
    pub fn add_stack_upload(
        &mut self,
        stack: &StackCommandBuilder,
        output_pipe: u8,
        offset_bytes: u16,
    ) -> Result<&mut Self> {
        let upload = codec::make_stack_upload_commands(output_pipe, offset_bytes, stack)?;
        self.commands.extend(upload);
        Ok(self)
    }

    /// Embeds the upload write sequence for an already encoded stack buffer.
    pub fn add_stack_upload_buffer(
        &mut self,
        stack_buffer: &[u32],
        output_pipe: u8,
        offset_bytes: u16,
    ) -> &mut Self {
        let upload = codec::stack_upload_commands_for_buffer(output_pipe, offset_bytes, stack_buffer);
        self.commands.extend(upload);
        self
    }

    pub fn commands(&self) -> &[SuperCommand] {
        &self.commands
    }

    pub fn empty(&self) -> bool {
        self.commands.is_empty()
    }

    pub fn len(&self) -> usize {
        self.commands.len()
    }

    pub fn is_empty(&self) -> bool {
        self.commands.is_empty()
    }
}

impl std::ops::Index<usize> for SuperCommandBuilder {
    type Output = SuperCommand;

    fn index(&self, index: usize) -> &SuperCommand {
        &self.commands[index]
    }
}
