//! Stack commands: VME operations composed into device-resident programs.

use std::fmt;
use std::str::FromStr;
use std::time::Duration;

use serde::{Deserialize, Serialize};

use crate::error::CodecError;
use crate::wire::{amods, Blk2eSstRate, Pipe, StackCommandType, VmeDataWidth, SUPPRESS_PIPE_OUTPUT};

/// One operation inside a stack program.
///
/// Which fields are meaningful depends on `cmd_type`; unused fields stay at
/// their defaults so that equality is structural across the whole record.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct StackCommand {
    pub cmd_type: StackCommandType,
    pub address: u32,
    pub value: u32,
    pub amod: u8,
    pub data_width: VmeDataWidth,
    pub transfers: u16,
    pub rate: Blk2eSstRate,
}

impl Default for StackCommand {
    fn default() -> Self {
        StackCommand {
            cmd_type: StackCommandType::Invalid,
            address: 0,
            value: 0,
            amod: 0,
            data_width: VmeDataWidth::D16,
            transfers: 0,
            rate: Blk2eSstRate::Rate160MB,
        }
    }
}

impl StackCommand {
    pub fn is_valid(&self) -> bool {
        self.cmd_type != StackCommandType::Invalid
    }
}

/// True if executing the command makes the device emit words into the
/// stack's output stream.
pub fn produces_output(cmd: &StackCommand) -> bool {
    matches!(
        cmd.cmd_type,
        StackCommandType::VmeRead
            | StackCommandType::SignallingVmeRead
            | StackCommandType::VmeMbltSwapped
            | StackCommandType::WriteMarker
            | StackCommandType::WriteSpecial
            | StackCommandType::WriteSignalWord
    )
}

impl fmt::Display for StackCommand {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self.cmd_type {
            StackCommandType::Invalid => write!(f, "invalid"),
            StackCommandType::StackStart => write!(f, "stack_start"),
            StackCommandType::StackEnd => write!(f, "stack_end"),
            StackCommandType::VmeRead | StackCommandType::SignallingVmeRead => {
                let name = if self.cmd_type == StackCommandType::VmeRead {
                    "vme_read"
                } else {
                    "signalling_vme_read"
                };
                if amods::is_block_mode(self.amod) {
                    write!(
                        f,
                        "{} amod=0x{:02x} transfers={} addr=0x{:08x}",
                        name, self.amod, self.transfers, self.address
                    )
                } else {
                    write!(
                        f,
                        "{} amod=0x{:02x} width={} addr=0x{:08x}",
                        name,
                        self.amod,
                        width_str(self.data_width),
                        self.address
                    )
                }
            }
            StackCommandType::VmeMbltSwapped => write!(
                f,
                "vme_mblt_swapped amod=0x{:02x} transfers={} addr=0x{:08x}",
                self.amod, self.transfers, self.address
            ),
            StackCommandType::VmeWrite => write!(
                f,
                "vme_write amod=0x{:02x} width={} addr=0x{:08x} value=0x{:08x}",
                self.amod,
                width_str(self.data_width),
                self.address,
                self.value
            ),
            StackCommandType::WriteMarker => write!(f, "write_marker value=0x{:08x}", self.value),
            StackCommandType::WriteSpecial => write!(f, "write_special value=0x{:06x}", self.value),
            StackCommandType::WriteSignalWord => {
                write!(f, "write_signal_word value=0x{:08x}", self.value)
            }
            StackCommandType::SoftwareDelay => write!(f, "software_delay ms={}", self.value),
        }
    }
}

fn width_str(width: VmeDataWidth) -> &'static str {
    match width {
        VmeDataWidth::D16 => "d16",
        VmeDataWidth::D32 => "d32",
    }
}

fn parse_width(s: &str) -> Option<VmeDataWidth> {
    match s {
        "d16" => Some(VmeDataWidth::D16),
        "d32" => Some(VmeDataWidth::D32),
        _ => None,
    }
}

fn parse_number(s: &str) -> Option<u32> {
    if let Some(hex) = s.strip_prefix("0x") {
        u32::from_str_radix(hex, 16).ok()
    } else {
        s.parse().ok()
    }
}

impl FromStr for StackCommand {
    type Err = CodecError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let bad = || CodecError::InvalidCommandString(s.to_string());

        let mut parts = s.split_whitespace();
        let name = parts.next().ok_or_else(bad)?;

        let mut cmd = StackCommand::default();
        for part in parts {
            let (key, value) = part.split_once('=').ok_or_else(bad)?;
            match key {
                "amod" => cmd.amod = parse_number(value).ok_or_else(bad)? as u8,
                "width" => cmd.data_width = parse_width(value).ok_or_else(bad)?,
                "addr" => cmd.address = parse_number(value).ok_or_else(bad)?,
                "value" | "ms" => cmd.value = parse_number(value).ok_or_else(bad)?,
                "transfers" => cmd.transfers = parse_number(value).ok_or_else(bad)? as u16,
                _ => return Err(bad()),
            }
        }

        cmd.cmd_type = match name {
            "invalid" => StackCommandType::Invalid,
            "stack_start" => StackCommandType::StackStart,
            "stack_end" => StackCommandType::StackEnd,
            "vme_read" => StackCommandType::VmeRead,
            "signalling_vme_read" => StackCommandType::SignallingVmeRead,
            "vme_mblt_swapped" => StackCommandType::VmeMbltSwapped,
            "vme_write" => StackCommandType::VmeWrite,
            "write_marker" => StackCommandType::WriteMarker,
            "write_special" => StackCommandType::WriteSpecial,
            "write_signal_word" => StackCommandType::WriteSignalWord,
            "software_delay" => StackCommandType::SoftwareDelay,
            _ => return Err(bad()),
        };

        Ok(cmd)
    }
}

/// A named run of stack commands.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct Group {
    pub name: String,
    pub commands: Vec<StackCommand>,
}

impl Group {
    pub fn empty(&self) -> bool {
        self.commands.is_empty()
    }

    pub fn produces_output(&self) -> bool {
        self.commands.iter().any(produces_output)
    }
}

/// Ordered, group-structured builder for stack programs.
///
/// Commands are always appended to the most recently opened group; when no
/// group is open an implicit unnamed group is created. Flattening preserves
/// group order.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct StackCommandBuilder {
    name: String,
    groups: Vec<Group>,
    suppress_pipe_output: bool,
}

impl StackCommandBuilder {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn named(name: impl Into<String>) -> Self {
        StackCommandBuilder {
            name: name.into(),
            ..Self::default()
        }
    }

    pub fn from_commands(commands: &[StackCommand]) -> Self {
        let mut b = Self::new();
        for cmd in commands {
            b.add_command(*cmd);
        }
        b
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn set_name(&mut self, name: impl Into<String>) -> &mut Self {
        self.name = name.into();
        self
    }

    pub fn suppress_pipe_output(&self) -> bool {
        self.suppress_pipe_output
    }

    pub fn set_suppress_pipe_output(&mut self, suppress: bool) -> &mut Self {
        self.suppress_pipe_output = suppress;
        self
    }

    /// Output pipe id readout data of this stack should be routed to.
    pub fn output_pipe(&self) -> u8 {
        if self.suppress_pipe_output {
            SUPPRESS_PIPE_OUTPUT
        } else {
            Pipe::Data.as_u8()
        }
    }

    /// Opens a new group; subsequent commands are appended to it.
    pub fn begin_group(&mut self, name: impl Into<String>) -> &mut Self {
        self.groups.push(Group {
            name: name.into(),
            commands: Vec::new(),
        });
        self
    }

    pub fn has_open_group(&self) -> bool {
        !self.groups.is_empty()
    }

    pub fn group_count(&self) -> usize {
        self.groups.len()
    }

    pub fn groups(&self) -> &[Group] {
        &self.groups
    }

    pub fn group(&self, index: usize) -> Option<&Group> {
        self.groups.get(index)
    }

    pub fn group_by_name(&self, name: &str) -> Option<&Group> {
        self.groups.iter().find(|g| g.name == name)
    }

    pub fn add_group(
        &mut self,
        name: impl Into<String>,
        commands: Vec<StackCommand>,
    ) -> &mut Self {
        self.groups.push(Group {
            name: name.into(),
            commands,
        });
        self
    }

    pub fn add_command(&mut self, cmd: StackCommand) -> &mut Self {
        if self.groups.is_empty() {
            self.groups.push(Group::default());
        }
        // begin_group guarantees a last element here
        if let Some(group) = self.groups.last_mut() {
            group.commands.push(cmd);
        }
        self
    }

    pub fn add_vme_read(&mut self, address: u32, amod: u8, data_width: VmeDataWidth) -> &mut Self {
        self.add_command(StackCommand {
            cmd_type: StackCommandType::VmeRead,
            address,
            amod,
            data_width,
            ..StackCommand::default()
        })
    }

    pub fn add_signalling_vme_read(
        &mut self,
        address: u32,
        amod: u8,
        data_width: VmeDataWidth,
    ) -> &mut Self {
        self.add_command(StackCommand {
            cmd_type: StackCommandType::SignallingVmeRead,
            address,
            amod,
            data_width,
            ..StackCommand::default()
        })
    }

    pub fn add_vme_block_read(&mut self, address: u32, amod: u8, max_transfers: u16) -> &mut Self {
        self.add_command(StackCommand {
            cmd_type: StackCommandType::VmeRead,
            address,
            amod,
            transfers: max_transfers,
            ..StackCommand::default()
        })
    }

    pub fn add_vme_mblt_swapped(&mut self, address: u32, max_transfers: u16) -> &mut Self {
        self.add_command(StackCommand {
            cmd_type: StackCommandType::VmeMbltSwapped,
            address,
            amod: amods::MBLT64,
            transfers: max_transfers,
            ..StackCommand::default()
        })
    }

    pub fn add_vme_write(
        &mut self,
        address: u32,
        value: u32,
        amod: u8,
        data_width: VmeDataWidth,
    ) -> &mut Self {
        self.add_command(StackCommand {
            cmd_type: StackCommandType::VmeWrite,
            address,
            value,
            amod,
            data_width,
            ..StackCommand::default()
        })
    }

    pub fn add_write_marker(&mut self, value: u32) -> &mut Self {
        self.add_command(StackCommand {
            cmd_type: StackCommandType::WriteMarker,
            value,
            ..StackCommand::default()
        })
    }

    pub fn add_write_signal_word(&mut self, value: u32) -> &mut Self {
        self.add_command(StackCommand {
            cmd_type: StackCommandType::WriteSignalWord,
            value,
            ..StackCommand::default()
        })
    }

    /// Suspends direct immediate execution for the given duration.
    ///
    /// Only valid for host-driven execution; encoding a delay into an
    /// uploaded stack is rejected by the codec.
    pub fn add_software_delay(&mut self, delay: Duration) -> &mut Self {
        self.add_command(StackCommand {
            cmd_type: StackCommandType::SoftwareDelay,
            value: delay.as_millis().min(u32::MAX as u128) as u32,
            ..StackCommand::default()
        })
    }

    /// Flattened command list, concatenating all groups in order.
    pub fn commands(&self) -> Vec<StackCommand> {
        self.groups
            .iter()
            .flat_map(|g| g.commands.iter().copied())
            .collect()
    }

    pub fn group_commands(&self, index: usize) -> Vec<StackCommand> {
        self.group(index).map(|g| g.commands.clone()).unwrap_or_default()
    }

    pub fn group_commands_by_name(&self, name: &str) -> Vec<StackCommand> {
        self.group_by_name(name)
            .map(|g| g.commands.clone())
            .unwrap_or_default()
    }

    /// True if no group holds a command.
    pub fn empty(&self) -> bool {
        self.groups.iter().all(Group::empty)
    }

    /// True if any command makes the device emit output words.
    pub fn produces_output(&self) -> bool {
        self.groups
            .iter()
            .flat_map(|g| g.commands.iter())
            .any(produces_output)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn default_command_is_invalid() {
        let cmd = StackCommand::default();
        assert!(!cmd.is_valid());
        assert_eq!(cmd.cmd_type, StackCommandType::Invalid);
    }

    #[test]
    fn commands_go_to_open_group() {
        let mut b = StackCommandBuilder::new();
        b.add_write_marker(1);
        b.begin_group("module0");
        b.add_vme_read(0x6000, amods::A32, VmeDataWidth::D16);
        b.add_vme_read(0x6002, amods::A32, VmeDataWidth::D16);
        b.begin_group("module1");
        b.add_write_marker(2);

        assert_eq!(b.group_count(), 3);
        assert_eq!(b.group(0).unwrap().name, "");
        assert_eq!(b.group(0).unwrap().commands.len(), 1);
        assert_eq!(b.group_by_name("module0").unwrap().commands.len(), 2);
        assert_eq!(b.group_by_name("module1").unwrap().commands.len(), 1);

        // Flattening preserves group order.
        let flat = b.commands();
        assert_eq!(flat.len(), 4);
        assert_eq!(flat[0].cmd_type, StackCommandType::WriteMarker);
        assert_eq!(flat[1].address, 0x6000);
        assert_eq!(flat[2].address, 0x6002);
        assert_eq!(flat[3].value, 2);
    }

    #[test]
    fn empty_semantics() {
        let mut b = StackCommandBuilder::new();
        assert!(b.empty());

        b.begin_group("only-empty-groups");
        b.begin_group("still-empty");
        assert!(b.empty());

        b.add_write_marker(0);
        assert!(!b.empty());
    }

    #[test]
    fn output_pipe_follows_suppress_flag() {
        let mut b = StackCommandBuilder::new();
        assert_eq!(b.output_pipe(), Pipe::Data.as_u8());

        b.set_suppress_pipe_output(true);
        assert_eq!(b.output_pipe(), SUPPRESS_PIPE_OUTPUT);
    }

    #[test]
    fn produces_output_classification() {
        let mut reads = StackCommandBuilder::new();
        reads.add_vme_read(0x6000, amods::A32, VmeDataWidth::D16);
        assert!(reads.produces_output());

        let mut writes = StackCommandBuilder::new();
        writes.add_vme_write(0x6000, 1, amods::A32, VmeDataWidth::D16);
        assert!(!writes.produces_output());

        writes.add_write_marker(0xAAAA_AAAA);
        assert!(writes.produces_output());
    }

    #[test]
    fn display_parse_roundtrip() {
        let mut b = StackCommandBuilder::new();
        b.add_vme_read(0x1234_5678, amods::A24, VmeDataWidth::D32)
            .add_vme_block_read(0x6000_0000, amods::BLT32, 128)
            .add_vme_mblt_swapped(0x7000_0000, 512)
            .add_vme_write(0x6000_0010, 0xCAFE, amods::A16, VmeDataWidth::D16)
            .add_write_marker(0x8718_0000)
            .add_write_signal_word(42)
            .add_software_delay(Duration::from_millis(250));

        for cmd in b.commands() {
            let text = cmd.to_string();
            let parsed: StackCommand = text.parse().unwrap();
            assert_eq!(parsed, cmd, "failed for {text:?}");
        }
    }

    #[test]
    fn parse_rejects_garbage() {
        assert!("".parse::<StackCommand>().is_err());
        assert!("bogus_command".parse::<StackCommand>().is_err());
        assert!("vme_read amod".parse::<StackCommand>().is_err());
        assert!("vme_read amod=0x09 width=d48".parse::<StackCommand>().is_err());
    }

    #[test]
    fn serde_roundtrip() {
        let mut b = StackCommandBuilder::named("event0");
        b.set_suppress_pipe_output(true);
        b.begin_group("mod0");
        b.add_vme_read(0x6000, amods::A32, VmeDataWidth::D16);
        b.add_write_marker(0xFFFF_0000);

        let json = serde_json::to_string(&b).unwrap();
        let back: StackCommandBuilder = serde_json::from_str(&json).unwrap();
        assert_eq!(b, back);
        assert!(back.suppress_pipe_output());
    }
}
