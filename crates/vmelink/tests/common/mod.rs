//! In-memory controller device used by the integration suites.
//!
//! Implements the transport contract with a register file, stack memory and
//! a scriptable VME address space. Super command buffers written to the
//! command pipe are answered with mirror responses; writing the immediate
//! trigger bit executes the program in stack memory and queues its output
//! as a stack frame, optionally fragmented into continuation frames.

#![allow(dead_code)]

use std::collections::{HashMap, VecDeque};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Condvar, Mutex};
use std::time::{Duration, Instant};

use vmelink_proto::stacks::{
    IMMEDIATE_EXEC, STACK0_OFFSET_REGISTER, STACK0_TRIGGER_REGISTER, STACK_MEMORY_BEGIN,
    STACK_MEMORY_WORDS,
};
use vmelink_proto::wire::{CMD_BUFFER_END, CMD_BUFFER_START, STACK_CMD_MASK, STACK_CMD_SHIFT};
use vmelink_proto::{
    amods, frame_flags, make_frame_header, stack_commands_from_buffer, FrameType, Pipe,
    StackCommandType, SuperCommandType, VmeDataWidth,
};
use vmelink_transport::{BusTransport, ConnectionType, Result as TransportResult, TransportError};

const MOCK_READ_TIMEOUT: Duration = Duration::from_millis(25);

/// Routes library logs to the test output; safe to call from every test.
pub fn init_tracing() {
    let _ = tracing_subscriber::fmt()
        .with_test_writer()
        .with_max_level(tracing::level_filters::LevelFilter::DEBUG)
        .try_init();
}

#[derive(Default)]
struct DeviceState {
    /// Controller-local registers including stack memory addresses.
    registers: HashMap<u16, u32>,
    /// Simulated VME address space, one word per 4-byte address.
    vme_memory: HashMap<u32, u32>,
    /// Bytes waiting to be read from the command pipe.
    cmd_read_queue: VecDeque<u8>,
    /// Every request buffer received, in arrival order.
    request_log: Vec<Vec<u32>>,
    /// Frames queued to be emitted ahead of the next mirror response.
    pending_injections: Vec<Vec<u32>>,
    /// Corrupt one echoed word of the next mirror response.
    corrupt_next_mirror: bool,
    /// Maximum payload words per stack output frame; excess continues in
    /// StackContinuation frames.
    fragment_limit: Option<usize>,
}

pub struct MockDevice {
    state: Mutex<DeviceState>,
    data_ready: Condvar,
    connected: AtomicBool,
    disable_triggers: AtomicBool,
    read_timeouts: Mutex<[Duration; 2]>,
    write_timeouts: Mutex<[Duration; 2]>,
}

impl Default for MockDevice {
    fn default() -> Self {
        Self::new()
    }
}

impl MockDevice {
    pub fn new() -> Self {
        MockDevice {
            state: Mutex::new(DeviceState::default()),
            data_ready: Condvar::new(),
            connected: AtomicBool::new(false),
            disable_triggers: AtomicBool::new(false),
            read_timeouts: Mutex::new([MOCK_READ_TIMEOUT; 2]),
            write_timeouts: Mutex::new([MOCK_READ_TIMEOUT; 2]),
        }
    }

    pub fn set_register(&self, address: u16, value: u32) {
        self.state.lock().unwrap().registers.insert(address, value);
    }

    pub fn register(&self, address: u16) -> u32 {
        *self
            .state
            .lock()
            .unwrap()
            .registers
            .get(&address)
            .unwrap_or(&0)
    }

    pub fn set_vme_word(&self, address: u32, value: u32) {
        self.state.lock().unwrap().vme_memory.insert(address, value);
    }

    pub fn vme_word(&self, address: u32) -> u32 {
        *self
            .state
            .lock()
            .unwrap()
            .vme_memory
            .get(&address)
            .unwrap_or(&0)
    }

    pub fn requests(&self) -> Vec<Vec<u32>> {
        self.state.lock().unwrap().request_log.clone()
    }

    pub fn request_count(&self) -> usize {
        self.state.lock().unwrap().request_log.len()
    }

    pub fn queued_bytes(&self) -> usize {
        self.state.lock().unwrap().cmd_read_queue.len()
    }

    pub fn corrupt_next_mirror(&self) {
        self.state.lock().unwrap().corrupt_next_mirror = true;
    }

    pub fn set_fragment_limit(&self, limit: usize) {
        self.state.lock().unwrap().fragment_limit = Some(limit);
    }

    /// Queues a stack error notification frame for immediate pickup.
    pub fn push_notification(&self, stack_id: u8, flags: u8, line: u16) {
        let frame = error_notification(stack_id, flags, line);
        let mut state = self.state.lock().unwrap();
        enqueue_words(&mut state.cmd_read_queue, &frame);
        drop(state);
        self.data_ready.notify_all();
    }

    /// Emits a stack error notification ahead of the next mirror response,
    /// simulating a notification interleaved with a dialog.
    pub fn inject_notification_before_response(&self, stack_id: u8, flags: u8, line: u16) {
        self.state
            .lock()
            .unwrap()
            .pending_injections
            .push(error_notification(stack_id, flags, line));
    }
}

pub fn error_notification(stack_id: u8, flags: u8, line: u16) -> Vec<u32> {
    vec![
        make_frame_header(FrameType::StackError, stack_id, flags, 1),
        line as u32,
    ]
}

fn enqueue_words(queue: &mut VecDeque<u8>, words: &[u32]) {
    for word in words {
        queue.extend(word.to_le_bytes());
    }
}

fn word_tag(word: u32) -> u16 {
    (word >> 16) as u16
}

fn stack_tag(word: u32) -> u8 {
    ((word >> STACK_CMD_SHIFT) & STACK_CMD_MASK) as u8
}

impl DeviceState {
    /// Handles one request buffer: mirror response first, then any stack
    /// execution the request triggered.
    fn process_request(&mut self, request: &[u32]) {
        self.request_log.push(request.to_vec());

        for frame in std::mem::take(&mut self.pending_injections) {
            enqueue_words(&mut self.cmd_read_queue, &frame);
        }

        let mut results: Vec<u32> = Vec::new();
        let mut exec_requested = false;

        let mut index = 0;
        while index < request.len() {
            let word = request[index];
            let tag = word_tag(word);

            if tag == CMD_BUFFER_START || tag == CMD_BUFFER_END {
                index += 1;
                continue;
            }

            match SuperCommandType::from_tag(tag) {
                Some(SuperCommandType::ReferenceWord) | Some(SuperCommandType::WriteReset) => {}
                Some(SuperCommandType::ReadLocal) => {
                    let address = (word & 0xFFFF) as u16;
                    results.push(*self.registers.get(&address).unwrap_or(&0));
                }
                Some(SuperCommandType::ReadLocalBlock) => {
                    let address = (word & 0xFFFF) as u16;
                    let count = request.get(index + 1).copied().unwrap_or(0);
                    for i in 0..count {
                        let addr = address.wrapping_add((i * 4) as u16);
                        results.push(*self.registers.get(&addr).unwrap_or(&0));
                    }
                    index += 1;
                }
                Some(SuperCommandType::WriteLocal) => {
                    let address = (word & 0xFFFF) as u16;
                    let value = request.get(index + 1).copied().unwrap_or(0);
                    self.registers.insert(address, value);
                    if address == STACK0_TRIGGER_REGISTER && value & IMMEDIATE_EXEC != 0 {
                        exec_requested = true;
                    }
                    index += 1;
                }
                None => {}
            }

            index += 1;
        }

        // Mirror response: SuperFrame header, the echoed request minus the
        // framing words, then the result words.
        let mut echoed = request[1..request.len().saturating_sub(1)].to_vec();
        if self.corrupt_next_mirror {
            self.corrupt_next_mirror = false;
            if let Some(word) = echoed.first_mut() {
                *word ^= 0x1;
            }
        }

        let len = echoed.len() + results.len();
        let mut response = Vec::with_capacity(1 + len);
        response.push(make_frame_header(FrameType::SuperFrame, 0, 0, len as u16));
        response.extend(echoed);
        response.extend(results);
        enqueue_words(&mut self.cmd_read_queue, &response);

        if exec_requested {
            self.exec_stack0();
        }
    }

    /// Executes the program in stack memory at the stack 0 offset and
    /// queues its output frame(s).
    fn exec_stack0(&mut self) {
        let offset = *self.registers.get(&STACK0_OFFSET_REGISTER).unwrap_or(&0);
        let start = (STACK_MEMORY_BEGIN as u32 + offset) as u16;

        // Gather words up to and including the StackEnd marker.
        let mut program = Vec::new();
        for i in 0..STACK_MEMORY_WORDS {
            let address = start.wrapping_add(i * 4);
            let word = *self.registers.get(&address).unwrap_or(&0);
            program.push(word);
            if stack_tag(word) == StackCommandType::StackEnd as u8 {
                break;
            }
        }

        let Ok(commands) = stack_commands_from_buffer(&program) else {
            enqueue_words(
                &mut self.cmd_read_queue,
                &[make_frame_header(
                    FrameType::StackFrame,
                    0,
                    frame_flags::SYNTAX_ERROR,
                    0,
                )],
            );
            return;
        };

        let mut output = Vec::new();
        for cmd in commands {
            match cmd.cmd_type {
                StackCommandType::VmeRead | StackCommandType::SignallingVmeRead => {
                    if amods::is_block_mode(cmd.amod) {
                        for i in 0..cmd.transfers as u32 {
                            output
                                .push(*self.vme_memory.get(&(cmd.address + i * 4)).unwrap_or(&0));
                        }
                    } else {
                        let word = *self.vme_memory.get(&cmd.address).unwrap_or(&0);
                        let mask = match cmd.data_width {
                            VmeDataWidth::D16 => 0xFFFF,
                            VmeDataWidth::D32 => 0xFFFF_FFFF,
                        };
                        output.push(word & mask);
                    }
                }
                StackCommandType::VmeMbltSwapped => {
                    for i in 0..cmd.transfers as u32 {
                        output.push(*self.vme_memory.get(&(cmd.address + i * 4)).unwrap_or(&0));
                    }
                }
                StackCommandType::VmeWrite => {
                    self.vme_memory.insert(cmd.address, cmd.value);
                    // this device acknowledges writes by echoing the value
                    output.push(cmd.value);
                }
                StackCommandType::WriteMarker
                | StackCommandType::WriteSignalWord
                | StackCommandType::WriteSpecial => output.push(cmd.value),
                _ => {}
            }
        }

        self.emit_stack_frames(&output);
    }

    fn emit_stack_frames(&mut self, output: &[u32]) {
        let limit = self.fragment_limit.unwrap_or(usize::MAX).max(1);

        if output.len() <= limit {
            let mut frame = Vec::with_capacity(1 + output.len());
            frame.push(make_frame_header(
                FrameType::StackFrame,
                0,
                0,
                output.len() as u16,
            ));
            frame.extend_from_slice(output);
            enqueue_words(&mut self.cmd_read_queue, &frame);
            return;
        }

        let chunks: Vec<&[u32]> = output.chunks(limit).collect();
        for (i, chunk) in chunks.iter().enumerate() {
            let frame_type = if i == 0 {
                FrameType::StackFrame
            } else {
                FrameType::StackContinuation
            };
            let flags = if i + 1 < chunks.len() {
                frame_flags::CONTINUE
            } else {
                0
            };

            let mut frame = Vec::with_capacity(1 + chunk.len());
            frame.push(make_frame_header(frame_type, 0, flags, chunk.len() as u16));
            frame.extend_from_slice(chunk);
            enqueue_words(&mut self.cmd_read_queue, &frame);
        }
    }
}

impl BusTransport for MockDevice {
    fn connect(&self) -> TransportResult<()> {
        if self.connected.swap(true, Ordering::SeqCst) {
            return Err(TransportError::AlreadyConnected);
        }
        Ok(())
    }

    fn disconnect(&self) -> TransportResult<()> {
        if !self.connected.swap(false, Ordering::SeqCst) {
            return Err(TransportError::AlreadyDisconnected);
        }
        Ok(())
    }

    fn is_connected(&self) -> bool {
        self.connected.load(Ordering::SeqCst)
    }

    fn connection_type(&self) -> ConnectionType {
        ConnectionType::Usb
    }

    fn connection_info(&self) -> String {
        "mock device".into()
    }

    fn write(&self, pipe: Pipe, buf: &[u8]) -> TransportResult<usize> {
        if !self.is_connected() {
            return Err(TransportError::Closed);
        }
        if pipe != Pipe::Command {
            return Ok(buf.len());
        }

        let words: Vec<u32> = buf
            .chunks_exact(4)
            .map(|c| u32::from_le_bytes([c[0], c[1], c[2], c[3]]))
            .collect();

        let mut state = self.state.lock().unwrap();
        state.process_request(&words);
        drop(state);
        self.data_ready.notify_all();

        Ok(buf.len())
    }

    fn read(&self, pipe: Pipe, buf: &mut [u8]) -> TransportResult<usize> {
        if !self.is_connected() {
            return Err(TransportError::Closed);
        }
        if pipe != Pipe::Command {
            return Err(TransportError::Timeout { pipe });
        }

        let timeout = self.read_timeout(pipe);
        let deadline = Instant::now() + timeout;
        let mut state = self.state.lock().unwrap();

        while state.cmd_read_queue.is_empty() {
            let now = Instant::now();
            if now >= deadline {
                return Err(TransportError::Timeout { pipe });
            }
            let (next, _) = self
                .data_ready
                .wait_timeout(state, deadline - now)
                .unwrap();
            state = next;
        }

        let count = buf.len().min(state.cmd_read_queue.len());
        for slot in buf.iter_mut().take(count) {
            *slot = state.cmd_read_queue.pop_front().unwrap();
        }
        Ok(count)
    }

    fn set_write_timeout(&self, pipe: Pipe, timeout: Duration) -> TransportResult<()> {
        self.write_timeouts.lock().unwrap()[pipe.as_u8() as usize] = timeout;
        Ok(())
    }

    fn set_read_timeout(&self, pipe: Pipe, timeout: Duration) -> TransportResult<()> {
        self.read_timeouts.lock().unwrap()[pipe.as_u8() as usize] = timeout;
        Ok(())
    }

    fn write_timeout(&self, pipe: Pipe) -> Duration {
        self.write_timeouts.lock().unwrap()[pipe.as_u8() as usize]
    }

    fn read_timeout(&self, pipe: Pipe) -> Duration {
        self.read_timeouts.lock().unwrap()[pipe.as_u8() as usize]
    }

    fn set_disable_triggers_on_connect(&self, disable: bool) {
        self.disable_triggers.store(disable, Ordering::SeqCst);
    }

    fn disable_triggers_on_connect(&self) -> bool {
        self.disable_triggers.load(Ordering::SeqCst)
    }
}
