//! Transaction dialog engine for the command pipe.
//!
//! Every operation here is one atomic request/response exchange from the
//! caller's perspective. The controller stores the [`Dialog`] inside the
//! command-pipe mutex, so holding a `&mut Dialog` and holding the
//! command-pipe lock are the same thing by construction; no dialog I/O can
//! interleave with the background poller.

use std::sync::{Arc, Mutex, MutexGuard};

use bytes::{Buf, BufMut, Bytes, BytesMut};
use tracing::{debug, trace};

use vmelink_proto::stacks::{
    IMMEDIATE_EXEC, STACK0_OFFSET_REGISTER, STACK0_TRIGGER_REGISTER, STACK_OFFSET_BIT_MASK,
};
use vmelink_proto::{
    extract_frame_info, frame_flags, is_known_frame_header, is_stack_continuation,
    is_stack_error_notification, is_stack_frame, is_super_frame, make_command_buffer,
    make_stack_upload_commands_from, Pipe, StackCommand, StackCommandBuilder, SuperCommandBuilder,
    VmeDataWidth, WORD_SIZE,
};
use vmelink_transport::{BusTransport, TransportError};

use crate::counters::{update_stack_error_counters, StackErrorCounters};
use crate::error::{ControllerError, Result};

/// Byte offset of the immediate execution stack inside the window.
const IMMEDIATE_STACK_OFFSET_BYTES: u16 = 0;

/// Verifies the echo part of a mirror response against the request.
///
/// The exemptions from the verbatim comparison are enumerated here and
/// nowhere else: word 0 of the request is the CmdBufferStart framing word,
/// which the device answers with its SuperFrame header, and the trailing
/// CmdBufferEnd word is not echoed at all. Every word in between must match
/// exactly; all device-filled results trail the mirrored prefix.
pub fn check_mirror(request: &[u32], response: &[u32]) -> Result<()> {
    if request.is_empty() {
        return Err(ControllerError::MirrorEmptyRequest);
    }
    if response.is_empty() {
        return Err(ControllerError::MirrorEmptyResponse);
    }
    if response.len() < request.len() - 1 {
        return Err(ControllerError::MirrorShortResponse {
            expected: request.len() - 1,
            actual: response.len(),
        });
    }

    for index in 1..request.len() - 1 {
        if request[index] != response[index] {
            return Err(ControllerError::MirrorMismatch {
                index,
                expected: request[index],
                actual: response[index],
            });
        }
    }

    Ok(())
}

/// Command-pipe dialog state: the rolling reference-word counter and the
/// last response buffer kept for diagnostics.
pub struct Dialog {
    next_reference: u16,
    response: Vec<u32>,
    counters: Arc<Mutex<StackErrorCounters>>,
}

impl Dialog {
    pub fn new(counters: Arc<Mutex<StackErrorCounters>>) -> Self {
        Dialog {
            next_reference: 1,
            response: Vec::new(),
            counters,
        }
    }

    /// The last buffer read by a dialog operation. On an
    /// `InvalidBufferHeader` error this holds the offending word.
    pub fn last_response(&self) -> &[u32] {
        &self.response
    }

    fn take_reference(&mut self) -> u16 {
        let reference = self.next_reference;
        self.next_reference = self.next_reference.wrapping_add(1);
        reference
    }

    // A poisoned counter lock only means another thread panicked while
    // counting; the counts stay usable.
    fn lock_counters(&self) -> MutexGuard<'_, StackErrorCounters> {
        self.counters
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
    }

    /// Writes one request buffer to the command pipe, retrying partial
    /// writes until the buffer is fully on the wire.
    pub fn write_buffer(&mut self, transport: &dyn BusTransport, buffer: &[u32]) -> Result<()> {
        let mut bytes = BytesMut::with_capacity(buffer.len() * WORD_SIZE);
        for &word in buffer {
            bytes.put_u32_le(word);
        }

        let mut offset = 0;
        while offset < bytes.len() {
            match transport.write(Pipe::Command, &bytes[offset..])? {
                0 => return Err(TransportError::Closed.into()),
                written => offset += written,
            }
        }

        trace!(words = buffer.len(), "request buffer written");
        Ok(())
    }

    /// Reads exactly `count` words, looping over partial transfers. A
    /// timeout with zero progress surfaces as a transport timeout; a
    /// timeout mid-frame is a short read.
    fn read_words(&mut self, transport: &dyn BusTransport, count: usize) -> Result<Vec<u32>> {
        let needed = count * WORD_SIZE;
        let mut buf = vec![0u8; needed];
        let mut filled = 0usize;

        while filled < needed {
            match transport.read(Pipe::Command, &mut buf[filled..]) {
                Ok(0) => return Err(TransportError::Closed.into()),
                Ok(read) => filled += read,
                Err(err) if err.is_timeout() && filled == 0 => return Err(err.into()),
                Err(err) if err.is_timeout() => {
                    return Err(ControllerError::ShortRead {
                        expected_words: count,
                        actual_words: filled / WORD_SIZE,
                    })
                }
                Err(err) => return Err(err.into()),
            }
        }

        let mut bytes = Bytes::from(buf);
        Ok((0..count).map(|_| bytes.get_u32_le()).collect())
    }

    /// Reads one framed buffer: a known header word followed by the number
    /// of payload words the header announces.
    pub fn read_known_buffer(&mut self, transport: &dyn BusTransport) -> Result<Vec<u32>> {
        let header = self.read_words(transport, 1)?[0];

        if !is_known_frame_header(header) {
            self.response = vec![header];
            return Err(ControllerError::InvalidBufferHeader { header });
        }

        let info = extract_frame_info(header);
        let mut buffer = Vec::with_capacity(1 + info.len as usize);
        buffer.push(header);
        if info.len > 0 {
            buffer.extend(self.read_words(transport, info.len as usize)?);
        }

        trace!(header, len = info.len, "frame read");
        Ok(buffer)
    }

    /// Reads buffers until one that is not a stack error notification
    /// arrives, folding notifications into the shared counters, then
    /// validates the survivor's header.
    pub fn read_response(
        &mut self,
        transport: &dyn BusTransport,
        validator: fn(u32) -> bool,
    ) -> Result<Vec<u32>> {
        loop {
            let buffer = self.read_known_buffer(transport)?;
            let header = buffer[0];

            if is_stack_error_notification(header) {
                debug!(header, "stack error notification interleaved with dialog");
                update_stack_error_counters(&mut self.lock_counters(), &buffer);
                continue;
            }

            self.response = buffer.clone();

            if !validator(header) {
                return Err(ControllerError::InvalidBufferHeader { header });
            }

            return Ok(buffer);
        }
    }

    /// Sends a request buffer and verifies the mirrored response. Returns
    /// the full response including the frame header; result words trail
    /// the mirrored prefix.
    pub fn mirror_transaction(
        &mut self,
        transport: &dyn BusTransport,
        request: &[u32],
    ) -> Result<Vec<u32>> {
        if request.is_empty() {
            return Err(ControllerError::MirrorEmptyRequest);
        }

        self.write_buffer(transport, request)?;
        let response = self.read_response(transport, is_super_frame)?;
        check_mirror(request, &response)?;
        Ok(response)
    }

    /// Encodes and runs a super command sequence as one mirror transaction.
    pub fn super_transaction(
        &mut self,
        transport: &dyn BusTransport,
        builder: &SuperCommandBuilder,
    ) -> Result<Vec<u32>> {
        self.mirror_transaction(transport, &make_command_buffer(builder))
    }

    /// Uploads an encoded stack into device stack memory via a mirror
    /// transaction, prefixed with a fresh reference word.
    pub fn upload_stack(
        &mut self,
        transport: &dyn BusTransport,
        output_pipe: u8,
        offset_bytes: u16,
        commands: &[StackCommand],
    ) -> Result<Vec<u32>> {
        let upload = make_stack_upload_commands_from(output_pipe, offset_bytes, commands)?;
        let reference = self.take_reference();

        let mut builder = SuperCommandBuilder::new();
        builder.add_reference_word(reference).add_commands(&upload);

        self.super_transaction(transport, &builder)
    }

    /// Triggers one immediate execution of the stack at `offset_bytes`.
    pub fn exec_immediate_stack(
        &mut self,
        transport: &dyn BusTransport,
        offset_bytes: u16,
    ) -> Result<()> {
        self.write_register(
            transport,
            STACK0_OFFSET_REGISTER,
            (offset_bytes & STACK_OFFSET_BIT_MASK) as u32,
        )?;
        self.write_register(transport, STACK0_TRIGGER_REGISTER, IMMEDIATE_EXEC)
    }

    /// Uploads a stack program to the immediate region, executes it and
    /// returns its reassembled output.
    ///
    /// Fragmented responses are stitched together through the CONTINUE
    /// flag: continuation frames contribute their payload words only. The
    /// final frame's flags decide the outcome: the device timeout flag maps
    /// to `NoVmeResponse`, the syntax flag to `StackSyntaxError`.
    pub fn stack_transaction(
        &mut self,
        transport: &dyn BusTransport,
        commands: &[StackCommand],
    ) -> Result<Vec<u32>> {
        self.upload_stack(
            transport,
            Pipe::Command.as_u8(),
            IMMEDIATE_STACK_OFFSET_BYTES,
            commands,
        )?;
        self.exec_immediate_stack(transport, IMMEDIATE_STACK_OFFSET_BYTES)?;

        let mut response = self.read_response(transport, is_stack_frame)?;
        let mut flags = extract_frame_info(response[0]).flags;

        while flags & frame_flags::CONTINUE != 0 {
            let continuation = self.read_response(transport, is_stack_continuation)?;
            response.extend_from_slice(&continuation[1..]);
            flags = extract_frame_info(continuation[0]).flags;
        }

        self.response = response.clone();

        if flags & frame_flags::TIMEOUT != 0 {
            return Err(ControllerError::NoVmeResponse);
        }
        if flags & frame_flags::SYNTAX_ERROR != 0 {
            return Err(ControllerError::StackSyntaxError);
        }

        Ok(response)
    }

    /// Reads a controller-local register via a mirror transaction.
    pub fn read_register(&mut self, transport: &dyn BusTransport, address: u16) -> Result<u32> {
        let reference = self.take_reference();
        let mut builder = SuperCommandBuilder::new();
        builder.add_reference_word(reference).add_read_local(address);

        let response = self.super_transaction(transport, &builder)?;

        // header, reference echo, read command echo, result word
        if response.len() < 4 {
            return Err(ControllerError::UnexpectedResponseSize {
                expected: 4,
                actual: response.len(),
            });
        }

        Ok(response[3])
    }

    /// Writes a controller-local register via a mirror transaction; the
    /// mirror check is the write acknowledgement.
    pub fn write_register(
        &mut self,
        transport: &dyn BusTransport,
        address: u16,
        value: u32,
    ) -> Result<()> {
        let reference = self.take_reference();
        let mut builder = SuperCommandBuilder::new();
        builder
            .add_reference_word(reference)
            .add_write_local(address, value);

        self.super_transaction(transport, &builder).map(drop)
    }

    /// Single VME read through a one-command immediate stack.
    pub fn vme_read(
        &mut self,
        transport: &dyn BusTransport,
        address: u32,
        amod: u8,
        data_width: VmeDataWidth,
    ) -> Result<u32> {
        let mut stack = StackCommandBuilder::new();
        stack.add_vme_read(address, amod, data_width);

        let response = self.stack_transaction(transport, &stack.commands())?;

        if response.len() < 2 {
            return Err(ControllerError::UnexpectedResponseSize {
                expected: 2,
                actual: response.len(),
            });
        }

        Ok(response[1] & data_width.value_mask())
    }

    /// Single VME write through a one-command immediate stack.
    pub fn vme_write(
        &mut self,
        transport: &dyn BusTransport,
        address: u32,
        value: u32,
        amod: u8,
        data_width: VmeDataWidth,
    ) -> Result<()> {
        let mut stack = StackCommandBuilder::new();
        stack.add_vme_write(address, value, amod, data_width);

        self.stack_transaction(transport, &stack.commands()).map(drop)
    }

    /// VME block read through a one-command immediate stack. Returns the
    /// payload words without the frame header.
    pub fn vme_block_read(
        &mut self,
        transport: &dyn BusTransport,
        address: u32,
        amod: u8,
        max_transfers: u16,
    ) -> Result<Vec<u32>> {
        let mut stack = StackCommandBuilder::new();
        stack.add_vme_block_read(address, amod, max_transfers);

        let response = self.stack_transaction(transport, &stack.commands())?;
        Ok(response[1..].to_vec())
    }
}
