//! A unit: its state, its command queue, and the block I/O behind it.

use std::io;

use log::{debug, info, trace, warn};

use lesidrive_utils::read_le::bytes_to_words;
use lesidrive_utils::write_le::words_to_bytes;

use super::Reply;
use crate::backend::{
    BackendError, BlockCompletion, BlockRequest, MediaEvent, StorageBackend, BLOCK_SIZE,
};
use crate::error::{LesiError, LesiResult};
use crate::mscp::opcode::*;
use crate::mscp::packet::*;
use crate::mscp::{HostPort, Packet};

/// Largest piece of a transfer moved in one backend request, in bytes.
const TURN_SIZE: u32 = 512;
/// Buffer descriptors address 24 bits of host memory.
const BUFFER_ADDR_MASK: u32 = 0xFF_FFFF;
/// Unit flags the host may change.
const HOST_FLAGS: u16 = UF_WRTPS;

#[derive(Debug, Copy, Clone, PartialEq, Eq)]
pub enum UnitState {
    Offline,
    Available,
    Online,
}

#[derive(Debug, Copy, Clone, PartialEq, Eq)]
enum CommandState {
    Queued,
    Active,
    /// Abort requested, not yet noticed.
    Aborted,
    /// Aborted while a request was in flight; waits for its completion.
    Aborting,
    /// Finished, the end packet goes out on this pass.
    Reply,
}

/// A transfer command queued on a unit.
#[derive(Debug)]
struct UnitCommand {
    cmd: Command,
    xfer: Transfer,
    conn_id: u8,
    state: CommandState,
    status: u16,
    /// Bytes done.
    pos: u32,
    lba: u32,
    /// Bytes moved by the turn in progress.
    turn: u32,
    /// Built but refused by a busy backend.
    pending: Option<BlockRequest>,
    /// Host data for a compare turn.
    host_data: Vec<u8>,
    /// This command owns the backend request in flight.
    issued: bool,
}

impl UnitCommand {
    fn finish(&mut self, status: u16) {
        self.status = status;
        self.state = CommandState::Reply;
        self.pending = None;
    }

    fn end(&self) -> End {
        let mut end = End::for_command(&self.cmd, self.status);
        end.body = EndBody::Transfer {
            bytecnt: self.pos,
            buffer: self.xfer.buffer,
            first_bad: if self.status == ST_DATA { self.lba } else { 0 },
        };
        end
    }

    fn host_addr(&self) -> u32 {
        self.xfer.buffer.wrapping_add(self.pos) & BUFFER_ADDR_MASK
    }

    fn turn_blocks(&self) -> u32 {
        (self.turn + BLOCK_SIZE as u32 - 1) / BLOCK_SIZE as u32
    }

    /// A host buffer transfer went wrong. A reset is passed up, anything else
    /// ends the command.
    fn host_failed(&mut self, e: LesiError) -> LesiResult<()> {
        if e == LesiError::Reset {
            return Err(e);
        }
        warn!("Host buffer transfer for command {:#010X} failed: {}", self.cmd.cmdref, e);
        self.finish(ST_HSTBF);
        Ok(())
    }

    fn read_host_data<H: HostPort>(&mut self, host: &mut H) -> LesiResult<Option<Vec<u8>>> {
        let mut words = vec![0; (self.turn as usize + 1) / 2];
        match host.read_host(self.host_addr(), &mut words) {
            Ok(()) => {
                let mut data = words_to_bytes(&words);
                data.truncate(self.turn as usize);
                Ok(Some(data))
            }
            Err(e) => self.host_failed(e).map(|_| None),
        }
    }

    /// Size the next turn and build its backend request, fetching host data
    /// first where the opcode needs it. None if the command ended instead.
    fn prepare_turn<H: HostPort>(&mut self, host: &mut H) -> LesiResult<Option<BlockRequest>> {
        self.turn = (self.xfer.bytecnt - self.pos).min(TURN_SIZE);
        let blocks = self.turn_blocks();
        let request = match self.cmd.opcode {
            OP_READ => BlockRequest::read(self.lba, blocks),
            OP_COMP => match self.read_host_data(host)? {
                Some(data) => {
                    self.host_data = data;
                    BlockRequest::read(self.lba, blocks)
                }
                None => return Ok(None),
            },
            OP_WRITE => match self.read_host_data(host)? {
                Some(mut data) => {
                    data.resize(blocks as usize * BLOCK_SIZE, 0);
                    BlockRequest::write(self.lba, data)
                }
                None => return Ok(None),
            },
            OP_ERASE => BlockRequest::write(self.lba, vec![0; blocks as usize * BLOCK_SIZE]),
            _ => {
                self.finish(ST_ICMD);
                return Ok(None);
            }
        };
        Ok(Some(request))
    }
}

pub struct Unit<B: StorageBackend> {
    number: u16,
    state: UnitState,
    flags: u16,
    id: MscpId,
    vsn: u32,
    spindles: u8,
    media: u32,
    block_count: u32,
    block_size: u16,
    backend: Option<B>,
    /// A backend request is in flight, possibly for a command already gone.
    busy: bool,
    queue: Vec<UnitCommand>,
}

impl<B: StorageBackend> Unit<B> {
    pub(super) fn new(number: u16, uid_high: u16, backend: Option<B>) -> Self {
        Unit {
            number,
            state: UnitState::Offline,
            flags: 0,
            id: MscpId {
                uid_low: number as u32,
                uid_high,
                model: MODEL_UDA50,
                class: CLASS_DISK,
            },
            vsn: 0,
            spindles: 1,
            media: MEDIA_ID,
            block_count: 0,
            block_size: BLOCK_SIZE as u16,
            backend,
            busy: false,
            queue: Vec::new(),
        }
    }

    pub fn number(&self) -> u16 {
        self.number
    }

    pub fn state(&self) -> UnitState {
        self.state
    }

    pub fn flags(&self) -> u16 {
        self.flags
    }

    pub fn block_count(&self) -> u32 {
        self.block_count
    }

    pub fn block_size(&self) -> u16 {
        self.block_size
    }

    pub fn queued(&self) -> usize {
        self.queue.len()
    }

    pub(super) fn start(&mut self) -> Result<(), BackendError> {
        match &mut self.backend {
            Some(backend) => backend.start(),
            None => Ok(()),
        }
    }

    pub(super) fn stop(&mut self) {
        if let Some(backend) = &mut self.backend {
            backend.stop();
        }
    }

    pub(super) fn enqueue(&mut self, cmd: Command, packet: &Packet) {
        let xfer = match Transfer::parse(&packet.data) {
            Ok(xfer) => xfer,
            Err(e) => {
                warn!("Malformed transfer command: {}", e);
                Transfer::default()
            }
        };
        debug!(
            "Unit {}: queued {} of {} bytes at block {}, buffer {:#08X}",
            self.number,
            opcode_name(cmd.opcode),
            xfer.bytecnt,
            xfer.lba,
            xfer.buffer
        );
        self.queue.push(UnitCommand {
            cmd,
            xfer,
            conn_id: packet.conn_id,
            state: CommandState::Queued,
            status: ST_SUCC,
            pos: 0,
            lba: xfer.lba,
            turn: 0,
            pending: None,
            host_data: Vec::new(),
            issued: false,
        });
    }

    /// ONLINE when `online`, SET UNIT CHARACTERISTICS otherwise.
    pub(super) fn set_characteristics(
        &mut self,
        cmd: &Command,
        data: &[u8],
        online: bool,
    ) -> io::Result<(End, usize)> {
        let params = OnlineParams::parse(data)?;
        debug!(
            "Unit {}: flags {:04X} device parameters {:08X}",
            self.number, params.unitflgs, params.ddp
        );
        let mut end = End::for_command(cmd, ST_SUCC);
        match self.state {
            UnitState::Offline => {
                info!("Unit {} is offline", self.number);
                end.status = ST_OFFLN;
                return Ok((end, END_SIZE_UNIT));
            }
            UnitState::Available if online => {
                info!("Unit {} online", self.number);
                self.state = UnitState::Online;
            }
            UnitState::Available => {
                info!("Unit {} is available, not online", self.number);
                end.status = ST_AVLBL;
                return Ok((end, END_SIZE_UNIT));
            }
            UnitState::Online => {}
        }
        self.flags = (self.flags & !HOST_FLAGS) | (params.unitflgs & HOST_FLAGS);
        end.body = EndBody::Unit {
            multiunit: 0,
            unitflgs: self.flags,
            spindles: self.spindles,
            unit_id: self.id,
            media: self.media,
            size: self.block_count,
            vsn: self.vsn,
        };
        Ok((end, END_SIZE_UNIT))
    }

    pub(super) fn available(&mut self, cmd: &Command) -> (End, usize) {
        let status = match self.state {
            UnitState::Offline => ST_OFFLN,
            UnitState::Online => {
                info!("Unit {} available", self.number);
                self.state = UnitState::Available;
                ST_SUCC
            }
            UnitState::Available => ST_SUCC,
        };
        (End::for_command(cmd, status), END_SIZE_GENERIC)
    }

    pub(super) fn abort(&mut self, cmd: &Command, data: &[u8]) -> io::Result<(End, usize)> {
        let orn = parse_abort(data)?;
        for queued in &mut self.queue {
            if queued.cmd.cmdref == orn && queued.state != CommandState::Reply {
                info!("Unit {}: aborting command {:#010X}", self.number, orn);
                queued.state = CommandState::Aborted;
            }
        }
        let mut end = End::for_command(cmd, ST_SUCC);
        end.body = EndBody::Abort { orn };
        Ok((end, END_SIZE_ABORT))
    }

    pub(super) fn media_event(&mut self, event: MediaEvent) {
        match event {
            MediaEvent::Inserted { block_count, block_size, read_only } => {
                info!(
                    "Unit {}: medium of {} blocks inserted{}",
                    self.number,
                    block_count,
                    if read_only { ", write protected" } else { "" }
                );
                if self.state == UnitState::Offline {
                    self.state = UnitState::Available;
                }
                self.block_count = block_count;
                self.block_size = block_size;
                if read_only {
                    self.flags |= UF_WRTPH;
                } else {
                    self.flags &= !UF_WRTPH;
                }
            }
            MediaEvent::Ejected => {
                info!("Unit {}: medium ejected", self.number);
                self.state = UnitState::Offline;
                self.block_count = 0;
            }
        }
    }

    pub(super) fn pump(&mut self) {
        let mut events = Vec::new();
        if let Some(backend) = &mut self.backend {
            backend.pump();
            while let Some(event) = backend.poll_event() {
                events.push(event);
            }
        }
        for event in events {
            self.media_event(event);
        }
    }

    pub(super) fn reinit(&mut self) {
        if !self.queue.is_empty() {
            debug!("Unit {}: dropping {} commands", self.number, self.queue.len());
        }
        self.queue.clear();
        if self.state == UnitState::Online {
            self.state = UnitState::Available;
        }
    }

    /// One pass over the queue: take a completion if there is one, move every
    /// command along, and hand finished commands to `finished`.
    pub(super) fn process<H: HostPort>(
        &mut self,
        host: &mut H,
        finished: &mut Vec<Reply>,
    ) -> LesiResult<()> {
        if let Some(completion) = self.backend.as_mut().and_then(|b| b.poll_completion()) {
            self.busy = false;
            self.complete(host, completion)?;
        }
        for idx in 0..self.queue.len() {
            self.step_command(host, idx)?;
        }

        let mut idx = 0;
        while idx < self.queue.len() {
            if self.queue[idx].state == CommandState::Reply {
                let done = self.queue.remove(idx);
                finished.push(Reply {
                    conn_id: done.conn_id,
                    end: done.end(),
                    size: END_SIZE_GENERIC,
                });
            } else {
                idx += 1;
            }
        }
        Ok(())
    }

    /// The checks every transfer goes through before touching the medium.
    /// Some status if the command is answered without any I/O.
    fn verify_access(&self, command: &UnitCommand) -> Option<u16> {
        let opcode = command.cmd.opcode;
        if self.state == UnitState::Available {
            info!("Unit {} is available, not online", self.number);
            return Some(ST_AVLBL);
        }
        if self.state == UnitState::Offline {
            info!("Unit {} is offline", self.number);
            return Some(ST_OFFLN);
        }
        if opcode == OP_WRITE || opcode == OP_ERASE {
            if self.flags & UF_WRTPH != 0 {
                return Some(status_with_subcode(ST_WRTPR, SC_HARDWARE));
            }
            if self.flags & UF_WRTPS != 0 {
                return Some(status_with_subcode(ST_WRTPR, SC_SOFTWARE));
            }
        }
        if command.xfer.lba > self.block_count {
            return Some(status_with_subcode(ST_ICMD, SC_LBA_OFFSET));
        }
        if command.xfer.bytecnt == 0 {
            return Some(ST_SUCC);
        }
        None
    }

    fn step_command<H: HostPort>(&mut self, host: &mut H, idx: usize) -> LesiResult<()> {
        match self.queue[idx].state {
            CommandState::Queued => {
                let verdict = self.verify_access(&self.queue[idx]);
                let command = &mut self.queue[idx];
                command.state = CommandState::Active;
                if let Some(status) = verdict {
                    command.finish(status);
                    return Ok(());
                }
                if command.cmd.opcode == OP_ACCES {
                    command.pos = command.xfer.bytecnt;
                    command.finish(ST_SUCC);
                    return Ok(());
                }
                self.start_turn(host, idx)
            }
            CommandState::Active if !self.queue[idx].issued => self.start_turn(host, idx),
            CommandState::Aborted => {
                let command = &mut self.queue[idx];
                if command.issued {
                    command.state = CommandState::Aborting;
                } else {
                    command.finish(ST_ABRTD);
                }
                Ok(())
            }
            _ => Ok(()),
        }
    }

    /// Get the next turn of command `idx` to the backend. Waits while another
    /// request is in flight.
    fn start_turn<H: HostPort>(&mut self, host: &mut H, idx: usize) -> LesiResult<()> {
        if self.busy {
            return Ok(());
        }
        let command = &mut self.queue[idx];
        if command.pending.is_none() {
            command.pending = command.prepare_turn(host)?;
        }
        let request = match command.pending.take() {
            Some(request) => request,
            None => return Ok(()),
        };
        let backend = match &mut self.backend {
            Some(backend) => backend,
            None => {
                command.finish(ST_DATA);
                return Ok(());
            }
        };
        trace!(
            "Unit {}: {:?} of {} blocks at {}",
            self.number,
            request.op,
            request.blocks,
            request.lba
        );
        match backend.submit(request) {
            Ok(()) => {
                command.issued = true;
                self.busy = true;
            }
            Err(request) => command.pending = Some(request),
        }
        Ok(())
    }

    fn complete<H: HostPort>(
        &mut self,
        host: &mut H,
        completion: BlockCompletion,
    ) -> LesiResult<()> {
        let idx = match self.queue.iter().position(|c| c.issued) {
            Some(idx) => idx,
            None => {
                debug!("Unit {}: dropping completion for a vanished command", self.number);
                return Ok(());
            }
        };
        let command = &mut self.queue[idx];
        command.issued = false;
        if matches!(command.state, CommandState::Aborted | CommandState::Aborting) {
            command.finish(ST_ABRTD);
            return Ok(());
        }

        let data = match completion.result {
            Ok(data) => data,
            Err(e) => {
                warn!("Unit {}: block I/O at {} failed: {}", self.number, completion.lba, e);
                command.finish(ST_DATA);
                return Ok(());
            }
        };
        let len = (command.turn as usize).min(data.len());
        match command.cmd.opcode {
            OP_READ => {
                let words = bytes_to_words(&data[..len]);
                if let Err(e) = host.write_host(command.host_addr(), &words) {
                    return command.host_failed(e);
                }
            }
            OP_COMP => {
                if data[..len] != command.host_data[..] {
                    info!("Unit {}: compare mismatch at block {}", self.number, command.lba);
                    command.finish(ST_COMP);
                    return Ok(());
                }
            }
            _ => {}
        }

        command.lba += command.turn_blocks();
        command.pos += command.turn;
        if command.pos >= command.xfer.bytecnt {
            command.finish(ST_SUCC);
            return Ok(());
        }
        self.start_turn(host, idx)
    }
}
