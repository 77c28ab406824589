//! The MSCP server: executes commands handed over by the port, runs unit
//! I/O against the storage backends, and queues end packets for the port.

mod cntrl;
mod unit;

pub use unit::{Unit, UnitState};

use std::collections::VecDeque;
use std::io;

use log::{debug, info, trace, warn};

use lesidrive_utils::hexprint::pretty_print_hex_block_zero;

use super::hostif::commarea::MSG_TYPE_SEQ;
use super::opcode::*;
use super::packet::{Command, End, MscpId, END_SIZE_GENERIC};
use super::{CommandSink, HostPort, Packet, Rejected};
use crate::backend::{BackendError, StorageBackend};
use crate::error::LesiResult;

/// Credit granted with every end packet.
const RESPONSE_CREDIT: u8 = 1;

/// Identity and fixed characteristics of the controller.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ControllerInfo {
    pub id: MscpId,
    pub hw_version: u8,
    pub fw_version: u8,
    /// Controller flags the host is allowed to set.
    pub flag_mask: u16,
}

impl Default for ControllerInfo {
    fn default() -> Self {
        ControllerInfo {
            id: MscpId {
                uid_low: 0x1337_1337,
                uid_high: 0x42,
                model: MODEL_UDA50,
                class: CLASS_MASS_STORAGE,
            },
            hw_version: 1,
            fw_version: 1,
            flag_mask: 0,
        }
    }
}

/// An end packet on its way back to the host.
#[derive(Debug)]
struct Reply {
    conn_id: u8,
    end: End,
    size: usize,
}

pub struct Server<B: StorageBackend> {
    info: ControllerInfo,
    flags: u16,
    commands: VecDeque<Packet>,
    responses: VecDeque<Packet>,
    units: Vec<Unit<B>>,
}

impl<B: StorageBackend> Server<B> {
    /// A server with `unit_count` units. Backends are attached to units in
    /// order; a unit without one stays offline.
    pub fn new(info: ControllerInfo, unit_count: usize, backends: Vec<B>) -> Self {
        let mut backends = backends.into_iter();
        let units = (0..unit_count)
            .map(|n| Unit::new(n as u16, info.id.uid_high, backends.next()))
            .collect();
        Server {
            info,
            flags: 0,
            commands: VecDeque::new(),
            responses: VecDeque::new(),
            units,
        }
    }

    pub fn units(&self) -> &[Unit<B>] {
        &self.units
    }

    pub fn controller_flags(&self) -> u16 {
        self.flags
    }

    pub fn pending_commands(&self) -> usize {
        self.commands.len()
    }

    pub fn pending_responses(&self) -> usize {
        self.responses.len()
    }

    pub fn start_backends(&mut self) -> Result<(), BackendError> {
        for unit in &mut self.units {
            unit.start()?;
        }
        Ok(())
    }

    pub fn stop_backends(&mut self) {
        for unit in &mut self.units {
            unit.stop();
        }
    }

    /// Execute every command handed over since the last call. Immediate
    /// commands are answered at once; I/O is queued on its unit.
    pub fn dispatch(&mut self) {
        while let Some(packet) = self.commands.pop_front() {
            self.run_command(packet);
        }
    }

    /// Hand queued end packets to the port until it pushes back.
    pub fn flush_responses<H: HostPort>(&mut self, host: &mut H) {
        while let Some(packet) = self.responses.pop_front() {
            if let Err(Rejected { error, packet }) = host.submit_response(packet) {
                trace!("Response queue stalled: {}", error);
                self.responses.push_front(packet);
                break;
            }
        }
    }

    /// Advance the I/O of every unit. Only a host reset is passed up; every
    /// other failure ends the command concerned.
    pub fn process_units<H: HostPort>(&mut self, host: &mut H) -> LesiResult<()> {
        let mut finished = Vec::new();
        let result = self
            .units
            .iter_mut()
            .try_for_each(|unit| unit.process(host, &mut finished));
        for reply in finished {
            self.queue_reply(reply);
        }
        result
    }

    /// Let the backends make progress and pick up media changes.
    pub fn pump_backends(&mut self) {
        for unit in &mut self.units {
            unit.pump();
        }
    }

    fn run_command(&mut self, packet: Packet) {
        let cmd = match Command::parse(&packet.data) {
            Ok(cmd) => cmd,
            Err(e) => {
                warn!("Dropping command packet of {} bytes: {}", packet.data.len(), e);
                return;
            }
        };
        debug!(
            "MSCP command {} ({}) ref {:#010X} unit {}",
            opcode_name(cmd.opcode),
            cmd.opcode,
            cmd.cmdref,
            cmd.unit
        );

        let n = cmd.unit as usize;
        if n >= self.units.len() {
            info!("Command for unit {} which does not exist", cmd.unit);
            self.queue_reply(Reply {
                conn_id: packet.conn_id,
                end: End::for_command(&cmd, ST_OFFLN),
                size: END_SIZE_GENERIC,
            });
            return;
        }

        let result = match cmd.opcode {
            OP_STCON => self.set_controller_chars(&cmd, &packet.data),
            OP_ONLIN => self.units[n].set_characteristics(&cmd, &packet.data, true),
            OP_STUNT => self.units[n].set_characteristics(&cmd, &packet.data, false),
            OP_AVAIL => Ok(self.units[n].available(&cmd)),
            OP_ABORT => self.units[n].abort(&cmd, &packet.data),
            OP_ACCES | OP_COMP | OP_READ | OP_WRITE | OP_ERASE => {
                self.units[n].enqueue(cmd, &packet);
                return;
            }
            _ => {
                info!("Unknown MSCP opcode {}", cmd.opcode);
                debug!("Command packet:\n{}", pretty_print_hex_block_zero(&packet.data));
                Ok((End::for_command(&cmd, ST_ICMD), END_SIZE_GENERIC))
            }
        };
        let (end, size) = result.unwrap_or_else(|e: io::Error| {
            warn!("Malformed {} command: {}", opcode_name(cmd.opcode), e);
            (End::for_command(&cmd, ST_ICMD), END_SIZE_GENERIC)
        });
        self.queue_reply(Reply {
            conn_id: packet.conn_id,
            end,
            size,
        });
    }

    fn queue_reply(&mut self, reply: Reply) {
        debug!(
            "MSCP end {:#04X} ref {:#010X} unit {} status {:#06X}",
            reply.end.endcode, reply.end.cmdref, reply.end.unit, reply.end.status
        );
        match reply.end.encode(reply.size) {
            Ok(data) => self.responses.push_back(Packet {
                msg_len: reply.size as u16,
                msg_type: MSG_TYPE_SEQ,
                credit: RESPONSE_CREDIT,
                conn_id: reply.conn_id,
                data,
            }),
            Err(e) => warn!("Could not encode end packet: {}", e),
        }
    }
}

impl<B: StorageBackend> CommandSink for Server<B> {
    fn enqueue_command(&mut self, packet: Packet) {
        self.commands.push_back(packet);
    }

    fn reinit(&mut self) {
        if !self.commands.is_empty() || !self.responses.is_empty() {
            info!(
                "Dropping {} commands and {} responses on reinit",
                self.commands.len(),
                self.responses.len()
            );
        }
        self.commands.clear();
        self.responses.clear();
        for unit in &mut self.units {
            unit.reinit();
        }
    }
}
