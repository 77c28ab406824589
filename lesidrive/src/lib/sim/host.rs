use log::debug;

use super::model::{SaReply, SimulatedKlesi};
use crate::mscp::hostif::commarea::{
    Descriptor, Envelope, CAHDR_SIZE, DESC_SIZE, ENVELOPE_SIZE, MSG_TYPE_SEQ,
};
use crate::mscp::hostif::sareg::*;

/// Space reserved per message buffer, envelope included.
const MESSAGE_STRIDE: u32 = 0x200;

/// What the simulated host operating system asks for during port
/// initialization.
#[derive(Debug, Clone)]
pub struct HostConfig {
    /// Address of the response ring; the communication area header sits
    /// just below it.
    pub ringbase: u32,
    /// Command ring holds `1 << cring_exp` slots.
    pub cring_exp: u8,
    pub rring_exp: u8,
    /// 0 runs the host polled.
    pub vector: u16,
    /// Interrupt on each initialization step.
    pub init_interrupts: bool,
    /// Longwords per NPR transfer; 0 takes the port default.
    pub burst: u8,
}

impl Default for HostConfig {
    fn default() -> Self {
        HostConfig {
            ringbase: 0x1000,
            cring_exp: 2,
            rring_exp: 2,
            vector: 0,
            init_interrupts: false,
            burst: 0,
        }
    }
}

impl HostConfig {
    /// The four values the host writes to SA during initialization.
    pub fn init_words(&self) -> [u16; 4] {
        let mut step1 = SA_INIT1W_VALID
            | ((self.cring_exp as u16) << SA_INIT1W_CRING_BIT) & SA_INIT1W_CRING_MASK
            | ((self.rring_exp as u16) << SA_INIT1W_RRING_BIT) & SA_INIT1W_RRING_MASK
            | (self.vector / 4) & SA_INIT1W_VADR_MASK;
        if self.init_interrupts {
            step1 |= SA_INIT1W_IE;
        }
        let step2 = (self.ringbase as u16) & SA_INIT2W_RINGBASE_MASK;
        let step3 = ((self.ringbase >> 16) as u16) & SA_INIT3W_HRBASE_MASK;
        let step4 = ((self.burst as u16) << SA_INIT4W_BURST_BIT) | SA_INIT4W_GO;
        [step1, step2, step3, step4]
    }
}

/// A response collected from the response ring.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct HostResponse {
    pub envelope: Envelope,
    pub data: Vec<u8>,
}

/// Plays the host operating system's side of the rings.
pub struct HostDriver {
    sim: SimulatedKlesi,
    config: HostConfig,
    csize: u32,
    rsize: u32,
    cmd_idx: u32,
    rsp_offer_idx: u32,
    rsp_take_idx: u32,
}

impl HostDriver {
    pub fn new(sim: SimulatedKlesi, config: HostConfig) -> Self {
        let csize = 1 << config.cring_exp;
        let rsize = 1 << config.rring_exp;
        HostDriver {
            sim,
            config,
            csize,
            rsize,
            cmd_idx: 0,
            rsp_offer_idx: 0,
            rsp_take_idx: 0,
        }
    }

    pub fn sim(&self) -> &SimulatedKlesi {
        &self.sim
    }

    pub fn config(&self) -> &HostConfig {
        &self.config
    }

    /// Queue the replies for a complete initialization handshake.
    pub fn script_init(&self) {
        let words = self.config.init_words();
        self.sim.script_sa(words.into_iter().map(SaReply::Value));
    }

    pub fn cahdr(&self) -> u32 {
        self.config.ringbase - CAHDR_SIZE
    }

    pub fn rring(&self) -> u32 {
        self.config.ringbase
    }

    pub fn cring(&self) -> u32 {
        self.config.ringbase + DESC_SIZE * self.rsize
    }

    fn message_area(&self) -> u32 {
        let end = self.cring() + DESC_SIZE * self.csize;
        (end + 0xFF) & !0xFF
    }

    fn cmd_buffer(&self, slot: u32) -> u32 {
        self.message_area() + slot * MESSAGE_STRIDE
    }

    fn rsp_buffer(&self, slot: u32) -> u32 {
        self.message_area() + (self.csize + slot) * MESSAGE_STRIDE
    }

    /// First free byte above the rings and message buffers, for data
    /// buffers.
    pub fn data_area(&self) -> u32 {
        self.message_area() + (self.csize + self.rsize) * MESSAGE_STRIDE
    }

    fn descriptor_flags(&self) -> u32 {
        if self.config.vector != 0 {
            Descriptor::OWNER | Descriptor::FLAG
        } else {
            Descriptor::OWNER
        }
    }

    /// Place a command in the next command ring slot and ask the port to
    /// poll. Returns false if the port still owns the slot.
    pub fn post_command(&mut self, body: &[u8], conn_id: u8) -> bool {
        let slot_addr = self.cring() + DESC_SIZE * self.cmd_idx;
        if Descriptor(self.sim.read_memory_u32(slot_addr)).owner() {
            return false;
        }
        let buffer = self.cmd_buffer(self.cmd_idx);
        let envelope = Envelope {
            msg_len: body.len() as u16,
            msg_type: MSG_TYPE_SEQ,
            credit: 0,
            conn_id,
        };
        self.sim.write_memory(buffer, &envelope.to_bytes());
        self.sim.write_memory(buffer + ENVELOPE_SIZE, body);
        let desc = self.descriptor_flags() | (buffer + ENVELOPE_SIZE);
        self.sim.write_memory_u32(slot_addr, desc);
        debug!("Host posted command in slot {} ({} bytes)", self.cmd_idx, body.len());

        self.cmd_idx = (self.cmd_idx + 1) % self.csize;
        self.sim.post_poll();
        true
    }

    /// Hand the next response slot to the port with room for `buf_len`
    /// bytes.
    pub fn offer_response_slot(&mut self, buf_len: u16) {
        let slot_addr = self.rring() + DESC_SIZE * self.rsp_offer_idx;
        let buffer = self.rsp_buffer(self.rsp_offer_idx);
        let envelope = Envelope {
            msg_len: buf_len,
            ..Envelope::default()
        };
        self.sim.write_memory(buffer, &envelope.to_bytes());
        let desc = self.descriptor_flags() | (buffer + ENVELOPE_SIZE);
        self.sim.write_memory_u32(slot_addr, desc);
        self.rsp_offer_idx = (self.rsp_offer_idx + 1) % self.rsize;
    }

    /// Collect the next filled response slot, if the port has returned it.
    pub fn take_response(&mut self) -> Option<HostResponse> {
        let slot_addr = self.rring() + DESC_SIZE * self.rsp_take_idx;
        let desc = Descriptor(self.sim.read_memory_u32(slot_addr));
        if desc.0 == 0 || desc.owner() {
            return None;
        }
        let body = desc.address(u32::MAX);
        let header = self.sim.read_memory(body - ENVELOPE_SIZE, ENVELOPE_SIZE as usize);
        let envelope = Envelope::from_bytes([header[0], header[1], header[2], header[3]]);
        let data = self.sim.read_memory(body, envelope.msg_len as usize);
        self.sim.write_memory_u32(slot_addr, 0);
        self.rsp_take_idx = (self.rsp_take_idx + 1) % self.rsize;
        Some(HostResponse { envelope, data })
    }

    /// Whether the port has given back command slot `slot`.
    pub fn command_slot_returned(&self, slot: u32) -> bool {
        let desc = Descriptor(self.sim.read_memory_u32(self.cring() + DESC_SIZE * slot));
        !desc.owner() && desc.flag()
    }

    /// The command and response ring transition words in the communication
    /// area header.
    pub fn ring_transition_flags(&self) -> (u16, u16) {
        let words = self.sim.read_memory_words(self.cahdr() + 4, 2);
        (words[0], words[1])
    }
}
