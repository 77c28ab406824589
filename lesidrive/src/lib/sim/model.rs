use log::{trace, warn};
use std::collections::VecDeque;
use std::ops::Range;
use std::sync::{Arc, Mutex, MutexGuard};

use super::memory::HostMemory;
use crate::lesi::*;

/// Spins on T1 with nothing pending before the simulated host gives up and
/// resets the port.
pub const DEFAULT_WATCHDOG: u32 = 200_000;

const QBUS_ADDRESS_MASK: u32 = 0x3F_FFFF;
const UNIBUS_ADDRESS_MASK: u32 = 0x3_FFFF;

/// How the simulated host answers the next value presented in SA.
#[derive(Debug, Copy, Clone, PartialEq, Eq)]
pub enum SaReply {
    Value(u16),
    /// Write back whatever was presented.
    Echo,
    /// Assert INIT instead of answering.
    Reset,
}

/// An interrupt delivered to the host.
#[derive(Debug, Copy, Clone, PartialEq, Eq)]
pub struct Interrupt {
    pub vector: u16,
    /// The SA contents, when the interrupt also presented a value.
    pub value: Option<u16>,
}

struct KlesiState {
    ident: u16,
    address_mask: u32,

    // Adapter registers.
    ram: [u16; RAM_WORDS],
    stuck_bits: [u16; RAM_WORDS],
    ptr: usize,
    command: u16,
    output: u16,
    ual: u16,
    uah: u16,
    poll: bool,
    purged: bool,
    errors: u16,
    t1: bool,
    init: bool,
    init_pending: bool,

    // Pins driven by the controller.
    write_direction: bool,
    bus: u32,
    command_line: bool,
    strobe: bool,
    power_good: bool,

    // Host side.
    memory: HostMemory,
    sa_script: VecDeque<SaReply>,
    sa_log: Vec<u16>,
    interrupts: Vec<Interrupt>,
    npr_count: usize,
    lesi_parity_faults: u32,
    watchdog: Option<u32>,
    waited: u32,
}

impl KlesiState {
    fn new(ident: u16, memory_size: usize) -> Self {
        let address_mask = if ident == SR_IDENT_QBUS {
            QBUS_ADDRESS_MASK
        } else {
            UNIBUS_ADDRESS_MASK
        };
        KlesiState {
            ident,
            address_mask,
            ram: [0; RAM_WORDS],
            stuck_bits: [0; RAM_WORDS],
            ptr: 0,
            command: 0,
            output: 0,
            ual: 0,
            uah: 0,
            poll: false,
            purged: ident == SR_IDENT_QBUS,
            errors: 0,
            t1: false,
            init: false,
            init_pending: false,
            write_direction: false,
            bus: 0,
            command_line: false,
            strobe: false,
            power_good: false,
            memory: HostMemory::new(memory_size),
            sa_script: VecDeque::new(),
            sa_log: Vec::new(),
            interrupts: Vec::new(),
            npr_count: 0,
            lesi_parity_faults: 0,
            watchdog: Some(DEFAULT_WATCHDOG),
            waited: 0,
        }
    }

    fn host_address(&self) -> u32 {
        (((self.uah as u32) << 16) | self.ual as u32) & self.address_mask
    }

    fn ram_word(&self, index: usize) -> u16 {
        self.ram[index] | self.stuck_bits[index]
    }

    fn status(&self) -> u16 {
        let mut status = self.ident | self.errors;
        if self.poll {
            status |= SR_POLL;
        }
        if self.purged {
            status |= SR_PURGED;
        }
        status
    }

    /// AC clear.
    fn reset(&mut self) {
        self.ptr = 0;
        self.command = 0;
        self.output = 0;
        self.poll = false;
        self.purged = self.ident == SR_IDENT_QBUS;
        self.errors = 0;
        self.t1 = false;
    }

    fn strobe_edge(&mut self) {
        match (self.command_line, self.write_direction) {
            (true, true) => self.command_cycle(),
            (false, true) => self.data_write(),
            (_, false) => self.advance_read(),
        }
    }

    fn take_bus_word(&mut self) -> u16 {
        let (word, parity_ok) = decode(self.bus);
        if !parity_ok {
            self.errors |= SR_LESI_PE;
        }
        word
    }

    fn command_cycle(&mut self) {
        let cmd = self.take_bus_word();
        trace!("KLESI command {:#06X}", cmd);
        self.command = cmd;
        self.t1 = false;
        self.ptr = if cmd & CMD_CLEAR_WC != 0 {
            0
        } else {
            cmd_wordcnt(cmd) as usize
        };

        if cmd & CMD_DO_NPR != 0 {
            self.npr(cmd & CMD_WRITE != 0);
        }
        if cmd & CMD_DO_INTR != 0 {
            let value = (cmd & CMD_SA != 0).then(|| self.ram_word(0));
            self.interrupts.push(Interrupt {
                vector: self.ram_word(1),
                value,
            });
            self.t1 = true;
        }
        if cmd & CMD_SA != 0 {
            self.present_sa();
        }
        if cmd & CMD_WRITE == 0 {
            self.output = self.register_read(cmd_regsel_of(cmd));
        }
    }

    fn register_read(&mut self, reg: u16) -> u16 {
        match reg {
            REG_RAM => self.ram_word(self.ptr),
            REG_STATUS => {
                let status = self.status();
                self.poll = false;
                self.purged = self.ident == SR_IDENT_QBUS;
                status
            }
            REG_CLEAR_POLL => {
                let status = self.status();
                self.poll = false;
                status
            }
            REG_CLEAR_PURGED => {
                let status = self.status();
                self.purged = self.ident == SR_IDENT_QBUS;
                status
            }
            _ => 0,
        }
    }

    fn data_write(&mut self) {
        let word = self.take_bus_word();
        if self.command & CMD_WRITE == 0 {
            return;
        }
        match cmd_regsel_of(self.command) {
            REG_RAM => {
                self.ram[self.ptr] = word;
                self.ptr = (self.ptr + 1) % RAM_WORDS;
            }
            REG_UAL => self.ual = word,
            REG_UAH => self.uah = word,
            _ => {}
        }
    }

    fn advance_read(&mut self) {
        self.ptr = (self.ptr + 1) % RAM_WORDS;
        if self.command & CMD_WRITE == 0 && cmd_regsel_of(self.command) == REG_RAM {
            self.output = self.ram_word(self.ptr);
        }
    }

    fn npr(&mut self, to_host: bool) {
        self.npr_count += 1;
        self.errors = 0;
        let start = cmd_wordcnt(self.command) as usize;
        let base = self.host_address() as usize;
        for (i, slot) in (start..RAM_WORDS).enumerate() {
            let addr = base + 2 * i;
            if !self.memory.contains_word(addr) {
                self.errors |= SR_NXM;
                break;
            }
            if to_host {
                self.memory.write_word(addr, self.ram_word(slot));
            } else {
                self.ram[slot] = self.memory.read_word(addr);
            }
        }
        self.t1 = true;
    }

    fn present_sa(&mut self) {
        let presented = self.ram_word(0);
        trace!("KLESI SA <- {:#06X}", presented);
        self.sa_log.push(presented);
        match self.sa_script.pop_front() {
            Some(SaReply::Value(v)) => {
                self.ram[0] = v;
                self.t1 = true;
            }
            Some(SaReply::Echo) => self.t1 = true,
            Some(SaReply::Reset) => self.init_pending = true,
            None => {}
        }
    }

    fn ready(&mut self) -> bool {
        if self.init_pending {
            self.init_pending = false;
            self.init = true;
            return false;
        }
        if self.t1 {
            self.waited = 0;
            return true;
        }
        if let Some(limit) = self.watchdog {
            self.waited += 1;
            if self.waited >= limit {
                warn!("Simulated host timed out waiting on the port, asserting INIT");
                self.waited = 0;
                self.init = true;
            }
        }
        false
    }
}

/// A behavioural KLESI adapter with a scripted host behind it.
///
/// Clones share the same adapter, so a test can keep one handle to play the
/// host while the port drives the other.
#[derive(Clone)]
pub struct SimulatedKlesi {
    state: Arc<Mutex<KlesiState>>,
}

impl SimulatedKlesi {
    /// `ident` is one of the status register ident values; `memory_size` is
    /// the amount of host memory in bytes.
    pub fn new(ident: u16, memory_size: usize) -> Self {
        SimulatedKlesi {
            state: Arc::new(Mutex::new(KlesiState::new(ident, memory_size))),
        }
    }

    pub fn new_qbus(memory_size: usize) -> Self {
        Self::new(SR_IDENT_QBUS, memory_size)
    }

    pub fn new_unibus(memory_size: usize) -> Self {
        Self::new(SR_IDENT_UNIBUS, memory_size)
    }

    fn lock(&self) -> MutexGuard<'_, KlesiState> {
        self.state.lock().unwrap()
    }

    /// Queue answers for upcoming SA handshakes.
    pub fn script_sa(&self, replies: impl IntoIterator<Item = SaReply>) {
        self.lock().sa_script.extend(replies);
    }

    pub fn pending_sa_replies(&self) -> usize {
        self.lock().sa_script.len()
    }

    /// Every value the port has presented in SA, oldest first.
    pub fn sa_log(&self) -> Vec<u16> {
        self.lock().sa_log.clone()
    }

    pub fn last_sa(&self) -> Option<u16> {
        self.lock().sa_log.last().copied()
    }

    pub fn interrupts(&self) -> Vec<Interrupt> {
        self.lock().interrupts.clone()
    }

    pub fn take_interrupts(&self) -> Vec<Interrupt> {
        std::mem::take(&mut self.lock().interrupts)
    }

    /// The host reads the IP register: ask the port to poll the command ring.
    pub fn post_poll(&self) {
        self.lock().poll = true;
    }

    pub fn post_purged(&self) {
        self.lock().purged = true;
    }

    /// The host writes the IP register.
    pub fn assert_init(&self) {
        let mut state = self.lock();
        state.init = true;
        state.t1 = false;
    }

    pub fn set_watchdog(&self, limit: Option<u32>) {
        self.lock().watchdog = limit;
    }

    pub fn host_address(&self) -> u32 {
        self.lock().host_address()
    }

    pub fn npr_count(&self) -> usize {
        self.lock().npr_count
    }

    pub fn power_good(&self) -> bool {
        self.lock().power_good
    }

    pub fn memory_size(&self) -> usize {
        self.lock().memory.len()
    }

    pub fn read_memory_words(&self, addr: u32, count: usize) -> Vec<u16> {
        let state = self.lock();
        (0..count)
            .map(|i| state.memory.read_word(addr as usize + 2 * i))
            .collect()
    }

    pub fn write_memory_words(&self, addr: u32, words: &[u16]) {
        let mut state = self.lock();
        for (i, &w) in words.iter().enumerate() {
            state.memory.write_word(addr as usize + 2 * i, w);
        }
    }

    pub fn read_memory(&self, addr: u32, len: usize) -> Vec<u8> {
        let state = self.lock();
        (0..len).map(|i| state.memory.read_byte(addr as usize + i)).collect()
    }

    pub fn write_memory(&self, addr: u32, bytes: &[u8]) {
        let mut state = self.lock();
        for (i, &b) in bytes.iter().enumerate() {
            state.memory.write_byte(addr as usize + i, b);
        }
    }

    /// Take `range` off the bus. NPRs touching it end with NXM.
    pub fn unmap_memory(&self, range: Range<u32>) {
        self.lock().memory.unmap(range.start as usize..range.end as usize);
    }

    pub fn read_memory_u32(&self, addr: u32) -> u32 {
        let words = self.read_memory_words(addr, 2);
        words[0] as u32 | (words[1] as u32) << 16
    }

    pub fn write_memory_u32(&self, addr: u32, value: u32) {
        self.write_memory_words(addr, &[value as u16, (value >> 16) as u16]);
    }

    /// Present the next `count` samples with bad parity.
    pub fn inject_lesi_parity(&self, count: u32) {
        self.lock().lesi_parity_faults += count;
    }

    /// Flag a host bus parity error, as if the last NPR hit bad memory.
    pub fn inject_host_parity(&self) {
        self.lock().errors |= SR_BUS_PE;
    }

    /// Make bits of a scratchpad word read back as one.
    pub fn stick_ram_bit(&self, index: usize, mask: u16) {
        self.lock().stuck_bits[index] |= mask;
    }
}

impl LesiPins for SimulatedKlesi {
    fn set_buffer_direction(&mut self, write: bool) {
        self.lock().write_direction = write;
    }

    fn put_data(&mut self, raw: u32) {
        self.lock().bus = raw;
    }

    fn get_data(&mut self) -> u32 {
        let mut state = self.lock();
        let mut raw = encode(state.output);
        if state.lesi_parity_faults > 0 {
            state.lesi_parity_faults -= 1;
            raw ^= 1 << 16;
        }
        raw
    }

    fn set_command(&mut self, asserted: bool) {
        self.lock().command_line = asserted;
    }

    fn set_strobe(&mut self, asserted: bool) {
        let mut state = self.lock();
        let rising = asserted && !state.strobe;
        state.strobe = asserted;
        if rising {
            state.strobe_edge();
        }
    }

    fn ready(&mut self) -> bool {
        self.lock().ready()
    }

    fn init_seen(&mut self) -> bool {
        self.lock().init
    }

    fn clear_init(&mut self) {
        let mut state = self.lock();
        state.init = false;
        state.init_pending = false;
    }

    fn set_power_good(&mut self, good: bool) {
        self.lock().power_good = good;
    }

    fn set_ac_clear(&mut self, asserted: bool) {
        if asserted {
            self.lock().reset();
        }
    }

    fn delay_ns(&mut self, _ns: u32) {}

    fn delay_us(&mut self, _us: u32) {}
}
