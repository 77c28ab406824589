use log::{debug, info};

use super::lowlevel::LowLevel;
use super::pins::{LesiPins, Timing};
use super::*;
use crate::error::{LesiError, LesiResult};

const SELFTEST_PATTERNS: [u16; 3] = [0xAAAA, 0x8888, 0x1337];

/// POLL and PURGED bits seen by status reads that weren't looking for them.
///
/// The adapter clears both bits whenever its status register is read, so a
/// read done for fault classification would otherwise swallow a poll request
/// meant for the command ring.
#[derive(Debug, Default, Copy, Clone, PartialEq, Eq)]
pub struct StickyFlags(u16);

impl StickyFlags {
    const MASK: u16 = SR_POLL | SR_PURGED;

    pub fn latch(&mut self, status: u16) {
        self.0 |= status & Self::MASK;
    }

    /// Deliver the latched bits and forget them.
    pub fn take(&mut self) -> u16 {
        std::mem::take(&mut self.0)
    }

    pub fn peek(&self) -> u16 {
        self.0
    }

    pub fn clear(&mut self) {
        self.0 = 0;
    }
}

/// Map the error bits of a status word to an error.
pub fn classify_status(status: u16) -> LesiResult<()> {
    if status & SR_BUS_PE != 0 {
        Err(LesiError::HostBusParity)
    } else if status & SR_LESI_PE != 0 {
        Err(LesiError::AdapterBusParity)
    } else if status & SR_NXM != 0 {
        Err(LesiError::NonExistentMemory)
    } else {
        Ok(())
    }
}

/// Register, scratchpad and handshake access to a KLESI adapter.
pub struct Klesi<P: LesiPins> {
    pub(super) ll: LowLevel<P>,
    /// Last address loaded into UAL/UAH.
    pub(super) host_address: u32,
    /// Words per NPR block.
    pub(super) block_words: usize,
}

impl<P: LesiPins> Klesi<P> {
    pub fn new(pins: P, timing: Timing) -> Self {
        Klesi {
            ll: LowLevel::new(pins, timing),
            host_address: 0,
            block_words: RAM_WORDS,
        }
    }

    pub fn lowlevel(&mut self) -> &mut LowLevel<P> {
        &mut self.ll
    }

    pub fn pins(&self) -> &P {
        self.ll.pins()
    }

    pub fn pins_mut(&mut self) -> &mut P {
        self.ll.pins_mut()
    }

    /// Issue a bare command cycle.
    pub fn command(&mut self, cmd: u16) -> LesiResult<()> {
        self.ll.write(cmd, true)
    }

    pub fn write_register(&mut self, reg: u16, value: u16) -> LesiResult<()> {
        self.command(CMD_WRITE | cmd_regsel(reg))?;
        self.ll.write(value, false)
    }

    pub fn read_register(&mut self, reg: u16) -> LesiResult<u16> {
        self.command(cmd_regsel(reg))?;
        self.ll.read()
    }

    pub fn write_ram_word(&mut self, addr: u16, value: u16) -> LesiResult<()> {
        self.command(CMD_WRITE | cmd_regsel(REG_RAM) | cmd_wordcnt(addr))?;
        self.ll.write(value, false)
    }

    /// Write consecutive scratchpad words starting at `addr`.
    pub fn write_ram(&mut self, addr: u16, words: &[u16]) -> LesiResult<()> {
        self.command(CMD_WRITE | cmd_regsel(REG_RAM) | cmd_wordcnt(addr))?;
        for &w in words {
            self.ll.write(w, false)?;
        }
        Ok(())
    }

    pub fn read_ram_word(&mut self, addr: u16) -> LesiResult<u16> {
        self.command(cmd_regsel(REG_RAM) | cmd_wordcnt(addr))?;
        self.ll.read()
    }

    /// Read the status register. POLL and PURGED are latched into `sticky`
    /// as a side effect.
    pub fn read_status(&mut self, sticky: &mut StickyFlags) -> LesiResult<u16> {
        let status = self.read_register(REG_STATUS)?;
        sticky.latch(status);
        Ok(status)
    }

    /// Read the status register merged with everything latched since the
    /// last call.
    pub fn read_status_flags(&mut self, sticky: &mut StickyFlags) -> LesiResult<u16> {
        let status = self.read_register(REG_STATUS)?;
        Ok(status | sticky.take())
    }

    /// Read the status register and turn any error bits into an error.
    pub fn handle_status(&mut self, sticky: &mut StickyFlags) -> LesiResult<()> {
        let status = self.read_status(sticky)?;
        classify_status(status)
    }

    pub fn set_host_address(&mut self, addr: u32) -> LesiResult<()> {
        self.write_register(REG_UAL, addr as u16)?;
        self.write_register(REG_UAH, (addr >> 16) as u16)?;
        self.host_address = addr;
        Ok(())
    }

    /// Limit NPR blocks to what the host allows per transfer. `burst` is in
    /// longwords.
    pub fn set_burst(&mut self, burst: u16) {
        self.block_words = (burst as usize * 2).clamp(1, RAM_WORDS);
        debug!("NPR block size now {} words", self.block_words);
    }

    pub fn clear_burst(&mut self) {
        self.block_words = RAM_WORDS;
    }

    /// Present a value to the host through the SA register.
    pub fn send_value(&mut self, value: u16) -> LesiResult<()> {
        self.write_ram_word(0, value)?;
        self.command(CMD_SA | CMD_CLEAR_WC)
    }

    /// As `send_value`, interrupting the host at `vector` at the same time.
    pub fn send_value_with_interrupt(&mut self, value: u16, vector: u16) -> LesiResult<()> {
        self.write_ram(0, &[value, vector])?;
        self.command(CMD_DO_INTR | CMD_SA | CMD_CLEAR_WC)
    }

    /// Wait for the host to write the SA register and fetch what it wrote.
    pub fn receive_value(&mut self) -> LesiResult<u16> {
        self.ll.wait_ready()?;
        self.read_ram_word(0)
    }

    /// Take the SA register away from the host.
    pub fn end_handshake(&mut self) -> LesiResult<()> {
        self.command(0)
    }

    pub fn send_interrupt(&mut self, vector: u16) -> LesiResult<()> {
        self.write_ram_word(1, vector)?;
        self.command(CMD_DO_INTR)?;
        self.ll.wait_ready()
    }

    /// Interrupt the host with `value` visible in SA.
    pub fn send_interrupt_with_value(&mut self, vector: u16, value: u16) -> LesiResult<()> {
        self.write_ram(0, &[value, vector])?;
        self.command(CMD_DO_INTR | CMD_SA)?;
        self.ll.wait_ready()
    }

    pub fn reset(&mut self) {
        self.ll.reset_adapter();
    }

    /// Exercise the scratchpad with walking ones and a few fixed patterns.
    pub fn selftest(&mut self) -> LesiResult<()> {
        self.reset();
        let walking = (0..16).map(|bit| 1u16 << bit);
        for pattern in walking.chain(SELFTEST_PATTERNS) {
            self.write_ram_word(0, pattern)?;
            let got = self.read_ram_word(0)?;
            if got != pattern {
                debug!("Selftest wrote {:#06X}, read {:#06X}", pattern, got);
                return Err(LesiError::Mismatch);
            }
        }
        self.reset();
        info!("KLESI selftest passed");
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::sim::{SaReply, SimulatedKlesi};

    fn klesi() -> (Klesi<SimulatedKlesi>, SimulatedKlesi) {
        crate::init_test_logging();
        let sim = SimulatedKlesi::new_unibus(0x1000);
        (Klesi::new(sim.clone(), Timing::default()), sim)
    }

    #[test]
    fn test_classify_status() {
        assert_eq!(classify_status(SR_IDENT_QBUS | SR_POLL), Ok(()));
        assert_eq!(classify_status(SR_BUS_PE | SR_NXM), Err(LesiError::HostBusParity));
        assert_eq!(classify_status(SR_LESI_PE | SR_NXM), Err(LesiError::AdapterBusParity));
        assert_eq!(classify_status(SR_NXM), Err(LesiError::NonExistentMemory));
    }

    #[test]
    fn test_sticky_flags() {
        let mut sticky = StickyFlags::default();
        sticky.latch(SR_POLL | SR_NXM | SR_IDENT_UNIBUS);
        assert_eq!(sticky.peek(), SR_POLL);
        sticky.latch(SR_PURGED);
        assert_eq!(sticky.take(), SR_POLL | SR_PURGED);
        assert_eq!(sticky.take(), 0);
    }

    #[test]
    fn test_status_read_keeps_poll() {
        let (mut k, sim) = klesi();
        let mut sticky = StickyFlags::default();
        sim.post_poll();

        // A classification read sees POLL and clears it in the adapter...
        k.handle_status(&mut sticky).unwrap();
        assert_eq!(k.read_status(&mut sticky).unwrap() & SR_POLL, 0);

        // ...but the poll detector still gets it, exactly once.
        assert_ne!(k.read_status_flags(&mut sticky).unwrap() & SR_POLL, 0);
        assert_eq!(k.read_status_flags(&mut sticky).unwrap() & SR_POLL, 0);
    }

    #[test]
    fn test_scratchpad() {
        let (mut k, _sim) = klesi();
        k.write_ram(3, &[0o1234, 0o4321, 0xFFFF]).unwrap();
        assert_eq!(k.read_ram_word(3), Ok(0o1234));
        assert_eq!(k.read_ram_word(4), Ok(0o4321));
        assert_eq!(k.read_ram_word(5), Ok(0xFFFF));
        k.write_ram_word(15, 7).unwrap();
        assert_eq!(k.read_ram_word(15), Ok(7));
    }

    #[test]
    fn test_set_host_address() {
        let (mut k, sim) = klesi();
        k.set_host_address(0x3_4567).unwrap();
        assert_eq!(sim.host_address(), 0x3_4567);
    }

    #[test]
    fn test_selftest() {
        let (mut k, sim) = klesi();
        assert_eq!(k.selftest(), Ok(()));

        sim.stick_ram_bit(0, 0x0010);
        assert_eq!(k.selftest(), Err(LesiError::Mismatch));
    }

    #[test]
    fn test_handshake() {
        let (mut k, sim) = klesi();
        sim.script_sa([SaReply::Value(0x8123)]);
        k.send_value(0x0800).unwrap();
        assert_eq!(k.receive_value(), Ok(0x8123));
        assert_eq!(sim.sa_log(), vec![0x0800]);
        assert!(sim.interrupts().is_empty());

        sim.script_sa([SaReply::Echo]);
        k.send_value_with_interrupt(0x1000, 0o154).unwrap();
        assert_eq!(k.receive_value(), Ok(0x1000));
        let intr = sim.interrupts();
        assert_eq!(intr.len(), 1);
        assert_eq!(intr[0].vector, 0o154);
        assert_eq!(intr[0].value, Some(0x1000));
        k.end_handshake().unwrap();
    }

    #[test]
    fn test_interrupts() {
        let (mut k, sim) = klesi();
        k.send_interrupt(0o260).unwrap();
        k.send_interrupt_with_value(0o264, 0x8005).unwrap();
        let intr = sim.interrupts();
        assert_eq!(intr.len(), 2);
        assert_eq!((intr[0].vector, intr[0].value), (0o260, None));
        assert_eq!((intr[1].vector, intr[1].value), (0o264, Some(0x8005)));
        assert_eq!(sim.sa_log(), vec![0x8005]);
    }

    #[test]
    fn test_host_reset_interrupts_wait() {
        let (mut k, sim) = klesi();
        sim.script_sa([SaReply::Reset]);
        k.send_value(0x0800).unwrap();
        assert_eq!(k.receive_value(), Err(LesiError::Reset));
        k.lowlevel().clear_init();
        assert!(!k.lowlevel().check_init());
    }
}
