//! The four step initialization handshake through the SA register.

use log::{debug, info, warn};

use super::commarea::{ADDR_MASK_18, ADDR_MASK_22, CAHDR_SIZE, DESC_SIZE};
use super::sareg::*;
use super::{Port, Step};
use crate::error::{LesiError, LesiResult};
use crate::lesi::*;

impl<P: LesiPins> Port<P> {
    /// Identify the adapter and pick the features to advertise.
    pub(super) fn try_start(&mut self) {
        let status = match self.klesi.read_status(&mut self.sticky) {
            Ok(status) => status,
            Err(LesiError::Reset) => {
                self.step = Step::Reinit;
                return;
            }
            Err(e) => {
                warn!("Could not read adapter status: {}", e);
                return;
            }
        };

        let mut features = Features::BASE;
        match status & SR_IDENT_MASK {
            SR_IDENT_QBUS => {
                info!("MSCP port starting up for a KLESI-QA adapter");
                features |= Features::ADDR_22BIT | Features::MAP | Features::VEC;
                self.link.addr_mask = ADDR_MASK_22;
            }
            SR_IDENT_UNIBUS => {
                info!("MSCP port starting up for a KLESI-UA adapter");
                features |= Features::PURGE | Features::MAP | Features::VEC;
                self.link.addr_mask = ADDR_MASK_18;
            }
            ident => {
                warn!("Unknown adapter ident {}: {}", ident, LesiError::Mismatch);
                return;
            }
        }
        self.link.features = features;
        self.step = Step::Step1;
    }

    /// Present `sa_out` and wait for the host's answer.
    fn exchange(&mut self, sa_out: u16, interrupt: bool) -> LesiResult<u16> {
        if interrupt {
            self.klesi.send_value_with_interrupt(sa_out, self.link.vector)?;
        } else {
            self.klesi.send_value(sa_out)?;
        }
        self.klesi.receive_value()
    }

    fn step_interrupts(&self) -> bool {
        self.link.init_ie && self.link.vector != 0
    }

    fn init_failed(&mut self, sa_out: u16, e: LesiError) {
        if e == LesiError::Reset {
            info!("Host reset during initialization ({:?})", self.step);
            self.step = Step::Reinit;
            return;
        }
        if let Err(e) = self.klesi.send_value(sa_out | SA_ERROR) {
            debug!("Could not flag the error in SA: {}", e);
        }
        warn!("Error in initialization {:?}: {}, retrying", self.step, e);
    }

    pub(super) fn init_step1(&mut self) {
        let sa_out = self.link.features.step1_value();
        if let Err(e) = self.step1(sa_out) {
            self.init_failed(sa_out, e);
        }
    }

    fn step1(&mut self, sa_out: u16) -> LesiResult<()> {
        let sa_in = self.exchange(sa_out, false)?;
        if sa_in & SA_INIT1W_VALID == 0 {
            warn!("Step 1 answer {:#06X} did not have bit 15 set, restarting", sa_in);
            return Ok(());
        }

        self.link.vector = (sa_in & SA_INIT1W_VADR_MASK) * 4;
        self.link.csize = ((sa_in & SA_INIT1W_CRING_MASK) >> SA_INIT1W_CRING_BIT) as u32;
        self.link.rsize = ((sa_in & SA_INIT1W_RRING_MASK) >> SA_INIT1W_RRING_BIT) as u32;
        self.link.init_ie = sa_in & SA_INIT1W_IE != 0;
        self.link.diag_wr = sa_in & SA_INIT1W_WR != 0;
        info!(
            "Init step 1: vector {:04o}, command ring 2^{}, response ring 2^{}, IE={} WR={}",
            self.link.vector, self.link.csize, self.link.rsize, self.link.init_ie, self.link.diag_wr
        );

        if self.link.diag_wr {
            info!("Entering wrap-around diagnostic until reset");
            self.klesi.send_value(sa_in)?;
            self.step = Step::DiagWrap;
            return Ok(());
        }
        self.step = Step::Step2;
        Ok(())
    }

    pub(super) fn init_step2(&mut self) {
        let mut sa_out = SA_INIT2_STEP
            | SA_INIT2R_ALWAYS
            | ((self.config.port_type as u16) << SA_INIT2R_PTYP_BIT) & SA_INIT2R_PTYP_MASK
            | ((self.link.csize as u16) << SA_INIT2R_CRING_BIT) & SA_INIT2R_CRING_MASK
            | (self.link.rsize as u16) & SA_INIT2R_RRING_MASK;
        if self.link.diag_wr {
            sa_out |= SA_INIT2R_WR;
        }

        match self.exchange(sa_out, self.step_interrupts()) {
            Ok(sa_in) => {
                self.link.ringbase = (sa_in & SA_INIT2W_RINGBASE_MASK) as u32;
                self.link.purge_ie = sa_in & SA_INIT2W_PI != 0;
                info!(
                    "Init step 2: ring base {:07o}, PI={}",
                    self.link.ringbase, self.link.purge_ie
                );
                self.step = Step::Step3;
            }
            Err(e) => self.init_failed(sa_out, e),
        }
    }

    pub(super) fn init_step3(&mut self) {
        let mut sa_out = SA_INIT3_STEP | (self.link.vector / 4) & SA_INIT3R_VADR_MASK;
        if self.link.init_ie {
            sa_out |= SA_INIT3R_IE;
        }
        if let Err(e) = self.step3(sa_out) {
            self.init_failed(sa_out, e);
        }
    }

    fn step3(&mut self, sa_out: u16) -> LesiResult<()> {
        self.klesi.read_register(REG_CLEAR_POLL)?;
        let sa_in = self.exchange(sa_out, self.step_interrupts())?;
        self.klesi.read_register(REG_CLEAR_PURGED)?;
        self.sticky.clear();

        self.link.ringbase |= ((sa_in & SA_INIT3W_HRBASE_MASK) as u32) << 16;
        let purge_poll = sa_in & SA_INIT3W_PP != 0;
        info!("Init step 3: ring base {:09o}, PP={}", self.link.ringbase, purge_poll);

        self.step = if purge_poll {
            Step::DiagPurgePoll
        } else {
            Step::Step4
        };
        Ok(())
    }

    /// One look at the status register per tick: first for PURGED (when
    /// the adapter has a purge mechanism), then for POLL.
    pub(super) fn diag_purge_poll(&mut self) {
        match self.purge_poll() {
            Ok(()) => {}
            Err(LesiError::Reset) => self.step = Step::Reinit,
            Err(e) => warn!("Error in purge and poll test: {}, retrying", e),
        }
    }

    fn purge_poll(&mut self) -> LesiResult<()> {
        let flags = self.klesi.read_status_flags(&mut self.sticky)?;
        if self.link.features.contains(Features::PURGE) && !self.link.purge_seen {
            if flags & SR_PURGED == 0 {
                self.sticky.latch(flags);
                return Ok(());
            }
            info!("Purge and poll test: got PURGED");
            self.link.purge_seen = true;
        }
        if flags & SR_POLL == 0 {
            return Ok(());
        }
        info!("Purge and poll test: got POLL");

        self.klesi.read_register(REG_CLEAR_POLL)?;
        self.klesi.read_register(REG_CLEAR_PURGED)?;
        self.step = Step::Step4;
        Ok(())
    }

    pub(super) fn init_step4(&mut self) {
        let sa_out = SA_INIT4_STEP
            | ((self.config.model as u16) << SA_INIT4R_MOD_BIT) & SA_INIT4R_MOD_MASK
            | (self.config.fw_version as u16) & SA_INIT4R_VER_MASK;
        if let Err(e) = self.step4(sa_out) {
            self.init_failed(sa_out, e);
        }
    }

    fn step4(&mut self, sa_out: u16) -> LesiResult<()> {
        let first = self.step == Step::Step4;
        if first {
            self.klesi.end_handshake()?;
            let csize = 1u32 << self.link.csize;
            let rsize = 1u32 << self.link.rsize;
            self.link.cahdr = self.link.ringbase.wrapping_sub(CAHDR_SIZE);
            self.link.rring = self.link.ringbase;
            self.link.cring = self.link.ringbase + DESC_SIZE * rsize;

            let words = (csize * 2 + rsize * 2 + CAHDR_SIZE / 2) as usize;
            self.klesi.set_host_address(self.link.cahdr)?;
            self.klesi.write_dma_zeros(&mut self.sticky, words)?;
        }

        let sa_in = self.exchange(sa_out, first && self.step_interrupts())?;
        let go = sa_in & SA_INIT4W_GO != 0;
        if first {
            self.link.burst = (sa_in & SA_INIT4W_BURST_MASK) >> SA_INIT4W_BURST_BIT;
            if self.link.burst == 0 {
                self.link.burst = self.config.default_burst;
            }
            self.link.last_fail = sa_in & SA_INIT4W_LF != 0;
            info!(
                "Init step 4: burst {}, LF={}, GO={}",
                self.link.burst, self.link.last_fail, go
            );
        } else {
            debug!("Init step 4 wait: GO={}", go);
        }

        if !go {
            self.step = Step::Step4Wait;
            return Ok(());
        }

        self.link.csize = 1 << self.link.csize;
        self.link.rsize = 1 << self.link.rsize;
        self.cmd.reset();
        self.rsp.reset();
        self.link.c_poll = true;
        self.klesi.set_burst(self.link.burst);
        self.step = Step::Ready;
        info!("MSCP port initialized");
        Ok(())
    }

    /// Echo whatever the host writes to SA.
    pub(super) fn diag_wrap(&mut self) {
        let result = self
            .klesi
            .receive_value()
            .and_then(|value| self.klesi.send_value(value));
        match result {
            Ok(()) => {}
            Err(LesiError::Reset) => self.step = Step::Reinit,
            Err(e) => warn!("Error in wrap-around diagnostic: {}, retrying", e),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::super::tests::{port, poll_until, Collector};
    use super::*;
    use crate::sim::{SaReply, SimulatedKlesi};

    const QBUS_STEP1: u16 = 0x0800 | 0x0200 | 0x0100 | 0x0040;
    const UNIBUS_STEP1: u16 = 0x0800 | 0x0100 | 0x0040;

    fn values(words: &[u16]) -> Vec<SaReply> {
        words.iter().map(|&w| SaReply::Value(w)).collect()
    }

    #[test]
    fn test_minimal_handshake() {
        let sim = SimulatedKlesi::new_qbus(0x1000);
        let mut port = port(&sim);
        let mut sink = Collector::default();
        sim.write_memory_words(0x78, &[0xFFFF; 9]);
        sim.script_sa(values(&[0x8007, 0x0081, 0x0000, 0x0001]));

        port.poll(&mut sink);
        assert_eq!(port.step(), Step::Step1);
        assert!(port.features().contains(Features::ADDR_22BIT));
        port.poll(&mut sink);
        assert_eq!(port.step(), Step::Step2);
        assert_eq!(port.vector(), 28);
        assert_eq!(port.ring_sizes(), (0, 0));
        port.poll(&mut sink);
        assert_eq!(port.step(), Step::Step3);
        assert_eq!(port.ringbase(), 0x80);
        assert!(port.purge_interrupts());
        port.poll(&mut sink);
        assert_eq!(port.step(), Step::Step4);
        port.poll(&mut sink);
        assert_eq!(port.step(), Step::Ready);

        assert_eq!(port.ring_sizes(), (1, 1));
        assert_eq!(port.burst(), 8);
        assert_eq!(port.klesi().block_words(), 16);
        assert_eq!(sim.sa_log(), vec![QBUS_STEP1, 0x1080, 0x2007, 0x4031]);
        assert!(sim.interrupts().is_empty());

        // Header and both one-slot rings are cleared, nothing past them.
        assert_eq!(sim.read_memory_words(0x78, 9), [0, 0, 0, 0, 0, 0, 0, 0, 0xFFFF]);
    }

    #[test]
    fn test_step1_without_bit15_restarts() {
        let sim = SimulatedKlesi::new_qbus(0x1000);
        let mut port = port(&sim);
        let mut sink = Collector::default();
        sim.script_sa(values(&[0x0007, 0x8007]));

        port.poll(&mut sink);
        port.poll(&mut sink);
        assert_eq!(port.step(), Step::Step1);
        port.poll(&mut sink);
        assert_eq!(port.step(), Step::Step2);
        assert_eq!(sim.sa_log(), vec![QBUS_STEP1, QBUS_STEP1]);
    }

    #[test]
    fn test_waits_for_go() {
        let sim = SimulatedKlesi::new_qbus(0x10000);
        let mut port = port(&sim);
        let mut sink = Collector::default();
        sim.script_sa(values(&[0x8000 | 1 << 11 | 2 << 8, 0x1000, 0x0000, 0x0400, 0x0001]));

        poll_until(&mut port, &mut sink, Step::Step4, 5);
        assert_eq!(port.ring_sizes(), (1, 2));
        port.poll(&mut sink);
        assert_eq!(port.step(), Step::Step4Wait);

        // The rings are only cleared on the first pass.
        sim.write_memory_words(0x1000, &[0x5555]);
        port.poll(&mut sink);
        assert_eq!(port.step(), Step::Ready);
        assert_eq!(sim.read_memory_words(0x1000, 1), [0x5555]);
        assert_eq!(port.ring_sizes(), (2, 4));
        assert_eq!(port.burst(), 4);
        assert_eq!(port.klesi().block_words(), 8);
        assert_eq!(sim.sa_log()[3..], [0x4031, 0x4031]);
    }

    #[test]
    fn test_step_interrupts() {
        let sim = SimulatedKlesi::new_qbus(0x10000);
        let mut port = port(&sim);
        let mut sink = Collector::default();
        let step1 = 0x8000 | SA_INIT1W_IE | 0o154 / 4;
        sim.script_sa(values(&[step1, 0x1000, 0x0000, 0x0000, 0x0001]));

        poll_until(&mut port, &mut sink, Step::Ready, 10);
        let intr = sim.interrupts();
        let presented: Vec<_> = intr.iter().map(|i| (i.vector, i.value)).collect();
        assert_eq!(
            presented,
            vec![
                (0o154, Some(0x1080)),
                (0o154, Some(0x2000 | SA_INIT3R_IE | 0o154 / 4)),
                (0o154, Some(0x4031)),
            ]
        );
        // The step 4 wait goes through SA alone.
        assert_eq!(sim.sa_log().len(), 5);
    }

    #[test]
    fn test_wrap_around_diagnostic() {
        let sim = SimulatedKlesi::new_qbus(0x1000);
        let mut port = port(&sim);
        let mut sink = Collector::default();
        let mut script = values(&[0xC000, 0x1234, 0x4321]);
        script.push(SaReply::Reset);
        sim.script_sa(script);

        port.poll(&mut sink);
        port.poll(&mut sink);
        assert_eq!(port.step(), Step::DiagWrap);
        port.poll(&mut sink);
        port.poll(&mut sink);
        assert_eq!(port.step(), Step::DiagWrap);
        port.poll(&mut sink);
        assert_eq!(port.step(), Step::Reinit);
        assert_eq!(sim.sa_log(), vec![QBUS_STEP1, 0xC000, 0x1234, 0x4321]);
    }

    #[test]
    fn test_purge_poll_diagnostic() {
        let sim = SimulatedKlesi::new_unibus(0x1000);
        let mut port = port(&sim);
        let mut sink = Collector::default();
        sim.script_sa(values(&[0x8000, 0x0100, 0x8000, 0x0001]));

        poll_until(&mut port, &mut sink, Step::DiagPurgePoll, 5);
        assert_eq!(sim.sa_log()[0], UNIBUS_STEP1);
        port.poll(&mut sink);
        assert_eq!(port.step(), Step::DiagPurgePoll);

        // POLL alone isn't enough while the purge is outstanding, but it
        // isn't forgotten either.
        sim.post_poll();
        port.poll(&mut sink);
        assert_eq!(port.step(), Step::DiagPurgePoll);
        sim.post_purged();
        port.poll(&mut sink);
        assert_eq!(port.step(), Step::Step4);
        port.poll(&mut sink);
        assert_eq!(port.step(), Step::Ready);
    }

    #[test]
    fn test_unknown_adapter() {
        let sim = SimulatedKlesi::new(0x0004, 0x1000);
        let mut port = port(&sim);
        let mut sink = Collector::default();
        for _ in 0..3 {
            port.poll(&mut sink);
            assert_eq!(port.step(), Step::TryStart);
        }
        assert!(sim.sa_log().is_empty());
    }

    #[test]
    fn test_error_flags_sa_and_retries() {
        // Rings beyond the end of host memory.
        let sim = SimulatedKlesi::new_qbus(0x1000);
        let mut port = port(&sim);
        let mut sink = Collector::default();
        sim.script_sa(values(&[0x8000, 0x8000, 0x0000]));

        poll_until(&mut port, &mut sink, Step::Step4, 5);
        port.poll(&mut sink);
        assert_eq!(port.step(), Step::Step4);
        assert_eq!(sim.last_sa(), Some(SA_ERROR | 0x4031));
    }
}
