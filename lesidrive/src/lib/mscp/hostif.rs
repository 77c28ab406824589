//! The MSCP port: brings up the link with the host through the SA register,
//! then shuttles commands off the command ring and responses onto the
//! response ring.
//!
//! Everything runs from `poll`, one step at a time. Ring transfers
//! checkpoint their progress so an error can be retried on the next tick
//! without redoing completed work.

pub mod commarea;
mod cmdring;
mod portinit;
mod rspring;
pub mod sareg;

use log::{error, info, warn};

use self::cmdring::CmdRing;
use self::commarea::{prev_index, Descriptor, ADDR_MASK_22, DESC_SIZE};
use self::rspring::RspRing;
use self::sareg::{Features, SA_ERROR};
use super::{CommandSink, HostPort, Packet, Rejected};
use crate::error::{ring_transfer, FatalCode, LesiResult, PortError, PortResult, Tagged, When};
use crate::lesi::{Klesi, LesiPins, StickyFlags, Timing};

/// Default NPR burst, in longwords.
pub const DEFAULT_BURST: u16 = 8;

/// Buffer descriptors are 24 bits wide.
const BUFFER_ADDR_MASK: u32 = 0xFF_FFFF;

/// Where the port is in bringing up the link.
#[derive(Debug, Copy, Clone, PartialEq, Eq)]
pub enum Step {
    TryStart,
    Step1,
    Step2,
    Step3,
    /// Purge and poll test, requested in step 3.
    DiagPurgePoll,
    Step4,
    /// Step 4 value sent, waiting for GO.
    Step4Wait,
    Ready,
    /// Wrap-around test, requested in step 1. Only a reset ends it.
    DiagWrap,
    Reinit,
    Fatal,
}

/// Fixed identity reported during initialization.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PortConfig {
    pub model: u8,
    pub fw_version: u8,
    pub port_type: u8,
    pub default_burst: u16,
}

impl Default for PortConfig {
    fn default() -> Self {
        PortConfig {
            model: super::opcode::PORT_MODEL_RC25,
            fw_version: 1,
            port_type: 0,
            default_burst: DEFAULT_BURST,
        }
    }
}

/// Everything negotiated with the host during initialization.
#[derive(Debug, Default, Clone)]
struct Link {
    features: Features,
    addr_mask: u32,
    vector: u16,
    /// Ring size exponents until GO, slot counts after.
    csize: u32,
    rsize: u32,
    init_ie: bool,
    diag_wr: bool,
    ringbase: u32,
    purge_ie: bool,
    purge_seen: bool,
    burst: u16,
    last_fail: bool,
    cahdr: u32,
    rring: u32,
    cring: u32,
    /// The command ring may hold work.
    c_poll: bool,
}

pub struct Port<P: LesiPins> {
    klesi: Klesi<P>,
    sticky: StickyFlags,
    config: PortConfig,
    step: Step,
    link: Link,
    cmd: CmdRing,
    rsp: RspRing,
    fatal: Option<FatalCode>,
}

impl<P: LesiPins> Port<P> {
    pub fn new(pins: P, timing: Timing, config: PortConfig) -> Self {
        Port {
            klesi: Klesi::new(pins, timing),
            sticky: StickyFlags::default(),
            config,
            step: Step::TryStart,
            link: Link {
                addr_mask: ADDR_MASK_22,
                ..Link::default()
            },
            cmd: CmdRing::default(),
            rsp: RspRing::default(),
            fatal: None,
        }
    }

    pub fn klesi(&mut self) -> &mut Klesi<P> {
        &mut self.klesi
    }

    pub fn step(&self) -> Step {
        self.step
    }

    pub fn features(&self) -> Features {
        self.link.features
    }

    pub fn vector(&self) -> u16 {
        self.link.vector
    }

    /// Command and response ring sizes. Exponents until the link is up.
    pub fn ring_sizes(&self) -> (u32, u32) {
        (self.link.csize, self.link.rsize)
    }

    pub fn ringbase(&self) -> u32 {
        self.link.ringbase
    }

    pub fn burst(&self) -> u16 {
        self.link.burst
    }

    pub fn purge_interrupts(&self) -> bool {
        self.link.purge_ie
    }

    pub fn fatal_code(&self) -> Option<FatalCode> {
        self.fatal
    }

    /// Whether a response is still on its way into the response ring.
    pub fn response_pending(&self) -> bool {
        self.rsp.busy()
    }

    /// Advance initialization or the rings by one step.
    pub fn poll<S: CommandSink>(&mut self, sink: &mut S) {
        match self.step {
            Step::TryStart => self.try_start(),
            Step::Step1 => self.init_step1(),
            Step::Step2 => self.init_step2(),
            Step::Step3 => self.init_step3(),
            Step::DiagPurgePoll => self.diag_purge_poll(),
            Step::Step4 | Step::Step4Wait => self.init_step4(),
            Step::DiagWrap => self.diag_wrap(),
            Step::Ready => self.active(sink),
            Step::Reinit => self.do_reinit(sink),
            Step::Fatal => {
                if self.klesi.lowlevel().check_init() {
                    self.step = Step::Reinit;
                }
            }
        }
    }

    /// Force the link back through initialization.
    pub fn reinit(&mut self) {
        self.step = Step::Reinit;
    }

    fn active<S: CommandSink>(&mut self, sink: &mut S) {
        let result = self.poll_commands(sink).and_then(|_| self.drive_response());
        if let Err(e) = result {
            self.ring_failed(e);
        }
    }

    /// Read host memory on behalf of a ring transfer.
    fn ring_read(
        &mut self,
        addr: u32,
        buf: &mut [u16],
        fcode: FatalCode,
        when: When,
    ) -> PortResult<()> {
        self.klesi.set_host_address(addr).when(When::KlesiCmd)?;
        ring_transfer(self.klesi.read_dma(&mut self.sticky, buf), fcode, when)
    }

    fn ring_write(&mut self, addr: u32, buf: &[u16], fcode: FatalCode, when: When) -> PortResult<()> {
        self.klesi.set_host_address(addr).when(When::KlesiCmd)?;
        ring_transfer(self.klesi.write_dma(&mut self.sticky, buf), fcode, when)
    }

    fn read_descriptor(&mut self, addr: u32) -> PortResult<Descriptor> {
        let mut words = [0; 2];
        self.ring_read(addr, &mut words, FatalCode::RingRead, When::CtrlRead)?;
        Ok(Descriptor::from_words(words))
    }

    /// Whether handing back slot `idx` of a ring should interrupt the host:
    /// always on a one slot ring, otherwise only when the slot before it
    /// still belongs to the port.
    fn want_interrupt(&mut self, base: u32, idx: u32, size: u32) -> PortResult<bool> {
        if size == 1 {
            return Ok(true);
        }
        let prev = self.read_descriptor(base + DESC_SIZE * prev_index(idx, size))?;
        Ok(prev.owner())
    }

    /// Set the ring transition word at `offset` in the header and interrupt
    /// the host if it gave us a vector.
    fn ring_interrupt(&mut self, offset: u32) -> PortResult<()> {
        self.klesi
            .set_host_address(self.link.cahdr + offset)
            .when(When::IntrReq)?;
        ring_transfer(
            self.klesi.write_dma(&mut self.sticky, &[1]),
            FatalCode::InterruptWrite,
            When::IntrReq,
        )?;
        if self.link.vector != 0 {
            self.klesi.send_interrupt(self.link.vector).when(When::IntrReq)?;
        }
        Ok(())
    }

    fn ring_failed(&mut self, e: PortError) {
        if e.is_reset() {
            info!("Host reset during ring processing");
            self.step = Step::Reinit;
        } else if let Some(code) = e.fatal {
            self.enter_fatal(code, e);
        } else {
            warn!("Ring transfer failed: {}, retrying", e);
        }
    }

    fn enter_fatal(&mut self, code: FatalCode, cause: PortError) {
        error!("MSCP port fatal error {}: {}", code.code(), cause);
        let value = SA_ERROR | code.code();
        let result = if self.link.vector != 0 {
            self.klesi.send_interrupt_with_value(self.link.vector, value)
        } else {
            self.klesi.send_value(value)
        };
        if let Err(e) = result {
            warn!("Could not report fatal error to host: {}", e);
        }
        self.fatal = Some(code);
        self.step = Step::Fatal;
    }

    fn do_reinit<S: CommandSink>(&mut self, sink: &mut S) {
        info!("Host requested initialization");
        sink.reinit();

        // Nothing here can be retried, so failures are only logged.
        let log_failure = |what: &str, result: LesiResult<()>| {
            if let Err(e) = result {
                warn!("Reinit: {} failed: {}", what, e);
            }
        };
        log_failure("status read", self.klesi.read_status(&mut self.sticky).map(drop));
        self.klesi.lowlevel().clear_init();
        log_failure("status read", self.klesi.read_status(&mut self.sticky).map(drop));
        log_failure("SA clear", self.klesi.write_ram_word(0, 0));
        self.klesi.reset();

        self.cmd.reset();
        self.rsp.reset();
        self.sticky.clear();
        self.klesi.clear_burst();
        self.fatal = None;
        self.link = Link {
            addr_mask: self.link.addr_mask,
            ..Link::default()
        };
        self.step = Step::TryStart;
    }
}

impl<P: LesiPins> HostPort for Port<P> {
    fn read_host(&mut self, addr: u32, buf: &mut [u16]) -> LesiResult<()> {
        self.klesi.set_host_address(addr & BUFFER_ADDR_MASK)?;
        self.klesi.read_dma(&mut self.sticky, buf)
    }

    fn write_host(&mut self, addr: u32, buf: &[u16]) -> LesiResult<()> {
        self.klesi.set_host_address(addr & BUFFER_ADDR_MASK)?;
        self.klesi.write_dma(&mut self.sticky, buf)
    }

    fn submit_response(&mut self, packet: Packet) -> Result<(), Rejected> {
        self.rsp.submit(packet)
    }
}

#[cfg(test)]
pub(crate) mod tests {
    use super::*;
    use crate::sim::{HostConfig, HostDriver, SaReply, SimulatedKlesi};

    /// Collects what the port hands over.
    #[derive(Default)]
    pub(crate) struct Collector {
        pub commands: Vec<Packet>,
        pub reinits: usize,
    }

    impl CommandSink for Collector {
        fn enqueue_command(&mut self, packet: Packet) {
            self.commands.push(packet);
        }

        fn reinit(&mut self) {
            self.reinits += 1;
        }
    }

    pub(crate) fn port(sim: &SimulatedKlesi) -> Port<SimulatedKlesi> {
        crate::init_test_logging();
        Port::new(sim.clone(), Timing::default(), PortConfig::default())
    }

    /// Poll until the port reaches `step`, giving up after `limit` ticks.
    pub(crate) fn poll_until(
        port: &mut Port<SimulatedKlesi>,
        sink: &mut Collector,
        step: Step,
        limit: usize,
    ) {
        for _ in 0..limit {
            if port.step() == step {
                return;
            }
            port.poll(sink);
        }
        assert_eq!(port.step(), step);
    }

    /// A port with the link up against `host`.
    pub(crate) fn ready_port(host: &HostDriver) -> (Port<SimulatedKlesi>, Collector) {
        let mut port = port(host.sim());
        let mut sink = Collector::default();
        host.script_init();
        poll_until(&mut port, &mut sink, Step::Ready, 10);
        (port, sink)
    }

    #[test]
    fn test_fatal_waits_for_init() {
        let sim = SimulatedKlesi::new_qbus(0x10000);
        let host = HostDriver::new(sim.clone(), HostConfig::default());
        let (mut port, mut sink) = ready_port(&host);

        // A command ring pointing at missing memory latches the port.
        sim.write_memory_u32(host.cring(), 0x8000_0000 | 0x3F_0000);
        sim.post_poll();
        port.poll(&mut sink);
        port.poll(&mut sink);
        assert_eq!(port.step(), Step::Fatal);
        assert_eq!(port.fatal_code(), Some(FatalCode::BusMasterError));
        assert_eq!(sim.last_sa(), Some(SA_ERROR | 11));
        assert!(sink.commands.is_empty());

        port.poll(&mut sink);
        assert_eq!(port.step(), Step::Fatal);

        sim.assert_init();
        port.poll(&mut sink);
        assert_eq!(port.step(), Step::Reinit);
        port.poll(&mut sink);
        assert_eq!(port.step(), Step::TryStart);
        assert_eq!(port.fatal_code(), None);
        assert_eq!(sink.reinits, 1);
    }

    #[test]
    fn test_fatal_interrupts_when_vectored() {
        let sim = SimulatedKlesi::new_qbus(0x10000);
        let config = HostConfig {
            vector: 0o154,
            ..HostConfig::default()
        };
        let host = HostDriver::new(sim.clone(), config);
        let (mut port, mut sink) = ready_port(&host);
        sim.take_interrupts();

        sim.write_memory_u32(host.cring(), 0x8000_0000 | 0x3F_0000);
        sim.post_poll();
        port.poll(&mut sink);
        port.poll(&mut sink);
        assert_eq!(port.step(), Step::Fatal);
        let intr = sim.take_interrupts();
        assert_eq!(intr.len(), 1);
        assert_eq!(intr[0].vector, 0o154);
        assert_eq!(intr[0].value, Some(SA_ERROR | 11));
    }

    #[test]
    fn test_reset_during_handshake_reinits() {
        let sim = SimulatedKlesi::new_unibus(0x10000);
        let mut port = port(&sim);
        let mut sink = Collector::default();
        sim.script_sa([SaReply::Reset]);
        poll_until(&mut port, &mut sink, Step::Reinit, 5);
        port.poll(&mut sink);
        assert_eq!(port.step(), Step::TryStart);
        assert_eq!(sink.reinits, 1);

        // The next attempt goes through.
        let host = HostDriver::new(sim.clone(), HostConfig::default());
        host.script_init();
        poll_until(&mut port, &mut sink, Step::Ready, 10);
    }

    #[test]
    fn test_host_buffer_access() {
        let sim = SimulatedKlesi::new_qbus(0x10000);
        let host = HostDriver::new(sim.clone(), HostConfig::default());
        let (mut port, _sink) = ready_port(&host);

        let addr = host.data_area();
        port.write_host(addr, &[1, 2, 3]).unwrap();
        assert_eq!(sim.read_memory_words(addr, 3), vec![1, 2, 3]);

        // The top byte of a buffer descriptor is not part of the address.
        let mut buf = [0u16; 3];
        port.read_host(0x7F00_0000 | addr, &mut buf).unwrap();
        assert_eq!(buf, [1, 2, 3]);
    }
}
