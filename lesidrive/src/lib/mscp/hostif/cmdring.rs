//! Command ring consumer: claims host-owned slots, pulls in the envelope and
//! body, and hands the slot back.

use log::{debug, trace, warn};

use lesidrive_utils::write_le::words_to_bytes;

use super::commarea::*;
use super::Port;
use crate::error::{FatalCode, PortResult, Tagged, When};
use crate::lesi::{LesiPins, REG_CLEAR_POLL, SR_POLL};
use crate::mscp::{CommandSink, Packet};

#[derive(Debug, Default, Copy, Clone, PartialEq, Eq)]
pub(super) enum CmdRingState {
    #[default]
    Unused,
    TransferEnvelope,
    TransferPayload,
    TransferOwnership,
    SendInterrupt,
    /// The packet is complete and waits to be handed over.
    Queued,
}

/// Progress through the current command slot.
#[derive(Debug, Default)]
pub(super) struct CmdRing {
    state: CmdRingState,
    idx: u32,
    desc: Descriptor,
    /// The host asked to hear about this slot.
    fir: bool,
    envelope: Envelope,
    packet: Option<Packet>,
}

impl CmdRing {
    pub(super) fn reset(&mut self) {
        *self = CmdRing::default();
    }
}

impl<P: LesiPins> Port<P> {
    /// Take every waiting command off the ring, or look for a poll request
    /// if the ring was found empty last time.
    pub(super) fn poll_commands<S: CommandSink>(&mut self, sink: &mut S) -> PortResult<()> {
        if !self.link.c_poll {
            return self.handle_poll();
        }
        loop {
            self.fetch_command()?;
            if self.cmd.state != CmdRingState::Queued {
                return Ok(());
            }
            if let Some(packet) = self.cmd.packet.take() {
                sink.enqueue_command(packet);
            }
            self.cmd.state = CmdRingState::Unused;
        }
    }

    fn handle_poll(&mut self) -> PortResult<()> {
        let flags = self
            .klesi
            .read_status_flags(&mut self.sticky)
            .when(When::KlesiCmd)?;
        if flags & SR_POLL == 0 {
            return Ok(());
        }
        self.klesi.read_register(REG_CLEAR_POLL).when(When::KlesiCmd)?;
        self.klesi.lowlevel().read_strobe(false).when(When::KlesiCmd)?;
        debug!("Got POLL, resuming command ring polling");
        self.link.c_poll = true;
        Ok(())
    }

    /// Work on the current slot until its command is queued, the ring turns
    /// out empty, or something fails. Each phase is checkpointed.
    fn fetch_command(&mut self) -> PortResult<()> {
        let size = self.link.csize;
        let idx = self.cmd.idx;
        let slot = self.link.cring + DESC_SIZE * idx;
        let mask = self.link.addr_mask;

        loop {
            match self.cmd.state {
                CmdRingState::Unused => {
                    trace!("Polling command slot {}", idx);
                    let desc = self.read_descriptor(slot)?;
                    if !desc.owner() {
                        debug!("Command ring empty, halting polling");
                        self.link.c_poll = false;
                        return Ok(());
                    }
                    debug!(
                        "Accepted command descriptor [{}] address {:09o} F={}",
                        idx,
                        desc.address(mask),
                        desc.flag()
                    );
                    self.cmd.desc = desc;
                    self.cmd.fir = desc.flag();
                    self.cmd.state = CmdRingState::TransferEnvelope;
                }
                CmdRingState::TransferEnvelope => {
                    let addr = self.cmd.desc.envelope_address(mask);
                    let mut words = [0; 2];
                    self.ring_read(addr, &mut words, FatalCode::EnvelopeRead, When::CtrlRead)?;
                    let env = Envelope::from_words(words);
                    debug!(
                        "Command envelope [{}] conn {} type {} credit {} length {}",
                        idx, env.conn_id, env.msg_type, env.credit, env.msg_len
                    );
                    self.cmd.envelope = env;
                    self.cmd.state = CmdRingState::TransferPayload;
                }
                CmdRingState::TransferPayload => {
                    let count = self.cmd.envelope.body_len() / 2;
                    let mut words = Vec::new();
                    if words.try_reserve_exact(count).is_err() {
                        warn!("Could not allocate a {} word command buffer, retrying", count);
                        return Ok(());
                    }
                    words.resize(count, 0);
                    let addr = self.cmd.desc.address(mask);
                    self.ring_read(addr, &mut words, FatalCode::EnvelopeRead, When::CtrlRead)?;
                    self.cmd.packet = Some(Packet::new(self.cmd.envelope, words_to_bytes(&words)));
                    self.cmd.state = CmdRingState::TransferOwnership;
                }
                CmdRingState::TransferOwnership => {
                    let desc = self.cmd.desc.released();
                    self.ring_write(slot, &desc.to_words(), FatalCode::RingWrite, When::CtrlWrite)?;
                    if !self.cmd.fir {
                        break;
                    }
                    self.cmd.state = CmdRingState::SendInterrupt;
                }
                CmdRingState::SendInterrupt => {
                    if self.want_interrupt(self.link.cring, idx, size)? {
                        self.ring_interrupt(CAHDR_CMD_INTR)?;
                    }
                    break;
                }
                CmdRingState::Queued => return Ok(()),
            }
        }

        trace!("Command slot {} handed back", idx);
        self.cmd.idx = next_index(idx, size);
        self.cmd.state = CmdRingState::Queued;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::super::tests::ready_port;
    use crate::mscp::hostif::Descriptor;
    use super::super::Step;
    use crate::error::FatalCode;
    use crate::sim::{HostConfig, HostDriver, SimulatedKlesi};

    fn host(config: HostConfig) -> HostDriver {
        HostDriver::new(SimulatedKlesi::new_qbus(0x10000), config)
    }

    fn body(seed: u8, len: usize) -> Vec<u8> {
        (0..len).map(|i| seed.wrapping_add(i as u8)).collect()
    }

    #[test]
    fn test_takes_posted_command() {
        let mut host = host(HostConfig::default());
        let (mut port, mut sink) = ready_port(&host);

        assert!(host.post_command(&body(1, 48), 3));
        port.poll(&mut sink);
        assert_eq!(sink.commands.len(), 1);
        let packet = &sink.commands[0];
        assert_eq!(packet.msg_len, 48);
        assert_eq!(packet.conn_id, 3);
        // Short bodies are read in full.
        assert_eq!(packet.data.len(), 60);
        assert_eq!(&packet.data[..48], &body(1, 48)[..]);
        assert!(host.command_slot_returned(0));
        assert_eq!(host.ring_transition_flags(), (0, 0));
    }

    #[test]
    fn test_unowned_slot_is_left_alone() {
        let mut host = host(HostConfig::default());
        let (mut port, mut sink) = ready_port(&host);
        let sim = host.sim().clone();

        // A descriptor with a buffer but without OWNER.
        sim.write_memory_u32(host.cring(), 0x4000_2000);
        port.poll(&mut sink);
        assert!(sink.commands.is_empty());
        assert_eq!(sim.read_memory_u32(host.cring()), 0x4000_2000);

        // Once empty, the port waits for POLL before looking again.
        sim.write_memory_u32(host.cring(), 0);
        assert!(host.post_command(&body(7, 20), 0));
        port.poll(&mut sink);
        assert!(sink.commands.is_empty());
        port.poll(&mut sink);
        assert_eq!(sink.commands.len(), 1);
        assert_eq!(sink.commands[0].msg_len, 20);
    }

    #[test]
    fn test_body_at_zero_is_bus_master_error() {
        let host = host(HostConfig::default());
        let (mut port, mut sink) = ready_port(&host);
        let sim = host.sim().clone();

        // The envelope wraps to the top of the address space.
        sim.write_memory_u32(host.cring(), Descriptor::OWNER);
        sim.post_poll();
        for _ in 0..3 {
            port.poll(&mut sink);
        }
        assert!(sink.commands.is_empty());
        assert_eq!(port.step(), Step::Fatal);
        assert_eq!(port.fatal_code(), Some(FatalCode::BusMasterError));
    }

    #[test]
    fn test_body_in_unmapped_memory() {
        let host = host(HostConfig::default());
        let (mut port, mut sink) = ready_port(&host);
        let sim = host.sim().clone();

        let hole = host.data_area();
        sim.unmap_memory(hole..hole + 0x100);
        sim.write_memory_u32(host.cring(), Descriptor::OWNER | (hole + 0x10));
        sim.post_poll();
        for _ in 0..3 {
            port.poll(&mut sink);
        }
        assert!(sink.commands.is_empty());
        assert_eq!(port.fatal_code(), Some(FatalCode::BusMasterError));
    }

    #[test]
    fn test_interrupts_only_when_ring_was_full() {
        let mut host = host(HostConfig {
            vector: 0o154,
            ..HostConfig::default()
        });
        let (mut port, mut sink) = ready_port(&host);
        let sim = host.sim().clone();
        sim.take_interrupts();

        for n in 0..4 {
            assert!(host.post_command(&body(n, 12), 0));
        }
        assert!(!host.post_command(&body(9, 12), 0));
        port.poll(&mut sink);
        port.poll(&mut sink);
        assert_eq!(sink.commands.len(), 4);
        assert_eq!(host.ring_transition_flags(), (1, 0));
        let intr = sim.take_interrupts();
        assert_eq!(intr.len(), 1);
        assert_eq!(intr[0].vector, 0o154);
    }

    #[test]
    fn test_no_interrupt_without_flag() {
        let mut host = host(HostConfig::default());
        let (mut port, mut sink) = ready_port(&host);
        for n in 0..4 {
            assert!(host.post_command(&body(n, 12), 0));
        }
        port.poll(&mut sink);
        assert_eq!(sink.commands.len(), 4);
        assert_eq!(host.ring_transition_flags(), (0, 0));
    }

    #[test]
    fn test_single_slot_ring_always_interrupts() {
        let mut host = host(HostConfig {
            cring_exp: 0,
            vector: 0o300,
            ..HostConfig::default()
        });
        let (mut port, mut sink) = ready_port(&host);
        let sim = host.sim().clone();
        sim.take_interrupts();

        assert!(host.post_command(&body(0, 12), 0));
        port.poll(&mut sink);
        assert_eq!(sink.commands.len(), 1);
        assert_eq!(sim.take_interrupts().len(), 1);
    }

    #[test]
    fn test_host_reset_mid_ring() {
        let mut host = host(HostConfig::default());
        let (mut port, mut sink) = ready_port(&host);
        assert!(host.post_command(&body(0, 12), 0));
        host.sim().assert_init();
        port.poll(&mut sink);
        assert_eq!(port.step(), Step::Reinit);
        assert!(sink.commands.is_empty());
    }
}
