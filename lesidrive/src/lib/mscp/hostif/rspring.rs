//! Response ring producer: one response at a time goes into the next slot
//! the host has offered.

use log::{debug, trace};

use lesidrive_utils::read_le::bytes_to_words;

use super::commarea::*;
use super::Port;
use crate::error::{FatalCode, LesiError, PortResult, When};
use crate::lesi::LesiPins;
use crate::mscp::{Packet, Rejected};

/// Responses up to this long always fit the host's buffer.
const MIN_BUFFER: u16 = 60;

#[derive(Debug, Default, Copy, Clone, PartialEq, Eq)]
pub(super) enum RspRingState {
    #[default]
    Unused,
    WaitFull,
    TransferSize,
    TransferPayload,
    TransferEnvelope,
    TransferOwnership,
    SendInterrupt,
}

/// Progress through the current response slot.
#[derive(Debug, Default)]
pub(super) struct RspRing {
    state: RspRingState,
    idx: u32,
    desc: Descriptor,
    fir: bool,
    /// The envelope as it will be written, length truncated to fit.
    header: Envelope,
    packet: Option<Packet>,
}

impl RspRing {
    pub(super) fn reset(&mut self) {
        *self = RspRing::default();
    }

    pub(super) fn busy(&self) -> bool {
        self.state != RspRingState::Unused
    }

    pub(super) fn submit(&mut self, packet: Packet) -> Result<(), Rejected> {
        if self.busy() {
            return Err(Rejected {
                error: LesiError::Busy,
                packet,
            });
        }
        self.packet = Some(packet);
        self.state = RspRingState::WaitFull;
        Ok(())
    }
}

impl<P: LesiPins> Port<P> {
    /// Move the pending response along as far as it will go.
    pub(super) fn drive_response(&mut self) -> PortResult<()> {
        let size = self.link.rsize;
        let idx = self.rsp.idx;
        let slot = self.link.rring + DESC_SIZE * idx;
        let mask = self.link.addr_mask;

        let (msg_len, envelope) = match &self.rsp.packet {
            Some(packet) => (packet.msg_len, packet.envelope()),
            None => {
                self.rsp.state = RspRingState::Unused;
                return Ok(());
            }
        };

        loop {
            match self.rsp.state {
                RspRingState::Unused => return Ok(()),
                RspRingState::WaitFull => {
                    trace!("Polling response slot {}", idx);
                    let desc = self.read_descriptor(slot)?;
                    if !desc.owner() {
                        trace!("Response ring full");
                        return Ok(());
                    }
                    debug!(
                        "Accepted response descriptor [{}] address {:09o} F={}",
                        idx,
                        desc.address(mask),
                        desc.flag()
                    );
                    self.rsp.desc = desc;
                    self.rsp.fir = desc.flag();
                    self.rsp.state = RspRingState::TransferSize;
                }
                RspRingState::TransferSize => {
                    let bufsz = if msg_len > MIN_BUFFER {
                        let addr = self.rsp.desc.envelope_address(mask);
                        let mut words = [0; 2];
                        self.ring_read(addr, &mut words, FatalCode::EnvelopeRead, When::CtrlRead)?;
                        Envelope::from_words(words).msg_len
                    } else {
                        msg_len
                    };
                    if msg_len > bufsz {
                        debug!("Response of {} bytes truncated to {}", msg_len, bufsz);
                    }
                    self.rsp.header = Envelope {
                        msg_len: msg_len.min(bufsz),
                        ..envelope
                    };
                    self.rsp.state = RspRingState::TransferPayload;
                }
                RspRingState::TransferPayload => {
                    let len = self.rsp.header.msg_len as usize;
                    let words = match &self.rsp.packet {
                        Some(packet) => bytes_to_words(&packet.data[..len.min(packet.data.len())]),
                        None => Vec::new(),
                    };
                    let addr = self.rsp.desc.address(mask);
                    self.ring_write(addr, &words, FatalCode::EnvelopeWrite, When::CtrlWrite)?;
                    self.rsp.state = RspRingState::TransferEnvelope;
                }
                RspRingState::TransferEnvelope => {
                    let addr = self.rsp.desc.envelope_address(mask);
                    let header = self.rsp.header;
                    self.ring_write(addr, &header.to_words(), FatalCode::EnvelopeWrite, When::CtrlWrite)?;
                    debug!(
                        "Response envelope [{}] conn {} type {} credit {} length {}",
                        idx, header.conn_id, header.msg_type, header.credit, header.msg_len
                    );
                    self.rsp.state = RspRingState::TransferOwnership;
                }
                RspRingState::TransferOwnership => {
                    let desc = self.rsp.desc.released();
                    self.ring_write(slot, &desc.to_words(), FatalCode::RingWrite, When::CtrlWrite)?;
                    if !self.rsp.fir {
                        break;
                    }
                    self.rsp.state = RspRingState::SendInterrupt;
                }
                RspRingState::SendInterrupt => {
                    if self.want_interrupt(self.link.rring, idx, size)? {
                        self.ring_interrupt(CAHDR_RSP_INTR)?;
                    }
                    break;
                }
            }
        }

        trace!("Response slot {} handed back", idx);
        self.rsp.idx = next_index(idx, size);
        self.rsp.packet = None;
        self.rsp.state = RspRingState::Unused;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::super::tests::ready_port;
    use super::super::Step;
    use super::*;
    use crate::mscp::HostPort;
    use crate::sim::{HostConfig, HostDriver, SimulatedKlesi};

    fn host(config: HostConfig) -> HostDriver {
        HostDriver::new(SimulatedKlesi::new_qbus(0x10000), config)
    }

    fn response(len: u16, seed: u8) -> Packet {
        Packet {
            msg_len: len,
            msg_type: MSG_TYPE_SEQ,
            credit: 1,
            conn_id: 2,
            data: (0..len).map(|i| seed.wrapping_add(i as u8)).collect(),
        }
    }

    #[test]
    fn test_delivers_response() {
        let mut host = host(HostConfig::default());
        let (mut port, mut sink) = ready_port(&host);

        host.offer_response_slot(64);
        port.submit_response(response(32, 0x10)).unwrap();
        assert!(port.response_pending());
        port.poll(&mut sink);
        assert!(!port.response_pending());

        let rsp = host.take_response().unwrap();
        assert_eq!(rsp.envelope.msg_len, 32);
        assert_eq!(rsp.envelope.credit, 1);
        assert_eq!(rsp.envelope.conn_id, 2);
        assert_eq!(rsp.data, response(32, 0x10).data);
        assert_eq!(host.ring_transition_flags(), (0, 0));
    }

    #[test]
    fn test_busy_keeps_first_response() {
        let mut host = host(HostConfig::default());
        let (mut port, mut sink) = ready_port(&host);

        port.submit_response(response(16, 1)).unwrap();
        let rejected = port.submit_response(response(20, 2)).unwrap_err();
        assert_eq!(rejected.error, LesiError::Busy);
        assert_eq!(rejected.packet, response(20, 2));

        // No slot offered yet: the response waits.
        port.poll(&mut sink);
        assert!(port.response_pending());
        assert_eq!(host.take_response(), None);

        host.offer_response_slot(64);
        port.poll(&mut sink);
        assert_eq!(host.take_response().unwrap().data, response(16, 1).data);
        port.submit_response(rejected.packet).unwrap();
    }

    #[test]
    fn test_long_response_truncated_to_buffer() {
        let mut host = host(HostConfig::default());
        let (mut port, mut sink) = ready_port(&host);
        let sim = host.sim().clone();

        host.offer_response_slot(80);
        let body = Descriptor(sim.read_memory_u32(host.rring())).address(ADDR_MASK_22);
        sim.write_memory(body + 80, &[0xEE, 0xEE]);

        port.submit_response(response(100, 0)).unwrap();
        port.poll(&mut sink);
        let rsp = host.take_response().unwrap();
        assert_eq!(rsp.envelope.msg_len, 80);
        assert_eq!(rsp.data, response(100, 0).data[..80]);
        assert_eq!(sim.read_memory(body + 80, 2), vec![0xEE, 0xEE]);
    }

    #[test]
    fn test_response_body_at_zero_is_bus_master_error() {
        for len in [32, 100] {
            let host = host(HostConfig::default());
            let (mut port, mut sink) = ready_port(&host);
            let sim = host.sim().clone();

            sim.write_memory_u32(host.rring(), Descriptor::OWNER);
            port.submit_response(response(len, 0)).unwrap();
            for _ in 0..3 {
                port.poll(&mut sink);
            }
            assert_eq!(port.step(), Step::Fatal);
            assert_eq!(port.fatal_code(), Some(FatalCode::BusMasterError));
        }
    }

    #[test]
    fn test_short_response_ignores_host_length() {
        let mut host = host(HostConfig::default());
        let (mut port, mut sink) = ready_port(&host);

        host.offer_response_slot(10);
        port.submit_response(response(32, 0)).unwrap();
        port.poll(&mut sink);
        assert_eq!(host.take_response().unwrap().envelope.msg_len, 32);
    }

    #[test]
    fn test_interrupts_only_when_ring_was_empty() {
        let mut host = host(HostConfig {
            vector: 0o154,
            ..HostConfig::default()
        });
        let (mut port, mut sink) = ready_port(&host);
        let sim = host.sim().clone();
        sim.take_interrupts();
        for _ in 0..4 {
            host.offer_response_slot(64);
        }

        port.submit_response(response(12, 0)).unwrap();
        port.poll(&mut sink);
        assert_eq!(host.ring_transition_flags(), (0, 1));
        assert_eq!(sim.take_interrupts().len(), 1);

        port.submit_response(response(12, 1)).unwrap();
        port.poll(&mut sink);
        assert!(sim.take_interrupts().is_empty());
        assert!(host.take_response().is_some());
        assert!(host.take_response().is_some());
    }
}
