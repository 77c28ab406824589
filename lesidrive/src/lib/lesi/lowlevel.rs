use log::trace;
use std::hint;

use super::pins::{LesiPins, Timing};
use crate::error::{LesiError, LesiResult};

const DATA_MASK: u32 = 0xFFFF;
const PARITY_SHIFT: u32 = 16;
/// Spins between calls to `LesiPins::idle` while waiting on T1.
const IDLE_INTERVAL: u32 = 64;

#[inline]
fn pareven8(v: u8) -> u8 {
    ((0x6996u16 >> ((v ^ (v >> 4)) & 0xF)) & 1) as u8
}

/// The two LESI parity bits of a data word: bit 0 covers the low byte, bit 1
/// the high byte.
#[inline]
pub fn parity(word: u16) -> u8 {
    pareven8(word as u8) | (pareven8((word >> 8) as u8) << 1)
}

/// Pack a word for the bus: inverted data plus parity.
#[inline]
pub(crate) fn encode(word: u16) -> u32 {
    (!(word as u32) & DATA_MASK) | ((parity(word) as u32) << PARITY_SHIFT)
}

/// Unpack a raw bus sample. Returns the word and whether its parity held.
#[inline]
pub(crate) fn decode(raw: u32) -> (u16, bool) {
    let word = !(raw & DATA_MASK) as u16;
    let par = ((raw >> PARITY_SHIFT) & 3) as u8;
    (word, par == parity(word))
}

/// Single command and data cycles over the LESI pins.
pub struct LowLevel<P: LesiPins> {
    pins: P,
    timing: Timing,
    /// Current transceiver direction; `None` until first set.
    write_direction: Option<bool>,
}

impl<P: LesiPins> LowLevel<P> {
    /// Take over the pins and park the bus: strobe and command released,
    /// power not good, transceivers towards us.
    pub fn new(pins: P, timing: Timing) -> Self {
        let mut ll = LowLevel {
            pins,
            timing,
            write_direction: None,
        };
        ll.pins.set_strobe(false);
        ll.pins.set_command(false);
        ll.pins.set_ac_clear(false);
        ll.pins.set_power_good(false);
        ll.set_direction(false);
        ll
    }

    pub fn pins(&self) -> &P {
        &self.pins
    }

    pub fn pins_mut(&mut self) -> &mut P {
        &mut self.pins
    }

    /// Switch the bus direction, paying the turnaround delay only on an
    /// actual change.
    fn set_direction(&mut self, write: bool) {
        if self.write_direction == Some(write) {
            return;
        }
        self.pins.set_buffer_direction(write);
        self.pins.delay_ns(self.timing.turnaround);
        self.write_direction = Some(write);
    }

    /// Drive one word onto the bus and strobe it into the adapter. A command
    /// cycle leaves the bus turned back towards us.
    pub fn write(&mut self, word: u16, is_command: bool) -> LesiResult<()> {
        if self.pins.init_seen() {
            return Err(LesiError::Reset);
        }
        trace!("LESI write {:06o}{}", word, if is_command { " [cmd]" } else { "" });

        if is_command {
            self.pins.set_command(true);
            self.pins.delay_ns(self.timing.cmd_strobe);
        }

        self.set_direction(true);
        self.pins.put_data(encode(word));

        self.pins.delay_ns(self.timing.write_setup);
        self.pins.set_strobe(true);
        self.pins.delay_ns(self.timing.write_strobe);
        self.pins.set_strobe(false);

        if is_command {
            self.pins.delay_ns(self.timing.strobe_cmd);
            self.pins.set_command(false);
            self.set_direction(false);
            self.pins.delay_ns(self.timing.cmd_end);
        }

        if self.pins.init_seen() {
            return Err(LesiError::Reset);
        }
        Ok(())
    }

    /// Sample the word the adapter is currently presenting.
    pub fn read(&mut self) -> LesiResult<u16> {
        self.set_direction(false);
        let (word, parity_ok) = decode(self.pins.get_data());

        if self.pins.init_seen() {
            return Err(LesiError::Reset);
        }
        if !parity_ok {
            return Err(LesiError::AdapterBusParity);
        }
        trace!("LESI read  {:06o}", word);
        Ok(word)
    }

    /// Pulse strobe to advance a multi-word scratchpad read. With `wait`,
    /// strobe is held until the adapter raises T1.
    pub fn read_strobe(&mut self, wait: bool) -> LesiResult<()> {
        if self.pins.init_seen() {
            return Err(LesiError::Reset);
        }
        self.pins.set_strobe(true);
        self.pins.delay_ns(self.timing.read_strobe);
        if wait {
            self.wait_ready()?;
        }
        self.pins.set_strobe(false);

        if self.pins.init_seen() {
            return Err(LesiError::Reset);
        }
        Ok(())
    }

    /// Block until T1 asserts. Only a host reset ends the wait otherwise.
    pub fn wait_ready(&mut self) -> LesiResult<()> {
        self.wait_t1(true)
    }

    /// Block until T1 drops.
    pub fn wait_busy(&mut self) -> LesiResult<()> {
        self.wait_t1(false)
    }

    fn wait_t1(&mut self, level: bool) -> LesiResult<()> {
        self.pins.delay_us(self.timing.ready_settle_us);
        let mut spins: u32 = 0;
        loop {
            if self.pins.ready() == level {
                return Ok(());
            }
            if self.pins.init_seen() {
                return Err(LesiError::Reset);
            }
            spins = spins.wrapping_add(1);
            if spins % IDLE_INTERVAL == 0 {
                self.pins.idle();
            }
            hint::spin_loop();
        }
    }

    pub fn set_power_good(&mut self, good: bool) {
        self.pins.set_power_good(good);
        self.pins.delay_us(self.timing.power_good_us);
    }

    /// Pulse AC clear, resetting the adapter.
    pub fn reset_adapter(&mut self) {
        self.pins.set_ac_clear(true);
        self.pins.delay_us(self.timing.ac_clear_us);
        self.pins.set_ac_clear(false);
        self.pins.delay_us(self.timing.ac_clear_us);
    }

    pub fn clear_init(&mut self) {
        self.pins.clear_init();
    }

    pub fn check_init(&mut self) -> bool {
        self.pins.init_seen()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    /// Pins that record what was driven and replay canned samples.
    #[derive(Default)]
    struct RecordingPins {
        direction_changes: Vec<bool>,
        driven: Vec<u32>,
        sample: u32,
        ready_after: u32,
        ready_polls: u32,
        init: bool,
        init_after_strobe: bool,
        turnaround_delays: u32,
        idles: u32,
    }

    impl LesiPins for RecordingPins {
        fn set_buffer_direction(&mut self, write: bool) {
            self.direction_changes.push(write);
        }
        fn put_data(&mut self, raw: u32) {
            self.driven.push(raw);
        }
        fn get_data(&mut self) -> u32 {
            self.sample
        }
        fn set_command(&mut self, _asserted: bool) {}
        fn set_strobe(&mut self, asserted: bool) {
            if !asserted && self.init_after_strobe {
                self.init = true;
            }
        }
        fn ready(&mut self) -> bool {
            self.ready_polls += 1;
            self.ready_polls > self.ready_after
        }
        fn init_seen(&mut self) -> bool {
            self.init
        }
        fn clear_init(&mut self) {
            self.init = false;
        }
        fn set_power_good(&mut self, _good: bool) {}
        fn set_ac_clear(&mut self, _asserted: bool) {}
        fn delay_ns(&mut self, ns: u32) {
            if ns == Timing::default().turnaround {
                self.turnaround_delays += 1;
            }
        }
        fn delay_us(&mut self, _us: u32) {}
        fn idle(&mut self) {
            self.idles += 1;
        }
    }

    fn engine() -> LowLevel<RecordingPins> {
        LowLevel::new(RecordingPins::default(), Timing::default())
    }

    #[test]
    fn test_parity_is_pure() {
        for w in [0u16, 1, 0x00FF, 0x0100, 0x8001, 0xAAAA, 0x1337, 0xFFFF] {
            assert_eq!(parity(w), parity(w));
        }
        assert_eq!(parity(0x0000), 0b00);
        assert_eq!(parity(0x0001), 0b01);
        assert_eq!(parity(0x0100), 0b10);
        assert_eq!(parity(0x0303), 0b00);
        assert_eq!(parity(0x0703), 0b10);
    }

    #[test]
    fn test_encode_decode() {
        let raw = encode(0x1234);
        assert_eq!(raw & DATA_MASK, 0xEDCB);
        assert_eq!(decode(raw), (0x1234, true));
        assert_eq!(decode(raw ^ (1 << PARITY_SHIFT)), (0x1234, false));
    }

    #[test]
    fn test_direction_is_cached() {
        let mut ll = engine();
        // Parked towards us at construction.
        assert_eq!(ll.pins().direction_changes, vec![false]);
        let base = ll.pins().turnaround_delays;

        // Data writes stay in write direction.
        ll.write(1, false).unwrap();
        ll.write(2, false).unwrap();
        assert_eq!(ll.pins().direction_changes, vec![false, true]);
        assert_eq!(ll.pins().turnaround_delays, base + 1);

        // A command cycle turns the bus back.
        ll.write(3, true).unwrap();
        assert_eq!(ll.pins().direction_changes, vec![false, true, false]);

        // Reading in read direction needs no turnaround.
        ll.pins_mut().sample = encode(7);
        assert_eq!(ll.read(), Ok(7));
        assert_eq!(ll.pins().direction_changes.len(), 3);
        assert_eq!(ll.pins().turnaround_delays, base + 2);
        assert_eq!(ll.pins().driven, vec![encode(1), encode(2), encode(3)]);
    }

    #[test]
    fn test_reset_detection() {
        let mut ll = engine();
        ll.pins_mut().init = true;
        assert_eq!(ll.write(0, true), Err(LesiError::Reset));
        assert!(ll.pins().driven.is_empty());

        // Reset arriving during the strobe is reported after it.
        let mut ll = engine();
        ll.pins_mut().init_after_strobe = true;
        assert_eq!(ll.write(0, false), Err(LesiError::Reset));
        assert_eq!(ll.pins().driven.len(), 1);
    }

    #[test]
    fn test_read_parity_error() {
        let mut ll = engine();
        ll.pins_mut().sample = encode(0x4242) ^ (2 << PARITY_SHIFT);
        assert_eq!(ll.read(), Err(LesiError::AdapterBusParity));

        // A concurrent reset wins over the parity error.
        ll.pins_mut().init = true;
        assert_eq!(ll.read(), Err(LesiError::Reset));
    }

    #[test]
    fn test_wait_ready_idles_and_resets() {
        let mut ll = engine();
        ll.pins_mut().ready_after = 200;
        assert_eq!(ll.wait_ready(), Ok(()));
        assert_eq!(ll.pins().idles, 200 / IDLE_INTERVAL);

        let mut ll = engine();
        ll.pins_mut().ready_after = u32::MAX;
        ll.pins_mut().init = true;
        assert_eq!(ll.wait_ready(), Err(LesiError::Reset));
    }

    #[test]
    fn test_wait_busy() {
        let mut ll = engine();
        // T1 is never low with ready_after = 0.
        ll.pins_mut().ready_after = 0;
        ll.pins_mut().init = true;
        assert_eq!(ll.wait_busy(), Err(LesiError::Reset));

        let mut ll = engine();
        ll.pins_mut().ready_after = u32::MAX;
        assert_eq!(ll.wait_busy(), Ok(()));
    }
}
