/// Raw access to the LESI connector, provided by the platform (GPIO pads on
/// real hardware, a behavioural model in the simulator).
///
/// The 18 data lines are exchanged as one raw value: bits 0-15 carry the
/// data word driven active-low, bits 16-17 the even parity of its low and
/// high byte.
pub trait LesiPins {
    /// Point the bus transceivers towards the adapter (`true`) or towards
    /// us (`false`).
    fn set_buffer_direction(&mut self, write: bool);
    fn put_data(&mut self, raw: u32);
    fn get_data(&mut self) -> u32;
    fn set_command(&mut self, asserted: bool);
    fn set_strobe(&mut self, asserted: bool);
    /// The T1 line: the adapter has finished what it was asked to do.
    fn ready(&mut self) -> bool;
    /// Whether an INIT from the host has been latched since the last
    /// `clear_init`.
    fn init_seen(&mut self) -> bool;
    /// Wait for the INIT line to drop, then clear the latch.
    fn clear_init(&mut self);
    fn set_power_good(&mut self, good: bool);
    fn set_ac_clear(&mut self, asserted: bool);
    fn delay_ns(&mut self, ns: u32);
    fn delay_us(&mut self, us: u32);

    /// Called periodically from busy-waits. The default gives the rest of the
    /// system (backend worker threads) a chance to run.
    fn idle(&mut self) {
        std::thread::yield_now();
    }
}

/// Bus timing, in nanoseconds unless stated otherwise.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Timing {
    pub turnaround: u32,
    pub cmd_strobe: u32,
    pub write_setup: u32,
    pub write_strobe: u32,
    pub strobe_cmd: u32,
    pub cmd_end: u32,
    pub read_strobe: u32,
    /// Microseconds.
    pub power_good_us: u32,
    /// Microseconds, applied on both edges of the pulse.
    pub ac_clear_us: u32,
    /// Microseconds before T1 is first sampled.
    pub ready_settle_us: u32,
}

impl Default for Timing {
    fn default() -> Self {
        Timing {
            turnaround: 60,
            cmd_strobe: 30,
            write_setup: 40,
            write_strobe: 100,
            strobe_cmd: 30,
            cmd_end: 30,
            read_strobe: 100,
            power_good_us: 10_000,
            ac_clear_us: 1_000,
            ready_settle_us: 50,
        }
    }
}
