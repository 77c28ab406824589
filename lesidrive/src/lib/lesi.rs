//! The LESI bus: a pin-level transaction engine, KLESI register and
//! scratchpad access built on it, and NPR block transfers to host memory.

mod klesi;
mod lowlevel;
mod npr;
mod pins;

pub use klesi::{classify_status, Klesi, StickyFlags};
pub use lowlevel::{parity, LowLevel};
pub(crate) use lowlevel::{decode, encode};
pub use pins::{LesiPins, Timing};

// Fields of a KLESI command word.
#[inline]
pub const fn cmd_wordcnt(i: u16) -> u16 {
    i & 15
}
#[inline]
pub const fn cmd_regsel(i: u16) -> u16 {
    (i & 7) << 8
}
#[inline]
pub const fn cmd_regsel_of(cmd: u16) -> u16 {
    (cmd >> 8) & 7
}
pub const CMD_BYTE: u16 = 0x0080;
/// Start an NPR transfer between host memory and the scratchpad.
pub const CMD_DO_NPR: u16 = 0x0800;
/// Interrupt the host.
pub const CMD_DO_INTR: u16 = 0x1000;
/// The next data cycle is written into the selected register.
pub const CMD_WRITE: u16 = 0x2000;
/// Let the host see scratchpad word 0 through its SA register.
pub const CMD_SA: u16 = 0x4000;
pub const CMD_CLEAR_WC: u16 = 0x8000;

// Register numbers for the REGSEL field.
pub const REG_RAM: u16 = 0;
pub const REG_STATUS: u16 = 1; // Read only.
pub const REG_UAL: u16 = 1; // Write only.
pub const REG_UAH: u16 = 2; // Write only.
pub const REG_CLEAR_POLL: u16 = 2; // Read only.
pub const REG_CLEAR_PURGED: u16 = 3; // Read only, UNIBUS only.

// Status register bits.
pub const SR_IDENT_UNIBUS: u16 = 0x0001;
pub const SR_IDENT_QBUS: u16 = 0x0002;
pub const SR_IDENT_MASK: u16 = 0x0007;
pub const SR_POLL: u16 = 0x0008;
/// Fixed at 1 on QBUS.
pub const SR_PURGED: u16 = 0x0010;
pub const SR_BUS_PE: u16 = 0x0020;
pub const SR_LESI_PE: u16 = 0x0040;
pub const SR_NXM: u16 = 0x0080;

/// Words in the KLESI scratchpad, and so in one NPR block.
pub const RAM_WORDS: usize = 16;
