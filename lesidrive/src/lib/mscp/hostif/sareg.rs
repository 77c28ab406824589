//! Bits of the SA register as used during port initialization. `R` values
//! are presented by the port, `W` values are written back by the host.

pub const SA_ERROR: u16 = 0x8000;
pub const SA_GO: u16 = 0x0001;

pub const SA_INIT1_STEP: u16 = 0x0800;
pub const SA_INIT2_STEP: u16 = 0x1000;
pub const SA_INIT3_STEP: u16 = 0x2000;
pub const SA_INIT4_STEP: u16 = 0x4000;

// Step 1, port to host.
/// No settable interrupt vector.
pub const SA_INIT1R_NV: u16 = 0x0400;
/// 22-bit host bus.
pub const SA_INIT1R_QB: u16 = 0x0200;
/// Enhanced diagnostics.
pub const SA_INIT1R_DI: u16 = 0x0100;
/// Odd host addresses allowed.
pub const SA_INIT1R_OD: u16 = 0x0080;
/// Address mapping.
pub const SA_INIT1R_MP: u16 = 0x0040;

// Step 1, host to port.
/// Must be set for the reply to count.
pub const SA_INIT1W_VALID: u16 = 0x8000;
/// Diagnostic wrap-around.
pub const SA_INIT1W_WR: u16 = 0x4000;
pub const SA_INIT1W_CRING_MASK: u16 = 0x3800;
pub const SA_INIT1W_CRING_BIT: u16 = 11;
pub const SA_INIT1W_RRING_MASK: u16 = 0x0700;
pub const SA_INIT1W_RRING_BIT: u16 = 8;
/// Interrupt on each initialization step.
pub const SA_INIT1W_IE: u16 = 0x0080;
/// Vector address divided by 4.
pub const SA_INIT1W_VADR_MASK: u16 = 0x007F;

// Step 2, port to host.
pub const SA_INIT2R_PTYP_MASK: u16 = 0x0700;
pub const SA_INIT2R_PTYP_BIT: u16 = 8;
pub const SA_INIT2R_ALWAYS: u16 = 0x0080;
pub const SA_INIT2R_WR: u16 = 0x0040;
pub const SA_INIT2R_CRING_MASK: u16 = 0x0038;
pub const SA_INIT2R_CRING_BIT: u16 = 3;
pub const SA_INIT2R_RRING_MASK: u16 = 0x0007;

// Step 2, host to port.
pub const SA_INIT2W_RINGBASE_MASK: u16 = 0xFFFE;
/// Purge interrupts wanted.
pub const SA_INIT2W_PI: u16 = 0x0001;

// Step 3, port to host.
pub const SA_INIT3R_IE: u16 = 0x0080;
pub const SA_INIT3R_VADR_MASK: u16 = 0x007F;

// Step 3, host to port.
/// Run the purge and poll test.
pub const SA_INIT3W_PP: u16 = 0x8000;
pub const SA_INIT3W_HRBASE_MASK: u16 = 0x7FFF;

// Step 4, port to host.
pub const SA_INIT4R_MOD_MASK: u16 = 0x00F0;
pub const SA_INIT4R_MOD_BIT: u16 = 4;
pub const SA_INIT4R_VER_MASK: u16 = 0x000F;

// Step 4, host to port.
/// Longwords per NPR transfer, 0 for the port default.
pub const SA_INIT4W_BURST_MASK: u16 = 0xFF00;
pub const SA_INIT4W_BURST_BIT: u16 = 8;
/// Host wants last-fail packets.
pub const SA_INIT4W_LF: u16 = 0x0002;
pub const SA_INIT4W_GO: u16 = SA_GO;

/// Port capabilities, advertised in step 1.
#[derive(Debug, Default, Copy, Clone, PartialEq, Eq)]
pub struct Features(u16);

impl Features {
    pub const ADDR_22BIT: Features = Features(0x01);
    pub const MAP: Features = Features(0x02);
    pub const VEC: Features = Features(0x04);
    pub const PURGE: Features = Features(0x08);
    pub const ENH_DIAG: Features = Features(0x10);
    pub const ODD_HOST: Features = Features(0x20);

    pub const BASE: Features = Features(Self::VEC.0 | Self::ENH_DIAG.0);

    pub fn contains(self, other: Features) -> bool {
        self.0 & other.0 == other.0
    }

    pub fn bits(self) -> u16 {
        self.0
    }

    /// The step 1 value advertising these features.
    pub fn step1_value(self) -> u16 {
        let mut sa = SA_INIT1_STEP;
        if self.contains(Self::ADDR_22BIT) {
            sa |= SA_INIT1R_QB;
        }
        if self.contains(Self::MAP) {
            sa |= SA_INIT1R_MP;
        }
        if !self.contains(Self::VEC) {
            sa |= SA_INIT1R_NV;
        }
        if self.contains(Self::ENH_DIAG) {
            sa |= SA_INIT1R_DI;
        }
        if self.contains(Self::ODD_HOST) {
            sa |= SA_INIT1R_OD;
        }
        sa
    }
}

impl std::ops::BitOr for Features {
    type Output = Features;

    fn bitor(self, rhs: Features) -> Features {
        Features(self.0 | rhs.0)
    }
}

impl std::ops::BitOrAssign for Features {
    fn bitor_assign(&mut self, rhs: Features) {
        self.0 |= rhs.0;
    }
}
