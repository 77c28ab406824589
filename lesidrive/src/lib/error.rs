use std::error::Error;
use std::fmt;

use crate::backend::BackendError;

/// Everything that can go wrong on the LESI bus or the host bus behind it.
#[derive(Debug, Copy, Clone, PartialEq, Eq)]
pub enum LesiError {
    /// The host asserted INIT. Always leads back to port initialization.
    Reset,
    HostBusParity,
    AdapterBusParity,
    NonExistentMemory,
    Mismatch,
    Busy,
    BusArbitrationTimeout,
    DataTransferTimeout,
}
pub type LesiResult<T> = Result<T, LesiError>;

impl fmt::Display for LesiError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let msg = match self {
            LesiError::Reset => "host bus reset",
            LesiError::HostBusParity => "host bus parity error",
            LesiError::AdapterBusParity => "LESI bus parity error",
            LesiError::NonExistentMemory => "non-existent host memory",
            LesiError::Mismatch => "adapter mismatch",
            LesiError::Busy => "resource busy",
            LesiError::BusArbitrationTimeout => "bus arbitration timeout",
            LesiError::DataTransferTimeout => "data transfer timeout",
        };
        f.write_str(msg)
    }
}

impl Error for LesiError {}

/// The phase of the ring pipeline an error came from. Only used for
/// diagnostics; recovery never depends on it.
#[derive(Debug, Copy, Clone, PartialEq, Eq)]
pub enum When {
    DataRead,
    KlesiCmd,
    CtrlRead,
    IntrReq,
    DataWrite,
    CtrlWrite,
    SaOp,
}

impl When {
    /// The diagnostic tag as reported by the firmware.
    pub fn tag(self) -> u16 {
        match self {
            When::DataRead => 0x000,
            When::KlesiCmd => 0x100,
            When::CtrlRead => 0x200,
            When::IntrReq => 0x300,
            When::DataWrite => 0x400,
            When::CtrlWrite => 0x600,
            When::SaOp => 0x700,
        }
    }
}

/// Fatal port error codes, reported to the host through the SA register.
#[derive(Debug, Copy, Clone, PartialEq, Eq)]
pub enum FatalCode {
    EnvelopeRead = 1,
    EnvelopeWrite = 2,
    ControllerMemoryParity = 3,
    ControllerRamParity = 4,
    ControllerRomParity = 5,
    RingRead = 6,
    RingWrite = 7,
    InterruptMaster = 8,
    HostTimeout = 9,
    CreditExceeded = 10,
    BusMasterError = 11,
    DiagnosticFatal = 12,
    InterruptWrite = 13,
}

impl FatalCode {
    pub fn code(self) -> u16 {
        self as u16
    }
}

/// An error raised inside the port's ring machinery.
#[derive(Debug, Copy, Clone, PartialEq, Eq)]
pub struct PortError {
    pub error: LesiError,
    pub when: When,
    /// Set when the error must latch the port in its fatal state.
    pub fatal: Option<FatalCode>,
}
pub type PortResult<T> = Result<T, PortError>;

impl PortError {
    pub fn new(error: LesiError, when: When) -> Self {
        PortError { error, when, fatal: None }
    }

    pub fn is_reset(&self) -> bool {
        self.error == LesiError::Reset
    }
}

impl fmt::Display for PortError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{} (when {:#05X})", self.error, self.when.tag())?;
        if let Some(code) = self.fatal {
            write!(f, ", fatal code {}", code.code())?;
        }
        Ok(())
    }
}

impl Error for PortError {}

/// Attach a pipeline phase to a plain bus result.
pub trait Tagged<T> {
    fn when(self, when: When) -> PortResult<T>;
}

impl<T> Tagged<T> for LesiResult<T> {
    fn when(self, when: When) -> PortResult<T> {
        self.map_err(|e| PortError::new(e, when))
    }
}

/// Classify a host transfer failure inside a ring pipeline. Non-existent
/// memory means the host gave us a bad ring; parity means the data can't be
/// trusted. Both latch the port. Resets and everything else pass through.
pub fn ring_transfer<T>(result: LesiResult<T>, fcode: FatalCode, when: When) -> PortResult<T> {
    result.map_err(|error| {
        let fatal = match error {
            LesiError::NonExistentMemory => Some(FatalCode::BusMasterError),
            LesiError::HostBusParity | LesiError::AdapterBusParity => Some(fcode),
            _ => None,
        };
        PortError { error, when, fatal }
    })
}

/// Why a drive could not be brought up.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum DriveError {
    Adapter(LesiError),
    Backend(BackendError),
}

impl fmt::Display for DriveError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            DriveError::Adapter(e) => write!(f, "adapter: {}", e),
            DriveError::Backend(e) => write!(f, "storage: {}", e),
        }
    }
}

impl Error for DriveError {}

impl From<LesiError> for DriveError {
    fn from(e: LesiError) -> Self {
        DriveError::Adapter(e)
    }
}

impl From<BackendError> for DriveError {
    fn from(e: BackendError) -> Self {
        DriveError::Backend(e)
    }
}
