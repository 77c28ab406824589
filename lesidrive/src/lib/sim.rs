//! A simulated KLESI adapter and host, standing in for the pins and the
//! machine on the far side of the LESI cable.

mod host;
mod memory;
mod model;

pub use host::{HostConfig, HostDriver, HostResponse};
pub use memory::HostMemory;
pub use model::{Interrupt, SaReply, SimulatedKlesi, DEFAULT_WATCHDOG};
