pub mod backend;
pub mod error;
pub mod lesi;
pub mod mscp;
pub mod sim;

use log::info;

use crate::backend::StorageBackend;
use crate::error::DriveError;
use crate::lesi::{LesiPins, Timing};
use crate::mscp::hostif::{Port, PortConfig, DEFAULT_BURST};
use crate::mscp::opcode::{CLASS_MASS_STORAGE, MODEL_UDA50, PORT_MODEL_RC25};
use crate::mscp::packet::MscpId;
use crate::mscp::server::{ControllerInfo, Server};

/// Everything that can be tuned about a drive.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Config {
    pub timing: Timing,
    pub units: usize,
    pub class: u8,
    pub model: u8,
    pub uid_high: u16,
    pub uid_low: u32,
    pub hw_version: u8,
    pub fw_version: u8,
    /// Port model reported to the host during initialization.
    pub port_model: u8,
    pub port_type: u8,
    /// NPR burst used when the host leaves it to us, in longwords.
    pub default_burst: u16,
    /// Controller flags the host is allowed to set.
    pub flag_mask: u16,
}

impl Default for Config {
    fn default() -> Self {
        Config {
            timing: Timing::default(),
            units: 2,
            class: CLASS_MASS_STORAGE,
            model: MODEL_UDA50,
            uid_high: 0x42,
            uid_low: 0x1337_1337,
            hw_version: 1,
            fw_version: 1,
            port_model: PORT_MODEL_RC25,
            port_type: 0,
            default_burst: DEFAULT_BURST,
            flag_mask: 0,
        }
    }
}

impl Config {
    pub fn port_config(&self) -> PortConfig {
        PortConfig {
            model: self.port_model,
            fw_version: self.fw_version,
            port_type: self.port_type,
            default_burst: self.default_burst,
        }
    }

    pub fn controller_info(&self) -> ControllerInfo {
        ControllerInfo {
            id: MscpId {
                uid_low: self.uid_low,
                uid_high: self.uid_high,
                model: self.model,
                class: self.class,
            },
            hw_version: self.hw_version,
            fw_version: self.fw_version,
            flag_mask: self.flag_mask,
        }
    }
}

/// A complete storage controller: the MSCP port on a KLESI, and the server
/// with its units behind it.
pub struct Drive<P: LesiPins, B: StorageBackend> {
    port: Port<P>,
    server: Server<B>,
}

impl<P: LesiPins, B: StorageBackend> Drive<P, B> {
    pub fn new(pins: P, config: &Config, backends: Vec<B>) -> Self {
        Drive {
            port: Port::new(pins, config.timing.clone(), config.port_config()),
            server: Server::new(config.controller_info(), config.units, backends),
        }
    }

    pub fn port(&self) -> &Port<P> {
        &self.port
    }

    pub fn server(&self) -> &Server<B> {
        &self.server
    }

    /// Power up and check the adapter, then start the backends.
    pub fn start(&mut self) -> Result<(), DriveError> {
        self.port.klesi().lowlevel().set_power_good(true);
        self.port.klesi().selftest()?;
        self.server.start_backends()?;
        self.server.pump_backends();
        info!("Drive started with {} units", self.server.units().len());
        Ok(())
    }

    pub fn stop(&mut self) {
        self.server.stop_backends();
        info!("Drive stopped");
    }

    /// One turn of the main loop.
    pub fn poll(&mut self) {
        self.port.poll(&mut self.server);
        self.server.dispatch();
        self.server.flush_responses(&mut self.port);
        if self.server.process_units(&mut self.port).is_err() {
            // Only a reset gets this far.
            info!("Host reset during unit I/O");
            self.port.reinit();
        }
        self.server.pump_backends();
    }
}

/// Initialise logging for tests.
#[cfg(test)]
pub fn init_test_logging() {
    // The logger can only be initialised once, but we don't know the order of
    // tests. Therefore we ignore the result.
    let _ = simplelog::TestLogger::init(
        simplelog::LevelFilter::Debug,
        simplelog::Config::default(),
    );
}
