use std::io;

use log::{debug, info};

use super::Server;
use crate::backend::StorageBackend;
use crate::mscp::opcode::ST_SUCC;
use crate::mscp::packet::{Command, ControllerParams, End, EndBody, END_SIZE_GENERIC};

/// Host timeout we ask for, in seconds.
const CONTROLLER_TIMEOUT: u16 = 30;

impl<B: StorageBackend> Server<B> {
    /// SET CONTROLLER CHARACTERISTICS.
    pub(super) fn set_controller_chars(
        &mut self,
        cmd: &Command,
        data: &[u8],
    ) -> io::Result<(End, usize)> {
        let params = ControllerParams::parse(data)?;
        info!(
            "Set controller characteristics: MSCP version {}, flags {:04X}, host timeout {} s",
            params.version, params.cntflgs, params.hsttmo
        );
        debug!("Wallclock time {} clunks", params.time);
        self.flags = params.cntflgs & self.info.flag_mask;

        let mut end = End::for_command(cmd, ST_SUCC);
        end.body = EndBody::Controller {
            version: 0,
            cntflgs: self.flags,
            timeout: CONTROLLER_TIMEOUT,
            fw_version: self.info.fw_version,
            hw_version: self.info.hw_version,
            id: self.info.id,
        };
        Ok((end, END_SIZE_GENERIC))
    }
}
