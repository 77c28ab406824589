//! MSCP over the KLESI: the port that moves messages between the host's
//! rings and the controller, and the server that executes them.

pub mod hostif;
pub mod opcode;
pub mod packet;
pub mod server;

use std::fmt;

use crate::error::{LesiError, LesiResult};
use hostif::commarea::Envelope;

/// A message body together with its envelope fields, as moved between the
/// rings and the server.
#[derive(Debug, Default, Clone, PartialEq, Eq)]
pub struct Packet {
    pub msg_len: u16,
    pub msg_type: u8,
    pub credit: u8,
    pub conn_id: u8,
    pub data: Vec<u8>,
}

impl Packet {
    pub fn new(envelope: Envelope, data: Vec<u8>) -> Self {
        Packet {
            msg_len: envelope.msg_len,
            msg_type: envelope.msg_type,
            credit: envelope.credit,
            conn_id: envelope.conn_id,
            data,
        }
    }

    pub fn envelope(&self) -> Envelope {
        Envelope {
            msg_len: self.msg_len,
            msg_type: self.msg_type,
            credit: self.credit,
            conn_id: self.conn_id,
        }
    }
}

/// A response the port could not take, handed back to the caller.
#[derive(Debug, PartialEq, Eq)]
pub struct Rejected {
    pub error: LesiError,
    pub packet: Packet,
}

impl fmt::Display for Rejected {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "response rejected: {}", self.error)
    }
}

impl std::error::Error for Rejected {}

/// What the server needs from the port: data buffer access in host memory
/// and a way to send responses.
pub trait HostPort {
    fn read_host(&mut self, addr: u32, buf: &mut [u16]) -> LesiResult<()>;
    fn write_host(&mut self, addr: u32, buf: &[u16]) -> LesiResult<()>;
    fn submit_response(&mut self, packet: Packet) -> Result<(), Rejected>;
}

/// Where the port delivers the commands it takes off the ring.
pub trait CommandSink {
    fn enqueue_command(&mut self, packet: Packet);
    /// The host reinitialized the port; everything outstanding is void.
    fn reinit(&mut self);
}
