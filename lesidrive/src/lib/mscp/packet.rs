//! Field layouts of MSCP command and end packets. All fields are little
//! endian.

use std::io::{self, Cursor, Seek, SeekFrom};

use lesidrive_utils::read_le::ReadLE;
use lesidrive_utils::write_le::WriteLE;

use super::opcode::OP_END;

/// Length of a command packet as built by a host.
pub const COMMAND_SIZE: usize = 48;
pub const END_SIZE_GENERIC: usize = 32;
pub const END_SIZE_UNIT: usize = 44;
pub const END_SIZE_ABORT: usize = 16;

// Offsets shared by commands and end packets.
const CMDREF: u64 = 0;
const UNIT: u64 = 4;
const SEQN: u64 = 6;
const OPCODE: u64 = 8;
const FLAGS: u64 = 9;
const MODIFIER: u64 = 10;
const STATUS: u64 = 10;

// Transfer commands and their end packets.
const BYTECNT: u64 = 12;
const BUFFER: u64 = 16;
const LBA: u64 = 28;

// Set controller characteristics.
const SC_VERSION: u64 = 12;
const SC_CNTFLGS: u64 = 14;
const SC_HSTTMO: u64 = 16;
const SC_TIME: u64 = 20;
const SC_END_TIMEOUT: u64 = 16;
const SC_END_CSVRSN: u64 = 18;
const SC_END_CHVRSN: u64 = 19;
const SC_END_ID: u64 = 20;

// Online and set unit characteristics.
const ONL_UNITFLGS: u64 = 14;
const ONL_DDP: u64 = 28;
const ONL_END_MULTIUNIT: u64 = 12;
const ONL_END_SPINDLES: u64 = 16;
const ONL_END_UNITID: u64 = 20;
const ONL_END_MEDIA: u64 = 28;
const ONL_END_SIZE: u64 = 36;
const ONL_END_VSN: u64 = 40;

// Abort.
const ABO_ORN: u64 = 12;

fn reader_at(data: &[u8], offset: u64) -> Cursor<&[u8]> {
    let mut c = Cursor::new(data);
    c.set_position(offset);
    c
}

fn writer_at(buf: &mut [u8], offset: u64) -> io::Result<Cursor<&mut [u8]>> {
    let mut c = Cursor::new(buf);
    c.seek(SeekFrom::Start(offset))?;
    Ok(c)
}

/// Controller or unit identifier.
#[derive(Debug, Default, Copy, Clone, PartialEq, Eq)]
pub struct MscpId {
    pub uid_low: u32,
    pub uid_high: u16,
    pub model: u8,
    pub class: u8,
}

impl MscpId {
    fn write_at(&self, buf: &mut [u8], offset: u64) -> io::Result<()> {
        let mut c = writer_at(buf, offset)?;
        c.write_le_u32(self.uid_low)?;
        c.write_le_u16(self.uid_high)?;
        c.write_u8(self.model)?;
        c.write_u8(self.class)
    }

    fn read_at(data: &[u8], offset: u64) -> io::Result<Self> {
        let mut c = reader_at(data, offset);
        Ok(MscpId {
            uid_low: c.read_le_u32()?,
            uid_high: c.read_le_u16()?,
            model: c.read_u8()?,
            class: c.read_u8()?,
        })
    }
}

/// The fixed header of a command.
#[derive(Debug, Copy, Clone, PartialEq, Eq)]
pub struct Command {
    pub cmdref: u32,
    pub unit: u16,
    pub opcode: u8,
    pub flags: u8,
    pub modifier: u16,
}

impl Command {
    pub fn parse(data: &[u8]) -> io::Result<Self> {
        let mut c = reader_at(data, CMDREF);
        let cmdref = c.read_le_u32()?;
        c.set_position(UNIT);
        let unit = c.read_le_u16()?;
        c.set_position(OPCODE);
        Ok(Command {
            cmdref,
            unit,
            opcode: c.read_u8()?,
            flags: c.read_u8()?,
            modifier: c.read_le_u16()?,
        })
    }

    /// Encode into a zeroed command packet.
    pub fn encode(&self) -> io::Result<Vec<u8>> {
        let mut buf = vec![0; COMMAND_SIZE];
        let mut c = writer_at(&mut buf, CMDREF)?;
        c.write_le_u32(self.cmdref)?;
        c.write_le_u16(self.unit)?;
        c.seek(SeekFrom::Start(OPCODE))?;
        c.write_u8(self.opcode)?;
        c.write_u8(self.flags)?;
        c.write_le_u16(self.modifier)?;
        Ok(buf)
    }
}

/// READ, WRITE, COMPARE, ERASE and ACCESS parameters.
#[derive(Debug, Default, Copy, Clone, PartialEq, Eq)]
pub struct Transfer {
    pub bytecnt: u32,
    /// Buffer descriptor: the host address of the data.
    pub buffer: u32,
    pub lba: u32,
}

impl Transfer {
    pub fn parse(data: &[u8]) -> io::Result<Self> {
        let mut c = reader_at(data, BYTECNT);
        let bytecnt = c.read_le_u32()?;
        let buffer = c.read_le_u32()?;
        c.set_position(LBA);
        Ok(Transfer {
            bytecnt,
            buffer,
            lba: c.read_le_u32()?,
        })
    }

    pub fn write_to(&self, buf: &mut [u8]) -> io::Result<()> {
        let mut c = writer_at(buf, BYTECNT)?;
        c.write_le_u32(self.bytecnt)?;
        c.write_le_u32(self.buffer)?;
        c.seek(SeekFrom::Start(LBA))?;
        c.write_le_u32(self.lba)
    }
}

/// SET CONTROLLER CHARACTERISTICS parameters.
#[derive(Debug, Default, Copy, Clone, PartialEq, Eq)]
pub struct ControllerParams {
    pub version: u16,
    pub cntflgs: u16,
    pub hsttmo: u16,
    pub time: u64,
}

impl ControllerParams {
    pub fn parse(data: &[u8]) -> io::Result<Self> {
        let mut c = reader_at(data, SC_VERSION);
        let version = c.read_le_u16()?;
        let cntflgs = c.read_le_u16()?;
        let hsttmo = c.read_le_u16()?;
        c.set_position(SC_TIME);
        let low = c.read_le_u32()? as u64;
        let high = c.read_le_u32()? as u64;
        Ok(ControllerParams {
            version,
            cntflgs,
            hsttmo,
            time: high << 32 | low,
        })
    }

    pub fn write_to(&self, buf: &mut [u8]) -> io::Result<()> {
        let mut c = writer_at(buf, SC_VERSION)?;
        c.write_le_u16(self.version)?;
        c.write_le_u16(self.cntflgs)?;
        c.write_le_u16(self.hsttmo)?;
        c.seek(SeekFrom::Start(SC_TIME))?;
        c.write_le_u32(self.time as u32)?;
        c.write_le_u32((self.time >> 32) as u32)
    }
}

/// ONLINE and SET UNIT CHARACTERISTICS parameters.
#[derive(Debug, Default, Copy, Clone, PartialEq, Eq)]
pub struct OnlineParams {
    pub unitflgs: u16,
    pub ddp: u32,
}

impl OnlineParams {
    pub fn parse(data: &[u8]) -> io::Result<Self> {
        let unitflgs = reader_at(data, ONL_UNITFLGS).read_le_u16()?;
        let ddp = reader_at(data, ONL_DDP).read_le_u32()?;
        Ok(OnlineParams { unitflgs, ddp })
    }

    pub fn write_to(&self, buf: &mut [u8]) -> io::Result<()> {
        writer_at(buf, ONL_UNITFLGS)?.write_le_u16(self.unitflgs)?;
        writer_at(buf, ONL_DDP)?.write_le_u32(self.ddp)
    }
}

/// The outstanding reference number of an ABORT.
pub fn parse_abort(data: &[u8]) -> io::Result<u32> {
    reader_at(data, ABO_ORN).read_le_u32()
}

pub fn write_abort(buf: &mut [u8], orn: u32) -> io::Result<()> {
    writer_at(buf, ABO_ORN)?.write_le_u32(orn)
}

/// Command specific part of an end packet.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum EndBody {
    None,
    Transfer {
        bytecnt: u32,
        buffer: u32,
        first_bad: u32,
    },
    Controller {
        version: u16,
        cntflgs: u16,
        timeout: u16,
        fw_version: u8,
        hw_version: u8,
        id: MscpId,
    },
    Unit {
        multiunit: u16,
        unitflgs: u16,
        spindles: u8,
        unit_id: MscpId,
        media: u32,
        size: u32,
        vsn: u32,
    },
    Abort {
        orn: u32,
    },
}

/// An end packet, the reply to a command.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct End {
    pub cmdref: u32,
    pub unit: u16,
    pub seqn: u16,
    pub endcode: u8,
    pub flags: u8,
    pub status: u16,
    pub body: EndBody,
}

impl End {
    /// An end packet for `cmd` carrying `status`.
    pub fn for_command(cmd: &Command, status: u16) -> Self {
        End {
            cmdref: cmd.cmdref,
            unit: cmd.unit,
            seqn: 0,
            endcode: cmd.opcode | OP_END,
            flags: 0,
            status,
            body: EndBody::None,
        }
    }

    /// Encode into a zeroed buffer of `size` bytes.
    pub fn encode(&self, size: usize) -> io::Result<Vec<u8>> {
        let mut buf = vec![0; size];
        let mut c = writer_at(&mut buf, CMDREF)?;
        c.write_le_u32(self.cmdref)?;
        c.write_le_u16(self.unit)?;
        c.write_le_u16(self.seqn)?;
        c.write_u8(self.endcode)?;
        c.write_u8(self.flags)?;
        c.write_le_u16(self.status)?;

        match &self.body {
            EndBody::None => {}
            EndBody::Transfer {
                bytecnt,
                buffer,
                first_bad,
            } => {
                c.write_le_u32(*bytecnt)?;
                c.write_le_u32(*buffer)?;
                c.seek(SeekFrom::Start(LBA))?;
                c.write_le_u32(*first_bad)?;
            }
            EndBody::Controller {
                version,
                cntflgs,
                timeout,
                fw_version,
                hw_version,
                id,
            } => {
                c.write_le_u16(*version)?;
                c.write_le_u16(*cntflgs)?;
                c.write_le_u16(*timeout)?;
                c.write_u8(*fw_version)?;
                c.write_u8(*hw_version)?;
                id.write_at(&mut buf, SC_END_ID)?;
            }
            EndBody::Unit {
                multiunit,
                unitflgs,
                spindles,
                unit_id,
                media,
                size,
                vsn,
            } => {
                c.write_le_u16(*multiunit)?;
                c.write_le_u16(*unitflgs)?;
                c.write_u8(*spindles)?;
                c.seek(SeekFrom::Start(ONL_END_MEDIA))?;
                c.write_le_u32(*media)?;
                c.seek(SeekFrom::Start(ONL_END_SIZE))?;
                c.write_le_u32(*size)?;
                c.write_le_u32(*vsn)?;
                unit_id.write_at(&mut buf, ONL_END_UNITID)?;
            }
            EndBody::Abort { orn } => c.write_le_u32(*orn)?,
        }
        Ok(buf)
    }
}

/// The fields every end packet has, as seen by a host.
#[derive(Debug, Copy, Clone, PartialEq, Eq)]
pub struct EndHeader {
    pub cmdref: u32,
    pub unit: u16,
    pub endcode: u8,
    pub flags: u8,
    pub status: u16,
}

impl EndHeader {
    pub fn parse(data: &[u8]) -> io::Result<Self> {
        let mut c = reader_at(data, CMDREF);
        let cmdref = c.read_le_u32()?;
        let unit = c.read_le_u16()?;
        c.set_position(OPCODE);
        Ok(EndHeader {
            cmdref,
            unit,
            endcode: c.read_u8()?,
            flags: c.read_u8()?,
            status: c.read_le_u16()?,
        })
    }
}

/// Byte count of a transfer end packet.
pub fn end_bytecnt(data: &[u8]) -> io::Result<u32> {
    reader_at(data, BYTECNT).read_le_u32()
}

/// First bad block of a transfer end packet.
pub fn end_first_bad(data: &[u8]) -> io::Result<u32> {
    reader_at(data, LBA).read_le_u32()
}

/// Unit flags and size reported in an online end packet.
pub fn end_unit_info(data: &[u8]) -> io::Result<(u16, u32)> {
    let flags = reader_at(data, ONL_UNITFLGS).read_le_u16()?;
    let size = reader_at(data, ONL_END_SIZE).read_le_u32()?;
    Ok((flags, size))
}

/// Controller timeout and identifier reported in a set controller
/// characteristics end packet.
pub fn end_controller_info(data: &[u8]) -> io::Result<(u16, MscpId)> {
    let timeout = reader_at(data, SC_END_TIMEOUT).read_le_u16()?;
    let id = MscpId::read_at(data, SC_END_ID)?;
    Ok((timeout, id))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::mscp::opcode::*;

    #[test]
    fn test_command_header_offsets() {
        let cmd = Command {
            cmdref: 0x0102_0304,
            unit: 1,
            opcode: OP_READ,
            flags: 0x40,
            modifier: 0x1234,
        };
        let mut buf = cmd.encode().unwrap();
        assert_eq!(buf.len(), COMMAND_SIZE);
        assert_eq!(&buf[..12], &[4, 3, 2, 1, 1, 0, 0, 0, 33, 0x40, 0x34, 0x12]);

        Transfer {
            bytecnt: 1024,
            buffer: 0x2000,
            lba: 7,
        }
        .write_to(&mut buf)
        .unwrap();
        assert_eq!(&buf[12..20], &[0, 4, 0, 0, 0, 0x20, 0, 0]);
        assert_eq!(&buf[28..32], &[7, 0, 0, 0]);
        assert_eq!(Command::parse(&buf).unwrap(), cmd);
    }

    #[test]
    fn test_short_packet_is_an_error() {
        assert!(Command::parse(&[0; 10]).is_err());
        assert!(Transfer::parse(&[0; 30]).is_err());
    }

    #[test]
    fn test_controller_end_layout() {
        let end = End {
            cmdref: 9,
            unit: 0,
            seqn: 0,
            endcode: OP_STCON | OP_END,
            flags: 0,
            status: ST_SUCC,
            body: EndBody::Controller {
                version: 0,
                cntflgs: 0,
                timeout: 30,
                fw_version: 1,
                hw_version: 2,
                id: MscpId {
                    uid_low: 0x1337_1337,
                    uid_high: 0x42,
                    model: MODEL_UDA50,
                    class: CLASS_MASS_STORAGE,
                },
            },
        };
        let buf = end.encode(END_SIZE_GENERIC).unwrap();
        assert_eq!(buf[8], 0x84);
        assert_eq!(&buf[16..20], &[30, 0, 1, 2]);
        assert_eq!(&buf[20..28], &[0x37, 0x13, 0x37, 0x13, 0x42, 0, 2, 1]);
        let (timeout, id) = end_controller_info(&buf).unwrap();
        assert_eq!(timeout, 30);
        assert_eq!(id.uid_high, 0x42);
    }

    #[test]
    fn test_unit_end_layout() {
        let end = End {
            cmdref: 1,
            unit: 1,
            seqn: 0,
            endcode: OP_ONLIN | OP_END,
            flags: 0,
            status: ST_SUCC,
            body: EndBody::Unit {
                multiunit: 0,
                unitflgs: UF_WRTPH,
                spindles: 1,
                unit_id: MscpId::default(),
                media: MEDIA_ID,
                size: 2048,
                vsn: 0,
            },
        };
        let buf = end.encode(END_SIZE_UNIT).unwrap();
        assert_eq!(buf.len(), 44);
        assert_eq!(buf[16], 1);
        assert_eq!(&buf[28..32], &MEDIA_ID.to_le_bytes());
        assert_eq!(end_unit_info(&buf).unwrap(), (UF_WRTPH, 2048));
        let header = EndHeader::parse(&buf).unwrap();
        assert_eq!((header.unit, header.endcode), (1, 0x89));
    }

    #[test]
    fn test_transfer_end_layout() {
        let cmd = Command {
            cmdref: 5,
            unit: 0,
            opcode: OP_WRITE,
            flags: 0,
            modifier: 0,
        };
        let mut end = End::for_command(&cmd, ST_SUCC);
        end.body = EndBody::Transfer {
            bytecnt: 512,
            buffer: 0x4000,
            first_bad: 0,
        };
        let buf = end.encode(END_SIZE_GENERIC).unwrap();
        assert_eq!(end_bytecnt(&buf).unwrap(), 512);
        assert_eq!(EndHeader::parse(&buf).unwrap().endcode, OP_WRITE | OP_END);
    }

    #[test]
    fn test_parameter_blocks() {
        let mut buf = vec![0; COMMAND_SIZE];
        let params = ControllerParams {
            version: 0,
            cntflgs: 0x8000,
            hsttmo: 60,
            time: 0x0011_2233_4455_6677,
        };
        params.write_to(&mut buf).unwrap();
        assert_eq!(ControllerParams::parse(&buf).unwrap(), params);

        let mut buf = vec![0; COMMAND_SIZE];
        OnlineParams {
            unitflgs: UF_WRTPS,
            ddp: 3,
        }
        .write_to(&mut buf)
        .unwrap();
        assert_eq!(OnlineParams::parse(&buf).unwrap().unitflgs, UF_WRTPS);

        write_abort(&mut buf, 77).unwrap();
        assert_eq!(parse_abort(&buf).unwrap(), 77);
    }

    #[test]
    fn test_end_too_small() {
        let cmd = Command {
            cmdref: 0,
            unit: 0,
            opcode: OP_ABORT,
            flags: 0,
            modifier: 0,
        };
        let mut end = End::for_command(&cmd, ST_SUCC);
        end.body = EndBody::Abort { orn: 1 };
        assert!(end.encode(8).is_err());
        assert_eq!(end.encode(END_SIZE_ABORT).unwrap().len(), 16);
    }
}
