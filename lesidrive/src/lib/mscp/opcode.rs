//! MSCP opcodes, status codes and identity constants.

pub const OP_ABORT: u8 = 1;
pub const OP_GTCMD: u8 = 2;
pub const OP_GTUNT: u8 = 3;
pub const OP_STCON: u8 = 4;
pub const OP_AVAIL: u8 = 8;
pub const OP_ONLIN: u8 = 9;
pub const OP_STUNT: u8 = 10;
pub const OP_ACCES: u8 = 16;
pub const OP_CMPCD: u8 = 17;
pub const OP_ERASE: u8 = 18;
pub const OP_FLUSH: u8 = 19;
pub const OP_COMP: u8 = 32;
pub const OP_READ: u8 = 33;
pub const OP_WRITE: u8 = 34;
/// Or'ed into the opcode to form an end code.
pub const OP_END: u8 = 0x80;

pub const ST_SUCC: u16 = 0;
pub const ST_ICMD: u16 = 1;
pub const ST_ABRTD: u16 = 2;
pub const ST_OFFLN: u16 = 3;
pub const ST_AVLBL: u16 = 4;
pub const ST_WRTPR: u16 = 6;
pub const ST_COMP: u16 = 7;
pub const ST_DATA: u16 = 8;
pub const ST_HSTBF: u16 = 9;
pub const ST_SUBCODE_SHIFT: u16 = 5;

/// Write protect subcodes.
pub const SC_HARDWARE: u16 = 8;
pub const SC_SOFTWARE: u16 = 4;
/// Invalid command subcode: byte offset of the logical block number.
pub const SC_LBA_OFFSET: u16 = 28;

/// Unit flags.
pub const UF_WRTPH: u16 = 0x2000;
pub const UF_WRTPS: u16 = 0x1000;

/// Controller and unit identity.
pub const CLASS_MASS_STORAGE: u8 = 1;
pub const CLASS_DISK: u8 = 2;
pub const MODEL_UDA50: u8 = 2;
pub const MEDIA_ID: u32 = 0x254B_3294;

/// Port models reported in SA during step 4.
pub const PORT_MODEL_RC25: u8 = 3;

pub fn status_with_subcode(status: u16, subcode: u16) -> u16 {
    status | (subcode << ST_SUBCODE_SHIFT)
}

pub fn opcode_name(opcode: u8) -> &'static str {
    match opcode {
        OP_ABORT => "ABORT",
        OP_GTCMD => "GET COMMAND STATUS",
        OP_GTUNT => "GET UNIT STATUS",
        OP_STCON => "SET CONTROLLER CHARACTERISTICS",
        OP_AVAIL => "AVAILABLE",
        OP_ONLIN => "ONLINE",
        OP_STUNT => "SET UNIT CHARACTERISTICS",
        OP_ACCES => "ACCESS",
        OP_CMPCD => "COMPARE CONTROLLER DATA",
        OP_ERASE => "ERASE",
        OP_FLUSH => "FLUSH",
        OP_COMP => "COMPARE HOST DATA",
        OP_READ => "READ",
        OP_WRITE => "WRITE",
        _ => "unknown",
    }
}
