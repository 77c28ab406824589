//! Layout of the communication area the host sets up in its memory: a
//! small header, the response ring, then the command ring. Each ring slot
//! is a descriptor pointing just past a message envelope.

/// Bytes of header below the response ring.
pub const CAHDR_SIZE: u32 = 8;
/// Offset in the header of the command ring transition word.
pub const CAHDR_CMD_INTR: u32 = 4;
/// Offset in the header of the response ring transition word.
pub const CAHDR_RSP_INTR: u32 = 6;

pub const DESC_SIZE: u32 = 4;
pub const ENVELOPE_SIZE: u32 = 4;

pub const MSG_TYPE_SEQ: u8 = 0;
pub const MSG_TYPE_DGRAM: u8 = 1;
pub const MSG_TYPE_CREDIT: u8 = 2;
pub const MSG_TYPE_MAINT: u8 = 15;

pub const ADDR_MASK_18: u32 = 0x3_FFFF;
pub const ADDR_MASK_22: u32 = 0x3F_FFFF;

/// Bodies shorter than this many words are still transferred in full.
const MIN_BODY_WORDS: usize = 30;

/// A ring slot.
#[derive(Debug, Default, Copy, Clone, PartialEq, Eq)]
pub struct Descriptor(pub u32);

impl Descriptor {
    /// The port owns the slot.
    pub const OWNER: u32 = 1 << 31;
    /// The host wants to hear about the slot changing hands.
    pub const FLAG: u32 = 1 << 30;

    pub fn from_words(words: [u16; 2]) -> Self {
        Descriptor(words[0] as u32 | (words[1] as u32) << 16)
    }

    pub fn to_words(self) -> [u16; 2] {
        [self.0 as u16, (self.0 >> 16) as u16]
    }

    pub fn owner(self) -> bool {
        self.0 & Self::OWNER != 0
    }

    pub fn flag(self) -> bool {
        self.0 & Self::FLAG != 0
    }

    /// Host address of the message body.
    pub fn address(self, mask: u32) -> u32 {
        self.0 & mask
    }

    /// Host address of the envelope in front of the body. A body address
    /// below the envelope size wraps within the address space.
    pub fn envelope_address(self, mask: u32) -> u32 {
        self.address(mask).wrapping_sub(ENVELOPE_SIZE) & mask
    }

    /// The descriptor as written back when the port hands the slot back.
    pub fn released(self) -> Self {
        Descriptor((self.0 | Self::FLAG) & !Self::OWNER)
    }
}

/// The header in front of every message body.
#[derive(Debug, Default, Copy, Clone, PartialEq, Eq)]
pub struct Envelope {
    pub msg_len: u16,
    pub msg_type: u8,
    pub credit: u8,
    pub conn_id: u8,
}

impl Envelope {
    pub fn from_bytes(b: [u8; 4]) -> Self {
        Envelope {
            msg_len: u16::from_le_bytes([b[0], b[1]]),
            msg_type: b[2] >> 4,
            credit: b[2] & 0xF,
            conn_id: b[3],
        }
    }

    pub fn to_bytes(self) -> [u8; 4] {
        let [lo, hi] = self.msg_len.to_le_bytes();
        [lo, hi, (self.msg_type << 4) | (self.credit & 0xF), self.conn_id]
    }

    pub fn from_words(words: [u16; 2]) -> Self {
        let [a, b] = words[0].to_le_bytes();
        let [c, d] = words[1].to_le_bytes();
        Self::from_bytes([a, b, c, d])
    }

    pub fn to_words(self) -> [u16; 2] {
        let b = self.to_bytes();
        [u16::from_le_bytes([b[0], b[1]]), u16::from_le_bytes([b[2], b[3]])]
    }

    /// Bytes of body to transfer for a message of this length.
    pub fn body_len(self) -> usize {
        let words = (self.msg_len as usize + 1) / 2;
        words.max(MIN_BODY_WORDS) * 2
    }
}

/// Ring sizes are powers of two.
pub fn next_index(idx: u32, size: u32) -> u32 {
    (idx + 1) & (size - 1)
}

pub fn prev_index(idx: u32, size: u32) -> u32 {
    idx.wrapping_sub(1) & (size - 1)
}
