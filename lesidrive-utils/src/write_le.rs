use std::io::{self, Write};

/// Write little-endian integers directly to a stream.
pub trait WriteLE: Write {
    fn write_u8(&mut self, val: u8) -> io::Result<()>;
    fn write_le_u16(&mut self, val: u16) -> io::Result<()>;
    fn write_le_u32(&mut self, val: u32) -> io::Result<()>;
}

/// Everything that implements Write can also implement WriteLE.
impl<T: Write> WriteLE for T {
    fn write_u8(&mut self, val: u8) -> io::Result<()> {
        self.write_all(&[val])
    }

    fn write_le_u16(&mut self, val: u16) -> io::Result<()> {
        self.write_all(&val.to_le_bytes())
    }

    fn write_le_u32(&mut self, val: u32) -> io::Result<()> {
        self.write_all(&val.to_le_bytes())
    }
}

/// Pack 16-bit bus words into a little-endian byte buffer.
pub fn words_to_bytes(words: &[u16]) -> Vec<u8> {
    words.iter().flat_map(|w| w.to_le_bytes()).collect()
}
