use std::io::{self, Read};

/// Read little-endian integers directly from a stream.
pub trait ReadLE: Read {
    fn read_u8(&mut self) -> io::Result<u8>;
    fn read_le_u16(&mut self) -> io::Result<u16>;
    fn read_le_u32(&mut self) -> io::Result<u32>;
}

/// Everything that implements Read can also implement ReadLE.
impl<T: Read> ReadLE for T {
    fn read_u8(&mut self) -> io::Result<u8> {
        let mut buf = [0; 1];
        self.read_exact(&mut buf)?;
        Ok(buf[0])
    }

    fn read_le_u16(&mut self) -> io::Result<u16> {
        let mut buf = [0; 2];
        self.read_exact(&mut buf)?;
        Ok(u16::from_le_bytes(buf))
    }

    fn read_le_u32(&mut self) -> io::Result<u32> {
        let mut buf = [0; 4];
        self.read_exact(&mut buf)?;
        Ok(u32::from_le_bytes(buf))
    }
}

/// Unpack a little-endian byte buffer into 16-bit bus words. A trailing odd
/// byte is zero-extended.
pub fn bytes_to_words(bytes: &[u8]) -> Vec<u16> {
    bytes
        .chunks(2)
        .map(|pair| pair[0] as u16 | (*pair.get(1).unwrap_or(&0) as u16) << 8)
        .collect()
}
