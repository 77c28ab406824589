use std::fmt::Write;

const BYTES_PER_LINE: usize = 16;
/// Width of the hex column of a full line: 32 digits, 12 single and 3 double
/// separators.
const HEX_COLUMN_WIDTH: usize = 50;

/// Format `buf` as a classic hex dump, one line per 16 bytes:
/// `0x00000200    00 01 02 03  04 ...  |....|`. The listed addresses start
/// at `start`.
pub fn pretty_print_hex_block(buf: &[u8], start: usize) -> String {
    let lines = (buf.len() + BYTES_PER_LINE - 1) / BYTES_PER_LINE;
    let mut out = String::with_capacity(lines * 85);
    for (n, line) in buf.chunks(BYTES_PER_LINE).enumerate() {
        if n > 0 {
            out.push('\n');
        }
        write!(out, "{:#010X}    ", start + n * BYTES_PER_LINE).unwrap();
        let mut width = 0;
        for (i, byte) in line.iter().enumerate() {
            if i > 0 {
                let sep = if i % 4 == 0 { "  " } else { " " };
                out.push_str(sep);
                width += sep.len();
            }
            write!(out, "{:02X}", byte).unwrap();
            width += 2;
        }
        for _ in width..HEX_COLUMN_WIDTH {
            out.push(' ');
        }
        out.push_str("  |");
        out.extend(line.iter().map(|&b| printable(b)));
        out.push('|');
    }
    out
}

/// Shortcut for starting the addresses at zero.
#[inline]
pub fn pretty_print_hex_block_zero(buf: &[u8]) -> String {
    pretty_print_hex_block(buf, 0)
}

fn printable(chr: u8) -> char {
    match chr {
        32..=126 => chr.into(),
        _ => '.',
    }
}
