//! NPR transfers between host memory and the KLESI scratchpad.
//!
//! A block fills the top `count` words of the scratchpad, so the word count
//! field of the command is `16 - count`, with 0 standing for a full block.
//! The adapter does not advance the host address on its own.

use log::trace;

use super::klesi::{Klesi, StickyFlags};
use super::pins::LesiPins;
use super::*;
use crate::error::LesiResult;

const ZEROS: [u16; RAM_WORDS] = [0; RAM_WORDS];

fn block_command(count: usize) -> u16 {
    let wordcnt = if count >= RAM_WORDS { 0 } else { (RAM_WORDS - count) as u16 };
    cmd_regsel(REG_RAM) | cmd_wordcnt(wordcnt)
}

impl<P: LesiPins> Klesi<P> {
    /// Words moved per NPR block.
    pub fn block_words(&self) -> usize {
        self.block_words
    }

    /// Fetch up to 16 words from the current host address.
    pub fn read_block(&mut self, buf: &mut [u16]) -> LesiResult<()> {
        debug_assert!(buf.len() <= RAM_WORDS);
        let cmd = CMD_DO_NPR | block_command(buf.len());
        self.command(cmd)?;
        self.ll.wait_ready()?;

        // Reissue without DO_NPR so the read-out doesn't start another one.
        self.command(cmd & !CMD_DO_NPR)?;

        let count = buf.len();
        for (i, word) in buf.iter_mut().enumerate() {
            *word = self.ll.read()?;
            if i + 1 < count {
                self.ll.read_strobe(false)?;
            }
        }
        Ok(())
    }

    /// Store up to 16 words at the current host address.
    pub fn write_block(&mut self, buf: &[u16]) -> LesiResult<()> {
        debug_assert!(buf.len() <= RAM_WORDS);
        let start = (RAM_WORDS - buf.len()) as u16;
        self.write_ram(start, buf)?;

        // No data cycle follows, so this starts the NPR without touching RAM.
        self.command(CMD_WRITE | CMD_DO_NPR | block_command(buf.len()))?;
        self.ll.wait_ready()?;
        self.command(0)
    }

    /// Read `buf.len()` words starting at the current host address.
    pub fn read_dma(&mut self, sticky: &mut StickyFlags, buf: &mut [u16]) -> LesiResult<()> {
        trace!("NPR read {} words at {:#o}", buf.len(), self.host_address);
        let base = self.host_address;
        let step = self.block_words;
        for (n, chunk) in buf.chunks_mut(step).enumerate() {
            if n > 0 {
                self.set_host_address(base + (n * step * 2) as u32)?;
            }
            self.read_block(chunk)?;
        }
        self.handle_status(sticky)
    }

    /// Write `buf` starting at the current host address.
    pub fn write_dma(&mut self, sticky: &mut StickyFlags, buf: &[u16]) -> LesiResult<()> {
        trace!("NPR write {} words at {:#o}", buf.len(), self.host_address);
        let base = self.host_address;
        let step = self.block_words;
        for (n, chunk) in buf.chunks(step).enumerate() {
            if n > 0 {
                self.set_host_address(base + (n * step * 2) as u32)?;
            }
            self.write_block(chunk)?;
        }
        self.handle_status(sticky)
    }

    /// Zero `count` words starting at the current host address.
    pub fn write_dma_zeros(&mut self, sticky: &mut StickyFlags, count: usize) -> LesiResult<()> {
        trace!("NPR zero {} words at {:#o}", count, self.host_address);
        let base = self.host_address;
        let step = self.block_words;
        let mut done = 0;
        while done < count {
            if done > 0 {
                self.set_host_address(base + (done * 2) as u32)?;
            }
            let n = step.min(count - done);
            self.write_block(&ZEROS[..n])?;
            done += n;
        }
        self.handle_status(sticky)
    }
}
