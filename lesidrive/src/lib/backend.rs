//! Block storage behind the MSCP units.

mod image;

pub use image::ImageBackend;

// Mock implementation for testing.
#[cfg(test)]
pub mod mock;
#[cfg(test)]
pub use mock::MockBackend;

use std::error::Error;
use std::fmt;
use std::io;

/// Every medium is addressed in blocks of this many bytes.
pub const BLOCK_SIZE: usize = 512;

/// A change of medium, reported by `StorageBackend::poll_event`.
#[derive(Debug, Copy, Clone, PartialEq, Eq)]
pub enum MediaEvent {
    Inserted {
        block_count: u32,
        block_size: u16,
        read_only: bool,
    },
    Ejected,
}

#[derive(Debug, Copy, Clone, PartialEq, Eq)]
pub enum BlockOp {
    Read,
    Write,
}

/// One block transfer. `data` carries the blocks for a write and is ignored
/// for a read.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct BlockRequest {
    pub op: BlockOp,
    pub lba: u32,
    pub blocks: u32,
    pub data: Vec<u8>,
}

impl BlockRequest {
    pub fn read(lba: u32, blocks: u32) -> Self {
        BlockRequest {
            op: BlockOp::Read,
            lba,
            blocks,
            data: Vec::new(),
        }
    }

    pub fn write(lba: u32, data: Vec<u8>) -> Self {
        let blocks = (data.len() / BLOCK_SIZE) as u32;
        BlockRequest {
            op: BlockOp::Write,
            lba,
            blocks,
            data,
        }
    }
}

/// The outcome of a `BlockRequest`. A successful read carries the data.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct BlockCompletion {
    pub op: BlockOp,
    pub lba: u32,
    pub result: Result<Vec<u8>, BackendError>,
}

/// A storage failure, kept as text so completions can cross threads.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct BackendError(pub String);

impl fmt::Display for BackendError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

impl Error for BackendError {}

impl From<io::Error> for BackendError {
    fn from(e: io::Error) -> Self {
        BackendError(e.to_string())
    }
}

impl From<notify::Error> for BackendError {
    fn from(e: notify::Error) -> Self {
        BackendError(e.to_string())
    }
}

/// A medium that a unit can be backed by. Nothing here blocks: requests are
/// submitted, and completions and media changes are collected by polling.
pub trait StorageBackend: Send {
    fn start(&mut self) -> Result<(), BackendError>;
    fn stop(&mut self);

    fn poll_event(&mut self) -> Option<MediaEvent>;
    /// Hands the request back if one is already in flight.
    fn submit(&mut self, request: BlockRequest) -> Result<(), BlockRequest>;
    fn poll_completion(&mut self) -> Option<BlockCompletion>;
    /// Give the backend a chance to make progress on the calling thread.
    fn pump(&mut self);
}
