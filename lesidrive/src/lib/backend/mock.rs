use std::collections::VecDeque;
use std::sync::{Arc, Mutex};

use super::*;

#[derive(Default)]
struct MockState {
    image: Option<Vec<u8>>,
    read_only: bool,
    events: VecDeque<MediaEvent>,
    /// Submitted, but not yet carried out by `pump`.
    pending: Option<BlockRequest>,
    completions: VecDeque<BlockCompletion>,
    /// Every request ever carried out, in order.
    log: Vec<(BlockOp, u32, u32)>,
    hold: bool,
    fail_next: bool,
    running: bool,
}

/// An in-memory backend for testing other components. Requests complete on
/// the `pump` after the one that submitted them. Clones share the medium, so
/// a test can keep one while the code under test owns another.
#[derive(Clone, Default)]
pub struct MockBackend {
    state: Arc<Mutex<MockState>>,
}

impl MockBackend {
    pub fn new() -> Self {
        Self::default()
    }

    /// A backend that reports a zeroed medium of `block_count` blocks.
    pub fn with_medium(block_count: u32) -> Self {
        let mock = Self::new();
        mock.insert(block_count, false);
        mock
    }

    pub fn insert(&self, block_count: u32, read_only: bool) {
        let mut state = self.state.lock().unwrap();
        state.image = Some(vec![0; block_count as usize * BLOCK_SIZE]);
        state.read_only = read_only;
        state.events.push_back(MediaEvent::Inserted {
            block_count,
            block_size: BLOCK_SIZE as u16,
            read_only,
        });
    }

    pub fn eject(&self) {
        let mut state = self.state.lock().unwrap();
        state.image = None;
        state.events.push_back(MediaEvent::Ejected);
    }

    /// Keep submitted requests from completing until released.
    pub fn set_hold(&self, hold: bool) {
        self.state.lock().unwrap().hold = hold;
    }

    pub fn fail_next(&self) {
        self.state.lock().unwrap().fail_next = true;
    }

    pub fn is_running(&self) -> bool {
        self.state.lock().unwrap().running
    }

    pub fn log(&self) -> Vec<(BlockOp, u32, u32)> {
        self.state.lock().unwrap().log.clone()
    }

    pub fn read_blocks(&self, lba: u32, blocks: u32) -> Vec<u8> {
        let state = self.state.lock().unwrap();
        let start = lba as usize * BLOCK_SIZE;
        let end = start + blocks as usize * BLOCK_SIZE;
        state.image.as_ref().map(|image| image[start..end].to_vec()).unwrap_or_default()
    }

    pub fn write_blocks(&self, lba: u32, data: &[u8]) {
        let mut state = self.state.lock().unwrap();
        let start = lba as usize * BLOCK_SIZE;
        if let Some(image) = state.image.as_mut() {
            image[start..start + data.len()].copy_from_slice(data);
        }
    }
}

impl MockState {
    fn carry_out(&mut self, request: &BlockRequest) -> Result<Vec<u8>, BackendError> {
        self.log.push((request.op, request.lba, request.blocks));
        if self.fail_next {
            self.fail_next = false;
            return Err(BackendError("injected failure".to_string()));
        }
        let read_only = self.read_only;
        let image = self.image.as_mut().ok_or_else(|| BackendError("no medium".to_string()))?;
        let start = request.lba as usize * BLOCK_SIZE;
        let end = start + request.blocks as usize * BLOCK_SIZE;
        if end > image.len() {
            return Err(BackendError("beyond end of medium".to_string()));
        }
        match request.op {
            BlockOp::Read => Ok(image[start..end].to_vec()),
            BlockOp::Write if read_only => Err(BackendError("medium is read only".to_string())),
            BlockOp::Write => {
                image[start..end].copy_from_slice(&request.data);
                Ok(Vec::new())
            }
        }
    }
}

impl StorageBackend for MockBackend {
    fn start(&mut self) -> Result<(), BackendError> {
        self.state.lock().unwrap().running = true;
        Ok(())
    }

    fn stop(&mut self) {
        self.state.lock().unwrap().running = false;
    }

    fn poll_event(&mut self) -> Option<MediaEvent> {
        self.state.lock().unwrap().events.pop_front()
    }

    fn submit(&mut self, request: BlockRequest) -> Result<(), BlockRequest> {
        let mut state = self.state.lock().unwrap();
        if state.pending.is_some() || !state.completions.is_empty() {
            return Err(request);
        }
        state.pending = Some(request);
        Ok(())
    }

    fn poll_completion(&mut self) -> Option<BlockCompletion> {
        self.state.lock().unwrap().completions.pop_front()
    }

    fn pump(&mut self) {
        let mut state = self.state.lock().unwrap();
        if state.hold {
            return;
        }
        if let Some(request) = state.pending.take() {
            let result = state.carry_out(&request);
            state.completions.push_back(BlockCompletion {
                op: request.op,
                lba: request.lba,
                result,
            });
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_completes_on_pump() {
        let mut mock = MockBackend::with_medium(4);
        assert!(matches!(mock.poll_event(), Some(MediaEvent::Inserted { block_count: 4, .. })));

        mock.submit(BlockRequest::write(1, vec![0xAB; BLOCK_SIZE])).unwrap();
        assert!(mock.submit(BlockRequest::read(0, 1)).is_err());
        assert_eq!(mock.poll_completion(), None);
        mock.pump();
        assert_eq!(mock.poll_completion().unwrap().result, Ok(Vec::new()));
        assert_eq!(mock.read_blocks(1, 1), vec![0xAB; BLOCK_SIZE]);

        mock.set_hold(true);
        mock.submit(BlockRequest::read(3, 2)).unwrap();
        mock.pump();
        assert_eq!(mock.poll_completion(), None);
        mock.set_hold(false);
        mock.pump();
        assert!(mock.poll_completion().unwrap().result.is_err());
        assert_eq!(mock.log(), vec![(BlockOp::Write, 1, 1), (BlockOp::Read, 3, 2)]);
    }
}
