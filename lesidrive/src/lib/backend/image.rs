use log::{debug, info, warn};
use notify::{self, Event, EventKind, RecursiveMode, Watcher};
use std::collections::VecDeque;
use std::convert::TryFrom;
use std::fs;
use std::io::{self, Read, Seek, SeekFrom, Write};
use std::path::{Path, PathBuf};
use std::sync::{Arc, Mutex, mpsc::{self, Sender}};
use std::thread;

use super::*;

/// The image currently in the directory.
#[derive(Debug, Copy, Clone, PartialEq, Eq)]
struct Medium {
    block_count: u32,
    read_only: bool,
}

/// Data that is shared between the worker, watcher, and polling threads.
#[derive(Default)]
struct SharedData {
    medium: Option<Medium>,
    events: VecDeque<MediaEvent>,
    completions: VecDeque<BlockCompletion>,
}

/// A backend on a host directory holding a single image file. Putting a
/// file into the directory inserts a medium; taking it out ejects it.
pub struct ImageBackend {
    dir_path: Arc<PathBuf>,
    worker_tx: Option<Sender<BlockRequest>>,
    worker_thread: Option<thread::JoinHandle<()>>,
    watcher: Option<notify::RecommendedWatcher>,
    shared_data: Arc<Mutex<SharedData>>,
    /// A request was submitted and its completion not yet collected.
    in_flight: bool,
}

impl ImageBackend {
    /// Create a backend on the given directory. It does nothing until
    /// started.
    pub fn new(dir_path: impl Into<PathBuf>) -> Self {
        ImageBackend {
            dir_path: Arc::new(dir_path.into()),
            worker_tx: None,
            worker_thread: None,
            watcher: None,
            shared_data: Arc::new(Mutex::new(SharedData::default())),
            in_flight: false,
        }
    }

    pub fn dir_path(&self) -> &Path {
        self.dir_path.as_path()
    }
}

impl StorageBackend for ImageBackend {
    /// Start the worker thread and the directory watcher.
    fn start(&mut self) -> Result<(), BackendError> {
        if self.worker_thread.is_some() {
            return Err(BackendError(format!(
                "Backend '{}' was already running.", self.dir_path.display())));
        }
        info!("Image backend '{}' starting.", self.dir_path.display());

        // Thread 1: worker (handles block requests). It ends when the
        // sender is dropped.
        let (worker_tx, worker_rx) = mpsc::channel();
        self.worker_tx = Some(worker_tx);
        let worker_dir_path = Arc::clone(&self.dir_path);
        let worker_shared_data = Arc::clone(&self.shared_data);
        let worker_thread = thread::spawn(move || {
            while let Ok(request) = worker_rx.recv() {
                worker_iteration(&worker_dir_path, &worker_shared_data, request);
            }
        });
        self.worker_thread = Some(worker_thread);

        // Thread 2: watcher (watches the directory for inserts/ejects).
        let watcher_dir_path = Arc::clone(&self.dir_path);
        let watcher_shared_data = Arc::clone(&self.shared_data);
        let mut watcher = notify::recommended_watcher(
                move |event: notify::Result<Event>| {
            match event {
                // A file can appear, vanish, grow or change permissions.
                Ok(event) if !matches!(event.kind, EventKind::Access(_)) => {
                    watcher_iteration(&watcher_dir_path, &watcher_shared_data);
                }
                Ok(_) => {}
                Err(e) => warn!("Watch error on '{}': {}", watcher_dir_path.display(), e),
            }
        })?;
        watcher.watch(self.dir_path.as_path(), RecursiveMode::NonRecursive)?;
        // Pick up an image that was already present before we started.
        watcher_iteration(&self.dir_path, &self.shared_data);
        self.watcher = Some(watcher);
        Ok(())
    }

    /// Stop the worker and the watcher. Does nothing if not running.
    fn stop(&mut self) {
        let worker_thread = match self.worker_thread.take() {
            Some(thread) => thread,
            None => return,
        };
        self.worker_tx = None;
        if worker_thread.join().is_err() {
            warn!("Image backend '{}' worker panicked.", self.dir_path.display());
        }

        if let Some(mut watcher) = self.watcher.take() {
            if let Err(e) = watcher.unwatch(self.dir_path.as_path()) {
                warn!("Failed to unwatch '{}': {}", self.dir_path.display(), e);
            }
        }
        self.in_flight = false;
        info!("Image backend '{}' stopping.", self.dir_path.display());
    }

    fn poll_event(&mut self) -> Option<MediaEvent> {
        self.shared_data.lock().unwrap().events.pop_front()
    }

    fn submit(&mut self, request: BlockRequest) -> Result<(), BlockRequest> {
        if self.in_flight {
            return Err(request);
        }
        let worker_tx = match &self.worker_tx {
            Some(tx) => tx,
            None => return Err(request),
        };
        worker_tx.send(request).map_err(|mpsc::SendError(request)| request)?;
        self.in_flight = true;
        Ok(())
    }

    fn poll_completion(&mut self) -> Option<BlockCompletion> {
        let completion = self.shared_data.lock().unwrap().completions.pop_front();
        if completion.is_some() {
            self.in_flight = false;
        }
        completion
    }

    fn pump(&mut self) {
        // All the work happens on the worker and watcher threads.
    }
}

/// Handle a single block request.
fn worker_iteration(dir_path: &Path, shared_data: &Arc<Mutex<SharedData>>,
                    request: BlockRequest) {
    let medium = shared_data.lock().unwrap().medium;
    let end = request.lba as u64 + request.blocks as u64;
    let result = match medium {
        None => Err(BackendError("no medium".to_string())),
        Some(medium) if end > medium.block_count as u64 => Err(BackendError(format!(
            "blocks {}..{} beyond end of medium ({} blocks)",
            request.lba, end, medium.block_count))),
        Some(medium) if medium.read_only && request.op == BlockOp::Write =>
            Err(BackendError("medium is read only".to_string())),
        Some(_) => transfer(dir_path, &request).map_err(BackendError::from),
    };
    if let Err(e) = &result {
        debug!("IO error on image {}: {}", dir_path.display(), e);
    }

    shared_data.lock().unwrap().completions.push_back(BlockCompletion {
        op: request.op,
        lba: request.lba,
        result,
    });
}

fn transfer(dir_path: &Path, request: &BlockRequest) -> io::Result<Vec<u8>> {
    let file_path = get_file_name(dir_path)?
        .ok_or_else(|| io::Error::new(io::ErrorKind::NotFound, "image was removed"))?;
    let offset = request.lba as u64 * BLOCK_SIZE as u64;
    match request.op {
        BlockOp::Read => {
            let mut file = fs::File::open(file_path)?;
            file.seek(SeekFrom::Start(offset))?;
            let mut buffer = vec![0; request.blocks as usize * BLOCK_SIZE];
            file.read_exact(&mut buffer)?;
            Ok(buffer)
        }
        BlockOp::Write => {
            let mut file = fs::OpenOptions::new().write(true).open(file_path)?;
            file.seek(SeekFrom::Start(offset))?;
            file.write_all(&request.data)?;
            Ok(Vec::new())
        }
    }
}

/// React to a filesystem event: perhaps the image changed?
fn watcher_iteration(dir_path: &Path, shared_data: &Arc<Mutex<SharedData>>) {
    let medium = match get_file_name(dir_path) {
        Ok(file_path) => file_path.and_then(|path| probe(&path)),
        Err(e) => {
            warn!("Failed to read directory '{}': {}", dir_path.display(), e);
            None
        }
    };

    let mut sd = shared_data.lock().unwrap();
    if sd.medium == medium {
        return;
    }
    if sd.medium.is_some() {
        debug!("Image '{}' ejected.", dir_path.display());
        sd.events.push_back(MediaEvent::Ejected);
    }
    if let Some(Medium { block_count, read_only }) = medium {
        debug!("Image '{}' inserted with {} blocks{}.", dir_path.display(),
            block_count, if read_only { ", read only" } else { "" });
        sd.events.push_back(MediaEvent::Inserted {
            block_count,
            block_size: BLOCK_SIZE as u16,
            read_only,
        });
    }
    sd.medium = medium;
}

/// Size up an image file. Anything that is not a regular file holding a
/// whole, non-zero number of blocks is no medium at all.
fn probe(file_path: &Path) -> Option<Medium> {
    fs::metadata(file_path).ok().and_then(|metadata| {
        // Ensure it really is a file.
        if metadata.is_file() {Some(metadata)} else {None}
    }).and_then(|metadata| {
        let bytes = metadata.len();
        if bytes > 0 && bytes % BLOCK_SIZE as u64 == 0 {
            u32::try_from(bytes / BLOCK_SIZE as u64).ok().map(|block_count| Medium {
                block_count,
                read_only: metadata.permissions().readonly(),
            })
        } else {None}
    })
}

/// Inspect the given directory, looking for a single file which has its path
/// returned. If there is anything other than a single file, None is returned.
fn get_file_name(dir_path: &Path) -> io::Result<Option<PathBuf>> {
    let mut dir_contents = fs::read_dir(dir_path)?
        .map(|res| res.map(|entry| entry.path()))
        .collect::<io::Result<Vec<_>>>()?;

    if dir_contents.len() == 1 {
        Ok(Some(dir_contents.remove(0)))
    } else {
        Ok(None)
    }
}
