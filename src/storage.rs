//! Auxiliary storage manager.
//!
//! Every sort session owns one [`StorageManager`]. Channels are files inside a session-scoped temporary
//! directory, named from an atomic counter, so that concurrent sessions and concurrent merges inside one pass
//! never collide. The manager keeps track of every live channel and removes all of them on
//! [`StorageManager::release_all`] or when it is dropped, including channels that were only partially written.

use std::collections::HashMap;
use std::fs;
use std::io;
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicU64, AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};

use crate::channel::{Channel, ChannelCodec, ChannelId, ChannelReader, ChannelWriter};
use crate::sort::SortError;

/// Live channel counter shared between a sorter and the storage managers of its sessions.
#[derive(Debug, Default)]
pub struct ChannelTracker {
    live: AtomicUsize,
    allocated: AtomicU64,
}

impl ChannelTracker {
    pub fn new() -> Self {
        ChannelTracker::default()
    }

    /// Number of channels currently allocated and not yet released.
    pub fn live(&self) -> usize {
        self.live.load(Ordering::SeqCst)
    }

    /// Total number of channels ever allocated.
    pub fn allocated(&self) -> u64 {
        self.allocated.load(Ordering::SeqCst)
    }
}

/// Auxiliary storage manager.
pub struct StorageManager {
    dir: tempfile::TempDir,
    next_id: AtomicU64,
    live: Mutex<HashMap<ChannelId, PathBuf>>,
    allocated: AtomicU64,
    channel_limit: Option<usize>,
    rw_buf_size: Option<usize>,
    tracker: Arc<ChannelTracker>,
}

impl StorageManager {
    /// Creates a session namespace inside `tmp_path` (or the OS temporary directory).
    ///
    /// # Arguments
    /// * `tmp_path` - Directory the session namespace is created in
    /// * `rw_buf_size` - Channel read/write buffer size
    /// * `channel_limit` - Maximum number of simultaneously live channels
    /// * `tracker` - Counter shared with the owning sorter
    pub fn new(
        tmp_path: Option<&Path>,
        rw_buf_size: Option<usize>,
        channel_limit: Option<usize>,
        tracker: Arc<ChannelTracker>,
    ) -> Result<Self, SortError> {
        let mut builder = tempfile::Builder::new();
        builder.prefix("ext-merge-sort-");
        let dir = match tmp_path {
            Some(tmp_path) => builder.tempdir_in(tmp_path),
            None => builder.tempdir(),
        }
        .map_err(SortError::TempDir)?;

        log::debug!("session namespace {}", dir.path().display());

        return Ok(StorageManager {
            dir,
            next_id: AtomicU64::new(0),
            live: Mutex::new(HashMap::new()),
            allocated: AtomicU64::new(0),
            channel_limit,
            rw_buf_size,
            tracker,
        });
    }

    /// Session namespace directory.
    pub fn path(&self) -> &Path {
        self.dir.path()
    }

    /// Allocates a new empty channel and returns its writer.
    pub fn allocate<T, C>(&self) -> Result<ChannelWriter<T, C>, SortError>
    where
        C: ChannelCodec<T>,
    {
        let mut live = self.live.lock().unwrap_or_else(|poisoned| poisoned.into_inner());

        if let Some(limit) = self.channel_limit {
            if live.len() >= limit {
                return Err(SortError::StorageAllocation(io::Error::new(
                    io::ErrorKind::Other,
                    format!("channel limit reached ({} live channels)", limit),
                )));
            }
        }

        let id = self.next_id.fetch_add(1, Ordering::SeqCst);
        let path = self.dir.path().join(format!("channel-{:06}.run", id));
        let file = fs::OpenOptions::new()
            .read(true)
            .write(true)
            .create_new(true)
            .open(&path)
            .map_err(SortError::StorageAllocation)?;

        live.insert(id, path.clone());
        self.allocated.fetch_add(1, Ordering::SeqCst);
        self.tracker.live.fetch_add(1, Ordering::SeqCst);
        self.tracker.allocated.fetch_add(1, Ordering::SeqCst);
        log::trace!("allocated channel {}", id);

        return Ok(ChannelWriter::new(id, path, file, self.rw_buf_size));
    }

    /// Opens a sealed channel for reading.
    pub fn open<T, C>(&self, channel: &Channel) -> Result<ChannelReader<T, C>, SortError>
    where
        C: ChannelCodec<T>,
    {
        ChannelReader::new(channel, self.rw_buf_size).map_err(SortError::StorageIO)
    }

    /// Releases a sealed channel.
    pub fn release(&self, channel: Channel) {
        self.release_id(channel.id);
    }

    /// Releases a channel that is still being written.
    pub fn discard<T, C>(&self, writer: ChannelWriter<T, C>)
    where
        C: ChannelCodec<T>,
    {
        let id = writer.id();
        drop(writer);
        self.release_id(id);
    }

    /// Releases every live channel.
    pub fn release_all(&self) {
        let drained: Vec<(ChannelId, PathBuf)> = self
            .live
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
            .drain()
            .collect();

        if !drained.is_empty() {
            log::debug!("releasing {} remaining channels", drained.len());
        }
        for (id, path) in drained {
            self.remove_file(id, &path);
        }
    }

    /// Number of live channels of this session.
    pub fn live_channels(&self) -> usize {
        self.live.lock().unwrap_or_else(|poisoned| poisoned.into_inner()).len()
    }

    /// Number of channels allocated by this session.
    pub fn allocated_channels(&self) -> u64 {
        self.allocated.load(Ordering::SeqCst)
    }

    fn release_id(&self, id: ChannelId) {
        let path = self
            .live
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
            .remove(&id);

        match path {
            Some(path) => self.remove_file(id, &path),
            None => log::warn!("channel {} released twice", id),
        }
    }

    fn remove_file(&self, id: ChannelId, path: &Path) {
        self.tracker.live.fetch_sub(1, Ordering::SeqCst);
        log::trace!("released channel {}", id);
        if let Err(err) = fs::remove_file(path) {
            if err.kind() != io::ErrorKind::NotFound {
                log::warn!("channel {} file {} not removed: {}", id, path.display(), err);
            }
        }
    }
}

impl Drop for StorageManager {
    fn drop(&mut self) {
        self.release_all();
    }
}
