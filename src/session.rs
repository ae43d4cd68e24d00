//! Sort session state.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use crate::channel::Channel;
use crate::record::Warnings;
use crate::sort::SortError;
use crate::storage::StorageManager;

/// Cooperative abort request shared between a caller and a running sort.
///
/// The sort observes the signal between element writes and stops with [`SortError::Aborted`],
/// releasing every auxiliary channel.
#[derive(Debug, Clone, Default)]
pub struct AbortSignal {
    flag: Arc<AtomicBool>,
}

impl AbortSignal {
    pub fn new() -> Self {
        AbortSignal::default()
    }

    /// Requests the sort to stop.
    pub fn abort(&self) {
        self.flag.store(true, Ordering::SeqCst);
    }

    pub fn is_aborted(&self) -> bool {
        self.flag.load(Ordering::SeqCst)
    }

    /// Returns [`SortError::Aborted`] if an abort was requested.
    pub fn check(&self) -> Result<(), SortError> {
        if self.is_aborted() {
            Err(SortError::Aborted)
        } else {
            Ok(())
        }
    }
}

/// State of a single sort call.
///
/// Owns the storage namespace, so every channel still alive when the session is dropped gets released,
/// whatever way the sort ended. The two ping-pong slots used by the two-tape strategies are kept as
/// explicit fields: `slots[source]` is the current source, the other slot receives the next destination.
pub struct SortSession<'a> {
    pub(crate) storage: StorageManager,
    pub(crate) warnings: Warnings,
    pub(crate) abort: &'a AbortSignal,
    slots: [Option<Channel>; 2],
    source: usize,
    passes: usize,
}

impl<'a> SortSession<'a> {
    pub fn new(storage: StorageManager, abort: &'a AbortSignal) -> Self {
        SortSession {
            storage,
            warnings: Warnings::new(),
            abort,
            slots: [None, None],
            source: 0,
            passes: 0,
        }
    }

    /// Keeps at most `limit` warnings in memory. Warnings over the limit are only logged and counted.
    pub fn with_warning_limit(mut self, limit: usize) -> Self {
        self.warnings = Warnings::with_limit(limit);
        return self;
    }

    pub fn storage(&self) -> &StorageManager {
        &self.storage
    }

    pub fn warnings(&self) -> &Warnings {
        &self.warnings
    }

    /// Current source channel.
    pub fn source(&self) -> Option<&Channel> {
        self.slots[self.source].as_ref()
    }

    /// Index of the slot holding the current source.
    pub fn source_slot(&self) -> usize {
        self.source
    }

    /// Installs the initial source channel.
    pub fn set_source(&mut self, channel: Channel) {
        if let Some(previous) = self.slots[self.source].replace(channel) {
            self.storage.release(previous);
        }
    }

    /// Installs the output of a pass in the destination slot, releases the consumed source
    /// and toggles the slots so that the destination becomes the next source.
    pub fn complete_pass(&mut self, destination: Channel) {
        let destination_slot = 1 - self.source;
        if let Some(stale) = self.slots[destination_slot].replace(destination) {
            self.storage.release(stale);
        }
        if let Some(consumed) = self.slots[self.source].take() {
            self.storage.release(consumed);
        }

        self.source = destination_slot;
        self.passes += 1;
    }

    /// Counts a pass that doesn't go through the ping-pong slots.
    pub fn count_pass(&mut self) {
        self.passes += 1;
    }

    pub fn passes(&self) -> usize {
        self.passes
    }

    /// Takes the current source out of the session.
    pub fn take_source(&mut self) -> Option<Channel> {
        self.slots[self.source].take()
    }
}

#[cfg(test)]
mod test {
    use std::sync::Arc;

    use super::{AbortSignal, SortSession};
    use crate::channel::RmpCodec;
    use crate::sort::SortError;
    use crate::storage::{ChannelTracker, StorageManager};

    #[test]
    fn test_abort_signal() {
        let signal = AbortSignal::new();
        let shared = signal.clone();
        assert!(signal.check().is_ok());

        shared.abort();
        assert!(matches!(signal.check(), Err(SortError::Aborted)));
    }

    #[test]
    fn test_ping_pong_slots() {
        let tmp_dir = tempfile::tempdir_in("./").unwrap();
        let tracker = Arc::new(ChannelTracker::new());
        let storage = StorageManager::new(Some(tmp_dir.path()), None, None, tracker.clone()).unwrap();
        let abort = AbortSignal::new();
        let mut session = SortSession::new(storage, &abort);

        let first = session.storage().allocate::<i32, RmpCodec>().unwrap().finish().unwrap();
        let first_id = first.id();
        session.set_source(first);
        assert_eq!(session.source_slot(), 0);

        let second = session.storage().allocate::<i32, RmpCodec>().unwrap().finish().unwrap();
        let second_id = second.id();
        session.complete_pass(second);

        assert_eq!(session.source_slot(), 1);
        assert_eq!(session.source().map(|c| c.id()), Some(second_id));
        assert_ne!(first_id, second_id);
        assert_eq!(session.passes(), 1);
        assert_eq!(tracker.live(), 1);

        drop(session);
        assert_eq!(tracker.live(), 0);
    }
}
