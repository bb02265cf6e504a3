//! The fast-copyable hash map itself: the Core Map, the owning Series, and
//! the mutable/immutable snapshot handles.
//!
//! The backing table is a [`DashMap`] from key to the current chain head,
//! the same sharded-concurrent-map choice the teacher makes for its own
//! key/value store. Only the writer (the mutable snapshot) and the
//! garbage collector ever touch a chain; readers only ever walk it.

use std::collections::{BTreeSet, HashMap};
use std::hash::Hash;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::mpsc::{self, Receiver, SyncSender};
use std::sync::{Arc, Weak};
use std::thread::JoinHandle;

use dashmap::DashMap;
use parking_lot::Mutex;

use crate::error::{Error, Result};
use crate::gc;
use crate::mutation::{effective_value, MutationNode};
use crate::version::{LiveVersions, Version};

/// Entry point for creating a fast-copyable map. There is no standalone
/// handle for the series itself — a series cannot exist without a
/// mutable snapshot, so construction returns one directly.
pub struct Series;

impl Series {
    /// Create an empty map and return its initial mutable snapshot, at
    /// version 0.
    pub fn new<K, V>() -> MutableSnapshot<K, V>
    where
        K: Eq + Hash + Clone + Send + Sync + 'static,
        V: Clone + Send + Sync + 'static,
    {
        Self::with_capacity(0)
    }

    /// Like [`Series::new`], pre-sizing the backing table for `capacity`
    /// keys.
    pub fn with_capacity<K, V>(capacity: usize) -> MutableSnapshot<K, V>
    where
        K: Eq + Hash + Clone + Send + Sync + 'static,
        V: Clone + Send + Sync + 'static,
    {
        let shared = SeriesShared::new(capacity);
        tracing::debug!(capacity, "series created");
        MutableSnapshot { shared, version: 0 }
    }
}

pub(crate) struct SeriesState {
    current_mutable_version: Version,
    pub(crate) live: LiveVersions,
    pub(crate) released_pending: BTreeSet<Version>,
    pub(crate) next_to_gc: Version,
    live_immutable_count: usize,
    poisoned: Option<Error>,
    size: usize,
}

impl SeriesState {
    fn new() -> Self {
        let mut live = LiveVersions::new();
        live.insert(0);
        Self {
            current_mutable_version: 0,
            live,
            released_pending: BTreeSet::new(),
            next_to_gc: 0,
            live_immutable_count: 0,
            poisoned: None,
            size: 0,
        }
    }
}

/// State shared by every snapshot handle (mutable and immutable) derived
/// from one [`Series::new`] call, and by the background GC thread.
pub(crate) struct SeriesShared<K, V> {
    pub(crate) data: DashMap<K, Arc<MutationNode<V>>>,
    pub(crate) state: Mutex<SeriesState>,
    pub(crate) version_index: Mutex<HashMap<Version, Vec<(K, Version)>>>,
    gc_wakeup: SyncSender<()>,
    gc_shutdown: Arc<AtomicBool>,
    gc_thread: Mutex<Option<JoinHandle<()>>>,
}

impl<K, V> SeriesShared<K, V>
where
    K: Eq + Hash + Clone + Send + Sync + 'static,
    V: Clone + Send + Sync + 'static,
{
    fn new(capacity: usize) -> Arc<Self> {
        let (tx, rx): (SyncSender<()>, Receiver<()>) = mpsc::sync_channel(1);
        let shutdown = Arc::new(AtomicBool::new(false));

        Arc::new_cyclic(|weak: &Weak<SeriesShared<K, V>>| {
            let weak_for_thread = weak.clone();
            let shutdown_for_thread = Arc::clone(&shutdown);
            let thread = std::thread::spawn(move || {
                gc::run(weak_for_thread, rx, shutdown_for_thread);
            });

            SeriesShared {
                data: DashMap::with_capacity(capacity),
                state: Mutex::new(SeriesState::new()),
                version_index: Mutex::new(HashMap::new()),
                gc_wakeup: tx,
                gc_shutdown: shutdown,
                gc_thread: Mutex::new(Some(thread)),
            }
        })
    }

    pub(crate) fn get_at(&self, key: &K, version: Version) -> Option<V> {
        let head = self.data.get(key)?;
        effective_value(head.value(), version)
    }

    /// Ask the GC to reconsider `key`'s chain entry at `target` once
    /// `trigger` has been pruned. `trigger` is usually `target` itself
    /// (the common case: reconsider this node once its own version is
    /// processed); when a pruning pass finds the node still needed by a
    /// live version gap, it re-registers with `trigger` set to the live
    /// version blocking it, while `target` stays the node's own version
    /// so the next pass still knows which node it is looking for.
    pub(crate) fn register_for_gc(&self, trigger: Version, key: K, target: Version) {
        self.version_index.lock().entry(trigger).or_default().push((key, target));
    }

    fn poison(&self, err: Error) {
        let mut state = self.state.lock();
        if state.poisoned.is_none() {
            tracing::error!(error = %err, "series poisoned");
            state.poisoned = Some(err);
        }
    }

    fn notify_gc(&self) {
        let _ = self.gc_wakeup.try_send(());
    }

    /// `None` if the series is healthy; otherwise the error subsequent
    /// operations should fail with. The triggering call itself returns the
    /// original fatal error (e.g. `VersionOverflow`) directly; every call
    /// after that sees `SeriesPoisoned` instead (§7).
    fn poisoned_err(&self) -> Option<Error> {
        self.state.lock().poisoned.as_ref().map(|_| Error::SeriesPoisoned)
    }

    /// Span, inclusive, from the lowest currently live version to the
    /// current mutable version. A diagnostic used to sanity-check that
    /// versions are being retired in order rather than to drive any
    /// operation.
    fn live_span(&self) -> usize {
        let state = self.state.lock();
        match state.live.min() {
            Some(lowest) => (state.current_mutable_version - lowest + 1) as usize,
            None => 0,
        }
    }

    /// Every version for which a live snapshot handle (mutable or
    /// immutable) currently exists, in no particular order. A diagnostic
    /// capability for tests and higher layers — the core offers only this
    /// unordered form; a caller wanting an exclusive or lock-free
    /// iteration order builds it on top.
    fn live_versions(&self) -> Vec<Version> {
        self.state.lock().live.all()
    }
}

impl<K, V> Drop for SeriesShared<K, V> {
    fn drop(&mut self) {
        self.gc_shutdown.store(true, Ordering::Relaxed);
        let _ = self.gc_wakeup.try_send(());
        if let Some(handle) = self.gc_thread.lock().take() {
            let _ = handle.join();
        }
    }
}

/// The current mutable snapshot of a series. There is exactly one of
/// these at a time; `copy()` freezes it into an immutable [`Snapshot`]
/// and mints the next one in its place.
pub struct MutableSnapshot<K, V> {
    pub(crate) shared: Arc<SeriesShared<K, V>>,
    version: Version,
}

impl<K, V> MutableSnapshot<K, V>
where
    K: Eq + Hash + Clone + Send + Sync + 'static,
    V: Clone + Send + Sync + 'static,
{
    fn ensure_usable(&self) -> Result<()> {
        match self.shared.poisoned_err() {
            Some(err) => Err(err),
            None => Ok(()),
        }
    }

    /// Install `value` for `key` at the current version, returning the
    /// value that was effective immediately before this call.
    pub fn put(&mut self, key: K, value: V) -> Result<Option<V>> {
        self.ensure_usable()?;
        let cur_v = self.version;
        let old_head = self.shared.data.get(&key).map(|e| Arc::clone(e.value()));
        let prev_value = old_head.as_ref().and_then(|h| h.value.clone());

        let linked_prev = match &old_head {
            None => None,
            Some(h) if h.version == cur_v => h.prev_snapshot(),
            Some(h) => self.link_or_drop(&key, h, cur_v),
        };

        let node = MutationNode::new(Some(value), cur_v, linked_prev);
        self.shared.data.insert(key, node);

        if prev_value.is_none() {
            self.shared.state.lock().size += 1;
        }
        Ok(prev_value)
    }

    /// Tombstone `key` at the current version if it is currently present.
    /// A `remove` of an already-absent or already-tombstoned key is a
    /// no-op (property P5) and does not consume a chain entry.
    pub fn remove(&mut self, key: K) -> Result<Option<V>> {
        self.ensure_usable()?;
        let cur_v = self.version;
        let old_head = self.shared.data.get(&key).map(|e| Arc::clone(e.value()));
        let prev_value = match old_head.as_ref().and_then(|h| h.value.clone()) {
            Some(v) => v,
            None => return Ok(None),
        };
        let old_head = old_head.expect("prev_value is Some implies old_head exists");

        let linked_prev = if old_head.version == cur_v {
            old_head.prev_snapshot()
        } else {
            self.link_or_drop(&key, &old_head, cur_v)
        };

        let node = MutationNode::new(None, cur_v, linked_prev);
        self.shared.data.insert(key.clone(), node);
        // A tombstone head is always reconsidered once the GC frontier
        // reaches its own version: it may then be safe to delete the key
        // entirely (see `gc::prune_key_chain`).
        self.shared.register_for_gc(cur_v, key, cur_v);
        self.shared.state.lock().size -= 1;

        Ok(Some(prev_value))
    }

    /// Link `old_head` in as the new node's predecessor, unless it is
    /// already provably unreachable by any live version — in which case
    /// skip linking it at all and let it drop immediately, rather than
    /// waiting for the background GC to notice.
    ///
    /// The usual trigger for reconsidering `old_head` is its own version:
    /// the GC frontier processes it the moment that version is pruned.
    /// But a "dormant" key — one that goes several release cycles without
    /// being written — can have its `old_head.version` already left
    /// behind by `next_to_gc` (the frontier only ever moves forward and
    /// never revisits a version once it is past it). Registering under
    /// that stale trigger would leak the node forever, since nothing will
    /// ever release a version the frontier already consumed. In that
    /// case, register under the lowest still-live version in the blocking
    /// range instead — that version is guaranteed to be released (and
    /// hence reach the frontier) in the future, so the node is actually
    /// reconsidered.
    fn link_or_drop(
        &self,
        key: &K,
        old_head: &Arc<MutationNode<V>>,
        cur_v: Version,
    ) -> Option<Arc<MutationNode<V>>> {
        let (blockers, next_to_gc) = {
            let state = self.shared.state.lock();
            (state.live.in_range(old_head.version, cur_v), state.next_to_gc)
        };
        match blockers.first() {
            Some(&lowest_blocker) => {
                let trigger = if old_head.version < next_to_gc {
                    lowest_blocker
                } else {
                    old_head.version
                };
                self.shared.register_for_gc(trigger, key.clone(), old_head.version);
                Some(Arc::clone(old_head))
            }
            None => old_head.prev_snapshot(),
        }
    }

    /// True iff `key`'s effective value at the current version is present.
    pub fn contains_key(&self, key: &K) -> Result<bool> {
        Ok(self.get(key)?.is_some())
    }

    /// The effective value of `key` at the current version.
    pub fn get(&self, key: &K) -> Result<Option<V>> {
        self.ensure_usable()?;
        Ok(self.shared.get_at(key, self.version))
    }

    /// Number of keys currently present (not absent/tombstoned). `O(1)`:
    /// maintained incrementally on every presence-changing `put`/`remove`.
    pub fn size(&self) -> Result<usize> {
        self.ensure_usable()?;
        Ok(self.shared.state.lock().size)
    }

    /// This snapshot's version number.
    pub fn version(&self) -> Version {
        self.version
    }

    /// Always `true` for a [`MutableSnapshot`].
    pub fn is_mutable(&self) -> bool {
        true
    }

    /// Freeze the current version into an immutable [`Snapshot`] and
    /// advance this handle to the next version. Does not touch a single
    /// chain entry — property P6.
    pub fn copy(&mut self) -> Result<Snapshot<K, V>> {
        self.ensure_usable()?;
        let old_version = self.version;
        let new_version = match old_version.checked_add(1) {
            Some(v) => v,
            None => {
                let err = Error::VersionOverflow;
                self.shared.poison(err.clone());
                return Err(err);
            }
        };
        {
            let mut state = self.shared.state.lock();
            state.current_mutable_version = new_version;
            state.live.insert(new_version);
            state.live_immutable_count += 1;
        }
        self.version = new_version;
        tracing::debug!(old_version, new_version, "copy");
        Ok(Snapshot::new(Arc::clone(&self.shared), old_version))
    }

    /// Release the mutable snapshot. Fails with [`Error::ReleaseOrderViolated`]
    /// if any immutable snapshot derived from this series is still live —
    /// the mutable snapshot must be released last.
    pub fn release_mutable(self) -> Result<()> {
        self.ensure_usable()?;
        let mut state = self.shared.state.lock();
        if state.live_immutable_count > 0 {
            return Err(Error::ReleaseOrderViolated {
                live_immutable: state.live_immutable_count,
            });
        }
        if !state.live.remove(self.version) {
            return Err(Error::DuplicateRelease(self.version));
        }
        state.released_pending.insert(self.version);
        drop(state);
        self.shared.notify_gc();
        tracing::debug!(version = self.version, "mutable snapshot released");
        Ok(())
    }

    /// Diagnostic: number of snapshot versions currently live across the
    /// whole series (no ordering guarantee on how they relate).
    pub fn live_version_count(&self) -> usize {
        self.shared.state.lock().live.len()
    }

    /// Diagnostic: span, inclusive, from the lowest live version to the
    /// current mutable version.
    pub fn live_span(&self) -> usize {
        self.shared.live_span()
    }

    /// Diagnostic: every version currently carrying a live snapshot
    /// handle, in no particular order.
    pub fn live_versions(&self) -> Vec<Version> {
        self.shared.live_versions()
    }
}

/// An immutable fast copy at a fixed version. Cheap to clone — every
/// clone shares the same underlying series and the same released-ness,
/// so releasing through any one clone releases the logical snapshot for
/// all of them.
pub struct Snapshot<K, V> {
    shared: Arc<SeriesShared<K, V>>,
    version: Version,
    released: Arc<AtomicBool>,
}

impl<K, V> Clone for Snapshot<K, V> {
    fn clone(&self) -> Self {
        Self {
            shared: Arc::clone(&self.shared),
            version: self.version,
            released: Arc::clone(&self.released),
        }
    }
}

impl<K, V> Snapshot<K, V>
where
    K: Eq + Hash + Clone + Send + Sync + 'static,
    V: Clone + Send + Sync + 'static,
{
    fn new(shared: Arc<SeriesShared<K, V>>, version: Version) -> Self {
        Self {
            shared,
            version,
            released: Arc::new(AtomicBool::new(false)),
        }
    }

    fn ensure_usable(&self) -> Result<()> {
        if self.released.load(Ordering::Acquire) {
            return Err(Error::UseAfterRelease);
        }
        if let Some(err) = self.shared.poisoned_err() {
            return Err(err);
        }
        Ok(())
    }

    /// The effective value of `key` at this snapshot's version.
    pub fn get(&self, key: &K) -> Result<Option<V>> {
        self.ensure_usable()?;
        Ok(self.shared.get_at(key, self.version))
    }

    /// True iff `key`'s effective value at this version is present.
    pub fn contains_key(&self, key: &K) -> Result<bool> {
        Ok(self.get(key)?.is_some())
    }

    /// Number of present keys at this version. Unlike the mutable
    /// snapshot's `size()`, this is a full scan (`O(n)`): older versions
    /// have no incrementally maintained counter of their own.
    pub fn size(&self) -> Result<usize> {
        self.ensure_usable()?;
        let version = self.version;
        Ok(self
            .shared
            .data
            .iter()
            .filter(|e| effective_value(e.value(), version).is_some())
            .count())
    }

    /// This snapshot's version number.
    pub fn version(&self) -> Version {
        self.version
    }

    /// Always `false` for a [`Snapshot`].
    pub fn is_mutable(&self) -> bool {
        false
    }

    /// Release this snapshot. Releasing the same logical snapshot twice
    /// (through any clone) fails with [`Error::DuplicateRelease`]; using
    /// a snapshot after release fails with [`Error::UseAfterRelease`].
    pub fn release(&self) -> Result<()> {
        // Check poison status before flipping `released` — otherwise a
        // poisoned series would mark this handle released without ever
        // performing the live-set/released_pending bookkeeping below,
        // leaving `self.version` stuck in `state.live` forever while the
        // handle itself can never be released again (every future call
        // would see `released == true` and report `DuplicateRelease`
        // instead).
        if let Some(err) = self.shared.poisoned_err() {
            return Err(err);
        }
        if self
            .released
            .compare_exchange(false, true, Ordering::AcqRel, Ordering::Acquire)
            .is_err()
        {
            return Err(Error::DuplicateRelease(self.version));
        }
        let mut state = self.shared.state.lock();
        if !state.live.remove(self.version) {
            return Err(Error::DuplicateRelease(self.version));
        }
        state.released_pending.insert(self.version);
        state.live_immutable_count = state.live_immutable_count.saturating_sub(1);
        drop(state);
        self.shared.notify_gc();
        tracing::debug!(version = self.version, "immutable snapshot released");
        Ok(())
    }

    /// Diagnostic: number of snapshot versions currently live across the
    /// whole series.
    pub fn live_version_count(&self) -> usize {
        self.shared.state.lock().live.len()
    }

    /// Diagnostic: span, inclusive, from the lowest live version to the
    /// current mutable version.
    pub fn live_span(&self) -> usize {
        self.shared.live_span()
    }

    /// Diagnostic: every version currently carrying a live snapshot
    /// handle, in no particular order.
    pub fn live_versions(&self) -> Vec<Version> {
        self.shared.live_versions()
    }
}
