//! The background garbage collector.
//!
//! One thread per series, spawned the way `TTLCleaner` spawns its cleanup
//! thread: a plain `thread::spawn` loop guarded by an `AtomicBool`
//! shutdown flag, woken early by a bounded channel instead of sleeping
//! through a fixed poll interval every time. The thread holds only a
//! [`Weak`] reference to the series' shared state, so it never keeps the
//! series alive by itself — when the last snapshot handle is dropped the
//! series tears itself down and the thread notices on its next wakeup.
//!
//! Pruning advances a strictly in-order frontier (`next_to_gc`): a target
//! version `t` is only processed once version `t` itself has been
//! released, which happens only once every version below `t` has already
//! been released too (the frontier cannot skip ahead). That guarantee is
//! what makes the two cases below sound: by the time `t` is processed, no
//! live version can be `< t`.

use std::collections::HashSet;
use std::hash::Hash;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::mpsc::{Receiver, RecvTimeoutError};
use std::sync::{Arc, Weak};
use std::time::Duration;

use crate::map::SeriesShared;
use crate::version::Version;

const POLL_INTERVAL: Duration = Duration::from_millis(50);

pub(crate) fn run<K, V>(shared: Weak<SeriesShared<K, V>>, wakeup: Receiver<()>, shutdown: Arc<AtomicBool>)
where
    K: Eq + Hash + Clone + Send + Sync + 'static,
    V: Clone + Send + Sync + 'static,
{
    loop {
        if shutdown.load(Ordering::Relaxed) {
            if let Some(shared) = shared.upgrade() {
                shared.drain_gc();
            }
            return;
        }
        match wakeup.recv_timeout(POLL_INTERVAL) {
            Ok(()) | Err(RecvTimeoutError::Timeout) => {
                let Some(shared) = shared.upgrade() else {
                    return;
                };
                shared.drain_gc();
            }
            Err(RecvTimeoutError::Disconnected) => return,
        }
    }
}

impl<K, V> SeriesShared<K, V>
where
    K: Eq + Hash + Clone + Send + Sync + 'static,
    V: Clone + Send + Sync + 'static,
{
    /// Advance the pruning frontier through every contiguous released
    /// version currently available, running one pruning pass per target.
    pub(crate) fn drain_gc(&self) {
        loop {
            let target = {
                let mut state = self.state.lock();
                let next = state.next_to_gc;
                if state.released_pending.remove(&next) {
                    state.next_to_gc += 1;
                    Some(next)
                } else {
                    None
                }
            };
            let Some(t) = target else { break };
            self.run_pruning_pass(t);
        }
    }

    /// Registrations keyed by `trigger` version: each entry names the
    /// `target` version of the chain node to reconsider once `trigger` has
    /// been pruned. `trigger == target` for a first-time registration;
    /// they diverge when a prior pass deferred a node because a live
    /// version still needed it (see `prune_key_chain`).
    fn take_gc_registrations(&self, trigger: Version) -> Vec<(K, Version)> {
        self.version_index.lock().remove(&trigger).unwrap_or_default()
    }

    fn live_versions_in(&self, lo: Version, hi: Version) -> Vec<Version> {
        self.state.lock().live.in_range(lo, hi)
    }

    fn run_pruning_pass(&self, trigger: Version) {
        let registrations = self.take_gc_registrations(trigger);
        let mut seen = HashSet::with_capacity(registrations.len());
        for (key, target) in registrations {
            if !seen.insert((key.clone(), target)) {
                continue;
            }
            self.prune_key_chain(&key, target);
        }
        tracing::debug!(trigger_version = trigger, "GC pruning pass complete");
    }

    /// A pruning pass for target version `t` examines every key that was
    /// registered against `t` (either because a write superseded that
    /// key's mutation at `t`, or because a tombstone was installed at
    /// `t`) and decides, per the rules derived from the in-order
    /// guarantee:
    ///
    /// - If `t` is still the chain head and a tombstone, the key can be
    ///   deleted from the map outright: no live version can be `< t`, so
    ///   nothing needs the chain below it, and reads at any live version
    ///   `>= t` see "absent" whether the tombstone node exists or the key
    ///   is simply gone.
    /// - If `t` is still the chain head and *not* a tombstone, it is
    ///   never pruned by the GC — only a future `put`/`remove` can
    ///   supersede it.
    /// - Otherwise `t` is an interior node: splice it out if no live
    ///   version falls in `[t, successor.version)`; if one does, the key
    ///   is re-registered under that live version so it is reconsidered
    ///   once that version is eventually released.
    fn prune_key_chain(&self, key: &K, t: Version) {
        let Some(head_ref) = self.data.get(key) else {
            return;
        };
        let head = Arc::clone(head_ref.value());
        drop(head_ref);

        if head.version == t {
            if head.is_tombstone() {
                self.data.remove_if(key, |_, v| Arc::ptr_eq(v, &head));
            }
            return;
        }
        if head.version < t {
            // Stale registration: the chain has already moved past `t`.
            return;
        }

        let mut succ = head;
        loop {
            let Some(cur) = succ.prev_snapshot() else {
                return;
            };
            if cur.version < t {
                // `t` was already spliced out by an earlier pass.
                return;
            }
            if cur.version == t {
                let blockers = self.live_versions_in(t, succ.version);
                if blockers.is_empty() {
                    *succ.prev.lock() = cur.prev_snapshot();
                } else {
                    // Still needed by at least one live version in
                    // [t, successor.version). Re-register under each
                    // blocker so this exact node (`target = t`) is
                    // reconsidered as soon as any of them is released —
                    // not under `t` again, since `t` has already been
                    // consumed as this pass's trigger.
                    for v in blockers {
                        self.register_for_gc(v, key.clone(), t);
                    }
                }
                return;
            }
            succ = cur;
        }
    }
}
