//! Mutation chain nodes.
//!
//! Each key maps to a singly-linked chain of [`MutationNode`]s ordered by
//! strictly decreasing version (newest first). A node's `value` and
//! `version` are immutable for the node's lifetime; `prev` is the one
//! field the background garbage collector rewrites in place, to splice
//! out nodes that become unreachable (see `gc.rs`).

use std::sync::Arc;

use parking_lot::Mutex;

use crate::version::Version;

/// One entry in a key's mutation chain.
///
/// `value = None` encodes a tombstone: the key is logically absent from
/// this version onward, until a later `put` installs a new head.
pub(crate) struct MutationNode<V> {
    pub(crate) value: Option<V>,
    pub(crate) version: Version,
    pub(crate) prev: Mutex<Option<Arc<MutationNode<V>>>>,
}

impl<V> MutationNode<V> {
    pub(crate) fn new(value: Option<V>, version: Version, prev: Option<Arc<MutationNode<V>>>) -> Arc<Self> {
        Arc::new(Self {
            value,
            version,
            prev: Mutex::new(prev),
        })
    }

    pub(crate) fn is_tombstone(&self) -> bool {
        self.value.is_none()
    }

    pub(crate) fn prev_snapshot(&self) -> Option<Arc<MutationNode<V>>> {
        self.prev.lock().clone()
    }
}

/// Walk a chain starting at `head`, returning the value of the most
/// recent mutation with `version <= at_version` (absent if none, or if
/// that mutation is a tombstone). This is the sole read path and is the
/// direct implementation of property P2.
pub(crate) fn effective_value<V: Clone>(
    head: &Arc<MutationNode<V>>,
    at_version: Version,
) -> Option<V> {
    let mut cur = Arc::clone(head);
    loop {
        if cur.version <= at_version {
            return cur.value.clone();
        }
        match cur.prev_snapshot() {
            Some(next) => cur = next,
            None => return None,
        }
    }
}
