//! # fchm
//!
//! A fast-copyable hash map: a mapping from keys to values that supports
//! `O(1)` creation of logical snapshots ("fast copies") with lazy
//! per-key copy-on-write, bounded memory growth, and safe concurrent
//! reads across snapshots while one snapshot is being mutated.
//!
//! - **Versioned snapshots** — [`Series::new`] hands you the initial
//!   mutable snapshot; [`MutableSnapshot::copy`] freezes it into an
//!   immutable [`Snapshot`] and mints the next mutable version in `O(1)`,
//!   independent of map size.
//! - **Lazy copy-on-write** — each key's history is a singly-linked chain
//!   of versioned mutations; `copy()` never touches a single chain entry.
//! - **Background garbage collection** — a single worker thread prunes
//!   chain entries made unreachable by released snapshots, advancing a
//!   strictly in-order frontier so out-of-order releases never provoke
//!   out-of-order pruning.
//!
//! # Example
//!
//! ```
//! use fchm::Series;
//!
//! let mut m = Series::new::<&str, i32>();
//! m.put("a", 1).unwrap();
//! let snapshot = m.copy().unwrap();
//! m.put("a", 2).unwrap();
//!
//! assert_eq!(snapshot.get(&"a").unwrap(), Some(1));
//! assert_eq!(m.get(&"a").unwrap(), Some(2));
//!
//! snapshot.release().unwrap();
//! m.release_mutable().unwrap();
//! ```
//!
//! # Non-goals
//!
//! This crate is the versioned core only. It does not provide a
//! Merkle/content-hash overlay, a fast-copyable queue, on-disk
//! persistence, cross-process sharing, ordered iteration, a stable
//! serialization format, or range queries.

#![warn(missing_docs)]
#![warn(clippy::all)]

mod error;
mod gc;
mod map;
mod mutation;
mod version;

pub use error::{Error, Result};
pub use map::{MutableSnapshot, Series, Snapshot};
pub use version::Version;
