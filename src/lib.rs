//! Persistent B-Tree storage engine.
//!
//! A [BTree] is an ordered key-value index whose nodes live in a pluggable [StorageStrategy].
//! Nodes are loaded on demand and kept in a bounded, reclaimable node cache, mutations are
//! wrapped in a storage transaction (`begin`/`commit`) and every tree is guarded by a single
//! read-write-upgradable [TreeLock] shared with its storage strategy.
//!
//! Two strategies are provided: [MemoryStorage], for ephemeral trees and tests, and
//! [FileStorage], an append-only log of node records that recovers to the last committed
//! transaction after a crash.
//!
//! ```no_run
//! use persistree::{BTree, FileStorage, FileStorageOptions};
//!
//! # fn main() -> Result<(), persistree::Error> {
//! let storage = FileStorage::<u64, String>::open(FileStorageOptions::new("/tmp/my-tree"))?;
//! let tree = BTree::open(storage)?;
//! tree.insert(1, "one".to_string())?;
//! assert_eq!(tree.get(&1)?.as_deref(), Some("one"));
//! # Ok(())
//! # }
//! ```
#![warn(missing_docs)]

#[macro_use]
extern crate log;
#[macro_use]
extern crate derive_more;

mod compare;
mod error;
mod lock;
mod node;
mod options;
mod storage;
mod tree;
mod utils;
mod view;


pub use compare::{Comparator, NaturalOrder};
pub use error::Error;
pub use lock::{TreeLock, TreeReadGuard, TreeUpgradableReadGuard, TreeWriteGuard};
pub use options::{FileStorageOptions, TreeOptions};
pub use storage::{
    codec::Codec, file::FileStorage, mem::MemoryStorage, NodeData, NodeId, StorageStrategy,
    NO_NODE,
};
pub use tree::{BTree, TreeStats};
pub use view::{Iter, Keys, SortedMapKernel, SortedMapView, Values};

type HashMap<K, V> = hashbrown::HashMap<K, V, foldhash::fast::RandomState>;
type HashSet<K> = hashbrown::HashSet<K, foldhash::fast::RandomState>;

/// Default maximum number of entries per node.
pub const DEFAULT_MAX_NODE_SIZE: usize = 64;
