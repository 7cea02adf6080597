//! Persistent hash map shared between the working copy and snapshots
//!
//! Cloning a [`CowMap`] is O(1). A write copies only the trie nodes on the
//! path to the changed key, so the cost of keeping a published snapshot
//! isolated does not grow with the number of entries.

use imbl::GenericHashMap;
use imbl::shared_ptr::DefaultSharedPtr;
use rustc_hash::FxHasher;
use std::hash::BuildHasherDefault;

pub type CowMap<K, V> = GenericHashMap<K, V, BuildHasherDefault<FxHasher>, DefaultSharedPtr>;
