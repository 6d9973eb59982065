//! Index variants and the read contract they share.
//!
//! Four variants implement [`GraphIndex`]: the serialized-file reader, the
//! in-memory index, the combined view over many indices, and the
//! prefix-namespace adapter. Combined views and the ancestry walker depend
//! only on the trait.

use bytes::Bytes;
use rustc_hash::{FxHashMap, FxHashSet};

use crate::error::{Result, TesseraError};
use crate::key::{Key, PrefixKey};

pub mod ancestry;
pub mod builder;
pub mod combined;
pub mod memory;
pub mod prefix;
pub mod reader;

/// A resolved parent relation: key to its parents in one reference list.
pub type ParentMap = FxHashMap<Key, Vec<Key>>;

/// One real node of an index.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct Entry {
    /// The node's key.
    pub key: Key,
    /// Opaque payload stored with the key.
    pub value: Bytes,
    /// Resolved reference lists, one per reference list of the index;
    /// empty when the index carries none.
    pub refs: Vec<Vec<Key>>,
}

impl Entry {
    /// An entry without references.
    pub fn new(key: Key, value: impl Into<Bytes>) -> Self {
        Entry {
            key,
            value: value.into(),
            refs: Vec::new(),
        }
    }

    /// An entry with reference lists.
    pub fn with_refs(key: Key, value: impl Into<Bytes>, refs: Vec<Vec<Key>>) -> Self {
        Entry {
            key,
            value: value.into(),
            refs,
        }
    }
}

/// The read contract shared by every index variant.
///
/// Results are materialized; the order within one call is unspecified
/// unless an implementation documents otherwise. Absent placeholder nodes
/// are never returned as entries.
pub trait GraphIndex: Send + Sync {
    /// Number of real nodes in the index.
    fn key_count(&self) -> Result<u64>;

    /// Every real entry.
    fn iter_all_entries(&self) -> Result<Vec<Entry>>;

    /// Entries for the requested keys; at most one entry per distinct key,
    /// and no entries beyond the requested set.
    fn iter_entries(&self, keys: &[Key]) -> Result<Vec<Entry>>;

    /// Entries whose keys match the given patterns (exact elements plus
    /// trailing wildcards).
    fn iter_entries_prefix(&self, prefixes: &[PrefixKey]) -> Result<Vec<Entry>>;

    /// Fully parses the index and checks its structural integrity.
    fn validate(&self) -> Result<()>;

    /// Drops memoized state. The index stays usable; subsequent reads
    /// rebuild whatever they need.
    fn clear_cache(&self);

    /// One ancestry expansion restricted to this index.
    ///
    /// Looks up `keys`, records each found key's `ref_list_num` list in
    /// `parent_map` and each key found nowhere in `missing_keys`, and
    /// returns the newly discovered parents not yet in `parent_map` for the
    /// caller to continue with (possibly against another index).
    fn find_ancestors(
        &self,
        keys: &[Key],
        ref_list_num: usize,
        parent_map: &mut ParentMap,
        missing_keys: &mut FxHashSet<Key>,
    ) -> Result<FxHashSet<Key>> {
        let mut found: FxHashSet<Key> = FxHashSet::default();
        let mut search: FxHashSet<Key> = FxHashSet::default();
        for entry in self.iter_entries(keys)? {
            let parents = entry.refs.get(ref_list_num).cloned().ok_or_else(|| {
                TesseraError::BadOptions(format!(
                    "no reference list {ref_list_num} in this index"
                ))
            })?;
            search.extend(parents.iter().cloned());
            found.insert(entry.key.clone());
            parent_map.insert(entry.key, parents);
        }
        for key in keys {
            if !found.contains(key) {
                missing_keys.insert(key.clone());
            }
        }
        search.retain(|key| !parent_map.contains_key(key));
        Ok(search)
    }
}
