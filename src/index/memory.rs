//! Mutable index held entirely in memory.
//!
//! Used to stage nodes before they are serialized, and as a front member of
//! a combined view so freshly added nodes shadow older serialized indices.

use bytes::Bytes;
use parking_lot::RwLock;
use rustc_hash::FxHashSet;

use crate::error::{Result, TesseraError};
use crate::index::builder::{NodeContent, NodeStore};
use crate::index::{Entry, GraphIndex};
use crate::key::{Key, PrefixKey};

fn entry_for(key: &Key, content: &NodeContent) -> Option<Entry> {
    match content {
        NodeContent::Real { value, refs } => Some(Entry {
            key: key.clone(),
            value: value.clone(),
            refs: refs.clone(),
        }),
        NodeContent::Absent => None,
    }
}

/// A mutable [`GraphIndex`] with the writer's validation rules.
///
/// Insertion takes `&self` so an index shared through an [`Arc`] with a
/// combined view can still accept nodes.
///
/// [`Arc`]: std::sync::Arc
pub struct InMemoryIndex {
    store: RwLock<NodeStore>,
}

impl InMemoryIndex {
    /// Creates an empty index with the given shape.
    pub fn new(node_ref_lists: usize, key_elements: usize) -> Self {
        InMemoryIndex {
            store: RwLock::new(NodeStore::new(node_ref_lists, key_elements)),
        }
    }

    /// Reference lists every node carries.
    pub fn node_ref_lists(&self) -> usize {
        self.store.read().node_ref_lists()
    }

    /// Elements in every key.
    pub fn key_elements(&self) -> usize {
        self.store.read().key_elements()
    }

    /// Adds one node, validating like the writer does.
    pub fn add_node(&self, key: Key, value: impl Into<Bytes>, refs: Vec<Vec<Key>>) -> Result<()> {
        self.store.write().add_node(key, value.into(), refs)
    }

    /// Adds nodes in bulk under one lock acquisition. Stops at the first
    /// invalid entry; entries before it stay added.
    pub fn add_nodes(&self, entries: impl IntoIterator<Item = Entry>) -> Result<()> {
        let mut store = self.store.write();
        for entry in entries {
            store.add_node(entry.key, entry.value, entry.refs)?;
        }
        Ok(())
    }

    /// Keys referenced from list `ref_list_num` that have no real node
    /// here, absent placeholders included.
    pub fn external_references(&self, ref_list_num: usize) -> Result<FxHashSet<Key>> {
        let store = self.store.read();
        if ref_list_num >= store.node_ref_lists() {
            return Err(TesseraError::BadOptions(format!(
                "no reference list {ref_list_num}, index has {}",
                store.node_ref_lists()
            )));
        }
        let mut external = FxHashSet::default();
        for (_, content) in store.nodes() {
            if let NodeContent::Real { refs, .. } = content {
                for reference in &refs[ref_list_num] {
                    match store.get(reference) {
                        Some(content) if !content.is_absent() => {}
                        _ => {
                            external.insert(reference.clone());
                        }
                    }
                }
            }
        }
        Ok(external)
    }
}

impl GraphIndex for InMemoryIndex {
    fn key_count(&self) -> Result<u64> {
        Ok(self.store.read().key_count())
    }

    fn iter_all_entries(&self) -> Result<Vec<Entry>> {
        let store = self.store.read();
        Ok(store
            .nodes()
            .filter_map(|(key, content)| entry_for(key, content))
            .collect())
    }

    fn iter_entries(&self, keys: &[Key]) -> Result<Vec<Entry>> {
        let store = self.store.read();
        let mut seen: FxHashSet<&Key> = FxHashSet::default();
        let mut entries = Vec::new();
        for key in keys {
            if !seen.insert(key) {
                continue;
            }
            if let Some(content) = store.get(key) {
                if let Some(entry) = entry_for(key, content) {
                    entries.push(entry);
                }
            }
        }
        Ok(entries)
    }

    fn iter_entries_prefix(&self, prefixes: &[PrefixKey]) -> Result<Vec<Entry>> {
        let store = self.store.read();
        let arity = store.key_elements();
        let mut seen: FxHashSet<&PrefixKey> = FxHashSet::default();
        let mut entries = Vec::new();
        for prefix in prefixes {
            if !seen.insert(prefix) {
                continue;
            }
            prefix.check(arity)?;
            if let Some(key) = prefix.as_exact_key() {
                if let Some(content) = store.get(&key) {
                    if let Some(entry) = entry_for(&key, content) {
                        entries.push(entry);
                    }
                }
                continue;
            }
            let concrete: Vec<Bytes> = prefix.concrete_elements().cloned().collect();
            let start = Key::new(concrete.iter().cloned());
            for (key, content) in store.nodes_from(&start) {
                if !key.starts_with(&concrete) {
                    break;
                }
                if let Some(entry) = entry_for(key, content) {
                    entries.push(entry);
                }
            }
        }
        Ok(entries)
    }

    fn validate(&self) -> Result<()> {
        // Nothing to check that insertion did not already enforce.
        Ok(())
    }

    fn clear_cache(&self) {}
}
