//! Namespace adapter between indices of different key arities.
//!
//! Several logical indices can share one physical file by reserving a fixed
//! leading key element per namespace. The adapter exposes one namespace at
//! the shorter arity: reads are forwarded with the prefix prepended and the
//! results translated back, writes go through a callback with the prefix
//! added to keys and references alike.

use std::fmt;
use std::sync::Arc;

use bytes::Bytes;

use crate::error::{Result, TesseraError};
use crate::index::{Entry, GraphIndex};
use crate::key::{Key, PrefixKey};

/// Callback handed the translated nodes when writing through the adapter.
pub type AddCallback = Box<dyn Fn(Vec<Entry>) -> Result<()> + Send + Sync>;

/// Exposes the keys under one fixed prefix of a wider-arity index, with the
/// prefix stripped.
pub struct PrefixAdapter {
    adapted: Arc<dyn GraphIndex>,
    prefix: Key,
    /// The namespace at the adapted index's arity: the prefix followed by
    /// wildcards for every exposed position.
    namespace: PrefixKey,
    add_callback: Option<AddCallback>,
}

impl PrefixAdapter {
    /// A read-only adapter exposing the keys under `prefix` in `adapted`,
    /// each `missing_key_elements` elements long.
    pub fn new(adapted: Arc<dyn GraphIndex>, prefix: Key, missing_key_elements: usize) -> Self {
        let namespace =
            PrefixKey::with_wildcards(prefix.elements().iter().cloned(), missing_key_elements);
        PrefixAdapter {
            adapted,
            prefix,
            namespace,
            add_callback: None,
        }
    }

    /// Like [`PrefixAdapter::new`], with a callback that accepts writes made
    /// through the adapter.
    pub fn with_callback(
        adapted: Arc<dyn GraphIndex>,
        prefix: Key,
        missing_key_elements: usize,
        add_callback: AddCallback,
    ) -> Self {
        let mut adapter = Self::new(adapted, prefix, missing_key_elements);
        adapter.add_callback = Some(add_callback);
        adapter
    }

    /// Adds a node through the write callback.
    ///
    /// `key` and every reference are given in the exposed short form; the
    /// namespace prefix is prepended before they reach the backing index.
    pub fn add_node(&self, key: Key, value: impl Into<Bytes>, refs: Vec<Vec<Key>>) -> Result<()> {
        self.add_nodes([Entry::with_refs(key, value, refs)])
    }

    /// Adds nodes through the write callback, translating keys and
    /// references into the adapted namespace.
    pub fn add_nodes(&self, entries: impl IntoIterator<Item = Entry>) -> Result<()> {
        let callback = self.add_callback.as_ref().ok_or_else(|| {
            TesseraError::BadOptions("this adapter was built without a write callback".to_owned())
        })?;
        let prefix = self.prefix.elements();
        let translated: Vec<Entry> = entries
            .into_iter()
            .map(|entry| Entry {
                key: entry.key.prepend(prefix),
                value: entry.value,
                refs: entry
                    .refs
                    .into_iter()
                    .map(|list| {
                        list.into_iter()
                            .map(|reference| reference.prepend(prefix))
                            .collect()
                    })
                    .collect(),
            })
            .collect();
        callback(translated)
    }

    /// Translates one entry of the backing index into the exposed namespace.
    ///
    /// The entry's key and references must all carry the prefix; anything
    /// else means the namespaces were mixed up on disk.
    fn strip_entry(&self, entry: Entry) -> Result<Entry> {
        let prefix = self.prefix.elements();
        if !entry.key.starts_with(prefix) {
            return Err(TesseraError::BadIndexData(format!(
                "key {:?} lies outside the {:?} namespace",
                entry.key, self.prefix
            )));
        }
        let mut refs = Vec::with_capacity(entry.refs.len());
        for ref_list in &entry.refs {
            let mut stripped = Vec::with_capacity(ref_list.len());
            for reference in ref_list {
                if !reference.starts_with(prefix) {
                    return Err(TesseraError::BadIndexData(format!(
                        "reference {:?} lies outside the {:?} namespace",
                        reference, self.prefix
                    )));
                }
                stripped.push(reference.strip_front(prefix.len()));
            }
            refs.push(stripped);
        }
        Ok(Entry {
            key: entry.key.strip_front(prefix.len()),
            value: entry.value,
            refs,
        })
    }
}

impl GraphIndex for PrefixAdapter {
    /// Exact, but obtained by iterating the whole namespace.
    fn key_count(&self) -> Result<u64> {
        Ok(self.iter_all_entries()?.len() as u64)
    }

    fn iter_all_entries(&self) -> Result<Vec<Entry>> {
        self.adapted
            .iter_entries_prefix(&[self.namespace.clone()])?
            .into_iter()
            .map(|entry| self.strip_entry(entry))
            .collect()
    }

    fn iter_entries(&self, keys: &[Key]) -> Result<Vec<Entry>> {
        let prefix = self.prefix.elements();
        let widened: Vec<Key> = keys.iter().map(|key| key.prepend(prefix)).collect();
        self.adapted
            .iter_entries(&widened)?
            .into_iter()
            .map(|entry| self.strip_entry(entry))
            .collect()
    }

    fn iter_entries_prefix(&self, prefixes: &[PrefixKey]) -> Result<Vec<Entry>> {
        let prefix = self.prefix.elements();
        let widened: Vec<PrefixKey> = prefixes
            .iter()
            .map(|pattern| pattern.prepend(prefix))
            .collect();
        self.adapted
            .iter_entries_prefix(&widened)?
            .into_iter()
            .map(|entry| self.strip_entry(entry))
            .collect()
    }

    fn validate(&self) -> Result<()> {
        self.adapted.validate()
    }

    fn clear_cache(&self) {
        self.adapted.clear_cache()
    }
}

impl fmt::Debug for PrefixAdapter {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("PrefixAdapter")
            .field("prefix", &self.prefix)
            .finish_non_exhaustive()
    }
}
