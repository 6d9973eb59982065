//! Accumulation and one-shot serialization of an index.
//!
//! [`NodeStore`] keeps validated nodes in key order and is shared with the
//! in-memory index; [`IndexWriter`] wraps it with the serialization pass
//! that lays out node lines and resolves references to byte offsets.

use std::collections::BTreeMap;

use bytes::Bytes;
use rustc_hash::{FxHashMap, FxHashSet};
use smallvec::SmallVec;
use tracing::debug;

use crate::error::{Result, TesseraError};
use crate::format::{encode_header, ABSENT_MARKER, LIST_SEP, REF_SEP};
use crate::key::{check_key, check_value, Key};

/// Content of one stored node.
#[derive(Clone, Debug)]
pub(crate) enum NodeContent {
    /// Placeholder for a key that is referenced but was never added.
    Absent,
    /// A key added with real content.
    Real {
        value: Bytes,
        refs: Vec<Vec<Key>>,
    },
}

impl NodeContent {
    pub(crate) fn is_absent(&self) -> bool {
        matches!(self, NodeContent::Absent)
    }
}

/// Validated nodes in ascending key order.
pub(crate) struct NodeStore {
    node_ref_lists: usize,
    key_elements: usize,
    nodes: BTreeMap<Key, NodeContent>,
    absent_keys: FxHashSet<Key>,
}

impl NodeStore {
    pub(crate) fn new(node_ref_lists: usize, key_elements: usize) -> Self {
        NodeStore {
            node_ref_lists,
            key_elements,
            nodes: BTreeMap::new(),
            absent_keys: FxHashSet::default(),
        }
    }

    pub(crate) fn node_ref_lists(&self) -> usize {
        self.node_ref_lists
    }

    pub(crate) fn key_elements(&self) -> usize {
        self.key_elements
    }

    /// Number of real nodes (absent placeholders excluded).
    pub(crate) fn key_count(&self) -> u64 {
        (self.nodes.len() - self.absent_keys.len()) as u64
    }

    pub(crate) fn get(&self, key: &Key) -> Option<&NodeContent> {
        self.nodes.get(key)
    }

    pub(crate) fn nodes(&self) -> impl Iterator<Item = (&Key, &NodeContent)> {
        self.nodes.iter()
    }

    /// Nodes from `start` onward in key order.
    pub(crate) fn nodes_from(&self, start: &Key) -> impl Iterator<Item = (&Key, &NodeContent)> {
        self.nodes.range(start.clone()..)
    }

    /// Validates and stores a node, materializing placeholders for any
    /// referenced keys not yet present. Promotion of a placeholder to a
    /// real node is allowed; adding a real key twice is not.
    pub(crate) fn add_node(&mut self, key: Key, value: Bytes, refs: Vec<Vec<Key>>) -> Result<()> {
        check_key(&key, self.key_elements)?;
        check_value(&value)?;
        if refs.len() != self.node_ref_lists {
            return Err(TesseraError::BadValue(format!(
                "{} reference lists supplied for {key:?}, index expects {}",
                refs.len(),
                self.node_ref_lists
            )));
        }
        let mut absent_refs: Vec<Key> = Vec::new();
        for list in &refs {
            for reference in list {
                // Keys already stored were validated when they arrived.
                if !self.nodes.contains_key(reference) {
                    check_key(reference, self.key_elements)?;
                    absent_refs.push(reference.clone());
                }
            }
        }
        if matches!(self.nodes.get(&key), Some(content) if !content.is_absent()) {
            return Err(TesseraError::DuplicateKey(format!("{key:?}")));
        }
        for reference in absent_refs {
            self.absent_keys.insert(reference.clone());
            self.nodes.insert(reference, NodeContent::Absent);
        }
        self.absent_keys.remove(&key);
        self.nodes.insert(key, NodeContent::Real { value, refs });
        Ok(())
    }
}

struct LayoutNode {
    /// Line length excluding the rendered reference digits.
    fixed_len: usize,
    /// Per reference list, the indices of the referenced nodes.
    ref_targets: SmallVec<[Vec<usize>; 2]>,
}

fn decimal_width(mut n: u64) -> u64 {
    let mut width = 1;
    while n >= 10 {
        n /= 10;
        width += 1;
    }
    width
}

/// Builds an immutable serialized index.
///
/// Nodes are accumulated with [`IndexWriter::add_node`] and serialized
/// exactly once by [`IndexWriter::finish`]; the writer rejects use after
/// finishing.
pub struct IndexWriter {
    store: NodeStore,
    finished: bool,
}

impl IndexWriter {
    /// Creates a writer for an index with the given shape.
    pub fn new(node_ref_lists: usize, key_elements: usize) -> Self {
        IndexWriter {
            store: NodeStore::new(node_ref_lists, key_elements),
            finished: false,
        }
    }

    /// Reference lists every node carries.
    pub fn node_ref_lists(&self) -> usize {
        self.store.node_ref_lists()
    }

    /// Elements in every key.
    pub fn key_elements(&self) -> usize {
        self.store.key_elements()
    }

    /// Adds a node. Validation failures reject this call only; the writer
    /// stays usable.
    pub fn add_node(&mut self, key: Key, value: impl Into<Bytes>, refs: Vec<Vec<Key>>) -> Result<()> {
        if self.finished {
            return Err(TesseraError::BadOptions(
                "writer already finished".to_string(),
            ));
        }
        self.store.add_node(key, value.into(), refs)
    }

    /// Serializes the index and freezes the writer.
    ///
    /// Reference fields render a target node's absolute byte offset in
    /// natural decimal, so the layout is found iteratively: line lengths
    /// assume current digit widths, offsets follow from line lengths, and
    /// widths are recomputed from offsets until none changes. Widths only
    /// grow and are bounded by the file size, so the loop converges.
    pub fn finish(&mut self) -> Result<Bytes> {
        if self.finished {
            return Err(TesseraError::BadOptions(
                "writer already finished".to_string(),
            ));
        }
        self.finished = true;
        let header = encode_header(
            self.store.node_ref_lists(),
            self.store.key_elements(),
            self.store.key_count(),
        );
        let nodes: Vec<(&Key, &NodeContent)> = self.store.nodes().collect();
        let position: FxHashMap<&Key, usize> = nodes
            .iter()
            .enumerate()
            .map(|(i, (key, _))| (*key, i))
            .collect();
        let mut layout = Vec::with_capacity(nodes.len());
        for (key, content) in &nodes {
            let mut fixed_len = key.encoded_len() + 3 + 1;
            let mut ref_targets: SmallVec<[Vec<usize>; 2]> = SmallVec::new();
            match content {
                NodeContent::Absent => {
                    fixed_len += 1;
                }
                NodeContent::Real { value, refs } => {
                    fixed_len += value.len();
                    fixed_len += refs.len().saturating_sub(1);
                    for list in refs {
                        fixed_len += list.len().saturating_sub(1);
                        let mut targets = Vec::with_capacity(list.len());
                        for reference in list {
                            let target = position.get(reference).ok_or_else(|| {
                                TesseraError::BadIndexData(format!(
                                    "reference {reference:?} missing during serialization"
                                ))
                            })?;
                            targets.push(*target);
                        }
                        ref_targets.push(targets);
                    }
                }
            }
            layout.push(LayoutNode {
                fixed_len,
                ref_targets,
            });
        }

        let mut widths: Vec<u64> = vec![1; layout.len()];
        let mut offsets: Vec<u64> = vec![0; layout.len()];
        let mut expected_len;
        let mut passes = 0u32;
        loop {
            passes += 1;
            let mut pos = header.len() as u64;
            for (i, node) in layout.iter().enumerate() {
                offsets[i] = pos;
                let ref_digits: u64 = node
                    .ref_targets
                    .iter()
                    .flatten()
                    .map(|target| widths[*target])
                    .sum();
                pos += node.fixed_len as u64 + ref_digits;
            }
            expected_len = pos + 1;
            let mut changed = false;
            for (i, width) in widths.iter_mut().enumerate() {
                let rendered = decimal_width(offsets[i]);
                if rendered != *width {
                    *width = rendered;
                    changed = true;
                }
            }
            if !changed {
                break;
            }
        }

        let mut out = header;
        out.reserve(expected_len as usize - out.len());
        for (i, (key, content)) in nodes.iter().enumerate() {
            for (j, element) in key.elements().iter().enumerate() {
                if j > 0 {
                    out.push(0);
                }
                out.extend_from_slice(element);
            }
            out.push(0);
            match content {
                NodeContent::Absent => {
                    out.push(ABSENT_MARKER);
                    out.push(0);
                    out.push(0);
                }
                NodeContent::Real { value, .. } => {
                    out.push(0);
                    for (li, list) in layout[i].ref_targets.iter().enumerate() {
                        if li > 0 {
                            out.push(LIST_SEP);
                        }
                        for (ri, target) in list.iter().enumerate() {
                            if ri > 0 {
                                out.push(REF_SEP);
                            }
                            out.extend_from_slice(offsets[*target].to_string().as_bytes());
                        }
                    }
                    out.push(0);
                    out.extend_from_slice(value);
                }
            }
            out.push(b'\n');
        }
        out.push(b'\n');
        if out.len() as u64 != expected_len {
            return Err(TesseraError::BadIndexData(format!(
                "serialized {} bytes where layout predicted {expected_len}",
                out.len()
            )));
        }
        debug!(
            nodes = nodes.len(),
            passes,
            bytes = out.len(),
            "writer.finish"
        );
        Ok(Bytes::from(out))
    }
}
