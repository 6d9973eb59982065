//! A merged read view over an ordered list of member indices.
//!
//! Members are queried front to back and earlier members shadow later ones
//! on duplicate keys. The member order is mutable: queries promote the
//! members that answered them, and a reload callback may replace the whole
//! list when a backing file vanishes under a concurrent repack.

use std::fmt;
use std::sync::{Arc, Weak};

use parking_lot::RwLock;
use rustc_hash::FxHashSet;
use tracing::{debug, trace};

use crate::error::{Result, TesseraError};
use crate::index::ancestry::{Ancestry, AncestryWalker};
use crate::index::{Entry, GraphIndex};
use crate::key::{Key, PrefixKey};

/// One member of a [`CombinedIndex`]: an optional name (typically the pack
/// file the index belongs to) and the index itself.
pub type Member = (Option<String>, Arc<dyn GraphIndex>);

/// Callback that rebuilds the member list after a backing file vanished.
///
/// `Ok(Some(members))` installs the new list and lets the in-flight
/// operation resume; `Ok(None)` means nothing changed on disk, so the
/// original error stands.
pub type ReloadFunc = Box<dyn Fn() -> Result<Option<Vec<Member>>> + Send + Sync>;

/// Several indices presented as one logical index.
///
/// Queries run against the first member, then the second and so on, so the
/// order matters for performance. Queries tend to need the same members as
/// their predecessors; after each query the members that held results move
/// to the front of the list, keeping relative order otherwise.
pub struct CombinedIndex {
    members: RwLock<Vec<Member>>,
    reload_func: Option<ReloadFunc>,
    /// Sibling views promoted by name whenever this view reorders itself.
    siblings: RwLock<Vec<Weak<CombinedIndex>>>,
}

impl CombinedIndex {
    /// A combined view over `members`, queried in order.
    pub fn new(members: Vec<Member>) -> Self {
        CombinedIndex {
            members: RwLock::new(members),
            reload_func: None,
            siblings: RwLock::new(Vec::new()),
        }
    }

    /// Like [`CombinedIndex::new`], with a reload callback to invoke when a
    /// member's backing file vanishes mid-operation.
    pub fn with_reload(members: Vec<Member>, reload_func: ReloadFunc) -> Self {
        CombinedIndex {
            members: RwLock::new(members),
            reload_func: Some(reload_func),
            siblings: RwLock::new(Vec::new()),
        }
    }

    /// Inserts a member at `pos` in the query order.
    ///
    /// Names let related views mirror each other's reorderings; siblings
    /// must agree on the naming scheme for that to work.
    pub fn insert_index(&self, pos: usize, name: Option<String>, index: Arc<dyn GraphIndex>) {
        self.members.write().insert(pos, (name, index));
    }

    /// Member names in the current query order.
    pub fn member_names(&self) -> Vec<Option<String>> {
        self.members.read().iter().map(|(name, _)| name.clone()).collect()
    }

    /// Wires other views whose member order should follow this one's
    /// hit-promotion, matched by member name.
    pub fn set_sibling_indices(&self, siblings: Vec<Weak<CombinedIndex>>) {
        *self.siblings.write() = siblings;
    }

    /// Resolves the full ancestry closure of `keys` over one reference list.
    ///
    /// This is a whole-ancestry request; use it sparingly.
    pub fn find_ancestry(&self, keys: &[Key], ref_list_num: usize) -> Result<Ancestry> {
        AncestryWalker::new(self, ref_list_num).walk(keys)
    }

    pub(super) fn members_snapshot(&self) -> Vec<Member> {
        self.members.read().clone()
    }

    /// Decides whether an in-flight operation may retry after `err`.
    ///
    /// `Ok(())` means the member list was replaced and the caller should
    /// re-scan; any other outcome re-raises. At most one reload is attempted
    /// per operation, so a store that stays broken cannot loop.
    pub(super) fn try_reload(&self, err: TesseraError, attempted: &mut bool) -> Result<()> {
        if !err.is_reloadable() || *attempted {
            return Err(err);
        }
        let Some(reload) = self.reload_func.as_ref() else {
            return Err(err);
        };
        *attempted = true;
        debug!(error = %err, "combined.reload");
        match reload()? {
            Some(members) => {
                debug!(members = members.len(), "combined.reload swapped members");
                *self.members.write() = members;
                Ok(())
            }
            None => {
                debug!("combined.reload reported no change");
                Err(err)
            }
        }
    }

    /// Moves the members in `hits` to the front of the query order.
    ///
    /// The promoted members keep the relative order they currently hold, as
    /// do the rest. Promotions propagate to sibling views by name.
    fn move_to_front(&self, hits: &[Arc<dyn GraphIndex>]) {
        if hits.is_empty() {
            return;
        }
        let hit_names = {
            let mut members = self.members.write();
            let already_front = members.len() >= hits.len()
                && members
                    .iter()
                    .zip(hits)
                    .all(|((_, member), hit)| Arc::ptr_eq(member, hit));
            if already_front {
                return;
            }
            Self::promote(&mut members, hits)
        };
        trace!(?hit_names, "combined.promote");
        for sibling in self.siblings.read().iter() {
            if let Some(sibling) = sibling.upgrade() {
                sibling.move_to_front_by_name(&hit_names);
            }
        }
    }

    /// Promotes the members named in `hit_names`, without cascading further.
    fn move_to_front_by_name(&self, hit_names: &[Option<String>]) {
        let mut members = self.members.write();
        let hits: Vec<Arc<dyn GraphIndex>> = members
            .iter()
            .filter(|(name, _)| hit_names.contains(name))
            .map(|(_, index)| Arc::clone(index))
            .collect();
        if hits.is_empty() {
            return;
        }
        Self::promote(&mut members, &hits);
    }

    /// Partitions `members` into hit and unhit runs, hits first, and returns
    /// the names of the hits in their promoted order.
    fn promote(members: &mut Vec<Member>, hits: &[Arc<dyn GraphIndex>]) -> Vec<Option<String>> {
        let mut promoted = Vec::with_capacity(members.len());
        let mut rest = Vec::new();
        let mut hit_names = Vec::with_capacity(hits.len());
        for member in std::mem::take(members) {
            if hits.iter().any(|hit| Arc::ptr_eq(&member.1, hit)) {
                hit_names.push(member.0.clone());
                promoted.push(member);
            } else {
                rest.push(member);
            }
        }
        promoted.append(&mut rest);
        *members = promoted;
        hit_names
    }
}

impl GraphIndex for CombinedIndex {
    /// Sums the members' counts. Duplicate keys across members are shadowed
    /// at read time but still counted per member, matching the on-disk
    /// accounting used for size estimates.
    fn key_count(&self) -> Result<u64> {
        let mut reloaded = false;
        'retry: loop {
            let mut total = 0u64;
            for (_, index) in &self.members_snapshot() {
                match index.key_count() {
                    Ok(count) => total += count,
                    Err(err) => {
                        self.try_reload(err, &mut reloaded)?;
                        continue 'retry;
                    }
                }
            }
            return Ok(total);
        }
    }

    fn iter_all_entries(&self) -> Result<Vec<Entry>> {
        let mut entries = Vec::new();
        let mut seen: FxHashSet<Key> = FxHashSet::default();
        let mut reloaded = false;
        'retry: loop {
            for (_, index) in &self.members_snapshot() {
                match index.iter_all_entries() {
                    Ok(found) => {
                        for entry in found {
                            if seen.insert(entry.key.clone()) {
                                entries.push(entry);
                            }
                        }
                    }
                    Err(err) => {
                        self.try_reload(err, &mut reloaded)?;
                        continue 'retry;
                    }
                }
            }
            return Ok(entries);
        }
    }

    fn iter_entries(&self, keys: &[Key]) -> Result<Vec<Entry>> {
        let mut remaining: FxHashSet<Key> = keys.iter().cloned().collect();
        let mut entries = Vec::new();
        let mut hits: Vec<Arc<dyn GraphIndex>> = Vec::new();
        let mut reloaded = false;
        'retry: loop {
            for (_, index) in &self.members_snapshot() {
                if remaining.is_empty() {
                    break;
                }
                let wanted: Vec<Key> = remaining.iter().cloned().collect();
                match index.iter_entries(&wanted) {
                    Ok(found) => {
                        if found.is_empty() {
                            continue;
                        }
                        for entry in &found {
                            remaining.remove(&entry.key);
                        }
                        entries.extend(found);
                        if !hits.iter().any(|hit| Arc::ptr_eq(hit, index)) {
                            hits.push(Arc::clone(index));
                        }
                    }
                    Err(err) => {
                        self.try_reload(err, &mut reloaded)?;
                        continue 'retry;
                    }
                }
            }
            break;
        }
        self.move_to_front(&hits);
        Ok(entries)
    }

    fn iter_entries_prefix(&self, prefixes: &[PrefixKey]) -> Result<Vec<Entry>> {
        let mut unique: Vec<PrefixKey> = Vec::new();
        let mut distinct: FxHashSet<&PrefixKey> = FxHashSet::default();
        for prefix in prefixes {
            if distinct.insert(prefix) {
                unique.push(prefix.clone());
            }
        }
        if unique.is_empty() {
            return Ok(Vec::new());
        }
        let mut entries = Vec::new();
        let mut seen: FxHashSet<Key> = FxHashSet::default();
        let mut hits: Vec<Arc<dyn GraphIndex>> = Vec::new();
        let mut reloaded = false;
        'retry: loop {
            for (_, index) in &self.members_snapshot() {
                match index.iter_entries_prefix(&unique) {
                    Ok(found) => {
                        let mut index_hit = false;
                        for entry in found {
                            if seen.insert(entry.key.clone()) {
                                entries.push(entry);
                                index_hit = true;
                            }
                        }
                        if index_hit && !hits.iter().any(|hit| Arc::ptr_eq(hit, index)) {
                            hits.push(Arc::clone(index));
                        }
                    }
                    Err(err) => {
                        self.try_reload(err, &mut reloaded)?;
                        continue 'retry;
                    }
                }
            }
            break;
        }
        self.move_to_front(&hits);
        Ok(entries)
    }

    fn validate(&self) -> Result<()> {
        let mut reloaded = false;
        'retry: loop {
            for (_, index) in &self.members_snapshot() {
                if let Err(err) = index.validate() {
                    self.try_reload(err, &mut reloaded)?;
                    continue 'retry;
                }
            }
            return Ok(());
        }
    }

    fn clear_cache(&self) {
        for (_, index) in &self.members_snapshot() {
            index.clear_cache();
        }
    }
}

impl fmt::Debug for CombinedIndex {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("CombinedIndex")
            .field("members", &self.member_names())
            .finish_non_exhaustive()
    }
}
