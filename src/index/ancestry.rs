//! Breadth-first ancestry resolution across a combined index.
//!
//! Each member index can walk a whole reachable closure by itself through
//! repeated [`find_ancestors`](super::GraphIndex::find_ancestors) calls; the
//! walker stitches those per-member walks together so a parent chain may hop
//! between physical files without re-deriving ancestors that are already
//! known.

use rustc_hash::FxHashSet;
use tracing::trace;

use crate::error::Result;
use crate::index::combined::CombinedIndex;
use crate::index::ParentMap;
use crate::key::Key;

/// Outcome of an ancestry walk.
#[derive(Debug, Default, Clone)]
pub struct Ancestry {
    /// Key to its parents, for every key the walk reached.
    pub parent_map: ParentMap,
    /// Keys that were referenced (or asked for) but found in no member.
    pub missing_keys: FxHashSet<Key>,
}

/// Walks parent references outward from a set of start keys.
///
/// One generation resolves the current frontier: every member is given the
/// keys its predecessors could not find and expands as far as it can on its
/// own. Keys no member knows become missing; keys discovered too late for
/// the earlier members to see are carried into the next generation.
pub struct AncestryWalker<'a> {
    combined: &'a CombinedIndex,
    ref_list_num: usize,
}

impl<'a> AncestryWalker<'a> {
    /// A walker over `combined` following the given reference list.
    pub fn new(combined: &'a CombinedIndex, ref_list_num: usize) -> Self {
        AncestryWalker {
            combined,
            ref_list_num,
        }
    }

    /// Resolves the complete ancestry closure of `keys`.
    pub fn walk(&self, keys: &[Key]) -> Result<Ancestry> {
        let mut parent_map = ParentMap::default();
        let mut missing_keys: FxHashSet<Key> = FxHashSet::default();
        let mut frontier: FxHashSet<Key> = keys.iter().cloned().collect();
        let mut reloaded = false;
        let mut generations = 0u64;
        'generations: while !frontier.is_empty() {
            generations += 1;
            let members = self.combined.members_snapshot();
            let mut lookup = frontier.clone();
            // Keys every member missed this generation; None until the
            // first member reports.
            let mut all_members_missing: Option<FxHashSet<Key>> = None;
            for (_, index) in &members {
                let mut member_missing: FxHashSet<Key> = FxHashSet::default();
                let mut search_keys: Vec<Key> = lookup.iter().cloned().collect();
                while !search_keys.is_empty() {
                    let found = match index.find_ancestors(
                        &search_keys,
                        self.ref_list_num,
                        &mut parent_map,
                        &mut member_missing,
                    ) {
                        Ok(parents) => parents,
                        Err(err) => {
                            self.combined.try_reload(err, &mut reloaded)?;
                            continue 'generations;
                        }
                    };
                    search_keys = found.into_iter().collect();
                }
                match all_members_missing.as_mut() {
                    None => all_members_missing = Some(member_missing.clone()),
                    Some(shared) => shared.retain(|key| member_missing.contains(key)),
                }
                // Whatever this member missed is the next member's problem.
                lookup = member_missing;
                if lookup.is_empty() {
                    break;
                }
            }
            match all_members_missing {
                None => {
                    // No members at all; every requested key is missing.
                    missing_keys.extend(lookup);
                    frontier.clear();
                }
                Some(shared) => {
                    for key in &shared {
                        lookup.remove(key);
                    }
                    missing_keys.extend(shared);
                    frontier = lookup;
                }
            }
        }
        trace!(
            generations,
            found = parent_map.len(),
            missing = missing_keys.len(),
            "ancestry.walk"
        );
        Ok(Ancestry {
            parent_map,
            missing_keys,
        })
    }
}
