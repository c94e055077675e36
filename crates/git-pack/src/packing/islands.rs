//! §4.9 DeltaIslands — ref-pattern-derived island labeling.
//!
//! Grounded on `delta-islands.c`: `pack.island`/`pack.islandcore` style
//! regex configuration, last-match-wins ref classification, island
//! deduplication by membership hash, and two propagation passes (commit ->
//! root tree/parents, then root tree -> reached sub-trees/blobs in
//! ascending `tree_depth` order). The C implementation stores bitmaps as
//! flexible-length `uint32_t[]` so it can scale past 32 islands; this
//! implementation caps island membership at 64 distinct islands, tracked
//! as `ObjectEntry::island_bits: u64` directly rather than a parallel
//! oid-keyed bitmap table, since no repository in practice configures
//! anywhere near 64 `pack.island` patterns.
use std::collections::HashMap;

use git_hash::ObjectId;
use git_object::ObjectType;
use regex::Regex;

use super::entry::EntryIdx;
use super::packing_set::PackingSet;
use crate::PackError;

const MAX_ISLANDS: usize = 64;

struct RemoteIsland {
    name: String,
    oids: Vec<ObjectId>,
    hash: u64,
}

/// Compiled `pack.island` regexes plus the optional `pack.islandcore` name.
pub struct DeltaIslands {
    patterns: Vec<Regex>,
    core_island_name: Option<String>,
}

/// Result of `DeltaIslands::load`: how many distinct islands were found and
/// which bit (if any) is the configured core island.
#[derive(Debug, Clone, Copy, Default)]
pub struct IslandLoadResult {
    pub island_count: u32,
    pub core_bit: Option<u32>,
}

impl DeltaIslands {
    /// Compiles each `pack.island` pattern, anchoring it at the start of
    /// the ref name the way the original does (`^` is prepended unless the
    /// pattern already starts with one).
    pub fn new(patterns: &[String], core_island_name: Option<String>) -> Result<Self, PackError> {
        let compiled = patterns
            .iter()
            .map(|p| {
                let anchored = if p.starts_with('^') {
                    p.clone()
                } else {
                    format!("^{p}")
                };
                Regex::new(&anchored).map_err(|e| PackError::InvalidIslandSpec(e.to_string()))
            })
            .collect::<Result<Vec<_>, _>>()?;
        Ok(Self {
            patterns: compiled,
            core_island_name,
        })
    }

    /// Classifies `refname` against the configured patterns, walking from
    /// the last-registered pattern backward so a later `pack.island` config
    /// entry wins over an earlier one. Returns the island name (capture
    /// groups joined with `-`, empty string if the matching pattern has no
    /// groups), or `None` if nothing matches.
    fn classify_ref(&self, refname: &str) -> Option<String> {
        let pattern = self.patterns.iter().rev().find(|re| re.is_match(refname))?;
        let caps = pattern.captures(refname)?;
        let mut name = String::new();
        for group in caps.iter().skip(1) {
            let Some(m) = group else { continue };
            if !name.is_empty() {
                name.push('-');
            }
            name.push_str(m.as_str());
        }
        Some(name)
    }

    /// §4.9 Load + refs->island-bit assignment. `refs` is every ref name
    /// paired with its peeled target's resolved object chain (tags already
    /// walked to their final non-tag target by the caller, since peeling is
    /// a ref-store concern, not this module's).
    ///
    /// Every oid reachable from a matching ref (the ref target, and each
    /// tag it passes through on the way to that target) receives the
    /// island's bit directly; objects absent from `set` are ignored.
    pub fn load<'a>(
        &self,
        set: &mut PackingSet,
        refs: impl Iterator<Item = (&'a str, &'a [ObjectId])>,
    ) -> IslandLoadResult {
        let mut buckets: HashMap<String, RemoteIsland> = HashMap::new();
        for (refname, oid_chain) in refs {
            let Some(island_name) = self.classify_ref(refname) else {
                continue;
            };
            let island = buckets.entry(island_name.clone()).or_insert_with(|| RemoteIsland {
                name: island_name,
                oids: Vec::new(),
                hash: 0,
            });
            for oid in oid_chain {
                island.oids.push(*oid);
                island.hash = island.hash.wrapping_add(oid_core_hash(oid));
            }
        }

        // Deduplicate islands with identical membership hashes, keeping the
        // first-seen island for each distinct hash and preserving
        // first-seen order (matches `deduplicate_islands`'s stable-compact
        // scan).
        let mut seen_hashes: Vec<u64> = Vec::new();
        let mut islands: Vec<RemoteIsland> = Vec::new();
        for island in buckets.into_values() {
            if seen_hashes.contains(&island.hash) {
                continue;
            }
            seen_hashes.push(island.hash);
            islands.push(island);
        }
        islands.truncate(MAX_ISLANDS);

        let mut core_bit = None;
        for (bit, island) in islands.iter().enumerate() {
            if self.core_island_name.as_deref() == Some(island.name.as_str()) {
                core_bit = Some(bit as u32);
            }
            let mask = 1u64 << bit;
            for oid in &island.oids {
                if let Some(idx) = set.index_of(oid) {
                    set.get_mut(idx).island_bits |= mask;
                }
            }
        }

        IslandLoadResult {
            island_count: islands.len() as u32,
            core_bit,
        }
    }

    /// §4.9 "Commit marks are propagated to their root tree at load time":
    /// OR the commit's island bits onto its root tree and each parent.
    pub fn propagate_commit(set: &mut PackingSet, commit_idx: EntryIdx, tree_idx: EntryIdx, parent_idxs: &[EntryIdx]) {
        let bits = set.get(commit_idx).island_bits;
        if bits == 0 {
            return;
        }
        set.get_mut(tree_idx).island_bits |= bits;
        for &p in parent_idxs {
            set.get_mut(p).island_bits |= bits;
        }
    }

    /// §4.9 tree-walk propagation: pushes each tree's island bits down to
    /// its direct children, processing trees in ascending `tree_depth`
    /// (shallowest/root-most first) so a sub-tree reached from multiple
    /// parent trees accumulates all of their bits before its own children
    /// are visited.
    pub fn resolve_tree_islands<F>(set: &mut PackingSet, mut tree_children: F) -> Result<(), PackError>
    where
        F: FnMut(&ObjectId) -> Result<Vec<ObjectId>, PackError>,
    {
        let mut trees: Vec<EntryIdx> = set
            .indices()
            .filter(|&idx| set.get(idx).canonical_type == ObjectType::Tree)
            .collect();
        trees.sort_by_key(|&idx| set.get(idx).tree_depth);

        for idx in trees {
            let bits = set.get(idx).island_bits;
            if bits == 0 {
                continue;
            }
            let oid = set.get(idx).oid;
            for child_oid in tree_children(&oid)? {
                if let Some(child_idx) = set.index_of(&child_oid) {
                    set.get_mut(child_idx).island_bits |= bits;
                }
            }
        }
        Ok(())
    }

    /// §4.9 `layer` assignment: core-island entries get layer 0, everything
    /// else gets layer 1. Returns `max_layers` for `WriteOrder::compute`
    /// (`1` if no core island is configured, i.e. a single flat layer).
    pub fn compute_layers(set: &mut PackingSet, core_bit: Option<u32>) -> u8 {
        let Some(bit) = core_bit else {
            return 1;
        };
        let mask = 1u64 << bit;
        let idxs: Vec<EntryIdx> = set.indices().collect();
        for idx in idxs {
            let e = set.get_mut(idx);
            e.layer = if e.island_bits & mask != 0 { 0 } else { 1 };
        }
        2
    }
}

/// `in_same_island` (§4.9): true iff the child's (the delta target's) bits
/// are a subset of the base's bits. When neither side has island bits set
/// (islands not in use, or neither object matched a configured pattern)
/// this is trivially true.
pub fn in_same_island(base_bits: u64, child_bits: u64) -> bool {
    child_bits & !base_bits == 0
}

/// Sums the oid's first 8 bytes as a little-endian integer, matching
/// `memcpy(&sha_core, oid->hash, sizeof(uint64_t))` on a little-endian
/// host — used only as an order-independent membership fingerprint for
/// island deduplication, not for anything security-sensitive.
fn oid_core_hash(oid: &ObjectId) -> u64 {
    let bytes = oid.as_bytes();
    let mut buf = [0u8; 8];
    buf.copy_from_slice(&bytes[..8]);
    u64::from_le_bytes(buf)
}

#[cfg(test)]
mod tests {
    use super::*;
    use git_hash::HashAlgorithm;
    use git_object::ObjectType;

    fn oid(n: u8) -> ObjectId {
        let mut bytes = [0u8; 20];
        bytes[0] = n;
        ObjectId::from_bytes(&bytes, HashAlgorithm::Sha1).unwrap()
    }

    #[test]
    fn classify_ref_uses_last_matching_pattern() {
        let islands = DeltaIslands::new(
            &[
                "refs/heads/(.*)".to_string(),
                "refs/heads/release/(.*)".to_string(),
            ],
            None,
        )
        .unwrap();
        assert_eq!(
            islands.classify_ref("refs/heads/release/v1"),
            Some("v1".to_string())
        );
        assert_eq!(islands.classify_ref("refs/heads/main"), Some("main".to_string()));
        assert_eq!(islands.classify_ref("refs/tags/v1"), None);
    }

    #[test]
    fn load_assigns_disjoint_bits_per_island_and_tags_core() {
        let islands = DeltaIslands::new(
            &["refs/heads/(.*)".to_string(), "refs/other/(.*)".to_string()],
            Some("main".to_string()),
        )
        .unwrap();

        let mut set = PackingSet::new();
        let (main_idx, _) = set.find_or_insert(oid(1), ObjectType::Commit, 10, false, 0);
        let (other_idx, _) = set.find_or_insert(oid(2), ObjectType::Commit, 10, false, 0);

        let main_chain = [oid(1)];
        let other_chain = [oid(2)];
        let refs = vec![("refs/heads/main", main_chain.as_slice()), ("refs/other/x", other_chain.as_slice())];
        let result = islands.load(&mut set, refs.into_iter());

        assert_eq!(result.island_count, 2);
        assert!(result.core_bit.is_some());
        assert_ne!(set.get(main_idx).island_bits, set.get(other_idx).island_bits);
        assert!(in_same_island(
            set.get(main_idx).island_bits,
            set.get(main_idx).island_bits
        ));
    }

    #[test]
    fn subset_island_may_delta_against_superset_base() {
        // X is reachable from both islands, Y only from island 1: Y must
        // not serve as a delta base for X (Y's bits aren't a superset).
        let island1 = 0b01u64;
        let both = 0b11u64;
        assert!(!in_same_island(island1, both)); // base=Y(island1), child=X(both) -> rejected
        assert!(in_same_island(both, island1)); // base=X(both), child=Y(island1) -> ok
    }

    #[test]
    fn compute_layers_marks_core_island_entries_as_layer_zero() {
        let mut set = PackingSet::new();
        let (core_idx, _) = set.find_or_insert(oid(1), ObjectType::Blob, 10, false, 0);
        let (other_idx, _) = set.find_or_insert(oid(2), ObjectType::Blob, 10, false, 0);
        set.get_mut(core_idx).island_bits = 0b1;
        set.get_mut(other_idx).island_bits = 0b10;

        let max_layers = DeltaIslands::compute_layers(&mut set, Some(0));
        assert_eq!(max_layers, 2);
        assert_eq!(set.get(core_idx).layer, 0);
        assert_eq!(set.get(other_idx).layer, 1);
    }

    #[test]
    fn resolve_tree_islands_propagates_root_to_child_in_depth_order() {
        let mut set = PackingSet::new();
        let (root, _) = set.find_or_insert(oid(1), ObjectType::Tree, 10, false, 0);
        let (child, _) = set.find_or_insert(oid(2), ObjectType::Tree, 10, false, 0);
        set.get_mut(root).tree_depth = 0;
        set.get_mut(child).tree_depth = 1;
        set.get_mut(root).island_bits = 0b1;

        let root_oid = oid(1);
        let child_oid = oid(2);
        DeltaIslands::resolve_tree_islands(&mut set, |oid| {
            if *oid == root_oid {
                Ok(vec![child_oid])
            } else {
                Ok(vec![])
            }
        })
        .unwrap();

        assert_eq!(set.get(child).island_bits, 0b1);
    }
}
