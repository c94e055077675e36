//! §4.7 WriteOrder — the two-layer emission permutation consumed by
//! `Writer`.

use git_hash::ObjectId;
use git_object::ObjectType;

use super::entry::{DfsState, EntryIdx};
use super::packing_set::PackingSet;

/// Computes the write order for a frozen `PackingSet`.
pub struct WriteOrder;

impl WriteOrder {
    /// `max_layers` is `1` unless delta islands are enabled, in which case
    /// it is the highest `layer` value present in `set`, plus one.
    pub fn compute(set: &mut PackingSet, tagged_oids: &[ObjectId], max_layers: u8) -> Vec<EntryIdx> {
        // Step 1: clear filled/tagged/dfs_state and rebuild delta forests so
        // siblings are in original-recency (arena) order, matching the
        // order entries were discovered rather than whatever order
        // DeltaSearch last left them in.
        Self::reset_and_relink_forests(set);

        // Step 2: mark tagged entries.
        for oid in tagged_oids {
            if let Some(idx) = set.index_of(oid) {
                set.get_mut(idx).tagged = true;
            }
        }

        let mut order = Vec::with_capacity(set.output_count());

        for layer in 0..max_layers {
            Self::emit_layer(set, layer, &mut order);
        }

        order
    }

    fn reset_and_relink_forests(set: &mut PackingSet) {
        let idxs: Vec<EntryIdx> = set.indices().collect();
        for idx in &idxs {
            let entry = set.get_mut(*idx);
            entry.filled = false;
            entry.tagged = false;
            entry.dfs_state = DfsState::None;
            entry.delta_child = None;
            entry.delta_sibling = None;
        }
        // Re-link in arena (original-recency) order: since `set_delta`
        // prepends to the sibling list, relinking in ascending arena order
        // leaves the *first-discovered* child at the head after all
        // prepends finish -> the list reads head-to-tail as most-recent to
        // least-recent relative to relinking order, which matches "siblings
        // in original-recency order" when we link oldest first.
        let parents: Vec<(EntryIdx, EntryIdx)> = idxs
            .iter()
            .filter_map(|&idx| set.get(idx).delta_parent.map(|p| (idx, p)))
            .collect();
        for (child, parent) in parents {
            set.set_delta(child, parent);
        }
    }

    fn emit_layer(set: &mut PackingSet, layer: u8, order: &mut Vec<EntryIdx>) {
        let in_layer = |set: &PackingSet, idx: EntryIdx| -> bool {
            let e = set.get(idx);
            !e.preferred_base && !e.filled && e.layer == layer
        };

        let all: Vec<EntryIdx> = set.indices().collect();

        // (a) untagged Commit/Tag entries in original order, until the
        // first tagged entry.
        for &idx in &all {
            if !in_layer(set, idx) {
                continue;
            }
            let e = set.get(idx);
            let is_commit_like = matches!(e.canonical_type, ObjectType::Commit | ObjectType::Tag);
            if !is_commit_like {
                continue;
            }
            if e.tagged {
                break;
            }
            Self::emit_one(set, idx, order);
        }

        // (b) all tagged entries.
        for &idx in &all {
            if !in_layer(set, idx) {
                continue;
            }
            let e = set.get(idx);
            if matches!(e.canonical_type, ObjectType::Commit | ObjectType::Tag) && e.tagged {
                Self::emit_one(set, idx, order);
            }
        }

        // (c) remaining commits and tags.
        for &idx in &all {
            if !in_layer(set, idx) {
                continue;
            }
            let e = set.get(idx);
            if matches!(e.canonical_type, ObjectType::Commit | ObjectType::Tag) {
                Self::emit_one(set, idx, order);
            }
        }

        // (d) all trees.
        for &idx in &all {
            if !in_layer(set, idx) {
                continue;
            }
            if set.get(idx).canonical_type == ObjectType::Tree {
                Self::emit_one(set, idx, order);
            }
        }

        // (e) remaining forest, rooted families first.
        for &idx in &all {
            if !in_layer(set, idx) {
                continue;
            }
            Self::emit_family(set, idx, order);
        }
    }

    fn emit_one(set: &mut PackingSet, idx: EntryIdx, order: &mut Vec<EntryIdx>) {
        if set.get(idx).filled {
            return;
        }
        set.get_mut(idx).filled = true;
        order.push(idx);
    }

    /// Walk up to the delta root of `idx`'s family, then DFS the
    /// descendant tree in "self, siblings, then children; on exhaustion,
    /// retreat to parent then sibling" order.
    fn emit_family(set: &mut PackingSet, idx: EntryIdx, order: &mut Vec<EntryIdx>) {
        if set.get(idx).filled {
            return;
        }
        let mut root = idx;
        while let Some(p) = set.get(root).delta_parent {
            root = p;
        }
        Self::emit_one(set, root, order);

        let mut stack = vec![root];
        while let Some(cur) = stack.pop() {
            let mut sibling_chain = Vec::new();
            let mut child = set.get(cur).delta_child;
            while let Some(c) = child {
                sibling_chain.push(c);
                child = set.get(c).delta_sibling;
            }
            for &c in &sibling_chain {
                Self::emit_one(set, c, order);
            }
            for &c in sibling_chain.iter().rev() {
                stack.push(c);
            }
        }
    }
}
