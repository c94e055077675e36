//! §4.4 DeltaBaseReuser — recover in-pack delta linkage without fully
//! decompressing, then break cycles and clamp chain depth.

use git_hash::ObjectId;
use git_object::ObjectType;

use crate::entry::{parse_entry_header, PackEntry};
use crate::packing::entry::{DfsState, EntryIdx};
use crate::packing::packing_set::PackingSet;
use crate::{PackEntryType, PackError};

/// The bytes-and-offsets view into a source pack that `DeltaBaseReuser`
/// needs, kept abstract so this module does not depend on `PackFile`
/// directly (it is used both against mmap'd packs and, in tests, fixtures).
pub trait PackBytesSource {
    fn bytes_at(&self, offset: u64) -> &[u8];
    fn crc32_at(&self, offset: u64, header_size: usize, compressed_len: usize) -> u32;
    fn verify_inflate(&self, offset: u64, header_size: usize, expected_size: usize) -> bool;
}

/// Recovers delta linkage for every `in_pack` entry, then repairs the
/// resulting forest so it has no cycles and respects `max_depth`.
pub struct DeltaBaseReuser<'a, S: PackBytesSource + ?Sized> {
    source: &'a S,
    verify_reused: bool,
    max_depth: u8,
}

impl<'a, S: PackBytesSource + ?Sized> DeltaBaseReuser<'a, S> {
    pub fn new(source: &'a S, verify_reused: bool, max_depth: u8) -> Self {
        Self {
            source,
            verify_reused,
            max_depth,
        }
    }

    /// §4.4 steps 1-5: for every `in_pack` entry, recover its on-disk type
    /// and, where it is a delta, resolve the base and link the entry to it.
    /// `resolve_base` maps a pack-relative offset or ref-delta oid to the
    /// `EntryIdx` already present in `set` for that base, when one exists
    /// in the same pack and island.
    pub fn reuse_pass(
        &self,
        set: &mut PackingSet,
        resolve_ofs_base: impl Fn(&PackingSet, u64) -> Option<EntryIdx>,
        resolve_ref_base: impl Fn(&PackingSet, &ObjectId) -> Option<EntryIdx>,
    ) -> Result<(), PackError> {
        let candidates: Vec<EntryIdx> = set
            .indices()
            .filter(|&idx| set.get(idx).in_pack.is_some())
            .collect();

        for idx in candidates {
            let entry = set.get(idx);
            let offset = entry.in_pack_offset;
            let data = self.source.bytes_at(offset);
            let header = match parse_entry_header(data, offset) {
                Ok(h) => h,
                Err(_) => continue,
            };

            if self.verify_reused
                && !self
                    .source
                    .verify_inflate(offset, header.header_size, header.uncompressed_size)
            {
                // Corrupt span: demote to non-reuse, let DeltaSearch
                // recompute from canonical bytes (§7 corrupt-input-pack
                // recovery policy).
                continue;
            }

            match header.entry_type {
                PackEntryType::OfsDelta { base_offset } => {
                    if let Some(base_idx) = resolve_ofs_base(set, base_offset) {
                        self.link_reused(set, idx, base_idx, header.uncompressed_size as u64);
                    }
                }
                PackEntryType::RefDelta { base_oid } => {
                    if let Some(base_idx) = resolve_ref_base(set, &base_oid) {
                        self.link_reused(set, idx, base_idx, header.uncompressed_size as u64);
                    }
                }
                non_delta => {
                    let entry = set.get_mut(idx);
                    if let Some(t) = non_delta.to_object_type() {
                        entry.in_pack_type = Some(t);
                    }
                }
            }
        }

        self.break_delta_chains(set);
        Ok(())
    }

    fn link_reused(&self, set: &mut PackingSet, child: EntryIdx, base: EntryIdx, delta_size: u64) {
        let base_type = set.get(base).canonical_type;
        let base_size = set.get(base).canonical_size;
        {
            let entry = set.get_mut(child);
            entry.canonical_type = base_type;
            entry.canonical_size = base_size;
            entry.delta_size = delta_size;
        }
        set.set_delta(child, base);
    }

    /// `break_delta_chains` (§4.4): two-pass DFS coloring, dropping edges
    /// into an `Active` ancestor, then clamping `depth` to `max_depth`.
    ///
    /// A well-formed pack always has at least one parentless entry per
    /// delta forest, so walking from those roots reaches every entry. But
    /// `reuse_pass` derives linkage from whatever bytes `resolve_ofs_base`/
    /// `resolve_ref_base` hand back for a possibly-corrupt source pack, so a
    /// pure cycle with no parentless member (every entry has *some*
    /// parent) is reachable here even though it can't exist in valid git
    /// output. The second loop below seeds a fresh DFS at any entry the
    /// roots pass left unvisited; `dfs_fix`'s `Active`-ancestor check still
    /// finds and cuts the back-edge from inside such a cycle.
    fn break_delta_chains(&self, set: &mut PackingSet) {
        let roots: Vec<EntryIdx> = set
            .indices()
            .filter(|&idx| set.get(idx).delta_parent.is_none())
            .collect();

        for root in roots {
            if set.get(root).dfs_state == DfsState::None {
                self.dfs_fix(set, root, 0);
            }
        }

        let rootless_cycle_members: Vec<EntryIdx> =
            set.indices().filter(|&idx| set.get(idx).dfs_state == DfsState::None).collect();
        for idx in rootless_cycle_members {
            if set.get(idx).dfs_state == DfsState::None {
                self.dfs_fix(set, idx, 0);
            }
        }
    }

    fn dfs_fix(&self, set: &mut PackingSet, idx: EntryIdx, total_depth: u32) {
        set.get_mut(idx).dfs_state = DfsState::Active;

        let mut child = set.get(idx).delta_child;
        while let Some(cur) = child {
            let next_sibling = set.get(cur).delta_sibling;

            // A self-referential or back-edge cycle would show up as the
            // child already being Active; drop the link and make it a base.
            if set.get(cur).dfs_state == DfsState::Active {
                set.unset_delta(cur);
                set.get_mut(cur).dfs_state = DfsState::Done;
                child = next_sibling;
                continue;
            }

            self.dfs_fix(set, cur, total_depth + 1);
            child = next_sibling;
        }

        let max_depth = self.max_depth as u32 + 1;
        let final_depth = if max_depth == 0 { 0 } else { total_depth % max_depth };
        set.get_mut(idx).depth = final_depth as u8;
        if final_depth == 0 && set.get(idx).delta_parent.is_some() {
            set.unset_delta(idx);
        }
        set.get_mut(idx).dfs_state = DfsState::Done;
    }
}
