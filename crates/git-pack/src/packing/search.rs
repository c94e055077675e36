//! §4.5 DeltaSearch — sliding-window delta candidate search over the
//! deltable list.
//!
//! The window algorithm (`run_local`) is written against a plain
//! `&mut [ObjectEntry]` slice addressed by local, segment-relative
//! indices rather than against `PackingSet` directly. This is what lets
//! `ThreadPool` (§4.6) hand one owned segment to each worker thread with
//! no shared mutable state: `gather_segment`/`scatter_segment` are the
//! only places that translate between a segment's local indices and the
//! `PackingSet`'s global ones.

use std::sync::Mutex;

use git_hash::ObjectId;
use git_object::ObjectType;

use super::entry::{EntryIdx, ObjectEntry};
use super::packing_set::PackingSet;
use crate::delta::compute::compute_delta;
use crate::PackError;

/// Minimum object size considered for delta search (§4.5).
const MIN_DELTABLE_SIZE: u64 = 50;

/// Loads the canonical bytes for an entry, shared across worker threads
/// behind `packing_data_lock` at the call site (§5).
pub trait ObjectBytesSource: Sync {
    fn load_bytes(&self, oid: &ObjectId) -> Result<Vec<u8>, PackError>;
}

fn type_rank(t: ObjectType) -> u8 {
    match t {
        ObjectType::Commit => 0,
        ObjectType::Tree => 1,
        ObjectType::Blob => 2,
        ObjectType::Tag => 3,
    }
}

fn in_same_island(base_bits: u64, child_bits: u64) -> bool {
    // invariant 3: island(parent) superset of island(child).
    child_bits & !base_bits == 0
}

/// §4.5 sort key, sorted descending. `preferred_base` is unnegated so
/// preferred-base entries (true > false) sort ahead of ordinary entries of
/// the same type/name_hash, putting them in the window early.
fn sort_key(set: &PackingSet, idx: EntryIdx) -> (u8, u32, bool, u64, u64, u32) {
    let e = set.get(idx);
    (
        type_rank(e.canonical_type),
        e.name_hash,
        e.preferred_base,
        e.island_bits,
        e.canonical_size,
        idx.as_sort_key(),
    )
}

/// Build the deltable list (§4.5): entries processed by the window
/// algorithm, in search order. This includes `preferred_base` entries —
/// they must pass through the window so later entries can delta against
/// them (`run_local` skips computing an output delta *for* them, but still
/// loads their bytes into the window). It excludes entries with unknown
/// type, below the minimum size, at or above `big_file_threshold`
/// (`PackConfig::big_file_threshold`, 0 = no limit — such blobs stream
/// through `Writer` undeltified), marked `no_try_delta`, or already
/// satisfied by a reused delta.
pub fn deltable_list(set: &PackingSet, big_file_threshold: u64) -> Vec<EntryIdx> {
    let mut list: Vec<EntryIdx> = set
        .indices()
        .filter(|&idx| {
            let e = set.get(idx);
            e.canonical_size >= MIN_DELTABLE_SIZE
                && (big_file_threshold == 0 || e.canonical_size < big_file_threshold)
                && !e.no_try_delta
                && !e.is_delta()
        })
        .collect();
    list.sort_by(|&a, &b| sort_key(set, b).cmp(&sort_key(set, a)));
    list
}

/// Copy a segment of `PackingSet` entries (in the order given) into an
/// owned, freestanding `Vec<ObjectEntry>` a worker thread can run against
/// without holding any borrow of `set`.
pub fn gather_segment(set: &PackingSet, segment: &[EntryIdx]) -> Vec<ObjectEntry> {
    segment.iter().map(|&idx| set.get(idx).clone()).collect()
}

/// Write back the local-run results (`depth`, `delta_size`,
/// `cached_delta_bytes`, and delta-forest linkage) from a segment's local
/// slice into `set`, translating local indices to the segment's original
/// `EntryIdx`s.
pub fn scatter_segment(set: &mut PackingSet, segment: &[EntryIdx], local: &[ObjectEntry]) {
    for (i, global_idx) in segment.iter().enumerate() {
        let local_entry = &local[i];
        if let Some(local_parent) = local_entry.delta_parent {
            let parent_pos = (local_parent.as_sort_key() - 1) as usize;
            let global_parent = segment[parent_pos];
            set.set_delta(*global_idx, global_parent);
        }
        let entry = set.get_mut(*global_idx);
        entry.depth = local_entry.depth;
        entry.delta_size = local_entry.delta_size;
        entry.cached_delta_bytes = local_entry.cached_delta_bytes.clone();
    }
}

struct WindowSlot {
    local_idx: EntryIdx,
    bytes: Vec<u8>,
}

/// Accounting for the shared delta cache (`cache_lock` in §5).
pub struct DeltaCache {
    limit: u64,
    used: Mutex<u64>,
}

impl DeltaCache {
    pub fn new(limit: u64) -> Self {
        Self {
            limit,
            used: Mutex::new(0),
        }
    }

    fn try_reserve(&self, bytes: u64) -> bool {
        if self.limit == 0 {
            return false;
        }
        let mut used = self.used.lock().unwrap();
        if *used + bytes > self.limit {
            return false;
        }
        *used += bytes;
        true
    }
}

/// Runs the §4.5 window algorithm over a local, segment-relative slice.
pub struct DeltaSearch<'a, S: ObjectBytesSource> {
    source: &'a S,
    window: usize,
    max_depth: u8,
    delta_cache_limit: u64,
    cache: &'a DeltaCache,
    window_memory_limit: u64,
}

impl<'a, S: ObjectBytesSource> DeltaSearch<'a, S> {
    pub fn new(source: &'a S, window: usize, max_depth: u8, delta_cache_limit: u64, cache: &'a DeltaCache) -> Self {
        Self {
            source,
            window: window.max(1),
            max_depth,
            delta_cache_limit,
            cache,
            window_memory_limit: 0,
        }
    }

    /// Caps the bytes of unpacked source data held resident across the
    /// window at once (§4.5 step 7, `PackConfig::window_memory_limit`).
    /// `0` (the default) means unlimited.
    pub fn with_window_memory_limit(mut self, limit: u64) -> Self {
        self.window_memory_limit = limit;
        self
    }

    /// Convenience entry point for the non-threaded path: gather, run,
    /// scatter against `set` directly.
    pub fn run(&self, set: &mut PackingSet, segment: &[EntryIdx]) -> Result<(), PackError> {
        let mut local = gather_segment(set, segment);
        self.run_local(&mut local)?;
        scatter_segment(set, segment, &local);
        Ok(())
    }

    /// The core algorithm, addressed purely by position within `entries`
    /// (local, 0-based) so it has no dependency on `PackingSet` and can
    /// run on a thread that owns `entries` outright.
    pub fn run_local(&self, entries: &mut [ObjectEntry]) -> Result<(), PackError> {
        let mut window: Vec<Option<WindowSlot>> = (0..self.window).map(|_| None).collect();
        let mut cursor = 0usize;
        let mut filled = 0usize;
        let mut mem_usage: u64 = 0;

        for i in 0..entries.len() {
            let target_oid = entries[i].oid;
            let target_bytes = self.source.load_bytes(&target_oid)?;
            let target_size = target_bytes.len() as u64;

            // §4.5 step 7: evict the window's oldest slots (`free_unpacked`)
            // until there is room under the memory budget for this entry.
            if self.window_memory_limit != 0 {
                while filled > 1 && mem_usage + target_size > self.window_memory_limit {
                    let tail = (cursor + self.window - filled) % self.window;
                    if let Some(evicted) = window[tail].take() {
                        mem_usage = mem_usage.saturating_sub(evicted.bytes.len() as u64);
                    }
                    filled -= 1;
                }
            }

            // We do not compute a delta to *create* objects we are not going
            // to pack; a preferred-base entry still loads into the window
            // below so later entries can delta against it.
            let mut best_slot = None;
            if !entries[i].preferred_base {
                let existing_chain_depth = entries[i].depth;
                let max_depth = self.max_depth.saturating_sub(existing_chain_depth);
                if max_depth > 0 {
                    best_slot = self.search_window(entries, i, &target_bytes, target_size, &window, max_depth);
                }
            }

            // §4.5 step 8: move the winning base toward the cursor so it is
            // tried first on the next search, extending how long it survives
            // in the window before eviction.
            if let Some(slot_idx) = best_slot {
                move_slot_toward_cursor(&mut window, slot_idx, cursor, self.window);
            }

            if let Some(old) = window[cursor].take() {
                mem_usage = mem_usage.saturating_sub(old.bytes.len() as u64);
            } else {
                filled += 1;
            }
            mem_usage += target_size;
            window[cursor] = Some(WindowSlot {
                local_idx: EntryIdx::from_array_index(i),
                bytes: target_bytes,
            });
            cursor = (cursor + 1) % self.window;
        }

        Ok(())
    }

    /// Returns the winning base's window slot index, so the caller can
    /// apply the step-8 move-to-front heuristic.
    fn search_window(
        &self,
        entries: &mut [ObjectEntry],
        target_pos: usize,
        target_bytes: &[u8],
        target_size: u64,
        window: &[Option<WindowSlot>],
        max_depth: u8,
    ) -> Option<usize> {
        let target_type = entries[target_pos].canonical_type;
        let target_island = entries[target_pos].island_bits;
        let has_existing_delta = entries[target_pos].is_delta();
        let mut current_best_size = if has_existing_delta {
            entries[target_pos].delta_size
        } else {
            u64::MAX
        };
        let mut best: Option<(usize, usize, Vec<u8>)> = None;

        for (slot_idx, slot) in window.iter().enumerate() {
            let Some(slot) = slot else { continue };
            let base_pos = (slot.local_idx.as_sort_key() - 1) as usize;
            if base_pos == target_pos {
                continue;
            }
            let base = &entries[base_pos];
            if base.canonical_type != target_type {
                continue;
            }
            if base.depth >= max_depth {
                continue;
            }
            if !in_same_island(base.island_bits, target_island) {
                continue;
            }
            let src_size = base.canonical_size;
            if target_size < src_size / 32 {
                continue;
            }

            let hash_size = 16u64;
            let max_size: u64 = if !has_existing_delta {
                target_size / 2 - hash_size.min(target_size / 2)
            } else {
                current_best_size
            };
            let size_diff = target_size.abs_diff(src_size);
            if size_diff >= max_size {
                continue;
            }

            let delta = compute_delta(&slot.bytes, target_bytes);
            let delta_len = delta.len() as u64;
            if delta_len >= max_size {
                continue;
            }
            if delta_len >= current_best_size {
                continue;
            }

            current_best_size = delta_len;
            best = Some((slot_idx, base_pos, delta));
        }

        let (slot_idx, base_pos, delta) = best?;
        let delta_len = delta.len() as u64;
        let cacheable = self.delta_cacheable(delta_len) && self.cache.try_reserve(delta_len);

        entries[target_pos].delta_parent = Some(EntryIdx::from_array_index(base_pos));
        entries[target_pos].delta_size = delta_len;
        entries[target_pos].depth = entries[base_pos].depth + 1;
        if cacheable {
            entries[target_pos].cached_delta_bytes = Some(delta.into_boxed_slice());
        }
        Some(slot_idx)
    }

    /// `delta_cacheable` (§4.5 step 6), simplified: cache small deltas.
    fn delta_cacheable(&self, delta_size: u64) -> bool {
        delta_size < self.delta_cache_limit
    }
}

/// §4.5 step 8: shift the slots between `best` and `cursor` back by one,
/// landing `best`'s contents at `cursor`'s predecessor — the position that
/// will be tried first (and evicted last) on the next entry. Mirrors the
/// rotate in `pack-objects.c`'s `find_deltas` after a winning `try_delta`.
fn move_slot_toward_cursor(window: &mut [Option<WindowSlot>], best: usize, cursor: usize, len: usize) {
    if best == cursor || len <= 1 {
        return;
    }
    let mut dist = (len + cursor - best) % len;
    let mut dst = best;
    let winner = window[best].take();
    while dist > 0 {
        let src = (dst + 1) % len;
        window[dst] = window[src].take();
        dst = src;
        dist -= 1;
    }
    window[dst] = winner;
}
