//! The per-object record tracked by a `PackingSet`.

use std::num::NonZeroU32;

use git_hash::ObjectId;
use git_object::ObjectType;

/// Index of an `ObjectEntry` within a `PackingSet`'s arena.
///
/// Stored 1-based internally (via `NonZeroU32`) so `Option<EntryIdx>` is a
/// plain `u32` with no niche padding, matching the index-biased linkage
/// the original C `struct object_entry` used (`delta_idx`, `delta_sibling_idx`,
/// `delta_child_idx` all biased by +1 to reserve 0 as "none").
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct EntryIdx(NonZeroU32);

impl EntryIdx {
    /// Construct from a 0-based array position. `pub(crate)` so that
    /// callers outside this module operate only through `EntryArena` or
    /// (for the thread-parallel search path) a known arena-relative
    /// sub-slice offset.
    pub(crate) fn from_array_index(i: usize) -> Self {
        EntryIdx(NonZeroU32::new(i as u32 + 1).expect("arena index overflow"))
    }

    fn to_array_index(self) -> usize {
        (self.0.get() - 1) as usize
    }

    /// Stable numeric tie-breaker for sort keys; not a public array index.
    pub fn as_sort_key(self) -> u32 {
        self.0.get()
    }
}

/// A handle to an opened source pack, as seen by the packing set. Opaque
/// to the engine beyond equality/identity; resolved through the
/// `ObjectSource` collaborator.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct PackRef(pub u32);

/// Transient DFS coloring used while breaking delta cycles (§4.4) and while
/// computing write order (§4.7).
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum DfsState {
    #[default]
    None,
    Active,
    Done,
}

/// Per-object record in a `PackingSet`.
#[derive(Debug, Clone)]
pub struct ObjectEntry {
    pub oid: ObjectId,
    pub canonical_type: ObjectType,
    pub canonical_size: u64,

    pub in_pack: Option<PackRef>,
    pub in_pack_offset: u64,
    pub in_pack_type: Option<ObjectType>,
    pub in_pack_header_size: u32,

    pub delta_parent: Option<EntryIdx>,
    pub delta_sibling: Option<EntryIdx>,
    pub delta_child: Option<EntryIdx>,

    pub delta_size: u64,
    pub compressed_delta_size: u32,
    pub cached_delta_bytes: Option<Box<[u8]>>,

    pub depth: u8,
    pub name_hash: u32,
    pub tree_depth: u16,

    pub preferred_base: bool,
    pub tagged: bool,
    pub no_try_delta: bool,
    pub layer: u8,

    pub filled: bool,
    pub dfs_state: DfsState,

    pub written_offset: Option<u64>,
    pub crc32: Option<u32>,

    /// Island membership bitmap (§4.9). Empty ⇒ not constrained by islands.
    pub island_bits: u64,
}

impl ObjectEntry {
    pub fn new(oid: ObjectId, canonical_type: ObjectType, canonical_size: u64) -> Self {
        Self {
            oid,
            canonical_type,
            canonical_size,
            in_pack: None,
            in_pack_offset: 0,
            in_pack_type: None,
            in_pack_header_size: 0,
            delta_parent: None,
            delta_sibling: None,
            delta_child: None,
            delta_size: 0,
            compressed_delta_size: 0,
            cached_delta_bytes: None,
            depth: 0,
            name_hash: 0,
            tree_depth: 0,
            preferred_base: false,
            tagged: false,
            no_try_delta: false,
            layer: 0,
            filled: false,
            dfs_state: DfsState::None,
            written_offset: None,
            crc32: None,
            island_bits: 0,
        }
    }

    pub fn is_delta(&self) -> bool {
        self.delta_parent.is_some() || self.cached_delta_bytes.is_some()
    }
}

/// An arena of `ObjectEntry` values addressed by `EntryIdx`.
///
/// Kept separate from `PackingSet`'s indexing structures so the delta-forest
/// linkage helpers (`set_delta`/`unset_delta`, and the write-order DFS) can
/// operate purely on indices without touching the oid hash map.
#[derive(Debug, Default)]
pub struct EntryArena {
    entries: Vec<ObjectEntry>,
}

impl EntryArena {
    pub fn new() -> Self {
        Self { entries: Vec::new() }
    }

    pub fn push(&mut self, entry: ObjectEntry) -> EntryIdx {
        self.entries.push(entry);
        EntryIdx::from_array_index(self.entries.len() - 1)
    }

    pub fn get(&self, idx: EntryIdx) -> &ObjectEntry {
        &self.entries[idx.to_array_index()]
    }

    pub fn get_mut(&mut self, idx: EntryIdx) -> &mut ObjectEntry {
        &mut self.entries[idx.to_array_index()]
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    pub fn iter(&self) -> impl Iterator<Item = (EntryIdx, &ObjectEntry)> {
        self.entries
            .iter()
            .enumerate()
            .map(|(i, e)| (EntryIdx::from_array_index(i), e))
    }

    pub fn iter_mut(&mut self) -> impl Iterator<Item = (EntryIdx, &mut ObjectEntry)> {
        self.entries
            .iter_mut()
            .enumerate()
            .map(|(i, e)| (EntryIdx::from_array_index(i), e))
    }

    pub fn indices(&self) -> impl Iterator<Item = EntryIdx> + '_ {
        (0..self.entries.len()).map(EntryIdx::from_array_index)
    }
}

/// Insert `child` at the front of `parent`'s sibling list and record the
/// link (§4.1 `set_delta`).
pub fn set_delta(arena: &mut EntryArena, child: EntryIdx, parent: EntryIdx) {
    let old_head = arena.get(parent).delta_child;
    arena.get_mut(child).delta_parent = Some(parent);
    arena.get_mut(child).delta_sibling = old_head;
    arena.get_mut(parent).delta_child = Some(child);
}

/// Remove `child` from its parent's sibling list (§4.1 `unset_delta`).
/// Cost is O(depth of the sibling list).
pub fn unset_delta(arena: &mut EntryArena, child: EntryIdx) {
    let Some(parent) = arena.get(child).delta_parent else {
        return;
    };
    let mut cursor = arena.get(parent).delta_child;
    let mut prev: Option<EntryIdx> = None;
    while let Some(cur) = cursor {
        let next = arena.get(cur).delta_sibling;
        if cur == child {
            match prev {
                Some(p) => arena.get_mut(p).delta_sibling = next,
                None => arena.get_mut(parent).delta_child = next,
            }
            break;
        }
        prev = Some(cur);
        cursor = next;
    }
    arena.get_mut(child).delta_parent = None;
    arena.get_mut(child).delta_sibling = None;
}

/// A stable, implementation-defined hash of a pathname used to cluster
/// similarly-named objects during delta search and write ordering (§9 Open
/// Question 2: the mixing function is not specified, only that it must be
/// stable run-to-run for identical paths). Weighted toward the last path
/// component, the same bias real git's `pack_name_hash` has, so files with
/// the same basename in different directories land near each other.
pub fn pack_name_hash(path: &[u8]) -> u32 {
    if path.is_empty() {
        return 0;
    }
    let mut hash: u32 = 0;
    let mut last_component_start = 0usize;
    for (i, &b) in path.iter().enumerate() {
        if b == b'/' {
            last_component_start = i + 1;
        }
    }
    for &b in &path[last_component_start..] {
        hash = hash.wrapping_shl(3).wrapping_add(hash >> 29) ^ (b as u32);
    }
    for &b in &path[..last_component_start] {
        hash = (hash >> 2).wrapping_add((b as u32).wrapping_shl(24));
    }
    hash
}
