//! §4.1 PackingSet — the indexed multiset of objects destined for the pack.

use std::collections::{HashMap, HashSet};

use git_hash::ObjectId;
use git_object::{ObjectType, Tree};

use super::entry::{self, EntryArena, EntryIdx, ObjectEntry, PackRef};

/// Object lookup `PackingSet::add_preferred_base` needs to walk a
/// preferred-base tree. Deliberately minimal (no caching): the original's
/// `pbase_tree_cache` exists to avoid re-reading the same subtree across
/// many preferred-base roots, a performance concern this crate leaves to
/// the caller's own object store.
pub trait PreferredBaseSource {
    fn read_object(&self, oid: &ObjectId) -> Option<(ObjectType, Vec<u8>)>;
}

/// Whether `find_or_insert` found an existing entry or created a new one.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Existed {
    Yes,
    No,
}

/// The indexed multiset of candidate objects (§3, §4.1).
///
/// Append-only during population, then frozen: after `freeze()`, reads are
/// lock-free and writes are confined to entries owned by a single
/// `DeltaSearch` worker (§5).
pub struct PackingSet {
    arena: EntryArena,
    by_oid: HashMap<ObjectId, EntryIdx>,
    frozen: bool,
}

impl PackingSet {
    pub fn new() -> Self {
        Self {
            arena: EntryArena::new(),
            by_oid: HashMap::new(),
            frozen: false,
        }
    }

    pub fn len(&self) -> usize {
        self.arena.len()
    }

    pub fn is_empty(&self) -> bool {
        self.arena.is_empty()
    }

    pub fn get(&self, idx: EntryIdx) -> &ObjectEntry {
        self.arena.get(idx)
    }

    pub fn get_mut(&mut self, idx: EntryIdx) -> &mut ObjectEntry {
        self.arena.get_mut(idx)
    }

    pub fn index_of(&self, oid: &ObjectId) -> Option<EntryIdx> {
        self.by_oid.get(oid).copied()
    }

    pub fn contains(&self, oid: &ObjectId) -> bool {
        self.by_oid.contains_key(oid)
    }

    pub fn iter(&self) -> impl Iterator<Item = (EntryIdx, &ObjectEntry)> {
        self.arena.iter()
    }

    pub fn iter_mut(&mut self) -> impl Iterator<Item = (EntryIdx, &mut ObjectEntry)> {
        self.arena.iter_mut()
    }

    pub fn indices(&self) -> impl Iterator<Item = EntryIdx> + '_ {
        self.arena.indices()
    }

    /// §4.1: insert `oid` if not already present; merge (never duplicate)
    /// if it is. When `exclude` is true, the entry is marked
    /// `preferred_base` and excluded from the written count — if it was
    /// previously an *included* entry, it stays in the arena but is now
    /// only a potential delta source.
    pub fn find_or_insert(
        &mut self,
        oid: ObjectId,
        canonical_type: ObjectType,
        canonical_size: u64,
        exclude: bool,
        name_hash: u32,
    ) -> (EntryIdx, Existed) {
        assert!(!self.frozen, "cannot insert into a frozen PackingSet");
        if let Some(&idx) = self.by_oid.get(&oid) {
            let entry = self.arena.get_mut(idx);
            if exclude {
                entry.preferred_base = true;
            }
            return (idx, Existed::Yes);
        }
        let mut entry = ObjectEntry::new(oid, canonical_type, canonical_size);
        entry.name_hash = name_hash;
        entry.preferred_base = exclude;
        let idx = self.arena.push(entry);
        self.by_oid.insert(oid, idx);
        (idx, Existed::No)
    }

    /// Convenience wrapper matching §9's supplemented `no_try_delta`
    /// path-based suppression: callers resolving objects from a tree walk
    /// pass the originating path so the "do not delta" predicate can be
    /// consulted once, at insertion time.
    pub fn find_or_insert_with_path(
        &mut self,
        oid: ObjectId,
        canonical_type: ObjectType,
        canonical_size: u64,
        exclude: bool,
        path: &[u8],
        no_try_delta: impl Fn(&[u8]) -> bool,
    ) -> (EntryIdx, Existed) {
        let name_hash = entry::pack_name_hash(path);
        let (idx, existed) = self.find_or_insert(oid, canonical_type, canonical_size, exclude, name_hash);
        if existed == Existed::No && no_try_delta(path) {
            self.arena.get_mut(idx).no_try_delta = true;
        }
        (idx, existed)
    }

    /// §9 supplemented feature: seed preferred-base candidates from a tree
    /// walk over `tree_oid`, purely to widen `DeltaSearch`'s window with
    /// objects that will never themselves be written
    /// (`add_preferred_base_object`/`pbase_tree` in the original).
    pub fn add_preferred_base(&mut self, tree_oid: ObjectId, source: &impl PreferredBaseSource) {
        assert!(!self.frozen, "cannot insert into a frozen PackingSet");
        let mut seen = HashSet::new();
        let mut stack = vec![tree_oid];
        while let Some(oid) = stack.pop() {
            if !seen.insert(oid) {
                continue;
            }
            let Some((obj_type, content)) = source.read_object(&oid) else {
                continue;
            };
            if obj_type == ObjectType::Tree {
                if let Ok(tree) = Tree::parse(&content) {
                    for te in &tree.entries {
                        if te.mode.is_gitlink() {
                            continue;
                        }
                        stack.push(te.oid);
                    }
                }
            }
            self.find_or_insert(oid, obj_type, content.len() as u64, true, 0);
        }
    }

    /// Record that `entry_idx` is already present in an on-disk pack.
    pub fn mark_in_pack(
        &mut self,
        entry_idx: EntryIdx,
        pack: PackRef,
        offset: u64,
        in_pack_type: ObjectType,
        header_size: u32,
    ) {
        let entry = self.arena.get_mut(entry_idx);
        entry.in_pack = Some(pack);
        entry.in_pack_offset = offset;
        entry.in_pack_type = Some(in_pack_type);
        entry.in_pack_header_size = header_size;
    }

    /// §4.1 `set_delta`: prepend `child` onto `parent`'s sibling list.
    pub fn set_delta(&mut self, child: EntryIdx, parent: EntryIdx) {
        entry::set_delta(&mut self.arena, child, parent);
    }

    /// §4.1 `unset_delta`: O(depth of parent's sibling list).
    pub fn unset_delta(&mut self, child: EntryIdx) {
        entry::unset_delta(&mut self.arena, child);
    }

    /// Number of entries that will actually be written (excludes
    /// preferred-base entries) — invariant 4 of §3.
    pub fn output_count(&self) -> usize {
        self.arena.iter().filter(|(_, e)| !e.preferred_base).count()
    }

    /// Freeze the set: no further inserts are permitted. Called once
    /// population (ListObjects + any preferred-base seeding) completes.
    pub fn freeze(&mut self) {
        self.frozen = true;
    }

    pub fn is_frozen(&self) -> bool {
        self.frozen
    }
}

impl Default for PackingSet {
    fn default() -> Self {
        Self::new()
    }
}
