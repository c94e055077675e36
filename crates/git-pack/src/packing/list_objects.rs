//! §4.3 ListObjects — walk commits -> trees -> blobs through a TraversalFilter.

use std::collections::HashSet;

use git_hash::ObjectId;
use git_object::{Commit, FileMode, ObjectType, Tag, Tree};
use git_utils::progress::Progress;

use super::entry::pack_name_hash;
use super::filter::{FilterResult, OmittedSet, TraversalFilter, VisitedObject};
use super::packing_set::PackingSet;
use crate::PackError;

/// What to do when a referenced object cannot be read (§4.3 step 5).
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum MissingObjectPolicy {
    /// Fail with a missing-object error.
    #[default]
    Error,
    /// Silently skip.
    AllowAny,
    /// Skip iff the object is known to be promisor-backed.
    AllowPromisor,
    /// Collect into a reportable set, do not fail.
    Print,
}

/// The object-store collaborator ListObjects needs: given an oid, produce
/// its canonical type and raw content. `is_promisor` supports the
/// `AllowPromisor` missing-object policy.
pub trait ObjectSource {
    fn read_object(&self, oid: &ObjectId) -> Result<Option<(ObjectType, Vec<u8>)>, PackError>;

    fn is_promisor(&self, _oid: &ObjectId) -> bool {
        false
    }
}

/// Outcome of a `ListObjects` run.
#[derive(Debug, Default)]
pub struct ListObjectsReport {
    pub missing: Vec<ObjectId>,
}

struct PendingTree {
    oid: ObjectId,
    depth: u16,
    path: Vec<u8>,
}

/// Drives the commit -> tree -> blob walk described in §4.3, populating a
/// `PackingSet` through a `TraversalFilter`.
pub struct ListObjects<'a, S: ObjectSource> {
    source: &'a S,
    filter: &'a TraversalFilter<'a>,
    missing_policy: MissingObjectPolicy,
    seen: HashSet<ObjectId>,
    omitted: OmittedSet,
    pending_trees: Vec<PendingTree>,
    progress: Option<Progress>,
}

impl<'a, S: ObjectSource> ListObjects<'a, S> {
    pub fn new(source: &'a S, filter: &'a TraversalFilter<'a>, missing_policy: MissingObjectPolicy) -> Self {
        Self {
            source,
            filter,
            missing_policy,
            seen: HashSet::new(),
            omitted: OmittedSet::new(),
            pending_trees: Vec::new(),
            progress: None,
        }
    }

    /// Enables the "Counting objects" progress meter (§9 supplemented:
    /// `progress.c`'s three pack-objects phases), ticked once per object
    /// recorded into the `PackingSet`.
    pub fn with_progress(mut self, enabled: bool) -> Self {
        if enabled {
            self.progress = Some(Progress::new("Counting objects", None));
        }
        self
    }

    /// Run the walk: `include` commits (and tags) are roots; `exclude`
    /// commits mark their whole closure as not-to-be-shown (but still
    /// eligible as delta preferred bases via `PackingSet::find_or_insert`'s
    /// `exclude` flag).
    pub fn run(
        mut self,
        set: &mut PackingSet,
        include: &[ObjectId],
        exclude: &[ObjectId],
    ) -> Result<ListObjectsReport, PackError> {
        let mut excluded_closure: HashSet<ObjectId> = HashSet::new();
        for oid in exclude {
            self.collect_closure(*oid, &mut excluded_closure)?;
        }

        for oid in include {
            self.show_commit(set, *oid, &excluded_closure)?;
        }

        // Drain remaining pending trees (step 2: "at end-of-walk, drain
        // remaining").
        while let Some(pending) = self.pending_trees.pop() {
            if excluded_closure.contains(&pending.oid) {
                continue;
            }
            self.walk_tree(set, pending.oid, pending.depth, &pending.path, &excluded_closure)?;
        }

        if let Some(progress) = self.progress.take() {
            progress.finish();
        }

        Ok(ListObjectsReport {
            missing: self.omitted.into_vec(),
        })
    }

    fn collect_closure(&mut self, start: ObjectId, out: &mut HashSet<ObjectId>) -> Result<(), PackError> {
        let mut stack = vec![start];
        while let Some(oid) = stack.pop() {
            if !out.insert(oid) {
                continue;
            }
            match self.source.read_object(&oid)? {
                Some((ObjectType::Commit, content)) => {
                    let commit = Commit::parse(&content)?;
                    stack.push(commit.tree);
                    stack.extend(commit.parents.iter().copied());
                }
                Some((ObjectType::Tree, content)) => {
                    let tree = Tree::parse(&content)?;
                    stack.extend(tree.entries.iter().map(|e| e.oid));
                }
                Some((ObjectType::Tag, content)) => {
                    let tag = Tag::parse(&content)?;
                    stack.push(tag.target);
                }
                Some((ObjectType::Blob, _)) | None => {}
            }
        }
        Ok(())
    }

    fn show_commit(
        &mut self,
        set: &mut PackingSet,
        oid: ObjectId,
        excluded: &HashSet<ObjectId>,
    ) -> Result<(), PackError> {
        if excluded.contains(&oid) || !self.seen.insert(oid) {
            return Ok(());
        }
        let Some((obj_type, content)) = self.source.read_object(&oid)? else {
            return self.handle_missing(oid);
        };

        match obj_type {
            ObjectType::Commit => {
                let commit = Commit::parse(&content)?;
                let visited = VisitedObject {
                    obj_type: ObjectType::Commit,
                    mode: None,
                    size: Some(content.len() as u64),
                    depth: 0,
                };
                let result = self.filter.evaluate(&visited, None);
                self.record(set, oid, ObjectType::Commit, content.len() as u64, result, None);
                self.pending_trees.push(PendingTree {
                    oid: commit.tree,
                    depth: 0,
                    path: Vec::new(),
                });
                for parent in &commit.parents {
                    self.show_commit(set, *parent, excluded)?;
                }
            }
            ObjectType::Tag => {
                let tag = Tag::parse(&content)?;
                let visited = VisitedObject {
                    obj_type: ObjectType::Tag,
                    mode: None,
                    size: Some(content.len() as u64),
                    depth: 0,
                };
                let result = self.filter.evaluate(&visited, None);
                self.record(set, oid, ObjectType::Tag, content.len() as u64, result, None);
                self.show_commit(set, tag.target, excluded)?;
            }
            _ => {
                // A non-commit, non-tag root (e.g. a bare tree/blob ref) is
                // treated as an already-resolved object; record and stop.
                let visited = VisitedObject {
                    obj_type,
                    mode: None,
                    size: Some(content.len() as u64),
                    depth: 0,
                };
                let result = self.filter.evaluate(&visited, None);
                self.record(set, oid, obj_type, content.len() as u64, result, None);
            }
        }
        Ok(())
    }

    fn walk_tree(
        &mut self,
        set: &mut PackingSet,
        oid: ObjectId,
        depth: u16,
        path: &[u8],
        excluded: &HashSet<ObjectId>,
    ) -> Result<(), PackError> {
        if excluded.contains(&oid) || !self.seen.insert(oid) {
            return Ok(());
        }
        let Some((ObjectType::Tree, content)) = self.source.read_object(&oid)? else {
            return self.handle_missing(oid);
        };
        let tree = Tree::parse(&content)?;

        let visited = VisitedObject {
            obj_type: ObjectType::Tree,
            mode: Some(FileMode::Tree),
            size: Some(content.len() as u64),
            depth,
        };
        let result = self.filter.evaluate(&visited, Some(path));
        if let Some(idx) = self.record(set, oid, ObjectType::Tree, content.len() as u64, result, Some(path)) {
            set.get_mut(idx).tree_depth = depth;
        }
        if result.skip_tree {
            return Ok(());
        }

        for te in &tree.entries {
            if excluded.contains(&te.oid) {
                continue;
            }
            let mut child_path = path.to_vec();
            if !child_path.is_empty() {
                child_path.push(b'/');
            }
            child_path.extend_from_slice(&te.name);

            if te.mode.is_tree() {
                self.walk_tree(set, te.oid, depth + 1, &child_path, excluded)?;
            } else if te.mode.is_gitlink() {
                // Submodule links point outside this object graph; nothing
                // to enumerate.
                continue;
            } else {
                self.visit_blob(set, te.oid, &child_path, te.mode, excluded)?;
            }
        }
        Ok(())
    }

    fn visit_blob(
        &mut self,
        set: &mut PackingSet,
        oid: ObjectId,
        path: &[u8],
        mode: FileMode,
        excluded: &HashSet<ObjectId>,
    ) -> Result<(), PackError> {
        if excluded.contains(&oid) || !self.seen.insert(oid) {
            return Ok(());
        }
        let Some((ObjectType::Blob, content)) = self.source.read_object(&oid)? else {
            return self.handle_missing(oid);
        };
        let visited = VisitedObject {
            obj_type: ObjectType::Blob,
            mode: Some(mode),
            size: Some(content.len() as u64),
            depth: 0,
        };
        let result = self.filter.evaluate(&visited, Some(path));
        self.record(set, oid, ObjectType::Blob, content.len() as u64, result, Some(path));
        Ok(())
    }

    fn record(
        &mut self,
        set: &mut PackingSet,
        oid: ObjectId,
        obj_type: ObjectType,
        size: u64,
        result: FilterResult,
        path: Option<&[u8]>,
    ) -> Option<super::entry::EntryIdx> {
        self.omitted.record_if_omitted(oid, result);
        if !result.show {
            return None;
        }
        let name_hash = path.map(pack_name_hash).unwrap_or(0);
        let (idx, _) = set.find_or_insert(oid, obj_type, size, false, name_hash);
        if let Some(progress) = &mut self.progress {
            progress.tick();
        }
        Some(idx)
    }

    fn handle_missing(&mut self, oid: ObjectId) -> Result<(), PackError> {
        match self.missing_policy {
            MissingObjectPolicy::Error => Err(PackError::MissingObject(oid)),
            MissingObjectPolicy::AllowAny => Ok(()),
            MissingObjectPolicy::AllowPromisor => {
                if self.source.is_promisor(&oid) {
                    Ok(())
                } else {
                    Err(PackError::MissingObject(oid))
                }
            }
            MissingObjectPolicy::Print => {
                self.omitted.record_if_omitted(oid, FilterResult::SEEN_ONLY);
                Ok(())
            }
        }
    }
}
