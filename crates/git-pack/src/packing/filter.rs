//! §4.2 TraversalFilter — per-object show/seen/skip decisions during the walk.

use git_object::{FileMode, ObjectType};

/// The three independent bits a filter may set for a visited object.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct FilterResult {
    /// Include the object in the written pack.
    pub show: bool,
    /// Mark the object as visited, regardless of whether it is shown.
    pub mark_seen: bool,
    /// For trees: do not descend into this tree's entries.
    pub skip_tree: bool,
}

impl FilterResult {
    pub const SHOW_AND_SEEN: Self = FilterResult {
        show: true,
        mark_seen: true,
        skip_tree: false,
    };
    pub const SEEN_ONLY: Self = FilterResult {
        show: false,
        mark_seen: true,
        skip_tree: false,
    };
    pub const SKIP: Self = FilterResult {
        show: false,
        mark_seen: false,
        skip_tree: true,
    };
}

/// A lightweight description of the object currently being visited, enough
/// for every filter variant to make its decision without a full object
/// read.
#[derive(Debug, Clone, Copy)]
pub struct VisitedObject {
    pub obj_type: ObjectType,
    pub mode: Option<FileMode>,
    pub size: Option<u64>,
    pub depth: u16,
}

/// Resolves a sparse-checkout-style spec object to a set of path patterns.
/// An external collaborator, since the spec's "ignore-style" pattern
/// resolution reads an object from the store.
pub trait SparseSpecResolver {
    fn path_included(&self, path: &[u8]) -> bool;
}

/// §4.2 — per-object show/seen/skip decision, composable via `Combine`.
pub enum TraversalFilter<'a> {
    None,
    BlobNone,
    BlobLimit(u64),
    TreeDepth(u16),
    SparseOid(&'a dyn SparseSpecResolver),
    Combine(Vec<TraversalFilter<'a>>),
}

fn is_blob_mode(mode: Option<FileMode>) -> bool {
    matches!(
        mode,
        Some(FileMode::Regular) | Some(FileMode::Executable) | Some(FileMode::Symlink) | None
    )
}

impl<'a> TraversalFilter<'a> {
    /// Evaluate this filter against a visited object, optionally carrying
    /// the path for `SparseOid`. `path` is `None` for commits/tags.
    pub fn evaluate(&self, obj: &VisitedObject, path: Option<&[u8]>) -> FilterResult {
        match self {
            TraversalFilter::None => FilterResult::SHOW_AND_SEEN,
            TraversalFilter::BlobNone => {
                if obj.obj_type == ObjectType::Blob {
                    FilterResult::SEEN_ONLY
                } else {
                    FilterResult::SHOW_AND_SEEN
                }
            }
            TraversalFilter::BlobLimit(limit) => {
                if obj.obj_type == ObjectType::Blob && is_blob_mode(obj.mode) {
                    match obj.size {
                        Some(size) if size >= *limit => FilterResult::SEEN_ONLY,
                        _ => FilterResult::SHOW_AND_SEEN,
                    }
                } else {
                    FilterResult::SHOW_AND_SEEN
                }
            }
            TraversalFilter::TreeDepth(max_depth) => {
                if obj.obj_type == ObjectType::Tree && obj.depth > *max_depth {
                    FilterResult::SKIP
                } else {
                    FilterResult::SHOW_AND_SEEN
                }
            }
            TraversalFilter::SparseOid(resolver) => match path {
                Some(p) if !resolver.path_included(p) => FilterResult::SEEN_ONLY,
                _ => FilterResult::SHOW_AND_SEEN,
            },
            TraversalFilter::Combine(filters) => {
                let mut show = true;
                let mut mark_seen = false;
                let mut skip_tree = true;
                for f in filters {
                    let r = f.evaluate(obj, path);
                    show &= r.show;
                    mark_seen |= r.mark_seen;
                    skip_tree &= r.skip_tree;
                }
                if filters.is_empty() {
                    return FilterResult::SHOW_AND_SEEN;
                }
                FilterResult {
                    show,
                    mark_seen,
                    skip_tree,
                }
            }
        }
    }
}

/// Accumulates the "omitted" set (shown as seen but not shown) on request,
/// per §4.2's final paragraph.
#[derive(Debug, Default)]
pub struct OmittedSet {
    oids: Vec<git_hash::ObjectId>,
}

impl OmittedSet {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn record_if_omitted(&mut self, oid: git_hash::ObjectId, result: FilterResult) {
        if result.mark_seen && !result.show {
            self.oids.push(oid);
        }
    }

    pub fn into_vec(self) -> Vec<git_hash::ObjectId> {
        self.oids
    }
}
