//! The pack-objects engine: builds a `PackingSet` from a traversal, finds
//! delta opportunities across worker threads, and writes a pack + index.

pub mod config;
pub mod entry;
pub mod filter;
pub mod islands;
pub mod list_objects;
pub mod packing_set;
pub mod reuse;
pub mod search;
pub mod thread_pool;
pub mod write_order;
pub mod writer;

pub use config::PackConfig;
pub use entry::{DfsState, EntryArena, EntryIdx, ObjectEntry, PackRef};
pub use filter::{FilterResult, OmittedSet, SparseSpecResolver, TraversalFilter, VisitedObject};
pub use islands::{in_same_island, DeltaIslands, IslandLoadResult};
pub use list_objects::{ListObjects, ListObjectsReport, MissingObjectPolicy, ObjectSource};
pub use packing_set::{Existed, PackingSet, PreferredBaseSource};
pub use reuse::{DeltaBaseReuser, PackBytesSource};
pub use search::DeltaSearch;
pub use thread_pool::ThreadPool;
pub use write_order::WriteOrder;
pub use writer::{preserve_mtime_order, select_base_ref, BaseRef, EntryPayload, WriteOutcome, Writer};

use std::collections::HashMap;
use std::path::{Path, PathBuf};

use git_hash::ObjectId;

use crate::delta::compute::compute_delta;
use crate::packing::search::ObjectBytesSource;
use crate::PackError;

/// Extends `ObjectBytesSource` with the hooks `build_pack` needs to run
/// `DeltaBaseReuser` (§4.4) against an existing source pack. A caller
/// building purely from loose objects (no pack to reuse deltas from) can
/// leave all three at their default no-ops and `build_pack` skips the reuse
/// pass entirely.
pub trait PackBuildSource: ObjectBytesSource {
    /// The source pack's byte view, if one is being repacked.
    fn reuse_source(&self) -> Option<&dyn PackBytesSource> {
        None
    }
    /// Resolve an OfsDelta base's pack-relative offset to an `EntryIdx`
    /// already present in `set`, if the base is in the same source pack.
    fn resolve_ofs_base(&self, _set: &PackingSet, _offset: u64) -> Option<EntryIdx> {
        None
    }
    /// Resolve a RefDelta base's oid to an `EntryIdx` already present in
    /// `set`.
    fn resolve_ref_base(&self, _set: &PackingSet, _oid: &ObjectId) -> Option<EntryIdx> {
        None
    }
}

/// One pack + index written by `build_pack`. More than one entry means
/// `PackConfig::pack_size_limit` forced a split (§8 S4).
#[derive(Debug, Clone)]
pub struct BuiltPack {
    pub pack_path: PathBuf,
    pub index_path: PathBuf,
    pub checksum: ObjectId,
    pub object_count: u32,
}

/// The end-to-end engine entry point: `PackingSet` → (optional)
/// `DeltaBaseReuser` → `ThreadPool`/`DeltaSearch` → `WriteOrder` → `Writer`,
/// driven entirely by `config`. `set` must already be populated (via
/// `ListObjects`/`find_or_insert`/`add_preferred_base`) and not yet frozen.
///
/// Returns one `BuiltPack` per output `.pack`/`.idx` pair. More than one
/// means the run was split under `pack_size_limit`; callers that write
/// bitmaps should skip doing so in that case (§4.8 Finalization note, S4) —
/// `build_pack` already warns on stderr when this happens.
pub fn build_pack<S>(
    set: &mut PackingSet,
    source: &S,
    config: &PackConfig,
    output_dir: &Path,
    tagged_oids: &[ObjectId],
) -> Result<Vec<BuiltPack>, PackError>
where
    S: PackBuildSource + Send + Sync,
{
    if config.reuse_delta || config.reuse_object {
        if let Some(reuse_source) = source.reuse_source() {
            let reuser = DeltaBaseReuser::new(reuse_source, config.verify_reused, config.depth);
            reuser.reuse_pass(
                set,
                |s, offset| source.resolve_ofs_base(s, offset),
                |s, oid| source.resolve_ref_base(s, oid),
            )?;
        }
    }

    ThreadPool::run(
        source,
        set,
        config.resolved_threads(),
        config.window,
        config.depth,
        config.delta_cache_size,
        config.delta_cache_limit,
        config.window_memory_limit,
        config.big_file_threshold,
        true,
    )?;

    set.freeze();

    let max_layers = if config.delta_islands {
        set.iter().map(|(_, e)| e.layer as u16).max().map(|m| m + 1).unwrap_or(1) as u8
    } else {
        1
    };
    let order = WriteOrder::compute(set, tagged_oids, max_layers);

    write_ordered(set, source, config, output_dir, &order)
}

/// §4.8 Writer driver: streams `order` into one or more `.pack`/`.idx` pairs,
/// starting a new `Writer` whenever `pack_size_limit` forces a `Break`
/// (§8 S4). Deltas whose base landed in an earlier, already-finalized pack
/// are re-emitted as full objects rather than carried across the split —
/// each resulting pack stays self-contained.
fn write_ordered<S: ObjectBytesSource>(
    set: &PackingSet,
    source: &S,
    config: &PackConfig,
    output_dir: &Path,
    order: &[EntryIdx],
) -> Result<Vec<BuiltPack>, PackError> {
    std::fs::create_dir_all(output_dir)?;
    let total = order.len() as u64;

    let mut built = Vec::new();
    let mut placed: HashMap<EntryIdx, (usize, u64)> = HashMap::new();
    let mut pack_idx = 0usize;
    let mut cursor = 0usize;

    while cursor < order.len() {
        let tmp_path = output_dir.join(format!("pack-tmp-{pack_idx}.pack"));
        let mut writer =
            Writer::new(&tmp_path, config.compression_level, config.pack_size_limit)?.with_progress(true, Some(total));

        while cursor < order.len() {
            let idx = order[cursor];
            let entry = set.get(idx).clone();
            let oid = entry.oid;

            let outcome = match entry.delta_parent {
                Some(parent) if placed.get(&parent).is_some_and(|&(p, _)| p == pack_idx) => {
                    let (_, base_offset) = placed[&parent];
                    let base_oid = set.get(parent).oid;
                    let base_ref = select_base_ref(base_offset, base_oid, config.allow_ofs_delta);
                    let delta_bytes = match &entry.cached_delta_bytes {
                        Some(cached) => cached.to_vec(),
                        None => {
                            let base_bytes = source.load_bytes(&base_oid)?;
                            let target_bytes = source.load_bytes(&oid)?;
                            compute_delta(&base_bytes, &target_bytes)
                        }
                    };
                    writer.write_entry(
                        oid,
                        EntryPayload::FreshDelta {
                            base: base_ref,
                            uncompressed: &delta_bytes,
                        },
                    )?
                }
                _ => {
                    let bytes = source.load_bytes(&oid)?;
                    writer.write_entry(
                        oid,
                        EntryPayload::FreshObject {
                            obj_type: entry.canonical_type,
                            uncompressed: &bytes,
                        },
                    )?
                }
            };

            match outcome {
                WriteOutcome::Written { offset, .. } => {
                    placed.insert(idx, (pack_idx, offset));
                    cursor += 1;
                }
                WriteOutcome::Break => break,
            }
        }

        let (pack_path, checksum, mut entries) = writer.finalize()?;
        let index_path = pack_path.with_extension("idx");
        crate::write::build_pack_index(&index_path, &mut entries, &checksum)?;
        built.push(BuiltPack {
            object_count: entries.len() as u32,
            pack_path,
            index_path,
            checksum,
        });
        pack_idx += 1;
    }

    if built.len() > 1 {
        eprintln!("warning: pack split into {} packs; suppressing bitmap output", built.len());
        let paths: Vec<PathBuf> = built.iter().map(|b| b.pack_path.clone()).collect();
        preserve_mtime_order(&paths)?;
    }

    Ok(built)
}
