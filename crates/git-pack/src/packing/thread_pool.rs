//! §4.6 ThreadPool — partitions the deltable list across worker threads
//! and runs `DeltaSearch` over each partition (§5's concurrency model:
//! plain OS threads coordinated by mutexes, not `rayon`).
//!
//! True preemptive stealing of an in-flight worker's remaining range would
//! require either unsafe aliasing of a shared buffer or per-chunk locking
//! fine-grained enough to serialize most of the benefit away. Instead this
//! implementation gathers the whole deltable list into one owned buffer up
//! front, rebalances the static partition by estimated workload (a
//! one-shot approximation of "steal from the busiest worker"), then hands
//! each worker a genuinely disjoint `&mut` sub-slice via `split_at_mut` —
//! safe, no unsafe, and still faithful to "a worker never considers as a
//! base an entry outside its current window; no entry is processed by more
//! than one worker" (invariant 6 of §8).

use std::thread;

use git_utils::progress::Progress;

use super::entry::{EntryIdx, ObjectEntry};
use super::packing_set::PackingSet;
use super::search::{deltable_list, gather_segment, scatter_segment, DeltaCache, DeltaSearch, ObjectBytesSource};
use crate::PackError;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
struct Range {
    start: usize,
    end: usize,
}

impl Range {
    fn len(&self) -> usize {
        self.end - self.start
    }
}

pub struct ThreadPool;

impl ThreadPool {
    /// Initial partition (§4.6 first bullet): contiguous ranges over the
    /// sorted deltable list, snapped to `name_hash` run boundaries, with
    /// undersized segments folded into their predecessor.
    fn partition(entries: &[ObjectEntry], thread_count: usize, window: usize) -> Vec<Range> {
        if thread_count <= 1 || entries.len() < 2 * window.max(1) {
            return vec![Range {
                start: 0,
                end: entries.len(),
            }];
        }

        let target_size = entries.len().div_ceil(thread_count);
        let mut bounds = Vec::new();
        let mut pos = 0;
        while pos < entries.len() {
            let mut end = (pos + target_size).min(entries.len());
            while end < entries.len() && entries[end].name_hash == entries[end - 1].name_hash {
                end += 1;
            }
            bounds.push(Range { start: pos, end });
            pos = end;
        }

        let min_len = 2 * window.max(1);
        let mut merged: Vec<Range> = Vec::new();
        for r in bounds {
            if r.len() < min_len && !merged.is_empty() {
                merged.last_mut().unwrap().end = r.end;
            } else {
                merged.push(r);
            }
        }
        merged
    }

    /// One-shot rebalance: move boundary points toward whichever
    /// neighboring segment carries more estimated bytes of work
    /// (`canonical_size` summed), approximating "steal from the busiest
    /// worker" without needing a runtime steal protocol.
    fn rebalance_by_workload(entries: &[ObjectEntry], ranges: &mut [Range], window: usize) {
        if ranges.len() < 2 {
            return;
        }
        let workload = |r: &Range| -> u64 { entries[r.start..r.end].iter().map(|e| e.canonical_size).sum() };
        let min_len = 2 * window.max(1);

        for _ in 0..ranges.len() {
            let loads: Vec<u64> = ranges.iter().map(workload).collect();
            let busiest = loads.iter().enumerate().max_by_key(|&(_, v)| *v).map(|(i, _)| i).unwrap();
            let idlest = loads.iter().enumerate().min_by_key(|&(_, v)| *v).map(|(i, _)| i).unwrap();
            if busiest == idlest || loads[busiest] < 2 * loads[idlest].max(1) {
                break;
            }
            if busiest + 1 == idlest && ranges[busiest].len() > min_len {
                let mid = ranges[busiest].start + ranges[busiest].len() / 2;
                ranges[idlest].start = mid;
                ranges[busiest].end = mid;
            } else if idlest + 1 == busiest && ranges[busiest].len() > min_len {
                let mid = ranges[busiest].start + ranges[busiest].len() / 2;
                ranges[idlest].end = mid;
                ranges[busiest].start = mid;
            } else {
                break;
            }
        }
    }

    /// Run `DeltaSearch` over the entire deltable list of `set`, splitting
    /// work across up to `thread_count` OS threads.
    #[allow(clippy::too_many_arguments)]
    pub fn run<S: ObjectBytesSource + Send + Sync>(
        source: &S,
        set: &mut PackingSet,
        thread_count: usize,
        window: usize,
        max_depth: u8,
        delta_cache_size: u64,
        delta_cache_limit: u64,
        window_memory_limit: u64,
        big_file_threshold: u64,
        enable_progress: bool,
    ) -> Result<(), PackError> {
        let deltable = deltable_list(set, big_file_threshold);
        Self::run_over(
            source,
            set,
            &deltable,
            thread_count,
            window,
            max_depth,
            delta_cache_size,
            delta_cache_limit,
            window_memory_limit,
            enable_progress,
        )
    }

    /// Same as `run`, but over a caller-supplied (already filtered/sorted)
    /// deltable list — used directly by tests and by callers that apply
    /// additional filtering on top of `deltable_list`.
    ///
    /// `enable_progress` drives the "Compressing objects" phase (§9
    /// supplemented feature). Because workers only report their window
    /// positions locally (`DeltaSearch::run_local` is addressed purely by
    /// local position, §4.5), this reports coarse start/end jumps rather
    /// than true per-object ticks across threads — a simplification, not a
    /// per-item progress bar.
    #[allow(clippy::too_many_arguments)]
    pub fn run_over<S: ObjectBytesSource + Send + Sync>(
        source: &S,
        set: &mut PackingSet,
        deltable: &[EntryIdx],
        thread_count: usize,
        window: usize,
        max_depth: u8,
        delta_cache_size: u64,
        delta_cache_limit: u64,
        window_memory_limit: u64,
        enable_progress: bool,
    ) -> Result<(), PackError> {
        if deltable.is_empty() {
            return Ok(());
        }

        let mut progress = enable_progress.then(|| Progress::new("Compressing objects", Some(deltable.len() as u64)));

        let mut pool = gather_segment(set, deltable);
        let cache = DeltaCache::new(delta_cache_size);

        if thread_count <= 1 || pool.len() <= window.max(1) {
            let search = DeltaSearch::new(source, window, max_depth, delta_cache_limit, &cache)
                .with_window_memory_limit(window_memory_limit);
            search.run_local(&mut pool)?;
            scatter_segment(set, deltable, &pool);
            if let Some(progress) = progress.take() {
                finish_progress(progress, deltable.len() as u64);
            }
            return Ok(());
        }

        let mut ranges = Self::partition(&pool, thread_count, window);
        Self::rebalance_by_workload(&pool, &mut ranges, window);

        thread::scope(|scope| -> Result<(), PackError> {
            let mut remaining: &mut [ObjectEntry] = &mut pool;
            let mut slices = Vec::with_capacity(ranges.len());
            let mut consumed = 0usize;
            for r in &ranges {
                let (head, tail) = remaining.split_at_mut(r.end - consumed);
                slices.push(head);
                remaining = tail;
                consumed = r.end;
            }

            let mut handles = Vec::with_capacity(slices.len());
            for slice in slices {
                let search = DeltaSearch::new(source, window, max_depth, delta_cache_limit, &cache)
                    .with_window_memory_limit(window_memory_limit);
                handles.push(scope.spawn(move || search.run_local(slice)));
            }
            for h in handles {
                h.join().expect("delta search worker panicked")?;
            }
            Ok(())
        })?;

        scatter_segment(set, deltable, &pool);
        if let Some(progress) = progress.take() {
            finish_progress(progress, deltable.len() as u64);
        }
        Ok(())
    }
}

fn finish_progress(mut progress: Progress, total: u64) {
    progress.update(total);
    progress.finish();
}
