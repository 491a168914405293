//! Fork-join parallel execution over an explicitly owned thread pool.
//!
//! Every parallel kernel in this crate receives an [`ExecutionContext`] and a
//! thread count from its caller. There is no global pool: the context is
//! created once per solve (or once per application) and passed by reference.
//!
//! The primitives here split a range into at most `num_threads` contiguous
//! chunks, run the first chunk on the calling thread and the remaining ones on
//! the pool, and block until a [`BlockUntilFinished`] counter has seen every
//! chunk complete. Chunks never wait on each other.

pub mod vector_ops;

pub use vector_ops::*;

use crate::error::ApexResult;
use std::ops::Range;
use std::sync::{Condvar, Mutex};

/// Owns the worker pool used by every parallel kernel.
pub struct ExecutionContext {
    thread_pool: rayon::ThreadPool,
}

impl ExecutionContext {
    /// Create a context whose pool has `num_threads` workers (at least one).
    pub fn new(num_threads: usize) -> ApexResult<Self> {
        let thread_pool = rayon::ThreadPoolBuilder::new()
            .num_threads(num_threads.max(1))
            .thread_name(|index| format!("apex-worker-{index}"))
            .build()?;
        tracing::debug!(
            "Created execution context with {} worker threads",
            thread_pool.current_num_threads()
        );
        Ok(Self { thread_pool })
    }

    /// Context sized by the number of available hardware threads.
    pub fn with_available_parallelism() -> ApexResult<Self> {
        let num_threads = std::thread::available_parallelism()
            .map(|n| n.get())
            .unwrap_or(1);
        Self::new(num_threads)
    }

    /// Number of worker threads in the pool.
    pub fn num_workers(&self) -> usize {
        self.thread_pool.current_num_threads()
    }

    /// Effective number of chunks for a request of `num_threads`: the calling
    /// thread plus every pool worker can each take one.
    pub(crate) fn max_chunks(&self, num_threads: usize) -> usize {
        num_threads.clamp(1, self.num_workers() + 1)
    }

    /// True when called from one of this context's own workers. Nested
    /// parallel regions run inline so a worker never blocks on its own pool.
    fn on_worker_thread(&self) -> bool {
        self.thread_pool.current_thread_index().is_some()
    }
}

impl std::fmt::Debug for ExecutionContext {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ExecutionContext")
            .field("num_workers", &self.num_workers())
            .finish()
    }
}

/// Completion counter for one batch of parallel work.
///
/// Initialised with the total number of work items. Each finished chunk
/// reports how many items it completed; the thread blocked in
/// [`BlockUntilFinished::block`] wakes once the total has been reached.
#[derive(Debug)]
pub struct BlockUntilFinished {
    num_total_jobs: usize,
    num_jobs_finished: Mutex<usize>,
    condition: Condvar,
}

impl BlockUntilFinished {
    pub fn new(num_total_jobs: usize) -> Self {
        Self {
            num_total_jobs,
            num_jobs_finished: Mutex::new(0),
            condition: Condvar::new(),
        }
    }

    /// Record `num_jobs_finished` completed items.
    pub fn finished(&self, num_jobs_finished: usize) {
        if num_jobs_finished == 0 {
            return;
        }
        let mut finished = self
            .num_jobs_finished
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner());
        *finished += num_jobs_finished;
        assert!(
            *finished <= self.num_total_jobs,
            "More jobs finished ({}) than were scheduled ({})",
            *finished,
            self.num_total_jobs
        );
        if *finished == self.num_total_jobs {
            self.condition.notify_one();
        }
    }

    /// Block the caller until every scheduled item has been reported.
    pub fn block(&self) {
        let finished = self
            .num_jobs_finished
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner());
        let _guard = self
            .condition
            .wait_while(finished, |finished| *finished != self.num_total_jobs)
            .unwrap_or_else(|poisoned| poisoned.into_inner());
    }
}

/// Reports one finished job on drop, so a panicking chunk cannot leave the
/// submitting thread blocked forever. The panic itself resurfaces when the
/// surrounding rayon scope ends.
struct FinishedOnDrop<'a>(&'a BlockUntilFinished);

impl Drop for FinishedOnDrop<'_> {
    fn drop(&mut self) {
        self.0.finished(1);
    }
}

/// Run `function(chunk_index, task)` once for every task, concurrently.
///
/// Tasks usually carry disjoint `&mut` sub-slices of an output vector, which
/// is what lets the chunks write without any locking.
pub fn parallel_invoke<T, F>(context: &ExecutionContext, tasks: Vec<T>, function: F)
where
    T: Send,
    F: Fn(usize, T) + Sync,
{
    if tasks.len() <= 1 || context.on_worker_thread() {
        for (index, task) in tasks.into_iter().enumerate() {
            function(index, task);
        }
        return;
    }

    let block_until_finished = BlockUntilFinished::new(tasks.len());
    context.thread_pool.in_place_scope(|scope| {
        let mut tasks = tasks.into_iter().enumerate();
        let first = tasks.next();
        for (index, task) in tasks {
            let function = &function;
            let block_until_finished = &block_until_finished;
            scope.spawn(move |_| {
                let _finished = FinishedOnDrop(block_until_finished);
                function(index, task);
            });
        }
        if let Some((index, task)) = first {
            let _finished = FinishedOnDrop(&block_until_finished);
            function(index, task);
        }
        block_until_finished.block();
    });
}

/// Split `[begin, end)` into at most `num_threads` contiguous chunks of
/// roughly equal length, none shorter than `min_chunk_size` (except when the
/// whole range is). Returns the chunk boundaries, `begin` and `end` included.
pub fn partition_range(
    begin: usize,
    end: usize,
    num_threads: usize,
    min_chunk_size: usize,
) -> Vec<usize> {
    if end <= begin {
        return vec![begin, begin];
    }
    let len = end - begin;
    let max_chunks_by_size = (len / min_chunk_size.max(1)).max(1);
    let num_chunks = num_threads.max(1).min(max_chunks_by_size).min(len);

    let base = len / num_chunks;
    let remainder = len % num_chunks;
    let mut boundaries = Vec::with_capacity(num_chunks + 1);
    let mut position = begin;
    boundaries.push(position);
    for chunk in 0..num_chunks {
        position += base + usize::from(chunk < remainder);
        boundaries.push(position);
    }
    boundaries
}

/// Split `[begin, end)` into at most `num_threads` contiguous chunks whose
/// total cost is balanced rather than their length.
///
/// `cumulative_cost(i)` must be non-decreasing and return the total cost of
/// items `0..=i` (e.g. the running non-zero count of block rows).
pub fn partition_range_by_cost<C>(
    begin: usize,
    end: usize,
    num_threads: usize,
    cumulative_cost: C,
) -> Vec<usize>
where
    C: Fn(usize) -> usize,
{
    if end <= begin {
        return vec![begin, begin];
    }
    let num_chunks = num_threads.max(1).min(end - begin);
    let cost_before = if begin == 0 { 0 } else { cumulative_cost(begin - 1) };
    let total_cost = cumulative_cost(end - 1) - cost_before;
    if num_chunks == 1 || total_cost == 0 {
        return partition_range(begin, end, num_threads, 1);
    }

    let mut boundaries = Vec::with_capacity(num_chunks + 1);
    boundaries.push(begin);
    for chunk in 1..num_chunks {
        let target = cost_before + (total_cost * chunk).div_ceil(num_chunks);
        let previous = *boundaries.last().unwrap_or(&begin);
        // First index whose cumulative cost reaches the target; every chunk
        // gets at least one item.
        let (mut lo, mut hi) = (previous, end);
        while lo < hi {
            let mid = lo + (hi - lo) / 2;
            if cumulative_cost(mid) < target {
                lo = mid + 1;
            } else {
                hi = mid;
            }
        }
        let boundary = (lo + 1).max(previous + 1).min(end);
        if boundary < end {
            boundaries.push(boundary);
        }
    }
    boundaries.push(end);
    boundaries.dedup();
    boundaries
}

/// Turn chunk boundaries into ranges.
pub fn chunk_ranges(boundaries: &[usize]) -> Vec<Range<usize>> {
    boundaries.windows(2).map(|w| w[0]..w[1]).collect()
}

/// Group `items` into consecutive runs following `boundaries`; item `k` of
/// the input belongs to the chunk whose range contains `boundaries[0] + k`.
pub fn group_by_chunks<T>(items: Vec<T>, boundaries: &[usize]) -> Vec<(Range<usize>, Vec<T>)> {
    let mut items = items.into_iter();
    chunk_ranges(boundaries)
        .into_iter()
        .map(|range| {
            let group: Vec<T> = items.by_ref().take(range.len()).collect();
            (range, group)
        })
        .collect()
}

/// Fork-join loop over `range`. `function` receives one contiguous chunk of
/// indices together with the matching piece of `data` (`data[0]` belongs to
/// `range.start`), and the caller blocks until all chunks are done.
pub fn parallel_for<T, F>(
    context: &ExecutionContext,
    range: Range<usize>,
    num_threads: usize,
    min_chunk_size: usize,
    data: &mut [T],
    function: F,
) where
    T: Send,
    F: Fn(Range<usize>, &mut [T]) + Sync,
{
    assert_eq!(data.len(), range.len(), "parallel_for: data does not cover the range");
    let boundaries = partition_range(
        range.start,
        range.end,
        context.max_chunks(num_threads),
        min_chunk_size,
    );
    let offsets: Vec<usize> = boundaries.iter().map(|b| b - range.start).collect();
    let tasks: Vec<_> = chunk_ranges(&boundaries)
        .into_iter()
        .zip(split_at_offsets(data, &offsets))
        .collect();
    parallel_invoke(context, tasks, |_, (chunk, piece)| function(chunk, piece));
}

/// Like [`parallel_for`] but chunk boundaries balance `cumulative_cost`
/// rather than the index count.
///
/// Items may own output pieces of different lengths: item `i` owns
/// `output[output_offset(i)..output_offset(i + 1)]`, and `output_offset` must
/// be non-decreasing on `range.start..=range.end`.
pub fn parallel_for_with_cost<T, F, C, O>(
    context: &ExecutionContext,
    range: Range<usize>,
    num_threads: usize,
    cumulative_cost: C,
    output: &mut [T],
    output_offset: O,
    function: F,
) where
    T: Send,
    F: Fn(Range<usize>, &mut [T]) + Sync,
    C: Fn(usize) -> usize,
    O: Fn(usize) -> usize,
{
    let boundaries = partition_range_by_cost(
        range.start,
        range.end,
        context.max_chunks(num_threads),
        cumulative_cost,
    );
    let offsets: Vec<usize> = boundaries.iter().map(|&b| output_offset(b)).collect();
    let first = offsets.first().copied().unwrap_or(0);
    let tasks: Vec<_> = chunk_ranges(&boundaries)
        .into_iter()
        .zip(split_at_offsets(&mut output[first..], &offsets))
        .collect();
    parallel_invoke(context, tasks, |_, (chunk, piece)| function(chunk, piece));
}

/// Split `data` into consecutive mutable pieces whose lengths are
/// `offsets[i + 1] - offsets[i]`, relative to `offsets[0]`.
pub fn split_at_offsets<'a, T>(mut data: &'a mut [T], offsets: &[usize]) -> Vec<&'a mut [T]> {
    let mut pieces = Vec::with_capacity(offsets.len().saturating_sub(1));
    for window in offsets.windows(2) {
        let (head, tail) = std::mem::take(&mut data).split_at_mut(window[1] - window[0]);
        pieces.push(head);
        data = tail;
    }
    pieces
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Arc;
    use std::sync::atomic::{AtomicUsize, Ordering};

    #[test]
    fn test_partition_range_covers_everything() {
        let boundaries = partition_range(3, 20, 4, 1);
        assert_eq!(boundaries.first(), Some(&3));
        assert_eq!(boundaries.last(), Some(&20));
        assert_eq!(boundaries.len(), 5);
        for w in boundaries.windows(2) {
            assert!(w[1] > w[0]);
        }
    }

    #[test]
    fn test_partition_range_respects_min_chunk_size() {
        let boundaries = partition_range(0, 100, 8, 40);
        assert_eq!(boundaries, vec![0, 50, 100]);
        assert_eq!(partition_range(0, 10, 4, 1000), vec![0, 10]);
        assert_eq!(partition_range(5, 5, 4, 1), vec![5, 5]);
    }

    #[test]
    fn test_partition_by_cost_balances_skewed_rows() {
        // One very expensive item followed by many cheap ones.
        let costs = [100usize, 1, 1, 1, 1, 1, 1, 1, 1, 1, 1, 1];
        let cumulative: Vec<usize> = costs
            .iter()
            .scan(0, |acc, c| {
                *acc += c;
                Some(*acc)
            })
            .collect();
        let boundaries = partition_range_by_cost(0, costs.len(), 2, |i| cumulative[i]);
        assert_eq!(boundaries, vec![0, 1, costs.len()]);
    }

    #[test]
    fn test_partition_by_cost_never_produces_empty_chunks() {
        let cumulative: Vec<usize> = (1..=10).collect();
        for threads in 1..12 {
            let boundaries = partition_range_by_cost(0, 10, threads, |i| cumulative[i]);
            assert_eq!(boundaries[0], 0);
            assert_eq!(*boundaries.last().unwrap(), 10);
            for w in boundaries.windows(2) {
                assert!(w[1] > w[0], "empty chunk in {boundaries:?}");
            }
        }
    }

    #[test]
    fn test_group_by_chunks_follows_boundaries() {
        let groups = group_by_chunks(vec!['a', 'b', 'c', 'd', 'e'], &[2, 3, 7]);
        assert_eq!(groups.len(), 2);
        assert_eq!(groups[0], (2..3, vec!['a']));
        assert_eq!(groups[1], (3..7, vec!['b', 'c', 'd', 'e']));
    }

    #[test]
    fn test_block_until_finished_across_threads() {
        let barrier = Arc::new(BlockUntilFinished::new(6));
        let handles: Vec<_> = (0..3)
            .map(|_| {
                let barrier = Arc::clone(&barrier);
                std::thread::spawn(move || barrier.finished(2))
            })
            .collect();
        barrier.block();
        for handle in handles {
            handle.join().unwrap();
        }
    }

    #[test]
    fn test_execution_context_debug_reports_workers() {
        let context = ExecutionContext::new(3).unwrap();
        assert_eq!(format!("{context:?}"), "ExecutionContext { num_workers: 3 }");
    }

    #[test]
    fn test_parallel_for_visits_every_index_once() {
        let context = ExecutionContext::new(4).unwrap();
        let mut visits = vec![0usize; 1000];
        parallel_for(&context, 0..1000, 4, 1, &mut visits, |range, piece| {
            assert_eq!(range.len(), piece.len());
            piece.iter_mut().for_each(|v| *v += 1);
        });
        assert!(visits.iter().all(|&v| v == 1));
    }

    #[test]
    fn test_parallel_for_hands_out_offset_range() {
        let context = ExecutionContext::new(3).unwrap();
        let mut data = vec![0usize; 20];
        parallel_for(&context, 5..25, 3, 4, &mut data, |range, piece| {
            for (i, v) in range.zip(piece.iter_mut()) {
                *v = i;
            }
        });
        assert_eq!(data, (5..25).collect::<Vec<_>>());
    }

    #[test]
    fn test_parallel_for_with_cost_covers_skewed_range() {
        let context = ExecutionContext::new(4).unwrap();
        let cumulative: Vec<usize> = (1..=50).map(|i| i * i).collect();
        let mut visits = vec![0usize; 50];
        let chunks = AtomicUsize::new(0);
        parallel_for_with_cost(
            &context,
            0..50,
            4,
            |i| cumulative[i],
            &mut visits,
            |i| i,
            |range, piece| {
                chunks.fetch_add(1, Ordering::Relaxed);
                assert_eq!(range.len(), piece.len());
                piece.iter_mut().for_each(|v| *v += 1);
            },
        );
        assert!(visits.iter().all(|&v| v == 1));
        assert!(chunks.load(Ordering::Relaxed) <= 4);
    }

    #[test]
    fn test_parallel_for_with_cost_splits_variable_sized_output() {
        let context = ExecutionContext::new(4).unwrap();
        // Item i owns i + 1 output entries.
        let offsets: Vec<usize> = (0..=8).map(|i| i * (i + 1) / 2).collect();
        let mut output = vec![usize::MAX; offsets[8]];
        parallel_for_with_cost(
            &context,
            0..8,
            4,
            |i| offsets[i + 1],
            &mut output,
            |i| offsets[i],
            |range, piece| {
                let base = offsets[range.start];
                for i in range {
                    piece[offsets[i] - base..offsets[i + 1] - base].fill(i);
                }
            },
        );
        let expected: Vec<usize> = (0..8).flat_map(|i| std::iter::repeat_n(i, i + 1)).collect();
        assert_eq!(output, expected);
    }

    #[test]
    fn test_parallel_invoke_writes_disjoint_slices() {
        let context = ExecutionContext::new(3).unwrap();
        let mut data = vec![0usize; 12];
        let offsets = [0, 3, 7, 12];
        let pieces = split_at_offsets(&mut data, &offsets);
        parallel_invoke(&context, pieces, |chunk, piece| {
            piece.iter_mut().for_each(|v| *v = chunk + 1);
        });
        assert_eq!(data, vec![1, 1, 1, 2, 2, 2, 2, 3, 3, 3, 3, 3]);
    }

    #[test]
    fn test_nested_parallel_for_runs_inline() {
        let context = ExecutionContext::new(2).unwrap();
        let total = AtomicUsize::new(0);
        let mut outer_data = vec![0usize; 4];
        parallel_for(&context, 0..4, 2, 1, &mut outer_data, |outer, _| {
            for _ in outer {
                let mut inner_data = vec![0usize; 10];
                parallel_for(&context, 0..10, 2, 1, &mut inner_data, |inner, _| {
                    total.fetch_add(inner.len(), Ordering::Relaxed);
                });
            }
        });
        assert_eq!(total.load(Ordering::Relaxed), 40);
    }
}
