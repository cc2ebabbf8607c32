//! Arena-backed buffer pool.
//!
//! The pool carves fixed-size arenas (32 KiB by default) into segments.
//! Two policies exist:
//!
//! - [`PoolPolicy::AdHoc`]: every borrow allocates fresh memory and returns
//!   are dropped. Useful for tests and short-lived clients.
//! - [`PoolPolicy::Recycling`]: returned segments go onto a shared free list.
//!   On every return, runs from the same arena are sorted by offset and
//!   coalesced into maximal contiguous runs, which bounds fragmentation.
//!
//! A borrow of at most one chunk is always served by a single segment, so
//! socket reads of up to `chunk_size` bytes see contiguous memory.

use std::sync::atomic::{AtomicU64, AtomicUsize, Ordering};
use std::sync::Arc;

use bytes::BytesMut;
use parking_lot::Mutex;
use serde::Deserialize;

use super::chunk::ChunkBuffer;
use super::segment::{Segment, UNPOOLED};
use crate::error::{Result, RpcError};

/// Default arena / chunk size.
pub const DEFAULT_CHUNK_SIZE: usize = 32 * 1024;

static NEXT_POOL_ID: AtomicU64 = AtomicU64::new(UNPOOLED + 1);
static NEXT_ARENA_ID: AtomicU64 = AtomicU64::new(1);

/// Allocation policy of a [`BufferPool`].
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum PoolPolicy {
    /// Always allocate, never retain.
    AdHoc,
    /// Keep returned memory on a free list.
    #[default]
    Recycling,
}

/// Snapshot of pool counters.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct PoolStats {
    /// Arenas allocated over the pool's lifetime.
    pub arenas: usize,
    /// Bytes currently on the free list.
    pub free_bytes: usize,
    /// Number of free runs on the free list.
    pub free_runs: usize,
    /// Bytes currently handed out.
    pub leased_bytes: usize,
}

#[derive(Default)]
struct PoolMetrics {
    arenas: AtomicUsize,
    leased_bytes: AtomicUsize,
}

struct PoolShared {
    id: u64,
    policy: PoolPolicy,
    chunk_size: usize,
    free: Mutex<Vec<Segment>>,
    metrics: PoolMetrics,
}

/// A shared pool of byte segments. Cloning yields another handle to the
/// same pool.
#[derive(Clone)]
pub struct BufferPool {
    shared: Arc<PoolShared>,
}

impl BufferPool {
    /// Create a pool with the given policy and arena size.
    ///
    /// A zero `chunk_size` falls back to [`DEFAULT_CHUNK_SIZE`].
    pub fn new(policy: PoolPolicy, chunk_size: usize) -> Self {
        let chunk_size = if chunk_size == 0 {
            DEFAULT_CHUNK_SIZE
        } else {
            chunk_size
        };
        Self {
            shared: Arc::new(PoolShared {
                id: NEXT_POOL_ID.fetch_add(1, Ordering::Relaxed),
                policy,
                chunk_size,
                free: Mutex::new(Vec::new()),
                metrics: PoolMetrics::default(),
            }),
        }
    }

    /// Recycling pool with default chunk size.
    pub fn recycling() -> Self {
        Self::new(PoolPolicy::Recycling, DEFAULT_CHUNK_SIZE)
    }

    /// Pass-through pool with default chunk size.
    pub fn ad_hoc() -> Self {
        Self::new(PoolPolicy::AdHoc, DEFAULT_CHUNK_SIZE)
    }

    #[inline]
    pub fn policy(&self) -> PoolPolicy {
        self.shared.policy
    }

    #[inline]
    pub fn chunk_size(&self) -> usize {
        self.shared.chunk_size
    }

    /// Whether two handles refer to the same pool.
    pub fn same_pool(&self, other: &BufferPool) -> bool {
        self.shared.id == other.shared.id
    }

    /// Borrow a buffer of exactly `length` bytes.
    ///
    /// # Errors
    ///
    /// `InvalidArgument` when `length` is zero.
    pub fn borrow(&self, length: usize) -> Result<ChunkBuffer> {
        if length == 0 {
            return Err(RpcError::invalid("borrow length must be positive"));
        }
        let segments = self.take_segments(length);
        Ok(ChunkBuffer::from_segments(segments, Some(self.clone())))
    }

    /// Return a buffer to the pool.
    ///
    /// # Errors
    ///
    /// `InvalidArgument` when the buffer did not come from this pool. The
    /// rejected buffer still goes back to its own pool when dropped.
    pub fn give_back(&self, mut buffer: ChunkBuffer) -> Result<()> {
        let owned = match buffer.pool() {
            Some(pool) => pool.same_pool(self),
            None => false,
        };
        if !owned
            || buffer
                .raw_segments()
                .iter()
                .any(|s| s.pool_id() != self.shared.id)
        {
            return Err(RpcError::invalid("buffer did not originate from this pool"));
        }
        let segments = buffer.take_segments();
        buffer.detach_pool();
        self.recycle(segments);
        Ok(())
    }

    /// Drop every free run.
    pub fn shrink(&self) -> usize {
        let mut free = self.shared.free.lock();
        let reclaimed = free.iter().map(Segment::len).sum();
        free.clear();
        reclaimed
    }

    pub fn stats(&self) -> PoolStats {
        let free = self.shared.free.lock();
        PoolStats {
            arenas: self.shared.metrics.arenas.load(Ordering::Relaxed),
            free_bytes: free.iter().map(Segment::len).sum(),
            free_runs: free.len(),
            leased_bytes: self.shared.metrics.leased_bytes.load(Ordering::Relaxed),
        }
    }

    fn allocate_arena(&self, size: usize) -> Segment {
        self.shared.metrics.arenas.fetch_add(1, Ordering::Relaxed);
        Segment::arena(
            self.shared.id,
            NEXT_ARENA_ID.fetch_add(1, Ordering::Relaxed),
            BytesMut::zeroed(size),
        )
    }

    /// Take segments totalling exactly `length` bytes.
    pub(crate) fn take_segments(&self, length: usize) -> Vec<Segment> {
        self.shared
            .metrics
            .leased_bytes
            .fetch_add(length, Ordering::Relaxed);

        if self.shared.policy == PoolPolicy::AdHoc {
            return vec![self.allocate_arena(length)];
        }

        let chunk = self.shared.chunk_size;
        let mut taken = Vec::new();
        let mut remaining = length;
        let mut leftovers = Vec::new();

        {
            let mut free = self.shared.free.lock();
            if length <= chunk {
                // First fit so that small borrows stay contiguous.
                if let Some(index) = free.iter().position(|run| run.len() >= length) {
                    let run = free.swap_remove(index);
                    let (head, tail) = run.split_at(length);
                    free.extend(tail);
                    return vec![head];
                }
            } else {
                while remaining > 0 {
                    let Some(run) = free.pop() else { break };
                    let take = run.len().min(remaining);
                    let (head, tail) = run.split_at(take);
                    remaining -= head.len();
                    taken.push(head);
                    free.extend(tail);
                }
            }
        }

        while remaining > 0 {
            let arena = self.allocate_arena(chunk);
            let (head, tail) = arena.split_at(chunk.min(remaining));
            remaining -= head.len();
            taken.push(head);
            leftovers.extend(tail);
        }

        if !leftovers.is_empty() {
            let mut free = self.shared.free.lock();
            free.extend(leftovers);
        }
        taken
    }

    /// Put segments back on the free list and coalesce.
    pub(crate) fn recycle(&self, segments: Vec<Segment>) {
        let mut returned = 0;
        let mut accepted = Vec::with_capacity(segments.len());
        for segment in segments {
            if segment.pool_id() != self.shared.id {
                tracing::debug!(?segment, "dropping segment from a foreign pool");
                continue;
            }
            returned += segment.len();
            accepted.push(segment);
        }
        self.shared
            .metrics
            .leased_bytes
            .fetch_sub(returned, Ordering::Relaxed);

        if self.shared.policy == PoolPolicy::AdHoc || accepted.is_empty() {
            return;
        }

        let mut free = self.shared.free.lock();
        free.extend(accepted);
        coalesce(&mut free);
    }
}

/// Merge free runs that are adjacent within the same arena.
fn coalesce(runs: &mut Vec<Segment>) {
    runs.sort_by_key(|run| (run.arena_id(), run.offset()));
    let mut merged: Vec<Segment> = Vec::with_capacity(runs.len());
    for run in runs.drain(..) {
        match merged.last_mut() {
            Some(last) => {
                debug_assert!(
                    last.arena_id() != run.arena_id() || last.end() <= run.offset(),
                    "overlapping free runs"
                );
                if let Err(run) = last.try_merge(run) {
                    merged.push(run);
                }
            }
            None => merged.push(run),
        }
    }
    *runs = merged;
}

impl std::fmt::Debug for BufferPool {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("BufferPool")
            .field("id", &self.shared.id)
            .field("policy", &self.shared.policy)
            .field("chunk_size", &self.shared.chunk_size)
            .finish()
    }
}

impl Default for BufferPool {
    fn default() -> Self {
        Self::recycling()
    }
}
