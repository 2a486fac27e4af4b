//! Per-subscriber pending-delivery queue.
//!
//! A queue holds [`Chunk`]s in delivery order. Persisted ranges announced
//! back to back are coalesced on append and then re-split, so that the
//! number of entries stays bounded no matter how large the backlog grows:
//!
//! ```text
//!  back of queue        incoming          after append
//!  File{0, 100}    +    File{100, 50}  →  File{0, 150}
//!  File{0, 100}    +    File{400, 50}  →  File{0, 100}, File{400, 50}
//!  Ram[..]         +    File{0, 50}    →  Ram[..], File{0, 50}
//! ```
//!
//! Re-splitting starts from `chunk_size` pieces and doubles the piece size
//! until the range fits in `max_chunks` pieces, trading first-byte latency
//! for a constant per-client bound.

use std::collections::VecDeque;
use std::sync::Arc;

/// Default piece size for split ranges (400KB).
pub const CHUNK_SIZE: u64 = 400 * 1024;

/// Default bound on the pieces produced by one split.
pub const MAX_CHUNKS_IN_QUEUE: u64 = 2048;

/// One unit of pending delivery.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Chunk {
    /// Already-framed bytes held in memory. Never merged, never read from the log.
    Ram(Arc<Vec<u8>>),
    /// A byte range of the persistent log, read at delivery time.
    File { start: u64, length: u64 },
}

impl Chunk {
    pub fn ram(data: Vec<u8>) -> Self {
        Chunk::Ram(Arc::new(data))
    }

    pub fn file(start: u64, length: u64) -> Self {
        Chunk::File { start, length }
    }

    /// Number of bytes this chunk delivers.
    pub fn len(&self) -> u64 {
        match self {
            Chunk::Ram(data) => data.len() as u64,
            Chunk::File { length, .. } => *length,
        }
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

/// Sizing limits for splitting persisted ranges.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct QueueLimits {
    /// Initial piece size in bytes
    pub chunk_size: u64,
    /// Upper bound on pieces produced for one range
    pub max_chunks: u64,
}

impl Default for QueueLimits {
    fn default() -> Self {
        Self {
            chunk_size: CHUNK_SIZE,
            max_chunks: MAX_CHUNKS_IN_QUEUE,
        }
    }
}

/// Split `[start, start + length)` into at most `limits.max_chunks` pieces.
///
/// Every piece but the last has the same size; the last carries the
/// remainder. An empty range yields no pieces.
pub fn split_range(start: u64, length: u64, limits: QueueLimits) -> Vec<Chunk> {
    if length == 0 {
        return Vec::new();
    }

    let max_chunks = limits.max_chunks.max(1);
    let mut piece = limits.chunk_size.max(1);
    while length.div_ceil(piece) > max_chunks {
        piece = piece.saturating_mul(2);
    }

    let full = length / piece;
    let rest = length % piece;
    let mut pieces = Vec::with_capacity(full as usize + usize::from(rest > 0));
    let mut pos = start;
    for _ in 0..full {
        pieces.push(Chunk::file(pos, piece));
        pos += piece;
    }
    if rest > 0 {
        pieces.push(Chunk::file(pos, rest));
    }
    pieces
}

/// FIFO of pending chunks with merge-on-append.
///
/// Not synchronized; each subscriber wraps its own queue in a mutex.
#[derive(Debug, Clone)]
pub struct PendingQueue {
    chunks: VecDeque<Chunk>,
    limits: QueueLimits,
}

impl PendingQueue {
    pub fn new(limits: QueueLimits) -> Self {
        Self {
            chunks: VecDeque::new(),
            limits,
        }
    }

    /// Queue seeded with a persisted range (catch-up).
    pub fn with_range(start: u64, length: u64, limits: QueueLimits) -> Self {
        let mut queue = Self::new(limits);
        queue.chunks.extend(split_range(start, length, limits));
        queue
    }

    /// Append a chunk at the back, coalescing adjacent persisted ranges.
    pub fn append(&mut self, chunk: Chunk) {
        match chunk {
            Chunk::Ram(_) => self.chunks.push_back(chunk),
            Chunk::File { start, length } => {
                let adjacent = match self.chunks.back() {
                    Some(&Chunk::File { start: back_start, length: back_length })
                        if back_start + back_length == start =>
                    {
                        Some((back_start, back_length))
                    }
                    _ => None,
                };
                let (start, length) = match adjacent {
                    Some((back_start, back_length)) => {
                        self.chunks.pop_back();
                        (back_start, back_length + length)
                    }
                    None => (start, length),
                };
                self.chunks.extend(split_range(start, length, self.limits));
            }
        }

        if self.chunks.len() as u64 >= self.limits.max_chunks.saturating_mul(2) {
            log::warn!("{} chunks pending in a single queue", self.chunks.len());
        }
    }

    pub fn pop_front(&mut self) -> Option<Chunk> {
        self.chunks.pop_front()
    }

    /// Put a chunk back at the head, ahead of everything else.
    pub fn push_front(&mut self, chunk: Chunk) {
        self.chunks.push_front(chunk);
    }

    pub fn front(&self) -> Option<&Chunk> {
        self.chunks.front()
    }

    pub fn len(&self) -> usize {
        self.chunks.len()
    }

    pub fn is_empty(&self) -> bool {
        self.chunks.is_empty()
    }

    /// Drop every pending chunk.
    pub fn clear(&mut self) {
        self.chunks.clear();
    }

    /// Total bytes awaiting delivery.
    pub fn pending_bytes(&self) -> u64 {
        self.chunks.iter().map(Chunk::len).sum()
    }

    pub fn iter(&self) -> impl Iterator<Item = &Chunk> {
        self.chunks.iter()
    }

    pub fn limits(&self) -> QueueLimits {
        self.limits
    }
}

impl Default for PendingQueue {
    fn default() -> Self {
        Self::new(QueueLimits::default())
    }
}
