use std::collections::BTreeMap;

use bytes::Bytes;

use crate::TransferError;

/// Number of chunks needed for `size` bytes at `chunk_size` bytes per chunk.
///
/// A zero-byte object still occupies one (empty) chunk.
pub fn total_chunks_for(size: u64, chunk_size: usize) -> Result<u32, TransferError> {
    if chunk_size == 0 {
        return Err(TransferError::InvalidArgument(
            "chunk size must be positive".into(),
        ));
    }
    let chunks = size.div_ceil(chunk_size as u64).max(1);
    u32::try_from(chunks).map_err(|_| {
        TransferError::InvalidArgument(format!(
            "{size} bytes needs more than {} chunks of {chunk_size} bytes",
            u32::MAX
        ))
    })
}

/// Concatenates chunks in the order given.
pub fn assemble(parts: &[Bytes]) -> Vec<u8> {
    let len = parts.iter().map(Bytes::len).sum();
    let mut out = Vec::with_capacity(len);
    for part in parts {
        out.extend_from_slice(part);
    }
    out
}

/// Chunks received so far for one upload, keyed by chunk index.
///
/// Arrival order is irrelevant and a repeated index is ignored, so the
/// counters only ever grow.
#[derive(Debug, Clone)]
pub struct ChunkStore {
    chunks: BTreeMap<u32, Bytes>,
    total_chunks: u32,
    received_bytes: u64,
}

impl ChunkStore {
    /// Creates an empty store expecting `total_chunks` chunks.
    pub fn new(total_chunks: u32) -> Self {
        Self {
            chunks: BTreeMap::new(),
            total_chunks,
            received_bytes: 0,
        }
    }

    /// Validates `index` against `[0, total_chunks)`.
    pub fn check_index(&self, index: i64) -> Result<u32, TransferError> {
        u32::try_from(index)
            .ok()
            .filter(|i| *i < self.total_chunks)
            .ok_or_else(|| {
                TransferError::InvalidArgument(format!(
                    "chunk index {index} outside 0..{}",
                    self.total_chunks
                ))
            })
    }

    /// Stores a chunk. Returns `false` if the index was already present,
    /// in which case the earlier bytes are kept.
    pub fn insert(&mut self, index: i64, data: Bytes) -> Result<bool, TransferError> {
        let index = self.check_index(index)?;
        if self.chunks.contains_key(&index) {
            return Ok(false);
        }
        self.received_bytes += data.len() as u64;
        self.chunks.insert(index, data);
        Ok(true)
    }

    /// Returns the chunk at `index`, if received.
    pub fn get(&self, index: u32) -> Option<&Bytes> {
        self.chunks.get(&index)
    }

    pub fn total_chunks(&self) -> u32 {
        self.total_chunks
    }

    pub fn received_chunks(&self) -> u32 {
        self.chunks.len() as u32
    }

    pub fn received_bytes(&self) -> u64 {
        self.received_bytes
    }

    /// Returns `true` once every chunk has been received.
    pub fn is_complete(&self) -> bool {
        self.received_chunks() == self.total_chunks
    }

    /// Returns `true` if every index in range is present.
    ///
    /// Unlike [`is_complete`](Self::is_complete) this walks the indices
    /// instead of trusting the counter.
    pub fn validate(&self) -> bool {
        (0..self.total_chunks).all(|i| self.chunks.contains_key(&i))
    }

    /// Received chunks as a percentage of the total (0-100).
    pub fn progress_percent(&self) -> f64 {
        if self.total_chunks == 0 {
            return 0.0;
        }
        f64::from(self.received_chunks()) / f64::from(self.total_chunks) * 100.0
    }

    /// Cheap clones of all chunks in index order, or `None` if any is missing.
    pub fn ordered(&self) -> Option<Vec<Bytes>> {
        if !self.validate() {
            return None;
        }
        Some(self.chunks.values().cloned().collect())
    }
}
