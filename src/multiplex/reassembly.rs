use std::collections::HashMap;

use parking_lot::Mutex;

use super::frame::Chunk;

/// Inbound chunks bucketed per transfer, keyed by index.
///
/// A repeated index replaces the earlier chunk. Completeness is judged by the
/// caller against `total_chunks`.
#[derive(Default)]
pub struct ReassemblyBuffer {
    transfers: Mutex<HashMap<String, HashMap<u32, Chunk>>>,
}

impl ReassemblyBuffer {
    pub fn new() -> Self {
        Self::default()
    }
    /// Returns `true` if the index was not present before.
    pub fn insert(&self, chunk: Chunk) -> bool {
        self.transfers
            .lock()
            .entry(chunk.transfer_id.clone())
            .or_default()
            .insert(chunk.chunk_index, chunk)
            .is_none()
    }
    /// Chunks received so far sorted by index; gaps are omitted.
    pub fn ordered(&self, transfer_id: &str) -> Vec<Chunk> {
        let guard = self.transfers.lock();
        let Some(bucket) = guard.get(transfer_id) else {
            return Vec::new();
        };
        let mut chunks: Vec<Chunk> = bucket.values().cloned().collect();
        chunks.sort_unstable_by_key(|chunk| chunk.chunk_index);
        chunks
    }
    pub fn received_count(&self, transfer_id: &str) -> usize {
        self.transfers
            .lock()
            .get(transfer_id)
            .map_or(0, |bucket| bucket.len())
    }
    /// Every index in `0..total` has arrived.
    pub fn is_complete(&self, transfer_id: &str, total: u32) -> bool {
        let guard = self.transfers.lock();
        match guard.get(transfer_id) {
            Some(bucket) => (0..total).all(|index| bucket.contains_key(&index)),
            None => total == 0,
        }
    }
    /// Releases the bucket. Returns the number of chunks dropped.
    pub fn clear(&self, transfer_id: &str) -> usize {
        self.transfers
            .lock()
            .remove(transfer_id)
            .map_or(0, |bucket| bucket.len())
    }
    pub fn transfer_ids(&self) -> Vec<String> {
        self.transfers.lock().keys().cloned().collect()
    }
}
