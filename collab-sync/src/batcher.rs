//! Coalesces local Yrs update deltas before transmission.
//!
//! A burst of keystrokes produces one update per transaction. Sending each
//! one individually wastes bandwidth, so the provider buffers them for a
//! short window and ships a single merged delta.
//!
//! ```text
//! txn commit ──► push(update) ──► [u1, u2, u3] ──► flush() ──► merge_updates_v1
//!                     │                                            │
//!                     └── (re)arm DocumentFlush timer              ▼
//!                                                          one merged delta
//! ```
//!
//! Merging is delegated to Yrs: a merged update applied once is equivalent
//! to applying its inputs in order.

use std::time::Duration;

use crate::error::SyncError;

/// Default debounce window for outbound document updates.
pub const DEFAULT_FLUSH_WINDOW: Duration = Duration::from_millis(50);

/// Pending-update buffer with flush accounting.
#[derive(Debug)]
pub struct UpdateBatcher {
    pending: Vec<Vec<u8>>,
    window: Duration,
    flushed_batches: u64,
    merged_updates: u64,
}

impl UpdateBatcher {
    pub fn new(window: Duration) -> Self {
        Self {
            pending: Vec::new(),
            window,
            flushed_batches: 0,
            merged_updates: 0,
        }
    }

    /// Debounce window the owner should (re)arm after each push.
    pub fn window(&self) -> Duration {
        self.window
    }

    /// Buffer one local update. Empty payloads carry nothing and are skipped.
    pub fn push(&mut self, update: Vec<u8>) -> bool {
        if update.is_empty() {
            return false;
        }
        self.pending.push(update);
        true
    }

    pub fn len(&self) -> usize {
        self.pending.len()
    }

    pub fn is_empty(&self) -> bool {
        self.pending.is_empty()
    }

    /// Total bytes buffered.
    pub fn total_bytes(&self) -> usize {
        self.pending.iter().map(|u| u.len()).sum()
    }

    /// Merge everything pending into one delta and clear the buffer.
    ///
    /// Returns `Ok(None)` when nothing is pending. A single pending update
    /// is returned as-is. On merge failure the buffer is still cleared:
    /// a corrupt local update cannot become valid by retrying.
    pub fn flush(&mut self) -> Result<Option<Vec<u8>>, SyncError> {
        if self.pending.is_empty() {
            return Ok(None);
        }

        let pending = std::mem::take(&mut self.pending);
        let count = pending.len() as u64;

        let merged = if pending.len() == 1 {
            pending.into_iter().next()
        } else {
            let refs: Vec<&[u8]> = pending.iter().map(|u| u.as_slice()).collect();
            let merged = yrs::merge_updates_v1(&refs)
                .map_err(|e| SyncError::Merge(e.to_string()))?;
            Some(merged)
        };

        self.flushed_batches += 1;
        self.merged_updates += count;
        Ok(merged)
    }

    /// Drop everything pending without sending.
    pub fn clear(&mut self) {
        self.pending.clear();
    }

    /// Number of successful flushes.
    pub fn flushed_batches(&self) -> u64 {
        self.flushed_batches
    }

    /// Number of individual updates that went out through flushes.
    pub fn merged_updates(&self) -> u64 {
        self.merged_updates
    }
}

impl Default for UpdateBatcher {
    fn default() -> Self {
        Self::new(DEFAULT_FLUSH_WINDOW)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use yrs::updates::decoder::Decode;
    use yrs::{Doc, GetString, Text, Transact, Update};

    fn capture_updates(doc: &Doc, edits: &[(u32, &str)]) -> Vec<Vec<u8>> {
        let text = doc.get_or_insert_text("body");
        let mut updates = Vec::new();
        for (index, chunk) in edits {
            let mut txn = doc.transact_mut();
            text.insert(&mut txn, *index, chunk);
            updates.push(txn.encode_update_v1());
        }
        updates
    }

    fn apply(doc: &Doc, update: &[u8]) {
        let mut txn = doc.transact_mut();
        txn.apply_update(Update::decode_v1(update).unwrap()).unwrap();
    }

    fn body(doc: &Doc) -> String {
        let text = doc.get_or_insert_text("body");
        let txn = doc.transact();
        text.get_string(&txn)
    }

    #[test]
    fn test_flush_empty_is_none() {
        let mut batcher = UpdateBatcher::default();
        assert!(batcher.flush().unwrap().is_none());
        assert_eq!(batcher.flushed_batches(), 0);
    }

    #[test]
    fn test_push_skips_empty_payload() {
        let mut batcher = UpdateBatcher::default();
        assert!(!batcher.push(Vec::new()));
        assert!(batcher.is_empty());
    }

    #[test]
    fn test_single_update_passthrough() {
        let doc = Doc::with_client_id(1);
        let updates = capture_updates(&doc, &[(0, "hi")]);

        let mut batcher = UpdateBatcher::default();
        batcher.push(updates[0].clone());
        let flushed = batcher.flush().unwrap().unwrap();
        assert_eq!(flushed, updates[0]);
        assert!(batcher.is_empty());
    }

    #[test]
    fn test_merged_delta_equivalent_to_sequence() {
        let source = Doc::with_client_id(1);
        let updates = capture_updates(&source, &[(0, "he"), (2, "ll"), (4, "o")]);

        let mut batcher = UpdateBatcher::new(Duration::from_millis(10));
        for u in &updates {
            batcher.push(u.clone());
        }
        assert_eq!(batcher.len(), 3);
        assert!(batcher.total_bytes() > 0);

        let merged = batcher.flush().unwrap().unwrap();
        assert!(batcher.is_empty());
        assert_eq!(batcher.flushed_batches(), 1);
        assert_eq!(batcher.merged_updates(), 3);

        let replica = Doc::with_client_id(2);
        apply(&replica, &merged);
        assert_eq!(body(&replica), "hello");
    }

    #[test]
    fn test_merge_failure_clears_buffer() {
        let mut batcher = UpdateBatcher::default();
        batcher.push(vec![0xFF, 0xFF, 0xFF]);
        batcher.push(vec![0xFE, 0xFE]);
        assert!(batcher.flush().is_err());
        assert!(batcher.is_empty());
    }

    #[test]
    fn test_clear() {
        let mut batcher = UpdateBatcher::default();
        batcher.push(vec![1]);
        batcher.clear();
        assert!(batcher.is_empty());
        assert_eq!(batcher.window(), DEFAULT_FLUSH_WINDOW);
    }
}
