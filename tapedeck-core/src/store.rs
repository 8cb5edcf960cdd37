//! Chunk store boundary and recording metadata.
//!
//! The store is an external collaborator addressed by dense, recording-scoped
//! integer keys. One recording's chunks occupy the contiguous key range
//! `[db_start_key, db_end_key]`; every chunk holds exactly [`CHUNK_LENGTH`]
//! samples except the final one, which holds the remainder (possibly zero
//! samples, so the range invariant holds even for exact multiples).

use std::collections::BTreeMap;
use std::sync::Arc;

use parking_lot::Mutex;
use serde::{Deserialize, Serialize};

use crate::error::{Result, TapedeckError};

/// Samples per persisted chunk.
pub const CHUNK_LENGTH: usize = 4096;

/// Dense, recording-scoped chunk address.
pub type ChunkKey = u32;

/// Contract for chunk persistence backends.
///
/// A chunk is durable once `write_chunk` returns `Ok`. Reads are
/// single-result; the caller must not assume they complete synchronously
/// relative to playback (the player delivers results through its own
/// completion events).
pub trait ChunkStore: Send {
    /// Persist one chunk of 16-bit samples under `key`.
    fn write_chunk(&mut self, key: ChunkKey, samples: &[i16]) -> Result<()>;

    /// Fetch the chunk stored under `key`.
    fn read_chunk(&self, key: ChunkKey) -> Result<Vec<i16>>;
}

/// Thread-safe reference-counted handle to any `ChunkStore` implementor.
#[derive(Clone)]
pub struct StoreHandle(pub Arc<Mutex<dyn ChunkStore>>);

impl StoreHandle {
    /// Wrap any `ChunkStore` in a `StoreHandle`.
    pub fn new<S: ChunkStore + 'static>(store: S) -> Self {
        Self(Arc::new(Mutex::new(store)))
    }
}

impl std::fmt::Debug for StoreHandle {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("StoreHandle").finish_non_exhaustive()
    }
}

/// In-process store backed by a `BTreeMap`.
///
/// The default backing for hosts without their own persistence, and the
/// test double for everything in this crate.
#[derive(Debug, Default)]
pub struct MemoryChunkStore {
    chunks: BTreeMap<ChunkKey, Vec<i16>>,
}

impl MemoryChunkStore {
    pub fn new() -> Self {
        Self::default()
    }

    /// Number of chunks currently held.
    pub fn len(&self) -> usize {
        self.chunks.len()
    }

    pub fn is_empty(&self) -> bool {
        self.chunks.is_empty()
    }

    /// First key after the highest stored key (0 when empty) — where the
    /// next recording's key range begins.
    pub fn next_key(&self) -> ChunkKey {
        self.chunks
            .keys()
            .next_back()
            .map(|&k| k + 1)
            .unwrap_or(0)
    }
}

impl ChunkStore for MemoryChunkStore {
    fn write_chunk(&mut self, key: ChunkKey, samples: &[i16]) -> Result<()> {
        self.chunks.insert(key, samples.to_vec());
        Ok(())
    }

    fn read_chunk(&self, key: ChunkKey) -> Result<Vec<i16>> {
        self.chunks
            .get(&key)
            .cloned()
            .ok_or(TapedeckError::StoreRead(key))
    }
}

/// Metadata for one finished recording. Immutable once finalized.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct RecordingInfo {
    /// First chunk key of the recording.
    pub db_start_key: ChunkKey,
    /// Total sample count across all chunks.
    pub n_samples: u64,
    /// Sample rate in Hz.
    pub sample_rate: u32,
}

impl RecordingInfo {
    /// Last chunk key: `db_start_key + floor(n_samples / CHUNK_LENGTH)`.
    pub fn db_end_key(&self) -> ChunkKey {
        self.db_start_key + (self.n_samples / CHUNK_LENGTH as u64) as ChunkKey
    }

    /// Total duration in seconds.
    pub fn duration(&self) -> f64 {
        self.n_samples as f64 / self.sample_rate as f64
    }

    /// Nominal duration of one full chunk in seconds.
    pub fn chunk_duration(&self) -> f64 {
        CHUNK_LENGTH as f64 / self.sample_rate as f64
    }

    /// Duration as display text, e.g. `00:08.5`.
    pub fn display_duration(&self) -> String {
        crate::clock::format_time(self.duration(), self.duration())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn memory_store_round_trip() {
        let mut store = MemoryChunkStore::new();
        store.write_chunk(3, &[1, 2, 3]).unwrap();
        assert_eq!(store.read_chunk(3).unwrap(), vec![1, 2, 3]);
        assert_eq!(store.next_key(), 4);
    }

    #[test]
    fn missing_chunk_is_a_read_failure() {
        let store = MemoryChunkStore::new();
        assert!(matches!(
            store.read_chunk(9),
            Err(TapedeckError::StoreRead(9))
        ));
    }

    #[test]
    fn end_key_spans_partial_final_chunk() {
        let info = RecordingInfo {
            db_start_key: 5,
            n_samples: 9000,
            sample_rate: 44_100,
        };
        // 9000 samples at 4096/chunk -> keys 5, 6, 7
        assert_eq!(info.db_end_key(), 7);
    }

    #[test]
    fn durations_derive_from_rate() {
        let info = RecordingInfo {
            db_start_key: 0,
            n_samples: 88_200,
            sample_rate: 44_100,
        };
        assert_eq!(info.duration(), 2.0);
        assert!((info.chunk_duration() - 4096.0 / 44_100.0).abs() < 1e-12);
        assert_eq!(info.display_duration(), "00:02.0");
    }

    #[test]
    fn recording_info_serializes_camel_case() {
        let info = RecordingInfo {
            db_start_key: 1,
            n_samples: 378_112,
            sample_rate: 44_100,
        };
        let json = serde_json::to_value(info).expect("serialize recording info");
        assert_eq!(json["dbStartKey"], 1);
        assert_eq!(json["nSamples"], 378_112);
        assert_eq!(json["sampleRate"], 44_100);
    }
}
