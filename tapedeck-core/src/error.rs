use thiserror::Error;

use crate::store::ChunkKey;

/// All errors produced by tapedeck-core.
#[derive(Debug, Error)]
pub enum TapedeckError {
    #[error("audio device unavailable: {0}")]
    DeviceUnavailable(String),

    #[error("capture access denied by the user")]
    PermissionDenied,

    #[error("audio stream error: {0}")]
    AudioStream(String),

    #[error("chunk store read failed for key {0}")]
    StoreRead(ChunkKey),

    #[error("chunk store write failed for key {0}")]
    StoreWrite(ChunkKey),

    #[error("container codec error: {0}")]
    Codec(String),

    #[error("seek target {0} outside [0, 1)")]
    InvalidSeekTarget(f64),

    #[error("chunk key {key} outside the recording's key range")]
    ChunkOutOfRange { key: ChunkKey },

    #[error("chunk {key} is the immediate chunk — it is never scheduled by absolute time")]
    NowChunkSchedule { key: ChunkKey },

    #[error("decode lane {lane} already has an outstanding request")]
    LaneBusy { lane: usize },

    #[error("engine is already running")]
    AlreadyRunning,

    #[error("engine is not running")]
    NotRunning,

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error(transparent)]
    Other(#[from] anyhow::Error),
}

pub type Result<T> = std::result::Result<T, TapedeckError>;
