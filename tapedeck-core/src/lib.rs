//! # tapedeck-core
//!
//! Chunked audio capture and gapless playback engine SDK.
//!
//! ## Architecture
//!
//! ```text
//! Microphone → CaptureStream → SPSC RingBuffer → Recorder(spawn_blocking)
//!                                                    │
//!                                            FrameAccumulator
//!                                                    │
//!                                         ChunkWriter → ChunkStore
//!
//! ChunkStore → StoreLoader/Codec → Scheduler → OutputSink → Speakers
//!                    (parity decode lanes, look-ahead by two)
//! ```
//!
//! Both pipelines share one monotonic [`clock::MasterClock`]. The capture
//! callback is zero-alloc; all heap work happens on the engine threads. The
//! player dispatches everything — commands, decode completions, ended
//! tokens — on a single control thread, so its state machine is never
//! entered concurrently.

#![forbid(unsafe_code)]
#![warn(clippy::all)]

pub mod buffering;
pub mod capture;
pub mod clock;
pub mod error;
pub mod events;
pub mod monitor;
pub mod playback;
pub mod store;
pub mod wav;

// Convenience re-exports for downstream crates
pub use capture::recorder::{Recorder, RecorderConfig, RecorderEngine};
pub use capture::RecorderStatus;
pub use clock::{Clock, MasterClock};
pub use error::TapedeckError;
pub use monitor::{LiveMonitor, PeakStats};
pub use playback::{PlaybackState, Player};
pub use store::{ChunkStore, MemoryChunkStore, RecordingInfo, StoreHandle, CHUNK_LENGTH};
