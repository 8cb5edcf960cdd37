//! Capture-side recorder: frame accumulation, chunk writing, lifecycle.
//!
//! ## Pipeline stages (per device frame)
//!
//! ```text
//! 1. Drain ring buffer → one FRAME_LENGTH frame
//! 2. Track peak volume (always — the live meter works while paused)
//! 3. While recording: append frame into the circular write-buffer group
//! 4. Group full → one write unit → ChunkWriter
//! 5. ChunkWriter re-blocks units into CHUNK_LENGTH store chunks
//! 6. stop() → flush tail, finalize RecordingInfo
//! ```
//!
//! The drain loop runs in `spawn_blocking`, keeping the Tokio executor free
//! for host I/O.

use std::sync::{
    atomic::{AtomicBool, AtomicU32, AtomicU64, Ordering},
    Arc,
};
use std::time::Duration;

use parking_lot::Mutex;
use tokio::sync::broadcast;
use tracing::{debug, info, warn};

use crate::{
    buffering::{
        chunk::f32_to_i16, create_capture_ring, CaptureConsumer, Consumer, Observer,
        FRAME_LENGTH, WRITE_BUFFERS_LENGTH,
    },
    capture::{
        negotiate_capture, CaptureCapability, CaptureStream, GainControl, RecorderStatus,
    },
    error::{Result, TapedeckError},
    events::RecorderStatusEvent,
    monitor::MeterSource,
    store::{ChunkKey, RecordingInfo, StoreHandle, CHUNK_LENGTH},
};

/// Broadcast channel capacity for status / finished-recording events.
const BROADCAST_CAP: usize = 64;

/// Sleep when the ring has less than one frame available.
const SLEEP_EMPTY_MS: u64 = 5;

/// Configuration for the capture engine.
#[derive(Debug, Clone)]
pub struct RecorderConfig {
    /// Input device name to prefer; `None` uses default selection.
    pub preferred_input_device: Option<String>,
    /// Samples per device frame. Default: [`FRAME_LENGTH`].
    pub frame_length: usize,
    /// Frames per store write unit. Default: [`WRITE_BUFFERS_LENGTH`].
    pub write_buffers_length: usize,
}

impl Default for RecorderConfig {
    fn default() -> Self {
        Self {
            preferred_input_device: None,
            frame_length: FRAME_LENGTH,
            write_buffers_length: WRITE_BUFFERS_LENGTH,
        }
    }
}

/// Live fields exposed by the recorder for periodic sampling.
///
/// All fields are atomics; the monitor reads them at its own coarse cadence
/// rather than being pushed per frame.
pub struct RecorderShared {
    /// f32 bits of the latest frame's peak volume, clamped to [0, 1].
    volume_bits: AtomicU32,
    /// Count of frames appended while recording — the wall-clock proxy
    /// `n * frame_length / sample_rate`.
    n_encoded_buffers: AtomicU64,
    is_recording: AtomicBool,
    is_inactive: AtomicBool,
    sample_rate: AtomicU32,
    frame_length: u32,
}

impl RecorderShared {
    fn new(frame_length: usize) -> Self {
        Self {
            volume_bits: AtomicU32::new(0),
            n_encoded_buffers: AtomicU64::new(0),
            is_recording: AtomicBool::new(false),
            is_inactive: AtomicBool::new(true),
            sample_rate: AtomicU32::new(44_100),
            frame_length: frame_length as u32,
        }
    }

    pub fn current_volume(&self) -> f32 {
        f32::from_bits(self.volume_bits.load(Ordering::Relaxed))
    }

    pub fn n_encoded_buffers(&self) -> u64 {
        self.n_encoded_buffers.load(Ordering::Relaxed)
    }

    pub fn is_recording(&self) -> bool {
        self.is_recording.load(Ordering::Relaxed)
    }

    pub fn is_inactive(&self) -> bool {
        self.is_inactive.load(Ordering::Relaxed)
    }

    pub fn sample_rate(&self) -> u32 {
        self.sample_rate.load(Ordering::Relaxed)
    }

    fn set_volume(&self, volume: f32) {
        self.volume_bits.store(volume.to_bits(), Ordering::Relaxed);
    }

    fn set_sample_rate(&self, rate: u32) {
        self.sample_rate.store(rate, Ordering::Relaxed);
    }
}

impl MeterSource for RecorderShared {
    fn current_volume(&self) -> f32 {
        RecorderShared::current_volume(self)
    }

    fn elapsed_seconds(&self) -> f64 {
        self.n_encoded_buffers() as f64 * self.frame_length as f64 / self.sample_rate() as f64
    }
}

/// Circular group of frame slots; a full group is one store write unit.
pub struct FrameAccumulator {
    slots: Vec<Vec<f32>>,
    filled: usize,
}

impl FrameAccumulator {
    pub fn new(write_buffers_length: usize) -> Self {
        assert!(write_buffers_length > 0);
        Self {
            slots: vec![Vec::new(); write_buffers_length],
            filled: 0,
        }
    }

    /// Append one frame. Returns the concatenated write unit when the slot
    /// index wraps to the last position.
    pub fn push(&mut self, frame: &[f32]) -> Option<Vec<f32>> {
        let slot = &mut self.slots[self.filled];
        slot.clear();
        slot.extend_from_slice(frame);
        self.filled += 1;

        if self.filled == self.slots.len() {
            self.filled = 0;
            Some(self.slots.concat())
        } else {
            None
        }
    }

    /// Drain the partial group accumulated since the last full unit.
    pub fn take_pending(&mut self) -> Vec<f32> {
        let pending = self.slots[..self.filled].concat();
        self.filled = 0;
        pending
    }
}

/// Re-blocks write units into exact [`CHUNK_LENGTH`]-sample store chunks
/// with monotonically assigned keys.
pub struct ChunkWriter {
    store: StoreHandle,
    sample_rate: u32,
    db_start_key: ChunkKey,
    next_key: ChunkKey,
    pending: Vec<i16>,
    n_samples: u64,
}

impl ChunkWriter {
    pub fn new(store: StoreHandle, sample_rate: u32, db_start_key: ChunkKey) -> Self {
        Self {
            store,
            sample_rate,
            db_start_key,
            next_key: db_start_key,
            pending: Vec::with_capacity(CHUNK_LENGTH),
            n_samples: 0,
        }
    }

    /// Convert one write unit to storage form and commit any full chunks.
    pub fn push_unit(&mut self, unit: &[f32]) -> Result<()> {
        let pcm = f32_to_i16(unit);
        self.n_samples += pcm.len() as u64;
        self.pending.extend_from_slice(&pcm);

        while self.pending.len() >= CHUNK_LENGTH {
            let chunk: Vec<i16> = self.pending.drain(..CHUNK_LENGTH).collect();
            self.store.0.lock().write_chunk(self.next_key, &chunk)?;
            debug!(key = self.next_key, "chunk committed");
            self.next_key += 1;
        }
        Ok(())
    }

    /// Commit the final (short) chunk and seal the recording's metadata.
    ///
    /// The final chunk is written even when empty so that the store always
    /// holds the full `[db_start_key, db_end_key]` range the metadata
    /// describes.
    pub fn finalize(mut self) -> Result<RecordingInfo> {
        let tail: Vec<i16> = std::mem::take(&mut self.pending);
        self.store.0.lock().write_chunk(self.next_key, &tail)?;

        let info = RecordingInfo {
            db_start_key: self.db_start_key,
            n_samples: self.n_samples,
            sample_rate: self.sample_rate,
        };
        info!(
            db_start_key = info.db_start_key,
            db_end_key = info.db_end_key(),
            n_samples = info.n_samples,
            "recording finalized"
        );
        Ok(info)
    }
}

/// Capture-side state machine.
///
/// `on_frame` is the single entry point for device frames; the start /
/// pause / resume / stop transitions only flip flags and manage the
/// [`ChunkWriter`] lifetime, so they are safe to call from any control path.
pub struct Recorder {
    shared: Arc<RecorderShared>,
    accumulator: FrameAccumulator,
    writer: Option<ChunkWriter>,
    store: StoreHandle,
    next_db_key: ChunkKey,
    status: RecorderStatus,
}

impl Recorder {
    /// `first_db_key` is where the next recording's key range begins
    /// (`MemoryChunkStore::next_key()` for the in-process store).
    pub fn new(config: &RecorderConfig, store: StoreHandle, first_db_key: ChunkKey) -> Self {
        Self {
            shared: Arc::new(RecorderShared::new(config.frame_length)),
            accumulator: FrameAccumulator::new(config.write_buffers_length),
            writer: None,
            store,
            next_db_key: first_db_key,
            status: RecorderStatus::Uninitialized,
        }
    }

    pub fn shared(&self) -> Arc<RecorderShared> {
        Arc::clone(&self.shared)
    }

    pub fn status(&self) -> RecorderStatus {
        self.status
    }

    pub(crate) fn set_status(&mut self, status: RecorderStatus) {
        self.status = status;
    }

    pub(crate) fn set_sample_rate(&mut self, rate: u32) {
        self.shared.set_sample_rate(rate);
    }

    /// Process one device frame.
    ///
    /// The peak volume updates unconditionally; samples are accumulated for
    /// storage only while recording.
    pub fn on_frame(&mut self, frame: &[f32]) -> Result<()> {
        let mut peak = 0f32;
        for &s in frame {
            let abs = s.abs().min(1.0);
            if abs > peak {
                peak = abs;
            }
        }
        self.shared.set_volume(peak);

        if self.shared.is_recording() {
            if let Some(unit) = self.accumulator.push(frame) {
                if let Some(writer) = self.writer.as_mut() {
                    writer.push_unit(&unit)?;
                }
            }
            self.shared.n_encoded_buffers.fetch_add(1, Ordering::Relaxed);
        }
        Ok(())
    }

    /// Begin a new recording.
    ///
    /// # Errors
    /// - `TapedeckError::DeviceUnavailable` unless the status is `Ready`.
    /// - `TapedeckError::AlreadyRunning` if a recording is in progress.
    pub fn start(&mut self) -> Result<()> {
        if self.status != RecorderStatus::Ready {
            return Err(TapedeckError::DeviceUnavailable(format!(
                "recorder status is {:?}",
                self.status
            )));
        }
        if self.writer.is_some() {
            return Err(TapedeckError::AlreadyRunning);
        }

        self.writer = Some(ChunkWriter::new(
            self.store.clone(),
            self.shared.sample_rate(),
            self.next_db_key,
        ));
        self.shared.n_encoded_buffers.store(0, Ordering::Relaxed);
        self.shared.is_recording.store(true, Ordering::Relaxed);
        self.shared.is_inactive.store(false, Ordering::Relaxed);
        info!(db_start_key = self.next_db_key, "recording started");
        Ok(())
    }

    /// Suspend appending frames; the live meter keeps updating.
    pub fn pause(&mut self) {
        self.shared.is_recording.store(false, Ordering::Relaxed);
    }

    /// Resume appending frames after `pause`.
    pub fn resume(&mut self) {
        if self.writer.is_some() {
            self.shared.is_recording.store(true, Ordering::Relaxed);
        }
    }

    /// End the recording: flush the partial write group and final chunk,
    /// reset the buffer count, and return the sealed metadata.
    ///
    /// Returns `Ok(None)` when no recording was in progress (the counters
    /// are still reset, matching the pure-transition contract).
    pub fn stop(&mut self) -> Result<Option<RecordingInfo>> {
        self.shared.is_recording.store(false, Ordering::Relaxed);
        self.shared.is_inactive.store(true, Ordering::Relaxed);
        self.shared.n_encoded_buffers.store(0, Ordering::Relaxed);

        let Some(mut writer) = self.writer.take() else {
            self.accumulator.take_pending();
            return Ok(None);
        };

        let tail = self.accumulator.take_pending();
        if !tail.is_empty() {
            writer.push_unit(&tail)?;
        }
        let info = writer.finalize()?;
        self.next_db_key = info.db_end_key() + 1;
        Ok(Some(info))
    }
}

/// Top-level capture lifecycle controller.
///
/// `start()`/`stop()` manage the device stream and drain loop;
/// `record()`/`pause()`/`resume()`/`finish()` drive the recording state
/// machine while the stream runs.
pub struct RecorderEngine {
    config: RecorderConfig,
    recorder: Arc<Mutex<Recorder>>,
    gain: GainControl,
    running: Arc<AtomicBool>,
    status_tx: broadcast::Sender<RecorderStatusEvent>,
    recording_tx: broadcast::Sender<RecordingInfo>,
}

impl RecorderEngine {
    pub fn new(config: RecorderConfig, store: StoreHandle, first_db_key: ChunkKey) -> Self {
        let recorder = Recorder::new(&config, store, first_db_key);
        let (status_tx, _) = broadcast::channel(BROADCAST_CAP);
        let (recording_tx, _) = broadcast::channel(BROADCAST_CAP);
        Self {
            config,
            recorder: Arc::new(Mutex::new(recorder)),
            gain: GainControl::default(),
            running: Arc::new(AtomicBool::new(false)),
            status_tx,
            recording_tx,
        }
    }

    /// Open the capture device and start the drain loop.
    ///
    /// Blocks until the device is confirmed open (or fails), then returns.
    /// Device negotiation and stream creation both happen inside
    /// `spawn_blocking` — cpal streams are `!Send`.
    pub fn start(&self) -> Result<()> {
        if self.running.load(Ordering::SeqCst) {
            return Err(TapedeckError::AlreadyRunning);
        }
        self.running.store(true, Ordering::SeqCst);

        let (producer, consumer) = create_capture_ring();
        let recorder = Arc::clone(&self.recorder);
        let running = Arc::clone(&self.running);
        let gain = self.gain.clone();
        let status_tx = self.status_tx.clone();
        let frame_length = self.config.frame_length;
        let preferred = self.config.preferred_input_device.clone();

        // Sync oneshot: drain thread signals open success/failure to start().
        let (open_tx, open_rx) = std::sync::mpsc::channel::<Result<u32>>();

        tokio::task::spawn_blocking(move || {
            let negotiated = match negotiate_capture(preferred.as_deref()) {
                CaptureCapability::Available(device) => device,
                CaptureCapability::Unavailable(status) => {
                    recorder.lock().set_status(status);
                    let _ = status_tx.send(RecorderStatusEvent {
                        status,
                        detail: None,
                    });
                    let _ = open_tx.send(Err(TapedeckError::DeviceUnavailable(format!(
                        "{status:?}"
                    ))));
                    running.store(false, Ordering::SeqCst);
                    return;
                }
            };

            let capture = match CaptureStream::open(
                negotiated,
                producer,
                Arc::clone(&running),
                gain,
            ) {
                Ok(stream) => {
                    let mut rec = recorder.lock();
                    rec.set_sample_rate(stream.sample_rate);
                    rec.set_status(RecorderStatus::Ready);
                    drop(rec);
                    let _ = status_tx.send(RecorderStatusEvent {
                        status: RecorderStatus::Ready,
                        detail: None,
                    });
                    let _ = open_tx.send(Ok(stream.sample_rate));
                    stream
                }
                Err(e) => {
                    recorder.lock().set_status(RecorderStatus::CaptureError);
                    let _ = status_tx.send(RecorderStatusEvent {
                        status: RecorderStatus::CaptureError,
                        detail: Some(e.to_string()),
                    });
                    let _ = open_tx.send(Err(e));
                    running.store(false, Ordering::SeqCst);
                    return;
                }
            };

            run_drain_loop(consumer, recorder, running, frame_length);

            // Stream drops here, releasing the device on this thread.
            drop(capture);
        });

        match open_rx.recv() {
            Ok(Ok(rate)) => {
                info!(sample_rate = rate, "capture engine started");
                Ok(())
            }
            Ok(Err(e)) => {
                self.running.store(false, Ordering::SeqCst);
                Err(e)
            }
            Err(_) => {
                self.running.store(false, Ordering::SeqCst);
                Err(TapedeckError::Other(anyhow::anyhow!(
                    "capture task died unexpectedly"
                )))
            }
        }
    }

    /// Stop the device stream and drain loop.
    pub fn stop(&self) -> Result<()> {
        if !self.running.load(Ordering::SeqCst) {
            return Err(TapedeckError::NotRunning);
        }
        self.running.store(false, Ordering::SeqCst);
        info!("capture engine stop requested");
        Ok(())
    }

    /// Begin recording into a fresh chunk range.
    pub fn record(&self) -> Result<()> {
        self.recorder.lock().start()
    }

    pub fn pause(&self) {
        self.recorder.lock().pause();
    }

    pub fn resume(&self) {
        self.recorder.lock().resume();
    }

    /// End the current recording and broadcast its metadata.
    pub fn finish(&self) -> Result<Option<RecordingInfo>> {
        let info = self.recorder.lock().stop()?;
        if let Some(info) = info {
            let _ = self.recording_tx.send(info);
        }
        Ok(info)
    }

    /// Set the input gain multiplier (1.0 = unity).
    ///
    /// Callers displaying peak statistics should also reset them — the
    /// distribution changes under a new gain.
    pub fn set_gain_factor(&self, factor: f32) {
        self.gain.set_factor(factor);
    }

    pub fn status(&self) -> RecorderStatus {
        self.recorder.lock().status()
    }

    /// Live fields for the monitor.
    pub fn meter(&self) -> Arc<RecorderShared> {
        self.recorder.lock().shared()
    }

    pub fn subscribe_status(&self) -> broadcast::Receiver<RecorderStatusEvent> {
        self.status_tx.subscribe()
    }

    pub fn subscribe_recordings(&self) -> broadcast::Receiver<RecordingInfo> {
        self.recording_tx.subscribe()
    }
}

/// Pop full frames off the capture ring and feed them to the recorder until
/// `running` goes false. Sub-frame remainders at shutdown are discarded.
fn run_drain_loop(
    mut consumer: CaptureConsumer,
    recorder: Arc<Mutex<Recorder>>,
    running: Arc<AtomicBool>,
    frame_length: usize,
) {
    let mut frame = vec![0f32; frame_length];

    while running.load(Ordering::Relaxed) {
        if consumer.occupied_len() < frame_length {
            std::thread::sleep(Duration::from_millis(SLEEP_EMPTY_MS));
            continue;
        }
        let popped = consumer.pop_slice(&mut frame);
        debug_assert_eq!(popped, frame_length);

        if let Err(e) = recorder.lock().on_frame(&frame) {
            warn!("frame processing failed: {e}");
        }
    }
    debug!("capture drain loop stopped");
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::store::MemoryChunkStore;

    fn ready_recorder(store: &StoreHandle, first_key: ChunkKey) -> Recorder {
        let config = RecorderConfig {
            frame_length: 4,
            write_buffers_length: 3,
            ..Default::default()
        };
        let mut rec = Recorder::new(&config, store.clone(), first_key);
        rec.set_status(RecorderStatus::Ready);
        rec
    }

    #[test]
    fn accumulator_hands_off_one_unit_per_group() {
        let mut acc = FrameAccumulator::new(3);
        assert!(acc.push(&[0.1, 0.2]).is_none());
        assert!(acc.push(&[0.3, 0.4]).is_none());
        let unit = acc.push(&[0.5, 0.6]).expect("third frame completes the group");
        assert_eq!(unit, vec![0.1, 0.2, 0.3, 0.4, 0.5, 0.6]);
        // group restarts cleanly
        assert!(acc.push(&[0.7, 0.8]).is_none());
        assert_eq!(acc.take_pending(), vec![0.7, 0.8]);
    }

    #[test]
    fn chunk_writer_splits_9000_samples_into_three_chunks() {
        let store = StoreHandle::new(MemoryChunkStore::new());
        let mut writer = ChunkWriter::new(store.clone(), 44_100, 5);
        writer.push_unit(&vec![0.5f32; 9000]).unwrap();
        let info = writer.finalize().unwrap();

        assert_eq!(info.db_start_key, 5);
        assert_eq!(info.n_samples, 9000);
        assert_eq!(info.db_end_key(), 7);

        let store = store.0.lock();
        assert_eq!(store.read_chunk(5).unwrap().len(), CHUNK_LENGTH);
        assert_eq!(store.read_chunk(6).unwrap().len(), CHUNK_LENGTH);
        assert_eq!(store.read_chunk(7).unwrap().len(), 9000 - 2 * CHUNK_LENGTH);
    }

    #[test]
    fn exact_multiple_still_writes_the_final_chunk() {
        let store = StoreHandle::new(MemoryChunkStore::new());
        let mut writer = ChunkWriter::new(store.clone(), 44_100, 0);
        writer.push_unit(&vec![0.1f32; CHUNK_LENGTH]).unwrap();
        let info = writer.finalize().unwrap();

        assert_eq!(info.db_end_key(), 1);
        assert!(store.0.lock().read_chunk(1).unwrap().is_empty());
    }

    #[test]
    fn volume_tracks_peak_and_clamps_to_unit() {
        let store = StoreHandle::new(MemoryChunkStore::new());
        let mut rec = ready_recorder(&store, 0);

        rec.on_frame(&[0.25, -0.5, 0.1, 0.0]).unwrap();
        assert_eq!(rec.shared().current_volume(), 0.5);

        // over-range samples clamp to 1.0
        rec.on_frame(&[1.8, -0.2, 0.0, 0.0]).unwrap();
        assert_eq!(rec.shared().current_volume(), 1.0);
    }

    #[test]
    fn volume_updates_while_paused_but_buffers_do_not() {
        let store = StoreHandle::new(MemoryChunkStore::new());
        let mut rec = ready_recorder(&store, 0);

        rec.start().unwrap();
        rec.on_frame(&[0.1; 4]).unwrap();
        assert_eq!(rec.shared().n_encoded_buffers(), 1);

        rec.pause();
        rec.on_frame(&[0.9; 4]).unwrap();
        assert_eq!(rec.shared().current_volume(), 0.9);
        assert_eq!(rec.shared().n_encoded_buffers(), 1);

        rec.resume();
        rec.on_frame(&[0.1; 4]).unwrap();
        assert_eq!(rec.shared().n_encoded_buffers(), 2);
    }

    #[test]
    fn stop_resets_buffer_count_and_seals_metadata() {
        let store = StoreHandle::new(MemoryChunkStore::new());
        let mut rec = ready_recorder(&store, 0);

        rec.start().unwrap();
        for _ in 0..5 {
            rec.on_frame(&[0.5; 4]).unwrap();
        }
        let info = rec.stop().unwrap().expect("a recording was in progress");

        // 5 frames * 4 samples, flushed through the partial group
        assert_eq!(info.n_samples, 20);
        assert_eq!(info.db_start_key, 0);
        assert_eq!(rec.shared().n_encoded_buffers(), 0);
        assert!(rec.shared().is_inactive());

        // next recording continues after this one's key range
        rec.start().unwrap();
        let info2 = rec.stop().unwrap().unwrap();
        assert_eq!(info2.db_start_key, info.db_end_key() + 1);
    }

    #[test]
    fn start_requires_ready_status() {
        let store = StoreHandle::new(MemoryChunkStore::new());
        let config = RecorderConfig::default();
        let mut rec = Recorder::new(&config, store, 0);
        assert!(matches!(
            rec.start(),
            Err(TapedeckError::DeviceUnavailable(_))
        ));
    }

    #[test]
    fn stop_without_recording_is_a_pure_reset() {
        let store = StoreHandle::new(MemoryChunkStore::new());
        let mut rec = ready_recorder(&store, 0);
        assert!(rec.stop().unwrap().is_none());
        assert!(store.0.lock().read_chunk(0).is_err());
    }
}
