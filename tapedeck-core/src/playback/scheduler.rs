//! Chunk playback scheduler.
//!
//! ## Look-ahead model
//!
//! ```text
//! seek(rt) ──► load k, k+1          (parity lanes 0/1, concurrently)
//!   ready(k)   ──► schedule k   immediately, offset chunk_start_time
//!   ready(k+1) ──► schedule k+1 at started_at + Δkey · chunk_duration
//!   ended(k)   ──► load k+2 ──► ready ──► schedule k+2
//!   ended(k+1) ──► load k+3 ──► ...
//!   ended(j), j+2 > db_end_key ──► terminal no-op, run drains to Stopped
//! ```
//!
//! Each completed chunk pre-loads the chunk **two** keys ahead: odd and even
//! keys decode through two independent lanes, so the next-but-one chunk can
//! decode while the next chunk is already playing, and a lane never carries
//! two outstanding requests.
//!
//! Every future chunk's start time is computed from `started_at` and the
//! fixed `chunk_duration` — never by chaining from the previous chunk's end,
//! which would accumulate drift.
//!
//! ## Stale completions
//!
//! All requests and schedule commands carry the run's generation. stop /
//! seek / pause bump it, so completions from a cancelled run no-op when they
//! arrive instead of scheduling into a dead run.

use serde::{Deserialize, Serialize};
use tracing::{debug, error, warn};

use crate::{
    buffering::chunk::SampleBuffer,
    clock::Clock,
    error::{Result, TapedeckError},
    playback::output::{EndedToken, OutputSink, ScheduleCommand},
    store::{ChunkKey, RecordingInfo, CHUNK_LENGTH},
};

/// Player run state.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum PlaybackState {
    /// Nothing scheduled; position reads zero.
    Stopped,
    /// A run is live: chunks are scheduled or draining.
    Playing,
    /// Run suspended; `paused_at` holds the resume position.
    Paused,
}

impl Default for PlaybackState {
    fn default() -> Self {
        PlaybackState::Stopped
    }
}

/// Mutable position state of the current run. Reset on every seek/stop.
///
/// `started_at` is the absolute clock time at which *sample 0 of the
/// recording* would play, so `clock.now() - started_at` is the position and
/// `(paused_at - started_at) / duration` is directly the resume fraction.
#[derive(Debug, Clone, Copy, Default, PartialEq)]
pub struct PlaybackCursor {
    pub started_at: f64,
    pub paused_at: f64,
    /// Offset into the first scheduled chunk when a run begins mid-chunk.
    pub chunk_start_time: f64,
}

/// An asynchronous load+decode request for one chunk.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct LoadRequest {
    pub key: ChunkKey,
    /// Decode lane, `key % 2`.
    pub lane: usize,
    pub generation: u64,
}

/// Begins loading and decoding chunks; completions are posted back to the
/// control thread as `ChunkReady` / `ChunkFailed` events, possibly out of
/// submission order.
pub trait ChunkLoader: Send {
    fn request(&mut self, req: LoadRequest);
}

/// One parity decode lane. Exclusively owned by at most one in-flight
/// decode; a ready chunk is held here until every lower key is scheduled.
enum LaneState {
    Idle,
    Loading(ChunkKey),
    Ready(ChunkKey, SampleBuffer),
}

/// The playback state machine.
///
/// All methods run on the single control thread; the loader, sink and clock
/// are injected per call so the machine itself stays plain data.
pub struct Scheduler {
    info: RecordingInfo,
    state: PlaybackState,
    cursor: PlaybackCursor,
    /// Bumped by stop/seek/pause; stale completions compare unequal.
    generation: u64,
    lanes: [LaneState; 2],
    /// First chunk of the current run — scheduled immediate, never by time.
    start_key: ChunkKey,
    /// Next key allowed to issue a schedule command (increasing-time order).
    next_schedule_key: Option<ChunkKey>,
    /// Scheduled buffers that have not reported ended yet.
    outstanding: usize,
    /// Set on a load failure: no further scheduling this run.
    aborted: bool,
}

impl Scheduler {
    pub fn new(info: RecordingInfo) -> Self {
        Self {
            info,
            state: PlaybackState::Stopped,
            cursor: PlaybackCursor::default(),
            generation: 0,
            lanes: [LaneState::Idle, LaneState::Idle],
            start_key: info.db_start_key,
            next_schedule_key: None,
            outstanding: 0,
            aborted: false,
        }
    }

    pub fn info(&self) -> &RecordingInfo {
        &self.info
    }

    pub fn state(&self) -> PlaybackState {
        self.state
    }

    pub fn cursor(&self) -> PlaybackCursor {
        self.cursor
    }

    pub fn generation(&self) -> u64 {
        self.generation
    }

    /// Playback position in seconds.
    pub fn position(&self, clock: &dyn Clock) -> f64 {
        match self.state {
            PlaybackState::Playing => {
                (clock.now() - self.cursor.started_at).clamp(0.0, self.info.duration())
            }
            PlaybackState::Paused => self.cursor.paused_at - self.cursor.started_at,
            PlaybackState::Stopped => 0.0,
        }
    }

    fn lane_of(key: ChunkKey) -> usize {
        (key % 2) as usize
    }

    /// Begin (or restart) playback at a fraction of the total duration.
    ///
    /// Rejected before any I/O when `relative_time` is outside `[0, 1)`.
    pub fn seek_relative(
        &mut self,
        relative_time: f64,
        loader: &mut dyn ChunkLoader,
        sink: &mut dyn OutputSink,
        clock: &dyn Clock,
    ) -> Result<()> {
        if !(0.0..1.0).contains(&relative_time) {
            return Err(TapedeckError::InvalidSeekTarget(relative_time));
        }

        // Cancel any in-flight run; the host's monitoring keeps going.
        self.cancel_run(sink);

        let n_samples = self.info.n_samples;
        let absolute_sample = ((relative_time * n_samples as f64).floor() as u64)
            .min(n_samples.saturating_sub(1));
        let start_key =
            self.info.db_start_key + (absolute_sample / CHUNK_LENGTH as u64) as ChunkKey;
        let chunk_sample = (absolute_sample % CHUNK_LENGTH as u64) as f64;

        self.cursor.chunk_start_time =
            chunk_sample * self.info.chunk_duration() / CHUNK_LENGTH as f64;
        // Provisional anchor so position reads sensibly while the first
        // chunk decodes; re-derived the instant it is actually scheduled.
        self.cursor.started_at = clock.now()
            - self.cursor.chunk_start_time
            - (start_key - self.info.db_start_key) as f64 * self.info.chunk_duration();
        self.start_key = start_key;
        self.next_schedule_key = Some(start_key);
        self.state = PlaybackState::Playing;

        debug!(
            relative_time,
            absolute_sample,
            start_key,
            db_end_key = self.info.db_end_key(),
            "seek"
        );

        self.request_load(start_key, loader)?;
        if start_key < self.info.db_end_key() {
            self.request_load(start_key + 1, loader)?;
        }
        Ok(())
    }

    /// Suspend the run, remembering the resume position.
    pub fn pause(&mut self, sink: &mut dyn OutputSink, clock: &dyn Clock) -> Result<()> {
        if self.state != PlaybackState::Playing {
            return Err(TapedeckError::NotRunning);
        }
        self.cursor.paused_at = clock.now();
        self.cancel_run(sink);
        self.state = PlaybackState::Paused;
        debug!(paused_at = self.cursor.paused_at, "paused");
        Ok(())
    }

    /// Pause when playing; otherwise re-seek to the fraction implied by the
    /// pause position (or the beginning when stopped).
    pub fn toggle_play_pause(
        &mut self,
        loader: &mut dyn ChunkLoader,
        sink: &mut dyn OutputSink,
        clock: &dyn Clock,
    ) -> Result<()> {
        match self.state {
            PlaybackState::Playing => self.pause(sink, clock),
            PlaybackState::Paused => {
                let fraction = (self.cursor.paused_at - self.cursor.started_at)
                    / self.info.duration();
                let fraction = if fraction.is_finite() {
                    fraction.clamp(0.0, 1.0 - f64::EPSILON)
                } else {
                    0.0
                };
                self.seek_relative(fraction, loader, sink, clock)
            }
            PlaybackState::Stopped => self.seek_relative(0.0, loader, sink, clock),
        }
    }

    /// End the run and reset the cursor. Stale completions from the run
    /// no-op when they arrive.
    pub fn stop(&mut self, sink: &mut dyn OutputSink) {
        self.cancel_run(sink);
        self.cursor = PlaybackCursor::default();
        self.state = PlaybackState::Stopped;
        debug!("stopped");
    }

    /// Absolute schedule time for chunk `key` of the current run.
    ///
    /// # Errors
    /// - `ChunkOutOfRange` for keys outside `[db_start_key, db_end_key]`.
    /// - `NowChunkSchedule` for `db_start_key` itself — the "now" chunk is
    ///   always scheduled immediate-relative, never by absolute time.
    pub fn chunk_when_time(&self, key: ChunkKey) -> Result<f64> {
        if key < self.info.db_start_key || key > self.info.db_end_key() {
            return Err(TapedeckError::ChunkOutOfRange { key });
        }
        let delta_key = key - self.info.db_start_key;
        if delta_key == 0 {
            return Err(TapedeckError::NowChunkSchedule { key });
        }
        Ok(self.cursor.started_at + delta_key as f64 * self.info.chunk_duration())
    }

    /// A decode lane finished. Holds the buffer until every lower key is
    /// scheduled, so commands always reach the sink in increasing-time
    /// order even when lanes complete out of order.
    pub fn on_chunk_ready(
        &mut self,
        key: ChunkKey,
        generation: u64,
        buffer: SampleBuffer,
        sink: &mut dyn OutputSink,
        clock: &dyn Clock,
    ) -> Result<()> {
        if generation != self.generation {
            debug!(key, generation, "stale chunk ready discarded");
            return Ok(());
        }
        let lane = Self::lane_of(key);
        match &self.lanes[lane] {
            LaneState::Loading(pending) if *pending == key => {
                self.lanes[lane] = LaneState::Ready(key, buffer);
            }
            _ => {
                warn!(key, lane, "chunk ready for a lane not loading it");
                return Ok(());
            }
        }
        self.drain_ready(sink, clock)
    }

    /// A decode lane failed: abort the scheduling chain from this chunk
    /// onward. Already-scheduled chunks keep playing to completion.
    pub fn on_chunk_failed(&mut self, key: ChunkKey, generation: u64, error: &TapedeckError) {
        if generation != self.generation {
            debug!(key, generation, "stale chunk failure discarded");
            return;
        }
        error!(key, %error, "chunk load failed — aborting schedule chain");
        let lane = Self::lane_of(key);
        self.lanes[lane] = LaneState::Idle;
        self.aborted = true;
        self.next_schedule_key = None;
        self.finish_if_drained();
    }

    /// A scheduled buffer finished playing: pre-load the chunk two keys
    /// ahead on this key's parity lane, or mark end of stream.
    pub fn on_buffer_ended(
        &mut self,
        token: EndedToken,
        loader: &mut dyn ChunkLoader,
    ) -> Result<()> {
        if token.generation != self.generation {
            debug!(key = token.key, "stale buffer ended discarded");
            return Ok(());
        }
        self.outstanding = self.outstanding.saturating_sub(1);

        let look_ahead = token.key + 2;
        if self.aborted || look_ahead > self.info.db_end_key() {
            debug!(key = token.key, "no further scheduling from this chunk");
            self.finish_if_drained();
            return Ok(());
        }
        self.request_load(look_ahead, loader)
    }

    // ── Internal ─────────────────────────────────────────────────────────

    fn cancel_run(&mut self, sink: &mut dyn OutputSink) {
        sink.cancel_all();
        self.generation += 1;
        self.lanes = [LaneState::Idle, LaneState::Idle];
        self.next_schedule_key = None;
        self.outstanding = 0;
        self.aborted = false;
    }

    fn request_load(&mut self, key: ChunkKey, loader: &mut dyn ChunkLoader) -> Result<()> {
        let lane = Self::lane_of(key);
        if !matches!(self.lanes[lane], LaneState::Idle) {
            return Err(TapedeckError::LaneBusy { lane });
        }
        self.lanes[lane] = LaneState::Loading(key);
        loader.request(LoadRequest {
            key,
            lane,
            generation: self.generation,
        });
        Ok(())
    }

    fn drain_ready(&mut self, sink: &mut dyn OutputSink, clock: &dyn Clock) -> Result<()> {
        if self.aborted {
            return Ok(());
        }
        while let Some(next) = self.next_schedule_key {
            let lane = Self::lane_of(next);
            if !matches!(&self.lanes[lane], LaneState::Ready(key, _) if *key == next) {
                break;
            }
            let LaneState::Ready(_, buffer) =
                std::mem::replace(&mut self.lanes[lane], LaneState::Idle)
            else {
                unreachable!("lane checked Ready above");
            };
            self.schedule_chunk(next, buffer, sink, clock)?;
            self.next_schedule_key = if next < self.info.db_end_key() {
                Some(next + 1)
            } else {
                None
            };
        }
        Ok(())
    }

    fn schedule_chunk(
        &mut self,
        key: ChunkKey,
        buffer: SampleBuffer,
        sink: &mut dyn OutputSink,
        clock: &dyn Clock,
    ) -> Result<()> {
        let token = EndedToken {
            key,
            generation: self.generation,
        };

        if key == self.start_key {
            // The "now" chunk anchors the run: derive started_at so that the
            // whole recording's sample 0 maps to a fixed clock time.
            let now = clock.now();
            let whole_chunks =
                (key - self.info.db_start_key) as f64 * self.info.chunk_duration();
            self.cursor.started_at = now - self.cursor.chunk_start_time - whole_chunks;
            sink.schedule(ScheduleCommand {
                buffer,
                when: 0.0,
                buffer_offset: self.cursor.chunk_start_time,
                output_offset: 0.0,
                token,
            })?;
        } else {
            let when = self.chunk_when_time(key)?;
            sink.schedule(ScheduleCommand {
                buffer,
                when,
                buffer_offset: 0.0,
                output_offset: 0.0,
                token,
            })?;
        }
        self.outstanding += 1;
        debug!(key, outstanding = self.outstanding, "chunk scheduled");
        Ok(())
    }

    fn finish_if_drained(&mut self) {
        let lanes_idle = self
            .lanes
            .iter()
            .all(|lane| matches!(lane, LaneState::Idle));
        if self.outstanding == 0 && lanes_idle && self.state == PlaybackState::Playing {
            debug!("playback drained");
            self.cursor = PlaybackCursor::default();
            self.state = PlaybackState::Stopped;
        }
    }
}
