//! Playback engine: a single control thread driving the scheduler.
//!
//! ## Event model
//!
//! ```text
//! Player handle ──commands──►┐
//! StoreLoader ──completions──┤──► one crossbeam channel ──► run() loop
//! OutputSink ──ended tokens──┘         (single-threaded dispatch)
//! ```
//!
//! Device callbacks, loader completions and host commands are all posted
//! onto one queue and dispatched on one blocking thread, so the scheduler
//! state machine is never entered concurrently. Completions may arrive in
//! any order; the scheduler holds them as needed.

pub mod output;
pub mod scheduler;

pub use output::{EndedToken, OutputSink, ScheduleCommand};
pub use scheduler::{
    ChunkLoader, LoadRequest, PlaybackCursor, PlaybackState, Scheduler,
};

#[cfg(feature = "audio-cpal")]
pub use output::CpalOutput;

use std::sync::{
    atomic::{AtomicBool, Ordering},
    Arc,
};
use std::time::Duration;

use crossbeam_channel::{Receiver, RecvTimeoutError, Sender};
use parking_lot::Mutex;
use tokio::sync::broadcast;
use tracing::{debug, info, warn};

use crate::{
    buffering::chunk::SampleBuffer,
    clock::Clock,
    error::{Result, TapedeckError},
    events::PlaybackEvent,
    store::{ChunkKey, RecordingInfo, StoreHandle},
    wav::{self, ChunkCodec},
};

/// Broadcast channel capacity for playback state events.
const BROADCAST_CAP: usize = 64;

/// Idle wake-up period of the control loop.
const RECV_TICK_MS: u64 = 50;

/// Everything the control loop dispatches on.
pub(crate) enum PlayerEvent {
    SeekRelative(f64),
    Pause,
    TogglePlayPause,
    Stop,
    Shutdown,
    ChunkReady {
        key: ChunkKey,
        generation: u64,
        buffer: SampleBuffer,
    },
    ChunkFailed {
        key: ChunkKey,
        generation: u64,
        error: TapedeckError,
    },
    BufferEnded(EndedToken),
}

/// Hands ended tokens from an output sink back to the control thread.
#[derive(Clone)]
pub struct EndedSender(Sender<PlayerEvent>);

impl EndedSender {
    pub fn ended(&self, token: EndedToken) {
        let _ = self.0.send(PlayerEvent::BufferEnded(token));
    }
}

/// [`ChunkLoader`] over the chunk store and codec boundary.
///
/// Stored chunks are bare PCM samples; the read path wraps them in the
/// canonical WAV container and hands the bytes to the codec, mirroring how
/// they will be consumed by export paths. Completions are posted to the
/// control queue, so from the scheduler's view every load is asynchronous.
pub struct StoreLoader {
    store: StoreHandle,
    codec: Arc<dyn ChunkCodec>,
    sample_rate: u32,
    completions: Sender<PlayerEvent>,
}

impl StoreLoader {
    pub(crate) fn new(
        store: StoreHandle,
        codec: Arc<dyn ChunkCodec>,
        sample_rate: u32,
        completions: Sender<PlayerEvent>,
    ) -> Self {
        Self {
            store,
            codec,
            sample_rate,
            completions,
        }
    }
}

impl ChunkLoader for StoreLoader {
    fn request(&mut self, req: LoadRequest) {
        debug!(key = req.key, lane = req.lane, "loading chunk");
        let loaded = self
            .store
            .0
            .lock()
            .read_chunk(req.key)
            .and_then(|samples| self.codec.decode(&wav::encode(&samples, self.sample_rate)));

        let event = match loaded {
            Ok(buffer) => PlayerEvent::ChunkReady {
                key: req.key,
                generation: req.generation,
                buffer,
            },
            Err(error) => PlayerEvent::ChunkFailed {
                key: req.key,
                generation: req.generation,
                error,
            },
        };
        let _ = self.completions.send(event);
    }
}

/// State shared between the control loop and handle snapshots.
#[derive(Default)]
struct PlayerShared {
    state: Mutex<PlaybackState>,
    cursor: Mutex<PlaybackCursor>,
}

/// Handle to a running playback engine.
///
/// All methods post onto the control queue and return immediately; state
/// transitions surface through `subscribe()` and the snapshot accessors.
pub struct Player {
    info: RecordingInfo,
    events_tx: Sender<PlayerEvent>,
    shared: Arc<PlayerShared>,
    clock: Arc<dyn Clock>,
    playback_tx: broadcast::Sender<PlaybackEvent>,
    running: Arc<AtomicBool>,
}

impl Player {
    /// Spawn the control loop for one recording.
    ///
    /// `make_sink` receives the [`EndedSender`] the sink must report
    /// completions through — pass `CpalOutput::spawn` for device output or
    /// a test double.
    pub fn spawn<F>(
        info: RecordingInfo,
        store: StoreHandle,
        codec: Arc<dyn ChunkCodec>,
        clock: Arc<dyn Clock>,
        make_sink: F,
    ) -> Result<Self>
    where
        F: FnOnce(EndedSender) -> Result<Box<dyn OutputSink>>,
    {
        let (events_tx, events_rx) = crossbeam_channel::unbounded();
        let sink = make_sink(EndedSender(events_tx.clone()))?;
        let loader = StoreLoader::new(
            store,
            codec,
            info.sample_rate,
            events_tx.clone(),
        );

        let shared = Arc::new(PlayerShared::default());
        let running = Arc::new(AtomicBool::new(true));
        let (playback_tx, _) = broadcast::channel(BROADCAST_CAP);

        let ctx = PlayerContext {
            scheduler: Scheduler::new(info),
            loader,
            sink,
            clock: Arc::clone(&clock),
            events_rx,
            running: Arc::clone(&running),
            shared: Arc::clone(&shared),
            playback_tx: playback_tx.clone(),
        };
        tokio::task::spawn_blocking(move || run(ctx));

        Ok(Self {
            info,
            events_tx,
            shared,
            clock,
            playback_tx,
            running,
        })
    }

    /// Seek to a fraction of the total duration and play from there.
    ///
    /// Invalid targets are rejected here, before anything is posted.
    pub fn seek_relative(&self, relative_time: f64) -> Result<()> {
        if !(0.0..1.0).contains(&relative_time) {
            return Err(TapedeckError::InvalidSeekTarget(relative_time));
        }
        self.post(PlayerEvent::SeekRelative(relative_time))
    }

    pub fn pause(&self) -> Result<()> {
        self.post(PlayerEvent::Pause)
    }

    pub fn toggle_play_pause(&self) -> Result<()> {
        self.post(PlayerEvent::TogglePlayPause)
    }

    pub fn stop(&self) -> Result<()> {
        self.post(PlayerEvent::Stop)
    }

    /// Stop the control loop. The handle is unusable afterwards.
    pub fn shutdown(&self) {
        self.running.store(false, Ordering::SeqCst);
        let _ = self.events_tx.send(PlayerEvent::Shutdown);
    }

    pub fn info(&self) -> &RecordingInfo {
        &self.info
    }

    pub fn state(&self) -> PlaybackState {
        *self.shared.state.lock()
    }

    pub fn is_playing(&self) -> bool {
        self.state() == PlaybackState::Playing
    }

    /// Playback position in seconds.
    pub fn position(&self) -> f64 {
        let state = *self.shared.state.lock();
        let cursor = *self.shared.cursor.lock();
        match state {
            PlaybackState::Playing => {
                (self.clock.now() - cursor.started_at).clamp(0.0, self.info.duration())
            }
            PlaybackState::Paused => cursor.paused_at - cursor.started_at,
            PlaybackState::Stopped => 0.0,
        }
    }

    /// Position as a fraction of the total duration.
    pub fn relative_position(&self) -> f64 {
        let duration = self.info.duration();
        if duration > 0.0 {
            (self.position() / duration).clamp(0.0, 1.0)
        } else {
            0.0
        }
    }

    pub fn subscribe(&self) -> broadcast::Receiver<PlaybackEvent> {
        self.playback_tx.subscribe()
    }

    fn post(&self, event: PlayerEvent) -> Result<()> {
        self.events_tx
            .send(event)
            .map_err(|_| TapedeckError::NotRunning)
    }
}

impl Drop for Player {
    fn drop(&mut self) {
        self.shutdown();
    }
}

/// All context the control loop needs, passed as one struct.
struct PlayerContext {
    scheduler: Scheduler,
    loader: StoreLoader,
    sink: Box<dyn OutputSink>,
    clock: Arc<dyn Clock>,
    events_rx: Receiver<PlayerEvent>,
    running: Arc<AtomicBool>,
    shared: Arc<PlayerShared>,
    playback_tx: broadcast::Sender<PlaybackEvent>,
}

/// Run the control loop until shutdown.
fn run(mut ctx: PlayerContext) {
    info!(
        db_start_key = ctx.scheduler.info().db_start_key,
        db_end_key = ctx.scheduler.info().db_end_key(),
        "player loop started"
    );

    while ctx.running.load(Ordering::Relaxed) {
        let event = match ctx.events_rx.recv_timeout(Duration::from_millis(RECV_TICK_MS)) {
            Ok(event) => event,
            Err(RecvTimeoutError::Timeout) => continue,
            Err(RecvTimeoutError::Disconnected) => break,
        };
        dispatch(&mut ctx, event);
    }

    ctx.sink.cancel_all();
    info!("player loop stopped");
}

fn dispatch(ctx: &mut PlayerContext, event: PlayerEvent) {
    let state_before = ctx.scheduler.state();
    let mut detail = None;

    let outcome = match event {
        PlayerEvent::SeekRelative(rt) => ctx.scheduler.seek_relative(
            rt,
            &mut ctx.loader,
            ctx.sink.as_mut(),
            ctx.clock.as_ref(),
        ),
        PlayerEvent::Pause => ctx.scheduler.pause(ctx.sink.as_mut(), ctx.clock.as_ref()),
        PlayerEvent::TogglePlayPause => ctx.scheduler.toggle_play_pause(
            &mut ctx.loader,
            ctx.sink.as_mut(),
            ctx.clock.as_ref(),
        ),
        PlayerEvent::Stop => {
            ctx.scheduler.stop(ctx.sink.as_mut());
            Ok(())
        }
        PlayerEvent::Shutdown => {
            ctx.running.store(false, Ordering::SeqCst);
            Ok(())
        }
        PlayerEvent::ChunkReady {
            key,
            generation,
            buffer,
        } => ctx.scheduler.on_chunk_ready(
            key,
            generation,
            buffer,
            ctx.sink.as_mut(),
            ctx.clock.as_ref(),
        ),
        PlayerEvent::ChunkFailed {
            key,
            generation,
            error,
        } => {
            ctx.scheduler.on_chunk_failed(key, generation, &error);
            detail = Some(error.to_string());
            Ok(())
        }
        PlayerEvent::BufferEnded(token) => {
            ctx.scheduler.on_buffer_ended(token, &mut ctx.loader)
        }
    };

    if let Err(e) = outcome {
        warn!("player event rejected: {e}");
        detail = Some(e.to_string());
    }

    let state_after = ctx.scheduler.state();
    *ctx.shared.state.lock() = state_after;
    *ctx.shared.cursor.lock() = ctx.scheduler.cursor();

    if state_after != state_before || detail.is_some() {
        let _ = ctx.playback_tx.send(PlaybackEvent {
            state: state_after,
            position: ctx.scheduler.position(ctx.clock.as_ref()),
            detail,
        });
    }
}
