//! Periodic live monitor: elapsed-time text and peak statistics.
//!
//! The monitor samples the recorder's live fields at a coarse UI cadence
//! ([`MONITOR_REFRESH_HZ`]), independent of the audio frame cadence. Nothing
//! is pushed per frame; each tick reads the current values and updates the
//! derived display state.

use std::sync::{
    atomic::{AtomicBool, Ordering},
    Arc,
};
use std::thread::JoinHandle;
use std::time::Duration;

use parking_lot::Mutex;
use tokio::sync::broadcast;
use tracing::debug;

use crate::clock::format_time;
use crate::events::LevelEvent;

/// Sampling cadence of the monitor, in ticks per second.
pub const MONITOR_REFRESH_HZ: u32 = 24;

/// Broadcast capacity for level events; slow consumers drop old samples.
const BROADCAST_CAP: usize = 64;

/// Anything the monitor can sample: a current level and an elapsed time.
pub trait MeterSource: Send + Sync {
    /// Latest observed volume in [0.0, 1.0].
    fn current_volume(&self) -> f32;
    /// Elapsed seconds of the activity being metered.
    fn elapsed_seconds(&self) -> f64;
}

/// Peak statistics since the last reset.
///
/// Both counters start at 1, not 0: a fresh meter reads "100.0% at max" and
/// the percentage never divides by zero.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct PeakStats {
    /// Highest volume observed since the last reset.
    pub max_volume_since_reset: f32,
    /// Ticks whose volume equalled the maximum.
    pub n_peaks_at_max: u32,
    /// Total ticks sampled.
    pub n_peak_measurements: u32,
}

impl PeakStats {
    pub fn new() -> Self {
        Self {
            max_volume_since_reset: 0.0,
            n_peaks_at_max: 1,
            n_peak_measurements: 1,
        }
    }

    /// Start counting from now (gain change, recording restart, new max).
    pub fn reset(&mut self) {
        *self = Self::new();
    }

    /// Percentage of ticks that sat at the maximum, one decimal.
    pub fn percent_peaks_at_max(&self) -> String {
        format!(
            "{:.1}",
            100.0 * self.n_peaks_at_max as f64 / self.n_peak_measurements as f64
        )
    }
}

impl Default for PeakStats {
    fn default() -> Self {
        Self::new()
    }
}

/// Derived display state, advanced one sample at a time.
#[derive(Debug, Clone)]
pub struct MonitorState {
    pub peaks: PeakStats,
    /// Formatted elapsed time, e.g. `00:03.2`.
    pub current_time: String,
}

impl MonitorState {
    pub fn new() -> Self {
        Self {
            peaks: PeakStats::new(),
            current_time: format_time(0.0, 0.0),
        }
    }

    /// One sampling step.
    ///
    /// A new maximum resets the peak counters *before* recording it, so the
    /// statistics always describe the current maximum only.
    pub fn tick(&mut self, volume: f32, elapsed: f64) {
        self.current_time = format_time(elapsed, elapsed);

        self.peaks.n_peak_measurements += 1;
        if volume > self.peaks.max_volume_since_reset {
            self.peaks.reset();
            self.peaks.max_volume_since_reset = volume;
        } else if volume == self.peaks.max_volume_since_reset {
            self.peaks.n_peaks_at_max += 1;
        }
    }
}

impl Default for MonitorState {
    fn default() -> Self {
        Self::new()
    }
}

/// Interval-driven monitor over a [`MeterSource`].
///
/// `start()` spawns the sampling thread; `stop()` is idempotent and safe to
/// call when the monitor is not running.
pub struct LiveMonitor {
    running: Arc<AtomicBool>,
    state: Arc<Mutex<MonitorState>>,
    handle: Mutex<Option<JoinHandle<()>>>,
    level_tx: broadcast::Sender<LevelEvent>,
}

impl LiveMonitor {
    pub fn new() -> Self {
        let (level_tx, _) = broadcast::channel(BROADCAST_CAP);
        Self {
            running: Arc::new(AtomicBool::new(false)),
            state: Arc::new(Mutex::new(MonitorState::new())),
            handle: Mutex::new(None),
            level_tx,
        }
    }

    /// Begin sampling `source` at [`MONITOR_REFRESH_HZ`].
    ///
    /// # Errors
    /// Returns `TapedeckError::AlreadyRunning` when already monitoring.
    pub fn start(&self, source: Arc<dyn MeterSource>) -> crate::error::Result<()> {
        if self.running.swap(true, Ordering::SeqCst) {
            return Err(crate::error::TapedeckError::AlreadyRunning);
        }

        let running = Arc::clone(&self.running);
        let state = Arc::clone(&self.state);
        let level_tx = self.level_tx.clone();
        let interval = Duration::from_millis(1000 / MONITOR_REFRESH_HZ as u64);

        let handle = std::thread::spawn(move || {
            let mut seq = 0u64;
            while running.load(Ordering::Relaxed) {
                let volume = source.current_volume();
                let elapsed = source.elapsed_seconds();

                let event = {
                    let mut state = state.lock();
                    state.tick(volume, elapsed);
                    LevelEvent {
                        seq,
                        volume,
                        max_volume: state.peaks.max_volume_since_reset,
                        percent_peaks_at_max: state.peaks.percent_peaks_at_max(),
                        current_time: state.current_time.clone(),
                    }
                };
                seq = seq.saturating_add(1);
                let _ = level_tx.send(event);

                std::thread::sleep(interval);
            }
            debug!("monitor loop stopped");
        });
        *self.handle.lock() = Some(handle);
        Ok(())
    }

    /// Stop sampling. Safe to call repeatedly or when never started.
    pub fn stop(&self) {
        self.running.store(false, Ordering::SeqCst);
        if let Some(handle) = self.handle.lock().take() {
            let _ = handle.join();
        }
    }

    /// Start counting peaks from now.
    pub fn reset_peaks(&self) {
        self.state.lock().peaks.reset();
    }

    /// Snapshot of the current display state.
    pub fn state(&self) -> MonitorState {
        self.state.lock().clone()
    }

    pub fn subscribe_levels(&self) -> broadcast::Receiver<LevelEvent> {
        self.level_tx.subscribe()
    }
}

impl Default for LiveMonitor {
    fn default() -> Self {
        Self::new()
    }
}

impl Drop for LiveMonitor {
    fn drop(&mut self) {
        self.stop();
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    struct FixedMeter {
        volume: f32,
        elapsed: f64,
    }

    impl MeterSource for FixedMeter {
        fn current_volume(&self) -> f32 {
            self.volume
        }

        fn elapsed_seconds(&self) -> f64 {
            self.elapsed
        }
    }

    #[test]
    fn fresh_stats_read_one_hundred_percent() {
        let stats = PeakStats::new();
        assert_eq!(stats.n_peaks_at_max, 1);
        assert_eq!(stats.n_peak_measurements, 1);
        assert_eq!(stats.percent_peaks_at_max(), "100.0");
    }

    #[test]
    fn new_maximum_resets_peaks_before_recording_it() {
        let mut state = MonitorState::new();
        state.tick(0.3, 0.0);
        state.tick(0.3, 0.0);
        assert_eq!(state.peaks.n_peaks_at_max, 2);
        assert_eq!(state.peaks.n_peak_measurements, 2);

        // louder sample: counters restart at 1/1 under the new max
        state.tick(0.8, 0.0);
        assert_eq!(state.peaks.max_volume_since_reset, 0.8);
        assert_eq!(state.peaks.n_peaks_at_max, 1);
        assert_eq!(state.peaks.n_peak_measurements, 1);
        assert_eq!(state.peaks.percent_peaks_at_max(), "100.0");
    }

    #[test]
    fn quieter_samples_dilute_the_percentage() {
        let mut state = MonitorState::new();
        state.tick(0.5, 0.0);
        state.tick(0.2, 0.0);
        state.tick(0.2, 0.0);
        // max tick counted once out of three measurements
        assert_eq!(state.peaks.n_peaks_at_max, 1);
        assert_eq!(state.peaks.n_peak_measurements, 3);
        assert_eq!(state.peaks.percent_peaks_at_max(), "33.3");
    }

    #[test]
    fn counter_invariant_holds() {
        let mut state = MonitorState::new();
        for i in 0..100 {
            state.tick((i % 7) as f32 / 10.0, 0.0);
            assert!(state.peaks.n_peaks_at_max <= state.peaks.n_peak_measurements);
        }
    }

    #[test]
    fn tick_formats_elapsed_time() {
        let mut state = MonitorState::new();
        state.tick(0.0, 3.21);
        assert_eq!(state.current_time, "00:03.2");
    }

    #[test]
    fn stop_is_idempotent() {
        let monitor = LiveMonitor::new();
        monitor.stop();
        monitor.stop();

        monitor
            .start(Arc::new(FixedMeter {
                volume: 0.4,
                elapsed: 1.0,
            }))
            .unwrap();
        monitor.stop();
        monitor.stop();
    }

    #[test]
    fn monitor_emits_level_events() {
        let monitor = LiveMonitor::new();
        let mut rx = monitor.subscribe_levels();
        monitor
            .start(Arc::new(FixedMeter {
                volume: 0.4,
                elapsed: 2.5,
            }))
            .unwrap();

        let event = loop {
            match rx.try_recv() {
                Ok(ev) => break ev,
                Err(_) => std::thread::sleep(Duration::from_millis(5)),
            }
        };
        monitor.stop();

        assert_eq!(event.volume, 0.4);
        assert_eq!(event.max_volume, 0.4);
        assert_eq!(event.current_time, "00:02.5");
    }
}
