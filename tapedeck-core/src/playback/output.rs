//! Device output boundary.
//!
//! The scheduler emits [`ScheduleCommand`]s naming a decoded buffer, an
//! absolute start time, an intra-buffer start offset and an output offset;
//! the sink owns actually getting samples to the device. Every command
//! carries an [`EndedToken`]; the sink reports it exactly once, after the
//! buffer finishes playing, back onto the control thread.
//!
//! [`CpalOutput`] is the device-backed implementation. Because
//! `cpal::Stream` is `!Send`, the stream lives on a dedicated thread and the
//! handle only touches the shared schedule queue — so the handle itself is
//! `Send` and can live inside the player's control loop.

#[cfg(feature = "audio-cpal")]
use std::sync::{
    atomic::{AtomicBool, Ordering},
    Arc,
};

use crate::buffering::chunk::SampleBuffer;
use crate::error::Result;
use crate::store::ChunkKey;

#[cfg(feature = "audio-cpal")]
use crate::clock::Clock;
#[cfg(feature = "audio-cpal")]
use crate::error::TapedeckError;
#[cfg(feature = "audio-cpal")]
use cpal::traits::{DeviceTrait, HostTrait, StreamTrait};
#[cfg(feature = "audio-cpal")]
use parking_lot::Mutex;
#[cfg(feature = "audio-cpal")]
use tracing::{debug, error, warn};

/// Identifies one scheduled buffer within one playback run.
///
/// The generation makes stale completions detectable: a token minted before
/// a stop/seek no longer matches the scheduler's current generation and is
/// discarded on arrival.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct EndedToken {
    pub key: ChunkKey,
    pub generation: u64,
}

/// One unit of work for the output device.
#[derive(Debug, Clone)]
pub struct ScheduleCommand {
    /// Decoded samples to play.
    pub buffer: SampleBuffer,
    /// Absolute start time in clock seconds; `0.0` means start immediately.
    pub when: f64,
    /// Seconds into the buffer at which playback begins.
    pub buffer_offset: f64,
    /// Seconds of offset into the output destination (0 for the default).
    pub output_offset: f64,
    /// Reported back via the ended callback when the buffer completes.
    pub token: EndedToken,
}

/// Contract for output devices.
pub trait OutputSink: Send {
    /// Queue one buffer for playback at its absolute start time.
    fn schedule(&mut self, cmd: ScheduleCommand) -> Result<()>;

    /// Drop everything queued. Cancelled buffers do not report ended.
    fn cancel_all(&mut self);
}

/// One queued buffer inside the cpal sink.
#[cfg(feature = "audio-cpal")]
struct ActiveBuffer {
    samples: Vec<f32>,
    /// Absolute clock time at which sample `cursor`'s playback begins.
    start_at: f64,
    /// Next sample index to emit.
    cursor: usize,
    started: bool,
    token: EndedToken,
}

/// Device-backed output sink.
///
/// The output callback mixes every due buffer into the stream against the
/// shared clock; a finished buffer's token is handed to the ended callback
/// from the audio thread, which forwards it to the control thread.
#[cfg(feature = "audio-cpal")]
pub struct CpalOutput {
    queue: Arc<Mutex<Vec<ActiveBuffer>>>,
    clock: Arc<dyn Clock>,
    running: Arc<AtomicBool>,
    /// Output device rate — buffers at other rates play detuned and log.
    sample_rate: u32,
}

#[cfg(feature = "audio-cpal")]
impl CpalOutput {
    /// Open the default output device on a dedicated thread.
    ///
    /// `on_ended` runs on the audio thread; implementations should only
    /// forward the token to a channel.
    pub fn spawn<F>(clock: Arc<dyn Clock>, on_ended: F) -> Result<Self>
    where
        F: Fn(EndedToken) + Send + 'static,
    {
        let queue: Arc<Mutex<Vec<ActiveBuffer>>> = Arc::new(Mutex::new(Vec::new()));
        let running = Arc::new(AtomicBool::new(true));

        let cb_queue = Arc::clone(&queue);
        let cb_clock = Arc::clone(&clock);
        let cb_running = Arc::clone(&running);
        let (open_tx, open_rx) = std::sync::mpsc::channel::<Result<u32>>();

        // The stream is !Send: build it on the thread that keeps it alive.
        std::thread::spawn(move || {
            let host = cpal::default_host();
            let Some(device) = host.default_output_device() else {
                let _ = open_tx.send(Err(TapedeckError::DeviceUnavailable(
                    "no default output device".into(),
                )));
                return;
            };
            let supported = match device.default_output_config() {
                Ok(c) => c,
                Err(e) => {
                    let _ = open_tx.send(Err(TapedeckError::DeviceUnavailable(e.to_string())));
                    return;
                }
            };
            let sample_rate = supported.sample_rate().0;
            let channels = supported.channels() as usize;
            let config = cpal::StreamConfig {
                channels: supported.channels(),
                sample_rate: supported.sample_rate(),
                buffer_size: cpal::BufferSize::Default,
            };

            let stream = device.build_output_stream(
                &config,
                move |data: &mut [f32], _info| {
                    render(
                        data,
                        channels,
                        sample_rate,
                        cb_clock.now(),
                        &mut cb_queue.lock(),
                        &on_ended,
                    );
                },
                |err| error!("output stream error: {err}"),
                None,
            );

            let stream = match stream {
                Ok(s) => s,
                Err(e) => {
                    let _ = open_tx.send(Err(TapedeckError::AudioStream(e.to_string())));
                    return;
                }
            };
            if let Err(e) = stream.play() {
                let _ = open_tx.send(Err(TapedeckError::AudioStream(e.to_string())));
                return;
            }
            let _ = open_tx.send(Ok(sample_rate));

            while cb_running.load(Ordering::Relaxed) {
                std::thread::sleep(std::time::Duration::from_millis(50));
            }
            drop(stream);
            debug!("output stream closed");
        });

        let sample_rate = open_rx
            .recv()
            .map_err(|_| TapedeckError::AudioStream("output thread died".into()))??;

        Ok(Self {
            queue,
            clock,
            running,
            sample_rate,
        })
    }

    /// Release the device and its thread.
    pub fn close(&self) {
        self.running.store(false, Ordering::SeqCst);
    }
}

#[cfg(feature = "audio-cpal")]
impl Drop for CpalOutput {
    fn drop(&mut self) {
        self.close();
    }
}

#[cfg(feature = "audio-cpal")]
impl OutputSink for CpalOutput {
    fn schedule(&mut self, cmd: ScheduleCommand) -> Result<()> {
        if cmd.buffer.sample_rate != self.sample_rate {
            warn!(
                buffer_rate = cmd.buffer.sample_rate,
                device_rate = self.sample_rate,
                "buffer rate differs from device rate"
            );
        }
        let start_at = if cmd.when == 0.0 {
            self.clock.now() + cmd.output_offset
        } else {
            cmd.when + cmd.output_offset
        };
        let cursor =
            ((cmd.buffer_offset * cmd.buffer.sample_rate as f64).round() as usize)
                .min(cmd.buffer.len());

        self.queue.lock().push(ActiveBuffer {
            samples: cmd.buffer.samples,
            start_at,
            cursor,
            started: false,
            token: cmd.token,
        });
        Ok(())
    }

    fn cancel_all(&mut self) {
        self.queue.lock().clear();
    }
}

/// Mix every due buffer into one output callback's worth of frames.
#[cfg(feature = "audio-cpal")]
fn render<F: Fn(EndedToken)>(
    data: &mut [f32],
    channels: usize,
    sample_rate: u32,
    now: f64,
    queue: &mut Vec<ActiveBuffer>,
    on_ended: &F,
) {
    data.fill(0.0);
    let frames = data.len() / channels;

    queue.retain_mut(|active| {
        // Frames until this buffer is due; already-started buffers continue
        // from their cursor.
        let skip = if active.started {
            0
        } else if active.start_at <= now {
            active.started = true;
            0
        } else {
            let ahead = ((active.start_at - now) * sample_rate as f64).round() as usize;
            if ahead >= frames {
                return true; // not due within this callback
            }
            active.started = true;
            ahead
        };

        for frame in skip..frames {
            let Some(&sample) = active.samples.get(active.cursor) else {
                break;
            };
            active.cursor += 1;
            let base = frame * channels;
            for ch in 0..channels {
                data[base + ch] += sample;
            }
        }

        if active.cursor >= active.samples.len() {
            on_ended(active.token);
            false
        } else {
            true
        }
    });
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn token_equality_includes_generation() {
        let a = EndedToken {
            key: 4,
            generation: 1,
        };
        let b = EndedToken {
            key: 4,
            generation: 2,
        };
        assert_ne!(a, b);
    }

    #[cfg(feature = "audio-cpal")]
    #[test]
    fn render_mixes_due_buffers_and_reports_ended() {
        let ended = parking_lot::Mutex::new(Vec::new());
        let mut queue = vec![ActiveBuffer {
            samples: vec![0.5, 0.5, 0.5],
            start_at: 1.0,
            cursor: 0,
            started: false,
            token: EndedToken {
                key: 0,
                generation: 0,
            },
        }];

        // callback entirely before the start time: silence, buffer retained
        let mut data = vec![0f32; 8];
        render(&mut data, 2, 4, 0.0, &mut queue, &|t| {
            ended.lock().push(t)
        });
        assert!(data.iter().all(|&s| s == 0.0));
        assert_eq!(queue.len(), 1);

        // callback at the start time: all three samples fit in four frames
        let mut data = vec![0f32; 8];
        render(&mut data, 2, 4, 1.0, &mut queue, &|t| {
            ended.lock().push(t)
        });
        assert_eq!(&data[..6], &[0.5, 0.5, 0.5, 0.5, 0.5, 0.5]);
        assert_eq!(&data[6..], &[0.0, 0.0]);
        assert!(queue.is_empty());
        assert_eq!(ended.lock().len(), 1);
    }

    #[cfg(feature = "audio-cpal")]
    #[test]
    fn render_offsets_buffers_due_mid_callback() {
        let mut queue = vec![ActiveBuffer {
            samples: vec![0.25; 8],
            start_at: 1.5,
            cursor: 0,
            started: false,
            token: EndedToken {
                key: 1,
                generation: 0,
            },
        }];

        // 4 frames at 4 Hz starting at t=1.0: the buffer is due at frame 2
        let mut data = vec![0f32; 4];
        render(&mut data, 1, 4, 1.0, &mut queue, &|_| {});
        assert_eq!(data, vec![0.0, 0.0, 0.25, 0.25]);
        assert_eq!(queue[0].cursor, 2);
    }
}
