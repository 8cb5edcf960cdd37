//! Audio capture via cpal backend.
//!
//! # Design constraints
//!
//! The cpal input callback runs on an OS audio thread at elevated priority.
//! It **must not**:
//! - Allocate heap memory (beyond the first-call scratch resize)
//! - Block on a mutex or condvar
//! - Perform I/O
//!
//! This module satisfies that contract by mixing down to mono, applying the
//! gain factor, and writing into an SPSC ring buffer producer whose
//! `push_slice` is lock-free and allocation-free.
//!
//! # Capability negotiation
//!
//! Device availability is probed once, up front, by [`negotiate_capture`],
//! which returns a tagged result instead of raising per-call errors: either
//! a usable device handle or the terminal [`RecorderStatus`] explaining why
//! capture cannot start.
//!
//! # Threading note
//!
//! `cpal::Stream` is `!Send` on most platforms (COM on Windows, CoreAudio on
//! macOS). [`CaptureStream`] therefore must be created and dropped on the
//! same thread; the engine accomplishes this by opening it inside
//! `spawn_blocking`.

pub mod recorder;

#[cfg(feature = "audio-cpal")]
use cpal::{
    traits::{DeviceTrait, HostTrait, StreamTrait},
    SampleFormat, Stream, StreamConfig,
};

use serde::{Deserialize, Serialize};
use std::sync::{
    atomic::{AtomicBool, AtomicU32, Ordering},
    Arc,
};

use crate::buffering::{CaptureProducer, Producer};
use crate::error::{Result, TapedeckError};

#[cfg(feature = "audio-cpal")]
use tracing::{error, info, warn};

/// Terminal readiness state of the capture pipeline.
///
/// `Ready` is the only state capture can start from; every other state
/// requires re-acquiring the device, not retrying `start()`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub enum RecorderStatus {
    /// Not initialized yet.
    Uninitialized,
    /// No input device present on the host.
    NoDevice,
    /// A device exists but refused an input stream (e.g. access denied).
    NoMicrophone,
    /// No capture backend compiled in / available.
    NoCaptureApi,
    /// The capture backend crashed while acquiring the stream.
    CaptureError,
    /// Normal operation.
    Ready,
}

/// Shared input-gain multiplier, applied to samples before they reach the
/// accumulator. 1.0 is unity; stored as f32 bits so the RT callback can read
/// it without locking.
#[derive(Clone)]
pub struct GainControl(Arc<AtomicU32>);

impl GainControl {
    pub fn new(factor: f32) -> Self {
        Self(Arc::new(AtomicU32::new(factor.max(0.0).to_bits())))
    }

    /// Set the multiplier on input volume. Negative factors are clamped to 0.
    pub fn set_factor(&self, factor: f32) {
        self.0.store(factor.max(0.0).to_bits(), Ordering::Relaxed);
    }

    pub fn factor(&self) -> f32 {
        f32::from_bits(self.0.load(Ordering::Relaxed))
    }
}

impl Default for GainControl {
    fn default() -> Self {
        Self::new(1.0)
    }
}

/// Metadata about an audio input device.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DeviceInfo {
    /// Human-readable device name reported by the OS.
    pub name: String,
    /// Whether this is the system default input device.
    pub is_default: bool,
}

/// Outcome of probing the host for a usable capture device.
pub enum CaptureCapability {
    /// A device is ready to open.
    Available(CaptureDevice),
    /// Capture cannot start; the status says why.
    Unavailable(RecorderStatus),
}

/// A negotiated input device plus the stream configuration to open it with.
#[cfg(feature = "audio-cpal")]
pub struct CaptureDevice {
    device: cpal::Device,
    config: StreamConfig,
    sample_format: SampleFormat,
    /// Capture sample rate reported by the device (Hz).
    pub sample_rate: u32,
    /// Device channel count; capture mixes down to mono.
    pub channels: u16,
}

#[cfg(not(feature = "audio-cpal"))]
pub struct CaptureDevice {
    pub sample_rate: u32,
    pub channels: u16,
}

/// Probe the host for an input device, preferring `preferred_name` when
/// given, then the system default, then the first available device.
#[cfg(feature = "audio-cpal")]
pub fn negotiate_capture(preferred_name: Option<&str>) -> CaptureCapability {
    let host = cpal::default_host();

    let mut selected = None;
    if let Some(preferred) = preferred_name {
        match host.input_devices() {
            Ok(mut devices) => {
                selected = devices
                    .find(|d| d.name().map(|n| n == preferred).unwrap_or(false));
                if selected.is_none() {
                    warn!("preferred input device '{preferred}' not found, falling back");
                }
            }
            Err(e) => {
                warn!("failed to list input devices while resolving preference: {e}");
            }
        }
    }

    let device = match selected.or_else(|| host.default_input_device()) {
        Some(d) => d,
        None => {
            let fallback = host
                .input_devices()
                .ok()
                .and_then(|mut devices| devices.next());
            match fallback {
                Some(d) => {
                    warn!("no default input device, falling back to first available input");
                    d
                }
                None => return CaptureCapability::Unavailable(RecorderStatus::NoDevice),
            }
        }
    };

    let supported = match device.default_input_config() {
        Ok(c) => c,
        Err(e) => {
            warn!("input device refused a stream config: {e}");
            return CaptureCapability::Unavailable(RecorderStatus::NoMicrophone);
        }
    };

    let sample_rate = supported.sample_rate().0;
    let channels = supported.channels();

    info!(
        device = device.name().unwrap_or_default().as_str(),
        sample_rate, channels, "input device negotiated"
    );

    CaptureCapability::Available(CaptureDevice {
        config: StreamConfig {
            channels,
            sample_rate: supported.sample_rate(),
            buffer_size: cpal::BufferSize::Default,
        },
        sample_format: supported.sample_format(),
        device,
        sample_rate,
        channels,
    })
}

#[cfg(not(feature = "audio-cpal"))]
pub fn negotiate_capture(_preferred_name: Option<&str>) -> CaptureCapability {
    CaptureCapability::Unavailable(RecorderStatus::NoCaptureApi)
}

/// List all available audio input devices on the system.
///
/// Returns an empty `Vec` if the backend is unavailable or no devices exist.
#[cfg(feature = "audio-cpal")]
pub fn list_input_devices() -> Vec<DeviceInfo> {
    let host = cpal::default_host();
    let default_name = host.default_input_device().and_then(|d| d.name().ok());

    match host.input_devices() {
        Ok(devices) => devices
            .enumerate()
            .map(|(idx, device)| {
                let name = device
                    .name()
                    .unwrap_or_else(|_| format!("Input Device {}", idx + 1));
                let is_default = default_name.as_deref() == Some(name.as_str());
                DeviceInfo { name, is_default }
            })
            .collect(),
        Err(e) => {
            warn!("failed to enumerate input devices: {e}");
            vec![]
        }
    }
}

#[cfg(not(feature = "audio-cpal"))]
pub fn list_input_devices() -> Vec<DeviceInfo> {
    vec![]
}

/// Handle to an active capture stream.
///
/// **Not `Send`** — `cpal::Stream` is bound to its creation thread on
/// Windows/macOS. Create and drop this type on the same OS thread.
pub struct CaptureStream {
    #[cfg(feature = "audio-cpal")]
    _stream: Stream,
    /// Shared flag — set to `false` to signal the callback to no-op.
    running: Arc<AtomicBool>,
    /// Capture sample rate (Hz).
    pub sample_rate: u32,
}

impl CaptureStream {
    /// Open a negotiated device and start pushing gained mono f32 samples
    /// into `producer`.
    ///
    /// # Errors
    /// Returns `TapedeckError::AudioStream` if the backend fails to build or
    /// start the stream (the engine surfaces this as `CaptureError`).
    #[cfg(feature = "audio-cpal")]
    pub fn open(
        negotiated: CaptureDevice,
        producer: CaptureProducer,
        running: Arc<AtomicBool>,
        gain: GainControl,
    ) -> Result<Self> {
        let channels = negotiated.channels as usize;
        let run = Arc::clone(&running);

        let stream = match negotiated.sample_format {
            SampleFormat::F32 => build_input_stream(
                &negotiated.device,
                &negotiated.config,
                channels,
                producer,
                run,
                gain,
                |s: f32| s,
            ),
            SampleFormat::I16 => build_input_stream(
                &negotiated.device,
                &negotiated.config,
                channels,
                producer,
                run,
                gain,
                |s: i16| s as f32 / 32768.0,
            ),
            SampleFormat::U8 => build_input_stream(
                &negotiated.device,
                &negotiated.config,
                channels,
                producer,
                run,
                gain,
                |s: u8| (s as f32 - 128.0) / 128.0,
            ),
            fmt => Err(TapedeckError::AudioStream(format!(
                "unsupported sample format: {fmt:?}"
            ))),
        }?;

        stream
            .play()
            .map_err(|e| TapedeckError::AudioStream(e.to_string()))?;

        Ok(Self {
            _stream: stream,
            running,
            sample_rate: negotiated.sample_rate,
        })
    }

    /// Stop: signal the callback to no-op on its next invocation.
    #[cfg(feature = "audio-cpal")]
    pub fn stop(&self) {
        self.running.store(false, Ordering::Release);
    }
}

/// Stub when the `audio-cpal` feature is disabled.
#[cfg(not(feature = "audio-cpal"))]
impl CaptureStream {
    pub fn open(
        _negotiated: CaptureDevice,
        _producer: CaptureProducer,
        _running: Arc<AtomicBool>,
        _gain: GainControl,
    ) -> Result<Self> {
        Err(TapedeckError::AudioStream(
            "compiled without audio-cpal feature".into(),
        ))
    }

    pub fn stop(&self) {
        self.running.store(false, Ordering::Release);
    }
}

/// Build one input stream for a concrete sample type: mix down to mono,
/// apply the gain factor, push into the ring.
#[cfg(feature = "audio-cpal")]
fn build_input_stream<T>(
    device: &cpal::Device,
    config: &StreamConfig,
    channels: usize,
    mut producer: CaptureProducer,
    running: Arc<AtomicBool>,
    gain: GainControl,
    to_f32: impl Fn(T) -> f32 + Send + 'static,
) -> Result<Stream>
where
    T: cpal::SizedSample + Send + 'static,
{
    // Scratch buffer reused across callbacks; sized on first invocation.
    let mut mix_buf: Vec<f32> = Vec::new();

    device
        .build_input_stream(
            config,
            move |data: &[T], _info| {
                if !running.load(Ordering::Relaxed) {
                    return;
                }
                let factor = gain.factor();
                let frames = data.len() / channels;
                mix_buf.resize(frames, 0.0);
                for f in 0..frames {
                    let base = f * channels;
                    let mut sum = 0f32;
                    for c in 0..channels {
                        sum += to_f32(data[base + c]);
                    }
                    mix_buf[f] = (sum / channels as f32) * factor;
                }
                let written = producer.push_slice(&mix_buf);
                if written < mix_buf.len() {
                    warn!(
                        "capture ring full: dropped {} frames",
                        mix_buf.len() - written
                    );
                }
            },
            |err| error!("capture stream error: {err}"),
            None,
        )
        .map_err(|e| TapedeckError::AudioStream(e.to_string()))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn gain_control_clamps_negative_factors() {
        let gain = GainControl::new(1.0);
        gain.set_factor(-0.5);
        assert_eq!(gain.factor(), 0.0);
        gain.set_factor(1.5);
        assert_eq!(gain.factor(), 1.5);
    }

    #[test]
    fn unity_gain_by_default() {
        assert_eq!(GainControl::default().factor(), 1.0);
    }

    #[test]
    fn recorder_status_serializes_camel_case() {
        let json = serde_json::to_value(RecorderStatus::NoCaptureApi).unwrap();
        assert_eq!(json, "noCaptureApi");
    }
}
