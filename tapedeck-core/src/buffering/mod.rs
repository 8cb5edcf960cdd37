//! Lock-free SPSC ring buffer for captured audio samples.
//!
//! Uses `ringbuf::HeapRb<f32>` which provides a wait-free `push_slice`
//! safe to call from the real-time audio callback. The drain loop on the
//! control thread pops [`FRAME_LENGTH`]-sample frames off the consumer half.

pub mod chunk;

use ringbuf::{traits::Split, HeapRb};

pub use ringbuf::traits::{Consumer, Observer, Producer};

/// Type alias for the producer half — held by the audio callback thread.
pub type CaptureProducer = ringbuf::HeapProd<f32>;

/// Type alias for the consumer half — held by the capture drain loop.
pub type CaptureConsumer = ringbuf::HeapCons<f32>;

/// Samples per device frame. A small power of two keeps device-reported
/// latency low and makes `n_frames * FRAME_LENGTH / sample_rate` an accurate
/// elapsed-time proxy.
pub const FRAME_LENGTH: usize = 256;

/// Frames accumulated per store write unit.
pub const WRITE_BUFFERS_LENGTH: usize = 40;

/// Buffer capacity: 2^20 = 1 048 576 f32 samples ≈ 23.8 s at 44.1 kHz.
/// Protects against drops while a store write unit is being committed.
pub const RING_CAPACITY: usize = 1 << 20;

/// Create a matched producer/consumer pair backed by a heap-allocated ring buffer.
pub fn create_capture_ring() -> (CaptureProducer, CaptureConsumer) {
    HeapRb::<f32>::new(RING_CAPACITY).split()
}
