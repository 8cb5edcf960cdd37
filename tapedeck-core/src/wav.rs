//! WAV container codec.
//!
//! The encoder is owned by this crate and always produces the canonical
//! mono 16-bit little-endian PCM layout: a 44-byte header
//! (`RIFF`/`WAVE`/`fmt `/`data`) followed by raw sample bytes. It is used on
//! the store-read path (stored chunks are bare PCM samples and must be
//! wrapped in a container before the codec boundary can decode them) and by
//! hosts exporting a finished recording.
//!
//! Container *decoding* is the codec boundary's side of the contract and
//! goes through `hound`.

use std::io::Cursor;

use crate::{
    buffering::chunk::{i16_to_f32, SampleBuffer},
    error::{Result, TapedeckError},
};

/// Fixed header size of the canonical container.
pub const WAV_HEADER_LEN: usize = 44;

/// Encode 16-bit mono samples into a canonical PCM WAV container.
///
/// Header fields for `N` samples: `ChunkSize = 36 + 2N`,
/// `Subchunk2Size = 2N`, byte rate `sample_rate * 2`, block align `2`.
pub fn encode(samples: &[i16], sample_rate: u32) -> Vec<u8> {
    let data_len = (samples.len() * 2) as u32;
    let mut bytes = Vec::with_capacity(WAV_HEADER_LEN + samples.len() * 2);

    // RIFF chunk
    bytes.extend_from_slice(b"RIFF");
    bytes.extend_from_slice(&(36 + data_len).to_le_bytes());
    bytes.extend_from_slice(b"WAVE");

    // fmt sub-chunk: PCM, mono, 16-bit
    bytes.extend_from_slice(b"fmt ");
    bytes.extend_from_slice(&16u32.to_le_bytes());
    bytes.extend_from_slice(&1u16.to_le_bytes());
    bytes.extend_from_slice(&1u16.to_le_bytes());
    bytes.extend_from_slice(&sample_rate.to_le_bytes());
    bytes.extend_from_slice(&(sample_rate * 2).to_le_bytes());
    bytes.extend_from_slice(&2u16.to_le_bytes());
    bytes.extend_from_slice(&16u16.to_le_bytes());

    // data sub-chunk
    bytes.extend_from_slice(b"data");
    bytes.extend_from_slice(&data_len.to_le_bytes());
    for &s in samples {
        bytes.extend_from_slice(&s.to_le_bytes());
    }

    bytes
}

/// Decode a WAV container into 16-bit mono samples and the sample rate.
///
/// # Errors
/// Returns `TapedeckError::Codec` for malformed containers or any layout
/// other than mono 16-bit integer PCM.
pub fn decode(bytes: &[u8]) -> Result<(Vec<i16>, u32)> {
    let mut reader = hound::WavReader::new(Cursor::new(bytes))
        .map_err(|e| TapedeckError::Codec(e.to_string()))?;

    let spec = reader.spec();
    if spec.channels != 1
        || spec.bits_per_sample != 16
        || spec.sample_format != hound::SampleFormat::Int
    {
        return Err(TapedeckError::Codec(format!(
            "unsupported layout: {} ch, {} bit, {:?}",
            spec.channels, spec.bits_per_sample, spec.sample_format
        )));
    }

    let samples = reader
        .samples::<i16>()
        .collect::<std::result::Result<Vec<i16>, _>>()
        .map_err(|e| TapedeckError::Codec(e.to_string()))?;

    Ok((samples, spec.sample_rate))
}

/// The codec boundary: container bytes in, live sample buffer out.
///
/// Kept as a trait so hosts with a platform decoder can substitute it; the
/// default [`PcmWavCodec`] handles the canonical container this crate emits.
pub trait ChunkCodec: Send + Sync {
    fn decode(&self, bytes: &[u8]) -> Result<SampleBuffer>;
}

/// Default codec for canonical PCM WAV.
#[derive(Debug, Default, Clone, Copy)]
pub struct PcmWavCodec;

impl ChunkCodec for PcmWavCodec {
    fn decode(&self, bytes: &[u8]) -> Result<SampleBuffer> {
        let (samples, sample_rate) = decode(bytes)?;
        Ok(SampleBuffer::new(i16_to_f32(&samples), sample_rate))
    }
}
