//! # Audio Codec Utilities
//!
//! Pure conversions between linear PCM samples, base64 transport encoding and
//! playable multi-channel buffers.
//!
//! ## Audio Format Requirements:
//! - **Outbound**: 16-bit signed little-endian PCM, mono, base64 encoded
//! - **Inbound raw PCM**: 16-bit signed little-endian, interleaved by channel
//! - **Inbound compressed** (mp3, opus, ...): handed to the host's [`NativeDecoder`]

use crate::error::{ClientError, ClientResult};
use crate::protocol::AudioChunk;
use base64::engine::general_purpose::STANDARD as BASE64;
use base64::Engine;
use byteorder::{LittleEndian, ReadBytesExt, WriteBytesExt};
use std::io::Cursor;

/// Rate assumed for raw PCM chunks that arrive without a `sample_rate`
/// (the backend's TTS emits 24kHz PCM).
pub const DEFAULT_PCM_SAMPLE_RATE: u32 = 24000;

/// Decoded audio ready to be scheduled, one sample vector per channel.
#[derive(Debug, Clone, PartialEq)]
pub struct AudioBuffer {
    pub sample_rate: u32,
    pub channels: Vec<Vec<f32>>,
}

impl AudioBuffer {
    pub fn new(sample_rate: u32, channels: Vec<Vec<f32>>) -> Self {
        Self { sample_rate, channels }
    }

    /// Mono buffer of zeros lasting `duration_secs`.
    pub fn silence(sample_rate: u32, duration_secs: f64) -> Self {
        let frames = (duration_secs * sample_rate as f64).round() as usize;
        Self::new(sample_rate, vec![vec![0.0; frames]])
    }

    /// Samples per channel.
    pub fn frames(&self) -> usize {
        self.channels.first().map(Vec::len).unwrap_or(0)
    }

    pub fn channel_count(&self) -> usize {
        self.channels.len()
    }

    /// Playback length in seconds.
    pub fn duration_secs(&self) -> f64 {
        if self.sample_rate == 0 {
            return 0.0;
        }
        self.frames() as f64 / self.sample_rate as f64
    }
}

/// The host audio subsystem's decoder for compressed payloads.
pub trait NativeDecoder {
    fn decode_compressed(&self, bytes: &[u8], mime_type: &str) -> ClientResult<AudioBuffer>;
}

/// Format metadata needed to turn inbound bytes into an [`AudioBuffer`].
#[derive(Debug, Clone, PartialEq)]
pub struct AudioFormat {
    pub mime_type: String,
    pub sample_rate: u32,
    pub channels: u16,
    pub encoding: Option<String>,
    pub codec: Option<String>,
}

impl AudioFormat {
    pub fn from_chunk(chunk: &AudioChunk) -> Self {
        Self {
            mime_type: chunk.mime_type.clone(),
            sample_rate: chunk.sample_rate.unwrap_or(DEFAULT_PCM_SAMPLE_RATE),
            channels: chunk.channels.unwrap_or(1),
            encoding: chunk.encoding.clone(),
            codec: chunk.codec.clone(),
        }
    }

    /// Whether the payload is headerless 16-bit PCM we can unpack ourselves.
    pub fn is_raw_pcm(&self) -> bool {
        let mime = self.mime_type.to_ascii_lowercase();
        let raw_mime = ["audio/pcm", "audio/l16", "audio/raw", "audio/x-raw"]
            .iter()
            .any(|prefix| mime.starts_with(prefix));
        let raw_encoding = self
            .encoding
            .as_deref()
            .map(|e| matches!(e.to_ascii_lowercase().as_str(), "pcm" | "pcm_s16le" | "linear16"))
            .unwrap_or(false);
        let raw_codec = self
            .codec
            .as_deref()
            .map(|c| c.eq_ignore_ascii_case("pcm"))
            .unwrap_or(false);
        raw_mime || raw_encoding || raw_codec
    }
}

/// Decode a base64 transport payload.
pub fn decode(encoded: &str) -> ClientResult<Vec<u8>> {
    Ok(BASE64.decode(encoded.trim())?)
}

/// Quantize one float sample to 16-bit PCM.
///
/// Out-of-range input is clamped to [-1.0, 1.0]; NaN becomes silence.
/// Negative values scale by 32768 and positive by 32767 so both ends of the
/// i16 range are reachable.
pub fn quantize_sample(sample: f32) -> i16 {
    if sample.is_nan() {
        return 0;
    }
    let clamped = sample.clamp(-1.0, 1.0);
    let scaled = if clamped < 0.0 {
        clamped * 32768.0
    } else {
        clamped * 32767.0
    };
    scaled.round() as i16
}

/// Encode float samples as base64 little-endian 16-bit PCM.
pub fn encode_frame(samples: &[f32]) -> String {
    let mut bytes = Vec::with_capacity(samples.len() * 2);
    for &sample in samples {
        // Writing into a Vec cannot fail.
        let _ = bytes.write_i16::<LittleEndian>(quantize_sample(sample));
    }
    BASE64.encode(bytes)
}

/// Unpack interleaved 16-bit PCM into per-channel float vectors.
///
/// ## Errors:
/// - **AudioDecode**: empty input, zero channels, or a byte length that is not a
///   multiple of `2 * channels`
pub fn decode_pcm16(bytes: &[u8], sample_rate: u32, channels: u16) -> ClientResult<AudioBuffer> {
    if channels == 0 {
        return Err(ClientError::AudioDecode("channel count must be at least 1".to_string()));
    }
    if bytes.is_empty() {
        return Err(ClientError::AudioDecode("no audio data provided".to_string()));
    }
    let stride = 2 * channels as usize;
    if bytes.len() % stride != 0 {
        return Err(ClientError::AudioDecode(format!(
            "{} bytes is not a multiple of the {}-byte frame stride",
            bytes.len(),
            stride
        )));
    }

    let frames = bytes.len() / stride;
    let mut planes = vec![Vec::with_capacity(frames); channels as usize];
    let mut cursor = Cursor::new(bytes);
    for _ in 0..frames {
        for plane in planes.iter_mut() {
            let sample = cursor
                .read_i16::<LittleEndian>()
                .map_err(|e| ClientError::AudioDecode(e.to_string()))?;
            plane.push(sample as f32 / 32768.0);
        }
    }

    Ok(AudioBuffer::new(sample_rate, planes))
}

/// Turn inbound bytes into a playable buffer.
///
/// Raw PCM is unpacked here; anything else goes to the host decoder. Callers
/// drop the chunk on error rather than propagating it.
pub fn decode_audio_data(
    bytes: &[u8],
    format: &AudioFormat,
    decoder: &dyn NativeDecoder,
) -> ClientResult<AudioBuffer> {
    if format.is_raw_pcm() {
        decode_pcm16(bytes, format.sample_rate, format.channels)
    } else {
        let buffer = decoder.decode_compressed(bytes, &format.mime_type)?;
        if buffer.frames() == 0 {
            return Err(ClientError::AudioDecode(format!(
                "native decoder produced no samples for {}",
                format.mime_type
            )));
        }
        Ok(buffer)
    }
}
