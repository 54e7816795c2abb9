//! WAV assembly for dispatched utterances and archived chunks.

use bytes::{BufMut, Bytes, BytesMut};

use crate::protocol_constants::{BITS_PER_SAMPLE, CHANNELS, SAMPLE_RATE, WAV_HEADER_LEN};

/// Generates the standard 44-byte WAVE header for 16 kHz / 16-bit / mono LPCM.
///
/// Only the two size fields depend on the payload; everything else is
/// constant for the gateway's fixed audio format.
#[must_use]
pub fn wav_header(data_size: u32) -> Bytes {
    let mut header = BytesMut::with_capacity(WAV_HEADER_LEN);

    let bytes_per_sample = BITS_PER_SAMPLE / 8;
    let byte_rate = SAMPLE_RATE * CHANNELS as u32 * bytes_per_sample as u32;
    let block_align = CHANNELS * bytes_per_sample;

    // RIFF header
    header.put_slice(b"RIFF");
    header.put_u32_le(36 + data_size);
    header.put_slice(b"WAVE");

    // fmt chunk
    header.put_slice(b"fmt ");
    header.put_u32_le(16); // Chunk size
    header.put_u16_le(1); // Audio format (PCM)
    header.put_u16_le(CHANNELS);
    header.put_u32_le(SAMPLE_RATE);
    header.put_u32_le(byte_rate);
    header.put_u16_le(block_align);
    header.put_u16_le(BITS_PER_SAMPLE);

    // data chunk
    header.put_slice(b"data");
    header.put_u32_le(data_size);

    header.freeze()
}

/// Concatenates PCM segments behind a WAV header.
///
/// Segments are assumed to already be native little-endian 16-bit samples;
/// no conversion or validation happens here.
#[must_use]
pub fn assemble_wav(segments: &[Bytes]) -> Bytes {
    let data_size: usize = segments.iter().map(Bytes::len).sum();
    let mut wav = BytesMut::with_capacity(WAV_HEADER_LEN + data_size);
    wav.put_slice(&wav_header(data_size as u32));
    for segment in segments {
        wav.put_slice(segment);
    }
    wav.freeze()
}
