//! 16-bit mono WAV encoding for emitted audio.
use std::io::Cursor;
use std::path::Path;

use anyhow::Context;
use base64::Engine as _;

const I16_MAX_F32: f32 = i16::MAX as f32;

/// Convert float samples to 16-bit PCM, peak-normalising when any sample
/// exceeds full scale.
pub fn to_pcm16(samples: &[f32]) -> Vec<i16> {
    let peak = samples.iter().fold(0.0f32, |acc, s| acc.max(s.abs()));
    let scale = if peak > 1.0 { I16_MAX_F32 / peak } else { I16_MAX_F32 };
    samples
        .iter()
        .map(|&s| (s * scale).clamp(-I16_MAX_F32, I16_MAX_F32) as i16)
        .collect()
}

fn wav_spec(sample_rate: u32) -> hound::WavSpec {
    hound::WavSpec {
        channels: 1,
        sample_rate,
        bits_per_sample: 16,
        sample_format: hound::SampleFormat::Int,
    }
}

/// Encode samples as an in-memory RIFF/WAV file.
pub fn encode_wav_bytes(samples: &[f32], sample_rate: u32) -> anyhow::Result<Vec<u8>> {
    // WAV header (44 bytes) + 2 bytes per sample
    let mut cursor = Cursor::new(Vec::<u8>::with_capacity(44 + samples.len() * 2));
    {
        let mut writer = hound::WavWriter::new(&mut cursor, wav_spec(sample_rate))
            .map_err(|e| anyhow::anyhow!("wav write err: {e}"))?;
        for v in to_pcm16(samples) {
            writer
                .write_sample(v)
                .map_err(|e| anyhow::anyhow!("wav sample err: {e}"))?;
        }
        writer
            .finalize()
            .map_err(|e| anyhow::anyhow!("wav finalize err: {e}"))?;
    }
    Ok(cursor.into_inner())
}

/// Convenience: WAV file as base64, for JSON and WebSocket payloads.
pub fn encode_wav_base64(samples: &[f32], sample_rate: u32) -> anyhow::Result<String> {
    let bytes = encode_wav_bytes(samples, sample_rate)?;
    Ok(base64::engine::general_purpose::STANDARD.encode(bytes))
}

pub fn write_wav<P: AsRef<Path>>(path: P, samples: &[f32], sample_rate: u32) -> anyhow::Result<()> {
    let path = path.as_ref();
    let mut writer = hound::WavWriter::create(path, wav_spec(sample_rate))
        .with_context(|| format!("Failed to create {}", path.display()))?;
    for v in to_pcm16(samples) {
        writer.write_sample(v)?;
    }
    writer
        .finalize()
        .with_context(|| format!("Failed to finalize {}", path.display()))?;
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_pcm16_scaling() {
        assert_eq!(to_pcm16(&[0.0, 1.0, -1.0, 0.5]), vec![0, 32767, -32767, 16383]);
        // Over full scale: normalised by the peak.
        assert_eq!(to_pcm16(&[2.0, -1.0]), vec![32767, -16383]);
    }

    #[test]
    fn test_encode_wav_bytes_header() {
        let bytes = encode_wav_bytes(&[0.0; 100], 24_000).unwrap();
        assert_eq!(&bytes[0..4], b"RIFF");
        assert_eq!(&bytes[8..12], b"WAVE");
        assert_eq!(bytes.len(), 44 + 200);

        let reader = hound::WavReader::new(Cursor::new(bytes)).unwrap();
        assert_eq!(reader.spec().sample_rate, 24_000);
        assert_eq!(reader.spec().channels, 1);
        assert_eq!(reader.len(), 100);
    }

    #[test]
    fn test_encode_base64_not_empty() {
        let encoded = encode_wav_base64(&[0.25; 10], 16_000).unwrap();
        assert!(encoded.starts_with("UklGR")); // "RIFF"
    }
}
