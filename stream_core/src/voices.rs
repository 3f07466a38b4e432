//! Voice presets: reference recordings on disk, keyed by name.
//!
//! Sessions read an immutable snapshot of the registry; uploads build a new
//! map and swap it in, so a running session never sees a half-written
//! entry.
use std::collections::BTreeMap;
use std::fs;
use std::io::Cursor;
use std::path::{Path, PathBuf};
use std::sync::{Arc, Mutex, PoisonError, RwLock};

use serde::Serialize;
use thiserror::Error;
use rubato::{Resampler, SincFixedIn, SincInterpolationParameters, SincInterpolationType, WindowFunction};
use tracing::{debug, info, warn};

/// Extensions that can be decoded as reference audio.
pub const SUPPORTED_EXTENSIONS: &[&str] = &["wav"];
/// Audio formats that are recognised but not decodable; skipped on scan.
const UNDECODABLE_EXTENSIONS: &[&str] = &["mp3", "flac", "ogg", "m4a", "aac"];
pub const MIN_REFERENCE_SECS: f32 = 0.5;
pub const LONG_REFERENCE_SECS: f32 = 60.0;

const FORBIDDEN_NAME_CHARS: &[char] = &['<', '>', ':', '"', '/', '\\', '|', '?', '*'];

#[derive(Debug, Error)]
pub enum VoiceError {
    #[error("Voice name is empty")]
    EmptyName,
    #[error("Voice '{0}' already exists")]
    Duplicate(String),
    #[error("Unsupported audio format '{0}'; upload a .wav file")]
    UnsupportedFormat(String),
    #[error("Audio is too short ({0:.2}s); at least {MIN_REFERENCE_SECS}s is required")]
    TooShort(f32),
    #[error("Voice '{0}' not found")]
    NotFound(String),
    #[error("Invalid audio: {0}")]
    Decode(#[from] hound::Error),
    #[error("Audio file contains no samples")]
    EmptyAudio,
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct VoiceEntry {
    pub name: String,
    pub path: PathBuf,
}

pub type VoiceMap = BTreeMap<String, PathBuf>;

#[derive(Debug)]
pub struct VoiceRegistry {
    dir: PathBuf,
    voices: RwLock<Arc<VoiceMap>>,
    writer: Mutex<()>,
}

impl VoiceRegistry {
    /// Index every decodable audio file in `dir` by its file stem.
    pub fn scan<P: AsRef<Path>>(dir: P) -> Self {
        let dir = dir.as_ref().to_path_buf();
        let voices = scan_dir(&dir);
        if voices.is_empty() {
            warn!(dir = %dir.display(), "No voice files found");
        } else {
            info!(dir = %dir.display(), count = voices.len(), "Found voice files");
        }
        Self {
            dir,
            voices: RwLock::new(Arc::new(voices)),
            writer: Mutex::new(()),
        }
    }

    pub fn dir(&self) -> &Path {
        &self.dir
    }

    pub fn snapshot(&self) -> Arc<VoiceMap> {
        Arc::clone(&self.voices.read().unwrap_or_else(PoisonError::into_inner))
    }

    pub fn names(&self) -> Vec<String> {
        self.snapshot().keys().cloned().collect()
    }

    pub fn resolve(&self, name: &str) -> Option<VoiceEntry> {
        self.snapshot().get(name).map(|path| VoiceEntry {
            name: name.to_string(),
            path: path.clone(),
        })
    }

    /// Exact match, then case-insensitive partial match, then the first
    /// voice as a fallback.
    pub fn resolve_fuzzy(&self, name: &str) -> Option<VoiceEntry> {
        let voices = self.snapshot();
        if let Some(path) = voices.get(name) {
            return Some(VoiceEntry {
                name: name.to_string(),
                path: path.clone(),
            });
        }

        let wanted = name.to_lowercase();
        let partial = voices.iter().find(|(preset, _)| {
            let preset = preset.to_lowercase();
            preset.contains(&wanted) || wanted.contains(&preset)
        });
        let (found, path) = match partial {
            Some(hit) => hit,
            None => {
                let first = voices.iter().next()?;
                warn!("No voice preset found for '{name}', using default voice: {}", first.0);
                first
            }
        };
        Some(VoiceEntry {
            name: found.clone(),
            path: path.clone(),
        })
    }

    /// Store an uploaded recording and publish it under `name`.
    pub fn register(&self, name: &str, file_name: &str, bytes: &[u8]) -> Result<VoiceEntry, VoiceError> {
        let _writer = self.writer.lock().unwrap_or_else(PoisonError::into_inner);

        let name = sanitize_name(name);
        if name.is_empty() {
            return Err(VoiceError::EmptyName);
        }
        let ext = extension_of(Path::new(file_name)).unwrap_or_default();
        if !SUPPORTED_EXTENSIONS.contains(&ext.as_str()) {
            return Err(VoiceError::UnsupportedFormat(ext));
        }
        if self.snapshot().contains_key(&name) {
            return Err(VoiceError::Duplicate(name));
        }

        let secs = wav_duration_secs(bytes)?;
        if secs < MIN_REFERENCE_SECS {
            return Err(VoiceError::TooShort(secs));
        }
        if secs > LONG_REFERENCE_SECS {
            warn!(voice = %name, "Reference audio is long ({secs:.1}s); consider a shorter clip");
        }

        fs::create_dir_all(&self.dir)?;
        let path = self.dir.join(format!("{name}.{ext}"));
        if path.exists() {
            return Err(VoiceError::Duplicate(name));
        }
        fs::write(&path, bytes)?;
        if let Err(e) = load_reference(&path, None) {
            let _ = fs::remove_file(&path);
            return Err(e);
        }

        let mut next = (*self.snapshot()).clone();
        next.insert(name.clone(), path.clone());
        *self.voices.write().unwrap_or_else(PoisonError::into_inner) = Arc::new(next);
        info!(voice = %name, secs, "Registered voice");

        Ok(VoiceEntry { name, path })
    }
}

fn scan_dir(dir: &Path) -> VoiceMap {
    let mut voices = VoiceMap::new();
    let entries = match fs::read_dir(dir) {
        Ok(entries) => entries,
        Err(e) => {
            warn!(dir = %dir.display(), "Voices directory not readable: {e}");
            return voices;
        }
    };
    for path in entries.filter_map(Result::ok).map(|e| e.path()) {
        if !path.is_file() {
            continue;
        }
        let Some(ext) = extension_of(&path) else {
            continue;
        };
        if UNDECODABLE_EXTENSIONS.contains(&ext.as_str()) {
            warn!(file = %path.display(), "Skipping voice preset: only .wav files can be decoded");
            continue;
        }
        if !SUPPORTED_EXTENSIONS.contains(&ext.as_str()) {
            continue;
        }
        if let Some(stem) = path.file_stem().and_then(|s| s.to_str()) {
            voices.insert(stem.to_string(), path.clone());
        }
    }
    voices
}

fn extension_of(path: &Path) -> Option<String> {
    path.extension()
        .and_then(|e| e.to_str())
        .map(str::to_ascii_lowercase)
}

/// Strip characters that are unsafe in file names.
pub fn sanitize_name(name: &str) -> String {
    name.chars()
        .filter(|c| !FORBIDDEN_NAME_CHARS.contains(c) && !c.is_control())
        .collect::<String>()
        .trim()
        .to_string()
}

fn wav_duration_secs(bytes: &[u8]) -> Result<f32, VoiceError> {
    let reader = hound::WavReader::new(Cursor::new(bytes))?;
    let spec = reader.spec();
    if spec.sample_rate == 0 || spec.channels == 0 {
        return Err(VoiceError::EmptyAudio);
    }
    Ok(reader.duration() as f32 / spec.sample_rate as f32)
}

/// Decode a reference recording to mono f32, resampled to `target_rate`
/// when given.
pub fn load_reference<P: AsRef<Path>>(path: P, target_rate: Option<u32>) -> Result<Vec<f32>, VoiceError> {
    let path = path.as_ref();
    let ext = extension_of(path).unwrap_or_default();
    if ext != "wav" {
        return Err(VoiceError::UnsupportedFormat(ext));
    }
    let mut reader = hound::WavReader::open(path)?;
    let spec = reader.spec();
    let channels = spec.channels.max(1) as usize;

    let interleaved: Vec<f32> = match spec.sample_format {
        hound::SampleFormat::Float => reader.samples::<f32>().collect::<Result<_, _>>()?,
        hound::SampleFormat::Int => {
            let scale = (1i64 << (spec.bits_per_sample.saturating_sub(1))) as f32;
            reader
                .samples::<i32>()
                .map(|s| s.map(|v| v as f32 / scale))
                .collect::<Result<_, _>>()?
        }
    };

    let mono: Vec<f32> = interleaved
        .chunks(channels)
        .map(|frame| frame.iter().sum::<f32>() / frame.len() as f32)
        .collect();
    if mono.is_empty() {
        return Err(VoiceError::EmptyAudio);
    }

    Ok(match target_rate {
        Some(rate) if rate != spec.sample_rate => resample(&mono, spec.sample_rate, rate),
        _ => mono,
    })
}

/// Resample with windowed sinc interpolation. The output is trimmed or
/// padded to exactly `len * to_rate / from_rate` samples. Falls back to
/// linear interpolation if the sinc resampler cannot be built or run.
pub fn resample(samples: &[f32], from_rate: u32, to_rate: u32) -> Vec<f32> {
    if samples.is_empty() || from_rate == 0 || to_rate == 0 || from_rate == to_rate {
        return samples.to_vec();
    }
    let ratio = to_rate as f64 / from_rate as f64;
    let expected = ((samples.len() as f64) * ratio).round().max(1.0) as usize;

    let params = SincInterpolationParameters {
        sinc_len: 128,
        f_cutoff: 0.95,
        interpolation: SincInterpolationType::Cubic,
        oversampling_factor: 128,
        window: WindowFunction::BlackmanHarris2,
    };
    let mut resampler = match SincFixedIn::<f32>::new(ratio, 1.0, params, samples.len(), 1) {
        Ok(resampler) => resampler,
        Err(e) => {
            warn!("Failed to create sinc resampler: {e}. Falling back to linear.");
            return resample_linear(samples, from_rate, to_rate);
        }
    };

    match resampler.process(&[samples.to_vec()], None) {
        Ok(mut output) if !output.is_empty() => {
            let mut resampled = output.swap_remove(0);
            debug!(from_rate, to_rate, produced = resampled.len(), expected, "Resampled reference audio");
            resampled.resize(expected, 0.0);
            resampled
        }
        Ok(_) => resample_linear(samples, from_rate, to_rate),
        Err(e) => {
            warn!("Sinc resampling failed: {e}. Falling back to linear.");
            resample_linear(samples, from_rate, to_rate)
        }
    }
}

/// Linear interpolation resampler.
pub fn resample_linear(samples: &[f32], from_rate: u32, to_rate: u32) -> Vec<f32> {
    if samples.is_empty() || from_rate == 0 || to_rate == 0 || from_rate == to_rate {
        return samples.to_vec();
    }
    let ratio = from_rate as f64 / to_rate as f64;
    let out_len = ((samples.len() as f64) / ratio).round().max(1.0) as usize;
    let last = samples.len() - 1;
    (0..out_len)
        .map(|i| {
            let pos = i as f64 * ratio;
            let idx = (pos.floor() as usize).min(last);
            let next = (idx + 1).min(last);
            let frac = (pos - idx as f64) as f32;
            samples[idx] * (1.0 - frac) + samples[next] * frac
        })
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::wav::encode_wav_bytes;

    fn wav_of_secs(secs: f32, rate: u32) -> Vec<u8> {
        let n = (secs * rate as f32) as usize;
        encode_wav_bytes(&vec![0.1f32; n], rate).unwrap()
    }

    #[test]
    fn test_scan_filters_and_sorts() {
        let dir = tempfile::tempdir().unwrap();
        fs::write(dir.path().join("zed.wav"), wav_of_secs(1.0, 8000)).unwrap();
        fs::write(dir.path().join("alice.WAV"), wav_of_secs(1.0, 8000)).unwrap();
        fs::write(dir.path().join("bob.mp3"), b"ID3").unwrap();
        fs::write(dir.path().join("notes.txt"), b"x").unwrap();
        fs::create_dir(dir.path().join("sub.wav")).unwrap();

        let registry = VoiceRegistry::scan(dir.path());
        assert_eq!(registry.names(), vec!["alice".to_string(), "zed".to_string()]);
        // Every listed voice can be loaded.
        for path in registry.snapshot().values() {
            assert!(load_reference(path, Some(24_000)).is_ok());
        }
    }

    #[test]
    fn test_scan_missing_dir_is_empty() {
        let registry = VoiceRegistry::scan("/nonexistent/voices");
        assert!(registry.snapshot().is_empty());
        assert!(registry.resolve_fuzzy("anyone").is_none());
    }

    #[test]
    fn test_register_publishes_new_snapshot() {
        let dir = tempfile::tempdir().unwrap();
        let registry = VoiceRegistry::scan(dir.path());
        let before = registry.snapshot();

        let entry = registry.register(" new/voice? ", "clip.WAV", &wav_of_secs(1.0, 8000)).unwrap();
        assert_eq!(entry.name, "newvoice");
        assert!(entry.path.exists());

        // Earlier snapshots are unaffected.
        assert!(before.is_empty());
        assert_eq!(registry.resolve("newvoice"), Some(entry));
    }

    #[test]
    fn test_register_rejections() {
        let dir = tempfile::tempdir().unwrap();
        let registry = VoiceRegistry::scan(dir.path());
        let ok = wav_of_secs(1.0, 8000);

        assert!(matches!(registry.register("??", "a.wav", &ok), Err(VoiceError::EmptyName)));
        assert!(matches!(
            registry.register("a", "a.m4a", &ok),
            Err(VoiceError::UnsupportedFormat(ext)) if ext == "m4a"
        ));
        assert!(matches!(
            registry.register("short", "s.wav", &wav_of_secs(0.2, 8000)),
            Err(VoiceError::TooShort(_))
        ));
        assert!(matches!(registry.register("junk", "j.wav", b"not a wav"), Err(VoiceError::Decode(_))));

        registry.register("dup", "d.wav", &ok).unwrap();
        assert!(matches!(registry.register("dup", "d.wav", &ok), Err(VoiceError::Duplicate(_))));
        assert_eq!(registry.names(), vec!["dup".to_string()]);
        assert!(!dir.path().join("short.wav").exists());
    }

    #[test]
    fn test_resolve_fuzzy() {
        let dir = tempfile::tempdir().unwrap();
        for name in ["en-Alice_woman", "en-Carter_man"] {
            fs::write(dir.path().join(format!("{name}.wav")), wav_of_secs(1.0, 8000)).unwrap();
        }
        let registry = VoiceRegistry::scan(dir.path());

        assert_eq!(registry.resolve_fuzzy("en-Carter_man").unwrap().name, "en-Carter_man");
        assert_eq!(registry.resolve_fuzzy("carter").unwrap().name, "en-Carter_man");
        assert_eq!(registry.resolve_fuzzy("Bob").unwrap().name, "en-Alice_woman");
        assert!(registry.resolve("carter").is_none());
    }

    #[test]
    fn test_load_reference_mixes_and_resamples() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("stereo.wav");
        let spec = hound::WavSpec {
            channels: 2,
            sample_rate: 12_000,
            bits_per_sample: 16,
            sample_format: hound::SampleFormat::Int,
        };
        let mut writer = hound::WavWriter::create(&path, spec).unwrap();
        for _ in 0..1200 {
            writer.write_sample(16384i16).unwrap();
            writer.write_sample(0i16).unwrap();
        }
        writer.finalize().unwrap();

        let mono = load_reference(&path, None).unwrap();
        assert_eq!(mono.len(), 1200);
        assert!((mono[0] - 0.25).abs() < 1e-3);

        let resampled = load_reference(&path, Some(24_000)).unwrap();
        assert_eq!(resampled.len(), 2400);
    }

    #[test]
    fn test_resample_keeps_steady_level() {
        let input = vec![0.5f32; 8000];
        let output = resample(&input, 8000, 24_000);
        assert_eq!(output.len(), 24_000);
        // Away from the filter edges a constant signal stays constant.
        let mid = &output[4000..20_000];
        assert!(mid.iter().all(|s| (s - 0.5).abs() < 0.02));
        assert_eq!(resample(&input, 8000, 8000), input);
    }

    #[test]
    fn test_resample_linear_lengths() {
        assert_eq!(resample_linear(&[0.0, 1.0], 1, 2).len(), 4);
        assert!(resample_linear(&[], 8000, 16_000).is_empty());
    }

    #[test]
    fn test_sanitize_name() {
        assert_eq!(sanitize_name("  a<b>c:d\"e/f\\g|h?i*j  "), "abcdefghij");
    }
}
