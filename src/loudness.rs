//! Peak level and integrated loudness of rendered previews.
//!
//! Measurements run on WAV files (the preview format) and are cached per
//! file path. Staged overrides get fresh file names, so a cached value never
//! outlives the bytes it was measured on as long as rendered previews are
//! evicted when they are deleted.

use std::collections::HashMap;
use std::io::Read;
use std::path::{Path, PathBuf};

use bs1770::{ChannelLoudnessMeter, Power, Windows100ms};
use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use tracing::debug;

/// Errors from reading a WAV file for measurement.
#[derive(Debug, thiserror::Error)]
pub enum LoudnessError {
    /// File could not be opened or decoded.
    #[error("Failed to read wav: {0}")]
    Wav(#[from] hound::Error),
    /// Sample layout the meter does not handle.
    #[error("Unsupported wav format: {0}")]
    UnsupportedFormat(String),
}

/// Level summary of one audio file.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct LoudnessInfo {
    /// Highest absolute sample over all channels, in dBFS.
    /// Negative infinity for digital silence.
    pub peak_db: f32,
    /// Gated integrated loudness (ITU-R BS.1770), in LUFS. `None` when
    /// nothing passes the absolute gate or the file is too short.
    pub lufs: Option<f32>,
}

/// Measure a WAV file. Blocking; run it off the async executor.
pub fn measure(path: &Path) -> Result<LoudnessInfo, LoudnessError> {
    let mut reader = hound::WavReader::open(path)?;
    let spec = reader.spec();
    let channels = read_channels(&mut reader)?;

    let info = LoudnessInfo {
        peak_db: peak_db(&channels),
        lufs: integrated_lufs(&channels, spec.sample_rate),
    };
    debug!(path = %path.display(), peak_db = info.peak_db, lufs = ?info.lufs, "Measured loudness");
    Ok(info)
}

/// De-interleave samples into per-channel `f32` in `[-1, 1]`.
fn read_channels<R: Read>(reader: &mut hound::WavReader<R>) -> Result<Vec<Vec<f32>>, LoudnessError> {
    let spec = reader.spec();
    let count = usize::from(spec.channels);
    if count == 0 {
        return Err(LoudnessError::UnsupportedFormat("zero channels".to_string()));
    }

    let samples: Vec<f32> = match (spec.sample_format, spec.bits_per_sample) {
        (hound::SampleFormat::Float, 32) => reader.samples::<f32>().collect::<Result<_, _>>()?,
        (hound::SampleFormat::Int, bits @ 8..=32) => {
            let scale = (1i64 << (bits - 1)) as f32;
            reader
                .samples::<i32>()
                .map(|s| s.map(|s| s as f32 / scale))
                .collect::<Result<_, _>>()?
        }
        (format, bits) => {
            return Err(LoudnessError::UnsupportedFormat(format!("{format:?} at {bits} bits")));
        }
    };

    let mut channels = vec![Vec::with_capacity(samples.len() / count); count];
    for (i, sample) in samples.into_iter().enumerate() {
        channels[i % count].push(sample);
    }
    Ok(channels)
}

fn peak_db(channels: &[Vec<f32>]) -> f32 {
    let peak = channels
        .iter()
        .flatten()
        .fold(0.0f32, |peak, sample| peak.max(sample.abs()));
    if peak > 0.0 {
        20.0 * peak.log10()
    } else {
        f32::NEG_INFINITY
    }
}

/// Channel weights for the usual layouts; LFE (4th of 6) is excluded.
fn channel_weight(channels: usize, index: usize) -> f32 {
    match (channels, index) {
        (4, 2 | 3) | (5, 3 | 4) | (6, 4 | 5) => 1.41,
        (6, 3) => 0.0,
        _ => 1.0,
    }
}

fn integrated_lufs(channels: &[Vec<f32>], sample_rate: u32) -> Option<f32> {
    let windows: Vec<Windows100ms<Vec<Power>>> = channels
        .iter()
        .map(|samples| {
            let mut meter = ChannelLoudnessMeter::new(sample_rate);
            meter.push(samples.iter().copied());
            meter.into_100ms_windows()
        })
        .collect();

    let len = windows.first()?.len();
    if windows.iter().any(|w| w.len() != len) {
        return None;
    }

    let mut total = vec![Power(0.0); len];
    for (index, channel) in windows.iter().enumerate() {
        let weight = channel_weight(channels.len(), index);
        for (sum, power) in total.iter_mut().zip(&channel.inner) {
            sum.0 += power.0 * weight;
        }
    }

    Some(bs1770::gated_mean(Windows100ms { inner: &total[..] }).loudness_lkfs())
}

/// Measurements keyed by file path.
#[derive(Debug, Default)]
pub struct LoudnessCache {
    entries: Mutex<HashMap<PathBuf, LoudnessInfo>>,
}

impl LoudnessCache {
    /// Create an empty cache.
    pub fn new() -> Self {
        Self::default()
    }

    /// Cached measurement of `path`.
    pub fn get(&self, path: &Path) -> Option<LoudnessInfo> {
        self.entries.lock().get(path).copied()
    }

    /// Record a measurement.
    pub fn insert(&self, path: impl Into<PathBuf>, info: LoudnessInfo) {
        self.entries.lock().insert(path.into(), info);
    }

    /// Forget one file.
    pub fn evict(&self, path: &Path) {
        self.entries.lock().remove(path);
    }

    /// Forget every file under `dir`.
    pub fn evict_under(&self, dir: &Path) {
        self.entries.lock().retain(|path, _| !path.starts_with(dir));
    }

    /// Snapshot of all measurements.
    pub fn snapshot(&self) -> HashMap<PathBuf, LoudnessInfo> {
        self.entries.lock().clone()
    }

    /// Number of cached files.
    pub fn len(&self) -> usize {
        self.entries.lock().len()
    }

    /// Whether nothing is cached.
    pub fn is_empty(&self) -> bool {
        self.entries.lock().is_empty()
    }
}

#[cfg(test)]
pub(crate) mod tests {
    use super::*;

    /// Write a 1 kHz sine of `amplitude` to every channel.
    pub(crate) fn write_sine(path: &Path, channels: u16, amplitude: f32, seconds: f32) {
        let spec = hound::WavSpec {
            channels,
            sample_rate: 48_000,
            bits_per_sample: 16,
            sample_format: hound::SampleFormat::Int,
        };
        let mut writer = hound::WavWriter::create(path, spec).unwrap();
        let frames = (48_000.0 * seconds) as usize;
        for n in 0..frames {
            let t = n as f32 / 48_000.0;
            let value = (amplitude * (2.0 * std::f32::consts::PI * 1000.0 * t).sin() * 32_768.0)
                .clamp(-32_768.0, 32_767.0) as i16;
            for _ in 0..channels {
                writer.write_sample(value).unwrap();
            }
        }
        writer.finalize().unwrap();
    }

    #[test]
    fn test_half_scale_stereo_sine() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("sine.wav");
        write_sine(&path, 2, 0.5, 2.0);

        let info = measure(&path).unwrap();
        assert!((info.peak_db - -6.02).abs() < 0.1, "peak {}", info.peak_db);
        let lufs = info.lufs.unwrap();
        // Two full-scale channels read 0 LUFS; half scale is 6 dB down
        assert!((lufs - -6.0).abs() < 1.0, "lufs {lufs}");
    }

    #[test]
    fn test_silence() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("silence.wav");
        write_sine(&path, 1, 0.0, 1.0);

        let info = measure(&path).unwrap();
        assert_eq!(info.peak_db, f32::NEG_INFINITY);
        assert!(info.lufs.is_none());
    }

    #[test]
    fn test_not_a_wav() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("garbage.wav");
        std::fs::write(&path, b"not riff data").unwrap();
        assert!(matches!(measure(&path), Err(LoudnessError::Wav(_))));

        let missing = dir.path().join("missing.wav");
        assert!(measure(&missing).is_err());
    }

    #[test]
    fn test_channel_weights() {
        assert_eq!(channel_weight(2, 1), 1.0);
        assert_eq!(channel_weight(6, 3), 0.0);
        assert_eq!(channel_weight(6, 5), 1.41);
        assert_eq!(channel_weight(5, 3), 1.41);
    }

    #[test]
    fn test_cache_eviction() {
        let cache = LoudnessCache::new();
        let info = LoudnessInfo {
            peak_db: -1.0,
            lufs: Some(-14.0),
        };
        cache.insert("/tmp/a/1.wav", info);
        cache.insert("/tmp/a/2.wav", info);
        cache.insert("/tmp/b/1.wav", info);

        cache.evict(Path::new("/tmp/a/1.wav"));
        assert!(cache.get(Path::new("/tmp/a/1.wav")).is_none());
        assert_eq!(cache.get(Path::new("/tmp/a/2.wav")), Some(info));

        cache.evict_under(Path::new("/tmp/a"));
        assert_eq!(cache.len(), 1);
        assert!(cache.snapshot().contains_key(Path::new("/tmp/b/1.wav")));
    }
}
