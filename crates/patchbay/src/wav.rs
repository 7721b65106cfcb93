//! WAV file loader
//!
//! Decodes with hound and deinterleaves into one `f32` vector per channel.
//! Integer formats are scaled to [-1, 1).

use std::io::Cursor;
use std::path::{Path, PathBuf};

use anyhow::{bail, Context, Result};
use async_trait::async_trait;

use crate::engine::{AudioFileLoader, RawAudio};

/// Decode a complete WAV file held in memory
pub fn decode_wav(data: &[u8]) -> Result<RawAudio> {
    let reader = hound::WavReader::new(Cursor::new(data)).context("failed to parse WAV header")?;

    let spec = reader.spec();
    let channels = spec.channels as usize;
    if channels == 0 {
        bail!("WAV header declares zero channels");
    }

    let interleaved: Vec<f32> = match spec.sample_format {
        hound::SampleFormat::Float => reader
            .into_samples::<f32>()
            .collect::<Result<Vec<_>, _>>()
            .context("failed to read float samples")?,
        hound::SampleFormat::Int => {
            let max_val = (1i64 << (spec.bits_per_sample - 1)) as f32;
            reader
                .into_samples::<i32>()
                .map(|s| s.map(|v| v as f32 / max_val))
                .collect::<Result<Vec<_>, _>>()
                .context("failed to read int samples")?
        }
    };

    let frames = interleaved.len() / channels;
    let mut data = vec![Vec::with_capacity(frames); channels];
    for frame in interleaved.chunks_exact(channels) {
        for (channel, sample) in data.iter_mut().zip(frame) {
            channel.push(*sample);
        }
    }

    Ok(RawAudio {
        sample_rate: spec.sample_rate,
        channels,
        frames,
        data,
    })
}

/// Loads WAV files from disk; relative paths resolve against `root`.
#[derive(Debug, Clone, Default)]
pub struct WavFileLoader {
    root: Option<PathBuf>,
}

impl WavFileLoader {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_root(root: impl Into<PathBuf>) -> Self {
        Self {
            root: Some(root.into()),
        }
    }

    fn resolve(&self, path: &str) -> PathBuf {
        let path = Path::new(path);
        match &self.root {
            Some(root) if path.is_relative() => root.join(path),
            _ => path.to_path_buf(),
        }
    }
}

#[async_trait]
impl AudioFileLoader for WavFileLoader {
    async fn load(&self, path: &str) -> Result<RawAudio> {
        let resolved = self.resolve(path);
        let bytes = tokio::fs::read(&resolved)
            .await
            .with_context(|| format!("failed to read {}", resolved.display()))?;
        tokio::task::spawn_blocking(move || decode_wav(&bytes))
            .await
            .context("WAV decode task panicked")?
            .with_context(|| format!("failed to decode {}", resolved.display()))
    }
}
