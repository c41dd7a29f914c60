//! Encoded audio clips handed to the analysis service.
//!
//! The recorder is a black box: whatever it produced is sent as-is.  WAV
//! files are probed with `hound` purely so the logs say what was sent.

use std::path::Path;

use anyhow::{Context, Result};
use base64::engine::general_purpose::STANDARD;
use base64::Engine;
use tracing::{debug, info};

/// An encoded audio blob plus the label it is submitted under.
#[derive(Debug, Clone)]
pub struct AudioClip {
    pub filename: String,
    pub bytes: Vec<u8>,
}

/// Stream parameters of a probed WAV clip.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct WavInfo {
    pub sample_rate: u32,
    pub channels: u16,
    pub duration_secs: f64,
}

impl AudioClip {
    /// Read a clip from disk.  Empty files are rejected.
    pub fn load(path: &Path) -> Result<Self> {
        let bytes =
            std::fs::read(path).with_context(|| format!("Cannot read {}", path.display()))?;
        if bytes.is_empty() {
            anyhow::bail!("Audio file is empty: {}", path.display());
        }

        let filename = path
            .file_name()
            .unwrap_or_default()
            .to_string_lossy()
            .to_string();

        let clip = AudioClip { filename, bytes };
        match clip.probe_wav() {
            Some(info) => info!(
                "Loaded {} ({} bytes, {} Hz, {} ch, {:.1}s)",
                clip.filename,
                clip.bytes.len(),
                info.sample_rate,
                info.channels,
                info.duration_secs
            ),
            None => info!("Loaded {} ({} bytes)", clip.filename, clip.bytes.len()),
        }
        Ok(clip)
    }

    /// Sample rate, channels and duration when the blob is a readable WAV.
    pub fn probe_wav(&self) -> Option<WavInfo> {
        let reader = match hound::WavReader::new(std::io::Cursor::new(&self.bytes)) {
            Ok(r) => r,
            Err(e) => {
                debug!("{} is not a WAV clip: {e}", self.filename);
                return None;
            }
        };
        let spec = reader.spec();
        let duration_secs = if spec.sample_rate == 0 {
            0.0
        } else {
            reader.duration() as f64 / spec.sample_rate as f64
        };
        Some(WavInfo {
            sample_rate: spec.sample_rate,
            channels: spec.channels,
            duration_secs,
        })
    }

    /// Base64 payload for the `audio` field.
    pub fn encode(&self) -> String {
        encode_payload(&self.bytes)
    }
}

/// Base64-encode (standard alphabet, padded) an audio blob.
pub fn encode_payload(bytes: &[u8]) -> String {
    STANDARD.encode(bytes)
}
