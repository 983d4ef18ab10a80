//! Editor preferences consumed by the file layer.
//!
//! [`Preferences`] is deserialized from JSON. Every section defaults
//! sensibly so a completely empty `{}` file is valid. The tunable seek
//! constants live in [`SeekPolicy`] rather than being baked into the
//! decoder.

use serde::{Deserialize, Serialize};
use std::path::Path;

use crate::error::Result;
use crate::Error;

// ---------------------------------------------------------------------------
// Top-level Preferences
// ---------------------------------------------------------------------------

/// Root preferences object handed to `MediaFile::open_file`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct Preferences {
    /// Worker threads a backend may use for decoding.
    pub processors: usize,
    /// Prefer hardware decoders when the backend offers them.
    pub hardware_decode: bool,
    pub cache: CacheConfig,
    pub toc: TocConfig,
    pub seek: SeekPolicy,
    pub isolation: IsolationConfig,
    pub raw: RawConfig,
}

impl Default for Preferences {
    fn default() -> Self {
        Self {
            processors: num_cpus::get(),
            hardware_decode: false,
            cache: CacheConfig::default(),
            toc: TocConfig::default(),
            seek: SeekPolicy::default(),
            isolation: IsolationConfig::default(),
            raw: RawConfig::default(),
        }
    }
}

impl Preferences {
    /// Deserialize `Preferences` from a JSON string.
    pub fn from_json(json_str: &str) -> Result<Self> {
        serde_json::from_str(json_str)
            .map_err(|e| Error::Validation(format!("preferences parse error: {e}")))
    }

    /// Load preferences from a file path, falling back to defaults if the
    /// path is `None` or the file does not exist.
    pub fn load_or_default(path: Option<&Path>) -> Self {
        let Some(path) = path else {
            return Self::default();
        };

        match std::fs::read_to_string(path) {
            Ok(contents) => Self::from_json(&contents).unwrap_or_else(|e| {
                tracing::warn!("Failed to parse preferences {}: {e}", path.display());
                Self::default()
            }),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => {
                tracing::info!("No preferences at {}; using defaults", path.display());
                Self::default()
            }
            Err(e) => {
                tracing::warn!("Failed to read preferences {}: {e}", path.display());
                Self::default()
            }
        }
    }

    /// Return a list of validation warnings (non-fatal issues).
    pub fn validate(&self) -> Vec<String> {
        let mut warnings = Vec::new();

        if self.processors == 0 {
            warnings.push("processors is 0; decoding will use a single thread".into());
        }
        if self.cache.cache_size < crate::MIN_CACHEITEM_SIZE {
            warnings.push(format!(
                "cache.cache_size {} is below the minimum item size {}",
                self.cache.cache_size,
                crate::MIN_CACHEITEM_SIZE
            ));
        }
        if self.toc.index_bytes < 1024 {
            warnings.push("toc.index_bytes is too small for a usable waveform index".into());
        }
        if self.seek.keyframe_rewind == 0 || self.seek.vp9_keyframe_rewind == 0 {
            warnings.push("seek keyframe rewind counts below 1 are treated as 1".into());
        }
        if self.seek.seek_threshold < 1 {
            warnings.push("seek.seek_threshold below 1 forces a seek on every read".into());
        }
        if self.seek.history_max < 4096 {
            warnings.push("seek.history_max is very small; audio re-reads will re-decode".into());
        }
        if self.isolation.read_timeout_ms == 0 {
            warnings.push("isolation.read_timeout_ms is 0; using 1000".into());
        }

        warnings
    }
}

// ---------------------------------------------------------------------------
// Sections
// ---------------------------------------------------------------------------

/// Frame cache budget.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct CacheConfig {
    /// Bytes the frame cache may hold before evicting.
    pub cache_size: usize,
    /// Cache decoded frames at all.
    pub cache_frames: bool,
}

impl Default for CacheConfig {
    fn default() -> Self {
        Self {
            cache_size: 64 * 1024 * 1024,
            cache_frames: true,
        }
    }
}

/// Table-of-contents creation.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct TocConfig {
    /// Write sidecar tables of contents. When false, files that need one
    /// are opened sequential-only.
    pub enabled: bool,
    /// Build a table of contents for every container, not only the ones
    /// whose native index is unreliable.
    pub always: bool,
    /// Byte budget for the coarse waveform index of each audio stream.
    pub index_bytes: usize,
}

impl Default for TocConfig {
    fn default() -> Self {
        Self {
            enabled: true,
            always: false,
            index_bytes: 0x30_0000,
        }
    }
}

/// Seek heuristics for the demux backend.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct SeekPolicy {
    /// Frames a request may lie ahead of the decoder before seeking.
    pub seek_threshold: i64,
    /// Keyframes to rewind before a video target.
    pub keyframe_rewind: usize,
    /// Keyframe rewind for VP9, whose decoder settles faster.
    pub vp9_keyframe_rewind: usize,
    /// Seconds of audio decoded ahead of an audio seek target.
    pub audio_rewind_seconds: f64,
    /// Capacity of the per-stream PCM history in samples.
    pub history_max: usize,
}

impl Default for SeekPolicy {
    fn default() -> Self {
        Self {
            seek_threshold: 16,
            keyframe_rewind: 2,
            vp9_keyframe_rewind: 1,
            audio_rewind_seconds: 0.25,
            history_max: 0x10_0000,
        }
    }
}

impl SeekPolicy {
    /// Keyframe rewind for a video codec name, never below 1.
    pub fn rewind_for(&self, codec: &str) -> usize {
        let rewind = if codec.eq_ignore_ascii_case("vp9") {
            self.vp9_keyframe_rewind
        } else {
            self.keyframe_rewind
        };
        rewind.max(1)
    }
}

/// Out-of-process decoding.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct IsolationConfig {
    /// Run decoders in worker processes.
    pub enabled: bool,
    /// Spawn workers from a dedicated pool process instead of the editor.
    pub use_pool: bool,
    /// Poll interval while waiting on a worker, in milliseconds.
    pub read_timeout_ms: u64,
}

impl Default for IsolationConfig {
    fn default() -> Self {
        Self {
            enabled: true,
            use_pool: true,
            read_timeout_ms: 1000,
        }
    }
}

/// Camera raw decode flags, forwarded to backends that understand them.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct RawConfig {
    pub interpolate: bool,
    pub white_balance: bool,
}
