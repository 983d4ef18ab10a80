//! The [`Asset`] value object describing one media file.
//!
//! An asset is owned by the caller; `MediaFile` keeps a private copy and
//! writes lengths and stream metadata back once a backend has opened the
//! file. Assets cross the worker boundary as a flat key/value table
//! ([`Asset::to_table`]) and as XML ([`Asset::to_xml`]) when a receiver
//! needs to compare two assets.

use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::fmt;
use std::path::PathBuf;
use std::str::FromStr;

use crate::error::{Error, Result};

/// `video_length` of a stream that can only be read sequentially.
pub const NOSEEK_LENGTH: i64 = i64::MAX;

/// `video_length` of a still image; every frame position shows the same picture.
pub const STILL_PHOTO_LENGTH: i64 = -1;

// ---------------------------------------------------------------------------
// FileFormat
// ---------------------------------------------------------------------------

/// Container format identifiers understood by the decoder registry.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum FileFormat {
    /// Not yet determined; `open_file` sniffs the header.
    #[default]
    Unknown,
    Wav,
    Png,
    Jpeg,
    /// Anything demuxed through FFmpeg (MKV, MP4, AVI, raw elementary streams).
    Ffmpeg,
}

impl FileFormat {
    /// Stable lowercase name used in key/value tables.
    pub fn as_str(&self) -> &'static str {
        match self {
            FileFormat::Unknown => "unknown",
            FileFormat::Wav => "wav",
            FileFormat::Png => "png",
            FileFormat::Jpeg => "jpeg",
            FileFormat::Ffmpeg => "ffmpeg",
        }
    }
}

impl fmt::Display for FileFormat {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for FileFormat {
    type Err = Error;

    fn from_str(s: &str) -> Result<Self> {
        match s.to_ascii_lowercase().as_str() {
            "unknown" | "" => Ok(FileFormat::Unknown),
            "wav" => Ok(FileFormat::Wav),
            "png" => Ok(FileFormat::Png),
            "jpeg" | "jpg" => Ok(FileFormat::Jpeg),
            "ffmpeg" => Ok(FileFormat::Ffmpeg),
            other => Err(Error::Validation(format!("unknown file format '{other}'"))),
        }
    }
}

// ---------------------------------------------------------------------------
// Asset
// ---------------------------------------------------------------------------

/// Format metadata for one media file.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct Asset {
    pub path: PathBuf,
    pub format: FileFormat,
    /// Demuxer name reported by the backend (e.g. `matroska,webm`).
    pub container: String,

    pub audio_data: bool,
    /// Total channels across every audio stream.
    pub channels: i32,
    pub sample_rate: i32,
    pub bits: i32,
    pub audio_codec: String,
    /// Samples per channel.
    pub audio_length: i64,

    pub video_data: bool,
    pub layers: i32,
    pub width: i32,
    pub height: i32,
    pub frame_rate: f64,
    /// Display aspect ratio, derived from the sample aspect ratio.
    pub aspect_ratio: f64,
    pub video_codec: String,
    /// Frames; may be [`NOSEEK_LENGTH`] or [`STILL_PHOTO_LENGTH`].
    pub video_length: i64,
}

impl Default for Asset {
    fn default() -> Self {
        Self {
            path: PathBuf::new(),
            format: FileFormat::Unknown,
            container: String::new(),
            audio_data: false,
            channels: 0,
            sample_rate: 0,
            bits: 0,
            audio_codec: String::new(),
            audio_length: 0,
            video_data: false,
            layers: 0,
            width: 0,
            height: 0,
            frame_rate: 0.0,
            aspect_ratio: 0.0,
            video_codec: String::new(),
            video_length: 0,
        }
    }
}

impl Asset {
    /// An asset for `path` with every other field unknown.
    pub fn new(path: impl Into<PathBuf>) -> Self {
        Self {
            path: path.into(),
            ..Self::default()
        }
    }

    pub fn is_still(&self) -> bool {
        self.video_data && self.video_length == STILL_PHOTO_LENGTH
    }

    /// Whether random video access is possible.
    pub fn is_seekable(&self) -> bool {
        self.video_length != NOSEEK_LENGTH
    }

    /// Flatten into the key/value table used by the `OPEN_FILE` opcode.
    pub fn to_table(&self) -> BTreeMap<String, String> {
        let mut table = BTreeMap::new();
        let mut put = |key: &str, value: String| {
            table.insert(key.to_string(), value);
        };
        put("PATH", self.path.to_string_lossy().into_owned());
        put("FORMAT", self.format.as_str().to_string());
        put("CONTAINER", self.container.clone());
        put("AUDIO", bool_str(self.audio_data));
        put("CHANNELS", self.channels.to_string());
        put("SAMPLE_RATE", self.sample_rate.to_string());
        put("BITS", self.bits.to_string());
        put("AUDIO_CODEC", self.audio_codec.clone());
        put("AUDIO_LENGTH", self.audio_length.to_string());
        put("VIDEO", bool_str(self.video_data));
        put("LAYERS", self.layers.to_string());
        put("WIDTH", self.width.to_string());
        put("HEIGHT", self.height.to_string());
        put("FRAMERATE", self.frame_rate.to_string());
        put("ASPECTRATIO", self.aspect_ratio.to_string());
        put("VIDEO_CODEC", self.video_codec.clone());
        put("VIDEO_LENGTH", self.video_length.to_string());
        table
    }

    /// Rebuild an asset from [`Asset::to_table`] output.
    ///
    /// Missing keys keep their defaults; malformed values are rejected.
    pub fn from_table(table: &BTreeMap<String, String>) -> Result<Self> {
        let mut asset = Asset::default();
        for (key, value) in table {
            match key.as_str() {
                "PATH" => asset.path = PathBuf::from(value),
                "FORMAT" => asset.format = value.parse()?,
                "CONTAINER" => asset.container = value.clone(),
                "AUDIO" => asset.audio_data = parse_field(key, value)?,
                "CHANNELS" => asset.channels = parse_field(key, value)?,
                "SAMPLE_RATE" => asset.sample_rate = parse_field(key, value)?,
                "BITS" => asset.bits = parse_field(key, value)?,
                "AUDIO_CODEC" => asset.audio_codec = value.clone(),
                "AUDIO_LENGTH" => asset.audio_length = parse_field(key, value)?,
                "VIDEO" => asset.video_data = parse_field(key, value)?,
                "LAYERS" => asset.layers = parse_field(key, value)?,
                "WIDTH" => asset.width = parse_field(key, value)?,
                "HEIGHT" => asset.height = parse_field(key, value)?,
                "FRAMERATE" => asset.frame_rate = parse_field(key, value)?,
                "ASPECTRATIO" => asset.aspect_ratio = parse_field(key, value)?,
                "VIDEO_CODEC" => asset.video_codec = value.clone(),
                "VIDEO_LENGTH" => asset.video_length = parse_field(key, value)?,
                other => tracing::debug!("ignoring unknown asset key {other}"),
            }
        }
        Ok(asset)
    }

    /// Serialize as an `<Asset>` XML document.
    pub fn to_xml(&self) -> Result<String> {
        quick_xml::se::to_string(self)
            .map_err(|e| Error::Validation(format!("asset XML serialization failed: {e}")))
    }

    /// Parse an `<Asset>` XML document produced by [`Asset::to_xml`].
    pub fn from_xml(xml: &str) -> Result<Self> {
        quick_xml::de::from_str(xml)
            .map_err(|e| Error::Validation(format!("asset XML parse error: {e}")))
    }
}

fn bool_str(value: bool) -> String {
    if value { "1" } else { "0" }.to_string()
}

trait TableValue: Sized {
    fn parse_value(value: &str) -> Option<Self>;
}

impl TableValue for bool {
    fn parse_value(value: &str) -> Option<Self> {
        match value {
            "1" | "true" => Some(true),
            "0" | "false" => Some(false),
            _ => None,
        }
    }
}

macro_rules! table_value_from_str {
    ($($ty:ty),*) => {
        $(impl TableValue for $ty {
            fn parse_value(value: &str) -> Option<Self> {
                value.trim().parse().ok()
            }
        })*
    };
}

table_value_from_str!(i32, i64, f64);

fn parse_field<T: TableValue>(key: &str, value: &str) -> Result<T> {
    T::parse_value(value)
        .ok_or_else(|| Error::Validation(format!("asset key {key} has malformed value '{value}'")))
}
