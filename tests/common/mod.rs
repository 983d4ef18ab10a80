//! Shared fixtures for the CLI tests.
//!
//! Media files are synthesized into a temporary directory so the tests do
//! not depend on downloaded samples.

use std::path::{Path, PathBuf};
use tempfile::TempDir;

/// A scratch directory holding generated media.
pub struct Fixtures {
    pub dir: TempDir,
}

impl Fixtures {
    pub fn new() -> Self {
        Self {
            dir: tempfile::tempdir().expect("failed to create fixture dir"),
        }
    }

    pub fn path(&self, name: &str) -> PathBuf {
        self.dir.path().join(name)
    }

    /// Stereo 16-bit WAV: left holds 16384, right alternates sign.
    pub fn stereo_wav(&self, name: &str, frames: u32) -> PathBuf {
        let path = self.path(name);
        write_wav(&path, 2, frames, |channel, i| match channel {
            0 => 16384,
            _ if i % 2 == 0 => 8192,
            _ => -8192,
        });
        path
    }

    /// RGBA card where pixel `(x, y)` is `[x * 16, y * 32, 99, 255]`.
    pub fn card_png(&self, name: &str, width: u32, height: u32) -> PathBuf {
        let path = self.path(name);
        let card = image::RgbaImage::from_fn(width, height, |x, y| {
            image::Rgba([(x * 16) as u8, (y * 32) as u8, 99, 255])
        });
        card.save(&path).expect("failed to write card");
        path
    }

    pub fn preferences(&self, json: &str) -> PathBuf {
        let path = self.path("prefs.json");
        std::fs::write(&path, json).expect("failed to write preferences");
        path
    }
}

pub fn write_wav(path: &Path, channels: u16, frames: u32, sample: impl Fn(u16, u32) -> i16) {
    let spec = hound::WavSpec {
        channels,
        sample_rate: 48000,
        bits_per_sample: 16,
        sample_format: hound::SampleFormat::Int,
    };
    let mut writer = hound::WavWriter::create(path, spec).expect("failed to create wav");
    for i in 0..frames {
        for channel in 0..channels {
            writer
                .write_sample(sample(channel, i))
                .expect("failed to write sample");
        }
    }
    writer.finalize().expect("failed to finalize wav");
}
