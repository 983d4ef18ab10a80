//! The interface every format backend implements.

use mf_core::{Asset, Error, Preferences, ProgressSink, Result};
use mf_media::{ColorModel, FrameCache, VideoFrame};

use crate::demux::WaveformIndex;
use crate::registry::BackendKind;

/// What a backend kind can do.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct Capabilities {
    pub read: bool,
    pub write: bool,
    pub audio: bool,
    pub video: bool,
    /// Wraps another container format rather than parsing its own.
    pub wrapper: bool,
}

impl Capabilities {
    /// Whether a file can be opened in the given mode.
    pub fn allows(&self, read: bool, write: bool) -> bool {
        (!read || self.read) && (!write || self.write)
    }
}

/// Arguments of [`DecoderBackend::open`].
pub struct OpenRequest<'a> {
    /// Filled in with stream metadata and lengths on success.
    pub asset: &'a mut Asset,
    pub prefs: &'a Preferences,
    pub read: bool,
    pub write: bool,
    pub progress: &'a mut dyn ProgressSink,
}

/// Arguments of [`DecoderBackend::read_frame`].
pub struct FrameRead<'a> {
    /// Destination; its color model is one the backend reported through
    /// [`DecoderBackend::colormodel_supported`].
    pub frame: &'a mut VideoFrame,
    pub position: i64,
    pub layer: i32,
    /// Frames decoded on the way to `position` may be stored here.
    pub cache: Option<&'a mut FrameCache>,
    pub frame_rate: f64,
}

/// A format-specific reader or writer.
///
/// Positions are passed with every read; `set_*_position` only lets a
/// backend prepare for a jump.
pub trait DecoderBackend: Send {
    fn kind(&self) -> BackendKind;

    fn open(&mut self, request: OpenRequest<'_>) -> Result<()>;

    /// Flush and release the file. Called once before drop.
    fn close(&mut self) -> Result<()> {
        Ok(())
    }

    /// The color model the backend decodes into when `requested` is asked
    /// for. The caller converts if it differs.
    fn colormodel_supported(&self, requested: ColorModel) -> ColorModel;

    fn set_video_position(&mut self, _position: i64) -> Result<()> {
        Ok(())
    }

    fn set_audio_position(&mut self, _position: i64) -> Result<()> {
        Ok(())
    }

    fn read_frame(&mut self, request: FrameRead<'_>) -> Result<()>;

    /// Fill `buffer` with samples of `channel` starting at `position`.
    fn read_samples(&mut self, buffer: &mut [f64], position: i64, channel: i32) -> Result<()>;

    /// Append samples, one slice per channel.
    fn write_samples(&mut self, _channels: &[&[f64]]) -> Result<()> {
        Err(Error::unsupported(format!("{} does not write audio", self.kind())))
    }

    fn write_frames(&mut self, _frames: &[&VideoFrame]) -> Result<()> {
        Err(Error::unsupported(format!("{} does not write video", self.kind())))
    }

    fn write_compressed_frame(&mut self, _frame: &VideoFrame) -> Result<()> {
        Err(Error::unsupported(format!(
            "{} does not write compressed frames",
            self.kind()
        )))
    }

    /// Whether compressed frames of `asset` can be copied into this file
    /// without re-encoding.
    fn can_copy_from(&self, _asset: &Asset, _position: i64, _width: i32, _height: i32) -> bool {
        false
    }

    /// Release internal buffers. Returns the bytes freed.
    fn purge_cache(&mut self) -> usize {
        0
    }

    fn memory_usage(&self) -> usize {
        0
    }

    /// Min/max envelope of audio stream `stream`, when the backend keeps one.
    fn waveform_index(&self, _stream: usize) -> Option<WaveformIndex> {
        None
    }

    fn set_processors(&mut self, _processors: usize) {}
}
