//! Generic container demuxing with sidecar tables of contents.
//!
//! The engine in this module is written against the [`Container`] and
//! [`StreamDecoder`] traits. Builds with the `native-ffmpeg` feature plug
//! FFmpeg in underneath; other builds still carry the engine but refuse to
//! open files.

pub mod backend;
pub mod container;
pub mod history;
pub mod pcm;
pub mod scan;
pub mod stream;
pub mod timestamps;
pub mod toc;
pub mod waveform;

#[cfg(feature = "native-ffmpeg")]
pub mod ffmpeg;

#[cfg(test)]
pub(crate) mod synthetic;

use mf_core::{Error, Result};
use std::path::Path;

pub use backend::{needs_toc, DemuxBackend};
pub use container::{
    Container, ContainerInfo, ContainerOpener, Decoded, MediaKind, Packet, Picture,
    StreamDecoder, StreamInfo,
};
pub use pcm::{PcmFrame, SampleFormat};
pub use scan::build_toc;
pub use toc::{toc_path, AudioToc, TocFile, VideoToc, WaveformIndex, TOC_MAGIC};

/// Whether the linked demuxer recognizes `path`.
#[cfg(feature = "native-ffmpeg")]
pub fn probe_container(path: &Path) -> bool {
    ffmpeg::probe(path)
}

#[cfg(not(feature = "native-ffmpeg"))]
pub fn probe_container(_path: &Path) -> bool {
    false
}

#[cfg(feature = "native-ffmpeg")]
pub type DefaultOpener = ffmpeg::FfmpegOpener;

#[cfg(not(feature = "native-ffmpeg"))]
pub type DefaultOpener = UnavailableOpener;

/// The opener generic containers are read through in this build.
pub fn default_opener() -> DefaultOpener {
    DefaultOpener::default()
}

/// Stands in for a demuxer in builds without one.
#[derive(Debug, Default, Clone, Copy)]
pub struct UnavailableOpener;

impl ContainerOpener for UnavailableOpener {
    fn open(&self, path: &Path) -> Result<Box<dyn Container>> {
        Err(Error::unsupported(format!(
            "{}: built without FFmpeg support",
            path.display()
        )))
    }
}
