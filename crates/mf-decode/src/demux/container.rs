//! The seam between the seek/TOC engine and a concrete demuxer.
//!
//! [`Container`] reads packets in file order and performs coarse,
//! backward time seeks; [`StreamDecoder`] turns packets of one stream into
//! pictures or PCM. The engine never looks inside a bitstream, so any
//! library that offers these two operations can sit underneath it.

use mf_core::Result;
use mf_media::ColorModel;
use std::path::Path;

use super::pcm::PcmFrame;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum MediaKind {
    Audio,
    Video,
}

/// Static description of one elementary stream.
#[derive(Debug, Clone, PartialEq)]
pub struct StreamInfo {
    /// Index of the stream inside the container.
    pub index: usize,
    pub kind: MediaKind,
    pub codec: String,
    /// Seconds per timestamp tick.
    pub time_base: f64,
    /// First timestamp of the stream in ticks.
    pub start_time: i64,

    pub channels: i32,
    pub sample_rate: i32,
    pub bits: i32,

    pub width: i32,
    pub height: i32,
    pub frame_rate: f64,
    /// Pixel aspect ratio; 0 when unknown.
    pub sample_aspect_ratio: f64,

    /// Length the container header claims, in samples or frames; 0 when
    /// unknown. Only trusted when no table of contents exists.
    pub length_estimate: i64,
}

impl StreamInfo {
    /// A stream with every numeric field zeroed.
    pub fn new(index: usize, kind: MediaKind, codec: &str) -> Self {
        Self {
            index,
            kind,
            codec: codec.to_string(),
            time_base: 0.0,
            start_time: 0,
            channels: 0,
            sample_rate: 0,
            bits: 0,
            width: 0,
            height: 0,
            frame_rate: 0.0,
            sample_aspect_ratio: 0.0,
            length_estimate: 0,
        }
    }

    /// Seconds from the start of the stream for a timestamp.
    pub fn seconds(&self, ts: i64) -> f64 {
        (ts - self.start_time) as f64 * self.time_base
    }

    /// Display aspect ratio derived from the sample aspect ratio.
    pub fn display_aspect(&self) -> f64 {
        if self.height == 0 {
            return 0.0;
        }
        let sar = if self.sample_aspect_ratio > 0.0 {
            self.sample_aspect_ratio
        } else {
            1.0
        };
        sar * self.width as f64 / self.height as f64
    }
}

#[derive(Debug, Clone, PartialEq)]
pub struct ContainerInfo {
    /// Demuxer name, e.g. `matroska,webm` or `avi`.
    pub format_name: String,
    pub streams: Vec<StreamInfo>,
}

impl ContainerInfo {
    pub fn audio_streams(&self) -> impl Iterator<Item = &StreamInfo> {
        self.streams.iter().filter(|s| s.kind == MediaKind::Audio)
    }

    pub fn first_video(&self) -> Option<&StreamInfo> {
        self.streams.iter().find(|s| s.kind == MediaKind::Video)
    }
}

/// One compressed packet with its byte position in the file.
#[derive(Debug, Clone, PartialEq)]
pub struct Packet {
    pub stream: usize,
    /// Byte offset of the packet in the file.
    pub offset: i64,
    pub pts: Option<i64>,
    pub dts: Option<i64>,
    pub keyframe: bool,
    pub data: Vec<u8>,
}

/// A decoded picture.
#[derive(Debug, Clone, PartialEq)]
pub struct Picture {
    pub width: usize,
    pub height: usize,
    pub color_model: ColorModel,
    pub data: Vec<u8>,
    pub pts: Option<i64>,
    pub keyframe: bool,
}

#[derive(Debug, Clone, PartialEq)]
pub enum Decoded {
    Video(Picture),
    Audio(PcmFrame),
}

/// An open file, read in file order.
pub trait Container: Send {
    fn info(&self) -> &ContainerInfo;

    /// Reposition near `seconds` into `stream`, landing on a seek point
    /// at or before it where the format allows.
    fn seek(&mut self, stream: usize, seconds: f64) -> Result<()>;

    /// Next packet of any stream, or `None` at end of file.
    fn read_packet(&mut self) -> Result<Option<Packet>>;

    /// Total byte size, used as the progress total while scanning.
    fn byte_size(&self) -> u64;

    fn open_decoder(&self, stream: usize, threads: usize, hardware: bool)
        -> Result<Box<dyn StreamDecoder>>;
}

/// Decoder for one stream.
pub trait StreamDecoder: Send {
    fn send_packet(&mut self, packet: &Packet) -> Result<()>;

    /// Signal end of stream so buffered frames drain.
    fn send_eof(&mut self) -> Result<()>;

    /// Next decoded output, or `None` when more input is needed.
    fn receive(&mut self) -> Result<Option<Decoded>>;

    /// Drop buffered state after a seek.
    fn flush(&mut self);
}

/// Opens containers; one handle per stream is opened from the same path.
pub trait ContainerOpener: Send + Sync {
    fn open(&self, path: &Path) -> Result<Box<dyn Container>>;
}
