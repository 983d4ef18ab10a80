//! An in-memory container for exercising the seek engine.
//!
//! The file is laid out one video frame at a time: a video packet followed
//! by one packet per audio stream. Every packet is 100 bytes. Video
//! pictures carry their frame number in the first two bytes of each pixel
//! and audio samples follow [`synthetic_sample`], so tests can tell exactly
//! what a read returned.

use mf_core::{Error, Result};
use mf_media::ColorModel;
use std::collections::VecDeque;
use std::path::Path;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};

use super::container::{
    Container, ContainerInfo, ContainerOpener, Decoded, MediaKind, Packet, Picture,
    StreamDecoder, StreamInfo,
};
use super::pcm::{PcmFrame, SampleFormat};

pub const PACKET_BYTES: i64 = 100;
pub const PICTURE_WIDTH: usize = 2;
pub const PICTURE_HEIGHT: usize = 1;

/// Sample `s` of `channel` in audio stream `stream`.
pub fn synthetic_sample(stream: usize, channel: usize, s: i64) -> f64 {
    let base = (s % 1000) as f64 / 1000.0;
    let sign = if channel % 2 == 0 { 1.0 } else { -1.0 };
    sign * base * (1.0 / (stream + 1) as f64)
}

/// Frame number carried by a decoded synthetic picture.
pub fn picture_frame(data: &[u8]) -> i64 {
    u16::from_le_bytes([data[0], data[1]]) as i64
}

#[derive(Debug, Clone)]
pub struct SyntheticFile {
    pub format_name: String,
    pub video_codec: String,
    pub frames: i64,
    pub gop: i64,
    pub frame_rate: f64,
    /// Channel count of each audio stream.
    pub audio_channels: Vec<usize>,
    pub sample_rate: i32,
    /// Audio samples per packet, one packet per video frame.
    pub samples_per_packet: i64,
    /// Pictures the video decoder holds back until more input or end of
    /// stream arrives.
    pub decoder_delay: usize,
}

impl SyntheticFile {
    /// H.264 in Matroska: 300 frames at 25 fps, a keyframe every 30, one
    /// stereo audio stream at 8 kHz.
    pub fn h264() -> Self {
        Self {
            format_name: "matroska,webm".into(),
            video_codec: "h264".into(),
            frames: 300,
            gop: 30,
            frame_rate: 25.0,
            audio_channels: vec![2],
            sample_rate: 8000,
            samples_per_packet: 320,
            decoder_delay: 0,
        }
    }

    fn streams_per_frame(&self) -> i64 {
        1 + self.audio_channels.len() as i64
    }

    fn packet_count(&self) -> i64 {
        self.frames * self.streams_per_frame()
    }

    pub fn byte_size(&self) -> u64 {
        (self.packet_count() * PACKET_BYTES) as u64
    }

    pub fn total_samples(&self) -> i64 {
        self.frames * self.samples_per_packet
    }

    fn info(&self) -> ContainerInfo {
        let mut video = StreamInfo::new(0, MediaKind::Video, &self.video_codec);
        video.time_base = 1.0 / self.frame_rate;
        video.width = PICTURE_WIDTH as i32;
        video.height = PICTURE_HEIGHT as i32;
        video.frame_rate = self.frame_rate;
        video.length_estimate = self.frames;
        let mut streams = vec![video];
        for (i, &channels) in self.audio_channels.iter().enumerate() {
            let mut audio = StreamInfo::new(i + 1, MediaKind::Audio, "pcm_f64le");
            audio.time_base = 1.0 / self.sample_rate as f64;
            audio.channels = channels as i32;
            audio.sample_rate = self.sample_rate;
            audio.bits = 64;
            audio.length_estimate = self.total_samples();
            streams.push(audio);
        }
        ContainerInfo {
            format_name: self.format_name.clone(),
            streams,
        }
    }

    fn packet(&self, at: i64) -> Packet {
        let frame = at / self.streams_per_frame();
        let stream = (at % self.streams_per_frame()) as usize;
        let (pts, keyframe) = if stream == 0 {
            (frame, frame % self.gop == 0)
        } else {
            (frame * self.samples_per_packet, true)
        };
        Packet {
            stream,
            offset: at * PACKET_BYTES,
            pts: Some(pts),
            dts: Some(pts),
            keyframe,
            data: frame.to_le_bytes().to_vec(),
        }
    }
}

/// What the engine did to the synthetic file.
#[derive(Debug, Default)]
pub struct SyntheticLog {
    pub opens: usize,
    /// `(stream, seconds)` of every container seek.
    pub seeks: Vec<(usize, f64)>,
    pub packets_read: usize,
}

#[derive(Debug, Clone)]
pub struct SyntheticOpener {
    pub file: SyntheticFile,
    pub log: Arc<Mutex<SyntheticLog>>,
    /// Video packets still to reject with a decode error.
    pub failures: Arc<AtomicUsize>,
}

impl SyntheticOpener {
    pub fn new(file: SyntheticFile) -> Self {
        Self {
            file,
            log: Arc::default(),
            failures: Arc::default(),
        }
    }

    pub fn opens(&self) -> usize {
        self.log.lock().unwrap().opens
    }

    pub fn last_seek(&self) -> Option<(usize, f64)> {
        self.log.lock().unwrap().seeks.last().copied()
    }
}

impl ContainerOpener for SyntheticOpener {
    fn open(&self, path: &Path) -> Result<Box<dyn Container>> {
        if !path.exists() {
            return Err(Error::not_found(path));
        }
        self.log.lock().unwrap().opens += 1;
        Ok(Box::new(SyntheticContainer {
            info: self.file.info(),
            file: self.file.clone(),
            next: 0,
            log: Arc::clone(&self.log),
            failures: Arc::clone(&self.failures),
        }))
    }
}

struct SyntheticContainer {
    file: SyntheticFile,
    info: ContainerInfo,
    next: i64,
    log: Arc<Mutex<SyntheticLog>>,
    failures: Arc<AtomicUsize>,
}

impl Container for SyntheticContainer {
    fn info(&self) -> &ContainerInfo {
        &self.info
    }

    /// Lands on the last keyframe at or before `seconds`.
    fn seek(&mut self, stream: usize, seconds: f64) -> Result<()> {
        self.log.lock().unwrap().seeks.push((stream, seconds));
        let frame = ((seconds * self.file.frame_rate).floor() as i64).clamp(0, self.file.frames);
        let keyframe = frame - frame % self.file.gop;
        self.next = keyframe * self.file.streams_per_frame();
        Ok(())
    }

    fn read_packet(&mut self) -> Result<Option<Packet>> {
        if self.next >= self.file.packet_count() {
            return Ok(None);
        }
        let packet = self.file.packet(self.next);
        self.next += 1;
        self.log.lock().unwrap().packets_read += 1;
        Ok(Some(packet))
    }

    fn byte_size(&self) -> u64 {
        self.file.byte_size()
    }

    fn open_decoder(
        &self,
        stream: usize,
        _threads: usize,
        _hardware: bool,
    ) -> Result<Box<dyn StreamDecoder>> {
        let info = self
            .info
            .streams
            .iter()
            .find(|s| s.index == stream)
            .cloned()
            .ok_or_else(|| Error::decode(format!("no stream {stream}")))?;
        let delay = match info.kind {
            MediaKind::Video => self.file.decoder_delay,
            _ => 0,
        };
        Ok(Box::new(SyntheticDecoder {
            info,
            samples_per_packet: self.file.samples_per_packet,
            ready: VecDeque::new(),
            delay,
            draining: false,
            failures: Arc::clone(&self.failures),
        }))
    }
}

struct SyntheticDecoder {
    info: StreamInfo,
    samples_per_packet: i64,
    ready: VecDeque<Decoded>,
    delay: usize,
    draining: bool,
    failures: Arc<AtomicUsize>,
}

impl StreamDecoder for SyntheticDecoder {
    fn send_packet(&mut self, packet: &Packet) -> Result<()> {
        let mut raw = [0u8; 8];
        raw.copy_from_slice(&packet.data[..8]);
        let frame = i64::from_le_bytes(raw);
        match self.info.kind {
            MediaKind::Video => {
                let take = self
                    .failures
                    .fetch_update(Ordering::SeqCst, Ordering::SeqCst, |n| n.checked_sub(1));
                if take.is_ok() {
                    return Err(Error::decode("corrupt synthetic packet"));
                }
                let [lo, hi] = (frame as u16).to_le_bytes();
                let data = [lo, hi, 7].repeat(PICTURE_WIDTH * PICTURE_HEIGHT);
                self.ready.push_back(Decoded::Video(Picture {
                    width: PICTURE_WIDTH,
                    height: PICTURE_HEIGHT,
                    color_model: ColorModel::Rgb888,
                    data,
                    pts: packet.pts,
                    keyframe: packet.keyframe,
                }));
            }
            MediaKind::Audio => {
                let first = frame * self.samples_per_packet;
                let channels = self.info.channels as usize;
                let planes = (0..channels)
                    .map(|channel| {
                        (first..first + self.samples_per_packet)
                            .flat_map(|s| {
                                synthetic_sample(self.info.index, channel, s).to_le_bytes()
                            })
                            .collect()
                    })
                    .collect();
                self.ready.push_back(Decoded::Audio(PcmFrame {
                    format: SampleFormat::F64Planar,
                    channels,
                    samples: self.samples_per_packet as usize,
                    planes,
                    pts: packet.pts,
                }));
            }
        }
        Ok(())
    }

    fn send_eof(&mut self) -> Result<()> {
        self.draining = true;
        Ok(())
    }

    fn receive(&mut self) -> Result<Option<Decoded>> {
        if self.draining || self.ready.len() > self.delay {
            return Ok(self.ready.pop_front());
        }
        Ok(None)
    }

    fn flush(&mut self) {
        self.ready.clear();
        self.draining = false;
    }
}
