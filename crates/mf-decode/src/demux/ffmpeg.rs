//! FFmpeg underneath the demux engine.

use ffmpeg_next as ffmpeg;
use ffmpeg::format::{sample, Pixel, Sample};
use ffmpeg::software::scaling;
use ffmpeg::{codec, frame, media, threading};
use mf_core::{Error, Result};
use mf_media::ColorModel;
use std::path::{Path, PathBuf};
use std::sync::Once;
use tracing::{debug, trace};

use super::container::{
    Container, ContainerInfo, ContainerOpener, Decoded, MediaKind, Packet, Picture,
    StreamDecoder, StreamInfo,
};
use super::pcm::{PcmFrame, SampleFormat};

static INIT: Once = Once::new();

/// Ticks per second of container-level timestamps.
const TIME_BASE: f64 = 1_000_000.0;

/// FFmpeg's marker for a missing timestamp.
const NO_PTS: i64 = i64::MIN;

fn init_ffmpeg() {
    INIT.call_once(|| {
        if let Err(e) = ffmpeg::init() {
            tracing::error!("FFmpeg initialization failed: {e}");
        }
        ffmpeg::log::set_level(ffmpeg::log::Level::Error);
    });
}

fn ffmpeg_error(path: &Path, e: ffmpeg::Error) -> Error {
    match e {
        ffmpeg::Error::Other { errno } if errno == ffmpeg::error::ENOENT => Error::not_found(path),
        other => Error::decode(format!("{}: {other}", path.display())),
    }
}

/// Whether FFmpeg can open `path` and finds at least one audio or video
/// stream in it.
pub fn probe(path: &Path) -> bool {
    init_ffmpeg();
    match ffmpeg::format::input(path) {
        Ok(input) => input.streams().any(|s| {
            matches!(s.parameters().medium(), media::Type::Audio | media::Type::Video)
        }),
        Err(e) => {
            trace!(path = %path.display(), "ffmpeg probe failed: {e}");
            false
        }
    }
}

#[derive(Debug, Default, Clone, Copy)]
pub struct FfmpegOpener;

impl ContainerOpener for FfmpegOpener {
    fn open(&self, path: &Path) -> Result<Box<dyn Container>> {
        init_ffmpeg();
        let input = ffmpeg::format::input(path).map_err(|e| ffmpeg_error(path, e))?;
        let info = describe(&input)?;
        let size = std::fs::metadata(path)?.len();
        Ok(Box::new(FfmpegContainer {
            path: path.to_path_buf(),
            input,
            info,
            size,
        }))
    }
}

fn describe(input: &ffmpeg::format::context::Input) -> Result<ContainerInfo> {
    let mut streams = Vec::new();
    for stream in input.streams() {
        let params = stream.parameters();
        let kind = match params.medium() {
            media::Type::Audio => MediaKind::Audio,
            media::Type::Video => MediaKind::Video,
            _ => continue,
        };
        let mut info = StreamInfo::new(stream.index(), kind, params.id().name());
        info.time_base = f64::from(stream.time_base());
        info.start_time = match stream.start_time() {
            NO_PTS => 0,
            ts => ts,
        };
        let context = codec::context::Context::from_parameters(params)
            .map_err(|e| Error::decode(format!("stream {}: {e}", stream.index())))?;
        let seconds = match stream.duration() {
            d if d > 0 => d as f64 * info.time_base,
            _ => match input.duration() {
                d if d > 0 => d as f64 / TIME_BASE,
                _ => 0.0,
            },
        };
        match kind {
            MediaKind::Audio => {
                let audio = context.decoder().audio().map_err(Error::decode)?;
                info.channels = audio.channels() as i32;
                info.sample_rate = audio.rate() as i32;
                info.bits = (audio.format().bytes() * 8) as i32;
                info.length_estimate = (seconds * info.sample_rate as f64) as i64;
            }
            MediaKind::Video => {
                let video = context.decoder().video().map_err(Error::decode)?;
                info.width = video.width() as i32;
                info.height = video.height() as i32;
                info.frame_rate = match f64::from(stream.avg_frame_rate()) {
                    r if r.is_finite() && r > 0.0 => r,
                    _ => f64::from(stream.rate()),
                };
                info.sample_aspect_ratio = match f64::from(video.aspect_ratio()) {
                    r if r.is_finite() => r,
                    _ => 0.0,
                };
                info.length_estimate = match stream.frames() {
                    n if n > 0 => n,
                    _ => (seconds * info.frame_rate) as i64,
                };
            }
        }
        streams.push(info);
    }
    Ok(ContainerInfo {
        format_name: input.format().name().to_string(),
        streams,
    })
}

struct FfmpegContainer {
    path: PathBuf,
    input: ffmpeg::format::context::Input,
    info: ContainerInfo,
    size: u64,
}

impl Container for FfmpegContainer {
    fn info(&self) -> &ContainerInfo {
        &self.info
    }

    fn seek(&mut self, stream: usize, seconds: f64) -> Result<()> {
        let ts = (seconds.max(0.0) * TIME_BASE) as i64;
        trace!(path = %self.path.display(), stream, seconds, "container seek");
        self.input.seek(ts, ..ts).map_err(|e| {
            Error::decode(format!("{}: seek to {seconds}s: {e}", self.path.display()))
        })
    }

    fn read_packet(&mut self) -> Result<Option<Packet>> {
        let mut packet = ffmpeg::Packet::empty();
        match packet.read(&mut self.input) {
            Ok(()) => Ok(Some(Packet {
                stream: packet.stream(),
                offset: packet.position() as i64,
                pts: packet.pts(),
                dts: packet.dts(),
                keyframe: packet.is_key(),
                data: packet.data().map(<[u8]>::to_vec).unwrap_or_default(),
            })),
            Err(ffmpeg::Error::Eof) => Ok(None),
            Err(e) => Err(ffmpeg_error(&self.path, e)),
        }
    }

    fn byte_size(&self) -> u64 {
        self.size
    }

    fn open_decoder(
        &self,
        stream: usize,
        threads: usize,
        hardware: bool,
    ) -> Result<Box<dyn StreamDecoder>> {
        let source = self
            .input
            .stream(stream)
            .ok_or_else(|| Error::decode(format!("no stream {stream}")))?;
        let kind = self
            .info
            .streams
            .iter()
            .find(|s| s.index == stream)
            .map(|s| s.kind)
            .ok_or_else(|| Error::decode(format!("stream {stream} is not audio or video")))?;
        let mut context = codec::context::Context::from_parameters(source.parameters())
            .map_err(Error::decode)?;
        context.set_threading(threading::Config {
            kind: threading::Type::Frame,
            count: threads,
            ..Default::default()
        });
        if hardware {
            debug!(stream, "hardware decoding is not available; decoding in software");
        }
        let decoder = match kind {
            MediaKind::Video => {
                DecoderKind::Video(context.decoder().video().map_err(Error::decode)?)
            }
            MediaKind::Audio => {
                DecoderKind::Audio(context.decoder().audio().map_err(Error::decode)?)
            }
        };
        Ok(Box::new(FfmpegDecoder {
            decoder,
            scaler: None,
        }))
    }
}

enum DecoderKind {
    Video(ffmpeg::decoder::Video),
    Audio(ffmpeg::decoder::Audio),
}

impl DecoderKind {
    fn opened(&mut self) -> &mut ffmpeg::decoder::Opened {
        match self {
            DecoderKind::Video(video) => &mut **video,
            DecoderKind::Audio(audio) => &mut **audio,
        }
    }
}

/// Converts decoded pictures to packed RGBA.
struct Scaler {
    context: scaling::Context,
    from: (Pixel, u32, u32),
}

// SAFETY: a scaler is owned by exactly one decoder and only used from the
// thread holding that decoder.
unsafe impl Send for Scaler {}

struct FfmpegDecoder {
    decoder: DecoderKind,
    scaler: Option<Scaler>,
}

impl FfmpegDecoder {
    fn to_picture(&mut self, decoded: &frame::Video) -> Result<Picture> {
        let (width, height) = (decoded.width(), decoded.height());
        let from = (decoded.format(), width, height);
        if self.scaler.as_ref().map(|s| s.from) != Some(from) {
            let context = scaling::Context::get(
                from.0,
                width,
                height,
                Pixel::RGBA,
                width,
                height,
                scaling::Flags::BILINEAR,
            )
            .map_err(Error::decode)?;
            self.scaler = Some(Scaler { context, from });
        }
        let Some(scaler) = self.scaler.as_mut() else {
            return Err(Error::state("scaler missing"));
        };
        let mut rgba = frame::Video::empty();
        scaler.context.run(decoded, &mut rgba).map_err(Error::decode)?;

        // Strip the row padding.
        let row = width as usize * 4;
        let stride = rgba.stride(0);
        let mut data = Vec::with_capacity(row * height as usize);
        for line in rgba.data(0).chunks(stride).take(height as usize) {
            data.extend_from_slice(&line[..row]);
        }
        Ok(Picture {
            width: width as usize,
            height: height as usize,
            color_model: ColorModel::Rgba8888,
            data,
            pts: decoded.pts(),
            keyframe: decoded.is_key(),
        })
    }
}

fn sample_format(format: Sample) -> SampleFormat {
    match format {
        Sample::U8(sample::Type::Packed) => SampleFormat::U8,
        Sample::U8(sample::Type::Planar) => SampleFormat::U8Planar,
        Sample::I16(sample::Type::Packed) => SampleFormat::S16,
        Sample::I16(sample::Type::Planar) => SampleFormat::S16Planar,
        Sample::I32(sample::Type::Packed) => SampleFormat::S32,
        Sample::I32(sample::Type::Planar) => SampleFormat::S32Planar,
        Sample::F32(sample::Type::Packed) => SampleFormat::F32,
        Sample::F32(sample::Type::Planar) => SampleFormat::F32Planar,
        Sample::F64(sample::Type::Packed) => SampleFormat::F64,
        Sample::F64(sample::Type::Planar) => SampleFormat::F64Planar,
        other => SampleFormat::Other(format!("{other:?}")),
    }
}

fn pcm_frame(decoded: &frame::Audio) -> PcmFrame {
    let format = sample_format(decoded.format());
    let channels = decoded.channels() as usize;
    let samples = decoded.samples();
    let width = format.sample_bytes().unwrap_or(0);
    let plane_len = if format.is_planar() {
        samples * width
    } else {
        samples * width * channels
    };
    let planes = (0..decoded.planes())
        .map(|i| {
            let data = decoded.data(i);
            data[..plane_len.min(data.len())].to_vec()
        })
        .collect();
    PcmFrame {
        format,
        channels,
        samples,
        planes,
        pts: decoded.pts(),
    }
}

impl StreamDecoder for FfmpegDecoder {
    fn send_packet(&mut self, packet: &Packet) -> Result<()> {
        let mut raw = ffmpeg::Packet::copy(&packet.data);
        raw.set_stream(packet.stream);
        raw.set_pts(packet.pts);
        raw.set_dts(packet.dts);
        raw.set_position(packet.offset as isize);
        if packet.keyframe {
            raw.set_flags(ffmpeg::packet::Flags::KEY);
        }
        match self.decoder.opened().send_packet(&raw) {
            Ok(()) => Ok(()),
            // The decoder is full; the caller drains it before sending more.
            Err(ffmpeg::Error::Other { errno }) if errno == ffmpeg::error::EAGAIN => Ok(()),
            Err(e) => Err(Error::decode(e)),
        }
    }

    fn send_eof(&mut self) -> Result<()> {
        match self.decoder.opened().send_eof() {
            Ok(()) | Err(ffmpeg::Error::Eof) => Ok(()),
            Err(e) => Err(Error::decode(e)),
        }
    }

    fn receive(&mut self) -> Result<Option<Decoded>> {
        let received = match &mut self.decoder {
            DecoderKind::Video(video) => {
                let mut decoded = frame::Video::empty();
                video.receive_frame(&mut decoded).map(|()| Frame::Video(decoded))
            }
            DecoderKind::Audio(audio) => {
                let mut decoded = frame::Audio::empty();
                audio.receive_frame(&mut decoded).map(|()| Frame::Audio(decoded))
            }
        };
        match received {
            Ok(Frame::Video(decoded)) => Ok(Some(Decoded::Video(self.to_picture(&decoded)?))),
            Ok(Frame::Audio(decoded)) => Ok(Some(Decoded::Audio(pcm_frame(&decoded)))),
            Err(ffmpeg::Error::Eof) => Ok(None),
            Err(ffmpeg::Error::Other { errno }) if errno == ffmpeg::error::EAGAIN => Ok(None),
            Err(e) => Err(Error::decode(e)),
        }
    }

    fn flush(&mut self) {
        self.decoder.opened().flush();
    }
}

enum Frame {
    Video(frame::Video),
    Audio(frame::Audio),
}
