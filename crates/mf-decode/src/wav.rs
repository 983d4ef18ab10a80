//! RIFF WAVE reading and writing through `hound`.

use hound::{SampleFormat, WavReader, WavSpec, WavWriter};
use mf_core::{Error, FileFormat, Result};
use mf_media::{ColorModel, VideoFrame};
use std::fs::File;
use std::io::{BufReader, BufWriter};
use tracing::{debug, info};

use crate::backend::{DecoderBackend, FrameRead, OpenRequest};
use crate::registry::BackendKind;

/// Frames read from disk at a time.
const BLOCK_FRAMES: usize = 0x1_0000;

fn wav_error(e: hound::Error) -> Error {
    match e {
        hound::Error::IoError(io) => Error::from(io),
        other => Error::decode(other),
    }
}

/// Interleaved samples of frames `[start, start + len)`.
#[derive(Debug, Default)]
struct Block {
    start: i64,
    frames: usize,
    samples: Vec<f64>,
}

impl Block {
    fn covers(&self, position: i64, len: usize) -> bool {
        position >= self.start && position + len as i64 <= self.start + self.frames as i64
    }
}

pub struct WavBackend {
    reader: Option<WavReader<BufReader<File>>>,
    writer: Option<WavWriter<BufWriter<File>>>,
    spec: Option<WavSpec>,
    length: i64,
    block: Block,
}

impl std::fmt::Debug for WavBackend {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("WavBackend")
            .field("spec", &self.spec)
            .field("length", &self.length)
            .field("reading", &self.reader.is_some())
            .field("writing", &self.writer.is_some())
            .finish()
    }
}

impl Default for WavBackend {
    fn default() -> Self {
        Self::new()
    }
}

impl WavBackend {
    pub fn new() -> Self {
        Self {
            reader: None,
            writer: None,
            spec: None,
            length: 0,
            block: Block::default(),
        }
    }

    fn load_block(&mut self, position: i64, len: usize) -> Result<()> {
        let (Some(reader), Some(spec)) = (self.reader.as_mut(), self.spec) else {
            return Err(Error::state("wav file is not open for reading"));
        };
        let channels = spec.channels as usize;
        let frames = len.max(BLOCK_FRAMES).min((self.length - position).max(0) as usize);
        reader.seek(position as u32)?;

        let wanted = frames * channels;
        let mut samples = Vec::with_capacity(wanted);
        match spec.sample_format {
            SampleFormat::Float => {
                for sample in reader.samples::<f32>().take(wanted) {
                    samples.push(sample.map_err(wav_error)? as f64);
                }
            }
            SampleFormat::Int => {
                let scale = ((1i64 << (spec.bits_per_sample - 1)) - 1) as f64;
                for sample in reader.samples::<i32>().take(wanted) {
                    samples.push(sample.map_err(wav_error)? as f64 / scale);
                }
            }
        }
        self.block = Block {
            start: position,
            frames: samples.len() / channels.max(1),
            samples,
        };
        Ok(())
    }
}

impl DecoderBackend for WavBackend {
    fn kind(&self) -> BackendKind {
        BackendKind::Wav
    }

    fn open(&mut self, request: OpenRequest<'_>) -> Result<()> {
        let asset = request.asset;
        if request.read {
            let reader = WavReader::open(&asset.path).map_err(wav_error)?;
            let spec = reader.spec();
            self.length = reader.duration() as i64;
            asset.format = FileFormat::Wav;
            asset.container = "wav".into();
            asset.audio_data = true;
            asset.channels = spec.channels as i32;
            asset.sample_rate = spec.sample_rate as i32;
            asset.bits = spec.bits_per_sample as i32;
            asset.audio_codec = match spec.sample_format {
                SampleFormat::Float => "pcm_f32".into(),
                SampleFormat::Int => "pcm".into(),
            };
            asset.audio_length = self.length;
            info!(
                path = %asset.path.display(),
                channels = spec.channels,
                rate = spec.sample_rate,
                samples = self.length,
                "opened wav"
            );
            self.spec = Some(spec);
            self.reader = Some(reader);
        } else if request.write {
            if asset.channels <= 0 || asset.sample_rate <= 0 {
                return Err(Error::Validation(format!(
                    "cannot write wav with {} channels at {} Hz",
                    asset.channels, asset.sample_rate
                )));
            }
            let bits = match asset.bits {
                8 | 16 | 24 | 32 => asset.bits as u16,
                _ => 16,
            };
            let spec = WavSpec {
                channels: asset.channels as u16,
                sample_rate: asset.sample_rate as u32,
                bits_per_sample: bits,
                sample_format: SampleFormat::Int,
            };
            let writer = WavWriter::create(&asset.path, spec).map_err(wav_error)?;
            asset.format = FileFormat::Wav;
            asset.audio_data = true;
            asset.bits = bits as i32;
            asset.audio_codec = "pcm".into();
            debug!(path = %asset.path.display(), bits, "created wav");
            self.spec = Some(spec);
            self.writer = Some(writer);
        }
        Ok(())
    }

    fn close(&mut self) -> Result<()> {
        self.reader = None;
        self.block = Block::default();
        if let Some(writer) = self.writer.take() {
            writer.finalize().map_err(Error::encode)?;
        }
        Ok(())
    }

    fn colormodel_supported(&self, requested: ColorModel) -> ColorModel {
        requested
    }

    fn read_frame(&mut self, _request: FrameRead<'_>) -> Result<()> {
        Err(Error::unsupported("wav files have no video"))
    }

    fn read_samples(&mut self, buffer: &mut [f64], position: i64, channel: i32) -> Result<()> {
        let Some(spec) = self.spec else {
            return Err(Error::state("wav file is not open"));
        };
        let channels = spec.channels as usize;
        if channel < 0 || channel as usize >= channels {
            return Err(Error::Validation(format!(
                "channel {channel} out of range for {channels} channels"
            )));
        }
        buffer.fill(0.0);
        if position < 0 || position >= self.length {
            return Ok(());
        }
        let available = buffer.len().min((self.length - position) as usize);
        if !self.block.covers(position, available) {
            self.load_block(position, available)?;
        }

        let first = (position - self.block.start) as usize;
        let frames = available.min(self.block.frames.saturating_sub(first));
        for (i, out) in buffer[..frames].iter_mut().enumerate() {
            *out = self.block.samples[(first + i) * channels + channel as usize];
        }
        Ok(())
    }

    fn write_samples(&mut self, data: &[&[f64]]) -> Result<()> {
        let (Some(writer), Some(spec)) = (self.writer.as_mut(), self.spec) else {
            return Err(Error::state("wav file is not open for writing"));
        };
        let channels = spec.channels as usize;
        let len = data.first().map_or(0, |c| c.len());
        let scale = ((1i64 << (spec.bits_per_sample - 1)) - 1) as f64;
        for i in 0..len {
            for channel in 0..channels {
                let value = data.get(channel).and_then(|c| c.get(i)).copied().unwrap_or(0.0);
                let sample = (value.clamp(-1.0, 1.0) * scale).round() as i32;
                writer.write_sample(sample).map_err(Error::encode)?;
            }
        }
        self.length += len as i64;
        Ok(())
    }

    fn write_frames(&mut self, _frames: &[&VideoFrame]) -> Result<()> {
        Err(Error::unsupported("wav files have no video"))
    }

    fn purge_cache(&mut self) -> usize {
        let freed = self.memory_usage();
        self.block = Block::default();
        freed
    }

    fn memory_usage(&self) -> usize {
        self.block.samples.capacity() * std::mem::size_of::<f64>()
    }
}
