//! The worker process: one [`MediaFile`] serving the opcode protocol.

use mf_core::{Asset, ByteReader, ByteWriter, Error, Result};
use mf_decode::DecoderRegistry;
use mf_ipc::{ChildHandler, ChildLink, Command, Flow};
use mf_media::{ColorModel, Samples, VideoFrame};
use tracing::debug;

use crate::media_file::MediaFile;
use crate::opcode::{self, *};
use crate::payload::{self, AudioThreadSpec, CopyQuery, FinalLengths, OpenFile, VideoThreadSpec};
use crate::progress::LinkProgress;

/// Terminal result of one command.
struct Outcome {
    value: i64,
    payload: Vec<u8>,
    flow: Flow,
}

impl Outcome {
    fn value(value: i64) -> Self {
        Self {
            value,
            payload: Vec::new(),
            flow: Flow::Continue,
        }
    }

    fn payload(payload: Vec<u8>) -> Self {
        Self {
            value: 0,
            payload,
            flow: Flow::Continue,
        }
    }

    fn done() -> Self {
        Self::value(0)
    }
}

pub struct FileWorker {
    file: MediaFile,
    /// The editor's scratch frame, keyed by the descriptor it was mapped
    /// from.
    temp: Option<(Vec<u8>, VideoFrame)>,
}

impl FileWorker {
    pub fn new(registry: DecoderRegistry) -> Self {
        Self {
            file: MediaFile::for_worker(registry),
            temp: None,
        }
    }

    fn dispatch(&mut self, link: &mut ChildLink, command: Command) -> Result<Outcome> {
        let body = command.payload.as_slice();
        match command.token {
            OPEN_FILE => {
                let request: OpenFile = payload::decode(body)?;
                let mut asset = request.asset;
                let mut progress = LinkProgress::new(link);
                self.file.open_file_with_progress(
                    &request.prefs,
                    &mut asset,
                    request.read,
                    request.write,
                    &mut progress,
                )?;
                Ok(Outcome::payload(payload::encode(&asset)?))
            }
            CLOSE_FILE => {
                let asset = self.file.close_file()?;
                let lengths = FinalLengths {
                    audio_length: asset.as_ref().map_or(0, |a| a.audio_length),
                    video_length: asset.as_ref().map_or(0, |a| a.video_length),
                };
                Ok(Outcome {
                    flow: Flow::Exit,
                    ..Outcome::payload(payload::encode(&lengths)?)
                })
            }
            SET_PROCESSORS => {
                let processors: u64 = payload::decode(body)?;
                self.file.set_processors(processors as usize)?;
                Ok(Outcome::done())
            }
            SET_CACHE => {
                let bytes: u64 = payload::decode(body)?;
                self.file.set_cache_size(bytes as usize)?;
                Ok(Outcome::done())
            }
            SET_CACHE_FRAMES => {
                self.file.set_cache_frames(payload::decode(body)?)?;
                Ok(Outcome::done())
            }
            PURGE_CACHE => Ok(Outcome::value(self.file.purge_cache()? as i64)),
            SET_CHANNEL => {
                self.file.set_channel(payload::decode(body)?)?;
                Ok(Outcome::done())
            }
            SET_LAYER => {
                self.file.set_layer(payload::decode(body)?)?;
                Ok(Outcome::done())
            }
            GET_AUDIO_LENGTH => Ok(Outcome::payload(payload::encode(&self.file.local()?.audio_length())?)),
            GET_VIDEO_LENGTH => Ok(Outcome::payload(payload::encode(&self.file.local()?.video_length())?)),
            GET_AUDIO_POSITION => Ok(Outcome::value(self.file.local()?.cursor().sample)),
            GET_VIDEO_POSITION => Ok(Outcome::value(self.file.local()?.cursor().frame)),
            // The editor already decided the move is needed.
            SET_AUDIO_POSITION => {
                let local = self.file.local()?;
                local.seek_audio(payload::decode(body)?)?;
                Ok(Outcome::value(local.cursor().sample))
            }
            SET_VIDEO_POSITION => {
                let local = self.file.local()?;
                local.seek_video(payload::decode(body)?)?;
                Ok(Outcome::value(local.cursor().frame))
            }
            READ_SAMPLES => self.read_samples(body),
            READ_FRAME => self.read_frame(link, body),
            WRITE_SAMPLES => {
                let mut input = ByteReader::new(body);
                let count = input.u32()?;
                let mut channels = Vec::with_capacity(count as usize);
                for _ in 0..count {
                    channels.push(Samples::decode_from(&mut input)?);
                }
                let len = input.u64()? as usize;
                self.file.write_samples(&channels, len)?;
                Ok(Outcome::done())
            }
            WRITE_FRAMES => {
                let mut input = ByteReader::new(body);
                let layers = input.u32()?;
                let len = input.u32()? as usize;
                let mut frames = Vec::with_capacity(layers as usize);
                for _ in 0..layers {
                    let mut run = Vec::with_capacity(len);
                    for _ in 0..len {
                        run.push(VideoFrame::decode_from(&mut input)?);
                    }
                    frames.push(run);
                }
                self.file.write_frames(&frames, len)?;
                Ok(Outcome::done())
            }
            START_AUDIO_THREAD => {
                let spec: AudioThreadSpec = payload::decode(body)?;
                let local = self.file.local()?;
                local.start_audio_thread(spec.buffer_size as usize, spec.ring_buffers as usize)?;
                let mut out = ByteWriter::new();
                local.describe_audio_ring(&mut out)?;
                Ok(Outcome::payload(out.into_inner()))
            }
            START_VIDEO_THREAD => {
                let spec: VideoThreadSpec = payload::decode(body)?;
                let local = self.file.local()?;
                local.start_video_thread(
                    spec.buffer_size as usize,
                    ColorModel::from_code(spec.color_model)?,
                    spec.ring_buffers as usize,
                    spec.compressed,
                )?;
                let mut out = ByteWriter::new();
                local.describe_video_ring(&mut out)?;
                Ok(Outcome::payload(out.into_inner()))
            }
            STOP_AUDIO_THREAD => {
                self.file.stop_audio_thread()?;
                Ok(Outcome::done())
            }
            STOP_VIDEO_THREAD => {
                self.file.stop_video_thread()?;
                Ok(Outcome::done())
            }
            GET_AUDIO_BUFFER => Ok(Outcome::value(self.file.local()?.acquire_audio_buffer()? as i64)),
            GET_VIDEO_BUFFER => Ok(Outcome::value(self.file.local()?.acquire_video_buffer()? as i64)),
            WRITE_AUDIO_BUFFER => {
                let len = ByteReader::new(body).u64()? as usize;
                self.file.write_audio_buffer(len)?;
                Ok(Outcome::done())
            }
            WRITE_VIDEO_BUFFER => {
                let local = self.file.local()?;
                let len = local.apply_video_buffer_state(&mut ByteReader::new(body))?;
                local.write_video_buffer(len)?;
                Ok(Outcome::done())
            }
            CAN_COPY_FROM => {
                let query: CopyQuery = payload::decode(body)?;
                let source = Asset::from_xml(&query.asset_xml)?;
                let answer =
                    self.file
                        .can_copy_from(&source, query.position, query.width, query.height)?;
                Ok(Outcome::value(i64::from(answer)))
            }
            COLORMODEL_SUPPORTED => {
                let requested = ColorModel::from_code(payload::decode(body)?)?;
                Ok(Outcome::value(i64::from(self.file.colormodel_supported(requested)?.code())))
            }
            GET_MEMORY_USAGE => Ok(Outcome::value(self.file.get_memory_usage() as i64)),
            GET_WAVEFORM_INDEX => {
                let stream = ByteReader::new(body).u64()? as usize;
                match self.file.get_waveform_index(stream)? {
                    Some(index) => {
                        let mut out = ByteWriter::new();
                        index.encode_into(&mut out);
                        Ok(Outcome {
                            value: 1,
                            ..Outcome::payload(out.into_inner())
                        })
                    }
                    None => Ok(Outcome::value(0)),
                }
            }
            other => Err(Error::Protocol(format!("unknown command {other}"))),
        }
    }

    /// `[bool shared][samples if shared][u64 len]`. Heap reads come back
    /// as an `f64` slice.
    fn read_samples(&mut self, body: &[u8]) -> Result<Outcome> {
        let mut input = ByteReader::new(body);
        let shared = input.bool()?;
        let mapped = if shared {
            Some(Samples::decode_from(&mut input)?)
        } else {
            None
        };
        let len = input.u64()? as usize;
        let mut buffer = mapped.unwrap_or_else(|| Samples::new(len));
        self.file.read_samples(&mut buffer, len)?;

        let position = self.file.local()?.cursor().sample;
        let mut out = ByteWriter::new();
        if !shared {
            out.put_f64_slice(&buffer.as_slice()[..len]);
        }
        Ok(Outcome {
            value: position,
            payload: out.into_inner(),
            flow: Flow::Continue,
        })
    }

    /// Decode into the editor's frame. A heap frame cannot be shared, so
    /// the worker borrows a scratch frame from the editor first.
    fn read_frame(&mut self, link: &mut ChildLink, body: &[u8]) -> Result<Outcome> {
        let mut frame = VideoFrame::decode_from(&mut ByteReader::new(body))?;
        let model = frame.color_model();
        let (width, height) = (frame.width(), frame.height());

        let target = if frame.is_shared() || model == ColorModel::Compressed {
            &mut frame
        } else {
            let mut request = ByteWriter::new();
            request
                .put_u32(width as u32)
                .put_u32(height as u32)
                .put_i32(model.code());
            let descriptor = link
                .request(FILE_READ_TEMP, &request.into_inner())
                .map_err(|e| Error::Protocol(format!("scratch frame request failed: {e}")))?;
            let reuse = matches!(&self.temp, Some((key, _)) if *key == descriptor);
            if !reuse {
                let mapped = VideoFrame::decode_from(&mut ByteReader::new(&descriptor))?;
                if !mapped.matches(model, width, height) {
                    return Err(Error::Protocol("scratch frame has the wrong shape".into()));
                }
                self.temp = Some((descriptor, mapped));
            }
            match self.temp.as_mut() {
                Some((_, mapped)) => mapped,
                None => return Err(Error::state("scratch frame missing")),
            }
        };

        self.file.read_frame(target)?;

        let mut out = ByteWriter::new();
        target.encode_metadata_into(&mut out);
        if model == ColorModel::Compressed {
            out.put_bytes(target.compressed_data());
        }
        let position = self.file.local()?.cursor().frame;
        Ok(Outcome {
            value: position,
            payload: out.into_inner(),
            flow: Flow::Continue,
        })
    }
}

impl ChildHandler for FileWorker {
    fn init_child(&mut self) {
        debug!(pid = std::process::id(), "file worker ready");
    }

    fn handle_command(&mut self, link: &mut ChildLink, command: Command) -> mf_ipc::Result<Flow> {
        let token = command.token;
        debug!(command = opcode::name(token), len = command.payload.len(), "worker command");
        match self.dispatch(link, command) {
            Ok(outcome) => {
                link.send_result(outcome.value, &outcome.payload)?;
                Ok(outcome.flow)
            }
            Err(e) => {
                debug!(command = opcode::name(token), "command failed: {e}");
                link.send_failure(e.status().code(), &e.to_string())?;
                Ok(Flow::Continue)
            }
        }
    }
}
