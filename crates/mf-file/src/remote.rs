//! The isolated path: every operation becomes a command to a worker.
//!
//! The editor keeps a mirror of the cursor and cache settings so a fresh
//! worker can be put back where the dead one was.

use mf_core::{
    Asset, ByteReader, ByteWriter, Error, Preferences, ProgressSink, Result, NOSEEK_LENGTH,
};
use mf_decode::WaveformIndex;
use mf_media::{ColorModel, Samples, VideoFrame};
use tracing::{debug, warn};

use crate::handle::FileWorkerHandle;
use crate::local::{repositions, AudioBuffer, Cursor, VideoBuffer};
use crate::opcode::*;
use crate::payload::{self, AudioThreadSpec, CopyQuery, FinalLengths, OpenFile, VideoThreadSpec};
use crate::progress::relay_progress;
use crate::thread::BufferGuard;

/// Settings a replacement worker must be given again.
#[derive(Debug, Clone, Copy)]
pub(crate) struct Snapshot {
    cursor: Cursor,
    processors: usize,
    cache_size: usize,
    cache_frames: bool,
}

/// The editor's mapping of a worker's writer ring.
struct Ring<T> {
    buffers: Vec<T>,
    current: Option<usize>,
}

pub(crate) struct RemoteFile {
    handle: FileWorkerHandle,
    asset: Asset,
    cursor: Cursor,
    processors: usize,
    cache_size: usize,
    cache_frames: bool,
    /// Worker footprint as of the last read.
    memory_usage: usize,
    /// Shared frame lent to the worker for reads into heap frames.
    scratch: Option<VideoFrame>,
    audio_ring: Option<Ring<AudioBuffer>>,
    video_ring: Option<Ring<VideoBuffer>>,
}

impl RemoteFile {
    pub fn open(
        handle: FileWorkerHandle,
        prefs: &Preferences,
        asset: &mut Asset,
        read: bool,
        write: bool,
        progress: &mut dyn ProgressSink,
    ) -> Result<Self> {
        let request = payload::encode(&OpenFile {
            read,
            write,
            prefs: prefs.clone(),
            asset: asset.clone(),
        })?;
        let (_, body) = handle.call_with(OPEN_FILE, &request, |tag, body| {
            relay_progress(progress, tag, body).unwrap_or_else(|| {
                warn!(tag, "unexpected callback while opening");
                Vec::new()
            })
        })?;
        *asset = payload::decode(&body)?;

        let mut file = Self {
            handle,
            asset: asset.clone(),
            cursor: Cursor::default(),
            processors: prefs.processors,
            cache_size: prefs.cache.cache_size,
            cache_frames: prefs.cache.cache_frames,
            memory_usage: 0,
            scratch: None,
            audio_ring: None,
            video_ring: None,
        };
        file.refresh_memory_usage();
        Ok(file)
    }

    pub fn pid(&self) -> i32 {
        self.handle.pid()
    }

    pub fn worker_running(&self) -> bool {
        self.handle.is_running()
    }

    pub fn asset(&self) -> &Asset {
        &self.asset
    }

    pub fn cursor(&self) -> Cursor {
        self.cursor
    }

    pub fn snapshot(&self) -> Snapshot {
        Snapshot {
            cursor: self.cursor,
            processors: self.processors,
            cache_size: self.cache_size,
            cache_frames: self.cache_frames,
        }
    }

    /// Bring a freshly opened worker to the state in `snapshot`.
    pub fn restore(&mut self, snapshot: &Snapshot) -> Result<()> {
        self.set_processors(snapshot.processors)?;
        self.set_cache_size(snapshot.cache_size)?;
        self.set_cache_frames(snapshot.cache_frames)?;
        self.set_channel(snapshot.cursor.channel)?;
        self.set_layer(snapshot.cursor.layer)?;
        self.seek_audio(snapshot.cursor.sample)?;
        if self.asset.video_length != NOSEEK_LENGTH {
            self.seek_video(snapshot.cursor.frame)?;
        }
        Ok(())
    }

    /// Close the file in the worker, which then exits. A worker that is
    /// already gone leaves the mirrored asset as the final word.
    pub fn close(self) -> Result<Asset> {
        let mut asset = self.asset.clone();
        match self.handle.call(CLOSE_FILE, &[]) {
            Ok((_, body)) => {
                let lengths: FinalLengths = payload::decode(&body)?;
                asset.audio_length = lengths.audio_length;
                asset.video_length = lengths.video_length;
                Ok(asset)
            }
            Err(e) if e.is_worker_failure() => {
                warn!(pid = self.handle.pid(), "worker gone before close: {e}");
                Ok(asset)
            }
            Err(e) => Err(e),
        }
    }

    fn call(&self, token: i32, body: &[u8]) -> Result<(i64, Vec<u8>)> {
        self.handle.call(token, body)
    }

    fn refresh_memory_usage(&mut self) {
        match self.call(GET_MEMORY_USAGE, &[]) {
            Ok((bytes, _)) => self.memory_usage = bytes.max(0) as usize,
            Err(e) => debug!("memory usage query failed: {e}"),
        }
    }

    pub fn memory_usage(&self) -> usize {
        self.memory_usage
    }

    pub fn set_processors(&mut self, processors: usize) -> Result<()> {
        self.call(SET_PROCESSORS, &payload::encode(&(processors as u64))?)?;
        self.processors = processors;
        Ok(())
    }

    pub fn set_cache_size(&mut self, bytes: usize) -> Result<()> {
        self.call(SET_CACHE, &payload::encode(&(bytes as u64))?)?;
        self.cache_size = bytes;
        Ok(())
    }

    pub fn set_cache_frames(&mut self, enabled: bool) -> Result<()> {
        self.call(SET_CACHE_FRAMES, &payload::encode(&enabled)?)?;
        self.cache_frames = enabled;
        Ok(())
    }

    pub fn purge_cache(&mut self) -> Result<usize> {
        let (freed, _) = self.call(PURGE_CACHE, &[])?;
        let freed = freed.max(0) as usize;
        self.memory_usage = self.memory_usage.saturating_sub(freed);
        Ok(freed)
    }

    pub fn set_channel(&mut self, channel: i32) -> Result<()> {
        self.call(SET_CHANNEL, &payload::encode(&channel)?)?;
        self.cursor.channel = channel;
        Ok(())
    }

    pub fn set_layer(&mut self, layer: i32) -> Result<()> {
        self.call(SET_LAYER, &payload::encode(&layer)?)?;
        self.cursor.layer = layer;
        Ok(())
    }

    // Lengths travel in the payload: NOSEEK_LENGTH does not fit the
    // result value band.
    pub fn audio_length(&mut self) -> Result<i64> {
        let (_, body) = self.call(GET_AUDIO_LENGTH, &[])?;
        self.asset.audio_length = payload::decode(&body)?;
        Ok(self.asset.audio_length)
    }

    pub fn video_length(&mut self) -> Result<i64> {
        let (_, body) = self.call(GET_VIDEO_LENGTH, &[])?;
        self.asset.video_length = payload::decode(&body)?;
        Ok(self.asset.video_length)
    }

    pub fn audio_position(&mut self) -> Result<i64> {
        let (position, _) = self.call(GET_AUDIO_POSITION, &[])?;
        self.cursor.sample = position;
        Ok(position)
    }

    pub fn video_position(&mut self) -> Result<i64> {
        let (position, _) = self.call(GET_VIDEO_POSITION, &[])?;
        self.cursor.frame = position;
        Ok(position)
    }

    pub fn set_audio_position(&mut self, position: i64) -> Result<()> {
        if repositions(self.cursor.normalized_sample, position) {
            self.seek_audio(position)?;
        }
        Ok(())
    }

    fn seek_audio(&mut self, position: i64) -> Result<()> {
        let (landed, _) = self.call(SET_AUDIO_POSITION, &payload::encode(&position)?)?;
        self.cursor.sample = landed;
        self.cursor.normalized_sample = landed;
        Ok(())
    }

    pub fn set_video_position(&mut self, position: i64) -> Result<()> {
        if self.asset.video_length != NOSEEK_LENGTH && self.cursor.frame != position {
            self.seek_video(position)?;
        }
        Ok(())
    }

    fn seek_video(&mut self, position: i64) -> Result<()> {
        let (landed, _) = self.call(SET_VIDEO_POSITION, &payload::encode(&position)?)?;
        self.cursor.frame = landed;
        Ok(())
    }

    /// Shared buffers are filled by the worker in place; heap buffers come
    /// back in the result payload.
    pub fn read_samples(&mut self, buffer: &mut Samples, len: usize) -> Result<()> {
        if len > buffer.len() {
            return Err(Error::Validation(format!(
                "read of {len} samples into a buffer of {}",
                buffer.len()
            )));
        }
        let mut out = ByteWriter::new();
        out.put_bool(buffer.is_shared());
        if buffer.is_shared() {
            buffer.encode_into(&mut out);
        }
        out.put_u64(len as u64);

        let result = self.call(READ_SAMPLES, &out.into_inner()).and_then(|(position, body)| {
            if !buffer.is_shared() {
                let samples = ByteReader::new(&body).f64_vec()?;
                let n = samples.len().min(len);
                buffer.as_mut_slice()[..n].copy_from_slice(&samples[..n]);
            }
            Ok(position)
        });
        match result {
            Ok(position) => {
                self.cursor.sample = position;
                self.cursor.normalized_sample = position;
                self.refresh_memory_usage();
                Ok(())
            }
            // The worker advanced before failing; a dead worker did not.
            Err(e) if !e.is_worker_failure() => {
                self.cursor.sample += len as i64;
                self.cursor.normalized_sample += len as i64;
                Err(e)
            }
            Err(e) => Err(e),
        }
    }

    pub fn read_frame(&mut self, frame: &mut VideoFrame) -> Result<()> {
        let mut out = ByteWriter::new();
        let in_place = frame.is_shared();
        if in_place {
            frame.encode_into(&mut out);
        } else {
            frame.encode_shape_into(&mut out);
        }

        let scratch = &mut self.scratch;
        let (position, body) = self.handle.call_with(READ_FRAME, &out.into_inner(), |tag, body| {
            if tag != FILE_READ_TEMP {
                warn!(tag, "unexpected callback while reading a frame");
                return Vec::new();
            }
            match lend_scratch(scratch, body) {
                Ok(descriptor) => descriptor,
                Err(e) => {
                    warn!("cannot lend a scratch frame: {e}");
                    Vec::new()
                }
            }
        })?;

        let mut input = ByteReader::new(&body);
        if frame.color_model() == ColorModel::Compressed {
            frame.apply_metadata(&mut input)?;
            let data = input.bytes()?;
            frame.set_compressed(data);
        } else {
            if !in_place {
                let scratch = self
                    .scratch
                    .as_ref()
                    .filter(|s| s.same_shape(frame))
                    .ok_or_else(|| Error::Protocol("worker did not use the scratch frame".into()))?;
                frame.data_mut().copy_from_slice(scratch.data());
            }
            frame.apply_metadata(&mut input)?;
        }
        self.cursor.frame = position;
        self.refresh_memory_usage();
        Ok(())
    }

    pub fn write_samples(&mut self, channels: &[Samples], len: usize) -> Result<()> {
        let mut out = ByteWriter::new();
        out.put_u32(channels.len() as u32);
        for channel in channels {
            channel.encode_into(&mut out);
        }
        out.put_u64(len as u64);
        self.call(WRITE_SAMPLES, &out.into_inner())?;
        self.cursor.sample += len as i64;
        self.cursor.normalized_sample += len as i64;
        self.asset.audio_length += len as i64;
        Ok(())
    }

    pub fn write_frames(&mut self, layers: &[Vec<VideoFrame>], len: usize) -> Result<()> {
        let mut out = ByteWriter::new();
        out.put_u32(layers.len() as u32).put_u32(len as u32);
        for frames in layers {
            let run = frames.get(..len).ok_or_else(|| {
                Error::Validation(format!("write of {len} frames from a layer of {}", frames.len()))
            })?;
            for frame in run {
                frame.encode_into(&mut out);
            }
        }
        self.call(WRITE_FRAMES, &out.into_inner())?;
        self.cursor.frame += len as i64;
        self.asset.video_length += len as i64;
        Ok(())
    }

    pub fn write_compressed_frame(&mut self, frame: &VideoFrame) -> Result<()> {
        let mut out = ByteWriter::new();
        out.put_u32(1).put_u32(1);
        frame.encode_into(&mut out);
        self.call(WRITE_FRAMES, &out.into_inner())?;
        self.cursor.frame += 1;
        self.asset.video_length += 1;
        Ok(())
    }

    pub fn can_copy_from(&self, source: &Asset, position: i64, width: i32, height: i32) -> Result<bool> {
        let query = CopyQuery {
            position,
            width,
            height,
            asset_xml: source.to_xml()?,
        };
        let (answer, _) = self.call(CAN_COPY_FROM, &payload::encode(&query)?)?;
        Ok(answer != 0)
    }

    pub fn colormodel_supported(&self, requested: ColorModel) -> Result<ColorModel> {
        let (code, _) = self.call(COLORMODEL_SUPPORTED, &payload::encode(&requested.code())?)?;
        let code = i32::try_from(code)
            .map_err(|_| Error::Protocol(format!("color model code {code} out of range")))?;
        ColorModel::from_code(code)
    }

    pub fn waveform_index(&self, stream: usize) -> Result<Option<WaveformIndex>> {
        let mut out = ByteWriter::new();
        out.put_u64(stream as u64);
        let (found, body) = self.call(GET_WAVEFORM_INDEX, &out.into_inner())?;
        if found == 0 {
            return Ok(None);
        }
        WaveformIndex::decode_from(&mut ByteReader::new(&body), true).map(Some)
    }

    pub fn start_audio_thread(&mut self, buffer_size: usize, ring_buffers: usize) -> Result<()> {
        if self.audio_ring.is_some() {
            return Err(Error::state("audio writer is already running"));
        }
        let spec = AudioThreadSpec {
            buffer_size: buffer_size as u64,
            ring_buffers: ring_buffers as u32,
        };
        let (_, body) = self.call(START_AUDIO_THREAD, &payload::encode(&spec)?)?;
        let mut input = ByteReader::new(&body);
        let ring = input.u32()? as usize;
        let channels = input.u32()? as usize;
        let mut buffers = Vec::with_capacity(ring);
        for _ in 0..ring {
            let mut buffer = Vec::with_capacity(channels);
            for _ in 0..channels {
                buffer.push(Samples::decode_from(&mut input)?);
            }
            buffers.push(buffer);
        }
        self.audio_ring = Some(Ring {
            buffers,
            current: None,
        });
        Ok(())
    }

    pub fn start_video_thread(
        &mut self,
        buffer_size: usize,
        color_model: ColorModel,
        ring_buffers: usize,
        compressed: bool,
    ) -> Result<()> {
        if self.video_ring.is_some() {
            return Err(Error::state("video writer is already running"));
        }
        let spec = VideoThreadSpec {
            buffer_size: buffer_size as u32,
            color_model: color_model.code(),
            ring_buffers: ring_buffers as u32,
            compressed,
        };
        let (_, body) = self.call(START_VIDEO_THREAD, &payload::encode(&spec)?)?;
        let mut input = ByteReader::new(&body);
        let ring = input.u32()? as usize;
        let layers = input.u32()? as usize;
        let frames = input.u32()? as usize;
        let mut buffers = Vec::with_capacity(ring);
        for _ in 0..ring {
            let mut buffer = Vec::with_capacity(layers);
            for _ in 0..layers {
                let mut run = Vec::with_capacity(frames);
                for _ in 0..frames {
                    run.push(VideoFrame::decode_from(&mut input)?);
                }
                buffer.push(run);
            }
            buffers.push(buffer);
        }
        self.video_ring = Some(Ring {
            buffers,
            current: None,
        });
        Ok(())
    }

    pub fn stop_audio_thread(&mut self) -> Result<()> {
        if self.audio_ring.take().is_some() {
            self.call(STOP_AUDIO_THREAD, &[])?;
        }
        Ok(())
    }

    pub fn stop_video_thread(&mut self) -> Result<()> {
        if self.video_ring.take().is_some() {
            self.call(STOP_VIDEO_THREAD, &[])?;
        }
        Ok(())
    }

    pub fn audio_buffer(&mut self) -> Result<BufferGuard<'_, AudioBuffer>> {
        let ring = self
            .audio_ring
            .as_mut()
            .ok_or_else(|| Error::state("audio writer is not running"))?;
        let index = match ring.current {
            Some(index) => index,
            None => {
                let (index, _) = self.handle.call(GET_AUDIO_BUFFER, &[])?;
                let index = ring_index(index, ring.buffers.len())?;
                ring.current = Some(index);
                index
            }
        };
        Ok(BufferGuard::Mapped(&mut ring.buffers[index]))
    }

    pub fn video_buffer(&mut self) -> Result<BufferGuard<'_, VideoBuffer>> {
        let ring = self
            .video_ring
            .as_mut()
            .ok_or_else(|| Error::state("video writer is not running"))?;
        let index = match ring.current {
            Some(index) => index,
            None => {
                let (index, _) = self.handle.call(GET_VIDEO_BUFFER, &[])?;
                let index = ring_index(index, ring.buffers.len())?;
                ring.current = Some(index);
                index
            }
        };
        Ok(BufferGuard::Mapped(&mut ring.buffers[index]))
    }

    pub fn write_audio_buffer(&mut self, len: usize) -> Result<()> {
        let ring = self
            .audio_ring
            .as_mut()
            .ok_or_else(|| Error::state("audio writer is not running"))?;
        if ring.current.take().is_none() {
            return Err(Error::state("no audio buffer was acquired"));
        }
        self.handle.call(WRITE_AUDIO_BUFFER, &(len as u64).to_le_bytes())?;
        self.cursor.sample += len as i64;
        self.cursor.normalized_sample += len as i64;
        self.asset.audio_length += len as i64;
        Ok(())
    }

    /// Frame metadata is per process, so it travels with the command.
    pub fn write_video_buffer(&mut self, len: usize) -> Result<()> {
        let ring = self
            .video_ring
            .as_mut()
            .ok_or_else(|| Error::state("video writer is not running"))?;
        let index = ring
            .current
            .take()
            .ok_or_else(|| Error::state("no video buffer was acquired"))?;
        let mut out = ByteWriter::new();
        out.put_u64(len as u64);
        for frames in &ring.buffers[index] {
            for frame in frames.iter().take(len) {
                frame.encode_metadata_into(&mut out);
                if frame.color_model() == ColorModel::Compressed {
                    out.put_bytes(frame.compressed_data());
                }
            }
        }
        self.handle.call(WRITE_VIDEO_BUFFER, &out.into_inner())?;
        self.cursor.frame += len as i64;
        self.asset.video_length += len as i64;
        Ok(())
    }
}

fn ring_index(index: i64, len: usize) -> Result<usize> {
    usize::try_from(index)
        .ok()
        .filter(|&i| i < len)
        .ok_or_else(|| Error::Protocol(format!("worker returned buffer {index} of {len}")))
}

/// Answer `FILE_READ_TEMP`: reuse the scratch frame when the requested
/// shape matches, otherwise allocate a new one, and return its descriptor.
fn lend_scratch(scratch: &mut Option<VideoFrame>, request: &[u8]) -> Result<Vec<u8>> {
    let mut input = ByteReader::new(request);
    let width = input.u32()? as usize;
    let height = input.u32()? as usize;
    let model = ColorModel::from_code(input.i32()?)?;
    if !scratch.as_ref().is_some_and(|s| s.matches(model, width, height)) {
        *scratch = Some(VideoFrame::new_shared(width, height, model)?);
    }
    let mut out = ByteWriter::new();
    if let Some(frame) = scratch {
        frame.encode_into(&mut out);
    }
    Ok(out.into_inner())
}
