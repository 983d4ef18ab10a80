//! The in-process path: a backend driven directly, plus the frame cache
//! and writer threads that sit in front of it.

use mf_core::{Asset, ByteReader, ByteWriter, Error, Preferences, ProgressSink, Result, NOSEEK_LENGTH};
use mf_decode::{DecoderBackend, DecoderRegistry, FrameRead, OpenRequest, WaveformIndex};
use mf_media::{transfer, ColorModel, FrameCache, Samples, VideoFrame};
use parking_lot::Mutex;
use std::sync::Arc;
use tracing::debug;

use crate::thread::{BufferGuard, FileThread};

/// Ring of audio buffers: one sample buffer per channel.
pub type AudioBuffer = Vec<Samples>;
/// Ring of video buffers: per layer, a run of frames.
pub type VideoBuffer = Vec<Vec<VideoFrame>>;

/// Read and write positions of an open file.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub(crate) struct Cursor {
    pub sample: i64,
    pub normalized_sample: i64,
    pub frame: i64,
    pub channel: i32,
    pub layer: i32,
}

/// Audio seeks closer than this are treated as sequential access. Video
/// positioning is always exact.
pub(crate) fn repositions(current: i64, target: i64) -> bool {
    (target - current).abs() > 1
}

/// Everything a write touches. Held behind one mutex, which doubles as the
/// write lock shared with the writer threads.
pub(crate) struct FileState {
    pub backend: Box<dyn DecoderBackend>,
    pub asset: Asset,
    pub cursor: Cursor,
}

impl FileState {
    fn write_samples(&mut self, channels: &[Samples], len: usize) -> Result<()> {
        let mut slices = Vec::with_capacity(channels.len());
        for channel in channels {
            let data = channel.as_slice();
            if data.len() < len {
                return Err(Error::Validation(format!(
                    "write of {len} samples from a buffer of {}",
                    data.len()
                )));
            }
            slices.push(&data[..len]);
        }
        self.backend.write_samples(&slices)?;
        let written = len as i64;
        self.cursor.sample += written;
        self.cursor.normalized_sample += written;
        self.asset.audio_length += written;
        Ok(())
    }

    fn write_frames(&mut self, layers: &[Vec<VideoFrame>], len: usize) -> Result<()> {
        let compressed = layers
            .first()
            .and_then(|frames| frames.first())
            .is_some_and(|frame| frame.color_model() == ColorModel::Compressed);
        if compressed {
            for frame in layers[0].iter().take(len) {
                self.write_compressed_frame(frame)?;
            }
            return Ok(());
        }

        for frames in layers {
            if frames.len() < len {
                return Err(Error::Validation(format!(
                    "write of {len} frames from a layer of {}",
                    frames.len()
                )));
            }
            let refs: Vec<&VideoFrame> = frames[..len].iter().collect();
            self.backend.write_frames(&refs)?;
        }
        self.cursor.frame += len as i64;
        self.asset.video_length += len as i64;
        Ok(())
    }

    fn write_compressed_frame(&mut self, frame: &VideoFrame) -> Result<()> {
        self.backend.write_compressed_frame(frame)?;
        self.cursor.frame += 1;
        self.asset.video_length += 1;
        Ok(())
    }
}

pub(crate) struct LocalFile {
    state: Arc<Mutex<FileState>>,
    cache: FrameCache,
    cache_frames: bool,
    /// Decode target when the backend cannot produce the requested model.
    temp_frame: Option<VideoFrame>,
    /// Ring buffers live in shared memory so an editor can fill them.
    shared_buffers: bool,
    audio_thread: Option<FileThread<AudioBuffer>>,
    video_thread: Option<FileThread<VideoBuffer>>,
}

impl LocalFile {
    pub fn open(
        registry: &DecoderRegistry,
        prefs: &Preferences,
        asset: &mut Asset,
        read: bool,
        write: bool,
        progress: &mut dyn ProgressSink,
        shared_buffers: bool,
    ) -> Result<Self> {
        let kind = registry.resolve(asset, read, write)?;
        let mut backend = kind.instantiate();
        let mut opened = asset.clone();
        backend.open(OpenRequest {
            asset: &mut opened,
            prefs,
            read,
            write,
            progress,
        })?;
        backend.set_processors(prefs.processors);
        debug!(backend = %kind, path = %opened.path.display(), "backend opened");
        *asset = opened.clone();

        Ok(Self {
            state: Arc::new(Mutex::new(FileState {
                backend,
                asset: opened,
                cursor: Cursor::default(),
            })),
            cache: FrameCache::new(prefs.cache.cache_size),
            cache_frames: prefs.cache.cache_frames,
            temp_frame: None,
            shared_buffers,
            audio_thread: None,
            video_thread: None,
        })
    }

    /// Stop the writers, flush the backend and hand back the final asset.
    pub fn close(mut self) -> Result<Asset> {
        let audio = self.audio_thread.take().map(FileThread::stop).transpose();
        let video = self.video_thread.take().map(FileThread::stop).transpose();
        let mut state = self.state.lock();
        let closed = state.backend.close();
        let asset = state.asset.clone();
        audio?;
        video?;
        closed?;
        Ok(asset)
    }

    pub fn asset(&self) -> Asset {
        self.state.lock().asset.clone()
    }

    pub fn set_processors(&mut self, processors: usize) {
        self.state.lock().backend.set_processors(processors);
    }

    pub fn set_cache_size(&mut self, bytes: usize) {
        self.cache.set_max_bytes(bytes);
    }

    pub fn set_cache_frames(&mut self, enabled: bool) {
        self.cache_frames = enabled;
        if !enabled {
            self.cache.remove_all();
        }
    }

    pub fn purge_cache(&mut self) -> usize {
        let freed = self.state.lock().backend.purge_cache();
        if freed > 0 {
            return freed;
        }
        self.cache.delete_oldest()
    }

    pub fn memory_usage(&self) -> usize {
        let temp = self.temp_frame.as_ref().map_or(0, VideoFrame::byte_len);
        temp + self.state.lock().backend.memory_usage() + self.cache.memory_usage()
    }

    pub fn cursor(&self) -> Cursor {
        self.state.lock().cursor
    }

    pub fn set_channel(&mut self, channel: i32) {
        self.state.lock().cursor.channel = channel;
    }

    pub fn set_layer(&mut self, layer: i32) {
        self.state.lock().cursor.layer = layer;
    }

    pub fn audio_length(&self) -> i64 {
        self.state.lock().asset.audio_length
    }

    pub fn video_length(&self) -> i64 {
        self.state.lock().asset.video_length
    }

    pub fn set_audio_position(&mut self, position: i64) -> Result<()> {
        let current = self.state.lock().cursor.normalized_sample;
        if repositions(current, position) {
            self.seek_audio(position)?;
        }
        Ok(())
    }

    /// Move the audio cursor to exactly `position`.
    pub fn seek_audio(&mut self, position: i64) -> Result<()> {
        let mut state = self.state.lock();
        state.backend.set_audio_position(position)?;
        state.cursor.sample = position;
        state.cursor.normalized_sample = position;
        Ok(())
    }

    pub fn set_video_position(&mut self, position: i64) -> Result<()> {
        let (current, length) = {
            let state = self.state.lock();
            (state.cursor.frame, state.asset.video_length)
        };
        if length != NOSEEK_LENGTH && current != position {
            self.seek_video(position)?;
        }
        Ok(())
    }

    /// Move the video cursor to exactly `position`.
    pub fn seek_video(&mut self, position: i64) -> Result<()> {
        let mut state = self.state.lock();
        if state.asset.video_length == NOSEEK_LENGTH {
            return Ok(());
        }
        state.backend.set_video_position(position)?;
        state.cursor.frame = position;
        Ok(())
    }

    /// Read `len` samples of the current channel. The cursor advances by
    /// `len` whether or not the backend succeeded.
    pub fn read_samples(&mut self, buffer: &mut Samples, len: usize) -> Result<()> {
        if len > buffer.len() {
            return Err(Error::Validation(format!(
                "read of {len} samples into a buffer of {}",
                buffer.len()
            )));
        }
        let mut state = self.state.lock();
        let FileState { backend, cursor, .. } = &mut *state;
        let result = backend.read_samples(&mut buffer.as_mut_slice()[..len], cursor.sample, cursor.channel);
        cursor.sample += len as i64;
        cursor.normalized_sample += len as i64;
        result
    }

    /// Read the frame at the cursor. A cache hit leaves the cursor where it
    /// is; a decoded frame is cached and advances it by one.
    pub fn read_frame(&mut self, frame: &mut VideoFrame) -> Result<()> {
        let mut state = self.state.lock();
        let FileState {
            backend,
            asset,
            cursor,
        } = &mut *state;
        let position = cursor.frame;
        let layer = cursor.layer;
        let frame_rate = asset.frame_rate;
        frame.position = position;

        if self.cache_frames && self.cache.get_frame(frame, layer, frame_rate) {
            return Ok(());
        }

        let requested = frame.color_model();
        let supported = backend.colormodel_supported(requested);
        let cache = self.cache_frames.then_some(&mut self.cache);
        if supported != requested && requested != ColorModel::Compressed {
            let (width, height) = (frame.width(), frame.height());
            let mut temp = match self.temp_frame.take() {
                Some(temp) if temp.matches(supported, width, height) => temp,
                _ => VideoFrame::new(width, height, supported),
            };
            temp.position = position;
            let decoded = backend
                .read_frame(FrameRead {
                    frame: &mut temp,
                    position,
                    layer,
                    cache,
                    frame_rate,
                })
                .and_then(|()| transfer(temp.data(), supported, frame.data_mut(), requested, width, height));
            if decoded.is_ok() {
                frame.copy_metadata(&temp);
            }
            self.temp_frame = Some(temp);
            decoded?;
        } else {
            backend.read_frame(FrameRead {
                frame: &mut *frame,
                position,
                layer,
                cache,
                frame_rate,
            })?;
        }

        if self.cache_frames && requested != ColorModel::Compressed {
            self.cache.put_frame(frame, layer, frame_rate);
        }
        cursor.frame += 1;
        Ok(())
    }

    pub fn write_samples(&mut self, channels: &[Samples], len: usize) -> Result<()> {
        self.state.lock().write_samples(channels, len)
    }

    pub fn write_frames(&mut self, layers: &[Vec<VideoFrame>], len: usize) -> Result<()> {
        self.state.lock().write_frames(layers, len)
    }

    pub fn write_compressed_frame(&mut self, frame: &VideoFrame) -> Result<()> {
        self.state.lock().write_compressed_frame(frame)
    }

    pub fn can_copy_from(&self, source: &Asset, position: i64, width: i32, height: i32) -> bool {
        self.state
            .lock()
            .backend
            .can_copy_from(source, position, width, height)
    }

    pub fn colormodel_supported(&self, requested: ColorModel) -> ColorModel {
        self.state.lock().backend.colormodel_supported(requested)
    }

    pub fn waveform_index(&self, stream: usize) -> Option<WaveformIndex> {
        self.state.lock().backend.waveform_index(stream)
    }

    pub fn start_audio_thread(&mut self, buffer_size: usize, ring_buffers: usize) -> Result<()> {
        if self.audio_thread.is_some() {
            return Err(Error::state("audio writer is already running"));
        }
        let channels = self.state.lock().asset.channels.max(1) as usize;
        let mut ring = Vec::with_capacity(ring_buffers);
        for _ in 0..ring_buffers {
            let mut buffer = Vec::with_capacity(channels);
            for _ in 0..channels {
                buffer.push(if self.shared_buffers {
                    Samples::new_shared(buffer_size)?
                } else {
                    Samples::new(buffer_size)
                });
            }
            ring.push(buffer);
        }
        let state = Arc::clone(&self.state);
        self.audio_thread = Some(FileThread::start("audio", ring, move |buffer: &AudioBuffer, len| {
            state.lock().write_samples(buffer, len)
        })?);
        Ok(())
    }

    pub fn start_video_thread(
        &mut self,
        buffer_size: usize,
        color_model: ColorModel,
        ring_buffers: usize,
        compressed: bool,
    ) -> Result<()> {
        if self.video_thread.is_some() {
            return Err(Error::state("video writer is already running"));
        }
        let (layers, width, height) = {
            let state = self.state.lock();
            let asset = &state.asset;
            (asset.layers.max(1) as usize, asset.width.max(0) as usize, asset.height.max(0) as usize)
        };
        let mut ring = Vec::with_capacity(ring_buffers);
        for _ in 0..ring_buffers {
            let mut buffer = Vec::with_capacity(layers);
            for _ in 0..layers {
                let mut frames = Vec::with_capacity(buffer_size);
                for _ in 0..buffer_size {
                    frames.push(if compressed {
                        VideoFrame::compressed(&[])
                    } else if self.shared_buffers {
                        VideoFrame::new_shared(width, height, color_model)?
                    } else {
                        VideoFrame::new(width, height, color_model)
                    });
                }
                buffer.push(frames);
            }
            ring.push(buffer);
        }
        let state = Arc::clone(&self.state);
        self.video_thread = Some(FileThread::start("video", ring, move |buffer: &VideoBuffer, len| {
            state.lock().write_frames(buffer, len)
        })?);
        Ok(())
    }

    pub fn stop_audio_thread(&mut self) -> Result<()> {
        match self.audio_thread.take() {
            Some(thread) => thread.stop(),
            None => Ok(()),
        }
    }

    pub fn stop_video_thread(&mut self) -> Result<()> {
        match self.video_thread.take() {
            Some(thread) => thread.stop(),
            None => Ok(()),
        }
    }

    pub fn acquire_audio_buffer(&mut self) -> Result<usize> {
        self.audio_thread
            .as_mut()
            .ok_or_else(|| Error::state("audio writer is not running"))?
            .acquire()
    }

    pub fn acquire_video_buffer(&mut self) -> Result<usize> {
        self.video_thread
            .as_mut()
            .ok_or_else(|| Error::state("video writer is not running"))?
            .acquire()
    }

    pub fn audio_buffer(&mut self) -> Result<BufferGuard<'_, AudioBuffer>> {
        let thread = self
            .audio_thread
            .as_mut()
            .ok_or_else(|| Error::state("audio writer is not running"))?;
        thread.acquire()?;
        thread
            .current()
            .map(BufferGuard::Local)
            .ok_or_else(|| Error::state("no audio buffer acquired"))
    }

    pub fn video_buffer(&mut self) -> Result<BufferGuard<'_, VideoBuffer>> {
        let thread = self
            .video_thread
            .as_mut()
            .ok_or_else(|| Error::state("video writer is not running"))?;
        thread.acquire()?;
        thread
            .current()
            .map(BufferGuard::Local)
            .ok_or_else(|| Error::state("no video buffer acquired"))
    }

    pub fn write_audio_buffer(&mut self, len: usize) -> Result<()> {
        self.audio_thread
            .as_mut()
            .ok_or_else(|| Error::state("audio writer is not running"))?
            .submit(len)
    }

    pub fn write_video_buffer(&mut self, len: usize) -> Result<()> {
        self.video_thread
            .as_mut()
            .ok_or_else(|| Error::state("video writer is not running"))?
            .submit(len)
    }

    /// `[u32 ring][u32 channels]` then every buffer's descriptor.
    pub fn describe_audio_ring(&self, out: &mut ByteWriter) -> Result<()> {
        let thread = self
            .audio_thread
            .as_ref()
            .ok_or_else(|| Error::state("audio writer is not running"))?;
        let channels = self.state.lock().asset.channels.max(1) as u32;
        out.put_u32(thread.buffer_count() as u32).put_u32(channels);
        thread.each_buffer(|buffer| {
            for samples in buffer {
                samples.encode_into(out);
            }
        });
        Ok(())
    }

    /// `[u32 ring][u32 layers][u32 frames]` then every frame's descriptor.
    pub fn describe_video_ring(&self, out: &mut ByteWriter) -> Result<()> {
        let thread = self
            .video_thread
            .as_ref()
            .ok_or_else(|| Error::state("video writer is not running"))?;
        let mut header = None;
        thread.each_buffer(|buffer| {
            header.get_or_insert((buffer.len(), buffer.first().map_or(0, Vec::len)));
        });
        let (layers, frames) = header.unwrap_or_default();
        out.put_u32(thread.buffer_count() as u32)
            .put_u32(layers as u32)
            .put_u32(frames as u32);
        thread.each_buffer(|buffer| {
            for frame in buffer.iter().flatten() {
                frame.encode_into(out);
            }
        });
        Ok(())
    }

    /// Apply the per-frame state an editor wrote into its copy of the
    /// current video buffer: `[u64 len]` then, per layer and frame, the
    /// metadata and (for compressed frames) the payload.
    pub fn apply_video_buffer_state(&mut self, input: &mut ByteReader<'_>) -> Result<usize> {
        let len = input.u64()? as usize;
        let thread = self
            .video_thread
            .as_mut()
            .ok_or_else(|| Error::state("video writer is not running"))?;
        let mut buffer = thread
            .current()
            .ok_or_else(|| Error::state("no video buffer acquired"))?;
        for frames in buffer.iter_mut() {
            for frame in frames.iter_mut().take(len) {
                frame.apply_metadata(input)?;
                if frame.color_model() == ColorModel::Compressed {
                    let data = input.bytes()?;
                    frame.set_compressed(data);
                }
            }
        }
        Ok(len)
    }
}
