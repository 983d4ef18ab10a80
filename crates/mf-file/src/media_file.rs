//! The editor-facing file handle.
//!
//! A [`MediaFile`] drives a backend either in this process or, when
//! isolation is on, in a worker process. Callers see the same operations
//! and the same positions either way. When a worker dies under a
//! read-only file, the next call that notices starts a replacement,
//! reopens the file there and retries once.

use mf_core::{
    Asset, Error, LogProgress, Preferences, ProgressSink, Result, MIN_CACHEITEM_SIZE,
};
use mf_decode::{DecoderRegistry, WaveformIndex};
use mf_media::{ColorModel, Samples, VideoFrame};
use std::sync::Arc;
use std::time::Duration;
use tracing::{info, warn};

use crate::handle::FileWorkerHandle;
use crate::local::{AudioBuffer, LocalFile, VideoBuffer};
use crate::pool::WorkerPool;
use crate::remote::RemoteFile;
use crate::thread::BufferGuard;

/// How a file was opened, kept for reopening it in a new worker.
#[derive(Debug, Clone)]
struct OpenParams {
    prefs: Preferences,
    asset: Asset,
    read: bool,
    write: bool,
}

enum Backing {
    Closed,
    Local(LocalFile),
    Remote(RemoteFile),
}

fn not_open() -> Error {
    Error::state("no file is open")
}

pub struct MediaFile {
    registry: DecoderRegistry,
    pool: Option<Arc<WorkerPool>>,
    /// Set inside a worker, where every file is local.
    in_worker: bool,
    opened: Option<OpenParams>,
    backing: Backing,
}

impl Default for MediaFile {
    fn default() -> Self {
        Self::new()
    }
}

impl MediaFile {
    pub fn new() -> Self {
        Self::with_registry(DecoderRegistry::default())
    }

    pub fn with_registry(registry: DecoderRegistry) -> Self {
        Self {
            registry,
            pool: None,
            in_worker: false,
            opened: None,
            backing: Backing::Closed,
        }
    }

    /// Fork isolated workers through `pool` when preferences ask for it.
    pub fn with_pool(mut self, pool: Arc<WorkerPool>) -> Self {
        self.pool = Some(pool);
        self
    }

    pub(crate) fn for_worker(registry: DecoderRegistry) -> Self {
        let mut file = Self::with_registry(registry);
        file.in_worker = true;
        file
    }

    pub fn is_open(&self) -> bool {
        !matches!(self.backing, Backing::Closed)
    }

    pub fn is_remote(&self) -> bool {
        matches!(self.backing, Backing::Remote(_))
    }

    /// Pid of the worker serving this file, if isolated.
    pub fn worker_pid(&self) -> Option<i32> {
        match &self.backing {
            Backing::Remote(file) => Some(file.pid()),
            _ => None,
        }
    }

    /// The open file's metadata.
    pub fn asset(&self) -> Option<Asset> {
        match &self.backing {
            Backing::Closed => None,
            Backing::Local(file) => Some(file.asset()),
            Backing::Remote(file) => Some(file.asset().clone()),
        }
    }

    /// Open with progress reported through `tracing`.
    pub fn open_file(
        &mut self,
        prefs: &Preferences,
        asset: &mut Asset,
        read: bool,
        write: bool,
    ) -> Result<()> {
        self.open_file_with_progress(prefs, asset, read, write, &mut LogProgress::default())
    }

    /// Resolve a backend for `asset` and open it. On success the asset
    /// holds the file's formats and lengths.
    pub fn open_file_with_progress(
        &mut self,
        prefs: &Preferences,
        asset: &mut Asset,
        read: bool,
        write: bool,
        progress: &mut dyn ProgressSink,
    ) -> Result<()> {
        if self.is_open() {
            return Err(Error::state(format!(
                "cannot open {}: a file is already open",
                asset.path.display()
            )));
        }

        let backing = if prefs.isolation.enabled && !self.in_worker {
            let handle = self.spawn_worker(prefs)?;
            Backing::Remote(RemoteFile::open(handle, prefs, asset, read, write, progress)?)
        } else {
            Backing::Local(LocalFile::open(
                &self.registry,
                prefs,
                asset,
                read,
                write,
                progress,
                self.in_worker,
            )?)
        };
        info!(
            path = %asset.path.display(),
            format = %asset.format,
            remote = matches!(backing, Backing::Remote(_)),
            "file opened"
        );
        self.backing = backing;
        self.opened = Some(OpenParams {
            prefs: prefs.clone(),
            asset: asset.clone(),
            read,
            write,
        });
        Ok(())
    }

    fn spawn_worker(&self, prefs: &Preferences) -> Result<FileWorkerHandle> {
        match &self.pool {
            Some(pool) if prefs.isolation.use_pool => pool.new_filefork(),
            _ => FileWorkerHandle::spawn(
                self.registry.clone(),
                Duration::from_millis(prefs.isolation.read_timeout_ms.max(1)),
            ),
        }
    }

    /// Close the file and return its final metadata. Closing a closed
    /// handle returns `None`.
    pub fn close_file(&mut self) -> Result<Option<Asset>> {
        self.opened = None;
        match std::mem::replace(&mut self.backing, Backing::Closed) {
            Backing::Closed => Ok(None),
            Backing::Local(file) => file.close().map(Some),
            Backing::Remote(file) => file.close().map(Some),
        }
    }

    pub(crate) fn local(&mut self) -> Result<&mut LocalFile> {
        match &mut self.backing {
            Backing::Local(file) => Ok(file),
            Backing::Remote(_) => Err(Error::state("file is served by a worker")),
            Backing::Closed => Err(not_open()),
        }
    }

    /// Run `local` or `remote` against the open file.
    fn dispatch<T>(
        &mut self,
        local: impl FnOnce(&mut LocalFile) -> Result<T>,
        remote: impl FnMut(&mut RemoteFile) -> Result<T>,
    ) -> Result<T> {
        match &mut self.backing {
            Backing::Local(file) => local(file),
            Backing::Closed => Err(not_open()),
            Backing::Remote(_) => self.with_remote(remote),
        }
    }

    /// A remote call that fails because its worker died is retried once
    /// on a new worker.
    fn with_remote<T>(&mut self, mut remote: impl FnMut(&mut RemoteFile) -> Result<T>) -> Result<T> {
        let first = match &mut self.backing {
            Backing::Remote(file) => remote(file),
            _ => return Err(not_open()),
        };
        match first {
            Err(e) if e.is_worker_failure() && self.can_recover() => {
                warn!("{e}; reopening in a new worker");
                self.recover()?;
                match &mut self.backing {
                    Backing::Remote(file) => remote(file),
                    _ => Err(not_open()),
                }
            }
            other => other,
        }
    }

    fn can_recover(&self) -> bool {
        let writing = self.opened.as_ref().map_or(true, |params| params.write);
        match &self.backing {
            Backing::Remote(file) => !writing && !file.worker_running(),
            _ => false,
        }
    }

    /// Replace a dead worker and put the file back where it was.
    fn recover(&mut self) -> Result<()> {
        let params = self.opened.clone().ok_or_else(not_open)?;
        let Backing::Remote(dead) = std::mem::replace(&mut self.backing, Backing::Closed) else {
            return Err(not_open());
        };
        let snapshot = dead.snapshot();
        let dead_pid = dead.pid();
        drop(dead);

        let handle = self.spawn_worker(&params.prefs)?;
        let mut asset = params.asset.clone();
        let mut file = RemoteFile::open(
            handle,
            &params.prefs,
            &mut asset,
            params.read,
            params.write,
            &mut LogProgress::default(),
        )?;
        file.restore(&snapshot)?;
        info!(
            path = %asset.path.display(),
            old = dead_pid,
            new = file.pid(),
            "file reopened in a new worker"
        );
        self.backing = Backing::Remote(file);
        Ok(())
    }

    pub fn set_processors(&mut self, processors: usize) -> Result<()> {
        self.dispatch(
            |file| {
                file.set_processors(processors);
                Ok(())
            },
            |file| file.set_processors(processors),
        )
    }

    /// Byte budget of the frame cache.
    pub fn set_cache_size(&mut self, bytes: usize) -> Result<()> {
        self.dispatch(
            |file| {
                file.set_cache_size(bytes);
                Ok(())
            },
            |file| file.set_cache_size(bytes),
        )
    }

    pub fn set_cache_frames(&mut self, enabled: bool) -> Result<()> {
        self.dispatch(
            |file| {
                file.set_cache_frames(enabled);
                Ok(())
            },
            |file| file.set_cache_frames(enabled),
        )
    }

    /// Free decoder buffers, or failing that the oldest cached frame.
    /// Returns the bytes freed.
    pub fn purge_cache(&mut self) -> Result<usize> {
        self.dispatch(|file| Ok(file.purge_cache()), RemoteFile::purge_cache)
    }

    /// Bytes this file holds, never less than [`MIN_CACHEITEM_SIZE`].
    pub fn get_memory_usage(&self) -> usize {
        let usage = match &self.backing {
            Backing::Closed => 0,
            Backing::Local(file) => file.memory_usage(),
            Backing::Remote(file) => file.memory_usage(),
        };
        usage.max(MIN_CACHEITEM_SIZE)
    }

    pub fn set_channel(&mut self, channel: i32) -> Result<()> {
        self.dispatch(
            |file| {
                file.set_channel(channel);
                Ok(())
            },
            |file| file.set_channel(channel),
        )
    }

    pub fn channel(&self) -> i32 {
        self.cursor().map_or(0, |cursor| cursor.channel)
    }

    pub fn set_layer(&mut self, layer: i32) -> Result<()> {
        self.dispatch(
            |file| {
                file.set_layer(layer);
                Ok(())
            },
            |file| file.set_layer(layer),
        )
    }

    pub fn layer(&self) -> i32 {
        self.cursor().map_or(0, |cursor| cursor.layer)
    }

    fn cursor(&self) -> Option<crate::local::Cursor> {
        match &self.backing {
            Backing::Closed => None,
            Backing::Local(file) => Some(file.cursor()),
            Backing::Remote(file) => Some(file.cursor()),
        }
    }

    /// Samples per channel, or -1 when unknown.
    pub fn get_audio_length(&mut self) -> Result<i64> {
        let length = self.dispatch(|file| Ok(file.audio_length()), RemoteFile::audio_length)?;
        Ok(if length > 0 { length } else { -1 })
    }

    /// Frames, or -1 when unknown.
    pub fn get_video_length(&mut self) -> Result<i64> {
        let length = self.dispatch(|file| Ok(file.video_length()), RemoteFile::video_length)?;
        Ok(if length > 0 { length } else { -1 })
    }

    pub fn get_audio_position(&mut self) -> Result<i64> {
        self.dispatch(|file| Ok(file.cursor().sample), RemoteFile::audio_position)
    }

    pub fn get_video_position(&mut self) -> Result<i64> {
        self.dispatch(|file| Ok(file.cursor().frame), RemoteFile::video_position)
    }

    /// Move the audio cursor. Moves of one sample or less are ignored.
    pub fn set_audio_position(&mut self, position: i64) -> Result<()> {
        self.dispatch(
            |file| file.set_audio_position(position),
            |file| file.set_audio_position(position),
        )
    }

    /// Move the video cursor to exactly `position`. Ignored in a file that
    /// cannot seek.
    pub fn set_video_position(&mut self, position: i64) -> Result<()> {
        self.dispatch(
            |file| file.set_video_position(position),
            |file| file.set_video_position(position),
        )
    }

    /// Read `len` samples of the current channel into `buffer`.
    pub fn read_samples(&mut self, buffer: &mut Samples, len: usize) -> Result<()> {
        match &mut self.backing {
            Backing::Local(file) => file.read_samples(buffer, len),
            Backing::Closed => Err(not_open()),
            Backing::Remote(_) => self.with_remote(|file| file.read_samples(buffer, len)),
        }
    }

    /// Read the frame at the video cursor into `frame`, converting to its
    /// color model.
    pub fn read_frame(&mut self, frame: &mut VideoFrame) -> Result<()> {
        match &mut self.backing {
            Backing::Local(file) => file.read_frame(frame),
            Backing::Closed => Err(not_open()),
            Backing::Remote(_) => self.with_remote(|file| file.read_frame(frame)),
        }
    }

    /// Append `len` samples from each channel buffer.
    pub fn write_samples(&mut self, channels: &[Samples], len: usize) -> Result<()> {
        self.dispatch(
            |file| file.write_samples(channels, len),
            |file| file.write_samples(channels, len),
        )
    }

    /// Append the first `len` frames of every layer.
    pub fn write_frames(&mut self, layers: &[Vec<VideoFrame>], len: usize) -> Result<()> {
        self.dispatch(
            |file| file.write_frames(layers, len),
            |file| file.write_frames(layers, len),
        )
    }

    pub fn write_compressed_frame(&mut self, frame: &VideoFrame) -> Result<()> {
        self.dispatch(
            |file| file.write_compressed_frame(frame),
            |file| file.write_compressed_frame(frame),
        )
    }

    /// Start a writer thread fed through a ring of `ring_buffers` buffers
    /// of `buffer_size` samples per channel.
    pub fn start_audio_thread(&mut self, buffer_size: usize, ring_buffers: usize) -> Result<()> {
        self.dispatch(
            |file| file.start_audio_thread(buffer_size, ring_buffers),
            |file| file.start_audio_thread(buffer_size, ring_buffers),
        )
    }

    pub fn start_video_thread(
        &mut self,
        buffer_size: usize,
        color_model: ColorModel,
        ring_buffers: usize,
        compressed: bool,
    ) -> Result<()> {
        self.dispatch(
            |file| file.start_video_thread(buffer_size, color_model, ring_buffers, compressed),
            |file| file.start_video_thread(buffer_size, color_model, ring_buffers, compressed),
        )
    }

    pub fn stop_audio_thread(&mut self) -> Result<()> {
        self.dispatch(LocalFile::stop_audio_thread, RemoteFile::stop_audio_thread)
    }

    pub fn stop_video_thread(&mut self) -> Result<()> {
        self.dispatch(LocalFile::stop_video_thread, RemoteFile::stop_video_thread)
    }

    /// The ring buffer to fill next, waiting for the writer if all are
    /// queued.
    pub fn get_audio_buffer(&mut self) -> Result<BufferGuard<'_, AudioBuffer>> {
        match &mut self.backing {
            Backing::Local(file) => file.audio_buffer(),
            Backing::Remote(file) => file.audio_buffer(),
            Backing::Closed => Err(not_open()),
        }
    }

    pub fn get_video_buffer(&mut self) -> Result<BufferGuard<'_, VideoBuffer>> {
        match &mut self.backing {
            Backing::Local(file) => file.video_buffer(),
            Backing::Remote(file) => file.video_buffer(),
            Backing::Closed => Err(not_open()),
        }
    }

    /// Queue the buffer from [`MediaFile::get_audio_buffer`] with `len`
    /// valid samples per channel.
    pub fn write_audio_buffer(&mut self, len: usize) -> Result<()> {
        self.dispatch(
            |file| file.write_audio_buffer(len),
            |file| file.write_audio_buffer(len),
        )
    }

    pub fn write_video_buffer(&mut self, len: usize) -> Result<()> {
        self.dispatch(
            |file| file.write_video_buffer(len),
            |file| file.write_video_buffer(len),
        )
    }

    /// Whether compressed frames of `source` can be copied into this file
    /// without decoding.
    pub fn can_copy_from(
        &mut self,
        source: &Asset,
        position: i64,
        width: i32,
        height: i32,
    ) -> Result<bool> {
        self.dispatch(
            |file| Ok(file.can_copy_from(source, position, width, height)),
            |file| file.can_copy_from(source, position, width, height),
        )
    }

    /// The color model reads decode into when `requested` is asked for.
    /// With no file open this is always RGB.
    pub fn colormodel_supported(&mut self, requested: ColorModel) -> Result<ColorModel> {
        if !self.is_open() {
            return Ok(ColorModel::Rgb888);
        }
        self.dispatch(
            |file| Ok(file.colormodel_supported(requested)),
            |file| file.colormodel_supported(requested),
        )
    }

    /// The min/max envelope of audio stream `stream` recorded in the
    /// file's table of contents. `None` for formats that keep none.
    pub fn get_waveform_index(&mut self, stream: usize) -> Result<Option<WaveformIndex>> {
        if !self.is_open() {
            return Ok(None);
        }
        self.dispatch(
            |file| Ok(file.waveform_index(stream)),
            |file| file.waveform_index(stream),
        )
    }
}

impl Drop for MediaFile {
    fn drop(&mut self) {
        if let Err(e) = self.close_file() {
            warn!("closing on drop failed: {e}");
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use assert_matches::assert_matches;
    use mf_core::FileStatus;

    fn local_prefs() -> Preferences {
        let mut prefs = Preferences::default();
        prefs.isolation.enabled = false;
        prefs
    }

    #[test]
    fn closed_handle_answers_defaults() {
        let mut file = MediaFile::new();
        assert!(!file.is_open());
        assert_eq!(file.get_memory_usage(), MIN_CACHEITEM_SIZE);
        assert_eq!(file.colormodel_supported(ColorModel::Yuv420p).unwrap(), ColorModel::Rgb888);
        assert_matches!(file.set_audio_position(10), Err(Error::State(_)));
        assert!(file.close_file().unwrap().is_none());
    }

    #[test]
    fn missing_file_is_not_found() {
        let mut file = MediaFile::new();
        let mut asset = Asset::new("/nonexistent/take.wav");
        let err = file.open_file(&local_prefs(), &mut asset, true, false).unwrap_err();
        assert_eq!(err.status(), FileStatus::NotFound);
        assert!(!file.is_open());
    }

    #[test]
    fn project_file_is_refused() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("cut");
        std::fs::write(&path, b"<?xml version=\"1.0\"?><EDL/>").unwrap();
        let mut file = MediaFile::new();
        let err = file
            .open_file(&local_prefs(), &mut Asset::new(&path), true, false)
            .unwrap_err();
        assert_eq!(err.status(), FileStatus::IsXml);
    }

    #[test]
    fn lengths_and_close_are_reported() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("tone.wav");
        let spec = hound::WavSpec {
            channels: 1,
            sample_rate: 8000,
            bits_per_sample: 16,
            sample_format: hound::SampleFormat::Int,
        };
        let mut writer = hound::WavWriter::create(&path, spec).unwrap();
        for _ in 0..800 {
            writer.write_sample(0i16).unwrap();
        }
        writer.finalize().unwrap();

        let mut file = MediaFile::new();
        let mut asset = Asset::new(&path);
        file.open_file(&local_prefs(), &mut asset, true, false).unwrap();
        assert!(!file.is_remote());
        assert_eq!(file.get_audio_length().unwrap(), 800);
        assert_eq!(file.get_video_length().unwrap(), -1);
        assert_matches!(
            file.open_file(&local_prefs(), &mut asset, true, false),
            Err(Error::State(_))
        );

        let closed = file.close_file().unwrap().unwrap();
        assert_eq!(closed.audio_length, 800);
        assert!(file.close_file().unwrap().is_none());
    }
}
