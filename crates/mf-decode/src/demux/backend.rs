//! The demuxing backend: opens a container, builds or loads its table of
//! contents and serves frame and sample reads from per-stream state.

use mf_core::{Error, FileFormat, Preferences, ProgressSink, Result, NOSEEK_LENGTH};
use mf_media::{transfer, ColorModel, VideoFrame};
use std::path::PathBuf;
use tracing::{debug, info, warn};

use super::container::{ContainerInfo, ContainerOpener, Picture};
use super::scan::build_toc;
use super::stream::{MediaStream, VideoClock};
use super::toc::{source_stamp, toc_path, TocFile, WaveformIndex};
use crate::backend::{DecoderBackend, FrameRead, OpenRequest};
use crate::registry::BackendKind;

/// Video codecs whose containers rarely carry a usable seek index.
const TOC_CODECS: [&str; 4] = ["h264", "hevc", "h265", "vp9"];

/// Whether a file needs a table of contents to seek accurately.
pub fn needs_toc(info: &ContainerInfo, always: bool) -> bool {
    always
        || info.format_name.split(',').any(|name| name == "avi")
        || info
            .streams
            .iter()
            .any(|s| TOC_CODECS.iter().any(|codec| s.codec.eq_ignore_ascii_case(codec)))
}

/// Copy a decoded picture into `frame`, converting its layout.
fn picture_into(picture: &Picture, frame: &mut VideoFrame) -> Result<()> {
    if picture.width != frame.width() || picture.height != frame.height() {
        return Err(Error::decode(format!(
            "decoded {}x{} picture into a {}x{} frame",
            picture.width,
            picture.height,
            frame.width(),
            frame.height()
        )));
    }
    let model = frame.color_model();
    transfer(
        &picture.data,
        picture.color_model,
        frame.data_mut(),
        model,
        picture.width,
        picture.height,
    )?;
    frame.keyframe = picture.keyframe;
    Ok(())
}

pub struct DemuxBackend<O: ContainerOpener> {
    opener: O,
    path: PathBuf,
    prefs: Preferences,
    info: Option<ContainerInfo>,
    audio: Vec<MediaStream>,
    /// Global channel number to (audio stream, channel within it).
    channel_map: Vec<(usize, usize)>,
    video: Option<MediaStream>,
    toc: Option<TocFile>,
}

impl<O: ContainerOpener> std::fmt::Debug for DemuxBackend<O> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("DemuxBackend")
            .field("path", &self.path)
            .field("audio", &self.audio)
            .field("video", &self.video)
            .field("has_toc", &self.toc.is_some())
            .finish()
    }
}

impl<O: ContainerOpener> DemuxBackend<O> {
    pub fn new(opener: O) -> Self {
        Self {
            opener,
            path: PathBuf::new(),
            prefs: Preferences::default(),
            info: None,
            audio: Vec::new(),
            channel_map: Vec::new(),
            video: None,
            toc: None,
        }
    }

    pub fn toc(&self) -> Option<&TocFile> {
        self.toc.as_ref()
    }

    pub fn container_info(&self) -> Option<&ContainerInfo> {
        self.info.as_ref()
    }

    fn open_stream(&self, stream: usize) -> Result<MediaStream> {
        MediaStream::open(
            &self.opener,
            &self.path,
            stream,
            self.prefs.processors.max(1),
            self.prefs.hardware_decode,
            self.prefs.seek.history_max,
        )
    }

    /// Reopen a stream whose decoder failed beyond recovery.
    fn restart(&self, stream: &mut MediaStream) -> Result<()> {
        if stream.need_restart() {
            let index = stream.info().index;
            warn!(
                path = %self.path.display(),
                stream = index,
                "reopening stream after decode failure"
            );
            *stream = self.open_stream(index)?;
        }
        Ok(())
    }

    /// Load a fresh sidecar or scan the file. `Ok(None)` means the file
    /// can only be read sequentially.
    fn load_or_build_toc(
        &self,
        audio: &[usize],
        video: Option<usize>,
        progress: &mut dyn ProgressSink,
    ) -> Result<Option<TocFile>> {
        let shape_matches = |toc: &TocFile| {
            toc.audio.len() == audio.len() && toc.video.len() == video.iter().count()
        };
        if let Some(toc) = TocFile::load_if_fresh(&self.path)? {
            if shape_matches(&toc) {
                debug!(path = %self.path.display(), "using existing table of contents");
                return Ok(Some(toc));
            }
            debug!(path = %self.path.display(), "table of contents does not match the streams");
        }
        if !self.prefs.toc.enabled {
            info!(path = %self.path.display(), "table of contents disabled; file is sequential only");
            return Ok(None);
        }

        let mut container = self.opener.open(&self.path)?;
        let mut toc = build_toc(container.as_mut(), audio, video, &self.prefs, progress)?;
        let (mtime, size) = source_stamp(&self.path)?;
        toc.source_mtime = mtime;
        toc.source_size = size;
        if let Err(e) = toc.save(&toc_path(&self.path)) {
            warn!(path = %self.path.display(), "could not write table of contents: {e}");
        }
        Ok(Some(toc))
    }
}

impl<O: ContainerOpener + 'static> DecoderBackend for DemuxBackend<O> {
    fn kind(&self) -> BackendKind {
        BackendKind::Ffmpeg
    }

    fn open(&mut self, request: OpenRequest<'_>) -> Result<()> {
        if request.write {
            return Err(Error::unsupported("the demuxer does not write files"));
        }
        let asset = request.asset;
        self.path = asset.path.clone();
        self.prefs = request.prefs.clone();

        let info = self.opener.open(&self.path)?.info().clone();
        let audio_indices: Vec<usize> = info.audio_streams().map(|s| s.index).collect();
        let video_index = info.first_video().map(|s| s.index);
        if audio_indices.is_empty() && video_index.is_none() {
            return Err(Error::UnrecognizedCodec {
                path: self.path.clone(),
            });
        }

        let sequential = if needs_toc(&info, self.prefs.toc.always) {
            self.toc = self.load_or_build_toc(&audio_indices, video_index, request.progress)?;
            self.toc.is_none()
        } else {
            self.toc = None;
            false
        };

        self.audio = audio_indices
            .iter()
            .map(|&index| self.open_stream(index))
            .collect::<Result<_>>()?;
        self.channel_map = self
            .audio
            .iter()
            .enumerate()
            .flat_map(|(stream, s)| {
                (0..s.info().channels.max(0) as usize).map(move |c| (stream, c))
            })
            .collect();
        self.video = video_index.map(|index| self.open_stream(index)).transpose()?;

        if asset.format == FileFormat::Unknown {
            asset.format = FileFormat::Ffmpeg;
        }
        asset.container = info.format_name.clone();
        if let Some(first) = self.audio.first().map(|s| s.info()) {
            asset.audio_data = true;
            asset.channels = self.channel_map.len() as i32;
            asset.sample_rate = first.sample_rate;
            asset.bits = first.bits;
            asset.audio_codec = first.codec.clone();
            asset.audio_length = match self.toc.as_ref().and_then(|t| t.audio.first()) {
                Some(audio) => audio.total_samples,
                None => first.length_estimate,
            };
        }
        if let Some(video) = self.video.as_ref().map(|s| s.info()) {
            asset.video_data = true;
            asset.layers = 1;
            asset.width = video.width;
            asset.height = video.height;
            asset.frame_rate = video.frame_rate;
            asset.aspect_ratio = video.display_aspect();
            asset.video_codec = video.codec.clone();
            asset.video_length = match self.toc.as_ref().and_then(|t| t.video.first()) {
                Some(toc) => toc.frames(),
                None if sequential => NOSEEK_LENGTH,
                None => video.length_estimate,
            };
        }
        info!(
            path = %self.path.display(),
            container = %info.format_name,
            audio_streams = self.audio.len(),
            video = self.video.is_some(),
            toc = self.toc.is_some(),
            "opened container"
        );
        self.info = Some(info);
        Ok(())
    }

    fn close(&mut self) -> Result<()> {
        self.audio.clear();
        self.channel_map.clear();
        self.video = None;
        self.toc = None;
        self.info = None;
        Ok(())
    }

    fn colormodel_supported(&self, requested: ColorModel) -> ColorModel {
        if requested.bytes_per_pixel().is_some() {
            requested
        } else {
            ColorModel::Rgba8888
        }
    }

    fn read_frame(&mut self, request: FrameRead<'_>) -> Result<()> {
        let Some(mut stream) = self.video.take() else {
            return Err(Error::state("no video stream is open"));
        };
        let result = self.read_frame_from(&mut stream, request);
        self.video = Some(stream);
        result
    }

    fn read_samples(&mut self, buffer: &mut [f64], position: i64, channel: i32) -> Result<()> {
        let &(index, within) = usize::try_from(channel)
            .ok()
            .and_then(|c| self.channel_map.get(c))
            .ok_or_else(|| Error::Validation(format!("no audio channel {channel}")))?;
        let mut audio = std::mem::take(&mut self.audio);
        let result = self.read_samples_from(&mut audio[index], index, buffer, position, within);
        self.audio = audio;
        result
    }

    fn purge_cache(&mut self) -> usize {
        self.audio.iter_mut().map(MediaStream::purge).sum()
    }

    fn memory_usage(&self) -> usize {
        self.audio.iter().map(MediaStream::memory_usage).sum()
    }

    fn waveform_index(&self, stream: usize) -> Option<WaveformIndex> {
        let toc = self.toc.as_ref()?;
        if let Some(index) = toc.waveforms.get(stream) {
            return Some(index.clone());
        }
        // Tables loaded from a sidecar leave the envelopes on disk.
        match TocFile::load(&toc_path(&self.path), true) {
            Ok(full) => full.waveforms.into_iter().nth(stream),
            Err(e) => {
                debug!(path = %self.path.display(), "no waveform index: {e}");
                None
            }
        }
    }

    fn set_processors(&mut self, processors: usize) {
        self.prefs.processors = processors;
    }
}

impl<O: ContainerOpener> DemuxBackend<O> {
    fn read_frame_from(&self, stream: &mut MediaStream, request: FrameRead<'_>) -> Result<()> {
        self.restart(stream)?;
        let FrameRead {
            frame,
            position,
            layer,
            mut cache,
            frame_rate,
        } = request;
        let toc = self.toc.as_ref().and_then(|t| t.video.first());
        let target = match toc {
            Some(toc) if toc.frames() > 0 => position.clamp(0, toc.frames() - 1),
            _ => position.max(0),
        };
        let (model, width, height) = (frame.color_model(), frame.width(), frame.height());

        let mut on_skipped = |index: i64, picture: &Picture| {
            let Some(cache) = cache.as_deref_mut() else {
                return;
            };
            if cache.contains(index, layer, frame_rate, model, width, height) {
                return;
            }
            let mut skipped = VideoFrame::new(width, height, model);
            if picture_into(picture, &mut skipped).is_ok() {
                skipped.position = index;
                cache.put_frame(&skipped, layer, frame_rate);
            }
        };
        let picture = stream.read_video(target, toc, &self.prefs.seek, &mut on_skipped)?;
        picture_into(&picture, frame)?;
        frame.position = target;
        Ok(())
    }

    fn read_samples_from(
        &self,
        stream: &mut MediaStream,
        index: usize,
        buffer: &mut [f64],
        position: i64,
        channel: usize,
    ) -> Result<()> {
        self.restart(stream)?;
        let toc = self.toc.as_ref().and_then(|t| t.audio.get(index));
        let clock = match (&self.toc, &self.video) {
            (Some(t), Some(video)) => t.video.first().map(|toc| VideoClock {
                toc,
                frame_rate: video.info().frame_rate,
            }),
            _ => None,
        };
        stream.read_audio(buffer, position, channel, toc, clock, &self.prefs.seek)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::demux::synthetic::{
        picture_frame, synthetic_sample, SyntheticFile, SyntheticOpener, PICTURE_HEIGHT,
        PICTURE_WIDTH,
    };
    use crate::demux::UnavailableOpener;
    use assert_matches::assert_matches;
    use mf_core::{Asset, NullProgress};
    use mf_media::FrameCache;
    use std::path::Path;
    use std::sync::atomic::Ordering;

    struct CancelAtOnce;

    impl ProgressSink for CancelAtOnce {
        fn start(&mut self, _title: &str, _total: i64) {}
        fn update(&mut self, _value: i64) {}
        fn update_title(&mut self, _title: &str) {}
        fn is_cancelled(&mut self) -> bool {
            true
        }
        fn stop(&mut self, _title: &str) {}
    }

    fn source(dir: &tempfile::TempDir) -> PathBuf {
        let path = dir.path().join("clip.mkv");
        std::fs::write(&path, [0u8; 64]).unwrap();
        path
    }

    fn open_with(
        opener: &SyntheticOpener,
        path: &Path,
        prefs: &Preferences,
        progress: &mut dyn ProgressSink,
    ) -> Result<(DemuxBackend<SyntheticOpener>, Asset)> {
        let mut asset = Asset::new(path);
        let mut backend = DemuxBackend::new(opener.clone());
        backend.open(OpenRequest {
            asset: &mut asset,
            prefs,
            read: true,
            write: false,
            progress,
        })?;
        Ok((backend, asset))
    }

    fn open(opener: &SyntheticOpener, path: &Path) -> (DemuxBackend<SyntheticOpener>, Asset) {
        open_with(opener, path, &Preferences::default(), &mut NullProgress).unwrap()
    }

    fn frame_at(
        backend: &mut DemuxBackend<SyntheticOpener>,
        position: i64,
        cache: Option<&mut FrameCache>,
    ) -> Result<VideoFrame> {
        let mut frame = VideoFrame::new(PICTURE_WIDTH, PICTURE_HEIGHT, ColorModel::Rgb888);
        backend.read_frame(FrameRead {
            frame: &mut frame,
            position,
            layer: 0,
            cache,
            frame_rate: 25.0,
        })?;
        Ok(frame)
    }

    fn seeks(opener: &SyntheticOpener) -> usize {
        opener.log.lock().unwrap().seeks.len()
    }

    #[test]
    fn first_open_scans_and_reports_exact_lengths() {
        let dir = tempfile::tempdir().unwrap();
        let path = source(&dir);
        let opener = SyntheticOpener::new(SyntheticFile::h264());
        let (backend, asset) = open(&opener, &path);

        // Probe, scan, then one handle per stream.
        assert_eq!(opener.opens(), 4);
        assert_eq!(asset.format, FileFormat::Ffmpeg);
        assert_eq!(asset.container, "matroska,webm");
        assert_eq!(asset.video_length, 300);
        assert_eq!(asset.audio_length, 300 * 320);
        assert_eq!(asset.channels, 2);
        assert_eq!((asset.width, asset.height), (2, 1));
        assert!(toc_path(&path).exists());

        let toc = backend.toc().unwrap();
        assert_eq!(toc.video[0].keyframes.len(), 10);
        assert_eq!(toc.waveforms.len(), 1);
    }

    #[test]
    fn waveform_index_is_served_from_the_table() {
        let dir = tempfile::tempdir().unwrap();
        let path = source(&dir);
        let opener = SyntheticOpener::new(SyntheticFile::h264());
        let (backend, _) = open(&opener, &path);

        let index = backend.waveform_index(0).unwrap();
        assert_eq!(&index, &backend.toc().unwrap().waveforms[0]);
        assert_eq!(index.channels, 2);
        // Left channel ramps up, right channel mirrors it.
        let (max, min) = index.point(0, 0).unwrap();
        assert!(max >= min && min >= 0.0);
        let (max, _) = index.point(1, 0).unwrap();
        assert!(max <= 0.0);
        assert!(backend.waveform_index(1).is_none());
    }

    #[test]
    fn reopen_uses_the_sidecar() {
        let dir = tempfile::tempdir().unwrap();
        let path = source(&dir);
        open(&SyntheticOpener::new(SyntheticFile::h264()), &path);

        let opener = SyntheticOpener::new(SyntheticFile::h264());
        let (backend, asset) = open(&opener, &path);
        assert_eq!(opener.opens(), 3);
        assert_eq!(asset.video_length, 300);

        // Envelopes are read from the sidecar only when asked for.
        assert!(backend.toc().unwrap().waveforms.is_empty());
        assert_eq!(backend.waveform_index(0).unwrap().channels, 2);
    }

    #[test]
    fn changed_source_is_rescanned() {
        let dir = tempfile::tempdir().unwrap();
        let path = source(&dir);
        open(&SyntheticOpener::new(SyntheticFile::h264()), &path);
        std::fs::write(&path, [1u8; 96]).unwrap();

        let opener = SyntheticOpener::new(SyntheticFile::h264());
        open(&opener, &path);
        assert_eq!(opener.opens(), 4);
    }

    #[test]
    fn far_seek_rewinds_keyframes_and_caches_skipped_frames() {
        let dir = tempfile::tempdir().unwrap();
        let path = source(&dir);
        let opener = SyntheticOpener::new(SyntheticFile::h264());
        let (mut backend, _) = open(&opener, &path);
        let mut cache = FrameCache::new(1 << 20);

        let frame = frame_at(&mut backend, 0, Some(&mut cache)).unwrap();
        assert_eq!(picture_frame(frame.data()), 0);

        let frame = frame_at(&mut backend, 200, Some(&mut cache)).unwrap();
        assert_eq!(picture_frame(frame.data()), 200);
        assert_eq!(frame.position, 200);
        // Two keyframes back from 200 with a 30 frame GOP.
        assert_eq!(opener.last_seek(), Some((0, 6.0)));
        let cached = |p| cache.contains(p, 0, 25.0, ColorModel::Rgb888, 2, 1);
        assert!((150..200).all(cached));
        assert!(!cached(149));
        assert!(!cached(200));

        // Short hops forward decode on without seeking.
        let before = seeks(&opener);
        let frame = frame_at(&mut backend, 205, Some(&mut cache)).unwrap();
        assert_eq!(picture_frame(frame.data()), 205);
        assert_eq!(seeks(&opener), before);
        assert!((201..205).all(|p| cache.contains(p, 0, 25.0, ColorModel::Rgb888, 2, 1)));
    }

    #[test]
    fn frame_reads_clamp_to_the_last_frame() {
        let dir = tempfile::tempdir().unwrap();
        let path = source(&dir);
        let opener = SyntheticOpener::new(SyntheticFile::h264());
        let (mut backend, _) = open(&opener, &path);

        let frame = frame_at(&mut backend, 10_000, None).unwrap();
        assert_eq!(picture_frame(frame.data()), 299);
        assert_eq!(frame.position, 10_000);
    }

    #[test]
    fn backward_read_seeks() {
        let dir = tempfile::tempdir().unwrap();
        let path = source(&dir);
        let opener = SyntheticOpener::new(SyntheticFile::h264());
        let (mut backend, _) = open(&opener, &path);

        frame_at(&mut backend, 40, None).unwrap();
        let before = seeks(&opener);
        let frame = frame_at(&mut backend, 35, None).unwrap();
        assert_eq!(picture_frame(frame.data()), 35);
        assert_eq!(seeks(&opener), before + 1);
    }

    #[test]
    fn audio_reads_are_sample_exact() {
        let dir = tempfile::tempdir().unwrap();
        let path = source(&dir);
        let opener = SyntheticOpener::new(SyntheticFile::h264());
        let (mut backend, _) = open(&opener, &path);
        let expect = |channel, from: i64, len: i64| -> Vec<f64> {
            (from..from + len).map(|s| synthetic_sample(1, channel, s)).collect()
        };

        let mut buf = vec![0.0; 100];
        backend.read_samples(&mut buf, 5000, 1).unwrap();
        assert_eq!(buf, expect(1, 5000, 100));
        // Rewound a quarter second to sample 3000, inside the chunk at
        // frame 9, whose nearest keyframe is frame 0.
        assert_eq!(opener.last_seek(), Some((1, 0.0)));

        let before = seeks(&opener);
        backend.read_samples(&mut buf, 5100, 0).unwrap();
        assert_eq!(buf, expect(0, 5100, 100));
        backend.read_samples(&mut buf, 4000, 1).unwrap();
        assert_eq!(buf, expect(1, 4000, 100));
        assert_eq!(seeks(&opener), before);

        backend.read_samples(&mut buf, 100, 0).unwrap();
        assert_eq!(buf, expect(0, 100, 100));
        assert_eq!(seeks(&opener), before + 1);
    }

    #[test]
    fn audio_past_the_end_is_silent() {
        let dir = tempfile::tempdir().unwrap();
        let path = source(&dir);
        let opener = SyntheticOpener::new(SyntheticFile::h264());
        let (mut backend, asset) = open(&opener, &path);

        let end = asset.audio_length;
        let mut buf = vec![9.0; 200];
        backend.read_samples(&mut buf, end - 50, 0).unwrap();
        let tail: Vec<f64> = (end - 50..end).map(|s| synthetic_sample(1, 0, s)).collect();
        assert_eq!(&buf[..50], &tail[..]);
        assert!(buf[50..].iter().all(|s| *s == 0.0));
    }

    #[test]
    fn channels_are_numbered_across_audio_streams() {
        let dir = tempfile::tempdir().unwrap();
        let path = source(&dir);
        let file = SyntheticFile {
            audio_channels: vec![1, 2],
            ..SyntheticFile::h264()
        };
        let opener = SyntheticOpener::new(file);
        let (mut backend, asset) = open(&opener, &path);
        assert_eq!(asset.channels, 3);

        let mut buf = vec![0.0; 10];
        backend.read_samples(&mut buf, 640, 2).unwrap();
        let expect: Vec<f64> = (640..650).map(|s| synthetic_sample(2, 1, s)).collect();
        assert_eq!(buf, expect);
        backend.read_samples(&mut buf, 640, 0).unwrap();
        assert_eq!(buf[0], synthetic_sample(1, 0, 640));

        assert_matches!(
            backend.read_samples(&mut buf, 0, 3),
            Err(Error::Validation(_))
        );
    }

    #[test]
    fn cancelled_scan_writes_no_sidecar() {
        let dir = tempfile::tempdir().unwrap();
        let path = source(&dir);
        let opener = SyntheticOpener::new(SyntheticFile::h264());
        let result = open_with(&opener, &path, &Preferences::default(), &mut CancelAtOnce);
        assert_matches!(result, Err(Error::UserCanceled));
        assert!(!toc_path(&path).exists());
    }

    #[test]
    fn disabled_toc_opens_sequential_only() {
        let dir = tempfile::tempdir().unwrap();
        let path = source(&dir);
        let mut prefs = Preferences::default();
        prefs.toc.enabled = false;
        let opener = SyntheticOpener::new(SyntheticFile::h264());
        let (backend, asset) = open_with(&opener, &path, &prefs, &mut NullProgress).unwrap();

        assert_eq!(asset.video_length, NOSEEK_LENGTH);
        assert!(backend.toc().is_none());
        assert!(!toc_path(&path).exists());
    }

    #[test]
    fn reliable_containers_skip_the_scan() {
        let dir = tempfile::tempdir().unwrap();
        let path = source(&dir);
        let file = SyntheticFile {
            format_name: "mpeg".into(),
            video_codec: "mpeg2video".into(),
            ..SyntheticFile::h264()
        };
        let opener = SyntheticOpener::new(file);
        let (mut backend, asset) = open(&opener, &path);
        assert_eq!(opener.opens(), 3);
        assert_eq!(asset.video_length, 300);
        assert!(backend.toc().is_none());

        // Without a table the seek goes by time and frames are counted
        // from their timestamps.
        let frame = frame_at(&mut backend, 100, None).unwrap();
        assert_eq!(picture_frame(frame.data()), 100);
        assert_eq!(opener.last_seek(), Some((0, 4.0)));
    }

    #[test]
    fn repeated_decode_failure_restarts_the_stream() {
        let dir = tempfile::tempdir().unwrap();
        let path = source(&dir);
        let opener = SyntheticOpener::new(SyntheticFile::h264());
        let (mut backend, _) = open(&opener, &path);

        opener.failures.store(2, Ordering::SeqCst);
        assert_matches!(frame_at(&mut backend, 0, None), Err(Error::Decode(_)));
        assert!(backend.video.as_ref().unwrap().need_restart());

        let opens = opener.opens();
        let frame = frame_at(&mut backend, 0, None).unwrap();
        assert_eq!(picture_frame(frame.data()), 0);
        assert_eq!(opener.opens(), opens + 1);
    }

    #[test]
    fn failed_decode_returns_the_frame_the_decoder_still_held() {
        let dir = tempfile::tempdir().unwrap();
        let path = source(&dir);
        let file = SyntheticFile {
            decoder_delay: 1,
            ..SyntheticFile::h264()
        };
        let opener = SyntheticOpener::new(file);
        let (mut backend, _) = open(&opener, &path);

        // Decoding frame 4 leaves frame 5 buffered in the decoder.
        let frame = frame_at(&mut backend, 4, None).unwrap();
        assert_eq!(picture_frame(frame.data()), 4);

        // The packet after frame 5 is corrupt.
        opener.failures.store(1, Ordering::SeqCst);
        let before = seeks(&opener);
        let frame = frame_at(&mut backend, 5, None).unwrap();
        assert_eq!(picture_frame(frame.data()), 5);
        assert_eq!(frame.position, 5);
        assert_eq!(seeks(&opener), before);
        assert!(backend.video.as_ref().unwrap().need_restart());

        // The reopen waits for the next read.
        let opens = opener.opens();
        let frame = frame_at(&mut backend, 6, None).unwrap();
        assert_eq!(picture_frame(frame.data()), 6);
        assert_eq!(opener.opens(), opens + 1);
    }

    #[test]
    fn frames_past_the_end_are_labelled_with_the_last_frame() {
        let dir = tempfile::tempdir().unwrap();
        let path = source(&dir);
        let opener = SyntheticOpener::new(SyntheticFile::h264());
        let (mut backend, _) = open(&opener, &path);

        let frame = frame_at(&mut backend, 305, None).unwrap();
        assert_eq!(picture_frame(frame.data()), 299);
        assert_eq!(frame.position, 299);
    }

    #[test]
    fn single_decode_failure_recovers_in_place() {
        let dir = tempfile::tempdir().unwrap();
        let path = source(&dir);
        let opener = SyntheticOpener::new(SyntheticFile::h264());
        let (mut backend, _) = open(&opener, &path);

        opener.failures.store(1, Ordering::SeqCst);
        let opens = opener.opens();
        let frame = frame_at(&mut backend, 3, None).unwrap();
        assert_eq!(picture_frame(frame.data()), 3);
        assert_eq!(opener.opens(), opens);
        assert!(!backend.video.as_ref().unwrap().need_restart());
    }

    #[test]
    fn history_stays_within_capacity() {
        let dir = tempfile::tempdir().unwrap();
        let path = source(&dir);
        let mut prefs = Preferences::default();
        prefs.seek.history_max = 1000;
        let opener = SyntheticOpener::new(SyntheticFile::h264());
        let (mut backend, _) = open_with(&opener, &path, &prefs, &mut NullProgress).unwrap();

        let mut buf = vec![0.0; 500];
        for block in 0..40 {
            let position = block * 500;
            backend.read_samples(&mut buf, position, 0).unwrap();
            assert_eq!(buf[499], synthetic_sample(1, 0, position + 499));
            let history = backend.audio[0].history();
            assert!(history.size() <= history.capacity());
            assert!(history.start() <= position);
        }

        assert!(backend.memory_usage() > 0);
        assert!(backend.purge_cache() > 0);
        assert_eq!(backend.memory_usage(), 0);
    }

    #[test]
    fn write_mode_is_rejected() {
        let mut asset = Asset::new("/tmp/out.mkv");
        let mut backend = DemuxBackend::new(SyntheticOpener::new(SyntheticFile::h264()));
        let result = backend.open(OpenRequest {
            asset: &mut asset,
            prefs: &Preferences::default(),
            read: false,
            write: true,
            progress: &mut NullProgress,
        });
        assert_matches!(result, Err(Error::Unsupported(_)));
    }

    #[test]
    fn unavailable_opener_refuses_files() {
        let dir = tempfile::tempdir().unwrap();
        let path = source(&dir);
        let mut asset = Asset::new(&path);
        let mut backend = DemuxBackend::new(UnavailableOpener);
        let result = backend.open(OpenRequest {
            asset: &mut asset,
            prefs: &Preferences::default(),
            read: true,
            write: false,
            progress: &mut NullProgress,
        });
        assert_matches!(result, Err(Error::Unsupported(_)));
    }
}
