//! Sidecar table of contents.
//!
//! A linear scan records the byte offset of every audio chunk and video
//! frame, the samples each audio chunk decodes to, and which video frames
//! are keyframes. The tables are persisted next to the source as
//! `<source>.toc` so reopening a file skips the scan.
//!
//! Layout, little-endian throughout:
//!
//! ```text
//! "FFMPEGTOC03" i64 source_mtime_ns i64 source_size
//! i32 audio_count  { i32 zoom i32 size i32 channels f32[size * channels * 2] }
//! i32 audio_count  { i64 total_samples i64 chunks i64[chunks] i32[chunks] }
//! i32 video_count  { i32 frames i64[frames] i32 keyframes i32[keyframes] }
//! ```

use mf_core::{ByteReader, ByteWriter, Error, Result};
use std::fs;
use std::io::Write;
use std::path::{Path, PathBuf};
use std::time::UNIX_EPOCH;
use tracing::{debug, info};

pub const TOC_MAGIC: &[u8; 11] = b"FFMPEGTOC03";

/// Chunk table of one audio stream.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct AudioToc {
    pub offsets: Vec<i64>,
    pub samples: Vec<i32>,
    pub total_samples: i64,
}

impl AudioToc {
    pub fn push(&mut self, offset: i64, samples: i32) {
        self.offsets.push(offset);
        self.samples.push(samples);
        self.total_samples += samples as i64;
    }

    pub fn len(&self) -> usize {
        self.offsets.len()
    }

    pub fn is_empty(&self) -> bool {
        self.offsets.is_empty()
    }

    /// Chunk containing `sample` and the first sample of that chunk.
    pub fn chunk_for_sample(&self, sample: i64) -> (usize, i64) {
        let mut start = 0i64;
        for (chunk, count) in self.samples.iter().enumerate() {
            let end = start + *count as i64;
            if sample < end {
                return (chunk, start);
            }
            start = end;
        }
        (self.samples.len(), start)
    }

    /// First sample decoded from `chunk`.
    pub fn sample_at_chunk(&self, chunk: usize) -> i64 {
        self.samples[..chunk.min(self.samples.len())]
            .iter()
            .map(|count| *count as i64)
            .sum()
    }
}

/// Frame table of one video stream.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct VideoToc {
    pub offsets: Vec<i64>,
    /// Indices into `offsets` of the keyframes, strictly increasing.
    pub keyframes: Vec<i32>,
}

impl VideoToc {
    pub fn push(&mut self, offset: i64, keyframe: bool) {
        if keyframe {
            self.keyframes.push(self.offsets.len() as i32);
        }
        self.offsets.push(offset);
    }

    pub fn frames(&self) -> i64 {
        self.offsets.len() as i64
    }

    /// Number of keyframes at or before `frame`.
    pub fn keyframes_through(&self, frame: i64) -> usize {
        self.keyframes.partition_point(|k| (*k as i64) <= frame)
    }

    /// Frame to start decoding from to reach `frame`. A `rewind` of 1 is
    /// the last keyframe at or before `frame`, 2 the one before that.
    pub fn seek_frame(&self, frame: i64, rewind: usize) -> i64 {
        let through = self.keyframes_through(frame);
        if through == 0 {
            return 0;
        }
        self.keyframes[through.saturating_sub(rewind)] as i64
    }
}

/// Coarse min/max envelope of one audio stream, `size` points per channel.
/// `data` is channel-major, each point stored as `[max, min]`.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct WaveformIndex {
    /// Samples summarized by each point.
    pub zoom: i32,
    pub size: i32,
    pub channels: i32,
    pub data: Vec<f32>,
}

impl WaveformIndex {
    /// `(max, min)` of `point` in `channel`.
    pub fn point(&self, channel: usize, point: usize) -> Option<(f32, f32)> {
        if channel >= self.channels as usize || point >= self.size as usize {
            return None;
        }
        let at = (channel * self.size as usize + point) * 2;
        Some((self.data[at], self.data[at + 1]))
    }

    pub fn encode_into(&self, out: &mut ByteWriter) {
        out.put_i32(self.zoom)
            .put_i32(self.size)
            .put_i32(self.channels);
        for value in &self.data {
            out.put_f32(*value);
        }
    }

    /// Read an index written by [`WaveformIndex::encode_into`]. With
    /// `keep_data` false the points are skipped and `data` stays empty.
    pub fn decode_from(reader: &mut ByteReader<'_>, keep_data: bool) -> Result<WaveformIndex> {
        let zoom = reader.i32()?;
        let size = reader.i32()?;
        let channels = reader.i32()?;
        let values = usize::try_from(size)
            .ok()
            .zip(usize::try_from(channels).ok())
            .and_then(|(size, channels)| size.checked_mul(channels))
            .and_then(|n| n.checked_mul(2))
            .filter(|n| n.checked_mul(4).is_some_and(|b| b <= reader.remaining()))
            .ok_or_else(|| Error::Toc(format!("bad waveform shape {size}x{channels}")))?;
        let mut index = WaveformIndex {
            zoom,
            size,
            channels,
            data: Vec::new(),
        };
        if keep_data {
            index.data.reserve(values);
            for _ in 0..values {
                index.data.push(reader.f32()?);
            }
        } else {
            reader.skip(values * 4)?;
        }
        Ok(index)
    }
}

/// Every table of one source file.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct TocFile {
    pub source_mtime: i64,
    pub source_size: i64,
    pub waveforms: Vec<WaveformIndex>,
    pub audio: Vec<AudioToc>,
    pub video: Vec<VideoToc>,
}

/// Sidecar path for `source`.
pub fn toc_path(source: &Path) -> PathBuf {
    let mut name = source.as_os_str().to_os_string();
    name.push(".toc");
    PathBuf::from(name)
}

/// Modification time in nanoseconds and size of `source`.
pub fn source_stamp(source: &Path) -> Result<(i64, i64)> {
    let meta = fs::metadata(source)?;
    let mtime = meta
        .modified()?
        .duration_since(UNIX_EPOCH)
        .map(|d| d.as_nanos().min(i64::MAX as u128) as i64)
        .unwrap_or(0);
    Ok((mtime, meta.len() as i64))
}

fn toc_err(e: Error) -> Error {
    match e {
        Error::Protocol(msg) => Error::Toc(msg),
        other => other,
    }
}

fn count(reader: &mut ByteReader<'_>, what: &str) -> Result<usize> {
    let value = reader.i64()?;
    usize::try_from(value)
        .ok()
        .filter(|n| *n <= reader.remaining())
        .ok_or_else(|| Error::Toc(format!("bad {what} count {value}")))
}

fn count32(reader: &mut ByteReader<'_>, what: &str) -> Result<usize> {
    let value = reader.i32()?;
    usize::try_from(value)
        .ok()
        .filter(|n| *n <= reader.remaining())
        .ok_or_else(|| Error::Toc(format!("bad {what} count {value}")))
}

impl TocFile {
    pub fn encode(&self) -> Vec<u8> {
        let mut out = ByteWriter::new();
        out.put_slice(TOC_MAGIC)
            .put_i64(self.source_mtime)
            .put_i64(self.source_size);

        out.put_i32(self.waveforms.len() as i32);
        for index in &self.waveforms {
            index.encode_into(&mut out);
        }

        out.put_i32(self.audio.len() as i32);
        for audio in &self.audio {
            out.put_i64(audio.total_samples)
                .put_i64(audio.offsets.len() as i64);
            for offset in &audio.offsets {
                out.put_i64(*offset);
            }
            for samples in &audio.samples {
                out.put_i32(*samples);
            }
        }

        out.put_i32(self.video.len() as i32);
        for video in &self.video {
            out.put_i32(video.offsets.len() as i32);
            for offset in &video.offsets {
                out.put_i64(*offset);
            }
            out.put_i32(video.keyframes.len() as i32);
            for keyframe in &video.keyframes {
                out.put_i32(*keyframe);
            }
        }
        out.into_inner()
    }

    /// Parse a sidecar. With `with_waveforms` false the envelope data is
    /// skipped rather than materialized.
    pub fn decode(bytes: &[u8], with_waveforms: bool) -> Result<TocFile> {
        let mut reader = ByteReader::new(bytes);
        if reader.slice(TOC_MAGIC.len()).ok() != Some(&TOC_MAGIC[..]) {
            return Err(Error::Toc("bad signature".into()));
        }
        Self::decode_body(&mut reader, with_waveforms).map_err(toc_err)
    }

    fn decode_body(reader: &mut ByteReader<'_>, with_waveforms: bool) -> Result<TocFile> {
        let mut toc = TocFile {
            source_mtime: reader.i64()?,
            source_size: reader.i64()?,
            ..TocFile::default()
        };

        let waveforms = count32(reader, "waveform")?;
        for _ in 0..waveforms {
            let index = WaveformIndex::decode_from(reader, with_waveforms)?;
            if with_waveforms {
                toc.waveforms.push(index);
            }
        }

        let audio_streams = count32(reader, "audio stream")?;
        for _ in 0..audio_streams {
            let total_samples = reader.i64()?;
            let chunks = count(reader, "audio chunk")?;
            let mut audio = AudioToc {
                offsets: Vec::with_capacity(chunks),
                samples: Vec::with_capacity(chunks),
                total_samples,
            };
            for _ in 0..chunks {
                audio.offsets.push(reader.i64()?);
            }
            for _ in 0..chunks {
                audio.samples.push(reader.i32()?);
            }
            toc.audio.push(audio);
        }

        let video_streams = count32(reader, "video stream")?;
        for _ in 0..video_streams {
            let frames = count32(reader, "video frame")?;
            let mut video = VideoToc {
                offsets: Vec::with_capacity(frames),
                keyframes: Vec::new(),
            };
            for _ in 0..frames {
                video.offsets.push(reader.i64()?);
            }
            let keyframes = count32(reader, "keyframe")?;
            for _ in 0..keyframes {
                video.keyframes.push(reader.i32()?);
            }
            toc.video.push(video);
        }

        toc.check()?;
        Ok(toc)
    }

    /// Offsets never decrease and keyframes strictly increase inside the
    /// frame range.
    pub fn check(&self) -> Result<()> {
        let sorted = |offsets: &[i64]| offsets.windows(2).all(|w| w[0] <= w[1]);
        for (i, audio) in self.audio.iter().enumerate() {
            if !sorted(&audio.offsets) {
                return Err(Error::Toc(format!("audio stream {i}: offsets decrease")));
            }
        }
        for (i, video) in self.video.iter().enumerate() {
            if !sorted(&video.offsets) {
                return Err(Error::Toc(format!("video stream {i}: offsets decrease")));
            }
            let frames = video.offsets.len() as i32;
            let increasing = video.keyframes.windows(2).all(|w| w[0] < w[1]);
            let in_range = video.keyframes.iter().all(|k| (0..frames).contains(k));
            if !increasing || !in_range {
                return Err(Error::Toc(format!("video stream {i}: bad keyframe list")));
            }
        }
        Ok(())
    }

    /// Write atomically: a temporary file in the same directory is renamed
    /// over the sidecar.
    pub fn save(&self, path: &Path) -> Result<()> {
        let dir = path
            .parent()
            .filter(|p| !p.as_os_str().is_empty())
            .unwrap_or_else(|| Path::new("."));
        let mut tmp = tempfile::NamedTempFile::new_in(dir)?;
        tmp.write_all(&self.encode())?;
        tmp.as_file().sync_all()?;
        tmp.persist(path).map_err(|e| Error::from(e.error))?;
        info!(path = %path.display(), "wrote table of contents");
        Ok(())
    }

    pub fn load(path: &Path, with_waveforms: bool) -> Result<TocFile> {
        TocFile::decode(&fs::read(path)?, with_waveforms)
    }

    /// Load the sidecar of `source` if it is still valid: its recorded
    /// mtime is not older than the source's and the sizes agree. The
    /// waveform envelopes are not loaded.
    pub fn load_if_fresh(source: &Path) -> Result<Option<TocFile>> {
        let path = toc_path(source);
        if !path.exists() {
            return Ok(None);
        }
        let (mtime, size) = source_stamp(source)?;
        match TocFile::load(&path, false) {
            Ok(toc) if toc.source_mtime >= mtime && toc.source_size == size => Ok(Some(toc)),
            Ok(_) => {
                debug!(path = %path.display(), "table of contents is stale");
                Ok(None)
            }
            Err(e) => {
                debug!(path = %path.display(), "ignoring unreadable table of contents: {e}");
                Ok(None)
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use assert_matches::assert_matches;

    fn sample_toc() -> TocFile {
        let mut audio = AudioToc::default();
        for (i, n) in [1024, 1024, 512].into_iter().enumerate() {
            audio.push(100 + i as i64 * 300, n);
        }
        let mut video = VideoToc::default();
        for i in 0..10 {
            video.push(4000 + i * 50, i % 4 == 0);
        }
        TocFile {
            source_mtime: 1_700_000_000_000_000_000,
            source_size: 123_456,
            waveforms: vec![WaveformIndex {
                zoom: 256,
                size: 2,
                channels: 1,
                data: vec![0.5, -0.5, 0.25, -0.75],
            }],
            audio: vec![audio],
            video: vec![video],
        }
    }

    #[test]
    fn encode_decode_preserves_tables() {
        let toc = sample_toc();
        let decoded = TocFile::decode(&toc.encode(), true).unwrap();
        assert_eq!(decoded, toc);
        assert_eq!(decoded.audio[0].total_samples, 2560);
        assert_eq!(decoded.video[0].keyframes, vec![0, 4, 8]);
    }

    #[test]
    fn decode_without_waveforms_skips_envelopes() {
        let decoded = TocFile::decode(&sample_toc().encode(), false).unwrap();
        assert!(decoded.waveforms.is_empty());
        assert_eq!(decoded.audio, sample_toc().audio);
    }

    #[test]
    fn header_layout_is_fixed() {
        let bytes = sample_toc().encode();
        assert_eq!(&bytes[..11], b"FFMPEGTOC03");
        assert_eq!(
            i64::from_le_bytes(bytes[11..19].try_into().unwrap()),
            1_700_000_000_000_000_000
        );
        assert_eq!(i64::from_le_bytes(bytes[19..27].try_into().unwrap()), 123_456);
        assert_eq!(i32::from_le_bytes(bytes[27..31].try_into().unwrap()), 1);
    }

    #[test]
    fn bad_signature_and_truncation_are_toc_errors() {
        assert_matches!(TocFile::decode(b"FFMPEGTOC02xxxxxxxx", true), Err(Error::Toc(_)));
        let bytes = sample_toc().encode();
        assert_matches!(TocFile::decode(&bytes[..bytes.len() - 3], true), Err(Error::Toc(_)));
    }

    #[test]
    fn decreasing_offsets_are_rejected() {
        let mut toc = sample_toc();
        toc.video[0].offsets.swap(1, 2);
        assert_matches!(TocFile::decode(&toc.encode(), false), Err(Error::Toc(_)));
    }

    #[test]
    fn keyframe_rewind() {
        let video = &sample_toc().video[0];
        assert_eq!(video.keyframes_through(0), 1);
        assert_eq!(video.keyframes_through(9), 3);
        // Last keyframe at or before 9 is 8.
        assert_eq!(video.seek_frame(9, 1), 8);
        assert_eq!(video.seek_frame(9, 2), 4);
        assert_eq!(video.seek_frame(5, 1), 4);
        assert_eq!(video.seek_frame(5, 2), 0);
        assert_eq!(video.seek_frame(2, 2), 0);
    }

    #[test]
    fn audio_chunk_lookup() {
        let audio = &sample_toc().audio[0];
        assert_eq!(audio.chunk_for_sample(0), (0, 0));
        assert_eq!(audio.chunk_for_sample(1500), (1, 1024));
        assert_eq!(audio.chunk_for_sample(2048), (2, 2048));
        assert_eq!(audio.chunk_for_sample(9999), (3, 2560));
        assert_eq!(audio.sample_at_chunk(2), 2048);
    }

    #[test]
    fn save_is_atomic_and_fresh_check_compares_stamp() {
        let dir = tempfile::tempdir().unwrap();
        let source = dir.path().join("clip.mkv");
        fs::write(&source, vec![0u8; 64]).unwrap();
        let (mtime, size) = source_stamp(&source).unwrap();

        let mut toc = sample_toc();
        toc.source_mtime = mtime;
        toc.source_size = size;
        toc.save(&toc_path(&source)).unwrap();
        assert_eq!(toc_path(&source), dir.path().join("clip.mkv.toc"));

        let loaded = TocFile::load_if_fresh(&source).unwrap().unwrap();
        assert_eq!(loaded.video, toc.video);

        // Size change invalidates even with an unchanged recorded mtime.
        fs::write(&source, vec![0u8; 65]).unwrap();
        toc.source_mtime = i64::MAX;
        toc.save(&toc_path(&source)).unwrap();
        assert!(TocFile::load_if_fresh(&source).unwrap().is_none());
    }

    #[test]
    fn missing_sidecar_is_not_an_error() {
        let dir = tempfile::tempdir().unwrap();
        let source = dir.path().join("a.avi");
        fs::write(&source, b"x").unwrap();
        assert!(TocFile::load_if_fresh(&source).unwrap().is_none());
    }
}
