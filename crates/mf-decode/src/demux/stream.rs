//! Per-stream demux and decode state.
//!
//! Every elementary stream owns its own container handle, so audio and
//! video can seek independently. Seeks go through the table of contents
//! when one exists: the container performs a coarse time seek, then
//! packets are discarded until the byte offset the table recorded for the
//! target chunk is reached.

use mf_core::{Error, Result, SeekPolicy};
use std::path::Path;
use tracing::{debug, trace, warn};

use super::container::{
    Container, ContainerOpener, Decoded, MediaKind, Packet, Picture, StreamDecoder, StreamInfo,
};
use super::history::{Coverage, PcmHistory};
use super::timestamps::TimestampHistory;
use super::toc::{AudioToc, VideoToc};

/// Coarse seeks that overshoot are retried this many times with an
/// earlier time before falling back to the start of the file.
const SEEK_RETRIES: usize = 4;

/// Video table plus the rate used to turn frames into seconds; audio
/// seeks are aligned to its keyframes.
#[derive(Debug, Clone, Copy)]
pub struct VideoClock<'a> {
    pub toc: &'a VideoToc,
    pub frame_rate: f64,
}

pub struct MediaStream {
    info: StreamInfo,
    container: Box<dyn Container>,
    decoder: Box<dyn StreamDecoder>,
    /// Packet read while seeking that has not been decoded yet.
    pending: Option<Packet>,
    eof_sent: bool,
    need_restart: bool,
    /// Next frame the decoder will output.
    current: i64,
    timestamps: TimestampHistory,
    history: PcmHistory,
    /// Audio start sample to use if the first decoded frame has no pts.
    unanchored: Option<i64>,
}

impl std::fmt::Debug for MediaStream {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("MediaStream")
            .field("stream", &self.info.index)
            .field("kind", &self.info.kind)
            .field("current", &self.current)
            .field("need_restart", &self.need_restart)
            .finish_non_exhaustive()
    }
}

impl MediaStream {
    /// Open `path` again and attach to `stream`.
    pub fn open(
        opener: &dyn ContainerOpener,
        path: &Path,
        stream: usize,
        threads: usize,
        hardware: bool,
        history_max: usize,
    ) -> Result<Self> {
        let container = opener.open(path)?;
        let info = container
            .info()
            .streams
            .iter()
            .find(|s| s.index == stream)
            .cloned()
            .ok_or_else(|| Error::decode(format!("{}: no stream {stream}", path.display())))?;
        let decoder = container.open_decoder(stream, threads, hardware)?;
        let channels = match info.kind {
            MediaKind::Audio => info.channels.max(0) as usize,
            MediaKind::Video => 0,
        };
        let mut timestamps = TimestampHistory::new();
        timestamps.reset(0);
        Ok(Self {
            info,
            container,
            decoder,
            pending: None,
            eof_sent: false,
            need_restart: false,
            current: 0,
            timestamps,
            history: PcmHistory::new(channels, history_max),
            unanchored: None,
        })
    }

    pub fn info(&self) -> &StreamInfo {
        &self.info
    }

    pub fn current(&self) -> i64 {
        self.current
    }

    pub fn need_restart(&self) -> bool {
        self.need_restart
    }

    pub fn history(&self) -> &PcmHistory {
        &self.history
    }

    /// Bytes held in the PCM history.
    pub fn memory_usage(&self) -> usize {
        self.history.size() * self.info.channels.max(0) as usize * std::mem::size_of::<f64>()
    }

    /// Drop the PCM history. Returns the bytes released.
    pub fn purge(&mut self) -> usize {
        let freed = self.memory_usage();
        let end = self.history.end();
        self.history.reset(end);
        freed
    }

    fn reset_decoder(&mut self) {
        self.decoder.flush();
        self.pending = None;
        self.eof_sent = false;
    }

    /// Next decoder output of this stream, or `None` once drained.
    fn next_decoded(&mut self) -> Result<Option<Decoded>> {
        loop {
            if let Some(decoded) = self.decoder.receive()? {
                return Ok(Some(decoded));
            }
            if self.eof_sent {
                return Ok(None);
            }
            let packet = match self.pending.take() {
                Some(packet) => Some(packet),
                None => self.container.read_packet()?,
            };
            match packet {
                Some(packet) if packet.stream == self.info.index => {
                    self.timestamps.on_sent(packet.pts);
                    self.decoder.send_packet(&packet)?;
                }
                Some(_) => {}
                None => {
                    self.decoder.send_eof()?;
                    self.eof_sent = true;
                }
            }
        }
    }

    /// Position the stream on `target` of `offsets`.
    ///
    /// The container seeks near `seconds`, then packets are discarded until
    /// one at or past the target's offset arrives; that packet is kept for
    /// decoding. If the coarse seek already overshot, it is retried with
    /// earlier times and finally from the start. Returns the index of the
    /// first table entry at or after the landing packet.
    pub fn seek_5(&mut self, offsets: &[i64], target: usize, seconds: f64) -> Result<usize> {
        if offsets.is_empty() {
            self.container.seek(self.info.index, 0.0)?;
            self.reset_decoder();
            return Ok(0);
        }
        let target = target.min(offsets.len() - 1);
        let target_offset = offsets[target];
        let mut time = seconds.max(0.0);
        let mut back = 1.0;

        for attempt in 0..=SEEK_RETRIES {
            if attempt == SEEK_RETRIES {
                time = 0.0;
            }
            self.container.seek(self.info.index, time)?;
            self.reset_decoder();

            let mut first = true;
            let mut overshot = false;
            let mut landed = None;
            while let Some(packet) = self.container.read_packet()? {
                if packet.stream != self.info.index {
                    continue;
                }
                if first && packet.offset > target_offset && time > 0.0 {
                    overshot = true;
                    break;
                }
                first = false;
                if packet.offset >= target_offset {
                    landed = Some(packet);
                    break;
                }
            }

            if overshot {
                trace!(stream = self.info.index, time, "coarse seek overshot, backing off");
                time = (time - back).max(0.0);
                back *= 2.0;
                continue;
            }

            return Ok(match landed {
                Some(packet) => {
                    let index = offsets.partition_point(|o| *o < packet.offset);
                    self.pending = Some(packet);
                    index
                }
                None => offsets.len(),
            });
        }
        Err(Error::decode(format!(
            "stream {}: seek to chunk {target} failed",
            self.info.index
        )))
    }

    fn seconds_for_frame(&self, frame: i64) -> f64 {
        if self.info.frame_rate > 0.0 {
            frame as f64 / self.info.frame_rate
        } else {
            0.0
        }
    }

    fn index_from_pts(&mut self, pts: Option<i64>, by_toc: bool) -> i64 {
        match pts {
            Some(pts) if !by_toc && self.info.frame_rate > 0.0 => {
                let index = (self.info.seconds(pts) * self.info.frame_rate).round() as i64;
                self.timestamps.mark(index);
                index
            }
            _ => self.timestamps.index_of(pts),
        }
    }

    fn seek_video(
        &mut self,
        target: i64,
        toc: Option<&VideoToc>,
        policy: &SeekPolicy,
    ) -> Result<()> {
        match toc {
            Some(toc) => {
                let keyframe = toc.seek_frame(target, policy.rewind_for(&self.info.codec));
                let seconds = self.seconds_for_frame(keyframe);
                let actual = self.seek_5(&toc.offsets, keyframe as usize, seconds)?;
                debug!(target, keyframe, actual, "video seek through table of contents");
                self.timestamps.reset(actual as i64);
                self.current = actual as i64;
            }
            None => {
                let seconds = self.seconds_for_frame(target);
                self.container.seek(self.info.index, seconds)?;
                self.reset_decoder();
                debug!(target, seconds, "video seek by timestamp");
                self.timestamps.reset(target);
                self.current = target;
            }
        }
        Ok(())
    }

    fn decode_video(
        &mut self,
        target: i64,
        toc: Option<&VideoToc>,
        policy: &SeekPolicy,
        force_seek: bool,
        on_skipped: &mut dyn FnMut(i64, &Picture),
    ) -> Result<Picture> {
        if force_seek || target < self.current || target - self.current > policy.seek_threshold {
            self.seek_video(target, toc, policy)?;
        }
        loop {
            let picture = match self.next_decoded()? {
                Some(Decoded::Video(picture)) => picture,
                Some(Decoded::Audio(_)) => continue,
                None => {
                    return Err(Error::decode(format!(
                        "frame {target} is past the end of stream {}",
                        self.info.index
                    )))
                }
            };
            let index = self.index_from_pts(picture.pts, toc.is_some());
            self.current = index + 1;
            if index < target {
                on_skipped(index, &picture);
                continue;
            }
            if index > target {
                warn!(target, decoded = index, "frame missing from stream; using the next one");
            }
            return Ok(picture);
        }
    }

    /// Signal end of stream and collect what the decoder still holds.
    /// Returns `target` if it was among the buffered pictures.
    fn drain_video(
        &mut self,
        target: i64,
        by_toc: bool,
        on_skipped: &mut dyn FnMut(i64, &Picture),
    ) -> Option<Picture> {
        self.pending = None;
        if !self.eof_sent {
            if let Err(e) = self.decoder.send_eof() {
                debug!(stream = self.info.index, "decoder refused end of stream: {e}");
                return None;
            }
            self.eof_sent = true;
        }
        loop {
            let picture = match self.decoder.receive() {
                Ok(Some(Decoded::Video(picture))) => picture,
                Ok(Some(Decoded::Audio(_))) => continue,
                Ok(None) => return None,
                Err(e) => {
                    debug!(stream = self.info.index, "drain failed: {e}");
                    return None;
                }
            };
            let index = self.index_from_pts(picture.pts, by_toc);
            self.current = index + 1;
            match index.cmp(&target) {
                std::cmp::Ordering::Less => on_skipped(index, &picture),
                std::cmp::Ordering::Equal => return Some(picture),
                std::cmp::Ordering::Greater => return None,
            }
        }
    }

    /// Decode frame `target`, handing every picture decoded on the way to
    /// `on_skipped`.
    ///
    /// When a decode fails, the decoder is drained first: a frame it was
    /// still holding is returned and the stream is marked for restart
    /// before the next read. Otherwise the read is retried once after a
    /// fresh seek, and a second failure marks the stream for restart.
    pub fn read_video(
        &mut self,
        target: i64,
        toc: Option<&VideoToc>,
        policy: &SeekPolicy,
        on_skipped: &mut dyn FnMut(i64, &Picture),
    ) -> Result<Picture> {
        match self.decode_video(target, toc, policy, false, on_skipped) {
            Ok(picture) => Ok(picture),
            Err(e) => {
                warn!(stream = self.info.index, target, "decode failed, draining: {e}");
                if let Some(picture) = self.drain_video(target, toc.is_some(), on_skipped) {
                    debug!(stream = self.info.index, target, "recovered a buffered frame");
                    self.need_restart = true;
                    return Ok(picture);
                }
                self.decode_video(target, toc, policy, true, on_skipped)
                    .inspect_err(|_| self.need_restart = true)
            }
        }
    }

    fn seek_audio(
        &mut self,
        sample: i64,
        toc: Option<&AudioToc>,
        video: Option<VideoClock<'_>>,
    ) -> Result<()> {
        let rate = self.info.sample_rate.max(1) as f64;
        match toc {
            Some(toc) if !toc.is_empty() => {
                let (chunk, chunk_start) = toc.chunk_for_sample(sample);
                let chunk = chunk.min(toc.len() - 1);
                let seconds = match video {
                    Some(clock) if clock.frame_rate > 0.0 => {
                        let offset = toc.offsets[chunk];
                        let frame = clock
                            .toc
                            .keyframes
                            .iter()
                            .rev()
                            .find(|k| {
                                clock.toc.offsets.get(**k as usize).is_some_and(|o| *o <= offset)
                            })
                            .map_or(0, |k| *k as i64);
                        frame as f64 / clock.frame_rate
                    }
                    _ => chunk_start as f64 / rate,
                };
                let actual = self.seek_5(&toc.offsets, chunk, seconds)?;
                let start = toc.sample_at_chunk(actual);
                debug!(sample, chunk, actual, start, "audio seek through table of contents");
                self.history.reset(start);
                self.unanchored = None;
            }
            _ => {
                let seconds = sample as f64 / rate;
                self.container.seek(self.info.index, seconds)?;
                self.reset_decoder();
                debug!(sample, seconds, "audio seek by timestamp");
                self.history.reset(sample);
                self.unanchored = Some(sample);
            }
        }
        Ok(())
    }

    /// Decode until the history reaches `until` or the stream ends.
    fn fill_history(&mut self, until: i64) -> Result<()> {
        let rate = self.info.sample_rate.max(1) as f64;
        while self.history.end() < until {
            match self.next_decoded()? {
                Some(Decoded::Audio(frame)) => {
                    if let Some(fallback) = self.unanchored.take() {
                        let start = frame
                            .pts
                            .map_or(fallback, |pts| (self.info.seconds(pts) * rate).round() as i64);
                        self.history.reset(start);
                    }
                    self.history.append(&frame);
                }
                Some(Decoded::Video(_)) => {}
                None => break,
            }
        }
        self.current = self.history.end();
        Ok(())
    }

    #[allow(clippy::too_many_arguments)]
    fn decode_audio(
        &mut self,
        dst: &mut [f64],
        position: i64,
        channel: usize,
        toc: Option<&AudioToc>,
        video: Option<VideoClock<'_>>,
        policy: &SeekPolicy,
        force_seek: bool,
    ) -> Result<()> {
        let rate = self.info.sample_rate.max(1) as usize;
        let rewind = (policy.audio_rewind_seconds.max(0.0) * rate as f64) as i64;
        self.history.grow(dst.len() + rate);

        let coverage = if force_seek {
            Coverage::Reset
        } else {
            self.history.coverage(position, dst.len())
        };
        if coverage == Coverage::Reset {
            self.seek_audio((position - rewind).max(0), toc, video)?;
        }
        if coverage != Coverage::Covered {
            self.fill_history(position + dst.len() as i64)?;
        }
        self.history.read(dst, position, channel);
        Ok(())
    }

    /// Read `dst.len()` samples of `channel` starting at `position`.
    /// Samples past the end of the stream read as silence.
    pub fn read_audio(
        &mut self,
        dst: &mut [f64],
        position: i64,
        channel: usize,
        toc: Option<&AudioToc>,
        video: Option<VideoClock<'_>>,
        policy: &SeekPolicy,
    ) -> Result<()> {
        match self.decode_audio(dst, position, channel, toc, video, policy, false) {
            Ok(()) => Ok(()),
            Err(e) => {
                warn!(stream = self.info.index, position, "audio decode failed, flushing: {e}");
                self.decoder.flush();
                self.decode_audio(dst, position, channel, toc, video, policy, true)
                    .inspect_err(|_| self.need_restart = true)
            }
        }
    }
}
