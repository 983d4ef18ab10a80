//! The one linear pass over a file that builds its table of contents.

use mf_core::{Error, Preferences, ProgressSink, Result};
use tracing::{debug, info};

use super::container::{Container, Decoded, StreamDecoder};
use super::toc::{AudioToc, TocFile, VideoToc};
use super::waveform::WaveformBuilder;

const SCAN_TITLE: &str = "Building table of contents";

/// Packets between cancellation checks.
const CANCEL_CHECK_INTERVAL: usize = 32;

struct AudioScan {
    stream: usize,
    decoder: Box<dyn StreamDecoder>,
    toc: AudioToc,
    waveform: WaveformBuilder,
}

impl AudioScan {
    /// Decode everything the decoder has ready; returns samples produced.
    fn drain(&mut self) -> Result<i32> {
        let mut produced = 0i32;
        while let Some(decoded) = self.decoder.receive()? {
            if let Decoded::Audio(frame) = decoded {
                produced += frame.samples as i32;
                self.waveform.push(&frame.to_channels());
            }
        }
        Ok(produced)
    }
}

/// Scan `container` from its current position, which must be the start of
/// the file. `audio_streams` are indexed in the order given; only
/// `video_stream` is recorded for video.
pub fn build_toc(
    container: &mut dyn Container,
    audio_streams: &[usize],
    video_stream: Option<usize>,
    prefs: &Preferences,
    progress: &mut dyn ProgressSink,
) -> Result<TocFile> {
    let mut audio = Vec::with_capacity(audio_streams.len());
    for &stream in audio_streams {
        let info = container
            .info()
            .streams
            .iter()
            .find(|s| s.index == stream)
            .ok_or_else(|| Error::decode(format!("no stream {stream}")))?;
        let waveform = WaveformBuilder::new(
            info.channels.max(1) as usize,
            info.length_estimate,
            prefs.toc.index_bytes,
        );
        audio.push(AudioScan {
            stream,
            decoder: container.open_decoder(stream, 1, false)?,
            toc: AudioToc::default(),
            waveform,
        });
    }
    let mut video = VideoToc::default();

    let total = container.byte_size() as i64;
    progress.start(SCAN_TITLE, total);
    info!(audio = audio.len(), video = video_stream.is_some(), "scanning for table of contents");

    let mut packets = 0usize;
    loop {
        if packets % CANCEL_CHECK_INTERVAL == 0 && progress.is_cancelled() {
            progress.stop(SCAN_TITLE);
            info!("table of contents scan cancelled");
            return Err(Error::UserCanceled);
        }
        let Some(packet) = container.read_packet()? else {
            break;
        };
        packets += 1;

        if Some(packet.stream) == video_stream {
            video.push(packet.offset, packet.keyframe);
        } else if let Some(scan) = audio.iter_mut().find(|a| a.stream == packet.stream) {
            scan.decoder.send_packet(&packet)?;
            let samples = scan.drain()?;
            scan.toc.push(packet.offset, samples);
        }
        progress.update(packet.offset.min(total));
    }

    let mut toc = TocFile::default();
    for mut scan in audio {
        // Decoder delay: whatever is still buffered belongs to the last chunk.
        scan.decoder.send_eof()?;
        let tail = scan.drain()?;
        if let Some(last) = scan.toc.samples.last_mut() {
            *last += tail;
            scan.toc.total_samples += tail as i64;
        }
        debug!(
            stream = scan.stream,
            chunks = scan.toc.len(),
            samples = scan.toc.total_samples,
            "audio stream indexed"
        );
        toc.waveforms.push(scan.waveform.finish());
        toc.audio.push(scan.toc);
    }
    if video_stream.is_some() {
        debug!(
            frames = video.frames(),
            keyframes = video.keyframes.len(),
            "video stream indexed"
        );
        toc.video.push(video);
    }

    progress.update(total);
    progress.stop(SCAN_TITLE);
    Ok(toc)
}
