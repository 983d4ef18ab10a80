//! Printable summaries for the command-line tool.

use mf_decode::TocFile;
use serde::Serialize;

/// Peak and energy of a run of samples.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct SampleStats {
    pub channel: i32,
    pub start: i64,
    pub len: usize,
    pub min: f64,
    pub max: f64,
    pub rms: f64,
}

impl SampleStats {
    pub fn compute(channel: i32, start: i64, samples: &[f64]) -> Self {
        if samples.is_empty() {
            return Self {
                channel,
                start,
                len: 0,
                min: 0.0,
                max: 0.0,
                rms: 0.0,
            };
        }
        let (min, max) = samples
            .iter()
            .fold((f64::INFINITY, f64::NEG_INFINITY), |(lo, hi), s| {
                (lo.min(*s), hi.max(*s))
            });
        let energy: f64 = samples.iter().map(|s| s * s).sum();
        Self {
            channel,
            start,
            len: samples.len(),
            min,
            max,
            rms: (energy / samples.len() as f64).sqrt(),
        }
    }

    /// Peak level in dBFS; silence reports negative infinity.
    pub fn peak_db(&self) -> f64 {
        20.0 * self.min.abs().max(self.max.abs()).log10()
    }
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct AudioTocSummary {
    pub chunks: usize,
    pub samples: i64,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct VideoTocSummary {
    pub frames: i64,
    pub keyframes: usize,
}

/// What a sidecar table of contents records.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct TocSummary {
    pub fresh: bool,
    pub audio: Vec<AudioTocSummary>,
    pub video: Vec<VideoTocSummary>,
    pub waveforms: usize,
}

impl TocSummary {
    pub fn new(toc: &TocFile, fresh: bool) -> Self {
        Self {
            fresh,
            audio: toc
                .audio
                .iter()
                .map(|a| AudioTocSummary {
                    chunks: a.len(),
                    samples: a.total_samples,
                })
                .collect(),
            video: toc
                .video
                .iter()
                .map(|v| VideoTocSummary {
                    frames: v.frames(),
                    keyframes: v.keyframes.len(),
                })
                .collect(),
            waveforms: toc.waveforms.len(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use mf_decode::demux::{AudioToc, VideoToc};

    #[test]
    fn stats_of_a_square_wave() {
        let samples = [0.5, -0.5, 0.5, -0.5];
        let stats = SampleStats::compute(1, 100, &samples);
        assert_eq!(stats.len, 4);
        assert_eq!(stats.min, -0.5);
        assert_eq!(stats.max, 0.5);
        assert!((stats.rms - 0.5).abs() < 1e-12);
        assert!((stats.peak_db() + 6.0206).abs() < 1e-3);
    }

    #[test]
    fn stats_of_nothing() {
        let stats = SampleStats::compute(0, 0, &[]);
        assert_eq!(stats.len, 0);
        assert_eq!(stats.rms, 0.0);
        assert_eq!(stats.peak_db(), f64::NEG_INFINITY);
    }

    #[test]
    fn toc_summary_counts_tables() {
        let mut audio = AudioToc::default();
        audio.push(0, 1024);
        audio.push(400, 1024);
        let mut video = VideoToc::default();
        for (offset, key) in [(0, true), (10, false), (20, false), (30, true)] {
            video.push(offset, key);
        }
        let toc = TocFile {
            audio: vec![audio],
            video: vec![video],
            ..TocFile::default()
        };

        let summary = TocSummary::new(&toc, true);
        assert_eq!(
            summary.audio,
            vec![AudioTocSummary {
                chunks: 2,
                samples: 2048
            }]
        );
        assert_eq!(
            summary.video,
            vec![VideoTocSummary {
                frames: 4,
                keyframes: 2
            }]
        );
        assert_eq!(summary.waveforms, 0);
    }
}
