//! Decoded PCM and its conversion to normalized `f64`.

use tracing::warn;

/// Sample layout of a decoded audio frame.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum SampleFormat {
    U8,
    S16,
    S32,
    F32,
    F64,
    U8Planar,
    S16Planar,
    S32Planar,
    F32Planar,
    F64Planar,
    /// Anything else the decoder may produce; converted to silence.
    Other(String),
}

impl SampleFormat {
    pub fn is_planar(&self) -> bool {
        matches!(
            self,
            SampleFormat::U8Planar
                | SampleFormat::S16Planar
                | SampleFormat::S32Planar
                | SampleFormat::F32Planar
                | SampleFormat::F64Planar
        )
    }

    /// Bytes per sample, `None` for unsupported formats.
    pub fn sample_bytes(&self) -> Option<usize> {
        match self {
            SampleFormat::U8 | SampleFormat::U8Planar => Some(1),
            SampleFormat::S16 | SampleFormat::S16Planar => Some(2),
            SampleFormat::S32
            | SampleFormat::S32Planar
            | SampleFormat::F32
            | SampleFormat::F32Planar => Some(4),
            SampleFormat::F64 | SampleFormat::F64Planar => Some(8),
            SampleFormat::Other(_) => None,
        }
    }

    fn decode(&self, bytes: &[u8]) -> f64 {
        match self {
            SampleFormat::U8 | SampleFormat::U8Planar => (bytes[0] as f64 - 128.0) / 127.0,
            SampleFormat::S16 | SampleFormat::S16Planar => {
                i16::from_le_bytes([bytes[0], bytes[1]]) as f64 / 32767.0
            }
            SampleFormat::S32 | SampleFormat::S32Planar => {
                i32::from_le_bytes([bytes[0], bytes[1], bytes[2], bytes[3]]) as f64
                    / 0x7fff_ffff as f64
            }
            SampleFormat::F32 | SampleFormat::F32Planar => {
                f32::from_le_bytes([bytes[0], bytes[1], bytes[2], bytes[3]]) as f64
            }
            SampleFormat::F64 | SampleFormat::F64Planar => {
                let mut raw = [0u8; 8];
                raw.copy_from_slice(&bytes[..8]);
                f64::from_le_bytes(raw)
            }
            SampleFormat::Other(_) => 0.0,
        }
    }
}

/// One decoded audio frame as raw bytes.
///
/// Planar frames carry one plane per channel, interleaved frames a single
/// plane with channels alternating.
#[derive(Debug, Clone, PartialEq)]
pub struct PcmFrame {
    pub format: SampleFormat,
    pub channels: usize,
    /// Samples per channel.
    pub samples: usize,
    pub planes: Vec<Vec<u8>>,
    pub pts: Option<i64>,
}

impl PcmFrame {
    /// Append `channel` of this frame, normalized to [-1, 1], onto `out`.
    ///
    /// Unsupported sample formats and short planes contribute silence so
    /// sample positions stay aligned.
    pub fn append_channel(&self, channel: usize, out: &mut Vec<f64>) {
        let start = out.len();
        out.resize(start + self.samples, 0.0);
        let dst = &mut out[start..];

        let Some(width) = self.format.sample_bytes() else {
            warn!("unsupported audio sample format {:?}; inserting silence", self.format);
            return;
        };
        if channel >= self.channels {
            return;
        }

        let (plane, stride, first) = if self.format.is_planar() {
            match self.planes.get(channel) {
                Some(plane) => (plane, width, 0),
                None => return,
            }
        } else {
            match self.planes.first() {
                Some(plane) => (plane, width * self.channels, width * channel),
                None => return,
            }
        };

        for (i, sample) in dst.iter_mut().enumerate() {
            let at = first + i * stride;
            match plane.get(at..at + width) {
                Some(bytes) => *sample = self.format.decode(bytes),
                None => break,
            }
        }
    }

    /// Convert every channel.
    pub fn to_channels(&self) -> Vec<Vec<f64>> {
        (0..self.channels)
            .map(|channel| {
                let mut out = Vec::with_capacity(self.samples);
                self.append_channel(channel, &mut out);
                out
            })
            .collect()
    }
}
