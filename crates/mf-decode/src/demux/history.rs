//! Sliding window of decoded PCM used for sample-accurate audio reads.
//!
//! The window covers `[start, start + size)`; `start + size` is always the
//! next sample the decoder will produce. A read that begins outside
//! `[start, start + size]` cannot be served by decoding forward and forces
//! a reset and a fresh seek.

use super::pcm::PcmFrame;

#[derive(Debug)]
pub struct PcmHistory {
    channels: Vec<Vec<f64>>,
    start: i64,
    max: usize,
}

/// What a read needs before it can be served.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Coverage {
    /// Fully inside the window.
    Covered,
    /// Starts inside the window; decode forward from its end.
    Extend,
    /// Outside the window; reset and seek.
    Reset,
}

impl PcmHistory {
    pub fn new(channels: usize, max: usize) -> Self {
        Self {
            channels: vec![Vec::new(); channels],
            start: 0,
            max: max.max(1),
        }
    }

    pub fn start(&self) -> i64 {
        self.start
    }

    pub fn size(&self) -> usize {
        self.channels.first().map_or(0, Vec::len)
    }

    /// Next sample to be appended.
    pub fn end(&self) -> i64 {
        self.start + self.size() as i64
    }

    pub fn capacity(&self) -> usize {
        self.max
    }

    /// Raise the capacity to at least `max` samples.
    pub fn grow(&mut self, max: usize) {
        self.max = self.max.max(max);
    }

    pub fn coverage(&self, position: i64, len: usize) -> Coverage {
        if position < self.start || position > self.end() {
            Coverage::Reset
        } else if position + len as i64 <= self.end() {
            Coverage::Covered
        } else {
            Coverage::Extend
        }
    }

    /// Empty the window; the next appended sample is `start`.
    pub fn reset(&mut self, start: i64) {
        for channel in &mut self.channels {
            channel.clear();
        }
        self.start = start;
    }

    /// Append a decoded frame, dropping the oldest samples past capacity.
    pub fn append(&mut self, frame: &PcmFrame) {
        for (channel, buffer) in self.channels.iter_mut().enumerate() {
            frame.append_channel(channel, buffer);
        }
        self.trim();
    }

    /// Append already converted samples, one slice per channel.
    pub fn append_converted(&mut self, samples: &[Vec<f64>]) {
        let len = samples.first().map_or(0, Vec::len);
        for (channel, buffer) in self.channels.iter_mut().enumerate() {
            match samples.get(channel) {
                Some(src) => buffer.extend_from_slice(src),
                None => buffer.resize(buffer.len() + len, 0.0),
            }
        }
        self.trim();
    }

    /// Discard samples before `position`, never past the window end.
    pub fn discard_before(&mut self, position: i64) {
        let drop = (position - self.start).clamp(0, self.size() as i64) as usize;
        if drop > 0 {
            for channel in &mut self.channels {
                channel.drain(..drop);
            }
            self.start += drop as i64;
        }
    }

    fn trim(&mut self) {
        let size = self.size();
        if size > self.max {
            let excess = size - self.max;
            for channel in &mut self.channels {
                channel.drain(..excess);
            }
            self.start += excess as i64;
        }
    }

    /// Copy `dst.len()` samples of `channel` from `position`. Samples
    /// beyond the window are zeroed. Returns how many came from history.
    pub fn read(&self, dst: &mut [f64], position: i64, channel: usize) -> usize {
        dst.fill(0.0);
        let Some(buffer) = self.channels.get(channel) else {
            return 0;
        };
        if position < self.start {
            return 0;
        }
        let from = (position - self.start) as usize;
        if from >= buffer.len() {
            return 0;
        }
        let count = dst.len().min(buffer.len() - from);
        dst[..count].copy_from_slice(&buffer[from..from + count]);
        count
    }
}
