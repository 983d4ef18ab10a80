//! Builds the coarse min/max envelope of an audio stream while scanning.

use super::toc::WaveformIndex;

#[derive(Debug, Clone, Copy)]
struct Partial {
    max: f32,
    min: f32,
    count: usize,
}

impl Partial {
    const EMPTY: Partial = Partial {
        max: f32::MIN,
        min: f32::MAX,
        count: 0,
    };
}

/// Accumulates `[max, min]` points of `zoom` samples each. When the index
/// would outgrow its byte budget, adjacent points merge and the zoom
/// doubles.
#[derive(Debug)]
pub struct WaveformBuilder {
    zoom: usize,
    max_points: usize,
    points: Vec<Vec<(f32, f32)>>,
    partial: Vec<Partial>,
}

impl WaveformBuilder {
    /// `length_estimate` is the expected samples per channel; it only
    /// chooses the starting zoom.
    pub fn new(channels: usize, length_estimate: i64, index_bytes: usize) -> Self {
        let channels = channels.max(1);
        let max_points = (index_bytes / (channels * 2 * std::mem::size_of::<f32>())).max(2);
        let mut zoom = 1usize;
        let estimate = length_estimate.max(0) as usize;
        while estimate / zoom > max_points {
            zoom *= 2;
        }
        Self {
            zoom,
            max_points,
            points: vec![Vec::new(); channels],
            partial: vec![Partial::EMPTY; channels],
        }
    }

    pub fn zoom(&self) -> usize {
        self.zoom
    }

    /// Feed decoded samples, one vector per channel.
    pub fn push(&mut self, channels: &[Vec<f64>]) {
        for (channel, samples) in channels.iter().enumerate().take(self.points.len()) {
            for sample in samples {
                let value = *sample as f32;
                let partial = &mut self.partial[channel];
                partial.max = partial.max.max(value);
                partial.min = partial.min.min(value);
                partial.count += 1;
                if partial.count >= self.zoom {
                    self.points[channel].push((partial.max, partial.min));
                    *partial = Partial::EMPTY;
                }
            }
        }
        while self.points.iter().any(|p| p.len() > self.max_points) {
            self.halve();
        }
    }

    fn halve(&mut self) {
        for points in &mut self.points {
            let merged = points
                .chunks(2)
                .map(|pair| {
                    pair.iter()
                        .fold((f32::MIN, f32::MAX), |(hi, lo), (max, min)| {
                            (hi.max(*max), lo.min(*min))
                        })
                })
                .collect();
            *points = merged;
        }
        self.zoom *= 2;
    }

    pub fn finish(mut self) -> WaveformIndex {
        for (channel, partial) in self.partial.iter().enumerate() {
            if partial.count > 0 {
                self.points[channel].push((partial.max, partial.min));
            }
        }
        let size = self.points.iter().map(Vec::len).max().unwrap_or(0);
        let mut data = Vec::with_capacity(size * self.points.len() * 2);
        for points in &self.points {
            for i in 0..size {
                let (max, min) = points.get(i).copied().unwrap_or((0.0, 0.0));
                data.push(max);
                data.push(min);
            }
        }
        WaveformIndex {
            zoom: self.zoom as i32,
            size: size as i32,
            channels: self.points.len() as i32,
            data,
        }
    }
}
