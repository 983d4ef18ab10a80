//! Per-file cache of decoded frames with LRU eviction.
//!
//! Entries are keyed by frame position, layer and frame rate. A lookup
//! only hits when the cached picture also has the requested color model
//! and dimensions. Memory is tracked in bytes; inserting past the budget
//! evicts least-recently-used frames.

use lru::LruCache;
use tracing::trace;

use crate::color::ColorModel;
use crate::frame::VideoFrame;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
struct CacheKey {
    position: i64,
    layer: i32,
    frame_rate_bits: u64,
}

impl CacheKey {
    fn new(position: i64, layer: i32, frame_rate: f64) -> Self {
        Self {
            position,
            layer,
            frame_rate_bits: frame_rate.to_bits(),
        }
    }
}

#[derive(Debug)]
pub struct FrameCache {
    entries: LruCache<CacheKey, VideoFrame>,
    bytes: usize,
    max_bytes: usize,
}

impl FrameCache {
    pub fn new(max_bytes: usize) -> Self {
        Self {
            entries: LruCache::unbounded(),
            bytes: 0,
            max_bytes,
        }
    }

    /// Copy a cached picture into `frame` if one matches its shape.
    pub fn get_frame(&mut self, frame: &mut VideoFrame, layer: i32, frame_rate: f64) -> bool {
        let key = CacheKey::new(frame.position, layer, frame_rate);
        let Some(cached) = self.entries.get(&key) else {
            return false;
        };
        if !cached.same_shape(frame) {
            return false;
        }
        match frame.copy_from(cached) {
            Ok(()) => {
                trace!(position = key.position, layer, "frame cache hit");
                true
            }
            Err(_) => false,
        }
    }

    /// Whether a frame of this shape is cached, without touching LRU order.
    pub fn contains(
        &self,
        position: i64,
        layer: i32,
        frame_rate: f64,
        color_model: ColorModel,
        width: usize,
        height: usize,
    ) -> bool {
        self.entries
            .peek(&CacheKey::new(position, layer, frame_rate))
            .is_some_and(|cached| cached.matches(color_model, width, height))
    }

    /// Store a copy of `frame` under its position.
    pub fn put_frame(&mut self, frame: &VideoFrame, layer: i32, frame_rate: f64) {
        let key = CacheKey::new(frame.position, layer, frame_rate);
        let copy = frame.to_heap();
        self.bytes += copy.byte_len();
        if let Some(old) = self.entries.put(key, copy) {
            self.bytes -= old.byte_len();
        }
        while self.bytes > self.max_bytes && self.entries.len() > 1 {
            self.delete_oldest();
        }
    }

    /// Evict the least-recently-used frame. Returns the bytes freed.
    pub fn delete_oldest(&mut self) -> usize {
        match self.entries.pop_lru() {
            Some((key, frame)) => {
                let freed = frame.byte_len();
                self.bytes -= freed;
                trace!(position = key.position, freed, "evicted cached frame");
                freed
            }
            None => 0,
        }
    }

    /// Drop every cached frame.
    pub fn remove_all(&mut self) {
        self.entries.clear();
        self.bytes = 0;
    }

    pub fn memory_usage(&self) -> usize {
        self.bytes
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    pub fn max_bytes(&self) -> usize {
        self.max_bytes
    }

    /// Change the budget, evicting down to it.
    pub fn set_max_bytes(&mut self, max_bytes: usize) {
        self.max_bytes = max_bytes;
        while self.bytes > self.max_bytes && !self.entries.is_empty() {
            self.delete_oldest();
        }
    }
}
