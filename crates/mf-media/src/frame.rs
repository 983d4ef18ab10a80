//! Video frames and their transport descriptors.
//!
//! A frame either owns heap memory or wraps a [`SharedBuffer`]. Shared
//! frames cross a process boundary by name, so a worker can decode
//! directly into the caller's pixels; heap frames are shipped inline.

use mf_core::{ByteReader, ByteWriter, Error, Result};
use std::collections::BTreeMap;

use crate::color::ColorModel;
use crate::shm::SharedBuffer;

const STORAGE_HEAP: u8 = 0;
const STORAGE_SHARED: u8 = 1;
const STORAGE_SHAPE_ONLY: u8 = 2;

#[derive(Debug)]
enum Storage {
    Heap(Vec<u8>),
    Shared(SharedBuffer),
}

impl Storage {
    fn bytes(&self) -> &[u8] {
        match self {
            Storage::Heap(data) => data,
            Storage::Shared(buffer) => buffer,
        }
    }

    fn bytes_mut(&mut self) -> &mut [u8] {
        match self {
            Storage::Heap(data) => data,
            Storage::Shared(buffer) => buffer,
        }
    }
}

/// One picture plus the metadata a decoder attaches to it.
#[derive(Debug)]
pub struct VideoFrame {
    width: usize,
    height: usize,
    color_model: ColorModel,
    storage: Storage,
    /// Frame number this picture was decoded for.
    pub position: i64,
    pub keyframe: bool,
    /// Valid bytes of a [`ColorModel::Compressed`] frame.
    pub compressed_size: usize,
    /// Free-form decoder parameters (timecodes, HDR metadata, ...).
    pub params: BTreeMap<String, String>,
}

impl VideoFrame {
    /// A zeroed heap frame.
    pub fn new(width: usize, height: usize, color_model: ColorModel) -> Self {
        Self::with_storage(
            width,
            height,
            color_model,
            Storage::Heap(vec![0; color_model.frame_size(width, height)]),
        )
    }

    /// A zeroed frame in shared memory.
    pub fn new_shared(width: usize, height: usize, color_model: ColorModel) -> Result<Self> {
        let buffer = SharedBuffer::create(color_model.frame_size(width, height))?;
        Ok(Self::with_storage(width, height, color_model, Storage::Shared(buffer)))
    }

    /// A compressed frame holding a copy of `data`.
    pub fn compressed(data: &[u8]) -> Self {
        let mut frame = Self::with_storage(0, 0, ColorModel::Compressed, Storage::Heap(Vec::new()));
        frame.set_compressed(data);
        frame
    }

    fn with_storage(width: usize, height: usize, color_model: ColorModel, storage: Storage) -> Self {
        Self {
            width,
            height,
            color_model,
            storage,
            position: -1,
            keyframe: false,
            compressed_size: 0,
            params: BTreeMap::new(),
        }
    }

    pub fn width(&self) -> usize {
        self.width
    }

    pub fn height(&self) -> usize {
        self.height
    }

    pub fn color_model(&self) -> ColorModel {
        self.color_model
    }

    pub fn data(&self) -> &[u8] {
        self.storage.bytes()
    }

    pub fn data_mut(&mut self) -> &mut [u8] {
        self.storage.bytes_mut()
    }

    /// Bytes this frame occupies, as counted by caches.
    pub fn byte_len(&self) -> usize {
        self.storage.bytes().len()
    }

    pub fn is_shared(&self) -> bool {
        matches!(self.storage, Storage::Shared(_))
    }

    pub fn shm_name(&self) -> Option<&str> {
        match &self.storage {
            Storage::Shared(buffer) => Some(buffer.name()),
            Storage::Heap(_) => None,
        }
    }

    /// Same layout and dimensions.
    pub fn matches(&self, color_model: ColorModel, width: usize, height: usize) -> bool {
        self.color_model == color_model && self.width == width && self.height == height
    }

    pub fn same_shape(&self, other: &VideoFrame) -> bool {
        other.matches(self.color_model, self.width, self.height)
    }

    /// Replace the contents of a compressed frame.
    pub fn set_compressed(&mut self, data: &[u8]) {
        match &mut self.storage {
            Storage::Heap(buf) => {
                buf.clear();
                buf.extend_from_slice(data);
            }
            Storage::Shared(buffer) => {
                let len = data.len().min(buffer.len());
                buffer[..len].copy_from_slice(&data[..len]);
            }
        }
        self.compressed_size = data.len();
    }

    /// The valid bytes of a compressed frame.
    pub fn compressed_data(&self) -> &[u8] {
        let data = self.data();
        &data[..self.compressed_size.min(data.len())]
    }

    /// Copy pixels and metadata from a frame of the same shape.
    pub fn copy_from(&mut self, other: &VideoFrame) -> Result<()> {
        if self.color_model == ColorModel::Compressed && other.color_model == ColorModel::Compressed {
            self.set_compressed(other.compressed_data());
        } else if self.same_shape(other) {
            self.data_mut().copy_from_slice(other.data());
            self.compressed_size = other.compressed_size;
        } else {
            return Err(Error::decode(format!(
                "frame copy {}x{} {} <- {}x{} {}",
                self.width,
                self.height,
                self.color_model,
                other.width,
                other.height,
                other.color_model
            )));
        }
        self.copy_metadata(other);
        Ok(())
    }

    pub fn copy_metadata(&mut self, other: &VideoFrame) {
        self.position = other.position;
        self.keyframe = other.keyframe;
        self.params = other.params.clone();
    }

    /// A heap copy of this frame.
    pub fn to_heap(&self) -> VideoFrame {
        let mut copy = Self::with_storage(
            self.width,
            self.height,
            self.color_model,
            Storage::Heap(self.data().to_vec()),
        );
        copy.compressed_size = self.compressed_size;
        copy.copy_metadata(self);
        copy
    }

    /// Describe this frame for another process. Shared frames travel by
    /// name, heap frames carry their pixels.
    pub fn encode_into(&self, out: &mut ByteWriter) {
        self.encode_header(out);
        match &self.storage {
            Storage::Shared(buffer) => {
                out.put_u8(STORAGE_SHARED).put_str(buffer.name());
            }
            Storage::Heap(data) => {
                out.put_u8(STORAGE_HEAP).put_bytes(data);
            }
        }
    }

    /// Describe only the shape and metadata; the receiver allocates.
    pub fn encode_shape_into(&self, out: &mut ByteWriter) {
        self.encode_header(out);
        out.put_u8(STORAGE_SHAPE_ONLY);
    }

    fn encode_header(&self, out: &mut ByteWriter) {
        out.put_u32(self.width as u32)
            .put_u32(self.height as u32)
            .put_i32(self.color_model.code())
            .put_i64(self.position)
            .put_bool(self.keyframe)
            .put_u64(self.compressed_size as u64)
            .put_u32(self.params.len() as u32);
        for (key, value) in &self.params {
            out.put_str(key).put_str(value);
        }
    }

    /// Rebuild a frame from [`VideoFrame::encode_into`] or
    /// [`VideoFrame::encode_shape_into`]. Shared frames map the sender's
    /// buffer.
    pub fn decode_from(input: &mut ByteReader<'_>) -> Result<VideoFrame> {
        let width = input.u32()? as usize;
        let height = input.u32()? as usize;
        let color_model = ColorModel::from_code(input.i32()?)?;
        let position = input.i64()?;
        let keyframe = input.bool()?;
        let compressed_size = input.u64()? as usize;
        let params = decode_params(input)?;
        let size = color_model.frame_size(width, height);

        let storage = match input.u8()? {
            STORAGE_SHARED => {
                let name = input.str()?;
                let len = if color_model == ColorModel::Compressed {
                    compressed_size
                } else {
                    size
                };
                Storage::Shared(SharedBuffer::open(name, len)?)
            }
            STORAGE_HEAP => Storage::Heap(input.bytes()?.to_vec()),
            STORAGE_SHAPE_ONLY => Storage::Heap(vec![0; size]),
            other => return Err(Error::Protocol(format!("unknown frame storage tag {other}"))),
        };
        if color_model != ColorModel::Compressed && storage.bytes().len() != size {
            return Err(Error::Protocol(format!(
                "frame {width}x{height} {color_model} carries {} bytes, expected {size}",
                storage.bytes().len()
            )));
        }

        let mut frame = Self::with_storage(width, height, color_model, storage);
        frame.position = position;
        frame.keyframe = keyframe;
        frame.compressed_size = compressed_size;
        frame.params = params;
        Ok(frame)
    }

    /// Metadata only: position, keyframe flag, compressed size, params.
    pub fn encode_metadata_into(&self, out: &mut ByteWriter) {
        out.put_i64(self.position)
            .put_bool(self.keyframe)
            .put_u64(self.compressed_size as u64)
            .put_u32(self.params.len() as u32);
        for (key, value) in &self.params {
            out.put_str(key).put_str(value);
        }
    }

    pub fn apply_metadata(&mut self, input: &mut ByteReader<'_>) -> Result<()> {
        self.position = input.i64()?;
        self.keyframe = input.bool()?;
        self.compressed_size = input.u64()? as usize;
        self.params = decode_params(input)?;
        Ok(())
    }
}

fn decode_params(input: &mut ByteReader<'_>) -> Result<BTreeMap<String, String>> {
    let count = input.u32()?;
    let mut params = BTreeMap::new();
    for _ in 0..count {
        let key = input.str()?.to_string();
        let value = input.str()?.to_string();
        params.insert(key, value);
    }
    Ok(params)
}

#[cfg(test)]
mod tests {
    use super::*;
    use assert_matches::assert_matches;

    fn encoded(frame: &VideoFrame) -> Vec<u8> {
        let mut out = ByteWriter::new();
        frame.encode_into(&mut out);
        out.into_inner()
    }

    #[test]
    fn heap_descriptor_carries_pixels() {
        let mut frame = VideoFrame::new(2, 1, ColorModel::Rgb888);
        frame.data_mut().copy_from_slice(&[1, 2, 3, 4, 5, 6]);
        frame.position = 12;
        frame.keyframe = true;
        frame.params.insert("timecode".into(), "00:00:01:00".into());

        let buf = encoded(&frame);
        let decoded = VideoFrame::decode_from(&mut ByteReader::new(&buf)).unwrap();
        assert!(!decoded.is_shared());
        assert_eq!(decoded.data(), frame.data());
        assert_eq!(decoded.position, 12);
        assert!(decoded.keyframe);
        assert_eq!(decoded.params["timecode"], "00:00:01:00");
    }

    #[test]
    fn shared_descriptor_maps_same_pixels() {
        let mut frame = VideoFrame::new_shared(4, 4, ColorModel::Rgba8888).unwrap();
        let buf = encoded(&frame);
        assert!(buf.len() < frame.byte_len());

        let mut remote = VideoFrame::decode_from(&mut ByteReader::new(&buf)).unwrap();
        assert!(remote.is_shared());
        remote.data_mut()[0] = 200;
        assert_eq!(frame.data()[0], 200);
        frame.data_mut()[1] = 100;
        assert_eq!(remote.data()[1], 100);
    }

    #[test]
    fn shape_descriptor_allocates() {
        let frame = VideoFrame::new(3, 2, ColorModel::Bgr8888);
        let mut out = ByteWriter::new();
        frame.encode_shape_into(&mut out);
        let buf = out.into_inner();
        let decoded = VideoFrame::decode_from(&mut ByteReader::new(&buf)).unwrap();
        assert!(decoded.matches(ColorModel::Bgr8888, 3, 2));
        assert_eq!(decoded.byte_len(), 18);
    }

    #[test]
    fn size_mismatch_is_protocol_error() {
        let mut out = ByteWriter::new();
        out.put_u32(2)
            .put_u32(2)
            .put_i32(ColorModel::Rgb888.code())
            .put_i64(0)
            .put_bool(false)
            .put_u64(0)
            .put_u32(0)
            .put_u8(STORAGE_HEAP)
            .put_bytes(&[0; 5]);
        let buf = out.into_inner();
        assert_matches!(
            VideoFrame::decode_from(&mut ByteReader::new(&buf)),
            Err(Error::Protocol(_))
        );
    }

    #[test]
    fn compressed_frames_track_their_size() {
        let frame = VideoFrame::compressed(b"\x00\x00\x01\x65abc");
        assert_eq!(frame.compressed_size, 7);
        let mut copy = VideoFrame::compressed(&[]);
        copy.copy_from(&frame).unwrap();
        assert_eq!(copy.compressed_data(), frame.compressed_data());
    }

    #[test]
    fn copy_requires_same_shape() {
        let src = VideoFrame::new(2, 2, ColorModel::Rgb888);
        let mut dst = VideoFrame::new(2, 2, ColorModel::Rgba8888);
        assert!(dst.copy_from(&src).is_err());
    }

    #[test]
    fn metadata_travels_separately() {
        let mut frame = VideoFrame::new(1, 1, ColorModel::Rgb888);
        frame.position = 99;
        frame.params.insert("k".into(), "v".into());
        let mut out = ByteWriter::new();
        frame.encode_metadata_into(&mut out);
        let buf = out.into_inner();

        let mut other = VideoFrame::new(1, 1, ColorModel::Rgb888);
        other.apply_metadata(&mut ByteReader::new(&buf)).unwrap();
        assert_eq!(other.position, 99);
        assert_eq!(other.params, frame.params);
    }
}
