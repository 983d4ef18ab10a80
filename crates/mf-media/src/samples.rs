//! Audio sample buffers: one channel of `f64` samples in [-1, 1].

use mf_core::{ByteReader, ByteWriter, Error, Result};

use crate::shm::SharedBuffer;

const SAMPLE_BYTES: usize = std::mem::size_of::<f64>();

#[derive(Debug)]
enum Storage {
    Heap(Vec<f64>),
    Shared(SharedBuffer),
}

/// A fixed-length sample buffer, on the heap or in shared memory.
#[derive(Debug)]
pub struct Samples {
    storage: Storage,
    len: usize,
}

impl Samples {
    pub fn new(len: usize) -> Self {
        Self {
            storage: Storage::Heap(vec![0.0; len]),
            len,
        }
    }

    pub fn new_shared(len: usize) -> Result<Self> {
        Ok(Self {
            storage: Storage::Shared(SharedBuffer::create(len * SAMPLE_BYTES)?),
            len,
        })
    }

    pub fn from_vec(samples: Vec<f64>) -> Self {
        let len = samples.len();
        Self {
            storage: Storage::Heap(samples),
            len,
        }
    }

    pub fn len(&self) -> usize {
        self.len
    }

    pub fn is_empty(&self) -> bool {
        self.len == 0
    }

    pub fn is_shared(&self) -> bool {
        matches!(self.storage, Storage::Shared(_))
    }

    pub fn as_slice(&self) -> &[f64] {
        match &self.storage {
            Storage::Heap(samples) => samples,
            // SAFETY: mappings are page aligned and every bit pattern is a
            // valid f64.
            Storage::Shared(buffer) => unsafe { &buffer.align_to::<f64>().1[..self.len] },
        }
    }

    pub fn as_mut_slice(&mut self) -> &mut [f64] {
        let len = self.len;
        match &mut self.storage {
            Storage::Heap(samples) => samples,
            // SAFETY: as in `as_slice`.
            Storage::Shared(buffer) => unsafe { &mut buffer.align_to_mut::<f64>().1[..len] },
        }
    }

    /// Describe for another process: shared buffers by name, heap buffers
    /// inline.
    pub fn encode_into(&self, out: &mut ByteWriter) {
        match &self.storage {
            Storage::Shared(buffer) => {
                out.put_u8(1).put_u64(self.len as u64).put_str(buffer.name());
            }
            Storage::Heap(samples) => {
                out.put_u8(0).put_f64_slice(samples);
            }
        }
    }

    pub fn decode_from(input: &mut ByteReader<'_>) -> Result<Samples> {
        match input.u8()? {
            1 => {
                let len = input.u64()? as usize;
                let name = input.str()?;
                Ok(Self {
                    storage: Storage::Shared(SharedBuffer::open(name, len * SAMPLE_BYTES)?),
                    len,
                })
            }
            0 => Ok(Self::from_vec(input.f64_vec()?)),
            other => Err(Error::Protocol(format!("unknown sample storage tag {other}"))),
        }
    }
}
