//! mf-media: frames, sample buffers, shared memory and the frame cache.

pub mod cache;
pub mod color;
pub mod frame;
pub mod samples;
pub mod shm;

pub use cache::FrameCache;
pub use color::{transfer, ColorModel};
pub use frame::VideoFrame;
pub use samples::Samples;
pub use shm::SharedBuffer;
