//! mf-decode: format backends and the container seek engine.
//!
//! A [`DecoderRegistry`] picks a [`BackendKind`] for a file, either from the
//! asset's declared format or by sniffing its first bytes. Each kind
//! instantiates a [`DecoderBackend`]:
//!
//! - `wav` - RIFF WAVE through `hound`
//! - `still` - PNG and JPEG through `image`
//! - `ffmpeg` - any container FFmpeg understands, with a sidecar table of
//!   contents for frame-accurate seeking (requires the `native-ffmpeg`
//!   feature)

pub mod backend;
pub mod demux;
pub mod registry;
pub mod still;
pub mod wav;

pub use backend::{Capabilities, DecoderBackend, FrameRead, OpenRequest};
pub use demux::{toc_path, DemuxBackend, TocFile, WaveformIndex};
pub use registry::{BackendKind, DecoderRegistry};
pub use still::StillBackend;
pub use wav::WavBackend;
