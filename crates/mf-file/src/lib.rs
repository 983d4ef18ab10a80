//! mf-file: the media file front end and its worker processes.
//!
//! [`MediaFile`] is what the editor holds. With isolation enabled in the
//! preferences, the decoder runs in a [`FileWorker`] process forked
//! directly or through a [`WorkerPool`], and a crash there costs at most a
//! transparent reopen. Without it, the backend runs in-process.

pub mod handle;
mod local;
pub mod media_file;
pub mod opcode;
pub mod payload;
pub mod pool;
pub mod progress;
mod remote;
pub mod thread;
pub mod worker;

pub use handle::FileWorkerHandle;
pub use local::{AudioBuffer, VideoBuffer};
pub use media_file::MediaFile;
pub use pool::WorkerPool;
pub use progress::{relay_progress, LinkProgress};
pub use thread::{BufferGuard, FileThread};
pub use worker::FileWorker;
