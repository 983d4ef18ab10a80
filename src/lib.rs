//! mediafork - crash-isolated media file I/O.
//!
//! The library crate holds what the `mediafork` binary prints, so the
//! integration tests can check it without spawning the binary.

pub mod report;

pub use mf_core::{Asset, Error, Preferences};
pub use mf_file::{MediaFile, WorkerPool};
