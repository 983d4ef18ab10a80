//! mf-core: shared types, errors, preferences, and progress reporting.
//!
//! This crate is the foundational dependency for all other mf-* crates,
//! providing the [`Asset`] value object, the unified error type with its
//! [`FileStatus`] vocabulary, editor [`Preferences`], and the
//! [`ProgressSink`] capability used during table-of-contents construction.

pub mod asset;
pub mod codec;
pub mod config;
pub mod error;
pub mod progress;

/// Smallest footprint reported for an open file, so a nearly empty handle
/// still counts for cache-eviction accounting.
pub const MIN_CACHEITEM_SIZE: usize = 0x10_0000;

// Re-export the most commonly used items at the crate root.
pub use asset::{Asset, FileFormat, NOSEEK_LENGTH, STILL_PHOTO_LENGTH};
pub use codec::{ByteReader, ByteWriter};
pub use config::{Preferences, SeekPolicy};
pub use error::{Error, FileStatus, Result};
pub use progress::{LogProgress, NullProgress, ProgressSink};
