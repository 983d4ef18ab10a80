//! Selecting a backend for a file.
//!
//! Backend kinds form a closed set. The registry holds them in priority
//! order; specific formats come first so the generic demuxer only claims
//! what nothing else recognizes.

use mf_core::{Asset, Error, FileFormat, Result};
use std::fmt;
use std::fs::File;
use std::io::Read;
use std::path::Path;
use tracing::debug;

use crate::backend::{Capabilities, DecoderBackend};
use crate::still::StillBackend;
use crate::wav::WavBackend;

/// Bytes read from the start of a file for sniffing.
pub const HEADER_LEN: usize = 16;

const XML_MARKERS: [&[u8]; 3] = [b"<EDL>", b"<HTAL>", b"<?xml"];

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum BackendKind {
    Wav,
    Still,
    /// Generic containers through the demuxer. Only usable in builds with
    /// FFmpeg linked; otherwise opening fails with `Unsupported`.
    Ffmpeg,
}

impl BackendKind {
    pub fn name(self) -> &'static str {
        match self {
            BackendKind::Wav => "wav",
            BackendKind::Still => "still",
            BackendKind::Ffmpeg => "ffmpeg",
        }
    }

    pub fn capabilities(self) -> Capabilities {
        match self {
            BackendKind::Wav => Capabilities {
                read: true,
                write: true,
                audio: true,
                video: false,
                wrapper: false,
            },
            BackendKind::Still => Capabilities {
                read: true,
                write: true,
                audio: false,
                video: true,
                wrapper: false,
            },
            BackendKind::Ffmpeg => Capabilities {
                read: true,
                write: false,
                audio: true,
                video: true,
                wrapper: true,
            },
        }
    }

    /// Formats this kind serves when the asset names one explicitly.
    pub fn formats(self) -> &'static [FileFormat] {
        match self {
            BackendKind::Wav => &[FileFormat::Wav],
            BackendKind::Still => &[FileFormat::Png, FileFormat::Jpeg],
            BackendKind::Ffmpeg => &[FileFormat::Ffmpeg],
        }
    }

    /// Whether this kind recognizes a file from its first bytes. Returns
    /// the format it would open it as.
    pub fn probe(self, path: &Path, header: &[u8]) -> Option<FileFormat> {
        let format = match self {
            BackendKind::Wav => {
                (header.len() >= 12 && &header[..4] == b"RIFF" && &header[8..12] == b"WAVE")
                    .then_some(FileFormat::Wav)
            }
            BackendKind::Still => {
                if header.starts_with(b"\x89PNG") {
                    Some(FileFormat::Png)
                } else if header.starts_with(&[0xff, 0xd8, 0xff]) {
                    Some(FileFormat::Jpeg)
                } else {
                    None
                }
            }
            BackendKind::Ffmpeg => crate::demux::probe_container(path).then_some(FileFormat::Ffmpeg),
        };
        if let Some(format) = format {
            debug!(path = %path.display(), kind = self.name(), %format, "probe matched");
        }
        format
    }

    pub fn instantiate(self) -> Box<dyn DecoderBackend> {
        match self {
            BackendKind::Wav => Box::new(WavBackend::new()),
            BackendKind::Still => Box::new(StillBackend::new()),
            BackendKind::Ffmpeg => Box::new(crate::demux::DemuxBackend::new(
                crate::demux::default_opener(),
            )),
        }
    }
}

impl fmt::Display for BackendKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.name())
    }
}

/// Ordered list of backend kinds. Immutable once built and shared by
/// reference.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DecoderRegistry {
    kinds: Vec<BackendKind>,
}

impl Default for DecoderRegistry {
    fn default() -> Self {
        Self {
            kinds: vec![
                BackendKind::Wav,
                BackendKind::Still,
                #[cfg(feature = "native-ffmpeg")]
                BackendKind::Ffmpeg,
            ],
        }
    }
}

impl DecoderRegistry {
    pub fn new(kinds: Vec<BackendKind>) -> Self {
        Self { kinds }
    }

    pub fn kinds(&self) -> &[BackendKind] {
        &self.kinds
    }

    /// First `HEADER_LEN` bytes of `path`, shorter for tiny files.
    pub fn sniff(path: &Path) -> Result<Vec<u8>> {
        let mut header = Vec::with_capacity(HEADER_LEN);
        File::open(path)?
            .take(HEADER_LEN as u64)
            .read_to_end(&mut header)?;
        Ok(header)
    }

    /// Pick the backend for `asset`. An unknown format is sniffed and the
    /// asset's format is set to what the winning probe reported.
    pub fn resolve(&self, asset: &mut Asset, read: bool, write: bool) -> Result<BackendKind> {
        if read && !asset.path.exists() {
            return Err(Error::not_found(&asset.path));
        }

        if asset.format == FileFormat::Unknown {
            let header = Self::sniff(&asset.path)?;
            if XML_MARKERS.iter().any(|marker| header.starts_with(marker)) {
                return Err(Error::IsXml {
                    path: asset.path.clone(),
                });
            }
            for &kind in &self.kinds {
                if !kind.capabilities().allows(read, write) {
                    continue;
                }
                if let Some(format) = kind.probe(&asset.path, &header) {
                    asset.format = format;
                    return Ok(kind);
                }
            }
            return Err(Error::UnrecognizedCodec {
                path: asset.path.clone(),
            });
        }

        self.kinds
            .iter()
            .copied()
            .find(|kind| {
                kind.capabilities().allows(read, write) && kind.formats().contains(&asset.format)
            })
            .ok_or_else(|| {
                Error::NotFound(format!(
                    "no backend {} {}",
                    if write { "writes" } else { "reads" },
                    asset.format
                ))
            })
    }
}
