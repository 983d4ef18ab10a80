//! Command and result bodies that are plain data.
//!
//! These travel as `bincode` with its default fixed-width little-endian
//! encoding. Frames and sample buffers carry shared-memory names and are
//! written with their own `encode_into` instead.

use mf_core::{Asset, Error, Preferences, Result};
use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};

pub fn encode<T: Serialize>(value: &T) -> Result<Vec<u8>> {
    bincode::serialize(value).map_err(|e| Error::Protocol(format!("encode payload: {e}")))
}

pub fn decode<T: DeserializeOwned>(bytes: &[u8]) -> Result<T> {
    bincode::deserialize(bytes).map_err(|e| Error::Protocol(format!("decode payload: {e}")))
}

/// Body of `OPEN_FILE`. The worker answers with the opened asset.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct OpenFile {
    pub read: bool,
    pub write: bool,
    pub prefs: Preferences,
    pub asset: Asset,
}

/// Result of `CLOSE_FILE`: the lengths the file ended up with.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct FinalLengths {
    pub audio_length: i64,
    pub video_length: i64,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct AudioThreadSpec {
    /// Samples per channel in each ring buffer.
    pub buffer_size: u64,
    pub ring_buffers: u32,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct VideoThreadSpec {
    /// Frames per layer in each ring buffer.
    pub buffer_size: u32,
    pub color_model: i32,
    pub ring_buffers: u32,
    pub compressed: bool,
}

/// Body of `CAN_COPY_FROM`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CopyQuery {
    pub position: i64,
    pub width: i32,
    pub height: i32,
    pub asset_xml: String,
}

/// Body of the `START_PROGRESS` callback.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ProgressStart {
    pub total: i64,
    pub title: String,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn final_lengths_are_two_little_endian_i64() {
        let bytes = encode(&FinalLengths {
            audio_length: 44100,
            video_length: -1,
        })
        .unwrap();
        assert_eq!(bytes.len(), 16);
        assert_eq!(&bytes[..8], &44100i64.to_le_bytes());
        assert_eq!(&bytes[8..], &(-1i64).to_le_bytes());
    }

    #[test]
    fn copy_query_leads_with_position_and_size() {
        let query = CopyQuery {
            position: 7,
            width: 1920,
            height: 1080,
            asset_xml: "<ASSET/>".into(),
        };
        let bytes = encode(&query).unwrap();
        assert_eq!(&bytes[..8], &7i64.to_le_bytes());
        assert_eq!(&bytes[8..12], &1920i32.to_le_bytes());
        assert_eq!(&bytes[12..16], &1080i32.to_le_bytes());
        assert_eq!(decode::<CopyQuery>(&bytes).unwrap(), query);
    }

    #[test]
    fn open_request_carries_preferences() {
        let mut prefs = Preferences::default();
        prefs.toc.enabled = false;
        prefs.seek.seek_threshold = 4;
        let mut asset = Asset::new("/media/take.wav");
        asset.channels = 2;
        let bytes = encode(&OpenFile {
            read: true,
            write: false,
            prefs: prefs.clone(),
            asset: asset.clone(),
        })
        .unwrap();
        let back: OpenFile = decode(&bytes).unwrap();
        assert_eq!(back.prefs, prefs);
        assert_eq!(back.asset, asset);
        assert!(back.read && !back.write);
    }

    #[test]
    fn truncated_body_is_a_protocol_error() {
        let bytes = encode(&7i64).unwrap();
        assert!(matches!(decode::<FinalLengths>(&bytes), Err(Error::Protocol(_))));
    }
}
