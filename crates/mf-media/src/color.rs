//! Pixel layouts and conversions between them.

use mf_core::{Error, Result};
use serde::{Deserialize, Serialize};
use std::fmt;

/// Pixel layout of a [`VideoFrame`](crate::VideoFrame).
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ColorModel {
    /// Undecoded bitstream bytes; the frame records their length.
    Compressed,
    Rgb888,
    Rgba8888,
    Bgr8888,
    /// Planar Y, then U and V subsampled in both directions.
    Yuv420p,
    /// Planar Y, then U and V subsampled horizontally.
    Yuv422p,
}

impl ColorModel {
    pub const ALL: [ColorModel; 6] = [
        ColorModel::Compressed,
        ColorModel::Rgb888,
        ColorModel::Rgba8888,
        ColorModel::Bgr8888,
        ColorModel::Yuv420p,
        ColorModel::Yuv422p,
    ];

    /// Wire code.
    pub fn code(self) -> i32 {
        match self {
            ColorModel::Compressed => 0,
            ColorModel::Rgb888 => 1,
            ColorModel::Rgba8888 => 2,
            ColorModel::Bgr8888 => 3,
            ColorModel::Yuv420p => 4,
            ColorModel::Yuv422p => 5,
        }
    }

    pub fn from_code(code: i32) -> Result<Self> {
        Self::ALL
            .into_iter()
            .find(|model| model.code() == code)
            .ok_or_else(|| Error::Protocol(format!("unknown color model code {code}")))
    }

    pub fn as_str(self) -> &'static str {
        match self {
            ColorModel::Compressed => "compressed",
            ColorModel::Rgb888 => "rgb888",
            ColorModel::Rgba8888 => "rgba8888",
            ColorModel::Bgr8888 => "bgr8888",
            ColorModel::Yuv420p => "yuv420p",
            ColorModel::Yuv422p => "yuv422p",
        }
    }

    /// Bytes per pixel of the packed layouts.
    pub fn bytes_per_pixel(self) -> Option<usize> {
        match self {
            ColorModel::Rgb888 | ColorModel::Bgr8888 => Some(3),
            ColorModel::Rgba8888 => Some(4),
            _ => None,
        }
    }

    pub fn is_planar(self) -> bool {
        matches!(self, ColorModel::Yuv420p | ColorModel::Yuv422p)
    }

    pub fn has_alpha(self) -> bool {
        self == ColorModel::Rgba8888
    }

    /// Bytes a `width` x `height` picture occupies. Zero for compressed frames,
    /// whose size depends on the bitstream.
    pub fn frame_size(self, width: usize, height: usize) -> usize {
        let chroma_w = width.div_ceil(2);
        match self {
            ColorModel::Compressed => 0,
            ColorModel::Rgb888 | ColorModel::Bgr8888 => width * height * 3,
            ColorModel::Rgba8888 => width * height * 4,
            ColorModel::Yuv420p => width * height + 2 * chroma_w * height.div_ceil(2),
            ColorModel::Yuv422p => width * height + 2 * chroma_w * height,
        }
    }
}

impl fmt::Display for ColorModel {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl std::str::FromStr for ColorModel {
    type Err = Error;

    fn from_str(s: &str) -> Result<Self> {
        Self::ALL
            .into_iter()
            .find(|model| model.as_str().eq_ignore_ascii_case(s))
            .ok_or_else(|| Error::Validation(format!("unknown color model '{s}'")))
    }
}

/// Convert a whole picture between layouts.
///
/// Packed RGB layouts convert among themselves; planar YUV converts to
/// packed RGB with BT.601 coefficients. Anything else is unsupported.
pub fn transfer(
    src: &[u8],
    src_model: ColorModel,
    dst: &mut [u8],
    dst_model: ColorModel,
    width: usize,
    height: usize,
) -> Result<()> {
    let src_len = src_model.frame_size(width, height);
    let dst_len = dst_model.frame_size(width, height);
    if src.len() < src_len || dst.len() < dst_len {
        return Err(Error::decode(format!(
            "transfer {src_model}->{dst_model} {width}x{height}: buffers too small"
        )));
    }

    if src_model == dst_model {
        dst[..dst_len].copy_from_slice(&src[..src_len]);
        return Ok(());
    }

    match (src_model.bytes_per_pixel(), dst_model.bytes_per_pixel()) {
        (Some(src_bpp), Some(dst_bpp)) => {
            let pixels = width * height;
            for (s, d) in src[..pixels * src_bpp]
                .chunks_exact(src_bpp)
                .zip(dst[..pixels * dst_bpp].chunks_exact_mut(dst_bpp))
            {
                let (r, g, b, a) = read_packed(s, src_model);
                write_packed(d, dst_model, r, g, b, a);
            }
            Ok(())
        }
        (None, Some(_)) if src_model.is_planar() => {
            yuv_to_packed(src, src_model, dst, dst_model, width, height);
            Ok(())
        }
        _ => Err(Error::unsupported(format!(
            "color transfer {src_model} -> {dst_model}"
        ))),
    }
}

fn read_packed(px: &[u8], model: ColorModel) -> (u8, u8, u8, u8) {
    match model {
        ColorModel::Bgr8888 => (px[2], px[1], px[0], 255),
        ColorModel::Rgba8888 => (px[0], px[1], px[2], px[3]),
        _ => (px[0], px[1], px[2], 255),
    }
}

fn write_packed(px: &mut [u8], model: ColorModel, r: u8, g: u8, b: u8, a: u8) {
    match model {
        ColorModel::Bgr8888 => px.copy_from_slice(&[b, g, r]),
        ColorModel::Rgba8888 => px.copy_from_slice(&[r, g, b, a]),
        _ => px.copy_from_slice(&[r, g, b]),
    }
}

fn yuv_to_packed(
    src: &[u8],
    src_model: ColorModel,
    dst: &mut [u8],
    dst_model: ColorModel,
    width: usize,
    height: usize,
) {
    let chroma_w = width.div_ceil(2);
    let chroma_h = match src_model {
        ColorModel::Yuv420p => height.div_ceil(2),
        _ => height,
    };
    let (y_plane, chroma) = src.split_at(width * height);
    let (u_plane, v_plane) = chroma.split_at(chroma_w * chroma_h);
    let bpp = dst_model.bytes_per_pixel().unwrap_or(3);

    for row in 0..height {
        let chroma_row = if src_model == ColorModel::Yuv420p { row / 2 } else { row };
        for col in 0..width {
            let y = y_plane[row * width + col] as f32;
            let c = chroma_row * chroma_w + col / 2;
            let u = u_plane[c] as f32 - 128.0;
            let v = v_plane[c] as f32 - 128.0;

            let r = (y + 1.402 * v).clamp(0.0, 255.0) as u8;
            let g = (y - 0.344_136 * u - 0.714_136 * v).clamp(0.0, 255.0) as u8;
            let b = (y + 1.772 * u).clamp(0.0, 255.0) as u8;

            let offset = (row * width + col) * bpp;
            write_packed(&mut dst[offset..offset + bpp], dst_model, r, g, b, 255);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use assert_matches::assert_matches;

    #[test]
    fn codes_and_names_are_stable() {
        for model in ColorModel::ALL {
            assert_eq!(ColorModel::from_code(model.code()).unwrap(), model);
            assert_eq!(model.as_str().parse::<ColorModel>().unwrap(), model);
        }
        assert!(ColorModel::from_code(42).is_err());
    }

    #[test]
    fn frame_sizes() {
        assert_eq!(ColorModel::Rgba8888.frame_size(4, 2), 32);
        assert_eq!(ColorModel::Rgb888.frame_size(4, 2), 24);
        // Odd dimensions round chroma up.
        assert_eq!(ColorModel::Yuv420p.frame_size(3, 3), 9 + 2 * 4);
        assert_eq!(ColorModel::Yuv422p.frame_size(4, 2), 8 + 2 * 4);
        assert_eq!(ColorModel::Compressed.frame_size(1920, 1080), 0);
    }

    #[test]
    fn rgba_to_bgr_swaps_and_drops_alpha() {
        let src = [10, 20, 30, 40, 50, 60, 70, 80];
        let mut dst = [0u8; 6];
        transfer(&src, ColorModel::Rgba8888, &mut dst, ColorModel::Bgr8888, 2, 1).unwrap();
        assert_eq!(dst, [30, 20, 10, 70, 60, 50]);
    }

    #[test]
    fn rgb_to_rgba_adds_opaque_alpha() {
        let src = [1, 2, 3];
        let mut dst = [0u8; 4];
        transfer(&src, ColorModel::Rgb888, &mut dst, ColorModel::Rgba8888, 1, 1).unwrap();
        assert_eq!(dst, [1, 2, 3, 255]);
    }

    #[test]
    fn grey_yuv_becomes_grey_rgb() {
        // 2x2 luma of 128 with neutral chroma.
        let src = [128, 128, 128, 128, 128, 128];
        let mut dst = [0u8; 12];
        transfer(&src, ColorModel::Yuv420p, &mut dst, ColorModel::Rgb888, 2, 2).unwrap();
        assert!(dst.iter().all(|&c| c == 128));
    }

    #[test]
    fn unsupported_and_short_buffers() {
        let src = [0u8; 12];
        let mut dst = [0u8; 6];
        assert_matches!(
            transfer(&src, ColorModel::Rgb888, &mut dst, ColorModel::Yuv420p, 2, 2),
            Err(Error::Unsupported(_))
        );
        assert_matches!(
            transfer(&src[..3], ColorModel::Rgb888, &mut dst, ColorModel::Rgb888, 2, 2),
            Err(Error::Decode(_))
        );
    }
}
