//! Single still images (PNG, JPEG) presented as a video stream.

use image::{DynamicImage, ImageFormat, RgbaImage};
use mf_core::{Error, FileFormat, Result, STILL_PHOTO_LENGTH};
use mf_media::{transfer, ColorModel, VideoFrame};
use std::io::Cursor;
use std::path::PathBuf;
use tracing::{debug, info};

use crate::backend::{DecoderBackend, FrameRead, OpenRequest};
use crate::registry::BackendKind;

#[derive(Debug, Default)]
pub struct StillBackend {
    path: PathBuf,
    format: Option<ImageFormat>,
    /// Decoded RGBA pixels, kept for the life of the handle.
    picture: Option<RgbaImage>,
    writing: bool,
}

impl StillBackend {
    pub fn new() -> Self {
        Self::default()
    }

    fn image_format(format: FileFormat) -> ImageFormat {
        match format {
            FileFormat::Jpeg => ImageFormat::Jpeg,
            _ => ImageFormat::Png,
        }
    }
}

impl DecoderBackend for StillBackend {
    fn kind(&self) -> BackendKind {
        BackendKind::Still
    }

    fn open(&mut self, request: OpenRequest<'_>) -> Result<()> {
        let asset = request.asset;
        self.path = asset.path.clone();
        if request.read {
            let data = std::fs::read(&asset.path)?;
            let format = image::guess_format(&data).map_err(Error::decode)?;
            let img = image::load_from_memory_with_format(&data, format).map_err(Error::decode)?;
            asset.format = match format {
                ImageFormat::Jpeg => FileFormat::Jpeg,
                _ => FileFormat::Png,
            };
            asset.container = format!("{format:?}").to_lowercase();
            asset.video_data = true;
            asset.layers = 1;
            asset.width = img.width() as i32;
            asset.height = img.height() as i32;
            asset.aspect_ratio = img.width() as f64 / img.height().max(1) as f64;
            asset.video_codec = asset.format.as_str().to_string();
            asset.video_length = STILL_PHOTO_LENGTH;
            if asset.frame_rate <= 0.0 {
                asset.frame_rate = 1.0;
            }
            info!(
                path = %asset.path.display(),
                width = asset.width,
                height = asset.height,
                "opened still image"
            );
            self.format = Some(format);
            self.picture = Some(img.to_rgba8());
        } else if request.write {
            self.format = Some(Self::image_format(asset.format));
            if asset.format == FileFormat::Unknown {
                asset.format = FileFormat::Png;
            }
            asset.video_data = true;
            asset.layers = 1;
            self.writing = true;
        }
        Ok(())
    }

    fn close(&mut self) -> Result<()> {
        self.picture = None;
        self.writing = false;
        Ok(())
    }

    fn colormodel_supported(&self, _requested: ColorModel) -> ColorModel {
        ColorModel::Rgba8888
    }

    fn read_frame(&mut self, request: FrameRead<'_>) -> Result<()> {
        let picture = self
            .picture
            .as_ref()
            .ok_or_else(|| Error::state("still image is not open for reading"))?;
        let (width, height) = (picture.width() as usize, picture.height() as usize);
        let frame = request.frame;
        if frame.width() != width || frame.height() != height {
            return Err(Error::decode(format!(
                "frame is {}x{}, image is {width}x{height}",
                frame.width(),
                frame.height()
            )));
        }
        let model = frame.color_model();
        transfer(picture.as_raw(), ColorModel::Rgba8888, frame.data_mut(), model, width, height)?;
        frame.position = request.position;
        frame.keyframe = true;
        Ok(())
    }

    fn read_samples(&mut self, _buffer: &mut [f64], _position: i64, _channel: i32) -> Result<()> {
        Err(Error::unsupported("still images have no audio"))
    }

    fn write_frames(&mut self, frames: &[&VideoFrame]) -> Result<()> {
        if !self.writing {
            return Err(Error::state("still image is not open for writing"));
        }
        let format = self.format.unwrap_or(ImageFormat::Png);
        // A still holds one picture; the last frame written wins.
        let Some(frame) = frames.last() else {
            return Ok(());
        };
        let (width, height) = (frame.width(), frame.height());
        let mut rgba = vec![0u8; ColorModel::Rgba8888.frame_size(width, height)];
        transfer(frame.data(), frame.color_model(), &mut rgba, ColorModel::Rgba8888, width, height)?;
        let img = RgbaImage::from_raw(width as u32, height as u32, rgba)
            .ok_or_else(|| Error::encode("frame buffer does not match its dimensions"))?;

        let img = match format {
            // JPEG has no alpha channel.
            ImageFormat::Jpeg => DynamicImage::ImageRgb8(DynamicImage::ImageRgba8(img).to_rgb8()),
            _ => DynamicImage::ImageRgba8(img),
        };
        let mut buf = Cursor::new(Vec::new());
        img.write_to(&mut buf, format).map_err(Error::encode)?;
        std::fs::write(&self.path, buf.into_inner())?;
        debug!(path = %self.path.display(), width, height, "wrote still image");
        Ok(())
    }

    fn memory_usage(&self) -> usize {
        self.picture.as_ref().map_or(0, |p| p.as_raw().len())
    }
}

/// An RGB test card: each pixel encodes its coordinates.
#[cfg(test)]
pub(crate) fn test_card(width: u32, height: u32) -> image::RgbImage {
    image::RgbImage::from_fn(width, height, |x, y| image::Rgb([x as u8 * 10, y as u8 * 10, 200]))
}
