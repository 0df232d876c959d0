//! Offscreen render surface shared by every capture.

use std::ops::Deref;

use image::{DynamicImage, RgbImage, RgbaImage, imageops};
use webp::Encoder;

use crate::error::PreviewError;
use crate::session::VideoFrame;

/// Reusable draw target. Width is fixed per capture; height follows the
/// source aspect ratio and is only recomputed when the source size changes.
#[derive(Debug, Default)]
pub struct RenderSurface {
    width: u32,
    height: u32,
    source: (u32, u32),
    resizes: u64,
    pixels: Option<RgbImage>,
}

impl RenderSurface {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn width(&self) -> u32 {
        self.width
    }

    pub fn height(&self) -> u32 {
        self.height
    }

    /// Number of times the surface has been resized.
    pub fn resizes(&self) -> u64 {
        self.resizes
    }

    /// Sizes the surface for a `src_w x src_h` source rendered `target_w` wide.
    /// Returns false when the source has no dimensions.
    pub fn configure(&mut self, target_w: u32, src_w: u32, src_h: u32) -> bool {
        if target_w == 0 || src_w == 0 || src_h == 0 {
            return false;
        }
        if self.source == (src_w, src_h) && self.width == target_w {
            return true;
        }
        let height = ((src_h as f64 / src_w as f64) * target_w as f64) as u32;
        self.width = target_w;
        self.height = height.max(1);
        self.source = (src_w, src_h);
        self.resizes += 1;
        self.pixels = None;
        log::trace!(
            target: "scrub_preview::capture",
            "render surface resized to {}x{} for {}x{} source",
            self.width,
            self.height,
            src_w,
            src_h
        );
        true
    }

    /// Scales `frame` onto the surface.
    pub fn draw(&mut self, frame: VideoFrame) -> Result<(), PreviewError> {
        if self.width == 0 || self.height == 0 {
            return Err(PreviewError::Encode("render surface is not configured".into()));
        }
        let (fw, fh) = (frame.width, frame.height);
        let source = RgbaImage::from_raw(fw, fh, frame.data).ok_or_else(|| {
            PreviewError::Encode(format!("frame buffer does not match {}x{}", fw, fh))
        })?;
        let scaled = imageops::resize(
            &source,
            self.width,
            self.height,
            imageops::FilterType::Triangle,
        );
        self.pixels = Some(DynamicImage::ImageRgba8(scaled).into_rgb8());
        Ok(())
    }

    /// Encodes the current surface contents as lossy WebP.
    pub fn encode(&self, quality: f32) -> Result<Vec<u8>, PreviewError> {
        let pixels = self
            .pixels
            .as_ref()
            .ok_or_else(|| PreviewError::Encode("nothing drawn".into()))?;
        // WebPMemory is !Send; copy out before returning.
        let encoded = Encoder::from_rgb(pixels.as_raw(), pixels.width(), pixels.height())
            .encode_simple(false, quality)
            .map_err(|e| PreviewError::Encode(format!("{:?}", e)))?;
        Ok(encoded.deref().to_vec())
    }

    pub fn reset(&mut self) {
        *self = Self::default();
    }
}
