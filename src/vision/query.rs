//! Query images
//!
//! A query is a grayscale image whose largest edge is at least 480 pixels and
//! which fits in 1280x1280. [`QueryImage::new`] enforces this strictly;
//! the `fit_*` constructors first shrink oversized inputs.

use base64::{engine::general_purpose::STANDARD, Engine as _};
use image::{imageops::FilterType, DynamicImage, GrayImage, ImageFormat};
use std::io::Cursor;
use std::path::Path;

use crate::capture::{Frame, Orientation};
use crate::error::{Result, ScanError};

/// Minimum length of the largest edge
pub const MIN_EDGE: u32 = 480;
/// Maximum width and height
pub const MAX_EDGE: u32 = 1280;

/// Validated query image
#[derive(Debug, Clone)]
pub struct QueryImage {
    gray: GrayImage,
}

impl QueryImage {
    /// Wrap a grayscale image, rejecting unsupported sizes with `Img`
    pub fn new(gray: GrayImage) -> Result<Self> {
        let (w, h) = gray.dimensions();
        if w.max(h) < MIN_EDGE {
            return Err(ScanError::img(format!(
                "query {}x{} is too small, the largest edge must be at least {}",
                w, h, MIN_EDGE
            )));
        }
        if w > MAX_EDGE || h > MAX_EDGE {
            return Err(ScanError::img(format!(
                "query {}x{} exceeds {}x{}",
                w, h, MAX_EDGE, MAX_EDGE
            )));
        }
        Ok(Self { gray })
    }

    /// Shrink to fit the maximum size if needed, then validate
    pub fn fit_gray(gray: GrayImage) -> Result<Self> {
        let (w, h) = gray.dimensions();
        if w <= MAX_EDGE && h <= MAX_EDGE {
            return Self::new(gray);
        }
        let scale = MAX_EDGE as f32 / w.max(h) as f32;
        let nw = ((w as f32 * scale).round() as u32).clamp(1, MAX_EDGE);
        let nh = ((h as f32 * scale).round() as u32).clamp(1, MAX_EDGE);
        Self::new(image::imageops::resize(&gray, nw, nh, FilterType::Triangle))
    }

    pub fn fit_dynamic(image: &DynamicImage) -> Result<Self> {
        Self::fit_gray(image.to_luma8())
    }

    /// Build from a camera frame, rotated into the interface orientation
    pub fn from_frame(frame: &Frame, orientation: Orientation) -> Result<Self> {
        Self::fit_gray(orientation.apply(&frame.to_grayscale()))
    }

    /// Load an image file
    pub fn open(path: &Path) -> Result<Self> {
        let image = image::open(path)?;
        Self::fit_dynamic(&image)
    }

    pub fn width(&self) -> u32 {
        self.gray.width()
    }

    pub fn height(&self) -> u32 {
        self.gray.height()
    }

    pub fn gray(&self) -> &GrayImage {
        &self.gray
    }

    /// PNG encoding, base64 encoded for upload
    pub fn to_png_base64(&self) -> Result<String> {
        let mut png = Vec::new();
        self.gray.write_to(&mut Cursor::new(&mut png), ImageFormat::Png)?;
        Ok(STANDARD.encode(png))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::error::ErrorKind;

    #[test]
    fn test_size_limits() {
        assert!(QueryImage::new(GrayImage::new(480, 100)).is_ok());
        assert!(QueryImage::new(GrayImage::new(100, 1280)).is_ok());

        let small = QueryImage::new(GrayImage::new(479, 479)).unwrap_err();
        assert_eq!(small.kind(), ErrorKind::Img);

        let large = QueryImage::new(GrayImage::new(1281, 600)).unwrap_err();
        assert_eq!(large.kind(), ErrorKind::Img);
    }

    #[test]
    fn test_fit_shrinks_large_input() {
        let query = QueryImage::fit_gray(GrayImage::new(2560, 1440)).unwrap();
        assert_eq!(query.width(), 1280);
        assert_eq!(query.height(), 720);
    }

    #[test]
    fn test_from_frame_rotates_to_portrait() {
        let frame = Frame::new(vec![0; 640 * 480 * 4], 640, 480).unwrap();
        let query = QueryImage::from_frame(&frame, Orientation::Portrait).unwrap();
        assert_eq!((query.width(), query.height()), (480, 640));
    }

    #[test]
    fn test_png_encoding() {
        let query = QueryImage::new(GrayImage::new(480, 360)).unwrap();
        let encoded = query.to_png_base64().unwrap();
        let png = STANDARD.decode(encoded).unwrap();
        assert_eq!(&png[1..4], b"PNG");
    }
}
