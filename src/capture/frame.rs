//! Frame data structures for camera content

use image::{GrayImage, Luma};
use std::time::Instant;

use crate::error::{Result, ScanError};

/// Device orientation of the host interface
///
/// Camera frames are delivered in the sensor's native landscape-right layout
/// and rotated to match the interface before processing.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum Orientation {
    #[default]
    Portrait,
    PortraitUpsideDown,
    LandscapeLeft,
    LandscapeRight,
}

impl Orientation {
    /// Rotate a sensor-oriented image into this interface orientation
    pub fn apply(&self, image: &GrayImage) -> GrayImage {
        match self {
            Orientation::LandscapeRight => image.clone(),
            Orientation::Portrait => image::imageops::rotate90(image),
            Orientation::LandscapeLeft => image::imageops::rotate180(image),
            Orientation::PortraitUpsideDown => image::imageops::rotate270(image),
        }
    }
}

/// A camera frame
#[derive(Debug, Clone)]
pub struct Frame {
    /// Raw BGRA pixel data
    data: Vec<u8>,
    /// Frame width in pixels
    width: u32,
    /// Frame height in pixels
    height: u32,
    /// Timestamp when frame was captured
    timestamp: Instant,
}

impl Frame {
    /// Create a new frame from BGRA pixels
    pub fn new(data: Vec<u8>, width: u32, height: u32) -> Result<Self> {
        let expected = width as usize * height as usize * 4;
        if width == 0 || height == 0 || data.len() != expected {
            return Err(ScanError::img(format!(
                "frame buffer holds {} bytes, expected {} for {}x{} BGRA",
                data.len(),
                expected,
                width,
                height
            )));
        }
        Ok(Self {
            data,
            width,
            height,
            timestamp: Instant::now(),
        })
    }

    /// Build a frame from an RGBA image, e.g. a still loaded from disk
    pub fn from_rgba(image: &image::RgbaImage) -> Self {
        let mut data = image.as_raw().clone();
        for px in data.chunks_exact_mut(4) {
            px.swap(0, 2);
        }
        Self {
            data,
            width: image.width(),
            height: image.height(),
            timestamp: Instant::now(),
        }
    }

    /// Get frame dimensions as (width, height)
    pub fn dimensions(&self) -> (u32, u32) {
        (self.width, self.height)
    }

    pub fn data(&self) -> &[u8] {
        &self.data
    }

    pub fn timestamp(&self) -> Instant {
        self.timestamp
    }

    /// Luma conversion of the BGRA buffer
    pub fn to_grayscale(&self) -> GrayImage {
        let mut gray = GrayImage::new(self.width, self.height);
        for (px, out) in self.data.chunks_exact(4).zip(gray.pixels_mut()) {
            let b = px[0] as f32;
            let g = px[1] as f32;
            let r = px[2] as f32;
            *out = Luma([(0.299 * r + 0.587 * g + 0.114 * b) as u8]);
        }
        gray
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_bgra_to_grayscale() {
        let data = vec![
            255, 0, 0, 255, // Blue
            0, 255, 0, 255, // Green
            0, 0, 255, 255, // Red
            128, 128, 128, 255, // Gray
        ];

        let frame = Frame::new(data, 2, 2).unwrap();
        let gray = frame.to_grayscale();
        assert_eq!(gray.dimensions(), (2, 2));

        // Green should be brighter than blue in grayscale
        let blue_val = gray.get_pixel(0, 0).0[0];
        let green_val = gray.get_pixel(1, 0).0[0];
        assert!(green_val > blue_val);
        assert_eq!(gray.get_pixel(1, 1).0[0], 128);
    }

    #[test]
    fn test_bad_buffer_length() {
        assert!(Frame::new(vec![0; 10], 2, 2).is_err());
        assert!(Frame::new(Vec::new(), 0, 0).is_err());
    }

    #[test]
    fn test_orientation_rotates() {
        let img = GrayImage::new(40, 30);
        assert_eq!(Orientation::Portrait.apply(&img).dimensions(), (30, 40));
        assert_eq!(Orientation::LandscapeRight.apply(&img).dimensions(), (40, 30));
        assert_eq!(Orientation::LandscapeLeft.apply(&img).dimensions(), (40, 30));
        assert_eq!(Orientation::PortraitUpsideDown.apply(&img).dimensions(), (30, 40));
    }

    #[test]
    fn test_from_rgba_swaps_channels() {
        let mut rgba = image::RgbaImage::new(1, 1);
        rgba.put_pixel(0, 0, image::Rgba([10, 20, 30, 255]));
        let frame = Frame::from_rgba(&rgba);
        assert_eq!(frame.data(), &[30, 20, 10, 255]);
    }
}
