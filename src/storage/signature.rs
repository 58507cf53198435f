//! Reference image signatures
//!
//! A signature is a small grayscale thumbnail of the reference image plus the
//! original dimensions. The thumbnail is what the matcher slides over queries.

use base64::{engine::general_purpose::STANDARD, Engine as _};
use image::{imageops::FilterType, DynamicImage, GrayImage};
use serde::{Deserialize, Serialize};

use crate::error::{Result, ScanError};

/// Longest side of a descriptor thumbnail, in pixels
pub const DESCRIPTOR_SIZE: u32 = 32;

/// Grayscale thumbnail used as a matching descriptor
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Descriptor {
    width: u32,
    height: u32,
    pixels: Vec<u8>,
}

impl Descriptor {
    /// Build from raw grayscale pixels
    pub fn from_raw(width: u32, height: u32, pixels: Vec<u8>) -> Result<Self> {
        if width == 0 || height == 0 || width > 4 * DESCRIPTOR_SIZE || height > 4 * DESCRIPTOR_SIZE {
            return Err(ScanError::bundle(format!(
                "descriptor dimensions {}x{} out of range",
                width, height
            )));
        }
        if pixels.len() != (width * height) as usize {
            return Err(ScanError::bundle(format!(
                "descriptor holds {} bytes, expected {}",
                pixels.len(),
                width * height
            )));
        }
        Ok(Self { width, height, pixels })
    }

    /// Compute the descriptor of a reference image
    pub fn from_image(image: &DynamicImage) -> Result<Self> {
        let (w, h) = (image.width(), image.height());
        if w < 8 || h < 8 {
            return Err(ScanError::img(format!("reference image {}x{} is too small", w, h)));
        }
        let scale = DESCRIPTOR_SIZE as f32 / w.max(h) as f32;
        let dw = ((w as f32 * scale).round() as u32).max(1);
        let dh = ((h as f32 * scale).round() as u32).max(1);

        let gray = image.to_luma8();
        let thumb = image::imageops::resize(&gray, dw, dh, FilterType::Triangle);
        Ok(Self {
            width: dw,
            height: dh,
            pixels: thumb.into_raw(),
        })
    }

    pub fn width(&self) -> u32 {
        self.width
    }

    pub fn height(&self) -> u32 {
        self.height
    }

    pub fn pixels(&self) -> &[u8] {
        &self.pixels
    }

    pub fn to_gray_image(&self) -> GrayImage {
        // Dimensions are validated on construction.
        GrayImage::from_raw(self.width, self.height, self.pixels.clone())
            .unwrap_or_else(|| GrayImage::new(self.width, self.height))
    }

    pub fn to_base64(&self) -> String {
        STANDARD.encode(&self.pixels)
    }
}

/// A reference item as stored locally and exchanged with the service
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SignatureRecord {
    pub id: String,
    pub revision: u32,
    /// Original reference width in pixels
    pub width: u32,
    /// Original reference height in pixels
    pub height: u32,
    pub descriptor: Descriptor,
}

impl SignatureRecord {
    /// Build a record from a reference image
    pub fn from_image(id: impl Into<String>, revision: u32, image: &DynamicImage) -> Result<Self> {
        Ok(Self {
            id: id.into(),
            revision,
            width: image.width(),
            height: image.height(),
            descriptor: Descriptor::from_image(image)?,
        })
    }
}

/// Serialized signature, shared by bundles and the remote service
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SignaturePayload {
    pub id: String,
    pub revision: u32,
    pub width: u32,
    pub height: u32,
    pub descriptor_width: u32,
    pub descriptor_height: u32,
    /// Standard base64 of the descriptor pixels
    pub descriptor: String,
}

impl From<&SignatureRecord> for SignaturePayload {
    fn from(record: &SignatureRecord) -> Self {
        Self {
            id: record.id.clone(),
            revision: record.revision,
            width: record.width,
            height: record.height,
            descriptor_width: record.descriptor.width(),
            descriptor_height: record.descriptor.height(),
            descriptor: record.descriptor.to_base64(),
        }
    }
}

impl TryFrom<SignaturePayload> for SignatureRecord {
    type Error = ScanError;

    fn try_from(payload: SignaturePayload) -> Result<Self> {
        if payload.id.is_empty() {
            return Err(ScanError::bundle("signature with an empty identifier"));
        }
        let pixels = STANDARD
            .decode(payload.descriptor.as_bytes())
            .map_err(|e| ScanError::bundle(format!("descriptor of {}: {}", payload.id, e)))?;
        let descriptor =
            Descriptor::from_raw(payload.descriptor_width, payload.descriptor_height, pixels)?;
        Ok(Self {
            id: payload.id,
            revision: payload.revision,
            width: payload.width,
            height: payload.height,
            descriptor,
        })
    }
}
