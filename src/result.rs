//! Recognition results
//!
//! A [`ScanResult`] is immutable. Geometric extras exist only on local
//! results, only when requested, and homography/dimensions only for images.

use base64::{engine::general_purpose::URL_SAFE_NO_PAD, Engine as _};
use image::{DynamicImage, Rgba, RgbaImage};
use imageproc::geometric_transformations::{warp_into_with, Interpolation};

use crate::error::{ErrorKind, Result, ScanError};
use crate::flags::{ResultExtras, ResultType};

/// Where a result was produced
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ResultOrigin {
    /// On-device match or decode
    Local,
    /// Server-side search
    Remote,
}

/// A point in query pixel coordinates
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct Point {
    pub x: f32,
    pub y: f32,
}

impl Point {
    pub fn new(x: f32, y: f32) -> Self {
        Self { x, y }
    }
}

/// Geometry computed by the engine, before the extras mask is applied
#[derive(Debug, Clone, Default, PartialEq)]
pub(crate) struct Geometry {
    /// Top-left, top-right, bottom-right, bottom-left
    pub corners: Option<[Point; 4]>,
    /// Row-major, maps reference [-1,1] coordinates to query [-1,1] coordinates
    pub homography: Option<[f32; 9]>,
    pub dimensions: Option<(u32, u32)>,
}

/// A successful recognition
#[derive(Debug, Clone, PartialEq)]
pub struct ScanResult {
    kind: ResultType,
    origin: ResultOrigin,
    data: Vec<u8>,
    corners: Option<[Point; 4]>,
    homography: Option<[f32; 9]>,
    dimensions: Option<(u32, u32)>,
}

impl ScanResult {
    /// On-device result, keeping only the extras that are requested and allowed
    pub(crate) fn local(kind: ResultType, data: Vec<u8>, geometry: Geometry, extras: ResultExtras) -> Self {
        let is_image = kind == ResultType::IMAGE;
        Self {
            kind,
            origin: ResultOrigin::Local,
            data,
            corners: geometry.corners.filter(|_| extras.contains(ResultExtras::CORNERS)),
            homography: geometry
                .homography
                .filter(|_| is_image && extras.contains(ResultExtras::HOMOGRAPHY)),
            dimensions: geometry
                .dimensions
                .filter(|_| is_image && extras.contains(ResultExtras::DIMENSIONS)),
        }
    }

    /// Server-side image match; never carries extras
    pub(crate) fn remote(id: &str) -> Self {
        Self {
            kind: ResultType::IMAGE,
            origin: ResultOrigin::Remote,
            data: id.as_bytes().to_vec(),
            corners: None,
            homography: None,
            dimensions: None,
        }
    }

    pub fn result_type(&self) -> ResultType {
        self.kind
    }

    pub fn origin(&self) -> ResultOrigin {
        self.origin
    }

    /// Raw payload: image identifier or barcode content
    pub fn data(&self) -> &[u8] {
        &self.data
    }

    /// Payload as UTF-8, if it is valid UTF-8
    pub fn text(&self) -> Option<&str> {
        std::str::from_utf8(&self.data).ok()
    }

    pub fn corners(&self) -> Option<&[Point; 4]> {
        self.corners.as_ref()
    }

    pub fn homography(&self) -> Option<&[f32; 9]> {
        self.homography.as_ref()
    }

    /// Original size of the matched reference image
    pub fn dimensions(&self) -> Option<(u32, u32)> {
        self.dimensions
    }

    /// Rectify the recognized reference out of `image`
    ///
    /// `image` is the query the result was computed on. The output has the
    /// reference dimensions multiplied by `scale`. Requires both the homography
    /// and the dimensions extras.
    pub fn warp(&self, image: &DynamicImage, scale: f32) -> Result<RgbaImage> {
        let (Some(h), Some((rw, rh))) = (self.homography, self.dimensions) else {
            return Err(ScanError::misuse("warping needs the homography and dimensions extras"));
        };
        if !(scale > 0.0) {
            return Err(ScanError::misuse("warp scale must be positive"));
        }
        let ow = ((rw as f32 * scale).round() as u32).max(1);
        let oh = ((rh as f32 * scale).round() as u32).max(1);
        if ow > 4096 || oh > 4096 {
            return Err(ScanError::img(format!("warped size {}x{} is too large", ow, oh)));
        }

        let src = image.to_rgba8();
        let (qw, qh) = (src.width() as f32, src.height() as f32);
        let (fw, fh) = (ow as f32, oh as f32);
        let mut out = RgbaImage::new(ow, oh);

        // Output pixel -> reference [-1,1] -> query [-1,1] -> query pixel.
        let mapping = move |x: f32, y: f32| {
            let u = 2.0 * x / fw - 1.0;
            let v = 2.0 * y / fh - 1.0;
            let w = h[6] * u + h[7] * v + h[8];
            let w = if w.abs() < 1e-9 { 1e-9 } else { w };
            let qx = (h[0] * u + h[1] * v + h[2]) / w;
            let qy = (h[3] * u + h[4] * v + h[5]) / w;
            ((qx + 1.0) * 0.5 * qw, (qy + 1.0) * 0.5 * qh)
        };
        warp_into_with(&src, mapping, Interpolation::Bilinear, Rgba([0, 0, 0, 0]), &mut out);
        Ok(out)
    }
}

/// Decode a base64url identifier (no padding)
pub fn decode_base64url(encoded: &str) -> Result<Vec<u8>> {
    URL_SAFE_NO_PAD
        .decode(encoded.trim_end_matches('=').as_bytes())
        .map_err(|e| ScanError::new(ErrorKind::Misuse, format!("invalid base64url: {}", e)))
}
