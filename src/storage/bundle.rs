//! Prebuilt signature bundles
//!
//! A bundle is a directory holding `manifest.json` and `signatures.json`. The
//! manifest names the format and version, the optional API key the bundle was
//! built for, the record count and the SHA-256 of the signatures file.

use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};
use std::collections::{BTreeMap, HashSet};
use std::path::{Path, PathBuf};
use tracing::info;

use crate::error::{Result, ScanError};
use crate::storage::signature::{SignaturePayload, SignatureRecord};

pub const BUNDLE_FORMAT: &str = "scanner-bundle";
pub const BUNDLE_VERSION: u32 = 1;

const MANIFEST_FILE: &str = "manifest.json";
const SIGNATURES_FILE: &str = "signatures.json";

#[derive(Debug, Clone, Serialize, Deserialize)]
struct BundleManifest {
    format: String,
    version: u32,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    api_key: Option<String>,
    count: usize,
    checksum: String,
}

/// Fully validated bundle contents
#[derive(Debug, Clone)]
pub struct Bundle {
    pub api_key: Option<String>,
    pub records: Vec<SignatureRecord>,
}

fn read_file(dir: &Path, name: &str) -> Result<Vec<u8>> {
    std::fs::read(dir.join(name))
        .map_err(|e| ScanError::bundle(format!("cannot read {} in {:?}: {}", name, dir, e)))
}

/// Read and validate a bundle without touching any store
pub fn read_bundle(dir: &Path) -> Result<Bundle> {
    let manifest_bytes = read_file(dir, MANIFEST_FILE)?;
    let manifest: BundleManifest = serde_json::from_slice(&manifest_bytes)
        .map_err(|e| ScanError::bundle(format!("malformed manifest: {}", e)))?;

    if manifest.format != BUNDLE_FORMAT {
        return Err(ScanError::bundle(format!("unknown bundle format {:?}", manifest.format)));
    }
    if manifest.version != BUNDLE_VERSION {
        return Err(ScanError::bundle(format!("unsupported bundle version {}", manifest.version)));
    }

    let signatures_bytes = read_file(dir, SIGNATURES_FILE)?;
    let checksum = format!("{:x}", Sha256::digest(&signatures_bytes));
    if !checksum.eq_ignore_ascii_case(&manifest.checksum) {
        return Err(ScanError::bundle(format!(
            "checksum mismatch: manifest says {}, file is {}",
            manifest.checksum, checksum
        )));
    }

    let payloads: Vec<SignaturePayload> = serde_json::from_slice(&signatures_bytes)
        .map_err(|e| ScanError::bundle(format!("malformed signatures: {}", e)))?;
    if payloads.len() != manifest.count {
        return Err(ScanError::bundle(format!(
            "manifest announces {} signatures, found {}",
            manifest.count,
            payloads.len()
        )));
    }

    let mut seen = HashSet::new();
    let mut records = Vec::with_capacity(payloads.len());
    for payload in payloads {
        if !seen.insert(payload.id.clone()) {
            return Err(ScanError::bundle(format!("duplicate signature {}", payload.id)));
        }
        records.push(SignatureRecord::try_from(payload)?);
    }

    Ok(Bundle {
        api_key: manifest.api_key,
        records,
    })
}

/// Builds bundles from reference images
#[derive(Debug, Default)]
pub struct BundleBuilder {
    api_key: Option<String>,
    records: BTreeMap<String, SignatureRecord>,
}

impl BundleBuilder {
    pub fn new() -> Self {
        Self::default()
    }

    /// Bind the bundle to an account
    pub fn api_key(mut self, key: impl Into<String>) -> Self {
        self.api_key = Some(key.into());
        self
    }

    pub fn add_record(&mut self, record: SignatureRecord) {
        self.records.insert(record.id.clone(), record);
    }

    pub fn add_image(&mut self, id: &str, image: &image::DynamicImage) -> Result<()> {
        self.add_record(SignatureRecord::from_image(id, 1, image)?);
        Ok(())
    }

    /// Add an image file, using its file stem as identifier
    pub fn add_image_file(&mut self, path: &Path) -> Result<String> {
        let id = path
            .file_stem()
            .and_then(|s| s.to_str())
            .filter(|s| !s.is_empty())
            .ok_or_else(|| ScanError::img(format!("cannot derive an identifier from {:?}", path)))?
            .to_string();
        let image = image::open(path)?;
        self.add_image(&id, &image)?;
        Ok(id)
    }

    pub fn len(&self) -> usize {
        self.records.len()
    }

    pub fn is_empty(&self) -> bool {
        self.records.is_empty()
    }

    /// Write the bundle into `dir`, creating it if needed
    pub fn write(&self, dir: &Path) -> Result<PathBuf> {
        std::fs::create_dir_all(dir)?;

        let payloads: Vec<SignaturePayload> = self.records.values().map(SignaturePayload::from).collect();
        let signatures = serde_json::to_vec(&payloads)
            .map_err(|e| ScanError::bundle(format!("cannot encode signatures: {}", e)))?;
        let manifest = BundleManifest {
            format: BUNDLE_FORMAT.to_string(),
            version: BUNDLE_VERSION,
            api_key: self.api_key.clone(),
            count: payloads.len(),
            checksum: format!("{:x}", Sha256::digest(&signatures)),
        };
        let manifest = serde_json::to_vec_pretty(&manifest)
            .map_err(|e| ScanError::bundle(format!("cannot encode manifest: {}", e)))?;

        std::fs::write(dir.join(SIGNATURES_FILE), signatures)?;
        std::fs::write(dir.join(MANIFEST_FILE), manifest)?;
        info!("Wrote bundle with {} signatures to {:?}", payloads.len(), dir);
        Ok(dir.to_path_buf())
    }
}

#[cfg(test)]
pub(crate) mod tests {
    use super::*;
    use crate::error::ErrorKind;
    use image::{DynamicImage, GrayImage, Luma};
    use tempfile::TempDir;

    pub(crate) fn pattern_image(seed: u32) -> DynamicImage {
        DynamicImage::ImageLuma8(GrayImage::from_fn(120, 90, move |x, y| {
            let v = (x / 10 * 37 + y / 10 * 61 + seed * 53) % 251;
            Luma([v as u8])
        }))
    }

    fn sample_bundle(dir: &Path, api_key: Option<&str>) {
        let mut builder = BundleBuilder::new();
        if let Some(key) = api_key {
            builder = builder.api_key(key);
        }
        builder.add_image("one", &pattern_image(1)).unwrap();
        builder.add_image("two", &pattern_image(2)).unwrap();
        builder.write(dir).unwrap();
    }

    #[test]
    fn test_write_then_read() {
        let dir = TempDir::new().unwrap();
        sample_bundle(dir.path(), Some("key"));

        let bundle = read_bundle(dir.path()).unwrap();
        assert_eq!(bundle.api_key.as_deref(), Some("key"));
        assert_eq!(bundle.records.len(), 2);
        assert_eq!(bundle.records[0].id, "one");
        assert_eq!(bundle.records[0].width, 120);
    }

    #[test]
    fn test_tampered_signatures_rejected() {
        let dir = TempDir::new().unwrap();
        sample_bundle(dir.path(), None);
        std::fs::write(dir.path().join(SIGNATURES_FILE), b"[]").unwrap();

        let err = read_bundle(dir.path()).unwrap_err();
        assert_eq!(err.kind(), ErrorKind::Bundle);
        assert!(err.detail().contains("checksum"));
    }

    #[test]
    fn test_wrong_version_rejected() {
        let dir = TempDir::new().unwrap();
        sample_bundle(dir.path(), None);
        let manifest = std::fs::read_to_string(dir.path().join(MANIFEST_FILE)).unwrap();
        let manifest = manifest.replace("\"version\": 1", "\"version\": 7");
        std::fs::write(dir.path().join(MANIFEST_FILE), manifest).unwrap();

        let err = read_bundle(dir.path()).unwrap_err();
        assert_eq!(err.kind(), ErrorKind::Bundle);
    }

    #[test]
    fn test_missing_directory_is_bundle_error() {
        let dir = TempDir::new().unwrap();
        let err = read_bundle(&dir.path().join("nope")).unwrap_err();
        assert_eq!(err.kind(), ErrorKind::Bundle);
    }
}
