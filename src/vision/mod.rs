//! Vision Layer
//!
//! On-device recognition against the open signature store: reference image
//! matching and barcode decoding. The engine holds no per-query state; every
//! call works from a snapshot of the store taken under its read lock.

pub mod barcode;
pub mod matcher;
pub mod query;

pub use barcode::{BarcodeDecoder, DecodedBarcode, Ean13Decoder, Ean8Decoder};
pub use query::QueryImage;

use parking_lot::RwLock;
use std::sync::Arc;
use std::time::Instant;
use tracing::{debug, info};

use crate::config::MatchingSettings;
use crate::error::{ErrorKind, Result, ScanError};
use crate::flags::{ResultExtras, ResultType, SearchOptions};
use crate::result::{Geometry, ScanResult};
use crate::shared::Notifier;
use crate::storage::SignatureStore;
use matcher::{find_best, Pyramid};

/// Matching and decoding engine
pub struct MatchEngine {
    settings: MatchingSettings,
    decoders: RwLock<Vec<Arc<dyn BarcodeDecoder>>>,
}

impl MatchEngine {
    /// Engine with the built-in EAN-13 and EAN-8 decoders
    pub fn new(settings: MatchingSettings) -> Self {
        let decoders: Vec<Arc<dyn BarcodeDecoder>> = vec![Arc::new(Ean13Decoder), Arc::new(Ean8Decoder)];
        Self {
            settings,
            decoders: RwLock::new(decoders),
        }
    }

    pub fn settings(&self) -> &MatchingSettings {
        &self.settings
    }

    /// Add a decoder, replacing any decoder registered for the same format
    pub fn register_decoder(&self, decoder: Arc<dyn BarcodeDecoder>) {
        let format = decoder.format();
        let mut decoders = self.decoders.write();
        decoders.retain(|d| d.format() != format);
        decoders.push(decoder);
        info!("Registered {} decoder", format.label());
    }

    /// Formats that currently have a decoder
    pub fn decodable_formats(&self) -> ResultType {
        self.decoders
            .read()
            .iter()
            .fold(ResultType::NONE, |acc, d| acc | d.format())
    }

    fn decoder_for(&self, format: ResultType) -> Option<Arc<dyn BarcodeDecoder>> {
        self.decoders.read().iter().find(|d| d.format() == format).cloned()
    }

    /// Match the query against every stored reference
    pub fn match_image(
        &self,
        store: &SignatureStore,
        query: &QueryImage,
        options: SearchOptions,
        extras: ResultExtras,
    ) -> Result<Option<ScanResult>> {
        ensure_off_notifier()?;
        let start = Instant::now();

        let result = store.with_snapshot(|references| {
            if references.is_empty() {
                return None;
            }
            let pyramid = Pyramid::new(query.gray(), options);
            find_best(&pyramid, references, options, &self.settings).map(|candidate| {
                ScanResult::local(
                    ResultType::IMAGE,
                    candidate.record.id.as_bytes().to_vec(),
                    candidate.geometry(&pyramid),
                    extras,
                )
            })
        })?;

        debug!(
            "Image search finished in {:?} ({})",
            start.elapsed(),
            if result.is_some() { "match" } else { "no match" }
        );
        Ok(result)
    }

    /// Look for a barcode of one of the `formats` in the query
    pub fn decode_barcode(
        &self,
        store: &SignatureStore,
        query: &QueryImage,
        formats: ResultType,
        extras: ResultExtras,
    ) -> Result<Option<ScanResult>> {
        ensure_off_notifier()?;
        store.ensure_open()?;

        for format in ResultType::BARCODE_FORMATS {
            if !formats.contains(format) {
                continue;
            }
            let Some(decoder) = self.decoder_for(format) else {
                continue;
            };
            if let Some(decoded) = decoder.decode(query.gray()) {
                debug!("Decoded {} barcode", format.label());
                let geometry = Geometry {
                    corners: decoded.corners,
                    ..Geometry::default()
                };
                return Ok(Some(ScanResult::local(format, decoded.data, geometry, extras)));
            }
        }
        Ok(None)
    }

    /// Barcodes first, then image matching, restricted to `types`
    pub fn scan(
        &self,
        store: &SignatureStore,
        query: &QueryImage,
        types: ResultType,
        options: SearchOptions,
        extras: ResultExtras,
    ) -> Result<Option<ScanResult>> {
        let barcodes = types.barcodes();
        if !barcodes.is_empty() {
            if let Some(result) = self.decode_barcode(store, query, barcodes, extras)? {
                return Ok(Some(result));
            }
        }
        if types.contains(ResultType::IMAGE) {
            return self.match_image(store, query, options, extras);
        }
        store.ensure_open()?;
        Ok(None)
    }
}

/// Blocking engine calls must not run on the notification context
fn ensure_off_notifier() -> Result<()> {
    if Notifier::is_current() {
        return Err(ScanError::new(
            ErrorKind::Thread,
            "recognition cannot run on the notification context",
        ));
    }
    Ok(())
}
