//! JSON bodies exchanged with the recognition service

use serde::{Deserialize, Serialize};

use crate::storage::signature::SignaturePayload;

/// `GET /v1/signatures/manifest`
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ManifestResponse {
    pub entries: Vec<ManifestEntry>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ManifestEntry {
    pub id: String,
    pub revision: u32,
}

/// `POST /v1/signatures/fetch`
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct FetchRequest {
    pub ids: Vec<String>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct FetchResponse {
    pub signatures: Vec<SignaturePayload>,
    /// Identifiers listed in the manifest that no longer exist
    #[serde(default)]
    pub missing: Vec<String>,
}

/// `POST /v1/search`
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SearchRequest {
    /// Base64 PNG of the query image
    pub image: String,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SearchResponse {
    pub found: bool,
    #[serde(default)]
    pub id: Option<String>,
}

/// Error body returned alongside non-success statuses
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct ErrorBody {
    #[serde(default)]
    pub error: Option<String>,
    #[serde(default)]
    pub message: Option<String>,
}
