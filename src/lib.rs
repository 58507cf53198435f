//! ScannerToolKit - On-device image recognition and barcode scanning
//!
//! Recognizes reference images against a locally synchronized signature
//! store, decodes barcodes, and falls back to a server-side search when
//! nothing matches on device.

pub mod api;
pub mod capture;
pub mod config;
pub mod error;
pub mod flags;
pub mod result;
pub mod scanner;
pub mod session;
pub mod shared;
pub mod storage;
pub mod sync;
pub mod vision;

pub use api::proxy::{DetectedProxy, ProxyConfig};
pub use api::search::SearchOperation;
pub use api::Credential;
pub use capture::{Frame, FrameSink, FrameSource, Orientation, PushFrameSource};
pub use config::ScannerConfig;
pub use error::{ErrorKind, Result, ScanError};
pub use flags::{ResultExtras, ResultType, SearchOptions};
pub use result::{decode_base64url, Point, ResultOrigin, ScanResult};
pub use scanner::{Scanner, WarpOperation};
pub use session::{AutoDelegate, AutoSession, ManualDelegate, ManualSession, SessionConfig, SessionState};
pub use shared::{Notifier, SubscriptionId, Task};
pub use storage::bundle::BundleBuilder;
pub use sync::{SyncOperation, SyncReport, SyncState};
pub use vision::{BarcodeDecoder, DecodedBarcode, QueryImage};
