//! Scanner
//!
//! Entry point of the library. Owns the signature store, the recognition
//! engine, the background worker pool and the notification context, and
//! exposes them as one object: open a store, keep it in sync, recognize
//! images locally and fall back to the server.

use image::{DynamicImage, RgbaImage};
use parking_lot::{Mutex, RwLock};
use std::path::{Path, PathBuf};
use std::sync::Arc;
use tokio::runtime::{Builder, Runtime};
use tracing::{debug, info};

use crate::api::proxy::{self, DetectedProxy, ProxyConfig};
use crate::api::search::{ApiSearchClient, SearchOperation};
use crate::api::{ApiClient, Credential};
use crate::config::ScannerConfig;
use crate::error::{ErrorKind, Result, ScanError};
use crate::flags::{ResultExtras, ResultType, SearchOptions};
use crate::result::ScanResult;
use crate::shared::{CancelPolicy, Notifier, SubscriptionId, Task};
use crate::storage::{self, SignatureStore};
use crate::sync::{SyncEngine, SyncOperation, SyncReport, SyncState};
use crate::vision::{BarcodeDecoder, MatchEngine, QueryImage};

/// Pending background warp
pub type WarpOperation = Task<RgbaImage>;

/// On-device recognition engine with background sync and server search
pub struct Scanner {
    config: ScannerConfig,
    runtime: Option<Runtime>,
    notifier: Notifier,
    store: Arc<SignatureStore>,
    engine: MatchEngine,
    sync: SyncEngine,
    searches: ApiSearchClient,
    proxy: Mutex<Option<ProxyConfig>>,
    client: RwLock<Option<ApiClient>>,
}

impl Scanner {
    /// Scanner delivering notifications as configured in `config.runtime`
    pub fn new(config: ScannerConfig) -> Result<Self> {
        let notifier = if config.runtime.notification_thread {
            Notifier::spawn()
                .map_err(|e| ScanError::new(ErrorKind::Thread, format!("notification thread: {}", e)))?
        } else {
            Notifier::manual()
        };
        Self::with_notifier(config, notifier)
    }

    /// Scanner delivering notifications on `notifier`
    pub fn with_notifier(config: ScannerConfig, notifier: Notifier) -> Result<Self> {
        let runtime = Builder::new_multi_thread()
            .worker_threads(config.runtime.worker_threads.max(1))
            .thread_name("scanner-worker")
            .enable_all()
            .build()
            .map_err(|e| ScanError::new(ErrorKind::Thread, format!("worker pool: {}", e)))?;
        let handle = runtime.handle().clone();

        debug!(
            "Scanner created with {} workers, {} notifications",
            config.runtime.worker_threads.max(1),
            if notifier.is_dedicated() { "threaded" } else { "pumped" }
        );
        Ok(Self {
            engine: MatchEngine::new(config.matching.clone()),
            sync: SyncEngine::new(handle.clone(), notifier.clone(), config.api.sync_batch_size),
            searches: ApiSearchClient::new(handle, notifier.clone()),
            runtime: Some(runtime),
            notifier,
            store: Arc::new(SignatureStore::new()),
            proxy: Mutex::new(None),
            client: RwLock::new(None),
            config,
        })
    }

    pub fn config(&self) -> &ScannerConfig {
        &self.config
    }

    /// Context every callback of this scanner runs on
    pub fn notifier(&self) -> &Notifier {
        &self.notifier
    }

    pub(crate) fn store(&self) -> &Arc<SignatureStore> {
        &self.store
    }

    /// Open the store file at `path`
    ///
    /// Credentials are only checked by the service on first contact, so this
    /// succeeds offline.
    pub fn open(&self, path: &Path, credential: Credential) -> Result<()> {
        let mut client = self.client.write();
        let api = ApiClient::new(&self.config.api, credential.clone(), self.proxy.lock().as_ref())?;
        self.store.open(path, credential)?;
        *client = Some(api);
        Ok(())
    }

    /// Cancel background work, then close the store
    pub fn close(&self) -> Result<()> {
        self.sync.cancel();
        self.searches.cancel_all();
        let mut client = self.client.write();
        self.store.close()?;
        client.take();
        Ok(())
    }

    pub fn is_open(&self) -> bool {
        self.store.is_open()
    }

    /// Path of `file_name` in the platform cache directory
    pub fn cache_path_for(file_name: &str) -> Result<PathBuf> {
        storage::cache_path_for(file_name)
    }

    pub fn import_bundle(&self, location: &Path) -> Result<usize> {
        self.store.import_bundle(location)
    }

    /// Number of stored signatures
    pub fn count(&self) -> Result<usize> {
        self.store.count()
    }

    /// Identifiers of every stored signature
    pub fn info(&self) -> Result<Vec<String>> {
        self.store.list_identifiers()
    }

    /// Proxy found in the environment, without its password
    pub fn detect_proxy_settings() -> Option<DetectedProxy> {
        proxy::detect_proxy_settings()
    }

    /// Route requests through an HTTP proxy; a `None` host clears it
    ///
    /// Only allowed while the store is closed.
    pub fn set_proxy_settings(
        &self,
        host: Option<&str>,
        port: u16,
        username: Option<&str>,
        password: Option<&str>,
    ) -> Result<()> {
        let _client = self.client.read();
        if self.store.is_open() {
            return Err(ScanError::misuse("proxy settings cannot change while the scanner is open"));
        }
        let proxy = host.map(|host| {
            let proxy = ProxyConfig::new(host, port);
            match username {
                Some(username) => proxy.with_credentials(username, password.unwrap_or("")),
                None => proxy,
            }
        });
        if let Some(proxy) = &proxy {
            proxy.to_reqwest()?;
        }
        info!("Proxy settings: {:?}", proxy);
        *self.proxy.lock() = proxy;
        Ok(())
    }

    pub fn proxy_settings(&self) -> Option<ProxyConfig> {
        self.proxy.lock().clone()
    }

    fn api_client(&self) -> Result<ApiClient> {
        self.client.read().clone().ok_or_else(ScanError::not_open)
    }

    /// Start a sync, or join the running one
    pub fn sync_in_background(&self) -> SyncOperation {
        match self.api_client() {
            Ok(client) => self.sync.start(self.store.clone(), client),
            Err(e) => Task::settled(self.notifier.clone(), CancelPolicy::Report, Err(e)),
        }
    }

    /// Start or join a sync with completion and progress callbacks
    pub fn sync_with<C, P>(&self, on_complete: C, on_progress: P) -> SyncOperation
    where
        C: FnOnce(Result<SyncReport>) + Send + 'static,
        P: Fn(i32) + Send + Sync + 'static,
    {
        match self.api_client() {
            Ok(client) => self.sync.start_with(
                self.store.clone(),
                client,
                Some(Box::new(on_complete)),
                Some(Arc::new(on_progress)),
            ),
            Err(e) => {
                let outcome = Err(e.clone());
                self.notifier.post(move || on_complete(outcome));
                Task::settled(self.notifier.clone(), CancelPolicy::Report, Err(e))
            }
        }
    }

    pub fn cancel_sync(&self) -> bool {
        self.sync.cancel()
    }

    pub fn sync_state(&self) -> SyncState {
        self.sync.state()
    }

    pub fn is_syncing(&self) -> bool {
        self.sync.is_syncing()
    }

    pub fn sync_progress(&self) -> i32 {
        self.sync.state().progress
    }

    pub fn sync_error(&self) -> Option<ErrorKind> {
        self.sync.state().last_error
    }

    /// Observe sync state changes on the notification context
    pub fn subscribe_sync<F>(&self, callback: F) -> SubscriptionId
    where
        F: Fn(&SyncState) + Send + Sync + 'static,
    {
        self.sync.subscribe(callback)
    }

    pub fn unsubscribe_sync(&self, id: SubscriptionId) -> bool {
        self.sync.unsubscribe(id)
    }

    /// On-device image matching
    pub fn search(&self, query: &QueryImage, options: SearchOptions, extras: ResultExtras) -> Result<Option<ScanResult>> {
        self.engine.match_image(&self.store, query, options, extras)
    }

    /// On-device barcode decoding restricted to `formats`
    pub fn decode(&self, query: &QueryImage, formats: ResultType, extras: ResultExtras) -> Result<Option<ScanResult>> {
        self.engine.decode_barcode(&self.store, query, formats, extras)
    }

    pub(crate) fn scan_local(
        &self,
        query: &QueryImage,
        types: ResultType,
        options: SearchOptions,
        extras: ResultExtras,
    ) -> Result<Option<ScanResult>> {
        self.engine.scan(&self.store, query, types, options, extras)
    }

    /// Serve `decoder.format()` with a custom decoder
    pub fn register_decoder(&self, decoder: Arc<dyn BarcodeDecoder>) {
        self.engine.register_decoder(decoder)
    }

    /// Server-side image search; errors are delivered through the operation
    pub fn api_search_in_background(&self, query: &QueryImage) -> SearchOperation {
        match self.start_api_search(query) {
            Ok(operation) => operation,
            Err(e) => Task::settled(self.notifier.clone(), CancelPolicy::Silence, Err(e)),
        }
    }

    pub(crate) fn start_api_search(&self, query: &QueryImage) -> Result<SearchOperation> {
        let client = self.api_client()?;
        Ok(self.searches.search(&client, query))
    }

    pub fn cancel_api_search(&self, operation: &SearchOperation) -> bool {
        self.searches.cancel(operation)
    }

    /// Cancel every pending server search; returns how many were cancelled
    pub fn cancel_api_searches(&self) -> usize {
        self.searches.cancel_all()
    }

    /// Rectify `result` out of `image` on the worker pool
    pub fn warp_in_background(&self, result: ScanResult, image: DynamicImage, scale: f32) -> WarpOperation {
        let operation = Task::new(self.notifier.clone(), CancelPolicy::Report);
        let Some(runtime) = self.runtime.as_ref() else {
            operation.complete(Err(ScanError::new(ErrorKind::Thread, "worker pool is shut down")));
            return operation;
        };
        let task = operation.clone();
        runtime.spawn_blocking(move || {
            let outcome = if task.is_cancelled() {
                Err(ScanError::aborted())
            } else {
                result.warp(&image, scale)
            };
            task.complete(outcome);
        });
        operation
    }
}

impl Drop for Scanner {
    fn drop(&mut self) {
        self.sync.cancel();
        self.searches.cancel_all();
        if let Some(runtime) = self.runtime.take() {
            runtime.shutdown_background();
        }
        debug!("Scanner dropped");
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::ApiSettings;
    use crate::storage::bundle::{tests::pattern_image, BundleBuilder};
    use crate::storage::signature::{SignaturePayload, SignatureRecord};
    use crate::vision::matcher::tests::{compose, texture, PASTE_AT, PASTE_SIZE};
    use image::GrayImage;
    use std::sync::atomic::{AtomicBool, Ordering};
    use std::time::Duration;
    use tempfile::TempDir;

    fn scanner(base_url: &str) -> (Scanner, Notifier) {
        let notifier = Notifier::manual();
        let config = ScannerConfig {
            api: ApiSettings {
                base_url: base_url.to_string(),
                ..ApiSettings::default()
            },
            ..ScannerConfig::default()
        };
        (Scanner::with_notifier(config, notifier.clone()).unwrap(), notifier)
    }

    fn credential() -> Credential {
        Credential::new("key", "secret")
    }

    #[test]
    fn test_open_is_lazy_and_exclusive() {
        let dir = TempDir::new().unwrap();
        let (scanner, _) = scanner("http://127.0.0.1:9");
        assert_eq!(scanner.count().unwrap_err().kind(), ErrorKind::NotOpen);
        assert_eq!(scanner.info().unwrap_err().kind(), ErrorKind::NotOpen);

        // No server is listening, yet opening succeeds.
        scanner.open(&dir.path().join("store.db"), credential()).unwrap();
        assert!(scanner.is_open());
        assert_eq!(scanner.count().unwrap(), 0);
        let err = scanner.open(&dir.path().join("store.db"), credential()).unwrap_err();
        assert_eq!(err.kind(), ErrorKind::Misuse);

        scanner.close().unwrap();
        assert!(!scanner.is_open());
        assert_eq!(scanner.close().unwrap_err().kind(), ErrorKind::NotOpen);
    }

    #[test]
    fn test_proxy_settings_only_while_closed() {
        let dir = TempDir::new().unwrap();
        let (scanner, _) = scanner("http://127.0.0.1:9");

        scanner
            .set_proxy_settings(Some("proxy.local"), 3128, Some("bob"), Some("pw"))
            .unwrap();
        assert_eq!(scanner.proxy_settings().unwrap().host, "proxy.local");

        scanner.open(&dir.path().join("store.db"), credential()).unwrap();
        let err = scanner.set_proxy_settings(None, 0, None, None).unwrap_err();
        assert_eq!(err.kind(), ErrorKind::Misuse);

        scanner.close().unwrap();
        scanner.set_proxy_settings(None, 0, None, None).unwrap();
        assert!(scanner.proxy_settings().is_none());
    }

    #[test]
    fn test_import_then_reopen() {
        let dir = TempDir::new().unwrap();
        let bundle_dir = dir.path().join("bundle");
        let mut builder = BundleBuilder::new().api_key("key");
        builder.add_image("one", &pattern_image(1)).unwrap();
        builder.add_image("two", &pattern_image(2)).unwrap();
        builder.write(&bundle_dir).unwrap();

        let (scanner, _) = scanner("http://127.0.0.1:9");
        let path = dir.path().join("store.db");
        scanner.open(&path, credential()).unwrap();
        assert_eq!(scanner.import_bundle(&bundle_dir).unwrap(), 2);
        assert_eq!(scanner.count().unwrap(), 2);
        scanner.close().unwrap();

        scanner.open(&path, credential()).unwrap();
        assert_eq!(scanner.info().unwrap(), vec!["one".to_string(), "two".to_string()]);
    }

    #[test]
    fn test_sync_through_facade() {
        let record = SignatureRecord::from_image("cover", 3, &DynamicImage::ImageLuma8(texture(1, 160, 120))).unwrap();
        let fetch = serde_json::json!({
            "signatures": [SignaturePayload::from(&record)],
            "missing": [],
        });

        let mut server = mockito::Server::new();
        server
            .mock("GET", "/v1/signatures/manifest")
            .with_body(r#"{"entries":[{"id":"cover","revision":3}]}"#)
            .create();
        server
            .mock("POST", "/v1/signatures/fetch")
            .with_body(fetch.to_string())
            .create();

        let dir = TempDir::new().unwrap();
        let (scanner, notifier) = scanner(&server.url());
        scanner.open(&dir.path().join("store.db"), credential()).unwrap();

        let states = Arc::new(Mutex::new(Vec::new()));
        let sink = states.clone();
        let subscription = scanner.subscribe_sync(move |state| sink.lock().push(*state));
        let progress = Arc::new(Mutex::new(Vec::new()));
        let seen = progress.clone();
        let done = Arc::new(AtomicBool::new(false));
        let flag = done.clone();

        let operation = scanner.sync_with(
            move |outcome| {
                assert_eq!(outcome.unwrap().added, 1);
                flag.store(true, Ordering::SeqCst);
            },
            move |percent| seen.lock().push(percent),
        );
        operation.wait().unwrap();
        notifier.flush();

        assert!(done.load(Ordering::SeqCst));
        assert_eq!(scanner.count().unwrap(), 1);
        assert!(!scanner.is_syncing());
        assert_eq!(scanner.sync_progress(), 100);
        assert_eq!(scanner.sync_error(), None);
        assert_eq!(progress.lock().last(), Some(&100));
        let states = states.lock();
        assert!(states.first().unwrap().is_syncing);
        assert!(!states.last().unwrap().is_syncing);
        assert!(scanner.unsubscribe_sync(subscription));
    }

    #[test]
    fn test_background_work_on_closed_scanner() {
        let (scanner, notifier) = scanner("http://127.0.0.1:9");
        let failed = Arc::new(AtomicBool::new(false));
        let flag = failed.clone();
        let operation = scanner.sync_with(
            move |outcome| flag.store(outcome.unwrap_err().kind() == ErrorKind::NotOpen, Ordering::SeqCst),
            |_| {},
        );
        assert_eq!(operation.wait().unwrap_err().kind(), ErrorKind::NotOpen);
        notifier.flush();
        assert!(failed.load(Ordering::SeqCst));
        assert!(!scanner.cancel_sync());

        let query = QueryImage::new(GrayImage::new(480, 360)).unwrap();
        let search = scanner.api_search_in_background(&query);
        assert_eq!(search.wait().unwrap_err().kind(), ErrorKind::NotOpen);
        assert_eq!(scanner.cancel_api_searches(), 0);
    }

    #[test]
    fn test_search_and_warp() {
        let dir = TempDir::new().unwrap();
        let (scanner, notifier) = scanner("http://127.0.0.1:9");
        scanner.open(&dir.path().join("store.db"), credential()).unwrap();
        let reference = texture(1, 160, 120);
        let record = SignatureRecord::from_image("cover", 1, &DynamicImage::ImageLuma8(reference.clone())).unwrap();
        scanner.store().apply(vec![record], &[]).unwrap();

        let canvas = compose(&reference, PASTE_SIZE, PASTE_AT);
        let query = QueryImage::new(canvas.clone()).unwrap();
        let result = scanner
            .search(&query, SearchOptions::DEFAULT, ResultExtras::HOMOGRAPHY | ResultExtras::DIMENSIONS)
            .unwrap()
            .unwrap();
        assert_eq!(result.text(), Some("cover"));
        assert_eq!(result.dimensions(), Some((160, 120)));

        let warped = scanner.warp_in_background(result, DynamicImage::ImageLuma8(canvas), 1.0);
        let image = warped.wait_timeout(Duration::from_secs(10)).unwrap().unwrap();
        assert_eq!(image.dimensions(), (160, 120));
        assert_eq!(notifier.pump(), 0);
    }

    #[test]
    fn test_recognition_refused_on_notifier() {
        let dir = TempDir::new().unwrap();
        let (scanner, notifier) = scanner("http://127.0.0.1:9");
        scanner.open(&dir.path().join("store.db"), credential()).unwrap();
        let scanner = Arc::new(scanner);

        let kind = Arc::new(Mutex::new(None));
        let (s, k) = (scanner.clone(), kind.clone());
        notifier.post(move || {
            let query = QueryImage::new(GrayImage::new(640, 480)).unwrap();
            *k.lock() = s.decode(&query, ResultType::ALL_BARCODES, ResultExtras::NONE).err().map(|e| e.kind());
        });
        notifier.pump();
        assert_eq!(*kind.lock(), Some(ErrorKind::Thread));
    }
}
