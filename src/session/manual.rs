//! Tap-to-scan session
//!
//! Frames are only looked at after [`ManualSession::snap`]. The next frame is
//! scanned on device; when nothing is found and image recognition is enabled
//! the query goes to the server. Every outcome pauses the session before it
//! is delivered.

use parking_lot::Mutex;
use std::sync::Arc;
use tracing::{debug, info};

use super::{Pipeline, SessionConfig, SessionCore, SessionState, WarningCallback};
use crate::api::search::SearchOperation;
use crate::capture::{Frame, FrameSource};
use crate::error::{Result, ScanError};
use crate::flags::{ResultExtras, ResultType};
use crate::result::ScanResult;
use crate::scanner::Scanner;
use crate::vision::QueryImage;

type ResultCallback = Arc<dyn Fn(Option<ScanResult>, Option<Frame>) + Send + Sync + 'static>;
type ErrorCallback = Arc<dyn Fn(ScanError) + Send + Sync + 'static>;
type NotifyCallback = Arc<dyn Fn() + Send + Sync + 'static>;

/// Callbacks of a manual session, all invoked on the notification context
#[derive(Clone)]
pub struct ManualDelegate {
    on_result: ResultCallback,
    on_error: ErrorCallback,
    on_server_request: Option<NotifyCallback>,
    on_warning: Option<WarningCallback>,
}

impl ManualDelegate {
    /// `on_result` receives the result, or `None` when nothing matched, plus
    /// the scanned frame at capture resolution when the session wants it
    pub fn new<R, E>(on_result: R, on_error: E) -> Self
    where
        R: Fn(Option<ScanResult>, Option<Frame>) + Send + Sync + 'static,
        E: Fn(ScanError) + Send + Sync + 'static,
    {
        Self {
            on_result: Arc::new(on_result),
            on_error: Arc::new(on_error),
            on_server_request: None,
            on_warning: None,
        }
    }

    /// Called right before a server search is issued
    pub fn on_server_request<F>(mut self, callback: F) -> Self
    where
        F: Fn() + Send + Sync + 'static,
    {
        self.on_server_request = Some(Arc::new(callback));
        self
    }

    pub fn on_warning<F>(mut self, callback: F) -> Self
    where
        F: Fn(&str) + Send + Sync + 'static,
    {
        self.on_warning = Some(Arc::new(callback));
        self
    }
}

/// Progress of the current snap
#[derive(Default)]
enum Snap {
    #[default]
    Idle,
    /// Waiting for the next frame
    Requested,
    /// A frame is being scanned on device
    Processing,
    /// Waiting for the server
    Searching(SearchOperation),
}

struct ManualShared {
    scanner: Arc<Scanner>,
    core: Arc<SessionCore>,
    delegate: ManualDelegate,
    snap: Mutex<Snap>,
}

impl ManualShared {
    fn process(self: &Arc<Self>, frame: Frame) {
        {
            let mut snap = self.snap.lock();
            if !matches!(*snap, Snap::Requested) || !self.core.is_running() {
                return;
            }
            *snap = Snap::Processing;
        }

        let config = self.core.config();
        let query = match QueryImage::from_frame(&frame, config.interface_orientation) {
            Ok(query) => query,
            Err(e) => return self.fail(e),
        };

        let scanned = self.scanner.scan_local(
            &query,
            config.result_types,
            config.search_options,
            ResultExtras::NONE,
        );
        match scanned {
            Ok(Some(result)) => self.deliver(Some(result), frame, &config),
            Ok(None) if config.result_types.contains(ResultType::IMAGE) => self.search(query, frame, config),
            Ok(None) => self.deliver(None, frame, &config),
            Err(e) => self.fail(e),
        }
    }

    /// Settle the snap locally: pause, then hand the outcome to the delegate
    fn deliver(&self, result: Option<ScanResult>, frame: Frame, config: &SessionConfig) {
        if !self.settle_processing() {
            return;
        }
        self.core.pause();
        let frame = config.wants_query.then_some(frame);
        let on_result = self.delegate.on_result.clone();
        self.scanner.notifier().post(move || on_result(result, frame));
    }

    fn fail(&self, error: ScanError) {
        if !self.settle_processing() {
            return;
        }
        debug!("Manual session error: {}", error);
        self.core.pause();
        let on_error = self.delegate.on_error.clone();
        self.scanner.notifier().post(move || on_error(error));
    }

    /// Processing -> Idle; false if the snap was cancelled meanwhile
    fn settle_processing(&self) -> bool {
        let mut snap = self.snap.lock();
        if !matches!(*snap, Snap::Processing) {
            debug!("Snap withdrawn during processing, dropping outcome");
            return false;
        }
        *snap = Snap::Idle;
        true
    }

    fn search(self: &Arc<Self>, query: QueryImage, frame: Frame, config: SessionConfig) {
        if let Some(on_server_request) = self.delegate.on_server_request.clone() {
            self.scanner.notifier().post(move || on_server_request());
        }

        let operation = match self.scanner.start_api_search(&query) {
            Ok(operation) => operation,
            Err(e) => return self.fail(e),
        };
        {
            let mut snap = self.snap.lock();
            if !matches!(*snap, Snap::Processing) {
                drop(snap);
                self.scanner.cancel_api_search(&operation);
                return;
            }
            *snap = Snap::Searching(operation.clone());
        }
        debug!("Manual session waiting for server search {}", operation.id());

        let shared = self.clone();
        let current = operation.clone();
        let registered = operation.on_complete(move |outcome| {
            {
                let mut snap = shared.snap.lock();
                if !matches!(&*snap, Snap::Searching(pending) if pending.same_as(&current)) {
                    return;
                }
                *snap = Snap::Idle;
            }
            // Pause first, then deliver; this already runs on the notification context.
            shared.core.pause();
            match outcome {
                Ok(result) => {
                    let frame = config.wants_query.then_some(frame);
                    (shared.delegate.on_result)(result, frame)
                }
                Err(e) => (shared.delegate.on_error)(e),
            }
        });
        if let Err(e) = registered {
            self.warn(&format!("server search continuation rejected: {}", e));
        }
    }

    fn warn(&self, message: &str) {
        if let Some(on_warning) = self.delegate.on_warning.clone() {
            let message = message.to_string();
            self.scanner.notifier().post(move || on_warning(&message));
        }
    }

    /// Withdraw a pending snap and cancel its server search
    fn cancel(&self) -> bool {
        let previous = std::mem::take(&mut *self.snap.lock());
        match previous {
            Snap::Idle => false,
            Snap::Requested | Snap::Processing => true,
            Snap::Searching(operation) => {
                self.scanner.cancel_api_search(&operation);
                true
            }
        }
    }
}

/// Session scanning one frame per user request, with server fallback
pub struct ManualSession {
    shared: Arc<ManualShared>,
    pipeline: Mutex<Pipeline>,
}

impl ManualSession {
    /// The scanner must be opened by the caller; sessions never sync
    pub fn new(scanner: Arc<Scanner>, source: Box<dyn FrameSource>, delegate: ManualDelegate) -> Self {
        Self {
            shared: Arc::new(ManualShared {
                scanner,
                core: Arc::new(SessionCore::default()),
                delegate,
                snap: Mutex::new(Snap::Idle),
            }),
            pipeline: Mutex::new(Pipeline::new(source)),
        }
    }

    pub fn state(&self) -> SessionState {
        self.shared.core.state()
    }

    pub fn config(&self) -> SessionConfig {
        self.shared.core.config()
    }

    pub fn set_config(&self, config: SessionConfig) {
        self.shared.core.set_config(config)
    }

    pub fn start_running(&self) -> Result<()> {
        let shared = self.shared.clone();
        self.pipeline
            .lock()
            .start("manual-session", self.shared.core.clone(), move |frame| shared.process(frame))?;
        info!("Manual session started");
        Ok(())
    }

    /// Release the camera; an outstanding server search is cancelled and its
    /// completion dropped
    pub fn stop_running(&self) -> Result<()> {
        self.shared.cancel();
        self.pipeline.lock().stop(&self.shared.core)?;
        info!("Manual session stopped");
        Ok(())
    }

    pub fn pause_processing(&self) -> bool {
        self.shared.core.pause()
    }

    pub fn resume_processing(&self) -> bool {
        self.shared.core.resume()
    }

    /// Scan the next frame
    ///
    /// Returns false when the session is not running or a previous snap is
    /// still in progress, including its server search.
    pub fn snap(&self) -> bool {
        let mut snap = self.shared.snap.lock();
        if !matches!(*snap, Snap::Idle) || !self.shared.core.is_running() {
            return false;
        }
        *snap = Snap::Requested;
        debug!("Snap requested");
        true
    }

    /// Cancel the pending snap or its server search; returns whether
    /// anything was cancelled
    pub fn cancel(&self) -> bool {
        self.shared.cancel()
    }
}

impl Drop for ManualSession {
    fn drop(&mut self) {
        self.shared.cancel();
        let _ = self.pipeline.get_mut().stop(&self.shared.core);
    }
}

#[cfg(test)]
mod tests {
    use super::super::tests::{blank_frame, cover_frame, harness, pump_until};
    use super::*;
    use crate::capture::{Orientation, PushFrameSource};
    use crate::error::ErrorKind;
    use std::io::Write;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::time::Duration;

    #[derive(Default)]
    struct Outcomes {
        /// Matched text and the size of the delivered frame
        results: Mutex<Vec<(Option<String>, Option<(u32, u32)>)>>,
        errors: Mutex<Vec<ErrorKind>>,
        server_requests: AtomicUsize,
    }

    fn delegate(outcomes: &Arc<Outcomes>) -> ManualDelegate {
        let (r, e, s) = (outcomes.clone(), outcomes.clone(), outcomes.clone());
        ManualDelegate::new(
            move |result, frame| {
                r.results.lock().push((
                    result.and_then(|res| res.text().map(str::to_string)),
                    frame.map(|frame| frame.dimensions()),
                ))
            },
            move |error| e.errors.lock().push(error.kind()),
        )
        .on_server_request(move || {
            s.server_requests.fetch_add(1, Ordering::SeqCst);
        })
    }

    fn start(h: &super::super::tests::Harness, outcomes: &Arc<Outcomes>, wants_query: bool) -> (ManualSession, PushFrameSource) {
        let source = PushFrameSource::new();
        let session = ManualSession::new(h.scanner.clone(), Box::new(source.clone()), delegate(outcomes));
        session.set_config(SessionConfig {
            interface_orientation: Orientation::LandscapeRight,
            wants_query,
            ..SessionConfig::default()
        });
        session.start_running().unwrap();
        (session, source)
    }

    #[test]
    fn test_local_match_delivers_with_query() {
        let h = harness("http://127.0.0.1:9");
        let outcomes = Arc::new(Outcomes::default());
        let (session, source) = start(&h, &outcomes, true);

        // Frames without a snap are ignored.
        source.push(cover_frame());
        h.notifier.pump_timeout(Duration::from_millis(200));
        assert!(outcomes.results.lock().is_empty());

        assert!(session.snap());
        assert!(!session.snap());
        source.push(cover_frame());
        assert!(pump_until(&h.notifier, Duration::from_secs(10), || !outcomes.results.lock().is_empty()));

        assert_eq!(
            outcomes.results.lock()[0],
            (Some("cover".to_string()), Some(cover_frame().dimensions()))
        );
        assert_eq!(outcomes.server_requests.load(Ordering::SeqCst), 0);
        assert_eq!(session.state(), SessionState::Paused);
        assert!(!session.snap());

        assert!(session.resume_processing());
        assert!(session.snap());
        session.stop_running().unwrap();
    }

    #[test]
    fn test_server_fallback_and_outstanding_snap() {
        let mut server = mockito::Server::new();
        server
            .mock("POST", "/v1/search")
            .with_chunked_body(|w| {
                std::thread::sleep(Duration::from_millis(300));
                w.write_all(br#"{"found":true,"id":"remote-7"}"#)
            })
            .create();

        let h = harness(&server.url());
        let outcomes = Arc::new(Outcomes::default());
        let (session, source) = start(&h, &outcomes, false);

        assert!(session.snap());
        source.push(blank_frame());
        assert!(pump_until(&h.notifier, Duration::from_secs(10), || {
            outcomes.server_requests.load(Ordering::SeqCst) == 1
        }));
        // The server search is outstanding.
        assert!(!session.snap());

        assert!(pump_until(&h.notifier, Duration::from_secs(10), || !outcomes.results.lock().is_empty()));
        assert_eq!(outcomes.results.lock()[0], (Some("remote-7".to_string()), None));
        assert_eq!(session.state(), SessionState::Paused);

        assert!(session.resume_processing());
        assert!(session.snap());
        session.stop_running().unwrap();
    }

    #[test]
    fn test_server_result_carries_capture_frame() {
        let mut server = mockito::Server::new();
        server
            .mock("POST", "/v1/search")
            .with_body(r#"{"found":true,"id":"remote-7"}"#)
            .create();

        let h = harness(&server.url());
        let outcomes = Arc::new(Outcomes::default());
        let (session, source) = start(&h, &outcomes, true);
        session.set_config(SessionConfig {
            interface_orientation: Orientation::Portrait,
            wants_query: true,
            ..SessionConfig::default()
        });

        assert!(session.snap());
        source.push(blank_frame());
        assert!(pump_until(&h.notifier, Duration::from_secs(10), || !outcomes.results.lock().is_empty()));
        // rotation and downscaling only apply to the query sent for matching
        assert_eq!(outcomes.results.lock()[0], (Some("remote-7".to_string()), Some((640, 480))));
        session.stop_running().unwrap();
    }

    #[test]
    fn test_cancel_outstanding_search() {
        let mut server = mockito::Server::new();
        server
            .mock("POST", "/v1/search")
            .with_chunked_body(|w| {
                std::thread::sleep(Duration::from_millis(500));
                w.write_all(br#"{"found":false}"#)
            })
            .create();

        let h = harness(&server.url());
        let outcomes = Arc::new(Outcomes::default());
        let (session, source) = start(&h, &outcomes, false);

        assert!(!session.cancel());
        assert!(session.snap());
        source.push(blank_frame());
        assert!(pump_until(&h.notifier, Duration::from_secs(10), || {
            outcomes.server_requests.load(Ordering::SeqCst) == 1
        }));
        // Give the session a moment to register the operation.
        std::thread::sleep(Duration::from_millis(50));

        assert!(session.cancel());
        assert!(session.snap());
        h.notifier.pump_timeout(Duration::from_millis(800));
        assert!(outcomes.results.lock().is_empty());
        assert!(outcomes.errors.lock().is_empty());
        assert!(session.cancel());
        session.stop_running().unwrap();
    }

    #[test]
    fn test_unmatched_without_image_type_delivers_none() {
        let h = harness("http://127.0.0.1:9");
        let outcomes = Arc::new(Outcomes::default());
        let (session, source) = start(&h, &outcomes, false);
        session.set_config(SessionConfig {
            result_types: ResultType::EAN13,
            interface_orientation: Orientation::LandscapeRight,
            ..SessionConfig::default()
        });

        assert!(session.snap());
        source.push(blank_frame());
        assert!(pump_until(&h.notifier, Duration::from_secs(10), || !outcomes.results.lock().is_empty()));
        assert_eq!(outcomes.results.lock()[0], (None, None));
        assert_eq!(outcomes.server_requests.load(Ordering::SeqCst), 0);
        session.stop_running().unwrap();
    }

    #[test]
    fn test_server_error_is_delivered() {
        let mut server = mockito::Server::new();
        server.mock("POST", "/v1/search").with_status(503).create();

        let h = harness(&server.url());
        let outcomes = Arc::new(Outcomes::default());
        let (session, source) = start(&h, &outcomes, false);

        assert!(session.snap());
        source.push(blank_frame());
        assert!(pump_until(&h.notifier, Duration::from_secs(10), || !outcomes.errors.lock().is_empty()));
        assert_eq!(outcomes.errors.lock()[0], ErrorKind::Unavail);
        assert_eq!(session.state(), SessionState::Paused);
        session.stop_running().unwrap();
    }
}
