//! Scanner Sessions
//!
//! Turn a stream of camera frames into scan results. Both session kinds share
//! the state machine `Stopped -> Running <-> Paused -> Stopped` and a frame
//! pipeline: the camera pushes frames into a one-slot channel drained by a
//! per-session processing thread, and frames arriving while that thread is
//! busy, or while the session is not running, are dropped.

pub mod auto;
pub mod manual;

pub use auto::{AutoDelegate, AutoSession};
pub use manual::{ManualDelegate, ManualSession};

use crossbeam_channel::{bounded, Sender, TrySendError};
use parking_lot::{Mutex, RwLock};
use std::sync::Arc;
use std::thread::JoinHandle;
use tracing::{debug, trace};

use crate::capture::{Frame, FrameSink, FrameSource, Orientation};
use crate::error::{ErrorKind, Result, ScanError};
use crate::flags::{ResultExtras, ResultType, SearchOptions};

/// Lifecycle of a session
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum SessionState {
    #[default]
    Stopped,
    Running,
    Paused,
}

/// Per-session scanning settings; a frame uses the values current when its
/// processing starts
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct SessionConfig {
    pub result_types: ResultType,
    /// Auto sessions only
    pub result_extras: ResultExtras,
    pub search_options: SearchOptions,
    pub interface_orientation: Orientation,
    /// Manual sessions only: hand the query image to the delegate
    pub wants_query: bool,
}

impl Default for SessionConfig {
    fn default() -> Self {
        Self {
            result_types: ResultType::IMAGE,
            result_extras: ResultExtras::NONE,
            search_options: SearchOptions::DEFAULT,
            interface_orientation: Orientation::Portrait,
            wants_query: false,
        }
    }
}

/// Debugging callback shared by both delegates
pub type WarningCallback = Arc<dyn Fn(&str) + Send + Sync + 'static>;

/// State and configuration shared between a session and its processing thread
#[derive(Default)]
pub(crate) struct SessionCore {
    state: Mutex<SessionState>,
    config: RwLock<SessionConfig>,
}

impl SessionCore {
    pub(crate) fn state(&self) -> SessionState {
        *self.state.lock()
    }

    pub(crate) fn is_running(&self) -> bool {
        self.state() == SessionState::Running
    }

    pub(crate) fn config(&self) -> SessionConfig {
        *self.config.read()
    }

    pub(crate) fn set_config(&self, config: SessionConfig) {
        *self.config.write() = config;
    }

    /// Running -> Paused; returns whether the state changed
    pub(crate) fn pause(&self) -> bool {
        self.transition(SessionState::Running, SessionState::Paused)
    }

    /// Paused -> Running; returns whether the state changed
    pub(crate) fn resume(&self) -> bool {
        self.transition(SessionState::Paused, SessionState::Running)
    }

    fn transition(&self, from: SessionState, to: SessionState) -> bool {
        let mut state = self.state.lock();
        if *state != from {
            return false;
        }
        *state = to;
        debug!("Session {:?} -> {:?}", from, to);
        true
    }

    /// Stopped -> Running
    fn start(&self) -> Result<()> {
        let mut state = self.state.lock();
        if *state != SessionState::Stopped {
            return Err(ScanError::misuse("the session is already running"));
        }
        *state = SessionState::Running;
        Ok(())
    }

    /// Any -> Stopped; returns whether the session was started
    fn stop(&self) -> bool {
        let mut state = self.state.lock();
        let was_started = *state != SessionState::Stopped;
        *state = SessionState::Stopped;
        was_started
    }
}

/// Camera source plus the processing thread while the session is started
pub(crate) struct Pipeline {
    source: Box<dyn FrameSource>,
    sender: Arc<Mutex<Option<Sender<Frame>>>>,
    worker: Option<JoinHandle<()>>,
}

impl Pipeline {
    pub(crate) fn new(source: Box<dyn FrameSource>) -> Self {
        Self {
            source,
            sender: Arc::new(Mutex::new(None)),
            worker: None,
        }
    }

    /// Start the session, the processing thread and then the camera
    pub(crate) fn start<H>(&mut self, name: &str, core: Arc<SessionCore>, mut handler: H) -> Result<()>
    where
        H: FnMut(Frame) + Send + 'static,
    {
        core.start()?;

        let (tx, rx) = bounded::<Frame>(1);
        *self.sender.lock() = Some(tx);

        let worker = std::thread::Builder::new()
            .name(format!("scanner-{}", name))
            .spawn(move || {
                for frame in rx.iter() {
                    handler(frame);
                }
                debug!("Session processing thread exiting");
            });
        let worker = match worker {
            Ok(worker) => worker,
            Err(e) => {
                self.sender.lock().take();
                core.stop();
                return Err(ScanError::new(ErrorKind::Thread, format!("processing thread: {}", e)));
            }
        };
        self.worker = Some(worker);

        let sender = self.sender.clone();
        let gate = core.clone();
        let sink = FrameSink::new(move |frame| {
            // Paused sessions still receive frames, they are just never processed.
            if !gate.is_running() {
                return;
            }
            if let Some(tx) = sender.lock().as_ref() {
                if let Err(TrySendError::Full(_)) = tx.try_send(frame) {
                    trace!("Processor busy, dropping frame");
                }
            }
        });

        if let Err(e) = self.source.start(sink) {
            self.shutdown(&core);
            return Err(e);
        }
        Ok(())
    }

    /// Release the camera and wait for the processing thread
    pub(crate) fn stop(&mut self, core: &SessionCore) -> Result<()> {
        if self.worker.is_none() {
            return Ok(());
        }
        let released = self.source.stop();
        self.shutdown(core);
        released
    }

    fn shutdown(&mut self, core: &SessionCore) {
        core.stop();
        self.sender.lock().take();
        if let Some(worker) = self.worker.take() {
            if worker.thread().id() != std::thread::current().id() {
                let _ = worker.join();
            }
        }
    }
}

#[cfg(test)]
pub(crate) mod tests {
    use super::*;
    use crate::api::Credential;
    use crate::capture::PushFrameSource;
    use crate::config::{ApiSettings, ScannerConfig};
    use crate::scanner::Scanner;
    use crate::shared::Notifier;
    use crate::storage::signature::SignatureRecord;
    use crate::vision::matcher::tests::{compose, texture, PASTE_AT, PASTE_SIZE};
    use image::{DynamicImage, GrayImage};
    use std::time::{Duration, Instant};
    use tempfile::TempDir;

    pub(crate) struct Harness {
        pub dir: TempDir,
        pub notifier: Notifier,
        pub scanner: Arc<Scanner>,
    }

    /// Open scanner holding one reference, "cover", pointed at `base_url`
    pub(crate) fn harness(base_url: &str) -> Harness {
        let dir = TempDir::new().unwrap();
        let notifier = Notifier::manual();
        let config = ScannerConfig {
            api: ApiSettings {
                base_url: base_url.to_string(),
                ..ApiSettings::default()
            },
            ..ScannerConfig::default()
        };
        let scanner = Arc::new(Scanner::with_notifier(config, notifier.clone()).unwrap());
        scanner
            .open(&dir.path().join("store.db"), Credential::new("key", "secret"))
            .unwrap();
        let record =
            SignatureRecord::from_image("cover", 1, &DynamicImage::ImageLuma8(texture(1, 160, 120))).unwrap();
        scanner.store().apply(vec![record], &[]).unwrap();
        Harness { dir, notifier, scanner }
    }

    /// Landscape-right camera frame showing `gray`
    pub(crate) fn frame_of(gray: &GrayImage) -> Frame {
        let rgba = DynamicImage::ImageLuma8(gray.clone()).to_rgba8();
        Frame::from_rgba(&rgba)
    }

    pub(crate) fn cover_frame() -> Frame {
        frame_of(&compose(&texture(1, 160, 120), PASTE_SIZE, PASTE_AT))
    }

    pub(crate) fn blank_frame() -> Frame {
        frame_of(&GrayImage::from_pixel(640, 480, image::Luma([128])))
    }

    /// Pump the notifier until `done` holds or the deadline passes
    pub(crate) fn pump_until(notifier: &Notifier, timeout: Duration, done: impl Fn() -> bool) -> bool {
        let deadline = Instant::now() + timeout;
        while Instant::now() < deadline {
            notifier.pump_timeout(Duration::from_millis(20));
            if done() {
                return true;
            }
        }
        done()
    }

    #[test]
    fn test_core_transitions() {
        let core = SessionCore::default();
        assert!(!core.pause());
        assert!(!core.resume());

        core.start().unwrap();
        assert!(core.start().is_err());
        assert!(core.pause());
        assert!(!core.pause());
        assert!(core.resume());
        assert!(!core.resume());

        assert!(core.stop());
        assert_eq!(core.state(), SessionState::Stopped);
        assert!(!core.stop());
    }

    #[test]
    fn test_pipeline_drops_frames_when_not_running() {
        let core = Arc::new(SessionCore::default());
        let source = PushFrameSource::new();
        let mut pipeline = Pipeline::new(Box::new(source.clone()));
        let (seen_tx, seen_rx) = crossbeam_channel::unbounded();

        pipeline
            .start("test", core.clone(), move |frame| {
                let _ = seen_tx.send(frame.dimensions());
            })
            .unwrap();
        assert!(source.is_started());

        assert!(source.push(blank_frame()));
        assert_eq!(seen_rx.recv_timeout(Duration::from_secs(2)).unwrap(), (640, 480));

        core.pause();
        source.push(blank_frame());
        assert!(seen_rx.recv_timeout(Duration::from_millis(100)).is_err());

        pipeline.stop(&core).unwrap();
        assert!(!source.is_started());
        assert_eq!(core.state(), SessionState::Stopped);
    }
}
