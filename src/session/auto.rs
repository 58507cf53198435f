//! Continuous scanning session
//!
//! Every frame received while running is matched and decoded. The first
//! result pauses the session before it is delivered; processing resumes only
//! on an explicit [`AutoSession::resume_processing`].

use parking_lot::Mutex;
use std::sync::Arc;
use tracing::{debug, info};

use super::{Pipeline, SessionConfig, SessionCore, SessionState, WarningCallback};
use crate::capture::{Frame, FrameSource};
use crate::error::Result;
use crate::result::ScanResult;
use crate::scanner::Scanner;
use crate::vision::QueryImage;

#[derive(Clone)]
enum OnResult {
    Plain(Arc<dyn Fn(ScanResult) + Send + Sync + 'static>),
    WithFrame(Arc<dyn Fn(ScanResult, Frame) + Send + Sync + 'static>),
}

/// Callbacks of an auto session, all invoked on the notification context
#[derive(Clone)]
pub struct AutoDelegate {
    on_result: OnResult,
    on_warning: Option<WarningCallback>,
}

impl AutoDelegate {
    /// Deliver results only
    pub fn new<F>(on_result: F) -> Self
    where
        F: Fn(ScanResult) + Send + Sync + 'static,
    {
        Self {
            on_result: OnResult::Plain(Arc::new(on_result)),
            on_warning: None,
        }
    }

    /// Deliver results together with the camera frame they were found in
    pub fn with_frame<F>(on_result: F) -> Self
    where
        F: Fn(ScanResult, Frame) + Send + Sync + 'static,
    {
        Self {
            on_result: OnResult::WithFrame(Arc::new(on_result)),
            on_warning: None,
        }
    }

    pub fn on_warning<F>(mut self, on_warning: F) -> Self
    where
        F: Fn(&str) + Send + Sync + 'static,
    {
        self.on_warning = Some(Arc::new(on_warning));
        self
    }

    fn deliver(&self, result: ScanResult, frame: Frame) {
        match &self.on_result {
            OnResult::Plain(callback) => callback(result),
            OnResult::WithFrame(callback) => callback(result, frame),
        }
    }
}

struct AutoShared {
    scanner: Arc<Scanner>,
    core: Arc<SessionCore>,
    delegate: AutoDelegate,
}

impl AutoShared {
    fn process(&self, frame: Frame) {
        if !self.core.is_running() {
            return;
        }
        let config = self.core.config();
        let query = match QueryImage::from_frame(&frame, config.interface_orientation) {
            Ok(query) => query,
            Err(e) => return self.warn(format!("frame skipped: {}", e)),
        };

        let scanned = self.scanner.scan_local(
            &query,
            config.result_types,
            config.search_options,
            config.result_extras,
        );
        match scanned {
            Ok(Some(result)) => {
                // Stopped or paused while this frame was in flight: drop it.
                if !self.core.pause() {
                    debug!("Session left running state, dropping result");
                    return;
                }
                debug!("Auto session found {:?}", result.text());
                let delegate = self.delegate.clone();
                self.scanner
                    .notifier()
                    .post(move || delegate.deliver(result, frame));
            }
            Ok(None) => {}
            Err(e) => self.warn(format!("scan failed: {}", e)),
        }
    }

    fn warn(&self, message: String) {
        debug!("Auto session warning: {}", message);
        if let Some(on_warning) = self.delegate.on_warning.clone() {
            self.scanner.notifier().post(move || on_warning(&message));
        }
    }
}

/// Session reporting every recognition without user interaction
pub struct AutoSession {
    shared: Arc<AutoShared>,
    pipeline: Mutex<Pipeline>,
}

impl AutoSession {
    /// The scanner must be opened by the caller; sessions never sync
    pub fn new(scanner: Arc<Scanner>, source: Box<dyn FrameSource>, delegate: AutoDelegate) -> Self {
        Self {
            shared: Arc::new(AutoShared {
                scanner,
                core: Arc::new(SessionCore::default()),
                delegate,
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

    /// Acquire the camera and start processing frames
    pub fn start_running(&self) -> Result<()> {
        let shared = self.shared.clone();
        self.pipeline
            .lock()
            .start("auto-session", self.shared.core.clone(), move |frame| shared.process(frame))?;
        info!("Auto session started");
        Ok(())
    }

    /// Release the camera; safe to call when already stopped
    pub fn stop_running(&self) -> Result<()> {
        self.pipeline.lock().stop(&self.shared.core)?;
        info!("Auto session stopped");
        Ok(())
    }

    pub fn pause_processing(&self) -> bool {
        self.shared.core.pause()
    }

    pub fn resume_processing(&self) -> bool {
        self.shared.core.resume()
    }
}

impl Drop for AutoSession {
    fn drop(&mut self) {
        let _ = self.pipeline.get_mut().stop(&self.shared.core);
    }
}
