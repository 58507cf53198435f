//! Camera Capture Layer
//!
//! The camera itself lives in the host application. Sessions only see a
//! [`FrameSource`] they start and stop, and hand it a [`FrameSink`] to push
//! frames into.

pub mod frame;

pub use frame::{Frame, Orientation};

use parking_lot::Mutex;
use std::sync::Arc;

use crate::error::{Result, ScanError};

type Deliver = dyn Fn(Frame) + Send + Sync + 'static;

/// Receiving end a source pushes frames into
#[derive(Clone)]
pub struct FrameSink {
    deliver: Arc<Deliver>,
}

impl FrameSink {
    pub fn new<F>(deliver: F) -> Self
    where
        F: Fn(Frame) + Send + Sync + 'static,
    {
        Self {
            deliver: Arc::new(deliver),
        }
    }

    /// Hand a frame to the session; never blocks
    pub fn push(&self, frame: Frame) {
        (self.deliver)(frame)
    }
}

/// Camera abstraction acquired by a running session
pub trait FrameSource: Send {
    /// Acquire the camera and start pushing frames into `sink`
    fn start(&mut self, sink: FrameSink) -> Result<()>;

    /// Release the camera
    fn stop(&mut self) -> Result<()>;
}

/// Source for hosts that own their capture loop and push frames themselves
#[derive(Clone, Default)]
pub struct PushFrameSource {
    sink: Arc<Mutex<Option<FrameSink>>>,
}

impl PushFrameSource {
    pub fn new() -> Self {
        Self::default()
    }

    /// Push a frame; returns false while no session has started the source
    pub fn push(&self, frame: Frame) -> bool {
        let sink = self.sink.lock().clone();
        match sink {
            Some(sink) => {
                sink.push(frame);
                true
            }
            None => false,
        }
    }

    pub fn is_started(&self) -> bool {
        self.sink.lock().is_some()
    }
}

impl FrameSource for PushFrameSource {
    fn start(&mut self, sink: FrameSink) -> Result<()> {
        let mut slot = self.sink.lock();
        if slot.is_some() {
            return Err(ScanError::misuse("frame source is already started"));
        }
        *slot = Some(sink);
        Ok(())
    }

    fn stop(&mut self) -> Result<()> {
        self.sink.lock().take();
        Ok(())
    }
}
