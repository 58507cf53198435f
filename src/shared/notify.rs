//! Serialized notification context
//!
//! Every delegate, observer and task continuation runs here, one at a time
//! and in posting order. The context is either a dedicated thread or a queue
//! the host drains from its own loop with [`Notifier::pump`].

use crossbeam_channel::{unbounded, Receiver, RecvTimeoutError, Sender};
use parking_lot::Mutex;
use std::cell::Cell;
use std::sync::Arc;
use std::thread::JoinHandle;
use std::time::{Duration, Instant};
use tracing::{debug, warn};

type Job = Box<dyn FnOnce() + Send + 'static>;

enum Message {
    Run(Job),
    Stop,
}

thread_local! {
    static ON_NOTIFIER: Cell<bool> = const { Cell::new(false) };
}

/// Marks the current thread as the notification context while alive
struct ContextGuard {
    previous: bool,
}

impl ContextGuard {
    fn enter() -> Self {
        let previous = ON_NOTIFIER.with(|flag| flag.replace(true));
        Self { previous }
    }
}

impl Drop for ContextGuard {
    fn drop(&mut self) {
        let previous = self.previous;
        ON_NOTIFIER.with(|flag| flag.set(previous));
    }
}

struct NotifierInner {
    tx: Sender<Message>,
    rx: Receiver<Message>,
    dedicated: bool,
    handle: Mutex<Option<JoinHandle<()>>>,
}

impl Drop for NotifierInner {
    fn drop(&mut self) {
        if !self.dedicated {
            return;
        }
        let _ = self.tx.send(Message::Stop);
        if let Some(handle) = self.handle.lock().take() {
            if Notifier::is_current() {
                // Last handle dropped from inside a callback; the loop exits on Stop.
                return;
            }
            let _ = handle.join();
        }
    }
}

/// Handle to the notification context
#[derive(Clone)]
pub struct Notifier {
    inner: Arc<NotifierInner>,
}

impl Notifier {
    /// Notification context backed by its own thread
    pub fn spawn() -> std::io::Result<Self> {
        let (tx, rx) = unbounded::<Message>();
        let worker_rx = rx.clone();

        let handle = std::thread::Builder::new()
            .name("scanner-notify".to_string())
            .spawn(move || {
                let _guard = ContextGuard::enter();
                debug!("Notification thread started");
                while let Ok(message) = worker_rx.recv() {
                    match message {
                        Message::Run(job) => job(),
                        Message::Stop => break,
                    }
                }
                debug!("Notification thread exiting");
            })?;

        Ok(Self {
            inner: Arc::new(NotifierInner {
                tx,
                rx,
                dedicated: true,
                handle: Mutex::new(Some(handle)),
            }),
        })
    }

    /// Notification context drained by the host through [`Notifier::pump`]
    pub fn manual() -> Self {
        let (tx, rx) = unbounded();
        Self {
            inner: Arc::new(NotifierInner {
                tx,
                rx,
                dedicated: false,
                handle: Mutex::new(None),
            }),
        }
    }

    /// Whether this notifier owns a dedicated thread
    pub fn is_dedicated(&self) -> bool {
        self.inner.dedicated
    }

    /// Whether the calling thread is currently running as a notification context
    pub fn is_current() -> bool {
        ON_NOTIFIER.with(|flag| flag.get())
    }

    /// Queue a callback
    pub fn post<F>(&self, job: F)
    where
        F: FnOnce() + Send + 'static,
    {
        if self.inner.tx.send(Message::Run(Box::new(job))).is_err() {
            warn!("Notification context is gone, dropping callback");
        }
    }

    /// Run every queued callback on the calling thread, returning how many ran
    ///
    /// Only meaningful for a manual notifier; a dedicated one drains itself.
    pub fn pump(&self) -> usize {
        if self.inner.dedicated {
            return 0;
        }
        let _guard = ContextGuard::enter();
        let mut ran = 0;
        while let Ok(message) = self.inner.rx.try_recv() {
            if let Message::Run(job) = message {
                job();
                ran += 1;
            }
        }
        ran
    }

    /// Wait up to `timeout` for at least one callback, then drain the queue
    pub fn pump_timeout(&self, timeout: Duration) -> usize {
        if self.inner.dedicated {
            return 0;
        }
        let _guard = ContextGuard::enter();
        let deadline = Instant::now() + timeout;
        let mut ran = 0;
        loop {
            let message = if ran == 0 {
                match self.inner.rx.recv_deadline(deadline) {
                    Ok(message) => message,
                    Err(RecvTimeoutError::Timeout) | Err(RecvTimeoutError::Disconnected) => break,
                }
            } else {
                match self.inner.rx.try_recv() {
                    Ok(message) => message,
                    Err(_) => break,
                }
            };
            if let Message::Run(job) = message {
                job();
                ran += 1;
            }
        }
        ran
    }

    /// Block until everything posted before this call has run
    pub fn flush(&self) {
        if !self.inner.dedicated {
            self.pump();
            return;
        }
        if Self::is_current() {
            return;
        }
        let (done_tx, done_rx) = crossbeam_channel::bounded::<()>(1);
        self.post(move || {
            let _ = done_tx.send(());
        });
        let _ = done_rx.recv();
    }
}

impl std::fmt::Debug for Notifier {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Notifier")
            .field("dedicated", &self.inner.dedicated)
            .field("queued", &self.inner.rx.len())
            .finish()
    }
}
