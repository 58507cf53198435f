//! Cancelable background operation handle
//!
//! A [`Task`] carries a cancellation token, a single continuation that runs on
//! the notification context, and the settled outcome for blocking callers.

use parking_lot::{Condvar, Mutex};
use std::sync::Arc;
use std::time::{Duration, Instant};
use tokio_util::sync::CancellationToken;
use uuid::Uuid;

use crate::error::{Result, ScanError};
use crate::shared::notify::Notifier;

type Continuation<T> = Box<dyn FnOnce(Result<T>) + Send + 'static>;

/// What the continuation sees when a task is cancelled
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CancelPolicy {
    /// The worker finishes with an `Abort` error, which is delivered
    Report,
    /// Cancellation that wins the race suppresses the continuation entirely
    Silence,
}

struct TaskState<T> {
    outcome: Option<Result<T>>,
    continuation: Option<Continuation<T>>,
    silenced: bool,
}

struct TaskShared<T> {
    id: Uuid,
    token: CancellationToken,
    policy: CancelPolicy,
    notifier: Notifier,
    state: Mutex<TaskState<T>>,
    settled: Condvar,
}

/// Handle to a background operation producing `T`
pub struct Task<T> {
    shared: Arc<TaskShared<T>>,
}

impl<T> Clone for Task<T> {
    fn clone(&self) -> Self {
        Self {
            shared: self.shared.clone(),
        }
    }
}

impl<T> std::fmt::Debug for Task<T> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Task")
            .field("id", &self.shared.id)
            .field("cancelled", &self.shared.token.is_cancelled())
            .finish()
    }
}

impl<T> Task<T>
where
    T: Clone + Send + 'static,
{
    pub(crate) fn new(notifier: Notifier, policy: CancelPolicy) -> Self {
        Self {
            shared: Arc::new(TaskShared {
                id: Uuid::new_v4(),
                token: CancellationToken::new(),
                policy,
                notifier,
                state: Mutex::new(TaskState {
                    outcome: None,
                    continuation: None,
                    silenced: false,
                }),
                settled: Condvar::new(),
            }),
        }
    }

    /// A task that is already settled, e.g. rejected before any work started
    pub(crate) fn settled(notifier: Notifier, policy: CancelPolicy, outcome: Result<T>) -> Self {
        let task = Self::new(notifier, policy);
        task.complete(outcome);
        task
    }

    pub fn id(&self) -> Uuid {
        self.shared.id
    }

    pub(crate) fn token(&self) -> CancellationToken {
        self.shared.token.clone()
    }

    /// Whether both handles refer to the same operation
    pub fn same_as(&self, other: &Task<T>) -> bool {
        Arc::ptr_eq(&self.shared, &other.shared)
    }

    pub fn is_cancelled(&self) -> bool {
        self.shared.token.is_cancelled()
    }

    pub fn is_finished(&self) -> bool {
        self.shared.state.lock().outcome.is_some()
    }

    /// Register the continuation, run on the notification context once settled
    ///
    /// Only one continuation may be registered; a second one is rejected with
    /// `Misuse`. A continuation registered after settlement is still delivered.
    pub fn on_complete<F>(&self, continuation: F) -> Result<()>
    where
        F: FnOnce(Result<T>) + Send + 'static,
    {
        let mut state = self.shared.state.lock();
        if state.continuation.is_some() {
            return Err(ScanError::misuse("a continuation is already registered"));
        }
        match &state.outcome {
            Some(_) if state.silenced => Ok(()),
            Some(outcome) => {
                let outcome = outcome.clone();
                drop(state);
                self.shared.notifier.post(move || continuation(outcome));
                Ok(())
            }
            None => {
                state.continuation = Some(Box::new(continuation));
                Ok(())
            }
        }
    }

    /// Request cancellation
    ///
    /// Returns false when the task had already settled. With
    /// [`CancelPolicy::Silence`] a successful cancel settles the task at once
    /// and no continuation ever runs.
    pub fn cancel(&self) -> bool {
        let mut state = self.shared.state.lock();
        if state.outcome.is_some() {
            return false;
        }
        self.shared.token.cancel();
        if self.shared.policy == CancelPolicy::Silence {
            state.outcome = Some(Err(ScanError::aborted()));
            state.silenced = true;
            state.continuation = None;
            self.shared.settled.notify_all();
        }
        true
    }

    /// Settle the task; returns false if it had already settled
    pub(crate) fn complete(&self, outcome: Result<T>) -> bool {
        let mut state = self.shared.state.lock();
        if state.outcome.is_some() {
            return false;
        }
        state.outcome = Some(outcome.clone());
        // queued before waiters wake, so a caller returning from wait() can pump it
        if let Some(continuation) = state.continuation.take() {
            self.shared.notifier.post(move || continuation(outcome));
        }
        self.shared.settled.notify_all();
        true
    }

    /// Block until the task settles
    pub fn wait(&self) -> Result<T> {
        let mut state = self.shared.state.lock();
        loop {
            if let Some(outcome) = &state.outcome {
                return outcome.clone();
            }
            self.shared.settled.wait(&mut state);
        }
    }

    /// Block until the task settles or `timeout` elapses
    pub fn wait_timeout(&self, timeout: Duration) -> Option<Result<T>> {
        let deadline = Instant::now() + timeout;
        let mut state = self.shared.state.lock();
        loop {
            if let Some(outcome) = &state.outcome {
                return Some(outcome.clone());
            }
            if self.shared.settled.wait_until(&mut state, deadline).timed_out() {
                return state.outcome.clone();
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::error::ErrorKind;

    #[test]
    fn test_continuation_after_completion() {
        let notifier = Notifier::manual();
        let task: Task<u32> = Task::new(notifier.clone(), CancelPolicy::Report);
        let got = Arc::new(Mutex::new(None));

        assert!(task.complete(Ok(7)));
        assert!(!task.complete(Ok(8)));

        let sink = got.clone();
        task.on_complete(move |r| *sink.lock() = Some(r)).unwrap();
        notifier.pump();
        assert_eq!(*got.lock(), Some(Ok(7)));
    }

    #[test]
    fn test_single_continuation() {
        let task: Task<u32> = Task::new(Notifier::manual(), CancelPolicy::Report);
        task.on_complete(|_| {}).unwrap();
        let err = task.on_complete(|_| {}).unwrap_err();
        assert_eq!(err.kind(), ErrorKind::Misuse);
    }

    #[test]
    fn test_report_policy_delivers_abort() {
        let notifier = Notifier::manual();
        let task: Task<u32> = Task::new(notifier.clone(), CancelPolicy::Report);
        let got = Arc::new(Mutex::new(None));
        let sink = got.clone();
        task.on_complete(move |r| *sink.lock() = Some(r)).unwrap();

        assert!(task.cancel());
        assert!(task.is_cancelled());
        assert!(!task.is_finished());

        // worker notices the token at its next safe point
        task.complete(Err(ScanError::aborted()));
        notifier.pump();
        assert_eq!(got.lock().as_ref().unwrap().as_ref().unwrap_err().kind(), ErrorKind::Abort);
    }

    #[test]
    fn test_silence_policy_suppresses_completion() {
        let notifier = Notifier::manual();
        let task: Task<u32> = Task::new(notifier.clone(), CancelPolicy::Silence);
        let fired = Arc::new(Mutex::new(false));
        let sink = fired.clone();
        task.on_complete(move |_| *sink.lock() = true).unwrap();

        assert!(task.cancel());
        assert!(!task.complete(Ok(1)));
        notifier.pump();
        assert!(!*fired.lock());
        assert!(task.wait().unwrap_err().is_abort());
        assert!(!task.cancel());
    }

    #[test]
    fn test_wait_across_threads() {
        let task: Task<String> = Task::new(Notifier::manual(), CancelPolicy::Report);
        let worker = task.clone();
        std::thread::spawn(move || {
            std::thread::sleep(Duration::from_millis(20));
            worker.complete(Ok("done".to_string()));
        });
        assert_eq!(task.wait().unwrap(), "done");
    }

    #[test]
    fn test_continuation_queued_before_wait_returns() {
        let notifier = Notifier::manual();
        for _ in 0..50 {
            let task: Task<u32> = Task::new(notifier.clone(), CancelPolicy::Report);
            let got = Arc::new(Mutex::new(None));
            let sink = got.clone();
            task.on_complete(move |r| *sink.lock() = Some(r)).unwrap();

            let worker = task.clone();
            let handle = std::thread::spawn(move || {
                worker.complete(Err(ScanError::aborted()));
            });
            assert!(task.wait().unwrap_err().is_abort());
            assert_eq!(notifier.pump(), 1);
            assert!(got.lock().as_ref().unwrap().as_ref().unwrap_err().is_abort());
            handle.join().unwrap();
        }
    }

    #[test]
    fn test_wait_timeout_expires() {
        let task: Task<u32> = Task::new(Notifier::manual(), CancelPolicy::Report);
        assert!(task.wait_timeout(Duration::from_millis(10)).is_none());
    }
}
