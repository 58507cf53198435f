//! Shared plumbing between the scanner components
//!
//! The notification context, cancelable task handles and observer
//! registries used by sync, server search and sessions.

pub mod notify;
pub mod observers;
pub mod task;

pub use notify::Notifier;
pub use observers::{Observers, SubscriptionId};
pub use task::{CancelPolicy, Task};
