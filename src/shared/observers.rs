//! Observer registry with delivery on the notification context

use parking_lot::RwLock;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

use crate::shared::notify::Notifier;

/// Token returned by `subscribe`, used to unsubscribe
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct SubscriptionId(u64);

type Callback<E> = Arc<dyn Fn(&E) + Send + Sync + 'static>;

struct Registry<E> {
    next_id: AtomicU64,
    subscribers: RwLock<Vec<(SubscriptionId, Callback<E>)>>,
}

/// Set of callbacks interested in events of type `E`
pub struct Observers<E> {
    registry: Arc<Registry<E>>,
    notifier: Notifier,
}

impl<E> Clone for Observers<E> {
    fn clone(&self) -> Self {
        Self {
            registry: self.registry.clone(),
            notifier: self.notifier.clone(),
        }
    }
}

impl<E> Observers<E>
where
    E: Send + Sync + 'static,
{
    pub fn new(notifier: Notifier) -> Self {
        Self {
            registry: Arc::new(Registry {
                next_id: AtomicU64::new(1),
                subscribers: RwLock::new(Vec::new()),
            }),
            notifier,
        }
    }

    pub fn subscribe<F>(&self, callback: F) -> SubscriptionId
    where
        F: Fn(&E) + Send + Sync + 'static,
    {
        let id = SubscriptionId(self.registry.next_id.fetch_add(1, Ordering::Relaxed));
        self.registry.subscribers.write().push((id, Arc::new(callback)));
        id
    }

    /// Returns whether the subscription existed
    pub fn unsubscribe(&self, id: SubscriptionId) -> bool {
        let mut subscribers = self.registry.subscribers.write();
        let before = subscribers.len();
        subscribers.retain(|(sid, _)| *sid != id);
        subscribers.len() != before
    }

    pub fn len(&self) -> usize {
        self.registry.subscribers.read().len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Queue `event` for every subscriber registered when it is delivered
    pub fn publish(&self, event: E) {
        let registry = self.registry.clone();
        self.notifier.post(move || {
            let subscribers: Vec<Callback<E>> = registry
                .subscribers
                .read()
                .iter()
                .map(|(_, cb)| cb.clone())
                .collect();
            for callback in subscribers {
                callback(&event);
            }
        });
    }
}
