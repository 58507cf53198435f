//! Signature Synchronization
//!
//! Reconciles the local store with the account's remote signature set on the
//! worker pool. The remote manifest is authoritative: local entries it does
//! not list are removed and stale revisions are replaced. Additions are
//! fetched in batches, each applied in its own transaction, so an interrupted
//! sync keeps its progress and the next one only fetches what is missing.
//! The store's maintenance lock is held for the whole run, so bundle imports
//! cannot interleave with the diff.

use parking_lot::{Mutex, RwLock};
use std::collections::{BTreeMap, HashSet};
use std::sync::Arc;
use tokio::runtime::Handle;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use crate::api::wire::{FetchRequest, FetchResponse, ManifestResponse};
use crate::api::ApiClient;
use crate::error::{ErrorKind, Result, ScanError};
use crate::shared::{CancelPolicy, Notifier, Observers, SubscriptionId, Task};
use crate::storage::signature::SignatureRecord;
use crate::storage::SignatureStore;

const MANIFEST_PATH: &str = "/v1/signatures/manifest";
const FETCH_PATH: &str = "/v1/signatures/fetch";

/// Observable synchronization state
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct SyncState {
    pub is_syncing: bool,
    /// Percentage of the current or last sync, -1 until the first step is known
    pub progress: i32,
    /// Outcome of the last finished sync
    pub last_error: Option<ErrorKind>,
}

impl Default for SyncState {
    fn default() -> Self {
        Self {
            is_syncing: false,
            progress: -1,
            last_error: None,
        }
    }
}

/// What a finished sync changed
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct SyncReport {
    pub added: usize,
    pub updated: usize,
    pub removed: usize,
    /// Listed in the manifest but not served; retried by the next sync
    pub skipped: usize,
}

/// Handle to a running sync; cancellation completes it with `Abort`
pub type SyncOperation = Task<SyncReport>;

/// Called once with the outcome of the sync it was registered on
pub type CompleteListener = Box<dyn FnOnce(Result<SyncReport>) + Send + 'static>;
/// Called with every published progress percentage
pub type ProgressListener = Arc<dyn Fn(i32) + Send + Sync + 'static>;

/// The sync in flight and everyone waiting on it
struct ActiveSync {
    operation: SyncOperation,
    on_complete: Vec<CompleteListener>,
    on_progress: Vec<ProgressListener>,
}

struct SyncShared {
    state: RwLock<SyncState>,
    observers: Observers<SyncState>,
    active: Mutex<Option<ActiveSync>>,
    notifier: Notifier,
    runtime: Handle,
    batch_size: usize,
}

/// Background reconciliation of a store, one sync at a time
#[derive(Clone)]
pub struct SyncEngine {
    shared: Arc<SyncShared>,
}

impl SyncEngine {
    pub fn new(runtime: Handle, notifier: Notifier, batch_size: usize) -> Self {
        Self {
            shared: Arc::new(SyncShared {
                state: RwLock::new(SyncState::default()),
                observers: Observers::new(notifier.clone()),
                active: Mutex::new(None),
                notifier,
                runtime,
                batch_size: batch_size.max(1),
            }),
        }
    }

    pub fn state(&self) -> SyncState {
        *self.shared.state.read()
    }

    pub fn is_syncing(&self) -> bool {
        self.shared.state.read().is_syncing
    }

    /// Watch state transitions; every published state is a full snapshot
    pub fn subscribe<F>(&self, callback: F) -> SubscriptionId
    where
        F: Fn(&SyncState) + Send + Sync + 'static,
    {
        self.shared.observers.subscribe(callback)
    }

    pub fn unsubscribe(&self, id: SubscriptionId) -> bool {
        self.shared.observers.unsubscribe(id)
    }

    /// Start a sync, or join the one already running
    pub fn start(&self, store: Arc<SignatureStore>, client: ApiClient) -> SyncOperation {
        self.start_with(store, client, None, None)
    }

    /// Start or join a sync, adding listeners for its completion and progress
    ///
    /// Listeners run on the notification context. A listener joining a sync
    /// already in progress only sees the remaining progress updates.
    pub fn start_with(
        &self,
        store: Arc<SignatureStore>,
        client: ApiClient,
        on_complete: Option<CompleteListener>,
        on_progress: Option<ProgressListener>,
    ) -> SyncOperation {
        let shared = &self.shared;
        let mut active = shared.active.lock();

        if let Some(run) = active.as_mut() {
            debug!("Sync already running, joining {}", run.operation.id());
            run.on_complete.extend(on_complete);
            run.on_progress.extend(on_progress);
            return run.operation.clone();
        }

        if let Err(e) = store.ensure_open() {
            if let Some(listener) = on_complete {
                let outcome = Err(e.clone());
                shared.notifier.post(move || listener(outcome));
            }
            return Task::settled(shared.notifier.clone(), CancelPolicy::Report, Err(e));
        }

        let operation = Task::new(shared.notifier.clone(), CancelPolicy::Report);
        *active = Some(ActiveSync {
            operation: operation.clone(),
            on_complete: on_complete.into_iter().collect(),
            on_progress: on_progress.into_iter().collect(),
        });
        {
            let mut state = shared.state.write();
            *state = SyncState {
                is_syncing: true,
                progress: -1,
                last_error: None,
            };
            shared.observers.publish(*state);
        }
        drop(active);

        info!("Sync {} started", operation.id());
        let engine = self.clone();
        let task = operation.clone();
        shared.runtime.spawn(async move {
            let token = task.token();
            let outcome = engine.run(&store, &client, &token).await;
            engine.finish(&task, outcome);
        });

        operation
    }

    /// Request cancellation of the running sync; no-op when idle
    pub fn cancel(&self) -> bool {
        let active = self.shared.active.lock();
        match active.as_ref() {
            Some(run) => {
                info!("Cancelling sync {}", run.operation.id());
                run.operation.cancel()
            }
            None => false,
        }
    }

    /// Publish a progress value if it moves forward
    fn report_progress(&self, progress: i32) {
        let shared = &self.shared;
        let active = shared.active.lock();
        let mut state = shared.state.write();
        if progress <= state.progress {
            return;
        }
        state.progress = progress;
        shared.observers.publish(*state);

        if let Some(run) = active.as_ref() {
            for listener in &run.on_progress {
                let listener = listener.clone();
                shared.notifier.post(move || listener(progress));
            }
        }
        debug!("Sync progress {}%", progress);
    }

    /// Publish the terminal state, then notify listeners and the task
    fn finish(&self, operation: &SyncOperation, outcome: Result<SyncReport>) {
        let shared = &self.shared;
        let mut active = shared.active.lock();
        let run = active.take();
        {
            let mut state = shared.state.write();
            state.is_syncing = false;
            match &outcome {
                Ok(_) => {
                    state.progress = 100;
                    state.last_error = None;
                }
                Err(e) => state.last_error = Some(e.kind()),
            }
            shared.observers.publish(*state);
        }

        match &outcome {
            Ok(report) => info!(
                "Sync {} finished: {} added, {} updated, {} removed, {} skipped",
                operation.id(),
                report.added,
                report.updated,
                report.removed,
                report.skipped
            ),
            Err(e) if e.is_abort() => info!("Sync {} cancelled", operation.id()),
            Err(e) => warn!("Sync {} failed: {}", operation.id(), e),
        }

        if let Some(run) = run {
            for listener in run.on_complete {
                let outcome = outcome.clone();
                shared.notifier.post(move || listener(outcome));
            }
        }
        operation.complete(outcome);
    }

    async fn run(&self, store: &SignatureStore, client: &ApiClient, token: &CancellationToken) -> Result<SyncReport> {
        let _maintenance = store.maintenance().await;
        checkpoint(token)?;
        let manifest: ManifestResponse = client.get_json(MANIFEST_PATH, token).await?;
        checkpoint(token)?;

        let key = client.credential().api_key();
        if let Some(previous) = store.account_key()? {
            if previous != key {
                info!("Store was populated for another account, clearing it");
                store.clear()?;
            }
        }
        store.set_account_key(key)?;

        let local = store.manifest()?;
        let remote: BTreeMap<String, u32> = manifest
            .entries
            .into_iter()
            .map(|entry| (entry.id, entry.revision))
            .collect();

        let mut removals: Vec<String> = local.keys().filter(|id| !remote.contains_key(*id)).cloned().collect();
        removals.sort();
        let pending: Vec<String> = remote
            .iter()
            .filter(|(id, revision)| local.get(*id) != Some(*revision))
            .map(|(id, _)| id.clone())
            .collect();

        let batches: Vec<&[String]> = pending.chunks(self.shared.batch_size).collect();
        let total = 1 + batches.len();
        let mut done = 0;
        debug!(
            "Sync plan: {} remote, {} local, {} to remove, {} to fetch in {} batches",
            remote.len(),
            local.len(),
            removals.len(),
            pending.len(),
            batches.len()
        );
        self.report_progress(0);

        let mut report = SyncReport::default();
        if !removals.is_empty() {
            store.apply(Vec::new(), &removals)?;
            report.removed = removals.len();
        }
        done += 1;
        self.report_progress(percent(done, total));

        for batch in batches {
            checkpoint(token)?;
            let request = FetchRequest { ids: batch.to_vec() };
            let response: FetchResponse = match client.post_json(FETCH_PATH, &request, token).await {
                Ok(response) => response,
                Err(e) if e.kind() == ErrorKind::NoRec => {
                    debug!("Batch of {} signatures is gone, skipping", batch.len());
                    report.skipped += batch.len();
                    done += 1;
                    self.report_progress(percent(done, total));
                    continue;
                }
                Err(e) => return Err(e),
            };
            checkpoint(token)?;

            let requested: HashSet<&str> = batch.iter().map(String::as_str).collect();
            let mut received: HashSet<String> = HashSet::new();
            let mut records = Vec::with_capacity(response.signatures.len());
            for payload in response.signatures {
                if !requested.contains(payload.id.as_str()) || received.contains(&payload.id) {
                    continue;
                }
                let record = SignatureRecord::try_from(payload).map_err(|e| {
                    ScanError::new(ErrorKind::NetworkFail, format!("malformed signature: {}", e.detail()))
                })?;
                if local.contains_key(&record.id) {
                    report.updated += 1;
                } else {
                    report.added += 1;
                }
                received.insert(record.id.clone());
                records.push(record);
            }
            report.skipped += batch.len() - received.len();

            store.apply(records, &[])?;
            done += 1;
            self.report_progress(percent(done, total));
        }

        Ok(report)
    }
}

fn checkpoint(token: &CancellationToken) -> Result<()> {
    if token.is_cancelled() {
        return Err(ScanError::aborted());
    }
    Ok(())
}

fn percent(done: usize, total: usize) -> i32 {
    ((done * 100) / total.max(1)) as i32
}
