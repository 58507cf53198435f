//! Server-side image search
//!
//! Each call is a one-shot [`SearchOperation`] running on the worker pool.
//! Cancelling an operation before its response lands suppresses its
//! completion entirely.

use parking_lot::Mutex;
use std::collections::HashMap;
use std::sync::Arc;
use tokio::runtime::Handle;
use tracing::{debug, info};
use uuid::Uuid;

use super::wire::{SearchRequest, SearchResponse};
use super::ApiClient;
use crate::error::{ErrorKind, Result, ScanError};
use crate::result::ScanResult;
use crate::shared::{CancelPolicy, Notifier, Task};
use crate::vision::QueryImage;

const SEARCH_PATH: &str = "/v1/search";

/// Pending server search; settles with the match, `None`, or an error
pub type SearchOperation = Task<Option<ScanResult>>;

/// Issues server searches and tracks the ones still in flight
#[derive(Clone)]
pub struct ApiSearchClient {
    runtime: Handle,
    notifier: Notifier,
    outstanding: Arc<Mutex<HashMap<Uuid, SearchOperation>>>,
}

impl ApiSearchClient {
    pub fn new(runtime: Handle, notifier: Notifier) -> Self {
        Self {
            runtime,
            notifier,
            outstanding: Arc::new(Mutex::new(HashMap::new())),
        }
    }

    /// Start a search for `query`; never blocks
    pub fn search(&self, client: &ApiClient, query: &QueryImage) -> SearchOperation {
        let operation = Task::new(self.notifier.clone(), CancelPolicy::Silence);
        let image = match query.to_png_base64() {
            Ok(image) => image,
            Err(e) => {
                operation.complete(Err(e));
                return operation;
            }
        };

        self.outstanding.lock().insert(operation.id(), operation.clone());
        debug!("Search {} started ({}x{})", operation.id(), query.width(), query.height());

        let client = client.clone();
        let task = operation.clone();
        let outstanding = self.outstanding.clone();
        self.runtime.spawn(async move {
            let token = task.token();
            let outcome = client
                .post_json::<_, SearchResponse>(SEARCH_PATH, &SearchRequest { image }, &token)
                .await
                .and_then(interpret);

            outstanding.lock().remove(&task.id());
            match &outcome {
                Ok(Some(result)) => info!("Search {} matched {:?}", task.id(), result.text()),
                Ok(None) => debug!("Search {} found nothing", task.id()),
                Err(e) => debug!("Search {} failed: {}", task.id(), e),
            }
            if !task.complete(outcome) {
                debug!("Search {} was cancelled before its response", task.id());
            }
        });

        operation
    }

    /// Cancel one operation; returns whether cancellation won the race
    pub fn cancel(&self, operation: &SearchOperation) -> bool {
        self.outstanding.lock().remove(&operation.id());
        operation.cancel()
    }

    /// Cancel every outstanding operation, returning how many were cancelled
    pub fn cancel_all(&self) -> usize {
        let operations: Vec<SearchOperation> = self.outstanding.lock().drain().map(|(_, op)| op).collect();
        let cancelled = operations.iter().filter(|op| op.cancel()).count();
        if cancelled > 0 {
            info!("Cancelled {} server searches", cancelled);
        }
        cancelled
    }

    /// Number of searches still waiting for a response
    pub fn outstanding(&self) -> usize {
        self.outstanding.lock().len()
    }
}

fn interpret(response: SearchResponse) -> Result<Option<ScanResult>> {
    match (response.found, response.id) {
        (true, Some(id)) if !id.is_empty() => Ok(Some(ScanResult::remote(&id))),
        (true, _) => Err(ScanError::new(
            ErrorKind::NetworkFail,
            "search response reports a match without an identifier",
        )),
        (false, _) => Ok(None),
    }
}
