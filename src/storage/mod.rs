//! Signature Store
//!
//! Persistent local database of reference signatures plus the in-memory index
//! the matcher reads. Readers share the open state; `close` takes it
//! exclusively, so it waits for in-flight matches. Mutations are serialized by
//! a writer gate and update the database and the index together. A sync holds
//! the maintenance lock from its first request to its last write, and bundle
//! imports refuse to run while it is held.

pub mod bundle;
pub mod database;
pub mod signature;

use anyhow::Result as AnyResult;
use parking_lot::{Mutex, RwLock};
use std::collections::{BTreeMap, HashMap};
use std::path::{Path, PathBuf};
use std::sync::Arc;
use tracing::{debug, info};

use crate::api::Credential;
use crate::error::{ErrorKind, Result, ScanError};
use database::Database;
use signature::SignatureRecord;

/// Immutable view of the stored references, ordered by identifier
pub type Snapshot = Vec<Arc<SignatureRecord>>;

struct OpenStore {
    path: PathBuf,
    credential: Credential,
    db: Mutex<Database>,
    index: RwLock<BTreeMap<String, Arc<SignatureRecord>>>,
}

/// Local signature database
#[derive(Default)]
pub struct SignatureStore {
    state: RwLock<Option<OpenStore>>,
    writer: Mutex<()>,
    maintenance: tokio::sync::Mutex<()>,
}

impl SignatureStore {
    pub fn new() -> Self {
        Self::default()
    }

    /// Open the store file at `path` on behalf of `credential`
    pub fn open(&self, path: &Path, credential: Credential) -> Result<()> {
        let mut state = self.state.write();
        if state.is_some() {
            return Err(ScanError::misuse("the signature store is already open"));
        }

        let db = Database::open(path)?;
        let index: BTreeMap<String, Arc<SignatureRecord>> = db
            .load_all()?
            .into_iter()
            .map(|record| (record.id.clone(), Arc::new(record)))
            .collect();

        info!("Opened signature store {:?} with {} signatures", path, index.len());
        *state = Some(OpenStore {
            path: path.to_path_buf(),
            credential,
            db: Mutex::new(db),
            index: RwLock::new(index),
        });
        Ok(())
    }

    /// Release the database and the index
    pub fn close(&self) -> Result<()> {
        let mut state = self.state.write();
        match state.take() {
            Some(open) => {
                info!("Closed signature store {:?}", open.path);
                Ok(())
            }
            None => Err(ScanError::not_open()),
        }
    }

    pub fn is_open(&self) -> bool {
        self.state.read().is_some()
    }

    pub fn path(&self) -> Option<PathBuf> {
        self.state.read().as_ref().map(|open| open.path.clone())
    }

    pub(crate) fn ensure_open(&self) -> Result<()> {
        self.with_open(|_| Ok(()))
    }

    pub fn credential(&self) -> Result<Credential> {
        self.with_open(|open| Ok(open.credential.clone()))
    }

    fn with_open<R>(&self, f: impl FnOnce(&OpenStore) -> Result<R>) -> Result<R> {
        let state = self.state.read();
        match state.as_ref() {
            Some(open) => f(open),
            None => Err(ScanError::not_open()),
        }
    }

    pub fn count(&self) -> Result<usize> {
        self.with_open(|open| Ok(open.index.read().len()))
    }

    /// Every stored identifier, sorted
    pub fn list_identifiers(&self) -> Result<Vec<String>> {
        self.with_open(|open| Ok(open.index.read().keys().cloned().collect()))
    }

    /// Run `f` over the current references while the store is held open
    pub(crate) fn with_snapshot<R>(&self, f: impl FnOnce(&Snapshot) -> R) -> Result<R> {
        self.with_open(|open| {
            let snapshot: Snapshot = open.index.read().values().cloned().collect();
            Ok(f(&snapshot))
        })
    }

    /// Identifier to revision of every stored signature
    pub(crate) fn manifest(&self) -> Result<HashMap<String, u32>> {
        self.with_open(|open| {
            Ok(open
                .index
                .read()
                .iter()
                .map(|(id, record)| (id.clone(), record.revision))
                .collect())
        })
    }

    pub(crate) fn account_key(&self) -> Result<Option<String>> {
        self.with_open(|open| open.db.lock().account_key())
    }

    pub(crate) fn set_account_key(&self, key: &str) -> Result<()> {
        let _gate = self.writer.lock();
        self.with_open(|open| open.db.lock().set_account_key(key))
    }

    /// Take the store for a whole sync, waiting for a running import
    pub(crate) async fn maintenance(&self) -> tokio::sync::MutexGuard<'_, ()> {
        self.maintenance.lock().await
    }

    /// Apply one batch of changes atomically to the database, then the index
    pub(crate) fn apply(&self, upserts: Vec<SignatureRecord>, removals: &[String]) -> Result<()> {
        self.write(upserts, removals, None)
    }

    fn write(&self, upserts: Vec<SignatureRecord>, removals: &[String], claim: Option<&str>) -> Result<()> {
        let _gate = self.writer.lock();
        self.with_open(|open| {
            open.db.lock().apply_claiming(&upserts, removals, claim)?;

            let mut index = open.index.write();
            for id in removals {
                index.remove(id);
            }
            for record in upserts {
                index.insert(record.id.clone(), Arc::new(record));
            }
            debug!("Index now holds {} signatures", index.len());
            Ok(())
        })
    }

    /// Drop every signature, e.g. when the account changed
    pub(crate) fn clear(&self) -> Result<()> {
        let _gate = self.writer.lock();
        self.with_open(|open| {
            open.db.lock().clear()?;
            open.index.write().clear();
            Ok(())
        })
    }

    /// Import a prebuilt bundle; nothing changes unless the whole bundle is valid
    ///
    /// Fails with `Misuse` while a sync is running.
    pub fn import_bundle(&self, location: &Path) -> Result<usize> {
        let credential = self.credential()?;
        let _maintenance = self
            .maintenance
            .try_lock()
            .map_err(|_| ScanError::misuse("a sync is updating the signature store"))?;
        let bundle = bundle::read_bundle(location)?;

        if let Some(bundle_key) = &bundle.api_key {
            if bundle_key != credential.api_key() {
                return Err(ScanError::new(
                    ErrorKind::CredMismatch,
                    "the bundle was built for another API key",
                ));
            }
        }

        let count = bundle.records.len();
        self.write(bundle.records, &[], bundle.api_key.as_deref())?;
        info!("Imported {} signatures from {:?}", count, location);
        Ok(count)
    }
}

fn project_dirs() -> Option<directories::ProjectDirs> {
    directories::ProjectDirs::from("com", "scanner-toolkit", "ScannerToolkit")
}

/// Path of `file_name` inside the platform cache directory, which is created
pub fn cache_path_for(file_name: &str) -> Result<PathBuf> {
    let dirs = project_dirs()
        .ok_or_else(|| ScanError::new(ErrorKind::NoFile, "could not determine the cache directory"))?;
    let cache_dir = dirs.cache_dir().to_path_buf();
    std::fs::create_dir_all(&cache_dir)?;
    Ok(cache_dir.join(file_name))
}

/// Get the configuration directory
pub fn get_config_dir() -> AnyResult<PathBuf> {
    let dirs = project_dirs().ok_or_else(|| anyhow::anyhow!("Could not determine config directory"))?;

    let config_dir = dirs.config_dir().to_path_buf();
    std::fs::create_dir_all(&config_dir)?;

    Ok(config_dir)
}
