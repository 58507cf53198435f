//! SQLite database for the signature store

use rusqlite::{params, Connection, OpenFlags, OptionalExtension};
#[cfg(test)]
use std::collections::HashMap;
use std::path::Path;
use std::time::Duration;
use tracing::debug;

use crate::error::{ErrorKind, Result, ScanError};
use crate::storage::signature::{Descriptor, SignatureRecord};

const SCHEMA_VERSION: i64 = 1;

/// Database connection wrapper
pub struct Database {
    conn: Connection,
}

impl Database {
    /// Open or create the database at path
    pub fn open(path: &Path) -> Result<Self> {
        if let Some(parent) = path.parent() {
            if !parent.as_os_str().is_empty() && !parent.is_dir() {
                return Err(ScanError::new(
                    ErrorKind::NoFile,
                    format!("directory {:?} does not exist", parent),
                ));
            }
        }

        let conn = Connection::open_with_flags(
            path,
            OpenFlags::SQLITE_OPEN_READ_WRITE | OpenFlags::SQLITE_OPEN_CREATE | OpenFlags::SQLITE_OPEN_NO_MUTEX,
        )?;
        conn.busy_timeout(Duration::from_millis(500))?;

        let db = Self { conn };
        db.init_schema()?;
        Ok(db)
    }

    /// Open a throwaway in-memory database
    #[cfg(test)]
    pub fn open_in_memory() -> Result<Self> {
        let db = Self {
            conn: Connection::open_in_memory()?,
        };
        db.init_schema()?;
        Ok(db)
    }

    /// Initialize database schema, rejecting files written by a newer version
    fn init_schema(&self) -> Result<()> {
        self.conn.execute_batch(
            "CREATE TABLE IF NOT EXISTS meta (
                key     TEXT PRIMARY KEY,
                value   TEXT NOT NULL
            );
            CREATE TABLE IF NOT EXISTS signatures (
                id                  TEXT PRIMARY KEY,
                revision            INTEGER NOT NULL,
                width               INTEGER NOT NULL,
                height              INTEGER NOT NULL,
                descriptor_width    INTEGER NOT NULL,
                descriptor_height   INTEGER NOT NULL,
                descriptor          BLOB NOT NULL
            );",
        )?;

        let existing: Option<String> = self
            .conn
            .query_row("SELECT value FROM meta WHERE key = 'schema_version'", [], |row| row.get(0))
            .optional()?;

        match existing {
            Some(version) => {
                let version: i64 = version.parse().map_err(|_| {
                    ScanError::new(ErrorKind::Corrupt, format!("unreadable schema version {:?}", version))
                })?;
                if version != SCHEMA_VERSION {
                    return Err(ScanError::new(
                        ErrorKind::Corrupt,
                        format!("unsupported schema version {}", version),
                    ));
                }
            }
            None => {
                self.conn.execute(
                    "INSERT INTO meta (key, value) VALUES ('schema_version', ?1)",
                    [SCHEMA_VERSION.to_string()],
                )?;
            }
        }
        Ok(())
    }

    /// API key the stored signatures were synchronized for
    pub fn account_key(&self) -> Result<Option<String>> {
        let key = self
            .conn
            .query_row("SELECT value FROM meta WHERE key = 'account_key'", [], |row| row.get(0))
            .optional()?;
        Ok(key)
    }

    pub fn set_account_key(&self, key: &str) -> Result<()> {
        self.conn.execute(
            "INSERT INTO meta (key, value) VALUES ('account_key', ?1)
             ON CONFLICT(key) DO UPDATE SET value = excluded.value",
            [key],
        )?;
        Ok(())
    }

    #[cfg(test)]
    pub fn count(&self) -> Result<usize> {
        let count: i64 = self
            .conn
            .query_row("SELECT COUNT(*) FROM signatures", [], |row| row.get(0))?;
        Ok(count as usize)
    }

    #[cfg(test)]
    pub fn manifest(&self) -> Result<HashMap<String, u32>> {
        let mut stmt = self.conn.prepare("SELECT id, revision FROM signatures")?;
        let rows = stmt.query_map([], |row| Ok((row.get::<_, String>(0)?, row.get::<_, u32>(1)?)))?;
        let mut manifest = HashMap::new();
        for row in rows {
            let (id, revision) = row?;
            manifest.insert(id, revision);
        }
        Ok(manifest)
    }

    /// Load every signature, ordered by identifier
    pub fn load_all(&self) -> Result<Vec<SignatureRecord>> {
        let mut stmt = self.conn.prepare(
            "SELECT id, revision, width, height, descriptor_width, descriptor_height, descriptor
             FROM signatures ORDER BY id",
        )?;
        let rows = stmt.query_map([], |row| {
            Ok((
                row.get::<_, String>(0)?,
                row.get::<_, u32>(1)?,
                row.get::<_, u32>(2)?,
                row.get::<_, u32>(3)?,
                row.get::<_, u32>(4)?,
                row.get::<_, u32>(5)?,
                row.get::<_, Vec<u8>>(6)?,
            ))
        })?;

        let mut records = Vec::new();
        for row in rows {
            let (id, revision, width, height, dw, dh, pixels) = row?;
            let descriptor = Descriptor::from_raw(dw, dh, pixels).map_err(|e| {
                ScanError::new(ErrorKind::Corrupt, format!("signature {}: {}", id, e.detail()))
            })?;
            records.push(SignatureRecord {
                id,
                revision,
                width,
                height,
                descriptor,
            });
        }
        Ok(records)
    }

    /// Insert or replace `upserts` and delete `removals` in one transaction
    pub fn apply(&mut self, upserts: &[SignatureRecord], removals: &[String]) -> Result<()> {
        self.apply_claiming(upserts, removals, None)
    }

    /// Same as [`Database::apply`], also recording `account_key` in the same
    /// transaction unless one is already stored
    pub fn apply_claiming(
        &mut self,
        upserts: &[SignatureRecord],
        removals: &[String],
        account_key: Option<&str>,
    ) -> Result<()> {
        let tx = self.conn.transaction()?;
        {
            if let Some(key) = account_key {
                tx.execute(
                    "INSERT OR IGNORE INTO meta (key, value) VALUES ('account_key', ?1)",
                    [key],
                )?;
            }

            let mut delete = tx.prepare("DELETE FROM signatures WHERE id = ?1")?;
            for id in removals {
                delete.execute([id])?;
            }

            let mut insert = tx.prepare(
                "INSERT OR REPLACE INTO signatures
                 (id, revision, width, height, descriptor_width, descriptor_height, descriptor)
                 VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7)",
            )?;
            for record in upserts {
                insert.execute(params![
                    record.id,
                    record.revision,
                    record.width,
                    record.height,
                    record.descriptor.width(),
                    record.descriptor.height(),
                    record.descriptor.pixels(),
                ])?;
            }
        }
        tx.commit()?;
        debug!("Applied {} upserts and {} removals", upserts.len(), removals.len());
        Ok(())
    }

    /// Remove every signature and forget the account key
    pub fn clear(&mut self) -> Result<()> {
        let tx = self.conn.transaction()?;
        tx.execute("DELETE FROM signatures", [])?;
        tx.execute("DELETE FROM meta WHERE key = 'account_key'", [])?;
        tx.commit()?;
        Ok(())
    }
}
