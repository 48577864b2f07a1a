//! RocksDB storage backend for the Tollgate node.

use rocksdb::{ColumnFamilyDescriptor, Direction, IteratorMode, Options, DB};
use serde::de::DeserializeOwned;
use serde::Serialize;
use std::path::Path;
use std::sync::{Mutex, PoisonError};

use tollgate_core::storage::{HistoryBackend, InvoiceStore, PromiseStore};
use tollgate_core::types::{AgreementId, ChannelKey, Invoice, Promise, SettlementHistoryEntry};
use tollgate_core::CoreError;

const CF_INVOICES: &str = "invoices";
const CF_PROMISES: &str = "promises";
const CF_HISTORY: &str = "settlement_history";
const CF_STATE: &str = "state";

/// RocksDB-backed store for invoices, promises, settlement history and
/// node state. Values are JSON.
pub struct Storage {
    db: DB,
    /// Serializes read-compare-write on the promises family.
    promise_lock: Mutex<()>,
}

fn db_err(e: rocksdb::Error) -> CoreError {
    CoreError::Storage(e.to_string())
}

impl Storage {
    /// Open or create a RocksDB database at the given path with column families.
    pub fn open(path: &Path) -> Result<Self, CoreError> {
        std::fs::create_dir_all(path).map_err(|e| CoreError::Storage(e.to_string()))?;

        let mut opts = Options::default();
        opts.create_if_missing(true);
        opts.create_missing_column_families(true);

        let cf_descriptors = [CF_INVOICES, CF_PROMISES, CF_HISTORY, CF_STATE]
            .into_iter()
            .map(|name| ColumnFamilyDescriptor::new(name, Options::default()));

        let db = DB::open_cf_descriptors(&opts, path, cf_descriptors).map_err(db_err)?;

        Ok(Self {
            db,
            promise_lock: Mutex::new(()),
        })
    }

    fn put<T: Serialize>(&self, cf_name: &str, key: &[u8], value: &T) -> Result<(), CoreError> {
        let cf = self
            .db
            .cf_handle(cf_name)
            .ok_or_else(|| CoreError::Storage(format!("column family '{}' not found", cf_name)))?;
        let bytes = serde_json::to_vec(value)?;
        self.db.put_cf(&cf, key, bytes).map_err(db_err)
    }

    fn get<T: DeserializeOwned>(&self, cf_name: &str, key: &[u8]) -> Result<Option<T>, CoreError> {
        let cf = self
            .db
            .cf_handle(cf_name)
            .ok_or_else(|| CoreError::Storage(format!("column family '{}' not found", cf_name)))?;
        match self.db.get_cf(&cf, key).map_err(db_err)? {
            Some(bytes) => Ok(Some(serde_json::from_slice(&bytes)?)),
            None => Ok(None),
        }
    }

    fn delete(&self, cf_name: &str, key: &[u8]) -> Result<(), CoreError> {
        let cf = self
            .db
            .cf_handle(cf_name)
            .ok_or_else(|| CoreError::Storage(format!("column family '{}' not found", cf_name)))?;
        self.db.delete_cf(&cf, key).map_err(db_err)
    }

    /// Store a piece of node state.
    pub fn put_state<T: Serialize>(&self, key: &str, value: &T) -> Result<(), CoreError> {
        self.put(CF_STATE, key.as_bytes(), value)
    }

    pub fn get_state<T: DeserializeOwned>(&self, key: &str) -> Result<Option<T>, CoreError> {
        self.get(CF_STATE, key.as_bytes())
    }
}

fn promise_prefix(key: &ChannelKey) -> String {
    format!("{}/", key.storage_key())
}

/// Promises of one channel sort together, ordered by agreement.
fn promise_key(key: &ChannelKey, agreement_id: AgreementId) -> String {
    format!("{}{:020}", promise_prefix(key), agreement_id)
}

impl PromiseStore for Storage {
    fn store_promise(
        &self,
        key: &ChannelKey,
        agreement_id: AgreementId,
        promise: &Promise,
    ) -> Result<(), CoreError> {
        let _guard = self.promise_lock.lock().unwrap_or_else(PoisonError::into_inner);
        if let Some(existing) = self.latest_promise(key, agreement_id)? {
            if existing.amount > promise.amount {
                tracing::debug!(
                    channel = %key,
                    agreement = agreement_id,
                    stored = %existing.amount,
                    offered = %promise.amount,
                    "kept larger stored promise"
                );
                return Ok(());
            }
        }
        self.put(
            CF_PROMISES,
            promise_key(key, agreement_id).as_bytes(),
            &(agreement_id, promise),
        )
    }

    fn latest_promise(
        &self,
        key: &ChannelKey,
        agreement_id: AgreementId,
    ) -> Result<Option<Promise>, CoreError> {
        let stored: Option<(AgreementId, Promise)> =
            self.get(CF_PROMISES, promise_key(key, agreement_id).as_bytes())?;
        Ok(stored.map(|(_, promise)| promise))
    }

    fn channel_promises(&self, key: &ChannelKey) -> Result<Vec<(AgreementId, Promise)>, CoreError> {
        let cf = self
            .db
            .cf_handle(CF_PROMISES)
            .ok_or_else(|| CoreError::Storage(format!("column family '{}' not found", CF_PROMISES)))?;
        let prefix = promise_prefix(key);
        let mut promises = Vec::new();
        for item in self
            .db
            .iterator_cf(&cf, IteratorMode::From(prefix.as_bytes(), Direction::Forward))
        {
            let (k, value) = item.map_err(db_err)?;
            if !k.starts_with(prefix.as_bytes()) {
                break;
            }
            promises.push(serde_json::from_slice(&value)?);
        }
        Ok(promises)
    }
}

impl InvoiceStore for Storage {
    fn store_invoice(&self, session_id: &str, invoice: &Invoice) -> Result<(), CoreError> {
        self.put(CF_INVOICES, session_id.as_bytes(), invoice)
    }

    fn get_invoice(&self, session_id: &str) -> Result<Option<Invoice>, CoreError> {
        self.get(CF_INVOICES, session_id.as_bytes())
    }

    fn remove_invoice(&self, session_id: &str) -> Result<(), CoreError> {
        self.delete(CF_INVOICES, session_id.as_bytes())
    }
}

impl HistoryBackend for Storage {
    fn append(&self, entry: &SettlementHistoryEntry) -> Result<(), CoreError> {
        self.put(CF_HISTORY, entry.tx_hash.as_bytes(), entry)
    }

    fn load_all(&self) -> Result<Vec<SettlementHistoryEntry>, CoreError> {
        let cf = self
            .db
            .cf_handle(CF_HISTORY)
            .ok_or_else(|| CoreError::Storage(format!("column family '{}' not found", CF_HISTORY)))?;
        self.db
            .iterator_cf(&cf, IteratorMode::Start)
            .map(|item| {
                let (_, value) = item.map_err(db_err)?;
                Ok(serde_json::from_slice(&value)?)
            })
            .collect()
    }
}
