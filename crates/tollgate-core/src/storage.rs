//! Persistence contracts for invoices in flight, accepted promises, and
//! settlement history, plus an in-memory implementation.

use dashmap::DashMap;

use crate::error::CoreError;
use crate::types::{AgreementId, Amount, ChannelKey, Invoice, Promise, SettlementHistoryEntry, TxHash};

/// Latest accepted promise per agreement on each provider channel.
///
/// Every agreement (one paid session) carries its own cumulative amount;
/// the channel's promised total is the sum over its agreements.
pub trait PromiseStore: Send + Sync {
    /// Persist `promise` as the latest of `agreement_id` on `key`.
    ///
    /// Implementations must never replace a stored promise with one of a
    /// smaller amount.
    fn store_promise(
        &self,
        key: &ChannelKey,
        agreement_id: AgreementId,
        promise: &Promise,
    ) -> Result<(), CoreError>;

    fn latest_promise(
        &self,
        key: &ChannelKey,
        agreement_id: AgreementId,
    ) -> Result<Option<Promise>, CoreError>;

    /// Latest promise of every agreement on `key`.
    fn channel_promises(&self, key: &ChannelKey) -> Result<Vec<(AgreementId, Promise)>, CoreError>;

    /// Sum of the latest promises of every agreement on `key`.
    fn promised_total(&self, key: &ChannelKey) -> Result<Amount, CoreError> {
        Ok(self
            .channel_promises(key)?
            .iter()
            .fold(0, |total: Amount, (_, p)| total.saturating_add(p.amount)))
    }
}

/// Outstanding invoice per session.
pub trait InvoiceStore: Send + Sync {
    fn store_invoice(&self, session_id: &str, invoice: &Invoice) -> Result<(), CoreError>;

    fn get_invoice(&self, session_id: &str) -> Result<Option<Invoice>, CoreError>;

    fn remove_invoice(&self, session_id: &str) -> Result<(), CoreError>;
}

/// Durable append-only backing for the settlement history.
pub trait HistoryBackend: Send + Sync {
    fn append(&self, entry: &SettlementHistoryEntry) -> Result<(), CoreError>;

    fn load_all(&self) -> Result<Vec<SettlementHistoryEntry>, CoreError>;
}

/// In-memory store for tests and ephemeral nodes.
#[derive(Default)]
pub struct MemoryStore {
    promises: DashMap<(ChannelKey, AgreementId), Promise>,
    invoices: DashMap<String, Invoice>,
    history: DashMap<TxHash, SettlementHistoryEntry>,
}

impl MemoryStore {
    pub fn new() -> Self {
        Self::default()
    }
}

impl PromiseStore for MemoryStore {
    fn store_promise(
        &self,
        key: &ChannelKey,
        agreement_id: AgreementId,
        promise: &Promise,
    ) -> Result<(), CoreError> {
        self.promises
            .entry((*key, agreement_id))
            .and_modify(|existing| {
                if promise.amount >= existing.amount {
                    *existing = promise.clone();
                }
            })
            .or_insert_with(|| promise.clone());
        Ok(())
    }

    fn latest_promise(
        &self,
        key: &ChannelKey,
        agreement_id: AgreementId,
    ) -> Result<Option<Promise>, CoreError> {
        Ok(self.promises.get(&(*key, agreement_id)).map(|p| p.clone()))
    }

    fn channel_promises(&self, key: &ChannelKey) -> Result<Vec<(AgreementId, Promise)>, CoreError> {
        let mut promises: Vec<_> = self
            .promises
            .iter()
            .filter(|e| e.key().0 == *key)
            .map(|e| (e.key().1, e.value().clone()))
            .collect();
        promises.sort_by_key(|(agreement_id, _)| *agreement_id);
        Ok(promises)
    }
}

impl InvoiceStore for MemoryStore {
    fn store_invoice(&self, session_id: &str, invoice: &Invoice) -> Result<(), CoreError> {
        self.invoices.insert(session_id.to_string(), invoice.clone());
        Ok(())
    }

    fn get_invoice(&self, session_id: &str) -> Result<Option<Invoice>, CoreError> {
        Ok(self.invoices.get(session_id).map(|i| i.clone()))
    }

    fn remove_invoice(&self, session_id: &str) -> Result<(), CoreError> {
        self.invoices.remove(session_id);
        Ok(())
    }
}

impl HistoryBackend for MemoryStore {
    fn append(&self, entry: &SettlementHistoryEntry) -> Result<(), CoreError> {
        self.history.entry(entry.tx_hash).or_insert_with(|| entry.clone());
        Ok(())
    }

    fn load_all(&self) -> Result<Vec<SettlementHistoryEntry>, CoreError> {
        Ok(self.history.iter().map(|e| e.value().clone()).collect())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::types::{Address, Identity, H256};

    fn key() -> ChannelKey {
        ChannelKey::new(1, Identity::from_address(Address([1; 20])), Address([2; 20]))
    }

    fn promise(amount: u128) -> Promise {
        Promise::new(1, Address([3; 20]), amount, 0, H256([amount as u8; 32]))
    }

    #[test]
    fn test_promise_store_keeps_highest() {
        let store = MemoryStore::new();
        store.store_promise(&key(), 1, &promise(100)).unwrap();
        store.store_promise(&key(), 1, &promise(40)).unwrap();
        assert_eq!(store.latest_promise(&key(), 1).unwrap().unwrap().amount, 100);

        store.store_promise(&key(), 1, &promise(150)).unwrap();
        assert_eq!(store.latest_promise(&key(), 1).unwrap().unwrap().amount, 150);
    }

    #[test]
    fn test_agreements_accumulate_per_channel() {
        let store = MemoryStore::new();
        store.store_promise(&key(), 1, &promise(300)).unwrap();
        // a later session starts its own cumulative count
        store.store_promise(&key(), 2, &promise(200)).unwrap();

        assert_eq!(store.latest_promise(&key(), 1).unwrap().unwrap().amount, 300);
        assert_eq!(store.latest_promise(&key(), 2).unwrap().unwrap().amount, 200);
        assert_eq!(store.promised_total(&key()).unwrap(), 500);

        let ids: Vec<_> = store.channel_promises(&key()).unwrap().into_iter().map(|(id, _)| id).collect();
        assert_eq!(ids, vec![1, 2]);

        let other = ChannelKey::new(1, Identity::from_address(Address([9; 20])), Address([2; 20]));
        assert_eq!(store.promised_total(&other).unwrap(), 0);
    }

    #[test]
    fn test_invoice_store_lifecycle() {
        let store = MemoryStore::new();
        let invoice = Invoice::new(1, 100, 0, Identity::from_address(Address([1; 20])), 1);
        store.store_invoice("s-1", &invoice).unwrap();
        assert_eq!(store.get_invoice("s-1").unwrap(), Some(invoice));
        store.remove_invoice("s-1").unwrap();
        assert!(store.get_invoice("s-1").unwrap().is_none());
    }

    #[test]
    fn test_history_backend_is_keyed_by_tx_hash() {
        let store = MemoryStore::new();
        let entry = SettlementHistoryEntry {
            tx_hash: H256([7; 32]),
            provider_id: Identity::from_address(Address([1; 20])),
            hermes_id: Address([2; 20]),
            channel_address: Address([3; 20]),
            beneficiary: Address([4; 20]),
            amount: 10,
            settled_at: chrono::Utc::now(),
            fees: 1,
        };
        store.append(&entry).unwrap();
        store.append(&entry).unwrap();
        assert_eq!(store.load_all().unwrap().len(), 1);
    }
}
