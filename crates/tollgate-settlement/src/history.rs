use chrono::{DateTime, NaiveDate, Utc};
use serde::{Deserialize, Serialize};
use std::cmp::Reverse;
use std::collections::{BTreeMap, HashSet};
use std::sync::{Arc, PoisonError, RwLock};

use tollgate_core::types::{HermesId, Identity, SettlementHistoryEntry, TxHash};
use tollgate_core::HistoryBackend;

use crate::error::SettlementError;

pub const DEFAULT_PAGE_SIZE: usize = 50;

/// Optional, AND-combined criteria for listing history.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct SettlementHistoryFilter {
    pub time_from: Option<DateTime<Utc>>,
    pub time_to: Option<DateTime<Utc>>,
    pub provider_id: Option<Identity>,
    pub hermes_id: Option<HermesId>,
}

impl SettlementHistoryFilter {
    /// Build a time filter from calendar dates. `to` covers its whole day.
    pub fn from_dates(from: Option<NaiveDate>, to: Option<NaiveDate>) -> Self {
        Self {
            time_from: from
                .and_then(|d| d.and_hms_opt(0, 0, 0))
                .map(|dt| dt.and_utc()),
            time_to: to
                .and_then(|d| d.and_hms_nano_opt(23, 59, 59, 999_999_999))
                .map(|dt| dt.and_utc()),
            ..Default::default()
        }
    }

    pub fn with_provider(mut self, provider_id: Identity) -> Self {
        self.provider_id = Some(provider_id);
        self
    }

    pub fn with_hermes(mut self, hermes_id: HermesId) -> Self {
        self.hermes_id = Some(hermes_id);
        self
    }

    pub fn matches(&self, entry: &SettlementHistoryEntry) -> bool {
        self.time_from.map_or(true, |from| entry.settled_at >= from)
            && self.time_to.map_or(true, |to| entry.settled_at <= to)
            && self.provider_id.map_or(true, |p| entry.provider_id == p)
            && self.hermes_id.map_or(true, |h| entry.hermes_id == h)
    }
}

/// 1-based page selector.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct PageRequest {
    pub page: usize,
    pub page_size: usize,
}

impl PageRequest {
    pub fn new(page: usize, page_size: usize) -> Self {
        Self { page, page_size }
    }

    fn normalized(self) -> Self {
        Self {
            page: self.page.max(1),
            page_size: if self.page_size == 0 {
                DEFAULT_PAGE_SIZE
            } else {
                self.page_size
            },
        }
    }
}

impl Default for PageRequest {
    fn default() -> Self {
        Self::new(1, DEFAULT_PAGE_SIZE)
    }
}

/// Pagination envelope.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Page<T> {
    pub items: Vec<T>,
    pub page: usize,
    pub page_size: usize,
    pub total_items: usize,
    pub total_pages: usize,
}

type OrderKey = (Reverse<DateTime<Utc>>, TxHash);

#[derive(Default)]
struct Entries {
    ordered: BTreeMap<OrderKey, SettlementHistoryEntry>,
    seen: HashSet<TxHash>,
}

impl Entries {
    fn insert(&mut self, entry: SettlementHistoryEntry) -> bool {
        if !self.seen.insert(entry.tx_hash) {
            return false;
        }
        self.ordered
            .insert((Reverse(entry.settled_at), entry.tx_hash), entry);
        true
    }
}

/// Append-only log of confirmed settlements, newest first.
pub struct SettlementHistory {
    entries: RwLock<Entries>,
    backend: Option<Arc<dyn HistoryBackend>>,
}

impl SettlementHistory {
    /// History kept in memory only.
    pub fn new() -> Self {
        Self {
            entries: RwLock::new(Entries::default()),
            backend: None,
        }
    }

    /// History persisted through `backend`, reloading what it holds.
    pub fn open(backend: Arc<dyn HistoryBackend>) -> Result<Self, SettlementError> {
        let mut entries = Entries::default();
        for entry in backend.load_all()? {
            entries.insert(entry);
        }
        tracing::info!(entries = entries.ordered.len(), "settlement history loaded");
        Ok(Self {
            entries: RwLock::new(entries),
            backend: Some(backend),
        })
    }

    /// Record a settlement. Returns `false` when `tx_hash` is already known.
    pub fn append(&self, entry: SettlementHistoryEntry) -> Result<bool, SettlementError> {
        let mut entries = self.entries.write().unwrap_or_else(PoisonError::into_inner);
        if entries.seen.contains(&entry.tx_hash) {
            return Ok(false);
        }
        if let Some(backend) = &self.backend {
            backend.append(&entry)?;
        }
        tracing::info!(
            tx = %entry.tx_hash,
            provider = %entry.provider_id,
            amount = %entry.amount,
            "settlement recorded"
        );
        Ok(entries.insert(entry))
    }

    pub fn list(&self, filter: &SettlementHistoryFilter, page: PageRequest) -> Page<SettlementHistoryEntry> {
        let page = page.normalized();
        let entries = self.entries.read().unwrap_or_else(PoisonError::into_inner);
        let matching: Vec<&SettlementHistoryEntry> =
            entries.ordered.values().filter(|e| filter.matches(e)).collect();

        let total_items = matching.len();
        let total_pages = total_items.div_ceil(page.page_size);
        let items = matching
            .into_iter()
            .skip((page.page - 1).saturating_mul(page.page_size))
            .take(page.page_size)
            .cloned()
            .collect();

        Page {
            items,
            page: page.page,
            page_size: page.page_size,
            total_items,
            total_pages,
        }
    }

    pub fn len(&self) -> usize {
        self.entries.read().unwrap_or_else(PoisonError::into_inner).ordered.len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

impl Default for SettlementHistory {
    fn default() -> Self {
        Self::new()
    }
}
