use std::sync::atomic::{AtomicU64, Ordering};
use std::time::Duration;

use tollgate_core::config::PaymentsConfig;
use tollgate_core::types::Amount;

const GIB: u128 = 1 << 30;

/// Per-session tariff.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Price {
    pub per_minute: Amount,
    pub per_gib: Amount,
}

impl Price {
    pub fn from_config(cfg: &PaymentsConfig) -> Self {
        Self {
            per_minute: cfg.price_per_minute as Amount,
            per_gib: cfg.price_per_gib as Amount,
        }
    }

    /// Cumulative charge for `elapsed` session time and `bytes` transferred.
    pub fn total(&self, elapsed: Duration, bytes: u64) -> Amount {
        let time = self.per_minute.saturating_mul(elapsed.as_millis()) / 60_000;
        let data = self.per_gib.saturating_mul(bytes as u128) / GIB;
        time.saturating_add(data)
    }
}

/// Range of tariffs a consumer agrees to, inclusive on both ends.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct PriceBounds {
    pub lower: Price,
    pub upper: Price,
}

impl PriceBounds {
    pub fn from_config(cfg: &PaymentsConfig) -> Self {
        Self {
            lower: Price {
                per_minute: cfg.consumer_price_per_minute_lower_bound as Amount,
                per_gib: cfg.consumer_price_per_gib_lower_bound as Amount,
            },
            upper: Price {
                per_minute: cfg.consumer_price_per_minute_upper_bound as Amount,
                per_gib: cfg.consumer_price_per_gib_upper_bound as Amount,
            },
        }
    }

    /// Accept any tariff.
    pub fn unbounded() -> Self {
        Self {
            lower: Price { per_minute: 0, per_gib: 0 },
            upper: Price { per_minute: Amount::MAX, per_gib: Amount::MAX },
        }
    }

    pub fn contains(&self, price: &Price) -> bool {
        (self.lower.per_minute..=self.upper.per_minute).contains(&price.per_minute)
            && (self.lower.per_gib..=self.upper.per_gib).contains(&price.per_gib)
    }
}

/// Source of a session's transferred byte count.
pub trait UsageMeter: Send + Sync {
    /// Total bytes moved in both directions since the session started.
    fn bytes_transferred(&self) -> u64;
}

/// Meter fed by the tunnel as traffic flows.
#[derive(Debug, Default)]
pub struct CountingMeter {
    bytes: AtomicU64,
}

impl CountingMeter {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn add(&self, bytes: u64) {
        self.bytes.fetch_add(bytes, Ordering::Relaxed);
    }
}

impl UsageMeter for CountingMeter {
    fn bytes_transferred(&self) -> u64 {
        self.bytes.load(Ordering::Relaxed)
    }
}
