//! Cached view of provider channels with hermes operators.
//!
//! The repository is the single owner of channel snapshots. Snapshots are
//! loaded lazily from the chain (with the stored promises of every
//! agreement) and are then only mutated by validated events: a promise
//! raising its agreement's cumulative amount, or a settlement raising the
//! settled total. Every
//! change of the computed balance is republished on the bus.

use dashmap::DashMap;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::watch;
use tokio::task::JoinHandle;

use tollgate_core::events::{ChannelBalanceChanged, PromiseReceived, SettlementCompleted};
use tollgate_core::types::{Amount, ChainId, ChannelKey, HermesChannel, HermesId, Identity};
use tollgate_core::{Event, EventBus, PromiseStore, Topic};

use crate::addresses::AddressProvider;
use crate::error::SettlementError;
use crate::traits::{bounded, ChainReader};

pub struct HermesChannelRepository {
    cache: DashMap<ChannelKey, HermesChannel>,
    addresses: Arc<AddressProvider>,
    reader: Arc<dyn ChainReader>,
    promises: Arc<dyn PromiseStore>,
    bus: EventBus,
    bc_timeout: Duration,
}

impl HermesChannelRepository {
    pub fn new(
        addresses: Arc<AddressProvider>,
        reader: Arc<dyn ChainReader>,
        promises: Arc<dyn PromiseStore>,
        bus: EventBus,
        bc_timeout: Duration,
    ) -> Self {
        Self {
            cache: DashMap::new(),
            addresses,
            reader,
            promises,
            bus,
            bc_timeout,
        }
    }

    /// Return the cached snapshot, loading it from the chain on a miss.
    pub async fn get_channel(
        &self,
        chain_id: ChainId,
        identity: Identity,
        hermes_id: HermesId,
    ) -> Result<HermesChannel, SettlementError> {
        let key = ChannelKey::new(chain_id, identity, hermes_id);
        if let Some(channel) = self.cached(&key) {
            return Ok(channel);
        }
        self.force_refresh(&key).await
    }

    /// Cached snapshot without touching the chain.
    pub fn cached(&self, key: &ChannelKey) -> Option<HermesChannel> {
        self.cache.get(key).map(|c| c.clone())
    }

    /// Keys of every cached channel.
    pub fn cached_keys(&self) -> Vec<ChannelKey> {
        self.cache.iter().map(|e| *e.key()).collect()
    }

    /// Reload `key` from the chain, keeping the larger of the cached and
    /// stored promise per agreement and never lowering the settled total.
    pub async fn force_refresh(&self, key: &ChannelKey) -> Result<HermesChannel, SettlementError> {
        let channel_id = self
            .addresses
            .channel_address(key.chain_id, key.identity, key.hermes_id)?;
        let onchain = bounded(
            self.bc_timeout,
            "channel",
            self.reader.channel(key.chain_id, channel_id),
        )
        .await?;
        let beneficiary = bounded(
            self.bc_timeout,
            "beneficiary",
            self.reader.beneficiary(key.chain_id, key.identity),
        )
        .await?;
        let stored = self.promises.channel_promises(key)?;

        let mut fresh = HermesChannel {
            chain_id: key.chain_id,
            identity: key.identity,
            hermes_id: key.hermes_id,
            channel_id,
            onchain_balance: onchain.balance,
            settled: onchain.settled,
            promises: stored.into_iter().collect(),
            beneficiary,
        };

        let previous = {
            let mut entry = self.cache.entry(*key).or_insert_with(|| fresh.clone());
            let previous = entry.balance();
            let cached = entry.value();
            for (agreement_id, promise) in &cached.promises {
                fresh.accept_promise(*agreement_id, promise);
            }
            fresh.settled = fresh.settled.max(cached.settled);
            *entry = fresh.clone();
            previous
        };

        tracing::debug!(channel = %key, balance = %fresh.balance(), "channel refreshed");
        self.publish_if_changed(key, previous, fresh.balance());
        Ok(fresh)
    }

    /// Drop the cached snapshot of `key`.
    pub fn invalidate(&self, key: &ChannelKey) {
        self.cache.remove(key);
    }

    /// Apply an accepted promise. Promises not larger than the cached one
    /// of the same agreement are ignored.
    pub async fn handle_promise_received(&self, event: &PromiseReceived) -> Result<(), SettlementError> {
        let key = event.key;
        if !self.cache.contains_key(&key) {
            self.force_refresh(&key).await?;
        }

        let change = self.cache.get_mut(&key).and_then(|mut channel| {
            let previous = channel.balance();
            if !channel.accept_promise(event.agreement_id, &event.promise) {
                return None;
            }
            Some((previous, channel.balance()))
        });

        match change {
            Some((previous, current)) => {
                tracing::debug!(
                    channel = %key,
                    agreement = event.agreement_id,
                    amount = %event.promise.amount,
                    "promise applied"
                );
                self.publish_if_changed(&key, previous, current);
            }
            None => {
                tracing::trace!(channel = %key, amount = %event.promise.amount, "stale promise ignored");
            }
        }
        Ok(())
    }

    /// Raise the settled total of `key` to `settled_total`.
    pub fn apply_settlement(&self, key: &ChannelKey, settled_total: Amount) {
        let change = self.cache.get_mut(key).and_then(|mut channel| {
            if settled_total <= channel.settled {
                return None;
            }
            let previous = channel.balance();
            channel.settled = settled_total;
            Some((previous, channel.balance()))
        });
        if let Some((previous, current)) = change {
            tracing::debug!(channel = %key, settled = %settled_total, "settlement applied");
            self.publish_if_changed(key, previous, current);
        }
    }

    pub fn handle_settlement_completed(&self, event: &SettlementCompleted) {
        self.apply_settlement(&event.key, event.settled_total);
    }

    fn publish_if_changed(&self, key: &ChannelKey, previous: Amount, current: Amount) {
        if previous == current {
            return;
        }
        self.bus.publish(Event::ChannelBalanceChanged(ChannelBalanceChanged {
            key: *key,
            previous,
            current,
        }));
    }

    /// Follow promise and settlement events until `shutdown` fires.
    pub fn spawn(self: Arc<Self>, mut shutdown: watch::Receiver<bool>) -> JoinHandle<()> {
        let mut events = self
            .bus
            .subscribe(&[Topic::PromiseReceived, Topic::SettlementCompleted]);
        tokio::spawn(async move {
            loop {
                tokio::select! {
                    _ = shutdown.changed() => {
                        tracing::info!("channel repository shutting down");
                        break;
                    }
                    event = events.recv() => match event {
                        Some(Event::PromiseReceived(ev)) => {
                            if let Err(e) = self.handle_promise_received(&ev).await {
                                tracing::warn!(channel = %ev.key, error = %e, "failed to apply promise");
                            }
                        }
                        Some(Event::SettlementCompleted(ev)) => self.handle_settlement_completed(&ev),
                        Some(_) => {}
                        None => break,
                    },
                }
            }
        })
    }
}
