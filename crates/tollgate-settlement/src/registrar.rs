use dashmap::DashMap;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::{watch, Mutex, MutexGuard};
use tokio::task::JoinHandle;
use tokio::time::Instant;

use tollgate_core::config::TransactorConfig;
use tollgate_core::events::RegistrationStatusChanged;
use tollgate_core::types::{Address, Amount, ChainId, Identity, RegistrationStatus};
use tollgate_core::{Event, EventBus, Topic};

use crate::addresses::AddressProvider;
use crate::error::SettlementError;
use crate::traits::{bounded, Transactor};
use crate::types::RegistrationRequest;

/// Parameters of one registration call.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RegisterIdentity {
    pub chain_id: ChainId,
    pub identity: Identity,
    pub beneficiary: Address,
    pub stake: Amount,
    pub referral_token: Option<String>,
}

type LockMap = DashMap<(ChainId, Identity), Arc<Mutex<()>>>;

/// Share of an identity's registration lock. The map entry goes away with
/// the last lease.
struct LockLease<'a> {
    locks: &'a LockMap,
    key: (ChainId, Identity),
    lock: Arc<Mutex<()>>,
}

impl<'a> LockLease<'a> {
    fn acquire(locks: &'a LockMap, key: (ChainId, Identity)) -> Self {
        let lock = locks.entry(key).or_default().clone();
        Self { locks, key, lock }
    }

    async fn lock(&self) -> MutexGuard<'_, ()> {
        self.lock.lock().await
    }
}

impl Drop for LockLease<'_> {
    fn drop(&mut self) {
        // the map and this lease
        self.locks.remove_if(&self.key, |_, lock| Arc::strong_count(lock) == 2);
    }
}

/// Drives identities through on-chain registration with bounded retries.
pub struct ProviderRegistrar {
    transactor: Arc<dyn Transactor>,
    addresses: Arc<AddressProvider>,
    bus: EventBus,
    config: TransactorConfig,
    bc_timeout: Duration,
    /// One lock per (chain, identity) so concurrent requests coalesce.
    locks: LockMap,
}

impl ProviderRegistrar {
    pub fn new(
        transactor: Arc<dyn Transactor>,
        addresses: Arc<AddressProvider>,
        bus: EventBus,
        config: TransactorConfig,
        bc_timeout: Duration,
    ) -> Self {
        Self {
            transactor,
            addresses,
            bus,
            config,
            bc_timeout,
            locks: DashMap::new(),
        }
    }

    /// Register `request.identity` on `request.chain_id`.
    ///
    /// Succeeds immediately for registered identities. An identity already
    /// `InProgress` on chain is only polled, never re-submitted.
    pub async fn register(&self, request: RegisterIdentity) -> Result<(), SettlementError> {
        let lease = LockLease::acquire(&self.locks, (request.chain_id, request.identity));
        let _held = lease.lock().await;

        let max_attempts = self.config.max_registration_attempts.max(1);
        let mut cause = String::from("no attempt made");
        for attempt in 1..=max_attempts {
            match self.attempt(&request).await {
                Ok(RegistrationStatus::Registered) => {
                    if attempt > 1 {
                        tracing::info!(attempt, identity = %request.identity, "registration succeeded after retry");
                    }
                    return Ok(());
                }
                Ok(status) => {
                    cause = format!(
                        "status {} after {:?}",
                        status, self.config.registration_poll_timeout
                    );
                }
                Err(e) => cause = e.to_string(),
            }
            tracing::warn!(
                attempt,
                max_attempts,
                chain_id = request.chain_id,
                identity = %request.identity,
                %cause,
                "registration attempt failed"
            );
            if attempt < max_attempts {
                tokio::time::sleep(self.config.registration_retry_delay).await;
            }
        }

        self.publish(&request, RegistrationStatus::RegistrationError);
        tracing::error!(chain_id = request.chain_id, identity = %request.identity, %cause, "registration failed");
        Err(SettlementError::RegistrationFailed {
            attempts: max_attempts,
            cause,
        })
    }

    async fn attempt(&self, request: &RegisterIdentity) -> Result<RegistrationStatus, SettlementError> {
        let status = self
            .addresses
            .registration_status(request.chain_id, request.identity)
            .await?;
        match status {
            RegistrationStatus::Registered => return Ok(status),
            RegistrationStatus::InProgress => {
                tracing::debug!(identity = %request.identity, "registration already in progress");
            }
            RegistrationStatus::Unregistered | RegistrationStatus::RegistrationError => {
                let fees = bounded(self.bc_timeout, "fees", self.transactor.fees(request.chain_id)).await?;
                let tx = self
                    .transactor
                    .register_identity(&RegistrationRequest {
                        chain_id: request.chain_id,
                        identity: request.identity,
                        beneficiary: request.beneficiary,
                        stake: request.stake,
                        fee: fees.registration,
                        referral_token: request.referral_token.clone(),
                    })
                    .await?;
                tracing::info!(chain_id = request.chain_id, identity = %request.identity, %tx, "registration submitted");
                self.publish(request, RegistrationStatus::InProgress);
            }
        }

        let status = self.poll_until_registered(request).await?;
        if status.is_registered() {
            self.publish(request, status);
        }
        Ok(status)
    }

    async fn poll_until_registered(&self, request: &RegisterIdentity) -> Result<RegistrationStatus, SettlementError> {
        let deadline = Instant::now() + self.config.registration_poll_timeout;
        loop {
            let status = self
                .addresses
                .registration_status(request.chain_id, request.identity)
                .await?;
            if status.is_registered() || status == RegistrationStatus::RegistrationError {
                return Ok(status);
            }
            if Instant::now() >= deadline {
                return Ok(status);
            }
            tokio::time::sleep_until((Instant::now() + self.config.registration_poll_interval).min(deadline)).await;
        }
    }

    /// Identities with a registration running or waiting.
    pub fn registrations_in_flight(&self) -> usize {
        self.locks.len()
    }

    fn publish(&self, request: &RegisterIdentity, status: RegistrationStatus) {
        self.bus.publish(Event::RegistrationStatusChanged(RegistrationStatusChanged {
            chain_id: request.chain_id,
            identity: request.identity,
            status,
        }));
    }

    /// Register providers as they start offering services.
    pub fn spawn(self: Arc<Self>, mut shutdown: watch::Receiver<bool>) -> JoinHandle<()> {
        let mut events = self.bus.subscribe(&[Topic::ServiceStarted]);
        tokio::spawn(async move {
            loop {
                tokio::select! {
                    _ = shutdown.changed() => break,
                    event = events.recv() => match event {
                        Some(Event::ServiceStarted(ev)) => {
                            let this = Arc::clone(&self);
                            let request = RegisterIdentity {
                                chain_id: ev.chain_id,
                                identity: ev.provider,
                                beneficiary: ev.provider.address(),
                                stake: self.config.provider_registration_stake as Amount,
                                referral_token: None,
                            };
                            tokio::spawn(async move {
                                if let Err(e) = this.register(request).await {
                                    tracing::error!(error = %e, "provider registration failed");
                                }
                            });
                        }
                        Some(_) => {}
                        None => break,
                    },
                }
            }
        })
    }
}
