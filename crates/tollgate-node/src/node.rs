//! The Tollgate node orchestrator.
//!
//! Builds the settlement and payment components around one event bus and
//! one store, spawns their background loops, and stops them together.

use anyhow::Result;
use chrono::{DateTime, Utc};
use std::sync::Arc;
use tokio::sync::watch;
use tokio::task::JoinHandle;

use tollgate_core::events::ServiceStarted;
use tollgate_core::{Event, EventBus};
use tollgate_payments::{EngineConfig, PaymentEngine, PeerChannel, SessionInfo, UsageMeter};
use tollgate_settlement::adapters::InternalChain;
use tollgate_settlement::{
    AddressProvider, HermesChannelRepository, HermesPromiseSettler, HermesStatusChecker,
    ProviderRegistrar, SettlementHistory, SettlementService, SettlerConfig,
};

use crate::config::TollgateConfig;
use crate::storage::Storage;

const STATE_LAST_STARTED: &str = "last_started_at";

/// A running node: storage, chain access and every settlement component.
pub struct TollgateNode {
    config: TollgateConfig,
    bus: EventBus,
    storage: Arc<Storage>,
    addresses: Arc<AddressProvider>,
    repository: Arc<HermesChannelRepository>,
    hermes: Arc<HermesStatusChecker>,
    settler: Arc<HermesPromiseSettler>,
    registrar: Arc<ProviderRegistrar>,
    service: Arc<SettlementService>,
    shutdown_tx: watch::Sender<bool>,
    tasks: Vec<JoinHandle<()>>,
}

impl TollgateNode {
    /// Open storage and build the component graph. Nothing runs until
    /// [`TollgateNode::start`].
    pub fn new(config: TollgateConfig) -> Result<Self> {
        config.validate()?;
        let storage = Arc::new(Storage::open(&config.storage.data_dir)?);
        tracing::info!(path = %config.storage.data_dir.display(), "storage initialized");

        let payments = &config.payments;
        let bus = EventBus::default();
        let chain = Arc::new(InternalChain::new());
        let (shutdown_tx, shutdown_rx) = watch::channel(false);

        let addresses = Arc::new(AddressProvider::new(
            &config.chains,
            chain.clone(),
            payments.bc_timeout,
        ));
        let repository = Arc::new(HermesChannelRepository::new(
            addresses.clone(),
            chain.clone(),
            storage.clone(),
            bus.clone(),
            payments.bc_timeout,
        ));
        let hermes = Arc::new(HermesStatusChecker::new(
            chain.clone(),
            payments.hermes_status_recheck_interval,
            payments.bc_timeout,
        ));
        let history = Arc::new(SettlementHistory::open(storage.clone())?);
        let settler = Arc::new(HermesPromiseSettler::new(
            SettlerConfig::from_payments(payments),
            repository.clone(),
            chain.clone(),
            chain.clone(),
            history.clone(),
            bus.clone(),
            shutdown_rx,
        ));
        let registrar = Arc::new(ProviderRegistrar::new(
            chain.clone(),
            addresses.clone(),
            bus.clone(),
            config.transactor.clone(),
            payments.bc_timeout,
        ));
        let service = Arc::new(SettlementService::new(
            registrar.clone(),
            settler.clone(),
            history,
            chain.clone(),
            chain.clone(),
            payments,
        ));

        Ok(Self {
            config,
            bus,
            storage,
            addresses,
            repository,
            hermes,
            settler,
            registrar,
            service,
            shutdown_tx,
            tasks: Vec::new(),
        })
    }

    /// Spawn the background loops and announce the configured provider.
    pub fn start(&mut self) -> Result<()> {
        tracing::info!("starting Tollgate node");

        if let Some(previous) = self.storage.get_state::<DateTime<Utc>>(STATE_LAST_STARTED)? {
            tracing::info!(%previous, "previous run found");
        }
        self.storage.put_state(STATE_LAST_STARTED, &Utc::now())?;

        let shutdown = self.shutdown_tx.subscribe();
        self.tasks.push(self.repository.clone().spawn(shutdown.clone()));
        self.tasks.push(self.registrar.clone().spawn(shutdown));
        self.tasks.push(self.settler.clone().spawn());

        if let Some(provider) = self.config.provider.identity {
            let chain_id = self.addresses.active_chain_id();
            self.bus.publish(Event::ServiceStarted(ServiceStarted { chain_id, provider }));
            tracing::info!(chain_id, %provider, "provider announced");
        }
        Ok(())
    }

    /// Build the provider side of a paid session backed by this node's
    /// store, bus and hermes status checker.
    pub fn payment_engine(
        &self,
        session: SessionInfo,
        peer: Arc<dyn PeerChannel>,
        meter: Arc<dyn UsageMeter>,
    ) -> PaymentEngine {
        PaymentEngine::new(
            EngineConfig::from_payments(&self.config.payments),
            session,
            peer,
            meter,
            self.storage.clone(),
            self.storage.clone(),
            self.hermes.clone(),
            self.bus.clone(),
        )
    }

    /// Signal every background loop to stop and wait for them.
    pub async fn shutdown(&mut self) -> Result<()> {
        tracing::info!("shutting down Tollgate node");
        self.shutdown_tx.send_replace(true);
        for task in self.tasks.drain(..) {
            if let Err(e) = task.await {
                tracing::error!(error = %e, "background task panicked");
            }
        }
        tracing::info!("Tollgate node shut down");
        Ok(())
    }

    /// Receiver that flips to `true` once shutdown starts.
    pub fn shutdown_signal(&self) -> watch::Receiver<bool> {
        self.shutdown_tx.subscribe()
    }

    pub fn service(&self) -> &Arc<SettlementService> {
        &self.service
    }

    pub fn bus(&self) -> &EventBus {
        &self.bus
    }

    pub fn addresses(&self) -> &Arc<AddressProvider> {
        &self.addresses
    }
}
