//! Fixtures shared by the cross-crate scenarios in `tests/`.
//!
//! [`Provider`] is a provider node assembled over the in-memory chain and
//! store; [`spawn_consumer`] answers its invoices the way a well-behaved
//! consumer would.

use std::sync::Arc;
use tokio::sync::{mpsc, watch};
use tokio::task::JoinHandle;

use tollgate_core::config::{ChainsConfig, PaymentsConfig, TransactorConfig};
use tollgate_core::types::{Address, ChainId, ChannelKey, Identity, Invoice, Promise};
use tollgate_core::{EventBus, MemoryStore};
use tollgate_crypto::KeyPair;
use tollgate_payments::{
    EngineConfig, InvoicePayer, LocalPeer, PayerConfig, PaymentEngine, PeerChannel, Price,
    SessionInfo, UsageMeter,
};
use tollgate_settlement::adapters::InternalChain;
use tollgate_settlement::{
    AddressProvider, HermesChannelRepository, HermesPromiseSettler, HermesStatusChecker,
    ProviderRegistrar, SettlementHistory, SettlementService, SettlerConfig,
};

pub const CHAIN: ChainId = 137;

/// One provider with every settlement component wired to a shared bus.
pub struct Provider {
    pub identity: Identity,
    pub key: ChannelKey,
    pub channel_id: Address,
    pub payments: PaymentsConfig,
    pub chain: Arc<InternalChain>,
    pub bus: EventBus,
    pub store: Arc<MemoryStore>,
    pub addresses: Arc<AddressProvider>,
    pub repository: Arc<HermesChannelRepository>,
    pub hermes: Arc<HermesStatusChecker>,
    pub history: Arc<SettlementHistory>,
    pub settler: Arc<HermesPromiseSettler>,
    pub service: SettlementService,
    pub shutdown: watch::Sender<bool>,
}

impl Provider {
    pub fn new(payments: PaymentsConfig) -> Self {
        Self::with_identity(payments, Identity::from_address(Address([0x51; 20])))
    }

    pub fn with_identity(payments: PaymentsConfig, identity: Identity) -> Self {
        let chain = Arc::new(InternalChain::new());
        let bus = EventBus::new(256);
        let store = Arc::new(MemoryStore::new());
        let (shutdown, shutdown_rx) = watch::channel(false);

        let addresses = Arc::new(AddressProvider::new(
            &ChainsConfig::default(),
            chain.clone(),
            payments.bc_timeout,
        ));
        let hermes_id = addresses
            .active_hermes(CHAIN)
            .unwrap_or_else(|e| panic!("default chains must include {}: {}", CHAIN, e));
        let channel_id = addresses
            .channel_address(CHAIN, identity, hermes_id)
            .unwrap_or_else(|e| panic!("channel address: {}", e));

        let repository = Arc::new(HermesChannelRepository::new(
            addresses.clone(),
            chain.clone(),
            store.clone(),
            bus.clone(),
            payments.bc_timeout,
        ));
        let hermes = Arc::new(HermesStatusChecker::new(
            chain.clone(),
            payments.hermes_status_recheck_interval,
            payments.bc_timeout,
        ));
        let history = Arc::new(SettlementHistory::new());
        let settler = Arc::new(HermesPromiseSettler::new(
            SettlerConfig::from_payments(&payments),
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
            TransactorConfig::default(),
            payments.bc_timeout,
        ));
        let service = SettlementService::new(
            registrar,
            settler.clone(),
            history.clone(),
            chain.clone(),
            chain.clone(),
            &payments,
        );

        Self {
            identity,
            key: ChannelKey::new(CHAIN, identity, hermes_id),
            channel_id,
            payments,
            chain,
            bus,
            store,
            addresses,
            repository,
            hermes,
            history,
            settler,
            service,
            shutdown,
        }
    }

    /// Start the repository and settler loops.
    pub fn spawn_background(&self) -> Vec<JoinHandle<()>> {
        vec![
            self.repository.clone().spawn(self.shutdown.subscribe()),
            self.settler.clone().spawn(),
        ]
    }

    /// Session for `consumer` paying into this provider's channel.
    pub fn session(&self, consumer: &KeyPair) -> SessionInfo {
        SessionInfo::new(
            CHAIN,
            self.identity,
            self.key.hermes_id,
            self.channel_id,
            consumer.public_key(),
        )
    }

    /// Payment engine for `session`, delivering invoices to the returned
    /// receiver.
    pub fn engine(
        &self,
        config: EngineConfig,
        session: SessionInfo,
        meter: Arc<dyn UsageMeter>,
    ) -> (PaymentEngine, mpsc::Receiver<Invoice>) {
        let (peer, invoices) = LocalPeer::channel(16);
        (self.engine_with_peer(config, session, Arc::new(peer), meter), invoices)
    }

    pub fn engine_with_peer(
        &self,
        config: EngineConfig,
        session: SessionInfo,
        peer: Arc<dyn PeerChannel>,
        meter: Arc<dyn UsageMeter>,
    ) -> PaymentEngine {
        PaymentEngine::new(
            config,
            session,
            peer,
            meter,
            self.store.clone(),
            self.store.clone(),
            self.hermes.clone(),
            self.bus.clone(),
        )
    }

    /// Payer configuration a consumer would agree to with this provider at
    /// `price`.
    pub fn payer_config(&self, max_step: tollgate_core::Amount, price: Price) -> PayerConfig {
        PayerConfig {
            max_step,
            ..PayerConfig::from_payments(
                &self.payments,
                CHAIN,
                self.channel_id,
                self.identity,
                price,
            )
        }
    }
}

/// Answer every invoice with a signed promise until either side closes.
/// Resolves to the number of invoices answered.
pub fn spawn_consumer(
    mut payer: InvoicePayer,
    mut invoices: mpsc::Receiver<Invoice>,
    promises: mpsc::Sender<Promise>,
) -> JoinHandle<u32> {
    tokio::spawn(async move {
        let mut answered = 0;
        while let Some(invoice) = invoices.recv().await {
            match payer.pay(&invoice) {
                Ok(promise) => {
                    if promises.send(promise).await.is_err() {
                        break;
                    }
                    answered += 1;
                }
                Err(e) => tracing::warn!(error = %e, "consumer refused invoice"),
            }
        }
        answered
    })
}
