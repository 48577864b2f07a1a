use std::sync::Arc;
use std::time::Duration;

use tollgate_core::config::PaymentsConfig;
use tollgate_core::types::{
    Address, Amount, BeneficiaryChangeStatus, ChainId, ChannelKey, HermesId, Identity,
    SettlementHistoryEntry, TransactorFees,
};

use crate::error::SettlementError;
use crate::history::{Page, PageRequest, SettlementHistory, SettlementHistoryFilter};
use crate::registrar::{ProviderRegistrar, RegisterIdentity};
use crate::settler::HermesPromiseSettler;
use crate::traits::{bounded, ChainReader, Transactor};

/// Operations the node exposes to its presentation layer.
pub struct SettlementService {
    registrar: Arc<ProviderRegistrar>,
    settler: Arc<HermesPromiseSettler>,
    history: Arc<SettlementHistory>,
    transactor: Arc<dyn Transactor>,
    reader: Arc<dyn ChainReader>,
    blocking_settle_timeout: Duration,
    beneficiary_change_timeout: Duration,
    bc_timeout: Duration,
}

impl SettlementService {
    pub fn new(
        registrar: Arc<ProviderRegistrar>,
        settler: Arc<HermesPromiseSettler>,
        history: Arc<SettlementHistory>,
        transactor: Arc<dyn Transactor>,
        reader: Arc<dyn ChainReader>,
        config: &PaymentsConfig,
    ) -> Self {
        Self {
            registrar,
            settler,
            history,
            transactor,
            reader,
            blocking_settle_timeout: config.blocking_settle_timeout,
            beneficiary_change_timeout: config.beneficiary_change_timeout,
            bc_timeout: config.bc_timeout,
        }
    }

    pub async fn register_identity(
        &self,
        chain_id: ChainId,
        identity: Identity,
        beneficiary: Address,
        stake: Amount,
        referral_token: Option<String>,
    ) -> Result<(), SettlementError> {
        self.registrar
            .register(RegisterIdentity {
                chain_id,
                identity,
                beneficiary,
                stake,
                referral_token,
            })
            .await
    }

    /// Settle the provider's channel with `hermes_id`.
    ///
    /// Blocking calls wait for confirmation and return the recorded entry;
    /// otherwise the settlement runs in the background and `None` is
    /// returned at once.
    pub async fn settle(
        &self,
        chain_id: ChainId,
        provider: Identity,
        hermes_id: HermesId,
        blocking: bool,
    ) -> Result<Option<SettlementHistoryEntry>, SettlementError> {
        let key = ChannelKey::new(chain_id, provider, hermes_id);
        if blocking {
            self.settler
                .force_settle(key, self.blocking_settle_timeout)
                .await
                .map(Some)
        } else {
            self.settler.settle_async(key);
            Ok(None)
        }
    }

    pub async fn settle_with_beneficiary(
        &self,
        chain_id: ChainId,
        identity: Identity,
        beneficiary: Address,
        hermes_id: HermesId,
    ) -> Result<BeneficiaryChangeStatus, SettlementError> {
        self.settler
            .settle_with_beneficiary(
                ChannelKey::new(chain_id, identity, hermes_id),
                beneficiary,
                self.beneficiary_change_timeout,
            )
            .await
    }

    /// Payout address currently set on chain.
    pub async fn beneficiary(&self, chain_id: ChainId, identity: Identity) -> Result<Address, SettlementError> {
        bounded(self.bc_timeout, "beneficiary", self.reader.beneficiary(chain_id, identity)).await
    }

    pub fn beneficiary_change_status(&self, identity: &Identity) -> Option<BeneficiaryChangeStatus> {
        self.settler.beneficiary_change_status(identity)
    }

    pub async fn transactor_fees(&self, chain_id: ChainId) -> Result<TransactorFees, SettlementError> {
        bounded(self.bc_timeout, "fees", self.transactor.fees(chain_id)).await
    }

    pub fn list_settlement_history(
        &self,
        filter: &SettlementHistoryFilter,
        page: PageRequest,
    ) -> Page<SettlementHistoryEntry> {
        self.history.list(filter, page)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::adapters::{ConfirmationMode, InternalChain};
    use crate::addresses::AddressProvider;
    use crate::channels::HermesChannelRepository;
    use crate::settler::SettlerConfig;
    use tokio::sync::watch;
    use tollgate_core::config::{ChainsConfig, TransactorConfig};
    use tollgate_core::events::PromiseReceived;
    use tollgate_core::types::{BeneficiaryChangeState, Promise, H256};
    use tollgate_core::{EventBus, MemoryStore};

    struct Fixture {
        chain: Arc<InternalChain>,
        repo: Arc<HermesChannelRepository>,
        service: SettlementService,
        key: ChannelKey,
        _shutdown: watch::Sender<bool>,
    }

    fn fixture(payments: PaymentsConfig) -> Fixture {
        let chain = Arc::new(InternalChain::with_fees(TransactorFees {
            registration: 5,
            settlement: 2,
            hermes: 100,
        }));
        let bus = EventBus::new(64);
        let addresses = Arc::new(AddressProvider::new(
            &ChainsConfig::default(),
            chain.clone(),
            payments.bc_timeout,
        ));
        let hermes = addresses.active_hermes(137).unwrap();
        let repo = Arc::new(HermesChannelRepository::new(
            addresses.clone(),
            chain.clone(),
            Arc::new(MemoryStore::new()),
            bus.clone(),
            payments.bc_timeout,
        ));
        let history = Arc::new(SettlementHistory::new());
        let (shutdown_tx, shutdown_rx) = watch::channel(false);
        let settler = Arc::new(HermesPromiseSettler::new(
            SettlerConfig::from_payments(&payments),
            repo.clone(),
            chain.clone(),
            chain.clone(),
            history.clone(),
            bus.clone(),
            shutdown_rx,
        ));
        let registrar = Arc::new(ProviderRegistrar::new(
            chain.clone(),
            addresses,
            bus,
            TransactorConfig::default(),
            payments.bc_timeout,
        ));
        let service = SettlementService::new(registrar, settler, history, chain.clone(), chain.clone(), &payments);
        let key = ChannelKey::new(137, Identity::from_address(Address([1; 20])), hermes);
        Fixture {
            chain,
            repo,
            service,
            key,
            _shutdown: shutdown_tx,
        }
    }

    async fn promise(f: &Fixture, amount: Amount) {
        let promise = Promise::new(137, Address([3; 20]), amount, 0, H256([1; 32]));
        f.repo
            .handle_promise_received(&PromiseReceived {
                key: f.key,
                agreement_id: 1,
                promise,
            })
            .await
            .unwrap();
    }

    #[tokio::test]
    async fn test_blocking_settle_returns_entry_and_lists_it() {
        let f = fixture(PaymentsConfig::default());
        promise(&f, 500).await;
        let entry = f
            .service
            .settle(137, f.key.identity, f.key.hermes_id, true)
            .await
            .unwrap()
            .unwrap();
        assert_eq!(entry.amount, 500);
        assert_eq!(entry.fees, 2);

        let page = f.service.list_settlement_history(
            &SettlementHistoryFilter::default().with_provider(f.key.identity),
            PageRequest::default(),
        );
        assert_eq!(page.items, vec![entry]);
    }

    #[tokio::test(start_paused = true)]
    async fn test_blocking_settle_deadline() {
        let f = fixture(PaymentsConfig::default());
        f.chain.set_settlement_mode(ConfirmationMode::Never);
        promise(&f, 500).await;
        let started = tokio::time::Instant::now();
        let err = f
            .service
            .settle(137, f.key.identity, f.key.hermes_id, true)
            .await
            .unwrap_err();
        assert!(matches!(err, SettlementError::SettlementTimeout(d) if d == Duration::from_secs(120)));
        assert!(started.elapsed() >= Duration::from_secs(120));
    }

    #[tokio::test]
    async fn test_non_blocking_settle_returns_immediately() {
        let f = fixture(PaymentsConfig::default());
        promise(&f, 500).await;
        let result = f.service.settle(137, f.key.identity, f.key.hermes_id, false).await.unwrap();
        assert!(result.is_none());
    }

    #[tokio::test]
    async fn test_beneficiary_roundtrip() {
        let f = fixture(PaymentsConfig::default());
        promise(&f, 10).await;
        let target = Address([0x42; 20]);
        assert_eq!(f.service.beneficiary(137, f.key.identity).await.unwrap(), f.key.identity.address());

        let status = f
            .service
            .settle_with_beneficiary(137, f.key.identity, target, f.key.hermes_id)
            .await
            .unwrap();
        assert_eq!(status.state, BeneficiaryChangeState::Completed);
        assert_eq!(f.service.beneficiary(137, f.key.identity).await.unwrap(), target);
        assert_eq!(f.service.beneficiary_change_status(&f.key.identity), Some(status));
    }

    #[tokio::test]
    async fn test_fees_and_registration() {
        let f = fixture(PaymentsConfig::default());
        let fees = f.service.transactor_fees(137).await.unwrap();
        assert_eq!(fees.registration, 5);
        assert_eq!(fees.hermes, 100);

        f.service
            .register_identity(137, f.key.identity, f.key.identity.address(), 0, Some("ref".into()))
            .await
            .unwrap();
        assert_eq!(f.chain.register_calls(), 1);
    }
}
