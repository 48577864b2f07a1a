use dashmap::DashSet;
use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

use tollgate_core::config::{ChainDefinition, ChainsConfig};
use tollgate_core::types::{Address, ChainId, HermesId, Identity, RegistrationStatus};
use tollgate_crypto::derive_address;

use crate::error::SettlementError;
use crate::traits::{bounded, ChainReader};

/// Resolves per-chain contract addresses and identity registration state.
pub struct AddressProvider {
    chains: HashMap<ChainId, ChainDefinition>,
    active_chain_id: ChainId,
    reader: Arc<dyn ChainReader>,
    /// Identities known to be registered; registration is never revoked.
    registered: DashSet<(ChainId, Identity)>,
    bc_timeout: Duration,
}

impl AddressProvider {
    pub fn new(config: &ChainsConfig, reader: Arc<dyn ChainReader>, bc_timeout: Duration) -> Self {
        let chains = config
            .definitions()
            .into_iter()
            .map(|def| (def.chain_id, def))
            .collect();
        Self {
            chains,
            active_chain_id: config.active_chain_id,
            reader,
            registered: DashSet::new(),
            bc_timeout,
        }
    }

    pub fn active_chain_id(&self) -> ChainId {
        self.active_chain_id
    }

    pub fn definition(&self, chain_id: ChainId) -> Result<&ChainDefinition, SettlementError> {
        self.chains
            .get(&chain_id)
            .ok_or(SettlementError::UnknownChain(chain_id))
    }

    pub fn registry_address(&self, chain_id: ChainId) -> Result<Address, SettlementError> {
        Ok(self.definition(chain_id)?.registry_address)
    }

    /// Hermes the node works with on `chain_id`.
    pub fn active_hermes(&self, chain_id: ChainId) -> Result<HermesId, SettlementError> {
        Ok(self.definition(chain_id)?.hermes_id)
    }

    pub fn channel_implementation(&self, chain_id: ChainId) -> Result<Address, SettlementError> {
        Ok(self.definition(chain_id)?.channel_impl_address)
    }

    /// Deterministic channel contract address of `identity` with `hermes_id`.
    pub fn channel_address(
        &self,
        chain_id: ChainId,
        identity: Identity,
        hermes_id: HermesId,
    ) -> Result<Address, SettlementError> {
        let def = self.definition(chain_id)?;
        Ok(derive_address(&[
            def.registry_address.as_bytes(),
            def.channel_impl_address.as_bytes(),
            hermes_id.as_bytes(),
            identity.address().as_bytes(),
        ]))
    }

    /// Registration status of `identity` on `chain_id`.
    ///
    /// `Registered` is cached; every other status is read from the chain.
    pub async fn registration_status(
        &self,
        chain_id: ChainId,
        identity: Identity,
    ) -> Result<RegistrationStatus, SettlementError> {
        self.definition(chain_id)?;
        if self.registered.contains(&(chain_id, identity)) {
            return Ok(RegistrationStatus::Registered);
        }
        let status = bounded(
            self.bc_timeout,
            "registration status",
            self.reader.registration_status(chain_id, identity),
        )
        .await?;
        if status.is_registered() {
            self.registered.insert((chain_id, identity));
        }
        Ok(status)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::adapters::InternalChain;

    fn provider(chain: Arc<InternalChain>) -> AddressProvider {
        AddressProvider::new(&ChainsConfig::default(), chain, Duration::from_secs(5))
    }

    fn identity(b: u8) -> Identity {
        Identity::from_address(Address([b; 20]))
    }

    #[test]
    fn test_known_chains_resolve() {
        let p = provider(Arc::new(InternalChain::new()));
        let cfg = ChainsConfig::default();
        assert_eq!(p.registry_address(1).unwrap(), cfg.chain1.registry_address);
        assert_eq!(p.active_hermes(137).unwrap(), cfg.chain2.hermes_id);
        assert_eq!(p.channel_implementation(137).unwrap(), cfg.chain2.channel_impl_address);
        assert_eq!(p.active_chain_id(), 137);
    }

    #[test]
    fn test_unknown_chain() {
        let p = provider(Arc::new(InternalChain::new()));
        assert!(matches!(p.active_hermes(5), Err(SettlementError::UnknownChain(5))));
    }

    #[test]
    fn test_channel_address_deterministic_per_identity() {
        let p = provider(Arc::new(InternalChain::new()));
        let hermes = p.active_hermes(137).unwrap();
        let a1 = p.channel_address(137, identity(1), hermes).unwrap();
        assert_eq!(a1, p.channel_address(137, identity(1), hermes).unwrap());
        assert_ne!(a1, p.channel_address(137, identity(2), hermes).unwrap());
        assert_ne!(a1, p.channel_address(1, identity(1), hermes).unwrap());
    }

    #[tokio::test]
    async fn test_registered_status_is_cached() {
        let chain = Arc::new(InternalChain::new());
        let p = provider(chain.clone());
        chain.set_registration_status(137, identity(1), RegistrationStatus::Registered);
        assert!(p.registration_status(137, identity(1)).await.unwrap().is_registered());

        chain.fail_reads(true);
        assert!(p.registration_status(137, identity(1)).await.unwrap().is_registered());
        assert!(matches!(
            p.registration_status(137, identity(2)).await,
            Err(SettlementError::ChainRead(_))
        ));
    }
}
