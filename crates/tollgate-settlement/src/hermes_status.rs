use dashmap::DashMap;
use std::sync::Arc;
use std::time::Duration;
use tokio::time::Instant;

use tollgate_core::types::{ChainId, HermesId};

use crate::error::SettlementError;
use crate::traits::{bounded, ChainReader};
use crate::types::HermesStatus;

/// Cached view of hermes liveness.
///
/// A lookup is trusted for `recheck_interval`; read failures are returned
/// to the caller and never cached.
pub struct HermesStatusChecker {
    reader: Arc<dyn ChainReader>,
    cache: DashMap<(ChainId, HermesId), (HermesStatus, Instant)>,
    recheck_interval: Duration,
    bc_timeout: Duration,
}

impl HermesStatusChecker {
    pub fn new(reader: Arc<dyn ChainReader>, recheck_interval: Duration, bc_timeout: Duration) -> Self {
        Self {
            reader,
            cache: DashMap::new(),
            recheck_interval,
            bc_timeout,
        }
    }

    pub async fn status(&self, chain_id: ChainId, hermes_id: HermesId) -> Result<HermesStatus, SettlementError> {
        if let Some(entry) = self.cache.get(&(chain_id, hermes_id)) {
            let (status, checked_at) = *entry;
            if checked_at.elapsed() < self.recheck_interval {
                return Ok(status);
            }
        }

        let status = bounded(
            self.bc_timeout,
            "hermes status",
            self.reader.hermes_status(chain_id, hermes_id),
        )
        .await?;
        if !status.is_active {
            tracing::warn!(chain_id, hermes = %hermes_id, "hermes is not active");
        }
        self.cache.insert((chain_id, hermes_id), (status, Instant::now()));
        Ok(status)
    }

    pub async fn is_active(&self, chain_id: ChainId, hermes_id: HermesId) -> Result<bool, SettlementError> {
        Ok(self.status(chain_id, hermes_id).await?.is_active)
    }

    pub fn invalidate(&self, chain_id: ChainId, hermes_id: HermesId) {
        self.cache.remove(&(chain_id, hermes_id));
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::adapters::InternalChain;
    use tollgate_core::types::Address;

    const HERMES: Address = Address([2; 20]);

    #[tokio::test(start_paused = true)]
    async fn test_status_cached_until_recheck() {
        let chain = Arc::new(InternalChain::new());
        let checker = HermesStatusChecker::new(chain.clone(), Duration::from_secs(3600), Duration::from_secs(5));
        assert!(checker.is_active(137, HERMES).await.unwrap());

        chain.set_hermes_status(137, HERMES, HermesStatus { is_active: false, fee: 0 });
        assert!(checker.is_active(137, HERMES).await.unwrap());

        tokio::time::advance(Duration::from_secs(3601)).await;
        assert!(!checker.is_active(137, HERMES).await.unwrap());
    }

    #[tokio::test]
    async fn test_invalidate_forces_reload() {
        let chain = Arc::new(InternalChain::new());
        let checker = HermesStatusChecker::new(chain.clone(), Duration::from_secs(3600), Duration::from_secs(5));
        assert!(checker.is_active(1, HERMES).await.unwrap());
        chain.set_hermes_status(1, HERMES, HermesStatus { is_active: false, fee: 10 });
        checker.invalidate(1, HERMES);
        assert_eq!(checker.status(1, HERMES).await.unwrap().fee, 10);
    }

    #[tokio::test]
    async fn test_read_failure_surfaces() {
        let chain = Arc::new(InternalChain::new());
        chain.fail_reads(true);
        let checker = HermesStatusChecker::new(chain, Duration::from_secs(60), Duration::from_secs(5));
        assert!(matches!(
            checker.status(1, HERMES).await,
            Err(SettlementError::ChainRead(_))
        ));
    }
}
