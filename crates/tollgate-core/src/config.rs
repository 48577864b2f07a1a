use serde::{Deserialize, Serialize};
use std::time::Duration;

use crate::error::CoreError;
use crate::types::{Address, ChainId};

/// Serde helper to serialize/deserialize `std::time::Duration` as seconds (u64).
pub mod duration_secs {
    use serde::{self, Deserialize, Deserializer, Serializer};
    use std::time::Duration;

    pub fn serialize<S>(duration: &Duration, serializer: S) -> Result<S::Ok, S::Error>
    where
        S: Serializer,
    {
        serializer.serialize_u64(duration.as_secs())
    }

    pub fn deserialize<'de, D>(deserializer: D) -> Result<Duration, D::Error>
    where
        D: Deserializer<'de>,
    {
        let secs = u64::deserialize(deserializer)?;
        Ok(Duration::from_secs(secs))
    }
}

/// Payment, invoicing and settlement tunables.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct PaymentsConfig {
    /// Unsettled share of the channel balance that triggers settlement.
    pub hermes_promise_settle_threshold: f64,
    /// How long the settler waits for a submitted settlement to confirm.
    #[serde(with = "duration_secs")]
    pub settlement_timeout: Duration,
    /// How often every known channel is re-checked against the threshold.
    #[serde(with = "duration_secs")]
    pub settlement_recheck_interval: Duration,
    /// Interval between transaction status polls.
    #[serde(with = "duration_secs")]
    pub confirmation_poll_interval: Duration,
    /// Upper bound for a single blockchain read.
    #[serde(with = "duration_secs")]
    pub bc_timeout: Duration,
    /// Provider invoice cadence.
    #[serde(with = "duration_secs")]
    pub provider_invoice_frequency: Duration,
    /// How long a provider waits for a promise before resending the invoice.
    #[serde(with = "duration_secs")]
    pub promise_wait_timeout: Duration,
    /// Consecutive unanswered invoices before the session is torn down.
    pub max_missed_promises: u32,
    /// Largest unpaid value (and largest single promise step) a provider accepts.
    pub max_unpaid_invoice_value: u64,
    /// Underpayment still treated as paying the invoice in full.
    pub shortfall_tolerance: u64,
    /// How long a hermes status lookup is trusted.
    #[serde(with = "duration_secs")]
    pub hermes_status_recheck_interval: Duration,
    /// Attempts to deliver one invoice before the peer is considered gone.
    pub max_invoice_send_attempts: u32,
    #[serde(with = "duration_secs")]
    pub invoice_send_retry_delay: Duration,
    /// Default deadline for blocking settle calls.
    #[serde(with = "duration_secs")]
    pub blocking_settle_timeout: Duration,
    /// Default deadline for a beneficiary change to show up on chain.
    #[serde(with = "duration_secs")]
    pub beneficiary_change_timeout: Duration,
    /// Price per GiB transferred, in token units.
    pub price_per_gib: u64,
    /// Price per minute of session time, in token units.
    pub price_per_minute: u64,
    /// Highest hermes fee, in basis points, a consumer keeps paying under.
    pub max_hermes_fee: u16,
    pub consumer_price_per_gib_lower_bound: u64,
    pub consumer_price_per_gib_upper_bound: u64,
    pub consumer_price_per_minute_lower_bound: u64,
    pub consumer_price_per_minute_upper_bound: u64,
    /// Traffic a consumer pays for beyond what it has counted itself.
    pub consumer_data_leeway_megabytes: u64,
}

impl Default for PaymentsConfig {
    fn default() -> Self {
        Self {
            hermes_promise_settle_threshold: 0.1,
            settlement_timeout: Duration::from_secs(2 * 60 * 60),
            settlement_recheck_interval: Duration::from_secs(60),
            confirmation_poll_interval: Duration::from_secs(5),
            bc_timeout: Duration::from_secs(30),
            provider_invoice_frequency: Duration::from_secs(60),
            promise_wait_timeout: Duration::from_secs(10),
            max_missed_promises: 3,
            max_unpaid_invoice_value: 3_000_000_000_000_000_000,
            shortfall_tolerance: 0,
            hermes_status_recheck_interval: Duration::from_secs(60 * 60),
            max_invoice_send_attempts: 3,
            invoice_send_retry_delay: Duration::from_secs(2),
            blocking_settle_timeout: Duration::from_secs(2 * 60),
            beneficiary_change_timeout: Duration::from_secs(60),
            price_per_gib: 100_000_000_000_000_000,
            price_per_minute: 1_000_000_000_000,
            max_hermes_fee: 1500,
            consumer_price_per_gib_lower_bound: 0,
            consumer_price_per_gib_upper_bound: 500_000_000_000_000_000,
            consumer_price_per_minute_lower_bound: 0,
            consumer_price_per_minute_upper_bound: 10_000_000_000_000,
            consumer_data_leeway_megabytes: 20,
        }
    }
}

fn non_zero(name: &str, value: Duration) -> Result<(), CoreError> {
    if value.is_zero() {
        return Err(CoreError::ValidationError(format!("{} must be greater than zero", name)));
    }
    Ok(())
}

impl PaymentsConfig {
    /// Reject values the invoice and settlement loops cannot run with.
    pub fn validate(&self) -> Result<(), CoreError> {
        let threshold = self.hermes_promise_settle_threshold;
        if !(threshold > 0.0 && threshold <= 1.0) {
            return Err(CoreError::ValidationError(format!(
                "hermes_promise_settle_threshold must be in (0, 1], got {}",
                threshold
            )));
        }
        non_zero("provider_invoice_frequency", self.provider_invoice_frequency)?;
        non_zero("settlement_recheck_interval", self.settlement_recheck_interval)?;
        non_zero("confirmation_poll_interval", self.confirmation_poll_interval)?;
        non_zero("promise_wait_timeout", self.promise_wait_timeout)?;
        non_zero("settlement_timeout", self.settlement_timeout)?;
        non_zero("bc_timeout", self.bc_timeout)?;
        non_zero("blocking_settle_timeout", self.blocking_settle_timeout)?;
        non_zero("beneficiary_change_timeout", self.beneficiary_change_timeout)?;
        if self.max_missed_promises == 0 {
            return Err(CoreError::ValidationError("max_missed_promises must be at least 1".into()));
        }
        if self.max_hermes_fee > 10_000 {
            return Err(CoreError::ValidationError(format!(
                "max_hermes_fee is in basis points and cannot exceed 10000, got {}",
                self.max_hermes_fee
            )));
        }
        if self.consumer_price_per_gib_lower_bound > self.consumer_price_per_gib_upper_bound {
            return Err(CoreError::ValidationError(
                "consumer per-GiB price bounds are inverted".into(),
            ));
        }
        if self.consumer_price_per_minute_lower_bound > self.consumer_price_per_minute_upper_bound {
            return Err(CoreError::ValidationError(
                "consumer per-minute price bounds are inverted".into(),
            ));
        }
        if self.max_invoice_send_attempts == 0 {
            return Err(CoreError::ValidationError(
                "max_invoice_send_attempts must be at least 1".into(),
            ));
        }
        Ok(())
    }
}

/// Identity registration settings.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct TransactorConfig {
    pub max_registration_attempts: u32,
    #[serde(with = "duration_secs")]
    pub registration_retry_delay: Duration,
    /// How long one attempt waits for the status to become `Registered`.
    #[serde(with = "duration_secs")]
    pub registration_poll_timeout: Duration,
    #[serde(with = "duration_secs")]
    pub registration_poll_interval: Duration,
    /// Stake a provider registers with.
    pub provider_registration_stake: u64,
}

impl Default for TransactorConfig {
    fn default() -> Self {
        Self {
            max_registration_attempts: 10,
            registration_retry_delay: Duration::from_secs(3 * 60),
            registration_poll_timeout: Duration::from_secs(60),
            registration_poll_interval: Duration::from_secs(5),
            provider_registration_stake: 0,
        }
    }
}

impl TransactorConfig {
    pub fn validate(&self) -> Result<(), CoreError> {
        if self.max_registration_attempts == 0 {
            return Err(CoreError::ValidationError(
                "max_registration_attempts must be at least 1".into(),
            ));
        }
        non_zero("registration_poll_interval", self.registration_poll_interval)?;
        non_zero("registration_poll_timeout", self.registration_poll_timeout)
    }
}

/// Contract addresses of one supported chain.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ChainDefinition {
    pub chain_id: ChainId,
    pub registry_address: Address,
    pub hermes_id: Address,
    pub channel_impl_address: Address,
    pub myst_address: Address,
}

/// The two chains a node operates on and which one is active.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct ChainsConfig {
    pub active_chain_id: ChainId,
    pub chain1: ChainDefinition,
    pub chain2: ChainDefinition,
}

fn placeholder_address(tag: u8) -> Address {
    let mut bytes = [0u8; 20];
    bytes[0] = 0x7a;
    bytes[19] = tag;
    Address(bytes)
}

impl Default for ChainsConfig {
    fn default() -> Self {
        Self {
            active_chain_id: 137,
            chain1: ChainDefinition {
                chain_id: 1,
                registry_address: placeholder_address(0x11),
                hermes_id: placeholder_address(0x12),
                channel_impl_address: placeholder_address(0x13),
                myst_address: placeholder_address(0x14),
            },
            chain2: ChainDefinition {
                chain_id: 137,
                registry_address: placeholder_address(0x21),
                hermes_id: placeholder_address(0x22),
                channel_impl_address: placeholder_address(0x23),
                myst_address: placeholder_address(0x24),
            },
        }
    }
}

impl ChainsConfig {
    pub fn definitions(&self) -> Vec<ChainDefinition> {
        vec![self.chain1.clone(), self.chain2.clone()]
    }

    pub fn validate(&self) -> Result<(), CoreError> {
        if self.chain1.chain_id == self.chain2.chain_id {
            return Err(CoreError::ValidationError(format!(
                "chain1 and chain2 share chain id {}",
                self.chain1.chain_id
            )));
        }
        if self.active_chain_id != self.chain1.chain_id && self.active_chain_id != self.chain2.chain_id {
            return Err(CoreError::ValidationError(format!(
                "active chain {} is neither chain1 nor chain2",
                self.active_chain_id
            )));
        }
        Ok(())
    }
}
