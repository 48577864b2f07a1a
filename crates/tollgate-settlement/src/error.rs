use std::time::Duration;

use tollgate_core::types::{ChainId, ChannelKey};
use tollgate_core::CoreError;

/// Settlement-layer errors.
#[derive(Debug, thiserror::Error)]
pub enum SettlementError {
    #[error("chain read failed: {0}")]
    ChainRead(String),

    #[error("invalid promise: {0}")]
    InvalidPromise(String),

    #[error("settlement timed out after {0:?}")]
    SettlementTimeout(Duration),

    #[error("settlement failed: {0}")]
    SettlementSubmit(String),

    #[error("registration failed after {attempts} attempts: {cause}")]
    RegistrationFailed { attempts: u32, cause: String },

    #[error("insufficient balance: available {available}, required {required}")]
    InsufficientBalance { available: u128, required: u128 },

    #[error("settlement already in flight for {0}")]
    AlreadyInFlight(ChannelKey),

    #[error("nothing to settle for {0}")]
    NothingToSettle(ChannelKey),

    #[error("unknown chain: {0}")]
    UnknownChain(ChainId),

    #[error("settlement wait cancelled by shutdown")]
    Cancelled,

    #[error("storage error: {0}")]
    Storage(String),

    #[error(transparent)]
    Core(#[from] CoreError),
}

impl SettlementError {
    /// Whether retrying the same call later may succeed.
    pub fn is_transient(&self) -> bool {
        matches!(self, Self::ChainRead(_) | Self::SettlementTimeout(_))
    }
}
