use tollgate_core::types::Amount;
use tollgate_core::CoreError;
use tollgate_crypto::CryptoError;
use tollgate_settlement::SettlementError;

/// Errors ending or rejecting part of a paid session.
#[derive(Debug, thiserror::Error)]
pub enum PaymentError {
    #[error("invalid promise: {0}")]
    InvalidPromise(String),

    #[error("invalid invoice: {0}")]
    InvalidInvoice(String),

    #[error("peer unreachable after {attempts} attempts: {cause}")]
    PeerUnreachable { attempts: u32, cause: String },

    #[error("no promise received for {missed} consecutive invoices")]
    PromiseTimeout { missed: u32 },

    #[error("unpaid amount {unpaid} exceeds the limit of {limit}")]
    MaxUnpaidExceeded { unpaid: Amount, limit: Amount },

    #[error("peer channel closed")]
    ChannelClosed,

    #[error("codec error: {0}")]
    Codec(#[from] serde_json::Error),

    #[error(transparent)]
    Core(#[from] CoreError),

    #[error(transparent)]
    Crypto(#[from] CryptoError),

    #[error(transparent)]
    Settlement(#[from] SettlementError),
}

impl PaymentError {
    /// Whether the error ends the session.
    pub fn is_fatal(&self) -> bool {
        !matches!(self, Self::InvalidInvoice(_) | Self::Codec(_))
    }
}
