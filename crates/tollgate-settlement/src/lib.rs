//! Tollgate settlement layer
//!
//! Tracks provider channels with hermes operators, turns accumulated
//! promises into on-chain settlements, drives identity registration and
//! keeps the settlement history. Blockchain access goes through the
//! [`Transactor`] and [`ChainReader`] capabilities; the
//! [`adapters::internal::InternalChain`] adapter implements both in memory.

pub mod adapters;
pub mod addresses;
pub mod channels;
pub mod error;
pub mod hermes_status;
pub mod history;
pub mod registrar;
pub mod service;
pub mod settler;
pub mod traits;
pub mod types;

pub use addresses::AddressProvider;
pub use channels::HermesChannelRepository;
pub use error::SettlementError;
pub use hermes_status::HermesStatusChecker;
pub use history::{Page, PageRequest, SettlementHistory, SettlementHistoryFilter};
pub use registrar::{ProviderRegistrar, RegisterIdentity};
pub use service::SettlementService;
pub use settler::{HermesPromiseSettler, SettlementOutcome, SettlerConfig};
pub use traits::{ChainReader, Transactor};
pub use types::{
    HermesStatus, OnChainChannel, RegistrationRequest, SettlementRequest, TxStatus,
};
