//! Tollgate core: ledger primitives, the process-wide event bus, the
//! invoice and settlement state machines, and persistence contracts.

pub mod config;
pub mod error;
pub mod events;
pub mod state_machine;
pub mod storage;
pub mod types;

pub use error::CoreError;
pub use events::{Event, EventBus, EventSubscription, Topic};
pub use state_machine::{
    InvoiceEvent, InvoiceState, InvoiceStateMachine, SettlementEvent, SettlementState,
    SettlementStateMachine,
};
pub use storage::{HistoryBackend, InvoiceStore, MemoryStore, PromiseStore};
pub use types::{
    AgreementId, Address, Amount, BeneficiaryChangeState, BeneficiaryChangeStatus, ChainId, ChannelKey,
    HermesChannel, HermesId, Hashlock, Identity, Invoice, Promise, RegistrationStatus,
    SettlementHistoryEntry, TransactorFees, TxHash, H256,
};
