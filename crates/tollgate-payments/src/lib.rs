//! Tollgate payments
//!
//! The provider side of a paid session ([`PaymentEngine`]) bills the
//! consumer with invoices and collects signed cumulative promises; the
//! consumer side ([`InvoicePayer`]) answers those invoices.

pub mod engine;
pub mod error;
pub mod message;
pub mod payer;
pub mod peer;
pub mod pricing;

pub use engine::{EngineConfig, PaymentEngine, SessionInfo, SessionSummary};
pub use error::PaymentError;
pub use message::PaymentMessage;
pub use payer::{InvoicePayer, PayerConfig};
pub use peer::{LocalPeer, PeerChannel, WirePeer};
pub use pricing::{CountingMeter, Price, PriceBounds, UsageMeter};
