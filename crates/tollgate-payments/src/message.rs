use serde::{Deserialize, Serialize};

use tollgate_core::types::{Invoice, Promise};

use crate::error::PaymentError;

/// Messages exchanged over the peer-to-peer payment channel.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub enum PaymentMessage {
    Invoice(Invoice),
    Promise(Promise),
}

impl PaymentMessage {
    pub fn encode(&self) -> Result<Vec<u8>, PaymentError> {
        Ok(serde_json::to_vec(self)?)
    }

    pub fn decode(bytes: &[u8]) -> Result<Self, PaymentError> {
        Ok(serde_json::from_slice(bytes)?)
    }
}
