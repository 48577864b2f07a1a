use async_trait::async_trait;
use tokio::sync::mpsc;

use tollgate_core::types::Invoice;

use crate::error::PaymentError;
use crate::message::PaymentMessage;

/// Outbound half of the session's payment channel.
#[async_trait]
pub trait PeerChannel: Send + Sync {
    async fn send_invoice(&self, invoice: &Invoice) -> Result<(), PaymentError>;
}

/// Peer in the same process, reached over an mpsc queue.
#[derive(Debug, Clone)]
pub struct LocalPeer {
    tx: mpsc::Sender<Invoice>,
}

impl LocalPeer {
    pub fn new(tx: mpsc::Sender<Invoice>) -> Self {
        Self { tx }
    }

    pub fn channel(buffer: usize) -> (Self, mpsc::Receiver<Invoice>) {
        let (tx, rx) = mpsc::channel(buffer);
        (Self::new(tx), rx)
    }
}

#[async_trait]
impl PeerChannel for LocalPeer {
    async fn send_invoice(&self, invoice: &Invoice) -> Result<(), PaymentError> {
        self.tx
            .send(invoice.clone())
            .await
            .map_err(|_| PaymentError::ChannelClosed)
    }
}

/// Peer behind a byte pipe carrying encoded [`PaymentMessage`]s.
#[derive(Debug, Clone)]
pub struct WirePeer {
    tx: mpsc::Sender<Vec<u8>>,
}

impl WirePeer {
    pub fn new(tx: mpsc::Sender<Vec<u8>>) -> Self {
        Self { tx }
    }

    pub fn channel(buffer: usize) -> (Self, mpsc::Receiver<Vec<u8>>) {
        let (tx, rx) = mpsc::channel(buffer);
        (Self::new(tx), rx)
    }
}

#[async_trait]
impl PeerChannel for WirePeer {
    async fn send_invoice(&self, invoice: &Invoice) -> Result<(), PaymentError> {
        let bytes = PaymentMessage::Invoice(invoice.clone()).encode()?;
        self.tx.send(bytes).await.map_err(|_| PaymentError::ChannelClosed)
    }
}
