//! Process-wide publish/subscribe event bus.
//!
//! Components never call each other's internals; they publish typed events
//! and subscribe to the topics they care about. Delivery is asynchronous and
//! best-effort: there is no ordering guarantee across topics and a slow
//! subscriber may miss events (it is told how many), so every handler must
//! be idempotent and tolerate duplicates or reordering.

use tokio::sync::broadcast;

use crate::types::{
    AgreementId, Amount, ChainId, ChannelKey, Identity, Promise, RegistrationStatus, SettlementHistoryEntry,
};

/// Named topics a subscriber can filter on.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Topic {
    PromiseReceived,
    ChannelBalanceChanged,
    SettlementCompleted,
    SessionEnded,
    RegistrationStatusChanged,
    ServiceStarted,
}

/// Events published on the bus.
#[derive(Debug, Clone)]
pub enum Event {
    /// A provider accepted a promise from a consumer.
    PromiseReceived(PromiseReceived),
    /// A cached channel balance changed.
    ChannelBalanceChanged(ChannelBalanceChanged),
    /// A settlement was confirmed on chain.
    SettlementCompleted(SettlementCompleted),
    /// A paid service session ended.
    SessionEnded(SessionEnded),
    /// An identity's registration status changed.
    RegistrationStatusChanged(RegistrationStatusChanged),
    /// A provider started offering a service.
    ServiceStarted(ServiceStarted),
}

impl Event {
    pub fn topic(&self) -> Topic {
        match self {
            Self::PromiseReceived(_) => Topic::PromiseReceived,
            Self::ChannelBalanceChanged(_) => Topic::ChannelBalanceChanged,
            Self::SettlementCompleted(_) => Topic::SettlementCompleted,
            Self::SessionEnded(_) => Topic::SessionEnded,
            Self::RegistrationStatusChanged(_) => Topic::RegistrationStatusChanged,
            Self::ServiceStarted(_) => Topic::ServiceStarted,
        }
    }
}

#[derive(Debug, Clone)]
pub struct PromiseReceived {
    /// Provider-side channel the promise pays into.
    pub key: ChannelKey,
    /// Agreement the promise is cumulative for.
    pub agreement_id: AgreementId,
    pub promise: Promise,
}

#[derive(Debug, Clone)]
pub struct ChannelBalanceChanged {
    pub key: ChannelKey,
    pub previous: Amount,
    pub current: Amount,
}

#[derive(Debug, Clone)]
pub struct SettlementCompleted {
    pub key: ChannelKey,
    /// Cumulative promise amount now settled on chain.
    pub settled_total: Amount,
    pub entry: SettlementHistoryEntry,
}

#[derive(Debug, Clone)]
pub struct SessionEnded {
    pub session_id: String,
    pub key: ChannelKey,
}

#[derive(Debug, Clone)]
pub struct RegistrationStatusChanged {
    pub chain_id: ChainId,
    pub identity: Identity,
    pub status: RegistrationStatus,
}

#[derive(Debug, Clone)]
pub struct ServiceStarted {
    pub chain_id: ChainId,
    pub provider: Identity,
}

/// Cloneable handle to the shared bus.
#[derive(Debug, Clone)]
pub struct EventBus {
    tx: broadcast::Sender<Event>,
}

impl EventBus {
    /// Create a bus buffering up to `capacity` events per subscriber.
    pub fn new(capacity: usize) -> Self {
        let (tx, _) = broadcast::channel(capacity);
        Self { tx }
    }

    /// Publish an event. Returns the number of subscribers it reached.
    pub fn publish(&self, event: Event) -> usize {
        let topic = event.topic();
        match self.tx.send(event) {
            Ok(n) => {
                tracing::trace!(?topic, receivers = n, "event published");
                n
            }
            Err(_) => {
                tracing::trace!(?topic, "event published with no subscribers");
                0
            }
        }
    }

    /// Subscribe to the given topics.
    pub fn subscribe(&self, topics: &[Topic]) -> EventSubscription {
        EventSubscription {
            rx: self.tx.subscribe(),
            topics: topics.to_vec(),
        }
    }
}

impl Default for EventBus {
    fn default() -> Self {
        Self::new(1024)
    }
}

/// A filtered view of the bus.
pub struct EventSubscription {
    rx: broadcast::Receiver<Event>,
    topics: Vec<Topic>,
}

impl EventSubscription {
    /// Wait for the next event on a subscribed topic.
    ///
    /// Returns `None` once the bus is closed. Lagging is logged and skipped.
    pub async fn recv(&mut self) -> Option<Event> {
        loop {
            match self.rx.recv().await {
                Ok(event) if self.topics.contains(&event.topic()) => return Some(event),
                Ok(_) => continue,
                Err(broadcast::error::RecvError::Lagged(missed)) => {
                    tracing::warn!(missed, "event subscriber lagged");
                }
                Err(broadcast::error::RecvError::Closed) => return None,
            }
        }
    }
}
