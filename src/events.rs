//! Publish/subscribe channel for engine notifications.
//!
//! Every component publishes [`EngineEvent`]s into a shared [`EventBus`].
//! Subscribers receive them over a `tokio::sync::broadcast` channel; a slow
//! subscriber lags and drops old events rather than blocking publishers.
//!
//! Protocol clients expose their own [`ClientEvent`] stream. A
//! [`LifecycleRelay`] forwards that stream into the bus for the lifetime of
//! one session and is unsubscribed in the session's cleanup path.

use tokio::sync::broadcast;
use tokio::task::JoinHandle;
use tracing::{debug, trace, warn};

/// Capacity of the bus ring buffer.
const DEFAULT_CAPACITY: usize = 256;

/// Which pool an event refers to.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PoolKind {
    Accounts,
    Proxies,
}

/// Direction of a session, carried by begin/end events.
#[derive(Debug, Clone, Copy, PartialEq, Eq, serde::Serialize)]
#[serde(rename_all = "lowercase")]
pub enum SessionMode {
    Receive,
    Send,
}

/// Notifications emitted by the pool, the chain builder, and sessions.
#[derive(Debug, Clone, PartialEq)]
pub enum EngineEvent {
    Begin { account: String, mode: SessionMode },
    End { account: String, mode: SessionMode, success: bool },
    Connected { account: String, host: String },
    Disconnected { account: String },
    Authenticated { account: String },
    Alert { account: String, message: String },
    MetadataChanged { account: String, detail: String },
    /// Receive session finished; `received` items were stored.
    DeliveryIn { account: String, received: u64 },
    /// Send session finished; `sent` messages left the queue.
    DeliveryOut { account: String, sent: u64 },
    /// One outbound message was accepted by the server.
    DeliverySend { account: String },
    /// Selection found no eligible entry.
    NotFound { pool: PoolKind },
    /// An expired entry was skipped during a selection pass.
    DateExpired { pool: PoolKind, id: String },
    SelectionChanged { pool: PoolKind, id: Option<String> },
    /// The local SOCKS forward accepted a CONNECT request.
    ForwardRequest { proxy: String, target: String },
    ForwardError { proxy: String, message: String },
}

/// Lifecycle notifications raised by a protocol client.
#[derive(Debug, Clone, PartialEq)]
pub enum ClientEvent {
    Connected { host: String },
    Disconnected,
    Authenticated,
    Alert(String),
    MessageSent,
    MetadataChanged(String),
}

/// Cloneable handle to the shared broadcast channel.
#[derive(Debug, Clone)]
pub struct EventBus {
    tx: broadcast::Sender<EngineEvent>,
}

impl Default for EventBus {
    fn default() -> Self {
        Self::new(DEFAULT_CAPACITY)
    }
}

impl EventBus {
    pub fn new(capacity: usize) -> Self {
        let (tx, _) = broadcast::channel(capacity.max(1));
        Self { tx }
    }

    /// Publish an event. Having no subscribers is not an error.
    pub fn publish(&self, event: EngineEvent) {
        trace!(?event, "Publishing event");
        let _ = self.tx.send(event);
    }

    pub fn subscribe(&self) -> broadcast::Receiver<EngineEvent> {
        self.tx.subscribe()
    }

    pub fn subscriber_count(&self) -> usize {
        self.tx.receiver_count()
    }
}

impl ClientEvent {
    fn into_engine_event(self, account: &str) -> EngineEvent {
        let account = account.to_string();
        match self {
            Self::Connected { host } => EngineEvent::Connected { account, host },
            Self::Disconnected => EngineEvent::Disconnected { account },
            Self::Authenticated => EngineEvent::Authenticated { account },
            Self::Alert(message) => EngineEvent::Alert { account, message },
            Self::MessageSent => EngineEvent::DeliverySend { account },
            Self::MetadataChanged(detail) => EngineEvent::MetadataChanged { account, detail },
        }
    }
}

/// Session-scoped subscription forwarding one client's events into the bus.
///
/// Call [`LifecycleRelay::unsubscribe`] on every exit path; dropping the relay
/// without it also stops forwarding.
pub struct LifecycleRelay {
    account: String,
    handle: Option<JoinHandle<()>>,
}

impl LifecycleRelay {
    pub fn spawn(
        mut rx: broadcast::Receiver<ClientEvent>,
        bus: EventBus,
        account: impl Into<String>,
    ) -> Self {
        let account = account.into();
        let task_account = account.clone();
        let handle = tokio::spawn(async move {
            loop {
                match rx.recv().await {
                    Ok(event) => {
                        if let ClientEvent::Alert(ref msg) = event {
                            warn!(account = %task_account, alert = %msg, "Server alert");
                        }
                        bus.publish(event.into_engine_event(&task_account));
                    }
                    Err(broadcast::error::RecvError::Lagged(n)) => {
                        debug!(account = %task_account, skipped = n, "Lifecycle relay lagged");
                    }
                    Err(broadcast::error::RecvError::Closed) => break,
                }
            }
        });
        Self {
            account,
            handle: Some(handle),
        }
    }

    /// Stop forwarding. Idempotent.
    pub fn unsubscribe(&mut self) {
        if let Some(handle) = self.handle.take() {
            handle.abort();
            debug!(account = %self.account, "Lifecycle events unsubscribed");
        }
    }

    pub fn is_subscribed(&self) -> bool {
        self.handle.is_some()
    }
}

impl Drop for LifecycleRelay {
    fn drop(&mut self) {
        self.unsubscribe();
    }
}
