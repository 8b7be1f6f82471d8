//! Protocol-client capabilities driven by the session executor.
//!
//! The engine does not speak IMAP, POP3, or SMTP itself. A [`ClientFactory`]
//! hands out clients already routed through a chain's SOCKS endpoint; the
//! executor only sequences connect, authenticate, the protocol operations,
//! and disconnect.

use async_trait::async_trait;
use tokio::sync::broadcast;

use crate::chain::SocksEndpoint;
use crate::error::Result;
use crate::events::ClientEvent;
use crate::model::account::{Endpoint, ReceiveProtocol};

use super::token::SessionToken;

/// How the mailbox is opened.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum MailboxAccess {
    ReadOnly,
    /// Needed to mark messages deleted.
    ReadWrite,
}

/// Counts reported when the mailbox is opened.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct MailboxStatus {
    pub total: u64,
    pub recent: u64,
}

/// A message ready for submission, with its envelope.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct OutboundMessage {
    pub from: String,
    pub recipients: Vec<String>,
    pub raw: Vec<u8>,
}

/// Connection lifecycle shared by every protocol.
#[async_trait]
pub trait ProtocolClient: Send {
    async fn connect(&mut self, endpoint: &Endpoint, token: &SessionToken) -> Result<()>;

    async fn authenticate(
        &mut self,
        login: &str,
        password: &str,
        token: &SessionToken,
    ) -> Result<()>;

    /// Close the connection, saying goodbye first when `quit` is set.
    async fn disconnect(&mut self, quit: bool);

    fn is_connected(&self) -> bool;

    /// Lifecycle notifications (connected, authenticated, alerts, ...).
    fn events(&self) -> broadcast::Receiver<ClientEvent>;
}

/// IMAP or POP3 mailbox access. Indices are zero-based.
#[async_trait]
pub trait MailboxClient: ProtocolClient {
    async fn open_inbox(&mut self, access: MailboxAccess) -> Result<MailboxStatus>;

    async fn fetch(&mut self, index: u64) -> Result<Vec<u8>>;

    async fn mark_deleted(&mut self, index: u64) -> Result<()>;

    async fn expunge(&mut self) -> Result<()>;
}

/// SMTP submission.
#[async_trait]
pub trait SubmissionClient: ProtocolClient {
    async fn send(&mut self, message: &OutboundMessage) -> Result<()>;
}

/// Creates clients whose connections go through `socks`.
pub trait ClientFactory: Send + Sync {
    fn mailbox(
        &self,
        protocol: ReceiveProtocol,
        socks: SocksEndpoint,
    ) -> Result<Box<dyn MailboxClient>>;

    fn submission(&self, socks: SocksEndpoint) -> Result<Box<dyn SubmissionClient>>;
}
