//! Secure-shell capability used by the chain builder.
//!
//! A [`ShellConnector`] opens an authenticated [`ShellSession`]; the session
//! opens a [`DynamicForward`], a local SOCKS listener that relays every
//! CONNECT through the shell server. `ssh2` implementations live in
//! [`super::ssh`]; tests substitute their own.

use std::net::{IpAddr, SocketAddr};
use std::time::Duration;

use async_trait::async_trait;
use tokio::sync::broadcast;

use crate::error::Result;
use crate::model::proxy::SocksVersion;

/// Where and as whom to open a shell session.
#[derive(Clone)]
pub struct ShellTarget {
    pub host: String,
    pub port: u16,
    pub login: String,
    pub password: String,
    /// Local address to bind the outbound socket to (tunnel binding).
    pub bind: Option<IpAddr>,
    pub connect_timeout: Duration,
}

impl std::fmt::Debug for ShellTarget {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ShellTarget")
            .field("host", &self.host)
            .field("port", &self.port)
            .field("login", &self.login)
            .field("bind", &self.bind)
            .field("connect_timeout", &self.connect_timeout)
            .finish_non_exhaustive()
    }
}

/// Activity reported by a running forward.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ForwardEvent {
    /// A client asked to CONNECT to `target`.
    Request { target: String },
    /// A relay attempt failed.
    Error { message: String },
}

#[async_trait]
pub trait ShellConnector: Send + Sync {
    async fn connect(&self, target: &ShellTarget) -> Result<Box<dyn ShellSession>>;
}

#[async_trait]
pub trait ShellSession: Send + Sync {
    /// Start a SOCKS listener on `listen` relaying through this session.
    async fn open_dynamic_forward(
        &self,
        listen: SocketAddr,
        version: SocksVersion,
    ) -> Result<Box<dyn DynamicForward>>;

    /// Remote address of the shell server: where relayed traffic egresses.
    fn peer_addr(&self) -> Option<IpAddr>;

    fn is_connected(&self) -> bool;

    async fn disconnect(&self);
}

#[async_trait]
pub trait DynamicForward: Send + Sync {
    fn local_addr(&self) -> SocketAddr;

    fn events(&self) -> broadcast::Receiver<ForwardEvent>;

    fn is_started(&self) -> bool;

    async fn stop(&self);
}
