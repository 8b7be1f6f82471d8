//! Proxy chains: an optional tunnel layer plus a local SOCKS forward
//! over an authenticated secure-shell session.
//!
//! Each SOCKS version owns a fixed local port, so a v4 chain and a v5
//! chain can run side by side.

pub mod builder;
pub mod shell;
pub mod socks;
pub mod ssh;
pub mod tunnel;

pub use builder::{ChainSettings, ChainState, ProxyChain, ProxyChainBuilder, SocksEndpoint, TunnelLayer};
pub use shell::{DynamicForward, ForwardEvent, ShellConnector, ShellSession, ShellTarget};
pub use ssh::Ssh2Connector;
pub use tunnel::{FixedTunnel, HelperTunnel, NoTunnel, TunnelController};
