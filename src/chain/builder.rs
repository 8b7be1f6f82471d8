//! Builds and tears down proxy chains.

use std::net::{IpAddr, Ipv4Addr, SocketAddr};
use std::sync::Arc;
use std::time::Duration;

use tokio::sync::broadcast;
use tokio::task::JoinHandle;
use tracing::{debug, error, info, warn};

use crate::config::ChainConfig;
use crate::error::Result;
use crate::events::{EngineEvent, EventBus};
use crate::model::proxy::{ProxyAccount, SocksVersion};

use super::shell::{DynamicForward, ForwardEvent, ShellConnector, ShellSession, ShellTarget};
use super::tunnel::TunnelController;

/// Lifecycle of a [`ProxyChain`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ChainState {
    Created,
    Started,
    Stopping,
    Disposed,
}

/// The local SOCKS listener a protocol client connects through.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct SocksEndpoint {
    pub version: SocksVersion,
    pub host: IpAddr,
    pub port: u16,
}

impl SocksEndpoint {
    pub fn socket_addr(&self) -> SocketAddr {
        SocketAddr::new(self.host, self.port)
    }
}

/// Tunnel layer observed when the chain was built.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct TunnelLayer {
    pub local: IpAddr,
}

/// Builder knobs taken from `[chain]`.
#[derive(Debug, Clone)]
pub struct ChainSettings {
    pub ssh_port: u16,
    pub socks4_port: u16,
    pub socks5_port: u16,
    pub bind_to_tunnel: bool,
    pub connect_timeout: Duration,
}

impl ChainSettings {
    pub fn socks_port(&self, version: SocksVersion) -> u16 {
        match version {
            SocksVersion::V4 => self.socks4_port,
            SocksVersion::V5 => self.socks5_port,
        }
    }
}

impl From<&ChainConfig> for ChainSettings {
    fn from(config: &ChainConfig) -> Self {
        Self {
            ssh_port: config.ssh_port,
            socks4_port: config.socks_port(SocksVersion::V4),
            socks5_port: config.socks_port(SocksVersion::V5),
            bind_to_tunnel: config.bind_to_tunnel,
            connect_timeout: config.connect_timeout(),
        }
    }
}

impl Default for ChainSettings {
    fn default() -> Self {
        Self::from(&ChainConfig::default())
    }
}

// ── Builder ─────────────────────────────────────────────────────

pub struct ProxyChainBuilder {
    connector: Arc<dyn ShellConnector>,
    tunnel: Arc<dyn TunnelController>,
    settings: ChainSettings,
    events: EventBus,
}

impl ProxyChainBuilder {
    pub fn new(
        connector: Arc<dyn ShellConnector>,
        tunnel: Arc<dyn TunnelController>,
        settings: ChainSettings,
        events: EventBus,
    ) -> Self {
        Self {
            connector,
            tunnel,
            settings,
            events,
        }
    }

    pub fn settings(&self) -> &ChainSettings {
        &self.settings
    }

    /// Build a chain through `proxy`, or `None` if any layer fails.
    ///
    /// A failed build leaves `proxy` untouched: it stays eligible for the
    /// next selection.
    pub async fn build(&self, proxy: &ProxyAccount) -> Option<ProxyChain> {
        match self.try_build(proxy).await {
            Ok(chain) => Some(chain),
            Err(e) => {
                error!(proxy = %proxy.key(), kind = %proxy.kind, error = %e, "Failed to build proxy chain");
                None
            }
        }
    }

    async fn try_build(&self, proxy: &ProxyAccount) -> Result<ProxyChain> {
        let tunnel = if self.tunnel.is_active().await {
            self.tunnel.local_endpoint().await.map(|local| TunnelLayer { local })
        } else {
            None
        };
        if let Some(layer) = tunnel {
            debug!(local = %layer.local, "Tunnel is up");
        }

        let bind = tunnel
            .filter(|_| self.settings.bind_to_tunnel)
            .map(|layer| layer.local);
        let (host, port) = proxy.address(self.settings.ssh_port);
        let target = ShellTarget {
            host,
            port,
            login: proxy.login.clone(),
            password: proxy.password.clone(),
            bind,
            connect_timeout: self.settings.connect_timeout,
        };

        let listen = SocksEndpoint {
            version: proxy.kind,
            host: bind.unwrap_or(IpAddr::V4(Ipv4Addr::LOCALHOST)),
            port: self.settings.socks_port(proxy.kind),
        };
        let mut chain = ProxyChain::new(proxy, tunnel, listen);

        let session = self.connector.connect(&target).await?;
        let forward = match session
            .open_dynamic_forward(chain.socks.socket_addr(), proxy.kind)
            .await
        {
            Ok(forward) => forward,
            Err(e) => {
                // Never leave a half-built chain behind.
                session.disconnect().await;
                return Err(e);
            }
        };

        let relay = spawn_forward_relay(forward.events(), self.events.clone(), proxy.key());
        chain.start(session, forward, relay);
        info!(
            proxy = %proxy.key(),
            socks = %chain.socks.socket_addr(),
            kind = %proxy.kind,
            tunnel = ?chain.tunnel.map(|t| t.local),
            "Proxy chain started"
        );
        Ok(chain)
    }
}

fn spawn_forward_relay(
    mut rx: broadcast::Receiver<ForwardEvent>,
    bus: EventBus,
    proxy: String,
) -> JoinHandle<()> {
    tokio::spawn(async move {
        loop {
            match rx.recv().await {
                Ok(ForwardEvent::Request { target }) => bus.publish(EngineEvent::ForwardRequest {
                    proxy: proxy.clone(),
                    target,
                }),
                Ok(ForwardEvent::Error { message }) => bus.publish(EngineEvent::ForwardError {
                    proxy: proxy.clone(),
                    message,
                }),
                Err(broadcast::error::RecvError::Lagged(_)) => {}
                Err(broadcast::error::RecvError::Closed) => break,
            }
        }
    })
}

// ── Chain ───────────────────────────────────────────────────────

struct Layers {
    session: Box<dyn ShellSession>,
    forward: Box<dyn DynamicForward>,
    relay: JoinHandle<()>,
}

impl Layers {
    async fn teardown(self) {
        self.relay.abort();
        if self.forward.is_started() {
            self.forward.stop().await;
        }
        if self.session.is_connected() {
            self.session.disconnect().await;
        }
    }
}

/// An optional tunnel layer plus a SOCKS forward over a shell session.
///
/// Owned by the session that built it. Call [`ProxyChain::dispose`] when
/// done; a chain dropped without it is torn down in the background.
pub struct ProxyChain {
    proxy: String,
    state: ChainState,
    socks: SocksEndpoint,
    tunnel: Option<TunnelLayer>,
    egress: Option<IpAddr>,
    layers: Option<Layers>,
}

impl ProxyChain {
    fn new(proxy: &ProxyAccount, tunnel: Option<TunnelLayer>, socks: SocksEndpoint) -> Self {
        Self {
            proxy: proxy.key(),
            state: ChainState::Created,
            socks,
            tunnel,
            egress: None,
            layers: None,
        }
    }

    fn start(
        &mut self,
        session: Box<dyn ShellSession>,
        forward: Box<dyn DynamicForward>,
        relay: JoinHandle<()>,
    ) {
        self.egress = session.peer_addr();
        self.layers = Some(Layers {
            session,
            forward,
            relay,
        });
        self.state = ChainState::Started;
    }

    pub fn state(&self) -> ChainState {
        self.state
    }

    pub fn proxy(&self) -> &str {
        &self.proxy
    }

    pub fn socks(&self) -> SocksEndpoint {
        self.socks
    }

    pub fn tunnel(&self) -> Option<TunnelLayer> {
        self.tunnel
    }

    /// Public address relayed traffic leaves from (the shell server).
    pub fn egress_ip(&self) -> Option<IpAddr> {
        self.egress
    }

    /// Stop the forward and disconnect the session. Idempotent.
    pub async fn dispose(&mut self) {
        if self.state == ChainState::Disposed {
            return;
        }
        self.state = ChainState::Stopping;
        if let Some(layers) = self.layers.take() {
            layers.teardown().await;
        }
        self.state = ChainState::Disposed;
        debug!(proxy = %self.proxy, "Proxy chain disposed");
    }
}

impl Drop for ProxyChain {
    fn drop(&mut self) {
        let Some(layers) = self.layers.take() else {
            return;
        };
        match tokio::runtime::Handle::try_current() {
            Ok(handle) => {
                debug!(proxy = %self.proxy, "Tearing down undisposed chain in background");
                handle.spawn(layers.teardown());
            }
            Err(_) => {
                warn!(proxy = %self.proxy, "Proxy chain dropped outside a runtime; layers not torn down");
                layers.relay.abort();
            }
        }
    }
}

impl std::fmt::Debug for ProxyChain {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ProxyChain")
            .field("proxy", &self.proxy)
            .field("state", &self.state)
            .field("socks", &self.socks)
            .field("tunnel", &self.tunnel)
            .field("egress", &self.egress)
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn loopback(version: SocksVersion, port: u16) -> SocksEndpoint {
        SocksEndpoint {
            version,
            host: IpAddr::V4(Ipv4Addr::LOCALHOST),
            port,
        }
    }

    #[test]
    fn test_settings_from_config() {
        let config = ChainConfig {
            socks4_port: 4000,
            socks5_port: 5000,
            ..ChainConfig::default()
        };
        let settings = ChainSettings::from(&config);
        assert_eq!(settings.socks_port(SocksVersion::V4), 4000);
        assert_eq!(settings.socks_port(SocksVersion::V5), 5000);
        assert_eq!(settings.ssh_port, 22);
    }

    #[test]
    fn test_default_ports_are_distinct() {
        let settings = ChainSettings::default();
        assert_ne!(
            settings.socks_port(SocksVersion::V4),
            settings.socks_port(SocksVersion::V5)
        );
    }

    #[test]
    fn test_new_chain_targets_loopback() {
        let proxy = ProxyAccount::new("h", "u", "p", SocksVersion::V4);
        let chain = ProxyChain::new(&proxy, None, loopback(SocksVersion::V4, 1084));
        assert_eq!(chain.state(), ChainState::Created);
        assert_eq!(
            chain.socks().socket_addr(),
            "127.0.0.1:1084".parse::<SocketAddr>().unwrap()
        );
        assert_eq!(chain.socks().version, SocksVersion::V4);
    }

    #[tokio::test]
    async fn test_dispose_unstarted_chain() {
        let proxy = ProxyAccount::new("h", "u", "p", SocksVersion::V5);
        let mut chain = ProxyChain::new(&proxy, None, loopback(SocksVersion::V5, 1085));
        chain.dispose().await;
        chain.dispose().await;
        assert_eq!(chain.state(), ChainState::Disposed);
    }
}
