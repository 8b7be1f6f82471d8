//! Tunnel awareness: whether a VPN-style tunnel is up and which local
//! address it assigned.
//!
//! The engine never drives the tunnel itself; platform adapters implement
//! [`TunnelController`] and the chain builder only reads from it.

use std::net::IpAddr;
use std::process::Stdio;
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use tokio::process::Command;
use tracing::{debug, warn};

use crate::config::ChainConfig;

/// Read-only view of an externally managed tunnel.
#[async_trait]
pub trait TunnelController: Send + Sync {
    async fn is_active(&self) -> bool;

    /// Address the tunnel assigned to this host, if it is up.
    async fn local_endpoint(&self) -> Option<IpAddr>;
}

/// No tunnel: every chain goes out over the default route.
#[derive(Debug, Clone, Copy, Default)]
pub struct NoTunnel;

#[async_trait]
impl TunnelController for NoTunnel {
    async fn is_active(&self) -> bool {
        false
    }

    async fn local_endpoint(&self) -> Option<IpAddr> {
        None
    }
}

/// A tunnel that is always up at a known address.
#[derive(Debug, Clone, Copy)]
pub struct FixedTunnel {
    address: IpAddr,
}

impl FixedTunnel {
    pub fn new(address: IpAddr) -> Self {
        Self { address }
    }
}

#[async_trait]
impl TunnelController for FixedTunnel {
    async fn is_active(&self) -> bool {
        true
    }

    async fn local_endpoint(&self) -> Option<IpAddr> {
        Some(self.address)
    }
}

/// Asks an external route helper for the tunnel address.
///
/// The helper is expected to print the address on stdout and exit 0 while
/// the tunnel is up. Each invocation is bounded by `timeout`; a helper that
/// overruns is killed and the tunnel is reported down.
#[derive(Debug, Clone)]
pub struct HelperTunnel {
    program: String,
    args: Vec<String>,
    timeout: Duration,
}

impl HelperTunnel {
    pub fn new(program: impl Into<String>, args: Vec<String>, timeout: Duration) -> Self {
        Self {
            program: program.into(),
            args,
            timeout,
        }
    }

    async fn query(&self) -> Option<IpAddr> {
        let child = Command::new(&self.program)
            .args(&self.args)
            .stdin(Stdio::null())
            .stdout(Stdio::piped())
            .stderr(Stdio::null())
            .kill_on_drop(true)
            .spawn();
        let child = match child {
            Ok(c) => c,
            Err(e) => {
                warn!(program = %self.program, error = %e, "Failed to start tunnel helper");
                return None;
            }
        };

        let output = match tokio::time::timeout(self.timeout, child.wait_with_output()).await {
            Ok(Ok(output)) => output,
            Ok(Err(e)) => {
                warn!(program = %self.program, error = %e, "Tunnel helper failed");
                return None;
            }
            Err(_) => {
                warn!(program = %self.program, timeout = ?self.timeout, "Tunnel helper timed out");
                return None;
            }
        };

        if !output.status.success() {
            debug!(program = %self.program, status = %output.status, "Tunnel helper reports no tunnel");
            return None;
        }
        parse_helper_output(&String::from_utf8_lossy(&output.stdout))
    }
}

#[async_trait]
impl TunnelController for HelperTunnel {
    async fn is_active(&self) -> bool {
        self.query().await.is_some()
    }

    async fn local_endpoint(&self) -> Option<IpAddr> {
        self.query().await
    }
}

/// First whitespace-separated token that parses as an IP address.
fn parse_helper_output(stdout: &str) -> Option<IpAddr> {
    stdout
        .split_whitespace()
        .find_map(|token| token.trim_matches(|c| c == '[' || c == ']').parse().ok())
}

/// Pick the tunnel adapter described by the `[chain]` section.
///
/// A helper command wins over a fixed address; neither means no tunnel.
pub fn from_config(config: &ChainConfig) -> Arc<dyn TunnelController> {
    if let Some((program, args)) = config
        .tunnel_helper
        .as_ref()
        .and_then(|cmd| cmd.split_first())
    {
        return Arc::new(HelperTunnel::new(
            program.clone(),
            args.to_vec(),
            config.helper_timeout(),
        ));
    }
    if let Some(address) = config.tunnel_address.as_deref() {
        match address.trim().parse() {
            Ok(ip) => return Arc::new(FixedTunnel::new(ip)),
            Err(_) => warn!(address, "Ignoring unparseable tunnel address"),
        }
    }
    Arc::new(NoTunnel)
}
