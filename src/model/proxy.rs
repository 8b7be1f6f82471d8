//! Proxy accounts: secure-shell hosts used as SOCKS forward endpoints.

use std::fmt;
use std::str::FromStr;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::pool::PoolEntry;

/// SOCKS protocol version exposed by the local forward.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum SocksVersion {
    V4,
    #[default]
    V5,
}

impl SocksVersion {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::V4 => "v4",
            Self::V5 => "v5",
        }
    }
}

impl fmt::Display for SocksVersion {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for SocksVersion {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_ascii_lowercase().as_str() {
            "v4" | "4" | "socks4" => Ok(Self::V4),
            "v5" | "5" | "socks5" => Ok(Self::V5),
            other => Err(format!("unknown SOCKS version '{other}' (expected v4 or v5)")),
        }
    }
}

/// A proxy account: where to open the shell session and how to authenticate.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ProxyAccount {
    /// `host` or `host:port` of the secure-shell server.
    pub host: String,
    pub login: String,
    #[serde(default)]
    pub password: String,
    #[serde(default)]
    pub kind: SocksVersion,
    #[serde(default = "default_enabled")]
    pub enabled: bool,
    /// Paid/rented proxies stop being eligible after this instant.
    #[serde(default)]
    pub expires_at: Option<DateTime<Utc>>,
    /// Free-form origin label (e.g. country code) shown in listings.
    #[serde(default)]
    pub label: Option<String>,
}

fn default_enabled() -> bool {
    true
}

impl ProxyAccount {
    pub fn new(
        host: impl Into<String>,
        login: impl Into<String>,
        password: impl Into<String>,
        kind: SocksVersion,
    ) -> Self {
        Self {
            host: host.into(),
            login: login.into(),
            password: password.into(),
            kind,
            enabled: true,
            expires_at: None,
            label: None,
        }
    }

    /// Split `host` into hostname and port, falling back to `default_port`.
    pub fn address(&self, default_port: u16) -> (String, u16) {
        let host = self.host.trim();
        if let Some(rest) = host.strip_prefix('[') {
            // [v6]:port
            if let Some((addr, tail)) = rest.split_once(']') {
                let port = tail
                    .strip_prefix(':')
                    .and_then(|p| p.parse().ok())
                    .unwrap_or(default_port);
                return (addr.to_string(), port);
            }
        }
        match host.rsplit_once(':') {
            Some((name, port)) if !name.contains(':') => match port.parse() {
                Ok(port) => (name.to_string(), port),
                Err(_) => (host.to_string(), default_port),
            },
            _ => (host.to_string(), default_port),
        }
    }

    pub fn has_credentials(&self) -> bool {
        !self.host.trim().is_empty() && !self.login.trim().is_empty() && !self.password.is_empty()
    }

    /// Pool identity: `login@host`.
    pub fn key(&self) -> String {
        format!("{}@{}", self.login, self.host)
    }
}

impl PoolEntry for ProxyAccount {
    type Kind = SocksVersion;

    fn id(&self) -> &str {
        &self.host
    }

    fn is_enabled(&self) -> bool {
        self.enabled
    }

    fn is_expired(&self, now: DateTime<Utc>) -> bool {
        self.expires_at.is_some_and(|at| at <= now)
    }

    fn kind(&self) -> SocksVersion {
        self.kind
    }

    fn identities(&self) -> Vec<String> {
        vec![self.host.clone(), self.key()]
    }
}
