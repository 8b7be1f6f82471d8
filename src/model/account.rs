//! Mail accounts and their per-protocol endpoints.

use serde::{Deserialize, Serialize};

use crate::error::{ChainmailError, Result};
use crate::pool::PoolEntry;

use super::address::EmailAddress;

/// Transport security requested for a protocol endpoint.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Security {
    None,
    StartTls,
    #[default]
    Tls,
}

/// Host, port, and security of one protocol endpoint.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Endpoint {
    pub host: String,
    pub port: u16,
    #[serde(default)]
    pub security: Security,
}

impl Endpoint {
    pub fn new(host: impl Into<String>, port: u16, security: Security) -> Self {
        Self {
            host: host.into(),
            port,
            security,
        }
    }

    /// An endpoint is usable once it names a host and a non-zero port.
    pub fn is_complete(&self) -> bool {
        !self.host.trim().is_empty() && self.port != 0
    }
}

/// Mailbox protocol used on the receive path.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ReceiveProtocol {
    #[default]
    Imap,
    Pop3,
}

/// Soft per-account exclusion marker, set for the duration of a session.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum CurrentAction {
    #[default]
    None,
    Receiving,
    Sending,
}

/// A mail account as loaded from the account store.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct MailAccount {
    /// Login name used for authentication (often the address itself).
    pub login: String,
    /// Explicit address; derived from `login` when absent.
    #[serde(default)]
    pub email: Option<String>,
    #[serde(default)]
    pub display_name: Option<String>,
    #[serde(default)]
    pub password: Option<String>,
    #[serde(default = "default_enabled")]
    pub enabled: bool,
    #[serde(default)]
    pub receive_protocol: ReceiveProtocol,
    #[serde(default)]
    pub imap: Option<Endpoint>,
    #[serde(default)]
    pub pop3: Option<Endpoint>,
    #[serde(default)]
    pub smtp: Option<Endpoint>,
    /// Reply-To stamped on outbound messages that carry none.
    #[serde(default)]
    pub reply_to: Option<String>,
    /// Not persisted: reset to `None` on every load.
    #[serde(skip)]
    pub current_action: CurrentAction,
}

fn default_enabled() -> bool {
    true
}

impl MailAccount {
    pub fn new(login: impl Into<String>, password: impl Into<String>) -> Self {
        Self {
            login: login.into(),
            email: None,
            display_name: None,
            password: Some(password.into()),
            enabled: true,
            receive_protocol: ReceiveProtocol::Imap,
            imap: None,
            pop3: None,
            smtp: None,
            reply_to: None,
            current_action: CurrentAction::None,
        }
    }

    /// The account's address: `email` if set, else `login` when it looks like
    /// an address, else `login@<smtp host>` with a leading `smtp.` dropped.
    pub fn address(&self) -> String {
        if let Some(email) = self.email.as_deref().filter(|e| !e.trim().is_empty()) {
            return email.trim().to_string();
        }
        if self.login.contains('@') {
            return self.login.clone();
        }
        match &self.smtp {
            Some(ep) if ep.is_complete() => {
                let domain = ep.host.strip_prefix("smtp.").unwrap_or(&ep.host);
                format!("{}@{}", self.login, domain)
            }
            _ => self.login.clone(),
        }
    }

    /// The `From:` identity used when an outbound message carries none.
    pub fn sender(&self) -> EmailAddress {
        EmailAddress {
            display_name: self.display_name.clone().unwrap_or_default(),
            address: self.address(),
        }
    }

    /// Directory-safe key identifying this account in the message store.
    pub fn store_key(&self) -> String {
        self.address()
            .chars()
            .map(|c| {
                if c.is_alphanumeric() || matches!(c, '-' | '.' | '_' | '@') {
                    c
                } else {
                    '_'
                }
            })
            .collect()
    }

    fn has_credentials(&self) -> bool {
        !self.login.trim().is_empty()
            && self
                .password
                .as_deref()
                .is_some_and(|p| !p.is_empty())
    }

    /// Check that the configured receive protocol has a complete endpoint and
    /// credentials.
    pub fn require_receive(&self) -> Result<&Endpoint> {
        let (endpoint, label) = match self.receive_protocol {
            ReceiveProtocol::Imap => (self.imap.as_ref(), "imap endpoint"),
            ReceiveProtocol::Pop3 => (self.pop3.as_ref(), "pop3 endpoint"),
        };
        self.require(endpoint, label)
    }

    /// Check that the SMTP endpoint and credentials are complete.
    pub fn require_send(&self) -> Result<&Endpoint> {
        self.require(self.smtp.as_ref(), "smtp endpoint")
    }

    fn require<'a>(&self, endpoint: Option<&'a Endpoint>, label: &str) -> Result<&'a Endpoint> {
        let endpoint = endpoint.filter(|ep| ep.is_complete()).ok_or_else(|| {
            ChainmailError::ConfigurationIncomplete {
                account: self.login.clone(),
                missing: label.to_string(),
            }
        })?;
        if !self.has_credentials() {
            return Err(ChainmailError::ConfigurationIncomplete {
                account: self.login.clone(),
                missing: "credentials".to_string(),
            });
        }
        Ok(endpoint)
    }
}

impl PoolEntry for MailAccount {
    type Kind = ReceiveProtocol;

    fn id(&self) -> &str {
        &self.login
    }

    fn is_enabled(&self) -> bool {
        self.enabled
    }

    fn kind(&self) -> ReceiveProtocol {
        self.receive_protocol
    }

    fn identities(&self) -> Vec<String> {
        vec![self.login.clone(), self.address()]
    }
}
