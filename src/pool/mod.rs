//! Account and proxy pools: selection, rotation, and expiry over a list of
//! account-like entries.
//!
//! The pool is generic over a small capability contract ([`PoolEntry`]);
//! per-kind validation is supplied as an [`Eligibility`] strategy value.

pub mod selection;
pub mod shared;
pub mod store;

use std::fmt;

use chrono::{DateTime, Utc};

use crate::model::proxy::ProxyAccount;

pub use selection::AccountPool;
pub use shared::SharedPool;
pub use store::{AccountStore, JsonAccountStore};

/// Minimal contract an entry must satisfy to live in an [`AccountPool`].
pub trait PoolEntry: Clone + Send + Sync + 'static {
    /// Sub-type used to filter selection (e.g. SOCKS version).
    type Kind: Copy + PartialEq + fmt::Debug + Send + Sync;

    /// Name used by `select_by_name` and in events.
    fn id(&self) -> &str;

    fn is_enabled(&self) -> bool;

    /// Entries without an expiry never expire.
    fn is_expired(&self, _now: DateTime<Utc>) -> bool {
        false
    }

    fn kind(&self) -> Self::Kind;

    /// Every string `find` should match (login, derived address, ...).
    fn identities(&self) -> Vec<String> {
        vec![self.id().to_string()]
    }
}

/// Per-kind selection rule layered on top of `enabled ∧ ¬expired`.
pub trait Eligibility<T>: Send + Sync {
    fn admits(&self, entry: &T) -> bool;
}

impl<T, F> Eligibility<T> for F
where
    F: Fn(&T) -> bool + Send + Sync,
{
    fn admits(&self, entry: &T) -> bool {
        self(entry)
    }
}

/// Admits every enabled, unexpired entry.
#[derive(Debug, Clone, Copy, Default)]
pub struct AnyEntry;

impl<T> Eligibility<T> for AnyEntry {
    fn admits(&self, _entry: &T) -> bool {
        true
    }
}

/// Admits proxies that carry a host, login, and password.
#[derive(Debug, Clone, Copy, Default)]
pub struct ProxyCredentials;

impl Eligibility<ProxyAccount> for ProxyCredentials {
    fn admits(&self, entry: &ProxyAccount) -> bool {
        entry.has_credentials()
    }
}
