//! Message store: where received messages land, per account and category.

pub mod directory;

use std::fmt;
use std::path::PathBuf;

use crate::error::Result;

pub use directory::DirectoryStore;

/// Folder a received message is filed under.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Category {
    Inbox,
    Bounces,
}

impl Category {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Inbox => "inbox",
            Self::Bounces => "bounces",
        }
    }
}

impl fmt::Display for Category {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// An open account mailbox in a [`MessageStore`].
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct StoreHandle {
    pub key: String,
    pub location: PathBuf,
}

/// Persists received messages.
pub trait MessageStore: Send + Sync {
    fn open(&self, account_key: &str) -> Result<StoreHandle>;

    /// File `raw` under `category` at the next sequence number, returned.
    fn add(&self, handle: &StoreHandle, category: Category, raw: &[u8]) -> Result<u64>;

    /// Number of messages currently filed under `category`.
    fn count(&self, handle: &StoreHandle, category: Category) -> Result<u64>;

    /// Release the account. Closing an account that is not open is a no-op.
    fn close(&self, account_key: &str);
}
