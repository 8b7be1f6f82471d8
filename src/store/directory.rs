//! One `.eml` file per message: `<root>/<account>/<category>/<seq>.eml`.

use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::sync::{Mutex, PoisonError};

use tracing::{debug, info};

use crate::error::{ChainmailError, Result};

use super::{Category, MessageStore, StoreHandle};

const CATEGORIES: [Category; 2] = [Category::Inbox, Category::Bounces];

/// Directory-per-account message store.
///
/// Sequence numbers continue from the highest file already present, so a
/// store reopened after a restart never overwrites earlier messages.
#[derive(Debug)]
pub struct DirectoryStore {
    root: PathBuf,
    next: Mutex<HashMap<(String, Category), u64>>,
}

impl DirectoryStore {
    pub fn new(root: impl Into<PathBuf>) -> Self {
        Self {
            root: root.into(),
            next: Mutex::new(HashMap::new()),
        }
    }

    pub fn root(&self) -> &Path {
        &self.root
    }

    /// Whether `account_key` is currently open.
    pub fn is_open(&self, account_key: &str) -> bool {
        self.next
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .keys()
            .any(|(key, _)| key == account_key)
    }

    fn account_dir(&self, account_key: &str) -> PathBuf {
        self.root.join(sanitize(account_key))
    }
}

impl MessageStore for DirectoryStore {
    fn open(&self, account_key: &str) -> Result<StoreHandle> {
        let location = self.account_dir(account_key);
        let mut next = self.next.lock().unwrap_or_else(PoisonError::into_inner);

        for category in CATEGORIES {
            let dir = location.join(category.as_str());
            std::fs::create_dir_all(&dir).map_err(|e| ChainmailError::io(&dir, e))?;
            let seq = highest_sequence(&dir)? + 1;
            next.insert((account_key.to_string(), category), seq);
        }

        debug!(account = account_key, path = %location.display(), "Message store opened");
        Ok(StoreHandle {
            key: account_key.to_string(),
            location,
        })
    }

    fn add(&self, handle: &StoreHandle, category: Category, raw: &[u8]) -> Result<u64> {
        let mut next = self.next.lock().unwrap_or_else(PoisonError::into_inner);
        let seq = next
            .get_mut(&(handle.key.clone(), category))
            .ok_or_else(|| ChainmailError::Store(format!("account '{}' is not open", handle.key)))?;

        let dir = handle.location.join(category.as_str());
        let path = dir.join(format!("{seq}.eml"));
        let tmp = dir.join(format!(".{seq}.eml.tmp"));
        std::fs::write(&tmp, raw).map_err(|e| ChainmailError::io(&tmp, e))?;
        std::fs::rename(&tmp, &path).map_err(|e| ChainmailError::io(&path, e))?;

        let stored = *seq;
        *seq += 1;
        debug!(account = %handle.key, %category, seq = stored, "Message stored");
        Ok(stored)
    }

    fn count(&self, handle: &StoreHandle, category: Category) -> Result<u64> {
        let dir = handle.location.join(category.as_str());
        Ok(message_files(&dir)?.len() as u64)
    }

    fn close(&self, account_key: &str) {
        let mut next = self.next.lock().unwrap_or_else(PoisonError::into_inner);
        let before = next.len();
        next.retain(|(key, _), _| key != account_key);
        if next.len() != before {
            info!(account = account_key, "Message store closed");
        }
    }
}

/// Sequence numbers of the `<n>.eml` files in `dir`.
fn message_files(dir: &Path) -> Result<Vec<u64>> {
    let entries = match std::fs::read_dir(dir) {
        Ok(entries) => entries,
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(Vec::new()),
        Err(e) => return Err(ChainmailError::io(dir, e)),
    };
    Ok(entries
        .filter_map(|e| e.ok())
        .filter_map(|e| {
            e.file_name()
                .to_str()
                .and_then(|name| name.strip_suffix(".eml"))
                .and_then(|stem| stem.parse().ok())
        })
        .collect())
}

fn highest_sequence(dir: &Path) -> Result<u64> {
    Ok(message_files(dir)?.into_iter().max().unwrap_or(0))
}

/// Make an account key safe to use as a single path component.
fn sanitize(key: &str) -> String {
    let cleaned: String = key
        .chars()
        .map(|c| match c {
            '/' | '\\' | ':' | '*' | '?' | '"' | '<' | '>' | '|' => '_',
            c if c.is_control() => '_',
            c => c,
        })
        .collect();
    match cleaned.trim_matches('.') {
        "" => "_".to_string(),
        _ => cleaned,
    }
}
