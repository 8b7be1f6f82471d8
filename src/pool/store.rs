//! Durable account store: load/save the entry list of a pool.

use std::path::{Path, PathBuf};

use chrono::Utc;
use serde::de::DeserializeOwned;
use serde::Serialize;
use tracing::debug;

use crate::error::{ChainmailError, Result};

/// Loads and saves a homogeneous list of entries.
pub trait AccountStore<T>: Send + Sync {
    fn load(&self, path: &Path) -> Result<Vec<T>>;
    fn save(&self, path: &Path, entries: &[T]) -> Result<()>;
}

/// Stores entries as a pretty-printed JSON array.
///
/// Saves go through a sibling temp file and a rename so a crash never leaves
/// a truncated store behind.
#[derive(Debug, Clone, Copy, Default)]
pub struct JsonAccountStore;

impl<T> AccountStore<T> for JsonAccountStore
where
    T: Serialize + DeserializeOwned,
{
    fn load(&self, path: &Path) -> Result<Vec<T>> {
        let content = std::fs::read_to_string(path).map_err(|e| ChainmailError::io(path, e))?;
        if content.trim().is_empty() {
            return Ok(Vec::new());
        }
        let entries: Vec<T> =
            serde_json::from_str(&content).map_err(|e| ChainmailError::AccountStore {
                path: path.to_path_buf(),
                reason: e.to_string(),
            })?;
        debug!(path = %path.display(), count = entries.len(), "Loaded account store");
        Ok(entries)
    }

    fn save(&self, path: &Path, entries: &[T]) -> Result<()> {
        if let Some(parent) = path.parent().filter(|p| !p.as_os_str().is_empty()) {
            std::fs::create_dir_all(parent).map_err(|e| ChainmailError::io(parent, e))?;
        }
        let json =
            serde_json::to_string_pretty(entries).map_err(|e| ChainmailError::AccountStore {
                path: path.to_path_buf(),
                reason: e.to_string(),
            })?;
        let tmp = path.with_extension("json.tmp");
        std::fs::write(&tmp, json).map_err(|e| ChainmailError::io(&tmp, e))?;
        std::fs::rename(&tmp, path).map_err(|e| ChainmailError::io(path, e))?;
        debug!(path = %path.display(), count = entries.len(), "Saved account store");
        Ok(())
    }
}

/// Backup location for `path` inside `backup_dir`: `<stem>-<timestamp>.json`.
pub fn backup_path(path: &Path, backup_dir: &Path) -> PathBuf {
    let stem = path
        .file_stem()
        .map(|s| s.to_string_lossy().into_owned())
        .unwrap_or_else(|| "accounts".to_string());
    let stamp = Utc::now().format("%Y%m%d_%H%M%S");
    backup_dir.join(format!("{stem}-{stamp}.json"))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::model::proxy::{ProxyAccount, SocksVersion};

    #[test]
    fn test_save_then_load() {
        let tmp = tempfile::tempdir().unwrap();
        let path = tmp.path().join("nested").join("proxies.json");
        let proxies = vec![
            ProxyAccount::new("10.0.0.1", "a", "pa", SocksVersion::V4),
            ProxyAccount::new("10.0.0.2:2222", "b", "pb", SocksVersion::V5),
        ];

        JsonAccountStore.save(&path, &proxies).unwrap();
        let loaded: Vec<ProxyAccount> = JsonAccountStore.load(&path).unwrap();

        assert_eq!(loaded.len(), 2);
        assert_eq!(loaded[1].host, "10.0.0.2:2222");
        assert_eq!(loaded[0].kind, SocksVersion::V4);
        assert!(!path.with_extension("json.tmp").exists());
    }

    #[test]
    fn test_load_missing_file_errors() {
        let tmp = tempfile::tempdir().unwrap();
        let result: Result<Vec<ProxyAccount>> = JsonAccountStore.load(&tmp.path().join("none.json"));
        assert!(matches!(result, Err(ChainmailError::Io { .. })));
    }

    #[test]
    fn test_load_garbage_errors() {
        let tmp = tempfile::tempdir().unwrap();
        let path = tmp.path().join("bad.json");
        std::fs::write(&path, "{not json").unwrap();
        let result: Result<Vec<ProxyAccount>> = JsonAccountStore.load(&path);
        assert!(matches!(result, Err(ChainmailError::AccountStore { .. })));
    }

    #[test]
    fn test_backup_path_shape() {
        let p = backup_path(Path::new("/data/proxies.json"), Path::new("/backups"));
        let name = p.file_name().unwrap().to_string_lossy().into_owned();
        assert!(name.starts_with("proxies-"));
        assert!(name.ends_with(".json"));
        assert_eq!(p.parent().unwrap(), Path::new("/backups"));
    }
}
