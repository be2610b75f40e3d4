//! Persisted set of forbidden subtrees.
//!
//! Entries are stored verbatim as the admin typed them; matching normalizes
//! both sides (backslash to slash, trailing slash stripped, lowercased) and
//! blocks a target when an entry equals it or is a `/`-prefix of it.

use std::io;
use std::path::{Path, PathBuf};
use tokio::sync::Mutex;
use tracing::warn;

use crate::atomic::write_atomic;

#[derive(Debug)]
pub struct BlockList {
    path: PathBuf,
    entries: Mutex<Vec<String>>,
}

impl BlockList {
    /// Load `block.json` from the state directory, tolerating a missing or
    /// unreadable file by starting empty.
    pub async fn load(state_dir: &Path) -> Self {
        let path = state_dir.join(crate::config::BLOCK_FILE);
        let entries = match tokio::fs::read(&path).await {
            Ok(bytes) => match serde_json::from_slice::<Vec<String>>(&bytes) {
                Ok(entries) => entries,
                Err(err) => {
                    warn!(error = %err, "block list unreadable, starting empty");
                    Vec::new()
                }
            },
            Err(_) => Vec::new(),
        };
        Self {
            path,
            entries: Mutex::new(entries),
        }
    }

    /// Whether any list entry covers the target. Both the absolute and the
    /// share-relative form of the target are tested so entries can be
    /// written either way.
    pub async fn is_blocked(&self, absolute: &Path, relative: &str) -> bool {
        let abs = normalize(&absolute.to_string_lossy());
        let rel = normalize(relative);
        let entries = self.entries.lock().await;
        entries.iter().any(|entry| {
            let entry = normalize(entry);
            if entry.is_empty() {
                return false;
            }
            covers(&entry, &abs) || covers(&entry, &rel)
        })
    }

    pub async fn add(&self, raw: String) -> io::Result<()> {
        {
            let mut entries = self.entries.lock().await;
            if !entries.contains(&raw) {
                entries.push(raw);
            }
        }
        self.persist().await
    }

    pub async fn remove(&self, raw: &str) -> io::Result<()> {
        {
            let mut entries = self.entries.lock().await;
            entries.retain(|entry| entry != raw);
        }
        self.persist().await
    }

    pub async fn list(&self) -> Vec<String> {
        self.entries.lock().await.clone()
    }

    async fn persist(&self) -> io::Result<()> {
        let entries = self.entries.lock().await.clone();
        let bytes = serde_json::to_vec_pretty(&entries)
            .map_err(|err| io::Error::other(err.to_string()))?;
        write_atomic(&self.path, &bytes).await
    }
}

fn normalize(raw: &str) -> String {
    let flipped = raw.replace('\\', "/");
    let trimmed = flipped.trim_end_matches('/');
    trimmed.to_lowercase()
}

fn covers(entry: &str, target: &str) -> bool {
    target == entry || target.starts_with(&format!("{entry}/"))
}
