use std::path::{Path, PathBuf};
use std::sync::{Mutex, PoisonError};

use anyhow::{Context, Result};
use serde_json::Value;
use sha2::{Digest, Sha256};
use tracing::debug;

use crate::transport::{Headers, Listener, LocalCacheReset, ResourceCache};

/// In-memory copy of the latest payload published on one topic.
///
/// Serves both as the topic's listener and as the bootstrap cache whose hash
/// is sent to the coordinator, so an unchanged resource is not resent.
pub struct TopicCache {
    topic: String,
    latest: Mutex<Option<Value>>,
}

impl TopicCache {
    pub fn new(topic: &str) -> Self {
        Self {
            topic: topic.to_string(),
            latest: Mutex::new(None),
        }
    }

    /// Latest payload received on the topic.
    pub fn latest(&self) -> Option<Value> {
        self.latest
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .clone()
    }

    /// Forget the cached payload, forcing a full resend at next bootstrap.
    pub fn clear(&self) {
        self.latest
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .take();
    }
}

impl Listener for TopicCache {
    fn topic(&self) -> &str {
        &self.topic
    }

    fn on_event(&self, _headers: &Headers, body: &Value) -> Result<()> {
        if !body.is_object() {
            anyhow::bail!("Expected a JSON object on {}, got {}", self.topic, body);
        }
        *self.latest.lock().unwrap_or_else(PoisonError::into_inner) = Some(body.clone());
        Ok(())
    }

    // Cached payload persists across sessions; only `clear` drops it.
}

impl ResourceCache for TopicCache {
    fn content_hash(&self) -> String {
        match self.latest() {
            // serde_json maps are ordered by key, so the encoding is stable
            Some(value) => format!("{:x}", Sha256::digest(value.to_string().as_bytes())),
            None => String::new(),
        }
    }
}

/// File-based markers recording which agent-side bundles were already
/// fetched. Cleared after every registration so the next command refetches.
pub struct FileCache {
    dir: PathBuf,
}

/// Extension of marker files inside the cache directory.
const MARKER_EXTENSION: &str = "hash";

impl FileCache {
    pub fn new(dir: &Path) -> Self {
        Self {
            dir: dir.to_path_buf(),
        }
    }

    pub fn dir(&self) -> &Path {
        &self.dir
    }
}

impl LocalCacheReset for FileCache {
    fn reset(&self) -> Result<()> {
        let entries = match std::fs::read_dir(&self.dir) {
            Ok(entries) => entries,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(()),
            Err(e) => {
                return Err(e).with_context(|| {
                    format!("Failed to read cache directory {}", self.dir.display())
                });
            }
        };

        let mut removed = 0usize;
        for entry in entries {
            let path = entry?.path();
            if path.is_file()
                && path.extension().and_then(|e| e.to_str()) == Some(MARKER_EXTENSION)
            {
                std::fs::remove_file(&path)
                    .with_context(|| format!("Failed to remove marker {}", path.display()))?;
                removed += 1;
            }
        }
        debug!(dir = %self.dir.display(), removed, "Reset file cache markers");
        Ok(())
    }
}

/// Cache reset for agents without a local file cache.
pub struct NoFileCache;

impl LocalCacheReset for NoFileCache {
    fn reset(&self) -> Result<()> {
        Ok(())
    }
}
