//! Device-level broadcaster blocklist, persisted as JSON.
//!
//! The stored file is the source of truth: every mutation re-reads it, applies the change,
//! writes it back and then publishes the new list to subscribers (the address filter
//! updater). Entries are kept newest-first.

use std::{
    io::ErrorKind,
    path::{Path, PathBuf},
};

use chrono::Utc;
use log::{debug, info};
use shroud_core::address_filter::{is_broadcaster_blocked, BlockedBroadcaster};
use tokio::sync::{watch, Mutex};

#[derive(Debug, thiserror::Error)]
pub enum BlocklistError {
    #[error("broadcaster {0} is already blocked")]
    AlreadyBlocked(String),

    #[error("blocklist io error at {path}: {source}")]
    Io {
        path: PathBuf,
        source: std::io::Error,
    },

    #[error("blocklist is not valid json: {0}")]
    Json(#[from] serde_json::Error),
}

pub type BlocklistResult<T> = Result<T, BlocklistError>;

pub struct BlockedBroadcasterStore {
    path: PathBuf,

    /// Serializes read-modify-write cycles against the file.
    write_lock: Mutex<()>,

    blocked: watch::Sender<Vec<BlockedBroadcaster>>,
}

impl BlockedBroadcasterStore {
    pub fn new(path: impl Into<PathBuf>) -> Self {
        let (blocked, _) = watch::channel(Vec::new());
        Self {
            path: path.into(),
            write_lock: Mutex::new(()),
            blocked,
        }
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    /// Loads the stored list and publishes it. A missing file is an empty blocklist.
    pub async fn load(&self) -> BlocklistResult<Vec<BlockedBroadcaster>> {
        let _guard = self.write_lock.lock().await;
        let blocked = self.read_stored().await?;
        info!(
            "loaded {} blocked broadcasters from {:?}",
            blocked.len(),
            self.path
        );
        self.publish(blocked.clone());
        Ok(blocked)
    }

    /// Blocks a broadcaster, optionally until `expiration` (unix seconds).
    pub async fn add(
        &self,
        railgun_address: &str,
        expiration: Option<i64>,
    ) -> BlocklistResult<BlockedBroadcaster> {
        let _guard = self.write_lock.lock().await;
        let mut blocked = self.read_stored().await?;

        if blocked
            .iter()
            .any(|b| b.railgun_address.eq_ignore_ascii_case(railgun_address))
        {
            return Err(BlocklistError::AlreadyBlocked(railgun_address.to_string()));
        }

        let entry = BlockedBroadcaster {
            railgun_address: railgun_address.to_string(),
            blocked_timestamp: Utc::now().timestamp(),
            expiration,
        };
        blocked.insert(0, entry.clone());

        self.write_stored(&blocked).await?;
        debug!("blocked broadcaster {railgun_address}");
        self.publish(blocked);
        Ok(entry)
    }

    /// Unblocks a broadcaster. Returns whether anything was removed.
    pub async fn remove(&self, railgun_address: &str) -> BlocklistResult<bool> {
        let _guard = self.write_lock.lock().await;
        let mut blocked = self.read_stored().await?;

        let before = blocked.len();
        blocked.retain(|b| b.railgun_address != railgun_address);
        let removed = blocked.len() != before;

        self.write_stored(&blocked).await?;
        if removed {
            debug!("unblocked broadcaster {railgun_address}");
        }
        self.publish(blocked);
        Ok(removed)
    }

    /// The most recently loaded or written list.
    pub fn blocked(&self) -> Vec<BlockedBroadcaster> {
        self.blocked.borrow().clone()
    }

    pub fn is_blocked(&self, railgun_address: &str) -> bool {
        is_broadcaster_blocked(railgun_address, &self.blocked.borrow())
    }

    pub fn subscribe(&self) -> watch::Receiver<Vec<BlockedBroadcaster>> {
        self.blocked.subscribe()
    }

    fn publish(&self, blocked: Vec<BlockedBroadcaster>) {
        self.blocked.send_if_modified(|current| {
            if *current == blocked {
                return false;
            }
            *current = blocked;
            true
        });
    }

    async fn read_stored(&self) -> BlocklistResult<Vec<BlockedBroadcaster>> {
        let contents = match tokio::fs::read_to_string(&self.path).await {
            Ok(contents) => contents,
            Err(e) if e.kind() == ErrorKind::NotFound => return Ok(Vec::new()),
            Err(source) => {
                return Err(BlocklistError::Io {
                    path: self.path.clone(),
                    source,
                })
            }
        };
        let mut blocked: Vec<BlockedBroadcaster> = serde_json::from_str(&contents)?;
        sort_newest_first(&mut blocked);
        Ok(blocked)
    }

    async fn write_stored(&self, blocked: &[BlockedBroadcaster]) -> BlocklistResult<()> {
        let json = serde_json::to_string_pretty(blocked)?;
        let tmp_path = self.path.with_extension("json.tmp");
        let io_err = |source| BlocklistError::Io {
            path: self.path.clone(),
            source,
        };
        tokio::fs::write(&tmp_path, json).await.map_err(io_err)?;
        tokio::fs::rename(&tmp_path, &self.path)
            .await
            .map_err(io_err)
    }
}

fn sort_newest_first(blocked: &mut [BlockedBroadcaster]) {
    // stable, so entries blocked in the same second keep their stored order
    blocked.sort_by(|a, b| b.blocked_timestamp.cmp(&a.blocked_timestamp));
}
