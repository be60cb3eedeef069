//! Keeps the broadcaster network client's address filters in sync with the exclusion sources.
//!
//! A background task watches the device blocklist, the remote blocklist and the session
//! skiplist. Whenever any of them changes it recomputes the merged blocklist, pushes it to
//! the network client and then publishes it to local subscribers (the selection loop). A failed
//! push is logged and otherwise ignored; the next change pushes again.
//!
//! The network client always receives a new blocklist before local subscribers see it, so a
//! selection loop reacting to the change queries a client that already excludes those
//! addresses. Device blocks with an expiration also wake the task when they lapse.

use std::{future::pending, sync::Arc};

use chrono::{DateTime, Utc};
use log::{debug, error, info};
use shroud_core::address_filter::{
    merge_blocklists_at, next_device_expiration, BlockedBroadcaster,
};
use tokio::{
    sync::watch,
    task::{JoinError, JoinHandle},
    time::sleep,
};
use tokio_util::sync::CancellationToken;

use crate::query::BroadcasterQuery;

/// Receivers for the three exclusion sources.
pub struct FilterSources {
    pub device: watch::Receiver<Vec<BlockedBroadcaster>>,
    pub remote: watch::Receiver<Vec<String>>,
    pub session: watch::Receiver<Vec<String>>,
}

pub struct AddressFilterUpdater {
    blocklist: watch::Receiver<Vec<String>>,
    updater_task: JoinHandle<()>,
}

impl AddressFilterUpdater {
    /// Starts the updater task. Must be called from within a tokio runtime.
    ///
    /// The merged blocklist is computed and pushed once immediately, then again after every
    /// source change until `exit` is cancelled.
    pub fn new(
        query: Arc<dyn BroadcasterQuery>,
        mut sources: FilterSources,
        exit: CancellationToken,
    ) -> AddressFilterUpdater {
        let initial = merge_sources(&mut sources);
        let (blocklist_sender, blocklist) = watch::channel(initial);
        let updater_task = tokio::spawn(Self::run(query, sources, blocklist_sender, exit));
        AddressFilterUpdater {
            blocklist,
            updater_task,
        }
    }

    /// Subscribes to the merged blocklist.
    pub fn blocklist(&self) -> watch::Receiver<Vec<String>> {
        self.blocklist.clone()
    }

    pub fn current_blocklist(&self) -> Vec<String> {
        self.blocklist.borrow().clone()
    }

    pub async fn join(self) -> Result<(), JoinError> {
        self.updater_task.await
    }

    async fn run(
        query: Arc<dyn BroadcasterQuery>,
        mut sources: FilterSources,
        blocklist_sender: watch::Sender<Vec<String>>,
        exit: CancellationToken,
    ) {
        let mut expired_at: Option<DateTime<Utc>> = None;
        loop {
            // the timer may fire slightly before the wall clock reaches the expiration
            let now = match expired_at.take() {
                Some(expired_at) => expired_at.max(Utc::now()),
                None => Utc::now(),
            };
            let merged = merge_sources_at(&mut sources, now);

            // the client must hold the new filters before the selection loop re-queries
            debug!("pushing broadcaster blocklist with {} entries", merged.len());
            if let Err(e) = query.update_address_filters(None, merged.clone()).await {
                error!("error updating broadcaster address filters: {e}");
            }

            blocklist_sender.send_if_modified(|current| {
                if *current == merged {
                    return false;
                }
                *current = merged;
                true
            });

            let next_expiration = next_device_expiration(&sources.device.borrow(), now);
            let expiry = async {
                match next_expiration {
                    Some(expiration) => {
                        let delay = (expiration - now).to_std().unwrap_or_default();
                        sleep(delay).await
                    }
                    None => pending().await,
                }
            };

            tokio::select! {
                _ = exit.cancelled() => break,
                changed = sources.device.changed() => if changed.is_err() { break },
                changed = sources.remote.changed() => if changed.is_err() { break },
                changed = sources.session.changed() => if changed.is_err() { break },
                _ = expiry => {
                    debug!("device block expired, recomputing broadcaster blocklist");
                    expired_at = next_expiration;
                }
            }
        }
        info!("address filter updater stopped");
    }
}

fn merge_sources(sources: &mut FilterSources) -> Vec<String> {
    merge_sources_at(sources, Utc::now())
}

fn merge_sources_at(sources: &mut FilterSources, now: DateTime<Utc>) -> Vec<String> {
    merge_blocklists_at(
        &sources.device.borrow_and_update(),
        &sources.remote.borrow_and_update(),
        &sources.session.borrow_and_update(),
        now,
    )
}
