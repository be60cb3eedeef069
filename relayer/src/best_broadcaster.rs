//! Keeps a fresh "best broadcaster" available for an in-progress private transaction.
//!
//! ## Selection lifecycle
//! - **Empty**: nothing selected yet; the loop polls the network every [`FIND_FIRST_DELAY`]
//! - **Selected**: a broadcaster is pinned; the loop re-checks every [`REFRESH_SELECTED_DELAY`]
//!   and only replaces it when the [`FeePolicy`] says so
//! - **Locked**: the user pinned the current value; the loop stops writing until unlocked
//!
//! A forced broadcaster supplied through [`SelectionParams`] bypasses the fee policy.
//!
//! ## Refresh cycles
//! Each set of parameters gets its own driver task and its own cancellation token. A cycle
//! fires a candidate-list refresh, re-selects immediately when the current pick is missing,
//! forced away, priced in the wrong token or blocklisted, then ticks on a fixed interval.
//! A cycle restarts (with a fresh timer) whenever the selection, the lock or the blocklist
//! changes. Changing parameters cancels the token, so queries still in flight from the old
//! configuration are discarded instead of committed.

use std::{sync::Arc, time::Duration};

use log::{debug, info, warn};
use shroud_core::{
    broadcaster::{
        compare_token_address, sort_broadcasters, BroadcasterCandidate, Chain, SelectedBroadcaster,
    },
    fee_policy::FeePolicy,
    transaction::TransactionType,
};
use tokio::{
    sync::watch,
    task::{JoinError, JoinHandle},
    time::{interval_at, Instant, MissedTickBehavior},
};
use tokio_util::sync::CancellationToken;

use crate::query::BroadcasterQuery;

/// Poll interval once a broadcaster is selected.
pub const REFRESH_SELECTED_DELAY: Duration = Duration::from_millis(30_000);

/// Poll interval while nothing is selected yet.
pub const FIND_FIRST_DELAY: Duration = Duration::from_millis(2_000);

/// Inputs of a selection. A change to any of them restarts the refresh loop.
#[derive(Clone, Debug, PartialEq)]
pub struct SelectionParams {
    pub chain: Chain,
    pub transaction_type: TransactionType,
    pub is_private: bool,
    pub fee_token_address: String,
    pub use_relay_adapt: bool,

    /// Broadcaster the caller insists on, e.g. one picked by hand from the candidate list.
    pub forced_broadcaster: Option<SelectedBroadcaster>,
}

impl SelectionParams {
    pub fn requires_broadcaster(&self) -> bool {
        self.transaction_type.requires_broadcaster(self.is_private)
    }
}

/// Interval the loop waits between checks.
pub fn refresh_period(has_selection: bool) -> Duration {
    if has_selection {
        REFRESH_SELECTED_DELAY
    } else {
        FIND_FIRST_DELAY
    }
}

/// Whether a cycle must re-select right away instead of waiting for the first tick.
pub fn needs_refresh(
    current: Option<&SelectedBroadcaster>,
    forced: Option<&SelectedBroadcaster>,
    fee_token_address: &str,
    blocklist: &[String],
) -> bool {
    let Some(current) = current else {
        return true;
    };
    forced.is_some_and(|forced| !forced.same_identity(current))
        || !compare_token_address(&current.token_address, fee_token_address)
        || blocklist.contains(&current.railgun_address)
}

/// State owned by one selector and shared with its driver task.
struct SelectionState {
    selected: watch::Sender<Option<SelectedBroadcaster>>,
    locked: watch::Sender<bool>,
    all_broadcasters: watch::Sender<Option<Vec<BroadcasterCandidate>>>,
}

impl SelectionState {
    fn new() -> Self {
        let (selected, _) = watch::channel(None);
        let (locked, _) = watch::channel(false);
        let (all_broadcasters, _) = watch::channel(None);
        Self {
            selected,
            locked,
            all_broadcasters,
        }
    }

    fn is_locked(&self) -> bool {
        *self.locked.borrow()
    }

    fn clear_selection(&self) {
        self.selected.send_if_modified(|current| {
            let changed = current.is_some();
            if changed {
                info!("no broadcaster available, clearing selection");
            }
            *current = None;
            changed
        });
    }
}

/// Everything one refresh needs, bound to the parameters and validity token of a single
/// configuration.
#[derive(Clone)]
struct RefreshContext {
    state: Arc<SelectionState>,
    query: Arc<dyn BroadcasterQuery>,
    fee_policy: FeePolicy,
    params: Arc<SelectionParams>,
    valid: CancellationToken,
}

impl RefreshContext {
    async fn refresh_all_candidates(&self) {
        if self.valid.is_cancelled() {
            return;
        }

        let params = &self.params;
        let mut candidates = match self
            .query
            .find_all_broadcasters_for_token(
                params.chain,
                &params.fee_token_address,
                params.use_relay_adapt,
            )
            .await
        {
            Ok(candidates) => candidates.unwrap_or_default(),
            Err(e) => {
                warn!(
                    "error finding broadcasters for token {} on {}: {e}",
                    params.fee_token_address, params.chain
                );
                Vec::new()
            }
        };

        if self.valid.is_cancelled() {
            debug!("discarding stale broadcaster list");
            return;
        }

        sort_broadcasters(&mut candidates);
        self.state.all_broadcasters.send_replace(Some(candidates));
    }

    async fn refresh_selection(&self, force_new: bool, forced: Option<&SelectedBroadcaster>) {
        if self.state.is_locked() {
            return;
        }
        if self.valid.is_cancelled() {
            return;
        }

        if let Some(forced) = forced {
            self.state.selected.send_if_modified(|current| {
                if current.as_ref().is_some_and(|c| c.same_identity(forced)) {
                    return false;
                }
                info!("using forced broadcaster {}", forced.railgun_address);
                *current = Some(forced.clone());
                true
            });
            return;
        }

        let params = &self.params;
        let best = match self
            .query
            .find_best_broadcaster(
                params.chain,
                &params.fee_token_address,
                params.use_relay_adapt,
            )
            .await
        {
            Ok(best) => best,
            Err(e) => {
                warn!(
                    "error finding best broadcaster for token {} on {}: {e}",
                    params.fee_token_address, params.chain
                );
                None
            }
        };

        // the world may have moved on while the query was in flight
        if self.valid.is_cancelled() {
            debug!("discarding stale broadcaster selection");
            return;
        }
        if self.state.is_locked() {
            debug!("selection locked while querying, keeping current broadcaster");
            return;
        }

        let Some(best) = best else {
            self.state.clear_selection();
            return;
        };

        let candidate = SelectedBroadcaster::from_candidate(best, &params.fee_token_address);
        let fee_policy = self.fee_policy;
        self.state.selected.send_if_modified(|current| {
            if !force_new && !fee_policy.should_replace(&candidate, current.as_ref()) {
                return false;
            }
            if current.as_ref() == Some(&candidate) {
                return false;
            }
            info!(
                "selected broadcaster {} fee {} token {} expires {}",
                candidate.railgun_address,
                candidate.token_fee.fee_per_unit_gas,
                candidate.token_address,
                candidate.token_fee.expiration
            );
            *current = Some(candidate);
            true
        });
    }

    /// Runs refresh cycles until the validity token is cancelled.
    async fn drive(self, mut blocklist: watch::Receiver<Vec<String>>) {
        let mut selected_rx = self.state.selected.subscribe();
        let mut locked_rx = self.state.locked.subscribe();
        let mut blocklist_open = true;
        let forced = self.params.forced_broadcaster.clone();

        while !self.valid.is_cancelled() {
            let current = selected_rx.borrow_and_update().clone();
            locked_rx.borrow_and_update();
            let current_blocklist = blocklist.borrow_and_update().clone();

            tokio::spawn({
                let ctx = self.clone();
                async move { ctx.refresh_all_candidates().await }
            });

            if needs_refresh(
                current.as_ref(),
                forced.as_ref(),
                &self.params.fee_token_address,
                &current_blocklist,
            ) {
                let force_new = current
                    .as_ref()
                    .is_some_and(|c| current_blocklist.contains(&c.railgun_address));
                self.refresh_selection(force_new, forced.as_ref()).await;
            }

            let period = refresh_period(current.is_some());
            let mut ticker = interval_at(Instant::now() + period, period);
            ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);

            loop {
                tokio::select! {
                    _ = self.valid.cancelled() => return,
                    changed = selected_rx.changed() => {
                        if changed.is_err() {
                            return;
                        }
                        break;
                    }
                    changed = locked_rx.changed() => {
                        if changed.is_err() {
                            return;
                        }
                        break;
                    }
                    changed = blocklist.changed(), if blocklist_open => {
                        match changed {
                            Ok(()) => break,
                            Err(_) => {
                                warn!("blocklist source closed, keeping last blocklist");
                                blocklist_open = false;
                            }
                        }
                    }
                    _ = ticker.tick() => self.refresh_selection(false, forced.as_ref()).await,
                }
            }
        }
    }
}

/// Maintains the best broadcaster for one transaction being prepared.
///
/// Must be created and used within a tokio runtime. Dropping the selector cancels its
/// driver task.
pub struct BestBroadcasterSelector {
    state: Arc<SelectionState>,
    query: Arc<dyn BroadcasterQuery>,
    fee_policy: FeePolicy,
    blocklist: watch::Receiver<Vec<String>>,
    params: Arc<SelectionParams>,

    /// Root token; every configuration gets a child of it.
    exit: CancellationToken,

    /// Validity token of the current configuration.
    valid: CancellationToken,

    driver: Option<JoinHandle<()>>,
}

impl BestBroadcasterSelector {
    /// Creates a selector and, if the transaction needs a broadcaster, starts refreshing.
    ///
    /// # Arguments
    /// * `query` - Broadcaster network client
    /// * `blocklist` - Merged blocklist, usually from an `AddressFilterUpdater`
    /// * `params` - Transaction inputs the selection is made for
    /// * `fee_policy` - Replacement rule for an existing selection
    /// * `exit` - Shutdown signal; cancelling it stops the loop
    pub fn new(
        query: Arc<dyn BroadcasterQuery>,
        blocklist: watch::Receiver<Vec<String>>,
        params: SelectionParams,
        fee_policy: FeePolicy,
        exit: &CancellationToken,
    ) -> BestBroadcasterSelector {
        let valid = exit.child_token();
        let mut selector = BestBroadcasterSelector {
            state: Arc::new(SelectionState::new()),
            query,
            fee_policy,
            blocklist,
            params: Arc::new(params),
            exit: exit.clone(),
            valid,
            driver: None,
        };
        selector.start_driver();
        selector
    }

    /// Applies new transaction inputs. Identical inputs are a no-op; otherwise the current
    /// configuration is cancelled and a new refresh loop starts. The current selection is
    /// kept and re-validated by the new loop.
    pub fn set_params(&mut self, params: SelectionParams) {
        if *self.params == params {
            return;
        }
        debug!(
            "selection params changed: {} token {} private {}",
            params.transaction_type, params.fee_token_address, params.is_private
        );
        self.valid.cancel();
        self.valid = self.exit.child_token();
        self.params = Arc::new(params);
        self.start_driver();
    }

    pub fn params(&self) -> &SelectionParams {
        &self.params
    }

    pub fn requires_broadcaster(&self) -> bool {
        self.params.requires_broadcaster()
    }

    /// Locking keeps the current value but stops the loop from changing it.
    pub fn lock_selection(&self, locked: bool) {
        self.state.locked.send_if_modified(|current| {
            let changed = *current != locked;
            *current = locked;
            changed
        });
    }

    pub fn locked(&self) -> bool {
        self.state.is_locked()
    }

    pub fn selected_broadcaster(&self) -> Option<SelectedBroadcaster> {
        self.state.selected.borrow().clone()
    }

    /// Candidates for the fee token, most reliable first. `None` until the first poll lands.
    pub fn all_broadcasters(&self) -> Option<Vec<BroadcasterCandidate>> {
        self.state.all_broadcasters.borrow().clone()
    }

    pub fn subscribe(&self) -> watch::Receiver<Option<SelectedBroadcaster>> {
        self.state.selected.subscribe()
    }

    pub fn subscribe_all_broadcasters(&self) -> watch::Receiver<Option<Vec<BroadcasterCandidate>>> {
        self.state.all_broadcasters.subscribe()
    }

    /// Re-polls the candidate list for the current parameters.
    pub async fn refresh_all_candidates(&self) {
        self.context().refresh_all_candidates().await
    }

    /// Re-selects for the current parameters.
    ///
    /// `force_new` commits the network's best pick even if the fee policy would keep the
    /// current one. A `forced` broadcaster is adopted directly without querying.
    pub async fn refresh_selection(&self, force_new: bool, forced: Option<&SelectedBroadcaster>) {
        self.context().refresh_selection(force_new, forced).await
    }

    /// Forgets the current selection and candidate list. The lock is left as is.
    pub fn reset(&self) {
        self.state.clear_selection();
        self.state.all_broadcasters.send_replace(None);
    }

    /// Stops the refresh loop and waits for it to finish.
    pub async fn shutdown(mut self) -> Result<(), JoinError> {
        self.valid.cancel();
        match self.driver.take() {
            Some(driver) => driver.await,
            None => Ok(()),
        }
    }

    fn context(&self) -> RefreshContext {
        RefreshContext {
            state: self.state.clone(),
            query: self.query.clone(),
            fee_policy: self.fee_policy,
            params: self.params.clone(),
            valid: self.valid.clone(),
        }
    }

    fn start_driver(&mut self) {
        if !self.params.requires_broadcaster() {
            debug!(
                "{} (private: {}) does not need a broadcaster",
                self.params.transaction_type, self.params.is_private
            );
            self.driver = None;
            return;
        }
        let ctx = self.context();
        self.driver = Some(tokio::spawn(ctx.drive(self.blocklist.clone())));
    }
}

impl Drop for BestBroadcasterSelector {
    fn drop(&mut self) {
        self.valid.cancel();
    }
}
