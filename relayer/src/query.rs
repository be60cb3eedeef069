//! Seam to the broadcaster network client.
//!
//! The selection loop never talks to the peer-to-peer network itself. It is handed an
//! implementation of [`BroadcasterQuery`], which in production wraps the network client and
//! in tests is a scripted mock.

use async_trait::async_trait;
use shroud_core::broadcaster::{BroadcasterCandidate, Chain};

#[derive(Debug, thiserror::Error)]
pub enum QueryError {
    #[error("broadcaster client unavailable: {0}")]
    Unavailable(String),

    #[error("broadcaster query timed out")]
    Timeout,

    #[error("broadcaster query failed: {0}")]
    Failed(String),
}

pub type QueryResult<T> = Result<T, QueryError>;

/// Queries offered by the broadcaster network client.
///
/// Every query is scoped by chain, fee token and relay-adapt mode. Implementations should
/// honor the most recent filters passed to [`BroadcasterQuery::update_address_filters`].
#[async_trait]
pub trait BroadcasterQuery: Send + Sync + 'static {
    /// Returns the broadcaster the network considers best for this fee token, if any.
    async fn find_best_broadcaster(
        &self,
        chain: Chain,
        fee_token_address: &str,
        use_relay_adapt: bool,
    ) -> QueryResult<Option<BroadcasterCandidate>>;

    /// Returns every broadcaster currently quoting fees in this token, if the token is known.
    async fn find_all_broadcasters_for_token(
        &self,
        chain: Chain,
        fee_token_address: &str,
        use_relay_adapt: bool,
    ) -> QueryResult<Option<Vec<BroadcasterCandidate>>>;

    /// Replaces the address filters applied to future queries.
    async fn update_address_filters(
        &self,
        allowlist: Option<Vec<String>>,
        blocklist: Vec<String>,
    ) -> QueryResult<()>;
}
