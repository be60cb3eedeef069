//! Shroud Broadcaster Selection
//!
//! This crate keeps a fresh "best broadcaster" available while a private transaction is being
//! prepared, and keeps the broadcaster network client's address filters in sync with every
//! source of exclusions.
//!
//! ## Main Components
//!
//! ### Selection
//! - **best_broadcaster**: Refresh loop that polls the network and applies the fee policy
//! - **query**: Trait seam to the broadcaster network client
//!
//! ### Address Filters
//! - **blocked_broadcasters**: Device blocklist persisted to disk
//! - **filter_sources**: Session skiplist and remote-config blocklist
//! - **address_filter_updater**: Merges the three sources and pushes them to the client
//!
//! ## Data Flow
//!
//! 1. The device store, remote config and session skiplist each publish on a `watch` channel
//! 2. The address filter updater merges them, pushes the result to the network client and
//!    republishes it as the merged blocklist
//! 3. The selection loop watches the merged blocklist and drops a selection that lands on it

pub mod address_filter_updater;
pub mod best_broadcaster;
pub mod blocked_broadcasters;
pub mod filter_sources;
pub mod query;
