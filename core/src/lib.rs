//! Core types and pure policies for broadcaster selection.
//!
//! This crate holds everything about picking a fee broadcaster that does not need a runtime:
//!
//! - **broadcaster**: candidate and selection records, fee quotes, chains and ordering
//! - **fee_policy**: the fee-freshness rule deciding when a selection gets replaced
//! - **address_filter**: blocked broadcaster records and the merged exclusion list
//! - **transaction**: transaction kinds and whether they need a broadcaster at all
//!
//! The stateful refresh loop built on top of these lives in `shroud-relayer`.

use std::{panic, process, time::Duration};

use log::*;
use tokio_util::sync::CancellationToken;

pub mod address_filter;
pub mod broadcaster;
pub mod fee_policy;
pub mod transaction;

/// Installs a panic hook that cancels the returned token before the process exits.
///
/// When any thread panics the hook logs the panic, cancels the token so that background
/// loops observing it stop, waits briefly for them to unwind and then exits with status 1.
/// Long-running tasks should select on [`CancellationToken::cancelled`] or poll
/// [`CancellationToken::is_cancelled`].
pub fn graceful_panic() -> CancellationToken {
    let exit = CancellationToken::new();

    let panic_hook = panic::take_hook();
    {
        let exit = exit.clone();
        panic::set_hook(Box::new(move |panic_info| {
            error!("process panicked: {}", panic_info);

            exit.cancel();

            // give refresh loops a moment to observe the cancellation
            std::thread::sleep(Duration::from_secs(2));

            panic_hook(panic_info);

            process::exit(1);
        }));
    }

    exit
}
