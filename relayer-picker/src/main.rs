use std::{
    path::{Path, PathBuf},
    process,
    sync::Arc,
    thread,
    thread::JoinHandle,
    time::{Duration, Instant},
};

use chrono::Utc;
use clap::{Parser, Subcommand};
use crossbeam_channel::tick;
use env_logger::Env;
use log::{debug, error, info, warn};
use serde::Deserialize;
use shroud_core::{
    broadcaster::{Chain, ReliabilityTier, SelectedBroadcaster},
    fee_policy::{FeePolicy, DEFAULT_FEE_CHANGE_THRESHOLD},
    graceful_panic,
    transaction::TransactionType,
};
use shroud_relayer::{
    address_filter_updater::{AddressFilterUpdater, FilterSources},
    best_broadcaster::{BestBroadcasterSelector, SelectionParams},
    blocked_broadcasters::{BlockedBroadcasterStore, BlocklistError},
    filter_sources::{RemoteBlocklist, SessionSkiplist},
    query::{BroadcasterQuery, QueryError},
};
use shroud_rpc::directory::{BroadcasterDirectory, DirectoryError, DirectoryRefresher};
use tokio::{runtime::Builder, signal};
use tokio_util::sync::CancellationToken;

/// Picks and keeps refreshing the best fee broadcaster for a private transaction, and manages
/// the device-level broadcaster blocklist.
#[derive(Parser, Debug)]
#[clap(author, version, about, long_about = None)]
struct Args {
    /// JSON file holding broadcasters blocked on this device.
    #[arg(long, env, default_value = "blocked-broadcasters.json")]
    blocklist_path: PathBuf,

    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand, Debug)]
enum Command {
    /// Select a broadcaster and keep the selection fresh until interrupted.
    Watch(WatchArgs),

    /// Block a broadcaster on this device.
    Block {
        railgun_address: String,

        /// Unblock automatically after this many seconds.
        #[arg(long)]
        expires_in_secs: Option<u64>,
    },

    /// Remove a broadcaster from the device blocklist.
    Unblock { railgun_address: String },

    /// Print the device blocklist, newest first.
    ListBlocked,
}

#[derive(clap::Args, Debug)]
struct WatchArgs {
    /// YAML listing of broadcasters and their fee quotes per token.
    #[arg(long, env, default_value = "broadcasters.yaml")]
    directory_path: PathBuf,

    /// How often the broadcaster listing is re-read.
    #[arg(long, env, default_value_t = 10)]
    directory_refresh_secs: u64,

    /// Optional YAML remote config carrying an operator-managed blocklist.
    #[arg(long, env)]
    remote_config_path: Option<PathBuf>,

    /// How often the remote config and the device blocklist are re-read.
    #[arg(long, env, default_value_t = 30)]
    blocklist_refresh_secs: u64,

    /// EVM chain id the transaction is built for.
    #[arg(long, env, default_value_t = 1)]
    chain_id: u64,

    /// Token the broadcaster fee is paid in.
    #[arg(long, env)]
    fee_token_address: String,

    /// Transaction type, e.g. Unshield, Send or Swap.
    #[arg(long, env, default_value = "Unshield", value_parser = parse_transaction_type)]
    transaction_type: TransactionType,

    /// Build a public transaction instead of a private one.
    #[arg(long, env)]
    public: bool,

    /// Only consider broadcasters that support the relay adapt contract.
    #[arg(long, env)]
    use_relay_adapt: bool,

    /// Always use this broadcaster instead of the best one.
    #[arg(long, env)]
    forced_broadcaster: Option<String>,

    /// Broadcasters to skip for this session, comma separated.
    #[arg(long, env, value_delimiter = ',')]
    skip: Vec<String>,

    /// Relative fee change below which another broadcaster does not replace the current one.
    #[arg(long, env, default_value_t = DEFAULT_FEE_CHANGE_THRESHOLD)]
    fee_change_threshold: f64,
}

#[derive(Debug, thiserror::Error)]
enum PickerError {
    #[error(transparent)]
    Blocklist(#[from] BlocklistError),

    #[error(transparent)]
    Directory(#[from] DirectoryError),

    #[error(transparent)]
    Query(#[from] QueryError),

    #[error("forced broadcaster {0} is not listed for this fee token")]
    UnknownForcedBroadcaster(String),
}

#[derive(Debug, thiserror::Error)]
enum RemoteConfigError {
    #[error("error reading remote config {path:?}: {source}")]
    Io {
        path: PathBuf,
        source: std::io::Error,
    },

    #[error("invalid remote config: {0}")]
    Yaml(#[from] serde_yaml::Error),
}

/// Operator-managed settings delivered alongside the broadcaster listing.
#[derive(Debug, Default, Deserialize)]
#[serde(rename_all = "camelCase")]
struct RemoteConfig {
    #[serde(default)]
    broadcaster_blocklist: Vec<String>,
}

fn parse_transaction_type(value: &str) -> Result<TransactionType, String> {
    TransactionType::ALL
        .into_iter()
        .find(|t| t.to_string().eq_ignore_ascii_case(value))
        .ok_or_else(|| format!("unknown transaction type: {value}"))
}

fn main() {
    env_logger::Builder::from_env(Env::new().default_filter_or("info"))
        .format_timestamp_millis()
        .init();

    let args: Args = Args::parse();
    info!("args: {:?}", args);

    let exit = graceful_panic();
    let store = BlockedBroadcasterStore::new(&args.blocklist_path);

    let rt = Builder::new_multi_thread().enable_all().build().unwrap();
    let result = rt.block_on(async move {
        match args.command {
            Command::Watch(watch_args) => watch(watch_args, store, exit.clone()).await,
            Command::Block {
                railgun_address,
                expires_in_secs,
            } => block(&store, &railgun_address, expires_in_secs).await,
            Command::Unblock { railgun_address } => unblock(&store, &railgun_address).await,
            Command::ListBlocked => list_blocked(&store).await,
        }
    });

    if let Err(e) = result {
        error!("{e}");
        process::exit(1);
    }
}

async fn block(
    store: &BlockedBroadcasterStore,
    railgun_address: &str,
    expires_in_secs: Option<u64>,
) -> Result<(), PickerError> {
    let expiration = expires_in_secs
        .map(|secs| Utc::now().timestamp().saturating_add_unsigned(secs));
    store.add(railgun_address, expiration).await?;
    info!("blocked broadcaster {railgun_address}");
    Ok(())
}

async fn unblock(store: &BlockedBroadcasterStore, railgun_address: &str) -> Result<(), PickerError> {
    if store.remove(railgun_address).await? {
        info!("unblocked broadcaster {railgun_address}");
    } else {
        warn!("broadcaster {railgun_address} was not blocked");
    }
    Ok(())
}

async fn list_blocked(store: &BlockedBroadcasterStore) -> Result<(), PickerError> {
    let now = Utc::now();
    for blocked in store.load().await? {
        let status = if blocked.is_active_at(now) {
            "active"
        } else {
            "expired"
        };
        match blocked.expiration {
            Some(expiration) => println!(
                "{}\tblocked {}\texpires {}\t{status}",
                blocked.railgun_address, blocked.blocked_timestamp, expiration
            ),
            None => println!(
                "{}\tblocked {}\tnever expires\t{status}",
                blocked.railgun_address, blocked.blocked_timestamp
            ),
        }
    }
    Ok(())
}

async fn watch(
    args: WatchArgs,
    store: BlockedBroadcasterStore,
    exit: CancellationToken,
) -> Result<(), PickerError> {
    let store = Arc::new(store);
    store.load().await?;

    let directory = Arc::new(BroadcasterDirectory::load(&args.directory_path)?);
    let directory_refresher = DirectoryRefresher::new(
        &directory,
        Duration::from_secs(args.directory_refresh_secs),
        &exit,
    );

    let remote = Arc::new(RemoteBlocklist::default());
    let remote_config_refresher = args.remote_config_path.as_ref().map(|path| {
        if let Err(e) = refresh_remote_config(path, &remote) {
            warn!("error loading remote config: {e}");
        }
        start_remote_config_refresher(
            path,
            &remote,
            Duration::from_secs(args.blocklist_refresh_secs),
            &exit,
        )
    });

    let skiplist = SessionSkiplist::new();
    for railgun_address in &args.skip {
        skiplist.add(railgun_address);
    }

    let updater = AddressFilterUpdater::new(
        directory.clone(),
        FilterSources {
            device: store.subscribe(),
            remote: remote.subscribe(),
            session: skiplist.subscribe(),
        },
        exit.clone(),
    );

    let chain = Chain::evm(args.chain_id);
    let forced_broadcaster = match &args.forced_broadcaster {
        Some(railgun_address) => Some(
            find_forced_broadcaster(
                directory.as_ref(),
                chain,
                &args.fee_token_address,
                args.use_relay_adapt,
                railgun_address,
            )
            .await?,
        ),
        None => None,
    };

    let params = SelectionParams {
        chain,
        transaction_type: args.transaction_type,
        is_private: !args.public,
        fee_token_address: args.fee_token_address.clone(),
        use_relay_adapt: args.use_relay_adapt,
        forced_broadcaster,
    };
    let selector = BestBroadcasterSelector::new(
        directory.clone(),
        updater.blocklist(),
        params,
        FeePolicy::with_threshold(args.fee_change_threshold),
        &exit,
    );

    if selector.requires_broadcaster() {
        tokio::spawn(shutdown_signal(exit.clone()));
        log_selections(&selector, store.clone(), args.blocklist_refresh_secs, &exit).await;
    } else {
        info!(
            "{} (private: {}) is submitted from the user's wallet, no broadcaster needed",
            args.transaction_type, !args.public
        );
        exit.cancel();
    }

    if let Err(e) = selector.shutdown().await {
        error!("error stopping selection loop: {e}");
    }
    if let Err(e) = updater.join().await {
        error!("error stopping address filter updater: {e}");
    }
    let joined = tokio::task::spawn_blocking(move || -> thread::Result<()> {
        directory_refresher.join()?;
        if let Some(remote_config_refresher) = remote_config_refresher {
            remote_config_refresher.join()?;
        }
        Ok(())
    })
    .await;
    if !matches!(joined, Ok(Ok(()))) {
        error!("error joining refresher threads");
    }
    Ok(())
}

async fn find_forced_broadcaster(
    query: &dyn BroadcasterQuery,
    chain: Chain,
    fee_token_address: &str,
    use_relay_adapt: bool,
    railgun_address: &str,
) -> Result<SelectedBroadcaster, PickerError> {
    query
        .find_all_broadcasters_for_token(chain, fee_token_address, use_relay_adapt)
        .await?
        .unwrap_or_default()
        .into_iter()
        .find(|c| c.railgun_address == railgun_address)
        .map(|c| SelectedBroadcaster::from_candidate(c, fee_token_address))
        .ok_or_else(|| PickerError::UnknownForcedBroadcaster(railgun_address.to_string()))
}

/// Logs every selection change until `exit` is cancelled, re-reading the device blocklist
/// so blocks made from another shell take effect.
async fn log_selections(
    selector: &BestBroadcasterSelector,
    store: Arc<BlockedBroadcasterStore>,
    blocklist_refresh_secs: u64,
    exit: &CancellationToken,
) {
    let mut selected = selector.subscribe();
    let mut blocklist_reload =
        tokio::time::interval(Duration::from_secs(blocklist_refresh_secs.max(1)));

    loop {
        tokio::select! {
            _ = exit.cancelled() => break,
            changed = selected.changed() => {
                if changed.is_err() {
                    break;
                }
                let current = selected.borrow_and_update().clone();
                match current {
                    Some(broadcaster) => {
                        let tier = ReliabilityTier::from_score(
                            broadcaster.token_fee.reliability_or_zero(),
                        );
                        info!(
                            "broadcaster {} fee {} reliability {tier} ({} candidates)",
                            broadcaster.railgun_address,
                            broadcaster.token_fee.fee_per_unit_gas,
                            selector.all_broadcasters().map_or(0, |all| all.len()),
                        );
                    }
                    None => warn!("no broadcaster available for this fee token"),
                }
            }
            _ = blocklist_reload.tick() => {
                if let Err(e) = store.load().await {
                    warn!("error reloading device blocklist: {e}");
                }
            }
        }
    }
}

fn refresh_remote_config(path: &Path, remote: &RemoteBlocklist) -> Result<(), RemoteConfigError> {
    let contents = std::fs::read_to_string(path).map_err(|source| RemoteConfigError::Io {
        path: path.to_path_buf(),
        source,
    })?;
    let config: RemoteConfig = serde_yaml::from_str(&contents)?;
    remote.replace(config.broadcaster_blocklist);
    Ok(())
}

fn start_remote_config_refresher(
    path: &Path,
    remote: &Arc<RemoteBlocklist>,
    refresh_duration: Duration,
    exit: &CancellationToken,
) -> JoinHandle<()> {
    let path = path.to_path_buf();
    let remote = remote.clone();
    let exit = exit.clone();

    thread::Builder::new()
        .name("remote_config_refresher".to_string())
        .spawn(move || {
            let tick_receiver = tick(Duration::from_secs(1));
            let mut last_refresh = Instant::now();

            while !exit.is_cancelled() {
                let _ = tick_receiver.recv();
                if last_refresh.elapsed() < refresh_duration {
                    continue;
                }

                match refresh_remote_config(&path, &remote) {
                    Ok(()) => debug!("remote config reloaded from {path:?}"),
                    // keep the last good blocklist
                    Err(e) => error!("error refreshing remote config: {e}"),
                }
                last_refresh = Instant::now();
            }
        })
        .unwrap()
}

pub async fn shutdown_signal(exit: CancellationToken) {
    let ctrl_c = async {
        signal::ctrl_c()
            .await
            .expect("failed to install Ctrl+C handler");
    };

    #[cfg(unix)]
    let terminate = async {
        signal::unix::signal(signal::unix::SignalKind::terminate())
            .expect("failed to install signal handler")
            .recv()
            .await;
    };

    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    tokio::select! {
        _ = ctrl_c => {},
        _ = terminate => {},
        _ = exit.cancelled() => return,
    }
    exit.cancel();
    warn!("signal received, starting graceful shutdown");
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_parse_transaction_type() {
        assert_eq!(
            parse_transaction_type("unshield"),
            Ok(TransactionType::Unshield)
        );
        assert_eq!(
            parse_transaction_type("AddLiquidity"),
            Ok(TransactionType::AddLiquidity)
        );
        assert!(parse_transaction_type("bridge").is_err());
    }

    #[test]
    fn test_args_parse_watch() {
        let args = Args::try_parse_from([
            "shroud-relayer-picker",
            "watch",
            "--fee-token-address",
            "0xabc",
            "--transaction-type",
            "swap",
            "--skip",
            "0zkA,0zkB",
        ])
        .unwrap();
        let Command::Watch(watch) = args.command else {
            panic!("expected watch");
        };
        assert_eq!(watch.transaction_type, TransactionType::Swap);
        assert_eq!(watch.skip, vec!["0zkA".to_string(), "0zkB".to_string()]);
        assert!(!watch.public);
        assert_eq!(watch.fee_change_threshold, DEFAULT_FEE_CHANGE_THRESHOLD);
    }

    #[test]
    fn test_remote_config_feeds_remote_blocklist() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("remote.yaml");
        let remote = RemoteBlocklist::default();

        std::fs::write(&path, "broadcasterBlocklist: [0zkBad]\n").unwrap();
        refresh_remote_config(&path, &remote).unwrap();
        assert_eq!(remote.addresses(), vec!["0zkBad".to_string()]);

        // a broken file leaves the last good list in place
        std::fs::write(&path, "broadcasterBlocklist: {").unwrap();
        assert!(matches!(
            refresh_remote_config(&path, &remote),
            Err(RemoteConfigError::Yaml(_))
        ));
        assert_eq!(remote.addresses(), vec!["0zkBad".to_string()]);

        std::fs::remove_file(&path).unwrap();
        assert!(matches!(
            refresh_remote_config(&path, &remote),
            Err(RemoteConfigError::Io { .. })
        ));
        assert_eq!(remote.addresses(), vec!["0zkBad".to_string()]);
    }

    #[tokio::test]
    async fn test_block_then_list_and_unblock() {
        let dir = tempfile::tempdir().unwrap();
        let store = BlockedBroadcasterStore::new(dir.path().join("blocked.json"));

        block(&store, "0zkA", Some(60)).await.unwrap();
        let blocked = store.load().await.unwrap();
        assert_eq!(blocked.len(), 1);
        assert!(blocked[0].expiration.unwrap() > blocked[0].blocked_timestamp);

        assert!(matches!(
            block(&store, "0ZKA", None).await,
            Err(PickerError::Blocklist(BlocklistError::AlreadyBlocked(_)))
        ));

        list_blocked(&store).await.unwrap();
        unblock(&store, "0zkA").await.unwrap();
        assert!(store.load().await.unwrap().is_empty());
    }
}
