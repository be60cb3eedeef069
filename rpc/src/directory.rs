use std::{
    path::{Path, PathBuf},
    sync::{Arc, RwLock},
    thread,
    thread::{Builder, JoinHandle},
    time::{Duration, Instant},
};

use async_trait::async_trait;
use chrono::{DateTime, TimeDelta, Utc};
use crossbeam_channel::tick;
use dashmap::DashMap;
use log::{debug, error, info};
use serde::Deserialize;
use shroud_core::broadcaster::{BroadcasterCandidate, Chain, FeePerUnitGas, TokenFee};
use shroud_relayer::query::{BroadcasterQuery, QueryResult};
use tokio_util::sync::CancellationToken;

#[derive(Debug, thiserror::Error)]
pub enum DirectoryError {
    #[error("error reading broadcaster directory {path}: {source}")]
    Io {
        path: PathBuf,
        source: std::io::Error,
    },

    #[error("invalid broadcaster directory: {0}")]
    Yaml(#[from] serde_yaml::Error),
}

pub type DirectoryResult<T> = Result<T, DirectoryError>;

/// Broadcasters quoting fees in one token on one chain, as written in the directory file.
#[derive(Clone, Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct TokenListing {
    pub chain: Chain,
    pub fee_token_address: String,
    pub broadcasters: Vec<ListedBroadcaster>,
}

#[derive(Clone, Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ListedBroadcaster {
    pub railgun_address: String,
    pub fee_per_unit_gas: FeePerUnitGas,

    /// How long a fee quote stays valid after the directory is loaded.
    pub fee_ttl_secs: u64,

    #[serde(default)]
    pub reliability: Option<f64>,

    #[serde(default)]
    pub supports_relay_adapt: bool,
}

#[derive(Clone, Debug)]
struct DirectoryEntry {
    candidate: BroadcasterCandidate,
    supports_relay_adapt: bool,
}

#[derive(Debug, Default)]
struct AddressFilters {
    allowlist: Option<Vec<String>>,
    blocklist: Vec<String>,
}

impl AddressFilters {
    fn allows(&self, railgun_address: &str) -> bool {
        if self.blocklist.iter().any(|a| a == railgun_address) {
            return false;
        }
        match &self.allowlist {
            Some(allowlist) => allowlist.iter().any(|a| a == railgun_address),
            None => true,
        }
    }
}

/// Answers broadcaster queries from a YAML listing file that is reloaded on an interval.
///
/// Each reload stamps fee expirations as `now + feeTtlSecs`, so a listing that stops being
/// reloaded goes stale the same way quotes from an unreachable broadcaster would.
pub struct BroadcasterDirectory {
    path: PathBuf,

    /// Maps (chain, lowercase fee token address) to the broadcasters listed for it.
    entries: DashMap<(Chain, String), Vec<DirectoryEntry>>,

    /// Filters pushed through [`BroadcasterQuery::update_address_filters`].
    filters: RwLock<AddressFilters>,
}

impl BroadcasterDirectory {
    /// Loads the directory file. Fails if the file cannot be read or parsed.
    pub fn load(path: impl Into<PathBuf>) -> DirectoryResult<BroadcasterDirectory> {
        let directory = BroadcasterDirectory {
            path: path.into(),
            entries: DashMap::new(),
            filters: RwLock::new(AddressFilters::default()),
        };
        directory.reload()?;
        Ok(directory)
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    /// Re-reads the file and replaces every listing. Returns the number of broadcasters loaded.
    pub fn reload(&self) -> DirectoryResult<usize> {
        let contents = std::fs::read_to_string(&self.path).map_err(|source| DirectoryError::Io {
            path: self.path.clone(),
            source,
        })?;
        let listings: Vec<TokenListing> = serde_yaml::from_str(&contents)?;
        Ok(self.replace_listings(listings, Utc::now()))
    }

    fn replace_listings(&self, listings: Vec<TokenListing>, now: DateTime<Utc>) -> usize {
        let mut count = 0;
        let mut keys = Vec::with_capacity(listings.len());
        for listing in listings {
            let key = (listing.chain, listing.fee_token_address.to_lowercase());
            let entries: Vec<DirectoryEntry> = listing
                .broadcasters
                .into_iter()
                .map(|listed| DirectoryEntry {
                    candidate: BroadcasterCandidate {
                        railgun_address: listed.railgun_address,
                        token_fee: TokenFee {
                            fee_per_unit_gas: listed.fee_per_unit_gas,
                            expiration: fee_expiration(now, listed.fee_ttl_secs),
                            reliability: listed.reliability,
                        },
                    },
                    supports_relay_adapt: listed.supports_relay_adapt,
                })
                .collect();
            count += entries.len();
            keys.push(key.clone());
            self.entries.insert(key, entries);
        }
        // drop tokens no longer listed
        self.entries.retain(|key, _| keys.contains(key));
        count
    }

    /// Eligible candidates for a token, or `None` if the token is not listed at all.
    fn eligible(
        &self,
        chain: Chain,
        fee_token_address: &str,
        use_relay_adapt: bool,
        now: DateTime<Utc>,
    ) -> Option<Vec<BroadcasterCandidate>> {
        let listed = self
            .entries
            .get(&(chain, fee_token_address.to_lowercase()))?;
        let filters = self.filters.read().unwrap();
        Some(
            listed
                .iter()
                .filter(|entry| !use_relay_adapt || entry.supports_relay_adapt)
                .filter(|entry| filters.allows(&entry.candidate.railgun_address))
                .filter(|entry| entry.candidate.token_fee.expiration > now)
                .map(|entry| entry.candidate.clone())
                .collect(),
        )
    }

    fn best(
        &self,
        chain: Chain,
        fee_token_address: &str,
        use_relay_adapt: bool,
        now: DateTime<Utc>,
    ) -> Option<BroadcasterCandidate> {
        self.eligible(chain, fee_token_address, use_relay_adapt, now)?
            .into_iter()
            .min_by(|a, b| {
                a.token_fee
                    .fee_per_unit_gas
                    .cmp(&b.token_fee.fee_per_unit_gas)
                    .then_with(|| {
                        b.token_fee
                            .reliability_or_zero()
                            .total_cmp(&a.token_fee.reliability_or_zero())
                    })
            })
    }
}

/// `now + fee_ttl_secs`, saturating at the latest representable time.
fn fee_expiration(now: DateTime<Utc>, fee_ttl_secs: u64) -> DateTime<Utc> {
    i64::try_from(fee_ttl_secs)
        .ok()
        .and_then(TimeDelta::try_seconds)
        .and_then(|ttl| now.checked_add_signed(ttl))
        .unwrap_or(DateTime::<Utc>::MAX_UTC)
}

#[async_trait]
impl BroadcasterQuery for BroadcasterDirectory {
    async fn find_best_broadcaster(
        &self,
        chain: Chain,
        fee_token_address: &str,
        use_relay_adapt: bool,
    ) -> QueryResult<Option<BroadcasterCandidate>> {
        Ok(self.best(chain, fee_token_address, use_relay_adapt, Utc::now()))
    }

    async fn find_all_broadcasters_for_token(
        &self,
        chain: Chain,
        fee_token_address: &str,
        use_relay_adapt: bool,
    ) -> QueryResult<Option<Vec<BroadcasterCandidate>>> {
        Ok(self.eligible(chain, fee_token_address, use_relay_adapt, Utc::now()))
    }

    async fn update_address_filters(
        &self,
        allowlist: Option<Vec<String>>,
        blocklist: Vec<String>,
    ) -> QueryResult<()> {
        debug!(
            "directory filters updated: allowlist {:?}, {} blocked",
            allowlist.as_ref().map(Vec::len),
            blocklist.len()
        );
        *self.filters.write().unwrap() = AddressFilters {
            allowlist,
            blocklist,
        };
        Ok(())
    }
}

/// Reloads the directory file every `refresh_duration` until `exit` is cancelled.
pub struct DirectoryRefresher {
    refresh_thread: JoinHandle<()>,
}

impl DirectoryRefresher {
    pub fn new(
        directory: &Arc<BroadcasterDirectory>,
        refresh_duration: Duration,
        exit: &CancellationToken,
    ) -> DirectoryRefresher {
        let directory = directory.clone();
        let exit = exit.clone();

        let refresh_thread = Builder::new()
            .name("directory_refresher".to_string())
            .spawn(move || {
                let tick_receiver = tick(Duration::from_secs(1));
                let mut last_refresh = Instant::now();

                while !exit.is_cancelled() {
                    let _ = tick_receiver.recv();
                    if last_refresh.elapsed() < refresh_duration {
                        continue;
                    }

                    let now = Instant::now();
                    match directory.reload() {
                        Ok(count) => debug!(
                            "reloaded {count} broadcasters from {:?} in {:?}",
                            directory.path(),
                            now.elapsed()
                        ),
                        // keep serving the last good listing
                        Err(e) => error!("error reloading broadcaster directory: {e}"),
                    }
                    last_refresh = Instant::now();
                }
                info!("directory refresher stopped");
            })
            .unwrap();

        DirectoryRefresher { refresh_thread }
    }

    pub fn join(self) -> thread::Result<()> {
        self.refresh_thread.join()
    }
}

#[cfg(test)]
mod tests {
    use shroud_core::fee_policy::FeePolicy;

    use super::*;

    const TOKEN: &str = "0xAbCd000000000000000000000000000000000001";

    const LISTING: &str = r#"
- chain: { type: 0, id: 1 }
  feeTokenAddress: "0xAbCd000000000000000000000000000000000001"
  broadcasters:
    - railgunAddress: 0zkCheap
      feePerUnitGas: "0x64"
      feeTtlSecs: 300
      reliability: 0.4
    - railgunAddress: 0zkAdapt
      feePerUnitGas: "120"
      feeTtlSecs: 300
      reliability: 0.9
      supportsRelayAdapt: true
    - railgunAddress: 0zkTwin
      feePerUnitGas: "100"
      feeTtlSecs: 300
      reliability: 0.7
    - railgunAddress: 0zkStale
      feePerUnitGas: "1"
      feeTtlSecs: 0
- chain: { type: 0, id: 137 }
  feeTokenAddress: "0x0000000000000000000000000000000000000002"
  broadcasters: []
"#;

    fn write_directory(dir: &tempfile::TempDir, contents: &str) -> PathBuf {
        let path = dir.path().join("broadcasters.yaml");
        std::fs::write(&path, contents).unwrap();
        path
    }

    fn addresses(candidates: &[BroadcasterCandidate]) -> Vec<&str> {
        let mut addresses: Vec<_> = candidates
            .iter()
            .map(|c| c.railgun_address.as_str())
            .collect();
        addresses.sort_unstable();
        addresses
    }

    #[tokio::test]
    async fn test_find_all_filters_expired_and_relay_adapt() {
        let dir = tempfile::tempdir().unwrap();
        let directory = BroadcasterDirectory::load(write_directory(&dir, LISTING)).unwrap();

        // token lookups ignore address casing
        let all = directory
            .find_all_broadcasters_for_token(Chain::evm(1), &TOKEN.to_lowercase(), false)
            .await
            .unwrap()
            .unwrap();
        assert_eq!(addresses(&all), vec!["0zkAdapt", "0zkCheap", "0zkTwin"]);

        let adapt = directory
            .find_all_broadcasters_for_token(Chain::evm(1), TOKEN, true)
            .await
            .unwrap()
            .unwrap();
        assert_eq!(addresses(&adapt), vec!["0zkAdapt"]);

        // listed with nobody is different from not listed
        let empty = directory
            .find_all_broadcasters_for_token(
                Chain::evm(137),
                "0x0000000000000000000000000000000000000002",
                false,
            )
            .await
            .unwrap();
        assert_eq!(empty, Some(Vec::new()));
        let unknown = directory
            .find_all_broadcasters_for_token(Chain::evm(1), "0xdead", false)
            .await
            .unwrap();
        assert_eq!(unknown, None);
    }

    #[tokio::test]
    async fn test_find_best_prefers_lowest_fee_then_reliability() {
        let dir = tempfile::tempdir().unwrap();
        let directory = BroadcasterDirectory::load(write_directory(&dir, LISTING)).unwrap();

        let best = directory
            .find_best_broadcaster(Chain::evm(1), TOKEN, false)
            .await
            .unwrap()
            .unwrap();
        assert_eq!(best.railgun_address, "0zkTwin");
        assert_eq!(best.token_fee.fee_per_unit_gas, FeePerUnitGas::new(100));
        assert!(!FeePolicy::default().is_fee_about_to_expire(&best.token_fee, Utc::now()));

        let best_adapt = directory
            .find_best_broadcaster(Chain::evm(1), TOKEN, true)
            .await
            .unwrap()
            .unwrap();
        assert_eq!(best_adapt.railgun_address, "0zkAdapt");
    }

    #[tokio::test]
    async fn test_address_filters_apply_to_queries() {
        let dir = tempfile::tempdir().unwrap();
        let directory = BroadcasterDirectory::load(write_directory(&dir, LISTING)).unwrap();

        directory
            .update_address_filters(None, vec!["0zkTwin".to_string()])
            .await
            .unwrap();
        let best = directory
            .find_best_broadcaster(Chain::evm(1), TOKEN, false)
            .await
            .unwrap()
            .unwrap();
        assert_eq!(best.railgun_address, "0zkCheap");

        directory
            .update_address_filters(Some(vec!["0zkAdapt".to_string()]), Vec::new())
            .await
            .unwrap();
        let all = directory
            .find_all_broadcasters_for_token(Chain::evm(1), TOKEN, false)
            .await
            .unwrap()
            .unwrap();
        assert_eq!(addresses(&all), vec!["0zkAdapt"]);

        directory
            .update_address_filters(Some(Vec::new()), Vec::new())
            .await
            .unwrap();
        let best = directory
            .find_best_broadcaster(Chain::evm(1), TOKEN, false)
            .await
            .unwrap();
        assert_eq!(best, None);
    }

    #[test]
    fn test_reload_replaces_listings() {
        let dir = tempfile::tempdir().unwrap();
        let path = write_directory(&dir, LISTING);
        let directory = BroadcasterDirectory::load(&path).unwrap();
        assert_eq!(directory.entries.len(), 2);

        std::fs::write(
            &path,
            r#"
- chain: { type: 0, id: 1 }
  feeTokenAddress: "0xabcd000000000000000000000000000000000001"
  broadcasters:
    - railgunAddress: 0zkOnly
      feePerUnitGas: "5"
      feeTtlSecs: 60
"#,
        )
        .unwrap();
        assert_eq!(directory.reload().unwrap(), 1);
        assert_eq!(directory.entries.len(), 1);

        let best = directory.best(Chain::evm(1), TOKEN, false, Utc::now()).unwrap();
        assert_eq!(best.railgun_address, "0zkOnly");
        assert_eq!(best.token_fee.reliability, None);
    }

    #[test]
    fn test_bad_reload_keeps_previous_listing() {
        let dir = tempfile::tempdir().unwrap();
        let path = write_directory(&dir, LISTING);
        let directory = BroadcasterDirectory::load(&path).unwrap();

        std::fs::write(&path, "- chain: [not, a, chain]").unwrap();
        assert!(matches!(directory.reload(), Err(DirectoryError::Yaml(_))));
        assert!(directory.best(Chain::evm(1), TOKEN, false, Utc::now()).is_some());

        std::fs::remove_file(&path).unwrap();
        assert!(matches!(directory.reload(), Err(DirectoryError::Io { .. })));
    }

    #[test]
    fn test_refresher_stops_on_exit() {
        let dir = tempfile::tempdir().unwrap();
        let directory =
            Arc::new(BroadcasterDirectory::load(write_directory(&dir, LISTING)).unwrap());
        let exit = CancellationToken::new();

        let refresher = DirectoryRefresher::new(&directory, Duration::from_secs(60), &exit);
        exit.cancel();
        refresher.join().unwrap();
    }

    #[test]
    fn test_huge_fee_ttl_saturates() {
        let dir = tempfile::tempdir().unwrap();
        let directory = BroadcasterDirectory::load(write_directory(
            &dir,
            r#"
- chain: { type: 0, id: 1 }
  feeTokenAddress: "0xabcd000000000000000000000000000000000001"
  broadcasters:
    - railgunAddress: 0zkForever
      feePerUnitGas: "5"
      feeTtlSecs: 9000000000000
    - railgunAddress: 0zkMax
      feePerUnitGas: "6"
      feeTtlSecs: 18446744073709551615
"#,
        ))
        .unwrap();

        let eligible = directory
            .eligible(Chain::evm(1), TOKEN, false, Utc::now())
            .unwrap();
        assert_eq!(addresses(&eligible), vec!["0zkForever", "0zkMax"]);
        assert!(eligible
            .iter()
            .all(|c| c.token_fee.expiration == DateTime::<Utc>::MAX_UTC));

        let now = Utc::now();
        assert_eq!(fee_expiration(now, 60), now + TimeDelta::seconds(60));
    }
}
