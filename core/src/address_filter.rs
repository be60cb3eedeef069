//! Broadcaster address filtering.
//!
//! Three sources can exclude a broadcaster from selection:
//! - **Device blocklist**: broadcasters the user (or fraud detection) blocked on this device,
//!   optionally until an expiration time
//! - **Remote blocklist**: addresses pushed by the operator through remote config
//! - **Session skiplist**: broadcasters that failed during the current session
//!
//! The merged list is what gets pushed to the broadcaster network client and what the
//! selection loop checks its current pick against. Order carries no meaning and duplicates
//! are harmless, so the merge is a plain concatenation of the live entries.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

/// A broadcaster blocked on this device.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct BlockedBroadcaster {
    pub railgun_address: String,

    /// Unix seconds when the block was added.
    pub blocked_timestamp: i64,

    /// Unix seconds after which the block no longer applies. `None` blocks forever.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub expiration: Option<i64>,
}

impl BlockedBroadcaster {
    pub fn is_active_at(&self, now: DateTime<Utc>) -> bool {
        match self.expiration {
            Some(expiration) => expiration > now.timestamp(),
            None => true,
        }
    }
}

/// Returns true if `railgun_address` appears in `blocked`, regardless of expiration.
pub fn is_broadcaster_blocked(railgun_address: &str, blocked: &[BlockedBroadcaster]) -> bool {
    blocked.iter().any(|b| b.railgun_address == railgun_address)
}

/// Merges the three exclusion sources into a single blocklist, evaluated at the wall clock.
pub fn merge_blocklists(
    device: &[BlockedBroadcaster],
    remote: &[String],
    session: &[String],
) -> Vec<String> {
    merge_blocklists_at(device, remote, session, Utc::now())
}

/// Merges the three exclusion sources, dropping device entries that expired before `now`.
pub fn merge_blocklists_at(
    device: &[BlockedBroadcaster],
    remote: &[String],
    session: &[String],
    now: DateTime<Utc>,
) -> Vec<String> {
    device
        .iter()
        .filter(|b| b.is_active_at(now))
        .map(|b| b.railgun_address.clone())
        .chain(remote.iter().cloned())
        .chain(session.iter().cloned())
        .collect()
}

/// Earliest expiration among device entries still active at `now`, i.e. the next time the
/// merged blocklist changes without any source changing.
pub fn next_device_expiration(
    device: &[BlockedBroadcaster],
    now: DateTime<Utc>,
) -> Option<DateTime<Utc>> {
    device
        .iter()
        .filter(|b| b.is_active_at(now))
        .filter_map(|b| b.expiration)
        .min()
        .map(|expiration| {
            DateTime::from_timestamp(expiration, 0).unwrap_or(DateTime::<Utc>::MAX_UTC)
        })
}

#[cfg(test)]
mod tests {
    use std::collections::HashSet;

    use chrono::TimeZone;

    use super::*;

    fn blocked(address: &str, expiration: Option<i64>) -> BlockedBroadcaster {
        BlockedBroadcaster {
            railgun_address: address.to_string(),
            blocked_timestamp: 1_699_000_000,
            expiration,
        }
    }

    #[test]
    fn test_merge_includes_all_sources() {
        let now = Utc.timestamp_opt(1_700_000_000, 0).unwrap();
        let device = vec![
            blocked("0zkDevice", None),
            blocked("0zkExpired", Some(1_699_999_999)),
            blocked("0zkTemporary", Some(1_700_000_100)),
        ];
        let remote = vec!["0zkRemote".to_string(), "0zkDevice".to_string()];
        let session = vec!["0zkSession".to_string()];

        let merged: HashSet<String> =
            merge_blocklists_at(&device, &remote, &session, now).into_iter().collect();
        let expected: HashSet<String> = ["0zkDevice", "0zkTemporary", "0zkRemote", "0zkSession"]
            .into_iter()
            .map(String::from)
            .collect();
        assert_eq!(merged, expected);
    }

    #[test]
    fn test_merge_is_idempotent() {
        let now = Utc.timestamp_opt(1_700_000_000, 0).unwrap();
        let device = vec![blocked("0zkA", None), blocked("0zkB", None)];
        let remote = vec!["0zkC".to_string()];
        let session = vec!["0zkA".to_string()];

        let first: HashSet<String> =
            merge_blocklists_at(&device, &remote, &session, now).into_iter().collect();
        let second: HashSet<String> =
            merge_blocklists_at(&device, &remote, &session, now).into_iter().collect();
        assert_eq!(first, second);
    }

    #[test]
    fn test_is_broadcaster_blocked() {
        let device = vec![blocked("0zkA", Some(1))];
        assert!(is_broadcaster_blocked("0zkA", &device));
        assert!(!is_broadcaster_blocked("0zkB", &device));
        assert!(!is_broadcaster_blocked("0zkB", &[]));
    }

    #[test]
    fn test_next_device_expiration() {
        let now = Utc.timestamp_opt(1_700_000_000, 0).unwrap();
        let device = vec![
            blocked("0zkForever", None),
            blocked("0zkExpired", Some(1_699_999_000)),
            blocked("0zkLater", Some(1_700_000_500)),
            blocked("0zkSoon", Some(1_700_000_010)),
        ];
        assert_eq!(
            next_device_expiration(&device, now),
            Some(Utc.timestamp_opt(1_700_000_010, 0).unwrap())
        );

        // once the soonest lapses, the next one is reported
        let later = Utc.timestamp_opt(1_700_000_010, 0).unwrap();
        assert_eq!(
            next_device_expiration(&device, later),
            Some(Utc.timestamp_opt(1_700_000_500, 0).unwrap())
        );
        assert_eq!(next_device_expiration(&device[..1], now), None);
    }
}
