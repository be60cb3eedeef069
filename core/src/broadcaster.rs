//! Broadcaster data model shared by the selection loop, the address filters and the
//! directory client.
//!
//! A broadcaster (sometimes called a relayer) submits a private transaction on behalf of
//! the user in exchange for a fee paid in some token. Every poll of the broadcaster network
//! yields fresh, immutable [`BroadcasterCandidate`] snapshots; the selection loop pins one of
//! them as a [`SelectedBroadcaster`] together with the fee token it was evaluated against.

use std::{cmp::Ordering, fmt, str::FromStr};

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

/// Errors produced while parsing a `feePerUnitGas` quote.
#[derive(Debug, PartialEq, Eq, thiserror::Error)]
pub enum FeeParseError {
    #[error("fee is empty")]
    Empty,

    #[error("invalid fee {value:?}: {source}")]
    Invalid {
        value: String,
        source: std::num::ParseIntError,
    },
}

/// Fee per unit of gas quoted by a broadcaster, in the smallest unit of the fee token.
///
/// Broadcasters announce fees as numeric strings, either decimal or `0x`-prefixed hex.
/// The value is kept as an integer so that comparisons in the fee policy are exact.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(try_from = "String", into = "String")]
pub struct FeePerUnitGas(u128);

impl FeePerUnitGas {
    pub const fn new(value: u128) -> Self {
        Self(value)
    }

    pub const fn get(self) -> u128 {
        self.0
    }
}

impl FromStr for FeePerUnitGas {
    type Err = FeeParseError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let trimmed = s.trim();
        if trimmed.is_empty() {
            return Err(FeeParseError::Empty);
        }
        let parsed = match trimmed
            .strip_prefix("0x")
            .or_else(|| trimmed.strip_prefix("0X"))
        {
            Some(hex) => u128::from_str_radix(hex, 16),
            None => trimmed.parse::<u128>(),
        };
        parsed.map(Self).map_err(|source| FeeParseError::Invalid {
            value: s.to_string(),
            source,
        })
    }
}

impl TryFrom<String> for FeePerUnitGas {
    type Error = FeeParseError;

    fn try_from(value: String) -> Result<Self, Self::Error> {
        value.parse()
    }
}

impl From<FeePerUnitGas> for String {
    fn from(fee: FeePerUnitGas) -> Self {
        fee.to_string()
    }
}

impl fmt::Display for FeePerUnitGas {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "0x{:x}", self.0)
    }
}

/// A time-bounded fee quote. The broadcaster stops honoring it after `expiration`.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct TokenFee {
    pub fee_per_unit_gas: FeePerUnitGas,

    /// Serialized as milliseconds since the unix epoch.
    #[serde(with = "chrono::serde::ts_milliseconds")]
    pub expiration: DateTime<Utc>,

    /// Delivery reliability score in `[0, 1]`, when the network reports one.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub reliability: Option<f64>,
}

impl TokenFee {
    pub fn reliability_or_zero(&self) -> f64 {
        self.reliability.unwrap_or(0.0)
    }
}

/// One peer offering to relay a transaction, as returned by a poll of the broadcaster network.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct BroadcasterCandidate {
    pub railgun_address: String,
    pub token_fee: TokenFee,
}

/// The broadcaster currently chosen for a transaction, denormalized with the fee token
/// address it was evaluated against.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct SelectedBroadcaster {
    pub railgun_address: String,
    pub token_fee: TokenFee,
    pub token_address: String,
}

impl SelectedBroadcaster {
    pub fn from_candidate(candidate: BroadcasterCandidate, token_address: &str) -> Self {
        Self {
            railgun_address: candidate.railgun_address,
            token_fee: candidate.token_fee,
            token_address: token_address.to_string(),
        }
    }

    pub fn same_identity(&self, other: &SelectedBroadcaster) -> bool {
        self.railgun_address == other.railgun_address
    }
}

#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(try_from = "u8", into = "u8")]
pub enum ChainType {
    Evm = 0,
}

impl TryFrom<u8> for ChainType {
    type Error = String;

    fn try_from(value: u8) -> Result<Self, Self::Error> {
        match value {
            0 => Ok(ChainType::Evm),
            other => Err(format!("unknown chain type: {other}")),
        }
    }
}

impl From<ChainType> for u8 {
    fn from(chain_type: ChainType) -> Self {
        chain_type as u8
    }
}

/// Network a transaction is built for. Broadcaster queries are always scoped by chain.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct Chain {
    #[serde(rename = "type")]
    pub chain_type: ChainType,
    pub id: u64,
}

impl Chain {
    pub const fn evm(id: u64) -> Self {
        Self {
            chain_type: ChainType::Evm,
            id,
        }
    }
}

impl fmt::Display for Chain {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self.chain_type {
            ChainType::Evm => write!(f, "evm:{}", self.id),
        }
    }
}

/// Token addresses are hex and may arrive with any casing.
pub fn compare_token_address(a: &str, b: &str) -> bool {
    a.eq_ignore_ascii_case(b)
}

/// Coarse bucket of a reliability score, used when presenting broadcasters.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum ReliabilityTier {
    High,
    Medium,
    Low,
    Poor,
    Unknown,
}

impl ReliabilityTier {
    pub fn from_score(score: f64) -> Self {
        if score > 0.8 {
            ReliabilityTier::High
        } else if score > 0.5 {
            ReliabilityTier::Medium
        } else if score > 0.3 {
            ReliabilityTier::Low
        } else if score > 0.0 {
            ReliabilityTier::Poor
        } else {
            ReliabilityTier::Unknown
        }
    }
}

impl fmt::Display for ReliabilityTier {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let label = match self {
            ReliabilityTier::High => "high",
            ReliabilityTier::Medium => "medium",
            ReliabilityTier::Low => "low",
            ReliabilityTier::Poor => "poor",
            ReliabilityTier::Unknown => "unknown",
        };
        f.write_str(label)
    }
}

/// Orders candidates for presentation: most reliable first, then cheapest, then by address
/// so the order is stable between polls.
pub fn sort_broadcasters(candidates: &mut [BroadcasterCandidate]) {
    candidates.sort_by(compare_candidates);
}

fn compare_candidates(a: &BroadcasterCandidate, b: &BroadcasterCandidate) -> Ordering {
    b.token_fee
        .reliability_or_zero()
        .total_cmp(&a.token_fee.reliability_or_zero())
        .then_with(|| a.token_fee.fee_per_unit_gas.cmp(&b.token_fee.fee_per_unit_gas))
        .then_with(|| a.railgun_address.cmp(&b.railgun_address))
}

#[cfg(test)]
mod tests {
    use chrono::TimeZone;

    use super::*;

    fn candidate(address: &str, fee: u128, reliability: Option<f64>) -> BroadcasterCandidate {
        BroadcasterCandidate {
            railgun_address: address.to_string(),
            token_fee: TokenFee {
                fee_per_unit_gas: FeePerUnitGas::new(fee),
                expiration: Utc.timestamp_millis_opt(1_700_000_000_000).unwrap(),
                reliability,
            },
        }
    }

    #[test]
    fn test_fee_parses_hex_and_decimal() {
        assert_eq!(
            "0x2386f26fc10000".parse::<FeePerUnitGas>().unwrap().get(),
            10_000_000_000_000_000
        );
        assert_eq!("1500".parse::<FeePerUnitGas>().unwrap().get(), 1500);
        assert_eq!("".parse::<FeePerUnitGas>(), Err(FeeParseError::Empty));
        assert!("0xnothex".parse::<FeePerUnitGas>().is_err());
    }

    #[test]
    fn test_candidate_wire_format() {
        let json = r#"{
            "railgunAddress": "0zk1qexample",
            "tokenFee": {
                "feePerUnitGas": "0x10",
                "expiration": 1700000000000,
                "reliability": 0.9
            }
        }"#;
        let parsed: BroadcasterCandidate = serde_json::from_str(json).unwrap();
        assert_eq!(parsed, candidate("0zk1qexample", 16, Some(0.9)));

        let value = serde_json::to_value(&parsed).unwrap();
        assert_eq!(value["tokenFee"]["feePerUnitGas"], "0x10");
        assert_eq!(value["tokenFee"]["expiration"], 1_700_000_000_000i64);
    }

    #[test]
    fn test_chain_wire_format() {
        let chain: Chain = serde_json::from_str(r#"{"type":0,"id":137}"#).unwrap();
        assert_eq!(chain, Chain::evm(137));
        assert!(serde_json::from_str::<Chain>(r#"{"type":7,"id":1}"#).is_err());
    }

    #[test]
    fn test_compare_token_address_ignores_case() {
        assert!(compare_token_address("0xAbCd", "0xabcd"));
        assert!(!compare_token_address("0xabcd", "0xabce"));
    }

    #[test]
    fn test_reliability_tiers() {
        assert_eq!(ReliabilityTier::from_score(0.95), ReliabilityTier::High);
        assert_eq!(ReliabilityTier::from_score(0.8), ReliabilityTier::Medium);
        assert_eq!(ReliabilityTier::from_score(0.5), ReliabilityTier::Low);
        assert_eq!(ReliabilityTier::from_score(0.1), ReliabilityTier::Poor);
        assert_eq!(ReliabilityTier::from_score(0.0), ReliabilityTier::Unknown);
    }

    #[test]
    fn test_sort_prefers_reliability_then_fee() {
        let mut candidates = vec![
            candidate("c", 10, Some(0.5)),
            candidate("b", 30, Some(0.9)),
            candidate("a", 20, Some(0.9)),
            candidate("d", 1, None),
        ];
        sort_broadcasters(&mut candidates);
        let order: Vec<_> = candidates
            .iter()
            .map(|c| c.railgun_address.as_str())
            .collect();
        assert_eq!(order, vec!["a", "b", "c", "d"]);
    }
}
