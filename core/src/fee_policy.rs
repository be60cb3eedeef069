//! Fee-freshness policy: decides whether a freshly quoted broadcaster should replace the one
//! currently selected for a transaction.
//!
//! The policy is intentionally sticky. A different broadcaster only wins when its fee moved
//! by more than the configured tolerance (or went up at all), while a change of fee token or
//! an about-to-expire quote always forces a replacement. The decision is pure apart from the
//! wall clock, which [`FeePolicy::should_replace_at`] takes as an argument.

use std::time::Duration;

use chrono::{DateTime, Utc};

use crate::broadcaster::{compare_token_address, FeePerUnitGas, SelectedBroadcaster, TokenFee};

/// Minimum remaining lifetime a fee must have to be usable for a transaction.
pub const FEE_EXPIRATION_MINIMUM: Duration = Duration::from_millis(40_000);

/// Safety margin added on top of [`FEE_EXPIRATION_MINIMUM`] before a quote is considered stale.
pub const FEE_REFRESH_BEFORE_EXPIRATION_BUFFER: Duration = Duration::from_millis(20_000);

/// Relative tolerance within which two fees are treated as unchanged.
pub const DEFAULT_FEE_CHANGE_THRESHOLD: f64 = 0.05;

const PERCENT: u128 = 100;

#[derive(Clone, Copy, Debug, PartialEq)]
pub struct FeePolicy {
    /// Tolerance in whole percent of the larger fee.
    threshold_percent: u128,
    minimum_lifetime: Duration,
    refresh_buffer: Duration,
}

impl Default for FeePolicy {
    fn default() -> Self {
        Self::with_threshold(DEFAULT_FEE_CHANGE_THRESHOLD)
    }
}

impl FeePolicy {
    /// Builds a policy from a relative tolerance such as `0.05` (five percent), rounded to a
    /// whole percent. Negative or non-finite values collapse to a zero tolerance.
    pub fn with_threshold(threshold: f64) -> Self {
        let threshold_percent = if threshold.is_finite() && threshold > 0.0 {
            (threshold * PERCENT as f64).round() as u128
        } else {
            0
        };
        Self {
            threshold_percent,
            minimum_lifetime: FEE_EXPIRATION_MINIMUM,
            refresh_buffer: FEE_REFRESH_BEFORE_EXPIRATION_BUFFER,
        }
    }

    pub fn threshold(&self) -> f64 {
        self.threshold_percent as f64 / PERCENT as f64
    }

    /// True when `|a - b| * 100 / max(a, b)`, truncated to a whole percent, does not exceed
    /// the tolerance. Two zero fees are within.
    pub fn fees_within_threshold(&self, a: FeePerUnitGas, b: FeePerUnitGas) -> bool {
        let (a, b) = (a.get(), b.get());
        let diff = a.abs_diff(b);
        let max = a.max(b);
        if max == 0 {
            return true;
        }
        let percent_diff = match diff.checked_mul(PERCENT) {
            Some(scaled) => scaled / max,
            // diff * 100 only overflows when max >= diff > u128::MAX / 100
            None => diff / (max / PERCENT),
        };
        percent_diff <= self.threshold_percent
    }

    /// A fee is about to expire when it would not survive the minimum usable lifetime plus
    /// the refresh buffer if adopted at `now`.
    pub fn is_fee_about_to_expire(&self, fee: &TokenFee, now: DateTime<Utc>) -> bool {
        let lifetime = self.minimum_lifetime + self.refresh_buffer;
        let cutoff = match chrono::Duration::from_std(lifetime) {
            Ok(lifetime) => now + lifetime,
            Err(_) => DateTime::<Utc>::MAX_UTC,
        };
        cutoff >= fee.expiration
    }

    /// Whether `candidate` should replace `current`, evaluated against the wall clock.
    pub fn should_replace(
        &self,
        candidate: &SelectedBroadcaster,
        current: Option<&SelectedBroadcaster>,
    ) -> bool {
        self.should_replace_at(candidate, current, Utc::now())
    }

    pub fn should_replace_at(
        &self,
        candidate: &SelectedBroadcaster,
        current: Option<&SelectedBroadcaster>,
        now: DateTime<Utc>,
    ) -> bool {
        let Some(current) = current else {
            return true;
        };

        let old_fee = current.token_fee.fee_per_unit_gas;
        let new_fee = candidate.token_fee.fee_per_unit_gas;
        let fees_changed_significantly =
            new_fee > old_fee || !self.fees_within_threshold(old_fee, new_fee);

        let other_broadcaster_with_new_fees =
            !candidate.same_identity(current) && fees_changed_significantly;

        other_broadcaster_with_new_fees
            || !compare_token_address(&candidate.token_address, &current.token_address)
            || self.is_fee_about_to_expire(&current.token_fee, now)
    }
}

/// [`FeePolicy::should_replace`] with the default tolerance.
pub fn should_replace_current_broadcaster(
    candidate: &SelectedBroadcaster,
    current: Option<&SelectedBroadcaster>,
) -> bool {
    FeePolicy::default().should_replace(candidate, current)
}
