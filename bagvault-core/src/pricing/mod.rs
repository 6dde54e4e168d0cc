//! Pure pricing arithmetic.
//!
//! Converts published provider rate tiers into a storage offer and a
//! contract balance into a human time estimate. Monetary amounts are
//! nano-coin integers held in [`BigUint`]; on-chain balances exceed safe
//! floating precision, so floats never touch money. The only float here
//! renders human-readable sizes.

use std::fmt;

use chrono::{DateTime, Utc};
use num_bigint::BigUint;

pub const BYTES_PER_MB: u64 = 1024 * 1024;
pub const SECONDS_PER_DAY: u64 = 86_400;
/// Nano-units per whole coin.
pub const NANO_PER_COIN: u64 = 1_000_000_000;

/// Rate tiers published by a storage provider.
#[derive(Debug, Clone)]
pub struct ProviderRates {
    pub available: bool,
    /// Price in nano-coins per megabyte per day.
    pub rate_per_mb_day: BigUint,
    /// Minimum payout per proof, in nano-coins.
    pub min_bounty: BigUint,
    pub space_available_mb: u64,
    /// Shortest proving interval the provider accepts, in seconds.
    pub min_span: u32,
    /// Longest proving interval the provider accepts, in seconds.
    pub max_span: u32,
}

/// Concrete storage offer derived from provider rates and a bag size.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Offer {
    /// Nano-coins per day for the full bag.
    pub per_day: BigUint,
    /// Nano-coins paid out per accepted proof.
    pub per_proof: BigUint,
    /// Proving interval in seconds.
    pub span: u32,
}

/// Daily price for storing `size_bytes`, rounded up to the next nano-coin.
pub fn price_per_day(rate_per_mb_day: &BigUint, size_bytes: u64) -> BigUint {
    (rate_per_mb_day * size_bytes + (BYTES_PER_MB - 1)) / BYTES_PER_MB
}

/// Derives the offer for storing `size_bytes` under the given rates.
///
/// Deterministic: the same rates and size always produce the same offer,
/// which is what makes the contract address reproducible before
/// deployment. Returns `None` when the provider is unavailable, lacks
/// space, or publishes an unsatisfiable span range.
pub fn best_offer(rates: &ProviderRates, size_bytes: u64) -> Option<Offer> {
    if !rates.available || rates.min_span > rates.max_span {
        return None;
    }
    if size_bytes.div_ceil(BYTES_PER_MB) > rates.space_available_mb {
        return None;
    }

    let per_day = price_per_day(&rates.rate_per_mb_day, size_bytes);
    // Prefer a daily proof, clamped into the provider's span window.
    let span = SECONDS_PER_DAY.clamp(u64::from(rates.min_span), u64::from(rates.max_span)) as u32;

    let scaled = &per_day * u64::from(span) / SECONDS_PER_DAY;
    let per_proof = if scaled < rates.min_bounty {
        rates.min_bounty.clone()
    } else {
        scaled
    };

    Some(Offer {
        per_day,
        per_proof,
        span,
    })
}

/// Remaining storage time covered by a contract balance.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TimeLeft {
    /// The price per proving interval is zero; the estimate is undefined.
    Expired,
    Remaining { seconds: u64 },
}

impl TimeLeft {
    pub fn seconds(&self) -> u64 {
        match self {
            TimeLeft::Expired => 0,
            TimeLeft::Remaining { seconds } => *seconds,
        }
    }
}

impl fmt::Display for TimeLeft {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            TimeLeft::Expired => write!(f, "Expired"),
            TimeLeft::Remaining { seconds } => {
                let days = seconds / SECONDS_PER_DAY;
                let hours = (seconds % SECONDS_PER_DAY) / 3600;
                write!(f, "{days} Days {hours} Hours")
            }
        }
    }
}

/// Estimates how long the balance keeps the contract funded.
///
/// Counts the full proving intervals the balance covers and adds whatever
/// is left of the interval currently in progress. A balance that covers
/// zero future intervals while a proof was posted recently therefore still
/// reports the remainder of the current interval rather than zero.
pub fn time_remaining(
    balance: &BigUint,
    rate_per_mb_day: &BigUint,
    size_bytes: u64,
    span_secs: u32,
    last_proof_at: DateTime<Utc>,
    now: DateTime<Utc>,
) -> TimeLeft {
    if span_secs == 0 {
        return TimeLeft::Expired;
    }

    let per_day = price_per_day(rate_per_mb_day, size_bytes);
    let price_per_span = &per_day * u64::from(span_secs) / SECONDS_PER_DAY;
    if price_per_span == BigUint::ZERO {
        return TimeLeft::Expired;
    }

    let spans_covered = u64::try_from(balance / &price_per_span).unwrap_or(u64::MAX);

    let elapsed = (now - last_proof_at).num_seconds().max(0) as u64;
    let left_in_current = u64::from(span_secs).saturating_sub(elapsed);

    let seconds =
        left_in_current.saturating_add(spans_covered.saturating_mul(u64::from(span_secs)));
    TimeLeft::Remaining { seconds }
}

/// Renders a byte count for display, binary units.
pub fn format_size(bytes: u64) -> String {
    const KB: u64 = 1024;
    const MB: u64 = 1024 * KB;
    const GB: u64 = 1024 * MB;
    match bytes {
        b if b < KB => format!("{b} Bytes"),
        b if b < MB => format!("{:.2} KB", b as f64 / KB as f64),
        b if b < GB => format!("{:.2} MB", b as f64 / MB as f64),
        b => format!("{:.2} GB", b as f64 / GB as f64),
    }
}

/// Renders a nano-coin amount as a decimal coin string, trailing zeros
/// trimmed.
pub fn format_nano(amount: &BigUint) -> String {
    let base = BigUint::from(NANO_PER_COIN);
    let whole = amount / &base;
    let frac = u64::try_from(amount % &base).unwrap_or(0);
    if frac == 0 {
        return whole.to_string();
    }
    let digits = format!("{frac:09}");
    format!("{whole}.{}", digits.trim_end_matches('0'))
}
