//! Pure timing functions for retry backoff and sync cooldown
//!
//! Kept free of clocks and I/O so the state machine around them can be
//! tested without timing flakiness.

use chrono::{DateTime, Utc};
use std::time::Duration;

/// Exponential backoff delay for a queue entry: base × 2^attempts,
/// capped.
pub fn backoff_delay(attempts: u32, base: Duration, cap: Duration) -> Duration {
    // Clamp the exponent; 2^31 is past any sane cap anyway
    let factor = 2u32.saturating_pow(attempts.min(31));
    base.saturating_mul(factor).min(cap)
}

/// Whether a failed entry's backoff window has elapsed and it may
/// return to the pending state.
///
/// An entry that has never been attempted is always eligible.
pub fn retry_eligible(
    last_attempt_at: Option<DateTime<Utc>>,
    attempts: u32,
    now: DateTime<Utc>,
    base: Duration,
    cap: Duration,
) -> bool {
    match last_attempt_at {
        Some(last) => {
            let delay = backoff_delay(attempts, base, cap);
            let elapsed = (now - last).to_std().unwrap_or(Duration::ZERO);
            elapsed >= delay
        }
        None => true,
    }
}

/// Check if enough time has elapsed since the last sync pass to allow
/// a new periodic-timer pass.
///
/// Explicit user refresh and online-transition triggers bypass this.
pub fn cooldown_elapsed(last_sync_at: Option<DateTime<Utc>>, cooldown_secs: u64) -> bool {
    match last_sync_at {
        Some(last) => {
            let elapsed = Utc::now() - last;
            elapsed.num_seconds() >= cooldown_secs as i64
        }
        None => true, // Never synced, so cooldown has "elapsed"
    }
}
