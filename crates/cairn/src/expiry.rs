//! Expiry times for indexed and stored items.
//!
//! An expiry is the time after which no store is obliged to keep an item.
//! `None` means the item never expires.

use jiff::{SignedDuration, Timestamp};

/// True if `expiry` is strictly before `now`.
pub fn is_expired(expiry: Option<Timestamp>, now: Timestamp) -> bool {
    expiry.is_some_and(|at| at < now)
}

/// An expiry `secs` seconds after `now`.
pub fn expire_after(now: Timestamp, secs: i64) -> Option<Timestamp> {
    now.checked_add(SignedDuration::from_secs(secs)).ok()
}
