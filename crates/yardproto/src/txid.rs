//! Transaction-id minting and validation.
//!
//! Ids correlate a response envelope back to its pending request, so two
//! mints in the same millisecond must still differ. The minter combines the
//! wall clock (milliseconds since the Unix epoch, the same clock the
//! envelope timestamps use) with a per-process atomic counter, rendered as
//! fixed-width decimal digits.

use std::sync::atomic::{AtomicU64, Ordering};
use std::time::{SystemTime, UNIX_EPOCH};

/// Width of the millisecond field. 13 digits covers the epoch until the
/// year 2286.
const MILLIS_WIDTH: usize = 13;

/// Width of the counter field. Wraps at 100 million mints, far beyond what
/// a single millisecond can see.
const COUNTER_WIDTH: usize = 8;

/// Total rendered length of a transaction id.
pub const TRANSACTION_ID_LEN: usize = MILLIS_WIDTH + COUNTER_WIDTH;

static COUNTER: AtomicU64 = AtomicU64::new(0);

/// Mint a fresh transaction id.
///
/// The id is `<millis:13><counter:8>` in decimal. The counter increments on
/// every mint, so ids minted within the same millisecond remain distinct.
pub fn mint_transaction_id() -> String {
    let millis = SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|d| d.as_millis() as u64)
        .unwrap_or(0);
    let seq = COUNTER.fetch_add(1, Ordering::Relaxed) % 100_000_000;
    format!("{:0mw$}{:0cw$}", millis, seq, mw = MILLIS_WIDTH, cw = COUNTER_WIDTH)
}

/// Validate that `id` could have been produced by [`mint_transaction_id`].
///
/// Accepts exactly the minter's alphabet and shape: `TRANSACTION_ID_LEN`
/// ASCII decimal digits. Anything else - wrong length, hex, separators,
/// whitespace - is rejected.
pub fn is_valid_transaction_id(id: &str) -> bool {
    id.len() == TRANSACTION_ID_LEN && id.bytes().all(|b| b.is_ascii_digit())
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::HashSet;

    #[test]
    fn minted_ids_validate() {
        let id = mint_transaction_id();
        assert_eq!(id.len(), TRANSACTION_ID_LEN);
        assert!(is_valid_transaction_id(&id));
    }

    #[test]
    fn same_millisecond_ids_are_distinct() {
        // 1000 mints land in a handful of milliseconds; all must differ.
        let ids: HashSet<String> = (0..1000).map(|_| mint_transaction_id()).collect();
        assert_eq!(ids.len(), 1000);
    }

    #[test]
    fn rejects_foreign_alphabets() {
        assert!(!is_valid_transaction_id(""));
        assert!(!is_valid_transaction_id("abc"));
        assert!(!is_valid_transaction_id(&"9".repeat(TRANSACTION_ID_LEN - 1)));
        assert!(!is_valid_transaction_id(&"9".repeat(TRANSACTION_ID_LEN + 1)));
        assert!(!is_valid_transaction_id(&format!(
            "{}a",
            "1".repeat(TRANSACTION_ID_LEN - 1)
        )));
        // UUID-shaped ids come from other systems, not this minter.
        assert!(!is_valid_transaction_id("0af7651916cd43dd8448eb211c8"));
    }

    #[test]
    fn accepts_only_exact_shape() {
        assert!(is_valid_transaction_id(&"0".repeat(TRANSACTION_ID_LEN)));
        assert!(!is_valid_transaction_id(&format!(
            " {}",
            "0".repeat(TRANSACTION_ID_LEN - 1)
        )));
    }
}
