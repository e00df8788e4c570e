//! Request-id and pseudo-random id material without a `rand` dependency.
//!
//! Identifier entropy comes from a millisecond timestamp folded with an
//! atomic splitmix-style counter. Nothing here is cryptographic; callers
//! that need unguessable secrets must hash this material with a digest of
//! additional inputs.

use std::sync::atomic::{AtomicU64, Ordering};
use std::time::{SystemTime, UNIX_EPOCH};

static REQUEST_COUNTER: AtomicU64 = AtomicU64::new(1);
static MIX_COUNTER: AtomicU64 = AtomicU64::new(1);

const ID_ALPHABET: &[u8] = b"abcdefghijklmnopqrstuvwxyz0123456789";

/// Returns a monotonically distinct request id of the form `relay-<ms>-<n>`.
pub fn new_request_id() -> String {
    let millis = SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .unwrap_or_default()
        .as_millis();
    let count = REQUEST_COUNTER.fetch_add(1, Ordering::Relaxed);
    format!("relay-{millis}-{count}")
}

/// Returns a well-mixed 64-bit value distinct per call.
pub fn mix64() -> u64 {
    let seed = MIX_COUNTER.fetch_add(1, Ordering::Relaxed);
    let time = SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .unwrap_or_default()
        .as_nanos() as u64;
    splitmix(seed ^ time.rotate_left(31))
}

/// Returns a lowercase alphanumeric id of `len` characters.
pub fn random_id(len: usize) -> String {
    let mut out = String::with_capacity(len);
    let mut state = mix64();
    for _ in 0..len {
        state = splitmix(state);
        let index = (state % ID_ALPHABET.len() as u64) as usize;
        out.push(ID_ALPHABET[index] as char);
    }
    out
}

fn splitmix(value: u64) -> u64 {
    let mut z = value.wrapping_add(0x9E37_79B9_7F4A_7C15);
    z = (z ^ (z >> 30)).wrapping_mul(0xBF58_476D_1CE4_E5B9);
    z = (z ^ (z >> 27)).wrapping_mul(0x94D0_49BB_1331_11EB);
    z ^ (z >> 31)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn request_ids_are_unique() {
        let a = new_request_id();
        let b = new_request_id();
        assert_ne!(a, b);
        assert!(a.starts_with("relay-"));
    }

    #[test]
    fn random_id_has_requested_length_and_alphabet() {
        let id = random_id(24);
        assert_eq!(id.len(), 24);
        assert!(id
            .bytes()
            .all(|b| b.is_ascii_lowercase() || b.is_ascii_digit()));
    }

    #[test]
    fn mix64_varies_between_calls() {
        let seen: std::collections::HashSet<u64> = (0..64).map(|_| mix64()).collect();
        assert!(seen.len() > 32, "mixer output collapsed: {}", seen.len());
    }
}
