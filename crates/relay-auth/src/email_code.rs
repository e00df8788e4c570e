//! Email verification codes: issue, verify, single-use.
//!
//! Only a digest of the code is retained; the plaintext goes to the mailer
//! collaborator once and is never stored.

use std::collections::HashMap;
use std::sync::Mutex;

use relay_core::{current_unix_timestamp_ms, mix64};
use sha2::{Digest, Sha256};

/// Codes expire ten minutes after issue.
pub const DEFAULT_CODE_TTL_MS: u64 = 10 * 60 * 1000;

struct IssuedCode {
    digest: [u8; 32],
    expires_at_unix_ms: u64,
}

/// In-process issuer of six-digit verification codes, keyed by email.
///
/// Re-issuing for the same address replaces the previous code.
pub struct EmailCodeIssuer {
    codes: Mutex<HashMap<String, IssuedCode>>,
    ttl_ms: u64,
}

impl EmailCodeIssuer {
    pub fn new(ttl_ms: u64) -> Self {
        Self {
            codes: Mutex::new(HashMap::new()),
            ttl_ms: ttl_ms.max(1_000),
        }
    }

    /// Issues a fresh code for `email`, returning the plaintext for
    /// delivery.
    pub fn issue(&self, email: &str) -> String {
        self.issue_at(email, current_unix_timestamp_ms())
    }

    /// Checks and consumes a code. Wrong, expired, and replayed codes all
    /// read as plain `false`.
    pub fn verify(&self, email: &str, code: &str) -> bool {
        self.verify_at(email, code, current_unix_timestamp_ms())
    }

    fn issue_at(&self, email: &str, now_unix_ms: u64) -> String {
        // The mixer output is folded through a digest of time + counter so
        // the six digits are not predictable from one observed code.
        let seed = Sha256::digest(format!("{}:{}:{}", email, now_unix_ms, mix64()));
        let value = u32::from_be_bytes([seed[0], seed[1], seed[2], seed[3]]);
        let code = format!("{:06}", value % 1_000_000);

        let mut codes = self.codes.lock().expect("email code lock poisoned");
        codes.insert(
            email.to_ascii_lowercase(),
            IssuedCode {
                digest: code_digest(email, &code),
                expires_at_unix_ms: now_unix_ms + self.ttl_ms,
            },
        );
        code
    }

    fn verify_at(&self, email: &str, code: &str, now_unix_ms: u64) -> bool {
        let key = email.to_ascii_lowercase();
        let mut codes = self.codes.lock().expect("email code lock poisoned");
        let Some(issued) = codes.get(&key) else {
            return false;
        };
        if issued.expires_at_unix_ms <= now_unix_ms {
            codes.remove(&key);
            return false;
        }
        if issued.digest != code_digest(email, code) {
            return false;
        }
        // Single use.
        codes.remove(&key);
        true
    }
}

impl Default for EmailCodeIssuer {
    fn default() -> Self {
        Self::new(DEFAULT_CODE_TTL_MS)
    }
}

fn code_digest(email: &str, code: &str) -> [u8; 32] {
    Sha256::digest(format!("{}:{}", email.to_ascii_lowercase(), code)).into()
}
