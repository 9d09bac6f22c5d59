use chrono::{DateTime, SubsecRound, Utc};
use serde::Serialize;
use sha2::{Digest, Sha256};

use crate::error::{LedgerError, Result};

/// Domain separator prepended to every hashed log.
pub const LOG_HASH_DOMAIN: &[u8] = b"LedgerLogChain";

/// SHA-256 of `domain || previous || canonical_json(message)`, hex encoded.
///
/// Serialization goes through `serde_json`, so the digest is deterministic as long as
/// every map inside `message` is ordered (all ledger maps are `BTreeMap`s).
pub fn hash_chained<T: Serialize>(domain: &[u8], previous: Option<&str>, message: &T) -> Result<String> {
    let payload = serde_json::to_vec(message)
        .map_err(|e| LedgerError::Internal(format!("serializing hashed payload: {}", e)))?;
    let mut hasher = Sha256::new();
    hasher.update(domain);
    if let Some(previous) = previous {
        hasher.update(previous.as_bytes());
    }
    hasher.update(&payload);
    Ok(hex::encode(hasher.finalize()))
}

/// SHA-256 digest of a script source, used as a content address.
pub fn digest_source(source: &str) -> [u8; 32] {
    Sha256::digest(source.as_bytes()).into()
}

/// Current UTC time truncated to whole seconds.
pub fn now_truncated() -> DateTime<Utc> {
    Utc::now().trunc_subsecs(0)
}

/// Human readable duration such as `1h2m3s`, used in timestamp errors.
pub fn format_duration(duration: chrono::Duration) -> String {
    let total = duration.num_milliseconds();
    if total % 1000 != 0 {
        return format!("{}ms", total);
    }
    let mut secs = total / 1000;
    let hours = secs / 3600;
    secs %= 3600;
    let minutes = secs / 60;
    secs %= 60;
    match (hours, minutes) {
        (0, 0) => format!("{}s", secs),
        (0, m) => format!("{}m{}s", m, secs),
        (h, m) => format!("{}h{}m{}s", h, m, secs),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_hash_chained_depends_on_previous() {
        let a = hash_chained(LOG_HASH_DOMAIN, None, &"payload").unwrap();
        let b = hash_chained(LOG_HASH_DOMAIN, Some(&a), &"payload").unwrap();
        assert_ne!(a, b);
        assert_eq!(a, hash_chained(LOG_HASH_DOMAIN, None, &"payload").unwrap());
        assert_eq!(a.len(), 64);
    }

    #[test]
    fn test_digest_source_is_stable() {
        assert_eq!(digest_source("send"), digest_source("send"));
        assert_ne!(digest_source("send"), digest_source("send "));
    }

    #[test]
    fn test_format_duration() {
        assert_eq!(format_duration(chrono::Duration::seconds(1)), "1s");
        assert_eq!(format_duration(chrono::Duration::seconds(61)), "1m1s");
        assert_eq!(format_duration(chrono::Duration::seconds(3723)), "1h2m3s");
        assert_eq!(format_duration(chrono::Duration::milliseconds(1500)), "1500ms");
    }
}
