//! Account addresses and account views.
//!
//! An address is one or more segments of `[a-zA-Z0-9_]` joined by `:`, e.g. `users:001`.
//! `world` is the distinguished account money is created from and destroyed into.

use serde::{Deserialize, Serialize};

use crate::core::metadata::Metadata;
use crate::core::volumes::{AssetsBalances, AssetsVolumes};
use crate::machine::monetary::MonetaryInt;

pub const WORLD: &str = "world";

/// Checks `^[a-zA-Z_0-9]+(:[a-zA-Z_0-9]+)*$`.
pub fn is_valid_address(address: &str) -> bool {
    !address.is_empty()
        && address
            .split(':')
            .all(|segment| !segment.is_empty() && segment.bytes().all(|b| b.is_ascii_alphanumeric() || b == b'_'))
}

/// An account with its metadata, volumes and derived balances.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct AccountWithVolumes {
    pub address: String,
    #[serde(default)]
    pub metadata: Metadata,
    #[serde(default)]
    pub volumes: AssetsVolumes,
    #[serde(default)]
    pub balances: AssetsBalances,
}

impl AccountWithVolumes {
    pub fn new(address: impl Into<String>, metadata: Metadata, volumes: AssetsVolumes) -> Self {
        let balances = volumes
            .iter()
            .map(|(asset, v)| (asset.clone(), v.balance()))
            .collect();
        Self {
            address: address.into(),
            metadata,
            volumes,
            balances,
        }
    }

    /// Balance for `asset`, zero when the account never held it.
    pub fn balance(&self, asset: &str) -> MonetaryInt {
        self.volumes
            .get(asset)
            .map(|v| v.balance())
            .unwrap_or_default()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::core::volumes::Volumes;

    #[test]
    fn test_valid_addresses() {
        for address in ["world", "users:001", "a_b:C_9:x", "_"] {
            assert!(is_valid_address(address), "{} should be valid", address);
        }
    }

    #[test]
    fn test_invalid_addresses() {
        for address in ["", ":", "users:", ":users", "users::001", "us-ers", "users 001", "@users"] {
            assert!(!is_valid_address(address), "{} should be invalid", address);
        }
    }

    #[test]
    fn test_balances_derived_from_volumes() {
        let mut volumes = AssetsVolumes::new();
        volumes.insert("USD".into(), Volumes::new(100u64, 30u64));
        let account = AccountWithVolumes::new("users:001", Metadata::new(), volumes);
        assert_eq!(account.balances["USD"], MonetaryInt::from(70u64));
        assert_eq!(account.balance("USD"), MonetaryInt::from(70u64));
        assert_eq!(account.balance("EUR"), MonetaryInt::zero());
    }
}
