//! Cumulative input/output volumes per (account, asset).

use std::collections::BTreeMap;

use serde::ser::SerializeStruct;
use serde::{Deserialize, Serialize, Serializer};

use crate::machine::monetary::MonetaryInt;

/// Totals received (`input`) and sent (`output`). Both only ever grow.
#[derive(Debug, Clone, Default, PartialEq, Eq, Deserialize)]
pub struct Volumes {
    pub input: MonetaryInt,
    pub output: MonetaryInt,
}

impl Volumes {
    pub fn new(input: impl Into<MonetaryInt>, output: impl Into<MonetaryInt>) -> Self {
        Self {
            input: input.into(),
            output: output.into(),
        }
    }

    pub fn balance(&self) -> MonetaryInt {
        &self.input - &self.output
    }
}

impl Serialize for Volumes {
    fn serialize<S: Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        let mut state = serializer.serialize_struct("Volumes", 3)?;
        state.serialize_field("input", &self.input)?;
        state.serialize_field("output", &self.output)?;
        state.serialize_field("balance", &self.balance())?;
        state.end()
    }
}

pub type AssetsVolumes = BTreeMap<String, Volumes>;
pub type AssetsBalances = BTreeMap<String, MonetaryInt>;

/// `account -> asset -> volumes`.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(transparent)]
pub struct AccountsAssetsVolumes(BTreeMap<String, AssetsVolumes>);

impl AccountsAssetsVolumes {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn get(&self, account: &str, asset: &str) -> Option<&Volumes> {
        self.0.get(account)?.get(asset)
    }

    /// Volumes of the pair, zero when untracked.
    pub fn get_volumes(&self, account: &str, asset: &str) -> Volumes {
        self.get(account, asset).cloned().unwrap_or_default()
    }

    pub fn has_account_and_asset(&self, account: &str, asset: &str) -> bool {
        self.get(account, asset).is_some()
    }

    pub fn set_volumes(&mut self, account: &str, asset: &str, volumes: Volumes) {
        self.0
            .entry(account.to_string())
            .or_default()
            .insert(asset.to_string(), volumes);
    }

    pub fn add_input(&mut self, account: &str, asset: &str, amount: &MonetaryInt) {
        self.entry(account, asset).input += amount;
    }

    pub fn add_output(&mut self, account: &str, asset: &str, amount: &MonetaryInt) {
        self.entry(account, asset).output += amount;
    }

    fn entry(&mut self, account: &str, asset: &str) -> &mut Volumes {
        self.0
            .entry(account.to_string())
            .or_default()
            .entry(asset.to_string())
            .or_default()
    }

    pub fn account(&self, account: &str) -> Option<&AssetsVolumes> {
        self.0.get(account)
    }

    pub fn iter(&self) -> impl Iterator<Item = (&String, &AssetsVolumes)> {
        self.0.iter()
    }

    pub fn is_empty(&self) -> bool {
        self.0.is_empty()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_balance_is_input_minus_output() {
        assert_eq!(Volumes::new(100u64, 40u64).balance(), MonetaryInt::from(60u64));
        assert!(Volumes::new(0u64, 40u64).balance().is_negative());
    }

    #[test]
    fn test_volumes_serialize_with_balance() {
        let json = serde_json::to_value(Volumes::new(10u64, 3u64)).unwrap();
        assert_eq!(json, serde_json::json!({"input": 10, "output": 3, "balance": 7}));
        let back: Volumes = serde_json::from_value(json).unwrap();
        assert_eq!(back, Volumes::new(10u64, 3u64));
    }

    #[test]
    fn test_accounts_assets_volumes_accumulate() {
        let mut volumes = AccountsAssetsVolumes::new();
        assert!(!volumes.has_account_and_asset("a", "USD"));
        volumes.add_input("a", "USD", &MonetaryInt::from(5u64));
        volumes.add_output("a", "USD", &MonetaryInt::from(2u64));
        assert_eq!(volumes.get_volumes("a", "USD"), Volumes::new(5u64, 2u64));
        assert_eq!(volumes.get_volumes("b", "USD"), Volumes::default());
    }
}
