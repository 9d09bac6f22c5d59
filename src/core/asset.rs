//! Asset names: an uppercase ticker of 1 to 16 letters, optionally suffixed with `/N`
//! (1 to 6 digits) giving the decimal precision, e.g. `USD/2`.

use serde::{Deserialize, Deserializer, Serialize};
use std::fmt;
use std::str::FromStr;

use thiserror::Error;

#[derive(Error, Debug, Clone, PartialEq, Eq)]
#[error("invalid asset '{0}'")]
pub struct InvalidAsset(pub String);

/// Validated asset name.
#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize)]
#[serde(transparent)]
pub struct Asset(String);

impl Asset {
    pub fn parse(name: &str) -> Result<Self, InvalidAsset> {
        if is_valid_asset(name) {
            Ok(Self(name.to_string()))
        } else {
            Err(InvalidAsset(name.to_string()))
        }
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }

    /// Decimal precision declared by the `/N` suffix, 0 when absent.
    pub fn precision(&self) -> u32 {
        self.0
            .split_once('/')
            .and_then(|(_, p)| p.parse().ok())
            .unwrap_or(0)
    }
}

/// Checks `^[A-Z]{1,16}(/\d{1,6})?$`.
pub fn is_valid_asset(name: &str) -> bool {
    let (ticker, precision) = match name.split_once('/') {
        Some((ticker, precision)) => (ticker, Some(precision)),
        None => (name, None),
    };
    let ticker_ok = (1..=16).contains(&ticker.len()) && ticker.bytes().all(|b| b.is_ascii_uppercase());
    let precision_ok = match precision {
        None => true,
        Some(p) => (1..=6).contains(&p.len()) && p.bytes().all(|b| b.is_ascii_digit()),
    };
    ticker_ok && precision_ok
}

impl FromStr for Asset {
    type Err = InvalidAsset;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        Asset::parse(s)
    }
}

impl fmt::Display for Asset {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

impl<'de> Deserialize<'de> for Asset {
    fn deserialize<D: Deserializer<'de>>(deserializer: D) -> Result<Self, D::Error> {
        let name = String::deserialize(deserializer)?;
        Asset::parse(&name).map_err(serde::de::Error::custom)
    }
}
