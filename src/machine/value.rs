//! VM values: a closed sum type used for stack cells and resource slots, together with the
//! funding and allotment arithmetic the instructions rely on.
//!
//! # Invariants
//!
//! - Funding part amounts are never negative.
//! - An [`Allotment`] always sums to exactly 1.
//! - Allocation is deterministic: the same amount and allotment always yield the same parts.

use std::fmt;
use std::str::FromStr;

use num_bigint::BigInt;
use num_rational::BigRational;
use num_traits::{One, Signed, Zero};
use thiserror::Error;

use crate::core::asset::Asset;
use crate::machine::monetary::MonetaryInt;

#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum ValueError {
    #[error("two uses of `remaining` in the same allocation")]
    TwoRemaining,

    #[error("sum of portions exceeded 100%")]
    AllotmentOverflow,

    #[error("sum of portions must be 100% when there is no `remaining`")]
    AllotmentIncomplete,

    #[error("invalid portion '{0}'")]
    InvalidPortion(String),

    #[error("portion must be between 0% and 100% inclusive")]
    PortionOutOfRange,

    #[error("insufficient funding")]
    InsufficientFunding,

    #[error("mismatched assets: {0} and {1}")]
    AssetMismatch(Asset, Asset),
}

/// Discriminator of a [`Value`].
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Type {
    Account,
    Asset,
    Number,
    String,
    Monetary,
    Portion,
    Allotment,
    Funding,
}

impl Type {
    pub fn as_str(&self) -> &'static str {
        match self {
            Type::Account => "account",
            Type::Asset => "asset",
            Type::Number => "number",
            Type::String => "string",
            Type::Monetary => "monetary",
            Type::Portion => "portion",
            Type::Allotment => "allotment",
            Type::Funding => "funding",
        }
    }
}

impl fmt::Display for Type {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for Type {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        Ok(match s {
            "account" => Type::Account,
            "asset" => Type::Asset,
            "number" => Type::Number,
            "string" => Type::String,
            "monetary" => Type::Monetary,
            "portion" => Type::Portion,
            "allotment" => Type::Allotment,
            "funding" => Type::Funding,
            other => return Err(format!("unknown type '{}'", other)),
        })
    }
}

impl serde::Serialize for Type {
    fn serialize<S: serde::Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        serializer.serialize_str(self.as_str())
    }
}

impl<'de> serde::Deserialize<'de> for Type {
    fn deserialize<D: serde::Deserializer<'de>>(deserializer: D) -> Result<Self, D::Error> {
        let s = String::deserialize(deserializer)?;
        Type::from_str(&s).map_err(serde::de::Error::custom)
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Monetary {
    pub asset: Asset,
    pub amount: MonetaryInt,
}

impl Monetary {
    pub fn new(asset: Asset, amount: impl Into<MonetaryInt>) -> Self {
        Self {
            asset,
            amount: amount.into(),
        }
    }
}

impl fmt::Display for Monetary {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "[{} {}]", self.asset, self.amount)
    }
}

/// A share of an amount: either an exact fraction or whatever the other shares leave.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Portion {
    Remaining,
    Specific(BigRational),
}

impl Portion {
    pub fn specific(value: BigRational) -> Result<Self, ValueError> {
        if value.is_negative() || value > BigRational::one() {
            return Err(ValueError::PortionOutOfRange);
        }
        Ok(Portion::Specific(value))
    }

    /// Parses `remaining`, `n/d`, `n%` or `n.m%`.
    pub fn parse(input: &str) -> Result<Self, ValueError> {
        let input = input.trim();
        if input == "remaining" {
            return Ok(Portion::Remaining);
        }
        let invalid = || ValueError::InvalidPortion(input.to_string());
        if let Some(percent) = input.strip_suffix('%') {
            let (int_part, frac_part) = percent.split_once('.').unwrap_or((percent, ""));
            if int_part.is_empty() || !int_part.bytes().all(|b| b.is_ascii_digit()) {
                return Err(invalid());
            }
            if !frac_part.bytes().all(|b| b.is_ascii_digit()) {
                return Err(invalid());
            }
            let digits = format!("{}{}", int_part, frac_part);
            let numerator = BigInt::from_str(&digits).map_err(|_| invalid())?;
            let denominator = BigInt::from(100u32) * BigInt::from(10u32).pow(frac_part.len() as u32);
            return Portion::specific(BigRational::new(numerator, denominator));
        }
        if let Some((n, d)) = input.split_once('/') {
            let numerator = BigInt::from_str(n.trim()).map_err(|_| invalid())?;
            let denominator = BigInt::from_str(d.trim()).map_err(|_| invalid())?;
            if denominator.is_zero() {
                return Err(invalid());
            }
            return Portion::specific(BigRational::new(numerator, denominator));
        }
        Err(invalid())
    }
}

impl fmt::Display for Portion {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Portion::Remaining => f.write_str("remaining"),
            Portion::Specific(r) => write!(f, "{}/{}", r.numer(), r.denom()),
        }
    }
}

/// Ordered list of fractions summing to exactly 1.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Allotment(Vec<BigRational>);

impl Allotment {
    /// Builds an allotment, giving the `remaining` portion (at most one) whatever the
    /// specific portions leave.
    pub fn new(portions: Vec<Portion>) -> Result<Self, ValueError> {
        let mut total = BigRational::zero();
        let mut remaining_index = None;
        let mut parts = Vec::with_capacity(portions.len());
        for (i, portion) in portions.into_iter().enumerate() {
            match portion {
                Portion::Remaining => {
                    if remaining_index.is_some() {
                        return Err(ValueError::TwoRemaining);
                    }
                    remaining_index = Some(i);
                    parts.push(BigRational::zero());
                }
                Portion::Specific(r) => {
                    total += &r;
                    parts.push(r);
                }
            }
        }
        if total > BigRational::one() {
            return Err(ValueError::AllotmentOverflow);
        }
        match remaining_index {
            Some(i) => parts[i] = BigRational::one() - total,
            None if total != BigRational::one() => return Err(ValueError::AllotmentIncomplete),
            None => {}
        }
        Ok(Self(parts))
    }

    pub fn portions(&self) -> &[BigRational] {
        &self.0
    }

    /// Splits `amount` by the allotment. Each part gets the floor of its share, then the
    /// leftover units are handed out one by one in allotment order.
    ///
    /// Amounts and portions are non-negative, so truncating division is a floor.
    pub fn allocate(&self, amount: &MonetaryInt) -> Vec<MonetaryInt> {
        let total = amount.as_bigint();
        let mut parts: Vec<BigInt> = self
            .0
            .iter()
            .map(|r| (total * r.numer()) / r.denom())
            .collect();
        let mut allocated: BigInt = parts.iter().sum();
        for part in parts.iter_mut() {
            if &allocated >= total {
                break;
            }
            *part += 1;
            allocated += 1;
        }
        parts.into_iter().map(MonetaryInt::from).collect()
    }
}

impl fmt::Display for Allotment {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let parts: Vec<String> = self.0.iter().map(|r| format!("{}/{}", r.numer(), r.denom())).collect();
        write!(f, "{{{}}}", parts.join(" : "))
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct FundingPart {
    pub account: String,
    pub amount: MonetaryInt,
}

impl FundingPart {
    pub fn new(account: impl Into<String>, amount: impl Into<MonetaryInt>) -> Self {
        Self {
            account: account.into(),
            amount: amount.into(),
        }
    }
}

/// Money in hand during script execution, remembering which account contributed what.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Funding {
    pub asset: Asset,
    pub parts: Vec<FundingPart>,
}

impl Funding {
    pub fn new(asset: Asset, parts: Vec<FundingPart>) -> Self {
        Self { asset, parts }
    }

    pub fn empty(asset: Asset) -> Self {
        Self::new(asset, Vec::new())
    }

    pub fn total(&self) -> MonetaryInt {
        self.parts
            .iter()
            .fold(MonetaryInt::zero(), |acc, part| &acc + &part.amount)
    }

    /// Splits off exactly `amount`, front to back. Returns `(taken, remainder)`.
    pub fn take(&self, amount: &MonetaryInt) -> Result<(Funding, Funding), ValueError> {
        let (taken, remainder, missing) = self.split(amount);
        if !missing.is_zero() {
            return Err(ValueError::InsufficientFunding);
        }
        Ok((taken, remainder))
    }

    /// Like [`Funding::take`] but takes whatever is available instead of failing.
    pub fn take_max(&self, amount: &MonetaryInt) -> (Funding, Funding) {
        let (taken, remainder, _) = self.split(amount);
        (taken, remainder)
    }

    fn split(&self, amount: &MonetaryInt) -> (Funding, Funding, MonetaryInt) {
        let mut taken = Funding::empty(self.asset.clone());
        let mut remainder = Funding::empty(self.asset.clone());
        if amount.is_zero() {
            if let Some(first) = self.parts.first() {
                taken.parts.push(FundingPart::new(first.account.clone(), MonetaryInt::zero()));
            }
        }
        let mut missing = amount.clone();
        let mut parts = self.parts.iter();
        for part in parts.by_ref() {
            if !missing.is_positive() {
                remainder.parts.push(part.clone());
                break;
            }
            let mut withdrawn = part.amount.clone();
            if withdrawn > missing {
                remainder
                    .parts
                    .push(FundingPart::new(part.account.clone(), &withdrawn - &missing));
                withdrawn = missing.clone();
            }
            missing -= &withdrawn;
            taken.parts.push(FundingPart::new(part.account.clone(), withdrawn));
        }
        remainder.parts.extend(parts.cloned());
        (taken, remainder, missing)
    }

    /// Appends `other`, merging the boundary parts when they come from the same account.
    pub fn concat(&self, other: &Funding) -> Result<Funding, ValueError> {
        if self.asset != other.asset {
            return Err(ValueError::AssetMismatch(self.asset.clone(), other.asset.clone()));
        }
        let mut result = self.clone();
        let mut rest = other.parts.iter();
        if let (Some(last), Some(first)) = (result.parts.last_mut(), other.parts.first()) {
            if last.account == first.account {
                last.amount += &first.amount;
                rest.next();
            }
        }
        result.parts.extend(rest.cloned());
        Ok(result)
    }

    pub fn reverse(&self) -> Funding {
        let mut parts = self.parts.clone();
        parts.reverse();
        Funding::new(self.asset.clone(), parts)
    }
}

impl fmt::Display for Funding {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "[{}", self.asset)?;
        for part in &self.parts {
            write!(f, " {} {}", part.account, part.amount)?;
        }
        f.write_str("]")
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Value {
    Account(String),
    Asset(Asset),
    Number(BigInt),
    String(String),
    Monetary(Monetary),
    Portion(Portion),
    Allotment(Allotment),
    Funding(Funding),
}

impl Value {
    pub fn get_type(&self) -> Type {
        match self {
            Value::Account(_) => Type::Account,
            Value::Asset(_) => Type::Asset,
            Value::Number(_) => Type::Number,
            Value::String(_) => Type::String,
            Value::Monetary(_) => Type::Monetary,
            Value::Portion(_) => Type::Portion,
            Value::Allotment(_) => Type::Allotment,
            Value::Funding(_) => Type::Funding,
        }
    }

    /// Asset carried by asset-bearing values.
    pub fn asset(&self) -> Option<&Asset> {
        match self {
            Value::Asset(asset) => Some(asset),
            Value::Monetary(m) => Some(&m.asset),
            Value::Funding(f) => Some(&f.asset),
            _ => None,
        }
    }
}

impl fmt::Display for Value {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Value::Account(a) => write!(f, "@{}", a),
            Value::Asset(a) => write!(f, "{}", a),
            Value::Number(n) => write!(f, "{}", n),
            Value::String(s) => write!(f, "\"{}\"", s),
            Value::Monetary(m) => write!(f, "{}", m),
            Value::Portion(p) => write!(f, "{}", p),
            Value::Allotment(a) => write!(f, "{}", a),
            Value::Funding(fu) => write!(f, "{}", fu),
        }
    }
}
