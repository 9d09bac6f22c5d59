//! Arbitrary precision signed integer used for every amount in the ledger.
//!
//! Amounts serialize as JSON numbers when they fit in 64 bits and as decimal strings
//! otherwise; both forms are accepted when deserializing.

use std::fmt;
use std::ops::{Add, AddAssign, Neg, Sub, SubAssign};
use std::str::FromStr;

use num_bigint::BigInt;
use num_traits::{Signed, ToPrimitive, Zero};
use serde::de::{self, Visitor};
use serde::{Deserialize, Deserializer, Serialize, Serializer};

#[derive(Debug, Clone, Default, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct MonetaryInt(BigInt);

impl MonetaryInt {
    pub fn zero() -> Self {
        Self(BigInt::zero())
    }

    pub fn is_zero(&self) -> bool {
        self.0.is_zero()
    }

    pub fn is_negative(&self) -> bool {
        self.0.is_negative()
    }

    pub fn is_positive(&self) -> bool {
        self.0.is_positive()
    }

    pub fn as_bigint(&self) -> &BigInt {
        &self.0
    }

    pub fn into_bigint(self) -> BigInt {
        self.0
    }

    /// Returns the smaller of two amounts.
    pub fn min(self, other: Self) -> Self {
        std::cmp::min(self, other)
    }
}

impl From<BigInt> for MonetaryInt {
    fn from(value: BigInt) -> Self {
        Self(value)
    }
}

impl From<u64> for MonetaryInt {
    fn from(value: u64) -> Self {
        Self(BigInt::from(value))
    }
}

impl From<i64> for MonetaryInt {
    fn from(value: i64) -> Self {
        Self(BigInt::from(value))
    }
}

impl From<i32> for MonetaryInt {
    fn from(value: i32) -> Self {
        Self(BigInt::from(value))
    }
}

impl FromStr for MonetaryInt {
    type Err = num_bigint::ParseBigIntError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        BigInt::from_str(s).map(Self)
    }
}

impl fmt::Display for MonetaryInt {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

impl<'a> Add<&'a MonetaryInt> for &'a MonetaryInt {
    type Output = MonetaryInt;

    fn add(self, rhs: &'a MonetaryInt) -> MonetaryInt {
        MonetaryInt(&self.0 + &rhs.0)
    }
}

impl Add for MonetaryInt {
    type Output = MonetaryInt;

    fn add(self, rhs: MonetaryInt) -> MonetaryInt {
        MonetaryInt(self.0 + rhs.0)
    }
}

impl<'a> Sub<&'a MonetaryInt> for &'a MonetaryInt {
    type Output = MonetaryInt;

    fn sub(self, rhs: &'a MonetaryInt) -> MonetaryInt {
        MonetaryInt(&self.0 - &rhs.0)
    }
}

impl Sub for MonetaryInt {
    type Output = MonetaryInt;

    fn sub(self, rhs: MonetaryInt) -> MonetaryInt {
        MonetaryInt(self.0 - rhs.0)
    }
}

impl AddAssign<&MonetaryInt> for MonetaryInt {
    fn add_assign(&mut self, rhs: &MonetaryInt) {
        self.0 += &rhs.0;
    }
}

impl SubAssign<&MonetaryInt> for MonetaryInt {
    fn sub_assign(&mut self, rhs: &MonetaryInt) {
        self.0 -= &rhs.0;
    }
}

impl Neg for MonetaryInt {
    type Output = MonetaryInt;

    fn neg(self) -> MonetaryInt {
        MonetaryInt(-self.0)
    }
}

impl Serialize for MonetaryInt {
    fn serialize<S: Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        if let Some(v) = self.0.to_i64() {
            serializer.serialize_i64(v)
        } else if let Some(v) = self.0.to_u64() {
            serializer.serialize_u64(v)
        } else {
            serializer.serialize_str(&self.0.to_string())
        }
    }
}

struct MonetaryIntVisitor;

impl<'de> Visitor<'de> for MonetaryIntVisitor {
    type Value = MonetaryInt;

    fn expecting(&self, f: &mut fmt::Formatter) -> fmt::Result {
        f.write_str("an integer or a decimal integer string")
    }

    fn visit_i64<E: de::Error>(self, v: i64) -> Result<MonetaryInt, E> {
        Ok(MonetaryInt::from(v))
    }

    fn visit_u64<E: de::Error>(self, v: u64) -> Result<MonetaryInt, E> {
        Ok(MonetaryInt::from(v))
    }

    fn visit_f64<E: de::Error>(self, v: f64) -> Result<MonetaryInt, E> {
        if v.fract() != 0.0 || !v.is_finite() {
            return Err(E::custom(format!("amount {} is not an integer", v)));
        }
        num_bigint::BigInt::from_str(&format!("{:.0}", v))
            .map(MonetaryInt)
            .map_err(E::custom)
    }

    fn visit_str<E: de::Error>(self, v: &str) -> Result<MonetaryInt, E> {
        MonetaryInt::from_str(v).map_err(|_| E::custom(format!("invalid amount '{}'", v)))
    }
}

impl<'de> Deserialize<'de> for MonetaryInt {
    fn deserialize<D: Deserializer<'de>>(deserializer: D) -> Result<Self, D::Error> {
        deserializer.deserialize_any(MonetaryIntVisitor)
    }
}
