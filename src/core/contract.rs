//! Balance contracts evaluated when committing raw transaction data.
//!
//! A contract pairs an account pattern with a boolean expression over the account's
//! post-commit balance (`$balance`) and its metadata (`{"$meta": key}`). Expressions are
//! written in JSON:
//!
//! ```json
//! {"$or": [{"$gte": ["$balance", 0]}, {"$eq": [{"$meta": "overdraft"}, "allowed"]}]}
//! ```
//!
//! The first contract whose pattern matches an account decides for it. The default
//! contract, applied after any configured ones, forbids negative balances.

use std::collections::BTreeMap;

use num_bigint::BigInt;
use serde::{Deserialize, Deserializer, Serialize, Serializer};
use serde_json::{json, Value as JsonValue};
use thiserror::Error;

use crate::core::metadata::Metadata;

#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum ContractError {
    #[error("unexpected expression: {0}")]
    UnexpectedExpression(String),

    #[error("operator {0} expects {1} operands")]
    Arity(String, usize),

    #[error("unknown variable ${0}")]
    UnknownVariable(String),
}

#[derive(Debug, Clone, PartialEq)]
pub enum Operand {
    Constant(JsonValue),
    /// `"$name"`
    Variable(String),
    /// `{"$meta": key}`
    Meta(String),
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Comparison {
    Eq,
    Gt,
    Gte,
    Lt,
    Lte,
}

impl Comparison {
    fn operator(self) -> &'static str {
        match self {
            Comparison::Eq => "$eq",
            Comparison::Gt => "$gt",
            Comparison::Gte => "$gte",
            Comparison::Lt => "$lt",
            Comparison::Lte => "$lte",
        }
    }

    fn from_operator(op: &str) -> Option<Self> {
        Some(match op {
            "$eq" => Comparison::Eq,
            "$gt" => Comparison::Gt,
            "$gte" => Comparison::Gte,
            "$lt" => Comparison::Lt,
            "$lte" => Comparison::Lte,
            _ => return None,
        })
    }
}

#[derive(Debug, Clone, PartialEq)]
pub enum Expr {
    And(Vec<Expr>),
    Or(Vec<Expr>),
    Compare(Comparison, Operand, Operand),
}

/// Inputs an expression is evaluated against.
#[derive(Debug, Clone, Default)]
pub struct EvalContext {
    pub variables: BTreeMap<String, BigInt>,
    pub metadata: Metadata,
}

impl EvalContext {
    pub fn for_balance(balance: BigInt, metadata: Metadata) -> Self {
        let mut variables = BTreeMap::new();
        variables.insert("balance".to_string(), balance);
        Self { variables, metadata }
    }
}

/// An operand after lookup.
#[derive(Debug, Clone, PartialEq)]
enum Resolved {
    Number(BigInt),
    Json(JsonValue),
}

fn json_integer(value: &JsonValue) -> Option<BigInt> {
    let n = value.as_number()?;
    n.as_i64().map(BigInt::from).or_else(|| n.as_u64().map(BigInt::from))
}

impl Operand {
    fn parse(value: &JsonValue) -> Result<Self, ContractError> {
        match value {
            JsonValue::String(s) if s.starts_with('$') => Ok(Operand::Variable(s[1..].to_string())),
            JsonValue::Object(map) if map.len() == 1 && map.contains_key("$meta") => match &map["$meta"] {
                JsonValue::String(key) => Ok(Operand::Meta(key.clone())),
                other => Err(ContractError::UnexpectedExpression(other.to_string())),
            },
            other => Ok(Operand::Constant(other.clone())),
        }
    }

    fn to_json(&self) -> JsonValue {
        match self {
            Operand::Constant(v) => v.clone(),
            Operand::Variable(name) => JsonValue::String(format!("${}", name)),
            Operand::Meta(key) => json!({ "$meta": key }),
        }
    }

    fn resolve(&self, ctx: &EvalContext) -> Result<Resolved, ContractError> {
        Ok(match self {
            Operand::Constant(v) => match json_integer(v) {
                Some(n) => Resolved::Number(n),
                None => Resolved::Json(v.clone()),
            },
            Operand::Variable(name) => Resolved::Number(
                ctx.variables
                    .get(name)
                    .cloned()
                    .ok_or_else(|| ContractError::UnknownVariable(name.clone()))?,
            ),
            Operand::Meta(key) => {
                let value = ctx.metadata.get(key).cloned().unwrap_or(JsonValue::Null);
                match json_integer(&value) {
                    Some(n) => Resolved::Number(n),
                    None => Resolved::Json(value),
                }
            }
        })
    }
}

impl Expr {
    pub fn parse(value: &JsonValue) -> Result<Self, ContractError> {
        let map = value
            .as_object()
            .filter(|m| m.len() == 1)
            .ok_or_else(|| ContractError::UnexpectedExpression(value.to_string()))?;
        let (op, args) = map
            .iter()
            .next()
            .ok_or_else(|| ContractError::UnexpectedExpression(value.to_string()))?;
        let args = args
            .as_array()
            .ok_or_else(|| ContractError::UnexpectedExpression(value.to_string()))?;
        match op.as_str() {
            "$and" => Ok(Expr::And(args.iter().map(Expr::parse).collect::<Result<_, _>>()?)),
            "$or" => Ok(Expr::Or(args.iter().map(Expr::parse).collect::<Result<_, _>>()?)),
            other => {
                let comparison = Comparison::from_operator(other)
                    .ok_or_else(|| ContractError::UnexpectedExpression(value.to_string()))?;
                if args.len() != 2 {
                    return Err(ContractError::Arity(other.to_string(), 2));
                }
                Ok(Expr::Compare(comparison, Operand::parse(&args[0])?, Operand::parse(&args[1])?))
            }
        }
    }

    pub fn to_json(&self) -> JsonValue {
        match self {
            Expr::And(items) => json!({ "$and": items.iter().map(Expr::to_json).collect::<Vec<_>>() }),
            Expr::Or(items) => json!({ "$or": items.iter().map(Expr::to_json).collect::<Vec<_>>() }),
            Expr::Compare(cmp, lhs, rhs) => json!({ cmp.operator(): [lhs.to_json(), rhs.to_json()] }),
        }
    }

    pub fn eval(&self, ctx: &EvalContext) -> Result<bool, ContractError> {
        match self {
            Expr::And(items) => {
                for item in items {
                    if !item.eval(ctx)? {
                        return Ok(false);
                    }
                }
                Ok(true)
            }
            Expr::Or(items) => {
                for item in items {
                    if item.eval(ctx)? {
                        return Ok(true);
                    }
                }
                Ok(false)
            }
            Expr::Compare(cmp, lhs, rhs) => {
                let lhs = lhs.resolve(ctx)?;
                let rhs = rhs.resolve(ctx)?;
                Ok(match (cmp, &lhs, &rhs) {
                    (Comparison::Eq, l, r) => l == r,
                    (_, Resolved::Number(l), Resolved::Number(r)) => match cmp {
                        Comparison::Gt => l > r,
                        Comparison::Gte => l >= r,
                        Comparison::Lt => l < r,
                        Comparison::Lte => l <= r,
                        Comparison::Eq => l == r,
                    },
                    // Ordering non-numeric values never holds.
                    _ => false,
                })
            }
        }
    }
}

impl Serialize for Expr {
    fn serialize<S: Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        self.to_json().serialize(serializer)
    }
}

impl<'de> Deserialize<'de> for Expr {
    fn deserialize<D: Deserializer<'de>>(deserializer: D) -> Result<Self, D::Error> {
        let raw = JsonValue::deserialize(deserializer)?;
        Expr::parse(&raw).map_err(serde::de::Error::custom)
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Contract {
    #[serde(default)]
    pub id: String,
    /// Account pattern; `*` matches any run of characters.
    pub account: String,
    pub expr: Expr,
}

impl Contract {
    pub fn matches(&self, address: &str) -> bool {
        glob_match(&self.account, address)
    }
}

/// Per-ledger contract configuration.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct Mapping {
    pub contracts: Vec<Contract>,
}

/// `{"account": "*", "expr": {"$gte": ["$balance", 0]}}`
pub fn default_contracts() -> Vec<Contract> {
    vec![Contract {
        id: "default".to_string(),
        account: "*".to_string(),
        expr: Expr::Compare(
            Comparison::Gte,
            Operand::Variable("balance".to_string()),
            Operand::Constant(json!(0)),
        ),
    }]
}

fn glob_match(pattern: &str, input: &str) -> bool {
    let mut parts = pattern.split('*');
    let first = parts.next().unwrap_or_default();
    let Some(mut rest) = input.strip_prefix(first) else {
        return false;
    };
    let parts: Vec<&str> = parts.collect();
    let Some((last, middle)) = parts.split_last() else {
        return rest.is_empty();
    };
    for part in middle {
        match rest.find(part) {
            Some(pos) => rest = &rest[pos + part.len()..],
            None => return false,
        }
    }
    rest.len() >= last.len() && rest.ends_with(last)
}

#[cfg(test)]
mod tests {
    use super::*;

    fn ctx(balance: i64) -> EvalContext {
        EvalContext::for_balance(BigInt::from(balance), Metadata::new())
    }

    #[test]
    fn test_default_contract_rejects_negative_balance() {
        let contract = &default_contracts()[0];
        assert!(contract.matches("users:001"));
        assert!(contract.expr.eval(&ctx(0)).unwrap());
        assert!(!contract.expr.eval(&ctx(-1)).unwrap());
    }

    #[test]
    fn test_parse_and_eval_compound_expression() {
        let expr: Expr = serde_json::from_value(json!({
            "$or": [
                {"$gte": ["$balance", 0]},
                {"$and": [{"$eq": [{"$meta": "overdraft"}, "allowed"]}, {"$gte": ["$balance", -100]}]}
            ]
        }))
        .unwrap();
        assert!(!expr.eval(&ctx(-50)).unwrap());

        let mut metadata = Metadata::new();
        metadata.insert("overdraft".into(), json!("allowed"));
        let allowed = EvalContext::for_balance(BigInt::from(-50), metadata.clone());
        assert!(expr.eval(&allowed).unwrap());
        let too_far = EvalContext::for_balance(BigInt::from(-150), metadata);
        assert!(!expr.eval(&too_far).unwrap());
    }

    #[test]
    fn test_expression_json_round_trip() {
        let raw = json!({"$lte": ["$balance", {"$meta": "limit"}]});
        let expr = Expr::parse(&raw).unwrap();
        assert_eq!(expr.to_json(), raw);
    }

    #[test]
    fn test_parse_errors() {
        assert!(matches!(
            Expr::parse(&json!({"$gt": ["$balance"]})),
            Err(ContractError::Arity(_, 2))
        ));
        assert!(Expr::parse(&json!({"$nope": [1, 2]})).is_err());
        assert!(Expr::parse(&json!(42)).is_err());
        let expr = Expr::parse(&json!({"$gt": ["$unknown", 0]})).unwrap();
        assert_eq!(expr.eval(&ctx(0)), Err(ContractError::UnknownVariable("unknown".into())));
    }

    #[test]
    fn test_glob_match() {
        assert!(glob_match("*", "anything"));
        assert!(glob_match("users:*", "users:001"));
        assert!(!glob_match("users:*", "banks:001"));
        assert!(glob_match("*:credit", "users:001:credit"));
        assert!(glob_match("users:*:main", "users:001:main"));
        assert!(!glob_match("users:*:main", "users:001:side"));
        assert!(glob_match("world", "world"));
        assert!(!glob_match("world", "worlds"));
    }
}
