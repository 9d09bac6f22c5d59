//! Stack machine executing one compiled [`Program`].
//!
//! A run has three phases:
//!
//! 1. [`Machine::resolve_resources`] materializes the resource table in order, asking the
//!    host for account metadata and balances through a [`ResourceResolver`].
//! 2. [`Machine::resolve_balances`] loads the starting balance of every declared
//!    (account, asset) pair. `world` always starts at zero without asking the host.
//! 3. [`Machine::execute`] ticks until the program halts.
//!
//! # Invariants
//!
//! - A machine is never shared between runs; the program it executes is.
//! - `EXIT_OK` with a non-empty stack is reported as `EXIT_FAIL_INVALID`.
//! - Zero-amount funding parts never produce postings.

use std::collections::{BTreeMap, HashMap};
use std::fmt;
use std::sync::Arc;

use async_trait::async_trait;
use num_bigint::BigInt;
use num_traits::ToPrimitive;
use thiserror::Error;

use crate::core::account::WORLD;
use crate::core::asset::Asset;
use crate::core::metadata::Metadata;
use crate::core::transaction::Posting;
use crate::error::{LedgerError, ScriptError, ScriptErrorCode};
use crate::machine::json::{self, JsonError};
use crate::machine::monetary::MonetaryInt;
use crate::machine::program::{Address, Opcode, Program, Resource};
use crate::machine::value::{Allotment, Funding, FundingPart, Monetary, Portion, Type, Value};

/// Outcome of a run.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
#[repr(u8)]
pub enum ExitCode {
    Ok = 1,
    /// The program executed a `fail` instruction.
    Fail,
    /// Malformed program or inconsistent stack. Always a compiler or program defect.
    FailInvalid,
    /// A `take` could not be covered by the funding.
    FailInsufficientFunds,
}

impl fmt::Display for ExitCode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(match self {
            ExitCode::Ok => "EXIT_OK",
            ExitCode::Fail => "EXIT_FAIL",
            ExitCode::FailInvalid => "EXIT_FAIL_INVALID",
            ExitCode::FailInsufficientFunds => "EXIT_FAIL_INSUFFICIENT_FUNDS",
        })
    }
}

/// Errors raised while binding variables and resolving resources.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum MachineError {
    #[error("missing variable '{0}'")]
    MissingVariable(String),

    #[error("extraneous variable '{0}'")]
    ExtraneousVariable(String),

    #[error("variable '{name}': wrong type: expected {expected}, got {got}")]
    WrongVariableType { name: String, expected: Type, got: Type },

    #[error("invalid variable '{name}': {reason}")]
    InvalidVariable { name: String, reason: String },

    #[error("missing key {key} in metadata for account {account}")]
    MissingMetadataKey { account: String, key: String },

    #[error("variable '{name}': invalid metadata {key} of account {account}: {reason}")]
    InvalidMetadata {
        name: String,
        account: String,
        key: String,
        reason: String,
    },

    #[error(
        "variable '{name}': tried to request the balance of account {account} for asset {asset}: \
         received {balance}: monetary amounts must be non-negative"
    )]
    NegativeBalance {
        name: String,
        account: String,
        asset: Asset,
        balance: MonetaryInt,
    },

    #[error("resource {0} is not an account")]
    NotAnAccount(Address),

    #[error("resource {0} does not carry an asset")]
    NotAnAsset(Address),

    #[error("resource {0} is not resolved yet")]
    UnresolvedResource(Address),

    #[error("resources haven't been initialized")]
    ResourcesNotInitialized,

    #[error("balances haven't been initialized")]
    BalancesNotInitialized,
}

impl From<MachineError> for LedgerError {
    fn from(err: MachineError) -> Self {
        LedgerError::Script(ScriptError::new(ScriptErrorCode::CompilationFailed, err.to_string()))
    }
}

/// Host callbacks used during resolution. Implementations are expected to cache
/// account lookups, the same account may be asked for several times.
#[async_trait]
pub trait ResourceResolver: Send {
    /// Raw typed-JSON metadata value, `None` when the key is absent.
    async fn account_metadata(&mut self, account: &str, key: &str) -> crate::error::Result<Option<serde_json::Value>>;

    /// Current balance of `account` for `asset`.
    async fn account_balance(&mut self, account: &str, asset: &Asset) -> crate::error::Result<MonetaryInt>;
}

/// Why a tick stopped the machine.
enum Halt {
    Fail,
    Invalid(String),
    InsufficientFunds,
}

impl Halt {
    fn type_mismatch(expected: Type, got: &Value) -> Self {
        Halt::Invalid(format!("expected {} on the stack, got {}", expected, got.get_type()))
    }
}

macro_rules! pop_typed {
    ($name:ident, $variant:ident, $ty:ty) => {
        fn $name(&mut self) -> Result<$ty, Halt> {
            match self.pop()? {
                Value::$variant(v) => Ok(v),
                other => Err(Halt::type_mismatch(Type::$variant, &other)),
            }
        }
    };
}

type Balances = BTreeMap<String, BTreeMap<Asset, MonetaryInt>>;

pub struct Machine {
    program: Arc<Program>,
    pc: usize,
    vars: HashMap<String, Value>,
    resources: Vec<Value>,
    resources_resolved: bool,
    balances: Option<Balances>,
    stack: Vec<Value>,
    postings: Vec<Posting>,
    tx_meta: BTreeMap<String, Value>,
    account_meta: BTreeMap<String, BTreeMap<String, Value>>,
    printed: Vec<String>,
    failure: Option<String>,
}

impl Machine {
    pub fn new(program: Arc<Program>) -> Self {
        Self {
            program,
            pc: 0,
            vars: HashMap::new(),
            resources: Vec::new(),
            resources_resolved: false,
            balances: None,
            stack: Vec::new(),
            postings: Vec::new(),
            tx_meta: BTreeMap::new(),
            account_meta: BTreeMap::new(),
            printed: Vec::new(),
            failure: None,
        }
    }

    pub fn program(&self) -> &Program {
        &self.program
    }

    /// Binds already typed variables.
    pub fn set_vars(&mut self, vars: HashMap<String, Value>) -> Result<(), MachineError> {
        self.vars = self.program.parse_variables(vars)?;
        Ok(())
    }

    /// Binds untyped JSON variables, typed by the program's declarations.
    pub fn set_vars_from_json(&mut self, vars: &serde_json::Map<String, serde_json::Value>) -> Result<(), MachineError> {
        self.vars = self.program.parse_variables_json(vars)?;
        Ok(())
    }

    fn resolved_account(&self, address: Address) -> Result<String, MachineError> {
        match self.resources.get(address as usize) {
            Some(Value::Account(account)) => Ok(account.clone()),
            Some(_) => Err(MachineError::NotAnAccount(address)),
            None => Err(MachineError::UnresolvedResource(address)),
        }
    }

    fn resolved_asset(&self, address: Address) -> Result<Asset, MachineError> {
        match self.resources.get(address as usize) {
            Some(value) => value.asset().cloned().ok_or(MachineError::NotAnAsset(address)),
            None => Err(MachineError::UnresolvedResource(address)),
        }
    }

    /// Materializes the resource table in order. Later resources may refer to earlier ones.
    pub async fn resolve_resources<R>(&mut self, resolver: &mut R) -> crate::error::Result<()>
    where
        R: ResourceResolver + ?Sized,
    {
        let program = Arc::clone(&self.program);
        self.resources.clear();
        for resource in &program.resources {
            let value = match resource {
                Resource::Constant { value } => value.clone(),
                Resource::Variable { name, .. } => self
                    .vars
                    .get(name)
                    .cloned()
                    .ok_or_else(|| MachineError::MissingVariable(name.clone()))?,
                Resource::VariableAccountMetadata { name, typ, account, key } => {
                    let account = self.resolved_account(*account)?;
                    let raw = resolver
                        .account_metadata(&account, key)
                        .await?
                        .ok_or_else(|| MachineError::MissingMetadataKey {
                            account: account.clone(),
                            key: key.clone(),
                        })?;
                    let value = json::decode(&raw).map_err(|err: JsonError| MachineError::InvalidMetadata {
                        name: name.clone(),
                        account: account.clone(),
                        key: key.clone(),
                        reason: err.to_string(),
                    })?;
                    if value.get_type() != *typ {
                        return Err(MachineError::WrongVariableType {
                            name: name.clone(),
                            expected: *typ,
                            got: value.get_type(),
                        }
                        .into());
                    }
                    value
                }
                Resource::VariableAccountBalance { name, account, asset } => {
                    let account = self.resolved_account(*account)?;
                    let asset = self.resolved_asset(*asset)?;
                    let balance = resolver.account_balance(&account, &asset).await?;
                    if balance.is_negative() {
                        return Err(MachineError::NegativeBalance {
                            name: name.clone(),
                            account,
                            asset,
                            balance,
                        }
                        .into());
                    }
                    Value::Monetary(Monetary::new(asset, balance))
                }
                Resource::Monetary { asset, amount } => {
                    let asset = self.resolved_asset(*asset)?;
                    Value::Monetary(Monetary::new(asset, amount.clone()))
                }
            };
            self.resources.push(value);
        }
        self.resources_resolved = true;
        Ok(())
    }

    /// Loads the starting balances of every needed (account, asset) pair.
    pub async fn resolve_balances<R>(&mut self, resolver: &mut R) -> crate::error::Result<()>
    where
        R: ResourceResolver + ?Sized,
    {
        if !self.resources_resolved {
            return Err(MachineError::ResourcesNotInitialized.into());
        }
        let program = Arc::clone(&self.program);
        let mut balances = Balances::new();
        for (account_address, asset_addresses) in &program.needed_balances {
            let account = self.resolved_account(*account_address)?;
            for asset_address in asset_addresses {
                let asset = self.resolved_asset(*asset_address)?;
                let balance = if account == WORLD {
                    MonetaryInt::zero()
                } else {
                    resolver.account_balance(&account, &asset).await?
                };
                balances.entry(account.clone()).or_default().insert(asset, balance);
            }
        }
        self.balances = Some(balances);
        Ok(())
    }

    /// Runs the program to completion.
    pub fn execute(&mut self) -> Result<ExitCode, MachineError> {
        if !self.resources_resolved {
            return Err(MachineError::ResourcesNotInitialized);
        }
        if self.balances.is_none() {
            return Err(MachineError::BalancesNotInitialized);
        }
        loop {
            if let Some(code) = self.tick() {
                if code == ExitCode::Ok && !self.stack.is_empty() {
                    let reason = format!("program left {} values on the stack", self.stack.len());
                    tracing::error!(%reason, "invalid program");
                    self.failure = Some(reason);
                    return Ok(ExitCode::FailInvalid);
                }
                return Ok(code);
            }
        }
    }

    /// Executes one instruction. Returns the exit code once the machine halts.
    pub fn tick(&mut self) -> Option<ExitCode> {
        if self.pc >= self.program.instructions.len() {
            return Some(ExitCode::Ok);
        }
        match self.step() {
            Ok(()) if self.pc >= self.program.instructions.len() => Some(ExitCode::Ok),
            Ok(()) => None,
            Err(Halt::Fail) => Some(ExitCode::Fail),
            Err(Halt::InsufficientFunds) => Some(ExitCode::FailInsufficientFunds),
            Err(Halt::Invalid(reason)) => {
                tracing::error!(pc = self.pc, %reason, "invalid program");
                self.failure = Some(reason);
                Some(ExitCode::FailInvalid)
            }
        }
    }

    fn pop(&mut self) -> Result<Value, Halt> {
        self.stack
            .pop()
            .ok_or_else(|| Halt::Invalid("stack underflow".to_string()))
    }

    pop_typed!(pop_account, Account, String);
    pop_typed!(pop_asset, Asset, Asset);
    pop_typed!(pop_number, Number, BigInt);
    pop_typed!(pop_string, String, String);
    pop_typed!(pop_monetary, Monetary, Monetary);
    pop_typed!(pop_portion, Portion, Portion);
    pop_typed!(pop_allotment, Allotment, Allotment);
    pop_typed!(pop_funding, Funding, Funding);

    fn pop_count(&mut self) -> Result<usize, Halt> {
        let n = self.pop_number()?;
        n.to_usize()
            .ok_or_else(|| Halt::Invalid(format!("invalid count {}", n)))
    }

    fn operand(&self, width: usize) -> Result<&[u8], Halt> {
        let start = self.pc + 1;
        self.program
            .instructions
            .get(start..start + width)
            .ok_or_else(|| Halt::Invalid("truncated operand".to_string()))
    }

    fn step(&mut self) -> Result<(), Halt> {
        let byte = self.program.instructions[self.pc];
        let op = Opcode::try_from(byte).map_err(|b| Halt::Invalid(format!("unknown opcode {}", b)))?;
        let width = op.operand_width();
        match op {
            Opcode::Apush => {
                let raw = self.operand(width)?;
                let address = u16::from_le_bytes([raw[0], raw[1]]) as usize;
                let value = self
                    .resources
                    .get(address)
                    .cloned()
                    .ok_or_else(|| Halt::Invalid(format!("resource {} out of range", address)))?;
                self.stack.push(value);
            }
            Opcode::Ipush => {
                let mut raw = [0u8; 8];
                raw.copy_from_slice(self.operand(width)?);
                self.stack.push(Value::Number(BigInt::from(u64::from_le_bytes(raw))));
            }
            Opcode::Bump => {
                let n = self.pop_count()?;
                if n >= self.stack.len() {
                    return Err(Halt::Invalid(format!("cannot bump {} on a stack of {}", n, self.stack.len())));
                }
                let index = self.stack.len() - n - 1;
                let value = self.stack.remove(index);
                self.stack.push(value);
            }
            Opcode::Delete => {
                if let Value::Funding(_) = self.pop()? {
                    return Err(Halt::Invalid("tried to delete a funding".to_string()));
                }
            }
            Opcode::Iadd => {
                let rhs = self.pop_number()?;
                let lhs = self.pop_number()?;
                self.stack.push(Value::Number(lhs + rhs));
            }
            Opcode::Isub => {
                let rhs = self.pop_number()?;
                let lhs = self.pop_number()?;
                self.stack.push(Value::Number(lhs - rhs));
            }
            Opcode::Print => {
                let value = self.pop()?;
                tracing::info!(target: "ledger_core::machine::print", "{}", value);
                self.printed.push(value.to_string());
            }
            Opcode::Fail => return Err(Halt::Fail),
            Opcode::Asset => {
                let value = self.pop()?;
                let asset = value
                    .asset()
                    .cloned()
                    .ok_or_else(|| Halt::Invalid(format!("{} has no asset", value.get_type())))?;
                self.stack.push(Value::Asset(asset));
            }
            Opcode::MonetaryNew => {
                let amount = self.pop_number()?;
                let asset = self.pop_asset()?;
                self.stack.push(Value::Monetary(Monetary::new(asset, MonetaryInt::from(amount))));
            }
            Opcode::MonetaryAdd | Opcode::MonetarySub => {
                let rhs = self.pop_monetary()?;
                let lhs = self.pop_monetary()?;
                if lhs.asset != rhs.asset {
                    return Err(Halt::Invalid(format!(
                        "cannot combine monetaries of {} and {}",
                        lhs.asset, rhs.asset
                    )));
                }
                let amount = if op == Opcode::MonetaryAdd {
                    &lhs.amount + &rhs.amount
                } else {
                    &lhs.amount - &rhs.amount
                };
                self.stack.push(Value::Monetary(Monetary::new(lhs.asset, amount)));
            }
            Opcode::MakeAllotment => {
                let n = self.pop_count()?;
                let mut portions = Vec::with_capacity(n);
                for _ in 0..n {
                    portions.push(self.pop_portion()?);
                }
                let allotment = Allotment::new(portions).map_err(|e| Halt::Invalid(e.to_string()))?;
                self.stack.push(Value::Allotment(allotment));
            }
            Opcode::TakeAll => {
                let overdraft = self.pop_monetary()?;
                let account = self.pop_account()?;
                let funding = self.withdraw_all(&account, &overdraft.asset, &overdraft.amount)?;
                self.stack.push(Value::Funding(funding));
            }
            Opcode::TakeAlways => {
                let monetary = self.pop_monetary()?;
                let account = self.pop_account()?;
                let funding = self.withdraw_always(&account, &monetary)?;
                self.stack.push(Value::Funding(funding));
            }
            Opcode::Take => {
                let monetary = self.pop_monetary()?;
                let funding = self.pop_funding()?;
                if funding.asset != monetary.asset {
                    return Err(Halt::Invalid(format!(
                        "cannot take {} from a funding of {}",
                        monetary.asset, funding.asset
                    )));
                }
                let (taken, remainder) = funding
                    .take(&monetary.amount)
                    .map_err(|_| Halt::InsufficientFunds)?;
                self.stack.push(Value::Funding(remainder));
                self.stack.push(Value::Funding(taken));
            }
            Opcode::TakeMax => {
                let monetary = self.pop_monetary()?;
                if monetary.amount.is_negative() {
                    return Err(Halt::Invalid(format!("cannot take a negative amount {}", monetary)));
                }
                let funding = self.pop_funding()?;
                if funding.asset != monetary.asset {
                    return Err(Halt::Invalid(format!(
                        "cannot take {} from a funding of {}",
                        monetary.asset, funding.asset
                    )));
                }
                let total = funding.total();
                let missing = if monetary.amount > total {
                    &monetary.amount - &total
                } else {
                    MonetaryInt::zero()
                };
                let (taken, remainder) = funding.take_max(&monetary.amount);
                self.stack.push(Value::Monetary(Monetary::new(monetary.asset, missing)));
                self.stack.push(Value::Funding(remainder));
                self.stack.push(Value::Funding(taken));
            }
            Opcode::FundingAssemble => {
                let n = self.pop_count()?;
                if n == 0 {
                    return Err(Halt::Invalid("cannot assemble zero fundings".to_string()));
                }
                let mut fundings = Vec::with_capacity(n);
                for _ in 0..n {
                    fundings.push(self.pop_funding()?);
                }
                let mut fundings = fundings.into_iter().rev();
                let mut result = fundings
                    .next()
                    .ok_or_else(|| Halt::Invalid("cannot assemble zero fundings".to_string()))?;
                for funding in fundings {
                    result = result.concat(&funding).map_err(|e| Halt::Invalid(e.to_string()))?;
                }
                self.stack.push(Value::Funding(result));
            }
            Opcode::FundingSum => {
                let funding = self.pop_funding()?;
                let total = Monetary::new(funding.asset.clone(), funding.total());
                self.stack.push(Value::Funding(funding));
                self.stack.push(Value::Monetary(total));
            }
            Opcode::FundingReverse => {
                let funding = self.pop_funding()?;
                self.stack.push(Value::Funding(funding.reverse()));
            }
            Opcode::Repay => {
                let funding = self.pop_funding()?;
                self.repay(&funding);
            }
            Opcode::Alloc => {
                let allotment = self.pop_allotment()?;
                let monetary = self.pop_monetary()?;
                let parts = allotment.allocate(&monetary.amount);
                for part in parts.into_iter().rev() {
                    self.stack.push(Value::Monetary(Monetary::new(monetary.asset.clone(), part)));
                }
            }
            Opcode::Send => {
                let destination = self.pop_account()?;
                let funding = self.pop_funding()?;
                self.credit(&destination, &funding);
                for part in &funding.parts {
                    if part.amount.is_zero() {
                        continue;
                    }
                    self.postings.push(Posting::new(
                        part.account.clone(),
                        destination.clone(),
                        part.amount.clone(),
                        funding.asset.to_string(),
                    ));
                }
            }
            Opcode::TxMeta => {
                let key = self.pop_string()?;
                let value = self.pop()?;
                self.tx_meta.insert(key, value);
            }
            Opcode::AccountMeta => {
                let account = self.pop_account()?;
                let key = self.pop_string()?;
                let value = self.pop()?;
                self.account_meta.entry(account).or_default().insert(key, value);
            }
        }
        self.pc += 1 + width;
        Ok(())
    }

    fn balance_mut(&mut self, account: &str, asset: &Asset) -> Result<&mut MonetaryInt, Halt> {
        self.balances
            .as_mut()
            .and_then(|balances| balances.get_mut(account))
            .and_then(|assets| assets.get_mut(asset))
            .ok_or_else(|| Halt::Invalid(format!("missing {} balance from {}", asset, account)))
    }

    /// Takes everything above `-overdraft`.
    fn withdraw_all(&mut self, account: &str, asset: &Asset, overdraft: &MonetaryInt) -> Result<Funding, Halt> {
        let balance = self.balance_mut(account, asset)?;
        let available = &*balance + overdraft;
        let taken = if available.is_positive() {
            *balance = -overdraft.clone();
            available
        } else {
            MonetaryInt::zero()
        };
        Ok(Funding::new(asset.clone(), vec![FundingPart::new(account, taken)]))
    }

    /// Takes exactly `monetary`, letting the balance go negative.
    fn withdraw_always(&mut self, account: &str, monetary: &Monetary) -> Result<Funding, Halt> {
        let balance = self.balance_mut(account, &monetary.asset)?;
        *balance -= &monetary.amount;
        Ok(Funding::new(
            monetary.asset.clone(),
            vec![FundingPart::new(account, monetary.amount.clone())],
        ))
    }

    fn credit(&mut self, account: &str, funding: &Funding) {
        if account == WORLD {
            return;
        }
        if let Ok(balance) = self.balance_mut(account, &funding.asset) {
            *balance += &funding.total();
        }
    }

    fn repay(&mut self, funding: &Funding) {
        for part in &funding.parts {
            if part.account == WORLD {
                continue;
            }
            if let Ok(balance) = self.balance_mut(&part.account, &funding.asset) {
                *balance += &part.amount;
            }
        }
    }

    pub fn postings(&self) -> &[Posting] {
        &self.postings
    }

    pub fn tx_meta(&self) -> &BTreeMap<String, Value> {
        &self.tx_meta
    }

    pub fn account_meta(&self) -> &BTreeMap<String, BTreeMap<String, Value>> {
        &self.account_meta
    }

    /// Transaction metadata written by the script, as typed-JSON envelopes.
    pub fn tx_meta_json(&self) -> Result<Metadata, JsonError> {
        self.tx_meta
            .iter()
            .map(|(k, v)| Ok((k.clone(), json::encode(v)?)))
            .collect()
    }

    /// Account metadata written by the script, as typed-JSON envelopes.
    pub fn account_meta_json(&self) -> Result<BTreeMap<String, Metadata>, JsonError> {
        self.account_meta
            .iter()
            .map(|(account, entries)| {
                let metadata = entries
                    .iter()
                    .map(|(k, v)| Ok((k.clone(), json::encode(v)?)))
                    .collect::<Result<Metadata, JsonError>>()?;
                Ok((account.clone(), metadata))
            })
            .collect()
    }

    pub fn stack(&self) -> &[Value] {
        &self.stack
    }

    /// Values printed by `PRINT`, in order.
    pub fn printed(&self) -> &[String] {
        &self.printed
    }

    /// Reason of the last `EXIT_FAIL_INVALID`.
    pub fn failure_reason(&self) -> Option<&str> {
        self.failure.as_deref()
    }

    /// Current balance of a loaded (account, asset) pair.
    pub fn balance(&self, account: &str, asset: &Asset) -> Option<&MonetaryInt> {
        self.balances.as_ref()?.get(account)?.get(asset)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::machine::program::ProgramBuilder;
    use assert_matches::assert_matches;
    use serde_json::json;

    #[derive(Default)]
    struct StaticResolver {
        balances: HashMap<(String, String), MonetaryInt>,
        metadata: HashMap<(String, String), serde_json::Value>,
        balance_calls: usize,
    }

    impl StaticResolver {
        fn with_balance(mut self, account: &str, asset: &str, amount: i64) -> Self {
            self.balances
                .insert((account.to_string(), asset.to_string()), MonetaryInt::from(amount));
            self
        }

        fn with_metadata(mut self, account: &str, key: &str, value: serde_json::Value) -> Self {
            self.metadata.insert((account.to_string(), key.to_string()), value);
            self
        }
    }

    #[async_trait]
    impl ResourceResolver for StaticResolver {
        async fn account_metadata(&mut self, account: &str, key: &str) -> crate::error::Result<Option<serde_json::Value>> {
            Ok(self.metadata.get(&(account.to_string(), key.to_string())).cloned())
        }

        async fn account_balance(&mut self, account: &str, asset: &Asset) -> crate::error::Result<MonetaryInt> {
            self.balance_calls += 1;
            Ok(self
                .balances
                .get(&(account.to_string(), asset.to_string()))
                .cloned()
                .unwrap_or_default())
        }
    }

    fn asset(name: &str) -> Asset {
        Asset::parse(name).unwrap()
    }

    async fn prepare(program: Program, resolver: &mut StaticResolver) -> Machine {
        let mut machine = Machine::new(Arc::new(program));
        machine.set_vars(HashMap::new()).unwrap();
        machine.resolve_resources(resolver).await.unwrap();
        machine.resolve_balances(resolver).await.unwrap();
        machine
    }

    #[tokio::test]
    async fn test_send_from_world() {
        let mut builder = ProgramBuilder::new();
        builder.send("world", "users:001", Monetary::new(asset("USD/2"), 99u64));
        let mut resolver = StaticResolver::default();
        let mut machine = prepare(builder.build(), &mut resolver).await;

        assert_eq!(machine.execute().unwrap(), ExitCode::Ok);
        assert_eq!(
            machine.postings(),
            &[Posting::new("world", "users:001", MonetaryInt::from(99u64), "USD/2")]
        );
        assert_eq!(machine.balance("users:001", &asset("USD/2")), Some(&MonetaryInt::from(99u64)));
        assert_eq!(resolver.balance_calls, 1);
    }

    #[tokio::test]
    async fn test_insufficient_funds() {
        let mut builder = ProgramBuilder::new();
        builder.send("users:002", "world", Monetary::new(asset("COIN"), 105u64));
        let mut resolver = StaticResolver::default().with_balance("users:002", "COIN", 100);
        let mut machine = prepare(builder.build(), &mut resolver).await;

        assert_eq!(machine.execute().unwrap(), ExitCode::FailInsufficientFunds);
        assert!(machine.postings().is_empty());
    }

    #[tokio::test]
    async fn test_zero_send_produces_no_posting() {
        let mut builder = ProgramBuilder::new();
        builder.send("world", "users:001", Monetary::new(asset("USD"), 0u64));
        let mut resolver = StaticResolver::default();
        let mut machine = prepare(builder.build(), &mut resolver).await;

        assert_eq!(machine.execute().unwrap(), ExitCode::Ok);
        assert!(machine.postings().is_empty());
    }

    #[tokio::test]
    async fn test_leftover_stack_is_invalid() {
        let mut builder = ProgramBuilder::new();
        builder.ipush(1);
        let mut resolver = StaticResolver::default();
        let mut machine = prepare(builder.build(), &mut resolver).await;

        assert_eq!(machine.execute().unwrap(), ExitCode::FailInvalid);
        assert!(machine.failure_reason().is_some());
    }

    #[tokio::test]
    async fn test_execute_requires_resolution() {
        let mut machine = Machine::new(Arc::new(ProgramBuilder::new().build()));
        assert_eq!(machine.execute().unwrap_err(), MachineError::ResourcesNotInitialized);
    }

    #[tokio::test]
    async fn test_monetary_add_mismatched_assets_is_invalid() {
        let mut builder = ProgramBuilder::new();
        let a = builder.constant(Value::Monetary(Monetary::new(asset("USD"), 1u64)));
        let b = builder.constant(Value::Monetary(Monetary::new(asset("EUR"), 1u64)));
        builder.apush(a).apush(b).op(Opcode::MonetaryAdd);
        let mut resolver = StaticResolver::default();
        let mut machine = prepare(builder.build(), &mut resolver).await;

        assert_eq!(machine.execute().unwrap(), ExitCode::FailInvalid);
    }

    #[tokio::test]
    async fn test_alloc_pushes_first_part_on_top() {
        let mut builder = ProgramBuilder::new();
        let mon = builder.constant(Value::Monetary(Monetary::new(asset("USD"), 100u64)));
        let third = builder.constant(Value::Portion(Portion::parse("1/3").unwrap()));
        let rest = builder.constant(Value::Portion(Portion::Remaining));
        builder
            .apush(mon)
            .apush(rest)
            .apush(third)
            .ipush(2)
            .op(Opcode::MakeAllotment)
            .op(Opcode::Alloc);
        let mut resolver = StaticResolver::default();
        let mut machine = prepare(builder.build(), &mut resolver).await;

        while machine.tick().is_none() {}
        assert_eq!(
            machine.stack(),
            &[
                Value::Monetary(Monetary::new(asset("USD"), 66u64)),
                Value::Monetary(Monetary::new(asset("USD"), 34u64)),
            ]
        );
    }

    #[tokio::test]
    async fn test_take_max_pushes_missing_remainder_and_taken() {
        let mut builder = ProgramBuilder::new();
        let acc = builder.account("users:001");
        let zero = builder.constant(Value::Monetary(Monetary::new(asset("USD"), 0u64)));
        let want = builder.constant(Value::Monetary(Monetary::new(asset("USD"), 30u64)));
        builder
            .apush(acc)
            .apush(zero)
            .op(Opcode::TakeAll)
            .apush(want)
            .op(Opcode::TakeMax)
            .need_balance(acc, zero);
        let mut resolver = StaticResolver::default().with_balance("users:001", "USD", 20);
        let mut machine = prepare(builder.build(), &mut resolver).await;

        while machine.tick().is_none() {}
        let stack = machine.stack();
        assert_eq!(stack.len(), 3);
        assert_eq!(stack[0], Value::Monetary(Monetary::new(asset("USD"), 10u64)));
        assert_eq!(stack[1], Value::Funding(Funding::empty(asset("USD"))));
        assert_eq!(
            stack[2],
            Value::Funding(Funding::new(asset("USD"), vec![FundingPart::new("users:001", 20u64)]))
        );
    }

    #[tokio::test]
    async fn test_take_all_honors_overdraft() {
        let mut builder = ProgramBuilder::new();
        let acc = builder.account("users:001");
        let overdraft = builder.constant(Value::Monetary(Monetary::new(asset("USD"), 5u64)));
        builder
            .apush(acc)
            .apush(overdraft)
            .op(Opcode::TakeAll)
            .op(Opcode::FundingSum)
            .need_balance(acc, overdraft);
        let mut resolver = StaticResolver::default().with_balance("users:001", "USD", 10);
        let mut machine = prepare(builder.build(), &mut resolver).await;

        while machine.tick().is_none() {}
        assert_eq!(machine.stack()[1], Value::Monetary(Monetary::new(asset("USD"), 15u64)));
        assert_eq!(machine.balance("users:001", &asset("USD")), Some(&MonetaryInt::from(-5i64)));
    }

    #[tokio::test]
    async fn test_take_all_without_balance_is_invalid() {
        let mut builder = ProgramBuilder::new();
        let acc = builder.account("users:001");
        let overdraft = builder.constant(Value::Monetary(Monetary::new(asset("USD"), 0u64)));
        builder.apush(acc).apush(overdraft).op(Opcode::TakeAll);
        let mut resolver = StaticResolver::default();
        let mut machine = prepare(builder.build(), &mut resolver).await;

        assert_eq!(machine.execute().unwrap(), ExitCode::FailInvalid);
        assert_eq!(machine.failure_reason(), Some("missing USD balance from users:001"));
    }

    #[tokio::test]
    async fn test_funding_assemble_concatenates_in_push_order() {
        let mut builder = ProgramBuilder::new();
        let a = builder.account("a");
        let b = builder.account("b");
        let ten = builder.constant(Value::Monetary(Monetary::new(asset("USD"), 10u64)));
        let five = builder.constant(Value::Monetary(Monetary::new(asset("USD"), 5u64)));
        builder
            .apush(a)
            .apush(ten)
            .op(Opcode::TakeAlways)
            .apush(b)
            .apush(five)
            .op(Opcode::TakeAlways)
            .ipush(2)
            .op(Opcode::FundingAssemble)
            .need_balance(a, ten)
            .need_balance(b, five);
        let mut resolver = StaticResolver::default();
        let mut machine = prepare(builder.build(), &mut resolver).await;

        while machine.tick().is_none() {}
        assert_eq!(
            machine.stack(),
            &[Value::Funding(Funding::new(
                asset("USD"),
                vec![FundingPart::new("a", 10u64), FundingPart::new("b", 5u64)]
            ))]
        );
    }

    #[tokio::test]
    async fn test_funding_assemble_zero_is_invalid() {
        let mut builder = ProgramBuilder::new();
        builder.ipush(0).op(Opcode::FundingAssemble);
        let mut resolver = StaticResolver::default();
        let mut machine = prepare(builder.build(), &mut resolver).await;
        assert_eq!(machine.execute().unwrap(), ExitCode::FailInvalid);
    }

    #[tokio::test]
    async fn test_bump_moves_value_to_top() {
        let mut builder = ProgramBuilder::new();
        builder.ipush(1).ipush(2).ipush(3).ipush(2).op(Opcode::Bump);
        let mut resolver = StaticResolver::default();
        let mut machine = prepare(builder.build(), &mut resolver).await;

        while machine.tick().is_none() {}
        let numbers: Vec<Value> = [2u64, 3, 1].iter().map(|n| Value::Number(BigInt::from(*n))).collect();
        assert_eq!(machine.stack(), numbers.as_slice());
    }

    #[tokio::test]
    async fn test_isub_subtracts_top_from_below() {
        let mut builder = ProgramBuilder::new();
        builder.ipush(10).ipush(3).op(Opcode::Isub).op(Opcode::Print);
        let mut resolver = StaticResolver::default();
        let mut machine = prepare(builder.build(), &mut resolver).await;

        assert_eq!(machine.execute().unwrap(), ExitCode::Ok);
        assert_eq!(machine.printed(), &["7".to_string()]);
    }

    #[tokio::test]
    async fn test_fail_and_unknown_opcode() {
        let mut builder = ProgramBuilder::new();
        builder.op(Opcode::Fail);
        let mut resolver = StaticResolver::default();
        let mut machine = prepare(builder.build(), &mut resolver).await;
        assert_eq!(machine.execute().unwrap(), ExitCode::Fail);

        let mut builder = ProgramBuilder::new();
        builder.raw(&[0xEE]);
        let mut machine = prepare(builder.build(), &mut resolver).await;
        assert_eq!(machine.execute().unwrap(), ExitCode::FailInvalid);
    }

    #[tokio::test]
    async fn test_delete_funding_is_invalid() {
        let mut builder = ProgramBuilder::new();
        let acc = builder.account("world");
        let mon = builder.constant(Value::Monetary(Monetary::new(asset("USD"), 1u64)));
        builder
            .apush(acc)
            .apush(mon)
            .op(Opcode::TakeAlways)
            .op(Opcode::Delete)
            .need_balance(acc, mon);
        let mut resolver = StaticResolver::default();
        let mut machine = prepare(builder.build(), &mut resolver).await;
        assert_eq!(machine.execute().unwrap(), ExitCode::FailInvalid);
    }

    #[tokio::test]
    async fn test_metadata_writes_are_collected() {
        let mut builder = ProgramBuilder::new();
        builder
            .tx_meta("priority", Value::String("high".into()))
            .account_meta("users:001", "tier", Value::Number(BigInt::from(2)));
        let mut resolver = StaticResolver::default();
        let mut machine = prepare(builder.build(), &mut resolver).await;

        assert_eq!(machine.execute().unwrap(), ExitCode::Ok);
        let tx_meta = machine.tx_meta_json().unwrap();
        assert_eq!(tx_meta["priority"], json!({"type": "string", "value": "high"}));
        let account_meta = machine.account_meta_json().unwrap();
        assert_eq!(account_meta["users:001"]["tier"], json!({"type": "number", "value": 2}));
    }

    #[tokio::test]
    async fn test_resolve_metadata_variable() {
        let mut builder = ProgramBuilder::new();
        let acc = builder.account("users:001");
        builder.resource(Resource::VariableAccountMetadata {
            name: "dest".into(),
            typ: Type::Account,
            account: acc,
            key: "payout".into(),
        });
        let program = Arc::new(builder.build());

        let mut resolver = StaticResolver::default().with_metadata(
            "users:001",
            "payout",
            json!({"type": "account", "value": "banks:001"}),
        );
        let mut machine = Machine::new(Arc::clone(&program));
        machine.resolve_resources(&mut resolver).await.unwrap();

        let mut empty = StaticResolver::default();
        let mut machine = Machine::new(Arc::clone(&program));
        let err = machine.resolve_resources(&mut empty).await.unwrap_err();
        assert!(err.to_string().contains("missing key payout in metadata for account users:001"));

        let mut wrong = StaticResolver::default().with_metadata(
            "users:001",
            "payout",
            json!({"type": "number", "value": 3}),
        );
        let mut machine = Machine::new(program);
        let err = machine.resolve_resources(&mut wrong).await.unwrap_err();
        assert!(err.to_string().contains("wrong type: expected account, got number"));
    }

    #[tokio::test]
    async fn test_negative_balance_variable_is_rejected() {
        let mut builder = ProgramBuilder::new();
        let acc = builder.account("world");
        let usd = builder.constant(Value::Asset(asset("USD")));
        builder.resource(Resource::VariableAccountBalance {
            name: "bal".into(),
            account: acc,
            asset: usd,
        });
        let mut resolver = StaticResolver::default().with_balance("world", "USD", -100);
        let mut machine = Machine::new(Arc::new(builder.build()));
        let err = machine.resolve_resources(&mut resolver).await.unwrap_err();
        assert_matches!(err, LedgerError::Script(ScriptError { code: ScriptErrorCode::CompilationFailed, .. }));
        assert!(err.to_string().contains("must be non-negative"));
    }

    #[tokio::test]
    async fn test_missing_variable_fails_resolution() {
        let mut builder = ProgramBuilder::new();
        builder.variable("amount", Type::Monetary);
        let mut machine = Machine::new(Arc::new(builder.build()));
        let err = machine
            .resolve_resources(&mut StaticResolver::default())
            .await
            .unwrap_err();
        assert!(err.to_string().contains("missing variable 'amount'"));
    }
}
