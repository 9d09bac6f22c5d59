//! Compiled programs: bytecode, resource table and the balances a run needs.
//!
//! A [`Program`] is immutable once built. Machines borrow it through an `Arc` so any number
//! of concurrent runs can share one compiled program.

use std::collections::{BTreeMap, BTreeSet, HashMap};
use std::fmt;

use bytes::Bytes;
use serde::{Deserialize, Serialize};
use thiserror::Error;

use crate::core::account::WORLD;
use crate::machine::json::{self, JsonError};
use crate::machine::monetary::MonetaryInt;
use crate::machine::value::{Monetary, Type, Value};
use crate::machine::vm::MachineError;

/// Index into a program's resource table.
pub type Address = u16;

/// One-byte instruction codes. `APUSH` is followed by a little-endian `u16` resource
/// address and `IPUSH` by a little-endian `u64` literal; every other opcode has no operand.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
#[repr(u8)]
pub enum Opcode {
    Apush = 1,
    Ipush,
    Bump,
    Delete,
    Iadd,
    Isub,
    Print,
    Fail,
    Asset,
    MonetaryNew,
    MonetaryAdd,
    MonetarySub,
    MakeAllotment,
    TakeAll,
    TakeAlways,
    Take,
    TakeMax,
    FundingAssemble,
    FundingSum,
    FundingReverse,
    Repay,
    Alloc,
    Send,
    TxMeta,
    AccountMeta,
}

const OPCODES: [Opcode; 25] = [
    Opcode::Apush,
    Opcode::Ipush,
    Opcode::Bump,
    Opcode::Delete,
    Opcode::Iadd,
    Opcode::Isub,
    Opcode::Print,
    Opcode::Fail,
    Opcode::Asset,
    Opcode::MonetaryNew,
    Opcode::MonetaryAdd,
    Opcode::MonetarySub,
    Opcode::MakeAllotment,
    Opcode::TakeAll,
    Opcode::TakeAlways,
    Opcode::Take,
    Opcode::TakeMax,
    Opcode::FundingAssemble,
    Opcode::FundingSum,
    Opcode::FundingReverse,
    Opcode::Repay,
    Opcode::Alloc,
    Opcode::Send,
    Opcode::TxMeta,
    Opcode::AccountMeta,
];

impl Opcode {
    /// Width of the inline operand following the opcode byte.
    pub fn operand_width(self) -> usize {
        match self {
            Opcode::Apush => 2,
            Opcode::Ipush => 8,
            _ => 0,
        }
    }

    pub fn mnemonic(self) -> &'static str {
        match self {
            Opcode::Apush => "APUSH",
            Opcode::Ipush => "IPUSH",
            Opcode::Bump => "BUMP",
            Opcode::Delete => "DELETE",
            Opcode::Iadd => "IADD",
            Opcode::Isub => "ISUB",
            Opcode::Print => "PRINT",
            Opcode::Fail => "FAIL",
            Opcode::Asset => "ASSET",
            Opcode::MonetaryNew => "MONETARY_NEW",
            Opcode::MonetaryAdd => "MONETARY_ADD",
            Opcode::MonetarySub => "MONETARY_SUB",
            Opcode::MakeAllotment => "MAKE_ALLOTMENT",
            Opcode::TakeAll => "TAKE_ALL",
            Opcode::TakeAlways => "TAKE_ALWAYS",
            Opcode::Take => "TAKE",
            Opcode::TakeMax => "TAKE_MAX",
            Opcode::FundingAssemble => "FUNDING_ASSEMBLE",
            Opcode::FundingSum => "FUNDING_SUM",
            Opcode::FundingReverse => "FUNDING_REVERSE",
            Opcode::Repay => "REPAY",
            Opcode::Alloc => "ALLOC",
            Opcode::Send => "SEND",
            Opcode::TxMeta => "TX_META",
            Opcode::AccountMeta => "ACCOUNT_META",
        }
    }
}

impl TryFrom<u8> for Opcode {
    type Error = u8;

    fn try_from(byte: u8) -> Result<Self, Self::Error> {
        byte.checked_sub(1)
            .and_then(|i| OPCODES.get(i as usize))
            .copied()
            .ok_or(byte)
    }
}

impl fmt::Display for Opcode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.mnemonic())
    }
}

/// Entry of the resource table, resolved before execution in table order.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum Resource {
    Constant {
        value: Value,
    },
    Variable {
        name: String,
        #[serde(rename = "type")]
        typ: Type,
    },
    /// Metadata `key` of the account found at resource `account`.
    VariableAccountMetadata {
        name: String,
        #[serde(rename = "type")]
        typ: Type,
        account: Address,
        key: String,
    },
    /// Balance of the account at `account` for the asset carried by resource `asset`.
    VariableAccountBalance {
        name: String,
        account: Address,
        asset: Address,
    },
    /// Monetary of the asset at resource `asset` and a literal amount.
    Monetary {
        asset: Address,
        amount: MonetaryInt,
    },
}

impl fmt::Display for Resource {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Resource::Constant { value } => write!(f, "{}", value),
            Resource::Variable { name, typ } => write!(f, "<{} ${}>", typ, name),
            Resource::VariableAccountMetadata { name, typ, account, key } => {
                write!(f, "<{} ${}> = meta(${}, \"{}\")", typ, name, account, key)
            }
            Resource::VariableAccountBalance { name, account, asset } => {
                write!(f, "<monetary ${}> = balance(${}, ${})", name, account, asset)
            }
            Resource::Monetary { asset, amount } => write!(f, "[${} {}]", asset, amount),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Program {
    pub instructions: Bytes,
    pub resources: Vec<Resource>,
    /// Account resource address to the asset-bearing resource addresses whose balance
    /// must be known before the run.
    #[serde(default)]
    pub needed_balances: BTreeMap<Address, BTreeSet<Address>>,
}

impl Program {
    /// Names and types of the variables the caller must bind.
    pub fn declared_variables(&self) -> impl Iterator<Item = (&str, Type)> {
        self.resources.iter().filter_map(|r| match r {
            Resource::Variable { name, typ } => Some((name.as_str(), *typ)),
            _ => None,
        })
    }

    /// Checks a set of bindings against the declared variables: every variable present,
    /// of the declared type, and nothing extra.
    pub fn parse_variables(&self, vars: HashMap<String, Value>) -> Result<HashMap<String, Value>, MachineError> {
        for (name, typ) in self.declared_variables() {
            match vars.get(name) {
                None => return Err(MachineError::MissingVariable(name.to_string())),
                Some(value) if value.get_type() != typ => {
                    return Err(MachineError::WrongVariableType {
                        name: name.to_string(),
                        expected: typ,
                        got: value.get_type(),
                    })
                }
                Some(_) => {}
            }
        }
        self.check_extraneous(vars.keys())?;
        Ok(vars)
    }

    /// Decodes untyped JSON bindings using the declared variable types.
    pub fn parse_variables_json(
        &self,
        vars: &serde_json::Map<String, serde_json::Value>,
    ) -> Result<HashMap<String, Value>, MachineError> {
        let mut parsed = HashMap::new();
        for (name, typ) in self.declared_variables() {
            let raw = vars
                .get(name)
                .ok_or_else(|| MachineError::MissingVariable(name.to_string()))?;
            let value = json::decode_bare(typ, raw).map_err(|err| MachineError::InvalidVariable {
                name: name.to_string(),
                reason: err.to_string(),
            })?;
            parsed.insert(name.to_string(), value);
        }
        self.check_extraneous(vars.keys())?;
        Ok(parsed)
    }

    fn check_extraneous<'a>(&self, names: impl Iterator<Item = &'a String>) -> Result<(), MachineError> {
        let declared: BTreeSet<&str> = self.declared_variables().map(|(name, _)| name).collect();
        for name in names {
            if !declared.contains(name.as_str()) {
                return Err(MachineError::ExtraneousVariable(name.clone()));
            }
        }
        Ok(())
    }

    /// Approximate in-memory footprint, used as the cache cost.
    pub fn estimated_size(&self) -> u64 {
        let resources: usize = self
            .resources
            .iter()
            .map(|r| {
                std::mem::size_of::<Resource>()
                    + match r {
                        Resource::Constant { value: Value::String(s) }
                        | Resource::Constant { value: Value::Account(s) } => s.len(),
                        Resource::Variable { name, .. } | Resource::VariableAccountBalance { name, .. } => {
                            name.len()
                        }
                        Resource::VariableAccountMetadata { name, key, .. } => name.len() + key.len(),
                        _ => 0,
                    }
            })
            .sum();
        let balances = self.needed_balances.values().map(|s| 8 + s.len() * 2).sum::<usize>();
        (std::mem::size_of::<Program>() + self.instructions.len() + resources + balances) as u64
    }
}

impl fmt::Display for Program {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        writeln!(f, "Program:")?;
        writeln!(f, "INSTRUCTIONS")?;
        let code = &self.instructions;
        let mut pc = 0;
        while pc < code.len() {
            write!(f, "{:02}----- ", pc)?;
            match Opcode::try_from(code[pc]) {
                Ok(op) => {
                    let width = op.operand_width();
                    match op {
                        Opcode::Apush if pc + 2 < code.len() => {
                            let addr = u16::from_le_bytes([code[pc + 1], code[pc + 2]]);
                            match self.resources.get(addr as usize) {
                                Some(r) => writeln!(f, "{} ${:02} // {}", op, addr, r)?,
                                None => writeln!(f, "{} ${:02}", op, addr)?,
                            }
                        }
                        Opcode::Ipush if pc + 8 < code.len() => {
                            let mut raw = [0u8; 8];
                            raw.copy_from_slice(&code[pc + 1..pc + 9]);
                            writeln!(f, "{} {}", op, u64::from_le_bytes(raw))?;
                        }
                        _ => writeln!(f, "{}", op)?,
                    }
                    pc += 1 + width;
                }
                Err(byte) => {
                    writeln!(f, "<invalid opcode {}>", byte)?;
                    pc += 1;
                }
            }
        }
        writeln!(f, "RESOURCES")?;
        for (i, r) in self.resources.iter().enumerate() {
            writeln!(f, "{:02}: {}", i, r)?;
        }
        Ok(())
    }
}

/// Assembler for programs. Used by compilers and tests.
#[derive(Debug, Default)]
pub struct ProgramBuilder {
    instructions: Vec<u8>,
    resources: Vec<Resource>,
    needed_balances: BTreeMap<Address, BTreeSet<Address>>,
}

impl ProgramBuilder {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn resource(&mut self, resource: Resource) -> Address {
        self.resources.push(resource);
        (self.resources.len() - 1) as Address
    }

    pub fn constant(&mut self, value: Value) -> Address {
        self.resource(Resource::Constant { value })
    }

    pub fn account(&mut self, address: &str) -> Address {
        self.constant(Value::Account(address.to_string()))
    }

    pub fn variable(&mut self, name: &str, typ: Type) -> Address {
        self.resource(Resource::Variable {
            name: name.to_string(),
            typ,
        })
    }

    pub fn op(&mut self, op: Opcode) -> &mut Self {
        self.instructions.push(op as u8);
        self
    }

    pub fn apush(&mut self, address: Address) -> &mut Self {
        self.instructions.push(Opcode::Apush as u8);
        self.instructions.extend_from_slice(&address.to_le_bytes());
        self
    }

    pub fn ipush(&mut self, value: u64) -> &mut Self {
        self.instructions.push(Opcode::Ipush as u8);
        self.instructions.extend_from_slice(&value.to_le_bytes());
        self
    }

    /// Appends raw bytes, bypassing opcode encoding.
    pub fn raw(&mut self, bytes: &[u8]) -> &mut Self {
        self.instructions.extend_from_slice(bytes);
        self
    }

    pub fn need_balance(&mut self, account: Address, asset: Address) -> &mut Self {
        self.needed_balances.entry(account).or_default().insert(asset);
        self
    }

    /// Emits a single-source transfer of `monetary` from `source` to `destination`.
    ///
    /// `world` is drawn with `TAKE_ALWAYS`; any other source is drawn with `TAKE_ALL`
    /// and no overdraft, so the run exits with insufficient funds when the balance
    /// cannot cover the amount.
    pub fn send(&mut self, source: &str, destination: &str, monetary: Monetary) -> &mut Self {
        let asset = monetary.asset.clone();
        let src = self.account(source);
        let dst = self.account(destination);
        let mon = self.constant(Value::Monetary(monetary));
        self.apush(src);
        if source == WORLD {
            self.apush(mon).op(Opcode::TakeAlways);
        } else {
            let overdraft = self.constant(Value::Monetary(Monetary::new(asset, MonetaryInt::zero())));
            self.apush(overdraft).op(Opcode::TakeAll);
        }
        self.apush(mon)
            .op(Opcode::Take)
            .apush(dst)
            .op(Opcode::Send)
            .op(Opcode::Repay);
        self.need_balance(src, mon).need_balance(dst, mon)
    }

    /// Emits `set_tx_meta(key, value)`.
    pub fn tx_meta(&mut self, key: &str, value: Value) -> &mut Self {
        let value = self.constant(value);
        let key = self.constant(Value::String(key.to_string()));
        self.apush(value).apush(key).op(Opcode::TxMeta)
    }

    /// Emits `set_account_meta(account, key, value)`.
    pub fn account_meta(&mut self, account: &str, key: &str, value: Value) -> &mut Self {
        let value = self.constant(value);
        let key = self.constant(Value::String(key.to_string()));
        let account = self.account(account);
        self.apush(value).apush(key).apush(account).op(Opcode::AccountMeta)
    }

    pub fn build(self) -> Program {
        Program {
            instructions: Bytes::from(self.instructions),
            resources: self.resources,
            needed_balances: self.needed_balances,
        }
    }
}

#[derive(Error, Debug, Clone, PartialEq, Eq)]
#[error("{0}")]
pub struct CompileError(pub String);

impl From<JsonError> for CompileError {
    fn from(err: JsonError) -> Self {
        CompileError(err.to_string())
    }
}

/// Turns script source into a program.
pub trait Compiler: Send + Sync {
    fn compile(&self, source: &str) -> Result<Program, CompileError>;
}

/// Compiler whose source text is a JSON-serialized [`Program`].
#[derive(Debug, Clone, Copy, Default)]
pub struct JsonCompiler;

impl Compiler for JsonCompiler {
    fn compile(&self, source: &str) -> Result<Program, CompileError> {
        let program: Program =
            serde_json::from_str(source).map_err(|e| CompileError(format!("invalid program: {}", e)))?;
        for (i, resource) in program.resources.iter().enumerate() {
            let refers_forward = |addr: &Address| *addr as usize >= i;
            let bad = match resource {
                Resource::VariableAccountMetadata { account, .. } => refers_forward(account),
                Resource::VariableAccountBalance { account, asset, .. } => {
                    refers_forward(account) || refers_forward(asset)
                }
                Resource::Monetary { asset, .. } => refers_forward(asset),
                _ => false,
            };
            if bad {
                return Err(CompileError(format!("resource {} refers to a later resource", i)));
            }
        }
        Ok(program)
    }
}
