//! Numscript virtual machine: values, compiled programs and the interpreter.

pub mod json;
pub mod monetary;
pub mod program;
pub mod value;
pub mod vm;

pub use monetary::MonetaryInt;
pub use program::{Address, CompileError, Compiler, JsonCompiler, Opcode, Program, ProgramBuilder, Resource};
pub use value::{Allotment, Funding, FundingPart, Monetary, Portion, Type, Value, ValueError};
pub use vm::{ExitCode, Machine, MachineError, ResourceResolver};
