//! JSON program descriptions.
//!
//! The driver does not disassemble. It reads an already lifted program,
//! with optional convention assignments and prototypes, in this shape:
//!
//! ```json
//! {
//!   "name": "sample",
//!   "architecture": "x86",
//!   "entries": [{ "address": "0x1000", "name": "main" }],
//!   "blocks": [{
//!     "address": "0x1000",
//!     "successors": [],
//!     "statements": [
//!       { "address": "0x1010", "op": "call", "target": "0x2000" },
//!       { "address": "0x1015", "op": "return" }
//!     ]
//!   }],
//!   "conventions": { "0x2000": "stdcall" },
//!   "signatures": { "0x2000": { "arguments": ["char*", "int32"], "returns": "void" } }
//! }
//! ```
//!
//! Addresses are numbers or hex strings. Locations are register names,
//! `flags`, `[sp+N]` stack slots, or `[ADDR]` globals.

use anyhow::{anyhow, bail, Context as _, Result};
use hexhook_analysis::{CalleeId, Conventions, FunctionSignature, ParamType, Signatures};
use hexhook_core::{
    register_by_name, Architecture, CallTarget, Location, Module, Program, ProgramBlock,
    StatementKind, Value,
};
use serde::Deserialize;
use std::collections::BTreeMap;
use std::path::Path;

#[derive(Debug, Deserialize)]
#[serde(untagged)]
enum Address {
    Number(u64),
    Text(String),
}

impl Address {
    fn resolve(&self) -> Result<u64> {
        match self {
            Self::Number(n) => Ok(*n),
            Self::Text(s) => parse_number(s),
        }
    }
}

#[derive(Debug, Deserialize)]
struct EntryDesc {
    address: Address,
    name: Option<String>,
}

#[derive(Debug, Deserialize)]
#[serde(tag = "op", rename_all = "lowercase")]
enum StatementDesc {
    Assign {
        address: Option<Address>,
        dst: String,
        src: String,
    },
    Call {
        address: Option<Address>,
        target: String,
    },
    Return {
        address: Option<Address>,
        #[serde(default)]
        pop: u32,
    },
    Jump {
        address: Option<Address>,
    },
    Nop {
        address: Option<Address>,
    },
}

#[derive(Debug, Deserialize)]
struct BlockDesc {
    address: Address,
    #[serde(default)]
    successors: Vec<Address>,
    statements: Vec<StatementDesc>,
}

#[derive(Debug, Deserialize)]
struct SignatureDesc {
    name: Option<String>,
    #[serde(default)]
    arguments: Vec<String>,
    returns: Option<String>,
    #[serde(default)]
    variadic: bool,
}

/// A program description as read from disk.
#[derive(Debug, Deserialize)]
pub struct ProgramDesc {
    #[serde(default = "default_name")]
    name: String,
    #[serde(default = "default_architecture")]
    architecture: String,
    #[serde(default)]
    entries: Vec<EntryDesc>,
    blocks: Vec<BlockDesc>,
    #[serde(default)]
    conventions: BTreeMap<String, String>,
    #[serde(default)]
    signatures: BTreeMap<String, SignatureDesc>,
}

fn default_name() -> String {
    "program".to_string()
}

fn default_architecture() -> String {
    "x86".to_string()
}

/// Everything the driver seeds a session with.
pub struct Loaded {
    pub module: Module,
    pub program: Program,
    pub conventions: Conventions,
    pub signatures: Signatures,
}

pub fn load(path: &Path) -> Result<Loaded> {
    let text = std::fs::read_to_string(path)
        .with_context(|| format!("Failed to read program: {}", path.display()))?;
    let desc: ProgramDesc = serde_json::from_str(&text)
        .with_context(|| format!("Failed to parse program: {}", path.display()))?;
    desc.into_loaded()
}

impl ProgramDesc {
    pub fn into_loaded(self) -> Result<Loaded> {
        let arch = Architecture::parse(&self.architecture)
            .ok_or_else(|| anyhow!("unknown architecture {:?}", self.architecture))?;

        let mut program = Program::new();
        for block in &self.blocks {
            let address = block.address.resolve()?;
            let mut lifted = ProgramBlock::new(address);
            for succ in &block.successors {
                lifted = lifted.with_successor(succ.resolve()?);
            }
            for (i, stmt) in block.statements.iter().enumerate() {
                let (at, kind) = statement(arch, stmt)
                    .with_context(|| format!("block {:#x}, statement {}", address, i))?;
                lifted.push(at.unwrap_or(address), kind);
            }
            program
                .add_block(lifted)
                .with_context(|| format!("block {:#x}", address))?;
        }

        let mut module = Module::new(self.name, arch);
        for (i, entry) in self.entries.iter().enumerate() {
            let address = entry.address.resolve()?;
            if i == 0 {
                module = module.with_entry_point(address);
            }
            program.add_entry(address, entry.name.clone());
        }

        let mut conventions = Conventions::new();
        for (address, preset) in &self.conventions {
            let id = conventions
                .register_preset(preset)
                .ok_or_else(|| anyhow!("unknown convention {:?}", preset))?;
            conventions.assign(CalleeId::Address(parse_number(address)?), id);
        }

        let mut signatures = Signatures::new();
        for (address, sig) in &self.signatures {
            let signature = signature(sig).with_context(|| format!("signature of {}", address))?;
            signatures.set_function_signature(CalleeId::Address(parse_number(address)?), signature);
        }

        Ok(Loaded {
            module,
            program,
            conventions,
            signatures,
        })
    }
}

fn statement(arch: Architecture, desc: &StatementDesc) -> Result<(Option<u64>, StatementKind)> {
    let address = |a: &Option<Address>| a.as_ref().map(Address::resolve).transpose();
    Ok(match desc {
        StatementDesc::Assign { address: at, dst, src } => (
            address(at)?,
            StatementKind::Assign {
                dst: parse_location(arch, dst)?,
                src: parse_value(arch, src)?,
            },
        ),
        StatementDesc::Call { address: at, target } => {
            let target = match parse_number(target) {
                Ok(addr) => CallTarget::Direct(addr),
                Err(_) => CallTarget::Indirect(parse_location(arch, target)?),
            };
            (address(at)?, StatementKind::Call { target })
        }
        StatementDesc::Return { address: at, pop } => {
            (address(at)?, StatementKind::Return { pop: *pop })
        }
        StatementDesc::Jump { address: at } => (address(at)?, StatementKind::Jump),
        StatementDesc::Nop { address: at } => (address(at)?, StatementKind::Nop),
    })
}

fn signature(desc: &SignatureDesc) -> Result<FunctionSignature> {
    let ty = |s: &String| ParamType::parse(s).ok_or_else(|| anyhow!("unknown type {:?}", s));
    let arguments = desc.arguments.iter().map(ty).collect::<Result<Vec<_>>>()?;
    let return_type = desc.returns.as_ref().map(ty).transpose()?;
    let mut sig = FunctionSignature::new(arguments, return_type);
    sig.variadic = desc.variadic;
    if let Some(name) = &desc.name {
        sig = sig.with_name(name.clone());
    }
    Ok(sig)
}

fn parse_number(s: &str) -> Result<u64> {
    let s = s.trim();
    let parsed = match s.strip_prefix("0x").or_else(|| s.strip_prefix("0X")) {
        Some(hex) => u64::from_str_radix(hex, 16),
        None => s.parse(),
    };
    parsed.map_err(|e| anyhow!("invalid number {:?}: {}", s, e))
}

pub fn parse_location(arch: Architecture, s: &str) -> Result<Location> {
    let s = s.trim();
    if s.eq_ignore_ascii_case("flags") {
        return Ok(Location::Flags);
    }
    if let Some(inner) = s.strip_prefix('[').and_then(|r| r.strip_suffix(']')) {
        let inner = inner.trim();
        if let Some(rest) = inner.strip_prefix("sp") {
            let rest = rest.trim();
            if rest.is_empty() {
                return Ok(Location::Stack(0));
            }
            let (negative, magnitude) = match rest.as_bytes()[0] {
                b'+' => (false, &rest[1..]),
                b'-' => (true, &rest[1..]),
                _ => bail!("invalid stack slot {:?}", s),
            };
            let offset = parse_number(magnitude)? as i64;
            return Ok(Location::Stack(if negative { -offset } else { offset }));
        }
        return Ok(Location::Memory(parse_number(inner)?));
    }
    register_by_name(arch, s)
        .map(Location::Register)
        .ok_or_else(|| anyhow!("unknown {} register {:?}", arch, s))
}

fn parse_value(arch: Architecture, s: &str) -> Result<Value> {
    match parse_number(s) {
        Ok(n) => Ok(Value::Constant(n)),
        Err(_) => parse_location(arch, s).map(Value::Location),
    }
}
