//! Symbol queries over loaded segments.
//!
//! A query string is first evaluated as an address expression; only if
//! that fails is it compiled as a regular expression over symbol names.

use std::collections::BTreeMap;
use std::slice;

use regex::Regex;
use thiserror::Error;

use crate::disasm::Arch;
use crate::symtab::MethodSymbol;
use crate::Segment;

#[derive(Debug, Error)]
pub enum EvalError {
    #[error("'{0}' is not an address expression")]
    NotAnAddress(String),
    #[error("no machine state available")]
    NoMachineState,
    #[error("register {0} is not present in the machine state")]
    MissingRegister(u16),
}

#[derive(Debug, Error)]
#[error("'{expr}' is neither an address nor a valid pattern: {source}")]
pub struct QueryError {
    pub expr: String,
    #[source]
    pub source: regex::Error,
}

/// Turns expression strings into addresses. Commands take this as a seam
/// so tests can substitute a canned evaluator.
pub trait Evaluator {
    fn evaluate(&self, expr: &str) -> Result<u64, EvalError>;
}

/// Evaluates numeric literals and register names against a captured
/// register file.
pub struct MachineEvaluator<'a> {
    registers: &'a BTreeMap<u16, u64>,
    arch: Arch,
}

impl<'a> MachineEvaluator<'a> {
    pub fn new(registers: &'a BTreeMap<u16, u64>, arch: Arch) -> Self {
        MachineEvaluator { registers, arch }
    }

    pub fn pc(&self) -> Result<u64, EvalError> {
        self.register(self.arch.pc_register())
    }

    fn register(&self, number: u16) -> Result<u64, EvalError> {
        if self.registers.is_empty() {
            return Err(EvalError::NoMachineState);
        }
        self.registers
            .get(&number)
            .copied()
            .ok_or(EvalError::MissingRegister(number))
    }
}

impl Evaluator for MachineEvaluator<'_> {
    fn evaluate(&self, expr: &str) -> Result<u64, EvalError> {
        if let Ok(v) = parse_int::parse::<u64>(expr) {
            return Ok(v);
        }
        if expr == "$pc" {
            return self.pc();
        }
        if let Some(rest) = expr.strip_prefix("$r") {
            if let Ok(n) = rest.parse::<u16>() {
                return self.register(n);
            }
        }
        Err(EvalError::NotAnAddress(expr.to_string()))
    }
}

/// An interpreted query: either a concrete code address or a name
/// pattern.
#[derive(Debug)]
pub enum Query {
    Pc(u64),
    Pattern(Regex),
}

impl Query {
    /// Interprets user input, preferring the address reading. Input that
    /// fails both readings reports the pattern error, since anything is a
    /// valid address candidate but not every string is a valid regex.
    pub fn interpret(input: &str, evaluator: &dyn Evaluator) -> Result<Self, QueryError> {
        if let Ok(addr) = evaluator.evaluate(input) {
            return Ok(Query::Pc(addr));
        }
        match Regex::new(input) {
            Ok(regex) => Ok(Query::Pattern(regex)),
            Err(source) => Err(QueryError { expr: input.to_string(), source }),
        }
    }

    /// Matching symbols across `segments`, lazily, in segment load order.
    /// An address matches in the first segment that covers it; a pattern
    /// matches every symbol whose name contains it, duplicates included.
    pub fn resolve<'a>(&'a self, segments: &'a [Segment]) -> Matches<'a> {
        match self {
            Query::Pc(addr) => {
                let hit = segments.iter().find_map(|s| s.symtab.lookup_by_addr(*addr));
                Matches::One(hit.into_iter())
            }
            Query::Pattern(regex) => Matches::Scan {
                regex,
                segments: segments.iter(),
                current: Default::default(),
            },
        }
    }
}

/// Iterator over the symbols a [`Query`] selects.
pub enum Matches<'a> {
    One(std::option::IntoIter<&'a MethodSymbol>),
    Scan {
        regex: &'a Regex,
        segments: slice::Iter<'a, Segment>,
        current: slice::Iter<'a, MethodSymbol>,
    },
}

impl<'a> Iterator for Matches<'a> {
    type Item = &'a MethodSymbol;

    fn next(&mut self) -> Option<Self::Item> {
        match self {
            Matches::One(inner) => inner.next(),
            Matches::Scan { regex, segments, current } => loop {
                for symbol in current.by_ref() {
                    if regex.is_match(&symbol.name) {
                        return Some(symbol);
                    }
                }
                *current = segments.next()?.symtab.symbols().iter();
            },
        }
    }
}
