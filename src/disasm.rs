//! Disassembly of method code ranges.

use std::fmt;
use std::str::FromStr;

use capstone::prelude::*;
use thiserror::Error;

use crate::mem::{Memory, MemoryError};
use crate::query::Query;
use crate::Segment;

#[derive(Debug, Error)]
pub enum DisasmError {
    #[error("disassembler backend: {0}")]
    Backend(String),
    #[error("reading code bytes failed")]
    Memory(#[from] MemoryError),
}

/// Instruction set of the image being inspected.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Arch {
    X86_64,
    Aarch64,
}

impl Arch {
    /// DWARF number of the program counter register, matching the
    /// numbering used in captured register files.
    pub fn pc_register(self) -> u16 {
        match self {
            Arch::X86_64 => 16,
            Arch::Aarch64 => 32,
        }
    }
}

impl FromStr for Arch {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "x86-64" | "x86_64" | "amd64" => Ok(Arch::X86_64),
            "aarch64" | "arm64" => Ok(Arch::Aarch64),
            other => Err(format!("unknown architecture '{other}'")),
        }
    }
}

impl fmt::Display for Arch {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        match self {
            Arch::X86_64 => f.write_str("x86-64"),
            Arch::Aarch64 => f.write_str("aarch64"),
        }
    }
}

/// One decoded instruction, already rendered as text.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Insn {
    pub address: u64,
    pub text: String,
}

/// Decodes the inclusive address range `[lo, hi]` into instructions.
/// Commands take this as a seam so tests can substitute a recording
/// decoder.
pub trait Decoder {
    fn decode(&self, lo: u64, hi: u64) -> Result<Vec<Insn>, DisasmError>;
}

/// [`Decoder`] backed by capstone, reading code bytes out of the loaded
/// segments.
pub struct CapstoneDecoder<'m> {
    mem: &'m Memory,
    arch: Arch,
}

impl<'m> CapstoneDecoder<'m> {
    pub fn new(mem: &'m Memory, arch: Arch) -> Self {
        CapstoneDecoder { mem, arch }
    }

    fn capstone(&self) -> Result<Capstone, DisasmError> {
        let cs = match self.arch {
            Arch::X86_64 => Capstone::new()
                .x86()
                .mode(arch::x86::ArchMode::Mode64)
                .syntax(arch::x86::ArchSyntax::Att)
                .detail(false)
                .build(),
            Arch::Aarch64 => Capstone::new()
                .arm64()
                .mode(arch::arm64::ArchMode::Arm)
                .detail(false)
                .build(),
        };
        cs.map_err(|e| DisasmError::Backend(e.to_string()))
    }
}

impl Decoder for CapstoneDecoder<'_> {
    fn decode(&self, lo: u64, hi: u64) -> Result<Vec<Insn>, DisasmError> {
        let code = self.mem.read_bytes(lo, (hi - lo + 1) as usize)?;
        let cs = self.capstone()?;
        let insns = cs
            .disasm_all(&code, lo)
            .map_err(|e| DisasmError::Backend(e.to_string()))?;
        Ok(insns
            .as_ref()
            .iter()
            .map(|insn| {
                let mnemonic = insn.mnemonic().unwrap_or("");
                let ops = insn.op_str().unwrap_or("");
                let text = if ops.is_empty() {
                    mnemonic.to_string()
                } else {
                    format!("{mnemonic} {ops}")
                };
                Insn { address: insn.address(), text }
            })
            .collect())
    }
}

/// Outcome of a disassembly request.
#[derive(Debug, PartialEq, Eq)]
pub enum Disassembly {
    /// The query selected no symbol.
    NoMatch,
    /// The query selected several symbols; their display lines are
    /// returned for the user to pick from. Nothing was decoded.
    Ambiguous(Vec<String>),
    /// A single symbol was selected and decoded.
    Listing { header: String, lines: Vec<String> },
}

/// Resolves `query` and disassembles the selected symbol's code range.
/// The decoder runs only when the query selects exactly one symbol.
pub fn dispatch(
    query: &Query,
    segments: &[Segment],
    decoder: &dyn Decoder,
) -> Result<Disassembly, DisasmError> {
    let mut matches = query.resolve(segments);
    let Some(first) = matches.next() else {
        return Ok(Disassembly::NoMatch);
    };
    let rest: Vec<_> = matches.collect();
    if !rest.is_empty() {
        let mut lines = vec![first.to_string()];
        lines.extend(rest.iter().map(|s| s.to_string()));
        return Ok(Disassembly::Ambiguous(lines));
    }

    let header = first.to_string();
    if first.size == 0 {
        return Ok(Disassembly::Listing { header, lines: Vec::new() });
    }
    let insns = decoder.decode(first.address, first.address + first.size - 1)?;
    let lines = insns
        .iter()
        .map(|i| format!("  0x{:016x}: {}", i.address, i.text))
        .collect();
    Ok(Disassembly::Listing { header, lines })
}
