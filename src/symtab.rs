//! Method symbols harvested from image segments.
//!
//! The generated code of a segment is owned by its CompiledMethod and
//! CallbackMethod instances; each one becomes a symbol record covering
//! `[address, address + size)`.

use std::fmt;

use thiserror::Error;

use crate::heap::{HeapError, HeapObject, ObjectWalker, Oop};
use crate::mem::Memory;

#[derive(Debug, Error)]
pub enum SymtabError {
    #[error(transparent)]
    Heap(#[from] HeapError),
    #[error("symbols '{0}' and '{1}' have overlapping code ranges")]
    Overlap(String, String),
}

/// Field positions inside the CompiledMethod `format` SmallInteger. Must
/// be kept in sync with `CompiledMethod class >> initializeFormatFlags`.
mod format {
    pub const ARG_COUNT: (u32, u32) = (1, 6);
    pub const TEMP_COUNT: (u32, u32) = (14, 21);

    /// Extracts an inclusive 1-based bit range.
    pub fn field(value: i64, (lo, hi): (u32, u32)) -> u32 {
        let width = hi - lo + 1;
        ((value >> (lo - 1)) & ((1 << width) - 1)) as u32
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct MethodSymbol {
    /// `Class >> #selector`, with `Class class` for metaclass methods.
    pub name: String,
    /// Start of the generated machine code.
    pub address: u64,
    /// Machine code length in bytes.
    pub size: u64,
    pub num_args: u32,
    pub num_temps: u32,
    /// OOP of the method object the code belongs to.
    pub method: u64,
}

impl MethodSymbol {
    pub fn new(name: impl Into<String>, address: u64, size: u64) -> Self {
        MethodSymbol {
            name: name.into(),
            address,
            size,
            num_args: 0,
            num_temps: 0,
            method: 0,
        }
    }

    /// Builds a symbol record from a CompiledMethod (or CallbackMethod)
    /// heap object.
    pub fn from_method(method: HeapObject<'_>) -> Result<Self, HeapError> {
        let method_oop = method.oop();
        let slot = |name: &'static str| -> Result<Oop, HeapError> {
            method
                .slot_named(name)?
                .ok_or(HeapError::MissingSlot { oop: method_oop, slot: name })
        };

        let native = method.resolve(slot("nativeCode")?)?;
        let code_oop = native
            .slot_named("machineCode")?
            .ok_or(HeapError::MissingSlot { oop: native.oop(), slot: "machineCode" })?;
        let code = method.resolve(code_oop)?;

        let class_name = method.resolve(slot("class")?)?.species_name()?;
        let selector = method.resolve(slot("selector")?)?.chars()?;

        let fmt_value = slot("format")?
            .small_integer_value()
            .ok_or(HeapError::NotASmallInteger { oop: method_oop, slot: "format" })?;

        Ok(MethodSymbol {
            name: format!("{class_name} >> #{selector}"),
            address: code.oop(),
            size: code.size()?,
            num_args: format::field(fmt_value, format::ARG_COUNT),
            num_temps: format::field(fmt_value, format::TEMP_COUNT),
            method: method_oop,
        })
    }

    pub fn contains(&self, addr: u64) -> bool {
        self.address <= addr && addr < self.address + self.size
    }
}

impl fmt::Display for MethodSymbol {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        write!(
            f,
            "M-sym: nA: {:<2} nT: {:<2} code: 0x{:016x} size: {:<4} method: 0x{:016x} {}",
            self.num_args, self.num_temps, self.address, self.size, self.method, self.name
        )
    }
}

/// All method symbols of one segment, sorted by code address.
#[derive(Debug, Default)]
pub struct SymbolTable {
    symbols: Vec<MethodSymbol>,
}

impl SymbolTable {
    /// Accepts pre-built symbols, sorting them and rejecting overlapping
    /// code ranges, which would break address lookup.
    pub fn from_symbols(mut symbols: Vec<MethodSymbol>) -> Result<Self, SymtabError> {
        symbols.sort_by_key(|s| s.address);
        for pair in symbols.windows(2) {
            if pair[0].address + pair[0].size > pair[1].address {
                return Err(SymtabError::Overlap(pair[0].name.clone(), pair[1].name.clone()));
            }
        }
        Ok(SymbolTable { symbols })
    }

    /// Scans the objects in `[first_oop, stop)` for method instances and
    /// builds their symbols. Loading symbols may take time.
    pub fn build(mem: &Memory, first_oop: u64, stop: u64) -> Result<Self, SymtabError> {
        let mut method_classes: Vec<u64> = Vec::new();
        for object in ObjectWalker::new(mem, first_oop, stop) {
            let object = object?;
            if let Ok(name) = object.class_name() {
                if name == "CompiledMethod class" || name == "CallbackMethod class" {
                    method_classes.push(object.oop());
                }
            }
        }

        let mut symbols = Vec::new();
        if !method_classes.is_empty() {
            for object in ObjectWalker::new(mem, first_oop, stop) {
                let object = object?;
                let Ok(class_oop) = object.class_oop() else {
                    continue;
                };
                if method_classes.contains(&class_oop.0) {
                    symbols.push(MethodSymbol::from_method(object)?);
                }
            }
        }
        Self::from_symbols(symbols)
    }

    pub fn len(&self) -> usize {
        self.symbols.len()
    }

    pub fn is_empty(&self) -> bool {
        self.symbols.is_empty()
    }

    pub fn symbols(&self) -> &[MethodSymbol] {
        &self.symbols
    }

    /// The symbol whose code range owns `addr`, if any. Relies on the
    /// sorted, non-overlapping invariant established at construction.
    pub fn lookup_by_addr(&self, addr: u64) -> Option<&MethodSymbol> {
        let index = self.symbols.partition_point(|s| s.address + s.size <= addr);
        self.symbols.get(index).filter(|s| s.contains(addr))
    }

    pub fn lookup_by_name(&self, name: &str) -> Option<&MethodSymbol> {
        self.symbols.iter().find(|s| s.name == name)
    }
}
