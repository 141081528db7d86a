use std::collections::BTreeMap;
use std::path::Path;

use thiserror::Error;

pub mod disasm;
pub mod dump;
pub mod heap;
pub mod mem;
pub mod query;
pub mod symtab;

#[cfg(test)]
pub(crate) mod fixtures;

use heap::Oop;
use mem::Memory;
use symtab::{SymbolTable, SymtabError};

pub const SEGMENT_MAGIC: &[u8; 8] = b"BEE:IS\0\0";
pub const SEGMENT_HEADER_SIZE: u64 = 48;

/// Maps an image segment file into `mem` and builds its symbol table.
/// The file carries its own base address; the whole file, header
/// included, lands there.
pub fn load_segment(
    name: impl Into<String>,
    bytes: Vec<u8>,
    mem: &mut Memory,
) -> Result<Segment, SegmentError> {
    let header = SegmentHeader::parse(&bytes)?;
    let actual = u64::try_from(bytes.len()).unwrap();
    if header.size != actual {
        return Err(SegmentError::SizeMismatch { declared: header.size, actual });
    }

    let base = header.base;
    mem.map(base, bytes);

    let first_oop = base + SEGMENT_HEADER_SIZE + heap::SMALL_HEADER_BYTES;
    let symtab = SymbolTable::build(mem, first_oop, base + header.size)?;

    Ok(Segment {
        name: name.into(),
        base,
        size: header.size,
        module: header.module,
        symtab,
    })
}

#[derive(Debug, Error)]
pub enum SegmentError {
    #[error("this file is not an image segment")]
    NotASegment,
    #[error("segment is format version {0}, which we don't understand")]
    UnsupportedVersion(u16),
    #[error("segment was generated for {0}-byte words")]
    UnsupportedWordSize(u16),
    #[error("segment header declares {declared} bytes but the file holds {actual}")]
    SizeMismatch { declared: u64, actual: u64 },
    #[error("could not build the segment's symbol table")]
    Symtab(#[from] SymtabError),
    #[error("could not parse register file as TOML")]
    RegToml(#[source] toml::de::Error),
    #[error("could not parse register name as integer")]
    RegTomlKey(#[source] std::num::ParseIntError),
    #[error("problem reading file")]
    Io(#[from] std::io::Error),
}

/// The fixed-size header at the front of every image segment file.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct SegmentHeader {
    pub base: u64,
    pub size: u64,
    pub reserved: u64,
    pub module: Oop,
}

impl SegmentHeader {
    pub fn parse(bytes: &[u8]) -> Result<Self, SegmentError> {
        if bytes.len() < SEGMENT_HEADER_SIZE as usize || &bytes[..8] != SEGMENT_MAGIC {
            return Err(SegmentError::NotASegment);
        }
        let word16 = |at: usize| u16::from_le_bytes(bytes[at..at + 2].try_into().unwrap());
        let word64 = |at: usize| u64::from_le_bytes(bytes[at..at + 8].try_into().unwrap());

        let version = word16(8);
        if version != 1 {
            return Err(SegmentError::UnsupportedVersion(version));
        }
        let word_size = word16(10);
        if word_size != heap::WORD_BYTES as u16 {
            return Err(SegmentError::UnsupportedWordSize(word_size));
        }

        Ok(SegmentHeader {
            base: word64(16),
            size: word64(24),
            reserved: word64(32),
            module: Oop(word64(40)),
        })
    }
}

/// A loaded image segment and the symbols harvested from it.
#[derive(Debug)]
pub struct Segment {
    pub name: String,
    pub base: u64,
    pub size: u64,
    pub module: Oop,
    pub symtab: SymbolTable,
}

pub fn parse_registers(contents: &str) -> Result<BTreeMap<u16, u64>, SegmentError> {
    let r: BTreeMap<String, u64> =
        toml::de::from_str(contents).map_err(SegmentError::RegToml)?;
    r.into_iter()
        .map(|(r, v)| {
            let r = r.parse::<u16>().map_err(SegmentError::RegTomlKey)?;
            Ok((r, v))
        })
        .collect()
}

pub fn load_registers(path: impl AsRef<Path>) -> Result<BTreeMap<u16, u64>, SegmentError> {
    let contents = std::fs::read_to_string(path)?;
    parse_registers(&contents)
}
