use rangemap::RangeInclusiveMap;
use thiserror::Error;

#[derive(Debug, Error)]
pub enum MemoryError {
    #[error("no segment maps address {0:#x}")]
    Unmapped(u64),
    #[error("read of {len} bytes at {addr:#x} crosses unmapped memory")]
    Truncated { addr: u64, len: usize },
}

/// A read-only view of the stopped VM's address space, assembled from the
/// loaded image segments (plus anything mapped later with `load`).
#[derive(Default)]
pub struct Memory {
    regions: RangeInclusiveMap<u64, Region>,
}

#[derive(Debug, Clone, Eq, PartialEq)]
struct Region {
    base: u64,
    bytes: Vec<u8>,
}

impl Memory {
    /// Maps `bytes` at `base`. A later mapping shadows earlier ones where
    /// they overlap.
    pub fn map(&mut self, base: u64, bytes: Vec<u8>) {
        let Some(size_m1) = (bytes.len() as u64).checked_sub(1) else {
            return;
        };
        self.regions.insert(base..=base + size_m1, Region { base, bytes });
    }

    pub fn is_mapped(&self, addr: u64) -> bool {
        self.regions.get(&addr).is_some()
    }

    pub fn read(&self, addr: u64, dest: &mut [u8]) -> Result<(), MemoryError> {
        let Some(len_m1) = (dest.len() as u64).checked_sub(1) else {
            return Ok(());
        };
        let wanted = addr..=addr + len_m1;
        if let Some(gap) = self.regions.gaps(&wanted).next() {
            return Err(if *gap.start() == addr {
                MemoryError::Unmapped(addr)
            } else {
                MemoryError::Truncated { addr, len: dest.len() }
            });
        }

        let mut cursor = addr;
        let mut dest = dest;
        // No gaps now. A region entry may be a split remnant of a larger
        // mapping, so offsets are computed against the region's own base,
        // not the entry range.
        for (overlap, region) in self.regions.overlapping(&wanted) {
            let offset = (cursor - region.base) as usize;
            let avail = (overlap.end() - cursor + 1) as usize;
            let chunk = usize::min(avail, dest.len());
            let (next, rest) = dest.split_at_mut(chunk);
            next.copy_from_slice(&region.bytes[offset..offset + chunk]);
            cursor += chunk as u64;
            dest = rest;
        }
        Ok(())
    }

    pub fn read_bytes(&self, addr: u64, len: usize) -> Result<Vec<u8>, MemoryError> {
        let mut buf = vec![0; len];
        self.read(addr, &mut buf)?;
        Ok(buf)
    }

    pub fn read_u8(&self, addr: u64) -> Result<u8, MemoryError> {
        let mut buf = [0; 1];
        self.read(addr, &mut buf)?;
        Ok(buf[0])
    }

    pub fn read_u16(&self, addr: u64) -> Result<u16, MemoryError> {
        let mut buf = [0; 2];
        self.read(addr, &mut buf)?;
        Ok(u16::from_le_bytes(buf))
    }

    pub fn read_u32(&self, addr: u64) -> Result<u32, MemoryError> {
        let mut buf = [0; 4];
        self.read(addr, &mut buf)?;
        Ok(u32::from_le_bytes(buf))
    }

    pub fn read_u64(&self, addr: u64) -> Result<u64, MemoryError> {
        let mut buf = [0; 8];
        self.read(addr, &mut buf)?;
        Ok(u64::from_le_bytes(buf))
    }
}
