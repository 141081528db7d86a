//! Test support: writes synthetic heaps with real header and slot layouts.

use crate::heap::{flags, Oop};
use crate::mem::Memory;

/// Lays objects out back to back from `origin`, the way the image
/// generator does, and hands the result over as a [`Memory`] or raw bytes.
pub struct HeapWriter {
    origin: u64,
    bytes: Vec<u8>,
}

impl HeapWriter {
    pub fn new(origin: u64) -> Self {
        HeapWriter { origin, bytes: Vec::new() }
    }

    fn addr(&self) -> u64 {
        self.origin + self.bytes.len() as u64
    }

    /// The address the first object body was (or will be) placed at.
    pub fn first_oop(&self) -> u64 {
        self.origin + 8
    }

    /// One past the last written byte.
    pub fn end(&self) -> u64 {
        self.addr()
    }

    fn behavior_field(&self, oop: u64, behavior: u64) -> u32 {
        if behavior == 0 {
            // A zero behavior field would make the walker read the next
            // header as a large one. Point at a tagged dummy instead.
            1
        } else {
            (behavior - ((oop >> 32) << 32)) as u32
        }
    }

    fn small_header(&mut self, oop: u64, size: u8, flag_bits: u8, behavior: u64) {
        let field = self.behavior_field(oop, behavior);
        self.bytes.extend_from_slice(&0x2222u16.to_le_bytes());
        self.bytes.push(size);
        self.bytes.push(flag_bits | flags::IS_SMALL);
        self.bytes.extend_from_slice(&field.to_le_bytes());
    }

    /// Emits a pointer object and returns its OOP.
    pub fn slot_object(&mut self, behavior: u64, extra_flags: u8, slots: &[u64]) -> u64 {
        let oop = self.addr() + 8;
        self.small_header(oop, slots.len() as u8, extra_flags, behavior);
        for slot in slots {
            self.bytes.extend_from_slice(&slot.to_le_bytes());
        }
        oop
    }

    /// Emits a byte object (padded to word size) and returns its OOP.
    pub fn byte_object(&mut self, behavior: u64, extra_flags: u8, data: &[u8]) -> u64 {
        assert!(data.len() <= u8::MAX as usize);
        let oop = self.addr() + 8;
        self.small_header(oop, data.len() as u8, extra_flags | flags::IS_BYTES, behavior);
        self.bytes.extend_from_slice(data);
        while self.bytes.len() % 8 != 0 {
            self.bytes.push(0);
        }
        oop
    }

    /// Emits a byte object too big for a small header.
    pub fn large_byte_object(&mut self, behavior: u64, extra_flags: u8, data: &[u8]) -> u64 {
        let oop = self.addr() + 16;
        self.bytes.extend_from_slice(&(data.len() as u32).to_le_bytes());
        self.bytes.extend_from_slice(&0u32.to_le_bytes());
        let field = self.behavior_field(oop, behavior);
        self.bytes.extend_from_slice(&0x2222u16.to_le_bytes());
        self.bytes.push(0);
        self.bytes.push(extra_flags | flags::IS_BYTES);
        self.bytes.extend_from_slice(&field.to_le_bytes());
        self.bytes.extend_from_slice(data);
        while self.bytes.len() % 8 != 0 {
            self.bytes.push(0);
        }
        oop
    }

    pub fn patch_slot(&mut self, oop: u64, index: u64, value: u64) {
        let offset = (oop - self.origin + (index - 1) * 8) as usize;
        self.bytes[offset..offset + 8].copy_from_slice(&value.to_le_bytes());
    }

    pub fn patch_behavior(&mut self, oop: u64, behavior: u64) {
        let field = self.behavior_field(oop, behavior);
        let offset = (oop - self.origin - 4) as usize;
        self.bytes[offset..offset + 4].copy_from_slice(&field.to_le_bytes());
    }

    pub fn into_memory(self) -> Memory {
        let mut mem = Memory::default();
        mem.map(self.origin, self.bytes);
        mem
    }

    pub fn into_bytes(self) -> Vec<u8> {
        self.bytes
    }
}

pub struct ClassFixture {
    /// The class object itself.
    pub class: u64,
    /// Behavior to store in headers of the class's instances.
    pub behavior: u64,
    pub metaclass: u64,
}

/// Builds a minimal but well-formed class: name, instance variable array,
/// the class object with its Species slots, its metaclass, and behavior
/// objects for both.
pub fn build_class(
    w: &mut HeapWriter,
    name: &str,
    ivars: &[&str],
    superclass: u64,
) -> ClassFixture {
    let name_oop = w.byte_object(0, 0, name.as_bytes());
    let ivar_oops: Vec<u64> = ivars.iter().map(|n| w.byte_object(0, 0, n.as_bytes())).collect();
    let ivars_oop = w.slot_object(0, flags::IS_VARIABLE, &ivar_oops);
    // Species layout: superclass, instanceBehavior, format, organization,
    // instanceVariables, name, subclasses.
    let class = w.slot_object(0, 0, &[superclass, 0, 0, 0, ivars_oop, name_oop, 0]);
    let metaclass = w.slot_object(0, 0, &[0, 0, 0, 0, 0, class]);
    let behavior = w.slot_object(0, 0, &[class]);
    let meta_behavior = w.slot_object(0, 0, &[metaclass]);
    w.patch_behavior(class, meta_behavior);
    w.patch_slot(class, 2, behavior);
    ClassFixture { class, behavior, metaclass }
}

/// Encodes a CompiledMethod format SmallInteger from argument and temp
/// counts.
pub fn method_format(num_args: u32, num_temps: u32) -> u64 {
    let value = (num_args as i64) | ((num_temps as i64) << 13);
    Oop::small(value).0
}
