//! Accessors for Bee heap objects held in a loaded image.
//!
//! Objects are referenced by OOPs. An OOP with the low bit set encodes a
//! SmallInteger directly; any other OOP is the address of an object body,
//! preceded in memory by its header.

use std::fmt;

use thiserror::Error;

use crate::mem::{Memory, MemoryError};

/// Flag bits in the small object header. Tightly coupled with what the
/// image generator writes.
pub mod flags {
    pub const IS_BYTES: u8 = 0x01;
    pub const IS_VARIABLE: u8 = 0x02;
    pub const IS_NAMED: u8 = 0x04;
    pub const IS_REMEMBERED: u8 = 0x08;
    pub const IS_WEAK: u8 = 0x10;
    pub const HAS_BEEN_SEEN: u8 = 0x20;
    pub const IS_SECOND_GEN: u8 = 0x40;
    pub const IS_SMALL: u8 = 0x80;
}

/// 1-based slot indices of well-known instance variables.
mod indices {
    pub const BEHAVIOR_CLASS: u64 = 1;
    pub const SPECIES_SUPERCLASS: u64 = 1;
    pub const SPECIES_INSTANCE_VARIABLES: u64 = 5;
    pub const CLASS_NAME: u64 = 6;
    pub const METACLASS_CLASS: u64 = 6;
}

pub const WORD_BYTES: u64 = 8;
pub const SMALL_HEADER_BYTES: u64 = 8;
pub const LARGE_HEADER_BYTES: u64 = 16;

#[derive(Debug, Error)]
pub enum HeapError {
    #[error("memory access failed")]
    Memory(#[from] MemoryError),
    #[error("{0:#x} does not reference a heap object")]
    NotAnObject(u64),
    #[error("slot index {index} out of range 1..={size} for object {oop:#x}")]
    SlotRange { oop: u64, index: u64, size: u64 },
    #[error("byte access on pointer object {0:#x}")]
    NotBytes(u64),
    #[error("slot access on byte object {0:#x}")]
    NotSlots(u64),
    #[error("object {oop:#x} has no slot named '{slot}'")]
    MissingSlot { oop: u64, slot: &'static str },
    #[error("slot '{slot}' of object {oop:#x} is not a SmallInteger")]
    NotASmallInteger { oop: u64, slot: &'static str },
}

/// An object reference, possibly a tagged SmallInteger.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct Oop(pub u64);

impl Oop {
    pub fn small(value: i64) -> Self {
        Oop(((value as u64) << 1) | 1)
    }

    pub fn is_small_integer(self) -> bool {
        self.0 & 1 == 1
    }

    pub fn is_null(self) -> bool {
        self.0 == 0
    }

    /// The signed value of a SmallInteger OOP, or `None` for object
    /// references.
    pub fn small_integer_value(self) -> Option<i64> {
        if self.is_small_integer() {
            Some((self.0 as i64) >> 1)
        } else {
            None
        }
    }
}

pub fn align_up(value: u64, alignment: u64) -> u64 {
    (value + (alignment - 1)) & !(alignment - 1)
}

/// The 8-byte header immediately preceding every object body. Objects
/// larger than 255 units carry an additional large header before it with
/// the real size.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct SmallHeader {
    pub hash: u16,
    pub size: u8,
    pub flags: u8,
    pub behavior: u32,
}

impl SmallHeader {
    fn read(mem: &Memory, at: u64) -> Result<Self, MemoryError> {
        Ok(SmallHeader {
            hash: mem.read_u16(at)?,
            size: mem.read_u8(at + 2)?,
            flags: mem.read_u8(at + 3)?,
            behavior: mem.read_u32(at + 4)?,
        })
    }
}

impl fmt::Display for SmallHeader {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        write!(
            f,
            "{{ hash: 0x{:04x}, size: {}, flags: 0x{:02x}, behavior: 0x{:08x} }}",
            self.hash, self.size, self.flags, self.behavior
        )
    }
}

/// One named or indexed field of an object, as enumerated by [`HeapObject::fields`].
pub enum Field {
    Header(SmallHeader),
    Ref(Oop),
}

/// A heap object examined through a borrowed [`Memory`]. Never owns the
/// underlying storage; valid only for the duration of one command.
#[derive(Clone, Copy)]
pub struct HeapObject<'m> {
    mem: &'m Memory,
    oop: u64,
}

impl<'m> HeapObject<'m> {
    pub fn at(mem: &'m Memory, oop: Oop) -> Result<Self, HeapError> {
        // OOPs below the header size would wrap when locating the header.
        if oop.is_null() || oop.is_small_integer() || oop.0 < SMALL_HEADER_BYTES {
            return Err(HeapError::NotAnObject(oop.0));
        }
        Ok(HeapObject { mem, oop: oop.0 })
    }

    pub fn oop(&self) -> u64 {
        self.oop
    }

    /// Follows a reference held by this object into the same memory.
    pub fn resolve(&self, oop: Oop) -> Result<HeapObject<'m>, HeapError> {
        HeapObject::at(self.mem, oop)
    }

    pub fn small_header(&self) -> Result<SmallHeader, HeapError> {
        Ok(SmallHeader::read(self.mem, self.oop - SMALL_HEADER_BYTES)?)
    }

    pub fn flags(&self) -> Result<u8, HeapError> {
        Ok(self.small_header()?.flags)
    }

    pub fn is_bytes(&self) -> Result<bool, HeapError> {
        Ok(self.flags()? & flags::IS_BYTES != 0)
    }

    pub fn is_arrayed(&self) -> Result<bool, HeapError> {
        Ok(self.flags()? & flags::IS_VARIABLE != 0)
    }

    /// Size in units: bytes for byte objects, slots for pointer objects.
    /// Headers and padding are not counted.
    pub fn size(&self) -> Result<u64, HeapError> {
        let header = self.small_header()?;
        if header.flags & flags::IS_SMALL != 0 {
            Ok(header.size as u64)
        } else {
            Ok(self.mem.read_u32(self.oop - LARGE_HEADER_BYTES)? as u64)
        }
    }

    pub fn size_in_bytes(&self) -> Result<u64, HeapError> {
        if self.is_bytes()? {
            self.size()
        } else {
            Ok(self.size()? * WORD_BYTES)
        }
    }

    pub fn size_in_bytes_aligned(&self) -> Result<u64, HeapError> {
        Ok(align_up(self.size_in_bytes()?, WORD_BYTES))
    }

    /// Behaviors are stored as 32-bit offsets within the 4 GB window the
    /// object itself lives in.
    pub fn behavior_address(&self) -> Result<u64, HeapError> {
        let header = self.small_header()?;
        let base = (self.oop >> 32) << 32;
        Ok(base + header.behavior as u64)
    }

    pub fn behavior(&self) -> Result<HeapObject<'m>, HeapError> {
        HeapObject::at(self.mem, Oop(self.behavior_address()?))
    }

    pub fn class_oop(&self) -> Result<Oop, HeapError> {
        self.behavior()?.slot_at(indices::BEHAVIOR_CLASS)
    }

    pub fn class(&self) -> Result<HeapObject<'m>, HeapError> {
        HeapObject::at(self.mem, self.class_oop()?)
    }

    /// The object's class name. Metaclasses have exactly the six Species
    /// slots and name themselves after their single class.
    pub fn class_name(&self) -> Result<String, HeapError> {
        self.class()?.species_name()
    }

    /// The name of a class or metaclass object itself.
    pub fn species_name(&self) -> Result<String, HeapError> {
        if self.size()? == 6 {
            let single = HeapObject::at(self.mem, self.slot_at(indices::METACLASS_CLASS)?)?;
            let name = HeapObject::at(self.mem, single.slot_at(indices::CLASS_NAME)?)?.chars()?;
            Ok(format!("{name} class"))
        } else {
            HeapObject::at(self.mem, self.slot_at(indices::CLASS_NAME)?)?.chars()
        }
    }

    pub fn is_nil(&self) -> bool {
        self.class_name().map(|n| n == "UndefinedObject").unwrap_or(false)
    }

    /// Slot indexing starts at 1, as in Smalltalk.
    pub fn slot_at(&self, index: u64) -> Result<Oop, HeapError> {
        if self.is_bytes()? {
            return Err(HeapError::NotSlots(self.oop));
        }
        let size = self.size()?;
        if index == 0 || index > size {
            return Err(HeapError::SlotRange { oop: self.oop, index, size });
        }
        Ok(Oop(self.mem.read_u64(self.oop + (index - 1) * WORD_BYTES)?))
    }

    pub fn slot_named(&self, name: &str) -> Result<Option<Oop>, HeapError> {
        let names = self.slot_names()?;
        match names.iter().position(|n| n == name) {
            Some(i) => Ok(Some(self.slot_at(i as u64 + 1)?)),
            None => Ok(None),
        }
    }

    /// Instance variable names for this object, collected along the class
    /// chain, outermost superclass first.
    pub fn slot_names(&self) -> Result<Vec<String>, HeapError> {
        let mut reversed: Vec<String> = Vec::new();
        let mut current = self.class()?;
        while current.size()? >= 6 {
            if let Ok(ivars) =
                HeapObject::at(self.mem, current.slot_at(indices::SPECIES_INSTANCE_VARIABLES)?)
            {
                let count = ivars.size().unwrap_or(0);
                for index in (1..=count).rev() {
                    let name = ivars
                        .slot_at(index)
                        .ok()
                        .and_then(|oop| HeapObject::at(self.mem, oop).ok())
                        .and_then(|o| {
                            if o.is_bytes().unwrap_or(false) {
                                o.chars().ok()
                            } else {
                                None
                            }
                        })
                        .unwrap_or_else(|| format!("slot{index}"));
                    reversed.push(name);
                }
            }
            current = HeapObject::at(self.mem, current.slot_at(indices::SPECIES_SUPERCLASS)?)?;
        }
        reversed.reverse();
        Ok(reversed)
    }

    /// The byte contents of a byte object as a string, with trailing NUL
    /// padding stripped.
    pub fn chars(&self) -> Result<String, HeapError> {
        if !self.is_bytes()? {
            return Err(HeapError::NotBytes(self.oop));
        }
        let size = self.size()? as usize;
        let bytes = self.mem.read_bytes(self.oop, size)?;
        let mut text = String::from_utf8_lossy(&bytes).into_owned();
        while text.ends_with('\0') {
            text.pop();
        }
        Ok(text)
    }

    /// Enumerates the object's fields in declaration order: the raw header,
    /// the behavior reference, then one entry per slot. Named slots use the
    /// instance variable name; indexed slots are numbered from 1.
    pub fn fields(&self) -> Result<Vec<(String, Field)>, HeapError> {
        let header = self.small_header()?;
        let mut out = vec![
            ("small_header".to_string(), Field::Header(header)),
            ("behavior".to_string(), Field::Ref(Oop(self.behavior_address()?))),
        ];
        if self.is_bytes()? {
            return Ok(out);
        }
        let arrayed = self.is_arrayed()?;
        let names = if arrayed {
            Vec::new()
        } else {
            self.slot_names().unwrap_or_default()
        };
        let size = self.size()?;
        for index in 1..=size {
            let name = names.get(index as usize - 1).cloned().unwrap_or_else(|| {
                if arrayed {
                    index.to_string()
                } else {
                    format!("slot{index}")
                }
            });
            out.push((name, Field::Ref(self.slot_at(index)?)));
        }
        Ok(out)
    }
}

/// Walks the objects of one segment in address order. Starts at the first
/// object body and steps over each aligned body plus the following header,
/// which is large exactly when the peeked behavior field is zero.
pub struct ObjectWalker<'m> {
    mem: &'m Memory,
    cursor: u64,
    stop: u64,
    done: bool,
}

impl<'m> ObjectWalker<'m> {
    /// `stop` is one past the segment's last written byte. A trailing
    /// zero-slot object has its body starting exactly there, with its
    /// header filling the segment's final word.
    pub fn new(mem: &'m Memory, first_oop: u64, stop: u64) -> Self {
        ObjectWalker { mem, cursor: first_oop, stop, done: first_oop > stop }
    }
}

impl<'m> Iterator for ObjectWalker<'m> {
    type Item = Result<HeapObject<'m>, HeapError>;

    fn next(&mut self) -> Option<Self::Item> {
        if self.done {
            return None;
        }
        let object = match HeapObject::at(self.mem, Oop(self.cursor)) {
            Ok(o) => o,
            Err(e) => {
                self.done = true;
                return Some(Err(e));
            }
        };
        let body = match object.size_in_bytes_aligned() {
            Ok(b) => b,
            Err(e) => {
                self.done = true;
                return Some(Err(e.into()));
            }
        };
        let next_header = self.cursor + body;
        // Another object follows only if its header still starts inside
        // the segment.
        if next_header >= self.stop {
            self.done = true;
            return Some(Ok(object));
        }
        match self.mem.read_u32(next_header + 4) {
            Ok(0) => self.cursor = next_header + LARGE_HEADER_BYTES,
            Ok(_) => self.cursor = next_header + SMALL_HEADER_BYTES,
            Err(e) => {
                self.done = true;
                return Some(Err(HeapError::Memory(e)));
            }
        }
        Some(Ok(object))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::fixtures::{build_class, HeapWriter};

    #[test]
    fn small_integer_tagging() {
        assert!(Oop(0x1001).is_small_integer());
        assert!(!Oop(0x1000).is_small_integer());
        assert_eq!(Oop::small(3), Oop(7));
        assert_eq!(Oop(7).small_integer_value(), Some(3));
        assert_eq!(Oop::small(-2).small_integer_value(), Some(-2));
        assert_eq!(Oop(0x1000).small_integer_value(), None);
    }

    #[test]
    fn header_and_size_decoding() {
        let mut w = HeapWriter::new(0x2000_0000);
        let nil = w.slot_object(0, 0, &[]);
        let obj = w.slot_object(0, flags::IS_NAMED, &[Oop::small(1).0, Oop::small(2).0]);
        let blob = w.byte_object(0, 0, b"hello");
        let mem = w.into_memory();

        let obj = HeapObject::at(&mem, Oop(obj)).unwrap();
        assert_eq!(obj.size().unwrap(), 2);
        assert_eq!(obj.size_in_bytes().unwrap(), 16);
        assert!(!obj.is_bytes().unwrap());
        assert_eq!(obj.slot_at(1).unwrap(), Oop::small(1));
        assert_eq!(obj.slot_at(2).unwrap(), Oop::small(2));
        assert!(matches!(
            obj.slot_at(3),
            Err(HeapError::SlotRange { index: 3, size: 2, .. })
        ));

        let blob = HeapObject::at(&mem, Oop(blob)).unwrap();
        assert!(blob.is_bytes().unwrap());
        assert_eq!(blob.size().unwrap(), 5);
        assert_eq!(blob.size_in_bytes_aligned().unwrap(), 8);
        assert_eq!(blob.chars().unwrap(), "hello");
        assert!(matches!(blob.slot_at(1), Err(HeapError::NotSlots(_))));

        let nil = HeapObject::at(&mem, Oop(nil)).unwrap();
        assert_eq!(nil.size().unwrap(), 0);
    }

    #[test]
    fn tagged_and_null_oops_are_not_objects() {
        let mem = Memory::default();
        assert!(matches!(
            HeapObject::at(&mem, Oop(0)),
            Err(HeapError::NotAnObject(0))
        ));
        assert!(matches!(
            HeapObject::at(&mem, Oop::small(5)),
            Err(HeapError::NotAnObject(_))
        ));
        // Untagged but too low to carry a header above address zero.
        assert!(matches!(
            HeapObject::at(&mem, Oop(2)),
            Err(HeapError::NotAnObject(2))
        ));
    }

    #[test]
    fn class_names_and_slot_names() {
        let mut w = HeapWriter::new(0x2000_0000);
        let nil = w.slot_object(0, 0, &[]);
        let undefined = build_class(&mut w, "UndefinedObject", &[], nil);
        w.patch_behavior(nil, undefined.behavior);
        let point = build_class(&mut w, "Point", &["x", "y"], nil);
        let p = w.slot_object(point.behavior, flags::IS_NAMED, &[Oop::small(3).0, nil]);
        let mem = w.into_memory();

        let p = HeapObject::at(&mem, Oop(p)).unwrap();
        assert_eq!(p.class_name().unwrap(), "Point");
        assert_eq!(p.slot_names().unwrap(), vec!["x", "y"]);
        assert_eq!(p.slot_named("y").unwrap(), Some(Oop(nil)));
        assert_eq!(p.slot_named("z").unwrap(), None);

        let nil = HeapObject::at(&mem, Oop(nil)).unwrap();
        assert!(nil.is_nil());
        assert_eq!(nil.class_name().unwrap(), "UndefinedObject");

        // A class object names itself through its metaclass.
        let class = HeapObject::at(&mem, Oop(point.class)).unwrap();
        assert_eq!(class.class_name().unwrap(), "Point class");
    }

    #[test]
    fn slot_names_accumulate_over_superclasses() {
        let mut w = HeapWriter::new(0x2000_0000);
        let nil = w.slot_object(0, 0, &[]);
        let undefined = build_class(&mut w, "UndefinedObject", &[], nil);
        w.patch_behavior(nil, undefined.behavior);
        let magnitude = build_class(&mut w, "Magnitude", &["units"], nil);
        let point = build_class(&mut w, "Point", &["x", "y"], magnitude.class);
        let p = w.slot_object(
            point.behavior,
            flags::IS_NAMED,
            &[Oop::small(1).0, Oop::small(2).0, Oop::small(3).0],
        );
        let mem = w.into_memory();

        let p = HeapObject::at(&mem, Oop(p)).unwrap();
        assert_eq!(p.slot_names().unwrap(), vec!["units", "x", "y"]);
        assert_eq!(p.slot_named("units").unwrap(), Some(Oop::small(1)));
        assert_eq!(p.slot_named("y").unwrap(), Some(Oop::small(3)));
    }

    #[test]
    fn fields_enumeration() {
        let mut w = HeapWriter::new(0x2000_0000);
        let nil = w.slot_object(0, 0, &[]);
        let undefined = build_class(&mut w, "UndefinedObject", &[], nil);
        w.patch_behavior(nil, undefined.behavior);
        let point = build_class(&mut w, "Point", &["x", "y"], nil);
        let p = w.slot_object(point.behavior, flags::IS_NAMED, &[Oop::small(3).0, nil]);
        let array = w.slot_object(point.behavior, flags::IS_VARIABLE, &[nil, nil, nil]);
        let mem = w.into_memory();

        let p = HeapObject::at(&mem, Oop(p)).unwrap();
        let fields = p.fields().unwrap();
        let names: Vec<&str> = fields.iter().map(|(n, _)| n.as_str()).collect();
        assert_eq!(names, vec!["small_header", "behavior", "x", "y"]);

        let array = HeapObject::at(&mem, Oop(array)).unwrap();
        let fields = array.fields().unwrap();
        let names: Vec<&str> = fields.iter().map(|(n, _)| n.as_str()).collect();
        assert_eq!(names, vec!["small_header", "behavior", "1", "2", "3"]);
    }

    #[test]
    fn walker_visits_objects_in_order() {
        let mut w = HeapWriter::new(0x2000_0000);
        let first = w.slot_object(0, 0, &[1, 3]);
        let second = w.byte_object(0, 0, b"some text here");
        let third = w.large_byte_object(0, 0, &[0xcc; 300]);
        let fourth = w.slot_object(0, 0, &[]);
        let (lo, hi) = (w.first_oop(), w.end());
        // The final object is empty, so its body starts exactly at the
        // end of the written range. It must still be visited.
        assert_eq!(fourth, hi);
        let mem = w.into_memory();

        let oops: Vec<u64> = ObjectWalker::new(&mem, lo, hi)
            .map(|o| o.unwrap().oop())
            .collect();
        assert_eq!(oops, vec![first, second, third, fourth]);
    }

    #[test]
    fn walker_of_empty_range_yields_nothing() {
        // A segment with no objects has its first body slot past the end
        // of the written range.
        let mem = Memory::default();
        assert_eq!(ObjectWalker::new(&mem, 0x1008, 0x1000).count(), 0);
    }
}
