//! Object rendering and recursive-ish dumping.
//!
//! Every value is rendered through [`RendererRegistry::render`]: a
//! per-class renderer if one is registered, otherwise the stock
//! [`print_string`] form.

use std::collections::HashMap;

use crate::heap::{Field, HeapError, HeapObject, Oop};
use crate::mem::Memory;
use crate::query::Evaluator;

/// The stock one-line rendering of any OOP.
pub fn print_string(mem: &Memory, oop: Oop) -> String {
    if oop.is_null() {
        return "NULL".to_string();
    }
    if let Some(value) = oop.small_integer_value() {
        return format!("0x{:016x} ( SmallInteger, {} 0x{:016x})", oop.0, value, value);
    }
    let Ok(object) = HeapObject::at(mem, oop) else {
        return format!("0x{:016x}", oop.0);
    };
    if object.is_nil() {
        return format!("0x{:016x} ( nil )", oop.0);
    }

    let class_name = object.class_name().unwrap_or_else(|_| {
        if object.behavior_address().is_err() {
            "<invalid behavior>".to_string()
        } else if object.class_oop().is_err() {
            "<invalid class>".to_string()
        } else {
            "<invalid class name>".to_string()
        }
    });

    if let Some(stripped) = class_name.strip_suffix(" class") {
        return format!("0x{:016x} ( {} )", oop.0, stripped);
    }
    if class_name == "Metaclass" {
        if let Ok(name) = metaclass_name(object) {
            return format!("0x{:016x} ( {} class )", oop.0, name);
        }
    }
    if class_name == "Symbol" {
        if let Ok(chars) = object.chars() {
            return format!("0x{:016x} ( #{} )", oop.0, chars);
        }
    }

    let detail = match class_name.as_str() {
        "String" => object.chars().ok().map(|s| {
            if s.chars().count() > 10 {
                let head: String = s.chars().take(8).collect();
                format!("\"{head}...")
            } else {
                format!("\"{s}\"")
            }
        }),
        "CompiledMethod" | "CallbackMethod" => {
            crate::symtab::MethodSymbol::from_method(object).ok().map(|sym| {
                format!(
                    "{} nA {} nT {} code 0x{:016x} size {}",
                    sym.name, sym.num_args, sym.num_temps, sym.address, sym.size
                )
            })
        }
        _ => match (object.is_arrayed(), object.is_bytes()) {
            (Ok(true), Ok(true)) => object.size().ok().map(|n| format!("{n} bytes")),
            (Ok(true), Ok(false)) => object.size().ok().map(|n| format!("{n} slots")),
            _ => None,
        },
    };

    match detail {
        Some(detail) => format!("0x{:016x} ( a {}, {} )", oop.0, class_name, detail),
        None => format!("0x{:016x} ( a {} )", oop.0, class_name),
    }
}

fn metaclass_name(object: HeapObject<'_>) -> Result<String, HeapError> {
    let class = object.resolve(object.slot_at(6)?)?;
    object.resolve(class.slot_at(6)?)?.chars()
}

/// A custom rendering for instances of one class.
pub trait Renderer {
    fn format(&self, mem: &Memory, oop: Oop) -> String;
}

/// Per-class-name renderer lookup with [`print_string`] as the fallback.
#[derive(Default)]
pub struct RendererRegistry {
    by_class: HashMap<String, Box<dyn Renderer>>,
}

impl RendererRegistry {
    pub fn register(&mut self, class_name: impl Into<String>, renderer: Box<dyn Renderer>) {
        self.by_class.insert(class_name.into(), renderer);
    }

    /// The registered renderer for the class of `oop`, if any. Tagged and
    /// null references never have one.
    pub fn find(&self, mem: &Memory, oop: Oop) -> Option<&dyn Renderer> {
        if self.by_class.is_empty() || oop.is_null() || oop.is_small_integer() {
            return None;
        }
        let object = HeapObject::at(mem, oop).ok()?;
        let name = object.class_name().ok()?;
        self.by_class.get(&name).map(|r| r.as_ref())
    }

    pub fn render(&self, mem: &Memory, oop: Oop) -> String {
        match self.find(mem, oop) {
            Some(renderer) => renderer.format(mem, oop),
            None => print_string(mem, oop),
        }
    }
}

/// Dumps one expression: a print-string line for the object itself, then
/// one line per field for pointer objects. Evaluation failures produce a
/// single diagnostic line so that other expressions in a batch still get
/// dumped.
pub fn dump(
    mem: &Memory,
    evaluator: &dyn Evaluator,
    renderers: &RendererRegistry,
    expr: &str,
) -> Vec<String> {
    let Ok(addr) = evaluator.evaluate(expr) else {
        return vec![format!("Failed to evaluate '{expr}'")];
    };
    let oop = Oop(addr);
    let mut lines = vec![print_string(mem, oop)];
    if oop.is_null() || oop.is_small_integer() {
        return lines;
    }
    let Ok(object) = HeapObject::at(mem, oop) else {
        return lines;
    };
    match object.is_bytes() {
        Ok(true) => return lines,
        Ok(false) => {}
        Err(e) => {
            lines.push(format!("    <unable to read object contents: {e}>"));
            return lines;
        }
    }
    match object.fields() {
        Ok(fields) => {
            for (name, field) in fields {
                let text = match field {
                    Field::Header(header) => header.to_string(),
                    Field::Ref(child) => renderers.render(mem, child),
                };
                lines.push(format!("    {name:<15}:  {text}"));
            }
        }
        Err(e) => lines.push(format!("    <unable to read object contents: {e}>")),
    }
    lines
}
