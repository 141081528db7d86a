use std::collections::BTreeMap;
use std::path::{Path, PathBuf};

use anyhow::Result;
use clap::Parser;

use beedbg::disasm::{Arch, CapstoneDecoder, Disassembly};
use beedbg::dump::{dump, RendererRegistry};
use beedbg::mem::Memory;
use beedbg::query::{MachineEvaluator, Query};
use beedbg::Segment;

#[derive(Debug, Parser)]
struct Beedb {
    /// Image segment files, mapped in the order given.
    #[clap(required = true)]
    segments: Vec<PathBuf>,

    /// TOML file of captured register values, keyed by DWARF number.
    #[clap(short, long)]
    registers: Option<PathBuf>,

    /// Instruction set the image was generated for.
    #[clap(short, long, default_value = "x86-64")]
    arch: Arch,
}

fn main() -> Result<()> {
    let args = Beedb::parse();

    let mut memory = Memory::default();
    let mut segments = vec![];
    for path in &args.segments {
        let bytes = std::fs::read(path)?;
        let segment = beedbg::load_segment(display_name(path), bytes, &mut memory)?;
        println!(
            "Loaded {} at 0x{:016x}; {} method symbols found.",
            segment.name,
            segment.base,
            segment.symtab.len(),
        );
        segments.push(segment);
    }

    let registers = match &args.registers {
        Some(path) => beedbg::load_registers(path)?,
        None => BTreeMap::new(),
    };

    println!("To quit: ^D or exit");

    let mut rl = rustyline::Editor::<(), _>::new()?;
    let prompt = ansi_term::Colour::Green.paint(">> ").to_string();
    let mut ctx = Ctx {
        memory,
        segments,
        registers,
        arch: args.arch,
        renderers: RendererRegistry::default(),
    };
    'lineloop:
    loop {
        match rl.readline(&prompt) {
            Ok(line) => {
                let line = line.trim();
                let (cmd, rest) = line.split_once(char::is_whitespace)
                    .unwrap_or((line, ""));
                if line.is_empty() {
                    continue 'lineloop;
                }

                rl.add_history_entry(line)?;

                match cmd {
                    "exit" => break,
                    "help" => {
                        println!("commands:");
                        let name_len = COMMANDS.iter()
                            .map(|(name, _, _)| name.len())
                            .max()
                            .unwrap_or(12);
                        for (name, _, desc) in COMMANDS {
                            println!("{:name_len$} {}", name, desc);
                        }
                    }
                    _ => {
                        for (name, imp, _) in COMMANDS {
                            if *name == cmd {
                                imp(&mut ctx, rest);
                                continue 'lineloop;
                            }
                        }
                        println!("unknown command: {}", cmd);
                        println!("for help, try: help");
                    }
                }
            }
            Err(rustyline::error::ReadlineError::Interrupted) => {
                println!("^C");
                continue;
            }
            Err(e) => {
                println!("{:?}", e);
                break;
            }
        }
    }

    Ok(())
}

fn display_name(path: &Path) -> String {
    path.file_name()
        .map(|n| n.to_string_lossy().into_owned())
        .unwrap_or_else(|| path.display().to_string())
}

struct Ctx {
    memory: Memory,
    segments: Vec<Segment>,
    registers: BTreeMap<u16, u64>,
    arch: Arch,
    renderers: RendererRegistry,
}

impl Ctx {
    fn evaluator(&self) -> MachineEvaluator<'_> {
        MachineEvaluator::new(&self.registers, self.arch)
    }
}

type Command = fn(&mut Ctx, &str);

static COMMANDS: &[(&str, Command, &str)] = &[
    ("do", cmd_do, "dump the objects given by address expressions"),
    ("ls", cmd_ls, "look up method symbols by address or name pattern"),
    ("ds", cmd_ds, "disassemble the method given by address or name pattern"),
    ("segs", cmd_segs, "list loaded image segments"),
    ("load", cmd_load, "load an additional image segment file"),
    ("reg", cmd_reg, "register access"),
];

/// Builds the query shared by `ls` and `ds`. An empty argument means the
/// current program counter.
fn build_query(ctx: &Ctx, arg: &str) -> Option<Query> {
    if arg.is_empty() {
        return match ctx.evaluator().pc() {
            Ok(pc) => Some(Query::Pc(pc)),
            Err(_) => {
                println!("no program counter in machine state (try --registers)");
                None
            }
        };
    }
    match Query::interpret(arg, &ctx.evaluator()) {
        Ok(q) => Some(q),
        Err(e) => {
            println!("{e}");
            None
        }
    }
}

fn cmd_ls(ctx: &mut Ctx, args: &str) {
    let words = args.split_whitespace().collect::<Vec<_>>();
    if words.len() > 1 {
        println!("ls takes only one argument ({} given)", words.len());
        return;
    }
    let Some(query) = build_query(ctx, args.trim()) else {
        return;
    };

    let mut any_found = false;
    for symbol in query.resolve(&ctx.segments) {
        any_found = true;
        println!("{symbol}");
    }
    if !any_found {
        println!("{}", ansi_term::Colour::Red.paint("No symbol found."));
    }
}

fn cmd_ds(ctx: &mut Ctx, args: &str) {
    let words = args.split_whitespace().collect::<Vec<_>>();
    if words.len() > 1 {
        println!("ds takes only one argument ({} given)", words.len());
        return;
    }
    let label = if args.trim().is_empty() { "$pc" } else { args.trim() };
    let Some(query) = build_query(ctx, args.trim()) else {
        return;
    };

    let decoder = CapstoneDecoder::new(&ctx.memory, ctx.arch);
    match beedbg::disasm::dispatch(&query, &ctx.segments, &decoder) {
        Ok(Disassembly::NoMatch) => {
            println!("No symbol matching {label}");
        }
        Ok(Disassembly::Ambiguous(lines)) => {
            println!("Multiple symbols matching {label}:");
            for line in lines {
                println!("{line}");
            }
            println!("Please disambiguate");
        }
        Ok(Disassembly::Listing { header, lines }) => {
            println!("{header}");
            for line in lines {
                println!("{line}");
            }
        }
        Err(e) => {
            println!("disassembly failed: {e}");
        }
    }
}

fn cmd_do(ctx: &mut Ctx, args: &str) {
    let exprs = args.split_whitespace().collect::<Vec<_>>();
    if exprs.is_empty() {
        println!("usage: do [expr...]");
        return;
    }
    let eval = ctx.evaluator();
    for expr in exprs {
        for line in dump(&ctx.memory, &eval, &ctx.renderers, expr) {
            println!("{line}");
        }
    }
}

fn cmd_segs(ctx: &mut Ctx, _args: &str) {
    println!("{:18}   {:>10}   {:>7}   {}", "BASE", "SIZE", "SYMBOLS", "NAME");
    for segment in &ctx.segments {
        println!(
            "0x{:016x}   {:>10}   {:>7}   {}",
            segment.base,
            segment.size,
            segment.symtab.len(),
            segment.name,
        );
    }
}

fn cmd_load(ctx: &mut Ctx, args: &str) {
    let args = args.trim();
    if args.is_empty() {
        println!("usage: load [filename]");
        return;
    }

    let bytes = match std::fs::read(args) {
        Ok(bytes) => bytes,
        Err(e) => {
            println!("unable to read file: {e}");
            return;
        }
    };

    match beedbg::load_segment(display_name(Path::new(args)), bytes, &mut ctx.memory) {
        Ok(segment) => {
            println!(
                "loaded {} at 0x{:016x}; {} method symbols found",
                segment.name,
                segment.base,
                segment.symtab.len(),
            );
            ctx.segments.push(segment);
        }
        Err(e) => {
            println!("unable to load segment: {e}");
        }
    }
}

fn cmd_reg(ctx: &mut Ctx, args: &str) {
    let mut words = args.split_whitespace();
    let Some(regnum_str) = words.next() else {
        println!("missing required register number argument");
        return;
    };
    let value_str = words.next();

    let Ok(regnum) = parse_int::parse::<u16>(regnum_str) else {
        println!("could not parse register: {regnum_str}");
        return;
    };

    if let Some(value_str) = value_str {
        let Ok(value) = parse_int::parse::<u64>(value_str) else {
            println!("could not parse value: {value_str}");
            return;
        };
        ctx.registers.insert(regnum, value);
    } else {
        if let Some(x) = ctx.registers.get(&regnum) {
            println!("register {regnum} = {x:#x}");
        } else {
            println!("register {regnum} not present in machine state");
        }
    }
}
