use clap::Parser;
use anyhow::Result;
use std::path::PathBuf;

use beedbg::mem::Memory;

#[derive(Debug, Parser)]
struct Segtool {
    #[clap(subcommand)]
    sub: Sub,
}

#[derive(Debug, Parser)]
enum Sub {
    /// Print the header of an image segment file.
    List {
        path: PathBuf,
    },
    /// Print every method symbol found in an image segment file.
    Symbols {
        path: PathBuf,
    },
}

fn main() -> Result<()> {
    let args = Segtool::parse();
    match args.sub {
        Sub::List { path } => {
            let bytes = std::fs::read(&path)?;
            let header = beedbg::SegmentHeader::parse(&bytes)?;

            let end = header.base + header.size - 1;
            println!("{:18}     {:18}   {}", "START", "END", "SOURCE");
            println!("{:#018x} ..= {end:#018x}   {}", header.base, path.display());
            println!();
            println!("reserved: {} bytes", header.reserved);
            println!("module:   0x{:016x}", header.module.0);
        }
        Sub::Symbols { path } => {
            let bytes = std::fs::read(&path)?;
            let mut memory = Memory::default();
            let name = path.display().to_string();
            let segment = beedbg::load_segment(name, bytes, &mut memory)?;

            for symbol in segment.symtab.symbols() {
                println!("{symbol}");
            }
        }
    }
    Ok(())
}
