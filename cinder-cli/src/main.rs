//! Terminal host for the interpreter: loads a raw image, runs it in
//! batches, optionally traces every retired instruction, and offers a
//! line-based debugger with reverse execution and an assembly editor.

use cinder_core::core::StepInfo;
use cinder_core::registers::Specifier;
use cinder_core::{Board, BoardConfig, Halt};
use clap::Parser;
use log::debug;
use std::error::Error;
use std::io::{self, BufRead, Write};
use std::path::PathBuf;
use std::process::ExitCode;

/// Instructions executed between host housekeeping checks. Large enough to
/// keep the interpreter busy, small enough that device output stays
/// responsive.
const BATCH: u32 = 512;

#[derive(Parser, Debug)]
#[command(version, about, long_about = None)]
struct Args {
    /// Program image to execute (raw bytes, no header).
    image: PathBuf,
    /// Print every retired instruction with a register dump.
    #[arg(long)]
    trace: bool,
    /// RAM size in MiB (1..=128).
    #[arg(long, default_value_t = 16)]
    memory: usize,
    /// Guest address the image is loaded at; RAM starts here and the
    /// program counter resets here. Accepts hex with an 0x prefix.
    #[arg(long, default_value = "0", value_parser = parse_address)]
    load_address: u32,
    /// Drop into the interactive debugger instead of free-running.
    #[arg(long)]
    debug: bool,
}

fn parse_address(text: &str) -> Result<u32, String> {
    let parsed = match text.strip_prefix("0x").or_else(|| text.strip_prefix("0X")) {
        Some(hex) => u32::from_str_radix(hex, 16),
        None => text.parse(),
    };
    parsed.map_err(|_| format!("invalid address: {text}"))
}

fn main() -> ExitCode {
    env_logger::builder()
        .filter_level(log::LevelFilter::Warn)
        .parse_default_env()
        .init();

    let args = Args::parse();
    match run(args) {
        Ok(code) => code,
        Err(err) => {
            eprintln!("cinder: {err}");
            ExitCode::from(2)
        }
    }
}

fn run(args: Args) -> Result<ExitCode, Box<dyn Error>> {
    let image = std::fs::read(&args.image)?;
    let config = BoardConfig {
        memory_size: args.memory << 20,
        ram_base: args.load_address,
        ..BoardConfig::default()
    };
    let mut board = Board::new(config)?;
    board.load_image(args.load_address, &image)?;
    debug!("entry point {:#010x}", args.load_address);

    if args.debug {
        return debug_repl(&mut board).map_err(Into::into);
    }

    let halt = if args.trace {
        loop {
            match board.step() {
                Ok(info) => {
                    print_trace_line(&board, &info);
                }
                Err(halt) => break halt,
            }
        }
    } else {
        loop {
            if let Err(halt) = board.run(BATCH) {
                break halt;
            }
        }
    };
    Ok(report(halt))
}

fn report(halt: Halt) -> ExitCode {
    match halt {
        Halt::Exit(code) => ExitCode::from((code & 0xFF) as u8),
        Halt::Shutdown => ExitCode::SUCCESS,
        fatal => {
            eprintln!("cinder: {fatal}");
            ExitCode::FAILURE
        }
    }
}

/// One line per retired instruction, then the register file eight entries
/// per row.
fn print_trace_line(board: &Board, info: &StepInfo) {
    let cycle = board.core().retired() - 1;
    if info.compressed {
        println!(
            "[cycle {cycle}] pc=0x{:08x} ins=0x{:04x}  {}",
            info.pc, info.raw, info.instruction
        );
    } else {
        println!(
            "[cycle {cycle}] pc=0x{:08x} ins=0x{:08x}  {}",
            info.pc, info.raw, info.instruction
        );
    }
    print!("{}", dump_registers(board));
}

fn dump_registers(board: &Board) -> String {
    let mut out = String::new();
    for (i, specifier) in Specifier::iter_all().enumerate() {
        let value = board.core().registers().x(specifier);
        out.push_str(&format!("{:>4}={value:08x}", specifier.abi_name()));
        out.push(if i % 8 == 7 { '\n' } else { ' ' });
    }
    out
}

fn debug_repl(board: &mut Board) -> Result<ExitCode, io::Error> {
    println!("cinder debugger; 'h' for help, 'q' to quit");
    let stdin = io::stdin();
    loop {
        print!("(cinder) ");
        io::stdout().flush()?;
        let mut line = String::new();
        if stdin.lock().read_line(&mut line)? == 0 {
            return Ok(ExitCode::SUCCESS);
        }
        let words: Vec<&str> = line.split_whitespace().collect();
        let (command, rest) = match words.split_first() {
            Some((c, rest)) => (*c, rest),
            None => continue,
        };
        match command {
            "h" | "help" => {
                println!("s [n]        step n instructions (default 1)");
                println!("b [n]        step backwards n instructions");
                println!("r [n]        run n instructions (default until halt)");
                println!("regs         dump the register file");
                println!("x addr [n]   dump n memory bytes (default 16)");
                println!("w addr byte  write one memory byte");
                println!("t [n]        show the last n trace records (default 8)");
                println!("dis          disassemble the loaded image");
                println!("e            edit the image as assembly ('.' line ends)");
                println!("load path [addr]  load a new image (resets the machine)");
                println!("save path    save the image bytes back out");
                println!("q            quit");
            }
            "s" | "step" => {
                let count = parse_count(rest, 1);
                for _ in 0..count {
                    match board.step() {
                        Ok(info) => print_trace_line(board, &info),
                        Err(halt) => {
                            println!("halted: {halt}");
                            break;
                        }
                    }
                }
            }
            "b" | "back" => {
                let count = parse_count(rest, 1);
                let mut stepped = 0;
                while stepped < count && board.step_back() {
                    stepped += 1;
                }
                println!(
                    "stepped back {stepped}; pc=0x{:08x} cycle={}",
                    board.core().registers().pc(),
                    board.core().retired()
                );
            }
            "r" | "run" => {
                let count = parse_count(rest, u64::MAX);
                let mut remaining = count;
                let halt = loop {
                    let batch = remaining.min(u64::from(BATCH)) as u32;
                    if batch == 0 {
                        break None;
                    }
                    match board.run(batch) {
                        Ok(()) => remaining -= u64::from(batch),
                        Err(halt) => break Some(halt),
                    }
                };
                match halt {
                    Some(halt) if halt.is_fatal() => println!("halted: {halt}"),
                    Some(halt) => {
                        println!("{halt}");
                        return Ok(report(halt));
                    }
                    None => println!("ran {count} instructions"),
                }
            }
            "regs" => print!("{}", dump_registers(board)),
            "x" | "examine" => {
                let Some(address) = rest.first().and_then(|a| parse_address(a).ok()) else {
                    println!("usage: x addr [n]");
                    continue;
                };
                let count = parse_count(&rest[1.min(rest.len())..], 16);
                for i in 0..count {
                    let addr = address.wrapping_add(i as u32);
                    match board.read_memory_byte(addr) {
                        Some(byte) => {
                            if i % 16 == 0 {
                                print!("{addr:#010x}: ");
                            }
                            print!("{byte:02x} ");
                            if i % 16 == 15 {
                                println!();
                            }
                        }
                        None => {
                            println!("\n{addr:#010x}: outside RAM");
                            break;
                        }
                    }
                }
                println!();
            }
            "w" | "write" => {
                let parsed = match (rest.first(), rest.get(1)) {
                    (Some(a), Some(v)) => parse_address(a).ok().zip(parse_address(v).ok()),
                    _ => None,
                };
                match parsed {
                    Some((address, value)) if value <= 0xFF => {
                        if board.write_memory_byte(address, value as u8) {
                            println!("wrote {value:#04x} at {address:#010x}");
                        } else {
                            println!("{address:#010x}: outside RAM");
                        }
                    }
                    _ => println!("usage: w addr byte"),
                }
            }
            "t" | "trace" => {
                let count = parse_count(rest, 8) as usize;
                let records = board.history().trace();
                let skip = records.len().saturating_sub(count);
                for record in records.skip(skip) {
                    println!(
                        "[cycle {}] pc=0x{:08x} ins=0x{:08x}  {}",
                        record.cycle, record.pc, record.raw, record.text
                    );
                }
            }
            "dis" => print!("{}", board.disassemble_image()),
            "e" | "edit" => {
                println!("; current image:");
                print!("{}", board.disassemble_image());
                println!("; enter replacement, end with a single '.'");
                let mut source = String::new();
                loop {
                    let mut edit_line = String::new();
                    if stdin.lock().read_line(&mut edit_line)? == 0 || edit_line.trim() == "." {
                        break;
                    }
                    source.push_str(&edit_line);
                }
                match board.apply_edited_source(&source) {
                    Ok(()) => println!("assembled and reloaded; machine reset"),
                    Err(err) => println!("assembly failed: {err}"),
                }
            }
            "load" => {
                let Some(path) = rest.first() else {
                    println!("usage: load path [addr]");
                    continue;
                };
                let address = rest
                    .get(1)
                    .and_then(|a| parse_address(a).ok())
                    .unwrap_or(0);
                match std::fs::read(path) {
                    Ok(image) => match board.load_image(address, &image) {
                        Ok(()) => println!("loaded {} bytes at {address:#010x}", image.len()),
                        Err(err) => println!("load failed: {err}"),
                    },
                    Err(err) => println!("load failed: {err}"),
                }
            }
            "save" => {
                let Some(path) = rest.first() else {
                    println!("usage: save path");
                    continue;
                };
                match std::fs::write(path, board.image_bytes()) {
                    Ok(()) => println!("saved {} bytes", board.image_bytes().len()),
                    Err(err) => println!("save failed: {err}"),
                }
            }
            "q" | "quit" => return Ok(ExitCode::SUCCESS),
            other => println!("unknown command: {other} ('h' for help)"),
        }
    }
}

fn parse_count(words: &[&str], default: u64) -> u64 {
    words
        .first()
        .and_then(|w| w.parse().ok())
        .unwrap_or(default)
}
