//! Thin command-line frontend over `elfstack-core`.
//!
//! This binary contains no ELF/DWARF/unwinding logic of its own: it parses
//! arguments, opens a process or core via the core crate's public surface,
//! and formats whatever comes back.

use std::path::PathBuf;
use std::process::ExitCode;

use clap::Parser;

use elfstack_common::CpuFamily;
use elfstack_core::elf::Symbol;
use elfstack_core::process::Process;
use elfstack_core::symbolicate::Symbolicators;
use elfstack_core::unwind::{CfiCache, Unwinder};
use elfstack_core::vtable::{self, ScanConfig};

/// Prints symbolic call stacks for a live process or ELF core, or a
/// vtable-pointer histogram.
#[derive(Parser, Debug)]
#[command(name = "elfstack", version, about)]
struct Args {
    /// Path to the executable the core or pid was produced from. Optional
    /// when the binary can be located through other means (e.g. a core's
    /// own embedded path note).
    executable: Option<PathBuf>,

    /// A core file path, or a live process id to attach to.
    target: String,

    /// Glob pattern for vtable symbols to scan for (default `_ZTV*`).
    #[arg(short = 'p', long)]
    pattern: Option<String>,

    /// Restrict the vtable scan to addresses at or after this one (hex).
    /// Must be given together with `-e`.
    #[arg(short = 'f', long = "range-start", requires = "range_end")]
    range_start: Option<String>,

    /// Restrict the vtable scan to addresses before this one (hex). Must be
    /// given together with `-f`.
    #[arg(short = 'e', long = "range-end", requires = "range_start")]
    range_end: Option<String>,

    /// Restrict the vtable histogram to symbols containing this literal
    /// substring.
    #[arg(short = 'S', long)]
    literal: Option<String>,

    /// Print frame/symbol addresses alongside names.
    #[arg(short = 's', long)]
    show_addresses: bool,

    /// Enable verbose tracing output.
    #[arg(short = 'v', long)]
    verbose: bool,

    /// Scan for vtable pointers instead of printing a call stack.
    #[arg(long)]
    vtables: bool,
}

/// A malformed argument, as opposed to a runtime failure attaching to or
/// reading a target — distinguished so `main` can exit `1` rather than `2`.
#[derive(Debug)]
struct UsageError(String);

impl std::fmt::Display for UsageError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.0)
    }
}

impl std::error::Error for UsageError {}

fn main() -> ExitCode {
    let args = Args::parse();

    if args.verbose {
        tracing_subscriber::fmt().with_target(false).init();
    }

    match run(&args) {
        Ok(()) => ExitCode::SUCCESS,
        Err(err) => {
            eprintln!("elfstack: {err}");
            let code = if err.downcast_ref::<UsageError>().is_some() { 1 } else { 2 };
            ExitCode::from(code)
        }
    }
}

fn run(args: &Args) -> Result<(), Box<dyn std::error::Error>> {
    let mut process = open_target(args)?;

    if args.vtables {
        scan_vtables(&process, args)?;
    } else {
        print_stacks(&process, args.show_addresses)?;
    }

    process.detach()?;
    Ok(())
}

fn open_target(args: &Args) -> Result<Process, Box<dyn std::error::Error>> {
    if let Ok(pid) = args.target.parse::<i32>() {
        Ok(Process::attach_live(pid)?)
    } else {
        Ok(Process::open_core(&args.target, args.executable.as_ref())?)
    }
}

/// Dispatches a `--vtables` run to one of three mutually exclusive modes,
/// matching the CLI's own precedence: a literal needle (`-S`) wins over an
/// address range (`-f`/`-e`), which wins over the default symbol histogram.
fn scan_vtables(process: &Process, args: &Args) -> Result<(), Box<dyn std::error::Error>> {
    if let Some(literal) = &args.literal {
        for addr in vtable::scan_literal(process, literal.as_bytes()) {
            println!("{addr:#018x}");
        }
        return Ok(());
    }

    if let (Some(start), Some(end)) = (&args.range_start, &args.range_end) {
        let (min, max) = parse_range(start, end)?;
        for addr in vtable::scan_references(process, min, max) {
            println!("{addr:#018x}");
        }
        return Ok(());
    }

    let config = ScanConfig {
        symbol_pattern: args.pattern.clone().unwrap_or_else(|| "_ZTV*".to_string()),
        address_range: None,
        literal_filter: None,
        show_zero_counts: false,
    };

    let symbols_by_object: Vec<(usize, i64, Vec<Symbol<'_>>)> = process
        .loaded_objects()
        .iter()
        .enumerate()
        .filter_map(|(idx, object)| {
            let elf = process.elf_for(idx)?;
            let symbols: Vec<Symbol<'_>> = elf.symbol_map().iter().cloned().collect();
            Some((idx, object.bias, symbols))
        })
        .collect();

    let candidates = vtable::collect_candidates(&symbols_by_object, &config.symbol_pattern)?;
    let counts = vtable::scan(process, &candidates, &config);
    for entry in counts {
        println!("{:>8}  {}", entry.count, entry.name);
    }
    Ok(())
}

fn parse_range(start: &str, end: &str) -> Result<(u64, u64), Box<dyn std::error::Error>> {
    let start = u64::from_str_radix(start.trim_start_matches("0x"), 16)
        .map_err(|e| UsageError(format!("invalid -f value {start:?}: {e}")))?;
    let end = u64::from_str_radix(end.trim_start_matches("0x"), 16)
        .map_err(|e| UsageError(format!("invalid -e value {end:?}: {e}")))?;
    Ok((start, end))
}

fn print_stacks(process: &Process, show_addresses: bool) -> Result<(), Box<dyn std::error::Error>> {
    let cfi_cache = CfiCache::new(process);
    let symbolicators = Symbolicators::new(process);
    // Loaded object 0 is always the primary executable/core image (§3
    // invariant), so its `e_machine` picks the DWARF register numbering
    // every thread in this process unwinds with.
    let family = process
        .elf_for(0)
        .map(|elf| elf.arch().cpu_family())
        .unwrap_or(CpuFamily::Unknown);

    for thread in process.threads() {
        println!("thread {}", thread.tid);

        let unwinder =
            Unwinder::new(process, thread.registers.clone(), family, |pc| cfi_cache.lookup(pc));

        for frame in unwinder {
            let frame = match frame {
                Ok(frame) => frame,
                Err(_) => break,
            };

            let resolved = symbolicators.resolve(&frame);
            let name = resolved
                .as_ref()
                .and_then(|r| r.name.as_deref())
                .unwrap_or("??");

            if show_addresses {
                print!("  {:#018x}  {name}", frame.pc);
            } else {
                print!("  {name}");
            }

            if let Some(resolved) = resolved.filter(|r| r.line != 0) {
                if let Some(file) = &resolved.file {
                    print!(" ({file}:{})", resolved.line);
                }
            }
            println!();
        }
    }
    Ok(())
}
