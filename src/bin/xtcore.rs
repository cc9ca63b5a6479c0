use xtcore::cfg::node::InstructionNode;
use xtcore::cpu::disasm::{print_instr, TermPrinter};
use xtcore::cpu::State;
use xtcore::emu_loop::EmulationLoop;
use xtcore::loader::{self, ImageFormat};
use xtcore::machine::{Machine, MachineConfig};
use xtcore::memory::MIN_MEMORY_SIZE;
use xtcore::utils::parse_number;

use memmap::Mmap;
use structopt::StructOpt;
use termcolor::{ColorChoice, StandardStream};
use std::error::Error;
use std::fs::File;
use std::num::ParseIntError;
use std::path::PathBuf;
use std::{io, process};

fn parse_segment(src: &str) -> Result<u16, ParseIntError> {
    let digits = src.trim_start_matches("0x").trim_end_matches(|c| c == 'h' || c == 'H');
    u16::from_str_radix(digits, 16)
}

#[derive(Debug, StructOpt)]
#[structopt(name = "xtcore", about = "Real-mode PC emulator.")]
struct Opt {
    /// Path to the image to run.
    #[structopt(parse(from_os_str))]
    path: PathBuf,

    /// Load the image as a DOS COM program (at offset 0x100, behind a PSP)
    /// instead of a flat binary.
    #[structopt(long = "com")]
    com: bool,

    /// Segment to load the image into (hexadecimal).
    #[structopt(long = "segment", default_value = "1000", parse(try_from_str = parse_segment))]
    segment: u16,

    /// Print every instruction before it is executed.
    #[structopt(long = "trace")]
    trace: bool,

    /// Abort when the program accesses an I/O port nothing is attached to.
    #[structopt(long = "strict-io")]
    strict_io: bool,

    /// Amount of RAM in KiB. Defaults to the minimum of 1088 KiB.
    #[structopt(long = "memory-kib")]
    memory_kib: Option<usize>,

    /// Start with the A20 gate enabled.
    #[structopt(long = "a20")]
    a20: bool,

    /// Raise the timer interrupt every N instructions (can also be a
    /// hexadecimal value starting with `0x`).
    #[structopt(long = "timer-divisor", parse(try_from_str = parse_number))]
    timer_divisor: Option<u32>,

    /// Stop after executing this many instructions.
    #[structopt(long = "limit")]
    limit: Option<u64>,

    /// Print the control flow graph built during the run.
    #[structopt(long = "dump-graph")]
    dump_graph: bool,
}

fn run() -> Result<(), Box<dyn Error>> {
    let opt = Opt::from_args();

    let file = File::open(&opt.path)?;
    let image = unsafe { Mmap::map(&file)? };

    let config = MachineConfig {
        memory_size: opt.memory_kib.map_or(MIN_MEMORY_SIZE, |kib| kib * 1024),
        a20_enabled: opt.a20,
        strict_io: opt.strict_io,
        timer_divisor: opt.timer_divisor,
        instruction_limit: opt.limit,
    };
    let mut machine = Machine::new(config)?;
    loader::bootstrap(&mut machine)?;
    let format = if opt.com { ImageFormat::Com } else { ImageFormat::Raw };
    loader::load_image(&mut machine, &image, format, opt.segment)?;

    if opt.trace {
        let mut printer = TermPrinter::new(StandardStream::stdout(ColorChoice::Auto));
        machine.cpu_mut().set_tracer(Some(Box::new(move |state: &State, node: &InstructionNode| {
            printer.print_address(&format!("{}  ", state.cs_ip()));
            printer.set_pc(u32::from(state.ip()) + node.len());
            print_instr(node.instr(), &mut printer);
            printer.newline();
        })));
    }

    let result = EmulationLoop::run(&mut machine);

    if opt.dump_graph {
        let stdout = io::stdout();
        machine.cpu().write_graph(&mut stdout.lock())?;
    }

    let report = result?;
    let ctx = machine.cpu().contexts();
    eprintln!("{}", report);
    eprintln!("{} execution contexts, current: {}", ctx.len(), ctx.current_id());
    Ok(())
}

fn main() {
    // By default, log all `info!` messages and higher
    env_logger::Builder::from_default_env()
        .filter(None, log::LevelFilter::Info)
        .init();

    match run() {
        Ok(()) => {},
        Err(e) => {
            eprintln!("exiting due to error: {}", e);
            process::exit(1);
        },
    }
}
