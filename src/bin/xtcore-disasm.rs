use xtcore::cpu::decode::Decoder;
use xtcore::cpu::disasm::{print_instr, AsmPrinter, TermPrinter};
use xtcore::memory::{AddressSpace, ArrayMemory};
use xtcore::utils::parse_number;

use memmap::Mmap;
use structopt::StructOpt;
use termcolor::{ColorChoice, StandardStream};
use std::error::Error;
use std::fs::File;
use std::path::PathBuf;
use std::process;

#[derive(Debug, StructOpt)]
#[structopt(name = "xtcore-disasm", about = "Disassemble a flat 16-bit x86 binary")]
struct Opt {
    /// File offset to start disassembling at (can also be a hexadecimal value
    /// starting with `0x`).
    #[structopt(long = "start", default_value = "0", parse(try_from_str = parse_number))]
    start: u32,

    /// Number of bytes to disassemble. Defaults to the rest of the file.
    #[structopt(long = "bytes", parse(try_from_str = parse_number))]
    bytes: Option<u32>,

    /// Value of `IP` at the start offset, used to resolve relative branch
    /// targets. Use 0x100 for COM files. Defaults to the start offset.
    #[structopt(long = "ip", parse(try_from_str = parse_number))]
    ip: Option<u32>,

    /// Path to the binary.
    #[structopt(parse(from_os_str))]
    path: PathBuf,
}

fn run() -> Result<(), Box<dyn Error>> {
    let opt = Opt::from_args();

    let file = File::open(&opt.path)?;
    let contents = unsafe { Mmap::map(&file)? };
    let mut mem = ArrayMemory::new(contents.to_vec());

    let len = contents.len() as u32;
    let end = opt.bytes.map_or(len, |bytes| opt.start.saturating_add(bytes).min(len));
    let ip_base = opt.ip.unwrap_or(opt.start);

    let mut printer = TermPrinter::new(StandardStream::stdout(ColorChoice::Auto));
    let mut pos = opt.start;
    while pos < end {
        let ip = (ip_base + (pos - opt.start)) as u16;
        printer.print_address(&format!("{:04X}  ", ip));

        let (result, size) = {
            let mut decoder = Decoder::new(&mut mem, pos);
            let result = decoder.decode_next();
            (result, decoder.len().max(1))
        };

        match result {
            Ok(instr) => {
                let raw = (pos..pos + size)
                    .map(|addr| mem.load(addr).map(|b| format!("{:02X}", b)))
                    .collect::<Result<Vec<_>, _>>()?;
                printer.print_raw(&format!("{:<16}", raw.join(" ")));
                printer.set_pc(u32::from(ip) + size);
                print_instr(&instr, &mut printer);
                pos += size;
            }
            Err(e) => {
                // show one byte as data and resync after it
                let byte = mem.load(pos)?;
                printer.print_raw(&format!("{:<16}", format!("{:02X}", byte)));
                printer.print_mnemonic("db");
                printer.print_symbols(" ");
                printer.print_immediate(&format!("0x{:02X}", byte));
                printer.print_symbols(&format!("    ; {}", e));
                pos += 1;
            }
        }
        printer.newline();
    }

    printer.finish()?;
    Ok(())
}

fn main() {
    env_logger::init();

    match run() {
        Ok(()) => {},
        Err(e) => {
            eprintln!("exiting due to error: {}", e);
            process::exit(1);
        },
    }
}
