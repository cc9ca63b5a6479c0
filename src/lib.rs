//! Execution core of a PC-compatible real-mode x86 emulator.
//!
//! Instructions are fetched through a cache of decoded nodes, executed by an
//! interpreter and linked into a control flow graph as they run. Writes to
//! cached code invalidate the affected nodes. Interrupt handlers run in
//! execution contexts of their own, which are left again through one-shot
//! breakpoints on the return address.
//!
//! `machine::Machine` ties memory, I/O ports, the timer and the CPU together;
//! `emu_loop::EmulationLoop` runs it.

#![doc(html_root_url = "https://docs.rs/xtcore/0.1.0")]
#![warn(missing_debug_implementations)]

#[macro_use] extern crate bitflags;
#[macro_use] extern crate bitpat;
#[macro_use] extern crate log;
#[macro_use] extern crate num_derive;

pub mod breakpoint;
pub mod cfg;
pub mod control;
pub mod cpu;
pub mod debugger;
pub mod emu_loop;
pub mod io;
pub mod irq;
pub mod loader;
pub mod machine;
pub mod memory;
pub mod timer;
pub mod utils;
