//! I/O port dispatch.
//!
//! Devices register for individual port numbers. `in`/`out` instructions are
//! routed to the registered handler; ports nobody claimed either float high
//! (all bits set) with a warning, or abort emulation when the dispatcher is
//! strict.

use crate::breakpoint::{BreakpointKind, Breakpoints};
use crate::utils::NoDebug;

use std::collections::HashMap;
use std::error::Error;
use std::fmt;
use std::sync::Arc;

/// A device reachable through the I/O port space.
///
/// Every access has a default implementation that logs and ignores the
/// access, so devices only implement the widths they support. Wide accesses
/// default to a sequence of byte accesses on consecutive ports, low byte
/// first.
pub trait IoPortHandler: Send {
    fn read_byte(&mut self, port: u16) -> u8 {
        debug!("unimplemented byte read from port {:#06X}", port);
        0xFF
    }

    fn read_word(&mut self, port: u16) -> u16 {
        let lo = self.read_byte(port);
        let hi = self.read_byte(port.wrapping_add(1));
        u16::from(hi) << 8 | u16::from(lo)
    }

    fn read_dword(&mut self, port: u16) -> u32 {
        let lo = self.read_word(port);
        let hi = self.read_word(port.wrapping_add(2));
        u32::from(hi) << 16 | u32::from(lo)
    }

    fn write_byte(&mut self, port: u16, value: u8) {
        debug!("unimplemented byte write {:#04X} to port {:#06X}", value, port);
    }

    fn write_word(&mut self, port: u16, value: u16) {
        self.write_byte(port, value as u8);
        self.write_byte(port.wrapping_add(1), (value >> 8) as u8);
    }

    fn write_dword(&mut self, port: u16, value: u32) {
        self.write_word(port, value as u16);
        self.write_word(port.wrapping_add(2), (value >> 16) as u16);
    }
}

/// Routes port accesses to registered handlers.
#[derive(Debug)]
pub struct IoPortDispatcher {
    handlers: Vec<NoDebug<Box<dyn IoPortHandler>>>,
    /// Maps a port to its index in `handlers`.
    ports: HashMap<u16, usize>,
    strict: bool,
    breakpoints: Arc<Breakpoints>,
}

impl IoPortDispatcher {
    /// Creates a dispatcher without handlers.
    ///
    /// If `strict` is set, accesses to unclaimed ports fail with
    /// `IoError::Unhandled` instead of reading all ones.
    pub fn new(strict: bool, breakpoints: Arc<Breakpoints>) -> Self {
        Self {
            handlers: Vec::new(),
            ports: HashMap::new(),
            strict,
            breakpoints,
        }
    }

    /// Registers `handler` for every port in `ports`.
    ///
    /// Ports already claimed by another handler are taken over.
    pub fn register<I>(&mut self, ports: I, handler: Box<dyn IoPortHandler>)
    where I: IntoIterator<Item=u16> {
        let index = self.handlers.len();
        self.handlers.push(NoDebug(handler));
        for port in ports {
            if self.ports.insert(port, index).is_some() {
                debug!("port {:#06X} reassigned to handler #{}", port, index);
            }
        }
    }

    pub fn is_handled(&self, port: u16) -> bool {
        self.ports.contains_key(&port)
    }

    pub fn is_strict(&self) -> bool {
        self.strict
    }

    pub fn read_byte(&mut self, port: u16) -> Result<u8, IoError> {
        self.notify(BreakpointKind::IoRead, port, 1, None);
        match self.handler(port)? {
            Some(h) => Ok(h.read_byte(port)),
            None => Ok(0xFF),
        }
    }

    pub fn read_word(&mut self, port: u16) -> Result<u16, IoError> {
        self.notify(BreakpointKind::IoRead, port, 2, None);
        match self.handler(port)? {
            Some(h) => Ok(h.read_word(port)),
            None => Ok(0xFFFF),
        }
    }

    pub fn read_dword(&mut self, port: u16) -> Result<u32, IoError> {
        self.notify(BreakpointKind::IoRead, port, 4, None);
        match self.handler(port)? {
            Some(h) => Ok(h.read_dword(port)),
            None => Ok(!0),
        }
    }

    pub fn write_byte(&mut self, port: u16, value: u8) -> Result<(), IoError> {
        self.notify(BreakpointKind::IoWrite, port, 1, Some(value.into()));
        if let Some(h) = self.handler(port)? {
            h.write_byte(port, value);
        }
        Ok(())
    }

    pub fn write_word(&mut self, port: u16, value: u16) -> Result<(), IoError> {
        self.notify(BreakpointKind::IoWrite, port, 2, Some(value.into()));
        if let Some(h) = self.handler(port)? {
            h.write_word(port, value);
        }
        Ok(())
    }

    pub fn write_dword(&mut self, port: u16, value: u32) -> Result<(), IoError> {
        self.notify(BreakpointKind::IoWrite, port, 4, Some(value));
        if let Some(h) = self.handler(port)? {
            h.write_dword(port, value);
        }
        Ok(())
    }

    fn notify(&self, event: BreakpointKind, port: u16, len: u32, value: Option<u32>) {
        let port = u32::from(port);
        self.breakpoints.trigger(event, port..=port + len - 1, value);
    }

    /// Looks up the handler for `port`.
    ///
    /// Returns `Ok(None)` for an unclaimed port in lenient mode.
    fn handler(&mut self, port: u16) -> Result<Option<&mut Box<dyn IoPortHandler>>, IoError> {
        match self.ports.get(&port) {
            Some(&index) => Ok(Some(&mut self.handlers[index].0)),
            None if self.strict => Err(IoError::Unhandled { port }),
            None => {
                warn!("access to unhandled I/O port {:#06X}", port);
                Ok(None)
            }
        }
    }
}

/// Error returned by a strict dispatcher.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum IoError {
    /// No handler is registered for `port`.
    Unhandled {
        port: u16,
    },
}

impl fmt::Display for IoError {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        match self {
            IoError::Unhandled { port } => write!(f, "unhandled I/O port {:#06X}", port),
        }
    }
}

impl Error for IoError {}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::breakpoint::{Breakpoint, BreakpointTarget};
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::sync::Mutex;

    /// Latches the last byte written, reads it back.
    #[derive(Default)]
    struct Latch(u8);

    impl IoPortHandler for Latch {
        fn read_byte(&mut self, _port: u16) -> u8 {
            self.0
        }

        fn write_byte(&mut self, _port: u16, value: u8) {
            self.0 = value;
        }
    }

    struct Silent;

    impl IoPortHandler for Silent {}

    #[test]
    fn routes_to_handler() {
        let mut io = IoPortDispatcher::new(true, Arc::new(Breakpoints::new()));
        io.register(0x60..=0x60, Box::new(Latch::default()));
        io.write_byte(0x60, 0x5A).unwrap();
        assert_eq!(io.read_byte(0x60).unwrap(), 0x5A);
        // word access on a byte device: both halves hit the same latch
        io.write_word(0x60, 0x1234).unwrap();
        assert_eq!(io.read_byte(0x60).unwrap(), 0x12);
    }

    #[test]
    fn default_accessors_float_high() {
        let mut io = IoPortDispatcher::new(true, Arc::new(Breakpoints::new()));
        io.register(vec![0x3F8, 0x3F9], Box::new(Silent));
        assert_eq!(io.read_word(0x3F8).unwrap(), 0xFFFF);
        assert_eq!(io.read_dword(0x3F8).unwrap(), 0xFFFF_FFFF);
        io.write_dword(0x3F8, 0).unwrap();
    }

    #[test]
    fn unhandled_ports() {
        let mut lenient = IoPortDispatcher::new(false, Arc::new(Breakpoints::new()));
        assert_eq!(lenient.read_byte(0x80).unwrap(), 0xFF);
        assert_eq!(lenient.read_word(0x80).unwrap(), 0xFFFF);
        lenient.write_byte(0x80, 1).unwrap();

        let mut strict = IoPortDispatcher::new(true, Arc::new(Breakpoints::new()));
        assert_eq!(strict.read_byte(0x80), Err(IoError::Unhandled { port: 0x80 }));
        assert_eq!(strict.write_word(0x80, 0), Err(IoError::Unhandled { port: 0x80 }));
    }

    #[test]
    fn port_breakpoints() {
        let bps = Arc::new(Breakpoints::new());
        let reads = Arc::new(AtomicUsize::new(0));
        let writes = Arc::new(Mutex::new(Vec::new()));
        let r = reads.clone();
        let w = writes.clone();
        bps.insert(Breakpoint::new(BreakpointKind::IoRead, BreakpointTarget::Address(0x61))
            .with_callback(move |_| { r.fetch_add(1, Ordering::SeqCst); })).unwrap();
        bps.insert(Breakpoint::new(BreakpointKind::IoWrite, BreakpointTarget::Range(0x40..=0x43))
            .with_callback(move |hit| w.lock().unwrap().push((hit.address, hit.value)))).unwrap();

        let mut io = IoPortDispatcher::new(false, bps);
        io.read_byte(0x61).unwrap();
        io.read_word(0x60).unwrap();
        io.read_byte(0x62).unwrap();
        io.write_byte(0x43, 0x36).unwrap();
        io.write_byte(0x44, 0x00).unwrap();

        assert_eq!(reads.load(Ordering::SeqCst), 2);
        assert_eq!(*writes.lock().unwrap(), vec![(0x43, Some(0x36))]);
    }
}
