//! Breakpoint registry shared between the emulation loop and debuggers.
//!
//! The registry is the single place where breakpoints live, regardless of
//! what they watch (memory accesses, instruction addresses, I/O ports,
//! interrupt vectors, instruction counts or the machine stopping). Memory and
//! the I/O dispatcher notify it about accesses, the emulation loop asks it
//! about the instruction that is about to run.
//!
//! Debuggers may add, toggle and remove breakpoints from other threads, so
//! the collection sits behind a `Mutex`. Per-kind counters of armed
//! breakpoints are kept in atomics so that the hot paths (every memory
//! access, every instruction) only pay for an atomic load while nothing of
//! that kind is armed.
//!
//! # Actions
//!
//! A firing breakpoint performs its `BreakpointAction`. Callbacks run
//! synchronously on the thread that triggered the breakpoint, while the
//! registry lock is held, so they must not call back into the registry.
//! `Pause` and `RestoreContext` need access to machine state the registry
//! does not own; they are queued as `PendingAction`s and applied by the
//! emulation loop before the next instruction boundary.
//!
//! One-shot breakpoints are removed by the registry right after their action
//! was performed, so they can never fire twice.

use crate::cfg::context::ContextId;
use crate::utils::NoDebug;

use std::error::Error;
use std::fmt;
use std::ops::RangeInclusive;
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::{Mutex, MutexGuard};

/// What a breakpoint watches.
#[derive(Debug, Copy, Clone, PartialEq, Eq, Hash)]
pub enum BreakpointKind {
    /// Memory read.
    Read,
    /// Memory write.
    Write,
    /// Memory read or write.
    Access,
    /// Instruction about to execute at a physical address.
    Execute,
    /// The executed instruction count reaches a value.
    Cycles,
    /// An interrupt vector is raised (software or hardware).
    Interrupt,
    /// I/O port read.
    IoRead,
    /// I/O port write.
    IoWrite,
    /// I/O port read or write.
    IoAccess,
    /// The emulation loop stops.
    MachineStop,
}

const KIND_COUNT: usize = 10;

impl BreakpointKind {
    fn index(self) -> usize {
        self as usize
    }

    /// Whether a breakpoint of kind `self` fires for an event of kind `event`.
    fn matches(self, event: BreakpointKind) -> bool {
        use self::BreakpointKind::*;

        match (self, event) {
            (Access, Read) | (Access, Write) => true,
            (IoAccess, IoRead) | (IoAccess, IoWrite) => true,
            (a, b) => a == b,
        }
    }
}

/// The address (or other value) a breakpoint is bound to.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum BreakpointTarget {
    /// A single address, port, vector or instruction count.
    Address(u32),
    /// An inclusive range of addresses or ports.
    Range(RangeInclusive<u32>),
    /// Not bound to any address.
    Always,
}

impl BreakpointTarget {
    fn overlaps(&self, range: &RangeInclusive<u32>) -> bool {
        match self {
            BreakpointTarget::Address(addr) => range.contains(addr),
            BreakpointTarget::Range(own) => own.start() <= range.end() && range.start() <= own.end(),
            BreakpointTarget::Always => true,
        }
    }
}

/// Handler invoked synchronously when a breakpoint fires.
pub type BreakpointCallback = Box<dyn FnMut(&BreakpointHit) + Send>;

/// What happens when a breakpoint fires.
#[derive(Debug)]
pub enum BreakpointAction {
    /// Pause the emulation loop before the next instruction.
    Pause,
    /// Make the given execution context the current one again.
    RestoreContext(ContextId),
    /// Invoke a callback.
    Callback(NoDebug<BreakpointCallback>),
}

/// An action the registry cannot perform itself.
#[derive(Debug, Copy, Clone, PartialEq, Eq)]
pub enum PendingAction {
    Pause,
    RestoreContext(ContextId),
}

/// Handle identifying a registered breakpoint.
#[derive(Debug, Copy, Clone, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct BreakpointId(u64);

/// A breakpoint definition.
#[derive(Debug)]
pub struct Breakpoint {
    kind: BreakpointKind,
    target: BreakpointTarget,
    action: BreakpointAction,
    one_shot: bool,
    enabled: bool,
}

impl Breakpoint {
    /// Creates an enabled, persistent breakpoint that pauses the machine.
    pub fn new(kind: BreakpointKind, target: BreakpointTarget) -> Self {
        Self {
            kind,
            target,
            action: BreakpointAction::Pause,
            one_shot: false,
            enabled: true,
        }
    }

    /// Removes the breakpoint from the registry after it fired once.
    pub fn one_shot(mut self) -> Self {
        self.one_shot = true;
        self
    }

    pub fn with_action(mut self, action: BreakpointAction) -> Self {
        self.action = action;
        self
    }

    pub fn with_callback<F>(self, callback: F) -> Self
    where
        F: FnMut(&BreakpointHit) + Send + 'static,
    {
        self.with_action(BreakpointAction::Callback(NoDebug(Box::new(callback))))
    }

    pub fn kind(&self) -> BreakpointKind {
        self.kind
    }

    pub fn target(&self) -> &BreakpointTarget {
        &self.target
    }

    pub fn action(&self) -> &BreakpointAction {
        &self.action
    }

    pub fn is_one_shot(&self) -> bool {
        self.one_shot
    }

    pub fn is_enabled(&self) -> bool {
        self.enabled
    }

    /// Checks that the target makes sense for the kind of breakpoint.
    fn validate(&self) -> Result<(), BreakpointError> {
        use self::BreakpointKind::*;

        let supported = match (self.kind, &self.target) {
            (Read, BreakpointTarget::Address(_)) | (Read, BreakpointTarget::Range(_))
            | (Write, BreakpointTarget::Address(_)) | (Write, BreakpointTarget::Range(_))
            | (Access, BreakpointTarget::Address(_)) | (Access, BreakpointTarget::Range(_))
            | (Execute, BreakpointTarget::Address(_)) | (Execute, BreakpointTarget::Range(_))
            | (IoRead, BreakpointTarget::Address(_)) | (IoRead, BreakpointTarget::Range(_))
            | (IoWrite, BreakpointTarget::Address(_)) | (IoWrite, BreakpointTarget::Range(_))
            | (IoAccess, BreakpointTarget::Address(_)) | (IoAccess, BreakpointTarget::Range(_)) => true,
            (Cycles, BreakpointTarget::Address(_)) | (Interrupt, BreakpointTarget::Address(_)) => true,
            (MachineStop, BreakpointTarget::Always) => true,
            _ => false,
        };

        if supported {
            Ok(())
        } else {
            Err(BreakpointError::Unsupported {
                kind: self.kind,
                target: self.target.clone(),
            })
        }
    }
}

/// Information passed to breakpoint callbacks.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct BreakpointHit {
    pub id: BreakpointId,
    /// The event that fired the breakpoint (never `Access`/`IoAccess`).
    pub event: BreakpointKind,
    /// First address, port, vector or instruction count of the event.
    pub address: u32,
    /// For writes, the value about to be stored.
    pub value: Option<u32>,
}

#[derive(Debug)]
struct Entry {
    id: BreakpointId,
    breakpoint: Breakpoint,
}

#[derive(Debug, Default)]
struct Registry {
    next_id: u64,
    entries: Vec<Entry>,
    pending: Vec<PendingAction>,
}

/// Thread-safe breakpoint registry.
#[derive(Debug)]
pub struct Breakpoints {
    registry: Mutex<Registry>,
    /// Number of enabled breakpoints per kind.
    armed: [AtomicUsize; KIND_COUNT],
    has_pending: AtomicBool,
}

impl Default for Breakpoints {
    fn default() -> Self {
        Self::new()
    }
}

impl Breakpoints {
    pub fn new() -> Self {
        Self {
            registry: Mutex::new(Registry::default()),
            armed: Default::default(),
            has_pending: AtomicBool::new(false),
        }
    }

    fn lock(&self) -> MutexGuard<Registry> {
        // A panicking callback poisons the lock, but the registry itself is
        // never left half-updated, so keep going.
        self.registry.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
    }

    fn arm(&self, kind: BreakpointKind, delta: isize) {
        let counter = &self.armed[kind.index()];
        if delta > 0 {
            counter.fetch_add(1, Ordering::AcqRel);
        } else {
            counter.fetch_sub(1, Ordering::AcqRel);
        }
    }

    /// Registers a breakpoint.
    ///
    /// Returns an error if the breakpoint's kind cannot be bound to its
    /// target, for example a `MachineStop` breakpoint on an address.
    pub fn insert(&self, breakpoint: Breakpoint) -> Result<BreakpointId, BreakpointError> {
        breakpoint.validate()?;

        let mut reg = self.lock();
        let id = BreakpointId(reg.next_id);
        reg.next_id += 1;
        debug!("adding {:?} breakpoint {:?} on {:?}{}", breakpoint.kind, id, breakpoint.target,
            if breakpoint.one_shot { " (one-shot)" } else { "" });
        if breakpoint.enabled {
            self.arm(breakpoint.kind, 1);
        }
        reg.entries.push(Entry { id, breakpoint });
        Ok(id)
    }

    /// Enables or disables a registered breakpoint.
    ///
    /// Returns `false` if no breakpoint with that ID exists (anymore).
    pub fn toggle(&self, id: BreakpointId, enabled: bool) -> bool {
        let mut reg = self.lock();
        match reg.entries.iter_mut().find(|e| e.id == id) {
            Some(entry) => {
                if entry.breakpoint.enabled != enabled {
                    entry.breakpoint.enabled = enabled;
                    self.arm(entry.breakpoint.kind, if enabled { 1 } else { -1 });
                }
                true
            }
            None => false,
        }
    }

    /// Removes a breakpoint from the registry and returns it.
    pub fn remove(&self, id: BreakpointId) -> Option<Breakpoint> {
        let mut reg = self.lock();
        let pos = reg.entries.iter().position(|e| e.id == id)?;
        let entry = reg.entries.remove(pos);
        if entry.breakpoint.enabled {
            self.arm(entry.breakpoint.kind, -1);
        }
        debug!("removed breakpoint {:?}", id);
        Some(entry.breakpoint)
    }

    /// Returns whether a breakpoint with this ID is registered.
    pub fn contains(&self, id: BreakpointId) -> bool {
        self.lock().entries.iter().any(|e| e.id == id)
    }

    /// Number of registered breakpoints (enabled or not).
    pub fn len(&self) -> usize {
        self.lock().entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Lists the registered breakpoints as `(id, kind, target, one_shot, enabled)`.
    pub fn list(&self) -> Vec<(BreakpointId, BreakpointKind, BreakpointTarget, bool, bool)> {
        self.lock().entries.iter().map(|e| {
            let bp = &e.breakpoint;
            (e.id, bp.kind, bp.target.clone(), bp.one_shot, bp.enabled)
        }).collect()
    }

    /// Fast check whether any enabled breakpoint could fire for `event`.
    pub fn is_armed(&self, event: BreakpointKind) -> bool {
        use self::BreakpointKind::*;

        let count = |kind: BreakpointKind| self.armed[kind.index()].load(Ordering::Acquire);
        match event {
            Read | Write => count(event) + count(Access) != 0,
            IoRead | IoWrite => count(event) + count(IoAccess) != 0,
            _ => count(event) != 0,
        }
    }

    /// Fires all enabled breakpoints watching `event` on any address in
    /// `range`.
    ///
    /// Returns the number of breakpoints that fired.
    pub fn trigger(&self, event: BreakpointKind, range: RangeInclusive<u32>, value: Option<u32>) -> usize {
        if !self.is_armed(event) {
            return 0;
        }

        let mut reg = self.lock();
        let reg = &mut *reg;
        let mut fired = 0;
        let mut spent = Vec::new();
        for entry in reg.entries.iter_mut() {
            let bp = &mut entry.breakpoint;
            if !bp.enabled || !bp.kind.matches(event) || !bp.target.overlaps(&range) {
                continue;
            }

            fired += 1;
            trace!("breakpoint {:?} fired on {:?} at {:#X}", entry.id, event, range.start());
            match &mut bp.action {
                BreakpointAction::Pause => reg.pending.push(PendingAction::Pause),
                BreakpointAction::RestoreContext(ctx) => reg.pending.push(PendingAction::RestoreContext(*ctx)),
                BreakpointAction::Callback(callback) => {
                    let hit = BreakpointHit {
                        id: entry.id,
                        event,
                        address: *range.start(),
                        value,
                    };
                    (callback.0)(&hit);
                }
            }

            if bp.one_shot {
                spent.push(entry.id);
            }
        }

        if !reg.pending.is_empty() {
            self.has_pending.store(true, Ordering::Release);
        }

        for id in spent {
            if let Some(pos) = reg.entries.iter().position(|e| e.id == id) {
                let entry = reg.entries.remove(pos);
                self.arm(entry.breakpoint.kind, -1);
                debug!("one-shot breakpoint {:?} removed after firing", id);
            }
        }

        fired
    }

    /// Fires breakpoints watching a single address (or port, vector, count).
    pub fn trigger_at(&self, event: BreakpointKind, address: u32) -> usize {
        self.trigger(event, address..=address, None)
    }

    /// Takes the actions queued by fired breakpoints, in firing order.
    pub fn take_pending(&self) -> Vec<PendingAction> {
        if !self.has_pending.load(Ordering::Acquire) {
            return Vec::new();
        }

        let mut reg = self.lock();
        self.has_pending.store(false, Ordering::Release);
        std::mem::replace(&mut reg.pending, Vec::new())
    }
}

/// Error returned when registering a breakpoint fails.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum BreakpointError {
    /// The breakpoint kind cannot be bound to this kind of target.
    Unsupported {
        kind: BreakpointKind,
        target: BreakpointTarget,
    },
}

impl fmt::Display for BreakpointError {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        match self {
            BreakpointError::Unsupported { kind, target } => {
                write!(f, "unsupported breakpoint: {:?} on {:?}", kind, target)
            }
        }
    }
}

impl Error for BreakpointError {}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Arc;

    fn counter() -> (Arc<AtomicUsize>, impl FnMut(&BreakpointHit) + Send + 'static) {
        let count = Arc::new(AtomicUsize::new(0));
        let c = count.clone();
        (count, move |_: &BreakpointHit| { c.fetch_add(1, Ordering::SeqCst); })
    }

    #[test]
    fn one_shot_fires_once() {
        let bps = Breakpoints::new();
        let (count, cb) = counter();
        let id = bps.insert(
            Breakpoint::new(BreakpointKind::Execute, BreakpointTarget::Address(0x10010))
                .one_shot()
                .with_callback(cb)
        ).unwrap();

        assert_eq!(bps.trigger_at(BreakpointKind::Execute, 0x10010), 1);
        assert_eq!(bps.trigger_at(BreakpointKind::Execute, 0x10010), 0);
        assert_eq!(count.load(Ordering::SeqCst), 1);
        assert!(!bps.contains(id));
        assert!(!bps.is_armed(BreakpointKind::Execute));
    }

    #[test]
    fn range_overlap_and_access_kind() {
        let bps = Breakpoints::new();
        let (count, cb) = counter();
        bps.insert(
            Breakpoint::new(BreakpointKind::Access, BreakpointTarget::Range(0x100..=0x1FF))
                .with_callback(cb)
        ).unwrap();

        assert_eq!(bps.trigger(BreakpointKind::Write, 0x80..=0x100, Some(1)), 1);
        assert_eq!(bps.trigger(BreakpointKind::Read, 0x1FF..=0x1FF, None), 1);
        assert_eq!(bps.trigger(BreakpointKind::Read, 0x200..=0x300, None), 0);
        assert_eq!(bps.trigger_at(BreakpointKind::Execute, 0x150), 0);
        assert_eq!(count.load(Ordering::SeqCst), 2);
    }

    #[test]
    fn write_value_is_visible_to_callback() {
        let bps = Breakpoints::new();
        let seen = Arc::new(Mutex::new(None));
        let s = seen.clone();
        bps.insert(
            Breakpoint::new(BreakpointKind::Write, BreakpointTarget::Address(0x500))
                .with_callback(move |hit| *s.lock().unwrap() = hit.value)
        ).unwrap();

        bps.trigger(BreakpointKind::Write, 0x500..=0x500, Some(0xAB));
        assert_eq!(*seen.lock().unwrap(), Some(0xAB));
    }

    #[test]
    fn toggling_disarms() {
        let bps = Breakpoints::new();
        let id = bps.insert(Breakpoint::new(BreakpointKind::Read, BreakpointTarget::Address(7))).unwrap();
        assert!(bps.is_armed(BreakpointKind::Read));
        assert!(bps.toggle(id, false));
        assert!(!bps.is_armed(BreakpointKind::Read));
        assert_eq!(bps.trigger_at(BreakpointKind::Read, 7), 0);
        assert!(bps.toggle(id, true));
        assert_eq!(bps.trigger_at(BreakpointKind::Read, 7), 1);
        assert_eq!(bps.take_pending(), vec![PendingAction::Pause]);
        assert!(bps.take_pending().is_empty());
        assert!(bps.remove(id).is_some());
        assert!(!bps.toggle(id, true));
    }

    #[test]
    fn unsupported_combinations() {
        let bps = Breakpoints::new();
        let err = bps.insert(Breakpoint::new(BreakpointKind::MachineStop, BreakpointTarget::Address(0)))
            .unwrap_err();
        assert_eq!(err, BreakpointError::Unsupported {
            kind: BreakpointKind::MachineStop,
            target: BreakpointTarget::Address(0),
        });
        bps.insert(Breakpoint::new(BreakpointKind::Cycles, BreakpointTarget::Range(0..=1))).unwrap_err();
        bps.insert(Breakpoint::new(BreakpointKind::Read, BreakpointTarget::Always)).unwrap_err();
        assert!(bps.is_empty());
    }

    #[test]
    fn restore_context_is_queued() {
        let bps = Breakpoints::new();
        let ctx = ContextId::initial();
        bps.insert(
            Breakpoint::new(BreakpointKind::Execute, BreakpointTarget::Address(0x42))
                .one_shot()
                .with_action(BreakpointAction::RestoreContext(ctx))
        ).unwrap();
        bps.trigger_at(BreakpointKind::Execute, 0x42);
        assert_eq!(bps.take_pending(), vec![PendingAction::RestoreContext(ctx)]);
    }
}
