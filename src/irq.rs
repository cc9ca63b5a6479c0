//! Pending hardware interrupt requests.

use std::collections::VecDeque;

/// Queue of interrupt vectors raised by devices and not yet delivered.
///
/// A vector that is already pending is not queued a second time, like an
/// interrupt controller's request register.
#[derive(Debug, Default)]
pub struct InterruptRequests {
    pending: VecDeque<u8>,
}

impl InterruptRequests {
    pub fn new() -> Self {
        Self::default()
    }

    /// Requests delivery of `vector`.
    ///
    /// Returns `false` if the vector was already pending.
    pub fn raise(&mut self, vector: u8) -> bool {
        if self.pending.contains(&vector) {
            return false;
        }

        trace!("IRQ vector {:#04X} raised", vector);
        self.pending.push_back(vector);
        true
    }

    /// Removes and returns the oldest pending vector.
    pub fn take(&mut self) -> Option<u8> {
        self.pending.pop_front()
    }

    pub fn is_pending(&self) -> bool {
        !self.pending.is_empty()
    }

    pub fn len(&self) -> usize {
        self.pending.len()
    }

    pub fn is_empty(&self) -> bool {
        self.pending.is_empty()
    }
}
