//! Timer devices ticked once per executed instruction.

use crate::irq::InterruptRequests;

/// Vector raised by the programmable interval timer (IRQ 0).
pub const PIT_VECTOR: u8 = 0x08;

/// A device that advances with emulated time.
pub trait Timer: Send {
    /// Advances the device by one instruction.
    fn tick(&mut self, irqs: &mut InterruptRequests);
}

/// A timer that never fires.
#[derive(Debug, Default)]
pub struct NullTimer;

impl Timer for NullTimer {
    fn tick(&mut self, _irqs: &mut InterruptRequests) {}
}

/// Programmable interval timer, channel 0.
///
/// Time is measured in executed instructions: every `divisor` ticks, the
/// timer requests interrupt `PIT_VECTOR`.
#[derive(Debug)]
pub struct Pit {
    divisor: u32,
    counter: u32,
    fired: u64,
}

impl Pit {
    /// Creates a timer firing every `divisor` instructions.
    ///
    /// A divisor of 0 is treated like 65536, the value a real 8253 uses for
    /// a programmed count of 0.
    pub fn new(divisor: u32) -> Self {
        let divisor = if divisor == 0 { 0x1_0000 } else { divisor };
        Self {
            divisor,
            counter: divisor,
            fired: 0,
        }
    }

    pub fn divisor(&self) -> u32 {
        self.divisor
    }

    /// Number of interrupts requested so far.
    pub fn fired(&self) -> u64 {
        self.fired
    }
}

impl Timer for Pit {
    fn tick(&mut self, irqs: &mut InterruptRequests) {
        self.counter -= 1;
        if self.counter == 0 {
            self.counter = self.divisor;
            self.fired += 1;
            irqs.raise(PIT_VECTOR);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn pit_fires_every_divisor_ticks() {
        let mut pit = Pit::new(3);
        let mut irqs = InterruptRequests::new();
        pit.tick(&mut irqs);
        pit.tick(&mut irqs);
        assert!(irqs.is_empty());
        pit.tick(&mut irqs);
        assert_eq!(irqs.take(), Some(PIT_VECTOR));
        for _ in 0..6 {
            pit.tick(&mut irqs);
        }
        // undelivered requests don't pile up
        assert_eq!(irqs.len(), 1);
        assert_eq!(pit.fired(), 3);
    }

    #[test]
    fn zero_divisor() {
        assert_eq!(Pit::new(0).divisor(), 0x1_0000);
    }
}
