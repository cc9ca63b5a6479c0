//! 8086 status and control flags (`FLAGS`).

bitflags! {
    /// A bitmask carrying any combination of x86 flags.
    ///
    /// Bit positions match the `FLAGS` register, so the value can be pushed
    /// and popped directly (see `to_word`/`from_word`).
    pub struct Flags: u16 {
        /// Carry flag.
        const CF = 1 << 0;
        /// Parity flag.
        ///
        /// Set if the low byte of the result has an even number of 1-bits.
        const PF = 1 << 2;
        /// Adjust flag (or Auxiliary Carry Flag).
        ///
        /// Set to whether a carry from the lower 4 bits of an operation has
        /// been generated.
        const AF = 1 << 4;
        /// Zero flag.
        ///
        /// Set to whether the result of an operation consists entirely of
        /// 0-bits.
        const ZF = 1 << 6;
        /// Sign flag.
        const SF = 1 << 7;
        /// Trap flag (single-step interrupt after each instruction).
        const TF = 1 << 8;
        /// Interrupt enable flag.
        const IF = 1 << 9;
        /// Direction flag for string instructions.
        const DF = 1 << 10;
        /// Overflow.
        const OF = 1 << 11;
    }
}

/// Bits that always read as 1 on an 8086 (reserved bit 1 and bits 12-15).
const FIXED_ONES: u16 = 0xF002;

impl Flags {
    /// The value pushed by `pushf`.
    pub fn to_word(self) -> u16 {
        self.bits() | FIXED_ONES
    }

    /// Loads the flags from a value popped by `popf`/`iret`.
    pub fn from_word(word: u16) -> Self {
        Flags::from_bits_truncate(word)
    }

    /// The flags `lahf`/`sahf` transfer through `AH`.
    pub fn low_byte() -> Self {
        Flags::SF | Flags::ZF | Flags::AF | Flags::PF | Flags::CF
    }
}

impl Default for Flags {
    fn default() -> Self {
        Flags::empty()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn word_round_trip() {
        let flags = Flags::CF | Flags::IF | Flags::OF;
        assert_eq!(flags.to_word(), 0xFA03);
        assert_eq!(Flags::from_word(flags.to_word()), flags);
        assert_eq!(Flags::from_word(0xFFFF), Flags::all());
    }
}
