//! Instruction prefix byte decoding.

use crate::cpu::instr::{RepPrefix, Segment};

bitflags! {
    /// Bitmask of raw instruction prefixes.
    ///
    /// Their meaning depends on the instruction opcode. In (dis)assembly, not
    /// all prefixes show up as actual prefix words before the mnemonic.
    ///
    /// We collect prefix bytes in this bitmask and later build a completed
    /// instruction with instruction-specific prefix from this. If several
    /// segment overrides are given, the last one wins.
    pub struct RawPrefixes: u8 {
        /// `0xF0`
        const LOCK        = 0x01;
        /// `0xF2`
        const REPNE       = 0x02;
        /// `0xF3` - `rep` or `repe` prefix, depending on the instruction.
        const REP_REPE    = 0x04;
        /// `0x26`
        const OVERRIDE_ES = 0x10;
        /// `0x2E` - Use CS instead of the instruction's default segment.
        const OVERRIDE_CS = 0x20;
        /// `0x36`
        const OVERRIDE_SS = 0x40;
        /// `0x3E` - Use DS instead of the instruction's default segment.
        const OVERRIDE_DS = 0x80;
    }
}

const SEGMENT_OVERRIDES: RawPrefixes = RawPrefixes {
    bits: 0xF0,
};

impl RawPrefixes {
    /// Decodes a prefix byte and merges it with `self`.
    ///
    /// Returns `Ok` when the byte is a valid prefix, and `Err` if not.
    pub fn decode(self, prefix: u8) -> Result<Self, Self> {
        let new = match prefix {
            0xF0 => RawPrefixes::LOCK,
            0xF3 => RawPrefixes::REP_REPE,
            0xF2 => RawPrefixes::REPNE,
            0x26 => RawPrefixes::OVERRIDE_ES,
            0x2E => RawPrefixes::OVERRIDE_CS,
            0x36 => RawPrefixes::OVERRIDE_SS,
            0x3E => RawPrefixes::OVERRIDE_DS,
            _ => return Err(self),
        };

        if new.intersects(SEGMENT_OVERRIDES) {
            Ok((self - SEGMENT_OVERRIDES) | new)
        } else if new.intersects(RawPrefixes::REP_REPE | RawPrefixes::REPNE) {
            Ok((self - (RawPrefixes::REP_REPE | RawPrefixes::REPNE)) | new)
        } else {
            Ok(self | new)
        }
    }

    /// Returns the segment to use, applying and removing a segment override
    /// prefix if there is one.
    pub fn segment(&mut self, default: Segment) -> Segment {
        if self.take(RawPrefixes::OVERRIDE_ES) {
            Segment::Es
        } else if self.take(RawPrefixes::OVERRIDE_CS) {
            Segment::Cs
        } else if self.take(RawPrefixes::OVERRIDE_SS) {
            Segment::Ss
        } else if self.take(RawPrefixes::OVERRIDE_DS) {
            Segment::Ds
        } else {
            default
        }
    }

    /// Takes the repeat prefix, if any.
    pub fn rep(&mut self) -> Option<RepPrefix> {
        if self.take(RawPrefixes::REP_REPE) {
            Some(RepPrefix::Rep)
        } else if self.take(RawPrefixes::REPNE) {
            Some(RepPrefix::Repne)
        } else {
            None
        }
    }

    /// If `self` contains `other`, removes `other` from `self` and returns
    /// `true`.
    pub fn take(&mut self, other: RawPrefixes) -> bool {
        if self.contains(other) {
            self.remove(other);
            true
        } else {
            false
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn collect(bytes: &[u8]) -> RawPrefixes {
        bytes.iter().fold(RawPrefixes::empty(), |p, b| p.decode(*b).unwrap())
    }

    #[test]
    fn last_segment_override_wins() {
        let mut p = collect(&[0x26, 0x2E]);
        assert_eq!(p.segment(Segment::Ds), Segment::Cs);
        assert!(p.is_empty());
    }

    #[test]
    fn rep_prefixes() {
        let mut p = collect(&[0xF2, 0xF3, 0xF0]);
        assert_eq!(p.rep(), Some(RepPrefix::Rep));
        assert_eq!(p, RawPrefixes::LOCK);
        assert!(RawPrefixes::empty().decode(0x90).is_err());
        assert!(RawPrefixes::empty().decode(0x66).is_err());
    }
}
