//! Small helpers shared by the library and the binaries.

use std::fmt;
use std::num::ParseIntError;
use std::ops::{Deref, DerefMut};

/// Wraps any value and suppresses its debug output when printed with `{:?}`.
///
/// Used for boxed callbacks and device trait objects embedded in structures
/// that should still implement `Debug`.
pub struct NoDebug<T>(pub T);

impl<T> fmt::Debug for NoDebug<T> {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        f.write_str("(debug output omitted)")
    }
}

impl<T> Deref for NoDebug<T> {
    type Target = T;

    fn deref(&self) -> &T {
        &self.0
    }
}

impl<T> DerefMut for NoDebug<T> {
    fn deref_mut(&mut self) -> &mut T {
        &mut self.0
    }
}

impl<T> From<T> for NoDebug<T> {
    fn from(t: T) -> Self {
        NoDebug(t)
    }
}

/// Parses a number that might be hexadecimal (`0x` prefix or `h` suffix).
pub fn parse_number(src: &str) -> Result<u32, ParseIntError> {
    if src.starts_with("0x") || src.starts_with("0X") {
        u32::from_str_radix(&src[2..], 16)
    } else if src.ends_with('h') || src.ends_with('H') {
        u32::from_str_radix(&src[..src.len() - 1], 16)
    } else {
        src.parse()
    }
}

/// Parses a `segment:offset` pair of hexadecimal numbers.
pub fn parse_segmented(src: &str) -> Result<(u16, u16), String> {
    let mut parts = src.splitn(2, ':');
    let seg = parts.next().unwrap_or("");
    let off = parts.next().ok_or_else(|| format!("expected SEGMENT:OFFSET, got '{}'", src))?;
    let parse = |s: &str| u16::from_str_radix(s, 16).map_err(|e| format!("invalid number '{}': {}", s, e));
    Ok((parse(seg)?, parse(off)?))
}
