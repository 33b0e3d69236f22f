//! Number formatting for store values
//!
//! Downstream consumers parse scalar strings, so formatting is part of the
//! wire contract: numerics are written with six-decimal precision, booleans
//! as `"0"`/`"1"`. `itoa`/`ryu` cover the integer and shortest-float paths
//! without heap churn.

use bytes::Bytes;
use std::fmt::Write;

/// Format a numeric sample value with six-decimal precision (`"%.6f"`).
#[inline]
pub fn fixed6(value: f64) -> Bytes {
    let mut s = String::with_capacity(24);
    // write! to a String cannot fail
    let _ = write!(s, "{value:.6}");
    Bytes::from(s)
}

/// Format a boolean sample value as `"0"` / `"1"`.
#[inline]
pub fn bool_str(value: bool) -> Bytes {
    if value {
        Bytes::from_static(b"1")
    } else {
        Bytes::from_static(b"0")
    }
}

/// Convert an integer to Bytes using a stack buffer.
#[inline]
pub fn int_bytes(n: i64) -> Bytes {
    let mut buffer = itoa::Buffer::new();
    Bytes::copy_from_slice(buffer.format(n).as_bytes())
}

/// Shortest round-trip representation of a float (status records, debugging).
#[inline]
pub fn f64_shortest(n: f64) -> Bytes {
    let mut buffer = ryu::Buffer::new();
    Bytes::copy_from_slice(buffer.format(n).as_bytes())
}
