//! Numeric conversions that are either lossless on all supported platforms, or whose value range
//!  is guaranteed by the calling code.

pub trait SafeCast<T> {
    fn safe_cast(self) -> T;
}

impl SafeCast<usize> for u16 {
    fn safe_cast(self) -> usize {
        self as usize
    }
}

/// Narrowing casts for values whose range was checked before, e.g. payload lengths that were
///  validated against the maximum message size. Out-of-range values are a bug and panic.
pub trait PrecheckedCast<T> {
    fn prechecked_cast(self) -> T;
}
impl PrecheckedCast<u16> for usize {
    fn prechecked_cast(self) -> u16 {
        self.try_into().expect("value range should have been checked by the caller")
    }
}
impl PrecheckedCast<u64> for u128 {
    fn prechecked_cast(self) -> u64 {
        self.try_into().expect("value range should have been checked by the caller")
    }
}
