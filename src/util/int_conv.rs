//! Integer conversions between wire format fields (`u32`), in-memory lengths (`usize`) and
//!  counters (`u64`).

/// Conversions that never lose information on the platforms this crate supports, but that `From`
///  does not offer because they depend on the pointer width
pub trait Widen<T> {
    fn widen(self) -> T;
}

#[cfg(any(target_pointer_width = "32", target_pointer_width = "64"))]
impl Widen<usize> for u32 {
    fn widen(self) -> usize {
        self as usize
    }
}

#[cfg(any(target_pointer_width = "32", target_pointer_width = "64"))]
impl Widen<u64> for usize {
    fn widen(self) -> u64 {
        self as u64
    }
}

/// Narrowing conversion for values whose range was checked before, e.g. a frame size validated
///  against the `u32` size field. A value out of range is a bug, and the conversion panics.
pub trait Narrow<T> {
    fn narrow(self) -> T;
}

impl Narrow<u32> for usize {
    #[track_caller]
    fn narrow(self) -> u32 {
        match u32::try_from(self) {
            Ok(v) => v,
            Err(_) => panic!("this is a bug: {} should have been checked to fit a u32", self),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_widen() {
        let len: usize = u32::MAX.widen();
        assert_eq!(len, 4_294_967_295);
        let counter: u64 = 17usize.widen();
        assert_eq!(counter, 17);
    }

    #[test]
    fn test_narrow() {
        let field: u32 = 65_536usize.narrow();
        assert_eq!(field, 65_536);
    }

    #[cfg(target_pointer_width = "64")]
    #[test]
    #[should_panic]
    fn test_narrow_out_of_range() {
        let _: u32 = (u32::MAX as usize + 1).narrow();
    }
}
