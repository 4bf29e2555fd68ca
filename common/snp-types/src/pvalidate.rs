//! Return codes of the `PVALIDATE` instruction.

use core::{fmt, num::NonZeroU32};

/// A non-zero return code of `PVALIDATE`.
#[derive(Clone, Copy, PartialEq, Eq)]
#[repr(transparent)]
pub struct PvalidateError(NonZeroU32);

impl PvalidateError {
    /// The input operands were invalid, e.g. a misaligned address.
    pub const FAIL_INPUT: Self = Self::from_code(1);
    /// The page size doesn't match the size of the RMP entry.
    pub const FAIL_SIZEMISMATCH: Self = Self::from_code(6);

    const fn from_code(code: u32) -> Self {
        match NonZeroU32::new(code) {
            Some(code) => Self(code),
            None => panic!("zero is not an error code"),
        }
    }

    /// Interpret the value left in `eax` by `PVALIDATE`.
    pub const fn new(return_code: u32) -> Option<Self> {
        match NonZeroU32::new(return_code) {
            Some(code) => Some(Self(code)),
            None => None,
        }
    }

    pub const fn code(self) -> u32 {
        self.0.get()
    }
}

impl fmt::Debug for PvalidateError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        if *self == Self::FAIL_INPUT {
            f.pad("FAIL_INPUT")
        } else if *self == Self::FAIL_SIZEMISMATCH {
            f.pad("FAIL_SIZEMISMATCH")
        } else {
            write!(f, "PvalidateError({})", self.0)
        }
    }
}

impl fmt::Display for PvalidateError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{self:?} ({})", self.code())
    }
}
