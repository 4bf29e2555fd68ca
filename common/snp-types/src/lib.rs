//! Wire formats used by an SEV-SNP guest to talk to the hypervisor and the
//! hardware about page states.
#![no_std]

use core::fmt;

use bytemuck::Zeroable;

pub mod ghcb;
pub mod intercept;
pub mod pvalidate;

/// Reserved bytes in a hardware-defined layout. Their Debug representation
/// is empty.
#[derive(Clone, Copy, Zeroable)]
#[repr(transparent)]
pub struct Reserved<const SIZE: usize>([u8; SIZE]);

impl<const SIZE: usize> Reserved<SIZE> {
    pub const ZERO: Self = Self([0; SIZE]);
}

impl<const SIZE: usize> fmt::Debug for Reserved<SIZE> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Reserved").finish_non_exhaustive()
    }
}
