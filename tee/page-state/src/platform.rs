use core::ptr::NonNull;

use snp_types::{
    ghcb::{Ghcb, RmpPageSize},
    pvalidate::PvalidateError,
};
use x86_64::{PhysAddr, structures::paging::PhysFrame};

/// The primitives a page state change needs from the CPU and the hypervisor.
pub trait Platform {
    /// Execute `PVALIDATE` on the page at `address`.
    ///
    /// Returns whether the validated bit changed.
    ///
    /// # Safety
    ///
    /// Validating or invalidating memory changes what the guest observes
    /// when it accesses the page. The caller must ensure that no live data
    /// is lost or exposed by this.
    unsafe fn pvalidate(
        &mut self,
        address: PhysAddr,
        size: RmpPageSize,
        validate: bool,
    ) -> Result<bool, PvalidateError>;

    /// Returns a pointer to the GHCB of the current vCPU and its guest
    /// physical address.
    ///
    /// The GHCB must already be registered with the hypervisor and the GHCB
    /// MSR must point to it.
    fn ghcb(&mut self) -> (NonNull<Ghcb>, PhysFrame);

    fn read_ghcb_msr(&mut self) -> u64;

    /// # Safety
    ///
    /// The value must be a valid GHCB MSR protocol request or a GHCB
    /// address.
    unsafe fn write_ghcb_msr(&mut self, value: u64);

    /// Hand control to the hypervisor.
    fn vmgexit(&mut self);

    /// Disable interrupts and return whether they were enabled before.
    fn disable_interrupts(&mut self) -> bool;

    fn restore_interrupts(&mut self, enabled: bool);

    /// Stop executing forever.
    fn halt(&mut self) -> !;
}
