//! The [`Platform`] of an SEV-SNP guest running on real hardware.

use core::{arch::asm, ptr::NonNull};

use snp_types::{
    ghcb::{Ghcb, RmpPageSize, msr_protocol::GhcbProtocolMsr},
    pvalidate::PvalidateError,
};
use x86_64::{
    PhysAddr, VirtAddr,
    instructions::{hlt, interrupts},
    structures::paging::PhysFrame,
};

use crate::platform::Platform;

#[derive(Debug)]
pub struct SnpPlatform {
    ghcb: NonNull<Ghcb>,
    ghcb_frame: PhysFrame,
    physical_memory_offset: VirtAddr,
}

impl SnpPlatform {
    /// # Safety
    ///
    /// `ghcb` must point to the GHCB registered for the current vCPU and be
    /// mapped as shared memory, `ghcb_frame` must be its guest physical
    /// address and the GHCB MSR must contain that address. All physical
    /// memory must be mapped at `physical_memory_offset`, which must be
    /// 2MiB aligned.
    pub const unsafe fn new(
        ghcb: NonNull<Ghcb>,
        ghcb_frame: PhysFrame,
        physical_memory_offset: VirtAddr,
    ) -> Self {
        Self {
            ghcb,
            ghcb_frame,
            physical_memory_offset,
        }
    }
}

impl Platform for SnpPlatform {
    unsafe fn pvalidate(
        &mut self,
        address: PhysAddr,
        size: RmpPageSize,
        validate: bool,
    ) -> Result<bool, PvalidateError> {
        let address = self.physical_memory_offset + address.as_u64();
        let return_code: u64;
        let unchanged: u32;

        unsafe {
            asm!(
                "pvalidate",
                "setc cl",
                inout("rax") address.as_u64() => return_code,
                inout("ecx") u32::from(size == RmpPageSize::Size2MiB) => unchanged,
                in("edx") u32::from(validate),
                options(nostack),
            );
        }

        match PvalidateError::new(return_code as u32) {
            Some(err) => Err(err),
            None => Ok(unchanged == 0),
        }
    }

    fn ghcb(&mut self) -> (NonNull<Ghcb>, PhysFrame) {
        (self.ghcb, self.ghcb_frame)
    }

    fn read_ghcb_msr(&mut self) -> u64 {
        unsafe { GhcbProtocolMsr::MSR.read() }
    }

    unsafe fn write_ghcb_msr(&mut self, value: u64) {
        let mut msr = GhcbProtocolMsr::MSR;
        unsafe {
            msr.write(value);
        }
    }

    fn vmgexit(&mut self) {
        // LLVM doesn't support the `vmgexit` instruction
        unsafe { asm!("rep vmmcall", options(nostack, preserves_flags)) }
    }

    fn disable_interrupts(&mut self) -> bool {
        let enabled = interrupts::are_enabled();
        interrupts::disable();
        enabled
    }

    fn restore_interrupts(&mut self, enabled: bool) {
        if enabled {
            interrupts::enable();
        }
    }

    fn halt(&mut self) -> ! {
        loop {
            interrupts::disable();
            hlt();
        }
    }
}
