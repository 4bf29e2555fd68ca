//! A fake vCPU and hypervisor that record what the guest asks them to do.

use std::{
    collections::BTreeSet,
    mem::offset_of,
    num::NonZeroU32,
    panic::{AssertUnwindSafe, catch_unwind},
    ptr::NonNull,
};

use bytemuck::from_bytes_mut;
use snp_types::{
    ghcb::{
        Ghcb, GhcbUsage, PageOperation, PageStateChangeEntry, PageStateChangeHeader,
        PageStateChangeRequest, ProtocolVersion, RmpPageSize,
        msr_protocol::{GhcbInfo, TerminateReasonCode},
    },
    intercept::VMEXIT_PSC,
    pvalidate::PvalidateError,
};
use x86_64::{PhysAddr, structures::paging::PhysFrame};

use crate::platform::Platform;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Event {
    Pvalidate {
        address: u64,
        size: RmpPageSize,
        validate: bool,
    },
    /// The guest submitted a page state change request in the GHCB.
    PscExit { cur_entry: u16, end_entry: u16 },
    /// The hypervisor assigned a page.
    Assign {
        address: u64,
        size: RmpPageSize,
        operation: PageOperation,
    },
    InterruptsDisabled,
    InterruptsRestored(bool),
    Terminate(TerminateReasonCode),
}

impl Event {
    pub fn pvalidate(address: u64, size: RmpPageSize, validate: bool) -> Self {
        Self::Pvalidate {
            address,
            size,
            validate,
        }
    }

    pub fn assign(address: u64, size: RmpPageSize, operation: PageOperation) -> Self {
        Self::Assign {
            address,
            size,
            operation,
        }
    }
}

pub struct MockPlatform {
    ghcb: NonNull<Ghcb>,
    pub ghcb_frame: PhysFrame,
    pub ghcb_msr: u64,
    pub interrupts_enabled: bool,
    pub events: Vec<Event>,
    /// 2MiB pages that are backed by 4KiB RMP entries.
    pub small_rmp_regions: BTreeSet<u64>,
    /// Pages that fail `PVALIDATE` with `FAIL_INPUT`.
    pub bad_addresses: BTreeSet<u64>,
    /// The number of entries the hypervisor processes per exit.
    pub entries_per_exit: usize,
    /// The number of 4KiB pages the hypervisor processes per exit, tracked
    /// in the current page field of the entries.
    pub pages_per_exit: Option<u16>,
    pub exit_info1: u64,
    pub exit_info2: u64,
    /// The header the hypervisor writes back instead of making progress.
    pub header_override: Option<PageStateChangeHeader>,
    /// The error code returned for MSR protocol page state changes.
    pub msr_psc_error: u32,
    /// Replaces the MSR protocol page state change response.
    pub msr_response: Option<u64>,
}

impl MockPlatform {
    pub fn new() -> Self {
        let ghcb = NonNull::from(Box::leak(Box::new(Ghcb::ZERO)));
        let ghcb_frame = PhysFrame::containing_address(PhysAddr::new(0x7fff_f000));
        Self {
            ghcb,
            ghcb_frame,
            ghcb_msr: u64::from(GhcbInfo::GhcbGuestPhysicalAddress {
                address: ghcb_frame,
            }),
            interrupts_enabled: true,
            events: Vec::new(),
            small_rmp_regions: BTreeSet::new(),
            bad_addresses: BTreeSet::new(),
            entries_per_exit: usize::MAX,
            pages_per_exit: None,
            exit_info1: 0,
            exit_info2: 0,
            header_override: None,
            msr_psc_error: 0,
            msr_response: None,
        }
    }

    /// Handle a page state change request in the GHCB.
    fn handle_ghcb_exit(&mut self) {
        let ghcb = unsafe { &mut *self.ghcb.as_ptr() };

        assert_eq!(ghcb.protocol_version, ProtocolVersion::VERSION2);
        assert_eq!(ghcb.ghcb_usage, GhcbUsage::AMD_STANDARD);
        assert_eq!(ghcb.sw_exit_code, VMEXIT_PSC);
        for offset in [
            offset_of!(Ghcb, sw_exit_code),
            offset_of!(Ghcb, sw_exit_info1),
            offset_of!(Ghcb, sw_exit_info2),
            offset_of!(Ghcb, sw_scratch),
        ] {
            assert!(ghcb.is_valid(offset), "{offset:#x} is not marked valid");
        }
        assert_eq!(
            ghcb.sw_scratch,
            self.ghcb_frame.start_address().as_u64() + offset_of!(Ghcb, shared_buffer) as u64
        );

        let request = from_bytes_mut::<PageStateChangeRequest>(&mut ghcb.shared_buffer);
        let header = request.header;
        self.events.push(Event::PscExit {
            cur_entry: header.cur_entry,
            end_entry: header.end_entry,
        });

        ghcb.valid_bitmap = 0;
        ghcb.sw_exit_info1 = self.exit_info1;
        ghcb.sw_exit_info2 = self.exit_info2;
        if self.exit_info1 != 0 || self.exit_info2 != 0 {
            return;
        }
        if let Some(header) = self.header_override {
            request.header = header;
            return;
        }

        let mut cur_entry = usize::from(header.cur_entry);
        let end_entry = usize::from(header.end_entry);
        let mut budget = self.entries_per_exit;
        let mut page_budget = self.pages_per_exit;
        while cur_entry <= end_entry && budget > 0 {
            let entry = request.entries[cur_entry];
            if let Some(page_budget) = page_budget.as_mut() {
                let pages = (entry.page_size().size() / 0x1000) as u16;
                let step = (pages - entry.current_page()).min(*page_budget);
                *page_budget -= step;
                let current_page = entry.current_page() + step;
                request.entries[cur_entry] = PageStateChangeEntry::from_bits(
                    (entry.bits() & !0xfff) | u64::from(current_page),
                );
                if current_page < pages {
                    break;
                }
            }
            self.events.push(Event::assign(
                entry.start_address().as_u64(),
                entry.page_size(),
                entry.page_operation().unwrap(),
            ));
            cur_entry += 1;
            budget -= 1;
        }
        request.header.cur_entry = cur_entry as u16;
    }
}

impl Drop for MockPlatform {
    fn drop(&mut self) {
        drop(unsafe { Box::from_raw(self.ghcb.as_ptr()) });
    }
}

impl Platform for MockPlatform {
    unsafe fn pvalidate(
        &mut self,
        address: PhysAddr,
        size: RmpPageSize,
        validate: bool,
    ) -> Result<bool, PvalidateError> {
        let address = address.as_u64();
        self.events.push(Event::pvalidate(address, size, validate));

        if self.bad_addresses.contains(&address) {
            return Err(PvalidateError::FAIL_INPUT);
        }
        if size == RmpPageSize::Size2MiB && self.small_rmp_regions.contains(&address) {
            return Err(PvalidateError::FAIL_SIZEMISMATCH);
        }
        Ok(true)
    }

    fn ghcb(&mut self) -> (NonNull<Ghcb>, PhysFrame) {
        (self.ghcb, self.ghcb_frame)
    }

    fn read_ghcb_msr(&mut self) -> u64 {
        self.ghcb_msr
    }

    unsafe fn write_ghcb_msr(&mut self, value: u64) {
        self.ghcb_msr = value;
    }

    fn vmgexit(&mut self) {
        match GhcbInfo::try_from(self.ghcb_msr) {
            Ok(GhcbInfo::GhcbGuestPhysicalAddress { address }) => {
                assert_eq!(address, self.ghcb_frame);
                assert!(!self.interrupts_enabled, "GHCB used with interrupts enabled");
                self.handle_ghcb_exit();
            }
            Ok(GhcbInfo::SnpPageStateChangeRequest { operation, address }) => {
                self.events.push(Event::assign(
                    address.start_address().as_u64(),
                    RmpPageSize::Size4KiB,
                    operation,
                ));
                self.ghcb_msr = self.msr_response.unwrap_or_else(|| {
                    u64::from(GhcbInfo::SnpPageStateChangeResponse {
                        error_code: NonZeroU32::new(self.msr_psc_error),
                    })
                });
            }
            Ok(GhcbInfo::TerminationRequest { reason_code }) => {
                self.events.push(Event::Terminate(reason_code));
            }
            other => panic!("unexpected GHCB MSR value {:#x}: {other:?}", self.ghcb_msr),
        }
    }

    fn disable_interrupts(&mut self) -> bool {
        self.events.push(Event::InterruptsDisabled);
        core::mem::replace(&mut self.interrupts_enabled, false)
    }

    fn restore_interrupts(&mut self, enabled: bool) {
        self.events.push(Event::InterruptsRestored(enabled));
        if enabled {
            self.interrupts_enabled = true;
        }
    }

    fn halt(&mut self) -> ! {
        panic!("guest halted")
    }
}

/// Run `f` and check that it ends by halting the vCPU.
pub fn assert_halts<F>(f: F)
where
    F: FnOnce(),
{
    let Err(payload) = catch_unwind(AssertUnwindSafe(f)) else {
        panic!("the vCPU didn't halt");
    };
    assert_eq!(payload.downcast_ref::<&str>(), Some(&"guest halted"));
}
