//! Page state change requests to the hypervisor.

use core::mem::{offset_of, size_of_val};

use bit_field::BitField;
use bytemuck::Zeroable;
use log::trace;
use snp_types::{
    ghcb::{
        Ghcb, GhcbUsage, PSC_MAX_ENTRIES, PageOperation, PageStateChangeEntry,
        PageStateChangeHeader, PageStateChangeRequest, ProtocolVersion,
        msr_protocol::GhcbInfo,
    },
    intercept::VMEXIT_PSC,
};
use volatile::{VolatilePtr, map_field};
use x86_64::structures::paging::PhysFrame;

use crate::{error::PageStateError, platform::Platform};

/// The number of exits without progress after which a request is considered
/// stuck.
const PSC_RETRY_LIMIT: Option<usize> = if cfg!(feature = "psc-retry-limit") {
    Some(0x10000)
} else {
    None
};

/// A macro to write to a field of the GHCB and also mark it in the valid
/// bitmap.
macro_rules! ghcb_write {
    ($ghcb:ident.$field:ident = $value:expr) => {{
        let value = $value;
        let bit_offset_start = offset_of!(Ghcb, $field);
        let bit_offset_end = bit_offset_start + size_of_val(&value);
        map_field!($ghcb.$field).write(value);
        map_field!($ghcb.valid_bitmap).update(|mut value| {
            for i in bit_offset_start / 8..bit_offset_end / 8 {
                value.set_bit(i, true);
            }
            value
        });
    }};
}

/// Exclusive use of the GHCB with interrupts masked.
///
/// Interrupts are restored when the session is dropped.
struct GhcbSession<'a, P>
where
    P: Platform,
{
    platform: &'a mut P,
    ghcb: VolatilePtr<'a, Ghcb>,
    frame: PhysFrame,
    interrupts_enabled: bool,
}

impl<'a, P> GhcbSession<'a, P>
where
    P: Platform,
{
    fn open(platform: &'a mut P) -> Self {
        let interrupts_enabled = platform.disable_interrupts();
        let (ghcb, frame) = platform.ghcb();
        let ghcb = unsafe { VolatilePtr::new(ghcb) };

        ghcb.write(Ghcb::ZERO);
        map_field!(ghcb.protocol_version).write(ProtocolVersion::VERSION2);
        map_field!(ghcb.ghcb_usage).write(GhcbUsage::AMD_STANDARD);

        Self {
            platform,
            ghcb,
            frame,
            interrupts_enabled,
        }
    }

    /// Returns a pointer to the shared buffer interpreted as a page state
    /// change request.
    fn request(&self) -> VolatilePtr<'a, PageStateChangeRequest> {
        let ghcb = self.ghcb;
        let shared_buffer = map_field!(ghcb.shared_buffer);
        // The request has the size of the shared buffer and the shared
        // buffer is 8-byte aligned.
        unsafe { shared_buffer.map(|ptr| ptr.cast()) }
    }

    /// Returns a pointer to an entry in the shared buffer.
    fn entry(&self, index: usize) -> VolatilePtr<'a, PageStateChangeEntry> {
        debug_assert!(index < PSC_MAX_ENTRIES);
        let request = self.request();
        let entries = map_field!(request.entries);
        unsafe { entries.map(|ptr| ptr.cast::<PageStateChangeEntry>().add(index)) }
    }

    /// Submit entries to the hypervisor and wait until it has processed all
    /// of them.
    fn page_state_change(
        &mut self,
        entries: &[PageStateChangeEntry],
    ) -> Result<(), PageStateError> {
        if entries.len() > PSC_MAX_ENTRIES {
            return Err(PageStateError::Overflow {
                entries: entries.len(),
            });
        }
        let Some(end_entry) = entries.len().checked_sub(1) else {
            return Ok(());
        };

        let mut request = PageStateChangeRequest::zeroed();
        request.header = PageStateChangeHeader::new(0, end_entry as u16);
        request.entries[..entries.len()].copy_from_slice(entries);

        let request_ptr = self.request();
        request_ptr.write(request);

        let shared_buffer_addr =
            self.frame.start_address().as_u64() + offset_of!(Ghcb, shared_buffer) as u64;

        let mut header = request.header;
        // Exits since the hypervisor last processed an entry or a page of
        // an entry.
        let mut exits = 0;
        while !header.is_complete() {
            if let Some(limit) = PSC_RETRY_LIMIT {
                if exits >= limit {
                    return Err(PageStateError::Stalled { exits });
                }
            }

            let current = self.entry(usize::from(header.cur_entry));
            let current_before = current.read();

            let ghcb = self.ghcb;
            ghcb_write!(ghcb.sw_exit_code = VMEXIT_PSC);
            ghcb_write!(ghcb.sw_exit_info1 = 0);
            ghcb_write!(ghcb.sw_exit_info2 = 0);
            ghcb_write!(ghcb.sw_scratch = shared_buffer_addr);

            trace!(
                "page state change exit: entries {}..={}",
                header.cur_entry, header.end_entry
            );
            self.platform.vmgexit();
            exits += 1;

            let status = map_field!(ghcb.sw_exit_info1).read();
            if status.get_bits(0..=31) != 0 {
                return Err(PageStateError::Transport { status });
            }
            let exit_info2 = map_field!(ghcb.sw_exit_info2).read();
            if exit_info2 != 0 {
                return Err(PageStateError::Protocol { exit_info2 });
            }

            let after = map_field!(request_ptr.header).read();
            if after.end_entry != header.end_entry || after.cur_entry < header.cur_entry {
                return Err(PageStateError::HeaderRegressed {
                    before: header,
                    after,
                });
            }
            if after != header || current.read() != current_before {
                exits = 0;
            }
            header = after;
        }

        Ok(())
    }
}

impl<P> Drop for GhcbSession<'_, P>
where
    P: Platform,
{
    fn drop(&mut self) {
        self.platform.restore_interrupts(self.interrupts_enabled);
    }
}

/// Ask the hypervisor to assign the pages described by `entries`.
///
/// The entries are sent in as many requests as needed.
pub(crate) fn page_state_change<P>(
    platform: &mut P,
    entries: &[PageStateChangeEntry],
) -> Result<(), PageStateError>
where
    P: Platform,
{
    page_state_change_chunked(platform, entries, PSC_MAX_ENTRIES)
}

fn page_state_change_chunked<P>(
    platform: &mut P,
    entries: &[PageStateChangeEntry],
    entries_per_request: usize,
) -> Result<(), PageStateError>
where
    P: Platform,
{
    for chunk in entries.chunks(entries_per_request) {
        let mut session = GhcbSession::open(platform);
        session.page_state_change(chunk)?;
    }
    Ok(())
}

/// Ask the hypervisor to assign a single 4KiB page using the GHCB MSR
/// protocol.
///
/// This doesn't need a GHCB page.
pub(crate) fn page_state_change_msr<P>(
    platform: &mut P,
    address: PhysFrame,
    operation: PageOperation,
) -> Result<(), PageStateError>
where
    P: Platform,
{
    let interrupts_enabled = platform.disable_interrupts();

    // Save the GHCB MSR.
    let prev_value = platform.read_ghcb_msr();

    // Write the request.
    let request = u64::from(GhcbInfo::SnpPageStateChangeRequest { operation, address });
    unsafe { platform.write_ghcb_msr(request) }

    // Execute the request.
    platform.vmgexit();

    // Read the response.
    let response = platform.read_ghcb_msr();

    // Restore the GHCB MSR.
    unsafe { platform.write_ghcb_msr(prev_value) }
    platform.restore_interrupts(interrupts_enabled);

    // Verify the response.
    match GhcbInfo::try_from(response) {
        Ok(GhcbInfo::SnpPageStateChangeResponse { error_code: None }) => Ok(()),
        Ok(GhcbInfo::SnpPageStateChangeResponse {
            error_code: Some(error_code),
        }) => Err(PageStateError::MsrProtocol {
            address,
            error_code,
        }),
        _ => Err(PageStateError::UnexpectedResponse { response }),
    }
}
