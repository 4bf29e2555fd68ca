use log::{trace, warn};
use snp_types::{
    ghcb::{PageOperation, PageStateChangeEntry, RmpPageSize},
    pvalidate::PvalidateError,
};
use x86_64::{
    PhysAddr,
    structures::paging::{PageSize, Size2MiB, Size4KiB},
};

use crate::{error::PageStateError, platform::Platform};

/// Validate the entries that are assigned to the guest and invalidate the
/// ones that are given to the hypervisor.
///
/// A 2MiB entry that's backed by 4KiB RMP entries is split into 4KiB
/// pages.
///
/// # Safety
///
/// See [`Platform::pvalidate`].
pub(crate) unsafe fn pvalidate_entries<P>(
    platform: &mut P,
    entries: &[PageStateChangeEntry],
) -> Result<(), PageStateError>
where
    P: Platform,
{
    for (index, entry) in entries.iter().enumerate() {
        let validate = match entry.page_operation() {
            Ok(PageOperation::PageAssignmentPrivate) => true,
            Ok(PageOperation::PageAssignmentShared) => false,
            Err(_) => {
                return Err(PageStateError::MalformedEntry {
                    index,
                    entry: *entry,
                });
            }
        };
        let address = entry.start_address();
        let size = entry.page_size();

        match unsafe { platform.pvalidate(address, size, validate) } {
            Ok(changed) => log_unchanged(address, changed),
            Err(code)
                if code == PvalidateError::FAIL_SIZEMISMATCH && size == RmpPageSize::Size2MiB =>
            {
                warn!("{address:#x} is not backed by a 2MiB RMP entry, retrying with 4KiB pages");
                unsafe {
                    pvalidate_4kib_pages(platform, address, validate)?;
                }
            }
            Err(code) => {
                return Err(PageStateError::Validation {
                    address,
                    size,
                    validate,
                    code,
                });
            }
        }
    }
    Ok(())
}

/// Run `PVALIDATE` on each 4KiB page of the 2MiB page at `address`.
unsafe fn pvalidate_4kib_pages<P>(
    platform: &mut P,
    address: PhysAddr,
    validate: bool,
) -> Result<(), PageStateError>
where
    P: Platform,
{
    for i in 0..Size2MiB::SIZE / Size4KiB::SIZE {
        let address = address + i * Size4KiB::SIZE;
        let changed = unsafe { platform.pvalidate(address, RmpPageSize::Size4KiB, validate) }
            .map_err(|code| PageStateError::Validation {
                address,
                size: RmpPageSize::Size4KiB,
                validate,
                code,
            })?;
        log_unchanged(address, changed);
    }
    Ok(())
}

fn log_unchanged(address: PhysAddr, changed: bool) {
    if !changed {
        trace!("validated bit of {address:#x} was already in the requested state");
    }
}
