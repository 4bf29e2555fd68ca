//! Change the state of guest memory between private and shared on SEV-SNP.
//!
//! Private memory is encrypted with the guest's key and has to be validated
//! before the guest can access it. Shared memory is accessible to the
//! hypervisor. Changing the state of a page takes two steps: the guest has
//! to update the validated bit in the RMP with `PVALIDATE` and the
//! hypervisor has to change the page's assignment in the RMP. The order of
//! these steps matters: the guest never has a validated page that's assigned
//! to the hypervisor.
//!
//! None of the failures can be recovered from. They are logged and the guest
//! is terminated.
#![cfg_attr(not(test), no_std)]

use core::slice;

use log::{debug, trace};
use snp_types::ghcb::{PageOperation, PageStateChangeEntry};
use x86_64::{
    PhysAddr,
    structures::paging::{PageSize, PhysFrame, Size4KiB},
};

pub use buffer::PageStateBuffer;
pub use error::{PageStateError, ScratchBufferError};
pub use platform::Platform;
pub use terminate::terminate;

mod buffer;
mod error;
mod ghcb;
#[cfg(test)]
mod mock;
mod platform;
mod pvalidate;
#[cfg(target_arch = "x86_64")]
pub mod snp;
mod terminate;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum MemoryState {
    /// Accessible to the hypervisor.
    Shared,
    /// Encrypted and validated.
    Private,
}

impl From<MemoryState> for PageOperation {
    fn from(state: MemoryState) -> Self {
        match state {
            MemoryState::Shared => Self::PageAssignmentShared,
            MemoryState::Private => Self::PageAssignmentPrivate,
        }
    }
}

/// Change the state of `page_count` 4KiB pages starting at `base`.
///
/// `buffer` holds the entries of each batch. If `use_large_entry` is set,
/// 2MiB aligned parts of the range are changed with 2MiB entries.
///
/// The guest is terminated if any part of the change fails.
///
/// # Safety
///
/// Making memory shared exposes its contents to the hypervisor and makes
/// them unreadable to the guest. Making memory private scrambles its
/// contents. The caller must ensure that no live data is in the range.
pub unsafe fn set_page_state<P>(
    platform: &mut P,
    base: PhysFrame,
    page_count: u64,
    state: MemoryState,
    use_large_entry: bool,
    buffer: &mut PageStateBuffer<'_>,
) where
    P: Platform,
{
    let res =
        unsafe { try_set_page_state(platform, base, page_count, state, use_large_entry, buffer) };
    if let Err(err) = res {
        terminate::fail(platform, err);
    }
}

unsafe fn try_set_page_state<P>(
    platform: &mut P,
    base: PhysFrame,
    page_count: u64,
    state: MemoryState,
    use_large_entry: bool,
    buffer: &mut PageStateBuffer<'_>,
) -> Result<(), PageStateError>
where
    P: Platform,
{
    let end = page_count
        .checked_mul(Size4KiB::SIZE)
        .and_then(|size| base.start_address().as_u64().checked_add(size))
        .and_then(|end| PhysAddr::try_new(end).ok())
        .ok_or(PageStateError::InvalidRange { base, page_count })?;
    let end = PhysFrame::containing_address(end);

    debug!(
        "changing {page_count} pages at {:#x} to {state:?} (large entries: {use_large_entry})",
        base.start_address()
    );

    let mut range = PhysFrame::range(base, end);
    while !range.is_empty() {
        range.start = buffer.fill(range, state, use_large_entry);
        let entries = buffer.entries();
        trace!("page state change batch of {} entries", entries.len());

        unsafe {
            change_entries(platform, entries, state)?;
        }
    }

    Ok(())
}

/// Change the state of a single page using the GHCB MSR protocol.
///
/// This works before a GHCB has been set up. The guest is terminated if the
/// change fails.
///
/// # Safety
///
/// See [`set_page_state`].
pub unsafe fn set_page_state_msr<P>(platform: &mut P, frame: PhysFrame, state: MemoryState)
where
    P: Platform,
{
    let res = unsafe { try_set_page_state_msr(platform, frame, state) };
    if let Err(err) = res {
        terminate::fail(platform, err);
    }
}

unsafe fn try_set_page_state_msr<P>(
    platform: &mut P,
    frame: PhysFrame,
    state: MemoryState,
) -> Result<(), PageStateError>
where
    P: Platform,
{
    debug!("changing {:#x} to {state:?}", frame.start_address());

    let entry = PageStateChangeEntry::new(state.into(), frame);
    let entries = slice::from_ref(&entry);
    match state {
        MemoryState::Shared => {
            unsafe { pvalidate::pvalidate_entries(platform, entries)? };
            ghcb::page_state_change_msr(platform, frame, state.into())
        }
        MemoryState::Private => {
            ghcb::page_state_change_msr(platform, frame, state.into())?;
            unsafe { pvalidate::pvalidate_entries(platform, entries) }
        }
    }
}

/// Run both halves of a page state change in the order that never leaves a
/// validated page assigned to the hypervisor.
unsafe fn change_entries<P>(
    platform: &mut P,
    entries: &[PageStateChangeEntry],
    state: MemoryState,
) -> Result<(), PageStateError>
where
    P: Platform,
{
    match state {
        MemoryState::Shared => {
            unsafe { pvalidate::pvalidate_entries(platform, entries)? };
            ghcb::page_state_change(platform, entries)
        }
        MemoryState::Private => {
            ghcb::page_state_change(platform, entries)?;
            unsafe { pvalidate::pvalidate_entries(platform, entries) }
        }
    }
}
