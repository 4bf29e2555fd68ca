use core::num::NonZeroU32;

use snp_types::{
    ghcb::{PageStateChangeEntry, PageStateChangeHeader, RmpPageSize},
    pvalidate::PvalidateError,
};
use thiserror::Error;
use x86_64::{PhysAddr, structures::paging::PhysFrame};

/// A failure while changing the state of memory.
///
/// None of these are recoverable: once one occurs the guest no longer knows
/// the state of its memory and has to be terminated.
#[derive(Debug, Error)]
pub enum PageStateError {
    #[error("PVALIDATE (validate={validate}) failed for {address:#x} ({size:?}): {code}")]
    Validation {
        address: PhysAddr,
        size: RmpPageSize,
        validate: bool,
        code: PvalidateError,
    },
    #[error("entry {index} has an invalid operation: {entry:?}")]
    MalformedEntry {
        index: usize,
        entry: PageStateChangeEntry,
    },
    #[error("VMGEXIT failed with status {status:#x}")]
    Transport { status: u64 },
    #[error("the hypervisor rejected the page state change: {exit_info2:#x}")]
    Protocol { exit_info2: u64 },
    #[error("the hypervisor corrupted the page state change header: {before:?} -> {after:?}")]
    HeaderRegressed {
        before: PageStateChangeHeader,
        after: PageStateChangeHeader,
    },
    #[error("{entries} entries don't fit into a single page state change request")]
    Overflow { entries: usize },
    #[error("the hypervisor made no progress after {exits} exits")]
    Stalled { exits: usize },
    #[error("{page_count} pages starting at {base:?} exceed the physical address space")]
    InvalidRange { base: PhysFrame, page_count: u64 },
    #[error("the hypervisor failed to change the state of {address:?}: error code {error_code}")]
    MsrProtocol {
        address: PhysFrame,
        error_code: NonZeroU32,
    },
    #[error("unexpected GHCB MSR protocol response: {response:#x}")]
    UnexpectedResponse { response: u64 },
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Error)]
pub enum ScratchBufferError {
    #[error("the scratch buffer must be 8-byte aligned")]
    Misaligned,
    #[error("the scratch buffer is too small to hold a single entry")]
    TooSmall,
}
