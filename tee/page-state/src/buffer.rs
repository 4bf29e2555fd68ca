use core::mem::size_of;

use bytemuck::{Zeroable, try_cast_slice_mut, try_from_bytes_mut};
use snp_types::ghcb::{PageStateChangeEntry, PageStateChangeHeader};
use x86_64::structures::paging::{
    PageSize, PhysFrame, Size2MiB, Size4KiB, frame::PhysFrameRange,
};

use crate::{MemoryState, error::ScratchBufferError};

/// Entries beyond this can't be indexed by the header.
const MAX_ENTRIES: usize = u16::MAX as usize;

/// A batch of page state change entries laid out in a caller supplied
/// scratch buffer.
///
/// The layout matches the one used in the GHCB shared buffer: a
/// [`PageStateChangeHeader`] followed by the entries.
#[derive(Debug)]
pub struct PageStateBuffer<'a> {
    header: &'a mut PageStateChangeHeader,
    entries: &'a mut [PageStateChangeEntry],
}

impl<'a> PageStateBuffer<'a> {
    pub fn new(scratch: &'a mut [u8]) -> Result<Self, ScratchBufferError> {
        let header_size = size_of::<PageStateChangeHeader>();
        let entry_size = size_of::<PageStateChangeEntry>();
        if scratch.len() < header_size + entry_size {
            return Err(ScratchBufferError::TooSmall);
        }

        let (header, entries) = scratch.split_at_mut(header_size);
        let capacity = (entries.len() / entry_size).min(MAX_ENTRIES);
        let header = try_from_bytes_mut::<PageStateChangeHeader>(header)
            .map_err(|_| ScratchBufferError::Misaligned)?;
        let entries = try_cast_slice_mut::<_, PageStateChangeEntry>(
            &mut entries[..capacity * entry_size],
        )
        .map_err(|_| ScratchBufferError::Misaligned)?;

        Ok(Self { header, entries })
    }

    /// The maximum number of entries in a batch.
    pub fn capacity(&self) -> usize {
        self.entries.len()
    }

    pub fn header(&self) -> PageStateChangeHeader {
        *self.header
    }

    /// The entries that haven't been processed yet.
    pub fn entries(&self) -> &[PageStateChangeEntry] {
        let start = usize::from(self.header.cur_entry);
        let end = usize::from(self.header.end_entry);
        self.entries.get(start..=end).unwrap_or_default()
    }

    /// Replace the contents of the buffer with entries for the start of
    /// `range`.
    ///
    /// 2MiB entries are used for 2MiB aligned chunks of the range if
    /// `use_large_entry` is set. Returns the first frame not covered by the
    /// batch.
    pub fn fill(
        &mut self,
        range: PhysFrameRange,
        state: MemoryState,
        use_large_entry: bool,
    ) -> PhysFrame {
        debug_assert!(!range.is_empty());

        *self.header = PageStateChangeHeader::zeroed();
        self.entries.fill(PageStateChangeEntry::zeroed());

        let operation = state.into();
        let mut next = range.start;
        for (entry, i) in self.entries.iter_mut().zip(0..) {
            if next >= range.end {
                break;
            }

            let start = next.start_address();
            if let Some(frame) = PhysFrame::<Size2MiB>::from_start_address(start)
                .ok()
                .filter(|_| use_large_entry)
                .filter(|_| range.end.start_address() - start >= Size2MiB::SIZE)
            {
                *entry = PageStateChangeEntry::new(operation, frame);
                next += frame.size() / Size4KiB::SIZE;
            } else {
                *entry = PageStateChangeEntry::new(operation, next);
                next += 1;
            }
            self.header.end_entry = i;
        }

        next
    }
}
