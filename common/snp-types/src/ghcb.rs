use core::fmt;

use bit_field::BitField;
use bytemuck::{Pod, Zeroable};
use x86_64::{
    PhysAddr,
    structures::paging::{PageSize, PhysFrame, page::NotGiantPageSize},
};

use crate::Reserved;

pub mod msr_protocol;

/// The size of [`Ghcb::shared_buffer`].
pub const SHARED_BUFFER_SIZE: usize = 0x7f0;

/// The maximum number of entries in a single page state change request.
pub const PSC_MAX_ENTRIES: usize =
    (SHARED_BUFFER_SIZE - size_of::<PageStateChangeHeader>()) / size_of::<PageStateChangeEntry>();

#[derive(Clone, Copy, Debug, Zeroable)]
#[repr(C, align(4096))]
pub struct Ghcb {
    _reserved1: Reserved<0xcb>,
    pub cpl: u8,
    _reserved2: Reserved<0x74>,
    pub xss: u64,
    _reserved3: Reserved<0x18>,
    pub dr7: u64,
    _reserved4: Reserved<0x90>,
    pub rax: u64,
    _reserved5: Reserved<0x100>,
    _reserved6: Reserved<8>,
    pub rcx: u64,
    pub rdx: u64,
    pub rbx: u64,
    _reserved7: Reserved<0x70>,
    pub sw_exit_code: u64,
    pub sw_exit_info1: u64,
    pub sw_exit_info2: u64,
    pub sw_scratch: u64,
    _reserved8: Reserved<0x38>,
    pub xcr0: u64,
    pub valid_bitmap: u128,
    pub x87_state_gpa: u64,
    _reserved9: Reserved<0x3f8>,
    pub shared_buffer: [u8; SHARED_BUFFER_SIZE],
    _reserved10: Reserved<0xa>,
    pub protocol_version: ProtocolVersion,
    pub ghcb_usage: GhcbUsage,
}

impl Ghcb {
    pub const ZERO: Self = Self {
        _reserved1: Reserved::ZERO,
        cpl: 0,
        _reserved2: Reserved::ZERO,
        xss: 0,
        _reserved3: Reserved::ZERO,
        dr7: 0,
        _reserved4: Reserved::ZERO,
        rax: 0,
        _reserved5: Reserved::ZERO,
        _reserved6: Reserved::ZERO,
        rcx: 0,
        rdx: 0,
        rbx: 0,
        _reserved7: Reserved::ZERO,
        sw_exit_code: 0,
        sw_exit_info1: 0,
        sw_exit_info2: 0,
        sw_scratch: 0,
        _reserved8: Reserved::ZERO,
        xcr0: 0,
        valid_bitmap: 0,
        x87_state_gpa: 0,
        _reserved9: Reserved::ZERO,
        shared_buffer: [0; SHARED_BUFFER_SIZE],
        _reserved10: Reserved::ZERO,
        protocol_version: ProtocolVersion(0),
        ghcb_usage: GhcbUsage(0),
    };

    /// Returns whether the quadword at `offset` is marked in the valid
    /// bitmap.
    pub fn is_valid(&self, offset: usize) -> bool {
        self.valid_bitmap.get_bit(offset / 8)
    }
}

#[derive(Clone, Copy, PartialEq, Eq, Pod, Zeroable)]
#[repr(transparent)]
pub struct ProtocolVersion(pub u16);

impl ProtocolVersion {
    pub const VERSION2: Self = Self(2);
}

impl fmt::Debug for ProtocolVersion {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match *self {
            Self::VERSION2 => f.pad("Version 2"),
            _ => f.pad("Unknown version"),
        }
    }
}

#[derive(Clone, Copy, PartialEq, Eq, Pod, Zeroable)]
#[repr(transparent)]
pub struct GhcbUsage(pub u32);

impl GhcbUsage {
    pub const AMD_STANDARD: Self = Self(0);
}

impl fmt::Debug for GhcbUsage {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match *self {
            Self::AMD_STANDARD => f.pad("AMD Standard Usage"),
            _ => f.pad("Unknown usage"),
        }
    }
}

/// The header of a page state change request.
///
/// `cur_entry` is advanced by the hypervisor as it processes entries. The
/// request is complete once `cur_entry` is past `end_entry`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Pod, Zeroable)]
#[repr(C)]
pub struct PageStateChangeHeader {
    pub cur_entry: u16,
    pub end_entry: u16,
    _reserved: u32,
}

impl PageStateChangeHeader {
    pub const fn new(cur_entry: u16, end_entry: u16) -> Self {
        Self {
            cur_entry,
            end_entry,
            _reserved: 0,
        }
    }

    pub fn is_complete(&self) -> bool {
        self.cur_entry > self.end_entry
    }
}

/// A single entry of a page state change request.
#[derive(Clone, Copy, PartialEq, Eq, Pod, Zeroable)]
#[repr(transparent)]
pub struct PageStateChangeEntry(u64);

impl PageStateChangeEntry {
    pub fn new<S>(operation: PageOperation, frame: PhysFrame<S>) -> Self
    where
        S: NotGiantPageSize,
    {
        let mut value = 0;
        value.set_bits(0..=11, 0); // Current page, the hypervisor's progress within the entry.
        value.set_bits(12..=51, frame.start_address().as_u64().get_bits(12..));
        value.set_bits(52..=55, operation as u64);
        value.set_bit(56, S::SIZE != RmpPageSize::Size4KiB.size()); // Page size
        value.set_bits(57..=63, 0); // Reserved, must be zero
        Self(value)
    }

    pub const fn from_bits(bits: u64) -> Self {
        Self(bits)
    }

    pub const fn bits(&self) -> u64 {
        self.0
    }

    pub fn current_page(&self) -> u16 {
        self.0.get_bits(0..=11) as u16
    }

    pub fn gfn(&self) -> u64 {
        self.0.get_bits(12..=51)
    }

    pub fn start_address(&self) -> PhysAddr {
        PhysAddr::new(self.gfn() << 12)
    }

    pub fn page_operation(&self) -> Result<PageOperation, u8> {
        match self.0.get_bits(52..=55) as u8 {
            1 => Ok(PageOperation::PageAssignmentPrivate),
            2 => Ok(PageOperation::PageAssignmentShared),
            other => Err(other),
        }
    }

    pub fn page_size(&self) -> RmpPageSize {
        match self.0.get_bit(56) {
            true => RmpPageSize::Size2MiB,
            false => RmpPageSize::Size4KiB,
        }
    }
}

impl fmt::Debug for PageStateChangeEntry {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("PageStateChangeEntry")
            .field("address", &self.start_address())
            .field("size", &self.page_size())
            .field("operation", &self.page_operation())
            .field("current_page", &self.current_page())
            .finish()
    }
}

/// The image of [`Ghcb::shared_buffer`] for a page state change request.
#[derive(Clone, Copy, Pod, Zeroable)]
#[repr(C)]
pub struct PageStateChangeRequest {
    pub header: PageStateChangeHeader,
    pub entries: [PageStateChangeEntry; PSC_MAX_ENTRIES],
}

impl fmt::Debug for PageStateChangeRequest {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let end = usize::from(self.header.end_entry).min(PSC_MAX_ENTRIES - 1);
        f.debug_struct("PageStateChangeRequest")
            .field("header", &self.header)
            .field("entries", &&self.entries[..=end])
            .finish()
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PageOperation {
    PageAssignmentPrivate = 1,
    PageAssignmentShared = 2,
}

/// The page size of an RMP entry.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RmpPageSize {
    Size4KiB,
    Size2MiB,
}

impl RmpPageSize {
    pub const fn size(self) -> u64 {
        match self {
            Self::Size4KiB => 0x1000,
            Self::Size2MiB => 0x20_0000,
        }
    }
}
