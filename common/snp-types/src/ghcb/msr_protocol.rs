use core::num::NonZeroU32;

use bit_field::BitField;
use x86_64::{PhysAddr, registers::model_specific::Msr, structures::paging::PhysFrame};

use super::PageOperation;

/// The GHCB MSR.
#[derive(Debug)]
pub struct GhcbProtocolMsr;

impl GhcbProtocolMsr {
    /// The underlying model specific register.
    pub const MSR: Msr = Msr::new(0xC001_0130);
}

#[derive(Debug, PartialEq, Eq)]
#[non_exhaustive]
pub enum GhcbInfo {
    GhcbGuestPhysicalAddress {
        /// The guest physical address of the GHCB
        address: PhysFrame,
    },
    SnpPageStateChangeRequest {
        operation: PageOperation,
        address: PhysFrame,
    },
    SnpPageStateChangeResponse {
        error_code: Option<NonZeroU32>,
    },
    TerminationRequest {
        reason_code: TerminateReasonCode,
    },
}

impl From<GhcbInfo> for u64 {
    fn from(info: GhcbInfo) -> Self {
        let mut msr_value = 0;

        match info {
            GhcbInfo::GhcbGuestPhysicalAddress { address } => {
                msr_value.set_bits(0..=11, 0x000); // GHCBInfo
                msr_value.set_bits(12..=63, address.start_address().as_u64().get_bits(12..));
            }
            GhcbInfo::SnpPageStateChangeRequest { operation, address } => {
                let gfn = address.start_address().as_u64().get_bits(12..);

                msr_value.set_bits(0..=11, 0x014); // GHCBInfo
                msr_value.set_bits(12..=51, gfn);
                msr_value.set_bits(52..=55, operation as u64);
                msr_value.set_bits(56..=63, 0); // Reserved, must be zero
            }
            GhcbInfo::SnpPageStateChangeResponse { error_code } => {
                let error_code = error_code.map(NonZeroU32::get).unwrap_or(0);

                msr_value.set_bits(0..=11, 0x015); // GHCBInfo
                msr_value.set_bits(12..=31, 0); // Reserved, must be zero
                msr_value.set_bits(32..=63, u64::from(error_code));
            }
            GhcbInfo::TerminationRequest { reason_code } => {
                msr_value.set_bits(0..=11, 0x100); // GHCBInfo
                msr_value.set_bits(12..=15, u64::from(reason_code.reason_code_set));
                msr_value.set_bits(16..=23, u64::from(reason_code.reason_code));
            }
        }

        msr_value
    }
}

#[derive(Debug)]
pub struct ParseError(());

impl TryFrom<u64> for GhcbInfo {
    type Error = ParseError;

    fn try_from(msr_value: u64) -> Result<Self, Self::Error> {
        let ghcb_info = msr_value.get_bits(0..=11);
        match ghcb_info {
            0x000 => {
                let address = PhysAddr::try_new(msr_value).map_err(|_| ParseError(()))?;
                let address =
                    PhysFrame::from_start_address(address).map_err(|_| ParseError(()))?;
                Ok(Self::GhcbGuestPhysicalAddress { address })
            }
            0x014 => {
                let gfn = msr_value.get_bits(12..=51);
                let address = PhysFrame::containing_address(PhysAddr::new(gfn << 12));
                let operation = match msr_value.get_bits(52..=55) {
                    1 => PageOperation::PageAssignmentPrivate,
                    2 => PageOperation::PageAssignmentShared,
                    _ => return Err(ParseError(())),
                };
                if msr_value.get_bits(56..=63) != 0 {
                    return Err(ParseError(()));
                }
                Ok(Self::SnpPageStateChangeRequest { operation, address })
            }
            0x015 => {
                if msr_value.get_bits(12..=31) != 0 {
                    return Err(ParseError(()));
                }
                let error_code = msr_value.get_bits(32..=63) as u32;
                let error_code = NonZeroU32::new(error_code);
                Ok(Self::SnpPageStateChangeResponse { error_code })
            }
            0x100 => {
                let reason_code_set = msr_value.get_bits(12..=15) as u8;
                let reason_code = msr_value.get_bits(16..=23) as u8;
                let reason_code = TerminateReasonCode::new(reason_code_set, reason_code);
                Ok(Self::TerminationRequest { reason_code })
            }
            _ => Err(ParseError(())),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct TerminateReasonCode {
    reason_code_set: u8,
    reason_code: u8,
}

impl TerminateReasonCode {
    pub const GENERAL_TERMINATION_REQUEST: Self = Self::new(0x0, 0x00);

    pub const fn new(reason_code_set: u8, reason_code: u8) -> Self {
        assert!(reason_code_set < 16, "reason code is bigger than 16");
        Self {
            reason_code_set,
            reason_code,
        }
    }
}
