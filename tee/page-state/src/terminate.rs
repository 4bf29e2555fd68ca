use log::error;
use snp_types::ghcb::msr_protocol::{GhcbInfo, TerminateReasonCode};

use crate::{error::PageStateError, platform::Platform};

/// Ask the hypervisor to terminate the guest.
///
/// The vCPU is halted in case the hypervisor resumes it anyway.
pub fn terminate<P>(platform: &mut P, reason_code: TerminateReasonCode) -> !
where
    P: Platform,
{
    let request = u64::from(GhcbInfo::TerminationRequest { reason_code });
    unsafe {
        platform.write_ghcb_msr(request);
    }
    platform.vmgexit();
    platform.halt()
}

/// Report a failed page state change and terminate the guest.
#[cold]
pub(crate) fn fail<P>(platform: &mut P, err: PageStateError) -> !
where
    P: Platform,
{
    error!("page state change failed: {err}");
    terminate(platform, TerminateReasonCode::GENERAL_TERMINATION_REQUEST)
}
