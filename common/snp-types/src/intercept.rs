/// Page State Change request, carried in the GHCB shared buffer.
pub const VMEXIT_PSC: u64 = 0x8000_0010;
