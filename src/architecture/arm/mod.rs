//! ARM debug stack: ADIv5 DP/AP access over SWD, the MEM-AP memory engine
//! and the Cortex-M core engine.

pub mod cortex_m;
pub mod dp;
pub mod memory;

use crate::probe::swd::DapError;

pub use cortex_m::CortexMProfile;
pub use dp::{ArmDebugInterface, ArmDebugState};

/// A register of the Debug Port, addressed with `A[3:2]` of its byte
/// address.
pub trait DpRegister: From<u32> + Into<u32> + Sized {
    const ADDRESS: u8;
    const NAME: &'static str;
}

/// A memory-mapped target register, accessed through the MEM-AP.
pub trait MemoryMappedRegister: From<u32> + Into<u32> + Sized {
    const ADDRESS: u32;
    const NAME: &'static str;
}

/// Errors of the ARM debug stack.
#[derive(Debug, Clone, Copy, PartialEq, Eq, thiserror::Error)]
pub enum ArmError {
    /// A wire-level transfer failed.
    #[error("SWD transfer failed: {0}")]
    Dap(#[from] DapError),

    /// A bounded wait for the target expired.
    #[error("timeout while waiting for the target")]
    Timeout,

    /// No access port returned a valid Cortex-M CPUID.
    #[error("no Cortex-M core found behind any access port")]
    NoCoreFound,

    /// FPB revision 1 comparators can only match addresses below
    /// 0x2000_0000.
    #[error("breakpoint address {0:#010x} is not supported by this FPB")]
    UnsupportedBreakpointAddress(u32),

    /// All hardware comparators of the unit are occupied.
    #[error("no free hardware comparator")]
    NoFreeComparator,

    /// DWT v1 comparators match power-of-two sized, aligned ranges only.
    #[error("invalid watchpoint length {0}")]
    InvalidWatchpointLength(u32),
}
