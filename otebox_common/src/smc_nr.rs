// Copyright (c) Microsoft Corporation.
// Licensed under the MIT license.

//! Secure monitor call numbers and the reserved status values the secure side uses to ask the
//! normal world for more work before a call completes.

use num_enum::TryFromPrimitive;

pub const TE_SMC_OPEN_SESSION: u32 = 0x3000_0001;
pub const TE_SMC_CLOSE_SESSION: u32 = 0x3000_0002;
pub const TE_SMC_LAUNCH_OPERATION: u32 = 0x3000_0003;
pub const TE_SMC_NS_CB_COMPLETE: u32 = 0x3000_0004;
pub const TE_SMC_REGISTER_REQ_BUF: u32 = 0x3200_0002;
pub const TE_SMC_REGISTER_IRQ_HANDLER: u32 = 0x3200_0004;
pub const TE_SMC_PROGRAM_VPR: u32 = 0x3200_0008;
pub const TE_SMC_SS_REQ_COMPLETE: u32 = 0x3200_0009;
/// Re-enter the call that was interrupted by a normal-world IRQ.
pub const TE_SMC_RESTART_LAST: u32 = 60 << 24;

/// Function numbers accepted by the secure monitor.
#[non_exhaustive]
#[derive(Clone, Copy, Debug, PartialEq, Eq, TryFromPrimitive)]
#[repr(u32)]
pub enum TeSmcFunction {
    OpenSession = TE_SMC_OPEN_SESSION,
    CloseSession = TE_SMC_CLOSE_SESSION,
    LaunchOperation = TE_SMC_LAUNCH_OPERATION,
    NsCallbackComplete = TE_SMC_NS_CB_COMPLETE,
    RegisterRequestBuffer = TE_SMC_REGISTER_REQ_BUF,
    RegisterIrqHandler = TE_SMC_REGISTER_IRQ_HANDLER,
    ProgramProtectedRegion = TE_SMC_PROGRAM_VPR,
    StorageRequestComplete = TE_SMC_SS_REQ_COMPLETE,
    RestartLast = TE_SMC_RESTART_LAST,
}

impl From<TeSmcFunction> for u32 {
    fn from(func: TeSmcFunction) -> Self {
        func as u32
    }
}

pub const TE_ERROR_PREEMPT_BY_IRQ: u32 = 0xffff_fffd;
pub const TE_ERROR_PREEMPT_BY_FS: u32 = 0xffff_fffe;

/// Status values that mean "not done yet" rather than a final result.
#[derive(Clone, Copy, Debug, PartialEq, Eq, TryFromPrimitive)]
#[repr(u32)]
pub enum TePreemption {
    /// A normal-world interrupt arrived while the secure side was running.
    Irq = TE_ERROR_PREEMPT_BY_IRQ,
    /// The secure side is waiting for the normal-world storage proxy.
    Storage = TE_ERROR_PREEMPT_BY_FS,
}

impl TePreemption {
    /// The function number that resumes the preempted call.
    pub fn resume_function(self) -> TeSmcFunction {
        match self {
            TePreemption::Irq => TeSmcFunction::RestartLast,
            TePreemption::Storage => TeSmcFunction::StorageRequestComplete,
        }
    }
}

/// Marker bits in a request result asking the normal world to run a callback.
pub const OTE_ERROR_NS_CB: u32 = 0xffff_1000;
pub const OTE_ERROR_NS_CB_MASK: u32 = 0xffff_f000;

const OTE_NS_CB_RETRY: u32 = 0;
const OTE_NS_CB_SS: u32 = 1;

/// Normal-world callbacks the secure side may request from a compat call.
#[derive(Clone, Copy, Debug, PartialEq, Eq, TryFromPrimitive)]
#[repr(u32)]
pub enum NsCallback {
    /// Wait until the call channel has seen another call return, then retry.
    Retry = OTE_NS_CB_RETRY,
    /// Run the pending secure-storage operation.
    SecureStorage = OTE_NS_CB_SS,
}

/// Extracts the callback code from a request result, if the result carries the marker.
pub fn ns_callback_code(result: u32) -> Option<u32> {
    if result & OTE_ERROR_NS_CB_MASK == OTE_ERROR_NS_CB {
        Some(result & !OTE_ERROR_NS_CB_MASK)
    } else {
        None
    }
}
