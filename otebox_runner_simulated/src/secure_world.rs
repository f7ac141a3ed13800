// Copyright (c) Microsoft Corporation.
// Licensed under the MIT license.

//! A small in-process stand-in for the trusted OS and one trusted application.
//!
//! It understands the request layout, hands out session ids starting at 1, and implements a few
//! commands that exercise the normal-world protocol: preemption by interrupts and by the storage
//! proxy, and normal-world callbacks.

use std::collections::BTreeSet;
use std::sync::Mutex;

use otebox_common::smc_nr::{
    OTE_ERROR_NS_CB, TE_ERROR_PREEMPT_BY_FS, TE_ERROR_PREEMPT_BY_IRQ, TeSmcFunction,
};
use otebox_common::{
    OteResult, PAGE_SIZE, ResultOrigin, TeOperParam, TeOperParamCompat, TeParamType, TeRequest,
    TeRequestCompat,
};

// Requests are decoded through the compat structures; on 64-bit hosts the native ones share
// their layout.
const _: () = assert!(size_of::<TeRequest>() == size_of::<TeRequestCompat>());
const _: () = assert!(size_of::<TeOperParam>() == size_of::<TeOperParamCompat>());

/// Add one to every `IntRw` parameter.
pub const CMD_INCREMENT: u32 = 1;
/// Reverse the contents of every `MemRw` buffer.
pub const CMD_REVERSE: u32 = 2;
/// Give the core back until the storage proxy has run.
pub const CMD_STORE: u32 = 3;
/// Ask for the storage callback before completing.
pub const CMD_STORE_CALLBACK: u32 = 4;
/// Ask the caller to retry once some other call has returned.
pub const CMD_WAIT_RETRY: u32 = 5;

/// What a call did, beyond its status.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct CallReturn {
    pub status: u32,
    /// The request is parked until some other call through the channel returns.
    pub awaits_other_call: bool,
}

impl CallReturn {
    fn status(status: u32) -> Self {
        Self {
            status,
            awaits_other_call: false,
        }
    }
}

#[derive(Default)]
struct WorldState {
    next_session: u32,
    sessions: BTreeSet<u32>,
    request_base: Option<usize>,
    current_request: Option<usize>,
    preempted: Option<(u32, usize, usize)>,
    calls: u64,
    irq_every: Option<u64>,
    protected_region: Option<(usize, usize)>,
    log: Vec<String>,
}

pub struct SecureWorld {
    state: Mutex<WorldState>,
}

const SUCCESS: u32 = OteResult::Success as u32;

fn read_at<T: Copy>(addr: usize) -> T {
    // SAFETY: Addresses handed to the secure side point into live call buffers or pinned user
    // buffers for the duration of the call.
    unsafe { core::ptr::with_exposed_provenance::<T>(addr).read_unaligned() }
}

fn write_at<T: Copy>(addr: usize, value: T) {
    // SAFETY: As in `read_at`.
    unsafe { core::ptr::with_exposed_provenance_mut::<T>(addr).write_unaligned(value) }
}

impl SecureWorld {
    /// A world that preempts every `irq_every`-th request with an interrupt.
    pub fn new(irq_every: Option<u64>) -> Self {
        Self {
            state: Mutex::new(WorldState {
                next_session: 1,
                irq_every: irq_every.filter(|&n| n > 0),
                ..WorldState::default()
            }),
        }
    }

    /// Lines logged since the last drain.
    pub fn drain_log(&self) -> Vec<String> {
        std::mem::take(&mut self.lock().log)
    }

    pub fn protected_region(&self) -> Option<(usize, usize)> {
        self.lock().protected_region
    }

    pub fn storage_serviced(&self) {
        self.lock().log.push("storage proxy serviced a request".into());
    }

    fn lock(&self) -> std::sync::MutexGuard<'_, WorldState> {
        self.state.lock().unwrap_or_else(std::sync::PoisonError::into_inner)
    }

    pub fn call(&self, func: u32, arg1: usize, arg2: usize) -> CallReturn {
        let mut st = self.lock();
        st.calls += 1;
        let carries_request = matches!(
            TeSmcFunction::try_from(func),
            Ok(TeSmcFunction::OpenSession
                | TeSmcFunction::CloseSession
                | TeSmcFunction::LaunchOperation)
        );
        if carries_request && st.irq_every.is_some_and(|n| st.calls % n == 0) {
            st.preempted = Some((func, arg1, arg2));
            st.log.push(format!("call {func:#x} preempted by interrupt"));
            return CallReturn::status(TE_ERROR_PREEMPT_BY_IRQ);
        }
        if func == u32::from(TeSmcFunction::RestartLast) {
            return match st.preempted.take() {
                Some((func, arg1, arg2)) => Self::dispatch(&mut st, func, arg1, arg2),
                None => CallReturn::status(OteResult::BadState.into()),
            };
        }
        Self::dispatch(&mut st, func, arg1, arg2)
    }

    fn resolve(st: &WorldState, addr: usize) -> usize {
        match st.request_base {
            Some(base) if addr < 2 * PAGE_SIZE => base + addr,
            _ => addr,
        }
    }

    fn complete(st: &WorldState, result: u32, origin: ResultOrigin) {
        if let Some(addr) = st.current_request {
            let mut request: TeRequestCompat = read_at(addr);
            request.result = result;
            request.result_origin = origin.into();
            write_at(addr, request);
        }
    }

    fn dispatch(st: &mut WorldState, func: u32, arg1: usize, arg2: usize) -> CallReturn {
        let Ok(func) = TeSmcFunction::try_from(func) else {
            st.log.push(format!("unknown call {func:#x}"));
            return CallReturn::status(OteResult::NotImplemented.into());
        };
        match func {
            TeSmcFunction::RegisterIrqHandler => {
                st.log.push(format!("interrupt handler at {arg1:#x}"));
                CallReturn::status(SUCCESS)
            }
            TeSmcFunction::RegisterRequestBuffer => {
                st.request_base = Some(arg1);
                st.log.push(format!("request buffer registered ({arg2} bytes)"));
                CallReturn::status(SUCCESS)
            }
            TeSmcFunction::ProgramProtectedRegion => {
                if arg2 == 0 {
                    return CallReturn::status(OteResult::BadParameters.into());
                }
                st.protected_region = Some((arg1, arg2));
                st.log.push(format!("protected region at {arg1:#x}+{arg2:#x}"));
                CallReturn::status(SUCCESS)
            }
            TeSmcFunction::OpenSession => {
                let addr = Self::resolve(st, arg1);
                st.current_request = Some(addr);
                Self::open(st, addr);
                CallReturn::status(SUCCESS)
            }
            TeSmcFunction::CloseSession => {
                let addr = Self::resolve(st, arg1);
                st.current_request = Some(addr);
                let request: TeRequestCompat = read_at(addr);
                if st.sessions.remove(&request.session_id) {
                    st.log.push(format!("session {} closed", request.session_id));
                    Self::complete(st, SUCCESS, ResultOrigin::Tee);
                } else {
                    Self::complete(st, OteResult::BadParameters.into(), ResultOrigin::Tee);
                }
                CallReturn::status(SUCCESS)
            }
            TeSmcFunction::LaunchOperation => {
                let addr = Self::resolve(st, arg1);
                st.current_request = Some(addr);
                Self::launch(st, addr)
            }
            TeSmcFunction::StorageRequestComplete => {
                Self::complete(st, SUCCESS, ResultOrigin::TrustedApp);
                CallReturn::status(SUCCESS)
            }
            TeSmcFunction::NsCallbackComplete => {
                let addr = Self::resolve(st, arg1);
                st.current_request = Some(addr);
                let request: TeRequestCompat = read_at(addr);
                st.log.push(format!(
                    "callback {} completed with {:#x}",
                    request.req_type, request.result
                ));
                if request.result == SUCCESS {
                    Self::complete(st, SUCCESS, ResultOrigin::TrustedApp);
                } else {
                    Self::complete(st, request.result, ResultOrigin::Comms);
                }
                CallReturn::status(SUCCESS)
            }
            TeSmcFunction::RestartLast => CallReturn::status(OteResult::BadState.into()),
            _ => CallReturn::status(OteResult::NotImplemented.into()),
        }
    }

    fn open(st: &mut WorldState, addr: usize) {
        let mut request: TeRequestCompat = read_at(addr);
        if request.dest_uuid == [0; 4] {
            request.result = OteResult::ItemNotFound.into();
            request.result_origin = ResultOrigin::Tee.into();
        } else {
            let id = st.next_session;
            st.next_session += 1;
            st.sessions.insert(id);
            st.log.push(format!("session {id} opened"));
            request.session_id = id;
            request.result = SUCCESS;
            request.result_origin = ResultOrigin::TrustedApp.into();
        }
        write_at(addr, request);
    }

    fn launch(st: &mut WorldState, addr: usize) -> CallReturn {
        let request: TeRequestCompat = read_at(addr);
        if !st.sessions.contains(&request.session_id) {
            Self::complete(st, OteResult::BadParameters.into(), ResultOrigin::Tee);
            return CallReturn::status(SUCCESS);
        }
        let params_addr = Self::resolve(st, request.params as usize);
        let params: Vec<(usize, TeOperParamCompat)> = (0..request.params_size as usize)
            .map(|i| {
                let at = params_addr + i * size_of::<TeOperParamCompat>();
                (at, read_at(at))
            })
            .collect();

        match request.command_id {
            CMD_INCREMENT => {
                for (at, mut param) in params {
                    if param.param_type == u32::from(TeParamType::IntRw) {
                        param.base_or_value =
                            u64::from((param.base_or_value as u32).wrapping_add(1));
                        write_at(at, param);
                    }
                }
                Self::complete(st, SUCCESS, ResultOrigin::TrustedApp);
            }
            CMD_REVERSE => {
                for (_, param) in params {
                    if param.param_type == u32::from(TeParamType::MemRw) && param.len > 0 {
                        let ptr = core::ptr::with_exposed_provenance_mut::<u8>(
                            param.base_or_value as usize,
                        );
                        // SAFETY: The buffer is pinned for the duration of the call.
                        let buffer =
                            unsafe { core::slice::from_raw_parts_mut(ptr, param.len as usize) };
                        buffer.reverse();
                    }
                }
                Self::complete(st, SUCCESS, ResultOrigin::TrustedApp);
            }
            CMD_STORE => {
                st.log.push("waiting for the storage proxy".into());
                return CallReturn::status(TE_ERROR_PREEMPT_BY_FS);
            }
            CMD_STORE_CALLBACK => {
                Self::complete(st, OTE_ERROR_NS_CB | 1, ResultOrigin::Tee);
            }
            CMD_WAIT_RETRY => {
                Self::complete(st, OTE_ERROR_NS_CB, ResultOrigin::Tee);
                return CallReturn {
                    status: SUCCESS,
                    awaits_other_call: true,
                };
            }
            _ => Self::complete(st, OteResult::NotImplemented.into(), ResultOrigin::TrustedApp),
        }
        CallReturn::status(SUCCESS)
    }
}
