// Copyright (c) Microsoft Corporation.
// Licensed under the MIT license.

//! The two request encodings. Both feed the same pinning and session logic; they differ in field
//! widths, in which scratch buffer they use, and in whether results may carry callback requests.

use core::mem::size_of;
use otebox_common::smc_nr::{TeSmcFunction, ns_callback_code};
use otebox_common::{
    OteResult, ResultOrigin, TeError, TeOperParam, TeOperParamCompat, TeParamType, TeRequest,
    TeRequestCompat, TeServiceId,
};
use zerocopy::{FromBytes, Immutable, IntoBytes};

use crate::smc::Scratch;
use crate::{CallOutcome, CommsConfig, NativeBuffers, ScratchAddressing};

/// A decoded request parameter.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub(crate) struct ParamView {
    pub ty: TeParamType,
    pub base: usize,
    pub len: usize,
}

pub(crate) trait WireLayout {
    type Request: FromBytes + IntoBytes + Immutable + Copy;
    type Param: FromBytes + IntoBytes + Immutable + Copy;

    const NAME: &'static str;

    /// Whether a result may ask the normal world to run a callback before the call completes.
    const HAS_CALLBACKS: bool;

    /// Which scratch buffer requests in this layout are marshaled into.
    fn scratch(config: &CommsConfig) -> Scratch;

    /// A request the secure side has not answered yet. Its result reads as a transport failure
    /// until the secure side overwrites it.
    fn new_request(
        func: TeSmcFunction,
        session_id: u32,
        command_id: u32,
        dest: Option<TeServiceId>,
    ) -> Self::Request;

    /// Point the request at its parameter array as seen by the secure side.
    fn set_param_list(request: &mut Self::Request, addr: usize, count: u32);

    /// Chain each parameter to the next one in an array starting at `addr`.
    fn link_params(params: &mut [Self::Param], addr: usize);

    fn decode_param(param: &Self::Param) -> Result<ParamView, TeError>;

    fn outcome(request: &Self::Request) -> CallOutcome;

    fn session_id(request: &Self::Request) -> u32;

    /// Record the result of a normal-world callback, to be reported back with the completion.
    fn set_callback_result(request: &mut Self::Request, code: u32, result: u32);

    /// The callback requested by the secure side, if any.
    fn pending_callback(request: &Self::Request) -> Option<u32> {
        if Self::HAS_CALLBACKS {
            ns_callback_code(Self::outcome(request).result)
        } else {
            None
        }
    }
}

fn param_type(raw: u32) -> Result<TeParamType, TeError> {
    TeParamType::try_from(raw).map_err(|_| {
        log::error!(param_type = raw; "unknown parameter type");
        TeError::BadParameters
    })
}

/// Pointer-width encoding used by callers sharing the kernel's pointer width.
pub(crate) enum Native {}

impl WireLayout for Native {
    type Request = TeRequest;
    type Param = TeOperParam;

    const NAME: &'static str = "native";
    const HAS_CALLBACKS: bool = false;

    fn scratch(config: &CommsConfig) -> Scratch {
        match config.native_buffers {
            NativeBuffers::PerCall => Scratch::PerCall,
            NativeBuffers::Shared => Scratch::SharedOffset,
        }
    }

    fn new_request(
        func: TeSmcFunction,
        session_id: u32,
        command_id: u32,
        dest: Option<TeServiceId>,
    ) -> TeRequest {
        TeRequest {
            req_type: func.into(),
            session_id,
            command_id,
            dest_uuid: dest.unwrap_or_default().0,
            result: OteResult::Generic.into(),
            result_origin: ResultOrigin::Comms.into(),
            ..TeRequest::default()
        }
    }

    fn set_param_list(request: &mut TeRequest, addr: usize, count: u32) {
        request.params = addr;
        request.params_size = count;
    }

    fn link_params(params: &mut [TeOperParam], addr: usize) {
        let count = params.len();
        for (i, param) in params.iter_mut().enumerate() {
            param.next_ptr_user = if i + 1 < count {
                addr + (i + 1) * size_of::<TeOperParam>()
            } else {
                0
            };
        }
    }

    fn decode_param(param: &TeOperParam) -> Result<ParamView, TeError> {
        Ok(ParamView {
            ty: param_type(param.param_type)?,
            base: param.base_or_value,
            len: param.len as usize,
        })
    }

    fn outcome(request: &TeRequest) -> CallOutcome {
        CallOutcome {
            result: request.result,
            origin: request.result_origin,
        }
    }

    fn session_id(request: &TeRequest) -> u32 {
        request.session_id
    }

    fn set_callback_result(request: &mut TeRequest, code: u32, result: u32) {
        request.req_type = code;
        request.result = result;
    }
}

/// Fixed-width encoding for callers whose pointers are narrower than the kernel's.
pub(crate) enum Compat {}

impl WireLayout for Compat {
    type Request = TeRequestCompat;
    type Param = TeOperParamCompat;

    const NAME: &'static str = "compat";
    const HAS_CALLBACKS: bool = true;

    fn scratch(config: &CommsConfig) -> Scratch {
        match config.compat_addressing {
            ScratchAddressing::Offset => Scratch::SharedOffset,
            ScratchAddressing::Physical => Scratch::SharedPhysical,
        }
    }

    fn new_request(
        func: TeSmcFunction,
        session_id: u32,
        command_id: u32,
        dest: Option<TeServiceId>,
    ) -> TeRequestCompat {
        TeRequestCompat {
            req_type: func.into(),
            session_id,
            command_id,
            dest_uuid: dest.unwrap_or_default().0,
            result: OteResult::Generic.into(),
            result_origin: ResultOrigin::Comms.into(),
            ..TeRequestCompat::default()
        }
    }

    fn set_param_list(request: &mut TeRequestCompat, addr: usize, count: u32) {
        request.params = addr as u64;
        request.params_size = count;
    }

    fn link_params(params: &mut [TeOperParamCompat], addr: usize) {
        let count = params.len();
        for (i, param) in params.iter_mut().enumerate() {
            param.next_ptr_user = if i + 1 < count {
                (addr + (i + 1) * size_of::<TeOperParamCompat>()) as u64
            } else {
                0
            };
        }
    }

    fn decode_param(param: &TeOperParamCompat) -> Result<ParamView, TeError> {
        let ty = param_type(param.param_type)?;
        let base = if ty.is_memory() {
            usize::try_from(param.base_or_value).map_err(|_| TeError::BadParameters)?
        } else {
            // Integer values only use the low word.
            param.base_or_value as u32 as usize
        };
        Ok(ParamView {
            ty,
            base,
            len: param.len as usize,
        })
    }

    fn outcome(request: &TeRequestCompat) -> CallOutcome {
        CallOutcome {
            result: request.result,
            origin: request.result_origin,
        }
    }

    fn session_id(request: &TeRequestCompat) -> u32 {
        request.session_id
    }

    fn set_callback_result(request: &mut TeRequestCompat, code: u32, result: u32) {
        request.req_type = code;
        request.result = result;
    }
}
