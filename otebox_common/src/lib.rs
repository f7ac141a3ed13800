// Copyright (c) Microsoft Corporation.
// Licensed under the MIT license.

//! Wire-level vocabulary shared by the normal-world TEE communications stack: call numbers,
//! result codes, parameter encodings, and the request layouts handed to the secure side.

#![no_std]

use core::fmt;
use core::str::FromStr;
use num_enum::TryFromPrimitive;
use thiserror::Error;
use zerocopy::{FromBytes, Immutable, IntoBytes, KnownLayout};

pub mod smc_nr;

pub const PAGE_SIZE: usize = 4096;

const OTE_SUCCESS: u32 = 0x0000_0000;
const OTE_ERROR_GENERIC: u32 = 0xffff_0000;
const OTE_ERROR_ACCESS_DENIED: u32 = 0xffff_0001;
const OTE_ERROR_CANCEL: u32 = 0xffff_0002;
const OTE_ERROR_ACCESS_CONFLICT: u32 = 0xffff_0003;
const OTE_ERROR_EXCESS_DATA: u32 = 0xffff_0004;
const OTE_ERROR_BAD_FORMAT: u32 = 0xffff_0005;
const OTE_ERROR_BAD_PARAMETERS: u32 = 0xffff_0006;
const OTE_ERROR_BAD_STATE: u32 = 0xffff_0007;
const OTE_ERROR_ITEM_NOT_FOUND: u32 = 0xffff_0008;
const OTE_ERROR_NOT_IMPLEMENTED: u32 = 0xffff_0009;
const OTE_ERROR_NOT_SUPPORTED: u32 = 0xffff_000a;
const OTE_ERROR_NO_DATA: u32 = 0xffff_000b;
const OTE_ERROR_OUT_OF_MEMORY: u32 = 0xffff_000c;
const OTE_ERROR_BUSY: u32 = 0xffff_000d;
const OTE_ERROR_COMMUNICATION: u32 = 0xffff_000e;
const OTE_ERROR_SECURITY: u32 = 0xffff_000f;
const OTE_ERROR_SHORT_BUFFER: u32 = 0xffff_0010;

/// Result codes reported by the secure side and by the local stack.
#[derive(Clone, Copy, TryFromPrimitive, PartialEq, Eq, Debug)]
#[repr(u32)]
pub enum OteResult {
    Success = OTE_SUCCESS,
    Generic = OTE_ERROR_GENERIC,
    AccessDenied = OTE_ERROR_ACCESS_DENIED,
    Cancel = OTE_ERROR_CANCEL,
    AccessConflict = OTE_ERROR_ACCESS_CONFLICT,
    ExcessData = OTE_ERROR_EXCESS_DATA,
    BadFormat = OTE_ERROR_BAD_FORMAT,
    BadParameters = OTE_ERROR_BAD_PARAMETERS,
    BadState = OTE_ERROR_BAD_STATE,
    ItemNotFound = OTE_ERROR_ITEM_NOT_FOUND,
    NotImplemented = OTE_ERROR_NOT_IMPLEMENTED,
    NotSupported = OTE_ERROR_NOT_SUPPORTED,
    NoData = OTE_ERROR_NO_DATA,
    OutOfMemory = OTE_ERROR_OUT_OF_MEMORY,
    Busy = OTE_ERROR_BUSY,
    Communication = OTE_ERROR_COMMUNICATION,
    Security = OTE_ERROR_SECURITY,
    ShortBuffer = OTE_ERROR_SHORT_BUFFER,
}

impl From<OteResult> for u32 {
    fn from(res: OteResult) -> Self {
        res as u32
    }
}

/// Where a result code was produced.
#[derive(Clone, Copy, TryFromPrimitive, PartialEq, Eq, Debug)]
#[repr(u32)]
pub enum ResultOrigin {
    /// The normal-world API rejected the request before it crossed over.
    Api = 1,
    /// The communication stack between the worlds.
    Comms = 2,
    /// The trusted OS.
    Tee = 3,
    /// The trusted application serving the session.
    TrustedApp = 4,
}

impl From<ResultOrigin> for u32 {
    fn from(origin: ResultOrigin) -> Self {
        origin as u32
    }
}

/// Errors raised locally, before or instead of a secure call. All of them carry origin
/// [`ResultOrigin::Api`].
#[derive(Error, Debug, Clone, Copy, PartialEq, Eq)]
#[non_exhaustive]
pub enum TeError {
    #[error("bad parameters")]
    BadParameters,
    #[error("out of memory")]
    OutOfMemory,
    #[error("not implemented")]
    NotImplemented,
    #[error("generic failure")]
    Generic,
}

impl TeError {
    pub fn result(self) -> OteResult {
        match self {
            TeError::BadParameters => OteResult::BadParameters,
            TeError::OutOfMemory => OteResult::OutOfMemory,
            TeError::NotImplemented => OteResult::NotImplemented,
            TeError::Generic => OteResult::Generic,
        }
    }

    /// The wire result code for this error.
    pub fn code(self) -> u32 {
        self.result().into()
    }

    pub fn origin(self) -> ResultOrigin {
        ResultOrigin::Api
    }
}

const TE_PARAM_TYPE_NONE: u32 = 0;
const TE_PARAM_TYPE_INT_RO: u32 = 1;
const TE_PARAM_TYPE_INT_RW: u32 = 2;
const TE_PARAM_TYPE_MEM_RO: u32 = 3;
const TE_PARAM_TYPE_MEM_RW: u32 = 4;
const TE_PARAM_TYPE_PERSIST_MEM_RO: u32 = 5;
const TE_PARAM_TYPE_PERSIST_MEM_RW: u32 = 6;

/// Declared type of a request parameter.
#[derive(Clone, Copy, TryFromPrimitive, PartialEq, Eq, Debug)]
#[repr(u32)]
pub enum TeParamType {
    None = TE_PARAM_TYPE_NONE,
    IntRo = TE_PARAM_TYPE_INT_RO,
    IntRw = TE_PARAM_TYPE_INT_RW,
    MemRo = TE_PARAM_TYPE_MEM_RO,
    MemRw = TE_PARAM_TYPE_MEM_RW,
    PersistMemRo = TE_PARAM_TYPE_PERSIST_MEM_RO,
    PersistMemRw = TE_PARAM_TYPE_PERSIST_MEM_RW,
}

impl TeParamType {
    /// Whether the parameter references a user buffer that must be pinned.
    pub fn is_memory(self) -> bool {
        matches!(
            self,
            Self::MemRo | Self::MemRw | Self::PersistMemRo | Self::PersistMemRw
        )
    }

    /// Whether the secure side may write through the parameter.
    pub fn is_writable(self) -> bool {
        matches!(self, Self::MemRw | Self::PersistMemRw)
    }

    /// Whether a memory binding outlives the call that introduced it.
    pub fn is_persistent(self) -> bool {
        matches!(self, Self::PersistMemRo | Self::PersistMemRw)
    }
}

impl From<TeParamType> for u32 {
    fn from(ty: TeParamType) -> Self {
        ty as u32
    }
}

/// Identity of a secure service, as four native-endian words.
#[derive(Clone, Copy, PartialEq, Eq, Hash, Default, Debug, FromBytes, Immutable, IntoBytes)]
#[repr(C)]
pub struct TeServiceId(pub [u32; 4]);

impl TeServiceId {
    /// Builds an id from the 16 bytes of an RFC 4122 UUID (big-endian words).
    pub fn from_bytes(data: [u8; 16]) -> Self {
        let mut words = [0u32; 4];
        for (word, chunk) in words.iter_mut().zip(data.chunks_exact(4)) {
            *word = u32::from_be_bytes([chunk[0], chunk[1], chunk[2], chunk[3]]);
        }
        Self(words)
    }

    pub fn to_bytes(self) -> [u8; 16] {
        let mut data = [0u8; 16];
        for (chunk, word) in data.chunks_exact_mut(4).zip(self.0) {
            chunk.copy_from_slice(&word.to_be_bytes());
        }
        data
    }
}

impl fmt::Display for TeServiceId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let b = self.to_bytes();
        write!(
            f,
            "{:02x}{:02x}{:02x}{:02x}-{:02x}{:02x}-{:02x}{:02x}-{:02x}{:02x}-{:02x}{:02x}{:02x}{:02x}{:02x}{:02x}",
            b[0], b[1], b[2], b[3], b[4], b[5], b[6], b[7], b[8], b[9], b[10], b[11], b[12], b[13],
            b[14], b[15]
        )
    }
}

#[derive(Error, Debug, Clone, Copy, PartialEq, Eq)]
#[error("malformed service id")]
pub struct ParseServiceIdError;

impl FromStr for TeServiceId {
    type Err = ParseServiceIdError;

    /// Parses the canonical hyphenated form `xxxxxxxx-xxxx-xxxx-xxxx-xxxxxxxxxxxx`.
    fn from_str(s: &str) -> Result<Self, Self::Err> {
        const GROUPS: [usize; 5] = [8, 4, 4, 4, 12];
        let mut data = [0u8; 16];
        let mut filled = 0;
        let mut groups = s.split('-');
        for expected in GROUPS {
            let group = groups.next().ok_or(ParseServiceIdError)?;
            if group.len() != expected || !group.bytes().all(|b| b.is_ascii_hexdigit()) {
                return Err(ParseServiceIdError);
            }
            for pair in group.as_bytes().chunks_exact(2) {
                let hex = core::str::from_utf8(pair).map_err(|_| ParseServiceIdError)?;
                data[filled] = u8::from_str_radix(hex, 16).map_err(|_| ParseServiceIdError)?;
                filled += 1;
            }
        }
        if groups.next().is_some() {
            return Err(ParseServiceIdError);
        }
        Ok(Self::from_bytes(data))
    }
}

/// Request header in the native layout. The parameter list is referenced by a pointer-width
/// address.
#[derive(Clone, Copy, Default, Debug, FromBytes, Immutable, IntoBytes, KnownLayout)]
#[repr(C)]
pub struct TeRequest {
    pub req_type: u32,
    pub session_id: u32,
    pub command_id: u32,
    pub params_size: u32,
    pub params: usize,
    pub dest_uuid: [u32; 4],
    pub result: u32,
    pub result_origin: u32,
}

/// Request header in the compat layout. Every address is carried as 64 bits.
#[derive(Clone, Copy, Default, Debug, FromBytes, Immutable, IntoBytes, KnownLayout)]
#[repr(C)]
pub struct TeRequestCompat {
    pub req_type: u32,
    pub session_id: u32,
    pub command_id: u32,
    pub params_size: u32,
    pub params: u64,
    pub dest_uuid: [u32; 4],
    pub result: u32,
    pub result_origin: u32,
}

/// One request parameter in the native layout.
///
/// For integer parameters `base_or_value` holds the value and `len` is unused. For memory
/// parameters it holds the user address of the buffer.
#[derive(Clone, Copy, Default, Debug, FromBytes, Immutable, IntoBytes, KnownLayout)]
#[repr(C)]
pub struct TeOperParam {
    pub index: u32,
    pub param_type: u32,
    pub base_or_value: usize,
    pub len: u32,
    pub reserved: u32,
    pub next_ptr_user: usize,
}

/// One request parameter in the compat layout.
#[derive(Clone, Copy, Default, Debug, FromBytes, Immutable, IntoBytes, KnownLayout)]
#[repr(C)]
pub struct TeOperParamCompat {
    pub index: u32,
    pub param_type: u32,
    pub base_or_value: u64,
    pub len: u32,
    pub reserved: u32,
    pub next_ptr_user: u64,
}

impl TeOperParam {
    pub fn memory(index: u32, ty: TeParamType, base: usize, len: u32) -> Self {
        Self {
            index,
            param_type: ty.into(),
            base_or_value: base,
            len,
            ..Self::default()
        }
    }

    pub fn value(index: u32, ty: TeParamType, value: u32) -> Self {
        Self {
            index,
            param_type: ty.into(),
            base_or_value: value as usize,
            ..Self::default()
        }
    }
}

impl TeOperParamCompat {
    pub fn memory(index: u32, ty: TeParamType, base: u64, len: u32) -> Self {
        Self {
            index,
            param_type: ty.into(),
            base_or_value: base,
            len,
            ..Self::default()
        }
    }

    pub fn value(index: u32, ty: TeParamType, value: u32) -> Self {
        Self {
            index,
            param_type: ty.into(),
            base_or_value: u64::from(value),
            ..Self::default()
        }
    }
}
