// Copyright (c) Microsoft Corporation.
// Licensed under the MIT license.

//! JSON-formatted command sequences.

use otebox_common::{OteResult, TeParamType};
use serde::Deserialize;

/// One step of a command sequence.
#[derive(Debug, Deserialize)]
#[serde(tag = "op", rename_all = "snake_case")]
pub enum Command {
    OpenSession {
        /// Hyphenated service UUID.
        service: String,
        #[serde(default)]
        layout: Layout,
        #[serde(default)]
        params: Vec<Param>,
        #[serde(default)]
        expect: Expected,
        /// Session id the secure side is expected to hand out.
        #[serde(default)]
        expect_session: Option<u32>,
    },
    CloseSession {
        session: u32,
        #[serde(default)]
        layout: Layout,
        #[serde(default)]
        expect: Expected,
    },
    LaunchOperation {
        session: u32,
        command: u32,
        #[serde(default)]
        layout: Layout,
        #[serde(default)]
        params: Vec<Param>,
        #[serde(default)]
        expect: Expected,
    },
    ProgramProtectedRegion {
        base: usize,
        size: usize,
        #[serde(default)]
        expect: Expected,
    },
    /// Check the bookkeeping of the client and the platform.
    Check {
        #[serde(default)]
        sessions: Option<Vec<u32>>,
        #[serde(default)]
        pinned_pages: Option<usize>,
    },
}

#[derive(Clone, Copy, Debug, Default, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub enum Layout {
    #[default]
    Native,
    Compat,
}

/// A request parameter.
#[derive(Debug, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum Param {
    IntRo {
        value: u32,
    },
    IntRw {
        value: u32,
        /// Value expected after the call.
        #[serde(default)]
        expect: Option<u32>,
    },
    MemRo {
        data: String,
    },
    MemRw {
        data: String,
        #[serde(default)]
        expect: Option<String>,
    },
    PersistMemRo {
        size: usize,
    },
    PersistMemRw {
        size: usize,
    },
    /// A raw type code, for exercising validation.
    Raw {
        code: u32,
    },
}

impl Param {
    pub fn type_code(&self) -> u32 {
        match self {
            Param::IntRo { .. } => TeParamType::IntRo.into(),
            Param::IntRw { .. } => TeParamType::IntRw.into(),
            Param::MemRo { .. } => TeParamType::MemRo.into(),
            Param::MemRw { .. } => TeParamType::MemRw.into(),
            Param::PersistMemRo { .. } => TeParamType::PersistMemRo.into(),
            Param::PersistMemRw { .. } => TeParamType::PersistMemRw.into(),
            Param::Raw { code } => *code,
        }
    }
}

/// Expected final result of a step.
#[derive(Clone, Copy, Debug, Default, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub enum Expected {
    #[default]
    Success,
    Generic,
    BadParameters,
    ItemNotFound,
    NotImplemented,
    OutOfMemory,
}

impl Expected {
    pub fn code(self) -> u32 {
        let result = match self {
            Expected::Success => OteResult::Success,
            Expected::Generic => OteResult::Generic,
            Expected::BadParameters => OteResult::BadParameters,
            Expected::ItemNotFound => OteResult::ItemNotFound,
            Expected::NotImplemented => OteResult::NotImplemented,
            Expected::OutOfMemory => OteResult::OutOfMemory,
        };
        result.into()
    }
}
