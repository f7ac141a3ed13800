// Copyright (c) Microsoft Corporation.
// Licensed under the MIT license.

//! # OTEBox communications core
//!
//! Carries requests from normal-world clients to a Trusted Execution Environment: it pins the
//! user buffers a request refers to, keeps track of the sessions each client has opened, and
//! drives secure calls to completion across preemptions and normal-world callbacks.
//!
//! To use it, provide a type implementing [`platform::Provider`], build a [`TeeDevice`] on top of
//! it, and open one [`TeeContext`] per client.

#![no_std]

extern crate alloc;

mod buffer;
mod context;
mod layout;
pub mod platform;
pub mod session;
pub mod shmem;
mod smc;
mod sync;

#[cfg(test)]
pub(crate) mod mock;

pub use context::{SessionOpened, TeeContext};
pub use otebox_common::TeError;

use otebox_common::OteResult;
use platform::{ExtendedCallRegs, Provider};
use smc::SecureChannel;

/// How calls reach the secure side.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub enum TransportMode {
    /// Raw secure monitor calls, issued from the boot core.
    #[default]
    SecureMonitor,
    /// An isolated call channel that reports every returning call.
    CallChannel,
}

/// Where native-layout requests are marshaled.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub enum NativeBuffers {
    /// A fresh buffer per call, passed by physical address.
    #[default]
    PerCall,
    /// The long-lived buffer registered with the secure side, passed by offset.
    Shared,
}

/// How compat-layout requests in the long-lived buffer are addressed.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub enum ScratchAddressing {
    /// Offsets from the registered buffer base.
    #[default]
    Offset,
    /// Physical addresses.
    Physical,
}

/// Configuration of a [`TeeDevice`].
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub struct CommsConfig {
    pub transport: TransportMode,
    pub native_buffers: NativeBuffers,
    pub compat_addressing: ScratchAddressing,
    /// Trace every underlying secure call.
    pub verbose_smc: bool,
}

/// Final result of a call, as reported by the secure side.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct CallOutcome {
    pub result: u32,
    pub origin: u32,
}

impl CallOutcome {
    pub fn is_success(&self) -> bool {
        self.result == u32::from(OteResult::Success)
    }
}

/// The TEE device: one per platform, shared by every client.
pub struct TeeDevice<P: Provider> {
    channel: SecureChannel<P>,
}

impl<P: Provider> TeeDevice<P> {
    /// Bring the device up, registering it with the secure side.
    pub fn new(provider: P, config: CommsConfig) -> Result<Self, TeError> {
        let channel = SecureChannel::new(provider, config)?;
        log::info!(
            transport:? = config.transport,
            native_buffers:? = config.native_buffers,
            compat_addressing:? = config.compat_addressing;
            "tee device ready"
        );
        Ok(Self { channel })
    }

    /// Open a context for a new client.
    pub fn open_context(&self) -> TeeContext<'_, P> {
        TeeContext::new(self)
    }

    pub fn platform(&self) -> &P {
        self.channel.provider()
    }

    pub fn config(&self) -> &CommsConfig {
        self.channel.config()
    }

    /// Program the bounds of the protected memory region into the secure side.
    pub fn program_protected_region(&self, base: usize, size: usize) -> Result<(), TeError> {
        self.channel.program_protected_region(base, size)
    }

    /// Issue a raw register-block call. Not available over a call channel.
    pub fn extended_call(&self, regs: &mut ExtendedCallRegs) -> Result<u32, TeError> {
        self.channel.extended_call(regs)
    }
}
