// Copyright (c) Microsoft Corporation.
// Licensed under the MIT license.

//! Issuing secure calls.
//!
//! A logical call may take several underlying calls to finish: the secure side can give the core
//! back early because a normal-world interrupt arrived or because it is waiting for the storage
//! proxy, and (in the compat layout) it can ask the normal world to run a callback. Each logical
//! call is driven through [`CallState`] until it is done.

use alloc::sync::Arc;
use core::marker::PhantomData;
use core::sync::atomic::{AtomicU32, Ordering};
use otebox_common::smc_nr::{NsCallback, TePreemption, TeSmcFunction};
use otebox_common::{OteResult, PAGE_SIZE, ResultOrigin, TeError};

use crate::buffer::CallBuffer;
use crate::layout::{Native, WireLayout};
use crate::platform::{CallReturnedNotifier, ExtendedCallRegs, Provider, RawCompletion};
use crate::sync::Mutex;
use crate::{CallOutcome, CommsConfig, NativeBuffers, ScratchAddressing, TransportMode};

/// Which scratch buffer a request goes through, and how the secure side is told where it is.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub(crate) enum Scratch {
    /// A buffer allocated for this call only, passed by physical address.
    PerCall,
    /// The channel's long-lived buffer, passed as offsets from its registered base.
    SharedOffset,
    /// The channel's long-lived buffer, passed by physical address.
    SharedPhysical,
}

/// Where the underlying calls of one logical call are issued from.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub(crate) enum Placement {
    /// Issue from the current core.
    InPlace,
    /// Move the current task to the boot core for the duration of the call.
    Migrate,
    /// Hand each call to the boot core and wait for it.
    Dispatch,
}

/// Progress of one logical call.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub(crate) enum CallState {
    /// An underlying call returned this status.
    Issued(u32),
    PreemptedIrq,
    PreemptedIo,
    /// The secure side asked for the given normal-world callback.
    CallbackPending(u32),
    Done(CallOutcome),
}

/// Tracks calls through the call channel so that a `Retry` callback can wait for "some other call
/// has returned since ours".
pub(crate) struct InFlightCalls<C> {
    pending: AtomicU32,
    completion: C,
}

impl<C: RawCompletion> InFlightCalls<C> {
    fn new(completion: C) -> Self {
        Self {
            pending: AtomicU32::new(0),
            completion,
        }
    }

    /// Expect two returns: our own call's and one more.
    fn arm(&self) {
        self.completion.reinit();
        self.pending.store(2, Ordering::SeqCst);
    }

    fn wait(&self) {
        self.completion.wait();
    }
}

impl<C: RawCompletion> CallReturnedNotifier for InFlightCalls<C> {
    fn call_returned(&self) {
        let previous = self
            .pending
            .fetch_update(Ordering::SeqCst, Ordering::SeqCst, |n| n.checked_sub(1));
        if previous == Ok(1) {
            self.completion.complete();
        }
    }
}

/// Restores the saved affinity of the current task on drop.
struct AffinityGuard<'p, P: Provider> {
    provider: &'p P,
    saved: Option<P::Affinity>,
}

impl<'p, P: Provider> AffinityGuard<'p, P> {
    fn pin(provider: &'p P) -> Option<Self> {
        match provider.pin_current_to_boot_cpu() {
            Ok(saved) => Some(Self {
                provider,
                saved: Some(saved),
            }),
            Err(err) => {
                log::error!(err:% = err; "could not move to the boot cpu, calling in place");
                None
            }
        }
    }
}

impl<P: Provider> Drop for AffinityGuard<'_, P> {
    fn drop(&mut self) {
        if let Some(saved) = self.saved.take() {
            self.provider.restore_affinity(saved);
        }
    }
}

/// The only path to the secure side.
///
/// Owns the platform, the long-lived call buffer and the lock serializing its users.
pub(crate) struct SecureChannel<P: Provider> {
    provider: P,
    config: CommsConfig,
    /// Held for the whole of every call through the long-lived buffer, preemptions and callbacks
    /// included.
    shared: Mutex<P, CallBuffer>,
    in_flight: Option<Arc<InFlightCalls<P::Completion>>>,
}

impl<P: Provider> SecureChannel<P> {
    /// Set up the channel and introduce it to the secure side.
    pub(crate) fn new(provider: P, config: CommsConfig) -> Result<Self, TeError> {
        let shared = CallBuffer::new()?;
        let in_flight = match config.transport {
            TransportMode::SecureMonitor => None,
            TransportMode::CallChannel => {
                Some(Arc::new(InFlightCalls::new(provider.new_completion())))
            }
        };
        let shared = Mutex::new(&provider, shared);
        let channel = Self {
            provider,
            config,
            shared,
            in_flight,
        };
        channel.register()?;
        Ok(channel)
    }

    fn register(&self) -> Result<(), TeError> {
        match &self.in_flight {
            Some(in_flight) => {
                let notifier: Arc<dyn CallReturnedNotifier> = in_flight.clone();
                self.provider.register_call_returned_notifier(notifier);
            }
            None => {
                let entry = self.provider.irq_handler_entry();
                let status = self.call(TeSmcFunction::RegisterIrqHandler, entry, 0);
                if status != u32::from(OteResult::Success) {
                    log::error!(status = status; "secure side refused the interrupt handler");
                }
            }
        }

        if self.config.compat_addressing == ScratchAddressing::Offset
            || self.config.native_buffers == NativeBuffers::Shared
        {
            let base = self.provider.virt_to_phys(self.shared.lock().request_addr());
            let status = self.call(TeSmcFunction::RegisterRequestBuffer, base, 2 * PAGE_SIZE);
            if status != u32::from(OteResult::Success) {
                log::error!(status = status; "secure side refused the request buffer");
                return Err(TeError::Generic);
            }
        }
        Ok(())
    }

    pub(crate) fn provider(&self) -> &P {
        &self.provider
    }

    pub(crate) fn config(&self) -> &CommsConfig {
        &self.config
    }

    fn placement(&self) -> Placement {
        if self.config.transport == TransportMode::CallChannel {
            Placement::InPlace
        } else if self.provider.can_migrate_current() {
            Placement::Migrate
        } else if self.provider.current_cpu() == 0 {
            Placement::InPlace
        } else {
            Placement::Dispatch
        }
    }

    fn transaction<'b, L: WireLayout>(
        &self,
        scratch: Option<(&'b mut CallBuffer, usize, usize)>,
    ) -> Transaction<'_, 'b, P, L> {
        let placement = self.placement();
        let affinity = if placement == Placement::Migrate {
            AffinityGuard::pin(&self.provider)
        } else {
            None
        };
        Transaction {
            channel: self,
            placement,
            _affinity: affinity,
            scratch,
            _layout: PhantomData,
        }
    }

    /// A call that passes no buffers, driven to completion. Returns the final status.
    fn call(&self, func: TeSmcFunction, arg1: usize, arg2: usize) -> u32 {
        let mut txn = self.transaction::<Native>(None);
        let outcome = txn.run(func, arg1, arg2);
        drop(txn);
        self.provider.drain_secure_log();
        outcome.result
    }

    /// Marshal `request` and `params` into a scratch buffer and drive the call to completion.
    ///
    /// On return `request` and `params` hold whatever the secure side wrote back.
    pub(crate) fn submit<L: WireLayout>(
        &self,
        func: TeSmcFunction,
        request: &mut L::Request,
        params: &mut [L::Param],
    ) -> Result<CallOutcome, TeError> {
        let scratch = L::scratch(&self.config);
        if scratch == Scratch::PerCall {
            let mut buffer = CallBuffer::new()?;
            self.transact::<L>(&mut buffer, scratch, func, request, params)
        } else {
            let mut buffer = self.shared.lock();
            self.transact::<L>(&mut buffer, scratch, func, request, params)
        }
    }

    fn transact<L: WireLayout>(
        &self,
        buffer: &mut CallBuffer,
        scratch: Scratch,
        func: TeSmcFunction,
        request: &mut L::Request,
        params: &mut [L::Param],
    ) -> Result<CallOutcome, TeError> {
        let (arg1, params_arg) = match scratch {
            Scratch::SharedOffset => (0, PAGE_SIZE),
            Scratch::PerCall | Scratch::SharedPhysical => (
                self.provider.virt_to_phys(buffer.request_addr()),
                self.provider.virt_to_phys(buffer.params_addr()),
            ),
        };
        let arg2 = if params.is_empty() {
            0
        } else {
            let count = u32::try_from(params.len()).map_err(|_| TeError::BadParameters)?;
            L::link_params(params, params_arg);
            L::set_param_list(request, params_arg, count);
            params_arg
        };
        buffer.write_params(params)?;
        buffer.write_request(request);

        let mut txn = self.transaction::<L>(Some((&mut *buffer, arg1, arg2)));
        let outcome = txn.run(func, arg1, arg2);
        drop(txn);

        *request = buffer.read_request();
        buffer.read_params(params);
        self.provider.drain_secure_log();
        Ok(outcome)
    }

    /// Program the bounds of the protected memory region into the secure side.
    pub(crate) fn program_protected_region(&self, base: usize, size: usize) -> Result<(), TeError> {
        let status = {
            let _lock = self.shared.lock();
            self.call(TeSmcFunction::ProgramProtectedRegion, base, size)
        };
        if status == u32::from(OteResult::Success) {
            Ok(())
        } else {
            log::error!(status = status; "programming the protected region failed");
            Err(TeError::Generic)
        }
    }

    /// Issue a register-block call, re-entering it while it is preempted by interrupts.
    pub(crate) fn extended_call(&self, regs: &mut ExtendedCallRegs) -> Result<u32, TeError> {
        if self.config.transport == TransportMode::CallChannel {
            return Err(TeError::Generic);
        }
        let mut txn = self.transaction::<Native>(None);
        let status = txn.place(&mut || self.provider.extended_call(regs));
        let outcome = txn.finish(CallState::Issued(status));
        drop(txn);
        self.provider.drain_secure_log();
        Ok(outcome.result)
    }

    fn run_callback(&self, code: u32) -> u32 {
        match NsCallback::try_from(code) {
            Ok(NsCallback::Retry) => {
                if let Some(in_flight) = &self.in_flight {
                    in_flight.wait();
                }
                OteResult::Success.into()
            }
            Ok(NsCallback::SecureStorage) => self.provider.service_storage_request(),
            Err(_) => {
                log::error!(code = code; "unknown secure-side callback");
                OteResult::NotImplemented.into()
            }
        }
    }
}

/// One logical call in progress.
struct Transaction<'c, 'b, P: Provider, L: WireLayout> {
    channel: &'c SecureChannel<P>,
    placement: Placement,
    _affinity: Option<AffinityGuard<'c, P>>,
    /// The scratch buffer with the request, and the addresses the secure side knows it by.
    scratch: Option<(&'b mut CallBuffer, usize, usize)>,
    _layout: PhantomData<L>,
}

impl<P: Provider, L: WireLayout> Transaction<'_, '_, P, L> {
    fn run(&mut self, func: TeSmcFunction, arg1: usize, arg2: usize) -> CallOutcome {
        self.arm();
        let state = self.issue(func, arg1, arg2);
        self.finish(state)
    }

    fn finish(&mut self, mut state: CallState) -> CallOutcome {
        loop {
            if let CallState::Done(outcome) = state {
                return outcome;
            }
            state = self.step(state);
        }
    }

    fn step(&mut self, state: CallState) -> CallState {
        match state {
            CallState::Issued(status) => self.classify(status),
            CallState::PreemptedIrq => self.issue(TePreemption::Irq.resume_function(), 0, 0),
            CallState::PreemptedIo => {
                let status = self.channel.provider.service_storage_request();
                log::debug!(status = status; "serviced storage request");
                self.issue(TePreemption::Storage.resume_function(), 0, 0)
            }
            CallState::CallbackPending(code) => {
                let result = self.channel.run_callback(code);
                let Some((buffer, arg1, arg2)) = self.scratch.as_mut() else {
                    return CallState::Done(CallOutcome {
                        result,
                        origin: ResultOrigin::Comms.into(),
                    });
                };
                let (arg1, arg2) = (*arg1, *arg2);
                let mut request: L::Request = buffer.read_request();
                L::set_callback_result(&mut request, code, result);
                buffer.write_request(&request);
                self.arm();
                self.issue(TeSmcFunction::NsCallbackComplete, arg1, arg2)
            }
            done @ CallState::Done(_) => done,
        }
    }

    fn classify(&self, status: u32) -> CallState {
        match TePreemption::try_from(status) {
            Ok(TePreemption::Irq) => CallState::PreemptedIrq,
            Ok(TePreemption::Storage) => CallState::PreemptedIo,
            // A failing call may not have touched the request at all.
            Err(_) if status != u32::from(OteResult::Success) => CallState::Done(CallOutcome {
                result: status,
                origin: ResultOrigin::Comms.into(),
            }),
            Err(_) => match &self.scratch {
                Some((buffer, ..)) => {
                    let request: L::Request = buffer.read_request();
                    match L::pending_callback(&request) {
                        Some(code) => CallState::CallbackPending(code),
                        None => CallState::Done(L::outcome(&request)),
                    }
                }
                None => CallState::Done(CallOutcome {
                    result: status,
                    origin: ResultOrigin::Comms.into(),
                }),
            },
        }
    }

    /// Prepare the in-flight counter before a call that may end in a `Retry` callback.
    fn arm(&self) {
        if L::HAS_CALLBACKS
            && self.scratch.is_some()
            && let Some(in_flight) = &self.channel.in_flight
        {
            in_flight.arm();
        }
    }

    fn issue(&mut self, func: TeSmcFunction, arg1: usize, arg2: usize) -> CallState {
        let channel = self.channel;
        let func = u32::from(func);
        if channel.config.verbose_smc {
            log::trace!(func = func, arg1 = arg1, arg2 = arg2; "secure call");
        }
        let status = self.place(&mut || channel.provider.generic_call(func, arg1, arg2));
        if channel.config.verbose_smc {
            log::trace!(func = func, status = status; "secure call returned");
        }
        CallState::Issued(status)
    }

    /// Run one underlying call according to the placement of this transaction.
    fn place(&self, call: &mut (dyn FnMut() -> u32 + Send)) -> u32 {
        if self.placement == Placement::Dispatch {
            match self.channel.provider.run_on_boot_cpu(call) {
                Ok(status) => return status,
                Err(err) => {
                    log::error!(
                        err:% = err;
                        "could not dispatch to the boot cpu, calling in place"
                    );
                }
            }
        }
        call()
    }
}
