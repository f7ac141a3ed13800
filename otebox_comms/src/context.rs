// Copyright (c) Microsoft Corporation.
// Licensed under the MIT license.

//! Per-client request handling: open, close, and launch, in both parameter layouts.

use otebox_common::smc_nr::TeSmcFunction;
use otebox_common::{TeError, TeOperParam, TeOperParamCompat, TeServiceId};

use crate::buffer::CallBuffer;
use crate::layout::{Compat, Native, WireLayout};
use crate::platform::{Provider, UserPagesProvider};
use crate::session::SessionRegistry;
use crate::shmem::{RequestContext, ShmemAccess};
use crate::{CallOutcome, TeeDevice};

/// Result of an open request that reached the secure side.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct SessionOpened {
    /// Id assigned by the secure side. Only meaningful if `outcome` is a success.
    pub session_id: u32,
    pub outcome: CallOutcome,
}

/// The state of one client of a [`TeeDevice`].
///
/// Failures detected locally return `Err`, and nothing they pinned stays pinned. Most of them are
/// caught before any call is sent. Two are only caught after the secure side has answered:
///
/// - an open whose returned session id is already registered with this context, and
/// - a launch whose session was closed by another thread while the call was in flight.
///
/// Both return `Err(TeError::BadParameters)` and release the request's buffers, while the secure
/// side keeps whatever session state the call created.
///
/// Every other outcome, failure or not, is the secure side's result returned as is.
///
/// Dropping the context releases the buffers of every session it still has open.
pub struct TeeContext<'d, P: Provider> {
    device: &'d TeeDevice<P>,
    sessions: SessionRegistry<<P as UserPagesProvider>::Page>,
}

impl<'d, P: Provider> TeeContext<'d, P> {
    pub(crate) fn new(device: &'d TeeDevice<P>) -> Self {
        Self {
            device,
            sessions: SessionRegistry::new(),
        }
    }

    /// The sessions this client has open.
    ///
    /// The registry is read-only from outside the crate:
    ///
    /// ```compile_fail
    /// use otebox_comms::TeeContext;
    /// use otebox_comms::platform::Provider;
    ///
    /// fn forget<P: Provider>(ctx: &TeeContext<'_, P>) {
    ///     let _ = ctx.sessions().erase(1);
    /// }
    /// ```
    pub fn sessions(&self) -> &SessionRegistry<<P as UserPagesProvider>::Page> {
        &self.sessions
    }

    pub fn open_session(
        &self,
        dest: TeServiceId,
        params: &mut [TeOperParam],
    ) -> Result<SessionOpened, TeError> {
        self.open::<Native>(dest, params)
    }

    pub fn open_session_compat(
        &self,
        dest: TeServiceId,
        params: &mut [TeOperParamCompat],
    ) -> Result<SessionOpened, TeError> {
        self.open::<Compat>(dest, params)
    }

    /// Close a session. Its buffers are released whatever the secure side reports.
    pub fn close_session(&self, session_id: u32) -> Result<CallOutcome, TeError> {
        self.close::<Native>(session_id)
    }

    pub fn close_session_compat(&self, session_id: u32) -> Result<CallOutcome, TeError> {
        self.close::<Compat>(session_id)
    }

    pub fn launch_operation(
        &self,
        session_id: u32,
        command_id: u32,
        params: &mut [TeOperParam],
    ) -> Result<CallOutcome, TeError> {
        self.launch::<Native>(session_id, command_id, params)
    }

    pub fn launch_operation_compat(
        &self,
        session_id: u32,
        command_id: u32,
        params: &mut [TeOperParamCompat],
    ) -> Result<CallOutcome, TeError> {
        self.launch::<Compat>(session_id, command_id, params)
    }

    fn provider(&self) -> &'d P {
        self.device.platform()
    }

    /// Pin the buffers of every memory parameter. Pinned buffers are released by `ctx` if any
    /// later parameter fails.
    fn pin_params<L: WireLayout>(
        ctx: &mut RequestContext<'_, P>,
        params: &[L::Param],
    ) -> Result<(), TeError> {
        if params.len() > CallBuffer::param_capacity::<L::Param>() {
            log::error!(count = params.len(); "too many parameters");
            return Err(TeError::BadParameters);
        }
        for param in params {
            let view = L::decode_param(param)?;
            if let Some(access) = ShmemAccess::for_param(view.ty) {
                ctx.pin(view.base, view.len, access)?;
            }
        }
        Ok(())
    }

    fn open<L: WireLayout>(
        &self,
        dest: TeServiceId,
        params: &mut [L::Param],
    ) -> Result<SessionOpened, TeError> {
        let mut ctx = RequestContext::new(self.provider());
        Self::pin_params::<L>(&mut ctx, params)?;

        let func = TeSmcFunction::OpenSession;
        let mut request = L::new_request(func, 0, 0, Some(dest));
        let outcome = self.device.channel.submit::<L>(func, &mut request, params)?;
        let session_id = L::session_id(&request);

        if outcome.is_success() {
            if let Err(err) = self.sessions.allocate_with(session_id, ctx.persistent_mut()) {
                log::error!(err:% = err; "secure side returned a session id already in use");
                return Err(TeError::BadParameters);
            }
            log::info!(session_id = session_id, layout = L::NAME; "opened session with {dest}");
        } else {
            log::warn!(
                result = outcome.result,
                origin = outcome.origin;
                "secure side rejected session with {dest}"
            );
        }
        Ok(SessionOpened {
            session_id,
            outcome,
        })
    }

    fn close<L: WireLayout>(&self, session_id: u32) -> Result<CallOutcome, TeError> {
        if !self.sessions.contains(session_id) {
            log::error!(session_id = session_id; "close of unknown session");
            return Err(TeError::BadParameters);
        }

        let func = TeSmcFunction::CloseSession;
        let mut request = L::new_request(func, session_id, 0, None);
        let outcome = self.device.channel.submit::<L>(func, &mut request, &mut [])?;
        if !outcome.is_success() {
            log::warn!(
                session_id = session_id,
                result = outcome.result,
                origin = outcome.origin;
                "secure side failed to close session, releasing it anyway"
            );
        }

        match self.sessions.erase(session_id) {
            Ok(session) => session.release(self.provider()),
            Err(err) => log::warn!(err:% = err; "session went away during close"),
        }
        log::info!(session_id = session_id, layout = L::NAME; "closed session");
        Ok(outcome)
    }

    fn launch<L: WireLayout>(
        &self,
        session_id: u32,
        command_id: u32,
        params: &mut [L::Param],
    ) -> Result<CallOutcome, TeError> {
        if !self.sessions.contains(session_id) {
            log::error!(session_id = session_id; "launch on unknown session");
            return Err(TeError::BadParameters);
        }
        let mut ctx = RequestContext::new(self.provider());
        Self::pin_params::<L>(&mut ctx, params)?;

        let func = TeSmcFunction::LaunchOperation;
        let mut request = L::new_request(func, session_id, command_id, None);
        let outcome = self.device.channel.submit::<L>(func, &mut request, params)?;

        if outcome.is_success()
            && let Err(err) = self.sessions.attach(session_id, ctx.persistent_mut())
        {
            log::error!(err:% = err; "session went away during launch");
            return Err(TeError::BadParameters);
        }
        log::debug!(
            session_id = session_id,
            command_id = command_id,
            result = outcome.result;
            "operation launched"
        );
        Ok(outcome)
    }
}

impl<P: Provider> Drop for TeeContext<'_, P> {
    fn drop(&mut self) {
        for session in self.sessions.drain() {
            session.release(self.provider());
        }
    }
}

#[cfg(test)]
mod tests {
    extern crate std;

    use super::*;
    use crate::mock::{MockPlatform, Reply};
    use crate::session::{Session, SessionError};
    use crate::{CommsConfig, NativeBuffers, ScratchAddressing, TransportMode};
    use otebox_common::smc_nr::{
        OTE_ERROR_NS_CB, TE_ERROR_PREEMPT_BY_IRQ, TE_SMC_CLOSE_SESSION, TE_SMC_LAUNCH_OPERATION,
        TE_SMC_NS_CB_COMPLETE, TE_SMC_OPEN_SESSION, TE_SMC_RESTART_LAST,
    };
    use otebox_common::{OteResult, PAGE_SIZE, ResultOrigin, TeParamType};

    const SERVICE: TeServiceId = TeServiceId([0x8aaa_f200, 0x2450_11e4, 0xabe2_0002, 0xa5d5_c51b]);
    const TEE: u32 = ResultOrigin::Tee as u32;

    fn device(config: CommsConfig) -> TeeDevice<MockPlatform> {
        let device = TeeDevice::new(MockPlatform::new(), config).unwrap();
        device.platform().clear_calls();
        device
    }

    fn opened(session_id: u32) -> Reply {
        Reply::Complete {
            result: 0,
            origin: TEE,
            session_id,
        }
    }

    #[test]
    fn test_open_launch_close_lifecycle() {
        let device = device(CommsConfig::default());
        let platform = device.platform();
        let ctx = device.open_context();

        platform.push_replies([opened(7)]);
        let mut params = [TeOperParam::memory(0, TeParamType::PersistMemRw, 0x1000, 4096)];
        let open = ctx.open_session(SERVICE, &mut params).unwrap();
        assert_eq!(open.session_id, 7);
        assert!(open.outcome.is_success());
        assert_eq!(ctx.sessions().lookup(7, |s| s.persistent().len()), Ok(1));
        assert_eq!(platform.pinned_pages(), 1);

        let mut params = [TeOperParam::memory(0, TeParamType::PersistMemRo, 0x2000, 8192)];
        let launch = ctx.launch_operation(7, 1, &mut params).unwrap();
        assert!(launch.is_success());
        assert_eq!(
            ctx.sessions().lookup(7, |s| (s.persistent().len(), s.pinned_pages())),
            Ok((2, 3))
        );
        assert_eq!(platform.pinned_pages(), 3);

        platform.push_replies([Reply::Result(OteResult::BadState.into())]);
        let close = ctx.close_session(7).unwrap();
        assert_eq!(close.result, u32::from(OteResult::BadState));
        assert_eq!(ctx.sessions().lookup(7, Session::id), Err(SessionError::NotFound(7)));
        assert_eq!(platform.pinned_pages(), 0);
        // Only the read-write binding is written back.
        assert_eq!(platform.dirtied_pages(), 1);

        assert_eq!(
            platform.call_funcs(),
            [TE_SMC_OPEN_SESSION, TE_SMC_LAUNCH_OPERATION, TE_SMC_CLOSE_SESSION]
        );
        // The close request carries no parameter list.
        assert_eq!(platform.calls()[2].2, 0);
    }

    #[test]
    fn test_temporary_buffers_do_not_outlive_the_call() {
        let device = device(CommsConfig::default());
        let platform = device.platform();
        let ctx = device.open_context();

        platform.push_replies([opened(7)]);
        let mut params = [TeOperParam::memory(0, TeParamType::MemRw, 0x1000, 4096)];
        ctx.open_session(SERVICE, &mut params).unwrap();
        assert_eq!(ctx.sessions().lookup(7, |s| s.persistent().len()), Ok(0));
        assert_eq!(platform.pinned_pages(), 0);
        assert_eq!(platform.dirtied_pages(), 1);
    }

    #[test]
    fn test_failed_open_registers_nothing() {
        let device = device(CommsConfig::default());
        let platform = device.platform();
        let ctx = device.open_context();

        platform.push_replies([Reply::Complete {
            result: OteResult::ItemNotFound.into(),
            origin: TEE,
            session_id: 3,
        }]);
        let mut params = [TeOperParam::memory(0, TeParamType::PersistMemRo, 0x1000, 100)];
        let open = ctx.open_session(SERVICE, &mut params).unwrap();
        assert_eq!(open.outcome.result, u32::from(OteResult::ItemNotFound));
        assert_eq!(open.outcome.origin, TEE);
        assert!(ctx.sessions().is_empty());
        assert_eq!(platform.pinned_pages(), 0);
    }

    #[test]
    fn test_malformed_parameter_type_issues_no_call() {
        let device = device(CommsConfig::default());
        let platform = device.platform();
        let ctx = device.open_context();

        let mut params = [
            TeOperParam::memory(0, TeParamType::MemRo, 0x1000, 4096),
            TeOperParam {
                index: 1,
                param_type: 9,
                ..TeOperParam::default()
            },
        ];
        assert_eq!(ctx.open_session(SERVICE, &mut params), Err(TeError::BadParameters));
        assert!(platform.calls().is_empty());
        assert_eq!(platform.pinned_pages(), 0);
    }

    #[test]
    fn test_unknown_session_issues_no_call() {
        let device = device(CommsConfig::default());
        let platform = device.platform();
        let ctx = device.open_context();

        let mut params = [TeOperParam::memory(0, TeParamType::MemRo, 0x1000, 4096)];
        assert_eq!(ctx.launch_operation(42, 1, &mut params), Err(TeError::BadParameters));
        assert_eq!(ctx.close_session(42), Err(TeError::BadParameters));
        assert!(platform.calls().is_empty());
        assert_eq!(platform.pin_calls(), 0);
    }

    #[test]
    fn test_irq_preempted_open_takes_three_calls() {
        let device = device(CommsConfig::default());
        let platform = device.platform();
        let ctx = device.open_context();

        platform.push_replies([
            Reply::Status(TE_ERROR_PREEMPT_BY_IRQ),
            Reply::Status(TE_ERROR_PREEMPT_BY_IRQ),
            opened(11),
        ]);
        let open = ctx.open_session(SERVICE, &mut []).unwrap();
        assert_eq!(open.session_id, 11);
        assert_eq!(
            platform.call_funcs(),
            [TE_SMC_OPEN_SESSION, TE_SMC_RESTART_LAST, TE_SMC_RESTART_LAST]
        );
        assert!(ctx.sessions().contains(11));
        assert_eq!(platform.log_drains(), 1);
    }

    #[test]
    fn test_partial_pin_of_second_parameter_unwinds_both() {
        let device = device(CommsConfig::default());
        let platform = device.platform();
        let ctx = device.open_context();

        platform.script_pins([None, Some(1)]);
        let mut params = [
            TeOperParam::memory(0, TeParamType::PersistMemRo, 0x1000, 4096),
            TeOperParam::memory(1, TeParamType::MemRw, 0x5000, 8192),
        ];
        assert_eq!(ctx.open_session(SERVICE, &mut params), Err(TeError::OutOfMemory));
        assert_eq!(platform.pin_calls(), 2);
        assert_eq!(platform.pinned_pages(), 0);
        assert!(platform.calls().is_empty());
    }

    #[test]
    fn test_duplicate_session_id_fails_after_the_call() {
        let device = device(CommsConfig::default());
        let platform = device.platform();
        let ctx = device.open_context();

        platform.push_replies([opened(5), opened(5)]);
        let mut params = [TeOperParam::memory(0, TeParamType::PersistMemRw, 0x1000, 4096)];
        ctx.open_session(SERVICE, &mut params).unwrap();
        let mut params = [TeOperParam::memory(0, TeParamType::PersistMemRw, 0x9000, 4096)];
        assert_eq!(ctx.open_session(SERVICE, &mut params), Err(TeError::BadParameters));
        // The error is only detected once the secure side has answered.
        assert_eq!(platform.call_funcs(), [TE_SMC_OPEN_SESSION, TE_SMC_OPEN_SESSION]);
        assert_eq!(ctx.sessions().lookup(5, Session::pinned_pages), Ok(1));
        assert_eq!(platform.pinned_pages(), 1);
    }

    #[test]
    fn test_transport_failure_registers_nothing() {
        let device = device(CommsConfig::default());
        let platform = device.platform();
        let ctx = device.open_context();

        // The call fails without the secure side ever writing the request.
        platform.push_replies([Reply::Status(OteResult::Generic.into())]);
        let mut params = [TeOperParam::memory(0, TeParamType::PersistMemRw, 0x1000, 4096)];
        let open = ctx.open_session(SERVICE, &mut params).unwrap();
        assert!(!open.outcome.is_success());
        assert_eq!(open.outcome.result, u32::from(OteResult::Generic));
        assert_eq!(open.outcome.origin, ResultOrigin::Comms as u32);
        assert!(ctx.sessions().is_empty());
        assert_eq!(platform.pinned_pages(), 0);

        platform.push_replies([opened(4)]);
        ctx.open_session_compat(SERVICE, &mut []).unwrap();
        platform.push_replies([Reply::Status(OteResult::NotImplemented.into())]);
        let launch = ctx.launch_operation_compat(4, 1, &mut []).unwrap();
        assert_eq!(launch.result, u32::from(OteResult::NotImplemented));
        assert_eq!(launch.origin, ResultOrigin::Comms as u32);
        assert_eq!(platform.call_funcs().len(), 3);
    }

    #[test]
    fn test_values_written_by_the_secure_side_are_copied_back() {
        let device = device(CommsConfig::default());
        let platform = device.platform();
        let ctx = device.open_context();
        platform.push_replies([opened(2)]);
        ctx.open_session(SERVICE, &mut []).unwrap();

        platform.push_replies([Reply::WriteValue { index: 1, value: 99 }]);
        let mut params = [
            TeOperParam::value(0, TeParamType::IntRo, 1),
            TeOperParam::value(1, TeParamType::IntRw, 5),
        ];
        ctx.launch_operation(2, 0x10, &mut params).unwrap();
        assert_eq!(params[1].base_or_value, 99);
        assert_eq!(params[0].base_or_value, 1);
    }

    #[test]
    fn test_too_many_parameters() {
        let device = device(CommsConfig::default());
        let ctx = device.open_context();
        let mut params = alloc::vec![TeOperParam::value(0, TeParamType::IntRo, 0); 129];
        assert_eq!(ctx.open_session(SERVICE, &mut params), Err(TeError::BadParameters));
        assert!(device.platform().calls().is_empty());
    }

    #[test]
    fn test_dropping_the_context_releases_sessions() {
        let device = device(CommsConfig::default());
        let platform = device.platform();
        {
            let ctx = device.open_context();
            platform.push_replies([opened(1), opened(2)]);
            let mut params = [TeOperParam::memory(0, TeParamType::PersistMemRo, 0x1000, 4096)];
            ctx.open_session(SERVICE, &mut params).unwrap();
            let mut params = [TeOperParam::memory(0, TeParamType::PersistMemRw, 0x7000, 3 * 4096)];
            ctx.open_session(SERVICE, &mut params).unwrap();
            assert_eq!(platform.pinned_pages(), 4);
        }
        assert_eq!(platform.pinned_pages(), 0);
    }

    #[test]
    fn test_shared_native_buffer_is_addressed_by_offset() {
        let device = device(CommsConfig {
            native_buffers: NativeBuffers::Shared,
            ..CommsConfig::default()
        });
        let platform = device.platform();
        let ctx = device.open_context();
        platform.push_replies([opened(4)]);
        let mut params = [TeOperParam::value(0, TeParamType::IntRo, 1)];
        ctx.open_session(SERVICE, &mut params).unwrap();
        assert_eq!(platform.calls()[0], (TE_SMC_OPEN_SESSION, 0, PAGE_SIZE));
        assert!(ctx.sessions().contains(4));
    }

    #[test]
    fn test_compat_lifecycle_with_physical_addressing() {
        let device = device(CommsConfig {
            compat_addressing: ScratchAddressing::Physical,
            ..CommsConfig::default()
        });
        let platform = device.platform();
        let ctx = device.open_context();

        platform.push_replies([opened(7)]);
        let mut params = [TeOperParamCompat::memory(0, TeParamType::PersistMemRw, 0x1000, 4096)];
        let open = ctx.open_session_compat(SERVICE, &mut params).unwrap();
        assert_eq!(open.session_id, 7);
        let (_, arg1, arg2) = platform.calls()[0];
        assert_ne!(arg1, 0);
        assert_eq!(arg2, arg1 + PAGE_SIZE);

        let mut params = [TeOperParamCompat::memory(0, TeParamType::PersistMemRo, 0x2000, 8192)];
        ctx.launch_operation_compat(7, 1, &mut params).unwrap();
        assert_eq!(ctx.sessions().lookup(7, Session::pinned_pages), Ok(3));

        ctx.close_session_compat(7).unwrap();
        assert!(ctx.sessions().is_empty());
        assert_eq!(platform.pinned_pages(), 0);
    }

    #[test]
    fn test_unknown_callback_reports_not_implemented() {
        let device = device(CommsConfig::default());
        let platform = device.platform();
        let ctx = device.open_context();
        platform.push_replies([opened(3)]);
        ctx.open_session_compat(SERVICE, &mut []).unwrap();
        platform.clear_calls();

        platform.push_replies([Reply::Result(OTE_ERROR_NS_CB | 0x7f), Reply::Result(0)]);
        let outcome = ctx.launch_operation_compat(3, 2, &mut []).unwrap();
        assert!(outcome.is_success());
        assert_eq!(
            platform.call_funcs(),
            [TE_SMC_LAUNCH_OPERATION, TE_SMC_NS_CB_COMPLETE]
        );
        assert_eq!(
            platform.seen_requests()[1],
            (0x7f, u32::from(OteResult::NotImplemented))
        );
    }

    #[test]
    fn test_storage_callback_runs_the_proxy() {
        let device = device(CommsConfig::default());
        let platform = device.platform();
        let ctx = device.open_context();
        platform.push_replies([
            Reply::Result(OTE_ERROR_NS_CB | 1),
            Reply::Result(OTE_ERROR_NS_CB | 1),
            opened(8),
        ]);
        let open = ctx.open_session_compat(SERVICE, &mut []).unwrap();
        assert_eq!(open.session_id, 8);
        assert_eq!(platform.storage_requests(), 2);
        assert_eq!(
            platform.call_funcs(),
            [TE_SMC_OPEN_SESSION, TE_SMC_NS_CB_COMPLETE, TE_SMC_NS_CB_COMPLETE]
        );
    }

    #[test]
    fn test_retry_callback_waits_for_another_call_to_return() {
        let device = device(CommsConfig {
            transport: TransportMode::CallChannel,
            ..CommsConfig::default()
        });
        let platform = device.platform();
        let ctx = device.open_context();
        platform.push_replies([opened(6)]);
        ctx.open_session_compat(SERVICE, &mut []).unwrap();
        platform.clear_calls();

        platform.push_replies([Reply::Result(OTE_ERROR_NS_CB), Reply::Result(0)]);
        std::thread::scope(|s| {
            s.spawn(|| {
                while platform.calls().is_empty() {
                    std::thread::yield_now();
                }
                std::thread::sleep(std::time::Duration::from_millis(20));
                platform.signal_call_returned();
            });
            let outcome = ctx.launch_operation_compat(6, 1, &mut []).unwrap();
            assert!(outcome.is_success());
        });
        assert_eq!(
            platform.call_funcs(),
            [TE_SMC_LAUNCH_OPERATION, TE_SMC_NS_CB_COMPLETE]
        );
        // The call channel never moves the caller.
        assert_eq!(platform.migrations(), 0);
    }

    #[test]
    fn test_retry_callback_without_call_channel_does_not_block() {
        let device = device(CommsConfig::default());
        let platform = device.platform();
        let ctx = device.open_context();
        platform.push_replies([Reply::Result(OTE_ERROR_NS_CB), opened(1)]);
        let open = ctx.open_session_compat(SERVICE, &mut []).unwrap();
        assert_eq!(open.session_id, 1);
        assert_eq!(platform.seen_requests()[1], (0, 0));
    }
}
