// Copyright (c) Microsoft Corporation.
// Licensed under the MIT license.

//! Crate-local test-only mock platform, with a scripted secure side behind it.

// Pull in `std` for the test-only world, so that we have a nicer/easier time writing tests
extern crate std;

use alloc::sync::Arc;
use alloc::vec::Vec;
use core::mem::size_of;
use core::sync::atomic::{AtomicBool, AtomicU32, AtomicUsize, Ordering};
use std::collections::{BTreeMap, VecDeque};
use std::sync::{Condvar, Mutex};

use otebox_common::smc_nr::{
    TE_SMC_CLOSE_SESSION, TE_SMC_LAUNCH_OPERATION, TE_SMC_NS_CB_COMPLETE, TE_SMC_OPEN_SESSION,
    TE_SMC_REGISTER_REQ_BUF,
};
use otebox_common::{
    PAGE_SIZE, ResultOrigin, TeOperParam, TeOperParamCompat, TeRequest, TeRequestCompat,
};

use crate::platform::*;

// The mock secure side reads every request through the compat structures; on 64-bit hosts the
// native ones share their layout.
const _: () = assert!(size_of::<TeRequest>() == size_of::<TeRequestCompat>());
const _: () = assert!(size_of::<TeOperParam>() == size_of::<TeOperParamCompat>());

pub(crate) const IRQ_HANDLER_ENTRY: usize = 0xffff_0000_dead_0000;

/// A pinned page, as handed out by [`MockPlatform`].
#[derive(Debug)]
pub(crate) struct MockPage {
    addr: usize,
}

/// What the scripted secure side does on its next call.
#[derive(Clone, Copy, Debug)]
pub(crate) enum Reply {
    /// Return this status and leave the request alone.
    Status(u32),
    /// Complete the current request with this result.
    Result(u32),
    /// Complete the current request with this result, origin, and session id.
    Complete {
        result: u32,
        origin: u32,
        session_id: u32,
    },
    /// Overwrite the value of one parameter, then complete the request successfully.
    WriteValue { index: usize, value: u32 },
}

#[derive(Default)]
struct PinScript {
    /// Per-call page limits, consumed front to back. `None` pins everything.
    limits: VecDeque<Option<usize>>,
    calls: usize,
    last_write: Option<bool>,
}

#[derive(Default)]
struct SecureSide {
    replies: VecDeque<Reply>,
    calls: Vec<(u32, usize, usize)>,
    call_cpus: Vec<u32>,
    /// `(type, result)` of the request at every call that carries one.
    seen_requests: Vec<(u32, u32)>,
    request_base: Option<usize>,
    current_request: Option<usize>,
}

/// A mock platform that is a [`Provider`], useful purely for testing within this crate.
///
/// Pages are reference counted per address, translation is the identity, and the secure side
/// follows a queue of [`Reply`]s, completing requests successfully once the queue runs dry.
pub(crate) struct MockPlatform {
    pages: Mutex<BTreeMap<usize, u32>>,
    pins: Mutex<PinScript>,
    dirtied: AtomicUsize,
    cpu: AtomicU32,
    can_migrate: AtomicBool,
    migrations: AtomicUsize,
    dispatched: AtomicUsize,
    storage_requests: AtomicUsize,
    log_drains: AtomicUsize,
    secure: Mutex<SecureSide>,
    notifier: Mutex<Option<Arc<dyn CallReturnedNotifier>>>,
}

impl MockPlatform {
    pub(crate) fn new() -> Self {
        MockPlatform {
            pages: Mutex::new(BTreeMap::new()),
            pins: Mutex::new(PinScript::default()),
            dirtied: AtomicUsize::new(0),
            cpu: AtomicU32::new(0),
            can_migrate: AtomicBool::new(true),
            migrations: AtomicUsize::new(0),
            dispatched: AtomicUsize::new(0),
            storage_requests: AtomicUsize::new(0),
            log_drains: AtomicUsize::new(0),
            secure: Mutex::new(SecureSide::default()),
            notifier: Mutex::new(None),
        }
    }

    /// Number of page references currently held.
    pub(crate) fn pinned_pages(&self) -> usize {
        self.pages.lock().unwrap().values().map(|&n| n as usize).sum()
    }

    pub(crate) fn dirtied_pages(&self) -> usize {
        self.dirtied.load(Ordering::SeqCst)
    }

    pub(crate) fn pin_calls(&self) -> usize {
        self.pins.lock().unwrap().calls
    }

    pub(crate) fn last_pin_was_write(&self) -> Option<bool> {
        self.pins.lock().unwrap().last_write
    }

    /// Only pin `pages` pages on the next pin attempt.
    pub(crate) fn limit_next_pin(&self, pages: usize) {
        self.script_pins([Some(pages)]);
    }

    pub(crate) fn script_pins(&self, limits: impl IntoIterator<Item = Option<usize>>) {
        self.pins.lock().unwrap().limits.extend(limits);
    }

    pub(crate) fn set_current_cpu(&self, cpu: u32, can_migrate: bool) {
        self.cpu.store(cpu, Ordering::SeqCst);
        self.can_migrate.store(can_migrate, Ordering::SeqCst);
    }

    pub(crate) fn migrations(&self) -> usize {
        self.migrations.load(Ordering::SeqCst)
    }

    pub(crate) fn dispatched_calls(&self) -> usize {
        self.dispatched.load(Ordering::SeqCst)
    }

    pub(crate) fn storage_requests(&self) -> usize {
        self.storage_requests.load(Ordering::SeqCst)
    }

    pub(crate) fn log_drains(&self) -> usize {
        self.log_drains.load(Ordering::SeqCst)
    }

    pub(crate) fn push_replies(&self, replies: impl IntoIterator<Item = Reply>) {
        self.secure.lock().unwrap().replies.extend(replies);
    }

    /// Forget the calls made so far and reset the call counters.
    pub(crate) fn clear_calls(&self) {
        let mut secure = self.secure.lock().unwrap();
        secure.calls.clear();
        secure.call_cpus.clear();
        secure.seen_requests.clear();
        self.migrations.store(0, Ordering::SeqCst);
        self.dispatched.store(0, Ordering::SeqCst);
        self.storage_requests.store(0, Ordering::SeqCst);
        self.log_drains.store(0, Ordering::SeqCst);
    }

    pub(crate) fn calls(&self) -> Vec<(u32, usize, usize)> {
        self.secure.lock().unwrap().calls.clone()
    }

    pub(crate) fn call_funcs(&self) -> Vec<u32> {
        self.calls().into_iter().map(|(func, ..)| func).collect()
    }

    pub(crate) fn seen_requests(&self) -> Vec<(u32, u32)> {
        self.secure.lock().unwrap().seen_requests.clone()
    }

    pub(crate) fn seen_request_types(&self) -> Vec<u32> {
        self.seen_requests().into_iter().map(|(ty, _)| ty).collect()
    }

    pub(crate) fn all_calls_on_boot_cpu(&self) -> bool {
        self.secure.lock().unwrap().call_cpus.iter().all(|&cpu| cpu == 0)
    }

    /// Pretend some unrelated call through the channel just returned.
    pub(crate) fn signal_call_returned(&self) {
        let notifier = self.notifier.lock().unwrap().clone();
        if let Some(notifier) = notifier {
            notifier.call_returned();
        }
    }

    fn resolve(secure: &SecureSide, addr: usize) -> usize {
        match secure.request_base {
            Some(base) if addr < 2 * PAGE_SIZE => base + addr,
            _ => addr,
        }
    }

    fn complete_request(secure: &SecureSide, result: u32, origin: u32, session_id: Option<u32>) {
        let Some(addr) = secure.current_request else {
            return;
        };
        let ptr = core::ptr::with_exposed_provenance_mut::<TeRequestCompat>(addr);
        // SAFETY: `addr` is the request page of a live call buffer, which the caller does not
        // touch while the call is in flight.
        unsafe {
            let mut request = ptr.read();
            request.result = result;
            request.result_origin = origin;
            if let Some(session_id) = session_id {
                request.session_id = session_id;
            }
            ptr.write(request);
        }
    }

    fn write_param_value(secure: &SecureSide, index: usize, value: u32) {
        let Some(addr) = secure.current_request else {
            return;
        };
        // SAFETY: As in `complete_request`; the parameter array lies in the same live buffer.
        unsafe {
            let request = core::ptr::with_exposed_provenance::<TeRequestCompat>(addr).read();
            let params = Self::resolve(secure, request.params as usize);
            let param =
                core::ptr::with_exposed_provenance_mut::<TeOperParamCompat>(params).add(index);
            (*param).base_or_value = u64::from(value);
        }
    }
}

impl Provider for MockPlatform {}

impl SecureMonitorProvider for MockPlatform {
    fn generic_call(&self, func: u32, arg1: usize, arg2: usize) -> u32 {
        let status = {
            let mut secure = self.secure.lock().unwrap();
            secure.calls.push((func, arg1, arg2));
            secure.call_cpus.push(self.cpu.load(Ordering::SeqCst));
            let carries_request = matches!(
                func,
                TE_SMC_OPEN_SESSION
                    | TE_SMC_CLOSE_SESSION
                    | TE_SMC_LAUNCH_OPERATION
                    | TE_SMC_NS_CB_COMPLETE
            );
            if func == TE_SMC_REGISTER_REQ_BUF {
                secure.request_base = Some(arg1);
            }
            if carries_request {
                let addr = Self::resolve(&secure, arg1);
                secure.current_request = Some(addr);
                // SAFETY: See `complete_request`.
                let request =
                    unsafe { core::ptr::with_exposed_provenance::<TeRequestCompat>(addr).read() };
                secure.seen_requests.push((request.req_type, request.result));
            }
            let default = if carries_request {
                Reply::Result(0)
            } else {
                Reply::Status(0)
            };
            let tee = ResultOrigin::Tee.into();
            match secure.replies.pop_front().unwrap_or(default) {
                Reply::Status(status) => status,
                Reply::Result(result) => {
                    Self::complete_request(&secure, result, tee, None);
                    0
                }
                Reply::Complete {
                    result,
                    origin,
                    session_id,
                } => {
                    Self::complete_request(&secure, result, origin, Some(session_id));
                    0
                }
                Reply::WriteValue { index, value } => {
                    Self::write_param_value(&secure, index, value);
                    Self::complete_request(&secure, 0, tee, None);
                    0
                }
            }
        };
        self.signal_call_returned();
        status
    }

    fn extended_call(&self, regs: &mut ExtendedCallRegs) -> u32 {
        let mut secure = self.secure.lock().unwrap();
        secure.calls.push((regs[0] as u32, regs[1], regs[2]));
        secure.call_cpus.push(self.cpu.load(Ordering::SeqCst));
        match secure.replies.pop_front() {
            Some(Reply::Status(status)) => status,
            _ => 0,
        }
    }

    fn irq_handler_entry(&self) -> usize {
        IRQ_HANDLER_ENTRY
    }

    fn register_call_returned_notifier(&self, notifier: Arc<dyn CallReturnedNotifier>) {
        *self.notifier.lock().unwrap() = Some(notifier);
    }
}

impl UserPagesProvider for MockPlatform {
    type Page = MockPage;

    fn pin_user_pages(&self, start: usize, nr_pages: usize, write: bool) -> Vec<MockPage> {
        let limit = {
            let mut pins = self.pins.lock().unwrap();
            pins.calls += 1;
            pins.last_write = Some(write);
            pins.limits.pop_front().flatten()
        };
        let count = limit.map_or(nr_pages, |limit| limit.min(nr_pages));
        let mut pages = self.pages.lock().unwrap();
        (0..count)
            .map(|i| {
                let addr = start + i * PAGE_SIZE;
                *pages.entry(addr).or_insert(0) += 1;
                MockPage { addr }
            })
            .collect()
    }

    fn set_page_dirty(&self, _page: &MockPage) {
        self.dirtied.fetch_add(1, Ordering::SeqCst);
    }

    fn put_page(&self, page: MockPage) {
        let mut pages = self.pages.lock().unwrap();
        let count = pages.get_mut(&page.addr).expect("put_page on a page that was never pinned");
        *count -= 1;
        if *count == 0 {
            pages.remove(&page.addr);
        }
    }
}

impl AddressTranslationProvider for MockPlatform {
    fn virt_to_phys(&self, va: usize) -> usize {
        va
    }
}

impl CpuPlacementProvider for MockPlatform {
    type Affinity = u32;

    fn current_cpu(&self) -> u32 {
        self.cpu.load(Ordering::SeqCst)
    }

    fn can_migrate_current(&self) -> bool {
        self.can_migrate.load(Ordering::SeqCst)
    }

    fn pin_current_to_boot_cpu(&self) -> Result<u32, PlacementError> {
        if !self.can_migrate_current() {
            return Err(PlacementError::AffinityLocked);
        }
        self.migrations.fetch_add(1, Ordering::SeqCst);
        Ok(self.cpu.swap(0, Ordering::SeqCst))
    }

    fn restore_affinity(&self, saved: u32) {
        self.cpu.store(saved, Ordering::SeqCst);
    }

    fn run_on_boot_cpu(
        &self,
        work: &mut (dyn FnMut() -> u32 + Send),
    ) -> Result<u32, PlacementError> {
        self.dispatched.fetch_add(1, Ordering::SeqCst);
        let saved = self.cpu.swap(0, Ordering::SeqCst);
        let status = work();
        self.cpu.store(saved, Ordering::SeqCst);
        Ok(status)
    }
}

impl SecureStorageProvider for MockPlatform {
    fn service_storage_request(&self) -> u32 {
        self.storage_requests.fetch_add(1, Ordering::SeqCst);
        0
    }
}

/// A completion built on a condition variable.
#[derive(Default)]
pub(crate) struct MockCompletion {
    done: Mutex<bool>,
    cv: Condvar,
}

impl MockCompletion {
    pub(crate) fn is_completed(&self) -> bool {
        *self.done.lock().unwrap()
    }
}

impl RawCompletion for MockCompletion {
    fn reinit(&self) {
        *self.done.lock().unwrap() = false;
    }

    fn complete(&self) {
        *self.done.lock().unwrap() = true;
        self.cv.notify_all();
    }

    fn wait(&self) {
        let mut done = self.done.lock().unwrap();
        while !*done {
            done = self.cv.wait(done).unwrap();
        }
    }
}

impl CompletionProvider for MockPlatform {
    type Completion = MockCompletion;

    fn new_completion(&self) -> MockCompletion {
        MockCompletion::default()
    }
}

/// A futex emulated with a condition variable. The word is only compared while holding `sleepers`,
/// so a wake that follows a change of the word cannot be missed.
#[derive(Default)]
pub(crate) struct MockRawMutex {
    atomic: AtomicU32,
    sleepers: Mutex<usize>,
    cv: Condvar,
}

impl MockRawMutex {
    /// Number of threads currently asleep on the word.
    pub(crate) fn sleepers(&self) -> usize {
        *self.sleepers.lock().unwrap()
    }
}

impl RawMutex for MockRawMutex {
    fn underlying_atomic(&self) -> &AtomicU32 {
        &self.atomic
    }

    fn wake_many(&self, n: usize) -> usize {
        let sleepers = self.sleepers.lock().unwrap();
        let woken = n.min(*sleepers);
        if woken == *sleepers {
            self.cv.notify_all();
        } else {
            for _ in 0..woken {
                self.cv.notify_one();
            }
        }
        woken
    }

    fn block(&self, val: u32) -> Result<(), ImmediatelyWokenUp> {
        let mut sleepers = self.sleepers.lock().unwrap();
        if self.atomic.load(Ordering::SeqCst) != val {
            return Err(ImmediatelyWokenUp);
        }
        *sleepers += 1;
        let mut sleepers = self.cv.wait(sleepers).unwrap();
        *sleepers -= 1;
        Ok(())
    }
}

impl RawMutexProvider for MockPlatform {
    type RawMutex = MockRawMutex;

    fn new_raw_mutex(&self) -> MockRawMutex {
        MockRawMutex::default()
    }
}

impl SecureLogProvider for MockPlatform {
    fn drain_secure_log(&self) {
        self.log_drains.fetch_add(1, Ordering::SeqCst);
    }
}
