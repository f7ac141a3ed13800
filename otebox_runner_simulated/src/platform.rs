// Copyright (c) Microsoft Corporation.
// Licensed under the MIT license.

//! A userland platform for the communications core, backed by the in-process secure world.

use std::cell::Cell;
use std::collections::HashMap;
use std::sync::atomic::{AtomicU32, AtomicUsize, Ordering};
use std::sync::{Arc, Condvar, Mutex, MutexGuard, PoisonError};
use std::time::Duration;

use otebox_comms::platform::{
    AddressTranslationProvider, CallReturnedNotifier, CompletionProvider, CpuPlacementProvider,
    ExtendedCallRegs, ImmediatelyWokenUp, PlacementError, Provider, RawCompletion, RawMutex,
    RawMutexProvider, SecureLogProvider, SecureMonitorProvider, SecureStorageProvider,
    UserPagesProvider,
};
use otebox_common::PAGE_SIZE;

use crate::secure_world::SecureWorld;

thread_local! {
    static CURRENT_CPU: Cell<u32> = const { Cell::new(0) };
    static MAY_MIGRATE: Cell<bool> = const { Cell::new(true) };
}

/// How long another client's call takes to come back when a request asks to be retried.
const FOREIGN_CALL_DELAY: Duration = Duration::from_millis(5);

fn lock<T>(mutex: &Mutex<T>) -> MutexGuard<'_, T> {
    mutex.lock().unwrap_or_else(PoisonError::into_inner)
}

/// Place the calling thread on `cpu`, optionally as a per-core worker that may not migrate.
pub fn set_current_thread(cpu: u32, may_migrate: bool) {
    CURRENT_CPU.set(cpu);
    MAY_MIGRATE.set(may_migrate);
}

/// One pinned page of the simulated address space.
#[derive(Debug)]
pub struct SimulatedPage {
    addr: usize,
}

pub struct SimulatedPlatform {
    world: SecureWorld,
    call_channel: bool,
    notifier: Mutex<Option<Arc<dyn CallReturnedNotifier>>>,
    pinned: Mutex<HashMap<usize, usize>>,
    dirtied: AtomicUsize,
    storage_requests: AtomicUsize,
    off_boot_calls: AtomicUsize,
}

impl SimulatedPlatform {
    pub fn new(world: SecureWorld, call_channel: bool) -> Self {
        Self {
            world,
            call_channel,
            notifier: Mutex::new(None),
            pinned: Mutex::new(HashMap::new()),
            dirtied: AtomicUsize::new(0),
            storage_requests: AtomicUsize::new(0),
            off_boot_calls: AtomicUsize::new(0),
        }
    }

    pub fn world(&self) -> &SecureWorld {
        &self.world
    }

    /// Number of page references currently held.
    pub fn pinned_pages(&self) -> usize {
        lock(&self.pinned).values().sum()
    }

    pub fn dirtied_pages(&self) -> usize {
        self.dirtied.load(Ordering::SeqCst)
    }

    pub fn storage_requests(&self) -> usize {
        self.storage_requests.load(Ordering::SeqCst)
    }

    /// Raw secure monitor calls that were issued from a core other than the boot core.
    pub fn off_boot_calls(&self) -> usize {
        self.off_boot_calls.load(Ordering::SeqCst)
    }

    fn enter(&self, func: u32, arg1: usize, arg2: usize) -> u32 {
        let cpu = CURRENT_CPU.get();
        if !self.call_channel && cpu != 0 {
            self.off_boot_calls.fetch_add(1, Ordering::SeqCst);
            log::error!("secure monitor call {func:#x} issued from cpu {cpu}");
        }
        let ret = self.world.call(func, arg1, arg2);
        if let Some(notifier) = lock(&self.notifier).clone() {
            if ret.awaits_other_call {
                let foreign = Arc::clone(&notifier);
                std::thread::spawn(move || {
                    std::thread::sleep(FOREIGN_CALL_DELAY);
                    foreign.call_returned();
                });
            }
            notifier.call_returned();
        }
        ret.status
    }
}

impl Provider for SimulatedPlatform {}

impl SecureMonitorProvider for SimulatedPlatform {
    fn generic_call(&self, func: u32, arg1: usize, arg2: usize) -> u32 {
        self.enter(func, arg1, arg2)
    }

    fn extended_call(&self, regs: &mut ExtendedCallRegs) -> u32 {
        let status = self.enter(regs[0] as u32, regs[1], regs[2]);
        regs[0] = status as usize;
        status
    }

    fn irq_handler_entry(&self) -> usize {
        (simulated_irq_entry as fn()) as usize
    }

    fn register_call_returned_notifier(&self, notifier: Arc<dyn CallReturnedNotifier>) {
        *lock(&self.notifier) = Some(notifier);
    }
}

fn simulated_irq_entry() {
    log::trace!("interrupt bounced to the normal world");
}

impl UserPagesProvider for SimulatedPlatform {
    type Page = SimulatedPage;

    fn pin_user_pages(&self, start: usize, nr_pages: usize, _write: bool) -> Vec<SimulatedPage> {
        let mut pinned = lock(&self.pinned);
        (0..nr_pages)
            .map(|i| {
                let addr = start + i * PAGE_SIZE;
                *pinned.entry(addr).or_default() += 1;
                SimulatedPage { addr }
            })
            .collect()
    }

    fn set_page_dirty(&self, _page: &SimulatedPage) {
        self.dirtied.fetch_add(1, Ordering::SeqCst);
    }

    fn put_page(&self, page: SimulatedPage) {
        let mut pinned = lock(&self.pinned);
        match pinned.get_mut(&page.addr) {
            Some(1) => {
                pinned.remove(&page.addr);
            }
            Some(count) => *count -= 1,
            None => log::error!("put of unpinned page {:#x}", page.addr),
        }
    }
}

impl AddressTranslationProvider for SimulatedPlatform {
    fn virt_to_phys(&self, va: usize) -> usize {
        va
    }
}

impl CpuPlacementProvider for SimulatedPlatform {
    type Affinity = u32;

    fn current_cpu(&self) -> u32 {
        CURRENT_CPU.get()
    }

    fn can_migrate_current(&self) -> bool {
        MAY_MIGRATE.get()
    }

    fn pin_current_to_boot_cpu(&self) -> Result<u32, PlacementError> {
        if !MAY_MIGRATE.get() {
            return Err(PlacementError::AffinityLocked);
        }
        Ok(CURRENT_CPU.replace(0))
    }

    fn restore_affinity(&self, saved: u32) {
        CURRENT_CPU.set(saved);
    }

    fn run_on_boot_cpu(
        &self,
        work: &mut (dyn FnMut() -> u32 + Send),
    ) -> Result<u32, PlacementError> {
        std::thread::scope(|scope| {
            scope
                .spawn(|| {
                    set_current_thread(0, false);
                    work()
                })
                .join()
                .map_err(|_| PlacementError::DispatchFailed)
        })
    }
}

impl SecureStorageProvider for SimulatedPlatform {
    fn service_storage_request(&self) -> u32 {
        self.storage_requests.fetch_add(1, Ordering::SeqCst);
        self.world.storage_serviced();
        0
    }
}

#[derive(Default)]
pub struct SimulatedCompletion {
    done: Mutex<bool>,
    cv: Condvar,
}

impl RawCompletion for SimulatedCompletion {
    fn reinit(&self) {
        *lock(&self.done) = false;
    }

    fn complete(&self) {
        *lock(&self.done) = true;
        self.cv.notify_all();
    }

    fn wait(&self) {
        let mut done = lock(&self.done);
        while !*done {
            done = self.cv.wait(done).unwrap_or_else(PoisonError::into_inner);
        }
    }
}

impl CompletionProvider for SimulatedPlatform {
    type Completion = SimulatedCompletion;

    fn new_completion(&self) -> SimulatedCompletion {
        SimulatedCompletion::default()
    }
}

/// A futex word emulated with a condition variable. The word is compared under `sleepers`, the
/// same lock a waker takes, so no wake-up is lost.
#[derive(Default)]
pub struct SimulatedRawMutex {
    word: AtomicU32,
    sleepers: Mutex<usize>,
    cv: Condvar,
}

impl RawMutex for SimulatedRawMutex {
    fn underlying_atomic(&self) -> &AtomicU32 {
        &self.word
    }

    fn wake_many(&self, n: usize) -> usize {
        let sleepers = lock(&self.sleepers);
        let woken = n.min(*sleepers);
        if woken == *sleepers {
            self.cv.notify_all();
        } else {
            (0..woken).for_each(|_| self.cv.notify_one());
        }
        woken
    }

    fn block(&self, val: u32) -> Result<(), ImmediatelyWokenUp> {
        let mut sleepers = lock(&self.sleepers);
        if self.word.load(Ordering::SeqCst) != val {
            return Err(ImmediatelyWokenUp);
        }
        *sleepers += 1;
        let mut sleepers = self.cv.wait(sleepers).unwrap_or_else(PoisonError::into_inner);
        *sleepers -= 1;
        Ok(())
    }
}

impl RawMutexProvider for SimulatedPlatform {
    type RawMutex = SimulatedRawMutex;

    fn new_raw_mutex(&self) -> SimulatedRawMutex {
        SimulatedRawMutex::default()
    }
}

impl SecureLogProvider for SimulatedPlatform {
    fn drain_secure_log(&self) {
        for line in self.world.drain_log() {
            log::info!(target: "secure_world", "{line}");
        }
    }
}
