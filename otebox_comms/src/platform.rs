// Copyright (c) Microsoft Corporation.
// Licensed under the MIT license.

//! The normal-world kernel services the communications core relies upon.
//!
//! The top-level trait is [`Provider`], which is merely a collection of subtraits. Each subtrait
//! covers one narrow service (issuing a secure call, pinning user pages, moving the current task
//! between cores, ...) so that platforms can compose them independently.

use alloc::sync::Arc;
use alloc::vec::Vec;
use core::sync::atomic::AtomicU32;
use thiserror::Error;

/// A platform upon which the communications core can run.
pub trait Provider:
    SecureMonitorProvider
    + UserPagesProvider
    + AddressTranslationProvider
    + CpuPlacementProvider
    + SecureStorageProvider
    + CompletionProvider
    + RawMutexProvider
    + SecureLogProvider
    + Send
    + Sync
{
}

/// Registers for an extended secure call. Index 0 holds the function number on entry.
pub type ExtendedCallRegs = [usize; 8];

/// Raw entry into the secure side.
pub trait SecureMonitorProvider {
    /// Issue one secure call and return the status register.
    ///
    /// For a platform configured with a call channel this is a call through the channel rather
    /// than a raw monitor call.
    fn generic_call(&self, func: u32, arg1: usize, arg2: usize) -> u32;

    /// Issue a secure call that passes a whole register block in both directions.
    fn extended_call(&self, regs: &mut ExtendedCallRegs) -> u32;

    /// Address of the normal-world interrupt entry the secure side should bounce interrupts to.
    fn irq_handler_entry(&self) -> usize;

    /// Ask the call channel to notify `notifier` every time any call through it returns.
    ///
    /// Only meaningful for call-channel platforms.
    fn register_call_returned_notifier(&self, notifier: Arc<dyn CallReturnedNotifier>) {
        let _ = notifier;
    }
}

/// Receiver of "a call through the channel has returned" notifications.
pub trait CallReturnedNotifier: Send + Sync {
    fn call_returned(&self);
}

/// Pinning of user pages so that they stay resident while the secure side accesses them.
pub trait UserPagesProvider {
    /// A counted reference to one pinned page.
    type Page: Send;

    /// Pin up to `nr_pages` pages starting at the page-aligned user address `start`.
    ///
    /// May return fewer pages than requested; the caller owns whatever was returned.
    fn pin_user_pages(&self, start: usize, nr_pages: usize, write: bool) -> Vec<Self::Page>;

    /// Mark a page as modified so its contents are written back.
    fn set_page_dirty(&self, page: &Self::Page);

    /// Drop the reference obtained when pinning.
    fn put_page(&self, page: Self::Page);
}

pub trait AddressTranslationProvider {
    /// Physical address backing the kernel virtual address `va`.
    fn virt_to_phys(&self, va: usize) -> usize;
}

/// Possible errors when moving work onto the boot core.
#[derive(Error, Debug, Clone, Copy, PartialEq, Eq)]
#[non_exhaustive]
pub enum PlacementError {
    #[error("current task may not change its affinity")]
    AffinityLocked,
    #[error("could not dispatch work to the boot cpu")]
    DispatchFailed,
}

/// Control over which logical core issues secure calls.
pub trait CpuPlacementProvider {
    /// Saved affinity of a task, restored after a temporary move.
    type Affinity;

    /// Logical core the current task is running on.
    fn current_cpu(&self) -> u32;

    /// Whether the current task is allowed to change its own affinity. Per-core workers are not.
    fn can_migrate_current(&self) -> bool;

    /// Restrict the current task to the boot core, returning its previous affinity.
    fn pin_current_to_boot_cpu(&self) -> Result<Self::Affinity, PlacementError>;

    fn restore_affinity(&self, saved: Self::Affinity);

    /// Run `work` on the boot core and wait for its result.
    fn run_on_boot_cpu(
        &self,
        work: &mut (dyn FnMut() -> u32 + Send),
    ) -> Result<u32, PlacementError>;
}

/// The local secure-storage proxy.
pub trait SecureStorageProvider {
    /// Perform the storage operation the secure side is waiting for and return its status.
    fn service_storage_request(&self) -> u32;
}

pub trait CompletionProvider {
    type Completion: RawCompletion + 'static;
    fn new_completion(&self) -> Self::Completion;
}

/// A reinitialisable one-shot completion.
pub trait RawCompletion: Send + Sync {
    /// Return to the not-completed state.
    fn reinit(&self);
    /// Mark as completed and wake every waiter.
    fn complete(&self);
    /// Block until completed.
    fn wait(&self);
}

/// A provider of raw mutexes, for locks that may be held while the holder sleeps.
pub trait RawMutexProvider {
    type RawMutex: RawMutex;
    /// Allocate a new [`RawMutex`] whose word starts at zero.
    fn new_raw_mutex(&self) -> Self::RawMutex;
}

/// A futex-like word that waiters can sleep on.
pub trait RawMutex: Send + Sync {
    fn underlying_atomic(&self) -> &AtomicU32;

    /// Wake up to `n` threads blocked on this word.
    ///
    /// Returns the number of waiters that were woken up.
    fn wake_many(&self, n: usize) -> usize;

    /// Returns true if a blocked thread was actually woken up.
    fn wake_one(&self) -> bool {
        self.wake_many(1) > 0
    }

    fn wake_all(&self) -> usize {
        self.wake_many(usize::MAX)
    }

    /// If the underlying value is `val`, block until a wake operation wakes us up.
    ///
    /// Spurious wake-ups are allowed; callers re-check the word.
    fn block(&self, val: u32) -> Result<(), ImmediatelyWokenUp>;
}

/// The word no longer held the expected value, so [`RawMutex::block`] returned without sleeping.
#[derive(Debug)]
pub struct ImmediatelyWokenUp;

pub trait SecureLogProvider {
    /// Print whatever the secure side left in its log ring since the last call.
    fn drain_secure_log(&self) {}
}
