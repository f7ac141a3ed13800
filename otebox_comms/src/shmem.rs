// Copyright (c) Microsoft Corporation.
// Licensed under the MIT license.

//! Pinning of the user buffers that back memory parameters.

use alloc::vec::Vec;
use core::mem;
use otebox_common::{PAGE_SIZE, TeError, TeParamType};
use thiserror::Error;

use crate::platform::UserPagesProvider;

bitflags::bitflags! {
    /// How the secure side may use a pinned buffer.
    #[derive(Clone, Copy, Debug, PartialEq, Eq)]
    pub struct ShmemAccess: u32 {
        /// The secure side may write to the buffer.
        const WRITE = 1 << 0;
        /// The binding outlives the call and belongs to the session.
        const PERSISTENT = 1 << 1;
    }
}

impl ShmemAccess {
    /// Access implied by a parameter type, or `None` for non-memory parameters.
    pub fn for_param(ty: TeParamType) -> Option<Self> {
        if !ty.is_memory() {
            return None;
        }
        let mut access = ShmemAccess::empty();
        access.set(ShmemAccess::WRITE, ty.is_writable());
        access.set(ShmemAccess::PERSISTENT, ty.is_persistent());
        Some(access)
    }
}

/// Possible errors when pinning a buffer.
#[derive(Error, Debug, Clone, Copy, PartialEq, Eq)]
#[non_exhaustive]
pub enum PinError {
    #[error("buffer range overflows the address space")]
    RangeOverflow,
    #[error("pinned {pinned} of {requested} pages")]
    Partial { pinned: usize, requested: usize },
}

impl From<PinError> for TeError {
    fn from(err: PinError) -> Self {
        match err {
            PinError::RangeOverflow => TeError::BadParameters,
            PinError::Partial { .. } => TeError::OutOfMemory,
        }
    }
}

#[inline]
fn page_align_down(address: usize) -> usize {
    address & !(PAGE_SIZE - 1)
}

/// First and one-past-last page addresses covering `[buffer, buffer + size)`.
fn page_range(buffer: usize, size: usize) -> Result<(usize, usize), PinError> {
    let end = buffer
        .checked_add(size)
        .and_then(|end| end.checked_next_multiple_of(PAGE_SIZE))
        .ok_or(PinError::RangeOverflow)?;
    Ok((page_align_down(buffer), end))
}

/// A user buffer whose pages are pinned for the secure side.
///
/// A descriptor must be released with [`SharedMemDesc::unpin`]; it must not simply be dropped
/// while it still holds pages.
#[derive(Debug)]
pub struct SharedMemDesc<Page> {
    buffer: usize,
    size: usize,
    access: ShmemAccess,
    pages: Vec<Page>,
}

impl<Page> SharedMemDesc<Page> {
    /// Pin every page covering `[buffer, buffer + size)`.
    ///
    /// On a partial pin the pages already acquired are released again before returning.
    pub fn pin<P: UserPagesProvider<Page = Page>>(
        provider: &P,
        buffer: usize,
        size: usize,
        access: ShmemAccess,
    ) -> Result<Self, PinError> {
        let (start, end) = page_range(buffer, size)?;
        let requested = (end - start) / PAGE_SIZE;
        let pages = if requested == 0 {
            Vec::new()
        } else {
            provider.pin_user_pages(start, requested, access.contains(ShmemAccess::WRITE))
        };
        if pages.len() != requested {
            let pinned = pages.len();
            for page in pages {
                provider.put_page(page);
            }
            log::error!(
                buffer = buffer,
                pinned = pinned,
                requested = requested;
                "failed to pin user buffer"
            );
            return Err(PinError::Partial { pinned, requested });
        }
        log::debug!(buffer = buffer, size = size, pages = requested; "pinned user buffer");
        Ok(Self {
            buffer,
            size,
            access,
            pages,
        })
    }

    /// Release every page. Pages of writable buffers are marked dirty first since the secure side
    /// may have written to them.
    pub fn unpin<P: UserPagesProvider<Page = Page>>(mut self, provider: &P) {
        let pages = mem::take(&mut self.pages);
        log::debug!(buffer = self.buffer, pages = pages.len(); "unpinning user buffer");
        for page in pages {
            if self.access.contains(ShmemAccess::WRITE) {
                provider.set_page_dirty(&page);
            }
            provider.put_page(page);
        }
    }

    pub fn buffer(&self) -> usize {
        self.buffer
    }

    pub fn size(&self) -> usize {
        self.size
    }

    pub fn access(&self) -> ShmemAccess {
        self.access
    }

    pub fn page_count(&self) -> usize {
        self.pages.len()
    }
}

impl<Page> Drop for SharedMemDesc<Page> {
    fn drop(&mut self) {
        debug_assert!(
            self.pages.is_empty(),
            "shared memory descriptor dropped while still pinned"
        );
    }
}

pub(crate) fn unpin_all<P: UserPagesProvider>(provider: &P, descs: Vec<SharedMemDesc<P::Page>>) {
    for desc in descs {
        desc.unpin(provider);
    }
}

/// Buffers pinned for one request.
///
/// Plain temporaries are released when the context goes away. Persistent buffers are released
/// too, unless they were moved into a session beforehand.
pub(crate) struct RequestContext<'p, P: UserPagesProvider> {
    provider: &'p P,
    temp: Vec<SharedMemDesc<P::Page>>,
    temp_persistent: Vec<SharedMemDesc<P::Page>>,
}

impl<'p, P: UserPagesProvider> RequestContext<'p, P> {
    pub(crate) fn new(provider: &'p P) -> Self {
        Self {
            provider,
            temp: Vec::new(),
            temp_persistent: Vec::new(),
        }
    }

    /// Pin the buffer of one memory parameter onto the list matching its access.
    pub(crate) fn pin(
        &mut self,
        buffer: usize,
        size: usize,
        access: ShmemAccess,
    ) -> Result<(), TeError> {
        let desc = SharedMemDesc::pin(self.provider, buffer, size, access)?;
        if access.contains(ShmemAccess::PERSISTENT) {
            self.temp_persistent.push(desc);
        } else {
            self.temp.push(desc);
        }
        Ok(())
    }

    /// Persistent buffers not yet handed over to a session. Appending from this list transfers
    /// ownership; whatever remains is released with the context.
    pub(crate) fn persistent_mut(&mut self) -> &mut Vec<SharedMemDesc<P::Page>> {
        &mut self.temp_persistent
    }
}

impl<P: UserPagesProvider> Drop for RequestContext<'_, P> {
    fn drop(&mut self) {
        unpin_all(self.provider, mem::take(&mut self.temp));
        unpin_all(self.provider, mem::take(&mut self.temp_persistent));
    }
}
