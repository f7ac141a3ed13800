// Copyright (c) Microsoft Corporation.
// Licensed under the MIT license.

//! Page-aligned scratch memory a request is marshaled into before it crosses over.

use alloc::boxed::Box;
use core::mem::size_of;
use core::ptr::NonNull;
use otebox_common::{PAGE_SIZE, TeError};
use zerocopy::{FromBytes, FromZeros, Immutable, IntoBytes, KnownLayout};

#[derive(FromZeros, KnownLayout)]
#[repr(C, align(4096))]
struct ScratchPages {
    request: [u8; PAGE_SIZE],
    params: [u8; PAGE_SIZE],
}

/// Two contiguous pages: the request header followed by the parameter array.
///
/// The secure side reads and writes these pages behind the compiler's back while a call is in
/// flight, so they are only ever accessed through raw copies and never through references.
pub(crate) struct CallBuffer {
    pages: NonNull<ScratchPages>,
}

// SAFETY: The buffer exclusively owns its allocation; all access goes through `&self`/`&mut self`.
unsafe impl Send for CallBuffer {}

impl CallBuffer {
    pub(crate) fn new() -> Result<Self, TeError> {
        let pages = ScratchPages::new_box_zeroed().map_err(|_| TeError::OutOfMemory)?;
        Ok(Self {
            pages: NonNull::from(Box::leak(pages)),
        })
    }

    /// Largest number of `T` the parameter page can hold.
    pub(crate) const fn param_capacity<T>() -> usize {
        PAGE_SIZE / size_of::<T>()
    }

    /// Kernel virtual address of the request page, which is also the base of the buffer.
    pub(crate) fn request_addr(&self) -> usize {
        self.pages.as_ptr().expose_provenance()
    }

    pub(crate) fn params_addr(&self) -> usize {
        self.request_addr() + PAGE_SIZE
    }

    fn request_ptr(&self) -> *mut u8 {
        self.pages.as_ptr().cast::<u8>()
    }

    fn params_ptr(&self) -> *mut u8 {
        // SAFETY: The parameter page lies entirely within the allocation.
        unsafe { self.request_ptr().add(PAGE_SIZE) }
    }

    pub(crate) fn write_request<T: IntoBytes + Immutable>(&mut self, request: &T) {
        const { assert!(size_of::<T>() <= PAGE_SIZE) };
        let bytes = request.as_bytes();
        // SAFETY: `bytes` fits in the request page, which we exclusively own.
        unsafe { core::ptr::copy_nonoverlapping(bytes.as_ptr(), self.request_ptr(), bytes.len()) };
    }

    pub(crate) fn read_request<T: FromBytes + IntoBytes>(&self) -> T {
        const { assert!(size_of::<T>() <= PAGE_SIZE) };
        let mut request = T::new_zeroed();
        let bytes = request.as_mut_bytes();
        // SAFETY: The source lies within the request page and the destination is a local value.
        unsafe {
            core::ptr::copy_nonoverlapping(self.request_ptr(), bytes.as_mut_ptr(), bytes.len())
        };
        request
    }

    /// Copy `params` into the parameter page.
    pub(crate) fn write_params<T: IntoBytes + Immutable>(
        &mut self,
        params: &[T],
    ) -> Result<(), TeError> {
        let bytes = params.as_bytes();
        if bytes.len() > PAGE_SIZE {
            return Err(TeError::BadParameters);
        }
        // SAFETY: `bytes` fits in the parameter page, which we exclusively own.
        unsafe { core::ptr::copy_nonoverlapping(bytes.as_ptr(), self.params_ptr(), bytes.len()) };
        Ok(())
    }

    /// Copy the parameter page back over `params`.
    pub(crate) fn read_params<T: FromBytes + IntoBytes>(&self, params: &mut [T]) {
        let bytes = params.as_mut_bytes();
        let len = bytes.len().min(PAGE_SIZE);
        // SAFETY: At most one page is read from the parameter page into a caller-owned slice.
        unsafe { core::ptr::copy_nonoverlapping(self.params_ptr(), bytes.as_mut_ptr(), len) };
    }
}

impl Drop for CallBuffer {
    fn drop(&mut self) {
        // SAFETY: `pages` came from `Box::leak` in `new` and is not used after this point.
        drop(unsafe { Box::from_raw(self.pages.as_ptr()) });
    }
}
