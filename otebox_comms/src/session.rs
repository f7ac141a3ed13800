// Copyright (c) Microsoft Corporation.
// Licensed under the MIT license.

//! Sessions opened by one client, keyed by the id the secure side assigned.

use alloc::collections::BTreeMap;
use alloc::vec::Vec;
use core::mem;
use thiserror::Error;

use crate::platform::UserPagesProvider;
use crate::shmem::{SharedMemDesc, unpin_all};

#[derive(Error, Debug, Clone, Copy, PartialEq, Eq)]
#[non_exhaustive]
pub enum SessionError {
    #[error("session {0} already exists")]
    AlreadyExists(u32),
    #[error("session {0} does not exist")]
    NotFound(u32),
}

/// An open session and the buffers bound to it for its whole lifetime.
#[derive(Debug)]
pub struct Session<Page> {
    id: u32,
    persistent: Vec<SharedMemDesc<Page>>,
}

impl<Page> Session<Page> {
    pub fn id(&self) -> u32 {
        self.id
    }

    pub fn persistent(&self) -> &[SharedMemDesc<Page>] {
        &self.persistent
    }

    /// Total number of pages pinned on behalf of this session.
    pub fn pinned_pages(&self) -> usize {
        self.persistent.iter().map(SharedMemDesc::page_count).sum()
    }

    /// Unpin every persistent buffer, consuming the session.
    pub(crate) fn release<P: UserPagesProvider<Page = Page>>(self, provider: &P) {
        log::debug!(
            session_id = self.id,
            buffers = self.persistent.len();
            "releasing session buffers"
        );
        unpin_all(provider, self.persistent);
    }
}

/// Ordered map of the sessions of one client.
///
/// Clients may inspect the registry, but only the owning context adds or removes sessions since
/// a removed session still holds pinned pages.
pub struct SessionRegistry<Page> {
    sessions: spin::mutex::SpinMutex<BTreeMap<u32, Session<Page>>>,
}

impl<Page> Default for SessionRegistry<Page> {
    fn default() -> Self {
        Self::new()
    }
}

impl<Page> SessionRegistry<Page> {
    pub const fn new() -> Self {
        Self {
            sessions: spin::mutex::SpinMutex::new(BTreeMap::new()),
        }
    }

    /// Create an empty session under `id`.
    pub(crate) fn allocate(&self, id: u32) -> Result<(), SessionError> {
        self.allocate_with(id, &mut Vec::new())
    }

    /// Create a session under `id` and move every descriptor out of `persistent` into it.
    ///
    /// On failure `persistent` is left untouched.
    pub(crate) fn allocate_with(
        &self,
        id: u32,
        persistent: &mut Vec<SharedMemDesc<Page>>,
    ) -> Result<(), SessionError> {
        let mut sessions = self.sessions.lock();
        if sessions.contains_key(&id) {
            return Err(SessionError::AlreadyExists(id));
        }
        let persistent = mem::take(persistent);
        log::debug!(session_id = id, buffers = persistent.len(); "session allocated");
        let _ = sessions.insert(id, Session { id, persistent });
        Ok(())
    }

    /// Append every descriptor in `persistent` to the session `id`.
    ///
    /// On failure `persistent` is left untouched.
    pub(crate) fn attach(
        &self,
        id: u32,
        persistent: &mut Vec<SharedMemDesc<Page>>,
    ) -> Result<(), SessionError> {
        let mut sessions = self.sessions.lock();
        let session = sessions.get_mut(&id).ok_or(SessionError::NotFound(id))?;
        log::debug!(session_id = id, buffers = persistent.len(); "binding persistent buffers");
        session.persistent.append(persistent);
        Ok(())
    }

    /// Inspect the session `id`.
    pub fn lookup<R>(
        &self,
        id: u32,
        f: impl FnOnce(&Session<Page>) -> R,
    ) -> Result<R, SessionError> {
        let sessions = self.sessions.lock();
        sessions.get(&id).map(f).ok_or(SessionError::NotFound(id))
    }

    pub fn contains(&self, id: u32) -> bool {
        self.sessions.lock().contains_key(&id)
    }

    /// Remove the session `id`, handing it back so its buffers can be released.
    pub(crate) fn erase(&self, id: u32) -> Result<Session<Page>, SessionError> {
        let session = self.sessions.lock().remove(&id).ok_or(SessionError::NotFound(id))?;
        log::debug!(session_id = id; "session erased");
        Ok(session)
    }

    pub fn len(&self) -> usize {
        self.sessions.lock().len()
    }

    pub fn is_empty(&self) -> bool {
        self.sessions.lock().is_empty()
    }

    /// Ids of every live session, ascending.
    pub fn ids(&self) -> Vec<u32> {
        self.sessions.lock().keys().copied().collect()
    }

    /// Remove every session.
    pub(crate) fn drain(&self) -> Vec<Session<Page>> {
        let sessions = mem::take(&mut *self.sessions.lock());
        sessions.into_values().collect()
    }
}
