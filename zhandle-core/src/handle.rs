//! Exclusive, move-only ownership of one foreign resource.

use std::fmt;
use std::mem::{self, ManuallyDrop};
use std::ptr;

use crate::error::{HandleError, Result};
use crate::failure::FailureSignal;
use crate::ffi::{RawHandle, Releaser};

/// Lifecycle of a handle. `Released` is terminal.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum HandleState {
    /// Never owned anything (default-constructed or moved out of).
    Uninitialized,
    Live,
    Released,
}

/// Owns one foreign resource and releases it exactly once.
///
/// Null iff nothing live is owned. Not `Clone`; ownership moves by value or with [`take`].
/// Drop releases a live resource but never reports failure; call [`release`] to observe it.
///
/// [`take`]: ForeignHandle::take
/// [`release`]: ForeignHandle::release
pub struct ForeignHandle {
    raw: RawHandle,
    releaser: Option<Releaser>,
}

// The resource moves between threads with its owner; it is never touched concurrently
// through a `ForeignHandle`.
unsafe impl Send for ForeignHandle {}

impl ForeignHandle {
    /// Take ownership of `raw`.
    ///
    /// # Safety
    /// `raw` must be a live resource that `releaser` may destroy, and nothing else may
    /// release it.
    ///
    /// # Panics
    /// If `raw` is null. A null handle here is a bug in the caller, not a foreign failure.
    pub unsafe fn acquire(raw: RawHandle, releaser: Releaser) -> Self {
        assert!(!raw.is_null(), "acquire called with a null foreign handle");
        log::debug!("acquired foreign handle {:p}", raw);
        Self {
            raw,
            releaser: Some(releaser),
        }
    }

    /// Run a foreign constructor and own what it returns.
    /// A null return becomes `AcquisitionFailure`, with the foreign error read immediately.
    ///
    /// # Safety
    /// A non-null return from `ctor` must satisfy the contract of [`ForeignHandle::acquire`].
    pub unsafe fn create<F>(ctor: F, releaser: Releaser) -> Result<Self>
    where
        F: FnOnce() -> RawHandle,
    {
        let raw = ctor();
        if raw.is_null() {
            let signal = FailureSignal::last(releaser.diagnostics());
            log::debug!("foreign constructor failed: {}", signal);
            return Err(HandleError::AcquisitionFailure(signal));
        }
        Ok(Self::acquire(raw, releaser))
    }

    /// Raw handle, null when not live.
    pub fn raw(&self) -> RawHandle {
        self.raw
    }

    /// Raw handle for a foreign call, or `Closed`.
    pub fn get(&self) -> Result<RawHandle> {
        if self.raw.is_null() {
            Err(HandleError::Closed)
        } else {
            Ok(self.raw)
        }
    }

    pub fn is_live(&self) -> bool {
        !self.raw.is_null()
    }

    pub fn state(&self) -> HandleState {
        match (self.raw.is_null(), self.releaser.is_some()) {
            (false, _) => HandleState::Live,
            (true, true) => HandleState::Released,
            (true, false) => HandleState::Uninitialized,
        }
    }

    /// Release now and report the outcome. Idempotent: later calls return `Ok(())`.
    /// The handle is nulled before the foreign call, so a failed release is not retried.
    pub fn release(&mut self) -> Result<()> {
        let raw = mem::replace(&mut self.raw, ptr::null_mut());
        let Some(releaser) = self.releaser.filter(|_| !raw.is_null()) else {
            return Ok(());
        };
        log::debug!("releasing foreign handle {:p}", raw);
        unsafe { releaser.release(raw) }.map_err(HandleError::ReleaseFailure)
    }

    /// Move ownership out, leaving this handle null and uninitialized.
    pub fn take(&mut self) -> Self {
        Self {
            raw: mem::replace(&mut self.raw, ptr::null_mut()),
            releaser: self.releaser.take(),
        }
    }

    /// Give up ownership without releasing. The caller becomes responsible for the resource.
    pub fn into_raw(self) -> RawHandle {
        let mut this = ManuallyDrop::new(self);
        mem::replace(&mut this.raw, ptr::null_mut())
    }

    /// Split into raw handle and releaser, skipping drop. `None` if nothing live is owned.
    pub(crate) fn into_parts(self) -> Option<(RawHandle, Releaser)> {
        let releaser = self.releaser;
        let raw = self.into_raw();
        if raw.is_null() {
            return None;
        }
        releaser.map(|r| (raw, r))
    }
}

impl Default for ForeignHandle {
    fn default() -> Self {
        Self {
            raw: ptr::null_mut(),
            releaser: None,
        }
    }
}

impl Drop for ForeignHandle {
    fn drop(&mut self) {
        if self.raw.is_null() {
            return;
        }
        if let Some(releaser) = self.releaser {
            log::debug!("dropping foreign handle {:p}", self.raw);
            unsafe { releaser.release_quietly(self.raw) };
        }
    }
}

impl fmt::Debug for ForeignHandle {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ForeignHandle")
            .field("raw", &self.raw)
            .field("state", &self.state())
            .finish()
    }
}
