//! Shared ownership of one foreign resource across threads.
//!
//! All copies point at one heap payload `{count, handle, releaser}`. The count is the
//! `Arc` strong count; the handle is an `AtomicPtr` so a forced release on any copy
//! nulls it for every copy at once. Whoever swaps a non-null handle out of the payload
//! owns the single call to the release function.
//!
//! Only the count and the handle swap are atomic. A forced release does not wait for
//! copies that are mid-call on another thread: do not force-release a resource you know
//! is in use elsewhere unless the foreign library tolerates it vanishing mid-operation.

use std::ffi::c_void;
use std::fmt;
use std::ptr;
use std::sync::atomic::{AtomicPtr, Ordering};
use std::sync::Arc;

use crate::error::{HandleError, Result};
use crate::ffi::{RawHandle, Releaser};
use crate::handle::{ForeignHandle, HandleState};

struct Payload {
    raw: AtomicPtr<c_void>,
    releaser: Releaser,
}

impl Payload {
    /// Swap the handle out. Non-null means the caller must release it.
    fn take_raw(&self) -> RawHandle {
        self.raw.swap(ptr::null_mut(), Ordering::AcqRel)
    }
}

impl Drop for Payload {
    fn drop(&mut self) {
        let raw = *self.raw.get_mut();
        if !raw.is_null() {
            log::debug!("last shared handle dropped, releasing {:p}", raw);
            unsafe { self.releaser.release_quietly(raw) };
        }
    }
}

/// Reference-counted foreign resource. Cloning is a copy; the last copy out releases.
pub struct SharedHandle {
    payload: Option<Arc<Payload>>,
}

impl SharedHandle {
    /// Take ownership of `raw` with a count of one.
    ///
    /// # Safety
    /// Same contract as [`ForeignHandle::acquire`], and `raw` must tolerate being used
    /// from any thread holding a copy.
    ///
    /// # Panics
    /// If `raw` is null.
    pub unsafe fn new(raw: RawHandle, releaser: Releaser) -> Self {
        assert!(!raw.is_null(), "shared handle created from a null foreign handle");
        log::debug!("shared foreign handle {:p}", raw);
        Self {
            payload: Some(Arc::new(Payload {
                raw: AtomicPtr::new(raw),
                releaser,
            })),
        }
    }

    /// Share an exclusively owned resource.
    ///
    /// # Safety
    /// The resource behind `handle` must tolerate being used from any thread holding a copy.
    pub unsafe fn from_exclusive(handle: ForeignHandle) -> Result<Self> {
        let (raw, releaser) = handle.into_parts().ok_or(HandleError::Closed)?;
        Ok(Self::new(raw, releaser))
    }

    /// Current raw handle; null once this copy is detached or the resource is released.
    pub fn handle(&self) -> RawHandle {
        match &self.payload {
            Some(p) => p.raw.load(Ordering::Acquire),
            None => ptr::null_mut(),
        }
    }

    /// Raw handle for a foreign call, or `Closed` if released by any copy.
    pub fn get(&self) -> Result<RawHandle> {
        let raw = self.handle();
        if raw.is_null() {
            Err(HandleError::Closed)
        } else {
            Ok(raw)
        }
    }

    pub fn is_live(&self) -> bool {
        !self.handle().is_null()
    }

    pub fn state(&self) -> HandleState {
        if self.is_live() {
            HandleState::Live
        } else {
            HandleState::Released
        }
    }

    /// Copies sharing this payload, including this one. Zero once detached.
    pub fn ref_count(&self) -> usize {
        self.payload.as_ref().map_or(0, Arc::strong_count)
    }

    /// Whether both copies share one payload.
    pub fn ptr_eq(&self, other: &SharedHandle) -> bool {
        match (&self.payload, &other.payload) {
            (Some(a), Some(b)) => Arc::ptr_eq(a, b),
            _ => false,
        }
    }

    /// Drop this copy's reference now. The copy that takes the count to zero releases
    /// and gets the outcome. Detaching twice is a no-op.
    pub fn detach(&mut self) -> Result<()> {
        let Some(payload) = self.payload.take() else {
            return Ok(());
        };
        let Some(mut last) = Arc::into_inner(payload) else {
            return Ok(());
        };
        let raw = std::mem::replace(last.raw.get_mut(), ptr::null_mut());
        if raw.is_null() {
            // Already force-released.
            return Ok(());
        }
        log::debug!("last shared handle detached, releasing {:p}", raw);
        unsafe { last.releaser.release(raw) }.map_err(HandleError::ReleaseFailure)
    }

    /// Release the resource now regardless of the count. Every copy sees a null handle
    /// immediately. A failed release is reported and not retried; later forced releases
    /// and the final detach do not call the release function again.
    pub fn force_release(&self) -> Result<()> {
        let Some(payload) = &self.payload else {
            return Ok(());
        };
        let raw = payload.take_raw();
        if raw.is_null() {
            return Ok(());
        }
        log::debug!(
            "force releasing {:p} with {} copies outstanding",
            raw,
            Arc::strong_count(payload)
        );
        unsafe { payload.releaser.release(raw) }.map_err(HandleError::ReleaseFailure)
    }
}

impl Clone for SharedHandle {
    fn clone(&self) -> Self {
        if let Some(p) = &self.payload {
            log::trace!("copy of shared handle {:p}", p.raw.load(Ordering::Relaxed));
        }
        Self {
            payload: self.payload.clone(),
        }
    }
}

impl fmt::Debug for SharedHandle {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("SharedHandle")
            .field("raw", &self.handle())
            .field("ref_count", &self.ref_count())
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::TeardownPolicy;
    use crate::testing::StubResource;
    use rand::Rng;
    use std::sync::Barrier;

    fn shared(stub: &'static StubResource) -> SharedHandle {
        unsafe { SharedHandle::new(stub.raw(), StubResource::releaser()) }
    }

    #[test]
    fn last_detach_releases() {
        let stub = StubResource::leak();
        let mut a = shared(stub);
        let mut b = a.clone();
        assert_eq!(a.ref_count(), 2);
        a.detach().unwrap();
        assert_eq!(stub.releases(), 0);
        assert_eq!(b.ref_count(), 1);
        assert_eq!(b.handle(), stub.raw());
        b.detach().unwrap();
        assert_eq!(stub.releases(), 1);
        assert!(a.handle().is_null());
        assert!(b.handle().is_null());
    }

    #[test]
    fn detach_twice_is_noop() {
        let stub = StubResource::leak();
        let mut a = shared(stub);
        let b = a.clone();
        a.detach().unwrap();
        a.detach().unwrap();
        assert_eq!(b.ref_count(), 1);
        assert_eq!(stub.releases(), 0);
        drop(b);
        assert_eq!(stub.releases(), 1);
        a.detach().unwrap();
        assert_eq!(stub.releases(), 1);
    }

    #[test]
    fn random_copy_detach_sequences_release_once() {
        let mut rng = rand::thread_rng();
        for _ in 0..50 {
            let stub = StubResource::leak();
            let mut copies = vec![shared(stub)];
            for _ in 0..rng.gen_range(1..20) {
                let i = rng.gen_range(0..copies.len());
                let copy = copies[i].clone();
                copies.push(copy);
            }
            while copies.len() > 1 {
                let i = rng.gen_range(0..copies.len());
                let mut c = copies.swap_remove(i);
                if rng.gen_bool(0.5) {
                    c.detach().unwrap();
                }
                assert_eq!(stub.releases(), 0);
            }
            copies.pop().unwrap().detach().unwrap();
            assert_eq!(stub.releases(), 1);
        }
    }

    #[test]
    fn force_release_nulls_every_copy() {
        let stub = StubResource::leak();
        let a = shared(stub);
        let b = a.clone();
        let c = b.clone();
        b.force_release().unwrap();
        assert_eq!(stub.releases(), 1);
        for copy in [&a, &b, &c] {
            assert!(copy.handle().is_null());
            assert_eq!(copy.state(), HandleState::Released);
            assert_eq!(copy.get(), Err(HandleError::Closed));
        }
        assert_eq!(a.ref_count(), 3);
        drop((a, b, c));
        assert_eq!(stub.releases(), 1);
    }

    #[test]
    fn force_release_then_detach_does_not_release_again() {
        let stub = StubResource::leak();
        let mut a = shared(stub);
        a.force_release().unwrap();
        a.force_release().unwrap();
        a.detach().unwrap();
        assert_eq!(stub.releases(), 1);
    }

    #[test]
    fn force_release_visible_across_threads() {
        let stub = StubResource::leak();
        let a = shared(stub);
        let b = a.clone();
        std::thread::spawn(move || b.force_release().unwrap())
            .join()
            .unwrap();
        assert!(a.handle().is_null());
        assert_eq!(stub.releases(), 1);
    }

    #[test]
    fn concurrent_detach_releases_once() {
        const THREADS: usize = 8;
        let mut rng = rand::thread_rng();
        for _ in 0..100 {
            let stub = StubResource::leak();
            let origin = shared(stub);
            let barrier = Arc::new(Barrier::new(THREADS));
            let workers: Vec<_> = (0..THREADS)
                .map(|_| {
                    let mut copy = origin.clone();
                    let barrier = barrier.clone();
                    let spins = rng.gen_range(0..200);
                    std::thread::spawn(move || {
                        barrier.wait();
                        for _ in 0..spins {
                            std::hint::spin_loop();
                        }
                        copy.detach().unwrap();
                    })
                })
                .collect();
            drop(origin);
            for w in workers {
                w.join().unwrap();
            }
            assert_eq!(stub.releases(), 1);
        }
    }

    #[test]
    fn concurrent_force_release_releases_once() {
        let stub = StubResource::leak();
        let origin = shared(stub);
        let barrier = Arc::new(Barrier::new(4));
        let workers: Vec<_> = (0..4)
            .map(|_| {
                let copy = origin.clone();
                let barrier = barrier.clone();
                std::thread::spawn(move || {
                    barrier.wait();
                    copy.force_release().unwrap();
                })
            })
            .collect();
        for w in workers {
            w.join().unwrap();
        }
        assert!(origin.handle().is_null());
        assert_eq!(stub.releases(), 1);
    }

    #[test]
    fn last_detach_propagates_failure() {
        let stub = StubResource::leak();
        stub.fail_with(9);
        let mut a = shared(stub);
        let mut b = a.clone();
        a.detach().unwrap();
        let err = b.detach().unwrap_err();
        assert_eq!(err.code(), Some(9));
        assert_eq!(stub.releases(), 1);
    }

    #[test]
    fn force_release_propagates_failure_without_retry() {
        let stub = StubResource::leak();
        stub.fail_with(14);
        let a = shared(stub);
        let mut b = a.clone();
        let err = a.force_release().unwrap_err();
        assert!(matches!(err, HandleError::ReleaseFailure(_)));
        assert_eq!(err.code(), Some(14));
        assert!(a.handle().is_null());
        assert!(b.handle().is_null());
        a.force_release().unwrap();
        b.detach().unwrap();
        drop(a);
        assert_eq!(stub.releases(), 1);
    }

    #[test]
    fn drop_swallows_failure() {
        let stub = StubResource::leak();
        stub.fail_with(9);
        let releaser = StubResource::releaser().with_teardown(TeardownPolicy::Log);
        let a = unsafe { SharedHandle::new(stub.raw(), releaser) };
        let b = a.clone();
        drop(a);
        drop(b);
        assert_eq!(stub.releases(), 1);
    }

    #[test]
    fn from_exclusive_transfers_ownership() {
        let stub = StubResource::leak();
        let exclusive = unsafe { ForeignHandle::acquire(stub.raw(), StubResource::releaser()) };
        let a = unsafe { SharedHandle::from_exclusive(exclusive) }.unwrap();
        let b = a.clone();
        assert!(a.ptr_eq(&b));
        drop(a);
        drop(b);
        assert_eq!(stub.releases(), 1);

        let err = unsafe { SharedHandle::from_exclusive(ForeignHandle::default()) }.unwrap_err();
        assert_eq!(err, HandleError::Closed);
    }
}
