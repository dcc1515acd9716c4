//! Stub foreign library for exercising handles and buffer adoption without a native library.
//!
//! A [`StubResource`] is its own raw handle: the stub release function counts calls on it
//! and fails on demand, setting a per-thread error number the way a native library would.

use std::cell::Cell;
use std::os::raw::{c_char, c_int};
use std::sync::atomic::{AtomicI32, AtomicIsize, AtomicUsize, Ordering};
use std::sync::Arc;

use crate::adoption::Lendable;
use crate::ffi::{Diagnostics, RawHandle, Releaser, SENTINEL_STATUS};

thread_local! {
    static STUB_ERRNO: Cell<c_int> = const { Cell::new(0) };
}

/// Set the stub error number for the calling thread.
pub fn set_stub_errno(code: c_int) {
    STUB_ERRNO.with(|e| e.set(code));
}

unsafe extern "C" fn stub_errno() -> c_int {
    STUB_ERRNO.with(Cell::get)
}

unsafe extern "C" fn stub_describe(_code: c_int) -> *const c_char {
    b"stub resource failure\0".as_ptr() as *const c_char
}

unsafe extern "C" fn stub_release(raw: RawHandle) -> c_int {
    let stub = &*(raw as *const StubResource);
    stub.releases.fetch_add(1, Ordering::SeqCst);
    match stub.fail_errno.load(Ordering::SeqCst) {
        0 => 0,
        errno => {
            set_stub_errno(errno);
            SENTINEL_STATUS
        }
    }
}

/// Diagnostics backed by the stub error number and a fixed message.
pub fn stub_diagnostics() -> Diagnostics {
    unsafe { Diagnostics::new(stub_errno, stub_describe) }
}

/// Counting stand-in for a foreign resource.
#[derive(Debug, Default)]
pub struct StubResource {
    releases: AtomicUsize,
    fail_errno: AtomicI32,
}

impl StubResource {
    /// Allocate a stub that lives for the rest of the process.
    pub fn leak() -> &'static StubResource {
        Box::leak(Box::default())
    }

    /// Releaser calling the stub release function, with stub diagnostics.
    pub fn releaser() -> Releaser {
        unsafe { Releaser::new(stub_release) }.with_diagnostics(stub_diagnostics())
    }

    pub fn raw(&'static self) -> RawHandle {
        self as *const StubResource as RawHandle
    }

    /// Number of times the release function ran on this stub.
    pub fn releases(&self) -> usize {
        self.releases.load(Ordering::SeqCst)
    }

    /// Make later releases fail with `errno`. Zero restores success.
    pub fn fail_with(&self, errno: c_int) {
        self.fail_errno.store(errno, Ordering::SeqCst);
    }
}

/// Pin bookkeeping shared between a [`CountingBuffer`] and the test observing it.
#[derive(Debug, Default)]
pub struct PinCounter {
    pinned: AtomicIsize,
    pins: AtomicUsize,
    unpins: AtomicUsize,
    reclaimed: AtomicUsize,
}

impl PinCounter {
    /// Outstanding pins. Zero means the memory is movable again.
    pub fn pinned(&self) -> isize {
        self.pinned.load(Ordering::SeqCst)
    }

    pub fn pins(&self) -> usize {
        self.pins.load(Ordering::SeqCst)
    }

    pub fn unpins(&self) -> usize {
        self.unpins.load(Ordering::SeqCst)
    }

    /// Times the buffer came back through a reclaim hook.
    pub fn reclaimed(&self) -> usize {
        self.reclaimed.load(Ordering::SeqCst)
    }

    pub fn note_reclaimed(&self) {
        self.reclaimed.fetch_add(1, Ordering::SeqCst);
    }
}

/// Lendable buffer standing in for memory owned by a relocating memory manager.
#[derive(Debug)]
pub struct CountingBuffer {
    bytes: Vec<u8>,
    counter: Arc<PinCounter>,
}

impl CountingBuffer {
    pub fn new(bytes: Vec<u8>) -> (Self, Arc<PinCounter>) {
        let counter = Arc::new(PinCounter::default());
        (
            Self {
                bytes,
                counter: counter.clone(),
            },
            counter,
        )
    }

    pub fn bytes(&self) -> &[u8] {
        &self.bytes
    }
}

unsafe impl Lendable for CountingBuffer {
    fn pin(&mut self) -> (*mut u8, usize) {
        self.counter.pinned.fetch_add(1, Ordering::SeqCst);
        self.counter.pins.fetch_add(1, Ordering::SeqCst);
        (self.bytes.as_mut_ptr(), self.bytes.len())
    }

    fn unpin(&mut self) {
        self.counter.pinned.fetch_sub(1, Ordering::SeqCst);
        self.counter.unpins.fetch_add(1, Ordering::SeqCst);
    }
}
