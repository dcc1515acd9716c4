//! Buffer adoption: lend memory to a foreign system, get it back through its free callback.
//!
//! `lend` pins the memory and produces a [`PinToken`]. The token either comes back
//! unused ([`PinToken::reclaim`], or drop) or is ceded with [`PinToken::into_foreign`],
//! after which the foreign system calls the returned free function on any thread. Every
//! path unpins exactly once.
//!
//! Ceded records live in a process-wide registry keyed by a never-reused ticket, which is
//! what the foreign side gets as its hint. The first free call removes the record; a
//! repeated or stale call finds nothing and returns.
//!
//! Heap memory owned by a `Vec<u8>` or `Box<[u8]>` never moves, so pinning those is a
//! no-op and adoption is just moving ownership into the foreign call. Memory owned by a
//! relocating manager implements [`Lendable`] with real pin/unpin hooks.

use std::collections::HashMap;
use std::ffi::c_void;
use std::fmt;
use std::mem;
use std::os::raw::c_int;
use std::panic::{self, AssertUnwindSafe};
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Mutex, MutexGuard};

use lazy_static::lazy_static;

use crate::error::{HandleError, Result};
use crate::failure::FailureSignal;
use crate::ffi::{BufferFreeFn, Diagnostics};

/// Memory whose address can be handed to a foreign system.
///
/// # Safety
/// Between `pin` and `unpin` the returned region must stay valid, must not move, and
/// must not be read or written through `self`.
pub unsafe trait Lendable: Send + 'static {
    /// Fix the memory in place and return its address and length.
    fn pin(&mut self) -> (*mut u8, usize);
    /// Make the memory movable again.
    fn unpin(&mut self);
}

unsafe impl Lendable for Vec<u8> {
    fn pin(&mut self) -> (*mut u8, usize) {
        (self.as_mut_ptr(), self.len())
    }

    fn unpin(&mut self) {}
}

unsafe impl Lendable for Box<[u8]> {
    fn pin(&mut self) -> (*mut u8, usize) {
        (self.as_mut_ptr(), self.len())
    }

    fn unpin(&mut self) {}
}

type ReclaimHook<M> = Box<dyn FnOnce(M) + Send>;

/// `{pointer, length, pinned}` plus the lent memory and the caller's reclaim hook.
struct Adoption<M: Lendable> {
    memory: Option<M>,
    data: *mut u8,
    len: usize,
    pinned: bool,
    on_reclaim: Option<ReclaimHook<M>>,
}

// `data` points into `memory`, which is `Send`.
unsafe impl<M: Lendable> Send for Adoption<M> {}

impl<M: Lendable> Adoption<M> {
    fn pin(mut memory: M, on_reclaim: Option<ReclaimHook<M>>) -> Self {
        let (data, len) = memory.pin();
        Self {
            memory: Some(memory),
            data,
            len,
            pinned: true,
            on_reclaim,
        }
    }

    /// Unpin and hand the memory to the hook. Only the first call does anything.
    fn reclaim(&mut self) {
        if !self.pinned {
            return;
        }
        self.pinned = false;
        let Some(mut memory) = self.memory.take() else {
            return;
        };
        memory.unpin();
        log::trace!("reclaimed {} bytes at {:p}", self.len, self.data);
        match self.on_reclaim.take() {
            Some(hook) => hook(memory),
            None => drop(memory),
        }
    }
}

impl<M: Lendable> Drop for Adoption<M> {
    fn drop(&mut self) {
        self.reclaim();
    }
}

/// A ceded adoption record; dropping it reclaims the memory.
trait Ceded: Send {}

impl<M: Lendable> Ceded for Adoption<M> {}

lazy_static! {
    static ref CEDED: Mutex<HashMap<usize, Box<dyn Ceded>>> = Mutex::new(HashMap::new());
}

/// Ticket zero is never issued, so a null hint is never a live record.
static NEXT_TICKET: AtomicUsize = AtomicUsize::new(1);

fn ceded() -> MutexGuard<'static, HashMap<usize, Box<dyn Ceded>>> {
    CEDED.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
}

/// Number of buffers currently held by the foreign side.
pub fn ceded_count() -> usize {
    ceded().len()
}

/// Pinned memory not yet ceded to the foreign side.
pub struct PinToken<M: Lendable> {
    record: Box<Adoption<M>>,
}

/// What a foreign "adopt this buffer" call needs: data, length, free function, hint.
#[derive(Debug, Clone, Copy)]
pub struct ForeignBuffer {
    pub data: *mut c_void,
    pub len: usize,
    pub free: BufferFreeFn,
    pub hint: *mut c_void,
}

/// Pin `memory` for lending. The memory is dropped once reclaimed.
pub fn lend<M: Lendable>(memory: M) -> PinToken<M> {
    PinToken {
        record: Box::new(Adoption::pin(memory, None)),
    }
}

/// Pin `memory` for lending; `on_reclaim` gets it back, unpinned, once the foreign
/// side is done. The hook may run on a foreign thread.
pub fn lend_with<M, R>(memory: M, on_reclaim: R) -> PinToken<M>
where
    M: Lendable,
    R: FnOnce(M) + Send + 'static,
{
    PinToken {
        record: Box::new(Adoption::pin(memory, Some(Box::new(on_reclaim)))),
    }
}

impl<M: Lendable> PinToken<M> {
    pub fn as_ptr(&self) -> *mut u8 {
        self.record.data
    }

    pub fn len(&self) -> usize {
        self.record.len
    }

    pub fn is_empty(&self) -> bool {
        self.record.len == 0
    }

    pub fn is_pinned(&self) -> bool {
        self.record.pinned
    }

    /// Take the memory back without ever ceding it.
    pub fn reclaim(mut self) {
        self.record.reclaim();
    }

    /// Cede the memory. The foreign side calls `free(data, hint)` when done; until then the
    /// memory stays pinned. Calls after the first are ignored.
    pub fn into_foreign(self) -> ForeignBuffer {
        let data = self.record.data as *mut c_void;
        let len = self.record.len;
        let ticket = NEXT_TICKET.fetch_add(1, Ordering::Relaxed);
        ceded().insert(ticket, self.record);
        ForeignBuffer {
            data,
            len,
            free: reclaim_trampoline,
            hint: ticket as *mut c_void,
        }
    }
}

impl<M: Lendable> fmt::Debug for PinToken<M> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("PinToken")
            .field("data", &self.record.data)
            .field("len", &self.record.len)
            .field("pinned", &self.record.pinned)
            .finish()
    }
}

/// Free callback handed to the foreign side. `hint` is the registry ticket.
unsafe extern "C" fn reclaim_trampoline(_data: *mut c_void, hint: *mut c_void) {
    // Removed under the lock, dropped outside it: the reclaim hook may lend again.
    let removed = ceded().remove(&(hint as usize));
    let Some(record) = removed else {
        log::warn!("ignoring free callback for unknown buffer ticket {:p}", hint);
        return;
    };
    let outcome = panic::catch_unwind(AssertUnwindSafe(|| drop(record)));
    if outcome.is_err() {
        log::error!("buffer reclaim hook panicked on a foreign thread");
    }
}

/// Frees a ceded buffer unless disarmed. Covers refusal and a panicking `accept`.
struct RefusalGuard(ForeignBuffer);

impl Drop for RefusalGuard {
    fn drop(&mut self) {
        unsafe { (self.0.free)(self.0.data, self.0.hint) };
    }
}

/// Lend `memory` and offer it to a foreign call.
///
/// `accept` passes the buffer to the foreign side and returns its status; negative means
/// the buffer was refused. On refusal the memory is unpinned (and handed to `on_reclaim`)
/// before `BufferRejected` is returned.
///
/// # Safety
/// When `accept` reports success the foreign side must eventually call `free(data, hint)`.
/// When it reports failure or panics the foreign side must not keep the buffer.
pub unsafe fn adopt<M, R, A>(
    memory: M,
    on_reclaim: R,
    diagnostics: &Diagnostics,
    accept: A,
) -> Result<()>
where
    M: Lendable,
    R: FnOnce(M) + Send + 'static,
    A: FnOnce(ForeignBuffer) -> c_int,
{
    let buffer = lend_with(memory, on_reclaim).into_foreign();
    let guard = RefusalGuard(buffer);
    let status = accept(buffer);
    if status >= 0 {
        mem::forget(guard);
        log::debug!("foreign side adopted {} bytes at {:p}", buffer.len, buffer.data);
        return Ok(());
    }
    // Capture before unpinning; the reclaim hook may make foreign calls of its own.
    let signal = FailureSignal::from_status(status, diagnostics);
    drop(guard);
    log::debug!("foreign side refused buffer: {}", signal);
    Err(HandleError::BufferRejected(signal))
}

/// Reject caller-supplied buffers shorter than a fixed size the foreign side requires.
pub fn require_len(actual: usize, required: usize) -> Result<()> {
    if actual < required {
        Err(HandleError::InvalidBufferSize { required, actual })
    } else {
        Ok(())
    }
}
