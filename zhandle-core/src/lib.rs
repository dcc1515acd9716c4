//! Ownership core for a native messaging binding.
//! Foreign contexts, sockets and message buffers are released through exactly one foreign
//! call, exactly once, however they are moved, shared or lent.

pub mod adoption;
pub mod config;
pub mod error;
pub mod failure;
pub mod ffi;
pub mod handle;
pub mod shared;
#[cfg(any(test, feature = "testing"))]
pub mod testing;

pub use adoption::{
    adopt, ceded_count, lend, lend_with, require_len, ForeignBuffer, Lendable, PinToken,
};
pub use config::{Config, TeardownPolicy};
pub use error::{HandleError, Result};
pub use failure::{check_ptr, check_status, FailureSignal};
pub use ffi::{BufferFreeFn, DiagnosticFn, Diagnostics, ErrnoFn, RawHandle, ReleaseFn, Releaser};
pub use handle::{ForeignHandle, HandleState};
pub use shared::SharedHandle;
