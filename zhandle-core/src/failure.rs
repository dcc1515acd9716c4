//! Foreign failure capture: sentinel returns become `{code, message}` at the call site.
//!
//! The foreign error number lives in per-thread global state that the next foreign call
//! (or a log write) may overwrite, so it is read and described immediately, never later.

use std::os::raw::c_int;

use crate::error::{HandleError, Result};
use crate::ffi::{Diagnostics, SENTINEL_STATUS};

/// Immutable record of one foreign failure.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
#[error("{message} (code {code})")]
pub struct FailureSignal {
    code: c_int,
    message: String,
}

impl FailureSignal {
    /// Build a signal for `code`, describing it through the foreign lookup now.
    pub fn raise(code: c_int, diagnostics: &Diagnostics) -> Self {
        Self {
            code,
            message: diagnostics.describe(code),
        }
    }

    /// Read the foreign error number on this thread and raise it.
    pub fn last(diagnostics: &Diagnostics) -> Self {
        let code = diagnostics.last_errno();
        Self::raise(code, diagnostics)
    }

    /// Status returned by a failed call. The `-1` sentinel defers to the error number;
    /// any other nonzero status is the code itself.
    pub(crate) fn from_status(status: c_int, diagnostics: &Diagnostics) -> Self {
        if status == SENTINEL_STATUS {
            Self::last(diagnostics)
        } else {
            Self::raise(status, diagnostics)
        }
    }

    pub fn code(&self) -> c_int {
        self.code
    }

    pub fn message(&self) -> &str {
        &self.message
    }
}

/// Check a status-returning foreign call. Negative is failure; otherwise the status is passed through.
pub fn check_status(status: c_int, diagnostics: &Diagnostics) -> Result<c_int> {
    if status < 0 {
        Err(HandleError::Foreign(FailureSignal::from_status(
            status,
            diagnostics,
        )))
    } else {
        Ok(status)
    }
}

/// Check a pointer-returning foreign call. Null is failure.
pub fn check_ptr<T>(ptr: *mut T, diagnostics: &Diagnostics) -> Result<*mut T> {
    if ptr.is_null() {
        Err(HandleError::Foreign(FailureSignal::last(diagnostics)))
    } else {
        Ok(ptr)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::testing::{set_stub_errno, stub_diagnostics};

    #[test]
    fn raise_keeps_code_and_message() {
        let signal = FailureSignal::raise(11, &stub_diagnostics());
        assert_eq!(signal.code(), 11);
        assert_eq!(signal.message(), "stub resource failure");
        assert_eq!(signal.to_string(), "stub resource failure (code 11)");
    }

    #[test]
    fn sentinel_status_reads_errno() {
        set_stub_errno(88);
        let signal = FailureSignal::from_status(SENTINEL_STATUS, &stub_diagnostics());
        assert_eq!(signal.code(), 88);
    }

    #[test]
    fn explicit_status_is_the_code() {
        set_stub_errno(88);
        let signal = FailureSignal::from_status(7, &stub_diagnostics());
        assert_eq!(signal.code(), 7);
    }

    #[test]
    fn check_status_passes_non_negative() {
        assert_eq!(check_status(0, &stub_diagnostics()).unwrap(), 0);
        assert_eq!(check_status(12, &stub_diagnostics()).unwrap(), 12);
    }

    #[test]
    fn check_status_rejects_sentinel() {
        set_stub_errno(9);
        let err = check_status(-1, &stub_diagnostics()).unwrap_err();
        assert_eq!(err.code(), Some(9));
        assert!(matches!(err, HandleError::Foreign(_)));
    }

    #[test]
    fn check_ptr_rejects_null() {
        set_stub_errno(14);
        let err = check_ptr(std::ptr::null_mut::<u8>(), &stub_diagnostics()).unwrap_err();
        assert_eq!(err.code(), Some(14));

        let mut value = 5u8;
        let ptr: *mut u8 = &mut value;
        assert_eq!(check_ptr(ptr, &stub_diagnostics()).unwrap(), ptr);
    }

    #[test]
    fn errno_is_per_thread() {
        set_stub_errno(21);
        let other = std::thread::spawn(|| {
            set_stub_errno(22);
            FailureSignal::last(&stub_diagnostics()).code()
        })
        .join()
        .unwrap();
        assert_eq!(other, 22);
        assert_eq!(FailureSignal::last(&stub_diagnostics()).code(), 21);
    }
}
