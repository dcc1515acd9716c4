//! Foreign entry points the core calls through: release, error number, error text, buffer free.
//! The binding fills these in from the native library; `testing` provides stubs.

use std::ffi::{c_void, CStr};
use std::os::raw::{c_char, c_int};

use crate::config::{Config, TeardownPolicy};
use crate::failure::FailureSignal;

/// Opaque foreign resource (context, socket, message).
pub type RawHandle = *mut c_void;

/// Destroys a foreign resource. Returns 0 on success, nonzero on failure.
pub type ReleaseFn = unsafe extern "C" fn(RawHandle) -> c_int;

/// Reads the foreign library's last error number for the calling thread.
pub type ErrnoFn = unsafe extern "C" fn() -> c_int;

/// Describes a foreign error number. Returns a NUL-terminated string, or null if unknown.
pub type DiagnosticFn = unsafe extern "C" fn(c_int) -> *const c_char;

/// Called by the foreign system when it is done with an adopted buffer: (data, hint).
pub type BufferFreeFn = unsafe extern "C" fn(*mut c_void, *mut c_void);

/// Status returned by foreign calls that report the real cause through their error number.
pub const SENTINEL_STATUS: c_int = -1;

/// Foreign error lookup. Both entries are optional; missing ones fall back to the OS.
#[derive(Debug, Clone, Copy, Default)]
pub struct Diagnostics {
    errno: Option<ErrnoFn>,
    describe: Option<DiagnosticFn>,
}

impl Diagnostics {
    /// No foreign lookup: error numbers come from the OS `errno`, text from the OS description.
    pub const fn none() -> Self {
        Self {
            errno: None,
            describe: None,
        }
    }

    /// # Safety
    /// `errno` and `describe` must be callable from any thread at any time.
    pub const unsafe fn new(errno: ErrnoFn, describe: DiagnosticFn) -> Self {
        Self {
            errno: Some(errno),
            describe: Some(describe),
        }
    }

    /// Last error number on the calling thread. Must be read before anything else can clobber it.
    pub fn last_errno(&self) -> c_int {
        match self.errno {
            Some(f) => unsafe { f() },
            None => std::io::Error::last_os_error().raw_os_error().unwrap_or(0),
        }
    }

    /// Text for `code`.
    pub fn describe(&self, code: c_int) -> String {
        if let Some(f) = self.describe {
            let text = unsafe { f(code) };
            if !text.is_null() {
                return unsafe { CStr::from_ptr(text) }
                    .to_string_lossy()
                    .into_owned();
            }
        }
        std::io::Error::from_raw_os_error(code).to_string()
    }
}

/// Release function plus everything needed to report and police its failures.
/// Copied into every handle that owns a resource.
#[derive(Debug, Clone, Copy)]
pub struct Releaser {
    release: ReleaseFn,
    diagnostics: Diagnostics,
    teardown: TeardownPolicy,
}

impl Releaser {
    /// # Safety
    /// `release` must accept any handle later passed to `ForeignHandle::acquire` or
    /// `SharedHandle::new` with this releaser, from any thread.
    pub unsafe fn new(release: ReleaseFn) -> Self {
        Self {
            release,
            diagnostics: Diagnostics::none(),
            teardown: TeardownPolicy::default(),
        }
    }

    pub fn with_diagnostics(mut self, diagnostics: Diagnostics) -> Self {
        self.diagnostics = diagnostics;
        self
    }

    pub fn with_teardown(mut self, teardown: TeardownPolicy) -> Self {
        self.teardown = teardown;
        self
    }

    /// Apply the loaded configuration (currently the teardown policy).
    pub fn with_config(self, config: &Config) -> Self {
        self.with_teardown(config.teardown)
    }

    pub fn diagnostics(&self) -> &Diagnostics {
        &self.diagnostics
    }

    pub fn teardown(&self) -> TeardownPolicy {
        self.teardown
    }

    /// Call the release function once. Nonzero status is captured on the spot.
    ///
    /// # Safety
    /// `raw` must be live and must not be used or released again afterwards.
    pub(crate) unsafe fn release(&self, raw: RawHandle) -> Result<(), FailureSignal> {
        let status = (self.release)(raw);
        if status == 0 {
            Ok(())
        } else {
            Err(FailureSignal::from_status(status, &self.diagnostics))
        }
    }

    /// Teardown path: release and swallow the failure. Never propagates.
    ///
    /// # Safety
    /// Same as [`Releaser::release`].
    pub(crate) unsafe fn release_quietly(&self, raw: RawHandle) {
        if let Err(signal) = self.release(raw) {
            log::warn!("teardown release of {:p} failed: {}", raw, signal);
            debug_assert!(
                self.teardown != TeardownPolicy::Assert,
                "teardown release of {:p} failed: {}",
                raw,
                signal
            );
        }
    }
}
