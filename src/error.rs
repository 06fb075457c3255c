use strum::{Display, EnumIter};
use thiserror::Error;

use crate::metadata::token::Token;

macro_rules! malformed_error {
    // Single string version
    ($msg:expr) => {
        crate::Error::Malformed {
            message: $msg.to_string(),
            file: file!(),
            line: line!(),
        }
    };

    // Format string with arguments version
    ($fmt:expr, $($arg:tt)*) => {
        crate::Error::Malformed {
            message: format!($fmt, $($arg)*),
            file: file!(),
            line: line!(),
        }
    };
}

/// The generic Error type, which provides coverage for all errors this library can potentially
/// return.
///
/// Errors fall into three families that mirror the stages of a redirection pass. Every
/// variant of the lookup and patch families can be classified with [`Error::lookup_kind`]
/// and [`Error::patch_kind`], which is how the orchestrator reports them per declaration.
///
/// # Error Categories
///
/// ## Declaration Errors
/// - [`Error::InvalidArgument`] - Malformed redirect declaration
///
/// ## Resolution Errors
/// - [`Error::NotFound`] - No method on the source type matches the declaration
/// - [`Error::AmbiguousMatch`] - More than one method matches the declaration
///
/// ## Patch Errors
/// - [`Error::AlreadyPatched`] - The source method already carries an active redirection
/// - [`Error::WritePermissionDenied`] - The entry point could not be made writable
/// - [`Error::InsufficientEntrySpace`] - The jump does not fit and no dispatch slot exists
/// - [`Error::NotYetCompiled`] - The host could not materialize the method's code
/// - [`Error::RedirectCycle`] - Installing the redirection would close a cycle
/// - [`Error::VerificationFailed`] - The written bytes did not read back as expected
/// - [`Error::UnalignedEntry`] - The entry cannot be rewritten without exposing a torn jump
/// - [`Error::ForeignPatch`] - A record is reverted through a platform that did not install it
///
/// ## Platform Errors
/// - [`Error::InvalidAddress`] - Access outside of known code or slot ranges
/// - [`Error::OsError`] - Operating system call failure (e.g. `mprotect`)
/// - [`Error::NotSupported`] - The platform or architecture is not supported
/// - [`Error::RecursionLimit`] - Too many chained jumps while executing emulated code
/// - [`Error::LockError`] - A lock guarding shared state was poisoned
///
/// # Examples
///
/// ```rust
/// use redirection::{Error, RedirectDeclaration};
///
/// match RedirectDeclaration::builder().build() {
///     Err(Error::InvalidArgument(message)) => eprintln!("bad declaration: {message}"),
///     Err(e) => eprintln!("other error: {e}"),
///     Ok(_) => unreachable!(),
/// }
/// ```
#[derive(Error, Debug)]
pub enum Error {
    /// A redirect declaration was constructed with invalid arguments.
    ///
    /// Raised at construction time, when the source type is missing or null, or when an
    /// explicit method name is empty.
    #[error("Invalid argument - {0}")]
    InvalidArgument(String),

    /// No method on the source type matches the declaration.
    ///
    /// # Fields
    ///
    /// * `type_name` - Full name of the searched type
    /// * `method_name` - The (explicit or inferred) method name
    /// * `shape` - Human readable description of the expected shape
    #[error("No method '{method_name}' on '{type_name}' matches shape {shape}")]
    NotFound {
        /// Full name of the searched type
        type_name: String,
        /// The method name that was searched for
        method_name: String,
        /// The expected shape, rendered for diagnostics
        shape: String,
    },

    /// More than one method on the source type matches the declaration.
    ///
    /// The resolver never picks one of several candidates, since patching the wrong
    /// method corrupts the host.
    #[error("{candidates} methods named '{method_name}' on '{type_name}' match the declaration")]
    AmbiguousMatch {
        /// Full name of the searched type
        type_name: String,
        /// The method name that was searched for
        method_name: String,
        /// Number of shape-compatible candidates
        candidates: usize,
    },

    /// The source method already carries an active redirection.
    #[error("Method {0} is already redirected")]
    AlreadyPatched(Token),

    /// The memory at `address` could not be made writable.
    #[error("Write permission denied at 0x{address:x} - {reason}")]
    WritePermissionDenied {
        /// The address that was to be written
        address: u64,
        /// Why the write was refused
        reason: String,
    },

    /// The redirection does not fit into the method's entry and no dispatch slot is
    /// available as a fallback.
    #[error("Entry of method {method} has {available} bytes, redirection needs {needed}")]
    InsufficientEntrySpace {
        /// The method whose entry is too small
        method: Token,
        /// Bytes required by the jump stub
        needed: usize,
        /// Bytes available at the entry
        available: usize,
    },

    /// The host runtime could not compile or materialize the method.
    #[error("Method {0} is not compiled and could not be materialized")]
    NotYetCompiled(Token),

    /// Installing the redirection would create a cycle of redirections.
    #[error("Redirecting {source_method} to {target} would create a cycle")]
    RedirectCycle {
        /// The method whose entry would be rewritten
        source_method: Token,
        /// The method control would be transferred to
        target: Token,
    },

    /// Bytes read back after a write did not match what was written.
    #[error("Verification of write at 0x{address:x} failed")]
    VerificationFailed {
        /// Start of the verified range
        address: u64,
    },

    /// A multi-word jump would have to be written at an entry whose first word cannot
    /// hold the spin instruction, so concurrent callers could run half of it.
    #[error("Entry at 0x{address:x} cannot take a {len}-byte patch without tearing")]
    UnalignedEntry {
        /// The entry address
        address: u64,
        /// Length of the patch
        len: usize,
    },

    /// A patch record belongs to a different host than the platform asked to revert it.
    #[error("Patch of method {0} was installed on a different host")]
    ForeignPatch(Token),

    /// An access touched memory the platform does not manage.
    #[error("Invalid address 0x{address:x} - {reason}")]
    InvalidAddress {
        /// The offending address
        address: u64,
        /// Why the access was rejected
        reason: String,
    },

    /// Internal invariant was violated.
    ///
    /// Carries the source location where the problem was detected.
    #[error("Malformed - {file}:{line}: {message}")]
    Malformed {
        /// The message to be printed for the Malformed error
        message: String,
        /// The source file in which this error occured
        file: &'static str,
        /// The source line in which this error occured
        line: u32,
    },

    /// Operating system error, e.g. from `mprotect`.
    #[error("{0}")]
    OsError(#[from] std::io::Error),

    /// The requested operation is not supported on this platform or architecture.
    #[error("Not supported - {0}")]
    NotSupported(String),

    /// Recursion limit reached.
    ///
    /// Raised by the emulated executor when following more chained jumps than allowed.
    #[error("Reach the maximum recursion level allowed - {0}")]
    RecursionLimit(usize),

    /// Failed to lock target.
    ///
    /// A mutex or rwlock guarding shared state was poisoned by a panicking thread.
    #[error("Failed to lock target")]
    LockError,

    /// Generic error for miscellaneous failures.
    #[error("{0}")]
    Error(String),
}

/// Kinds of method lookup failures, as reported per declaration.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Display, EnumIter)]
pub enum LookupErrorKind {
    /// No candidate matched.
    NotFound,
    /// More than one candidate matched.
    AmbiguousMatch,
}

/// Kinds of patch failures, as reported per declaration.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Display, EnumIter)]
pub enum PatchErrorKind {
    /// The source method was already redirected.
    AlreadyPatched,
    /// The entry point could not be written.
    WritePermissionDenied,
    /// The redirection did not fit the entry point.
    InsufficientEntrySpace,
    /// The method could not be compiled.
    NotYetCompiled,
    /// The redirection would close a cycle.
    RedirectCycle,
    /// The write could not be verified.
    VerificationFailed,
    /// The entry could not be rewritten tear-free.
    UnalignedEntry,
    /// Any other platform failure.
    Other,
}

impl Error {
    /// Classifies this error as a lookup failure, if it is one.
    #[must_use]
    pub fn lookup_kind(&self) -> Option<LookupErrorKind> {
        match self {
            Error::NotFound { .. } => Some(LookupErrorKind::NotFound),
            Error::AmbiguousMatch { .. } => Some(LookupErrorKind::AmbiguousMatch),
            _ => None,
        }
    }

    /// Classifies this error as a patch failure.
    ///
    /// Returns `None` for lookup and declaration errors; every other error maps to a
    /// patch kind, with platform failures collapsing into [`PatchErrorKind::Other`].
    #[must_use]
    pub fn patch_kind(&self) -> Option<PatchErrorKind> {
        match self {
            Error::NotFound { .. } | Error::AmbiguousMatch { .. } | Error::InvalidArgument(_) => {
                None
            }
            Error::AlreadyPatched(_) => Some(PatchErrorKind::AlreadyPatched),
            Error::WritePermissionDenied { .. } => Some(PatchErrorKind::WritePermissionDenied),
            Error::InsufficientEntrySpace { .. } => Some(PatchErrorKind::InsufficientEntrySpace),
            Error::NotYetCompiled(_) => Some(PatchErrorKind::NotYetCompiled),
            Error::RedirectCycle { .. } => Some(PatchErrorKind::RedirectCycle),
            Error::VerificationFailed { .. } => Some(PatchErrorKind::VerificationFailed),
            Error::UnalignedEntry { .. } => Some(PatchErrorKind::UnalignedEntry),
            _ => Some(PatchErrorKind::Other),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use strum::IntoEnumIterator;

    #[test]
    fn test_lookup_classification() {
        let err = Error::NotFound {
            type_name: "Game.Citizen".to_string(),
            method_name: "Update".to_string(),
            shape: "(i4) -> void".to_string(),
        };
        assert_eq!(err.lookup_kind(), Some(LookupErrorKind::NotFound));
        assert_eq!(err.patch_kind(), None);

        let err = Error::AmbiguousMatch {
            type_name: "Game.Citizen".to_string(),
            method_name: "Update".to_string(),
            candidates: 2,
        };
        assert_eq!(err.lookup_kind(), Some(LookupErrorKind::AmbiguousMatch));
        assert!(err.to_string().contains("2 methods"));
    }

    #[test]
    fn test_patch_classification() {
        let token = Token::new(0x06000001);
        assert_eq!(
            Error::AlreadyPatched(token).patch_kind(),
            Some(PatchErrorKind::AlreadyPatched)
        );
        assert_eq!(
            Error::NotYetCompiled(token).patch_kind(),
            Some(PatchErrorKind::NotYetCompiled)
        );
        assert_eq!(
            Error::UnalignedEntry { address: 0x1007, len: 5 }.patch_kind(),
            Some(PatchErrorKind::UnalignedEntry)
        );
        assert_eq!(Error::ForeignPatch(token).patch_kind(), Some(PatchErrorKind::Other));
        assert_eq!(Error::LockError.patch_kind(), Some(PatchErrorKind::Other));
        assert_eq!(
            Error::InvalidArgument("x".to_string()).patch_kind(),
            None
        );
    }

    #[test]
    fn test_kind_display() {
        let names: Vec<String> = PatchErrorKind::iter().map(|k| k.to_string()).collect();
        assert!(names.contains(&"WritePermissionDenied".to_string()));
        assert_eq!(LookupErrorKind::iter().count(), 2);
    }

    #[test]
    fn test_malformed_macro() {
        let err = malformed_error!("bad plan at {}", 3);
        match err {
            Error::Malformed { message, line, .. } => {
                assert_eq!(message, "bad plan at 3");
                assert!(line > 0);
            }
            _ => panic!("expected malformed error"),
        }
    }
}
