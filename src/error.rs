//! Error types observable at the crate boundary.
//!
//! Two families, per the design: "system" errors map to a stable POSIX
//! code, "transport" errors (RPC) wrap a cause. Both carry an advisory
//! message and optional path/syscall context for diagnostics.

use std::fmt;

/// POSIX-style error codes observable at the boundary (spec.md §6).
#[derive(Debug, Copy, Clone, PartialEq, Eq, Hash)]
pub enum ErrorCode {
    EAcces,
    EAgain,
    EBadE,
    EBusy,
    EDeadlk,
    EExist,
    EInval,
    EIo,
    EIsDir,
    ENoData,
    ENoEnt,
    ENoSpc,
    ENotDir,
    ENotEmpty,
    ENotSup,
    EOverflow,
    EPerm,
    EProtoNoSupport,
    ERemoteIo,
    ERoFs,
    ETimedOut,
}

impl ErrorCode {
    /// The conventional uppercase errno name, as used in messages.
    pub fn name(self) -> &'static str {
        match self {
            ErrorCode::EAcces => "EACCES",
            ErrorCode::EAgain => "EAGAIN",
            ErrorCode::EBadE => "EBADE",
            ErrorCode::EBusy => "EBUSY",
            ErrorCode::EDeadlk => "EDEADLK",
            ErrorCode::EExist => "EEXIST",
            ErrorCode::EInval => "EINVAL",
            ErrorCode::EIo => "EIO",
            ErrorCode::EIsDir => "EISDIR",
            ErrorCode::ENoData => "ENODATA",
            ErrorCode::ENoEnt => "ENOENT",
            ErrorCode::ENoSpc => "ENOSPC",
            ErrorCode::ENotDir => "ENOTDIR",
            ErrorCode::ENotEmpty => "ENOTEMPTY",
            ErrorCode::ENotSup => "ENOTSUP",
            ErrorCode::EOverflow => "EOVERFLOW",
            ErrorCode::EPerm => "EPERM",
            ErrorCode::EProtoNoSupport => "EPROTONOSUPPORT",
            ErrorCode::ERemoteIo => "EREMOTEIO",
            ErrorCode::ERoFs => "EROFS",
            ErrorCode::ETimedOut => "ETIMEDOUT",
        }
    }

    /// The numeric errno value, for callers that want to cross an FFI boundary.
    pub fn errno(self) -> i32 {
        match self {
            ErrorCode::EPerm => 1,
            ErrorCode::ENoEnt => 2,
            ErrorCode::EIo => 5,
            ErrorCode::EAgain => 11,
            ErrorCode::EAcces => 13,
            ErrorCode::EExist => 17,
            ErrorCode::ENotDir => 20,
            ErrorCode::EIsDir => 21,
            ErrorCode::EInval => 22,
            ErrorCode::ENoSpc => 28,
            ErrorCode::ERoFs => 30,
            ErrorCode::ENotEmpty => 39,
            ErrorCode::ENotSup => 95,
            ErrorCode::ENoData => 61,
            ErrorCode::EOverflow => 75,
            ErrorCode::EBusy => 16,
            ErrorCode::EDeadlk => 35,
            ErrorCode::EBadE => 52,
            ErrorCode::ETimedOut => 110,
            ErrorCode::ERemoteIo => 121,
            ErrorCode::EProtoNoSupport => 93,
        }
    }
}

/// Error raised by any ZenFS core operation.
#[derive(Debug, thiserror::Error)]
pub enum ZenFsError {
    /// A system error with a stable POSIX code.
    #[error("{code}: {message}{}", path.as_deref().map(|p| format!(" ({p})")).unwrap_or_default())]
    System { code: ErrorCode, message: String, path: Option<String>, syscall: Option<&'static str> },

    /// A transport-level (RPC) error wrapping a cause.
    #[error("transport error: {message}")]
    Transport { message: String, source: Option<Box<dyn std::error::Error + Send + Sync>> },
}

impl ZenFsError {
    pub fn new(code: ErrorCode, message: impl Into<String>) -> Self {
        ZenFsError::System { code, message: message.into(), path: None, syscall: None }
    }

    pub fn with_path(mut self, path: impl Into<String>) -> Self {
        if let ZenFsError::System { path: p, .. } = &mut self {
            *p = Some(path.into());
        }
        self
    }

    pub fn with_syscall(mut self, syscall: &'static str) -> Self {
        if let ZenFsError::System { syscall: s, .. } = &mut self {
            *s = Some(syscall);
        }
        self
    }

    pub fn transport(message: impl Into<String>) -> Self {
        ZenFsError::Transport { message: message.into(), source: None }
    }

    pub fn transport_with_source(
        message: impl Into<String>,
        source: impl std::error::Error + Send + Sync + 'static,
    ) -> Self {
        ZenFsError::Transport { message: message.into(), source: Some(Box::new(source)) }
    }

    /// The POSIX code for this error, when it belongs to the "system" family.
    pub fn code(&self) -> Option<ErrorCode> {
        match self {
            ZenFsError::System { code, .. } => Some(*code),
            ZenFsError::Transport { .. } => None,
        }
    }
}

/// Shorthand constructors for the common codes, mirroring the teacher's
/// habit of small free-function error builders.
macro_rules! code_ctor {
    ($name:ident, $code:ident) => {
        pub fn $name(message: impl Into<String>) -> ZenFsError {
            ZenFsError::new(ErrorCode::$code, message)
        }
    };
}

code_ctor!(eacces, EAcces);
code_ctor!(eagain, EAgain);
code_ctor!(ebade, EBadE);
code_ctor!(ebusy, EBusy);
code_ctor!(edeadlk, EDeadlk);
code_ctor!(eexist, EExist);
code_ctor!(einval, EInval);
code_ctor!(eio, EIo);
code_ctor!(eisdir, EIsDir);
code_ctor!(enodata, ENoData);
code_ctor!(enoent, ENoEnt);
code_ctor!(enospc, ENoSpc);
code_ctor!(enotdir, ENotDir);
code_ctor!(enotempty, ENotEmpty);
code_ctor!(enotsup, ENotSup);
code_ctor!(eoverflow, EOverflow);
code_ctor!(eperm, EPerm);
code_ctor!(eprotonosupport, EProtoNoSupport);
code_ctor!(eremoteio, ERemoteIo);
code_ctor!(erofs, ERoFs);
code_ctor!(etimedout, ETimedOut);

impl fmt::Display for ErrorCode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.name())
    }
}

/// Convenient result alias used throughout the crate.
pub type Result<T> = std::result::Result<T, ZenFsError>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn display_includes_code_and_path() {
        let err = enoent("no such file").with_path("/a/b");
        let rendered = err.to_string();
        assert!(rendered.contains("ENOENT"));
        assert!(rendered.contains("/a/b"));
    }

    #[test]
    fn transport_error_is_distinct_family() {
        let err = ZenFsError::transport("timed out waiting for reply");
        assert_eq!(err.code(), None);
    }
}
