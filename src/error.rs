//! Unified error type for scanner initialization and the send path.
//!
//! `ScanError` is the single error type returned by probe-module constructors,
//! scan planning, and the send loop. The CLI layer maps a returned error to
//! process exit; nothing in the core aborts on its own.

/// Scanner-level error.
///
/// Each variant maps to a distinct failure domain; `kind()` returns the
/// variant name for logs and tests.
#[derive(Debug, thiserror::Error)]
pub enum ScanError {
    /// Malformed `--probe-args` (bad question syntax, unknown qtype, empty
    /// domain, unrecognized payload specification).
    #[error("invalid probe args: {0}")]
    ProbeArgs(String),

    /// A payload or frame exceeded a hard size ceiling.
    #[error("payload of {len} bytes exceeds limit of {limit}")]
    PayloadTooLarge { len: usize, limit: usize },

    /// No probe module registered under the requested name.
    #[error("unknown probe module: {0}")]
    UnknownModule(String),

    /// Inconsistent or impossible scan configuration (rate and bandwidth both
    /// set, probe count not a multiple of question count, missing MAC, ...).
    #[error("invalid configuration: {0}")]
    Config(String),

    /// The caller asked for usage/help output (e.g. `template-fields`); the
    /// payload is the text to print before exiting successfully.
    #[error("{0}")]
    Usage(String),

    /// I/O and OS-level errors (payload files, target files).
    #[error(transparent)]
    Io(#[from] std::io::Error),
}

impl ScanError {
    /// Returns the error kind as a string matching the variant name.
    pub fn kind(&self) -> &'static str {
        match self {
            ScanError::ProbeArgs(_) => "ProbeArgs",
            ScanError::PayloadTooLarge { .. } => "PayloadTooLarge",
            ScanError::UnknownModule(_) => "UnknownModule",
            ScanError::Config(_) => "Config",
            ScanError::Usage(_) => "Usage",
            ScanError::Io(_) => "Io",
        }
    }
}

pub type Result<T> = std::result::Result<T, ScanError>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_error_kind_returns_correct_variant_name() {
        assert_eq!(ScanError::ProbeArgs("bad".into()).kind(), "ProbeArgs");
        assert_eq!(
            ScanError::PayloadTooLarge { len: 600, limit: 512 }.kind(),
            "PayloadTooLarge"
        );
        assert_eq!(ScanError::UnknownModule("nope".into()).kind(), "UnknownModule");
        assert_eq!(ScanError::Config("both".into()).kind(), "Config");
    }

    #[test]
    fn test_error_display_shows_message() {
        let err = ScanError::ProbeArgs("empty domain".into());
        assert_eq!(err.to_string(), "invalid probe args: empty domain");

        let err = ScanError::PayloadTooLarge { len: 600, limit: 512 };
        assert_eq!(err.to_string(), "payload of 600 bytes exceeds limit of 512");
    }

    #[test]
    fn test_from_io_error_produces_io_variant() {
        let io_err = std::io::Error::new(std::io::ErrorKind::NotFound, "file missing");
        let err: ScanError = io_err.into();
        assert_eq!(err.kind(), "Io");
        assert!(err.to_string().contains("file missing"));
    }
}
