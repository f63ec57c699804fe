//! Error types used by the shim
//! This handles classifying failures into the codes the task API reports

use std::path::Path;

use anyhow::Error as AnyError;
use containerd_shim::Error as ShimError;
use containerd_shim::protos::protobuf;
use oci_spec::OciSpecError;
use thiserror::Error;

#[derive(Debug, Error)]
pub enum Error {
    /// An error occurred while parsing the OCI spec
    #[error("{0}")]
    Oci(#[from] OciSpecError),
    /// A filesystem operation failed
    #[error("{context}: {source}")]
    Io {
        context: String,
        #[source]
        source: std::io::Error,
    },
    /// Requested item is not found
    #[error("not found: {0}")]
    NotFound(String),
    /// Requested item already exists
    #[error("already exists: {0}")]
    AlreadyExists(String),
    /// Supplied arguments/options/config is invalid
    #[error("invalid argument: {0}")]
    InvalidArgument(String),
    /// The operation was rejected because the process is not in a state required for the operation
    #[error("{0}")]
    FailedPrecondition(String),
    /// systemd did not report the unit as started and no pid could be recovered
    #[error("error starting systemd unit: {0}")]
    UnitStart(String),
    /// The caller cancelled the request while it was in flight
    #[error("operation cancelled")]
    Cancelled,
    /// Error while parsing JSON
    #[error("{0}")]
    Json(#[from] serde_json::Error),
    /// Error while encoding or decoding a containerd message
    #[error("{0}")]
    Protobuf(#[from] protobuf::Error),
    /// Errors to/from the containerd shim library.
    #[error("{0}")]
    Shim(#[from] ShimError),
    /// Errors reported by systemd over D-Bus
    #[error("systemd: {0}")]
    Systemd(String),
    /// Errors reported by the runc binary
    #[error("runc: {0}")]
    Runtime(String),
    #[error("{0}")]
    Internal(String),
    /// Any other error
    #[error("{0}")]
    Any(#[from] AnyError),
    /// An error tagged with the task operation it came from
    #[error("{op}: {source}")]
    Operation {
        op: &'static str,
        #[source]
        source: Box<Error>,
    },
}

pub type Result<T, E = Error> = ::std::result::Result<T, E>;

/// Transport-neutral classification of an [`Error`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Code {
    NotFound,
    AlreadyExists,
    InvalidArgument,
    FailedPrecondition,
    Cancelled,
    Internal,
    Unknown,
}

impl Error {
    pub fn code(&self) -> Code {
        match self {
            Error::NotFound(_) => Code::NotFound,
            Error::AlreadyExists(_) => Code::AlreadyExists,
            Error::InvalidArgument(_) | Error::Oci(_) | Error::Protobuf(_) => Code::InvalidArgument,
            Error::Shim(ShimError::InvalidArgument(_)) => Code::InvalidArgument,
            Error::Shim(ShimError::NotFoundError(_)) => Code::NotFound,
            Error::FailedPrecondition(_) => Code::FailedPrecondition,
            Error::Cancelled => Code::Cancelled,
            Error::Json(_) | Error::Internal(_) => Code::Internal,
            Error::Operation { source, .. } => source.code(),
            _ => Code::Unknown,
        }
    }

    /// Tags the error with the task operation that produced it.
    /// Tagging an already tagged error keeps the innermost tag only once.
    pub fn in_operation(self, op: &'static str) -> Self {
        match self {
            Error::Operation { op: inner, .. } if inner == op => self,
            source => Error::Operation {
                op,
                source: Box::new(source),
            },
        }
    }

    /// Returns the untagged error.
    pub fn root(&self) -> &Error {
        match self {
            Error::Operation { source, .. } => source.root(),
            e => e,
        }
    }
}

/// Attach an operation and a path to a raw `std::io::Error`.
pub trait IoContext<T> {
    fn with_path(self, what: &str, path: impl AsRef<Path>) -> Result<T>;
}

impl<T> IoContext<T> for std::io::Result<T> {
    fn with_path(self, what: &str, path: impl AsRef<Path>) -> Result<T> {
        self.map_err(|source| Error::Io {
            context: format!("{what} {}", path.as_ref().display()),
            source,
        })
    }
}

#[cfg(test)]
mod tests {
    use std::io::ErrorKind;

    use thiserror::Error;

    use super::*;

    #[derive(Debug, Error)]
    enum TestError {
        #[error("{0}")]
        AnError(String),
    }

    #[test]
    fn test_error_codes() {
        let e = Error::InvalidArgument("invalid argument".to_string());
        assert_eq!(e.code(), Code::InvalidArgument);

        let e = Error::NotFound("not found".to_string());
        assert_eq!(e.code(), Code::NotFound);

        let e = Error::AlreadyExists("already exists".to_string());
        assert_eq!(e.code(), Code::AlreadyExists);

        let e = Error::FailedPrecondition("failed precondition".to_string());
        assert_eq!(e.code(), Code::FailedPrecondition);

        assert_eq!(Error::Cancelled.code(), Code::Cancelled);

        let e = Error::Shim(ShimError::NotFoundError("c1".to_string()));
        assert_eq!(e.code(), Code::NotFound);

        let e = Error::Any(AnyError::new(TestError::AnError("any error".to_string())));
        assert_eq!(e.code(), Code::Unknown);
        assert_eq!(e.to_string(), "any error");
    }

    #[test]
    fn test_operation_tag_keeps_code() {
        let e = Error::NotFound("c1".to_string()).in_operation("exec");
        assert_eq!(e.code(), Code::NotFound);
        assert_eq!(e.to_string(), "exec: not found: c1");
        assert!(matches!(e.root(), Error::NotFound(_)));

        let e = e.in_operation("exec");
        assert_eq!(e.to_string(), "exec: not found: c1");
    }

    #[test]
    fn test_io_context() {
        let res: std::io::Result<()> = Err(std::io::Error::from(ErrorKind::NotFound));
        let err = res.with_path("error reading spec", "/b1/config.json").unwrap_err();
        assert!(err.to_string().starts_with("error reading spec /b1/config.json: "));
        assert_eq!(err.code(), Code::Unknown);
    }
}
