use thiserror::Error;

use crate::oid::Oid;

/// Error taxonomy shared by the codec, the certificate engine and the
/// envelope pipeline.  Codec errors surface unchanged; the envelope never
/// reinterprets a structural error as a semantic one.
#[derive(Error, Debug, Clone, Copy, PartialEq, Eq)]
pub enum ErrorKind {
    #[error("malformed data")]
    BadData,
    #[error("need more input")]
    Underflow,
    #[error("data too large for target")]
    Overflow,
    #[error("out of memory")]
    NoMemory,
    #[error("unknown algorithm")]
    NoAlgorithm,
    #[error("unknown or unsupported mode")]
    NoMode,
    #[error("wrong key for this data")]
    WrongKey,
    #[error("signature verification failed")]
    BadSignature,
    #[error("provider state lost")]
    Signalled,
    #[error("item not found")]
    DataNotFound,
    #[error("item already present")]
    DataDuplicate,
    #[error("certificate constraint violated")]
    InvalidConstraint,
    #[error("caller must supply a resource")]
    ResourceRequired,
    #[error("already initialised")]
    AlreadyInited,
    #[error("not initialised")]
    NotInitialized,
    #[error("operation incomplete after earlier failure")]
    IncompleteOperation,
    #[error("operation not allowed")]
    NotAllowed,
}

/// Where a constraint or verification failure was detected: which cert in
/// the chain, which attribute, and an optional provider detail code kept
/// verbatim for diagnostics.
#[derive(Debug, Clone, PartialEq, Eq, Default)]
pub struct ErrorLocus {
    pub cert_index: Option<usize>,
    pub attribute: Option<Oid>,
    pub detail: Option<i64>,
}

#[derive(Error, Debug, Clone, PartialEq, Eq)]
#[error("{kind}")]
pub struct Error {
    pub kind: ErrorKind,
    pub locus: Option<ErrorLocus>,
}

impl Error {
    pub fn new(kind: ErrorKind) -> Self {
        Error { kind, locus: None }
    }

    pub fn with_locus(kind: ErrorKind, locus: ErrorLocus) -> Self {
        Error { kind, locus: Some(locus) }
    }

    pub fn kind(&self) -> ErrorKind {
        self.kind
    }
}

impl From<ErrorKind> for Error {
    fn from(kind: ErrorKind) -> Self {
        Error::new(kind)
    }
}

pub type Result<T> = std::result::Result<T, Error>;

/// Shorthand used throughout the crate.
pub(crate) fn err<T>(kind: ErrorKind) -> Result<T> {
    Err(Error::new(kind))
}
