use thiserror::Error;

/// Stable status codes visible at the API boundary.
///
/// Every [`Error`] maps onto one of these via [`Error::code`]; FFI shims and
/// the CLI report them instead of the rich error value.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ErrorCode {
    Ok,
    Unspecified,
    NotImplemented,
    InvalidParams,
    CryptoError,
    HashMismatch,
    IoError,
    InputStreamError,
    OutputStreamError,
    WorkflowError,
    EndOfStream,
    NotSupported,
}

#[derive(Debug, Error)]
pub enum Error {
    /// Container bytes do not parse: bad magic, truncated header, failed
    /// FlatBuffer verification, malformed XML.
    #[error("invalid container format: {0}")]
    Format(String),

    /// The input is neither a CDoc2 container nor XML-Enc.
    #[error("unrecognized file format")]
    UnknownFormat,

    #[error("cryptographic failure: {0}")]
    Crypto(String),

    /// Header HMAC did not verify against the candidate FMK.
    #[error("container hash mismatch")]
    HashMismatch,

    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    #[error("input stream error: {0}")]
    InputStream(String),

    #[error("output stream error: {0}")]
    OutputStream(String),

    /// Operation called outside the legal state machine order. The object
    /// stays usable.
    #[error("operation out of order: {0}")]
    Workflow(&'static str),

    #[error("end of stream")]
    EndOfStream,

    #[error("invalid parameters: {0}")]
    InvalidParams(String),

    #[error("not implemented: {0}")]
    NotImplemented(&'static str),

    #[error("not supported: {0}")]
    NotSupported(String),

    #[error("backend error: {0}")]
    Backend(String),

    #[error("{0}")]
    Unspecified(String),
}

impl Error {
    pub fn code(&self) -> ErrorCode {
        match self {
            Error::Format(_) | Error::InvalidParams(_) => ErrorCode::InvalidParams,
            Error::UnknownFormat | Error::NotSupported(_) => ErrorCode::NotSupported,
            Error::Crypto(_) => ErrorCode::CryptoError,
            Error::HashMismatch => ErrorCode::HashMismatch,
            Error::Io(_) => ErrorCode::IoError,
            Error::InputStream(_) => ErrorCode::InputStreamError,
            Error::OutputStream(_) => ErrorCode::OutputStreamError,
            Error::Workflow(_) => ErrorCode::WorkflowError,
            Error::EndOfStream => ErrorCode::EndOfStream,
            Error::NotImplemented(_) => ErrorCode::NotImplemented,
            Error::Backend(_) | Error::Unspecified(_) => ErrorCode::Unspecified,
        }
    }

    pub(crate) fn format(msg: impl Into<String>) -> Self {
        Error::Format(msg.into())
    }

    pub(crate) fn crypto(msg: impl Into<String>) -> Self {
        Error::Crypto(msg.into())
    }

    pub(crate) fn invalid(msg: impl Into<String>) -> Self {
        Error::InvalidParams(msg.into())
    }
}

impl From<quick_xml::Error> for Error {
    fn from(e: quick_xml::Error) -> Self {
        Error::Format(format!("malformed XML: {e}"))
    }
}

pub type Result<T> = std::result::Result<T, Error>;
