//! Error types for tagmsg.

use std::fmt;

/// Error type for messaging operations.
///
/// `Again` doubles as the try-later control-flow value: an event handler
/// returning it has its event re-presented by the demultiplexer, and a
/// posting path returning it asks the caller to progress and retry.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Error {
    /// Resources are temporarily unavailable; retry after progress.
    Again,
    /// No matching unexpected message was found.
    NoMsg,
    /// The operation already completed through the software match path.
    Already,
    /// A multi-receive buffer matched and still has room for more matches.
    InProgress,
    /// The endpoint is in the wrong state for this operation.
    BadState,
    /// Message length exceeds a provider limit.
    MsgSize { len: usize, max: usize },
    /// Tag or ignore mask has bits outside the provider tag mask.
    InvalidTag { tag: u64, mask: u64 },
    /// Invalid argument combination.
    InvalidArg(&'static str),
    /// Invalid configuration.
    InvalidConfig(String),
    /// The source address could not be resolved.
    AddrNotAvail,
}

impl fmt::Display for Error {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Error::Again => write!(f, "Resource temporarily unavailable"),
            Error::NoMsg => write!(f, "No matching message found"),
            Error::Already => write!(f, "Operation already completed"),
            Error::InProgress => write!(f, "Multi-receive buffer still matching"),
            Error::BadState => write!(f, "Endpoint in wrong state"),
            Error::MsgSize { len, max } => {
                write!(f, "Message too large: {} bytes, max {} bytes", len, max)
            }
            Error::InvalidTag { tag, mask } => {
                write!(f, "Tag {:#018x} outside tag mask {:#018x}", tag, mask)
            }
            Error::InvalidArg(msg) => write!(f, "Invalid argument: {}", msg),
            Error::InvalidConfig(msg) => write!(f, "Invalid configuration: {}", msg),
            Error::AddrNotAvail => write!(f, "Source address not available"),
        }
    }
}

impl std::error::Error for Error {}

/// Result type for messaging operations.
pub type Result<T> = std::result::Result<T, Error>;

/// Log and abort on an unrecoverable protocol violation.
///
/// Continuing after an unexpected event or state-machine violation risks
/// silent data loss, so the process is taken down with a descriptive reason.
macro_rules! fatal {
    ($($arg:tt)*) => {{
        log::error!($($arg)*);
        panic!($($arg)*);
    }};
}

pub(crate) use fatal;
