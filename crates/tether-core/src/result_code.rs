//! RPC result codes.

use core::fmt;

/// Closed set of RPC outcomes.
///
/// Every RPC completes with exactly one of these codes; failures are carried
/// as completions rather than raised errors, so callers branch on the code
/// uniformly regardless of whether the failure was local or remote.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
#[repr(u8)]
pub enum ResultCode {
    /// The call succeeded and the body (if any) is the remote result.
    Success = 0,
    /// The session was closed before a response was produced.
    SessionClosed = 1,
    /// The call was cancelled locally.
    Cancelled = 2,
    /// No response arrived before the call's deadline.
    Timeout = 3,
    /// A local error occurred while building or dispatching the request.
    LocalException = 4,
    /// The remote side refused the call.
    Forbid = 5,
    /// The remote side could not understand the request.
    BadRequest = 6,
    /// The remote side failed while executing the call.
    Error = 7,
    /// The remote side could not hand the request to its application thread.
    CommitFailed = 8,
    /// The target session does not exist.
    SessionNull = 9,
}

impl ResultCode {
    pub fn from_u8(value: u8) -> Option<Self> {
        match value {
            0 => Some(Self::Success),
            1 => Some(Self::SessionClosed),
            2 => Some(Self::Cancelled),
            3 => Some(Self::Timeout),
            4 => Some(Self::LocalException),
            5 => Some(Self::Forbid),
            6 => Some(Self::BadRequest),
            7 => Some(Self::Error),
            8 => Some(Self::CommitFailed),
            9 => Some(Self::SessionNull),
            _ => None,
        }
    }

    /// True for [`ResultCode::Success`] only.
    pub fn is_success(self) -> bool {
        matches!(self, Self::Success)
    }
}

impl fmt::Display for ResultCode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Success => write!(f, "success"),
            Self::SessionClosed => write!(f, "session closed"),
            Self::Cancelled => write!(f, "cancelled"),
            Self::Timeout => write!(f, "timeout"),
            Self::LocalException => write!(f, "local exception"),
            Self::Forbid => write!(f, "forbidden"),
            Self::BadRequest => write!(f, "bad request"),
            Self::Error => write!(f, "remote error"),
            Self::CommitFailed => write!(f, "commit failed"),
            Self::SessionNull => write!(f, "session does not exist"),
        }
    }
}
