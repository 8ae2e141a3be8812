//! The RPC response envelope.

use bytes::Bytes;

use crate::ResultCode;

/// Immutable `(result code, optional body)` pair produced for every RPC call.
///
/// Local failures are folded into an envelope carrying
/// [`ResultCode::LocalException`] instead of being raised, so RPC callers
/// only ever branch on [`RpcResponse::code`].
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RpcResponse {
    pub code: ResultCode,
    pub body: Option<Bytes>,
}

impl RpcResponse {
    pub fn new(code: ResultCode, body: Option<Bytes>) -> Self {
        Self { code, body }
    }

    pub fn success(body: Bytes) -> Self {
        Self::new(ResultCode::Success, Some(body))
    }

    pub fn timeout() -> Self {
        Self::new(ResultCode::Timeout, None)
    }

    pub fn cancelled() -> Self {
        Self::new(ResultCode::Cancelled, None)
    }

    pub fn session_closed() -> Self {
        Self::new(ResultCode::SessionClosed, None)
    }

    pub fn session_null() -> Self {
        Self::new(ResultCode::SessionNull, None)
    }

    pub fn commit_failed() -> Self {
        Self::new(ResultCode::CommitFailed, None)
    }

    /// Fold a local error into a completion instead of raising it.
    pub fn local_exception(cause: impl core::fmt::Display) -> Self {
        Self::new(
            ResultCode::LocalException,
            Some(Bytes::from(cause.to_string())),
        )
    }

    pub fn is_success(&self) -> bool {
        self.code.is_success()
    }
}
