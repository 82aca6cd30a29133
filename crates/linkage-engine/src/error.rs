use std::time::Duration;

use linkage_sdk::{AuthorityError, RecordStoreError, RejectionReason};

use crate::status::CanonicalStatus;

#[derive(Debug, thiserror::Error)]
pub enum LinkageError {
    #[error("transport unavailable: {0}")]
    TransportUnavailable(String),
    #[error("remote authority rejected the request: {0}")]
    RemoteRejected(RejectionReason),
    #[error("account {account_id} is already {status}")]
    AlreadyInTargetState {
        account_id: String,
        status: CanonicalStatus,
    },
    #[error("round trip exceeded {0:?}")]
    Timeout(Duration),
    #[error("malformed payload: {0}")]
    MalformedPayload(String),
    #[error("invalid account identifier {0:?}")]
    InvalidAccountId(String),
    #[error("record store error: {0}")]
    Store(#[from] RecordStoreError),
    #[error("configuration error: {0}")]
    Config(String),
}

impl LinkageError {
    /// Stable label used in logs and metrics.
    pub fn kind(&self) -> &'static str {
        match self {
            LinkageError::TransportUnavailable(_) => "transport_unavailable",
            LinkageError::RemoteRejected(_) => "remote_rejected",
            LinkageError::AlreadyInTargetState { .. } => "already_in_target_state",
            LinkageError::Timeout(_) => "timeout",
            LinkageError::MalformedPayload(_) => "malformed_payload",
            LinkageError::InvalidAccountId(_) => "invalid_account_id",
            LinkageError::Store(_) => "store",
            LinkageError::Config(_) => "config",
        }
    }
}

impl From<AuthorityError> for LinkageError {
    fn from(err: AuthorityError) -> Self {
        match err {
            AuthorityError::TransportUnavailable(msg) => LinkageError::TransportUnavailable(msg),
            AuthorityError::Timeout => LinkageError::Timeout(Duration::ZERO),
            AuthorityError::Rejected(reason) => LinkageError::RemoteRejected(reason),
            AuthorityError::MalformedPayload(msg) => LinkageError::MalformedPayload(msg),
        }
    }
}

pub type LinkageResult<T> = Result<T, LinkageError>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn store_failures_keep_their_message() {
        let err = LinkageError::from(RecordStoreError::Store("disk full".into()));
        assert_eq!(err.kind(), "store");
        assert_eq!(err.to_string(), "record store error: store error: disk full");
    }
}
