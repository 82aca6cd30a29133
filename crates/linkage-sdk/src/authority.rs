use std::collections::HashMap;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use tokio::sync::Mutex;

/// Status of one account as reported by a batch pull.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct BatchStatus {
    pub account_id: String,
    pub status: String,
    #[serde(default)]
    pub disabled: Option<bool>,
}

/// Response to a link request. `status` uses the authority's raw vocabulary.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct LinkResponse {
    pub status: String,
    #[serde(default)]
    pub already_linked: bool,
}

/// Business reasons the authority gives for refusing a link.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum RejectionReason {
    Suspended,
    Policy(String),
}

impl std::fmt::Display for RejectionReason {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            RejectionReason::Suspended => f.write_str("account suspended"),
            RejectionReason::Policy(code) => write!(f, "policy violation ({code})"),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum AuthorityError {
    #[error("remote authority unavailable: {0}")]
    TransportUnavailable(String),
    #[error("remote authority timed out")]
    Timeout,
    #[error("remote authority rejected the request: {0}")]
    Rejected(RejectionReason),
    #[error("malformed authority payload: {0}")]
    MalformedPayload(String),
}

/// Contract surface of the remote authority that owns linkage ground truth.
#[async_trait]
pub trait RemoteAuthority: Send + Sync {
    async fn fetch_batch_statuses(
        &self,
        account_ids: &[String],
    ) -> Result<Vec<BatchStatus>, AuthorityError>;

    async fn request_link(&self, account_id: &str) -> Result<LinkResponse, AuthorityError>;

    async fn request_unlink(&self, account_id: &str) -> Result<(), AuthorityError>;
}

#[derive(Debug, Clone)]
struct AuthorityAccount {
    status: String,
    disabled: Option<bool>,
    suspended: bool,
}

/// In-memory authority for tests and local wiring.
///
/// Link requests move unlinked accounts to `PENDING`, report `already_linked` for `ACTIVE`
/// and `DISABLED` accounts and reject suspended ones. Unlink requests move accounts to
/// `NOT_LINKED`.
#[derive(Default)]
pub struct InMemoryAuthority {
    accounts: Mutex<HashMap<String, AuthorityAccount>>,
    batch_delay: Mutex<Option<Duration>>,
    link_delay: Mutex<Option<Duration>>,
    link_failure: Mutex<Option<AuthorityError>>,
    unlink_failure: Mutex<Option<AuthorityError>>,
    batch_calls: AtomicUsize,
    link_calls: AtomicUsize,
    unlink_calls: AtomicUsize,
}

impl InMemoryAuthority {
    pub fn new() -> Arc<Self> {
        Arc::new(Self::default())
    }

    pub async fn set_status(&self, account_id: &str, status: &str, disabled: Option<bool>) {
        let mut guard = self.accounts.lock().await;
        let entry = guard
            .entry(account_id.to_string())
            .or_insert_with(|| AuthorityAccount {
                status: String::new(),
                disabled: None,
                suspended: false,
            });
        entry.status = status.to_string();
        entry.disabled = disabled;
    }

    pub async fn suspend(&self, account_id: &str) {
        let mut guard = self.accounts.lock().await;
        guard
            .entry(account_id.to_string())
            .or_insert_with(|| AuthorityAccount {
                status: "NOT_LINKED".into(),
                disabled: None,
                suspended: false,
            })
            .suspended = true;
    }

    /// Delays every batch response, used to hold a batch call in flight.
    pub async fn set_batch_delay(&self, delay: Option<Duration>) {
        *self.batch_delay.lock().await = delay;
    }

    /// Delays every link response, used to hold a link request in flight.
    pub async fn set_link_delay(&self, delay: Option<Duration>) {
        *self.link_delay.lock().await = delay;
    }

    pub async fn fail_links_with(&self, error: Option<AuthorityError>) {
        *self.link_failure.lock().await = error;
    }

    pub async fn fail_unlinks_with(&self, error: Option<AuthorityError>) {
        *self.unlink_failure.lock().await = error;
    }

    pub async fn status_of(&self, account_id: &str) -> Option<String> {
        self.accounts
            .lock()
            .await
            .get(account_id)
            .map(|account| account.status.clone())
    }

    pub fn batch_calls(&self) -> usize {
        self.batch_calls.load(Ordering::SeqCst)
    }

    pub fn link_calls(&self) -> usize {
        self.link_calls.load(Ordering::SeqCst)
    }

    pub fn unlink_calls(&self) -> usize {
        self.unlink_calls.load(Ordering::SeqCst)
    }
}

#[async_trait]
impl RemoteAuthority for InMemoryAuthority {
    async fn fetch_batch_statuses(
        &self,
        account_ids: &[String],
    ) -> Result<Vec<BatchStatus>, AuthorityError> {
        self.batch_calls.fetch_add(1, Ordering::SeqCst);
        let delay = *self.batch_delay.lock().await;
        if let Some(delay) = delay {
            tokio::time::sleep(delay).await;
        }
        let guard = self.accounts.lock().await;
        Ok(account_ids
            .iter()
            .filter_map(|id| {
                guard.get(id).map(|account| BatchStatus {
                    account_id: id.clone(),
                    status: account.status.clone(),
                    disabled: account.disabled,
                })
            })
            .collect())
    }

    async fn request_link(&self, account_id: &str) -> Result<LinkResponse, AuthorityError> {
        self.link_calls.fetch_add(1, Ordering::SeqCst);
        let delay = *self.link_delay.lock().await;
        if let Some(delay) = delay {
            tokio::time::sleep(delay).await;
        }
        if let Some(err) = self.link_failure.lock().await.clone() {
            return Err(err);
        }
        let mut guard = self.accounts.lock().await;
        let account = guard
            .entry(account_id.to_string())
            .or_insert_with(|| AuthorityAccount {
                status: "NOT_LINKED".into(),
                disabled: None,
                suspended: false,
            });
        if account.suspended {
            return Err(AuthorityError::Rejected(RejectionReason::Suspended));
        }
        let linked = ["ACTIVE", "DISABLED"]
            .iter()
            .any(|status| account.status.eq_ignore_ascii_case(status));
        if linked {
            return Ok(LinkResponse {
                status: account.status.clone(),
                already_linked: true,
            });
        }
        account.status = "PENDING".into();
        Ok(LinkResponse {
            status: account.status.clone(),
            already_linked: false,
        })
    }

    async fn request_unlink(&self, account_id: &str) -> Result<(), AuthorityError> {
        self.unlink_calls.fetch_add(1, Ordering::SeqCst);
        if let Some(err) = self.unlink_failure.lock().await.clone() {
            return Err(err);
        }
        let mut guard = self.accounts.lock().await;
        if let Some(account) = guard.get_mut(account_id) {
            account.status = "NOT_LINKED".into();
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn link_moves_unlinked_account_to_pending() {
        let authority = InMemoryAuthority::new();
        authority.set_status("1234567890", "NOT_LINKED", None).await;
        let response = authority.request_link("1234567890").await.unwrap();
        assert_eq!(response.status, "PENDING");
        assert!(!response.already_linked);
        assert_eq!(
            authority.status_of("1234567890").await.as_deref(),
            Some("PENDING")
        );
    }

    #[tokio::test]
    async fn link_reports_already_linked_for_active_accounts() {
        let authority = InMemoryAuthority::new();
        authority.set_status("42", "ACTIVE", None).await;
        let response = authority.request_link("42").await.unwrap();
        assert!(response.already_linked);
        assert_eq!(authority.link_calls(), 1);
    }

    #[tokio::test]
    async fn suspended_accounts_are_rejected() {
        let authority = InMemoryAuthority::new();
        authority.suspend("7").await;
        let err = authority.request_link("7").await.unwrap_err();
        assert_eq!(err, AuthorityError::Rejected(RejectionReason::Suspended));
    }

    #[tokio::test]
    async fn batch_only_reports_known_accounts() {
        let authority = InMemoryAuthority::new();
        authority.set_status("1", "ACTIVE", Some(true)).await;
        let statuses = authority
            .fetch_batch_statuses(&["1".to_string(), "2".to_string()])
            .await
            .unwrap();
        assert_eq!(statuses.len(), 1);
        assert_eq!(statuses[0].disabled, Some(true));
        assert_eq!(authority.batch_calls(), 1);
    }
}
