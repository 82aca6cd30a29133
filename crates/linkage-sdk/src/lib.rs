//! Boundary collaborators of the linkage engine.
//!
//! `RemoteAuthority` is the contract of the service that owns linkage ground truth, with a
//! reqwest-backed [`AuthorityClient`] and an in-memory double. `RecordStore` persists the last
//! known per-account records between restarts.

pub mod authority;
pub mod record_store;

use std::time::Duration;

use async_trait::async_trait;
use reqwest::{Client, Response, StatusCode};
use serde::Deserialize;
use tracing::debug;
use url::Url;

pub use authority::{
    AuthorityError, BatchStatus, InMemoryAuthority, LinkResponse, RejectionReason,
    RemoteAuthority,
};
pub use record_store::{InMemoryRecordStore, RecordStore, RecordStoreError, StoredRecord};

/// HTTP client for the remote authority's linkage endpoints.
#[derive(Clone)]
pub struct AuthorityClient {
    http: Client,
    base_url: Url,
    token: Option<String>,
}

#[derive(Debug, Deserialize)]
struct ErrorBody {
    #[serde(default)]
    code: Option<String>,
}

impl AuthorityClient {
    pub fn new(base_url: &str, token: Option<String>) -> Result<Self, AuthorityError> {
        Self::with_http(Client::new(), base_url, token)
    }

    /// Builds a client whose every request is bounded by `timeout`.
    pub fn with_timeout(
        base_url: &str,
        token: Option<String>,
        timeout: Duration,
    ) -> Result<Self, AuthorityError> {
        let http = Client::builder()
            .timeout(timeout)
            .build()
            .map_err(|err| AuthorityError::TransportUnavailable(err.to_string()))?;
        Self::with_http(http, base_url, token)
    }

    fn with_http(http: Client, base_url: &str, token: Option<String>) -> Result<Self, AuthorityError> {
        let base_url = Url::parse(base_url.trim()).map_err(|err| {
            AuthorityError::TransportUnavailable(format!("invalid authority url: {err}"))
        })?;
        if base_url.cannot_be_a_base() {
            return Err(AuthorityError::TransportUnavailable(format!(
                "authority url {base_url} cannot be a base"
            )));
        }
        Ok(Self {
            http,
            base_url,
            token,
        })
    }

    fn endpoint(&self, segments: &[&str]) -> Result<Url, AuthorityError> {
        let mut url = self.base_url.clone();
        url.path_segments_mut()
            .map_err(|_| AuthorityError::TransportUnavailable("authority url cannot be a base".into()))?
            .pop_if_empty()
            .extend(segments);
        Ok(url)
    }

    fn authorize(&self, request: reqwest::RequestBuilder) -> reqwest::RequestBuilder {
        match &self.token {
            Some(token) => request.bearer_auth(token),
            None => request,
        }
    }
}

#[async_trait]
impl RemoteAuthority for AuthorityClient {
    async fn fetch_batch_statuses(
        &self,
        account_ids: &[String],
    ) -> Result<Vec<BatchStatus>, AuthorityError> {
        let url = self.endpoint(&["accounts", "statuses"])?;
        let res = self
            .authorize(self.http.post(url))
            .json(&serde_json::json!({ "accountIds": account_ids }))
            .send()
            .await
            .map_err(map_transport)?;
        let res = check_status(res).await?;
        res.json::<Vec<BatchStatus>>().await.map_err(map_transport)
    }

    async fn request_link(&self, account_id: &str) -> Result<LinkResponse, AuthorityError> {
        let url = self.endpoint(&["accounts", account_id, "link"])?;
        let res = self
            .authorize(self.http.post(url))
            .send()
            .await
            .map_err(map_transport)?;
        let res = check_status(res).await?;
        let response = res.json::<LinkResponse>().await.map_err(map_transport)?;
        debug!(
            target: "linkage.authority",
            account_id,
            status = %response.status,
            already_linked = response.already_linked,
            "link request answered"
        );
        Ok(response)
    }

    async fn request_unlink(&self, account_id: &str) -> Result<(), AuthorityError> {
        let url = self.endpoint(&["accounts", account_id, "link"])?;
        let res = self
            .authorize(self.http.delete(url))
            .send()
            .await
            .map_err(map_transport)?;
        check_status(res).await.map(|_| ())
    }
}

fn map_transport(err: reqwest::Error) -> AuthorityError {
    if err.is_timeout() {
        AuthorityError::Timeout
    } else if err.is_decode() {
        AuthorityError::MalformedPayload(err.to_string())
    } else {
        AuthorityError::TransportUnavailable(err.to_string())
    }
}

async fn check_status(res: Response) -> Result<Response, AuthorityError> {
    let status = res.status();
    if status.is_success() {
        return Ok(res);
    }
    let body = res.text().await.unwrap_or_default();
    Err(classify_failure(status, &body))
}

fn classify_failure(status: StatusCode, body: &str) -> AuthorityError {
    if status == StatusCode::REQUEST_TIMEOUT || status == StatusCode::GATEWAY_TIMEOUT {
        return AuthorityError::Timeout;
    }
    if status.is_server_error() || status == StatusCode::TOO_MANY_REQUESTS {
        return AuthorityError::TransportUnavailable(format!("unexpected status {status}: {body}"));
    }
    let code = serde_json::from_str::<ErrorBody>(body)
        .ok()
        .and_then(|parsed| parsed.code)
        .map(|code| code.trim().to_ascii_uppercase())
        .filter(|code| !code.is_empty());
    // Credentials and routing problems say nothing about the account itself.
    let reaches_account = match status {
        StatusCode::UNAUTHORIZED | StatusCode::NOT_FOUND | StatusCode::METHOD_NOT_ALLOWED => false,
        StatusCode::FORBIDDEN => code.is_some(),
        _ => true,
    };
    if !reaches_account {
        return AuthorityError::TransportUnavailable(format!("unexpected status {status}: {body}"));
    }
    match code.as_deref() {
        Some("SUSPENDED") | Some("CUSTOMER_SUSPENDED") => {
            AuthorityError::Rejected(RejectionReason::Suspended)
        }
        Some(other) => AuthorityError::Rejected(RejectionReason::Policy(other.to_string())),
        None => AuthorityError::Rejected(RejectionReason::Policy(status.as_u16().to_string())),
    }
}
