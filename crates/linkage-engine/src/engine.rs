//! Engine facade: wires collaborators together, owns background tasks and exposes the user
//! intents and read model to the rendering layer.

use std::future::Future;
use std::sync::Arc;
use std::time::Duration;

use chrono::{DateTime, Utc};
use dashmap::DashMap;
use linkage_sdk::{
    AuthorityClient, AuthorityError, RecordStore, RejectionReason, RemoteAuthority,
};
use serde::Serialize;
use tokio::sync::{broadcast, Mutex, OwnedMutexGuard};
use tokio::task::JoinHandle;
use tokio::time::MissedTickBehavior;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use crate::channels::{
    BatchOutcome, BatchReconciler, ChannelHealth, ChannelHealthBoard, EventStreamAdapter,
    PushSocketAdapter,
};
use crate::config::EngineConfig;
use crate::dispatcher::{Dispatcher, EngineEvent, SweepReport};
use crate::error::{LinkageError, LinkageResult};
use crate::guard::{OperationKind, PendingOperationGuard};
use crate::identity::CanonicalAccountId;
use crate::metrics;
use crate::notifications::{NotificationManager, NotificationPrompt, PromptKind};
use crate::registry::{AccountRegistry, LinkableAccount};
use crate::status::{normalize_status, CanonicalStatus, NormalizedStatus};
use crate::telemetry;

type IntentLocks = DashMap<CanonicalAccountId, Arc<Mutex<()>>>;

/// An account the host application knows about at startup.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CatalogEntry {
    pub account_id: String,
    pub display_name: String,
}

impl CatalogEntry {
    pub fn new(account_id: impl Into<String>, display_name: impl Into<String>) -> Self {
        Self {
            account_id: account_id.into(),
            display_name: display_name.into(),
        }
    }
}

#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct EngineSnapshot {
    pub accounts: Vec<LinkableAccount>,
    pub prompts: Vec<NotificationPrompt>,
    pub channels: Vec<ChannelHealth>,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum LinkOutcome {
    /// The authority accepted the request; the user must confirm on their side.
    AwaitingAcceptance,
    AlreadyLinked,
    /// The authority answered with a final status straight away.
    Settled(CanonicalStatus),
    Rejected(RejectionReason),
    /// Another intent for the account is still running.
    InFlight,
    Failed(String),
}

impl LinkOutcome {
    fn label(&self) -> &'static str {
        match self {
            LinkOutcome::AwaitingAcceptance => "awaiting_acceptance",
            LinkOutcome::AlreadyLinked => "already_linked",
            LinkOutcome::Settled(_) => "settled",
            LinkOutcome::Rejected(_) => "rejected",
            LinkOutcome::InFlight => "in_flight",
            LinkOutcome::Failed(_) => "failed",
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum UnlinkOutcome {
    /// Optimistically unlinked; waiting for a channel to confirm.
    Unlinking,
    AlreadyUnlinked,
    InFlight,
    Failed(String),
}

impl UnlinkOutcome {
    fn label(&self) -> &'static str {
        match self {
            UnlinkOutcome::Unlinking => "unlinking",
            UnlinkOutcome::AlreadyUnlinked => "already_unlinked",
            UnlinkOutcome::InFlight => "in_flight",
            UnlinkOutcome::Failed(_) => "failed",
        }
    }
}

pub struct LinkageEngine {
    config: EngineConfig,
    authority: Arc<dyn RemoteAuthority>,
    store: Arc<dyn RecordStore>,
    dispatcher: Arc<Dispatcher>,
    batch: Arc<BatchReconciler>,
    health: Arc<ChannelHealthBoard>,
    intent_locks: Arc<IntentLocks>,
    shutdown: CancellationToken,
    tasks: parking_lot::Mutex<Vec<JoinHandle<()>>>,
}

impl LinkageEngine {
    pub fn new(
        config: EngineConfig,
        authority: Arc<dyn RemoteAuthority>,
        store: Arc<dyn RecordStore>,
    ) -> Self {
        let dispatcher = Arc::new(Dispatcher::new(
            Arc::new(AccountRegistry::new()),
            Arc::new(PendingOperationGuard::new(config.pending_timeout())),
            Arc::new(NotificationManager::new(config.prompt_lifetimes())),
            store.clone(),
        ));
        let health = Arc::new(ChannelHealthBoard::new());
        let batch = Arc::new(BatchReconciler::new(
            authority.clone(),
            dispatcher.clone(),
            health.clone(),
            config.batch_timeout(),
        ));
        Self {
            config,
            authority,
            store,
            dispatcher,
            batch,
            health,
            intent_locks: Arc::new(DashMap::new()),
            shutdown: CancellationToken::new(),
            tasks: parking_lot::Mutex::new(Vec::new()),
        }
    }

    /// Builds the engine against the HTTP authority named in `config` and installs the
    /// `log_filter` subscriber unless the host already installed one.
    pub fn from_config(config: EngineConfig, store: Arc<dyn RecordStore>) -> LinkageResult<Self> {
        if !telemetry::init_tracing(&config.log_filter) {
            debug!(target: "linkage.engine", "tracing subscriber already installed");
        }
        let client = AuthorityClient::with_timeout(
            &config.authority_base_url,
            config.authority_token.clone(),
            config.batch_timeout().max(config.request_timeout()),
        )?;
        Ok(Self::new(config, Arc::new(client), store))
    }

    pub fn config(&self) -> &EngineConfig {
        &self.config
    }

    pub fn dispatcher(&self) -> &Arc<Dispatcher> {
        &self.dispatcher
    }

    pub fn batch(&self) -> &Arc<BatchReconciler> {
        &self.batch
    }

    pub fn health(&self) -> &Arc<ChannelHealthBoard> {
        &self.health
    }

    /// Seeds the registry from the record store for every catalog account. Runs before any
    /// channel connects; returns the number of accounts seeded.
    pub async fn bootstrap(&self, catalog: &[CatalogEntry]) -> usize {
        let mut seeded = 0;
        for entry in catalog {
            let id = match CanonicalAccountId::parse(&entry.account_id) {
                Ok(id) => id,
                Err(err) => {
                    warn!(target: "linkage.engine", error = %err, "skipping catalog entry");
                    continue;
                }
            };
            let account = match self.store.get(id.as_str()).await {
                Ok(Some(record)) => {
                    let status = record
                        .status
                        .parse::<CanonicalStatus>()
                        .unwrap_or_else(|_| normalize_status(&record.status).status());
                    let display_name = if entry.display_name.trim().is_empty() {
                        record.display_name
                    } else {
                        entry.display_name.clone()
                    };
                    LinkableAccount::new(
                        id,
                        display_name,
                        NormalizedStatus::from_canonical(status),
                        record.disabled,
                        DateTime::<Utc>::from(record.last_synced_at),
                    )
                }
                Ok(None) => self.unknown_account(id, entry),
                Err(err) => {
                    let err = LinkageError::from(err);
                    metrics::STORE_ERRORS.inc();
                    warn!(
                        target: "linkage.engine",
                        account_id = %id,
                        error = %err,
                        kind = err.kind(),
                        "record store read failed; seeding as unknown"
                    );
                    self.unknown_account(id, entry)
                }
            };
            self.dispatcher.registry().seed(account);
            seeded += 1;
        }
        info!(target: "linkage.engine", seeded, "registry seeded from record store");
        seeded
    }

    /// Spawns the configured channel adapters, auto-sync and the expiry sweeper.
    pub fn start(&self) {
        let mut tasks = self.tasks.lock();
        if !tasks.is_empty() {
            warn!(target: "linkage.engine", "engine already started");
            return;
        }
        if let Some(url) = &self.config.event_stream_url {
            let adapter = EventStreamAdapter::new(
                url.clone(),
                self.config.authority_token.clone(),
                self.config.backoff_policy(),
                self.dispatcher.clone(),
                self.health.clone(),
            );
            tasks.push(adapter.spawn(self.shutdown.child_token()));
        }
        if let Some(url) = &self.config.push_socket_url {
            let adapter =
                PushSocketAdapter::new(url.clone(), self.dispatcher.clone(), self.health.clone());
            tasks.push(adapter.spawn(self.shutdown.child_token()));
        }
        if let Some(period) = self.config.auto_sync_interval() {
            tasks.push(
                self.batch
                    .clone()
                    .spawn_auto_sync(period, self.shutdown.child_token()),
            );
        }
        tasks.push(spawn_sweeper(
            self.dispatcher.clone(),
            self.intent_locks.clone(),
            self.config.sweep_interval(),
            self.shutdown.child_token(),
        ));
        info!(target: "linkage.engine", tasks = tasks.len(), "engine started");
    }

    /// Stops every background task and waits for them to exit.
    pub async fn shutdown(&self) {
        self.shutdown.cancel();
        let tasks = std::mem::take(&mut *self.tasks.lock());
        for task in tasks {
            if let Err(err) = task.await {
                warn!(target: "linkage.engine", error = %err, "background task ended abnormally");
            }
        }
        info!(target: "linkage.engine", "engine stopped");
    }

    pub async fn request_link(&self, raw_account_id: &str) -> LinkageResult<LinkOutcome> {
        let id = CanonicalAccountId::parse(raw_account_id)?;
        let outcome = match self.try_intent(&id) {
            Some(_intent) => self.link(&id).await,
            None => LinkOutcome::InFlight,
        };
        metrics::USER_INTENTS
            .with_label_values(&["link", outcome.label()])
            .inc();
        info!(target: "linkage.engine", account_id = %id, outcome = outcome.label(), "link requested");
        Ok(outcome)
    }

    pub async fn request_unlink(&self, raw_account_id: &str) -> LinkageResult<UnlinkOutcome> {
        let id = CanonicalAccountId::parse(raw_account_id)?;
        let outcome = match self.try_intent(&id) {
            Some(_intent) => self.unlink(&id).await,
            None => UnlinkOutcome::InFlight,
        };
        metrics::USER_INTENTS
            .with_label_values(&["unlink", outcome.label()])
            .inc();
        info!(target: "linkage.engine", account_id = %id, outcome = outcome.label(), "unlink requested");
        Ok(outcome)
    }

    /// User-invoked batch reconciliation of every registry account.
    pub async fn refresh(&self) -> BatchOutcome {
        self.batch.reconcile_all().await
    }

    pub fn dismiss_prompt(&self, raw_account_id: &str) -> LinkageResult<Option<NotificationPrompt>> {
        let id = CanonicalAccountId::parse(raw_account_id)?;
        Ok(self.dispatcher.dismiss_prompt(&id))
    }

    pub fn account(&self, raw_account_id: &str) -> LinkageResult<Option<LinkableAccount>> {
        let id = CanonicalAccountId::parse(raw_account_id)?;
        Ok(self.dispatcher.registry().get(&id))
    }

    pub fn snapshot(&self) -> EngineSnapshot {
        EngineSnapshot {
            accounts: self.dispatcher.registry().snapshot(),
            prompts: self.dispatcher.notifications().active(),
            channels: self.health.snapshot(),
        }
    }

    pub fn subscribe(&self) -> broadcast::Receiver<EngineEvent> {
        self.dispatcher.subscribe()
    }

    pub fn sweep(&self) -> SweepReport {
        prune_idle(&self.intent_locks);
        self.dispatcher.sweep()
    }

    async fn link(&self, id: &CanonicalAccountId) -> LinkOutcome {
        let current = self.dispatcher.registry().status_of(id);
        if let Err(err) = ensure_transition_needed(id, current, OperationKind::Link) {
            debug!(target: "linkage.engine", error = %err, "link skipped");
            self.dispatcher
                .raise_prompt(id, PromptKind::AlreadyLinked, None);
            return LinkOutcome::AlreadyLinked;
        }
        if current == Some(CanonicalStatus::Pending) || self.operation_active(id, OperationKind::Link)
        {
            self.dispatcher.resurface_acceptance(id);
            return LinkOutcome::AwaitingAcceptance;
        }

        let restore = self.restore_point(id);
        let optimistic = NormalizedStatus::from_canonical(CanonicalStatus::Pending);
        if self
            .dispatcher
            .reserve_operation(id, OperationKind::Link, optimistic)
            .await
            .is_err()
        {
            self.dispatcher.resurface_acceptance(id);
            return LinkOutcome::AwaitingAcceptance;
        }

        match self.call(self.authority.request_link(id.as_str())).await {
            Ok(response) if response.already_linked => {
                let reported = normalize_status(&response.status);
                let linkage = if reported.linked() {
                    reported
                } else {
                    NormalizedStatus::from_canonical(CanonicalStatus::Linked)
                };
                self.dispatcher
                    .settle_operation(id, OperationKind::Link, linkage, None)
                    .await;
                self.dispatcher
                    .raise_prompt(id, PromptKind::AlreadyLinked, None);
                LinkOutcome::AlreadyLinked
            }
            Ok(response) => {
                let linkage = normalize_status(&response.status);
                match linkage.status() {
                    CanonicalStatus::Pending => {
                        if self.operation_active(id, OperationKind::Link) {
                            self.dispatcher
                                .raise_prompt(id, PromptKind::AwaitingAcceptance, None);
                            LinkOutcome::AwaitingAcceptance
                        } else {
                            // A channel settled the account while the request was in flight.
                            let settled = self
                                .dispatcher
                                .registry()
                                .status_of(id)
                                .unwrap_or(CanonicalStatus::Pending);
                            LinkOutcome::Settled(settled)
                        }
                    }
                    status => {
                        self.dispatcher
                            .settle_operation(id, OperationKind::Link, linkage, None)
                            .await;
                        LinkOutcome::Settled(status)
                    }
                }
            }
            Err(LinkageError::RemoteRejected(reason)) => {
                self.dispatcher
                    .settle_operation(
                        id,
                        OperationKind::Link,
                        NormalizedStatus::from_canonical(CanonicalStatus::Rejected),
                        None,
                    )
                    .await;
                let kind = match reason {
                    RejectionReason::Suspended => PromptKind::Suspended,
                    RejectionReason::Policy(_) => PromptKind::GenericError,
                };
                self.dispatcher
                    .raise_prompt(id, kind, Some(reason.to_string()));
                LinkOutcome::Rejected(reason)
            }
            Err(err) => {
                warn!(
                    target: "linkage.engine",
                    account_id = %id,
                    error = %err,
                    kind = err.kind(),
                    "link request failed; reverting"
                );
                self.dispatcher
                    .abandon_operation(id, OperationKind::Link, Some(restore))
                    .await;
                self.dispatcher
                    .raise_prompt(id, PromptKind::GenericError, Some(err.to_string()));
                LinkOutcome::Failed(err.to_string())
            }
        }
    }

    async fn unlink(&self, id: &CanonicalAccountId) -> UnlinkOutcome {
        if self.operation_active(id, OperationKind::Unlink) {
            return UnlinkOutcome::Unlinking;
        }
        let current = self.dispatcher.registry().status_of(id);
        if let Err(err) = ensure_transition_needed(id, current, OperationKind::Unlink) {
            debug!(target: "linkage.engine", error = %err, "unlink skipped");
            return UnlinkOutcome::AlreadyUnlinked;
        }
        let restore = self.restore_point(id);
        let optimistic = NormalizedStatus::from_canonical(CanonicalStatus::Unlinked);
        if self
            .dispatcher
            .begin_operation(id, OperationKind::Unlink, optimistic)
            .await
            .is_err()
        {
            return UnlinkOutcome::Unlinking;
        }

        match self.call(self.authority.request_unlink(id.as_str())).await {
            Ok(()) => UnlinkOutcome::Unlinking,
            Err(err) => {
                warn!(
                    target: "linkage.engine",
                    account_id = %id,
                    error = %err,
                    kind = err.kind(),
                    "unlink request failed; reverting"
                );
                self.dispatcher
                    .abandon_operation(id, OperationKind::Unlink, Some(restore))
                    .await;
                self.dispatcher
                    .raise_prompt(id, PromptKind::GenericError, Some(err.to_string()));
                UnlinkOutcome::Failed(err.to_string())
            }
        }
    }

    /// Bounds a remote round trip by the request timeout.
    async fn call<T>(
        &self,
        request: impl Future<Output = Result<T, AuthorityError>>,
    ) -> LinkageResult<T> {
        let limit = self.config.request_timeout();
        match tokio::time::timeout(limit, request).await {
            Ok(Ok(value)) => Ok(value),
            Ok(Err(AuthorityError::Timeout)) | Err(_) => Err(LinkageError::Timeout(limit)),
            Ok(Err(err)) => Err(err.into()),
        }
    }

    fn operation_active(&self, id: &CanonicalAccountId, kind: OperationKind) -> bool {
        let guard = self.dispatcher.guard();
        guard
            .pending(id)
            .is_some_and(|op| op.kind == kind && op.started_at.elapsed() < guard.timeout())
    }

    /// What a failed intent reverts to: the current record, or UNKNOWN for an account the
    /// registry has not seen yet.
    fn restore_point(&self, id: &CanonicalAccountId) -> LinkableAccount {
        self.dispatcher.registry().get(id).unwrap_or_else(|| {
            LinkableAccount::new(
                id.clone(),
                id.as_str(),
                NormalizedStatus::from_canonical(CanonicalStatus::Unknown),
                false,
                Utc::now(),
            )
        })
    }

    fn try_intent(&self, id: &CanonicalAccountId) -> Option<OwnedMutexGuard<()>> {
        let lock = self.intent_locks.entry(id.clone()).or_default().clone();
        lock.try_lock_owned().ok()
    }

    fn unknown_account(&self, id: CanonicalAccountId, entry: &CatalogEntry) -> LinkableAccount {
        let display_name = if entry.display_name.trim().is_empty() {
            id.as_str().to_string()
        } else {
            entry.display_name.clone()
        };
        LinkableAccount::new(
            id,
            display_name,
            NormalizedStatus::from_canonical(CanonicalStatus::Unknown),
            false,
            Utc::now(),
        )
    }
}

impl Drop for LinkageEngine {
    fn drop(&mut self) {
        self.shutdown.cancel();
    }
}

/// `AlreadyInTargetState` when the registry already shows what the intent asks for.
fn ensure_transition_needed(
    id: &CanonicalAccountId,
    current: Option<CanonicalStatus>,
    kind: OperationKind,
) -> LinkageResult<()> {
    let target = match kind {
        OperationKind::Link => CanonicalStatus::Linked,
        OperationKind::Unlink => CanonicalStatus::Unlinked,
    };
    if current == Some(target) {
        return Err(LinkageError::AlreadyInTargetState {
            account_id: id.to_string(),
            status: target,
        });
    }
    Ok(())
}

/// Drops per-account intent locks nobody holds.
fn prune_idle(locks: &IntentLocks) {
    locks.retain(|_, lock| Arc::strong_count(lock) > 1);
}

fn spawn_sweeper(
    dispatcher: Arc<Dispatcher>,
    intent_locks: Arc<IntentLocks>,
    period: Duration,
    shutdown: CancellationToken,
) -> JoinHandle<()> {
    tokio::spawn(async move {
        let mut ticker = tokio::time::interval(period);
        ticker.set_missed_tick_behavior(MissedTickBehavior::Skip);
        loop {
            tokio::select! {
                _ = shutdown.cancelled() => break,
                _ = ticker.tick() => {
                    prune_idle(&intent_locks);
                    let report = dispatcher.sweep();
                    if !report.expired_operations.is_empty() || !report.expired_prompts.is_empty() {
                        debug!(
                            target: "linkage.engine",
                            operations = report.expired_operations.len(),
                            prompts = report.expired_prompts.len(),
                            "expired state swept"
                        );
                    }
                }
            }
        }
    })
}
