//! The single writer to the account registry.
//!
//! Every channel update and every local intent funnels through [`Dispatcher`], which
//! serializes work per account with a keyed `tokio::sync::Mutex`, consults the pending
//! operation guard, applies the write, derives prompts and fans the result out to subscribers.

use std::sync::Arc;
use std::time::SystemTime;

use chrono::Utc;
use dashmap::DashMap;
use linkage_sdk::{RecordStore, StoredRecord};
use serde::Serialize;
use tokio::sync::{broadcast, Mutex};
use tracing::{debug, info, warn};

use crate::error::LinkageError;
use crate::guard::{GuardDecision, OperationKind, PendingOperation, PendingOperationGuard};
use crate::identity::CanonicalAccountId;
use crate::metrics;
use crate::notifications::{
    NotificationManager, NotificationPrompt, PromptChange, PromptKind, Transition,
};
use crate::registry::{AccountRegistry, AccountUpdate, LinkableAccount};
use crate::status::{normalize_status, CanonicalStatus, NormalizedStatus};

const EVENT_CAPACITY: usize = 256;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum UpdateSource {
    EventStream,
    PushSocket,
    Batch,
    /// The authority's direct answer to a link or unlink request.
    RemoteResponse,
    /// Optimistic writes and reverts made on behalf of the user.
    Local,
}

impl UpdateSource {
    pub fn as_str(self) -> &'static str {
        match self {
            UpdateSource::EventStream => "event_stream",
            UpdateSource::PushSocket => "push_socket",
            UpdateSource::Batch => "batch",
            UpdateSource::RemoteResponse => "remote_response",
            UpdateSource::Local => "local",
        }
    }
}

/// What subscribers of the rendering layer receive.
#[derive(Debug, Clone, Serialize)]
#[serde(tag = "type", content = "data", rename_all = "snake_case")]
pub enum EngineEvent {
    AccountChanged(LinkableAccount),
    PromptRaised(NotificationPrompt),
    PromptRetired(NotificationPrompt),
}

impl EngineEvent {
    pub fn as_named_json(&self) -> (&'static str, Option<String>) {
        match self {
            EngineEvent::AccountChanged(account) => {
                ("account_changed", serde_json::to_string(account).ok())
            }
            EngineEvent::PromptRaised(prompt) => {
                ("prompt_raised", serde_json::to_string(prompt).ok())
            }
            EngineEvent::PromptRetired(prompt) => {
                ("prompt_retired", serde_json::to_string(prompt).ok())
            }
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DispatchOutcome {
    Applied { changed: bool },
    Suppressed(OperationKind),
    /// The update could not be attributed to an account.
    Dropped,
}

impl DispatchOutcome {
    fn label(self) -> &'static str {
        match self {
            DispatchOutcome::Applied { changed: true } => "changed",
            DispatchOutcome::Applied { changed: false } => "unchanged",
            DispatchOutcome::Suppressed(_) => "suppressed",
            DispatchOutcome::Dropped => "dropped",
        }
    }
}

#[derive(Debug, Default, Clone, PartialEq, Eq)]
pub struct SweepReport {
    pub expired_operations: Vec<PendingOperation>,
    pub expired_prompts: Vec<NotificationPrompt>,
}

pub struct Dispatcher {
    registry: Arc<AccountRegistry>,
    guard: Arc<PendingOperationGuard>,
    notifications: Arc<NotificationManager>,
    store: Arc<dyn RecordStore>,
    events: broadcast::Sender<EngineEvent>,
    key_locks: DashMap<CanonicalAccountId, Arc<Mutex<()>>>,
}

impl Dispatcher {
    pub fn new(
        registry: Arc<AccountRegistry>,
        guard: Arc<PendingOperationGuard>,
        notifications: Arc<NotificationManager>,
        store: Arc<dyn RecordStore>,
    ) -> Self {
        let (events, _) = broadcast::channel(EVENT_CAPACITY);
        Self {
            registry,
            guard,
            notifications,
            store,
            events,
            key_locks: DashMap::new(),
        }
    }

    pub fn registry(&self) -> &Arc<AccountRegistry> {
        &self.registry
    }

    pub fn guard(&self) -> &Arc<PendingOperationGuard> {
        &self.guard
    }

    pub fn notifications(&self) -> &Arc<NotificationManager> {
        &self.notifications
    }

    pub fn subscribe(&self) -> broadcast::Receiver<EngineEvent> {
        self.events.subscribe()
    }

    /// Entry point for every adapter: raw identifiers and tokens in, canonical writes out.
    pub async fn on_channel_update(
        &self,
        source: UpdateSource,
        raw_account_id: &str,
        raw_status: &str,
        raw_disabled: Option<bool>,
    ) -> DispatchOutcome {
        let id = match CanonicalAccountId::parse(raw_account_id) {
            Ok(id) => id,
            Err(err) => {
                warn!(
                    target: "linkage.dispatcher",
                    source = source.as_str(),
                    error = %err,
                    "dropping update without a usable account id"
                );
                return self.record(source, DispatchOutcome::Dropped);
            }
        };
        let update = AccountUpdate {
            id,
            linkage: normalize_status(raw_status),
            disabled: raw_disabled,
            display_name: None,
            observed_at: Utc::now(),
        };
        self.dispatch(source, update).await
    }

    pub async fn dispatch(&self, source: UpdateSource, update: AccountUpdate) -> DispatchOutcome {
        let lock = self.key_lock(&update.id);
        let _held = lock.lock().await;

        let decision = self.guard.should_apply(&update.id, update.linkage.status());
        if let GuardDecision::Suppress(kind) = decision {
            debug!(
                target: "linkage.dispatcher",
                account_id = %update.id,
                source = source.as_str(),
                status = %update.linkage.status(),
                operation = kind.as_str(),
                "update suppressed by pending operation"
            );
            return self.record(source, DispatchOutcome::Suppressed(kind));
        }
        if let GuardDecision::ApplyAfterTimeout(op) = &decision {
            info!(
                target: "linkage.dispatcher",
                account_id = %op.account_id,
                operation = op.kind.as_str(),
                "pending operation timed out; applying channel update"
            );
        }

        let changed = self.write(update, decision.finished()).await;
        self.record(source, DispatchOutcome::Applied { changed })
    }

    /// Registers a user operation and applies its optimistic status in one step. Returns the
    /// already active operation when one of the same kind is in flight.
    pub async fn begin_operation(
        &self,
        id: &CanonicalAccountId,
        kind: OperationKind,
        optimistic: NormalizedStatus,
    ) -> Result<DispatchOutcome, PendingOperation> {
        self.start_operation(id, kind, optimistic, true).await
    }

    /// Like [`Dispatcher::begin_operation`] but raises no prompt. Used when the authority's
    /// answer decides which prompt, if any, the user sees.
    pub async fn reserve_operation(
        &self,
        id: &CanonicalAccountId,
        kind: OperationKind,
        optimistic: NormalizedStatus,
    ) -> Result<DispatchOutcome, PendingOperation> {
        self.start_operation(id, kind, optimistic, false).await
    }

    /// Ends the account's operation with the authority's answer: the operation is cancelled,
    /// its prompt retired and `linkage` written in one step under the key lock.
    pub async fn settle_operation(
        &self,
        id: &CanonicalAccountId,
        kind: OperationKind,
        linkage: NormalizedStatus,
        disabled: Option<bool>,
    ) -> DispatchOutcome {
        let lock = self.key_lock(id);
        let _held = lock.lock().await;

        let mut changes = Vec::new();
        if let Some(op) = self.guard.cancel(id) {
            if op.kind != kind {
                debug!(
                    target: "linkage.dispatcher",
                    account_id = %id,
                    operation = op.kind.as_str(),
                    "settling replaced a different operation"
                );
            }
            changes.extend(self.notifications.on_operation_finished(&op));
        }
        self.publish_prompts(changes);

        let changed = self
            .write(
                AccountUpdate {
                    id: id.clone(),
                    linkage,
                    disabled,
                    display_name: None,
                    observed_at: Utc::now(),
                },
                None,
            )
            .await;
        self.record(UpdateSource::RemoteResponse, DispatchOutcome::Applied { changed })
    }

    /// Drops the account's operation after a failed remote call and, when the optimistic
    /// status is still showing, restores `restore`.
    pub async fn abandon_operation(
        &self,
        id: &CanonicalAccountId,
        kind: OperationKind,
        restore: Option<LinkableAccount>,
    ) -> DispatchOutcome {
        let lock = self.key_lock(id);
        let _held = lock.lock().await;

        let mut changes = Vec::new();
        if let Some(op) = self.guard.cancel(id) {
            changes.extend(self.notifications.on_operation_finished(&op));
        }
        self.publish_prompts(changes);

        let still_optimistic = self.registry.status_of(id) == Some(optimistic_status(kind));
        let outcome = match restore {
            Some(previous) if still_optimistic => {
                let changed = self
                    .write(
                        AccountUpdate {
                            id: id.clone(),
                            linkage: previous.linkage(),
                            disabled: Some(previous.disabled()),
                            display_name: None,
                            observed_at: Utc::now(),
                        },
                        None,
                    )
                    .await;
                info!(
                    target: "linkage.dispatcher",
                    account_id = %id,
                    status = %previous.status(),
                    "optimistic write reverted"
                );
                DispatchOutcome::Applied { changed }
            }
            _ => DispatchOutcome::Applied { changed: false },
        };
        self.record(UpdateSource::Local, outcome)
    }

    pub fn raise_prompt(
        &self,
        id: &CanonicalAccountId,
        kind: PromptKind,
        detail: Option<String>,
    ) -> Option<NotificationPrompt> {
        let changes = self.notifications.raise(id, kind, detail);
        self.publish_prompts(changes);
        self.notifications.get(id)
    }

    pub fn resurface_acceptance(&self, id: &CanonicalAccountId) -> NotificationPrompt {
        let (prompt, changes) = self.notifications.resurface_acceptance(id);
        self.publish_prompts(changes);
        prompt
    }

    pub fn dismiss_prompt(&self, id: &CanonicalAccountId) -> Option<NotificationPrompt> {
        let dismissed = self.notifications.dismiss(id)?;
        self.publish(EngineEvent::PromptRetired(dismissed.clone()));
        Some(dismissed)
    }

    /// Force-clears expired operations and prompts, retiring whatever they left behind.
    pub fn sweep(&self) -> SweepReport {
        let expired_operations = self.guard.expire_stale();
        for op in &expired_operations {
            info!(
                target: "linkage.dispatcher",
                account_id = %op.account_id,
                operation = op.kind.as_str(),
                "pending operation expired without confirmation"
            );
            let changes = self.notifications.on_operation_finished(op);
            self.publish_prompts(changes);
        }
        let expired_prompts = self.notifications.sweep_expired();
        for prompt in &expired_prompts {
            self.publish(EngineEvent::PromptRetired(prompt.clone()));
        }
        self.key_locks.retain(|_, lock| Arc::strong_count(lock) > 1);
        SweepReport {
            expired_operations,
            expired_prompts,
        }
    }

    async fn start_operation(
        &self,
        id: &CanonicalAccountId,
        kind: OperationKind,
        optimistic: NormalizedStatus,
        announce: bool,
    ) -> Result<DispatchOutcome, PendingOperation> {
        let lock = self.key_lock(id);
        let _held = lock.lock().await;

        let operation = self.guard.begin(id, kind)?;
        debug!(
            target: "linkage.dispatcher",
            account_id = %id,
            operation = operation.kind.as_str(),
            status = %optimistic.status(),
            announce,
            "operation started"
        );
        let result = self.registry.apply(AccountUpdate {
            id: id.clone(),
            linkage: optimistic,
            disabled: None,
            display_name: None,
            observed_at: Utc::now(),
        });
        if result.changed {
            self.persist(&result.current).await;
            self.publish(EngineEvent::AccountChanged(result.current.clone()));
        }
        let changes = match (announce, result.changed) {
            (false, _) => Vec::new(),
            (true, true) => self.notifications.on_transition(&Transition {
                account_id: id,
                previous: result.previous.as_ref().map(LinkableAccount::status),
                current: result.current.status(),
                active_operation: Some(kind),
            }),
            (true, false) => self.notifications.raise(id, prompt_for(kind), None),
        };
        self.publish_prompts(changes);
        Ok(self.record(
            UpdateSource::Local,
            DispatchOutcome::Applied {
                changed: result.changed,
            },
        ))
    }

    /// Applies an update the guard let through. Caller holds the account's key lock.
    async fn write(&self, update: AccountUpdate, finished: Option<PendingOperation>) -> bool {
        let id = update.id.clone();
        let result = self.registry.apply(update);
        let mut changes = Vec::new();
        if let Some(op) = finished {
            changes.extend(self.notifications.on_operation_finished(&op));
        }
        if result.changed {
            changes.extend(self.notifications.on_transition(&Transition {
                account_id: &id,
                previous: result.previous.as_ref().map(LinkableAccount::status),
                current: result.current.status(),
                active_operation: self.guard.pending(&id).map(|op| op.kind),
            }));
            self.persist(&result.current).await;
            self.publish(EngineEvent::AccountChanged(result.current.clone()));
        }
        self.publish_prompts(changes);
        result.changed
    }

    async fn persist(&self, account: &LinkableAccount) {
        let record = StoredRecord {
            account_id: account.id().as_str().to_string(),
            display_name: account.display_name().to_string(),
            status: account.status().as_str().to_string(),
            disabled: account.disabled(),
            last_synced_at: SystemTime::from(account.last_synced_at()),
        };
        if let Err(err) = self.store.put(account.id().as_str(), record).await {
            let err = LinkageError::from(err);
            metrics::STORE_ERRORS.inc();
            warn!(
                target: "linkage.dispatcher",
                account_id = %account.id(),
                error = %err,
                kind = err.kind(),
                "failed to persist account record"
            );
        }
    }

    fn publish_prompts(&self, changes: Vec<PromptChange>) {
        for change in changes {
            match change {
                PromptChange::Raised(prompt) => {
                    metrics::PROMPTS_RAISED
                        .with_label_values(&[prompt.kind.as_str()])
                        .inc();
                    self.publish(EngineEvent::PromptRaised(prompt));
                }
                PromptChange::Retired(prompt) => {
                    self.publish(EngineEvent::PromptRetired(prompt));
                }
            }
        }
    }

    fn publish(&self, event: EngineEvent) {
        let _ = self.events.send(event);
    }

    fn record(&self, source: UpdateSource, outcome: DispatchOutcome) -> DispatchOutcome {
        metrics::CHANNEL_UPDATES
            .with_label_values(&[source.as_str(), outcome.label()])
            .inc();
        outcome
    }

    fn key_lock(&self, id: &CanonicalAccountId) -> Arc<Mutex<()>> {
        self.key_locks.entry(id.clone()).or_default().clone()
    }
}

fn prompt_for(kind: OperationKind) -> PromptKind {
    match kind {
        OperationKind::Link => PromptKind::AwaitingAcceptance,
        OperationKind::Unlink => PromptKind::AwaitingRemoval,
    }
}

fn optimistic_status(kind: OperationKind) -> CanonicalStatus {
    match kind {
        OperationKind::Link => CanonicalStatus::Pending,
        OperationKind::Unlink => CanonicalStatus::Unlinked,
    }
}
