//! Transient user-facing prompts derived from registry transitions.
//!
//! At most one prompt is active per account. Prompts expire silently: the registry
//! always holds enough state to re-derive what the user should see.

use std::collections::HashMap;
use std::time::Duration;

use chrono::{DateTime, Utc};
use parking_lot::Mutex;
use serde::Serialize;
use tokio::time::Instant;
use uuid::Uuid;

use crate::guard::{OperationKind, PendingOperation};
use crate::identity::CanonicalAccountId;
use crate::status::CanonicalStatus;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum PromptKind {
    AwaitingAcceptance,
    AwaitingRemoval,
    AlreadyLinked,
    Suspended,
    GenericError,
}

impl PromptKind {
    pub fn as_str(self) -> &'static str {
        match self {
            PromptKind::AwaitingAcceptance => "awaiting_acceptance",
            PromptKind::AwaitingRemoval => "awaiting_removal",
            PromptKind::AlreadyLinked => "already_linked",
            PromptKind::Suspended => "suspended",
            PromptKind::GenericError => "generic_error",
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct NotificationPrompt {
    pub id: Uuid,
    pub account_id: CanonicalAccountId,
    pub kind: PromptKind,
    pub detail: Option<String>,
    pub created_at: DateTime<Utc>,
    pub expires_at: DateTime<Utc>,
    #[serde(skip)]
    deadline: Instant,
}

impl NotificationPrompt {
    fn new(
        account_id: CanonicalAccountId,
        kind: PromptKind,
        detail: Option<String>,
        ttl: Duration,
    ) -> Self {
        let created_at = Utc::now();
        let expires_at = created_at
            + chrono::Duration::from_std(ttl).unwrap_or_else(|_| chrono::Duration::zero());
        Self {
            id: Uuid::new_v4(),
            account_id,
            kind,
            detail,
            created_at,
            expires_at,
            deadline: Instant::now() + ttl,
        }
    }

    pub fn is_expired(&self) -> bool {
        Instant::now() >= self.deadline
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum PromptChange {
    Raised(NotificationPrompt),
    Retired(NotificationPrompt),
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct PromptLifetimes {
    pub acceptance: Duration,
    pub default: Duration,
}

impl PromptLifetimes {
    fn for_kind(&self, kind: PromptKind) -> Duration {
        match kind {
            PromptKind::AwaitingAcceptance => self.acceptance,
            _ => self.default,
        }
    }
}

impl Default for PromptLifetimes {
    fn default() -> Self {
        Self {
            acceptance: Duration::from_secs(120),
            default: Duration::from_secs(15),
        }
    }
}

/// A registry change as seen by the notification manager.
#[derive(Debug, Clone)]
pub struct Transition<'a> {
    pub account_id: &'a CanonicalAccountId,
    pub previous: Option<CanonicalStatus>,
    pub current: CanonicalStatus,
    /// Operation active after the write, if any.
    pub active_operation: Option<OperationKind>,
}

#[derive(Debug, Default)]
pub struct NotificationManager {
    prompts: Mutex<HashMap<CanonicalAccountId, NotificationPrompt>>,
    lifetimes: PromptLifetimes,
}

impl NotificationManager {
    pub fn new(lifetimes: PromptLifetimes) -> Self {
        Self {
            prompts: Mutex::new(HashMap::new()),
            lifetimes,
        }
    }

    pub fn on_transition(&self, transition: &Transition<'_>) -> Vec<PromptChange> {
        let id = transition.account_id;
        if transition.current == CanonicalStatus::Pending
            && transition.previous != Some(CanonicalStatus::Pending)
        {
            return self.raise(id, PromptKind::AwaitingAcceptance, None);
        }
        if transition.current == CanonicalStatus::Unlinked
            && transition.active_operation == Some(OperationKind::Unlink)
        {
            return self.raise(id, PromptKind::AwaitingRemoval, None);
        }
        if transition.current != CanonicalStatus::Pending {
            return self.retire_kind(id, PromptKind::AwaitingAcceptance);
        }
        Vec::new()
    }

    /// Retires the prompt tied to a completed, expired or abandoned operation.
    pub fn on_operation_finished(&self, operation: &PendingOperation) -> Vec<PromptChange> {
        let kind = match operation.kind {
            OperationKind::Link => PromptKind::AwaitingAcceptance,
            OperationKind::Unlink => PromptKind::AwaitingRemoval,
        };
        self.retire_kind(&operation.account_id, kind)
    }

    /// Raises a prompt, replacing any other active prompt for the account. An active prompt
    /// of the same kind is kept as is so its timer does not restart.
    pub fn raise(
        &self,
        account_id: &CanonicalAccountId,
        kind: PromptKind,
        detail: Option<String>,
    ) -> Vec<PromptChange> {
        let mut prompts = self.prompts.lock();
        if let Some(existing) = prompts.get(account_id) {
            if existing.kind == kind && !existing.is_expired() {
                return Vec::new();
            }
        }
        self.replace_locked(&mut prompts, account_id, kind, detail).1
    }

    /// Returns the live acceptance prompt, raising a fresh one when there is none. An
    /// existing prompt is reported as raised again so subscribers re-show it.
    pub fn resurface_acceptance(
        &self,
        account_id: &CanonicalAccountId,
    ) -> (NotificationPrompt, Vec<PromptChange>) {
        let mut prompts = self.prompts.lock();
        if let Some(existing) = prompts.get(account_id) {
            if existing.kind == PromptKind::AwaitingAcceptance && !existing.is_expired() {
                let prompt = existing.clone();
                return (prompt.clone(), vec![PromptChange::Raised(prompt)]);
            }
        }
        self.replace_locked(&mut prompts, account_id, PromptKind::AwaitingAcceptance, None)
    }

    fn replace_locked(
        &self,
        prompts: &mut HashMap<CanonicalAccountId, NotificationPrompt>,
        account_id: &CanonicalAccountId,
        kind: PromptKind,
        detail: Option<String>,
    ) -> (NotificationPrompt, Vec<PromptChange>) {
        let mut changes = Vec::new();
        if let Some(previous) = prompts.remove(account_id) {
            changes.push(PromptChange::Retired(previous));
        }
        let prompt = NotificationPrompt::new(
            account_id.clone(),
            kind,
            detail,
            self.lifetimes.for_kind(kind),
        );
        prompts.insert(account_id.clone(), prompt.clone());
        changes.push(PromptChange::Raised(prompt.clone()));
        (prompt, changes)
    }

    pub fn dismiss(&self, account_id: &CanonicalAccountId) -> Option<NotificationPrompt> {
        self.prompts.lock().remove(account_id)
    }

    pub fn get(&self, account_id: &CanonicalAccountId) -> Option<NotificationPrompt> {
        self.prompts
            .lock()
            .get(account_id)
            .filter(|prompt| !prompt.is_expired())
            .cloned()
    }

    pub fn active(&self) -> Vec<NotificationPrompt> {
        let mut active: Vec<_> = self
            .prompts
            .lock()
            .values()
            .filter(|prompt| !prompt.is_expired())
            .cloned()
            .collect();
        active.sort_by(|left, right| left.account_id.cmp(&right.account_id));
        active
    }

    pub fn sweep_expired(&self) -> Vec<NotificationPrompt> {
        let mut prompts = self.prompts.lock();
        let expired: Vec<CanonicalAccountId> = prompts
            .iter()
            .filter(|(_, prompt)| prompt.is_expired())
            .map(|(id, _)| id.clone())
            .collect();
        expired
            .into_iter()
            .filter_map(|id| prompts.remove(&id))
            .collect()
    }

    fn retire_kind(&self, account_id: &CanonicalAccountId, kind: PromptKind) -> Vec<PromptChange> {
        let mut prompts = self.prompts.lock();
        match prompts.get(account_id) {
            Some(prompt) if prompt.kind == kind => prompts
                .remove(account_id)
                .map(PromptChange::Retired)
                .into_iter()
                .collect(),
            _ => Vec::new(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn account() -> CanonicalAccountId {
        CanonicalAccountId::parse("123-456-7890").unwrap()
    }

    fn transition(
        id: &CanonicalAccountId,
        previous: Option<CanonicalStatus>,
        current: CanonicalStatus,
        active_operation: Option<OperationKind>,
    ) -> Transition<'_> {
        Transition {
            account_id: id,
            previous,
            current,
            active_operation,
        }
    }

    #[test]
    fn entering_pending_raises_acceptance_once() {
        let manager = NotificationManager::default();
        let id = account();
        let changes = manager.on_transition(&transition(
            &id,
            Some(CanonicalStatus::Unlinked),
            CanonicalStatus::Pending,
            Some(OperationKind::Link),
        ));
        assert!(matches!(&changes[..], [PromptChange::Raised(p)] if p.kind == PromptKind::AwaitingAcceptance));

        let again = manager.raise(&id, PromptKind::AwaitingAcceptance, None);
        assert!(again.is_empty());
        assert_eq!(manager.active().len(), 1);
    }

    #[test]
    fn leaving_pending_retires_acceptance() {
        let manager = NotificationManager::default();
        let id = account();
        manager.raise(&id, PromptKind::AwaitingAcceptance, None);
        let changes = manager.on_transition(&transition(
            &id,
            Some(CanonicalStatus::Pending),
            CanonicalStatus::Linked,
            None,
        ));
        assert!(matches!(&changes[..], [PromptChange::Retired(p)] if p.kind == PromptKind::AwaitingAcceptance));
        assert!(manager.get(&id).is_none());
    }

    #[test]
    fn optimistic_unlink_raises_removal_and_completion_retires_it() {
        let manager = NotificationManager::default();
        let id = account();
        manager.on_transition(&transition(
            &id,
            Some(CanonicalStatus::Linked),
            CanonicalStatus::Unlinked,
            Some(OperationKind::Unlink),
        ));
        assert_eq!(
            manager.get(&id).map(|p| p.kind),
            Some(PromptKind::AwaitingRemoval)
        );

        let op = PendingOperation {
            account_id: id.clone(),
            kind: OperationKind::Unlink,
            started_at: Instant::now(),
        };
        let changes = manager.on_operation_finished(&op);
        assert_eq!(changes.len(), 1);
        assert!(manager.active().is_empty());
    }

    #[test]
    fn unrelated_prompts_survive_operation_completion() {
        let manager = NotificationManager::default();
        let id = account();
        manager.raise(&id, PromptKind::AlreadyLinked, None);
        let op = PendingOperation {
            account_id: id.clone(),
            kind: OperationKind::Link,
            started_at: Instant::now(),
        };
        assert!(manager.on_operation_finished(&op).is_empty());
        assert_eq!(manager.get(&id).map(|p| p.kind), Some(PromptKind::AlreadyLinked));
    }

    #[test]
    fn raising_a_different_kind_replaces_the_prompt() {
        let manager = NotificationManager::default();
        let id = account();
        manager.raise(&id, PromptKind::AwaitingAcceptance, None);
        let changes = manager.raise(&id, PromptKind::Suspended, Some("account suspended".into()));
        assert_eq!(changes.len(), 2);
        assert!(matches!(&changes[0], PromptChange::Retired(p) if p.kind == PromptKind::AwaitingAcceptance));
        assert!(matches!(&changes[1], PromptChange::Raised(p) if p.kind == PromptKind::Suspended));
        assert_eq!(manager.active().len(), 1);
    }

    #[test]
    fn resurfacing_keeps_the_existing_prompt() {
        let manager = NotificationManager::default();
        let id = account();
        manager.raise(&id, PromptKind::AwaitingAcceptance, None);
        let original = manager.get(&id).unwrap();
        let (prompt, _) = manager.resurface_acceptance(&id);
        assert_eq!(prompt.id, original.id);
        assert_eq!(prompt.expires_at, original.expires_at);
    }

    #[tokio::test(start_paused = true)]
    async fn prompts_expire_silently() {
        let manager = NotificationManager::new(PromptLifetimes {
            acceptance: Duration::from_secs(60),
            default: Duration::from_secs(5),
        });
        let id = account();
        let other = CanonicalAccountId::parse("99").unwrap();
        manager.raise(&id, PromptKind::AlreadyLinked, None);
        manager.raise(&other, PromptKind::AwaitingAcceptance, None);

        tokio::time::advance(Duration::from_secs(6)).await;
        assert!(manager.get(&id).is_none());
        let expired = manager.sweep_expired();
        assert_eq!(expired.len(), 1);
        assert_eq!(expired[0].kind, PromptKind::AlreadyLinked);
        assert_eq!(manager.active().len(), 1);
    }
}
