use std::collections::HashMap;
use std::time::Duration;

use parking_lot::Mutex;
use serde::Serialize;
use tokio::time::Instant;

use crate::identity::CanonicalAccountId;
use crate::status::CanonicalStatus;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum OperationKind {
    Link,
    Unlink,
}

impl OperationKind {
    pub fn as_str(self) -> &'static str {
        match self {
            OperationKind::Link => "link",
            OperationKind::Unlink => "unlink",
        }
    }

    /// Whether `status` ends an operation of this kind.
    fn accepts(self, status: CanonicalStatus) -> bool {
        match self {
            OperationKind::Link => status.is_terminal(),
            OperationKind::Unlink => status == CanonicalStatus::Unlinked,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PendingOperation {
    pub account_id: CanonicalAccountId,
    pub kind: OperationKind,
    pub started_at: Instant,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum GuardDecision {
    /// No operation is in flight.
    Apply,
    /// The update ends the operation, which has been cleared.
    ApplyAndComplete(PendingOperation),
    /// The operation outlived the timeout and was force-cleared.
    ApplyAfterTimeout(PendingOperation),
    Suppress(OperationKind),
}

impl GuardDecision {
    pub fn should_apply(&self) -> bool {
        !matches!(self, GuardDecision::Suppress(_))
    }

    /// The operation this decision cleared, if any.
    pub fn finished(self) -> Option<PendingOperation> {
        match self {
            GuardDecision::ApplyAndComplete(op) | GuardDecision::ApplyAfterTimeout(op) => Some(op),
            GuardDecision::Apply | GuardDecision::Suppress(_) => None,
        }
    }
}

/// Tracks user-initiated transitions and filters channel updates while one is in flight.
#[derive(Debug)]
pub struct PendingOperationGuard {
    operations: Mutex<HashMap<CanonicalAccountId, PendingOperation>>,
    timeout: Duration,
}

impl PendingOperationGuard {
    pub fn new(timeout: Duration) -> Self {
        Self {
            operations: Mutex::new(HashMap::new()),
            timeout,
        }
    }

    pub fn timeout(&self) -> Duration {
        self.timeout
    }

    /// Registers an operation. An unexpired operation of the same kind is returned as the
    /// error; an operation of the other kind is replaced.
    pub(crate) fn begin(
        &self,
        account_id: &CanonicalAccountId,
        kind: OperationKind,
    ) -> Result<PendingOperation, PendingOperation> {
        let mut operations = self.operations.lock();
        if let Some(existing) = operations.get(account_id) {
            if existing.kind == kind && existing.started_at.elapsed() < self.timeout {
                return Err(existing.clone());
            }
        }
        let operation = PendingOperation {
            account_id: account_id.clone(),
            kind,
            started_at: Instant::now(),
        };
        operations.insert(account_id.clone(), operation.clone());
        Ok(operation)
    }

    pub fn should_apply(
        &self,
        account_id: &CanonicalAccountId,
        incoming: CanonicalStatus,
    ) -> GuardDecision {
        let mut operations = self.operations.lock();
        let Some(operation) = operations.get(account_id) else {
            return GuardDecision::Apply;
        };
        if operation.started_at.elapsed() >= self.timeout {
            return operations
                .remove(account_id)
                .map(GuardDecision::ApplyAfterTimeout)
                .unwrap_or(GuardDecision::Apply);
        }
        if operation.kind.accepts(incoming) {
            return operations
                .remove(account_id)
                .map(GuardDecision::ApplyAndComplete)
                .unwrap_or(GuardDecision::Apply);
        }
        GuardDecision::Suppress(operation.kind)
    }

    pub fn pending(&self, account_id: &CanonicalAccountId) -> Option<PendingOperation> {
        self.operations.lock().get(account_id).cloned()
    }

    pub(crate) fn cancel(&self, account_id: &CanonicalAccountId) -> Option<PendingOperation> {
        self.operations.lock().remove(account_id)
    }

    /// Force-clears every operation older than the timeout.
    pub(crate) fn expire_stale(&self) -> Vec<PendingOperation> {
        let mut operations = self.operations.lock();
        let stale: Vec<CanonicalAccountId> = operations
            .iter()
            .filter(|(_, op)| op.started_at.elapsed() >= self.timeout)
            .map(|(id, _)| id.clone())
            .collect();
        stale
            .into_iter()
            .filter_map(|id| operations.remove(&id))
            .collect()
    }

    pub fn len(&self) -> usize {
        self.operations.lock().len()
    }

    pub fn is_empty(&self) -> bool {
        self.operations.lock().is_empty()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn account() -> CanonicalAccountId {
        CanonicalAccountId::parse("123-456-7890").unwrap()
    }

    #[test]
    fn applies_everything_without_an_operation() {
        let guard = PendingOperationGuard::new(Duration::from_secs(30));
        assert_eq!(
            guard.should_apply(&account(), CanonicalStatus::Pending),
            GuardDecision::Apply
        );
    }

    #[test]
    fn link_suppresses_pending_and_completes_on_linked() {
        let guard = PendingOperationGuard::new(Duration::from_secs(30));
        guard.begin(&account(), OperationKind::Link).unwrap();

        let decision = guard.should_apply(&account(), CanonicalStatus::Pending);
        assert_eq!(decision, GuardDecision::Suppress(OperationKind::Link));
        assert!(guard.pending(&account()).is_some());

        let decision = guard.should_apply(&account(), CanonicalStatus::Linked);
        assert!(matches!(decision, GuardDecision::ApplyAndComplete(ref op) if op.kind == OperationKind::Link));
        assert!(guard.pending(&account()).is_none());
    }

    #[test]
    fn link_accepts_every_terminal_outcome() {
        for status in [
            CanonicalStatus::Linked,
            CanonicalStatus::LinkedInactive,
            CanonicalStatus::Rejected,
            CanonicalStatus::Unlinked,
        ] {
            let guard = PendingOperationGuard::new(Duration::from_secs(30));
            guard.begin(&account(), OperationKind::Link).unwrap();
            assert!(guard.should_apply(&account(), status).should_apply(), "{status}");
            assert!(guard.is_empty());
        }
    }

    #[test]
    fn unlink_only_accepts_unlinked() {
        let guard = PendingOperationGuard::new(Duration::from_secs(30));
        guard.begin(&account(), OperationKind::Unlink).unwrap();
        for status in [
            CanonicalStatus::Linked,
            CanonicalStatus::LinkedInactive,
            CanonicalStatus::Pending,
            CanonicalStatus::Rejected,
        ] {
            assert_eq!(
                guard.should_apply(&account(), status),
                GuardDecision::Suppress(OperationKind::Unlink)
            );
        }
        let decision = guard.should_apply(&account(), CanonicalStatus::Unlinked);
        assert!(decision.finished().is_some());
        assert!(guard.is_empty());
    }

    #[test]
    fn duplicate_begin_returns_existing_operation() {
        let guard = PendingOperationGuard::new(Duration::from_secs(30));
        let first = guard.begin(&account(), OperationKind::Link).unwrap();
        let second = guard.begin(&account(), OperationKind::Link).unwrap_err();
        assert_eq!(first, second);
        let replaced = guard.begin(&account(), OperationKind::Unlink).unwrap();
        assert_eq!(replaced.kind, OperationKind::Unlink);
        assert_eq!(guard.len(), 1);
    }

    #[tokio::test(start_paused = true)]
    async fn stale_operation_applies_next_update() {
        let guard = PendingOperationGuard::new(Duration::from_secs(30));
        guard.begin(&account(), OperationKind::Unlink).unwrap();
        tokio::time::advance(Duration::from_secs(29)).await;
        assert!(!guard.should_apply(&account(), CanonicalStatus::Pending).should_apply());

        tokio::time::advance(Duration::from_secs(2)).await;
        let decision = guard.should_apply(&account(), CanonicalStatus::Pending);
        assert!(matches!(decision, GuardDecision::ApplyAfterTimeout(ref op) if op.kind == OperationKind::Unlink));
        assert!(guard.is_empty());
    }

    #[tokio::test(start_paused = true)]
    async fn sweep_clears_only_expired_operations() {
        let guard = PendingOperationGuard::new(Duration::from_secs(10));
        guard.begin(&account(), OperationKind::Link).unwrap();
        tokio::time::advance(Duration::from_secs(6)).await;
        let other = CanonicalAccountId::parse("555").unwrap();
        guard.begin(&other, OperationKind::Unlink).unwrap();
        tokio::time::advance(Duration::from_secs(5)).await;

        let expired = guard.expire_stale();
        assert_eq!(expired.len(), 1);
        assert_eq!(expired[0].account_id, account());
        assert!(guard.pending(&other).is_some());
    }
}
