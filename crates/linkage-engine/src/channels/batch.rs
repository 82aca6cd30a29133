use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;

use linkage_sdk::{AuthorityError, RemoteAuthority};
use tokio::task::JoinHandle;
use tokio::time::MissedTickBehavior;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use super::{ChannelHealthBoard, ChannelKind};
use crate::dispatcher::{DispatchOutcome, Dispatcher, UpdateSource};
use crate::identity::CanonicalAccountId;
use crate::metrics;

const KIND: ChannelKind = ChannelKind::Batch;

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum BatchOutcome {
    /// Another reconciliation was already in flight.
    Skipped,
    Completed {
        reported: usize,
        changed: usize,
        suppressed: usize,
        dropped: usize,
    },
    TimedOut(Duration),
    Failed(AuthorityError),
}

impl BatchOutcome {
    fn label(&self) -> &'static str {
        match self {
            BatchOutcome::Skipped => "skipped",
            BatchOutcome::Completed { .. } => "completed",
            BatchOutcome::TimedOut(_) => "timed_out",
            BatchOutcome::Failed(_) => "failed",
        }
    }
}

/// Releases the single-flight slot however the reconciliation ends, cancellation included.
struct FlightGuard<'a>(&'a AtomicBool);

impl Drop for FlightGuard<'_> {
    fn drop(&mut self) {
        self.0.store(false, Ordering::Release);
    }
}

/// Pull channel: asks the authority for the status of many accounts in one round trip.
pub struct BatchReconciler {
    authority: Arc<dyn RemoteAuthority>,
    dispatcher: Arc<Dispatcher>,
    health: Arc<ChannelHealthBoard>,
    timeout: Duration,
    in_flight: AtomicBool,
}

impl BatchReconciler {
    pub fn new(
        authority: Arc<dyn RemoteAuthority>,
        dispatcher: Arc<Dispatcher>,
        health: Arc<ChannelHealthBoard>,
        timeout: Duration,
    ) -> Self {
        Self {
            authority,
            dispatcher,
            health,
            timeout,
            in_flight: AtomicBool::new(false),
        }
    }

    pub fn in_flight(&self) -> bool {
        self.in_flight.load(Ordering::Acquire)
    }

    pub async fn reconcile_all(&self) -> BatchOutcome {
        let ids = self.dispatcher.registry().ids();
        self.reconcile(&ids).await
    }

    pub async fn reconcile(&self, ids: &[CanonicalAccountId]) -> BatchOutcome {
        let Some(_flight) = self.try_acquire() else {
            debug!(target: "linkage.batch", "reconciliation already in flight; skipping");
            return self.finish(BatchOutcome::Skipped);
        };
        if ids.is_empty() {
            return self.finish(BatchOutcome::Completed {
                reported: 0,
                changed: 0,
                suppressed: 0,
                dropped: 0,
            });
        }

        self.health.mark_connecting(KIND);
        let raw: Vec<String> = ids.iter().map(|id| id.as_str().to_string()).collect();
        let fetched =
            tokio::time::timeout(self.timeout, self.authority.fetch_batch_statuses(&raw)).await;
        let statuses = match fetched {
            Ok(Ok(statuses)) => statuses,
            Ok(Err(err)) => {
                warn!(target: "linkage.batch", error = %err, "batch status fetch failed");
                self.health.mark_idle(KIND, Some(err.to_string()));
                return self.finish(BatchOutcome::Failed(err));
            }
            Err(_) => {
                warn!(
                    target: "linkage.batch",
                    timeout_ms = self.timeout.as_millis() as u64,
                    "batch status fetch timed out"
                );
                self.health.mark_idle(KIND, Some("timed out".into()));
                return self.finish(BatchOutcome::TimedOut(self.timeout));
            }
        };

        let reported = statuses.len();
        let (mut changed, mut suppressed, mut dropped) = (0, 0, 0);
        for status in statuses {
            match self
                .dispatcher
                .on_channel_update(
                    UpdateSource::Batch,
                    &status.account_id,
                    &status.status,
                    status.disabled,
                )
                .await
            {
                DispatchOutcome::Applied { changed: true } => changed += 1,
                DispatchOutcome::Applied { changed: false } => {}
                DispatchOutcome::Suppressed(_) => suppressed += 1,
                DispatchOutcome::Dropped => dropped += 1,
            }
        }
        self.health.mark_idle(KIND, None);
        info!(
            target: "linkage.batch",
            requested = ids.len(),
            reported,
            changed,
            suppressed,
            dropped,
            "batch reconciliation completed"
        );
        self.finish(BatchOutcome::Completed {
            reported,
            changed,
            suppressed,
            dropped,
        })
    }

    /// Reconciles every registry account on a fixed period until `shutdown` fires.
    pub fn spawn_auto_sync(
        self: Arc<Self>,
        period: Duration,
        shutdown: CancellationToken,
    ) -> JoinHandle<()> {
        tokio::spawn(async move {
            let mut ticker = tokio::time::interval(period);
            ticker.set_missed_tick_behavior(MissedTickBehavior::Skip);
            ticker.tick().await;
            loop {
                tokio::select! {
                    _ = shutdown.cancelled() => break,
                    _ = ticker.tick() => {
                        self.reconcile_all().await;
                    }
                }
            }
            debug!(target: "linkage.batch", "auto-sync stopped");
        })
    }

    fn try_acquire(&self) -> Option<FlightGuard<'_>> {
        self.in_flight
            .compare_exchange(false, true, Ordering::AcqRel, Ordering::Acquire)
            .ok()
            .map(|_| FlightGuard(&self.in_flight))
    }

    fn finish(&self, outcome: BatchOutcome) -> BatchOutcome {
        metrics::BATCH_RUNS.with_label_values(&[outcome.label()]).inc();
        outcome
    }
}

#[cfg(test)]
mod tests {
    use linkage_sdk::{InMemoryAuthority, InMemoryRecordStore};

    use super::*;
    use crate::guard::PendingOperationGuard;
    use crate::notifications::{NotificationManager, PromptLifetimes};
    use crate::registry::AccountRegistry;

    fn reconciler(authority: Arc<InMemoryAuthority>, timeout: Duration) -> Arc<BatchReconciler> {
        let dispatcher = Arc::new(Dispatcher::new(
            Arc::new(AccountRegistry::new()),
            Arc::new(PendingOperationGuard::new(Duration::from_secs(30))),
            Arc::new(NotificationManager::new(PromptLifetimes::default())),
            InMemoryRecordStore::new(),
        ));
        Arc::new(BatchReconciler::new(
            authority,
            dispatcher,
            Arc::new(ChannelHealthBoard::new()),
            timeout,
        ))
    }

    fn ids(raw: &[&str]) -> Vec<CanonicalAccountId> {
        raw.iter()
            .map(|id| CanonicalAccountId::parse(id).unwrap())
            .collect()
    }

    #[tokio::test]
    async fn applies_reported_statuses() {
        let authority = InMemoryAuthority::new();
        authority.set_status("111", "ACTIVE", None).await;
        authority.set_status("222", "DISABLED", Some(true)).await;
        let reconciler = reconciler(authority.clone(), Duration::from_secs(5));

        let outcome = reconciler.reconcile(&ids(&["111", "222", "333"])).await;
        assert_eq!(
            outcome,
            BatchOutcome::Completed {
                reported: 2,
                changed: 2,
                suppressed: 0,
                dropped: 0
            }
        );
        assert!(!reconciler.in_flight());
    }

    #[tokio::test(start_paused = true)]
    async fn slow_authority_times_out_and_releases_the_slot() {
        let authority = InMemoryAuthority::new();
        authority.set_status("111", "ACTIVE", None).await;
        authority.set_batch_delay(Some(Duration::from_secs(60))).await;
        let reconciler = reconciler(authority.clone(), Duration::from_secs(5));

        let outcome = reconciler.reconcile(&ids(&["111"])).await;
        assert_eq!(outcome, BatchOutcome::TimedOut(Duration::from_secs(5)));
        assert!(!reconciler.in_flight());
    }

    #[tokio::test(start_paused = true)]
    async fn overlapping_refresh_is_skipped() {
        let authority = InMemoryAuthority::new();
        authority.set_status("111", "ACTIVE", None).await;
        authority.set_batch_delay(Some(Duration::from_secs(2))).await;
        let reconciler = reconciler(authority.clone(), Duration::from_secs(5));

        let first = {
            let reconciler = reconciler.clone();
            tokio::spawn(async move { reconciler.reconcile(&ids(&["111"])).await })
        };
        tokio::task::yield_now().await;
        assert!(reconciler.in_flight());

        let second = reconciler.reconcile(&ids(&["111"])).await;
        assert_eq!(second, BatchOutcome::Skipped);
        assert!(matches!(first.await.unwrap(), BatchOutcome::Completed { .. }));
        assert_eq!(authority.batch_calls(), 1);
    }
}
