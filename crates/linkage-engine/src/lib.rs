//! Linkage status reconciliation.
//!
//! Keeps a local registry of linkable accounts consistent with a remote authority that is
//! observed through three independent channels: a server-sent event stream, a best-effort
//! push socket and an on-demand batch pull. Every write goes through the [`Dispatcher`],
//! which respects in-flight user operations via the [`PendingOperationGuard`] and derives
//! transient prompts from the transitions it applies.
//!
//! [`LinkageEngine`] is the entry point for hosts: seed it with a catalog, start it, then
//! drive it with `request_link`, `request_unlink` and `refresh` while rendering from
//! `snapshot` and `subscribe`.

pub mod backoff;
pub mod channels;
pub mod config;
pub mod dispatcher;
pub mod engine;
pub mod error;
pub mod guard;
pub mod identity;
pub mod metrics;
pub mod notifications;
pub mod registry;
pub mod status;
pub mod telemetry;

pub use crate::backoff::{Backoff, BackoffPolicy};
pub use crate::channels::{
    BatchOutcome, BatchReconciler, ChannelHealth, ChannelHealthBoard, ChannelKind, ChannelState,
    EventStreamAdapter, PushSocketAdapter,
};
pub use crate::config::EngineConfig;
pub use crate::dispatcher::{DispatchOutcome, Dispatcher, EngineEvent, SweepReport, UpdateSource};
pub use crate::engine::{CatalogEntry, EngineSnapshot, LinkOutcome, LinkageEngine, UnlinkOutcome};
pub use crate::error::{LinkageError, LinkageResult};
pub use crate::guard::{GuardDecision, OperationKind, PendingOperation, PendingOperationGuard};
pub use crate::identity::CanonicalAccountId;
pub use crate::notifications::{NotificationManager, NotificationPrompt, PromptKind, PromptLifetimes};
pub use crate::registry::{AccountRegistry, AccountUpdate, AppliedResult, LinkableAccount};
pub use crate::status::{normalize_status, CanonicalStatus, NormalizedStatus};
