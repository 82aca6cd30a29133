//! In-memory account registry. Only the dispatcher writes to it; everyone else reads
//! cloned snapshots.

use chrono::{DateTime, Utc};
use dashmap::mapref::entry::Entry;
use dashmap::DashMap;
use serde::Serialize;

use crate::identity::CanonicalAccountId;
use crate::status::{CanonicalStatus, NormalizedStatus};

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct LinkableAccount {
    pub(crate) id: CanonicalAccountId,
    pub(crate) display_name: String,
    #[serde(flatten)]
    pub(crate) linkage: NormalizedStatus,
    pub(crate) disabled: bool,
    pub(crate) last_synced_at: DateTime<Utc>,
}

impl LinkableAccount {
    pub(crate) fn new(
        id: CanonicalAccountId,
        display_name: impl Into<String>,
        linkage: NormalizedStatus,
        disabled: bool,
        last_synced_at: DateTime<Utc>,
    ) -> Self {
        Self {
            id,
            display_name: display_name.into(),
            linkage,
            disabled,
            last_synced_at,
        }
    }

    pub fn id(&self) -> &CanonicalAccountId {
        &self.id
    }

    pub fn display_name(&self) -> &str {
        &self.display_name
    }

    pub fn status(&self) -> CanonicalStatus {
        self.linkage.status()
    }

    pub fn linked(&self) -> bool {
        self.linkage.linked()
    }

    pub fn linkage(&self) -> NormalizedStatus {
        self.linkage
    }

    pub fn disabled(&self) -> bool {
        self.disabled
    }

    pub fn last_synced_at(&self) -> DateTime<Utc> {
        self.last_synced_at
    }
}

/// A normalized write headed for the registry.
#[derive(Debug, Clone)]
pub struct AccountUpdate {
    pub id: CanonicalAccountId,
    pub linkage: NormalizedStatus,
    /// `None` keeps the stored flag.
    pub disabled: Option<bool>,
    pub display_name: Option<String>,
    pub observed_at: DateTime<Utc>,
}

#[derive(Debug, Clone)]
pub struct AppliedResult {
    pub changed: bool,
    pub previous: Option<LinkableAccount>,
    pub current: LinkableAccount,
}

#[derive(Debug, Default)]
pub struct AccountRegistry {
    accounts: DashMap<CanonicalAccountId, LinkableAccount>,
}

impl AccountRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Startup pre-population from the catalog and record store.
    pub(crate) fn seed(&self, account: LinkableAccount) {
        self.accounts.insert(account.id.clone(), account);
    }

    /// Last-write-wins by arrival order. `last_synced_at` is refreshed even when nothing
    /// else changes.
    pub(crate) fn apply(&self, update: AccountUpdate) -> AppliedResult {
        match self.accounts.entry(update.id.clone()) {
            Entry::Occupied(mut occupied) => {
                let previous = occupied.get().clone();
                let account = occupied.get_mut();
                account.linkage = update.linkage;
                if let Some(disabled) = update.disabled {
                    account.disabled = disabled;
                }
                if let Some(name) = update.display_name {
                    account.display_name = name;
                }
                account.last_synced_at = update.observed_at;
                let current = account.clone();
                let changed = previous.linkage != current.linkage
                    || previous.disabled != current.disabled
                    || previous.display_name != current.display_name;
                AppliedResult {
                    changed,
                    previous: Some(previous),
                    current,
                }
            }
            Entry::Vacant(vacant) => {
                let display_name = update
                    .display_name
                    .unwrap_or_else(|| update.id.as_str().to_string());
                let account = LinkableAccount::new(
                    update.id,
                    display_name,
                    update.linkage,
                    update.disabled.unwrap_or(false),
                    update.observed_at,
                );
                vacant.insert(account.clone());
                AppliedResult {
                    changed: true,
                    previous: None,
                    current: account,
                }
            }
        }
    }

    pub fn get(&self, id: &CanonicalAccountId) -> Option<LinkableAccount> {
        self.accounts.get(id).map(|entry| entry.value().clone())
    }

    pub fn status_of(&self, id: &CanonicalAccountId) -> Option<CanonicalStatus> {
        self.accounts.get(id).map(|entry| entry.value().status())
    }

    pub fn ids(&self) -> Vec<CanonicalAccountId> {
        let mut ids: Vec<_> = self.accounts.iter().map(|entry| entry.key().clone()).collect();
        ids.sort();
        ids
    }

    pub fn snapshot(&self) -> Vec<LinkableAccount> {
        let mut accounts: Vec<_> = self
            .accounts
            .iter()
            .map(|entry| entry.value().clone())
            .collect();
        accounts.sort_by(|left, right| left.id.cmp(&right.id));
        accounts
    }

    pub fn len(&self) -> usize {
        self.accounts.len()
    }

    pub fn is_empty(&self) -> bool {
        self.accounts.is_empty()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::status::normalize_status;

    fn update(raw_id: &str, raw_status: &str, disabled: Option<bool>) -> AccountUpdate {
        AccountUpdate {
            id: CanonicalAccountId::parse(raw_id).unwrap(),
            linkage: normalize_status(raw_status),
            disabled,
            display_name: None,
            observed_at: Utc::now(),
        }
    }

    #[test]
    fn second_identical_apply_is_unchanged() {
        let registry = AccountRegistry::new();
        let first = registry.apply(update("123-456-7890", "ACTIVE", None));
        let second = registry.apply(update("123-456-7890", "ACTIVE", None));
        assert!(first.changed);
        assert!(!second.changed);
        assert_eq!(second.current.status(), CanonicalStatus::Linked);
        assert!(second.current.last_synced_at() >= first.current.last_synced_at());
    }

    #[test]
    fn formatted_and_plain_ids_hit_one_entry() {
        let registry = AccountRegistry::new();
        registry.apply(update("123-456-7890", "PENDING", None));
        let result = registry.apply(update("1234567890", "ACTIVE", None));
        assert_eq!(registry.len(), 1);
        assert_eq!(
            result.previous.map(|account| account.status()),
            Some(CanonicalStatus::Pending)
        );
    }

    #[test]
    fn disabled_flag_is_sticky() {
        let registry = AccountRegistry::new();
        registry.apply(update("42", "ACTIVE", Some(true)));
        let result = registry.apply(update("42", "SUSPENDED", None));
        assert!(result.current.disabled());
        let cleared = registry.apply(update("42", "ACTIVE", Some(false)));
        assert!(!cleared.current.disabled());
        assert!(cleared.changed);
    }

    #[test]
    fn snapshot_is_sorted_by_id() {
        let registry = AccountRegistry::new();
        registry.apply(update("300", "ACTIVE", None));
        registry.apply(update("100", "PENDING", None));
        registry.apply(update("200", "NOT_LINKED", None));
        let ids: Vec<_> = registry
            .snapshot()
            .into_iter()
            .map(|account| account.id().to_string())
            .collect();
        assert_eq!(ids, ["100", "200", "300"]);
    }

    #[test]
    fn unseen_accounts_default_their_display_name() {
        let registry = AccountRegistry::new();
        let result = registry.apply(update("987-654", "ACTIVE", None));
        assert!(result.previous.is_none());
        assert_eq!(result.current.display_name(), "987654");
    }
}
