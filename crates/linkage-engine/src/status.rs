//! Status vocabulary. [`normalize_status`] is the only place raw authority tokens are
//! interpreted; every write path derives `linked` from the status it produces.

use std::fmt;
use std::str::FromStr;

use serde::Serialize;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum CanonicalStatus {
    Unlinked,
    Pending,
    Linked,
    LinkedInactive,
    Rejected,
    Unknown,
}

impl CanonicalStatus {
    pub fn as_str(self) -> &'static str {
        match self {
            CanonicalStatus::Unlinked => "UNLINKED",
            CanonicalStatus::Pending => "PENDING",
            CanonicalStatus::Linked => "LINKED",
            CanonicalStatus::LinkedInactive => "LINKED_INACTIVE",
            CanonicalStatus::Rejected => "REJECTED",
            CanonicalStatus::Unknown => "UNKNOWN",
        }
    }

    pub fn is_linked(self) -> bool {
        matches!(self, CanonicalStatus::Linked | CanonicalStatus::LinkedInactive)
    }

    /// Statuses that end an in-flight link or unlink operation.
    pub fn is_terminal(self) -> bool {
        matches!(
            self,
            CanonicalStatus::Linked
                | CanonicalStatus::LinkedInactive
                | CanonicalStatus::Rejected
                | CanonicalStatus::Unlinked
        )
    }
}

impl fmt::Display for CanonicalStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Parses a canonical status name as persisted by the record store.
impl FromStr for CanonicalStatus {
    type Err = String;

    fn from_str(value: &str) -> Result<Self, Self::Err> {
        match value {
            "UNLINKED" => Ok(CanonicalStatus::Unlinked),
            "PENDING" => Ok(CanonicalStatus::Pending),
            "LINKED" => Ok(CanonicalStatus::Linked),
            "LINKED_INACTIVE" => Ok(CanonicalStatus::LinkedInactive),
            "REJECTED" => Ok(CanonicalStatus::Rejected),
            "UNKNOWN" => Ok(CanonicalStatus::Unknown),
            other => Err(format!("unknown canonical status {other:?}")),
        }
    }
}

/// A canonical status paired with its derived `linked` flag.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub struct NormalizedStatus {
    #[serde(rename = "canonicalStatus")]
    status: CanonicalStatus,
    linked: bool,
}

impl NormalizedStatus {
    pub fn from_canonical(status: CanonicalStatus) -> Self {
        Self {
            status,
            linked: status.is_linked(),
        }
    }

    pub fn status(&self) -> CanonicalStatus {
        self.status
    }

    pub fn linked(&self) -> bool {
        self.linked
    }
}

/// Maps a raw status token from any channel onto the canonical vocabulary.
///
/// Tokens are trimmed and upper-cased; spaces and hyphens fold to `_`. Anything
/// unrecognized is treated as unlinked.
pub fn normalize_status(raw: &str) -> NormalizedStatus {
    let token: String = raw
        .trim()
        .chars()
        .map(|c| match c {
            ' ' | '-' => '_',
            other => other.to_ascii_uppercase(),
        })
        .collect();
    let status = match token.as_str() {
        "ACTIVE" | "LINKED" | "ENABLED" => CanonicalStatus::Linked,
        "PENDING" | "INVITED" | "NEEDS_CONFIRMATION" => CanonicalStatus::Pending,
        "DISABLED" | "SUSPENDED" | "CUSTOMER_NOT_ENABLED" => CanonicalStatus::LinkedInactive,
        _ => CanonicalStatus::Unlinked,
    };
    NormalizedStatus::from_canonical(status)
}
