//! Unique-constraint descriptors carried alongside a push.
//!
//! Uniqueness is enforced at push time, inside the same transaction as the
//! events that claim or free a key. A violation aborts the whole push, so no
//! event is ever half-committed relative to the keys it claims.

use serde::{Deserialize, Serialize};

/// Whether a descriptor claims or frees its key.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum ConstraintAction {
    /// Claim the key; fails the push if it is already held.
    Add,
    /// Free the key for reuse.
    Remove,
}

/// One uniqueness marker change, attached to the command that causes it.
///
/// Keys live in the namespace `(instance, constraint_type, constraint_key)`;
/// a *global* constraint drops the instance scope and is enforced
/// platform-wide (e.g. instance domains).
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct UniqueConstraint {
    /// Constraint namespace, e.g. `usernames`.
    pub constraint_type: String,
    /// The claimed or freed key, e.g. a username.
    pub constraint_key: String,
    /// Claim or free.
    pub action: ConstraintAction,
    /// Conflict text surfaced to the caller when an add loses; empty for
    /// removes.
    pub conflict_message: String,
    /// Enforce across all tenants instead of within one.
    pub global: bool,
}

impl UniqueConstraint {
    /// Claims `key` within the pushing tenant.
    pub fn add(
        constraint_type: impl Into<String>,
        key: impl Into<String>,
        conflict_message: impl Into<String>,
    ) -> Self {
        Self {
            constraint_type: constraint_type.into(),
            constraint_key: key.into(),
            action: ConstraintAction::Add,
            conflict_message: conflict_message.into(),
            global: false,
        }
    }

    /// Frees `key` within the pushing tenant.
    pub fn remove(constraint_type: impl Into<String>, key: impl Into<String>) -> Self {
        Self {
            constraint_type: constraint_type.into(),
            constraint_key: key.into(),
            action: ConstraintAction::Remove,
            conflict_message: String::new(),
            global: false,
        }
    }

    /// Claims `key` across all tenants.
    pub fn add_global(
        constraint_type: impl Into<String>,
        key: impl Into<String>,
        conflict_message: impl Into<String>,
    ) -> Self {
        Self {
            global: true,
            ..Self::add(constraint_type, key, conflict_message)
        }
    }

    /// Frees a platform-wide `key`.
    pub fn remove_global(constraint_type: impl Into<String>, key: impl Into<String>) -> Self {
        Self {
            global: true,
            ..Self::remove(constraint_type, key)
        }
    }
}
