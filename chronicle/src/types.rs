//! Core identifier and ordering types for the Chronicle event sourcing core.
//!
//! All identifier types use smart constructors to ensure validity at
//! construction time, following the "parse, don't validate" principle: once a
//! value exists, no further validation is needed anywhere downstream.

use std::fmt;

use nutype::nutype;
use serde::{Deserialize, Serialize};

/// The tenant identifier — the top-level isolation boundary.
///
/// Every event, unique constraint, and projection state row is scoped by an
/// `InstanceId`. Values are guaranteed to be non-empty and at most 255
/// characters.
#[nutype(
    sanitize(trim),
    validate(not_empty, len_char_max = 255),
    derive(
        Debug,
        Clone,
        PartialEq,
        Eq,
        PartialOrd,
        Ord,
        Hash,
        AsRef,
        Deref,
        Display,
        Serialize,
        Deserialize
    )
)]
pub struct InstanceId(String);

/// The sub-tenant owning an aggregate, e.g. an organization within a tenant.
#[nutype(
    sanitize(trim),
    validate(not_empty, len_char_max = 255),
    derive(
        Debug,
        Clone,
        PartialEq,
        Eq,
        Hash,
        AsRef,
        Deref,
        Display,
        Serialize,
        Deserialize
    )
)]
pub struct ResourceOwner(String);

/// The kind of an aggregate, e.g. `user`, `org`, `project`.
#[nutype(
    sanitize(trim),
    validate(not_empty, len_char_max = 255),
    derive(
        Debug,
        Clone,
        PartialEq,
        Eq,
        PartialOrd,
        Ord,
        Hash,
        AsRef,
        Deref,
        Display,
        Serialize,
        Deserialize
    )
)]
pub struct AggregateType(String);

/// The identifier of one aggregate within its type.
///
/// `(InstanceId, AggregateType, AggregateId)` identifies one event stream.
#[nutype(
    sanitize(trim),
    validate(not_empty, len_char_max = 255),
    derive(
        Debug,
        Clone,
        PartialEq,
        Eq,
        PartialOrd,
        Ord,
        Hash,
        AsRef,
        Deref,
        Display,
        Serialize,
        Deserialize
    )
)]
pub struct AggregateId(String);

/// The type of an event, e.g. `user.added`.
#[nutype(
    sanitize(trim),
    validate(not_empty, len_char_max = 255),
    derive(
        Debug,
        Clone,
        PartialEq,
        Eq,
        Hash,
        AsRef,
        Deref,
        Display,
        Serialize,
        Deserialize
    )
)]
pub struct EventType(String);

/// The schema revision of an aggregate's event vocabulary, e.g. `v1`.
///
/// Revisions let reducers distinguish payload generations after an aggregate's
/// event schema evolves. The format is a `v` followed by digits.
#[nutype(
    sanitize(trim),
    validate(predicate = |s: &str| {
        let mut chars = s.chars();
        chars.next() == Some('v')
            && {
                let rest = chars.as_str();
                !rest.is_empty() && rest.chars().all(|c| c.is_ascii_digit())
            }
    }),
    derive(
        Debug,
        Clone,
        PartialEq,
        Eq,
        Hash,
        AsRef,
        Deref,
        Display,
        Serialize,
        Deserialize
    )
)]
pub struct AggregateVersion(String);

/// The per-aggregate event counter.
///
/// Sequences start at 1 for the first event of an aggregate and are gapless
/// and strictly increasing within `(instance, aggregate type, aggregate id)`.
/// `Sequence::ZERO` denotes "no events yet" and is what a fresh write model
/// reports as its processed sequence.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Default, Serialize, Deserialize)]
#[serde(transparent)]
pub struct Sequence(u64);

impl Sequence {
    /// The sequence of an aggregate that has no events.
    pub const ZERO: Self = Self(0);

    /// Wraps a raw sequence value.
    #[must_use]
    pub const fn new(value: u64) -> Self {
        Self(value)
    }

    /// Returns the raw sequence value.
    #[must_use]
    pub const fn get(self) -> u64 {
        self.0
    }

    /// Returns the sequence following this one.
    #[must_use]
    pub const fn next(self) -> Self {
        Self(self.0.saturating_add(1))
    }
}

impl From<u64> for Sequence {
    fn from(value: u64) -> Self {
        Self(value)
    }
}

impl fmt::Display for Sequence {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        self.0.fmt(f)
    }
}

/// The global ordering token assigned to an event at commit time.
///
/// Positions total-order events across all aggregates of the log. Once a
/// reader has observed position `p`, no event with a position `<= p` will
/// become visible later — this is what makes incremental projection catch-up
/// (`position > last_processed`) safe. `Position::ZERO` is the start of the
/// log; committed events always carry a position `>= 1`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Default, Serialize, Deserialize)]
#[serde(transparent)]
pub struct Position(u64);

impl Position {
    /// The position before the first event of the log.
    pub const ZERO: Self = Self(0);

    /// Wraps a raw position value.
    #[must_use]
    pub const fn new(value: u64) -> Self {
        Self(value)
    }

    /// Returns the raw position value.
    #[must_use]
    pub const fn get(self) -> u64 {
        self.0
    }

    /// Returns the position following this one.
    #[must_use]
    pub const fn next(self) -> Self {
        Self(self.0.saturating_add(1))
    }
}

impl From<u64> for Position {
    fn from(value: u64) -> Self {
        Self(value)
    }
}

impl fmt::Display for Position {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        self.0.fmt(f)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use proptest::prelude::*;

    proptest! {
        #[test]
        fn instance_id_accepts_valid_strings(s in "[a-zA-Z0-9_-]{1,255}") {
            let result = InstanceId::try_new(s.clone());
            prop_assert!(result.is_ok());
            let id = result.unwrap();
            prop_assert_eq!(id.as_str(), s.as_str());
        }

        #[test]
        fn instance_id_trims_whitespace(s in " {0,10}[a-zA-Z0-9_-]{1,240} {0,10}") {
            let result = InstanceId::try_new(s.clone());
            prop_assert!(result.is_ok());
            let id = result.unwrap();
            prop_assert_eq!(id.as_str(), s.trim());
        }

        #[test]
        fn instance_id_rejects_empty_strings(s in " {0,50}") {
            prop_assert!(InstanceId::try_new(s).is_err());
        }

        #[test]
        fn instance_id_rejects_strings_over_255_chars(s in "[a-zA-Z0-9]{256,500}") {
            prop_assert!(InstanceId::try_new(s).is_err());
        }

        #[test]
        fn event_type_roundtrip_serialization(s in "[a-z]{1,20}\\.[a-z]{1,20}") {
            let event_type = EventType::try_new(s).unwrap();
            let json = serde_json::to_string(&event_type).unwrap();
            let deserialized: EventType = serde_json::from_str(&json).unwrap();
            prop_assert_eq!(event_type, deserialized);
        }

        #[test]
        fn aggregate_version_accepts_v_digits(n in 1u16..10_000) {
            let result = AggregateVersion::try_new(format!("v{n}"));
            prop_assert!(result.is_ok());
        }

        #[test]
        fn aggregate_version_rejects_other_shapes(s in "[a-u,w-z][a-z0-9]{0,10}") {
            prop_assert!(AggregateVersion::try_new(s).is_err());
        }

        #[test]
        fn sequence_next_increments_by_one(v in 0u64..u64::MAX) {
            let sequence = Sequence::new(v);
            prop_assert_eq!(sequence.next().get(), v + 1);
        }

        #[test]
        fn sequence_ordering_matches_raw_ordering(v1 in 0u64..=u64::MAX, v2 in 0u64..=u64::MAX) {
            let s1 = Sequence::new(v1);
            let s2 = Sequence::new(v2);
            prop_assert_eq!(s1 < s2, v1 < v2);
            prop_assert_eq!(s1 == s2, v1 == v2);
        }

        #[test]
        fn position_ordering_matches_raw_ordering(v1 in 0u64..=u64::MAX, v2 in 0u64..=u64::MAX) {
            let p1 = Position::new(v1);
            let p2 = Position::new(v2);
            prop_assert_eq!(p1 < p2, v1 < v2);
            prop_assert_eq!(p1 == p2, v1 == v2);
        }

        #[test]
        fn position_roundtrip_serialization(v in 0u64..=u64::MAX) {
            let position = Position::new(v);
            let json = serde_json::to_string(&position).unwrap();
            let deserialized: Position = serde_json::from_str(&json).unwrap();
            prop_assert_eq!(position, deserialized);
        }
    }

    #[test]
    fn sequence_zero_is_default() {
        assert_eq!(Sequence::default(), Sequence::ZERO);
        assert_eq!(Sequence::ZERO.get(), 0);
    }

    #[test]
    fn sequence_next_saturates_at_max() {
        let max = Sequence::new(u64::MAX);
        assert_eq!(max.next(), max);
    }

    #[test]
    fn aggregate_version_rejects_specific_invalid_cases() {
        assert!(AggregateVersion::try_new("").is_err());
        assert!(AggregateVersion::try_new("v").is_err());
        assert!(AggregateVersion::try_new("1").is_err());
        assert!(AggregateVersion::try_new("v1a").is_err());
        assert!(AggregateVersion::try_new("V1").is_err());
        assert!(AggregateVersion::try_new("v1").is_ok());
        assert!(AggregateVersion::try_new("v42").is_ok());
    }

    #[test]
    fn instance_id_rejects_specific_invalid_cases() {
        assert!(InstanceId::try_new("").is_err());
        assert!(InstanceId::try_new("   ").is_err());
        assert!(InstanceId::try_new("a".repeat(256)).is_err());
        assert!(InstanceId::try_new("a".repeat(255)).is_ok());
    }

    #[test]
    fn serde_is_transparent_for_ordering_tokens() {
        let position = Position::new(42);
        assert_eq!(serde_json::to_string(&position).unwrap(), "42");
        let sequence = Sequence::new(7);
        assert_eq!(serde_json::to_string(&sequence).unwrap(), "7");
    }
}
