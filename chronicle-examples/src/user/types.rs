//! Domain types of the user aggregate.

use chronicle::AggregateId;
use nutype::nutype;
use uuid::Uuid;

/// A login name, normalized to lowercase. The unique key a user claims.
#[nutype(
    sanitize(trim, lowercase),
    validate(not_empty, len_char_max = 200),
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
        Deserialize,
    )
)]
pub struct Username(String);

/// A fresh, time-ordered aggregate id for a new user.
#[must_use]
pub fn new_user_id() -> AggregateId {
    AggregateId::try_new(Uuid::now_v7().to_string()).expect("UUIDs are valid aggregate ids")
}
