//! A minimal user aggregate where usernames are unique per tenant.
//!
//! Renaming a user frees the old username in the same push that claims the
//! new one, so a freed name is claimable the moment the rename commits.

pub mod commands;
pub mod events;
pub mod model;
pub mod projection;
pub mod types;

pub use commands::{add_user, remove_user, rename_user, AddUser, RemoveUser, RenameUser};
pub use events::{user_aggregate_type, UserEvent, USER_ADDED, USER_REMOVED, USER_RENAMED};
pub use model::UserModel;
pub use projection::{UsersProjection, USERS_TABLE};
pub use types::{new_user_id, Username};
