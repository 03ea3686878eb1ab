//! User commands and their handlers.
//!
//! Every handler runs the same cycle: reload the write model, check
//! preconditions, push with the model's expectation, fold the committed
//! events back in, and answer with object details. The bounded retry wraps
//! the whole cycle, so a conflicted attempt decides again on fresh state.

use serde_json::Value;
use tracing::instrument;

use chronicle::command::to_payload;
use chronicle::{
    append_and_reduce, retry_command, AggregateEvents, AggregateId, Command, CommandError,
    CommandResult, EventType, Eventstore, InstanceId, ObjectDetails, ResourceOwner, RetryConfig,
    UniqueConstraint,
};

use super::events::{event_type, UserAdded, UserRenamed, USER_ADDED, USER_REMOVED, USER_RENAMED};
use super::model::UserModel;
use super::types::Username;

const USERNAME_CLAIM: &str = "username";
const USERNAME_TAKEN: &str = "username is already taken";

/// Creates the user and claims their username.
#[derive(Debug, Clone)]
pub struct AddUser {
    /// The claimed initial username.
    pub username: Username,
    /// Acting user or service.
    pub creator: String,
}

impl Command for AddUser {
    fn event_type(&self) -> EventType {
        event_type(USER_ADDED)
    }

    fn creator(&self) -> String {
        self.creator.clone()
    }

    fn payload(&self) -> Result<Option<Value>, serde_json::Error> {
        to_payload(&UserAdded {
            username: self.username.clone(),
        })
    }

    fn unique_constraints(&self) -> Vec<UniqueConstraint> {
        vec![UniqueConstraint::add(
            USERNAME_CLAIM,
            self.username.as_str(),
            USERNAME_TAKEN,
        )]
    }
}

/// Changes the username, freeing the old claim in the same push.
#[derive(Debug, Clone)]
pub struct RenameUser {
    /// The newly claimed username.
    pub username: Username,
    /// The username given up.
    pub previous: Username,
    /// Acting user or service.
    pub creator: String,
}

impl Command for RenameUser {
    fn event_type(&self) -> EventType {
        event_type(USER_RENAMED)
    }

    fn creator(&self) -> String {
        self.creator.clone()
    }

    fn payload(&self) -> Result<Option<Value>, serde_json::Error> {
        to_payload(&UserRenamed {
            username: self.username.clone(),
        })
    }

    fn unique_constraints(&self) -> Vec<UniqueConstraint> {
        vec![
            UniqueConstraint::remove(USERNAME_CLAIM, self.previous.as_str()),
            UniqueConstraint::add(USERNAME_CLAIM, self.username.as_str(), USERNAME_TAKEN),
        ]
    }
}

/// Deletes the user and frees their username.
#[derive(Debug, Clone)]
pub struct RemoveUser {
    /// The username given up.
    pub username: Username,
    /// Acting user or service.
    pub creator: String,
}

impl Command for RemoveUser {
    fn event_type(&self) -> EventType {
        event_type(USER_REMOVED)
    }

    fn creator(&self) -> String {
        self.creator.clone()
    }

    fn payload(&self) -> Result<Option<Value>, serde_json::Error> {
        Ok(None)
    }

    fn unique_constraints(&self) -> Vec<UniqueConstraint> {
        vec![UniqueConstraint::remove(USERNAME_CLAIM, self.username.as_str())]
    }
}

/// Creates a user, enforcing one username per tenant.
///
/// # Errors
///
/// [`CommandError::AlreadyExists`] when the id is taken or the username is
/// claimed, push and storage errors otherwise.
#[instrument(skip_all, fields(instance = %instance_id, user = %user_id))]
pub async fn add_user(
    eventstore: &Eventstore,
    instance_id: &InstanceId,
    resource_owner: &ResourceOwner,
    user_id: &AggregateId,
    username: &Username,
    creator: &str,
) -> CommandResult<ObjectDetails> {
    retry_command(&RetryConfig::default(), || async {
        let mut model = UserModel::load(eventstore, instance_id, user_id).await?;
        if model.exists() {
            return Err(CommandError::AlreadyExists("user already exists".to_owned()));
        }
        let events = eventstore
            .push(
                instance_id,
                vec![AggregateEvents::new(
                    model.aggregate(resource_owner.clone()),
                    model.model.expected_sequence(),
                )
                .command(AddUser {
                    username: username.clone(),
                    creator: creator.to_owned(),
                })],
            )
            .await
            .map_err(CommandError::from_push_error)?;
        append_and_reduce(&mut model, &events)?;
        Ok(model.model.details())
    })
    .await
}

/// Renames a user; the old username is claimable again once this returns.
///
/// # Errors
///
/// [`CommandError::NotFound`] for unknown or removed users,
/// [`CommandError::PreconditionFailed`] when the name is unchanged,
/// [`CommandError::AlreadyExists`] when the new name is claimed.
#[instrument(skip_all, fields(instance = %instance_id, user = %user_id))]
pub async fn rename_user(
    eventstore: &Eventstore,
    instance_id: &InstanceId,
    user_id: &AggregateId,
    username: &Username,
    creator: &str,
) -> CommandResult<ObjectDetails> {
    retry_command(&RetryConfig::default(), || async {
        let mut model = UserModel::load(eventstore, instance_id, user_id).await?;
        let Some(previous) = model.username.clone() else {
            return Err(CommandError::NotFound("user not found".to_owned()));
        };
        if previous == *username {
            return Err(CommandError::PreconditionFailed(
                "username is unchanged".to_owned(),
            ));
        }
        let owner = current_owner(&model)?;
        let events = eventstore
            .push(
                instance_id,
                vec![AggregateEvents::new(
                    model.aggregate(owner),
                    model.model.expected_sequence(),
                )
                .command(RenameUser {
                    username: username.clone(),
                    previous,
                    creator: creator.to_owned(),
                })],
            )
            .await
            .map_err(CommandError::from_push_error)?;
        append_and_reduce(&mut model, &events)?;
        Ok(model.model.details())
    })
    .await
}

/// Removes a user and frees their username.
///
/// # Errors
///
/// [`CommandError::NotFound`] for unknown or removed users, push and storage
/// errors otherwise.
#[instrument(skip_all, fields(instance = %instance_id, user = %user_id))]
pub async fn remove_user(
    eventstore: &Eventstore,
    instance_id: &InstanceId,
    user_id: &AggregateId,
    creator: &str,
) -> CommandResult<ObjectDetails> {
    retry_command(&RetryConfig::default(), || async {
        let mut model = UserModel::load(eventstore, instance_id, user_id).await?;
        let Some(username) = model.username.clone() else {
            return Err(CommandError::NotFound("user not found".to_owned()));
        };
        let owner = current_owner(&model)?;
        let events = eventstore
            .push(
                instance_id,
                vec![AggregateEvents::new(
                    model.aggregate(owner),
                    model.model.expected_sequence(),
                )
                .command(RemoveUser {
                    username,
                    creator: creator.to_owned(),
                })],
            )
            .await
            .map_err(CommandError::from_push_error)?;
        append_and_reduce(&mut model, &events)?;
        Ok(model.model.details())
    })
    .await
}

fn current_owner(model: &UserModel) -> CommandResult<ResourceOwner> {
    model
        .model
        .resource_owner
        .clone()
        .ok_or_else(|| CommandError::NotFound("user not found".to_owned()))
}
