//! Local write intents (flag, move, delete) and their delivery.
//!
//! Mutations are applied to the cache the moment they are submitted and
//! confirmed or rolled back once the server answers.

mod model;
mod queue;

pub use model::{
    Keyword, MAILBOX_FIELD, MutationId, MutationStatus, Operation, PendingMutation, Target,
};
pub use queue::{MutationHandle, MutationQueue};
