//! Core data types shared by every engine component.

mod change_set;
mod entity;
mod scope;

pub use change_set::ChangeSet;
pub use entity::{CachedEntity, Entity, EntityId, EntityKind, Fields};
pub use scope::{AccountId, Collection, StateToken, SyncScope};
