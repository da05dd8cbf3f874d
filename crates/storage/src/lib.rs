//! Content stores for depot.
//!
//! Stores are addressed by [`StoreKey`]: hosted and remote stores implement
//! [`ContentStore`], groups are [`GroupDefinition`]s held by the
//! [`StoreRegistry`], which also announces every change on the [`EventBus`].

pub mod error;
pub mod event;
mod group;
mod key;
mod models;
mod path;
pub mod promote;
mod registry;
pub mod store;

pub use crate::event::{EventBus, StoreEvent};
pub use crate::group::GroupDefinition;
pub use crate::key::{StoreKey, StoreType};
pub use crate::models::FileInfo;
pub use crate::path::{ContentPath, validate as validate_path};
pub use crate::registry::StoreRegistry;
#[cfg(any(test, feature = "mock"))]
pub use crate::store::MemoryStore;
pub use crate::store::{ContentStore, LocalStore};
use std::sync::Arc;

pub type StoreHandle = Arc<dyn ContentStore>;
