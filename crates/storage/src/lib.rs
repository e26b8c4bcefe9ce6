pub mod database;
pub mod depsgraph;
pub mod entity;
pub mod error;
pub mod relations;
pub mod remap;
pub mod scene;

pub use database::{Library, Main};
pub use depsgraph::DepsgraphState;
pub use entity::{Entity, EntityData, EntityKind, ObjectType, Pose};
pub use error::StorageError;
pub use relations::MainRelations;
pub use scene::Scene;
