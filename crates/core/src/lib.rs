pub mod error;
pub mod flags;
pub mod ids;
pub mod lookup;
pub mod operation;
pub mod overrides;
pub mod path;
pub mod property;

pub use error::CoreError;
pub use flags::*;
pub use ids::*;
pub use lookup::IdLookup;
pub use operation::{Operation, OperationKind, SubItem};
pub use overrides::{OperationEntry, OverrideContainer, PropertyOverride};
pub use path::{PathSegment, PropertyPath};
pub use property::{CollectionItem, Property, PropertyKind, PropertyTree, PropertyValue};
