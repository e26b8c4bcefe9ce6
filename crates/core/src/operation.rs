use serde::{Deserialize, Serialize};
use std::fmt;

use crate::flags::{OperationFlags, OverrideTags};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum OperationKind {
    Noop,
    Replace,
    InsertBefore,
    InsertAfter,
    Add,
    Subtract,
    Multiply,
}

impl OperationKind {
    /// Kinds whose application needs the differential storage operand.
    pub fn is_differential(&self) -> bool {
        matches!(self, Self::Add | Self::Subtract | Self::Multiply)
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Noop => "noop",
            Self::Replace => "replace",
            Self::InsertBefore => "insert_before",
            Self::InsertAfter => "insert_after",
            Self::Add => "add",
            Self::Subtract => "subtract",
            Self::Multiply => "multiply",
        }
    }
}

impl fmt::Display for OperationKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Discriminates which element of a collection property an operation targets.
/// An index of `-1` means "any".
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct SubItem {
    pub reference_name: Option<String>,
    pub local_name: Option<String>,
    pub reference_index: i32,
    pub local_index: i32,
}

impl SubItem {
    pub const ANY_INDEX: i32 = -1;

    /// The whole property, no sub-item.
    pub fn whole() -> Self {
        Self {
            reference_name: None,
            local_name: None,
            reference_index: Self::ANY_INDEX,
            local_index: Self::ANY_INDEX,
        }
    }

    pub fn named(reference_name: Option<&str>, local_name: Option<&str>) -> Self {
        Self {
            reference_name: reference_name.map(str::to_string),
            local_name: local_name.map(str::to_string),
            ..Self::whole()
        }
    }

    pub fn indexed(reference_index: i32, local_index: i32) -> Self {
        Self {
            reference_index,
            local_index,
            ..Self::whole()
        }
    }

    pub fn with_indices(mut self, reference_index: i32, local_index: i32) -> Self {
        self.reference_index = reference_index;
        self.local_index = local_index;
        self
    }
}

impl Default for SubItem {
    fn default() -> Self {
        Self::whole()
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Operation {
    pub kind: OperationKind,
    pub subitem: SubItem,
    pub flags: OperationFlags,
    pub tags: OverrideTags,
}

impl Operation {
    pub fn new(kind: OperationKind, subitem: SubItem) -> Self {
        Self {
            kind,
            subitem,
            flags: OperationFlags::empty(),
            tags: OverrideTags::empty(),
        }
    }

    pub fn is_unused(&self) -> bool {
        self.tags.contains(OverrideTags::UNUSED)
    }
}
