use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::fmt;

use crate::flags::PropertyFlags;
use crate::ids::EntityId;
use crate::path::{PathSegment, PropertyPath};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum PropertyKind {
    Bool,
    Int,
    Float,
    Text,
    FloatArray,
    Pointer,
    IdCollection,
    Collection,
}

impl PropertyKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Bool => "bool",
            Self::Int => "int",
            Self::Float => "float",
            Self::Text => "text",
            Self::FloatArray => "float_array",
            Self::Pointer => "pointer",
            Self::IdCollection => "id_collection",
            Self::Collection => "collection",
        }
    }

    pub fn is_pointer_like(&self) -> bool {
        matches!(self, Self::Pointer | Self::IdCollection | Self::Collection)
    }
}

impl fmt::Display for PropertyKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub enum PropertyValue {
    Bool(bool),
    Int(i64),
    Float(f64),
    Text(String),
    FloatArray(Vec<f64>),
    Pointer(Option<EntityId>),
    /// Ordered references to other entities, keyed by the target's name.
    IdCollection(Vec<EntityId>),
    /// Ordered named sub-structures.
    Collection(Vec<CollectionItem>),
}

impl PartialEq for PropertyValue {
    fn eq(&self, other: &Self) -> bool {
        match (self, other) {
            (Self::Bool(a), Self::Bool(b)) => a == b,
            (Self::Int(a), Self::Int(b)) => a == b,
            (Self::Float(a), Self::Float(b)) => a.total_cmp(b).is_eq(),
            (Self::Text(a), Self::Text(b)) => a == b,
            (Self::FloatArray(a), Self::FloatArray(b)) => {
                a.len() == b.len() && a.iter().zip(b).all(|(x, y)| x.total_cmp(y).is_eq())
            }
            (Self::Pointer(a), Self::Pointer(b)) => a == b,
            (Self::IdCollection(a), Self::IdCollection(b)) => a == b,
            (Self::Collection(a), Self::Collection(b)) => a == b,
            _ => false,
        }
    }
}

impl PropertyValue {
    pub fn kind(&self) -> PropertyKind {
        match self {
            Self::Bool(_) => PropertyKind::Bool,
            Self::Int(_) => PropertyKind::Int,
            Self::Float(_) => PropertyKind::Float,
            Self::Text(_) => PropertyKind::Text,
            Self::FloatArray(_) => PropertyKind::FloatArray,
            Self::Pointer(_) => PropertyKind::Pointer,
            Self::IdCollection(_) => PropertyKind::IdCollection,
            Self::Collection(_) => PropertyKind::Collection,
        }
    }

    pub fn as_pointer(&self) -> Option<Option<EntityId>> {
        match self {
            Self::Pointer(target) => Some(*target),
            _ => None,
        }
    }

    pub fn as_id_collection(&self) -> Option<&[EntityId]> {
        match self {
            Self::IdCollection(ids) => Some(ids),
            _ => None,
        }
    }

    pub fn as_collection(&self) -> Option<&[CollectionItem]> {
        match self {
            Self::Collection(items) => Some(items),
            _ => None,
        }
    }

    pub fn as_float(&self) -> Option<f64> {
        match self {
            Self::Float(v) => Some(*v),
            _ => None,
        }
    }

    pub fn as_int(&self) -> Option<i64> {
        match self {
            Self::Int(v) => Some(*v),
            _ => None,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CollectionItem {
    pub name: String,
    pub fields: PropertyTree,
}

impl CollectionItem {
    pub fn new(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            fields: PropertyTree::new(),
        }
    }

    pub fn with_field(mut self, key: impl Into<String>, value: PropertyValue) -> Self {
        self.fields.insert(key, value);
        self
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Property {
    pub value: PropertyValue,
    pub flags: PropertyFlags,
}

impl Property {
    pub fn is_overridable(&self) -> bool {
        self.flags.contains(PropertyFlags::OVERRIDABLE)
    }
}

/// Ordered map of named properties making up an entity's payload.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct PropertyTree {
    props: BTreeMap<String, Property>,
}

impl PropertyTree {
    pub fn new() -> Self {
        Self::default()
    }

    /// Insert an overridable property, replacing any previous value and flags.
    pub fn insert(&mut self, key: impl Into<String>, value: PropertyValue) {
        self.insert_with_flags(key, value, PropertyFlags::OVERRIDABLE);
    }

    pub fn insert_with_flags(
        &mut self,
        key: impl Into<String>,
        value: PropertyValue,
        flags: PropertyFlags,
    ) {
        self.props.insert(key.into(), Property { value, flags });
    }

    /// Set the value of an existing property, keeping its flags.
    /// Inserts an overridable property when the key is new.
    pub fn set(&mut self, key: &str, value: PropertyValue) {
        match self.props.get_mut(key) {
            Some(prop) => prop.value = value,
            None => self.insert(key, value),
        }
    }

    pub fn get(&self, key: &str) -> Option<&Property> {
        self.props.get(key)
    }

    pub fn get_mut(&mut self, key: &str) -> Option<&mut Property> {
        self.props.get_mut(key)
    }

    pub fn value(&self, key: &str) -> Option<&PropertyValue> {
        self.props.get(key).map(|p| &p.value)
    }

    pub fn remove(&mut self, key: &str) -> Option<Property> {
        self.props.remove(key)
    }

    pub fn iter(&self) -> impl Iterator<Item = (&str, &Property)> {
        self.props.iter().map(|(k, v)| (k.as_str(), v))
    }

    pub fn len(&self) -> usize {
        self.props.len()
    }

    pub fn is_empty(&self) -> bool {
        self.props.is_empty()
    }

    /// Resolve a structural path to the property it designates.
    pub fn resolve(&self, path: &PropertyPath) -> Option<&Property> {
        let (last, parents) = path.segments().split_last()?;
        let mut tree = self;
        for segment in parents {
            tree = tree.descend(segment)?;
        }
        if last.item.is_some() {
            return None;
        }
        tree.props.get(&last.key)
    }

    pub fn resolve_mut(&mut self, path: &PropertyPath) -> Option<&mut Property> {
        let (last, parents) = path.segments().split_last()?;
        let mut tree = self;
        for segment in parents {
            tree = tree.descend_mut(segment)?;
        }
        if last.item.is_some() {
            return None;
        }
        tree.props.get_mut(&last.key)
    }

    fn descend(&self, segment: &PathSegment) -> Option<&PropertyTree> {
        let item_name = segment.item.as_deref()?;
        let items = self.props.get(&segment.key)?.value.as_collection()?;
        items
            .iter()
            .find(|item| item.name == item_name)
            .map(|item| &item.fields)
    }

    fn descend_mut(&mut self, segment: &PathSegment) -> Option<&mut PropertyTree> {
        let item_name = segment.item.as_deref()?;
        match &mut self.props.get_mut(&segment.key)?.value {
            PropertyValue::Collection(items) => items
                .iter_mut()
                .find(|item| item.name == item_name)
                .map(|item| &mut item.fields),
            _ => None,
        }
    }

    /// Visit every entity referenced from this tree, depth first, with the flags of
    /// the property holding the reference.
    pub fn visit_ids(&self, visit: &mut impl FnMut(EntityId, PropertyFlags)) {
        for prop in self.props.values() {
            match &prop.value {
                PropertyValue::Pointer(Some(id)) => visit(*id, prop.flags),
                PropertyValue::IdCollection(ids) => {
                    for id in ids {
                        visit(*id, prop.flags);
                    }
                }
                PropertyValue::Collection(items) => {
                    for item in items {
                        item.fields.visit_ids(visit);
                    }
                }
                _ => {}
            }
        }
    }

    /// Replace every reference to `old`, at any depth, by `new`.
    ///
    /// `skip` is consulted with the holding property's flags and may veto the change.
    /// A `None` replacement clears pointers and drops collection entries; an
    /// ID collection never ends up holding the same entity twice.
    pub fn replace_id(
        &mut self,
        old: EntityId,
        new: Option<EntityId>,
        skip: &impl Fn(PropertyFlags) -> bool,
    ) -> usize {
        let mut count = 0;
        for prop in self.props.values_mut() {
            if skip(prop.flags) {
                continue;
            }
            match &mut prop.value {
                PropertyValue::Pointer(target) if *target == Some(old) => {
                    *target = new;
                    count += 1;
                }
                PropertyValue::IdCollection(ids) => {
                    let Some(pos) = ids.iter().position(|id| *id == old) else {
                        continue;
                    };
                    match new {
                        Some(new) if !ids.contains(&new) => ids[pos] = new,
                        _ => {
                            ids.remove(pos);
                        }
                    }
                    count += 1;
                }
                PropertyValue::Collection(items) => {
                    for item in items.iter_mut() {
                        count += item.fields.replace_id(old, new, skip);
                    }
                }
                _ => {}
            }
        }
        count
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn rig_tree(shape: EntityId) -> PropertyTree {
        let mut tree = PropertyTree::new();
        tree.insert("location", PropertyValue::FloatArray(vec![0.0, 1.0, 2.0]));
        tree.insert(
            "pose_bones",
            PropertyValue::Collection(vec![
                CollectionItem::new("Root").with_field("custom_shape", PropertyValue::Pointer(None)),
                CollectionItem::new("Hand")
                    .with_field("custom_shape", PropertyValue::Pointer(Some(shape))),
            ]),
        );
        tree
    }

    #[test]
    fn resolve_nested_item_field() -> Result<(), crate::CoreError> {
        let shape = EntityId::new();
        let tree = rig_tree(shape);

        let path = PropertyPath::parse(r#"pose_bones["Hand"].custom_shape"#)?;
        let prop = tree.resolve(&path).expect("resolves");
        assert_eq!(prop.value, PropertyValue::Pointer(Some(shape)));

        let missing = PropertyPath::parse(r#"pose_bones["Foot"].custom_shape"#)?;
        assert!(tree.resolve(&missing).is_none());

        // A path ending on an item designates no property.
        let item_only = PropertyPath::parse(r#"pose_bones["Hand"]"#)?;
        assert!(tree.resolve(&item_only).is_none());
        Ok(())
    }

    #[test]
    fn visit_ids_reaches_nested_pointers() {
        let shape = EntityId::new();
        let member = EntityId::new();
        let mut tree = rig_tree(shape);
        tree.insert("objects", PropertyValue::IdCollection(vec![member]));

        let mut seen = Vec::new();
        tree.visit_ids(&mut |id, _| seen.push(id));
        assert_eq!(seen.len(), 2);
        assert!(seen.contains(&shape));
        assert!(seen.contains(&member));
    }

    #[test]
    fn replace_id_never_duplicates_collection_entries() {
        let a = EntityId::new();
        let b = EntityId::new();
        let mut tree = PropertyTree::new();
        tree.insert("objects", PropertyValue::IdCollection(vec![a, b]));
        tree.insert("parent", PropertyValue::Pointer(Some(a)));

        let count = tree.replace_id(a, Some(b), &|_| false);
        assert_eq!(count, 2);
        assert_eq!(tree.value("objects"), Some(&PropertyValue::IdCollection(vec![b])));
        assert_eq!(tree.value("parent"), Some(&PropertyValue::Pointer(Some(b))));
    }

    #[test]
    fn replace_id_honours_skip_predicate() {
        let owner = EntityId::new();
        let mut tree = PropertyTree::new();
        tree.insert_with_flags(
            "from",
            PropertyValue::Pointer(Some(owner)),
            PropertyFlags::LOOPBACK,
        );

        let count = tree.replace_id(owner, None, &|flags| flags.contains(PropertyFlags::LOOPBACK));
        assert_eq!(count, 0);
        assert_eq!(tree.value("from"), Some(&PropertyValue::Pointer(Some(owner))));
    }
}
