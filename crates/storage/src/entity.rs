use std::fmt;

use liboverride_core::{
    CollectionItem, EntityId, EntityTags, LibraryId, LinkFlags, OverrideContainer, PropertyFlags,
    PropertyTree, PropertyValue,
};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ObjectType {
    Empty,
    Mesh,
    Armature,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum EntityKind {
    Object(ObjectType),
    Collection,
    Armature,
    Mesh,
    Material,
    ShapeKey,
    /// Linkable data the database cannot duplicate.
    Opaque,
}

impl EntityKind {
    /// Names are unique per class and library; all object types share one class.
    pub fn class(&self) -> &'static str {
        match self {
            Self::Object(_) => "object",
            Self::Collection => "collection",
            Self::Armature => "armature",
            Self::Mesh => "mesh",
            Self::Material => "material",
            Self::ShapeKey => "shape_key",
            Self::Opaque => "opaque",
        }
    }

    pub fn is_object(&self) -> bool {
        matches!(self, Self::Object(_))
    }

    pub fn is_collection(&self) -> bool {
        matches!(self, Self::Collection)
    }

    pub fn is_armature_object(&self) -> bool {
        matches!(self, Self::Object(ObjectType::Armature))
    }

    /// Shape keys are only ever overridden together with their owner.
    pub fn is_linkable(&self) -> bool {
        !matches!(self, Self::ShapeKey)
    }

    pub fn is_copyable(&self) -> bool {
        !matches!(self, Self::Opaque)
    }

    pub fn default_properties(&self) -> PropertyTree {
        let mut tree = PropertyTree::new();
        match self {
            Self::Object(object_type) => {
                tree.insert("data", PropertyValue::Pointer(None));
                tree.insert("parent", PropertyValue::Pointer(None));
                tree.insert("location", PropertyValue::FloatArray(vec![0.0; 3]));
                tree.insert("instance_collection", PropertyValue::Pointer(None));
                tree.insert_with_flags("pass_index", PropertyValue::Int(0), PropertyFlags::empty());
                if *object_type == ObjectType::Armature {
                    tree.insert("pose_bones", PropertyValue::Collection(Vec::new()));
                }
            }
            Self::Collection => {
                tree.insert("objects", PropertyValue::IdCollection(Vec::new()));
                tree.insert("children", PropertyValue::IdCollection(Vec::new()));
                tree.insert("hide_viewport", PropertyValue::Bool(false));
                tree.insert("hide_render", PropertyValue::Bool(false));
            }
            Self::Armature => {
                tree.insert_with_flags(
                    "bones",
                    PropertyValue::Collection(Vec::new()),
                    PropertyFlags::empty(),
                );
            }
            Self::Mesh => {
                tree.insert("material", PropertyValue::Pointer(None));
                tree.insert_with_flags("vertex_count", PropertyValue::Int(0), PropertyFlags::empty());
            }
            Self::Material => {
                tree.insert("color", PropertyValue::FloatArray(vec![0.8, 0.8, 0.8, 1.0]));
                tree.insert("roughness", PropertyValue::Float(0.5));
            }
            Self::ShapeKey => {
                tree.insert("eval_time", PropertyValue::Float(0.0));
            }
            Self::Opaque => {
                tree.insert("payload", PropertyValue::Int(0));
            }
        }
        tree
    }
}

impl fmt::Display for EntityKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Object(ObjectType::Empty) => f.write_str("object(empty)"),
            Self::Object(ObjectType::Mesh) => f.write_str("object(mesh)"),
            Self::Object(ObjectType::Armature) => f.write_str("object(armature)"),
            other => f.write_str(other.class()),
        }
    }
}

/// Evaluated pose cache of an armature object.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct Pose {
    /// Bone data changed underneath the pose; it must be rebuilt before use.
    pub recalc: bool,
}

/// The swappable part of an entity.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct EntityData {
    pub properties: PropertyTree,
    pub shape_key: Option<EntityId>,
    /// Back-reference from a shape key to the entity owning it.
    pub owner: Option<EntityId>,
    pub pose: Option<Pose>,
}

#[derive(Debug, Clone)]
pub struct Entity {
    pub id: EntityId,
    pub kind: EntityKind,
    pub(crate) name: String,
    pub library: Option<LibraryId>,
    pub tags: EntityTags,
    /// Transient link to the entity replacing this one during bulk remaps.
    pub new_entity: Option<EntityId>,
    pub override_library: Option<OverrideContainer>,
    /// Embedded data overridden along with its owner (shape keys).
    pub embedded_override: bool,
    /// Number of override containers referencing this entity.
    pub users: u32,
    pub data: EntityData,
}

impl Entity {
    pub(crate) fn new(kind: EntityKind, name: String, library: Option<LibraryId>) -> Self {
        let pose = kind.is_armature_object().then(Pose::default);
        Self {
            id: EntityId::new(),
            kind,
            name,
            library,
            tags: EntityTags::empty(),
            new_entity: None,
            override_library: None,
            embedded_override: false,
            users: 0,
            data: EntityData {
                properties: kind.default_properties(),
                shape_key: None,
                owner: None,
                pose,
            },
        }
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn is_linked(&self) -> bool {
        self.library.is_some()
    }

    pub fn is_missing(&self) -> bool {
        self.tags.contains(EntityTags::MISSING)
    }

    /// Has an override container, or is embedded data overridden with its owner.
    pub fn is_override(&self) -> bool {
        self.override_library.is_some() || self.embedded_override
    }

    pub fn is_override_real(&self) -> bool {
        self.override_reference().is_some()
    }

    pub fn is_override_template(&self) -> bool {
        self.override_library
            .as_ref()
            .is_some_and(OverrideContainer::is_template)
    }

    pub fn override_reference(&self) -> Option<EntityId> {
        self.override_library.as_ref().and_then(|c| c.reference)
    }

    /// Every outgoing link of this entity.
    pub fn links(&self) -> Vec<(EntityId, LinkFlags)> {
        let mut links = Vec::new();
        self.data
            .properties
            .visit_ids(&mut |id, flags| links.push((id, LinkFlags::from(flags))));
        if let Some(key) = self.data.shape_key {
            links.push((key, LinkFlags::empty()));
        }
        if let Some(owner) = self.data.owner {
            links.push((owner, LinkFlags::LOOPBACK));
        }
        if let Some(reference) = self.override_reference() {
            links.push((reference, LinkFlags::OVERRIDE_REFERENCE));
        }
        links
    }

    pub fn pointer(&self, key: &str) -> Option<EntityId> {
        self.data.properties.value(key)?.as_pointer().flatten()
    }

    pub fn id_collection(&self, key: &str) -> &[EntityId] {
        self.data
            .properties
            .value(key)
            .and_then(PropertyValue::as_id_collection)
            .unwrap_or(&[])
    }

    pub fn collection_items(&self, key: &str) -> &[CollectionItem] {
        self.data
            .properties
            .value(key)
            .and_then(PropertyValue::as_collection)
            .unwrap_or(&[])
    }
}
