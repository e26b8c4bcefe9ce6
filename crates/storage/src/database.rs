use std::collections::HashMap;
use std::mem;

use tracing::debug;

use liboverride_core::{EntityId, EntityTags, IdLookup, IdSet, LibraryId};

use crate::depsgraph::DepsgraphState;
use crate::entity::{Entity, EntityData, EntityKind};
use crate::error::StorageError;
use crate::scene::Scene;

#[derive(Debug, Clone)]
pub struct Library {
    pub id: LibraryId,
    pub name: String,
}

/// In-memory entity database.
///
/// Iteration follows database order, which callers may reorganize with
/// [`Main::swap_order`].
pub struct Main {
    entities: HashMap<EntityId, Entity>,
    order: Vec<EntityId>,
    libraries: HashMap<LibraryId, Library>,
    pub(crate) scene: Scene,
    pub(crate) depsgraph: DepsgraphState,
}

impl Default for Main {
    fn default() -> Self {
        Self::new()
    }
}

impl Main {
    pub fn new() -> Self {
        let master = Entity::new(EntityKind::Collection, "Scene Collection".into(), None);
        let master_id = master.id;
        let mut main = Self {
            entities: HashMap::new(),
            order: Vec::new(),
            libraries: HashMap::new(),
            scene: Scene {
                master_collection: master_id,
            },
            depsgraph: DepsgraphState::default(),
        };
        main.order.push(master_id);
        main.entities.insert(master_id, master);
        main
    }

    // ==========================================================================
    // Libraries
    // ==========================================================================

    pub fn add_library(&mut self, name: &str) -> LibraryId {
        let id = LibraryId::new();
        self.libraries.insert(
            id,
            Library {
                id,
                name: name.to_string(),
            },
        );
        id
    }

    pub fn library(&self, id: LibraryId) -> Result<&Library, StorageError> {
        self.libraries.get(&id).ok_or(StorageError::LibraryNotFound(id))
    }

    // ==========================================================================
    // Entities
    // ==========================================================================

    /// Add an entity with the default properties of its kind. The name is made unique
    /// within the kind's class and library.
    pub fn add_entity(
        &mut self,
        kind: EntityKind,
        name: &str,
        library: Option<LibraryId>,
    ) -> Result<EntityId, StorageError> {
        if let Some(lib) = library {
            self.library(lib)?;
        }
        let name = self.unique_name(kind, library, name, None);
        let entity = Entity::new(kind, name, library);
        let id = entity.id;
        debug!(entity = %id, name = %entity.name, kind = %kind, "add entity");
        self.order.push(id);
        self.entities.insert(id, entity);
        Ok(id)
    }

    /// Create a shape key owned by `owner`, in the owner's library.
    pub fn add_shape_key(&mut self, owner: EntityId) -> Result<EntityId, StorageError> {
        let (library, owner_name) = {
            let owner = self.entity(owner)?;
            (owner.library, owner.name.clone())
        };
        let key = self.add_entity(EntityKind::ShapeKey, &format!("Key {owner_name}"), library)?;
        self.entity_mut(key)?.data.owner = Some(owner);
        self.entity_mut(owner)?.data.shape_key = Some(key);
        Ok(key)
    }

    pub fn contains(&self, id: EntityId) -> bool {
        self.entities.contains_key(&id)
    }

    pub fn get(&self, id: EntityId) -> Option<&Entity> {
        self.entities.get(&id)
    }

    pub fn get_mut(&mut self, id: EntityId) -> Option<&mut Entity> {
        self.entities.get_mut(&id)
    }

    pub fn entity(&self, id: EntityId) -> Result<&Entity, StorageError> {
        self.entities.get(&id).ok_or(StorageError::EntityNotFound(id))
    }

    pub fn entity_mut(&mut self, id: EntityId) -> Result<&mut Entity, StorageError> {
        self.entities
            .get_mut(&id)
            .ok_or(StorageError::EntityNotFound(id))
    }

    /// Entity ids in database order.
    pub fn ids(&self) -> Vec<EntityId> {
        self.order.clone()
    }

    pub fn iter(&self) -> impl Iterator<Item = &Entity> {
        self.order.iter().filter_map(|id| self.entities.get(id))
    }

    pub fn len(&self) -> usize {
        self.order.len()
    }

    pub fn is_empty(&self) -> bool {
        self.order.is_empty()
    }

    /// Name of `id` for messages, falling back to the id itself.
    pub fn name_or_id(&self, id: EntityId) -> String {
        self.entities
            .get(&id)
            .map(|e| e.name.clone())
            .unwrap_or_else(|| id.to_string())
    }

    pub fn find_by_name(
        &self,
        kind: EntityKind,
        library: Option<LibraryId>,
        name: &str,
    ) -> Option<EntityId> {
        self.iter()
            .find(|e| e.kind.class() == kind.class() && e.library == library && e.name == name)
            .map(|e| e.id)
    }

    fn unique_name(
        &self,
        kind: EntityKind,
        library: Option<LibraryId>,
        base: &str,
        exclude: Option<EntityId>,
    ) -> String {
        let taken = |candidate: &str| {
            self.entities.values().any(|e| {
                Some(e.id) != exclude
                    && e.kind.class() == kind.class()
                    && e.library == library
                    && e.name == candidate
            })
        };
        if !taken(base) {
            return base.to_string();
        }

        // Strip an existing numeric suffix so "Cube.001" yields "Cube.002".
        let stem = match base.rsplit_once('.') {
            Some((stem, suffix)) if suffix.len() == 3 && suffix.bytes().all(|b| b.is_ascii_digit()) => {
                stem
            }
            _ => base,
        };
        (1..)
            .map(|n| format!("{stem}.{n:03}"))
            .find(|candidate| !taken(candidate))
            .unwrap_or_else(|| base.to_string())
    }

    /// Rename `id`, adjusting the name for uniqueness. Returns the name actually set.
    pub fn rename(&mut self, id: EntityId, name: &str) -> Result<String, StorageError> {
        let (kind, library) = {
            let entity = self.entity(id)?;
            (entity.kind, entity.library)
        };
        let name = self.unique_name(kind, library, name, Some(id));
        self.entity_mut(id)?.name = name.clone();
        Ok(name)
    }

    /// Set a name without the uniqueness check. Only for transient entities.
    pub fn set_name_unchecked(&mut self, id: EntityId, name: &str) -> Result<(), StorageError> {
        self.entity_mut(id)?.name = name.to_string();
        Ok(())
    }

    pub fn swap_names(&mut self, a: EntityId, b: EntityId) -> Result<(), StorageError> {
        let name_a = mem::take(&mut self.entity_mut(a)?.name);
        let name_b = mem::replace(&mut self.entity_mut(b)?.name, name_a);
        self.entity_mut(a)?.name = name_b;
        Ok(())
    }

    pub fn swap_order(&mut self, a: EntityId, b: EntityId) -> Result<(), StorageError> {
        let pos_a = self
            .order
            .iter()
            .position(|id| *id == a)
            .ok_or(StorageError::EntityNotFound(a))?;
        let pos_b = self
            .order
            .iter()
            .position(|id| *id == b)
            .ok_or(StorageError::EntityNotFound(b))?;
        self.order.swap(pos_a, pos_b);
        Ok(())
    }

    /// Exchange the payloads of two entities; headers stay in place.
    pub fn swap_payload(&mut self, a: EntityId, b: EntityId) -> Result<(), StorageError> {
        if a == b {
            return Ok(());
        }
        let data_a = mem::take(&mut self.entity_mut(a)?.data);
        let data_b = mem::replace(&mut self.entity_mut(b)?.data, data_a);
        self.entity_mut(a)?.data = data_b;
        Ok(())
    }

    /// Local deep copy of `id`, including its shape key.
    pub fn copy_entity(&mut self, id: EntityId) -> Result<EntityId, StorageError> {
        let source = self.entity(id)?;
        if !source.kind.is_copyable() {
            return Err(StorageError::NotCopyable {
                name: source.name.clone(),
                kind: source.kind.to_string(),
            });
        }
        let kind = source.kind;
        let name = source.name.clone();
        let data = source.data.clone();
        let source_key = source.data.shape_key;

        let name = self.unique_name(kind, None, &name, None);
        let mut copy = Entity::new(kind, name, None);
        copy.data = EntityData {
            shape_key: None,
            owner: None,
            ..data
        };
        let copy_id = copy.id;
        self.order.push(copy_id);
        self.entities.insert(copy_id, copy);

        if let Some(key) = source_key {
            let key_copy = self.copy_entity(key)?;
            self.entity_mut(key_copy)?.data.owner = Some(copy_id);
            self.entity_mut(copy_id)?.data.shape_key = Some(key_copy);
        }

        debug!(source = %id, copy = %copy_id, "copied entity");
        Ok(copy_id)
    }

    pub fn id_us_plus(&mut self, id: EntityId) {
        if let Some(entity) = self.entities.get_mut(&id) {
            entity.users += 1;
        }
    }

    pub fn id_us_min(&mut self, id: EntityId) {
        if let Some(entity) = self.entities.get_mut(&id) {
            entity.users = entity.users.saturating_sub(1);
        }
    }

    /// Delete every entity in `ids` in one pass, along with the shape keys they own.
    ///
    /// Remaining links to deleted entities are cleared and override-reference user
    /// counts released. Returns the number of deleted entities.
    pub fn delete_batch(&mut self, ids: &IdSet) -> usize {
        let mut doomed: IdSet = ids.iter().copied().filter(|id| self.contains(*id)).collect();
        let keys: Vec<EntityId> = doomed
            .iter()
            .filter_map(|id| self.entities.get(id).and_then(|e| e.data.shape_key))
            .collect();
        doomed.extend(keys);

        for id in &doomed {
            if let Some(reference) = self.entities.get(id).and_then(Entity::override_reference) {
                if !doomed.contains(&reference) {
                    self.id_us_min(reference);
                }
            }
        }

        for entity in self.entities.values_mut() {
            if doomed.contains(&entity.id) {
                continue;
            }
            for id in &doomed {
                entity.data.properties.replace_id(*id, None, &|_| false);
            }
            if entity.data.shape_key.is_some_and(|k| doomed.contains(&k)) {
                entity.data.shape_key = None;
            }
            if entity.data.owner.is_some_and(|o| doomed.contains(&o)) {
                entity.data.owner = None;
            }
            if entity.new_entity.is_some_and(|n| doomed.contains(&n)) {
                entity.new_entity = None;
            }
        }

        self.order.retain(|id| !doomed.contains(id));
        self.entities.retain(|id, _| !doomed.contains(id));
        self.depsgraph.forget(&doomed);
        self.depsgraph.tag_relations_update();

        debug!(count = doomed.len(), "deleted entities");
        doomed.len()
    }

    // ==========================================================================
    // Bulk tag helpers
    // ==========================================================================

    pub fn clear_new_entities(&mut self) {
        for entity in self.entities.values_mut() {
            entity.new_entity = None;
        }
    }

    pub fn tag_all(&mut self, tag: EntityTags, value: bool) {
        for entity in self.entities.values_mut() {
            entity.tags.set(tag, value);
        }
    }
}

impl IdLookup for Main {
    fn name_of(&self, id: EntityId) -> Option<&str> {
        self.entities.get(&id).map(Entity::name)
    }

    fn override_reference_of(&self, id: EntityId) -> Option<EntityId> {
        self.entities.get(&id).and_then(Entity::override_reference)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::entity::ObjectType;
    use liboverride_core::PropertyValue;

    #[test]
    fn names_are_unique_per_class_and_library() -> Result<(), StorageError> {
        let mut main = Main::new();
        let lib = main.add_library("rig.blend");

        let a = main.add_entity(EntityKind::Object(ObjectType::Empty), "Rig", None)?;
        let b = main.add_entity(EntityKind::Object(ObjectType::Mesh), "Rig", None)?;
        let c = main.add_entity(EntityKind::Object(ObjectType::Empty), "Rig", Some(lib))?;
        let d = main.add_entity(EntityKind::Collection, "Rig", None)?;
        let e = main.add_entity(EntityKind::Object(ObjectType::Empty), "Rig.001", None)?;

        assert_eq!(main.entity(a)?.name(), "Rig");
        assert_eq!(main.entity(b)?.name(), "Rig.001");
        assert_eq!(main.entity(c)?.name(), "Rig");
        assert_eq!(main.entity(d)?.name(), "Rig");
        assert_eq!(main.entity(e)?.name(), "Rig.002");
        Ok(())
    }

    #[test]
    fn copy_is_local_and_duplicates_shape_key() -> Result<(), StorageError> {
        let mut main = Main::new();
        let lib = main.add_library("props.blend");
        let mesh = main.add_entity(EntityKind::Mesh, "Body", Some(lib))?;
        let key = main.add_shape_key(mesh)?;

        let copy = main.copy_entity(mesh)?;
        let copied = main.entity(copy)?;
        assert!(!copied.is_linked());
        assert_eq!(copied.name(), "Body");

        let copy_key = copied.data.shape_key.expect("shape key copied");
        assert_ne!(copy_key, key);
        assert_eq!(main.entity(copy_key)?.data.owner, Some(copy));
        assert_eq!(main.entity(key)?.data.owner, Some(mesh));
        Ok(())
    }

    #[test]
    fn opaque_entities_refuse_copy() -> Result<(), StorageError> {
        let mut main = Main::new();
        let blob = main.add_entity(EntityKind::Opaque, "Blob", None)?;
        assert!(matches!(
            main.copy_entity(blob),
            Err(StorageError::NotCopyable { .. })
        ));
        Ok(())
    }

    #[test]
    fn delete_batch_clears_links_and_cascades_keys() -> Result<(), StorageError> {
        let mut main = Main::new();
        let mesh = main.add_entity(EntityKind::Mesh, "Body", None)?;
        let key = main.add_shape_key(mesh)?;
        let ob = main.add_entity(EntityKind::Object(ObjectType::Mesh), "Body", None)?;
        main.entity_mut(ob)?
            .data
            .properties
            .set("data", PropertyValue::Pointer(Some(mesh)));

        let deleted = main.delete_batch(&IdSet::from([mesh]));
        assert_eq!(deleted, 2);
        assert!(!main.contains(key));
        assert_eq!(main.entity(ob)?.pointer("data"), None);
        Ok(())
    }

    #[test]
    fn swap_payload_keeps_headers() -> Result<(), StorageError> {
        let mut main = Main::new();
        let a = main.add_entity(EntityKind::Material, "A", None)?;
        let b = main.add_entity(EntityKind::Material, "B", None)?;
        main.entity_mut(a)?
            .data
            .properties
            .set("roughness", PropertyValue::Float(0.1));

        main.swap_payload(a, b)?;
        assert_eq!(main.entity(a)?.name(), "A");
        assert_eq!(
            main.entity(b)?.data.properties.value("roughness"),
            Some(&PropertyValue::Float(0.1))
        );
        assert_eq!(
            main.entity(a)?.data.properties.value("roughness"),
            Some(&PropertyValue::Float(0.5))
        );
        Ok(())
    }
}
