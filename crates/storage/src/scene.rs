use liboverride_core::{EntityId, IdSet, PropertyValue};

use crate::database::Main;
use crate::entity::EntityKind;
use crate::error::StorageError;

/// The single scene and view layer of a database.
#[derive(Debug, Clone)]
pub struct Scene {
    pub master_collection: EntityId,
}

impl Main {
    pub fn master_collection(&self) -> EntityId {
        self.scene.master_collection
    }

    /// Collections instanced in the view layer, starting from the master collection.
    pub fn view_layer_collections(&self) -> Vec<EntityId> {
        let mut seen = IdSet::new();
        let mut out = Vec::new();
        let mut stack = vec![self.scene.master_collection];
        while let Some(id) = stack.pop() {
            if !seen.insert(id) {
                continue;
            }
            let Some(collection) = self.get(id) else {
                continue;
            };
            out.push(id);
            stack.extend(collection.id_collection("children").iter().rev());
        }
        out
    }

    pub fn view_layer_has_collection(&self, collection: EntityId) -> bool {
        self.view_layer_collections().contains(&collection)
    }

    pub fn view_layer_has_object(&self, object: EntityId) -> bool {
        self.view_layer_collections().iter().any(|c| {
            self.get(*c)
                .is_some_and(|coll| coll.id_collection("objects").contains(&object))
        })
    }

    /// Collections whose direct objects include `object`, in database order.
    pub fn collections_containing(&self, object: EntityId) -> Vec<EntityId> {
        self.iter()
            .filter(|e| e.kind.is_collection() && e.id_collection("objects").contains(&object))
            .map(|e| e.id)
            .collect()
    }

    /// Objects of `collection` and of all its descendants, without duplicates.
    pub fn collection_objects_recursive(&self, collection: EntityId) -> Vec<EntityId> {
        let mut seen = IdSet::new();
        let mut objects = Vec::new();
        let mut stack = vec![collection];
        while let Some(id) = stack.pop() {
            if !seen.insert(id) {
                continue;
            }
            let Some(coll) = self.get(id) else {
                continue;
            };
            for ob in coll.id_collection("objects") {
                if !objects.contains(ob) {
                    objects.push(*ob);
                }
            }
            stack.extend(coll.id_collection("children").iter().rev());
        }
        objects
    }

    fn push_unique(
        &mut self,
        collection: EntityId,
        key: &str,
        item: EntityId,
    ) -> Result<bool, StorageError> {
        let entity = self.entity_mut(collection)?;
        if !entity.kind.is_collection() {
            return Err(StorageError::KindMismatch {
                name: entity.name().to_string(),
                expected: EntityKind::Collection.to_string(),
                got: entity.kind.to_string(),
            });
        }
        let mut items = entity.id_collection(key).to_vec();
        if items.contains(&item) {
            return Ok(false);
        }
        items.push(item);
        entity
            .data
            .properties
            .set(key, PropertyValue::IdCollection(items));
        self.tag_relations_update();
        Ok(true)
    }

    pub fn collection_add_object(
        &mut self,
        collection: EntityId,
        object: EntityId,
    ) -> Result<bool, StorageError> {
        self.push_unique(collection, "objects", object)
    }

    pub fn collection_add_child(
        &mut self,
        parent: EntityId,
        child: EntityId,
    ) -> Result<bool, StorageError> {
        self.push_unique(parent, "children", child)
    }

    /// Create a local collection as a child of `parent`.
    pub fn new_collection(&mut self, parent: EntityId, name: &str) -> Result<EntityId, StorageError> {
        let collection = self.add_entity(EntityKind::Collection, name, None)?;
        self.collection_add_child(parent, collection)?;
        Ok(collection)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::entity::ObjectType;

    #[test]
    fn view_layer_follows_children_from_master() -> Result<(), StorageError> {
        let mut main = Main::new();
        let master = main.master_collection();
        let child = main.new_collection(master, "Props")?;
        let orphan = main.add_entity(EntityKind::Collection, "Orphan", None)?;
        let ob = main.add_entity(EntityKind::Object(ObjectType::Empty), "Lamp", None)?;
        let hidden = main.add_entity(EntityKind::Object(ObjectType::Empty), "Hidden", None)?;
        main.collection_add_object(child, ob)?;
        main.collection_add_object(orphan, hidden)?;

        assert!(main.view_layer_has_collection(child));
        assert!(!main.view_layer_has_collection(orphan));
        assert!(main.view_layer_has_object(ob));
        assert!(!main.view_layer_has_object(hidden));
        assert_eq!(main.collections_containing(ob), vec![child]);
        assert_eq!(main.collection_objects_recursive(master), vec![ob]);

        assert!(!main.collection_add_object(child, ob)?);
        Ok(())
    }
}
