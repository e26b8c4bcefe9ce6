//! Override creation: whole hierarchies, single entities and proxy conversion.

use tracing::{debug, info, warn};

use liboverride_core::{EntityId, IdSet, Property, PropertyValue, Recalc, RemapFlags};
use liboverride_storage::{Entity, Main};

use crate::OverrideEngine;
use crate::container;
use crate::error::EngineError;
use crate::group::{GroupTags, tag_linked_group};
use crate::kinds::handler;

const RELINK_FLAGS: RemapFlags = RemapFlags::SKIP_INDIRECT_USAGE.union(RemapFlags::SKIP_OVERRIDE_REFERENCE);

fn is_overridable(entity: &Entity) -> bool {
    entity.is_linked() && !entity.is_missing() && handler(entity.kind).is_linkable()
}

fn check_overridable(main: &Main, id: EntityId) -> Result<(), EngineError> {
    let entity = main.entity(id)?;
    if !is_overridable(entity) {
        return Err(EngineError::NotOverridable(entity.name().to_string()));
    }
    Ok(())
}

impl OverrideEngine {
    // ========================================================================
    // Hierarchy creation
    // ========================================================================

    /// Override the linked hierarchy around `root` and instantiate it in the scene.
    ///
    /// `instancer` is the object or collection through which `root` is currently
    /// instanced, if any; the new hierarchy takes its place in the scene. Returns the
    /// override of `root`.
    pub fn create(&mut self, root: EntityId, instancer: Option<EntityId>) -> Result<EntityId, EngineError> {
        check_overridable(&self.main, root)?;
        self.create_impl(root, instancer, &[], IdSet::new())
    }

    fn create_impl(
        &mut self,
        root: EntityId,
        instancer: Option<EntityId>,
        pre_tagged: &[EntityId],
        mut opt_in: IdSet,
    ) -> Result<EntityId, EngineError> {
        let mut tags = GroupTags::new();
        tags.tagged.extend(pre_tagged.iter().copied());
        tag_linked_group(&self.main, &mut tags, root)?;

        let result = self.create_and_place(&tags, &mut opt_in, root, instancer);
        self.main.clear_new_entities();

        let new_root = result?;
        info!(root = %root, new_root = %new_root, "created override hierarchy");
        Ok(new_root)
    }

    fn create_and_place(
        &mut self,
        tags: &GroupTags,
        opt_in: &mut IdSet,
        root: EntityId,
        instancer: Option<EntityId>,
    ) -> Result<EntityId, EngineError> {
        self.create_from_tag(tags, opt_in)?;
        let new_root = self
            .main
            .entity(root)?
            .new_entity
            .ok_or_else(|| EngineError::CreationFailed(self.main.name_or_id(root)))?;
        self.post_process(root, new_root, instancer)?;
        Ok(new_root)
    }

    /// Override every tagged, linked, linkable entity that has no replacement yet.
    ///
    /// Each reference's `new_entity` is set to its override, and shape keys of the
    /// references to the copies' keys. Local entities of `opt_in` (extended with the new
    /// overrides) are then relinked from references to overrides. On failure every
    /// override created here is deleted.
    pub(crate) fn create_from_tag(
        &mut self,
        tags: &GroupTags,
        opt_in: &mut IdSet,
    ) -> Result<Vec<EntityId>, EngineError> {
        let candidates: Vec<EntityId> = self
            .main
            .iter()
            .filter(|e| tags.is_tagged(e.id) && is_overridable(e) && e.new_entity.is_none())
            .map(|e| e.id)
            .collect();

        let mut created = Vec::with_capacity(candidates.len());
        for reference in candidates {
            match self.create_single(reference) {
                Ok(local) => {
                    self.main.entity_mut(reference)?.new_entity = Some(local);
                    let reference_key = self.main.entity(reference)?.data.shape_key;
                    let local_key = self.main.entity(local)?.data.shape_key;
                    if let (Some(reference_key), Some(local_key)) = (reference_key, local_key) {
                        self.main.entity_mut(reference_key)?.new_entity = Some(local_key);
                    }
                    created.push(local);
                }
                Err(err) => {
                    let name = self.main.name_or_id(reference);
                    warn!(entity = %reference, error = %err, "override creation failed, rolling back");
                    let doomed: IdSet = created.iter().copied().collect();
                    self.main.delete_batch(&doomed);
                    return Err(EngineError::CreationFailed(name));
                }
            }
        }

        let pairs: Vec<(EntityId, EntityId)> = self
            .main
            .iter()
            .filter_map(|e| e.new_entity.map(|new| (e.id, new)))
            .collect();
        opt_in.extend(pairs.iter().map(|(_, new)| *new));

        let owners: Vec<EntityId> = self
            .main
            .iter()
            .filter(|e| !e.is_linked() && opt_in.contains(&e.id))
            .map(|e| e.id)
            .collect();
        for owner in owners {
            for (reference, local) in &pairs {
                self.main.relink(owner, *reference, Some(*local), RELINK_FLAGS)?;
            }
        }

        debug!(count = created.len(), "created overrides from tags");
        Ok(created)
    }

    /// Copy `reference` locally and attach an override container to the copy.
    fn create_single(&mut self, reference: EntityId) -> Result<EntityId, EngineError> {
        let local = self.main.copy_entity(reference)?;
        if let Err(err) = container::init(&mut self.main, local, Some(reference)) {
            self.main.delete_batch(&IdSet::from([local]));
            return Err(err);
        }
        // Shape keys are overridden along with their owner.
        if let Some(key) = self.main.entity(local)?.data.shape_key {
            self.main.entity_mut(key)?.embedded_override = true;
        }
        debug!(reference = %reference, local = %local, "created override");
        Ok(local)
    }

    // ========================================================================
    // Single entity
    // ========================================================================

    /// Override `reference` alone. When `opt_in` is given, local entities in it are
    /// relinked from `reference` (and its shape key) to the new override.
    pub fn create_from_id(
        &mut self,
        reference: EntityId,
        opt_in: Option<&IdSet>,
    ) -> Result<EntityId, EngineError> {
        check_overridable(&self.main, reference)?;
        let local = self.create_single(reference)?;

        if let Some(opt_in) = opt_in {
            let reference_key = self.main.entity(reference)?.data.shape_key;
            let local_key = self.main.entity(local)?.data.shape_key;
            let owners: Vec<EntityId> = self
                .main
                .iter()
                .filter(|e| !e.is_linked() && opt_in.contains(&e.id))
                .map(|e| e.id)
                .collect();
            for owner in owners {
                self.main.relink(owner, reference, Some(local), RELINK_FLAGS)?;
                if let (Some(reference_key), Some(local_key)) = (reference_key, local_key) {
                    self.main.relink(owner, reference_key, Some(local_key), RELINK_FLAGS)?;
                }
            }
        }
        Ok(local)
    }

    // ========================================================================
    // Proxies
    // ========================================================================

    /// Turn a proxy object into the override of its linked target, then override the
    /// rest of the target's hierarchy.
    ///
    /// The proxy's `proxy` property names the linked target. An optional `proxy_group`
    /// property names the empty instancing the collection the proxy comes from; that
    /// collection then becomes the hierarchy root.
    pub fn convert_proxy(&mut self, proxy: EntityId) -> Result<EntityId, EngineError> {
        let entity = self.main.entity(proxy)?;
        let Some(target) = entity.pointer("proxy") else {
            return Err(EngineError::NotOverridable(entity.name().to_string()));
        };
        let (root, instancer) = match entity.pointer("proxy_group") {
            Some(group) => {
                let group_entity = self.main.entity(group)?;
                let root = group_entity
                    .pointer("instance_collection")
                    .ok_or_else(|| EngineError::NotOverridable(group_entity.name().to_string()))?;
                (root, group)
            }
            None => (target, proxy),
        };
        check_overridable(&self.main, root)?;

        container::init(&mut self.main, proxy, Some(target))?;
        self.main.entity_mut(target)?.new_entity = Some(proxy);
        let properties = &mut self.main.entity_mut(proxy)?.data.properties;
        let proxy_links: Vec<(&str, Property)> = ["proxy", "proxy_group"]
            .into_iter()
            .filter_map(|key| properties.remove(key).map(|p| (key, p)))
            .collect();
        self.main.tag_update(proxy, Recalc::CopyOnWrite);

        debug!(proxy = %proxy, target = %target, "converted proxy");
        let created = self.create_impl(root, Some(instancer), &[target], IdSet::from([proxy]));
        if created.is_err() {
            container::free(&mut self.main, proxy, true)?;
            let properties = &mut self.main.entity_mut(proxy)?.data.properties;
            for (key, prop) in proxy_links {
                properties.insert_with_flags(key, prop.value, prop.flags);
            }
        }
        created
    }

    // ========================================================================
    // Scene instantiation
    // ========================================================================

    /// Instantiate `new_root`, the override of `root_reference`, in the view layer, and
    /// give every new object override lacking a view-layer collection a home.
    pub(crate) fn post_process(
        &mut self,
        root_reference: EntityId,
        new_root: EntityId,
        instancer: Option<EntityId>,
    ) -> Result<(), EngineError> {
        let root_kind = self.main.entity(root_reference)?.kind;

        if root_kind.is_collection() {
            let instancer_object = match instancer {
                Some(i) if self.main.entity(i)?.kind.is_object() => Some(i),
                _ => None,
            };
            let parents = match (instancer_object, instancer) {
                (Some(object), _) => local_collections_with_object(&self.main, object),
                (None, Some(collection)) => local_parents_of(&self.main, collection),
                (None, None) => local_parents_of(&self.main, root_reference),
            };
            if parents.is_empty() {
                let master = self.main.master_collection();
                self.main.collection_add_child(master, new_root)?;
            }
            for parent in parents {
                self.main.collection_add_child(parent, new_root)?;
            }

            for object in self.main.collection_objects_recursive(new_root) {
                if !self.main.entity(object)?.is_override() || self.main.view_layer_has_object(object) {
                    continue;
                }
                match instancer_object {
                    Some(instancer) => self.add_object_from(instancer, object)?,
                    None => {
                        self.main.collection_add_object(new_root, object)?;
                    }
                }
                self.main.tag_update(object, Recalc::Transform);
                self.main.tag_update(object, Recalc::BaseFlags);
            }
        } else if root_kind.is_object() && !self.main.view_layer_has_object(new_root) {
            self.add_object_from(root_reference, new_root)?;
        }

        let pending: Vec<EntityId> = self
            .main
            .iter()
            .filter(|e| e.kind.is_object())
            .filter_map(|e| e.new_entity)
            .collect();
        let mut fallback = None;
        for object in pending {
            if self.main.view_layer_has_object(object) {
                continue;
            }
            let collection = match fallback {
                Some(collection) => collection,
                None => {
                    let collection = self.default_collection(root_reference, new_root)?;
                    fallback = Some(collection);
                    collection
                }
            };
            self.main.collection_add_object(collection, object)?;
            self.main.tag_update(object, Recalc::Transform);
            self.main.tag_update(object, Recalc::BaseFlags);
        }
        Ok(())
    }

    /// Link `object` into every local view-layer collection holding `source`, or into
    /// the master collection when there is none.
    fn add_object_from(&mut self, source: EntityId, object: EntityId) -> Result<(), EngineError> {
        let collections = local_collections_with_object(&self.main, source);
        if collections.is_empty() {
            let master = self.main.master_collection();
            self.main.collection_add_object(master, object)?;
        }
        for collection in collections {
            self.main.collection_add_object(collection, object)?;
        }
        Ok(())
    }

    fn default_collection(&mut self, root_reference: EntityId, new_root: EntityId) -> Result<EntityId, EngineError> {
        let root_kind = self.main.entity(root_reference)?.kind;
        if root_kind.is_collection() {
            let name = self.config.hidden_collection_name.clone();
            let hidden = self.main.new_collection(new_root, &name)?;
            let properties = &mut self.main.entity_mut(hidden)?.data.properties;
            properties.set("hide_viewport", PropertyValue::Bool(true));
            properties.set("hide_render", PropertyValue::Bool(true));
            return Ok(hidden);
        }

        let main = &self.main;
        let found = main
            .iter()
            .filter(|e| {
                e.kind.is_collection()
                    && !e.is_linked()
                    && !e.is_override()
                    && e.id_collection("objects").contains(&root_reference)
                    && main.view_layer_has_collection(e.id)
            })
            .map(|e| e.id)
            .last();
        Ok(found.unwrap_or_else(|| main.master_collection()))
    }
}

/// Local view-layer collections directly holding `object`.
fn local_collections_with_object(main: &Main, object: EntityId) -> Vec<EntityId> {
    main.view_layer_collections()
        .into_iter()
        .filter(|c| {
            main.get(*c)
                .is_some_and(|coll| !coll.is_linked() && coll.id_collection("objects").contains(&object))
        })
        .collect()
}

/// Local view-layer collections having `collection` as a direct child.
fn local_parents_of(main: &Main, collection: EntityId) -> Vec<EntityId> {
    main.view_layer_collections()
        .into_iter()
        .filter(|c| {
            main.get(*c)
                .is_some_and(|coll| !coll.is_linked() && coll.id_collection("children").contains(&collection))
        })
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;
    use liboverride_storage::{EntityKind, ObjectType};

    #[test]
    fn create_from_id_relinks_opt_in_owners() -> Result<(), EngineError> {
        let mut main = Main::new();
        let lib = main.add_library("props.blend");
        let mesh = main.add_entity(EntityKind::Mesh, "Crate", Some(lib))?;
        main.add_shape_key(mesh)?;
        let user = main.add_entity(EntityKind::Object(ObjectType::Mesh), "Crate", None)?;
        let bystander = main.add_entity(EntityKind::Object(ObjectType::Mesh), "Other", None)?;
        for owner in [user, bystander] {
            main.entity_mut(owner)?
                .data
                .properties
                .set("data", PropertyValue::Pointer(Some(mesh)));
        }

        let mut engine = OverrideEngine::new(main)?;
        let local = engine.create_from_id(mesh, Some(&IdSet::from([user])))?;

        let main = engine.main();
        assert_eq!(main.entity(local)?.override_reference(), Some(mesh));
        assert_eq!(main.entity(user)?.pointer("data"), Some(local));
        assert_eq!(main.entity(bystander)?.pointer("data"), Some(mesh));
        let key = main.entity(local)?.data.shape_key.expect("key copied");
        assert!(main.entity(key)?.embedded_override);
        assert!(!main.entity(key)?.is_override_real());
        Ok(())
    }

    #[test]
    fn local_entities_are_not_overridable() -> Result<(), EngineError> {
        let mut main = Main::new();
        let local = main.add_entity(EntityKind::Material, "Paint", None)?;
        let mut engine = OverrideEngine::new(main)?;
        assert!(matches!(
            engine.create_from_id(local, None),
            Err(EngineError::NotOverridable(_))
        ));
        Ok(())
    }
}
