use std::mem;

use tracing::{debug, warn};

use liboverride_core::{EntityId, EntityTags, IdSet, Recalc};

use crate::OverrideEngine;
use crate::error::EngineError;
use crate::kinds::handler;

impl OverrideEngine {
    /// Rebuild `local` from the current state of its reference, re-applying its
    /// override operations.
    ///
    /// Work happens on a transient copy of the reference whose payload is then swapped
    /// into `local`, so `local`'s identity and every link to it are preserved. Does
    /// nothing for templates, virtual overrides and missing references; a reference
    /// that cannot be copied leaves `local` untouched.
    pub fn update(&mut self, local: EntityId) -> Result<(), EngineError> {
        let Some(container) = self.main.entity(local)?.override_library.clone() else {
            return Ok(());
        };
        let Some(reference) = container.reference else {
            return Ok(());
        };
        let reference_entity = self.main.entity(reference)?;
        if reference_entity.is_missing() {
            debug!(entity = %local, "reference is missing, update skipped");
            return Ok(());
        }
        if reference_entity.override_library.is_some() && !reference_entity.tags.contains(EntityTags::REFOK) {
            self.update(reference)?;
        }

        let tmp = match self.main.copy_entity(reference) {
            Ok(tmp) => tmp,
            Err(err) => {
                warn!(entity = %local, error = %err, "cannot copy reference, update skipped");
                return Ok(());
            }
        };
        let name = self.main.entity(local)?.name().to_string();
        self.main.set_name_unchecked(tmp, &name)?;

        let local_key = self.main.entity(local)?.data.shape_key;
        let tmp_key = self.main.entity(tmp)?.data.shape_key;
        if let (Some(local_key), Some(tmp_key)) = (local_key, tmp_key) {
            if self.main.entity(local_key)?.embedded_override {
                self.main.entity_mut(tmp_key)?.embedded_override = true;
            }
        }

        let storage = container
            .storage
            .and_then(|s| self.main.get(s))
            .map(|s| s.data.properties.clone());
        let mut dst = mem::take(&mut self.main.entity_mut(tmp)?.data.properties);
        let report = {
            let src = &self.main.entity(local)?.data.properties;
            self.differ.apply(&self.main, &mut dst, src, storage.as_ref(), &container)
        };
        self.main.entity_mut(tmp)?.data.properties = dst;

        self.main.swap_payload(local, tmp)?;
        match (local_key, tmp_key) {
            (Some(local_key), Some(tmp_key)) => {
                self.main.swap_payload(local_key, tmp_key)?;
                self.main.entity_mut(local)?.data.shape_key = Some(local_key);
                self.main.entity_mut(tmp)?.data.shape_key = Some(tmp_key);
                self.main.entity_mut(local_key)?.data.owner = Some(local);
                self.main.entity_mut(tmp_key)?.data.owner = Some(tmp);
            }
            (None, Some(tmp_key)) => {
                let key = self.main.entity_mut(tmp_key)?;
                key.data.owner = Some(local);
                key.embedded_override = true;
            }
            _ => {}
        }

        self.main.delete_batch(&IdSet::from([tmp]));
        let kind = self.main.entity(local)?.kind;
        handler(kind).after_update(&mut self.main, local)?;

        if let Some(storage) = container.storage {
            self.main.delete_batch(&IdSet::from([storage]));
        }
        let entity = self.main.entity_mut(local)?;
        if let Some(container) = entity.override_library.as_mut() {
            container.storage = None;
        }
        entity.tags.insert(EntityTags::REFOK);
        self.main.tag_update(local, Recalc::CopyOnWrite);
        self.main.tag_relations_update();

        debug!(entity = %local, applied = report.applied, skipped = report.skipped, "updated override");
        Ok(())
    }

    /// Update every entity carrying override data. Returns how many were processed;
    /// an entity whose update fails is logged and skipped.
    pub fn update_all(&mut self) -> usize {
        let ids: Vec<EntityId> = self
            .main
            .iter()
            .filter(|e| e.override_library.is_some())
            .map(|e| e.id)
            .collect();
        let mut updated = 0;
        for id in ids {
            match self.update(id) {
                Ok(()) => updated += 1,
                Err(err) => warn!(entity = %id, error = %err, "override update failed"),
            }
        }
        updated
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use liboverride_core::{OperationKind, PropertyKind, PropertyPath, PropertyValue, SubItem};
    use liboverride_storage::{EntityKind, Main};

    #[test]
    fn update_reapplies_operations_over_new_reference_state() -> Result<(), EngineError> {
        let mut main = Main::new();
        let lib = main.add_library("mats.blend");
        let reference = main.add_entity(EntityKind::Material, "Paint", Some(lib))?;

        let mut engine = OverrideEngine::new(main)?;
        let local = engine.create_from_id(reference, None)?;
        {
            let main = engine.main_mut();
            let entity = main.entity_mut(local)?;
            entity.data.properties.set("roughness", PropertyValue::Float(0.1));
            let container = entity.override_library.as_mut().expect("override");
            let (prop, _) = container.get_or_create_property(&PropertyPath::root("roughness"), PropertyKind::Float);
            prop.get_or_create_operation(OperationKind::Replace, SubItem::whole(), true);

            main.entity_mut(reference)?
                .data
                .properties
                .set("color", PropertyValue::FloatArray(vec![1.0, 0.0, 0.0, 1.0]));
        }
        let before = engine.main().len();

        engine.update(local)?;

        let main = engine.main();
        let entity = main.entity(local)?;
        assert_eq!(entity.name(), "Paint");
        assert_eq!(entity.data.properties.value("roughness"), Some(&PropertyValue::Float(0.1)));
        assert_eq!(
            entity.data.properties.value("color"),
            Some(&PropertyValue::FloatArray(vec![1.0, 0.0, 0.0, 1.0]))
        );
        assert!(entity.tags.contains(EntityTags::REFOK));
        assert!(main.depsgraph().is_tagged(local, Recalc::CopyOnWrite));
        assert_eq!(main.len(), before);
        Ok(())
    }

    #[test]
    fn update_keeps_shape_key_identity() -> Result<(), EngineError> {
        let mut main = Main::new();
        let lib = main.add_library("props.blend");
        let mesh = main.add_entity(EntityKind::Mesh, "Crate", Some(lib))?;
        main.add_shape_key(mesh)?;

        let mut engine = OverrideEngine::new(main)?;
        let local = engine.create_from_id(mesh, None)?;
        let key = engine.main().entity(local)?.data.shape_key.expect("key");

        engine.update(local)?;

        let main = engine.main();
        assert_eq!(main.entity(local)?.data.shape_key, Some(key));
        assert_eq!(main.entity(key)?.data.owner, Some(local));
        assert!(main.entity(key)?.embedded_override);
        Ok(())
    }

    #[test]
    fn update_all_leaves_no_transient_copies() -> Result<(), EngineError> {
        let mut main = Main::new();
        let lib = main.add_library("mats.blend");
        let reference = main.add_entity(EntityKind::Material, "Paint", Some(lib))?;
        let template = main.add_entity(EntityKind::Material, "Template", None)?;
        crate::container::init(&mut main, template, None)?;

        let mut engine = OverrideEngine::new(main)?;
        let local = engine.create_from_id(reference, None)?;
        let before = engine.main().len();

        assert_eq!(engine.update_all(), 2);
        assert_eq!(engine.main().len(), before);
        assert!(engine.main().entity(local)?.tags.contains(EntityTags::REFOK));
        assert!(engine.main().entity(template)?.is_override_template());
        Ok(())
    }

    #[test]
    fn missing_reference_leaves_override_untouched() -> Result<(), EngineError> {
        let mut main = Main::new();
        let lib = main.add_library("mats.blend");
        let reference = main.add_entity(EntityKind::Material, "Paint", Some(lib))?;
        let mut engine = OverrideEngine::new(main)?;
        let local = engine.create_from_id(reference, None)?;
        engine.main_mut().entity_mut(reference)?.tags.insert(EntityTags::MISSING);
        engine.main_mut().depsgraph_mut().flush();

        engine.update(local)?;
        assert!(!engine.main().entity(local)?.tags.contains(EntityTags::REFOK));
        assert!(!engine.main().depsgraph().is_tagged(local, Recalc::CopyOnWrite));
        Ok(())
    }
}
