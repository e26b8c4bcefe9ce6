use tracing::debug;

use liboverride_core::{EntityId, IdSet};

use crate::OverrideEngine;
use crate::error::EngineError;

impl OverrideEngine {
    /// Prepare `local` for writing: refresh its operations against the reference.
    ///
    /// Returns the storage entity holding differential snapshot values. Snapshots are
    /// not produced, so this is always `None`; templates, virtual overrides and
    /// entities without override data are left untouched.
    pub fn store_start(&mut self, local: EntityId) -> Result<Option<EntityId>, EngineError> {
        let entity = self.main.entity(local)?;
        if entity.embedded_override || !entity.is_override_real() {
            return Ok(None);
        }
        self.operations_create(local)?;
        Ok(None)
    }

    /// Release whatever [`Self::store_start`] attached to `local`.
    pub fn store_end(&mut self, local: EntityId) -> Result<(), EngineError> {
        let Some(container) = self.main.entity_mut(local)?.override_library.as_mut() else {
            return Ok(());
        };
        if let Some(storage) = container.storage.take() {
            self.main.delete_batch(&IdSet::from([storage]));
            debug!(entity = %local, storage = %storage, "freed override storage");
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use liboverride_core::PropertyValue;
    use liboverride_storage::{EntityKind, Main};

    #[test]
    fn store_start_records_pending_edits() -> Result<(), EngineError> {
        let mut main = Main::new();
        let lib = main.add_library("mats.blend");
        let reference = main.add_entity(EntityKind::Material, "Paint", Some(lib))?;
        let mut engine = OverrideEngine::new(main)?;
        let local = engine.create_from_id(reference, None)?;
        engine
            .main_mut()
            .entity_mut(local)?
            .data
            .properties
            .set("roughness", PropertyValue::Float(1.0));

        assert_eq!(engine.store_start(local)?, None);
        let container = engine.main().entity(local)?.override_library.clone();
        assert!(container.is_some_and(|c| c.property("roughness").is_some()));
        Ok(())
    }

    #[test]
    fn store_end_frees_storage_entity() -> Result<(), EngineError> {
        let mut main = Main::new();
        let lib = main.add_library("mats.blend");
        let reference = main.add_entity(EntityKind::Material, "Paint", Some(lib))?;
        let storage = main.add_entity(EntityKind::Material, "Paint.storage", None)?;
        let mut engine = OverrideEngine::new(main)?;
        let local = engine.create_from_id(reference, None)?;
        if let Some(container) = engine.main_mut().entity_mut(local)?.override_library.as_mut() {
            container.storage = Some(storage);
        }

        engine.store_end(local)?;
        assert!(!engine.main().contains(storage));
        let container = engine.main().entity(local)?.override_library.clone();
        assert!(container.is_some_and(|c| c.storage.is_none()));
        Ok(())
    }
}
