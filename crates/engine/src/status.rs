//! Status checks and single-entity operation generation.

use std::mem;

use tracing::debug;

use liboverride_core::{CompareFlags, EntityId, EntityTags};

use crate::OverrideEngine;
use crate::error::EngineError;
use crate::kinds::handler;

impl OverrideEngine {
    /// Check that every overridable, non-overridden property of `local` still equals
    /// its reference value, i.e. that no override operation is missing.
    ///
    /// Clears `REFOK` and returns false on mismatch. Templates are always OK.
    pub fn status_check_local(&mut self, local: EntityId) -> Result<bool, EngineError> {
        self.status_check(local, CompareFlags::IGNORE_NON_OVERRIDABLE | CompareFlags::IGNORE_OVERRIDDEN)
    }

    /// Check that every non-overridden property of `local` still equals its reference
    /// value, i.e. that the reference has not changed underneath.
    ///
    /// A reference that is itself an unconfirmed override is checked first. Clears
    /// `REFOK` and returns false on mismatch. Templates are always OK.
    pub fn status_check_reference(&mut self, local: EntityId) -> Result<bool, EngineError> {
        let entity = self.main.entity(local)?;
        if entity.override_library.is_none() {
            return Err(EngineError::NotAnOverride(entity.name().to_string()));
        }
        if let Some(reference) = entity.override_reference() {
            let reference_entity = self.main.entity(reference)?;
            if reference_entity.override_library.is_some()
                && !reference_entity.tags.contains(EntityTags::REFOK)
                && !self.status_check_reference(reference)?
            {
                self.main.entity_mut(local)?.tags.remove(EntityTags::REFOK);
                return Ok(false);
            }
        }
        self.status_check(local, CompareFlags::IGNORE_OVERRIDDEN)
    }

    fn status_check(&mut self, local: EntityId, flags: CompareFlags) -> Result<bool, EngineError> {
        let entity = self.main.entity(local)?;
        let Some(container) = entity.override_library.as_ref() else {
            return Err(EngineError::NotAnOverride(entity.name().to_string()));
        };
        let Some(reference) = container.reference else {
            return Ok(true);
        };
        if self.main.entity(reference)?.is_missing() {
            return Ok(true);
        }
        self.ensure_poses(local, reference)?;

        let entity = self.main.entity(local)?;
        let mut tree = entity.data.properties.clone();
        let Some(mut container) = entity.override_library.clone() else {
            return Ok(true);
        };
        let reference_tree = &self.main.entity(reference)?.data.properties;
        let result = self
            .differ
            .compare(&self.main, &mut tree, reference_tree, &mut container, flags);

        if !result.matches {
            self.main.entity_mut(local)?.tags.remove(EntityTags::REFOK);
            return Ok(false);
        }
        Ok(true)
    }

    /// Record operations for every difference between `local` and its reference, and
    /// restore non-overridable properties. Returns whether an operation was created.
    ///
    /// Templates and overrides of missing references are left alone.
    pub fn operations_create(&mut self, local: EntityId) -> Result<bool, EngineError> {
        let entity = self.main.entity(local)?;
        let Some(container) = entity.override_library.as_ref() else {
            return Err(EngineError::NotAnOverride(entity.name().to_string()));
        };
        let Some(reference) = container.reference else {
            return Ok(false);
        };
        if self.main.entity(reference)?.is_missing() {
            return Ok(false);
        }
        self.ensure_poses(local, reference)?;

        let Some(mut container) = self.main.entity(local)?.override_library.clone() else {
            return Ok(false);
        };
        let mut tree = mem::take(&mut self.main.entity_mut(local)?.data.properties);
        let result = {
            let reference_tree = &self.main.entity(reference)?.data.properties;
            self.differ.compare(
                &self.main,
                &mut tree,
                reference_tree,
                &mut container,
                CompareFlags::CREATE | CompareFlags::RESTORE,
            )
        };
        let entity = self.main.entity_mut(local)?;
        entity.data.properties = tree;
        entity.override_library = Some(container);

        if result.restored {
            debug!(entity = %local, "restored properties from reference");
        }
        if result.created {
            debug!(entity = %local, "generated override operations");
        }
        Ok(result.created)
    }

    pub(crate) fn ensure_poses(&mut self, local: EntityId, reference: EntityId) -> Result<(), EngineError> {
        for id in [local, reference] {
            let kind = self.main.entity(id)?.kind;
            handler(kind).ensure_pose(&mut self.main, id)?;
        }
        Ok(())
    }
}
