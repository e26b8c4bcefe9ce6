use tracing::debug;

use liboverride_core::{EntityId, PropertyFlags, RemapFlags};

use crate::database::Main;
use crate::error::StorageError;

impl Main {
    /// Replace, inside `owner` only, every link to `old` by `new`.
    ///
    /// Override-reference links are rebound too unless `SKIP_OVERRIDE_REFERENCE` is set,
    /// with user counts adjusted. Returns the number of links changed.
    pub fn relink(
        &mut self,
        owner: EntityId,
        old: EntityId,
        new: Option<EntityId>,
        flags: RemapFlags,
    ) -> Result<usize, StorageError> {
        if Some(old) == new {
            return Ok(0);
        }
        let entity = self.entity_mut(owner)?;
        let mut count = entity
            .data
            .properties
            .replace_id(old, new, &|_: PropertyFlags| false);
        if entity.data.shape_key == Some(old) {
            entity.data.shape_key = new;
            count += 1;
        }
        if entity.data.owner == Some(old) {
            entity.data.owner = new;
            count += 1;
        }

        let mut rebound = false;
        if !flags.contains(RemapFlags::SKIP_OVERRIDE_REFERENCE) {
            if let Some(container) = entity.override_library.as_mut() {
                if container.reference == Some(old) {
                    if let Some(new) = new {
                        container.reference = Some(new);
                        rebound = true;
                        count += 1;
                    }
                }
            }
        }
        if rebound {
            self.id_us_min(old);
            if let Some(new) = new {
                self.id_us_plus(new);
            }
        }

        if count > 0 {
            self.tag_relations_update();
        }
        Ok(count)
    }

    /// Replace every link to `old` across the database by `new`.
    ///
    /// With `SKIP_INDIRECT_USAGE`, linked entities keep their links.
    pub fn remap(
        &mut self,
        old: EntityId,
        new: Option<EntityId>,
        flags: RemapFlags,
    ) -> Result<usize, StorageError> {
        let mut count = 0;
        for owner in self.ids() {
            let linked = self.entity(owner)?.is_linked();
            if linked && flags.contains(RemapFlags::SKIP_INDIRECT_USAGE) {
                continue;
            }
            count += self.relink(owner, old, new, flags)?;
        }
        debug!(old = %old, new = ?new, count, "remapped usages");
        Ok(count)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::entity::{EntityKind, ObjectType};
    use liboverride_core::{OverrideContainer, PropertyValue};

    #[test]
    fn remap_skips_linked_owners_when_asked() -> Result<(), StorageError> {
        let mut main = Main::new();
        let lib = main.add_library("set.blend");
        let old = main.add_entity(EntityKind::Material, "Old", None)?;
        let new = main.add_entity(EntityKind::Material, "New", None)?;
        let local_mesh = main.add_entity(EntityKind::Mesh, "Local", None)?;
        let linked_mesh = main.add_entity(EntityKind::Mesh, "Linked", Some(lib))?;
        for mesh in [local_mesh, linked_mesh] {
            main.entity_mut(mesh)?
                .data
                .properties
                .set("material", PropertyValue::Pointer(Some(old)));
        }

        let count = main.remap(old, Some(new), RemapFlags::SKIP_INDIRECT_USAGE)?;
        assert_eq!(count, 1);
        assert_eq!(main.entity(local_mesh)?.pointer("material"), Some(new));
        assert_eq!(main.entity(linked_mesh)?.pointer("material"), Some(old));
        Ok(())
    }

    #[test]
    fn relink_rebinds_override_reference_unless_skipped() -> Result<(), StorageError> {
        let mut main = Main::new();
        let old = main.add_entity(EntityKind::Object(ObjectType::Empty), "A", None)?;
        let new = main.add_entity(EntityKind::Object(ObjectType::Empty), "B", None)?;
        let local = main.add_entity(EntityKind::Object(ObjectType::Empty), "C", None)?;
        main.entity_mut(local)?.override_library = Some(OverrideContainer::new(Some(old)));
        main.id_us_plus(old);

        assert_eq!(main.relink(local, old, Some(new), RemapFlags::SKIP_OVERRIDE_REFERENCE)?, 0);
        assert_eq!(main.entity(local)?.override_reference(), Some(old));

        assert_eq!(main.relink(local, old, Some(new), RemapFlags::empty())?, 1);
        assert_eq!(main.entity(local)?.override_reference(), Some(new));
        assert_eq!(main.entity(old)?.users, 0);
        assert_eq!(main.entity(new)?.users, 1);
        Ok(())
    }
}
