use std::collections::HashMap;
use std::mem;

use tracing::{debug, info, warn};

use liboverride_core::{EntityId, IdSet, RemapFlags};

use crate::OverrideEngine;
use crate::error::EngineError;
use crate::group::{GroupTags, tag_linked_group, tag_local_group};

impl OverrideEngine {
    /// Rebuild the override hierarchy around `root` from the current linked data.
    ///
    /// Fresh overrides are created for the whole reference hierarchy. Each takes over
    /// the name, database position, local usages and operations of the override it
    /// replaces; superseded overrides and overrides of missing data are deleted.
    /// Returns the new root. A missing root reference leaves everything untouched.
    pub fn resync(&mut self, root: EntityId) -> Result<EntityId, EngineError> {
        let entity = self.main.entity(root)?;
        let Some(root_reference) = entity.override_reference() else {
            return Err(EngineError::NotAnOverride(entity.name().to_string()));
        };
        if self.main.entity(root_reference)?.is_missing() {
            warn!(root = %root, "root reference is missing, resync skipped");
            return Ok(root);
        }

        let mut tags = GroupTags::new();
        tag_local_group(&self.main, &mut tags, root)?;
        tags.tagged.insert(root_reference);
        tag_linked_group(&self.main, &mut tags, root_reference)?;

        // First override found wins when a reference is overridden more than once.
        let mut old_overrides: HashMap<EntityId, EntityId> = HashMap::new();
        for entity in self.main.iter() {
            if !tags.is_tagged(entity.id) || entity.is_linked() {
                continue;
            }
            if let Some(reference) = entity.override_reference() {
                old_overrides.entry(reference).or_insert(entity.id);
            }
        }

        let mut opt_in: IdSet = tags.tagged.iter().copied().collect();
        let result = self.resync_from_tags(&tags, &mut opt_in, &old_overrides, root_reference);
        self.main.clear_new_entities();

        let new_root = result?;
        info!(root = %root, new_root = %new_root, "resynced override hierarchy");
        Ok(new_root)
    }

    fn resync_from_tags(
        &mut self,
        tags: &GroupTags,
        opt_in: &mut IdSet,
        old_overrides: &HashMap<EntityId, EntityId>,
        root_reference: EntityId,
    ) -> Result<EntityId, EngineError> {
        self.create_from_tag(tags, opt_in)?;

        let pairs: Vec<(EntityId, EntityId)> = self
            .main
            .iter()
            .filter(|e| tags.is_tagged(e.id) && e.is_linked())
            .filter_map(|e| {
                let new = e.new_entity?;
                let old = old_overrides.get(&e.id)?;
                Some((*old, new))
            })
            .collect();

        for (old, new) in &pairs {
            self.main.swap_names(*old, *new)?;
            self.main.swap_order(*old, *new)?;
            self.main.remap(*old, Some(*new), RemapFlags::SKIP_INDIRECT_USAGE)?;
            let Some(old_container) = self.main.entity(*old)?.override_library.clone() else {
                continue;
            };
            if let Some(container) = self.main.entity_mut(*new)?.override_library.as_mut() {
                container.copy_properties_from(&old_container);
            }
        }

        // Names and links must all be final before operations are applied.
        for (old, new) in &pairs {
            let Some(mut container) = self.main.entity(*new)?.override_library.clone() else {
                continue;
            };
            let dropped = container.drop_match_reference_operations();
            let mut dst = mem::take(&mut self.main.entity_mut(*new)?.data.properties);
            let report = {
                let src = &self.main.entity(*old)?.data.properties;
                self.differ.apply(&self.main, &mut dst, src, None, &container)
            };
            let entity = self.main.entity_mut(*new)?;
            entity.data.properties = dst;
            entity.override_library = Some(container);
            debug!(
                old = %old,
                new = %new,
                dropped,
                applied = report.applied,
                skipped = report.skipped,
                "transferred override operations"
            );
        }

        let mut doomed: IdSet = pairs.iter().map(|(old, _)| *old).collect();
        doomed.extend(
            tags.missing
                .iter()
                .copied()
                .filter(|id| self.main.get(*id).is_some_and(|e| !e.is_linked())),
        );
        self.main.delete_batch(&doomed);

        let new_root = self
            .main
            .entity(root_reference)?
            .new_entity
            .ok_or_else(|| EngineError::CreationFailed(self.main.name_or_id(root_reference)))?;
        self.post_process(root_reference, new_root, Some(new_root))?;
        Ok(new_root)
    }
}
