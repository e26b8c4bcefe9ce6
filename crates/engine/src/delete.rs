use tracing::info;

use liboverride_core::{EntityId, RemapFlags};

use crate::OverrideEngine;
use crate::error::EngineError;
use crate::group::{GroupTags, tag_local_group};

impl OverrideEngine {
    /// Delete the override hierarchy around `root`, remapping local usages of each
    /// override back to its linked reference. Returns how many entities were deleted.
    pub fn delete(&mut self, root: EntityId) -> Result<usize, EngineError> {
        let entity = self.main.entity(root)?;
        if !entity.is_override_real() {
            return Err(EngineError::NotAnOverride(entity.name().to_string()));
        }

        let mut tags = GroupTags::new();
        tag_local_group(&self.main, &mut tags, root)?;
        let doomed = tags.all();

        let remaps: Vec<(EntityId, EntityId)> = self
            .main
            .iter()
            .filter(|e| doomed.contains(&e.id))
            .filter_map(|e| e.override_reference().map(|r| (e.id, r)))
            .collect();
        for (id, reference) in remaps {
            self.main.remap(id, Some(reference), RemapFlags::SKIP_INDIRECT_USAGE)?;
        }

        let deleted = self.main.delete_batch(&doomed);
        info!(root = %root, deleted, "deleted override hierarchy");
        Ok(deleted)
    }
}
