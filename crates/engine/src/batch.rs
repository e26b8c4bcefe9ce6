//! Batch regeneration of override operations across the whole database.

use std::collections::HashMap;
use std::mem;

use rayon::prelude::*;
use tracing::{debug, info, warn};

use liboverride_core::{
    CompareFlags, EntityId, EntityTags, IdLookup, OverrideContainer, OverrideTags, PropertyTree,
};
use liboverride_storage::Main;

use crate::OverrideEngine;
use crate::diff::CompareResult;
use crate::error::EngineError;
use crate::kinds::handler;

/// Immutable copy of the entity facts pointer comparison needs, shared by every
/// worker while payloads are detached from the database.
#[derive(Debug, Clone, Default)]
pub struct IdSnapshot {
    entries: HashMap<EntityId, (String, Option<EntityId>)>,
}

impl IdSnapshot {
    pub fn capture(main: &Main) -> Self {
        let entries = main
            .iter()
            .map(|e| (e.id, (e.name().to_string(), e.override_reference())))
            .collect();
        Self { entries }
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }
}

impl IdLookup for IdSnapshot {
    fn name_of(&self, id: EntityId) -> Option<&str> {
        self.entries.get(&id).map(|(name, _)| name.as_str())
    }

    fn override_reference_of(&self, id: EntityId) -> Option<EntityId> {
        self.entries.get(&id).and_then(|(_, reference)| *reference)
    }
}

/// Outcome of [`OverrideEngine::regenerate_all`].
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct RegenerateReport {
    /// Overrides that were diffed against their reference.
    pub processed: usize,
    /// Overrides that gained at least one operation.
    pub created: usize,
    /// Overrides whose operation set differs from before the pass.
    pub changed: usize,
}

/// One override detached from the database for the parallel pass.
struct Unit {
    id: EntityId,
    tree: PropertyTree,
    container: OverrideContainer,
    reference: PropertyTree,
    result: CompareResult,
}

impl OverrideEngine {
    /// Regenerate the operations of every override due for it: all real overrides
    /// when `force` is set, otherwise those tagged `AUTOREFRESH`.
    ///
    /// With `force`, operations no longer produced by any difference are removed.
    /// Blocks until every unit has completed.
    pub fn regenerate_all(&mut self, force: bool) -> Result<RegenerateReport, EngineError> {
        let mut before: HashMap<EntityId, blake3::Hash> = HashMap::new();
        for entity in self.main.iter().filter(|e| e.is_override_real()) {
            if let Some(container) = entity.override_library.as_ref() {
                before.insert(entity.id, container.fingerprint()?);
            }
        }

        if force {
            self.tag_all_overrides(OverrideTags::UNUSED, true);
        }
        self.ensure_all_poses()?;

        let due: Vec<EntityId> = self
            .main
            .iter()
            .filter(|e| e.is_override_real() && (force || e.tags.contains(EntityTags::AUTOREFRESH)))
            .map(|e| e.id)
            .collect();
        self.main.tag_all(EntityTags::AUTOREFRESH, false);

        // Reference trees are copied before any local tree is detached: a reference may
        // itself be a due override.
        let mut pending = Vec::with_capacity(due.len());
        for id in due {
            let Some(reference) = self.main.entity(id)?.override_reference() else {
                continue;
            };
            let reference_entity = self.main.entity(reference)?;
            if reference_entity.is_missing() {
                warn!(entity = %id, "reference is missing, regeneration skipped");
                if let Some(container) = self.main.entity_mut(id)?.override_library.as_mut() {
                    container.tag_properties(OverrideTags::UNUSED, false);
                }
                continue;
            }
            pending.push((id, reference_entity.data.properties.clone()));
        }

        let snapshot = IdSnapshot::capture(&self.main);
        let mut units = Vec::with_capacity(pending.len());
        for (id, reference) in pending {
            let entity = self.main.entity_mut(id)?;
            let Some(container) = entity.override_library.take() else {
                continue;
            };
            units.push(Unit {
                id,
                tree: mem::take(&mut entity.data.properties),
                container,
                reference,
                result: CompareResult::default(),
            });
        }

        let differ = self.differ.as_ref();
        self.pool.install(|| {
            units.par_iter_mut().for_each(|unit| {
                unit.result = differ.compare(
                    &snapshot,
                    &mut unit.tree,
                    &unit.reference,
                    &mut unit.container,
                    CompareFlags::CREATE | CompareFlags::RESTORE,
                );
            });
        });

        let mut report = RegenerateReport {
            processed: units.len(),
            ..RegenerateReport::default()
        };
        for unit in units {
            if unit.result.created {
                report.created += 1;
                debug!(entity = %unit.id, "generated override operations");
            }
            let entity = self.main.entity_mut(unit.id)?;
            entity.data.properties = unit.tree;
            entity.override_library = Some(unit.container);
        }

        if force {
            self.unused_cleanup_all();
        }

        for entity in self.main.iter().filter(|e| e.is_override_real()) {
            if let Some(container) = entity.override_library.as_ref() {
                if before.get(&entity.id) != Some(&container.fingerprint()?) {
                    report.changed += 1;
                }
            }
        }

        info!(
            force,
            processed = report.processed,
            created = report.created,
            changed = report.changed,
            "regenerated override operations"
        );
        Ok(report)
    }

    /// Set or clear `tag` on every property and operation of every container.
    pub fn tag_all_overrides(&mut self, tag: OverrideTags, value: bool) {
        for id in self.main.ids() {
            if let Some(container) = self.main.get_mut(id).and_then(|e| e.override_library.as_mut()) {
                container.tag_properties(tag, value);
            }
        }
    }

    /// Remove every property and operation still tagged `UNUSED`. Returns how many
    /// entries were removed.
    pub fn unused_cleanup_all(&mut self) -> usize {
        let mut total = 0;
        for id in self.main.ids() {
            if let Some(container) = self.main.get_mut(id).and_then(|e| e.override_library.as_mut()) {
                let removed = container.unused_cleanup();
                if removed > 0 {
                    debug!(entity = %id, removed, "removed unused override entries");
                }
                total += removed;
            }
        }
        total
    }

    fn ensure_all_poses(&mut self) -> Result<(), EngineError> {
        let armatures: Vec<EntityId> = self
            .main
            .iter()
            .filter(|e| e.kind.is_armature_object())
            .map(|e| e.id)
            .collect();
        for id in armatures {
            let kind = self.main.entity(id)?.kind;
            handler(kind).ensure_pose(&mut self.main, id)?;
        }
        Ok(())
    }
}
