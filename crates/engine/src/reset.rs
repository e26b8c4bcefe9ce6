use tracing::{debug, info};

use liboverride_core::{
    EntityId, IdLookup, LinkFlags, Operation, OperationKind, PropertyKind, PropertyValue, Recalc,
    SubItem,
};
use liboverride_storage::{Main, MainRelations};

use crate::OverrideEngine;
use crate::error::EngineError;

impl OverrideEngine {
    /// Drop every override operation of `id` except those keeping links to nested
    /// overrides, then rebuild it from its reference.
    pub fn reset(&mut self, id: EntityId) -> Result<(), EngineError> {
        if !self.main.entity(id)?.is_override_real() {
            return Ok(());
        }
        if reset_do(&mut self.main, id)? && self.needs_reload(id)? {
            self.update(id)?;
            self.set_needs_reload(id, false)?;
        }
        Ok(())
    }

    /// Reset `root` and every override reachable from it through non-loopback links,
    /// then update all overrides left needing a reload.
    pub fn reset_hierarchy(&mut self, root: EntityId) -> Result<(), EngineError> {
        let mut relations = MainRelations::build(&self.main);
        reset_recursive(&mut self.main, &mut relations, root)?;

        let pending: Vec<EntityId> = self
            .main
            .iter()
            .filter(|e| {
                e.is_override_real()
                    && e.override_library.as_ref().is_some_and(|c| c.needs_reload())
            })
            .map(|e| e.id)
            .collect();
        for id in &pending {
            self.update(*id)?;
            self.set_needs_reload(*id, false)?;
        }
        info!(root = %root, reloaded = pending.len(), "reset override hierarchy");
        Ok(())
    }

    fn needs_reload(&self, id: EntityId) -> Result<bool, EngineError> {
        Ok(self
            .main
            .entity(id)?
            .override_library
            .as_ref()
            .is_some_and(|c| c.needs_reload()))
    }

    fn set_needs_reload(&mut self, id: EntityId, value: bool) -> Result<(), EngineError> {
        if let Some(container) = self.main.entity_mut(id)?.override_library.as_mut() {
            container.set_needs_reload(value);
        }
        Ok(())
    }
}

fn reset_recursive(main: &mut Main, relations: &mut MainRelations, id: EntityId) -> Result<(), EngineError> {
    if !main.entity(id)?.is_override_real() || !relations.mark_processed(id) {
        return Ok(());
    }
    reset_do(main, id)?;

    let used = relations.used_by(id).to_vec();
    for (to, flags) in used {
        if flags.contains(LinkFlags::LOOPBACK) {
            continue;
        }
        if main.get(to).is_some_and(|e| e.override_library.is_some()) {
            reset_recursive(main, relations, to)?;
        }
    }
    Ok(())
}

/// Delete the override properties of `id` that do not merely redirect links to nested
/// overrides. Returns whether anything was deleted, in which case the container is
/// flagged for reload.
fn reset_do(main: &mut Main, id: EntityId) -> Result<bool, EngineError> {
    let entity = main.entity(id)?;
    let (Some(container), Some(reference)) = (entity.override_library.as_ref(), entity.override_reference()) else {
        return Ok(false);
    };
    let local_tree = &entity.data.properties;
    let reference_tree = &main.entity(reference)?.data.properties;

    let mut doomed = Vec::new();
    for prop in container.properties() {
        let keep = match (prop.kind, prop.parsed_path()) {
            (PropertyKind::Pointer | PropertyKind::IdCollection, Ok(path)) => {
                match (local_tree.resolve(&path), reference_tree.resolve(&path)) {
                    (Some(local), Some(reference)) => {
                        keeps_nested_overrides(&*main, &local.value, &reference.value, prop.operations())
                    }
                    _ => false,
                }
            }
            _ => false,
        };
        if !keep {
            doomed.push(prop.path().to_string());
        }
    }

    if doomed.is_empty() {
        return Ok(false);
    }
    let entity = main.entity_mut(id)?;
    if let Some(container) = entity.override_library.as_mut() {
        for path in &doomed {
            container.delete_property(path);
        }
        container.set_needs_reload(true);
    }
    main.tag_update(id, Recalc::CopyOnWrite);
    debug!(entity = %id, removed = doomed.len(), "reset override properties");
    Ok(true)
}

fn keeps_nested_overrides(
    ids: &dyn IdLookup,
    local: &PropertyValue,
    reference: &PropertyValue,
    operations: &[Operation],
) -> bool {
    match (local, reference) {
        (PropertyValue::Pointer(Some(l)), PropertyValue::Pointer(Some(r))) => ids.is_override_of(*l, *r),
        (PropertyValue::IdCollection(local_ids), PropertyValue::IdCollection(ref_ids)) => {
            !operations.is_empty()
                && operations.iter().all(|op| {
                    op.kind == OperationKind::Replace
                        && match (
                            item(ids, local_ids, op.subitem.local_name.as_deref(), op.subitem.local_index),
                            item(
                                ids,
                                ref_ids,
                                op.subitem.reference_name.as_deref(),
                                op.subitem.reference_index,
                            ),
                        ) {
                            (Some(l), Some(r)) => ids.is_override_of(l, r),
                            _ => false,
                        }
                })
        }
        _ => false,
    }
}

fn item(ids: &dyn IdLookup, items: &[EntityId], name: Option<&str>, index: i32) -> Option<EntityId> {
    match name {
        Some(name) => items.iter().copied().find(|id| ids.name_of(*id) == Some(name)),
        None if index != SubItem::ANY_INDEX => usize::try_from(index).ok().and_then(|i| items.get(i).copied()),
        None => None,
    }
}
