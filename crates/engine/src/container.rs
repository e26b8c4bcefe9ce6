//! Lifecycle of override containers: init, copy, clear and free.

use tracing::debug;

use liboverride_core::{EntityId, EntityTags, OverrideContainer};
use liboverride_storage::Main;

use crate::error::EngineError;

/// Attach a new override container to `local`, overriding `reference`.
///
/// A `None` reference creates a template. When the reference's ancestor chain ends on
/// a template, its operations are deep-copied onto `local`.
pub fn init(
    main: &mut Main,
    local: EntityId,
    reference: Option<EntityId>,
) -> Result<(), EngineError> {
    let entity = main.entity(local)?;
    if entity.override_library.is_some() {
        debug_assert!(false, "{} already has override data", entity.name());
        return Err(EngineError::AlreadyOverridden(entity.name().to_string()));
    }

    let Some(reference) = reference else {
        main.entity_mut(local)?.override_library = Some(OverrideContainer::new(None));
        return Ok(());
    };

    let mut ancestor = reference;
    while let Some(next) = main.entity(ancestor)?.override_reference() {
        ancestor = next;
    }

    if main.entity(ancestor)?.override_library.is_some() {
        copy(main, local, ancestor, true)?;
        let current = main.entity(local)?.override_reference();
        if current != Some(reference) {
            if let Some(current) = current {
                main.id_us_min(current);
            }
            if let Some(container) = main.entity_mut(local)?.override_library.as_mut() {
                container.reference = Some(reference);
            }
            main.id_us_plus(reference);
        }
        debug!(entity = %local, template = %ancestor, "override initialised from template");
        return Ok(());
    }

    let entity = main.entity_mut(local)?;
    entity.override_library = Some(OverrideContainer::new(Some(reference)));
    entity.tags.remove(EntityTags::REFOK);
    main.id_us_plus(reference);
    Ok(())
}

/// Copy override data from `src` onto `dst`, deep-copying the operations when `deep`.
pub fn copy(main: &mut Main, dst: EntityId, src: EntityId, deep: bool) -> Result<(), EngineError> {
    let dst_has = main.entity(dst)?.override_library.is_some();
    let Some(src_container) = main.entity(src)?.override_library.clone() else {
        if dst_has {
            free(main, dst, true)?;
        }
        return Ok(());
    };

    if dst_has {
        clear(main, dst, true)?;
    } else {
        init(main, dst, None)?;
    }

    let reference = if src_container.is_template() {
        src
    } else {
        src_container.reference.unwrap_or(src)
    };

    let entity = main.entity_mut(dst)?;
    if let Some(container) = entity.override_library.as_mut() {
        container.reference = Some(reference);
        if deep {
            container.copy_properties_from(&src_container);
        }
        container.storage = None;
    }
    entity.tags.remove(EntityTags::REFOK);
    main.id_us_plus(reference);
    Ok(())
}

/// Drop the runtime index and every recorded property of `id`'s container.
pub fn clear(main: &mut Main, id: EntityId, release_reference: bool) -> Result<(), EngineError> {
    let entity = main.entity_mut(id)?;
    let Some(container) = entity.override_library.as_mut() else {
        return Ok(());
    };
    container.clear_properties();
    let reference = container.reference;
    if release_reference {
        if let Some(reference) = reference {
            main.id_us_min(reference);
        }
    }
    Ok(())
}

/// Clear and detach `id`'s container.
pub fn free(main: &mut Main, id: EntityId, release_reference: bool) -> Result<(), EngineError> {
    clear(main, id, release_reference)?;
    main.entity_mut(id)?.override_library = None;
    Ok(())
}
