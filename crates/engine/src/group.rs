//! Group tagging: the set of entities forming one override hierarchy.
//!
//! Both variants run in two phases. The boundary walk follows non-embedded,
//! non-loopback links outward from the root and tags group members. The dependency
//! closure then tags every admissible entity reachable from the root that itself
//! reaches a tagged entity.

use tracing::debug;

use liboverride_core::{EntityId, IdSet, LibraryId, LinkFlags};
use liboverride_storage::{Entity, Main, MainRelations};

use crate::error::EngineError;
use crate::kinds::handler;

/// Per-traversal result of a group tagging pass.
#[derive(Debug, Clone, Default)]
pub struct GroupTags {
    pub tagged: IdSet,
    /// Members whose data is a missing placeholder. Never expanded.
    pub missing: IdSet,
}

impl GroupTags {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn is_tagged(&self, id: EntityId) -> bool {
        self.tagged.contains(&id)
    }

    pub fn is_missing(&self, id: EntityId) -> bool {
        self.missing.contains(&id)
    }

    fn contains(&self, id: EntityId) -> bool {
        self.tagged.contains(&id) || self.missing.contains(&id)
    }

    /// Tagged and missing members together.
    pub fn all(&self) -> IdSet {
        self.tagged.union(&self.missing).copied().collect()
    }
}

// ============================================================================
// Linked side
// ============================================================================

/// Tag the group of linked entities around `root`, a linked entity.
pub fn tag_linked_group(main: &Main, tags: &mut GroupTags, root: EntityId) -> Result<(), EngineError> {
    let library = main.entity(root)?.library;
    tags.tagged.insert(root);

    let mut visited = IdSet::from([root]);
    linked_walk(main, tags, &mut visited, root, library)?;

    let shapes: Vec<EntityId> = tags
        .tagged
        .iter()
        .filter_map(|id| main.get(*id))
        .flat_map(|e| handler(e.kind).bone_shapes(e))
        .collect();
    for shape in shapes {
        tags.tagged.remove(&shape);
        tags.missing.remove(&shape);
    }

    let mut relations = MainRelations::build(main);
    let admissible = |e: &Entity| e.library == library;
    dependencies_tag(main, &mut relations, tags, root, &admissible);

    debug!(root = %root, tagged = tags.tagged.len(), missing = tags.missing.len(), "tagged linked group");
    Ok(())
}

fn linked_walk(
    main: &Main,
    tags: &mut GroupTags,
    visited: &mut IdSet,
    id: EntityId,
    library: Option<LibraryId>,
) -> Result<(), EngineError> {
    for (to, flags) in main.entity(id)?.links() {
        if flags.intersects(LinkFlags::EMBEDDED | LinkFlags::LOOPBACK) || to == id {
            continue;
        }
        let Some(target) = main.get(to) else {
            continue;
        };
        if target.library != library || tags.contains(to) || !visited.insert(to) {
            continue;
        }
        if handler(target.kind).is_group_boundary() {
            if target.is_missing() {
                tags.missing.insert(to);
                continue;
            }
            tags.tagged.insert(to);
        }
        linked_walk(main, tags, visited, to, library)?;
    }
    Ok(())
}

// ============================================================================
// Local side
// ============================================================================

/// Tag the group of local overrides around `root`, a real local override.
///
/// Overrides whose reference is a missing placeholder go into the missing set.
pub fn tag_local_group(main: &Main, tags: &mut GroupTags, root: EntityId) -> Result<(), EngineError> {
    let entity = main.entity(root)?;
    let Some(reference) = entity.override_reference() else {
        return Err(EngineError::NotAnOverride(entity.name().to_string()));
    };
    let library = main.entity(reference)?.library;
    tags.tagged.insert(root);

    let mut visited = IdSet::from([root]);
    local_walk(main, tags, &mut visited, root, library)?;

    let mut relations = MainRelations::build(main);
    let admissible = |e: &Entity| {
        !e.is_linked()
            && e
                .override_reference()
                .and_then(|r| main.get(r))
                .is_some_and(|r| r.library == library)
    };
    dependencies_tag(main, &mut relations, tags, root, &admissible);

    debug!(root = %root, tagged = tags.tagged.len(), missing = tags.missing.len(), "tagged local group");
    Ok(())
}

fn local_walk(
    main: &Main,
    tags: &mut GroupTags,
    visited: &mut IdSet,
    id: EntityId,
    library: Option<LibraryId>,
) -> Result<(), EngineError> {
    let skip = LinkFlags::EMBEDDED | LinkFlags::LOOPBACK | LinkFlags::OVERRIDE_REFERENCE;
    for (to, flags) in main.entity(id)?.links() {
        if flags.intersects(skip) || to == id {
            continue;
        }
        let Some(target) = main.get(to) else {
            continue;
        };
        if target.is_linked() || !target.is_override() || tags.contains(to) || !visited.insert(to) {
            continue;
        }

        // Virtual overrides are walked through but not tagged.
        let Some(reference) = target.override_reference() else {
            local_walk(main, tags, visited, to, library)?;
            continue;
        };
        let Some(reference) = main.get(reference) else {
            continue;
        };
        if reference.library != library {
            continue;
        }
        if reference.is_missing() {
            tags.missing.insert(to);
            continue;
        }
        tags.tagged.insert(to);
        local_walk(main, tags, visited, to, library)?;
    }
    Ok(())
}

// ============================================================================
// Dependency closure
// ============================================================================

/// Post-order: `id` is tagged when one of its admissible, non-loopback dependencies is.
fn dependencies_tag(
    main: &Main,
    relations: &mut MainRelations,
    tags: &mut GroupTags,
    id: EntityId,
    admissible: &dyn Fn(&Entity) -> bool,
) -> bool {
    if !relations.mark_processed(id) {
        return tags.is_tagged(id);
    }
    let used = relations.used_by(id).to_vec();
    for (to, flags) in used {
        if flags.contains(LinkFlags::LOOPBACK) || tags.is_missing(to) {
            continue;
        }
        let Some(target) = main.get(to) else {
            continue;
        };
        if !admissible(target) {
            continue;
        }
        if dependencies_tag(main, relations, tags, to, admissible) {
            tags.tagged.insert(id);
        }
    }
    tags.is_tagged(id)
}
