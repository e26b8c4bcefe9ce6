use std::collections::HashMap;

use liboverride_core::{EntityId, IdSet, LinkFlags};

use crate::database::Main;

/// Usage-relation index: for every entity, the entities it links to.
///
/// Traversals consume entries through [`MainRelations::mark_processed`], so that each
/// entity is entered at most once even on cyclic graphs.
pub struct MainRelations {
    to_ids: HashMap<EntityId, Vec<(EntityId, LinkFlags)>>,
    remaining: IdSet,
}

impl MainRelations {
    pub fn build(main: &Main) -> Self {
        let to_ids: HashMap<_, _> = main.iter().map(|e| (e.id, e.links())).collect();
        let remaining = to_ids.keys().copied().collect();
        Self { to_ids, remaining }
    }

    pub fn used_by(&self, id: EntityId) -> &[(EntityId, LinkFlags)] {
        self.to_ids.get(&id).map(Vec::as_slice).unwrap_or(&[])
    }

    /// Entities linking to `id`.
    pub fn users_of(&self, id: EntityId) -> Vec<EntityId> {
        self.to_ids
            .iter()
            .filter(|(_, links)| links.iter().any(|(to, _)| *to == id))
            .map(|(user, _)| *user)
            .collect()
    }

    pub fn is_processed(&self, id: EntityId) -> bool {
        !self.remaining.contains(&id)
    }

    /// Returns false when `id` had already been processed.
    pub fn mark_processed(&mut self, id: EntityId) -> bool {
        self.remaining.remove(&id)
    }
}
