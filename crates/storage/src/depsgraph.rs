use std::collections::{BTreeSet, HashMap};

use liboverride_core::{EntityId, IdSet, Recalc};

use crate::database::Main;

/// Pending evaluation invalidations, as recorded for the dependency graph.
#[derive(Debug, Default)]
pub struct DepsgraphState {
    stale: HashMap<EntityId, BTreeSet<Recalc>>,
    relations_dirty: bool,
}

impl DepsgraphState {
    pub fn tag_update(&mut self, id: EntityId, recalc: Recalc) {
        self.stale.entry(id).or_default().insert(recalc);
    }

    pub fn tag_relations_update(&mut self) {
        self.relations_dirty = true;
    }

    pub fn is_tagged(&self, id: EntityId, recalc: Recalc) -> bool {
        self.stale.get(&id).is_some_and(|set| set.contains(&recalc))
    }

    pub fn relations_dirty(&self) -> bool {
        self.relations_dirty
    }

    pub(crate) fn forget(&mut self, ids: &IdSet) {
        self.stale.retain(|id, _| !ids.contains(id));
    }

    /// Consume the pending state, as an evaluation pass would.
    pub fn flush(&mut self) -> Vec<(EntityId, BTreeSet<Recalc>)> {
        self.relations_dirty = false;
        self.stale.drain().collect()
    }
}

impl Main {
    pub fn tag_update(&mut self, id: EntityId, recalc: Recalc) {
        self.depsgraph.tag_update(id, recalc);
    }

    pub fn tag_relations_update(&mut self) {
        self.depsgraph.tag_relations_update();
    }

    pub fn depsgraph(&self) -> &DepsgraphState {
        &self.depsgraph
    }

    pub fn depsgraph_mut(&mut self) -> &mut DepsgraphState {
        &mut self.depsgraph
    }
}
