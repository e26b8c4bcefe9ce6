use serde::{Deserialize, Serialize};
use std::collections::HashMap;

use crate::error::CoreError;
use crate::flags::{OperationFlags, OverrideTags, RuntimeTags};
use crate::ids::EntityId;
use crate::operation::{Operation, OperationKind, SubItem};
use crate::path::PropertyPath;
use crate::property::PropertyKind;

/// All operations recorded against a single property path.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PropertyOverride {
    path: String,
    pub kind: PropertyKind,
    operations: Vec<Operation>,
    pub tags: OverrideTags,
}

/// Result of [`PropertyOverride::get_or_create_operation`].
pub struct OperationEntry<'a> {
    pub operation: &'a mut Operation,
    pub created: bool,
    /// False when only the default-index fallback matched.
    pub strict: bool,
}

impl PropertyOverride {
    pub fn new(path: &PropertyPath, kind: PropertyKind) -> Self {
        Self {
            path: path.to_string(),
            kind,
            operations: Vec::new(),
            tags: OverrideTags::empty(),
        }
    }

    pub fn path(&self) -> &str {
        &self.path
    }

    pub fn parsed_path(&self) -> Result<PropertyPath, CoreError> {
        PropertyPath::parse(&self.path)
    }

    pub fn operations(&self) -> &[Operation] {
        &self.operations
    }

    pub fn operations_mut(&mut self) -> &mut Vec<Operation> {
        &mut self.operations
    }

    pub fn is_unused(&self) -> bool {
        self.tags.contains(OverrideTags::UNUSED)
    }

    /// Look up the operation targeting `subitem`.
    ///
    /// Names take precedence over indices: a local name, when given, must match exactly
    /// (and the reference names must agree), likewise for a reference name. Indices are
    /// tried next. Outside of `strict` mode, an explicit local index may fall back to the
    /// operation recorded for the default index, in which case the returned flag is false.
    pub fn find_operation(&self, subitem: &SubItem, strict: bool) -> Option<(&Operation, bool)> {
        let (index, matched_strict) = self.find_operation_index(subitem, strict)?;
        Some((&self.operations[index], matched_strict))
    }

    pub fn find_operation_mut(
        &mut self,
        subitem: &SubItem,
        strict: bool,
    ) -> Option<(&mut Operation, bool)> {
        let (index, matched_strict) = self.find_operation_index(subitem, strict)?;
        Some((&mut self.operations[index], matched_strict))
    }

    fn find_operation_index(&self, subitem: &SubItem, strict: bool) -> Option<(usize, bool)> {
        let ops = &self.operations;

        if let Some(local_name) = subitem.local_name.as_deref() {
            let index = ops
                .iter()
                .position(|op| op.subitem.local_name.as_deref() == Some(local_name))?;
            let compatible = ops[index].subitem.reference_name == subitem.reference_name;
            return compatible.then_some((index, true));
        }

        if let Some(reference_name) = subitem.reference_name.as_deref() {
            let index = ops
                .iter()
                .position(|op| op.subitem.reference_name.as_deref() == Some(reference_name))?;
            let compatible = ops[index].subitem.local_name == subitem.local_name;
            return compatible.then_some((index, true));
        }

        if let Some(index) = ops
            .iter()
            .position(|op| op.subitem.local_index == subitem.local_index)
        {
            let reference_index = ops[index].subitem.reference_index;
            let accepted = subitem.reference_index == SubItem::ANY_INDEX
                || subitem.reference_index == reference_index;
            return accepted.then_some((index, true));
        }

        if let Some(index) = ops
            .iter()
            .position(|op| op.subitem.reference_index == subitem.reference_index)
        {
            let local_index = ops[index].subitem.local_index;
            let accepted =
                subitem.local_index == SubItem::ANY_INDEX || subitem.local_index == local_index;
            return accepted.then_some((index, true));
        }

        if !strict && subitem.local_index != SubItem::ANY_INDEX {
            if let Some(index) = ops
                .iter()
                .position(|op| op.subitem.local_index == SubItem::ANY_INDEX)
            {
                return Some((index, false));
            }
        }

        None
    }

    pub fn get_or_create_operation(
        &mut self,
        kind: OperationKind,
        subitem: SubItem,
        strict: bool,
    ) -> OperationEntry<'_> {
        match self.find_operation_index(&subitem, strict) {
            Some((index, matched_strict)) => OperationEntry {
                operation: &mut self.operations[index],
                created: false,
                strict: matched_strict,
            },
            None => {
                self.operations.push(Operation::new(kind, subitem));
                let last = self.operations.len() - 1;
                OperationEntry {
                    operation: &mut self.operations[last],
                    created: true,
                    strict: true,
                }
            }
        }
    }

    pub fn delete_operation(&mut self, index: usize) -> Option<Operation> {
        (index < self.operations.len()).then(|| self.operations.remove(index))
    }

    /// Set or clear `tag` on this property and all of its operations.
    pub fn tag(&mut self, tag: OverrideTags, value: bool) {
        self.tags.set(tag, value);
        for op in &mut self.operations {
            op.tags.set(tag, value);
        }
    }
}

#[derive(Debug, Clone, Default)]
struct OverrideRuntime {
    path_index: Option<HashMap<String, usize>>,
    tags: RuntimeTags,
}

/// Override data attached to a local entity: its reference plus the recorded deltas.
///
/// A container without a reference is a template.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct OverrideContainer {
    pub reference: Option<EntityId>,
    properties: Vec<PropertyOverride>,
    /// Shadow entity holding differential values pending a write.
    pub storage: Option<EntityId>,
    #[serde(skip)]
    runtime: OverrideRuntime,
}

impl OverrideContainer {
    pub fn new(reference: Option<EntityId>) -> Self {
        Self {
            reference,
            properties: Vec::new(),
            storage: None,
            runtime: OverrideRuntime::default(),
        }
    }

    pub fn is_template(&self) -> bool {
        self.reference.is_none()
    }

    pub fn properties(&self) -> &[PropertyOverride] {
        &self.properties
    }

    /// Mutable access to the recorded properties. Paths are immutable so the index
    /// stays valid.
    pub fn properties_mut(&mut self) -> &mut [PropertyOverride] {
        &mut self.properties
    }

    pub fn is_empty(&self) -> bool {
        self.properties.is_empty()
    }

    pub fn has_path_index(&self) -> bool {
        self.runtime.path_index.is_some()
    }

    fn ensure_index(&mut self) -> &HashMap<String, usize> {
        let properties = &self.properties;
        self.runtime.path_index.get_or_insert_with(|| {
            properties
                .iter()
                .enumerate()
                .map(|(i, p)| (p.path.clone(), i))
                .collect()
        })
    }

    pub fn find_property(&mut self, path: &str) -> Option<&mut PropertyOverride> {
        let index = *self.ensure_index().get(path)?;
        self.properties.get_mut(index)
    }

    /// Read-only lookup; uses the index when it has already been built.
    pub fn property(&self, path: &str) -> Option<&PropertyOverride> {
        match &self.runtime.path_index {
            Some(index) => index.get(path).and_then(|&i| self.properties.get(i)),
            None => self.properties.iter().find(|p| p.path == path),
        }
    }

    pub fn get_or_create_property(
        &mut self,
        path: &PropertyPath,
        kind: PropertyKind,
    ) -> (&mut PropertyOverride, bool) {
        let key = path.to_string();
        if let Some(&index) = self.ensure_index().get(&key) {
            return (&mut self.properties[index], false);
        }

        let index = self.properties.len();
        self.properties.push(PropertyOverride::new(path, kind));
        if let Some(map) = self.runtime.path_index.as_mut() {
            map.insert(key, index);
        }
        (&mut self.properties[index], true)
    }

    pub fn delete_property(&mut self, path: &str) -> Option<PropertyOverride> {
        let index = self.properties.iter().position(|p| p.path == path)?;
        let removed = self.properties.remove(index);
        if let Some(map) = self.runtime.path_index.as_mut() {
            map.remove(path);
            for slot in map.values_mut() {
                if *slot > index {
                    *slot -= 1;
                }
            }
        }
        Some(removed)
    }

    /// Drop every property and the runtime index.
    pub fn clear_properties(&mut self) {
        self.runtime.path_index = None;
        self.properties.clear();
    }

    /// Replace this container's properties with a deep copy of `other`'s.
    pub fn copy_properties_from(&mut self, other: &OverrideContainer) {
        self.clear_properties();
        self.properties = other.properties.clone();
    }

    pub fn tag_properties(&mut self, tag: OverrideTags, value: bool) {
        for prop in &mut self.properties {
            prop.tag(tag, value);
        }
    }

    /// Remove operations still tagged unused, then properties left empty or still
    /// tagged unused. Returns how many entries were removed.
    pub fn unused_cleanup(&mut self) -> usize {
        let mut removed = 0;
        for prop in &mut self.properties {
            let before = prop.operations.len();
            prop.operations.retain(|op| !op.is_unused());
            removed += before - prop.operations.len();
        }
        self.retain_properties(|p| !p.is_unused() && !p.operations.is_empty(), &mut removed);
        removed
    }

    /// Remove every operation flagged as matching the reference, and properties that
    /// end up empty.
    pub fn drop_match_reference_operations(&mut self) -> usize {
        let mut removed = 0;
        for prop in &mut self.properties {
            let before = prop.operations.len();
            prop.operations
                .retain(|op| !op.flags.contains(OperationFlags::MATCH_REFERENCE));
            removed += before - prop.operations.len();
        }
        let mut emptied = 0;
        self.retain_properties(|p| !p.operations.is_empty(), &mut emptied);
        removed
    }

    fn retain_properties(&mut self, keep: impl Fn(&PropertyOverride) -> bool, removed: &mut usize) {
        let before = self.properties.len();
        self.properties.retain(|p| keep(p));
        if self.properties.len() != before {
            *removed += before - self.properties.len();
            self.runtime.path_index = None;
        }
    }

    /// Digest of the ordered property set, stable across runs.
    pub fn fingerprint(&self) -> Result<blake3::Hash, CoreError> {
        let bytes =
            rmp_serde::to_vec(&self.properties).map_err(|e| CoreError::Serialization(e.to_string()))?;
        Ok(blake3::hash(&bytes))
    }

    pub fn needs_reload(&self) -> bool {
        self.runtime.tags.contains(RuntimeTags::NEEDS_RELOAD)
    }

    pub fn set_needs_reload(&mut self, value: bool) {
        self.runtime.tags.set(RuntimeTags::NEEDS_RELOAD, value);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use proptest::prelude::*;

    fn op(prop: &mut PropertyOverride, subitem: SubItem) {
        prop.operations_mut()
            .push(Operation::new(OperationKind::Replace, subitem));
    }

    fn collection_prop() -> PropertyOverride {
        PropertyOverride::new(&PropertyPath::root("objects"), PropertyKind::IdCollection)
    }

    // ==========================================================================
    // find_operation precedence
    // ==========================================================================

    #[test]
    fn local_name_match_requires_compatible_reference_name() {
        let mut prop = collection_prop();
        op(&mut prop, SubItem::named(Some("RefA"), Some("LocA")));
        op(&mut prop, SubItem::named(None, Some("LocB")));

        let hit = prop.find_operation(&SubItem::named(Some("RefA"), Some("LocA")), true);
        assert!(matches!(hit, Some((_, true))));

        // Reference names disagree.
        assert!(prop.find_operation(&SubItem::named(Some("Other"), Some("LocA")), true).is_none());
        // One side absent, the other present.
        assert!(prop.find_operation(&SubItem::named(None, Some("LocA")), true).is_none());
        assert!(prop.find_operation(&SubItem::named(Some("X"), Some("LocB")), true).is_none());
        // Both absent.
        assert!(prop.find_operation(&SubItem::named(None, Some("LocB")), true).is_some());
    }

    #[test]
    fn local_name_miss_never_falls_back_to_indices() {
        let mut prop = collection_prop();
        op(&mut prop, SubItem::indexed(-1, 2));

        let query = SubItem::named(None, Some("Missing")).with_indices(-1, 2);
        assert!(prop.find_operation(&query, false).is_none());
    }

    #[test]
    fn reference_name_match_requires_compatible_local_name() {
        let mut prop = collection_prop();
        op(&mut prop, SubItem::named(Some("RefA"), None));

        assert!(prop.find_operation(&SubItem::named(Some("RefA"), None), true).is_some());
        assert!(prop.find_operation(&SubItem::named(Some("RefB"), None), true).is_none());
    }

    #[test]
    fn local_index_then_reference_index() {
        let mut prop = collection_prop();
        op(&mut prop, SubItem::indexed(5, 1));
        op(&mut prop, SubItem::indexed(7, 3));

        assert!(prop.find_operation(&SubItem::indexed(-1, 1), true).is_some());
        assert!(prop.find_operation(&SubItem::indexed(5, 1), true).is_some());
        // Local index found but reference index disagrees.
        assert!(prop.find_operation(&SubItem::indexed(6, 1), true).is_none());

        // No local index -1 recorded: falls to the reference index tier.
        let (found, strict) = prop
            .find_operation(&SubItem::indexed(7, -1), true)
            .expect("reference index tier");
        assert!(strict);
        assert_eq!(found.subitem, SubItem::indexed(7, 3));

        // Reference index found but the explicit local index disagrees.
        assert!(prop.find_operation(&SubItem::indexed(7, 9), true).is_none());
        assert!(prop.find_operation(&SubItem::indexed(8, 9), true).is_none());
    }

    #[test]
    fn default_index_fallback_only_when_not_strict() {
        let mut prop = PropertyOverride::new(&PropertyPath::root("location"), PropertyKind::FloatArray);
        op(&mut prop, SubItem::indexed(0, -1));

        assert!(prop.find_operation(&SubItem::indexed(4, 2), true).is_none());
        let (_, strict) = prop
            .find_operation(&SubItem::indexed(4, 2), false)
            .expect("default entry");
        assert!(!strict);

        // Requested local index is the default itself: that is an exact match, strict.
        let (_, strict) = prop
            .find_operation(&SubItem::indexed(-1, -1), false)
            .expect("exact default");
        assert!(strict);
    }

    #[test]
    fn get_or_create_operation_reuses_existing_entry() {
        let mut prop = collection_prop();
        let subitem = SubItem::named(Some("A"), Some("A.001"));

        let entry = prop.get_or_create_operation(OperationKind::Replace, subitem.clone(), true);
        assert!(entry.created);
        entry.operation.flags.insert(OperationFlags::MATCH_REFERENCE);

        let entry = prop.get_or_create_operation(OperationKind::InsertAfter, subitem, true);
        assert!(!entry.created);
        assert_eq!(entry.operation.kind, OperationKind::Replace);
        assert_eq!(prop.operations().len(), 1);
    }

    proptest! {
        #[test]
        fn named_operations_are_found_by_their_own_subitem(
            names in proptest::collection::hash_set("[A-Za-z]{1,6}", 1..8),
        ) {
            let mut prop = collection_prop();
            let names: Vec<String> = names.into_iter().collect();
            for (i, name) in names.iter().enumerate() {
                let subitem = SubItem::named(Some(name), Some(name)).with_indices(i as i32, i as i32);
                prop.get_or_create_operation(OperationKind::Replace, subitem, true);
            }
            prop_assert_eq!(prop.operations().len(), names.len());

            for name in &names {
                let query = SubItem::named(Some(name), Some(name));
                let (found, strict) = prop.find_operation(&query, true).expect("named lookup");
                prop_assert!(strict);
                prop_assert_eq!(found.subitem.local_name.as_deref(), Some(name.as_str()));
            }
        }

        #[test]
        fn indexed_operations_are_found_by_local_index(
            indices in proptest::collection::btree_set(0i32..64, 1..8),
        ) {
            let mut prop = collection_prop();
            for &i in &indices {
                prop.get_or_create_operation(OperationKind::Replace, SubItem::indexed(i + 100, i), true);
            }
            for &i in &indices {
                let (found, _) = prop.find_operation(&SubItem::indexed(-1, i), true).expect("indexed lookup");
                prop_assert_eq!(found.subitem.reference_index, i + 100);
            }
        }
    }

    // ==========================================================================
    // Container
    // ==========================================================================

    #[test]
    fn index_is_built_lazily_and_kept_in_sync() {
        let mut container = OverrideContainer::new(Some(EntityId::new()));
        let a = PropertyPath::root("a");
        let b = PropertyPath::root("b");
        let c = PropertyPath::root("c");

        container.get_or_create_property(&a, PropertyKind::Float);
        assert!(container.has_path_index());
        container.get_or_create_property(&b, PropertyKind::Float);
        container.get_or_create_property(&c, PropertyKind::Float);

        let (_, created) = container.get_or_create_property(&b, PropertyKind::Float);
        assert!(!created);

        container.delete_property("a");
        assert_eq!(container.find_property("c").map(|p| p.path().to_string()), Some("c".into()));
        assert_eq!(container.find_property("b").map(|p| p.path().to_string()), Some("b".into()));
        assert!(container.find_property("a").is_none());

        container.clear_properties();
        assert!(!container.has_path_index());
        assert!(container.is_empty());
    }

    #[test]
    fn unused_cleanup_removes_only_tagged_entries() {
        let mut container = OverrideContainer::new(Some(EntityId::new()));
        for key in ["kept", "stale"] {
            let (prop, _) = container.get_or_create_property(&PropertyPath::root(key), PropertyKind::Int);
            prop.get_or_create_operation(OperationKind::Replace, SubItem::whole(), true);
        }

        container.tag_properties(OverrideTags::UNUSED, true);
        if let Some(prop) = container.find_property("kept") {
            prop.tag(OverrideTags::UNUSED, false);
        }

        let removed = container.unused_cleanup();
        assert_eq!(removed, 2);
        assert!(container.property("kept").is_some());
        assert!(container.property("stale").is_none());
    }

    #[test]
    fn drop_match_reference_operations_prunes_empty_properties() {
        let mut container = OverrideContainer::new(Some(EntityId::new()));
        let (prop, _) = container.get_or_create_property(&PropertyPath::root("parent"), PropertyKind::Pointer);
        let entry = prop.get_or_create_operation(OperationKind::Replace, SubItem::whole(), true);
        entry.operation.flags.insert(OperationFlags::MATCH_REFERENCE);

        let (prop, _) = container.get_or_create_property(&PropertyPath::root("location"), PropertyKind::FloatArray);
        prop.get_or_create_operation(OperationKind::Replace, SubItem::whole(), true);

        assert_eq!(container.drop_match_reference_operations(), 1);
        assert!(container.property("parent").is_none());
        assert!(container.property("location").is_some());
    }

    #[test]
    fn fingerprint_tracks_operation_changes() -> Result<(), CoreError> {
        let mut container = OverrideContainer::new(Some(EntityId::new()));
        let empty = container.fingerprint()?;

        let (prop, _) = container.get_or_create_property(&PropertyPath::root("location"), PropertyKind::FloatArray);
        prop.get_or_create_operation(OperationKind::Replace, SubItem::whole(), true);
        let one = container.fingerprint()?;
        assert_ne!(empty, one);

        let mut copy = OverrideContainer::new(None);
        copy.copy_properties_from(&container);
        assert_eq!(copy.fingerprint()?, one);
        Ok(())
    }
}
