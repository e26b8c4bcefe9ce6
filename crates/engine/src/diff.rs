use tracing::{debug, warn};

use liboverride_core::{
    CollectionItem, CompareFlags, EntityId, IdLookup, Operation, OperationFlags, OperationKind,
    OverrideContainer, OverrideTags, Property, PropertyKind, PropertyPath, PropertyTree,
    PropertyValue, SubItem,
};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct CompareResult {
    /// No unrecorded, unrestored difference was found.
    pub matches: bool,
    pub created: bool,
    pub restored: bool,
}

impl Default for CompareResult {
    fn default() -> Self {
        Self {
            matches: true,
            created: false,
            restored: false,
        }
    }
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct ApplyReport {
    pub applied: usize,
    pub skipped: usize,
}

/// Diff and apply over property trees.
pub trait OverrideDiffer: Send + Sync {
    /// Compare `local` against `reference`, recording operations into `container` and
    /// restoring non-overridable values as `flags` ask.
    fn compare(
        &self,
        ids: &dyn IdLookup,
        local: &mut PropertyTree,
        reference: &PropertyTree,
        container: &mut OverrideContainer,
        flags: CompareFlags,
    ) -> CompareResult;

    /// Apply `container`'s operations, reading overridden values from `src` into `dst`.
    fn apply(
        &self,
        ids: &dyn IdLookup,
        dst: &mut PropertyTree,
        src: &PropertyTree,
        storage: Option<&PropertyTree>,
        container: &OverrideContainer,
    ) -> ApplyReport;
}

/// Default differ over the generic property tree.
#[derive(Debug, Clone, Copy, Default)]
pub struct TreeDiffer;

impl OverrideDiffer for TreeDiffer {
    fn compare(
        &self,
        ids: &dyn IdLookup,
        local: &mut PropertyTree,
        reference: &PropertyTree,
        container: &mut OverrideContainer,
        flags: CompareFlags,
    ) -> CompareResult {
        let mut walk = CompareWalk {
            ids,
            container,
            flags,
            result: CompareResult::default(),
        };
        walk.tree(local, reference, None);
        walk.result
    }

    fn apply(
        &self,
        ids: &dyn IdLookup,
        dst: &mut PropertyTree,
        src: &PropertyTree,
        storage: Option<&PropertyTree>,
        container: &OverrideContainer,
    ) -> ApplyReport {
        let mut report = ApplyReport::default();
        for prop in container.properties() {
            let count = prop.operations().len();
            let path = match prop.parsed_path() {
                Ok(path) => path,
                Err(err) => {
                    warn!(path = prop.path(), error = %err, "unparsable override path");
                    report.skipped += count;
                    continue;
                }
            };
            let Some(src_value) = src.resolve(&path).map(|p| p.value.clone()) else {
                warn!(path = %path, "override path does not resolve in source");
                report.skipped += count;
                continue;
            };
            let storage_value = storage
                .and_then(|s| s.resolve(&path))
                .map(|p| p.value.clone());
            let Some(dst_prop) = dst.resolve_mut(&path) else {
                warn!(path = %path, "override path does not resolve in destination");
                report.skipped += count;
                continue;
            };

            for op in prop.operations() {
                if apply_operation(ids, &mut dst_prop.value, &src_value, storage_value.as_ref(), op) {
                    report.applied += 1;
                } else {
                    debug!(path = %path, op = %op.kind, "operation skipped");
                    report.skipped += 1;
                }
            }
        }
        report
    }
}

struct CompareWalk<'a> {
    ids: &'a dyn IdLookup,
    container: &'a mut OverrideContainer,
    flags: CompareFlags,
    result: CompareResult,
}

impl CompareWalk<'_> {
    fn tree(&mut self, local: &mut PropertyTree, reference: &PropertyTree, parent: Option<(&PropertyPath, &str)>) {
        let keys: Vec<String> = local.iter().map(|(key, _)| key.to_string()).collect();
        for key in keys {
            let path = match parent {
                None => PropertyPath::root(key.as_str()),
                Some((base, item)) => base.child(item, key.as_str()),
            };
            let Some(ref_prop) = reference.get(&key) else {
                debug!(path = %path, "property absent from reference");
                continue;
            };
            if let Some(local_prop) = local.get_mut(&key) {
                self.property(local_prop, ref_prop, &path);
            }
        }
    }

    fn property(&mut self, local: &mut Property, reference: &Property, path: &PropertyPath) {
        let kind = local.value.kind();
        if kind != reference.value.kind() {
            debug_assert!(false, "kind mismatch at {path}");
            warn!(path = %path, "local and reference kinds differ, skipped");
            return;
        }

        let overridable = local.is_overridable();
        if !overridable && self.flags.contains(CompareFlags::IGNORE_NON_OVERRIDABLE) {
            return;
        }
        let key = path.to_string();
        if self.flags.contains(CompareFlags::IGNORE_OVERRIDDEN) && self.container.property(&key).is_some() {
            return;
        }

        if overridable && kind == PropertyKind::Collection {
            self.struct_collection(local, reference, path);
            return;
        }
        if local.value == reference.value {
            return;
        }

        if overridable && self.flags.contains(CompareFlags::CREATE) {
            let complete = self.record(&local.value, &reference.value, path);
            if !complete {
                self.result.matches = false;
            }
            return;
        }

        let overridden = self
            .container
            .property(&key)
            .is_some_and(|p| p.operations().iter().any(|op| op.kind != OperationKind::Noop));
        if overridden {
            return;
        }

        if self.flags.contains(CompareFlags::RESTORE) {
            debug!(path = %path, "restored from reference");
            local.value = reference.value.clone();
            self.result.restored = true;
        } else {
            self.result.matches = false;
        }
    }

    /// Find or add an operation, marking it used. `MATCH_REFERENCE` follows `flags`
    /// on every pass, so a repointed property loses it.
    fn operation(
        &mut self,
        path: &PropertyPath,
        kind: PropertyKind,
        op_kind: OperationKind,
        subitem: SubItem,
        flags: OperationFlags,
    ) {
        let (prop, _) = self.container.get_or_create_property(path, kind);
        prop.tags.remove(OverrideTags::UNUSED);
        let entry = prop.get_or_create_operation(op_kind, subitem, true);
        entry.operation.tags.remove(OverrideTags::UNUSED);
        entry
            .operation
            .flags
            .set(OperationFlags::MATCH_REFERENCE, flags.contains(OperationFlags::MATCH_REFERENCE));
        if entry.created {
            entry.operation.flags.insert(flags);
            self.result.created = true;
        }
    }

    /// Find the insertion of `name` regardless of its anchor, or add one. A moved item
    /// keeps its operation with the anchor and index updated in place.
    fn insert_operation(
        &mut self,
        path: &PropertyPath,
        kind: PropertyKind,
        anchor: Option<&str>,
        name: &str,
        local_index: usize,
    ) {
        let (prop, _) = self.container.get_or_create_property(path, kind);
        prop.tags.remove(OverrideTags::UNUSED);
        let existing = prop.operations().iter().position(|op| {
            matches!(op.kind, OperationKind::InsertAfter | OperationKind::InsertBefore)
                && op.subitem.local_name.as_deref() == Some(name)
        });
        let Some(index) = existing else {
            let subitem = SubItem::named(anchor, Some(name)).with_indices(SubItem::ANY_INDEX, local_index as i32);
            let entry = prop.get_or_create_operation(OperationKind::InsertAfter, subitem, true);
            entry.operation.tags.remove(OverrideTags::UNUSED);
            self.result.created = true;
            return;
        };

        let op = &mut prop.operations_mut()[index];
        op.tags.remove(OverrideTags::UNUSED);
        op.kind = OperationKind::InsertAfter;
        op.subitem.reference_name = anchor.map(str::to_string);
        op.subitem.reference_index = SubItem::ANY_INDEX;
        op.subitem.local_index = local_index as i32;
    }

    fn match_flags(&self, local: Option<EntityId>, reference: Option<EntityId>) -> OperationFlags {
        match (local, reference) {
            (Some(l), Some(r)) if self.ids.is_override_of(l, r) => OperationFlags::MATCH_REFERENCE,
            _ => OperationFlags::empty(),
        }
    }

    /// Record operations for a differing value. Returns false when part of the
    /// difference cannot be expressed as operations.
    fn record(&mut self, local: &PropertyValue, reference: &PropertyValue, path: &PropertyPath) -> bool {
        match (local, reference) {
            (PropertyValue::Pointer(l), PropertyValue::Pointer(r)) => {
                let flags = self.match_flags(*l, *r);
                self.operation(path, PropertyKind::Pointer, OperationKind::Replace, SubItem::whole(), flags);
                true
            }
            (PropertyValue::IdCollection(local_ids), PropertyValue::IdCollection(ref_ids)) => {
                self.id_collection(local_ids, ref_ids, path)
            }
            _ => {
                self.operation(path, local.kind(), OperationKind::Replace, SubItem::whole(), OperationFlags::empty());
                true
            }
        }
    }

    fn id_collection(&mut self, local_ids: &[EntityId], ref_ids: &[EntityId], path: &PropertyPath) -> bool {
        let ids = self.ids;
        let mut previous: Option<String> = None;
        for (local_index, &l) in local_ids.iter().enumerate() {
            let Some(name) = ids.name_of(l).map(str::to_string) else {
                continue;
            };
            let paired = ref_ids
                .iter()
                .position(|&r| ids.name_of(r) == Some(name.as_str()));
            match paired {
                Some(ref_index) if ref_ids[ref_index] == l => {}
                Some(ref_index) => {
                    let flags = self.match_flags(Some(l), Some(ref_ids[ref_index]));
                    let subitem = SubItem::named(Some(name.as_str()), Some(name.as_str()))
                        .with_indices(ref_index as i32, local_index as i32);
                    self.operation(path, PropertyKind::IdCollection, OperationKind::Replace, subitem, flags);
                }
                None => {
                    self.insert_operation(path, PropertyKind::IdCollection, previous.as_deref(), &name, local_index);
                }
            }
            previous = Some(name);
        }

        // Items removed locally have no operation to express them.
        ref_ids.iter().all(|&r| {
            let name = ids.name_of(r);
            local_ids.iter().any(|&l| ids.name_of(l) == name)
        })
    }

    fn struct_collection(&mut self, local: &mut Property, reference: &Property, path: &PropertyPath) {
        let (PropertyValue::Collection(local_items), PropertyValue::Collection(ref_items)) =
            (&mut local.value, &reference.value)
        else {
            return;
        };

        let mut inserted = Vec::new();
        let mut previous: Option<String> = None;
        for (index, item) in local_items.iter_mut().enumerate() {
            match ref_items.iter().find(|r| r.name == item.name) {
                Some(ref_item) => self.tree(&mut item.fields, &ref_item.fields, Some((path, &item.name))),
                None => inserted.push((previous.clone(), item.name.clone(), index)),
            }
            previous = Some(item.name.clone());
        }

        for (anchor, name, index) in inserted {
            if self.flags.contains(CompareFlags::CREATE) {
                self.insert_operation(path, PropertyKind::Collection, anchor.as_deref(), &name, index);
            } else {
                let subitem = SubItem::named(anchor.as_deref(), Some(name.as_str()))
                    .with_indices(SubItem::ANY_INDEX, index as i32);
                let recorded = self
                    .container
                    .property(&path.to_string())
                    .is_some_and(|p| p.find_operation(&subitem, true).is_some());
                if !recorded {
                    self.result.matches = false;
                }
            }
        }

        if ref_items
            .iter()
            .any(|r| !local_items.iter().any(|l| l.name == r.name))
        {
            self.result.matches = false;
        }
    }
}

fn apply_operation(
    ids: &dyn IdLookup,
    dst: &mut PropertyValue,
    src: &PropertyValue,
    storage: Option<&PropertyValue>,
    op: &Operation,
) -> bool {
    match op.kind {
        OperationKind::Noop => true,
        OperationKind::Replace => replace(ids, dst, src, &op.subitem),
        OperationKind::InsertAfter | OperationKind::InsertBefore => {
            insert(ids, dst, src, &op.subitem, op.kind == OperationKind::InsertAfter)
        }
        OperationKind::Add | OperationKind::Subtract | OperationKind::Multiply => {
            let Some(storage) = storage else {
                debug_assert!(false, "differential {} operation without storage", op.kind);
                warn!(op = %op.kind, "differential operation needs a storage value");
                return false;
            };
            differential(dst, storage, op.kind)
        }
    }
}

fn has_item_selector(subitem: &SubItem) -> bool {
    subitem.local_name.is_some()
        || subitem.reference_name.is_some()
        || subitem.local_index != SubItem::ANY_INDEX
        || subitem.reference_index != SubItem::ANY_INDEX
}

fn find_id(ids: &dyn IdLookup, items: &[EntityId], name: Option<&str>, index: i32) -> Option<usize> {
    match name {
        Some(name) => items.iter().position(|&id| ids.name_of(id) == Some(name)),
        None if index >= 0 => ((index as usize) < items.len()).then_some(index as usize),
        None => None,
    }
}

fn find_item(items: &[CollectionItem], name: Option<&str>, index: i32) -> Option<usize> {
    match name {
        Some(name) => items.iter().position(|item| item.name == name),
        None if index >= 0 => ((index as usize) < items.len()).then_some(index as usize),
        None => None,
    }
}

fn replace(ids: &dyn IdLookup, dst: &mut PropertyValue, src: &PropertyValue, subitem: &SubItem) -> bool {
    if dst.kind() != src.kind() {
        return false;
    }
    if let (PropertyValue::IdCollection(dst_ids), PropertyValue::IdCollection(src_ids)) = (&mut *dst, src) {
        if has_item_selector(subitem) {
            let Some(src_pos) = find_id(ids, src_ids, subitem.local_name.as_deref(), subitem.local_index) else {
                return false;
            };
            let ref_name = subitem.reference_name.as_deref().or(subitem.local_name.as_deref());
            let Some(dst_pos) = find_id(ids, dst_ids, ref_name, subitem.reference_index) else {
                return false;
            };
            let new = src_ids[src_pos];
            if dst_ids[dst_pos] != new && dst_ids.contains(&new) {
                dst_ids.remove(dst_pos);
            } else {
                dst_ids[dst_pos] = new;
            }
            return true;
        }
    }
    *dst = src.clone();
    true
}

fn insert(
    ids: &dyn IdLookup,
    dst: &mut PropertyValue,
    src: &PropertyValue,
    subitem: &SubItem,
    after: bool,
) -> bool {
    let anchor_name = subitem.reference_name.as_deref();
    match (dst, src) {
        (PropertyValue::IdCollection(dst_ids), PropertyValue::IdCollection(src_ids)) => {
            let Some(src_pos) = find_id(ids, src_ids, subitem.local_name.as_deref(), subitem.local_index) else {
                return false;
            };
            let item = src_ids[src_pos];
            if dst_ids.contains(&item) {
                return true;
            }
            let anchor = anchor_name.and_then(|name| find_id(ids, dst_ids, Some(name), SubItem::ANY_INDEX));
            let at = insertion_index(anchor, dst_ids.len(), after);
            dst_ids.insert(at, item);
            true
        }
        (PropertyValue::Collection(dst_items), PropertyValue::Collection(src_items)) => {
            let Some(src_pos) = find_item(src_items, subitem.local_name.as_deref(), subitem.local_index) else {
                return false;
            };
            let item = &src_items[src_pos];
            if dst_items.iter().any(|d| d.name == item.name) {
                return true;
            }
            let anchor = anchor_name.and_then(|name| find_item(dst_items, Some(name), SubItem::ANY_INDEX));
            let at = insertion_index(anchor, dst_items.len(), after);
            dst_items.insert(at, item.clone());
            true
        }
        _ => false,
    }
}

/// Insert-after without an anchor goes first; insert-before without one goes last.
fn insertion_index(anchor: Option<usize>, len: usize, after: bool) -> usize {
    match (anchor, after) {
        (Some(pos), true) => pos + 1,
        (Some(pos), false) => pos,
        (None, true) => 0,
        (None, false) => len,
    }
}

fn differential(dst: &mut PropertyValue, storage: &PropertyValue, kind: OperationKind) -> bool {
    let combine_f = |a: f64, b: f64| match kind {
        OperationKind::Add => a + b,
        OperationKind::Subtract => a - b,
        _ => a * b,
    };
    match (dst, storage) {
        (PropertyValue::Float(a), PropertyValue::Float(b)) => {
            *a = combine_f(*a, *b);
            true
        }
        (PropertyValue::Int(a), PropertyValue::Int(b)) => {
            *a = match kind {
                OperationKind::Add => a.wrapping_add(*b),
                OperationKind::Subtract => a.wrapping_sub(*b),
                _ => a.wrapping_mul(*b),
            };
            true
        }
        (PropertyValue::FloatArray(a), PropertyValue::FloatArray(b)) => {
            for (x, y) in a.iter_mut().zip(b) {
                *x = combine_f(*x, *y);
            }
            true
        }
        _ => false,
    }
}
