use crate::ids::EntityId;

/// Read access to the entity facts the diff engine needs while comparing or applying
/// pointer properties.
pub trait IdLookup: Sync {
    fn name_of(&self, id: EntityId) -> Option<&str>;

    /// Reference of `id`'s override container, if `id` is a real override.
    fn override_reference_of(&self, id: EntityId) -> Option<EntityId>;

    /// True when `local` is an override whose reference is `reference`.
    fn is_override_of(&self, local: EntityId, reference: EntityId) -> bool {
        self.override_reference_of(local) == Some(reference)
    }
}
