use liboverride_core::{CollectionItem, EntityId, PropertyValue};
use liboverride_storage::{Entity, EntityKind, Main, ObjectType, Pose};

use crate::error::EngineError;

/// Per-kind behaviour consulted by the override machinery.
pub trait KindHandler: Sync {
    /// Objects and collections delimit override groups.
    fn is_group_boundary(&self) -> bool {
        false
    }

    fn is_linkable(&self) -> bool {
        true
    }

    /// Objects used as custom bone shapes by this entity.
    fn bone_shapes(&self, _entity: &Entity) -> Vec<EntityId> {
        Vec::new()
    }

    /// Bring derived runtime data up to date before properties are compared.
    fn ensure_pose(&self, _main: &mut Main, _id: EntityId) -> Result<bool, EngineError> {
        Ok(false)
    }

    /// Fix up dependants once `id`'s payload has been replaced.
    fn after_update(&self, _main: &mut Main, _id: EntityId) -> Result<(), EngineError> {
        Ok(())
    }
}

struct ObjectHandler;
struct ArmatureObjectHandler;
struct CollectionHandler;
struct ArmatureHandler;
struct ShapeKeyHandler;
struct DataHandler;

impl KindHandler for ObjectHandler {
    fn is_group_boundary(&self) -> bool {
        true
    }
}

impl KindHandler for CollectionHandler {
    fn is_group_boundary(&self) -> bool {
        true
    }
}

impl KindHandler for ShapeKeyHandler {
    fn is_linkable(&self) -> bool {
        false
    }
}

impl KindHandler for DataHandler {}

impl KindHandler for ArmatureObjectHandler {
    fn is_group_boundary(&self) -> bool {
        true
    }

    fn bone_shapes(&self, entity: &Entity) -> Vec<EntityId> {
        entity
            .collection_items("pose_bones")
            .iter()
            .filter_map(|bone| bone.fields.value("custom_shape")?.as_pointer().flatten())
            .collect()
    }

    /// Rebuild `pose_bones` from the armature's bones, keeping the settings of bones
    /// that still exist.
    fn ensure_pose(&self, main: &mut Main, id: EntityId) -> Result<bool, EngineError> {
        let object = main.entity(id)?;
        let Some(armature) = object.pointer("data") else {
            return Ok(false);
        };
        let bone_names: Vec<String> = main
            .entity(armature)?
            .collection_items("bones")
            .iter()
            .map(|bone| bone.name.clone())
            .collect();

        let current = object.collection_items("pose_bones");
        let up_to_date = object.data.pose.as_ref().is_some_and(|p| !p.recalc)
            && current.len() == bone_names.len()
            && current.iter().zip(&bone_names).all(|(pb, name)| pb.name == *name);
        if up_to_date {
            return Ok(false);
        }

        let rebuilt: Vec<CollectionItem> = bone_names
            .iter()
            .map(|name| {
                current
                    .iter()
                    .find(|pb| pb.name == *name)
                    .cloned()
                    .unwrap_or_else(|| default_pose_bone(name))
            })
            .collect();

        let object = main.entity_mut(id)?;
        object
            .data
            .properties
            .set("pose_bones", PropertyValue::Collection(rebuilt));
        object.data.pose = Some(Pose { recalc: false });
        Ok(true)
    }
}

impl KindHandler for ArmatureHandler {
    /// Bone data changed: pose caches of every object using this armature are stale.
    fn after_update(&self, main: &mut Main, id: EntityId) -> Result<(), EngineError> {
        let users: Vec<EntityId> = main
            .iter()
            .filter(|e| e.data.pose.is_some() && e.pointer("data") == Some(id))
            .map(|e| e.id)
            .collect();
        for user in users {
            if let Some(pose) = main.entity_mut(user)?.data.pose.as_mut() {
                pose.recalc = true;
            }
        }
        Ok(())
    }
}

pub fn default_pose_bone(name: &str) -> CollectionItem {
    CollectionItem::new(name)
        .with_field("custom_shape", PropertyValue::Pointer(None))
        .with_field("location", PropertyValue::FloatArray(vec![0.0; 3]))
}

pub fn handler(kind: EntityKind) -> &'static dyn KindHandler {
    match kind {
        EntityKind::Object(ObjectType::Armature) => &ArmatureObjectHandler,
        EntityKind::Object(_) => &ObjectHandler,
        EntityKind::Collection => &CollectionHandler,
        EntityKind::Armature => &ArmatureHandler,
        EntityKind::ShapeKey => &ShapeKeyHandler,
        EntityKind::Mesh | EntityKind::Material | EntityKind::Opaque => &DataHandler,
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn ensure_pose_keeps_existing_bone_settings() -> Result<(), EngineError> {
        let mut main = Main::new();
        let armature = main.add_entity(EntityKind::Armature, "Skeleton", None)?;
        let rig = main.add_entity(EntityKind::Object(ObjectType::Armature), "Rig", None)?;
        let shape = main.add_entity(EntityKind::Object(ObjectType::Mesh), "WGT-hand", None)?;
        main.entity_mut(rig)?
            .data
            .properties
            .set("data", PropertyValue::Pointer(Some(armature)));
        main.entity_mut(armature)?.data.properties.set(
            "bones",
            PropertyValue::Collection(vec![CollectionItem::new("Root"), CollectionItem::new("Hand")]),
        );

        let rig_handler = handler(main.entity(rig)?.kind);
        assert!(rig_handler.ensure_pose(&mut main, rig)?);
        assert!(!rig_handler.ensure_pose(&mut main, rig)?);

        let mut bones = main.entity(rig)?.collection_items("pose_bones").to_vec();
        bones[1] = default_pose_bone("Hand").with_field("custom_shape", PropertyValue::Pointer(Some(shape)));
        main.entity_mut(rig)?
            .data
            .properties
            .set("pose_bones", PropertyValue::Collection(bones));
        assert_eq!(rig_handler.bone_shapes(main.entity(rig)?), vec![shape]);

        main.entity_mut(armature)?.data.properties.set(
            "bones",
            PropertyValue::Collection(vec![
                CollectionItem::new("Root"),
                CollectionItem::new("Spine"),
                CollectionItem::new("Hand"),
            ]),
        );
        handler(EntityKind::Armature).after_update(&mut main, armature)?;
        assert!(main.entity(rig)?.data.pose.as_ref().is_some_and(|p| p.recalc));

        assert!(rig_handler.ensure_pose(&mut main, rig)?);
        let names: Vec<&str> = main
            .entity(rig)?
            .collection_items("pose_bones")
            .iter()
            .map(|pb| pb.name.as_str())
            .collect();
        assert_eq!(names, ["Root", "Spine", "Hand"]);
        assert_eq!(rig_handler.bone_shapes(main.entity(rig)?), vec![shape]);
        Ok(())
    }
}
