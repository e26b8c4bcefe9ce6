use liboverride_core::{CollectionItem, EntityId, LibraryId, PropertyValue};
use liboverride_engine::{EngineError, OverrideEngine};
use liboverride_storage::{EntityKind, Main, ObjectType, Pose, StorageError};

/// A linked character: a collection holding an armature rig and a skinned body, plus
/// a nested collection of bone-shape widgets.
///
/// ```text
/// Character (collection)
/// ├── Rig (armature object) ── data ──> Skeleton (armature)
/// │     └── pose bone "hand" ── custom_shape ──> WGT-hand
/// ├── Body (mesh object) ── data ──> Body (mesh) ── armature ──> Rig
/// │     └── parent ──> Rig          └── material ──> Skin
/// └── Widgets (collection)
///       └── WGT-hand (empty)
/// ```
#[derive(Debug, Clone, Copy)]
pub struct CharacterLibrary {
    pub library: LibraryId,
    pub collection: EntityId,
    pub widgets: EntityId,
    pub rig: EntityId,
    pub armature: EntityId,
    pub widget: EntityId,
    pub body: EntityId,
    pub mesh: EntityId,
    pub shape_key: EntityId,
    pub material: EntityId,
}

impl CharacterLibrary {
    pub fn build(main: &mut Main) -> Result<Self, StorageError> {
        let library = main.add_library("character.blend");
        let lib = Some(library);

        let collection = main.add_entity(EntityKind::Collection, "Character", lib)?;
        let widgets = main.add_entity(EntityKind::Collection, "Widgets", lib)?;
        let rig = main.add_entity(EntityKind::Object(ObjectType::Armature), "Rig", lib)?;
        let armature = main.add_entity(EntityKind::Armature, "Skeleton", lib)?;
        let widget = main.add_entity(EntityKind::Object(ObjectType::Empty), "WGT-hand", lib)?;
        let body = main.add_entity(EntityKind::Object(ObjectType::Mesh), "Body", lib)?;
        let mesh = main.add_entity(EntityKind::Mesh, "Body", lib)?;
        let material = main.add_entity(EntityKind::Material, "Skin", lib)?;
        let shape_key = main.add_shape_key(mesh)?;

        main.collection_add_object(collection, rig)?;
        main.collection_add_object(collection, body)?;
        main.collection_add_child(collection, widgets)?;
        main.collection_add_object(widgets, widget)?;

        main.entity_mut(armature)?.data.properties.set(
            "bones",
            PropertyValue::Collection(vec![CollectionItem::new("hand"), CollectionItem::new("foot")]),
        );
        let rig_entity = main.entity_mut(rig)?;
        rig_entity.data.properties.set("data", PropertyValue::Pointer(Some(armature)));
        rig_entity.data.properties.set(
            "pose_bones",
            PropertyValue::Collection(vec![
                pose_bone("hand").with_field("custom_shape", PropertyValue::Pointer(Some(widget))),
                pose_bone("foot"),
            ]),
        );
        rig_entity.data.pose = Some(Pose { recalc: false });

        set_pointer(main, body, "data", mesh)?;
        set_pointer(main, body, "parent", rig)?;
        set_pointer(main, mesh, "armature", rig)?;
        set_pointer(main, mesh, "material", material)?;

        Ok(Self {
            library,
            collection,
            widgets,
            rig,
            armature,
            widget,
            body,
            mesh,
            shape_key,
            material,
        })
    }
}

fn pose_bone(name: &str) -> CollectionItem {
    CollectionItem::new(name)
        .with_field("custom_shape", PropertyValue::Pointer(None))
        .with_field("location", PropertyValue::FloatArray(vec![0.0; 3]))
}

pub fn set_pointer(main: &mut Main, owner: EntityId, key: &str, target: EntityId) -> Result<(), StorageError> {
    main.entity_mut(owner)?
        .data
        .properties
        .set(key, PropertyValue::Pointer(Some(target)));
    Ok(())
}

/// Add a local empty instancing `collection` to the scene's master collection.
pub fn instance_collection(main: &mut Main, collection: EntityId, name: &str) -> Result<EntityId, StorageError> {
    let empty = main.add_entity(EntityKind::Object(ObjectType::Empty), name, None)?;
    set_pointer(main, empty, "instance_collection", collection)?;
    let master = main.master_collection();
    main.collection_add_object(master, empty)?;
    Ok(empty)
}

/// A database holding the character library instanced once in the scene, wrapped in
/// an engine.
pub struct TestStudio {
    pub engine: OverrideEngine,
    pub character: CharacterLibrary,
    pub instancer: EntityId,
}

impl TestStudio {
    pub fn new() -> Result<Self, Box<dyn std::error::Error>> {
        Self::with_main(Main::new())
    }

    /// Build the character into `main`, which may already hold other data.
    pub fn with_main(mut main: Main) -> Result<Self, Box<dyn std::error::Error>> {
        crate::init_tracing();
        let character = CharacterLibrary::build(&mut main)?;
        let instancer = instance_collection(&mut main, character.collection, "Character")?;
        Ok(Self {
            engine: OverrideEngine::new(main)?,
            character,
            instancer,
        })
    }

    pub fn main(&self) -> &Main {
        self.engine.main()
    }

    pub fn main_mut(&mut self) -> &mut Main {
        self.engine.main_mut()
    }

    /// Override the whole character through its scene instancer.
    pub fn override_character(&mut self) -> Result<EntityId, EngineError> {
        let (collection, instancer) = (self.character.collection, self.instancer);
        self.engine.create(collection, Some(instancer))
    }

    /// The first local override of `reference`, in database order.
    pub fn override_of(&self, reference: EntityId) -> Option<EntityId> {
        self.main()
            .iter()
            .find(|e| !e.is_linked() && e.override_reference() == Some(reference))
            .map(|e| e.id)
    }

    /// Every real override in the database.
    pub fn overrides(&self) -> Vec<EntityId> {
        self.main()
            .iter()
            .filter(|e| e.is_override_real())
            .map(|e| e.id)
            .collect()
    }

    pub fn set_value(&mut self, id: EntityId, key: &str, value: PropertyValue) -> Result<(), StorageError> {
        self.main_mut().entity_mut(id)?.data.properties.set(key, value);
        Ok(())
    }

    pub fn value(&self, id: EntityId, key: &str) -> Option<PropertyValue> {
        self.main().get(id)?.data.properties.value(key).cloned()
    }
}
