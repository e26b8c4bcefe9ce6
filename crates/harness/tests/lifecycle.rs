use liboverride_core::{CompareFlags, EntityId, EntityTags, OperationFlags, PropertyValue};
use liboverride_engine::EngineError;
use liboverride_harness::TestStudio;
use liboverride_harness::fixture::set_pointer;
use liboverride_storage::{EntityKind, ObjectType};

fn location(x: f64) -> PropertyValue {
    PropertyValue::FloatArray(vec![x, 2.0, 3.0])
}

/// Character overridden, with the body moved and a local camera parented to it.
fn staged_studio() -> Result<(TestStudio, EntityId, EntityId), Box<dyn std::error::Error>> {
    let mut studio = TestStudio::new()?;
    let root = studio.override_character()?;
    let body = studio.override_of(studio.character.body).ok_or("body not overridden")?;
    studio.set_value(body, "location", location(1.0))?;
    studio.engine.regenerate_all(true)?;

    let camera = studio
        .main_mut()
        .add_entity(EntityKind::Object(ObjectType::Empty), "Camera", None)?;
    set_pointer(studio.main_mut(), camera, "parent", body)?;
    Ok((studio, root, camera))
}

// ============================================================================
// Delete
// ============================================================================

#[test]
fn delete_remaps_local_usages_to_references() -> Result<(), Box<dyn std::error::Error>> {
    let (mut studio, root, camera) = staged_studio()?;
    let c = studio.character;
    let before = studio.main().len();

    let deleted = studio.engine.delete(root)?;

    // Five overrides plus the body mesh's shape key.
    assert_eq!(deleted, 6);
    assert_eq!(studio.main().len(), before - 6);
    assert!(studio.overrides().is_empty());
    let main = studio.main();
    assert_eq!(main.entity(camera)?.pointer("parent"), Some(c.body));
    let master = main.entity(main.master_collection())?;
    assert!(master.id_collection("children").contains(&c.collection));
    assert!(!master.id_collection("children").contains(&root));
    Ok(())
}

#[test]
fn delete_requires_a_real_override() -> Result<(), Box<dyn std::error::Error>> {
    let (mut studio, _, camera) = staged_studio()?;
    assert!(matches!(studio.engine.delete(camera), Err(EngineError::NotAnOverride(_))));
    Ok(())
}

// ============================================================================
// Resync
// ============================================================================

#[test]
fn resync_keeps_names_usages_and_operations() -> Result<(), Box<dyn std::error::Error>> {
    let (mut studio, root, camera) = staged_studio()?;
    let c = studio.character;
    let old_body = studio.override_of(c.body).ok_or("body not overridden")?;

    // The library gained an object since the hierarchy was overridden.
    let prop = studio
        .main_mut()
        .add_entity(EntityKind::Object(ObjectType::Empty), "Prop", Some(c.library))?;
    studio.main_mut().collection_add_object(c.collection, prop)?;

    let new_root = studio.engine.resync(root)?;

    assert_ne!(new_root, root);
    let main = studio.main();
    assert!(!main.contains(root));
    assert!(!main.contains(old_body));
    assert_eq!(main.entity(new_root)?.name(), "Character");
    assert_eq!(main.entity(new_root)?.override_reference(), Some(c.collection));

    let body = studio.override_of(c.body).ok_or("body not overridden")?;
    let prop_override = studio.override_of(prop).ok_or("prop not overridden")?;
    assert_eq!(main.entity(body)?.name(), "Body");
    assert_eq!(main.entity(body)?.data.properties.value("location"), Some(&location(1.0)));
    assert_eq!(main.entity(camera)?.pointer("parent"), Some(body));
    assert!(main.entity(new_root)?.id_collection("objects").contains(&prop_override));
    assert!(main.view_layer_has_object(prop_override));

    let master = main.entity(main.master_collection())?;
    assert!(master.id_collection("children").contains(&new_root));
    assert_eq!(studio.overrides().len(), 6);
    assert!(main.iter().all(|e| e.new_entity.is_none()));

    // Pointer operations that only tracked the hierarchy were not carried over.
    let container = main.entity(body)?.override_library.as_ref().ok_or("no container")?;
    assert!(container.property("location").is_some());
    assert!(container.property("parent").is_none());
    Ok(())
}

fn parent_flags(studio: &TestStudio, id: EntityId) -> Result<OperationFlags, Box<dyn std::error::Error>> {
    let entity = studio.main().entity(id)?;
    let container = entity.override_library.as_ref().ok_or("no container")?;
    let prop = container.property("parent").ok_or("parent not recorded")?;
    Ok(prop.operations()[0].flags)
}

#[test]
fn resync_keeps_a_repointed_parent() -> Result<(), Box<dyn std::error::Error>> {
    let (mut studio, root, _) = staged_studio()?;
    let c = studio.character;
    let body = studio.override_of(c.body).ok_or("body not overridden")?;
    assert!(parent_flags(&studio, body)?.contains(OperationFlags::MATCH_REFERENCE));

    let stand = studio
        .main_mut()
        .add_entity(EntityKind::Object(ObjectType::Empty), "Stand", None)?;
    set_pointer(studio.main_mut(), body, "parent", stand)?;
    let report = studio.engine.regenerate_all(true)?;
    assert_eq!(report.created, 0);
    assert!(!parent_flags(&studio, body)?.contains(OperationFlags::MATCH_REFERENCE));

    studio.engine.resync(root)?;

    let body = studio.override_of(c.body).ok_or("body not overridden")?;
    assert_eq!(studio.main().entity(body)?.pointer("parent"), Some(stand));
    assert!(!parent_flags(&studio, body)?.contains(OperationFlags::MATCH_REFERENCE));
    Ok(())
}

#[test]
fn resync_drops_overrides_of_missing_data() -> Result<(), Box<dyn std::error::Error>> {
    let mut studio = TestStudio::new()?;
    let c = studio.character;
    let root = studio.override_character()?;
    studio.main_mut().entity_mut(c.body)?.tags.insert(EntityTags::MISSING);

    let new_root = studio.engine.resync(root)?;

    assert_eq!(studio.override_of(c.body), None);
    assert!(studio.override_of(c.rig).is_some());
    assert!(studio.main().contains(new_root));
    Ok(())
}

#[test]
fn resync_with_missing_root_reference_is_a_no_op() -> Result<(), Box<dyn std::error::Error>> {
    let mut studio = TestStudio::new()?;
    let c = studio.character;
    let root = studio.override_character()?;
    studio.main_mut().entity_mut(c.collection)?.tags.insert(EntityTags::MISSING);
    let overrides = studio.overrides();

    assert_eq!(studio.engine.resync(root)?, root);
    assert_eq!(studio.overrides(), overrides);
    Ok(())
}

// ============================================================================
// Reset
// ============================================================================

#[test]
fn reset_hierarchy_preserves_nested_override_links() -> Result<(), Box<dyn std::error::Error>> {
    let (mut studio, root, _) = staged_studio()?;
    let c = studio.character;
    let body = studio.override_of(c.body).ok_or("body not overridden")?;
    let rig = studio.override_of(c.rig).ok_or("rig not overridden")?;
    let mesh = studio.override_of(c.mesh).ok_or("mesh not overridden")?;
    studio.set_value(body, "data", PropertyValue::Pointer(Some(c.mesh)))?;
    studio.engine.operations_create(body)?;

    studio.engine.reset_hierarchy(root)?;

    let main = studio.main();
    let entity = main.entity(body)?;
    let container = entity.override_library.as_ref().ok_or("no container")?;
    assert!(container.property("parent").is_some());
    // Pointing back at linked data is not a nested override link.
    assert!(container.property("data").is_none());
    assert!(container.property("location").is_none());
    assert!(!container.needs_reload());
    assert_eq!(entity.pointer("parent"), Some(rig));
    assert_eq!(entity.pointer("data"), Some(c.mesh));
    assert_eq!(
        entity.data.properties.value("location"),
        Some(&PropertyValue::FloatArray(vec![0.0; 3]))
    );
    assert!(entity.tags.contains(EntityTags::REFOK));
    assert_eq!(main.entity(mesh)?.pointer("armature"), Some(rig));
    Ok(())
}

// ============================================================================
// Update and status
// ============================================================================

#[test]
fn update_follows_library_changes_and_keeps_operations() -> Result<(), Box<dyn std::error::Error>> {
    let (mut studio, _, _) = staged_studio()?;
    let c = studio.character;
    let body = studio.override_of(c.body).ok_or("body not overridden")?;
    studio.set_value(c.body, "pass_index", PropertyValue::Int(7))?;
    assert!(!studio.engine.status_check_reference(body)?);

    assert_eq!(studio.engine.update_all(), studio.overrides().len());

    assert!(studio.engine.status_check_reference(body)?);
    assert!(studio.engine.status_check_local(body)?);
    assert_eq!(studio.value(body, "pass_index"), Some(PropertyValue::Int(7)));
    assert_eq!(studio.value(body, "location"), Some(location(1.0)));
    Ok(())
}

#[test]
fn missing_reference_leaves_override_alone() -> Result<(), Box<dyn std::error::Error>> {
    let (mut studio, _, _) = staged_studio()?;
    let c = studio.character;
    let body = studio.override_of(c.body).ok_or("body not overridden")?;
    studio.main_mut().entity_mut(c.body)?.tags.insert(EntityTags::MISSING);
    studio.set_value(body, "location", location(5.0))?;
    let data = studio.main().entity(body)?.data.clone();
    let container = studio.main().entity(body)?.override_library.clone();

    studio.engine.update(body)?;
    assert!(!studio.engine.operations_create(body)?);
    assert!(studio.engine.status_check_local(body)?);
    assert!(studio.engine.status_check_reference(body)?);

    let entity = studio.main().entity(body)?;
    assert_eq!(entity.data, data);
    assert_eq!(
        entity.override_library.as_ref().map(|c| c.properties().to_vec()),
        container.map(|c| c.properties().to_vec())
    );
    Ok(())
}

#[test]
fn applying_recorded_operations_reproduces_the_override() -> Result<(), Box<dyn std::error::Error>> {
    let (studio, _, _) = staged_studio()?;
    let c = studio.character;
    let body = studio.override_of(c.body).ok_or("body not overridden")?;
    let main = studio.main();
    let local = main.entity(body)?;
    let container = local.override_library.as_ref().ok_or("no container")?;
    let reference = &main.entity(c.body)?.data.properties;

    let mut rebuilt = reference.clone();
    let report = studio
        .engine
        .differ()
        .apply(main, &mut rebuilt, &local.data.properties, None, container);
    assert_eq!(report.skipped, 0);
    assert_eq!(rebuilt, local.data.properties);

    let mut check = container.clone();
    let result = studio.engine.differ().compare(
        main,
        &mut rebuilt,
        reference,
        &mut check,
        CompareFlags::IGNORE_NON_OVERRIDABLE,
    );
    assert!(result.matches);
    assert!(!result.created);
    Ok(())
}
