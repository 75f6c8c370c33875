//! Entity change sets
//!
//! Diffing two managers' views of an entity yields a list of add, remove
//! and update records; applying the list replays those edits against a
//! batch of entities. The editor uses this to propagate prefab edits and
//! to reconcile scene and runtime state.

use crate::component::Component;
use crate::entity::Entity;
use crate::error::{EcsError, Result};
use crate::manager::EntityManager;
use crate::reflection::ReflectionTypeChange;

/// What happened to one component
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum EntityChangeKind {
    Add,
    Remove,
    Update,
}

/// One diff record over a `(component, namespace)` pair
#[derive(Debug, Clone)]
pub struct EntityChange {
    pub component: Component,
    pub is_shared: bool,
    pub kind: EntityChangeKind,
    /// For updates: the fields that differ
    pub updated_fields: Vec<ReflectionTypeChange>,
}

/// Diff two managers' views of an entity.
///
/// A missing `source_entity` reports every destination component as an
/// addition. Updates compare values through the destination's reflection
/// metadata; shared components compare the referenced instance values.
pub fn determine_entity_changes(
    source: &EntityManager,
    source_entity: Entity,
    destination: &EntityManager,
    destination_entity: Entity,
) -> Result<Vec<EntityChange>> {
    let destination_unique = destination
        .entity_signature(destination_entity)
        .ok_or(EcsError::InvalidEntity)?
        .clone();
    let destination_shared = destination
        .entity_shared_signature(destination_entity)
        .ok_or(EcsError::InvalidEntity)?
        .components()
        .clone();

    let (source_unique, source_shared) = if source.exists(source_entity) {
        (
            source.entity_signature(source_entity).unwrap().clone(),
            source
                .entity_shared_signature(source_entity)
                .unwrap()
                .components()
                .clone(),
        )
    } else {
        Default::default()
    };

    let mut changes = Vec::new();

    // Additions: present in the destination only
    for component in destination_unique.iter() {
        if !source_unique.contains(component) {
            changes.push(EntityChange {
                component,
                is_shared: false,
                kind: EntityChangeKind::Add,
                updated_fields: Vec::new(),
            });
        }
    }
    for component in destination_shared.iter() {
        if !source_shared.contains(component) {
            changes.push(EntityChange {
                component,
                is_shared: true,
                kind: EntityChangeKind::Add,
                updated_fields: Vec::new(),
            });
        }
    }

    // Removals: present in the source only
    for component in source_unique.iter() {
        if !destination_unique.contains(component) {
            changes.push(EntityChange {
                component,
                is_shared: false,
                kind: EntityChangeKind::Remove,
                updated_fields: Vec::new(),
            });
        }
    }
    for component in source_shared.iter() {
        if !destination_shared.contains(component) {
            changes.push(EntityChange {
                component,
                is_shared: true,
                kind: EntityChangeKind::Remove,
                updated_fields: Vec::new(),
            });
        }
    }

    // Updates: present in both with differing values
    for component in destination_unique.iter() {
        if !source_unique.contains(component) {
            continue;
        }
        let previous = source.get_component(source_entity, component).unwrap();
        let current = destination
            .get_component(destination_entity, component)
            .unwrap();
        let reflection = &destination
            .component_info(component)
            .ok_or(EcsError::ComponentNotFound)?
            .reflection;
        let mut updated_fields = Vec::new();
        reflection.determine_changes(previous, current, &mut updated_fields);
        if !updated_fields.is_empty() {
            changes.push(EntityChange {
                component,
                is_shared: false,
                kind: EntityChangeKind::Update,
                updated_fields,
            });
        }
    }
    for component in destination_shared.iter() {
        if !source_shared.contains(component) {
            continue;
        }
        let previous = source
            .get_shared_component(source_entity, component)
            .ok_or(EcsError::SharedInstanceNotFound)?;
        let current = destination
            .get_shared_component(destination_entity, component)
            .ok_or(EcsError::SharedInstanceNotFound)?;
        let reflection = &destination
            .shared_component_info(component)
            .ok_or(EcsError::ComponentNotFound)?
            .reflection;
        let mut updated_fields = Vec::new();
        reflection.determine_changes(previous, current, &mut updated_fields);
        if !updated_fields.is_empty() {
            changes.push(EntityChange {
                component,
                is_shared: true,
                kind: EntityChangeKind::Update,
                updated_fields,
            });
        }
    }

    Ok(changes)
}

/// Replay a change list against a batch of entities.
///
/// `unique_data` and `shared_data` hold one payload per unique / shared
/// add-or-update record, in change-list order. Adds of present components
/// degrade to updates, removes of absent components are skipped, updates of
/// absent components overwrite with the full payload. Unreferenced shared
/// instances are collected at batch end.
pub fn apply_entity_changes(
    manager: &mut EntityManager,
    entities: &[Entity],
    changes: &[EntityChange],
    unique_data: &[&[u8]],
    shared_data: &[&[u8]],
) -> Result<()> {
    let mut unique_cursor = 0usize;
    let mut shared_cursor = 0usize;
    let mut touched_shared: Vec<Component> = Vec::new();

    for change in changes {
        match (change.is_shared, change.kind) {
            (false, EntityChangeKind::Add) | (false, EntityChangeKind::Update) => {
                let data = *unique_data.get(unique_cursor).ok_or_else(|| {
                    EcsError::DeserializationError(
                        "change list expects more unique payloads than provided".to_string(),
                    )
                })?;
                unique_cursor += 1;
                for &entity in entities {
                    if !manager.has_component(entity, change.component)
                        || change.kind == EntityChangeKind::Add
                    {
                        // add_component overwrites when already present
                        manager.add_component(entity, change.component, data)?;
                    } else {
                        apply_field_update(manager, entity, change, data)?;
                    }
                }
            }
            (false, EntityChangeKind::Remove) => {
                for &entity in entities {
                    match manager.remove_component(entity, change.component) {
                        Ok(()) | Err(EcsError::ComponentNotFound) => {}
                        Err(err) => return Err(err),
                    }
                }
            }
            (true, EntityChangeKind::Add) | (true, EntityChangeKind::Update) => {
                let data = *shared_data.get(shared_cursor).ok_or_else(|| {
                    EcsError::DeserializationError(
                        "change list expects more shared payloads than provided".to_string(),
                    )
                })?;
                shared_cursor += 1;
                let instance = manager.find_or_create_shared_instance(change.component, data);
                for &entity in entities {
                    if manager.has_shared_component(entity, change.component) {
                        manager.change_entity_shared_instance(entity, change.component, instance)?;
                    } else {
                        manager.add_shared_component(entity, change.component, instance)?;
                    }
                }
                if !touched_shared.contains(&change.component) {
                    touched_shared.push(change.component);
                }
            }
            (true, EntityChangeKind::Remove) => {
                for &entity in entities {
                    match manager.remove_shared_component(entity, change.component) {
                        Ok(_) | Err(EcsError::ComponentNotFound) => {}
                        Err(err) => return Err(err),
                    }
                }
                if !touched_shared.contains(&change.component) {
                    touched_shared.push(change.component);
                }
            }
        }
    }

    for component in touched_shared {
        manager.unregister_unreferenced_shared_instances(component);
    }
    Ok(())
}

fn apply_field_update(
    manager: &mut EntityManager,
    entity: Entity,
    change: &EntityChange,
    source_value: &[u8],
) -> Result<()> {
    let reflection = manager
        .component_info(change.component)
        .ok_or(EcsError::ComponentNotFound)?
        .reflection
        .clone();
    let current = manager
        .get_component(entity, change.component)
        .ok_or(EcsError::ComponentNotFound)?;
    let mut updated = current.to_vec();
    reflection.apply_changes(&mut updated, source_value, &change.updated_fields);
    manager.set_component(entity, change.component, &updated)
}

/// Diff-and-replay convenience: pull the payloads straight from the
/// destination manager and apply the change list to `entities` in
/// `manager`.
pub fn apply_changes_from(
    manager: &mut EntityManager,
    entities: &[Entity],
    changes: &[EntityChange],
    payload_source: &EntityManager,
    payload_entity: Entity,
) -> Result<()> {
    let mut unique_data: Vec<Vec<u8>> = Vec::new();
    let mut shared_data: Vec<Vec<u8>> = Vec::new();
    for change in changes {
        if change.kind == EntityChangeKind::Remove {
            continue;
        }
        if change.is_shared {
            let data = payload_source
                .get_shared_component(payload_entity, change.component)
                .ok_or(EcsError::SharedInstanceNotFound)?;
            shared_data.push(data.to_vec());
        } else {
            let data = payload_source
                .get_component(payload_entity, change.component)
                .ok_or(EcsError::ComponentNotFound)?;
            unique_data.push(data.to_vec());
        }
    }
    let unique_refs: Vec<&[u8]> = unique_data.iter().map(Vec::as_slice).collect();
    let shared_refs: Vec<&[u8]> = shared_data.iter().map(Vec::as_slice).collect();
    apply_entity_changes(manager, entities, changes, &unique_refs, &shared_refs)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::component::{ComponentSignature, SharedComponentSignature};
    use crate::reflection::{reflect_pod, FieldInfo, TypeDescriptor};

    const POSITION: Component = Component(0);
    const HEALTH: Component = Component(1);
    const MATERIAL: Component = Component(0);

    fn schema(manager: &mut EntityManager) {
        manager.register_component(
            POSITION,
            "Position",
            reflect_pod(
                vec![
                    FieldInfo {
                        name: "x".to_string(),
                        offset: 0,
                        descriptor: TypeDescriptor::F32,
                    },
                    FieldInfo {
                        name: "y".to_string(),
                        offset: 4,
                        descriptor: TypeDescriptor::F32,
                    },
                ],
                [0.0f32, 0.0],
            ),
            None,
        );
        manager.register_component(
            HEALTH,
            "Health",
            reflect_pod(
                vec![FieldInfo {
                    name: "points".to_string(),
                    offset: 0,
                    descriptor: TypeDescriptor::U32,
                }],
                100u32,
            ),
            None,
        );
        manager.register_shared_component(
            MATERIAL,
            "Material",
            reflect_pod(
                vec![FieldInfo {
                    name: "albedo".to_string(),
                    offset: 0,
                    descriptor: TypeDescriptor::U32,
                }],
                0u32,
            ),
            None,
        );
    }

    fn manager_pair() -> (EntityManager, EntityManager) {
        let mut a = EntityManager::new();
        let mut b = EntityManager::new();
        schema(&mut a);
        schema(&mut b);
        (a, b)
    }

    #[test]
    fn test_diff_reports_add_remove_update() {
        let (mut a, mut b) = manager_pair();
        let position_only = ComponentSignature::from_components(&[POSITION]);
        let health_only = ComponentSignature::from_components(&[HEALTH]);
        let no_shared = SharedComponentSignature::new();

        let source = a.create_entity(&position_only, &no_shared).unwrap();
        let destination = b.create_entity(&health_only, &no_shared).unwrap();

        let changes = determine_entity_changes(&a, source, &b, destination).unwrap();
        assert_eq!(changes.len(), 2);
        assert!(changes.iter().any(|change| change.component == HEALTH
            && change.kind == EntityChangeKind::Add
            && !change.is_shared));
        assert!(changes.iter().any(|change| change.component == POSITION
            && change.kind == EntityChangeKind::Remove));
    }

    #[test]
    fn test_diff_detects_field_updates() {
        let (mut a, mut b) = manager_pair();
        let position_only = ComponentSignature::from_components(&[POSITION]);
        let no_shared = SharedComponentSignature::new();

        let source = a.create_entity(&position_only, &no_shared).unwrap();
        let destination = b.create_entity(&position_only, &no_shared).unwrap();
        b.write_component(destination, POSITION, [5.0f32, 0.0]).unwrap();

        let changes = determine_entity_changes(&a, source, &b, destination).unwrap();
        assert_eq!(changes.len(), 1);
        assert_eq!(changes[0].kind, EntityChangeKind::Update);
        // Only the x field differs
        assert_eq!(changes[0].updated_fields.len(), 1);
        assert_eq!(changes[0].updated_fields[0].field_index, 0);
    }

    #[test]
    fn test_diff_then_apply_reproduces_destination() {
        let (mut a, mut b) = manager_pair();
        let position_only = ComponentSignature::from_components(&[POSITION]);
        let both = ComponentSignature::from_components(&[POSITION, HEALTH]);
        let no_shared = SharedComponentSignature::new();

        let source = a.create_entity(&position_only, &no_shared).unwrap();
        a.write_component(source, POSITION, [1.0f32, 1.0]).unwrap();

        let red = b.find_or_create_shared_instance(MATERIAL, &0xFF0000u32.to_ne_bytes());
        let shared = SharedComponentSignature::from_pairs(&[(MATERIAL, red)]);
        let destination = b.create_entity(&both, &shared).unwrap();
        b.write_component(destination, POSITION, [3.0f32, 4.0]).unwrap();
        b.write_component(destination, HEALTH, 40u32).unwrap();

        let changes = determine_entity_changes(&a, source, &b, destination).unwrap();
        apply_changes_from(&mut a, &[source], &changes, &b, destination).unwrap();

        // The replay made the source observationally equal
        let follow_up = determine_entity_changes(&a, source, &b, destination).unwrap();
        assert!(follow_up.is_empty(), "diff after apply: {follow_up:?}");
        assert_eq!(a.component_value::<u32>(source, HEALTH), Some(40));
        assert_eq!(
            a.get_shared_component(source, MATERIAL).unwrap(),
            &0xFF0000u32.to_ne_bytes()
        );
    }

    #[test]
    fn test_apply_batch_and_shared_collection() {
        let (mut a, mut b) = manager_pair();
        let position_only = ComponentSignature::from_components(&[POSITION]);
        let no_shared = SharedComponentSignature::new();

        let red = a.find_or_create_shared_instance(MATERIAL, &0xFF0000u32.to_ne_bytes());
        let shared = SharedComponentSignature::from_pairs(&[(MATERIAL, red)]);
        let batch = a.create_entities(3, &position_only, &shared).unwrap();

        // Destination entity has no material: the diff removes it
        let destination = b.create_entity(&position_only, &no_shared).unwrap();
        let changes = determine_entity_changes(&a, batch[0], &b, destination).unwrap();
        apply_changes_from(&mut a, &batch, &changes, &b, destination).unwrap();

        for &entity in &batch {
            assert!(!a.has_shared_component(entity, MATERIAL));
        }
        // The red instance lost its last reference and was collected
        assert_eq!(a.shared_instance_count(MATERIAL), 0);
    }

    #[test]
    fn test_remove_of_absent_component_is_skipped() {
        let (mut a, _) = manager_pair();
        let position_only = ComponentSignature::from_components(&[POSITION]);
        let entity = a
            .create_entity(&position_only, &SharedComponentSignature::new())
            .unwrap();

        let changes = vec![EntityChange {
            component: HEALTH,
            is_shared: false,
            kind: EntityChangeKind::Remove,
            updated_fields: Vec::new(),
        }];
        apply_entity_changes(&mut a, &[entity], &changes, &[], &[]).unwrap();
        assert!(a.exists(entity));
    }
}
