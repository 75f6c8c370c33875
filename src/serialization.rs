// Copyright 2024 Saptak Santra
//
// Licensed under the Apache License, Version 2.0 (the "License");
// you may not use this file except in compliance with the License.
// You may obtain a copy of the License at
//
//     http://www.apache.org/licenses/LICENSE-2.0
//
// Unless required by applicable law or agreed to in writing, software
// distributed under the License is distributed on an "AS IS" BASIS,
// WITHOUT WARRANTIES OR CONDITIONS OF ANY KIND, either express or implied.
// See the License for the specific language governing permissions and
// limitations under the License.

//! Scene serialization
//!
//! A scene is the full state of an entity manager: every archetype, every
//! entity with its id and layer, every referenced shared instance, plus the
//! asset-reference slice. Component payloads travel through the reflection
//! field walk; shared instances are renumbered on load and re-deduplicated
//! through content addressing.

use std::path::Path;

use serde::{Deserialize, Serialize};
use speedy::{Readable, Writable};
use tracing::info;

use crate::component::{Component, ComponentSignature, SharedComponentSignature, SharedInstance};
use crate::entity::Entity;
use crate::error::{EcsError, Result};
use crate::manager::EntityManager;
use crate::reflection::FieldValue;

/// On-disk encoding of a scene
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum SceneFormat {
    Json,
    Binary,
}

const SCENE_VERSION: u32 = 1;

/// One serialized component value: field values when the type is
/// reflected, raw bytes for opaque types.
#[derive(Debug, Clone, Serialize, Deserialize, Readable, Writable)]
pub enum SceneValue {
    Fields(Vec<FieldValue>),
    Raw(Vec<u8>),
}

/// One base: its shared-instance tuple (file-local indices), entities and
/// column payloads. `columns[component][entity]` follows the archetype's
/// normalised component order.
#[derive(Debug, Clone, Serialize, Deserialize, Readable, Writable)]
pub struct SceneBaseRecord {
    pub shared_instances: Vec<u16>,
    pub entities: Vec<u32>,
    pub layers: Vec<u16>,
    pub columns: Vec<Vec<SceneValue>>,
}

/// One archetype: both signatures plus its bases
#[derive(Debug, Clone, Serialize, Deserialize, Readable, Writable)]
pub struct SceneArchetypeRecord {
    pub unique_components: Vec<u16>,
    pub shared_components: Vec<u16>,
    pub bases: Vec<SceneBaseRecord>,
}

/// Deduplicated values of one shared component. Instance ids in base
/// records index into `instances`.
#[derive(Debug, Clone, Serialize, Deserialize, Readable, Writable)]
pub struct SceneSharedTable {
    pub component: u16,
    pub instances: Vec<SceneValue>,
}

/// Full serialized state of an entity manager
#[derive(Debug, Clone, Serialize, Deserialize, Readable, Writable)]
pub struct SceneData {
    pub version: u32,
    pub archetypes: Vec<SceneArchetypeRecord>,
    pub shared_tables: Vec<SceneSharedTable>,
    pub asset_references: Vec<String>,
}

impl SceneData {
    pub fn entity_count(&self) -> usize {
        self.archetypes
            .iter()
            .flat_map(|archetype| archetype.bases.iter())
            .map(|base| base.entities.len())
            .sum()
    }
}

fn encode_value(manager: &EntityManager, component: Component, bytes: &[u8], shared: bool) -> Result<SceneValue> {
    let info = if shared {
        manager.shared_component_info(component)
    } else {
        manager.component_info(component)
    }
    .ok_or_else(|| {
        EcsError::SerializationError(format!("component {} is not registered", component.0))
    })?;
    if info.reflection.fields.is_empty() {
        Ok(SceneValue::Raw(bytes.to_vec()))
    } else {
        Ok(SceneValue::Fields(info.reflection.encode_instance(bytes)?))
    }
}

fn decode_value(manager: &EntityManager, component: Component, value: &SceneValue, shared: bool) -> Result<Vec<u8>> {
    let info = if shared {
        manager.shared_component_info(component)
    } else {
        manager.component_info(component)
    }
    .ok_or_else(|| {
        EcsError::DeserializationError(format!("component {} is not registered", component.0))
    })?;
    match value {
        SceneValue::Raw(bytes) => {
            if bytes.len() != info.size as usize {
                return Err(EcsError::DeserializationError(format!(
                    "component '{}' payload of {} bytes does not match the registered size {}",
                    info.name,
                    bytes.len(),
                    info.size
                )));
            }
            Ok(bytes.clone())
        }
        SceneValue::Fields(values) => info.reflection.decode_instance(values),
    }
}

/// Capture the full state of a manager.
pub fn scene_from_manager(manager: &EntityManager, asset_references: &[String]) -> Result<SceneData> {
    let mut shared_tables: Vec<SceneSharedTable> = Vec::new();
    // (component, instance) -> file-local index
    let mut instance_remap: ahash::AHashMap<(u16, u16), u16> = ahash::AHashMap::new();

    let mut archetypes = Vec::new();
    for archetype in manager.archetypes() {
        let mut record = SceneArchetypeRecord {
            unique_components: archetype
                .unique_signature()
                .iter()
                .map(|component| component.0)
                .collect(),
            shared_components: archetype
                .shared_components()
                .iter()
                .map(|component| component.0)
                .collect(),
            bases: Vec::new(),
        };

        for (_, base, shared_signature) in archetype.bases() {
            if base.is_empty() {
                continue;
            }
            // Remap the instance tuple into file-local indices
            let mut shared_instances = Vec::new();
            for (component, instance) in shared_signature.pairs() {
                let key = (component.0, instance.0);
                let file_index = match instance_remap.get(&key) {
                    Some(&index) => index,
                    None => {
                        let data = manager
                            .shared_instance_data(component, instance)
                            .ok_or(EcsError::SharedInstanceNotFound)?;
                        let encoded = encode_value(manager, component, data, true)?;
                        let table = match shared_tables
                            .iter()
                            .position(|table| table.component == component.0)
                        {
                            Some(position) => &mut shared_tables[position],
                            None => {
                                shared_tables.push(SceneSharedTable {
                                    component: component.0,
                                    instances: Vec::new(),
                                });
                                shared_tables.last_mut().unwrap()
                            }
                        };
                        let index = table.instances.len() as u16;
                        table.instances.push(encoded);
                        instance_remap.insert(key, index);
                        index
                    }
                };
                shared_instances.push(file_index);
            }

            let mut base_record = SceneBaseRecord {
                shared_instances,
                entities: base.entities().iter().map(|entity| entity.0).collect(),
                layers: base
                    .entities()
                    .iter()
                    .map(|&entity| manager.entity_layer(entity).unwrap_or(0))
                    .collect(),
                columns: Vec::new(),
            };
            for component in archetype.unique_signature().iter() {
                let mut column = Vec::with_capacity(base.size() as usize);
                for stream in 0..base.size() {
                    let bytes = base.component_bytes(component, stream).unwrap();
                    column.push(encode_value(manager, component, bytes, false)?);
                }
                base_record.columns.push(column);
            }
            record.bases.push(base_record);
        }
        if !record.bases.is_empty() {
            archetypes.push(record);
        }
    }

    Ok(SceneData {
        version: SCENE_VERSION,
        archetypes,
        shared_tables,
        asset_references: asset_references.to_vec(),
    })
}

/// Rebuild a manager's state from a scene. The manager must carry the
/// scene's component schema and hold no entities.
pub fn apply_scene(manager: &mut EntityManager, scene: &SceneData) -> Result<()> {
    if scene.version != SCENE_VERSION {
        return Err(EcsError::DeserializationError(format!(
            "unsupported scene version {}",
            scene.version
        )));
    }

    // Recreate shared instances through content addressing; dedup survives
    // the renumbering.
    let mut instance_map: ahash::AHashMap<(u16, u16), SharedInstance> = ahash::AHashMap::new();
    for table in &scene.shared_tables {
        let component = Component(table.component);
        for (file_index, value) in table.instances.iter().enumerate() {
            let data = decode_value(manager, component, value, true)?;
            let instance = manager.find_or_create_shared_instance(component, &data);
            instance_map.insert((table.component, file_index as u16), instance);
        }
    }

    for archetype in &scene.archetypes {
        let unique_components: Vec<Component> = archetype
            .unique_components
            .iter()
            .map(|&id| Component(id))
            .collect();
        let unique = ComponentSignature::from_components(&unique_components);

        for base in &archetype.bases {
            if base.shared_instances.len() != archetype.shared_components.len() {
                return Err(EcsError::DeserializationError(
                    "base shared-instance tuple does not match the archetype signature".to_string(),
                ));
            }
            let pairs: Vec<(Component, SharedInstance)> = archetype
                .shared_components
                .iter()
                .zip(&base.shared_instances)
                .map(|(&component, &file_index)| {
                    instance_map
                        .get(&(component, file_index))
                        .map(|&instance| (Component(component), instance))
                        .ok_or_else(|| {
                            EcsError::DeserializationError(format!(
                                "shared instance {file_index} of component {component} is missing"
                            ))
                        })
                })
                .collect::<Result<_>>()?;
            let shared = SharedComponentSignature::from_pairs(&pairs);

            if base.columns.len() != unique_components.len() {
                return Err(EcsError::DeserializationError(
                    "base column count does not match the archetype signature".to_string(),
                ));
            }
            for (row, &entity_bits) in base.entities.iter().enumerate() {
                let entity = Entity(entity_bits);
                let layer = base.layers.get(row).copied().unwrap_or(0);
                manager.restore_entity(entity, layer, &unique, &shared)?;
                for (column, &component) in unique_components.iter().enumerate() {
                    let value = &base.columns[column][row];
                    let data = decode_value(manager, component, value, false)?;
                    manager.set_component(entity, component, &data)?;
                }
            }
        }
    }
    Ok(())
}

/// Serialize a scene to bytes.
pub fn scene_to_bytes(scene: &SceneData, format: SceneFormat) -> Result<Vec<u8>> {
    match format {
        SceneFormat::Json => serde_json::to_vec_pretty(scene)
            .map_err(|err| EcsError::SerializationError(err.to_string())),
        SceneFormat::Binary => scene
            .write_to_vec()
            .map_err(|err| EcsError::SerializationError(err.to_string())),
    }
}

/// Deserialize a scene from bytes.
pub fn scene_from_bytes(data: &[u8], format: SceneFormat) -> Result<SceneData> {
    match format {
        SceneFormat::Json => serde_json::from_slice(data)
            .map_err(|err| EcsError::DeserializationError(err.to_string())),
        SceneFormat::Binary => SceneData::read_from_buffer(data)
            .map_err(|err| EcsError::DeserializationError(err.to_string())),
    }
}

/// Save a manager's state to a scene file.
pub fn save_scene_file(
    manager: &EntityManager,
    asset_references: &[String],
    path: &Path,
    format: SceneFormat,
) -> Result<()> {
    let scene = scene_from_manager(manager, asset_references)?;
    let data = scene_to_bytes(&scene, format)?;
    if let Some(parent) = path.parent() {
        std::fs::create_dir_all(parent)?;
    }
    std::fs::write(path, data)?;
    info!(path = %path.display(), entities = scene.entity_count(), "scene saved");
    Ok(())
}

/// Load a scene file into a manager carrying the matching schema.
/// Returns the asset-reference slice stored alongside the entities.
pub fn load_scene_file(
    manager: &mut EntityManager,
    path: &Path,
    format: SceneFormat,
) -> Result<Vec<String>> {
    let data = std::fs::read(path)?;
    let scene = scene_from_bytes(&data, format)?;
    apply_scene(manager, &scene)?;
    info!(path = %path.display(), entities = scene.entity_count(), "scene loaded");
    Ok(scene.asset_references)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::reflection::{reflect_pod, FieldInfo, TypeDescriptor};

    const POSITION: Component = Component(0);
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
                [0.0f32, 0.0f32],
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

    fn populated_manager() -> EntityManager {
        let mut manager = EntityManager::new();
        schema(&mut manager);

        let red = manager.find_or_create_shared_instance(MATERIAL, &0xFF0000u32.to_ne_bytes());
        let unique = ComponentSignature::from_components(&[POSITION]);
        let shared = SharedComponentSignature::from_pairs(&[(MATERIAL, red)]);
        for index in 0..4 {
            let entity = manager.create_entity(&unique, &shared).unwrap();
            manager
                .write_component(entity, POSITION, [index as f32, 2.0f32])
                .unwrap();
        }
        manager
    }

    #[test]
    fn test_round_trip_preserves_entities_and_values() {
        let manager = populated_manager();
        let scene = scene_from_manager(&manager, &["textures/red.png".to_string()]).unwrap();
        assert_eq!(scene.entity_count(), 4);

        let mut restored = EntityManager::new();
        schema(&mut restored);
        apply_scene(&mut restored, &scene).unwrap();

        assert_eq!(restored.entity_count(), 4);
        manager.for_each_entity(|entity, _| {
            assert!(restored.exists(entity));
            assert_eq!(
                manager.get_component(entity, POSITION).unwrap(),
                restored.get_component(entity, POSITION).unwrap()
            );
            assert_eq!(
                manager.get_shared_component(entity, MATERIAL).unwrap(),
                restored.get_shared_component(entity, MATERIAL).unwrap()
            );
        });
    }

    #[test]
    fn test_shared_dedup_survives_round_trip() {
        let manager = populated_manager();
        let scene = scene_from_manager(&manager, &[]).unwrap();

        let mut restored = EntityManager::new();
        schema(&mut restored);
        apply_scene(&mut restored, &scene).unwrap();

        // Four entities, one deduplicated red instance
        assert_eq!(restored.shared_instance_count(MATERIAL), 1);
    }

    #[test]
    fn test_both_formats_round_trip() {
        let manager = populated_manager();
        let scene = scene_from_manager(&manager, &["a".to_string()]).unwrap();

        for format in [SceneFormat::Json, SceneFormat::Binary] {
            let bytes = scene_to_bytes(&scene, format).unwrap();
            let decoded = scene_from_bytes(&bytes, format).unwrap();
            assert_eq!(decoded.entity_count(), scene.entity_count());
            assert_eq!(decoded.asset_references, scene.asset_references);
        }
    }

    #[test]
    fn test_file_round_trip() {
        let manager = populated_manager();
        let path = std::env::temp_dir().join(format!(
            "forge_ecs_scene_{}.bin",
            std::process::id()
        ));
        save_scene_file(&manager, &[], &path, SceneFormat::Binary).unwrap();

        let mut restored = EntityManager::new();
        schema(&mut restored);
        load_scene_file(&mut restored, &path, SceneFormat::Binary).unwrap();
        assert_eq!(restored.entity_count(), 4);

        let _ = std::fs::remove_file(path);
    }

    #[test]
    fn test_corrupt_scene_is_a_structured_error() {
        let result = scene_from_bytes(b"definitely not a scene", SceneFormat::Json);
        assert!(matches!(result, Err(EcsError::DeserializationError(_))));
    }
}
