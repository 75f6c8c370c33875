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

//! EntityManager: the top-level entity store
//!
//! Owns the entity pool, the component registry for both namespaces, the
//! archetype map, the shared-instance store, the hierarchies and the query
//! cache. Structural edits keep the pool and the archetype storage mutually
//! consistent: every live entity's info points at the slot that contains it.

use std::num::NonZeroUsize;

use ahash::{AHashMap, RandomState};
use lru::LruCache;
use parking_lot::Mutex;
use smallvec::SmallVec;
use tracing::debug;

use crate::archetype::Archetype;
use crate::component::{
    Component, ComponentFunctions, ComponentInfo, ComponentSignature, SharedComponentSignature,
    SharedInstance, MAX_SIGNATURE_COMPONENTS,
};
use crate::containers::StablePool;
use crate::crash_assert;
use crate::entity::{Entity, EntityInfo, EntityPool};
use crate::error::{EcsError, Result};
use crate::hierarchy::EntityHierarchy;
use crate::query::{ArchetypeQuery, CachedArchetypeQuery};
use crate::reflection::ComponentReflection;

/// Hierarchy tables per manager
pub const MAX_HIERARCHIES: usize = 8;

/// Bound on the query cache
const QUERY_CACHE_CAPACITY: usize = 256;

/// Rows a fresh base starts with
const DEFAULT_BASE_CAPACITY: u32 = 4;

/// One deduplicated shared-component value. The byte buffer is allocated
/// once and never grown, so the data pointer is stable for the instance's
/// lifetime. The hash is of the source bytes the instance was created
/// from, which is what later lookups hash too.
struct SharedSlot {
    data: Vec<u8>,
    hash: u64,
}

struct SharedComponentStore {
    info: ComponentInfo,
    instances: StablePool<SharedSlot>,
    by_hash: AHashMap<u64, SmallVec<[SharedInstance; 2]>>,
}

impl SharedComponentStore {
    fn new(info: ComponentInfo) -> Self {
        Self {
            info,
            instances: StablePool::new(),
            by_hash: AHashMap::new(),
        }
    }

    fn hash_value(&self, data: &[u8]) -> u64 {
        use std::hash::{BuildHasher, Hash, Hasher};
        let mut hasher = RandomState::with_seeds(11, 40, 27, 83).build_hasher();
        data.hash(&mut hasher);
        hasher.finish()
    }

    /// Deep-copy `data` into a fresh instance.
    fn create(&mut self, data: &[u8]) -> SharedInstance {
        crash_assert!(
            data.len() == self.info.size as usize,
            "Shared component '{}' value of {} bytes does not match the registered size {}",
            self.info.name,
            data.len(),
            self.info.size
        );
        let hash = self.hash_value(data);
        let mut slot = SharedSlot {
            data: vec![0; data.len()],
            hash,
        };
        unsafe { self.info.call_copy(slot.data.as_mut_ptr(), data.as_ptr()) };
        let instance = SharedInstance(self.instances.insert(slot));
        self.by_hash.entry(hash).or_default().push(instance);
        instance
    }

    /// Content-addressed lookup: existing instance whose bytes compare
    /// equal, or a fresh deep copy.
    fn find_or_create(&mut self, data: &[u8]) -> SharedInstance {
        let hash = self.hash_value(data);
        if let Some(candidates) = self.by_hash.get(&hash) {
            for &candidate in candidates {
                if let Some(slot) = self.instances.get(candidate.0) {
                    let equal =
                        unsafe { self.info.call_compare(slot.data.as_ptr(), data.as_ptr()) };
                    if equal {
                        return candidate;
                    }
                }
            }
        }
        self.create(data)
    }

    fn get(&self, instance: SharedInstance) -> Option<&[u8]> {
        self.instances.get(instance.0).map(|slot| slot.data.as_slice())
    }

    /// Release the instance's buffers and free its slot.
    fn unregister(&mut self, instance: SharedInstance) -> bool {
        let Some(slot) = self.instances.get(instance.0) else {
            return false;
        };
        let hash = slot.hash;
        if let Some(candidates) = self.by_hash.get_mut(&hash) {
            candidates.retain(|candidate| *candidate != instance);
            if candidates.is_empty() {
                self.by_hash.remove(&hash);
            }
        }
        if let Some(mut slot) = self.instances.remove(instance.0) {
            unsafe { self.info.call_deallocate(slot.data.as_mut_ptr()) };
        }
        true
    }

    /// Deep copy preserving instance handles.
    fn snapshot(&self) -> Self {
        let mut copy = Self::new(self.info.clone());
        for (handle, slot) in self.instances.iter() {
            let mut duplicated = SharedSlot {
                data: vec![0; slot.data.len()],
                hash: slot.hash,
            };
            unsafe {
                copy.info
                    .call_copy(duplicated.data.as_mut_ptr(), slot.data.as_ptr())
            };
            copy.instances.insert_at(handle, duplicated);
            copy.by_hash
                .entry(slot.hash)
                .or_default()
                .push(SharedInstance(handle));
        }
        copy
    }
}

/// Top-level entity store
pub struct EntityManager {
    pool: EntityPool,
    unique_infos: Vec<Option<ComponentInfo>>,
    shared_stores: Vec<Option<SharedComponentStore>>,
    archetypes: Vec<Archetype>,
    archetype_index: AHashMap<(ComponentSignature, ComponentSignature), u16>,
    hierarchies: Vec<Option<EntityHierarchy>>,
    query_cache: Mutex<LruCache<ArchetypeQuery, CachedArchetypeQuery>>,
    base_initial_capacity: u32,
}

impl EntityManager {
    pub fn new() -> Self {
        Self::with_base_capacity(DEFAULT_BASE_CAPACITY)
    }

    pub fn with_base_capacity(base_initial_capacity: u32) -> Self {
        let mut hierarchies = Vec::with_capacity(MAX_HIERARCHIES);
        hierarchies.resize_with(MAX_HIERARCHIES, || None);
        Self {
            pool: EntityPool::new(),
            unique_infos: Vec::new(),
            shared_stores: Vec::new(),
            archetypes: Vec::with_capacity(64),
            archetype_index: AHashMap::with_capacity(64),
            hierarchies,
            query_cache: Mutex::new(LruCache::new(
                NonZeroUsize::new(QUERY_CACHE_CAPACITY).unwrap(),
            )),
            base_initial_capacity,
        }
    }

    // ------------------------------------------------------------------
    // Registration
    // ------------------------------------------------------------------

    pub fn register_component(
        &mut self,
        component: Component,
        name: impl Into<String>,
        reflection: ComponentReflection,
        functions: Option<ComponentFunctions>,
    ) {
        let mut info = ComponentInfo::new(name, reflection);
        info.functions = functions;
        Self::validate_info(&info);
        let index = component.0 as usize;
        if self.unique_infos.len() <= index {
            self.unique_infos.resize_with(index + 1, || None);
        }
        crash_assert!(
            self.unique_infos[index].is_none(),
            "Component {} ('{}') is already registered",
            component.0,
            info.name
        );
        self.unique_infos[index] = Some(info);
    }

    pub fn register_shared_component(
        &mut self,
        component: Component,
        name: impl Into<String>,
        reflection: ComponentReflection,
        functions: Option<ComponentFunctions>,
    ) {
        let mut info = ComponentInfo::new(name, reflection);
        info.functions = functions;
        Self::validate_info(&info);
        let index = component.0 as usize;
        if self.shared_stores.len() <= index {
            self.shared_stores.resize_with(index + 1, || None);
        }
        crash_assert!(
            self.shared_stores[index].is_none(),
            "Shared component {} ('{}') is already registered",
            component.0,
            info.name
        );
        self.shared_stores[index] = Some(SharedComponentStore::new(info));
    }

    fn validate_info(info: &ComponentInfo) {
        crash_assert!(info.size > 0, "Component '{}' has zero size", info.name);
        crash_assert!(
            info.alignment.is_power_of_two() && info.alignment <= 64,
            "Component '{}' alignment {} must be a power of two up to a cache line",
            info.name,
            info.alignment
        );
        crash_assert!(
            info.size % info.alignment == 0,
            "Component '{}' size {} is not a multiple of its alignment {}",
            info.name,
            info.size,
            info.alignment
        );
    }

    pub fn is_component_registered(&self, component: Component) -> bool {
        self.unique_infos
            .get(component.0 as usize)
            .is_some_and(Option::is_some)
    }

    pub fn is_shared_component_registered(&self, component: Component) -> bool {
        self.shared_stores
            .get(component.0 as usize)
            .is_some_and(Option::is_some)
    }

    pub fn component_info(&self, component: Component) -> Option<&ComponentInfo> {
        self.unique_infos.get(component.0 as usize)?.as_ref()
    }

    pub fn shared_component_info(&self, component: Component) -> Option<&ComponentInfo> {
        self.shared_stores
            .get(component.0 as usize)?
            .as_ref()
            .map(|store| &store.info)
    }

    fn unique_info(&self, component: Component) -> &ComponentInfo {
        let Some(info) = self.component_info(component) else {
            crate::error::crash(&format!("Component {} is not registered", component.0));
        };
        info
    }

    fn shared_store(&self, component: Component) -> &SharedComponentStore {
        let Some(store) = self
            .shared_stores
            .get(component.0 as usize)
            .and_then(Option::as_ref)
        else {
            crate::error::crash(&format!("Shared component {} is not registered", component.0));
        };
        store
    }

    fn shared_store_mut(&mut self, component: Component) -> &mut SharedComponentStore {
        let Some(store) = self
            .shared_stores
            .get_mut(component.0 as usize)
            .and_then(Option::as_mut)
        else {
            crate::error::crash(&format!("Shared component {} is not registered", component.0));
        };
        store
    }

    /// Registered unique component ids
    pub fn registered_components(&self) -> impl Iterator<Item = Component> + '_ {
        self.unique_infos
            .iter()
            .enumerate()
            .filter_map(|(index, info)| info.as_ref().map(|_| Component(index as u16)))
    }

    /// Registered shared component ids
    pub fn registered_shared_components(&self) -> impl Iterator<Item = Component> + '_ {
        self.shared_stores
            .iter()
            .enumerate()
            .filter_map(|(index, store)| store.as_ref().map(|_| Component(index as u16)))
    }

    // ------------------------------------------------------------------
    // Archetypes
    // ------------------------------------------------------------------

    fn find_or_create_archetype(
        &mut self,
        unique: &ComponentSignature,
        shared_components: &ComponentSignature,
    ) -> u16 {
        let key = (unique.clone(), shared_components.clone());
        if let Some(&index) = self.archetype_index.get(&key) {
            return index;
        }
        let sizes: SmallVec<[u32; MAX_SIGNATURE_COMPONENTS]> = unique
            .iter()
            .map(|component| self.unique_info(component).size)
            .collect();
        for component in shared_components.iter() {
            // Crash early on unregistered shared ids
            let _ = self.shared_store(component);
        }
        let index = self.archetypes.len();
        assert!(index < u16::MAX as usize, "archetype index space exhausted");
        debug!(archetype = index, components = unique.len(), "creating archetype");
        self.archetypes.push(Archetype::new(
            unique.clone(),
            shared_components.clone(),
            &sizes,
        ));
        self.archetype_index.insert(key, index as u16);
        index as u16
    }

    pub fn archetype_count(&self) -> usize {
        self.archetypes.len()
    }

    pub fn archetype(&self, index: u16) -> Option<&Archetype> {
        self.archetypes.get(index as usize)
    }

    pub fn archetypes(&self) -> &[Archetype] {
        &self.archetypes
    }

    /// Swap-remove an archetype, fixing the moved archetype's pool records
    /// and dropping every cached query.
    fn remove_archetype(&mut self, index: u16) -> Archetype {
        let archetype = self.archetypes.swap_remove(index as usize);
        self.archetype_index.remove(&(
            archetype.unique_signature().clone(),
            archetype.shared_components().clone(),
        ));
        if (index as usize) < self.archetypes.len() {
            let moved = &self.archetypes[index as usize];
            let key = (
                moved.unique_signature().clone(),
                moved.shared_components().clone(),
            );
            self.archetype_index.insert(key, index);
            let mut moved_entities = Vec::new();
            for (_, base, _) in moved.bases() {
                moved_entities.extend_from_slice(base.entities());
            }
            for entity in moved_entities {
                if let Some(info) = self.pool.get_mut(entity) {
                    info.main_archetype = index;
                }
            }
        }
        self.query_cache.lock().clear();
        archetype
    }

    // ------------------------------------------------------------------
    // Entity creation & destruction
    // ------------------------------------------------------------------

    /// Resolve `SharedInstance::INVALID` entries to default-value instances.
    fn resolve_shared_signature(
        &mut self,
        shared: &SharedComponentSignature,
    ) -> SharedComponentSignature {
        let mut resolved = shared.clone();
        for (component, instance) in shared.pairs() {
            if !instance.is_valid() {
                let default = self.shared_store(component).info.reflection.default_data.clone();
                let created = self.shared_store_mut(component).find_or_create(&default);
                resolved.set_instance(component, created);
            } else {
                crash_assert!(
                    self.shared_store(component).get(instance).is_some(),
                    "Shared component {} instance {} does not exist",
                    component.0,
                    instance.0
                );
            }
        }
        resolved
    }

    pub fn create_entity(
        &mut self,
        unique: &ComponentSignature,
        shared: &SharedComponentSignature,
    ) -> Result<Entity> {
        self.create_entities(1, unique, shared).map(|mut v| v.pop().unwrap())
    }

    /// Create `count` entities with default-initialised components.
    pub fn create_entities(
        &mut self,
        count: usize,
        unique: &ComponentSignature,
        shared: &SharedComponentSignature,
    ) -> Result<Vec<Entity>> {
        let resolved_shared = self.resolve_shared_signature(shared);
        let archetype_index =
            self.find_or_create_archetype(unique, resolved_shared.components());
        let base_capacity = self.base_initial_capacity;
        let base_index = self.archetypes[archetype_index as usize]
            .find_or_create_base(&resolved_shared, base_capacity);

        let mut entities = Vec::new();
        self.pool.allocate_many(
            EntityInfo {
                main_archetype: archetype_index,
                base_archetype: base_index,
                stream_index: 0,
                generation: 0,
                layer: 0,
            },
            count,
            &mut entities,
        );

        let base = self.archetypes[archetype_index as usize].base_mut(base_index);
        let copy_position = base.add_entities(&entities);

        // Default-initialise every column from the reflected default data
        let defaults: SmallVec<[*const u8; MAX_SIGNATURE_COMPONENTS]> = unique
            .iter()
            .map(|component| {
                self.unique_infos[component.0 as usize]
                    .as_ref()
                    .unwrap()
                    .reflection
                    .default_data
                    .as_ptr()
            })
            .collect();
        let base = self.archetypes[archetype_index as usize].base_mut(base_index);
        unsafe { base.copy_splat(copy_position, count as u32, &defaults, unique) };

        for (offset, entity) in entities.iter().enumerate() {
            let info = self.pool.get_mut(*entity).unwrap();
            info.stream_index = copy_position + offset as u32;
        }
        Ok(entities)
    }

    /// Recreate an entity under a specific id, used by scene loading. The
    /// pool slot must be free; components start from their default data.
    pub fn restore_entity(
        &mut self,
        entity: Entity,
        layer: u16,
        unique: &ComponentSignature,
        shared: &SharedComponentSignature,
    ) -> Result<()> {
        let resolved_shared = self.resolve_shared_signature(shared);
        let archetype_index = self.find_or_create_archetype(unique, resolved_shared.components());
        let base_capacity = self.base_initial_capacity;
        let base_index = self.archetypes[archetype_index as usize]
            .find_or_create_base(&resolved_shared, base_capacity);

        let base = self.archetypes[archetype_index as usize].base_mut(base_index);
        let stream_index = base.add_entities(&[entity]);
        let defaults: SmallVec<[*const u8; MAX_SIGNATURE_COMPONENTS]> = unique
            .iter()
            .map(|component| {
                self.unique_infos[component.0 as usize]
                    .as_ref()
                    .unwrap()
                    .reflection
                    .default_data
                    .as_ptr()
            })
            .collect();
        let base = self.archetypes[archetype_index as usize].base_mut(base_index);
        unsafe { base.copy_splat(stream_index, 1, &defaults, unique) };

        self.pool.allocate_at(
            entity,
            EntityInfo {
                main_archetype: archetype_index,
                base_archetype: base_index,
                stream_index,
                generation: 0,
                layer,
            },
        );
        Ok(())
    }

    /// Destroy an entity, running deallocate hooks on its unique components.
    pub fn delete_entity(&mut self, entity: Entity) -> Result<()> {
        self.delete_entity_ex(entity, false)
    }

    /// Destroy an entity; optionally collect shared instances that dropped
    /// to zero references.
    pub fn delete_entity_ex(&mut self, entity: Entity, collect_shared: bool) -> Result<()> {
        let info = self.pool.get(entity).ok_or(EcsError::InvalidEntity)?;
        let archetype = &mut self.archetypes[info.main_archetype as usize];
        let shared_components: SmallVec<[Component; MAX_SIGNATURE_COMPONENTS]> = archetype
            .base_shared_signature(info.base_archetype)
            .components()
            .iter()
            .collect();

        // Deallocate hooks before the slot is recycled
        let base = archetype.base_mut(info.base_archetype);
        let signature = base.signature().clone();
        for (column, component) in signature.iter().enumerate() {
            let component_info = self.unique_infos[component.0 as usize].as_ref().unwrap();
            if component_info.functions.is_some() {
                unsafe { component_info.call_deallocate(base.component_ptr(column, info.stream_index)) };
            }
        }

        base.remove_entity(info.stream_index, &mut self.pool);
        self.pool.deallocate(entity);
        for hierarchy in self.hierarchies.iter_mut().flatten() {
            hierarchy.remove(entity);
        }

        if collect_shared {
            for component in shared_components {
                self.unregister_unreferenced_shared_instances(component);
            }
        }
        Ok(())
    }

    /// Duplicate `source` `count` times into its own base. Unique components
    /// are deep-copied when the type registered a copy function.
    pub fn copy_entity(&mut self, source: Entity, count: usize) -> Result<Vec<Entity>> {
        let info = self.pool.get(source).ok_or(EcsError::InvalidEntity)?;

        let mut entities = Vec::new();
        self.pool.allocate_many(
            EntityInfo {
                main_archetype: info.main_archetype,
                base_archetype: info.base_archetype,
                stream_index: 0,
                generation: 0,
                layer: info.layer,
            },
            count,
            &mut entities,
        );

        let base = self.archetypes[info.main_archetype as usize].base_mut(info.base_archetype);
        let copy_position = base.add_entities(&entities);
        // Pointers are taken after growth so they stay valid
        let signature = base.signature().clone();
        for (column, component) in signature.iter().enumerate() {
            let component_info = self.unique_infos[component.0 as usize].as_ref().unwrap();
            let source_ptr = base.component_ptr(column, info.stream_index);
            for offset in 0..count as u32 {
                let destination = base.component_ptr(column, copy_position + offset);
                unsafe { component_info.call_copy(destination, source_ptr) };
            }
        }

        for (offset, entity) in entities.iter().enumerate() {
            let entity_info = self.pool.get_mut(*entity).unwrap();
            entity_info.stream_index = copy_position + offset as u32;
        }
        Ok(entities)
    }

    // ------------------------------------------------------------------
    // Structural edits
    // ------------------------------------------------------------------

    /// Move an entity into the archetype/base identified by the two target
    /// signatures, bitwise-moving the overlapping components. Returns the
    /// entity's new location.
    fn migrate_entity(
        &mut self,
        entity: Entity,
        new_unique: &ComponentSignature,
        new_shared: &SharedComponentSignature,
    ) -> Result<(u16, u16, u32)> {
        let info = self.pool.get(entity).ok_or(EcsError::InvalidEntity)?;
        let src_archetype = info.main_archetype;
        let src_base = info.base_archetype;
        let src_stream = info.stream_index;

        let dst_archetype = self.find_or_create_archetype(new_unique, new_shared.components());
        let base_capacity = self.base_initial_capacity;
        let dst_base = self.archetypes[dst_archetype as usize]
            .find_or_create_base(new_shared, base_capacity);

        if dst_archetype == src_archetype && dst_base == src_base {
            return Ok((dst_archetype, dst_base, src_stream));
        }

        let dst_stream;
        if dst_archetype == src_archetype {
            let archetype = &mut self.archetypes[dst_archetype as usize];
            let (destination, source) = archetype.two_bases_mut(dst_base, src_base);
            dst_stream = destination.add_entities(&[entity]);
            destination.copy_entity_from(dst_stream, source, src_stream);
            source.remove_entity(src_stream, &mut self.pool);
        } else {
            let (destination_archetype, source_archetype) =
                two_mut(&mut self.archetypes, dst_archetype as usize, src_archetype as usize);
            let destination = destination_archetype.base_mut(dst_base);
            let source = source_archetype.base_mut(src_base);
            dst_stream = destination.add_entities(&[entity]);
            destination.copy_entity_from(dst_stream, source, src_stream);
            source.remove_entity(src_stream, &mut self.pool);
        }

        let entity_info = self.pool.get_mut(entity).unwrap();
        entity_info.main_archetype = dst_archetype;
        entity_info.base_archetype = dst_base;
        entity_info.stream_index = dst_stream;
        Ok((dst_archetype, dst_base, dst_stream))
    }

    /// Add a unique component. If the entity already has it the value is
    /// overwritten in place. Empty `data` default-initialises.
    pub fn add_component(&mut self, entity: Entity, component: Component, data: &[u8]) -> Result<()> {
        let info = self.pool.get(entity).ok_or(EcsError::InvalidEntity)?;
        let component_info = self.unique_info(component);
        crash_assert!(
            data.is_empty() || data.len() == component_info.size as usize,
            "Component '{}' payload of {} bytes does not match the registered size {}",
            component_info.name,
            data.len(),
            component_info.size
        );

        let archetype = &self.archetypes[info.main_archetype as usize];
        if archetype.unique_signature().contains(component) {
            return self.set_component(entity, component, data);
        }

        let new_unique = archetype.unique_signature().extended_with(component);
        let new_shared = archetype.base_shared_signature(info.base_archetype).clone();
        let (dst_archetype, dst_base, dst_stream) =
            self.migrate_entity(entity, &new_unique, &new_shared)?;

        let base = self.archetypes[dst_archetype as usize].base_mut(dst_base);
        let column = base.column_index(component).unwrap();
        let destination = base.component_ptr(column, dst_stream);
        let component_info = self.unique_infos[component.0 as usize].as_ref().unwrap();
        let source = if data.is_empty() {
            component_info.reflection.default_data.as_ptr()
        } else {
            data.as_ptr()
        };
        unsafe { component_info.call_copy(destination, source) };
        Ok(())
    }

    /// Remove a unique component, running its deallocate hook first.
    /// Absence is reported, not fatal.
    pub fn remove_component(&mut self, entity: Entity, component: Component) -> Result<()> {
        let info = self.pool.get(entity).ok_or(EcsError::InvalidEntity)?;
        let archetype = &self.archetypes[info.main_archetype as usize];
        if !archetype.unique_signature().contains(component) {
            return Err(EcsError::ComponentNotFound);
        }

        let component_info = self.unique_infos[component.0 as usize].as_ref().unwrap();
        if component_info.functions.is_some() {
            let base = self.archetypes[info.main_archetype as usize].base(info.base_archetype);
            let column = base.column_index(component).unwrap();
            unsafe {
                component_info.call_deallocate(base.component_ptr(column, info.stream_index))
            };
        }

        let archetype = &self.archetypes[info.main_archetype as usize];
        let new_unique = archetype.unique_signature().without(component);
        let new_shared = archetype.base_shared_signature(info.base_archetype).clone();
        self.migrate_entity(entity, &new_unique, &new_shared)?;
        Ok(())
    }

    /// Overwrite an existing unique component value.
    pub fn set_component(&mut self, entity: Entity, component: Component, data: &[u8]) -> Result<()> {
        let info = self.pool.get(entity).ok_or(EcsError::InvalidEntity)?;
        let component_info = self.unique_info(component);
        crash_assert!(
            data.is_empty() || data.len() == component_info.size as usize,
            "Component '{}' payload of {} bytes does not match the registered size {}",
            component_info.name,
            data.len(),
            component_info.size
        );
        let base = self.archetypes[info.main_archetype as usize].base_mut(info.base_archetype);
        let column = base.column_index(component).ok_or(EcsError::ComponentNotFound)?;
        let destination = base.component_ptr(column, info.stream_index);
        let component_info = self.unique_infos[component.0 as usize].as_ref().unwrap();
        let source = if data.is_empty() {
            component_info.reflection.default_data.as_ptr()
        } else {
            data.as_ptr()
        };
        unsafe {
            // Release buffers of the previous value before overwriting
            component_info.call_deallocate(destination);
            component_info.call_copy(destination, source);
        }
        Ok(())
    }

    /// Attach a shared component. `SharedInstance::INVALID` creates the
    /// instance from default data. Re-attaching switches the instance.
    pub fn add_shared_component(
        &mut self,
        entity: Entity,
        component: Component,
        instance: SharedInstance,
    ) -> Result<()> {
        let info = self.pool.get(entity).ok_or(EcsError::InvalidEntity)?;
        let archetype = &self.archetypes[info.main_archetype as usize];
        if archetype.shared_components().contains(component) {
            return self
                .change_entity_shared_instance(entity, component, instance)
                .map(|_| ());
        }
        let pair = SharedComponentSignature::from_pairs(&[(component, instance)]);
        let resolved = self.resolve_shared_signature(&pair);
        let resolved_instance = resolved.instance_for(component).unwrap();

        let archetype = &self.archetypes[info.main_archetype as usize];
        let new_unique = archetype.unique_signature().clone();
        let new_shared = archetype
            .base_shared_signature(info.base_archetype)
            .extended_with(component, resolved_instance);
        self.migrate_entity(entity, &new_unique, &new_shared)?;
        Ok(())
    }

    /// Detach a shared component, returning the instance it referenced.
    pub fn remove_shared_component(
        &mut self,
        entity: Entity,
        component: Component,
    ) -> Result<SharedInstance> {
        let info = self.pool.get(entity).ok_or(EcsError::InvalidEntity)?;
        let archetype = &self.archetypes[info.main_archetype as usize];
        let shared_signature = archetype.base_shared_signature(info.base_archetype);
        let Some(previous) = shared_signature.instance_for(component) else {
            return Err(EcsError::ComponentNotFound);
        };
        let new_unique = archetype.unique_signature().clone();
        let new_shared = shared_signature.without(component);
        self.migrate_entity(entity, &new_unique, &new_shared)?;
        Ok(previous)
    }

    /// Point the entity's shared component at another instance. The entity
    /// moves to the base holding the new tuple (created on demand).
    /// Returns the previous instance so the caller can collect it.
    pub fn change_entity_shared_instance(
        &mut self,
        entity: Entity,
        component: Component,
        new_instance: SharedInstance,
    ) -> Result<SharedInstance> {
        let info = self.pool.get(entity).ok_or(EcsError::InvalidEntity)?;
        let pair = SharedComponentSignature::from_pairs(&[(component, new_instance)]);
        let resolved = self.resolve_shared_signature(&pair);
        let resolved_instance = resolved.instance_for(component).unwrap();

        let archetype = &self.archetypes[info.main_archetype as usize];
        let shared_signature = archetype.base_shared_signature(info.base_archetype);
        let Some(previous) = shared_signature.instance_for(component) else {
            return Err(EcsError::ComponentNotFound);
        };
        if previous == resolved_instance {
            return Ok(previous);
        }
        let new_unique = archetype.unique_signature().clone();
        let mut new_shared = shared_signature.clone();
        new_shared.set_instance(component, resolved_instance);
        self.migrate_entity(entity, &new_unique, &new_shared)?;
        Ok(previous)
    }

    // ------------------------------------------------------------------
    // Shared-instance policy
    // ------------------------------------------------------------------

    /// Content-addressed instance lookup or creation.
    pub fn find_or_create_shared_instance(
        &mut self,
        component: Component,
        data: &[u8],
    ) -> SharedInstance {
        self.shared_store_mut(component).find_or_create(data)
    }

    /// Unconditionally create a new instance (deep copy of `data`).
    pub fn create_shared_instance(&mut self, component: Component, data: &[u8]) -> SharedInstance {
        self.shared_store_mut(component).create(data)
    }

    pub fn shared_instance_data(
        &self,
        component: Component,
        instance: SharedInstance,
    ) -> Option<&[u8]> {
        self.shared_store(component).get(instance)
    }

    pub fn shared_instance_count(&self, component: Component) -> usize {
        self.shared_store(component).instances.len()
    }

    /// Release one instance. The caller is responsible for it being
    /// unreferenced.
    pub fn unregister_shared_instance(
        &mut self,
        component: Component,
        instance: SharedInstance,
    ) -> Result<()> {
        if self.shared_store_mut(component).unregister(instance) {
            Ok(())
        } else {
            Err(EcsError::SharedInstanceNotFound)
        }
    }

    /// Walk every base's tuple, release the instances nothing references.
    /// Returns how many were released.
    pub fn unregister_unreferenced_shared_instances(&mut self, component: Component) -> usize {
        let mut referenced: SmallVec<[SharedInstance; 16]> = SmallVec::new();
        for archetype in &self.archetypes {
            if !archetype.shared_components().contains(component) {
                continue;
            }
            for (_, _, shared_signature) in archetype.bases() {
                if let Some(instance) = shared_signature.instance_for(component) {
                    if !referenced.contains(&instance) {
                        referenced.push(instance);
                    }
                }
            }
        }
        let store = self.shared_store_mut(component);
        let unreferenced: Vec<SharedInstance> = store
            .instances
            .handles()
            .map(SharedInstance)
            .filter(|instance| !referenced.contains(instance))
            .collect();
        let released = unreferenced.len();
        for instance in unreferenced {
            store.unregister(instance);
        }
        released
    }

    // ------------------------------------------------------------------
    // Accessors
    // ------------------------------------------------------------------

    pub fn exists(&self, entity: Entity) -> bool {
        self.pool.exists(entity)
    }

    pub fn entity_info(&self, entity: Entity) -> Option<EntityInfo> {
        self.pool.get(entity)
    }

    pub fn entity_count(&self) -> usize {
        self.pool.len()
    }

    pub fn entity_signature(&self, entity: Entity) -> Option<&ComponentSignature> {
        let info = self.pool.get(entity)?;
        Some(self.archetypes[info.main_archetype as usize].unique_signature())
    }

    pub fn entity_shared_signature(&self, entity: Entity) -> Option<&SharedComponentSignature> {
        let info = self.pool.get(entity)?;
        Some(self.archetypes[info.main_archetype as usize].base_shared_signature(info.base_archetype))
    }

    pub fn has_component(&self, entity: Entity, component: Component) -> bool {
        self.entity_signature(entity)
            .is_some_and(|signature| signature.contains(component))
    }

    pub fn has_shared_component(&self, entity: Entity, component: Component) -> bool {
        self.entity_shared_signature(entity)
            .is_some_and(|signature| signature.components().contains(component))
    }

    /// Bytes of a unique component value. `None` for stale entities or
    /// missing components.
    pub fn get_component(&self, entity: Entity, component: Component) -> Option<&[u8]> {
        let info = self.pool.get(entity)?;
        self.archetypes[info.main_archetype as usize]
            .base(info.base_archetype)
            .component_bytes(component, info.stream_index)
    }

    /// Bytes of the shared value the entity references.
    pub fn get_shared_component(&self, entity: Entity, component: Component) -> Option<&[u8]> {
        let instance = self.entity_shared_signature(entity)?.instance_for(component)?;
        self.shared_store(component).get(instance)
    }

    pub fn entity_shared_instance(
        &self,
        entity: Entity,
        component: Component,
    ) -> Option<SharedInstance> {
        self.entity_shared_signature(entity)?.instance_for(component)
    }

    /// Typed read of a plain-data component.
    pub fn component_value<T: Copy>(&self, entity: Entity, component: Component) -> Option<T> {
        let bytes = self.get_component(entity, component)?;
        crash_assert!(
            bytes.len() == std::mem::size_of::<T>(),
            "Component {} read with a type of {} bytes, registered size is {}",
            component.0,
            std::mem::size_of::<T>(),
            bytes.len()
        );
        Some(unsafe { std::ptr::read_unaligned(bytes.as_ptr() as *const T) })
    }

    /// Typed write of a plain-data component.
    pub fn write_component<T: Copy>(
        &mut self,
        entity: Entity,
        component: Component,
        value: T,
    ) -> Result<()> {
        let size = std::mem::size_of::<T>();
        let bytes =
            unsafe { std::slice::from_raw_parts(&value as *const T as *const u8, size) };
        self.set_component(entity, component, bytes)
    }

    pub fn entity_layer(&self, entity: Entity) -> Option<u16> {
        self.pool.get(entity).map(|info| info.layer)
    }

    pub fn set_entity_layer(&mut self, entity: Entity, layer: u16) -> Result<()> {
        let info = self.pool.get_mut(entity).ok_or(EcsError::InvalidEntity)?;
        info.layer = layer;
        Ok(())
    }

    pub fn for_each_entity(&self, mut visitor: impl FnMut(Entity, EntityInfo)) {
        self.pool.for_each(|entity, info| visitor(entity, info));
    }

    // ------------------------------------------------------------------
    // Queries
    // ------------------------------------------------------------------

    /// Matching `(archetype, base)` pairs for a query, via the cache.
    pub fn query(&self, query: &ArchetypeQuery) -> Vec<(u16, u16)> {
        let mut cache = self.query_cache.lock();
        if !cache.contains(query) {
            let fresh = CachedArchetypeQuery::new(query.clone(), &self.archetypes);
            cache.put(query.clone(), fresh);
        }
        let cached = cache.get_mut(query).unwrap();
        cached.update(&self.archetypes);
        let mut result = Vec::new();
        for &archetype_index in &cached.matches {
            let archetype = &self.archetypes[archetype_index as usize];
            for (base_index, _, _) in archetype.bases() {
                result.push((archetype_index, base_index));
            }
        }
        result
    }

    /// Visit every base matched by a query.
    pub fn for_each_base(
        &self,
        query: &ArchetypeQuery,
        mut visitor: impl FnMut(&crate::archetype::ArchetypeBase, &SharedComponentSignature),
    ) {
        for (archetype_index, base_index) in self.query(query) {
            let archetype = &self.archetypes[archetype_index as usize];
            visitor(
                archetype.base(base_index),
                archetype.base_shared_signature(base_index),
            );
        }
    }

    /// Drop every empty base. The explicit collection API: bases emptied by
    /// removals are otherwise kept allocated.
    pub fn collect_empty_bases(&mut self) {
        for archetype in &mut self.archetypes {
            loop {
                let empty = archetype
                    .bases()
                    .find(|(_, base, _)| base.is_empty())
                    .map(|(index, _, _)| index);
                match empty {
                    Some(index) => archetype.destroy_base(index, &mut self.pool),
                    None => break,
                }
            }
        }
        self.query_cache.lock().clear();
    }

    // ------------------------------------------------------------------
    // Hierarchies
    // ------------------------------------------------------------------

    pub fn create_hierarchy(&mut self, index: usize) {
        crash_assert!(
            index < MAX_HIERARCHIES,
            "Hierarchy index {} out of the {} table bound",
            index,
            MAX_HIERARCHIES
        );
        if self.hierarchies[index].is_none() {
            self.hierarchies[index] = Some(EntityHierarchy::new());
        }
    }

    pub fn hierarchy(&self, index: usize) -> Option<&EntityHierarchy> {
        self.hierarchies.get(index)?.as_ref()
    }

    pub fn set_parent(&mut self, hierarchy: usize, child: Entity, parent: Entity) -> Result<()> {
        if !self.pool.exists(child) || !self.pool.exists(parent) {
            return Err(EcsError::InvalidEntity);
        }
        let table = self
            .hierarchies
            .get_mut(hierarchy)
            .and_then(Option::as_mut)
            .ok_or_else(|| EcsError::HierarchyError(format!("hierarchy {hierarchy} does not exist")))?;
        table.set_parent(child, parent)
    }

    pub fn remove_from_hierarchy(&mut self, hierarchy: usize, entity: Entity) -> Result<()> {
        let table = self
            .hierarchies
            .get_mut(hierarchy)
            .and_then(Option::as_mut)
            .ok_or_else(|| EcsError::HierarchyError(format!("hierarchy {hierarchy} does not exist")))?;
        table.remove(entity);
        Ok(())
    }

    // ------------------------------------------------------------------
    // Bulk removal (module unload)
    // ------------------------------------------------------------------

    /// Strip a unique component from every entity and unregister it.
    /// Deallocate hooks run for every stored value.
    pub fn remove_component_from_all(&mut self, component: Component) {
        if !self.is_component_registered(component) {
            return;
        }
        loop {
            let affected = self.archetypes.iter().position(|archetype| {
                archetype.unique_signature().contains(component)
            });
            let Some(archetype_index) = affected else {
                break;
            };
            let archetype = self.remove_archetype(archetype_index as u16);
            let new_unique = archetype.unique_signature().without(component);
            let component_info = self.unique_infos[component.0 as usize].clone().unwrap();

            for (_, base, shared_signature) in archetype.bases() {
                if base.is_empty() {
                    continue;
                }
                if component_info.functions.is_some() {
                    let column = base.column_index(component).unwrap();
                    for stream in 0..base.size() {
                        unsafe {
                            component_info.call_deallocate(base.component_ptr(column, stream))
                        };
                    }
                }
                self.adopt_base_entities(base, shared_signature, &new_unique);
            }
        }
        self.unique_infos[component.0 as usize] = None;
        debug!(component = component.0, "removed unique component from all entities");
    }

    /// Strip a shared component from every entity, release all its
    /// instances and unregister it.
    pub fn remove_shared_component_from_all(&mut self, component: Component) {
        if !self.is_shared_component_registered(component) {
            return;
        }
        loop {
            let affected = self.archetypes.iter().position(|archetype| {
                archetype.shared_components().contains(component)
            });
            let Some(archetype_index) = affected else {
                break;
            };
            let archetype = self.remove_archetype(archetype_index as u16);
            let new_unique = archetype.unique_signature().clone();

            for (_, base, shared_signature) in archetype.bases() {
                if base.is_empty() {
                    continue;
                }
                let reduced = shared_signature.without(component);
                self.adopt_base_entities(base, &reduced, &new_unique);
            }
        }
        let store = self.shared_store_mut(component);
        let instances: Vec<SharedInstance> = store.instances.handles().map(SharedInstance).collect();
        for instance in instances {
            store.unregister(instance);
        }
        self.shared_stores[component.0 as usize] = None;
        debug!(component = component.0, "removed shared component from all entities");
    }

    /// Bulk-move every entity of `base` into the archetype/base identified
    /// by the target signatures, column by column.
    fn adopt_base_entities(
        &mut self,
        base: &crate::archetype::ArchetypeBase,
        shared_signature: &SharedComponentSignature,
        new_unique: &ComponentSignature,
    ) {
        let dst_archetype =
            self.find_or_create_archetype(new_unique, shared_signature.components());
        let dst_base_index = self.archetypes[dst_archetype as usize]
            .find_or_create_base(shared_signature, base.size().max(1));
        let destination = self.archetypes[dst_archetype as usize].base_mut(dst_base_index);
        let copy_position = destination.add_entities(base.entities());
        for (column, component) in new_unique.iter().enumerate() {
            let Some(src_column) = base.column_index(component) else {
                continue;
            };
            let component_size = destination.component_size(column) as usize;
            unsafe {
                std::ptr::copy_nonoverlapping(
                    base.column_ptr(src_column),
                    destination.component_ptr(column, copy_position),
                    component_size * base.size() as usize,
                );
            }
        }
        for (offset, &entity) in base.entities().iter().enumerate() {
            if let Some(info) = self.pool.get_mut(entity) {
                info.main_archetype = dst_archetype;
                info.base_archetype = dst_base_index;
                info.stream_index = copy_position + offset as u32;
            }
        }
    }

    // ------------------------------------------------------------------
    // Snapshots
    // ------------------------------------------------------------------

    /// Full deep copy: pool, archetypes, shared instances, hierarchies.
    /// The copy shares no storage with the original; its query cache starts
    /// cold.
    pub fn snapshot(&self) -> EntityManager {
        let mut copy = EntityManager::with_base_capacity(self.base_initial_capacity);
        copy.pool = self.pool.clone();
        copy.unique_infos = self.unique_infos.clone();
        copy.shared_stores = self
            .shared_stores
            .iter()
            .map(|store| store.as_ref().map(SharedComponentStore::snapshot))
            .collect();
        copy.hierarchies = self.hierarchies.clone();
        copy.archetype_index = self.archetype_index.clone();

        for archetype in &self.archetypes {
            let sizes: SmallVec<[u32; MAX_SIGNATURE_COMPONENTS]> = archetype
                .unique_signature()
                .iter()
                .map(|component| self.unique_info(component).size)
                .collect();
            let mut duplicated = Archetype::new(
                archetype.unique_signature().clone(),
                archetype.shared_components().clone(),
                &sizes,
            );
            for (_, base, shared_signature) in archetype.bases() {
                let base_index =
                    duplicated.create_base(shared_signature.clone(), base.size().max(1));
                let destination = duplicated.base_mut(base_index);
                destination.add_entities(base.entities());
                for (column, component) in archetype.unique_signature().iter().enumerate() {
                    let component_info = self.unique_info(component);
                    if component_info.functions.is_some() {
                        for stream in 0..base.size() {
                            unsafe {
                                component_info.call_copy(
                                    destination.component_ptr(column, stream),
                                    base.component_ptr(column, stream),
                                );
                            }
                        }
                    } else {
                        let component_size = component_info.size as usize;
                        unsafe {
                            std::ptr::copy_nonoverlapping(
                                base.column_ptr(column),
                                destination.component_ptr(column, 0),
                                component_size * base.size() as usize,
                            );
                        }
                    }
                }
            }
            copy.archetypes.push(duplicated);
        }
        copy
    }

    /// Replace this manager's contents with a deep copy of `other`.
    pub fn copy_from(&mut self, other: &EntityManager) {
        *self = other.snapshot();
    }

    /// Drop all entities, archetypes and instances; keep the registry.
    pub fn clear(&mut self) {
        // Run deallocate hooks so owned buffers are not leaked
        for archetype in &self.archetypes {
            for (_, base, _) in archetype.bases() {
                for (column, component) in archetype.unique_signature().iter().enumerate() {
                    let component_info = self.unique_infos[component.0 as usize].as_ref().unwrap();
                    if component_info.functions.is_some() {
                        for stream in 0..base.size() {
                            unsafe {
                                component_info
                                    .call_deallocate(base.component_ptr(column, stream))
                            };
                        }
                    }
                }
            }
        }
        self.archetypes.clear();
        self.archetype_index.clear();
        self.pool.clear();
        for store in self.shared_stores.iter_mut().flatten() {
            let instances: Vec<SharedInstance> =
                store.instances.handles().map(SharedInstance).collect();
            for instance in instances {
                store.unregister(instance);
            }
        }
        for hierarchy in self.hierarchies.iter_mut().flatten() {
            hierarchy.clear();
        }
        self.query_cache.lock().clear();
    }
}

impl Default for EntityManager {
    fn default() -> Self {
        Self::new()
    }
}

/// Disjoint mutable borrows of two slice elements.
fn two_mut<T>(slice: &mut [T], first: usize, second: usize) -> (&mut T, &mut T) {
    debug_assert_ne!(first, second);
    if first < second {
        let (head, tail) = slice.split_at_mut(second);
        (&mut head[first], &mut tail[0])
    } else {
        let (head, tail) = slice.split_at_mut(first);
        (&mut tail[0], &mut head[second])
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::reflection::{reflect_pod, FieldInfo, TypeDescriptor};

    const POSITION: Component = Component(0);
    const VELOCITY: Component = Component(1);
    const MATERIAL: Component = Component(0);

    #[derive(Clone, Copy, PartialEq, Debug, Default)]
    #[repr(C)]
    struct Position {
        x: f32,
        y: f32,
        z: f32,
        _pad: f32,
    }

    #[derive(Clone, Copy, PartialEq, Debug, Default)]
    #[repr(C)]
    struct Velocity {
        x: f32,
        y: f32,
        z: f32,
        _pad: f32,
    }

    #[derive(Clone, Copy, PartialEq, Debug, Default)]
    #[repr(C)]
    struct Material {
        albedo: u32,
        roughness: f32,
    }

    fn vec3_fields() -> Vec<FieldInfo> {
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
            FieldInfo {
                name: "z".to_string(),
                offset: 8,
                descriptor: TypeDescriptor::F32,
            },
        ]
    }

    fn manager_with_schema() -> EntityManager {
        let mut manager = EntityManager::new();
        manager.register_component(
            POSITION,
            "Position",
            reflect_pod(vec3_fields(), Position::default()),
            None,
        );
        manager.register_component(
            VELOCITY,
            "Velocity",
            reflect_pod(vec3_fields(), Velocity::default()),
            None,
        );
        manager.register_shared_component(
            MATERIAL,
            "Material",
            reflect_pod(
                vec![
                    FieldInfo {
                        name: "albedo".to_string(),
                        offset: 0,
                        descriptor: TypeDescriptor::U32,
                    },
                    FieldInfo {
                        name: "roughness".to_string(),
                        offset: 4,
                        descriptor: TypeDescriptor::F32,
                    },
                ],
                Material::default(),
            ),
            None,
        );
        manager
    }

    fn bytes_of<T: Copy>(value: &T) -> &[u8] {
        unsafe {
            std::slice::from_raw_parts(value as *const T as *const u8, std::mem::size_of::<T>())
        }
    }

    #[test]
    fn test_create_entity_defaults() {
        let mut manager = manager_with_schema();
        let unique = ComponentSignature::from_components(&[POSITION]);
        let entity = manager
            .create_entity(&unique, &SharedComponentSignature::new())
            .unwrap();

        assert!(manager.exists(entity));
        let value: Position = manager.component_value(entity, POSITION).unwrap();
        assert_eq!(value, Position::default());
    }

    #[test]
    fn test_pool_and_slot_stay_symmetric() {
        let mut manager = manager_with_schema();
        let unique = ComponentSignature::from_components(&[POSITION]);
        let entities = manager
            .create_entities(10, &unique, &SharedComponentSignature::new())
            .unwrap();

        manager.delete_entity(entities[3]).unwrap();
        manager.delete_entity(entities[7]).unwrap();

        manager.for_each_entity(|entity, info| {
            let archetype = manager.archetype(info.main_archetype).unwrap();
            let base = archetype.base(info.base_archetype);
            assert_eq!(base.entities()[info.stream_index as usize], entity);
        });
    }

    #[test]
    fn test_add_component_migrates_archetype() {
        let mut manager = manager_with_schema();
        let unique = ComponentSignature::from_components(&[POSITION]);
        let entity = manager
            .create_entity(&unique, &SharedComponentSignature::new())
            .unwrap();
        let position = Position {
            x: 1.0,
            y: 2.0,
            z: 3.0,
            _pad: 0.0,
        };
        manager.write_component(entity, POSITION, position).unwrap();

        let velocity = Velocity {
            x: 1.0,
            y: 2.0,
            z: 3.0,
            _pad: 0.0,
        };
        manager
            .add_component(entity, VELOCITY, bytes_of(&velocity))
            .unwrap();

        let signature = manager.entity_signature(entity).unwrap();
        assert!(signature.contains(POSITION) && signature.contains(VELOCITY));
        assert_eq!(manager.component_value::<Velocity>(entity, VELOCITY), Some(velocity));
        assert_eq!(manager.component_value::<Position>(entity, POSITION), Some(position));
    }

    #[test]
    fn test_remove_missing_component_is_reported() {
        let mut manager = manager_with_schema();
        let unique = ComponentSignature::from_components(&[POSITION]);
        let entity = manager
            .create_entity(&unique, &SharedComponentSignature::new())
            .unwrap();
        let result = manager.remove_component(entity, VELOCITY);
        assert!(matches!(result, Err(EcsError::ComponentNotFound)));
    }

    #[test]
    fn test_stale_entity_is_invalid() {
        let mut manager = manager_with_schema();
        let unique = ComponentSignature::from_components(&[POSITION]);
        let entity = manager
            .create_entity(&unique, &SharedComponentSignature::new())
            .unwrap();
        manager.delete_entity(entity).unwrap();

        assert!(!manager.exists(entity));
        assert!(manager.get_component(entity, POSITION).is_none());
        assert!(matches!(
            manager.delete_entity(entity),
            Err(EcsError::InvalidEntity)
        ));
    }

    #[test]
    fn test_shared_instance_dedup() {
        let mut manager = manager_with_schema();
        let red = Material {
            albedo: 0xFF0000,
            roughness: 0.5,
        };
        let blue = Material {
            albedo: 0x0000FF,
            roughness: 0.5,
        };

        let first = manager.find_or_create_shared_instance(MATERIAL, bytes_of(&red));
        let second = manager.find_or_create_shared_instance(MATERIAL, bytes_of(&red));
        assert_eq!(first, second);
        assert_eq!(manager.shared_instance_count(MATERIAL), 1);

        let third = manager.find_or_create_shared_instance(MATERIAL, bytes_of(&blue));
        assert_ne!(first, third);
        assert_eq!(manager.shared_instance_count(MATERIAL), 2);
    }

    #[test]
    fn test_entities_share_one_instance() {
        let mut manager = manager_with_schema();
        let red = Material {
            albedo: 0xFF0000,
            roughness: 0.5,
        };
        let instance = manager.find_or_create_shared_instance(MATERIAL, bytes_of(&red));
        let unique = ComponentSignature::from_components(&[POSITION]);
        let shared = SharedComponentSignature::from_pairs(&[(MATERIAL, instance)]);

        let a = manager.create_entity(&unique, &shared).unwrap();
        let b = manager.create_entity(&unique, &shared).unwrap();

        assert_eq!(manager.entity_shared_instance(a, MATERIAL), Some(instance));
        assert_eq!(
            manager.entity_shared_instance(a, MATERIAL),
            manager.entity_shared_instance(b, MATERIAL)
        );
        assert_eq!(manager.get_shared_component(a, MATERIAL).unwrap(), bytes_of(&red));
    }

    #[test]
    fn test_change_shared_instance_moves_base() {
        let mut manager = manager_with_schema();
        let red = Material {
            albedo: 0xFF0000,
            roughness: 0.5,
        };
        let blue = Material {
            albedo: 0x0000FF,
            roughness: 0.5,
        };
        let red_instance = manager.find_or_create_shared_instance(MATERIAL, bytes_of(&red));
        let blue_instance = manager.find_or_create_shared_instance(MATERIAL, bytes_of(&blue));

        let unique = ComponentSignature::from_components(&[POSITION]);
        let shared = SharedComponentSignature::from_pairs(&[(MATERIAL, red_instance)]);
        let entity = manager.create_entity(&unique, &shared).unwrap();

        let previous = manager
            .change_entity_shared_instance(entity, MATERIAL, blue_instance)
            .unwrap();
        assert_eq!(previous, red_instance);
        assert_eq!(
            manager.entity_shared_instance(entity, MATERIAL),
            Some(blue_instance)
        );

        let released = manager.unregister_unreferenced_shared_instances(MATERIAL);
        assert_eq!(released, 1);
        assert_eq!(manager.shared_instance_count(MATERIAL), 1);
    }

    #[test]
    fn test_copy_entity_duplicates_values() {
        let mut manager = manager_with_schema();
        let unique = ComponentSignature::from_components(&[POSITION]);
        let entity = manager
            .create_entity(&unique, &SharedComponentSignature::new())
            .unwrap();
        let position = Position {
            x: 4.0,
            y: 5.0,
            z: 6.0,
            _pad: 0.0,
        };
        manager.write_component(entity, POSITION, position).unwrap();

        let copies = manager.copy_entity(entity, 3).unwrap();
        assert_eq!(copies.len(), 3);
        for copy in copies {
            assert_eq!(manager.component_value::<Position>(copy, POSITION), Some(position));
        }
    }

    #[test]
    fn test_query_matches_after_new_archetypes() {
        let mut manager = manager_with_schema();
        let with_position = ComponentSignature::from_components(&[POSITION]);
        manager
            .create_entity(&with_position, &SharedComponentSignature::new())
            .unwrap();

        let query = ArchetypeQuery::new().with_unique(with_position.clone());
        assert_eq!(manager.query(&query).len(), 1);

        let both = ComponentSignature::from_components(&[POSITION, VELOCITY]);
        manager
            .create_entity(&both, &SharedComponentSignature::new())
            .unwrap();
        assert_eq!(manager.query(&query).len(), 2);
    }

    #[test]
    fn test_snapshot_is_independent() {
        let mut manager = manager_with_schema();
        let unique = ComponentSignature::from_components(&[POSITION]);
        let entities = manager
            .create_entities(5, &unique, &SharedComponentSignature::new())
            .unwrap();
        let snapshot = manager.snapshot();

        manager.delete_entity(entities[0]).unwrap();
        assert_eq!(manager.entity_count(), 4);
        assert_eq!(snapshot.entity_count(), 5);
        assert!(snapshot.exists(entities[0]));

        // Restore brings the deleted entity back
        manager.copy_from(&snapshot);
        assert!(manager.exists(entities[0]));
    }

    #[test]
    fn test_remove_component_from_all_strips_storage() {
        let mut manager = manager_with_schema();
        let both = ComponentSignature::from_components(&[POSITION, VELOCITY]);
        let entities = manager
            .create_entities(20, &both, &SharedComponentSignature::new())
            .unwrap();

        manager.remove_component_from_all(VELOCITY);
        assert!(!manager.is_component_registered(VELOCITY));
        for entity in entities {
            assert!(manager.exists(entity));
            let signature = manager.entity_signature(entity).unwrap();
            assert!(signature.contains(POSITION));
            assert!(!signature.contains(VELOCITY));
        }
    }

    #[test]
    fn test_remove_and_readd_restores_value() {
        let mut manager = manager_with_schema();
        let both = ComponentSignature::from_components(&[POSITION, VELOCITY]);
        let entity = manager
            .create_entity(&both, &SharedComponentSignature::new())
            .unwrap();
        let velocity = Velocity {
            x: 9.0,
            y: 8.0,
            z: 7.0,
            _pad: 0.0,
        };
        manager.write_component(entity, VELOCITY, velocity).unwrap();

        manager.remove_component(entity, VELOCITY).unwrap();
        assert!(!manager.has_component(entity, VELOCITY));

        manager
            .add_component(entity, VELOCITY, bytes_of(&velocity))
            .unwrap();
        assert_eq!(manager.component_value::<Velocity>(entity, VELOCITY), Some(velocity));
    }

    #[test]
    fn test_hierarchy_cleanup_on_delete() {
        let mut manager = manager_with_schema();
        let unique = ComponentSignature::from_components(&[POSITION]);
        let parent = manager
            .create_entity(&unique, &SharedComponentSignature::new())
            .unwrap();
        let child = manager
            .create_entity(&unique, &SharedComponentSignature::new())
            .unwrap();

        manager.create_hierarchy(0);
        manager.set_parent(0, child, parent).unwrap();
        assert_eq!(manager.hierarchy(0).unwrap().parent(child), Some(parent));

        manager.delete_entity(parent).unwrap();
        assert_eq!(manager.hierarchy(0).unwrap().parent(child), None);
    }
}
