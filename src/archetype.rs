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

//! Archetype storage: SoA bases grouped by shared-instance tuple
//!
//! An [`ArchetypeBase`] stores entities that share one unique signature and
//! one shared-instance tuple. All its columns live in a single backing
//! allocation, one cache-line-aligned column per unique component, so a base
//! is one heap block and destruction is O(1).
//!
//! An [`Archetype`] groups the bases of one unique signature across all
//! shared-instance tuples.

use std::alloc::{alloc, dealloc, Layout};

use smallvec::SmallVec;

use crate::component::{
    Component, ComponentSignature, SharedComponentSignature, MAX_SIGNATURE_COMPONENTS,
};
use crate::crash_assert;
use crate::entity::{Entity, EntityPool};

/// Column alignment inside the backing block
pub const CACHE_LINE_SIZE: usize = 64;

fn align_up(value: usize, alignment: usize) -> usize {
    (value + alignment - 1) & !(alignment - 1)
}

/// SoA storage for a fixed unique signature and shared-instance tuple.
///
/// Layout of the backing block: `{entities, column_0, pad, column_1, ...}`,
/// each column starting on a cache line. The entity at stream position `i`
/// has its value for column `c` at byte offset `i * component_size[c]`.
pub struct ArchetypeBase {
    size: u32,
    capacity: u32,
    buffer: *mut u8,
    buffer_layout: Layout,
    column_offsets: SmallVec<[usize; MAX_SIGNATURE_COMPONENTS]>,
    component_sizes: SmallVec<[u32; MAX_SIGNATURE_COMPONENTS]>,
    signature: ComponentSignature,
}

// The base exclusively owns its backing block; nothing aliases it outside
// short-lived borrows handed out through &self / &mut self.
unsafe impl Send for ArchetypeBase {}
unsafe impl Sync for ArchetypeBase {}

impl ArchetypeBase {
    pub fn new(
        signature: ComponentSignature,
        component_sizes: &[u32],
        initial_capacity: u32,
    ) -> Self {
        debug_assert_eq!(signature.len(), component_sizes.len());
        let mut base = Self {
            size: 0,
            capacity: 0,
            buffer: std::ptr::null_mut(),
            buffer_layout: Layout::new::<u8>(),
            column_offsets: SmallVec::new(),
            component_sizes: SmallVec::from_slice(component_sizes),
            signature,
        };
        if initial_capacity > 0 {
            base.resize(initial_capacity);
        }
        base
    }

    /// Compute the block layout and per-column offsets for `capacity` rows.
    fn block_layout(
        component_sizes: &[u32],
        capacity: u32,
    ) -> (Layout, SmallVec<[usize; MAX_SIGNATURE_COMPONENTS]>) {
        let mut offsets = SmallVec::new();
        let mut cursor = std::mem::size_of::<Entity>() * capacity as usize;
        for &component_size in component_sizes {
            cursor = align_up(cursor, CACHE_LINE_SIZE);
            offsets.push(cursor);
            cursor += component_size as usize * capacity as usize;
        }
        let layout = Layout::from_size_align(cursor.max(CACHE_LINE_SIZE), CACHE_LINE_SIZE)
            .expect("archetype base layout overflow");
        (layout, offsets)
    }

    pub fn signature(&self) -> &ComponentSignature {
        &self.signature
    }

    pub fn size(&self) -> u32 {
        self.size
    }

    pub fn capacity(&self) -> u32 {
        self.capacity
    }

    pub fn is_empty(&self) -> bool {
        self.size == 0
    }

    /// Position of `component` among the columns
    pub fn column_index(&self, component: Component) -> Option<usize> {
        self.signature.find(component)
    }

    pub fn component_size(&self, column: usize) -> u32 {
        self.component_sizes[column]
    }

    pub fn entities(&self) -> &[Entity] {
        if self.capacity == 0 {
            return &[];
        }
        unsafe { std::slice::from_raw_parts(self.buffer as *const Entity, self.size as usize) }
    }

    fn entities_mut_ptr(&mut self) -> *mut Entity {
        self.buffer as *mut Entity
    }

    /// Raw start of a column. Valid for `capacity * component_size` bytes.
    pub fn column_ptr(&self, column: usize) -> *mut u8 {
        debug_assert!(column < self.column_offsets.len());
        unsafe { self.buffer.add(self.column_offsets[column]) }
    }

    /// Raw pointer to one component value.
    pub fn component_ptr(&self, column: usize, stream_index: u32) -> *mut u8 {
        debug_assert!(stream_index < self.size || stream_index < self.capacity);
        unsafe {
            self.column_ptr(column)
                .add(self.component_sizes[column] as usize * stream_index as usize)
        }
    }

    /// Bytes of one component value, looked up by component id.
    pub fn component_bytes(&self, component: Component, stream_index: u32) -> Option<&[u8]> {
        let column = self.column_index(component)?;
        if stream_index >= self.size {
            return None;
        }
        let size = self.component_sizes[column] as usize;
        Some(unsafe { std::slice::from_raw_parts(self.component_ptr(column, stream_index), size) })
    }

    /// Whole column as bytes: `component_size * size` bytes, cache-line
    /// aligned.
    pub fn column_bytes(&self, column: usize) -> &[u8] {
        let length = self.component_sizes[column] as usize * self.size as usize;
        if length == 0 {
            return &[];
        }
        unsafe { std::slice::from_raw_parts(self.column_ptr(column), length) }
    }

    /// Make room for `additional` entities, growing in place if needed.
    /// Returns the first free stream index (the pre-growth size).
    pub fn reserve(&mut self, additional: u32) -> u32 {
        let needed = self.size + additional;
        if needed > self.capacity {
            let grown = self.capacity + self.capacity / 2 + 3;
            self.resize(needed.max(grown));
        }
        self.size
    }

    /// Reallocate to exactly `new_capacity` rows, copying the live prefix.
    /// A shrink below `size` drops the tail without running deallocators;
    /// the caller must have run them already.
    pub fn resize(&mut self, new_capacity: u32) {
        let (layout, offsets) = Self::block_layout(&self.component_sizes, new_capacity);
        let buffer = unsafe { alloc(layout) };
        assert!(!buffer.is_null(), "archetype base allocation failed");

        let live = self.size.min(new_capacity);
        if live > 0 {
            unsafe {
                std::ptr::copy_nonoverlapping(
                    self.buffer,
                    buffer,
                    std::mem::size_of::<Entity>() * live as usize,
                );
                for (column, &offset) in offsets.iter().enumerate() {
                    std::ptr::copy_nonoverlapping(
                        self.buffer.add(self.column_offsets[column]),
                        buffer.add(offset),
                        self.component_sizes[column] as usize * live as usize,
                    );
                }
            }
        }

        if self.capacity > 0 {
            unsafe { dealloc(self.buffer, self.buffer_layout) };
        }
        self.buffer = buffer;
        self.buffer_layout = layout;
        self.column_offsets = offsets;
        self.capacity = new_capacity;
        self.size = live;
    }

    /// Append entity ids, reserving as needed. Component values at the new
    /// rows are uninitialised until one of the copy operations runs.
    /// Returns the stream index of the first added entity.
    pub fn add_entities(&mut self, entities: &[Entity]) -> u32 {
        let copy_position = self.reserve(entities.len() as u32);
        unsafe {
            std::ptr::copy_nonoverlapping(
                entities.as_ptr(),
                self.entities_mut_ptr().add(copy_position as usize),
                entities.len(),
            );
        }
        self.size += entities.len() as u32;
        copy_position
    }

    fn column_for(&self, component: Component) -> usize {
        let Some(column) = self.column_index(component) else {
            crate::error::crash(&format!(
                "Component {} is missing from the base archetype",
                component.0
            ));
        };
        column
    }

    /// Write initial values from per-entity strided pointers:
    /// `data[entity * components.len() + component]` points at one value.
    ///
    /// # Safety
    /// Every pointer must refer to a valid value of the matching component.
    pub unsafe fn copy_by_entity(
        &mut self,
        copy_position: u32,
        count: u32,
        data: &[*const u8],
        components: &ComponentSignature,
    ) {
        debug_assert_eq!(data.len(), count as usize * components.len());
        for (slot, component) in components.iter().enumerate() {
            let column = self.column_for(component);
            let component_size = self.component_sizes[column] as usize;
            for entity_index in 0..count as usize {
                let source = data[entity_index * components.len() + slot];
                let destination = self.component_ptr(column, copy_position + entity_index as u32);
                std::ptr::copy_nonoverlapping(source, destination, component_size);
            }
        }
    }

    /// Write initial values from per-entity packed records: `data[entity]`
    /// points at all listed components back to back, in `components` order.
    ///
    /// # Safety
    /// Each record must hold valid values for every listed component.
    pub unsafe fn copy_by_entity_contiguous(
        &mut self,
        copy_position: u32,
        count: u32,
        data: &[*const u8],
        components: &ComponentSignature,
    ) {
        debug_assert_eq!(data.len(), count as usize);
        // Record offsets are the prefix sums of the listed component sizes
        let mut record_offsets: SmallVec<[usize; MAX_SIGNATURE_COMPONENTS]> = SmallVec::new();
        let mut cursor = 0usize;
        for component in components.iter() {
            let column = self.column_for(component);
            record_offsets.push(cursor);
            cursor += self.component_sizes[column] as usize;
        }
        for (slot, component) in components.iter().enumerate() {
            let column = self.column_for(component);
            let component_size = self.component_sizes[column] as usize;
            for entity_index in 0..count as usize {
                let source = data[entity_index].add(record_offsets[slot]);
                let destination = self.component_ptr(column, copy_position + entity_index as u32);
                std::ptr::copy_nonoverlapping(source, destination, component_size);
            }
        }
    }

    /// Write initial values from component-major pointers:
    /// `data[component * count + entity]` points at one value.
    ///
    /// # Safety
    /// Every pointer must refer to a valid value of the matching component.
    pub unsafe fn copy_by_component(
        &mut self,
        copy_position: u32,
        count: u32,
        data: &[*const u8],
        components: &ComponentSignature,
    ) {
        debug_assert_eq!(data.len(), components.len() * count as usize);
        for (slot, component) in components.iter().enumerate() {
            let column = self.column_for(component);
            let component_size = self.component_sizes[column] as usize;
            for entity_index in 0..count as usize {
                let source = data[slot * count as usize + entity_index];
                let destination = self.component_ptr(column, copy_position + entity_index as u32);
                std::ptr::copy_nonoverlapping(source, destination, component_size);
            }
        }
    }

    /// Splat one value per component across `count` new entities.
    ///
    /// # Safety
    /// `data[component]` must refer to a valid value of that component.
    pub unsafe fn copy_splat(
        &mut self,
        copy_position: u32,
        count: u32,
        data: &[*const u8],
        components: &ComponentSignature,
    ) {
        debug_assert_eq!(data.len(), components.len());
        for (slot, component) in components.iter().enumerate() {
            let column = self.column_for(component);
            let component_size = self.component_sizes[column] as usize;
            for entity_index in 0..count as usize {
                let destination = self.component_ptr(column, copy_position + entity_index as u32);
                std::ptr::copy_nonoverlapping(data[slot], destination, component_size);
            }
        }
    }

    /// Bitwise-move the overlapping components of one entity from another
    /// base. Used for archetype migration; ownership of buffers transfers
    /// with the bits.
    pub fn copy_entity_from(&mut self, dst_stream: u32, source: &ArchetypeBase, src_stream: u32) {
        for (column, component) in self.signature.iter().enumerate() {
            let Some(src_column) = source.column_index(component) else {
                continue;
            };
            let component_size = self.component_sizes[column] as usize;
            debug_assert_eq!(component_size, source.component_sizes[src_column] as usize);
            unsafe {
                std::ptr::copy_nonoverlapping(
                    source.component_ptr(src_column, src_stream),
                    self.component_ptr(column, dst_stream),
                    component_size,
                );
            }
        }
    }

    /// Swap-back remove. The last entity moves into `stream_index` and its
    /// pool record is rewritten. Component memory of the removed entity is
    /// not cleared; deallocate hooks must already have run.
    /// Returns the entity that moved, if any.
    pub fn remove_entity(&mut self, stream_index: u32, pool: &mut EntityPool) -> Option<Entity> {
        crash_assert!(
            stream_index < self.size,
            "Stream index {} out of bounds for base of size {}",
            stream_index,
            self.size
        );
        let last = self.size - 1;
        let mut moved = None;
        if stream_index != last {
            let moved_entity = self.entities()[last as usize];
            unsafe {
                *self.entities_mut_ptr().add(stream_index as usize) = moved_entity;
                for column in 0..self.column_offsets.len() {
                    let component_size = self.component_sizes[column] as usize;
                    std::ptr::copy_nonoverlapping(
                        self.component_ptr(column, last),
                        self.component_ptr(column, stream_index),
                        component_size,
                    );
                }
            }
            if let Some(info) = pool.get_mut(moved_entity) {
                info.stream_index = stream_index;
            }
            moved = Some(moved_entity);
        }
        self.size = last;
        moved
    }

    /// Free the backing block. Idempotent; the base becomes empty.
    pub fn deallocate(&mut self) {
        if self.capacity > 0 {
            unsafe { dealloc(self.buffer, self.buffer_layout) };
            self.buffer = std::ptr::null_mut();
            self.capacity = 0;
            self.size = 0;
            self.column_offsets.clear();
        }
    }
}

impl Drop for ArchetypeBase {
    fn drop(&mut self) {
        self.deallocate();
    }
}

struct BaseEntry {
    base: ArchetypeBase,
    shared_signature: SharedComponentSignature,
    instance_mask: u64,
}

/// All bases of one unique signature, one per shared-instance tuple.
pub struct Archetype {
    unique_signature: ComponentSignature,
    shared_components: ComponentSignature,
    component_sizes: SmallVec<[u32; MAX_SIGNATURE_COMPONENTS]>,
    bases: Vec<BaseEntry>,
}

impl Archetype {
    pub fn new(
        unique_signature: ComponentSignature,
        shared_components: ComponentSignature,
        component_sizes: &[u32],
    ) -> Self {
        debug_assert_eq!(unique_signature.len(), component_sizes.len());
        Self {
            unique_signature,
            shared_components,
            component_sizes: SmallVec::from_slice(component_sizes),
            bases: Vec::new(),
        }
    }

    pub fn unique_signature(&self) -> &ComponentSignature {
        &self.unique_signature
    }

    pub fn shared_components(&self) -> &ComponentSignature {
        &self.shared_components
    }

    pub fn base_count(&self) -> usize {
        self.bases.len()
    }

    /// Create a base for `shared_signature`. The tuple must cover exactly
    /// this archetype's shared components.
    pub fn create_base(
        &mut self,
        shared_signature: SharedComponentSignature,
        initial_capacity: u32,
    ) -> u16 {
        crash_assert!(
            shared_signature.components() == &self.shared_components,
            "Shared signature with {} components does not match the archetype's {} shared components",
            shared_signature.len(),
            self.shared_components.len()
        );
        let index = self.bases.len();
        assert!(index < u16::MAX as usize, "base index space exhausted");
        let instance_mask = shared_signature.instance_mask();
        self.bases.push(BaseEntry {
            base: ArchetypeBase::new(
                self.unique_signature.clone(),
                &self.component_sizes,
                initial_capacity,
            ),
            shared_signature,
            instance_mask,
        });
        index as u16
    }

    /// Find the base holding `shared_signature`'s instance tuple. The mask
    /// rejects most candidates without the exact compare.
    pub fn find_base(&self, shared_signature: &SharedComponentSignature) -> Option<u16> {
        let mask = shared_signature.instance_mask();
        self.bases
            .iter()
            .position(|entry| entry.instance_mask == mask && &entry.shared_signature == shared_signature)
            .map(|index| index as u16)
    }

    pub fn find_or_create_base(
        &mut self,
        shared_signature: &SharedComponentSignature,
        initial_capacity: u32,
    ) -> u16 {
        match self.find_base(shared_signature) {
            Some(index) => index,
            None => self.create_base(shared_signature.clone(), initial_capacity),
        }
    }

    pub fn base(&self, index: u16) -> &ArchetypeBase {
        &self.bases[index as usize].base
    }

    pub fn base_mut(&mut self, index: u16) -> &mut ArchetypeBase {
        &mut self.bases[index as usize].base
    }

    pub fn base_shared_signature(&self, index: u16) -> &SharedComponentSignature {
        &self.bases[index as usize].shared_signature
    }

    pub fn bases(&self) -> impl Iterator<Item = (u16, &ArchetypeBase, &SharedComponentSignature)> {
        self.bases
            .iter()
            .enumerate()
            .map(|(index, entry)| (index as u16, &entry.base, &entry.shared_signature))
    }

    /// Mutable access to two different bases, used when migrating an entity
    /// between instance tuples of the same archetype.
    pub fn two_bases_mut(
        &mut self,
        first: u16,
        second: u16,
    ) -> (&mut ArchetypeBase, &mut ArchetypeBase) {
        debug_assert_ne!(first, second);
        let (first, second) = (first as usize, second as usize);
        if first < second {
            let (head, tail) = self.bases.split_at_mut(second);
            (&mut head[first].base, &mut tail[0].base)
        } else {
            let (head, tail) = self.bases.split_at_mut(first);
            (&mut tail[0].base, &mut head[second].base)
        }
    }

    /// Deallocate and swap-remove a base. Entities of the base that moved
    /// into the freed slot get their pool `base_archetype` rewritten.
    pub fn destroy_base(&mut self, index: u16, pool: &mut EntityPool) {
        let position = index as usize;
        crash_assert!(
            position < self.bases.len(),
            "Destroying base {} of an archetype with {} bases",
            index,
            self.bases.len()
        );
        self.bases[position].base.deallocate();
        self.bases.swap_remove(position);
        if position < self.bases.len() {
            let moved_entities: Vec<Entity> = self.bases[position].base.entities().to_vec();
            for entity in moved_entities {
                if let Some(info) = pool.get_mut(entity) {
                    info.base_archetype = index;
                }
            }
        }
        // Trim dangling capacity after bulk destruction
        if self.bases.capacity() > self.bases.len() * 2 {
            self.bases.shrink_to_fit();
        }
    }

    pub fn entity_count(&self) -> u32 {
        self.bases.iter().map(|entry| entry.base.size()).sum()
    }
}
