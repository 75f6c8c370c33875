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

//! Entity identifiers and the generation-checked entity pool

use serde::{Deserialize, Serialize};

/// Entities per pool page
const ENTITY_PAGE_SIZE: usize = 1024;

/// Opaque 32-bit entity id: low 16 bits index, high 16 bits generation.
///
/// Equality is bitwise; a stale generation simply fails every lookup.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct Entity(pub u32);

impl Entity {
    pub const INVALID: Entity = Entity(u32::MAX);

    pub fn new(index: u16, generation: u16) -> Self {
        Self((generation as u32) << 16 | index as u32)
    }

    pub fn index(self) -> u16 {
        (self.0 & 0xFFFF) as u16
    }

    pub fn generation(self) -> u16 {
        (self.0 >> 16) as u16
    }

    pub fn is_valid(self) -> bool {
        self != Self::INVALID
    }
}

impl Default for Entity {
    fn default() -> Self {
        Self::INVALID
    }
}

/// Where an entity's data lives, plus its generation and layer tags.
///
/// Valid only while `generation` matches the entity id used to look it up.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct EntityInfo {
    /// Index of the archetype holding the entity's unique signature
    pub main_archetype: u16,
    /// Index of the base inside the archetype (one per shared-instance tuple)
    pub base_archetype: u16,
    /// Row inside the base's column storage
    pub stream_index: u32,
    pub generation: u16,
    /// Free 16-bit layer/tag word owned by the caller
    pub layer: u16,
}

impl EntityInfo {
    pub const INVALID: EntityInfo = EntityInfo {
        main_archetype: u16::MAX,
        base_archetype: u16::MAX,
        stream_index: u32::MAX,
        generation: u16::MAX,
        layer: 0,
    };
}

#[derive(Clone, Copy)]
struct EntitySlot {
    info: EntityInfo,
    alive: bool,
}

// Fresh slots start at generation 0; deallocation bumps from there.
const EMPTY_SLOT: EntitySlot = EntitySlot {
    info: EntityInfo {
        main_archetype: u16::MAX,
        base_archetype: u16::MAX,
        stream_index: u32::MAX,
        generation: 0,
        layer: 0,
    },
    alive: false,
};

/// Paged storage of `EntityInfo` indexed by `entity.index()`.
///
/// Creation draws from a free list and bumps the slot generation on reuse,
/// so stale ids can never resolve to a recycled slot.
#[derive(Clone)]
pub struct EntityPool {
    pages: Vec<Box<[EntitySlot; ENTITY_PAGE_SIZE]>>,
    free_list: Vec<u16>,
    next_unused: u32,
    len: usize,
}

impl EntityPool {
    pub fn new() -> Self {
        Self {
            pages: Vec::new(),
            free_list: Vec::new(),
            next_unused: 0,
            len: 0,
        }
    }

    fn slot(&self, index: u16) -> Option<&EntitySlot> {
        let page = index as usize / ENTITY_PAGE_SIZE;
        let offset = index as usize % ENTITY_PAGE_SIZE;
        self.pages.get(page).map(|p| &p[offset])
    }

    fn slot_mut(&mut self, index: u16) -> Option<&mut EntitySlot> {
        let page = index as usize / ENTITY_PAGE_SIZE;
        let offset = index as usize % ENTITY_PAGE_SIZE;
        self.pages.get_mut(page).map(|p| &mut p[offset])
    }

    fn ensure_page(&mut self, index: u16) {
        let page = index as usize / ENTITY_PAGE_SIZE;
        while self.pages.len() <= page {
            self.pages.push(Box::new([EMPTY_SLOT; ENTITY_PAGE_SIZE]));
        }
    }

    /// Allocate one entity and store `info` for it. The slot generation is
    /// written into both the returned id and the stored info.
    pub fn allocate(&mut self, mut info: EntityInfo) -> Entity {
        let index = if let Some(index) = self.free_list.pop() {
            index
        } else {
            assert!(
                self.next_unused < u16::MAX as u32,
                "Entity pool index space exhausted"
            );
            let index = self.next_unused as u16;
            self.next_unused += 1;
            self.ensure_page(index);
            index
        };

        let slot = self.slot_mut(index).unwrap();
        // Reused slots kept their bumped generation from deallocate
        let generation = slot.info.generation;
        info.generation = generation;
        slot.info = info;
        slot.alive = true;
        self.len += 1;
        Entity::new(index, generation)
    }

    /// Allocate `count` entities with the same info template.
    pub fn allocate_many(&mut self, info: EntityInfo, count: usize, out: &mut Vec<Entity>) {
        out.reserve(count);
        for _ in 0..count {
            out.push(self.allocate(info));
        }
    }

    /// Restore a specific slot, used by scene loading. The slot must not be
    /// alive.
    pub fn allocate_at(&mut self, entity: Entity, mut info: EntityInfo) {
        let index = entity.index();
        self.ensure_page(index);
        if self.next_unused <= index as u32 {
            // Everything between the old frontier and the restored index
            // becomes free slots at generation 0.
            for unused in self.next_unused as u16..index {
                self.free_list.push(unused);
            }
            self.next_unused = index as u32 + 1;
        } else {
            self.free_list.retain(|&free| free != index);
        }
        let slot = self.slot_mut(index).unwrap();
        debug_assert!(!slot.alive, "restoring an entity over a live slot");
        info.generation = entity.generation();
        slot.info = info;
        slot.alive = true;
        self.len += 1;
    }

    /// Mark the entity's slot free. The generation bumps immediately so any
    /// outstanding copy of the id goes stale.
    pub fn deallocate(&mut self, entity: Entity) -> bool {
        let Some(slot) = self.slot_mut(entity.index()) else {
            return false;
        };
        if !slot.alive || slot.info.generation != entity.generation() {
            return false;
        }
        slot.alive = false;
        slot.info = EntityInfo {
            generation: slot.info.generation.wrapping_add(1),
            ..EntityInfo::INVALID
        };
        self.free_list.push(entity.index());
        self.len -= 1;
        true
    }

    /// Info lookup; `None` when the generation is stale or the slot is free.
    pub fn get(&self, entity: Entity) -> Option<EntityInfo> {
        let slot = self.slot(entity.index())?;
        (slot.alive && slot.info.generation == entity.generation()).then_some(slot.info)
    }

    pub fn get_mut(&mut self, entity: Entity) -> Option<&mut EntityInfo> {
        let slot = self.slot_mut(entity.index())?;
        (slot.alive && slot.info.generation == entity.generation()).then_some(&mut slot.info)
    }

    pub fn exists(&self, entity: Entity) -> bool {
        self.get(entity).is_some()
    }

    pub fn len(&self) -> usize {
        self.len
    }

    pub fn is_empty(&self) -> bool {
        self.len == 0
    }

    /// Visit every live entity and its info.
    pub fn for_each(&self, mut visitor: impl FnMut(Entity, EntityInfo)) {
        for (page_index, page) in self.pages.iter().enumerate() {
            for (offset, slot) in page.iter().enumerate() {
                if slot.alive {
                    let index = (page_index * ENTITY_PAGE_SIZE + offset) as u16;
                    visitor(Entity::new(index, slot.info.generation), slot.info);
                }
            }
        }
    }

    pub fn clear(&mut self) {
        self.pages.clear();
        self.free_list.clear();
        self.next_unused = 0;
        self.len = 0;
    }
}

impl Default for EntityPool {
    fn default() -> Self {
        Self::new()
    }
}
