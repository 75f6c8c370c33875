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

//! Archetype queries with include/exclude filters over both namespaces

use crate::archetype::Archetype;
use crate::component::ComponentSignature;

/// Archetype filter: required and excluded components, unique and shared.
///
/// Matching is archetype-level; shared filters test which shared components
/// an archetype carries, not which instances its bases reference.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Default)]
pub struct ArchetypeQuery {
    pub include_unique: ComponentSignature,
    pub include_shared: ComponentSignature,
    pub exclude_unique: ComponentSignature,
    pub exclude_shared: ComponentSignature,
}

impl ArchetypeQuery {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_unique(mut self, signature: ComponentSignature) -> Self {
        self.include_unique = signature;
        self
    }

    pub fn with_shared(mut self, signature: ComponentSignature) -> Self {
        self.include_shared = signature;
        self
    }

    pub fn without_unique(mut self, signature: ComponentSignature) -> Self {
        self.exclude_unique = signature;
        self
    }

    pub fn without_shared(mut self, signature: ComponentSignature) -> Self {
        self.exclude_shared = signature;
        self
    }

    pub fn matches(&self, archetype: &Archetype) -> bool {
        self.include_unique.is_subset_of(archetype.unique_signature())
            && self.include_shared.is_subset_of(archetype.shared_components())
            && self.exclude_unique.is_disjoint_with(archetype.unique_signature())
            && self.exclude_shared.is_disjoint_with(archetype.shared_components())
    }
}

/// Cached result for one query.
///
/// Archetypes are append-only between cache clears, so the cache keeps a
/// cursor of how many it has scanned and only tests the new tail on reuse.
pub struct CachedArchetypeQuery {
    pub matches: Vec<u16>,
    seen_archetypes: usize,
    query: ArchetypeQuery,
}

impl CachedArchetypeQuery {
    pub fn new(query: ArchetypeQuery, archetypes: &[Archetype]) -> Self {
        let matches = archetypes
            .iter()
            .enumerate()
            .filter_map(|(index, archetype)| query.matches(archetype).then_some(index as u16))
            .collect();
        Self {
            matches,
            seen_archetypes: archetypes.len(),
            query,
        }
    }

    /// Scan archetypes created since the last visit.
    pub fn update(&mut self, archetypes: &[Archetype]) {
        if archetypes.len() > self.seen_archetypes {
            for (index, archetype) in archetypes.iter().enumerate().skip(self.seen_archetypes) {
                if self.query.matches(archetype) {
                    self.matches.push(index as u16);
                }
            }
            self.seen_archetypes = archetypes.len();
        }
    }
}
