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

//! Component ids, signatures and per-type metadata
//!
//! Components live in two disjoint namespaces: unique (one value per entity)
//! and shared (one deduplicated instance referenced by many entities).

use serde::{Deserialize, Serialize};
use smallvec::SmallVec;
use tinyvec::ArrayVec;

use crate::crash_assert;
use crate::reflection::ComponentReflection;

/// Maximum number of components in one signature. Signatures are compared in
/// inner loops; the bound keeps them inline and branch-predictable.
pub const MAX_SIGNATURE_COMPONENTS: usize = 16;

/// Stable 16-bit component id
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Default, Serialize, Deserialize)]
pub struct Component(pub u16);

impl Component {
    pub const INVALID: Component = Component(u16::MAX);

    pub fn is_valid(self) -> bool {
        self != Self::INVALID
    }
}

/// Id of a deduplicated shared-component value
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default, Serialize, Deserialize)]
pub struct SharedInstance(pub u16);

impl SharedInstance {
    /// Sentinel asking the runtime to create the instance from default data
    pub const INVALID: SharedInstance = SharedInstance(u16::MAX);

    pub fn is_valid(self) -> bool {
        self != Self::INVALID
    }
}

/// Ordered component set. Normalised to ascending id order on construction,
/// so two signatures compare equal iff they contain the same components.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Default)]
pub struct ComponentSignature {
    components: SmallVec<[Component; MAX_SIGNATURE_COMPONENTS]>,
}

impl ComponentSignature {
    pub fn new() -> Self {
        Self {
            components: SmallVec::new(),
        }
    }

    pub fn from_components(components: &[Component]) -> Self {
        crash_assert!(
            components.len() <= MAX_SIGNATURE_COMPONENTS,
            "Signature with {} components exceeds the {} component bound",
            components.len(),
            MAX_SIGNATURE_COMPONENTS
        );
        let mut sorted: SmallVec<[Component; MAX_SIGNATURE_COMPONENTS]> =
            SmallVec::from_slice(components);
        sorted.sort_unstable();
        for window in sorted.windows(2) {
            crash_assert!(
                window[0] != window[1],
                "Signature contains component {} twice",
                window[0].0
            );
        }
        Self { components: sorted }
    }

    pub fn len(&self) -> usize {
        self.components.len()
    }

    pub fn is_empty(&self) -> bool {
        self.components.is_empty()
    }

    pub fn components(&self) -> &[Component] {
        &self.components
    }

    pub fn iter(&self) -> impl Iterator<Item = Component> + '_ {
        self.components.iter().copied()
    }

    pub fn contains(&self, component: Component) -> bool {
        self.components.binary_search(&component).is_ok()
    }

    /// Position of `component` inside the normalised order
    pub fn find(&self, component: Component) -> Option<usize> {
        self.components.binary_search(&component).ok()
    }

    /// New signature with `component` added
    pub fn extended_with(&self, component: Component) -> Self {
        crash_assert!(
            !self.contains(component),
            "Component {} is already part of the signature",
            component.0
        );
        crash_assert!(
            self.len() < MAX_SIGNATURE_COMPONENTS,
            "Signature already holds the maximum of {} components",
            MAX_SIGNATURE_COMPONENTS
        );
        let mut components = self.components.clone();
        let position = components
            .binary_search(&component)
            .unwrap_err();
        components.insert(position, component);
        Self { components }
    }

    /// New signature with `component` removed
    pub fn without(&self, component: Component) -> Self {
        let mut components = self.components.clone();
        if let Ok(position) = components.binary_search(&component) {
            components.remove(position);
        }
        Self { components }
    }

    pub fn is_subset_of(&self, other: &ComponentSignature) -> bool {
        self.iter().all(|component| other.contains(component))
    }

    pub fn is_disjoint_with(&self, other: &ComponentSignature) -> bool {
        !self.iter().any(|component| other.contains(component))
    }
}

/// Shared signature: each shared component paired with the instance an entity
/// references. Pairs are kept in the component's normalised order.
#[derive(Debug, Clone, PartialEq, Eq, Default)]
pub struct SharedComponentSignature {
    components: ComponentSignature,
    instances: ArrayVec<[SharedInstance; MAX_SIGNATURE_COMPONENTS]>,
}

impl SharedComponentSignature {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn from_pairs(pairs: &[(Component, SharedInstance)]) -> Self {
        crash_assert!(
            pairs.len() <= MAX_SIGNATURE_COMPONENTS,
            "Shared signature with {} components exceeds the {} component bound",
            pairs.len(),
            MAX_SIGNATURE_COMPONENTS
        );
        let mut sorted: SmallVec<[(Component, SharedInstance); MAX_SIGNATURE_COMPONENTS]> =
            SmallVec::from_slice(pairs);
        sorted.sort_unstable_by_key(|(component, _)| *component);

        let components =
            ComponentSignature::from_components(&sorted.iter().map(|(c, _)| *c).collect::<SmallVec<[Component; MAX_SIGNATURE_COMPONENTS]>>());
        let mut instances = ArrayVec::new();
        for (_, instance) in sorted.iter() {
            instances.push(*instance);
        }
        Self {
            components,
            instances,
        }
    }

    pub fn len(&self) -> usize {
        self.components.len()
    }

    pub fn is_empty(&self) -> bool {
        self.components.is_empty()
    }

    pub fn components(&self) -> &ComponentSignature {
        &self.components
    }

    pub fn instances(&self) -> &[SharedInstance] {
        &self.instances
    }

    pub fn instance_for(&self, component: Component) -> Option<SharedInstance> {
        self.components
            .find(component)
            .map(|index| self.instances[index])
    }

    pub fn pairs(&self) -> impl Iterator<Item = (Component, SharedInstance)> + '_ {
        self.components
            .iter()
            .zip(self.instances.iter().copied())
    }

    /// Replace the instance referenced for `component`
    pub fn set_instance(&mut self, component: Component, instance: SharedInstance) {
        if let Some(index) = self.components.find(component) {
            self.instances[index] = instance;
        }
    }

    pub fn extended_with(&self, component: Component, instance: SharedInstance) -> Self {
        let mut pairs: SmallVec<[(Component, SharedInstance); MAX_SIGNATURE_COMPONENTS]> =
            self.pairs().collect();
        pairs.push((component, instance));
        Self::from_pairs(&pairs)
    }

    pub fn without(&self, component: Component) -> Self {
        let pairs: SmallVec<[(Component, SharedInstance); MAX_SIGNATURE_COMPONENTS]> = self
            .pairs()
            .filter(|(c, _)| *c != component)
            .collect();
        Self::from_pairs(&pairs)
    }

    /// Order-insensitive 64-bit fingerprint of the instance tuple, used for
    /// fast base rejection before the exact compare.
    pub fn instance_mask(&self) -> u64 {
        let mut mask = 0u64;
        for (component, instance) in self.pairs() {
            let bit = (component.0 as u64).wrapping_mul(31).wrapping_add(instance.0 as u64) % 64;
            mask |= 1 << bit;
        }
        mask
    }
}

/// Copies one component value over another. Both pointers refer to blocks of
/// the component's registered byte size.
pub type ComponentCopyFn = unsafe fn(destination: *mut u8, source: *const u8);

/// Releases buffers owned by a component value. The value bytes themselves
/// stay in column storage.
pub type ComponentDeallocateFn = unsafe fn(data: *mut u8);

/// Value equality for two component instances
pub type ComponentCompareFn = unsafe fn(a: *const u8, b: *const u8) -> bool;

/// Explicit dispatch table for component value semantics
#[derive(Clone, Copy)]
pub struct ComponentFunctions {
    pub copy: ComponentCopyFn,
    pub deallocate: ComponentDeallocateFn,
    pub compare: ComponentCompareFn,
}

/// Registered metadata for one component type
#[derive(Clone)]
pub struct ComponentInfo {
    pub name: String,
    pub size: u32,
    pub alignment: u32,
    /// Bytes of side storage a value may own through its copy function.
    /// Zero for plain data.
    pub allocator_size: u32,
    /// Explicit value semantics. `None` auto-derives bitwise semantics from
    /// the reflection metadata.
    pub functions: Option<ComponentFunctions>,
    pub reflection: ComponentReflection,
}

impl ComponentInfo {
    pub fn new(name: impl Into<String>, reflection: ComponentReflection) -> Self {
        Self {
            name: name.into(),
            size: reflection.byte_size,
            alignment: reflection.alignment,
            allocator_size: 0,
            functions: None,
            reflection,
        }
    }

    pub fn with_functions(mut self, functions: ComponentFunctions) -> Self {
        self.functions = Some(functions);
        self
    }

    pub fn with_allocator_size(mut self, allocator_size: u32) -> Self {
        self.allocator_size = allocator_size;
        self
    }

    /// Copy a value, deep-copying owned buffers when the type registered a
    /// copy function.
    ///
    /// # Safety
    /// Both pointers must refer to valid, non-overlapping blocks of
    /// `self.size` bytes with this component's alignment.
    pub unsafe fn call_copy(&self, destination: *mut u8, source: *const u8) {
        match &self.functions {
            Some(functions) => (functions.copy)(destination, source),
            None => std::ptr::copy_nonoverlapping(source, destination, self.size as usize),
        }
    }

    /// Release buffers owned by a value. No-op for plain data.
    ///
    /// # Safety
    /// `data` must refer to a valid block of `self.size` bytes holding an
    /// initialised value that has not been deallocated yet.
    pub unsafe fn call_deallocate(&self, data: *mut u8) {
        if let Some(functions) = &self.functions {
            (functions.deallocate)(data);
        }
    }

    /// Value equality.
    ///
    /// # Safety
    /// Both pointers must refer to valid blocks of `self.size` bytes.
    pub unsafe fn call_compare(&self, a: *const u8, b: *const u8) -> bool {
        match &self.functions {
            Some(functions) => (functions.compare)(a, b),
            None => {
                let lhs = std::slice::from_raw_parts(a, self.size as usize);
                let rhs = std::slice::from_raw_parts(b, self.size as usize);
                lhs == rhs
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_signature_normalisation() {
        let a = ComponentSignature::from_components(&[Component(3), Component(1), Component(2)]);
        let b = ComponentSignature::from_components(&[Component(1), Component(2), Component(3)]);
        assert_eq!(a, b);
        assert_eq!(a.find(Component(2)), Some(1));
        assert!(!a.contains(Component(9)));
    }

    #[test]
    fn test_signature_extend_and_remove() {
        let sig = ComponentSignature::from_components(&[Component(5), Component(9)]);
        let extended = sig.extended_with(Component(7));
        assert_eq!(
            extended.components(),
            &[Component(5), Component(7), Component(9)]
        );
        let removed = extended.without(Component(5));
        assert_eq!(removed.components(), &[Component(7), Component(9)]);
    }

    #[test]
    #[should_panic]
    fn test_duplicate_component_is_schema_violation() {
        let _ = ComponentSignature::from_components(&[Component(1), Component(1)]);
    }

    #[test]
    fn test_shared_signature_pairs_follow_component_order() {
        let sig = SharedComponentSignature::from_pairs(&[
            (Component(8), SharedInstance(2)),
            (Component(2), SharedInstance(5)),
        ]);
        let pairs: Vec<_> = sig.pairs().collect();
        assert_eq!(pairs[0], (Component(2), SharedInstance(5)));
        assert_eq!(pairs[1], (Component(8), SharedInstance(2)));
        assert_eq!(sig.instance_for(Component(8)), Some(SharedInstance(2)));
    }

    #[test]
    fn test_instance_mask_differs_for_different_instances() {
        let a = SharedComponentSignature::from_pairs(&[(Component(1), SharedInstance(0))]);
        let b = SharedComponentSignature::from_pairs(&[(Component(1), SharedInstance(1))]);
        // Masks may collide in principle; these two small tuples should not.
        assert_ne!(a.instance_mask(), b.instance_mask());
    }

    #[test]
    fn test_bitwise_compare_without_functions() {
        let info = ComponentInfo::new("Position", crate::reflection::ComponentReflection::opaque(8, 4));
        let a = [1u8, 2, 3, 4, 5, 6, 7, 8];
        let b = a;
        let c = [0u8; 8];
        unsafe {
            assert!(info.call_compare(a.as_ptr(), b.as_ptr()));
            assert!(!info.call_compare(a.as_ptr(), c.as_ptr()));
        }
    }
}
