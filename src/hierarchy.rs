//! Parent-child entity hierarchies

use ahash::AHashMap;

use crate::entity::Entity;
use crate::error::{EcsError, Result};

/// One parent-to-children relation over entities.
///
/// Both directions are indexed. Reparenting detaches first; inserting an
/// edge that would close a cycle is rejected.
#[derive(Default, Clone)]
pub struct EntityHierarchy {
    parent_of: AHashMap<Entity, Entity>,
    children_of: AHashMap<Entity, Vec<Entity>>,
}

impl EntityHierarchy {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn parent(&self, entity: Entity) -> Option<Entity> {
        self.parent_of.get(&entity).copied()
    }

    pub fn children(&self, entity: Entity) -> &[Entity] {
        self.children_of
            .get(&entity)
            .map(Vec::as_slice)
            .unwrap_or(&[])
    }

    pub fn contains(&self, entity: Entity) -> bool {
        self.parent_of.contains_key(&entity) || self.children_of.contains_key(&entity)
    }

    /// Entities that have children but no parent
    pub fn roots(&self) -> impl Iterator<Item = Entity> + '_ {
        self.children_of
            .keys()
            .copied()
            .filter(|entity| !self.parent_of.contains_key(entity))
    }

    fn would_cycle(&self, child: Entity, parent: Entity) -> bool {
        let mut current = Some(parent);
        while let Some(ancestor) = current {
            if ancestor == child {
                return true;
            }
            current = self.parent(ancestor);
        }
        false
    }

    /// Attach `child` under `parent`, detaching it from any previous parent.
    pub fn set_parent(&mut self, child: Entity, parent: Entity) -> Result<()> {
        if child == parent {
            return Err(EcsError::HierarchyError(format!(
                "entity {} cannot parent itself",
                child.0
            )));
        }
        if self.would_cycle(child, parent) {
            return Err(EcsError::HierarchyError(format!(
                "parenting {} under {} would create a cycle",
                child.0, parent.0
            )));
        }
        self.detach(child);
        self.parent_of.insert(child, parent);
        self.children_of.entry(parent).or_default().push(child);
        Ok(())
    }

    fn detach(&mut self, child: Entity) {
        if let Some(parent) = self.parent_of.remove(&child) {
            if let Some(siblings) = self.children_of.get_mut(&parent) {
                siblings.retain(|&sibling| sibling != child);
                if siblings.is_empty() {
                    self.children_of.remove(&parent);
                }
            }
        }
    }

    /// Remove `entity` from the hierarchy. Its children become roots.
    pub fn remove(&mut self, entity: Entity) {
        self.detach(entity);
        if let Some(children) = self.children_of.remove(&entity) {
            for child in children {
                self.parent_of.remove(&child);
            }
        }
    }

    /// Depth-first walk of the subtree under `entity`, excluding it.
    pub fn descendants(&self, entity: Entity, out: &mut Vec<Entity>) {
        for &child in self.children(entity) {
            out.push(child);
            self.descendants(child, out);
        }
    }

    pub fn is_empty(&self) -> bool {
        self.parent_of.is_empty() && self.children_of.is_empty()
    }

    pub fn clear(&mut self) {
        self.parent_of.clear();
        self.children_of.clear();
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn entity(index: u16) -> Entity {
        Entity::new(index, 0)
    }

    #[test]
    fn test_set_parent_and_lookup() {
        let mut hierarchy = EntityHierarchy::new();
        hierarchy.set_parent(entity(1), entity(0)).unwrap();
        hierarchy.set_parent(entity(2), entity(0)).unwrap();

        assert_eq!(hierarchy.parent(entity(1)), Some(entity(0)));
        assert_eq!(hierarchy.children(entity(0)), &[entity(1), entity(2)]);
        assert_eq!(hierarchy.roots().collect::<Vec<_>>(), vec![entity(0)]);
    }

    #[test]
    fn test_reparent_detaches_from_old_parent() {
        let mut hierarchy = EntityHierarchy::new();
        hierarchy.set_parent(entity(2), entity(0)).unwrap();
        hierarchy.set_parent(entity(2), entity(1)).unwrap();

        assert!(hierarchy.children(entity(0)).is_empty());
        assert_eq!(hierarchy.children(entity(1)), &[entity(2)]);
    }

    #[test]
    fn test_cycle_rejected() {
        let mut hierarchy = EntityHierarchy::new();
        hierarchy.set_parent(entity(1), entity(0)).unwrap();
        hierarchy.set_parent(entity(2), entity(1)).unwrap();

        let result = hierarchy.set_parent(entity(0), entity(2));
        assert!(matches!(result, Err(EcsError::HierarchyError(_))));
        let result = hierarchy.set_parent(entity(0), entity(0));
        assert!(matches!(result, Err(EcsError::HierarchyError(_))));
    }

    #[test]
    fn test_remove_orphans_children() {
        let mut hierarchy = EntityHierarchy::new();
        hierarchy.set_parent(entity(1), entity(0)).unwrap();
        hierarchy.set_parent(entity(2), entity(1)).unwrap();

        hierarchy.remove(entity(1));
        assert_eq!(hierarchy.parent(entity(2)), None);
        assert!(hierarchy.children(entity(0)).is_empty());
    }

    #[test]
    fn test_descendants_walk() {
        let mut hierarchy = EntityHierarchy::new();
        hierarchy.set_parent(entity(1), entity(0)).unwrap();
        hierarchy.set_parent(entity(2), entity(1)).unwrap();
        hierarchy.set_parent(entity(3), entity(0)).unwrap();

        let mut out = Vec::new();
        hierarchy.descendants(entity(0), &mut out);
        assert_eq!(out, vec![entity(1), entity(2), entity(3)]);
    }
}
