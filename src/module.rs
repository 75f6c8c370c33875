//! Module bridge: components, tasks and debug-draw tasks published by
//! dynamically loaded modules
//!
//! The bridge only consumes descriptors; loading the binary itself is the
//! host's business. A module that fails to load stays registered with a
//! failure status so sandboxes can keep running on stale state.

use std::path::{Path, PathBuf};
use std::time::SystemTime;

use tracing::{info, warn};

use crate::component::{Component, ComponentFunctions};
use crate::error::{EcsError, Result};
use crate::manager::EntityManager;
use crate::reflection::ComponentReflection;
use crate::task::TaskElement;

/// Builds the runtime form of a component from its editor-facing link form.
///
/// # Safety
/// Both pointers refer to valid blocks of the component's byte size; the
/// link value is only read.
pub type ComponentBuildFn = unsafe fn(destination: *mut u8, link: *const u8);

/// Build flavour a sandbox binds a module with
#[derive(Debug, Clone, Copy, PartialEq, Eq, serde::Serialize, serde::Deserialize)]
pub enum ModuleConfiguration {
    Debug,
    Release,
    Distribution,
}

impl Default for ModuleConfiguration {
    fn default() -> Self {
        ModuleConfiguration::Debug
    }
}

/// One component a module publishes
pub struct ModuleComponentDescriptor {
    pub component: Component,
    pub name: String,
    pub reflection: ComponentReflection,
    pub functions: Option<ComponentFunctions>,
    /// Set when the editor representation differs from the runtime layout
    pub build_from_link: Option<ComponentBuildFn>,
}

impl ModuleComponentDescriptor {
    pub fn new(component: Component, name: impl Into<String>, reflection: ComponentReflection) -> Self {
        Self {
            component,
            name: name.into(),
            reflection,
            functions: None,
            build_from_link: None,
        }
    }
}

/// A debug-draw task: a task element plus its default enablement
pub struct ModuleDebugDrawElement {
    pub element: TaskElement,
    pub enabled_by_default: bool,
}

/// Everything one module publishes to the runtime
#[derive(Default)]
pub struct ModuleDescriptor {
    pub library_name: String,
    pub components: Vec<ModuleComponentDescriptor>,
    pub shared_components: Vec<ModuleComponentDescriptor>,
    pub tasks: Vec<TaskElement>,
    pub debug_draw_tasks: Vec<ModuleDebugDrawElement>,
}

impl ModuleDescriptor {
    pub fn new(library_name: impl Into<String>) -> Self {
        Self {
            library_name: library_name.into(),
            ..Default::default()
        }
    }
}

/// Load state of one module slot
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ModuleStatus {
    Available,
    /// The library on disk is newer than what was imported
    OutOfDate,
    Failed(String),
}

/// One imported module
pub struct LoadedModule {
    pub descriptor: ModuleDescriptor,
    pub status: ModuleStatus,
    library_path: Option<PathBuf>,
    library_write_time: Option<SystemTime>,
}

impl LoadedModule {
    pub fn is_available(&self) -> bool {
        matches!(self.status, ModuleStatus::Available | ModuleStatus::OutOfDate)
    }

    pub fn library_path(&self) -> Option<&Path> {
        self.library_path.as_deref()
    }

    /// Compare the on-disk library against the imported snapshot.
    pub fn check_out_of_date(&self) -> bool {
        let Some(path) = &self.library_path else {
            return false;
        };
        let Ok(modified) = std::fs::metadata(path).and_then(|meta| meta.modified()) else {
            return false;
        };
        match self.library_write_time {
            Some(imported) => modified > imported,
            None => false,
        }
    }
}

/// Registry of imported modules. Slots are stable: unloading leaves a hole
/// so module indices held by sandboxes stay valid.
#[derive(Default)]
pub struct ModuleRegistry {
    modules: Vec<Option<LoadedModule>>,
}

impl ModuleRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Import a module's published surface. `library_path`, when given,
    /// must exist; a missing binary records a failed slot and surfaces a
    /// module-load-failure.
    pub fn load(
        &mut self,
        descriptor: ModuleDescriptor,
        library_path: Option<PathBuf>,
    ) -> Result<usize> {
        if self
            .module_index(&descriptor.library_name)
            .is_some()
        {
            return Err(EcsError::ModuleLoadError(format!(
                "module '{}' is already loaded",
                descriptor.library_name
            )));
        }

        let mut status = ModuleStatus::Available;
        let mut library_write_time = None;
        if let Some(path) = &library_path {
            match std::fs::metadata(path).and_then(|meta| meta.modified()) {
                Ok(modified) => library_write_time = Some(modified),
                Err(err) => {
                    status = ModuleStatus::Failed(format!(
                        "library '{}' is unavailable: {err}",
                        path.display()
                    ));
                }
            }
        }

        let name = descriptor.library_name.clone();
        let failed = matches!(status, ModuleStatus::Failed(_));
        let module = LoadedModule {
            descriptor,
            status: status.clone(),
            library_path,
            library_write_time,
        };
        let index = self
            .modules
            .iter()
            .position(Option::is_none)
            .unwrap_or(self.modules.len());
        if index == self.modules.len() {
            self.modules.push(Some(module));
        } else {
            self.modules[index] = Some(module);
        }

        if failed {
            warn!(module = name.as_str(), "module import failed");
            let ModuleStatus::Failed(message) = status else {
                unreachable!()
            };
            return Err(EcsError::ModuleLoadError(message));
        }
        info!(module = name.as_str(), index, "module imported");
        Ok(index)
    }

    pub fn module(&self, index: usize) -> Option<&LoadedModule> {
        self.modules.get(index)?.as_ref()
    }

    pub fn module_index(&self, library_name: &str) -> Option<usize> {
        self.modules.iter().position(|slot| {
            slot.as_ref()
                .is_some_and(|module| module.descriptor.library_name == library_name)
        })
    }

    pub fn module_count(&self) -> usize {
        self.modules.iter().filter(|slot| slot.is_some()).count()
    }

    pub fn set_status(&mut self, index: usize, status: ModuleStatus) {
        if let Some(Some(module)) = self.modules.get_mut(index) {
            module.status = status;
        }
    }

    /// Refresh the out-of-date flag from the library file's timestamp.
    pub fn refresh_status(&mut self, index: usize) {
        if let Some(Some(module)) = self.modules.get_mut(index) {
            if module.status == ModuleStatus::Available && module.check_out_of_date() {
                module.status = ModuleStatus::OutOfDate;
            }
        }
    }

    /// Register the module's components into a manager.
    pub fn register_components_into(&self, index: usize, manager: &mut EntityManager) -> Result<()> {
        let module = self
            .module(index)
            .ok_or_else(|| EcsError::ModuleLoadError(format!("module slot {index} is empty")))?;
        for descriptor in &module.descriptor.components {
            manager.register_component(
                descriptor.component,
                descriptor.name.clone(),
                descriptor.reflection.clone(),
                descriptor.functions,
            );
        }
        for descriptor in &module.descriptor.shared_components {
            manager.register_shared_component(
                descriptor.component,
                descriptor.name.clone(),
                descriptor.reflection.clone(),
                descriptor.functions,
            );
        }
        Ok(())
    }

    /// Strip every component the module owns from a manager. Run against
    /// both scene and runtime managers before the binary is unloaded.
    pub fn remove_components_from(&self, index: usize, manager: &mut EntityManager) {
        let Some(module) = self.module(index) else {
            return;
        };
        for descriptor in &module.descriptor.components {
            manager.remove_component_from_all(descriptor.component);
        }
        for descriptor in &module.descriptor.shared_components {
            manager.remove_shared_component_from_all(descriptor.component);
        }
    }

    /// Run the link build functions over every stored value of the
    /// module's components, constructing the runtime form in place.
    pub fn build_runtime_components(&self, index: usize, manager: &mut EntityManager) {
        let Some(module) = self.module(index) else {
            return;
        };
        for descriptor in &module.descriptor.components {
            let Some(build) = descriptor.build_from_link else {
                continue;
            };
            let size = descriptor.reflection.byte_size as usize;
            let query = crate::query::ArchetypeQuery::new().with_unique(
                crate::component::ComponentSignature::from_components(&[descriptor.component]),
            );
            let mut link_value = vec![0u8; size];
            for (archetype_index, base_index) in manager.query(&query) {
                let archetype = &manager.archetypes()[archetype_index as usize];
                let base = archetype.base(base_index);
                let column = base.column_index(descriptor.component).unwrap();
                for stream in 0..base.size() {
                    let value = base.component_ptr(column, stream);
                    unsafe {
                        std::ptr::copy_nonoverlapping(value, link_value.as_mut_ptr(), size);
                        build(value, link_value.as_ptr());
                    }
                }
            }
        }
    }

    /// Drop a module slot. The caller must already have cleared its
    /// components from every manager.
    pub fn unload(&mut self, index: usize) -> Result<()> {
        let slot = self
            .modules
            .get_mut(index)
            .ok_or_else(|| EcsError::ModuleLoadError(format!("module slot {index} is empty")))?;
        let Some(module) = slot.take() else {
            return Err(EcsError::ModuleLoadError(format!("module slot {index} is empty")));
        };
        info!(module = module.descriptor.library_name.as_str(), "module unloaded");
        Ok(())
    }

    /// Task elements of one module, cloned for the scheduler.
    pub fn tasks_of(&self, index: usize) -> Vec<TaskElement> {
        self.module(index)
            .map(|module| module.descriptor.tasks.clone())
            .unwrap_or_default()
    }

    /// Debug-draw elements of one module filtered by enabled task names.
    pub fn debug_tasks_of(&self, index: usize, enabled: &[String]) -> Vec<TaskElement> {
        self.module(index)
            .map(|module| {
                module
                    .descriptor
                    .debug_draw_tasks
                    .iter()
                    .filter(|debug| enabled.iter().any(|name| *name == debug.element.name))
                    .map(|debug| debug.element.clone())
                    .collect()
            })
            .unwrap_or_default()
    }

    /// Debug-draw task names flagged enabled-by-default.
    pub fn default_enabled_debug_tasks(&self, index: usize) -> Vec<String> {
        self.module(index)
            .map(|module| {
                module
                    .descriptor
                    .debug_draw_tasks
                    .iter()
                    .filter(|debug| debug.enabled_by_default)
                    .map(|debug| debug.element.name.clone())
                    .collect()
            })
            .unwrap_or_default()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::reflection::{reflect_pod, FieldInfo, TypeDescriptor};
    use crate::task::{noop_task, TaskGroup};

    const FOO: Component = Component(7);

    fn foo_module() -> ModuleDescriptor {
        let mut descriptor = ModuleDescriptor::new("foo_module");
        descriptor.components.push(ModuleComponentDescriptor::new(
            FOO,
            "Foo",
            reflect_pod(
                vec![FieldInfo {
                    name: "value".to_string(),
                    offset: 0,
                    descriptor: TypeDescriptor::U32,
                }],
                0u32,
            ),
        ));
        descriptor.tasks.push(TaskElement::new(
            "FooSystem",
            TaskGroup::SimulateMid,
            noop_task(),
        ));
        descriptor.debug_draw_tasks.push(ModuleDebugDrawElement {
            element: TaskElement::new("FooDebugDraw", TaskGroup::FinalizeMid, noop_task()),
            enabled_by_default: true,
        });
        descriptor
    }

    #[test]
    fn test_load_and_lookup() {
        let mut registry = ModuleRegistry::new();
        let index = registry.load(foo_module(), None).unwrap();
        assert_eq!(registry.module_index("foo_module"), Some(index));
        assert!(registry.module(index).unwrap().is_available());
        assert_eq!(registry.tasks_of(index).len(), 1);
    }

    #[test]
    fn test_duplicate_load_is_rejected() {
        let mut registry = ModuleRegistry::new();
        registry.load(foo_module(), None).unwrap();
        assert!(matches!(
            registry.load(foo_module(), None),
            Err(EcsError::ModuleLoadError(_))
        ));
    }

    #[test]
    fn test_missing_library_records_failure() {
        let mut registry = ModuleRegistry::new();
        let result = registry.load(
            foo_module(),
            Some(PathBuf::from("/nonexistent/foo_module.so")),
        );
        assert!(result.is_err());
        // The slot still exists so the editor can show the failure
        let index = registry.module_index("foo_module").unwrap();
        assert!(matches!(
            registry.module(index).unwrap().status,
            ModuleStatus::Failed(_)
        ));
    }

    #[test]
    fn test_unload_keeps_indices_stable() {
        let mut registry = ModuleRegistry::new();
        let first = registry.load(foo_module(), None).unwrap();
        let second = registry
            .load(ModuleDescriptor::new("bar_module"), None)
            .unwrap();
        registry.unload(first).unwrap();
        assert!(registry.module(first).is_none());
        assert_eq!(registry.module_index("bar_module"), Some(second));

        // The freed slot is reused
        let third = registry.load(ModuleDescriptor::new("baz_module"), None).unwrap();
        assert_eq!(third, first);
    }

    #[test]
    fn test_debug_task_filtering() {
        let mut registry = ModuleRegistry::new();
        let index = registry.load(foo_module(), None).unwrap();
        assert_eq!(
            registry.default_enabled_debug_tasks(index),
            vec!["FooDebugDraw".to_string()]
        );
        assert_eq!(
            registry.debug_tasks_of(index, &["FooDebugDraw".to_string()]).len(),
            1
        );
        assert!(registry.debug_tasks_of(index, &[]).is_empty());
    }

    #[test]
    fn test_register_and_remove_components() {
        let mut registry = ModuleRegistry::new();
        let index = registry.load(foo_module(), None).unwrap();

        let mut manager = EntityManager::new();
        registry.register_components_into(index, &mut manager).unwrap();
        assert!(manager.is_component_registered(FOO));

        let unique = crate::component::ComponentSignature::from_components(&[FOO]);
        let shared = crate::component::SharedComponentSignature::new();
        manager.create_entities(10, &unique, &shared).unwrap();

        registry.remove_components_from(index, &mut manager);
        assert!(!manager.is_component_registered(FOO));
        assert_eq!(manager.entity_count(), 10);
    }
}
