//! Editor sandboxes
//!
//! A sandbox wraps two entity managers over one component schema: the
//! authoritative scene and a runtime working copy. Play copies scene into
//! runtime and solves the task schedule from the bound modules; Stop
//! restores the runtime from the scene. Everything the editor persists per
//! sandbox lives in the index file structures at the bottom.

use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicU32, Ordering};

use glam::{Quat, Vec3};
use serde::{Deserialize, Serialize};
use tracing::{error, info, warn};

use crate::component::{Component, ComponentSignature, SharedComponentSignature};
use crate::entity::Entity;
use crate::error::{EcsError, Result};
use crate::manager::EntityManager;
use crate::module::{ModuleConfiguration, ModuleRegistry};
use crate::serialization::{load_scene_file, save_scene_file, SceneFormat};
use crate::settings::ModuleSettings;
use crate::task::TaskElement;
use crate::world::{World, WorldDescriptor};

/// Run state machine: `Scene -> Running -> Paused -> Running -> Scene`
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SandboxRunState {
    Scene,
    Running,
    Paused,
}

/// Saved camera orientation of one viewport
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct CameraTransform {
    pub translation: Vec3,
    pub rotation: Quat,
}

impl Default for CameraTransform {
    fn default() -> Self {
        Self {
            translation: Vec3::ZERO,
            rotation: Quat::IDENTITY,
        }
    }
}

/// Render destination owned by the graphics collaborator
pub trait RenderTarget: Send {
    fn size(&self) -> (u32, u32);
}

/// The two viewports of a sandbox
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SandboxViewport {
    Scene,
    Runtime,
}

struct ViewportState {
    camera: CameraTransform,
    render_target: Option<Box<dyn RenderTarget>>,
    rendered: bool,
}

impl ViewportState {
    fn new() -> Self {
        Self {
            camera: CameraTransform::default(),
            render_target: None,
            rendered: false,
        }
    }
}

/// One module bound into a sandbox
pub struct SandboxModule {
    pub module_index: usize,
    pub configuration: ModuleConfiguration,
    pub settings: ModuleSettings,
    pub enabled_debug_tasks: Vec<String>,
    pub deactivated: bool,
}

/// An editor-facing world wrapper: scene manager, runtime world, module
/// list and viewport state.
pub struct Sandbox {
    pub name: String,
    pub scene_path: PathBuf,
    world_descriptor: WorldDescriptor,
    scene: EntityManager,
    world: World,
    modules: Vec<SandboxModule>,
    asset_references: Vec<String>,
    run_state: SandboxRunState,
    pub should_play: bool,
    pub should_pause: bool,
    pub should_step: bool,
    dirty: bool,
    locked_count: AtomicU32,
    viewports: [ViewportState; 2],
}

impl Sandbox {
    pub fn new(name: impl Into<String>, descriptor: WorldDescriptor) -> Self {
        Self {
            name: name.into(),
            scene_path: PathBuf::new(),
            scene: EntityManager::with_base_capacity(descriptor.base_archetype_capacity),
            world: World::new(&descriptor),
            world_descriptor: descriptor,
            modules: Vec::new(),
            asset_references: Vec::new(),
            run_state: SandboxRunState::Scene,
            should_play: false,
            should_pause: false,
            should_step: false,
            dirty: false,
            locked_count: AtomicU32::new(0),
            viewports: [ViewportState::new(), ViewportState::new()],
        }
    }

    pub fn run_state(&self) -> SandboxRunState {
        self.run_state
    }

    pub fn is_dirty(&self) -> bool {
        self.dirty
    }

    pub fn mark_dirty(&mut self) {
        self.dirty = true;
    }

    pub fn scene_manager(&self) -> &EntityManager {
        &self.scene
    }

    /// Mutable scene access marks the scene dirty.
    pub fn scene_manager_mut(&mut self) -> &mut EntityManager {
        self.dirty = true;
        &mut self.scene
    }

    pub fn runtime_world(&self) -> &World {
        &self.world
    }

    pub fn runtime_world_mut(&mut self) -> &mut World {
        &mut self.world
    }

    pub fn world_descriptor(&self) -> &WorldDescriptor {
        &self.world_descriptor
    }

    pub fn asset_references(&self) -> &[String] {
        &self.asset_references
    }

    pub fn modules(&self) -> &[SandboxModule] {
        &self.modules
    }

    // ------------------------------------------------------------------
    // Module binding
    // ------------------------------------------------------------------

    /// Bind a loaded module: register its components into both managers,
    /// load its settings, and enable its default debug-draw tasks.
    pub fn add_module(
        &mut self,
        registry: &ModuleRegistry,
        module_index: usize,
        configuration: ModuleConfiguration,
        project_dir: &Path,
        settings_name: &str,
    ) -> Result<()> {
        let module = registry
            .module(module_index)
            .ok_or_else(|| EcsError::ModuleLoadError(format!("module slot {module_index} is empty")))?;
        if self
            .modules
            .iter()
            .any(|bound| bound.module_index == module_index)
        {
            return Err(EcsError::ModuleLoadError(format!(
                "module '{}' is already bound to sandbox '{}'",
                module.descriptor.library_name, self.name
            )));
        }

        registry.register_components_into(module_index, &mut self.scene)?;
        registry.register_components_into(module_index, &mut self.world.entity_manager)?;

        let settings = ModuleSettings::load_or_default(
            project_dir,
            &module.descriptor.library_name,
            settings_name,
            serde_json::json!({}),
        )?;
        self.modules.push(SandboxModule {
            module_index,
            configuration,
            settings,
            enabled_debug_tasks: registry.default_enabled_debug_tasks(module_index),
            deactivated: false,
        });
        self.dirty = true;
        Ok(())
    }

    /// Unbind a module: every component it owns is cleared from both
    /// managers before the host may unload the binary.
    pub fn remove_module(&mut self, registry: &ModuleRegistry, module_index: usize) -> Result<()> {
        let position = self
            .modules
            .iter()
            .position(|bound| bound.module_index == module_index)
            .ok_or_else(|| {
                EcsError::ModuleLoadError(format!(
                    "module slot {module_index} is not bound to sandbox '{}'",
                    self.name
                ))
            })?;
        registry.remove_components_from(module_index, &mut self.scene);
        registry.remove_components_from(module_index, &mut self.world.entity_manager);
        if let Some(module) = registry.module(module_index) {
            self.world
                .settings
                .remove(&module.descriptor.library_name);
        }
        self.modules.remove(position);
        self.dirty = true;
        Ok(())
    }

    /// Re-register component functions after a module rebuild. Storage for
    /// the module's types is invalidated in both managers first.
    pub fn reload_module(&mut self, registry: &ModuleRegistry, module_index: usize) -> Result<()> {
        if !self
            .modules
            .iter()
            .any(|bound| bound.module_index == module_index)
        {
            return Ok(());
        }
        registry.remove_components_from(module_index, &mut self.scene);
        registry.remove_components_from(module_index, &mut self.world.entity_manager);
        registry.register_components_into(module_index, &mut self.scene)?;
        registry.register_components_into(module_index, &mut self.world.entity_manager)?;
        self.dirty = true;
        Ok(())
    }

    pub fn set_module_deactivated(&mut self, module_index: usize, deactivated: bool) {
        if let Some(module) = self
            .modules
            .iter_mut()
            .find(|bound| bound.module_index == module_index)
        {
            module.deactivated = deactivated;
            self.dirty = true;
        }
    }

    pub fn set_debug_task_enabled(&mut self, module_index: usize, task_name: &str, enabled: bool) {
        if let Some(module) = self
            .modules
            .iter_mut()
            .find(|bound| bound.module_index == module_index)
        {
            let present = module
                .enabled_debug_tasks
                .iter()
                .position(|name| name == task_name);
            match (enabled, present) {
                (true, None) => module.enabled_debug_tasks.push(task_name.to_string()),
                (false, Some(position)) => {
                    module.enabled_debug_tasks.remove(position);
                }
                _ => return,
            }
            self.dirty = true;
        }
    }

    /// Task elements of every active module plus their enabled debug-draw
    /// tasks, in module-bind order.
    fn active_task_elements(&self, registry: &ModuleRegistry) -> Vec<TaskElement> {
        let mut elements = Vec::new();
        for module in &self.modules {
            if module.deactivated {
                continue;
            }
            elements.extend(registry.tasks_of(module.module_index));
            elements.extend(registry.debug_tasks_of(module.module_index, &module.enabled_debug_tasks));
        }
        elements
    }

    fn bind_settings(&mut self, registry: &ModuleRegistry) {
        self.world.settings.clear();
        for module in &self.modules {
            if module.deactivated {
                continue;
            }
            if let Some(loaded) = registry.module(module.module_index) {
                self.world.settings.bind(
                    loaded.descriptor.library_name.clone(),
                    module.settings.values.clone(),
                );
            }
        }
    }

    // ------------------------------------------------------------------
    // Run state machine
    // ------------------------------------------------------------------

    /// Scene -> Running: copy scene into runtime, rebind settings, rebuild
    /// and solve the schedule. Paused -> Running resumes without copying.
    /// A scheduling conflict leaves the sandbox in its current state.
    pub fn play(&mut self, registry: &ModuleRegistry) -> Result<()> {
        match self.run_state {
            SandboxRunState::Paused => {
                self.run_state = SandboxRunState::Running;
                return Ok(());
            }
            SandboxRunState::Running => {
                return Err(EcsError::SandboxStateError(format!(
                    "sandbox '{}' is already running",
                    self.name
                )));
            }
            SandboxRunState::Scene => {}
        }

        let elements = self.active_task_elements(registry);
        if let Err(err) = self.world.rebuild_schedule(elements) {
            error!(sandbox = self.name.as_str(), error = %err, "refusing to play");
            return Err(err);
        }

        self.world.entity_manager = self.scene.snapshot();
        for module in &self.modules {
            if !module.deactivated {
                registry.build_runtime_components(module.module_index, &mut self.world.entity_manager);
            }
        }
        self.bind_settings(registry);
        self.run_state = SandboxRunState::Running;
        info!(sandbox = self.name.as_str(), "playing");
        Ok(())
    }

    /// Running -> Paused
    pub fn pause(&mut self) -> Result<()> {
        if self.run_state != SandboxRunState::Running {
            return Err(EcsError::SandboxStateError(format!(
                "sandbox '{}' is not running",
                self.name
            )));
        }
        self.run_state = SandboxRunState::Paused;
        Ok(())
    }

    /// Running|Paused -> Scene: the runtime manager is restored from the
    /// scene.
    pub fn stop(&mut self) -> Result<()> {
        if self.run_state == SandboxRunState::Scene {
            return Err(EcsError::SandboxStateError(format!(
                "sandbox '{}' is not running",
                self.name
            )));
        }
        self.world.entity_manager = self.scene.snapshot();
        self.run_state = SandboxRunState::Scene;
        self.should_pause = false;
        self.should_step = false;
        info!(sandbox = self.name.as_str(), "stopped");
        Ok(())
    }

    /// Consume the editor's `should_play` / `should_pause` flags.
    pub fn apply_frame_actions(&mut self, registry: &ModuleRegistry) -> Result<()> {
        if std::mem::take(&mut self.should_play) {
            self.play(registry)?;
        }
        if std::mem::take(&mut self.should_pause) {
            self.pause()?;
        }
        Ok(())
    }

    /// Advance one frame when running, or a single stepped frame when
    /// paused with `should_step` raised.
    pub fn tick(&mut self) -> Result<()> {
        let step = std::mem::take(&mut self.should_step);
        match self.run_state {
            SandboxRunState::Running => self.world.run_frame(),
            SandboxRunState::Paused if step => self.world.run_frame(),
            _ => Ok(()),
        }
    }

    // ------------------------------------------------------------------
    // Entity operations on the active manager
    // ------------------------------------------------------------------

    /// The manager entity operations target: scene while stopped, runtime
    /// while running or paused.
    pub fn active_entity_manager(&self) -> &EntityManager {
        match self.run_state {
            SandboxRunState::Scene => &self.scene,
            _ => &self.world.entity_manager,
        }
    }

    fn active_entity_manager_mut(&mut self) -> &mut EntityManager {
        match self.run_state {
            SandboxRunState::Scene => {
                self.dirty = true;
                &mut self.scene
            }
            _ => &mut self.world.entity_manager,
        }
    }

    pub fn create_entity(
        &mut self,
        unique: &ComponentSignature,
        shared: &SharedComponentSignature,
    ) -> Result<Entity> {
        self.active_entity_manager_mut().create_entity(unique, shared)
    }

    pub fn delete_entity(&mut self, entity: Entity) -> Result<()> {
        self.active_entity_manager_mut().delete_entity(entity)
    }

    pub fn add_component(&mut self, entity: Entity, component: Component, data: &[u8]) -> Result<()> {
        self.active_entity_manager_mut().add_component(entity, component, data)
    }

    pub fn remove_component(&mut self, entity: Entity, component: Component) -> Result<()> {
        self.active_entity_manager_mut().remove_component(entity, component)
    }

    // ------------------------------------------------------------------
    // Scene persistence
    // ------------------------------------------------------------------

    pub fn set_scene_path(&mut self, path: impl Into<PathBuf>) {
        self.scene_path = path.into();
    }

    pub fn save_scene(&mut self, format: SceneFormat) -> Result<()> {
        if self.scene_path.as_os_str().is_empty() {
            return Err(EcsError::IoError(format!(
                "sandbox '{}' has no scene path",
                self.name
            )));
        }
        save_scene_file(&self.scene, &self.asset_references, &self.scene_path, format)?;
        self.dirty = false;
        Ok(())
    }

    /// Load the scene file into the scene manager. On failure the sandbox
    /// refuses the load and keeps its current scene.
    pub fn load_scene(&mut self, format: SceneFormat) -> Result<()> {
        if self.run_state != SandboxRunState::Scene {
            return Err(EcsError::SandboxStateError(format!(
                "sandbox '{}' cannot load a scene while running",
                self.name
            )));
        }
        let mut staged = self.scene.snapshot();
        staged.clear();
        let assets = load_scene_file(&mut staged, &self.scene_path, format)?;
        self.scene = staged;
        self.asset_references = assets;
        self.world.entity_manager = self.scene.snapshot();
        self.dirty = false;
        Ok(())
    }

    // ------------------------------------------------------------------
    // Live settings reload
    // ------------------------------------------------------------------

    /// Lazy tick: reload any settings file whose on-disk timestamp moved,
    /// rebinding the settings table when something changed. Returns how
    /// many modules reloaded.
    pub fn tick_settings_reload(&mut self, registry: &ModuleRegistry) -> usize {
        let mut reloaded = 0;
        for module in &mut self.modules {
            match module.settings.reload_if_changed() {
                Ok(true) => reloaded += 1,
                Ok(false) => {}
                Err(err) => {
                    warn!(
                        sandbox = self.name.as_str(),
                        error = %err,
                        "settings reload failed"
                    );
                }
            }
        }
        if reloaded > 0 {
            self.bind_settings(registry);
        }
        reloaded
    }

    // ------------------------------------------------------------------
    // Locking
    // ------------------------------------------------------------------

    /// Mark an operation that may outlive the sandbox's caller.
    pub fn lock(&self) {
        self.locked_count.fetch_add(1, Ordering::AcqRel);
    }

    pub fn unlock(&self) {
        let previous = self.locked_count.fetch_sub(1, Ordering::AcqRel);
        debug_assert!(previous > 0, "sandbox unlock without a matching lock");
    }

    pub fn is_locked(&self) -> bool {
        self.locked_count.load(Ordering::Acquire) > 0
    }

    /// Block until every outstanding lock is released. Destruction paths
    /// call this before tearing the sandbox down.
    pub fn wait_until_unlocked(&self) {
        while self.is_locked() {
            std::thread::yield_now();
        }
    }

    // ------------------------------------------------------------------
    // Viewports
    // ------------------------------------------------------------------

    fn viewport(&self, viewport: SandboxViewport) -> &ViewportState {
        &self.viewports[viewport as usize]
    }

    fn viewport_mut(&mut self, viewport: SandboxViewport) -> &mut ViewportState {
        &mut self.viewports[viewport as usize]
    }

    pub fn camera(&self, viewport: SandboxViewport) -> CameraTransform {
        self.viewport(viewport).camera
    }

    pub fn set_camera(&mut self, viewport: SandboxViewport, camera: CameraTransform) {
        self.viewport_mut(viewport).camera = camera;
        self.dirty = true;
    }

    pub fn set_render_target(
        &mut self,
        viewport: SandboxViewport,
        target: Option<Box<dyn RenderTarget>>,
    ) {
        self.viewport_mut(viewport).render_target = target;
    }

    pub fn render_target(&self, viewport: SandboxViewport) -> Option<&dyn RenderTarget> {
        self.viewport(viewport).render_target.as_deref()
    }

    pub fn was_rendered(&self, viewport: SandboxViewport) -> bool {
        self.viewport(viewport).rendered
    }

    /// Hand the graphics collaborator the viewport's entity manager and
    /// camera; it returns whether the viewport was rendered.
    pub fn render_viewport(
        &mut self,
        viewport: SandboxViewport,
        renderer: impl FnOnce(&EntityManager, &CameraTransform) -> bool,
    ) {
        let manager = match viewport {
            SandboxViewport::Scene => &self.scene,
            SandboxViewport::Runtime => &self.world.entity_manager,
        };
        let camera = self.viewports[viewport as usize].camera;
        let rendered = renderer(manager, &camera);
        self.viewports[viewport as usize].rendered = rendered;
    }
}

// ----------------------------------------------------------------------
// Sandbox index file
// ----------------------------------------------------------------------

/// One module reference inside a persisted sandbox entry
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SandboxModuleEntry {
    pub library_name: String,
    pub configuration: ModuleConfiguration,
    pub settings_name: String,
    pub deactivated: bool,
    pub enabled_debug_tasks: Vec<String>,
}

/// One persisted sandbox
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SandboxFileEntry {
    pub name: String,
    pub world_descriptor_name: String,
    pub scene_path: PathBuf,
    pub modules: Vec<SandboxModuleEntry>,
    pub cameras: [CameraTransform; 2],
}

/// Per-project index of every sandbox
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct SandboxIndexFile {
    pub version: u32,
    pub sandboxes: Vec<SandboxFileEntry>,
}

const SANDBOX_INDEX_VERSION: u32 = 1;

impl Sandbox {
    /// Snapshot this sandbox into its persisted form.
    pub fn to_file_entry(&self, registry: &ModuleRegistry) -> SandboxFileEntry {
        SandboxFileEntry {
            name: self.name.clone(),
            world_descriptor_name: String::from("Default"),
            scene_path: self.scene_path.clone(),
            modules: self
                .modules
                .iter()
                .filter_map(|module| {
                    let loaded = registry.module(module.module_index)?;
                    Some(SandboxModuleEntry {
                        library_name: loaded.descriptor.library_name.clone(),
                        configuration: module.configuration,
                        settings_name: module.settings.settings_name.clone(),
                        deactivated: module.deactivated,
                        enabled_debug_tasks: module.enabled_debug_tasks.clone(),
                    })
                })
                .collect(),
            cameras: [
                self.viewports[0].camera,
                self.viewports[1].camera,
            ],
        }
    }

    /// Rebuild a sandbox from its persisted form. Modules missing from the
    /// registry are skipped with a warning; the sandbox still opens.
    pub fn from_file_entry(
        entry: &SandboxFileEntry,
        registry: &ModuleRegistry,
        project_dir: &Path,
        descriptor: WorldDescriptor,
    ) -> Result<Sandbox> {
        let mut sandbox = Sandbox::new(entry.name.clone(), descriptor);
        sandbox.scene_path = entry.scene_path.clone();
        sandbox.viewports[0].camera = entry.cameras[0];
        sandbox.viewports[1].camera = entry.cameras[1];

        for module_entry in &entry.modules {
            let Some(module_index) = registry.module_index(&module_entry.library_name) else {
                warn!(
                    sandbox = entry.name.as_str(),
                    module = module_entry.library_name.as_str(),
                    "module missing from the registry, skipping"
                );
                continue;
            };
            sandbox.add_module(
                registry,
                module_index,
                module_entry.configuration,
                project_dir,
                &module_entry.settings_name,
            )?;
            sandbox.set_module_deactivated(module_index, module_entry.deactivated);
            if let Some(module) = sandbox
                .modules
                .iter_mut()
                .find(|bound| bound.module_index == module_index)
            {
                module.enabled_debug_tasks = module_entry.enabled_debug_tasks.clone();
            }
        }
        sandbox.dirty = false;
        Ok(sandbox)
    }
}

/// Persist the sandbox index for a project.
pub fn save_sandbox_index(path: &Path, index: &SandboxIndexFile) -> Result<()> {
    let mut stamped = index.clone();
    stamped.version = SANDBOX_INDEX_VERSION;
    let data = serde_json::to_string_pretty(&stamped)
        .map_err(|err| EcsError::SerializationError(err.to_string()))?;
    if let Some(parent) = path.parent() {
        std::fs::create_dir_all(parent)?;
    }
    std::fs::write(path, data)?;
    Ok(())
}

/// Load the sandbox index for a project.
pub fn load_sandbox_index(path: &Path) -> Result<SandboxIndexFile> {
    let data = std::fs::read_to_string(path)?;
    let index: SandboxIndexFile = serde_json::from_str(&data)
        .map_err(|err| EcsError::DeserializationError(err.to_string()))?;
    if index.version != SANDBOX_INDEX_VERSION {
        return Err(EcsError::DeserializationError(format!(
            "unsupported sandbox index version {}",
            index.version
        )));
    }
    Ok(index)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::module::ModuleDescriptor;

    fn empty_registry_sandbox() -> (ModuleRegistry, Sandbox) {
        let registry = ModuleRegistry::new();
        let sandbox = Sandbox::new("test", WorldDescriptor {
            thread_count: 2,
            ..Default::default()
        });
        (registry, sandbox)
    }

    #[test]
    fn test_state_machine_transitions() {
        let (registry, mut sandbox) = empty_registry_sandbox();
        assert_eq!(sandbox.run_state(), SandboxRunState::Scene);

        sandbox.play(&registry).unwrap();
        assert_eq!(sandbox.run_state(), SandboxRunState::Running);
        assert!(sandbox.play(&registry).is_err());

        sandbox.pause().unwrap();
        assert_eq!(sandbox.run_state(), SandboxRunState::Paused);

        // Resume from pause
        sandbox.play(&registry).unwrap();
        assert_eq!(sandbox.run_state(), SandboxRunState::Running);

        sandbox.stop().unwrap();
        assert_eq!(sandbox.run_state(), SandboxRunState::Scene);
        assert!(sandbox.stop().is_err());
    }

    #[test]
    fn test_should_flags_drive_transitions() {
        let (registry, mut sandbox) = empty_registry_sandbox();
        sandbox.should_play = true;
        sandbox.apply_frame_actions(&registry).unwrap();
        assert_eq!(sandbox.run_state(), SandboxRunState::Running);
        assert!(!sandbox.should_play);

        sandbox.should_pause = true;
        sandbox.apply_frame_actions(&registry).unwrap();
        assert_eq!(sandbox.run_state(), SandboxRunState::Paused);
    }

    #[test]
    fn test_lock_counter() {
        let (_, sandbox) = empty_registry_sandbox();
        assert!(!sandbox.is_locked());
        sandbox.lock();
        sandbox.lock();
        assert!(sandbox.is_locked());
        sandbox.unlock();
        sandbox.unlock();
        assert!(!sandbox.is_locked());
        sandbox.wait_until_unlocked();
    }

    #[test]
    fn test_scene_edits_mark_dirty() {
        let (_, mut sandbox) = empty_registry_sandbox();
        assert!(!sandbox.is_dirty());
        let _ = sandbox.scene_manager_mut();
        assert!(sandbox.is_dirty());
    }

    #[test]
    fn test_add_module_binds_components_and_debug_tasks() {
        let mut registry = ModuleRegistry::new();
        let mut descriptor = ModuleDescriptor::new("draw_module");
        descriptor.debug_draw_tasks.push(crate::module::ModuleDebugDrawElement {
            element: TaskElement::new(
                "DrawBounds",
                crate::task::TaskGroup::FinalizeMid,
                crate::task::noop_task(),
            ),
            enabled_by_default: true,
        });
        let module_index = registry.load(descriptor, None).unwrap();

        let mut sandbox = Sandbox::new("test", WorldDescriptor::default());
        let project = std::env::temp_dir().join(format!("forge_ecs_sbx_{}", std::process::id()));
        sandbox
            .add_module(
                &registry,
                module_index,
                ModuleConfiguration::Debug,
                &project,
                "Default",
            )
            .unwrap();

        assert_eq!(sandbox.modules().len(), 1);
        assert_eq!(
            sandbox.modules()[0].enabled_debug_tasks,
            vec!["DrawBounds".to_string()]
        );
        // The enabled debug task feeds the schedule
        assert_eq!(sandbox.active_task_elements(&registry).len(), 1);
        sandbox.set_debug_task_enabled(module_index, "DrawBounds", false);
        assert!(sandbox.active_task_elements(&registry).is_empty());
        let _ = std::fs::remove_dir_all(project);
    }

    #[test]
    fn test_render_viewport_reports_back() {
        let (_, mut sandbox) = empty_registry_sandbox();
        assert!(!sandbox.was_rendered(SandboxViewport::Scene));
        sandbox.render_viewport(SandboxViewport::Scene, |manager, camera| {
            assert_eq!(manager.entity_count(), 0);
            assert_eq!(camera.translation, Vec3::ZERO);
            true
        });
        assert!(sandbox.was_rendered(SandboxViewport::Scene));
    }

    #[test]
    fn test_index_file_round_trip() {
        let (registry, mut sandbox) = empty_registry_sandbox();
        sandbox.set_scene_path("scenes/main.scene");
        sandbox.set_camera(
            SandboxViewport::Scene,
            CameraTransform {
                translation: Vec3::new(1.0, 2.0, 3.0),
                rotation: Quat::IDENTITY,
            },
        );

        let index = SandboxIndexFile {
            version: 1,
            sandboxes: vec![sandbox.to_file_entry(&registry)],
        };
        let path = std::env::temp_dir().join(format!(
            "forge_ecs_index_{}.json",
            std::process::id()
        ));
        save_sandbox_index(&path, &index).unwrap();
        let loaded = load_sandbox_index(&path).unwrap();

        assert_eq!(loaded.sandboxes.len(), 1);
        assert_eq!(loaded.sandboxes[0].name, "test");
        assert_eq!(loaded.sandboxes[0].scene_path, PathBuf::from("scenes/main.scene"));
        assert_eq!(loaded.sandboxes[0].cameras[0].translation, Vec3::new(1.0, 2.0, 3.0));
        let _ = std::fs::remove_file(path);
    }
}
