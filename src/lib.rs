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

//! Forge ECS - Editor-grade archetype entity component system
//!
//! Reflection-driven entity store with shared-component deduplication,
//! a wave scheduler over component-access declarations, and a sandbox
//! layer for live scene editing.

pub mod archetype;
pub mod arena;
pub mod component;
pub mod containers;
pub mod entity;
pub mod error;
pub mod hierarchy;
pub mod manager;
pub mod query;
pub mod reflection;

// Scheduling
pub mod scheduler;
pub mod task;
pub mod task_manager;

// Worlds and the editor layer
pub mod change_set;
pub mod module;
pub mod sandbox;
pub mod serialization;
pub mod settings;
pub mod world;

// Re-exports for convenience
pub use archetype::{Archetype, ArchetypeBase};
pub use change_set::{apply_entity_changes, determine_entity_changes, EntityChange, EntityChangeKind};
pub use component::{
    Component, ComponentFunctions, ComponentInfo, ComponentSignature, SharedComponentSignature,
    SharedInstance,
};
pub use entity::{Entity, EntityInfo, EntityPool};
pub use error::{set_crash_handler, EcsError, Result};
pub use manager::EntityManager;
pub use module::{ModuleConfiguration, ModuleDescriptor, ModuleRegistry};
pub use query::ArchetypeQuery;
pub use sandbox::{Sandbox, SandboxRunState, SandboxViewport};
pub use scheduler::{SchedulePlan, TaskScheduler, Wave};
pub use serialization::SceneFormat;
pub use task::{ComponentAccess, TaskComponentQuery, TaskElement, TaskGroup};
pub use task_manager::TaskManager;
pub use world::{World, WorldDescriptor};
