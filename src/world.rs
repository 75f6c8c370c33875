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

//! World: entity manager, scheduler, task manager and frame inputs
//!
//! The world owns its collaborators by value; tasks receive `&mut World` on
//! invocation and never store it. A freshly constructed world is
//! preinitialised: workers running, resources owned, no entities yet.

use std::time::Instant;

use ahash::AHashSet;
use glam::Vec2;
use tracing::debug;

use crate::error::{EcsError, Result};
use crate::manager::EntityManager;
use crate::scheduler::{SchedulePlan, TaskScheduler};
use crate::settings::SystemSettings;
use crate::task::TaskElement;
use crate::task_manager::TaskManager;

/// Tunables for world construction
#[derive(Debug, Clone)]
pub struct WorldDescriptor {
    pub thread_count: usize,
    /// Rows a fresh archetype base starts with
    pub base_archetype_capacity: u32,
}

impl Default for WorldDescriptor {
    fn default() -> Self {
        Self {
            thread_count: 4,
            base_archetype_capacity: 4,
        }
    }
}

/// Per-frame mouse state fed by the input collaborator
#[derive(Debug, Clone, Copy, Default)]
pub struct MouseState {
    pub position: Vec2,
    pub delta: Vec2,
    pub wheel: f32,
    pub buttons: [bool; 3],
}

/// Per-frame keyboard state fed by the input collaborator
#[derive(Debug, Clone, Default)]
pub struct KeyboardState {
    pressed: AHashSet<u32>,
}

impl KeyboardState {
    pub fn press(&mut self, key: u32) {
        self.pressed.insert(key);
    }

    pub fn release(&mut self, key: u32) {
        self.pressed.remove(&key);
    }

    pub fn is_down(&self, key: u32) -> bool {
        self.pressed.contains(&key)
    }

    pub fn clear(&mut self) {
        self.pressed.clear();
    }
}

/// Frame-scoped inputs visible to every task
#[derive(Debug, Clone, Default)]
pub struct FrameInputs {
    pub delta_seconds: f32,
    pub elapsed_seconds: f64,
    pub frame_index: u64,
    pub mouse: MouseState,
    pub keyboard: KeyboardState,
}

/// Monotonic frame clock
struct FrameTimer {
    started: Instant,
    last_frame: Instant,
}

impl FrameTimer {
    fn new() -> Self {
        let now = Instant::now();
        Self {
            started: now,
            last_frame: now,
        }
    }

    /// Returns `(delta_seconds, elapsed_seconds)`
    fn tick(&mut self) -> (f32, f64) {
        let now = Instant::now();
        let delta = now.duration_since(self.last_frame).as_secs_f32();
        self.last_frame = now;
        (delta, now.duration_since(self.started).as_secs_f64())
    }
}

/// The runtime container for one simulation
pub struct World {
    pub entity_manager: EntityManager,
    pub settings: SystemSettings,
    pub inputs: FrameInputs,
    pub task_manager: TaskManager,
    scheduler: TaskScheduler,
    plan: Option<SchedulePlan>,
    timer: FrameTimer,
}

impl World {
    pub fn new(descriptor: &WorldDescriptor) -> Self {
        Self {
            entity_manager: EntityManager::with_base_capacity(descriptor.base_archetype_capacity),
            settings: SystemSettings::new(),
            inputs: FrameInputs::default(),
            task_manager: TaskManager::new(descriptor.thread_count),
            scheduler: TaskScheduler::new(),
            plan: None,
            timer: FrameTimer::new(),
        }
    }

    /// Replace the task set and solve it into a plan. On failure the
    /// previous plan is discarded and the error carries the diagnosis.
    pub fn rebuild_schedule(
        &mut self,
        elements: impl IntoIterator<Item = TaskElement>,
    ) -> Result<&SchedulePlan> {
        self.plan = None;
        self.scheduler.clear();
        self.scheduler.add_tasks(elements);
        let plan = self.scheduler.solve()?;
        debug!(
            waves = plan.wave_count(),
            tasks = plan.task_count(),
            "schedule rebuilt"
        );
        self.plan = Some(plan);
        Ok(self.plan.as_ref().unwrap())
    }

    pub fn schedule_plan(&self) -> Option<&SchedulePlan> {
        self.plan.as_ref()
    }

    pub fn scheduler_elements(&self) -> &[TaskElement] {
        self.scheduler.elements()
    }

    pub fn has_schedule(&self) -> bool {
        self.plan.is_some()
    }

    pub fn clear_schedule(&mut self) {
        self.plan = None;
        self.scheduler.clear();
    }

    /// Advance the frame clock and run every wave of the solved plan.
    /// Task failures are collected; the first one is returned after the
    /// frame completes so later groups still run their barriers.
    pub fn run_frame(&mut self) -> Result<()> {
        let (delta, elapsed) = self.timer.tick();
        self.inputs.delta_seconds = delta;
        self.inputs.elapsed_seconds = elapsed;
        self.inputs.frame_index += 1;

        let Some(plan) = self.plan.take() else {
            return Ok(());
        };
        let elements: Vec<TaskElement> = self.scheduler.elements().to_vec();

        let mut first_error: Option<EcsError> = None;
        let world_ptr: *mut World = self;
        for wave in &plan.waves {
            let tasks: Vec<TaskElement> = wave
                .tasks
                .iter()
                .map(|&index| elements[index].clone())
                .collect();
            // The plan guarantees co-waved tasks are conflict-free, and the
            // world outlives the blocking run_wave call.
            let errors = unsafe { self.task_manager.run_wave(world_ptr, &tasks) };
            if first_error.is_none() {
                first_error = errors.into_iter().next().map(|(_, error)| error);
            }
        }
        self.plan = Some(plan);
        match first_error {
            Some(error) => Err(error),
            None => Ok(()),
        }
    }

    /// Drain in-flight work and join the worker threads. The world is
    /// unusable for ticking afterwards.
    pub fn terminate(&mut self) {
        self.task_manager.terminate_threads();
    }
}
