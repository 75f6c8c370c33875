//! Task scheduler: dependency graph to wave-ordered execution plan
//!
//! The solver buckets tasks by group, adds explicit name-dependency edges
//! and implicit conflict edges from the component-access declarations, then
//! layers each group with Kahn's algorithm. Tasks inside a wave are
//! conflict-free by construction; waves run in order with a barrier between
//! them.

use rustc_hash::FxHashMap;

use crate::error::{EcsError, Result};
use crate::task::{TaskElement, TaskGroup};

/// One parallel batch inside a group
#[derive(Debug, Clone)]
pub struct Wave {
    pub group: TaskGroup,
    /// Indices into the scheduler's element list, in registration order
    pub tasks: Vec<usize>,
}

/// Solved execution plan
#[derive(Debug, Clone, Default)]
pub struct SchedulePlan {
    pub waves: Vec<Wave>,
}

impl SchedulePlan {
    pub fn wave_count(&self) -> usize {
        self.waves.len()
    }

    pub fn task_count(&self) -> usize {
        self.waves.iter().map(|wave| wave.tasks.len()).sum()
    }

    /// Human-readable plan, one line per wave.
    pub fn describe(&self, elements: &[TaskElement]) -> String {
        use std::fmt::Write;
        let mut out = String::new();
        for (index, wave) in self.waves.iter().enumerate() {
            let names: Vec<&str> = wave
                .tasks
                .iter()
                .map(|&task| elements[task].name.as_str())
                .collect();
            let _ = writeln!(out, "wave {index} [{}]: {}", wave.group, names.join(", "));
        }
        out
    }
}

/// Collects task elements and solves them into a [`SchedulePlan`].
#[derive(Default)]
pub struct TaskScheduler {
    elements: Vec<TaskElement>,
}

impl TaskScheduler {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn add_task(&mut self, element: TaskElement) {
        self.elements.push(element);
    }

    pub fn add_tasks(&mut self, elements: impl IntoIterator<Item = TaskElement>) {
        self.elements.extend(elements);
    }

    pub fn elements(&self) -> &[TaskElement] {
        &self.elements
    }

    pub fn len(&self) -> usize {
        self.elements.len()
    }

    pub fn is_empty(&self) -> bool {
        self.elements.is_empty()
    }

    pub fn clear(&mut self) {
        self.elements.clear();
    }

    /// Solve the registered tasks into waves.
    ///
    /// Fails with [`EcsError::SchedulingConflict`] on unknown or backwards
    /// dependencies, duplicate names, or a dependency cycle; the message
    /// names the offending systems.
    pub fn solve(&self) -> Result<SchedulePlan> {
        let mut by_name: FxHashMap<&str, usize> = FxHashMap::default();
        for (index, element) in self.elements.iter().enumerate() {
            if by_name.insert(element.name.as_str(), index).is_some() {
                return Err(EcsError::SchedulingConflict(format!(
                    "two systems are registered under the name '{}'",
                    element.name
                )));
            }
        }

        // Bucket by group, keeping registration order inside each bucket
        let mut groups: [Vec<usize>; crate::task::TASK_GROUP_COUNT] = Default::default();
        for (index, element) in self.elements.iter().enumerate() {
            groups[element.group.index()].push(index);
        }

        let mut plan = SchedulePlan::default();
        for (group_index, bucket) in groups.iter().enumerate() {
            if bucket.is_empty() {
                continue;
            }
            let group = TaskGroup::ALL[group_index];
            self.solve_group(group, bucket, &by_name, &mut plan)?;
        }
        Ok(plan)
    }

    fn solve_group(
        &self,
        group: TaskGroup,
        bucket: &[usize],
        by_name: &FxHashMap<&str, usize>,
        plan: &mut SchedulePlan,
    ) -> Result<()> {
        let count = bucket.len();
        // Adjacency over bucket-local positions: edges[from] holds `to`
        let mut edges: Vec<Vec<usize>> = vec![Vec::new(); count];
        let mut in_degree = vec![0usize; count];
        let local_of: FxHashMap<usize, usize> = bucket
            .iter()
            .enumerate()
            .map(|(local, &element)| (element, local))
            .collect();

        // Explicit name dependencies
        let mut named_pairs: Vec<(usize, usize)> = Vec::new();
        for (local, &element_index) in bucket.iter().enumerate() {
            let element = &self.elements[element_index];
            for dependency in &element.dependencies {
                let Some(&target) = by_name.get(dependency.as_str()) else {
                    return Err(EcsError::SchedulingConflict(format!(
                        "system '{}' depends on unknown system '{}'",
                        element.name, dependency
                    )));
                };
                let target_group = self.elements[target].group;
                if target_group > element.group {
                    return Err(EcsError::SchedulingConflict(format!(
                        "system '{}' in group {} depends on '{}' in the later group {}",
                        element.name, element.group, dependency, target_group
                    )));
                }
                if target_group < element.group {
                    // Satisfied by the group barrier
                    continue;
                }
                let dependency_local = local_of[&target];
                edges[dependency_local].push(local);
                in_degree[local] += 1;
                named_pairs.push((dependency_local.min(local), dependency_local.max(local)));
            }
        }

        // Implicit conflict edges, registration order as the tie-break.
        // Pairs already related by an explicit dependency are skipped.
        for first in 0..count {
            for second in (first + 1)..count {
                if named_pairs.contains(&(first, second)) {
                    continue;
                }
                let a = &self.elements[bucket[first]];
                let b = &self.elements[bucket[second]];
                let conflict = a.barrier_task
                    || b.barrier_task
                    || a.query.conflicts_with(&b.query);
                if conflict {
                    edges[first].push(second);
                    in_degree[second] += 1;
                }
            }
        }

        // Kahn layering: every zero-in-degree task forms the next wave
        let mut remaining = count;
        let mut ready: Vec<usize> = (0..count).filter(|&local| in_degree[local] == 0).collect();
        while !ready.is_empty() {
            let wave_tasks: Vec<usize> = ready.iter().map(|&local| bucket[local]).collect();
            let mut next_ready = Vec::new();
            for &local in &ready {
                for &successor in &edges[local] {
                    in_degree[successor] -= 1;
                    if in_degree[successor] == 0 {
                        next_ready.push(successor);
                    }
                }
            }
            remaining -= ready.len();
            plan.waves.push(Wave {
                group,
                tasks: wave_tasks,
            });
            next_ready.sort_unstable();
            ready = next_ready;
        }

        if remaining > 0 {
            let stuck: Vec<&str> = (0..count)
                .filter(|&local| in_degree[local] > 0)
                .map(|local| self.elements[bucket[local]].name.as_str())
                .collect();
            return Err(EcsError::SchedulingConflict(format!(
                "dependency cycle in group {} between systems: {}",
                group,
                stuck.join(", ")
            )));
        }
        Ok(())
    }
}
