//! Task declarations consumed by the scheduler
//!
//! A system registers one element per task: its function, the components it
//! touches with their access modes, name dependencies, and the coarse group
//! that pre-orders it against every other task.

use std::fmt;
use std::sync::Arc;

use smallvec::SmallVec;

use crate::arena::ScratchArena;
use crate::component::Component;
use crate::crash_assert;
use crate::error::Result;
use crate::query::ArchetypeQuery;
use crate::world::World;

/// Entries stored inline per query category before spilling to the heap
pub const TASK_QUERY_INLINE_COUNT: usize = 4;

/// Nine coarse execution phases. Tasks never cross groups inside a frame;
/// every task of group `k` completes before group `k + 1` starts.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub enum TaskGroup {
    InitializeEarly,
    InitializeMid,
    InitializeLate,
    SimulateEarly,
    SimulateMid,
    SimulateLate,
    FinalizeEarly,
    FinalizeMid,
    FinalizeLate,
}

/// Number of task groups
pub const TASK_GROUP_COUNT: usize = 9;

impl TaskGroup {
    pub const ALL: [TaskGroup; TASK_GROUP_COUNT] = [
        TaskGroup::InitializeEarly,
        TaskGroup::InitializeMid,
        TaskGroup::InitializeLate,
        TaskGroup::SimulateEarly,
        TaskGroup::SimulateMid,
        TaskGroup::SimulateLate,
        TaskGroup::FinalizeEarly,
        TaskGroup::FinalizeMid,
        TaskGroup::FinalizeLate,
    ];

    pub fn index(self) -> usize {
        match self {
            TaskGroup::InitializeEarly => 0,
            TaskGroup::InitializeMid => 1,
            TaskGroup::InitializeLate => 2,
            TaskGroup::SimulateEarly => 3,
            TaskGroup::SimulateMid => 4,
            TaskGroup::SimulateLate => 5,
            TaskGroup::FinalizeEarly => 6,
            TaskGroup::FinalizeMid => 7,
            TaskGroup::FinalizeLate => 8,
        }
    }

    pub fn as_str(self) -> &'static str {
        match self {
            TaskGroup::InitializeEarly => "Initialize Early",
            TaskGroup::InitializeMid => "Initialize Mid",
            TaskGroup::InitializeLate => "Initialize Late",
            TaskGroup::SimulateEarly => "Simulate Early",
            TaskGroup::SimulateMid => "Simulate Mid",
            TaskGroup::SimulateLate => "Simulate Late",
            TaskGroup::FinalizeEarly => "Finalize Early",
            TaskGroup::FinalizeMid => "Finalize Mid",
            TaskGroup::FinalizeLate => "Finalize Late",
        }
    }
}

impl fmt::Display for TaskGroup {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Component access mode declared by a task
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ComponentAccess {
    Read,
    Write,
}

impl ComponentAccess {
    /// Two accesses to the same component conflict unless both read.
    pub fn conflicts_with(self, other: ComponentAccess) -> bool {
        matches!(self, ComponentAccess::Write) || matches!(other, ComponentAccess::Write)
    }
}

/// Per-task component access declaration.
///
/// Required entries come first; optional (absent-allowed) entries sit at the
/// tail of each required list and are counted separately. Up to four entries
/// per category stay inline.
#[derive(Debug, Clone, Default)]
pub struct TaskComponentQuery {
    components: SmallVec<[(Component, ComponentAccess); TASK_QUERY_INLINE_COUNT]>,
    shared_components: SmallVec<[(Component, ComponentAccess); TASK_QUERY_INLINE_COUNT]>,
    exclude_components: SmallVec<[Component; TASK_QUERY_INLINE_COUNT]>,
    exclude_shared_components: SmallVec<[Component; TASK_QUERY_INLINE_COUNT]>,
    optional_count: u8,
    optional_shared_count: u8,
}

impl TaskComponentQuery {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn add_component(&mut self, component: Component, access: ComponentAccess) -> &mut Self {
        crash_assert!(
            self.optional_count == 0,
            "Adding required component {} after an optional one",
            component.0
        );
        self.components.push((component, access));
        self
    }

    pub fn add_shared_component(
        &mut self,
        component: Component,
        access: ComponentAccess,
    ) -> &mut Self {
        crash_assert!(
            self.optional_shared_count == 0,
            "Adding required shared component {} after an optional one",
            component.0
        );
        self.shared_components.push((component, access));
        self
    }

    pub fn add_optional_component(
        &mut self,
        component: Component,
        access: ComponentAccess,
    ) -> &mut Self {
        self.components.push((component, access));
        self.optional_count += 1;
        self
    }

    pub fn add_optional_shared_component(
        &mut self,
        component: Component,
        access: ComponentAccess,
    ) -> &mut Self {
        self.shared_components.push((component, access));
        self.optional_shared_count += 1;
        self
    }

    pub fn add_component_exclude(&mut self, component: Component) -> &mut Self {
        self.exclude_components.push(component);
        self
    }

    pub fn add_shared_component_exclude(&mut self, component: Component) -> &mut Self {
        self.exclude_shared_components.push(component);
        self
    }

    pub fn components(&self) -> &[(Component, ComponentAccess)] {
        &self.components
    }

    pub fn shared_components(&self) -> &[(Component, ComponentAccess)] {
        &self.shared_components
    }

    pub fn optional_count(&self) -> usize {
        self.optional_count as usize
    }

    pub fn optional_shared_count(&self) -> usize {
        self.optional_shared_count as usize
    }

    fn required_components(&self) -> &[(Component, ComponentAccess)] {
        &self.components[..self.components.len() - self.optional_count as usize]
    }

    fn required_shared_components(&self) -> &[(Component, ComponentAccess)] {
        &self.shared_components[..self.shared_components.len() - self.optional_shared_count as usize]
    }

    /// Two queries that can be statically proven to match disjoint archetype
    /// sets: one excludes a component the other requires.
    fn provably_disjoint(&self, other: &TaskComponentQuery) -> bool {
        let excludes_required = |excludes: &[Component], required: &[(Component, ComponentAccess)]| {
            excludes
                .iter()
                .any(|excluded| required.iter().any(|(component, _)| component == excluded))
        };
        excludes_required(&self.exclude_components, other.required_components())
            || excludes_required(&other.exclude_components, self.required_components())
            || excludes_required(
                &self.exclude_shared_components,
                other.required_shared_components(),
            )
            || excludes_required(
                &other.exclude_shared_components,
                self.required_shared_components(),
            )
    }

    /// The authoritative conflict predicate: a common component (unique or
    /// shared) mentioned with incompatible access, unless the two queries
    /// are provably disjoint.
    pub fn conflicts_with(&self, other: &TaskComponentQuery) -> bool {
        if self.provably_disjoint(other) {
            return false;
        }
        let lists_conflict = |mine: &[(Component, ComponentAccess)],
                              theirs: &[(Component, ComponentAccess)]| {
            mine.iter().any(|(component, access)| {
                theirs
                    .iter()
                    .any(|(their_component, their_access)| {
                        component == their_component && access.conflicts_with(*their_access)
                    })
            })
        };
        lists_conflict(&self.components, &other.components)
            || lists_conflict(&self.shared_components, &other.shared_components)
    }

    /// Archetype filter for iterating matching bases at run time. Optional
    /// entries do not constrain matching.
    pub fn to_archetype_query(&self) -> ArchetypeQuery {
        use crate::component::ComponentSignature;
        let required: Vec<Component> = self
            .required_components()
            .iter()
            .map(|(component, _)| *component)
            .collect();
        let required_shared: Vec<Component> = self
            .required_shared_components()
            .iter()
            .map(|(component, _)| *component)
            .collect();
        ArchetypeQuery::new()
            .with_unique(ComponentSignature::from_components(&required))
            .with_shared(ComponentSignature::from_components(&required_shared))
            .without_unique(ComponentSignature::from_components(&self.exclude_components))
            .without_shared(ComponentSignature::from_components(
                &self.exclude_shared_components,
            ))
    }
}

/// Function invoked once per scheduled task with the world and the worker's
/// scratch arena.
pub type TaskFunction = Arc<dyn Fn(&mut World, &ScratchArena) -> Result<()> + Send + Sync>;

/// One schedulable task
#[derive(Clone)]
pub struct TaskElement {
    pub name: String,
    pub function: TaskFunction,
    pub query: TaskComponentQuery,
    /// Names of tasks that must complete before this one
    pub dependencies: Vec<String>,
    pub group: TaskGroup,
    /// Advisory batch size for an inner parallel-for over archetype bases
    pub batch_size: u32,
    /// Structural editor: must run alone in its wave
    pub barrier_task: bool,
}

impl TaskElement {
    pub fn new(
        name: impl Into<String>,
        group: TaskGroup,
        function: TaskFunction,
    ) -> Self {
        Self {
            name: name.into(),
            function,
            query: TaskComponentQuery::new(),
            dependencies: Vec::new(),
            group,
            batch_size: 0,
            barrier_task: false,
        }
    }

    pub fn with_query(mut self, query: TaskComponentQuery) -> Self {
        self.query = query;
        self
    }

    pub fn after(mut self, dependency: impl Into<String>) -> Self {
        self.dependencies.push(dependency.into());
        self
    }

    pub fn with_batch_size(mut self, batch_size: u32) -> Self {
        self.batch_size = batch_size;
        self
    }

    pub fn as_barrier(mut self) -> Self {
        self.barrier_task = true;
        self
    }
}

impl fmt::Debug for TaskElement {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("TaskElement")
            .field("name", &self.name)
            .field("group", &self.group)
            .field("dependencies", &self.dependencies)
            .field("barrier_task", &self.barrier_task)
            .finish()
    }
}

/// No-op task function, useful for declaring ordering-only tasks.
pub fn noop_task() -> TaskFunction {
    Arc::new(|_world, _scratch| Ok(()))
}

#[cfg(test)]
mod tests {
    use super::*;

    fn query_writing(component: Component) -> TaskComponentQuery {
        let mut query = TaskComponentQuery::new();
        query.add_component(component, ComponentAccess::Write);
        query
    }

    fn query_reading(component: Component) -> TaskComponentQuery {
        let mut query = TaskComponentQuery::new();
        query.add_component(component, ComponentAccess::Read);
        query
    }

    #[test]
    fn test_read_read_does_not_conflict() {
        assert!(!query_reading(Component(1)).conflicts_with(&query_reading(Component(1))));
    }

    #[test]
    fn test_write_conflicts_with_read_and_write() {
        assert!(query_writing(Component(1)).conflicts_with(&query_reading(Component(1))));
        assert!(query_reading(Component(1)).conflicts_with(&query_writing(Component(1))));
        assert!(query_writing(Component(1)).conflicts_with(&query_writing(Component(1))));
    }

    #[test]
    fn test_different_components_do_not_conflict() {
        assert!(!query_writing(Component(1)).conflicts_with(&query_writing(Component(2))));
    }

    #[test]
    fn test_shared_components_participate_in_conflicts() {
        let mut a = TaskComponentQuery::new();
        a.add_shared_component(Component(5), ComponentAccess::Write);
        let mut b = TaskComponentQuery::new();
        b.add_shared_component(Component(5), ComponentAccess::Read);
        assert!(a.conflicts_with(&b));
    }

    #[test]
    fn test_exclusion_proves_disjoint() {
        let mut a = query_writing(Component(1));
        a.add_component_exclude(Component(2));
        let mut b = query_writing(Component(1));
        b.add_component(Component(2), ComponentAccess::Read);
        // b requires a component a excludes: the archetype sets are disjoint
        assert!(!a.conflicts_with(&b));
    }

    #[test]
    fn test_optional_components_do_not_prove_disjoint() {
        let mut a = query_writing(Component(1));
        a.add_component_exclude(Component(2));
        let mut b = query_writing(Component(1));
        b.add_optional_component(Component(2), ComponentAccess::Read);
        // Optional presence cannot prove disjointness
        assert!(a.conflicts_with(&b));
    }

    #[test]
    #[should_panic]
    fn test_required_after_optional_is_rejected() {
        let mut query = TaskComponentQuery::new();
        query.add_optional_component(Component(1), ComponentAccess::Read);
        query.add_component(Component(2), ComponentAccess::Read);
    }

    #[test]
    fn test_group_ordering_and_strings() {
        assert!(TaskGroup::InitializeEarly < TaskGroup::SimulateMid);
        assert_eq!(TaskGroup::SimulateMid.as_str(), "Simulate Mid");
        assert_eq!(TaskGroup::ALL[TaskGroup::FinalizeLate.index()], TaskGroup::FinalizeLate);
    }
}
