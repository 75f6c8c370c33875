//! Scheduler integration: conflict ordering, symmetry, cycle reporting

use forge_ecs::component::Component;
use forge_ecs::error::EcsError;
use forge_ecs::scheduler::TaskScheduler;
use forge_ecs::task::{noop_task, ComponentAccess, TaskComponentQuery, TaskElement, TaskGroup};

const TRANSFORM: Component = Component(0);
const PHYSICS: Component = Component(1);

fn system(name: &str, writes: &[Component], reads: &[Component]) -> TaskElement {
    let mut query = TaskComponentQuery::new();
    for &component in writes {
        query.add_component(component, ComponentAccess::Write);
    }
    for &component in reads {
        query.add_component(component, ComponentAccess::Read);
    }
    TaskElement::new(name, TaskGroup::SimulateMid, noop_task()).with_query(query)
}

fn wave_names<'a>(scheduler: &'a TaskScheduler) -> Vec<Vec<&'a str>> {
    let plan = scheduler.solve().unwrap();
    plan.waves
        .iter()
        .map(|wave| {
            wave.tasks
                .iter()
                .map(|&task| scheduler.elements()[task].name.as_str())
                .collect()
        })
        .collect()
}

#[test]
fn writer_then_reader_makes_two_waves() {
    let mut scheduler = TaskScheduler::new();
    scheduler.add_task(system("SystemA", &[TRANSFORM], &[]));
    scheduler.add_task(system("SystemB", &[], &[TRANSFORM]));
    assert_eq!(wave_names(&scheduler), vec![vec!["SystemA"], vec!["SystemB"]]);
}

#[test]
fn reversed_registration_produces_the_symmetric_plan() {
    let mut scheduler = TaskScheduler::new();
    scheduler.add_task(system("SystemB", &[], &[TRANSFORM]));
    scheduler.add_task(system("SystemA", &[TRANSFORM], &[]));
    assert_eq!(wave_names(&scheduler), vec![vec!["SystemB"], vec!["SystemA"]]);
}

#[test]
fn cycle_is_a_scheduling_conflict_with_no_plan() {
    let mut scheduler = TaskScheduler::new();
    scheduler.add_task(
        TaskElement::new("SystemA", TaskGroup::SimulateMid, noop_task()).after("SystemB"),
    );
    scheduler.add_task(
        TaskElement::new("SystemB", TaskGroup::SimulateMid, noop_task()).after("SystemA"),
    );

    let error = scheduler.solve().unwrap_err();
    assert!(matches!(error, EcsError::SchedulingConflict(_)));
    let message = error.to_string();
    assert!(message.contains("SystemA"));
    assert!(message.contains("SystemB"));
}

#[test]
fn no_conflicting_pair_is_ever_co_waved() {
    // A denser mix across two components and explicit dependencies
    let mut scheduler = TaskScheduler::new();
    scheduler.add_task(system("Integrate", &[PHYSICS], &[]));
    scheduler.add_task(system("ApplyTransforms", &[TRANSFORM], &[PHYSICS]));
    scheduler.add_task(system("RenderPrep", &[], &[TRANSFORM]));
    scheduler.add_task(system("Audio", &[], &[PHYSICS]));
    scheduler.add_task(system("Cull", &[], &[TRANSFORM]));
    scheduler.add_task(
        system("Stats", &[], &[]).after("RenderPrep"),
    );

    let plan = scheduler.solve().unwrap();
    for wave in &plan.waves {
        for (position, &first) in wave.tasks.iter().enumerate() {
            for &second in &wave.tasks[position + 1..] {
                let a = &scheduler.elements()[first].query;
                let b = &scheduler.elements()[second].query;
                assert!(
                    !a.conflicts_with(b),
                    "tasks {} and {} share a wave but conflict",
                    scheduler.elements()[first].name,
                    scheduler.elements()[second].name
                );
            }
        }
    }
    // Every task was placed exactly once
    assert_eq!(plan.task_count(), scheduler.len());
}

#[test]
fn groups_run_in_phase_order_regardless_of_registration() {
    let mut scheduler = TaskScheduler::new();
    scheduler.add_task(
        TaskElement::new("TearDown", TaskGroup::FinalizeLate, noop_task()),
    );
    scheduler.add_task(
        TaskElement::new("Sim", TaskGroup::SimulateMid, noop_task()),
    );
    scheduler.add_task(
        TaskElement::new("Boot", TaskGroup::InitializeEarly, noop_task()),
    );

    let plan = scheduler.solve().unwrap();
    let groups: Vec<TaskGroup> = plan.waves.iter().map(|wave| wave.group).collect();
    assert_eq!(
        groups,
        vec![
            TaskGroup::InitializeEarly,
            TaskGroup::SimulateMid,
            TaskGroup::FinalizeLate
        ]
    );
}

#[test]
fn plan_description_names_every_system() {
    let mut scheduler = TaskScheduler::new();
    scheduler.add_task(system("SystemA", &[TRANSFORM], &[]));
    scheduler.add_task(system("SystemB", &[], &[TRANSFORM]));

    let plan = scheduler.solve().unwrap();
    let description = plan.describe(scheduler.elements());
    assert!(description.contains("SystemA"));
    assert!(description.contains("SystemB"));
    assert!(description.contains("Simulate Mid"));
}
