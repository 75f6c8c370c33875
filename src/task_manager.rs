//! Fixed worker pool executing scheduled waves
//!
//! Workers pull `(fn, arg)` jobs from a channel. A wave is dispatched as one
//! job per task; the caller blocks until the in-flight count drains, which
//! also covers dynamic tasks submitted from inside the wave. Each worker
//! owns a scratch arena that is reset at wave boundaries.

use std::collections::HashMap;
use std::sync::Arc;
use std::thread::JoinHandle;
use std::time::{Duration, Instant};

use crossbeam::channel::{unbounded, Receiver, Sender};
use parking_lot::{Condvar, Mutex};
use tracing::{error, trace};

use crate::arena::ScratchArena;
use crate::error::EcsError;
use crate::task::TaskElement;
use crate::world::World;

/// Aggregated timings of one task across frames
#[derive(Debug, Clone)]
pub struct TaskStats {
    pub min: Duration,
    pub max: Duration,
    pub avg: Duration,
    pub call_count: u64,
}

/// Per-task execution timing collector
#[derive(Default)]
pub struct TaskProfiler {
    entries: HashMap<String, (Duration, Duration, Duration, u64)>,
}

impl TaskProfiler {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn record(&mut self, name: &str, duration: Duration) {
        let entry = self
            .entries
            .entry(name.to_string())
            .or_insert((Duration::MAX, Duration::ZERO, Duration::ZERO, 0));
        entry.0 = entry.0.min(duration);
        entry.1 = entry.1.max(duration);
        entry.2 += duration;
        entry.3 += 1;
    }

    pub fn stats(&self, name: &str) -> Option<TaskStats> {
        let &(min, max, total, count) = self.entries.get(name)?;
        if count == 0 {
            return None;
        }
        Some(TaskStats {
            min,
            max,
            avg: total / count as u32,
            call_count: count,
        })
    }

    pub fn clear(&mut self) {
        self.entries.clear();
    }
}

type JobFn = Box<dyn FnOnce(&ScratchArena) + Send>;

enum Job {
    Run(JobFn),
    /// Reset the worker's scratch arena, then rendezvous so no worker can
    /// consume two drains of the same boundary.
    Drain(Arc<std::sync::Barrier>),
    Exit,
}

struct InFlight {
    count: Mutex<usize>,
    drained: Condvar,
}

/// World pointer smuggled into worker closures. Sound because the scheduler
/// guarantees co-waved tasks declare non-conflicting component access, and
/// the caller of `run_wave` keeps the world alive until the wave drains.
#[derive(Clone, Copy)]
struct WorldPtr(usize);
unsafe impl Send for WorldPtr {}

/// Fixed-size thread pool. Never spawns threads after construction.
pub struct TaskManager {
    sender: Sender<Job>,
    handles: Vec<JoinHandle<()>>,
    in_flight: Arc<InFlight>,
    errors: Arc<Mutex<Vec<(String, EcsError)>>>,
    profiler: Arc<Mutex<TaskProfiler>>,
    thread_count: usize,
}

impl TaskManager {
    pub fn new(thread_count: usize) -> Self {
        let thread_count = thread_count.max(1);
        let (sender, receiver): (Sender<Job>, Receiver<Job>) = unbounded();
        let in_flight = Arc::new(InFlight {
            count: Mutex::new(0),
            drained: Condvar::new(),
        });

        let mut handles = Vec::with_capacity(thread_count);
        for worker in 0..thread_count {
            let receiver = receiver.clone();
            let in_flight = Arc::clone(&in_flight);
            let handle = std::thread::Builder::new()
                .name(format!("ecs-worker-{worker}"))
                .spawn(move || worker_loop(receiver, in_flight))
                .expect("failed to spawn worker thread");
            handles.push(handle);
        }

        Self {
            sender,
            handles,
            in_flight,
            errors: Arc::new(Mutex::new(Vec::new())),
            profiler: Arc::new(Mutex::new(TaskProfiler::new())),
            thread_count,
        }
    }

    pub fn thread_count(&self) -> usize {
        self.thread_count
    }

    /// Submit a dynamic task. When called from inside a running task it
    /// joins the current wave: the wave does not complete until this unit
    /// does.
    pub fn add_task(&self, job: impl FnOnce(&ScratchArena) + Send + 'static) {
        *self.in_flight.count.lock() += 1;
        let _ = self.sender.send(Job::Run(Box::new(job)));
    }

    /// Run one wave of scheduled tasks against the world and block until
    /// every unit (including dynamic ones) has completed.
    ///
    /// # Safety
    /// `world` must stay valid and otherwise untouched until this returns.
    /// The tasks must be mutually conflict-free; the solved plan guarantees
    /// this for waves it produced.
    pub unsafe fn run_wave(
        &self,
        world: *mut World,
        tasks: &[TaskElement],
    ) -> Vec<(String, EcsError)> {
        let world_ptr = WorldPtr(world as usize);
        for element in tasks {
            let function = Arc::clone(&element.function);
            let name = element.name.clone();
            let errors = Arc::clone(&self.errors);
            let profiler = Arc::clone(&self.profiler);
            self.add_task(move |scratch| {
                // Reconstructing &mut World is sound per the wave contract:
                // no co-waved task touches the same components with a write.
                let world = unsafe { &mut *(world_ptr.0 as *mut World) };
                let started = Instant::now();
                if let Err(err) = (function)(world, scratch) {
                    error!(task = name.as_str(), error = %err, "task failed");
                    errors.lock().push((name.clone(), err));
                }
                profiler.lock().record(&name, started.elapsed());
                trace!(task = name.as_str(), "task complete");
            });
        }
        self.wait_all();
        self.reset_scratch_arenas();
        std::mem::take(&mut *self.errors.lock())
    }

    /// Block until the in-flight count reaches zero.
    pub fn wait_all(&self) {
        let mut count = self.in_flight.count.lock();
        while *count > 0 {
            self.in_flight.drained.wait(&mut count);
        }
    }

    /// Ask every worker to reset its scratch arena. Queued behind the
    /// current jobs, so wave allocations stay valid until the wave ends.
    fn reset_scratch_arenas(&self) {
        let barrier = Arc::new(std::sync::Barrier::new(self.thread_count));
        for _ in 0..self.thread_count {
            let _ = self.sender.send(Job::Drain(Arc::clone(&barrier)));
        }
    }

    pub fn profiler_stats(&self, name: &str) -> Option<TaskStats> {
        self.profiler.lock().stats(name)
    }

    pub fn clear_profiler(&self) {
        self.profiler.lock().clear();
    }

    /// Drain in-flight work and join every worker.
    pub fn terminate_threads(&mut self) {
        self.wait_all();
        for _ in 0..self.handles.len() {
            let _ = self.sender.send(Job::Exit);
        }
        for handle in self.handles.drain(..) {
            let _ = handle.join();
        }
    }
}

impl Drop for TaskManager {
    fn drop(&mut self) {
        self.terminate_threads();
    }
}

fn worker_loop(receiver: Receiver<Job>, in_flight: Arc<InFlight>) {
    let mut scratch = ScratchArena::new();
    while let Ok(job) = receiver.recv() {
        match job {
            Job::Run(run) => {
                run(&scratch);
                let mut count = in_flight.count.lock();
                *count -= 1;
                if *count == 0 {
                    in_flight.drained.notify_all();
                }
            }
            Job::Drain(barrier) => {
                scratch.reset();
                barrier.wait();
            }
            Job::Exit => break,
        }
    }
}
