//! A tick-based task queue.
//!
//! [`TaskQueue`] is a cloneable handle: any thread may schedule or cancel
//! work, while the tick driver runs due tasks at the two fixed points of
//! each tick. Tasks run with the queue unlocked, so a task may schedule
//! further tasks (they become due on a later tick at the earliest).

use std::collections::HashSet;
use std::sync::{Arc, Mutex};

use tessel_core::{FatalError, LifecycleError, SimulationFault, TaskId, TickId};

use crate::collab::TaskScheduler;
use crate::handle::lock_recover;
use crate::partition::guarded;

/// Which of the two per-tick task points a task runs at.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub enum TaskPhase {
    /// Before network ingestion (step 1).
    Tick,
    /// After the simulation barrier (step 4).
    EndOfTick,
}

/// What a task wants after running.
#[derive(Clone, Debug, PartialEq, Eq)]
pub enum TaskOutcome {
    /// Finished; drop it.
    Done,
    /// Run again this many ticks later (minimum 1).
    Repeat(u64),
    /// Failed this time; reported, then dropped. A task that panics is
    /// treated the same way.
    Failed(String),
    /// The scheduler cannot continue; stops the process.
    Fatal(String),
}

/// A unit of scheduled work.
pub trait Task: Send {
    /// Run at `tick`.
    fn run(&mut self, tick: TickId) -> TaskOutcome;
}

impl<F> Task for F
where
    F: FnMut(TickId) -> TaskOutcome + Send,
{
    fn run(&mut self, tick: TickId) -> TaskOutcome {
        self(tick)
    }
}

struct Entry {
    id: TaskId,
    due: TickId,
    phase: TaskPhase,
    task: Box<dyn Task>,
}

#[derive(Default)]
struct QueueState {
    next_id: u64,
    last_tick: TickId,
    entries: Vec<Entry>,
    cancelled: HashSet<TaskId>,
    shut_down: bool,
}

/// Shared, thread-safe task queue. Clones refer to the same queue.
#[derive(Clone, Default)]
pub struct TaskQueue {
    state: Arc<Mutex<QueueState>>,
}

impl std::fmt::Debug for TaskQueue {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let state = lock_recover(&self.state);
        f.debug_struct("TaskQueue")
            .field("pending", &state.entries.len())
            .field("last_tick", &state.last_tick)
            .field("shut_down", &state.shut_down)
            .finish()
    }
}

impl TaskQueue {
    /// An empty queue.
    pub fn new() -> Self {
        Self::default()
    }

    /// Run `task` at `phase`, `delay` ticks after the last tick processed.
    ///
    /// A delay of 0 behaves like 1: the task runs on the next tick.
    pub fn schedule(
        &self,
        delay: u64,
        phase: TaskPhase,
        task: impl Task + 'static,
    ) -> Result<TaskId, LifecycleError> {
        let mut state = lock_recover(&self.state);
        if state.shut_down {
            return Err(LifecycleError::Stopped);
        }
        state.next_id += 1;
        let id = TaskId(state.next_id);
        let due = TickId(state.last_tick.0 + delay.max(1));
        state.entries.push(Entry {
            id,
            due,
            phase,
            task: Box::new(task),
        });
        Ok(id)
    }

    /// Cancel a task. Returns whether it was still pending.
    ///
    /// A repeating task cancelled while running is not rescheduled.
    pub fn cancel(&self, id: TaskId) -> bool {
        let mut state = lock_recover(&self.state);
        let before = state.entries.len();
        state.entries.retain(|e| e.id != id);
        if state.entries.len() < before {
            return true;
        }
        state.cancelled.insert(id);
        false
    }

    /// Tasks waiting to run.
    pub fn pending(&self) -> usize {
        lock_recover(&self.state).entries.len()
    }

    /// Whether [`shutdown`](TaskScheduler::shutdown) has been called.
    pub fn is_shut_down(&self) -> bool {
        lock_recover(&self.state).shut_down
    }

    fn run_phase(
        &self,
        tick: TickId,
        phase: TaskPhase,
    ) -> Result<Vec<SimulationFault>, FatalError> {
        let mut due = {
            let mut state = lock_recover(&self.state);
            if state.shut_down {
                return Ok(Vec::new());
            }
            state.last_tick = state.last_tick.max(tick);
            state.cancelled.clear();
            let (due, rest): (Vec<_>, Vec<_>) = std::mem::take(&mut state.entries)
                .into_iter()
                .partition(|e| e.phase == phase && e.due <= tick);
            state.entries = rest;
            due
        };
        due.sort_by_key(|e| (e.due, e.id));

        let mut faults = Vec::new();
        let mut requeue = Vec::new();
        let mut fatal = None;
        for mut entry in due {
            if fatal.is_some() {
                requeue.push(entry);
                continue;
            }
            let outcome = match guarded(|| entry.task.run(tick)) {
                Ok(outcome) => outcome,
                Err(SimulationFault::Panicked { message }) => {
                    faults.push(SimulationFault::Panicked {
                        message: format!("{}: {message}", entry.id),
                    });
                    continue;
                }
                Err(other) => {
                    faults.push(other);
                    continue;
                }
            };
            match outcome {
                TaskOutcome::Done => {}
                TaskOutcome::Repeat(every) => {
                    entry.due = TickId(tick.0 + every.max(1));
                    requeue.push(entry);
                }
                TaskOutcome::Failed(reason) => {
                    faults.push(SimulationFault::Task {
                        reason: format!("{}: {reason}", entry.id),
                    });
                }
                TaskOutcome::Fatal(reason) => {
                    fatal = Some(FatalError::Scheduler {
                        reason: format!("{}: {reason}", entry.id),
                    });
                }
            }
        }

        let mut state = lock_recover(&self.state);
        let cancelled = std::mem::take(&mut state.cancelled);
        state
            .entries
            .extend(requeue.into_iter().filter(|e| !cancelled.contains(&e.id)));
        match fatal {
            Some(e) => Err(e),
            None => Ok(faults),
        }
    }
}

impl TaskScheduler for TaskQueue {
    fn run_due_tasks(&mut self, tick: TickId) -> Result<Vec<SimulationFault>, FatalError> {
        self.run_phase(tick, TaskPhase::Tick)
    }

    fn run_end_of_tick_tasks(
        &mut self,
        tick: TickId,
    ) -> Result<Vec<SimulationFault>, FatalError> {
        self.run_phase(tick, TaskPhase::EndOfTick)
    }

    fn shutdown(&mut self) {
        let mut state = lock_recover(&self.state);
        state.shut_down = true;
        state.entries.clear();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicU64, Ordering};

    fn counter() -> (Arc<AtomicU64>, impl Task + 'static) {
        let hits = Arc::new(AtomicU64::new(0));
        let h = Arc::clone(&hits);
        (hits, move |_tick: TickId| {
            h.fetch_add(1, Ordering::Relaxed);
            TaskOutcome::Done
        })
    }

    #[test]
    fn tasks_run_at_their_phase_and_tick() {
        let mut q = TaskQueue::new();
        let (early, task) = counter();
        q.schedule(1, TaskPhase::Tick, task).unwrap();
        let (late, task) = counter();
        q.schedule(2, TaskPhase::EndOfTick, task).unwrap();

        q.run_due_tasks(TickId(1)).unwrap();
        assert_eq!(early.load(Ordering::Relaxed), 1);
        q.run_end_of_tick_tasks(TickId(1)).unwrap();
        assert_eq!(late.load(Ordering::Relaxed), 0);
        q.run_end_of_tick_tasks(TickId(2)).unwrap();
        assert_eq!(late.load(Ordering::Relaxed), 1);
        assert_eq!(q.pending(), 0);
    }

    #[test]
    fn repeating_task_reschedules_until_cancelled() {
        let mut q = TaskQueue::new();
        let hits = Arc::new(AtomicU64::new(0));
        let h = Arc::clone(&hits);
        let id = q
            .schedule(1, TaskPhase::Tick, move |_t: TickId| {
                h.fetch_add(1, Ordering::Relaxed);
                TaskOutcome::Repeat(2)
            })
            .unwrap();
        for t in 1..=5 {
            q.run_due_tasks(TickId(t)).unwrap();
        }
        // Ticks 1, 3, 5.
        assert_eq!(hits.load(Ordering::Relaxed), 3);
        assert!(q.cancel(id));
        q.run_due_tasks(TickId(7)).unwrap();
        assert_eq!(hits.load(Ordering::Relaxed), 3);
        assert!(!q.cancel(id));
    }

    #[test]
    fn failures_are_faults_and_fatal_is_error() {
        let mut q = TaskQueue::new();
        q.schedule(1, TaskPhase::Tick, |_t: TickId| {
            TaskOutcome::Failed("nope".into())
        })
        .unwrap();
        let faults = q.run_due_tasks(TickId(1)).unwrap();
        assert!(matches!(faults[..], [SimulationFault::Task { .. }]));

        q.schedule(1, TaskPhase::Tick, |_t: TickId| TaskOutcome::Fatal("disk".into()))
            .unwrap();
        let err = q.run_due_tasks(TickId(2)).unwrap_err();
        assert!(matches!(err, FatalError::Scheduler { .. }));
    }

    #[test]
    fn panicking_task_is_a_fault_and_the_rest_still_run() {
        let mut q = TaskQueue::new();
        q.schedule(1, TaskPhase::Tick, |_t: TickId| -> TaskOutcome {
            panic!("corrupt save")
        })
        .unwrap();
        let (hits, task) = counter();
        q.schedule(1, TaskPhase::Tick, task).unwrap();
        let hits_later = Arc::clone(&hits);
        q.schedule(1, TaskPhase::Tick, move |_t: TickId| {
            hits_later.fetch_add(1, Ordering::Relaxed);
            TaskOutcome::Repeat(1)
        })
        .unwrap();

        let faults = q.run_due_tasks(TickId(1)).unwrap();
        match &faults[..] {
            [SimulationFault::Panicked { message }] => assert!(message.contains("corrupt save")),
            other => panic!("unexpected faults {other:?}"),
        }
        assert_eq!(hits.load(Ordering::Relaxed), 2);
        // The panicking task is dropped; the repeating one is kept.
        assert_eq!(q.pending(), 1);
        assert!(q.run_due_tasks(TickId(2)).unwrap().is_empty());
        assert_eq!(hits.load(Ordering::Relaxed), 3);
    }

    #[test]
    fn task_can_schedule_from_inside_a_run() {
        let mut q = TaskQueue::new();
        let inner = q.clone();
        let (hits, follow_up) = counter();
        let mut follow_up = Some(follow_up);
        q.schedule(1, TaskPhase::Tick, move |_t: TickId| {
            if let Some(task) = follow_up.take() {
                inner.schedule(1, TaskPhase::Tick, task).unwrap();
            }
            TaskOutcome::Done
        })
        .unwrap();
        q.run_due_tasks(TickId(1)).unwrap();
        assert_eq!(hits.load(Ordering::Relaxed), 0);
        q.run_due_tasks(TickId(2)).unwrap();
        assert_eq!(hits.load(Ordering::Relaxed), 1);
    }

    #[test]
    fn shutdown_rejects_new_work() {
        let mut q = TaskQueue::new();
        let (_hits, task) = counter();
        q.schedule(5, TaskPhase::Tick, task).unwrap();
        q.shutdown();
        assert_eq!(q.pending(), 0);
        assert!(q.is_shut_down());
        let (_hits, task) = counter();
        assert_eq!(
            q.schedule(1, TaskPhase::Tick, task),
            Err(LifecycleError::Stopped)
        );
    }
}
