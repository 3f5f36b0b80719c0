//! Cooperative round-robin task scheduler (§3, §4.9). Task 0 is the main
//! program; ticks visit tasks in ascending id order.

use crate::frame::StackFrame;
use crate::value::Value;
use arcstr::ArcStr;
use fxhash::FxHashMap;
use indexmap::IndexMap;
use jdb_compiler::Chunk;
use std::collections::VecDeque;
use triomphe::Arc;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TaskStatus {
    Running,
    PausedOnAwait,
    Completed,
    Errored,
}

pub struct PerTaskExceptionState {
    pub handler_stack: Vec<crate::vm::ExceptionHandler>,
}

impl PerTaskExceptionState {
    pub fn new() -> Self {
        Self { handler_stack: Vec::new() }
    }
}

impl Default for PerTaskExceptionState {
    fn default() -> Self {
        Self::new()
    }
}

pub struct Task {
    pub id: u64,
    pub status: TaskStatus,
    pub result: Value,
    pub awaiting: Option<u64>,
    /// Set while paused on `AWAIT` of a `BSYNC` thread-handle rather than
    /// a task-ref (§9 open question: both await forms share one pause
    /// mechanism in this engine).
    pub awaiting_thread: Option<u64>,
    pub pc: u16,
    pub bytecode: Arc<Chunk>,
    pub call_stack: Vec<StackFrame>,
    pub for_stack: Vec<crate::vm::ForRecord>,
    pub value_stack: Vec<Value>,
    pub current_line: u32,
    pub yielded_this_tick: bool,
    pub exceptions: PerTaskExceptionState,
    pub events: VecDeque<(ArcStr, Value)>,
    pub event_handlers: FxHashMap<ArcStr, ArcStr>,
}

impl Task {
    pub fn new(id: u64, bytecode: Arc<Chunk>, pc: u16) -> Self {
        Self {
            id,
            status: TaskStatus::Running,
            result: Value::Bool(false),
            awaiting: None,
            awaiting_thread: None,
            pc,
            bytecode,
            call_stack: Vec::new(),
            for_stack: Vec::new(),
            value_stack: Vec::new(),
            current_line: 0,
            yielded_this_tick: false,
            exceptions: PerTaskExceptionState::new(),
            events: VecDeque::new(),
            event_handlers: FxHashMap::default(),
        }
    }
}

/// Owns the task table in id order (`IndexMap` preserves insertion
/// order, and ids are assigned monotonically so iteration order already
/// matches id order).
pub struct Scheduler {
    pub tasks: IndexMap<u64, Task>,
}

impl Scheduler {
    pub fn new(main_bytecode: Arc<Chunk>) -> Self {
        let mut tasks = IndexMap::new();
        tasks.insert(0, Task::new(0, main_bytecode, 0));
        Self { tasks }
    }

    /// `START_TASK`: create a new task whose pc/call-stack starts at a
    /// function's entry; returns its task-ref.
    pub fn start_task(&mut self, bytecode: Arc<Chunk>, entry_pc: u16) -> u64 {
        let id = crate::value::next_task_id();
        self.tasks.insert(id, Task::new(id, bytecode, entry_pc));
        id
    }

    /// `AWAIT task-ref`: pause the caller until the target completes.
    pub fn await_task(&mut self, caller_id: u64, target: u64) {
        if let Some(task) = self.tasks.get_mut(&caller_id) {
            task.status = TaskStatus::PausedOnAwait;
            task.awaiting = Some(target);
        }
    }

    /// Promote any task paused on an `AWAIT` whose target has completed,
    /// copying the target's result as the `AWAIT` expression's value via
    /// `take_completed_result`.
    pub fn promote_ready_awaiters(&mut self) {
        let ready: Vec<(u64, u64, Value)> = self
            .tasks
            .values()
            .filter_map(|t| match (t.status, t.awaiting) {
                (TaskStatus::PausedOnAwait, Some(target)) => {
                    let target_task = self.tasks.get(&target)?;
                    if target_task.status == TaskStatus::Completed {
                        Some((t.id, target, target_task.result.clone()))
                    } else {
                        None
                    }
                }
                _ => None,
            })
            .collect();
        for (caller, _target, result) in ready {
            if let Some(task) = self.tasks.get_mut(&caller) {
                task.status = TaskStatus::Running;
                task.awaiting = None;
                task.result = result;
            }
        }
    }

    /// Remove tasks that reached a terminal state, except task 0 (the
    /// main loop exits when task 0 completes or errors, per §4.9).
    pub fn reap_finished(&mut self) {
        self.tasks.retain(|&id, t| id == 0 || !matches!(t.status, TaskStatus::Completed | TaskStatus::Errored));
    }

    pub fn main_finished(&self) -> bool {
        matches!(self.tasks.get(&0).map(|t| t.status), Some(TaskStatus::Completed) | Some(TaskStatus::Errored))
    }

    /// `RAISE EVENT name, data`: append to the task-local queue.
    pub fn raise_event(&mut self, task_id: u64, name: ArcStr, data: Value) {
        if let Some(task) = self.tasks.get_mut(&task_id) {
            task.events.push_back((name, data));
        }
    }

    /// Drain one task's event queue, in order, for between-tick dispatch.
    pub fn drain_events(&mut self, task_id: u64) -> Vec<(ArcStr, Value)> {
        match self.tasks.get_mut(&task_id) {
            Some(task) => task.events.drain(..).collect(),
            None => Vec::new(),
        }
    }

    /// Task ids in ascending order, snapshotted so a tick can mutate
    /// `self.tasks` (inserting new tasks via `START_TASK`) while
    /// iterating without invalidating the in-progress traversal.
    pub fn task_ids_this_tick(&self) -> Vec<u64> {
        self.tasks.keys().copied().collect()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn awaiter_promotes_once_target_completes() {
        let mut sched = Scheduler::new(Arc::new(Chunk::new()));
        let child = sched.start_task(Arc::new(Chunk::new()), 0);
        sched.await_task(0, child);
        assert_eq!(sched.tasks[&0].status, TaskStatus::PausedOnAwait);
        sched.promote_ready_awaiters();
        assert_eq!(sched.tasks[&0].status, TaskStatus::PausedOnAwait);
        sched.tasks.get_mut(&child).unwrap().status = TaskStatus::Completed;
        sched.tasks.get_mut(&child).unwrap().result = Value::Integer(42);
        sched.promote_ready_awaiters();
        assert_eq!(sched.tasks[&0].status, TaskStatus::Running);
        assert!(matches!(sched.tasks[&0].result, Value::Integer(42)));
    }

    #[test]
    fn reap_keeps_main_task_zero() {
        let mut sched = Scheduler::new(Arc::new(Chunk::new()));
        sched.tasks.get_mut(&0).unwrap().status = TaskStatus::Completed;
        sched.reap_finished();
        assert!(sched.tasks.contains_key(&0));
    }
}
