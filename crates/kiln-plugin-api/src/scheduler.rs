//! Tick-driven task scheduler, one per plugin.
//!
//! Tasks are closures keyed by id. The runtime advances every scheduler once
//! per tick; due tasks are collected under the lock and run after it is
//! released, so a task may schedule or cancel tasks (itself included).

use crate::module::{ModuleGuard, Pinned};
use crate::plugin::call_guarded;
use kiln_runtime::{RuntimeError, RuntimeResult};
use parking_lot::Mutex;
use std::collections::BTreeMap;
use std::sync::Arc;
use std::time::{Duration, Instant};

type TaskFn = Box<dyn FnMut() -> anyhow::Result<()> + Send>;

struct ScheduledTask {
    generation: u64,
    next_tick: u64,
    /// `None` for one-shot tasks.
    period: Option<u64>,
    run: Arc<Pinned<Mutex<TaskFn>>>,
}

#[derive(Default)]
struct SchedulerState {
    tasks: BTreeMap<String, ScheduledTask>,
    current_tick: u64,
    next_generation: u64,
}

/// Result of one task execution.
#[derive(Debug)]
pub struct TaskRun {
    pub task_id: String,
    pub elapsed: Duration,
    pub result: anyhow::Result<()>,
}

pub struct PluginScheduler {
    plugin_id: String,
    max_tasks: usize,
    state: Mutex<SchedulerState>,
    module: ModuleGuard,
}

impl PluginScheduler {
    pub fn new(plugin_id: impl Into<String>, max_tasks: usize) -> Self {
        Self {
            plugin_id: plugin_id.into(),
            max_tasks,
            state: Mutex::new(SchedulerState::default()),
            module: ModuleGuard::none(),
        }
    }

    pub fn with_module(mut self, module: ModuleGuard) -> Self {
        self.module = module;
        self
    }

    /// Run `task` every `period_ticks` ticks, first after one period.
    pub fn repeating<F>(&self, task_id: &str, period_ticks: u64, task: F) -> RuntimeResult<()>
    where
        F: FnMut() -> anyhow::Result<()> + Send + 'static,
    {
        if period_ticks == 0 {
            return Err(RuntimeError::InvalidRegistration(format!(
                "task '{}' in plugin '{}' needs a period of at least one tick",
                task_id, self.plugin_id
            )));
        }
        self.insert(task_id, period_ticks, Some(period_ticks), Box::new(task))
    }

    /// Run `task` once, `delay_ticks` ticks from now (0 means next tick).
    pub fn once<F>(&self, task_id: &str, delay_ticks: u64, task: F) -> RuntimeResult<()>
    where
        F: FnMut() -> anyhow::Result<()> + Send + 'static,
    {
        self.insert(task_id, delay_ticks.max(1), None, Box::new(task))
    }

    pub fn cancel(&self, task_id: &str) -> bool {
        self.state.lock().tasks.remove(task_id).is_some()
    }

    pub fn clear(&self) {
        self.state.lock().tasks.clear();
    }

    pub fn active_task_ids(&self) -> Vec<String> {
        self.state.lock().tasks.keys().cloned().collect()
    }

    fn insert(&self, task_id: &str, delay: u64, period: Option<u64>, run: TaskFn) -> RuntimeResult<()> {
        if task_id.trim().is_empty() || task_id.len() > 64 {
            return Err(RuntimeError::InvalidRegistration(format!(
                "task id '{}' in plugin '{}' must be 1..=64 characters",
                task_id, self.plugin_id
            )));
        }
        let mut state = self.state.lock();
        if state.tasks.contains_key(task_id) {
            return Err(RuntimeError::DuplicateRegistration(format!(
                "Duplicate task id '{}' in plugin '{}'",
                task_id, self.plugin_id
            )));
        }
        if state.tasks.len() >= self.max_tasks {
            return Err(RuntimeError::InvalidRegistration(format!(
                "plugin '{}' already has {} scheduled tasks",
                self.plugin_id, self.max_tasks
            )));
        }
        state.next_generation += 1;
        let task = ScheduledTask {
            generation: state.next_generation,
            next_tick: state.current_tick + delay,
            period,
            run: Arc::new(Pinned::new(Mutex::new(run), self.module.clone())),
        };
        state.tasks.insert(task_id.to_string(), task);
        Ok(())
    }

    /// Advance to `tick` and run every task that is due.
    pub fn run_due(&self, tick: u64) -> Vec<TaskRun> {
        let due: Vec<(String, u64, Arc<Pinned<Mutex<TaskFn>>>)> = {
            let mut state = self.state.lock();
            state.current_tick = tick;
            let mut due = Vec::new();
            for (id, task) in state.tasks.iter_mut() {
                if task.next_tick > tick {
                    continue;
                }
                if let Some(period) = task.period {
                    task.next_tick = tick + period;
                }
                due.push((id.clone(), task.generation, Arc::clone(&task.run)));
            }
            due
        };

        let mut runs = Vec::with_capacity(due.len());
        for (task_id, generation, run) in due {
            // Cancelled by an earlier task in this batch.
            if !self.is_current(&task_id, generation) {
                continue;
            }
            let started = Instant::now();
            let result = call_guarded(&format!("task '{task_id}'"), || {
                let mut task = run.code().lock();
                (&mut *task)()
            });
            let elapsed = started.elapsed();

            let mut state = self.state.lock();
            let one_shot = state
                .tasks
                .get(&task_id)
                .is_some_and(|t| t.generation == generation && t.period.is_none());
            if one_shot {
                state.tasks.remove(&task_id);
            }
            drop(state);

            runs.push(TaskRun {
                task_id,
                elapsed,
                result,
            });
        }
        runs
    }

    fn is_current(&self, task_id: &str, generation: u64) -> bool {
        self.state
            .lock()
            .tasks
            .get(task_id)
            .is_some_and(|t| t.generation == generation)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicU32, Ordering};

    #[test]
    fn test_repeating_task() {
        let scheduler = PluginScheduler::new("p", 8);
        let count = Arc::new(AtomicU32::new(0));
        let c = Arc::clone(&count);
        scheduler
            .repeating("every-2", 2, move || {
                c.fetch_add(1, Ordering::SeqCst);
                Ok(())
            })
            .unwrap();

        for tick in 1..=6 {
            scheduler.run_due(tick);
        }
        assert_eq!(count.load(Ordering::SeqCst), 3);
        assert_eq!(scheduler.active_task_ids(), vec!["every-2".to_string()]);
    }

    #[test]
    fn test_once_task_is_removed() {
        let scheduler = PluginScheduler::new("p", 8);
        scheduler.once("later", 3, || Ok(())).unwrap();

        assert!(scheduler.run_due(1).is_empty());
        assert!(scheduler.run_due(2).is_empty());
        let runs = scheduler.run_due(3);
        assert_eq!(runs.len(), 1);
        assert!(scheduler.active_task_ids().is_empty());
    }

    #[test]
    fn test_failures_and_panics_are_reported() {
        let scheduler = PluginScheduler::new("p", 8);
        scheduler.repeating("fails", 1, || anyhow::bail!("bad")).unwrap();
        scheduler.repeating("panics", 1, || panic!("worse")).unwrap();

        let runs = scheduler.run_due(1);
        assert_eq!(runs.len(), 2);
        assert!(runs.iter().all(|r| r.result.is_err()));
        // Failing repeating tasks stay scheduled.
        assert_eq!(scheduler.active_task_ids().len(), 2);
    }

    #[test]
    fn test_task_can_cancel_itself() {
        let scheduler = Arc::new(PluginScheduler::new("p", 8));
        let s = Arc::clone(&scheduler);
        scheduler
            .repeating("self-cancel", 1, move || {
                s.cancel("self-cancel");
                Ok(())
            })
            .unwrap();

        assert_eq!(scheduler.run_due(1).len(), 1);
        assert!(scheduler.run_due(2).is_empty());
    }

    #[test]
    fn test_limits_and_duplicates() {
        let scheduler = PluginScheduler::new("p", 1);
        scheduler.once("a", 1, || Ok(())).unwrap();
        assert!(matches!(
            scheduler.once("a", 1, || Ok(())),
            Err(RuntimeError::DuplicateRegistration(_))
        ));
        assert!(matches!(
            scheduler.once("b", 1, || Ok(())),
            Err(RuntimeError::InvalidRegistration(_))
        ));
        assert!(scheduler.repeating("c", 0, || Ok(())).is_err());

        scheduler.clear();
        assert!(scheduler.active_task_ids().is_empty());
    }
}
