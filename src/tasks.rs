//! Deferred background work.
//!
//! Foreground I/O paths never perform long maintenance work directly;
//! they post a task and move on. A single worker thread drains the queue
//! in priority order. Before a new task is inserted it is shown every
//! pending task and may veto its own insertion, which is how duplicate
//! refreshes of the same block are collapsed instead of wearing the
//! block out.

use std::collections::VecDeque;
use std::sync::{Arc, Condvar, Mutex};

use crate::mapper::MapKind;
use crate::media::DriveTag;

/// One unit of deferred work. Payload comparisons drive deduplication.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Task {
    /// Persist the phymap because its dirty listener fired.
    SavePhyMap,
    /// Rewrite a persistent map into a fresh block.
    ConsolidateMap { which: MapKind },
    /// Rewrite one logical block of a drive from its backup.
    RefreshBlock { drive: DriveTag, logical_block: u32 },
    /// Rewrite a whole system drive from its backup.
    RewriteDrive {
        drive: DriveTag,
        switch_on_success: bool,
    },
}

impl Task {
    /// Larger runs first. Drive rewrites outrank single-block work
    /// because a rewrite in flight makes the block refreshes moot.
    pub fn priority(&self) -> u8 {
        match self {
            Task::RewriteDrive { .. } => 30,
            Task::RefreshBlock { .. } => 20,
            Task::ConsolidateMap { .. } => 10,
            Task::SavePhyMap => 0,
        }
    }

    /// Called for each task already in the queue when `self` is being
    /// inserted. Returning true vetoes the insertion.
    pub fn examine_one(&self, existing: &Task) -> bool {
        match (self, existing) {
            (Task::SavePhyMap, Task::SavePhyMap) => true,
            (
                Task::ConsolidateMap { which: a },
                Task::ConsolidateMap { which: b },
            ) => a == b,
            (
                Task::RefreshBlock {
                    drive: a,
                    logical_block: ab,
                },
                Task::RefreshBlock {
                    drive: b,
                    logical_block: bb,
                },
            ) => a == b && ab == bb,
            (
                Task::RewriteDrive { drive: a, .. },
                Task::RewriteDrive { drive: b, .. },
            ) => a == b,
            _ => false,
        }
    }
}

struct QueueState {
    tasks: VecDeque<Task>,
    running: usize,
    shutdown: bool,
}

/// Priority queue feeding the background worker. Clone handles freely;
/// they all share one queue.
#[derive(Clone)]
pub struct DeferredTaskQueue {
    shared: Arc<(Mutex<QueueState>, Condvar)>,
}

impl DeferredTaskQueue {
    pub fn new() -> Self {
        DeferredTaskQueue {
            shared: Arc::new((
                Mutex::new(QueueState {
                    tasks: VecDeque::new(),
                    running: 0,
                    shutdown: false,
                }),
                Condvar::new(),
            )),
        }
    }

    /// Insert a task unless a pending task vetoes it. Returns whether
    /// the task was actually queued.
    pub fn post(&self, task: Task) -> bool {
        let (lock, condvar) = &*self.shared;
        let mut state = lock.lock().unwrap();

        if state.shutdown {
            return false;
        }

        if state.tasks.iter().any(|existing| task.examine_one(existing)) {
            log::debug!("deferred task deduplicated: {:?}", task);
            return false;
        }

        // Keep the queue ordered by priority, FIFO within a priority.
        let position = state
            .tasks
            .iter()
            .position(|t| t.priority() < task.priority())
            .unwrap_or(state.tasks.len());
        state.tasks.insert(position, task);

        condvar.notify_all();
        true
    }

    /// Block until a task is available or shutdown is requested.
    /// Returns `None` only at shutdown. The task counts as running
    /// until `task_finished` is called.
    pub fn wait_for_task(&self) -> Option<Task> {
        let (lock, condvar) = &*self.shared;
        let mut state = lock.lock().unwrap();
        loop {
            if let Some(task) = state.tasks.pop_front() {
                state.running += 1;
                return Some(task);
            }
            if state.shutdown {
                return None;
            }
            state = condvar.wait(state).unwrap();
        }
    }

    /// The worker's acknowledgement that the task it took is done.
    pub fn task_finished(&self) {
        let (lock, condvar) = &*self.shared;
        let mut state = lock.lock().unwrap();
        state.running -= 1;
        condvar.notify_all();
    }

    /// Take one task without blocking. The caller is responsible for
    /// running it; no running accounting is done.
    pub fn try_take(&self) -> Option<Task> {
        let (lock, _) = &*self.shared;
        lock.lock().unwrap().tasks.pop_front()
    }

    pub fn pending_count(&self) -> usize {
        let (lock, _) = &*self.shared;
        lock.lock().unwrap().tasks.len()
    }

    /// No queued work and nothing mid-run.
    pub fn is_idle(&self) -> bool {
        let (lock, _) = &*self.shared;
        let state = lock.lock().unwrap();
        state.tasks.is_empty() && state.running == 0
    }

    /// Block until the queue is idle. Used at flush and shutdown
    /// barriers.
    pub fn wait_until_idle(&self) {
        let (lock, condvar) = &*self.shared;
        let mut state = lock.lock().unwrap();
        while !(state.tasks.is_empty() && state.running == 0) {
            state = condvar.wait(state).unwrap();
        }
    }

    /// Ask the worker to stop once the current task finishes. Pending
    /// tasks are abandoned.
    pub fn shutdown(&self) {
        let (lock, condvar) = &*self.shared;
        let mut state = lock.lock().unwrap();
        state.shutdown = true;
        state.tasks.clear();
        condvar.notify_all();
    }

    pub fn is_shutdown(&self) -> bool {
        let (lock, _) = &*self.shared;
        lock.lock().unwrap().shutdown
    }
}

impl Default for DeferredTaskQueue {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn refresh_tasks_dedupe_on_drive_and_block() {
        let q = DeferredTaskQueue::new();
        assert!(q.post(Task::RefreshBlock {
            drive: DriveTag::PrimaryFirmware,
            logical_block: 3,
        }));
        assert!(!q.post(Task::RefreshBlock {
            drive: DriveTag::PrimaryFirmware,
            logical_block: 3,
        }));
        assert!(q.post(Task::RefreshBlock {
            drive: DriveTag::PrimaryFirmware,
            logical_block: 4,
        }));
        assert!(q.post(Task::RefreshBlock {
            drive: DriveTag::SecondaryFirmware,
            logical_block: 3,
        }));
        assert_eq!(q.pending_count(), 3);
    }

    #[test]
    fn rewrite_tasks_dedupe_on_drive_only() {
        let q = DeferredTaskQueue::new();
        assert!(q.post(Task::RewriteDrive {
            drive: DriveTag::PrimaryFirmware,
            switch_on_success: true,
        }));
        assert!(!q.post(Task::RewriteDrive {
            drive: DriveTag::PrimaryFirmware,
            switch_on_success: false,
        }));
    }

    #[test]
    fn higher_priority_runs_first() {
        let q = DeferredTaskQueue::new();
        q.post(Task::SavePhyMap);
        q.post(Task::RewriteDrive {
            drive: DriveTag::PrimaryFirmware,
            switch_on_success: true,
        });
        q.post(Task::RefreshBlock {
            drive: DriveTag::Data,
            logical_block: 0,
        });
        assert!(matches!(q.try_take(), Some(Task::RewriteDrive { .. })));
        assert!(matches!(q.try_take(), Some(Task::RefreshBlock { .. })));
        assert!(matches!(q.try_take(), Some(Task::SavePhyMap)));
        assert!(q.try_take().is_none());
    }

    #[test]
    fn shutdown_wakes_waiters_and_rejects_posts() {
        let q = DeferredTaskQueue::new();
        let q2 = q.clone();
        let waiter = std::thread::spawn(move || q2.wait_for_task());
        q.shutdown();
        assert_eq!(waiter.join().unwrap(), None);
        assert!(!q.post(Task::SavePhyMap));
    }
}
