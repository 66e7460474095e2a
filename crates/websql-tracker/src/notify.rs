//! Change notifications
//!
//! Database threads report changes through a coalescing queue. The first
//! entry in a cycle posts one `OwnerTask::NotifyDatabasesChanged` to the
//! owner thread; later entries ride along until the owner drains the queue.

use crossbeam_channel::Sender;
use parking_lot::Mutex;

use crate::origin::Origin;

/// Receiver of tracker events. Every method runs on the owner thread.
#[allow(unused_variables)]
pub trait DatabaseTrackerClient: Send + Sync {
    fn did_add_new_origin(&self, origin: &Origin) {}

    fn did_modify_origin(&self, origin: &Origin) {}

    fn did_modify_database(&self, origin: &Origin, name: &str) {}

    fn did_delete_database(&self) {}

    fn did_delete_database_origin(&self) {}

    fn will_begin_first_transaction(&self) {}

    fn did_finish_last_transaction(&self) {}
}

/// Work posted from any thread for the owner thread to run.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum OwnerTask {
    NotifyDatabasesChanged,
    FirstTransactionBegan,
    LastTransactionEnded,
}

#[derive(Default)]
struct QueueState {
    pending: Vec<(Origin, String)>,
    scheduled: bool,
}

pub struct NotificationQueue {
    state: Mutex<QueueState>,
    tasks: Sender<OwnerTask>,
}

impl NotificationQueue {
    pub fn new(tasks: Sender<OwnerTask>) -> Self {
        Self {
            state: Mutex::new(QueueState::default()),
            tasks,
        }
    }

    /// Queue a change; posts a dispatch task only if none is outstanding.
    pub fn schedule(&self, origin: Origin, name: String) {
        let mut state = self.state.lock();
        state.pending.push((origin, name));

        if !state.scheduled {
            if self.tasks.send(OwnerTask::NotifyDatabasesChanged).is_err() {
                tracing::warn!("Owner task channel closed; notifications stay queued");
                return;
            }
            state.scheduled = true;
        }
    }

    /// Empty the queue and re-arm scheduling for the next cycle.
    pub fn take(&self) -> Vec<(Origin, String)> {
        let mut state = self.state.lock();
        state.scheduled = false;
        std::mem::take(&mut state.pending)
    }

    pub fn pending_len(&self) -> usize {
        self.state.lock().pending.len()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn origin() -> Origin {
        Origin::new("https", "example.com", None)
    }

    #[test]
    fn test_schedule_coalesces_into_one_task() {
        let (tx, rx) = crossbeam_channel::unbounded();
        let queue = NotificationQueue::new(tx);

        for i in 0..5 {
            queue.schedule(origin(), format!("db{i}"));
        }

        assert_eq!(rx.try_iter().count(), 1);
        let drained = queue.take();
        assert_eq!(drained.len(), 5);
        assert_eq!(drained[4].1, "db4");
        assert_eq!(queue.pending_len(), 0);
    }

    #[test]
    fn test_take_rearms_scheduling() {
        let (tx, rx) = crossbeam_channel::unbounded();
        let queue = NotificationQueue::new(tx);

        queue.schedule(origin(), "a".to_string());
        queue.take();
        queue.schedule(origin(), "b".to_string());

        assert_eq!(rx.try_iter().count(), 2);
    }

    #[test]
    fn test_closed_channel_keeps_entries() {
        let (tx, rx) = crossbeam_channel::unbounded();
        drop(rx);
        let queue = NotificationQueue::new(tx);

        queue.schedule(origin(), "a".to_string());
        queue.schedule(origin(), "b".to_string());
        assert_eq!(queue.pending_len(), 2);
    }
}
