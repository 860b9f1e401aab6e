//! Single-slot tracker for the background import job.
//!
//! One import runs at a time. Starting a new one while another runs cancels
//! the old run's token and takes the slot. Snapshots returned by [`get`]
//! are deep copies; nothing a caller does to one can reach tracker state.
//!
//! [`get`]: ImportTracker::get

use std::sync::Mutex;

use tokio_util::sync::CancellationToken;

use rill_types::{ImportResult, ImportState, ImportTask};

struct Slot {
    task: ImportTask,
    cancel: CancellationToken,
}

#[derive(Default)]
pub struct ImportTracker {
    slot: Mutex<Option<Slot>>,
}

impl ImportTracker {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Begin a new import of `total` feeds. A still-running predecessor is
    /// cancelled. Returns the token the import worker should watch.
    pub fn start(&self, total: u64) -> CancellationToken {
        let mut slot = self.lock();
        if let Some(old) = slot.as_ref()
            && old.task.state == ImportState::Running
        {
            old.cancel.cancel();
            tracing::debug!("superseding a running import");
        }

        let cancel = CancellationToken::new();
        *slot = Some(Slot {
            task: ImportTask::running(total),
            cancel: cancel.clone(),
        });
        cancel
    }

    /// Report progress. A no-op unless an import is running.
    pub fn update(&self, current: u64, feed_name: &str) {
        let mut slot = self.lock();
        if let Some(slot) = slot.as_mut()
            && slot.task.state == ImportState::Running
        {
            slot.task.current = current;
            slot.task.feed_name = Some(feed_name.to_string());
        }
    }

    /// Mark the running import as finished.
    pub fn complete(&self, result: ImportResult) {
        let mut slot = self.lock();
        if let Some(slot) = slot.as_mut()
            && slot.task.state == ImportState::Running
        {
            slot.task.state = ImportState::Done;
            slot.task.feed_name = None;
            slot.task.result = Some(result);
        }
    }

    /// Mark the running import as failed.
    pub fn fail(&self, error: &str) {
        let mut slot = self.lock();
        if let Some(slot) = slot.as_mut()
            && slot.task.state == ImportState::Running
        {
            slot.task.state = ImportState::Error;
            slot.task.feed_name = None;
            slot.task.error = Some(error.to_string());
        }
    }

    /// Cancel the running import. Returns `false` when nothing is running.
    pub fn cancel(&self) -> bool {
        let mut slot = self.lock();
        match slot.as_mut() {
            Some(slot) if slot.task.state == ImportState::Running => {
                slot.cancel.cancel();
                slot.task.state = ImportState::Cancelled;
                slot.task.feed_name = None;
                true
            }
            _ => false,
        }
    }

    /// Snapshot of the slot; `None` when no import has ever started.
    #[must_use]
    pub fn get(&self) -> Option<ImportTask> {
        self.lock().as_ref().map(|slot| slot.task.clone())
    }

    fn lock(&self) -> std::sync::MutexGuard<'_, Option<Slot>> {
        self.slot
            .lock()
            .unwrap_or_else(std::sync::PoisonError::into_inner)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn full_lifecycle() {
        let tracker = ImportTracker::new();
        assert!(tracker.get().is_none());

        tracker.start(3);
        let task = tracker.get().unwrap();
        assert_eq!(task.state, ImportState::Running);
        assert_eq!(task.total, 3);
        assert_eq!(task.current, 0);

        tracker.update(1, "Feed A");
        let task = tracker.get().unwrap();
        assert_eq!(task.current, 1);
        assert_eq!(task.feed_name.as_deref(), Some("Feed A"));

        tracker.complete(ImportResult {
            created: 2,
            skipped: 1,
        });
        let task = tracker.get().unwrap();
        assert_eq!(task.state, ImportState::Done);
        assert_eq!(task.feed_name, None);
        assert_eq!(
            task.result,
            Some(ImportResult {
                created: 2,
                skipped: 1
            })
        );

        // Updates bounce off a finished slot.
        tracker.update(2, "Feed B");
        let task = tracker.get().unwrap();
        assert_eq!(task.current, 1);
        assert_eq!(task.feed_name, None);
    }

    #[test]
    fn get_returns_independent_copies() {
        let tracker = ImportTracker::new();
        tracker.start(1);

        let mut first = tracker.get().unwrap();
        first.current = 99;
        first.feed_name = Some("mutated".to_string());

        let second = tracker.get().unwrap();
        assert_eq!(second.current, 0);
        assert_eq!(second.feed_name, None);
    }

    #[test]
    fn start_over_running_cancels_the_old_token() {
        let tracker = ImportTracker::new();
        let first_token = tracker.start(5);
        assert!(!first_token.is_cancelled());

        let second_token = tracker.start(7);
        assert!(first_token.is_cancelled());
        assert!(!second_token.is_cancelled());
        assert_eq!(tracker.get().unwrap().total, 7);
    }

    #[test]
    fn cancel_only_running_imports() {
        let tracker = ImportTracker::new();
        assert!(!tracker.cancel());

        let token = tracker.start(2);
        assert!(tracker.cancel());
        assert!(token.is_cancelled());
        assert_eq!(tracker.get().unwrap().state, ImportState::Cancelled);

        // Already cancelled: nothing left to cancel.
        assert!(!tracker.cancel());
    }

    #[test]
    fn fail_records_the_error() {
        let tracker = ImportTracker::new();
        tracker.start(2);
        tracker.fail("opml parse error");

        let task = tracker.get().unwrap();
        assert_eq!(task.state, ImportState::Error);
        assert_eq!(task.error.as_deref(), Some("opml parse error"));

        // A failed slot can be restarted.
        tracker.start(4);
        assert_eq!(tracker.get().unwrap().state, ImportState::Running);
    }
}
