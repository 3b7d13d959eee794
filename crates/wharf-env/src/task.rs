use std::sync::Mutex;

use tokio::task::JoinHandle;

/// Holds at most one background task. Replacing or dropping the slot aborts
/// the previous task, so sampling loops and console forwarders never leak.
#[derive(Default)]
pub(crate) struct TaskSlot(Mutex<Option<JoinHandle<()>>>);

impl TaskSlot {
    pub(crate) fn replace(&self, task: JoinHandle<()>) {
        if let Some(old) = self.lock().replace(task) {
            old.abort();
        }
    }

    pub(crate) fn cancel(&self) {
        if let Some(old) = self.lock().take() {
            old.abort();
        }
    }

    pub(crate) fn is_active(&self) -> bool {
        self.lock().as_ref().is_some_and(|t| !t.is_finished())
    }

    fn lock(&self) -> std::sync::MutexGuard<'_, Option<JoinHandle<()>>> {
        match self.0.lock() {
            Ok(g) => g,
            Err(poisoned) => poisoned.into_inner(),
        }
    }
}

impl Drop for TaskSlot {
    fn drop(&mut self) {
        self.cancel();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::time::Duration;

    #[tokio::test]
    async fn replacing_aborts_previous_task() {
        let slot = TaskSlot::default();
        let first = tokio::spawn(tokio::time::sleep(Duration::from_secs(30)));
        let abort = first.abort_handle();
        slot.replace(first);
        slot.replace(tokio::spawn(async {}));

        for _ in 0..100 {
            if abort.is_finished() {
                break;
            }
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
        assert!(abort.is_finished());
    }

    #[tokio::test]
    async fn cancel_leaves_slot_inactive() {
        let slot = TaskSlot::default();
        slot.replace(tokio::spawn(tokio::time::sleep(Duration::from_secs(30))));
        assert!(slot.is_active());
        slot.cancel();
        assert!(!slot.is_active());
    }
}
