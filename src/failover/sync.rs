/// Cooperative completion latch shared by racing failover tasks
use parking_lot::Mutex;
use std::time::Duration;
use tokio::sync::Notify;
use tokio::time::Instant;

/// Counts the tasks still racing and lets any of them end the race.
///
/// Cancellation is cooperative: tasks poll `is_completed` between their
/// blocking steps and give up once it returns true.
#[derive(Debug)]
pub struct FailoverSync {
    outstanding: Mutex<i64>,
    notify: Notify,
}

impl FailoverSync {
    pub fn new(num_tasks: i64) -> Self {
        Self {
            outstanding: Mutex::new(num_tasks),
            notify: Notify::new(),
        }
    }

    /// Register one more racing task
    pub fn increment_task(&self) {
        *self.outstanding.lock() += 1;
    }

    /// Report the end of a task.
    ///
    /// With `cancel_other_tasks` the whole race is completed at once,
    /// otherwise only this task is counted off.
    pub fn mark_as_complete(&self, cancel_other_tasks: bool) {
        {
            let mut outstanding = self.outstanding.lock();
            if cancel_other_tasks {
                *outstanding = 0;
            } else {
                *outstanding -= 1;
            }
        }
        self.notify.notify_waiters();
    }

    /// Race decided; remaining tasks should stop
    pub fn is_completed(&self) -> bool {
        *self.outstanding.lock() <= 0
    }

    pub fn outstanding(&self) -> i64 {
        *self.outstanding.lock()
    }

    /// Wait until every task completed or one cancelled the others, at most
    /// `timeout`. The race is completed on return either way.
    pub async fn wait_and_complete(&self, timeout: Duration) {
        let deadline = Instant::now() + timeout;
        loop {
            let notified = self.notify.notified();
            tokio::pin!(notified);
            notified.as_mut().enable();

            if self.is_completed() {
                break;
            }
            if tokio::time::timeout_at(deadline, notified).await.is_err() {
                break;
            }
        }
        self.mark_as_complete(true);
    }
}
